// File: src/strings.rs
//
// String interning. Every string the language touches goes through the
// pool, so equal contents always share one heap cell and value equality
// on strings reduces to handle comparison.

use ahash::AHashMap;

use crate::heap::{Gc, Heap};

/// Content-to-handle cache over heap-allocated strings. The cache is weak:
/// it keeps no string alive. The heap calls `purge` for every string it
/// sweeps, so a lookup can never return a handle to a freed cell;
/// re-interning after a collection simply allocates a fresh cell.
#[derive(Default)]
pub struct StringPool {
    by_content: AHashMap<String, Gc<String>>,
}

impl StringPool {
    pub fn new() -> Self {
        Self { by_content: AHashMap::new() }
    }

    /// Returns the existing handle for `text`, or allocates the string on
    /// the heap and caches it.
    pub fn insert_or_get(&mut self, heap: &mut Heap, text: &str) -> Gc<String> {
        if let Some(handle) = self.by_content.get(text) {
            return *handle;
        }
        let handle = heap.alloc(text.to_string());
        self.by_content.insert(text.to_string(), handle);
        handle
    }

    /// Drops the cache entry for a string the heap just swept. The slot
    /// index guards against removing an entry that points at a different,
    /// still-live cell with equal content (possible when a string was
    /// allocated around the pool).
    pub(crate) fn purge(&mut self, text: &str, slot: usize) {
        if let Some(existing) = self.by_content.get(text) {
            if *existing == Gc::from_raw(slot) {
                self.by_content.remove(text);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.by_content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_content.is_empty()
    }
}
