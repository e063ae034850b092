// File: src/heap.rs
//
// Garbage-collected heap for Loxide runtime objects. Non-moving, precise
// mark-and-sweep over a slot vector: handles are stable slot indices, freed
// slots are recycled through a free list. The owner of each root set (the
// compiler while compiling, the VM while running) drives collection by
// passing a root-marking pass to `collect`; tracing drains a grey worklist
// and sweeping drops every unmarked cell, notifying the string pool so its
// interning cache never dangles.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use crate::object::{HeapKind, HeapObject};
use crate::strings::StringPool;
use crate::value::Value;

/// Typed, non-owning handle into the heap. Copying a handle copies the
/// slot index, never the object; equality and hashing follow the slot, so
/// two handles are equal exactly when they name the same heap cell.
pub struct Gc<T> {
    index: usize,
    _kind: PhantomData<fn() -> T>,
}

impl<T> Gc<T> {
    pub(crate) fn from_raw(index: usize) -> Self {
        Self { index, _kind: PhantomData }
    }
}

impl<T> Clone for Gc<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Gc<T> {}

impl<T> PartialEq for Gc<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl<T> Eq for Gc<T> {}

impl<T> Hash for Gc<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
    }
}

impl<T> fmt::Debug for Gc<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Gc({})", self.index)
    }
}

struct Cell {
    marked: bool,
    object: HeapObject,
}

/// Live-cell ceiling before a forced collection in stress mode. Kept tiny
/// so stress runs collect on nearly every allocation.
const STRESS_LIVE_CELLS: usize = 4;

/// First byte threshold for the production collection policy; doubles
/// after every collection.
const FIRST_GC_BYTES: usize = 1024 * 1024;

pub struct Heap {
    cells: Vec<Option<Cell>>,
    free: Vec<usize>,
    gray: Vec<usize>,
    bytes_allocated: usize,
    next_gc: usize,
    stress: bool,
    log_gc: bool,
}

impl Heap {
    pub fn new() -> Self {
        Self {
            cells: Vec::new(),
            free: Vec::new(),
            gray: Vec::new(),
            bytes_allocated: 0,
            next_gc: FIRST_GC_BYTES,
            stress: false,
            log_gc: false,
        }
    }

    /// Force a collection whenever more than a handful of cells are live.
    /// Observable behavior of any program must not change under stress.
    pub fn set_stress(&mut self, stress: bool) {
        self.stress = stress;
    }

    pub fn set_log(&mut self, log: bool) {
        self.log_gc = log;
    }

    /// Number of live cells.
    pub fn len(&self) -> usize {
        self.cells.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn alloc<T: HeapKind>(&mut self, object: T) -> Gc<T> {
        let object = object.into_object();
        self.bytes_allocated += object.heap_size();
        let cell = Cell { marked: false, object };
        let index = match self.free.pop() {
            Some(index) => {
                self.cells[index] = Some(cell);
                index
            }
            None => {
                self.cells.push(Some(cell));
                self.cells.len() - 1
            }
        };
        if self.log_gc {
            eprintln!(
                "[gc] {:4} allocated ({})",
                index,
                self.cells[index].as_ref().map(|c| c.object.kind_name()).unwrap_or("?"),
            );
        }
        Gc::from_raw(index)
    }

    pub fn get<T: HeapKind>(&self, handle: Gc<T>) -> &T {
        let cell = self.cells[handle.index]
            .as_ref()
            .expect("heap handle refers to a freed cell");
        T::from_object(&cell.object).expect("heap handle kind mismatch")
    }

    pub fn get_mut<T: HeapKind>(&mut self, handle: Gc<T>) -> &mut T {
        let cell = self.cells[handle.index]
            .as_mut()
            .expect("heap handle refers to a freed cell");
        T::from_object_mut(&mut cell.object).expect("heap handle kind mismatch")
    }

    /// True when the current policy calls for a collection before the next
    /// allocation. Callers collect at points where everything that must
    /// survive is reachable from their roots.
    pub fn should_collect(&self) -> bool {
        if self.stress {
            self.cells.len() - self.free.len() > STRESS_LIVE_CELLS
        } else {
            self.bytes_allocated > self.next_gc
        }
    }

    /// Runs a full mark-trace-sweep cycle. `mark_roots` is the root pass of
    /// whichever component owns the heap at this point in the pipeline; it
    /// performs the first wave of marking, after which tracing drains the
    /// grey worklist through each object's outgoing references. Swept
    /// interned strings are removed from `pool` so its cache cannot return
    /// a dangling handle.
    pub fn collect(&mut self, pool: &mut StringPool, mark_roots: impl FnOnce(&mut Marker)) {
        if self.log_gc {
            eprintln!("[gc] === collection begin ({} bytes) ===", self.bytes_allocated);
        }
        debug_assert!(self.gray.is_empty());

        {
            let mut marker = Marker { cells: &mut self.cells, gray: &mut self.gray };
            mark_roots(&mut marker);
        }

        // Trace: pull an object off the worklist and mark everything it
        // references. The cell is taken out of its slot while its trace
        // routine runs; its own mark bit is already set so nothing can
        // re-queue it.
        while let Some(index) = self.gray.pop() {
            let cell = self.cells[index].take().expect("grey worklist entry already freed");
            {
                let mut marker = Marker { cells: &mut self.cells, gray: &mut self.gray };
                cell.object.trace(&mut marker);
            }
            self.cells[index] = Some(cell);
        }

        // Sweep: retain marked cells (resetting the at-rest invariant that
        // no cell is marked), free the rest.
        let mut freed = 0usize;
        for (index, slot) in self.cells.iter_mut().enumerate() {
            match slot {
                Some(cell) if cell.marked => cell.marked = false,
                Some(cell) => {
                    self.bytes_allocated =
                        self.bytes_allocated.saturating_sub(cell.object.heap_size());
                    if let HeapObject::Str(text) = &cell.object {
                        pool.purge(text, index);
                    }
                    if self.log_gc {
                        eprintln!("[gc] {:4} freed ({})", index, cell.object.kind_name());
                    }
                    *slot = None;
                    self.free.push(index);
                    freed += 1;
                }
                None => {}
            }
        }

        self.next_gc = (self.bytes_allocated * 2).max(FIRST_GC_BYTES);
        if self.log_gc {
            eprintln!(
                "[gc] ==/ collection end: freed {}, {} bytes live, next at {} /==",
                freed, self.bytes_allocated, self.next_gc
            );
        }
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

/// Marking surface handed to root passes and trace routines. Marking an
/// already-marked (or already-grey) cell is a no-op, so shared structures
/// are visited once per collection.
pub struct Marker<'h> {
    cells: &'h mut Vec<Option<Cell>>,
    gray: &'h mut Vec<usize>,
}

impl Marker<'_> {
    pub fn mark<T: HeapKind>(&mut self, handle: Gc<T>) {
        self.mark_raw(handle.index);
    }

    /// Marks the heap cell behind `value`, if it has one.
    pub fn mark_value(&mut self, value: Value) {
        match value {
            Value::Str(handle) => self.mark(handle),
            Value::Function(handle) => self.mark(handle),
            Value::Native(handle) => self.mark(handle),
            Value::Closure(handle) => self.mark(handle),
            Value::Number(_) | Value::Bool(_) | Value::Nil => {}
        }
    }

    pub(crate) fn mark_raw(&mut self, index: usize) {
        let cell = match self.cells[index].as_mut() {
            Some(cell) => cell,
            // The cell is mid-trace (taken out of its slot); it is already
            // marked, so there is nothing to do.
            None => return,
        };
        if cell.marked {
            return;
        }
        cell.marked = true;
        self.gray.push(index);
    }
}
