// Heap and string pool tests: interning identity, reachability through
// each object kind's trace routine, sweep behavior and the weak pool
// cache.

use loxide::heap::Heap;
use loxide::object::{Closure, Function, RuntimeUpvalue};
use loxide::strings::StringPool;
use loxide::value::Value;

#[test]
fn interning_shares_one_handle_per_content() {
    let mut heap = Heap::new();
    let mut pool = StringPool::new();
    let first = pool.insert_or_get(&mut heap, "foobar");
    let second = pool.insert_or_get(&mut heap, "foobar");
    assert_eq!(first, second);
    assert_eq!(heap.get(first), "foobar");
    assert_eq!(heap.len(), 1);
}

#[test]
fn interning_distinguishes_content() {
    let mut heap = Heap::new();
    let mut pool = StringPool::new();
    let a = pool.insert_or_get(&mut heap, "a");
    let b = pool.insert_or_get(&mut heap, "b");
    assert_ne!(a, b);
    assert_eq!(heap.len(), 2);
}

#[test]
fn handles_are_copyable_and_compare_by_identity() {
    let mut heap = Heap::new();
    let handle = heap.alloc("text".to_string());
    let copy = handle;
    assert_eq!(handle, copy);
    assert_eq!(heap.get(copy), "text");
}

#[test]
fn collect_without_roots_frees_everything_and_purges_the_pool() {
    let mut heap = Heap::new();
    let mut pool = StringPool::new();
    pool.insert_or_get(&mut heap, "one");
    pool.insert_or_get(&mut heap, "two");
    assert_eq!(heap.len(), 2);
    assert_eq!(pool.len(), 2);

    heap.collect(&mut pool, |_marker| {});
    assert_eq!(heap.len(), 0);
    assert_eq!(pool.len(), 0);

    // Re-interning after the sweep allocates a fresh cell.
    let again = pool.insert_or_get(&mut heap, "one");
    assert_eq!(heap.get(again), "one");
    assert_eq!(heap.len(), 1);
}

#[test]
fn collect_keeps_rooted_cells_and_resets_marks() {
    let mut heap = Heap::new();
    let mut pool = StringPool::new();
    let kept = pool.insert_or_get(&mut heap, "kept");
    pool.insert_or_get(&mut heap, "dropped");

    heap.collect(&mut pool, |marker| marker.mark(kept));
    assert_eq!(heap.len(), 1);
    assert_eq!(heap.get(kept), "kept");

    // Marks were cleared on sweep; a second collection with the same root
    // behaves identically.
    heap.collect(&mut pool, |marker| marker.mark(kept));
    assert_eq!(heap.len(), 1);
    assert_eq!(heap.get(kept), "kept");
}

#[test]
fn function_trace_reaches_name_and_heap_constants() {
    let mut heap = Heap::new();
    let mut pool = StringPool::new();
    let name = pool.insert_or_get(&mut heap, "f");
    let constant = pool.insert_or_get(&mut heap, "payload");
    let mut function = Function::new(name);
    function.chunk.add_constant(Value::Str(constant));
    function.chunk.add_constant(Value::Number(1.0));
    let function = heap.alloc(function);

    heap.collect(&mut pool, |marker| marker.mark(function));
    // Function, its name and its string constant all survive.
    assert_eq!(heap.len(), 3);
    assert_eq!(heap.get(heap.get(function).name), "f");
}

#[test]
fn closure_trace_reaches_function_upvalue_cells_and_closed_values() {
    let mut heap = Heap::new();
    let mut pool = StringPool::new();
    let name = pool.insert_or_get(&mut heap, "f");
    let function = heap.alloc(Function::new(name));
    let captured = pool.insert_or_get(&mut heap, "captured");
    let upvalue = heap.alloc(RuntimeUpvalue::Closed(Value::Str(captured)));
    let mut closure = Closure::new(function);
    closure.upvalues.push(upvalue);
    let closure = heap.alloc(closure);

    heap.collect(&mut pool, |marker| marker.mark(closure));
    // Closure, function, name, upvalue cell, captured string.
    assert_eq!(heap.len(), 5);
    match heap.get(upvalue) {
        RuntimeUpvalue::Closed(Value::Str(handle)) => {
            assert_eq!(heap.get(*handle), "captured");
        }
        _ => panic!("upvalue should still be closed over the string"),
    }
}

#[test]
fn open_upvalue_does_not_own_its_stack_value() {
    let mut heap = Heap::new();
    let mut pool = StringPool::new();
    pool.insert_or_get(&mut heap, "stack resident");
    let upvalue = heap.alloc(RuntimeUpvalue::Open(0));

    // Only the upvalue is rooted; the aliased value is the stack's to
    // keep alive, and nothing roots the stack here.
    heap.collect(&mut pool, |marker| marker.mark(upvalue));
    assert_eq!(heap.len(), 1);
    assert!(heap.get(upvalue).is_open());
    assert_eq!(heap.get(upvalue).stack_index(), 0);
}

#[test]
fn shared_marking_visits_cells_once() {
    let mut heap = Heap::new();
    let mut pool = StringPool::new();
    let name = pool.insert_or_get(&mut heap, "shared");
    let function = heap.alloc(Function::new(name));
    let first = heap.alloc(Closure::new(function));
    let second = heap.alloc(Closure::new(function));

    // Both closures reach the same function; marking is idempotent.
    heap.collect(&mut pool, |marker| {
        marker.mark(first);
        marker.mark(second);
    });
    assert_eq!(heap.len(), 4);
}

#[test]
fn freed_slots_are_recycled() {
    let mut heap = Heap::new();
    let mut pool = StringPool::new();
    for round in 0..8 {
        heap.alloc(format!("transient {}", round));
        heap.collect(&mut pool, |_marker| {});
        assert_eq!(heap.len(), 0);
    }
    let survivor = heap.alloc("survivor".to_string());
    assert_eq!(heap.len(), 1);
    assert_eq!(heap.get(survivor), "survivor");
}
