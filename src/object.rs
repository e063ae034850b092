// File: src/object.rs
//
// Heap-resident runtime objects: interned strings, compiled functions,
// native functions, closures and upvalues. Every kind knows how to trace
// its outgoing references for the collector.

use crate::chunk::Chunk;
use crate::heap::{Gc, Marker};
use crate::value::Value;

/// A compiled function. Built once by the compiler and immutable at
/// runtime; owns its bytecode chunk.
pub struct Function {
    pub arity: u8,
    pub upvalue_count: usize,
    pub name: Gc<String>,
    pub chunk: Chunk,
}

impl Function {
    pub fn new(name: Gc<String>) -> Self {
        Self { arity: 0, upvalue_count: 0, name, chunk: Chunk::new() }
    }
}

/// Host function exposed to scripts. Receives the argument count and the
/// argument window of the value stack; must not allocate on the heap.
pub struct NativeFn {
    pub func: fn(arg_count: u8, args: &[Value]) -> Value,
}

/// A function plus the upvalues captured when OP_CLOSURE executed. Each
/// execution of OP_CLOSURE produces a fresh closure, even over the same
/// function.
pub struct Closure {
    pub function: Gc<Function>,
    pub upvalues: Vec<Gc<RuntimeUpvalue>>,
}

impl Closure {
    pub fn new(function: Gc<Function>) -> Self {
        Self { function, upvalues: Vec::new() }
    }
}

/// Mutable indirection over a captured variable. Open while the variable
/// still lives on the VM stack (holding its slot index), closed once the
/// variable's scope exits (owning the value inline). The transition is
/// one-way. Closures sharing a captured variable share one upvalue cell,
/// so writes through one are seen by all.
pub enum RuntimeUpvalue {
    Open(usize),
    Closed(Value),
}

impl RuntimeUpvalue {
    /// Stack slot of an open upvalue. Must not be called after close.
    pub fn stack_index(&self) -> usize {
        match self {
            RuntimeUpvalue::Open(index) => *index,
            RuntimeUpvalue::Closed(_) => panic!("stack_index on a closed upvalue"),
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, RuntimeUpvalue::Open(_))
    }
}

/// Tagged union of everything the heap can hold; one cell per object.
pub enum HeapObject {
    Str(String),
    Function(Function),
    Native(NativeFn),
    Closure(Closure),
    Upvalue(RuntimeUpvalue),
}

impl HeapObject {
    pub fn kind_name(&self) -> &'static str {
        match self {
            HeapObject::Str(_) => "string",
            HeapObject::Function(_) => "function",
            HeapObject::Native(_) => "native fn",
            HeapObject::Closure(_) => "closure",
            HeapObject::Upvalue(_) => "upvalue",
        }
    }

    /// Rough byte footprint used by the collection-threshold policy.
    pub fn heap_size(&self) -> usize {
        let payload = match self {
            HeapObject::Str(text) => text.capacity(),
            HeapObject::Function(function) => {
                function.chunk.code.capacity()
                    + function.chunk.lines.capacity() * std::mem::size_of::<usize>()
                    + function.chunk.constants.capacity() * std::mem::size_of::<Value>()
            }
            HeapObject::Native(_) => 0,
            HeapObject::Closure(closure) => {
                closure.upvalues.capacity() * std::mem::size_of::<Gc<RuntimeUpvalue>>()
            }
            HeapObject::Upvalue(_) => 0,
        };
        std::mem::size_of::<HeapObject>() + payload
    }

    /// Marks every heap object this one references. Interned strings and
    /// native functions are leaves. A function reaches its name and the
    /// heap variants among its chunk's constants. A closure reaches its
    /// function and each shared upvalue cell; a closed upvalue reaches the
    /// value it owns (an open one aliases a stack slot, which the VM's
    /// root pass already covers).
    pub fn trace(&self, marker: &mut Marker) {
        match self {
            HeapObject::Str(_) | HeapObject::Native(_) => {}
            HeapObject::Function(function) => {
                marker.mark(function.name);
                for constant in &function.chunk.constants {
                    marker.mark_value(*constant);
                }
            }
            HeapObject::Closure(closure) => {
                marker.mark(closure.function);
                for upvalue in &closure.upvalues {
                    marker.mark(*upvalue);
                }
            }
            HeapObject::Upvalue(upvalue) => {
                if let RuntimeUpvalue::Closed(value) = upvalue {
                    marker.mark_value(*value);
                }
            }
        }
    }
}

/// Implemented by every type that can live in a heap cell; bridges the
/// typed `Gc<T>` handle surface and the tagged `HeapObject` storage.
pub trait HeapKind: Sized {
    fn into_object(self) -> HeapObject;
    fn from_object(object: &HeapObject) -> Option<&Self>;
    fn from_object_mut(object: &mut HeapObject) -> Option<&mut Self>;
}

macro_rules! impl_heap_kind {
    ($type:ty, $variant:ident) => {
        impl HeapKind for $type {
            fn into_object(self) -> HeapObject {
                HeapObject::$variant(self)
            }

            fn from_object(object: &HeapObject) -> Option<&Self> {
                match object {
                    HeapObject::$variant(inner) => Some(inner),
                    _ => None,
                }
            }

            fn from_object_mut(object: &mut HeapObject) -> Option<&mut Self> {
                match object {
                    HeapObject::$variant(inner) => Some(inner),
                    _ => None,
                }
            }
        }
    };
}

impl_heap_kind!(String, Str);
impl_heap_kind!(Function, Function);
impl_heap_kind!(NativeFn, Native);
impl_heap_kind!(Closure, Closure);
impl_heap_kind!(RuntimeUpvalue, Upvalue);
