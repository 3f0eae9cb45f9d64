//! Heap object variants
//!
//! Every value with identity is one of these variants, stored in the
//! [`Heap`](crate::heap::Heap) arena and addressed by an [`ObjRef`]
//! handle. The arena slot index is the object's identity.

use std::rc::Rc;

use crate::bytecode::Chunk;
use crate::table::Table;
use crate::value::Value;
use crate::vm::Vm;

/// Handle to a heap object (an index into the heap's slot arena)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjRef(pub(crate) u32);

impl ObjRef {
    /// Arena slot index
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// A heap-allocated object
#[derive(Debug)]
pub enum Obj {
    /// Immutable interned string
    String(ObjString),
    /// Compiled code unit
    Function(ObjFunction),
    /// Built-in function
    Native(ObjNative),
    /// Runtime callable: a function plus its captured variables
    Closure(ObjClosure),
    /// A captured variable, open (stack slot) or closed (own cell)
    Upvalue(ObjUpvalue),
    /// Class object
    Class(ObjClass),
    /// Class instance
    Instance(ObjInstance),
    /// A method with its receiver baked in
    BoundMethod(ObjBoundMethod),
    /// User list
    List(ObjList),
}

/// Interned string with its precomputed FNV-1a hash
#[derive(Debug)]
pub struct ObjString {
    pub chars: String,
    pub hash: u32,
}

/// A compiled function body
///
/// The chunk is behind an `Rc` so call frames can hold it without
/// re-borrowing the heap on every instruction fetch; chunks are
/// immutable once compilation finishes.
#[derive(Debug)]
pub struct ObjFunction {
    pub arity: u8,
    pub upvalue_count: u8,
    pub chunk: Rc<Chunk>,
    /// `None` for the top-level script
    pub name: Option<ObjRef>,
}

/// Signature of a native built-in
///
/// Natives receive the VM (for heap access) and a copy of their argument
/// window. An `Err` becomes an ordinary runtime error with a stack trace.
pub type NativeFn = fn(&mut Vm, &[Value]) -> Result<Value, String>;

/// A built-in function
pub struct ObjNative {
    pub name: &'static str,
    pub function: NativeFn,
}

impl std::fmt::Debug for ObjNative {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjNative").field("name", &self.name).finish()
    }
}

/// A function paired with its upvalue array
#[derive(Debug)]
pub struct ObjClosure {
    pub function: ObjRef,
    /// Filled in immediately after allocation, while the closure sits on
    /// the value stack; length never exceeds the function's upvalue count
    pub upvalues: Vec<ObjRef>,
}

/// Where a captured variable currently lives
#[derive(Debug, Clone, Copy)]
pub enum UpvalueSlot {
    /// Open: aliases a live value-stack slot
    Stack(usize),
    /// Closed: hoisted into the upvalue's own cell
    Closed(Value),
}

/// A captured variable
#[derive(Debug)]
pub struct ObjUpvalue {
    pub location: UpvalueSlot,
}

/// A class and its method table
#[derive(Debug)]
pub struct ObjClass {
    pub name: ObjRef,
    pub methods: Table,
}

/// An instance and its field table
#[derive(Debug)]
pub struct ObjInstance {
    pub class: ObjRef,
    pub fields: Table,
}

/// Result of `instance.method`: the receiver captured with the method
#[derive(Debug)]
pub struct ObjBoundMethod {
    pub receiver: Value,
    pub method: ObjRef,
}

/// A mutable list of values
#[derive(Debug)]
pub struct ObjList {
    pub items: Vec<Value>,
}
