//! Stack-based virtual machine
//!
//! Executes bytecode with a value stack and call frames.
//! - Calls resolve through closures, natives, classes, and bound methods
//! - Variables live in stack slots (locals), upvalue cells (captures),
//!   or the globals table (late-bound)
//! - Runtime errors carry a stack trace, reset the machine, and unwind
//!   the whole frame stack at once

mod frame;

pub use frame::CallFrame;

use std::fmt;
use std::io::Write;
use std::rc::Rc;
use std::time::Instant;

use thiserror::Error;

use crate::bytecode::Opcode;
use crate::compiler;
use crate::diagnostic::Diagnostic;
use crate::heap::{Heap, Trace};
use crate::object::{
    NativeFn, Obj, ObjBoundMethod, ObjClosure, ObjInstance, ObjList, ObjNative, ObjRef,
    ObjUpvalue, UpvalueSlot,
};
use crate::stdlib;
use crate::table::Table;
use crate::value::Value;

/// Deepest allowed call nesting
pub const FRAMES_MAX: usize = 64;
/// Value stack slots reserved up front (256 per frame)
pub const STACK_MAX: usize = FRAMES_MAX * 256;

/// Why a program failed to run
#[derive(Debug, Error)]
pub enum InterpretError {
    /// The source did not compile
    #[error("compile error")]
    Compile(Vec<Diagnostic>),
    /// The program failed at runtime
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// A runtime failure: what went wrong plus one trace line per frame,
/// newest first
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeError {
    pub kind: RuntimeErrorKind,
    pub trace: Vec<TraceFrame>,
}

/// One line of a runtime stack trace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFrame {
    pub line: u32,
    /// `None` for the top-level script
    pub function: Option<String>,
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        for frame in &self.trace {
            match &frame.function {
                Some(name) => write!(f, "\n[line {}] in {}()", frame.line, name)?,
                None => write!(f, "\n[line {}] in script", frame.line)?,
            }
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}

/// Every way a program can fail at runtime
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuntimeErrorKind {
    #[error("Operands must be numbers.")]
    OperandsMustBeNumbers,
    #[error("Operand must be a number.")]
    OperandMustBeNumber,
    #[error("Operands must be two numbers or two strings.")]
    BadAddOperands,
    #[error("Undefined variable '{0}'.")]
    UndefinedVariable(String),
    #[error("Undefined property '{0}'.")]
    UndefinedProperty(String),
    #[error("Only instances have properties.")]
    PropertyOnNonInstance,
    #[error("Only instances have fields.")]
    FieldOnNonInstance,
    #[error("Only instances have methods.")]
    MethodOnNonInstance,
    #[error("Superclass must be a class.")]
    SuperclassMustBeClass,
    #[error("Can only call functions and classes.")]
    NotCallable,
    #[error("Expected {expected} arguments but got {got}.")]
    ArityMismatch { expected: u8, got: u8 },
    #[error("Stack overflow.")]
    StackOverflow,
    #[error("Invalid list to index into.")]
    IndexNonList,
    #[error("List index is not a number.")]
    IndexNotNumber,
    #[error("List index out of range")]
    IndexOutOfRange,
    #[error("Cannot store value in non-list.")]
    StoreNonList,
    #[error("Invalid list index.")]
    StoreIndexOutOfRange,
    /// A native built-in reported failure
    #[error("{0}")]
    Native(String),
    /// The instruction stream is not valid (corrupt bytecode file)
    #[error("Unknown opcode {0:#04x}.")]
    UnknownOpcode(u8),
    #[error("Instruction stream ended unexpectedly.")]
    TruncatedInstruction,
}

/// Virtual machine state
pub struct Vm {
    /// Object arena and collector
    pub(crate) heap: Heap,
    /// Value stack
    stack: Vec<Value>,
    /// Call frames
    frames: Vec<CallFrame>,
    /// Global variables
    globals: Table,
    /// Open upvalues, ordered by descending stack slot
    open_upvalues: Vec<ObjRef>,
    /// Interned `"init"`, for constructor dispatch
    init_string: ObjRef,
    /// Basis for the `clock` native
    start_time: Instant,
    /// Sink for `print` output (swappable for tests and embedders)
    output: Box<dyn Write>,
}

impl Vm {
    /// Create a VM with the native built-ins installed
    pub fn new() -> Self {
        let mut heap = Heap::new();
        let init_string = heap.intern("init");
        let mut vm = Self {
            heap,
            stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::with_capacity(FRAMES_MAX),
            globals: Table::new(),
            open_upvalues: Vec::new(),
            init_string,
            start_time: Instant::now(),
            output: Box::new(std::io::stdout()),
        };
        stdlib::install(&mut vm);
        vm
    }

    /// Redirect `print` output
    pub fn set_output(&mut self, output: Box<dyn Write>) {
        self.output = output;
    }

    /// Collect at every allocation point (for GC soundness testing)
    pub fn set_gc_stress(&mut self, stress: bool) {
        self.heap.set_stress(stress);
    }

    /// Borrow the heap (tests and the disassembler need read access)
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Seconds since the VM was created
    pub(crate) fn elapsed_seconds(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }

    /// Compile and run a source string
    pub fn interpret(&mut self, source: &str) -> Result<(), InterpretError> {
        let function = compiler::compile(self, source).map_err(InterpretError::Compile)?;
        self.run_function(function)?;
        Ok(())
    }

    /// Load a serialized program (`.bstc` bytes) into this VM.
    ///
    /// Run the returned function with [`run_function`](Self::run_function).
    pub fn load_program(&mut self, bytes: &[u8]) -> Result<ObjRef, crate::bytecode::DecodeError> {
        crate::bytecode::decode_program(&mut self.heap, bytes)
    }

    /// Run an already-compiled top-level function (from the compiler or
    /// the bytecode loader)
    pub fn run_function(&mut self, function: ObjRef) -> Result<(), RuntimeError> {
        self.push(Value::Obj(function));
        let closure = self.alloc(Obj::Closure(ObjClosure {
            function,
            upvalues: Vec::new(),
        }));
        self.pop();
        self.push(Value::Obj(closure));
        self.call_closure(closure, 0)?;
        self.run()
    }

    // === Stack primitives ===

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("value stack underflow")
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    fn reset_stack(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
    }

    // === Instruction decoding ===

    fn frame(&self) -> &CallFrame {
        self.frames.last().expect("no active call frame")
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("no active call frame")
    }

    fn read_byte(&mut self) -> u8 {
        let frame = self.frame_mut();
        let byte = frame.chunk.code[frame.ip];
        frame.ip += 1;
        byte
    }

    fn read_short(&mut self) -> u16 {
        let high = self.read_byte() as u16;
        let low = self.read_byte() as u16;
        (high << 8) | low
    }

    fn read_constant(&mut self) -> Value {
        let index = self.read_byte() as usize;
        self.frame().chunk.constants[index]
    }

    /// Read a constant that the compiler guarantees is a string
    fn read_string_ref(&mut self) -> ObjRef {
        match self.read_constant() {
            Value::Obj(r) => r,
            _ => unreachable!("name operand is not a string constant"),
        }
    }

    // === Error construction ===

    /// Build a runtime error with a stack trace, then reset the machine
    fn error(&mut self, kind: RuntimeErrorKind) -> RuntimeError {
        let trace = self
            .frames
            .iter()
            .rev()
            .map(|frame| {
                let closure = self.heap.closure(frame.closure);
                let function = self.heap.function(closure.function);
                TraceFrame {
                    line: frame.chunk.line_at(frame.ip.saturating_sub(1)),
                    function: function.name.map(|n| self.heap.string(n).chars.clone()),
                }
            })
            .collect();
        self.reset_stack();
        RuntimeError { kind, trace }
    }

    // === Allocation and collection ===

    /// Allocate through the collector: collect first when the heap asks
    /// for it, so the newborn object cannot be swept. Anything the
    /// caller needs alive must already be reachable from a root.
    pub(crate) fn alloc(&mut self, obj: Obj) -> ObjRef {
        if self.heap.should_collect() {
            self.collect(None);
        }
        self.heap.alloc(obj)
    }

    /// Intern through the collector; same discipline as [`alloc`](Self::alloc)
    pub(crate) fn intern(&mut self, chars: &str) -> ObjRef {
        if self.heap.should_collect() {
            self.collect(None);
        }
        self.heap.intern(chars)
    }

    /// Run a full mark-sweep collection. `extra` supplies roots outside
    /// the VM (the compiler chain during compilation).
    pub(crate) fn collect(&mut self, extra: Option<&dyn Trace>) {
        let Vm {
            heap,
            stack,
            frames,
            globals,
            open_upvalues,
            init_string,
            ..
        } = self;

        for &value in stack.iter() {
            heap.mark_value(value);
        }
        for frame in frames.iter() {
            heap.mark_object(frame.closure);
        }
        heap.mark_table(globals);
        for &upvalue in open_upvalues.iter() {
            heap.mark_object(upvalue);
        }
        heap.mark_object(*init_string);
        if let Some(roots) = extra {
            roots.trace(heap);
        }

        heap.trace_references();
        heap.sweep_strings();
        heap.sweep();
    }

    /// Install a native built-in under `name`
    pub(crate) fn define_native(&mut self, name: &'static str, function: NativeFn) {
        // Both the name and the native ride the stack across the second
        // allocation, which may collect
        let name_ref = self.intern(name);
        self.push(Value::Obj(name_ref));
        let native = self.alloc(Obj::Native(ObjNative { name, function }));
        self.push(Value::Obj(native));
        let key = self.heap.str_key(name_ref);
        self.globals.set(key, Value::Obj(native));
        self.pop();
        self.pop();
    }

    // === Calls ===

    fn call_value(&mut self, callee: Value, argc: u8) -> Result<(), RuntimeError> {
        if let Value::Obj(r) = callee {
            match self.heap.get(r) {
                Obj::Closure(_) => return self.call_closure(r, argc),
                Obj::Native(_) => return self.call_native(r, argc),
                Obj::Class(_) => return self.call_class(r, argc),
                Obj::BoundMethod(bound) => {
                    let receiver = bound.receiver;
                    let method = bound.method;
                    let slot = self.stack.len() - argc as usize - 1;
                    self.stack[slot] = receiver;
                    return self.call_closure(method, argc);
                }
                _ => {}
            }
        }
        Err(self.error(RuntimeErrorKind::NotCallable))
    }

    fn call_closure(&mut self, closure: ObjRef, argc: u8) -> Result<(), RuntimeError> {
        let function = self.heap.closure(closure).function;
        let (arity, chunk) = {
            let f = self.heap.function(function);
            (f.arity, Rc::clone(&f.chunk))
        };
        if argc != arity {
            return Err(self.error(RuntimeErrorKind::ArityMismatch {
                expected: arity,
                got: argc,
            }));
        }
        if self.frames.len() == FRAMES_MAX {
            return Err(self.error(RuntimeErrorKind::StackOverflow));
        }
        self.frames.push(CallFrame {
            closure,
            chunk,
            ip: 0,
            base: self.stack.len() - argc as usize - 1,
        });
        Ok(())
    }

    fn call_native(&mut self, native: ObjRef, argc: u8) -> Result<(), RuntimeError> {
        let function = match self.heap.get(native) {
            Obj::Native(n) => n.function,
            _ => unreachable!("call_native on non-native object"),
        };
        let arg_start = self.stack.len() - argc as usize;
        let args: Vec<Value> = self.stack[arg_start..].to_vec();
        match function(self, &args) {
            Ok(result) => {
                self.stack.truncate(arg_start - 1);
                self.push(result);
                Ok(())
            }
            Err(message) => Err(self.error(RuntimeErrorKind::Native(message))),
        }
    }

    /// Calling a class constructs an instance, running `init` if the
    /// class has one
    fn call_class(&mut self, class: ObjRef, argc: u8) -> Result<(), RuntimeError> {
        // The class itself still occupies the callee slot, keeping it
        // reachable across this allocation
        let instance = self.alloc(Obj::Instance(ObjInstance {
            class,
            fields: Table::new(),
        }));
        let slot = self.stack.len() - argc as usize - 1;
        self.stack[slot] = Value::Obj(instance);

        let init_key = self.heap.str_key(self.init_string);
        match self.heap.class(class).methods.get(init_key) {
            Some(Value::Obj(init)) => self.call_closure(init, argc),
            Some(_) => unreachable!("method table holds a non-closure"),
            None if argc != 0 => Err(self.error(RuntimeErrorKind::ArityMismatch {
                expected: 0,
                got: argc,
            })),
            None => Ok(()),
        }
    }

    /// `receiver.name(args)` without materializing a bound method.
    /// Fields shadow methods, so a field holding a callable is called
    /// through the general path.
    fn invoke(&mut self, name: ObjRef, argc: u8) -> Result<(), RuntimeError> {
        let receiver = self.peek(argc as usize);
        let Value::Obj(r) = receiver else {
            return Err(self.error(RuntimeErrorKind::MethodOnNonInstance));
        };
        let class = match self.heap.get(r) {
            Obj::Instance(instance) => instance.class,
            _ => return Err(self.error(RuntimeErrorKind::MethodOnNonInstance)),
        };

        let key = self.heap.str_key(name);
        if let Some(field) = self.heap.instance(r).fields.get(key) {
            let slot = self.stack.len() - argc as usize - 1;
            self.stack[slot] = field;
            return self.call_value(field, argc);
        }
        self.invoke_from_class(class, name, argc)
    }

    fn invoke_from_class(
        &mut self,
        class: ObjRef,
        name: ObjRef,
        argc: u8,
    ) -> Result<(), RuntimeError> {
        let key = self.heap.str_key(name);
        match self.heap.class(class).methods.get(key) {
            Some(Value::Obj(method)) => self.call_closure(method, argc),
            Some(_) => unreachable!("method table holds a non-closure"),
            None => {
                let name = self.heap.string(name).chars.clone();
                Err(self.error(RuntimeErrorKind::UndefinedProperty(name)))
            }
        }
    }

    /// Replace the receiver on top of the stack with `receiver.name`
    /// bound from the class's method table
    fn bind_method(&mut self, class: ObjRef, name: ObjRef) -> Result<(), RuntimeError> {
        let key = self.heap.str_key(name);
        let Some(Value::Obj(method)) = self.heap.class(class).methods.get(key) else {
            let name = self.heap.string(name).chars.clone();
            return Err(self.error(RuntimeErrorKind::UndefinedProperty(name)));
        };
        let bound = self.alloc(Obj::BoundMethod(ObjBoundMethod {
            receiver: self.peek(0),
            method,
        }));
        self.pop();
        self.push(Value::Obj(bound));
        Ok(())
    }

    // === Upvalues ===

    /// Find or create the upvalue aliasing `slot`. The open list is
    /// ordered by descending slot so shared captures are found in one
    /// forward scan.
    fn capture_upvalue(&mut self, slot: usize) -> ObjRef {
        let mut insert_at = self.open_upvalues.len();
        for (position, &upvalue) in self.open_upvalues.iter().enumerate() {
            let UpvalueSlot::Stack(open_slot) = self.heap.upvalue(upvalue).location else {
                unreachable!("closed upvalue on the open list");
            };
            if open_slot == slot {
                return upvalue;
            }
            if open_slot < slot {
                insert_at = position;
                break;
            }
        }

        let created = self.alloc(Obj::Upvalue(ObjUpvalue {
            location: UpvalueSlot::Stack(slot),
        }));
        self.open_upvalues.insert(insert_at, created);
        created
    }

    /// Close every open upvalue at `from_slot` or above: copy the stack
    /// value into the upvalue's own cell and retarget it
    fn close_upvalues(&mut self, from_slot: usize) {
        while let Some(&upvalue) = self.open_upvalues.first() {
            let UpvalueSlot::Stack(slot) = self.heap.upvalue(upvalue).location else {
                unreachable!("closed upvalue on the open list");
            };
            if slot < from_slot {
                break;
            }
            let value = self.stack[slot];
            self.heap.upvalue_mut(upvalue).location = UpvalueSlot::Closed(value);
            self.open_upvalues.remove(0);
        }
    }

    fn read_upvalue(&self, upvalue: ObjRef) -> Value {
        match self.heap.upvalue(upvalue).location {
            UpvalueSlot::Stack(slot) => self.stack[slot],
            UpvalueSlot::Closed(value) => value,
        }
    }

    fn write_upvalue(&mut self, upvalue: ObjRef, value: Value) {
        match self.heap.upvalue(upvalue).location {
            UpvalueSlot::Stack(slot) => self.stack[slot] = value,
            UpvalueSlot::Closed(_) => {
                self.heap.upvalue_mut(upvalue).location = UpvalueSlot::Closed(value);
            }
        }
    }

    // === String concatenation ===

    fn concatenate(&mut self) {
        // Operands stay on the stack across the interning allocation
        let (Value::Obj(b), Value::Obj(a)) = (self.peek(0), self.peek(1)) else {
            unreachable!("concatenate on non-string operands");
        };
        let mut chars = self.heap.string(a).chars.clone();
        chars.push_str(&self.heap.string(b).chars);
        let result = self.intern(&chars);
        self.pop();
        self.pop();
        self.push(Value::Obj(result));
    }

    // === Dispatch ===

    fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            let op_byte = {
                let frame = self.frame();
                frame.chunk.code.get(frame.ip).copied()
            };
            let Some(op_byte) = op_byte else {
                return Err(self.error(RuntimeErrorKind::TruncatedInstruction));
            };
            self.frame_mut().ip += 1;
            let opcode = match Opcode::try_from(op_byte) {
                Ok(opcode) => opcode,
                Err(_) => return Err(self.error(RuntimeErrorKind::UnknownOpcode(op_byte))),
            };

            match opcode {
                // ===== Constants and literals =====
                Opcode::Constant => {
                    let constant = self.read_constant();
                    self.push(constant);
                }
                Opcode::Nil => self.push(Value::Nil),
                Opcode::True => self.push(Value::Bool(true)),
                Opcode::False => self.push(Value::Bool(false)),
                Opcode::Pop => {
                    self.pop();
                }

                // ===== Variables =====
                Opcode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let value = self.stack[self.frame().base + slot];
                    self.push(value);
                }
                Opcode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let value = self.peek(0);
                    let base = self.frame().base;
                    self.stack[base + slot] = value;
                }
                Opcode::GetGlobal => {
                    let name = self.read_string_ref();
                    let key = self.heap.str_key(name);
                    match self.globals.get(key) {
                        Some(value) => self.push(value),
                        None => {
                            let name = self.heap.string(name).chars.clone();
                            return Err(self.error(RuntimeErrorKind::UndefinedVariable(name)));
                        }
                    }
                }
                Opcode::DefineGlobal => {
                    let name = self.read_string_ref();
                    let key = self.heap.str_key(name);
                    let value = self.peek(0);
                    self.globals.set(key, value);
                    self.pop();
                }
                Opcode::SetGlobal => {
                    let name = self.read_string_ref();
                    let key = self.heap.str_key(name);
                    // Assignment never creates a global; undo and error
                    // if the name was unbound
                    if self.globals.set(key, self.peek(0)) {
                        self.globals.delete(key);
                        let name = self.heap.string(name).chars.clone();
                        return Err(self.error(RuntimeErrorKind::UndefinedVariable(name)));
                    }
                }
                Opcode::GetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let upvalue = self.heap.closure(self.frame().closure).upvalues[slot];
                    let value = self.read_upvalue(upvalue);
                    self.push(value);
                }
                Opcode::SetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let upvalue = self.heap.closure(self.frame().closure).upvalues[slot];
                    let value = self.peek(0);
                    self.write_upvalue(upvalue, value);
                }

                // ===== Properties =====
                Opcode::GetProperty => {
                    let name = self.read_string_ref();
                    let Value::Obj(receiver) = self.peek(0) else {
                        return Err(self.error(RuntimeErrorKind::PropertyOnNonInstance));
                    };
                    let class = match self.heap.get(receiver) {
                        Obj::Instance(instance) => instance.class,
                        _ => return Err(self.error(RuntimeErrorKind::PropertyOnNonInstance)),
                    };
                    let key = self.heap.str_key(name);
                    if let Some(value) = self.heap.instance(receiver).fields.get(key) {
                        self.pop();
                        self.push(value);
                    } else {
                        self.bind_method(class, name)?;
                    }
                }
                Opcode::SetProperty => {
                    let name = self.read_string_ref();
                    let Value::Obj(receiver) = self.peek(1) else {
                        return Err(self.error(RuntimeErrorKind::FieldOnNonInstance));
                    };
                    if !matches!(self.heap.get(receiver), Obj::Instance(_)) {
                        return Err(self.error(RuntimeErrorKind::FieldOnNonInstance));
                    }
                    let key = self.heap.str_key(name);
                    let value = self.peek(0);
                    self.heap.instance_mut(receiver).fields.set(key, value);
                    // Leave the assigned value as the expression result
                    let value = self.pop();
                    self.pop();
                    self.push(value);
                }
                Opcode::GetSuper => {
                    let name = self.read_string_ref();
                    let Value::Obj(superclass) = self.pop() else {
                        unreachable!("super slot does not hold a class");
                    };
                    self.bind_method(superclass, name)?;
                }

                // ===== Operators =====
                Opcode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b));
                }
                Opcode::Greater => self.binary_number_op(|a, b| Value::Bool(a > b))?,
                Opcode::Less => self.binary_number_op(|a, b| Value::Bool(a < b))?,
                Opcode::Add => {
                    match (self.peek(1), self.peek(0)) {
                        (Value::Number(a), Value::Number(b)) => {
                            self.pop();
                            self.pop();
                            self.push(Value::Number(a + b));
                        }
                        (Value::Obj(a), Value::Obj(b))
                            if matches!(self.heap.get(a), Obj::String(_))
                                && matches!(self.heap.get(b), Obj::String(_)) =>
                        {
                            self.concatenate();
                        }
                        _ => return Err(self.error(RuntimeErrorKind::BadAddOperands)),
                    }
                }
                Opcode::Subtract => self.binary_number_op(|a, b| Value::Number(a - b))?,
                Opcode::Multiply => self.binary_number_op(|a, b| Value::Number(a * b))?,
                Opcode::Divide => self.binary_number_op(|a, b| Value::Number(a / b))?,
                Opcode::Not => {
                    let value = self.pop();
                    self.push(Value::Bool(value.is_falsey()));
                }
                Opcode::Negate => {
                    let Value::Number(n) = self.peek(0) else {
                        return Err(self.error(RuntimeErrorKind::OperandMustBeNumber));
                    };
                    self.pop();
                    self.push(Value::Number(-n));
                }

                // ===== Output =====
                Opcode::Print => {
                    let value = self.pop();
                    let text = value.display(&self.heap);
                    let _ = writeln!(self.output, "{}", text);
                }

                // ===== Control flow =====
                Opcode::Jump => {
                    let offset = self.read_short() as usize;
                    self.frame_mut().ip += offset;
                }
                Opcode::JumpIfFalse => {
                    let offset = self.read_short() as usize;
                    // The tested value stays on the stack; the compiler
                    // emits the pops
                    if self.peek(0).is_falsey() {
                        self.frame_mut().ip += offset;
                    }
                }
                Opcode::Loop => {
                    let offset = self.read_short() as usize;
                    self.frame_mut().ip -= offset;
                }

                // ===== Calls =====
                Opcode::Call => {
                    let argc = self.read_byte();
                    let callee = self.peek(argc as usize);
                    self.call_value(callee, argc)?;
                }
                Opcode::Invoke => {
                    let name = self.read_string_ref();
                    let argc = self.read_byte();
                    self.invoke(name, argc)?;
                }
                Opcode::SuperInvoke => {
                    let name = self.read_string_ref();
                    let argc = self.read_byte();
                    let Value::Obj(superclass) = self.pop() else {
                        unreachable!("super slot does not hold a class");
                    };
                    self.invoke_from_class(superclass, name, argc)?;
                }

                // ===== Closures =====
                Opcode::Closure => {
                    let function = match self.read_constant() {
                        Value::Obj(r) => r,
                        _ => unreachable!("closure operand is not a function constant"),
                    };
                    let upvalue_count = self.heap.function(function).upvalue_count as usize;
                    let closure = self.alloc(Obj::Closure(ObjClosure {
                        function,
                        upvalues: Vec::with_capacity(upvalue_count),
                    }));
                    // On the stack before the captures below can collect
                    self.push(Value::Obj(closure));
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte() == 1;
                        let index = self.read_byte() as usize;
                        let upvalue = if is_local {
                            let base = self.frame().base;
                            self.capture_upvalue(base + index)
                        } else {
                            self.heap.closure(self.frame().closure).upvalues[index]
                        };
                        self.heap.closure_mut(closure).upvalues.push(upvalue);
                    }
                }
                Opcode::CloseUpvalue => {
                    self.close_upvalues(self.stack.len() - 1);
                    self.pop();
                }
                Opcode::Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().expect("no active call frame");
                    self.close_upvalues(frame.base);
                    if self.frames.is_empty() {
                        // Pop the script closure; execution is complete
                        self.pop();
                        return Ok(());
                    }
                    self.stack.truncate(frame.base);
                    self.push(result);
                }

                // ===== Classes =====
                Opcode::Class => {
                    let name = self.read_string_ref();
                    let class = self.alloc(Obj::Class(crate::object::ObjClass {
                        name,
                        methods: Table::new(),
                    }));
                    self.push(Value::Obj(class));
                }
                Opcode::Inherit => {
                    let Value::Obj(superclass) = self.peek(1) else {
                        return Err(self.error(RuntimeErrorKind::SuperclassMustBeClass));
                    };
                    if !matches!(self.heap.get(superclass), Obj::Class(_)) {
                        return Err(self.error(RuntimeErrorKind::SuperclassMustBeClass));
                    }
                    let Value::Obj(subclass) = self.peek(0) else {
                        unreachable!("inherit without a class on top");
                    };
                    // Copy-down inheritance: methods resolve with no
                    // runtime superclass walk
                    let methods: Vec<_> = self.heap.class(superclass).methods.iter().collect();
                    for (key, method) in methods {
                        self.heap.class_mut(subclass).methods.set(key, method);
                    }
                    self.pop();
                }
                Opcode::Method => {
                    let name = self.read_string_ref();
                    let key = self.heap.str_key(name);
                    let method = self.peek(0);
                    let Value::Obj(class) = self.peek(1) else {
                        unreachable!("method without a class below it");
                    };
                    self.heap.class_mut(class).methods.set(key, method);
                    self.pop();
                }

                // ===== Lists =====
                Opcode::BuildList => {
                    let count = self.read_byte() as usize;
                    let start = self.stack.len() - count;
                    // The elements stay on the stack across the allocation
                    let items = self.stack[start..].to_vec();
                    let list = self.alloc(Obj::List(ObjList { items }));
                    self.stack.truncate(start);
                    self.push(Value::Obj(list));
                }
                Opcode::IndexSubscr => {
                    let index = self.pop();
                    let target = self.pop();
                    let list = match target {
                        Value::Obj(r) if matches!(self.heap.get(r), Obj::List(_)) => r,
                        _ => return Err(self.error(RuntimeErrorKind::IndexNonList)),
                    };
                    let Value::Number(n) = index else {
                        return Err(self.error(RuntimeErrorKind::IndexNotNumber));
                    };
                    let idx = n as i64;
                    let len = self.heap.list(list).items.len() as i64;
                    if idx < 0 || idx >= len {
                        return Err(self.error(RuntimeErrorKind::IndexOutOfRange));
                    }
                    let value = self.heap.list(list).items[idx as usize];
                    self.push(value);
                }
                Opcode::StoreSubscr => {
                    let value = self.pop();
                    let index = self.pop();
                    let target = self.pop();
                    let list = match target {
                        Value::Obj(r) if matches!(self.heap.get(r), Obj::List(_)) => r,
                        _ => return Err(self.error(RuntimeErrorKind::StoreNonList)),
                    };
                    let Value::Number(n) = index else {
                        return Err(self.error(RuntimeErrorKind::IndexNotNumber));
                    };
                    let idx = n as i64;
                    let len = self.heap.list(list).items.len() as i64;
                    if idx < 0 || idx >= len {
                        return Err(self.error(RuntimeErrorKind::StoreIndexOutOfRange));
                    }
                    self.heap.list_mut(list).items[idx as usize] = value;
                    // The stored value is the expression result
                    self.push(value);
                }
            }
        }
    }

    fn binary_number_op(
        &mut self,
        op: impl FnOnce(f64, f64) -> Value,
    ) -> Result<(), RuntimeError> {
        let (Value::Number(a), Value::Number(b)) = (self.peek(1), self.peek(0)) else {
            return Err(self.error(RuntimeErrorKind::OperandsMustBeNumbers));
        };
        self.pop();
        self.pop();
        self.push(op(a, b));
        Ok(())
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}
