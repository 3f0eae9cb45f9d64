//! Source to bytecode compiler
//!
//! A single-pass Pratt parser: tokens are pulled from the lexer on
//! demand and bytecode is emitted directly, with no AST in between.
//! - Expressions leave their result on the stack
//! - Locals live in stack slots resolved at compile time
//! - Globals are late-bound through name constants
//! - Captured variables resolve to upvalue slots, chained through
//!   enclosing functions for transitive capture
//!
//! One [`FunctionContext`] per function being compiled, stacked for
//! nesting; the in-progress constant pools double as GC roots while
//! compilation allocates.

mod expr;
mod stmt;

use std::rc::Rc;

use crate::bytecode::{Chunk, Opcode};
use crate::diagnostic::Diagnostic;
use crate::heap::{Heap, Trace};
use crate::lexer::Lexer;
use crate::object::{Obj, ObjFunction, ObjRef};
use crate::token::{Token, TokenKind};
use crate::value::Value;
use crate::vm::Vm;

/// Local and upvalue slot indices are single bytes
pub(crate) const MAX_LOCALS: usize = 256;
pub(crate) const MAX_UPVALUES: usize = 256;
/// Short-form constant operands are single bytes
pub(crate) const MAX_CONSTANTS: usize = 256;

/// What kind of function body is being compiled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FunctionType {
    /// The implicit top-level function
    Script,
    /// An ordinary `fun` declaration
    Function,
    /// A class method
    Method,
    /// A method named `init`
    Initializer,
}

/// Local variable information
#[derive(Debug)]
struct Local {
    name: String,
    /// Scope depth, or -1 while the initializer is still being compiled
    depth: i32,
    /// Captured by a nested closure: close on scope exit instead of pop
    is_captured: bool,
}

/// One upvalue of the function being compiled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CompilerUpvalue {
    /// Slot in the enclosing function's locals (`is_local`) or upvalues
    pub(crate) index: u8,
    pub(crate) is_local: bool,
}

/// The function object under construction
struct FunctionBuilder {
    arity: u8,
    chunk: Chunk,
    name: Option<ObjRef>,
}

/// Per-function compilation state
struct FunctionContext {
    builder: FunctionBuilder,
    fn_type: FunctionType,
    locals: Vec<Local>,
    upvalues: Vec<CompilerUpvalue>,
    scope_depth: i32,
}

impl FunctionContext {
    fn new(fn_type: FunctionType, name: Option<ObjRef>) -> Self {
        // Slot 0 belongs to the runtime: the receiver for methods, the
        // callee itself otherwise
        let slot_zero = Local {
            name: match fn_type {
                FunctionType::Method | FunctionType::Initializer => "this".to_string(),
                _ => String::new(),
            },
            depth: 0,
            is_captured: false,
        };
        Self {
            builder: FunctionBuilder {
                arity: 0,
                chunk: Chunk::new(),
                name,
            },
            fn_type,
            locals: vec![slot_zero],
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }
}

/// Per-class compilation state (innermost class last)
struct ClassContext {
    has_superclass: bool,
}

/// The compiler roots: every in-progress function's name and constants.
///
/// Allocations during compilation pass this to the collector so values
/// already sitting in half-built constant pools survive.
struct CompilerRoots<'a> {
    contexts: &'a [FunctionContext],
}

impl Trace for CompilerRoots<'_> {
    fn trace(&self, heap: &mut Heap) {
        for context in self.contexts {
            if let Some(name) = context.builder.name {
                heap.mark_object(name);
            }
            for &constant in &context.builder.chunk.constants {
                heap.mark_value(constant);
            }
        }
    }
}

/// Compile a source string to its top-level function
pub fn compile(vm: &mut Vm, source: &str) -> Result<ObjRef, Vec<Diagnostic>> {
    let mut compiler = Compiler::new(vm, source);
    compiler.advance();
    while !compiler.match_token(TokenKind::Eof) {
        compiler.declaration();
    }
    compiler.finish()
}

/// Compiler state
pub(crate) struct Compiler<'vm> {
    vm: &'vm mut Vm,
    lexer: Lexer,
    pub(crate) previous: Token,
    pub(crate) current: Token,
    had_error: bool,
    panic_mode: bool,
    diagnostics: Vec<Diagnostic>,
    contexts: Vec<FunctionContext>,
    classes: Vec<ClassContext>,
}

impl<'vm> Compiler<'vm> {
    fn new(vm: &'vm mut Vm, source: &str) -> Self {
        let placeholder = Token::new(TokenKind::Eof, "", 0, crate::span::Span::dummy());
        Self {
            vm,
            lexer: Lexer::new(source),
            previous: placeholder.clone(),
            current: placeholder,
            had_error: false,
            panic_mode: false,
            diagnostics: Vec::new(),
            contexts: vec![FunctionContext::new(FunctionType::Script, None)],
            classes: Vec::new(),
        }
    }

    /// Close the script function and hand back the result
    fn finish(mut self) -> Result<ObjRef, Vec<Diagnostic>> {
        let (function, _) = self.end_function();
        if self.had_error {
            Err(self.diagnostics)
        } else {
            Ok(function)
        }
    }

    // === Token navigation ===

    pub(crate) fn advance(&mut self) {
        self.previous = std::mem::replace(
            &mut self.current,
            Token::new(TokenKind::Eof, "", 0, crate::span::Span::dummy()),
        );
        loop {
            self.current = self.lexer.next_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let message = self.current.lexeme.clone();
            self.error_at_current_with_code("BS1001", &message);
        }
    }

    pub(crate) fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    pub(crate) fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    pub(crate) fn match_token(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    // === Error reporting ===

    pub(crate) fn error(&mut self, message: &str) {
        let token = self.previous.clone();
        self.error_at(&token, "BS2001", message);
    }

    pub(crate) fn error_at_current(&mut self, message: &str) {
        let token = self.current.clone();
        self.error_at(&token, "BS2001", message);
    }

    fn error_at_current_with_code(&mut self, code: &str, message: &str) {
        let token = self.current.clone();
        self.error_at(&token, code, message);
    }

    fn error_at(&mut self, token: &Token, code: &str, message: &str) {
        // Panic mode suppresses the cascade until a statement boundary
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;

        let label = match token.kind {
            TokenKind::Eof => "at end".to_string(),
            TokenKind::Error => String::new(),
            _ => format!("at '{}'", token.lexeme),
        };
        let diagnostic = Diagnostic::error_with_code(code, message, token.span)
            .with_line(token.line as usize)
            .with_column(self.lexer.column_of(token.span.start))
            .with_snippet(self.lexer.line_snippet(token.line))
            .with_label(label);
        self.diagnostics.push(diagnostic);
    }

    pub(crate) fn is_panicking(&self) -> bool {
        self.panic_mode
    }

    /// Skip tokens until a likely statement boundary
    pub(crate) fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return => return,
                _ => self.advance(),
            }
        }
    }

    // === Emitting ===

    fn context(&self) -> &FunctionContext {
        self.contexts.last().expect("no active function context")
    }

    fn context_mut(&mut self) -> &mut FunctionContext {
        self.contexts.last_mut().expect("no active function context")
    }

    fn chunk_mut(&mut self) -> &mut Chunk {
        &mut self.context_mut().builder.chunk
    }

    /// Offset of the next instruction to be emitted (jump targets)
    pub(crate) fn code_offset(&self) -> usize {
        self.context().builder.chunk.current_offset()
    }

    pub(crate) fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.chunk_mut().write(byte, line);
    }

    pub(crate) fn emit_op(&mut self, op: Opcode) {
        self.emit_byte(op as u8);
    }

    pub(crate) fn emit_bytes(&mut self, first: u8, second: u8) {
        self.emit_byte(first);
        self.emit_byte(second);
    }

    pub(crate) fn emit_return(&mut self) {
        // An initializer's implicit return yields the receiver
        if self.context().fn_type == FunctionType::Initializer {
            self.emit_bytes(Opcode::GetLocal as u8, 0);
        } else {
            self.emit_op(Opcode::Nil);
        }
        self.emit_op(Opcode::Return);
    }

    pub(crate) fn emit_constant(&mut self, value: Value) {
        let constant = self.make_constant(value);
        self.emit_bytes(Opcode::Constant as u8, constant);
    }

    pub(crate) fn make_constant(&mut self, value: Value) -> u8 {
        if self.context().builder.chunk.constants.len() >= MAX_CONSTANTS {
            self.error("Too many constants in one chunk.");
            return 0;
        }
        self.chunk_mut().add_constant(value) as u8
    }

    /// Emit a forward jump with a placeholder offset; returns the
    /// operand position for [`patch_jump`](Self::patch_jump)
    pub(crate) fn emit_jump(&mut self, op: Opcode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.chunk_mut().current_offset() - 2
    }

    pub(crate) fn patch_jump(&mut self, offset: usize) {
        // -2 skips the operand itself
        let jump = self.context().builder.chunk.current_offset() - offset - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
            return;
        }
        self.chunk_mut().patch_u16(offset, jump as u16);
    }

    pub(crate) fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(Opcode::Loop);
        // +2 skips the operand itself
        let offset = self.context().builder.chunk.current_offset() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
            self.emit_bytes(0xff, 0xff);
            return;
        }
        self.emit_bytes((offset >> 8) as u8, (offset & 0xff) as u8);
    }

    // === Scopes, locals, and upvalues ===

    pub(crate) fn begin_scope(&mut self) {
        self.context_mut().scope_depth += 1;
    }

    pub(crate) fn end_scope(&mut self) {
        self.context_mut().scope_depth -= 1;
        loop {
            let context = self.context();
            let Some(local) = context.locals.last() else {
                break;
            };
            if local.depth <= context.scope_depth {
                break;
            }
            // Captured locals are hoisted to the heap instead of dropped
            let captured = local.is_captured;
            if captured {
                self.emit_op(Opcode::CloseUpvalue);
            } else {
                self.emit_op(Opcode::Pop);
            }
            self.context_mut().locals.pop();
        }
    }

    /// Parse a variable name; returns its constant index for globals
    /// (locals resolve to slots and need no constant)
    pub(crate) fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable();
        if self.context().scope_depth > 0 {
            return 0;
        }
        let name = self.previous.lexeme.clone();
        self.identifier_constant(&name)
    }

    pub(crate) fn identifier_constant(&mut self, name: &str) -> u8 {
        let string = self.intern(name);
        self.make_constant(Value::Obj(string))
    }

    pub(crate) fn declare_variable(&mut self) {
        if self.context().scope_depth == 0 {
            return;
        }
        let name = self.previous.lexeme.clone();

        let context = self.context();
        let mut duplicate = false;
        for local in context.locals.iter().rev() {
            if local.depth != -1 && local.depth < context.scope_depth {
                break;
            }
            if local.name == name {
                duplicate = true;
                break;
            }
        }
        if duplicate {
            self.error("Already a variable with this name in this scope.");
        }
        self.add_local(name);
    }

    pub(crate) fn add_local(&mut self, name: String) {
        if self.context().locals.len() >= MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        self.context_mut().locals.push(Local {
            name,
            depth: -1,
            is_captured: false,
        });
    }

    pub(crate) fn mark_initialized(&mut self) {
        let context = self.context_mut();
        if context.scope_depth == 0 {
            return;
        }
        let depth = context.scope_depth;
        if let Some(local) = context.locals.last_mut() {
            local.depth = depth;
        }
    }

    pub(crate) fn define_variable(&mut self, global: u8) {
        if self.context().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_bytes(Opcode::DefineGlobal as u8, global);
    }

    /// Scan a function's locals top-down for `name`
    fn resolve_local(&mut self, context_index: usize, name: &str) -> Option<u8> {
        let mut found = None;
        for (slot, local) in self.contexts[context_index].locals.iter().enumerate().rev() {
            if local.name == name {
                found = Some((slot, local.depth == -1));
                break;
            }
        }
        let (slot, uninitialized) = found?;
        if uninitialized {
            self.error("Can't read local variable in its own initializer.");
        }
        Some(slot as u8)
    }

    /// Resolve `name` as a captured variable of the function at
    /// `context_index`, recursing outward and chaining through
    /// intermediate functions
    fn resolve_upvalue(&mut self, context_index: usize, name: &str) -> Option<u8> {
        if context_index == 0 {
            return None;
        }
        let enclosing = context_index - 1;

        if let Some(local) = self.resolve_local(enclosing, name) {
            self.contexts[enclosing].locals[local as usize].is_captured = true;
            return Some(self.add_upvalue(context_index, local, true));
        }
        if let Some(upvalue) = self.resolve_upvalue(enclosing, name) {
            return Some(self.add_upvalue(context_index, upvalue, false));
        }
        None
    }

    /// Register an upvalue, deduplicating repeated captures
    fn add_upvalue(&mut self, context_index: usize, index: u8, is_local: bool) -> u8 {
        let existing = self.contexts[context_index]
            .upvalues
            .iter()
            .position(|u| u.index == index && u.is_local == is_local);
        if let Some(slot) = existing {
            return slot as u8;
        }
        if self.contexts[context_index].upvalues.len() >= MAX_UPVALUES {
            self.error("Too many closure variables in function.");
            return 0;
        }
        self.contexts[context_index]
            .upvalues
            .push(CompilerUpvalue { index, is_local });
        (self.contexts[context_index].upvalues.len() - 1) as u8
    }

    /// Emit the load or store for a (possibly assigned) variable
    /// reference, resolving locals, then upvalues, then globals
    pub(crate) fn named_variable(&mut self, name: &str, can_assign: bool) {
        let context_index = self.contexts.len() - 1;
        let (get_op, set_op, arg) = if let Some(slot) = self.resolve_local(context_index, name) {
            (Opcode::GetLocal, Opcode::SetLocal, slot)
        } else if let Some(slot) = self.resolve_upvalue(context_index, name) {
            (Opcode::GetUpvalue, Opcode::SetUpvalue, slot)
        } else {
            let constant = self.identifier_constant(name);
            (Opcode::GetGlobal, Opcode::SetGlobal, constant)
        };

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_bytes(set_op as u8, arg);
        } else {
            self.emit_bytes(get_op as u8, arg);
        }
    }

    // === Function context management ===

    pub(crate) fn push_context(&mut self, fn_type: FunctionType, name: Option<ObjRef>) {
        self.contexts.push(FunctionContext::new(fn_type, name));
    }

    pub(crate) fn current_function_type(&self) -> FunctionType {
        self.context().fn_type
    }

    pub(crate) fn in_class(&self) -> bool {
        !self.classes.is_empty()
    }

    pub(crate) fn current_class_has_superclass(&self) -> bool {
        self.classes.last().is_some_and(|c| c.has_superclass)
    }

    pub(crate) fn push_class(&mut self) {
        self.classes.push(ClassContext {
            has_superclass: false,
        });
    }

    pub(crate) fn mark_class_superclass(&mut self) {
        if let Some(class) = self.classes.last_mut() {
            class.has_superclass = true;
        }
    }

    pub(crate) fn pop_class(&mut self) {
        self.classes.pop();
    }

    /// Finish the innermost function: emit its implicit return and
    /// allocate the function object. Returns the function and the
    /// upvalue descriptors the `Closure` instruction must carry.
    pub(crate) fn end_function(&mut self) -> (ObjRef, Vec<CompilerUpvalue>) {
        self.emit_return();
        // Collect while the context (and its constants) is still a root
        self.maybe_collect();
        let context = self.contexts.pop().expect("no active function context");
        let function = self.vm.heap.alloc(Obj::Function(ObjFunction {
            arity: context.builder.arity,
            upvalue_count: context.upvalues.len() as u8,
            chunk: Rc::new(context.builder.chunk),
            name: context.builder.name,
        }));
        (function, context.upvalues)
    }

    pub(crate) fn bump_arity(&mut self) {
        if self.context().builder.arity == u8::MAX {
            self.error_at_current("Can't have more than 255 parameters.");
            return;
        }
        self.context_mut().builder.arity += 1;
    }

    // === Heap access ===

    /// Intern a string, collecting first if the heap wants it
    pub(crate) fn intern(&mut self, text: &str) -> ObjRef {
        self.maybe_collect();
        self.vm.heap.intern(text)
    }

    fn maybe_collect(&mut self) {
        if self.vm.heap.should_collect() {
            let roots = CompilerRoots {
                contexts: &self.contexts,
            };
            self.vm.collect(Some(&roots));
        }
    }
}
