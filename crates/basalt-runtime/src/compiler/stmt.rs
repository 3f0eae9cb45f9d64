//! Declaration and statement parsing
//!
//! Control flow compiles to forward jumps patched after their target is
//! known, and backward `Loop` jumps. `for` desugars into an optional
//! initializer scope, a condition, and an increment clause compiled
//! out of line (body first, then jump back through the increment).

use super::{Compiler, FunctionType};
use crate::bytecode::Opcode;
use crate::token::TokenKind;
use crate::value::Value;

impl Compiler<'_> {
    pub(crate) fn declaration(&mut self) {
        if self.match_token(TokenKind::Class) {
            self.class_declaration();
        } else if self.match_token(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }

        if self.is_panicking() {
            self.synchronize();
        }
    }

    fn statement(&mut self) {
        if self.match_token(TokenKind::Print) {
            self.print_statement();
        } else if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    // === Declarations ===

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.previous.lexeme.clone();
        let name_constant = self.identifier_constant(&class_name);
        self.declare_variable();

        self.emit_bytes(Opcode::Class as u8, name_constant);
        self.define_variable(name_constant);

        self.push_class();

        if self.match_token(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            let superclass_name = self.previous.lexeme.clone();
            self.named_variable(&superclass_name, false);

            if class_name == superclass_name {
                self.error("A class can't inherit from itself.");
            }

            // `super` lives in a synthetic scope around the class body so
            // every method closes over the same superclass binding
            self.begin_scope();
            self.add_local("super".to_string());
            self.define_variable(0);

            self.named_variable(&class_name, false);
            self.emit_op(Opcode::Inherit);
            self.mark_class_superclass();
        }

        self.named_variable(&class_name, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_op(Opcode::Pop);

        if self.current_class_has_superclass() {
            self.end_scope();
        }
        self.pop_class();
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let method_name = self.previous.lexeme.clone();
        let constant = self.identifier_constant(&method_name);

        let fn_type = if method_name == "init" {
            FunctionType::Initializer
        } else {
            FunctionType::Method
        };
        self.function(fn_type);
        self.emit_bytes(Opcode::Method as u8, constant);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        // A function may refer to itself; it is initialized before its
        // body is compiled
        self.mark_initialized();
        self.function(FunctionType::Function);
        self.define_variable(global);
    }

    /// Compile a function body (the name token is `previous`) and emit
    /// the `Closure` instruction that builds it at runtime
    fn function(&mut self, fn_type: FunctionType) {
        let name_text = self.previous.lexeme.clone();
        let name = self.intern(&name_text);
        self.push_context(fn_type, Some(name));
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                self.bump_arity();
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        // No end_scope: popping the context discards its locals wholesale
        let (function, upvalues) = self.end_function();
        let constant = self.make_constant(Value::Obj(function));
        self.emit_bytes(Opcode::Closure as u8, constant);
        for upvalue in upvalues {
            self.emit_byte(upvalue.is_local as u8);
            self.emit_byte(upvalue.index);
        }
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");

        if self.match_token(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(Opcode::Nil);
        }
        self.consume(
            TokenKind::Semicolon,
            "Expect ';' after variable declaration.",
        );
        self.define_variable(global);
    }

    // === Statements ===

    pub(crate) fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_op(Opcode::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(Opcode::Pop);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        // JumpIfFalse leaves the condition on the stack; both branches
        // pop it themselves
        let then_jump = self.emit_jump(Opcode::JumpIfFalse);
        self.emit_op(Opcode::Pop);
        self.statement();
        let else_jump = self.emit_jump(Opcode::Jump);

        self.patch_jump(then_jump);
        self.emit_op(Opcode::Pop);
        if self.match_token(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn return_statement(&mut self) {
        if self.current_function_type() == FunctionType::Script {
            self.error("Can't return from top-level code.");
        }

        if self.match_token(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.current_function_type() == FunctionType::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(Opcode::Return);
        }
    }

    fn while_statement(&mut self) {
        let loop_start = self.code_offset();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(Opcode::JumpIfFalse);
        self.emit_op(Opcode::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(Opcode::Pop);
    }

    fn for_statement(&mut self) {
        // The initializer's variable is scoped to the loop
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");
        if self.match_token(TokenKind::Semicolon) {
            // No initializer
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.code_offset();
        let mut exit_jump = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(Opcode::JumpIfFalse));
            self.emit_op(Opcode::Pop);
        }

        if !self.match_token(TokenKind::RightParen) {
            // The increment textually precedes the body but runs after
            // it: jump over it now, loop back through it from the body
            let body_jump = self.emit_jump(Opcode::Jump);
            let increment_start = self.code_offset();
            self.expression();
            self.emit_op(Opcode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_op(Opcode::Pop);
        }
        self.end_scope();
    }
}
