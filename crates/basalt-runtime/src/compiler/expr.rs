//! Expression parsing: the Pratt table and its handlers
//!
//! Each token kind maps to an optional prefix handler, an optional infix
//! handler, and the precedence its infix form binds at.
//! `parse_precedence` drives the whole expression grammar off that table.

use super::Compiler;
use crate::bytecode::Opcode;
use crate::token::TokenKind;
use crate::value::Value;

/// Binding strength, weakest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(super) enum Precedence {
    None,
    /// `=`
    Assignment,
    /// `or`
    Or,
    /// `and`
    And,
    /// `==` `!=`
    Equality,
    /// `<` `>` `<=` `>=`
    Comparison,
    /// `+` `-`
    Term,
    /// `*` `/`
    Factor,
    /// `!` unary `-`
    Unary,
    /// `.` `()` `[]`
    Call,
    Primary,
}

impl Precedence {
    /// The next-stronger level, for left-associative infix operators
    fn one_stronger(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call | Precedence::Primary => Precedence::Primary,
        }
    }
}

type ParseFn = for<'a, 'v> fn(&'a mut Compiler<'v>, bool);

struct ParseRule {
    prefix: Option<ParseFn>,
    infix: Option<ParseFn>,
    precedence: Precedence,
}

/// The Pratt table
fn rule(kind: TokenKind) -> ParseRule {
    let (prefix, infix, precedence): (Option<ParseFn>, Option<ParseFn>, Precedence) = match kind {
        TokenKind::LeftParen => (Some(grouping), Some(call), Precedence::Call),
        TokenKind::LeftBracket => (Some(list), Some(subscript), Precedence::Call),
        TokenKind::Dot => (None, Some(dot), Precedence::Call),
        TokenKind::Minus => (Some(unary), Some(binary), Precedence::Term),
        TokenKind::Plus => (None, Some(binary), Precedence::Term),
        TokenKind::Slash | TokenKind::Star => (None, Some(binary), Precedence::Factor),
        TokenKind::Bang => (Some(unary), None, Precedence::None),
        TokenKind::BangEqual | TokenKind::EqualEqual => {
            (None, Some(binary), Precedence::Equality)
        }
        TokenKind::Greater
        | TokenKind::GreaterEqual
        | TokenKind::Less
        | TokenKind::LessEqual => (None, Some(binary), Precedence::Comparison),
        TokenKind::Identifier => (Some(variable), None, Precedence::None),
        TokenKind::String => (Some(string), None, Precedence::None),
        TokenKind::Number => (Some(number), None, Precedence::None),
        TokenKind::And => (None, Some(and_), Precedence::And),
        TokenKind::Or => (None, Some(or_), Precedence::Or),
        TokenKind::False | TokenKind::True | TokenKind::Nil => {
            (Some(literal), None, Precedence::None)
        }
        TokenKind::Super => (Some(super_), None, Precedence::None),
        TokenKind::This => (Some(this_), None, Precedence::None),
        _ => (None, None, Precedence::None),
    };
    ParseRule {
        prefix,
        infix,
        precedence,
    }
}

impl Compiler<'_> {
    pub(crate) fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    /// Parse everything that binds at least as tightly as `precedence`
    pub(super) fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let Some(prefix) = rule(self.previous.kind).prefix else {
            self.error("Expect expression.");
            return;
        };

        // Assignment only nests where a whole assignment could appear
        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= rule(self.current.kind).precedence {
            self.advance();
            if let Some(infix) = rule(self.previous.kind).infix {
                infix(self, can_assign);
            }
        }

        if can_assign && self.match_token(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    /// Parse a parenthesized argument list; returns the argument count
    pub(super) fn argument_list(&mut self) -> u8 {
        let mut count: u32 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if count == 255 {
                    self.error("Can't have more than 255 arguments.");
                }
                count += 1;
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        count.min(255) as u8
    }
}

// === Prefix handlers ===

fn grouping(compiler: &mut Compiler<'_>, _can_assign: bool) {
    compiler.expression();
    compiler.consume(TokenKind::RightParen, "Expect ')' after expression.");
}

fn number(compiler: &mut Compiler<'_>, _can_assign: bool) {
    let value: f64 = compiler
        .previous
        .lexeme
        .parse()
        .expect("lexer produced an invalid number literal");
    compiler.emit_constant(Value::Number(value));
}

fn string(compiler: &mut Compiler<'_>, _can_assign: bool) {
    // Trim the surrounding quotes
    let lexeme = compiler.previous.lexeme.clone();
    let contents = &lexeme[1..lexeme.len() - 1];
    let interned = compiler.intern(contents);
    compiler.emit_constant(Value::Obj(interned));
}

fn literal(compiler: &mut Compiler<'_>, _can_assign: bool) {
    match compiler.previous.kind {
        TokenKind::False => compiler.emit_op(Opcode::False),
        TokenKind::True => compiler.emit_op(Opcode::True),
        TokenKind::Nil => compiler.emit_op(Opcode::Nil),
        _ => unreachable!("literal handler on non-literal token"),
    }
}

fn unary(compiler: &mut Compiler<'_>, _can_assign: bool) {
    let operator = compiler.previous.kind;
    compiler.parse_precedence(Precedence::Unary);
    match operator {
        TokenKind::Minus => compiler.emit_op(Opcode::Negate),
        TokenKind::Bang => compiler.emit_op(Opcode::Not),
        _ => unreachable!("unary handler on non-unary token"),
    }
}

fn variable(compiler: &mut Compiler<'_>, can_assign: bool) {
    let name = compiler.previous.lexeme.clone();
    compiler.named_variable(&name, can_assign);
}

fn list(compiler: &mut Compiler<'_>, _can_assign: bool) {
    let mut count: u32 = 0;
    if !compiler.check(TokenKind::RightBracket) {
        loop {
            compiler.expression();
            if count == 255 {
                compiler.error("Can't have more than 255 items in a list literal.");
            }
            count += 1;
            if !compiler.match_token(TokenKind::Comma) {
                break;
            }
        }
    }
    compiler.consume(TokenKind::RightBracket, "Expect ']' after list literal.");
    compiler.emit_bytes(Opcode::BuildList as u8, count.min(255) as u8);
}

fn this_(compiler: &mut Compiler<'_>, _can_assign: bool) {
    if !compiler.in_class() {
        compiler.error("Can't use 'this' outside of a class.");
        return;
    }
    // `this` is the method's reserved slot 0; never assignable
    compiler.named_variable("this", false);
}

fn super_(compiler: &mut Compiler<'_>, _can_assign: bool) {
    if !compiler.in_class() {
        compiler.error("Can't use 'super' outside of a class.");
    } else if !compiler.current_class_has_superclass() {
        compiler.error("Can't use 'super' in a class with no superclass.");
    }

    compiler.consume(TokenKind::Dot, "Expect '.' after 'super'.");
    compiler.consume(TokenKind::Identifier, "Expect superclass method name.");
    let method_name = compiler.previous.lexeme.clone();
    let name = compiler.identifier_constant(&method_name);

    compiler.named_variable("this", false);
    if compiler.match_token(TokenKind::LeftParen) {
        // Fused super call: skip the bound-method allocation
        let argc = compiler.argument_list();
        compiler.named_variable("super", false);
        compiler.emit_bytes(Opcode::SuperInvoke as u8, name);
        compiler.emit_byte(argc);
    } else {
        compiler.named_variable("super", false);
        compiler.emit_bytes(Opcode::GetSuper as u8, name);
    }
}

// === Infix handlers ===

fn binary(compiler: &mut Compiler<'_>, _can_assign: bool) {
    let operator = compiler.previous.kind;
    let precedence = rule(operator).precedence;
    compiler.parse_precedence(precedence.one_stronger());

    match operator {
        TokenKind::Plus => compiler.emit_op(Opcode::Add),
        TokenKind::Minus => compiler.emit_op(Opcode::Subtract),
        TokenKind::Star => compiler.emit_op(Opcode::Multiply),
        TokenKind::Slash => compiler.emit_op(Opcode::Divide),
        TokenKind::BangEqual => {
            compiler.emit_op(Opcode::Equal);
            compiler.emit_op(Opcode::Not);
        }
        TokenKind::EqualEqual => compiler.emit_op(Opcode::Equal),
        TokenKind::Greater => compiler.emit_op(Opcode::Greater),
        TokenKind::GreaterEqual => {
            compiler.emit_op(Opcode::Less);
            compiler.emit_op(Opcode::Not);
        }
        TokenKind::Less => compiler.emit_op(Opcode::Less),
        TokenKind::LessEqual => {
            compiler.emit_op(Opcode::Greater);
            compiler.emit_op(Opcode::Not);
        }
        _ => unreachable!("binary handler on non-binary token"),
    }
}

fn call(compiler: &mut Compiler<'_>, _can_assign: bool) {
    let argc = compiler.argument_list();
    compiler.emit_bytes(Opcode::Call as u8, argc);
}

fn dot(compiler: &mut Compiler<'_>, can_assign: bool) {
    compiler.consume(TokenKind::Identifier, "Expect property name after '.'.");
    let property = compiler.previous.lexeme.clone();
    let name = compiler.identifier_constant(&property);

    if can_assign && compiler.match_token(TokenKind::Equal) {
        compiler.expression();
        compiler.emit_bytes(Opcode::SetProperty as u8, name);
    } else if compiler.match_token(TokenKind::LeftParen) {
        // Fused method call: skip the bound-method allocation
        let argc = compiler.argument_list();
        compiler.emit_bytes(Opcode::Invoke as u8, name);
        compiler.emit_byte(argc);
    } else {
        compiler.emit_bytes(Opcode::GetProperty as u8, name);
    }
}

fn subscript(compiler: &mut Compiler<'_>, can_assign: bool) {
    compiler.expression();
    compiler.consume(TokenKind::RightBracket, "Expect ']' after index.");
    if can_assign && compiler.match_token(TokenKind::Equal) {
        compiler.expression();
        compiler.emit_op(Opcode::StoreSubscr);
    } else {
        compiler.emit_op(Opcode::IndexSubscr);
    }
}

/// `and` short-circuits by jumping over the right operand, leaving the
/// falsey left operand as the result
fn and_(compiler: &mut Compiler<'_>, _can_assign: bool) {
    let end_jump = compiler.emit_jump(Opcode::JumpIfFalse);
    compiler.emit_op(Opcode::Pop);
    compiler.parse_precedence(Precedence::And);
    compiler.patch_jump(end_jump);
}

/// `or` short-circuits by jumping past the right operand when the left
/// operand is truthy
fn or_(compiler: &mut Compiler<'_>, _can_assign: bool) {
    let else_jump = compiler.emit_jump(Opcode::JumpIfFalse);
    let end_jump = compiler.emit_jump(Opcode::Jump);
    compiler.patch_jump(else_jump);
    compiler.emit_op(Opcode::Pop);
    compiler.parse_precedence(Precedence::Or);
    compiler.patch_jump(end_jump);
}
