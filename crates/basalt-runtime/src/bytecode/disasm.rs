//! Bytecode disassembler
//!
//! Converts chunks back to a human-readable assembly-like listing.
//! Used for debugging, snapshot tests, and `basalt disasm` output.

use std::fmt::Write;

use super::{Chunk, Opcode};
use crate::heap::Heap;
use crate::object::{Obj, ObjRef};
use crate::value::Value;

/// Disassemble one chunk to a listing
///
/// # Format
/// ```text
/// === script ===
/// 0000    1  Constant 0 '1'
/// 0002    |  Print
/// 0003    2  Jump 5 (-> 0011)
/// ```
///
/// The second column is the source line, or `|` when unchanged from the
/// previous instruction.
pub fn disassemble(heap: &Heap, chunk: &Chunk, name: &str) -> String {
    let mut output = String::new();
    writeln!(output, "=== {} ===", name).unwrap();

    let mut offset = 0;
    let mut previous_line = 0;
    while offset < chunk.code.len() {
        let line = chunk.line_at(offset);
        let line_col = if line == previous_line {
            "   |".to_string()
        } else {
            format!("{:4}", line)
        };
        previous_line = line;

        let (text, next) = disassemble_instruction(heap, chunk, offset);
        writeln!(output, "{:04} {}  {}", offset, line_col, text).unwrap();
        offset = next;
    }

    output
}

/// Disassemble a whole program: the given function's chunk followed by
/// every function in its constant pool, recursively
pub fn disassemble_program(heap: &Heap, function: ObjRef) -> String {
    let mut output = String::new();
    let mut pending = vec![function];
    while let Some(r) = pending.pop() {
        let f = heap.function(r);
        let name = match f.name {
            Some(n) => heap.string(n).chars.clone(),
            None => "script".to_string(),
        };
        output.push_str(&disassemble(heap, &f.chunk, &name));
        output.push('\n');
        for constant in &f.chunk.constants {
            if let Value::Obj(c) = constant {
                if matches!(heap.get(*c), Obj::Function(_)) {
                    pending.push(*c);
                }
            }
        }
    }
    output
}

/// Disassemble a single instruction; returns its text and the offset of
/// the next instruction
fn disassemble_instruction(heap: &Heap, chunk: &Chunk, offset: usize) -> (String, usize) {
    let byte = chunk.code[offset];
    let opcode = match Opcode::try_from(byte) {
        Ok(op) => op,
        Err(_) => return (format!("<invalid opcode: {:#04x}>", byte), offset + 1),
    };

    match opcode {
        // Simple opcodes (no operands)
        Opcode::Nil
        | Opcode::True
        | Opcode::False
        | Opcode::Pop
        | Opcode::Equal
        | Opcode::Greater
        | Opcode::Less
        | Opcode::Add
        | Opcode::Subtract
        | Opcode::Multiply
        | Opcode::Divide
        | Opcode::Not
        | Opcode::Negate
        | Opcode::Print
        | Opcode::CloseUpvalue
        | Opcode::Return
        | Opcode::Inherit
        | Opcode::IndexSubscr
        | Opcode::StoreSubscr => (format!("{:?}", opcode), offset + 1),

        // u8 constant-pool operand
        Opcode::Constant
        | Opcode::GetGlobal
        | Opcode::DefineGlobal
        | Opcode::SetGlobal
        | Opcode::GetProperty
        | Opcode::SetProperty
        | Opcode::GetSuper
        | Opcode::Class
        | Opcode::Method => {
            let index = read_u8(chunk, offset + 1);
            (
                format!(
                    "{:?} {} '{}'",
                    opcode,
                    index,
                    constant_text(heap, chunk, index)
                ),
                offset + 2,
            )
        }

        // u8 slot or count operand
        Opcode::GetLocal
        | Opcode::SetLocal
        | Opcode::GetUpvalue
        | Opcode::SetUpvalue
        | Opcode::Call
        | Opcode::BuildList => {
            let operand = read_u8(chunk, offset + 1);
            (format!("{:?} {}", opcode, operand), offset + 2)
        }

        // u16 jump operand
        Opcode::Jump | Opcode::JumpIfFalse => {
            let jump = read_u16(chunk, offset + 1);
            let target = offset + 3 + jump as usize;
            (
                format!("{:?} {} (-> {:04})", opcode, jump, target),
                offset + 3,
            )
        }
        Opcode::Loop => {
            let jump = read_u16(chunk, offset + 1);
            let target = offset + 3 - jump as usize;
            (
                format!("{:?} {} (-> {:04})", opcode, jump, target),
                offset + 3,
            )
        }

        // u8 constant + u8 argc
        Opcode::Invoke | Opcode::SuperInvoke => {
            let index = read_u8(chunk, offset + 1);
            let argc = read_u8(chunk, offset + 2);
            (
                format!(
                    "{:?} {} '{}' ({} args)",
                    opcode,
                    index,
                    constant_text(heap, chunk, index),
                    argc
                ),
                offset + 3,
            )
        }

        // u8 function constant + one (is_local, index) byte pair per upvalue
        Opcode::Closure => {
            let index = read_u8(chunk, offset + 1);
            let mut text = format!(
                "{:?} {} '{}'",
                opcode,
                index,
                constant_text(heap, chunk, index)
            );
            let upvalue_count = match chunk.constants.get(index as usize) {
                Some(Value::Obj(r)) => match heap.get(*r) {
                    Obj::Function(f) => f.upvalue_count as usize,
                    _ => 0,
                },
                _ => 0,
            };
            let mut next = offset + 2;
            for _ in 0..upvalue_count {
                let is_local = read_u8(chunk, next);
                let up_index = read_u8(chunk, next + 1);
                let kind = if is_local == 1 { "local" } else { "upvalue" };
                write!(text, " | {} {}", kind, up_index).unwrap();
                next += 2;
            }
            (text, next)
        }
    }
}

fn read_u8(chunk: &Chunk, offset: usize) -> u8 {
    chunk.code.get(offset).copied().unwrap_or(0)
}

fn read_u16(chunk: &Chunk, offset: usize) -> u16 {
    let high = read_u8(chunk, offset) as u16;
    let low = read_u8(chunk, offset + 1) as u16;
    (high << 8) | low
}

fn constant_text(heap: &Heap, chunk: &Chunk, index: u8) -> String {
    match chunk.constants.get(index as usize) {
        Some(value) => value.display(heap),
        None => "<missing constant>".to_string(),
    }
}
