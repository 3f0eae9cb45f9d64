//! Compiled-program serialization (`.bstc` files)
//!
//! # Format
//! ```text
//! header:  magic "BSTC" | version u16 | crc32 of payload u32
//! payload: one Function record (the top-level script)
//!
//! Function: tag FN | arity u8 | upvalue count u8
//!         | code length u32 | code bytes | one line u32 per code byte
//!         | constant count u16 | constant records
//!         | name marker u8 (0|1) | String record if 1
//! String:  tag STR | length u32 | raw bytes
//! ```
//! All integers are big-endian. Constant records are `NIL`, `FALSE`,
//! `TRUE`, `NUM` (f64 bits), `STR`, or a nested `FN` — the only value
//! shapes a compiled chunk can contain. The format is self-consistent
//! but not stable across versions; the version field guards that.
//!
//! Strings are re-interned on load, so decoded programs keep the
//! identity-equality guarantee.

use thiserror::Error;

use super::Chunk;
use crate::heap::Heap;
use crate::object::{Obj, ObjFunction, ObjRef};
use crate::value::Value;

/// File magic for compiled programs
pub const BYTECODE_MAGIC: &[u8; 4] = b"BSTC";

/// Current bytecode format version
///
/// Bumped on any backward-incompatible change; the loader rejects files
/// with a different version rather than misinterpreting them.
pub const BYTECODE_VERSION: u16 = 1;

/// Deepest allowed function nesting in a bytecode file
const MAX_FUNCTION_DEPTH: usize = 64;

const TAG_NIL: u8 = 0x00;
const TAG_FALSE: u8 = 0x01;
const TAG_TRUE: u8 = 0x02;
const TAG_NUMBER: u8 = 0x03;
const TAG_STRING: u8 = 0x04;
const TAG_FUNCTION: u8 = 0x05;

/// Failure to load a compiled program
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("invalid bytecode file: too short")]
    TooShort,
    #[error("invalid bytecode file: bad magic number; this may not be a Basalt bytecode file")]
    BadMagic,
    #[error(
        "bytecode version mismatch: file has version {found}, but this runtime supports \
         version {supported}; recompile the source with the current compiler"
    )]
    VersionMismatch { found: u16, supported: u16 },
    #[error("invalid bytecode file: checksum mismatch")]
    ChecksumMismatch,
    #[error("invalid bytecode: {0} truncated")]
    Truncated(&'static str),
    #[error("invalid bytecode: unknown value tag {0:#04x}")]
    UnknownTag(u8),
    #[error("invalid bytecode: {0}")]
    Malformed(&'static str),
}

/// Serialize a compiled top-level function to the `.bstc` format
pub fn encode_program(heap: &Heap, function: ObjRef) -> Vec<u8> {
    let mut payload = Vec::new();
    write_function(heap, function, &mut payload);

    let mut bytes = Vec::with_capacity(payload.len() + 10);
    bytes.extend_from_slice(BYTECODE_MAGIC);
    bytes.extend_from_slice(&BYTECODE_VERSION.to_be_bytes());
    bytes.extend_from_slice(&crc32fast::hash(&payload).to_be_bytes());
    bytes.extend_from_slice(&payload);
    bytes
}

/// Load a compiled program, re-interning its strings into `heap`
///
/// The returned function is not yet rooted; callers must make it
/// reachable (the VM pushes it before its first allocation).
pub fn decode_program(heap: &mut Heap, bytes: &[u8]) -> Result<ObjRef, DecodeError> {
    if bytes.len() < 10 {
        return Err(DecodeError::TooShort);
    }
    if &bytes[0..4] != BYTECODE_MAGIC {
        return Err(DecodeError::BadMagic);
    }
    let version = u16::from_be_bytes([bytes[4], bytes[5]]);
    if version != BYTECODE_VERSION {
        return Err(DecodeError::VersionMismatch {
            found: version,
            supported: BYTECODE_VERSION,
        });
    }
    let checksum = u32::from_be_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]);
    let payload = &bytes[10..];
    if crc32fast::hash(payload) != checksum {
        return Err(DecodeError::ChecksumMismatch);
    }

    let mut reader = Reader::new(payload);
    let function = read_function(heap, &mut reader, 0)?;
    if !reader.is_at_end() {
        return Err(DecodeError::Malformed("trailing bytes after program"));
    }
    Ok(function)
}

// === Writing ===

fn write_function(heap: &Heap, function: ObjRef, out: &mut Vec<u8>) {
    let f = heap.function(function);
    out.push(TAG_FUNCTION);
    out.push(f.arity);
    out.push(f.upvalue_count);

    out.extend_from_slice(&(f.chunk.code.len() as u32).to_be_bytes());
    out.extend_from_slice(&f.chunk.code);
    for &line in &f.chunk.lines {
        out.extend_from_slice(&line.to_be_bytes());
    }

    out.extend_from_slice(&(f.chunk.constants.len() as u16).to_be_bytes());
    for &constant in &f.chunk.constants {
        write_value(heap, constant, out);
    }

    match f.name {
        Some(name) => {
            out.push(1);
            write_string(heap, name, out);
        }
        None => out.push(0),
    }
}

fn write_value(heap: &Heap, value: Value, out: &mut Vec<u8>) {
    match value {
        Value::Nil => out.push(TAG_NIL),
        Value::Bool(false) => out.push(TAG_FALSE),
        Value::Bool(true) => out.push(TAG_TRUE),
        Value::Number(n) => {
            out.push(TAG_NUMBER);
            out.extend_from_slice(&n.to_bits().to_be_bytes());
        }
        Value::Obj(r) => match heap.get(r) {
            Obj::String(_) => write_string(heap, r, out),
            Obj::Function(_) => write_function(heap, r, out),
            // The compiler only ever places the above in constant pools
            _ => unreachable!("non-constant object in constant pool"),
        },
    }
}

fn write_string(heap: &Heap, string: ObjRef, out: &mut Vec<u8>) {
    let s = heap.string(string);
    out.push(TAG_STRING);
    out.extend_from_slice(&(s.chars.len() as u32).to_be_bytes());
    out.extend_from_slice(s.chars.as_bytes());
}

// === Reading ===

struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn is_at_end(&self) -> bool {
        self.offset >= self.bytes.len()
    }

    fn read_u8(&mut self, what: &'static str) -> Result<u8, DecodeError> {
        let byte = *self
            .bytes
            .get(self.offset)
            .ok_or(DecodeError::Truncated(what))?;
        self.offset += 1;
        Ok(byte)
    }

    fn read_u16(&mut self, what: &'static str) -> Result<u16, DecodeError> {
        let slice = self.read_slice(2, what)?;
        Ok(u16::from_be_bytes([slice[0], slice[1]]))
    }

    fn read_u32(&mut self, what: &'static str) -> Result<u32, DecodeError> {
        let slice = self.read_slice(4, what)?;
        Ok(u32::from_be_bytes([slice[0], slice[1], slice[2], slice[3]]))
    }

    fn read_slice(&mut self, len: usize, what: &'static str) -> Result<&'a [u8], DecodeError> {
        let end = self
            .offset
            .checked_add(len)
            .ok_or(DecodeError::Truncated(what))?;
        if end > self.bytes.len() {
            return Err(DecodeError::Truncated(what));
        }
        let slice = &self.bytes[self.offset..end];
        self.offset = end;
        Ok(slice)
    }
}

fn read_function(
    heap: &mut Heap,
    reader: &mut Reader<'_>,
    depth: usize,
) -> Result<ObjRef, DecodeError> {
    if depth > MAX_FUNCTION_DEPTH {
        return Err(DecodeError::Malformed("function nesting too deep"));
    }
    let tag = reader.read_u8("function tag")?;
    if tag != TAG_FUNCTION {
        return Err(DecodeError::UnknownTag(tag));
    }
    read_function_body(heap, reader, depth)
}

fn read_function_body(
    heap: &mut Heap,
    reader: &mut Reader<'_>,
    depth: usize,
) -> Result<ObjRef, DecodeError> {
    let arity = reader.read_u8("arity")?;
    let upvalue_count = reader.read_u8("upvalue count")?;

    let code_len = reader.read_u32("code length")? as usize;
    let code = reader.read_slice(code_len, "code")?.to_vec();
    let mut lines = Vec::with_capacity(code_len);
    for _ in 0..code_len {
        lines.push(reader.read_u32("line table")?);
    }

    let constant_count = reader.read_u16("constant count")? as usize;
    let mut constants = Vec::with_capacity(constant_count);
    for _ in 0..constant_count {
        constants.push(read_value(heap, reader, depth)?);
    }

    let name = match reader.read_u8("name marker")? {
        0 => None,
        1 => Some(read_string(heap, reader)?),
        _ => return Err(DecodeError::Malformed("name marker must be 0 or 1")),
    };

    let chunk = Chunk {
        code,
        lines,
        constants,
    };
    Ok(heap.alloc(Obj::Function(ObjFunction {
        arity,
        upvalue_count,
        chunk: std::rc::Rc::new(chunk),
        name,
    })))
}

fn read_value(
    heap: &mut Heap,
    reader: &mut Reader<'_>,
    depth: usize,
) -> Result<Value, DecodeError> {
    let tag = reader.read_u8("value tag")?;
    match tag {
        TAG_NIL => Ok(Value::Nil),
        TAG_FALSE => Ok(Value::Bool(false)),
        TAG_TRUE => Ok(Value::Bool(true)),
        TAG_NUMBER => {
            let bits = reader.read_slice(8, "number")?;
            let mut raw = [0u8; 8];
            raw.copy_from_slice(bits);
            Ok(Value::Number(f64::from_bits(u64::from_be_bytes(raw))))
        }
        TAG_STRING => Ok(Value::Obj(read_string_body(heap, reader)?)),
        TAG_FUNCTION => {
            if depth + 1 > MAX_FUNCTION_DEPTH {
                return Err(DecodeError::Malformed("function nesting too deep"));
            }
            Ok(Value::Obj(read_function_body(heap, reader, depth + 1)?))
        }
        other => Err(DecodeError::UnknownTag(other)),
    }
}

fn read_string(heap: &mut Heap, reader: &mut Reader<'_>) -> Result<ObjRef, DecodeError> {
    let tag = reader.read_u8("string tag")?;
    if tag != TAG_STRING {
        return Err(DecodeError::UnknownTag(tag));
    }
    read_string_body(heap, reader)
}

fn read_string_body(heap: &mut Heap, reader: &mut Reader<'_>) -> Result<ObjRef, DecodeError> {
    let len = reader.read_u32("string length")? as usize;
    let bytes = reader.read_slice(len, "string bytes")?;
    let chars = std::str::from_utf8(bytes)
        .map_err(|_| DecodeError::Malformed("string is not valid UTF-8"))?;
    Ok(heap.intern(chars))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Opcode;
    use pretty_assertions::assert_eq;
    use std::rc::Rc;

    fn sample_program(heap: &mut Heap) -> ObjRef {
        let name = heap.intern("inner");
        let hello = heap.intern("hello");

        let mut inner_chunk = Chunk::new();
        inner_chunk.write_op(Opcode::Nil, 3);
        inner_chunk.write_op(Opcode::Return, 3);
        let inner = heap.alloc(Obj::Function(ObjFunction {
            arity: 2,
            upvalue_count: 1,
            chunk: Rc::new(inner_chunk),
            name: Some(name),
        }));

        let mut chunk = Chunk::new();
        let constant = chunk.add_constant(Value::Number(1.5));
        chunk.add_constant(Value::Obj(hello));
        chunk.add_constant(Value::Obj(inner));
        chunk.add_constant(Value::Bool(true));
        chunk.add_constant(Value::Nil);
        chunk.write_op(Opcode::Constant, 1);
        chunk.write(constant as u8, 1);
        chunk.write_op(Opcode::Print, 1);
        heap.alloc(Obj::Function(ObjFunction {
            arity: 0,
            upvalue_count: 0,
            chunk: Rc::new(chunk),
            name: None,
        }))
    }

    #[test]
    fn test_round_trip_is_stable() {
        let mut heap = Heap::new();
        let program = sample_program(&mut heap);
        let encoded = encode_program(&heap, program);

        let decoded = decode_program(&mut heap, &encoded).unwrap();
        let re_encoded = encode_program(&heap, decoded);
        assert_eq!(encoded, re_encoded);

        let f = heap.function(decoded);
        assert_eq!(f.arity, 0);
        assert_eq!(f.chunk.constants.len(), 5);
        assert_eq!(f.chunk.code.len(), f.chunk.lines.len());
    }

    #[test]
    fn test_decoded_strings_are_interned() {
        let mut heap = Heap::new();
        let program = sample_program(&mut heap);
        let encoded = encode_program(&heap, program);
        let decoded = decode_program(&mut heap, &encoded).unwrap();

        let existing = heap.intern("hello");
        let f = heap.function(decoded);
        assert_eq!(f.chunk.constants[1], Value::Obj(existing));
    }

    #[test]
    fn test_rejects_bad_magic() {
        let mut heap = Heap::new();
        assert_eq!(
            decode_program(&mut heap, b"NOPE\x00\x01\x00\x00\x00\x00"),
            Err(DecodeError::BadMagic)
        );
    }

    #[test]
    fn test_rejects_wrong_version() {
        let mut heap = Heap::new();
        let program = sample_program(&mut heap);
        let mut encoded = encode_program(&heap, program);
        encoded[5] = BYTECODE_VERSION as u8 + 1;
        assert!(matches!(
            decode_program(&mut heap, &encoded),
            Err(DecodeError::VersionMismatch { .. })
        ));
    }

    #[test]
    fn test_rejects_corrupted_payload() {
        let mut heap = Heap::new();
        let program = sample_program(&mut heap);
        let mut encoded = encode_program(&heap, program);
        let last = encoded.len() - 1;
        encoded[last] ^= 0xff;
        assert_eq!(
            decode_program(&mut heap, &encoded),
            Err(DecodeError::ChecksumMismatch)
        );
    }

    #[test]
    fn test_rejects_truncation_at_every_length() {
        let mut heap = Heap::new();
        let program = sample_program(&mut heap);
        let encoded = encode_program(&heap, program);
        for len in 0..encoded.len() {
            assert!(
                decode_program(&mut heap, &encoded[..len]).is_err(),
                "truncation to {} bytes must not decode",
                len
            );
        }
    }
}
