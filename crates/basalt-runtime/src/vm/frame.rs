//! Call frame representation

use std::rc::Rc;

use crate::bytecode::Chunk;
use crate::object::ObjRef;

/// One function activation
///
/// The chunk is cached out of the closure's function so instruction
/// decode never touches the heap; chunks are immutable after
/// compilation, so the cache cannot drift.
pub struct CallFrame {
    /// The closure being executed (a GC root while the frame is live)
    pub closure: ObjRef,
    /// The closure's function's chunk
    pub chunk: Rc<Chunk>,
    /// Offset of the next instruction byte in `chunk.code`
    pub ip: usize,
    /// Stack index of slot 0: the callee (or receiver), with arguments
    /// and locals above it
    pub base: usize,
}
