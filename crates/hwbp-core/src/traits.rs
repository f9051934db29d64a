//! Seams between the breakpoint logic and the platform
//!
//! The manager only talks to threads and instruction bytes through these
//! traits. The Win32 implementations live in `threads` and `disasm`.

use crate::context::DebugRegisterSet;
use crate::disasm::DecodedInstruction;
use hwbp_common::Result;

/// Per-thread debug register access
pub trait ThreadBackend: Send + Sync {
    /// ID of the calling thread
    fn current_thread_id(&self) -> u32;

    /// Every live thread of the current process
    fn thread_ids(&self) -> Result<Vec<u32>>;

    fn read_debug_registers(&self, thread_id: u32) -> Result<DebugRegisterSet>;

    fn write_debug_registers(&self, thread_id: u32, set: &DebugRegisterSet) -> Result<()>;
}

/// Single-instruction boundary decoder
pub trait InstructionDecoder: Send + Sync {
    /// Decode the first instruction of `code`, which was read from `address`.
    fn decode(&self, code: &[u8], address: usize) -> Result<DecodedInstruction>;

    /// 16, 32 or 64
    fn bitness(&self) -> u32;
}
