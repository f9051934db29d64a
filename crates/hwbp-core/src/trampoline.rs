//! Continuation ("trampoline") blocks
//!
//! A trampoline holds a relocated copy of one or more instructions followed
//! by a jump back to the first byte after them. Redirecting a trapped thread
//! here executes the watched instruction without re-triggering its debug
//! register.

use crate::disasm::{
    is_relative_branch, is_short_only_branch, DecodedInstruction, MAX_INSTRUCTION_LEN,
};
use crate::hooks::{jump_stub, jump_stub_for, JUMP_STUB_SIZE};
use crate::memory::{read_bytes, ExecutableMemory, TRAMPOLINE_ALLOC_SIZE};
use crate::traits::InstructionDecoder;
use hwbp_common::{Error, Result};
use iced_x86::{Decoder, DecoderOptions, Encoder};
use std::sync::Arc;
use tracing::{debug, trace};

/// Re-home `code`, taken from `source_ip`, so it behaves the same when run
/// from `dest_ip`.
///
/// Position-independent instructions are copied verbatim. RIP-relative
/// operands and relative branches are re-encoded against the new address,
/// short branches in their near form.
pub fn relocate(code: &[u8], source_ip: usize, dest_ip: usize, bitness: u32) -> Result<Vec<u8>> {
    let mut decoder = Decoder::with_ip(bitness, code, source_ip as u64, DecoderOptions::NONE);
    let mut output = Vec::with_capacity(code.len() + 16);
    let mut consumed = 0usize;

    while decoder.can_decode() {
        let mut instr = decoder.decode();
        if instr.is_invalid() {
            return Err(Error::Decode {
                address: source_ip + consumed,
            });
        }
        let len = instr.len();
        let new_ip = dest_ip + output.len();

        if is_short_only_branch(&instr) {
            output.extend(expand_short_branch(
                &code[consumed..consumed + len],
                new_ip,
                instr.near_branch_target() as usize,
                bitness,
            ));
        } else if instr.is_ip_rel_memory_operand() || is_relative_branch(&instr) {
            instr.as_near_branch();
            let mut encoder = Encoder::new(bitness);
            encoder.encode(&instr, new_ip as u64).map_err(|e| {
                Error::Relocation(format!(
                    "cannot move instruction at {:#x} to {:#x}: {}",
                    instr.ip(),
                    new_ip,
                    e
                ))
            })?;
            output.extend_from_slice(&encoder.take_buffer());
        } else {
            output.extend_from_slice(&code[consumed..consumed + len]);
        }
        consumed += len;
    }

    if consumed != code.len() || output.is_empty() {
        return Err(Error::Relocation(format!(
            "{} of {} bytes at {:#x} decoded",
            consumed,
            code.len(),
            source_ip
        )));
    }
    Ok(output)
}

/// Rewrite a branch that has no near form so it reaches `target` from
/// anywhere:
///
/// ```text
///         <branch> taken      ; rel8 = 2
///         jmp short done
/// taken:  <jump stub to target>
/// done:
/// ```
fn expand_short_branch(bytes: &[u8], ip: usize, target: usize, bitness: u32) -> Vec<u8> {
    let mut out = bytes.to_vec();
    if let Some(rel8) = out.last_mut() {
        *rel8 = 2;
    }
    let stub = jump_stub_for(bitness, ip + bytes.len() + 2, target);
    out.extend_from_slice(&[0xEB, stub.len() as u8]);
    out.extend_from_slice(&stub);
    out
}

/// Relocated instructions plus the jump back
#[derive(Debug)]
pub struct TrampolineBlock {
    memory: ExecutableMemory,
    source: usize,
    original: Vec<u8>,
    code_len: usize,
}

impl TrampolineBlock {
    /// Entry point of the block
    pub fn address(&self) -> usize {
        self.memory.address()
    }

    /// Address the instructions were copied from
    pub fn source(&self) -> usize {
        self.source
    }

    /// Original bytes the block was built from, unmodified
    pub fn original_bytes(&self) -> &[u8] {
        &self.original
    }

    /// Where the block jumps once the copied instructions have run
    pub fn continuation(&self) -> usize {
        self.source + self.original.len()
    }

    /// Relocated code followed by the jump stub
    pub fn code(&self) -> &[u8] {
        &self.memory.bytes()[..self.code_len]
    }
}

/// Builds trampolines for execute breakpoints and export patches
#[derive(Clone)]
pub struct TrampolineBuilder {
    decoder: Arc<dyn InstructionDecoder>,
}

impl TrampolineBuilder {
    pub fn new(decoder: Arc<dyn InstructionDecoder>) -> Self {
        Self { decoder }
    }

    /// Decode the instruction at `address`.
    ///
    /// # Safety
    /// `address` must point at mapped, readable code with at least
    /// `MAX_INSTRUCTION_LEN` readable bytes.
    pub unsafe fn decode_at(&self, address: usize) -> Result<DecodedInstruction> {
        let code = read_bytes(address, MAX_INSTRUCTION_LEN);
        self.decoder.decode(&code, address)
    }

    /// Follow a direct near `call`/`jmp` at `address` once, so the watch
    /// lands on the function body instead of a thunk.
    ///
    /// # Safety
    /// Same contract as [`decode_at`](Self::decode_at).
    pub unsafe fn resolve_execute_target(&self, address: usize) -> Result<usize> {
        let instr = self.decode_at(address)?;
        match instr.branch {
            Some(branch) => {
                debug!(
                    "{:?} at {:#x} redirects watch to {:#x}",
                    branch.kind, address, branch.target
                );
                Ok(branch.target)
            }
            None => Ok(address),
        }
    }

    /// Build the continuation block for an execute breakpoint at `address`.
    /// Returns the address actually watched and its trampoline.
    ///
    /// # Safety
    /// Same contract as [`decode_at`](Self::decode_at), for both `address`
    /// and any near branch target it resolves to.
    pub unsafe fn build_for_breakpoint(&self, address: usize) -> Result<(usize, TrampolineBlock)> {
        let watched = self.resolve_execute_target(address)?;
        let instr = self.decode_at(watched)?;
        let block = self.build(watched, instr.bytes, instr.needs_rel32_reach)?;
        Ok((watched, block))
    }

    /// Build a trampoline covering whole instructions at `address` spanning
    /// at least `min_len` bytes.
    ///
    /// # Safety
    /// `address` must point at readable code at least
    /// `min_len + MAX_INSTRUCTION_LEN` bytes long.
    pub unsafe fn build_for_patch(&self, address: usize, min_len: usize) -> Result<TrampolineBlock> {
        let mut original = Vec::new();
        let mut needs_reach = false;
        let mut next = address;
        while next - address < min_len {
            let instr = self.decode_at(next)?;
            next = instr.end();
            needs_reach |= instr.needs_rel32_reach;
            original.extend_from_slice(&instr.bytes);
        }
        self.build(address, original, needs_reach)
    }

    fn build(&self, source: usize, original: Vec<u8>, needs_reach: bool) -> Result<TrampolineBlock> {
        let mut memory = ExecutableMemory::allocate_near(Some(source), TRAMPOLINE_ALLOC_SIZE)?;
        if needs_reach && !memory.within_rel32(source) {
            return Err(Error::Relocation(format!(
                "no trampoline within rel32 reach of {:#x} (got {:#x})",
                source,
                memory.address()
            )));
        }

        let relocated = relocate(
            &original,
            source,
            memory.address(),
            self.decoder.bitness(),
        )?;
        if relocated.len() + JUMP_STUB_SIZE > memory.len() {
            return Err(Error::Relocation(format!(
                "{} relocated bytes from {:#x} do not fit a trampoline",
                relocated.len(),
                source
            )));
        }

        let stub_at = memory.address() + relocated.len();
        let stub = jump_stub(stub_at, source + original.len());
        memory.write(0, &relocated)?;
        memory.write(relocated.len(), &stub)?;

        trace!(
            "Trampoline for {:#x} at {:#x} ({} + {} bytes)",
            source,
            memory.address(),
            relocated.len(),
            stub.len()
        );

        Ok(TrampolineBlock {
            memory,
            source,
            original,
            code_len: relocated.len() + stub.len(),
        })
    }
}
