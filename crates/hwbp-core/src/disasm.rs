//! Instruction boundary decoding on top of iced-x86

use crate::traits::InstructionDecoder;
use hwbp_common::{Error, Result};
use iced_x86::{Decoder, DecoderOptions, Instruction, OpKind};

/// Longest legal x86 instruction
pub const MAX_INSTRUCTION_LEN: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchKind {
    Call,
    Jump,
}

/// Direct near `call rel32` / `jmp rel32`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NearBranch {
    pub kind: BranchKind,
    pub target: usize,
}

/// One decoded instruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedInstruction {
    pub address: usize,
    pub length: usize,
    pub bytes: Vec<u8>,
    /// Set for unconditional near calls and jumps, which breakpoints follow
    pub branch: Option<NearBranch>,
    /// Once relocated, only works within rel32 reach of `address`
    pub needs_rel32_reach: bool,
}

impl DecodedInstruction {
    pub fn end(&self) -> usize {
        self.address + self.length
    }
}

/// Any operand is a displacement from the instruction pointer
pub(crate) fn is_relative_branch(instr: &Instruction) -> bool {
    (0..instr.op_count()).any(|i| {
        matches!(
            instr.op_kind(i),
            OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64
        )
    })
}

/// `loop`, `loopcc` and `jcxz`-style branches, which only exist in rel8
/// form
pub(crate) fn is_short_only_branch(instr: &Instruction) -> bool {
    instr.is_loop() || instr.is_loopcc() || instr.is_jcx_short()
}

/// iced-x86 backed decoder
#[derive(Debug, Clone, Copy)]
pub struct IcedDecoder {
    bitness: u32,
}

impl IcedDecoder {
    pub fn new(bitness: u32) -> Self {
        Self { bitness }
    }

    /// Decoder for the architecture this crate was built for
    pub fn native() -> Self {
        Self::new(usize::BITS)
    }
}

impl Default for IcedDecoder {
    fn default() -> Self {
        Self::native()
    }
}

impl InstructionDecoder for IcedDecoder {
    fn decode(&self, code: &[u8], address: usize) -> Result<DecodedInstruction> {
        let mut decoder =
            Decoder::with_ip(self.bitness, code, address as u64, DecoderOptions::NONE);
        if !decoder.can_decode() {
            return Err(Error::Decode { address });
        }

        let instr = decoder.decode();
        if instr.is_invalid() {
            return Err(Error::Decode { address });
        }

        let length = instr.len();
        let branch = if instr.is_call_near() {
            Some(NearBranch {
                kind: BranchKind::Call,
                target: instr.near_branch_target() as usize,
            })
        } else if instr.is_jmp_near() {
            Some(NearBranch {
                kind: BranchKind::Jump,
                target: instr.near_branch_target() as usize,
            })
        } else {
            None
        };

        Ok(DecodedInstruction {
            address,
            length,
            bytes: code[..length].to_vec(),
            branch,
            needs_rel32_reach: self.bitness == 64
                && (instr.is_ip_rel_memory_operand()
                    || (is_relative_branch(&instr) && !is_short_only_branch(&instr))),
        })
    }

    fn bitness(&self) -> u32 {
        self.bitness
    }
}
