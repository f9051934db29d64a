//! Jump stub encoders used by trampolines and the export patch

/// x64 absolute jump instruction (14 bytes)
/// FF 25 00 00 00 00 [8-byte address]
pub const X64_ABS_JMP_SIZE: usize = 14;

/// Generate x64 absolute jump to target address
pub fn generate_abs_jump(target: u64) -> [u8; X64_ABS_JMP_SIZE] {
    let mut bytes = [0u8; X64_ABS_JMP_SIZE];

    // JMP [RIP+0], target follows the instruction
    bytes[..6].copy_from_slice(&[0xFF, 0x25, 0x00, 0x00, 0x00, 0x00]);
    bytes[6..14].copy_from_slice(&target.to_le_bytes());

    bytes
}

/// `jmp rel32` (5 bytes)
pub const REL_JMP_SIZE: usize = 5;

/// Generate `jmp rel32` at `from` targeting `to`.
///
/// The displacement wraps modulo 2^32, which reaches every address of a
/// 32-bit address space.
pub fn generate_rel_jump32(from: u32, to: u32) -> [u8; REL_JMP_SIZE] {
    let displacement = to.wrapping_sub(from.wrapping_add(REL_JMP_SIZE as u32));

    let mut bytes = [0u8; REL_JMP_SIZE];
    bytes[0] = 0xE9;
    bytes[1..5].copy_from_slice(&displacement.to_le_bytes());
    bytes
}

/// NOP instruction
pub const NOP: u8 = 0x90;

pub fn generate_nops(count: usize) -> Vec<u8> {
    vec![NOP; count]
}

/// Size of the jump stub written by [`jump_stub`] on this target
#[cfg(target_pointer_width = "64")]
pub const JUMP_STUB_SIZE: usize = X64_ABS_JMP_SIZE;

#[cfg(target_pointer_width = "32")]
pub const JUMP_STUB_SIZE: usize = REL_JMP_SIZE;

/// Unconditional jump placed at `from` that lands on `to`, clobbering no
/// registers.
pub fn jump_stub(from: usize, to: usize) -> Vec<u8> {
    jump_stub_for(usize::BITS, from, to)
}

/// [`jump_stub`] for code of the given bitness
pub fn jump_stub_for(bitness: u32, from: usize, to: usize) -> Vec<u8> {
    if bitness == 64 {
        generate_abs_jump(to as u64).to_vec()
    } else {
        generate_rel_jump32(from as u32, to as u32).to_vec()
    }
}
