//! Register context access
//!
//! The dispatcher and the thread backend work through [`DebugContext`], so
//! the same code drives a real `CONTEXT` on Windows and [`SoftContext`]
//! everywhere else.

use crate::debug_regs::{ControlRegisterImage, DebugStatus, SLOT_COUNT};
use hwbp_common::{Condition, WatchLength};

#[cfg(all(windows, not(any(target_arch = "x86", target_arch = "x86_64"))))]
compile_error!("hwbp only supports x86 and x86_64 Windows targets");

/// Address registers DR0-DR3 plus DR7
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DebugRegisterSet {
    pub address: [usize; SLOT_COUNT],
    pub control: ControlRegisterImage,
}

impl DebugRegisterSet {
    pub fn arm(&mut self, slot: usize, address: usize, condition: Condition, length: WatchLength) {
        if slot >= SLOT_COUNT {
            return;
        }
        self.address[slot] = address;
        self.control.set_slot(slot, condition, length);
    }

    pub fn disarm(&mut self, slot: usize) {
        if slot >= SLOT_COUNT {
            return;
        }
        self.address[slot] = 0;
        self.control.clear_slot(slot);
    }

    /// True if `slot` is enabled and watching `address`
    pub fn holds(&self, slot: usize, address: usize) -> bool {
        self.control.is_slot_enabled(slot) && self.address[slot] == address
    }

    pub fn first_free_slot(&self) -> Option<usize> {
        self.control.first_free_slot()
    }
}

/// Register state of a trapped (or suspended) thread.
pub trait DebugContext {
    fn instruction_pointer(&self) -> usize;

    fn set_instruction_pointer(&mut self, ip: usize);

    fn debug_registers(&self) -> DebugRegisterSet;

    /// Write DR0-DR3 and DR7 back, and mark them as present in the context.
    fn apply_debug_registers(&mut self, set: &DebugRegisterSet);

    fn debug_status(&self) -> DebugStatus;

    fn clear_debug_status(&mut self);
}

/// Portable register context.
///
/// Stands in for the OS context on hosts without one, and lets the
/// dispatcher be driven from tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SoftContext {
    pub ip: usize,
    pub sp: usize,
    pub flags: usize,
    /// rax, rcx, rdx, rbx, rsp, rbp, rsi, rdi, r8-r15
    pub gpr: [usize; 16],
    pub dr: [usize; SLOT_COUNT],
    pub dr6: usize,
    pub dr7: usize,
}

impl DebugContext for SoftContext {
    fn instruction_pointer(&self) -> usize {
        self.ip
    }

    fn set_instruction_pointer(&mut self, ip: usize) {
        self.ip = ip;
    }

    fn debug_registers(&self) -> DebugRegisterSet {
        DebugRegisterSet {
            address: self.dr,
            control: ControlRegisterImage::from_raw(self.dr7 as u64),
        }
    }

    fn apply_debug_registers(&mut self, set: &DebugRegisterSet) {
        self.dr = set.address;
        self.dr7 = set.control.to_raw() as usize;
    }

    fn debug_status(&self) -> DebugStatus {
        DebugStatus::from_raw(self.dr6 as u64)
    }

    fn clear_debug_status(&mut self) {
        self.dr6 = 0;
    }
}

#[cfg(windows)]
pub use windows::Win32::System::Diagnostics::Debug::CONTEXT as NativeContext;

#[cfg(not(windows))]
pub type NativeContext = SoftContext;

#[cfg(windows)]
mod native {
    use super::*;
    use windows::Win32::System::Diagnostics::Debug::{CONTEXT, CONTEXT_FLAGS};

    /// CONTEXT_AMD64 | CONTEXT_DEBUG_REGISTERS
    #[cfg(target_arch = "x86_64")]
    pub const DEBUG_REGISTER_FLAGS: CONTEXT_FLAGS = CONTEXT_FLAGS(0x0010_0010);

    /// CONTEXT_i386 | CONTEXT_DEBUG_REGISTERS
    #[cfg(target_arch = "x86")]
    pub const DEBUG_REGISTER_FLAGS: CONTEXT_FLAGS = CONTEXT_FLAGS(0x0001_0010);

    /// Empty context that requests only the debug registers
    pub fn debug_register_context() -> CONTEXT {
        CONTEXT {
            ContextFlags: DEBUG_REGISTER_FLAGS,
            ..Default::default()
        }
    }

    #[cfg(target_arch = "x86_64")]
    impl DebugContext for CONTEXT {
        fn instruction_pointer(&self) -> usize {
            self.Rip as usize
        }

        fn set_instruction_pointer(&mut self, ip: usize) {
            self.Rip = ip as u64;
        }

        fn debug_registers(&self) -> DebugRegisterSet {
            DebugRegisterSet {
                address: [
                    self.Dr0 as usize,
                    self.Dr1 as usize,
                    self.Dr2 as usize,
                    self.Dr3 as usize,
                ],
                control: ControlRegisterImage::from_raw(self.Dr7),
            }
        }

        fn apply_debug_registers(&mut self, set: &DebugRegisterSet) {
            self.Dr0 = set.address[0] as u64;
            self.Dr1 = set.address[1] as u64;
            self.Dr2 = set.address[2] as u64;
            self.Dr3 = set.address[3] as u64;
            self.Dr7 = set.control.to_raw();
            self.ContextFlags = CONTEXT_FLAGS(self.ContextFlags.0 | DEBUG_REGISTER_FLAGS.0);
        }

        fn debug_status(&self) -> DebugStatus {
            DebugStatus::from_raw(self.Dr6)
        }

        fn clear_debug_status(&mut self) {
            self.Dr6 = 0;
        }
    }

    #[cfg(target_arch = "x86")]
    impl DebugContext for CONTEXT {
        fn instruction_pointer(&self) -> usize {
            self.Eip as usize
        }

        fn set_instruction_pointer(&mut self, ip: usize) {
            self.Eip = ip as u32;
        }

        fn debug_registers(&self) -> DebugRegisterSet {
            DebugRegisterSet {
                address: [
                    self.Dr0 as usize,
                    self.Dr1 as usize,
                    self.Dr2 as usize,
                    self.Dr3 as usize,
                ],
                control: ControlRegisterImage::from_raw(self.Dr7 as u64),
            }
        }

        fn apply_debug_registers(&mut self, set: &DebugRegisterSet) {
            self.Dr0 = set.address[0] as u32;
            self.Dr1 = set.address[1] as u32;
            self.Dr2 = set.address[2] as u32;
            self.Dr3 = set.address[3] as u32;
            self.Dr7 = set.control.to_raw() as u32;
            self.ContextFlags = CONTEXT_FLAGS(self.ContextFlags.0 | DEBUG_REGISTER_FLAGS.0);
        }

        fn debug_status(&self) -> DebugStatus {
            DebugStatus::from_raw(self.Dr6 as u64)
        }

        fn clear_debug_status(&mut self) {
            self.Dr6 = 0;
        }
    }
}

#[cfg(windows)]
pub use native::{debug_register_context, DEBUG_REGISTER_FLAGS};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_set_arm_and_holds() {
        let mut set = DebugRegisterSet::default();
        set.arm(2, 0x4000, Condition::ReadWrite, WatchLength::Four);
        assert!(set.holds(2, 0x4000));
        assert!(!set.holds(2, 0x4004));
        assert!(!set.holds(1, 0x4000));
        assert_eq!(set.first_free_slot(), Some(0));

        set.disarm(2);
        assert_eq!(set, DebugRegisterSet::default());
    }

    #[test]
    fn test_register_set_ignores_bad_slot() {
        let mut set = DebugRegisterSet::default();
        set.arm(SLOT_COUNT, 0x4000, Condition::Execute, WatchLength::One);
        assert_eq!(set, DebugRegisterSet::default());
    }

    #[test]
    fn test_soft_context_round_trip() {
        let mut ctx = SoftContext::default();
        let mut set = DebugRegisterSet::default();
        set.arm(0, 0x1234, Condition::Execute, WatchLength::One);
        ctx.apply_debug_registers(&set);
        assert_eq!(ctx.dr[0], 0x1234);
        assert_eq!(ctx.dr7 & 1, 1);
        assert_eq!(ctx.debug_registers(), set);

        ctx.dr6 = 0b0001;
        assert!(ctx.debug_status().is_slot_hit(0));
        ctx.clear_debug_status();
        assert_eq!(ctx.debug_status().to_raw(), 0);
    }

    #[test]
    fn test_native_context_ip() {
        let mut ctx = NativeContext::default();
        ctx.set_instruction_pointer(0x7000);
        assert_eq!(ctx.instruction_pointer(), 0x7000);
    }
}
