//! Debug control (DR7) and status (DR6) register images
//!
//! DR7 layout for slot `i` (0..4):
//!
//! | bits            | field          |
//! |-----------------|----------------|
//! | `2i`            | local enable   |
//! | `2i + 1`        | global enable  |
//! | `16 + 4i ..+2`  | condition (RW) |
//! | `18 + 4i ..+2`  | length (LEN)   |
//!
//! Only local enables are ever set. Global enables are left as found.

use hwbp_common::{Condition, WatchLength};

/// Number of address slots (DR0-DR3)
pub const SLOT_COUNT: usize = 4;

const CONDITION_SHIFT: u32 = 16;
const LENGTH_SHIFT: u32 = 18;
const FIELD_STRIDE: u32 = 4;
const FIELD_MASK: u64 = 0b11;

/// DR6 single-step flag
const DR6_BS: u64 = 1 << 14;
const DR6_HIT_MASK: u64 = 0b1111;

#[inline]
const fn enable_bit(slot: usize) -> u64 {
    1 << (2 * slot)
}

#[inline]
const fn condition_shift(slot: usize) -> u32 {
    CONDITION_SHIFT + FIELD_STRIDE * slot as u32
}

#[inline]
const fn length_shift(slot: usize) -> u32 {
    LENGTH_SHIFT + FIELD_STRIDE * slot as u32
}

/// Decoded view over a raw DR7 value.
///
/// Operations on a slot index `>= SLOT_COUNT` leave the image unchanged
/// and queries on such an index report a disabled slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ControlRegisterImage(u64);

impl ControlRegisterImage {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn to_raw(self) -> u64 {
        self.0
    }

    pub const fn is_slot_enabled(self, slot: usize) -> bool {
        slot < SLOT_COUNT && self.0 & enable_bit(slot) != 0
    }

    pub fn slot_condition(self, slot: usize) -> Option<Condition> {
        (slot < SLOT_COUNT)
            .then(|| Condition::from_bits((self.0 >> condition_shift(slot)) & FIELD_MASK))
    }

    pub fn slot_length(self, slot: usize) -> Option<WatchLength> {
        (slot < SLOT_COUNT)
            .then(|| WatchLength::from_bits((self.0 >> length_shift(slot)) & FIELD_MASK))
    }

    /// Enable `slot` with the given condition and length. Bits belonging to
    /// other slots are untouched.
    pub fn set_slot(&mut self, slot: usize, condition: Condition, length: WatchLength) {
        if slot >= SLOT_COUNT {
            return;
        }
        let cond_shift = condition_shift(slot);
        let len_shift = length_shift(slot);

        self.0 &= !((FIELD_MASK << cond_shift) | (FIELD_MASK << len_shift));
        self.0 |= condition.bits() << cond_shift;
        self.0 |= length.bits() << len_shift;
        self.0 |= enable_bit(slot);
    }

    /// Disable `slot` and zero its condition and length fields.
    pub fn clear_slot(&mut self, slot: usize) {
        if slot >= SLOT_COUNT {
            return;
        }
        self.0 &= !enable_bit(slot);
        self.0 &= !(FIELD_MASK << condition_shift(slot));
        self.0 &= !(FIELD_MASK << length_shift(slot));
    }

    /// Lowest slot whose local enable bit is clear
    pub fn first_free_slot(self) -> Option<usize> {
        (0..SLOT_COUNT).find(|&slot| !self.is_slot_enabled(slot))
    }

    pub fn enabled_slots(self) -> impl Iterator<Item = usize> {
        (0..SLOT_COUNT).filter(move |&slot| self.is_slot_enabled(slot))
    }
}

impl From<u64> for ControlRegisterImage {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

/// DR6 as reported in an exception context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DebugStatus(u64);

impl DebugStatus {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn to_raw(self) -> u64 {
        self.0
    }

    /// Slots whose condition was met (B0-B3)
    pub fn hit_slots(self) -> impl Iterator<Item = usize> {
        let bits = self.0 & DR6_HIT_MASK;
        (0..SLOT_COUNT).filter(move |&slot| bits & (1 << slot) != 0)
    }

    pub const fn is_slot_hit(self, slot: usize) -> bool {
        slot < SLOT_COUNT && self.0 & (1 << slot) != 0
    }

    /// Trap came from TF, not from a debug register
    pub const fn is_single_step(self) -> bool {
        self.0 & DR6_BS != 0
    }
}
