//! Breakpoint-related types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Access type that triggers a hardware watch.
///
/// The discriminants are the two-bit R/W encodings of the debug control
/// register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    /// Instruction fetch at the watched address.
    Execute = 0b00,
    /// Encoded as `0b01`. On x86 hardware this fires on data writes.
    Read = 0b01,
    /// Data reads or writes.
    ReadWrite = 0b11,
    /// I/O port access. Only meaningful with CR4.DE set, which user mode
    /// cannot rely on.
    IoReadWrite = 0b10,
}

impl Condition {
    pub const fn bits(self) -> u64 {
        self as u64
    }

    pub const fn from_bits(bits: u64) -> Self {
        match bits & 0b11 {
            0b00 => Condition::Execute,
            0b01 => Condition::Read,
            0b10 => Condition::IoReadWrite,
            _ => Condition::ReadWrite,
        }
    }

    pub const fn is_execute(self) -> bool {
        matches!(self, Condition::Execute)
    }

    pub const fn is_supported(self) -> bool {
        !matches!(self, Condition::IoReadWrite)
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Execute => write!(f, "execute"),
            Condition::Read => write!(f, "read"),
            Condition::ReadWrite => write!(f, "read_write"),
            Condition::IoReadWrite => write!(f, "io_read_write"),
        }
    }
}

/// Width of the watched region. Discriminants are the LEN encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchLength {
    One = 0b00,
    /// Address must be word aligned
    Two = 0b01,
    /// Address must be dword aligned
    Four = 0b11,
    /// Address must be qword aligned
    Eight = 0b10,
}

impl WatchLength {
    pub const fn bits(self) -> u64 {
        self as u64
    }

    pub const fn from_bits(bits: u64) -> Self {
        match bits & 0b11 {
            0b00 => WatchLength::One,
            0b01 => WatchLength::Two,
            0b10 => WatchLength::Eight,
            _ => WatchLength::Four,
        }
    }

    pub fn from_bytes(size: usize) -> Option<Self> {
        match size {
            1 => Some(Self::One),
            2 => Some(Self::Two),
            4 => Some(Self::Four),
            8 => Some(Self::Eight),
            _ => None,
        }
    }

    pub const fn bytes(self) -> usize {
        match self {
            WatchLength::One => 1,
            WatchLength::Two => 2,
            WatchLength::Four => 4,
            WatchLength::Eight => 8,
        }
    }

    pub const fn is_aligned(self, address: usize) -> bool {
        address % self.bytes() == 0
    }
}

/// Which threads a breakpoint is armed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// Only the thread that called `create()`.
    ThisThread,
    /// Every live thread at creation time, and every thread started later.
    #[default]
    AllThreads,
}

/// Breakpoint ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BreakpointId(pub u32);

impl fmt::Display for BreakpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Handler variant without its payload, for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerKind {
    #[default]
    None,
    Notify,
    Hook,
}

/// Point-in-time view of a breakpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakpointInfo {
    pub id: BreakpointId,
    pub address: usize,
    pub length: WatchLength,
    pub condition: Condition,
    pub slot: Option<usize>,
    pub scope: Scope,
    pub run_once: bool,
    pub disabled: bool,
    pub handler: HandlerKind,
    pub hit_count: u64,
    pub continuation: Option<usize>,
}

impl BreakpointInfo {
    pub fn is_armed(&self) -> bool {
        self.slot.is_some() && !self.disabled
    }
}
