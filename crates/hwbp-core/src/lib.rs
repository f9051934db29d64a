//! User-mode hardware breakpoints
//!
//! Arms CPU debug registers on one or all threads of the current process,
//! services the resulting single-step exceptions from a vectored exception
//! handler, and hooks the thread-entry thunk so all-thread breakpoints
//! follow threads created later.
//!
//! ```no_run
//! use hwbp_core::{Handler, HwbpManager};
//! use hwbp_common::{Condition, HwbpConfig, Scope, WatchLength};
//!
//! # fn target() {}
//! # fn main() -> hwbp_common::Result<()> {
//! let manager = HwbpManager::new(HwbpConfig::default())?;
//! let bp = manager.breakpoint(Scope::AllThreads, false)?;
//! let slot = unsafe {
//!     bp.create(
//!         target as usize,
//!         WatchLength::One,
//!         Condition::Execute,
//!         Handler::notify(|frame| println!("hit {:#x}", frame.address)),
//!     )?
//! };
//! # let _ = slot;
//! # Ok(())
//! # }
//! ```

pub mod breakpoint;
pub mod context;
pub mod debug_regs;
pub mod disasm;
pub mod dispatch;
pub mod export_hook;
pub mod hooks;
pub mod manager;
pub mod memory;
pub mod pe;
#[cfg(windows)]
pub mod threads;
pub mod traits;
pub mod trampoline;

pub use breakpoint::{Breakpoint, Handler, TrapFrame};
pub use context::{DebugContext, DebugRegisterSet, NativeContext, SoftContext};
pub use debug_regs::{ControlRegisterImage, DebugStatus, SLOT_COUNT};
pub use dispatch::{Disposition, EXCEPTION_SINGLE_STEP};
pub use hwbp_common::{Error, Result};
pub use manager::HwbpManager;
pub use traits::*;
