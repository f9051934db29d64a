//! Breakpoint handles and their per-breakpoint state

use crate::context::NativeContext;
use crate::manager::Shared;
use crate::trampoline::TrampolineBlock;
use hwbp_common::{
    BreakpointId, BreakpointInfo, Condition, Error, HandlerKind, Result, Scope, WatchLength,
};
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Counter for generating unique breakpoint IDs
static BREAKPOINT_COUNTER: AtomicU32 = AtomicU32::new(1);

pub fn next_breakpoint_id() -> BreakpointId {
    BreakpointId(BREAKPOINT_COUNTER.fetch_add(1, Ordering::SeqCst))
}

/// State handed to a `Notify` callback.
///
/// The context is the faulting thread's. Changes to any register, the
/// instruction pointer included, take effect when the thread resumes.
pub struct TrapFrame<'a> {
    pub breakpoint: BreakpointId,
    pub code: u32,
    /// Where the exception was raised
    pub address: usize,
    /// The address being watched
    pub watched: usize,
    pub context: &'a mut NativeContext,
}

pub type NotifyFn = dyn Fn(&mut TrapFrame<'_>) + Send + Sync;

/// What happens when a breakpoint fires
#[derive(Clone, Default)]
pub enum Handler {
    /// Resume transparently
    #[default]
    None,
    /// Run a callback on the faulting thread, then resume
    Notify(Arc<NotifyFn>),
    /// Move the faulting thread to this address. Execute watches only.
    Hook(usize),
}

impl Handler {
    pub fn notify<F>(callback: F) -> Self
    where
        F: Fn(&mut TrapFrame<'_>) + Send + Sync + 'static,
    {
        Handler::Notify(Arc::new(callback))
    }

    pub fn hook(target: usize) -> Self {
        Handler::Hook(target)
    }

    pub fn kind(&self) -> HandlerKind {
        match self {
            Handler::None => HandlerKind::None,
            Handler::Notify(_) => HandlerKind::Notify,
            Handler::Hook(_) => HandlerKind::Hook,
        }
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handler::None => write!(f, "None"),
            Handler::Notify(_) => write!(f, "Notify(..)"),
            Handler::Hook(target) => write!(f, "Hook({:#x})", target),
        }
    }
}

/// Parameters fixed by a successful `create()`
#[derive(Debug)]
pub(crate) struct Armed {
    pub address: usize,
    pub length: WatchLength,
    pub condition: Condition,
    pub slot: usize,
    pub handler: Handler,
    pub trampoline: Option<TrampolineBlock>,
    /// Thread that called `create()`
    pub owner_thread: u32,
}

/// Copy of [`Armed`] taken so callbacks run without holding its lock
#[derive(Debug, Clone)]
pub(crate) struct ArmedView {
    pub address: usize,
    pub length: WatchLength,
    pub condition: Condition,
    pub slot: usize,
    pub handler: Handler,
    pub trampoline: Option<usize>,
}

#[derive(Debug)]
pub(crate) struct BreakpointState {
    pub id: BreakpointId,
    pub scope: Scope,
    pub run_once: bool,
    pub disabled: AtomicBool,
    pub hits: AtomicU64,
    pub armed: RwLock<Option<Armed>>,
}

impl BreakpointState {
    pub fn new(scope: Scope, run_once: bool) -> Self {
        Self {
            id: next_breakpoint_id(),
            scope,
            run_once,
            disabled: AtomicBool::new(false),
            hits: AtomicU64::new(0),
            armed: RwLock::new(None),
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    pub fn view(&self) -> Option<ArmedView> {
        self.armed.read().as_ref().map(|armed| ArmedView {
            address: armed.address,
            length: armed.length,
            condition: armed.condition,
            slot: armed.slot,
            handler: armed.handler.clone(),
            trampoline: armed.trampoline.as_ref().map(TrampolineBlock::address),
        })
    }

    pub fn info(&self) -> BreakpointInfo {
        let armed = self.armed.read();
        BreakpointInfo {
            id: self.id,
            address: armed.as_ref().map_or(0, |a| a.address),
            length: armed.as_ref().map_or(WatchLength::One, |a| a.length),
            condition: armed.as_ref().map_or(Condition::Execute, |a| a.condition),
            slot: armed.as_ref().map(|a| a.slot),
            scope: self.scope,
            run_once: self.run_once,
            disabled: self.is_disabled(),
            handler: armed
                .as_ref()
                .map_or(HandlerKind::None, |a| a.handler.kind()),
            hit_count: self.hits.load(Ordering::Relaxed),
            continuation: armed
                .as_ref()
                .and_then(|a| a.trampoline.as_ref().map(TrampolineBlock::address)),
        }
    }
}

/// One hardware breakpoint.
///
/// Registered with its manager from construction until drop. Dropping it
/// disables it, deregisters it and frees its trampoline.
pub struct Breakpoint {
    pub(crate) state: Arc<BreakpointState>,
    pub(crate) shared: Arc<Shared>,
}

impl Breakpoint {
    pub fn id(&self) -> BreakpointId {
        self.state.id
    }

    pub fn scope(&self) -> Scope {
        self.state.scope
    }

    pub fn is_armed(&self) -> bool {
        self.state.armed.read().is_some() && !self.state.is_disabled()
    }

    pub fn is_disabled(&self) -> bool {
        self.state.is_disabled()
    }

    pub fn slot(&self) -> Option<usize> {
        self.state.armed.read().as_ref().map(|a| a.slot)
    }

    /// Address actually watched, after following a call/jmp thunk
    pub fn address(&self) -> Option<usize> {
        self.state.armed.read().as_ref().map(|a| a.address)
    }

    pub fn hit_count(&self) -> u64 {
        self.state.hits.load(Ordering::Relaxed)
    }

    pub fn info(&self) -> BreakpointInfo {
        self.state.info()
    }

    /// Arm the breakpoint and return the debug register slot it occupies.
    ///
    /// Execute watches are always one byte wide. If the instruction at
    /// `address` is a direct near `call` or `jmp`, its destination is
    /// watched instead. A `Hook` handler on a data watch is downgraded to
    /// `Handler::None`.
    ///
    /// Fails with `AlreadyArmed` on a second call, `UnsupportedCondition`
    /// for `IoReadWrite`, and `ResourceExhausted` when the calling thread
    /// has no free slot.
    ///
    /// # Safety
    /// For `Condition::Execute`, `address` must point at mapped code and
    /// stay mapped while the breakpoint is armed. A `Hook` target must be
    /// code that can take over the trapped thread's state.
    pub unsafe fn create(
        &self,
        address: usize,
        length: WatchLength,
        condition: Condition,
        handler: Handler,
    ) -> Result<usize> {
        let id = self.state.id;
        if self.state.armed.read().is_some() {
            return Err(Error::AlreadyArmed(id.0));
        }
        if !condition.is_supported() {
            warn!("Breakpoint {}: {} watches are not supported", id, condition);
            return Err(Error::UnsupportedCondition(condition.to_string()));
        }

        let handler = match handler {
            Handler::Hook(_) if !condition.is_execute() => {
                warn!(
                    "Breakpoint {}: hook handler needs an execute watch, using none",
                    id
                );
                Handler::None
            }
            other => other,
        };

        let (watched, length, trampoline) = if condition.is_execute() {
            if length != WatchLength::One {
                debug!("Breakpoint {}: execute watch forced to one byte", id);
            }
            let (watched, block) = self.shared.builder.build_for_breakpoint(address)?;
            (watched, WatchLength::One, Some(block))
        } else {
            if !length.is_aligned(address) {
                warn!(
                    "Breakpoint {}: {:#x} is not aligned to {} bytes",
                    id,
                    address,
                    length.bytes()
                );
            }
            (address, length, None)
        };

        self.shared
            .arm(&self.state, watched, length, condition, handler, trampoline)
    }

    /// Disarm the breakpoint. It stays registered and cannot be re-armed.
    pub fn disable(&self) {
        self.shared.disable(&self.state);
    }

    /// Entry of the relocated copy of the watched instruction, for hook
    /// handlers that want to call the original. `None` for data watches
    /// and before `create()`.
    pub fn continuation_buffer(&self) -> Option<usize> {
        self.state
            .armed
            .read()
            .as_ref()
            .and_then(|a| a.trampoline.as_ref().map(TrampolineBlock::address))
    }
}

impl Drop for Breakpoint {
    fn drop(&mut self) {
        self.shared.disable(&self.state);
        self.shared.deregister(&self.state);
    }
}

impl fmt::Debug for Breakpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Breakpoint")
            .field("id", &self.state.id)
            .field("scope", &self.state.scope)
            .field("run_once", &self.state.run_once)
            .field("armed", &*self.state.armed.read())
            .field("disabled", &self.state.is_disabled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_breakpoint_id() {
        let id1 = next_breakpoint_id();
        let id2 = next_breakpoint_id();
        assert!(id2.0 > id1.0);
    }

    #[test]
    fn test_handler_kind() {
        assert_eq!(Handler::None.kind(), HandlerKind::None);
        assert_eq!(Handler::notify(|_| {}).kind(), HandlerKind::Notify);
        assert_eq!(Handler::hook(0x1000).kind(), HandlerKind::Hook);
        assert_eq!(format!("{:?}", Handler::hook(0x1000)), "Hook(0x1000)");
    }

    #[test]
    fn test_unarmed_state_info() {
        let state = BreakpointState::new(Scope::ThisThread, true);
        let info = state.info();
        assert_eq!(info.slot, None);
        assert!(!info.is_armed());
        assert!(info.run_once);
        assert!(state.view().is_none());
    }
}
