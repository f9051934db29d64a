//! Single-step exception dispatch
//!
//! Runs on the faulting thread inside the vectored exception handler. The
//! registry is snapshotted up front so callbacks may create, disable or
//! drop breakpoints without deadlocking.

use crate::breakpoint::{ArmedView, BreakpointState, Handler, TrapFrame};
use crate::context::{DebugContext, NativeContext};
use crate::manager::Shared;
use hwbp_common::HandlerKind;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{error, trace};

/// STATUS_SINGLE_STEP, raised for every debug register trap
pub const EXCEPTION_SINGLE_STEP: u32 = 0x8000_0004;

pub const EXCEPTION_CONTINUE_EXECUTION: i32 = -1;
pub const EXCEPTION_CONTINUE_SEARCH: i32 = 0;

/// Verdict returned to the exception chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Handled. Resume the thread with the (possibly edited) context.
    ContinueExecution,
    /// Not ours. Let the next handler look at it.
    ContinueSearch,
}

impl Disposition {
    pub fn to_veh_code(self) -> i32 {
        match self {
            Disposition::ContinueExecution => EXCEPTION_CONTINUE_EXECUTION,
            Disposition::ContinueSearch => EXCEPTION_CONTINUE_SEARCH,
        }
    }
}

/// Where a serviced thread resumes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeRule {
    /// Jump to the hook target
    HookTarget,
    /// Run the relocated instruction, then fall through
    Trampoline,
    /// Leave the instruction pointer alone; data traps fire after the
    /// access has completed
    Natural,
}

/// Redirection table for (handler, watch type)
pub fn resume_rule(handler: HandlerKind, execute: bool) -> ResumeRule {
    match (handler, execute) {
        (HandlerKind::Hook, true) => ResumeRule::HookTarget,
        (HandlerKind::Notify | HandlerKind::None, true) => ResumeRule::Trampoline,
        (_, false) => ResumeRule::Natural,
    }
}

fn resume_address(view: &ArmedView) -> Option<usize> {
    match resume_rule(view.handler.kind(), view.condition.is_execute()) {
        ResumeRule::HookTarget => match view.handler {
            Handler::Hook(target) => Some(target),
            _ => None,
        },
        ResumeRule::Trampoline => view.trampoline,
        ResumeRule::Natural => None,
    }
}

type Candidate = (Arc<BreakpointState>, ArmedView);

impl Shared {
    pub(crate) fn dispatch(
        &self,
        code: u32,
        address: usize,
        context: &mut NativeContext,
    ) -> Disposition {
        if code != EXCEPTION_SINGLE_STEP {
            return Disposition::ContinueSearch;
        }

        let candidates: Vec<Candidate> = self
            .registry
            .read()
            .iter()
            .filter_map(|state| state.view().map(|view| (state.clone(), view)))
            .collect();

        // Execute traps are raised at the watched instruction itself
        let exact = candidates
            .iter()
            .find(|(state, view)| view.address == address && !state.is_disabled())
            .or_else(|| candidates.iter().find(|(_, view)| view.address == address));
        if let Some((state, view)) = exact {
            self.service(state, view, code, address, context);
            context.clear_debug_status();
            return Disposition::ContinueExecution;
        }

        // Data traps are raised after the access; DR6 names the slot
        let status = context.debug_status();
        let registers = context.debug_registers();
        let mut serviced = 0;
        for slot in status.hit_slots() {
            let hit = candidates.iter().find(|(_, view)| {
                view.slot == slot
                    && !view.condition.is_execute()
                    && registers.holds(slot, view.address)
            });
            if let Some((state, view)) = hit {
                self.service(state, view, code, address, context);
                serviced += 1;
            }
        }

        if serviced == 0 && status.hit_slots().next().is_none() {
            serviced = self.broadcast(&candidates, code, address, context);
        }

        if serviced > 0 {
            context.clear_debug_status();
            Disposition::ContinueExecution
        } else {
            Disposition::ContinueSearch
        }
    }

    /// Offer an unattributed single step to every live data watch
    fn broadcast(
        &self,
        candidates: &[Candidate],
        code: u32,
        address: usize,
        context: &mut NativeContext,
    ) -> usize {
        if !self.config.broadcast_untracked_single_step {
            return 0;
        }
        let mut serviced = 0;
        for (state, view) in candidates {
            if view.condition.is_execute() || state.is_disabled() {
                continue;
            }
            if let Handler::Notify(_) = view.handler {
                self.service(state, view, code, address, context);
                serviced += 1;
            }
        }
        serviced
    }

    fn service(
        &self,
        state: &BreakpointState,
        view: &ArmedView,
        code: u32,
        address: usize,
        context: &mut NativeContext,
    ) {
        // A run-once breakpoint is claimed by exactly one trap
        let live = if state.run_once {
            state
                .disabled
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        } else {
            !state.is_disabled()
        };

        if live {
            state.hits.fetch_add(1, Ordering::Relaxed);
            if let Handler::Notify(callback) = &view.handler {
                let mut frame = TrapFrame {
                    breakpoint: state.id,
                    code,
                    address,
                    watched: view.address,
                    context: &mut *context,
                };
                if catch_unwind(AssertUnwindSafe(|| callback(&mut frame))).is_err() {
                    error!("Notify callback of breakpoint {} panicked", state.id);
                }
            }
        }

        // A stale trap never reaches the handler, hook target included
        let resume = if live {
            resume_address(view)
        } else {
            view.trampoline
        };
        if let Some(target) = resume {
            context.set_instruction_pointer(target);
        }

        if !live || state.run_once {
            // Stale trap or spent run-once: drop the slot from this thread
            // now, the OS reloads DR7 from this context on resume
            let mut registers = context.debug_registers();
            if registers.holds(view.slot, view.address) {
                registers.disarm(view.slot);
                context.apply_debug_registers(&registers);
            }
        }
        if live && state.run_once {
            self.clear_other_threads(state, view);
        }

        trace!(
            "Breakpoint {} at {:#x} serviced (live: {}, resume: {:#x})",
            state.id,
            view.address,
            live,
            context.instruction_pointer()
        );
    }
}
