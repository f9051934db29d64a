//! Breakpoint lifecycle and dispatch, driven through an in-memory backend

mod support;

use hwbp_common::{Condition, Error, HandlerKind, HwbpConfig, Scope, WatchLength};
use hwbp_core::{DebugContext, Disposition, Handler, HwbpManager, EXCEPTION_SINGLE_STEP};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use support::{code, FakeThreads};

const ACCESS_VIOLATION: u32 = 0xC000_0005;

fn manager(fake: &FakeThreads) -> HwbpManager {
    HwbpManager::with_backend(HwbpConfig::default(), Box::new(fake.clone()))
}

fn counter() -> (Arc<AtomicUsize>, Handler) {
    let count = Arc::new(AtomicUsize::new(0));
    let seen = count.clone();
    let handler = Handler::notify(move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
    });
    (count, handler)
}

fn watch(bp: &hwbp_core::Breakpoint, address: usize) -> hwbp_common::Result<usize> {
    unsafe { bp.create(address, WatchLength::Four, Condition::ReadWrite, Handler::None) }
}

#[test]
fn test_slots_are_first_fit_and_exhaust() {
    let fake = FakeThreads::with_threads(&[1]);
    let manager = manager(&fake);

    let bps: Vec<_> = (0..5)
        .map(|_| manager.breakpoint(Scope::ThisThread, false).unwrap())
        .collect();
    for (i, bp) in bps.iter().take(4).enumerate() {
        assert_eq!(watch(bp, 0x1000 * (i + 1)).unwrap(), i);
    }

    let err = watch(&bps[4], 0x9000).unwrap_err();
    assert!(matches!(err, Error::ResourceExhausted { thread_id: 1 }));
    assert!(!bps[4].is_armed());

    let regs = fake.registers(1);
    assert_eq!(regs.address, [0x1000, 0x2000, 0x3000, 0x4000]);
    assert_eq!(regs.first_free_slot(), None);
}

#[test]
fn test_disabled_slot_is_reused() {
    let fake = FakeThreads::with_threads(&[1]);
    let manager = manager(&fake);

    let bps: Vec<_> = (0..4)
        .map(|_| manager.breakpoint(Scope::ThisThread, false).unwrap())
        .collect();
    for (i, bp) in bps.iter().enumerate() {
        watch(bp, 0x1000 * (i + 1)).unwrap();
    }

    bps[1].disable();
    assert!(!fake.registers(1).control.is_slot_enabled(1));
    assert_eq!(fake.registers(1).address[1], 0);

    let fresh = manager.breakpoint(Scope::ThisThread, false).unwrap();
    assert_eq!(watch(&fresh, 0x8000).unwrap(), 1);
    assert!(fake.registers(1).holds(1, 0x8000));
}

#[test]
fn test_rearm_is_rejected() {
    let fake = FakeThreads::with_threads(&[1]);
    let manager = manager(&fake);
    let bp = manager.breakpoint(Scope::ThisThread, false).unwrap();

    watch(&bp, 0x1000).unwrap();
    assert!(matches!(watch(&bp, 0x2000), Err(Error::AlreadyArmed(_))));

    bp.disable();
    bp.disable();
    assert!(bp.is_disabled());
    assert!(matches!(watch(&bp, 0x2000), Err(Error::AlreadyArmed(_))));
}

#[test]
fn test_disable_before_create_is_noop() {
    let fake = FakeThreads::with_threads(&[1]);
    let manager = manager(&fake);
    let bp = manager.breakpoint(Scope::ThisThread, false).unwrap();

    bp.disable();
    assert!(!bp.is_disabled());
    assert_eq!(watch(&bp, 0x1000).unwrap(), 0);
}

#[test]
fn test_io_condition_is_rejected() {
    let fake = FakeThreads::with_threads(&[1]);
    let manager = manager(&fake);
    let bp = manager.breakpoint(Scope::ThisThread, false).unwrap();

    let err = unsafe { bp.create(0x1000, WatchLength::One, Condition::IoReadWrite, Handler::None) }
        .unwrap_err();
    assert!(matches!(err, Error::UnsupportedCondition(_)));
    assert_eq!(fake.registers(1).control.to_raw(), 0);
    assert!(bp.slot().is_none());
}

#[test]
fn test_execute_watch_on_call_follows_target() {
    let fake = FakeThreads::with_threads(&[1]);
    let manager = manager(&fake);
    // call +3; nop x3; lea eax, [rcx+1]; ret
    let buf = code(&[0xE8, 0x03, 0x00, 0x00, 0x00, 0x90, 0x90, 0x90, 0x8D, 0x41, 0x01, 0xC3]);
    let entry = buf.as_ptr() as usize;

    let bp = manager.breakpoint(Scope::ThisThread, false).unwrap();
    let slot =
        unsafe { bp.create(entry, WatchLength::Four, Condition::Execute, Handler::None) }.unwrap();

    assert_eq!(bp.address(), Some(entry + 8));
    let regs = fake.registers(1);
    assert!(regs.holds(slot, entry + 8));
    assert_eq!(regs.control.slot_length(slot), Some(WatchLength::One));
    assert_eq!(regs.control.slot_condition(slot), Some(Condition::Execute));
    assert!(bp.continuation_buffer().is_some());
}

#[test]
fn test_data_watch_has_no_continuation() {
    let fake = FakeThreads::with_threads(&[1]);
    let manager = manager(&fake);
    let bp = manager.breakpoint(Scope::ThisThread, false).unwrap();
    assert!(bp.continuation_buffer().is_none());

    watch(&bp, 0x1000).unwrap();
    assert!(bp.continuation_buffer().is_none());
    assert_eq!(
        fake.registers(1).control.slot_length(0),
        Some(WatchLength::Four)
    );
}

#[test]
fn test_this_thread_scope_touches_only_creator() {
    let fake = FakeThreads::with_threads(&[1, 2, 3]);
    let manager = manager(&fake);
    let bp = manager.breakpoint(Scope::ThisThread, false).unwrap();

    let slot = watch(&bp, 0x1000).unwrap();
    assert!(fake.registers(1).holds(slot, 0x1000));
    assert_eq!(fake.registers(2).control.to_raw(), 0);
    assert_eq!(fake.registers(3).control.to_raw(), 0);
}

#[test]
fn test_all_threads_scope_reaches_live_and_new_threads() {
    let fake = FakeThreads::with_threads(&[1, 2, 3]);
    let manager = manager(&fake);
    let bp = manager.breakpoint(Scope::AllThreads, false).unwrap();
    let local = manager.breakpoint(Scope::ThisThread, false).unwrap();

    let slot = watch(&bp, 0x1000).unwrap();
    watch(&local, 0x2000).unwrap();
    for tid in [1, 2, 3] {
        assert!(fake.registers(tid).holds(slot, 0x1000));
    }

    // A thread starting after creation runs the thread-entry replay
    fake.spawn(4);
    fake.set_current(4);
    assert_eq!(manager.replay_on_current_thread(), 1);
    let regs = fake.registers(4);
    assert!(regs.holds(slot, 0x1000));
    assert_eq!(regs.control.enabled_slots().count(), 1);
}

#[test]
fn test_replay_skips_disabled_breakpoints() {
    let fake = FakeThreads::with_threads(&[1]);
    let manager = manager(&fake);
    let bp = manager.breakpoint(Scope::AllThreads, false).unwrap();
    watch(&bp, 0x1000).unwrap();
    bp.disable();

    fake.spawn(2);
    fake.set_current(2);
    assert_eq!(manager.replay_on_current_thread(), 0);
    assert_eq!(fake.registers(2).control.to_raw(), 0);
}

#[test]
fn test_busy_slot_on_other_thread_is_skipped() {
    let fake = FakeThreads::with_threads(&[1, 2]);
    let mut foreign = fake.registers(2);
    foreign.arm(0, 0xF000, Condition::Execute, WatchLength::One);
    fake.set_registers(2, foreign);

    let manager = manager(&fake);
    let bp = manager.breakpoint(Scope::AllThreads, false).unwrap();
    assert_eq!(watch(&bp, 0x1000).unwrap(), 0);

    assert!(fake.registers(1).holds(0, 0x1000));
    assert!(fake.registers(2).holds(0, 0xF000));
}

#[test]
fn test_disable_targets_owner_thread() {
    let fake = FakeThreads::with_threads(&[1, 2]);
    let manager = manager(&fake);
    let bp = manager.breakpoint(Scope::ThisThread, false).unwrap();
    watch(&bp, 0x1000).unwrap();

    fake.set_current(2);
    bp.disable();
    assert_eq!(fake.registers(1).control.to_raw(), 0);
}

#[test]
fn test_disable_leaves_reassigned_slot_alone() {
    let fake = FakeThreads::with_threads(&[1]);
    let manager = manager(&fake);
    let bp = manager.breakpoint(Scope::ThisThread, false).unwrap();
    let slot = watch(&bp, 0x1000).unwrap();

    let mut regs = fake.registers(1);
    regs.arm(slot, 0x7000, Condition::Read, WatchLength::Two);
    fake.set_registers(1, regs);

    bp.disable();
    assert!(fake.registers(1).holds(slot, 0x7000));
}

#[test]
fn test_notify_scenario_counts_every_call() {
    let fake = FakeThreads::with_threads(&[1]);
    let manager = manager(&fake);
    let func = code(&[0x8D, 0x41, 0x01, 0xC3]);
    let entry = func.as_ptr() as usize;

    let (count, handler) = counter();
    let bp = manager.breakpoint(Scope::ThisThread, false).unwrap();
    let slot = unsafe { bp.create(entry, WatchLength::One, Condition::Execute, handler) }.unwrap();
    let trampoline = bp.continuation_buffer().unwrap();

    for _ in 0..3 {
        let mut ctx = fake.trap_context(1, entry, 1 << slot);
        assert_eq!(
            manager.dispatch(EXCEPTION_SINGLE_STEP, entry, &mut ctx),
            Disposition::ContinueExecution
        );
        assert_eq!(ctx.instruction_pointer(), trampoline);
        assert_eq!(ctx.debug_status().to_raw(), 0);
        assert!(ctx.debug_registers().holds(slot, entry));
        fake.resume(1, &ctx);
    }
    assert_eq!(count.load(Ordering::SeqCst), 3);
    assert_eq!(bp.hit_count(), 3);
}

#[test]
fn test_run_once_fires_exactly_once() {
    let fake = FakeThreads::with_threads(&[1]);
    let manager = manager(&fake);
    let func = code(&[0x8D, 0x41, 0x01, 0xC3]);
    let entry = func.as_ptr() as usize;

    let (count, handler) = counter();
    let bp = manager.breakpoint(Scope::ThisThread, true).unwrap();
    let slot = unsafe { bp.create(entry, WatchLength::One, Condition::Execute, handler) }.unwrap();
    let trampoline = bp.continuation_buffer().unwrap();

    let mut ctx = fake.trap_context(1, entry, 1 << slot);
    assert_eq!(
        manager.dispatch(EXCEPTION_SINGLE_STEP, entry, &mut ctx),
        Disposition::ContinueExecution
    );
    assert_eq!(ctx.instruction_pointer(), trampoline);
    assert!(!ctx.debug_registers().control.is_slot_enabled(slot));
    assert!(bp.is_disabled());
    fake.resume(1, &ctx);

    // A trap that was already in flight still resumes through the trampoline
    let mut ctx = fake.trap_context(1, entry, 0);
    assert_eq!(
        manager.dispatch(EXCEPTION_SINGLE_STEP, entry, &mut ctx),
        Disposition::ContinueExecution
    );
    assert_eq!(ctx.instruction_pointer(), trampoline);
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[test]
fn test_run_once_clears_other_threads() {
    let fake = FakeThreads::with_threads(&[1, 2]);
    let manager = manager(&fake);
    let (count, handler) = counter();
    let bp = manager.breakpoint(Scope::AllThreads, true).unwrap();
    let slot =
        unsafe { bp.create(0x4000, WatchLength::Eight, Condition::ReadWrite, handler) }.unwrap();

    fake.set_current(2);
    let mut ctx = fake.trap_context(2, 0x5555, 1 << slot);
    assert_eq!(
        manager.dispatch(EXCEPTION_SINGLE_STEP, 0x5555, &mut ctx),
        Disposition::ContinueExecution
    );
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert!(!ctx.debug_registers().control.is_slot_enabled(slot));
    assert_eq!(fake.registers(1).control.to_raw(), 0);
}

#[test]
fn test_hook_handler_redirects() {
    let fake = FakeThreads::with_threads(&[1]);
    let manager = manager(&fake);
    let func = code(&[0x8D, 0x41, 0x01, 0xC3]);
    let entry = func.as_ptr() as usize;

    let bp = manager.breakpoint(Scope::ThisThread, false).unwrap();
    unsafe { bp.create(entry, WatchLength::One, Condition::Execute, Handler::hook(0xDEAD_0000)) }
        .unwrap();
    assert_eq!(bp.info().handler, HandlerKind::Hook);

    let mut ctx = fake.trap_context(1, entry, 1);
    assert_eq!(
        manager.dispatch(EXCEPTION_SINGLE_STEP, entry, &mut ctx),
        Disposition::ContinueExecution
    );
    assert_eq!(ctx.instruction_pointer(), 0xDEAD_0000);
}

#[test]
fn test_disabled_hook_resumes_through_trampoline() {
    let fake = FakeThreads::with_threads(&[1]);
    let manager = manager(&fake);
    let func = code(&[0x8D, 0x41, 0x01, 0xC3]);
    let entry = func.as_ptr() as usize;

    let bp = manager.breakpoint(Scope::ThisThread, false).unwrap();
    let slot =
        unsafe { bp.create(entry, WatchLength::One, Condition::Execute, Handler::hook(0xDEAD_0000)) }
            .unwrap();
    let trampoline = bp.continuation_buffer().unwrap();

    // Trap raised just before the breakpoint was disabled
    let mut ctx = fake.trap_context(1, entry, 1 << slot);
    bp.disable();
    assert_eq!(
        manager.dispatch(EXCEPTION_SINGLE_STEP, entry, &mut ctx),
        Disposition::ContinueExecution
    );
    assert_eq!(ctx.instruction_pointer(), trampoline);
    assert!(!ctx.debug_registers().control.is_slot_enabled(slot));
    assert_eq!(bp.hit_count(), 0);
}

#[test]
fn test_hook_on_data_watch_is_downgraded() {
    let fake = FakeThreads::with_threads(&[1]);
    let manager = manager(&fake);
    let bp = manager.breakpoint(Scope::ThisThread, false).unwrap();
    let slot =
        unsafe { bp.create(0x4000, WatchLength::Four, Condition::Read, Handler::hook(0xDEAD_0000)) }
            .unwrap();
    assert_eq!(bp.info().handler, HandlerKind::None);

    let mut ctx = fake.trap_context(1, 0x5555, 1 << slot);
    assert_eq!(
        manager.dispatch(EXCEPTION_SINGLE_STEP, 0x5555, &mut ctx),
        Disposition::ContinueExecution
    );
    assert_eq!(ctx.instruction_pointer(), 0x5555);
}

#[test]
fn test_data_trap_attributed_by_status_register() {
    let fake = FakeThreads::with_threads(&[1]);
    let manager = manager(&fake);

    let (first_count, first) = counter();
    let (second_count, second) = counter();
    let a = manager.breakpoint(Scope::ThisThread, false).unwrap();
    let b = manager.breakpoint(Scope::ThisThread, false).unwrap();
    unsafe { a.create(0x4000, WatchLength::Four, Condition::ReadWrite, first) }.unwrap();
    let slot_b = unsafe { b.create(0x5000, WatchLength::Four, Condition::Read, second) }.unwrap();

    let mut ctx = fake.trap_context(1, 0x6000, 1 << slot_b);
    assert_eq!(
        manager.dispatch(EXCEPTION_SINGLE_STEP, 0x6000, &mut ctx),
        Disposition::ContinueExecution
    );
    assert_eq!(first_count.load(Ordering::SeqCst), 0);
    assert_eq!(second_count.load(Ordering::SeqCst), 1);
    assert_eq!(ctx.instruction_pointer(), 0x6000);
    assert_eq!(ctx.debug_status().to_raw(), 0);
}

#[test]
fn test_unattributed_single_step_passes_through() {
    let fake = FakeThreads::with_threads(&[1]);
    let manager = manager(&fake);
    let (count, handler) = counter();
    let bp = manager.breakpoint(Scope::ThisThread, false).unwrap();
    unsafe { bp.create(0x4000, WatchLength::Four, Condition::ReadWrite, handler) }.unwrap();

    // Trap flag step, no debug register hit
    let mut ctx = fake.trap_context(1, 0x6000, 1 << 14);
    assert_eq!(
        manager.dispatch(EXCEPTION_SINGLE_STEP, 0x6000, &mut ctx),
        Disposition::ContinueSearch
    );
    // Hit on a slot we don't own
    let mut ctx = fake.trap_context(1, 0x6000, 1 << 3);
    assert_eq!(
        manager.dispatch(EXCEPTION_SINGLE_STEP, 0x6000, &mut ctx),
        Disposition::ContinueSearch
    );
    assert_eq!(count.load(Ordering::SeqCst), 0);
}

#[test]
fn test_broadcast_when_configured() {
    let fake = FakeThreads::with_threads(&[1]);
    let config = HwbpConfig {
        broadcast_untracked_single_step: true,
        ..HwbpConfig::default()
    };
    let manager = HwbpManager::with_backend(config, Box::new(fake.clone()));

    let (first_count, first) = counter();
    let (second_count, second) = counter();
    let a = manager.breakpoint(Scope::ThisThread, false).unwrap();
    let b = manager.breakpoint(Scope::ThisThread, false).unwrap();
    unsafe { a.create(0x4000, WatchLength::Four, Condition::ReadWrite, first) }.unwrap();
    unsafe { b.create(0x5000, WatchLength::Four, Condition::Read, second) }.unwrap();

    let mut ctx = fake.trap_context(1, 0x6000, 0);
    assert_eq!(
        manager.dispatch(EXCEPTION_SINGLE_STEP, 0x6000, &mut ctx),
        Disposition::ContinueExecution
    );
    assert_eq!(first_count.load(Ordering::SeqCst), 1);
    assert_eq!(second_count.load(Ordering::SeqCst), 1);
}

#[test]
fn test_other_exception_codes_are_ignored() {
    let fake = FakeThreads::with_threads(&[1]);
    let manager = manager(&fake);
    let func = code(&[0x8D, 0x41, 0x01, 0xC3]);
    let entry = func.as_ptr() as usize;
    let (count, handler) = counter();
    let bp = manager.breakpoint(Scope::ThisThread, false).unwrap();
    unsafe { bp.create(entry, WatchLength::One, Condition::Execute, handler) }.unwrap();

    let mut ctx = fake.trap_context(1, entry, 1);
    assert_eq!(
        manager.dispatch(ACCESS_VIOLATION, entry, &mut ctx),
        Disposition::ContinueSearch
    );
    assert_eq!(ctx.instruction_pointer(), entry);
    assert_eq!(count.load(Ordering::SeqCst), 0);
}

#[test]
fn test_notify_sees_trap_details() {
    let fake = FakeThreads::with_threads(&[1]);
    let manager = manager(&fake);
    let seen = Arc::new(std::sync::Mutex::new(None));
    let sink = seen.clone();

    let bp = manager.breakpoint(Scope::ThisThread, false).unwrap();
    let handler = Handler::notify(move |frame| {
        *sink.lock().unwrap() = Some((frame.breakpoint, frame.address, frame.watched));
    });
    let slot = unsafe { bp.create(0x4000, WatchLength::Two, Condition::Read, handler) }.unwrap();

    let mut ctx = fake.trap_context(1, 0x6000, 1 << slot);
    manager.dispatch(EXCEPTION_SINGLE_STEP, 0x6000, &mut ctx);
    assert_eq!(*seen.lock().unwrap(), Some((bp.id(), 0x6000, 0x4000)));
}

#[test]
fn test_panicking_callback_is_contained() {
    let fake = FakeThreads::with_threads(&[1]);
    let manager = manager(&fake);
    let func = code(&[0x8D, 0x41, 0x01, 0xC3]);
    let entry = func.as_ptr() as usize;

    let bp = manager.breakpoint(Scope::ThisThread, false).unwrap();
    let handler = Handler::notify(|_| panic!("callback failure"));
    unsafe { bp.create(entry, WatchLength::One, Condition::Execute, handler) }.unwrap();

    let mut ctx = fake.trap_context(1, entry, 1);
    assert_eq!(
        manager.dispatch(EXCEPTION_SINGLE_STEP, entry, &mut ctx),
        Disposition::ContinueExecution
    );
    assert_eq!(Some(ctx.instruction_pointer()), bp.continuation_buffer());
}

#[test]
fn test_terminate_is_idempotent() {
    let fake = FakeThreads::with_threads(&[1]);
    let manager = manager(&fake);
    manager.terminate();
    manager.terminate();

    let bp = manager.breakpoint(Scope::AllThreads, false).unwrap();
    watch(&bp, 0x1000).unwrap();
    manager.terminate();
    manager.terminate();

    assert!(bp.is_disabled());
    assert_eq!(fake.registers(1).control.to_raw(), 0);
    assert!(manager.breakpoints().iter().all(|info| info.disabled));
}

#[test]
fn test_drop_disables_and_deregisters() {
    let fake = FakeThreads::with_threads(&[1]);
    let manager = manager(&fake);
    let bp = manager.breakpoint(Scope::ThisThread, false).unwrap();
    watch(&bp, 0x1000).unwrap();
    assert_eq!(manager.breakpoints().len(), 1);

    drop(bp);
    assert!(manager.breakpoints().is_empty());
    assert_eq!(fake.registers(1).control.to_raw(), 0);
}

#[test]
fn test_breakpoint_info_snapshot() {
    let fake = FakeThreads::with_threads(&[1]);
    let manager = manager(&fake);
    let bp = manager.breakpoint(Scope::AllThreads, true).unwrap();
    let slot = unsafe { bp.create(0x4000, WatchLength::Eight, Condition::ReadWrite, Handler::None) }
        .unwrap();

    let infos = manager.breakpoints();
    assert_eq!(infos.len(), 1);
    let info = &infos[0];
    assert_eq!(info.id, bp.id());
    assert_eq!(info.address, 0x4000);
    assert_eq!(info.slot, Some(slot));
    assert_eq!(info.length, WatchLength::Eight);
    assert_eq!(info.scope, Scope::AllThreads);
    assert!(info.run_once);
    assert!(info.is_armed());
    assert_eq!(info.hit_count, 0);
}

#[test]
fn test_unreachable_thread_leaves_breakpoint_unarmed() {
    let fake = FakeThreads::with_threads(&[1]);
    fake.set_current(9);
    let manager = manager(&fake);
    let bp = manager.breakpoint(Scope::ThisThread, false).unwrap();

    assert!(matches!(watch(&bp, 0x1000), Err(Error::OsCall { .. })));
    assert!(bp.slot().is_none());
    // Still armable once the thread is reachable
    fake.set_current(1);
    assert_eq!(watch(&bp, 0x1000).unwrap(), 0);
}
