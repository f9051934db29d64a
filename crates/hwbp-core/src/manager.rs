//! Breakpoint manager: registry, slot allocation and process-wide hooks
//!
//! The exception handler and the thread-entry detour are plain function
//! pointers with no user data, so the manager that installed them is
//! reachable through a single process-wide bridge slot. Only one native
//! manager can hold it at a time.

use crate::breakpoint::{Armed, ArmedView, Breakpoint, BreakpointState, Handler};
use crate::context::{DebugRegisterSet, NativeContext};
use crate::disasm::IcedDecoder;
use crate::dispatch::Disposition;
use crate::export_hook::ExportHookRecord;
use crate::traits::ThreadBackend;
use crate::trampoline::{TrampolineBlock, TrampolineBuilder};
use hwbp_common::{
    BreakpointInfo, Condition, Error, HwbpConfig, Result, Scope, WatchLength,
};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Manager currently bound to the process exception handler
static ACTIVE: Lazy<RwLock<Option<Weak<Shared>>>> = Lazy::new(|| RwLock::new(None));

fn active() -> Option<Arc<Shared>> {
    ACTIVE.read().as_ref().and_then(Weak::upgrade)
}

#[derive(Default)]
struct Installation {
    installed: bool,
    #[cfg(windows)]
    veh: Option<native::VehRegistration>,
    thread_hook: Option<ExportHookRecord>,
}

pub(crate) struct Shared {
    pub(crate) config: HwbpConfig,
    pub(crate) backend: Box<dyn ThreadBackend>,
    pub(crate) builder: TrampolineBuilder,
    pub(crate) registry: RwLock<Vec<Arc<BreakpointState>>>,
    /// Serialises slot allocation against thread-start replay
    arm_lock: Mutex<()>,
    installation: Mutex<Installation>,
    process_hooks: bool,
}

impl Shared {
    fn new(config: HwbpConfig, backend: Box<dyn ThreadBackend>, process_hooks: bool) -> Self {
        Self {
            config,
            backend,
            builder: TrampolineBuilder::new(Arc::new(IcedDecoder::native())),
            registry: RwLock::new(Vec::new()),
            arm_lock: Mutex::new(()),
            installation: Mutex::new(Installation::default()),
            process_hooks,
        }
    }

    pub(crate) fn arm(
        &self,
        state: &BreakpointState,
        address: usize,
        length: WatchLength,
        condition: Condition,
        handler: Handler,
        trampoline: Option<TrampolineBlock>,
    ) -> Result<usize> {
        let _guard = self.arm_lock.lock();
        if state.armed.read().is_some() {
            return Err(Error::AlreadyArmed(state.id.0));
        }

        let current = self.backend.current_thread_id();
        let mut registers = self.backend.read_debug_registers(current).map_err(|e| {
            warn!("Breakpoint {}: reading thread {} failed: {}", state.id, current, e);
            e
        })?;
        let slot = registers.first_free_slot().ok_or_else(|| {
            warn!("Breakpoint {}: no free slot on thread {}", state.id, current);
            Error::ResourceExhausted { thread_id: current }
        })?;
        registers.arm(slot, address, condition, length);

        // Published before the hardware can fire
        *state.armed.write() = Some(Armed {
            address,
            length,
            condition,
            slot,
            handler,
            trampoline,
            owner_thread: current,
        });

        if let Err(e) = self.backend.write_debug_registers(current, &registers) {
            warn!("Breakpoint {}: writing thread {} failed: {}", state.id, current, e);
            *state.armed.write() = None;
            return Err(e);
        }

        let mut others = 0;
        if state.scope == Scope::AllThreads {
            match self.backend.thread_ids() {
                Ok(ids) => {
                    for tid in ids.into_iter().filter(|&tid| tid != current) {
                        match self.propagate(tid, slot, address, condition, length) {
                            Ok(true) => others += 1,
                            Ok(false) => warn!(
                                "Breakpoint {}: slot {} busy on thread {}, skipped",
                                state.id, slot, tid
                            ),
                            Err(e) => warn!(
                                "Breakpoint {}: thread {} skipped: {}",
                                state.id, tid, e
                            ),
                        }
                    }
                }
                Err(e) => warn!("Breakpoint {}: thread enumeration failed: {}", state.id, e),
            }
        }

        debug!(
            "Breakpoint {} armed: {:#x} {} x{} in slot {} (+{} threads)",
            state.id,
            address,
            condition,
            length.bytes(),
            slot,
            others
        );
        Ok(slot)
    }

    /// Arm `slot` on another thread if it is free there.
    fn propagate(
        &self,
        thread_id: u32,
        slot: usize,
        address: usize,
        condition: Condition,
        length: WatchLength,
    ) -> Result<bool> {
        let mut registers = self.backend.read_debug_registers(thread_id)?;
        if registers.control.is_slot_enabled(slot) && !registers.holds(slot, address) {
            return Ok(false);
        }
        registers.arm(slot, address, condition, length);
        self.backend.write_debug_registers(thread_id, &registers)?;
        Ok(true)
    }

    /// Clear `view`'s slot on `thread_id` if it still watches its address.
    fn clear_on(&self, thread_id: u32, view: &ArmedView) -> Result<()> {
        let mut registers: DebugRegisterSet = self.backend.read_debug_registers(thread_id)?;
        if registers.holds(view.slot, view.address) {
            registers.disarm(view.slot);
            self.backend.write_debug_registers(thread_id, &registers)?;
        }
        Ok(())
    }

    pub(crate) fn disable(&self, state: &BreakpointState) {
        let Some(view) = state.view() else {
            return;
        };
        if state
            .disabled
            .swap(true, std::sync::atomic::Ordering::SeqCst)
        {
            return;
        }

        let _guard = self.arm_lock.lock();
        let owner = state.armed.read().as_ref().map(|a| a.owner_thread);
        let targets = match (state.scope, owner) {
            (Scope::ThisThread, Some(owner)) => vec![owner],
            _ => self.backend.thread_ids().unwrap_or_else(|e| {
                warn!("Breakpoint {}: thread enumeration failed: {}", state.id, e);
                vec![self.backend.current_thread_id()]
            }),
        };

        for tid in targets {
            if let Err(e) = self.clear_on(tid, &view) {
                warn!("Breakpoint {}: clearing thread {} failed: {}", state.id, tid, e);
            }
        }
        debug!("Breakpoint {} disabled (slot {})", state.id, view.slot);
    }

    /// Called from the dispatcher once a run-once breakpoint has fired.
    /// The faulting thread is handled through its exception context.
    pub(crate) fn clear_other_threads(&self, state: &BreakpointState, view: &ArmedView) {
        if state.scope != Scope::AllThreads {
            return;
        }
        let current = self.backend.current_thread_id();
        let Ok(ids) = self.backend.thread_ids() else {
            return;
        };
        for tid in ids.into_iter().filter(|&tid| tid != current) {
            if let Err(e) = self.clear_on(tid, view) {
                warn!("Breakpoint {}: clearing thread {} failed: {}", state.id, tid, e);
            }
        }
    }

    pub(crate) fn deregister(&self, state: &Arc<BreakpointState>) {
        self.registry.write().retain(|s| !Arc::ptr_eq(s, state));
    }

    /// Re-apply every live all-threads breakpoint to the calling thread,
    /// each in the slot it already owns.
    pub(crate) fn replay_on_current_thread(&self) -> usize {
        let _guard = self.arm_lock.lock();
        let current = self.backend.current_thread_id();
        let mut registers = match self.backend.read_debug_registers(current) {
            Ok(registers) => registers,
            Err(e) => {
                warn!("Replay on thread {} failed: {}", current, e);
                return 0;
            }
        };

        let mut applied = 0;
        for state in self.registry.read().iter() {
            if state.scope != Scope::AllThreads || state.is_disabled() {
                continue;
            }
            let Some(view) = state.view() else {
                continue;
            };
            if registers.control.is_slot_enabled(view.slot)
                && !registers.holds(view.slot, view.address)
            {
                warn!(
                    "Breakpoint {}: slot {} busy on new thread {}, skipped",
                    state.id, view.slot, current
                );
                continue;
            }
            registers.arm(view.slot, view.address, view.condition, view.length);
            applied += 1;
        }

        if applied == 0 {
            return 0;
        }
        match self.backend.write_debug_registers(current, &registers) {
            Ok(()) => {
                debug!("Replayed {} breakpoints on thread {}", applied, current);
                applied
            }
            Err(e) => {
                warn!("Replay on thread {} failed: {}", current, e);
                0
            }
        }
    }

    fn bind(self: &Arc<Self>) -> Result<()> {
        let mut slot = ACTIVE.write();
        if let Some(other) = slot.as_ref().and_then(Weak::upgrade) {
            if !Arc::ptr_eq(&other, self) {
                return Err(Error::Internal(
                    "another manager owns the process exception handler".into(),
                ));
            }
        }
        *slot = Some(Arc::downgrade(self));
        Ok(())
    }

    fn unbind(&self) {
        let mut slot = ACTIVE.write();
        if slot
            .as_ref()
            .is_some_and(|weak| std::ptr::eq(weak.as_ptr(), self))
        {
            *slot = None;
        }
    }

    fn ensure_installed(self: &Arc<Self>) -> Result<()> {
        if !self.process_hooks {
            return Ok(());
        }
        let mut installation = self.installation.lock();
        if installation.installed {
            return Ok(());
        }
        self.bind()?;
        if let Err(e) = self.install(&mut installation) {
            self.unbind();
            return Err(e);
        }
        installation.installed = true;
        Ok(())
    }

    #[cfg(windows)]
    fn install(self: &Arc<Self>, installation: &mut Installation) -> Result<()> {
        installation.veh = Some(native::VehRegistration::register(
            self.config.first_handler,
        )?);

        if self.config.propagate_to_new_threads {
            match native::hook_thread_entry(&self.builder, &self.config) {
                Ok(record) => installation.thread_hook = Some(record),
                Err(e) => warn!(
                    "Thread-entry hook unavailable, new threads will not inherit breakpoints: {}",
                    e
                ),
            }
        }
        info!("hwbp process hooks installed");
        Ok(())
    }

    #[cfg(not(windows))]
    fn install(self: &Arc<Self>, _installation: &mut Installation) -> Result<()> {
        Err(Error::Unsupported("process exception handler".into()))
    }

    fn terminate(&self) {
        let mut installation = self.installation.lock();
        let was_installed = std::mem::take(&mut installation.installed);

        if let Some(mut hook) = installation.thread_hook.take() {
            if let Err(e) = hook.detach() {
                warn!("Failed to remove thread-entry hook: {}", e);
            }
        }

        let states: Vec<Arc<BreakpointState>> = self.registry.read().clone();
        for state in &states {
            self.disable(state);
        }

        #[cfg(windows)]
        {
            installation.veh = None;
        }

        if was_installed {
            self.unbind();
            info!("hwbp process hooks removed");
        }
    }
}

/// Owner of the breakpoint registry and of the process-level hooks.
pub struct HwbpManager {
    shared: Arc<Shared>,
}

impl HwbpManager {
    /// Manager over the threads of this process. The exception handler and
    /// the thread-entry hook are installed when the first breakpoint is
    /// constructed.
    #[cfg(windows)]
    pub fn new(config: HwbpConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(Shared::new(
                config,
                Box::new(crate::threads::Win32Threads::new()),
                true,
            )),
        })
    }

    #[cfg(not(windows))]
    pub fn new(_config: HwbpConfig) -> Result<Self> {
        Err(Error::Unsupported(
            "native hardware breakpoints need Windows".into(),
        ))
    }

    /// Manager over an injected backend. No process hooks are installed;
    /// exceptions are fed in through [`dispatch`](Self::dispatch).
    pub fn with_backend(config: HwbpConfig, backend: Box<dyn ThreadBackend>) -> Self {
        Self {
            shared: Arc::new(Shared::new(config, backend, false)),
        }
    }

    pub fn config(&self) -> &HwbpConfig {
        &self.shared.config
    }

    /// Construct and register an unarmed breakpoint.
    pub fn breakpoint(&self, scope: Scope, run_once: bool) -> Result<Breakpoint> {
        self.shared.ensure_installed()?;
        let state = Arc::new(BreakpointState::new(scope, run_once));
        self.shared.registry.write().push(state.clone());
        debug!("Breakpoint {} registered ({:?}, run_once: {})", state.id, scope, run_once);
        Ok(Breakpoint {
            state,
            shared: self.shared.clone(),
        })
    }

    /// Service a debug exception raised on the calling thread.
    pub fn dispatch(
        &self,
        code: u32,
        faulting_address: usize,
        context: &mut NativeContext,
    ) -> Disposition {
        self.shared.dispatch(code, faulting_address, context)
    }

    /// Apply every live all-threads breakpoint to the calling thread.
    /// Returns how many were applied.
    pub fn replay_on_current_thread(&self) -> usize {
        self.shared.replay_on_current_thread()
    }

    /// Registered breakpoints in creation order
    pub fn breakpoints(&self) -> Vec<BreakpointInfo> {
        self.shared
            .registry
            .read()
            .iter()
            .map(|state| state.info())
            .collect()
    }

    pub fn is_installed(&self) -> bool {
        self.shared.installation.lock().installed
    }

    /// Remove the thread-entry hook, disable every breakpoint and remove
    /// the exception handler. Safe to call repeatedly.
    pub fn terminate(&self) {
        self.shared.terminate();
    }
}

impl Drop for HwbpManager {
    fn drop(&mut self) {
        self.shared.terminate();
    }
}

impl std::fmt::Debug for HwbpManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HwbpManager")
            .field("breakpoints", &self.shared.registry.read().len())
            .field("process_hooks", &self.shared.process_hooks)
            .finish()
    }
}

#[cfg(windows)]
mod native {
    use super::active;
    use crate::dispatch::{EXCEPTION_CONTINUE_SEARCH, EXCEPTION_SINGLE_STEP};
    use crate::export_hook::ExportHookRecord;
    use crate::trampoline::TrampolineBuilder;
    use hwbp_common::{Error, HwbpConfig, Result};
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tracing::debug;
    use windows::Win32::System::Diagnostics::Debug::{
        AddVectoredExceptionHandler, RemoveVectoredExceptionHandler, EXCEPTION_POINTERS,
    };

    /// Trampoline running the unhooked thread-entry thunk
    static THREAD_INIT_ORIGINAL: AtomicUsize = AtomicUsize::new(0);

    /// Vectored handler registration, removed on drop
    pub(super) struct VehRegistration(usize);

    impl VehRegistration {
        pub(super) fn register(first: bool) -> Result<Self> {
            let handle = unsafe { AddVectoredExceptionHandler(first as u32, Some(veh_handler)) };
            if handle.is_null() {
                return Err(Error::os(
                    "AddVectoredExceptionHandler",
                    "no handle returned",
                ));
            }
            debug!("Registered VEH handler (first: {})", first);
            Ok(Self(handle as usize))
        }
    }

    impl Drop for VehRegistration {
        fn drop(&mut self) {
            unsafe {
                RemoveVectoredExceptionHandler(self.0 as *const std::ffi::c_void);
            }
            debug!("Unregistered VEH handler");
        }
    }

    unsafe extern "system" fn veh_handler(exception_info: *mut EXCEPTION_POINTERS) -> i32 {
        let Some(info) = exception_info.as_ref() else {
            return EXCEPTION_CONTINUE_SEARCH;
        };
        let (Some(record), Some(context)) =
            (info.ExceptionRecord.as_ref(), info.ContextRecord.as_mut())
        else {
            return EXCEPTION_CONTINUE_SEARCH;
        };

        let code = record.ExceptionCode.0 as u32;
        if code != EXCEPTION_SINGLE_STEP {
            return EXCEPTION_CONTINUE_SEARCH;
        }
        let Some(shared) = active() else {
            return EXCEPTION_CONTINUE_SEARCH;
        };

        let address = record.ExceptionAddress as usize;
        catch_unwind(AssertUnwindSafe(|| shared.dispatch(code, address, context)))
            .map(|disposition| disposition.to_veh_code())
            .unwrap_or(EXCEPTION_CONTINUE_SEARCH)
    }

    #[cfg(target_arch = "x86_64")]
    type ThreadInitFn = unsafe extern "system" fn(u32, usize, usize);

    #[cfg(target_arch = "x86")]
    type ThreadInitFn = unsafe extern "fastcall" fn(u32, usize, usize);

    #[cfg(target_arch = "x86_64")]
    unsafe extern "system" fn thread_init_detour(state: u32, start: usize, param: usize) {
        on_thread_init(state);
        original_thread_init()(state, start, param)
    }

    #[cfg(target_arch = "x86")]
    unsafe extern "fastcall" fn thread_init_detour(state: u32, start: usize, param: usize) {
        on_thread_init(state);
        original_thread_init()(state, start, param)
    }

    fn on_thread_init(state: u32) {
        // Zero marks a regular thread start
        if state != 0 {
            return;
        }
        let _ = catch_unwind(|| {
            if let Some(shared) = active() {
                shared.replay_on_current_thread();
            }
        });
    }

    unsafe fn original_thread_init() -> ThreadInitFn {
        std::mem::transmute::<usize, ThreadInitFn>(THREAD_INIT_ORIGINAL.load(Ordering::SeqCst))
    }

    pub(super) fn hook_thread_entry(
        builder: &TrampolineBuilder,
        config: &HwbpConfig,
    ) -> Result<ExportHookRecord> {
        let mut record = ExportHookRecord::prepare(
            builder,
            &config.thread_entry_module,
            &config.thread_entry_export,
        )?;
        // Must be visible before the first thread can enter the detour
        THREAD_INIT_ORIGINAL.store(record.original(), Ordering::SeqCst);
        unsafe { record.attach(thread_init_detour as usize)? };
        Ok(record)
    }
}
