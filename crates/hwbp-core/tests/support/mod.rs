//! In-memory thread backend for driving the manager without real threads

#![allow(dead_code)]

use hwbp_core::{DebugContext, DebugRegisterSet, NativeContext, ThreadBackend};
use hwbp_common::{Error, Result};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct Inner {
    threads: Mutex<BTreeMap<u32, DebugRegisterSet>>,
    current: AtomicU32,
}

/// Cloneable handle; one clone goes into the manager, the test keeps another
#[derive(Clone, Default)]
pub struct FakeThreads {
    inner: Arc<Inner>,
}

impl FakeThreads {
    /// Threads `ids`, with the first one current
    pub fn with_threads(ids: &[u32]) -> Self {
        let fake = Self::default();
        for &id in ids {
            fake.spawn(id);
        }
        if let Some(&first) = ids.first() {
            fake.set_current(first);
        }
        fake
    }

    pub fn spawn(&self, id: u32) {
        self.inner
            .threads
            .lock()
            .unwrap()
            .insert(id, DebugRegisterSet::default());
    }

    pub fn set_current(&self, id: u32) {
        self.inner.current.store(id, Ordering::SeqCst);
    }

    pub fn registers(&self, id: u32) -> DebugRegisterSet {
        self.inner.threads.lock().unwrap()[&id]
    }

    pub fn set_registers(&self, id: u32, set: DebugRegisterSet) {
        self.inner.threads.lock().unwrap().insert(id, set);
    }

    /// Exception context of thread `id` as it would look on a trap
    pub fn trap_context(&self, id: u32, ip: usize, dr6: u64) -> NativeContext {
        let mut context = NativeContext::default();
        context.apply_debug_registers(&self.registers(id));
        context.set_instruction_pointer(ip);
        set_dr6(&mut context, dr6);
        context
    }

    /// Write the trap context's debug registers back, as the OS does when
    /// the thread resumes
    pub fn resume(&self, id: u32, context: &NativeContext) {
        self.set_registers(id, context.debug_registers());
    }
}

#[cfg(not(windows))]
pub fn set_dr6(context: &mut NativeContext, dr6: u64) {
    context.dr6 = dr6 as usize;
}

#[cfg(windows)]
pub fn set_dr6(context: &mut NativeContext, dr6: u64) {
    context.Dr6 = dr6 as _;
}

impl ThreadBackend for FakeThreads {
    fn current_thread_id(&self) -> u32 {
        self.inner.current.load(Ordering::SeqCst)
    }

    fn thread_ids(&self) -> Result<Vec<u32>> {
        Ok(self.inner.threads.lock().unwrap().keys().copied().collect())
    }

    fn read_debug_registers(&self, thread_id: u32) -> Result<DebugRegisterSet> {
        self.inner
            .threads
            .lock()
            .unwrap()
            .get(&thread_id)
            .copied()
            .ok_or_else(|| Error::os("OpenThread", format!("no thread {}", thread_id)))
    }

    fn write_debug_registers(&self, thread_id: u32, set: &DebugRegisterSet) -> Result<()> {
        match self.inner.threads.lock().unwrap().get_mut(&thread_id) {
            Some(slot) => {
                *slot = *set;
                Ok(())
            }
            None => Err(Error::os("SetThreadContext", format!("no thread {}", thread_id))),
        }
    }
}

/// Code buffer padded with NOPs so decoding never runs off the end
pub fn code(bytes: &[u8]) -> Vec<u8> {
    let mut buf = bytes.to_vec();
    buf.resize(bytes.len() + 32, 0x90);
    buf
}
