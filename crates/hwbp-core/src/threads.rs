//! Win32 thread backend
//!
//! Enumerates the threads of the current process and reads or writes their
//! debug registers. Debug registers are not tied to the instruction stream,
//! so live threads are updated without being suspended.

use crate::context::{debug_register_context, DebugContext, DebugRegisterSet};
use crate::traits::ThreadBackend;
use hwbp_common::{Error, Result};
use windows::Win32::Foundation::{CloseHandle, HANDLE};
use windows::Win32::System::Diagnostics::Debug::{GetThreadContext, SetThreadContext};
use windows::Win32::System::Diagnostics::ToolHelp::{
    CreateToolhelp32Snapshot, Thread32First, Thread32Next, TH32CS_SNAPTHREAD, THREADENTRY32,
};
use windows::Win32::System::Threading::{
    GetCurrentProcessId, GetCurrentThread, GetCurrentThreadId, OpenThread, THREAD_GET_CONTEXT,
    THREAD_QUERY_INFORMATION, THREAD_SET_CONTEXT,
};

/// Thread handle that closes itself unless it is the current-thread
/// pseudo handle.
struct ThreadHandle {
    handle: HANDLE,
    owned: bool,
}

impl ThreadHandle {
    fn open(thread_id: u32) -> Result<Self> {
        if thread_id == unsafe { GetCurrentThreadId() } {
            return Ok(Self {
                handle: unsafe { GetCurrentThread() },
                owned: false,
            });
        }
        let handle = unsafe {
            OpenThread(
                THREAD_GET_CONTEXT | THREAD_SET_CONTEXT | THREAD_QUERY_INFORMATION,
                false,
                thread_id,
            )
        }
        .map_err(|e| Error::os("OpenThread", e))?;
        Ok(Self {
            handle,
            owned: true,
        })
    }
}

impl Drop for ThreadHandle {
    fn drop(&mut self) {
        if self.owned {
            unsafe {
                let _ = CloseHandle(self.handle);
            }
        }
    }
}

/// [`ThreadBackend`] over the threads of this process
#[derive(Debug, Default, Clone, Copy)]
pub struct Win32Threads;

impl Win32Threads {
    pub fn new() -> Self {
        Self
    }
}

impl ThreadBackend for Win32Threads {
    fn current_thread_id(&self) -> u32 {
        unsafe { GetCurrentThreadId() }
    }

    fn thread_ids(&self) -> Result<Vec<u32>> {
        let pid = unsafe { GetCurrentProcessId() };
        let mut ids = Vec::new();

        unsafe {
            let snapshot = CreateToolhelp32Snapshot(TH32CS_SNAPTHREAD, 0)
                .map_err(|e| Error::os("CreateToolhelp32Snapshot", e))?;

            let mut entry = THREADENTRY32 {
                dwSize: std::mem::size_of::<THREADENTRY32>() as u32,
                ..Default::default()
            };

            if Thread32First(snapshot, &mut entry).is_ok() {
                loop {
                    if entry.th32OwnerProcessID == pid {
                        ids.push(entry.th32ThreadID);
                    }
                    entry.dwSize = std::mem::size_of::<THREADENTRY32>() as u32;
                    if Thread32Next(snapshot, &mut entry).is_err() {
                        break;
                    }
                }
            }

            let _ = CloseHandle(snapshot);
        }

        Ok(ids)
    }

    fn read_debug_registers(&self, thread_id: u32) -> Result<DebugRegisterSet> {
        let thread = ThreadHandle::open(thread_id)?;
        let mut context = debug_register_context();
        unsafe { GetThreadContext(thread.handle, &mut context) }
            .map_err(|e| Error::os("GetThreadContext", e))?;
        Ok(context.debug_registers())
    }

    fn write_debug_registers(&self, thread_id: u32, set: &DebugRegisterSet) -> Result<()> {
        let thread = ThreadHandle::open(thread_id)?;
        let mut context = debug_register_context();
        // Fetch first so DR6 and the flags we don't own are preserved
        unsafe { GetThreadContext(thread.handle, &mut context) }
            .map_err(|e| Error::os("GetThreadContext", e))?;
        context.apply_debug_registers(set);
        unsafe { SetThreadContext(thread.handle, &context) }
            .map_err(|e| Error::os("SetThreadContext", e))
    }
}
