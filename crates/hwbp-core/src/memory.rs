//! Executable memory and code patching

use hwbp_common::{Error, Result};

#[cfg(windows)]
use windows::Win32::System::Diagnostics::Debug::FlushInstructionCache;
#[cfg(windows)]
use windows::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, VirtualProtect, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE,
    PAGE_EXECUTE_READWRITE, PAGE_PROTECTION_FLAGS,
};
#[cfg(windows)]
use windows::Win32::System::Threading::GetCurrentProcess;

/// Bytes reserved for one trampoline: the longest relocated run plus a stub
pub const TRAMPOLINE_ALLOC_SIZE: usize = 128;

/// `VirtualAlloc` reservation granularity
#[cfg(windows)]
const ALLOCATION_GRANULARITY: usize = 0x10000;

/// Largest distance a rel32 displacement can span
const MAX_REL32_DISTANCE: usize = 0x7FFF_0000;

/// Owned block of read/write/execute memory, released on drop.
///
/// Hosts without a native backend get an ordinary heap buffer, which is
/// enough to build and inspect trampolines but not to run them.
#[derive(Debug)]
pub struct ExecutableMemory {
    address: usize,
    len: usize,
    #[cfg(not(windows))]
    backing: Vec<u8>,
}

impl ExecutableMemory {
    /// Allocate `len` bytes, within rel32 reach of `near` when possible.
    #[cfg(windows)]
    pub fn allocate_near(near: Option<usize>, len: usize) -> Result<Self> {
        let address = near
            .and_then(|target| Self::reserve_near(target, len))
            .or_else(|| Self::reserve_at(None, len))
            .ok_or(Error::Allocation { size: len })?;
        Ok(Self { address, len })
    }

    #[cfg(not(windows))]
    pub fn allocate_near(_near: Option<usize>, len: usize) -> Result<Self> {
        let backing = vec![0u8; len];
        Ok(Self {
            address: backing.as_ptr() as usize,
            len,
            backing,
        })
    }

    #[cfg(windows)]
    fn reserve_at(address: Option<usize>, len: usize) -> Option<usize> {
        let mem = unsafe {
            VirtualAlloc(
                address.map(|a| a as *const std::ffi::c_void),
                len,
                MEM_COMMIT | MEM_RESERVE,
                PAGE_EXECUTE_READWRITE,
            )
        };
        (!mem.is_null()).then_some(mem as usize)
    }

    /// Probe outward from `target` one reservation unit at a time.
    #[cfg(windows)]
    fn reserve_near(target: usize, len: usize) -> Option<usize> {
        let base = target & !(ALLOCATION_GRANULARITY - 1);
        let mut distance = ALLOCATION_GRANULARITY;

        while distance <= MAX_REL32_DISTANCE {
            let below = base.checked_sub(distance);
            let above = base.checked_add(distance);
            for candidate in [below, above].into_iter().flatten() {
                if let Some(address) = Self::reserve_at(Some(candidate), len) {
                    return Some(address);
                }
            }
            distance += ALLOCATION_GRANULARITY;
        }
        None
    }

    pub fn address(&self) -> usize {
        self.address
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True if a rel32 displacement from anywhere in this block reaches
    /// `target`.
    pub fn within_rel32(&self, target: usize) -> bool {
        let distance = if target > self.address {
            target - self.address
        } else {
            self.address - target
        };
        distance.saturating_add(self.len) <= MAX_REL32_DISTANCE
    }

    pub fn write(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        if offset
            .checked_add(bytes.len())
            .map_or(true, |end| end > self.len)
        {
            return Err(Error::MemoryAccess {
                address: self.address.wrapping_add(offset),
                message: format!("write of {} bytes past end of block", bytes.len()),
            });
        }
        self.copy_in(offset, bytes);
        Ok(())
    }

    #[cfg(windows)]
    fn copy_in(&mut self, offset: usize, bytes: &[u8]) {
        let dest = self.address + offset;
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), dest as *mut u8, bytes.len());
            let _ = FlushInstructionCache(
                GetCurrentProcess(),
                Some(dest as *const std::ffi::c_void),
                bytes.len(),
            );
        }
    }

    #[cfg(not(windows))]
    fn copy_in(&mut self, offset: usize, bytes: &[u8]) {
        self.backing[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    #[cfg(windows)]
    pub fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.address as *const u8, self.len) }
    }

    #[cfg(not(windows))]
    pub fn bytes(&self) -> &[u8] {
        &self.backing
    }
}

#[cfg(windows)]
impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = VirtualFree(self.address as *mut std::ffi::c_void, 0, MEM_RELEASE) {
                tracing::warn!("VirtualFree({:#x}) failed: {}", self.address, e);
            }
        }
    }
}

/// Copy `len` bytes starting at `address`.
///
/// # Safety
/// The whole range must be readable.
pub unsafe fn read_bytes(address: usize, len: usize) -> Vec<u8> {
    std::slice::from_raw_parts(address as *const u8, len).to_vec()
}

/// Overwrite code at `address`, restoring the page protection afterwards.
///
/// # Safety
/// No thread may be executing inside the patched range.
#[cfg(windows)]
pub unsafe fn patch_code(address: usize, bytes: &[u8]) -> Result<()> {
    let mut old_protect = PAGE_PROTECTION_FLAGS(0);
    VirtualProtect(
        address as *const std::ffi::c_void,
        bytes.len(),
        PAGE_EXECUTE_READWRITE,
        &mut old_protect,
    )
    .map_err(|e| Error::os("VirtualProtect", e))?;

    std::ptr::copy_nonoverlapping(bytes.as_ptr(), address as *mut u8, bytes.len());

    let mut restored = PAGE_PROTECTION_FLAGS(0);
    if let Err(e) = VirtualProtect(
        address as *const std::ffi::c_void,
        bytes.len(),
        old_protect,
        &mut restored,
    ) {
        tracing::warn!("Failed to restore protection at {:#x}: {}", address, e);
    }
    let _ = FlushInstructionCache(
        GetCurrentProcess(),
        Some(address as *const std::ffi::c_void),
        bytes.len(),
    );
    Ok(())
}

#[cfg(not(windows))]
pub unsafe fn patch_code(address: usize, _bytes: &[u8]) -> Result<()> {
    Err(Error::Unsupported(format!("code patching at {:#x}", address)))
}
