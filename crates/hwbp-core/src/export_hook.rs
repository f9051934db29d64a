//! Inline hook on a module export
//!
//! Used once per process to route the thread-entry thunk through our
//! detour. Installation is split in two so the caller can publish the
//! trampoline address before any thread can reach the detour:
//!
//! 1. [`ExportHookRecord::prepare`] resolves the export, saves the bytes
//!    that will be overwritten and builds a trampoline from them.
//! 2. [`ExportHookRecord::attach`] writes the jump.

use crate::hooks::{generate_nops, jump_stub, JUMP_STUB_SIZE};
use crate::memory::patch_code;
use crate::pe::resolve_export;
use crate::trampoline::{TrampolineBlock, TrampolineBuilder};
use hwbp_common::Result;
use std::mem::ManuallyDrop;
use tracing::{debug, warn};

pub struct ExportHookRecord {
    module: String,
    export: String,
    hooked_address: usize,
    trampoline: ManuallyDrop<TrampolineBlock>,
    attached: bool,
}

impl ExportHookRecord {
    /// Resolve `module!export` and build its trampoline. Nothing is patched.
    pub fn prepare(builder: &TrampolineBuilder, module: &str, export: &str) -> Result<Self> {
        let address = resolve_export(module, export)?;
        unsafe { Self::prepare_at(builder, address, module, export) }
    }

    /// Like [`prepare`](Self::prepare) for an already known address. The
    /// names are only used for logging.
    ///
    /// # Safety
    /// `address` must be the entry of a function at least
    /// `JUMP_STUB_SIZE + MAX_INSTRUCTION_LEN` bytes long whose first
    /// instructions are not branch targets.
    pub unsafe fn prepare_at(
        builder: &TrampolineBuilder,
        address: usize,
        module: &str,
        export: &str,
    ) -> Result<Self> {
        let trampoline = builder.build_for_patch(address, JUMP_STUB_SIZE)?;
        debug!(
            "Prepared hook on {}!{} at {:#x}: {} bytes saved, trampoline at {:#x}",
            module,
            export,
            address,
            trampoline.original_bytes().len(),
            trampoline.address()
        );
        Ok(Self {
            module: module.to_string(),
            export: export.to_string(),
            hooked_address: address,
            trampoline: ManuallyDrop::new(trampoline),
            attached: false,
        })
    }

    pub fn hooked_address(&self) -> usize {
        self.hooked_address
    }

    /// Calling this runs the unhooked export
    pub fn original(&self) -> usize {
        self.trampoline.address()
    }

    pub fn saved_bytes(&self) -> &[u8] {
        self.trampoline.original_bytes()
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// Bytes written over the export: a jump to `detour`, padded with NOPs
    /// to the end of the last displaced instruction.
    pub fn patch_bytes(&self, detour: usize) -> Vec<u8> {
        let mut patch = jump_stub(self.hooked_address, detour);
        patch.extend(generate_nops(self.saved_bytes().len() - patch.len()));
        patch
    }

    /// Redirect the export to `detour`. Does nothing if already attached.
    ///
    /// # Safety
    /// `detour` must have the export's signature and calling convention.
    pub unsafe fn attach(&mut self, detour: usize) -> Result<()> {
        if self.attached {
            return Ok(());
        }
        let patch = self.patch_bytes(detour);
        patch_code(self.hooked_address, &patch)?;
        self.attached = true;
        debug!(
            "Hooked {}!{} -> {:#x}",
            self.module, self.export, detour
        );
        Ok(())
    }

    /// Put the saved bytes back. Idempotent.
    pub fn detach(&mut self) -> Result<()> {
        if !self.attached {
            return Ok(());
        }
        unsafe { patch_code(self.hooked_address, self.trampoline.original_bytes())? };
        self.attached = false;
        debug!("Unhooked {}!{}", self.module, self.export);
        Ok(())
    }
}

impl Drop for ExportHookRecord {
    fn drop(&mut self) {
        match self.detach() {
            Ok(()) => unsafe { ManuallyDrop::drop(&mut self.trampoline) },
            Err(e) => {
                // The patch still jumps into code that calls the trampoline
                warn!(
                    "Failed to unhook {}!{}, leaking trampoline: {}",
                    self.module, self.export, e
                );
            }
        }
    }
}

impl std::fmt::Debug for ExportHookRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportHookRecord")
            .field("module", &self.module)
            .field("export", &self.export)
            .field("hooked_address", &format_args!("{:#x}", self.hooked_address))
            .field("trampoline", &format_args!("{:#x}", self.original()))
            .field("attached", &self.attached)
            .finish()
    }
}
