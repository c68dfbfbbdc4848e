//! Raw byte patches
//!
//! The apply sequence is suspend-verify-write-resume: all target threads are
//! frozen, the patch refuses to proceed while any frozen thread's
//! instruction pointer sits inside the bytes about to change, the originals
//! are saved, the new bytes are written and the instruction cache flushed,
//! then the threads resume. The freeze is the mutual exclusion; there is no
//! separate lock.

use crate::error::{Result, UmbraError};
use crate::patch::{write_code, PatchState};
use crate::process::{Process, ThreadFreeze};

/// a raw byte patch over target memory
pub struct PatchRaw {
    process: Process,
    target: usize,
    data: Vec<u8>,
    saved: Vec<u8>,
    state: PatchState,
}

impl PatchRaw {
    /// prepare a patch writing `data` at `target`
    pub fn new(process: &Process, target: usize, data: Vec<u8>) -> Self {
        Self {
            process: process.clone(),
            target,
            data,
            saved: Vec::new(),
            state: PatchState::Unapplied,
        }
    }

    pub fn target(&self) -> usize {
        self.target
    }

    pub fn state(&self) -> PatchState {
        self.state
    }

    pub fn is_applied(&self) -> bool {
        self.state == PatchState::Applied
    }

    /// the bytes that were overwritten (empty before the first apply)
    pub fn saved_bytes(&self) -> &[u8] {
        &self.saved
    }

    /// install the patch; a no-op when already applied or detached
    pub fn apply(&mut self) -> Result<()> {
        if self.state != PatchState::Unapplied {
            return Ok(());
        }

        // preallocate before freezing: a frozen thread may hold the heap lock
        let mut saved = vec![0u8; self.data.len()];

        let freeze = ThreadFreeze::freeze(&self.process)?;
        if let Some(tid) = freeze.ip_in_range(self.target, self.data.len())? {
            return Err(UmbraError::ThreadInPatchRange {
                tid,
                ip: self.target,
            });
        }

        self.process.read_bytes(self.target, &mut saved)?;
        write_code(&self.process, self.target, &self.data)?;
        drop(freeze);

        self.saved = saved;
        self.state = PatchState::Applied;
        tracing::debug!(
            address = format_args!("{:#x}", self.target),
            len = self.data.len(),
            "raw patch applied"
        );
        Ok(())
    }

    /// restore the saved bytes; a no-op when not applied
    pub fn remove(&mut self) -> Result<()> {
        if self.state != PatchState::Applied {
            return Ok(());
        }

        let freeze = ThreadFreeze::freeze(&self.process)?;
        if let Some(tid) = freeze.ip_in_range(self.target, self.saved.len())? {
            return Err(UmbraError::ThreadInPatchRange {
                tid,
                ip: self.target,
            });
        }

        write_code(&self.process, self.target, &self.saved)?;
        drop(freeze);

        self.state = PatchState::Unapplied;
        tracing::debug!(address = format_args!("{:#x}", self.target), "raw patch removed");
        Ok(())
    }

    /// keep the patch applied but stop being responsible for undoing it
    pub fn detach(&mut self) {
        if self.state == PatchState::Applied {
            self.state = PatchState::Detached;
        }
    }
}

impl Drop for PatchRaw {
    fn drop(&mut self) {
        if self.state == PatchState::Applied {
            if let Err(err) = self.remove() {
                debug_assert!(false, "failed to remove patch on drop: {err}");
                tracing::warn!(
                    address = format_args!("{:#x}", self.target),
                    %err,
                    "patch left applied"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{memory::Protection, ProcessAccess};

    fn open_self() -> Process {
        Process::open(std::process::id(), ProcessAccess::all()).expect("open self")
    }

    #[test]
    fn test_apply_remove_roundtrip() {
        let proc = open_self();
        let alloc = proc.alloc(64, Protection::EXECUTE_READWRITE).expect("alloc");

        let original = [0x90u8, 0x90, 0x90, 0x90, 0xC3];
        proc.write_bytes(alloc.base(), &original).expect("seed");

        let replacement = vec![0xB8u8, 0x2A, 0x00, 0x00, 0x00];
        let mut patch = PatchRaw::new(&proc, alloc.base(), replacement.clone());

        let mut before = [0u8; 5];
        proc.read_bytes(alloc.base(), &mut before).expect("read");

        patch.apply().expect("apply");
        assert!(patch.is_applied());

        let mut after_apply = [0u8; 5];
        proc.read_bytes(alloc.base(), &mut after_apply).expect("read");
        assert_eq!(after_apply.to_vec(), replacement);
        assert_ne!(after_apply, before);

        patch.remove().expect("remove");
        let mut after_remove = [0u8; 5];
        proc.read_bytes(alloc.base(), &mut after_remove).expect("read");
        assert_eq!(after_remove, before);
    }

    #[test]
    fn test_apply_is_idempotent() {
        let proc = open_self();
        let alloc = proc.alloc(16, Protection::READWRITE).expect("alloc");

        let mut patch = PatchRaw::new(&proc, alloc.base(), vec![0xAA, 0xBB]);
        patch.apply().expect("apply");
        let saved = patch.saved_bytes().to_vec();

        // second apply must not re-save the patched bytes
        patch.apply().expect("apply again");
        assert_eq!(patch.saved_bytes(), saved.as_slice());

        patch.remove().expect("remove");
        patch.remove().expect("remove again");
        assert_eq!(patch.state(), PatchState::Unapplied);
    }

    #[test]
    fn test_drop_restores() {
        let proc = open_self();
        let alloc = proc.alloc(16, Protection::READWRITE).expect("alloc");
        proc.write_bytes(alloc.base(), &[0x11, 0x22, 0x33]).expect("seed");

        {
            let mut patch = PatchRaw::new(&proc, alloc.base(), vec![0x44, 0x55, 0x66]);
            patch.apply().expect("apply");
        }

        let mut after = [0u8; 3];
        proc.read_bytes(alloc.base(), &mut after).expect("read");
        assert_eq!(after, [0x11, 0x22, 0x33]);
    }

    #[test]
    fn test_detach_keeps_bytes() {
        let proc = open_self();
        let alloc = proc.alloc(16, Protection::READWRITE).expect("alloc");
        proc.write_bytes(alloc.base(), &[0x00, 0x00]).expect("seed");

        {
            let mut patch = PatchRaw::new(&proc, alloc.base(), vec![0x77, 0x88]);
            patch.apply().expect("apply");
            patch.detach();
        }

        let mut after = [0u8; 2];
        proc.read_bytes(alloc.base(), &mut after).expect("read");
        assert_eq!(after, [0x77, 0x88], "detached patch must not be undone");
    }
}
