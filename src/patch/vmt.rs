//! Virtual method table patches
//!
//! The original table is never modified. A copy of it is made, individual
//! slots are hooked in the copy, and apply swaps the object's vtable
//! pointer over to the copy; remove restores the original pointer. Only the
//! hooked object is affected, never other instances of the class.

use crate::error::{Result, UmbraError};
use crate::patch::PatchState;
use crate::process::{memory::Protection, Process, RemoteAlloc};

/// cap for the heuristic table-size walk
const MAX_VTABLE_SCAN: usize = 512;

/// a vtable-pointer swap patch for one object
pub struct PatchVmt {
    process: Process,
    /// address of the object (its first pointer-sized field is the vptr)
    object: usize,
    original_table: usize,
    /// None only after detach leaked the copy
    table_copy: Option<RemoteAlloc>,
    table_base: usize,
    count: usize,
    state: PatchState,
}

impl PatchVmt {
    /// read the object's vtable and prepare a hooked copy
    ///
    /// `count` is the number of virtual slots; pass `None` to size the table
    /// heuristically by walking entries until one is not a valid executable
    /// address. the heuristic is a guess and over- or under-counts for
    /// tables adjoining other data.
    pub fn new(process: &Process, object: usize, count: Option<usize>) -> Result<Self> {
        let original_table: usize = process.read(object)?;
        if original_table == 0 {
            return Err(UmbraError::CorruptedStructure {
                name: "vtable",
                reason: "object's vtable pointer is null".into(),
            });
        }

        let count = match count {
            Some(count) => count,
            None => Self::estimate_count(process, original_table)?,
        };
        if count == 0 {
            return Err(UmbraError::CorruptedStructure {
                name: "vtable",
                reason: "no entries found".into(),
            });
        }

        let entries: Vec<usize> = process.read_vec(original_table, count)?;

        let table_copy = process.alloc(
            count * core::mem::size_of::<usize>(),
            Protection::READWRITE,
        )?;
        process.write_slice(table_copy.base(), &entries)?;

        let table_base = table_copy.base();
        Ok(Self {
            process: process.clone(),
            object,
            original_table,
            table_copy: Some(table_copy),
            table_base,
            count,
            state: PatchState::Unapplied,
        })
    }

    fn estimate_count(process: &Process, table: usize) -> Result<usize> {
        let mut count = 0;
        for index in 0..MAX_VTABLE_SCAN {
            let entry: usize =
                match process.read(table + index * core::mem::size_of::<usize>()) {
                    Ok(entry) => entry,
                    Err(_) => break,
                };
            if entry == 0 || !process.can_execute(entry).unwrap_or(false) {
                break;
            }
            count = index + 1;
        }
        Ok(count)
    }

    pub fn object(&self) -> usize {
        self.object
    }

    pub fn original_table(&self) -> usize {
        self.original_table
    }

    /// address of the hooked copy
    pub fn table(&self) -> usize {
        self.table_base
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn state(&self) -> PatchState {
        self.state
    }

    pub fn is_applied(&self) -> bool {
        self.state == PatchState::Applied
    }

    fn slot_address(&self, index: usize) -> Result<usize> {
        if index >= self.count {
            return Err(UmbraError::CorruptedStructure {
                name: "vtable",
                reason: format!("slot {index} out of bounds ({} entries)", self.count),
            });
        }
        Ok(self.table_base + index * core::mem::size_of::<usize>())
    }

    /// overwrite one slot in the copy, returning the original entry so the
    /// hook can chain through it
    pub fn hook_method(&mut self, index: usize, new_fn: usize) -> Result<usize> {
        let slot = self.slot_address(index)?;
        let original: usize = self.process.read(slot)?;
        self.process.write(slot, &new_fn)?;
        Ok(original)
    }

    /// read a slot of the copy
    pub fn method(&self, index: usize) -> Result<usize> {
        let slot = self.slot_address(index)?;
        self.process.read(slot)
    }

    /// swap the object's vtable pointer to the hooked copy
    pub fn apply(&mut self) -> Result<()> {
        if self.state != PatchState::Unapplied {
            return Ok(());
        }
        let table = self.table_base;
        self.process.write(self.object, &table)?;
        self.state = PatchState::Applied;
        tracing::debug!(
            object = format_args!("{:#x}", self.object),
            table = format_args!("{table:#x}"),
            slots = self.count,
            "vtable swapped"
        );
        Ok(())
    }

    /// restore the object's original vtable pointer
    pub fn remove(&mut self) -> Result<()> {
        if self.state != PatchState::Applied {
            return Ok(());
        }
        self.process.write(self.object, &self.original_table)?;
        self.state = PatchState::Unapplied;
        Ok(())
    }

    /// keep the swap in place but stop being responsible for it
    ///
    /// the table copy is leaked: the object still dispatches through it
    pub fn detach(&mut self) {
        if self.state == PatchState::Applied {
            if let Some(copy) = self.table_copy.take() {
                copy.leak();
            }
            self.state = PatchState::Detached;
        }
    }
}

impl Drop for PatchVmt {
    fn drop(&mut self) {
        if self.state == PatchState::Applied {
            if let Err(err) = self.remove() {
                debug_assert!(false, "failed to restore vtable on drop: {err}");
                tracing::warn!(
                    object = format_args!("{:#x}", self.object),
                    %err,
                    "vtable left swapped"
                );
            }
        }
    }
}
