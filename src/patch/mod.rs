//! Code patching
//!
//! Every patch variant walks the same state machine:
//!
//! ```text
//! Unapplied -> Applied -> Unapplied   (apply / remove)
//!                 |
//!                 v
//!              Detached               (responsibility transferred)
//! ```
//!
//! `apply` on an applied patch and `remove` on an unapplied one are no-ops.
//! Dropping an applied patch attempts removal, asserts on failure in debug
//! builds and swallows the error in release: a failed unpatch during unwind
//! must not take the process down.

pub mod detour;
pub mod raw;
pub mod veh;
pub mod vmt;

use crate::error::Result;
use crate::process::{memory::Protection, Process};

pub use detour::PatchDetour;
pub use raw::PatchRaw;
pub use veh::{DebugRegister, PatchDr, PatchInt3};
pub use vmt::PatchVmt;

/// lifecycle state shared by all patch variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PatchState {
    #[default]
    Unapplied,
    Applied,
    /// applied, but no longer this object's responsibility to undo
    Detached,
}

/// write bytes over (possibly executable) target memory
///
/// protection is raised for the write and restored afterwards, then the
/// instruction cache is flushed for the range.
pub(crate) fn write_code(process: &Process, address: usize, bytes: &[u8]) -> Result<()> {
    {
        let _guard = process.protect_guard(address, bytes.len(), Protection::EXECUTE_READWRITE)?;
        process.write_bytes(address, bytes)?;
    }
    process.flush_instruction_cache(address, bytes.len())
}
