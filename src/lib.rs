#![cfg(windows)]
#![deny(unsafe_op_in_unsafe_fn)]
#![allow(clippy::missing_safety_doc)] // we document safety in SAFETY comments

//! umbra: Windows process-memory introspection and detours
//!
//! This library provides typed access to another process's memory and the
//! structures living in it:
//!
//! - Remote memory accessor: typed reads/writes, strings, vectors, region
//!   queries, allocation and protection guards
//! - PE parsing against a live process or a raw file image: headers,
//!   sections, exports, imports, bound imports, relocations, TLS, overlay
//! - Pattern scanning with wildcard masks and XML signature files
//! - Code patching: raw byte patches, trampoline detours, vtable swaps,
//!   and exception-based (INT3 / debug register) hooks
//! - DLL injection and remote export invocation
//!
//! Nothing here is sandboxed; the operator is trusted not to corrupt a live
//! process. Code patches bracket their writes by suspending target threads,
//! but two callers in the controlling process racing on the same address
//! remain the callers' problem.

pub mod disasm;
pub mod error;
pub mod inject;
pub mod patch;
pub mod pe;
pub mod process;
pub mod scan;

// re-exports for convenience
pub use error::{ErrorKind, Result, UmbraError};
pub use inject::{Injector, PathResolution};
pub use patch::{PatchDetour, PatchDr, PatchInt3, PatchRaw, PatchState, PatchVmt};
pub use pe::{AddressMode, DirectoryKind, PeImage};
pub use process::{Process, ProcessAccess};
pub use scan::{FindPolicy, Pattern, Scanner, SignatureFile};

/// library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
