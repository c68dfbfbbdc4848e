//! Unified error types for umbra

use core::fmt;

use crate::pe::DirectoryKind;

/// coarse classification of an error, matching how callers recover
///
/// probing code typically ignores `Structural` and `NotFound` while letting
/// `OsCall` propagate; `Invariant` means a caller bug and is never caught.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// an OS call reported failure; carries the originating API and code
    OsCall,
    /// a parsed structure was malformed or absent
    Structural,
    /// a caller violated a documented precondition
    Invariant,
    /// a lookup missed and the caller asked for escalation
    NotFound,
}

/// all errors that can occur in umbra
#[derive(Debug)]
pub enum UmbraError {
    // === OS calls ===
    /// underlying Win32 API returned an error indicator
    Win32Error { api: &'static str, code: u32 },

    /// memory read transferred fewer bytes than requested or failed outright
    ReadFailed { address: usize, size: usize, code: u32 },

    /// memory write transferred fewer bytes than requested or failed outright
    WriteFailed { address: usize, size: usize, code: u32 },

    /// failed to change page protection
    ProtectionChangeFailed { address: usize, size: usize, code: u32 },

    /// remote allocation failed
    AllocationFailed { size: usize, protection: u32, code: u32 },

    /// remote thread creation or wait failed
    RemoteThreadFailed { reason: String, code: u32 },

    /// remote thread did not finish within the requested timeout
    RemoteThreadTimeout { millis: u32 },

    /// failed to suspend or resume a target thread
    ThreadSuspendFailed { tid: u32, code: u32 },

    // === structural ===
    /// DOS signature mismatch ("MZ" expected)
    BadDosSignature { found: u16 },

    /// e_lfanew points outside any plausible range
    BadNtOffset { offset: i32 },

    /// NT signature mismatch ("PE\0\0" expected)
    BadNtSignature { found: u32 },

    /// optional header magic is neither PE32 nor PE32+
    BadOptionalMagic { found: u16 },

    /// the governing data-directory entry is zero
    DirectoryAbsent { directory: DirectoryKind },

    /// the file ends exactly at the last section; there is no overlay
    NoOverlay,

    /// section data extends beyond the end of the file
    MalformedOverlay { section_end: usize, file_size: usize },

    /// a null-terminated string exceeded the read cap
    UnterminatedString { address: usize, cap: usize },

    /// pattern text could not be parsed
    BadPattern { reason: String },

    /// signature file could not be parsed or written
    SignatureFile { reason: String },

    /// terminal-format error from a structure walk
    CorruptedStructure { name: &'static str, reason: String },

    // === invariants ===
    /// scan region constructed with end < start
    EmptyRegion { start: usize, end: usize },

    /// a hook is already registered for this target (or this thread)
    AlreadyHooked { target: usize },

    /// a suspended thread's instruction pointer sits inside the patch range
    ThreadInPatchRange { tid: u32, ip: usize },

    /// all four hardware breakpoint slots of the thread are in use
    NoFreeDebugRegister { tid: u32 },

    /// instruction stream could not be decoded to a safe patch boundary
    NoInstructionBoundary { address: usize, needed: usize },

    /// an instruction in the patch range cannot be moved to the trampoline
    UnrelocatableInstruction { address: usize },

    // === not-found escalations ===
    /// pattern scan missed under the strict policy
    PatternNotFound { name: String },

    /// export lookup missed under escalation
    ExportNotFound { module: usize, name: String },

    /// no module with the given name in the target
    ModuleNotFound { name: String },

    /// no process matched the selector
    ProcessNotFound { name: String },

    /// more than one process matched a by-name selector
    ProcessNameAmbiguous { name: String, count: usize },
}

impl UmbraError {
    /// classify this error for recovery decisions
    pub fn kind(&self) -> ErrorKind {
        use UmbraError::*;
        match self {
            Win32Error { .. }
            | ReadFailed { .. }
            | WriteFailed { .. }
            | ProtectionChangeFailed { .. }
            | AllocationFailed { .. }
            | RemoteThreadFailed { .. }
            | RemoteThreadTimeout { .. }
            | ThreadSuspendFailed { .. } => ErrorKind::OsCall,

            BadDosSignature { .. }
            | BadNtOffset { .. }
            | BadNtSignature { .. }
            | BadOptionalMagic { .. }
            | DirectoryAbsent { .. }
            | NoOverlay
            | MalformedOverlay { .. }
            | UnterminatedString { .. }
            | BadPattern { .. }
            | SignatureFile { .. }
            | CorruptedStructure { .. } => ErrorKind::Structural,

            EmptyRegion { .. }
            | AlreadyHooked { .. }
            | ThreadInPatchRange { .. }
            | NoFreeDebugRegister { .. }
            | NoInstructionBoundary { .. }
            | UnrelocatableInstruction { .. } => ErrorKind::Invariant,

            PatternNotFound { .. }
            | ExportNotFound { .. }
            | ModuleNotFound { .. }
            | ProcessNotFound { .. }
            | ProcessNameAmbiguous { .. } => ErrorKind::NotFound,
        }
    }

    /// create Win32Error from GetLastError
    pub fn from_last_error(api: &'static str) -> Self {
        Self::Win32Error { api, code: Self::last_os_error() }
    }

    /// the calling thread's last OS error code
    pub fn last_os_error() -> u32 {
        // SAFETY: GetLastError is always safe to call
        unsafe { GetLastError() }
    }
}

impl fmt::Display for UmbraError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Win32Error { api, code } => {
                write!(f, "{api} failed with error {code:#x}")
            }
            Self::ReadFailed { address, size, code } => {
                write!(f, "failed to read {size} bytes at {address:#x} (error {code:#x})")
            }
            Self::WriteFailed { address, size, code } => {
                write!(f, "failed to write {size} bytes at {address:#x} (error {code:#x})")
            }
            Self::ProtectionChangeFailed { address, size, code } => {
                write!(
                    f,
                    "failed to change protection for {size} bytes at {address:#x} (error {code:#x})"
                )
            }
            Self::AllocationFailed { size, protection, code } => {
                write!(
                    f,
                    "failed to allocate {size} bytes with protection {protection:#x} (error {code:#x})"
                )
            }
            Self::RemoteThreadFailed { reason, code } => {
                write!(f, "remote thread failed: {reason} (error {code:#x})")
            }
            Self::RemoteThreadTimeout { millis } => {
                write!(f, "remote thread did not complete within {millis} ms")
            }
            Self::ThreadSuspendFailed { tid, code } => {
                write!(f, "failed to suspend/resume thread {tid} (error {code:#x})")
            }
            Self::BadDosSignature { found } => {
                write!(f, "bad DOS signature: {found:#06x}")
            }
            Self::BadNtOffset { offset } => {
                write!(f, "implausible e_lfanew: {offset:#x}")
            }
            Self::BadNtSignature { found } => {
                write!(f, "bad NT signature: {found:#010x}")
            }
            Self::BadOptionalMagic { found } => {
                write!(f, "unknown optional header magic: {found:#06x}")
            }
            Self::DirectoryAbsent { directory } => {
                write!(f, "data directory absent: {directory:?}")
            }
            Self::NoOverlay => {
                write!(f, "file has no overlay")
            }
            Self::MalformedOverlay { section_end, file_size } => {
                write!(
                    f,
                    "section data ends at {section_end:#x}, beyond file size {file_size:#x}"
                )
            }
            Self::UnterminatedString { address, cap } => {
                write!(f, "no terminator within {cap} bytes reading string at {address:#x}")
            }
            Self::BadPattern { reason } => {
                write!(f, "bad pattern: {reason}")
            }
            Self::SignatureFile { reason } => {
                write!(f, "signature file error: {reason}")
            }
            Self::CorruptedStructure { name, reason } => {
                write!(f, "corrupted structure {name}: {reason}")
            }
            Self::EmptyRegion { start, end } => {
                write!(f, "scan region end {end:#x} precedes start {start:#x}")
            }
            Self::AlreadyHooked { target } => {
                write!(f, "target {target:#x} is already hooked")
            }
            Self::ThreadInPatchRange { tid, ip } => {
                write!(f, "thread {tid} is executing at {ip:#x}, inside the patch range")
            }
            Self::NoFreeDebugRegister { tid } => {
                write!(f, "no free debug register on thread {tid}")
            }
            Self::NoInstructionBoundary { address, needed } => {
                write!(f, "no instruction boundary covering {needed} bytes at {address:#x}")
            }
            Self::UnrelocatableInstruction { address } => {
                write!(f, "instruction at {address:#x} cannot be relocated")
            }
            Self::PatternNotFound { name } => {
                write!(f, "pattern not found: {name}")
            }
            Self::ExportNotFound { module, name } => {
                write!(f, "export {name} not found in module {module:#x}")
            }
            Self::ModuleNotFound { name } => {
                write!(f, "module not found: {name}")
            }
            Self::ProcessNotFound { name } => {
                write!(f, "process not found: {name}")
            }
            Self::ProcessNameAmbiguous { name, count } => {
                write!(f, "{count} processes match name {name}; expected exactly one")
            }
        }
    }
}

impl std::error::Error for UmbraError {}

/// result type alias using UmbraError
pub type Result<T> = std::result::Result<T, UmbraError>;

#[link(name = "kernel32")]
extern "system" {
    fn GetLastError() -> u32;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        let os = UmbraError::Win32Error { api: "OpenProcess", code: 5 };
        assert_eq!(os.kind(), ErrorKind::OsCall);

        let st = UmbraError::BadDosSignature { found: 0 };
        assert_eq!(st.kind(), ErrorKind::Structural);

        let inv = UmbraError::EmptyRegion { start: 8, end: 4 };
        assert_eq!(inv.kind(), ErrorKind::Invariant);

        let nf = UmbraError::PatternNotFound { name: "x".into() };
        assert_eq!(nf.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_display_carries_code() {
        let err = UmbraError::ReadFailed { address: 0x1000, size: 16, code: 0x12d };
        let text = err.to_string();
        assert!(text.contains("0x1000"));
        assert!(text.contains("0x12d"));
    }
}
