//! Target process handles
//!
//! A [`Process`] is a cheap-clone value handle over a shared OS handle. Many
//! cursors and patches reference the same process concurrently, so the handle
//! is reference-counted; the underlying OS handle is closed when the last
//! clone is dropped.

pub mod enumerate;
pub mod memory;
pub mod threads;

use std::sync::Arc;

use crate::error::{Result, UmbraError};

pub use enumerate::{find_module, modules, processes, ModuleInfo, ProcessEntry};
pub use memory::{Protection, RegionInfo, RemoteAlloc, RemoteProtectGuard};
pub use threads::ThreadFreeze;

/// process access rights configuration
#[derive(Debug, Clone, Copy)]
pub struct ProcessAccess {
    pub rights: u32,
}

impl ProcessAccess {
    pub const fn all() -> Self {
        Self { rights: PROCESS_ALL_ACCESS }
    }

    pub const fn read_write() -> Self {
        Self {
            rights: PROCESS_VM_READ
                | PROCESS_VM_WRITE
                | PROCESS_VM_OPERATION
                | PROCESS_QUERY_INFORMATION
                | PROCESS_CREATE_THREAD
                | PROCESS_SUSPEND_RESUME,
        }
    }

    pub const fn read_only() -> Self {
        Self {
            rights: PROCESS_VM_READ | PROCESS_QUERY_INFORMATION,
        }
    }

    pub const fn custom(rights: u32) -> Self {
        Self { rights }
    }
}

impl Default for ProcessAccess {
    fn default() -> Self {
        Self::all()
    }
}

struct ProcessInner {
    handle: usize,
    pid: u32,
    owns_handle: bool,
}

impl Drop for ProcessInner {
    fn drop(&mut self) {
        if self.owns_handle && self.handle != 0 {
            // SAFETY: we own the handle and nobody else references it
            unsafe { CloseHandle(self.handle) };
        }
    }
}

/// shared handle to a target process
///
/// clones share the same OS handle. equality is defined by PID alone, so two
/// handles opened independently against the same process compare equal.
#[derive(Clone)]
pub struct Process {
    inner: Arc<ProcessInner>,
}

impl Process {
    /// open a process by PID with the given access rights
    pub fn open(pid: u32, access: ProcessAccess) -> Result<Self> {
        // SAFETY: OpenProcess has no pointer parameters
        let handle = unsafe { OpenProcess(access.rights, 0, pid) };
        if handle == 0 {
            return Err(UmbraError::from_last_error("OpenProcess"));
        }

        Ok(Self {
            inner: Arc::new(ProcessInner {
                handle,
                pid,
                owns_handle: true,
            }),
        })
    }

    /// open a process by executable name
    ///
    /// the name must match exactly one running process (case-insensitive);
    /// zero matches and multiple matches are both errors.
    pub fn open_by_name(name: &str, access: ProcessAccess) -> Result<Self> {
        let name_lower = name.to_lowercase();
        let matches: Vec<u32> = enumerate::processes()?
            .into_iter()
            .filter(|p| p.name.to_lowercase() == name_lower)
            .map(|p| p.pid)
            .collect();

        match matches.len() {
            0 => Err(UmbraError::ProcessNotFound { name: name.into() }),
            1 => Self::open(matches[0], access),
            n => Err(UmbraError::ProcessNameAmbiguous {
                name: name.into(),
                count: n,
            }),
        }
    }

    /// open the process owning a top-level window, selected by class and/or title
    pub fn open_by_window(
        class: Option<&str>,
        title: Option<&str>,
        access: ProcessAccess,
    ) -> Result<Self> {
        let class_wide: Vec<u16>;
        let title_wide: Vec<u16>;

        let class_ptr = match class {
            Some(c) => {
                class_wide = c.encode_utf16().chain(core::iter::once(0)).collect();
                class_wide.as_ptr()
            }
            None => core::ptr::null(),
        };

        let title_ptr = match title {
            Some(t) => {
                title_wide = t.encode_utf16().chain(core::iter::once(0)).collect();
                title_wide.as_ptr()
            }
            None => core::ptr::null(),
        };

        // SAFETY: pointers are valid NUL-terminated wide strings or null
        let hwnd = unsafe { FindWindowW(class_ptr, title_ptr) };
        if hwnd == 0 {
            return Err(UmbraError::from_last_error("FindWindowW"));
        }

        let mut pid: u32 = 0;
        // SAFETY: hwnd is a valid window handle, pid points to stack storage
        unsafe { GetWindowThreadProcessId(hwnd, &mut pid) };
        if pid == 0 {
            return Err(UmbraError::from_last_error("GetWindowThreadProcessId"));
        }

        Self::open(pid, access)
    }

    /// handle to the current process (pseudo-handle, never closed)
    pub fn current() -> Self {
        // SAFETY: both calls are always safe
        let (handle, pid) = unsafe { (GetCurrentProcess(), GetCurrentProcessId()) };
        Self {
            inner: Arc::new(ProcessInner {
                handle,
                pid,
                owns_handle: false,
            }),
        }
    }

    /// wrap an existing handle without taking ownership
    ///
    /// # Safety
    /// the handle must stay valid for the lifetime of the returned value and
    /// carry the access rights the caller intends to exercise
    pub unsafe fn from_handle(handle: usize, pid: u32) -> Self {
        Self {
            inner: Arc::new(ProcessInner {
                handle,
                pid,
                owns_handle: false,
            }),
        }
    }

    /// the raw OS handle
    pub fn handle(&self) -> usize {
        self.inner.handle
    }

    /// the process ID
    pub fn pid(&self) -> u32 {
        self.inner.pid
    }

    /// whether this handle refers to the calling process
    pub fn is_current(&self) -> bool {
        // SAFETY: GetCurrentProcessId is always safe
        self.inner.pid == unsafe { GetCurrentProcessId() }
    }

    /// whether the target runs under WoW64 (32-bit process on 64-bit Windows)
    pub fn is_wow64(&self) -> Result<bool> {
        let mut wow64: i32 = 0;
        // SAFETY: handle is valid, wow64 points to stack storage
        let ok = unsafe { IsWow64Process(self.inner.handle, &mut wow64) };
        if ok == 0 {
            return Err(UmbraError::from_last_error("IsWow64Process"));
        }
        Ok(wow64 != 0)
    }

    /// whether the target is a 64-bit process
    pub fn is_64(&self) -> Result<bool> {
        if cfg!(target_pointer_width = "64") {
            Ok(!self.is_wow64()?)
        } else {
            // a 32-bit caller can only meaningfully target 32-bit processes
            Ok(false)
        }
    }
}

impl PartialEq for Process {
    fn eq(&self, other: &Self) -> bool {
        self.inner.pid == other.inner.pid
    }
}

impl Eq for Process {}

impl core::fmt::Debug for Process {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.inner.pid)
            .field("handle", &format_args!("{:#x}", self.inner.handle))
            .finish()
    }
}

// SAFETY: the handle is process-wide state, safe to move and share
unsafe impl Send for Process {}
unsafe impl Sync for Process {}

// process access rights
const PROCESS_ALL_ACCESS: u32 = 0x1FFFFF;
const PROCESS_CREATE_THREAD: u32 = 0x0002;
const PROCESS_VM_OPERATION: u32 = 0x0008;
const PROCESS_VM_READ: u32 = 0x0010;
const PROCESS_VM_WRITE: u32 = 0x0020;
const PROCESS_SUSPEND_RESUME: u32 = 0x0800;
const PROCESS_QUERY_INFORMATION: u32 = 0x0400;

#[link(name = "kernel32")]
extern "system" {
    fn OpenProcess(dwDesiredAccess: u32, bInheritHandle: i32, dwProcessId: u32) -> usize;
    fn CloseHandle(hObject: usize) -> i32;
    fn GetCurrentProcess() -> usize;
    fn GetCurrentProcessId() -> u32;
    fn IsWow64Process(hProcess: usize, Wow64Process: *mut i32) -> i32;
}

#[link(name = "user32")]
extern "system" {
    fn FindWindowW(lpClassName: *const u16, lpWindowName: *const u16) -> usize;
    fn GetWindowThreadProcessId(hWnd: usize, lpdwProcessId: *mut u32) -> u32;
}
