//! Toolhelp snapshot enumeration
//!
//! Process, thread and module listings via CreateToolhelp32Snapshot. Snapshot
//! creation is retried solely on ERROR_BAD_LENGTH, the documented transient
//! race in the snapshot API; every other failure surfaces immediately.

use crate::error::{Result, UmbraError};
use crate::process::Process;

/// system process entry
#[derive(Debug, Clone)]
pub struct ProcessEntry {
    pub pid: u32,
    pub parent_pid: u32,
    pub name: String,
    pub thread_count: u32,
}

/// thread entry belonging to a process
#[derive(Debug, Clone)]
pub struct ThreadEntry {
    pub tid: u32,
    pub owner_pid: u32,
    pub base_priority: i32,
}

/// module loaded into a process
#[derive(Debug, Clone)]
pub struct ModuleInfo {
    pub name: String,
    pub path: String,
    pub base: usize,
    pub size: usize,
}

const MAX_SNAPSHOT_RETRIES: usize = 16;

fn create_snapshot(flags: u32, pid: u32) -> Result<usize> {
    for _ in 0..MAX_SNAPSHOT_RETRIES {
        // SAFETY: no pointer parameters
        let snapshot = unsafe { CreateToolhelp32Snapshot(flags, pid) };
        if snapshot != INVALID_HANDLE_VALUE {
            return Ok(snapshot);
        }

        let code = UmbraError::last_os_error();
        if code != ERROR_BAD_LENGTH {
            return Err(UmbraError::Win32Error {
                api: "CreateToolhelp32Snapshot",
                code,
            });
        }
        // snapshot buffer raced a process start; retry
    }

    Err(UmbraError::Win32Error {
        api: "CreateToolhelp32Snapshot",
        code: ERROR_BAD_LENGTH,
    })
}

fn wide_to_string(buf: &[u16]) -> String {
    let end = buf.iter().position(|&c| c == 0).unwrap_or(buf.len());
    String::from_utf16_lossy(&buf[..end])
}

/// enumerate all running processes
pub fn processes() -> Result<Vec<ProcessEntry>> {
    let snapshot = create_snapshot(TH32CS_SNAPPROCESS, 0)?;
    let mut out = Vec::new();

    let mut entry = ProcessEntry32W::default();
    entry.size = core::mem::size_of::<ProcessEntry32W>() as u32;

    // SAFETY: entry.size is initialized, snapshot is valid
    let mut ok = unsafe { Process32FirstW(snapshot, &mut entry) };
    while ok != 0 {
        out.push(ProcessEntry {
            pid: entry.process_id,
            parent_pid: entry.parent_process_id,
            name: wide_to_string(&entry.exe_file),
            thread_count: entry.threads,
        });
        // SAFETY: same as above
        ok = unsafe { Process32NextW(snapshot, &mut entry) };
    }

    // SAFETY: snapshot came from create_snapshot
    unsafe { CloseHandle(snapshot) };
    Ok(out)
}

/// enumerate the threads of one process
pub fn threads(pid: u32) -> Result<Vec<ThreadEntry>> {
    // thread snapshots are system-wide; filter by owner
    let snapshot = create_snapshot(TH32CS_SNAPTHREAD, 0)?;
    let mut out = Vec::new();

    let mut entry = ThreadEntry32::default();
    entry.size = core::mem::size_of::<ThreadEntry32>() as u32;

    // SAFETY: entry.size is initialized, snapshot is valid
    let mut ok = unsafe { Thread32First(snapshot, &mut entry) };
    while ok != 0 {
        if entry.owner_process_id == pid {
            out.push(ThreadEntry {
                tid: entry.thread_id,
                owner_pid: entry.owner_process_id,
                base_priority: entry.base_priority,
            });
        }
        // SAFETY: same as above
        ok = unsafe { Thread32Next(snapshot, &mut entry) };
    }

    // SAFETY: snapshot came from create_snapshot
    unsafe { CloseHandle(snapshot) };
    Ok(out)
}

/// enumerate the modules loaded into a process
pub fn modules(process: &Process) -> Result<Vec<ModuleInfo>> {
    let snapshot = create_snapshot(TH32CS_SNAPMODULE | TH32CS_SNAPMODULE32, process.pid())?;
    let mut out = Vec::new();

    let mut entry = ModuleEntry32W::default();
    entry.size = core::mem::size_of::<ModuleEntry32W>() as u32;

    // SAFETY: entry.size is initialized, snapshot is valid
    let mut ok = unsafe { Module32FirstW(snapshot, &mut entry) };
    while ok != 0 {
        out.push(ModuleInfo {
            name: wide_to_string(&entry.module_name),
            path: wide_to_string(&entry.exe_path),
            base: entry.mod_base_addr,
            size: entry.mod_base_size as usize,
        });
        // SAFETY: same as above
        ok = unsafe { Module32NextW(snapshot, &mut entry) };
    }

    // SAFETY: snapshot came from create_snapshot
    unsafe { CloseHandle(snapshot) };
    Ok(out)
}

/// find a module by name (case-insensitive), e.g. "kernel32.dll"
pub fn find_module(process: &Process, name: &str) -> Result<ModuleInfo> {
    let name_lower = name.to_lowercase();
    modules(process)?
        .into_iter()
        .find(|m| m.name.to_lowercase() == name_lower)
        .ok_or_else(|| UmbraError::ModuleNotFound { name: name.into() })
}

const TH32CS_SNAPPROCESS: u32 = 0x00000002;
const TH32CS_SNAPTHREAD: u32 = 0x00000004;
const TH32CS_SNAPMODULE: u32 = 0x00000008;
const TH32CS_SNAPMODULE32: u32 = 0x00000010;
const INVALID_HANDLE_VALUE: usize = usize::MAX;
const ERROR_BAD_LENGTH: u32 = 24;

#[repr(C)]
struct ProcessEntry32W {
    size: u32,
    cnt_usage: u32,
    process_id: u32,
    default_heap_id: usize,
    module_id: u32,
    threads: u32,
    parent_process_id: u32,
    pri_class_base: i32,
    flags: u32,
    exe_file: [u16; 260],
}

impl Default for ProcessEntry32W {
    fn default() -> Self {
        // SAFETY: all-zero bit pattern is valid for this plain-data struct
        unsafe { core::mem::zeroed() }
    }
}

#[repr(C)]
#[derive(Default)]
struct ThreadEntry32 {
    size: u32,
    cnt_usage: u32,
    thread_id: u32,
    owner_process_id: u32,
    base_priority: i32,
    delta_priority: i32,
    flags: u32,
}

#[repr(C)]
struct ModuleEntry32W {
    size: u32,
    module_id: u32,
    process_id: u32,
    glbl_cnt_usage: u32,
    proc_cnt_usage: u32,
    mod_base_addr: usize,
    mod_base_size: u32,
    h_module: usize,
    module_name: [u16; 256],
    exe_path: [u16; 260],
}

impl Default for ModuleEntry32W {
    fn default() -> Self {
        // SAFETY: all-zero bit pattern is valid for this plain-data struct
        unsafe { core::mem::zeroed() }
    }
}

#[link(name = "kernel32")]
extern "system" {
    fn CreateToolhelp32Snapshot(dwFlags: u32, th32ProcessID: u32) -> usize;
    fn Process32FirstW(hSnapshot: usize, lppe: *mut ProcessEntry32W) -> i32;
    fn Process32NextW(hSnapshot: usize, lppe: *mut ProcessEntry32W) -> i32;
    fn Thread32First(hSnapshot: usize, lpte: *mut ThreadEntry32) -> i32;
    fn Thread32Next(hSnapshot: usize, lpte: *mut ThreadEntry32) -> i32;
    fn Module32FirstW(hSnapshot: usize, lpme: *mut ModuleEntry32W) -> i32;
    fn Module32NextW(hSnapshot: usize, lpme: *mut ModuleEntry32W) -> i32;
    fn CloseHandle(hObject: usize) -> i32;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessAccess;

    #[test]
    fn test_enumerate_processes() {
        let procs = processes().expect("should enumerate");
        assert!(!procs.is_empty());

        let current_pid = std::process::id();
        assert!(procs.iter().any(|p| p.pid == current_pid));
    }

    #[test]
    fn test_enumerate_threads_self() {
        let list = threads(std::process::id()).expect("should enumerate");
        assert!(!list.is_empty(), "at least the calling thread exists");
        assert!(list.iter().all(|t| t.owner_pid == std::process::id()));
    }

    #[test]
    fn test_enumerate_modules_self() {
        let proc = Process::open(std::process::id(), ProcessAccess::read_only()).expect("open");
        let mods = modules(&proc).expect("should enumerate");
        assert!(!mods.is_empty());

        // kernel32 is loaded in every Win32 process
        let k32 = find_module(&proc, "kernel32.dll").expect("kernel32");
        assert!(k32.base != 0);
        assert!(k32.size > 0);
    }
}
