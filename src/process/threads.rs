//! Thread suspension bracket
//!
//! Suspending every other thread of the target for the duration of a
//! read-modify-write is the patch engine's only mutual-exclusion mechanism:
//! no target thread can observe a torn write and none resumes while inside
//! the bytes being replaced. The bracket does not protect two callers in the
//! controlling process racing on the same address; that remains the caller's
//! obligation.

use std::sync::{Mutex, MutexGuard, OnceLock};

use crate::error::{Result, UmbraError};
use crate::process::{enumerate, Process};

/// serializes freezes within the controlling process: two concurrent
/// brackets could suspend each other's calling threads and never resume
fn freeze_gate() -> &'static Mutex<()> {
    static GATE: OnceLock<Mutex<()>> = OnceLock::new();
    GATE.get_or_init(|| Mutex::new(()))
}

struct FrozenThread {
    tid: u32,
    handle: usize,
}

/// all target threads suspended for the lifetime of this value
///
/// when the target is the current process the calling thread is skipped.
/// dropping resumes every thread; resume failures are swallowed (asserted in
/// debug builds) because the alternative is a panic during unwind.
pub struct ThreadFreeze {
    threads: Vec<FrozenThread>,
    _gate: MutexGuard<'static, ()>,
}

impl ThreadFreeze {
    /// suspend all threads of the target
    pub fn freeze(process: &Process) -> Result<Self> {
        let gate = freeze_gate()
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // SAFETY: GetCurrentThreadId is always safe
        let own_tid = unsafe { GetCurrentThreadId() };
        let skip_own = process.is_current();

        let entries = enumerate::threads(process.pid())?;
        // reserve up front: growing the vec after the first suspension could
        // allocate while a suspended thread holds the heap lock
        let mut threads = Vec::with_capacity(entries.len());
        for entry in entries {
            if skip_own && entry.tid == own_tid {
                continue;
            }

            // SAFETY: no pointer parameters
            let handle = unsafe {
                OpenThread(THREAD_SUSPEND_RESUME | THREAD_GET_CONTEXT, 0, entry.tid)
            };
            if handle == 0 {
                // the thread may have exited between the snapshot and now
                continue;
            }

            // SAFETY: handle is a valid thread handle we just opened
            let prev = unsafe { SuspendThread(handle) };
            if prev == u32::MAX {
                let code = UmbraError::last_os_error();
                // SAFETY: handle is valid
                unsafe { CloseHandle(handle) };
                // undo what we already suspended before reporting
                drop(Self { threads, _gate: gate });
                return Err(UmbraError::ThreadSuspendFailed { tid: entry.tid, code });
            }

            threads.push(FrozenThread {
                tid: entry.tid,
                handle,
            });
        }

        tracing::trace!(count = threads.len(), pid = process.pid(), "froze target threads");
        Ok(Self { threads, _gate: gate })
    }

    /// number of suspended threads
    pub fn count(&self) -> usize {
        self.threads.len()
    }

    /// check whether any frozen thread's instruction pointer lies inside
    /// `[start, start + len)`; returns the offending thread ID if so
    pub fn ip_in_range(&self, start: usize, len: usize) -> Result<Option<u32>> {
        let end = start + len;
        for thread in &self.threads {
            let ip = thread_ip(thread.handle, thread.tid)?;
            if ip >= start && ip < end {
                return Ok(Some(thread.tid));
            }
        }
        Ok(None)
    }
}

impl Drop for ThreadFreeze {
    fn drop(&mut self) {
        for thread in &self.threads {
            // SAFETY: handle was opened with THREAD_SUSPEND_RESUME
            let resumed = unsafe { ResumeThread(thread.handle) };
            if resumed == u32::MAX {
                debug_assert!(false, "failed to resume thread {}", thread.tid);
                tracing::warn!(tid = thread.tid, "thread left suspended");
            }
            // SAFETY: we own the handle
            unsafe { CloseHandle(thread.handle) };
        }
    }
}

/// read a suspended thread's instruction pointer
fn thread_ip(handle: usize, tid: u32) -> Result<usize> {
    // SAFETY: zeroed CONTEXT is a valid out-buffer once the flags are set
    let mut context: ThreadContext = unsafe { core::mem::zeroed() };
    context.context_flags = CONTEXT_CONTROL;

    // SAFETY: handle was opened with THREAD_GET_CONTEXT and is suspended
    let ok = unsafe { GetThreadContext(handle, &mut context) };
    if ok == 0 {
        return Err(UmbraError::ThreadSuspendFailed {
            tid,
            code: UmbraError::last_os_error(),
        });
    }

    #[cfg(target_arch = "x86_64")]
    {
        Ok(context.rip as usize)
    }
    #[cfg(target_arch = "x86")]
    {
        Ok(context.eip as usize)
    }
}

const THREAD_SUSPEND_RESUME: u32 = 0x0002;
const THREAD_GET_CONTEXT: u32 = 0x0008;

#[cfg(target_arch = "x86_64")]
const CONTEXT_CONTROL: u32 = 0x100001;
#[cfg(target_arch = "x86")]
const CONTEXT_CONTROL: u32 = 0x10001;

/// CONTEXT, truncated after the fields the IP query needs plus trailing
/// state so GetThreadContext has its full buffer
#[repr(C, align(16))]
#[cfg(target_arch = "x86_64")]
struct ThreadContext {
    p1_home: u64,
    p2_home: u64,
    p3_home: u64,
    p4_home: u64,
    p5_home: u64,
    p6_home: u64,
    context_flags: u32,
    mx_csr: u32,
    seg_cs: u16,
    seg_ds: u16,
    seg_es: u16,
    seg_fs: u16,
    seg_gs: u16,
    seg_ss: u16,
    eflags: u32,
    dr0: u64,
    dr1: u64,
    dr2: u64,
    dr3: u64,
    dr6: u64,
    dr7: u64,
    rax: u64,
    rcx: u64,
    rdx: u64,
    rbx: u64,
    rsp: u64,
    rbp: u64,
    rsi: u64,
    rdi: u64,
    r8: u64,
    r9: u64,
    r10: u64,
    r11: u64,
    r12: u64,
    r13: u64,
    r14: u64,
    r15: u64,
    rip: u64,
    _rest: [u8; 1024],
}

#[repr(C)]
#[cfg(target_arch = "x86")]
struct ThreadContext {
    context_flags: u32,
    dr0: u32,
    dr1: u32,
    dr2: u32,
    dr3: u32,
    dr6: u32,
    dr7: u32,
    float_save: [u8; 112],
    seg_gs: u32,
    seg_fs: u32,
    seg_es: u32,
    seg_ds: u32,
    edi: u32,
    esi: u32,
    ebx: u32,
    edx: u32,
    ecx: u32,
    eax: u32,
    ebp: u32,
    eip: u32,
    seg_cs: u32,
    eflags: u32,
    esp: u32,
    seg_ss: u32,
    extended_registers: [u8; 512],
}

#[link(name = "kernel32")]
extern "system" {
    fn OpenThread(dwDesiredAccess: u32, bInheritHandle: i32, dwThreadId: u32) -> usize;
    fn SuspendThread(hThread: usize) -> u32;
    fn ResumeThread(hThread: usize) -> u32;
    fn GetThreadContext(hThread: usize, lpContext: *mut ThreadContext) -> i32;
    fn GetCurrentThreadId() -> u32;
    fn CloseHandle(hObject: usize) -> i32;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessAccess;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_freeze_self_skips_caller() {
        let stop = Arc::new(AtomicBool::new(false));
        let stop2 = stop.clone();
        let worker = std::thread::spawn(move || {
            while !stop2.load(Ordering::Relaxed) {
                std::hint::spin_loop();
            }
        });

        {
            let proc =
                Process::open(std::process::id(), ProcessAccess::all()).expect("open self");
            let freeze = ThreadFreeze::freeze(&proc).expect("freeze");
            // the calling thread is excluded, the worker is not
            assert!(freeze.count() >= 1);

            // the worker spins in its loop, so no IP should land in an
            // obviously unmapped range
            let hit = freeze.ip_in_range(0x1000, 0x100).expect("ip query");
            assert_eq!(hit, None);
        }

        stop.store(true, Ordering::Relaxed);
        worker.join().expect("worker join");
    }
}
