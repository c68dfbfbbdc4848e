//! Exception-based hooks (vectored handler + INT3 / debug registers)
//!
//! A single process-wide vectored exception handler is installed on first
//! use and never removed. Hook state lives in a registry of reader/writer
//! locked maps: the handler (which can fire on any thread at any time) takes
//! the read lock, install/uninstall paths take the write lock.
//!
//! The debug-register variant is a reduced tool with known, accepted
//! limitations: it hooks only the calling thread, supports one hook per
//! thread, does not detect debug registers already claimed by a debugger or
//! other tooling, and does not handle thread-ID reuse. The trampoline detour
//! is the production path; this one exists for targets that must not be
//! byte-patched.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{OnceLock, RwLock};

use crate::error::{Result, UmbraError};
use crate::patch::{write_code, PatchState};
use crate::process::Process;

const EXCEPTION_CONTINUE_EXECUTION: i32 = -1;
const EXCEPTION_CONTINUE_SEARCH: i32 = 0;

const EXCEPTION_BREAKPOINT: u32 = 0x8000_0003;
const EXCEPTION_SINGLE_STEP: u32 = 0x8000_0004;

/// resume flag; suppresses a re-trigger at the faulting instruction
const EFLAGS_RF: u32 = 0x10000;

const INT3_OPCODE: u8 = 0xCC;

/// one of the four per-thread hardware breakpoint slots
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DebugRegister {
    Dr0 = 0,
    Dr1 = 1,
    Dr2 = 2,
    Dr3 = 3,
}

impl DebugRegister {
    fn from_index(index: u8) -> Self {
        match index {
            0 => Self::Dr0,
            1 => Self::Dr1,
            2 => Self::Dr2,
            _ => Self::Dr3,
        }
    }
}

struct VehRegistry {
    /// hooked address -> detour gate
    hooks: RwLock<HashMap<usize, usize>>,
    /// thread id -> claimed debug register
    thread_slots: RwLock<HashMap<u32, DebugRegister>>,
    handler_installed: AtomicBool,
}

fn registry() -> &'static VehRegistry {
    static REGISTRY: OnceLock<VehRegistry> = OnceLock::new();
    REGISTRY.get_or_init(|| VehRegistry {
        hooks: RwLock::new(HashMap::new()),
        thread_slots: RwLock::new(HashMap::new()),
        handler_installed: AtomicBool::new(false),
    })
}

/// install the vectored handler once; subsequent calls are no-ops
fn ensure_handler() -> Result<()> {
    let reg = registry();
    if reg.handler_installed.load(Ordering::Acquire) {
        return Ok(());
    }

    // SAFETY: the handler stays valid for the process lifetime
    let handle = unsafe { AddVectoredExceptionHandler(1, Some(veh_dispatch)) };
    if handle.is_null() {
        return Err(UmbraError::from_last_error("AddVectoredExceptionHandler"));
    }

    // a racing second install only wastes one handler registration; the
    // dispatch itself is idempotent
    reg.handler_installed.store(true, Ordering::Release);
    tracing::debug!("vectored exception handler installed");
    Ok(())
}

fn register_hook(target: usize, detour: usize) -> Result<()> {
    let mut hooks = registry().hooks.write().expect("hook registry poisoned");
    if hooks.contains_key(&target) {
        return Err(UmbraError::AlreadyHooked { target });
    }
    hooks.insert(target, detour);
    Ok(())
}

fn unregister_hook(target: usize) {
    let mut hooks = registry().hooks.write().expect("hook registry poisoned");
    hooks.remove(&target);
}

/// the vectored exception handler
extern "system" fn veh_dispatch(info: *mut ExceptionPointers) -> i32 {
    if info.is_null() {
        return EXCEPTION_CONTINUE_SEARCH;
    }

    // SAFETY: the OS hands us valid pointers for the duration of the callback
    let (record, context) = unsafe {
        let info = &*info;
        (&*info.exception_record, &mut *info.context_record)
    };

    let code = record.exception_code;
    if code != EXCEPTION_BREAKPOINT && code != EXCEPTION_SINGLE_STEP {
        return EXCEPTION_CONTINUE_SEARCH;
    }

    #[cfg(target_arch = "x86_64")]
    let ip = context.rip as usize;
    #[cfg(target_arch = "x86")]
    let ip = context.eip as usize;

    let hooks = match registry().hooks.read() {
        Ok(hooks) => hooks,
        Err(_) => return EXCEPTION_CONTINUE_SEARCH,
    };

    // a breakpoint trap can report the IP at or just past the INT3
    let hit = hooks
        .get(&ip)
        .or_else(|| hooks.get(&ip.wrapping_sub(1)))
        .copied();
    drop(hooks);

    let Some(detour) = hit else {
        return EXCEPTION_CONTINUE_SEARCH;
    };

    #[cfg(target_arch = "x86_64")]
    {
        context.rip = detour as u64;
    }
    #[cfg(target_arch = "x86")]
    {
        context.eip = detour as u32;
    }

    if code == EXCEPTION_SINGLE_STEP {
        context.eflags |= EFLAGS_RF;
    }

    EXCEPTION_CONTINUE_EXECUTION
}

/// breakpoint-opcode hook: one byte at the target, redirect via the handler
///
/// the handler rewrites the faulting thread's instruction pointer to the
/// detour, so the detour runs with the exact stack and arguments of the
/// original call.
pub struct PatchInt3 {
    process: Process,
    target: usize,
    detour: usize,
    original: u8,
    state: PatchState,
}

impl PatchInt3 {
    /// prepare an INT3 hook in the current process
    pub fn new(target: usize, detour: usize) -> Self {
        Self {
            process: Process::current(),
            target,
            detour,
            original: 0,
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

    /// write the breakpoint and register the redirect
    ///
    /// a second hook on the same target is rejected: breakpoint hooks do
    /// not compose, there is nothing for a chained hook to call through.
    pub fn apply(&mut self) -> Result<()> {
        if self.state != PatchState::Unapplied {
            return Ok(());
        }

        ensure_handler()?;
        register_hook(self.target, self.detour)?;

        self.original = match self.process.read::<u8>(self.target) {
            Ok(byte) => byte,
            Err(err) => {
                unregister_hook(self.target);
                return Err(err);
            }
        };

        if let Err(err) = write_code(&self.process, self.target, &[INT3_OPCODE]) {
            unregister_hook(self.target);
            return Err(err);
        }

        self.state = PatchState::Applied;
        tracing::debug!(
            address = format_args!("{:#x}", self.target),
            detour = format_args!("{:#x}", self.detour),
            "breakpoint hook applied"
        );
        Ok(())
    }

    /// restore the original byte and unregister
    pub fn remove(&mut self) -> Result<()> {
        if self.state != PatchState::Applied {
            return Ok(());
        }

        write_code(&self.process, self.target, &[self.original])?;
        unregister_hook(self.target);
        self.state = PatchState::Unapplied;
        Ok(())
    }

    /// keep the breakpoint in place but stop being responsible for it
    pub fn detach(&mut self) {
        if self.state == PatchState::Applied {
            self.state = PatchState::Detached;
        }
    }
}

impl Drop for PatchInt3 {
    fn drop(&mut self) {
        if self.state == PatchState::Applied {
            if let Err(err) = self.remove() {
                debug_assert!(false, "failed to remove breakpoint hook on drop: {err}");
                tracing::warn!(
                    address = format_args!("{:#x}", self.target),
                    %err,
                    "breakpoint hook left applied"
                );
            }
        }
    }
}

/// hardware-breakpoint hook on the calling thread
///
/// claims a free debug register, arms it for execution at the target and
/// redirects through the vectored handler. see the module documentation for
/// the limitations it carries.
pub struct PatchDr {
    target: usize,
    detour: usize,
    tid: u32,
    slot: Option<DebugRegister>,
    state: PatchState,
}

impl PatchDr {
    /// prepare a hardware-breakpoint hook for the calling thread
    pub fn new(target: usize, detour: usize) -> Self {
        Self {
            target,
            detour,
            // SAFETY: GetCurrentThreadId is always safe
            tid: unsafe { GetCurrentThreadId() },
            slot: None,
            state: PatchState::Unapplied,
        }
    }

    pub fn target(&self) -> usize {
        self.target
    }

    pub fn slot(&self) -> Option<DebugRegister> {
        self.slot
    }

    pub fn state(&self) -> PatchState {
        self.state
    }

    pub fn is_applied(&self) -> bool {
        self.state == PatchState::Applied
    }

    /// arm the breakpoint; one hook per thread, calling thread only
    pub fn apply(&mut self) -> Result<()> {
        if self.state != PatchState::Unapplied {
            return Ok(());
        }

        ensure_handler()?;

        {
            let mut slots = registry()
                .thread_slots
                .write()
                .expect("slot registry poisoned");
            if slots.contains_key(&self.tid) {
                return Err(UmbraError::AlreadyHooked { target: self.target });
            }
            // claim provisionally; the context write below can still fail
            slots.insert(self.tid, DebugRegister::Dr0);
        }

        let armed = (|| -> Result<DebugRegister> {
            let slot = find_free_register(self.tid)?;
            register_hook(self.target, self.detour)?;
            if let Err(err) = arm_register(slot, self.target) {
                unregister_hook(self.target);
                return Err(err);
            }
            Ok(slot)
        })();

        match armed {
            Ok(slot) => {
                registry()
                    .thread_slots
                    .write()
                    .expect("slot registry poisoned")
                    .insert(self.tid, slot);
                self.slot = Some(slot);
                self.state = PatchState::Applied;
                tracing::debug!(
                    address = format_args!("{:#x}", self.target),
                    tid = self.tid,
                    ?slot,
                    "hardware breakpoint armed"
                );
                Ok(())
            }
            Err(err) => {
                registry()
                    .thread_slots
                    .write()
                    .expect("slot registry poisoned")
                    .remove(&self.tid);
                Err(err)
            }
        }
    }

    /// disarm the breakpoint and release the slot
    pub fn remove(&mut self) -> Result<()> {
        if self.state != PatchState::Applied {
            return Ok(());
        }

        if let Some(slot) = self.slot.take() {
            disarm_register(slot)?;
        }
        unregister_hook(self.target);
        registry()
            .thread_slots
            .write()
            .expect("slot registry poisoned")
            .remove(&self.tid);
        self.state = PatchState::Unapplied;
        Ok(())
    }

    /// keep the breakpoint armed but stop being responsible for it
    pub fn detach(&mut self) {
        if self.state == PatchState::Applied {
            self.state = PatchState::Detached;
        }
    }
}

impl Drop for PatchDr {
    fn drop(&mut self) {
        if self.state == PatchState::Applied {
            if let Err(err) = self.remove() {
                debug_assert!(false, "failed to disarm hardware breakpoint on drop: {err}");
                tracing::warn!(
                    address = format_args!("{:#x}", self.target),
                    %err,
                    "hardware breakpoint left armed"
                );
            }
        }
    }
}

#[cfg(target_arch = "x86_64")]
type DrWord = u64;
#[cfg(target_arch = "x86")]
type DrWord = u32;

fn read_debug_context() -> Result<Context> {
    // SAFETY: zeroed CONTEXT is a valid out-buffer once the flags are set
    let mut context: Context = unsafe { core::mem::zeroed() };
    context.context_flags = CONTEXT_DEBUG_REGISTERS;

    // SAFETY: pseudo handle, context flags set
    let ok = unsafe { GetThreadContext(GetCurrentThread(), &mut context) };
    if ok == 0 {
        return Err(UmbraError::from_last_error("GetThreadContext"));
    }
    Ok(context)
}

fn write_debug_context(context: &Context) -> Result<()> {
    // SAFETY: context was produced by read_debug_context
    let ok = unsafe { SetThreadContext(GetCurrentThread(), context) };
    if ok == 0 {
        return Err(UmbraError::from_last_error("SetThreadContext"));
    }
    Ok(())
}

/// scan DR7 local-enable bits for a free slot on the calling thread
fn find_free_register(tid: u32) -> Result<DebugRegister> {
    let context = read_debug_context()?;
    for index in 0..4u8 {
        if context.dr7 & (1 as DrWord) << (index * 2) == 0 {
            return Ok(DebugRegister::from_index(index));
        }
    }
    Err(UmbraError::NoFreeDebugRegister { tid })
}

/// arm a register for an execution breakpoint at `address`
fn arm_register(slot: DebugRegister, address: usize) -> Result<()> {
    let mut context = read_debug_context()?;

    let index = slot as u8;
    match slot {
        DebugRegister::Dr0 => context.dr0 = address as DrWord,
        DebugRegister::Dr1 => context.dr1 = address as DrWord,
        DebugRegister::Dr2 => context.dr2 = address as DrWord,
        DebugRegister::Dr3 => context.dr3 = address as DrWord,
    }

    // clear this slot's condition/length nibble, then set local-enable with
    // condition 00 (execute) and length 00 (byte)
    let nibble_shift = 16 + index * 4;
    context.dr7 &= !((0b11 as DrWord) << (index * 2) | (0b1111 as DrWord) << nibble_shift);
    context.dr7 |= (1 as DrWord) << (index * 2);

    write_debug_context(&context)
}

/// clear a register and its DR7 bits
fn disarm_register(slot: DebugRegister) -> Result<()> {
    let mut context = read_debug_context()?;

    let index = slot as u8;
    match slot {
        DebugRegister::Dr0 => context.dr0 = 0,
        DebugRegister::Dr1 => context.dr1 = 0,
        DebugRegister::Dr2 => context.dr2 = 0,
        DebugRegister::Dr3 => context.dr3 = 0,
    }

    let nibble_shift = 16 + index * 4;
    context.dr7 &= !((0b11 as DrWord) << (index * 2) | (0b1111 as DrWord) << nibble_shift);

    write_debug_context(&context)
}

#[repr(C)]
struct ExceptionRecord {
    exception_code: u32,
    exception_flags: u32,
    exception_record: *mut ExceptionRecord,
    exception_address: *mut core::ffi::c_void,
    number_parameters: u32,
    exception_information: [usize; 15],
}

#[repr(C)]
struct ExceptionPointers {
    exception_record: *mut ExceptionRecord,
    context_record: *mut Context,
}

#[cfg(target_arch = "x86_64")]
const CONTEXT_DEBUG_REGISTERS: u32 = 0x0010_0010;
#[cfg(target_arch = "x86")]
const CONTEXT_DEBUG_REGISTERS: u32 = 0x0001_0010;

#[repr(C, align(16))]
#[cfg(target_arch = "x86_64")]
struct Context {
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
struct Context {
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

type VectoredHandler = Option<extern "system" fn(*mut ExceptionPointers) -> i32>;

#[link(name = "kernel32")]
extern "system" {
    fn AddVectoredExceptionHandler(first: u32, handler: VectoredHandler) -> *mut core::ffi::c_void;
    fn GetCurrentThread() -> usize;
    fn GetCurrentThreadId() -> u32;
    fn GetThreadContext(hThread: usize, lpContext: *mut Context) -> i32;
    fn SetThreadContext(hThread: usize, lpContext: *const Context) -> i32;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{memory::Protection, ProcessAccess};

    fn make_stub() -> (crate::process::RemoteAlloc, extern "C" fn() -> u32) {
        let proc = Process::open(std::process::id(), ProcessAccess::all()).expect("open");
        let alloc = proc.alloc(32, Protection::EXECUTE_READWRITE).expect("alloc");

        // mov eax, 1; ret
        let code = [0xB8u8, 0x01, 0x00, 0x00, 0x00, 0xC3];
        proc.write_bytes(alloc.base(), &code).expect("write");
        proc.flush_instruction_cache(alloc.base(), code.len()).expect("flush");

        // SAFETY: the allocation holds a valid function until dropped
        let f: extern "C" fn() -> u32 = unsafe { core::mem::transmute(alloc.base()) };
        (alloc, f)
    }

    extern "C" fn redirected() -> u32 {
        2
    }

    #[test]
    fn test_int3_redirect_roundtrip() {
        let (_alloc, stub) = make_stub();
        assert_eq!(stub(), 1);

        let mut hook = PatchInt3::new(stub as usize, redirected as usize);
        hook.apply().expect("apply");
        assert_eq!(stub(), 2, "breakpoint redirects to the detour");

        hook.remove().expect("remove");
        assert_eq!(stub(), 1, "original byte restored");
    }

    #[test]
    fn test_int3_double_registration_rejected() {
        let (_alloc, stub) = make_stub();

        let mut first = PatchInt3::new(stub as usize, redirected as usize);
        first.apply().expect("apply");

        let mut second = PatchInt3::new(stub as usize, redirected as usize);
        let err = second.apply().unwrap_err();
        assert!(matches!(err, UmbraError::AlreadyHooked { .. }));
        assert_eq!(err.kind(), crate::error::ErrorKind::Invariant);

        first.remove().expect("remove");
    }

    #[test]
    fn test_dr_hook_current_thread() {
        let (_alloc, stub) = make_stub();
        assert_eq!(stub(), 1);

        let mut hook = PatchDr::new(stub as usize, redirected as usize);
        match hook.apply() {
            Ok(()) => {}
            // a debugger may own every slot; that exhaustion is contract
            Err(UmbraError::NoFreeDebugRegister { .. }) => return,
            Err(err) => panic!("unexpected: {err}"),
        }

        assert!(hook.slot().is_some());
        assert_eq!(stub(), 2, "hardware breakpoint redirects");

        // one hook per thread
        let mut second = PatchDr::new(stub as usize + 8, redirected as usize);
        let err = second.apply().unwrap_err();
        assert!(matches!(err, UmbraError::AlreadyHooked { .. }));

        hook.remove().expect("remove");
        assert_eq!(stub(), 1);
    }

    #[test]
    fn test_drop_removes_int3() {
        let (_alloc, stub) = make_stub();
        {
            let mut hook = PatchInt3::new(stub as usize, redirected as usize);
            hook.apply().expect("apply");
            assert_eq!(stub(), 2);
        }
        assert_eq!(stub(), 1);
    }
}
