//! Trampoline detours
//!
//! The patch length is grown one whole instruction at a time until the
//! redirect fits, so an instruction is never split. The overwritten
//! instructions are relocated into a trampoline allocated near the target,
//! followed by a jump back to the continuation point; calling the trampoline
//! runs the original behavior, which is what makes detours chainable.

use crate::disasm::{self, Disassembler, Instruction};
use crate::error::{Result, UmbraError};
use crate::patch::{write_code, PatchState};
use crate::process::{memory::Protection, Process, RemoteAlloc, ThreadFreeze};

/// a trampoline-based function detour
pub struct PatchDetour {
    process: Process,
    disasm: Disassembler,
    target: usize,
    detour: usize,
    saved: Vec<u8>,
    trampoline: Option<RemoteAlloc>,
    state: PatchState,
}

impl PatchDetour {
    /// prepare a detour redirecting `target` to `detour`
    pub fn new(process: &Process, target: usize, detour: usize) -> Self {
        Self {
            process: process.clone(),
            disasm: Disassembler::native(),
            target,
            detour,
            saved: Vec::new(),
            trampoline: None,
            state: PatchState::Unapplied,
        }
    }

    /// override the decoder bitness (e.g. a WoW64 target)
    pub fn with_disassembler(mut self, disasm: Disassembler) -> Self {
        self.disasm = disasm;
        self
    }

    pub fn target(&self) -> usize {
        self.target
    }

    pub fn detour(&self) -> usize {
        self.detour
    }

    pub fn state(&self) -> PatchState {
        self.state
    }

    pub fn is_applied(&self) -> bool {
        self.state == PatchState::Applied
    }

    /// entry point that runs the original behavior; call through this from
    /// the detour function to chain to the original
    pub fn trampoline(&self) -> Option<usize> {
        self.trampoline.as_ref().map(|t| t.base())
    }

    /// decode whole instructions at the target until `min_len` is covered
    fn read_prologue(&self, min_len: usize) -> Result<Vec<Instruction>> {
        let instructions = self.process_instructions(min_len)?;
        let total: usize = instructions.iter().map(|i| i.length).sum();
        if total < min_len {
            return Err(UmbraError::NoInstructionBoundary {
                address: self.target,
                needed: min_len,
            });
        }
        Ok(instructions)
    }

    fn process_instructions(&self, min_len: usize) -> Result<Vec<Instruction>> {
        let mut out = Vec::new();
        let mut total = 0usize;
        let mut cursor = self.target;

        while total < min_len {
            let mut decoded = self.disasm.disassemble(&self.process, cursor, 1)?;
            let Some(instruction) = decoded.pop() else {
                break;
            };
            total += instruction.length;
            cursor += instruction.length;
            out.push(instruction);
        }

        Ok(out)
    }

    /// install the detour; a no-op when already applied or detached
    pub fn apply(&mut self) -> Result<()> {
        if self.state != PatchState::Unapplied {
            return Ok(());
        }

        // a rel32 stub when the detour is reachable, the absolute stub otherwise
        let stub_size = if disasm::encode_jmp_rel(self.target, self.detour).is_some() {
            disasm::JMP_REL_SIZE
        } else {
            disasm::jmp_abs_size(self.disasm.bitness())
        };

        let prologue = self.read_prologue(stub_size)?;
        let patch_len: usize = prologue.iter().map(|i| i.length).sum();

        // trampoline: relocated prologue + jump back; instructions can grow
        // when re-encoded, so size generously
        let trampoline_size = patch_len * 2 + disasm::jmp_abs_size(self.disasm.bitness()) + 16;
        let trampoline = alloc_near(&self.process, self.target, trampoline_size)?;

        let mut code = self.disasm.relocate(&prologue, trampoline.base())?;
        let continuation = self.target + patch_len;
        let jmp_location = trampoline.base() + code.len();
        match disasm::encode_jmp_rel(jmp_location, continuation) {
            Some(jmp) => code.extend_from_slice(&jmp),
            None => code.extend_from_slice(&disasm::encode_jmp_abs(
                continuation,
                self.disasm.bitness(),
            )),
        }

        if code.len() > trampoline.size() {
            return Err(UmbraError::UnrelocatableInstruction { address: self.target });
        }
        self.process.write_bytes(trampoline.base(), &code)?;
        self.process.flush_instruction_cache(trampoline.base(), code.len())?;

        // the redirect stub, NOP-padded to a whole instruction boundary
        let mut stub = match disasm::encode_jmp_rel(self.target, self.detour) {
            Some(jmp) => jmp,
            None => disasm::encode_jmp_abs(self.detour, self.disasm.bitness()),
        };
        if stub.len() < patch_len {
            let pad = disasm::encode_nop_pad(patch_len - stub.len());
            stub.extend_from_slice(&pad);
        }

        let mut saved = vec![0u8; patch_len];

        let freeze = ThreadFreeze::freeze(&self.process)?;
        if let Some(tid) = freeze.ip_in_range(self.target, patch_len)? {
            return Err(UmbraError::ThreadInPatchRange {
                tid,
                ip: self.target,
            });
        }
        self.process.read_bytes(self.target, &mut saved)?;
        write_code(&self.process, self.target, &stub)?;
        drop(freeze);

        self.saved = saved;
        self.trampoline = Some(trampoline);
        self.state = PatchState::Applied;
        tracing::debug!(
            address = format_args!("{:#x}", self.target),
            detour = format_args!("{:#x}", self.detour),
            trampoline = format_args!("{:#x}", self.trampoline().unwrap_or(0)),
            patch_len,
            "detour applied"
        );
        Ok(())
    }

    /// restore the original prologue and free the trampoline
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

        // dropping the allocation frees the trampoline
        self.trampoline = None;
        self.state = PatchState::Unapplied;
        tracing::debug!(address = format_args!("{:#x}", self.target), "detour removed");
        Ok(())
    }

    /// keep the detour installed but stop being responsible for it
    pub fn detach(&mut self) {
        if self.state == PatchState::Applied {
            if let Some(trampoline) = self.trampoline.take() {
                trampoline.leak();
            }
            self.state = PatchState::Detached;
        }
    }
}

impl Drop for PatchDetour {
    fn drop(&mut self) {
        if self.state == PatchState::Applied {
            if let Err(err) = self.remove() {
                debug_assert!(false, "failed to remove detour on drop: {err}");
                tracing::warn!(
                    address = format_args!("{:#x}", self.target),
                    %err,
                    "detour left applied"
                );
            }
        }
    }
}

/// allocate RWX memory within rel32 range of `target` when possible
///
/// probes downward then upward from the target in allocation-granularity
/// steps, falling back to an unconstrained allocation when nothing nearby is
/// free (the stub then uses the absolute form).
pub(crate) fn alloc_near(process: &Process, target: usize, size: usize) -> Result<RemoteAlloc> {
    const GRANULARITY: usize = 0x10000;
    const SEARCH_RANGE: i64 = 0x7FF0_0000;
    // probing every granule of 2GB takes forever; step wider
    const STEP: usize = GRANULARITY * 16;

    let target_i = target as i64;

    let mut below = (target_i - SEARCH_RANGE).max(GRANULARITY as i64) as usize & !(GRANULARITY - 1);
    // start closer to the target first
    below = below.max(target.saturating_sub(0x4000_0000) & !(GRANULARITY - 1));

    let mut hint = target.saturating_sub(GRANULARITY) & !(GRANULARITY - 1);
    while hint >= below && hint != 0 {
        if let Some(alloc) = process.alloc_at(hint, size, Protection::EXECUTE_READWRITE) {
            if reachable(target, alloc.base()) {
                return Ok(alloc);
            }
        }
        hint = match hint.checked_sub(STEP) {
            Some(next) => next,
            None => break,
        };
    }

    let above_end = (target_i + SEARCH_RANGE) as usize;
    let mut hint = (target + GRANULARITY) & !(GRANULARITY - 1);
    while hint < above_end {
        if let Some(alloc) = process.alloc_at(hint, size, Protection::EXECUTE_READWRITE) {
            if reachable(target, alloc.base()) {
                return Ok(alloc);
            }
        }
        hint += STEP;
    }

    tracing::trace!(
        address = format_args!("{target:#x}"),
        "no nearby region free, allocating anywhere"
    );
    process.alloc(size, Protection::EXECUTE_READWRITE)
}

fn reachable(a: usize, b: usize) -> bool {
    (a as i64 - b as i64).abs() <= i32::MAX as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessAccess;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn open_self() -> Process {
        Process::open(std::process::id(), ProcessAccess::all()).expect("open self")
    }

    /// mov eax, 0x11111111; 8 nops; ret
    fn make_target_fn(proc: &Process) -> RemoteAlloc {
        let alloc = proc.alloc(64, Protection::EXECUTE_READWRITE).expect("alloc");
        let mut code = vec![0xB8u8, 0x11, 0x11, 0x11, 0x11];
        code.extend_from_slice(&[0x90; 8]);
        code.push(0xC3);
        proc.write_bytes(alloc.base(), &code).expect("write");
        proc.flush_instruction_cache(alloc.base(), code.len()).expect("flush");
        alloc
    }

    static TRAMPOLINE: AtomicUsize = AtomicUsize::new(0);

    extern "C" fn hook_adds_one() -> u32 {
        let trampoline = TRAMPOLINE.load(Ordering::SeqCst);
        // SAFETY: the trampoline is a valid fn() -> u32 entry while hooked
        let original: extern "C" fn() -> u32 = unsafe { core::mem::transmute(trampoline) };
        original().wrapping_add(1)
    }

    #[test]
    fn test_detour_chain_and_roundtrip() {
        let proc = open_self();
        let target_fn = make_target_fn(&proc);
        // SAFETY: target_fn holds a valid function for the test's lifetime
        let call: extern "C" fn() -> u32 = unsafe { core::mem::transmute(target_fn.base()) };

        assert_eq!(call(), 0x11111111);

        let mut detour = PatchDetour::new(&proc, target_fn.base(), hook_adds_one as usize);

        // two full apply/remove cycles must behave identically
        for _ in 0..2 {
            detour.apply().expect("apply");
            TRAMPOLINE.store(detour.trampoline().expect("trampoline"), Ordering::SeqCst);

            // hooked: detour runs, chains to the original through the
            // trampoline, and perturbs the result
            assert_eq!(call(), 0x11111112);

            // the trampoline alone reproduces the original behavior
            let original: extern "C" fn() -> u32 =
                unsafe { core::mem::transmute(detour.trampoline().unwrap()) };
            assert_eq!(original(), 0x11111111);

            detour.remove().expect("remove");
            assert_eq!(call(), 0x11111111);
            assert!(detour.trampoline().is_none(), "trampoline freed on remove");
        }
    }

    #[test]
    fn test_apply_idempotent_and_drop_restores() {
        let proc = open_self();
        let target_fn = make_target_fn(&proc);
        let call: extern "C" fn() -> u32 = unsafe { core::mem::transmute(target_fn.base()) };

        {
            let mut detour = PatchDetour::new(&proc, target_fn.base(), hook_adds_one as usize);
            detour.apply().expect("apply");
            TRAMPOLINE.store(detour.trampoline().unwrap(), Ordering::SeqCst);
            let trampoline = detour.trampoline();
            detour.apply().expect("apply again");
            assert_eq!(detour.trampoline(), trampoline, "no second trampoline");
        }

        // dropped: original behavior restored
        assert_eq!(call(), 0x11111111);
    }

    #[test]
    fn test_patch_never_splits_instructions() {
        let proc = open_self();
        let alloc = proc.alloc(64, Protection::EXECUTE_READWRITE).expect("alloc");

        // first instruction is 10 bytes (mov rax, imm64), then ret
        let mut code = vec![0x48u8, 0xB8];
        code.extend_from_slice(&0x2222_2222u64.to_le_bytes());
        code.push(0xC3);
        proc.write_bytes(alloc.base(), &code).expect("write");

        let mut detour = PatchDetour::new(&proc, alloc.base(), hook_adds_one as usize);
        detour.apply().expect("apply");

        // the saved prologue must cover the whole mov even though only 5
        // bytes were strictly required
        assert!(detour.saved.len() >= 10);
        detour.remove().expect("remove");
    }
}
