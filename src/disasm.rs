//! Disassembler wrapper
//!
//! Thin layer over iced-x86 supplying what the patch engine needs:
//! per-instruction lengths with a raw-byte copy, instruction-boundary-safe
//! patch lengths, relocation of a prologue to a new address, and the
//! jump/NOP encoders used to build stubs.

use iced_x86::{
    BlockEncoder, BlockEncoderOptions, Decoder, DecoderOptions, FlowControl,
    InstructionBlock, OpKind,
};

use crate::error::{Result, UmbraError};
use crate::pe::NtHeaders;
use crate::process::Process;

/// longest x86 instruction
const MAX_INSTRUCTION_LEN: usize = 15;

/// one decoded instruction
#[derive(Debug, Clone)]
pub struct Instruction {
    /// address the instruction was decoded at
    pub va: usize,
    /// length in bytes
    pub length: usize,
    /// raw byte copy
    pub bytes: Vec<u8>,
    /// uses IP-relative addressing (branch target or RIP-relative operand)
    pub is_relative: bool,
    /// branch, call, return, interrupt
    pub is_control_flow: bool,
    /// absolute target for direct near branches/calls
    pub branch_target: Option<u64>,
    /// formatted mnemonic + operands
    pub text: String,
}

/// instruction decoder for a fixed bitness
#[derive(Debug, Clone, Copy)]
pub struct Disassembler {
    bitness: u32,
}

impl Disassembler {
    pub fn x64() -> Self {
        Self { bitness: 64 }
    }

    pub fn x86() -> Self {
        Self { bitness: 32 }
    }

    /// decoder for the calling process's architecture
    pub fn native() -> Self {
        if cfg!(target_pointer_width = "64") {
            Self::x64()
        } else {
            Self::x86()
        }
    }

    /// decoder matching an image's optional-header width
    pub fn for_image(nt: &NtHeaders) -> Self {
        if nt.is_64() {
            Self::x64()
        } else {
            Self::x86()
        }
    }

    pub fn bitness(&self) -> u32 {
        self.bitness
    }

    fn analyze(&self, instr: &iced_x86::Instruction, bytes: &[u8]) -> Instruction {
        let flow = instr.flow_control();
        let is_control_flow = !matches!(flow, FlowControl::Next);

        let mut is_relative = instr.is_ip_rel_memory_operand();
        let mut branch_target = None;

        if matches!(
            flow,
            FlowControl::UnconditionalBranch | FlowControl::ConditionalBranch | FlowControl::Call
        ) && matches!(
            instr.op0_kind(),
            OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64
        ) {
            is_relative = true;
            branch_target = Some(instr.near_branch_target());
        }

        Instruction {
            va: instr.ip() as usize,
            length: instr.len(),
            bytes: bytes[..instr.len()].to_vec(),
            is_relative,
            is_control_flow,
            branch_target,
            text: instr.to_string(),
        }
    }

    /// decode up to `count` instructions from a local byte slice
    pub fn decode_slice(&self, va: usize, code: &[u8], count: usize) -> Vec<Instruction> {
        let mut decoder = Decoder::with_ip(self.bitness, code, va as u64, DecoderOptions::NONE);
        let mut out = Vec::new();

        while out.len() < count && decoder.can_decode() {
            let offset = decoder.position();
            let instr = decoder.decode();
            if instr.is_invalid() {
                break;
            }
            out.push(self.analyze(&instr, &code[offset..]));
        }

        out
    }

    /// decode `count` instructions starting at a VA in the target
    pub fn disassemble(&self, process: &Process, va: usize, count: usize) -> Result<Vec<Instruction>> {
        let window = count.max(1) * MAX_INSTRUCTION_LEN;
        let mut buf = vec![0u8; window];
        process.read_bytes(va, &mut buf)?;
        Ok(self.decode_slice(va, &buf, count))
    }

    /// smallest whole-instruction length >= `min_len` at a VA in the target
    ///
    /// the instruction-boundary safety primitive: a patch of the returned
    /// length never splits an instruction.
    pub fn patch_length(&self, process: &Process, va: usize, min_len: usize) -> Result<usize> {
        // enough bytes for the worst case of all-maximal instructions
        let window = min_len + MAX_INSTRUCTION_LEN;
        let mut buf = vec![0u8; window];
        process.read_bytes(va, &mut buf)?;

        let mut total = 0usize;
        let mut decoder = Decoder::with_ip(self.bitness, &buf, va as u64, DecoderOptions::NONE);
        while total < min_len && decoder.can_decode() {
            let instr = decoder.decode();
            if instr.is_invalid() {
                break;
            }
            total += instr.len();
        }

        if total >= min_len {
            Ok(total)
        } else {
            Err(UmbraError::NoInstructionBoundary {
                address: va,
                needed: min_len,
            })
        }
    }

    /// re-encode instructions at a new address, fixing IP-relative operands
    pub fn relocate(&self, instructions: &[Instruction], new_ip: usize) -> Result<Vec<u8>> {
        if instructions.is_empty() {
            return Ok(Vec::new());
        }

        let origin = instructions[0].va;
        let mut decoded = Vec::with_capacity(instructions.len());
        for instruction in instructions {
            let mut decoder = Decoder::with_ip(
                self.bitness,
                &instruction.bytes,
                instruction.va as u64,
                DecoderOptions::NONE,
            );
            let instr = decoder.decode();
            if instr.is_invalid() {
                return Err(UmbraError::UnrelocatableInstruction {
                    address: instruction.va,
                });
            }
            decoded.push(instr);
        }

        let block = InstructionBlock::new(&decoded, new_ip as u64);
        let encoded = BlockEncoder::encode(self.bitness, block, BlockEncoderOptions::NONE)
            .map_err(|_| UmbraError::UnrelocatableInstruction { address: origin })?;

        Ok(encoded.code_buffer)
    }
}

/// encode a near relative jump; None when the displacement overflows rel32
pub fn encode_jmp_rel(source: usize, target: usize) -> Option<Vec<u8>> {
    let offset = (target as i64).wrapping_sub(source as i64) - JMP_REL_SIZE as i64;
    if offset < i32::MIN as i64 || offset > i32::MAX as i64 {
        return None;
    }

    let mut bytes = Vec::with_capacity(JMP_REL_SIZE);
    bytes.push(0xE9);
    bytes.extend_from_slice(&(offset as i32).to_le_bytes());
    Some(bytes)
}

/// size of a jmp rel32
pub const JMP_REL_SIZE: usize = 5;

/// encode an absolute jump stub for the given bitness
///
/// x64: `jmp qword ptr [rip+0]` followed by the 8-byte target.
/// x86: `push imm32; ret`.
pub fn encode_jmp_abs(target: usize, bitness: u32) -> Vec<u8> {
    if bitness == 64 {
        let mut bytes = Vec::with_capacity(14);
        bytes.extend_from_slice(&[0xFF, 0x25, 0x00, 0x00, 0x00, 0x00]);
        bytes.extend_from_slice(&(target as u64).to_le_bytes());
        bytes
    } else {
        let mut bytes = Vec::with_capacity(6);
        bytes.push(0x68);
        bytes.extend_from_slice(&(target as u32).to_le_bytes());
        bytes.push(0xC3);
        bytes
    }
}

/// size of the absolute jump stub for a bitness
pub fn jmp_abs_size(bitness: u32) -> usize {
    if bitness == 64 {
        14
    } else {
        6
    }
}

/// encode a NOP pad using multi-byte NOPs
pub fn encode_nop_pad(size: usize) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(size);
    let mut remaining = size;

    while remaining > 0 {
        match remaining {
            1 => {
                bytes.push(0x90);
                remaining -= 1;
            }
            2 => {
                bytes.extend_from_slice(&[0x66, 0x90]);
                remaining -= 2;
            }
            3 => {
                bytes.extend_from_slice(&[0x0F, 0x1F, 0x00]);
                remaining -= 3;
            }
            4 => {
                bytes.extend_from_slice(&[0x0F, 0x1F, 0x40, 0x00]);
                remaining -= 4;
            }
            5 => {
                bytes.extend_from_slice(&[0x0F, 0x1F, 0x44, 0x00, 0x00]);
                remaining -= 5;
            }
            6 => {
                bytes.extend_from_slice(&[0x66, 0x0F, 0x1F, 0x44, 0x00, 0x00]);
                remaining -= 6;
            }
            7 => {
                bytes.extend_from_slice(&[0x0F, 0x1F, 0x80, 0x00, 0x00, 0x00, 0x00]);
                remaining -= 7;
            }
            _ => {
                bytes.extend_from_slice(&[0x0F, 0x1F, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00]);
                remaining -= 8;
            }
        }
    }

    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{memory::Protection, Process, ProcessAccess};

    #[test]
    fn test_decode_lengths_and_flags() {
        let disasm = Disassembler::x64();
        // push rbp; mov rbp, rsp; sub rsp, 0x28; jmp +0
        let code = [
            0x55, 0x48, 0x89, 0xE5, 0x48, 0x83, 0xEC, 0x28, 0xE9, 0x00, 0x00, 0x00, 0x00,
        ];

        let instructions = disasm.decode_slice(0x1000, &code, 8);
        assert_eq!(instructions.len(), 4);
        assert_eq!(instructions[0].length, 1);
        assert_eq!(instructions[1].length, 3);
        assert_eq!(instructions[2].length, 4);
        assert_eq!(instructions[3].length, 5);

        assert!(!instructions[0].is_control_flow);
        assert!(instructions[3].is_control_flow);
        assert!(instructions[3].is_relative);
        // jmp at 0x1008, rel 0 -> target 0x100D
        assert_eq!(instructions[3].branch_target, Some(0x100D));

        // raw byte copies are exact
        assert_eq!(instructions[1].bytes, vec![0x48, 0x89, 0xE5]);
        assert!(!instructions[0].text.is_empty());
    }

    #[test]
    fn test_patch_length_never_splits() {
        let proc = Process::open(std::process::id(), ProcessAccess::read_write()).expect("open");
        let alloc = proc.alloc(64, Protection::EXECUTE_READWRITE).expect("alloc");

        // mov rax, imm64 (10 bytes); ret
        let mut code = vec![0x48u8, 0xB8];
        code.extend_from_slice(&0u64.to_le_bytes());
        code.push(0xC3);
        proc.write_bytes(alloc.base(), &code).expect("write");

        let disasm = Disassembler::x64();
        // 5 bytes requested, but the first instruction is 10 bytes
        let len = disasm.patch_length(&proc, alloc.base(), 5).expect("length");
        assert_eq!(len, 10);
    }

    #[test]
    fn test_relocate_rel32_branch() {
        let disasm = Disassembler::x64();
        // call +0x100 at 0x1000 -> absolute target 0x1105
        let code = [0xE8, 0x00, 0x01, 0x00, 0x00];
        let instructions = disasm.decode_slice(0x1000, &code, 1);
        assert_eq!(instructions[0].branch_target, Some(0x1105));

        let relocated = disasm.relocate(&instructions, 0x2000).expect("relocate");
        // decode at the new IP: target must be preserved
        let check = disasm.decode_slice(0x2000, &relocated, 1);
        assert_eq!(check[0].branch_target, Some(0x1105));
    }

    #[test]
    fn test_relocate_non_relative_copies() {
        let disasm = Disassembler::x64();
        let code = [0x55]; // push rbp
        let instructions = disasm.decode_slice(0x1000, &code, 1);
        let relocated = disasm.relocate(&instructions, 0x9000_0000).expect("relocate");
        assert_eq!(relocated, vec![0x55]);
    }

    #[test]
    fn test_jmp_encoders() {
        let near = encode_jmp_rel(0x1000, 0x1100).expect("near");
        assert_eq!(near.len(), JMP_REL_SIZE);
        assert_eq!(near[0], 0xE9);
        assert_eq!(i32::from_le_bytes(near[1..5].try_into().unwrap()), 0xFB);

        // beyond rel32
        assert!(encode_jmp_rel(0x1000, 0x1_0000_1000).is_none());

        let abs64 = encode_jmp_abs(0xDEAD_BEEF_1234_5678, 64);
        assert_eq!(abs64.len(), jmp_abs_size(64));
        assert_eq!(&abs64[0..6], &[0xFF, 0x25, 0x00, 0x00, 0x00, 0x00]);

        let abs32 = encode_jmp_abs(0x1234_5678, 32);
        assert_eq!(abs32.len(), jmp_abs_size(32));
        assert_eq!(abs32[0], 0x68);
        assert_eq!(*abs32.last().unwrap(), 0xC3);
    }

    #[test]
    fn test_nop_pad_sizes_and_validity() {
        let disasm = Disassembler::x64();
        for size in 1..=24 {
            let pad = encode_nop_pad(size);
            assert_eq!(pad.len(), size);

            // every pad decodes to whole instructions totalling exactly size
            let instructions = disasm.decode_slice(0x1000, &pad, 32);
            let total: usize = instructions.iter().map(|i| i.length).sum();
            assert_eq!(total, size);
        }
    }
}
