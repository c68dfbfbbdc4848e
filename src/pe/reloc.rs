//! Base relocation directory iteration
//!
//! Blocks are walked until the directory's declared byte size is consumed.
//! A block with a zero SizeOfBlock is treated as a no-op and skipped over
//! its header, but the skip is bounded by the directory extent so adjacent
//! zero-size blocks at the tail terminate instead of looping.

use crate::error::Result;
use crate::pe::layout::ImageBaseRelocation;
use crate::pe::{DirectoryKind, NtHeaders, PeImage};
use crate::process::Process;

/// relocation fixup types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocType {
    Absolute,
    High,
    Low,
    HighLow,
    HighAdj,
    Dir64,
    Other(u8),
}

impl From<u8> for RelocType {
    fn from(val: u8) -> Self {
        match val {
            0 => Self::Absolute,
            1 => Self::High,
            2 => Self::Low,
            3 => Self::HighLow,
            4 => Self::HighAdj,
            10 => Self::Dir64,
            other => Self::Other(other),
        }
    }
}

/// one relocation entry: 4 bits of type, 12 bits of page offset
#[derive(Debug, Clone, Copy)]
pub struct RelocEntry(pub u16);

impl RelocEntry {
    pub fn reloc_type(&self) -> RelocType {
        RelocType::from((self.0 >> 12) as u8)
    }

    pub fn offset(&self) -> u16 {
        self.0 & 0x0FFF
    }
}

/// one relocation block: a page RVA plus its entries
#[derive(Debug, Clone)]
pub struct RelocBlock {
    /// address of the block header
    pub base: usize,
    /// page this block fixes up
    pub page_rva: u32,
    pub size_of_block: u32,
    entries_va: usize,
    process: Process,
}

impl RelocBlock {
    /// number of entries in the block
    pub fn count(&self) -> usize {
        if self.size_of_block <= HEADER_SIZE as u32 {
            0
        } else {
            ((self.size_of_block - HEADER_SIZE as u32) / 2) as usize
        }
    }

    /// bulk-read all entries of this block
    pub fn entries(&self) -> Result<Vec<RelocEntry>> {
        let raw: Vec<u16> = self.process.read_vec(self.entries_va, self.count())?;
        Ok(raw.into_iter().map(RelocEntry).collect())
    }
}

const HEADER_SIZE: usize = core::mem::size_of::<ImageBaseRelocation>();

/// forward-only iterator over relocation blocks
pub struct RelocationIter {
    process: Process,
    cursor: usize,
    end: usize,
    done: bool,
}

impl RelocationIter {
    /// locate the relocation directory
    pub fn new(pe: &PeImage, nt: &NtHeaders) -> Result<Self> {
        let dir = nt.directory(DirectoryKind::BaseReloc)?;
        let base = nt.directory_va(pe, DirectoryKind::BaseReloc)?;
        Ok(Self {
            process: pe.process().clone(),
            cursor: base,
            end: base + dir.size as usize,
            done: false,
        })
    }

    /// iterator over an explicit range (used by tests and raw callers)
    pub fn over_range(process: &Process, start: usize, size: usize) -> Self {
        Self {
            process: process.clone(),
            cursor: start,
            end: start + size,
            done: false,
        }
    }
}

impl Iterator for RelocationIter {
    type Item = Result<RelocBlock>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done || self.cursor + HEADER_SIZE > self.end {
                self.done = true;
                return None;
            }

            let base = self.cursor;
            let raw: ImageBaseRelocation = match self.process.read(base) {
                Ok(raw) => raw,
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            };

            if raw.size_of_block == 0 {
                // no-op block; skip its header, bounded by the directory end
                self.cursor = base + HEADER_SIZE;
                continue;
            }

            self.cursor = base + raw.size_of_block as usize;

            return Some(Ok(RelocBlock {
                base,
                page_rva: raw.virtual_address,
                size_of_block: raw.size_of_block,
                entries_va: base + HEADER_SIZE,
                process: self.process.clone(),
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_block(buf: &mut Vec<u8>, page_rva: u32, entries: &[u16]) {
        let size = (HEADER_SIZE + entries.len() * 2) as u32;
        buf.extend_from_slice(&page_rva.to_le_bytes());
        buf.extend_from_slice(&size.to_le_bytes());
        for &entry in entries {
            buf.extend_from_slice(&entry.to_le_bytes());
        }
    }

    #[test]
    fn test_block_walk() {
        let mut table = Vec::new();
        // DIR64 at offset 0x10, HIGHLOW at 0x20, pad ABSOLUTE
        push_block(&mut table, 0x1000, &[0xA010, 0x3020, 0x0000]);
        push_block(&mut table, 0x2000, &[0xA008]);

        let proc = Process::current();
        let blocks: Vec<RelocBlock> =
            RelocationIter::over_range(&proc, table.as_ptr() as usize, table.len())
                .collect::<Result<Vec<_>>>()
                .expect("walk");

        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].page_rva, 0x1000);
        assert_eq!(blocks[0].count(), 3);
        assert_eq!(blocks[1].page_rva, 0x2000);

        let entries = blocks[0].entries().expect("entries");
        assert_eq!(entries[0].reloc_type(), RelocType::Dir64);
        assert_eq!(entries[0].offset(), 0x10);
        assert_eq!(entries[1].reloc_type(), RelocType::HighLow);
        assert_eq!(entries[1].offset(), 0x20);
        assert_eq!(entries[2].reloc_type(), RelocType::Absolute);
    }

    #[test]
    fn test_zero_size_block_is_skipped_not_terminal() {
        let mut table = Vec::new();
        push_block(&mut table, 0x1000, &[0xA010]);
        // zero-size block between two real ones
        table.extend_from_slice(&0u32.to_le_bytes());
        table.extend_from_slice(&0u32.to_le_bytes());
        push_block(&mut table, 0x3000, &[0x3004]);

        let proc = Process::current();
        let blocks: Vec<RelocBlock> =
            RelocationIter::over_range(&proc, table.as_ptr() as usize, table.len())
                .collect::<Result<Vec<_>>>()
                .expect("walk");

        let pages: Vec<u32> = blocks.iter().map(|b| b.page_rva).collect();
        assert_eq!(pages, vec![0x1000, 0x3000]);
    }

    #[test]
    fn test_adjacent_zero_blocks_at_tail_terminate() {
        let mut table = Vec::new();
        push_block(&mut table, 0x1000, &[0xA010]);
        // tail of zero-size blocks; an unbounded skip would walk forever
        for _ in 0..4 {
            table.extend_from_slice(&0u32.to_le_bytes());
            table.extend_from_slice(&0u32.to_le_bytes());
        }

        let proc = Process::current();
        let blocks: Vec<RelocBlock> =
            RelocationIter::over_range(&proc, table.as_ptr() as usize, table.len())
                .collect::<Result<Vec<_>>>()
                .expect("walk");

        assert_eq!(blocks.len(), 1);
    }

    #[test]
    fn test_live_module_relocations_terminate() {
        use crate::process::ProcessAccess;

        let proc = Process::open(std::process::id(), ProcessAccess::read_only()).expect("open");
        let module = crate::process::find_module(&proc, "ntdll.dll").expect("ntdll");
        let pe = PeImage::from_module(&proc, module.base, module.size);
        let nt = NtHeaders::new(&pe).expect("nt");

        // ntdll is relocatable; walking must terminate
        let iter = RelocationIter::new(&pe, &nt).expect("reloc dir");
        let mut count = 0usize;
        for block in iter {
            block.expect("block read");
            count += 1;
            assert!(count < 0x10000, "runaway relocation walk");
        }
        assert!(count > 0);
    }
}
