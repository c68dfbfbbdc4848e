//! Bound-import directory iteration
//!
//! Bound-import name offsets are relative to the start of the whole table,
//! not to the current record, so the iterator carries the table-start anchor
//! separately from its cursor.

use crate::error::Result;
use crate::pe::layout::{ImageBoundForwarderRef, ImageBoundImportDescriptor};
use crate::pe::{DirectoryKind, NtHeaders, PeImage};
use crate::process::Process;

/// one bound-import descriptor with its module name resolved
#[derive(Debug, Clone)]
pub struct BoundImport {
    /// address of the descriptor record
    pub base: usize,
    pub time_date_stamp: u32,
    pub offset_module_name: u16,
    pub number_of_forwarder_refs: u16,
    pub module_name: String,
}

/// one forwarder reference following a bound-import descriptor
#[derive(Debug, Clone)]
pub struct BoundForwarderRef {
    pub base: usize,
    pub time_date_stamp: u32,
    pub offset_module_name: u16,
    pub module_name: String,
}

/// forward-only iterator over bound-import descriptors
pub struct BoundImportIter {
    process: Process,
    /// start of the table; name offsets are relative to this, not to the
    /// current descriptor
    table_start: usize,
    cursor: Option<usize>,
}

impl BoundImportIter {
    /// locate the bound-import table; absent-size is tolerated per loader
    /// behavior, only a zero RVA makes the directory absent
    pub fn new(pe: &PeImage, nt: &NtHeaders) -> Result<Self> {
        let base = nt.directory_va(pe, DirectoryKind::BoundImport)?;
        Ok(Self {
            process: pe.process().clone(),
            table_start: base,
            cursor: Some(base),
        })
    }

    /// the anchor all name offsets are relative to
    pub fn table_start(&self) -> usize {
        self.table_start
    }

    fn read_name(&self, offset: u16) -> Result<String> {
        self.process.read_string(self.table_start + offset as usize)
    }

    /// the forwarder refs trailing a descriptor
    pub fn forwarder_refs(&self, import: &BoundImport) -> ForwarderRefIter {
        ForwarderRefIter {
            process: self.process.clone(),
            table_start: self.table_start,
            cursor: import.base + core::mem::size_of::<ImageBoundImportDescriptor>(),
            remaining: import.number_of_forwarder_refs as usize,
        }
    }
}

impl Iterator for BoundImportIter {
    type Item = Result<BoundImport>;

    fn next(&mut self) -> Option<Self::Item> {
        let base = self.cursor?;

        let raw: ImageBoundImportDescriptor = match self.process.read(base) {
            Ok(raw) => raw,
            Err(err) => {
                self.cursor = None;
                return Some(Err(err));
            }
        };

        // terminal record: no timestamp or no name
        if raw.time_date_stamp == 0 || raw.offset_module_name == 0 {
            self.cursor = None;
            return None;
        }

        let module_name = match self.read_name(raw.offset_module_name) {
            Ok(name) => name,
            Err(err) => {
                self.cursor = None;
                return Some(Err(err));
            }
        };

        // the next descriptor follows this one's forwarder refs
        self.cursor = Some(
            base + core::mem::size_of::<ImageBoundImportDescriptor>()
                + raw.number_of_module_forwarder_refs as usize
                    * core::mem::size_of::<ImageBoundForwarderRef>(),
        );

        Some(Ok(BoundImport {
            base,
            time_date_stamp: raw.time_date_stamp,
            offset_module_name: raw.offset_module_name,
            number_of_forwarder_refs: raw.number_of_module_forwarder_refs,
            module_name,
        }))
    }
}

/// iterator over the forwarder refs of one bound-import descriptor
pub struct ForwarderRefIter {
    process: Process,
    table_start: usize,
    cursor: usize,
    remaining: usize,
}

impl Iterator for ForwarderRefIter {
    type Item = Result<BoundForwarderRef>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }

        let base = self.cursor;
        let raw: ImageBoundForwarderRef = match self.process.read(base) {
            Ok(raw) => raw,
            Err(err) => {
                self.remaining = 0;
                return Some(Err(err));
            }
        };

        let module_name = match self
            .process
            .read_string(self.table_start + raw.offset_module_name as usize)
        {
            Ok(name) => name,
            Err(err) => {
                self.remaining = 0;
                return Some(Err(err));
            }
        };

        self.remaining -= 1;
        self.cursor += core::mem::size_of::<ImageBoundForwarderRef>();

        Some(Ok(BoundForwarderRef {
            base,
            time_date_stamp: raw.time_date_stamp,
            offset_module_name: raw.offset_module_name,
            module_name,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::UmbraError;
    use crate::pe::layout::*;

    /// synthesize a bound-import table in a local buffer and walk it
    #[test]
    fn test_synthetic_bound_import_walk() {
        // table: descriptor A (1 forwarder), descriptor B, terminator, names
        let mut table = vec![0u8; 0x100];

        let names_offset: u16 = 0x40;
        let fwd_name_offset: u16 = 0x50;
        let b_name_offset: u16 = 0x60;

        let desc_a = ImageBoundImportDescriptor {
            time_date_stamp: 0x1111_1111,
            offset_module_name: names_offset,
            number_of_module_forwarder_refs: 1,
        };
        let fwd = ImageBoundForwarderRef {
            time_date_stamp: 0x2222_2222,
            offset_module_name: fwd_name_offset,
            reserved: 0,
        };
        let desc_b = ImageBoundImportDescriptor {
            time_date_stamp: 0x3333_3333,
            offset_module_name: b_name_offset,
            number_of_module_forwarder_refs: 0,
        };

        write_at(&mut table, 0, &desc_a);
        write_at(&mut table, 8, &fwd);
        write_at(&mut table, 16, &desc_b);
        // offset 24: zeroed terminator

        table[names_offset as usize..names_offset as usize + 10].copy_from_slice(b"alpha.dll\0");
        table[fwd_name_offset as usize..fwd_name_offset as usize + 8].copy_from_slice(b"fwd.dll\0");
        table[b_name_offset as usize..b_name_offset as usize + 9].copy_from_slice(b"beta.dll\0");

        let process = Process::current();
        let iter = BoundImportIter {
            process: process.clone(),
            table_start: table.as_ptr() as usize,
            cursor: Some(table.as_ptr() as usize),
        };
        let table_start = iter.table_start();

        let descriptors: Vec<BoundImport> = iter
            .collect::<Result<Vec<_>>>()
            .expect("walk");
        assert_eq!(descriptors.len(), 2);
        assert_eq!(descriptors[0].module_name, "alpha.dll");
        assert_eq!(descriptors[1].module_name, "beta.dll");
        // names resolve against the table start, not the record
        assert_eq!(descriptors[1].base, table_start + 16);

        let refs_iter = ForwarderRefIter {
            process,
            table_start,
            cursor: descriptors[0].base + core::mem::size_of::<ImageBoundImportDescriptor>(),
            remaining: descriptors[0].number_of_forwarder_refs as usize,
        };
        let refs: Vec<BoundForwarderRef> = refs_iter.collect::<Result<Vec<_>>>().expect("refs");
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].module_name, "fwd.dll");
    }

    #[test]
    fn test_absent_directory_errors() {
        use crate::pe::{testimage, NtHeaders, PeImage};

        let image = testimage::build(&[]);
        let proc = Process::current();
        let pe = PeImage::from_raw(&proc, image.as_ptr() as usize, image.len());
        let nt = NtHeaders::new(&pe).expect("nt");

        let err = BoundImportIter::new(&pe, &nt).err().expect("absent");
        assert!(matches!(err, UmbraError::DirectoryAbsent { .. }));
    }

    fn write_at<T: Copy>(buf: &mut [u8], offset: usize, value: &T) {
        let bytes = unsafe {
            core::slice::from_raw_parts(value as *const T as *const u8, core::mem::size_of::<T>())
        };
        buf[offset..offset + bytes.len()].copy_from_slice(bytes);
    }
}
