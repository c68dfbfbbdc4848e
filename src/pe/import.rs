//! Import directory iteration
//!
//! Descriptor iteration replicates loader semantics: a descriptor whose
//! name RVA or first-thunk RVA is zero ends the walk, even if other fields
//! are populated. Thunks end on a zero entry. Iterators are forward-only,
//! single-pass, and yield `Result` items because every step is a remote
//! read that can fail.

use crate::error::{Result, UmbraError};
use crate::pe::layout::{
    ImageImportDescriptor, IMAGE_ORDINAL_FLAG32, IMAGE_ORDINAL_FLAG64,
};
use crate::pe::{DirectoryKind, NtHeaders, PeImage};
use crate::process::Process;

/// cursor over one IMAGE_IMPORT_DESCRIPTOR
#[derive(Clone)]
pub struct ImportDescriptor {
    process: Process,
    pe: PeImage,
    base: usize,
    is_64: bool,
    raw: ImageImportDescriptor,
}

impl ImportDescriptor {
    pub fn base(&self) -> usize {
        self.base
    }

    pub fn update_read(&mut self) -> Result<()> {
        self.raw = self.process.read(self.base)?;
        Ok(())
    }

    pub fn update_write(&self) -> Result<()> {
        self.process.write(self.base, &self.raw)
    }

    pub fn original_first_thunk(&self) -> u32 {
        self.raw.original_first_thunk
    }

    pub fn set_original_first_thunk(&mut self, value: u32) {
        self.raw.original_first_thunk = value;
    }

    pub fn time_date_stamp(&self) -> u32 {
        self.raw.time_date_stamp
    }

    pub fn set_time_date_stamp(&mut self, value: u32) {
        self.raw.time_date_stamp = value;
    }

    pub fn forwarder_chain(&self) -> u32 {
        self.raw.forwarder_chain
    }

    pub fn set_forwarder_chain(&mut self, value: u32) {
        self.raw.forwarder_chain = value;
    }

    pub fn name_rva(&self) -> u32 {
        self.raw.name
    }

    pub fn set_name_rva(&mut self, value: u32) {
        self.raw.name = value;
    }

    pub fn first_thunk(&self) -> u32 {
        self.raw.first_thunk
    }

    pub fn set_first_thunk(&mut self, value: u32) {
        self.raw.first_thunk = value;
    }

    /// the imported module's name
    pub fn name(&self) -> Result<String> {
        match self.pe.rva_to_va(self.raw.name)? {
            Some(va) => self.process.read_string(va),
            None => Ok(String::new()),
        }
    }

    /// iterate the import lookup table (falling back to the IAT when the
    /// lookup table is absent, as the loader does)
    pub fn thunks(&self) -> Result<ThunkIter> {
        let table_rva = if self.raw.original_first_thunk != 0 {
            self.raw.original_first_thunk
        } else {
            self.raw.first_thunk
        };

        let lookup_va = self.pe.rva_to_va(table_rva)?;
        let iat_va = self.pe.rva_to_va(self.raw.first_thunk)?;

        Ok(ThunkIter {
            process: self.process.clone(),
            pe: self.pe.clone(),
            is_64: self.is_64,
            lookup: lookup_va,
            iat: iat_va,
            done: lookup_va.is_none(),
        })
    }

    pub fn raw(&self) -> ImageImportDescriptor {
        self.raw
    }
}

impl PartialEq for ImportDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.process == other.process && self.base == other.base
    }
}

impl Eq for ImportDescriptor {}

/// forward-only iterator over import descriptors
pub struct ImportIter {
    process: Process,
    pe: PeImage,
    is_64: bool,
    cursor: Option<usize>,
}

impl ImportIter {
    /// locate the import directory and position at its first descriptor
    pub fn new(pe: &PeImage, nt: &NtHeaders) -> Result<Self> {
        let base = nt.directory_va(pe, DirectoryKind::Import)?;
        Ok(Self {
            process: pe.process().clone(),
            pe: pe.clone(),
            is_64: nt.is_64(),
            cursor: Some(base),
        })
    }
}

impl Iterator for ImportIter {
    type Item = Result<ImportDescriptor>;

    fn next(&mut self) -> Option<Self::Item> {
        let base = self.cursor?;

        let raw: ImageImportDescriptor = match self.process.read(base) {
            Ok(raw) => raw,
            Err(err) => {
                self.cursor = None;
                return Some(Err(err));
            }
        };

        // loader termination: a null name or null IAT ends the list
        if raw.name == 0 || raw.first_thunk == 0 {
            self.cursor = None;
            return None;
        }

        self.cursor = Some(base + core::mem::size_of::<ImageImportDescriptor>());

        Some(Ok(ImportDescriptor {
            process: self.process.clone(),
            pe: self.pe.clone(),
            base,
            is_64: self.is_64,
            raw,
        }))
    }
}

/// one import thunk (a single symbol slot)
#[derive(Debug, Clone)]
pub struct ImportThunk {
    /// address of the lookup-table entry
    pub lookup_va: usize,
    /// address of the corresponding IAT slot, if an IAT exists
    pub iat_va: Option<usize>,
    /// the raw thunk value, widened to 64 bits
    pub value: u64,
    /// whether the import is by ordinal
    pub is_ordinal: bool,
    /// ordinal number, when imported by ordinal
    pub ordinal: Option<u16>,
    /// hint value preceding the name, when imported by name
    pub hint: Option<u16>,
    /// symbol name, when imported by name
    pub name: Option<String>,
}

/// forward-only iterator over a descriptor's thunks
pub struct ThunkIter {
    process: Process,
    pe: PeImage,
    is_64: bool,
    lookup: Option<usize>,
    iat: Option<usize>,
    done: bool,
}

impl ThunkIter {
    fn read_entry(&self, va: usize) -> Result<u64> {
        if self.is_64 {
            self.process.read::<u64>(va)
        } else {
            Ok(self.process.read::<u32>(va)? as u64)
        }
    }

    fn entry_size(&self) -> usize {
        if self.is_64 {
            8
        } else {
            4
        }
    }
}

impl Iterator for ThunkIter {
    type Item = Result<ImportThunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let lookup_va = self.lookup?;

        let value = match self.read_entry(lookup_va) {
            Ok(value) => value,
            Err(err) => {
                self.done = true;
                return Some(Err(err));
            }
        };

        if value == 0 {
            self.done = true;
            return None;
        }

        let is_ordinal = if self.is_64 {
            value & IMAGE_ORDINAL_FLAG64 != 0
        } else {
            (value as u32) & IMAGE_ORDINAL_FLAG32 != 0
        };

        let mut thunk = ImportThunk {
            lookup_va,
            iat_va: self.iat,
            value,
            is_ordinal,
            ordinal: None,
            hint: None,
            name: None,
        };

        if is_ordinal {
            thunk.ordinal = Some((value & 0xFFFF) as u16);
        } else {
            // value is the RVA of an IMAGE_IMPORT_BY_NAME: hint + name
            match self.pe.rva_to_va(value as u32) {
                Ok(Some(hint_va)) => {
                    match self.process.read::<u16>(hint_va) {
                        Ok(hint) => thunk.hint = Some(hint),
                        Err(err) => {
                            self.done = true;
                            return Some(Err(err));
                        }
                    }
                    match self.process.read_string(hint_va + 2) {
                        Ok(name) => thunk.name = Some(name),
                        Err(err) => {
                            self.done = true;
                            return Some(Err(err));
                        }
                    }
                }
                Ok(None) => {
                    self.done = true;
                    return Some(Err(UmbraError::CorruptedStructure {
                        name: "import thunk",
                        reason: format!("hint/name RVA {value:#x} is unmappable"),
                    }));
                }
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            }
        }

        self.lookup = Some(lookup_va + self.entry_size());
        self.iat = self.iat.map(|va| va + self.entry_size());

        Some(Ok(thunk))
    }
}
