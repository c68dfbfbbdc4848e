//! NT headers cursor
//!
//! The 32/64-bit variance of the optional header is carried as a runtime
//! tag. Every accessor branches on the tag internally, so callers never need
//! to know the bitness of the image they are inspecting.

use crate::error::{Result, UmbraError};
use crate::pe::layout::{
    DataDirectory, ImageFileHeader, ImageOptionalHeader32, ImageOptionalHeader64, NT_SIGNATURE,
    NUM_DATA_DIRECTORIES, PE32PLUS_MAGIC, PE32_MAGIC,
};
use crate::pe::{DirectoryKind, PeImage};
use crate::process::Process;

/// optional header in whichever width the image uses
#[derive(Debug, Clone, Copy)]
pub enum OptionalHeader {
    Pe32(ImageOptionalHeader32),
    Pe64(ImageOptionalHeader64),
}

/// cursor over the NT headers (signature, COFF file header, optional header)
#[derive(Clone)]
pub struct NtHeaders {
    process: Process,
    base: usize,
    signature: u32,
    file: ImageFileHeader,
    optional: OptionalHeader,
}

impl NtHeaders {
    /// locate and read the NT headers through the DOS header
    pub fn new(pe: &PeImage) -> Result<Self> {
        let base = pe.nt_base()?;
        let mut headers = Self {
            process: pe.process().clone(),
            base,
            signature: 0,
            file: ImageFileHeader::default(),
            // placeholder until update_read fills the real variant
            optional: OptionalHeader::Pe32(
                // SAFETY: all-zero is a valid bit pattern for this plain struct
                unsafe { core::mem::zeroed() },
            ),
        };
        headers.update_read()?;
        Ok(headers)
    }

    /// address of the NT headers in the target
    pub fn base(&self) -> usize {
        self.base
    }

    fn optional_base(&self) -> usize {
        self.base + 4 + core::mem::size_of::<ImageFileHeader>()
    }

    /// refresh the cache from the target
    pub fn update_read(&mut self) -> Result<()> {
        let signature: u32 = self.process.read(self.base)?;
        if signature != NT_SIGNATURE {
            return Err(UmbraError::BadNtSignature { found: signature });
        }

        let file: ImageFileHeader = self.process.read(self.base + 4)?;
        let magic: u16 = self.process.read(self.optional_base())?;

        let optional = match magic {
            PE32_MAGIC => OptionalHeader::Pe32(self.process.read(self.optional_base())?),
            PE32PLUS_MAGIC => OptionalHeader::Pe64(self.process.read(self.optional_base())?),
            other => return Err(UmbraError::BadOptionalMagic { found: other }),
        };

        self.signature = signature;
        self.file = file;
        self.optional = optional;
        Ok(())
    }

    /// commit the cache to the target
    pub fn update_write(&self) -> Result<()> {
        self.process.write(self.base, &self.signature)?;
        self.process.write(self.base + 4, &self.file)?;
        match &self.optional {
            OptionalHeader::Pe32(header) => self.process.write(self.optional_base(), header),
            OptionalHeader::Pe64(header) => self.process.write(self.optional_base(), header),
        }
    }

    pub fn is_64(&self) -> bool {
        matches!(self.optional, OptionalHeader::Pe64(_))
    }

    pub fn signature(&self) -> u32 {
        self.signature
    }

    pub fn set_signature(&mut self, value: u32) {
        self.signature = value;
    }

    // === COFF file header ===

    pub fn machine(&self) -> u16 {
        self.file.machine
    }

    pub fn set_machine(&mut self, value: u16) {
        self.file.machine = value;
    }

    pub fn number_of_sections(&self) -> u16 {
        self.file.number_of_sections
    }

    pub fn set_number_of_sections(&mut self, value: u16) {
        self.file.number_of_sections = value;
    }

    pub fn time_date_stamp(&self) -> u32 {
        self.file.time_date_stamp
    }

    pub fn set_time_date_stamp(&mut self, value: u32) {
        self.file.time_date_stamp = value;
    }

    pub fn size_of_optional_header(&self) -> u16 {
        self.file.size_of_optional_header
    }

    pub fn characteristics(&self) -> u16 {
        self.file.characteristics
    }

    pub fn set_characteristics(&mut self, value: u16) {
        self.file.characteristics = value;
    }

    // === optional header, branched once per accessor ===

    pub fn address_of_entry_point(&self) -> u32 {
        match &self.optional {
            OptionalHeader::Pe32(h) => h.address_of_entry_point,
            OptionalHeader::Pe64(h) => h.address_of_entry_point,
        }
    }

    pub fn set_address_of_entry_point(&mut self, value: u32) {
        match &mut self.optional {
            OptionalHeader::Pe32(h) => h.address_of_entry_point = value,
            OptionalHeader::Pe64(h) => h.address_of_entry_point = value,
        }
    }

    pub fn image_base(&self) -> u64 {
        match &self.optional {
            OptionalHeader::Pe32(h) => h.image_base as u64,
            OptionalHeader::Pe64(h) => h.image_base,
        }
    }

    pub fn set_image_base(&mut self, value: u64) {
        match &mut self.optional {
            OptionalHeader::Pe32(h) => h.image_base = value as u32,
            OptionalHeader::Pe64(h) => h.image_base = value,
        }
    }

    pub fn section_alignment(&self) -> u32 {
        match &self.optional {
            OptionalHeader::Pe32(h) => h.section_alignment,
            OptionalHeader::Pe64(h) => h.section_alignment,
        }
    }

    pub fn file_alignment(&self) -> u32 {
        match &self.optional {
            OptionalHeader::Pe32(h) => h.file_alignment,
            OptionalHeader::Pe64(h) => h.file_alignment,
        }
    }

    pub fn size_of_image(&self) -> u32 {
        match &self.optional {
            OptionalHeader::Pe32(h) => h.size_of_image,
            OptionalHeader::Pe64(h) => h.size_of_image,
        }
    }

    pub fn set_size_of_image(&mut self, value: u32) {
        match &mut self.optional {
            OptionalHeader::Pe32(h) => h.size_of_image = value,
            OptionalHeader::Pe64(h) => h.size_of_image = value,
        }
    }

    pub fn size_of_headers(&self) -> u32 {
        match &self.optional {
            OptionalHeader::Pe32(h) => h.size_of_headers,
            OptionalHeader::Pe64(h) => h.size_of_headers,
        }
    }

    pub fn subsystem(&self) -> u16 {
        match &self.optional {
            OptionalHeader::Pe32(h) => h.subsystem,
            OptionalHeader::Pe64(h) => h.subsystem,
        }
    }

    pub fn set_subsystem(&mut self, value: u16) {
        match &mut self.optional {
            OptionalHeader::Pe32(h) => h.subsystem = value,
            OptionalHeader::Pe64(h) => h.subsystem = value,
        }
    }

    pub fn dll_characteristics(&self) -> u16 {
        match &self.optional {
            OptionalHeader::Pe32(h) => h.dll_characteristics,
            OptionalHeader::Pe64(h) => h.dll_characteristics,
        }
    }

    pub fn set_dll_characteristics(&mut self, value: u16) {
        match &mut self.optional {
            OptionalHeader::Pe32(h) => h.dll_characteristics = value,
            OptionalHeader::Pe64(h) => h.dll_characteristics = value,
        }
    }

    pub fn number_of_rva_and_sizes(&self) -> u32 {
        match &self.optional {
            OptionalHeader::Pe32(h) => h.number_of_rva_and_sizes,
            OptionalHeader::Pe64(h) => h.number_of_rva_and_sizes,
        }
    }

    /// one data-directory slot (zeroed if the image declares fewer slots)
    pub fn data_directory(&self, kind: DirectoryKind) -> DataDirectory {
        let index = kind.index();
        if index >= self.number_of_rva_and_sizes() as usize || index >= NUM_DATA_DIRECTORIES {
            return DataDirectory::default();
        }
        match &self.optional {
            OptionalHeader::Pe32(h) => h.data_directory[index],
            OptionalHeader::Pe64(h) => h.data_directory[index],
        }
    }

    pub fn set_data_directory(&mut self, kind: DirectoryKind, value: DataDirectory) {
        let index = kind.index();
        if index >= NUM_DATA_DIRECTORIES {
            return;
        }
        match &mut self.optional {
            OptionalHeader::Pe32(h) => h.data_directory[index] = value,
            OptionalHeader::Pe64(h) => h.data_directory[index] = value,
        }
    }

    /// resolve a directory, enforcing presence rules
    ///
    /// a zero RVA is always absent. a zero size is absent too, except for
    /// the directories the loader itself tolerates without one (TLS,
    /// bound imports).
    pub fn directory(&self, kind: DirectoryKind) -> Result<DataDirectory> {
        let dir = self.data_directory(kind);
        if dir.virtual_address == 0 || (dir.size == 0 && !kind.tolerates_zero_size()) {
            return Err(UmbraError::DirectoryAbsent { directory: kind });
        }
        Ok(dir)
    }

    /// resolve a directory to a VA in the target
    pub fn directory_va(&self, pe: &PeImage, kind: DirectoryKind) -> Result<usize> {
        let dir = self.directory(kind)?;
        pe.rva_to_va(dir.virtual_address)?
            .ok_or(UmbraError::DirectoryAbsent { directory: kind })
    }

    /// address of the first section header
    pub fn section_table_base(&self) -> usize {
        self.optional_base() + self.file.size_of_optional_header as usize
    }

    /// the cached optional header variant
    pub fn optional(&self) -> &OptionalHeader {
        &self.optional
    }
}

impl PartialEq for NtHeaders {
    fn eq(&self, other: &Self) -> bool {
        self.process == other.process && self.base == other.base
    }
}

impl Eq for NtHeaders {}
