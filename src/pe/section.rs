//! Section table cursors

use crate::error::Result;
use crate::pe::layout::{
    ImageSectionHeader, IMAGE_SCN_CNT_CODE, IMAGE_SCN_MEM_EXECUTE, IMAGE_SCN_MEM_READ,
    IMAGE_SCN_MEM_WRITE,
};
use crate::pe::{NtHeaders, PeImage};
use crate::process::Process;

/// cursor over one IMAGE_SECTION_HEADER
#[derive(Clone)]
pub struct Section {
    process: Process,
    base: usize,
    index: usize,
    raw: ImageSectionHeader,
}

impl Section {
    /// read the section header at `index`
    pub fn new(pe: &PeImage, nt: &NtHeaders, index: usize) -> Result<Self> {
        let base = nt.section_table_base() + index * core::mem::size_of::<ImageSectionHeader>();
        let raw: ImageSectionHeader = pe.process().read(base)?;
        Ok(Self {
            process: pe.process().clone(),
            base,
            index,
            raw,
        })
    }

    /// all sections of the image
    pub fn all(pe: &PeImage, nt: &NtHeaders) -> Result<Vec<Section>> {
        (0..nt.number_of_sections() as usize)
            .map(|index| Section::new(pe, nt, index))
            .collect()
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn update_read(&mut self) -> Result<()> {
        self.raw = self.process.read(self.base)?;
        Ok(())
    }

    pub fn update_write(&self) -> Result<()> {
        self.process.write(self.base, &self.raw)
    }

    pub fn name(&self) -> String {
        self.raw.name_str()
    }

    pub fn set_name(&mut self, name: &str) {
        let mut bytes = [0u8; 8];
        let len = name.len().min(8);
        bytes[..len].copy_from_slice(&name.as_bytes()[..len]);
        self.raw.name = bytes;
    }

    pub fn virtual_address(&self) -> u32 {
        self.raw.virtual_address
    }

    pub fn set_virtual_address(&mut self, value: u32) {
        self.raw.virtual_address = value;
    }

    pub fn virtual_size(&self) -> u32 {
        self.raw.virtual_size
    }

    pub fn set_virtual_size(&mut self, value: u32) {
        self.raw.virtual_size = value;
    }

    pub fn pointer_to_raw_data(&self) -> u32 {
        self.raw.pointer_to_raw_data
    }

    pub fn set_pointer_to_raw_data(&mut self, value: u32) {
        self.raw.pointer_to_raw_data = value;
    }

    pub fn size_of_raw_data(&self) -> u32 {
        self.raw.size_of_raw_data
    }

    pub fn set_size_of_raw_data(&mut self, value: u32) {
        self.raw.size_of_raw_data = value;
    }

    pub fn characteristics(&self) -> u32 {
        self.raw.characteristics
    }

    pub fn set_characteristics(&mut self, value: u32) {
        self.raw.characteristics = value;
    }

    pub fn is_code(&self) -> bool {
        self.raw.characteristics & IMAGE_SCN_CNT_CODE != 0
    }

    pub fn is_executable(&self) -> bool {
        self.raw.characteristics & IMAGE_SCN_MEM_EXECUTE != 0
    }

    pub fn is_readable(&self) -> bool {
        self.raw.characteristics & IMAGE_SCN_MEM_READ != 0
    }

    pub fn is_writable(&self) -> bool {
        self.raw.characteristics & IMAGE_SCN_MEM_WRITE != 0
    }

    /// whether an RVA falls inside this section's virtual extent
    pub fn contains_rva(&self, rva: u32) -> bool {
        let extent = self.raw.virtual_size.max(self.raw.size_of_raw_data);
        rva >= self.raw.virtual_address && rva - self.raw.virtual_address < extent
    }

    pub fn raw(&self) -> ImageSectionHeader {
        self.raw
    }
}

impl PartialEq for Section {
    fn eq(&self, other: &Self) -> bool {
        self.process == other.process && self.base == other.base
    }
}

impl Eq for Section {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pe::testimage;

    #[test]
    fn test_section_walk_synthetic() {
        let image = testimage::build(&[]);
        let proc = Process::current();
        let pe = PeImage::from_raw(&proc, image.as_ptr() as usize, image.len());
        let nt = NtHeaders::new(&pe).expect("nt");

        let sections = Section::all(&pe, &nt).expect("sections");
        assert_eq!(sections.len(), 1);

        let text = &sections[0];
        assert_eq!(text.name(), ".text");
        assert!(text.is_code());
        assert!(text.is_executable());
        assert!(!text.is_writable());
        assert!(text.contains_rva(testimage::TEST_SECTION_RVA));
        assert!(text.contains_rva(testimage::TEST_SECTION_RVA + 0x100));
        assert!(!text.contains_rva(0x80));
    }

    #[test]
    fn test_setter_idempotence() {
        let mut image = testimage::build(&[]);
        let proc = Process::current();
        let pe = PeImage::from_raw(&proc, image.as_mut_ptr() as usize, image.len());
        let nt = NtHeaders::new(&pe).expect("nt");

        let before = image.clone();
        let mut section = Section::new(&pe, &nt, 0).expect("section");

        section.set_name(&section.name());
        section.set_virtual_address(section.virtual_address());
        section.set_virtual_size(section.virtual_size());
        section.set_pointer_to_raw_data(section.pointer_to_raw_data());
        section.set_size_of_raw_data(section.size_of_raw_data());
        section.set_characteristics(section.characteristics());

        section.update_write().expect("write");
        section.update_read().expect("read");

        assert_eq!(image, before);
    }
}
