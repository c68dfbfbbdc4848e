//! Trailing overlay (data appended past the last section of a raw file)

use crate::error::{Result, UmbraError};
use crate::pe::{NtHeaders, PeImage, Section};

/// the overlay of an on-disk image
#[derive(Debug, Clone)]
pub struct Overlay {
    /// file offset where the overlay starts
    pub offset: usize,
    /// overlay length in bytes
    pub size: usize,
    /// VA of the overlay in the target's addressing
    pub va: usize,
}

impl Overlay {
    /// locate the overlay of a raw file
    ///
    /// the overlay starts at the largest file-aligned section end. a file
    /// ending exactly there has no overlay (a not-found-shaped structural
    /// error); section data running past the end of the file is malformed.
    pub fn new(pe: &PeImage, nt: &NtHeaders) -> Result<Self> {
        let file_alignment = nt.file_alignment().max(1) as usize;
        let file_size = pe.size();

        let mut section_end = nt.size_of_headers() as usize;
        for section in Section::all(pe, nt)? {
            let end = section.pointer_to_raw_data() as usize + section.size_of_raw_data() as usize;
            section_end = section_end.max(end);
        }

        // round up to file alignment
        let aligned_end = section_end.div_ceil(file_alignment) * file_alignment;

        if aligned_end > file_size {
            return Err(UmbraError::MalformedOverlay {
                section_end: aligned_end,
                file_size,
            });
        }
        if aligned_end == file_size {
            return Err(UmbraError::NoOverlay);
        }

        Ok(Self {
            offset: aligned_end,
            size: file_size - aligned_end,
            va: pe.base() + aligned_end,
        })
    }

    /// read the overlay bytes
    pub fn data(&self, pe: &PeImage) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.size];
        pe.process().read_bytes(self.va, &mut buf)?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pe::testimage;
    use crate::process::Process;

    #[test]
    fn test_overlay_found() {
        let trailing = [0xAAu8; 16];
        let image = testimage::build(&trailing);
        let proc = Process::current();
        let pe = PeImage::from_raw(&proc, image.as_ptr() as usize, image.len());
        let nt = NtHeaders::new(&pe).expect("nt");

        let overlay = Overlay::new(&pe, &nt).expect("overlay");
        assert_eq!(overlay.size, 16);
        assert_eq!(overlay.offset, image.len() - 16);
        assert_eq!(overlay.data(&pe).expect("data"), trailing);
    }

    #[test]
    fn test_no_overlay_is_not_found_shaped() {
        let image = testimage::build(&[]);
        let proc = Process::current();
        let pe = PeImage::from_raw(&proc, image.as_ptr() as usize, image.len());
        let nt = NtHeaders::new(&pe).expect("nt");

        let err = Overlay::new(&pe, &nt).unwrap_err();
        assert!(matches!(err, UmbraError::NoOverlay));
    }

    #[test]
    fn test_truncated_file_is_malformed() {
        let image = testimage::build(&[]);
        let proc = Process::current();
        // lie about the file size: shorter than the last section's data
        let pe = PeImage::from_raw(&proc, image.as_ptr() as usize, image.len() - 0x100);
        let nt = NtHeaders::new(&pe).expect("nt");

        let err = Overlay::new(&pe, &nt).unwrap_err();
        assert!(matches!(err, UmbraError::MalformedOverlay { .. }));
    }
}
