//! TLS directory
//!
//! Callback enumeration normalizes each stored pointer to an image-relative
//! offset (subtracting the image base from the optional header), so callback
//! lists compare equal across separately-loaded copies of the same module.

use crate::error::Result;
use crate::pe::layout::{ImageTlsDirectory32, ImageTlsDirectory64};
use crate::pe::{AddressMode, DirectoryKind, NtHeaders, PeImage};
use crate::process::Process;

/// TLS directory in whichever width the image uses
#[derive(Debug, Clone, Copy)]
enum TlsRaw {
    Tls32(ImageTlsDirectory32),
    Tls64(ImageTlsDirectory64),
}

/// cursor over IMAGE_TLS_DIRECTORY
#[derive(Clone)]
pub struct TlsDir {
    process: Process,
    pe: PeImage,
    base: usize,
    /// base the directory's stored VAs are relative to: the actual load
    /// address for a mapped image (the loader relocated them), the preferred
    /// base from the optional header for a raw file
    runtime_base: u64,
    raw: TlsRaw,
}

impl TlsDir {
    /// locate the TLS directory; a declared size of zero is tolerated, as
    /// the loader itself resolves TLS from the RVA alone
    pub fn new(pe: &PeImage, nt: &NtHeaders) -> Result<Self> {
        let base = nt.directory_va(pe, DirectoryKind::Tls)?;

        let raw = if nt.is_64() {
            TlsRaw::Tls64(pe.process().read(base)?)
        } else {
            TlsRaw::Tls32(pe.process().read(base)?)
        };

        let runtime_base = match pe.mode() {
            AddressMode::MappedImage => pe.base() as u64,
            AddressMode::RawFile => nt.image_base(),
        };

        Ok(Self {
            process: pe.process().clone(),
            pe: pe.clone(),
            base,
            runtime_base,
            raw,
        })
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn update_read(&mut self) -> Result<()> {
        self.raw = match self.raw {
            TlsRaw::Tls32(_) => TlsRaw::Tls32(self.process.read(self.base)?),
            TlsRaw::Tls64(_) => TlsRaw::Tls64(self.process.read(self.base)?),
        };
        Ok(())
    }

    pub fn update_write(&self) -> Result<()> {
        match &self.raw {
            TlsRaw::Tls32(raw) => self.process.write(self.base, raw),
            TlsRaw::Tls64(raw) => self.process.write(self.base, raw),
        }
    }

    pub fn start_address_of_raw_data(&self) -> u64 {
        match &self.raw {
            TlsRaw::Tls32(raw) => raw.start_address_of_raw_data as u64,
            TlsRaw::Tls64(raw) => raw.start_address_of_raw_data,
        }
    }

    pub fn end_address_of_raw_data(&self) -> u64 {
        match &self.raw {
            TlsRaw::Tls32(raw) => raw.end_address_of_raw_data as u64,
            TlsRaw::Tls64(raw) => raw.end_address_of_raw_data,
        }
    }

    pub fn address_of_index(&self) -> u64 {
        match &self.raw {
            TlsRaw::Tls32(raw) => raw.address_of_index as u64,
            TlsRaw::Tls64(raw) => raw.address_of_index,
        }
    }

    pub fn address_of_callbacks(&self) -> u64 {
        match &self.raw {
            TlsRaw::Tls32(raw) => raw.address_of_callbacks as u64,
            TlsRaw::Tls64(raw) => raw.address_of_callbacks,
        }
    }

    pub fn size_of_zero_fill(&self) -> u32 {
        match &self.raw {
            TlsRaw::Tls32(raw) => raw.size_of_zero_fill,
            TlsRaw::Tls64(raw) => raw.size_of_zero_fill,
        }
    }

    pub fn characteristics(&self) -> u32 {
        match &self.raw {
            TlsRaw::Tls32(raw) => raw.characteristics,
            TlsRaw::Tls64(raw) => raw.characteristics,
        }
    }

    fn is_64(&self) -> bool {
        matches!(self.raw, TlsRaw::Tls64(_))
    }

    /// enumerate TLS callbacks as image-relative offsets
    ///
    /// the callback array holds absolute VAs (for the preferred or actual
    /// load address) terminated by a null pointer; each entry is normalized
    /// by subtracting the image base.
    pub fn callbacks(&self) -> Result<Vec<u64>> {
        let callbacks_va = self.address_of_callbacks();
        if callbacks_va == 0 {
            return Ok(Vec::new());
        }

        // the stored pointer is a VA; for a mapped image it is directly
        // readable, for a raw file it must be remapped through the sections
        let array_rva = callbacks_va.wrapping_sub(self.runtime_base) as u32;
        let mut cursor = match self.pe.rva_to_va(array_rva)? {
            Some(va) => va,
            None => return Ok(Vec::new()),
        };

        let entry_size = if self.is_64() { 8 } else { 4 };
        let mut out = Vec::new();

        loop {
            let value: u64 = if self.is_64() {
                self.process.read::<u64>(cursor)?
            } else {
                self.process.read::<u32>(cursor)? as u64
            };

            if value == 0 {
                break;
            }

            out.push(value.wrapping_sub(self.runtime_base));
            cursor += entry_size;
        }

        Ok(out)
    }
}

impl PartialEq for TlsDir {
    fn eq(&self, other: &Self) -> bool {
        self.process == other.process && self.base == other.base
    }
}

impl Eq for TlsDir {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::UmbraError;
    use crate::pe::testimage;
    use crate::process::ProcessAccess;

    #[test]
    fn test_absent_tls_is_distinguishable() {
        let image = testimage::build(&[]);
        let proc = Process::current();
        let pe = PeImage::from_raw(&proc, image.as_ptr() as usize, image.len());
        let nt = NtHeaders::new(&pe).expect("nt");

        let err = TlsDir::new(&pe, &nt).err().expect("absent");
        assert!(matches!(
            err,
            UmbraError::DirectoryAbsent { directory: DirectoryKind::Tls }
        ));
        // probing callers filter on the structural kind
        assert_eq!(err.kind(), crate::error::ErrorKind::Structural);
    }

    #[test]
    fn test_live_tls_enumeration_when_present() {
        let proc = Process::open(std::process::id(), ProcessAccess::read_only()).expect("open");
        let exe = std::env::current_exe().expect("exe");
        let name = exe.file_name().unwrap().to_string_lossy().to_string();
        let module = crate::process::find_module(&proc, &name).expect("own module");
        let pe = PeImage::from_module(&proc, module.base, module.size);
        let nt = NtHeaders::new(&pe).expect("nt");

        // the test binary may or may not carry a TLS directory; when it
        // does, the callback walk must terminate and every normalized
        // offset must stay inside the image
        match TlsDir::new(&pe, &nt) {
            Ok(tls) => {
                let callbacks = tls.callbacks().expect("callbacks");
                for offset in callbacks {
                    assert!(offset < nt.size_of_image() as u64);
                }
            }
            Err(err) => {
                assert_eq!(err.kind(), crate::error::ErrorKind::Structural);
            }
        }
    }
}
