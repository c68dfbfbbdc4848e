//! Export directory
//!
//! Enumeration walks the three parallel export tables with bulk reads and
//! resolves forwarders by the directory-bounds rule: a function RVA landing
//! inside the export directory itself is a forwarder string, not code.

use crate::error::{Result, UmbraError};
use crate::pe::layout::ImageExportDirectory;
use crate::pe::{DirectoryKind, NtHeaders, PeImage};
use crate::process::Process;

/// one resolved export
#[derive(Debug, Clone)]
pub struct Export {
    /// exported name, if the symbol is exported by name
    pub name: Option<String>,
    /// biased ordinal (ordinal base applied)
    pub ordinal: u16,
    /// RVA of the exported symbol (or of the forwarder string)
    pub rva: u32,
    /// VA in the target's addressing
    pub va: usize,
    /// forwarder target ("module.Function" or "module.#ordinal")
    pub forwarded_to: Option<String>,
}

impl Export {
    pub fn by_name(&self) -> bool {
        self.name.is_some()
    }

    pub fn is_forwarded(&self) -> bool {
        self.forwarded_to.is_some()
    }
}

/// cursor over IMAGE_EXPORT_DIRECTORY
#[derive(Clone)]
pub struct ExportDir {
    process: Process,
    pe: PeImage,
    base: usize,
    /// VA bounds of the whole directory, for forwarder detection
    dir_start: usize,
    dir_end: usize,
    raw: ImageExportDirectory,
}

impl ExportDir {
    /// locate the export directory through the data-directory table
    pub fn new(pe: &PeImage, nt: &NtHeaders) -> Result<Self> {
        let dir = nt.directory(DirectoryKind::Export)?;
        let base = nt.directory_va(pe, DirectoryKind::Export)?;
        let raw: ImageExportDirectory = pe.process().read(base)?;

        Ok(Self {
            process: pe.process().clone(),
            pe: pe.clone(),
            base,
            dir_start: base,
            dir_end: base + dir.size as usize,
            raw,
        })
    }

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

    pub fn ordinal_base(&self) -> u32 {
        self.raw.base
    }

    pub fn set_ordinal_base(&mut self, value: u32) {
        self.raw.base = value;
    }

    pub fn number_of_functions(&self) -> u32 {
        self.raw.number_of_functions
    }

    pub fn set_number_of_functions(&mut self, value: u32) {
        self.raw.number_of_functions = value;
    }

    pub fn number_of_names(&self) -> u32 {
        self.raw.number_of_names
    }

    pub fn set_number_of_names(&mut self, value: u32) {
        self.raw.number_of_names = value;
    }

    pub fn time_date_stamp(&self) -> u32 {
        self.raw.time_date_stamp
    }

    pub fn set_time_date_stamp(&mut self, value: u32) {
        self.raw.time_date_stamp = value;
    }

    /// the exporting module's own name
    pub fn module_name(&self) -> Result<String> {
        match self.pe.rva_to_va(self.raw.name)? {
            Some(va) => self.process.read_string(va),
            None => Ok(String::new()),
        }
    }

    pub fn raw(&self) -> ImageExportDirectory {
        self.raw
    }

    /// enumerate every export
    pub fn exports(&self) -> Result<Vec<Export>> {
        let num_functions = self.raw.number_of_functions as usize;
        let num_names = self.raw.number_of_names as usize;
        let ordinal_base = self.raw.base as u16;

        if num_functions == 0 {
            return Ok(Vec::new());
        }

        let functions_va = self
            .pe
            .rva_to_va(self.raw.address_of_functions)?
            .ok_or(UmbraError::DirectoryAbsent { directory: DirectoryKind::Export })?;
        let function_rvas: Vec<u32> = self.process.read_vec(functions_va, num_functions)?;

        // name table: parallel arrays of name RVAs and unbiased ordinals
        let mut name_map: Vec<Option<String>> = vec![None; num_functions];
        if num_names > 0 {
            let names_va = self
                .pe
                .rva_to_va(self.raw.address_of_names)?
                .ok_or(UmbraError::DirectoryAbsent { directory: DirectoryKind::Export })?;
            let ordinals_va = self
                .pe
                .rva_to_va(self.raw.address_of_name_ordinals)?
                .ok_or(UmbraError::DirectoryAbsent { directory: DirectoryKind::Export })?;

            let name_rvas: Vec<u32> = self.process.read_vec(names_va, num_names)?;
            let ordinals: Vec<u16> = self.process.read_vec(ordinals_va, num_names)?;

            for i in 0..num_names {
                let index = ordinals[i] as usize;
                if index < num_functions {
                    if let Some(va) = self.pe.rva_to_va(name_rvas[i])? {
                        name_map[index] = Some(self.process.read_string(va)?);
                    }
                }
            }
        }

        let mut out = Vec::with_capacity(num_functions);
        for (i, &rva) in function_rvas.iter().enumerate() {
            // unused export slots carry a zero RVA
            if rva == 0 {
                continue;
            }

            let va = match self.pe.rva_to_va(rva)? {
                Some(va) => va,
                None => continue,
            };

            let forwarded_to = if va >= self.dir_start && va < self.dir_end {
                Some(self.process.read_string(va)?)
            } else {
                None
            };

            out.push(Export {
                name: name_map[i].clone(),
                ordinal: ordinal_base.wrapping_add(i as u16),
                rva,
                va,
                forwarded_to,
            });
        }

        Ok(out)
    }

    /// look up an export by name; `None` when absent
    pub fn find(&self, name: &str) -> Result<Option<Export>> {
        Ok(self
            .exports()?
            .into_iter()
            .find(|e| e.name.as_deref() == Some(name)))
    }

    /// look up an export by biased ordinal; `None` when absent
    pub fn find_by_ordinal(&self, ordinal: u16) -> Result<Option<Export>> {
        Ok(self.exports()?.into_iter().find(|e| e.ordinal == ordinal))
    }

    /// look up by name, escalating a miss to an error
    pub fn find_or_err(&self, name: &str) -> Result<Export> {
        self.find(name)?.ok_or_else(|| UmbraError::ExportNotFound {
            module: self.pe.base(),
            name: name.into(),
        })
    }
}

impl PartialEq for ExportDir {
    fn eq(&self, other: &Self) -> bool {
        self.process == other.process && self.base == other.base
    }
}

impl Eq for ExportDir {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessAccess;

    fn kernel32_exports() -> (PeImage, NtHeaders) {
        let proc = Process::open(std::process::id(), ProcessAccess::read_only()).expect("open");
        let module = crate::process::find_module(&proc, "kernel32.dll").expect("kernel32");
        let pe = PeImage::from_module(&proc, module.base, module.size);
        let nt = NtHeaders::new(&pe).expect("nt");
        (pe, nt)
    }

    #[test]
    fn test_enumerate_kernel32() {
        let (pe, nt) = kernel32_exports();
        let dir = ExportDir::new(&pe, &nt).expect("export dir");

        assert_eq!(dir.module_name().expect("name").to_lowercase(), "kernel32.dll");

        let exports = dir.exports().expect("exports");
        assert!(exports.len() > 1000, "kernel32 exports a lot");

        // kernel32 always carries forwarders (e.g. into ntdll)
        assert!(exports.iter().any(|e| e.is_forwarded()));
    }

    #[test]
    fn test_find_matches_get_proc_address() {
        let (pe, nt) = kernel32_exports();
        let dir = ExportDir::new(&pe, &nt).expect("export dir");

        let export = dir
            .find("GetCurrentProcessId")
            .expect("lookup")
            .expect("present");
        assert!(export.by_name());
        assert!(!export.is_forwarded());

        // SAFETY: both calls are always safe on a loaded kernel32
        let expected = unsafe {
            let k32 = GetModuleHandleA(b"kernel32.dll\0".as_ptr());
            GetProcAddress(k32, b"GetCurrentProcessId\0".as_ptr())
        };
        assert_eq!(export.va, expected as usize);
    }

    #[test]
    fn test_miss_is_none_and_escalates() {
        let (pe, nt) = kernel32_exports();
        let dir = ExportDir::new(&pe, &nt).expect("export dir");

        assert!(dir.find("UmbraDoesNotExist").expect("lookup").is_none());

        let err = dir.find_or_err("UmbraDoesNotExist").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }

    #[link(name = "kernel32")]
    extern "system" {
        fn GetModuleHandleA(lpModuleName: *const u8) -> usize;
        fn GetProcAddress(hModule: usize, lpProcName: *const u8) -> usize;
    }
}
