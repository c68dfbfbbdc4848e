//! DOS header cursor
//!
//! Cursors cache the raw struct locally; getters and setters touch only the
//! cache, and the cache is reconciled with the target explicitly through
//! `update_read` (remote to cache) and `update_write` (cache to remote).
//! Equality is base-address identity, not content.

use crate::error::{Result, UmbraError};
use crate::pe::layout::{ImageDosHeader, DOS_SIGNATURE};
use crate::pe::PeImage;
use crate::process::Process;

/// cursor over IMAGE_DOS_HEADER
#[derive(Debug, Clone)]
pub struct DosHeader {
    process: Process,
    base: usize,
    raw: ImageDosHeader,
}

impl DosHeader {
    /// read the DOS header at the image base; fails on a bad magic
    pub fn new(pe: &PeImage) -> Result<Self> {
        let raw: ImageDosHeader = pe.process().read(pe.base())?;
        if raw.e_magic != DOS_SIGNATURE {
            return Err(UmbraError::BadDosSignature { found: raw.e_magic });
        }

        Ok(Self {
            process: pe.process().clone(),
            base: pe.base(),
            raw,
        })
    }

    /// address of the header in the target
    pub fn base(&self) -> usize {
        self.base
    }

    /// refresh the cache from the target
    pub fn update_read(&mut self) -> Result<()> {
        self.raw = self.process.read(self.base)?;
        Ok(())
    }

    /// commit the cache to the target
    pub fn update_write(&self) -> Result<()> {
        self.process.write(self.base, &self.raw)
    }

    pub fn magic(&self) -> u16 {
        self.raw.e_magic
    }

    pub fn set_magic(&mut self, value: u16) {
        self.raw.e_magic = value;
    }

    pub fn checksum(&self) -> u16 {
        self.raw.e_csum
    }

    pub fn set_checksum(&mut self, value: u16) {
        self.raw.e_csum = value;
    }

    pub fn initial_ip(&self) -> u16 {
        self.raw.e_ip
    }

    pub fn set_initial_ip(&mut self, value: u16) {
        self.raw.e_ip = value;
    }

    pub fn initial_cs(&self) -> u16 {
        self.raw.e_cs
    }

    pub fn set_initial_cs(&mut self, value: u16) {
        self.raw.e_cs = value;
    }

    pub fn overlay_number(&self) -> u16 {
        self.raw.e_ovno
    }

    pub fn set_overlay_number(&mut self, value: u16) {
        self.raw.e_ovno = value;
    }

    pub fn oem_id(&self) -> u16 {
        self.raw.e_oemid
    }

    pub fn set_oem_id(&mut self, value: u16) {
        self.raw.e_oemid = value;
    }

    pub fn oem_info(&self) -> u16 {
        self.raw.e_oeminfo
    }

    pub fn set_oem_info(&mut self, value: u16) {
        self.raw.e_oeminfo = value;
    }

    pub fn new_header_offset(&self) -> i32 {
        self.raw.e_lfanew
    }

    pub fn set_new_header_offset(&mut self, value: i32) {
        self.raw.e_lfanew = value;
    }

    /// the whole cached struct, for byte-level comparisons
    pub fn raw(&self) -> ImageDosHeader {
        self.raw
    }
}

impl PartialEq for DosHeader {
    fn eq(&self, other: &Self) -> bool {
        self.process == other.process && self.base == other.base
    }
}

impl Eq for DosHeader {}
