//! Pattern scanning
//!
//! Naive sliding-window matching over remote regions read in chunks. Target
//! regions are module-sized, so correctness beats cleverness here; chunk
//! boundaries overlap by the pattern length so no match is lost.

pub mod sigfile;

use std::collections::HashMap;

use crate::error::{Result, UmbraError};
use crate::pe::{NtHeaders, PeImage, Section};
use crate::process::{ModuleInfo, Process};

pub use sigfile::{Manipulator, SignatureFile};

const SCAN_CHUNK: usize = 64 * 1024;

/// a byte pattern with wildcard mask
///
/// text form: two hex digits per byte, `?` or `??` for a wildcard,
/// whitespace-separated: `"8D 7E ?? 8D 9E"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    bytes: Vec<u8>,
    mask: Vec<bool>, // true = wildcard
}

impl Pattern {
    /// parse the textual pattern form
    pub fn parse(text: &str) -> Result<Self> {
        let mut bytes = Vec::new();
        let mut mask = Vec::new();

        for token in text.split_whitespace() {
            if token == "?" || token == "??" {
                bytes.push(0);
                mask.push(true);
                continue;
            }

            if token.len() != 2 {
                return Err(UmbraError::BadPattern {
                    reason: format!("token '{token}' is not a two-digit hex byte"),
                });
            }

            let byte = u8::from_str_radix(token, 16).map_err(|_| UmbraError::BadPattern {
                reason: format!("token '{token}' is not valid hex"),
            })?;
            bytes.push(byte);
            mask.push(false);
        }

        if bytes.is_empty() {
            return Err(UmbraError::BadPattern {
                reason: "empty pattern".into(),
            });
        }

        Ok(Self { bytes, mask })
    }

    /// build from explicit (byte, is-wildcard) pairs
    pub fn from_pairs(pairs: &[(u8, bool)]) -> Result<Self> {
        if pairs.is_empty() {
            return Err(UmbraError::BadPattern {
                reason: "empty pattern".into(),
            });
        }
        Ok(Self {
            bytes: pairs.iter().map(|&(b, _)| b).collect(),
            mask: pairs.iter().map(|&(_, w)| w).collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// render back to the textual form
    pub fn to_text(&self) -> String {
        self.bytes
            .iter()
            .zip(&self.mask)
            .map(|(b, &w)| {
                if w {
                    "??".to_string()
                } else {
                    format!("{b:02X}")
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn matches_at(&self, window: &[u8]) -> bool {
        window
            .iter()
            .zip(self.bytes.iter().zip(self.mask.iter()))
            .all(|(&data, (&pattern, &wildcard))| wildcard || data == pattern)
    }

    /// offsets of all matches within a local slice
    pub fn scan_slice(&self, data: &[u8]) -> Vec<usize> {
        if data.len() < self.len() {
            return Vec::new();
        }
        data.windows(self.len())
            .enumerate()
            .filter(|(_, window)| self.matches_at(window))
            .map(|(offset, _)| offset)
            .collect()
    }
}

/// half-open address range to scan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanRegion {
    pub start: usize,
    pub end: usize,
}

impl ScanRegion {
    /// construct a region; `end < start` is a caller bug
    pub fn new(start: usize, end: usize) -> Result<Self> {
        if end < start {
            return Err(UmbraError::EmptyRegion { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }
}

/// how a scan miss is reported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FindPolicy {
    /// a miss is `Ok(None)`, the probing path
    #[default]
    Lenient,
    /// a miss is an error, for patterns that must exist
    Strict,
}

/// pattern scanner over one or more regions of a target process
pub struct Scanner {
    process: Process,
    regions: Vec<ScanRegion>,
    /// when set, results are reported relative to this base (RVA-like,
    /// stable across ASLR'd loads)
    relative_to: Option<usize>,
    policy: FindPolicy,
    named: HashMap<String, Option<usize>>,
}

impl Scanner {
    /// scan explicit regions
    pub fn new(process: &Process, regions: Vec<ScanRegion>) -> Self {
        Self {
            process: process.clone(),
            regions,
            relative_to: None,
            policy: FindPolicy::Lenient,
            named: HashMap::new(),
        }
    }

    /// scan a whole module
    pub fn for_module(process: &Process, module: &ModuleInfo) -> Result<Self> {
        let region = ScanRegion::new(module.base, module.base + module.size)?;
        Ok(Self::new(process, vec![region]))
    }

    /// scan only the executable sections of an image
    pub fn for_code_sections(pe: &PeImage, nt: &NtHeaders) -> Result<Self> {
        let mut regions = Vec::new();
        for section in Section::all(pe, nt)? {
            if !section.is_executable() {
                continue;
            }
            if let Some(va) = pe.rva_to_va(section.virtual_address())? {
                let extent = section.virtual_size().max(section.size_of_raw_data()) as usize;
                regions.push(ScanRegion::new(va, va + extent)?);
            }
        }
        Ok(Self::new(pe.process(), regions))
    }

    /// report results relative to `base`
    pub fn relative_to(mut self, base: usize) -> Self {
        self.relative_to = Some(base);
        self
    }

    /// set the miss policy
    pub fn policy(mut self, policy: FindPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn regions(&self) -> &[ScanRegion] {
        &self.regions
    }

    fn rebase(&self, address: usize) -> usize {
        match self.relative_to {
            Some(base) => address - base,
            None => address,
        }
    }

    fn scan_region(&self, region: ScanRegion, pattern: &Pattern, all: &mut Vec<usize>, first_only: bool) -> Result<()> {
        let overlap = pattern.len().saturating_sub(1);
        let mut offset = 0usize;
        let size = region.len();

        while offset < size {
            let chunk_start = region.start + offset;
            let read_size = (size - offset).min(SCAN_CHUNK);

            let mut buf = vec![0u8; read_size];
            if self.process.read_bytes(chunk_start, &mut buf).is_err() {
                // unreadable stretch (freed page, guard page); skip it
                offset += read_size.saturating_sub(overlap).max(1);
                continue;
            }

            for m in pattern.scan_slice(&buf) {
                all.push(chunk_start + m);
                if first_only {
                    return Ok(());
                }
            }

            if offset + read_size >= size {
                break;
            }
            offset += read_size.saturating_sub(overlap).max(1);
        }

        Ok(())
    }

    /// first match across all regions
    pub fn find(&self, pattern: &Pattern) -> Result<Option<usize>> {
        let mut hits = Vec::new();
        for &region in &self.regions {
            self.scan_region(region, pattern, &mut hits, true)?;
            if let Some(&hit) = hits.first() {
                return Ok(Some(self.rebase(hit)));
            }
        }

        match self.policy {
            FindPolicy::Lenient => Ok(None),
            FindPolicy::Strict => Err(UmbraError::PatternNotFound {
                name: pattern.to_text(),
            }),
        }
    }

    /// all matches across all regions, deduplicated and sorted
    pub fn find_all(&self, pattern: &Pattern) -> Result<Vec<usize>> {
        let mut hits = Vec::new();
        for &region in &self.regions {
            self.scan_region(region, pattern, &mut hits, false)?;
        }
        hits.sort_unstable();
        hits.dedup();

        if hits.is_empty() && self.policy == FindPolicy::Strict {
            return Err(UmbraError::PatternNotFound {
                name: pattern.to_text(),
            });
        }

        Ok(hits.into_iter().map(|h| self.rebase(h)).collect())
    }

    /// find and cache under a caller-supplied name; repeated lookups by the
    /// same name do not rescan
    pub fn find_named(&mut self, name: &str, pattern: &Pattern) -> Result<Option<usize>> {
        if let Some(&cached) = self.named.get(name) {
            return match (cached, self.policy) {
                (None, FindPolicy::Strict) => Err(UmbraError::PatternNotFound { name: name.into() }),
                (hit, _) => Ok(hit),
            };
        }

        let result = match self.find(pattern) {
            Ok(hit) => hit,
            Err(err) if matches!(err, UmbraError::PatternNotFound { .. }) => {
                self.named.insert(name.to_string(), None);
                return Err(UmbraError::PatternNotFound { name: name.into() });
            }
            Err(err) => return Err(err),
        };

        self.named.insert(name.to_string(), result);
        tracing::debug!(name, hit = ?result.map(|r| format!("{r:#x}")), "pattern resolved");
        Ok(result)
    }

    /// a previously cached named result
    pub fn lookup(&self, name: &str) -> Option<usize> {
        self.named.get(name).copied().flatten()
    }

    pub(crate) fn process(&self) -> &Process {
        &self.process
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{memory::Protection, ProcessAccess};

    fn scanner_over(buf_base: usize, len: usize) -> Scanner {
        let proc = Process::current();
        Scanner::new(&proc, vec![ScanRegion::new(buf_base, buf_base + len).unwrap()])
    }

    #[test]
    fn test_parse_and_render() {
        let pattern = Pattern::parse("8D 7E ?? 8D 9E").expect("parse");
        assert_eq!(pattern.len(), 5);
        assert_eq!(pattern.to_text(), "8D 7E ?? 8D 9E");

        assert!(Pattern::parse("8D 7").is_err());
        assert!(Pattern::parse("XY").is_err());
        assert!(Pattern::parse("").is_err());
        let err = Pattern::parse("ZZ").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Structural);
    }

    #[test]
    fn test_wildcards_match() {
        let data = [0x48u8, 0x8B, 0x05, 0x12, 0x34];
        let pattern = Pattern::parse("48 8B ?? 12").expect("parse");
        assert_eq!(pattern.scan_slice(&data), vec![0]);

        let miss = Pattern::parse("48 8B ?? 13").expect("parse");
        assert!(miss.scan_slice(&data).is_empty());
    }

    #[test]
    fn test_exact_two_matches_at_known_offsets() {
        let marker = b"umbra-scan-marker";
        let mut block = vec![0u8; 0x200];
        block[0x000..marker.len()].copy_from_slice(marker);
        block[0x100..0x100 + marker.len()].copy_from_slice(marker);

        let text = marker
            .iter()
            .map(|b| format!("{b:02X}"))
            .collect::<Vec<_>>()
            .join(" ");
        let pattern = Pattern::parse(&text).expect("parse");

        let base = block.as_ptr() as usize;
        let scanner = scanner_over(base, block.len()).relative_to(base);

        let all = scanner.find_all(&pattern).expect("scan");
        assert_eq!(all, vec![0x000, 0x100]);

        let first = scanner.find(&pattern).expect("scan").expect("hit");
        assert_eq!(first, 0x000);
    }

    #[test]
    fn test_miss_policies() {
        let block = vec![0u8; 0x100];
        let base = block.as_ptr() as usize;

        // fully-specified 20-byte pattern that cannot occur in a zero block
        let text = (1..=20).map(|i| format!("{i:02X}")).collect::<Vec<_>>().join(" ");
        let pattern = Pattern::parse(&text).expect("parse");

        let lenient = scanner_over(base, block.len());
        assert_eq!(lenient.find(&pattern).expect("scan"), None);

        let strict = scanner_over(base, block.len()).policy(FindPolicy::Strict);
        let err = strict.find(&pattern).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }

    #[test]
    fn test_region_invariant() {
        let err = ScanRegion::new(0x2000, 0x1000).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Invariant);
    }

    #[test]
    fn test_match_across_chunk_boundary() {
        // allocate two chunks and put the marker right on the seam
        let proc = Process::open(std::process::id(), ProcessAccess::read_write()).expect("open");
        let alloc = proc.alloc(SCAN_CHUNK * 2, Protection::READWRITE).expect("alloc");

        let marker = [0xDEu8, 0xAD, 0xBE, 0xEF, 0x42, 0x99];
        let seam = alloc.base() + SCAN_CHUNK - 3;
        proc.write_bytes(seam, &marker).expect("write");

        let pattern = Pattern::parse("DE AD BE EF 42 99").expect("parse");
        let scanner = Scanner::new(
            &proc,
            vec![ScanRegion::new(alloc.base(), alloc.base() + SCAN_CHUNK * 2).unwrap()],
        );

        let hits = scanner.find_all(&pattern).expect("scan");
        assert_eq!(hits, vec![seam]);
    }

    #[test]
    fn test_named_cache() {
        let block = vec![0xCCu8; 0x40];
        let base = block.as_ptr() as usize;
        let mut scanner = scanner_over(base, block.len());

        let pattern = Pattern::parse("CC CC CC").expect("parse");
        let hit = scanner.find_named("int3-run", &pattern).expect("scan").expect("hit");
        assert_eq!(hit, base);
        assert_eq!(scanner.lookup("int3-run"), Some(base));
    }
}
