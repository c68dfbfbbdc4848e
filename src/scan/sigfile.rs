//! Pattern signature files
//!
//! XML persistence for named byte signatures, so patterns survive across
//! runs and tooling:
//!
//! ```xml
//! <Patterns>
//!   <Pattern name="SpawnEntity" data="8D 7E ?? 8D 9E">
//!     <Manipulator op="add" operand="0x3"/>
//!     <Manipulator op="lea"/>
//!   </Pattern>
//! </Patterns>
//! ```
//!
//! Manipulators post-process a found address in order: add/sub adjust it,
//! deref reads a pointer through the accessor, lea resolves a trailing
//! rel32 displacement the way RIP-relative operands encode one.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, UmbraError};
use crate::process::Process;
use crate::scan::{Pattern, Scanner};

/// one post-processing step applied to a found address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Manipulator {
    /// advance the address by a constant
    Add(usize),
    /// back the address up by a constant
    Sub(usize),
    /// read a pointer-sized value at the address
    Deref,
    /// resolve a rel32 displacement: target = addr + 4 + *(i32*)addr
    Lea,
}

impl Manipulator {
    /// apply this step through the target's accessor
    pub fn apply(&self, process: &Process, address: usize) -> Result<usize> {
        match self {
            Manipulator::Add(operand) => Ok(address.wrapping_add(*operand)),
            Manipulator::Sub(operand) => Ok(address.wrapping_sub(*operand)),
            Manipulator::Deref => process.read::<usize>(address),
            Manipulator::Lea => {
                let disp: i32 = process.read(address)?;
                Ok(address.wrapping_add(4).wrapping_add(disp as isize as usize))
            }
        }
    }
}

/// a named pattern plus its manipulator chain
#[derive(Debug, Clone)]
pub struct NamedPattern {
    pub name: String,
    pub pattern: Pattern,
    pub manipulators: Vec<Manipulator>,
}

/// a loaded signature file
#[derive(Debug, Clone, Default)]
pub struct SignatureFile {
    pub patterns: Vec<NamedPattern>,
}

// === XML wire model ===

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename = "Patterns")]
struct PatternsXml {
    #[serde(rename = "Pattern", default)]
    patterns: Vec<PatternXml>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PatternXml {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "@data")]
    data: String,
    #[serde(rename = "Manipulator", default, skip_serializing_if = "Vec::is_empty")]
    manipulators: Vec<ManipulatorXml>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ManipulatorXml {
    #[serde(rename = "@op")]
    op: String,
    #[serde(rename = "@operand", default, skip_serializing_if = "Option::is_none")]
    operand: Option<String>,
}

fn parse_operand(text: &str) -> Result<usize> {
    let parsed = if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        usize::from_str_radix(hex, 16)
    } else {
        text.parse()
    };
    parsed.map_err(|_| UmbraError::SignatureFile {
        reason: format!("bad operand '{text}'"),
    })
}

impl TryFrom<ManipulatorXml> for Manipulator {
    type Error = UmbraError;

    fn try_from(xml: ManipulatorXml) -> Result<Self> {
        let operand = || -> Result<usize> {
            let text = xml.operand.as_deref().ok_or_else(|| UmbraError::SignatureFile {
                reason: format!("manipulator '{}' requires an operand", xml.op),
            })?;
            parse_operand(text)
        };

        match xml.op.as_str() {
            "add" => Ok(Manipulator::Add(operand()?)),
            "sub" => Ok(Manipulator::Sub(operand()?)),
            "deref" => Ok(Manipulator::Deref),
            "lea" => Ok(Manipulator::Lea),
            other => Err(UmbraError::SignatureFile {
                reason: format!("unknown manipulator op '{other}'"),
            }),
        }
    }
}

impl From<&Manipulator> for ManipulatorXml {
    fn from(manipulator: &Manipulator) -> Self {
        match manipulator {
            Manipulator::Add(operand) => ManipulatorXml {
                op: "add".into(),
                operand: Some(format!("{operand:#x}")),
            },
            Manipulator::Sub(operand) => ManipulatorXml {
                op: "sub".into(),
                operand: Some(format!("{operand:#x}")),
            },
            Manipulator::Deref => ManipulatorXml { op: "deref".into(), operand: None },
            Manipulator::Lea => ManipulatorXml { op: "lea".into(), operand: None },
        }
    }
}

impl SignatureFile {
    /// parse the XML text form
    pub fn from_xml(text: &str) -> Result<Self> {
        let xml: PatternsXml = quick_xml::de::from_str(text).map_err(|e| UmbraError::SignatureFile {
            reason: e.to_string(),
        })?;

        let mut patterns = Vec::with_capacity(xml.patterns.len());
        for entry in xml.patterns {
            let pattern = Pattern::parse(&entry.data)?;
            let manipulators = entry
                .manipulators
                .into_iter()
                .map(Manipulator::try_from)
                .collect::<Result<Vec<_>>>()?;
            patterns.push(NamedPattern {
                name: entry.name,
                pattern,
                manipulators,
            });
        }

        Ok(Self { patterns })
    }

    /// render to the XML text form
    pub fn to_xml(&self) -> Result<String> {
        let xml = PatternsXml {
            patterns: self
                .patterns
                .iter()
                .map(|p| PatternXml {
                    name: p.name.clone(),
                    data: p.pattern.to_text(),
                    manipulators: p.manipulators.iter().map(ManipulatorXml::from).collect(),
                })
                .collect(),
        };
        quick_xml::se::to_string(&xml).map_err(|e| UmbraError::SignatureFile {
            reason: e.to_string(),
        })
    }

    /// load from a file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| UmbraError::SignatureFile {
            reason: format!("{}: {e}", path.display()),
        })?;
        Self::from_xml(&text)
    }

    /// save to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_xml()?).map_err(|e| UmbraError::SignatureFile {
            reason: format!("{}: {e}", path.display()),
        })
    }

    /// add a pattern
    pub fn push(&mut self, name: &str, pattern: Pattern, manipulators: Vec<Manipulator>) {
        self.patterns.push(NamedPattern {
            name: name.into(),
            pattern,
            manipulators,
        });
    }

    /// resolve every signature against a scanner, applying manipulators
    ///
    /// misses are reported per the scanner's policy: lenient scanners simply
    /// omit the name from the result map.
    pub fn run(&self, scanner: &mut Scanner) -> Result<HashMap<String, usize>> {
        let mut out = HashMap::new();
        let process = scanner.process().clone();

        for entry in &self.patterns {
            let Some(mut address) = scanner.find_named(&entry.name, &entry.pattern)? else {
                continue;
            };
            for manipulator in &entry.manipulators {
                address = manipulator.apply(&process, address)?;
            }
            out.insert(entry.name.clone(), address);
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::ScanRegion;

    #[test]
    fn test_xml_roundtrip() {
        let mut file = SignatureFile::default();
        file.push(
            "SpawnEntity",
            Pattern::parse("8D 7E ?? 8D 9E").unwrap(),
            vec![Manipulator::Add(3), Manipulator::Lea],
        );
        file.push("Health", Pattern::parse("89 46 10").unwrap(), vec![Manipulator::Deref]);

        let xml = file.to_xml().expect("serialize");
        assert!(xml.contains("SpawnEntity"));
        assert!(xml.contains("8D 7E ?? 8D 9E"));

        let back = SignatureFile::from_xml(&xml).expect("parse");
        assert_eq!(back.patterns.len(), 2);
        assert_eq!(back.patterns[0].name, "SpawnEntity");
        assert_eq!(back.patterns[0].pattern, file.patterns[0].pattern);
        assert_eq!(back.patterns[0].manipulators, file.patterns[0].manipulators);
        assert_eq!(back.patterns[1].manipulators, vec![Manipulator::Deref]);
    }

    #[test]
    fn test_parse_plain_element_form() {
        let text = r#"<Patterns>
            <Pattern name="A" data="AA BB ?? CC"/>
            <Pattern name="B" data="01 02">
                <Manipulator op="add" operand="0x10"/>
            </Pattern>
        </Patterns>"#;

        let file = SignatureFile::from_xml(text).expect("parse");
        assert_eq!(file.patterns.len(), 2);
        assert_eq!(file.patterns[1].manipulators, vec![Manipulator::Add(0x10)]);
    }

    #[test]
    fn test_bad_manipulator_rejected() {
        let text = r#"<Patterns><Pattern name="A" data="AA"><Manipulator op="mul" operand="2"/></Pattern></Patterns>"#;
        let err = SignatureFile::from_xml(text).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Structural);
    }

    #[test]
    fn test_run_with_manipulators() {
        // marker, then 8 bytes later a usize pointing at a u32 value
        let mut block = vec![0u8; 0x100];
        block[0..4].copy_from_slice(&[0xFE, 0xED, 0xFA, 0xCE]);
        let base = block.as_ptr() as usize;

        let value_addr = base + 0x40;
        block[0x08..0x08 + core::mem::size_of::<usize>()]
            .copy_from_slice(&value_addr.to_le_bytes());

        let proc = Process::current();
        let mut scanner = Scanner::new(
            &proc,
            vec![ScanRegion::new(base, base + block.len()).unwrap()],
        );

        let mut file = SignatureFile::default();
        file.push(
            "ValuePtr",
            Pattern::parse("FE ED FA CE").unwrap(),
            vec![Manipulator::Add(8), Manipulator::Deref],
        );

        let resolved = file.run(&mut scanner).expect("run");
        assert_eq!(resolved["ValuePtr"], value_addr);
    }

    #[test]
    fn test_file_roundtrip() {
        let mut file = SignatureFile::default();
        file.push("X", Pattern::parse("12 34").unwrap(), vec![]);

        let path = std::env::temp_dir().join(format!("umbra-sig-{}.xml", std::process::id()));
        file.save(&path).expect("save");
        let back = SignatureFile::load(&path).expect("load");
        let _ = std::fs::remove_file(&path);

        assert_eq!(back.patterns.len(), 1);
        assert_eq!(back.patterns[0].pattern.to_text(), "12 34");
    }
}
