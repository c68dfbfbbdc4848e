//! Signature-file front end
//!
//! Usage: scan <pid> <module-name> <signatures.xml>
//!
//! Resolves every pattern in the signature file against the named module of
//! the target process and prints the name -> address map, module-relative.

#[cfg(windows)]
fn main() {
    use std::path::Path;
    use umbra::{Process, ProcessAccess, Scanner, SignatureFile};

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() != 3 {
        eprintln!("usage: scan <pid> <module-name> <signatures.xml>");
        return;
    }

    let result = (|| -> umbra::Result<()> {
        let pid: u32 = args[0].parse().map_err(|_| umbra::UmbraError::ProcessNotFound {
            name: args[0].clone(),
        })?;
        let process = Process::open(pid, ProcessAccess::read_only())?;
        let module = umbra::process::find_module(&process, &args[1])?;

        let mut scanner = Scanner::for_module(&process, &module)?.relative_to(module.base);
        let signatures = SignatureFile::load(Path::new(&args[2]))?;
        let resolved = signatures.run(&mut scanner)?;

        let mut names: Vec<_> = resolved.keys().collect();
        names.sort();
        for name in names {
            println!("{name}: {}+{:#x}", args[1], resolved[name]);
        }
        println!("{} of {} signatures resolved", resolved.len(), signatures.patterns.len());
        Ok(())
    })();

    if let Err(err) = result {
        eprintln!("scan failed: {err}");
    }
}

#[cfg(not(windows))]
fn main() {
    eprintln!("windows only");
}
