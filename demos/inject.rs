//! Injection front end
//!
//! Usage: inject <pid> <module-path> [export-name]
//!
//! A pid of -1 targets the current process (self-test mode). Prints the
//! loaded module's base, the export's result when one was named, and the
//! elapsed time. Failures are formatted to stderr; the exit code is always
//! 0 so operators read the diagnostic instead of a status byte.

#[cfg(windows)]
fn main() {
    use std::time::Instant;
    use umbra::{Injector, PathResolution, Process, ProcessAccess};

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() < 2 || args.len() > 3 {
        eprintln!("usage: inject <pid> <module-path> [export-name]");
        eprintln!("       pid -1 injects into this process");
        return;
    }

    let started = Instant::now();

    let result = (|| -> umbra::Result<()> {
        let pid: i64 = args[0].parse().map_err(|_| umbra::UmbraError::ProcessNotFound {
            name: args[0].clone(),
        })?;

        let process = if pid == -1 {
            Process::open(std::process::id(), ProcessAccess::all())?
        } else {
            Process::open(pid as u32, ProcessAccess::all())?
        };

        let injector = Injector::new(&process);
        let base = injector.inject(&args[1], PathResolution::SearchPath)?;
        println!("loaded {} at {base:#x}", args[1]);

        if let Some(export) = args.get(2) {
            let call = injector.call_export(base, export)?;
            println!(
                "{export} returned {:#x} (last error {})",
                call.return_value, call.last_error
            );
        }

        Ok(())
    })();

    if let Err(err) = result {
        eprintln!("injection failed: {err}");
    }

    eprintln!("elapsed: {:?}", started.elapsed());
}

#[cfg(not(windows))]
fn main() {
    eprintln!("windows only");
}
