//! DLL injection and remote export calls
//!
//! Loads a module into a target process without its cooperation: the module
//! path is written into the target, a remote thread is started at
//! `LoadLibraryW`, and the wait for its exit is bounded by an explicit
//! timeout. Export invocation resolves the symbol through the PE export
//! directory (following forwarders) and runs a small generated call stub
//! that captures both the return value and the remote thread's last error.
//!
//! Addresses of `LoadLibraryW`/`GetLastError` are taken from the calling
//! process; system DLLs load at the same base in every process of the same
//! bitness, which is also why a WoW64 target cannot be injected from a
//! 64-bit caller.

use std::path::Path;

use crate::error::{Result, UmbraError};
use crate::pe::{ExportDir, NtHeaders, PeImage};
use crate::process::{find_module, memory::Protection, modules, Process};

const INFINITE: u32 = 0xFFFF_FFFF;
const WAIT_OBJECT_0: u32 = 0;
const WAIT_TIMEOUT: u32 = 0x102;
const MAX_PATH_WIDE: usize = 1024;

/// how a module name argument is turned into a load path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PathResolution {
    /// hand the string to the loader untouched
    #[default]
    AsIs,
    /// resolve a relative or bare name through the loader's search path
    SearchPath,
}

/// result of a remote export call
#[derive(Debug, Clone, Copy)]
pub struct CallResult {
    /// the export's return value (zero-extended on 32-bit targets)
    pub return_value: u64,
    /// GetLastError of the remote thread after the call
    pub last_error: u32,
}

/// DLL injector for one target process
pub struct Injector {
    process: Process,
    timeout_ms: u32,
}

impl Injector {
    pub fn new(process: &Process) -> Self {
        Self {
            process: process.clone(),
            timeout_ms: INFINITE,
        }
    }

    /// bound every remote-thread wait; a timeout becomes a typed error
    /// rather than an ambiguous hang
    pub fn with_timeout(mut self, timeout_ms: u32) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// load a DLL into the target, returning the loaded module's base
    pub fn inject(&self, module: &str, resolution: PathResolution) -> Result<usize> {
        let path = match resolution {
            PathResolution::AsIs => module.to_string(),
            PathResolution::SearchPath => search_path(module)?,
        };
        tracing::debug!(pid = self.process.pid(), %path, "injecting");

        // the path buffer lives in the target for LoadLibraryW to read
        let wide: Vec<u16> = path.encode_utf16().chain(core::iter::once(0)).collect();
        let path_buf = self
            .process
            .alloc(wide.len() * 2, Protection::READWRITE)?;
        self.process.write_slice(path_buf.base(), &wide)?;

        let load_library = local_kernel32_export("LoadLibraryW")?;
        let exit_code =
            create_remote_thread_and_wait(&self.process, load_library, path_buf.base(), self.timeout_ms)?;

        if exit_code == 0 {
            return Err(UmbraError::RemoteThreadFailed {
                reason: format!("LoadLibraryW(\"{path}\") returned null"),
                code: 0,
            });
        }

        // the exit code is 32 bits; resolve the full base by name
        let file_name = Path::new(&path)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or(path.clone());

        let base = find_module(&self.process, &file_name)
            .map(|m| m.base)
            .unwrap_or(exit_code as usize);
        tracing::debug!(base = format_args!("{base:#x}"), "module loaded");
        Ok(base)
    }

    /// invoke a named export of a loaded module on a remote thread
    pub fn call_export(&self, module_base: usize, export: &str) -> Result<CallResult> {
        let target = resolve_export(&self.process, module_base, export)?;
        tracing::debug!(
            export,
            address = format_args!("{target:#x}"),
            "calling remote export"
        );
        self.call_remote(target)
    }

    /// unload a previously injected module via FreeLibrary
    pub fn free_dll(&self, module_base: usize) -> Result<()> {
        let free_library = local_kernel32_export("FreeLibrary")?;
        let exit_code =
            create_remote_thread_and_wait(&self.process, free_library, module_base, self.timeout_ms)?;

        if exit_code == 0 {
            return Err(UmbraError::RemoteThreadFailed {
                reason: format!("FreeLibrary({module_base:#x}) failed in target"),
                code: 0,
            });
        }
        Ok(())
    }

    /// run an argumentless function in the target, capturing its return
    /// value and the remote thread's last error
    pub fn call_remote(&self, function: usize) -> Result<CallResult> {
        let get_last_error = local_kernel32_export("GetLastError")?;

        let result_buf = self.process.alloc(16, Protection::READWRITE)?;
        let stub = if self.process.is_64()? {
            build_call_stub_x64(function, get_last_error, result_buf.base())
        } else {
            build_call_stub_x86(function, get_last_error, result_buf.base())
        };

        let stub_buf = self.process.alloc(stub.len(), Protection::EXECUTE_READWRITE)?;
        self.process.write_bytes(stub_buf.base(), &stub)?;
        self.process
            .flush_instruction_cache(stub_buf.base(), stub.len())?;

        create_remote_thread_and_wait(&self.process, stub_buf.base(), 0, self.timeout_ms)?;

        let return_value: u64 = self.process.read(result_buf.base())?;
        let last_error: u32 = self.process.read(result_buf.base() + 8)?;
        Ok(CallResult {
            return_value,
            last_error,
        })
    }
}

/// resolve an export by name, following forwarder chains
///
/// a forwarded export ("module.Function" or "module.#ordinal") recurses
/// through the named module's own export table.
pub fn resolve_export(process: &Process, module_base: usize, name: &str) -> Result<usize> {
    let size = modules(process)?
        .into_iter()
        .find(|m| m.base == module_base)
        .map(|m| m.size)
        .unwrap_or(0);

    let pe = PeImage::from_module(process, module_base, size);
    let nt = NtHeaders::new(&pe)?;
    let exports = ExportDir::new(&pe, &nt)?;
    let export = exports.find_or_err(name)?;

    let Some(forward) = export.forwarded_to else {
        return Ok(export.va);
    };

    let (module_part, symbol_part) = forward.split_once('.').ok_or_else(|| {
        UmbraError::CorruptedStructure {
            name: "export forwarder",
            reason: format!("'{forward}' has no module separator"),
        }
    })?;

    let mut module_name = module_part.to_string();
    if !module_name.to_lowercase().ends_with(".dll") {
        module_name.push_str(".dll");
    }
    let module = find_module(process, &module_name)?;

    if let Some(ordinal_text) = symbol_part.strip_prefix('#') {
        let ordinal: u16 = ordinal_text.parse().map_err(|_| UmbraError::CorruptedStructure {
            name: "export forwarder",
            reason: format!("bad ordinal in '{forward}'"),
        })?;
        let pe = PeImage::from_module(process, module.base, module.size);
        let nt = NtHeaders::new(&pe)?;
        let exports = ExportDir::new(&pe, &nt)?;
        let export = exports
            .find_by_ordinal(ordinal)?
            .ok_or_else(|| UmbraError::ExportNotFound {
                module: module.base,
                name: format!("#{ordinal}"),
            })?;
        match export.forwarded_to {
            // forwarders chaining by ordinal into yet another module are not
            // something the loader produces; stop rather than loop
            Some(chain) => Err(UmbraError::CorruptedStructure {
                name: "export forwarder",
                reason: format!("ordinal forwarder chains to '{chain}'"),
            }),
            None => Ok(export.va),
        }
    } else {
        resolve_export(process, module.base, symbol_part)
    }
}

/// start a thread in the target and wait for it, bounded by `timeout_ms`
pub fn create_remote_thread_and_wait(
    process: &Process,
    start: usize,
    parameter: usize,
    timeout_ms: u32,
) -> Result<u32> {
    let mut tid: u32 = 0;
    // SAFETY: start/parameter are addresses in the target; tid is stack storage
    let handle = unsafe {
        CreateRemoteThread(
            process.handle(),
            core::ptr::null(),
            0,
            start,
            parameter,
            0,
            &mut tid,
        )
    };
    if handle == 0 {
        return Err(UmbraError::RemoteThreadFailed {
            reason: "CreateRemoteThread".into(),
            code: UmbraError::last_os_error(),
        });
    }

    // SAFETY: handle is a live thread handle
    let wait = unsafe { WaitForSingleObject(handle, timeout_ms) };
    if wait != WAIT_OBJECT_0 {
        // SAFETY: we own the handle
        unsafe { CloseHandle(handle) };
        if wait == WAIT_TIMEOUT {
            // the remote thread keeps running; the caller knows that much
            return Err(UmbraError::RemoteThreadTimeout { millis: timeout_ms });
        }
        return Err(UmbraError::RemoteThreadFailed {
            reason: format!("WaitForSingleObject returned {wait:#x}"),
            code: UmbraError::last_os_error(),
        });
    }

    let mut exit_code: u32 = 0;
    // SAFETY: handle is valid, exit_code is stack storage
    let ok = unsafe { GetExitCodeThread(handle, &mut exit_code) };
    // SAFETY: we own the handle
    unsafe { CloseHandle(handle) };

    if ok == 0 {
        return Err(UmbraError::from_last_error("GetExitCodeThread"));
    }
    Ok(exit_code)
}

/// address of a kernel32 export in the calling process
fn local_kernel32_export(name: &str) -> Result<usize> {
    let mut name_z = name.as_bytes().to_vec();
    name_z.push(0);

    // SAFETY: both strings are NUL-terminated
    let address = unsafe {
        let kernel32 = GetModuleHandleA(b"kernel32.dll\0".as_ptr());
        if kernel32 == 0 {
            return Err(UmbraError::from_last_error("GetModuleHandleA"));
        }
        GetProcAddress(kernel32, name_z.as_ptr())
    };

    if address == 0 {
        return Err(UmbraError::from_last_error("GetProcAddress"));
    }
    Ok(address)
}

/// resolve a bare or relative module name the way the loader would
fn search_path(module: &str) -> Result<String> {
    let wide: Vec<u16> = module.encode_utf16().chain(core::iter::once(0)).collect();
    let mut buf = vec![0u16; MAX_PATH_WIDE];

    // SAFETY: buffers are sized and NUL-terminated
    let len = unsafe {
        SearchPathW(
            core::ptr::null(),
            wide.as_ptr(),
            core::ptr::null(),
            buf.len() as u32,
            buf.as_mut_ptr(),
            core::ptr::null_mut(),
        )
    };

    if len == 0 || len as usize >= buf.len() {
        return Err(UmbraError::from_last_error("SearchPathW"));
    }
    Ok(String::from_utf16_lossy(&buf[..len as usize]))
}

/// call stub: invoke the function, store rax and GetLastError into the
/// result buffer, return 0
fn build_call_stub_x64(function: usize, get_last_error: usize, result: usize) -> Vec<u8> {
    let mut stub = Vec::with_capacity(64);

    // sub rsp, 0x28 (shadow space + alignment)
    stub.extend_from_slice(&[0x48, 0x83, 0xEC, 0x28]);
    // mov rax, function; call rax
    stub.extend_from_slice(&[0x48, 0xB8]);
    stub.extend_from_slice(&(function as u64).to_le_bytes());
    stub.extend_from_slice(&[0xFF, 0xD0]);
    // mov rcx, result; mov [rcx], rax
    stub.extend_from_slice(&[0x48, 0xB9]);
    stub.extend_from_slice(&(result as u64).to_le_bytes());
    stub.extend_from_slice(&[0x48, 0x89, 0x01]);
    // mov rax, GetLastError; call rax
    stub.extend_from_slice(&[0x48, 0xB8]);
    stub.extend_from_slice(&(get_last_error as u64).to_le_bytes());
    stub.extend_from_slice(&[0xFF, 0xD0]);
    // mov rcx, result+8; mov [rcx], eax
    stub.extend_from_slice(&[0x48, 0xB9]);
    stub.extend_from_slice(&((result + 8) as u64).to_le_bytes());
    stub.extend_from_slice(&[0x89, 0x01]);
    // add rsp, 0x28; xor eax, eax; ret
    stub.extend_from_slice(&[0x48, 0x83, 0xC4, 0x28]);
    stub.extend_from_slice(&[0x31, 0xC0, 0xC3]);

    stub
}

/// 32-bit form of the call stub
fn build_call_stub_x86(function: usize, get_last_error: usize, result: usize) -> Vec<u8> {
    let mut stub = Vec::with_capacity(40);

    // mov eax, function; call eax
    stub.push(0xB8);
    stub.extend_from_slice(&(function as u32).to_le_bytes());
    stub.extend_from_slice(&[0xFF, 0xD0]);
    // mov [result], eax; mov dword [result+4], 0 (zero-extend to u64 slot)
    stub.push(0xA3);
    stub.extend_from_slice(&(result as u32).to_le_bytes());
    stub.extend_from_slice(&[0xC7, 0x05]);
    stub.extend_from_slice(&((result + 4) as u32).to_le_bytes());
    stub.extend_from_slice(&0u32.to_le_bytes());
    // mov eax, GetLastError; call eax
    stub.push(0xB8);
    stub.extend_from_slice(&(get_last_error as u32).to_le_bytes());
    stub.extend_from_slice(&[0xFF, 0xD0]);
    // mov [result+8], eax
    stub.push(0xA3);
    stub.extend_from_slice(&((result + 8) as u32).to_le_bytes());
    // xor eax, eax; ret
    stub.extend_from_slice(&[0x31, 0xC0, 0xC3]);

    stub
}

#[link(name = "kernel32")]
extern "system" {
    fn CreateRemoteThread(
        hProcess: usize,
        lpThreadAttributes: *const core::ffi::c_void,
        dwStackSize: usize,
        lpStartAddress: usize,
        lpParameter: usize,
        dwCreationFlags: u32,
        lpThreadId: *mut u32,
    ) -> usize;
    fn WaitForSingleObject(hHandle: usize, dwMilliseconds: u32) -> u32;
    fn GetExitCodeThread(hThread: usize, lpExitCode: *mut u32) -> i32;
    fn CloseHandle(hObject: usize) -> i32;
    fn GetModuleHandleA(lpModuleName: *const u8) -> usize;
    fn GetProcAddress(hModule: usize, lpProcName: *const u8) -> usize;
    fn SearchPathW(
        lpPath: *const u16,
        lpFileName: *const u16,
        lpExtension: *const u16,
        nBufferLength: u32,
        lpBuffer: *mut u16,
        lpFilePart: *mut *mut u16,
    ) -> u32;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessAccess;

    fn open_self() -> Process {
        Process::open(std::process::id(), ProcessAccess::all()).expect("open self")
    }

    #[test]
    fn test_self_inject_and_free() {
        let proc = open_self();
        let injector = Injector::new(&proc).with_timeout(30_000);

        // already loaded, so LoadLibraryW bumps the refcount and returns
        // the existing base
        let base = injector
            .inject("kernel32.dll", PathResolution::AsIs)
            .expect("inject");
        let k32 = find_module(&proc, "kernel32.dll").expect("kernel32");
        assert_eq!(base, k32.base);

        injector.free_dll(base).expect("free");
    }

    #[test]
    fn test_search_path_resolution() {
        let resolved = search_path("kernel32.dll").expect("resolve");
        assert!(resolved.to_lowercase().ends_with("kernel32.dll"));
        assert!(resolved.contains('\\'), "expanded to a full path: {resolved}");
    }

    #[test]
    fn test_call_export_returns_target_pid() {
        let proc = open_self();
        let injector = Injector::new(&proc).with_timeout(30_000);
        let k32 = find_module(&proc, "kernel32.dll").expect("kernel32");

        let result = injector
            .call_export(k32.base, "GetCurrentProcessId")
            .expect("call");
        assert_eq!(result.return_value as u32, proc.pid());
    }

    #[test]
    fn test_resolve_export_follows_forwarders() {
        let proc = open_self();
        let k32 = find_module(&proc, "kernel32.dll").expect("kernel32");

        // plain export
        let direct = resolve_export(&proc, k32.base, "GetCurrentProcessId").expect("resolve");
        assert!(direct != 0);

        // a known kernel32 forwarder into ntdll
        let forwarded = resolve_export(&proc, k32.base, "HeapAlloc").expect("resolve");
        assert!(forwarded != 0);
        let ntdll = find_module(&proc, "ntdll.dll").expect("ntdll");
        let in_ntdll = forwarded >= ntdll.base && forwarded < ntdll.base + ntdll.size;
        let in_k32 = forwarded >= k32.base && forwarded < k32.base + k32.size;
        assert!(in_ntdll || in_k32, "resolved somewhere sensible");
    }

    #[test]
    fn test_missing_export_escalates() {
        let proc = open_self();
        let k32 = find_module(&proc, "kernel32.dll").expect("kernel32");
        let err = resolve_export(&proc, k32.base, "UmbraNotARealExport").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }
}
