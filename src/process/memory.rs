//! Remote memory accessor
//!
//! Typed reads and writes against a target process. Every transfer is
//! all-or-nothing: a short ReadProcessMemory/WriteProcessMemory is reported
//! as the same error as an outright failure, carrying the OS error code.
//! Nothing here retries.
//!
//! Plain data writes are a single call; callers patching executable memory
//! compose the protection guard, the write and the instruction-cache flush
//! explicitly (see the patch module) rather than having `write` do it
//! implicitly.

use std::path::Path;

use crate::error::{Result, UmbraError};
use crate::process::Process;

/// page protection flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Protection(pub u32);

impl Protection {
    pub const NOACCESS: Self = Self(PAGE_NOACCESS);
    pub const READONLY: Self = Self(PAGE_READONLY);
    pub const READWRITE: Self = Self(PAGE_READWRITE);
    pub const WRITECOPY: Self = Self(PAGE_WRITECOPY);
    pub const EXECUTE: Self = Self(PAGE_EXECUTE);
    pub const EXECUTE_READ: Self = Self(PAGE_EXECUTE_READ);
    pub const EXECUTE_READWRITE: Self = Self(PAGE_EXECUTE_READWRITE);
    pub const EXECUTE_WRITECOPY: Self = Self(PAGE_EXECUTE_WRITECOPY);

    pub fn is_readable(&self) -> bool {
        matches!(
            self.0 & 0xFF,
            PAGE_READONLY
                | PAGE_READWRITE
                | PAGE_WRITECOPY
                | PAGE_EXECUTE_READ
                | PAGE_EXECUTE_READWRITE
                | PAGE_EXECUTE_WRITECOPY
        )
    }

    pub fn is_writable(&self) -> bool {
        matches!(
            self.0 & 0xFF,
            PAGE_READWRITE | PAGE_WRITECOPY | PAGE_EXECUTE_READWRITE | PAGE_EXECUTE_WRITECOPY
        )
    }

    pub fn is_executable(&self) -> bool {
        matches!(
            self.0 & 0xFF,
            PAGE_EXECUTE | PAGE_EXECUTE_READ | PAGE_EXECUTE_READWRITE | PAGE_EXECUTE_WRITECOPY
        )
    }

    pub fn is_guard(&self) -> bool {
        self.0 & PAGE_GUARD != 0
    }
}

impl From<u32> for Protection {
    fn from(val: u32) -> Self {
        Self(val)
    }
}

/// memory region state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionState {
    Commit,
    Reserve,
    Free,
}

/// one virtual memory region as reported by VirtualQueryEx
#[derive(Debug, Clone)]
pub struct RegionInfo {
    pub base: usize,
    pub allocation_base: usize,
    pub allocation_protect: Protection,
    pub size: usize,
    pub state: RegionState,
    pub protect: Protection,
}

impl RegionInfo {
    pub fn is_committed(&self) -> bool {
        self.state == RegionState::Commit
    }
}

// chunk size for incremental string reads; small enough that probing past the
// end of a mapping fails quickly, large enough to not crawl
const STRING_CHUNK: usize = 256;

/// cap on null-terminated string reads; beyond this the pointer is considered
/// corrupt rather than pointing at a very long string
const MAX_STRING_BYTES: usize = 0x10000;

impl Process {
    /// read exactly `buf.len()` bytes at `address`
    pub fn read_bytes(&self, address: usize, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }

        let mut transferred: usize = 0;
        // SAFETY: buf is valid for buf.len() writable bytes
        let ok = unsafe {
            ReadProcessMemory(
                self.handle(),
                address,
                buf.as_mut_ptr(),
                buf.len(),
                &mut transferred,
            )
        };

        if ok == 0 || transferred != buf.len() {
            return Err(UmbraError::ReadFailed {
                address,
                size: buf.len(),
                code: UmbraError::last_os_error(),
            });
        }
        Ok(())
    }

    /// write exactly `buf.len()` bytes at `address`
    pub fn write_bytes(&self, address: usize, buf: &[u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }

        let mut transferred: usize = 0;
        // SAFETY: buf is valid for buf.len() readable bytes
        let ok = unsafe {
            WriteProcessMemory(
                self.handle(),
                address,
                buf.as_ptr(),
                buf.len(),
                &mut transferred,
            )
        };

        if ok == 0 || transferred != buf.len() {
            return Err(UmbraError::WriteFailed {
                address,
                size: buf.len(),
                code: UmbraError::last_os_error(),
            });
        }
        Ok(())
    }

    /// read a typed value
    pub fn read<T: Copy>(&self, address: usize) -> Result<T> {
        let mut buf = vec![0u8; core::mem::size_of::<T>()];
        self.read_bytes(address, &mut buf)?;
        // SAFETY: buf holds size_of::<T>() initialized bytes; T is Copy plain data
        Ok(unsafe { (buf.as_ptr() as *const T).read_unaligned() })
    }

    /// write a typed value
    pub fn write<T: Copy>(&self, address: usize, value: &T) -> Result<()> {
        // SAFETY: value is valid for size_of::<T>() readable bytes
        let bytes = unsafe {
            core::slice::from_raw_parts(value as *const T as *const u8, core::mem::size_of::<T>())
        };
        self.write_bytes(address, bytes)
    }

    /// read `count` consecutive values in a single bulk transfer
    pub fn read_vec<T: Copy>(&self, address: usize, count: usize) -> Result<Vec<T>> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let mut out: Vec<T> = Vec::with_capacity(count);
        let byte_len = count * core::mem::size_of::<T>();
        // SAFETY: the spare capacity covers byte_len bytes
        let bytes = unsafe {
            core::slice::from_raw_parts_mut(out.as_mut_ptr() as *mut u8, byte_len)
        };
        self.read_bytes(address, bytes)?;
        // SAFETY: read_bytes filled all count elements
        unsafe { out.set_len(count) };
        Ok(out)
    }

    /// write a slice of values in a single bulk transfer
    pub fn write_slice<T: Copy>(&self, address: usize, values: &[T]) -> Result<()> {
        // SAFETY: values covers len * size_of::<T>() readable bytes
        let bytes = unsafe {
            core::slice::from_raw_parts(
                values.as_ptr() as *const u8,
                values.len() * core::mem::size_of::<T>(),
            )
        };
        self.write_bytes(address, bytes)
    }

    /// read a NUL-terminated narrow string
    ///
    /// reads in bounded chunks until the terminator; exceeding the cap means
    /// the pointer was corrupt and is an error, not a truncated result.
    pub fn read_string(&self, address: usize) -> Result<String> {
        let mut out: Vec<u8> = Vec::new();
        let mut cursor = address;

        while out.len() < MAX_STRING_BYTES {
            let mut chunk = [0u8; STRING_CHUNK];
            self.read_bytes(cursor, &mut chunk)?;

            if let Some(pos) = chunk.iter().position(|&b| b == 0) {
                out.extend_from_slice(&chunk[..pos]);
                return Ok(String::from_utf8_lossy(&out).into_owned());
            }

            out.extend_from_slice(&chunk);
            cursor += STRING_CHUNK;
        }

        Err(UmbraError::UnterminatedString {
            address,
            cap: MAX_STRING_BYTES,
        })
    }

    /// read a NUL-terminated wide string
    pub fn read_wstring(&self, address: usize) -> Result<String> {
        let mut out: Vec<u16> = Vec::new();
        let mut cursor = address;

        while out.len() * 2 < MAX_STRING_BYTES {
            let chunk: Vec<u16> = self.read_vec(cursor, STRING_CHUNK / 2)?;

            if let Some(pos) = chunk.iter().position(|&c| c == 0) {
                out.extend_from_slice(&chunk[..pos]);
                return Ok(String::from_utf16_lossy(&out));
            }

            out.extend_from_slice(&chunk);
            cursor += STRING_CHUNK;
        }

        Err(UmbraError::UnterminatedString {
            address,
            cap: MAX_STRING_BYTES,
        })
    }

    /// write a narrow string including its terminator
    pub fn write_string(&self, address: usize, value: &str) -> Result<()> {
        let mut bytes = value.as_bytes().to_vec();
        bytes.push(0);
        self.write_bytes(address, &bytes)
    }

    /// write a wide string including its terminator
    pub fn write_wstring(&self, address: usize, value: &str) -> Result<()> {
        let wide: Vec<u16> = value.encode_utf16().chain(core::iter::once(0)).collect();
        self.write_slice(address, &wide)
    }

    /// follow a pointer chain: [[base + offsets[0]] + offsets[1]] + ...
    ///
    /// the final offset is applied without a dereference; the value at the
    /// resulting address is returned.
    pub fn read_ptr_chain<T: Copy>(&self, base: usize, offsets: &[usize]) -> Result<T> {
        let mut addr = base;
        for (i, &offset) in offsets.iter().enumerate() {
            addr = addr.wrapping_add(offset);
            if i < offsets.len() - 1 {
                addr = self.read::<usize>(addr)?;
            }
        }
        self.read::<T>(addr)
    }

    /// allocate committed memory in the target
    pub fn alloc(&self, size: usize, protection: Protection) -> Result<RemoteAlloc> {
        // SAFETY: no caller-owned pointers
        let base = unsafe {
            VirtualAllocEx(
                self.handle(),
                core::ptr::null_mut(),
                size,
                MEM_COMMIT | MEM_RESERVE,
                protection.0,
            )
        };

        if base.is_null() {
            return Err(UmbraError::AllocationFailed {
                size,
                protection: protection.0,
                code: UmbraError::last_os_error(),
            });
        }

        Ok(RemoteAlloc {
            process: self.clone(),
            base: base as usize,
            size,
            owns: true,
        })
    }

    /// allocate committed memory at or near a preferred base
    ///
    /// returns None when the hint address is unavailable, so callers can
    /// probe a range; errors other than address conflicts still come back
    /// as None since the probe loop treats them the same way.
    pub fn alloc_at(&self, hint: usize, size: usize, protection: Protection) -> Option<RemoteAlloc> {
        // SAFETY: hint is only a preference; failure is handled
        let base = unsafe {
            VirtualAllocEx(
                self.handle(),
                hint as *mut core::ffi::c_void,
                size,
                MEM_COMMIT | MEM_RESERVE,
                protection.0,
            )
        };

        if base.is_null() {
            return None;
        }

        Some(RemoteAlloc {
            process: self.clone(),
            base: base as usize,
            size,
            owns: true,
        })
    }

    /// free memory previously allocated in the target
    pub fn free(&self, address: usize) -> Result<()> {
        // SAFETY: address came from VirtualAllocEx on the same process
        let ok = unsafe { VirtualFreeEx(self.handle(), address as *mut _, 0, MEM_RELEASE) };
        if ok == 0 {
            return Err(UmbraError::from_last_error("VirtualFreeEx"));
        }
        Ok(())
    }

    /// query the region containing `address`
    pub fn query(&self, address: usize) -> Result<RegionInfo> {
        let mut mbi = MemoryBasicInformation::default();
        // SAFETY: mbi is a properly sized out-buffer
        let len = unsafe {
            VirtualQueryEx(
                self.handle(),
                address,
                &mut mbi,
                core::mem::size_of::<MemoryBasicInformation>(),
            )
        };

        if len == 0 {
            return Err(UmbraError::from_last_error("VirtualQueryEx"));
        }

        let state = match mbi.state {
            MEM_COMMIT => RegionState::Commit,
            MEM_RESERVE_STATE => RegionState::Reserve,
            _ => RegionState::Free,
        };

        Ok(RegionInfo {
            base: mbi.base_address,
            allocation_base: mbi.allocation_base,
            allocation_protect: Protection(mbi.allocation_protect),
            size: mbi.region_size,
            state,
            protect: Protection(mbi.protect),
        })
    }

    /// whether the page at `address` is committed and readable
    pub fn can_read(&self, address: usize) -> Result<bool> {
        let region = self.query(address)?;
        Ok(region.is_committed() && region.protect.is_readable() && !region.protect.is_guard())
    }

    /// whether the page at `address` is committed and writable
    pub fn can_write(&self, address: usize) -> Result<bool> {
        let region = self.query(address)?;
        Ok(region.is_committed() && region.protect.is_writable() && !region.protect.is_guard())
    }

    /// whether the page at `address` is committed and executable
    pub fn can_execute(&self, address: usize) -> Result<bool> {
        let region = self.query(address)?;
        Ok(region.is_committed() && region.protect.is_executable() && !region.protect.is_guard())
    }

    /// whether the page at `address` carries the guard attribute
    pub fn is_guard_page(&self, address: usize) -> Result<bool> {
        Ok(self.query(address)?.protect.is_guard())
    }

    /// change protection, returning the previous protection
    pub fn protect(&self, address: usize, size: usize, protection: Protection) -> Result<Protection> {
        let mut old: u32 = 0;
        // SAFETY: old points to stack storage
        let ok = unsafe {
            VirtualProtectEx(self.handle(), address as *mut _, size, protection.0, &mut old)
        };
        if ok == 0 {
            return Err(UmbraError::ProtectionChangeFailed {
                address,
                size,
                code: UmbraError::last_os_error(),
            });
        }
        Ok(Protection(old))
    }

    /// change protection with a guard that restores the old protection on drop
    pub fn protect_guard(
        &self,
        address: usize,
        size: usize,
        protection: Protection,
    ) -> Result<RemoteProtectGuard> {
        let old = self.protect(address, size, protection)?;
        Ok(RemoteProtectGuard {
            process: self.clone(),
            address,
            size,
            old,
        })
    }

    /// flush the instruction cache for a range of the target
    pub fn flush_instruction_cache(&self, address: usize, size: usize) -> Result<()> {
        // SAFETY: the range is only advisory to the cache flush
        let ok = unsafe { FlushInstructionCache(self.handle(), address as *const _, size) };
        if ok == 0 {
            return Err(UmbraError::from_last_error("FlushInstructionCache"));
        }
        Ok(())
    }

    /// dump a raw byte range of the target to a file
    pub fn dump_region(&self, address: usize, size: usize, path: &Path) -> Result<()> {
        let mut buf = vec![0u8; size];
        self.read_bytes(address, &mut buf)?;
        std::fs::write(path, &buf).map_err(|e| UmbraError::Win32Error {
            api: "WriteFile",
            code: e.raw_os_error().unwrap_or(0) as u32,
        })
    }
}

/// RAII remote allocation; freed on drop unless leaked
pub struct RemoteAlloc {
    process: Process,
    base: usize,
    size: usize,
    owns: bool,
}

impl RemoteAlloc {
    pub fn base(&self) -> usize {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// give up ownership; the remote memory stays allocated
    pub fn leak(mut self) -> usize {
        self.owns = false;
        self.base
    }
}

impl Drop for RemoteAlloc {
    fn drop(&mut self) {
        if self.owns && self.base != 0 {
            if let Err(err) = self.process.free(self.base) {
                debug_assert!(false, "failed to free remote allocation: {err}");
                tracing::warn!(base = format_args!("{:#x}", self.base), %err, "leaking remote allocation");
            }
        }
    }
}

/// RAII guard restoring a previous page protection on drop
pub struct RemoteProtectGuard {
    process: Process,
    address: usize,
    size: usize,
    old: Protection,
}

impl RemoteProtectGuard {
    pub fn old_protection(&self) -> Protection {
        self.old
    }
}

impl Drop for RemoteProtectGuard {
    fn drop(&mut self) {
        if let Err(err) = self.process.protect(self.address, self.size, self.old) {
            debug_assert!(false, "failed to restore protection: {err}");
            tracing::warn!(address = format_args!("{:#x}", self.address), %err, "protection not restored");
        }
    }
}

// protection constants
const PAGE_NOACCESS: u32 = 0x01;
const PAGE_READONLY: u32 = 0x02;
const PAGE_READWRITE: u32 = 0x04;
const PAGE_WRITECOPY: u32 = 0x08;
const PAGE_EXECUTE: u32 = 0x10;
const PAGE_EXECUTE_READ: u32 = 0x20;
const PAGE_EXECUTE_READWRITE: u32 = 0x40;
const PAGE_EXECUTE_WRITECOPY: u32 = 0x80;
const PAGE_GUARD: u32 = 0x100;

// allocation constants
const MEM_COMMIT: u32 = 0x1000;
const MEM_RESERVE: u32 = 0x2000;
const MEM_RELEASE: u32 = 0x8000;
const MEM_RESERVE_STATE: u32 = 0x2000;

#[repr(C)]
#[derive(Default)]
struct MemoryBasicInformation {
    base_address: usize,
    allocation_base: usize,
    allocation_protect: u32,
    #[cfg(target_arch = "x86_64")]
    partition_id: u16,
    region_size: usize,
    state: u32,
    protect: u32,
    memory_type: u32,
}

#[link(name = "kernel32")]
extern "system" {
    fn ReadProcessMemory(
        hProcess: usize,
        lpBaseAddress: usize,
        lpBuffer: *mut u8,
        nSize: usize,
        lpNumberOfBytesRead: *mut usize,
    ) -> i32;

    fn WriteProcessMemory(
        hProcess: usize,
        lpBaseAddress: usize,
        lpBuffer: *const u8,
        nSize: usize,
        lpNumberOfBytesWritten: *mut usize,
    ) -> i32;

    fn VirtualAllocEx(
        hProcess: usize,
        lpAddress: *mut core::ffi::c_void,
        dwSize: usize,
        flAllocationType: u32,
        flProtect: u32,
    ) -> *mut core::ffi::c_void;

    fn VirtualFreeEx(
        hProcess: usize,
        lpAddress: *mut core::ffi::c_void,
        dwSize: usize,
        dwFreeType: u32,
    ) -> i32;

    fn VirtualProtectEx(
        hProcess: usize,
        lpAddress: *mut core::ffi::c_void,
        dwSize: usize,
        flNewProtect: u32,
        lpflOldProtect: *mut u32,
    ) -> i32;

    fn VirtualQueryEx(
        hProcess: usize,
        lpAddress: usize,
        lpBuffer: *mut MemoryBasicInformation,
        dwLength: usize,
    ) -> usize;

    fn FlushInstructionCache(hProcess: usize, lpBaseAddress: *const core::ffi::c_void, dwSize: usize) -> i32;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessAccess;

    fn open_self() -> Process {
        Process::open(std::process::id(), ProcessAccess::read_write()).expect("open self")
    }

    #[test]
    fn test_alloc_write_read_roundtrip() {
        let proc = open_self();
        let alloc = proc.alloc(4096, Protection::READWRITE).expect("alloc");

        let data = [1u8, 2, 3, 4, 5];
        proc.write_bytes(alloc.base(), &data).expect("write");

        let mut back = [0u8; 5];
        proc.read_bytes(alloc.base(), &mut back).expect("read");
        assert_eq!(back, data);
    }

    #[test]
    fn test_typed_roundtrip() {
        let proc = open_self();
        let alloc = proc.alloc(64, Protection::READWRITE).expect("alloc");

        let value: u64 = 0xDEAD_BEEF_CAFE_F00D;
        proc.write(alloc.base(), &value).expect("write");
        let back: u64 = proc.read(alloc.base()).expect("read");
        assert_eq!(back, value);

        // unaligned
        proc.write(alloc.base() + 3, &value).expect("write unaligned");
        let back: u64 = proc.read(alloc.base() + 3).expect("read unaligned");
        assert_eq!(back, value);
    }

    #[test]
    fn test_vector_roundtrip() {
        let proc = open_self();
        let alloc = proc.alloc(4096, Protection::READWRITE).expect("alloc");

        let values: Vec<u32> = (0..128).collect();
        proc.write_slice(alloc.base(), &values).expect("write");
        let back: Vec<u32> = proc.read_vec(alloc.base(), 128).expect("read");
        assert_eq!(back, values);
    }

    #[test]
    fn test_string_roundtrip() {
        let proc = open_self();
        let alloc = proc.alloc(4096, Protection::READWRITE).expect("alloc");

        proc.write_string(alloc.base(), "hello world").expect("write");
        assert_eq!(proc.read_string(alloc.base()).expect("read"), "hello world");

        proc.write_wstring(alloc.base() + 0x100, "wide text").expect("write wide");
        assert_eq!(proc.read_wstring(alloc.base() + 0x100).expect("read wide"), "wide text");
    }

    #[test]
    fn test_read_unmapped_fails() {
        let proc = open_self();
        let mut buf = [0u8; 16];
        let err = proc.read_bytes(0x10, &mut buf).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::OsCall);
    }

    #[test]
    fn test_protection_queries() {
        let proc = open_self();
        let alloc = proc.alloc(4096, Protection::READWRITE).expect("alloc");

        assert!(proc.can_read(alloc.base()).expect("query"));
        assert!(proc.can_write(alloc.base()).expect("query"));
        assert!(!proc.can_execute(alloc.base()).expect("query"));
        assert!(!proc.is_guard_page(alloc.base()).expect("query"));

        proc.protect(alloc.base(), 4096, Protection::EXECUTE_READ).expect("protect");
        assert!(proc.can_execute(alloc.base()).expect("query"));
        assert!(!proc.can_write(alloc.base()).expect("query"));
    }

    #[test]
    fn test_protect_guard_restores() {
        let proc = open_self();
        let alloc = proc.alloc(4096, Protection::READONLY).expect("alloc");

        {
            let guard = proc
                .protect_guard(alloc.base(), 4096, Protection::READWRITE)
                .expect("guard");
            assert_eq!(guard.old_protection(), Protection::READONLY);
            assert!(proc.can_write(alloc.base()).expect("query"));
        }

        assert!(!proc.can_write(alloc.base()).expect("query"));
    }

    #[test]
    fn test_ptr_chain() {
        let proc = open_self();
        let alloc = proc.alloc(256, Protection::READWRITE).expect("alloc");
        let base = alloc.base();

        let target = base + 0x20;
        proc.write(base + 0x10, &target).expect("write ptr");
        proc.write(base + 0x20, &0xDEADBEEFu32).expect("write value");

        let value: u32 = proc.read_ptr_chain(base, &[0x10, 0x0]).expect("chain");
        assert_eq!(value, 0xDEADBEEF);
    }

    #[test]
    fn test_dump_region() {
        let proc = open_self();
        let alloc = proc.alloc(64, Protection::READWRITE).expect("alloc");
        let data: Vec<u8> = (0..64).collect();
        proc.write_bytes(alloc.base(), &data).expect("write");

        let path = std::env::temp_dir().join(format!("umbra-dump-{}.bin", std::process::id()));
        proc.dump_region(alloc.base(), 64, &path).expect("dump");
        let back = std::fs::read(&path).expect("read dump");
        let _ = std::fs::remove_file(&path);
        assert_eq!(back, data);
    }
}
