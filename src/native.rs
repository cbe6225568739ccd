//! Native strategy: the legacy image is mapped in this process, hooks are
//! patched straight into it and legacy functions are called directly.

use std::io;

use parking_lot::{Mutex, const_mutex};

use crate::backend::{Backend, HookFn, SharedState};
use crate::error::Error;
use crate::exec_mem::{self, ExecutableRegion};
use crate::memory::{MemoryAccess, ProcessMemory};
use crate::registers::RegisterFrame;
use crate::trampoline;

pub struct NativeBackend {
    memory: ProcessMemory,
    toggle_code_protection: bool,
    regions: Mutex<Vec<ExecutableRegion>>,
}

impl NativeBackend {
    pub const fn new(toggle_code_protection: bool) -> NativeBackend {
        NativeBackend {
            memory: ProcessMemory,
            toggle_code_protection,
            regions: const_mutex(Vec::new()),
        }
    }

    fn in_own_region(&self, address: usize, len: usize) -> bool {
        self.regions.lock().iter().any(|x| x.contains(address, len))
    }
}

fn to_u32(address: usize) -> Result<u32, Error> {
    u32::try_from(address).map_err(|_| Error::AddressRange(address))
}

impl MemoryAccess for NativeBackend {
    fn read(&self, address: usize, out: &mut [u8]) -> io::Result<()> {
        self.memory.read(address, out)
    }

    fn write(&self, address: usize, data: &[u8]) -> io::Result<()> {
        self.memory.write(address, data)
    }
}

impl Backend for NativeBackend {
    fn name(&self) -> &'static str {
        "native"
    }

    fn write_code(&self, address: usize, data: &[u8]) -> io::Result<()> {
        if !self.toggle_code_protection || self.in_own_region(address, data.len()) {
            return self.memory.write(address, data);
        }
        unsafe {
            exec_mem::with_writable_code(address, data.len(), || {
                self.memory.write(address, data)
            })?
        }
    }

    fn reserve_executable(&self, size: usize) -> io::Result<usize> {
        let region = ExecutableRegion::reserve(size)?;
        let base = region.base();
        self.regions.lock().push(region);
        Ok(base)
    }

    fn hook_entry(
        &self,
        _index: usize,
        entry: usize,
        hook: HookFn,
        shared: &SharedState,
    ) -> Result<Vec<u8>, Error> {
        let code = trampoline::hook_entry(
            to_u32(entry)?,
            to_u32(shared.frame_ptr() as usize)?,
            to_u32(shared.last_hook_return_ptr() as usize)?,
            to_u32(hook as usize)?,
        );
        Ok(code.into_bytes())
    }

    fn hook_redirect(&self, at: usize, _index: usize, entry: usize) -> Result<Vec<u8>, Error> {
        Ok(trampoline::redirect(to_u32(at)?, to_u32(entry)?))
    }

    fn call_foreign(&self, address: usize, regs: &mut RegisterFrame, _shared: &SharedState) -> u8 {
        unsafe { call_native(address, regs) }
    }
}

/// Calls `address` with every register loaded from `regs`, and stores them
/// back right after it returns. Returns `ah` of `lahf` at that point.
///
/// ebx/esi/edi/ebp of the caller survive even if the legacy code doesn't
/// preserve them.
#[cfg(target_arch = "x86")]
pub unsafe fn call_native(address: usize, regs: &mut RegisterFrame) -> u8 {
    let flags: u32;
    std::arch::asm!(
        "push ebp",
        "push ebx",
        "push esi",
        "push edi",
        "push eax",
        "push ecx",
        "mov ebx, [eax + 0x4]",
        "mov ecx, [eax + 0x8]",
        "mov edx, [eax + 0xc]",
        "mov esi, [eax + 0x10]",
        "mov edi, [eax + 0x14]",
        "mov ebp, [eax + 0x18]",
        "mov eax, [eax]",
        "call dword ptr [esp]",
        // [esp] = address, [esp + 4] = regs
        "push eax",
        "mov eax, [esp + 0x8]",
        "mov [eax + 0x4], ebx",
        "mov [eax + 0x8], ecx",
        "mov [eax + 0xc], edx",
        "mov [eax + 0x10], esi",
        "mov [eax + 0x14], edi",
        "mov [eax + 0x18], ebp",
        "pop ebx",
        "mov [eax], ebx",
        // Nothing above touched flags
        "lahf",
        "movzx eax, ah",
        "add esp, 0x8",
        "pop edi",
        "pop esi",
        "pop ebx",
        "pop ebp",
        inout("eax") regs as *mut RegisterFrame => flags,
        inout("ecx") address => _,
        clobber_abi("C"),
    );
    flags as u8
}

#[cfg(not(target_arch = "x86"))]
pub unsafe fn call_native(address: usize, _regs: &mut RegisterFrame) -> u8 {
    crate::fatal(&format!(
        "Cannot call legacy function {:x} natively, this isn't a 32-bit x86 process",
        address,
    ));
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn writes_to_own_region() {
        let backend = NativeBackend::new(true);
        let base = backend.reserve_executable(0x100).unwrap();
        assert!(backend.in_own_region(base + 0x10, 6));
        backend.write_code(base + 0x10, &[0xe9, 1, 2, 3, 4, 0xc3]).unwrap();
        let mut out = [0u8; 6];
        backend.read(base + 0x10, &mut out).unwrap();
        assert_eq!(out, [0xe9, 1, 2, 3, 4, 0xc3]);
    }

    #[cfg(unix)]
    #[test]
    fn write_code_toggles_protection() {
        unsafe {
            let size = exec_mem::page_size();
            let page = libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            assert_ne!(page, libc::MAP_FAILED);
            let backend = NativeBackend::new(true);
            let addr = page as usize + 0x20;
            backend.write_code(addr, &[0xc3]).unwrap();
            assert_eq!(*(addr as *const u8), 0xc3);
            libc::munmap(page, size);
        }
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn hook_code_needs_32bit_addresses() {
        let backend = NativeBackend::new(false);
        match backend.hook_redirect(0x1_0000_0000, 0, 0x1000) {
            Err(Error::AddressRange(0x1_0000_0000)) => (),
            x => panic!("Unexpected {:?}", x),
        }
    }
}
