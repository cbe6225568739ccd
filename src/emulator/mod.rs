//! Emulated strategy: the legacy image lives in guest memory and runs in an
//! interpreter. Hooks are `push index; int 0x2e; ret` traps dispatched from
//! here instead of patched jumps.

mod cpu;
mod memory;

use std::io;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::backend::{Backend, HookFn, SharedState};
use crate::error::Error;
use crate::memory::MemoryAccess;
use crate::registers::RegisterFrame;
use crate::trampoline::{self, TRAP_VECTOR};

pub use self::cpu::{Cpu, Event, Fault};
pub use self::memory::GuestMemory;

/// Return address pushed for every call into guest code; returning to it
/// ends the call. Never mapped.
pub const SENTINEL_RETURN: u32 = 0xfffe_0000;
pub const STACK_BASE: u32 = 0x0f00_0000;
pub const STACK_SIZE: u32 = 0x0010_0000;
/// Executable memory handed out by `reserve_executable` starts here.
pub const EXEC_HEAP_BASE: u32 = 0x7000_0000;
const EXEC_HEAP_END: u32 = 0x7800_0000;
const EXEC_HEAP_ALIGN: u32 = 0x1000;

pub struct EmulatedBackend {
    memory: Mutex<GuestMemory>,
    hooks: Mutex<Vec<Option<HookFn>>>,
    exec_heap_next: Mutex<u32>,
    /// esp the next call into guest code starts from. Lowered while a hook
    /// runs so that nested calls don't clobber the interrupted stack.
    stack_top: AtomicU32,
}

fn guest_address(address: usize) -> io::Result<u32> {
    u32::try_from(address).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{:x} is outside the 32-bit guest address space", address),
        )
    })
}

/// Puts the outer stack top back even if a hook panics.
struct StackScope<'a> {
    stack_top: &'a AtomicU32,
    previous: u32,
}

impl<'a> Drop for StackScope<'a> {
    fn drop(&mut self) {
        self.stack_top.store(self.previous, Ordering::Relaxed);
    }
}

impl EmulatedBackend {
    /// Backend with only the stack mapped.
    pub fn new() -> EmulatedBackend {
        let mut memory = GuestMemory::new();
        if let Err(e) = memory.map(STACK_BASE, STACK_SIZE) {
            crate::fatal(&format!("Couldn't map emulator stack: {}", e));
        }
        EmulatedBackend {
            memory: Mutex::new(memory),
            hooks: Mutex::new(Vec::new()),
            exec_heap_next: Mutex::new(EXEC_HEAP_BASE),
            stack_top: AtomicU32::new(STACK_BASE + STACK_SIZE),
        }
    }

    /// Copies the legacy image (or any other code/data) to `base`.
    pub fn load_image(&self, base: u32, image: &[u8]) -> io::Result<()> {
        debug!("Loading {:x} bytes of guest image at {:08x}", image.len(), base);
        self.memory.lock().load_image(base, image)
    }

    /// Zero-filled memory at `base`, e.g. for the legacy data segment.
    pub fn map_region(&self, base: u32, size: u32) -> io::Result<()> {
        debug!("Mapping guest region {:08x}+{:x}", base, size);
        self.memory.lock().map(base, size)
    }

    pub fn is_mapped(&self, address: u32, len: usize) -> bool {
        self.memory.lock().is_mapped(address, len)
    }

    fn run(&self, cpu: &mut Cpu, shared: &SharedState) {
        while cpu.eip != SENTINEL_RETURN {
            let event = {
                let mut memory = self.memory.lock();
                cpu.step(&mut memory)
            };
            match event {
                Ok(Event::Continue) => (),
                Ok(Event::Interrupt(TRAP_VECTOR)) => self.dispatch_trap(cpu, shared),
                Ok(Event::Interrupt(vector)) => {
                    crate::fatal(&format!(
                        "Guest raised interrupt {:x} at {:08x}",
                        vector, cpu.eip,
                    ));
                }
                Err(e) => {
                    crate::fatal(&format!("Emulator fault: {} ({:x?})", e, cpu.regs));
                }
            }
        }
    }

    /// Runs for `int 0x2e` of a trap sequence. Stack is [index, caller's return, ..],
    /// the `ret` after the interrupt returns to the caller.
    fn dispatch_trap(&self, cpu: &mut Cpu, shared: &SharedState) {
        let popped = {
            let memory = self.memory.lock();
            cpu.pop(&memory).and_then(|index| {
                let ret = memory.read_u32(cpu.esp())?;
                Ok((index, ret))
            })
        };
        let (index, ret) = match popped {
            Ok(o) => o,
            Err(e) => crate::fatal(&format!("Bad hook trap at {:08x}: {}", cpu.eip, e)),
        };
        let hook = self.hooks.lock().get(index as usize).copied().flatten();
        let hook = match hook {
            Some(s) => s,
            None => crate::fatal(&format!("Trap for unregistered hook {}", index)),
        };
        trace!("Hook trap {} from {:08x}", index, ret);
        shared.set_last_hook_return(ret);

        let _scope = StackScope {
            previous: self.stack_top.swap(cpu.esp(), Ordering::Relaxed),
            stack_top: &self.stack_top,
        };
        let frame = shared.frame_ptr();
        let result = unsafe {
            cpu.store_frame(&mut *frame);
            let result = hook(&mut *frame);
            cpu.load_frame(&*frame);
            result
        };
        cpu.sahf_byte(trampoline::hook_result_flags(result).bits());
    }
}

impl Default for EmulatedBackend {
    fn default() -> EmulatedBackend {
        EmulatedBackend::new()
    }
}

impl MemoryAccess for EmulatedBackend {
    fn read(&self, address: usize, out: &mut [u8]) -> io::Result<()> {
        self.memory.lock().read(guest_address(address)?, out)
    }

    fn write(&self, address: usize, data: &[u8]) -> io::Result<()> {
        self.memory.lock().write(guest_address(address)?, data)
    }
}

impl Backend for EmulatedBackend {
    fn name(&self) -> &'static str {
        "emulated"
    }

    fn write_code(&self, address: usize, data: &[u8]) -> io::Result<()> {
        self.write(address, data)
    }

    fn reserve_executable(&self, size: usize) -> io::Result<usize> {
        let size = u32::try_from(size)
            .ok()
            .and_then(|x| x.checked_add(EXEC_HEAP_ALIGN - 1))
            .map(|x| (x & !(EXEC_HEAP_ALIGN - 1)).max(EXEC_HEAP_ALIGN))
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "Reservation too large"))?;
        let mut next = self.exec_heap_next.lock();
        let base = *next;
        let end = base.checked_add(size).filter(|&x| x <= EXEC_HEAP_END).ok_or_else(|| {
            io::Error::new(io::ErrorKind::OutOfMemory, "Guest executable heap exhausted")
        })?;
        self.memory.lock().map(base, size)?;
        *next = end;
        debug!("Reserved guest executable memory {:08x}+{:x}", base, size);
        Ok(base as usize)
    }

    fn hook_entry(
        &self,
        index: usize,
        _entry: usize,
        hook: HookFn,
        _shared: &SharedState,
    ) -> Result<Vec<u8>, Error> {
        let mut hooks = self.hooks.lock();
        if hooks.len() <= index {
            hooks.resize(index + 1, None);
        }
        hooks[index] = Some(hook);
        // Traps dispatch straight from the interrupt handler
        Ok(Vec::new())
    }

    fn hook_redirect(&self, at: usize, index: usize, _entry: usize) -> Result<Vec<u8>, Error> {
        let at = u32::try_from(at).map_err(|_| Error::AddressRange(at))?;
        let index = u32::try_from(index).map_err(|_| Error::AddressRange(index))?;
        Ok(trampoline::trap(at, index))
    }

    fn call_foreign(&self, address: usize, regs: &mut RegisterFrame, shared: &SharedState) -> u8 {
        let eip = match u32::try_from(address) {
            Ok(o) => o,
            Err(_) => crate::fatal(&format!("Cannot call {:x} in 32-bit guest", address)),
        };
        let mut cpu = Cpu::new(eip, self.stack_top.load(Ordering::Relaxed));
        cpu.load_frame(regs);
        let pushed = cpu.push(&mut self.memory.lock(), SENTINEL_RETURN);
        if let Err(e) = pushed {
            crate::fatal(&format!("Emulator stack is unusable: {}", e));
        }
        self.run(&mut cpu, shared);
        cpu.store_frame(regs);
        cpu.lahf_byte()
    }
}
