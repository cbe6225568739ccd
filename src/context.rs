//! The process-wide interop state and the operations application code uses.

use parking_lot::Mutex;

use crate::alias::Relocation;
use crate::backend::{Backend, HookFn, SharedState};
use crate::config::InteropConfig;
use crate::emit::{CodeBuf, OPC_NOP, OPC_RET};
use crate::error::Error;
use crate::hook::{self, SlotTable, TableState};
use crate::registers::{FlagsByte, RegisterFrame};
use crate::snapshot::Snapshot;
use crate::trampoline;

/// Everything interop needs, grouped: relocation, the execution backend,
/// the staging frame and diagnostics, and the two tables.
///
/// Built once at startup and never torn down; generated code keeps pointing
/// into it.
pub struct InteropContext<B: Backend> {
    config: InteropConfig,
    relocation: Relocation,
    backend: B,
    shared: Box<SharedState>,
    hooks: Mutex<SlotTable>,
    jumps: Mutex<SlotTable>,
}

fn code_address(address: usize) -> Result<u32, Error> {
    u32::try_from(address).map_err(|_| Error::AddressRange(address))
}

impl<B: Backend> InteropContext<B> {
    /// Fixes the process relocation to `config.relocation_offset`, so every
    /// context in a process has to agree on it.
    pub fn new(backend: B, config: InteropConfig) -> Result<InteropContext<B>, Error> {
        let relocation = Relocation::fix_process(config.relocation_offset)?;
        let entry_size = config.hook_entry_size.max(trampoline::hook_entry_len());
        let slot_size = config.jump_slot_size.max(trampoline::TAGGED_JUMP_LEN);
        debug!(
            "Interop context using {} backend, relocation {:x}",
            backend.name(), relocation.offset(),
        );
        Ok(InteropContext {
            hooks: Mutex::new(SlotTable::new("hook", entry_size, config.max_hooks)),
            jumps: Mutex::new(SlotTable::new("jump", slot_size, config.max_jump_slots)),
            config,
            relocation,
            backend,
            shared: SharedState::new(),
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &InteropConfig {
        &self.config
    }

    pub fn relocation(&self) -> Relocation {
        self.relocation
    }

    pub fn shared(&self) -> &SharedState {
        &self.shared
    }

    #[inline]
    pub fn resolve(&self, address: u32) -> usize {
        self.relocation.apply(address)
    }

    /// Reserves both tables now instead of at the first install.
    pub fn reserve_tables(&self) {
        self.hooks.lock().ensure_allocated(&self.backend);
        self.jumps.lock().ensure_allocated(&self.backend);
    }

    /// Calls legacy function at `address` with every register set to the
    /// uninitialized sentinel.
    pub unsafe fn call(&self, address: u32) -> FlagsByte {
        let mut regs = RegisterFrame::new();
        self.call_with(address, &mut regs)
    }

    /// Calls legacy function at `address` with `regs`, leaving the registers
    /// it returned with in `regs`.
    pub unsafe fn call_with(&self, address: u32, regs: &mut RegisterFrame) -> FlagsByte {
        let target = self.resolve(address);
        let _in_flight = self.shared.enter_call(target);
        let raw = self.backend.call_foreign(target, regs, &self.shared);
        FlagsByte::from_raw(raw as u32)
    }

    /// Reads legacy memory. Failing means the image isn't where it should be,
    /// which is fatal.
    pub unsafe fn read_memory(&self, address: u32, out: &mut [u8]) {
        let resolved = self.resolve(address);
        if let Err(e) = self.backend.read(resolved, out) {
            crate::fatal(&format!(
                "Reading {:x} bytes of legacy memory at {:08x} failed: {}",
                out.len(), resolved, e,
            ));
        }
    }

    pub unsafe fn write_memory(&self, address: u32, data: &[u8]) {
        let resolved = self.resolve(address);
        if let Err(e) = self.backend.write(resolved, data) {
            crate::fatal(&format!(
                "Writing {:x} bytes of legacy memory at {:08x} failed: {}",
                data.len(), resolved, e,
            ));
        }
    }

    fn write_code(&self, address: usize, data: &[u8]) -> Result<(), Error> {
        hook::write_with_retry(&self.backend, address, data, self.config.write_attempts)
    }

    fn report<T>(&self, what: &str, address: usize, result: Result<T, Error>) -> Result<T, Error> {
        if let Err(ref e) = result {
            error!("Couldn't {} at {:08x}: {}", what, address, e);
        }
        result
    }

    /// Redirects legacy code reaching `address` to `hook`, which gets the
    /// registers and may change them. Its return value becomes the flags the
    /// caller sees.
    ///
    /// Failures are logged and leave `address` unpatched. The table entry
    /// stays used even if the patch failed.
    pub unsafe fn register_hook(&self, address: u32, hook: HookFn) -> Result<(), Error> {
        let at = self.resolve(address);
        let result = self.install_hook(at, hook);
        self.report("install hook", at, result)
    }

    fn install_hook(&self, at: usize, hook: HookFn) -> Result<(), Error> {
        let (index, entry) = self.hooks.lock().claim(&self.backend)?;
        let code = self.backend.hook_entry(index, entry, hook, &self.shared)?;
        if !code.is_empty() {
            // Entries live in memory the backend reserved as writable
            self.backend.write(entry, &code)?;
        }
        // Length only depends on the backend, not on the address
        let len = self.backend.hook_redirect(at, index, entry)?.len();
        let padding = trampoline::page_padding(at, len, self.config.page_size);
        let start = at + padding;
        if padding == 0 {
            let redirect = self.backend.hook_redirect(start, index, entry)?;
            self.write_code(start, &redirect)?;
        } else {
            debug!(
                "Hook at {:08x} would cross a page, padding {} bytes to {:08x}",
                at, padding, start,
            );
            self.write_padded_redirect(at, start, index, entry)?;
        }
        debug!("Hook {} at {:08x} -> entry {:x}", index, start, entry);
        Ok(())
    }

    /// Writes the redirect at `start` and only then nops `at..start`, so that
    /// `at` is left untouched unless both writes succeed.
    fn write_padded_redirect(
        &self,
        at: usize,
        start: usize,
        index: usize,
        entry: usize,
    ) -> Result<(), Error> {
        let redirect = self.backend.hook_redirect(start, index, entry)?;
        let mut original = vec![0u8; redirect.len()];
        self.backend.read(start, &mut original)?;
        self.write_code(start, &redirect)?;
        let result = self.write_code(at, &vec![OPC_NOP; start - at]);
        if result.is_err() {
            if let Err(e) = self.write_code(start, &original) {
                error!("Couldn't restore original code at {:08x}: {}", start, e);
            }
        }
        result
    }

    /// Makes the legacy function at `address` return immediately.
    pub unsafe fn write_return(&self, address: u32) -> Result<(), Error> {
        let at = self.resolve(address);
        let result = self.write_code(at, &[OPC_RET]);
        self.report("write return", at, result)
    }

    /// `jmp target` at `address`.
    pub unsafe fn write_jump(&self, address: u32, target: usize) -> Result<(), Error> {
        let at = self.resolve(address);
        let result = self.write_branch(at, target, CodeBuf::emit_relative_jump);
        self.report("write jump", at, result)
    }

    /// `call target` at `address`.
    pub unsafe fn write_call(&self, address: u32, target: usize) -> Result<(), Error> {
        let at = self.resolve(address);
        let result = self.write_branch(at, target, CodeBuf::emit_relative_call);
        self.report("write call", at, result)
    }

    fn write_branch(
        &self,
        at: usize,
        target: usize,
        emit: fn(&mut CodeBuf, u32),
    ) -> Result<(), Error> {
        let mut buf = CodeBuf::new(code_address(at)?);
        emit(&mut buf, code_address(target)?);
        self.write_code(at, buf.as_slice())
    }

    pub unsafe fn write_nops(&self, address: u32, count: usize) -> Result<(), Error> {
        let at = self.resolve(address);
        let mut buf = CodeBuf::new(address);
        buf.emit_nops(count);
        let result = self.write_code(at, buf.as_slice());
        self.report("write no-ops", at, result)
    }

    /// Replaces the function pointer stored at `address` (a slot an indirect
    /// call reads) with `target`.
    pub unsafe fn patch_dispatch_pointer(&self, address: u32, target: usize) -> Result<(), Error> {
        let at = self.resolve(address);
        let result = code_address(target)
            .and_then(|target| self.write_code(at, &target.to_le_bytes()));
        self.report("patch dispatch pointer", at, result)
    }

    /// Like `patch_dispatch_pointer`, but the pointer is sent through a jump
    /// slot which pushes `marker` below the return address first, so a
    /// `target` shared by several call sites can tell them apart.
    ///
    /// Returns the address of the jump slot.
    pub unsafe fn patch_dispatch_tagged(
        &self,
        address: u32,
        marker: u32,
        target: usize,
    ) -> Result<usize, Error> {
        let at = self.resolve(address);
        let result = self.install_tagged(at, marker, target);
        self.report("patch tagged dispatch", at, result)
    }

    fn install_tagged(&self, at: usize, marker: u32, target: usize) -> Result<usize, Error> {
        let target = code_address(target)?;
        let (_, slot) = self.jumps.lock().claim(&self.backend)?;
        let code = trampoline::tagged_jump(code_address(slot)?, marker, target);
        self.write_code(slot, &code)?;
        self.write_code(at, &code_address(slot)?.to_le_bytes())?;
        debug!("Dispatch pointer {:08x} -> slot {:x} (marker {:x})", at, slot, marker);
        Ok(slot)
    }

    pub fn hook_table_state(&self) -> TableState {
        self.hooks.lock().state()
    }

    pub fn jump_table_state(&self) -> TableState {
        self.jumps.lock().state()
    }

    /// Hook table entries used, failed installs included.
    pub fn installed_hooks(&self) -> usize {
        self.hooks.lock().used()
    }

    pub fn used_jump_slots(&self) -> usize {
        self.jumps.lock().used()
    }

    /// Return address seen by the most recent hook, for crash reports.
    pub fn last_hook_return(&self) -> u32 {
        self.shared.last_hook_return()
    }

    /// Resolved address of the legacy function being called right now.
    pub fn in_flight_call(&self) -> Option<usize> {
        self.shared.in_flight_call()
    }

    pub fn snapshot(&self, address: u32, len: usize) -> Result<Snapshot, Error> {
        Snapshot::capture(&self.backend, self.relocation, address, len)
    }
}
