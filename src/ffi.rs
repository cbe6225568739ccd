//! C ABI function table over a process-global context, for modules compiled
//! separately from this crate.

use std::ffi::CStr;
use std::slice;

use once_cell::sync::OnceCell;

use crate::backend::{Backend, HookFn};
use crate::config::InteropConfig;
use crate::context::InteropContext;
use crate::error::Error;
use crate::registers::RegisterFrame;

pub type GlobalBackend = Box<dyn Backend + Send + Sync>;
pub type GlobalContext = InteropContext<GlobalBackend>;

pub const API_VERSION: u16 = 1;

static GLOBAL: OnceCell<GlobalContext> = OnceCell::new();

/// Installs the context every `InteropApi` function operates on. Only the
/// first call succeeds.
pub fn install_global(
    backend: GlobalBackend,
    config: InteropConfig,
) -> Result<&'static GlobalContext, Error> {
    let mut new = Some(InteropContext::new(backend, config)?);
    let ctx = GLOBAL.get_or_init(|| {
        // get_or_init runs this at most once
        match new.take() {
            Some(s) => s,
            None => crate::fatal("Global interop context initialized twice"),
        }
    });
    if new.is_some() {
        return Err(Error::AlreadyInstalled);
    }
    info!("Installed global interop context ({} backend)", ctx.backend().name());
    Ok(ctx)
}

pub fn global() -> Option<&'static GlobalContext> {
    GLOBAL.get()
}

fn context() -> &'static GlobalContext {
    match GLOBAL.get() {
        Some(s) => s,
        None => crate::fatal("Interop API used before a context was installed"),
    }
}

/// Function table handed to other modules. Fields are only ever appended;
/// check `version` before using newer ones.
///
/// Functions returning u32 return 1 on success, 0 on a failure that has
/// already been logged.
#[repr(C)]
pub struct InteropApi {
    pub version: u16,
    pub read_memory: unsafe extern "C" fn(u32, *mut u8, usize),
    pub write_memory: unsafe extern "C" fn(u32, *const u8, usize),
    // Address, registers (in/out). Returns the flags byte
    pub call: unsafe extern "C" fn(u32, *mut RegisterFrame) -> u32,
    pub register_hook: unsafe extern "C" fn(u32, HookFn) -> u32,
    pub write_return: unsafe extern "C" fn(u32) -> u32,
    pub write_jump: unsafe extern "C" fn(u32, usize) -> u32,
    pub write_call: unsafe extern "C" fn(u32, usize) -> u32,
    pub write_nops: unsafe extern "C" fn(u32, usize) -> u32,
    pub patch_dispatch_pointer: unsafe extern "C" fn(u32, usize) -> u32,
    // Address, marker, target. Returns the jump slot, or 0 on failure
    pub patch_dispatch_tagged: unsafe extern "C" fn(u32, u32, usize) -> usize,
    pub last_hook_return: unsafe extern "C" fn() -> u32,
    // 0 when no legacy call is in progress
    pub in_flight_call: unsafe extern "C" fn() -> usize,
    // Null-terminated message
    pub crash_with_message: unsafe extern "C" fn(*const u8) -> !,
}

impl InteropApi {
    pub fn new() -> InteropApi {
        InteropApi {
            version: API_VERSION,
            read_memory,
            write_memory,
            call,
            register_hook,
            write_return,
            write_jump,
            write_call,
            write_nops,
            patch_dispatch_pointer,
            patch_dispatch_tagged,
            last_hook_return,
            in_flight_call,
            crash_with_message,
        }
    }
}

impl Default for InteropApi {
    fn default() -> InteropApi {
        InteropApi::new()
    }
}

fn status<T>(result: Result<T, Error>) -> u32 {
    result.is_ok() as u32
}

unsafe extern "C" fn read_memory(address: u32, out: *mut u8, len: usize) {
    context().read_memory(address, slice::from_raw_parts_mut(out, len));
}

unsafe extern "C" fn write_memory(address: u32, data: *const u8, len: usize) {
    context().write_memory(address, slice::from_raw_parts(data, len));
}

unsafe extern "C" fn call(address: u32, regs: *mut RegisterFrame) -> u32 {
    let ctx = context();
    let flags = match regs.as_mut() {
        Some(regs) => ctx.call_with(address, regs),
        None => ctx.call(address),
    };
    flags.bits() as u32
}

unsafe extern "C" fn register_hook(address: u32, hook: HookFn) -> u32 {
    status(context().register_hook(address, hook))
}

unsafe extern "C" fn write_return(address: u32) -> u32 {
    status(context().write_return(address))
}

unsafe extern "C" fn write_jump(address: u32, target: usize) -> u32 {
    status(context().write_jump(address, target))
}

unsafe extern "C" fn write_call(address: u32, target: usize) -> u32 {
    status(context().write_call(address, target))
}

unsafe extern "C" fn write_nops(address: u32, count: usize) -> u32 {
    status(context().write_nops(address, count))
}

unsafe extern "C" fn patch_dispatch_pointer(address: u32, target: usize) -> u32 {
    status(context().patch_dispatch_pointer(address, target))
}

unsafe extern "C" fn patch_dispatch_tagged(address: u32, marker: u32, target: usize) -> usize {
    context().patch_dispatch_tagged(address, marker, target).unwrap_or(0)
}

unsafe extern "C" fn last_hook_return() -> u32 {
    global().map(|x| x.last_hook_return()).unwrap_or(0)
}

unsafe extern "C" fn in_flight_call() -> usize {
    global().and_then(|x| x.in_flight_call()).unwrap_or(0)
}

unsafe extern "C" fn crash_with_message(msg: *const u8) -> ! {
    let msg = CStr::from_ptr(msg as *const _).to_string_lossy();
    crate::fatal(&msg);
}
