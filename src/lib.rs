//! Interop layer for extending a legacy 32-bit x86 program from Rust.
//!
//! Hooks are patched into the legacy code and receive its registers,
//! legacy functions taking arguments in arbitrary registers can be called,
//! and its global variables are accessible through typed handles. All of it
//! works either natively (the image is mapped in this process) or against an
//! emulated image.

#[macro_use] extern crate log;

pub mod alias;
pub mod backend;
pub mod config;
pub mod context;
pub mod emit;
pub mod emulator;
pub mod error;
pub mod ffi;
pub mod funcs;
pub mod hook;
pub mod memory;
pub mod native;
pub mod registers;
pub mod snapshot;
pub mod trampoline;

mod exec_mem;
#[cfg(windows)]
mod windows;

pub use crate::alias::{LegacyArray, LegacyVar, Relocation};
pub use crate::backend::{Backend, HookFn, SharedState};
pub use crate::config::InteropConfig;
pub use crate::context::InteropContext;
pub use crate::emulator::EmulatedBackend;
pub use crate::error::Error;
pub use crate::ffi::InteropApi;
pub use crate::hook::TableState;
pub use crate::native::NativeBackend;
pub use crate::registers::{FlagsByte, Reg, RegisterFrame};
pub use crate::snapshot::Snapshot;

pub const VERSION: u16 = 3;

/// Logs `msg` and aborts the process, no matter which thread calls this.
/// Used for failures that leave the legacy program in a state nothing can
/// continue from.
#[cold]
pub fn fatal(msg: &str) -> ! {
    error!("{}", msg);
    #[cfg(windows)]
    windows::error_box("Legacy interop", msg);
    std::process::abort();
}
