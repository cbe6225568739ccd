//! Execution strategy interface.
//!
//! The native strategy patches this process and calls legacy code directly,
//! the emulated one runs the legacy image in an interpreter. Everything above
//! this trait is shared.

use std::cell::UnsafeCell;
use std::io;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::error::Error;
use crate::memory::MemoryAccess;
use crate::registers::RegisterFrame;

/// Hook function. Receives the registers the hooked function was called with
/// and may change them; the return value becomes the flags byte (`sahf`
/// layout) seen by the caller, so e.g. 1 returns with carry set.
pub type HookFn = unsafe extern "C" fn(&mut RegisterFrame) -> u8;

pub trait Backend: MemoryAccess {
    fn name(&self) -> &'static str;

    /// Writes into code that may be executing. Single attempt, no retrying.
    fn write_code(&self, address: usize, data: &[u8]) -> io::Result<()>;

    /// Reserves executable memory for hook entries / jump slots, never freed.
    fn reserve_executable(&self, size: usize) -> io::Result<usize>;

    /// Code for hook table entry `index` located at `entry`. Empty if this
    /// backend dispatches hooks some other way.
    fn hook_entry(
        &self,
        index: usize,
        entry: usize,
        hook: HookFn,
        shared: &SharedState,
    ) -> Result<Vec<u8>, Error>;

    /// Sequence written at `at` to send execution to hook `index`.
    fn hook_redirect(&self, at: usize, index: usize, entry: usize) -> Result<Vec<u8>, Error>;

    /// Runs legacy code at `address` with `regs`, returning with `regs` set to
    /// the registers it returned with and the raw flags byte (as `lahf` puts in `ah`).
    fn call_foreign(&self, address: usize, regs: &mut RegisterFrame, shared: &SharedState) -> u8;
}

impl<M: MemoryAccess + ?Sized> MemoryAccess for Box<M> {
    fn read(&self, address: usize, out: &mut [u8]) -> io::Result<()> {
        (**self).read(address, out)
    }

    fn write(&self, address: usize, data: &[u8]) -> io::Result<()> {
        (**self).write(address, data)
    }
}

impl<B: Backend + ?Sized> Backend for Box<B> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn write_code(&self, address: usize, data: &[u8]) -> io::Result<()> {
        (**self).write_code(address, data)
    }

    fn reserve_executable(&self, size: usize) -> io::Result<usize> {
        (**self).reserve_executable(size)
    }

    fn hook_entry(
        &self,
        index: usize,
        entry: usize,
        hook: HookFn,
        shared: &SharedState,
    ) -> Result<Vec<u8>, Error> {
        (**self).hook_entry(index, entry, hook, shared)
    }

    fn hook_redirect(&self, at: usize, index: usize, entry: usize) -> Result<Vec<u8>, Error> {
        (**self).hook_redirect(at, index, entry)
    }

    fn call_foreign(&self, address: usize, regs: &mut RegisterFrame, shared: &SharedState) -> u8 {
        (**self).call_foreign(address, regs, shared)
    }
}

/// State shared between generated code, hooks and crash diagnostics.
///
/// Generated code refers to the fields by absolute address, so this has to
/// stay boxed in place for as long as any hook is installed.
#[repr(C)]
pub struct SharedState {
    frame: UnsafeCell<RegisterFrame>,
    last_hook_return: AtomicU32,
    in_flight_call: AtomicUsize,
}

// Legacy code and hooks run on a single thread; the atomics only exist so
// that a crash handler can read them.
unsafe impl Sync for SharedState {}
unsafe impl Send for SharedState {}

impl SharedState {
    pub fn new() -> Box<SharedState> {
        Box::new(SharedState {
            frame: UnsafeCell::new(RegisterFrame::new()),
            last_hook_return: AtomicU32::new(0),
            in_flight_call: AtomicUsize::new(0),
        })
    }

    /// The staging frame hooks receive.
    pub fn frame_ptr(&self) -> *mut RegisterFrame {
        self.frame.get()
    }

    pub fn last_hook_return_ptr(&self) -> *mut u32 {
        self.last_hook_return.as_ptr()
    }

    /// Return address of the most recent hook entry, 0 if no hook has run.
    pub fn last_hook_return(&self) -> u32 {
        self.last_hook_return.load(Ordering::Relaxed)
    }

    pub fn set_last_hook_return(&self, value: u32) {
        self.last_hook_return.store(value, Ordering::Relaxed);
    }

    /// Address of the legacy function currently being called, if any.
    /// Lets a crash handler tell a fault inside legacy code apart.
    pub fn in_flight_call(&self) -> Option<usize> {
        match self.in_flight_call.load(Ordering::Relaxed) {
            0 => None,
            x => Some(x),
        }
    }

    pub fn enter_call(&self, address: usize) -> InFlightCall<'_> {
        let previous = self.in_flight_call.swap(address, Ordering::Relaxed);
        InFlightCall {
            state: self,
            previous,
        }
    }
}

/// Marks a foreign call in flight until dropped, unwinding included.
/// Nested calls restore the outer call's address.
pub struct InFlightCall<'a> {
    state: &'a SharedState,
    previous: usize,
}

impl<'a> Drop for InFlightCall<'a> {
    fn drop(&mut self) {
        self.state.in_flight_call.store(self.previous, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn in_flight_nesting() {
        let state = SharedState::new();
        assert_eq!(state.in_flight_call(), None);
        {
            let _outer = state.enter_call(0x401000);
            assert_eq!(state.in_flight_call(), Some(0x401000));
            {
                let _inner = state.enter_call(0x402000);
                assert_eq!(state.in_flight_call(), Some(0x402000));
            }
            assert_eq!(state.in_flight_call(), Some(0x401000));
        }
        assert_eq!(state.in_flight_call(), None);
    }

    #[test]
    fn in_flight_cleared_on_panic() {
        let state = SharedState::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _call = state.enter_call(0x401000);
            panic!("Foreign code crashed");
        }));
        assert!(result.is_err());
        assert_eq!(state.in_flight_call(), None);
    }

    #[test]
    fn pointers_stay_put() {
        let state = SharedState::new();
        let frame = state.frame_ptr();
        unsafe {
            (*frame).eax = 42;
            *state.last_hook_return_ptr() = 0x0040_1005;
        }
        let moved = state;
        assert_eq!(moved.frame_ptr(), frame);
        assert_eq!(unsafe { (*moved.frame_ptr()).eax }, 42);
        assert_eq!(moved.last_hook_return(), 0x0040_1005);
    }
}
