//! Bookkeeping for the hook table and the indirect jump slot arena, and the
//! retrying writer patches go through.

use std::io;

use crate::backend::Backend;
use crate::error::Error;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum TableState {
    /// No memory reserved yet, the first claim reserves it.
    Uninitialized,
    /// Memory reserved, no entries used.
    Allocated,
    AcceptingInstalls,
    /// Every entry is used. Installed entries keep working.
    Full,
}

/// Fixed-size entries bump-allocated from one executable region. Entries are
/// never freed or moved.
pub struct SlotTable {
    name: &'static str,
    base: Option<usize>,
    slot_size: usize,
    capacity: usize,
    used: usize,
}

impl SlotTable {
    pub fn new(name: &'static str, slot_size: usize, capacity: usize) -> SlotTable {
        SlotTable {
            name,
            base: None,
            slot_size,
            capacity,
            used: 0,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn state(&self) -> TableState {
        match self.base {
            None => TableState::Uninitialized,
            Some(_) if self.used >= self.capacity => TableState::Full,
            Some(_) if self.used == 0 => TableState::Allocated,
            Some(_) => TableState::AcceptingInstalls,
        }
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    pub fn base(&self) -> Option<usize> {
        self.base
    }

    /// Reserves the backing region if that hasn't been done yet.
    ///
    /// Interop can't work without it, so failing is fatal.
    pub fn ensure_allocated<B: Backend + ?Sized>(&mut self, backend: &B) -> usize {
        if let Some(base) = self.base {
            return base;
        }
        let size = self.slot_size.saturating_mul(self.capacity.max(1));
        match backend.reserve_executable(size) {
            Ok(base) => {
                debug!(
                    "Allocated {} table: {} entries of {:x} bytes at {:x}",
                    self.name, self.capacity, self.slot_size, base,
                );
                self.base = Some(base);
                base
            }
            Err(e) => crate::fatal(&format!(
                "Couldn't allocate executable memory for {} table ({:x} bytes): {}",
                self.name, size, e,
            )),
        }
    }

    /// Takes the next free entry, returning its index and address.
    pub fn claim<B: Backend + ?Sized>(&mut self, backend: &B) -> Result<(usize, usize), Error> {
        if self.used >= self.capacity {
            return Err(Error::TableFull(self.name, self.capacity));
        }
        let base = self.ensure_allocated(backend);
        let index = self.used;
        self.used += 1;
        Ok((index, base + index * self.slot_size))
    }
}

/// Writes `data` to code at `address`, trying up to `attempts` times.
///
/// Some compatibility layers fail writes to certain addresses for no
/// visible reason and accept the same write moments later.
pub fn write_with_retry<B: Backend + ?Sized>(
    backend: &B,
    address: usize,
    data: &[u8],
    attempts: u32,
) -> Result<(), Error> {
    let attempts = attempts.max(1);
    let mut last_error = None;
    for attempt in 1..=attempts {
        match backend.write_code(address, data) {
            Ok(()) => {
                if attempt != 1 {
                    debug!("Write to {:08x} succeeded on attempt {}", address, attempt);
                }
                return Ok(());
            }
            Err(e) => {
                warn!(
                    "Writing {} bytes to {:08x} failed (attempt {}/{}): {}",
                    data.len(), address, attempt, attempts, e,
                );
                last_error = Some(e);
            }
        }
    }
    let error = last_error.unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "No attempts"));
    Err(Error::PatchFailed(address, attempts, error))
}

#[cfg(test)]
mod test {
    use super::*;

    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::backend::{HookFn, SharedState};
    use crate::memory::MemoryAccess;
    use crate::registers::RegisterFrame;

    struct Flaky {
        failures: u32,
        writes: AtomicU32,
    }

    impl MemoryAccess for Flaky {
        fn read(&self, _: usize, _: &mut [u8]) -> io::Result<()> {
            Ok(())
        }

        fn write(&self, _: usize, _: &[u8]) -> io::Result<()> {
            Ok(())
        }
    }

    impl Backend for Flaky {
        fn name(&self) -> &'static str {
            "flaky"
        }

        fn write_code(&self, _: usize, _: &[u8]) -> io::Result<()> {
            let n = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
            if n <= self.failures {
                Err(io::Error::new(io::ErrorKind::PermissionDenied, "Denied"))
            } else {
                Ok(())
            }
        }

        fn reserve_executable(&self, _: usize) -> io::Result<usize> {
            Ok(0x1000_0000)
        }

        fn hook_entry(
            &self,
            _: usize,
            _: usize,
            _: HookFn,
            _: &SharedState,
        ) -> Result<Vec<u8>, Error> {
            Ok(Vec::new())
        }

        fn hook_redirect(&self, _: usize, _: usize, _: usize) -> Result<Vec<u8>, Error> {
            Ok(Vec::new())
        }

        fn call_foreign(&self, _: usize, _: &mut RegisterFrame, _: &SharedState) -> u8 {
            0
        }
    }

    fn flaky(failures: u32) -> Flaky {
        Flaky {
            failures,
            writes: AtomicU32::new(0),
        }
    }

    #[test]
    fn table_states() {
        let backend = flaky(0);
        let mut table = SlotTable::new("hook", 0x80, 2);
        assert_eq!(table.state(), TableState::Uninitialized);
        table.ensure_allocated(&backend);
        assert_eq!(table.state(), TableState::Allocated);
        assert_eq!(table.claim(&backend).unwrap(), (0, 0x1000_0000));
        assert_eq!(table.state(), TableState::AcceptingInstalls);
        assert_eq!(table.claim(&backend).unwrap(), (1, 0x1000_0080));
        assert_eq!(table.state(), TableState::Full);
        match table.claim(&backend) {
            Err(Error::TableFull("hook", 2)) => (),
            x => panic!("Unexpected {:?}", x),
        }
        assert_eq!(table.used(), 2);
    }

    #[test]
    fn retry_count() {
        let backend = flaky(3);
        write_with_retry(&backend, 0x401000, &[0xc3], 10).unwrap();
        assert_eq!(backend.writes.load(Ordering::Relaxed), 4);

        let backend = flaky(u32::MAX);
        match write_with_retry(&backend, 0x401000, &[0xc3], 3) {
            Err(Error::PatchFailed(0x401000, 3, _)) => (),
            x => panic!("Unexpected {:?}", x),
        }
        assert_eq!(backend.writes.load(Ordering::Relaxed), 3);

        // Zero is treated as a single attempt
        let backend = flaky(0);
        write_with_retry(&backend, 0x401000, &[0xc3], 0).unwrap();
        assert_eq!(backend.writes.load(Ordering::Relaxed), 1);
    }
}
