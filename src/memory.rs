//! Raw memory access at absolute addresses.
//!
//! Addresses given to `MemoryAccess` are already relocated.

use std::io;
use std::ptr;

pub trait MemoryAccess {
    fn read(&self, address: usize, out: &mut [u8]) -> io::Result<()>;
    fn write(&self, address: usize, data: &[u8]) -> io::Result<()>;

    fn read_u32(&self, address: usize) -> io::Result<u32> {
        let mut buf = [0u8; 4];
        self.read(address, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn write_u32(&self, address: usize, value: u32) -> io::Result<()> {
        self.write(address, &value.to_le_bytes())
    }
}

impl<'a, M: MemoryAccess + ?Sized> MemoryAccess for &'a M {
    fn read(&self, address: usize, out: &mut [u8]) -> io::Result<()> {
        (**self).read(address, out)
    }

    fn write(&self, address: usize, data: &[u8]) -> io::Result<()> {
        (**self).write(address, data)
    }
}

/// Memory of this process. The legacy image is expected to be mapped readable
/// and writable already, so this is just a copy.
#[derive(Copy, Clone, Debug, Default)]
pub struct ProcessMemory;

fn check_range(address: usize, len: usize) -> io::Result<()> {
    if address == 0 || address.checked_add(len).is_none() {
        Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("Invalid memory range {:x}+{:x}", address, len),
        ))
    } else {
        Ok(())
    }
}

impl MemoryAccess for ProcessMemory {
    fn read(&self, address: usize, out: &mut [u8]) -> io::Result<()> {
        check_range(address, out.len())?;
        unsafe {
            ptr::copy(address as *const u8, out.as_mut_ptr(), out.len());
        }
        Ok(())
    }

    fn write(&self, address: usize, data: &[u8]) -> io::Result<()> {
        check_range(address, data.len())?;
        unsafe {
            ptr::copy(data.as_ptr(), address as *mut u8, data.len());
        }
        Ok(())
    }
}
