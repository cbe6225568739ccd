//! Sparse 32-bit guest address space.

use std::io;

struct Region {
    base: u32,
    data: Vec<u8>,
}

impl Region {
    fn end(&self) -> u64 {
        self.base as u64 + self.data.len() as u64
    }

    fn contains(&self, address: u32) -> bool {
        address >= self.base && (address as u64) < self.end()
    }
}

/// Guest memory made of separately mapped regions. Everything outside a
/// region faults.
#[derive(Default)]
pub struct GuestMemory {
    // Sorted by base, never overlapping
    regions: Vec<Region>,
}

fn unmapped(address: u32) -> io::Error {
    io::Error::new(
        io::ErrorKind::AddrNotAvailable,
        format!("Guest address {:08x} is not mapped", address),
    )
}

impl GuestMemory {
    pub fn new() -> GuestMemory {
        GuestMemory {
            regions: Vec::new(),
        }
    }

    /// Maps `size` zeroed bytes at `base`.
    pub fn map(&mut self, base: u32, size: u32) -> io::Result<()> {
        let end = base as u64 + size as u64;
        if size == 0 || end > 1 << 32 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Invalid guest region {:08x}+{:x}", base, size),
            ));
        }
        let overlaps = self.regions.iter()
            .any(|x| (base as u64) < x.end() && end > x.base as u64);
        if overlaps {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("Guest region {:08x}+{:x} overlaps an existing one", base, size),
            ));
        }
        let pos = self.regions.iter().position(|x| x.base > base).unwrap_or(self.regions.len());
        self.regions.insert(pos, Region {
            base,
            data: vec![0; size as usize],
        });
        Ok(())
    }

    /// Maps a region exactly covering `image` and copies it there.
    pub fn load_image(&mut self, base: u32, image: &[u8]) -> io::Result<()> {
        let size = u32::try_from(image.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "Image too large"))?;
        self.map(base, size)?;
        self.write(base, image)
    }

    pub fn is_mapped(&self, address: u32, len: usize) -> bool {
        self.check_mapped(address, len).is_ok()
    }

    fn check_mapped(&self, address: u32, len: usize) -> io::Result<()> {
        let mut pos = 0;
        while pos < len {
            let current = address.wrapping_add(pos as u32);
            let region = self.region(current).ok_or_else(|| unmapped(current))?;
            pos += (region.end() - current as u64) as usize;
        }
        Ok(())
    }

    fn region(&self, address: u32) -> Option<&Region> {
        self.regions.iter().find(|x| x.contains(address))
    }

    fn region_mut(&mut self, address: u32) -> Option<&mut Region> {
        self.regions.iter_mut().find(|x| x.contains(address))
    }

    /// Reads may span adjacent regions.
    pub fn read(&self, address: u32, out: &mut [u8]) -> io::Result<()> {
        let mut pos = 0;
        while pos < out.len() {
            let current = address.wrapping_add(pos as u32);
            let region = self.region(current).ok_or_else(|| unmapped(current))?;
            let offset = (current - region.base) as usize;
            let amount = (region.data.len() - offset).min(out.len() - pos);
            out[pos..pos + amount].copy_from_slice(&region.data[offset..offset + amount]);
            pos += amount;
        }
        Ok(())
    }

    /// Nothing is written if any part of the range is unmapped.
    pub fn write(&mut self, address: u32, data: &[u8]) -> io::Result<()> {
        self.check_mapped(address, data.len())?;
        let mut pos = 0;
        while pos < data.len() {
            let current = address.wrapping_add(pos as u32);
            let region = self.region_mut(current).ok_or_else(|| unmapped(current))?;
            let offset = (current - region.base) as usize;
            let amount = (region.data.len() - offset).min(data.len() - pos);
            region.data[offset..offset + amount].copy_from_slice(&data[pos..pos + amount]);
            pos += amount;
        }
        Ok(())
    }

    /// Copies up to `out.len()` bytes of code starting from `address`,
    /// stopping early at the first unmapped byte.
    pub fn fetch(&self, address: u32, out: &mut [u8]) -> io::Result<usize> {
        let mut len = 0;
        while len < out.len() {
            let current = address.wrapping_add(len as u32);
            match self.region(current) {
                Some(region) => {
                    out[len] = region.data[(current - region.base) as usize];
                    len += 1;
                }
                None if len == 0 => return Err(unmapped(current)),
                None => break,
            }
        }
        Ok(len)
    }

    pub fn read_u8(&self, address: u32) -> io::Result<u8> {
        let mut buf = [0u8; 1];
        self.read(address, &mut buf)?;
        Ok(buf[0])
    }

    pub fn read_u16(&self, address: u32) -> io::Result<u16> {
        let mut buf = [0u8; 2];
        self.read(address, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    pub fn read_u32(&self, address: u32) -> io::Result<u32> {
        let mut buf = [0u8; 4];
        self.read(address, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn write_u8(&mut self, address: u32, value: u8) -> io::Result<()> {
        self.write(address, &[value])
    }

    pub fn write_u16(&mut self, address: u32, value: u16) -> io::Result<()> {
        self.write(address, &value.to_le_bytes())
    }

    pub fn write_u32(&mut self, address: u32, value: u32) -> io::Result<()> {
        self.write(address, &value.to_le_bytes())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn regions() {
        let mut mem = GuestMemory::new();
        mem.map(0x2000, 0x1000).unwrap();
        mem.load_image(0x1000, &[1, 2, 3, 4]).unwrap();
        assert!(mem.map(0x2800, 0x1000).is_err());
        assert!(mem.map(0xffff_f000, 0x2000).is_err());
        assert_eq!(mem.read_u32(0x1000).unwrap(), 0x0403_0201);
        assert!(mem.read_u8(0x1004).is_err());
        assert!(mem.is_mapped(0x2000, 0x1000));
        assert!(!mem.is_mapped(0x2000, 0x1001));
    }

    #[test]
    fn adjacent_regions() {
        let mut mem = GuestMemory::new();
        mem.map(0x1000, 0x1000).unwrap();
        mem.map(0x2000, 0x1000).unwrap();
        mem.write_u32(0x1ffe, 0xaabb_ccdd).unwrap();
        assert_eq!(mem.read_u16(0x1ffe).unwrap(), 0xccdd);
        assert_eq!(mem.read_u16(0x2000).unwrap(), 0xaabb);
        assert_eq!(mem.read_u32(0x1ffe).unwrap(), 0xaabb_ccdd);
    }

    #[test]
    fn partial_writes_fail() {
        let mut mem = GuestMemory::new();
        mem.map(0x1000, 0x10).unwrap();
        assert!(mem.write(0x100e, &[1, 2, 3, 4]).is_err());
        assert_eq!(mem.read_u16(0x100e).unwrap(), 0);
    }

    #[test]
    fn fetch_stops_at_unmapped() {
        let mut mem = GuestMemory::new();
        mem.load_image(0x1000, &[0x90, 0x90, 0xc3]).unwrap();
        let mut buf = [0u8; 15];
        assert_eq!(mem.fetch(0x1001, &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], &[0x90, 0xc3]);
        assert!(mem.fetch(0x1003, &mut buf).is_err());
    }
}
