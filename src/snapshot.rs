//! Copies of legacy memory ranges, for finding out what a piece of code
//! changed or where two runs diverged.

use std::io::{Read, Write};
use std::ops::Range;

use byteorder::{ReadBytesExt, WriteBytesExt, LE};

use crate::alias::Relocation;
use crate::error::Error;
use crate::memory::MemoryAccess;

const SNAPSHOT_MAGIC: u32 = 0x50_6e53_4c; // "LSnP"
const SNAPSHOT_VERSION: u32 = 0;
const MAX_SNAPSHOT_LEN: u32 = 0x0400_0000;

#[derive(Clone, Eq, PartialEq)]
pub struct Snapshot {
    address: u32,
    data: Vec<u8>,
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Snapshot({:08x}+{:x})", self.address, self.data.len())
    }
}

impl Snapshot {
    /// Copies `len` bytes from legacy `address`.
    pub fn capture<M: MemoryAccess + ?Sized>(
        memory: &M,
        relocation: Relocation,
        address: u32,
        len: usize,
    ) -> Result<Snapshot, Error> {
        let mut data = vec![0; len];
        memory.read(relocation.apply(address), &mut data)?;
        Ok(Snapshot {
            address,
            data,
        })
    }

    pub fn from_bytes(address: u32, data: Vec<u8>) -> Snapshot {
        Snapshot {
            address,
            data,
        }
    }

    /// Legacy (unrelocated) address the snapshot starts at.
    pub fn address(&self) -> u32 {
        self.address
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn same_layout(&self, other: &Snapshot) -> bool {
        self.address == other.address && self.data.len() == other.data.len()
    }

    /// Legacy address ranges where `self` and `other` differ, merged when
    /// adjacent. The ranges are u64 so that one ending at the top of the
    /// address space can be represented.
    pub fn diff(&self, other: &Snapshot) -> Result<Vec<Range<u64>>, Error> {
        if !self.same_layout(other) {
            return Err(Error::SnapshotLayout(
                (self.address as usize, self.data.len()),
                (other.address as usize, other.data.len()),
            ));
        }
        let mut result: Vec<Range<u64>> = Vec::new();
        let changed = self.data.iter().zip(other.data.iter())
            .enumerate()
            .filter(|(_, (a, b))| a != b)
            .map(|(i, _)| self.address as u64 + i as u64);
        for address in changed {
            match result.last_mut() {
                Some(last) if last.end == address => last.end = address + 1,
                _ => result.push(address..address + 1),
            }
        }
        Ok(result)
    }

    /// Format:
    /// u32 magic
    /// u32 version (0)
    /// u32 address
    /// u32 length
    /// u32 compressed_length
    /// u8 data[compressed_length] (Deflated)
    pub fn write_to<W: Write>(&self, mut out: W) -> Result<(), Error> {
        if self.data.len() > MAX_SNAPSHOT_LEN as usize {
            return Err(Error::SnapshotTooLarge(self.data.len()));
        }
        let compressed = {
            let mut writer = flate2::write::DeflateEncoder::new(
                Vec::with_capacity(self.data.len() / 4),
                flate2::Compression::default(),
            );
            writer.write_all(&self.data)?;
            writer.finish()?
        };
        trace!(
            "Write snapshot {:08x} {:x}/{:x}",
            self.address, self.data.len(), compressed.len(),
        );
        out.write_u32::<LE>(SNAPSHOT_MAGIC)?;
        out.write_u32::<LE>(SNAPSHOT_VERSION)?;
        out.write_u32::<LE>(self.address)?;
        out.write_u32::<LE>(self.data.len() as u32)?;
        out.write_u32::<LE>(compressed.len() as u32)?;
        out.write_all(&compressed)?;
        Ok(())
    }

    pub fn read_from<R: Read>(mut input: R) -> Result<Snapshot, Error> {
        let magic = input.read_u32::<LE>()?;
        let version = input.read_u32::<LE>()?;
        if magic != SNAPSHOT_MAGIC || version != SNAPSHOT_VERSION {
            return Err(Error::BadSnapshot);
        }
        let address = input.read_u32::<LE>()?;
        let length = input.read_u32::<LE>()?;
        let compressed = input.read_u32::<LE>()?;
        if length > MAX_SNAPSHOT_LEN || compressed > MAX_SNAPSHOT_LEN {
            return Err(Error::BadSnapshot);
        }
        let mut data = vec![0; length as usize];
        let mut reader = flate2::read::DeflateDecoder::new(input.take(compressed as u64));
        reader.read_exact(&mut data).map_err(|_| Error::BadSnapshot)?;
        Ok(Snapshot {
            address,
            data,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::io::Cursor;

    #[test]
    fn diff_ranges() {
        let a = Snapshot::from_bytes(0x0058_0000, vec![0; 16]);
        let mut data = vec![0; 16];
        data[1] = 1;
        data[2] = 1;
        data[3] = 1;
        data[8] = 5;
        data[15] = 9;
        let b = Snapshot::from_bytes(0x0058_0000, data);
        assert_eq!(
            a.diff(&b).unwrap(),
            vec![0x0058_0001..0x0058_0004, 0x0058_0008..0x0058_0009, 0x0058_000f..0x0058_0010],
        );
        assert!(a.diff(&a).unwrap().is_empty());
        assert_ne!(a, b);

        let c = Snapshot::from_bytes(0x0058_0004, vec![0; 16]);
        match a.diff(&c) {
            Err(Error::SnapshotLayout((0x0058_0000, 16), (0x0058_0004, 16))) => (),
            x => panic!("Unexpected {:?}", x),
        }
    }

    #[test]
    fn diff_at_address_space_end() {
        let a = Snapshot::from_bytes(0xffff_fff0, vec![0; 16]);
        let mut data = vec![0; 16];
        data[14] = 1;
        data[15] = 1;
        let b = Snapshot::from_bytes(0xffff_fff0, data);
        assert_eq!(a.diff(&b).unwrap(), vec![0xffff_fffe..0x1_0000_0000]);
    }

    #[test]
    fn too_large_to_write() {
        let snapshot = Snapshot::from_bytes(0, vec![0; MAX_SNAPSHOT_LEN as usize + 1]);
        let mut buf = Vec::new();
        match snapshot.write_to(&mut buf) {
            Err(Error::SnapshotTooLarge(len)) => assert_eq!(len, MAX_SNAPSHOT_LEN as usize + 1),
            x => panic!("Unexpected {:?}", x),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn persisted() {
        let data = (0..0x1000u32).map(|x| (x / 0x20) as u8).collect::<Vec<u8>>();
        let snapshot = Snapshot::from_bytes(0x0062_8000, data);
        let mut buf = Vec::new();
        snapshot.write_to(&mut buf).unwrap();
        assert!(buf.len() < 0x1000);
        assert_eq!(&buf[..4], &SNAPSHOT_MAGIC.to_le_bytes());
        let read = Snapshot::read_from(Cursor::new(&buf)).unwrap();
        assert_eq!(read, snapshot);

        buf[4] = 1;
        match Snapshot::read_from(Cursor::new(&buf)) {
            Err(Error::BadSnapshot) => (),
            x => panic!("Unexpected {:?}", x),
        }
    }

    #[test]
    fn truncated() {
        let snapshot = Snapshot::from_bytes(0x0062_8000, vec![7; 0x100]);
        let mut buf = Vec::new();
        snapshot.write_to(&mut buf).unwrap();
        buf.truncate(21);
        assert!(Snapshot::read_from(Cursor::new(&buf)).is_err());
        buf.truncate(12);
        match Snapshot::read_from(Cursor::new(&buf)) {
            Err(Error::Io(_)) => (),
            x => panic!("Unexpected {:?}", x),
        }
    }

    #[test]
    fn capture_with_relocation() {
        let buf = vec![1u8, 2, 3, 4, 5, 6, 7, 8];
        let address = buf.as_ptr() as usize;
        // Relocation taking legacy address 0x1000 to the buffer
        let relocation = Relocation::new(address as isize - 0x1000);
        let snapshot =
            Snapshot::capture(&crate::memory::ProcessMemory, relocation, 0x1002, 4).unwrap();
        assert_eq!(snapshot.as_bytes(), &[3, 4, 5, 6]);
        assert_eq!(snapshot.address(), 0x1002);
    }
}
