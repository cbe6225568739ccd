use std::io;

use quick_error::quick_error;

quick_error! {
    #[derive(Debug)]
    pub enum Error {
        Io(e: io::Error) {
            display("I/O error {}", e)
            from()
        }
        TableFull(table: &'static str, capacity: usize) {
            display("{} table is full ({} entries)", table, capacity)
        }
        PatchFailed(address: usize, attempts: u32, e: io::Error) {
            display("Patching {:08x} failed after {} attempts: {}", address, attempts, e)
        }
        AddressRange(address: usize) {
            display("Address {:x} is not reachable from 32-bit code", address)
        }
        RelocationMismatch(current: isize, requested: isize) {
            display(
                "Relocation offset is already fixed to {:x}, cannot change it to {:x}",
                current, requested,
            )
        }
        AlreadyInstalled {
            display("A global interop context is already installed")
        }
        BadSnapshot {
            display("Invalid snapshot")
        }
        SnapshotTooLarge(len: usize) {
            display("Snapshot of {:x} bytes is too large to save", len)
        }
        SnapshotLayout(a: (usize, usize), b: (usize, usize)) {
            display(
                "Snapshots cover different ranges ({:x}+{:x} vs {:x}+{:x})",
                a.0, a.1, b.0, b.1,
            )
        }
    }
}
