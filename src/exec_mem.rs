//! Executable memory for generated code, and protection changes on the
//! legacy image's code pages.

use std::io;

/// Read/write/execute memory that is never released.
///
/// Generated code may be running from it at any point until the process
/// exits, so there is no `Drop`.
pub struct ExecutableRegion {
    base: *mut u8,
    size: usize,
}

unsafe impl Send for ExecutableRegion {}
unsafe impl Sync for ExecutableRegion {}

impl ExecutableRegion {
    pub fn reserve(size: usize) -> io::Result<ExecutableRegion> {
        let size = round_to_pages(size.max(1), page_size());
        let base = unsafe { os_reserve(size)? };
        debug!("Reserved {:x} bytes of executable memory at {:p}", size, base);
        Ok(ExecutableRegion {
            base,
            size,
        })
    }

    pub fn base(&self) -> usize {
        self.base as usize
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn contains(&self, address: usize, len: usize) -> bool {
        address >= self.base() &&
            address.checked_add(len).map(|end| end <= self.base() + self.size).unwrap_or(false)
    }
}

fn round_to_pages(size: usize, page_size: usize) -> usize {
    (size + page_size - 1) & !(page_size - 1)
}

#[cfg(unix)]
pub fn page_size() -> usize {
    // SAFETY: sysconf is always safe to call.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

#[cfg(windows)]
pub fn page_size() -> usize {
    0x1000
}

#[cfg(unix)]
unsafe fn os_reserve(size: usize) -> io::Result<*mut u8> {
    let ptr = libc::mmap(
        std::ptr::null_mut(),
        size,
        libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
        -1,
        0,
    );
    if ptr == libc::MAP_FAILED {
        Err(io::Error::last_os_error())
    } else {
        Ok(ptr as *mut u8)
    }
}

#[cfg(windows)]
unsafe fn os_reserve(size: usize) -> io::Result<*mut u8> {
    use winapi::um::heapapi::{HeapAlloc, HeapCreate};
    use winapi::um::winnt::HEAP_CREATE_ENABLE_EXECUTE;

    let heap = HeapCreate(HEAP_CREATE_ENABLE_EXECUTE, 0, 0);
    if heap.is_null() {
        return Err(io::Error::last_os_error());
    }
    let ptr = HeapAlloc(heap, 0, size) as *mut u8;
    if ptr.is_null() {
        Err(io::Error::new(io::ErrorKind::OutOfMemory, "HeapAlloc failed"))
    } else {
        Ok(ptr)
    }
}

/// Makes the pages of `address..address + len` writable for the duration of
/// `func`, then restores the protection they had before.
///
/// Failing to make them writable is an error, `func` isn't called then.
/// Failing to restore the protection is only logged, as the write went through.
pub unsafe fn with_writable_code<R, F: FnOnce() -> R>(
    address: usize,
    len: usize,
    func: F,
) -> io::Result<R> {
    let state = unprotect(address, len)?;
    let result = func();
    if let Err(e) = reprotect(address, len, state) {
        error!("Couldn't restore protection of {:x}+{:x}: {}", address, len, e);
    }
    Ok(result)
}

#[cfg(unix)]
fn page_span(address: usize, len: usize) -> (usize, usize) {
    let page_size = page_size();
    let start = address & !(page_size - 1);
    let end = round_to_pages(address + len.max(1), page_size);
    (start, end - start)
}

/// Part of a page span that had one protection before it was made writable.
#[cfg(unix)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
struct Protection {
    start: usize,
    len: usize,
    prot: libc::c_int,
}

/// Parses `/proc/self/maps` lines, returning the mapped pieces of
/// `start..start + len` with their protection.
#[cfg(unix)]
fn parse_maps(maps: &str, start: usize, len: usize) -> Vec<Protection> {
    let end = start + len;
    let mut result = Vec::new();
    for line in maps.lines() {
        let mut fields = line.split_whitespace();
        let (range, perms) = match (fields.next(), fields.next()) {
            (Some(r), Some(p)) => (r, p.as_bytes()),
            _ => continue,
        };
        let mut bounds = range.splitn(2, '-').map(|x| usize::from_str_radix(x, 16));
        let (lo, hi) = match (bounds.next(), bounds.next()) {
            (Some(Ok(lo)), Some(Ok(hi))) => (lo, hi),
            _ => continue,
        };
        if hi <= start || lo >= end || perms.len() < 3 {
            continue;
        }
        let mut prot = libc::PROT_NONE;
        if perms[0] == b'r' {
            prot |= libc::PROT_READ;
        }
        if perms[1] == b'w' {
            prot |= libc::PROT_WRITE;
        }
        if perms[2] == b'x' {
            prot |= libc::PROT_EXEC;
        }
        let piece_start = lo.max(start);
        result.push(Protection {
            start: piece_start,
            len: hi.min(end) - piece_start,
            prot,
        });
    }
    result
}

#[cfg(target_os = "linux")]
fn current_protection(start: usize, len: usize) -> Option<Vec<Protection>> {
    match std::fs::read_to_string("/proc/self/maps") {
        Ok(maps) => Some(parse_maps(&maps, start, len)),
        Err(e) => {
            warn!("Couldn't read /proc/self/maps: {}", e);
            None
        }
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
fn current_protection(_start: usize, _len: usize) -> Option<Vec<Protection>> {
    None
}

#[cfg(unix)]
unsafe fn unprotect(address: usize, len: usize) -> io::Result<Option<Vec<Protection>>> {
    let (start, span) = page_span(address, len);
    let old = current_protection(start, span);
    let prot = libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC;
    if libc::mprotect(start as *mut libc::c_void, span, prot) != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(old)
}

#[cfg(unix)]
unsafe fn reprotect(
    address: usize,
    len: usize,
    old: Option<Vec<Protection>>,
) -> io::Result<()> {
    let old = match old {
        Some(s) => s,
        None => {
            debug!("Protection of {:x}+{:x} unknown, leaving it writable", address, len);
            return Ok(());
        }
    };
    for piece in old {
        if libc::mprotect(piece.start as *mut libc::c_void, piece.len, piece.prot) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(windows)]
unsafe fn unprotect(address: usize, len: usize) -> io::Result<u32> {
    use winapi::um::memoryapi::VirtualProtect;
    use winapi::um::winnt::PAGE_EXECUTE_READWRITE;

    let mut old = 0;
    let ok = VirtualProtect(address as *mut _, len, PAGE_EXECUTE_READWRITE, &mut old);
    if ok == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(old)
}

#[cfg(windows)]
unsafe fn reprotect(address: usize, len: usize, old: u32) -> io::Result<()> {
    use winapi::um::memoryapi::VirtualProtect;

    let mut dummy = 0;
    if VirtualProtect(address as *mut _, len, old, &mut dummy) == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
