//! Typed views into the legacy image's global variables.
//!
//! Handles store the documented (unrelocated) address and resolve it through
//! the process relocation on every access, so a handle can be a `const`.

use std::marker::PhantomData;
use std::ops::{Add, BitAnd, BitOr, Sub};
use std::ptr;

use once_cell::sync::OnceCell;

use crate::error::Error;

static PROCESS_RELOCATION: OnceCell<isize> = OnceCell::new();

/// Constant shift between documented legacy addresses and where the image
/// actually is.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct Relocation(isize);

impl Relocation {
    pub const IDENTITY: Relocation = Relocation(0);

    pub const fn new(offset: isize) -> Relocation {
        Relocation(offset)
    }

    pub fn offset(self) -> isize {
        self.0
    }

    #[inline]
    pub fn apply(self, address: u32) -> usize {
        (address as usize).wrapping_add(self.0 as usize)
    }

    /// Relocation for this process. Reading it fixes it, an unset offset
    /// becomes 0 for good.
    pub fn process() -> Relocation {
        Relocation(*PROCESS_RELOCATION.get_or_init(|| 0))
    }

    /// Sets the process relocation. Succeeds again if asked for the same offset.
    pub fn fix_process(offset: isize) -> Result<Relocation, Error> {
        let current = *PROCESS_RELOCATION.get_or_init(|| offset);
        if current != offset {
            return Err(Error::RelocationMismatch(current, offset));
        }
        Ok(Relocation(current))
    }
}

/// A `T` living at a fixed legacy address.
pub struct LegacyVar<T> {
    address: u32,
    phantom: PhantomData<fn() -> T>,
}

impl<T> Copy for LegacyVar<T> {}
impl<T> Clone for LegacyVar<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> LegacyVar<T> {
    pub const fn new(address: u32) -> LegacyVar<T> {
        LegacyVar {
            address,
            phantom: PhantomData,
        }
    }

    pub fn address(self) -> u32 {
        self.address
    }

    #[inline]
    pub fn ptr(self) -> *mut T {
        Relocation::process().apply(self.address) as *mut T
    }

    /// The legacy image has to outlive the reference, and nothing else may
    /// hold a reference to the same variable meanwhile.
    pub unsafe fn as_mut<'a>(self) -> &'a mut T {
        &mut *self.ptr()
    }
}

impl<T: Copy> LegacyVar<T> {
    #[inline]
    pub unsafe fn get(self) -> T {
        ptr::read_unaligned(self.ptr())
    }

    #[inline]
    pub unsafe fn set(self, value: T) {
        ptr::write_unaligned(self.ptr(), value)
    }

    pub unsafe fn replace(self, value: T) -> T {
        let old = self.get();
        self.set(value);
        old
    }

    pub unsafe fn update<F: FnOnce(T) -> T>(self, func: F) -> T {
        let new = func(self.get());
        self.set(new);
        new
    }
}

impl<T: Copy + Add<Output = T>> LegacyVar<T> {
    pub unsafe fn add(self, value: T) -> T {
        self.update(|x| x + value)
    }
}

impl<T: Copy + Sub<Output = T>> LegacyVar<T> {
    pub unsafe fn sub(self, value: T) -> T {
        self.update(|x| x - value)
    }
}

impl<T: Copy + BitOr<Output = T>> LegacyVar<T> {
    pub unsafe fn or(self, value: T) -> T {
        self.update(|x| x | value)
    }
}

impl<T: Copy + BitAnd<Output = T>> LegacyVar<T> {
    pub unsafe fn and(self, value: T) -> T {
        self.update(|x| x & value)
    }
}

impl<T: Copy + Add<Output = T> + Sub<Output = T> + From<u8>> LegacyVar<T> {
    /// `var++`, returns the new value.
    pub unsafe fn increment(self) -> T {
        self.add(T::from(1))
    }

    pub unsafe fn decrement(self) -> T {
        self.sub(T::from(1))
    }
}

/// `[T; N]` at a fixed legacy address.
///
/// Indexing is checked in debug builds only; release builds index as
/// unchecked as the legacy code itself does.
pub struct LegacyArray<T, const N: usize> {
    address: u32,
    phantom: PhantomData<fn() -> T>,
}

impl<T, const N: usize> Copy for LegacyArray<T, N> {}
impl<T, const N: usize> Clone for LegacyArray<T, N> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T, const N: usize> LegacyArray<T, N> {
    pub const fn new(address: u32) -> LegacyArray<T, N> {
        LegacyArray {
            address,
            phantom: PhantomData,
        }
    }

    pub fn address(self) -> u32 {
        self.address
    }

    pub const fn len(self) -> usize {
        N
    }

    pub const fn is_empty(self) -> bool {
        N == 0
    }

    #[inline]
    pub fn ptr(self) -> *mut T {
        Relocation::process().apply(self.address) as *mut T
    }

    #[inline]
    pub fn element(self, index: usize) -> *mut T {
        debug_assert!(index < N, "Index {} out of range for legacy array of {}", index, N);
        self.ptr().wrapping_add(index)
    }

    /// View of the entire array, same caveats as `LegacyVar::as_mut`.
    pub unsafe fn as_mut_slice<'a>(self) -> &'a mut [T] {
        std::slice::from_raw_parts_mut(self.ptr(), N)
    }
}

impl<T: Copy, const N: usize> LegacyArray<T, N> {
    #[inline]
    pub unsafe fn get(self, index: usize) -> T {
        ptr::read_unaligned(self.element(index))
    }

    #[inline]
    pub unsafe fn set(self, index: usize, value: T) {
        ptr::write_unaligned(self.element(index), value)
    }

    pub unsafe fn iter(self) -> impl Iterator<Item = T> {
        (0..N).map(move |i| self.get(i))
    }

    pub unsafe fn to_vec(self) -> Vec<T> {
        self.iter().collect()
    }
}

/// Declares `LegacyVar`/`LegacyArray` constants from an address table.
///
/// ```
/// legacy_interop::legacy_vars!(
///     0x0051CA14 => rng_seed: u32;
///     0x0069A604 => ai_regions: [u32; 8];
/// );
/// assert_eq!(rng_seed.address(), 0x0051CA14);
/// assert_eq!(ai_regions.len(), 8);
/// ```
#[macro_export]
macro_rules! legacy_vars {
    () => {};
    ($addr:expr => $name:ident: [$ty:ty; $len:expr]; $($rest:tt)*) => {
        #[allow(non_upper_case_globals)]
        pub const $name: $crate::alias::LegacyArray<$ty, { $len }> =
            $crate::alias::LegacyArray::new($addr);
        $crate::legacy_vars!($($rest)*);
    };
    ($addr:expr => $name:ident: $ty:ty; $($rest:tt)*) => {
        #[allow(non_upper_case_globals)]
        pub const $name: $crate::alias::LegacyVar<$ty> = $crate::alias::LegacyVar::new($addr);
        $crate::legacy_vars!($($rest)*);
    };
}
