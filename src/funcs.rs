//! Typed wrappers for calling legacy functions.

/// Values that travel in a 32-bit register.
pub trait RegisterValue: Sized {
    fn to_register(self) -> u32;
    /// Narrower types take the low bits, same as reading `al` / `ax`.
    fn from_register(value: u32) -> Self;
}

macro_rules! int_register_value {
    ($($ty:ty),*) => {
        $(
            impl RegisterValue for $ty {
                #[inline]
                fn to_register(self) -> u32 {
                    self as u32
                }

                #[inline]
                fn from_register(value: u32) -> $ty {
                    value as $ty
                }
            }
        )*
    };
}

int_register_value!(u8, i8, u16, i16, u32, i32, usize, isize);

impl RegisterValue for bool {
    fn to_register(self) -> u32 {
        self as u32
    }

    /// Legacy code returns booleans in `al`, with garbage above it.
    fn from_register(value: u32) -> bool {
        value & 0xff != 0
    }
}

impl<T> RegisterValue for *mut T {
    fn to_register(self) -> u32 {
        self as usize as u32
    }

    fn from_register(value: u32) -> *mut T {
        value as usize as *mut T
    }
}

impl<T> RegisterValue for *const T {
    fn to_register(self) -> u32 {
        self as usize as u32
    }

    fn from_register(value: u32) -> *const T {
        value as usize as *const T
    }
}

impl RegisterValue for () {
    fn to_register(self) -> u32 {
        0
    }

    fn from_register(_value: u32) {}
}

/// Declares wrappers for legacy functions taking arguments in registers.
///
/// `0x0049C9F0 => get_region(@edi x: u32, @ecx y: u32) -> u32;` becomes
/// `unsafe fn get_region(ctx: &InteropContext<B>, x: u32, y: u32) -> u32`,
/// which calls `0x0049C9F0` with `edi = x, ecx = y` and returns `eax`.
/// Registers not named are left at the uninitialized sentinel.
/// Without `-> ty` the wrapper returns nothing.
#[macro_export]
macro_rules! legacy_funcs {
    () => {};
    ($addr:expr => $name:ident($(@$reg:ident $arg:ident: $ty:ty),* $(,)?) -> $ret:ty; $($rest:tt)*) => {
        #[allow(dead_code)]
        pub unsafe fn $name<B: $crate::backend::Backend>(
            ctx: &$crate::context::InteropContext<B>,
            $($arg: $ty),*
        ) -> $ret {
            #[allow(unused_mut)]
            let mut regs = $crate::registers::RegisterFrame::new();
            $(regs.$reg = $crate::funcs::RegisterValue::to_register($arg);)*
            ctx.call_with($addr, &mut regs);
            <$ret as $crate::funcs::RegisterValue>::from_register(regs.eax)
        }
        $crate::legacy_funcs!($($rest)*);
    };
    ($addr:expr => $name:ident($($args:tt)*); $($rest:tt)*) => {
        $crate::legacy_funcs!($addr => $name($($args)*) -> (); $($rest)*);
    };
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::config::InteropConfig;
    use crate::context::InteropContext;
    use crate::emulator::EmulatedBackend;

    legacy_funcs!(
        0x0040_1000 => add_coords(@edi x: u32, @ecx y: u32) -> u32;
        0x0040_1010 => store_unit(@esi unit: *mut u8, @eax value: u8);
        0x0040_1020 => is_negative(@edx value: i32) -> bool;
    );

    #[test]
    fn register_values() {
        assert_eq!((-1i32).to_register(), 0xffff_ffff);
        assert_eq!(i16::from_register(0x1234_fffe), -2);
        assert!(bool::from_register(0xcccc_cc01));
        assert!(!bool::from_register(0xcccc_cc00));
        assert_eq!(<*const u8>::from_register(0x0059_cca8) as usize, 0x0059_cca8);
    }

    #[test]
    fn wrappers() {
        let backend = EmulatedBackend::new();
        let mut code = vec![0xcc; 0x30];
        // lea eax, [edi + ecx]; ret
        code[0x00..0x04].copy_from_slice(&[0x8d, 0x04, 0x0f, 0xc3]);
        // mov [esi], al; ret
        code[0x10..0x13].copy_from_slice(&[0x88, 0x06, 0xc3]);
        // test edx, edx; sets al; ret
        code[0x20..0x26].copy_from_slice(&[0x85, 0xd2, 0x0f, 0x98, 0xc0, 0xc3]);
        backend.load_image(0x0040_1000, &code).unwrap();
        backend.map_region(0x0060_0000, 0x1000).unwrap();
        let ctx = InteropContext::new(backend, InteropConfig::default()).unwrap();
        unsafe {
            assert_eq!(add_coords(&ctx, 40, 2), 42);
            store_unit(&ctx, 0x0060_0010 as *mut u8, 0x77);
            assert!(is_negative(&ctx, -5));
            assert!(!is_negative(&ctx, 5));
        }
        let mut out = [0u8; 1];
        unsafe {
            ctx.read_memory(0x0060_0010, &mut out);
        }
        assert_eq!(out[0], 0x77);
    }
}
