//! Register state used by the legacy calling convention.

use std::fmt;

/// Value every slot of a fresh frame holds, so reads of registers nobody
/// wrote stand out.
pub const UNINIT_SENTINEL: u32 = 0xcccc_cccc;

/// The seven general purpose registers the legacy code passes values in.
///
/// Field order is the memory layout generated code relies on:
/// eax, ebx, ecx, edx, esi, edi, ebp at offsets 0, 4, .., 0x18.
#[repr(C)]
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct RegisterFrame {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Reg {
    A,
    B,
    C,
    D,
    Si,
    Di,
    Bp,
}

impl Reg {
    pub const ALL: [Reg; 7] = [Reg::A, Reg::B, Reg::C, Reg::D, Reg::Si, Reg::Di, Reg::Bp];

    /// Offset of the slot inside `RegisterFrame`.
    pub fn frame_offset(self) -> u32 {
        self as u32 * 4
    }

    /// Register number in ModRM encoding.
    pub fn encoding(self) -> u8 {
        match self {
            Reg::A => 0,
            Reg::C => 1,
            Reg::D => 2,
            Reg::B => 3,
            Reg::Bp => 5,
            Reg::Si => 6,
            Reg::Di => 7,
        }
    }
}

impl RegisterFrame {
    pub const SIZE: usize = 0x1c;

    pub const fn new() -> RegisterFrame {
        RegisterFrame {
            eax: UNINIT_SENTINEL,
            ebx: UNINIT_SENTINEL,
            ecx: UNINIT_SENTINEL,
            edx: UNINIT_SENTINEL,
            esi: UNINIT_SENTINEL,
            edi: UNINIT_SENTINEL,
            ebp: UNINIT_SENTINEL,
        }
    }

    fn slot(&self, reg: Reg) -> &u32 {
        match reg {
            Reg::A => &self.eax,
            Reg::B => &self.ebx,
            Reg::C => &self.ecx,
            Reg::D => &self.edx,
            Reg::Si => &self.esi,
            Reg::Di => &self.edi,
            Reg::Bp => &self.ebp,
        }
    }

    fn slot_mut(&mut self, reg: Reg) -> &mut u32 {
        match reg {
            Reg::A => &mut self.eax,
            Reg::B => &mut self.ebx,
            Reg::C => &mut self.ecx,
            Reg::D => &mut self.edx,
            Reg::Si => &mut self.esi,
            Reg::Di => &mut self.edi,
            Reg::Bp => &mut self.ebp,
        }
    }

    #[inline]
    pub fn get32(&self, reg: Reg) -> u32 {
        *self.slot(reg)
    }

    #[inline]
    pub fn set32(&mut self, reg: Reg, value: u32) {
        *self.slot_mut(reg) = value;
    }

    #[inline]
    pub fn get16(&self, reg: Reg) -> u16 {
        *self.slot(reg) as u16
    }

    /// Replaces the low word, upper half stays as it was (same as `mov ax, ..`).
    #[inline]
    pub fn set16(&mut self, reg: Reg, value: u16) {
        let slot = self.slot_mut(reg);
        *slot = (*slot & 0xffff_0000) | value as u32;
    }

    /// `al`, `bl`, ... Only meaningful for A-D, but like the rest of the views
    /// it reads whatever is stored for the other slots too.
    #[inline]
    pub fn get_byte_low(&self, reg: Reg) -> u8 {
        *self.slot(reg) as u8
    }

    #[inline]
    pub fn set_byte_low(&mut self, reg: Reg, value: u8) {
        let slot = self.slot_mut(reg);
        *slot = (*slot & 0xffff_ff00) | value as u32;
    }

    /// `ah`, `bh`, ...
    #[inline]
    pub fn get_byte_high(&self, reg: Reg) -> u8 {
        (*self.slot(reg) >> 8) as u8
    }

    #[inline]
    pub fn set_byte_high(&mut self, reg: Reg, value: u8) {
        let slot = self.slot_mut(reg);
        *slot = (*slot & 0xffff_00ff) | ((value as u32) << 8);
    }

    pub fn to_bytes(&self) -> [u8; RegisterFrame::SIZE] {
        let mut out = [0u8; RegisterFrame::SIZE];
        for (chunk, &reg) in out.chunks_exact_mut(4).zip(Reg::ALL.iter()) {
            chunk.copy_from_slice(&self.get32(reg).to_le_bytes());
        }
        out
    }
}

impl Default for RegisterFrame {
    fn default() -> RegisterFrame {
        RegisterFrame::new()
    }
}

impl fmt::Debug for RegisterFrame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "eax={:08x} ebx={:08x} ecx={:08x} edx={:08x} esi={:08x} edi={:08x} ebp={:08x}",
            self.eax, self.ebx, self.ecx, self.edx, self.esi, self.edi, self.ebp,
        )
    }
}

/// Condition flags in `lahf` layout.
#[derive(Copy, Clone, Eq, PartialEq, Default)]
pub struct FlagsByte(u8);

impl FlagsByte {
    pub const CARRY: u8 = 0x1;
    pub const PARITY: u8 = 0x4;
    pub const ADJUST: u8 = 0x10;
    pub const ZERO: u8 = 0x40;
    pub const SIGN: u8 = 0x80;
    pub const MASK: u8 = FlagsByte::CARRY |
        FlagsByte::PARITY |
        FlagsByte::ADJUST |
        FlagsByte::ZERO |
        FlagsByte::SIGN;

    /// Takes the low byte of a flags value (or `ah` after `lahf` shifted down)
    /// and drops every bit that isn't one of the five condition flags.
    pub fn from_raw(raw: u32) -> FlagsByte {
        FlagsByte(raw as u8 & FlagsByte::MASK)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn carry(self) -> bool {
        self.0 & FlagsByte::CARRY != 0
    }

    pub fn parity(self) -> bool {
        self.0 & FlagsByte::PARITY != 0
    }

    pub fn adjust(self) -> bool {
        self.0 & FlagsByte::ADJUST != 0
    }

    pub fn zero(self) -> bool {
        self.0 & FlagsByte::ZERO != 0
    }

    pub fn sign(self) -> bool {
        self.0 & FlagsByte::SIGN != 0
    }
}

impl fmt::Debug for FlagsByte {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let names = [
            (FlagsByte::CARRY, "CF"),
            (FlagsByte::PARITY, "PF"),
            (FlagsByte::ADJUST, "AF"),
            (FlagsByte::ZERO, "ZF"),
            (FlagsByte::SIGN, "SF"),
        ];
        write!(f, "FlagsByte({:02x}", self.0)?;
        for &(bit, name) in &names {
            if self.0 & bit != 0 {
                write!(f, " {}", name)?;
            }
        }
        write!(f, ")")
    }
}

#[test]
fn test_sizes() {
    use std::mem;
    assert_eq!(mem::size_of::<RegisterFrame>(), 28);
    assert_eq!(mem::size_of::<RegisterFrame>(), RegisterFrame::SIZE);
    assert_eq!(mem::offset_of!(RegisterFrame, ebp), 0x18);
    assert_eq!(mem::offset_of!(RegisterFrame, esi), Reg::Si.frame_offset() as usize);
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sentinel() {
        let regs = RegisterFrame::new();
        for &reg in &Reg::ALL {
            assert_eq!(regs.get32(reg), 0xcccc_cccc);
        }
        assert_eq!(RegisterFrame::default(), regs);
    }

    #[test]
    fn sub_register_views() {
        let mut regs = RegisterFrame::new();
        for (i, &reg) in Reg::ALL.iter().enumerate() {
            let value = 0x1234 + i as u16 * 0x101;
            regs.set16(reg, value);
            assert_eq!(regs.get32(reg) & 0xffff, value as u32);
            assert_eq!(regs.get32(reg) >> 16, 0xcccc);
            let composed =
                ((regs.get_byte_high(reg) as u16) << 8) | regs.get_byte_low(reg) as u16;
            assert_eq!(composed, regs.get16(reg));
        }
        regs.set32(Reg::D, 0xdead_beef);
        regs.set_byte_high(Reg::D, 0x12);
        assert_eq!(regs.edx, 0xdead_12ef);
        regs.set_byte_low(Reg::D, 0x34);
        assert_eq!(regs.edx, 0xdead_1234);
    }

    #[test]
    fn frame_bytes() {
        let mut regs = RegisterFrame::new();
        regs.eax = 0x0403_0201;
        regs.ebp = 0x8070_6050;
        let bytes = regs.to_bytes();
        assert_eq!(&bytes[..4], &[1, 2, 3, 4]);
        assert_eq!(&bytes[0x18..], &[0x50, 0x60, 0x70, 0x80]);
        assert_eq!(&bytes[4..8], &[0xcc; 4]);
    }

    #[test]
    fn flags_masking() {
        // Bit 1 is always set by lahf, bits 3 and 5 are reserved
        let flags = FlagsByte::from_raw(0xffff_ff2b);
        assert_eq!(flags.bits(), 0x01);
        assert!(flags.carry());
        assert!(!flags.zero());
        let flags = FlagsByte::from_raw(0xd7);
        assert_eq!(flags.bits(), 0xd5);
        assert!(flags.sign() && flags.zero() && flags.adjust() && flags.parity());
    }
}
