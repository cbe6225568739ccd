//! x86-32 interpreter for the integer subset legacy leaf routines and the
//! generated sequences use.

use std::io;

use iced_x86::{Decoder, DecoderOptions, Instruction, MemorySize, Mnemonic, OpKind, Register};
use quick_error::quick_error;

use crate::registers::{Reg, RegisterFrame};

use super::GuestMemory;

pub const CARRY: u32 = 0x1;
pub const RESERVED: u32 = 0x2;
pub const PARITY: u32 = 0x4;
pub const ADJUST: u32 = 0x10;
pub const ZERO: u32 = 0x40;
pub const SIGN: u32 = 0x80;
pub const DIRECTION: u32 = 0x400;
pub const OVERFLOW: u32 = 0x800;
/// Bits `sahf` / `lahf` transfer.
pub const AH_FLAGS: u32 = CARRY | PARITY | ADJUST | ZERO | SIGN;
const STATUS_FLAGS: u32 = AH_FLAGS | OVERFLOW;
const POPFD_MASK: u32 = STATUS_FLAGS | DIRECTION;

const ESP: usize = 4;
const MAX_INSTRUCTION_LEN: usize = 15;

quick_error! {
    #[derive(Debug)]
    pub enum Fault {
        Memory(e: io::Error) {
            display("Memory fault: {}", e)
            from()
        }
        Decode(eip: u32) {
            display("Invalid instruction at {:08x}", eip)
        }
        Unsupported(eip: u32, text: String) {
            display("Unsupported instruction at {:08x}: {}", eip, text)
        }
    }
}

/// What the caller has to do after a step.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Event {
    Continue,
    /// `int n` executed, `eip` is already past it.
    Interrupt(u8),
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum Width {
    Byte,
    Word,
    Dword,
}

impl Width {
    fn bits(self) -> u32 {
        match self {
            Width::Byte => 8,
            Width::Word => 16,
            Width::Dword => 32,
        }
    }

    fn mask(self) -> u32 {
        match self {
            Width::Byte => 0xff,
            Width::Word => 0xffff,
            Width::Dword => 0xffff_ffff,
        }
    }

    fn sign(self) -> u32 {
        1 << (self.bits() - 1)
    }

    fn sign_extend(self, value: u32) -> u32 {
        match self {
            Width::Byte => value as u8 as i8 as i32 as u32,
            Width::Word => value as u16 as i16 as i32 as u32,
            Width::Dword => value,
        }
    }
}

#[derive(Copy, Clone, Debug)]
enum Operand {
    /// `shift` is 8 for ah/bh/ch/dh.
    Reg { index: usize, shift: u32, width: Width },
    Mem { address: u32, width: Width },
    Imm { value: u32, width: Width },
}

impl Operand {
    fn width(self) -> Width {
        match self {
            Operand::Reg { width, .. } |
                Operand::Mem { width, .. } |
                Operand::Imm { width, .. } => width,
        }
    }
}

/// Register index in `Cpu::regs` (ModRM order), with the sub-register view.
fn register(reg: Register) -> Option<Operand> {
    let (index, shift, width) = match reg {
        Register::EAX => (0, 0, Width::Dword),
        Register::ECX => (1, 0, Width::Dword),
        Register::EDX => (2, 0, Width::Dword),
        Register::EBX => (3, 0, Width::Dword),
        Register::ESP => (4, 0, Width::Dword),
        Register::EBP => (5, 0, Width::Dword),
        Register::ESI => (6, 0, Width::Dword),
        Register::EDI => (7, 0, Width::Dword),
        Register::AX => (0, 0, Width::Word),
        Register::CX => (1, 0, Width::Word),
        Register::DX => (2, 0, Width::Word),
        Register::BX => (3, 0, Width::Word),
        Register::SP => (4, 0, Width::Word),
        Register::BP => (5, 0, Width::Word),
        Register::SI => (6, 0, Width::Word),
        Register::DI => (7, 0, Width::Word),
        Register::AL => (0, 0, Width::Byte),
        Register::CL => (1, 0, Width::Byte),
        Register::DL => (2, 0, Width::Byte),
        Register::BL => (3, 0, Width::Byte),
        Register::AH => (0, 8, Width::Byte),
        Register::CH => (1, 8, Width::Byte),
        Register::DH => (2, 8, Width::Byte),
        Register::BH => (3, 8, Width::Byte),
        _ => return None,
    };
    Some(Operand::Reg { index, shift, width })
}

fn memory_width(size: MemorySize) -> Width {
    match size {
        MemorySize::UInt8 | MemorySize::Int8 => Width::Byte,
        MemorySize::UInt16 | MemorySize::Int16 => Width::Word,
        // Everything else the supported instructions access is a dword
        _ => Width::Dword,
    }
}

fn parity(value: u32) -> bool {
    (value as u8).count_ones() % 2 == 0
}

#[derive(Clone, Debug)]
pub struct Cpu {
    /// eax, ecx, edx, ebx, esp, ebp, esi, edi
    pub regs: [u32; 8],
    pub eip: u32,
    pub eflags: u32,
}

impl Cpu {
    pub fn new(eip: u32, esp: u32) -> Cpu {
        let mut regs = [0; 8];
        regs[ESP] = esp;
        Cpu {
            regs,
            eip,
            eflags: RESERVED,
        }
    }

    pub fn esp(&self) -> u32 {
        self.regs[ESP]
    }

    pub fn load_frame(&mut self, frame: &RegisterFrame) {
        for &reg in &Reg::ALL {
            self.regs[reg.encoding() as usize] = frame.get32(reg);
        }
    }

    pub fn store_frame(&self, frame: &mut RegisterFrame) {
        for &reg in &Reg::ALL {
            frame.set32(reg, self.regs[reg.encoding() as usize]);
        }
    }

    /// `ah` as `lahf` would set it.
    pub fn lahf_byte(&self) -> u8 {
        ((self.eflags & AH_FLAGS) | RESERVED) as u8
    }

    /// Replaces the five `ah` flags as `sahf` would.
    pub fn sahf_byte(&mut self, value: u8) {
        self.eflags = (self.eflags & !AH_FLAGS) | (value as u32 & AH_FLAGS);
    }

    pub fn push(&mut self, mem: &mut GuestMemory, value: u32) -> Result<(), Fault> {
        let esp = self.regs[ESP].wrapping_sub(4);
        mem.write_u32(esp, value)?;
        self.regs[ESP] = esp;
        Ok(())
    }

    pub fn pop(&mut self, mem: &GuestMemory) -> Result<u32, Fault> {
        let value = mem.read_u32(self.regs[ESP])?;
        self.regs[ESP] = self.regs[ESP].wrapping_add(4);
        Ok(value)
    }

    pub fn step(&mut self, mem: &mut GuestMemory) -> Result<Event, Fault> {
        let mut bytes = [0u8; MAX_INSTRUCTION_LEN];
        let len = mem.fetch(self.eip, &mut bytes)?;
        let mut decoder =
            Decoder::with_ip(32, &bytes[..len], self.eip as u64, DecoderOptions::NONE);
        let ins = decoder.decode();
        if ins.is_invalid() {
            return Err(Fault::Decode(self.eip));
        }
        self.eip = ins.next_ip32();
        self.execute(&ins, mem)
    }

    fn unsupported(&self, ins: &Instruction) -> Fault {
        Fault::Unsupported(ins.ip32(), ins.to_string())
    }

    fn reg32(&self, ins: &Instruction, reg: Register) -> Result<u32, Fault> {
        match register(reg) {
            Some(Operand::Reg { index, width: Width::Dword, .. }) => Ok(self.regs[index]),
            _ => Err(self.unsupported(ins)),
        }
    }

    fn effective_address(&self, ins: &Instruction) -> Result<u32, Fault> {
        if matches!(ins.segment_prefix(), Register::FS | Register::GS) {
            return Err(self.unsupported(ins));
        }
        let mut address = ins.memory_displacement32();
        if ins.memory_base() != Register::None {
            address = address.wrapping_add(self.reg32(ins, ins.memory_base())?);
        }
        if ins.memory_index() != Register::None {
            let index = self.reg32(ins, ins.memory_index())?;
            address = address.wrapping_add(index.wrapping_mul(ins.memory_index_scale()));
        }
        Ok(address)
    }

    fn operand(&self, ins: &Instruction, op: u32) -> Result<Operand, Fault> {
        Ok(match ins.op_kind(op) {
            OpKind::Register => {
                register(ins.op_register(op)).ok_or_else(|| self.unsupported(ins))?
            }
            OpKind::Memory => Operand::Mem {
                address: self.effective_address(ins)?,
                width: memory_width(ins.memory_size()),
            },
            OpKind::Immediate8 => Operand::Imm {
                value: ins.immediate8() as u32,
                width: Width::Byte,
            },
            OpKind::Immediate16 => Operand::Imm {
                value: ins.immediate16() as u32,
                width: Width::Word,
            },
            OpKind::Immediate32 => Operand::Imm {
                value: ins.immediate32(),
                width: Width::Dword,
            },
            OpKind::Immediate8to16 => Operand::Imm {
                value: ins.immediate8to16() as u16 as u32,
                width: Width::Word,
            },
            OpKind::Immediate8to32 => Operand::Imm {
                value: ins.immediate8to32() as u32,
                width: Width::Dword,
            },
            _ => return Err(self.unsupported(ins)),
        })
    }

    fn read(&self, mem: &GuestMemory, op: Operand) -> Result<u32, Fault> {
        Ok(match op {
            Operand::Reg { index, shift, width } => (self.regs[index] >> shift) & width.mask(),
            Operand::Mem { address, width } => match width {
                Width::Byte => mem.read_u8(address)? as u32,
                Width::Word => mem.read_u16(address)? as u32,
                Width::Dword => mem.read_u32(address)?,
            },
            Operand::Imm { value, width } => value & width.mask(),
        })
    }

    fn write(
        &mut self,
        mem: &mut GuestMemory,
        ins: &Instruction,
        op: Operand,
        value: u32,
    ) -> Result<(), Fault> {
        match op {
            Operand::Reg { index, shift, width } => {
                let mask = width.mask() << shift;
                self.regs[index] = (self.regs[index] & !mask) | ((value << shift) & mask);
            }
            Operand::Mem { address, width } => match width {
                Width::Byte => mem.write_u8(address, value as u8)?,
                Width::Word => mem.write_u16(address, value as u16)?,
                Width::Dword => mem.write_u32(address, value)?,
            },
            Operand::Imm { .. } => return Err(self.unsupported(ins)),
        }
        Ok(())
    }

    fn branch_target(&self, mem: &GuestMemory, ins: &Instruction) -> Result<u32, Fault> {
        match ins.op0_kind() {
            OpKind::NearBranch32 => Ok(ins.near_branch32()),
            _ => {
                let op = self.operand(ins, 0)?;
                self.read(mem, op)
            }
        }
    }

    fn flag(&self, bit: u32) -> bool {
        self.eflags & bit != 0
    }

    fn set_flag(&mut self, bit: u32, value: bool) {
        if value {
            self.eflags |= bit;
        } else {
            self.eflags &= !bit;
        }
    }

    fn set_result_flags(
        &mut self,
        result: u32,
        width: Width,
        carry: bool,
        overflow: bool,
        adjust: bool,
    ) {
        self.eflags &= !STATUS_FLAGS;
        self.set_flag(CARRY, carry);
        self.set_flag(OVERFLOW, overflow);
        self.set_flag(ADJUST, adjust);
        self.set_flag(ZERO, result & width.mask() == 0);
        self.set_flag(SIGN, result & width.sign() != 0);
        self.set_flag(PARITY, parity(result));
    }

    /// Condition of a jcc or setcc.
    fn condition(&self, mnemonic: Mnemonic) -> Option<bool> {
        let cf = self.flag(CARRY);
        let zf = self.flag(ZERO);
        let sf = self.flag(SIGN);
        let of = self.flag(OVERFLOW);
        let pf = self.flag(PARITY);
        Some(match mnemonic {
            Mnemonic::Jo | Mnemonic::Seto => of,
            Mnemonic::Jno | Mnemonic::Setno => !of,
            Mnemonic::Jb | Mnemonic::Setb => cf,
            Mnemonic::Jae | Mnemonic::Setae => !cf,
            Mnemonic::Je | Mnemonic::Sete => zf,
            Mnemonic::Jne | Mnemonic::Setne => !zf,
            Mnemonic::Jbe | Mnemonic::Setbe => cf || zf,
            Mnemonic::Ja | Mnemonic::Seta => !cf && !zf,
            Mnemonic::Js | Mnemonic::Sets => sf,
            Mnemonic::Jns | Mnemonic::Setns => !sf,
            Mnemonic::Jp | Mnemonic::Setp => pf,
            Mnemonic::Jnp | Mnemonic::Setnp => !pf,
            Mnemonic::Jl | Mnemonic::Setl => sf != of,
            Mnemonic::Jge | Mnemonic::Setge => sf == of,
            Mnemonic::Jle | Mnemonic::Setle => zf || sf != of,
            Mnemonic::Jg | Mnemonic::Setg => !zf && sf == of,
            Mnemonic::Jecxz => self.regs[1] == 0,
            _ => return None,
        })
    }

    /// Add/sub/logic ops, returns the result and updates flags.
    fn arith(&mut self, mnemonic: Mnemonic, a: u32, b: u32, width: Width) -> u32 {
        let mask = width.mask() as u64;
        let sign = width.sign();
        let carry_in = (self.eflags & CARRY) as u64;
        match mnemonic {
            Mnemonic::Add | Mnemonic::Adc => {
                let carry_in = if mnemonic == Mnemonic::Adc { carry_in } else { 0 };
                let full = a as u64 + b as u64 + carry_in;
                let result = (full & mask) as u32;
                let overflow = (a ^ result) & (b ^ result) & sign != 0;
                let adjust = (a ^ b ^ result) & 0x10 != 0;
                self.set_result_flags(result, width, full > mask, overflow, adjust);
                result
            }
            Mnemonic::Sub | Mnemonic::Sbb | Mnemonic::Cmp => {
                let borrow_in = if mnemonic == Mnemonic::Sbb { carry_in } else { 0 };
                let subtrahend = b as u64 + borrow_in;
                let result = ((a as u64).wrapping_sub(subtrahend) & mask) as u32;
                let overflow = (a ^ b) & (a ^ result) & sign != 0;
                let adjust = (a ^ b ^ result) & 0x10 != 0;
                self.set_result_flags(result, width, (a as u64) < subtrahend, overflow, adjust);
                result
            }
            _ => {
                let result = match mnemonic {
                    Mnemonic::Or => a | b,
                    Mnemonic::Xor => a ^ b,
                    _ => a & b,
                };
                self.set_result_flags(result, width, false, false, false);
                result
            }
        }
    }

    /// Shifts and rotates. A count of zero changes nothing, flags included.
    fn shift(&mut self, mnemonic: Mnemonic, a: u32, count: u32, width: Width) -> u32 {
        let count = count & 0x1f;
        if count == 0 {
            return a;
        }
        let bits = width.bits();
        let mask = width.mask() as u64;
        let sign = width.sign();
        let a64 = a as u64;
        match mnemonic {
            Mnemonic::Rol | Mnemonic::Ror => {
                let rotate = count % bits;
                let rotated = if mnemonic == Mnemonic::Rol {
                    (a64 << rotate) | (a64 >> (bits - rotate))
                } else {
                    (a64 >> rotate) | (a64 << (bits - rotate))
                };
                let result = (rotated & mask) as u32;
                let (carry, overflow) = if mnemonic == Mnemonic::Rol {
                    let carry = result & 1 != 0;
                    (carry, (result & sign != 0) != carry)
                } else {
                    let msb = result & sign != 0;
                    (msb, msb != (result & (sign >> 1) != 0))
                };
                // Rotates only touch CF and OF
                self.set_flag(CARRY, carry);
                self.set_flag(OVERFLOW, overflow);
                result
            }
            _ => {
                let (result, carry, overflow) = match mnemonic {
                    Mnemonic::Shr => {
                        let result = (a64 >> count) as u32;
                        (result, (a64 >> (count - 1)) & 1 != 0, a & sign != 0)
                    }
                    Mnemonic::Sar => {
                        let signed = width.sign_extend(a) as i32 as i64;
                        let result = ((signed >> count) as u64 & mask) as u32;
                        (result, (signed >> (count - 1)) & 1 != 0, false)
                    }
                    _ => {
                        let full = a64 << count;
                        let result = (full & mask) as u32;
                        let carry = (full >> bits) & 1 != 0;
                        (result, carry, (result & sign != 0) != carry)
                    }
                };
                self.set_result_flags(result, width, carry, overflow, false);
                result
            }
        }
    }

    fn execute(&mut self, ins: &Instruction, mem: &mut GuestMemory) -> Result<Event, Fault> {
        match ins.mnemonic() {
            Mnemonic::Nop => (),
            Mnemonic::Mov | Mnemonic::Movzx => {
                let src = self.operand(ins, 1)?;
                let value = self.read(mem, src)?;
                let dest = self.operand(ins, 0)?;
                self.write(mem, ins, dest, value)?;
            }
            Mnemonic::Movsx => {
                let src = self.operand(ins, 1)?;
                let value = src.width().sign_extend(self.read(mem, src)?);
                let dest = self.operand(ins, 0)?;
                self.write(mem, ins, dest, value)?;
            }
            Mnemonic::Lea => {
                let address = self.effective_address(ins)?;
                let dest = self.operand(ins, 0)?;
                self.write(mem, ins, dest, address)?;
            }
            Mnemonic::Xchg => {
                let a = self.operand(ins, 0)?;
                let b = self.operand(ins, 1)?;
                let a_value = self.read(mem, a)?;
                let b_value = self.read(mem, b)?;
                self.write(mem, ins, a, b_value)?;
                self.write(mem, ins, b, a_value)?;
            }
            Mnemonic::Push => {
                let src = self.operand(ins, 0)?;
                let value = self.read(mem, src)?;
                self.push(mem, value)?;
            }
            Mnemonic::Pop => {
                let value = self.pop(mem)?;
                // Operand address is computed with the incremented esp
                let dest = self.operand(ins, 0)?;
                self.write(mem, ins, dest, value)?;
            }
            Mnemonic::Pushfd => {
                let flags = self.eflags;
                self.push(mem, flags)?;
            }
            Mnemonic::Popfd => {
                let value = self.pop(mem)?;
                self.eflags = (value & POPFD_MASK) | RESERVED;
            }
            Mnemonic::Lahf => {
                let value = self.lahf_byte() as u32;
                self.regs[0] = (self.regs[0] & !0xff00) | (value << 8);
            }
            Mnemonic::Sahf => {
                let ah = (self.regs[0] >> 8) as u8;
                self.sahf_byte(ah);
            }
            Mnemonic::Stc => self.set_flag(CARRY, true),
            Mnemonic::Clc => self.set_flag(CARRY, false),
            Mnemonic::Cmc => {
                let carry = self.flag(CARRY);
                self.set_flag(CARRY, !carry);
            }
            Mnemonic::Cld => self.set_flag(DIRECTION, false),
            Mnemonic::Std => self.set_flag(DIRECTION, true),
            Mnemonic::Cdq => {
                self.regs[2] = if self.regs[0] & 0x8000_0000 != 0 { 0xffff_ffff } else { 0 };
            }
            Mnemonic::Call => {
                let target = self.branch_target(mem, ins)?;
                let ret = self.eip;
                self.push(mem, ret)?;
                self.eip = target;
            }
            Mnemonic::Jmp => {
                self.eip = self.branch_target(mem, ins)?;
            }
            Mnemonic::Ret => {
                let ret = self.pop(mem)?;
                if ins.op_count() == 1 {
                    self.regs[ESP] = self.regs[ESP].wrapping_add(ins.immediate16() as u32);
                }
                self.eip = ret;
            }
            Mnemonic::Int => return Ok(Event::Interrupt(ins.immediate8())),
            Mnemonic::Int3 => return Ok(Event::Interrupt(3)),
            Mnemonic::Add | Mnemonic::Adc | Mnemonic::Sub | Mnemonic::Sbb | Mnemonic::And |
                Mnemonic::Or | Mnemonic::Xor | Mnemonic::Cmp | Mnemonic::Test =>
            {
                let dest = self.operand(ins, 0)?;
                let src = self.operand(ins, 1)?;
                let width = dest.width();
                let a = self.read(mem, dest)?;
                let b = self.read(mem, src)? & width.mask();
                let result = self.arith(ins.mnemonic(), a, b, width);
                if !matches!(ins.mnemonic(), Mnemonic::Cmp | Mnemonic::Test) {
                    self.write(mem, ins, dest, result)?;
                }
            }
            Mnemonic::Inc | Mnemonic::Dec => {
                let dest = self.operand(ins, 0)?;
                let a = self.read(mem, dest)?;
                let carry = self.flag(CARRY);
                let op = match ins.mnemonic() {
                    Mnemonic::Inc => Mnemonic::Add,
                    _ => Mnemonic::Sub,
                };
                let result = self.arith(op, a, 1, dest.width());
                self.set_flag(CARRY, carry);
                self.write(mem, ins, dest, result)?;
            }
            Mnemonic::Neg => {
                let dest = self.operand(ins, 0)?;
                let a = self.read(mem, dest)?;
                let result = self.arith(Mnemonic::Sub, 0, a, dest.width());
                self.write(mem, ins, dest, result)?;
            }
            Mnemonic::Not => {
                let dest = self.operand(ins, 0)?;
                let a = self.read(mem, dest)?;
                self.write(mem, ins, dest, !a & dest.width().mask())?;
            }
            Mnemonic::Shl | Mnemonic::Sal | Mnemonic::Shr | Mnemonic::Sar | Mnemonic::Rol |
                Mnemonic::Ror =>
            {
                let dest = self.operand(ins, 0)?;
                let count = self.operand(ins, 1)?;
                let a = self.read(mem, dest)?;
                let count = self.read(mem, count)?;
                let result = self.shift(ins.mnemonic(), a, count, dest.width());
                self.write(mem, ins, dest, result)?;
            }
            other => match self.condition(other) {
                Some(taken) => {
                    if ins.op0_kind() == OpKind::NearBranch32 {
                        if taken {
                            self.eip = ins.near_branch32();
                        }
                    } else {
                        let dest = self.operand(ins, 0)?;
                        self.write(mem, ins, dest, taken as u32)?;
                    }
                }
                None => return Err(self.unsupported(ins)),
            },
        }
        Ok(Event::Continue)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const CODE: u32 = 0x1000;
    const STACK_TOP: u32 = 0x9000;
    const RETURN: u32 = 0xfffe_0000;

    fn run(code: &[u8]) -> Cpu {
        let mut mem = GuestMemory::new();
        mem.load_image(CODE, code).unwrap();
        mem.map(STACK_TOP - 0x1000, 0x1000).unwrap();
        let mut cpu = Cpu::new(CODE, STACK_TOP);
        cpu.push(&mut mem, RETURN).unwrap();
        while cpu.eip != RETURN {
            assert_eq!(cpu.step(&mut mem).unwrap(), Event::Continue);
        }
        assert_eq!(cpu.esp(), STACK_TOP);
        cpu
    }

    #[test]
    fn add_flags() {
        let cpu = run(&[
            0xb8, 0xff, 0xff, 0xff, 0x7f, // mov eax, 7fffffff
            0x83, 0xc0, 0x01, // add eax, 1
            0xc3,
        ]);
        assert_eq!(cpu.regs[0], 0x8000_0000);
        assert_eq!(cpu.eflags & STATUS_FLAGS, OVERFLOW | SIGN | ADJUST | PARITY);

        let cpu = run(&[
            0xb8, 0x05, 0x00, 0x00, 0x00, // mov eax, 5
            0x83, 0xc0, 0xfb, // add eax, -5
            0xc3,
        ]);
        assert_eq!(cpu.regs[0], 0);
        assert_eq!(cpu.eflags & STATUS_FLAGS, CARRY | ZERO | ADJUST | PARITY);
    }

    #[test]
    fn sub_borrow() {
        let cpu = run(&[
            0xb8, 0x01, 0x00, 0x00, 0x00, // mov eax, 1
            0x83, 0xe8, 0x02, // sub eax, 2
            0xc3,
        ]);
        assert_eq!(cpu.regs[0], 0xffff_ffff);
        assert!(cpu.flag(CARRY));
        assert!(cpu.flag(SIGN));
        assert!(!cpu.flag(OVERFLOW));
        assert!(!cpu.flag(ZERO));
    }

    #[test]
    fn sub_registers() {
        let cpu = run(&[
            0xb8, 0x78, 0x56, 0x34, 0x12, // mov eax, 12345678
            0xb4, 0xab, // mov ah, ab
            0x0f, 0xb6, 0xcc, // movzx ecx, ah
            0x0f, 0xbe, 0xd4, // movsx edx, ah
            0xc3,
        ]);
        assert_eq!(cpu.regs[0], 0x1234_ab78);
        assert_eq!(cpu.regs[1], 0xab);
        assert_eq!(cpu.regs[2], 0xffff_ffab);
    }

    #[test]
    fn call_and_loop() {
        let cpu = run(&[
            0xe8, 0x01, 0x00, 0x00, 0x00, // call 1006
            0xc3,
            0xb9, 0x05, 0x00, 0x00, 0x00, // mov ecx, 5
            0x31, 0xc0, // xor eax, eax
            0x01, 0xc8, // add eax, ecx
            0x49, // dec ecx
            0x75, 0xfb, // jne add
            0xc3,
        ]);
        assert_eq!(cpu.regs[0], 15);
        assert_eq!(cpu.regs[1], 0);
    }

    #[test]
    fn shifts() {
        let cpu = run(&[
            0xb8, 0x81, 0x00, 0x00, 0x00, // mov eax, 81
            0xd0, 0xe0, // shl al, 1
            0xc3,
        ]);
        assert_eq!(cpu.regs[0], 0x02);
        assert!(cpu.flag(CARRY));
        assert!(cpu.flag(OVERFLOW));

        let cpu = run(&[
            0xb8, 0x00, 0x00, 0x00, 0x80, // mov eax, 80000000
            0xc1, 0xf8, 0x04, // sar eax, 4
            0xc3,
        ]);
        assert_eq!(cpu.regs[0], 0xf800_0000);
        assert!(!cpu.flag(CARRY));

        let cpu = run(&[
            0xb8, 0x00, 0x00, 0x00, 0xf8, // mov eax, f8000000
            0xc1, 0xe8, 0x1c, // shr eax, 1c
            0xc3,
        ]);
        assert_eq!(cpu.regs[0], 0xf);
        assert!(cpu.flag(CARRY));
    }

    #[test]
    fn ah_flags() {
        let cpu = run(&[
            0xf9, // stc
            0x9f, // lahf
            0x88, 0xe1, // mov cl, ah
            0xb4, 0x40, // mov ah, 40
            0x9e, // sahf
            0xc3,
        ]);
        assert_eq!(cpu.regs[1] & 0xff, 0x03);
        assert!(!cpu.flag(CARRY));
        assert!(cpu.flag(ZERO));
        assert_eq!(cpu.lahf_byte(), 0x42);
    }

    #[test]
    fn memory_operands() {
        let cpu = run(&[
            0x68, 0x44, 0x33, 0x22, 0x11, // push 11223344
            0x8b, 0x04, 0x24, // mov eax, [esp]
            0xff, 0x34, 0x24, // push dword [esp]
            0xc7, 0x44, 0x24, 0x04, 0x01, 0x00, 0x00, 0x00, // mov dword [esp + 4], 1
            0x5b, // pop ebx
            0x59, // pop ecx
            0x8d, 0x54, 0x24, 0x08, // lea edx, [esp + 8]
            0xc3,
        ]);
        assert_eq!(cpu.regs[0], 0x1122_3344);
        assert_eq!(cpu.regs[3], 0x1122_3344);
        assert_eq!(cpu.regs[1], 1);
        assert_eq!(cpu.regs[2], STACK_TOP + 4);
    }

    #[test]
    fn interrupts_and_faults() {
        let mut mem = GuestMemory::new();
        mem.load_image(CODE, &[0xcd, 0x2e, 0x0f, 0xa2]).unwrap();
        mem.map(STACK_TOP - 0x1000, 0x1000).unwrap();
        let mut cpu = Cpu::new(CODE, STACK_TOP);
        assert_eq!(cpu.step(&mut mem).unwrap(), Event::Interrupt(0x2e));
        assert_eq!(cpu.eip, CODE + 2);
        // cpuid
        match cpu.step(&mut mem) {
            Err(Fault::Unsupported(eip, _)) if eip == CODE + 2 => (),
            x => panic!("Unexpected {:?}", x),
        }
        let mut cpu = Cpu::new(0x5000, STACK_TOP);
        match cpu.step(&mut mem) {
            Err(Fault::Memory(_)) => (),
            x => panic!("Unexpected {:?}", x),
        }
    }

    #[test]
    fn frame_round_trip() {
        let mut frame = RegisterFrame::new();
        frame.eax = 1;
        frame.ebx = 2;
        frame.ebp = 7;
        let mut cpu = Cpu::new(CODE, STACK_TOP);
        cpu.load_frame(&frame);
        assert_eq!(cpu.regs[3], 2);
        assert_eq!(cpu.regs[5], 7);
        assert_eq!(cpu.esp(), STACK_TOP);
        let mut out = RegisterFrame::new();
        cpu.store_frame(&mut out);
        assert_eq!(out, frame);
    }
}
