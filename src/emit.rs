//! x86-32 instruction emitters.
//!
//! Each `emit_*` appends exactly one instruction. Sequences built from them
//! live in `trampoline`.

#![allow(non_upper_case_globals)]

use crate::registers::Reg;

pub const OPC_PUSH_r32: u8 = 0x50;
pub const OPC_POP_r32: u8 = 0x58;
pub const OPC_PUSH_Iz: u8 = 0x68;
pub const OPC_ARITH_EvIb: u8 = 0x83;
pub const OPC_MOVL_EvGv: u8 = 0x89;
pub const OPC_MOVL_GvEv: u8 = 0x8b;
pub const OPC_NOP: u8 = 0x90;
pub const OPC_PUSHFD: u8 = 0x9c;
pub const OPC_POPFD: u8 = 0x9d;
pub const OPC_SAHF: u8 = 0x9e;
pub const OPC_LAHF: u8 = 0x9f;
pub const OPC_MOVL_EAX_Ov: u8 = 0xa1;
pub const OPC_MOVL_Ov_EAX: u8 = 0xa3;
pub const OPC_AND_EAX_Iz: u8 = 0x25;
pub const OPC_SHIFT_Ib: u8 = 0xc1;
pub const OPC_RET: u8 = 0xc3;
pub const OPC_MOVL_EvIz: u8 = 0xc7;
pub const OPC_INT_Ib: u8 = 0xcd;
pub const OPC_CALL_Jz: u8 = 0xe8;
pub const OPC_JMP_long: u8 = 0xe9;
pub const OPC_GRP5: u8 = 0xff;

/// Length of `call rel32` / `jmp rel32`.
pub const RELATIVE_BRANCH_LEN: u32 = 5;

const REG_ESP: u8 = 4;
const RM_SIB: u8 = 4;
const RM_DISP32: u8 = 5;

/// Displacement of a 5-byte relative branch at `from` to `target`.
pub fn relative_displacement(from: u32, target: u32) -> i32 {
    target.wrapping_sub(from).wrapping_sub(RELATIVE_BRANCH_LEN) as i32
}

fn modrm(md: u8, reg: u8, rm: u8) -> u8 {
    (md << 6) | ((reg & 7) << 3) | (rm & 7)
}

/// Code being built for a known final address, which relative branches need.
pub struct CodeBuf {
    base: u32,
    code: Vec<u8>,
}

impl CodeBuf {
    pub fn new(base: u32) -> CodeBuf {
        CodeBuf {
            base,
            code: Vec::with_capacity(0x80),
        }
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    /// Address of the next emitted byte.
    pub fn current_address(&self) -> u32 {
        self.base.wrapping_add(self.code.len() as u32)
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.code
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.code
    }

    #[inline]
    pub fn emit_u8(&mut self, val: u8) {
        self.code.push(val);
    }

    #[inline]
    pub fn emit_u32(&mut self, val: u32) {
        self.code.extend_from_slice(&val.to_le_bytes());
    }

    /// `push imm32`
    pub fn emit_push_imm(&mut self, value: u32) {
        self.emit_u8(OPC_PUSH_Iz);
        self.emit_u32(value);
    }

    pub fn emit_push(&mut self, reg: Reg) {
        self.emit_u8(OPC_PUSH_r32 + reg.encoding());
    }

    pub fn emit_pop(&mut self, reg: Reg) {
        self.emit_u8(OPC_POP_r32 + reg.encoding());
    }

    /// `push dword [esp]`
    pub fn emit_push_stack_top(&mut self) {
        self.emit_u8(OPC_GRP5);
        self.emit_u8(modrm(0, 6, RM_SIB));
        self.emit_u8(0x24);
    }

    /// `mov dword [esp + offset], imm32`
    pub fn emit_move_stack_imm(&mut self, offset: u8, value: u32) {
        self.emit_u8(OPC_MOVL_EvIz);
        self.emit_u8(modrm(1, 0, RM_SIB));
        self.emit_u8(0x24);
        self.emit_u8(offset);
        self.emit_u32(value);
    }

    /// `mov reg, [esp]`
    pub fn emit_move_from_stack_top(&mut self, reg: Reg) {
        self.emit_u8(OPC_MOVL_GvEv);
        self.emit_u8(modrm(0, reg.encoding(), RM_SIB));
        self.emit_u8(0x24);
    }

    /// `mov [address], reg`
    pub fn emit_move_to_memory(&mut self, address: u32, reg: Reg) {
        if reg == Reg::A {
            self.emit_u8(OPC_MOVL_Ov_EAX);
        } else {
            self.emit_u8(OPC_MOVL_EvGv);
            self.emit_u8(modrm(0, reg.encoding(), RM_DISP32));
        }
        self.emit_u32(address);
    }

    /// `mov reg, [address]`
    pub fn emit_move_from_memory(&mut self, reg: Reg, address: u32) {
        if reg == Reg::A {
            self.emit_u8(OPC_MOVL_EAX_Ov);
        } else {
            self.emit_u8(OPC_MOVL_GvEv);
            self.emit_u8(modrm(0, reg.encoding(), RM_DISP32));
        }
        self.emit_u32(address);
    }

    /// `add esp, imm8`
    pub fn emit_add_esp(&mut self, amount: u8) {
        self.emit_u8(OPC_ARITH_EvIb);
        self.emit_u8(modrm(3, 0, REG_ESP));
        self.emit_u8(amount);
    }

    /// `and eax, imm32`
    pub fn emit_and_eax(&mut self, mask: u32) {
        self.emit_u8(OPC_AND_EAX_Iz);
        self.emit_u32(mask);
    }

    /// `shl eax, imm8`
    pub fn emit_shl_eax(&mut self, amount: u8) {
        self.emit_u8(OPC_SHIFT_Ib);
        self.emit_u8(modrm(3, 4, 0));
        self.emit_u8(amount);
    }

    pub fn emit_sahf(&mut self) {
        self.emit_u8(OPC_SAHF);
    }

    pub fn emit_lahf(&mut self) {
        self.emit_u8(OPC_LAHF);
    }

    pub fn emit_push_flags(&mut self) {
        self.emit_u8(OPC_PUSHFD);
    }

    pub fn emit_pop_flags(&mut self) {
        self.emit_u8(OPC_POPFD);
    }

    pub fn emit_relative_call(&mut self, target: u32) {
        let disp = relative_displacement(self.current_address(), target);
        self.emit_u8(OPC_CALL_Jz);
        self.emit_u32(disp as u32);
    }

    pub fn emit_relative_jump(&mut self, target: u32) {
        let disp = relative_displacement(self.current_address(), target);
        self.emit_u8(OPC_JMP_long);
        self.emit_u32(disp as u32);
    }

    pub fn emit_interrupt(&mut self, vector: u8) {
        self.emit_u8(OPC_INT_Ib);
        self.emit_u8(vector);
    }

    pub fn emit_return(&mut self) {
        self.emit_u8(OPC_RET);
    }

    pub fn emit_nops(&mut self, count: usize) {
        self.code.resize(self.code.len() + count, OPC_NOP);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn relative_branches() {
        let mut buf = CodeBuf::new(0x0040_1000);
        buf.emit_relative_jump(0x0040_2000);
        assert_eq!(buf.as_slice(), &[0xe9, 0xfb, 0x0f, 0x00, 0x00]);
        let mut buf = CodeBuf::new(0x0040_1000);
        buf.emit_nops(2);
        buf.emit_relative_call(0x0040_1000);
        // Backwards: 0x401000 - 0x401002 - 5 = -7
        assert_eq!(buf.as_slice(), &[0x90, 0x90, 0xe8, 0xf9, 0xff, 0xff, 0xff]);
        assert_eq!(relative_displacement(0xffff_fff0, 0x10), 0x1b);
    }

    #[test]
    fn register_moves() {
        let mut buf = CodeBuf::new(0);
        buf.emit_move_to_memory(0x1122_3344, Reg::A);
        buf.emit_move_to_memory(0x1122_3344, Reg::B);
        buf.emit_move_from_memory(Reg::Bp, 0x1122_3344);
        buf.emit_move_from_stack_top(Reg::A);
        assert_eq!(
            buf.as_slice(),
            &[
                0xa3, 0x44, 0x33, 0x22, 0x11,
                0x89, 0x1d, 0x44, 0x33, 0x22, 0x11,
                0x8b, 0x2d, 0x44, 0x33, 0x22, 0x11,
                0x8b, 0x04, 0x24,
            ][..],
        );
    }

    #[test]
    fn stack_ops() {
        let mut buf = CodeBuf::new(0);
        buf.emit_push_stack_top();
        buf.emit_move_stack_imm(4, 0xaabb_ccdd);
        buf.emit_add_esp(4);
        buf.emit_push(Reg::Di);
        buf.emit_pop(Reg::C);
        assert_eq!(
            buf.as_slice(),
            &[
                0xff, 0x34, 0x24,
                0xc7, 0x44, 0x24, 0x04, 0xdd, 0xcc, 0xbb, 0xaa,
                0x83, 0xc4, 0x04,
                0x57,
                0x59,
            ][..],
        );
    }
}
