//! Machine code sequences written into the legacy image and the hook arenas.

use crate::emit::CodeBuf;
use crate::registers::{FlagsByte, Reg, RegisterFrame};

/// `jmp rel32; ret`
pub const REDIRECT_LEN: usize = 6;
/// Interrupt vector the emulated strategy traps hooks with.
pub const TRAP_VECTOR: u8 = 0x2e;
/// `push imm32; int imm8; ret`
pub const TRAP_LEN: usize = 8;
pub const TAGGED_JUMP_LEN: usize = 16;

/// Hook table entry.
///
/// Saves registers to the staging frame at `frame`, stores the caller's return
/// address to `last_hook`, and calls `hook(frame)` (cdecl). The low byte of the
/// hook's return value is loaded to flags as if by `sahf`, then the registers
/// are reloaded from the frame and the entry returns to the caller of the
/// hooked function.
pub fn hook_entry(entry: u32, frame: u32, last_hook: u32, hook: u32) -> CodeBuf {
    let mut buf = CodeBuf::new(entry);
    for &reg in &Reg::ALL {
        buf.emit_move_to_memory(frame.wrapping_add(reg.frame_offset()), reg);
    }
    buf.emit_move_from_stack_top(Reg::A);
    buf.emit_move_to_memory(last_hook, Reg::A);
    buf.emit_push_imm(frame);
    buf.emit_relative_call(hook);
    buf.emit_add_esp(4);
    buf.emit_and_eax(0xff);
    buf.emit_shl_eax(8);
    buf.emit_sahf();
    buf.emit_push_flags();
    for &reg in &Reg::ALL {
        buf.emit_move_from_memory(reg, frame.wrapping_add(reg.frame_offset()));
    }
    buf.emit_pop_flags();
    buf.emit_return();
    trace!("Hook entry {:08x} for {:08x}: {:02x?}", entry, hook, buf.as_slice());
    buf
}

/// Written over the start of a hooked legacy function.
pub fn redirect(at: u32, target: u32) -> Vec<u8> {
    let mut buf = CodeBuf::new(at);
    buf.emit_relative_jump(target);
    buf.emit_return();
    buf.into_bytes()
}

/// Emulated strategy's replacement for `redirect`; the trap handler pops
/// `index` and runs the hook registered with it.
pub fn trap(at: u32, index: u32) -> Vec<u8> {
    let mut buf = CodeBuf::new(at);
    buf.emit_push_imm(index);
    buf.emit_interrupt(TRAP_VECTOR);
    buf.emit_return();
    buf.into_bytes()
}

/// Indirect jump slot which leaves `marker` below the return address, so a
/// target shared by several call sites can tell which one it came from.
///
/// Stack at `target`: [ret, marker, original args..]
pub fn tagged_jump(slot: u32, marker: u32, target: u32) -> Vec<u8> {
    let mut buf = CodeBuf::new(slot);
    buf.emit_push_stack_top();
    buf.emit_move_stack_imm(4, marker);
    buf.emit_relative_jump(target);
    buf.emit_nops(TAGGED_JUMP_LEN - buf.len());
    buf.into_bytes()
}

/// How many no-ops have to precede a `len` byte write at `address` so that
/// the write starts on a fresh page instead of straddling two.
pub fn page_padding(address: usize, len: usize, page_size: usize) -> usize {
    let in_page = address % page_size;
    if in_page + len > page_size {
        page_size - in_page
    } else {
        0
    }
}

/// `hook_entry` length, independent of the addresses.
pub fn hook_entry_len() -> usize {
    hook_entry(0, 0, 0, 0).len()
}

/// Converts a hook return value to the flags byte the entry loads with `sahf`.
pub fn hook_result_flags(result: u8) -> FlagsByte {
    FlagsByte::from_raw(result as u32)
}

const _: () = assert!(RegisterFrame::SIZE == 7 * 4);

#[cfg(test)]
mod test {
    use super::*;

    use iced_x86::{Decoder, DecoderOptions, Mnemonic, Register};

    fn decode(code: &[u8], ip: u32) -> Vec<iced_x86::Instruction> {
        let mut decoder = Decoder::with_ip(32, code, ip as u64, DecoderOptions::NONE);
        decoder.iter().collect()
    }

    #[test]
    fn hook_entry_sequence() {
        let buf = hook_entry(0x1000_0000, 0x2000_0000, 0x2000_0100, 0x3000_0000);
        let ins = decode(buf.as_slice(), 0x1000_0000);
        let mnemonics = ins.iter().map(|x| x.mnemonic()).collect::<Vec<_>>();
        let mut expected = vec![Mnemonic::Mov; 9];
        expected.extend_from_slice(&[
            Mnemonic::Push,
            Mnemonic::Call,
            Mnemonic::Add,
            Mnemonic::And,
            Mnemonic::Shl,
            Mnemonic::Sahf,
            Mnemonic::Pushfd,
        ]);
        expected.extend_from_slice(&[Mnemonic::Mov; 7]);
        expected.extend_from_slice(&[Mnemonic::Popfd, Mnemonic::Ret]);
        assert_eq!(mnemonics, expected);
        // Stores: eax first, ebp last, at the frame offsets
        assert_eq!(ins[0].op1_register(), Register::EAX);
        assert_eq!(ins[0].memory_displacement32(), 0x2000_0000);
        assert_eq!(ins[6].op1_register(), Register::EBP);
        assert_eq!(ins[6].memory_displacement32(), 0x2000_0018);
        assert_eq!(ins[8].memory_displacement32(), 0x2000_0100);
        assert_eq!(ins[9].immediate32(), 0x2000_0000);
        assert_eq!(ins[10].near_branch32(), 0x3000_0000);
        assert_eq!(ins[16].op0_register(), Register::EAX);
        assert_eq!(ins[16].memory_displacement32(), 0x2000_0000);
        assert_eq!(ins[17].op0_register(), Register::EBX);
        assert!(buf.len() <= 0x80);
        assert_eq!(buf.len(), hook_entry_len());
    }

    #[test]
    fn redirect_and_trap() {
        let code = redirect(0x0040_1000, 0x1000_0000);
        assert_eq!(code.len(), REDIRECT_LEN);
        let ins = decode(&code, 0x0040_1000);
        assert_eq!(ins[0].mnemonic(), Mnemonic::Jmp);
        assert_eq!(ins[0].near_branch32(), 0x1000_0000);
        assert_eq!(ins[1].mnemonic(), Mnemonic::Ret);

        let code = trap(0x0040_1000, 7);
        assert_eq!(code, vec![0x68, 7, 0, 0, 0, 0xcd, TRAP_VECTOR, 0xc3]);
        assert_eq!(code.len(), TRAP_LEN);
    }

    #[test]
    fn tagged_jump_sequence() {
        let code = tagged_jump(0x5000_0010, 0xfeed_0001, 0x0040_2000);
        assert_eq!(code.len(), TAGGED_JUMP_LEN);
        let ins = decode(&code, 0x5000_0010);
        assert_eq!(ins[0].mnemonic(), Mnemonic::Push);
        assert_eq!(ins[1].mnemonic(), Mnemonic::Mov);
        assert_eq!(ins[1].immediate32(), 0xfeed_0001);
        assert_eq!(ins[2].mnemonic(), Mnemonic::Jmp);
        assert_eq!(ins[2].near_branch32(), 0x0040_2000);
    }

    #[test]
    fn padding() {
        assert_eq!(page_padding(0x0040_1000, 6, 0x1000), 0);
        assert_eq!(page_padding(0x0040_1ffa, 6, 0x1000), 0);
        assert_eq!(page_padding(0x0040_1ffb, 6, 0x1000), 5);
        assert_eq!(page_padding(0x0040_1fff, 6, 0x1000), 1);
        assert_eq!(page_padding(0x0040_1ffc, 8, 0x1000), 4);
    }
}
