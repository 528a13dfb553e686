//! x64 instruction encoder.
//!
//! Encodes the small instruction set the link layer emits: register and
//! `[base + disp]` moves, stack traffic, a few arithmetic forms, and the
//! rel32 `jmp`/`jcc`/`call` forms smashable sites are built from.
//!
//! ```text
//! [REX] opcode [ModR/M] [SIB] [disp8 | disp32] [imm]
//! ```
//!
//! Every function returns an [`EncodedInst`] by value; nothing here touches
//! a code region.

use super::registers::{Gpr, MemOperand};

// =============================================================================
// Encoded Instructions
// =============================================================================

/// Longest x64 instruction.
const MAX_INST_LEN: usize = 15;

/// One encoded instruction.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct EncodedInst {
    bytes: [u8; MAX_INST_LEN],
    len: u8,
}

impl EncodedInst {
    const fn empty() -> Self {
        EncodedInst {
            bytes: [0; MAX_INST_LEN],
            len: 0,
        }
    }

    fn of(bytes: &[u8]) -> Self {
        let mut inst = Self::empty();
        inst.extend(bytes);
        inst
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    #[inline]
    pub const fn len(&self) -> usize {
        self.len as usize
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    fn byte(&mut self, b: u8) -> &mut Self {
        self.bytes[self.len as usize] = b;
        self.len += 1;
        self
    }

    fn extend(&mut self, bytes: &[u8]) -> &mut Self {
        for &b in bytes {
            self.byte(b);
        }
        self
    }

    fn imm32(&mut self, v: i32) -> &mut Self {
        self.extend(&v.to_le_bytes())
    }

    /// REX prefix, omitted when no bit is set.
    fn rex(&mut self, w: bool, r: bool, b: bool) -> &mut Self {
        if w || r || b {
            self.byte(0x40 | (w as u8) << 3 | (r as u8) << 2 | b as u8);
        }
        self
    }

    /// ModR/M (plus SIB and displacement) addressing `mem` with `reg` in
    /// the reg field.
    fn modrm_mem(&mut self, reg: u8, mem: &MemOperand) -> &mut Self {
        let base = mem.base;
        let (mode, disp_len) = if mem.disp == 0 && !base.base_needs_disp() {
            (0b00, 0)
        } else if mem.disp_is_i8() {
            (0b01, 1)
        } else {
            (0b10, 4)
        };
        self.byte(mode << 6 | (reg & 7) << 3 | base.low3());
        if base.base_needs_sib() {
            // scale 1, no index
            self.byte(0b00_100_000 | base.low3());
        }
        match disp_len {
            1 => self.byte(mem.disp as i8 as u8),
            4 => self.imm32(mem.disp),
            _ => self,
        }
    }

    /// ModR/M in register-direct mode.
    fn modrm_reg(&mut self, reg: u8, rm: Gpr) -> &mut Self {
        self.byte(0b11 << 6 | (reg & 7) << 3 | rm.low3())
    }
}

impl std::fmt::Debug for EncodedInst {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EncodedInst({:02x?})", self.as_slice())
    }
}

/// `op [mem]` with `reg` (a register or a /digit) in the reg field.
fn mem_form(w: bool, opcode: u8, reg: u8, mem: &MemOperand) -> EncodedInst {
    let mut inst = EncodedInst::empty();
    inst.rex(w, reg >= 8, mem.base.is_extended())
        .byte(opcode)
        .modrm_mem(reg, mem);
    inst
}

/// `op rm, reg` in register-direct mode.
fn reg_form(w: bool, opcode: u8, reg: u8, rm: Gpr) -> EncodedInst {
    let mut inst = EncodedInst::empty();
    inst.rex(w, reg >= 8, rm.is_extended())
        .byte(opcode)
        .modrm_reg(reg, rm);
    inst
}

/// `op+rd` forms (push, pop, mov imm).
fn plus_reg(w: bool, opcode: u8, reg: Gpr) -> EncodedInst {
    let mut inst = EncodedInst::empty();
    inst.rex(w, false, reg.is_extended()).byte(opcode + reg.low3());
    inst
}

// =============================================================================
// Data Movement
// =============================================================================

/// `mov dst, src` (64-bit).
pub fn encode_mov_rr(dst: Gpr, src: Gpr) -> EncodedInst {
    reg_form(true, 0x89, src.num(), dst)
}

/// `mov dst, qword [mem]`.
pub fn encode_mov_rm(dst: Gpr, mem: &MemOperand) -> EncodedInst {
    mem_form(true, 0x8B, dst.num(), mem)
}

/// `mov qword [mem], src`.
pub fn encode_mov_mr(mem: &MemOperand, src: Gpr) -> EncodedInst {
    mem_form(true, 0x89, src.num(), mem)
}

/// `lea dst, [mem]`.
pub fn encode_lea(dst: Gpr, mem: &MemOperand) -> EncodedInst {
    mem_form(true, 0x8D, dst.num(), mem)
}

/// `mov dst, imm64`. Always 10 bytes, immediate at offset 2.
pub fn encode_mov_ri64(dst: Gpr, imm: i64) -> EncodedInst {
    let mut inst = plus_reg(true, 0xB8, dst);
    inst.extend(&imm.to_le_bytes());
    inst
}

/// `mov dst32, imm32`, zero-extending into the full register.
pub fn encode_mov_ri32(dst: Gpr, imm: u32) -> EncodedInst {
    let mut inst = plus_reg(false, 0xB8, dst);
    inst.extend(&imm.to_le_bytes());
    inst
}

/// `mov dst, simm32`, sign-extending.
pub fn encode_mov_ri_sx32(dst: Gpr, imm: i32) -> EncodedInst {
    let mut inst = reg_form(true, 0xC7, 0, dst);
    inst.imm32(imm);
    inst
}

/// `xor dst32, dst32`.
pub fn encode_zero_r(dst: Gpr) -> EncodedInst {
    reg_form(false, 0x31, dst.num(), dst)
}

// =============================================================================
// Arithmetic
// =============================================================================

fn alu_ri(digit: u8, dst: Gpr, imm: i32) -> EncodedInst {
    match i8::try_from(imm) {
        Ok(imm8) => {
            let mut inst = reg_form(true, 0x83, digit, dst);
            inst.byte(imm8 as u8);
            inst
        }
        Err(_) => {
            let mut inst = reg_form(true, 0x81, digit, dst);
            inst.imm32(imm);
            inst
        }
    }
}

/// `add dst, imm`, using the imm8 form when it fits.
pub fn encode_add_ri(dst: Gpr, imm: i32) -> EncodedInst {
    alu_ri(0, dst, imm)
}

/// `sub dst, imm`, using the imm8 form when it fits.
pub fn encode_sub_ri(dst: Gpr, imm: i32) -> EncodedInst {
    alu_ri(5, dst, imm)
}

/// `test dword [mem], imm32`.
pub fn encode_test_mi32(mem: &MemOperand, imm: i32) -> EncodedInst {
    let mut inst = mem_form(false, 0xF7, 0, mem);
    inst.imm32(imm);
    inst
}

// =============================================================================
// Stack
// =============================================================================

pub fn encode_push(src: Gpr) -> EncodedInst {
    plus_reg(false, 0x50, src)
}

pub fn encode_pop(dst: Gpr) -> EncodedInst {
    plus_reg(false, 0x58, dst)
}

/// `push qword [mem]`.
pub fn encode_push_m(mem: &MemOperand) -> EncodedInst {
    mem_form(false, 0xFF, 6, mem)
}

/// `pop qword [mem]`.
pub fn encode_pop_m(mem: &MemOperand) -> EncodedInst {
    mem_form(false, 0x8F, 0, mem)
}

// =============================================================================
// Control Flow
// =============================================================================

/// `jmp rel32`.
pub const JMP_REL32_OPCODE: u8 = 0xE9;

/// `call rel32`.
pub const CALL_REL32_OPCODE: u8 = 0xE8;

/// First byte of `jcc rel32`; the second is `0x80 | cc`.
pub const JCC_REL32_ESCAPE: u8 = 0x0F;

/// Condition codes, valued by their `jcc` nibble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Condition {
    Overflow = 0x0,
    NoOverflow = 0x1,
    Below = 0x2,
    AboveEqual = 0x3,
    Equal = 0x4,
    NotEqual = 0x5,
    BelowEqual = 0x6,
    Above = 0x7,
    Sign = 0x8,
    NoSign = 0x9,
    Parity = 0xA,
    NoParity = 0xB,
    Less = 0xC,
    GreaterEqual = 0xD,
    LessEqual = 0xE,
    Greater = 0xF,
}

impl Condition {
    const ALL: [Condition; 16] = [
        Condition::Overflow,
        Condition::NoOverflow,
        Condition::Below,
        Condition::AboveEqual,
        Condition::Equal,
        Condition::NotEqual,
        Condition::BelowEqual,
        Condition::Above,
        Condition::Sign,
        Condition::NoSign,
        Condition::Parity,
        Condition::NoParity,
        Condition::Less,
        Condition::GreaterEqual,
        Condition::LessEqual,
        Condition::Greater,
    ];

    /// The condition encoded in the low nibble of a `jcc` opcode byte.
    #[inline]
    pub const fn from_nibble(byte: u8) -> Condition {
        Self::ALL[(byte & 0xF) as usize]
    }
}

/// `jmp rel32`.
pub fn encode_jmp_rel32(disp: i32) -> EncodedInst {
    let mut inst = EncodedInst::of(&[JMP_REL32_OPCODE]);
    inst.imm32(disp);
    inst
}

/// `jcc rel32`.
pub fn encode_jcc_rel32(cc: Condition, disp: i32) -> EncodedInst {
    let mut inst = EncodedInst::of(&[JCC_REL32_ESCAPE, 0x80 | cc as u8]);
    inst.imm32(disp);
    inst
}

/// `call rel32`.
pub fn encode_call_rel32(disp: i32) -> EncodedInst {
    let mut inst = EncodedInst::of(&[CALL_REL32_OPCODE]);
    inst.imm32(disp);
    inst
}

/// `jmp target` (register indirect).
pub fn encode_jmp_r(target: Gpr) -> EncodedInst {
    reg_form(false, 0xFF, 4, target)
}

/// `call target` (register indirect).
pub fn encode_call_r(target: Gpr) -> EncodedInst {
    reg_form(false, 0xFF, 2, target)
}

pub fn encode_ret() -> EncodedInst {
    EncodedInst::of(&[0xC3])
}

/// `int3`, used to pad stub slots.
pub fn encode_int3() -> EncodedInst {
    EncodedInst::of(&[0xCC])
}

/// `ud2`, marks code that must not be reached.
pub fn encode_ud2() -> EncodedInst {
    EncodedInst::of(&[0x0F, 0x0B])
}

// =============================================================================
// Padding
// =============================================================================

/// Longest single NOP [`encode_nop`] produces.
pub const MAX_NOP_LEN: usize = 9;

/// A single NOP of exactly `len` bytes, `1..=MAX_NOP_LEN`.
///
/// Lengths above 2 use the `0f 1f /0` form with a growing memory operand.
pub fn encode_nop(len: usize) -> EncodedInst {
    assert!(
        (1..=MAX_NOP_LEN).contains(&len),
        "no single nop of length {len}"
    );
    const NOPS: [&[u8]; MAX_NOP_LEN] = [
        &[0x90],
        &[0x66, 0x90],
        &[0x0F, 0x1F, 0x00],
        &[0x0F, 0x1F, 0x40, 0x00],
        &[0x0F, 0x1F, 0x44, 0x00, 0x00],
        &[0x66, 0x0F, 0x1F, 0x44, 0x00, 0x00],
        &[0x0F, 0x1F, 0x80, 0x00, 0x00, 0x00, 0x00],
        &[0x0F, 0x1F, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
        &[0x66, 0x0F, 0x1F, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
    ];
    EncodedInst::of(NOPS[len - 1])
}

// =============================================================================
// Tests
// =============================================================================
