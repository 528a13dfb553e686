//! x64 assembler for code emission.
//!
//! [`Assembler`] writes straight into a borrowed [`CodeRegion`] at its
//! frontier, so every emitter knows the absolute address it lands at. That
//! is what lets rel32 transfers be computed at emission time and lets
//! callers record patch sites by address.

use super::encoder::{self, Condition, EncodedInst};
use super::memory::CodeRegion;
use super::registers::{CallingConvention, Gpr, MemOperand, SCRATCH};

/// Compute the rel32 displacement of a transfer whose encoding ends at
/// `next_ip` and targets `target`, if it is reachable.
#[inline]
pub fn rel32(next_ip: usize, target: usize) -> Option<i32> {
    let delta = (target as i64).wrapping_sub(next_ip as i64);
    i32::try_from(delta).ok()
}

/// Emits instructions at a region's frontier.
pub struct Assembler<'r> {
    region: &'r mut CodeRegion,
}

impl<'r> Assembler<'r> {
    /// Create an assembler writing into `region`.
    #[inline]
    pub fn new(region: &'r mut CodeRegion) -> Self {
        Assembler { region }
    }

    /// Address of the next instruction.
    #[inline]
    pub fn frontier(&self) -> usize {
        self.region.frontier()
    }

    /// Base address of the underlying region.
    #[inline]
    pub fn base(&self) -> usize {
        self.region.base()
    }

    #[inline]
    pub fn region(&self) -> &CodeRegion {
        self.region
    }

    #[inline]
    pub fn region_mut(&mut self) -> &mut CodeRegion {
        self.region
    }

    /// Emit an encoded instruction and return its start address.
    #[inline]
    pub fn emit(&mut self, inst: &EncodedInst) -> usize {
        let start = self.frontier();
        self.region.emit_bytes(inst.as_slice());
        start
    }

    /// Emit raw bytes.
    #[inline]
    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        self.region.emit_bytes(bytes);
    }

    // =========================================================================
    // Data Movement
    // =========================================================================

    #[inline]
    pub fn mov_rr(&mut self, dst: Gpr, src: Gpr) {
        if dst != src {
            self.emit(&encoder::encode_mov_rr(dst, src));
        }
    }

    #[inline]
    pub fn mov_rm(&mut self, dst: Gpr, mem: MemOperand) {
        self.emit(&encoder::encode_mov_rm(dst, &mem));
    }

    #[inline]
    pub fn mov_mr(&mut self, mem: MemOperand, src: Gpr) {
        self.emit(&encoder::encode_mov_mr(&mem, src));
    }

    #[inline]
    pub fn lea(&mut self, dst: Gpr, mem: MemOperand) {
        self.emit(&encoder::encode_lea(dst, &mem));
    }

    /// Load an immediate using the shortest encoding.
    pub fn mov_ri(&mut self, dst: Gpr, imm: i64) {
        let inst = if imm == 0 {
            encoder::encode_zero_r(dst)
        } else if let Ok(imm32) = u32::try_from(imm) {
            encoder::encode_mov_ri32(dst, imm32)
        } else if let Ok(imm32) = i32::try_from(imm) {
            encoder::encode_mov_ri_sx32(dst, imm32)
        } else {
            encoder::encode_mov_ri64(dst, imm)
        };
        self.emit(&inst);
    }

    /// `mov r32, imm32`, always in its 5 or 6 byte form.
    #[inline]
    pub fn mov_ri32(&mut self, dst: Gpr, imm: u32) {
        self.emit(&encoder::encode_mov_ri32(dst, imm));
    }

    /// Emit the fixed 10-byte `mov reg, imm64` and return the address of its
    /// immediate, for later patching.
    pub fn mov_ri64_patchable(&mut self, dst: Gpr, imm: i64) -> usize {
        let start = self.emit(&encoder::encode_mov_ri64(dst, imm));
        start + 2
    }

    // =========================================================================
    // Arithmetic
    // =========================================================================

    #[inline]
    pub fn add_ri(&mut self, dst: Gpr, imm: i32) {
        if imm != 0 {
            self.emit(&encoder::encode_add_ri(dst, imm));
        }
    }

    #[inline]
    pub fn sub_ri(&mut self, dst: Gpr, imm: i32) {
        if imm != 0 {
            self.emit(&encoder::encode_sub_ri(dst, imm));
        }
    }

    #[inline]
    pub fn test_mi32(&mut self, mem: MemOperand, imm: i32) {
        self.emit(&encoder::encode_test_mi32(&mem, imm));
    }

    // =========================================================================
    // Stack
    // =========================================================================

    #[inline]
    pub fn push(&mut self, src: Gpr) {
        self.emit(&encoder::encode_push(src));
    }

    #[inline]
    pub fn pop(&mut self, dst: Gpr) {
        self.emit(&encoder::encode_pop(dst));
    }

    #[inline]
    pub fn push_m(&mut self, mem: MemOperand) {
        self.emit(&encoder::encode_push_m(&mem));
    }

    #[inline]
    pub fn pop_m(&mut self, mem: MemOperand) {
        self.emit(&encoder::encode_pop_m(&mem));
    }

    // =========================================================================
    // Control Flow
    // =========================================================================

    /// `jmp rel32` to an absolute address. Always 5 bytes.
    ///
    /// # Panics
    /// Panics if `target` is out of rel32 range.
    pub fn jmp_to(&mut self, target: usize) {
        let disp = self.rel32_from(5, target);
        self.emit(&encoder::encode_jmp_rel32(disp));
    }

    /// `jcc rel32` to an absolute address. Always 6 bytes.
    pub fn jcc_to(&mut self, cc: Condition, target: usize) {
        let disp = self.rel32_from(6, target);
        self.emit(&encoder::encode_jcc_rel32(cc, disp));
    }

    /// `jmp` when `cc` is `None`, `jcc` otherwise.
    #[inline]
    pub fn jmp_or_jcc(&mut self, cc: Option<Condition>, target: usize) {
        match cc {
            Some(cc) => self.jcc_to(cc, target),
            None => self.jmp_to(target),
        }
    }

    /// `call rel32` to an absolute address. Always 5 bytes.
    pub fn call_rel32(&mut self, target: usize) {
        let disp = self.rel32_from(5, target);
        self.emit(&encoder::encode_call_rel32(disp));
    }

    /// Call an absolute address, through the scratch register when it is
    /// out of rel32 reach.
    pub fn call_to(&mut self, target: usize) {
        if rel32(self.frontier() + 5, target).is_some() {
            self.call_rel32(target);
        } else {
            self.emit(&encoder::encode_mov_ri64(SCRATCH, target as i64));
            self.emit(&encoder::encode_call_r(SCRATCH));
        }
    }

    /// Call a host function under `cc`, reserving the callee's shadow space
    /// around the call. Returns the return address.
    pub fn call_native(&mut self, cc: CallingConvention, target: usize) -> usize {
        let shadow = cc.shadow_space() as i32;
        self.sub_ri(Gpr::Rsp, shadow);
        self.call_to(target);
        let ret_addr = self.frontier();
        self.add_ri(Gpr::Rsp, shadow);
        ret_addr
    }

    /// Jump to an absolute address through the scratch register.
    pub fn jmp_abs(&mut self, target: usize) {
        self.emit(&encoder::encode_mov_ri64(SCRATCH, target as i64));
        self.emit(&encoder::encode_jmp_r(SCRATCH));
    }

    #[inline]
    pub fn ret(&mut self) {
        self.emit(&encoder::encode_ret());
    }

    #[inline]
    pub fn ud2(&mut self) {
        self.emit(&encoder::encode_ud2());
    }

    #[inline]
    pub fn int3(&mut self) {
        self.emit(&encoder::encode_int3());
    }

    /// Pad with `len` bytes of multi-byte NOPs.
    pub fn nops(&mut self, mut len: usize) {
        while len > 0 {
            let n = len.min(encoder::MAX_NOP_LEN);
            self.emit(&encoder::encode_nop(n));
            len -= n;
        }
    }

    fn rel32_from(&self, inst_len: usize, target: usize) -> i32 {
        let next_ip = self.frontier() + inst_len;
        match rel32(next_ip, target) {
            Some(disp) => disp,
            None => panic!(
                "rel32 transfer from {next_ip:#x} to {target:#x} is out of range in region `{}`",
                self.region.name()
            ),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::x64::memory::Protection;
    use crate::backend::x64::registers::mem;

    fn region() -> CodeRegion {
        CodeRegion::new("asm", 4096, Protection::ReadWriteExecute).unwrap()
    }

    #[test]
    fn test_jmp_to_self_is_minus_five() {
        let mut r = region();
        let mut a = Assembler::new(&mut r);
        let site = a.frontier();
        a.jmp_to(site);
        assert_eq!(r.bytes(), &[0xE9, 0xFB, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn test_jcc_forward() {
        let mut r = region();
        let base = r.base();
        let mut a = Assembler::new(&mut r);
        a.jcc_to(Condition::NotEqual, base + 0x20);
        assert_eq!(r.bytes(), &[0x0F, 0x85, 0x1A, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_mov_ri_shortest_form() {
        let mut r = region();
        let mut a = Assembler::new(&mut r);
        a.mov_ri(Gpr::Rdx, 0);
        a.mov_ri(Gpr::Rdi, 3);
        a.mov_ri(Gpr::Rax, -1);
        a.mov_ri(Gpr::Rax, 0x1_0000_0000);
        assert_eq!(r.used(), 2 + 5 + 7 + 10);
    }

    #[test]
    fn test_mov_ri64_patchable_returns_immediate() {
        let mut r = region();
        let mut a = Assembler::new(&mut r);
        let imm = a.mov_ri64_patchable(Gpr::Rax, 0x1234);
        assert_eq!(imm, a.base() + 2);
        assert_eq!(r.read(imm, 8), &0x1234u64.to_le_bytes());
    }

    #[test]
    fn test_nops_cover_requested_length() {
        let mut r = region();
        let mut a = Assembler::new(&mut r);
        a.nops(23);
        assert_eq!(a.frontier() - a.base(), 23);
    }

    #[test]
    fn test_call_to_far_target_uses_scratch() {
        let mut r = region();
        let mut a = Assembler::new(&mut r);
        a.call_to(a.frontier().wrapping_add(1 << 40));
        assert_eq!(r.used(), 10 + 3);
        assert_eq!(&r.bytes()[10..], &[0x41, 0xFF, 0xD2]);
    }

    #[test]
    fn test_call_native_reserves_shadow_space() {
        let mut r = region();
        let mut a = Assembler::new(&mut r);
        let target = a.frontier() + 0x100;
        let ret_addr = a.call_native(CallingConvention::WindowsX64, target);
        let base = a.base();
        // sub rsp, 32; call; add rsp, 32
        assert_eq!(&r.bytes()[..4], &[0x48, 0x83, 0xEC, 0x20]);
        assert_eq!(r.bytes()[4], 0xE8);
        assert_eq!(ret_addr, base + 9);
        assert_eq!(&r.bytes()[9..], &[0x48, 0x83, 0xC4, 0x20]);
    }

    #[test]
    fn test_call_native_sysv_is_bare_call() {
        let mut r = region();
        let mut a = Assembler::new(&mut r);
        let target = a.frontier() + 0x100;
        let ret_addr = a.call_native(CallingConvention::SystemV, target);
        assert_eq!(ret_addr, a.frontier());
        assert_eq!(r.used(), 5);
    }

    #[test]
    fn test_mov_rr_elides_self_move() {
        let mut r = region();
        let mut a = Assembler::new(&mut r);
        a.mov_rr(Gpr::Rax, Gpr::Rax);
        a.mov_mr(mem(Gpr::Rbx, 8), Gpr::Rax);
        assert_eq!(r.bytes(), &[0x48, 0x89, 0x43, 0x08]);
    }

    #[test]
    fn test_rel32_range() {
        assert_eq!(rel32(100, 90), Some(-10));
        assert_eq!(rel32(0, 1 << 33), None);
    }
}
