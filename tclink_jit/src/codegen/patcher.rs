//! Smashable transfer sites and the code patcher that rewrites them.
//!
//! A smashable site is a `jmp`, `jcc` or `call` with a rel32 displacement,
//! emitted at a position where its bytes do not straddle a cache line. Once
//! the site exists its width never changes: smashing re-encodes the same
//! instruction form toward a new target.
//!
//! # Write Ordering
//!
//! A smash proceeds in two ordered phases:
//! 1. **Displacement**: write the four rel32 bytes
//! 2. **Opcode**: after a release fence, rewrite the opcode byte(s)
//!
//! The opcode of a smashed site is identical to the opcode it replaces, so
//! a thread fetching the site observes either the old or the new
//! displacement under an unchanged opcode. Keeping the site inside one
//! cache line means the displacement lands as a single line update.
//!
//! Under [`Protection::WriteXorExecute`] the containing page is made
//! writable for the write and executable again afterwards.

use std::ptr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering, fence};

use crate::backend::x64::assembler::{Assembler, rel32};
use crate::backend::x64::encoder::{
    CALL_REL32_OPCODE, Condition, EncodedInst, JCC_REL32_ESCAPE, JMP_REL32_OPCODE,
    encode_call_rel32, encode_jcc_rel32, encode_jmp_rel32, encode_mov_mr,
};
use crate::backend::x64::memory::{CodeRegion, Protection};
use crate::backend::x64::os::{self, PageAccess};
use crate::backend::x64::registers::{Gpr, MemOperand};
use crate::error::PatchError;

// =============================================================================
// Constants
// =============================================================================

/// Width of a smashable `jmp rel32`.
pub const JMP_LEN: usize = 5;

/// Width of a smashable `jcc rel32`: one byte wider than `jmp` for the
/// two-byte opcode.
pub const JCC_LEN: usize = 6;

/// Width of a smashable `call rel32`.
pub const CALL_LEN: usize = 5;

/// Instruction-fetch granularity a smashable site must not straddle.
pub const CACHE_LINE: usize = 64;

// =============================================================================
// Smash Kinds
// =============================================================================

/// The three forms of smashable transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SmashKind {
    Jmp,
    Jcc,
    Call,
}

impl SmashKind {
    /// Reserved width of this kind of site.
    #[inline]
    pub const fn width(self) -> usize {
        match self {
            SmashKind::Jmp => JMP_LEN,
            SmashKind::Jcc => JCC_LEN,
            SmashKind::Call => CALL_LEN,
        }
    }

    /// Number of leading opcode bytes before the rel32 displacement.
    #[inline]
    pub const fn opcode_len(self) -> usize {
        self.width() - 4
    }

    /// The smash kind used for a jump with an optional condition.
    #[inline]
    pub const fn for_jump(cc: Option<Condition>) -> Self {
        match cc {
            Some(_) => SmashKind::Jcc,
            None => SmashKind::Jmp,
        }
    }
}

/// Whether `len` bytes at `addr` stay inside one cache line.
#[inline]
pub const fn is_smashable(addr: usize, len: usize) -> bool {
    debug_assert!(len > 0 && len <= CACHE_LINE);
    addr / CACHE_LINE == (addr + len - 1) / CACHE_LINE
}

/// Pad `region` with NOPs so that a site of `width` bytes emitted at the
/// new frontier does not straddle a cache line. Returns the site address.
pub fn prepare_for_smash(region: &mut CodeRegion, width: usize) -> usize {
    let frontier = region.frontier();
    if !is_smashable(frontier, width) {
        let pad = CACHE_LINE - frontier % CACHE_LINE;
        Assembler::new(region).nops(pad);
    }
    let site = region.frontier();
    debug_assert!(is_smashable(site, width));
    site
}

/// Encode a smashable transfer of `kind` located at `site` toward `target`.
///
/// # Panics
/// Panics if `target` is out of rel32 range, or if `kind` is `Jcc` without
/// a condition.
pub fn encode_transfer(
    kind: SmashKind,
    site: usize,
    target: usize,
    cc: Option<Condition>,
) -> EncodedInst {
    let Some(disp) = rel32(site + kind.width(), target) else {
        panic!("smash of {kind:?} at {site:#x} cannot reach {target:#x}");
    };
    match kind {
        SmashKind::Jmp => encode_jmp_rel32(disp),
        SmashKind::Call => encode_call_rel32(disp),
        SmashKind::Jcc => match cc {
            Some(cc) => encode_jcc_rel32(cc, disp),
            None => panic!("jcc smash at {site:#x} without a condition"),
        },
    }
}

/// Decode the target of a smashable site from its bytes.
///
/// Returns `None` if the bytes are not a rel32 transfer of `kind`.
pub fn decode_target(kind: SmashKind, site: usize, bytes: &[u8]) -> Option<usize> {
    if bytes.len() < kind.width() {
        return None;
    }
    let opcode_ok = match kind {
        SmashKind::Jmp => bytes[0] == JMP_REL32_OPCODE,
        SmashKind::Call => bytes[0] == CALL_REL32_OPCODE,
        SmashKind::Jcc => bytes[0] == JCC_REL32_ESCAPE && bytes[1] & 0xF0 == 0x80,
    };
    if !opcode_ok {
        return None;
    }
    let off = kind.opcode_len();
    let disp = i32::from_le_bytes([bytes[off], bytes[off + 1], bytes[off + 2], bytes[off + 3]]);
    Some((site + kind.width()).wrapping_add_signed(disp as isize))
}

// =============================================================================
// Patcher
// =============================================================================

/// Rewrites smashable sites in live code.
///
/// Smashes are counted with relaxed atomics for statistics only.
#[derive(Debug)]
pub struct Patcher {
    protection: Protection,
    /// Total sites smashed.
    smashes: AtomicU64,
    /// Total W^X protection round trips.
    protection_toggles: AtomicU64,
}

impl Patcher {
    /// Create a patcher for regions mapped with `protection`.
    pub fn new(protection: Protection) -> Self {
        Self {
            protection,
            smashes: AtomicU64::new(0),
            protection_toggles: AtomicU64::new(0),
        }
    }

    /// Point the `jmp rel32` at `site` to `target`.
    ///
    /// # Safety
    /// `site` must be a smashable `jmp` emitted into a live code region.
    pub unsafe fn smash_jmp(&self, site: usize, target: usize) -> Result<(), PatchError> {
        let inst = encode_transfer(SmashKind::Jmp, site, target, None);
        // SAFETY: forwarded from the caller
        unsafe { self.smash(SmashKind::Jmp, site, &inst) }
    }

    /// Point the `jcc rel32` at `site` to `target`, keeping its condition.
    ///
    /// # Safety
    /// `site` must be a smashable `jcc` emitted into a live code region.
    pub unsafe fn smash_jcc(&self, site: usize, target: usize) -> Result<(), PatchError> {
        // SAFETY: the caller guarantees `site` holds a 6-byte jcc
        let opcode = unsafe { ptr::read_volatile((site + 1) as *const u8) };
        assert!(
            opcode & 0xF0 == 0x80,
            "site {site:#x} is not a jcc rel32 (opcode byte {opcode:#04x})"
        );
        let cc = Condition::from_nibble(opcode);
        let inst = encode_transfer(SmashKind::Jcc, site, target, Some(cc));
        // SAFETY: forwarded from the caller
        unsafe { self.smash(SmashKind::Jcc, site, &inst) }
    }

    /// Point the `call rel32` at `site` to `target`.
    ///
    /// # Safety
    /// `site` must be a smashable `call` emitted into a live code region.
    pub unsafe fn smash_call(&self, site: usize, target: usize) -> Result<(), PatchError> {
        let inst = encode_transfer(SmashKind::Call, site, target, None);
        // SAFETY: forwarded from the caller
        unsafe { self.smash(SmashKind::Call, site, &inst) }
    }

    /// Write `inst` over the site: displacement first, opcode last.
    ///
    /// # Safety
    /// `site` must be mapped and hold a transfer of the same width.
    unsafe fn smash(
        &self,
        kind: SmashKind,
        site: usize,
        inst: &EncodedInst,
    ) -> Result<(), PatchError> {
        let bytes = inst.as_slice();
        assert_eq!(bytes.len(), kind.width(), "smash would change site width");
        assert!(
            is_smashable(site, bytes.len()),
            "smash site {site:#x} straddles a cache line"
        );

        let page = os::page_of(site);
        let toggle = self.protection == Protection::WriteXorExecute;
        if toggle {
            // SAFETY: the caller guarantees the page is mapped
            unsafe { os::protect(page, os::page_size(), PageAccess::ReadWrite) }
                .map_err(|source| PatchError::MakeWritable { page, source })?;
        }

        let opcode_len = kind.opcode_len();
        // SAFETY: the page is writable and the site holds `bytes.len()` bytes
        unsafe {
            let disp = i32::from_le_bytes([
                bytes[opcode_len],
                bytes[opcode_len + 1],
                bytes[opcode_len + 2],
                bytes[opcode_len + 3],
            ]);
            write_disp(site + opcode_len, disp);
            fence(Ordering::Release);
            for (i, &b) in bytes[..opcode_len].iter().enumerate() {
                ptr::write_volatile((site + i) as *mut u8, b);
            }
        }

        if toggle {
            // SAFETY: the page is mapped
            unsafe { os::protect(page, os::page_size(), PageAccess::ReadExecute) }
                .map_err(|source| PatchError::MakeExecutable { page, source })?;
            self.protection_toggles.fetch_add(1, Ordering::Relaxed);
        }
        fence(Ordering::SeqCst);

        self.smashes.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(
            ?kind,
            site = format_args!("{site:#x}"),
            bytes = ?bytes,
            "smashed transfer site"
        );
        Ok(())
    }

    /// Smash and protection counters so far.
    #[inline]
    pub fn stats(&self) -> PatchStats {
        PatchStats {
            smashes: self.smashes.load(Ordering::Relaxed),
            protection_toggles: self.protection_toggles.load(Ordering::Relaxed),
        }
    }
}

/// Store a rel32 displacement so concurrent fetches see all old or all new
/// bytes.
///
/// An aligned displacement goes through an atomic store. An unaligned one is
/// a single 4-byte `mov`, which x86 performs atomically because
/// [`prepare_for_smash`] keeps the whole site inside one cache line.
///
/// # Safety
/// `addr..addr + 4` must be mapped and writable.
unsafe fn write_disp(addr: usize, disp: i32) {
    if addr % align_of::<AtomicU32>() == 0 {
        // SAFETY: aligned, writable, and only ever accessed as a whole
        let slot = unsafe { AtomicU32::from_ptr(addr as *mut u32) };
        slot.store(disp as u32, Ordering::Relaxed);
    } else {
        // SAFETY: the caller guarantees the four bytes are writable
        unsafe { ptr::write_unaligned(addr as *mut i32, disp) };
    }
}

/// Counters reported by [`Patcher::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PatchStats {
    /// Total sites smashed.
    pub smashes: u64,
    /// Total W^X protection round trips.
    pub protection_toggles: u64,
}

// =============================================================================
// Store-Immediate Patcher
// =============================================================================

/// A `mov reg, imm64; mov [mem], reg` pair whose immediate is filled in
/// after more code has been emitted.
///
/// Used to store a return address that is only known once the code that
/// follows the store has been laid down.
#[derive(Debug)]
pub struct StoreImmPatcher {
    imm_addr: usize,
}

impl StoreImmPatcher {
    /// Emit the store with a placeholder immediate of the current frontier.
    pub fn new(asm: &mut Assembler<'_>, dest: MemOperand, via: Gpr) -> Self {
        let placeholder = asm.frontier() as i64;
        let imm_addr = asm.mov_ri64_patchable(via, placeholder);
        asm.emit(&encode_mov_mr(&dest, via));
        StoreImmPatcher { imm_addr }
    }

    /// Address of the 8-byte immediate.
    #[inline]
    pub fn imm_addr(&self) -> usize {
        self.imm_addr
    }

    /// Overwrite the immediate with `value`.
    pub fn patch(self, region: &mut CodeRegion, value: u64) {
        let mut cursor = region.patch_cursor(self.imm_addr);
        cursor.emit_bytes(&value.to_le_bytes());
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::x64::registers::mem;

    fn region(protection: Protection) -> CodeRegion {
        CodeRegion::new("patch", 4096, protection).unwrap()
    }

    #[test]
    fn test_widths() {
        assert_eq!(SmashKind::Jmp.width(), 5);
        assert_eq!(SmashKind::Jcc.width(), SmashKind::Jmp.width() + 1);
        assert_eq!(SmashKind::Call.width(), 5);
        assert_eq!(SmashKind::Jcc.opcode_len(), 2);
    }

    #[test]
    fn test_is_smashable() {
        assert!(is_smashable(0, 5));
        assert!(is_smashable(59, 5));
        assert!(!is_smashable(60, 5));
        assert!(!is_smashable(59, 6));
        assert!(is_smashable(64, 6));
    }

    #[test]
    fn test_prepare_for_smash_pads_to_line() {
        let mut r = region(Protection::ReadWriteExecute);
        Assembler::new(&mut r).nops(61);
        let site = prepare_for_smash(&mut r, JMP_LEN);
        assert_eq!(site, r.base() + 64);
        assert_eq!(r.used(), 64);

        // Already fine: no padding.
        let site = prepare_for_smash(&mut r, JCC_LEN);
        assert_eq!(site, r.base() + 64);
    }

    #[test]
    fn test_encode_decode_transfer() {
        let inst = encode_transfer(SmashKind::Jcc, 0x1000, 0x2000, Some(Condition::Equal));
        assert_eq!(inst.len(), JCC_LEN);
        assert_eq!(decode_target(SmashKind::Jcc, 0x1000, inst.as_slice()), Some(0x2000));
        assert_eq!(decode_target(SmashKind::Jmp, 0x1000, inst.as_slice()), None);
    }

    #[test]
    fn test_smash_jmp_keeps_width() {
        let mut r = region(Protection::ReadWriteExecute);
        let base = r.base();
        let site = {
            let mut a = Assembler::new(&mut r);
            let site = a.frontier();
            a.jmp_to(site);
            a.nops(3);
            site
        };
        let patcher = Patcher::new(Protection::ReadWriteExecute);
        unsafe { patcher.smash_jmp(site, base + 0x100).unwrap() };

        assert_eq!(r.used(), 8);
        assert_eq!(decode_target(SmashKind::Jmp, site, r.read(site, 5)), Some(base + 0x100));
        // Bytes after the site are untouched.
        assert_eq!(r.read(site + 5, 3), &[0x0F, 0x1F, 0x00]);
        assert_eq!(patcher.stats().smashes, 1);
    }

    #[test]
    fn test_smash_jcc_keeps_condition() {
        let mut r = region(Protection::ReadWriteExecute);
        let site = r.frontier();
        Assembler::new(&mut r).jcc_to(Condition::Less, site);
        let target = r.base() + 0x200;

        let patcher = Patcher::new(Protection::ReadWriteExecute);
        unsafe { patcher.smash_jcc(site, target).unwrap() };
        let bytes = r.read(site, JCC_LEN);
        assert_eq!(bytes[..2], [0x0F, 0x8C]);
        assert_eq!(decode_target(SmashKind::Jcc, site, bytes), Some(target));
    }

    #[test]
    fn test_smash_call_under_wx() {
        let mut r = region(Protection::WriteXorExecute);
        let site = r.frontier();
        Assembler::new(&mut r).call_rel32(site + 0x40);
        r.make_executable().unwrap();

        let patcher = Patcher::new(Protection::WriteXorExecute);
        unsafe { patcher.smash_call(site, site + 0x80).unwrap() };
        assert_eq!(
            decode_target(SmashKind::Call, site, r.read(site, CALL_LEN)),
            Some(site + 0x80)
        );
        assert_eq!(patcher.stats().protection_toggles, 1);
    }

    #[test]
    fn test_store_imm_patcher() {
        let mut r = region(Protection::ReadWriteExecute);
        let sp = StoreImmPatcher::new(&mut Assembler::new(&mut r), mem(Gpr::Rbx, 40), Gpr::Rax);
        let base = r.base();
        assert_eq!(sp.imm_addr(), base + 2);
        assert_eq!(r.read(sp.imm_addr(), 8), &(base as u64).to_le_bytes());
        // mov [rbx + 40], rax
        assert_eq!(&r.bytes()[10..], &[0x48, 0x89, 0x43, 0x28]);

        let imm = sp.imm_addr();
        Assembler::new(&mut r).ret();
        let resume = r.frontier() as u64;
        sp.patch(&mut r, resume);
        assert_eq!(r.read(imm, 8), &resume.to_le_bytes());
        assert_eq!(r.used(), 15);
    }

    #[test]
    fn test_smash_aligned_and_unaligned_displacement() {
        let mut r = region(Protection::ReadWriteExecute);
        let patcher = Patcher::new(Protection::ReadWriteExecute);
        // A jmp at offset 3 has its displacement at 4; the next one, at 8,
        // has it at 9.
        Assembler::new(&mut r).nops(3);
        let aligned = r.frontier();
        Assembler::new(&mut r).jmp_to(aligned);
        let unaligned = r.frontier();
        Assembler::new(&mut r).jmp_to(unaligned);
        assert_eq!((aligned + 1) % 4, 0);

        let target = r.base() + 0x300;
        for site in [aligned, unaligned] {
            unsafe { patcher.smash_jmp(site, target).unwrap() };
            assert_eq!(decode_target(SmashKind::Jmp, site, r.read(site, JMP_LEN)), Some(target));
        }
        assert_eq!(patcher.stats().smashes, 2);
    }
}
