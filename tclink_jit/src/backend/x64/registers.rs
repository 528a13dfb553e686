//! Registers, the VM's fixed register roles, and host calling conventions.
//!
//! # Register Roles
//! ```text
//! rbp  VM_FP        current VM activation record
//! rbx  VM_SP        VM evaluation stack pointer
//! r12  VM_TL        VM thread-local state block
//! r15  STASHED_AR   callee ActRec captured by bind-call stubs
//! r10  SCRATCH      assembler temporary, never live across emitters
//! ```
//!
//! All roles except `SCRATCH` are callee-saved in both host ABIs, so a
//! native helper never clobbers VM state.

use std::fmt;

// =============================================================================
// General-Purpose Registers
// =============================================================================

/// An x64 general-purpose register, valued by its hardware number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Gpr {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

const GPRS: [Gpr; 16] = [
    Gpr::Rax,
    Gpr::Rcx,
    Gpr::Rdx,
    Gpr::Rbx,
    Gpr::Rsp,
    Gpr::Rbp,
    Gpr::Rsi,
    Gpr::Rdi,
    Gpr::R8,
    Gpr::R9,
    Gpr::R10,
    Gpr::R11,
    Gpr::R12,
    Gpr::R13,
    Gpr::R14,
    Gpr::R15,
];

impl Gpr {
    /// Hardware register number, 0-15.
    #[inline(always)]
    pub const fn num(self) -> u8 {
        self as u8
    }

    /// The three bits that go into ModR/M, SIB or the opcode.
    #[inline(always)]
    pub const fn low3(self) -> u8 {
        self as u8 & 0b111
    }

    /// Whether the register needs a REX extension bit (r8-r15).
    #[inline(always)]
    pub const fn is_extended(self) -> bool {
        self as u8 >= 8
    }

    /// As a base, rsp and r12 collide with the SIB escape.
    #[inline(always)]
    pub const fn base_needs_sib(self) -> bool {
        self.low3() == 0b100
    }

    /// As a base with no displacement, rbp and r13 would encode `[rip+disp32]`.
    #[inline(always)]
    pub const fn base_needs_disp(self) -> bool {
        self.low3() == 0b101
    }

    fn name(self) -> &'static str {
        const NAMES: [&str; 16] = [
            "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11",
            "r12", "r13", "r14", "r15",
        ];
        NAMES[self as usize]
    }
}

impl fmt::Display for Gpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// VM Register Roles
// =============================================================================

/// VM frame pointer (current ActRec).
pub const VM_FP: Gpr = Gpr::Rbp;

/// VM evaluation stack pointer.
pub const VM_SP: Gpr = Gpr::Rbx;

/// VM thread-local state block.
pub const VM_TL: Gpr = Gpr::R12;

/// Callee ActRec captured before a bind-call stub runs.
pub const STASHED_AR: Gpr = Gpr::R15;

/// Assembler scratch register.
pub const SCRATCH: Gpr = Gpr::R10;

/// Registers carrying a service request into the runtime, in order:
/// request kind, descriptor id, auxiliary word.
pub const SERVICE_REQ_ARG_REGS: [Gpr; 3] = [Gpr::Rdi, Gpr::Rsi, Gpr::Rdx];

// =============================================================================
// Register Sets
// =============================================================================

/// A set of registers, one bit per hardware number.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct GprSet(u16);

impl GprSet {
    /// Build a set from a list of registers.
    pub const fn of(regs: &[Gpr]) -> Self {
        let mut bits = 0u16;
        let mut i = 0;
        while i < regs.len() {
            bits |= 1 << regs[i].num();
            i += 1;
        }
        GprSet(bits)
    }

    #[inline(always)]
    pub const fn contains(self, reg: Gpr) -> bool {
        self.0 & (1 << reg.num()) != 0
    }

    #[inline(always)]
    pub const fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    #[inline(always)]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Members in ascending register number.
    pub fn iter(self) -> impl DoubleEndedIterator<Item = Gpr> {
        GPRS.into_iter().filter(move |r| self.contains(*r))
    }
}

impl fmt::Debug for GprSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

// =============================================================================
// Calling Conventions
// =============================================================================

/// Host C calling convention.
///
/// Builtins and runtime helpers are plain `extern "C"` functions, so
/// generated calls into them follow whichever ABI the host uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallingConvention {
    /// Microsoft x64.
    WindowsX64,
    /// System V AMD64 (Linux, macOS, BSD).
    SystemV,
}

impl CallingConvention {
    #[cfg(target_os = "windows")]
    pub const fn host() -> Self {
        CallingConvention::WindowsX64
    }

    #[cfg(not(target_os = "windows"))]
    pub const fn host() -> Self {
        CallingConvention::SystemV
    }

    /// Integer argument registers in order.
    pub const fn int_arg_regs(self) -> &'static [Gpr] {
        match self {
            CallingConvention::WindowsX64 => &[Gpr::Rcx, Gpr::Rdx, Gpr::R8, Gpr::R9],
            CallingConvention::SystemV => {
                &[Gpr::Rdi, Gpr::Rsi, Gpr::Rdx, Gpr::Rcx, Gpr::R8, Gpr::R9]
            }
        }
    }

    /// Caller-saved registers.
    pub const fn volatile_gprs(self) -> GprSet {
        match self {
            CallingConvention::WindowsX64 => GprSet::of(&[
                Gpr::Rax,
                Gpr::Rcx,
                Gpr::Rdx,
                Gpr::R8,
                Gpr::R9,
                Gpr::R10,
                Gpr::R11,
            ]),
            CallingConvention::SystemV => GprSet::of(&[
                Gpr::Rax,
                Gpr::Rcx,
                Gpr::Rdx,
                Gpr::Rsi,
                Gpr::Rdi,
                Gpr::R8,
                Gpr::R9,
                Gpr::R10,
                Gpr::R11,
            ]),
        }
    }

    /// Bytes the caller reserves above the return address for the callee.
    pub const fn shadow_space(self) -> usize {
        match self {
            CallingConvention::WindowsX64 => 32,
            CallingConvention::SystemV => 0,
        }
    }
}

// =============================================================================
// Memory Operands
// =============================================================================

/// A `[base + disp]` memory operand. Every slot the link layer touches is
/// addressed off a single register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemOperand {
    pub base: Gpr,
    pub disp: i32,
}

impl MemOperand {
    #[inline]
    pub const fn disp_is_i8(&self) -> bool {
        self.disp >= i8::MIN as i32 && self.disp <= i8::MAX as i32
    }
}

impl fmt::Display for MemOperand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.disp {
            0 => write!(f, "[{}]", self.base),
            d if d < 0 => write!(f, "[{} - {:#x}]", self.base, -(d as i64)),
            d => write!(f, "[{} + {:#x}]", self.base, d),
        }
    }
}

/// `[reg + disp]`.
#[inline]
pub const fn mem(reg: Gpr, disp: i32) -> MemOperand {
    MemOperand { base: reg, disp }
}
