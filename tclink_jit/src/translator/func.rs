//! Callee metadata and the VM frame layout the bind protocol touches.

use std::fmt;
use std::mem::{offset_of, size_of};

// =============================================================================
// Source Keys
// =============================================================================

/// Identity of a function known to the translator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FuncId(pub u32);

/// Bytecode offset within a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Offset(pub u32);

/// A logical code location: function plus bytecode offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SrcKey {
    pub func: FuncId,
    pub offset: Offset,
}

impl SrcKey {
    #[inline]
    pub const fn new(func: FuncId, offset: Offset) -> Self {
        SrcKey { func, offset }
    }
}

impl fmt::Display for SrcKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "f{}@{}", self.func.0, self.offset.0)
    }
}

// =============================================================================
// Activation Records
// =============================================================================

/// Size of one VM stack cell.
pub const CELL_SIZE: usize = 16;

/// Cells occupied by one iterator in a frame.
pub const ITER_CELLS: u32 = 2;

/// Bytes occupied by `n` stack cells.
#[inline]
pub const fn cells_to_bytes(n: u32) -> i32 {
    (n as usize * CELL_SIZE) as i32
}

/// A VM activation record as laid out on the VM stack.
///
/// Generated code only touches the first two fields directly.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct ActRec {
    /// Caller's frame, chained like a native frame pointer.
    pub saved_rbp: u64,
    /// Native return address into the caller's translation.
    pub saved_rip: u64,
    pub func: u64,
    pub this_or_class: u64,
    pub num_args_and_flags: u64,
    pub var_env: u64,
}

pub const AR_SAVED_RBP: i32 = offset_of!(ActRec, saved_rbp) as i32;
pub const AR_SAVED_RIP: i32 = offset_of!(ActRec, saved_rip) as i32;
pub const AR_SIZE: i32 = size_of::<ActRec>() as i32;

// =============================================================================
// Bytecode
// =============================================================================

/// The bytecodes the bind layer needs to recognize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Nop,
    /// Call the function's native implementation and return.
    NativeImpl,
    FCall,
    RetC,
}

impl Opcode {
    /// Encoded length in bytes.
    pub const fn encoded_len(self) -> u32 {
        match self {
            Opcode::Nop | Opcode::NativeImpl | Opcode::RetC => 1,
            Opcode::FCall => 5,
        }
    }
}

/// Encoded length of [`Opcode::NativeImpl`].
pub const NATIVE_IMPL_LEN: u32 = Opcode::NativeImpl.encoded_len();

// =============================================================================
// Functions
// =============================================================================

/// Signature of a builtin's native implementation.
pub type NativeFn = extern "C" fn(ar: *mut ActRec);

/// Entry address of a builtin's native implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BuiltinFn(usize);

impl BuiltinFn {
    #[inline]
    pub fn new(f: NativeFn) -> Self {
        BuiltinFn(f as usize)
    }

    #[inline]
    pub const fn from_addr(addr: usize) -> Self {
        BuiltinFn(addr)
    }

    #[inline]
    pub const fn addr(self) -> usize {
        self.0
    }
}

/// What the translator knows about a callee.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Func {
    pub id: FuncId,
    pub full_name: String,
    pub num_params: u32,
    /// Locals, including parameters.
    pub num_locals: u32,
    pub num_iterators: u32,
    pub builtin: Option<BuiltinFn>,
    /// First bytecode of the body.
    pub entry_op: Opcode,
    /// Length of the body in bytes.
    pub body_len: u32,
    /// Address of the first bytecode, published by eager sync points.
    pub entry_pc: usize,
}

impl Func {
    /// A bytecode function with `num_params` parameters and no other locals.
    pub fn new(id: FuncId, full_name: impl Into<String>, num_params: u32) -> Self {
        Func {
            id,
            full_name: full_name.into(),
            num_params,
            num_locals: num_params,
            num_iterators: 0,
            builtin: None,
            entry_op: Opcode::Nop,
            body_len: 0,
            entry_pc: 0,
        }
    }

    /// A builtin whose body is the single native-call bytecode.
    pub fn native(
        id: FuncId,
        full_name: impl Into<String>,
        num_params: u32,
        builtin: BuiltinFn,
    ) -> Self {
        Func {
            builtin: Some(builtin),
            entry_op: Opcode::NativeImpl,
            body_len: NATIVE_IMPL_LEN,
            ..Func::new(id, full_name, num_params)
        }
    }

    #[inline]
    pub fn is_builtin(&self) -> bool {
        self.builtin.is_some()
    }

    /// Cells a frame for this function occupies below its ActRec.
    #[inline]
    pub fn num_slots_in_frame(&self) -> u32 {
        self.num_locals + self.num_iterators * ITER_CELLS
    }

    /// Source key of the function's entry.
    #[inline]
    pub fn entry(&self) -> SrcKey {
        SrcKey::new(self.id, Offset(0))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn noop(_ar: *mut ActRec) {}

    #[test]
    fn test_act_rec_layout() {
        assert_eq!(AR_SAVED_RBP, 0);
        assert_eq!(AR_SAVED_RIP, 8);
        assert_eq!(AR_SIZE, 48);
    }

    #[test]
    fn test_cells_to_bytes() {
        assert_eq!(cells_to_bytes(0), 0);
        assert_eq!(cells_to_bytes(2), 32);
    }

    #[test]
    fn test_native_func() {
        let f = Func::native(FuncId(3), "strlen", 1, BuiltinFn::new(noop));
        assert!(f.is_builtin());
        assert_eq!(f.entry_op, Opcode::NativeImpl);
        assert_eq!(f.body_len, NATIVE_IMPL_LEN);
        assert_eq!(f.num_slots_in_frame(), 1);
        assert_eq!(f.entry().to_string(), "f3@0");
    }

    #[test]
    fn test_frame_slots_count_iterators() {
        let mut f = Func::new(FuncId(1), "loop", 2);
        f.num_locals = 4;
        f.num_iterators = 1;
        assert_eq!(f.num_slots_in_frame(), 4 + ITER_CELLS);
    }
}
