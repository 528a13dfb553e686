//! Translator-facing operations: callee metadata, session state and the
//! bind emitters.
pub mod bind;
pub mod func;
pub mod session;

pub use bind::{
    BoundBranch, UNINITIALIZED_RIP, emit_bind_call, emit_bind_j, emit_bind_jcc, emit_bind_jmp,
    emit_bind_side_exit, emit_check_surprise_flags_enter, emit_eager_sync_point,
    emit_native_impl, is_native_impl_call,
};
pub use func::{ActRec, BuiltinFn, Func, FuncId, NativeFn, Offset, Opcode, SrcKey};
pub use session::{LinkSession, TransId};
