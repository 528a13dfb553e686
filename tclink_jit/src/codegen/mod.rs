//! Code patching.
pub mod patcher;

pub use patcher::{
    CACHE_LINE, CALL_LEN, JCC_LEN, JMP_LEN, PatchStats, Patcher, SmashKind, StoreImmPatcher,
    is_smashable, prepare_for_smash,
};
