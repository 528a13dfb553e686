//! Lazy linking for an x64 tracelet JIT.
//!
//! Translations reach each other through smashable `jmp`, `jcc` and `call`
//! sites. Each site first targets a small stub that raises a service request
//! to the runtime; once the runtime knows the destination it rewrites the
//! site in place so later executions go straight there.
//!
//! - [`backend::x64`]: encoder, assembler and executable code regions
//! - [`codegen`]: smashable sites and the patcher that rewrites them
//! - [`runtime`]: service-request arena, stubs, sync points and the handler
//! - [`translator`]: the bind emitters and the session they run in
#![deny(unsafe_op_in_unsafe_fn)]
pub mod backend;
pub mod codegen;
pub mod config;
pub mod error;
pub mod runtime;
pub mod translator;

pub use backend::x64::{CodeBlocks, CodeRegion, Condition, Protection, RegionId};
pub use config::{BindConfig, RuntimeHooks, VmStateLayout};
pub use error::{PatchError, RegionError};
pub use runtime::{
    DestinationResolver, Resolution, ServiceRequestHandler, ServiceRequestKind,
};
pub use translator::{Func, LinkSession, SrcKey};
