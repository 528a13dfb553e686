//! x64 code emission: registers, instruction encodings, code regions and
//! the assembler that ties them together.

pub mod assembler;
pub mod encoder;
pub mod memory;
pub(crate) mod os;
pub mod registers;

pub use assembler::{Assembler, rel32};
pub use encoder::Condition;
pub use memory::{CodeBlocks, CodeRegion, PatchCursor, Protection, RegionId};
pub use registers::{Gpr, MemOperand, mem};
