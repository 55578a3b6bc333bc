//! x86-64 machine-code emission into bounded buffers.

mod assembler;
mod types;

pub use assembler::{Assembler, ForwardJump};
pub use types::*;
