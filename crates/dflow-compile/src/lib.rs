//! Compilation passes over a wired operator graph: scope resolution
//! (liveness, branch regions, execution addresses) and linearization into a
//! branch-structured block program ready for evaluation.

pub mod linearize;
pub mod resolve;

pub use linearize::{linearize, CodeBlock, Instr, Program};
pub use resolve::{resolve, Resolution};
