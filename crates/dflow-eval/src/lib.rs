//! Evaluation engines for dflow circuits.
//!
//! Two engines share one operator vocabulary:
//! - [`session::Session`], the incremental change-propagation evaluator an
//!   editor keeps alive across edits;
//! - [`interp`], a batch interpreter over linearized block programs.
//!
//! [`preview`] wraps assembly, resolution and a session run into the single
//! call an editor makes after each edit, and [`worker`] moves that work onto
//! a cancellable background thread.

pub mod interp;
pub mod preview;
pub mod registry;
pub mod session;
pub mod value;
pub mod worker;

pub use preview::{preview, Diagnostic, Preview};
pub use registry::{parse_literal, Registry};
pub use session::{RunResource, Session, TickOutcome};
pub use value::{TypeTag, Value};
pub use worker::{Job, JobOutcome, Worker};
