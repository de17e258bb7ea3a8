//! dflow-core: graph model, operator vocabulary, scope tree, and assembly
//! for the dflow dataflow language backend.

pub mod assemble;
pub mod error;
pub mod graph;
pub mod id;
pub mod ops;
pub mod scope;

pub use assemble::{assemble, assemble_circuit, decode_pin, pin_ref, BlockDesc, UNCONNECTED};
pub use error::{DflowError, ErrorKind, Position};
pub use graph::{Circuit, OpGraph, OpNode, WireEdge};
pub use id::{Address, BlockId, GraphId, NodeId, ScopeId};
pub use ops::{ArithOp, CmpOp, LogicOp, OpKind};
pub use scope::{Scope, ScopeArena, ROOT};
