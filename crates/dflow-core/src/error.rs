//! Error types shared across the dflow workspace.
//!
//! A single [`DflowError`] enum covers the whole taxonomy; callers that only
//! care about the coarse category use [`DflowError::kind`]:
//! - **structural** errors are detected at assembly or scope-resolution time
//!   and are fatal to that compile attempt;
//! - **operator** errors surface during value evaluation, attached to the
//!   failing node and fatal only to its dependents;
//! - **stall** errors are raised by the scheduler when no progress is
//!   possible with unmet demand.
//!
//! Every variant carries a [`Position`] with enough information (block
//! index, node id, pin index) for the editor to highlight the offending
//! connection. Errors crossing a frame boundary are wrapped in
//! [`DflowError::Frame`] so the top-level error chains through the call
//! stack.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::id::{GraphId, NodeId};

/// Coarse error category, per the diagnostics contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    Structural,
    Operator,
    Stall,
}

/// Source position of a diagnostic: the editor block the node was assembled
/// from, the node itself, and the input pin, where known.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub block: Option<u32>,
    pub node: Option<NodeId>,
    pub pin: Option<u16>,
}

impl Position {
    pub fn none() -> Self {
        Position::default()
    }

    pub fn node(node: NodeId) -> Self {
        Position {
            node: Some(node),
            ..Position::default()
        }
    }

    pub fn pin(node: NodeId, pin: u16) -> Self {
        Position {
            node: Some(node),
            pin: Some(pin),
            ..Position::default()
        }
    }

    pub fn block(block: u32) -> Self {
        Position {
            block: Some(block),
            ..Position::default()
        }
    }

    pub fn block_pin(block: u32, pin: u16) -> Self {
        Position {
            block: Some(block),
            pin: Some(pin),
            ..Position::default()
        }
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.block, self.node, self.pin) {
            (Some(b), _, Some(p)) => write!(f, "block {b} pin {p}"),
            (Some(b), _, None) => write!(f, "block {b}"),
            (None, Some(n), Some(p)) => write!(f, "node {n} pin {p}"),
            (None, Some(n), None) => write!(f, "node {n}"),
            _ => write!(f, "<unknown>"),
        }
    }
}

/// Errors produced anywhere in the dflow pipeline.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum DflowError {
    // -- structural: assembly ------------------------------------------------
    #[error("unknown operator '{op}' at {at}")]
    UnknownOperator { op: String, at: Position },

    #[error("operator '{op}' expects {expected} inputs, got {got} at {at}")]
    ArityMismatch {
        op: String,
        expected: u16,
        got: usize,
        at: Position,
    },

    #[error("branch arms don't match: {arms} arms of width {width} need {need} pins, got {got} at {at}")]
    BranchMismatch {
        arms: u16,
        width: u16,
        need: usize,
        got: usize,
        at: Position,
    },

    #[error("bad operator argument '{text}' at {at}")]
    BadArgument { text: String, at: Position },

    #[error("pin reference to missing block {target} at {at}")]
    DanglingPin { target: u32, at: Position },

    #[error("pin {pin} out of range (operator has {arity} inputs) at {at}")]
    InvalidPin { pin: u16, arity: u16, at: Position },

    #[error("graph {graph} has no output block")]
    MissingOutput { graph: GraphId },

    #[error("second output block at {at}")]
    DuplicateOutput { at: Position },

    #[error("graph not found: {id}")]
    GraphNotFound { id: GraphId },

    #[error("node not found: {id}")]
    NodeNotFound { id: NodeId },

    // -- structural: scope resolution ----------------------------------------
    #[error("circular dependency at {at}")]
    CircularDependency { at: Position },

    #[error("loop without a valid header at {at}")]
    LoopWithoutHeader { at: Position },

    #[error("loop state escapes its loop at {at}")]
    LoopEscape { at: Position },

    // -- operator -------------------------------------------------------------
    #[error("unsupported operation '{name}' for {tag} at {at}")]
    Unsupported {
        name: String,
        tag: String,
        at: Position,
    },

    #[error("type mismatch: expected {expected}, got {got} at {at}")]
    TypeMismatch {
        expected: String,
        got: String,
        at: Position,
    },

    #[error("divide by zero at {at}")]
    DivideByZero { at: Position },

    #[error("index {index} out of range (len {len}) at {at}")]
    OutOfRange {
        index: i64,
        len: usize,
        at: Position,
    },

    #[error("bad literal '{text}' at {at}")]
    BadLiteral { text: String, at: Position },

    #[error("missing input at {at}")]
    MissingInput { at: Position },

    #[error("recursion limit ({limit}) exceeded at {at}")]
    RecursionLimit { limit: usize, at: Position },

    #[error("step budget exhausted at {at}")]
    StepBudget { at: Position },

    // -- stall ----------------------------------------------------------------
    #[error("evaluation stalled: no progress possible for {} node(s), first at {at}", nodes.len())]
    Stalled { nodes: Vec<NodeId>, at: Position },

    // -- frame wrapping --------------------------------------------------------
    #[error("in call at {at}")]
    Frame {
        at: Position,
        #[source]
        cause: Box<DflowError>,
    },
}

impl DflowError {
    /// The coarse category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DflowError::UnknownOperator { .. }
            | DflowError::ArityMismatch { .. }
            | DflowError::BranchMismatch { .. }
            | DflowError::BadArgument { .. }
            | DflowError::DanglingPin { .. }
            | DflowError::InvalidPin { .. }
            | DflowError::MissingOutput { .. }
            | DflowError::DuplicateOutput { .. }
            | DflowError::GraphNotFound { .. }
            | DflowError::NodeNotFound { .. }
            | DflowError::CircularDependency { .. }
            | DflowError::LoopWithoutHeader { .. }
            | DflowError::LoopEscape { .. } => ErrorKind::Structural,
            DflowError::Stalled { .. } => ErrorKind::Stall,
            DflowError::Frame { cause, .. } => cause.kind(),
            _ => ErrorKind::Operator,
        }
    }

    /// The position attached to this error (the wrapper's position for
    /// frame-wrapped errors).
    pub fn position(&self) -> Position {
        match self {
            DflowError::UnknownOperator { at, .. }
            | DflowError::ArityMismatch { at, .. }
            | DflowError::BranchMismatch { at, .. }
            | DflowError::BadArgument { at, .. }
            | DflowError::DanglingPin { at, .. }
            | DflowError::InvalidPin { at, .. }
            | DflowError::DuplicateOutput { at }
            | DflowError::CircularDependency { at }
            | DflowError::LoopWithoutHeader { at }
            | DflowError::LoopEscape { at }
            | DflowError::Unsupported { at, .. }
            | DflowError::TypeMismatch { at, .. }
            | DflowError::DivideByZero { at }
            | DflowError::OutOfRange { at, .. }
            | DflowError::BadLiteral { at, .. }
            | DflowError::MissingInput { at }
            | DflowError::RecursionLimit { at, .. }
            | DflowError::StepBudget { at }
            | DflowError::Stalled { at, .. }
            | DflowError::Frame { at, .. } => *at,
            DflowError::MissingOutput { .. }
            | DflowError::GraphNotFound { .. }
            | DflowError::NodeNotFound { .. } => Position::none(),
        }
    }

    /// Replaces an empty position with `at`. Positions already set win, so
    /// the innermost attribution survives re-wrapping.
    pub fn at(self, at: Position) -> Self {
        if self.position() != Position::none() {
            return self;
        }
        self.relocate(at)
    }

    fn relocate(self, at: Position) -> Self {
        use DflowError::*;
        match self {
            UnknownOperator { op, .. } => UnknownOperator { op, at },
            ArityMismatch { op, expected, got, .. } => ArityMismatch { op, expected, got, at },
            BranchMismatch { arms, width, need, got, .. } => BranchMismatch { arms, width, need, got, at },
            BadArgument { text, .. } => BadArgument { text, at },
            DanglingPin { target, .. } => DanglingPin { target, at },
            InvalidPin { pin, arity, .. } => InvalidPin { pin, arity, at },
            DuplicateOutput { .. } => DuplicateOutput { at },
            CircularDependency { .. } => CircularDependency { at },
            LoopWithoutHeader { .. } => LoopWithoutHeader { at },
            LoopEscape { .. } => LoopEscape { at },
            Unsupported { name, tag, .. } => Unsupported { name, tag, at },
            TypeMismatch { expected, got, .. } => TypeMismatch { expected, got, at },
            DivideByZero { .. } => DivideByZero { at },
            OutOfRange { index, len, .. } => OutOfRange { index, len, at },
            BadLiteral { text, .. } => BadLiteral { text, at },
            MissingInput { .. } => MissingInput { at },
            RecursionLimit { limit, .. } => RecursionLimit { limit, at },
            StepBudget { .. } => StepBudget { at },
            Stalled { nodes, .. } => Stalled { nodes, at },
            Frame { cause, .. } => Frame { at, cause },
            other => other,
        }
    }

    /// Wraps a child-frame error with the calling node's position.
    pub fn into_frame(self, at: Position) -> Self {
        DflowError::Frame {
            at,
            cause: Box::new(self),
        }
    }

    /// The innermost error of a frame chain.
    pub fn root_cause(&self) -> &DflowError {
        match self {
            DflowError::Frame { cause, .. } => cause.root_cause(),
            other => other,
        }
    }
}
