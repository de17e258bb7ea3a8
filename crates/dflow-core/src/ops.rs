//! Operator vocabulary for the dataflow graph.
//!
//! [`OpKind`] is the complete set of operations a node can perform, grouped
//! by sub-enum where the editor exposes families of blocks (arithmetic,
//! comparison, logic). Polymorphic operators carry no type information of
//! their own -- they are resolved against the concrete type of their first
//! operand through the dispatch registry, using the name reported by
//! [`OpKind::dispatch_name`].
//!
//! Control-region operators are special-cased everywhere downstream:
//! - [`OpKind::Switch`] opens one scope branch per arm,
//! - [`OpKind::LoopHead`] / [`OpKind::LoopEnd`] delimit a loop region,
//! - [`OpKind::Call`] pushes a nested evaluation frame.

use serde::{Deserialize, Serialize};

use crate::id::GraphId;

/// Binary arithmetic operators. Dispatch names: `add`, `sub`, `mul`, `div`,
/// `rem`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

/// Comparison operators. Dispatch names: `eq`, `ne`, `lt`, `le`, `gt`, `ge`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Binary logic operators. Dispatch names: `and`, `or`, `xor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogicOp {
    And,
    Or,
    Xor,
}

/// The operation performed by one graph node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    /// A constant. The literal text lives in the node's argument strings and
    /// is parsed lazily through the dispatch registry.
    Const,
    /// External input slot of the containing graph.
    Input { index: u16 },
    /// The designated output node. Exactly one per graph.
    Output,

    /// Binary arithmetic, dispatched on the first operand's type.
    Arith { op: ArithOp },
    /// Arithmetic negation.
    Neg,
    /// Comparison, producing a boolean.
    Compare { op: CmpOp },
    /// Binary logic on booleans (bitwise on integers).
    Logic { op: LogicOp },
    /// Logical NOT.
    Not,

    /// Container indexing: `item(container, index)`.
    Item,
    /// Container/string length.
    Len,
    /// Builds a list from `count` inputs.
    Pack { count: u16 },

    /// Conditional region (SWT). Input 0 is the condition; the remaining
    /// inputs are `arms` groups of `width` pins each. The arm selected by the
    /// condition provides the node's value.
    Switch { arms: u16, width: u16 },
    /// Loop state seed. Input 0 is the initial state; the output is the
    /// state of the current iteration. Must live inside the body region of
    /// exactly one [`OpKind::LoopEnd`].
    LoopHead,
    /// Loop exit (END). Input 0 is the state produced by the body, input 1
    /// the continue condition. While the condition holds, the state feeds
    /// back into the paired [`OpKind::LoopHead`]; once it fails, the state
    /// becomes the node's value.
    LoopEnd,

    /// Sub-graph invocation with `args` argument pins.
    Call { target: GraphId, args: u16 },
}

impl OpKind {
    /// Number of input ports this operation declares.
    pub fn arity(&self) -> u16 {
        match self {
            OpKind::Const | OpKind::Input { .. } => 0,
            OpKind::Output | OpKind::Neg | OpKind::Not | OpKind::Len | OpKind::LoopHead => 1,
            OpKind::Arith { .. }
            | OpKind::Compare { .. }
            | OpKind::Logic { .. }
            | OpKind::Item
            | OpKind::LoopEnd => 2,
            OpKind::Pack { count } => *count,
            OpKind::Switch { arms, width } => {
                // Assembly rejects layouts whose pin count exceeds u16.
                let pins = 1 + u32::from(*arms) * u32::from(*width);
                pins.min(u32::from(u16::MAX)) as u16
            }
            OpKind::Call { args, .. } => *args,
        }
    }

    /// The per-type operator name used by the dispatch registry, when this
    /// operation is polymorphic. Control and structural operations return
    /// `None` and are evaluated by the engine directly.
    pub fn dispatch_name(&self) -> Option<&'static str> {
        match self {
            OpKind::Arith { op } => Some(match op {
                ArithOp::Add => "add",
                ArithOp::Sub => "sub",
                ArithOp::Mul => "mul",
                ArithOp::Div => "div",
                ArithOp::Rem => "rem",
            }),
            OpKind::Neg => Some("neg"),
            OpKind::Compare { op } => Some(match op {
                CmpOp::Eq => "eq",
                CmpOp::Ne => "ne",
                CmpOp::Lt => "lt",
                CmpOp::Le => "le",
                CmpOp::Gt => "gt",
                CmpOp::Ge => "ge",
            }),
            OpKind::Logic { op } => Some(match op {
                LogicOp::And => "and",
                LogicOp::Or => "or",
                LogicOp::Xor => "xor",
            }),
            OpKind::Not => Some("not"),
            OpKind::Item => Some("item"),
            OpKind::Len => Some("len"),
            _ => None,
        }
    }

}
