//! Assembly: editor block descriptions -> [`Circuit`].
//!
//! The editor hands the core an ordered block list. Each block carries its
//! operator name, argument strings, and an integer-encoded input list: each
//! entry is `(source block index << 16) | source output index`, or -1 for an
//! unconnected pin. Assembly errors are structural and always carry the
//! offending block (and pin) index so the editor can highlight the exact
//! connection.

use serde::{Deserialize, Serialize};

use crate::error::{DflowError, Position};
use crate::graph::{Circuit, OpGraph};
use crate::id::{GraphId, NodeId};
use crate::ops::{ArithOp, CmpOp, LogicOp, OpKind};

/// Pin encoding for "unconnected". The only well-formed negative value;
/// assembly rejects every other one.
pub const UNCONNECTED: i32 = -1;

/// Encodes a pin reference to `output` of `block`.
pub fn pin_ref(block: u32, output: u16) -> i32 {
    debug_assert!(block < 1 << 15, "block index {block} exceeds pin encoding");
    ((block << 16) | output as u32) as i32
}

/// Decodes a pin reference; `None` for any negative value.
pub fn decode_pin(raw: i32) -> Option<(u32, u16)> {
    if raw < 0 {
        return None;
    }
    let raw = raw as u32;
    Some((raw >> 16, (raw & 0xffff) as u16))
}

/// One block as delivered by the editor/storage layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDesc {
    pub op: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub inputs: Vec<i32>,
}

impl BlockDesc {
    pub fn new(op: &str, args: &[&str], inputs: Vec<i32>) -> Self {
        BlockDesc {
            op: op.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            inputs,
        }
    }
}

fn parse_u16_arg(desc: &BlockDesc, idx: usize, at: Position) -> Result<u16, DflowError> {
    let text = desc.args.get(idx).ok_or(DflowError::BadArgument {
        text: format!("{} missing argument {}", desc.op, idx),
        at,
    })?;
    text.parse::<u16>().map_err(|_| DflowError::BadArgument {
        text: text.clone(),
        at,
    })
}

/// Resolves a block's operator name and arguments to an [`OpKind`].
fn parse_op(desc: &BlockDesc, at: Position) -> Result<OpKind, DflowError> {
    let op = match desc.op.as_str() {
        "const" => OpKind::Const,
        "in" => OpKind::Input {
            index: parse_u16_arg(desc, 0, at)?,
        },
        "out" => OpKind::Output,
        "add" => OpKind::Arith { op: ArithOp::Add },
        "sub" => OpKind::Arith { op: ArithOp::Sub },
        "mul" => OpKind::Arith { op: ArithOp::Mul },
        "div" => OpKind::Arith { op: ArithOp::Div },
        "rem" => OpKind::Arith { op: ArithOp::Rem },
        "neg" => OpKind::Neg,
        "eq" => OpKind::Compare { op: CmpOp::Eq },
        "ne" => OpKind::Compare { op: CmpOp::Ne },
        "lt" => OpKind::Compare { op: CmpOp::Lt },
        "le" => OpKind::Compare { op: CmpOp::Le },
        "gt" => OpKind::Compare { op: CmpOp::Gt },
        "ge" => OpKind::Compare { op: CmpOp::Ge },
        "and" => OpKind::Logic { op: LogicOp::And },
        "or" => OpKind::Logic { op: LogicOp::Or },
        "xor" => OpKind::Logic { op: LogicOp::Xor },
        "not" => OpKind::Not,
        "item" => OpKind::Item,
        "len" => OpKind::Len,
        "pack" => OpKind::Pack {
            count: if desc.args.is_empty() {
                desc.inputs.len() as u16
            } else {
                parse_u16_arg(desc, 0, at)?
            },
        },
        "swt" => {
            let arms = if desc.args.is_empty() {
                2
            } else {
                parse_u16_arg(desc, 0, at)?
            };
            let width = if desc.args.len() < 2 {
                1
            } else {
                parse_u16_arg(desc, 1, at)?
            };
            let pins = 1 + u32::from(arms) * u32::from(width);
            if arms == 0 || width == 0 || pins > u32::from(u16::MAX) {
                return Err(DflowError::BadArgument {
                    text: format!("swt arm layout {arms}x{width}"),
                    at,
                });
            }
            OpKind::Switch { arms, width }
        }
        "loop" => OpKind::LoopHead,
        "end" => OpKind::LoopEnd,
        "call" => OpKind::Call {
            target: GraphId(parse_u16_arg(desc, 0, at)? as u32),
            args: desc.inputs.len() as u16,
        },
        other => {
            return Err(DflowError::UnknownOperator {
                op: other.to_string(),
                at,
            })
        }
    };
    Ok(op)
}

/// Assembles one graph from its block list.
fn assemble_graph(gid: GraphId, blocks: &[BlockDesc]) -> Result<OpGraph, DflowError> {
    let mut graph = OpGraph::new();
    let mut ids: Vec<NodeId> = Vec::with_capacity(blocks.len());

    // First pass: nodes, with declared-input validation per operator.
    for (index, desc) in blocks.iter().enumerate() {
        let at = Position::block(index as u32);
        let op = parse_op(desc, at)?;
        let expected = op.arity();
        if desc.inputs.len() != expected as usize {
            // A switch whose pin list doesn't form whole arm groups is the
            // "branch arms don't match" case; everything else is plain arity.
            return Err(match op {
                OpKind::Switch { arms, width } => DflowError::BranchMismatch {
                    arms,
                    width,
                    need: expected as usize,
                    got: desc.inputs.len(),
                    at,
                },
                _ => DflowError::ArityMismatch {
                    op: desc.op.clone(),
                    expected,
                    got: desc.inputs.len(),
                    at,
                },
            });
        }
        let id = graph.add_node(op, desc.args.clone(), index as u32)?;
        ids.push(id);
    }

    if graph.output().is_none() {
        return Err(DflowError::MissingOutput { graph: gid });
    }

    // Second pass: wires.
    for (index, desc) in blocks.iter().enumerate() {
        for (pin, &raw) in desc.inputs.iter().enumerate() {
            if raw == UNCONNECTED {
                continue;
            }
            let at = Position::block_pin(index as u32, pin as u16);
            let Some((src_block, src_out)) = decode_pin(raw) else {
                return Err(DflowError::BadArgument {
                    text: format!("pin reference {raw}"),
                    at,
                });
            };
            let src = *ids
                .get(src_block as usize)
                .ok_or(DflowError::DanglingPin {
                    target: src_block,
                    at,
                })?;
            graph.connect(ids[index], pin as u16, src, src_out)?;
        }
    }

    Ok(graph)
}

/// Assembles a single-graph circuit.
pub fn assemble(blocks: &[BlockDesc]) -> Result<Circuit, DflowError> {
    let graphs = vec![blocks.to_vec()];
    assemble_circuit(&graphs)
}

/// Assembles a multi-graph circuit; graph 0 is the entry graph and `call`
/// blocks reference the others by index.
pub fn assemble_circuit(graphs: &[Vec<BlockDesc>]) -> Result<Circuit, DflowError> {
    let mut circuit = Circuit::new();
    for (i, blocks) in graphs.iter().enumerate() {
        let graph = assemble_graph(GraphId(i as u32), blocks)?;
        circuit.add_graph(graph);
    }

    // Call targets must exist and be handed every input slot they declare.
    for gi in 0..circuit.graph_count() {
        let graph = circuit.graph(GraphId(gi as u32))?;
        for id in graph.node_ids() {
            if let Some(OpKind::Call { target, args }) = graph.node(id).map(|n| n.op.clone()) {
                if target.0 as usize >= circuit.graph_count() {
                    return Err(DflowError::GraphNotFound { id: target });
                }
                let needed = circuit.graph(target)?.input_count();
                if args < needed {
                    let at = graph
                        .node(id)
                        .map(|w| w.position(id))
                        .unwrap_or_default();
                    return Err(DflowError::ArityMismatch {
                        op: "call".to_string(),
                        expected: needed,
                        got: args as usize,
                        at,
                    });
                }
            }
        }
    }

    Ok(circuit)
}
