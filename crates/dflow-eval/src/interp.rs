//! Batch interpreter for linearized block programs.
//!
//! Runs a [`Program`] over a flat slot array, one slot per addressed node.
//! This is the non-incremental path: no memoization, no per-node error
//! recovery -- the first operator failure aborts the run. The session engine
//! in [`crate::session`] and this interpreter must agree on results; the
//! scenario tests hold them to that.

use tracing::trace;

use dflow_core::error::{DflowError, Position};
use dflow_core::graph::Circuit;
use dflow_core::id::{BlockId, GraphId};
use dflow_core::ops::OpKind;
use dflow_compile::linearize::{linearize, Instr, Program};
use dflow_compile::resolve::resolve;

use crate::registry::{parse_literal, Registry};
use crate::session::selected_arm;
use crate::value::Value;

/// Instruction execution cap for one `run_program` call, loop iterations
/// included.
const STEP_LIMIT: usize = 1_000_000;

const MAX_DEPTH: usize = 256;

/// Compiles and runs one graph of the circuit.
pub fn run_graph(
    circuit: &Circuit,
    graph: GraphId,
    registry: &Registry,
    inputs: &[Value],
) -> Result<Value, DflowError> {
    run_at_depth(circuit, graph, registry, inputs, 0)
}

fn run_at_depth(
    circuit: &Circuit,
    graph: GraphId,
    registry: &Registry,
    inputs: &[Value],
    depth: usize,
) -> Result<Value, DflowError> {
    if depth >= MAX_DEPTH {
        return Err(DflowError::RecursionLimit {
            limit: MAX_DEPTH,
            at: Position::none(),
        });
    }
    let g = circuit.graph(graph)?;
    let res = resolve(g)?;
    let program = linearize(g, &res)?;
    run_program_at(circuit, &program, registry, inputs, depth)
}

/// Executes an already-linearized program.
pub fn run_program(
    circuit: &Circuit,
    program: &Program,
    registry: &Registry,
    inputs: &[Value],
) -> Result<Value, DflowError> {
    run_program_at(circuit, program, registry, inputs, 0)
}

fn run_program_at(
    circuit: &Circuit,
    program: &Program,
    registry: &Registry,
    inputs: &[Value],
    depth: usize,
) -> Result<Value, DflowError> {
    let mut slots: Vec<Option<Value>> = vec![None; program.slots as usize];
    let mut steps = 0usize;
    let mut cur = Some(program.entry);

    while let Some(id) = cur {
        let block = program.block(id);
        for instr in &block.code {
            steps += 1;
            if steps > STEP_LIMIT {
                return Err(DflowError::StepBudget {
                    at: Position::node(instr.node),
                });
            }
            exec(circuit, registry, inputs, &mut slots, instr, depth)?;
        }
        cur = successor(program, id, &mut slots)?;
    }

    slots
        .get(program.result.0 as usize)
        .and_then(|v| v.clone())
        .ok_or(DflowError::MissingInput {
            at: Position::none(),
        })
}

/// Picks the next block after `id` has run.
fn successor(
    program: &Program,
    id: BlockId,
    slots: &mut [Option<Value>],
) -> Result<Option<BlockId>, DflowError> {
    let block = program.block(id);
    if block.looping {
        // The LoopEnd tail already decided: its own slot is filled only on
        // exit.
        let tail = block.code.last().ok_or(DflowError::Stalled {
            nodes: vec![],
            at: Position::none(),
        })?;
        let cond = slot_value(slots, tail.ins[1].map(|a| a.0), tail.node)?;
        let again = cond.as_bool().ok_or_else(|| DflowError::TypeMismatch {
            expected: "bool".to_string(),
            got: cond.type_name().to_string(),
            at: Position::node(tail.node),
        })?;
        if again {
            return Ok(Some(block.arms[0]));
        }
        // Reset the head slot so an enclosing loop can re-enter this one.
        if let Some(head) = tail.ins[2] {
            slots[head.0 as usize] = None;
        }
        return Ok(block.next);
    }
    if !block.arms.is_empty() {
        let ctx = block.context.ok_or(DflowError::Stalled {
            nodes: vec![],
            at: Position::none(),
        })?;
        let cond = slots[ctx.0 as usize]
            .clone()
            .ok_or(DflowError::MissingInput {
                at: Position::none(),
            })?;
        let sel = selected_arm(&cond, block.arms.len() as u16)?;
        return Ok(Some(block.arms[sel as usize]));
    }
    Ok(block.next)
}

fn slot_value(
    slots: &[Option<Value>],
    idx: Option<u32>,
    node: dflow_core::id::NodeId,
) -> Result<Value, DflowError> {
    idx.and_then(|i| slots.get(i as usize).cloned().flatten())
        .ok_or(DflowError::MissingInput {
            at: Position::node(node),
        })
}

fn exec(
    circuit: &Circuit,
    registry: &Registry,
    inputs: &[Value],
    slots: &mut Vec<Option<Value>>,
    instr: &Instr,
    depth: usize,
) -> Result<(), DflowError> {
    let at = Position::node(instr.node);
    trace!(node = %instr.node, op = ?instr.op, "exec");
    let out = instr.out.0 as usize;

    match &instr.op {
        OpKind::Const => {
            let text = instr.args.first().map(String::as_str).unwrap_or("");
            slots[out] = Some(parse_literal(text).map_err(|e| e.at(at))?);
        }
        OpKind::Input { index } => {
            let v = inputs
                .get(*index as usize)
                .cloned()
                .ok_or(DflowError::MissingInput { at })?;
            slots[out] = Some(v);
        }
        OpKind::Output => {
            slots[out] = Some(slot_value(slots, instr.ins[0].map(|a| a.0), instr.node)?);
        }
        OpKind::LoopHead => {
            // Holds its iteration state; only the first pass reads the
            // initial value.
            if slots[out].is_none() {
                slots[out] = Some(slot_value(slots, instr.ins[0].map(|a| a.0), instr.node)?);
            }
        }
        OpKind::LoopEnd => {
            let state = slot_value(slots, instr.ins[0].map(|a| a.0), instr.node)?;
            let cond = slot_value(slots, instr.ins[1].map(|a| a.0), instr.node)?;
            let again = cond.as_bool().ok_or_else(|| DflowError::TypeMismatch {
                expected: "bool".to_string(),
                got: cond.type_name().to_string(),
                at,
            })?;
            if again {
                if let Some(head) = instr.ins[2] {
                    slots[head.0 as usize] = Some(state);
                }
            } else {
                slots[out] = Some(state);
            }
        }
        OpKind::Switch { width, .. } => {
            // Arm tail: the taken arm writes its value into the switch slot.
            if *width == 1 {
                slots[out] = Some(slot_value(slots, instr.ins[0].map(|a| a.0), instr.node)?);
            } else {
                let mut vals = Vec::with_capacity(instr.ins.len());
                for a in &instr.ins {
                    vals.push(slot_value(slots, a.map(|x| x.0), instr.node)?);
                }
                slots[out] = Some(Value::List(vals));
            }
        }
        OpKind::Pack { .. } => {
            let mut vals = Vec::with_capacity(instr.ins.len());
            for a in &instr.ins {
                vals.push(slot_value(slots, a.map(|x| x.0), instr.node)?);
            }
            slots[out] = Some(Value::List(vals));
        }
        OpKind::Call { target, .. } => {
            let mut vals = Vec::with_capacity(instr.ins.len());
            for a in &instr.ins {
                vals.push(slot_value(slots, a.map(|x| x.0), instr.node)?);
            }
            let v = run_at_depth(circuit, *target, registry, &vals, depth + 1)
                .map_err(|e| e.into_frame(at))?;
            slots[out] = Some(v);
        }
        op => {
            let name = op.dispatch_name().ok_or_else(|| DflowError::Unsupported {
                name: format!("{op:?}"),
                tag: "any".to_string(),
                at,
            })?;
            let mut vals = Vec::with_capacity(instr.ins.len());
            for a in &instr.ins {
                vals.push(slot_value(slots, a.map(|x| x.0), instr.node)?);
            }
            slots[out] = Some(registry.dispatch(name, &vals).map_err(|e| e.at(at))?);
        }
    }
    Ok(())
}
