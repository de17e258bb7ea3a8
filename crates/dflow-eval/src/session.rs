//! The incremental evaluation session.
//!
//! A [`Session`] evaluates a [`Circuit`] by change propagation over the
//! resolved graph. Every live node is queued once; firings pop in
//! descending-address order, which is producers-first, so a single pass over
//! the queue settles a straight-line graph. A node that fires to a new value
//! re-queues its consumers; a node whose recomputation produces the same
//! value stops the wave there, which is what makes re-evaluation after an
//! edit proportional to the changed region rather than the whole graph.
//!
//! Control flow gates the wave through scope regions:
//! - a node only fires while its region is active; conditional arms become
//!   active when their switch's condition value selects them, so untaken
//!   arms never execute;
//! - a `LoopEnd` whose condition holds writes the body's state into the
//!   paired head's slot and wakes the head's consumers, driving the next
//!   iteration as one more wave (propagation inside loop bodies never
//!   short-circuits on equality, so iteration always reaches the exit);
//! - a `Call` pushes a child frame; the child's output value lands in the
//!   calling node's slot, and a child failure surfaces at the call site
//!   wrapped in a frame error.
//!
//! Operator failures are recorded per node and block only that node's
//! dependents. The session finishes a frame when its output slot fills, and
//! reports a stall with the incomplete node set when the queue drains with
//! the output still empty.

use std::collections::{BinaryHeap, HashMap, HashSet};

use tracing::{debug, trace};

use dflow_core::error::{DflowError, Position};
use dflow_core::graph::{Circuit, OpGraph, OpNode};
use dflow_core::id::{Address, GraphId, NodeId, ScopeId};
use dflow_core::ops::OpKind;
use dflow_core::scope::{Scope, ScopeArena};
use dflow_compile::resolve::{resolve, Resolution};

use crate::registry::{parse_literal, Registry};
use crate::value::Value;

/// Call depth cap, matching the editor's preview limit.
const MAX_DEPTH: usize = 256;

/// Firings per [`Session::tick`] call.
const DEFAULT_BATCH: usize = 512;

/// Result of one evaluation batch.
#[derive(Debug, Clone)]
pub enum TickOutcome {
    /// Work remains; call `tick` again.
    Running,
    /// The root output is computed.
    Done(Value),
    /// The root frame cannot make progress.
    Failed(DflowError),
}

/// An external resource opened on behalf of a run, force-closed when the
/// session is dropped so an abandoned preview never leaks handles.
pub trait RunResource: Send {
    fn close(&mut self);
}

/// One evaluation frame: the value store for a single graph instance.
struct Frame {
    graph: GraphId,
    args: Vec<Value>,
    /// The `Call` node in the parent frame, `None` for the root.
    call_site: Option<NodeId>,
    values: HashMap<NodeId, Value>,
    /// Most recent first, one entry per node.
    errors: Vec<(NodeId, DflowError)>,
    queue: BinaryHeap<(Address, NodeId)>,
    queued: HashSet<NodeId>,
    /// Loop heads currently holding an iteration state rather than their
    /// initial value.
    head_written: HashSet<NodeId>,
    seeded: bool,
}

impl Frame {
    fn new(graph: GraphId, args: Vec<Value>, call_site: Option<NodeId>) -> Self {
        Frame {
            graph,
            args,
            call_site,
            values: HashMap::new(),
            errors: Vec::new(),
            queue: BinaryHeap::new(),
            queued: HashSet::new(),
            head_written: HashSet::new(),
            seeded: false,
        }
    }
}

/// Deferred frame-stack action decided while the top frame is borrowed.
enum Act {
    Continue,
    Complete(Value),
    Fail(DflowError),
    Push {
        target: GraphId,
        args: Vec<Value>,
        site: NodeId,
    },
}

/// What a single node firing produced.
enum Fired {
    /// Waiting on inputs or an inactive region.
    Skip,
    /// An error was recorded, or state was written without a value change.
    Recorded,
    Value(Value),
    Call { target: GraphId, args: Vec<Value> },
}

enum Gather {
    Value(Value),
    Wait,
    Blocked,
}

pub struct Session {
    frames: Vec<Frame>,
    resolutions: HashMap<GraphId, Resolution>,
    resources: Vec<Box<dyn RunResource>>,
    batch: usize,
}

impl Session {
    /// A session rooted at graph 0 with the given external inputs.
    pub fn new(args: Vec<Value>) -> Self {
        Session {
            frames: vec![Frame::new(GraphId(0), args, None)],
            resolutions: HashMap::new(),
            resources: Vec::new(),
            batch: DEFAULT_BATCH,
        }
    }

    /// Registers a resource to be force-closed when the session is dropped.
    pub fn track(&mut self, resource: Box<dyn RunResource>) {
        self.resources.push(resource);
    }

    /// Operator errors recorded in the root frame, most recent first.
    pub fn errors(&self) -> &[(NodeId, DflowError)] {
        &self.frames[0].errors
    }

    /// Runs one bounded batch of firings.
    pub fn tick(&mut self, circuit: &Circuit, registry: &Registry) -> TickOutcome {
        let mut fired = 0usize;
        loop {
            if fired >= self.batch {
                return TickOutcome::Running;
            }
            fired += 1;

            let gid = match self.frames.last() {
                Some(f) => f.graph,
                None => return TickOutcome::Failed(DflowError::GraphNotFound { id: GraphId(0) }),
            };
            let graph = match circuit.graph(gid) {
                Ok(g) => g,
                Err(e) => {
                    match self.settle(circuit, Act::Fail(e)) {
                        Some(out) => return out,
                        None => continue,
                    }
                }
            };
            if !self.resolutions.contains_key(&gid) {
                match resolve(graph) {
                    Ok(r) => {
                        self.resolutions.insert(gid, r);
                    }
                    Err(e) => {
                        match self.settle(circuit, Act::Fail(e)) {
                            Some(out) => return out,
                            None => continue,
                        }
                    }
                }
            }

            let act = {
                let res = &self.resolutions[&gid];
                let frame = match self.frames.last_mut() {
                    Some(f) => f,
                    None => return TickOutcome::Failed(DflowError::GraphNotFound { id: gid }),
                };
                if !frame.seeded {
                    frame.seeded = true;
                    for &n in &res.order {
                        enqueue(frame, res, n);
                    }
                }
                step_frame(frame, graph, res, registry)
            };
            match self.settle(circuit, act) {
                Some(out) => return out,
                None => {}
            }
        }
    }

    /// Ticks until the root frame settles, bounded by `max_ticks` batches.
    pub fn run(
        &mut self,
        circuit: &Circuit,
        registry: &Registry,
        max_ticks: usize,
    ) -> Result<Value, DflowError> {
        for _ in 0..max_ticks {
            match self.tick(circuit, registry) {
                TickOutcome::Running => continue,
                TickOutcome::Done(v) => return Ok(v),
                TickOutcome::Failed(e) => return Err(e),
            }
        }
        Err(DflowError::StepBudget {
            at: Position::none(),
        })
    }

    /// Replaces one external input value and dirties every `Input` node
    /// reading that slot.
    pub fn input(&mut self, circuit: &Circuit, index: u16, value: Value) {
        let root = &mut self.frames[0];
        if root.args.len() <= index as usize {
            root.args.resize(index as usize + 1, Value::Unit);
        }
        root.args[index as usize] = value;
        let Ok(graph) = circuit.graph(self.frames[0].graph) else {
            return;
        };
        let readers: Vec<NodeId> = graph
            .node_ids()
            .filter(|&n| matches!(graph.node(n).map(|w| &w.op), Some(OpKind::Input { index: i }) if *i == index))
            .collect();
        for n in readers {
            self.invalidate(circuit, n);
        }
    }

    /// Marks `node` and everything downstream of it dirty in the root frame
    /// and re-queues it. Call frames are discarded; they re-open on demand.
    pub fn invalidate(&mut self, circuit: &Circuit, node: NodeId) {
        self.frames.truncate(1);
        let frame = &mut self.frames[0];
        let Ok(graph) = circuit.graph(frame.graph) else {
            return;
        };
        let Some(res) = self.resolutions.get(&frame.graph) else {
            return;
        };

        let mut seen = HashSet::new();
        let mut stack = vec![node];
        while let Some(n) = stack.pop() {
            if !seen.insert(n) {
                continue;
            }
            frame.values.remove(&n);
            frame.head_written.remove(&n);
            frame.errors.retain(|(m, _)| *m != n);
            for (c, _) in graph.consumers_of(n) {
                stack.push(c);
            }
        }
        // Loops whose exit was dirtied restart from their initial state.
        for (&end, &head) in &res.loop_heads {
            if seen.contains(&end) {
                frame.values.remove(&head);
                frame.head_written.remove(&head);
                enqueue(frame, res, head);
            }
        }
        enqueue(frame, res, node);
        debug!(node = %node, dirtied = seen.len(), "invalidated");
    }

    /// Drops all cached state for `graph` after a structural edit (nodes or
    /// wires changed).
    pub fn invalidate_graph(&mut self, graph: GraphId) {
        self.resolutions.remove(&graph);
        self.frames.truncate(1);
        let root = &mut self.frames[0];
        if root.graph == graph {
            root.values.clear();
            root.errors.clear();
            root.queue.clear();
            root.queued.clear();
            root.head_written.clear();
            root.seeded = false;
        }
    }

    /// Applies a frame-stack action; `Some` means the tick is over.
    fn settle(&mut self, circuit: &Circuit, act: Act) -> Option<TickOutcome> {
        match act {
            Act::Continue => None,
            Act::Push { target, args, site } => {
                if self.frames.len() >= MAX_DEPTH {
                    let frame = self.frames.last_mut()?;
                    record_error(
                        frame,
                        site,
                        DflowError::RecursionLimit {
                            limit: MAX_DEPTH,
                            at: Position::node(site),
                        },
                    );
                } else {
                    trace!(graph = %target, depth = self.frames.len(), "call frame pushed");
                    self.frames.push(Frame::new(target, args, Some(site)));
                }
                None
            }
            Act::Complete(value) => {
                if self.frames.len() == 1 {
                    return Some(TickOutcome::Done(value));
                }
                let child = self.frames.pop()?;
                let site = child.call_site?;
                self.write_back(circuit, site, Ok(value));
                None
            }
            Act::Fail(err) => {
                if self.frames.len() == 1 {
                    return Some(TickOutcome::Failed(err));
                }
                let child = self.frames.pop()?;
                let site = child.call_site?;
                self.write_back(circuit, site, Err(err));
                None
            }
        }
    }

    /// Lands a completed call's result (or wrapped failure) at its call site
    /// in the now-top frame.
    fn write_back(&mut self, circuit: &Circuit, site: NodeId, outcome: Result<Value, DflowError>) {
        let Some(frame) = self.frames.last_mut() else {
            return;
        };
        let Ok(graph) = circuit.graph(frame.graph) else {
            return;
        };
        let Some(res) = self.resolutions.get(&frame.graph) else {
            return;
        };
        match outcome {
            Ok(value) => store_value(frame, graph, res, site, value),
            Err(err) => {
                let at = graph
                    .node(site)
                    .map(|w| w.position(site))
                    .unwrap_or_default();
                record_error(frame, site, err.into_frame(at));
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        for r in &mut self.resources {
            r.close();
        }
    }
}

/// Pops and fires one node from `frame`, or diagnoses the drained queue.
fn step_frame(frame: &mut Frame, graph: &OpGraph, res: &Resolution, registry: &Registry) -> Act {
    let Some((_, node)) = frame.queue.pop() else {
        return drained(frame, graph, res);
    };
    frame.queued.remove(&node);

    match fire(frame, graph, res, registry, node) {
        Fired::Skip | Fired::Recorded => Act::Continue,
        // The depth limit is enforced by the caller; the result lands back
        // here through the write-back when the child settles.
        Fired::Call { target, args } => Act::Push {
            target,
            args,
            site: node,
        },
        Fired::Value(value) => {
            store_value(frame, graph, res, node, value);
            if graph.output() == Some(node) {
                if let Some(v) = frame.values.get(&node) {
                    return Act::Complete(v.clone());
                }
            }
            Act::Continue
        }
    }
}

/// The queue is empty: done, failed, or stalled.
fn drained(frame: &Frame, graph: &OpGraph, res: &Resolution) -> Act {
    if let Some(out) = graph.output() {
        if let Some(v) = frame.values.get(&out) {
            return Act::Complete(v.clone());
        }
    }
    if let Some((_, err)) = frame.errors.first() {
        return Act::Fail(err.clone());
    }
    let mut nodes: Vec<NodeId> = res
        .order
        .iter()
        .copied()
        .filter(|n| !frame.values.contains_key(n))
        .collect();
    nodes.sort();
    let at = nodes
        .first()
        .map(|&n| Position::node(n))
        .unwrap_or_default();
    Act::Fail(DflowError::Stalled { nodes, at })
}

/// Computes one node, assuming its region is active and inputs may be ready.
fn fire(
    frame: &mut Frame,
    graph: &OpGraph,
    res: &Resolution,
    registry: &Registry,
    node: NodeId,
) -> Fired {
    let Some(w) = graph.node(node) else {
        return Fired::Skip;
    };
    let Some(&scope) = res.node_scope.get(&node) else {
        return Fired::Skip;
    };
    if !scope_active(frame, graph, res, scope) {
        return Fired::Skip;
    }
    let op = w.op.clone();
    trace!(node = %node, op = ?op, "fire");

    match op {
        OpKind::Const => {
            let text = w.args.first().map(String::as_str).unwrap_or("");
            match parse_literal(text) {
                Ok(v) => Fired::Value(v),
                Err(e) => {
                    let at = w.position(node);
                    record_error(frame, node, e.at(at));
                    Fired::Recorded
                }
            }
        }
        OpKind::Input { index } => match frame.args.get(index as usize) {
            Some(v) => Fired::Value(v.clone()),
            None => {
                record_error(
                    frame,
                    node,
                    DflowError::MissingInput {
                        at: w.position(node),
                    },
                );
                Fired::Recorded
            }
        },
        OpKind::Output => match input_value(frame, graph, w, node, 0) {
            Gather::Value(v) => Fired::Value(v),
            Gather::Wait => Fired::Skip,
            Gather::Blocked => Fired::Recorded,
        },
        OpKind::LoopHead => {
            // A written head keeps its iteration state until the loop exits.
            if frame.head_written.contains(&node) {
                return Fired::Skip;
            }
            match input_value(frame, graph, w, node, 0) {
                Gather::Value(v) => Fired::Value(v),
                Gather::Wait => Fired::Skip,
                Gather::Blocked => Fired::Recorded,
            }
        }
        OpKind::Pack { count } => match gather(frame, graph, w, node, 0, count) {
            Ok(Some(vals)) => Fired::Value(Value::List(vals)),
            Ok(None) => Fired::Skip,
            Err(()) => Fired::Recorded,
        },
        OpKind::Switch { arms, width } => {
            let cond = match input_value(frame, graph, w, node, 0) {
                Gather::Value(v) => v,
                Gather::Wait => return Fired::Skip,
                Gather::Blocked => return Fired::Recorded,
            };
            // The condition value just became observable; regions it selects
            // may now run.
            activate_regions(frame, graph, res);
            let arm = match selected_arm(&cond, arms) {
                Ok(arm) => arm,
                Err(e) => {
                    let at = w.position(node);
                    record_error(frame, node, e.at(at));
                    return Fired::Recorded;
                }
            };
            let first = 1 + arm * width;
            match gather(frame, graph, w, node, first, width) {
                Ok(Some(mut vals)) => {
                    if width == 1 {
                        Fired::Value(vals.remove(0))
                    } else {
                        Fired::Value(Value::List(vals))
                    }
                }
                Ok(None) => Fired::Skip,
                Err(()) => Fired::Recorded,
            }
        }
        OpKind::LoopEnd => {
            let state = match input_value(frame, graph, w, node, 0) {
                Gather::Value(v) => v,
                Gather::Wait => return Fired::Skip,
                Gather::Blocked => return Fired::Recorded,
            };
            let cond = match input_value(frame, graph, w, node, 1) {
                Gather::Value(v) => v,
                Gather::Wait => return Fired::Skip,
                Gather::Blocked => return Fired::Recorded,
            };
            let Some(again) = cond.as_bool() else {
                let mut at = w.position(node);
                at.pin = Some(1);
                record_error(
                    frame,
                    node,
                    DflowError::TypeMismatch {
                        expected: "bool".to_string(),
                        got: cond.type_name().to_string(),
                        at,
                    },
                );
                return Fired::Recorded;
            };
            let Some(&head) = res.loop_heads.get(&node) else {
                return Fired::Skip;
            };
            if again {
                iterate(frame, graph, res, node, head, state);
                Fired::Recorded
            } else {
                frame.head_written.remove(&head);
                Fired::Value(state)
            }
        }
        OpKind::Call { target, args } => match gather(frame, graph, w, node, 0, args) {
            Ok(Some(vals)) => Fired::Call { target, args: vals },
            Ok(None) => Fired::Skip,
            Err(()) => Fired::Recorded,
        },
        _ => {
            let Some(name) = op.dispatch_name() else {
                return Fired::Skip;
            };
            match gather(frame, graph, w, node, 0, op.arity()) {
                Ok(Some(vals)) => match registry.dispatch(name, &vals) {
                    Ok(v) => Fired::Value(v),
                    Err(e) => {
                        let at = w.position(node);
                        record_error(frame, node, e.at(at));
                        Fired::Recorded
                    }
                },
                Ok(None) => Fired::Skip,
                Err(()) => Fired::Recorded,
            }
        }
    }
}

/// Starts the next loop iteration: the body's state lands in the head's
/// slot and the head's consumers recompute. Loops nested in this body
/// restart from their initial state.
fn iterate(
    frame: &mut Frame,
    graph: &OpGraph,
    res: &Resolution,
    end: NodeId,
    head: NodeId,
    state: Value,
) {
    frame.values.insert(head, state);
    frame.head_written.insert(head);
    if let Some(&body) = res.port_scope.get(&(end, 0)) {
        for (&inner_end, &inner_head) in &res.loop_heads {
            if inner_end == end {
                continue;
            }
            let Some(&inner_scope) = res.node_scope.get(&inner_end) else {
                continue;
            };
            if res.scopes.descends_from(inner_scope, body) {
                frame.values.remove(&inner_head);
                frame.head_written.remove(&inner_head);
                enqueue(frame, res, inner_head);
            }
        }
    }
    for (c, _) in graph.consumers_of(head) {
        enqueue(frame, res, c);
    }
}

/// Stores a computed value. Consumers re-queue on change; inside loop
/// bodies they re-queue unconditionally so iteration waves always reach the
/// loop exit.
fn store_value(frame: &mut Frame, graph: &OpGraph, res: &Resolution, node: NodeId, value: Value) {
    let changed = frame.values.get(&node) != Some(&value);
    let force = res
        .node_scope
        .get(&node)
        .is_some_and(|&s| in_loop(&res.scopes, s));
    frame.values.insert(node, value);
    frame.errors.retain(|(n, _)| *n != node);
    if changed || force {
        for (c, _) in graph.consumers_of(node) {
            enqueue(frame, res, c);
        }
    }
}

fn record_error(frame: &mut Frame, node: NodeId, err: DflowError) {
    debug!(node = %node, error = %err, "operator error");
    frame.errors.retain(|(n, _)| *n != node);
    frame.errors.insert(0, (node, err));
    frame.values.remove(&node);
}

fn enqueue(frame: &mut Frame, res: &Resolution, node: NodeId) {
    if let Some(&addr) = res.address.get(&node) {
        if frame.queued.insert(node) {
            frame.queue.push((addr, node));
        }
    }
}

/// Fetches the value wired into `port`, recording a missing-input error if
/// the pin is unconnected.
fn input_value(frame: &mut Frame, graph: &OpGraph, w: &OpNode, node: NodeId, port: u16) -> Gather {
    let Some((src, _)) = graph.producer_of(node, port) else {
        let mut at = w.position(node);
        at.pin = Some(port);
        record_error(frame, node, DflowError::MissingInput { at });
        return Gather::Blocked;
    };
    if frame.errors.iter().any(|(n, _)| *n == src) {
        return Gather::Blocked;
    }
    match frame.values.get(&src) {
        Some(v) => Gather::Value(v.clone()),
        None => Gather::Wait,
    }
}

/// Gathers `count` consecutive pins starting at `first`. `Ok(None)` means
/// some producer has not fired yet; `Err` means an error was recorded or an
/// upstream node already failed.
fn gather(
    frame: &mut Frame,
    graph: &OpGraph,
    w: &OpNode,
    node: NodeId,
    first: u16,
    count: u16,
) -> Result<Option<Vec<Value>>, ()> {
    let mut vals = Vec::with_capacity(count as usize);
    for port in first..first + count {
        match input_value(frame, graph, w, node, port) {
            Gather::Value(v) => vals.push(v),
            Gather::Wait => return Ok(None),
            Gather::Blocked => return Err(()),
        }
    }
    Ok(Some(vals))
}

/// Maps a switch condition to the selected arm. A false boolean needs a
/// second arm; with only one it is out of range like an integer selector
/// would be.
pub(crate) fn selected_arm(cond: &Value, arms: u16) -> Result<u16, DflowError> {
    match cond {
        Value::Bool(true) => Ok(0),
        Value::Bool(false) => {
            if arms > 1 {
                Ok(1)
            } else {
                Err(DflowError::OutOfRange {
                    index: 1,
                    len: arms as usize,
                    at: Position::none(),
                })
            }
        }
        Value::Int(i) => {
            if *i >= 0 && (*i as u64) < arms as u64 {
                Ok(*i as u16)
            } else {
                Err(DflowError::OutOfRange {
                    index: *i,
                    len: arms as usize,
                    at: Position::none(),
                })
            }
        }
        other => Err(DflowError::TypeMismatch {
            expected: "bool or int".to_string(),
            got: other.type_name().to_string(),
            at: Position::none(),
        }),
    }
}

/// Whether a region may execute given the condition values known so far.
fn scope_active(frame: &Frame, graph: &OpGraph, res: &Resolution, scope: ScopeId) -> bool {
    match res.scopes.get(scope) {
        Scope::Root => true,
        Scope::Branch {
            parent,
            switch,
            arm,
            is_loop,
            ..
        } => {
            if !scope_active(frame, graph, res, *parent) {
                return false;
            }
            if *is_loop {
                return true;
            }
            let Some((src, _)) = graph.producer_of(*switch, 0) else {
                return false;
            };
            let Some(cond) = frame.values.get(&src) else {
                return false;
            };
            let Some(sw) = graph.node(*switch) else {
                return false;
            };
            let arms = match sw.op {
                OpKind::Switch { arms, .. } => arms,
                _ => return false,
            };
            matches!(selected_arm(cond, arms), Ok(k) if k == *arm)
        }
        Scope::Union { branches } => branches
            .iter()
            .any(|&b| scope_active(frame, graph, res, b)),
    }
}

/// Re-queues the members of every region that is active now; called when a
/// switch condition lands and may have opened new regions.
fn activate_regions(frame: &mut Frame, graph: &OpGraph, res: &Resolution) {
    let mut wake: Vec<NodeId> = Vec::new();
    for (&scope, members) in &res.members {
        if scope == dflow_core::scope::ROOT {
            continue;
        }
        if scope_active(frame, graph, res, scope) {
            wake.extend(members.iter().copied());
        }
    }
    for n in wake {
        enqueue(frame, res, n);
    }
}

/// True if `scope` lies inside some loop body.
fn in_loop(arena: &ScopeArena, scope: ScopeId) -> bool {
    match arena.get(scope) {
        Scope::Root => false,
        Scope::Branch {
            parent, is_loop, ..
        } => *is_loop || in_loop(arena, *parent),
        Scope::Union { branches } => branches.iter().any(|&b| in_loop(arena, b)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dflow_core::assemble::{assemble_circuit, pin_ref, BlockDesc};
    use dflow_core::error::ErrorKind;

    fn circuit(blocks: Vec<Vec<BlockDesc>>) -> Circuit {
        assemble_circuit(&blocks).unwrap()
    }

    fn run(circuit: &Circuit, args: Vec<Value>) -> Result<Value, DflowError> {
        let registry = Registry::builtin();
        let mut session = Session::new(args);
        session.run(circuit, &registry, 1000)
    }

    #[test]
    fn adds_two_constants() {
        let c = circuit(vec![vec![
            BlockDesc::new("const", &["5"], vec![]),
            BlockDesc::new("const", &["3"], vec![]),
            BlockDesc::new("add", &[], vec![pin_ref(0, 0), pin_ref(1, 0)]),
            BlockDesc::new("out", &[], vec![pin_ref(2, 0)]),
        ]]);
        assert_eq!(run(&c, vec![]).unwrap(), Value::Int(8));
    }

    #[test]
    fn operator_error_reaches_the_root() {
        let c = circuit(vec![vec![
            BlockDesc::new("const", &["1"], vec![]),
            BlockDesc::new("const", &["0"], vec![]),
            BlockDesc::new("div", &[], vec![pin_ref(0, 0), pin_ref(1, 0)]),
            BlockDesc::new("out", &[], vec![pin_ref(2, 0)]),
        ]]);
        let err = run(&c, vec![]).unwrap_err();
        assert!(matches!(err, DflowError::DivideByZero { .. }));
        assert_eq!(err.kind(), ErrorKind::Operator);
        // The position names the failing editor block.
        assert_eq!(err.position().block, Some(2));
    }

    #[test]
    fn untaken_arm_never_executes() {
        // The false arm divides by zero; picking the true arm must neither
        // fail nor record an error.
        let c = circuit(vec![vec![
            BlockDesc::new("const", &["true"], vec![]),
            BlockDesc::new("const", &["1"], vec![]),
            BlockDesc::new("const", &["0"], vec![]),
            BlockDesc::new("div", &[], vec![pin_ref(1, 0), pin_ref(2, 0)]),
            BlockDesc::new(
                "swt",
                &["2", "1"],
                vec![pin_ref(0, 0), pin_ref(1, 0), pin_ref(3, 0)],
            ),
            BlockDesc::new("out", &[], vec![pin_ref(4, 0)]),
        ]]);
        let registry = Registry::builtin();
        let mut session = Session::new(vec![]);
        let v = session.run(&c, &registry, 1000).unwrap();
        assert_eq!(v, Value::Int(1));
        assert!(session.errors().is_empty());
    }

    #[test]
    fn integer_selector_picks_an_arm() {
        let c = circuit(vec![vec![
            BlockDesc::new("const", &["2"], vec![]),
            BlockDesc::new("const", &["10"], vec![]),
            BlockDesc::new("const", &["20"], vec![]),
            BlockDesc::new("const", &["30"], vec![]),
            BlockDesc::new(
                "swt",
                &["3", "1"],
                vec![pin_ref(0, 0), pin_ref(1, 0), pin_ref(2, 0), pin_ref(3, 0)],
            ),
            BlockDesc::new("out", &[], vec![pin_ref(4, 0)]),
        ]]);
        assert_eq!(run(&c, vec![]).unwrap(), Value::Int(30));
    }

    #[test]
    fn false_selector_with_one_arm_is_out_of_range() {
        let c = circuit(vec![vec![
            BlockDesc::new("const", &["false"], vec![]),
            BlockDesc::new("const", &["7"], vec![]),
            BlockDesc::new("swt", &["1", "1"], vec![pin_ref(0, 0), pin_ref(1, 0)]),
            BlockDesc::new("out", &[], vec![pin_ref(2, 0)]),
        ]]);
        let err = run(&c, vec![]).unwrap_err();
        match err {
            DflowError::OutOfRange { index, len, at } => {
                assert_eq!((index, len), (1, 1));
                assert_eq!(at.block, Some(2));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn counting_loop_terminates() {
        // x = 0; while (x + 1) < 10 { x = x + 1 }; yields 10 via the final
        // state (the condition sees the incremented value).
        let c = circuit(vec![vec![
            BlockDesc::new("const", &["0"], vec![]),
            BlockDesc::new("loop", &[], vec![pin_ref(0, 0)]),
            BlockDesc::new("const", &["1"], vec![]),
            BlockDesc::new("add", &[], vec![pin_ref(1, 0), pin_ref(2, 0)]),
            BlockDesc::new("const", &["10"], vec![]),
            BlockDesc::new("lt", &[], vec![pin_ref(3, 0), pin_ref(4, 0)]),
            BlockDesc::new("end", &[], vec![pin_ref(3, 0), pin_ref(5, 0)]),
            BlockDesc::new("out", &[], vec![pin_ref(6, 0)]),
        ]]);
        assert_eq!(run(&c, vec![]).unwrap(), Value::Int(10));
    }

    #[test]
    fn call_frame_returns_and_wraps_failures() {
        // Graph 1 adds its two inputs.
        let callee = vec![
            BlockDesc::new("in", &["0"], vec![]),
            BlockDesc::new("in", &["1"], vec![]),
            BlockDesc::new("add", &[], vec![pin_ref(0, 0), pin_ref(1, 0)]),
            BlockDesc::new("out", &[], vec![pin_ref(2, 0)]),
        ];
        let root = vec![
            BlockDesc::new("const", &["4"], vec![]),
            BlockDesc::new("const", &["7"], vec![]),
            BlockDesc::new("call", &["1", "2"], vec![pin_ref(0, 0), pin_ref(1, 0)]),
            BlockDesc::new("out", &[], vec![pin_ref(2, 0)]),
        ];
        let c = circuit(vec![root, callee]);
        assert_eq!(run(&c, vec![]).unwrap(), Value::Int(11));
    }

    #[test]
    fn child_error_surfaces_as_frame_at_call_site() {
        let callee = vec![
            BlockDesc::new("in", &["0"], vec![]),
            BlockDesc::new("const", &["0"], vec![]),
            BlockDesc::new("div", &[], vec![pin_ref(0, 0), pin_ref(1, 0)]),
            BlockDesc::new("out", &[], vec![pin_ref(2, 0)]),
        ];
        let root = vec![
            BlockDesc::new("const", &["4"], vec![]),
            BlockDesc::new("call", &["1", "1"], vec![pin_ref(0, 0)]),
            BlockDesc::new("out", &[], vec![pin_ref(1, 0)]),
        ];
        let c = circuit(vec![root, callee]);
        let err = run(&c, vec![]).unwrap_err();
        assert!(matches!(err, DflowError::Frame { .. }));
        assert!(matches!(err.root_cause(), DflowError::DivideByZero { .. }));
        // The frame points at the call block in the root graph.
        assert_eq!(err.position().block, Some(1));
    }

    #[test]
    fn self_recursion_hits_the_depth_limit() {
        let root = vec![
            BlockDesc::new("const", &["1"], vec![]),
            BlockDesc::new("call", &["0", "1"], vec![pin_ref(0, 0)]),
            BlockDesc::new("out", &[], vec![pin_ref(1, 0)]),
        ];
        let c = circuit(vec![root]);
        let err = run(&c, vec![]).unwrap_err();
        assert!(matches!(
            err.root_cause(),
            DflowError::RecursionLimit { .. }
        ));
    }

    #[test]
    fn external_inputs_flow_in() {
        let c = circuit(vec![vec![
            BlockDesc::new("in", &["0"], vec![]),
            BlockDesc::new("in", &["1"], vec![]),
            BlockDesc::new("mul", &[], vec![pin_ref(0, 0), pin_ref(1, 0)]),
            BlockDesc::new("out", &[], vec![pin_ref(2, 0)]),
        ]]);
        assert_eq!(
            run(&c, vec![Value::Int(6), Value::Int(7)]).unwrap(),
            Value::Int(42)
        );
    }

    #[test]
    fn missing_external_input_is_an_operator_error() {
        let c = circuit(vec![vec![
            BlockDesc::new("in", &["0"], vec![]),
            BlockDesc::new("out", &[], vec![pin_ref(0, 0)]),
        ]]);
        let err = run(&c, vec![]).unwrap_err();
        assert!(matches!(err, DflowError::MissingInput { .. }));
    }

    #[test]
    fn invalidation_recomputes_only_downstream() {
        let blocks = |lit: &str| {
            vec![vec![
                BlockDesc::new("const", &[lit], vec![]),
                BlockDesc::new("const", &["3"], vec![]),
                BlockDesc::new("add", &[], vec![pin_ref(0, 0), pin_ref(1, 0)]),
                BlockDesc::new("out", &[], vec![pin_ref(2, 0)]),
            ]]
        };
        let registry = Registry::builtin();
        let before = circuit(blocks("5"));
        let mut session = Session::new(vec![]);
        assert_eq!(
            session.run(&before, &registry, 1000).unwrap(),
            Value::Int(8)
        );

        // Same topology, one literal changed: node ids line up.
        let after = circuit(blocks("100"));
        let changed = after
            .root()
            .node_ids()
            .find(|&n| after.root().node(n).map(|w| w.origin) == Some(0))
            .unwrap();
        session.invalidate(&after, changed);
        assert_eq!(
            session.run(&after, &registry, 1000).unwrap(),
            Value::Int(103)
        );
    }

    #[test]
    fn updating_an_input_recomputes_its_readers() {
        let c = circuit(vec![vec![
            BlockDesc::new("in", &["0"], vec![]),
            BlockDesc::new("const", &["10"], vec![]),
            BlockDesc::new("add", &[], vec![pin_ref(0, 0), pin_ref(1, 0)]),
            BlockDesc::new("out", &[], vec![pin_ref(2, 0)]),
        ]]);
        let registry = Registry::builtin();
        let mut session = Session::new(vec![Value::Int(1)]);
        assert_eq!(session.run(&c, &registry, 1000).unwrap(), Value::Int(11));

        session.input(&c, 0, Value::Int(32));
        assert_eq!(session.run(&c, &registry, 1000).unwrap(), Value::Int(42));
    }

    #[test]
    fn deterministic_across_sessions() {
        let build = || {
            circuit(vec![vec![
                BlockDesc::new("const", &["false"], vec![]),
                BlockDesc::new("const", &["2"], vec![]),
                BlockDesc::new("const", &["9"], vec![]),
                BlockDesc::new(
                    "swt",
                    &["2", "1"],
                    vec![pin_ref(0, 0), pin_ref(1, 0), pin_ref(2, 0)],
                ),
                BlockDesc::new("neg", &[], vec![pin_ref(3, 0)]),
                BlockDesc::new("out", &[], vec![pin_ref(4, 0)]),
            ]])
        };
        let a = run(&build(), vec![]).unwrap();
        let b = run(&build(), vec![]).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, Value::Int(-9));
    }

    #[test]
    fn resources_close_on_drop() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        struct Flag(Arc<AtomicBool>);
        impl RunResource for Flag {
            fn close(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let closed = Arc::new(AtomicBool::new(false));
        {
            let mut session = Session::new(vec![]);
            session.track(Box::new(Flag(closed.clone())));
        }
        assert!(closed.load(Ordering::SeqCst));
    }
}
