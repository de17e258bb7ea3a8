//! Scope resolution: assigns every reachable node a scope and a topological
//! address.
//!
//! The resolver runs a work-stack traversal bottom-up from the single output
//! node. A node becomes ready once every one of its *live* consumer ports has
//! a scope; its own scope is then the normalized union of those port scopes.
//! Readiness is tracked with a per-node wait counter (number of not-yet-scoped
//! consumer wires), so each node is processed exactly once.
//!
//! Addresses are the discovery order: the output gets address 0 and producers
//! get strictly higher addresses than every consumer of theirs. Nodes with no
//! live consumer (dead code) are never visited and receive neither scope nor
//! address.
//!
//! If the stack drains while live nodes remain, those nodes sit on a true
//! cycle; the resolver walks forward through still-waiting consumers to
//! exhibit the cycle and reports a circular-dependency error at one of its
//! members.

use std::collections::{HashMap, HashSet};

use tracing::{debug, trace};

use dflow_core::error::{DflowError, Position};
use dflow_core::graph::OpGraph;
use dflow_core::id::{Address, GraphId, NodeId, ScopeId};
use dflow_core::ops::OpKind;
use dflow_core::scope::{ScopeArena, ROOT};

/// The resolver's output: scope and address side tables for one graph.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub scopes: ScopeArena,
    /// Scope of every live node.
    pub node_scope: HashMap<NodeId, ScopeId>,
    /// Scope of every live node's input ports (keyed by consumer, pin).
    pub port_scope: HashMap<(NodeId, u16), ScopeId>,
    /// Topological address of every live node; the output holds 0.
    pub address: HashMap<NodeId, Address>,
    /// Per-scope member lists in discovery order.
    pub members: HashMap<ScopeId, Vec<NodeId>>,
    /// Global discovery order: `order[a]` is the node at address `a`.
    pub order: Vec<NodeId>,
    /// Loop pairing: each `LoopEnd` to the `LoopHead` inside its body.
    pub loop_heads: HashMap<NodeId, NodeId>,
}

impl Resolution {
    pub fn address_of(&self, node: NodeId) -> Option<Address> {
        self.address.get(&node).copied()
    }

    pub fn scope_of(&self, node: NodeId) -> Option<ScopeId> {
        self.node_scope.get(&node).copied()
    }
}

/// Marks every node the output transitively reads from.
fn live_set(graph: &OpGraph, output: NodeId) -> HashSet<NodeId> {
    let mut live = HashSet::new();
    let mut stack = vec![output];
    while let Some(n) = stack.pop() {
        if !live.insert(n) {
            continue;
        }
        let arity = graph.node(n).map(|w| w.op.arity()).unwrap_or(0);
        for port in 0..arity {
            if let Some((producer, _)) = graph.producer_of(n, port) {
                stack.push(producer);
            }
        }
    }
    live
}

/// Exhibits a cycle among permanently waiting nodes and reports it.
fn report_cycle(
    graph: &OpGraph,
    live: &HashSet<NodeId>,
    resolved: &HashMap<NodeId, ScopeId>,
    start: NodeId,
) -> DflowError {
    // Walk forward through still-waiting consumers. Every waiting node has at
    // least one waiting consumer, so the walk must revisit a node.
    let mut seen = HashSet::new();
    let mut at = start;
    let mut pin = 0u16;
    while seen.insert(at) {
        let next = graph
            .consumers_of(at)
            .into_iter()
            .find(|(c, _)| live.contains(c) && !resolved.contains_key(c));
        match next {
            Some((c, p)) => {
                at = c;
                pin = p;
            }
            None => break,
        }
    }
    let origin = graph.node(at).map(|w| w.origin);
    DflowError::CircularDependency {
        at: Position {
            block: origin,
            node: Some(at),
            pin: Some(pin),
        },
    }
}

/// Resolves scopes and addresses for one graph of `circuit_graph`.
pub fn resolve(graph: &OpGraph) -> Result<Resolution, DflowError> {
    let output = graph.output().ok_or(DflowError::MissingOutput {
        graph: GraphId(0),
    })?;

    let live = live_set(graph, output);
    debug!(live = live.len(), total = graph.node_count(), "resolving scopes");

    // Wait counters: wires into live consumers.
    let mut wait: HashMap<NodeId, usize> = HashMap::new();
    for &n in &live {
        let count = graph
            .consumers_of(n)
            .into_iter()
            .filter(|(c, _)| live.contains(c))
            .count();
        wait.insert(n, count);
    }

    let mut res = Resolution {
        scopes: ScopeArena::new(),
        node_scope: HashMap::new(),
        port_scope: HashMap::new(),
        address: HashMap::new(),
        members: HashMap::new(),
        order: Vec::new(),
        loop_heads: HashMap::new(),
    };

    let mut ready = vec![output];
    while let Some(n) = ready.pop() {
        if res.node_scope.contains_key(&n) {
            continue;
        }
        let node = graph.node(n).ok_or(DflowError::NodeNotFound { id: n })?;

        // Scope: union of all live consumer port scopes; the output seeds Root.
        let scope = if n == output {
            ROOT
        } else {
            let consumer_scopes: Vec<ScopeId> = graph
                .consumers_of(n)
                .into_iter()
                .filter(|(c, _)| live.contains(c))
                .map(|(c, p)| res.port_scope[&(c, p)])
                .collect();
            res.scopes.union(&consumer_scopes)
        };

        trace!(node = %n, ?scope, address = res.order.len(), "scoped");
        res.node_scope.insert(n, scope);
        res.address.insert(n, Address(res.order.len() as u32));
        res.order.push(n);
        res.members.entry(scope).or_default().push(n);

        // Hand each input port its scope; region openers hand out fresh
        // branches so their producers resolve into the nested region.
        let arity = node.op.arity();
        for port in 0..arity {
            let port_scope = match node.op {
                OpKind::Switch { arms, width } if port > 0 => {
                    let arm = (port - 1) / width;
                    res.scopes.branch(scope, n, arm, arms, false)
                }
                OpKind::LoopEnd => res.scopes.branch(scope, n, 0, 1, true),
                _ => scope,
            };
            res.port_scope.insert((n, port), port_scope);

            if let Some((producer, _)) = graph.producer_of(n, port) {
                if let Some(w) = wait.get_mut(&producer) {
                    *w -= 1;
                    if *w == 0 {
                        ready.push(producer);
                    }
                }
            }
        }
    }

    // Anything live but unresolved sits on a cycle.
    if res.order.len() < live.len() {
        let start = *live
            .iter()
            .find(|n| !res.node_scope.contains_key(n))
            .expect("unresolved node exists");
        return Err(report_cycle(graph, &live, &res.node_scope, start));
    }

    validate_loops(graph, &live, &mut res)?;

    debug!(
        nodes = res.order.len(),
        scopes = res.scopes.len(),
        "resolution complete"
    );
    Ok(res)
}

/// Pairs every `LoopEnd` with the single `LoopHead` inside its body region,
/// and rejects heads whose state leaked outside any loop.
fn validate_loops(
    graph: &OpGraph,
    live: &HashSet<NodeId>,
    res: &mut Resolution,
) -> Result<(), DflowError> {
    let ends: Vec<NodeId> = live
        .iter()
        .copied()
        .filter(|&n| matches!(graph.node(n).map(|w| &w.op), Some(OpKind::LoopEnd)))
        .collect();
    let heads: Vec<NodeId> = live
        .iter()
        .copied()
        .filter(|&n| matches!(graph.node(n).map(|w| &w.op), Some(OpKind::LoopHead)))
        .collect();

    // A head belongs to the innermost loop body containing its scope.
    let mut owner: HashMap<NodeId, NodeId> = HashMap::new();
    for &h in &heads {
        let hs = res.node_scope[&h];
        let mut best: Option<(u32, NodeId)> = None;
        for &e in &ends {
            let body = res.port_scope[&(e, 0)];
            if res.scopes.descends_from(hs, body) {
                let lvl = res.scopes.lvl(body);
                if best.map_or(true, |(b, _)| lvl > b) {
                    best = Some((lvl, e));
                }
            }
        }
        match best {
            Some((_, e)) => {
                owner.insert(h, e);
            }
            None => {
                // State consumed outside every loop body: the scope union
                // widened past the loop region.
                let node = graph.node(h).ok_or(DflowError::NodeNotFound { id: h })?;
                return Err(DflowError::LoopEscape {
                    at: node.position(h),
                });
            }
        }
    }

    for &e in &ends {
        let paired: Vec<NodeId> = heads
            .iter()
            .copied()
            .filter(|h| owner.get(h) == Some(&e))
            .collect();
        if paired.len() != 1 {
            let node = graph.node(e).ok_or(DflowError::NodeNotFound { id: e })?;
            return Err(DflowError::LoopWithoutHeader {
                at: node.position(e),
            });
        }
        res.loop_heads.insert(e, paired[0]);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dflow_core::assemble::{assemble, pin_ref, BlockDesc};
    use dflow_core::scope::Scope;

    fn resolve_blocks(blocks: &[BlockDesc]) -> Result<Resolution, DflowError> {
        let circuit = assemble(blocks).unwrap();
        resolve(circuit.root())
    }

    #[test]
    fn straight_line_addresses_are_topological() {
        // const -> neg -> out
        let blocks = vec![
            BlockDesc::new("const", &["5"], vec![]),
            BlockDesc::new("neg", &[], vec![pin_ref(0, 0)]),
            BlockDesc::new("out", &[], vec![pin_ref(1, 0)]),
        ];
        let circuit = assemble(&blocks).unwrap();
        let graph = circuit.root();
        let res = resolve(graph).unwrap();

        assert_eq!(res.order.len(), 3);
        // Every node's address is strictly below each of its inputs'.
        for &n in &res.order {
            let a = res.address[&n];
            let arity = graph.node(n).unwrap().op.arity();
            for port in 0..arity {
                if let Some((p, _)) = graph.producer_of(n, port) {
                    assert!(a < res.address[&p], "consumer {n} not below producer {p}");
                }
            }
        }
        // Output is the seed.
        assert_eq!(res.address[&graph.output().unwrap()], Address(0));
    }

    #[test]
    fn every_live_node_gets_exactly_one_scope() {
        let blocks = vec![
            BlockDesc::new("const", &["1"], vec![]),
            BlockDesc::new("const", &["2"], vec![]),
            BlockDesc::new("add", &[], vec![pin_ref(0, 0), pin_ref(1, 0)]),
            BlockDesc::new("out", &[], vec![pin_ref(2, 0)]),
        ];
        let res = resolve_blocks(&blocks).unwrap();
        assert_eq!(res.node_scope.len(), 4);
        for (_, &s) in &res.node_scope {
            assert_eq!(s, ROOT);
        }
    }

    #[test]
    fn dead_code_receives_no_address() {
        let blocks = vec![
            BlockDesc::new("const", &["1"], vec![]),
            BlockDesc::new("const", &["99"], vec![]), // nobody reads this
            BlockDesc::new("neg", &[], vec![pin_ref(1, 0)]), // dead consumer chain
            BlockDesc::new("out", &[], vec![pin_ref(0, 0)]),
        ];
        let res = resolve_blocks(&blocks).unwrap();
        assert_eq!(res.order.len(), 2);
        assert_eq!(res.address.len(), 2);
    }

    #[test]
    fn switch_arms_get_fresh_branches() {
        let blocks = vec![
            BlockDesc::new("const", &["true"], vec![]),
            BlockDesc::new("const", &["1"], vec![]),
            BlockDesc::new("const", &["2"], vec![]),
            BlockDesc::new(
                "swt",
                &["2", "1"],
                vec![pin_ref(0, 0), pin_ref(1, 0), pin_ref(2, 0)],
            ),
            BlockDesc::new("out", &[], vec![pin_ref(3, 0)]),
        ];
        let circuit = assemble(&blocks).unwrap();
        let graph = circuit.root();
        let res = resolve(graph).unwrap();

        let swt = res.order[1]; // out=0, swt=1 in discovery order
        assert!(matches!(graph.node(swt).unwrap().op, OpKind::Switch { .. }));

        // Condition stays in the switch's own scope, arms get branches.
        assert_eq!(res.port_scope[&(swt, 0)], res.node_scope[&swt]);
        let arm0 = res.port_scope[&(swt, 1)];
        let arm1 = res.port_scope[&(swt, 2)];
        assert_ne!(arm0, arm1);
        assert!(matches!(
            res.scopes.get(arm0),
            Scope::Branch { arm: 0, arms: 2, is_loop: false, .. }
        ));

        // The arm constants live inside their branches.
        let (c1, _) = graph.producer_of(swt, 1).unwrap();
        let (c2, _) = graph.producer_of(swt, 2).unwrap();
        assert_eq!(res.node_scope[&c1], arm0);
        assert_eq!(res.node_scope[&c2], arm1);
    }

    #[test]
    fn value_shared_by_both_arms_collapses_to_parent() {
        // One const feeds both arms of the switch: union of both arms must
        // collapse back to the switch's scope (Root here).
        let blocks = vec![
            BlockDesc::new("const", &["true"], vec![]),
            BlockDesc::new("const", &["7"], vec![]),
            BlockDesc::new(
                "swt",
                &["2", "1"],
                vec![pin_ref(0, 0), pin_ref(1, 0), pin_ref(1, 0)],
            ),
            BlockDesc::new("out", &[], vec![pin_ref(2, 0)]),
        ];
        let circuit = assemble(&blocks).unwrap();
        let graph = circuit.root();
        let res = resolve(graph).unwrap();
        let swt = graph.producer_of(graph.output().unwrap(), 0).unwrap().0;
        let (shared, _) = graph.producer_of(swt, 1).unwrap();
        assert_eq!(res.node_scope[&shared], ROOT);
    }

    #[test]
    fn self_cycle_is_a_circular_dependency_error() {
        // add reads its own output.
        let blocks = vec![
            BlockDesc::new("const", &["1"], vec![]),
            BlockDesc::new("add", &[], vec![pin_ref(0, 0), pin_ref(1, 0)]),
            BlockDesc::new("out", &[], vec![pin_ref(1, 0)]),
        ];
        let err = resolve_blocks(&blocks).unwrap_err();
        match err {
            DflowError::CircularDependency { at } => {
                assert!(at.node.is_some());
                assert!(at.pin.is_some());
            }
            other => panic!("expected CircularDependency, got {other:?}"),
        }
    }

    #[test]
    fn two_node_cycle_is_detected() {
        let blocks = vec![
            BlockDesc::new("neg", &[], vec![pin_ref(1, 0)]),
            BlockDesc::new("neg", &[], vec![pin_ref(0, 0)]),
            BlockDesc::new("out", &[], vec![pin_ref(0, 0)]),
        ];
        let err = resolve_blocks(&blocks).unwrap_err();
        assert!(matches!(err, DflowError::CircularDependency { .. }));
    }

    fn loop_blocks() -> Vec<BlockDesc> {
        // i = loop(0); cond = lt(i', 10); i' = add(i, 1); end(i', cond); out(end)
        vec![
            BlockDesc::new("const", &["0"], vec![]),
            BlockDesc::new("loop", &[], vec![pin_ref(0, 0)]),
            BlockDesc::new("const", &["1"], vec![]),
            BlockDesc::new("add", &[], vec![pin_ref(1, 0), pin_ref(2, 0)]),
            BlockDesc::new("const", &["10"], vec![]),
            BlockDesc::new("lt", &[], vec![pin_ref(3, 0), pin_ref(4, 0)]),
            BlockDesc::new("end", &[], vec![pin_ref(3, 0), pin_ref(5, 0)]),
            BlockDesc::new("out", &[], vec![pin_ref(6, 0)]),
        ]
    }

    #[test]
    fn loop_resolves_and_pairs_header() {
        let circuit = assemble(&loop_blocks()).unwrap();
        let graph = circuit.root();
        let res = resolve(graph).unwrap();

        let out = graph.output().unwrap();
        let (end, _) = graph.producer_of(out, 0).unwrap();
        let head = res.loop_heads[&end];
        assert!(matches!(graph.node(head).unwrap().op, OpKind::LoopHead));

        // The body branch is a loop branch containing the add.
        let body = res.port_scope[&(end, 0)];
        assert!(res.scopes.is_loop_branch(body));
        let (add, _) = graph.producer_of(end, 0).unwrap();
        assert_eq!(res.node_scope[&add], body);
    }

    #[test]
    fn loop_end_without_header_is_structural_error() {
        // end whose state comes straight from a const -- no loop head at all.
        let blocks = vec![
            BlockDesc::new("const", &["0"], vec![]),
            BlockDesc::new("const", &["false"], vec![]),
            BlockDesc::new("end", &[], vec![pin_ref(0, 0), pin_ref(1, 0)]),
            BlockDesc::new("out", &[], vec![pin_ref(2, 0)]),
        ];
        let err = resolve_blocks(&blocks).unwrap_err();
        assert!(matches!(err, DflowError::LoopWithoutHeader { .. }));
    }

    #[test]
    fn loop_state_used_outside_loop_is_rejected() {
        // The head's state is also consumed by the out node directly, which
        // widens its scope past the loop body.
        let mut blocks = loop_blocks();
        blocks[7] = BlockDesc::new("add", &[], vec![pin_ref(6, 0), pin_ref(1, 0)]);
        blocks.push(BlockDesc::new("out", &[], vec![pin_ref(7, 0)]));
        let err = resolve_blocks(&blocks).unwrap_err();
        assert!(matches!(err, DflowError::LoopEscape { .. }));
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        // Random layered DAG of arithmetic nodes; resolution must terminate
        // with unique, topologically valid addresses.
        proptest! {
            #[test]
            fn acyclic_graphs_resolve_with_topological_addresses(
                layers in proptest::collection::vec(1usize..4, 1..5),
            ) {
                let mut blocks = vec![BlockDesc::new("const", &["1"], vec![])];
                let mut prev_layer = vec![0u32];
                for layer in layers {
                    let mut this_layer = Vec::new();
                    for i in 0..layer {
                        let a = prev_layer[i % prev_layer.len()];
                        let b = prev_layer[(i + 1) % prev_layer.len()];
                        blocks.push(BlockDesc::new(
                            "add",
                            &[],
                            vec![pin_ref(a, 0), pin_ref(b, 0)],
                        ));
                        this_layer.push(blocks.len() as u32 - 1);
                    }
                    prev_layer = this_layer;
                }
                blocks.push(BlockDesc::new("out", &[], vec![pin_ref(prev_layer[0], 0)]));

                let circuit = assemble(&blocks).unwrap();
                let graph = circuit.root();
                let res = resolve(graph).unwrap();

                // Unique addresses.
                let mut seen = std::collections::HashSet::new();
                for (_, &a) in &res.address {
                    prop_assert!(seen.insert(a));
                }
                // Topological: consumer address < producer address.
                for &n in &res.order {
                    let a = res.address[&n];
                    let arity = graph.node(n).unwrap().op.arity();
                    for port in 0..arity {
                        if let Some((p, _)) = graph.producer_of(n, port) {
                            if let Some(&pa) = res.address.get(&p) {
                                prop_assert!(a < pa);
                            }
                        }
                    }
                }
            }
        }
    }
}
