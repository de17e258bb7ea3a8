//! Linearization: scope tree -> branch-structured instruction blocks.
//!
//! Each branch region's members are emitted in reverse-address order
//! (addresses grow toward producers, so walking them backwards yields a
//! topological, producers-first instruction sequence). A `Switch` member
//! splits the stream: the code before it closes as a dispatch block, each arm
//! region is linearized recursively and rejoins at a fresh block, and the
//! selected arm's exit writes the arm's value into the switch's own slot. A
//! `LoopEnd` member linearizes its body region with the exit block pointing
//! back at the body entry, producing a cyclic block graph.
//!
//! Union scopes have no block of their own: their members are hoisted into
//! the nearest branch region containing every member, where reverse-address
//! order places them before the dispatch that needs them.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tracing::debug;

use dflow_core::error::DflowError;
use dflow_core::graph::OpGraph;
use dflow_core::id::{Address, BlockId, NodeId, ScopeId};
use dflow_core::ops::OpKind;
use dflow_core::scope::{Scope, ScopeArena, ROOT};

use crate::resolve::Resolution;

/// One linearized instruction: operator, output slot, input slots.
///
/// `ins` entries are `None` for unconnected pins (an evaluation-time error,
/// not a structural one). Two special shapes:
/// - a `Switch` instruction at an arm's exit carries only that arm's pin
///   slots and copies them into the switch's slot;
/// - a `LoopEnd` instruction carries `[state, cond, head]`; while the
///   condition holds it writes the state back into the head's slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instr {
    pub node: NodeId,
    pub op: OpKind,
    pub args: Vec<String>,
    pub out: Address,
    pub ins: SmallVec<[Option<Address>; 4]>,
}

/// A straight-line instruction block plus its successors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CodeBlock {
    pub id: BlockId,
    /// The region's running value: the dispatch selector for blocks with
    /// `arms`, the governing condition/state slot for region entries.
    pub context: Option<Address>,
    pub code: Vec<Instr>,
    /// Arm entry blocks (dispatch targets), or the back edge for `looping`
    /// blocks.
    pub arms: Vec<BlockId>,
    /// Fallthrough successor; `None` terminates the program.
    pub next: Option<BlockId>,
    /// True for a loop exit block: `arms[0]` is taken while the `LoopEnd`
    /// condition holds, `next` once it fails.
    pub looping: bool,
}

/// The linearized program: the contract consumed by an interpreter or a
/// textual emitter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Program {
    pub blocks: Vec<CodeBlock>,
    pub entry: BlockId,
    /// Size of the flat value array (one slot per addressed node).
    pub slots: u32,
    /// Slot holding the final result (the output node's address).
    pub result: Address,
}

impl Program {
    pub fn block(&self, id: BlockId) -> &CodeBlock {
        &self.blocks[id.0 as usize]
    }

    /// Re-flattens the block structure into node order: arms before their
    /// join, loop bodies once. Each node is reported at its first emission.
    pub fn flatten(&self) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        self.flatten_from(Some(self.entry), None, &mut seen, &mut out);
        out
    }

    fn flatten_from(
        &self,
        start: Option<BlockId>,
        stop: Option<BlockId>,
        seen: &mut HashSet<NodeId>,
        out: &mut Vec<NodeId>,
    ) {
        let mut cur = start;
        while let Some(id) = cur {
            if Some(id) == stop {
                return;
            }
            let block = self.block(id);
            for instr in &block.code {
                if seen.insert(instr.node) {
                    out.push(instr.node);
                }
            }
            if block.looping {
                cur = block.next;
            } else if !block.arms.is_empty() {
                for &arm in &block.arms {
                    self.flatten_from(Some(arm), block.next, seen, out);
                }
                cur = block.next;
            } else {
                cur = block.next;
            }
        }
    }
}

/// The branch-or-root region whose stream hosts `scope`'s members.
fn host(arena: &ScopeArena, scope: ScopeId) -> ScopeId {
    match arena.get(scope) {
        Scope::Root => ROOT,
        Scope::Branch { .. } => scope,
        Scope::Union { branches } => {
            let members = branches.clone();
            // Walk the first member's branch ancestors outwards; the host is
            // the innermost one containing every member.
            let mut candidate = match arena.get(members[0]) {
                Scope::Branch { parent, .. } => host(arena, *parent),
                _ => ROOT,
            };
            loop {
                if members.iter().all(|&m| arena.descends_from(m, candidate)) {
                    return candidate;
                }
                if candidate == ROOT {
                    return ROOT;
                }
                candidate = match arena.get(candidate) {
                    Scope::Branch { parent, .. } => host(arena, *parent),
                    _ => ROOT,
                };
            }
        }
    }
}

struct Linearizer<'a> {
    graph: &'a OpGraph,
    res: &'a Resolution,
    blocks: Vec<CodeBlock>,
    /// Per-region emission lists, reverse-address sorted.
    lists: HashMap<ScopeId, Vec<NodeId>>,
}

impl<'a> Linearizer<'a> {
    fn new_block(&mut self) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(CodeBlock {
            id,
            ..CodeBlock::default()
        });
        id
    }

    fn addr(&self, node: NodeId) -> Address {
        self.res.address[&node]
    }

    /// Slot of the value wired into `port` of `node`.
    fn in_addr(&self, node: NodeId, port: u16) -> Option<Address> {
        self.graph
            .producer_of(node, port)
            .and_then(|(p, _)| self.res.address_of(p))
    }

    fn push_plain(&mut self, block: BlockId, node: NodeId) -> Result<(), DflowError> {
        let w = self
            .graph
            .node(node)
            .ok_or(DflowError::NodeNotFound { id: node })?;
        let arity = w.op.arity();
        let ins: SmallVec<[Option<Address>; 4]> =
            (0..arity).map(|p| self.in_addr(node, p)).collect();
        let instr = Instr {
            node,
            op: w.op.clone(),
            args: w.args.clone(),
            out: self.addr(node),
            ins,
        };
        self.blocks[block.0 as usize].code.push(instr);
        Ok(())
    }

    /// Emits one branch/root region; returns its entry and exit blocks.
    fn emit_region(
        &mut self,
        scope: ScopeId,
        context: Option<Address>,
    ) -> Result<(BlockId, BlockId), DflowError> {
        let list = self.lists.remove(&scope).unwrap_or_default();
        let entry = self.new_block();
        self.blocks[entry.0 as usize].context = context;
        let mut cur = entry;

        for node in list {
            let op = self
                .graph
                .node(node)
                .ok_or(DflowError::NodeNotFound { id: node })?
                .op
                .clone();
            match op {
                OpKind::Switch { arms, width } => {
                    let cond = self.in_addr(node, 0);
                    let out = self.addr(node);
                    let mut entries = Vec::with_capacity(arms as usize);
                    let mut exits = Vec::with_capacity(arms as usize);
                    for arm in 0..arms {
                        let first_pin = 1 + arm * width;
                        let arm_scope = self.res.port_scope[&(node, first_pin)];
                        let (aentry, aexit) = self.emit_region(arm_scope, cond)?;
                        let ins: SmallVec<[Option<Address>; 4]> = (0..width)
                            .map(|k| self.in_addr(node, first_pin + k))
                            .collect();
                        self.blocks[aexit.0 as usize].code.push(Instr {
                            node,
                            op: op.clone(),
                            args: vec![],
                            out,
                            ins,
                        });
                        entries.push(aentry);
                        exits.push(aexit);
                    }
                    let join = self.new_block();
                    for exit in exits {
                        self.blocks[exit.0 as usize].next = Some(join);
                    }
                    let dispatch = &mut self.blocks[cur.0 as usize];
                    dispatch.context = cond;
                    dispatch.arms = entries;
                    dispatch.next = Some(join);
                    cur = join;
                }
                OpKind::LoopEnd => {
                    let body = self.res.port_scope[&(node, 0)];
                    let head = self.res.loop_heads[&node];
                    let head_addr = self.addr(head);
                    let (bentry, bexit) = self.emit_region(body, Some(head_addr))?;

                    let ins: SmallVec<[Option<Address>; 4]> = [
                        self.in_addr(node, 0),
                        self.in_addr(node, 1),
                        Some(head_addr),
                    ]
                    .into_iter()
                    .collect();
                    let instr = Instr {
                        node,
                        op: op.clone(),
                        args: vec![],
                        out: self.addr(node),
                        ins,
                    };
                    self.blocks[bexit.0 as usize].code.push(instr);

                    let join = self.new_block();
                    let exit = &mut self.blocks[bexit.0 as usize];
                    exit.arms = vec![bentry];
                    exit.next = Some(join);
                    exit.looping = true;
                    self.blocks[cur.0 as usize].next = Some(bentry);
                    cur = join;
                }
                _ => self.push_plain(cur, node)?,
            }
        }

        Ok((entry, cur))
    }
}

/// Linearizes a resolved graph into a block program.
pub fn linearize(graph: &OpGraph, res: &Resolution) -> Result<Program, DflowError> {
    // Hoist every scope's members into its host region, producers first.
    let mut lists: HashMap<ScopeId, Vec<NodeId>> = HashMap::new();
    for (&scope, members) in &res.members {
        let region = host(&res.scopes, scope);
        lists.entry(region).or_default().extend(members.iter().copied());
    }
    for list in lists.values_mut() {
        list.sort_by_key(|&n| std::cmp::Reverse(res.address[&n]));
    }

    let mut lin = Linearizer {
        graph,
        res,
        blocks: Vec::new(),
        lists,
    };
    let (entry, _exit) = lin.emit_region(ROOT, None)?;
    debug_assert!(lin.lists.is_empty(), "unemitted regions: {:?}", lin.lists);

    let output = graph.output().ok_or(DflowError::MissingOutput {
        graph: dflow_core::id::GraphId(0),
    })?;
    let program = Program {
        blocks: lin.blocks,
        entry,
        slots: res.order.len() as u32,
        result: res.address[&output],
    };
    debug!(blocks = program.blocks.len(), slots = program.slots, "linearized");
    Ok(program)
}
