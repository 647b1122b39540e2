// SPDX-FileCopyrightText: 2025 The bblayout developers
// SPDX-License-Identifier: LGPL-3.0-only

use bitflags::bitflags;
use helper::vec_map::VecMap;
use smallvec::SmallVec;

use std::fmt::Write as _;

pub type Address = u64;

/// The kind of control flow an edge carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CfgEdgeKind {
    BranchOrFallthrough,
    Call,
    Return,
}

impl std::fmt::Display for CfgEdgeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CfgEdgeKind::BranchOrFallthrough => write!(f, "branch_or_fallthrough"),
            CfgEdgeKind::Call => write!(f, "call"),
            CfgEdgeKind::Return => write!(f, "return"),
        }
    }
}

bitflags! {
    /// Compiler-provided metadata of a basic block.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct NodeFlags: u8 {
        /// The block is an exception handler entry.
        const LANDING_PAD = 1 << 0;
        /// The last instruction permits next-address fallthrough.
        const CAN_FALLTHROUGH = 1 << 1;
        const HAS_RETURN = 1 << 2;
        const HAS_TAIL_CALL = 1 << 3;
        const HAS_INDIRECT_BRANCH = 1 << 4;
    }
}

/// Node id unique within a single CFG.
/// The derived ordering (bb_index, then clone_number) is the total order
/// used for all deterministic tie-breaks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IntraCfgId {
    /// Index of the basic block in the original function.
    pub bb_index: usize,
    /// Clone number of the basic block (zero for an original block).
    pub clone_number: usize,
}

impl std::fmt::Display for IntraCfgId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[BB index: {}, clone number: {}]", self.bb_index, self.clone_number)
    }
}

/// Combines the compiler-assigned fixed bb id with the intra-cfg id of a
/// node. This is what the profile artifacts identify blocks by.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct FullIntraCfgId {
    pub bb_id: usize,
    pub intra_cfg_id: IntraCfgId,
}

impl FullIntraCfgId {
    /// Returns the string form of the block id used in the profile,
    /// including the clone number if not zero.
    pub fn profile_bb_id(&self) -> String {
        let mut result = self.bb_id.to_string();
        if self.intra_cfg_id.clone_number != 0 {
            let _ = write!(result, ".{}", self.intra_cfg_id.clone_number);
        }
        result
    }
}

/// Node id unique across the program.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InterCfgId {
    pub function_index: usize,
    pub intra_cfg_id: IntraCfgId,
}

impl std::fmt::Display for InterCfgId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[function index: {}, {}]", self.function_index, self.intra_cfg_id)
    }
}

/// Positional handle of a node: its function and its index in the owning
/// CFG's node arena. Stable for the lifetime of the CFG.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeRef {
    pub function_index: usize,
    pub node_index: usize,
}

/// Handle of an inter-function edge: index into the `inter_edges` arena of
/// the CFG identified by `function_index` (edges are owned by their
/// source's CFG).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InterEdgeRef {
    pub function_index: usize,
    pub edge_index: usize,
}

/// Handle of any edge: the owning CFG, the arena (intra or inter) and the
/// index within it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EdgeLoc {
    pub function_index: usize,
    pub inter: bool,
    pub edge_index: usize,
}

/// A basic block. All instances are owned by the node arena of their CFG.
#[derive(Clone, Debug)]
pub struct CfgNode {
    inter_cfg_id: InterCfgId,
    /// Fixed id of the basic block, as assigned by the compiler. Unique
    /// within each CFG and surfaced in the profile artifacts.
    bb_id: usize,
    /// Index of the node in its CFG's node arena.
    node_index: usize,
    addr: Address,
    size: u64,
    flags: NodeFlags,

    pub(crate) intra_out: Vec<usize>,
    pub(crate) intra_in: Vec<usize>,
    pub(crate) inter_out: Vec<usize>,
    pub(crate) inter_in: Vec<InterEdgeRef>,
}

impl CfgNode {
    pub fn new(
        addr: Address,
        bb_index: usize,
        bb_id: usize,
        size: u64,
        flags: NodeFlags,
        function_index: usize,
    ) -> CfgNode {
        CfgNode {
            inter_cfg_id: InterCfgId {
                function_index,
                intra_cfg_id: IntraCfgId {
                    bb_index,
                    clone_number: 0,
                },
            },
            bb_id,
            node_index: bb_index,
            addr,
            size,
            flags,
            intra_out: Vec::new(),
            intra_in: Vec::new(),
            inter_out: Vec::new(),
            inter_in: Vec::new(),
        }
    }

    /// Returns a copy of this node with the given `clone_number` and arena
    /// index, but with empty edge lists.
    pub fn clone_node(&self, clone_number: usize, node_index: usize) -> CfgNode {
        CfgNode {
            inter_cfg_id: InterCfgId {
                function_index: self.function_index(),
                intra_cfg_id: IntraCfgId {
                    bb_index: self.bb_index(),
                    clone_number,
                },
            },
            bb_id: self.bb_id,
            node_index,
            addr: self.addr,
            size: self.size,
            flags: self.flags,
            intra_out: Vec::new(),
            intra_in: Vec::new(),
            inter_out: Vec::new(),
            inter_in: Vec::new(),
        }
    }

    pub fn inter_cfg_id(&self) -> InterCfgId {
        self.inter_cfg_id
    }

    pub fn intra_cfg_id(&self) -> IntraCfgId {
        self.inter_cfg_id.intra_cfg_id
    }

    pub fn full_intra_cfg_id(&self) -> FullIntraCfgId {
        FullIntraCfgId {
            bb_id: self.bb_id,
            intra_cfg_id: self.intra_cfg_id(),
        }
    }

    pub fn node_ref(&self) -> NodeRef {
        NodeRef {
            function_index: self.function_index(),
            node_index: self.node_index,
        }
    }

    pub fn addr(&self) -> Address {
        self.addr
    }

    pub fn bb_id(&self) -> usize {
        self.bb_id
    }

    pub fn bb_index(&self) -> usize {
        self.inter_cfg_id.intra_cfg_id.bb_index
    }

    pub fn node_index(&self) -> usize {
        self.node_index
    }

    pub fn clone_number(&self) -> usize {
        self.inter_cfg_id.intra_cfg_id.clone_number
    }

    pub fn is_cloned(&self) -> bool {
        self.clone_number() != 0
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn function_index(&self) -> usize {
        self.inter_cfg_id.function_index
    }

    pub fn is_landing_pad(&self) -> bool {
        self.flags.contains(NodeFlags::LANDING_PAD)
    }

    pub fn can_fallthrough(&self) -> bool {
        self.flags.contains(NodeFlags::CAN_FALLTHROUGH)
    }

    pub fn has_return(&self) -> bool {
        self.flags.contains(NodeFlags::HAS_RETURN)
    }

    pub fn has_tail_call(&self) -> bool {
        self.flags.contains(NodeFlags::HAS_TAIL_CALL)
    }

    pub fn has_indirect_branch(&self) -> bool {
        self.flags.contains(NodeFlags::HAS_INDIRECT_BRANCH)
    }

    /// Returns true if this is the entry block of the function.
    pub fn is_entry(&self) -> bool {
        self.bb_index() == 0
    }

    pub fn has_edges(&self) -> bool {
        !self.intra_out.is_empty()
            || !self.intra_in.is_empty()
            || !self.inter_out.is_empty()
            || !self.inter_in.is_empty()
    }

    pub fn intra_out(&self) -> &[usize] {
        &self.intra_out
    }

    pub fn intra_in(&self) -> &[usize] {
        &self.intra_in
    }

    pub fn inter_out(&self) -> &[usize] {
        &self.inter_out
    }

    pub fn inter_in(&self) -> &[InterEdgeRef] {
        &self.inter_in
    }
}

impl std::fmt::Display for CfgNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[id: {}, addr: {:#x}, size: {}]",
            self.inter_cfg_id, self.addr, self.size
        )
    }
}

/// A directed, weighted, kind-tagged edge. Owned by the edge arena of its
/// source's CFG.
#[derive(Clone, Debug)]
pub struct CfgEdge {
    src: NodeRef,
    sink: NodeRef,
    weight: i64,
    kind: CfgEdgeKind,
    /// Whether the edge crosses functions in different output sections.
    inter_section: bool,
}

impl CfgEdge {
    pub fn new(src: NodeRef, sink: NodeRef, weight: i64, kind: CfgEdgeKind, inter_section: bool) -> CfgEdge {
        CfgEdge {
            src,
            sink,
            weight,
            kind,
            inter_section,
        }
    }

    pub fn src(&self) -> NodeRef {
        self.src
    }

    pub fn sink(&self) -> NodeRef {
        self.sink
    }

    pub fn weight(&self) -> i64 {
        self.weight
    }

    pub fn kind(&self) -> CfgEdgeKind {
        self.kind
    }

    pub fn inter_section(&self) -> bool {
        self.inter_section
    }

    pub fn is_branch_or_fallthrough(&self) -> bool {
        self.kind == CfgEdgeKind::BranchOrFallthrough
    }

    pub fn is_call(&self) -> bool {
        self.kind == CfgEdgeKind::Call
    }

    pub fn is_return(&self) -> bool {
        self.kind == CfgEdgeKind::Return
    }

    pub fn increment_weight(&mut self, increment: i64) {
        self.weight += increment;
    }

    /// Decrements the weight of this edge by the minimum of `value` and the
    /// current weight. Returns the reduction applied.
    pub fn decrement_weight(&mut self, value: i64) -> i64 {
        let reduction = value.min(self.weight);
        if self.weight < value {
            log::error!(
                "Edge weight is lower than value ({}): {} -> {} [weight: {}]",
                value,
                self.src.node_index,
                self.sink.node_index,
                self.weight
            );
        }
        self.weight -= reduction;
        reduction
    }
}

/// A control-flow graph of one function. Owns its nodes and edges; every
/// other reference into them is a positional handle.
#[derive(Clone, Debug)]
pub struct ControlFlowGraph {
    /// The output section this function can be reordered within.
    section_name: String,
    function_index: usize,
    module_name: Option<String>,
    /// The first name is the primary function name, the rest are aliases.
    names: SmallVec<[String; 3]>,

    /// Nodes, strictly ordered by (bb_index, clone_number): the originals
    /// first (arena index == bb_index), clones appended in encounter order.
    nodes: Vec<CfgNode>,
    n_landing_pads: usize,
    /// Arena indices of cloned nodes per original bb_index. A clone at
    /// position i of its vector has clone_number i + 1.
    clones_by_bb_index: VecMap<usize, usize>,
    /// Cloned paths, each starting with the path predecessor block. Paths
    /// are arena indices into `nodes`.
    clone_paths: Vec<Vec<usize>>,

    intra_edges: Vec<CfgEdge>,
    inter_edges: Vec<CfgEdge>,
}

/// Hot basic block stats for a single CFG.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NodeFrequencyStats {
    /// Number of hot (non-zero frequency) basic blocks.
    pub n_hot_blocks: usize,
    /// Number of hot landing pad basic blocks.
    pub n_hot_landing_pads: usize,
    /// Number of hot blocks with zero size.
    pub n_hot_empty_blocks: usize,
}

impl ControlFlowGraph {
    pub fn new(
        section_name: impl Into<String>,
        function_index: usize,
        module_name: Option<String>,
        names: SmallVec<[String; 3]>,
        nodes: Vec<CfgNode>,
    ) -> ControlFlowGraph {
        let mut cfg = ControlFlowGraph {
            section_name: section_name.into(),
            function_index,
            module_name,
            names,
            nodes,
            n_landing_pads: 0,
            clones_by_bb_index: VecMap::new(),
            clone_paths: Vec::new(),
            intra_edges: Vec::new(),
            inter_edges: Vec::new(),
        };
        let mut bb_index = 0;
        for i in 0..cfg.nodes.len() {
            let node = &cfg.nodes[i];
            assert_eq!(node.function_index(), function_index);
            if !node.is_cloned() {
                assert_eq!(node.bb_index(), bb_index, "nodes must be sorted by bb_index");
                bb_index += 1;
            } else {
                cfg.clones_by_bb_index.push(node.bb_index(), i);
                assert_eq!(
                    node.clone_number(),
                    cfg.clones_by_bb_index.len_of(&node.bb_index()),
                    "clone numbers must match their position"
                );
            }
            if node.is_landing_pad() {
                cfg.n_landing_pads += 1;
            }
        }
        cfg
    }

    pub fn section_name(&self) -> &str {
        &self.section_name
    }

    pub fn function_index(&self) -> usize {
        self.function_index
    }

    pub fn module_name(&self) -> Option<&str> {
        self.module_name.as_deref()
    }

    pub fn primary_name(&self) -> &str {
        self.names.first().expect("a CFG must have a primary name")
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn nodes(&self) -> &[CfgNode] {
        &self.nodes
    }

    pub fn node(&self, node_index: usize) -> &CfgNode {
        &self.nodes[node_index]
    }

    pub fn entry_node(&self) -> &CfgNode {
        self.nodes.first().expect("a CFG must have an entry node")
    }

    pub fn n_landing_pads(&self) -> usize {
        self.n_landing_pads
    }

    pub fn intra_edges(&self) -> &[CfgEdge] {
        &self.intra_edges
    }

    pub fn inter_edges(&self) -> &[CfgEdge] {
        &self.inter_edges
    }

    pub fn intra_edge(&self, edge_index: usize) -> &CfgEdge {
        &self.intra_edges[edge_index]
    }

    pub fn inter_edge(&self, edge_index: usize) -> &CfgEdge {
        &self.inter_edges[edge_index]
    }

    pub(crate) fn intra_edge_mut(&mut self, edge_index: usize) -> &mut CfgEdge {
        &mut self.intra_edges[edge_index]
    }

    pub(crate) fn inter_edge_mut(&mut self, edge_index: usize) -> &mut CfgEdge {
        &mut self.inter_edges[edge_index]
    }

    pub fn clones_by_bb_index(&self) -> &VecMap<usize, usize> {
        &self.clones_by_bb_index
    }

    /// Returns the cloned paths in this CFG, each a vector of arena
    /// indices starting with the path predecessor block.
    pub fn clone_paths(&self) -> &[Vec<usize>] {
        &self.clone_paths
    }

    pub fn add_clone_path(&mut self, clone_path: Vec<usize>) {
        self.clone_paths.push(clone_path);
    }

    /// Returns whether this CFG carries any profiled flow. Worst-case
    /// linear in the number of nodes.
    pub fn is_hot(&self) -> bool {
        if !self.inter_edges.is_empty() || !self.intra_edges.is_empty() {
            return true;
        }
        self.nodes.iter().any(|node| !node.inter_in.is_empty())
    }

    /// Returns the node with the given intra-cfg id. Panics if no such
    /// node exists.
    pub fn node_by_id(&self, id: IntraCfgId) -> &CfgNode {
        &self.nodes[self.node_index_by_id(id)]
    }

    pub fn node_index_by_id(&self, id: IntraCfgId) -> usize {
        if id.clone_number == 0 {
            let node = &self.nodes[id.bb_index];
            assert_eq!(node.bb_index(), id.bb_index);
            return id.bb_index;
        }
        let clones = self
            .clones_by_bb_index
            .get(&id.bb_index)
            .unwrap_or_else(|| panic!("no clones for id = {}", id));
        assert!(clones.len() > id.clone_number - 1, "no clone for id = {}", id);
        clones[id.clone_number - 1]
    }

    /// Returns arena indices of all instances (the original first, then
    /// clones in increasing clone_number) of the given `bb_index`.
    pub fn all_clones_for_bb_index(&self, bb_index: usize) -> Vec<usize> {
        let mut instances = vec![self.node_index_by_id(IntraCfgId {
            bb_index,
            clone_number: 0,
        })];
        if let Some(clones) = self.clones_by_bb_index.get(&bb_index) {
            instances.extend_from_slice(clones);
        }
        instances
    }

    /// Creates an intra-function edge. The caller is responsible for not
    /// creating duplicate (src, sink, kind) edges.
    pub fn create_intra_edge(
        &mut self,
        src_index: usize,
        sink_index: usize,
        weight: i64,
        kind: CfgEdgeKind,
    ) -> usize {
        debug_assert!(
            self.intra_edge_to(src_index, sink_index, kind).is_none(),
            "duplicate intra edge {} -> {} ({})",
            src_index,
            sink_index,
            kind
        );
        let src = self.nodes[src_index].node_ref();
        let sink = self.nodes[sink_index].node_ref();
        let edge_index = self.intra_edges.len();
        self.intra_edges.push(CfgEdge::new(src, sink, weight, kind, false));
        self.nodes[src_index].intra_out.push(edge_index);
        self.nodes[sink_index].intra_in.push(edge_index);
        edge_index
    }

    /// If an edge of `kind` already exists from `src_index` to
    /// `sink_index`, increments its weight, otherwise creates the edge.
    pub fn create_or_update_intra_edge(
        &mut self,
        src_index: usize,
        sink_index: usize,
        weight: i64,
        kind: CfgEdgeKind,
    ) -> usize {
        if let Some(edge_index) = self.intra_edge_to(src_index, sink_index, kind) {
            self.intra_edges[edge_index].increment_weight(weight);
            return edge_index;
        }
        self.create_intra_edge(src_index, sink_index, weight, kind)
    }

    /// Returns the intra edge from `src_index` to `sink_index` of `kind`,
    /// if any exists.
    pub fn intra_edge_to(&self, src_index: usize, sink_index: usize, kind: CfgEdgeKind) -> Option<usize> {
        self.nodes[src_index]
            .intra_out
            .iter()
            .copied()
            .find(|&e| self.intra_edges[e].kind() == kind && self.intra_edges[e].sink().node_index == sink_index)
    }

    /// Clones the blocks along `path_to_clone`, reachable via the path
    /// predecessor `path_pred_bb_index`. Both are given as bb_indices of
    /// original nodes. The new nodes carry no edges.
    pub fn clone_path(&mut self, path_pred_bb_index: usize, path_to_clone: &[usize]) {
        let mut clone_path = Vec::with_capacity(path_to_clone.len() + 1);
        clone_path.push(path_pred_bb_index);
        for &bb_index in path_to_clone {
            let clone_number = self.clones_by_bb_index.len_of(&bb_index) + 1;
            let node_index = self.nodes.len();
            let clone = self.nodes[bb_index].clone_node(clone_number, node_index);
            if clone.is_landing_pad() {
                self.n_landing_pads += 1;
            }
            self.nodes.push(clone);
            self.clones_by_bb_index.push(bb_index, node_index);
            clone_path.push(node_index);
        }
        self.clone_paths.push(clone_path);
    }

    /// Node frequency computed from this CFG's own edge arenas alone.
    /// Incoming inter-function flow is owned by other CFGs and resolved
    /// through [`crate::program_cfg::CfgRefs`]; here it contributes zero.
    pub fn node_frequency_local(&self, node_index: usize) -> i64 {
        let node = &self.nodes[node_index];
        let mut max_call_out = 0;
        let mut sum_out = 0;
        for &e in &node.intra_out {
            let edge = &self.intra_edges[e];
            if edge.is_call() {
                max_call_out = max_call_out.max(edge.weight());
            } else {
                sum_out += edge.weight();
            }
        }
        for &e in &node.inter_out {
            let edge = &self.inter_edges[e];
            if edge.is_call() {
                max_call_out = max_call_out.max(edge.weight());
            } else {
                sum_out += edge.weight();
            }
        }
        let mut max_ret_in = 0;
        let mut sum_in = 0;
        for &e in &node.intra_in {
            let edge = &self.intra_edges[e];
            if edge.is_return() {
                max_ret_in = max_ret_in.max(edge.weight());
            } else {
                sum_in += edge.weight();
            }
        }
        max_call_out.max(max_ret_in).max(sum_out).max(sum_in)
    }

    /// Counts hot blocks, hot landing pads and hot zero-size blocks, with
    /// frequencies resolved through `frequency`.
    pub fn node_frequency_stats(&self, frequency: impl Fn(&CfgNode) -> i64) -> NodeFrequencyStats {
        let mut stats = NodeFrequencyStats::default();
        for node in &self.nodes {
            if frequency(node) == 0 {
                continue;
            }
            stats.n_hot_blocks += 1;
            if node.size() == 0 {
                stats.n_hot_empty_blocks += 1;
            }
            if node.is_landing_pad() {
                stats.n_hot_landing_pads += 1;
            }
        }
        stats
    }

    /// Writes this CFG in dot format. `layout_index_map` maps block ids to
    /// layout positions; edges that are adjacent in the layout are
    /// highlighted.
    pub fn write_dot_format(
        &self,
        out: &mut impl std::io::Write,
        layout_index_map: &std::collections::HashMap<IntraCfgId, usize>,
    ) -> std::io::Result<()> {
        writeln!(out, "digraph {{")?;
        writeln!(out, "label=\"{}#{}\"", self.primary_name(), self.function_index)?;
        writeln!(out, "forcelabels=true;")?;
        for node in &self.nodes {
            writeln!(
                out,
                "{} [xlabel=\"{}#{}\", color = \"{}\" ];",
                node.full_intra_cfg_id().profile_bb_id(),
                node.size(),
                node.bb_index(),
                if node.clone_number() != 0 { "red" } else { "black" }
            )?;
        }
        for edge in &self.intra_edges {
            let src = &self.nodes[edge.src().node_index];
            let sink = &self.nodes[edge.sink().node_index];
            let is_layout_edge = match (
                layout_index_map.get(&src.intra_cfg_id()),
                layout_index_map.get(&sink.intra_cfg_id()),
            ) {
                (Some(&s), Some(&t)) => t == s + 1,
                _ => false,
            };
            writeln!(
                out,
                "{} -> {} [ label=\"{}#{}\", color =\"{}\"];",
                src.full_intra_cfg_id().profile_bb_id(),
                sink.full_intra_cfg_id().profile_bb_id(),
                edge.kind(),
                edge.weight(),
                if is_layout_edge { "red" } else { "black" }
            )?;
        }
        writeln!(out, "}}")
    }

    pub(crate) fn push_inter_edge(&mut self, edge: CfgEdge) -> usize {
        let edge_index = self.inter_edges.len();
        let src_index = edge.src().node_index;
        self.nodes[src_index].inter_out.push(edge_index);
        self.inter_edges.push(edge);
        edge_index
    }

    pub(crate) fn register_inter_in(&mut self, sink_index: usize, edge_ref: InterEdgeRef) {
        self.nodes[sink_index].inter_in.push(edge_ref);
    }
}

/// Returns a copy of `cfg` with its nodes and intra-function edges cloned
/// and its inter-function edges dropped.
pub fn clone_cfg(cfg: &ControlFlowGraph) -> ControlFlowGraph {
    let nodes = cfg
        .nodes()
        .iter()
        .enumerate()
        .map(|(i, node)| node.clone_node(node.clone_number(), i))
        .collect();
    let mut cfg_clone = ControlFlowGraph::new(
        cfg.section_name().to_string(),
        cfg.function_index(),
        cfg.module_name().map(str::to_string),
        cfg.names().iter().cloned().collect(),
        nodes,
    );
    for edge in cfg.intra_edges() {
        cfg_clone.create_intra_edge(
            edge.src().node_index,
            edge.sink().node_index,
            edge.weight(),
            edge.kind(),
        );
    }
    cfg_clone
}
