// SPDX-FileCopyrightText: 2025 The bblayout developers
// SPDX-License-Identifier: LGPL-3.0-only

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::cfg::{EdgeLoc, InterCfgId, NodeRef};
use crate::program_cfg::CfgRefs;

/// A maximal run of nodes that must stay contiguous in its chain. Bundles
/// embed forced paths and caller-supplied initial chains; chains are only
/// ever sliced at bundle boundaries.
#[derive(Clone, Debug)]
pub struct CfgNodeBundle {
    nodes: Vec<NodeRef>,
    /// Byte offset of this bundle within its chain.
    chain_offset: u64,
    size: u64,
    freq: i64,
    /// Edges from nodes of this bundle to nodes of the same chain, sorted
    /// by the sink's offset in the chain.
    intra_chain_out_edges: Vec<EdgeLoc>,
}

impl CfgNodeBundle {
    pub fn new(nodes: Vec<NodeRef>, view: &CfgRefs, freq: impl Fn(NodeRef) -> i64) -> CfgNodeBundle {
        assert!(!nodes.is_empty(), "a bundle must contain at least one node");
        let size = nodes.iter().map(|&n| view.node(n).size()).sum();
        let freq = nodes.iter().map(|&n| freq(n)).sum();
        CfgNodeBundle {
            nodes,
            chain_offset: 0,
            size,
            freq,
            intra_chain_out_edges: Vec::new(),
        }
    }

    pub fn nodes(&self) -> &[NodeRef] {
        &self.nodes
    }

    pub fn chain_offset(&self) -> u64 {
        self.chain_offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn freq(&self) -> i64 {
        self.freq
    }

    pub fn intra_chain_out_edges(&self) -> &[EdgeLoc] {
        &self.intra_chain_out_edges
    }

    pub(crate) fn push_intra_chain_edge(&mut self, edge: EdgeLoc) {
        self.intra_chain_out_edges.push(edge);
    }

    pub(crate) fn sort_intra_chain_edges(&mut self, sink_offset: impl Fn(EdgeLoc) -> u64) {
        self.intra_chain_out_edges
            .sort_by_key(|&loc| sink_offset(loc));
    }

    /// Absorbs `other` at the end of this bundle. Offsets stay untouched;
    /// the caller re-walks the chain afterwards.
    pub(crate) fn absorb(&mut self, mut other: CfgNodeBundle) {
        self.nodes.append(&mut other.nodes);
        self.size += other.size;
        self.freq += other.freq;
        self.intra_chain_out_edges
            .append(&mut other.intra_chain_out_edges);
    }
}

/// An ordered sequence of bundles of basic blocks, the unit the greedy
/// merge loop works on.
#[derive(Clone, Debug)]
pub struct NodeChain {
    /// Id of the delegate (first) node; identifies the chain and breaks
    /// ties deterministically.
    id: InterCfgId,
    /// The function all nodes belong to, or None for a multi-function
    /// chain.
    function_index: Option<usize>,
    bundles: Vec<CfgNodeBundle>,
    size: u64,
    freq: i64,
    /// Extended TSP score of the edges internal to this chain.
    score: f64,
    /// Outgoing edges per sink chain. Each edge list is sorted by the
    /// sink's offset in the sink chain.
    inter_chain_out_edges: BTreeMap<InterCfgId, Vec<EdgeLoc>>,
    /// Chains that have an edge into this chain.
    inter_chain_in_edges: BTreeSet<InterCfgId>,
}

impl NodeChain {
    /// Builds a chain of one bundle per node run in `node_runs`.
    pub fn new(
        node_runs: Vec<Vec<NodeRef>>,
        view: &CfgRefs,
        freq: impl Fn(NodeRef) -> i64,
    ) -> NodeChain {
        assert!(!node_runs.is_empty());
        let bundles: Vec<CfgNodeBundle> = node_runs
            .into_iter()
            .map(|nodes| CfgNodeBundle::new(nodes, view, &freq))
            .collect();
        let delegate_node = bundles[0].nodes()[0];
        let id = view.node(delegate_node).inter_cfg_id();
        let single_function = bundles
            .iter()
            .flat_map(|b| b.nodes())
            .all(|n| n.function_index == delegate_node.function_index);
        let function_index = single_function.then_some(delegate_node.function_index);
        let mut chain = NodeChain {
            id,
            function_index,
            bundles,
            size: 0,
            freq: 0,
            score: 0.0,
            inter_chain_out_edges: BTreeMap::new(),
            inter_chain_in_edges: BTreeSet::new(),
        };
        chain.recompute_layout();
        chain
    }

    pub fn id(&self) -> InterCfgId {
        self.id
    }

    /// Some(function_index) when every node of the chain belongs to one
    /// function.
    pub fn function_index(&self) -> Option<usize> {
        self.function_index
    }

    pub fn node_bundles(&self) -> &[CfgNodeBundle] {
        &self.bundles
    }

    pub(crate) fn node_bundles_mut(&mut self) -> &mut Vec<CfgNodeBundle> {
        &mut self.bundles
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn freq(&self) -> i64 {
        self.freq
    }

    pub fn score(&self) -> f64 {
        self.score
    }

    pub(crate) fn set_score(&mut self, score: f64) {
        self.score = score;
    }

    /// The execution density of the chain.
    pub fn exec_density(&self) -> f64 {
        self.freq as f64 / std::cmp::max(self.size, 1) as f64
    }

    pub fn first_node(&self) -> NodeRef {
        self.bundles[0].nodes()[0]
    }

    pub fn last_node(&self) -> NodeRef {
        *self
            .bundles
            .last()
            .expect("chains are never empty")
            .nodes()
            .last()
            .expect("bundles are never empty")
    }

    /// Iterates over all nodes of the chain in layout order.
    pub fn nodes(&self) -> impl Iterator<Item = NodeRef> + '_ {
        self.bundles.iter().flat_map(|b| b.nodes().iter().copied())
    }

    pub fn n_nodes(&self) -> usize {
        self.bundles.iter().map(|b| b.nodes().len()).sum()
    }

    pub fn inter_chain_out_edges(&self) -> &BTreeMap<InterCfgId, Vec<EdgeLoc>> {
        &self.inter_chain_out_edges
    }

    pub(crate) fn inter_chain_out_edges_mut(&mut self) -> &mut BTreeMap<InterCfgId, Vec<EdgeLoc>> {
        &mut self.inter_chain_out_edges
    }

    pub fn inter_chain_in_edges(&self) -> &BTreeSet<InterCfgId> {
        &self.inter_chain_in_edges
    }

    pub(crate) fn inter_chain_in_edges_mut(&mut self) -> &mut BTreeSet<InterCfgId> {
        &mut self.inter_chain_in_edges
    }

    pub(crate) fn set_function_index(&mut self, function_index: Option<usize>) {
        self.function_index = function_index;
    }

    /// Re-walks the bundles, assigning bundle offsets and recomputing the
    /// chain size and frequency.
    pub(crate) fn recompute_layout(&mut self) {
        let mut offset = 0;
        let mut freq = 0;
        for bundle in self.bundles.iter_mut() {
            bundle.chain_offset = offset;
            offset += bundle.size;
            freq += bundle.freq;
        }
        self.size = offset;
        self.freq = freq;
    }

    /// Consumes the chain, handing its edge maps to the merge machinery.
    pub(crate) fn into_edge_maps(
        self,
    ) -> (BTreeMap<InterCfgId, Vec<EdgeLoc>>, BTreeSet<InterCfgId>) {
        (self.inter_chain_out_edges, self.inter_chain_in_edges)
    }
}

/// A contiguous range of bundles of one chain, given by bundle indices
/// `[begin, end)` plus the byte offsets of the two endpoints. Slicing at
/// bundle granularity keeps forced paths and seeded bundles intact.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChainSlice {
    pub chain_id: InterCfgId,
    pub begin_bundle: usize,
    pub end_bundle: usize,
    pub begin_offset: u64,
    pub end_offset: u64,
}

impl ChainSlice {
    pub fn new(chain: &NodeChain, begin: usize, end: usize) -> ChainSlice {
        assert!(begin <= end, "begin <= end");
        assert!(
            begin <= chain.node_bundles().len(),
            "begin <= chain.node_bundles().size()"
        );
        assert!(
            end <= chain.node_bundles().len(),
            "end <= chain.node_bundles().size()"
        );
        let begin_offset = if begin == chain.node_bundles().len() {
            chain.size()
        } else {
            chain.node_bundles()[begin].chain_offset()
        };
        let end_offset = if end == chain.node_bundles().len() {
            chain.size()
        } else {
            chain.node_bundles()[end].chain_offset()
        };
        ChainSlice {
            chain_id: chain.id(),
            begin_bundle: begin,
            end_bundle: end,
            begin_offset,
            end_offset,
        }
    }

    /// Binary size of this slice.
    pub fn size(&self) -> u64 {
        self.end_offset - self.begin_offset
    }

    pub fn is_empty(&self) -> bool {
        self.begin_bundle == self.end_bundle
    }

    /// Whether the bundle at `bundle_index` of `chain_id` lies in this
    /// slice.
    pub fn contains(&self, chain_id: InterCfgId, bundle_index: usize) -> bool {
        self.chain_id == chain_id
            && bundle_index >= self.begin_bundle
            && bundle_index < self.end_bundle
    }
}

/// Where a node lives: its chain, its bundle and its position and byte
/// offset inside the chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BundleMapping {
    pub chain_id: InterCfgId,
    pub bundle_index: usize,
    pub index_in_bundle: usize,
    /// Byte offset of the node within its chain.
    pub chain_offset: u64,
}

/// The single owner of the node -> (chain, bundle) relation. Nodes carry
/// no back pointers; chain merging updates this table instead of walking
/// node structures.
#[derive(Debug, Default)]
pub struct NodeToBundleMapper {
    map: HashMap<NodeRef, BundleMapping>,
}

impl NodeToBundleMapper {
    pub fn new() -> NodeToBundleMapper {
        NodeToBundleMapper {
            map: HashMap::new(),
        }
    }

    pub fn get(&self, node: NodeRef) -> Option<&BundleMapping> {
        self.map.get(&node)
    }

    pub fn mapping(&self, node: NodeRef) -> &BundleMapping {
        self.map
            .get(&node)
            .unwrap_or_else(|| panic!("node {:?} is not mapped to any bundle", node))
    }

    pub fn node_chain_offset(&self, node: NodeRef) -> u64 {
        self.mapping(node).chain_offset
    }

    /// Re-registers every node of `chain`, assigning bundle indices and
    /// absolute chain offsets.
    pub fn assign_chain(&mut self, chain: &NodeChain, view: &CfgRefs) {
        for (bundle_index, bundle) in chain.node_bundles().iter().enumerate() {
            let mut offset = bundle.chain_offset();
            for (index_in_bundle, &node) in bundle.nodes().iter().enumerate() {
                self.map.insert(
                    node,
                    BundleMapping {
                        chain_id: chain.id(),
                        bundle_index,
                        index_in_bundle,
                        chain_offset: offset,
                    },
                );
                offset += view.node(node).size();
            }
        }
    }
}
