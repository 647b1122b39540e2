// SPDX-FileCopyrightText: 2025 The bblayout developers
// SPDX-License-Identifier: LGPL-3.0-only

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use crate::cfg::InterCfgId;
use crate::error::{LayoutError, Result};
use crate::node_chain::{ChainSlice, NodeChain, NodeToBundleMapper};
use crate::program_cfg::CfgRefs;
use crate::scorer::CodeLayoutScorer;

/// The order in which the two slices of the split chain S and the unsplit
/// chain U are concatenated. SU is the plain no-split merge.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ChainMergeOrder {
    SU,
    S2S1U,
    S1US2,
    US2S1,
    S2US1,
}

impl ChainMergeOrder {
    pub fn name(self) -> &'static str {
        match self {
            ChainMergeOrder::SU => "SU",
            ChainMergeOrder::S2S1U => "S2S1U",
            ChainMergeOrder::S1US2 => "S1US2",
            ChainMergeOrder::US2S1 => "US2S1",
            ChainMergeOrder::S2US1 => "S2US1",
        }
    }
}

/// How to build a [`NodeChainAssembly`]. `slice_pos` is the bundle index
/// the split chain is sliced at; it must be absent for SU and present for
/// every other merge order.
#[derive(Clone, Copy, Debug)]
pub struct AssemblyOptions {
    pub merge_order: ChainMergeOrder,
    pub slice_pos: Option<usize>,
    /// Reject assemblies whose score gain is exactly zero. Negative gains
    /// are always rejected.
    pub error_on_zero_score_gain: bool,
}

impl AssemblyOptions {
    pub fn new(merge_order: ChainMergeOrder) -> AssemblyOptions {
        AssemblyOptions {
            merge_order,
            slice_pos: None,
            error_on_zero_score_gain: true,
        }
    }

    pub fn with_slice_pos(mut self, slice_pos: usize) -> AssemblyOptions {
        self.slice_pos = Some(slice_pos);
        self
    }

    pub fn allow_zero_score_gain(mut self) -> AssemblyOptions {
        self.error_on_zero_score_gain = false;
        self
    }
}

/// A proposed merger of two chains: the (potentially) split chain S, the
/// unsplit chain U, the slice position and the merge order, along with the
/// ExtTSP score gain the merge would achieve. Slices store bundle ranges
/// and byte offsets so the gain can be computed without touching the
/// chains.
#[derive(Clone, Debug)]
pub struct NodeChainAssembly {
    split_chain: InterCfgId,
    unsplit_chain: InterCfgId,
    merge_order: ChainMergeOrder,
    slice_pos: Option<usize>,
    slices: Vec<ChainSlice>,
    score_gain: f64,
}

impl NodeChainAssembly {
    /// Builds the assembly of `split` and `unsplit` described by
    /// `options`, or a precondition failure when it is invalid (entry
    /// block in the middle, non-positive score gain).
    pub fn build(
        mapper: &NodeToBundleMapper,
        scorer: &CodeLayoutScorer,
        view: &CfgRefs,
        split: &NodeChain,
        unsplit: &NodeChain,
        options: AssemblyOptions,
    ) -> Result<NodeChainAssembly> {
        assert!(
            split.id() != unsplit.id(),
            "Cannot construct an assembly between a chain and itself."
        );
        if options.merge_order == ChainMergeOrder::SU {
            assert!(
                options.slice_pos.is_none(),
                "slice_pos must not be provided for the SU merge order."
            );
        } else {
            let slice_pos = options
                .slice_pos
                .expect("slice_pos is required for every merge order other than SU.");
            assert!(
                slice_pos > 0 && slice_pos < split.node_bundles().len(),
                "Out of bounds slice position."
            );
        }

        let slices = match options.merge_order {
            ChainMergeOrder::SU => {
                let s = ChainSlice::new(split, 0, split.node_bundles().len());
                let u = ChainSlice::new(unsplit, 0, unsplit.node_bundles().len());
                vec![s, u]
            }
            order => {
                let slice_pos = options.slice_pos.unwrap();
                let s1 = ChainSlice::new(split, 0, slice_pos);
                let s2 = ChainSlice::new(split, slice_pos, split.node_bundles().len());
                let u = ChainSlice::new(unsplit, 0, unsplit.node_bundles().len());
                match order {
                    ChainMergeOrder::S2S1U => vec![s2, s1, u],
                    ChainMergeOrder::S1US2 => vec![s1, u, s2],
                    ChainMergeOrder::US2S1 => vec![u, s2, s1],
                    ChainMergeOrder::S2US1 => vec![s2, u, s1],
                    ChainMergeOrder::SU => unreachable!(),
                }
            }
        };

        let mut assembly = NodeChainAssembly {
            split_chain: split.id(),
            unsplit_chain: unsplit.id(),
            merge_order: options.merge_order,
            slice_pos: options.slice_pos,
            slices,
            score_gain: 0.0,
        };

        // The entry block must lead the merged chain. Under inter-function
        // reordering blocks may precede the entry; the layout driver
        // starts a fresh chain at every entry block it reaches.
        if !scorer.params().inter_function_reordering {
            for (position, node) in assembly
                .nodes_in_assembly_order(split, unsplit)
                .into_iter()
                .enumerate()
            {
                if position != 0 && view.node(node).is_entry() {
                    return Err(LayoutError::failed_precondition(
                        "Assembly places the entry block in the middle.",
                    ));
                }
            }
        }

        let merged_score = assembly.compute_merged_score(mapper, scorer, view, split, unsplit);
        assembly.score_gain = merged_score - split.score() - unsplit.score();

        if assembly.score_gain < 0.0 {
            return Err(LayoutError::FailedPrecondition(format!(
                "Assembly has negative score gain: {:.6}",
                assembly.score_gain
            )));
        }
        if assembly.score_gain == 0.0 && options.error_on_zero_score_gain {
            return Err(LayoutError::failed_precondition(
                "Assembly has zero score gain.",
            ));
        }
        Ok(assembly)
    }

    pub fn split_chain(&self) -> InterCfgId {
        self.split_chain
    }

    pub fn unsplit_chain(&self) -> InterCfgId {
        self.unsplit_chain
    }

    pub fn merge_order(&self) -> ChainMergeOrder {
        self.merge_order
    }

    pub fn slice_pos(&self) -> Option<usize> {
        self.slice_pos
    }

    pub fn slices(&self) -> &[ChainSlice] {
        &self.slices
    }

    pub fn score_gain(&self) -> f64 {
        self.score_gain
    }

    pub fn splits(&self) -> bool {
        self.slice_pos.is_some()
    }

    /// The chain pair (split, unsplit) this assembly belongs to.
    pub fn chain_pair(&self) -> (InterCfgId, InterCfgId) {
        (self.split_chain, self.unsplit_chain)
    }

    /// Returns the nodes of the merged chain in their assembly order.
    pub fn nodes_in_assembly_order(
        &self,
        split: &NodeChain,
        unsplit: &NodeChain,
    ) -> Vec<crate::cfg::NodeRef> {
        let mut nodes = Vec::new();
        for slice in &self.slices {
            let chain = if slice.chain_id == split.id() { split } else { unsplit };
            for bundle in &chain.node_bundles()[slice.begin_bundle..slice.end_bundle] {
                nodes.extend_from_slice(bundle.nodes());
            }
        }
        nodes
    }

    /// Index of the slice containing the node, given its current bundle
    /// mapping, or None when the node is in neither chain.
    pub fn find_slice_index(
        &self,
        mapping: &crate::node_chain::BundleMapping,
    ) -> Option<usize> {
        self.slices
            .iter()
            .position(|slice| slice.contains(mapping.chain_id, mapping.bundle_index))
    }

    /// The total ExtTSP score of the merged chain: the unchanged internal
    /// score of U, the internal score of S (recomputed when S is really
    /// split, since its offsets change), and the contributions of all
    /// edges between the two chains under the new slice offsets.
    fn compute_merged_score(
        &self,
        mapper: &NodeToBundleMapper,
        scorer: &CodeLayoutScorer,
        view: &CfgRefs,
        split: &NodeChain,
        unsplit: &NodeChain,
    ) -> f64 {
        let mut score = unsplit.score();

        if self.splits() {
            for bundle in split.node_bundles() {
                for &loc in bundle.intra_chain_out_edges() {
                    score += self.edge_score(mapper, scorer, view, loc);
                }
            }
        } else {
            score += split.score();
        }

        for edges in [
            split.inter_chain_out_edges().get(&unsplit.id()),
            unsplit.inter_chain_out_edges().get(&split.id()),
        ]
        .into_iter()
        .flatten()
        {
            for &loc in edges {
                score += self.edge_score(mapper, scorer, view, loc);
            }
        }
        score
    }

    fn edge_score(
        &self,
        mapper: &NodeToBundleMapper,
        scorer: &CodeLayoutScorer,
        view: &CfgRefs,
        loc: crate::cfg::EdgeLoc,
    ) -> f64 {
        let edge = view.edge(loc);
        let Some(src_mapping) = mapper.get(edge.src()) else {
            return 0.0;
        };
        let Some(sink_mapping) = mapper.get(edge.sink()) else {
            return 0.0;
        };
        let Some(src_slice_index) = self.find_slice_index(src_mapping) else {
            return 0.0;
        };
        let Some(sink_slice_index) = self.find_slice_index(sink_mapping) else {
            return 0.0;
        };

        let src_offset = src_mapping.chain_offset as i64;
        let sink_offset = sink_mapping.chain_offset as i64;
        let src_size = view.node(edge.src()).size() as i64;

        let src_sink_distance = if src_slice_index == sink_slice_index {
            sink_offset - src_offset - src_size
        } else {
            let src_slice = &self.slices[src_slice_index];
            let sink_slice = &self.slices[sink_slice_index];
            let middle = if src_slice_index.abs_diff(sink_slice_index) == 2 {
                self.slices[1].size() as i64
            } else {
                0
            };
            if src_slice_index < sink_slice_index {
                (src_slice.end_offset as i64 - src_offset - src_size)
                    + (sink_offset - sink_slice.begin_offset as i64)
                    + middle
            } else {
                -((src_offset - src_slice.begin_offset as i64 + src_size)
                    + (sink_slice.end_offset as i64 - sink_offset)
                    + middle)
            }
        };
        scorer.edge_score(view, edge, src_sink_distance)
    }
}

/// The fixed total order on assemblies: primarily by score gain, ties
/// broken on (split id, unsplit id, merge order, slice position). The
/// greedy loop always applies the maximum under this order.
pub fn compare_assemblies(a: &NodeChainAssembly, b: &NodeChainAssembly) -> Ordering {
    a.score_gain
        .total_cmp(&b.score_gain)
        .then_with(|| a.split_chain.cmp(&b.split_chain))
        .then_with(|| a.unsplit_chain.cmp(&b.unsplit_chain))
        .then_with(|| a.merge_order.cmp(&b.merge_order))
        .then_with(|| a.slice_pos.cmp(&b.slice_pos))
}

/// Priority structure holding the current best assembly per ordered chain
/// pair.
pub trait NodeChainAssemblyQueue: Default {
    /// Inserts `assembly`, replacing any recorded assembly of the same
    /// chain pair.
    fn insert(&mut self, assembly: NodeChainAssembly);

    /// Drops the recorded assembly of the pair, if any.
    fn remove_pair(&mut self, split: InterCfgId, unsplit: InterCfgId);

    /// Removes and returns the best assembly.
    fn pop_best(&mut self) -> Option<NodeChainAssembly>;

    fn is_empty(&self) -> bool;
}

/// Flat map keyed by chain pair; a linear scan finds the maximum each
/// step. Cheap updates, O(n) extraction.
#[derive(Debug, Default)]
pub struct IterativeAssemblyQueue {
    by_pair: HashMap<(InterCfgId, InterCfgId), NodeChainAssembly>,
}

impl NodeChainAssemblyQueue for IterativeAssemblyQueue {
    fn insert(&mut self, assembly: NodeChainAssembly) {
        self.by_pair.insert(assembly.chain_pair(), assembly);
    }

    fn remove_pair(&mut self, split: InterCfgId, unsplit: InterCfgId) {
        self.by_pair.remove(&(split, unsplit));
    }

    fn pop_best(&mut self) -> Option<NodeChainAssembly> {
        let best_pair = self
            .by_pair
            .values()
            .reduce(|best, a| {
                if compare_assemblies(a, best) == Ordering::Greater {
                    a
                } else {
                    best
                }
            })?
            .chain_pair();
        self.by_pair.remove(&best_pair)
    }

    fn is_empty(&self) -> bool {
        self.by_pair.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct AssemblyKey {
    score_gain: f64,
    split: InterCfgId,
    unsplit: InterCfgId,
    merge_order: ChainMergeOrder,
    slice_pos: Option<usize>,
}

impl Eq for AssemblyKey {}

impl PartialOrd for AssemblyKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for AssemblyKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score_gain
            .total_cmp(&other.score_gain)
            .then_with(|| self.split.cmp(&other.split))
            .then_with(|| self.unsplit.cmp(&other.unsplit))
            .then_with(|| self.merge_order.cmp(&other.merge_order))
            .then_with(|| self.slice_pos.cmp(&other.slice_pos))
    }
}

impl AssemblyKey {
    fn of(assembly: &NodeChainAssembly) -> AssemblyKey {
        AssemblyKey {
            score_gain: assembly.score_gain(),
            split: assembly.split_chain(),
            unsplit: assembly.unsplit_chain(),
            merge_order: assembly.merge_order(),
            slice_pos: assembly.slice_pos(),
        }
    }
}

/// Ordered set keyed by (score gain, ids) for log-time extraction, plus a
/// pair index for invalidation.
#[derive(Debug, Default)]
pub struct BalancedTreeAssemblyQueue {
    ordered: BTreeMap<AssemblyKey, NodeChainAssembly>,
    key_by_pair: HashMap<(InterCfgId, InterCfgId), AssemblyKey>,
}

impl NodeChainAssemblyQueue for BalancedTreeAssemblyQueue {
    fn insert(&mut self, assembly: NodeChainAssembly) {
        let pair = assembly.chain_pair();
        if let Some(old_key) = self.key_by_pair.remove(&pair) {
            self.ordered.remove(&old_key);
        }
        let key = AssemblyKey::of(&assembly);
        self.key_by_pair.insert(pair, key);
        self.ordered.insert(key, assembly);
    }

    fn remove_pair(&mut self, split: InterCfgId, unsplit: InterCfgId) {
        if let Some(key) = self.key_by_pair.remove(&(split, unsplit)) {
            self.ordered.remove(&key);
        }
    }

    fn pop_best(&mut self) -> Option<NodeChainAssembly> {
        let (_, assembly) = self.ordered.pop_last()?;
        self.key_by_pair.remove(&assembly.chain_pair());
        Some(assembly)
    }

    fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}
