// SPDX-FileCopyrightText: 2025 The bblayout developers
// SPDX-License-Identifier: LGPL-3.0-only

use petgraph::algo::kosaraju_scc;
use petgraph::prelude::DiGraphMap;

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::cfg::{ControlFlowGraph, EdgeLoc, InterCfgId, NodeRef};
use crate::chain_assembly::{
    compare_assemblies, AssemblyOptions, ChainMergeOrder, IterativeAssemblyQueue,
    NodeChainAssembly, NodeChainAssemblyQueue,
};
use crate::code_layout::BbChain;
use crate::node_chain::{CfgNodeBundle, NodeChain, NodeToBundleMapper};
use crate::program_cfg::CfgRefs;
use crate::scorer::CodeLayoutScorer;

/// Returns the forced edges of `cfg` as a map from source to sink node
/// index. An edge is forced if it is the only profiled branch out of its
/// source and the only profiled branch into its sink.
pub fn get_forced_edges(cfg: &ControlFlowGraph) -> BTreeMap<usize, usize> {
    let profiled = |edge_index: &&usize| {
        let edge = cfg.intra_edge(**edge_index);
        edge.is_branch_or_fallthrough() && edge.weight() != 0
    };
    let mut forced = BTreeMap::new();
    for node in cfg.nodes() {
        let mut outs = node.intra_out().iter().filter(profiled);
        let (Some(&edge_index), None) = (outs.next(), outs.next()) else {
            continue;
        };
        let edge = cfg.intra_edge(edge_index);
        let sink_index = edge.sink().node_index;
        let mut ins = cfg.node(sink_index).intra_in().iter().filter(profiled);
        if let (Some(_), None) = (ins.next(), ins.next()) {
            forced.insert(node.node_index(), sink_index);
        }
    }
    forced
}

/// Breaks cycles among `forced_edges` by removing, on every cycle, the
/// edge whose sink has the smallest block id. Every node has at most one
/// forced out-edge and one forced in-edge, so each non-trivial strongly
/// connected component is a simple cycle. A node whose only forced edge
/// is a self-loop is elided entirely.
pub fn break_cycles(forced_edges: &mut BTreeMap<usize, usize>, cfg: &ControlFlowGraph) {
    let mut graph = DiGraphMap::<usize, ()>::new();
    for (&src, &sink) in forced_edges.iter() {
        graph.add_node(src);
        graph.add_node(sink);
        graph.add_edge(src, sink, ());
    }
    for scc in kosaraju_scc(&graph) {
        if scc.len() == 1 {
            let n = scc[0];
            if forced_edges.get(&n) == Some(&n) {
                forced_edges.remove(&n);
            }
            continue;
        }
        let victim = scc
            .iter()
            .copied()
            .min_by_key(|&src| {
                let sink = forced_edges[&src];
                (cfg.node(sink).intra_cfg_id(), cfg.node(src).intra_cfg_id())
            })
            .expect("non-empty SCC");
        forced_edges.remove(&victim);
    }
}

/// Returns the maximal forced paths of `cfg`, each a vector of node
/// indices, after cycle breaking.
pub fn get_forced_paths(cfg: &ControlFlowGraph) -> Vec<Vec<usize>> {
    let mut forced_edges = get_forced_edges(cfg);
    break_cycles(&mut forced_edges, cfg);

    let sinks: HashSet<usize> = forced_edges.values().copied().collect();
    let mut paths = Vec::new();
    for &head in forced_edges.keys() {
        if sinks.contains(&head) {
            continue;
        }
        let mut path = vec![head];
        let mut current = head;
        while let Some(&next) = forced_edges.get(&current) {
            path.push(next);
            current = next;
        }
        paths.push(path);
    }
    paths
}

/// Builds an ordered set of chains covering the reorderable blocks of a
/// set of CFGs sharing one output section.
///
/// The generic parameter selects the assembly priority structure; the
/// iterative queue wins for the small per-CFG problems, the balanced tree
/// for whole-section reordering.
pub struct NodeChainBuilder<'a, Q: NodeChainAssemblyQueue = IterativeAssemblyQueue> {
    scorer: CodeLayoutScorer,
    cfgs: Vec<&'a ControlFlowGraph>,
    view: CfgRefs<'a>,
    initial_chains: HashMap<usize, Vec<BbChain>>,
    frequencies: HashMap<NodeRef, i64>,
    chains: BTreeMap<InterCfgId, NodeChain>,
    mapper: NodeToBundleMapper,
    assemblies: Q,
}

impl<'a, Q: NodeChainAssemblyQueue> NodeChainBuilder<'a, Q> {
    pub fn new(
        scorer: CodeLayoutScorer,
        cfgs: Vec<&'a ControlFlowGraph>,
        initial_chains: HashMap<usize, Vec<BbChain>>,
    ) -> NodeChainBuilder<'a, Q> {
        let view = CfgRefs::new(cfgs.iter().copied());
        let mut frequencies = HashMap::new();
        for cfg in &cfgs {
            for node in cfg.nodes() {
                frequencies.insert(node.node_ref(), view.node_frequency(node.node_ref()));
            }
        }
        NodeChainBuilder {
            scorer,
            cfgs,
            view,
            initial_chains,
            frequencies,
            chains: BTreeMap::new(),
            mapper: NodeToBundleMapper::new(),
            assemblies: Q::default(),
        }
    }

    pub fn chains(&self) -> &BTreeMap<InterCfgId, NodeChain> {
        &self.chains
    }

    pub fn node_to_bundle_mapper(&self) -> &NodeToBundleMapper {
        &self.mapper
    }

    pub fn code_layout_scorer(&self) -> &CodeLayoutScorer {
        &self.scorer
    }

    pub fn cfgs(&self) -> &[&'a ControlFlowGraph] {
        &self.cfgs
    }

    pub fn view(&self) -> &CfgRefs<'a> {
        &self.view
    }

    pub fn node_chain_assemblies(&self) -> &Q {
        &self.assemblies
    }

    pub fn pop_best_assembly(&mut self) -> Option<NodeChainAssembly> {
        self.assemblies.pop_best()
    }

    fn node_frequency(&self, node: NodeRef) -> i64 {
        self.frequencies.get(&node).copied().unwrap_or(0)
    }

    /// Runs all phases and returns the built chains in delegate-id order.
    pub fn build_chains(mut self) -> Vec<NodeChain> {
        if self.scorer.params().reorder_hot_blocks {
            self.init_node_chains();
            self.init_chain_edges();
            self.init_chain_assemblies();
            loop {
                let Some(best) = self.assemblies.pop_best() else {
                    break;
                };
                self.merge_chains_with_assembly(best);
            }
            self.attach_fallthroughs();
        } else {
            self.init_input_order_chains();
        }
        if !self.scorer.params().inter_function_reordering {
            self.coalesce_chains();
        }
        self.repack_bundles();
        self.chains.into_values().collect()
    }

    /// Creates the initial chains: one per caller-supplied chain, one per
    /// forced path and a singleton per remaining reorderable block.
    pub fn init_node_chains(&mut self) {
        let split_functions = self.scorer.params().split_functions;
        for cfg_pos in 0..self.cfgs.len() {
            let cfg = self.cfgs[cfg_pos];
            if !cfg.is_hot() {
                continue;
            }
            let function_index = cfg.function_index();
            let mut covered: HashSet<usize> = HashSet::new();

            if let Some(bb_chains) = self.initial_chains.remove(&function_index) {
                for bb_chain in &bb_chains {
                    let runs: Vec<Vec<NodeRef>> = bb_chain
                        .bb_bundles
                        .iter()
                        .map(|bundle| {
                            bundle
                                .full_bb_ids
                                .iter()
                                .map(|full_bb_id| {
                                    let node_index =
                                        cfg.node_index_by_id(full_bb_id.intra_cfg_id);
                                    assert!(
                                        covered.insert(node_index),
                                        "Duplicate node in initial chains."
                                    );
                                    NodeRef {
                                        function_index,
                                        node_index,
                                    }
                                })
                                .collect()
                        })
                        .collect();
                    self.add_chain(runs);
                }
            }

            for path in get_forced_paths(cfg) {
                if path.iter().any(|node_index| covered.contains(node_index)) {
                    continue;
                }
                covered.extend(path.iter().copied());
                let run = path
                    .into_iter()
                    .map(|node_index| NodeRef {
                        function_index,
                        node_index,
                    })
                    .collect();
                self.add_chain(vec![run]);
            }

            for node in cfg.nodes() {
                if covered.contains(&node.node_index()) {
                    continue;
                }
                let node_ref = node.node_ref();
                let reorderable =
                    self.node_frequency(node_ref) != 0 || node.is_entry() || !split_functions;
                if reorderable {
                    self.add_chain(vec![vec![node_ref]]);
                }
            }
        }
    }

    /// Input-order mode: one chain per function keeping hot blocks in
    /// their original order, cold blocks appended behind them.
    fn init_input_order_chains(&mut self) {
        let split_functions = self.scorer.params().split_functions;
        for cfg_pos in 0..self.cfgs.len() {
            let cfg = self.cfgs[cfg_pos];
            if !cfg.is_hot() {
                continue;
            }
            let mut hot_nodes = Vec::new();
            let mut cold_nodes = Vec::new();
            for node in cfg.nodes() {
                let node_ref = node.node_ref();
                if self.node_frequency(node_ref) != 0 || node.is_entry() {
                    hot_nodes.push(node_ref);
                } else {
                    cold_nodes.push(node_ref);
                }
            }
            let mut runs = vec![hot_nodes];
            if !split_functions && !cold_nodes.is_empty() {
                runs.push(cold_nodes);
            }
            runs.retain(|run| !run.is_empty());
            if !runs.is_empty() {
                self.add_chain(runs);
            }
        }
    }

    fn add_chain(&mut self, runs: Vec<Vec<NodeRef>>) {
        let chain = NodeChain::new(runs, &self.view, |n| {
            self.frequencies.get(&n).copied().unwrap_or(0)
        });
        self.mapper.assign_chain(&chain, &self.view);
        let previous = self.chains.insert(chain.id(), chain);
        assert!(previous.is_none(), "chain ids must be unique");
    }

    /// Populates the inter-chain edge maps and the bundle-level
    /// intra-chain edge lists from the weighted, non-return edges of the
    /// chained nodes.
    pub fn init_chain_edges(&mut self) {
        let inter_function = self.scorer.params().inter_function_reordering;
        let chain_ids: Vec<InterCfgId> = self.chains.keys().copied().collect();
        for &chain_id in &chain_ids {
            let nodes: Vec<NodeRef> = self.chains[&chain_id].nodes().collect();
            for node_ref in nodes {
                let cfg = self
                    .view
                    .cfg(node_ref.function_index)
                    .expect("chained nodes come from the builder's CFGs");
                let node = cfg.node(node_ref.node_index);
                let mut edge_locs: Vec<EdgeLoc> = node
                    .intra_out()
                    .iter()
                    .map(|&edge_index| EdgeLoc {
                        function_index: node_ref.function_index,
                        inter: false,
                        edge_index,
                    })
                    .collect();
                if inter_function {
                    edge_locs.extend(node.inter_out().iter().map(|&edge_index| EdgeLoc {
                        function_index: node_ref.function_index,
                        inter: true,
                        edge_index,
                    }));
                }
                for loc in edge_locs {
                    let edge = self.view.edge(loc);
                    if edge.weight() == 0 || edge.is_return() {
                        continue;
                    }
                    let Some(sink_mapping) = self.mapper.get(edge.sink()) else {
                        continue;
                    };
                    let sink_chain_id = sink_mapping.chain_id;
                    if sink_chain_id == chain_id {
                        let src_bundle = self.mapper.mapping(edge.src()).bundle_index;
                        self.chains
                            .get_mut(&chain_id)
                            .unwrap()
                            .node_bundles_mut()[src_bundle]
                            .push_intra_chain_edge(loc);
                    } else {
                        self.chains
                            .get_mut(&chain_id)
                            .unwrap()
                            .inter_chain_out_edges_mut()
                            .entry(sink_chain_id)
                            .or_default()
                            .push(loc);
                        self.chains
                            .get_mut(&sink_chain_id)
                            .unwrap()
                            .inter_chain_in_edges_mut()
                            .insert(chain_id);
                    }
                }
            }
        }
        for &chain_id in &chain_ids {
            let mut chain = self.chains.remove(&chain_id).unwrap();
            self.sort_edge_lists(&mut chain);
            self.chains.insert(chain_id, chain);
        }
    }

    /// Computes each hot chain's score and seeds the assembly queue with
    /// the best assembly of every neighboring chain pair.
    pub fn init_chain_assemblies(&mut self) {
        let chain_ids: Vec<InterCfgId> = self.chains.keys().copied().collect();
        for &chain_id in &chain_ids {
            let score = if self.chains[&chain_id].freq() != 0 {
                self.compute_chain_score(&self.chains[&chain_id])
            } else {
                0.0
            };
            self.chains.get_mut(&chain_id).unwrap().set_score(score);
        }

        let mut visited: HashSet<(InterCfgId, InterCfgId)> = HashSet::new();
        for &chain_id in &chain_ids {
            if self.chains[&chain_id].freq() == 0 {
                continue;
            }
            let neighbors: Vec<InterCfgId> = self.chains[&chain_id]
                .inter_chain_out_edges()
                .keys()
                .copied()
                .collect();
            for other in neighbors {
                if other == chain_id || !visited.insert((chain_id, other)) {
                    continue;
                }
                visited.insert((other, chain_id));
                self.update_assembly(chain_id, other);
                self.update_assembly(other, chain_id);
            }
        }
    }

    /// The ExtTSP score of the edges internal to `chain` under its current
    /// offsets.
    pub fn compute_chain_score(&self, chain: &NodeChain) -> f64 {
        let mut score = 0.0;
        for bundle in chain.node_bundles() {
            for &loc in bundle.intra_chain_out_edges() {
                let edge = self.view.edge(loc);
                let src_offset = self.mapper.node_chain_offset(edge.src()) as i64;
                let sink_offset = self.mapper.node_chain_offset(edge.sink()) as i64;
                let src_size = self.view.node(edge.src()).size() as i64;
                score += self
                    .scorer
                    .edge_score(&self.view, edge, sink_offset - src_offset - src_size);
            }
        }
        score
    }

    /// Finds the best valid assembly of the (split, unsplit) pair and
    /// records it in the queue; stale entries of the pair are dropped.
    fn update_assembly(&mut self, split_id: InterCfgId, unsplit_id: InterCfgId) {
        let best = match (self.chains.get(&split_id), self.chains.get(&unsplit_id)) {
            (Some(split), Some(unsplit)) if split.freq() != 0 && unsplit.freq() != 0 => {
                self.find_best_assembly(split, unsplit)
            }
            _ => None,
        };
        match best {
            Some(assembly) => self.assemblies.insert(assembly),
            None => self.assemblies.remove_pair(split_id, unsplit_id),
        }
    }

    fn find_best_assembly(
        &self,
        split: &NodeChain,
        unsplit: &NodeChain,
    ) -> Option<NodeChainAssembly> {
        let params = self.scorer.params();
        let mut candidates = vec![AssemblyOptions::new(ChainMergeOrder::SU)];
        if params.chain_split && split.node_bundles().len() > 1 {
            let split_orders: &[ChainMergeOrder] = if params.inter_function_reordering {
                &[
                    ChainMergeOrder::S2S1U,
                    ChainMergeOrder::S1US2,
                    ChainMergeOrder::US2S1,
                    ChainMergeOrder::S2US1,
                ]
            } else {
                &[
                    ChainMergeOrder::S2S1U,
                    ChainMergeOrder::S1US2,
                    ChainMergeOrder::US2S1,
                ]
            };
            let slice_positions: Vec<usize> = if split.size() <= params.chain_split_threshold {
                (1..split.node_bundles().len()).collect()
            } else if params.inter_function_reordering {
                // Over-sized chains may still be split where one function
                // ends and another begins.
                self.function_transition_positions(split)
            } else {
                Vec::new()
            };
            for slice_pos in slice_positions {
                for &order in split_orders {
                    candidates.push(AssemblyOptions::new(order).with_slice_pos(slice_pos));
                }
            }
        }

        let mut best: Option<NodeChainAssembly> = None;
        for options in candidates {
            let Ok(assembly) = NodeChainAssembly::build(
                &self.mapper,
                &self.scorer,
                &self.view,
                split,
                unsplit,
                options,
            ) else {
                continue;
            };
            if best
                .as_ref()
                .map_or(true, |b| compare_assemblies(&assembly, b) == std::cmp::Ordering::Greater)
            {
                best = Some(assembly);
            }
        }
        best
    }

    fn function_transition_positions(&self, chain: &NodeChain) -> Vec<usize> {
        let bundles = chain.node_bundles();
        (1..bundles.len())
            .filter(|&i| {
                let prev = *bundles[i - 1].nodes().last().unwrap();
                let next = bundles[i].nodes()[0];
                prev.function_index != next.function_index
            })
            .collect()
    }

    /// Merges per the assembly's recipe and refreshes the queue around the
    /// surviving chain.
    pub fn merge_chains_with_assembly(&mut self, assembly: NodeChainAssembly) {
        let split_id = assembly.split_chain();
        let unsplit_id = assembly.unsplit_chain();
        // The merger is the chain whose nodes stay in place.
        let (merger_id, mergee_id) = if assembly.merge_order() == ChainMergeOrder::US2S1 {
            (unsplit_id, split_id)
        } else {
            (split_id, unsplit_id)
        };
        assert!(
            (self.chains[&split_id].freq() == 0) == (self.chains[&unsplit_id].freq() == 0),
            "Attempting to merge hot and cold chains."
        );

        let mut split = self.chains.remove(&split_id).unwrap();
        let mut unsplit = self.chains.remove(&unsplit_id).unwrap();

        let mut split_bundles: Vec<Option<CfgNodeBundle>> =
            split.node_bundles_mut().drain(..).map(Some).collect();
        let mut unsplit_bundles: Vec<Option<CfgNodeBundle>> =
            unsplit.node_bundles_mut().drain(..).map(Some).collect();
        let mut new_bundles = Vec::with_capacity(split_bundles.len() + unsplit_bundles.len());
        for slice in assembly.slices() {
            let source = if slice.chain_id == split_id {
                &mut split_bundles
            } else {
                &mut unsplit_bundles
            };
            for bundle in source[slice.begin_bundle..slice.end_bundle].iter_mut() {
                new_bundles.push(bundle.take().expect("each bundle occurs in one slice"));
            }
        }

        let new_score = split.score() + unsplit.score() + assembly.score_gain();
        let (merger, mergee) = if merger_id == split_id {
            (split, unsplit)
        } else {
            (unsplit, split)
        };

        // Stale queue entries of the vanishing chain.
        let mut stale: Vec<InterCfgId> = mergee.inter_chain_out_edges().keys().copied().collect();
        stale.extend(mergee.inter_chain_in_edges().iter().copied());
        stale.push(merger_id);
        for other in stale {
            self.assemblies.remove_pair(mergee_id, other);
            self.assemblies.remove_pair(other, mergee_id);
        }

        self.finish_merge(merger, mergee, new_bundles, new_score);

        let mut neighbors: Vec<InterCfgId> = self.chains[&merger_id]
            .inter_chain_out_edges()
            .keys()
            .copied()
            .collect();
        neighbors.extend(self.chains[&merger_id].inter_chain_in_edges().iter().copied());
        neighbors.sort_unstable();
        neighbors.dedup();
        for other in neighbors {
            if other == merger_id {
                continue;
            }
            self.update_assembly(merger_id, other);
            self.update_assembly(other, merger_id);
        }
    }

    /// Plain concatenation merge: `right` is appended behind `left`. Used
    /// for fall-through attachment and coalescing.
    pub fn merge_chains(&mut self, left_id: InterCfgId, right_id: InterCfgId) {
        assert_ne!(left_id, right_id, "Cannot merge a chain with itself.");
        let mut left = self.chains.remove(&left_id).unwrap();
        let mut right = self.chains.remove(&right_id).unwrap();
        let mut new_bundles: Vec<CfgNodeBundle> = left.node_bundles_mut().drain(..).collect();
        new_bundles.extend(right.node_bundles_mut().drain(..));
        let new_score = left.score() + right.score();
        self.finish_merge(left, right, new_bundles, new_score);
    }

    /// Installs the merged bundle sequence into `merger`, folds `mergee`'s
    /// edge maps into it and re-establishes every sorted-by-sink-offset
    /// invariant.
    fn finish_merge(
        &mut self,
        mut merger: NodeChain,
        mergee: NodeChain,
        new_bundles: Vec<CfgNodeBundle>,
        new_score: f64,
    ) {
        let merger_id = merger.id();
        let mergee_id = mergee.id();
        if merger.function_index() != mergee.function_index() {
            merger.set_function_index(None);
        }
        *merger.node_bundles_mut() = new_bundles;
        merger.recompute_layout();
        merger.set_score(new_score);
        self.mapper.assign_chain(&merger, &self.view);

        let (mergee_out, mergee_in) = mergee.into_edge_maps();
        for (sink_chain_id, mut edges) in mergee_out {
            if sink_chain_id == merger_id {
                // The chains are now one; these edges become intra-chain.
                self.distribute_intra_chain_edges(&mut merger, edges);
            } else {
                merger
                    .inter_chain_out_edges_mut()
                    .entry(sink_chain_id)
                    .or_default()
                    .append(&mut edges);
                let sink_chain = self.chains.get_mut(&sink_chain_id).unwrap();
                sink_chain.inter_chain_in_edges_mut().remove(&mergee_id);
                sink_chain.inter_chain_in_edges_mut().insert(merger_id);
            }
        }
        if let Some(edges) = merger.inter_chain_out_edges_mut().remove(&mergee_id) {
            self.distribute_intra_chain_edges(&mut merger, edges);
        }
        for src_chain_id in mergee_in {
            if src_chain_id == merger_id || src_chain_id == mergee_id {
                continue;
            }
            let src_chain = self.chains.get_mut(&src_chain_id).unwrap();
            if let Some(mut edges) = src_chain.inter_chain_out_edges_mut().remove(&mergee_id) {
                src_chain
                    .inter_chain_out_edges_mut()
                    .entry(merger_id)
                    .or_default()
                    .append(&mut edges);
            }
            merger.inter_chain_in_edges_mut().insert(src_chain_id);
        }
        merger.inter_chain_in_edges_mut().remove(&mergee_id);

        self.sort_edge_lists(&mut merger);
        let in_ids: Vec<InterCfgId> = merger.inter_chain_in_edges().iter().copied().collect();
        self.chains.insert(merger_id, merger);
        for src_chain_id in in_ids {
            let mapper = &self.mapper;
            let view = &self.view;
            if let Some(edges) = self
                .chains
                .get_mut(&src_chain_id)
                .and_then(|c| c.inter_chain_out_edges_mut().get_mut(&merger_id))
            {
                edges.sort_by_key(|&loc| mapper.node_chain_offset(view.edge(loc).sink()));
            }
        }
    }

    fn distribute_intra_chain_edges(&self, merger: &mut NodeChain, edges: Vec<EdgeLoc>) {
        for loc in edges {
            let src = self.view.edge(loc).src();
            let bundle_index = self.mapper.mapping(src).bundle_index;
            merger.node_bundles_mut()[bundle_index].push_intra_chain_edge(loc);
        }
    }

    fn sort_edge_lists(&self, chain: &mut NodeChain) {
        let mapper = &self.mapper;
        let view = &self.view;
        for bundle in chain.node_bundles_mut() {
            bundle.sort_intra_chain_edges(|loc| mapper.node_chain_offset(view.edge(loc).sink()));
        }
        for edges in chain.inter_chain_out_edges_mut().values_mut() {
            edges.sort_by_key(|&loc| mapper.node_chain_offset(view.edge(loc).sink()));
        }
    }

    /// Materializes original fall-throughs the greedy loop missed, then
    /// scans all branch edges for further attachment opportunities.
    pub fn attach_fallthroughs(&mut self) {
        for cfg_pos in 0..self.cfgs.len() {
            let cfg = self.cfgs[cfg_pos];
            if !cfg.is_hot() {
                continue;
            }
            for edge_index in 0..cfg.intra_edges().len() {
                let edge = cfg.intra_edge(edge_index);
                if !edge.is_branch_or_fallthrough() {
                    continue;
                }
                let src = cfg.node(edge.src().node_index);
                let sink = cfg.node(edge.sink().node_index);
                if !src.can_fallthrough()
                    || src.is_cloned()
                    || sink.is_cloned()
                    || sink.bb_index() != src.bb_index() + 1
                {
                    continue;
                }
                self.attach_nodes(edge.src(), edge.sink());
            }
            for edge_index in 0..cfg.intra_edges().len() {
                let edge = cfg.intra_edge(edge_index);
                if edge.is_branch_or_fallthrough() {
                    self.attach_nodes(edge.src(), edge.sink());
                }
            }
        }
    }

    /// Tries to place `sink` immediately after `src` by merging their
    /// chains. Possible only when `src` ends one chain, `sink` begins
    /// another, and both live in the same hot/cold bucket.
    fn attach_nodes(&mut self, src: NodeRef, sink: NodeRef) -> bool {
        if (self.node_frequency(src) == 0) != (self.node_frequency(sink) == 0) {
            return false;
        }
        let (Some(src_mapping), Some(sink_mapping)) = (self.mapper.get(src), self.mapper.get(sink))
        else {
            return false;
        };
        let src_chain_id = src_mapping.chain_id;
        let sink_chain_id = sink_mapping.chain_id;
        if src_chain_id == sink_chain_id {
            return false;
        }
        if self.chains[&src_chain_id].last_node() != src
            || self.chains[&sink_chain_id].first_node() != sink
        {
            return false;
        }
        if self.view.node(sink).is_entry() && !self.scorer.params().inter_function_reordering {
            return false;
        }
        self.merge_chains(src_chain_id, sink_chain_id);
        true
    }

    /// Coalesces the chains of every function, entry chain first, then by
    /// decreasing execution density. Hot and cold parts stay separate when
    /// function splitting is enabled.
    pub fn coalesce_chains(&mut self) {
        let split_functions = self.scorer.params().split_functions;
        let mut by_function: BTreeMap<usize, Vec<InterCfgId>> = BTreeMap::new();
        for (id, chain) in self.chains.iter() {
            let function_index = chain
                .function_index()
                .expect("coalescing requires single-function chains");
            by_function.entry(function_index).or_default().push(*id);
        }
        for (function_index, mut chain_ids) in by_function {
            let entry_chain_id = self
                .mapper
                .get(NodeRef {
                    function_index,
                    node_index: 0,
                })
                .map(|m| m.chain_id);
            chain_ids.sort_by(|a, b| {
                let ca = &self.chains[a];
                let cb = &self.chains[b];
                let a_hot = ca.freq() != 0;
                let b_hot = cb.freq() != 0;
                b_hot
                    .cmp(&a_hot)
                    .then_with(|| {
                        let a_entry = entry_chain_id == Some(*a);
                        let b_entry = entry_chain_id == Some(*b);
                        b_entry.cmp(&a_entry)
                    })
                    .then_with(|| cb.exec_density().total_cmp(&ca.exec_density()))
                    .then_with(|| a.cmp(b))
            });

            let mut merger: Option<InterCfgId> = None;
            for chain_id in chain_ids {
                let Some(merger_id) = merger else {
                    merger = Some(chain_id);
                    continue;
                };
                if split_functions
                    && (self.chains[&merger_id].freq() == 0)
                        != (self.chains[&chain_id].freq() == 0)
                {
                    merger = Some(chain_id);
                    continue;
                }
                self.merge_chains(merger_id, chain_id);
            }
        }
    }

    /// Chains too large to ever split again get their bundles merged per
    /// maximal same-function run; function boundaries stay, as the only
    /// remaining split points.
    fn repack_bundles(&mut self) {
        let threshold = self.scorer.params().chain_split_threshold;
        let chain_ids: Vec<InterCfgId> = self.chains.keys().copied().collect();
        for chain_id in chain_ids {
            if self.chains[&chain_id].size() <= threshold
                || self.chains[&chain_id].node_bundles().len() < 2
            {
                continue;
            }
            let mut chain = self.chains.remove(&chain_id).unwrap();
            let old_bundles: Vec<CfgNodeBundle> = chain.node_bundles_mut().drain(..).collect();
            let mut new_bundles: Vec<CfgNodeBundle> = Vec::new();
            for bundle in old_bundles {
                match new_bundles.last_mut() {
                    Some(last)
                        if last.nodes().last().unwrap().function_index
                            == bundle.nodes()[0].function_index =>
                    {
                        last.absorb(bundle);
                    }
                    _ => new_bundles.push(bundle),
                }
            }
            *chain.node_bundles_mut() = new_bundles;
            chain.recompute_layout();
            self.mapper.assign_chain(&chain, &self.view);
            self.sort_edge_lists(&mut chain);
            self.chains.insert(chain_id, chain);
        }
    }
}
