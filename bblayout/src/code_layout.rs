// SPDX-FileCopyrightText: 2025 The bblayout developers
// SPDX-License-Identifier: LGPL-3.0-only

use std::collections::{BTreeMap, HashMap};

use crate::cfg::{ControlFlowGraph, FullIntraCfgId, NodeRef};
use crate::chain_assembly::{BalancedTreeAssemblyQueue, IterativeAssemblyQueue};
use crate::chain_builder::NodeChainBuilder;
use crate::chain_cluster::{ChainCluster, ChainClusterBuilder};
use crate::config::CodeLayoutParams;
use crate::node_chain::NodeChain;
use crate::program_cfg::{CfgRefs, ProgramCfg};
use crate::scorer::CodeLayoutScorer;
use crate::stats::CodeLayoutStats;

/// Extended TSP scores of one CFG under one layout.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CfgScore {
    /// Total score across all intra-function edges.
    pub intra_score: f64,
    /// Total score across the outgoing inter-function edges. Only the
    /// outgoing side is counted, to avoid double counting.
    pub inter_out_score: f64,
}

/// A run of blocks that stays contiguous within its chain.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BbBundle {
    pub full_bb_ids: Vec<FullIntraCfgId>,
}

/// A chain of basic blocks which are contiguous in the layout.
#[derive(Clone, Debug, PartialEq)]
pub struct BbChain {
    /// Index of this chain in the global layout (zero-based).
    pub layout_index: usize,
    pub bb_bundles: Vec<BbBundle>,
}

impl BbChain {
    pub fn new(layout_index: usize) -> BbChain {
        BbChain {
            layout_index,
            bb_bundles: Vec::new(),
        }
    }

    /// The flattened ids of all blocks in this chain, in order.
    pub fn all_bbs(&self) -> Vec<FullIntraCfgId> {
        self.bb_bundles
            .iter()
            .flat_map(|bundle| bundle.full_bb_ids.iter().copied())
            .collect()
    }

    pub fn n_bbs(&self) -> usize {
        self.bb_bundles.iter().map(|b| b.full_bb_ids.len()).sum()
    }

    pub fn first_bb(&self) -> &FullIntraCfgId {
        &self.bb_bundles[0].full_bb_ids[0]
    }
}

/// The per-function layout result.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FunctionChainInfo {
    pub function_index: usize,
    pub bb_chains: Vec<BbChain>,
    pub original_score: CfgScore,
    pub optimized_score: CfgScore,
    /// Position of this function's cold chain within the cold part.
    pub cold_chain_layout_index: usize,
}

/// Layout information for all functions of one section.
#[derive(Debug, Default, PartialEq)]
pub struct SectionLayoutInfo {
    pub layouts_by_function_index: BTreeMap<usize, FunctionChainInfo>,
}

/// Performs code layout on a set of CFGs that share one output section.
pub struct CodeLayout<'a> {
    scorer: CodeLayoutScorer,
    cfgs: Vec<&'a ControlFlowGraph>,
    /// Chains the builder must keep intact, per function index.
    initial_chains: HashMap<usize, Vec<BbChain>>,
    stats: CodeLayoutStats,
}

impl<'a> CodeLayout<'a> {
    pub fn new(params: &CodeLayoutParams, cfgs: Vec<&'a ControlFlowGraph>) -> CodeLayout<'a> {
        CodeLayout::with_initial_chains(params, cfgs, HashMap::new())
    }

    pub fn with_initial_chains(
        params: &CodeLayoutParams,
        cfgs: Vec<&'a ControlFlowGraph>,
        initial_chains: HashMap<usize, Vec<BbChain>>,
    ) -> CodeLayout<'a> {
        CodeLayout {
            scorer: CodeLayoutScorer::new(params),
            cfgs,
            initial_chains,
            stats: CodeLayoutStats::default(),
        }
    }

    /// Runs the layout and returns the chain info of every function, in
    /// increasing order of function index.
    pub fn order_all(self) -> Vec<FunctionChainInfo> {
        let (section_layout_info, _) = self.generate_layout();
        section_layout_info
            .layouts_by_function_index
            .into_values()
            .collect()
    }

    /// Runs the layout, returning the section result and the layout
    /// statistics.
    pub fn generate_layout(mut self) -> (SectionLayoutInfo, CodeLayoutStats) {
        let view = CfgRefs::new(self.cfgs.iter().copied());
        let params = self.scorer.params().clone();

        // Build optimal node chains; over the whole section at once when
        // inter-function reordering is requested, per CFG otherwise.
        let mut built_chains: Vec<NodeChain> = Vec::new();
        if params.inter_function_reordering {
            built_chains = NodeChainBuilder::<BalancedTreeAssemblyQueue>::new(
                self.scorer.clone(),
                self.cfgs.clone(),
                std::mem::take(&mut self.initial_chains),
            )
            .build_chains();
        } else {
            for &cfg in &self.cfgs {
                if !cfg.is_hot() {
                    continue;
                }
                let mut function_initial_chains = HashMap::new();
                if let Some(chains) = self.initial_chains.remove(&cfg.function_index()) {
                    function_initial_chains.insert(cfg.function_index(), chains);
                }
                built_chains.extend(
                    NodeChainBuilder::<IterativeAssemblyQueue>::new(
                        self.scorer.clone(),
                        vec![cfg],
                        function_initial_chains,
                    )
                    .build_chains(),
                );
            }
        }
        self.stats.n_chains_built += built_chains.len();

        // Further cluster the chains to get the global order of all nodes.
        let clusters = ChainClusterBuilder::new(&params, &view, built_chains).build_clusters();

        let orig_score_map = self.compute_cfg_scores(&view, |node| view.node(node).addr());
        let mut layout_addr = 0;
        let mut layout_address_map: HashMap<NodeRef, u64> = HashMap::new();
        for cluster in &clusters {
            for node in cluster.nodes() {
                layout_address_map.insert(node, layout_addr);
                layout_addr += view.node(node).size();
            }
        }
        let opt_score_map = self.compute_cfg_scores(&view, |node| {
            layout_address_map.get(&node).copied().unwrap_or(0)
        });

        let section_layout_info = self.emit_section_layout(
            &view,
            &clusters,
            &orig_score_map,
            &opt_score_map,
        );

        for info in section_layout_info.layouts_by_function_index.values() {
            self.stats.original_intra_score += info.original_score.intra_score;
            self.stats.optimized_intra_score += info.optimized_score.intra_score;
            self.stats.original_inter_score += info.original_score.inter_out_score;
            self.stats.optimized_inter_score += info.optimized_score.inter_out_score;
        }
        (section_layout_info, self.stats)
    }

    /// Walks the final clusters, assigning layout and cold-chain indices
    /// and materializing the per-function chains.
    fn emit_section_layout(
        &self,
        view: &CfgRefs<'a>,
        clusters: &[ChainCluster],
        orig_score_map: &HashMap<usize, CfgScore>,
        opt_score_map: &HashMap<usize, CfgScore>,
    ) -> SectionLayoutInfo {
        let mut layouts: BTreeMap<usize, FunctionChainInfo> = BTreeMap::new();
        let mut current_function: Option<usize> = None;
        let mut layout_index = 0;
        // Cold chains are laid out consistently with how hot chains appear
        // in the layout: foo's cold chain precedes bar's iff a hot chain
        // of foo precedes all hot chains of bar.
        let mut cold_chain_layout_index = 0;

        for cluster in clusters {
            for chain in cluster.chains() {
                for bundle in chain.node_bundles() {
                    for (i, &node_ref) in bundle.nodes().iter().enumerate() {
                        let node = view.node(node_ref);
                        let function_index = node.function_index();
                        if current_function != Some(function_index) || node.is_entry() {
                            current_function = Some(function_index);
                            if !layouts.contains_key(&function_index) {
                                layouts.insert(
                                    function_index,
                                    FunctionChainInfo {
                                        function_index,
                                        bb_chains: Vec::new(),
                                        original_score: orig_score_map
                                            .get(&function_index)
                                            .copied()
                                            .unwrap_or_default(),
                                        optimized_score: opt_score_map
                                            .get(&function_index)
                                            .copied()
                                            .unwrap_or_default(),
                                        cold_chain_layout_index,
                                    },
                                );
                                cold_chain_layout_index += 1;
                            }
                            let info = layouts.get_mut(&function_index).unwrap();
                            info.bb_chains.push(BbChain::new(layout_index));
                            layout_index += 1;
                        }
                        let info = layouts.get_mut(&function_index).unwrap();
                        let chain_info = info.bb_chains.last_mut().unwrap();
                        if i == 0 || chain_info.bb_bundles.is_empty() {
                            chain_info.bb_bundles.push(BbBundle::default());
                        }
                        chain_info
                            .bb_bundles
                            .last_mut()
                            .unwrap()
                            .full_bb_ids
                            .push(node.full_intra_cfg_id());
                    }
                }
            }
        }

        // Fix the external order of each function's chains, independent of
        // the global chain ordering.
        for info in layouts.values_mut() {
            info.bb_chains.sort_by_key(|chain| chain.first_bb().bb_id);
        }
        SectionLayoutInfo {
            layouts_by_function_index: layouts,
        }
    }

    /// The intra- and inter-out ExtTSP scores of every CFG, with node
    /// positions provided by `node_addr`.
    fn compute_cfg_scores(
        &self,
        view: &CfgRefs<'a>,
        node_addr: impl Fn(NodeRef) -> u64,
    ) -> HashMap<usize, CfgScore> {
        let mut score_map = HashMap::new();
        for &cfg in &self.cfgs {
            let mut intra_score = 0.0;
            for edge in cfg.intra_edges() {
                if edge.weight() == 0 || edge.is_return() {
                    continue;
                }
                let distance = node_addr(edge.sink()) as i64
                    - node_addr(edge.src()) as i64
                    - view.node(edge.src()).size() as i64;
                intra_score += self.scorer.edge_score(view, edge, distance);
            }
            let mut inter_out_score = 0.0;
            if self.cfgs.len() > 1 {
                for edge in cfg.inter_edges() {
                    if edge.weight() == 0 || edge.is_return() || edge.inter_section() {
                        continue;
                    }
                    let distance = node_addr(edge.sink()) as i64
                        - node_addr(edge.src()) as i64
                        - view.node(edge.src()).size() as i64;
                    inter_out_score += self.scorer.edge_score(view, edge, distance);
                }
            }
            score_map.insert(
                cfg.function_index(),
                CfgScore {
                    intra_score,
                    inter_out_score,
                },
            );
        }
        score_map
    }
}

/// Runs [`CodeLayout`] on every section of `program_cfg` and returns the
/// results keyed by section name, along with the merged statistics.
pub fn generate_layout_by_section(
    program_cfg: &ProgramCfg,
    params: &CodeLayoutParams,
) -> (BTreeMap<String, SectionLayoutInfo>, CodeLayoutStats) {
    let mut layout_info_by_section_name = BTreeMap::new();
    let mut stats = CodeLayoutStats::default();
    for (section_name, cfgs) in program_cfg.cfgs_by_section_name() {
        let (section_layout_info, section_stats) =
            CodeLayout::new(params, cfgs).generate_layout();
        stats += section_stats;
        layout_info_by_section_name.insert(section_name.to_string(), section_layout_info);
    }
    (layout_info_by_section_name, stats)
}
