// SPDX-FileCopyrightText: 2025 The bblayout developers
// SPDX-License-Identifier: LGPL-3.0-only

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::cfg::{CfgEdgeKind, ControlFlowGraph};
use crate::cfg_change::{
    CfgBuilder, CfgChangeFromPathCloning, ConflictEdges, IntraEdgeReroute, InterEdgeReroute,
    PathDropInfo,
};
use crate::code_layout::{BbBundle, BbChain, CodeLayout, FunctionChainInfo};
use crate::config::{CodeLayoutParams, PathProfileOptions};
use crate::error::{LayoutError, Result};
use crate::path_profile::{
    FunctionPathProfile, PathCloning, PathNode, ProgramPathProfile,
};
use crate::program_cfg::ProgramCfg;

/// A (potentially) evaluated path cloning. `score` is None when the
/// cloning has not been evaluated yet, in which case the applicator must
/// evaluate it before committing.
#[derive(Clone, Debug)]
pub struct EvaluatedPathCloning<'p> {
    pub path_cloning: PathCloning<'p>,
    pub score: Option<f64>,
    pub cfg_change: CfgChangeFromPathCloning,
}

/// Walks the cloning path and constructs the `CfgChangeFromPathCloning`,
/// or fails when the cloning conflicts with previously applied clonings.
pub struct CfgChangeBuilder<'a, 'p> {
    cloning: &'a PathCloning<'p>,
    conflict_edges: &'a ConflictEdges,
    function_path_profile: &'p FunctionPathProfile,
    /// Paths with missing path predecessor ending at the currently
    /// visited block. Their outgoing weights must be dropped.
    current_paths_with_missing_pred: Vec<&'p PathNode>,
    cfg_change: CfgChangeFromPathCloning,
}

enum PathVisit {
    /// The path predecessor block.
    Pred,
    /// A block of the cloning path; true when it is the last one.
    Cloned { last: bool },
}

impl<'a, 'p> CfgChangeBuilder<'a, 'p> {
    pub fn new(
        cloning: &'a PathCloning<'p>,
        conflict_edges: &'a ConflictEdges,
        function_path_profile: &'p FunctionPathProfile,
    ) -> CfgChangeBuilder<'a, 'p> {
        CfgChangeBuilder {
            cloning,
            conflict_edges,
            function_path_profile,
            current_paths_with_missing_pred: Vec::new(),
            cfg_change: CfgChangeFromPathCloning {
                path_pred_bb_index: cloning.path_pred_bb_index,
                ..CfgChangeFromPathCloning::default()
            },
        }
    }

    pub fn build(mut self) -> Result<CfgChangeFromPathCloning> {
        self.visit(PathVisit::Pred, None)?;
        let path = &self.cloning.path;
        for index in 0..path.len() {
            self.visit(
                PathVisit::Cloned {
                    last: index + 1 == path.len(),
                },
                Some(index),
            )?;
        }
        // Returns out of the last block of the path leave via the clone.
        let last = self.cloning.last();
        let return_to_freqs = &last
            .path_pred_info()
            .entry(self.cloning.path_pred_bb_index)
            .unwrap_or_else(|| {
                panic!(
                    "Path is unreachable via the predecessor block: {}",
                    self.cloning.path_pred_bb_index
                )
            })
            .return_to_freqs;
        for (bb_handle, &freq) in return_to_freqs {
            self.cfg_change.inter_edge_reroutes.push(InterEdgeReroute {
                src_function_index: self.cloning.function_index,
                sink_function_index: bb_handle.function_index,
                src_bb_index: last.node_bb_index(),
                sink_bb_index: bb_handle.flat_bb_index,
                src_is_cloned: true,
                sink_is_cloned: false,
                kind: CfgEdgeKind::Return,
                weight: freq,
            });
        }
        self.cfg_change.path_to_clone = self.cloning.path_bb_indexes();
        Ok(self.cfg_change)
    }

    fn visit(&mut self, status: PathVisit, path_index: Option<usize>) -> Result<()> {
        let path = &self.cloning.path;
        let pred_bb_index = self.cloning.path_pred_bb_index;
        let (current_bb_index, next_index) = match status {
            PathVisit::Pred => (pred_bb_index, Some(0)),
            PathVisit::Cloned { last } => {
                let index = path_index.expect("cloned visits carry their path index");
                (
                    path[index].node_bb_index(),
                    if last { None } else { Some(index + 1) },
                )
            }
        };

        if let Some(next_index) = next_index {
            let next_path_node = path[next_index];
            let next_entry = next_path_node
                .path_pred_info()
                .entry(pred_bb_index)
                .unwrap_or_else(|| {
                    panic!(
                        "Path is unreachable via the predecessor block: {}",
                        pred_bb_index
                    )
                });
            // The flow from the previous block of the path is rerouted via
            // the clone.
            self.add_intra_reroute(IntraEdgeReroute {
                src_bb_index: current_bb_index,
                sink_bb_index: next_path_node.node_bb_index(),
                src_is_cloned: !matches!(status, PathVisit::Pred),
                sink_is_cloned: true,
                kind: CfgEdgeKind::BranchOrFallthrough,
                weight: next_entry.freq,
            })?;
        }

        if let PathVisit::Cloned { .. } = status {
            self.update_paths_with_missing_pred(current_bb_index);
            let current_path_node = path[path_index.unwrap()];
            let current_entry = current_path_node
                .path_pred_info()
                .entry(pred_bb_index)
                .unwrap_or_else(|| {
                    panic!(
                        "Path is unreachable via the predecessor block: {}",
                        pred_bb_index
                    )
                });
            for (call_ret, &freq) in &current_entry.call_freqs {
                if let Some(callee) = call_ret.callee {
                    self.cfg_change.inter_edge_reroutes.push(InterEdgeReroute {
                        src_function_index: self.cloning.function_index,
                        sink_function_index: callee,
                        src_bb_index: current_bb_index,
                        sink_bb_index: 0,
                        src_is_cloned: true,
                        sink_is_cloned: false,
                        kind: CfgEdgeKind::Call,
                        weight: freq,
                    });
                }
                if let Some(return_bb) = call_ret.return_bb {
                    self.cfg_change.inter_edge_reroutes.push(InterEdgeReroute {
                        src_function_index: return_bb.function_index,
                        sink_function_index: self.cloning.function_index,
                        src_bb_index: return_bb.flat_bb_index,
                        sink_bb_index: current_bb_index,
                        src_is_cloned: false,
                        sink_is_cloned: true,
                        kind: CfgEdgeKind::Return,
                        weight: freq,
                    });
                }
            }
            // The remaining outgoing flow of the path leaves the clone
            // towards the original successors.
            let next_bb_index = next_index.map(|i| path[i].node_bb_index());
            for (&child_bb_index, child_path_node) in current_path_node.children() {
                if next_bb_index == Some(child_bb_index) {
                    continue;
                }
                let Some(child_entry) = child_path_node.path_pred_info().entry(pred_bb_index)
                else {
                    continue;
                };
                self.add_intra_reroute(IntraEdgeReroute {
                    src_bb_index: current_bb_index,
                    sink_bb_index: child_bb_index,
                    src_is_cloned: true,
                    sink_is_cloned: false,
                    kind: CfgEdgeKind::BranchOrFallthrough,
                    weight: child_entry.freq,
                })?;
            }
        }
        Ok(())
    }

    fn add_intra_reroute(&mut self, reroute: IntraEdgeReroute) -> Result<()> {
        let edge = (reroute.src_bb_index, reroute.sink_bb_index);
        if reroute.src_is_cloned {
            if self.conflict_edges.path_pred_edges.contains(&edge) {
                return Err(LayoutError::failed_precondition(
                    "Edge is the path predecessor of some cloning previously applied.",
                ));
            }
        } else if self.conflict_edges.affected_edges.contains(&edge) {
            return Err(LayoutError::failed_precondition(
                "path predecessor edge has been affected by the currently applied clonings.",
            ));
        }
        self.cfg_change.intra_edge_reroutes.push(reroute);
        Ok(())
    }

    /// Advances the tracked missing-predecessor paths to `bb_index` and
    /// records every one that still carries flow.
    fn update_paths_with_missing_pred(&mut self, bb_index: usize) {
        let mut new_paths = Vec::with_capacity(self.current_paths_with_missing_pred.len() + 1);
        for path_with_missing_pred in &self.current_paths_with_missing_pred {
            let Some(next) = path_with_missing_pred.child(bb_index) else {
                continue;
            };
            if next.path_pred_info().missing_pred_entry.freq == 0 {
                continue;
            }
            new_paths.push(next);
        }
        if let Some(new_tree) = self.function_path_profile.path_tree(bb_index) {
            if new_tree.path_pred_info().missing_pred_entry.freq != 0 {
                new_paths.push(new_tree);
            }
        }
        self.current_paths_with_missing_pred = new_paths;
        for path_with_missing_pred in &self.current_paths_with_missing_pred {
            self.cfg_change
                .paths_to_drop
                .push(PathDropInfo::for_path_node(path_with_missing_pred));
        }
    }
}

/// Extracts initial chains for laying out `cfg` under `cfg_change`, from
/// the unaffected fallthrough runs of a previously computed layout. Two
/// adjacent blocks stay in one bundle iff they form a fallthrough in
/// `chain_info` and neither is touched by `cfg_change`.
pub fn get_initial_chains(
    cfg: &ControlFlowGraph,
    chain_info: &FunctionChainInfo,
    cfg_change: &CfgChangeFromPathCloning,
) -> Vec<BbChain> {
    assert_eq!(cfg.function_index(), chain_info.function_index);
    let mut touched: HashSet<usize> = HashSet::new();
    for reroute in &cfg_change.intra_edge_reroutes {
        touched.insert(reroute.src_bb_index);
        touched.insert(reroute.sink_bb_index);
    }

    let mut all_chains: Vec<BbChain> = Vec::new();
    for bb_chain in &chain_info.bb_chains {
        let mut new_bb_chain = BbChain::new(bb_chain.layout_index);
        for bundle in &bb_chain.bb_bundles {
            new_bb_chain.bb_bundles.push(BbBundle::default());
            for &full_bb_id in &bundle.full_bb_ids {
                // Commit the current chain and skip this block if it is in
                // the path.
                if touched.contains(&full_bb_id.intra_cfg_id.bb_index) {
                    all_chains.push(new_bb_chain);
                    new_bb_chain = BbChain::new(bb_chain.layout_index);
                    new_bb_chain.bb_bundles.push(BbBundle::default());
                    continue;
                }
                let current_bundle = new_bb_chain.bb_bundles.last_mut().unwrap();
                if current_bundle.full_bb_ids.is_empty() {
                    current_bundle.full_bb_ids.push(full_bb_id);
                    continue;
                }
                // Extend only while the previous block can branch to this
                // one.
                let prev_index =
                    cfg.node_index_by_id(current_bundle.full_bb_ids.last().unwrap().intra_cfg_id);
                let this_index = cfg.node_index_by_id(full_bb_id.intra_cfg_id);
                if cfg
                    .intra_edge_to(prev_index, this_index, CfgEdgeKind::BranchOrFallthrough)
                    .is_none()
                {
                    all_chains.push(new_bb_chain);
                    new_bb_chain = BbChain::new(bb_chain.layout_index);
                    new_bb_chain.bb_bundles.push(BbBundle::default());
                }
                new_bb_chain
                    .bb_bundles
                    .last_mut()
                    .unwrap()
                    .full_bb_ids
                    .push(full_bb_id);
            }
        }
        all_chains.push(new_bb_chain);
    }
    for chain in all_chains.iter_mut() {
        chain.bb_bundles.retain(|bundle| !bundle.full_bb_ids.is_empty());
    }
    all_chains.retain(|chain| !chain.bb_bundles.is_empty());
    all_chains
}

/// The code-size and cache-pressure penalty of a cloning.
fn clone_penalty(
    cfg: &ControlFlowGraph,
    path_profile_options: &PathProfileOptions,
    path_cloning: &PathCloning,
) -> f64 {
    let mut total_icache_penalty = 0.0;
    let mut total_base_penalty = 0.0;
    for path_node in &path_cloning.path {
        let bb_size = cfg.node(path_node.node_bb_index()).size() as f64;
        if let Some(entry) = path_node
            .path_pred_info()
            .entry(path_cloning.path_pred_bb_index)
        {
            total_icache_penalty += entry.cache_pressure * bb_size;
        }
        total_base_penalty += bb_size;
    }
    total_icache_penalty * path_profile_options.icache_penalty_factor
        + total_base_penalty * path_profile_options.base_penalty_factor
}

/// Evaluates `path_cloning` against `cfg_builder`'s current state.
///
/// To make a fair comparison, the paths with missing predecessors are
/// dropped from both sides: the score gain is the optimized layout score
/// of the cloned CFG minus that of the CFG with only the drops applied,
/// minus the cloning penalty. Fails when the cloning conflicts with
/// applied clonings or its gain stays below `min_score`.
pub fn evaluate_cloning<'p>(
    cfg_builder: &CfgBuilder,
    path_cloning: &PathCloning<'p>,
    code_layout_params: &CodeLayoutParams,
    path_profile_options: &PathProfileOptions,
    min_score: f64,
    optimal_chain_info: &FunctionChainInfo,
    function_path_profile: &'p FunctionPathProfile,
) -> Result<EvaluatedPathCloning<'p>> {
    assert!(!code_layout_params.call_chain_clustering);
    assert!(!code_layout_params.inter_function_reordering);
    assert_eq!(
        optimal_chain_info.function_index,
        cfg_builder.cfg().function_index()
    );
    let new_cfg_change = CfgChangeBuilder::new(
        path_cloning,
        cfg_builder.conflict_edges(),
        function_path_profile,
    )
    .build()?;

    let function_index = cfg_builder.cfg().function_index();

    let mut builder_for_dropping = cfg_builder.fork();
    builder_for_dropping.add_cfg_change(&CfgChangeFromPathCloning {
        path_pred_bb_index: path_cloning.path_pred_bb_index,
        paths_to_drop: new_cfg_change.paths_to_drop.clone(),
        ..CfgChangeFromPathCloning::default()
    });
    let cfg_with_paths_dropped = builder_for_dropping.build();
    let paths_dropped_chain_info = CodeLayout::with_initial_chains(
        code_layout_params,
        vec![&cfg_with_paths_dropped],
        HashMap::from([(
            function_index,
            get_initial_chains(&cfg_with_paths_dropped, optimal_chain_info, &new_cfg_change),
        )]),
    )
    .order_all()
    .into_iter()
    .next()
    .expect("a profiled function always has a layout");

    let mut builder_for_cloning = cfg_builder.fork();
    builder_for_cloning.add_cfg_change(&new_cfg_change);
    let cfg_with_cloning = builder_for_cloning.build();
    let clone_chain_info = CodeLayout::with_initial_chains(
        code_layout_params,
        vec![&cfg_with_cloning],
        HashMap::from([(
            function_index,
            get_initial_chains(&cfg_with_cloning, optimal_chain_info, &new_cfg_change),
        )]),
    )
    .order_all()
    .into_iter()
    .next()
    .expect("a profiled function always has a layout");

    let score_gain = clone_chain_info.optimized_score.intra_score
        - paths_dropped_chain_info.optimized_score.intra_score
        - clone_penalty(cfg_builder.cfg(), path_profile_options, path_cloning);
    if score_gain < min_score {
        return Err(LayoutError::FailedPrecondition(format!(
            "Cloning is not acceptable with score gain: {score_gain:.3} < {min_score}"
        )));
    }
    Ok(EvaluatedPathCloning {
        path_cloning: path_cloning.clone(),
        score: Some(score_gain),
        cfg_change: new_cfg_change,
    })
}

/// Evaluates every cloning of one function's path-profile trees.
pub struct PathTreeCloneEvaluator<'a> {
    cfg: &'a ControlFlowGraph,
    optimal_chain_info: &'a FunctionChainInfo,
    path_profile_options: &'a PathProfileOptions,
    code_layout_params: &'a CodeLayoutParams,
}

impl<'a> PathTreeCloneEvaluator<'a> {
    pub fn new(
        cfg: &'a ControlFlowGraph,
        optimal_chain_info: &'a FunctionChainInfo,
        path_profile_options: &'a PathProfileOptions,
        code_layout_params: &'a CodeLayoutParams,
    ) -> PathTreeCloneEvaluator<'a> {
        PathTreeCloneEvaluator {
            cfg,
            optimal_chain_info,
            path_profile_options,
            code_layout_params,
        }
    }

    /// Depth-first evaluation of all clonings in the subtree rooted at
    /// `path_tree`. `path` holds the nodes from the tree root to
    /// `path_tree`'s parent; `path_preds_in_path` the candidate
    /// predecessors already seen on that path.
    pub fn evaluate_clonings_for_subtree<'p>(
        &self,
        path_tree: &'p PathNode,
        path: &mut Vec<&'p PathNode>,
        path_preds_in_path: &HashSet<usize>,
        clonings: &mut Vec<EvaluatedPathCloning<'p>>,
        function_path_profile: &'p FunctionPathProfile,
    ) {
        path.push(path_tree);
        if path.len() > self.path_profile_options.max_path_length {
            path.pop();
            return;
        }
        // No benefit when only one predecessor contributes to the subtree.
        if path_tree.path_pred_info().entries.len() < 2 {
            path.pop();
            return;
        }
        let has_indirect_branch = self.cfg.node(path_tree.node_bb_index()).has_indirect_branch();
        if has_indirect_branch && !self.path_profile_options.clone_indirect_branch_blocks {
            path.pop();
            return;
        }

        let mut updated_path_preds;
        let path_preds: &HashSet<usize> = if path_tree
            .path_pred_info()
            .entries
            .contains_key(&path_tree.node_bb_index())
        {
            updated_path_preds = path_preds_in_path.clone();
            updated_path_preds.insert(path_tree.node_bb_index());
            &updated_path_preds
        } else {
            path_preds_in_path
        };
        // Nothing left to gate the cloning on when every possible
        // predecessor already lies on the path.
        if path_tree.path_pred_info().entries.len() == path_preds.len() {
            path.pop();
            return;
        }

        self.evaluate_clonings_for_path(path, path_preds, clonings, function_path_profile);

        // Intermediate blocks with indirect branches cannot be rewired.
        if !has_indirect_branch {
            for child in path_tree.children().values() {
                self.evaluate_clonings_for_subtree(
                    child,
                    path,
                    path_preds,
                    clonings,
                    function_path_profile,
                );
            }
        }
        path.pop();
    }

    /// Evaluates the path ending at `path.last()` for every admissible
    /// path predecessor.
    fn evaluate_clonings_for_path<'p>(
        &self,
        path: &[&'p PathNode],
        path_preds_in_path: &HashSet<usize>,
        clonings: &mut Vec<EvaluatedPathCloning<'p>>,
        function_path_profile: &'p FunctionPathProfile,
    ) {
        let path_node = *path.last().expect("paths are never empty");
        let is_return_block = self.cfg.node(path_node.node_bb_index()).has_return();
        if path_node.children().len() < 2 && !is_return_block {
            return;
        }
        for (&pred_bb_index, entry) in &path_node.path_pred_info().entries {
            // A predecessor with an indirect branch cannot be rewired.
            if self.cfg.node(pred_bb_index).has_indirect_branch() {
                continue;
            }
            // A predecessor inside the cloned path would be double
            // counted.
            if path_preds_in_path.contains(&pred_bb_index) {
                continue;
            }
            if !is_return_block
                && (path_node.total_children_freq_for_path_pred(pred_bb_index) as f64)
                    < self.path_profile_options.min_flow_ratio * entry.freq as f64
            {
                continue;
            }
            let cloning = PathCloning {
                path: path.to_vec(),
                function_index: self.cfg.function_index(),
                path_pred_bb_index: pred_bb_index,
            };
            let evaluated = evaluate_cloning(
                &CfgBuilder::new(self.cfg),
                &cloning,
                self.code_layout_params,
                self.path_profile_options,
                self.path_profile_options.min_initial_cloning_score,
                self.optimal_chain_info,
                function_path_profile,
            );
            if let Ok(evaluated) = evaluated {
                clonings.push(evaluated);
            }
        }
    }
}

/// Evaluates all applicable and profitable clonings of the program,
/// returned per function index.
pub fn evaluate_all_clonings<'p>(
    program_cfg: &ProgramCfg,
    program_path_profile: &'p ProgramPathProfile,
    code_layout_params: &CodeLayoutParams,
    path_profile_options: &PathProfileOptions,
) -> BTreeMap<usize, Vec<EvaluatedPathCloning<'p>>> {
    assert!(!code_layout_params.call_chain_clustering);
    assert!(!code_layout_params.inter_function_reordering);
    log::info!("Evaluating clonings...");
    let mut clonings_by_function_index = BTreeMap::new();
    for (&function_index, function_path_profile) in
        program_path_profile.path_profiles_by_function_index()
    {
        let cfg = program_cfg
            .cfg_by_index(function_index)
            .expect("path profiles refer to existing functions");
        let optimal_chain_info = CodeLayout::new(code_layout_params, vec![cfg])
            .order_all()
            .into_iter()
            .next()
            .expect("a profiled function always has a layout");
        let clonings: &mut Vec<EvaluatedPathCloning> = clonings_by_function_index
            .entry(function_index)
            .or_default();
        let evaluator = PathTreeCloneEvaluator::new(
            cfg,
            &optimal_chain_info,
            path_profile_options,
            code_layout_params,
        );
        for path_tree in function_path_profile.path_trees_by_root_bb_index().values() {
            evaluator.evaluate_clonings_for_subtree(
                path_tree,
                &mut Vec::new(),
                &HashSet::new(),
                clonings,
                function_path_profile,
            );
        }
    }
    clonings_by_function_index
}
