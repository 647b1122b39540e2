// SPDX-FileCopyrightText: 2025 The bblayout developers
// SPDX-License-Identifier: LGPL-3.0-only

use std::collections::BTreeMap;

use crate::cfg::{clone_cfg, CfgEdgeKind, ControlFlowGraph, EdgeLoc, IntraCfgId, NodeRef};
use crate::cfg_change::{CfgBuilder, CfgChangeFromPathCloning, PathDropInfo};
use crate::code_layout::CodeLayout;
use crate::config::{CodeLayoutParams, PathProfileOptions};
use crate::path_clone::{evaluate_all_clonings, evaluate_cloning, EvaluatedPathCloning};
use crate::program_cfg::{create_or_update_inter_edge, CfgRefs, ProgramCfg};
use crate::stats::CloningStats;

/// Result of applying clonings: the rewritten CFGs and the total layout
/// score gain.
pub struct CloneApplicatorResult {
    pub clone_cfgs_by_function_index: BTreeMap<usize, ControlFlowGraph>,
    pub total_score_gain: f64,
}

/// Finds the edge from `src` to `sink` of `kind` within `cfgs`, whether
/// it lives in an intra or inter arena.
fn edge_between(
    cfgs: &BTreeMap<usize, ControlFlowGraph>,
    src: NodeRef,
    sink: NodeRef,
    kind: CfgEdgeKind,
) -> Option<EdgeLoc> {
    if src.function_index == sink.function_index {
        let cfg = cfgs.get(&src.function_index)?;
        return cfg
            .intra_edge_to(src.node_index, sink.node_index, kind)
            .map(|edge_index| EdgeLoc {
                function_index: src.function_index,
                inter: false,
                edge_index,
            });
    }
    crate::program_cfg::inter_edge_to(cfgs, src, sink, kind).map(|r| EdgeLoc {
        function_index: r.function_index,
        inter: true,
        edge_index: r.edge_index,
    })
}

fn decrement_edge(cfgs: &mut BTreeMap<usize, ControlFlowGraph>, loc: EdgeLoc, value: i64) -> i64 {
    let cfg = cfgs.get_mut(&loc.function_index).expect("edge owner exists");
    if loc.inter {
        cfg.inter_edge_mut(loc.edge_index).decrement_weight(value)
    } else {
        cfg.intra_edge_mut(loc.edge_index).decrement_weight(value)
    }
}

/// Creates or updates the edge from `src` to `sink`, routing to the intra
/// or inter arena as required.
fn create_or_update_edge(
    cfgs: &mut BTreeMap<usize, ControlFlowGraph>,
    src: NodeRef,
    sink: NodeRef,
    weight: i64,
    kind: CfgEdgeKind,
) {
    if src.function_index == sink.function_index {
        cfgs.get_mut(&src.function_index)
            .expect("edge owner exists")
            .create_or_update_intra_edge(src.node_index, sink.node_index, weight, kind);
    } else {
        create_or_update_inter_edge(cfgs, src, sink, weight, kind);
    }
}

/// All instances (original and clones) of `bb_index` in the given
/// function, sorted by decreasing frequency, ties on intra-cfg id. Edge
/// weights may already have been distributed among clone instances, so
/// heavier instances are consumed first.
fn instances_by_frequency(
    cfgs: &BTreeMap<usize, ControlFlowGraph>,
    function_index: usize,
    bb_index: usize,
) -> Vec<NodeRef> {
    let cfg = &cfgs[&function_index];
    let mut instances: Vec<NodeRef> = cfg
        .all_clones_for_bb_index(bb_index)
        .into_iter()
        .map(|node_index| NodeRef {
            function_index,
            node_index,
        })
        .collect();
    let view = CfgRefs::new(cfgs.values());
    instances.sort_by_key(|&node_ref| {
        (
            -view.node_frequency(node_ref),
            view.node(node_ref).intra_cfg_id(),
        )
    });
    instances
}

/// Mirrors the original inter-function edges into the clone CFGs, applies
/// the planned inter-function reroutes and drops the missing-predecessor
/// call and return weights.
fn create_inter_function_edges(
    program_cfg: &ProgramCfg,
    cfg_changes_by_function_index: &BTreeMap<usize, Vec<CfgChangeFromPathCloning>>,
    clone_cfgs: &mut BTreeMap<usize, ControlFlowGraph>,
) {
    for cfg in program_cfg.cfgs() {
        for edge_index in 0..cfg.inter_edges().len() {
            let edge = cfg.inter_edge(edge_index);
            let src_cfg = &clone_cfgs[&edge.src().function_index];
            let sink_cfg = &clone_cfgs[&edge.sink().function_index];
            let src = NodeRef {
                function_index: edge.src().function_index,
                node_index: src_cfg
                    .node_index_by_id(cfg.node(edge.src().node_index).intra_cfg_id()),
            };
            let sink_node = program_cfg
                .cfg_by_index(edge.sink().function_index)
                .expect("inter edges stay within the program")
                .node(edge.sink().node_index);
            let sink = NodeRef {
                function_index: edge.sink().function_index,
                node_index: sink_cfg.node_index_by_id(sink_node.intra_cfg_id()),
            };
            crate::program_cfg::create_inter_edge(clone_cfgs, src, sink, edge.weight(), edge.kind());
        }
    }

    for (&function_index, function_cfg_changes) in cfg_changes_by_function_index {
        // Tracks the clone instance each change's reroutes refer to, in
        // the order the clonings were applied.
        let mut current_clone_numbers: BTreeMap<usize, usize> = BTreeMap::new();
        for cfg_change in function_cfg_changes {
            for reroute in &cfg_change.inter_edge_reroutes {
                let mut weight_remainder = reroute.weight;
                if reroute.src_is_cloned {
                    assert_eq!(reroute.src_function_index, function_index);
                    // A call or return out of this function: reduce the
                    // weight of the edges from the original source to all
                    // instances of the sink, heaviest sink first.
                    let orig_src = NodeRef {
                        function_index,
                        node_index: reroute.src_bb_index,
                    };
                    let all_sinks = instances_by_frequency(
                        clone_cfgs,
                        reroute.sink_function_index,
                        reroute.sink_bb_index,
                    );
                    for &sink in &all_sinks {
                        let Some(loc) = edge_between(clone_cfgs, orig_src, sink, reroute.kind)
                        else {
                            continue;
                        };
                        weight_remainder -= decrement_edge(clone_cfgs, loc, weight_remainder);
                        if weight_remainder <= 0 {
                            break;
                        }
                    }
                    let clone_number = current_clone_numbers
                        .get(&reroute.src_bb_index)
                        .copied()
                        .unwrap_or(0)
                        + 1;
                    let clone_src = NodeRef {
                        function_index,
                        node_index: clone_cfgs[&function_index].node_index_by_id(IntraCfgId {
                            bb_index: reroute.src_bb_index,
                            clone_number,
                        }),
                    };
                    create_or_update_edge(
                        clone_cfgs,
                        clone_src,
                        all_sinks[0],
                        reroute.weight,
                        reroute.kind,
                    );
                } else {
                    // A return from another function into a cloned block.
                    assert!(reroute.sink_is_cloned);
                    assert_eq!(reroute.sink_function_index, function_index);
                    assert_eq!(reroute.kind, CfgEdgeKind::Return);
                    let orig_sink = NodeRef {
                        function_index,
                        node_index: reroute.sink_bb_index,
                    };
                    let all_srcs = instances_by_frequency(
                        clone_cfgs,
                        reroute.src_function_index,
                        reroute.src_bb_index,
                    );
                    for &src in &all_srcs {
                        let Some(loc) = edge_between(clone_cfgs, src, orig_sink, reroute.kind)
                        else {
                            continue;
                        };
                        weight_remainder -= decrement_edge(clone_cfgs, loc, weight_remainder);
                        if weight_remainder <= 0 {
                            break;
                        }
                    }
                    let clone_number = current_clone_numbers
                        .get(&reroute.sink_bb_index)
                        .copied()
                        .unwrap_or(0)
                        + 1;
                    let clone_sink = NodeRef {
                        function_index,
                        node_index: clone_cfgs[&function_index].node_index_by_id(IntraCfgId {
                            bb_index: reroute.sink_bb_index,
                            clone_number,
                        }),
                    };
                    create_or_update_edge(
                        clone_cfgs,
                        all_srcs[0],
                        clone_sink,
                        reroute.weight,
                        reroute.kind,
                    );
                }
            }
            for &bb_index in &cfg_change.path_to_clone {
                *current_clone_numbers.entry(bb_index).or_insert(0) += 1;
            }
        }
    }

    for (&function_index, function_cfg_changes) in cfg_changes_by_function_index {
        for cfg_change in function_cfg_changes {
            for path_drop in &cfg_change.paths_to_drop {
                drop_inter_function_edges(clone_cfgs, function_index, path_drop);
            }
        }
    }
}

/// Subtracts the missing-predecessor call and return-to weights of one
/// dropped path node. A planned reroute may reference an edge the source
/// CFG never had; such cases are logged and skipped.
fn drop_inter_function_edges(
    clone_cfgs: &mut BTreeMap<usize, ControlFlowGraph>,
    function_index: usize,
    path_drop: &PathDropInfo,
) {
    let src = NodeRef {
        function_index,
        node_index: path_drop.node_bb_index,
    };
    for (&call_ret, &freq) in &path_drop.missing_pred_entry.call_freqs {
        if let Some(callee) = call_ret.callee {
            let callee_entry = NodeRef {
                function_index: callee,
                node_index: 0,
            };
            match edge_between(clone_cfgs, src, callee_entry, CfgEdgeKind::Call) {
                Some(loc) => {
                    decrement_edge(clone_cfgs, loc, freq);
                }
                None => {
                    log::warn!(
                        "No call edge from block {}#{} to function {}",
                        clone_cfgs[&function_index].primary_name(),
                        clone_cfgs[&function_index].node(src.node_index).bb_id(),
                        clone_cfgs[&callee].primary_name()
                    );
                    continue;
                }
            }
            if let Some(return_bb) = call_ret.return_bb {
                let return_from = NodeRef {
                    function_index: return_bb.function_index,
                    node_index: return_bb.flat_bb_index,
                };
                match edge_between(clone_cfgs, return_from, src, CfgEdgeKind::Return) {
                    Some(loc) => {
                        decrement_edge(clone_cfgs, loc, freq);
                    }
                    None => log::warn!(
                        "No return edge from block {}#{} to block {}#{}",
                        clone_cfgs[&return_bb.function_index].primary_name(),
                        clone_cfgs[&return_bb.function_index]
                            .node(return_from.node_index)
                            .bb_id(),
                        clone_cfgs[&function_index].primary_name(),
                        clone_cfgs[&function_index].node(src.node_index).bb_id()
                    ),
                }
            }
        }
    }
    for (&bb_handle, &freq) in &path_drop.missing_pred_entry.return_to_freqs {
        let return_to = NodeRef {
            function_index: bb_handle.function_index,
            node_index: bb_handle.flat_bb_index,
        };
        match edge_between(clone_cfgs, src, return_to, CfgEdgeKind::Return) {
            Some(loc) => {
                decrement_edge(clone_cfgs, loc, freq);
            }
            None => log::warn!(
                "No return edge from block {}#{} to block {}#{}",
                clone_cfgs[&function_index].primary_name(),
                clone_cfgs[&function_index].node(src.node_index).bb_id(),
                clone_cfgs[&bb_handle.function_index].primary_name(),
                clone_cfgs[&bb_handle.function_index]
                    .node(return_to.node_index)
                    .bb_id()
            ),
        }
    }
}

/// Applies the profitable clonings in `clonings_by_function_index` to
/// copies of the CFGs in `program_cfg`.
pub fn apply_clonings_to_cfgs(
    code_layout_params: &CodeLayoutParams,
    path_profile_options: &PathProfileOptions,
    mut clonings_by_function_index: BTreeMap<usize, Vec<EvaluatedPathCloning>>,
    program_cfg: &ProgramCfg,
    path_profiles_by_function_index: &BTreeMap<usize, crate::path_profile::FunctionPathProfile>,
) -> CloneApplicatorResult {
    let mut total_score_gain = 0.0;
    log::info!("Applying clonings...");
    let mut clone_cfgs_by_function_index: BTreeMap<usize, ControlFlowGraph> = BTreeMap::new();
    let mut cfg_changes_by_function_index: BTreeMap<usize, Vec<CfgChangeFromPathCloning>> =
        BTreeMap::new();

    for (function_index, clonings) in clonings_by_function_index.iter_mut() {
        // Apply clonings in decreasing order of their scores; unevaluated
        // ones go last and are always re-evaluated.
        clonings.sort_by(|a, b| {
            let score_a = a.score.unwrap_or(f64::NEG_INFINITY);
            let score_b = b.score.unwrap_or(f64::NEG_INFINITY);
            score_b
                .total_cmp(&score_a)
                .then_with(|| a.path_cloning.sort_key().cmp(&b.path_cloning.sort_key()))
        });
        let function_path_profile = &path_profiles_by_function_index[function_index];
        let cfg = program_cfg
            .cfg_by_index(*function_index)
            .expect("clonings refer to existing functions");
        let mut cfg_builder = CfgBuilder::new(cfg);
        let mut optimal_chain_info = None;
        let current_cfg_changes = cfg_changes_by_function_index
            .entry(*function_index)
            .or_default();

        for cloning in clonings.drain(..) {
            // Once any cloning has been applied both the CFG and the
            // scores may have changed, so re-evaluate.
            if !cfg_builder.cfg_changes().is_empty() || cloning.score.is_none() {
                if optimal_chain_info.is_none() {
                    optimal_chain_info = Some(
                        CodeLayout::new(code_layout_params, vec![&cfg_builder.fork().build()])
                            .order_all()
                            .into_iter()
                            .next()
                            .expect("a profiled function always has a layout"),
                    );
                }
                let Ok(evaluated) = evaluate_cloning(
                    &cfg_builder,
                    &cloning.path_cloning,
                    code_layout_params,
                    path_profile_options,
                    path_profile_options.min_final_cloning_score,
                    optimal_chain_info.as_ref().unwrap(),
                    function_path_profile,
                ) else {
                    continue;
                };
                total_score_gain += evaluated.score.expect("evaluation always scores");
                cfg_builder.add_cfg_change(&evaluated.cfg_change);
                current_cfg_changes.push(evaluated.cfg_change);
                optimal_chain_info = None;
            } else if cloning.score.unwrap() < path_profile_options.min_final_cloning_score {
                // The remaining clonings have even lower scores.
                break;
            } else {
                total_score_gain += cloning.score.unwrap();
                cfg_builder.add_cfg_change(&cloning.cfg_change);
                current_cfg_changes.push(cloning.cfg_change);
                optimal_chain_info = None;
            }
        }
        if cfg_builder.cfg_changes().is_empty() {
            continue;
        }
        clone_cfgs_by_function_index.insert(*function_index, cfg_builder.build());
    }
    cfg_changes_by_function_index.retain(|_, changes| !changes.is_empty());

    // The remaining CFGs are copied unchanged so the inter-function edges
    // can be recreated over the whole program.
    for cfg in program_cfg.cfgs() {
        clone_cfgs_by_function_index
            .entry(cfg.function_index())
            .or_insert_with(|| clone_cfg(cfg));
    }
    create_inter_function_edges(
        program_cfg,
        &cfg_changes_by_function_index,
        &mut clone_cfgs_by_function_index,
    );
    CloneApplicatorResult {
        clone_cfgs_by_function_index,
        total_score_gain,
    }
}

/// Applies profitable path clonings to `program_cfg` and returns the
/// rewritten program along with cloning statistics. Evaluation runs with
/// clustering, inter-function reordering and chain splitting disabled to
/// keep it cheap.
pub fn apply_clonings(
    code_layout_params: &CodeLayoutParams,
    path_profile_options: &PathProfileOptions,
    program_path_profile: &crate::path_profile::ProgramPathProfile,
    program_cfg: ProgramCfg,
) -> (ProgramCfg, CloningStats) {
    let mut fast_code_layout_params = code_layout_params.clone();
    fast_code_layout_params.call_chain_clustering = false;
    fast_code_layout_params.inter_function_reordering = false;
    fast_code_layout_params.chain_split = false;

    let clonings_by_function_index = evaluate_all_clonings(
        &program_cfg,
        program_path_profile,
        &fast_code_layout_params,
        path_profile_options,
    );

    let result = apply_clonings_to_cfgs(
        &fast_code_layout_params,
        path_profile_options,
        clonings_by_function_index,
        &program_cfg,
        program_path_profile.path_profiles_by_function_index(),
    );

    let mut cloning_stats = CloningStats {
        score_gain: result.total_score_gain,
        ..CloningStats::default()
    };
    for clone_cfg in result.clone_cfgs_by_function_index.values() {
        cloning_stats.paths_cloned += clone_cfg.clone_paths().len();
        for (bb_index, clones) in clone_cfg.clones_by_bb_index().iter() {
            cloning_stats.bbs_cloned += clones.len();
            cloning_stats.bytes_cloned += clone_cfg.node(*bb_index).size() * clones.len() as u64;
        }
    }
    (
        ProgramCfg::new(result.clone_cfgs_by_function_index),
        cloning_stats,
    )
}
