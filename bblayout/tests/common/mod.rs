// SPDX-FileCopyrightText: 2025 The bblayout developers
// SPDX-License-Identifier: LGPL-3.0-only

//! Shared fixtures for the integration tests, built through the public
//! API.

use smallvec::smallvec;

use std::collections::BTreeMap;

use bblayout::cfg::{CfgEdgeKind, CfgNode, ControlFlowGraph, NodeFlags, NodeRef};
use bblayout::path_profile::{
    CallRetInfo, FunctionPathProfile, PathNode, PathPredInfo, PathPredInfoEntry,
    ProgramPathProfile,
};
use bblayout::program_cfg::{create_inter_edge, ProgramCfg};

fn build_cfg(
    function_index: usize,
    name: &str,
    nodes: &[(u64, usize, u64, NodeFlags)],
    branches: &[(usize, usize, i64)],
) -> ControlFlowGraph {
    let nodes = nodes
        .iter()
        .map(|&(addr, bb_index, size, flags)| {
            CfgNode::new(addr, bb_index, bb_index, size, flags, function_index)
        })
        .collect();
    let mut cfg = ControlFlowGraph::new(
        ".text",
        function_index,
        None,
        smallvec![name.to_string()],
        nodes,
    );
    for &(src, sink, weight) in branches {
        cfg.create_intra_edge(src, sink, weight, CfgEdgeKind::BranchOrFallthrough);
    }
    cfg
}

/// The cloning program: `foo` with a diamond over blocks 3..5 calling
/// `bar` and `baz` from block 4.
pub fn cloning_program() -> ProgramCfg {
    let ft = NodeFlags::CAN_FALLTHROUGH;
    let mut cfgs = BTreeMap::new();
    cfgs.insert(
        6,
        build_cfg(
            6,
            "foo",
            &[
                (0x1000, 0, 0x10, ft),
                (0x1010, 1, 0x7, NodeFlags::HAS_INDIRECT_BRANCH),
                (0x102a, 2, 0x4, ft),
                (0x1030, 3, 0x8, ft),
                (0x1038, 4, 0x20, ft),
                (0x1060, 5, 0x6, NodeFlags::HAS_RETURN),
            ],
            &[
                (0, 1, 181),
                (0, 2, 660),
                (1, 3, 196),
                (2, 3, 656),
                (2, 4, 10),
                (3, 1, 10),
                (3, 4, 175),
                (3, 5, 690),
                (4, 5, 185),
            ],
        ),
    );
    cfgs.insert(
        7,
        build_cfg(
            7,
            "bar",
            &[(0x2000, 0, 0x20, ft), (0x2020, 1, 0x12, NodeFlags::HAS_RETURN)],
            &[(0, 1, 90)],
        ),
    );
    cfgs.insert(
        8,
        build_cfg(
            8,
            "baz",
            &[(0x3000, 0, 0x30, ft), (0x3030, 1, 0x13, NodeFlags::HAS_RETURN)],
            &[(0, 1, 85)],
        ),
    );
    let inter_edges = [
        (6, 4, 7, 0, 90, CfgEdgeKind::Call),
        (7, 1, 6, 4, 90, CfgEdgeKind::Return),
        (6, 4, 8, 0, 85, CfgEdgeKind::Call),
        (8, 1, 6, 4, 85, CfgEdgeKind::Return),
    ];
    for (src_function, src_bb, sink_function, sink_bb, weight, kind) in inter_edges {
        create_inter_edge(
            &mut cfgs,
            NodeRef {
                function_index: src_function,
                node_index: src_bb,
            },
            NodeRef {
                function_index: sink_function,
                node_index: sink_bb,
            },
            weight,
            kind,
        );
    }
    ProgramCfg::new(cfgs)
}

fn entry(freq: i64) -> PathPredInfoEntry {
    PathPredInfoEntry {
        freq,
        ..PathPredInfoEntry::default()
    }
}

fn entry_with_calls(freq: i64, cache_pressure: f64, calls: &[(usize, i64)]) -> PathPredInfoEntry {
    PathPredInfoEntry {
        freq,
        cache_pressure,
        call_freqs: calls
            .iter()
            .map(|&(callee, weight)| {
                (
                    CallRetInfo {
                        callee: Some(callee),
                        return_bb: None,
                    },
                    weight,
                )
            })
            .collect(),
        ..PathPredInfoEntry::default()
    }
}

fn pred_info(
    entries: Vec<(usize, PathPredInfoEntry)>,
    missing_pred_entry: PathPredInfoEntry,
) -> PathPredInfo {
    PathPredInfo {
        entries: entries.into_iter().collect(),
        missing_pred_entry,
    }
}

/// The path profile matching [`cloning_program`]: hot paths rooted at
/// blocks 3 and 4 of `foo`, with per-predecessor flow and call records.
pub fn cloning_profile() -> ProgramPathProfile {
    let mut tree_3 = PathNode::new(
        3,
        pred_info(vec![(1, entry(195)), (2, entry(656))], entry(38)),
    );
    let node_3_4 = tree_3.add_child(PathNode::new(
        4,
        pred_info(
            vec![
                (1, entry_with_calls(160, 7.2, &[(7, 80), (8, 80)])),
                (2, entry_with_calls(4, 6.2, &[(7, 4), (8, 0)])),
            ],
            entry_with_calls(9, 0.0, &[(7, 4), (8, 5)]),
        ),
    ));
    node_3_4.add_child(PathNode::new(
        5,
        pred_info(vec![(1, entry(160)), (2, entry(4))], entry(9)),
    ));
    tree_3.add_child(PathNode::new(
        5,
        pred_info(vec![(1, entry(13)), (2, entry(649))], entry(28)),
    ));
    tree_3.add_child(PathNode::new(
        1,
        pred_info(vec![(1, entry(9))], entry(1)),
    ));

    let mut tree_4 = PathNode::new(
        4,
        pred_info(
            vec![
                (2, entry_with_calls(10, 8.2, &[(7, 10), (8, 0)])),
                (3, entry_with_calls(173, 9.2, &[(7, 89), (8, 84)])),
            ],
            entry_with_calls(2, 0.0, &[(7, 1), (8, 1)]),
        ),
    );
    tree_4.add_child(PathNode::new(
        5,
        pred_info(vec![(2, entry(10)), (3, entry(173))], entry(2)),
    ));

    let trees = BTreeMap::from([(3, tree_3), (4, tree_4)]);
    ProgramPathProfile::new(BTreeMap::from([(
        6,
        FunctionPathProfile::new(6, trees),
    )]))
}
