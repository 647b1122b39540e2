// SPDX-FileCopyrightText: 2025 The bblayout developers
// SPDX-License-Identifier: LGPL-3.0-only

//! Utilities for building CFGs and path profiles in tests.

use smallvec::smallvec;

use std::collections::BTreeMap;

use crate::cfg::{Address, CfgEdgeKind, CfgNode, ControlFlowGraph, NodeFlags, NodeRef};
use crate::path_profile::{
    CallRetInfo, FunctionPathProfile, PathNode, PathPredInfo, PathPredInfoEntry,
    ProgramPathProfile,
};
use crate::program_cfg::{create_inter_edge, ProgramCfg};

#[derive(Clone, Copy, Debug)]
pub struct NodeArg {
    pub addr: Address,
    pub bb_index: usize,
    pub size: u64,
    pub flags: NodeFlags,
}

#[derive(Clone, Copy, Debug)]
pub struct IntraEdgeArg {
    pub from_bb_index: usize,
    pub to_bb_index: usize,
    pub weight: i64,
    pub kind: CfgEdgeKind,
}

#[derive(Clone, Copy, Debug)]
pub struct InterEdgeArg {
    pub from_function_index: usize,
    pub from_bb_index: usize,
    pub to_function_index: usize,
    pub to_bb_index: usize,
    pub weight: i64,
    pub kind: CfgEdgeKind,
}

#[derive(Clone, Debug)]
pub struct CfgArg {
    pub section_name: &'static str,
    pub function_index: usize,
    pub function_name: &'static str,
    pub node_args: Vec<NodeArg>,
    pub edge_args: Vec<IntraEdgeArg>,
}

#[derive(Clone, Debug, Default)]
pub struct MultiCfgArg {
    pub cfg_args: Vec<CfgArg>,
    pub inter_edge_args: Vec<InterEdgeArg>,
}

pub fn node(addr: Address, bb_index: usize, size: u64) -> NodeArg {
    NodeArg {
        addr,
        bb_index,
        size,
        flags: NodeFlags::CAN_FALLTHROUGH,
    }
}

pub fn node_with_flags(addr: Address, bb_index: usize, size: u64, flags: NodeFlags) -> NodeArg {
    NodeArg {
        addr,
        bb_index,
        size,
        flags,
    }
}

pub fn branch(from_bb_index: usize, to_bb_index: usize, weight: i64) -> IntraEdgeArg {
    IntraEdgeArg {
        from_bb_index,
        to_bb_index,
        weight,
        kind: CfgEdgeKind::BranchOrFallthrough,
    }
}

/// Builds a `ProgramCfg` from the given argument.
pub fn build_from_cfg_arg(multi_cfg_arg: MultiCfgArg) -> ProgramCfg {
    let mut cfgs = BTreeMap::new();
    for cfg_arg in multi_cfg_arg.cfg_args {
        let nodes: Vec<CfgNode> = cfg_arg
            .node_args
            .iter()
            .map(|arg| {
                CfgNode::new(
                    arg.addr,
                    arg.bb_index,
                    arg.bb_index,
                    arg.size,
                    arg.flags,
                    cfg_arg.function_index,
                )
            })
            .collect();
        let mut cfg = ControlFlowGraph::new(
            cfg_arg.section_name,
            cfg_arg.function_index,
            None,
            smallvec![cfg_arg.function_name.to_string()],
            nodes,
        );
        for edge_arg in &cfg_arg.edge_args {
            cfg.create_intra_edge(
                edge_arg.from_bb_index,
                edge_arg.to_bb_index,
                edge_arg.weight,
                edge_arg.kind,
            );
        }
        cfgs.insert(cfg_arg.function_index, cfg);
    }
    for edge_arg in multi_cfg_arg.inter_edge_args {
        create_inter_edge(
            &mut cfgs,
            NodeRef {
                function_index: edge_arg.from_function_index,
                node_index: edge_arg.from_bb_index,
            },
            NodeRef {
                function_index: edge_arg.to_function_index,
                node_index: edge_arg.to_bb_index,
            },
            edge_arg.weight,
            edge_arg.kind,
        );
    }
    ProgramCfg::new(cfgs)
}

#[derive(Clone, Debug, Default)]
pub struct PathNodeArg {
    pub node_bb_index: usize,
    pub path_pred_info: PathPredInfo,
    pub children: Vec<PathNodeArg>,
}

fn build_path_node(arg: PathNodeArg) -> PathNode {
    let mut path_node = PathNode::new(arg.node_bb_index, arg.path_pred_info);
    for child in arg.children {
        path_node.add_child(build_path_node(child));
    }
    path_node
}

#[derive(Clone, Debug, Default)]
pub struct FunctionPathProfileArg {
    pub function_index: usize,
    pub path_node_args: Vec<PathNodeArg>,
}

pub fn build_path_profile(args: Vec<FunctionPathProfileArg>) -> ProgramPathProfile {
    let mut profiles = BTreeMap::new();
    for arg in args {
        let mut trees = BTreeMap::new();
        for path_node_arg in arg.path_node_args {
            let tree = build_path_node(path_node_arg);
            trees.insert(tree.node_bb_index(), tree);
        }
        profiles.insert(
            arg.function_index,
            FunctionPathProfile::new(arg.function_index, trees),
        );
    }
    ProgramPathProfile::new(profiles)
}

pub fn pred_entry(freq: i64) -> PathPredInfoEntry {
    PathPredInfoEntry {
        freq,
        ..PathPredInfoEntry::default()
    }
}

pub fn pred_entry_with_calls(freq: i64, call_freqs: Vec<(CallRetInfo, i64)>) -> PathPredInfoEntry {
    PathPredInfoEntry {
        freq,
        call_freqs: call_freqs.into_iter().collect(),
        ..PathPredInfoEntry::default()
    }
}

pub fn pred_entries(entries: Vec<(usize, PathPredInfoEntry)>) -> BTreeMap<usize, PathPredInfoEntry> {
    entries.into_iter().collect()
}

pub fn call_to(callee: usize) -> CallRetInfo {
    CallRetInfo {
        callee: Some(callee),
        return_bb: None,
    }
}

/// A single function whose entry run branches into two tails, plus a hot
/// pair (2, 3) whose entering flow was not profiled. The edges 0 -> 1 and
/// 2 -> 3 are mutually forced.
///
/// ```text
///    0 --660--> 1 --186--> 4
///               1 ---10--> 5
///    2 --656--> 3
/// ```
pub fn three_branches_arg() -> MultiCfgArg {
    MultiCfgArg {
        cfg_args: vec![CfgArg {
            section_name: ".text",
            function_index: 0,
            function_name: "foo",
            node_args: vec![
                node(0x1000, 0, 0x10),
                node(0x1010, 1, 7),
                node(0x1017, 2, 40),
                node(0x103f, 3, 8),
                node(0x1047, 4, 32),
                node(0x1067, 5, 6),
            ],
            edge_args: vec![
                branch(0, 1, 660),
                branch(1, 4, 186),
                branch(1, 5, 10),
                branch(2, 3, 656),
            ],
        }],
        inter_edge_args: vec![],
    }
}

/// A function whose only profiled flow is a two-block loop with no
/// profiled entry or exit.
pub fn loop_no_entry_no_exit_arg() -> MultiCfgArg {
    MultiCfgArg {
        cfg_args: vec![CfgArg {
            section_name: ".text",
            function_index: 0,
            function_name: "foo",
            node_args: vec![
                node(0x1000, 0, 0x10),
                node(0x1010, 1, 0x10),
                node(0x1020, 2, 0x10),
                node(0x1030, 3, 0x10),
            ],
            edge_args: vec![branch(1, 2, 100), branch(2, 1, 100)],
        }],
        inter_edge_args: vec![],
    }
}

/// Two conditionals joining in one block; used to exercise chain merging
/// step by step.
pub fn conditionals_join_arg() -> MultiCfgArg {
    MultiCfgArg {
        cfg_args: vec![CfgArg {
            section_name: ".text",
            function_index: 10,
            function_name: "foo",
            node_args: vec![
                node(0x1000, 0, 0x10),
                node(0x1010, 1, 0x10),
                node(0x1020, 2, 0x10),
                node(0x1030, 3, 0x10),
                node(0x1040, 4, 0x10),
            ],
            edge_args: vec![
                branch(0, 1, 110),
                branch(0, 2, 150),
                branch(1, 2, 100),
                branch(1, 3, 10),
                branch(2, 4, 250),
                branch(3, 4, 10),
            ],
        }],
        inter_edge_args: vec![],
    }
}

/// Four functions where `bar` is the dominant caller of `foo` and `qux`
/// is hot but isolated; `baz` is entirely cold.
pub fn multi_function_arg() -> MultiCfgArg {
    MultiCfgArg {
        cfg_args: vec![
            CfgArg {
                section_name: ".text",
                function_index: 0,
                function_name: "foo",
                node_args: vec![node(0x1000, 0, 0x10), node(0x1010, 1, 0x10)],
                edge_args: vec![branch(0, 1, 100)],
            },
            CfgArg {
                section_name: ".text",
                function_index: 1,
                function_name: "bar",
                node_args: vec![node(0x2000, 0, 0x20), node(0x2020, 1, 0x10)],
                edge_args: vec![branch(0, 1, 95)],
            },
            CfgArg {
                section_name: ".text",
                function_index: 2,
                function_name: "baz",
                node_args: vec![node(0x3000, 0, 0x20), node(0x3020, 1, 0x10)],
                edge_args: vec![],
            },
            CfgArg {
                section_name: ".text",
                function_index: 100,
                function_name: "qux",
                node_args: vec![node(0x4000, 0, 0x10), node(0x4010, 1, 0x10)],
                edge_args: vec![branch(0, 1, 500)],
            },
        ],
        inter_edge_args: vec![
            InterEdgeArg {
                from_function_index: 1,
                from_bb_index: 1,
                to_function_index: 0,
                to_bb_index: 0,
                weight: 100,
                kind: CfgEdgeKind::Call,
            },
            InterEdgeArg {
                from_function_index: 0,
                from_bb_index: 1,
                to_function_index: 1,
                to_bb_index: 1,
                weight: 100,
                kind: CfgEdgeKind::Return,
            },
        ],
    }
}

/// A function with one hot and one cold landing pad: block 2 is an
/// exception handler with profiled flow, block 3 one without.
pub fn landing_pads_arg() -> MultiCfgArg {
    MultiCfgArg {
        cfg_args: vec![CfgArg {
            section_name: ".text",
            function_index: 0,
            function_name: "foo",
            node_args: vec![
                node(0x1000, 0, 0x10),
                node(0x1010, 1, 0x10),
                node_with_flags(
                    0x1020,
                    2,
                    0x10,
                    NodeFlags::LANDING_PAD | NodeFlags::CAN_FALLTHROUGH,
                ),
                node_with_flags(0x1030, 3, 0x10, NodeFlags::LANDING_PAD),
                node(0x1040, 4, 0x10),
                node(0x1050, 5, 0x10),
            ],
            edge_args: vec![
                branch(0, 1, 100),
                branch(1, 2, 50),
                branch(1, 4, 50),
                branch(2, 4, 50),
                branch(4, 5, 100),
            ],
        }],
        inter_edge_args: vec![],
    }
}

/// The default program for cloning tests: `foo` with a diamond over
/// blocks 3..5 calling `bar` and `baz` from block 4.
pub fn cloning_program_arg() -> MultiCfgArg {
    MultiCfgArg {
        cfg_args: vec![
            CfgArg {
                section_name: ".text",
                function_index: 6,
                function_name: "foo",
                node_args: vec![
                    node(0x1000, 0, 0x10),
                    node_with_flags(0x1010, 1, 0x7, NodeFlags::HAS_INDIRECT_BRANCH),
                    node(0x102a, 2, 0x4),
                    node(0x1030, 3, 0x8),
                    node(0x1038, 4, 0x20),
                    node_with_flags(0x1060, 5, 0x6, NodeFlags::HAS_RETURN),
                ],
                edge_args: vec![
                    branch(0, 1, 181),
                    branch(0, 2, 660),
                    branch(1, 3, 196),
                    branch(2, 3, 656),
                    branch(2, 4, 10),
                    branch(3, 1, 10),
                    branch(3, 4, 175),
                    branch(3, 5, 690),
                    branch(4, 5, 185),
                ],
            },
            CfgArg {
                section_name: ".text",
                function_index: 7,
                function_name: "bar",
                node_args: vec![
                    node(0x2000, 0, 0x20),
                    node_with_flags(0x2020, 1, 0x12, NodeFlags::HAS_RETURN),
                ],
                edge_args: vec![branch(0, 1, 90)],
            },
            CfgArg {
                section_name: ".text",
                function_index: 8,
                function_name: "baz",
                node_args: vec![
                    node(0x3000, 0, 0x30),
                    node_with_flags(0x3030, 1, 0x13, NodeFlags::HAS_RETURN),
                ],
                edge_args: vec![branch(0, 1, 85)],
            },
        ],
        inter_edge_args: vec![
            InterEdgeArg {
                from_function_index: 6,
                from_bb_index: 4,
                to_function_index: 7,
                to_bb_index: 0,
                weight: 90,
                kind: CfgEdgeKind::Call,
            },
            InterEdgeArg {
                from_function_index: 7,
                from_bb_index: 1,
                to_function_index: 6,
                to_bb_index: 4,
                weight: 90,
                kind: CfgEdgeKind::Return,
            },
            InterEdgeArg {
                from_function_index: 6,
                from_bb_index: 4,
                to_function_index: 8,
                to_bb_index: 0,
                weight: 85,
                kind: CfgEdgeKind::Call,
            },
            InterEdgeArg {
                from_function_index: 8,
                from_bb_index: 1,
                to_function_index: 6,
                to_bb_index: 4,
                weight: 85,
                kind: CfgEdgeKind::Return,
            },
        ],
    }
}

/// The path profile matching [`cloning_program_arg`]: hot paths rooted at
/// blocks 3 and 4 of `foo`, with per-predecessor flow and call records.
pub fn cloning_path_profile() -> ProgramPathProfile {
    let children_of_3 = vec![
        PathNodeArg {
            node_bb_index: 4,
            path_pred_info: PathPredInfo {
                entries: pred_entries(vec![
                    (
                        1,
                        PathPredInfoEntry {
                            freq: 160,
                            cache_pressure: 7.2,
                            call_freqs: vec![(call_to(7), 80), (call_to(8), 80)]
                                .into_iter()
                                .collect(),
                            ..PathPredInfoEntry::default()
                        },
                    ),
                    (
                        2,
                        PathPredInfoEntry {
                            freq: 4,
                            cache_pressure: 6.2,
                            call_freqs: vec![(call_to(7), 4), (call_to(8), 0)]
                                .into_iter()
                                .collect(),
                            ..PathPredInfoEntry::default()
                        },
                    ),
                ]),
                missing_pred_entry: pred_entry_with_calls(
                    9,
                    vec![(call_to(7), 4), (call_to(8), 5)],
                ),
            },
            children: vec![PathNodeArg {
                node_bb_index: 5,
                path_pred_info: PathPredInfo {
                    entries: pred_entries(vec![(1, pred_entry(160)), (2, pred_entry(4))]),
                    missing_pred_entry: pred_entry(9),
                },
                children: vec![],
            }],
        },
        PathNodeArg {
            node_bb_index: 5,
            path_pred_info: PathPredInfo {
                entries: pred_entries(vec![(1, pred_entry(13)), (2, pred_entry(649))]),
                missing_pred_entry: pred_entry(28),
            },
            children: vec![],
        },
        PathNodeArg {
            node_bb_index: 1,
            path_pred_info: PathPredInfo {
                entries: pred_entries(vec![(1, pred_entry(9))]),
                missing_pred_entry: pred_entry(1),
            },
            children: vec![],
        },
    ];

    let children_of_4 = vec![PathNodeArg {
        node_bb_index: 5,
        path_pred_info: PathPredInfo {
            entries: pred_entries(vec![(2, pred_entry(10)), (3, pred_entry(173))]),
            missing_pred_entry: pred_entry(2),
        },
        children: vec![],
    }];

    build_path_profile(vec![FunctionPathProfileArg {
        function_index: 6,
        path_node_args: vec![
            PathNodeArg {
                node_bb_index: 3,
                path_pred_info: PathPredInfo {
                    entries: pred_entries(vec![(1, pred_entry(195)), (2, pred_entry(656))]),
                    missing_pred_entry: pred_entry(38),
                },
                children: children_of_3,
            },
            PathNodeArg {
                node_bb_index: 4,
                path_pred_info: PathPredInfo {
                    entries: pred_entries(vec![
                        (
                            2,
                            PathPredInfoEntry {
                                freq: 10,
                                cache_pressure: 8.2,
                                call_freqs: vec![(call_to(7), 10), (call_to(8), 0)]
                                    .into_iter()
                                    .collect(),
                                ..PathPredInfoEntry::default()
                            },
                        ),
                        (
                            3,
                            PathPredInfoEntry {
                                freq: 173,
                                cache_pressure: 9.2,
                                call_freqs: vec![(call_to(7), 89), (call_to(8), 84)]
                                    .into_iter()
                                    .collect(),
                                ..PathPredInfoEntry::default()
                            },
                        ),
                    ]),
                    missing_pred_entry: pred_entry_with_calls(
                        2,
                        vec![(call_to(7), 1), (call_to(8), 1)],
                    ),
                },
                children: children_of_4,
            },
        ],
    }])
}
