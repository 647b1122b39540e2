// SPDX-FileCopyrightText: 2025 The bblayout developers
// SPDX-License-Identifier: LGPL-3.0-only

use std::collections::{HashMap, HashSet};

use crate::cfg::{CfgEdgeKind, CfgNode, ControlFlowGraph, IntraCfgId};
use crate::path_profile::{PathNode, PathPredInfoEntry};

/// The original edges impacted by applied clonings, used to decide if a
/// new path cloning can still be applied. A new cloning conflicts with
/// prior clonings if its path predecessor edge is in `affected_edges` or
/// if it would reduce the frequency of an edge in `path_pred_edges`.
/// Every edge in `path_pred_edges` is also in `affected_edges`.
#[derive(Clone, Debug, Default)]
pub struct ConflictEdges {
    /// Path predecessor edges of all clonings applied so far, as
    /// (from_bb_index, to_bb_index).
    pub path_pred_edges: HashSet<(usize, usize)>,
    /// All original intra-function edges modified by the applied clonings.
    pub affected_edges: HashSet<(usize, usize)>,
}

/// Rerouting of control flow for a single intra-function edge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IntraEdgeReroute {
    pub src_bb_index: usize,
    pub sink_bb_index: usize,
    /// Whether the source or sink endpoint refers to the cloned instance.
    pub src_is_cloned: bool,
    pub sink_is_cloned: bool,
    pub kind: CfgEdgeKind,
    pub weight: i64,
}

/// Rerouting of control flow for a single inter-function edge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InterEdgeReroute {
    pub src_function_index: usize,
    pub sink_function_index: usize,
    pub src_bb_index: usize,
    pub sink_bb_index: usize,
    pub src_is_cloned: bool,
    pub sink_is_cloned: bool,
    pub kind: CfgEdgeKind,
    pub weight: i64,
}

/// The weights to subtract for one path whose predecessor could not be
/// determined. Dropping is recorded by value so changes carry no
/// references into the path-profile tree.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PathDropInfo {
    pub node_bb_index: usize,
    /// The missing-predecessor entry of the dropped path node itself;
    /// consumed when rewiring inter-function edges.
    pub missing_pred_entry: PathPredInfoEntry,
    /// Missing-predecessor frequency flowing into each child, to subtract
    /// from the (node_bb_index -> child) branch edges.
    pub child_missing_freqs: Vec<(usize, i64)>,
}

impl PathDropInfo {
    pub fn for_path_node(path_node: &PathNode) -> PathDropInfo {
        PathDropInfo {
            node_bb_index: path_node.node_bb_index(),
            missing_pred_entry: path_node.path_pred_info().missing_pred_entry.clone(),
            child_missing_freqs: path_node
                .children()
                .values()
                .map(|child| {
                    (
                        child.node_bb_index(),
                        child.path_pred_info().missing_pred_entry.freq,
                    )
                })
                .filter(|&(_, freq)| freq != 0)
                .collect(),
        }
    }
}

/// A planned CFG change from applying a single path cloning.
#[derive(Clone, Debug, Default)]
pub struct CfgChangeFromPathCloning {
    /// The block that must precede the cloned path.
    pub path_pred_bb_index: usize,
    /// bb_indexes of the blocks to clone (excluding the predecessor).
    pub path_to_clone: Vec<usize>,
    /// Paths whose missing-predecessor flow cannot be confidently
    /// rerouted; their weights are subtracted from the CFG.
    pub paths_to_drop: Vec<PathDropInfo>,
    pub intra_edge_reroutes: Vec<IntraEdgeReroute>,
    pub inter_edge_reroutes: Vec<InterEdgeReroute>,
}

/// Clones a CFG and applies path clonings to the copy:
///
/// ```ignore
/// let mut cfg_builder = CfgBuilder::new(&cfg);
/// cfg_builder.add_cfg_change(&cfg_change);
/// let clone_cfg = cfg_builder.build();
/// ```
///
/// Edges are only constructed at `build()`, after all nodes exist.
pub struct CfgBuilder<'c> {
    cfg: &'c ControlFlowGraph,
    nodes: Vec<CfgNode>,
    clone_paths: Vec<Vec<usize>>,
    current_clone_numbers: HashMap<usize, usize>,
    cfg_changes: Vec<CfgChangeFromPathCloning>,
    conflict_edges: ConflictEdges,
}

impl<'c> CfgBuilder<'c> {
    pub fn new(cfg: &'c ControlFlowGraph) -> CfgBuilder<'c> {
        let nodes = cfg
            .nodes()
            .iter()
            .enumerate()
            .map(|(i, node)| node.clone_node(node.clone_number(), i))
            .collect();
        let mut current_clone_numbers = HashMap::new();
        for (bb_index, clones) in cfg.clones_by_bb_index().iter() {
            current_clone_numbers.insert(*bb_index, clones.len());
        }
        CfgBuilder {
            cfg,
            nodes,
            clone_paths: cfg.clone_paths().to_vec(),
            current_clone_numbers,
            cfg_changes: Vec::new(),
            conflict_edges: ConflictEdges::default(),
        }
    }

    /// Returns a fresh builder over the same CFG with the recorded
    /// changes replayed.
    pub fn fork(&self) -> CfgBuilder<'c> {
        let mut cfg_builder = CfgBuilder::new(self.cfg);
        for cfg_change in &self.cfg_changes {
            cfg_builder.add_cfg_change(cfg_change);
        }
        cfg_builder
    }

    pub fn cfg(&self) -> &'c ControlFlowGraph {
        self.cfg
    }

    pub fn cfg_changes(&self) -> &[CfgChangeFromPathCloning] {
        &self.cfg_changes
    }

    pub fn conflict_edges(&self) -> &ConflictEdges {
        &self.conflict_edges
    }

    pub fn node_size(&self, bb_index: usize) -> u64 {
        self.nodes[bb_index].size()
    }

    /// Records `cfg_change`, clones the nodes along its path and extends
    /// the conflict edges accordingly.
    pub fn add_cfg_change(&mut self, cfg_change: &CfgChangeFromPathCloning) {
        self.clone_path(cfg_change.path_pred_bb_index, &cfg_change.path_to_clone);
        for reroute in &cfg_change.intra_edge_reroutes {
            let edge = (reroute.src_bb_index, reroute.sink_bb_index);
            self.conflict_edges.affected_edges.insert(edge);
            if !reroute.src_is_cloned {
                self.conflict_edges.path_pred_edges.insert(edge);
            }
        }
        for path_drop in &cfg_change.paths_to_drop {
            for &(child_bb_index, _) in &path_drop.child_missing_freqs {
                self.conflict_edges
                    .affected_edges
                    .insert((path_drop.node_bb_index, child_bb_index));
            }
        }
        self.cfg_changes.push(cfg_change.clone());
    }

    fn clone_path(&mut self, path_pred_bb_index: usize, path_to_clone: &[usize]) {
        if path_to_clone.is_empty() {
            return;
        }
        let mut clone_path = Vec::with_capacity(path_to_clone.len() + 1);
        clone_path.push(path_pred_bb_index);
        for &bb_index in path_to_clone {
            let clone_number = self
                .current_clone_numbers
                .get(&bb_index)
                .copied()
                .unwrap_or(0)
                + 1;
            let node_index = self.nodes.len();
            self.nodes
                .push(self.nodes[bb_index].clone_node(clone_number, node_index));
            self.current_clone_numbers.insert(bb_index, clone_number);
            clone_path.push(node_index);
        }
        self.clone_paths.push(clone_path);
    }

    /// Materializes the CFG: the original intra edges are copied, then
    /// every recorded change subtracts its dropped and rerouted weights
    /// and wires the clone-side edges.
    pub fn build(self) -> ControlFlowGraph {
        let mut cfg = ControlFlowGraph::new(
            self.cfg.section_name().to_string(),
            self.cfg.function_index(),
            self.cfg.module_name().map(str::to_string),
            self.cfg.names().iter().cloned().collect(),
            self.nodes,
        );
        for clone_path in self.clone_paths {
            cfg.add_clone_path(clone_path);
        }
        for edge in self.cfg.intra_edges() {
            cfg.create_intra_edge(
                edge.src().node_index,
                edge.sink().node_index,
                edge.weight(),
                edge.kind(),
            );
        }

        // Tracks the clone instance each change refers to, in application
        // order.
        let mut clone_numbers: HashMap<usize, usize> = HashMap::new();
        for (bb_index, clones) in self.cfg.clones_by_bb_index().iter() {
            clone_numbers.insert(*bb_index, clones.len());
        }
        for cfg_change in &self.cfg_changes {
            for path_drop in &cfg_change.paths_to_drop {
                for &(child_bb_index, freq) in &path_drop.child_missing_freqs {
                    if let Some(edge_index) = cfg.intra_edge_to(
                        path_drop.node_bb_index,
                        child_bb_index,
                        CfgEdgeKind::BranchOrFallthrough,
                    ) {
                        cfg.intra_edge_mut(edge_index).decrement_weight(freq);
                    }
                }
            }
            for reroute in &cfg_change.intra_edge_reroutes {
                if let Some(edge_index) =
                    cfg.intra_edge_to(reroute.src_bb_index, reroute.sink_bb_index, reroute.kind)
                {
                    cfg.intra_edge_mut(edge_index).decrement_weight(reroute.weight);
                }
                let src_index = if reroute.src_is_cloned {
                    cfg.node_index_by_id(IntraCfgId {
                        bb_index: reroute.src_bb_index,
                        clone_number: clone_numbers.get(&reroute.src_bb_index).copied().unwrap_or(0)
                            + 1,
                    })
                } else {
                    reroute.src_bb_index
                };
                let sink_index = if reroute.sink_is_cloned {
                    cfg.node_index_by_id(IntraCfgId {
                        bb_index: reroute.sink_bb_index,
                        clone_number: clone_numbers
                            .get(&reroute.sink_bb_index)
                            .copied()
                            .unwrap_or(0)
                            + 1,
                    })
                } else {
                    reroute.sink_bb_index
                };
                cfg.create_or_update_intra_edge(src_index, sink_index, reroute.weight, reroute.kind);
            }
            for &bb_index in &cfg_change.path_to_clone {
                *clone_numbers.entry(bb_index).or_insert(0) += 1;
            }
        }
        cfg
    }
}
