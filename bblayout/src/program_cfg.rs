// SPDX-FileCopyrightText: 2025 The bblayout developers
// SPDX-License-Identifier: LGPL-3.0-only

use helper::set_map::SetMap;

use std::collections::{BTreeMap, HashMap};

use crate::cfg::{
    CfgEdge, CfgEdgeKind, CfgNode, ControlFlowGraph, EdgeLoc, InterEdgeRef, NodeRef,
};

/// The whole-program control flow graph: all CFGs keyed by function index.
#[derive(Debug, Default)]
pub struct ProgramCfg {
    cfgs: BTreeMap<usize, ControlFlowGraph>,
}

impl ProgramCfg {
    pub fn new(cfgs: BTreeMap<usize, ControlFlowGraph>) -> ProgramCfg {
        for (function_index, cfg) in cfgs.iter() {
            assert_eq!(*function_index, cfg.function_index());
        }
        ProgramCfg { cfgs }
    }

    /// Returns the CFGs in increasing order of their function index.
    pub fn cfgs(&self) -> impl Iterator<Item = &ControlFlowGraph> {
        self.cfgs.values()
    }

    pub fn cfg_by_index(&self, function_index: usize) -> Option<&ControlFlowGraph> {
        self.cfgs.get(&function_index)
    }

    pub fn len(&self) -> usize {
        self.cfgs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cfgs.is_empty()
    }

    /// Returns a map from section names to the CFGs placed in them.
    pub fn cfgs_by_section_name(&self) -> BTreeMap<&str, Vec<&ControlFlowGraph>> {
        let mut result: BTreeMap<&str, Vec<&ControlFlowGraph>> = BTreeMap::new();
        for cfg in self.cfgs.values() {
            result.entry(cfg.section_name()).or_default().push(cfg);
        }
        result
    }

    /// A resolver view over every CFG of the program.
    pub fn view(&self) -> CfgRefs<'_> {
        CfgRefs::new(self.cfgs.values())
    }

    pub fn into_cfgs(self) -> BTreeMap<usize, ControlFlowGraph> {
        self.cfgs
    }

    /// Returns the `percentile` frequency among all nodes with non-zero
    /// frequencies. `percentile` must be between 0 and 100.
    pub fn node_frequency_threshold(&self, percentile: usize) -> i64 {
        assert!(percentile <= 100);
        let view = self.view();
        let mut hot_nodes: Vec<(i64, usize, usize)> = Vec::new();
        for cfg in self.cfgs.values() {
            for node in cfg.nodes() {
                let frequency = view.node_frequency(node.node_ref());
                if frequency == 0 {
                    continue;
                }
                hot_nodes.push((frequency, cfg.function_index(), node.node_index()));
            }
        }
        if hot_nodes.is_empty() {
            return 0;
        }
        let cutoff_index = (hot_nodes.len() * percentile / 100).checked_sub(1);
        let Some(cutoff_index) = cutoff_index else {
            return 0;
        };
        hot_nodes.sort_unstable();
        hot_nodes[cutoff_index].0
    }

    /// Returns the bb_indexes of hot join nodes, keyed by function index.
    /// These are non-entry nodes with a frequency of at least
    /// `hot_node_frequency_threshold` and at least two incoming
    /// intra-function branch edges at least as heavy as
    /// `hot_edge_frequency_threshold`.
    pub fn hot_join_nodes(
        &self,
        hot_node_frequency_threshold: i64,
        hot_edge_frequency_threshold: i64,
    ) -> SetMap<usize, usize> {
        let view = self.view();
        let mut result = SetMap::new();
        for cfg in self.cfgs.values() {
            for node in cfg.nodes() {
                if node.is_entry() {
                    continue;
                }
                if view.node_frequency(node.node_ref()) < hot_node_frequency_threshold {
                    continue;
                }
                let n_hot_branches_to = node
                    .intra_in()
                    .iter()
                    .filter(|&&e| {
                        let edge = cfg.intra_edge(e);
                        edge.src() != edge.sink()
                            && edge.is_branch_or_fallthrough()
                            && edge.weight() >= hot_edge_frequency_threshold
                    })
                    .count();
                if n_hot_branches_to <= 1 {
                    continue;
                }
                result.insert(cfg.function_index(), node.bb_index());
            }
        }
        result
    }
}

/// A borrow view over a set of CFGs which resolves cross-CFG handles.
///
/// Node frequencies follow the identity
/// `max(max_call_out, max_return_in, sum_non_call_out, sum_non_return_in)`;
/// handles into CFGs absent from the view contribute zero.
pub struct CfgRefs<'a> {
    cfgs: HashMap<usize, &'a ControlFlowGraph>,
}

impl<'a> CfgRefs<'a> {
    pub fn new(cfgs: impl IntoIterator<Item = &'a ControlFlowGraph>) -> CfgRefs<'a> {
        CfgRefs {
            cfgs: cfgs.into_iter().map(|cfg| (cfg.function_index(), cfg)).collect(),
        }
    }

    pub fn cfg(&self, function_index: usize) -> Option<&'a ControlFlowGraph> {
        self.cfgs.get(&function_index).copied()
    }

    /// Resolves a node handle. Panics if the owning CFG is not part of
    /// this view.
    pub fn node(&self, node_ref: NodeRef) -> &'a CfgNode {
        self.cfgs
            .get(&node_ref.function_index)
            .unwrap_or_else(|| panic!("CFG {} is not part of this view", node_ref.function_index))
            .node(node_ref.node_index)
    }

    pub fn inter_edge(&self, edge_ref: InterEdgeRef) -> Option<&'a CfgEdge> {
        self.cfgs
            .get(&edge_ref.function_index)
            .map(|cfg| cfg.inter_edge(edge_ref.edge_index))
    }

    /// Resolves an arbitrary edge handle. Panics if the owning CFG is not
    /// part of this view.
    pub fn edge(&self, loc: EdgeLoc) -> &'a CfgEdge {
        let cfg = self
            .cfg(loc.function_index)
            .unwrap_or_else(|| panic!("CFG {} is not part of this view", loc.function_index));
        if loc.inter {
            cfg.inter_edge(loc.edge_index)
        } else {
            cfg.intra_edge(loc.edge_index)
        }
    }

    /// Computes the execution frequency of a node from its incident edges.
    pub fn node_frequency(&self, node_ref: NodeRef) -> i64 {
        let Some(cfg) = self.cfg(node_ref.function_index) else {
            return 0;
        };
        let node = cfg.node(node_ref.node_index);

        let mut max_call_out = 0;
        let mut max_ret_in = 0;
        // Total outgoing edge frequency from the node's exit.
        let mut sum_out = 0;
        // Total incoming edge frequency to the node's entry.
        let mut sum_in = 0;

        for &e in node.intra_out() {
            let edge = cfg.intra_edge(e);
            if edge.is_call() {
                max_call_out = max_call_out.max(edge.weight());
            } else {
                sum_out += edge.weight();
            }
        }
        for &e in node.inter_out() {
            let edge = cfg.inter_edge(e);
            if edge.is_call() {
                max_call_out = max_call_out.max(edge.weight());
            } else {
                sum_out += edge.weight();
            }
        }
        for &e in node.intra_in() {
            let edge = cfg.intra_edge(e);
            if edge.is_return() {
                max_ret_in = max_ret_in.max(edge.weight());
            } else {
                sum_in += edge.weight();
            }
        }
        for &e in node.inter_in() {
            let Some(edge) = self.inter_edge(e) else {
                continue;
            };
            if edge.is_return() {
                max_ret_in = max_ret_in.max(edge.weight());
            } else {
                sum_in += edge.weight();
            }
        }
        max_call_out.max(max_ret_in).max(sum_out).max(sum_in)
    }
}

/// Creates an inter-function edge between nodes of two CFGs in `cfgs`.
/// The edge lands in the source CFG's arena; the sink node records the
/// handle. The inter-section flag is derived from the section names.
pub fn create_inter_edge(
    cfgs: &mut BTreeMap<usize, ControlFlowGraph>,
    src: NodeRef,
    sink: NodeRef,
    weight: i64,
    kind: CfgEdgeKind,
) -> InterEdgeRef {
    assert_ne!(
        src.function_index, sink.function_index,
        "intra-function edges cannot be created as inter-function edges"
    );
    let inter_section =
        cfgs[&src.function_index].section_name() != cfgs[&sink.function_index].section_name();
    let edge = CfgEdge::new(src, sink, weight, kind, inter_section);
    let edge_index = cfgs
        .get_mut(&src.function_index)
        .expect("source CFG must exist")
        .push_inter_edge(edge);
    let edge_ref = InterEdgeRef {
        function_index: src.function_index,
        edge_index,
    };
    cfgs.get_mut(&sink.function_index)
        .expect("sink CFG must exist")
        .register_inter_in(sink.node_index, edge_ref);
    edge_ref
}

/// Returns the handle of the inter-function edge from `src` to `sink` of
/// `kind`, if any exists.
pub fn inter_edge_to(
    cfgs: &BTreeMap<usize, ControlFlowGraph>,
    src: NodeRef,
    sink: NodeRef,
    kind: CfgEdgeKind,
) -> Option<InterEdgeRef> {
    let cfg = cfgs.get(&src.function_index)?;
    cfg.node(src.node_index)
        .inter_out()
        .iter()
        .copied()
        .map(|edge_index| InterEdgeRef {
            function_index: src.function_index,
            edge_index,
        })
        .find(|r| {
            let edge = cfg.inter_edge(r.edge_index);
            edge.kind() == kind && edge.sink() == sink
        })
}

/// Increments an existing inter-function edge or creates a new one.
pub fn create_or_update_inter_edge(
    cfgs: &mut BTreeMap<usize, ControlFlowGraph>,
    src: NodeRef,
    sink: NodeRef,
    weight: i64,
    kind: CfgEdgeKind,
) -> InterEdgeRef {
    if let Some(edge_ref) = inter_edge_to(cfgs, src, sink, kind) {
        cfgs.get_mut(&edge_ref.function_index)
            .expect("owner CFG must exist")
            .inter_edge_mut(edge_ref.edge_index)
            .increment_weight(weight);
        return edge_ref;
    }
    create_inter_edge(cfgs, src, sink, weight, kind)
}
