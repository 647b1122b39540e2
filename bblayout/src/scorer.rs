// SPDX-FileCopyrightText: 2025 The bblayout developers
// SPDX-License-Identifier: LGPL-3.0-only

use crate::cfg::CfgEdge;
use crate::config::CodeLayoutParams;
use crate::program_cfg::CfgRefs;

/// Computes the extended TSP score contribution of single edges.
///
/// The score of an edge with a given signed layout distance is:
/// 1. If the edge is a fallthrough:
///      weight * fallthrough_weight
/// 2. If the edge is a forward jump:
///      weight * forward_jump_weight
///             * (1 - distance / forward_jump_distance)
/// 3. If the edge is a backward jump:
///      weight * backward_jump_weight
///             * (1 - |distance| / backward_jump_distance)
///
/// Always-taken direct branches receive a configurable extra bonus on top,
/// in the fallthrough and in the jump case separately.
#[derive(Clone, Debug)]
pub struct CodeLayoutScorer {
    params: CodeLayoutParams,
}

impl CodeLayoutScorer {
    pub fn new(params: &CodeLayoutParams) -> CodeLayoutScorer {
        CodeLayoutScorer {
            params: params.clone(),
        }
    }

    pub fn params(&self) -> &CodeLayoutParams {
        &self.params
    }

    /// Returns the score for one edge, given the signed distance from the
    /// end of its source to the start of its sink in the layout.
    ///
    /// `src_sink_distance > 0` is a forward jump, `== 0` a fallthrough and
    /// `< 0` a backward jump. Call and return points are approximated to
    /// be in the middle of the involved block.
    pub fn edge_score(&self, view: &CfgRefs, edge: &CfgEdge, src_sink_distance: i64) -> f64 {
        let mut src_sink_distance = src_sink_distance;
        if edge.is_call() {
            src_sink_distance += (view.node(edge.src()).size() / 2) as i64;
        }
        if edge.is_return() {
            src_sink_distance += (view.node(edge.sink()).size() / 2) as i64;
        }

        let always_taken_direct = self.is_always_taken_direct(view, edge);

        if src_sink_distance == 0 && edge.is_branch_or_fallthrough() {
            let mut factor = self.params.fallthrough_weight;
            // An always-taken direct branch that becomes a fallthrough
            // either disappears entirely or never enters the branch
            // predictor.
            if always_taken_direct {
                factor += self.params.always_fallthrough_branch_weight;
            }
            return edge.weight() as f64 * factor;
        }

        let mut factor = 0.0;
        let absolute_distance = src_sink_distance.unsigned_abs();
        if src_sink_distance > 0 && absolute_distance < self.params.forward_jump_distance {
            factor = self.params.forward_jump_weight
                * (1.0 - absolute_distance as f64 / self.params.forward_jump_distance as f64);
        }
        if src_sink_distance < 0 && absolute_distance < self.params.backward_jump_distance {
            factor = self.params.backward_jump_weight
                * (1.0 - absolute_distance as f64 / self.params.backward_jump_distance as f64);
        }
        if always_taken_direct {
            factor += self.params.always_taken_nonfallthrough_branch_weight;
        }
        factor * edge.weight() as f64
    }

    /// An edge is an always-taken direct branch when it carries all of its
    /// source's profiled branch flow and the source has no indirect
    /// branch. Call and return edges never qualify.
    fn is_always_taken_direct(&self, view: &CfgRefs, edge: &CfgEdge) -> bool {
        if !edge.is_branch_or_fallthrough() || edge.weight() == 0 {
            return false;
        }
        let src = view.node(edge.src());
        if src.has_indirect_branch() {
            return false;
        }
        let src_cfg = view
            .cfg(edge.src().function_index)
            .expect("edge source CFG must be part of the view");
        let total_branch_out: i64 = src
            .intra_out()
            .iter()
            .map(|&e| src_cfg.intra_edge(e))
            .filter(|e| e.is_branch_or_fallthrough())
            .map(|e| e.weight())
            .sum();
        edge.weight() == total_branch_out
    }
}
