// SPDX-FileCopyrightText: 2025 The bblayout developers
// SPDX-License-Identifier: LGPL-3.0-only

/// Tunable parameters of the layout engine. Plain immutable data, passed
/// by reference; there is no process-wide configuration.
#[derive(Clone, Debug, PartialEq)]
pub struct CodeLayoutParams {
    /// Multiplier for branch edges with zero layout distance.
    pub fallthrough_weight: f64,
    /// Scale for forward jumps.
    pub forward_jump_weight: f64,
    /// Forward jump cutoff in bytes.
    pub forward_jump_distance: u64,
    /// Scale for backward jumps.
    pub backward_jump_weight: f64,
    /// Backward jump cutoff in bytes.
    pub backward_jump_distance: u64,
    /// Extra bonus for always-taken direct branches that become
    /// fallthroughs.
    pub always_fallthrough_branch_weight: f64,
    /// Extra bonus for always-taken direct branches that stay jumps.
    pub always_taken_nonfallthrough_branch_weight: f64,
    /// Order functions against one another by call-chain clustering.
    pub call_chain_clustering: bool,
    /// Run the chain builder once over a whole section instead of per CFG.
    pub inter_function_reordering: bool,
    /// Enable the split-and-merge assembly options.
    pub chain_split: bool,
    /// Maximum chain size (bytes) eligible for splitting.
    pub chain_split_threshold: u64,
    /// Cap on cluster merging.
    pub cluster_merge_size_threshold: u64,
    /// When false, hot blocks keep their input order.
    pub reorder_hot_blocks: bool,
    /// Separate hot and cold chains.
    pub split_functions: bool,
}

impl Default for CodeLayoutParams {
    fn default() -> CodeLayoutParams {
        CodeLayoutParams {
            fallthrough_weight: 1.0,
            forward_jump_weight: 0.1,
            forward_jump_distance: 1024,
            backward_jump_weight: 0.1,
            backward_jump_distance: 640,
            always_fallthrough_branch_weight: 0.0,
            always_taken_nonfallthrough_branch_weight: 0.0,
            call_chain_clustering: false,
            inter_function_reordering: false,
            chain_split: true,
            chain_split_threshold: 1024,
            cluster_merge_size_threshold: 1 << 21,
            reorder_hot_blocks: true,
            split_functions: true,
        }
    }
}

/// Options of the path-cloning evaluator.
#[derive(Clone, Debug, PartialEq)]
pub struct PathProfileOptions {
    /// Maximum number of blocks in a cloned path.
    pub max_path_length: usize,
    /// Minimum ratio of the flow continuing through a path's children to
    /// the flow entering it, per path predecessor.
    pub min_flow_ratio: f64,
    /// Score threshold for candidate generation.
    pub min_initial_cloning_score: f64,
    /// Score threshold for the final application pass.
    pub min_final_cloning_score: f64,
    /// Per-byte penalty for cloned code.
    pub base_penalty_factor: f64,
    /// Per-byte penalty scaled by the profiled cache pressure.
    pub icache_penalty_factor: f64,
    /// Allow cloning blocks that end in an indirect branch.
    pub clone_indirect_branch_blocks: bool,
}

impl Default for PathProfileOptions {
    fn default() -> PathProfileOptions {
        PathProfileOptions {
            max_path_length: 10,
            min_flow_ratio: 0.03,
            min_initial_cloning_score: 10.0,
            min_final_cloning_score: 10.0,
            base_penalty_factor: 0.1,
            icache_penalty_factor: 0.0,
            clone_indirect_branch_blocks: false,
        }
    }
}
