// SPDX-FileCopyrightText: 2025 The bblayout developers
// SPDX-License-Identifier: LGPL-3.0-only

/// Statistics of one or more code-layout runs.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CodeLayoutStats {
    pub n_chains_built: usize,
    pub n_assemblies_applied: usize,
    pub original_intra_score: f64,
    pub optimized_intra_score: f64,
    pub original_inter_score: f64,
    pub optimized_inter_score: f64,
}

impl std::ops::AddAssign for CodeLayoutStats {
    fn add_assign(&mut self, rhs: CodeLayoutStats) {
        self.n_chains_built += rhs.n_chains_built;
        self.n_assemblies_applied += rhs.n_assemblies_applied;
        self.original_intra_score += rhs.original_intra_score;
        self.optimized_intra_score += rhs.optimized_intra_score;
        self.original_inter_score += rhs.original_inter_score;
        self.optimized_inter_score += rhs.optimized_inter_score;
    }
}

/// Statistics of applying path clonings to a program CFG.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CloningStats {
    pub paths_cloned: usize,
    pub bbs_cloned: usize,
    pub bytes_cloned: u64,
    pub score_gain: f64,
}
