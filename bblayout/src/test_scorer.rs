// SPDX-FileCopyrightText: 2025 The bblayout developers
// SPDX-License-Identifier: LGPL-3.0-only

#[cfg(test)]
mod tests {
    use crate::cfg_testutil::{build_from_cfg_arg, cloning_program_arg};
    use crate::config::CodeLayoutParams;
    use crate::scorer::CodeLayoutScorer;

    fn scorer_params() -> CodeLayoutParams {
        CodeLayoutParams {
            fallthrough_weight: 10.0,
            forward_jump_weight: 2.0,
            backward_jump_weight: 1.0,
            forward_jump_distance: 200,
            backward_jump_distance: 100,
            ..CodeLayoutParams::default()
        }
    }

    #[test]
    fn test_call_edge_score() {
        let program_cfg = build_from_cfg_arg(cloning_program_arg());
        let view = program_cfg.view();
        let scorer = CodeLayoutScorer::new(&scorer_params());

        let foo_cfg = program_cfg.cfg_by_index(6).unwrap();
        let call_edge = foo_cfg
            .inter_edges()
            .iter()
            .find(|e| e.is_call() && e.sink().function_index == 7)
            .unwrap();
        // Half of the source block (0x20 bytes) is always added to the
        // distance, approximating the callsite to its middle.
        assert_eq!(
            scorer.edge_score(&view, call_edge, -30),
            90.0 * 1.0 * (1.0 - (30.0 - 16.0) / 100.0)
        );
        assert_eq!(
            scorer.edge_score(&view, call_edge, 0),
            90.0 * 2.0 * (1.0 - 16.0 / 200.0)
        );
        assert_eq!(
            scorer.edge_score(&view, call_edge, 20),
            90.0 * 2.0 * (1.0 - (20.0 + 16.0) / 200.0)
        );
        // Beyond the distance thresholds the score vanishes.
        assert_eq!(scorer.edge_score(&view, call_edge, 250), 0.0);
        assert_eq!(scorer.edge_score(&view, call_edge, -150), 0.0);
    }

    #[test]
    fn test_return_edge_score() {
        let program_cfg = build_from_cfg_arg(cloning_program_arg());
        let view = program_cfg.view();
        let scorer = CodeLayoutScorer::new(&scorer_params());

        let bar_cfg = program_cfg.cfg_by_index(7).unwrap();
        let return_edge = bar_cfg
            .inter_edges()
            .iter()
            .find(|e| e.is_return())
            .unwrap();
        // For returns half of the sink block (0x20 bytes) is added.
        assert_eq!(
            scorer.edge_score(&view, return_edge, -30),
            90.0 * 1.0 * (1.0 - (30.0 - 16.0) / 100.0)
        );
        assert_eq!(
            scorer.edge_score(&view, return_edge, 0),
            90.0 * 2.0 * (1.0 - 16.0 / 200.0)
        );
        assert_eq!(scorer.edge_score(&view, return_edge, 250), 0.0);
    }

    #[test]
    fn test_branch_edge_score() {
        let program_cfg = build_from_cfg_arg(cloning_program_arg());
        let view = program_cfg.view();
        let scorer = CodeLayoutScorer::new(&scorer_params());

        let foo_cfg = program_cfg.cfg_by_index(6).unwrap();
        let edge_index = foo_cfg
            .intra_edge_to(0, 2, crate::cfg::CfgEdgeKind::BranchOrFallthrough)
            .unwrap();
        let edge = foo_cfg.intra_edge(edge_index);
        assert_eq!(scorer.edge_score(&view, edge, 0), 660.0 * 10.0);
        assert_eq!(
            scorer.edge_score(&view, edge, -40),
            660.0 * 1.0 * (1.0 - 40.0 / 100.0)
        );
        assert_eq!(
            scorer.edge_score(&view, edge, 80),
            660.0 * 2.0 * (1.0 - 80.0 / 200.0)
        );
        assert_eq!(scorer.edge_score(&view, edge, 201), 0.0);
        assert_eq!(scorer.edge_score(&view, edge, -101), 0.0);
    }

    #[test]
    fn test_always_taken_branch_bonus() {
        let program_cfg = build_from_cfg_arg(cloning_program_arg());
        let view = program_cfg.view();
        let mut params = scorer_params();
        params.always_fallthrough_branch_weight = 3.0;
        params.always_taken_nonfallthrough_branch_weight = 0.5;
        let scorer = CodeLayoutScorer::new(&params);

        let bar_cfg = program_cfg.cfg_by_index(7).unwrap();
        // bar's 0 -> 1 edge carries all of its source's branch flow.
        let edge_index = bar_cfg
            .intra_edge_to(0, 1, crate::cfg::CfgEdgeKind::BranchOrFallthrough)
            .unwrap();
        let edge = bar_cfg.intra_edge(edge_index);
        assert_eq!(scorer.edge_score(&view, edge, 0), 90.0 * (10.0 + 3.0));
        assert_eq!(
            scorer.edge_score(&view, edge, 80),
            90.0 * (2.0 * (1.0 - 80.0 / 200.0) + 0.5)
        );

        // foo's entry splits its flow, so neither of its edges gets the
        // bonus.
        let foo_cfg = program_cfg.cfg_by_index(6).unwrap();
        let split_edge_index = foo_cfg
            .intra_edge_to(0, 2, crate::cfg::CfgEdgeKind::BranchOrFallthrough)
            .unwrap();
        let split_edge = foo_cfg.intra_edge(split_edge_index);
        assert_eq!(scorer.edge_score(&view, split_edge, 0), 660.0 * 10.0);
    }
}
