// SPDX-FileCopyrightText: 2025 The bblayout developers
// SPDX-License-Identifier: LGPL-3.0-only

#[cfg(test)]
mod tests {
    use crate::cfg::CfgEdgeKind;
    use crate::cfg_change::{CfgBuilder, ConflictEdges, IntraEdgeReroute};
    use crate::cfg_testutil::{build_from_cfg_arg, cloning_program_arg, cloning_path_profile};
    use crate::code_layout::CodeLayout;
    use crate::config::{CodeLayoutParams, PathProfileOptions};
    use crate::path_clone::{
        evaluate_all_clonings, evaluate_cloning, get_initial_chains, CfgChangeBuilder,
    };
    use crate::path_profile::PathCloning;

    fn fast_params() -> CodeLayoutParams {
        CodeLayoutParams {
            call_chain_clustering: false,
            inter_function_reordering: false,
            chain_split: false,
            ..CodeLayoutParams::default()
        }
    }

    fn intra_reroute(
        src_bb_index: usize,
        sink_bb_index: usize,
        src_is_cloned: bool,
        sink_is_cloned: bool,
        weight: i64,
    ) -> IntraEdgeReroute {
        IntraEdgeReroute {
            src_bb_index,
            sink_bb_index,
            src_is_cloned,
            sink_is_cloned,
            kind: CfgEdgeKind::BranchOrFallthrough,
            weight,
        }
    }

    #[test]
    fn test_cfg_change_builder_traces_the_path() {
        let path_profile = cloning_path_profile();
        let function_path_profile = path_profile.path_profile(6).unwrap();
        let tree_3 = function_path_profile.path_tree(3).unwrap();
        let cloning = PathCloning {
            path: vec![tree_3, tree_3.child(4).unwrap()],
            function_index: 6,
            path_pred_bb_index: 1,
        };

        let cfg_change = CfgChangeBuilder::new(&cloning, &ConflictEdges::default(), function_path_profile)
            .build()
            .unwrap();

        assert_eq!(cfg_change.path_pred_bb_index, 1);
        assert_eq!(cfg_change.path_to_clone, vec![3, 4]);
        assert_eq!(
            cfg_change.intra_edge_reroutes,
            vec![
                // The path itself, entered from the predecessor.
                intra_reroute(1, 3, false, true, 195),
                intra_reroute(3, 4, true, true, 160),
                // Flow leaving the cloned 3 towards original successors.
                intra_reroute(3, 1, true, false, 9),
                intra_reroute(3, 5, true, false, 13),
                // Flow leaving the cloned 4.
                intra_reroute(4, 5, true, false, 160),
            ]
        );
        // The call flow of the cloned block 4 moves to the clone.
        assert_eq!(cfg_change.inter_edge_reroutes.len(), 2);
        assert!(cfg_change
            .inter_edge_reroutes
            .iter()
            .all(|r| r.kind == CfgEdgeKind::Call && r.src_bb_index == 4 && r.weight == 80));
        // Missing-predecessor paths reaching 3 and 4 must be dropped.
        assert_eq!(
            cfg_change
                .paths_to_drop
                .iter()
                .map(|path_drop| path_drop.node_bb_index)
                .collect::<Vec<_>>(),
            vec![3, 4, 4]
        );
    }

    #[test]
    fn test_cfg_change_builder_detects_conflicts() {
        let path_profile = cloning_path_profile();
        let function_path_profile = path_profile.path_profile(6).unwrap();
        let tree_3 = function_path_profile.path_tree(3).unwrap();
        let cloning = PathCloning {
            path: vec![tree_3, tree_3.child(4).unwrap()],
            function_index: 6,
            path_pred_bb_index: 1,
        };

        let mut conflict_edges = ConflictEdges::default();
        conflict_edges.affected_edges.insert((1, 3));
        let result =
            CfgChangeBuilder::new(&cloning, &conflict_edges, function_path_profile).build();
        assert_eq!(
            result.unwrap_err().to_string(),
            "path predecessor edge has been affected by the currently applied clonings."
        );

        let mut conflict_edges = ConflictEdges::default();
        conflict_edges.path_pred_edges.insert((3, 4));
        let result =
            CfgChangeBuilder::new(&cloning, &conflict_edges, function_path_profile).build();
        assert_eq!(
            result.unwrap_err().to_string(),
            "Edge is the path predecessor of some cloning previously applied."
        );
    }

    #[test]
    fn test_get_initial_chains_preserves_unaffected_fallthroughs() {
        let program_cfg = build_from_cfg_arg(cloning_program_arg());
        let foo_cfg = program_cfg.cfg_by_index(6).unwrap();
        let path_profile = cloning_path_profile();
        let function_path_profile = path_profile.path_profile(6).unwrap();

        let optimal_chain_info = CodeLayout::new(&fast_params(), vec![foo_cfg])
            .order_all()
            .remove(0);

        let tree_3 = function_path_profile.path_tree(3).unwrap();
        let cloning = PathCloning {
            path: vec![tree_3, tree_3.child(5).unwrap()],
            function_index: 6,
            path_pred_bb_index: 1,
        };
        let cfg_change = CfgChangeBuilder::new(&cloning, &ConflictEdges::default(), function_path_profile)
            .build()
            .unwrap();

        let initial_chains = get_initial_chains(foo_cfg, &optimal_chain_info, &cfg_change);
        // Every block touched by the cloning is cut out; the surviving
        // runs are fallthrough-connected.
        for chain in &initial_chains {
            for bundle in &chain.bb_bundles {
                for window in bundle.full_bb_ids.windows(2) {
                    let prev = foo_cfg.node_index_by_id(window[0].intra_cfg_id);
                    let next = foo_cfg.node_index_by_id(window[1].intra_cfg_id);
                    assert!(foo_cfg
                        .intra_edge_to(prev, next, CfgEdgeKind::BranchOrFallthrough)
                        .is_some());
                }
            }
            for full_bb_id in chain.all_bbs() {
                assert!(![1, 3, 4, 5].contains(&full_bb_id.intra_cfg_id.bb_index));
            }
        }
    }

    #[test]
    fn test_evaluate_cloning_rejects_below_min_score() {
        let program_cfg = build_from_cfg_arg(cloning_program_arg());
        let foo_cfg = program_cfg.cfg_by_index(6).unwrap();
        let path_profile = cloning_path_profile();
        let function_path_profile = path_profile.path_profile(6).unwrap();
        let params = fast_params();

        let optimal_chain_info = CodeLayout::new(&params, vec![foo_cfg])
            .order_all()
            .remove(0);
        let cloning = PathCloning {
            path: vec![function_path_profile.path_tree(4).unwrap()],
            function_index: 6,
            path_pred_bb_index: 2,
        };
        let result = evaluate_cloning(
            &CfgBuilder::new(foo_cfg),
            &cloning,
            &params,
            &PathProfileOptions::default(),
            f64::MAX,
            &optimal_chain_info,
            function_path_profile,
        );
        let message = result.unwrap_err().to_string();
        assert!(
            message.starts_with("Cloning is not acceptable with score gain:"),
            "unexpected message: {message}"
        );
    }

    #[test]
    fn test_evaluate_all_clonings_returns_gated_paths() {
        let program_cfg = build_from_cfg_arg(cloning_program_arg());
        let path_profile = cloning_path_profile();
        let params = fast_params();
        let path_profile_options = PathProfileOptions {
            min_initial_cloning_score: -1e9,
            ..PathProfileOptions::default()
        };

        let clonings = evaluate_all_clonings(
            &program_cfg,
            &path_profile,
            &params,
            &path_profile_options,
        );
        assert_eq!(clonings.keys().copied().collect::<Vec<_>>(), vec![6]);
        let clonings = &clonings[&6];
        assert!(!clonings.is_empty());
        for cloning in clonings {
            // Every cloning is scored and gated by a predecessor outside
            // its own path.
            assert!(cloning.score.is_some());
            let full_path = cloning.path_cloning.full_path();
            assert!(full_path.len() >= 2);
            assert!(!full_path[1..].contains(&full_path[0]));
            // Block 1 ends in an indirect branch and can never gate a
            // cloning.
            assert_ne!(full_path[0], 1);
        }
    }

    #[test]
    fn test_evaluate_all_clonings_limits_path_length() {
        let program_cfg = build_from_cfg_arg(cloning_program_arg());
        let path_profile = cloning_path_profile();
        let params = fast_params();
        let path_profile_options = PathProfileOptions {
            max_path_length: 1,
            min_initial_cloning_score: -1e9,
            ..PathProfileOptions::default()
        };

        let clonings = evaluate_all_clonings(
            &program_cfg,
            &path_profile,
            &params,
            &path_profile_options,
        );
        for cloning in &clonings[&6] {
            assert_eq!(cloning.path_cloning.full_path().len(), 2);
        }
    }

}
