// SPDX-FileCopyrightText: 2025 The bblayout developers
// SPDX-License-Identifier: LGPL-3.0-only

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::collections::HashMap;

    use crate::cfg::{InterCfgId, IntraCfgId, NodeRef};
    use crate::cfg_testutil::{
        branch, build_from_cfg_arg, conditionals_join_arg, loop_no_entry_no_exit_arg, node,
        three_branches_arg, CfgArg, MultiCfgArg,
    };
    use crate::chain_assembly::{
        AssemblyOptions, BalancedTreeAssemblyQueue, ChainMergeOrder, IterativeAssemblyQueue,
        NodeChainAssembly, NodeChainAssemblyQueue,
    };
    use crate::chain_builder::{
        break_cycles, get_forced_edges, get_forced_paths, NodeChainBuilder,
    };
    use crate::config::CodeLayoutParams;
    use crate::node_chain::NodeChain;
    use crate::program_cfg::ProgramCfg;
    use crate::scorer::CodeLayoutScorer;

    fn chain_id(function_index: usize, bb_index: usize) -> InterCfgId {
        InterCfgId {
            function_index,
            intra_cfg_id: IntraCfgId {
                bb_index,
                clone_number: 0,
            },
        }
    }

    fn bb_indexes(chain: &NodeChain) -> Vec<usize> {
        chain.nodes().map(|n| n.node_index).collect()
    }

    fn builder_for<'a, Q: NodeChainAssemblyQueue>(
        program_cfg: &'a ProgramCfg,
        function_indices: &[usize],
        params: &CodeLayoutParams,
    ) -> NodeChainBuilder<'a, Q> {
        let cfgs = function_indices
            .iter()
            .map(|&i| program_cfg.cfg_by_index(i).unwrap())
            .collect();
        NodeChainBuilder::new(CodeLayoutScorer::new(params), cfgs, HashMap::new())
    }

    #[test]
    fn test_forced_paths_with_loop() {
        let program_cfg = build_from_cfg_arg(loop_no_entry_no_exit_arg());
        let foo_cfg = program_cfg.cfg_by_index(0).unwrap();

        let mut forced_edges = get_forced_edges(foo_cfg);
        assert_eq!(forced_edges, BTreeMap::from([(1, 2), (2, 1)]));

        // The loop is cut at the edge sinking into the smaller block.
        break_cycles(&mut forced_edges, foo_cfg);
        assert_eq!(forced_edges, BTreeMap::from([(1, 2)]));

        assert_eq!(get_forced_paths(foo_cfg), vec![vec![1, 2]]);
    }

    #[test]
    fn test_forced_paths_no_loop() {
        let program_cfg = build_from_cfg_arg(three_branches_arg());
        let foo_cfg = program_cfg.cfg_by_index(0).unwrap();

        let mut forced_edges = get_forced_edges(foo_cfg);
        assert_eq!(forced_edges, BTreeMap::from([(0, 1), (2, 3)]));
        break_cycles(&mut forced_edges, foo_cfg);
        assert_eq!(forced_edges, BTreeMap::from([(0, 1), (2, 3)]));

        assert_eq!(get_forced_paths(foo_cfg), vec![vec![0, 1], vec![2, 3]]);
    }

    #[test]
    fn test_self_loop_is_elided_from_forced_paths() {
        let program_cfg = build_from_cfg_arg(MultiCfgArg {
            cfg_args: vec![CfgArg {
                section_name: ".text",
                function_index: 0,
                function_name: "foo",
                node_args: vec![node(0x1000, 0, 0x10), node(0x1010, 1, 0x10)],
                edge_args: vec![branch(1, 1, 100)],
            }],
            inter_edge_args: vec![],
        });
        let foo_cfg = program_cfg.cfg_by_index(0).unwrap();
        assert_eq!(get_forced_edges(foo_cfg), BTreeMap::from([(1, 1)]));
        assert!(get_forced_paths(foo_cfg).is_empty());
    }

    #[test]
    fn test_init_node_chains_creates_bundles_for_loop() {
        let program_cfg = build_from_cfg_arg(loop_no_entry_no_exit_arg());
        let mut chain_builder = builder_for::<IterativeAssemblyQueue>(
            &program_cfg,
            &[0],
            &CodeLayoutParams::default(),
        );
        chain_builder.init_node_chains();

        // The forced path [1, 2] forms one bundled chain; the cold entry
        // is anchored in its own chain; block 3 stays out entirely.
        let chains = chain_builder.chains();
        assert_eq!(
            chains.keys().copied().collect::<Vec<_>>(),
            vec![chain_id(0, 0), chain_id(0, 1)]
        );
        assert_eq!(bb_indexes(&chains[&chain_id(0, 0)]), vec![0]);
        assert_eq!(bb_indexes(&chains[&chain_id(0, 1)]), vec![1, 2]);
        assert_eq!(chains[&chain_id(0, 1)].node_bundles().len(), 1);
    }

    #[test]
    fn test_init_chain_edges() {
        let program_cfg = build_from_cfg_arg(conditionals_join_arg());
        let mut chain_builder = builder_for::<IterativeAssemblyQueue>(
            &program_cfg,
            &[10],
            &CodeLayoutParams::default(),
        );
        chain_builder.init_node_chains();
        chain_builder.init_chain_edges();
        let chains = chain_builder.chains();

        let out_ids = |bb: usize| -> Vec<InterCfgId> {
            chains[&chain_id(10, bb)]
                .inter_chain_out_edges()
                .keys()
                .copied()
                .collect()
        };
        assert_eq!(out_ids(0), vec![chain_id(10, 1), chain_id(10, 2)]);
        assert_eq!(out_ids(1), vec![chain_id(10, 2), chain_id(10, 3)]);
        assert_eq!(out_ids(2), vec![chain_id(10, 4)]);
        assert_eq!(out_ids(3), vec![chain_id(10, 4)]);
        assert!(chains[&chain_id(10, 4)].inter_chain_out_edges().is_empty());
        assert_eq!(
            chains[&chain_id(10, 4)]
                .inter_chain_in_edges()
                .iter()
                .copied()
                .collect::<Vec<_>>(),
            vec![chain_id(10, 2), chain_id(10, 3)]
        );
    }

    #[test]
    fn test_merge_chains_updates_chain_edges() {
        let program_cfg = build_from_cfg_arg(conditionals_join_arg());
        let mut chain_builder = builder_for::<IterativeAssemblyQueue>(
            &program_cfg,
            &[10],
            &CodeLayoutParams::default(),
        );
        chain_builder.init_node_chains();
        chain_builder.init_chain_edges();

        chain_builder.merge_chains(chain_id(10, 1), chain_id(10, 3));

        let chains = chain_builder.chains();
        assert_eq!(bb_indexes(&chains[&chain_id(10, 1)]), vec![1, 3]);
        // The 1 -> 3 edge became intra-chain, recorded on node 1's bundle.
        let merged = &chains[&chain_id(10, 1)];
        assert_eq!(merged.node_bundles().len(), 2);
        assert_eq!(merged.node_bundles()[0].intra_chain_out_edges().len(), 1);
        assert!(merged.node_bundles()[1].intra_chain_out_edges().is_empty());
        // Its outgoing edges now reach chains 2 (via 1) and 4 (via 3).
        assert_eq!(
            merged
                .inter_chain_out_edges()
                .keys()
                .copied()
                .collect::<Vec<_>>(),
            vec![chain_id(10, 2), chain_id(10, 4)]
        );
        // Chain 4 sees the merged chain as a predecessor instead of 3.
        assert_eq!(
            chains[&chain_id(10, 4)]
                .inter_chain_in_edges()
                .iter()
                .copied()
                .collect::<Vec<_>>(),
            vec![chain_id(10, 1), chain_id(10, 2)]
        );
    }

    #[test]
    fn test_merge_chains_with_su_assembly() {
        let program_cfg = build_from_cfg_arg(conditionals_join_arg());
        let mut chain_builder = builder_for::<IterativeAssemblyQueue>(
            &program_cfg,
            &[10],
            &CodeLayoutParams::default(),
        );
        chain_builder.init_node_chains();
        chain_builder.init_chain_edges();
        chain_builder.merge_chains(chain_id(10, 1), chain_id(10, 3));

        let assembly = NodeChainAssembly::build(
            chain_builder.node_to_bundle_mapper(),
            chain_builder.code_layout_scorer(),
            chain_builder.view(),
            &chain_builder.chains()[&chain_id(10, 1)],
            &chain_builder.chains()[&chain_id(10, 2)],
            AssemblyOptions::new(ChainMergeOrder::SU),
        )
        .unwrap();
        assert!(assembly.score_gain() > 0.0);
        chain_builder.merge_chains_with_assembly(assembly);

        let chains = chain_builder.chains();
        assert_eq!(bb_indexes(&chains[&chain_id(10, 1)]), vec![1, 3, 2]);
        assert_eq!(
            chains[&chain_id(10, 1)]
                .inter_chain_out_edges()
                .keys()
                .copied()
                .collect::<Vec<_>>(),
            vec![chain_id(10, 4)]
        );
        assert_eq!(
            chains[&chain_id(10, 4)]
                .inter_chain_in_edges()
                .iter()
                .copied()
                .collect::<Vec<_>>(),
            vec![chain_id(10, 1)]
        );
    }

    #[test]
    fn test_merge_chains_with_s2us1_assembly() {
        let program_cfg = build_from_cfg_arg(conditionals_join_arg());
        let mut chain_builder = builder_for::<IterativeAssemblyQueue>(
            &program_cfg,
            &[10],
            &CodeLayoutParams::default(),
        );
        chain_builder.init_node_chains();
        chain_builder.init_chain_edges();
        chain_builder.merge_chains(chain_id(10, 2), chain_id(10, 1));
        assert_eq!(
            bb_indexes(&chain_builder.chains()[&chain_id(10, 2)]),
            vec![2, 1]
        );

        let assembly = NodeChainAssembly::build(
            chain_builder.node_to_bundle_mapper(),
            chain_builder.code_layout_scorer(),
            chain_builder.view(),
            &chain_builder.chains()[&chain_id(10, 2)],
            &chain_builder.chains()[&chain_id(10, 3)],
            AssemblyOptions::new(ChainMergeOrder::S2US1).with_slice_pos(1),
        )
        .unwrap();

        // Slice indices in S2US1 order: S2 = [1], U = [3], S1 = [2].
        let expected_slices = [None, Some(0), Some(2), Some(1), None];
        for node in chain_builder.cfgs()[0].nodes() {
            let slice_index = chain_builder
                .node_to_bundle_mapper()
                .get(node.node_ref())
                .and_then(|mapping| assembly.find_slice_index(mapping));
            assert_eq!(slice_index, expected_slices[node.bb_index()]);
        }

        chain_builder.merge_chains_with_assembly(assembly);
        assert_eq!(
            bb_indexes(&chain_builder.chains()[&chain_id(10, 2)]),
            vec![1, 3, 2]
        );
    }

    #[test]
    fn test_assembly_rejects_entry_in_middle() {
        let program_cfg = build_from_cfg_arg(conditionals_join_arg());
        let mut chain_builder = builder_for::<IterativeAssemblyQueue>(
            &program_cfg,
            &[10],
            &CodeLayoutParams::default(),
        );
        chain_builder.init_node_chains();
        chain_builder.init_chain_edges();

        let result = NodeChainAssembly::build(
            chain_builder.node_to_bundle_mapper(),
            chain_builder.code_layout_scorer(),
            chain_builder.view(),
            &chain_builder.chains()[&chain_id(10, 1)],
            &chain_builder.chains()[&chain_id(10, 0)],
            AssemblyOptions::new(ChainMergeOrder::SU),
        );
        assert_eq!(
            result.unwrap_err().to_string(),
            "Assembly places the entry block in the middle."
        );
    }

    #[test]
    fn test_assembly_rejects_zero_score_gain() {
        let program_cfg = build_from_cfg_arg(conditionals_join_arg());
        let mut chain_builder = builder_for::<IterativeAssemblyQueue>(
            &program_cfg,
            &[10],
            &CodeLayoutParams::default(),
        );
        chain_builder.init_node_chains();
        chain_builder.init_chain_edges();

        // Chains 0 and 3 share no edge, so any merge gains nothing.
        let strict = NodeChainAssembly::build(
            chain_builder.node_to_bundle_mapper(),
            chain_builder.code_layout_scorer(),
            chain_builder.view(),
            &chain_builder.chains()[&chain_id(10, 0)],
            &chain_builder.chains()[&chain_id(10, 3)],
            AssemblyOptions::new(ChainMergeOrder::SU),
        );
        assert_eq!(
            strict.unwrap_err().to_string(),
            "Assembly has zero score gain."
        );

        let relaxed = NodeChainAssembly::build(
            chain_builder.node_to_bundle_mapper(),
            chain_builder.code_layout_scorer(),
            chain_builder.view(),
            &chain_builder.chains()[&chain_id(10, 0)],
            &chain_builder.chains()[&chain_id(10, 3)],
            AssemblyOptions::new(ChainMergeOrder::SU).allow_zero_score_gain(),
        );
        assert_eq!(relaxed.unwrap().score_gain(), 0.0);
    }

    // Every step of build_chains on the three-branch function.
    #[test]
    fn test_build_chains_three_branches_internal() {
        let program_cfg = build_from_cfg_arg(three_branches_arg());
        let mut chain_builder = builder_for::<IterativeAssemblyQueue>(
            &program_cfg,
            &[0],
            &CodeLayoutParams::default(),
        );
        chain_builder.init_node_chains();

        // The mutually-forced pairs come out bundled.
        let chains = chain_builder.chains();
        assert_eq!(
            chains.keys().copied().collect::<Vec<_>>(),
            vec![chain_id(0, 0), chain_id(0, 2), chain_id(0, 4), chain_id(0, 5)]
        );
        assert_eq!(bb_indexes(&chains[&chain_id(0, 0)]), vec![0, 1]);
        assert_eq!(chains[&chain_id(0, 0)].node_bundles().len(), 1);
        assert_eq!(bb_indexes(&chains[&chain_id(0, 2)]), vec![2, 3]);
        assert_eq!(chains[&chain_id(0, 2)].node_bundles().len(), 1);

        chain_builder.init_chain_edges();
        // (chain, inter-chain out edges, inter-chain in edges).
        let expected_edge_counts = [(0, 2, 0), (2, 0, 0), (4, 0, 1), (5, 0, 1)];
        for (bb_index, n_out, n_in) in expected_edge_counts {
            let chain = &chain_builder.chains()[&chain_id(0, bb_index)];
            assert_eq!(chain.inter_chain_out_edges().len(), n_out);
            assert_eq!(chain.inter_chain_in_edges().len(), n_in);
        }

        chain_builder.init_chain_assemblies();
        let mut merge_chain_count = 0;
        while let Some(best) = chain_builder.pop_best_assembly() {
            chain_builder.merge_chains_with_assembly(best);
            merge_chain_count += 1;
        }
        assert_eq!(merge_chain_count, 2);
        assert!(chain_builder.node_chain_assemblies().is_empty());

        // The branch tails join the entry chain; the detached hot pair
        // shares no chain edge and stays apart.
        assert_eq!(
            bb_indexes(&chain_builder.chains()[&chain_id(0, 0)]),
            vec![0, 1, 4, 5]
        );
        assert_eq!(
            bb_indexes(&chain_builder.chains()[&chain_id(0, 2)]),
            vec![2, 3]
        );

        chain_builder.coalesce_chains();
        assert_eq!(chain_builder.chains().len(), 1);
        assert_eq!(
            bb_indexes(&chain_builder.chains()[&chain_id(0, 0)]),
            vec![0, 1, 4, 5, 2, 3]
        );
    }

    #[test]
    fn test_build_chains_three_branches() {
        let program_cfg = build_from_cfg_arg(three_branches_arg());
        let chains = builder_for::<IterativeAssemblyQueue>(
            &program_cfg,
            &[0],
            &CodeLayoutParams::default(),
        )
        .build_chains();

        assert_eq!(chains.len(), 1);
        assert_eq!(bb_indexes(&chains[0]), vec![0, 1, 4, 5, 2, 3]);
    }

    #[test]
    fn test_both_queue_implementations_agree() {
        let program_cfg = build_from_cfg_arg(three_branches_arg());
        let params = CodeLayoutParams::default();
        let iterative: Vec<Vec<usize>> =
            builder_for::<IterativeAssemblyQueue>(&program_cfg, &[0], &params)
                .build_chains()
                .iter()
                .map(bb_indexes)
                .collect();
        let balanced: Vec<Vec<usize>> =
            builder_for::<BalancedTreeAssemblyQueue>(&program_cfg, &[0], &params)
                .build_chains()
                .iter()
                .map(bb_indexes)
                .collect();
        assert_eq!(iterative, balanced);
    }

    #[test]
    fn test_build_chains_is_deterministic() {
        let program_cfg = build_from_cfg_arg(conditionals_join_arg());
        let params = CodeLayoutParams::default();
        let first: Vec<Vec<usize>> =
            builder_for::<IterativeAssemblyQueue>(&program_cfg, &[10], &params)
                .build_chains()
                .iter()
                .map(bb_indexes)
                .collect();
        for _ in 0..10 {
            let again: Vec<Vec<usize>> =
                builder_for::<IterativeAssemblyQueue>(&program_cfg, &[10], &params)
                    .build_chains()
                    .iter()
                    .map(bb_indexes)
                    .collect();
            assert_eq!(first, again);
        }
    }

    #[test]
    fn test_cold_entry_keeps_its_own_chain() {
        let program_cfg = build_from_cfg_arg(loop_no_entry_no_exit_arg());
        let chains = builder_for::<IterativeAssemblyQueue>(
            &program_cfg,
            &[0],
            &CodeLayoutParams::default(),
        )
        .build_chains();

        // Function splitting keeps the cold entry chain apart from the
        // hot loop chain; block 3 belongs to the implicit cold chain.
        let orders: Vec<Vec<usize>> = chains.iter().map(bb_indexes).collect();
        assert_eq!(orders, vec![vec![0], vec![1, 2]]);
    }

    #[test]
    fn test_repacking_bundles_over_split_threshold() {
        let program_cfg = build_from_cfg_arg(three_branches_arg());
        let params = CodeLayoutParams {
            chain_split_threshold: 2,
            ..CodeLayoutParams::default()
        };
        let chains =
            builder_for::<IterativeAssemblyQueue>(&program_cfg, &[0], &params).build_chains();

        // The chain is far beyond the split threshold, so its bundles
        // collapse into one per function run.
        assert_eq!(chains.len(), 1);
        assert_eq!(chains[0].node_bundles().len(), 1);
    }

    #[test]
    fn test_score_additivity_across_merges() {
        let program_cfg = build_from_cfg_arg(conditionals_join_arg());
        let mut chain_builder = builder_for::<IterativeAssemblyQueue>(
            &program_cfg,
            &[10],
            &CodeLayoutParams::default(),
        );
        chain_builder.init_node_chains();
        chain_builder.init_chain_edges();
        chain_builder.init_chain_assemblies();

        while let Some(best) = chain_builder.pop_best_assembly() {
            let split_score = chain_builder.chains()[&best.split_chain()].score();
            let unsplit_score = chain_builder.chains()[&best.unsplit_chain()].score();
            let expected = split_score + unsplit_score + best.score_gain();
            let merger = if best.merge_order() == ChainMergeOrder::US2S1 {
                best.unsplit_chain()
            } else {
                best.split_chain()
            };
            chain_builder.merge_chains_with_assembly(best);
            let merged_score = chain_builder.chains()[&merger].score();
            assert!((merged_score - expected).abs() < 1e-9);
        }
        assert!(chain_builder.node_chain_assemblies().is_empty());
    }

    #[test]
    fn test_input_order_mode() {
        let program_cfg = build_from_cfg_arg(three_branches_arg());
        let params = CodeLayoutParams {
            reorder_hot_blocks: false,
            ..CodeLayoutParams::default()
        };
        let chains =
            builder_for::<IterativeAssemblyQueue>(&program_cfg, &[0], &params).build_chains();
        assert_eq!(chains.len(), 1);
        assert_eq!(bb_indexes(&chains[0]), vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_keeps_initial_chains_without_chain_split() {
        let program_cfg = build_from_cfg_arg(conditionals_join_arg());
        let params = CodeLayoutParams {
            chain_split: false,
            ..CodeLayoutParams::default()
        };
        let mut initial = crate::code_layout::BbChain::new(0);
        initial.bb_bundles.push(crate::code_layout::BbBundle {
            full_bb_ids: vec![
                crate::cfg::FullIntraCfgId {
                    bb_id: 0,
                    intra_cfg_id: IntraCfgId {
                        bb_index: 0,
                        clone_number: 0,
                    },
                },
                crate::cfg::FullIntraCfgId {
                    bb_id: 3,
                    intra_cfg_id: IntraCfgId {
                        bb_index: 3,
                        clone_number: 0,
                    },
                },
            ],
        });
        let cfgs = vec![program_cfg.cfg_by_index(10).unwrap()];
        let chains = NodeChainBuilder::<IterativeAssemblyQueue>::new(
            CodeLayoutScorer::new(&params),
            cfgs,
            HashMap::from([(10, vec![initial])]),
        )
        .build_chains();

        // The seeded [0, 3] bundle survives unbroken in the final chain.
        let all: Vec<usize> = chains
            .iter()
            .flat_map(|c| c.nodes())
            .map(|n: NodeRef| n.node_index)
            .collect();
        let pos_0 = all.iter().position(|&b| b == 0).unwrap();
        assert_eq!(all[pos_0 + 1], 3);
    }
}
