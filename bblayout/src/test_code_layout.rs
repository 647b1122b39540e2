// SPDX-FileCopyrightText: 2025 The bblayout developers
// SPDX-License-Identifier: LGPL-3.0-only

#[cfg(test)]
mod tests {
    use crate::cfg_testutil::{
        branch, build_from_cfg_arg, landing_pads_arg, loop_no_entry_no_exit_arg,
        multi_function_arg, node, three_branches_arg, CfgArg, MultiCfgArg,
    };
    use crate::code_layout::{generate_layout_by_section, CodeLayout, FunctionChainInfo};
    use crate::config::CodeLayoutParams;

    fn chain_bb_ids(info: &FunctionChainInfo) -> Vec<Vec<usize>> {
        info.bb_chains
            .iter()
            .map(|chain| chain.all_bbs().iter().map(|id| id.bb_id).collect())
            .collect()
    }

    fn bundle_bb_ids(info: &FunctionChainInfo) -> Vec<Vec<Vec<usize>>> {
        info.bb_chains
            .iter()
            .map(|chain| {
                chain
                    .bb_bundles
                    .iter()
                    .map(|bundle| bundle.full_bb_ids.iter().map(|id| id.bb_id).collect())
                    .collect()
            })
            .collect()
    }

    #[test]
    fn test_three_branches_layout() {
        let program_cfg = build_from_cfg_arg(three_branches_arg());
        let all_chain_info = CodeLayout::new(
            &CodeLayoutParams::default(),
            program_cfg.cfgs().collect(),
        )
        .order_all();

        assert_eq!(all_chain_info.len(), 1);
        let info = &all_chain_info[0];
        assert_eq!(info.function_index, 0);
        // The hot chain {0, 1, 4, 5} and the detached pair {2, 3} are
        // coalesced in that relative order.
        assert_eq!(chain_bb_ids(info), vec![vec![0, 1, 4, 5, 2, 3]]);
        assert_eq!(
            bundle_bb_ids(info),
            vec![vec![vec![0, 1], vec![4], vec![5], vec![2, 3]]]
        );
        // The entry block leads the first chain.
        assert_eq!(info.bb_chains[0].first_bb().intra_cfg_id.bb_index, 0);
        // The new layout improves the score.
        assert!(info.optimized_score.intra_score > info.original_score.intra_score);
    }

    #[test]
    fn test_loop_layout_excludes_cold_block() {
        let program_cfg = build_from_cfg_arg(loop_no_entry_no_exit_arg());
        let all_chain_info = CodeLayout::new(
            &CodeLayoutParams::default(),
            program_cfg.cfgs().collect(),
        )
        .order_all();

        assert_eq!(all_chain_info.len(), 1);
        let info = &all_chain_info[0];
        // The cold entry anchors the function, the loop body follows as
        // its own bundle; block 3 stays in the implicit cold chain.
        assert_eq!(bundle_bb_ids(info), vec![vec![vec![0], vec![1, 2]]]);
        assert!(chain_bb_ids(info)
            .iter()
            .all(|chain| !chain.contains(&3)));
    }

    #[test]
    fn test_hot_landing_pad_is_embedded_cold_one_excluded() {
        let program_cfg = build_from_cfg_arg(landing_pads_arg());
        assert_eq!(program_cfg.cfg_by_index(0).unwrap().n_landing_pads(), 2);
        let all_chain_info = CodeLayout::new(
            &CodeLayoutParams::default(),
            program_cfg.cfgs().collect(),
        )
        .order_all();

        assert_eq!(all_chain_info.len(), 1);
        let info = &all_chain_info[0];
        // The hot landing pad (block 2) sits inside the chain, the cold
        // one (block 3) does not appear at all.
        assert_eq!(bundle_bb_ids(info), vec![vec![vec![0, 1], vec![2], vec![4, 5]]]);
    }

    #[test]
    fn test_multi_function_layout_with_clustering() {
        let program_cfg = build_from_cfg_arg(multi_function_arg());
        let params = CodeLayoutParams {
            call_chain_clustering: true,
            ..CodeLayoutParams::default()
        };
        let (layouts, stats) = generate_layout_by_section(&program_cfg, &params);

        assert_eq!(layouts.len(), 1);
        let section = &layouts[".text"];
        // baz is cold and gets no layout at all.
        assert_eq!(
            section.layouts_by_function_index.keys().copied().collect::<Vec<_>>(),
            vec![0, 1, 100]
        );
        // Global order: qux first (densest cluster), then bar, then foo
        // merged behind its caller.
        let foo = &section.layouts_by_function_index[&0];
        let bar = &section.layouts_by_function_index[&1];
        let qux = &section.layouts_by_function_index[&100];
        assert_eq!(qux.bb_chains[0].layout_index, 0);
        assert_eq!(bar.bb_chains[0].layout_index, 1);
        assert_eq!(foo.bb_chains[0].layout_index, 2);
        // Cold chains mirror the first-seen hot order.
        assert_eq!(qux.cold_chain_layout_index, 0);
        assert_eq!(bar.cold_chain_layout_index, 1);
        assert_eq!(foo.cold_chain_layout_index, 2);

        assert!(stats.optimized_intra_score >= stats.original_intra_score);
        assert_eq!(stats.n_chains_built, 3);
    }

    #[test]
    fn test_no_reorder_no_split_keeps_input_order() {
        let program_cfg = build_from_cfg_arg(landing_pads_arg());
        let params = CodeLayoutParams {
            reorder_hot_blocks: false,
            split_functions: false,
            ..CodeLayoutParams::default()
        };
        let all_chain_info =
            CodeLayout::new(&params, program_cfg.cfgs().collect()).order_all();

        assert_eq!(all_chain_info.len(), 1);
        // Hot blocks keep their input order; the cold block follows in a
        // separate bundle of the same chain.
        assert_eq!(
            bundle_bb_ids(&all_chain_info[0]),
            vec![vec![vec![0, 1, 2, 4, 5], vec![3]]]
        );
    }

    #[test]
    fn test_inter_function_reordering_places_blocks_before_entry() {
        let program_cfg = build_from_cfg_arg(MultiCfgArg {
            cfg_args: vec![CfgArg {
                section_name: ".foo_section",
                function_index: 0,
                function_name: "foo",
                node_args: vec![
                    node(0x1000, 0, 0x10),
                    node(0x1010, 1, 0x7),
                    node(0x1017, 2, 0x40),
                    node(0x1057, 3, 0x8),
                ],
                edge_args: vec![
                    branch(0, 1, 20),
                    branch(0, 3, 10),
                    branch(1, 2, 30),
                    branch(2, 1, 40),
                ],
            }],
            inter_edge_args: vec![],
        });
        let params = CodeLayoutParams {
            inter_function_reordering: true,
            ..CodeLayoutParams::default()
        };
        let all_chain_info =
            CodeLayout::new(&params, program_cfg.cfgs().collect()).order_all();

        assert_eq!(all_chain_info.len(), 1);
        let info = &all_chain_info[0];
        // Block 3 is laid out before the function entry; the emitted
        // chains split at the entry block, which still leads a chain.
        assert_eq!(
            bundle_bb_ids(info),
            vec![vec![vec![0], vec![1, 2]], vec![vec![3]]]
        );
        assert_eq!(info.bb_chains[0].layout_index, 1);
        assert_eq!(info.bb_chains[1].layout_index, 0);
    }

    #[test]
    fn test_entry_block_first_in_intra_function_ordering() {
        let program_cfg = build_from_cfg_arg(MultiCfgArg {
            cfg_args: vec![CfgArg {
                section_name: ".foo_section",
                function_index: 0,
                function_name: "foo",
                node_args: vec![
                    node(0x1000, 0, 0x10),
                    node(0x1010, 1, 0x7),
                    node(0x1017, 2, 0x40),
                    node(0x1057, 3, 0x8),
                ],
                edge_args: vec![
                    branch(0, 1, 20),
                    branch(0, 3, 10),
                    branch(1, 2, 30),
                    branch(2, 1, 40),
                ],
            }],
            inter_edge_args: vec![],
        });
        let all_chain_info = CodeLayout::new(
            &CodeLayoutParams::default(),
            program_cfg.cfgs().collect(),
        )
        .order_all();

        assert_eq!(all_chain_info.len(), 1);
        let info = &all_chain_info[0];
        assert_eq!(info.bb_chains.len(), 1);
        assert_eq!(info.bb_chains[0].first_bb().intra_cfg_id.bb_index, 0);
        assert!(info.optimized_score.intra_score >= info.original_score.intra_score);
    }

    #[test]
    fn test_layout_is_deterministic() {
        let program_cfg = build_from_cfg_arg(multi_function_arg());
        let params = CodeLayoutParams {
            call_chain_clustering: true,
            ..CodeLayoutParams::default()
        };
        let (first, _) = generate_layout_by_section(&program_cfg, &params);
        for _ in 0..5 {
            let (again, _) = generate_layout_by_section(&program_cfg, &params);
            assert_eq!(first, again);
        }
    }
}
