// SPDX-FileCopyrightText: 2025 The bblayout developers
// SPDX-License-Identifier: LGPL-3.0-only

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use crate::cfg::NodeRef;
    use crate::cfg_testutil::{build_from_cfg_arg, multi_function_arg};
    use crate::chain_assembly::IterativeAssemblyQueue;
    use crate::chain_builder::NodeChainBuilder;
    use crate::chain_cluster::{ChainCluster, ChainClusterBuilder};
    use crate::config::CodeLayoutParams;
    use crate::node_chain::NodeChain;
    use crate::program_cfg::{CfgRefs, ProgramCfg};
    use crate::scorer::CodeLayoutScorer;

    fn build_section_chains(program_cfg: &ProgramCfg, params: &CodeLayoutParams) -> Vec<NodeChain> {
        let mut chains = Vec::new();
        for cfg in program_cfg.cfgs() {
            if !cfg.is_hot() {
                continue;
            }
            chains.extend(
                NodeChainBuilder::<IterativeAssemblyQueue>::new(
                    CodeLayoutScorer::new(params),
                    vec![cfg],
                    HashMap::new(),
                )
                .build_chains(),
            );
        }
        chains
    }

    fn cluster_node_refs(cluster: &ChainCluster) -> Vec<(usize, usize)> {
        cluster
            .nodes()
            .map(|n: NodeRef| (n.function_index, n.node_index))
            .collect()
    }

    #[test]
    fn test_no_ordering_sorts_by_delegate_id() {
        let program_cfg = build_from_cfg_arg(multi_function_arg());
        let params = CodeLayoutParams::default();
        let chains = build_section_chains(&program_cfg, &params);
        let view = CfgRefs::new(program_cfg.cfgs());

        let clusters = ChainClusterBuilder::new(&params, &view, chains).build_clusters();
        // Without call-chain clustering every chain keeps its own cluster,
        // ordered by delegate id.
        assert_eq!(clusters.len(), 3);
        assert_eq!(cluster_node_refs(&clusters[0]), vec![(0, 0), (0, 1)]);
        assert_eq!(cluster_node_refs(&clusters[1]), vec![(1, 0), (1, 1)]);
        assert_eq!(cluster_node_refs(&clusters[2]), vec![(100, 0), (100, 1)]);
    }

    #[test]
    fn test_call_chain_clustering_merges_callee_behind_caller() {
        let program_cfg = build_from_cfg_arg(multi_function_arg());
        let params = CodeLayoutParams {
            call_chain_clustering: true,
            ..CodeLayoutParams::default()
        };
        let chains = build_section_chains(&program_cfg, &params);
        let view = CfgRefs::new(program_cfg.cfgs());

        let clusters = ChainClusterBuilder::new(&params, &view, chains).build_clusters();
        // foo's chain joins its dominant caller bar; qux stays alone and
        // leads by execution density.
        assert_eq!(clusters.len(), 2);
        assert_eq!(cluster_node_refs(&clusters[0]), vec![(100, 0), (100, 1)]);
        assert_eq!(
            cluster_node_refs(&clusters[1]),
            vec![(1, 0), (1, 1), (0, 0), (0, 1)]
        );
    }

    #[test]
    fn test_cold_relative_calls_do_not_merge() {
        let mut arg = multi_function_arg();
        // Make the call into foo cold relative to foo's entry.
        for edge in arg.inter_edge_args.iter_mut() {
            if edge.to_function_index == 0 {
                edge.weight = 9;
            }
        }
        // Keep foo hot on its own.
        arg.cfg_args[0].edge_args[0].weight = 100;
        let program_cfg = build_from_cfg_arg(arg);
        let params = CodeLayoutParams {
            call_chain_clustering: true,
            ..CodeLayoutParams::default()
        };
        let chains = build_section_chains(&program_cfg, &params);
        let view = CfgRefs::new(program_cfg.cfgs());

        let clusters = ChainClusterBuilder::new(&params, &view, chains).build_clusters();
        assert_eq!(clusters.len(), 3);
    }

    #[test]
    fn test_cluster_merge_respects_size_threshold() {
        let program_cfg = build_from_cfg_arg(multi_function_arg());
        let params = CodeLayoutParams {
            call_chain_clustering: true,
            // No cluster is small enough to be merged into.
            cluster_merge_size_threshold: 1,
            ..CodeLayoutParams::default()
        };
        let chains = build_section_chains(&program_cfg, &params);
        let view = CfgRefs::new(program_cfg.cfgs());

        let clusters = ChainClusterBuilder::new(&params, &view, chains).build_clusters();
        assert_eq!(clusters.len(), 3);
    }

    #[test]
    fn test_cluster_accounting() {
        let program_cfg = build_from_cfg_arg(multi_function_arg());
        let params = CodeLayoutParams {
            call_chain_clustering: true,
            ..CodeLayoutParams::default()
        };
        let chains = build_section_chains(&program_cfg, &params);
        let view = CfgRefs::new(program_cfg.cfgs());

        let clusters = ChainClusterBuilder::new(&params, &view, chains).build_clusters();
        let merged = &clusters[1];
        // bar (0x30 bytes) plus foo (0x20 bytes).
        assert_eq!(merged.size(), 0x50);
        assert_eq!(merged.freq(), 395);
        assert!(clusters[0].exec_density() > merged.exec_density());
    }
}
