// SPDX-FileCopyrightText: 2025 The bblayout developers
// SPDX-License-Identifier: LGPL-3.0-only

use std::collections::{BTreeMap, HashMap};

use crate::cfg::{InterCfgId, NodeRef};
use crate::config::CodeLayoutParams;
use crate::node_chain::NodeChain;
use crate::program_cfg::CfgRefs;

/// An ordered group of chains, the unit of inter-function ordering.
#[derive(Debug)]
pub struct ChainCluster {
    /// Id of the delegate chain the cluster was created from.
    id: InterCfgId,
    /// The chains of this cluster in their merged order.
    chains: Vec<NodeChain>,
    size: u64,
    freq: i64,
}

impl ChainCluster {
    pub fn new(chain: NodeChain) -> ChainCluster {
        ChainCluster {
            id: chain.id(),
            size: chain.size(),
            freq: chain.freq(),
            chains: vec![chain],
        }
    }

    pub fn id(&self) -> InterCfgId {
        self.id
    }

    pub fn chains(&self) -> &[NodeChain] {
        &self.chains
    }

    /// Total binary size of the cluster.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Total execution frequency of the cluster.
    pub fn freq(&self) -> i64 {
        self.freq
    }

    pub fn exec_density(&self) -> f64 {
        self.freq as f64 / std::cmp::max(self.size, 1) as f64
    }

    /// Appends the chains of `other` to this cluster, consuming it.
    pub fn merge_with(&mut self, mut other: ChainCluster) {
        self.chains.append(&mut other.chains);
        self.size += other.size;
        self.freq += other.freq;
    }

    /// Iterates over all nodes of the cluster in layout order.
    pub fn nodes(&self) -> impl Iterator<Item = NodeRef> + '_ {
        self.chains.iter().flat_map(|chain| chain.nodes())
    }
}

/// Orders chains of one section against one another with call-chain
/// clustering: every chain starts as its own cluster, and hot chains are
/// merged behind their most likely caller cluster, in decreasing order of
/// execution density.
pub struct ChainClusterBuilder<'a, 'v> {
    params: &'a CodeLayoutParams,
    view: &'a CfgRefs<'v>,
    clusters: BTreeMap<InterCfgId, ChainCluster>,
    /// Chain id -> id of the cluster currently containing it.
    cluster_of_chain: HashMap<InterCfgId, InterCfgId>,
    /// Any chained node -> its chain id.
    chain_of_node: HashMap<NodeRef, InterCfgId>,
}

impl<'a, 'v> ChainClusterBuilder<'a, 'v> {
    pub fn new(
        params: &'a CodeLayoutParams,
        view: &'a CfgRefs<'v>,
        chains: Vec<NodeChain>,
    ) -> ChainClusterBuilder<'a, 'v> {
        let mut clusters = BTreeMap::new();
        let mut cluster_of_chain = HashMap::new();
        let mut chain_of_node = HashMap::new();
        for chain in chains {
            for node in chain.nodes() {
                chain_of_node.insert(node, chain.id());
            }
            cluster_of_chain.insert(chain.id(), chain.id());
            clusters.insert(chain.id(), ChainCluster::new(chain));
        }
        ChainClusterBuilder {
            params,
            view,
            clusters,
            cluster_of_chain,
            chain_of_node,
        }
    }

    /// Builds and returns the ordered clusters. Without call-chain
    /// clustering every chain stays its own cluster and clusters are
    /// simply ordered by their delegate id.
    pub fn build_clusters(mut self) -> Vec<ChainCluster> {
        if !self.params.call_chain_clustering {
            // Delegate-id order falls out of the BTreeMap.
            return self.clusters.into_values().collect();
        }
        self.merge_clusters();

        let mut clusters: Vec<ChainCluster> = self.clusters.into_values().collect();
        clusters.sort_by(|a, b| {
            b.exec_density()
                .total_cmp(&a.exec_density())
                .then_with(|| a.id().cmp(&b.id()))
        });
        clusters
    }

    fn merge_clusters(&mut self) {
        // Hot chains in decreasing density order, ties on delegate id.
        let mut hot_chains: Vec<(f64, InterCfgId)> = self
            .clusters
            .values()
            .flat_map(|cluster| cluster.chains())
            .filter(|chain| chain.freq() != 0)
            .map(|chain| (chain.exec_density(), chain.id()))
            .collect();
        hot_chains.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.cmp(&b.1)));

        for (density, chain_id) in hot_chains {
            if density <= 0.005 {
                break;
            }
            let cluster_id = self.cluster_of_chain[&chain_id];
            // Very large clusters are left alone.
            if self.clusters[&cluster_id].size() > self.params.cluster_merge_size_threshold {
                continue;
            }
            let Some(predecessor_cluster_id) = self.most_likely_predecessor(chain_id, cluster_id)
            else {
                continue;
            };
            let absorbed = self.clusters.remove(&cluster_id).expect("cluster exists");
            for chain in absorbed.chains() {
                self.cluster_of_chain.insert(chain.id(), predecessor_cluster_id);
            }
            self.clusters
                .get_mut(&predecessor_cluster_id)
                .expect("predecessor cluster exists")
                .merge_with(absorbed);
        }
    }

    /// Finds the cluster sending the most call flow into `chain_id`,
    /// subject to the coldness and density-degradation guards. Ties break
    /// on the smaller cluster id.
    fn most_likely_predecessor(
        &self,
        chain_id: InterCfgId,
        cluster_id: InterCfgId,
    ) -> Option<InterCfgId> {
        let cluster = &self.clusters[&cluster_id];
        let mut weight_by_cluster: BTreeMap<InterCfgId, i64> = BTreeMap::new();

        let chain = self
            .clusters[&cluster_id]
            .chains()
            .iter()
            .find(|c| c.id() == chain_id)
            .expect("chain lives in its recorded cluster");

        for node_ref in chain.nodes() {
            let node = self.view.node(node_ref);
            if !self.params.inter_function_reordering && !node.is_entry() {
                continue;
            }
            let node_frequency = self.view.node_frequency(node_ref);
            let cfg = self
                .view
                .cfg(node_ref.function_index)
                .expect("chained nodes come from the section's CFGs");

            let mut consider = |weight: i64, is_return: bool, src: NodeRef| {
                if weight == 0 || is_return {
                    return;
                }
                let Some(&caller_chain_id) = self.chain_of_node.get(&src) else {
                    return;
                };
                if caller_chain_id == chain_id {
                    return;
                }
                let caller_cluster_id = self.cluster_of_chain[&caller_chain_id];
                if caller_cluster_id == cluster_id {
                    return;
                }
                let caller_cluster = &self.clusters[&caller_cluster_id];
                if caller_cluster.size() > self.params.cluster_merge_size_threshold {
                    return;
                }
                // Calls which are cold relative to the callee.
                if weight * 10 < node_frequency {
                    return;
                }
                // Do not merge if the caller cluster's density would
                // degrade by more than 1/8.
                if (8 * caller_cluster.size() as i128
                    * caller_cluster.freq() as i128
                    * cluster.freq() as i128)
                    < (caller_cluster.freq() as i128
                        * (cluster.size() + caller_cluster.size()) as i128)
                {
                    return;
                }
                *weight_by_cluster.entry(caller_cluster_id).or_insert(0) += weight;
            };

            for &e in node.intra_in() {
                let edge = cfg.intra_edge(e);
                consider(edge.weight(), edge.is_return(), edge.src());
            }
            for &e in node.inter_in() {
                let Some(edge) = self.view.inter_edge(e) else {
                    continue;
                };
                consider(edge.weight(), edge.is_return(), edge.src());
            }
        }

        weight_by_cluster
            .into_iter()
            .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(&a.0)))
            .map(|(id, _)| id)
    }
}
