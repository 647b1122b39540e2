// SPDX-FileCopyrightText: 2025 The bblayout developers
// SPDX-License-Identifier: LGPL-3.0-only

use std::collections::BTreeMap;
use std::io::Write;

use crate::cfg::ControlFlowGraph;
use crate::code_layout::SectionLayoutInfo;
use crate::program_cfg::ProgramCfg;

/// Version of the cluster-file encoding. Version 1 adds module names and
/// cloned-path entries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClusterEncodingVersion {
    V0,
    V1,
}

/// The specifier tokens of one cluster-file version.
#[derive(Clone, Debug)]
pub struct ProfileEncoding {
    pub version: ClusterEncodingVersion,
    pub version_specifier: &'static str,
    pub function_name_specifier: &'static str,
    pub function_name_separator: &'static str,
    pub module_name_specifier: &'static str,
    pub cluster_specifier: &'static str,
    pub clone_path_specifier: &'static str,
}

impl ProfileEncoding {
    pub fn v0() -> ProfileEncoding {
        ProfileEncoding {
            version: ClusterEncodingVersion::V0,
            version_specifier: "",
            function_name_specifier: "!",
            function_name_separator: "/",
            module_name_specifier: " M=",
            cluster_specifier: "!!",
            clone_path_specifier: "!!!",
        }
    }

    pub fn v1() -> ProfileEncoding {
        ProfileEncoding {
            version: ClusterEncodingVersion::V1,
            version_specifier: "v1",
            function_name_specifier: "!",
            function_name_separator: "/",
            module_name_specifier: "m=",
            cluster_specifier: "!!",
            clone_path_specifier: "!!!",
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ProfileWriterOptions {
    /// Emit `#section` markers and per-function score comments.
    pub verbose_cluster_output: bool,
    /// Emit one `#cfg` edge-profile line per function.
    pub write_cfg_profile: bool,
}

/// Writes the cluster file and the symbol-order file for a set of section
/// layouts.
pub struct ProfileWriter<'a> {
    program_cfg: &'a ProgramCfg,
    encoding: ProfileEncoding,
    options: ProfileWriterOptions,
}

impl<'a> ProfileWriter<'a> {
    pub fn new(
        program_cfg: &'a ProgramCfg,
        encoding: ProfileEncoding,
        options: ProfileWriterOptions,
    ) -> ProfileWriter<'a> {
        ProfileWriter {
            program_cfg,
            encoding,
            options,
        }
    }

    pub fn write(
        &self,
        layouts_by_section_name: &BTreeMap<String, SectionLayoutInfo>,
        cluster_out: &mut impl Write,
        symbol_order_out: &mut impl Write,
    ) -> std::io::Result<()> {
        if self.encoding.version != ClusterEncodingVersion::V0 {
            writeln!(cluster_out, "{}", self.encoding.version_specifier)?;
        }
        for (section_name, section_layout_info) in layouts_by_section_name {
            if self.options.verbose_cluster_output {
                writeln!(cluster_out, "#section {}", section_name)?;
            }
            let total_chains: usize = section_layout_info
                .layouts_by_function_index
                .values()
                .map(|info| info.bb_chains.len())
                .sum();
            // One symbol per chain; a chain starting at the function entry
            // is addressed by the function name alone, any other chain
            // needs its part number.
            let mut symbol_order: Vec<Option<(&[String], Option<usize>)>> =
                vec![None; total_chains];
            let mut cold_symbol_order: Vec<Option<usize>> =
                vec![None; section_layout_info.layouts_by_function_index.len()];

            for (function_index, info) in &section_layout_info.layouts_by_function_index {
                let cfg = self
                    .program_cfg
                    .cfg_by_index(*function_index)
                    .expect("layouts refer to existing functions");
                if self.encoding.version == ClusterEncodingVersion::V1 {
                    if let Some(module_name) = cfg.module_name() {
                        writeln!(
                            cluster_out,
                            "{}{}",
                            self.encoding.module_name_specifier, module_name
                        )?;
                    }
                }
                write!(
                    cluster_out,
                    "{}{}",
                    self.encoding.function_name_specifier,
                    cfg.names().join(self.encoding.function_name_separator)
                )?;
                if self.encoding.version == ClusterEncodingVersion::V0 {
                    if let Some(module_name) = cfg.module_name() {
                        write!(
                            cluster_out,
                            "{}{}",
                            self.encoding.module_name_specifier, module_name
                        )?;
                    }
                }
                writeln!(cluster_out)?;

                if !cfg.clone_paths().is_empty() {
                    assert_eq!(
                        self.encoding.version,
                        ClusterEncodingVersion::V1,
                        "cloning is not supported by this encoding version"
                    );
                }
                for clone_path in cfg.clone_paths() {
                    let bb_ids: Vec<String> = clone_path
                        .iter()
                        .map(|&node_index| cfg.node(node_index).bb_id().to_string())
                        .collect();
                    writeln!(
                        cluster_out,
                        "{}{}",
                        self.encoding.clone_path_specifier,
                        bb_ids.join(" ")
                    )?;
                }
                if self.options.verbose_cluster_output {
                    writeln!(
                        cluster_out,
                        "#ext-tsp score: [intra: {:.6} -> {:.6}] [inter: {:.6} -> {:.6}]",
                        info.original_score.intra_score,
                        info.optimized_score.intra_score,
                        info.original_score.inter_out_score,
                        info.optimized_score.inter_out_score
                    )?;
                }
                for (chain_id, chain) in info.bb_chains.iter().enumerate() {
                    let bb_ids_in_chain = chain.all_bbs();
                    symbol_order[chain.layout_index] = Some((
                        cfg.names(),
                        if bb_ids_in_chain[0].intra_cfg_id.bb_index == 0 {
                            None
                        } else {
                            Some(chain_id)
                        },
                    ));
                    for (bbi, full_bb_id) in bb_ids_in_chain.iter().enumerate() {
                        if bbi == 0 {
                            write!(cluster_out, "{}", self.encoding.cluster_specifier)?;
                        } else {
                            write!(cluster_out, " ")?;
                        }
                        write!(cluster_out, "{}", full_bb_id.profile_bb_id())?;
                    }
                    writeln!(cluster_out)?;
                }
                if self.options.write_cfg_profile {
                    self.write_cfg_profile(cfg, cluster_out)?;
                }
                cold_symbol_order[info.cold_chain_layout_index] = Some(*function_index);
            }

            for entry in symbol_order.into_iter().flatten() {
                let (function_names, chain_id) = entry;
                // Emit every alias so the order holds regardless of which
                // name the compiler picks.
                for function_name in function_names {
                    symbol_order_out.write_all(function_name.as_bytes())?;
                    if let Some(chain_id) = chain_id {
                        write!(symbol_order_out, ".__part.{}", chain_id)?;
                    }
                    writeln!(symbol_order_out)?;
                }
            }

            // The .cold symbols of hot functions with chainless blocks.
            for function_index in cold_symbol_order.into_iter().flatten() {
                let info = &section_layout_info.layouts_by_function_index[&function_index];
                let cfg = self
                    .program_cfg
                    .cfg_by_index(function_index)
                    .expect("layouts refer to existing functions");
                let n_bbs_in_chains: usize =
                    info.bb_chains.iter().map(|chain| chain.n_bbs()).sum();
                if n_bbs_in_chains == cfg.nodes().len() {
                    continue;
                }
                // The entry node always begins its chain, so checking the
                // chain heads suffices.
                let entry_is_in_chains = info
                    .bb_chains
                    .iter()
                    .any(|chain| chain.first_bb().intra_cfg_id.bb_index == 0);
                for function_name in cfg.names() {
                    symbol_order_out.write_all(function_name.as_bytes())?;
                    // Without the entry among the chains the function name
                    // itself addresses the cold part.
                    if entry_is_in_chains {
                        write!(symbol_order_out, ".cold")?;
                    }
                    writeln!(symbol_order_out)?;
                }
            }
        }
        Ok(())
    }

    /// Writes the intra-function edge profile of `cfg` as a single line
    /// starting with the `#cfg` marker:
    /// `<bb>:<bb_freq>,<succ_bb>:<edge_freq>,...` per hot node. The edge
    /// weights may not precisely add up to the node frequency.
    pub fn write_cfg_profile(
        &self,
        cfg: &ControlFlowGraph,
        out: &mut impl Write,
    ) -> std::io::Result<()> {
        let view = self.program_cfg.view();
        write!(out, "#cfg")?;
        for node in cfg.nodes() {
            let node_frequency = view.node_frequency(node.node_ref());
            if node_frequency == 0 {
                continue;
            }
            write!(
                out,
                " {}:{}",
                node.full_intra_cfg_id().profile_bb_id(),
                node_frequency
            )?;
            // Out edges in a fixed order; the arena order of the edge
            // lists is a construction artifact.
            let mut branch_edges: Vec<usize> = node
                .intra_out()
                .iter()
                .copied()
                .filter(|&e| cfg.intra_edge(e).is_branch_or_fallthrough())
                .collect();
            branch_edges
                .sort_by_key(|&e| cfg.node(cfg.intra_edge(e).sink().node_index).intra_cfg_id());
            for e in branch_edges {
                let edge = cfg.intra_edge(e);
                write!(
                    out,
                    ",{}:{}",
                    cfg.node(edge.sink().node_index)
                        .full_intra_cfg_id()
                        .profile_bb_id(),
                    edge.weight()
                )?;
            }
        }
        writeln!(out)
    }
}
