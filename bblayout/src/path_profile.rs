// SPDX-FileCopyrightText: 2025 The bblayout developers
// SPDX-License-Identifier: LGPL-3.0-only

use std::collections::BTreeMap;

/// A block identified by its function and flat (original) block index.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlatBbHandle {
    pub function_index: usize,
    pub flat_bb_index: usize,
}

/// One observed call site effect: the callee entered (if known) and the
/// block the control flow returned to (if known).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallRetInfo {
    pub callee: Option<usize>,
    pub return_bb: Option<FlatBbHandle>,
}

/// Flow observed through one path node for a single path predecessor.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PathPredInfoEntry {
    pub freq: i64,
    /// Cache pressure induced when this block is cloned for this
    /// predecessor.
    pub cache_pressure: f64,
    pub call_freqs: BTreeMap<CallRetInfo, i64>,
    pub return_to_freqs: BTreeMap<FlatBbHandle, i64>,
}

/// Per-path-predecessor flow records of one path node, plus the entry for
/// flow whose predecessor could not be determined.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PathPredInfo {
    pub entries: BTreeMap<usize, PathPredInfoEntry>,
    pub missing_pred_entry: PathPredInfoEntry,
}

impl PathPredInfo {
    pub fn entry(&self, path_pred_bb_index: usize) -> Option<&PathPredInfoEntry> {
        self.entries.get(&path_pred_bb_index)
    }
}

/// A node of the path-profile tree. Children are keyed (and owned) by
/// their successor block index; the tree is acyclic by construction.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PathNode {
    node_bb_index: usize,
    path_pred_info: PathPredInfo,
    children: BTreeMap<usize, PathNode>,
}

impl PathNode {
    pub fn new(node_bb_index: usize, path_pred_info: PathPredInfo) -> PathNode {
        PathNode {
            node_bb_index,
            path_pred_info,
            children: BTreeMap::new(),
        }
    }

    pub fn node_bb_index(&self) -> usize {
        self.node_bb_index
    }

    pub fn path_pred_info(&self) -> &PathPredInfo {
        &self.path_pred_info
    }

    pub fn children(&self) -> &BTreeMap<usize, PathNode> {
        &self.children
    }

    pub fn child(&self, bb_index: usize) -> Option<&PathNode> {
        self.children.get(&bb_index)
    }

    pub fn add_child(&mut self, child: PathNode) -> &mut PathNode {
        let bb_index = child.node_bb_index;
        self.children.entry(bb_index).or_insert(child)
    }

    /// The aggregate frequency flowing from this node into its children,
    /// for the given path predecessor.
    pub fn total_children_freq_for_path_pred(&self, path_pred_bb_index: usize) -> i64 {
        self.children
            .values()
            .filter_map(|child| child.path_pred_info.entry(path_pred_bb_index))
            .map(|entry| entry.freq)
            .sum()
    }
}

/// The path profile of one function: a tree of observed hot paths per
/// root block.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FunctionPathProfile {
    function_index: usize,
    path_trees_by_root_bb_index: BTreeMap<usize, PathNode>,
}

impl FunctionPathProfile {
    pub fn new(
        function_index: usize,
        path_trees_by_root_bb_index: BTreeMap<usize, PathNode>,
    ) -> FunctionPathProfile {
        for (root_bb_index, tree) in path_trees_by_root_bb_index.iter() {
            assert_eq!(*root_bb_index, tree.node_bb_index());
        }
        FunctionPathProfile {
            function_index,
            path_trees_by_root_bb_index,
        }
    }

    pub fn function_index(&self) -> usize {
        self.function_index
    }

    pub fn path_trees_by_root_bb_index(&self) -> &BTreeMap<usize, PathNode> {
        &self.path_trees_by_root_bb_index
    }

    pub fn path_tree(&self, root_bb_index: usize) -> Option<&PathNode> {
        self.path_trees_by_root_bb_index.get(&root_bb_index)
    }
}

/// Path profiles of all functions, keyed by function index.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProgramPathProfile {
    path_profiles_by_function_index: BTreeMap<usize, FunctionPathProfile>,
}

impl ProgramPathProfile {
    pub fn new(
        path_profiles_by_function_index: BTreeMap<usize, FunctionPathProfile>,
    ) -> ProgramPathProfile {
        ProgramPathProfile {
            path_profiles_by_function_index,
        }
    }

    pub fn path_profiles_by_function_index(&self) -> &BTreeMap<usize, FunctionPathProfile> {
        &self.path_profiles_by_function_index
    }

    pub fn path_profile(&self, function_index: usize) -> Option<&FunctionPathProfile> {
        self.path_profiles_by_function_index.get(&function_index)
    }
}

/// A candidate cloning: the path from its tree root (excluding the path
/// predecessor) together with the predecessor block that gates it.
#[derive(Clone, Debug)]
pub struct PathCloning<'p> {
    /// The path nodes from the tree root down to the last cloned block.
    pub path: Vec<&'p PathNode>,
    pub function_index: usize,
    pub path_pred_bb_index: usize,
}

impl<'p> PathCloning<'p> {
    pub fn last(&self) -> &'p PathNode {
        self.path.last().expect("cloning paths are never empty")
    }

    /// The bb indices of the cloning including the path predecessor.
    pub fn full_path(&self) -> Vec<usize> {
        let mut full = Vec::with_capacity(self.path.len() + 1);
        full.push(self.path_pred_bb_index);
        full.extend(self.path.iter().map(|node| node.node_bb_index()));
        full
    }

    /// The bb indices to clone (excluding the path predecessor).
    pub fn path_bb_indexes(&self) -> Vec<usize> {
        self.path.iter().map(|node| node.node_bb_index()).collect()
    }

    /// A total order key for deterministic tie-breaks.
    pub fn sort_key(&self) -> (usize, usize, Vec<usize>) {
        (
            self.function_index,
            self.path_pred_bb_index,
            self.path_bb_indexes(),
        )
    }
}

impl PartialEq for PathCloning<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.sort_key() == other.sort_key()
    }
}

impl Eq for PathCloning<'_> {}
