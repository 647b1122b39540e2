// SPDX-FileCopyrightText: 2025 The bblayout developers
// SPDX-License-Identifier: LGPL-3.0-only

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::Display,
};

/// KeyType -> { CellType } data structure
#[derive(Clone, Debug, Default)]
pub struct SetMap<KeyType, CellType>
where
    KeyType: Ord,
{
    map: BTreeMap<KeyType, BTreeSet<CellType>>,
}

impl<KeyType, CellType> Display for SetMap<KeyType, CellType>
where
    KeyType: Ord,
    KeyType: Display,
    CellType: Display,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (k, set) in self.map.iter() {
            writeln!(f, "{}", k)?;
            for v in set.iter() {
                writeln!(f, "\t->{}", v)?;
            }
        }
        writeln!(f)
    }
}

impl<KeyType, CellType> SetMap<KeyType, CellType>
where
    KeyType: Ord,
    CellType: Ord,
{
    pub fn new() -> SetMap<KeyType, CellType> {
        SetMap {
            map: BTreeMap::new(),
        }
    }

    pub fn get<'a>(&'a self, id: &KeyType) -> Option<&'a BTreeSet<CellType>> {
        self.map.get(id)
    }

    pub fn insert(&mut self, id: KeyType, val: CellType) {
        if let Some(id_set) = self.map.get_mut(&id) {
            id_set.insert(val);
            return;
        }
        let mut new_set = BTreeSet::<CellType>::new();
        new_set.insert(val);
        self.map.insert(id, new_set);
    }

    pub fn remove(&mut self, id: &KeyType, val: &CellType) {
        if let Some(id_set) = self.map.get_mut(id) {
            id_set.remove(val);
        }
    }

    pub fn extend(&mut self, id: KeyType, set: BTreeSet<CellType>) {
        if let Some(id_set) = self.map.get_mut(&id) {
            id_set.extend(set);
            return;
        }
        self.map.insert(id, set);
    }

    pub fn contains(&self, id: &KeyType, val: &CellType) -> bool {
        self.map.get(id).is_some_and(|set| set.contains(val))
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn len_of(&self, id: &KeyType) -> usize {
        if let Some(set) = self.map.get(id) {
            return set.len();
        }
        0
    }

    pub fn iter(&self) -> std::collections::btree_map::Iter<'_, KeyType, BTreeSet<CellType>> {
        self.map.iter()
    }

    pub fn set_iter<'a>(
        &'a self,
        id: &KeyType,
    ) -> Option<std::collections::btree_set::Iter<'a, CellType>> {
        if let Some(set) = self.map.get(id) {
            return Some(set.iter());
        }
        None
    }
}

impl<KeyType, CellType> PartialEq for SetMap<KeyType, CellType>
where
    KeyType: Ord,
    CellType: Ord,
{
    fn eq(&self, other: &Self) -> bool {
        self.map == other.map
    }
}
