// SPDX-FileCopyrightText: 2025 The bblayout developers
// SPDX-License-Identifier: LGPL-3.0-only

use std::collections::BTreeMap;

/// KeyType -> [ CellType ] data structure.
/// Values of a key keep their insertion order.
#[derive(Clone, Debug, Default)]
pub struct VecMap<KeyType, CellType>
where
    KeyType: Ord,
{
    map: BTreeMap<KeyType, Vec<CellType>>,
}

impl<KeyType, CellType> VecMap<KeyType, CellType>
where
    KeyType: Ord,
{
    pub fn new() -> VecMap<KeyType, CellType> {
        VecMap {
            map: BTreeMap::new(),
        }
    }

    pub fn push(&mut self, id: KeyType, cell_val: CellType) {
        if let Some(id_vec) = self.map.get_mut(&id) {
            id_vec.push(cell_val);
            return;
        }
        self.map.insert(id, vec![cell_val]);
    }

    pub fn extend(&mut self, id: KeyType, vec: Vec<CellType>) {
        if let Some(id_vec) = self.map.get_mut(&id) {
            id_vec.extend(vec);
            return;
        }
        self.map.insert(id, vec);
    }

    pub fn contains_key(&self, id: &KeyType) -> bool {
        self.map.contains_key(id)
    }

    pub fn get<'a>(&'a self, id: &KeyType) -> Option<&'a Vec<CellType>> {
        self.map.get(id)
    }

    pub fn len_of(&self, id: &KeyType) -> usize {
        if let Some(vec) = self.map.get(id) {
            return vec.len();
        }
        0
    }

    pub fn keys(&self) -> std::collections::btree_map::Keys<'_, KeyType, Vec<CellType>> {
        self.map.keys()
    }

    pub fn iter(&self) -> std::collections::btree_map::Iter<'_, KeyType, Vec<CellType>> {
        self.map.iter()
    }

    pub fn vec_iter<'a>(&'a self, id: &KeyType) -> Option<std::slice::Iter<'a, CellType>> {
        if let Some(vec) = self.map.get(id) {
            return Some(vec.iter());
        }
        None
    }
}

impl<KeyType, CellType> PartialEq for VecMap<KeyType, CellType>
where
    KeyType: Ord,
    CellType: Ord,
{
    fn eq(&self, other: &Self) -> bool {
        self.map == other.map
    }
}
