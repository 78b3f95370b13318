/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Read-only node inventory.
//!
//! The step manager never owns node health; it consumes a snapshot of the
//! controller's node table.  Bit index == position in the table, which is
//! the cluster-wide node index used by every node bitmap in this crate.

use crate::bitmap::Bitmap;

/// One entry of the controller's node table.
#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub name: String,
    /// Node is in an UP state (drained/down nodes clear this).
    pub up: bool,
    /// Node is powered down or booting under power-save policy.
    pub power_save: bool,
    /// Node stopped answering pings.
    pub no_respond: bool,
}

impl NodeRecord {
    pub fn up(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            up: true,
            power_save: false,
            no_respond: false,
        }
    }
}

/// Snapshot of the node table consumed by the step manager.
#[derive(Debug, Clone, Default)]
pub struct NodeInventory {
    nodes: Vec<NodeRecord>,
}

impl NodeInventory {
    pub fn new(nodes: Vec<NodeRecord>) -> Self {
        Self { nodes }
    }

    /// Inventory of `names.len()` healthy nodes.
    pub fn all_up(names: &[&str]) -> Self {
        Self {
            nodes: names.iter().map(|n| NodeRecord::up(*n)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, inx: usize) -> &NodeRecord {
        &self.nodes[inx]
    }

    pub fn node_mut(&mut self, inx: usize) -> &mut NodeRecord {
        &mut self.nodes[inx]
    }

    pub fn name(&self, inx: usize) -> &str {
        &self.nodes[inx].name
    }

    /// Cluster index of the node called `name`.
    pub fn find(&self, name: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.name == name)
    }

    /// Bitmap of nodes currently in an UP state.
    pub fn up_bitmap(&self) -> Bitmap {
        let mut bm = Bitmap::new(self.nodes.len());
        for (inx, node) in self.nodes.iter().enumerate() {
            if node.up {
                bm.set(inx);
            }
        }
        bm
    }

    /// Parse a comma-separated node-name list into a bitmap.  Returns
    /// `None` when any name is unknown.
    pub fn names_to_bitmap(&self, list: &str) -> Option<Bitmap> {
        let mut bm = Bitmap::new(self.nodes.len());
        for name in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            bm.set(self.find(name)?);
        }
        Some(bm)
    }

    /// Render a node bitmap as a comma-separated name list, bit-index
    /// ascending.
    pub fn bitmap_to_names(&self, bm: &Bitmap) -> String {
        bm.iter_set()
            .map(|inx| self.nodes[inx].name.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Names for the set bits of `bm`, in order.
    pub fn names_of(&self, bm: &Bitmap) -> Vec<String> {
        bm.iter_set().map(|inx| self.nodes[inx].name.clone()).collect()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn inv() -> NodeInventory {
        NodeInventory::all_up(&["n0", "n1", "n2", "n3"])
    }

    #[test]
    fn find_returns_table_position() {
        let inv = inv();
        assert_eq!(inv.find("n2"), Some(2));
        assert_eq!(inv.find("nx"), None);
    }

    #[test]
    fn up_bitmap_reflects_node_state() {
        let mut inv = inv();
        inv.node_mut(1).up = false;
        let up = inv.up_bitmap();
        assert!(up.test(0));
        assert!(!up.test(1));
        assert_eq!(up.count(), 3);
    }

    #[test]
    fn names_round_trip() {
        let inv = inv();
        let bm = inv.names_to_bitmap("n1,n3").unwrap();
        assert_eq!(bm.iter_set().collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(inv.bitmap_to_names(&bm), "n1,n3");
    }

    #[test]
    fn unknown_name_is_rejected() {
        assert!(inv().names_to_bitmap("n1,bogus").is_none());
    }

    #[test]
    fn empty_list_is_empty_bitmap() {
        assert!(inv().names_to_bitmap("").unwrap().is_empty());
    }
}
