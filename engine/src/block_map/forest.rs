//! Forests of fixed-fanout block-map trees.
//!
//! Interior pages (everything above the leaves) are held in memory and
//! persisted to their allocated PBNs on save; leaf pages move through the
//! page cache. Root pages live at fixed PBNs in the root partition. An
//! unmapped entry at any interior level means the whole subtree is
//! unmapped, which is how a freshly formatted instance describes an empty
//! address space without allocating anything.

use alloc::vec;
use alloc::vec::Vec;

use crate::block_map::page::{self, PageValidity, ENTRIES_PER_PAGE};
use crate::core::{
    CdsError, CdsResult, DataLocation, MappingState, Nonce, Pbn, INVALID_PBN,
};
use crate::device::BlockDevice;
use crate::BLOCK_SIZE;

// ============================================================================
// Tree Pages
// ============================================================================

/// An in-memory interior page.
struct TreePage {
    /// Where the page lives on disk
    pbn: Pbn,
    /// Has the page been allocated?
    present: bool,
    /// Child pointers
    entries: Vec<DataLocation>,
}

impl TreePage {
    fn absent() -> Self {
        Self {
            pbn: INVALID_PBN,
            present: false,
            entries: Vec::new(),
        }
    }

    fn materialize(&mut self, pbn: Pbn) {
        self.pbn = pbn;
        self.present = true;
        self.entries = vec![DataLocation::UNMAPPED; ENTRIES_PER_PAGE];
    }
}

/// One root tree: interior levels only, root at the top.
struct Tree {
    /// `levels[i]` holds the pages at tree level `i + 1`; leaves (level 0)
    /// live in the page cache.
    levels: Vec<Vec<TreePage>>,
}

// ============================================================================
// Walk Results
// ============================================================================

/// Outcome of routing a leaf number down a tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TreeWalk {
    /// The leaf page exists at this PBN
    Leaf(Pbn),
    /// The topmost missing page on the path
    Missing {
        /// Tree level of the missing page (0 = leaf)
        level: u8,
        /// Page index at that level
        page_index: u64,
    },
}

// ============================================================================
// Forest
// ============================================================================

/// All root trees of one block map.
pub struct Forest {
    root_pbns: Vec<Pbn>,
    height: u8,
    per_tree_leaves: u64,
    nonce: Nonce,
    trees: Vec<Tree>,
    allocated_pages: u64,
}

impl Forest {
    /// Build an empty forest. `root_pbns` are the fixed root locations.
    pub fn new(root_pbns: Vec<Pbn>, height: u8, per_tree_leaves: u64, nonce: Nonce) -> Self {
        let fanout = ENTRIES_PER_PAGE as u64;
        let trees = root_pbns
            .iter()
            .map(|&root_pbn| {
                let mut levels = Vec::new();
                for level in 1..height {
                    let pages = per_tree_leaves.div_ceil(fanout.pow(level as u32)).max(1);
                    let mut vec = Vec::with_capacity(pages as usize);
                    vec.resize_with(pages as usize, TreePage::absent);
                    levels.push(vec);
                }
                // The root page always exists at its fixed PBN.
                if let Some(root_level) = levels.last_mut() {
                    debug_assert_eq!(root_level.len(), 1);
                    root_level[0].materialize(root_pbn);
                }
                Tree { levels }
            })
            .collect();
        Self {
            root_pbns,
            height,
            per_tree_leaves,
            nonce,
            trees,
            allocated_pages: 0,
        }
    }

    /// Tree height (1 = the roots are the leaves).
    #[inline]
    pub fn height(&self) -> u8 {
        self.height
    }

    /// Interior and leaf pages allocated from the depot.
    #[inline]
    pub fn allocated_pages(&self) -> u64 {
        self.allocated_pages
    }

    /// Route `leaf` down tree `root`.
    pub fn walk(&self, root: u8, leaf: u64) -> TreeWalk {
        debug_assert!(leaf < self.per_tree_leaves.max(1));
        if self.height == 1 {
            return TreeWalk::Leaf(self.root_pbns[root as usize]);
        }
        let fanout = ENTRIES_PER_PAGE as u64;
        let tree = &self.trees[root as usize];
        let mut level = self.height - 1;
        let mut page = &tree.levels[level as usize - 1][0];
        loop {
            let child_level = level - 1;
            let child_index = if child_level == 0 {
                leaf
            } else {
                leaf / fanout.pow(child_level as u32)
            };
            let entry = page.entries[(child_index % fanout) as usize];
            if !entry.is_mapped() {
                return TreeWalk::Missing {
                    level: child_level,
                    page_index: child_index,
                };
            }
            if child_level == 0 {
                return TreeWalk::Leaf(entry.pbn);
            }
            page = &tree.levels[child_level as usize - 1][child_index as usize];
            level = child_level;
        }
    }

    /// The PBN at which the leaf page for (`root`, `leaf`) lives, if the
    /// path is fully allocated.
    pub fn leaf_pbn(&self, root: u8, leaf: u64) -> Option<Pbn> {
        match self.walk(root, leaf) {
            TreeWalk::Leaf(pbn) => Some(pbn),
            TreeWalk::Missing { .. } => None,
        }
    }

    /// Where the page at (`root`, `level`, `page_index`) lives, if it is
    /// allocated. Used by replay to keep re-insertion idempotent.
    pub fn page_pbn(&self, root: u8, level: u8, page_index: u64) -> Option<Pbn> {
        if self.height == 1 || level >= self.height - 1 {
            return Some(self.root_pbns[root as usize]);
        }
        let tree = &self.trees[root as usize];
        if level >= 1 {
            let page = tree.levels[level as usize - 1].get(page_index as usize)?;
            return page.present.then_some(page.pbn);
        }
        let fanout = ENTRIES_PER_PAGE as u64;
        let parent = tree.levels[0].get((page_index / fanout) as usize)?;
        if !parent.present {
            return None;
        }
        let entry = parent.entries[(page_index % fanout) as usize];
        entry.is_mapped().then_some(entry.pbn)
    }

    /// Record a newly allocated tree page and point its parent at it.
    pub fn insert_page(&mut self, root: u8, level: u8, page_index: u64, pbn: Pbn) {
        debug_assert!(level < self.height - 1 || self.height == 1);
        let fanout = ENTRIES_PER_PAGE as u64;
        let tree = &mut self.trees[root as usize];

        let parent_level = level + 1;
        let parent_index = (page_index / fanout) as usize;
        let parent = &mut tree.levels[parent_level as usize - 1][parent_index];
        debug_assert!(parent.present);
        parent.entries[(page_index % fanout) as usize] =
            DataLocation::new(pbn, MappingState::Uncompressed);

        if level >= 1 {
            tree.levels[level as usize - 1][page_index as usize].materialize(pbn);
        }
        self.allocated_pages += 1;
    }

    /// Write the roots and every allocated interior page.
    pub fn save(&self, device: &dyn BlockDevice) -> CdsResult<()> {
        let mut buf = vec![0u8; BLOCK_SIZE];
        for tree in &self.trees {
            for level in &tree.levels {
                for tree_page in level {
                    if !tree_page.present {
                        continue;
                    }
                    page::format_page(&mut buf, tree_page.pbn, self.nonce, true);
                    for (index, entry) in tree_page.entries.iter().enumerate() {
                        if entry.is_mapped() {
                            page::set_entry(&mut buf, index, *entry);
                        }
                    }
                    device.write_block(tree_page.pbn, &buf, false)?;
                }
            }
        }
        device.flush()?;
        Ok(())
    }

    /// Load the roots and descend through every mapped interior page.
    pub fn load(&mut self, device: &dyn BlockDevice) -> CdsResult<()> {
        if self.height == 1 {
            return Ok(());
        }
        let fanout = ENTRIES_PER_PAGE as u64;
        let mut buf = vec![0u8; BLOCK_SIZE];
        self.allocated_pages = 0;
        for root in 0..self.root_pbns.len() {
            // (level, page_index) work list, top down.
            let mut pending: Vec<(u8, u64)> = vec![(self.height - 1, 0)];
            while let Some((level, page_index)) = pending.pop() {
                let pbn = self.trees[root].levels[level as usize - 1][page_index as usize].pbn;
                device.read_block(pbn, &mut buf)?;
                match page::validate_page(&buf, self.nonce, pbn) {
                    PageValidity::Valid => {}
                    PageValidity::Empty => continue,
                    PageValidity::Bad => return Err(CdsError::BadPage),
                }
                for entry_index in 0..ENTRIES_PER_PAGE {
                    let entry = page::entry(&buf, entry_index);
                    if !entry.is_mapped() {
                        continue;
                    }
                    let child_index = page_index * fanout + entry_index as u64;
                    let child_level = level - 1;
                    let tree = &mut self.trees[root];
                    tree.levels[level as usize - 1][page_index as usize].entries[entry_index] =
                        entry;
                    self.allocated_pages += 1;
                    if child_level >= 1 {
                        tree.levels[child_level as usize - 1][child_index as usize]
                            .materialize(entry.pbn);
                        pending.push((child_level, child_index));
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::RamDevice;

    fn forest2() -> Forest {
        // Height-two forest: roots at PBN 2 and 3.
        Forest::new(vec![2, 3], 2, 100, 77)
    }

    #[test]
    fn test_height_one_leaf_is_root() {
        let forest = Forest::new(vec![5, 6], 1, 1, 9);
        assert_eq!(forest.walk(0, 0), TreeWalk::Leaf(5));
        assert_eq!(forest.walk(1, 0), TreeWalk::Leaf(6));
    }

    #[test]
    fn test_missing_then_insert() {
        let mut forest = forest2();
        assert_eq!(
            forest.walk(0, 3),
            TreeWalk::Missing {
                level: 0,
                page_index: 3
            }
        );
        forest.insert_page(0, 0, 3, 500);
        assert_eq!(forest.walk(0, 3), TreeWalk::Leaf(500));
        assert_eq!(forest.leaf_pbn(0, 3), Some(500));
        // Sibling leaves are still unallocated.
        assert_eq!(forest.leaf_pbn(0, 2), None);
        assert_eq!(forest.allocated_pages(), 1);
    }

    #[test]
    fn test_save_load_round_trip() {
        let device = RamDevice::new(1024);
        let mut forest = forest2();
        forest.insert_page(0, 0, 1, 600);
        forest.insert_page(1, 0, 7, 601);
        forest.save(&device).unwrap();

        let mut reloaded = forest2();
        reloaded.load(&device).unwrap();
        assert_eq!(reloaded.leaf_pbn(0, 1), Some(600));
        assert_eq!(reloaded.leaf_pbn(1, 7), Some(601));
        assert_eq!(reloaded.leaf_pbn(0, 0), None);
        assert_eq!(reloaded.allocated_pages(), 2);
    }

    #[test]
    fn test_three_level_walk() {
        let fanout = ENTRIES_PER_PAGE as u64;
        let leaves = fanout + 5;
        let mut forest = Forest::new(vec![2], 3, leaves, 1);
        let leaf = fanout + 2;
        // Missing at the interior level first.
        assert_eq!(
            forest.walk(0, leaf),
            TreeWalk::Missing {
                level: 1,
                page_index: 1
            }
        );
        forest.insert_page(0, 1, 1, 700);
        assert_eq!(
            forest.walk(0, leaf),
            TreeWalk::Missing {
                level: 0,
                page_index: leaf
            }
        );
        forest.insert_page(0, 0, leaf, 701);
        assert_eq!(forest.walk(0, leaf), TreeWalk::Leaf(701));
    }
}
