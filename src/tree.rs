//! Per-tree storage of the sorted leaf array.

use itertools::Itertools;

use crate::constants::{MAXLEVEL, NUM_CHILDREN};
use crate::morton::Quadrant;
use crate::search::split_array;

/// The leaves of one tree owned by this process, in Morton order, with
/// cached summary data. The cached fields are rebuilt after every batch
/// mutation; nothing mutates single leaves in place.
#[derive(Debug, Clone)]
pub struct Tree {
    pub quadrants: Vec<Quadrant>,
    pub first_desc: Quadrant,
    pub last_desc: Quadrant,
    pub quadrants_per_level: [i64; MAXLEVEL as usize + 1],
    pub maxlevel: i8,
}

impl Tree {
    pub fn new() -> Tree {
        Tree {
            quadrants: Vec::new(),
            first_desc: Quadrant::new(0, 0, MAXLEVEL),
            last_desc: Quadrant::new(0, 0, MAXLEVEL),
            quadrants_per_level: [0; MAXLEVEL as usize + 1],
            maxlevel: -1,
        }
    }

    pub fn num_quadrants(&self) -> usize {
        self.quadrants.len()
    }

    /// Rebuild the descendant bounds, the level histogram and `maxlevel`
    /// from the leaf array.
    pub fn update_cached(&mut self) {
        self.quadrants_per_level = [0; MAXLEVEL as usize + 1];
        self.maxlevel = -1;
        for q in &self.quadrants {
            self.quadrants_per_level[q.level as usize] += 1;
            self.maxlevel = self.maxlevel.max(q.level);
        }
        if let (Some(first), Some(last)) = (self.quadrants.first(), self.quadrants.last()) {
            self.first_desc = first.first_descendant(MAXLEVEL);
            self.last_desc = last.last_descendant(MAXLEVEL);
        }
    }

    /// The leaves are strictly sorted and free of overlaps.
    pub fn is_linear(&self) -> bool {
        self.quadrants
            .iter()
            .tuple_windows::<(_, _)>()
            .all(|(a, b)| a < b && !a.is_ancestor(b))
    }

    /// The leaves tile the root exactly: descending the implicit tree,
    /// every node is either a leaf or split into four covered children.
    pub fn is_complete(&self) -> bool {
        fn tiles(range: &[Quadrant], level: i8) -> bool {
            if range.len() == 1 && range[0].level == level {
                return true;
            }
            if range.is_empty() || level >= MAXLEVEL || range[0].level <= level {
                return false;
            }
            let indices = split_array(range, level);
            (0..NUM_CHILDREN).all(|k| tiles(&range[indices[k]..indices[k + 1]], level + 1))
        }

        tiles(&self.quadrants, 0)
    }
}

impl Default for Tree {
    fn default() -> Self {
        Tree::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::ROOT;

    #[test]
    fn test_empty_tree() {
        let tree = Tree::new();
        assert_eq!(tree.maxlevel, -1);
        assert!(tree.is_linear());
        assert!(!tree.is_complete());
    }

    #[test]
    fn test_update_cached() {
        let mut tree = Tree::new();
        tree.quadrants = vec![ROOT.child(0).child(0)];
        tree.quadrants.extend([
            ROOT.child(0).child(1),
            ROOT.child(0).child(2),
            ROOT.child(0).child(3),
            ROOT.child(1),
            ROOT.child(2),
            ROOT.child(3),
        ]);
        tree.update_cached();

        assert_eq!(tree.maxlevel, 2);
        assert_eq!(tree.quadrants_per_level[1], 3);
        assert_eq!(tree.quadrants_per_level[2], 4);
        assert_eq!(tree.quadrants_per_level[0], 0);
        assert_eq!(tree.first_desc, ROOT.first_descendant(MAXLEVEL));
        assert_eq!(tree.last_desc, ROOT.last_descendant(MAXLEVEL));
        assert!(tree.is_linear());
        assert!(tree.is_complete());
    }

    #[test]
    fn test_incomplete_and_overlapping() {
        let mut missing = Tree::new();
        missing.quadrants = vec![ROOT.child(0), ROOT.child(1), ROOT.child(3)];
        missing.update_cached();
        assert!(missing.is_linear());
        assert!(!missing.is_complete());

        let mut overlapping = Tree::new();
        overlapping.quadrants = vec![ROOT.child(0), ROOT.child(0).child(1)];
        overlapping.update_cached();
        assert!(!overlapping.is_linear());
    }
}
