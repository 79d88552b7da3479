//! Two-stage 2:1 balance across faces, corners, trees and ranks.

use std::collections::BTreeSet;

use crate::comm::{Communicator, TransportError};
use crate::constants::{MAXLEVEL, NUM_FACES, ROOT_LEN};
use crate::forest::{Forest, ForestRef, InitFn, Position};
use crate::morton::{Quadrant, TreeIndex};
use crate::partition::{pack_quadrants, unpack_quadrants};
use crate::pool::PayloadPool;
use crate::search::find_range_boundaries;
use crate::tree::Tree;

const BALANCE_TAG: u16 = 0x11;

/// Enforce the 2:1 size balance across all face and corner adjacencies,
/// including those crossing tree boundaries and rank cuts.
///
/// Stage 1 balances each local tree in isolation. Stage 2 repeats rounds
/// of boundary-seed exchange and local rebalancing until a global
/// reduction reports that no rank changed. Cells created here receive a
/// copy of the replaced leaf's payload and are then initialized, as in
/// refinement.
pub fn balance<C: Communicator>(
    forest: &mut Forest<C>,
    init_fn: Option<InitFn>,
) -> Result<(), TransportError> {
    forest.synchronize_global()?;

    apply_local_balance(forest, &[], init_fn);

    loop {
        let outgoing = boundary_seeds(forest);
        let seeds = exchange_seeds(forest, outgoing)?;
        let changed = apply_local_balance(forest, &seeds, init_fn);
        if !forest.comm.all_reduce_or(changed)? {
            break;
        }
    }

    forest.synchronize_global()?;
    Ok(())
}

/// Rebalance every local tree with the given requirement cells folded in.
/// Returns whether any tree changed.
fn apply_local_balance<C: Communicator>(
    forest: &mut Forest<C>,
    seeds: &[(TreeIndex, Quadrant)],
    init_fn: Option<InitFn>,
) -> bool {
    let rank = forest.comm.rank();
    let size = forest.comm.size();
    let info = ForestRef {
        rank,
        size,
        data_size: forest.data_size,
        user_pointer: forest.user_pointer.as_deref(),
    };
    let pool = &mut forest.payload_pool;

    let mut changed = false;
    for t in forest.first_local_tree..=forest.last_local_tree {
        let tree = &mut forest.trees[t as usize];
        if tree.quadrants.is_empty() {
            continue;
        }
        let tree_seeds: Vec<Quadrant> = seeds
            .iter()
            .filter(|(seed_tree, _)| *seed_tree == t)
            .map(|(_, seed)| *seed)
            .collect();
        let new_leaves = balance_range(&tree.quadrants, &tree_seeds);
        // Balance only refines, so an unchanged count means no change.
        if new_leaves.len() != tree.quadrants.len() {
            changed = true;
            apply_refinement(tree, &new_leaves, pool, &info, init_fn, t);
        }
    }
    if changed {
        forest.update_local_count();
    }
    changed
}

/// Balance one tree's sorted leaf range in isolation.
///
/// Level by level from the finest down, every cell forces its siblings
/// and the neighbors of its parent to exist at the next coarser size;
/// cells outside the root are left to the seed exchange. Keeping the
/// finest cell covering each region then yields the balanced tiling.
/// Requirement cells that fall outside the local coverage interval are
/// dropped; the owning process receives them as seeds instead.
pub(crate) fn balance_range(leaves: &[Quadrant], seeds: &[Quadrant]) -> Vec<Quadrant> {
    debug_assert!(!leaves.is_empty());
    let lo = leaves[0].first_descendant(MAXLEVEL);
    let hi = leaves[leaves.len() - 1].last_descendant(MAXLEVEL);

    let mut set: BTreeSet<Quadrant> = leaves
        .iter()
        .map(|q| Quadrant::new(q.x, q.y, q.level))
        .collect();
    for seed in seeds {
        if seed.last_descendant(MAXLEVEL) < lo || hi < seed.first_descendant(MAXLEVEL) {
            continue;
        }
        set.insert(Quadrant::new(seed.x, seed.y, seed.level));
    }

    let maxlevel = set.iter().map(|q| q.level).max().unwrap();
    for level in (2..=maxlevel).rev() {
        let current: Vec<Quadrant> = set
            .iter()
            .filter(|q| q.level == level)
            .copied()
            .collect();
        for q in &current {
            for i in 0..4 {
                set.insert(q.sibling(i));
            }
            for n in q.parent().neighbors() {
                if n.is_inside_root() {
                    set.insert(n);
                }
            }
        }
    }

    let sorted: Vec<Quadrant> = set.into_iter().collect();
    let mut result = Vec::with_capacity(sorted.len());
    for (i, q) in sorted.iter().enumerate() {
        if i + 1 < sorted.len() && q.is_ancestor(&sorted[i + 1]) {
            continue; // a finer cover exists
        }
        if lo <= q.first_descendant(MAXLEVEL) && q.last_descendant(MAXLEVEL) <= hi {
            result.push(*q);
        }
    }
    result
}

/// Swap a tree's leaves for a refined tiling of the same range, carrying
/// payloads over: an unchanged leaf keeps its block, a replaced leaf is
/// copied into each of its descendants before their initialization.
fn apply_refinement(
    tree: &mut Tree,
    new_leaves: &[Quadrant],
    pool: &mut Option<PayloadPool>,
    info: &ForestRef<'_>,
    init_fn: Option<InitFn>,
    which_tree: TreeIndex,
) {
    let old = std::mem::take(&mut tree.quadrants);
    let mut out = Vec::with_capacity(new_leaves.len());
    let mut j = 0usize;
    for old_leaf in old {
        if j < new_leaves.len() && new_leaves[j] == old_leaf {
            out.push(old_leaf);
            j += 1;
            continue;
        }
        let parent_bytes = pool.as_ref().map(|p| p.get(old_leaf.payload).to_vec());
        while j < new_leaves.len() && old_leaf.is_ancestor(&new_leaves[j]) {
            let mut child = new_leaves[j];
            if let Some(p) = pool.as_mut() {
                child.payload = p.alloc();
                let block = p.get_mut(child.payload);
                block.copy_from_slice(parent_bytes.as_ref().unwrap());
                if let Some(f) = init_fn {
                    f(info, which_tree, &child, block);
                }
            } else if let Some(f) = init_fn {
                f(info, which_tree, &child, &mut []);
            }
            out.push(child);
            j += 1;
        }
        if let Some(p) = pool.as_mut() {
            p.free(old_leaf.payload);
        }
    }
    debug_assert_eq!(j, new_leaves.len());
    tree.quadrants = out;
    tree.update_cached();
}

/// Collect the requirement cells this process imposes elsewhere: across
/// tree faces and corners through the connectivity transforms, and across
/// rank cuts within its own trees. One bucket per destination rank.
fn boundary_seeds<C: Communicator>(forest: &Forest<C>) -> Vec<Vec<(TreeIndex, Quadrant)>> {
    let size = forest.comm.size();
    let rank = forest.comm.rank();
    let conn = &forest.connectivity;
    let positions = &forest.global_first_position;
    let mut out: Vec<Vec<(TreeIndex, Quadrant)>> = vec![Vec::new(); size];

    for t in forest.first_local_tree..=forest.last_local_tree {
        let tree = &forest.trees[t as usize];
        if tree.quadrants.is_empty() {
            continue;
        }
        let mask = find_range_boundaries(Some(&tree.first_desc), Some(&tree.last_desc), 0);

        for q in &tree.quadrants {
            if q.level < 2 {
                continue; // imposes nothing stronger than the root
            }
            let seed_level = q.level - 1;
            for (i, n) in q.neighbors().iter().enumerate() {
                if n.is_inside_root() {
                    // Same tree; other owners of the region need a seed.
                    let seed = n.ancestor(seed_level);
                    push_seed(&mut out, positions, rank, false, t, seed);
                    continue;
                }
                let out_x = n.x < 0 || n.x >= ROOT_LEN;
                let out_y = n.y < 0 || n.y >= ROOT_LEN;
                if i < NUM_FACES {
                    if mask & (1 << i) == 0 {
                        continue;
                    }
                    if let Some((nt, image)) = conn.transform_face_neighbor(t, i, n) {
                        push_seed(&mut out, positions, rank, true, nt, image.ancestor(seed_level));
                    }
                } else if out_x && out_y {
                    let corner = i - NUM_FACES;
                    if mask & (1 << (4 + corner)) == 0 {
                        continue;
                    }
                    for (nt, image) in conn.transform_corner_neighbors(t, corner, q.level) {
                        push_seed(&mut out, positions, rank, true, nt, image.ancestor(seed_level));
                    }
                } else {
                    // A diagonal probe that leaves the root through a face.
                    let face = if out_x {
                        if n.x < 0 {
                            3
                        } else {
                            1
                        }
                    } else if n.y < 0 {
                        0
                    } else {
                        2
                    };
                    if mask & (1 << face) == 0 {
                        continue;
                    }
                    if let Some((nt, image)) = conn.transform_face_neighbor(t, face, n) {
                        push_seed(&mut out, positions, rank, true, nt, image.ancestor(seed_level));
                    }
                }
            }
        }
    }
    out
}

/// Route one requirement cell to every rank whose interval overlaps it.
fn push_seed(
    out: &mut [Vec<(TreeIndex, Quadrant)>],
    positions: &[Position],
    my_rank: usize,
    include_self: bool,
    which_tree: TreeIndex,
    seed: Quadrant,
) {
    let lo = Position {
        which_tree,
        quad: seed.first_descendant(MAXLEVEL),
    };
    let hi = Position {
        which_tree,
        quad: seed.last_descendant(MAXLEVEL),
    };
    for (r, bucket) in out.iter_mut().enumerate() {
        if positions[r] == positions[r + 1] {
            continue; // empty rank
        }
        if !include_self && r == my_rank {
            continue;
        }
        if positions[r] <= hi && lo < positions[r + 1] {
            let entry = (which_tree, seed);
            if bucket.last() != Some(&entry) {
                bucket.push(entry);
            }
        }
    }
}

/// Ship each bucket to its rank and return the seeds addressed to this
/// process, own bucket included.
fn exchange_seeds<C: Communicator>(
    forest: &Forest<C>,
    mut out: Vec<Vec<(TreeIndex, Quadrant)>>,
) -> Result<Vec<(TreeIndex, Quadrant)>, TransportError> {
    let rank = forest.comm.rank();
    let size = forest.comm.size();
    for bucket in out.iter_mut() {
        bucket.sort();
        bucket.dedup();
    }

    let counts: Vec<i64> = out.iter().map(|b| b.len() as i64).collect();
    let matrix = forest.comm.all_gather_i64_slice(&counts)?;

    let mut mine = std::mem::take(&mut out[rank]);
    let outgoing: Vec<(usize, u16, Vec<u8>)> = (0..size)
        .filter(|&d| d != rank && !out[d].is_empty())
        .map(|d| (d, BALANCE_TAG, pack_quadrants(&out[d])))
        .collect();
    let incoming: Vec<(usize, u16)> = (0..size)
        .filter(|&s| s != rank && matrix[s * size + rank] > 0)
        .map(|s| (s, BALANCE_TAG))
        .collect();
    let received = forest.comm.exchange_bytes(&outgoing, &incoming)?;
    for blob in &received {
        mine.extend(unpack_quadrants(blob));
    }
    mine.sort();
    mine.dedup();
    Ok(mine)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::comm::NullCommunicator;
    use crate::connectivity::Connectivity;
    use crate::constants::ROOT;

    fn new_forest(conn: Connectivity, min_quadrants: i64) -> Forest<NullCommunicator> {
        Forest::new(
            NullCommunicator::new(),
            Arc::new(conn),
            min_quadrants,
            0,
            None,
            None,
        )
    }

    fn refine_below3(_: &ForestRef<'_>, _: TreeIndex, q: &Quadrant) -> bool {
        q.level() < 3
    }

    /// Closed bounding boxes, so edge and corner contact both count.
    fn touch(a: &Quadrant, b: &Quadrant) -> bool {
        let (ah, bh) = (a.length(), b.length());
        a.x <= b.x + bh && b.x <= a.x + ah && a.y <= b.y + bh && b.y <= a.y + ah
    }

    fn touches_face_line(q: &Quadrant, face: usize) -> bool {
        let h = q.length();
        match face {
            0 => q.y == 0,
            1 => q.x + h == ROOT_LEN,
            2 => q.y + h == ROOT_LEN,
            _ => q.x == 0,
        }
    }

    fn touches_corner_point(q: &Quadrant, corner: usize) -> bool {
        let h = q.length();
        match corner {
            0 => q.x == 0 && q.y == 0,
            1 => q.x + h == ROOT_LEN && q.y == 0,
            2 => q.x + h == ROOT_LEN && q.y + h == ROOT_LEN,
            _ => q.x == 0 && q.y + h == ROOT_LEN,
        }
    }

    /// The closed interval a leaf covers along a face of the root.
    fn face_span(q: &Quadrant, face: usize) -> (i32, i32) {
        let h = q.length();
        if face == 0 || face == 2 {
            (q.x, q.x + h)
        } else {
            (q.y, q.y + h)
        }
    }

    /// Full 2:1 check over all adjacencies: every pair of leaves whose
    /// closures touch, within a tree or across the connectivity's face
    /// and corner links, differs by at most one level.
    fn assert_balanced(forest: &Forest<NullCommunicator>) {
        let conn = &forest.connectivity;
        for t in forest.first_local_tree..=forest.last_local_tree {
            let leaves = &forest.trees[t as usize].quadrants;
            for (i, a) in leaves.iter().enumerate() {
                for b in &leaves[i + 1..] {
                    if touch(a, b) {
                        assert!(
                            (a.level - b.level).abs() <= 1,
                            "2:1 violation inside tree {}: {:?} vs {:?}",
                            t,
                            a,
                            b
                        );
                    }
                }
            }
            for q in leaves {
                for face in 0..NUM_FACES {
                    if !touches_face_line(q, face) {
                        continue;
                    }
                    let Some((nt, image)) =
                        conn.transform_face_neighbor(t, face, &q.face_neighbor(face))
                    else {
                        continue;
                    };
                    let ft = conn.find_face_transform(t, face).unwrap();
                    let span = face_span(&image, ft.neighbor_face);
                    let mut found = false;
                    for p in &forest.trees[nt as usize].quadrants {
                        if !touches_face_line(p, ft.neighbor_face) {
                            continue;
                        }
                        let ps = face_span(p, ft.neighbor_face);
                        if ps.0 <= span.1 && span.0 <= ps.1 {
                            found = true;
                            assert!(
                                (p.level - q.level).abs() <= 1,
                                "2:1 violation across face {} of tree {}: {:?} vs {:?}",
                                face,
                                t,
                                q,
                                p
                            );
                        }
                    }
                    assert!(found, "no contact across face {} of tree {}", face, t);
                }
                for corner in 0..4 {
                    if !touches_corner_point(q, corner) {
                        continue;
                    }
                    for ci in conn.find_corner_info(t, corner) {
                        let mut found = false;
                        for p in &forest.trees[ci.neighbor_tree as usize].quadrants {
                            if touches_corner_point(p, ci.neighbor_corner) {
                                found = true;
                                assert!(
                                    (p.level - q.level).abs() <= 1,
                                    "2:1 violation across corner {} of tree {}: {:?} vs {:?}",
                                    corner,
                                    t,
                                    q,
                                    p
                                );
                            }
                        }
                        assert!(found, "no contact across corner {} of tree {}", corner, t);
                    }
                }
            }
        }
    }

    #[test]
    fn test_balance_range_splits_coarse_neighbor() {
        // A level-0 tree with a level-3 seed in one corner grades down.
        let leaves = vec![ROOT];
        let seeds = vec![Quadrant::new(0, 0, 3)];
        let balanced = balance_range(&leaves, &seeds);

        let mut tree = Tree::new();
        tree.quadrants = balanced.clone();
        tree.update_cached();
        assert!(tree.is_linear());
        assert!(tree.is_complete());
        assert!(balanced.contains(&Quadrant::new(0, 0, 3)));
        assert_eq!(tree.maxlevel, 3);
        assert_eq!(balanced.len(), 10);
    }

    #[test]
    fn test_balance_already_balanced_is_noop() {
        let mut forest = new_forest(Connectivity::unit_square(), 0);
        forest.refine(true, refine_below3, None);
        let before = forest.trees[0].quadrants.clone();

        balance(&mut forest, None).unwrap();
        assert!(forest.is_valid());
        assert_eq!(forest.trees[0].quadrants, before);
    }

    #[test]
    fn test_deep_block_balance() {
        // Refine the first level-3 leaf uniformly to level 8, so the
        // forest holds levels 3 and 8 only, then close the gap.
        fn first_block_below8(_: &ForestRef<'_>, _: TreeIndex, q: &Quadrant) -> bool {
            q.x < ROOT_LEN / 8 && q.y < ROOT_LEN / 8 && q.level() < 8
        }

        let mut forest = new_forest(Connectivity::unit_square(), 0);
        forest.refine(true, refine_below3, None);
        forest.refine(true, first_block_below8, None);

        let hist = &forest.trees[0].quadrants_per_level;
        assert_eq!(hist[8], 1024);
        assert_eq!(hist[3], 63);
        assert_eq!(forest.local_num_quadrants, 1087);

        balance(&mut forest, None).unwrap();

        assert!(forest.is_valid());
        assert!(forest.trees[0].is_complete());
        // The graded closure inserts intermediate levels but never
        // touches the deep block itself.
        assert_eq!(forest.trees[0].quadrants_per_level[8], 1024);
        assert_eq!(forest.local_num_quadrants, 1189);
        assert_balanced(&forest);
    }

    #[test]
    fn test_balance_is_idempotent() {
        fn first_block_below8(_: &ForestRef<'_>, _: TreeIndex, q: &Quadrant) -> bool {
            q.x < ROOT_LEN / 8 && q.y < ROOT_LEN / 8 && q.level() < 8
        }

        let mut forest = new_forest(Connectivity::unit_square(), 0);
        forest.refine(true, refine_below3, None);
        forest.refine(true, first_block_below8, None);
        balance(&mut forest, None).unwrap();

        let leaves = forest.trees[0].quadrants.clone();
        let checksum = forest.checksum().unwrap();

        balance(&mut forest, None).unwrap();
        assert_eq!(forest.trees[0].quadrants, leaves);
        assert_eq!(forest.checksum().unwrap(), checksum);
    }

    #[test]
    fn test_corner_connectivity_balance() {
        fn tree0_below4(_: &ForestRef<'_>, t: TreeIndex, q: &Quadrant) -> bool {
            t == 0 && q.level() < 4
        }

        let mut forest = new_forest(Connectivity::corner(), 0);
        forest.refine(true, tree0_below4, None);
        assert_eq!(forest.trees[0].num_quadrants(), 256);

        balance(&mut forest, None).unwrap();

        assert!(forest.is_valid());
        for t in 0..3 {
            assert!(forest.trees[t].is_complete());
        }
        assert_balanced(&forest);

        // Tree 1 adjoins tree 0 along its left face and holds the shared
        // vertex at its corner 3; tree 2 holds it at its corner 0.
        assert_eq!(forest.trees[1].num_quadrants(), 22);
        assert_eq!(forest.trees[2].num_quadrants(), 10);
        let near_seam = forest.trees[1]
            .quadrants
            .iter()
            .find(|q| q.x == 0 && q.y + q.length() == ROOT_LEN)
            .unwrap();
        assert!(near_seam.level() >= 3);
        let at_center = forest.trees[2]
            .quadrants
            .iter()
            .find(|q| q.x == 0 && q.y == 0)
            .unwrap();
        assert!(at_center.level() >= 3);
    }

    #[test]
    fn test_moebius_seam_balance() {
        fn seam_strip_below5(_: &ForestRef<'_>, t: TreeIndex, q: &Quadrant) -> bool {
            t == 4 && q.x + q.length() == ROOT_LEN && q.y < ROOT_LEN / 4 && q.level() < 5
        }

        let mut forest = new_forest(Connectivity::moebius(), 21);
        assert_eq!(forest.trees[0].maxlevel, 2);

        forest.refine(true, seam_strip_below5, None);
        balance(&mut forest, None).unwrap();

        assert!(forest.is_valid());
        for t in 0..5 {
            assert!(forest.trees[t].is_complete());
        }
        assert_balanced(&forest);

        // The refined strip sits at the bottom of tree 4's seam face; its
        // image in tree 0 is reflected to the top of the left face.
        for q in &forest.trees[0].quadrants {
            if q.x == 0 && q.y >= 3 * (ROOT_LEN / 4) {
                assert!(q.level() >= 4);
            }
        }
        // The far side of the band is untouched by the seam.
        assert!(forest.trees[2].maxlevel <= 3);
    }

    #[test]
    fn test_random_refinement_balance() {
        use rand::prelude::*;
        use rand::SeedableRng;

        fn toward_targets(info: &ForestRef<'_>, _: TreeIndex, q: &Quadrant) -> bool {
            let targets = info
                .user_pointer
                .unwrap()
                .downcast_ref::<Vec<Quadrant>>()
                .unwrap();
            targets.iter().any(|target| q.is_ancestor(target))
        }

        let mut rng = StdRng::seed_from_u64(0);
        let targets: Vec<Quadrant> = (0..20)
            .map(|_| {
                let level = rng.gen_range(4i8..=7);
                let id = rng.gen_range(0..(1u64 << (2 * level as u64)));
                Quadrant::from_linear_id(level, id)
            })
            .collect();

        let mut forest = Forest::new(
            NullCommunicator::new(),
            Arc::new(Connectivity::periodic()),
            0,
            0,
            None,
            Some(Arc::new(targets) as Arc<dyn std::any::Any>),
        );
        forest.refine(true, toward_targets, None);
        balance(&mut forest, None).unwrap();

        assert!(forest.is_valid());
        assert!(forest.trees[0].is_complete());
        assert_balanced(&forest);

        let leaves = forest.trees[0].quadrants.clone();
        balance(&mut forest, None).unwrap();
        assert_eq!(forest.trees[0].quadrants, leaves);
    }

    #[test]
    fn test_periodic_balance_wraps() {
        fn corner_below6(_: &ForestRef<'_>, _: TreeIndex, q: &Quadrant) -> bool {
            q.x == 0 && q.y == 0 && q.level() < 6
        }

        let mut forest = new_forest(Connectivity::periodic(), 0);
        forest.refine(true, corner_below6, None);
        balance(&mut forest, None).unwrap();

        assert!(forest.is_valid());
        assert!(forest.trees[0].is_complete());
        assert_balanced(&forest);

        // The deep corner wraps onto the opposite edges and corner.
        assert_eq!(forest.local_num_quadrants, 55);
        let right_edge = forest.trees[0]
            .quadrants
            .iter()
            .find(|q| q.x + q.length() == ROOT_LEN && q.y == 0)
            .unwrap();
        assert!(right_edge.level() >= 5);
        let far_corner = forest.trees[0]
            .quadrants
            .iter()
            .find(|q| q.x + q.length() == ROOT_LEN && q.y + q.length() == ROOT_LEN)
            .unwrap();
        assert!(far_corner.level() >= 5);
    }
}
