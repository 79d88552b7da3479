//! The forest of quadtrees: creation, refinement, coarsening, checksum.

use std::any::Any;
use std::sync::Arc;

use crc::{Crc, CRC_32_ISO_HDLC};

use crate::comm::{Communicator, TransportError};
use crate::connectivity::Connectivity;
use crate::constants::{MAXLEVEL, QMAXLEVEL};
use crate::morton::{is_family, Coord, PayloadId, Quadrant, TreeIndex};
use crate::pool::PayloadPool;
use crate::tree::Tree;

/// Read-only capability handed to callbacks. Exposes the user pointer and
/// the ambient facts of the forest; mutation stays with the `&mut Forest`
/// the driver holds.
pub struct ForestRef<'a> {
    pub rank: usize,
    pub size: usize,
    pub data_size: usize,
    pub user_pointer: Option<&'a dyn Any>,
}

/// Fill the payload of a fresh quadrant. Receives an empty slice when the
/// forest carries no per-cell data.
pub type InitFn = fn(&ForestRef<'_>, TreeIndex, &Quadrant, &mut [u8]);

/// Decide whether a leaf is split into its four children.
pub type RefineFn = fn(&ForestRef<'_>, TreeIndex, &Quadrant) -> bool;

/// Decide whether a family of four siblings is replaced by its parent.
pub type CoarsenFn = fn(&ForestRef<'_>, TreeIndex, &[Quadrant; 4]) -> bool;

/// Partition weight of a leaf.
pub type WeightFn = fn(&ForestRef<'_>, TreeIndex, &Quadrant) -> u32;

/// A point in the global leaf order: a tree and a finest-level cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Position {
    pub which_tree: TreeIndex,
    pub quad: Quadrant,
}

impl Ord for Position {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.which_tree
            .cmp(&other.which_tree)
            .then_with(|| self.quad.cmp(&other.quad))
    }
}

impl PartialOrd for Position {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// A parallel forest of quadtrees over a fixed connectivity.
///
/// Every tree of the connectivity has an entry in `trees`; only the trees
/// in `first_local_tree..=last_local_tree` hold leaves on this process.
/// An empty process stores the sentinels -1 and -2, which make that range
/// empty. The global descriptors are refreshed by [`synchronize_global`]
/// at the entry of every collective algorithm; the purely local
/// operations leave them stale.
///
/// [`synchronize_global`]: Forest::synchronize_global
pub struct Forest<C: Communicator> {
    pub comm: C,
    pub connectivity: Arc<Connectivity>,
    pub data_size: usize,
    pub user_pointer: Option<Arc<dyn Any>>,
    pub trees: Vec<Tree>,
    pub first_local_tree: TreeIndex,
    pub last_local_tree: TreeIndex,
    pub local_num_quadrants: i64,
    pub global_num_quadrants: i64,
    /// Cumulative leaf count through each rank, minus one.
    pub global_last_quad_index: Vec<i64>,
    /// The smallest possible cell at each rank's start, plus a sentinel
    /// one beyond the last tree.
    pub global_first_position: Vec<Position>,
    pub payload_pool: Option<PayloadPool>,
}

const CKSUM: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

fn uniform_cut(r: usize, n: i64, p: usize) -> i64 {
    (r as i64 * n) / p as i64
}

impl<C: Communicator> Forest<C> {
    /// Create a forest with one uniformly refined quadtree per
    /// connectivity tree, refined until the global leaf count reaches
    /// `min_quadrants` per process, and cut into contiguous per-rank
    /// ranges of the global Morton sequence.
    pub fn new(
        comm: C,
        connectivity: Arc<Connectivity>,
        min_quadrants: i64,
        data_size: usize,
        init_fn: Option<InitFn>,
        user_pointer: Option<Arc<dyn Any>>,
    ) -> Forest<C> {
        assert!(connectivity.is_valid());
        assert!(min_quadrants >= 0);
        let size = comm.size();
        let rank = comm.rank();
        let num_trees = connectivity.num_trees as i64;

        let mut level: i8 = 0;
        while num_trees << (2 * level as u32) < min_quadrants * size as i64 {
            level += 1;
            assert!(level <= QMAXLEVEL, "min_quadrants exceeds the finest level");
        }
        let cells_per_tree = 1i64 << (2 * level as u32);
        let global_n = num_trees * cells_per_tree;

        let begin = uniform_cut(rank, global_n, size);
        let end = uniform_cut(rank + 1, global_n, size);

        let mut forest = Forest {
            comm,
            data_size,
            user_pointer,
            trees: (0..num_trees).map(|_| Tree::new()).collect(),
            first_local_tree: if begin >= end {
                -1
            } else {
                (begin / cells_per_tree) as TreeIndex
            },
            last_local_tree: if begin >= end {
                -2
            } else {
                ((end - 1) / cells_per_tree) as TreeIndex
            },
            local_num_quadrants: end - begin,
            global_num_quadrants: global_n,
            global_last_quad_index: (1..=size)
                .map(|r| uniform_cut(r, global_n, size) - 1)
                .collect(),
            global_first_position: (0..=size)
                .map(|r| {
                    let g = uniform_cut(r, global_n, size);
                    if g >= global_n {
                        Position {
                            which_tree: connectivity.num_trees,
                            quad: Quadrant::new(0, 0, MAXLEVEL),
                        }
                    } else {
                        Position {
                            which_tree: (g / cells_per_tree) as TreeIndex,
                            quad: Quadrant::from_linear_id(level, (g % cells_per_tree) as u64)
                                .first_descendant(MAXLEVEL),
                        }
                    }
                })
                .collect(),
            connectivity,
            payload_pool: (data_size > 0).then(|| PayloadPool::new(data_size)),
        };

        let info = ForestRef {
            rank,
            size,
            data_size,
            user_pointer: forest.user_pointer.as_deref(),
        };
        let pool = &mut forest.payload_pool;
        for g in begin..end {
            let t = (g / cells_per_tree) as usize;
            let mut q = Quadrant::from_linear_id(level, (g % cells_per_tree) as u64);
            if let Some(p) = pool.as_mut() {
                q.payload = p.alloc();
                let block = p.get_mut(q.payload);
                if let Some(f) = init_fn {
                    f(&info, t as TreeIndex, &q, block);
                }
            } else if let Some(f) = init_fn {
                f(&info, t as TreeIndex, &q, &mut []);
            }
            forest.trees[t].quadrants.push(q);
        }
        for tree in &mut forest.trees {
            tree.update_cached();
        }
        forest
    }

    pub(crate) fn forest_ref(&self) -> ForestRef<'_> {
        ForestRef {
            rank: self.comm.rank(),
            size: self.comm.size(),
            data_size: self.data_size,
            user_pointer: self.user_pointer.as_deref(),
        }
    }

    /// Deep copy. With `copy_payloads` false the copy carries no per-cell
    /// data at all; the user pointer is shared either way.
    pub fn copy(&self, copy_payloads: bool) -> Forest<C>
    where
        C: Clone,
    {
        let mut forest = Forest {
            comm: self.comm.clone(),
            connectivity: Arc::clone(&self.connectivity),
            data_size: if copy_payloads { self.data_size } else { 0 },
            user_pointer: self.user_pointer.clone(),
            trees: self.trees.clone(),
            first_local_tree: self.first_local_tree,
            last_local_tree: self.last_local_tree,
            local_num_quadrants: self.local_num_quadrants,
            global_num_quadrants: self.global_num_quadrants,
            global_last_quad_index: self.global_last_quad_index.clone(),
            global_first_position: self.global_first_position.clone(),
            payload_pool: if copy_payloads {
                self.payload_pool.clone()
            } else {
                None
            },
        };
        if !copy_payloads {
            for tree in &mut forest.trees {
                for q in &mut tree.quadrants {
                    q.payload = PayloadId::NONE;
                }
            }
        }
        forest
    }

    /// Split every local leaf the predicate accepts into its four
    /// children, depth first while `recursive`. Children receive a copy
    /// of the parent payload and are then initialized. Purely local.
    pub fn refine(&mut self, recursive: bool, refine_fn: RefineFn, init_fn: Option<InitFn>) {
        let rank = self.comm.rank();
        let size = self.comm.size();
        let info = ForestRef {
            rank,
            size,
            data_size: self.data_size,
            user_pointer: self.user_pointer.as_deref(),
        };
        let pool = &mut self.payload_pool;

        for t in self.first_local_tree..=self.last_local_tree {
            let tree = &mut self.trees[t as usize];
            let old = std::mem::take(&mut tree.quadrants);
            let mut out = Vec::with_capacity(old.len());
            let mut stack: Vec<Quadrant> = Vec::new();
            for q in old {
                if !(q.level < QMAXLEVEL && refine_fn(&info, t, &q)) {
                    out.push(q);
                    continue;
                }
                split_into(&mut stack, &q, pool, &info, init_fn, t);
                while let Some(cell) = stack.pop() {
                    if recursive && cell.level < QMAXLEVEL && refine_fn(&info, t, &cell) {
                        split_into(&mut stack, &cell, pool, &info, init_fn, t);
                    } else {
                        out.push(cell);
                    }
                }
            }
            tree.quadrants = out;
            tree.update_cached();
        }
        self.update_local_count();
    }

    /// Replace every family of four siblings the predicate accepts with
    /// its parent, which receives a freshly initialized payload. While
    /// `recursive` the window backs up so a new parent can join a coarser
    /// family at once. Purely local.
    pub fn coarsen(&mut self, recursive: bool, coarsen_fn: CoarsenFn, init_fn: Option<InitFn>) {
        let rank = self.comm.rank();
        let size = self.comm.size();
        let info = ForestRef {
            rank,
            size,
            data_size: self.data_size,
            user_pointer: self.user_pointer.as_deref(),
        };
        let pool = &mut self.payload_pool;

        for t in self.first_local_tree..=self.last_local_tree {
            let tree = &mut self.trees[t as usize];
            let old = std::mem::take(&mut tree.quadrants);
            let mut out: Vec<Quadrant> = Vec::with_capacity(old.len());
            // In one pass a created parent may not be examined again.
            let mut fresh_floor = 0usize;
            for q in old {
                out.push(q);
                loop {
                    let n = out.len();
                    if n < 4 || (!recursive && n - 4 < fresh_floor) {
                        break;
                    }
                    let fam = [out[n - 4], out[n - 3], out[n - 2], out[n - 1]];
                    if !is_family(&fam[0], &fam[1], &fam[2], &fam[3])
                        || !coarsen_fn(&info, t, &fam)
                    {
                        break;
                    }
                    let mut parent = fam[0].parent();
                    if let Some(p) = pool.as_mut() {
                        for c in &fam {
                            p.free(c.payload);
                        }
                        parent.payload = p.alloc();
                        let block = p.get_mut(parent.payload);
                        if let Some(f) = init_fn {
                            f(&info, t, &parent, block);
                        }
                    } else if let Some(f) = init_fn {
                        f(&info, t, &parent, &mut []);
                    }
                    out.truncate(n - 4);
                    out.push(parent);
                    if !recursive {
                        fresh_floor = out.len();
                        break;
                    }
                }
            }
            tree.quadrants = out;
            tree.update_cached();
        }
        self.update_local_count();
    }

    /// Partition-independent CRC-32 over the global Morton sequence of
    /// `(tree, x, y, level)` tuples. Returns the value on rank 0 and zero
    /// on all other ranks.
    pub fn checksum(&self) -> Result<u32, TransportError> {
        let bytes = self.leaf_tuple_bytes();
        match self.comm.gather_bytes_at_root(&bytes)? {
            Some(streams) => {
                let mut digest = CKSUM.digest();
                for stream in &streams {
                    digest.update(stream);
                }
                Ok(digest.finalize())
            }
            None => Ok(0),
        }
    }

    fn leaf_tuple_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(16 * self.local_num_quadrants.max(0) as usize);
        for t in self.first_local_tree..=self.last_local_tree {
            for q in &self.trees[t as usize].quadrants {
                bytes.extend_from_slice(&(t as u32).to_le_bytes());
                bytes.extend_from_slice(&(q.x as u32).to_le_bytes());
                bytes.extend_from_slice(&(q.y as u32).to_le_bytes());
                bytes.extend_from_slice(&(q.level as u32).to_le_bytes());
            }
        }
        bytes
    }

    /// Payload bytes of one local leaf, for inspection outside callbacks.
    pub fn leaf_payload(&self, which_tree: TreeIndex, index: usize) -> Option<&[u8]> {
        let pool = self.payload_pool.as_ref()?;
        let q = self.trees.get(which_tree as usize)?.quadrants.get(index)?;
        Some(pool.get(q.payload))
    }

    pub(crate) fn update_local_count(&mut self) {
        let mut count = 0i64;
        for t in self.first_local_tree..=self.last_local_tree {
            count += self.trees[t as usize].num_quadrants() as i64;
        }
        self.local_num_quadrants = count;
    }

    /// Refresh the global distribution descriptors from the local leaf
    /// counts. Collective.
    pub fn synchronize_global(&mut self) -> Result<(), TransportError> {
        let counts = self.comm.all_gather_i64(self.local_num_quadrants)?;
        let mut cumulative = 0i64;
        self.global_last_quad_index = counts
            .iter()
            .map(|c| {
                cumulative += c;
                cumulative - 1
            })
            .collect();
        self.global_num_quadrants = cumulative;

        let mine: [i64; 3] = if self.first_local_tree >= 0 {
            let q = self.trees[self.first_local_tree as usize].quadrants[0];
            [self.first_local_tree as i64, q.x as i64, q.y as i64]
        } else {
            [-1, 0, 0]
        };
        let gathered = self.comm.all_gather_i64_slice(&mine)?;

        let size = self.comm.size();
        let sentinel = Position {
            which_tree: self.connectivity.num_trees,
            quad: Quadrant::new(0, 0, MAXLEVEL),
        };
        let mut positions = vec![sentinel; size + 1];
        for r in (0..size).rev() {
            let t = gathered[3 * r];
            positions[r] = if t < 0 {
                positions[r + 1]
            } else {
                Position {
                    which_tree: t as TreeIndex,
                    quad: Quadrant::new(gathered[3 * r + 1] as Coord, gathered[3 * r + 2] as Coord, MAXLEVEL),
                }
            };
        }
        self.global_first_position = positions;
        Ok(())
    }

    /// Structural validity of the local state: sorted overlap-free leaf
    /// arrays, consistent counters and payload references.
    pub fn is_valid(&self) -> bool {
        let mut count = 0i64;
        for (t, tree) in self.trees.iter().enumerate() {
            let local = (t as TreeIndex) >= self.first_local_tree
                && (t as TreeIndex) <= self.last_local_tree;
            if !local && tree.num_quadrants() != 0 {
                return false;
            }
            if local && tree.num_quadrants() == 0 {
                return false;
            }
            if !tree.is_linear() {
                return false;
            }
            let mut histogram = [0i64; MAXLEVEL as usize + 1];
            let mut maxlevel: i8 = -1;
            for q in &tree.quadrants {
                if !q.is_valid() || q.level > QMAXLEVEL {
                    return false;
                }
                if self.data_size > 0 && q.payload.is_none() {
                    return false;
                }
                histogram[q.level as usize] += 1;
                maxlevel = maxlevel.max(q.level);
            }
            if histogram != tree.quadrants_per_level || maxlevel != tree.maxlevel {
                return false;
            }
            count += tree.num_quadrants() as i64;
        }
        count == self.local_num_quadrants
    }
}

/// Replace `parent` by its four children on the stack, copying its
/// payload into each child before initialization; the parent payload is
/// released. Children are pushed so that child 0 pops first.
fn split_into(
    stack: &mut Vec<Quadrant>,
    parent: &Quadrant,
    pool: &mut Option<PayloadPool>,
    info: &ForestRef<'_>,
    init_fn: Option<InitFn>,
    which_tree: TreeIndex,
) {
    let parent_bytes = pool.as_ref().map(|p| p.get(parent.payload).to_vec());
    let mut children = parent.children();
    for child in children.iter_mut() {
        if let Some(p) = pool.as_mut() {
            child.payload = p.alloc();
            let block = p.get_mut(child.payload);
            block.copy_from_slice(parent_bytes.as_ref().unwrap());
            if let Some(f) = init_fn {
                f(info, which_tree, child, block);
            }
        } else if let Some(f) = init_fn {
            f(info, which_tree, child, &mut []);
        }
    }
    if let Some(p) = pool.as_mut() {
        p.free(parent.payload);
    }
    for child in children.iter().rev() {
        stack.push(*child);
    }
}
