//! The fixed inter-tree adjacency graph and its coordinate transforms.

use crate::constants::{length_at_level, NUM_CORNERS, NUM_FACES, ROOT_LEN};
use crate::morton::{Quadrant, TreeIndex};

/// Inter-tree transformation codes indexed by my face, the neighbor's face
/// and the orientation (0 for the same, 1 for the opposing sense of
/// rotation). The first four transforms are rotations about 0, -90, 180
/// and 90 degrees, the second four are reflections along the axes at 0,
/// 45, 90 and 135 degrees.
pub const TRANSFORM_TABLE: [[[i8; 2]; 4]; 4] = [
    [[2, 4], [1, 5], [0, 6], [3, 7]],
    [[3, 5], [2, 6], [1, 7], [0, 4]],
    [[0, 6], [3, 7], [2, 4], [1, 5]],
    [[1, 7], [0, 4], [3, 5], [2, 6]],
];

/// Resolved transform for one face of one tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FaceTransform {
    pub neighbor_tree: TreeIndex,
    pub neighbor_face: usize,
    /// 0 when both trees share the sense of rotation, 1 when it flips.
    pub orientation: usize,
    /// Index into the eight rigid frame maps.
    pub transform: i8,
}

/// One corner neighbor that is not already reachable through a face.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CornerInfo {
    pub neighbor_tree: TreeIndex,
    pub neighbor_corner: usize,
}

/// The inter-tree connectivity. Immutable after construction and shared
/// between forests.
///
/// Faces and corners are numbered by the right-hand rule: corners run
/// counterclockwise from the origin corner, face `f` runs from corner `f`
/// to corner `f + 1`. `tree_to_face` holds the neighbor's face index,
/// `0..4` for equal and `4..8` for opposite orientation; a face without a
/// neighbor stores the tree and face themselves. The `vertex_to_*` arrays
/// hold a variable number of entries per vertex, delimited by
/// `vtt_offset`.
#[derive(Debug)]
pub struct Connectivity {
    pub num_trees: TreeIndex,
    pub num_vertices: TreeIndex,
    pub tree_to_vertex: Vec<[TreeIndex; 4]>,
    pub tree_to_tree: Vec<[TreeIndex; 4]>,
    pub tree_to_face: Vec<[i8; 4]>,
    pub vtt_offset: Vec<TreeIndex>,
    pub vertex_to_tree: Vec<TreeIndex>,
    pub vertex_to_vertex: Vec<TreeIndex>,
}

impl Connectivity {
    /// A single tree with no neighbors.
    pub fn unit_square() -> Connectivity {
        Connectivity {
            num_trees: 1,
            num_vertices: 4,
            tree_to_vertex: vec![[0, 1, 2, 3]],
            tree_to_tree: vec![[0, 0, 0, 0]],
            tree_to_face: vec![[0, 1, 2, 3]],
            vtt_offset: vec![0, 1, 2, 3, 4],
            vertex_to_tree: vec![0, 0, 0, 0],
            vertex_to_vertex: vec![0, 1, 2, 3],
        }
    }

    /// Three trees meeting at one vertex. Trees 0 and 1 share a face, as
    /// do trees 1 and 2; trees 0 and 2 touch only at the central vertex.
    pub fn corner() -> Connectivity {
        Connectivity {
            num_trees: 3,
            num_vertices: 8,
            tree_to_vertex: vec![[0, 1, 2, 3], [1, 4, 5, 2], [2, 5, 6, 7]],
            tree_to_tree: vec![[0, 1, 0, 0], [1, 1, 2, 0], [1, 2, 2, 2]],
            tree_to_face: vec![[0, 3, 2, 3], [0, 1, 0, 1], [2, 1, 2, 3]],
            vtt_offset: vec![0, 1, 3, 6, 7, 8, 10, 11, 12],
            vertex_to_tree: vec![0, 0, 1, 0, 1, 2, 0, 1, 1, 2, 2, 2],
            vertex_to_vertex: vec![0, 1, 1, 2, 2, 2, 3, 4, 5, 5, 6, 7],
        }
    }

    /// Five trees in a band whose closing seam reverses orientation.
    pub fn moebius() -> Connectivity {
        Connectivity {
            num_trees: 5,
            num_vertices: 10,
            tree_to_vertex: vec![
                [0, 1, 6, 5],
                [1, 2, 7, 6],
                [2, 3, 8, 7],
                [3, 4, 9, 8],
                [4, 5, 0, 9],
            ],
            tree_to_tree: vec![
                [0, 1, 0, 4],
                [1, 2, 1, 0],
                [2, 3, 2, 1],
                [3, 4, 3, 2],
                [4, 0, 4, 3],
            ],
            tree_to_face: vec![
                [0, 3, 2, 5],
                [0, 3, 2, 1],
                [0, 3, 2, 1],
                [0, 3, 2, 1],
                [0, 7, 2, 1],
            ],
            vtt_offset: vec![0, 2, 4, 6, 8, 10, 12, 14, 16, 18, 20],
            vertex_to_tree: vec![0, 4, 0, 1, 1, 2, 2, 3, 3, 4, 0, 4, 0, 1, 1, 2, 2, 3, 3, 4],
            vertex_to_vertex: vec![0, 0, 1, 1, 2, 2, 3, 3, 4, 4, 5, 5, 6, 6, 7, 7, 8, 8, 9, 9],
        }
    }

    /// Six trees fanned around a common vertex at each tree's origin
    /// corner.
    pub fn star() -> Connectivity {
        let mut tree_to_vertex = Vec::with_capacity(6);
        let mut tree_to_tree = Vec::with_capacity(6);
        let mut tree_to_face = Vec::with_capacity(6);
        for i in 0..6i32 {
            tree_to_vertex.push([0, 1 + i, 7 + i, 1 + (i + 5) % 6]);
            tree_to_tree.push([(i + 1) % 6, i, i, (i + 5) % 6]);
            tree_to_face.push([3, 1, 2, 0]);
        }

        let mut vtt_offset = vec![0, 6];
        let mut vertex_to_tree: Vec<TreeIndex> = (0..6).collect();
        let mut vertex_to_vertex: Vec<TreeIndex> = vec![0; 6];
        for i in 0..6i32 {
            // rail between tree i (corner 1) and tree i + 1 (corner 3)
            vertex_to_tree.extend([i, (i + 1) % 6]);
            vertex_to_vertex.extend([1 + i, 1 + i]);
            vtt_offset.push(vertex_to_tree.len() as TreeIndex);
        }
        for i in 0..6i32 {
            // outer diagonal corner of tree i
            vertex_to_tree.push(i);
            vertex_to_vertex.push(7 + i);
            vtt_offset.push(vertex_to_tree.len() as TreeIndex);
        }

        Connectivity {
            num_trees: 6,
            num_vertices: 13,
            tree_to_vertex,
            tree_to_tree,
            tree_to_face,
            vtt_offset,
            vertex_to_tree,
            vertex_to_vertex,
        }
    }

    /// One tree with both face pairs identified, all four corners meeting
    /// in a single vertex.
    pub fn periodic() -> Connectivity {
        Connectivity {
            num_trees: 1,
            num_vertices: 1,
            tree_to_vertex: vec![[0, 0, 0, 0]],
            tree_to_tree: vec![[0, 0, 0, 0]],
            tree_to_face: vec![[2, 3, 0, 1]],
            vtt_offset: vec![0, 4],
            vertex_to_tree: vec![0, 0, 0, 0],
            vertex_to_vertex: vec![0, 0, 0, 0],
        }
    }

    /// Check bidirectionality of face and corner links, orientation
    /// consistency and that every vertex-tree entry references a corner of
    /// that tree.
    pub fn is_valid(&self) -> bool {
        let nt = self.num_trees as usize;
        let nv = self.num_vertices as usize;
        if self.num_trees <= 0 || self.num_vertices <= 0 {
            return false;
        }
        if self.tree_to_vertex.len() != nt
            || self.tree_to_tree.len() != nt
            || self.tree_to_face.len() != nt
            || self.vtt_offset.len() != nv + 1
        {
            return false;
        }
        if self.vtt_offset[0] != 0
            || self.vtt_offset[nv] as usize != self.vertex_to_tree.len()
            || self.vertex_to_tree.len() != self.vertex_to_vertex.len()
        {
            return false;
        }
        if self.vtt_offset.windows(2).any(|w| w[0] > w[1]) {
            return false;
        }

        // Face links must be reciprocal with matching orientation.
        for t in 0..nt {
            for f in 0..NUM_FACES {
                let n = self.tree_to_tree[t][f];
                let code = self.tree_to_face[t][f];
                if n < 0 || n >= self.num_trees || code < 0 || code > 7 {
                    return false;
                }
                if n as usize == t && code == f as i8 {
                    continue; // no neighbor at this face
                }
                let nf = (code % 4) as usize;
                let orientation = code / 4;
                if self.tree_to_tree[n as usize][nf] != t as TreeIndex {
                    return false;
                }
                if self.tree_to_face[n as usize][nf] != f as i8 + 4 * orientation {
                    return false;
                }
            }
        }

        // Every vertex-tree entry references the corner whose vertex it is.
        for k in 0..self.vertex_to_tree.len() {
            let t = self.vertex_to_tree[k];
            let w = self.vertex_to_vertex[k];
            if t < 0 || t >= self.num_trees || w < 0 || w >= self.num_vertices {
                return false;
            }
            if !self.tree_to_vertex[t as usize].contains(&w) {
                return false;
            }
        }

        // Every corner is discoverable from its vertex list.
        for t in 0..nt {
            for c in 0..NUM_CORNERS {
                let v = self.tree_to_vertex[t][c];
                if v < 0 || v >= self.num_vertices {
                    return false;
                }
                let span = self.vtt_offset[v as usize] as usize..self.vtt_offset[v as usize + 1] as usize;
                let found = span.clone().any(|k| {
                    self.vertex_to_tree[k] == t as TreeIndex && self.vertex_to_vertex[k] == v
                });
                if !found {
                    return false;
                }
            }
        }

        true
    }

    /// The transform across face `face` of tree `tree`, or `None` when the
    /// face has no neighbor.
    pub fn find_face_transform(&self, tree: TreeIndex, face: usize) -> Option<FaceTransform> {
        debug_assert!(face < NUM_FACES);
        let neighbor_tree = self.tree_to_tree[tree as usize][face];
        let code = self.tree_to_face[tree as usize][face];
        if neighbor_tree == tree && code == face as i8 {
            return None;
        }
        let neighbor_face = (code % 4) as usize;
        let orientation = (code / 4) as usize;
        Some(FaceTransform {
            neighbor_tree,
            neighbor_face,
            orientation,
            transform: TRANSFORM_TABLE[face][neighbor_face][orientation],
        })
    }

    /// All corner neighbors around corner `corner` of tree `tree`,
    /// excluding the tree itself and the neighbors already discoverable
    /// through the two incident faces.
    pub fn find_corner_info(&self, tree: TreeIndex, corner: usize) -> Vec<CornerInfo> {
        debug_assert!(corner < NUM_CORNERS);
        let mut excluded = vec![(tree, corner)];

        // Face `corner` starts at this corner, face `corner + 3` ends here.
        for (face, is_start) in [(corner, true), ((corner + 3) % 4, false)] {
            if let Some(ft) = self.find_face_transform(tree, face) {
                let nc = face_corner_image(ft.neighbor_face, ft.orientation, is_start);
                excluded.push((ft.neighbor_tree, nc));
            }
        }

        let v = self.tree_to_vertex[tree as usize][corner];
        let span = self.vtt_offset[v as usize] as usize..self.vtt_offset[v as usize + 1] as usize;
        let mut info: Vec<CornerInfo> = Vec::new();
        for k in span {
            let neighbor_tree = self.vertex_to_tree[k];
            let w = self.vertex_to_vertex[k];
            for (neighbor_corner, &cv) in self.tree_to_vertex[neighbor_tree as usize].iter().enumerate() {
                if cv != w || excluded.contains(&(neighbor_tree, neighbor_corner)) {
                    continue;
                }
                let entry = CornerInfo {
                    neighbor_tree,
                    neighbor_corner,
                };
                if !info.contains(&entry) {
                    info.push(entry);
                }
            }
        }
        info
    }

    /// Map a probe that lies beyond face `face` of tree `tree` into the
    /// neighbor tree's frame. Returns `None` at a domain boundary.
    pub fn transform_face_neighbor(
        &self,
        tree: TreeIndex,
        face: usize,
        probe: &Quadrant,
    ) -> Option<(TreeIndex, Quadrant)> {
        let ft = self.find_face_transform(tree, face)?;
        let rigid = probe.transform(ft.transform);
        Some((ft.neighbor_tree, shift_across_face(&rigid, ft.neighbor_face)))
    }

    /// Images of a level-`level` cell pinned to corner `corner`, one per
    /// corner neighbor: the cell of the same size pinned to the neighbor's
    /// matching corner.
    pub fn transform_corner_neighbors(
        &self,
        tree: TreeIndex,
        corner: usize,
        level: i8,
    ) -> Vec<(TreeIndex, Quadrant)> {
        self.find_corner_info(tree, corner)
            .into_iter()
            .map(|ci| (ci.neighbor_tree, quadrant_at_corner(ci.neighbor_corner, level)))
            .collect()
    }
}

/// The corner of the neighbor's face that touches a given end of a shared
/// face. With equal orientation the two right-hand traversals run
/// anti-parallel along the shared edge, so the start of one face meets the
/// end of the other.
fn face_corner_image(neighbor_face: usize, orientation: usize, corner_is_start: bool) -> usize {
    if (orientation == 0) == corner_is_start {
        (neighbor_face + 1) % 4
    } else {
        neighbor_face
    }
}

/// Translate a rigidly transformed probe across the neighbor's face into
/// its root.
fn shift_across_face(q: &Quadrant, neighbor_face: usize) -> Quadrant {
    let (dx, dy) = match neighbor_face {
        0 => (0, -1),
        1 => (1, 0),
        2 => (0, 1),
        _ => (-1, 0),
    };
    Quadrant::new(q.x + dx * ROOT_LEN, q.y + dy * ROOT_LEN, q.level)
}

/// The level-`level` cell pinned to the given root corner.
pub fn quadrant_at_corner(corner: usize, level: i8) -> Quadrant {
    let h = length_at_level(level);
    let (x, y) = match corner {
        0 => (0, 0),
        1 => (ROOT_LEN - h, 0),
        2 => (ROOT_LEN - h, ROOT_LEN - h),
        _ => (0, ROOT_LEN - h),
    };
    Quadrant::new(x, y, level)
}
