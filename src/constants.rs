//! Crate wide constants

use crate::morton::{Coord, Quadrant};

/// Finest level used for coordinate-only quadrants (descendant bounds,
/// partition positions).
pub const MAXLEVEL: i8 = 30;

/// Finest level at which leaves carrying cell data may live.
pub const QMAXLEVEL: i8 = 29;

/// Side length of the root quadrant.
pub const ROOT_LEN: Coord = 1 << MAXLEVEL;

/// Children per quadrant.
pub const NUM_CHILDREN: usize = 4;

/// Faces per quadrant, right-hand rule: 0 bottom, 1 right, 2 top, 3 left.
pub const NUM_FACES: usize = 4;

/// Corners per quadrant, counterclockwise from the origin corner.
pub const NUM_CORNERS: usize = 4;

/// The level-0 root cell.
pub const ROOT: Quadrant = Quadrant::new(0, 0, 0);

/// Side length of a quadrant at the given level.
pub const fn length_at_level(level: i8) -> Coord {
    1 << (MAXLEVEL - level)
}
