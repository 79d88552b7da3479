//! Binary searches and range decompositions over sorted leaf arrays.

use crate::constants::{MAXLEVEL, NUM_CHILDREN, ROOT};
use crate::morton::Quadrant;

/// Find the lowest position `i` such that `array[i] >= q`, starting the
/// bisection at `guess`. Returns `None` if no such position exists.
///
/// Ancestors order before their descendants, so a query for an ancestor
/// matches strictly before any of its descendants in the array.
pub fn find_lower_bound(array: &[Quadrant], q: &Quadrant, guess: usize) -> Option<usize> {
    if array.is_empty() {
        return None;
    }
    let mut lo = 0usize;
    let mut hi = array.len() - 1;
    let mut guess = guess.min(hi);
    loop {
        if array[guess] < *q {
            lo = guess + 1;
            if lo > hi {
                return None;
            }
        } else {
            if guess == 0 || array[guess - 1] < *q {
                return Some(guess);
            }
            hi = guess - 1;
        }
        guess = (lo + hi) / 2;
    }
}

/// Find the highest position `i` such that `array[i] <= q`, starting the
/// bisection at `guess`. Returns `None` if no such position exists.
pub fn find_higher_bound(array: &[Quadrant], q: &Quadrant, guess: usize) -> Option<usize> {
    if array.is_empty() {
        return None;
    }
    let mut lo = 0usize;
    let mut hi = array.len() - 1;
    let mut guess = guess.min(hi);
    loop {
        if array[guess] > *q {
            if guess == 0 {
                return None;
            }
            hi = guess - 1;
        } else if guess + 1 >= array.len() || array[guess + 1] > *q {
            return Some(guess);
        } else {
            lo = guess + 1;
        }
        guess = (lo + hi) / 2;
    }
}

/// Given a sorted array whose quadrants share an ancestor at `level`,
/// return five indices so that the descendants of child `k` of that
/// ancestor occupy `array[indices[k]..indices[k + 1]]`. Empty children
/// yield an empty range.
pub fn split_array(array: &[Quadrant], level: i8) -> [usize; NUM_CHILDREN + 1] {
    debug_assert!(level < MAXLEVEL);
    debug_assert!(array.iter().all(|q| q.level > level));

    let mut indices = [0usize; NUM_CHILDREN + 1];
    indices[NUM_CHILDREN] = array.len();
    for k in 1..NUM_CHILDREN {
        indices[k] = array.partition_point(|q| q.ancestor_id(level + 1) < k);
    }
    indices
}

/// Which parts of the boundary of the level-`level` containing cell are
/// touched by the inclusive leaf range `[lq, uq]`. `None` bounds stand
/// for the start or end of the tree. The result has faces in bits 0..4
/// and corners in bits 4..8.
pub fn find_range_boundaries(lq: Option<&Quadrant>, uq: Option<&Quadrant>, level: i8) -> i32 {
    let cell = match (lq, uq) {
        (Some(q), _) => q.ancestor(level),
        (_, Some(q)) => q.ancestor(level),
        (None, None) => {
            debug_assert!(level == 0);
            ROOT
        }
    };
    let lo = lq
        .map(|q| q.first_descendant(MAXLEVEL))
        .unwrap_or_else(|| cell.first_descendant(MAXLEVEL));
    let hi = uq
        .map(|q| q.last_descendant(MAXLEVEL))
        .unwrap_or_else(|| cell.last_descendant(MAXLEVEL));
    debug_assert!(lo <= hi);

    range_mask(&cell, &lo, &hi)
}

fn range_mask(cell: &Quadrant, lo: &Quadrant, hi: &Quadrant) -> i32 {
    let first = cell.first_descendant(MAXLEVEL);
    let last = cell.last_descendant(MAXLEVEL);
    if *lo <= first && last <= *hi {
        return 0xFF;
    }
    if *hi < first || last < *lo {
        return 0;
    }

    // Only the children along the two range ends are partially covered.
    let mut mask = 0;
    for k in 0..NUM_CHILDREN {
        let child = cell.child(k);
        let cmask = range_mask(&child, lo, hi);
        if cmask == 0 {
            continue;
        }
        let xi = k & 1;
        let yi = (k >> 1) & 1;
        if yi == 0 {
            mask |= cmask & (1 << 0);
        }
        if xi == 1 {
            mask |= cmask & (1 << 1);
        }
        if yi == 1 {
            mask |= cmask & (1 << 2);
        }
        if xi == 0 {
            mask |= cmask & (1 << 3);
        }
        // The child in z-position k holds one corner of the parent.
        let corner = match k {
            0 => 0,
            1 => 1,
            3 => 2,
            _ => 3,
        };
        mask |= cmask & (1 << (4 + corner));
    }
    mask
}
