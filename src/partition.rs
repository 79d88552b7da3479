//! Weighted repartitioning of the global leaf sequence.

use crate::comm::{Communicator, TransportError};
use crate::forest::{Forest, WeightFn};
use crate::morton::{Coord, Quadrant, TreeIndex};

const META_TAG: u16 = 0x21;
const PAYLOAD_TAG: u16 = 0x22;

/// Redistribute the leaves so that every rank carries a contiguous slice
/// of the global Morton sequence with close to `1/P` of the total weight.
/// Payload bytes travel with their leaves, verbatim. Without a weight
/// callback the split is the exact uniform cut: rank `r` receives the
/// leaves `floor(rN/P)..floor((r+1)N/P)`.
pub fn partition<C: Communicator>(
    forest: &mut Forest<C>,
    weight_fn: Option<WeightFn>,
) -> Result<(), TransportError> {
    forest.synchronize_global()?;
    let rank = forest.comm.rank();
    let size = forest.comm.size();
    let total = forest.global_num_quadrants;
    if total == 0 {
        return Ok(());
    }

    let first_global: i64 = if rank == 0 {
        0
    } else {
        forest.global_last_quad_index[rank - 1] + 1
    };

    // Destination rank of every local leaf, ascending by construction.
    let destinations: Vec<usize> = if let Some(weight) = weight_fn {
        let info = forest.forest_ref();
        let mut weights: Vec<i64> = Vec::with_capacity(forest.local_num_quadrants as usize);
        for t in forest.first_local_tree..=forest.last_local_tree {
            for q in &forest.trees[t as usize].quadrants {
                weights.push(weight(&info, t, q) as i64);
            }
        }
        let local_weight: i64 = weights.iter().sum();
        let total_weight = forest.comm.all_reduce_sum_i64(local_weight)?;
        assert!(
            total_weight.checked_mul(size as i64).is_some(),
            "total partition weight times process count must stay below 2^63"
        );
        let mut prefix = forest.comm.exclusive_scan_sum_i64(local_weight)?;
        let targets = cut_targets(total_weight, size);
        weights
            .iter()
            .map(|w| {
                let dest = destination_rank(prefix, &targets);
                prefix += w;
                dest
            })
            .collect()
    } else {
        (0..forest.local_num_quadrants)
            .map(|i| uniform_destination(first_global + i, total, size))
            .collect()
    };
    debug_assert!(destinations.windows(2).all(|w| w[0] <= w[1]));

    // Sizes phase: the full traffic matrix, senders by row.
    let mut send_counts = vec![0i64; size];
    for &dest in &destinations {
        send_counts[dest] += 1;
    }
    let matrix = forest.comm.all_gather_i64_slice(&send_counts)?;

    // Serialize the local leaves and their payloads in global order.
    let data_size = forest.data_size;
    let mut local: Vec<(TreeIndex, Quadrant)> =
        Vec::with_capacity(forest.local_num_quadrants as usize);
    let mut local_payload: Vec<u8> =
        Vec::with_capacity(data_size * forest.local_num_quadrants as usize);
    for t in forest.first_local_tree..=forest.last_local_tree {
        for q in &forest.trees[t as usize].quadrants {
            local.push((t, *q));
            if let Some(pool) = forest.payload_pool.as_ref() {
                local_payload.extend_from_slice(pool.get(q.payload));
            }
        }
    }

    // Blob phases: metadata and payloads on distinct tags, receives in
    // source-rank order so segments concatenate in global order.
    let mut outgoing: Vec<(usize, u16, Vec<u8>)> = Vec::new();
    let mut begin = 0usize;
    let mut keep = (0usize, 0usize);
    for dest in 0..size {
        let count = send_counts[dest] as usize;
        if count == 0 {
            continue;
        }
        let end = begin + count;
        if dest == rank {
            keep = (begin, end);
        } else {
            outgoing.push((dest, META_TAG, pack_quadrants(&local[begin..end])));
            if data_size > 0 {
                outgoing.push((
                    dest,
                    PAYLOAD_TAG,
                    local_payload[begin * data_size..end * data_size].to_vec(),
                ));
            }
        }
        begin = end;
    }
    let mut incoming: Vec<(usize, u16)> = Vec::new();
    for source in 0..size {
        if source == rank || matrix[source * size + rank] == 0 {
            continue;
        }
        incoming.push((source, META_TAG));
        if data_size > 0 {
            incoming.push((source, PAYLOAD_TAG));
        }
    }
    let received = forest.comm.exchange_bytes(&outgoing, &incoming)?;
    forest.comm.barrier()?;

    // Reassemble the new local slice from the segments in source order.
    let new_count: i64 = (0..size).map(|s| matrix[s * size + rank]).sum();
    let mut stream: Vec<(TreeIndex, Quadrant)> = Vec::with_capacity(new_count as usize);
    let mut stream_payload: Vec<u8> = Vec::with_capacity(data_size * new_count as usize);
    let mut received = received.into_iter();
    for source in 0..size {
        if source == rank {
            if keep.1 > keep.0 {
                stream.extend_from_slice(&local[keep.0..keep.1]);
                if data_size > 0 {
                    stream_payload
                        .extend_from_slice(&local_payload[keep.0 * data_size..keep.1 * data_size]);
                }
            }
            continue;
        }
        if matrix[source * size + rank] == 0 {
            continue;
        }
        stream.extend(unpack_quadrants(&received.next().unwrap()));
        if data_size > 0 {
            stream_payload.extend_from_slice(&received.next().unwrap());
        }
    }
    debug_assert_eq!(stream.len() as i64, new_count);

    // Rebuild the trees and the payload pool from the stream.
    for tree in &mut forest.trees {
        tree.quadrants.clear();
    }
    forest.payload_pool = (data_size > 0).then(|| crate::pool::PayloadPool::new(data_size));
    for (i, (t, mut q)) in stream.into_iter().enumerate() {
        if let Some(pool) = forest.payload_pool.as_mut() {
            q.payload = pool.alloc();
            pool.get_mut(q.payload)
                .copy_from_slice(&stream_payload[i * data_size..(i + 1) * data_size]);
        }
        forest.trees[t as usize].quadrants.push(q);
    }
    forest.first_local_tree = -1;
    forest.last_local_tree = -2;
    for (t, tree) in forest.trees.iter_mut().enumerate() {
        tree.update_cached();
        if tree.num_quadrants() > 0 {
            if forest.first_local_tree < 0 {
                forest.first_local_tree = t as TreeIndex;
            }
            forest.last_local_tree = t as TreeIndex;
        }
    }
    forest.local_num_quadrants = new_count;
    forest.synchronize_global()?;
    Ok(())
}

/// Ideal cumulative weight in front of each rank's first leaf.
pub(crate) fn cut_targets(total_weight: i64, size: usize) -> Vec<i64> {
    (0..size)
        .map(|r| (r as i64 * total_weight + size as i64 / 2) / size as i64)
        .collect()
}

/// Highest rank whose target does not exceed the given prefix weight.
pub(crate) fn destination_rank(prefix: i64, targets: &[i64]) -> usize {
    targets.partition_point(|t| *t <= prefix) - 1
}

/// Destination rank of global leaf `index` under uniform weights: the
/// exact integer cut `floor(rN/P)`.
pub(crate) fn uniform_destination(index: i64, total: i64, size: usize) -> usize {
    (((index + 1) * size as i64 - 1) / total) as usize
}

/// Wire form of a leaf: tree, anchor and level as four little-endian
/// 32-bit words.
pub(crate) fn pack_quadrants(items: &[(TreeIndex, Quadrant)]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(items.len() * 16);
    for (t, q) in items {
        bytes.extend_from_slice(&t.to_le_bytes());
        bytes.extend_from_slice(&q.x.to_le_bytes());
        bytes.extend_from_slice(&q.y.to_le_bytes());
        bytes.extend_from_slice(&(q.level as i32).to_le_bytes());
    }
    bytes
}

pub(crate) fn unpack_quadrants(bytes: &[u8]) -> Vec<(TreeIndex, Quadrant)> {
    debug_assert!(bytes.len() % 16 == 0);
    bytes
        .chunks_exact(16)
        .map(|chunk| {
            let t = TreeIndex::from_le_bytes(chunk[0..4].try_into().unwrap());
            let x = Coord::from_le_bytes(chunk[4..8].try_into().unwrap());
            let y = Coord::from_le_bytes(chunk[8..12].try_into().unwrap());
            let level = i32::from_le_bytes(chunk[12..16].try_into().unwrap()) as i8;
            (t, Quadrant::new(x, y, level))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::comm::NullCommunicator;
    use crate::connectivity::Connectivity;
    use crate::forest::ForestRef;

    fn refine_below3(_: &ForestRef<'_>, _: TreeIndex, q: &Quadrant) -> bool {
        q.level() < 3
    }

    fn stamp_init(_: &ForestRef<'_>, _: TreeIndex, q: &Quadrant, data: &mut [u8]) {
        data[0] = q.level() as u8;
        data[1] = (q.x >> 27) as u8;
    }

    #[test]
    fn test_uniform_destination_cuts() {
        // N = 10, P = 4 cuts at 0, 2, 5, 7.
        let dests: Vec<usize> = (0..10).map(|i| uniform_destination(i, 10, 4)).collect();
        assert_eq!(dests, vec![0, 0, 1, 1, 1, 2, 2, 3, 3, 3]);

        // Exact cut sizes floor((r+1)N/P) - floor(rN/P).
        for p in [1usize, 3, 4, 7] {
            let n = 64i64;
            let mut sizes = vec![0i64; p];
            for i in 0..n {
                sizes[uniform_destination(i, n, p)] += 1;
            }
            for (r, &s) in sizes.iter().enumerate() {
                let expected = ((r as i64 + 1) * n) / p as i64 - (r as i64 * n) / p as i64;
                assert_eq!(s, expected);
            }
        }
    }

    #[test]
    fn test_weighted_destinations() {
        let weights: Vec<i64> = vec![3, 1, 4, 1, 5, 9, 2, 6, 5, 3];
        let total: i64 = weights.iter().sum();
        let size = 4usize;
        let targets = cut_targets(total, size);
        assert_eq!(targets, vec![0, 10, 20, 29]);

        let mut prefix = 0i64;
        let mut dests = Vec::new();
        for w in &weights {
            dests.push(destination_rank(prefix, &targets));
            prefix += w;
        }
        assert_eq!(dests, vec![0, 0, 0, 0, 0, 1, 2, 2, 3, 3]);

        // Every rank's load is within max weight + 1 of the ideal share.
        let max_weight = *weights.iter().max().unwrap();
        let ideal = total as f64 / size as f64;
        for r in 0..size {
            let load: i64 = weights
                .iter()
                .zip(&dests)
                .filter(|(_, d)| **d == r)
                .map(|(w, _)| w)
                .sum();
            assert!((load as f64 - ideal).abs() <= (max_weight + 1) as f64);
        }
    }

    #[test]
    fn test_weighted_destinations_random() {
        use rand::prelude::*;
        use rand::SeedableRng;

        let mut rng = StdRng::seed_from_u64(0);
        let weights: Vec<i64> = (0..1000).map(|_| rng.gen_range(0..32)).collect();
        let total: i64 = weights.iter().sum();
        let max_weight = *weights.iter().max().unwrap();

        for size in [2usize, 5, 16] {
            let targets = cut_targets(total, size);
            let mut prefix = 0i64;
            let mut dests = Vec::new();
            for w in &weights {
                dests.push(destination_rank(prefix, &targets));
                prefix += w;
            }
            assert!(dests.windows(2).all(|w| w[0] <= w[1]));
            assert!(*dests.last().unwrap() < size);

            let ideal = total as f64 / size as f64;
            for r in 0..size {
                let load: i64 = weights
                    .iter()
                    .zip(&dests)
                    .filter(|(_, d)| **d == r)
                    .map(|(w, _)| w)
                    .sum();
                assert!((load as f64 - ideal).abs() <= (max_weight + 1) as f64);
            }
        }
    }

    #[test]
    fn test_pack_unpack_round_trip() {
        let items = vec![
            (0, Quadrant::new(0, 0, 0)),
            (2, Quadrant::new(1 << 27, 3 << 27, 3)),
            (5, Quadrant::new((1 << 30) - 2, 4, 29)),
        ];
        assert_eq!(unpack_quadrants(&pack_quadrants(&items)), items);
    }

    #[test]
    fn test_partition_identity_on_one_rank() {
        let mut forest = crate::forest::Forest::new(
            NullCommunicator::new(),
            Arc::new(Connectivity::unit_square()),
            0,
            2,
            Some(stamp_init),
            None,
        );
        forest.refine(true, refine_below3, Some(stamp_init));
        let leaves = forest.trees[0].quadrants.clone();
        let checksum = forest.checksum().unwrap();
        let payload0 = forest.leaf_payload(0, 7).unwrap().to_vec();

        partition(&mut forest, None).unwrap();
        assert!(forest.is_valid());
        assert_eq!(forest.trees[0].quadrants, leaves);
        assert_eq!(forest.checksum().unwrap(), checksum);
        assert_eq!(forest.leaf_payload(0, 7).unwrap(), &payload0[..]);

        // A weight function changes nothing on a single rank either.
        fn by_level(_: &ForestRef<'_>, _: TreeIndex, q: &Quadrant) -> u32 {
            1 + q.level() as u32
        }
        partition(&mut forest, Some(by_level)).unwrap();
        assert!(forest.is_valid());
        assert_eq!(forest.trees[0].quadrants, leaves);
        assert_eq!(forest.checksum().unwrap(), checksum);
    }

    #[test]
    fn test_partition_refreshes_descriptors() {
        let mut forest = crate::forest::Forest::new(
            NullCommunicator::new(),
            Arc::new(Connectivity::corner()),
            0,
            0,
            None,
            None,
        );
        forest.refine(true, refine_below3, None);
        partition(&mut forest, None).unwrap();

        assert_eq!(forest.global_num_quadrants, 3 * 64);
        assert_eq!(forest.global_last_quad_index, vec![3 * 64 - 1]);
        assert_eq!(forest.first_local_tree, 0);
        assert_eq!(forest.last_local_tree, 2);
        assert_eq!(forest.global_first_position[0].which_tree, 0);
        assert_eq!(forest.global_first_position[1].which_tree, 3);
    }
}
