//! Partition behavior on concrete decompositions.

use haloex::{Dim3, HaloError, Partition, PrimeFactorPartition};

#[test]
fn splits_10x5x5_into_2x1() {
    let part = PrimeFactorPartition::new(Dim3::new(10, 5, 5), 2, 1).unwrap();

    assert_eq!(part.get_rank(Dim3::new(0, 0, 0)), 0);
    assert_eq!(part.gpu_dim(), Dim3::new(1, 1, 1));
    assert_eq!(part.rank_dim(), Dim3::new(2, 1, 1));

    for rank in 0..2 {
        assert!(part.rank_idx(rank).all_ge(0));
        assert!(part.rank_idx(rank).all_lt(part.rank_dim()));
        assert_eq!(part.get_rank(part.rank_idx(rank)), rank);
    }
    for slot in 0..1 {
        assert!(part.gpu_idx(slot).all_ge(0));
        assert!(part.gpu_idx(slot).all_lt(part.gpu_dim()));
        assert_eq!(part.get_gpu(part.gpu_idx(slot)), slot);
    }

    assert_eq!(part.local_domain_size(Dim3::new(0, 0, 0)), Dim3::new(5, 5, 5));
}

#[test]
fn splits_10x3x1_into_4x1() {
    let part = PrimeFactorPartition::new(Dim3::new(10, 3, 1), 4, 1).unwrap();

    assert_eq!(part.local_domain_size(Dim3::new(0, 0, 0)), Dim3::new(3, 3, 1));
    assert_eq!(part.local_domain_size(Dim3::new(1, 0, 0)), Dim3::new(3, 3, 1));
    assert_eq!(part.local_domain_size(Dim3::new(2, 0, 0)), Dim3::new(2, 3, 1));
    assert_eq!(part.local_domain_size(Dim3::new(3, 0, 0)), Dim3::new(2, 3, 1));
}

#[test]
fn splits_10x5x5_into_3x1() {
    let part = PrimeFactorPartition::new(Dim3::new(10, 5, 5), 3, 1).unwrap();

    assert_eq!(part.local_domain_size(Dim3::new(0, 0, 0)), Dim3::new(4, 5, 5));
    assert_eq!(part.local_domain_size(Dim3::new(1, 0, 0)), Dim3::new(3, 5, 5));
    assert_eq!(part.local_domain_size(Dim3::new(2, 0, 0)), Dim3::new(3, 5, 5));
}

#[test]
fn splits_13x7x7_into_4x1() {
    let part = PrimeFactorPartition::new(Dim3::new(13, 7, 7), 4, 1).unwrap();

    assert_eq!(part.local_domain_size(Dim3::new(0, 0, 0)), Dim3::new(4, 7, 7));
    assert_eq!(part.local_domain_size(Dim3::new(1, 0, 0)), Dim3::new(3, 7, 7));
    assert_eq!(part.local_domain_size(Dim3::new(2, 0, 0)), Dim3::new(3, 7, 7));
    assert_eq!(part.local_domain_size(Dim3::new(3, 0, 0)), Dim3::new(3, 7, 7));
}

#[test]
fn splits_17x7x7_into_3x2() {
    // First split is x into 6,6,5 (ranks), then y into 4 and 3 (devices).
    let part = PrimeFactorPartition::new(Dim3::new(17, 7, 7), 3, 2).unwrap();

    assert_eq!(part.rank_dim(), Dim3::new(3, 1, 1));
    assert_eq!(part.gpu_dim(), Dim3::new(1, 2, 1));

    assert_eq!(part.local_domain_size(Dim3::new(0, 0, 0)), Dim3::new(6, 4, 7));
    assert_eq!(part.local_domain_size(Dim3::new(1, 0, 0)), Dim3::new(6, 4, 7));
    assert_eq!(part.local_domain_size(Dim3::new(2, 0, 0)), Dim3::new(5, 4, 7));
    assert_eq!(part.local_domain_size(Dim3::new(0, 1, 0)), Dim3::new(6, 3, 7));
    assert_eq!(part.local_domain_size(Dim3::new(1, 1, 0)), Dim3::new(6, 3, 7));
    assert_eq!(part.local_domain_size(Dim3::new(2, 1, 0)), Dim3::new(5, 3, 7));

    // Composite index: rank 2, slot 1 sits at (2, 1, 0).
    assert_eq!(part.dom_idx(2, 1), Dim3::new(2, 1, 0));
    assert_eq!(part.get_rank(Dim3::new(2, 1, 0)), 2);
    assert_eq!(part.get_gpu(Dim3::new(2, 1, 0)), 1);
}

#[test]
fn roundtrip_laws_hold_for_larger_grids() {
    let part = PrimeFactorPartition::new(Dim3::new(24, 24, 24), 12, 4).unwrap();
    let ranks = part.rank_dim().prod();
    let slots = part.gpu_dim().prod();
    assert_eq!(ranks, 12);
    assert_eq!(slots, 4);

    // get_rank/get_gpu take composite indices, so the round-trip on a
    // non-trivial device grid goes through dom_idx.
    for rank in 0..ranks as u32 {
        for slot in 0..slots as usize {
            let idx = part.dom_idx(rank, slot);
            assert_eq!(part.get_rank(idx), rank);
            assert_eq!(part.get_gpu(idx), slot);
        }
    }
    for slot in 0..slots as usize {
        assert_eq!(part.get_gpu(part.gpu_idx(slot)), slot);
    }

    // Every composite cell maps back to a consistent (rank, slot).
    let grid = part.global_dim();
    for z in 0..grid.z {
        for y in 0..grid.y {
            for x in 0..grid.x {
                let idx = Dim3::new(x, y, z);
                let rank = part.get_rank(idx);
                let slot = part.get_gpu(idx);
                assert_eq!(part.dom_idx(rank, slot), idx);
            }
        }
    }
}

#[test]
fn rank_roundtrip_holds_on_trivial_device_grid() {
    // With one device slot the composite grid is the rank grid, so the
    // rank index itself round-trips through get_rank.
    let part = PrimeFactorPartition::new(Dim3::new(24, 24, 24), 12, 1).unwrap();
    assert_eq!(part.rank_dim(), Dim3::new(3, 2, 2));
    assert_eq!(part.gpu_dim(), Dim3::new(1, 1, 1));

    for rank in 0..12 {
        assert!(part.rank_idx(rank).all_ge(0));
        assert!(part.rank_idx(rank).all_lt(part.rank_dim()));
        assert_eq!(part.get_rank(part.rank_idx(rank)), rank);
    }
    assert_eq!(part.get_gpu(part.gpu_idx(0)), 0);
}

#[test]
fn local_sizes_sum_to_global_extent_per_axis() {
    for (size, ranks, gpus) in [
        (Dim3::new(10, 3, 1), 4, 1),
        (Dim3::new(17, 7, 7), 3, 2),
        (Dim3::new(23, 19, 5), 6, 2),
    ] {
        let part = PrimeFactorPartition::new(size, ranks, gpus).unwrap();
        let grid = part.global_dim();
        for a in 0..3 {
            let mut idx = Dim3::ZERO;
            let mut sum = 0;
            for i in 0..grid.get(a) {
                idx.set(a, i);
                sum += part.local_domain_size(idx).get(a);
            }
            assert_eq!(sum, size.get(a), "axis {a} of {size}");
        }
    }
}

#[test]
fn origins_follow_sizes() {
    let part = PrimeFactorPartition::new(Dim3::new(17, 7, 7), 3, 2).unwrap();
    let grid = part.global_dim();
    for z in 0..grid.z {
        for y in 0..grid.y {
            for x in 0..grid.x {
                let idx = Dim3::new(x, y, z);
                let origin = part.local_domain_origin(idx);
                for a in 0..3 {
                    if idx.get(a) == 0 {
                        assert_eq!(origin.get(a), 0);
                    } else {
                        let mut prev = idx;
                        prev.set(a, idx.get(a) - 1);
                        assert_eq!(
                            origin.get(a),
                            part.local_domain_origin(prev).get(a)
                                + part.local_domain_size(prev).get(a)
                        );
                    }
                }
            }
        }
    }
}

#[test]
fn infeasible_decompositions_are_rejected() {
    for (size, ranks, gpus) in [
        (Dim3::new(1, 1, 1), 4, 1),
        (Dim3::new(2, 2, 2), 16, 1),
        (Dim3::new(8, 8, 8), 0, 1),
        (Dim3::new(8, 8, 8), 2, 0),
    ] {
        assert!(
            matches!(
                PrimeFactorPartition::new(size, ranks, gpus),
                Err(HaloError::PartitionInfeasible { .. })
            ),
            "{size} into {ranks}x{gpus}"
        );
    }
}
