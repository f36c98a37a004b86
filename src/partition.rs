//! Decomposition of the global extent onto a process grid times a device grid.

use tracing::debug;

use crate::error::{HaloError, Result};
use crate::geom::Dim3;
use crate::types::Rank;

/// The immutable decomposition plan: how the global extent maps onto
/// (rank, device-slot) pairs.
pub trait Partition {
    /// Global domain extent.
    fn size(&self) -> Dim3;

    /// Extent of the process grid; component product equals the rank count.
    fn rank_dim(&self) -> Dim3;

    /// Extent of the device grid; component product equals devices per rank.
    fn gpu_dim(&self) -> Dim3;

    /// Grid position of a flat rank id. Row-major, x fastest.
    fn rank_idx(&self, rank: Rank) -> Dim3;

    /// Grid position of a flat device slot. Row-major, x fastest.
    fn gpu_idx(&self, slot: usize) -> Dim3;

    /// Rank owning the sub-domain at `idx` in the composite grid.
    fn get_rank(&self, idx: Dim3) -> Rank;

    /// Device slot owning the sub-domain at `idx` in the composite grid.
    fn get_gpu(&self, idx: Dim3) -> usize;

    /// Position of `(rank, slot)`'s sub-domain in the composite grid of
    /// extent `rank_dim() * gpu_dim()`.
    fn dom_idx(&self, rank: Rank, slot: usize) -> Dim3;

    /// Interior extent of the sub-domain at `idx`. Along each axis the
    /// first `G_a mod N_a` sub-domains get the ceiling share, the rest the
    /// floor share.
    fn local_domain_size(&self, idx: Dim3) -> Dim3;

    /// Global coordinate of the sub-domain's first interior cell.
    fn local_domain_origin(&self, idx: Dim3) -> Dim3;

    /// Extent of the composite sub-domain grid.
    fn global_dim(&self) -> Dim3 {
        self.rank_dim() * self.gpu_dim()
    }
}

/// Prime-Factor Partition: factor the rank count and the device count into
/// primes, then greedily assign each factor (largest first) to the currently
/// longest axis of the working extent. Rank grid first, device grid on the
/// residual local extent. Ties break toward the lower axis index.
#[derive(Debug, Clone)]
pub struct PrimeFactorPartition {
    size: Dim3,
    rank_dim: Dim3,
    gpu_dim: Dim3,
}

fn prime_factors(mut n: u64) -> Vec<u64> {
    let mut factors = Vec::new();
    let mut p = 2;
    while p * p <= n {
        while n % p == 0 {
            factors.push(p);
            n /= p;
        }
        p += 1;
    }
    if n > 1 {
        factors.push(n);
    }
    factors.sort_unstable_by(|a, b| b.cmp(a));
    factors
}

fn longest_axis(d: Dim3) -> usize {
    let mut best = 0;
    for a in 1..3 {
        if d.get(a) > d.get(best) {
            best = a;
        }
    }
    best
}

fn ceil_div(a: i64, b: i64) -> i64 {
    (a + b - 1) / b
}

impl PrimeFactorPartition {
    pub fn new(size: Dim3, ranks: usize, gpus: usize) -> Result<Self> {
        let infeasible = |rank_dim, gpu_dim| HaloError::PartitionInfeasible {
            global: size,
            rank_grid: rank_dim,
            gpu_grid: gpu_dim,
        };

        if ranks == 0 || gpus == 0 || !size.all_ge(1) {
            return Err(infeasible(Dim3::ZERO, Dim3::ZERO));
        }

        let mut work = size;
        let mut rank_dim = Dim3::ONE;
        for p in prime_factors(ranks as u64) {
            let a = longest_axis(work);
            rank_dim.set(a, rank_dim.get(a) * p as i64);
            work.set(a, ceil_div(work.get(a), p as i64));
        }

        let mut gpu_dim = Dim3::ONE;
        for p in prime_factors(gpus as u64) {
            let a = longest_axis(work);
            gpu_dim.set(a, gpu_dim.get(a) * p as i64);
            work.set(a, ceil_div(work.get(a), p as i64));
        }

        let grid = rank_dim * gpu_dim;
        for a in 0..3 {
            if size.get(a) < grid.get(a) {
                return Err(infeasible(rank_dim, gpu_dim));
            }
        }

        debug!(%size, %rank_dim, %gpu_dim, "prime-factor partition");
        Ok(Self {
            size,
            rank_dim,
            gpu_dim,
        })
    }
}

fn grid_idx(flat: i64, dim: Dim3) -> Dim3 {
    Dim3::new(
        flat % dim.x,
        (flat / dim.x) % dim.y,
        flat / (dim.x * dim.y),
    )
}

fn grid_flat(idx: Dim3, dim: Dim3) -> i64 {
    idx.x + dim.x * (idx.y + dim.y * idx.z)
}

impl Partition for PrimeFactorPartition {
    fn size(&self) -> Dim3 {
        self.size
    }

    fn rank_dim(&self) -> Dim3 {
        self.rank_dim
    }

    fn gpu_dim(&self) -> Dim3 {
        self.gpu_dim
    }

    fn rank_idx(&self, rank: Rank) -> Dim3 {
        assert!((rank as i64) < self.rank_dim.prod(), "rank {rank} out of range");
        grid_idx(rank as i64, self.rank_dim)
    }

    fn gpu_idx(&self, slot: usize) -> Dim3 {
        assert!((slot as i64) < self.gpu_dim.prod(), "slot {slot} out of range");
        grid_idx(slot as i64, self.gpu_dim)
    }

    fn get_rank(&self, idx: Dim3) -> Rank {
        assert!(idx.all_ge(0) && idx.all_lt(self.global_dim()));
        grid_flat(idx.div(self.gpu_dim), self.rank_dim) as Rank
    }

    fn get_gpu(&self, idx: Dim3) -> usize {
        assert!(idx.all_ge(0) && idx.all_lt(self.global_dim()));
        grid_flat(idx.rem(self.gpu_dim), self.gpu_dim) as usize
    }

    fn dom_idx(&self, rank: Rank, slot: usize) -> Dim3 {
        self.rank_idx(rank) * self.gpu_dim + self.gpu_idx(slot)
    }

    fn local_domain_size(&self, idx: Dim3) -> Dim3 {
        let grid = self.global_dim();
        assert!(idx.all_ge(0) && idx.all_lt(grid));
        let mut out = Dim3::ZERO;
        for a in 0..3 {
            let n = grid.get(a);
            let q = self.size.get(a) / n;
            let rem = self.size.get(a) % n;
            out.set(a, q + i64::from(idx.get(a) < rem));
        }
        out
    }

    fn local_domain_origin(&self, idx: Dim3) -> Dim3 {
        let grid = self.global_dim();
        assert!(idx.all_ge(0) && idx.all_lt(grid));
        let mut out = Dim3::ZERO;
        for a in 0..3 {
            let n = grid.get(a);
            let q = self.size.get(a) / n;
            let rem = self.size.get(a) % n;
            out.set(a, idx.get(a) * q + idx.get(a).min(rem));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prime_factors_descending() {
        assert_eq!(prime_factors(12), vec![3, 2, 2]);
        assert_eq!(prime_factors(1), Vec::<u64>::new());
        assert_eq!(prime_factors(13), vec![13]);
    }

    #[test]
    fn test_flat_grid_roundtrip() {
        let dim = Dim3::new(3, 4, 5);
        for flat in 0..dim.prod() {
            assert_eq!(grid_flat(grid_idx(flat, dim), dim), flat);
        }
    }

    #[test]
    fn test_origin_partitions_each_axis() {
        let part = PrimeFactorPartition::new(Dim3::new(10, 3, 1), 4, 1).unwrap();
        assert_eq!(part.local_domain_origin(Dim3::new(0, 0, 0)).x, 0);
        assert_eq!(part.local_domain_origin(Dim3::new(1, 0, 0)).x, 3);
        assert_eq!(part.local_domain_origin(Dim3::new(2, 0, 0)).x, 6);
        assert_eq!(part.local_domain_origin(Dim3::new(3, 0, 0)).x, 8);
    }

    #[test]
    fn test_infeasible() {
        assert!(PrimeFactorPartition::new(Dim3::new(1, 1, 1), 4, 1).is_err());
        assert!(PrimeFactorPartition::new(Dim3::new(8, 8, 8), 0, 1).is_err());
        assert!(PrimeFactorPartition::new(Dim3::new(8, 8, 8), 1, 0).is_err());
    }
}
