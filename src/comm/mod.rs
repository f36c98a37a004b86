//! The cross-host message layer the engine consumes.
//!
//! The engine never talks to a concrete wire transport; it is handed a
//! [`MessageLayer`] at construction so tests can substitute a
//! single-process world ([`LocalComm`]) and deployments can wrap whatever
//! tagged point-to-point layer the site runs.

mod local;

pub use local::LocalComm;

use crate::error::Result;
use crate::types::{Rank, Tag};

/// Identifier for an outstanding asynchronous send or receive.
pub type ReqId = u64;

/// Tagged point-to-point messaging between ranks, plus the collective
/// queries the engine needs: barrier, shared-host discovery, identity,
/// and a wall clock.
///
/// Completion of a send request means the source buffer is reusable
/// (buffered-send semantics are permitted). Every request returned by
/// [`isend`](Self::isend) or [`irecv`](Self::irecv) must be completed by
/// exactly one [`wait`](Self::wait); [`test`](Self::test) is
/// non-destructive and may be called any number of times first.
pub trait MessageLayer: Send + Sync {
    /// This process's rank in `[0, world_size)`.
    fn rank(&self) -> Rank;

    /// Number of participating ranks.
    fn world_size(&self) -> usize;

    /// Block until every rank has entered the barrier.
    fn barrier(&self) -> Result<()>;

    /// Ranks sharing a physical host with this process, self included.
    fn colocated_ranks(&self) -> Result<Vec<Rank>>;

    /// Name of the physical host this process runs on.
    fn processor_name(&self) -> String;

    /// Monotonic wall-clock seconds; used for phase timing.
    fn wtime(&self) -> f64;

    /// Post an asynchronous tagged send of `len` bytes.
    ///
    /// # Safety
    /// `buf` must be valid for `len` bytes until the returned request
    /// completes via [`wait`](Self::wait).
    unsafe fn isend(&self, buf: *const u8, len: usize, dst: Rank, tag: Tag) -> Result<ReqId>;

    /// Post an asynchronous tagged receive of exactly `len` bytes.
    ///
    /// # Safety
    /// `buf` must be valid for writes of `len` bytes until the returned
    /// request completes via [`wait`](Self::wait).
    unsafe fn irecv(&self, buf: *mut u8, len: usize, src: Rank, tag: Tag) -> Result<ReqId>;

    /// True when the request has completed. Non-destructive.
    fn test(&self, req: ReqId) -> Result<bool>;

    /// Block until the request completes, then retire it.
    fn wait(&self, req: ReqId) -> Result<()>;
}
