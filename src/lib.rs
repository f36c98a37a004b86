//! Distributed 3D stencil halo-exchange engine.
//!
//! Partitions a regular 3D domain across (rank, device-slot) pairs, plans
//! the periodic exchange of halo regions between neighboring sub-domains,
//! and drives four transport tiers concurrently: same-device kernel copy,
//! same-rank peer copy, shared-host IPC transfer, and a cross-host staged
//! pipeline. The accelerator runtime and the cross-host message layer are
//! injected traits, so the whole engine runs in a single test process.

pub mod comm;
pub mod config;
pub mod domain;
pub mod error;
pub mod exchange;
pub mod geom;
pub mod message;
pub mod partition;
pub mod plan;
pub mod runtime;
pub mod tag;
pub mod tx;
pub mod types;

pub use comm::{LocalComm, MessageLayer};
pub use config::HaloConfig;
pub use domain::{DomainShape, LocalDomain};
pub use error::{HaloError, Result};
pub use exchange::DistributedDomain;
pub use geom::{Dim3, DirectionMap, Radius};
pub use message::Message;
pub use partition::{Partition, PrimeFactorPartition};
pub use runtime::{DevicePtr, DeviceRuntime, HostRuntime, Region};
pub use tag::MsgKind;
pub use types::{DataHandle, MethodFlags, Rank, Tag};

#[cfg(feature = "cuda")]
pub use runtime::CudaRuntime;
