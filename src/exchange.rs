//! The distributed domain: construction, `realize()`, and the per-step
//! `exchange()` driver.

use std::collections::HashSet;
use std::sync::Arc;

use indexmap::IndexMap;
use tracing::{debug, info, warn};

use crate::comm::MessageLayer;
use crate::config::HaloConfig;
use crate::domain::{DomainShape, LocalDomain};
use crate::error::{HaloError, Result};
use crate::geom::{Dim3, Radius};
use crate::partition::{Partition, PrimeFactorPartition};
use crate::plan::{build_plan, PlanInputs, SlotMap};
use crate::runtime::DeviceRuntime;
use crate::tx::{
    ColocatedHaloRecver, ColocatedHaloSender, PeerAccessSender, PeerCopySender, RemoteRecver,
    RemoteSender, StatefulRecver, StatefulSender,
};
use crate::types::{DataHandle, MethodFlags, Rank};

/// A regular 3D computational domain partitioned across ranks and devices,
/// exchanging halos between neighboring sub-domains each step.
///
/// Construction discovers co-located ranks, assigns devices, and builds
/// the partition. [`realize`](Self::realize) allocates the sub-domains and
/// plans the communication; [`exchange`](Self::exchange) runs one halo
/// exchange. Both the accelerator runtime and the cross-host message layer
/// are injected, so a single-process world can drive the whole engine.
pub struct DistributedDomain {
    size: Dim3,
    rank: Rank,
    world: usize,
    runtime: Arc<dyn DeviceRuntime>,
    comm: Arc<dyn MessageLayer>,
    config: HaloConfig,
    flags: MethodFlags,
    radius: Radius,
    elem_sizes: Vec<usize>,
    gpus: Vec<usize>,
    colocated: HashSet<Rank>,
    partition: PrimeFactorPartition,
    peer_access_sender: PeerAccessSender,
    peer_copy_sender: PeerCopySender,
    colocated_senders: Vec<IndexMap<Rank, ColocatedHaloSender>>,
    colocated_recvers: Vec<IndexMap<Rank, ColocatedHaloRecver>>,
    remote_senders: Vec<IndexMap<Dim3, RemoteSender>>,
    remote_recvers: Vec<IndexMap<Dim3, RemoteRecver>>,
    domains: Vec<LocalDomain>,
    domain_idx: Vec<Dim3>,
    slot_map: SlotMap,
    realized: bool,
}

impl DistributedDomain {
    /// Construct with the global extent, an accelerator runtime, and a
    /// cross-host message layer.
    pub fn new(
        x: i64,
        y: i64,
        z: i64,
        runtime: Arc<dyn DeviceRuntime>,
        comm: Arc<dyn MessageLayer>,
    ) -> Result<Self> {
        Self::with_config(x, y, z, runtime, comm, HaloConfig::from_env())
    }

    pub fn with_config(
        x: i64,
        y: i64,
        z: i64,
        runtime: Arc<dyn DeviceRuntime>,
        comm: Arc<dyn MessageLayer>,
        config: HaloConfig,
    ) -> Result<Self> {
        let size = Dim3::new(x, y, z);
        let rank = comm.rank();
        let world = comm.world_size();

        // Stabilize colocation timing across ranks.
        comm.barrier()?;
        let start = comm.wtime();
        let colocated_list = comm.colocated_ranks()?;
        let colocated: HashSet<Rank> = colocated_list.iter().copied().collect();
        assert!(colocated.contains(&rank), "should be colocated with self");
        debug!(
            rank,
            elapsed = comm.wtime() - start,
            peers = colocated.len() - 1,
            host = %comm.processor_name(),
            "colocation discovered"
        );

        // Round-robin devices over the ranks sharing this host.
        let device_count = runtime.device_count();
        if device_count == 0 {
            return Err(HaloError::device("no devices visible"));
        }
        let mut shm_ranks = colocated_list;
        shm_ranks.sort_unstable();
        let shm_rank = shm_ranks
            .iter()
            .position(|&r| r == rank)
            .ok_or(HaloError::UnknownPeer { rank })?;
        let shm_size = shm_ranks.len();

        let mut gpus = Vec::new();
        if shm_size <= device_count {
            for gpu in 0..device_count {
                if gpu % shm_size == shm_rank {
                    gpus.push(gpu);
                }
            }
        } else {
            gpus.push(shm_rank % device_count);
        }
        debug!(rank, local = shm_rank, ?gpus, "device assignment");

        // Enable peer access wherever the runtime offers it.
        let start = comm.wtime();
        for src in 0..device_count {
            for dst in 0..device_count {
                if src == dst || !runtime.can_access_peer(src, dst) {
                    continue;
                }
                match runtime.enable_peer_access(src, dst) {
                    Ok(()) => debug!(src, dst, "peer access enabled"),
                    Err(e) => warn!(src, dst, error = %e, "peer access unavailable"),
                }
            }
        }
        debug!(rank, elapsed = comm.wtime() - start, "peer access probed");

        let start = comm.wtime();
        let partition = PrimeFactorPartition::new(size, world, gpus.len())?;
        debug!(rank, elapsed = comm.wtime() - start, "partitioned");

        comm.barrier()?;
        if rank == 0 {
            info!(
                %size,
                rank_dim = %partition.rank_dim(),
                gpu_dim = %partition.gpu_dim(),
                "domain split"
            );
        }

        let peer_access_sender = PeerAccessSender::new(Arc::clone(&runtime), rank);
        let peer_copy_sender = PeerCopySender::new(Arc::clone(&runtime), rank);
        Ok(Self {
            size,
            rank,
            world,
            runtime,
            comm,
            flags: config.default_methods,
            config,
            radius: Radius::default(),
            elem_sizes: Vec::new(),
            gpus,
            colocated,
            partition,
            peer_access_sender,
            peer_copy_sender,
            colocated_senders: Vec::new(),
            colocated_recvers: Vec::new(),
            remote_senders: Vec::new(),
            remote_recvers: Vec::new(),
            domains: Vec::new(),
            domain_idx: Vec::new(),
            slot_map: SlotMap::new(),
            realized: false,
        })
    }

    /// Set a uniform stencil radius. Must be called before `realize()`.
    pub fn set_radius(&mut self, r: usize) {
        assert!(!self.realized, "set_radius after realize");
        self.radius = Radius::constant(r);
    }

    /// Set a per-direction stencil radius. Must be called before
    /// `realize()`.
    pub fn set_radius_map(&mut self, r: Radius) {
        assert!(!self.realized, "set_radius after realize");
        self.radius = r;
    }

    /// Register a data field of element type `T` on every sub-domain.
    /// Must be called before `realize()`.
    pub fn add_data<T>(&mut self) -> DataHandle<T> {
        assert!(!self.realized, "add_data after realize");
        self.elem_sizes.push(std::mem::size_of::<T>());
        DataHandle::new(self.elem_sizes.len() - 1)
    }

    /// Restrict the planner to a subset of transport methods. Must be
    /// called before `realize()`.
    pub fn set_methods(&mut self, flags: MethodFlags) {
        assert!(!self.realized, "set_methods after realize");
        self.flags = flags;
    }

    /// True when any of `methods` is enabled.
    pub fn any_methods(&self, methods: MethodFlags) -> bool {
        self.flags.any(methods)
    }

    /// Allocate sub-domains in device memory and build the communication
    /// plan. No-op after the first call.
    pub fn realize(&mut self) -> Result<()> {
        self.realize_with(false)
    }

    /// Like [`realize`](Self::realize), with unified-memory allocations.
    pub fn realize_unified(&mut self) -> Result<()> {
        self.realize_with(true)
    }

    fn realize_with(&mut self, unified: bool) -> Result<()> {
        if self.realized {
            return Ok(());
        }

        let start = self.comm.wtime();
        let n = self.gpus.len();
        for slot in 0..n {
            let idx = self.partition.dom_idx(self.rank, slot);
            let ld_size = self.partition.local_domain_size(idx);
            let mut ld = LocalDomain::new(ld_size, self.gpus[slot], Arc::clone(&self.runtime));
            ld.set_radius(self.radius);
            for &elem_size in &self.elem_sizes {
                ld.add_data(elem_size);
            }
            if unified {
                ld.realize_unified()?;
            } else {
                ld.realize()?;
            }
            debug!(rank = self.rank, slot, gpu = self.gpus[slot], %idx, %ld_size, "local domain realized");
            self.domains.push(ld);
            self.domain_idx.push(idx);
        }
        // Device slot -> local index, by fiat rather than assumption.
        self.slot_map = (0..n).map(|i| (i, i)).collect();
        debug!(rank = self.rank, elapsed = self.comm.wtime() - start, "local domains realized");

        let start = self.comm.wtime();
        let shapes: Vec<DomainShape> = self.domains.iter().map(LocalDomain::shape).collect();
        let slots: Vec<usize> = (0..n).collect();
        let plan = build_plan(&PlanInputs {
            partition: &self.partition,
            rank: self.rank,
            devices: &self.gpus,
            slots: &slots,
            slot_map: &self.slot_map,
            colocated: &self.colocated,
            flags: self.flags,
        })?;

        self.peer_access_sender
            .prepare(&plan.peer_access, &shapes, &self.slot_map)?;
        self.peer_copy_sender
            .prepare(&plan.peer_copy, &shapes, &self.slot_map)?;

        self.colocated_senders = (0..n).map(|_| IndexMap::new()).collect();
        self.colocated_recvers = (0..n).map(|_| IndexMap::new()).collect();
        self.remote_senders = (0..n).map(|_| IndexMap::new()).collect();
        self.remote_recvers = (0..n).map(|_| IndexMap::new()).collect();
        for di in 0..n {
            for &dst_rank in plan.colocated_out[di].keys() {
                self.colocated_senders[di].insert(
                    dst_rank,
                    ColocatedHaloSender::new(
                        Arc::clone(&self.runtime),
                        Arc::clone(&self.comm),
                        dst_rank,
                        shapes[di].clone(),
                    )?,
                );
            }
            for &src_rank in plan.colocated_in[di].keys() {
                self.colocated_recvers[di].insert(
                    src_rank,
                    ColocatedHaloRecver::new(
                        Arc::clone(&self.runtime),
                        Arc::clone(&self.comm),
                        src_rank,
                        shapes[di].clone(),
                    )?,
                );
            }
            for &dst_idx in plan.remote_out[di].keys() {
                self.remote_senders[di].insert(
                    dst_idx,
                    RemoteSender::new(
                        Arc::clone(&self.runtime),
                        Arc::clone(&self.comm),
                        self.partition.get_rank(dst_idx),
                        shapes[di].clone(),
                    )?,
                );
            }
            for &src_idx in plan.remote_in[di].keys() {
                self.remote_recvers[di].insert(
                    src_idx,
                    RemoteRecver::new(
                        Arc::clone(&self.runtime),
                        Arc::clone(&self.comm),
                        self.partition.get_rank(src_idx),
                        shapes[di].clone(),
                    )?,
                );
            }
        }

        // Split prepare: every start before any finish, so paired ranks
        // can exchange staging handles without deadlock.
        for di in 0..n {
            for (dst_rank, sender) in self.colocated_senders[di].iter_mut() {
                sender.start_prepare(&plan.colocated_out[di][dst_rank])?;
            }
            for (src_rank, recver) in self.colocated_recvers[di].iter_mut() {
                recver.start_prepare(&plan.colocated_in[di][src_rank])?;
            }
        }
        for di in 0..n {
            for sender in self.colocated_senders[di].values_mut() {
                sender.finish_prepare()?;
            }
            for recver in self.colocated_recvers[di].values_mut() {
                recver.finish_prepare()?;
            }
        }

        for di in 0..n {
            for (dst_idx, sender) in self.remote_senders[di].iter_mut() {
                sender.prepare(&plan.remote_out[di][dst_idx])?;
            }
            for (src_idx, recver) in self.remote_recvers[di].iter_mut() {
                recver.prepare(&plan.remote_in[di][src_idx])?;
            }
        }

        debug!(rank = self.rank, elapsed = self.comm.wtime() - start, "communication planned");
        self.realized = true;
        Ok(())
    }

    /// Perform one halo exchange. On return, every ghost slab holds its
    /// periodic neighbor's adjacent interior data; the step is atomic with
    /// respect to the stencil compute that follows.
    pub fn exchange(&mut self) -> Result<()> {
        if !self.realized {
            return Err(HaloError::NotRealized);
        }

        // Stabilize step timing.
        if self.config.exchange_barriers {
            self.comm.barrier()?;
        }
        let start = self.comm.wtime();

        // Kick off every tier; all of these are non-blocking posts.
        for senders in &mut self.remote_senders {
            for sender in senders.values_mut() {
                sender.send_d2h()?;
            }
        }
        for senders in &mut self.colocated_senders {
            for sender in senders.values_mut() {
                sender.send()?;
            }
        }
        for recvers in &mut self.remote_recvers {
            for recver in recvers.values_mut() {
                recver.recv_h2h()?;
            }
        }
        for recvers in &mut self.colocated_recvers {
            for recver in recvers.values_mut() {
                recver.recv()?;
            }
        }
        self.peer_copy_sender.send()?;
        self.peer_access_sender.send()?;

        // Overlap loop: advance one endpoint, then look at the opposite
        // side, so freshly posted host-to-host sends overlap with
        // host-to-device unpacks.
        let mut pending = true;
        while pending {
            pending = false;
            'recvers: {
                for recvers in &mut self.remote_recvers {
                    for recver in recvers.values_mut() {
                        if recver.is_h2h() {
                            pending = true;
                            if recver.h2h_done()? {
                                recver.recv_h2d()?;
                                break 'recvers;
                            }
                        }
                    }
                }
            }
            'senders: {
                for senders in &mut self.remote_senders {
                    for sender in senders.values_mut() {
                        if sender.is_d2h() {
                            pending = true;
                            if sender.d2h_done()? {
                                sender.send_h2h()?;
                                break 'senders;
                            }
                        }
                    }
                }
            }
        }

        // Drain, most-local tier first; remote receivers before senders.
        self.peer_access_sender.wait()?;
        self.peer_copy_sender.wait()?;
        for senders in &mut self.colocated_senders {
            for sender in senders.values_mut() {
                sender.wait()?;
            }
        }
        for recvers in &mut self.colocated_recvers {
            for recver in recvers.values_mut() {
                recver.wait()?;
            }
        }
        for recvers in &mut self.remote_recvers {
            for recver in recvers.values_mut() {
                StatefulRecver::wait(recver)?;
            }
        }
        for senders in &mut self.remote_senders {
            for sender in senders.values_mut() {
                StatefulSender::wait(sender)?;
            }
        }

        debug!(rank = self.rank, elapsed = self.comm.wtime() - start, "exchange complete");

        if self.config.exchange_barriers {
            self.comm.barrier()?;
        }
        Ok(())
    }

    /// Per-sub-domain buffers, for the compute layer.
    pub fn domains(&self) -> &[LocalDomain] {
        &self.domains
    }

    /// Grid position of local sub-domain `i` in the composite grid.
    pub fn domain_index(&self, i: usize) -> Dim3 {
        self.domain_idx[i]
    }

    /// The decomposition plan.
    pub fn partition(&self) -> &PrimeFactorPartition {
        &self.partition
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world
    }

    /// Global domain extent.
    pub fn size(&self) -> Dim3 {
        self.size
    }
}
