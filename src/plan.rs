//! The communication planner: enumerate neighbor directions, classify each
//! send and receive into a transport tier, and build the per-tier
//! outbox/inbox sets.

use std::collections::HashSet;

use indexmap::IndexMap;
use tracing::debug;

use crate::error::{HaloError, Result};
use crate::geom::Dim3;
use crate::message::Message;
use crate::partition::Partition;
use crate::types::{MethodFlags, Rank};

/// Device slot -> local sub-domain index for this rank. The global slot id
/// is not a valid index into the local domain list by fiat; every lookup
/// goes through this map.
pub type SlotMap = IndexMap<usize, usize>;

/// Per-tier outboxes and inboxes for one rank's sub-domains.
///
/// Same-device and peer-copy transfers are driven entirely by the sender
/// side, so those tiers carry no inbox.
#[derive(Debug, Default)]
pub struct CommPlan {
    /// Tier 1: same physical device, strided kernel copy. Aggregated
    /// across sub-domains.
    pub peer_access: Vec<Message>,
    /// Tier 2: same rank, different device. Aggregated across sub-domains.
    pub peer_copy: Vec<Message>,
    /// Tier 3 outbox: `[local domain][destination rank] -> messages`.
    pub colocated_out: Vec<IndexMap<Rank, Vec<Message>>>,
    /// Tier 3 inbox: `[local domain][source rank] -> messages`.
    pub colocated_in: Vec<IndexMap<Rank, Vec<Message>>>,
    /// Tier 4 outbox: `[local domain][destination sub-domain] -> messages`.
    pub remote_out: Vec<IndexMap<Dim3, Vec<Message>>>,
    /// Tier 4 inbox: `[local domain][source sub-domain] -> messages`.
    pub remote_in: Vec<IndexMap<Dim3, Vec<Message>>>,
}

/// Inputs the classifier needs beyond the partition itself.
pub struct PlanInputs<'a> {
    pub partition: &'a dyn Partition,
    pub rank: Rank,
    /// Physical device id of each local sub-domain, in local order.
    pub devices: &'a [usize],
    /// Device slot of each local sub-domain, in local order.
    pub slots: &'a [usize],
    pub slot_map: &'a SlotMap,
    pub colocated: &'a HashSet<Rank>,
    pub flags: MethodFlags,
}

/// Enumerate all 26 directions for every local sub-domain and classify
/// each send and receive into the first enabled tier.
pub fn build_plan(inp: &PlanInputs<'_>) -> Result<CommPlan> {
    let n = inp.slots.len();
    assert_eq!(inp.devices.len(), n);

    let mut plan = CommPlan {
        colocated_out: vec![IndexMap::new(); n],
        colocated_in: vec![IndexMap::new(); n],
        remote_out: vec![IndexMap::new(); n],
        remote_in: vec![IndexMap::new(); n],
        ..CommPlan::default()
    };

    let grid = inp.partition.global_dim();

    for di in 0..n {
        let my_idx = inp.partition.dom_idx(inp.rank, inp.slots[di]);
        for z in -1..=1i64 {
            for y in -1..=1i64 {
                for x in -1..=1i64 {
                    let dir = Dim3::new(x, y, z);
                    if dir == Dim3::ZERO {
                        continue;
                    }
                    classify_send(inp, &mut plan, di, my_idx, dir, grid)?;
                    classify_recv(inp, &mut plan, di, my_idx, dir, grid)?;
                }
            }
        }
    }

    // Both ends of a flow must agree on message order inside a box.
    for boxes in plan.colocated_out.iter_mut().chain(&mut plan.colocated_in) {
        for msgs in boxes.values_mut() {
            msgs.sort();
        }
    }
    for boxes in plan.remote_out.iter_mut().chain(&mut plan.remote_in) {
        for msgs in boxes.values_mut() {
            msgs.sort();
        }
    }

    debug!(
        peer_access = plan.peer_access.len(),
        peer_copy = plan.peer_copy.len(),
        colocated = plan.colocated_out.iter().map(|m| m.values().map(Vec::len).sum::<usize>()).sum::<usize>(),
        remote = plan.remote_out.iter().map(|m| m.values().map(Vec::len).sum::<usize>()).sum::<usize>(),
        "communication plan"
    );

    Ok(plan)
}

/// Local sub-domain whose device slot is `slot`.
fn local_of(inp: &PlanInputs<'_>, slot: usize) -> Result<usize> {
    inp.slot_map
        .get(&slot)
        .copied()
        .ok_or(HaloError::NoSuchDomain {
            slot,
            rank: inp.rank,
        })
}

fn classify_send(
    inp: &PlanInputs<'_>,
    plan: &mut CommPlan,
    di: usize,
    my_idx: Dim3,
    dir: Dim3,
    grid: Dim3,
) -> Result<()> {
    let dst_idx = (my_idx + dir).wrap(grid);
    let dst_rank = inp.partition.get_rank(dst_idx);
    let dst_slot = inp.partition.get_gpu(dst_idx);
    let msg = Message::new(dir, inp.slots[di], dst_slot);

    if dst_rank == inp.rank {
        let dst_local = local_of(inp, dst_slot)?;
        if inp.devices[di] == inp.devices[dst_local] && inp.flags.any(MethodFlags::KERNEL) {
            plan.peer_access.push(msg);
        } else if inp.flags.any(MethodFlags::PEER_COPY) {
            plan.peer_copy.push(msg);
        } else if inp.flags.any(MethodFlags::REMOTE) {
            plan.remote_out[di].entry(dst_idx).or_default().push(msg);
        } else {
            return Err(no_method("send", dir, di, inp.flags));
        }
    } else if inp.colocated.contains(&dst_rank) && inp.flags.any(MethodFlags::COLOCATED) {
        plan.colocated_out[di].entry(dst_rank).or_default().push(msg);
    } else if inp.flags.any(MethodFlags::REMOTE) {
        plan.remote_out[di].entry(dst_idx).or_default().push(msg);
    } else {
        return Err(no_method("send", dir, di, inp.flags));
    }
    Ok(())
}

fn classify_recv(
    inp: &PlanInputs<'_>,
    plan: &mut CommPlan,
    di: usize,
    my_idx: Dim3,
    dir: Dim3,
    grid: Dim3,
) -> Result<()> {
    let src_idx = (my_idx - dir).wrap(grid);
    let src_rank = inp.partition.get_rank(src_idx);
    let src_slot = inp.partition.get_gpu(src_idx);
    let msg = Message::new(dir, src_slot, inp.slots[di]);

    if src_rank == inp.rank {
        let src_local = local_of(inp, src_slot)?;
        if inp.devices[di] == inp.devices[src_local] && inp.flags.any(MethodFlags::KERNEL) {
            // Driven by the sender side; no receiver object.
        } else if inp.flags.any(MethodFlags::PEER_COPY) {
            // Driven by the sender side; no receiver object.
        } else if inp.flags.any(MethodFlags::REMOTE) {
            plan.remote_in[di].entry(src_idx).or_default().push(msg);
        } else {
            return Err(no_method("recv", dir, di, inp.flags));
        }
    } else if inp.colocated.contains(&src_rank) && inp.flags.any(MethodFlags::COLOCATED) {
        plan.colocated_in[di].entry(src_rank).or_default().push(msg);
    } else if inp.flags.any(MethodFlags::REMOTE) {
        plan.remote_in[di].entry(src_idx).or_default().push(msg);
    } else {
        return Err(no_method("recv", dir, di, inp.flags));
    }
    Ok(())
}

fn no_method(verb: &'static str, dir: Dim3, di: usize, flags: MethodFlags) -> HaloError {
    HaloError::NoMethodAvailable {
        verb,
        dir,
        sub_domain: di,
        flags,
    }
}
