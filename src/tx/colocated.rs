//! Tier 3: shared-host transfer between co-located ranks.
//!
//! The receiver allocates a device staging buffer covering its inbox,
//! exports an IPC handle, and posts it (with the expected byte count) to
//! the sender through the message layer. The sender imports the handle and
//! thereafter packs halo regions straight into the receiver's staging; a
//! one-byte token signals each step's completion. There is no back-pointer
//! between the two objects: the rendezvous is entirely message-driven, and
//! every `start_prepare` must run before any `finish_prepare`.
//!
//! Staging reuse across steps is protected by the closing barrier of
//! `exchange()`.

use std::sync::Arc;

use indexmap::IndexMap;
use tracing::debug;

use crate::comm::{MessageLayer, ReqId};
use crate::domain::DomainShape;
use crate::error::{HaloError, Result};
use crate::geom::Dim3;
use crate::message::Message;
use crate::runtime::{DevicePtr, DeviceRuntime, IpcMemHandle, Region, StreamId, IPC_HANDLE_BYTES};
use crate::tag::{tag_kind, MsgKind};
use crate::tx::align_up;
use crate::types::Rank;

/// Tag payload naming one (source slot, destination slot) flow.
fn flow_payload(src_slot: usize, dst_slot: usize) -> u32 {
    assert!(
        src_slot < 256 && dst_slot < 256,
        "device slot too wide for tag"
    );
    ((src_slot as u32) << 8) | dst_slot as u32
}

/// Group a direction-sorted box by the given slot key, preserving order.
fn group_by_slot(msgs: &[Message], key: impl Fn(&Message) -> usize) -> IndexMap<usize, Vec<Message>> {
    let mut groups: IndexMap<usize, Vec<Message>> = IndexMap::new();
    for m in msgs {
        groups.entry(key(m)).or_default().push(*m);
    }
    groups
}

struct SendFlow {
    packs: Vec<(Region, usize)>,
    bytes: usize,
    payload: u32,
    handle_buf: [u8; IPC_HANDLE_BYTES],
    size_buf: [u8; 8],
    handle_req: Option<ReqId>,
    size_req: Option<ReqId>,
    staging: Option<DevicePtr>,
}

/// Shared-host halo sender for one local sub-domain, keyed by destination
/// rank. One flow per destination sub-domain on that rank.
pub struct ColocatedHaloSender {
    runtime: Arc<dyn DeviceRuntime>,
    comm: Arc<dyn MessageLayer>,
    dst_rank: Rank,
    shape: DomainShape,
    stream: StreamId,
    flows: Vec<SendFlow>,
    token: [u8; 1],
}

impl ColocatedHaloSender {
    pub fn new(
        runtime: Arc<dyn DeviceRuntime>,
        comm: Arc<dyn MessageLayer>,
        dst_rank: Rank,
        shape: DomainShape,
    ) -> Result<Self> {
        let stream = runtime.stream_create(shape.gpu())?;
        Ok(Self {
            runtime,
            comm,
            dst_rank,
            shape,
            stream,
            flows: Vec::new(),
            token: [1],
        })
    }

    /// Build flows and post the receives for the peer's staging handles.
    pub fn start_prepare(&mut self, outbox: &[Message]) -> Result<()> {
        for (dst_slot, msgs) in group_by_slot(outbox, |m| m.dst_slot) {
            let mut packs = Vec::new();
            let mut bytes = 0;
            for msg in &msgs {
                for f in 0..self.shape.num_data() {
                    let region = self.shape.interior_region(f, msg.dir);
                    packs.push((region, bytes));
                    bytes = align_up(bytes + region.bytes());
                }
            }
            self.flows.push(SendFlow {
                packs,
                bytes,
                payload: flow_payload(msgs[0].src_slot, dst_slot),
                handle_buf: [0; IPC_HANDLE_BYTES],
                size_buf: [0; 8],
                handle_req: None,
                size_req: None,
                staging: None,
            });
        }

        // Post receives only once the flow list is final: the requests
        // point into it.
        for flow in &mut self.flows {
            flow.handle_req = Some(unsafe {
                self.comm.irecv(
                    flow.handle_buf.as_mut_ptr(),
                    IPC_HANDLE_BYTES,
                    self.dst_rank,
                    tag_kind(MsgKind::ColocatedMem, flow.payload, Dim3::ZERO),
                )?
            });
            flow.size_req = Some(unsafe {
                self.comm.irecv(
                    flow.size_buf.as_mut_ptr(),
                    8,
                    self.dst_rank,
                    tag_kind(MsgKind::ColocatedDev, flow.payload, Dim3::ZERO),
                )?
            });
        }
        debug!(
            dst_rank = self.dst_rank,
            flows = self.flows.len(),
            "colocated sender start_prepare"
        );
        Ok(())
    }

    /// Complete the rendezvous: install the peer's staging mappings.
    pub fn finish_prepare(&mut self) -> Result<()> {
        for flow in &mut self.flows {
            if let Some(req) = flow.handle_req.take() {
                self.comm.wait(req)?;
            }
            if let Some(req) = flow.size_req.take() {
                self.comm.wait(req)?;
            }
            let expected = u64::from_le_bytes(flow.size_buf);
            if expected != flow.bytes as u64 {
                return Err(HaloError::SizeMismatch {
                    expected: expected as usize,
                    actual: flow.bytes,
                });
            }
            let handle = IpcMemHandle(flow.handle_buf);
            flow.staging =
                Some(unsafe { self.runtime.ipc_import(self.shape.gpu(), &handle)? });
        }
        Ok(())
    }

    /// Pack every halo region straight into the peer's staging.
    /// Non-blocking.
    pub fn send(&mut self) -> Result<()> {
        for flow in &self.flows {
            let staging = flow.staging.expect("send before finish_prepare");
            for (region, off) in &flow.packs {
                unsafe {
                    self.runtime
                        .pack_device(self.stream, staging.byte_offset(*off), region)?;
                }
            }
        }
        Ok(())
    }

    /// Block until the packs land, then post each flow's completion token.
    pub fn wait(&mut self) -> Result<()> {
        self.runtime.stream_sync(self.stream)?;
        for flow in &self.flows {
            let req = unsafe {
                self.comm.isend(
                    self.token.as_ptr(),
                    1,
                    self.dst_rank,
                    tag_kind(MsgKind::ColocatedEvt, flow.payload, Dim3::ZERO),
                )?
            };
            self.comm.wait(req)?;
        }
        Ok(())
    }
}

struct RecvFlow {
    unpacks: Vec<(Region, usize)>,
    payload: u32,
    staging: DevicePtr,
    handle_buf: [u8; IPC_HANDLE_BYTES],
    size_buf: [u8; 8],
    handle_req: Option<ReqId>,
    size_req: Option<ReqId>,
    token_buf: [u8; 1],
    token_req: Option<ReqId>,
}

/// Shared-host halo receiver for one local sub-domain, keyed by source
/// rank. One flow per source sub-domain on that rank.
pub struct ColocatedHaloRecver {
    runtime: Arc<dyn DeviceRuntime>,
    comm: Arc<dyn MessageLayer>,
    src_rank: Rank,
    shape: DomainShape,
    stream: StreamId,
    flows: Vec<RecvFlow>,
}

impl ColocatedHaloRecver {
    pub fn new(
        runtime: Arc<dyn DeviceRuntime>,
        comm: Arc<dyn MessageLayer>,
        src_rank: Rank,
        shape: DomainShape,
    ) -> Result<Self> {
        let stream = runtime.stream_create(shape.gpu())?;
        Ok(Self {
            runtime,
            comm,
            src_rank,
            shape,
            stream,
            flows: Vec::new(),
        })
    }

    /// Allocate staging per flow and post its handle to the sender.
    pub fn start_prepare(&mut self, inbox: &[Message]) -> Result<()> {
        for (src_slot, msgs) in group_by_slot(inbox, |m| m.src_slot) {
            let mut unpacks = Vec::new();
            let mut bytes = 0;
            for msg in &msgs {
                for f in 0..self.shape.num_data() {
                    let region = self.shape.ghost_region(f, -msg.dir);
                    unpacks.push((region, bytes));
                    bytes = align_up(bytes + region.bytes());
                }
            }
            let staging = self.runtime.alloc(self.shape.gpu(), bytes)?;
            let handle = self.runtime.ipc_export(self.shape.gpu(), staging)?;
            self.flows.push(RecvFlow {
                unpacks,
                payload: flow_payload(src_slot, msgs[0].dst_slot),
                staging,
                handle_buf: handle.0,
                size_buf: (bytes as u64).to_le_bytes(),
                handle_req: None,
                size_req: None,
                token_buf: [0],
                token_req: None,
            });
        }

        for flow in &mut self.flows {
            flow.handle_req = Some(unsafe {
                self.comm.isend(
                    flow.handle_buf.as_ptr(),
                    IPC_HANDLE_BYTES,
                    self.src_rank,
                    tag_kind(MsgKind::ColocatedMem, flow.payload, Dim3::ZERO),
                )?
            });
            flow.size_req = Some(unsafe {
                self.comm.isend(
                    flow.size_buf.as_ptr(),
                    8,
                    self.src_rank,
                    tag_kind(MsgKind::ColocatedDev, flow.payload, Dim3::ZERO),
                )?
            });
        }
        debug!(
            src_rank = self.src_rank,
            flows = self.flows.len(),
            "colocated recver start_prepare"
        );
        Ok(())
    }

    /// Complete the handle posts.
    pub fn finish_prepare(&mut self) -> Result<()> {
        for flow in &mut self.flows {
            if let Some(req) = flow.handle_req.take() {
                self.comm.wait(req)?;
            }
            if let Some(req) = flow.size_req.take() {
                self.comm.wait(req)?;
            }
        }
        Ok(())
    }

    /// Post the completion-token receives. Non-blocking.
    pub fn recv(&mut self) -> Result<()> {
        for flow in &mut self.flows {
            debug_assert!(flow.token_req.is_none(), "recv while a step is pending");
            flow.token_req = Some(unsafe {
                self.comm.irecv(
                    flow.token_buf.as_mut_ptr(),
                    1,
                    self.src_rank,
                    tag_kind(MsgKind::ColocatedEvt, flow.payload, Dim3::ZERO),
                )?
            });
        }
        Ok(())
    }

    /// Wait for each sender's token, then unpack staging into the ghost
    /// regions and sync.
    pub fn wait(&mut self) -> Result<()> {
        for fi in 0..self.flows.len() {
            if let Some(req) = self.flows[fi].token_req.take() {
                self.comm.wait(req)?;
            }
            let staging = self.flows[fi].staging;
            for (region, off) in &self.flows[fi].unpacks {
                unsafe {
                    self.runtime
                        .unpack_device(self.stream, region, staging.byte_offset(*off))?;
                }
            }
        }
        self.runtime.stream_sync(self.stream)
    }
}

impl Drop for ColocatedHaloRecver {
    fn drop(&mut self) {
        for flow in self.flows.drain(..) {
            let _ = self.runtime.free(self.shape.gpu(), flow.staging);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::LocalComm;
    use crate::domain::LocalDomain;
    use crate::geom::Radius;
    use crate::runtime::HostRuntime;

    fn make_domain(rt: Arc<HostRuntime>, dev: usize) -> LocalDomain {
        let mut d = LocalDomain::new(Dim3::new(2, 2, 2), dev, rt);
        d.set_radius(Radius::constant(1));
        d.add_data(1);
        d.realize().unwrap();
        d
    }

    #[test]
    fn test_two_rank_flow() {
        let rt = Arc::new(HostRuntime::new(2));
        let mut comms = LocalComm::bus(2);
        let c1 = Arc::new(comms.pop().unwrap());
        let c0 = Arc::new(comms.pop().unwrap());

        // Rank 0 sends its +x interior plane to rank 1 (dir +x).
        let msg = Message::new(Dim3::new(1, 0, 0), 0, 0);

        let rt_a = Arc::clone(&rt);
        let sender = std::thread::spawn(move || {
            let dom = make_domain(rt_a.clone(), 0);
            let interior = dom.interior_region(0, Dim3::new(1, 0, 0));
            for z in 0..2 {
                for y in 0..2 {
                    unsafe { *(interior.ptr_at(Dim3::new(0, y, z)) as *mut u8) = 0x5A };
                }
            }
            let mut tx =
                ColocatedHaloSender::new(rt_a, c0.clone(), 1, dom.shape()).unwrap();
            tx.start_prepare(&[msg]).unwrap();
            c0.barrier().unwrap();
            tx.finish_prepare().unwrap();
            tx.send().unwrap();
            tx.wait().unwrap();
            c0.barrier().unwrap();
        });

        let rt_b = Arc::clone(&rt);
        let recver = std::thread::spawn(move || {
            let dom = make_domain(rt_b.clone(), 1);
            let mut rx =
                ColocatedHaloRecver::new(rt_b, c1.clone(), 0, dom.shape()).unwrap();
            rx.start_prepare(&[msg]).unwrap();
            c1.barrier().unwrap();
            rx.finish_prepare().unwrap();
            rx.recv().unwrap();
            rx.wait().unwrap();

            let ghost = dom.ghost_region(0, Dim3::new(-1, 0, 0));
            for z in 0..2 {
                for y in 0..2 {
                    let got = unsafe { *(ghost.ptr_at(Dim3::new(0, y, z)) as *const u8) };
                    assert_eq!(got, 0x5A);
                }
            }
            c1.barrier().unwrap();
        });

        sender.join().unwrap();
        recver.join().unwrap();
    }

    #[test]
    fn test_flow_payload_distinct() {
        assert_ne!(flow_payload(0, 1), flow_payload(1, 0));
        assert_eq!(flow_payload(2, 3), (2 << 8) | 3);
    }
}
