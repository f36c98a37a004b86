//! Tier 2: same-rank, cross-device halo copies.
//!
//! Each message packs its source region to a contiguous staging buffer on
//! the source device, crosses devices with one contiguous peer copy, and
//! unpacks into the ghost region on the destination stream. The stages are
//! ordered with an event recorded on the source stream.

use std::sync::Arc;

use indexmap::IndexMap;
use tracing::debug;

use crate::domain::DomainShape;
use crate::error::{HaloError, Result};
use crate::message::Message;
use crate::plan::SlotMap;
use crate::runtime::{DevicePtr, DeviceRuntime, EventId, Region, StreamId};
use crate::tx::{align_up, Copier};
use crate::types::Rank;

/// Contiguous asynchronous copy between two devices on a fixed stream.
pub struct PeerCopier {
    runtime: Arc<dyn DeviceRuntime>,
    stream: StreamId,
    src_dev: usize,
    dst_dev: usize,
    n: usize,
}

impl PeerCopier {
    pub fn new(
        runtime: Arc<dyn DeviceRuntime>,
        stream: StreamId,
        src_dev: usize,
        dst_dev: usize,
    ) -> Self {
        Self {
            runtime,
            stream,
            src_dev,
            dst_dev,
            n: 0,
        }
    }
}

impl Copier for PeerCopier {
    fn resize(&mut self, n: usize) {
        self.n = n;
    }

    unsafe fn copy(&mut self, dst: DevicePtr, src: DevicePtr) -> Result<()> {
        unsafe {
            self.runtime
                .memcpy_peer(self.stream, dst, self.dst_dev, src, self.src_dev, self.n)
        }
    }

    fn wait(&mut self) -> Result<()> {
        self.runtime.stream_sync(self.stream)
    }
}

struct PeerOp {
    src_stream: StreamId,
    dst_stream: StreamId,
    event: EventId,
    src_staging: DevicePtr,
    dst_staging: DevicePtr,
    src_dev: usize,
    dst_dev: usize,
    copier: PeerCopier,
    packs: Vec<(Region, usize)>,
    unpacks: Vec<(Region, usize)>,
}

/// Same-rank cross-device sender. One per engine; the message list spans
/// every local sub-domain pair.
pub struct PeerCopySender {
    runtime: Arc<dyn DeviceRuntime>,
    rank: Rank,
    streams: IndexMap<usize, StreamId>,
    ops: Vec<PeerOp>,
}

impl PeerCopySender {
    pub fn new(runtime: Arc<dyn DeviceRuntime>, rank: Rank) -> Self {
        Self {
            runtime,
            rank,
            streams: IndexMap::new(),
            ops: Vec::new(),
        }
    }

    fn stream_for(&mut self, dev: usize) -> Result<StreamId> {
        match self.streams.get(&dev) {
            Some(&s) => Ok(s),
            None => {
                let s = self.runtime.stream_create(dev)?;
                self.streams.insert(dev, s);
                Ok(s)
            }
        }
    }

    pub fn prepare(
        &mut self,
        outbox: &[Message],
        shapes: &[DomainShape],
        slot_map: &SlotMap,
    ) -> Result<()> {
        for msg in outbox {
            let src = *slot_map
                .get(&msg.src_slot)
                .ok_or(HaloError::NoSuchDomain {
                    slot: msg.src_slot,
                    rank: self.rank,
                })?;
            let dst = *slot_map
                .get(&msg.dst_slot)
                .ok_or(HaloError::NoSuchDomain {
                    slot: msg.dst_slot,
                    rank: self.rank,
                })?;
            let src_dev = shapes[src].gpu();
            let dst_dev = shapes[dst].gpu();

            let mut packs = Vec::new();
            let mut unpacks = Vec::new();
            let mut bytes = 0;
            for f in 0..shapes[src].num_data() {
                let from = shapes[src].interior_region(f, msg.dir);
                let to = shapes[dst].ghost_region(f, -msg.dir);
                packs.push((from, bytes));
                unpacks.push((to, bytes));
                bytes = align_up(bytes + from.bytes());
            }

            let src_stream = self.stream_for(src_dev)?;
            let dst_stream = self.stream_for(dst_dev)?;
            let op = PeerOp {
                src_stream,
                dst_stream,
                event: self.runtime.event_create(src_dev)?,
                src_staging: self.runtime.alloc(src_dev, bytes)?,
                dst_staging: self.runtime.alloc(dst_dev, bytes)?,
                src_dev,
                dst_dev,
                copier: {
                    let mut c = PeerCopier::new(
                        Arc::clone(&self.runtime),
                        dst_stream,
                        src_dev,
                        dst_dev,
                    );
                    c.resize(bytes);
                    c
                },
                packs,
                unpacks,
            };
            self.ops.push(op);
        }
        debug!(ops = self.ops.len(), "peer-copy sender prepared");
        Ok(())
    }

    /// Post pack, cross-device copy, and unpack for every message.
    /// Non-blocking.
    pub fn send(&mut self) -> Result<()> {
        for op in &mut self.ops {
            for (region, off) in &op.packs {
                unsafe {
                    self.runtime.pack_device(
                        op.src_stream,
                        op.src_staging.byte_offset(*off),
                        region,
                    )?;
                }
            }
            self.runtime.event_record(op.event, op.src_stream)?;
            self.runtime.stream_wait_event(op.dst_stream, op.event)?;
            unsafe { op.copier.copy(op.dst_staging, op.src_staging)? };
            for (region, off) in &op.unpacks {
                unsafe {
                    self.runtime.unpack_device(
                        op.dst_stream,
                        region,
                        op.dst_staging.byte_offset(*off),
                    )?;
                }
            }
        }
        Ok(())
    }

    /// Block until every posted stage has completed.
    pub fn wait(&mut self) -> Result<()> {
        for &stream in self.streams.values() {
            self.runtime.stream_sync(stream)?;
        }
        Ok(())
    }
}

impl Drop for PeerCopySender {
    fn drop(&mut self) {
        for op in self.ops.drain(..) {
            let _ = self.runtime.free(op.src_dev, op.src_staging);
            let _ = self.runtime.free(op.dst_dev, op.dst_staging);
        }
    }
}
