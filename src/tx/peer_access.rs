//! Tier 1: same-device halo copies.
//!
//! Source and destination sub-domains live on the same physical device, so
//! each message is a strided region copy posted to that device's stream.
//! One sender per engine aggregates the messages of every sub-domain.

use std::sync::Arc;

use indexmap::IndexMap;
use tracing::debug;

use crate::domain::DomainShape;
use crate::error::{HaloError, Result};
use crate::message::Message;
use crate::plan::SlotMap;
use crate::runtime::{DeviceRuntime, Region, StreamId};
use crate::types::Rank;

/// Same-device sender: one strided copy per (message, field) pair.
pub struct PeerAccessSender {
    runtime: Arc<dyn DeviceRuntime>,
    rank: Rank,
    streams: IndexMap<usize, StreamId>,
    ops: Vec<(StreamId, Region, Region)>,
}

impl PeerAccessSender {
    pub fn new(runtime: Arc<dyn DeviceRuntime>, rank: Rank) -> Self {
        Self {
            runtime,
            rank,
            streams: IndexMap::new(),
            ops: Vec::new(),
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
            let dev = shapes[src].gpu();
            assert_eq!(dev, shapes[dst].gpu(), "tier-1 message crosses devices");

            let stream = match self.streams.get(&dev) {
                Some(&s) => s,
                None => {
                    let s = self.runtime.stream_create(dev)?;
                    self.streams.insert(dev, s);
                    s
                }
            };
            for f in 0..shapes[src].num_data() {
                let from = shapes[src].interior_region(f, msg.dir);
                let to = shapes[dst].ghost_region(f, -msg.dir);
                self.ops.push((stream, to, from));
            }
        }
        debug!(ops = self.ops.len(), "peer-access sender prepared");
        Ok(())
    }

    /// Post every copy. Non-blocking.
    pub fn send(&mut self) -> Result<()> {
        for (stream, dst, src) in &self.ops {
            unsafe { self.runtime.copy_3d(*stream, dst, src)? };
        }
        Ok(())
    }

    /// Block until every posted copy has completed.
    pub fn wait(&mut self) -> Result<()> {
        for &stream in self.streams.values() {
            self.runtime.stream_sync(stream)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::LocalDomain;
    use crate::geom::{Dim3, Radius};
    use crate::runtime::HostRuntime;

    #[test]
    fn test_self_wrap_copy() {
        // One 4^3 domain; the +x message wraps onto itself, filling the -x
        // ghost slab with the +x interior plane.
        let rt = Arc::new(HostRuntime::new(1));
        let mut dom = LocalDomain::new(Dim3::new(4, 4, 4), 0, rt.clone());
        dom.set_radius(Radius::constant(1));
        let h = dom.add_data(1);
        dom.realize().unwrap();

        // Brand every interior cell with x+1.
        let interior = dom.interior_region(h, Dim3::ZERO);
        for z in 0..4 {
            for y in 0..4 {
                for x in 0..4 {
                    unsafe {
                        *(interior.ptr_at(Dim3::new(x, y, z)) as *mut u8) = (x + 1) as u8;
                    }
                }
            }
        }

        let shapes = vec![dom.shape()];
        let slot_map: SlotMap = [(0, 0)].into_iter().collect();
        let msg = Message::new(Dim3::new(1, 0, 0), 0, 0);

        let mut tx = PeerAccessSender::new(rt, 0);
        tx.prepare(&[msg], &shapes, &slot_map).unwrap();
        tx.send().unwrap();
        tx.wait().unwrap();

        let ghost = dom.ghost_region(h, Dim3::new(-1, 0, 0));
        for z in 0..4 {
            for y in 0..4 {
                let got = unsafe { *(ghost.ptr_at(Dim3::new(0, y, z)) as *const u8) };
                assert_eq!(got, 4, "ghost cell ({y},{z})");
            }
        }
    }

    #[test]
    fn test_unknown_slot_is_error() {
        let rt = Arc::new(HostRuntime::new(1));
        let mut dom = LocalDomain::new(Dim3::new(2, 2, 2), 0, rt.clone());
        dom.set_radius(Radius::constant(1));
        dom.add_data(1);
        dom.realize().unwrap();
        let shapes = vec![dom.shape()];
        let slot_map: SlotMap = [(0, 0)].into_iter().collect();

        let mut tx = PeerAccessSender::new(rt, 0);
        let msg = Message::new(Dim3::new(1, 0, 0), 0, 5);
        assert!(matches!(
            tx.prepare(&[msg], &shapes, &slot_map),
            Err(HaloError::NoSuchDomain { slot: 5, .. })
        ));
    }
}
