//! In-process message layer: N ranks over one shared mailbox.
//!
//! Every rank lives in the same address space (typically one per thread),
//! so all ranks report as co-located and message delivery is a memcpy
//! under a mutex. This is the single-process substitute used by the test
//! suite and by single-host runs without a wire transport.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use crate::comm::{MessageLayer, ReqId};
use crate::error::{HaloError, Result};
use crate::types::{Rank, Tag};

struct PendingRecv {
    owner: Rank,
    src: Rank,
    tag: Tag,
    buf: usize,
    len: usize,
}

#[derive(Default)]
struct BusState {
    /// Per destination rank: undelivered payloads keyed by (source, tag).
    mailboxes: Vec<HashMap<(Rank, Tag), VecDeque<Vec<u8>>>>,
    pending: HashMap<ReqId, PendingRecv>,
    completed: HashMap<ReqId, Option<HaloError>>,
    next_req: ReqId,
    barrier_arrived: usize,
    barrier_gen: u64,
}

struct Bus {
    world: usize,
    epoch: Instant,
    state: Mutex<BusState>,
    cv: Condvar,
}

/// One endpoint of an in-process multi-rank bus.
#[derive(Clone)]
pub struct LocalComm {
    bus: Arc<Bus>,
    rank: Rank,
}

impl LocalComm {
    /// Create `world` connected endpoints sharing one bus; endpoint `i`
    /// has rank `i`. Hand each endpoint to one engine (one per thread).
    pub fn bus(world: usize) -> Vec<LocalComm> {
        assert!(world > 0, "world size must be positive");
        let bus = Arc::new(Bus {
            world,
            epoch: Instant::now(),
            state: Mutex::new(BusState {
                mailboxes: (0..world).map(|_| HashMap::new()).collect(),
                ..BusState::default()
            }),
            cv: Condvar::new(),
        });
        (0..world)
            .map(|rank| LocalComm {
                bus: Arc::clone(&bus),
                rank: rank as Rank,
            })
            .collect()
    }
}

impl BusState {
    fn fresh_req(&mut self) -> ReqId {
        let id = self.next_req;
        self.next_req += 1;
        id
    }
}

impl MessageLayer for LocalComm {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.bus.world
    }

    fn barrier(&self) -> Result<()> {
        let mut st = self
            .bus
            .state
            .lock()
            .map_err(|_| HaloError::transport("bus mutex poisoned"))?;
        st.barrier_arrived += 1;
        if st.barrier_arrived == self.bus.world {
            st.barrier_arrived = 0;
            st.barrier_gen += 1;
            self.bus.cv.notify_all();
        } else {
            let gen = st.barrier_gen;
            while st.barrier_gen == gen {
                st = self
                    .bus
                    .cv
                    .wait(st)
                    .map_err(|_| HaloError::transport("bus mutex poisoned"))?;
            }
        }
        Ok(())
    }

    fn colocated_ranks(&self) -> Result<Vec<Rank>> {
        Ok((0..self.bus.world as Rank).collect())
    }

    fn processor_name(&self) -> String {
        gethostname::gethostname().to_string_lossy().into_owned()
    }

    fn wtime(&self) -> f64 {
        self.bus.epoch.elapsed().as_secs_f64()
    }

    unsafe fn isend(&self, buf: *const u8, len: usize, dst: Rank, tag: Tag) -> Result<ReqId> {
        if dst as usize >= self.bus.world {
            return Err(HaloError::UnknownPeer { rank: dst });
        }
        let payload = unsafe { std::slice::from_raw_parts(buf, len) }.to_vec();

        let mut st = self
            .bus
            .state
            .lock()
            .map_err(|_| HaloError::transport("bus mutex poisoned"))?;
        let req = st.fresh_req();

        // Deliver straight into a matching posted receive when one exists.
        let matched_id = st
            .pending
            .iter()
            .filter(|(_, p)| p.owner == dst && p.src == self.rank && p.tag == tag)
            .map(|(&id, _)| id)
            .min();
        let matched = matched_id.and_then(|id| st.pending.remove(&id).map(|p| (id, p)));
        if let Some((id, p)) = matched {
            let outcome = if p.len != payload.len() {
                Some(HaloError::SizeMismatch {
                    expected: p.len,
                    actual: payload.len(),
                })
            } else {
                unsafe {
                    std::ptr::copy_nonoverlapping(payload.as_ptr(), p.buf as *mut u8, p.len);
                }
                None
            };
            st.completed.insert(id, outcome);
            self.bus.cv.notify_all();
        } else {
            st.mailboxes[dst as usize]
                .entry((self.rank, tag))
                .or_default()
                .push_back(payload);
        }

        // Buffered send: the payload is copied out, so it completes at once.
        st.completed.insert(req, None);
        Ok(req)
    }

    unsafe fn irecv(&self, buf: *mut u8, len: usize, src: Rank, tag: Tag) -> Result<ReqId> {
        if src as usize >= self.bus.world {
            return Err(HaloError::UnknownPeer { rank: src });
        }
        let mut st = self
            .bus
            .state
            .lock()
            .map_err(|_| HaloError::transport("bus mutex poisoned"))?;
        let req = st.fresh_req();

        let slot = st.mailboxes[self.rank as usize]
            .get_mut(&(src, tag))
            .and_then(|q| q.pop_front());
        if let Some(payload) = slot {
            let outcome = if payload.len() != len {
                Some(HaloError::SizeMismatch {
                    expected: len,
                    actual: payload.len(),
                })
            } else {
                unsafe {
                    std::ptr::copy_nonoverlapping(payload.as_ptr(), buf, len);
                }
                None
            };
            st.completed.insert(req, outcome);
        } else {
            st.pending.insert(
                req,
                PendingRecv {
                    owner: self.rank,
                    src,
                    tag,
                    buf: buf as usize,
                    len,
                },
            );
        }
        Ok(req)
    }

    fn test(&self, req: ReqId) -> Result<bool> {
        let st = self
            .bus
            .state
            .lock()
            .map_err(|_| HaloError::transport("bus mutex poisoned"))?;
        if st.completed.contains_key(&req) {
            Ok(true)
        } else if st.pending.contains_key(&req) {
            Ok(false)
        } else {
            Err(HaloError::UnknownRequest(req))
        }
    }

    fn wait(&self, req: ReqId) -> Result<()> {
        let mut st = self
            .bus
            .state
            .lock()
            .map_err(|_| HaloError::transport("bus mutex poisoned"))?;
        loop {
            if let Some(outcome) = st.completed.remove(&req) {
                return match outcome {
                    None => Ok(()),
                    Some(e) => Err(e),
                };
            }
            if !st.pending.contains_key(&req) {
                return Err(HaloError::UnknownRequest(req));
            }
            st = self
                .bus
                .cv
                .wait(st)
                .map_err(|_| HaloError::transport("bus mutex poisoned"))?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_then_recv_same_thread() {
        let comms = LocalComm::bus(1);
        let c = &comms[0];
        let src = [1u8, 2, 3, 4];
        let mut dst = [0u8; 4];
        let s = unsafe { c.isend(src.as_ptr(), 4, 0, 42).unwrap() };
        let r = unsafe { c.irecv(dst.as_mut_ptr(), 4, 0, 42).unwrap() };
        c.wait(s).unwrap();
        c.wait(r).unwrap();
        assert_eq!(dst, src);
    }

    #[test]
    fn test_recv_posted_first_across_threads() {
        let mut comms = LocalComm::bus(2);
        let c1 = comms.pop().unwrap();
        let c0 = comms.pop().unwrap();

        let t = std::thread::spawn(move || {
            let mut dst = [0u8; 8];
            let r = unsafe { c1.irecv(dst.as_mut_ptr(), 8, 0, 7).unwrap() };
            c1.wait(r).unwrap();
            dst
        });

        let payload = [9u8; 8];
        let s = unsafe { c0.isend(payload.as_ptr(), 8, 1, 7).unwrap() };
        c0.wait(s).unwrap();
        assert_eq!(t.join().unwrap(), payload);
    }

    #[test]
    fn test_tag_matching_is_exact() {
        let comms = LocalComm::bus(1);
        let c = &comms[0];
        let a = [1u8];
        let b = [2u8];
        let sa = unsafe { c.isend(a.as_ptr(), 1, 0, 10).unwrap() };
        let sb = unsafe { c.isend(b.as_ptr(), 1, 0, 11).unwrap() };
        let mut got_b = [0u8];
        let mut got_a = [0u8];
        let rb = unsafe { c.irecv(got_b.as_mut_ptr(), 1, 0, 11).unwrap() };
        let ra = unsafe { c.irecv(got_a.as_mut_ptr(), 1, 0, 10).unwrap() };
        for req in [sa, sb, rb, ra] {
            c.wait(req).unwrap();
        }
        assert_eq!(got_a, a);
        assert_eq!(got_b, b);
    }

    #[test]
    fn test_size_mismatch_reported() {
        let comms = LocalComm::bus(1);
        let c = &comms[0];
        let src = [0u8; 4];
        let mut dst = [0u8; 2];
        let s = unsafe { c.isend(src.as_ptr(), 4, 0, 0).unwrap() };
        let r = unsafe { c.irecv(dst.as_mut_ptr(), 2, 0, 0).unwrap() };
        c.wait(s).unwrap();
        assert!(matches!(c.wait(r), Err(HaloError::SizeMismatch { .. })));
    }

    #[test]
    fn test_barrier_releases_all() {
        let comms = LocalComm::bus(3);
        let handles: Vec<_> = comms
            .into_iter()
            .map(|c| {
                std::thread::spawn(move || {
                    c.barrier().unwrap();
                    c.barrier().unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn test_colocated_and_identity() {
        let comms = LocalComm::bus(2);
        assert_eq!(comms[1].rank(), 1);
        assert_eq!(comms[0].world_size(), 2);
        assert_eq!(comms[0].colocated_ranks().unwrap(), vec![0, 1]);
        assert!(!comms[0].processor_name().is_empty());
        assert!(comms[0].wtime() >= 0.0);
    }

    #[test]
    fn test_unknown_request() {
        let comms = LocalComm::bus(1);
        assert!(matches!(
            comms[0].test(999),
            Err(HaloError::UnknownRequest(999))
        ));
    }
}
