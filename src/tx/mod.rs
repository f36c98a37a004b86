//! Transport tiers and their shared contracts.
//!
//! Four tiers, ordered most-local first: same-device kernel copy, same-rank
//! peer copy, shared-host IPC transfer, cross-host staged pipeline. The
//! exchange driver sees each tier only through the small contracts below
//! plus the named stage queries of the stateful tiers; no transport detail
//! leaks upward.

mod colocated;
mod host_ep;
mod peer_access;
mod peer_copy;
mod remote;

pub use colocated::{ColocatedHaloRecver, ColocatedHaloSender};
pub use host_ep::{HostRecver, HostSender};
pub use peer_access::PeerAccessSender;
pub use peer_copy::{PeerCopier, PeerCopySender};
pub use remote::{RemoteRecver, RemoteSender};

use crate::error::Result;
use crate::message::Message;
use crate::runtime::DevicePtr;

/// Alignment of every staging-buffer entry. Both ends of a shared-host
/// flow derive offsets independently, so this is a fixed crate constant.
pub const STAGING_ALIGN: usize = 64;

pub(crate) fn align_up(n: usize) -> usize {
    n.div_ceil(STAGING_ALIGN) * STAGING_ALIGN
}

/// An asynchronous one-shot sender, paired with a [`Recver`] at the far end.
pub trait Sender {
    /// Prepare to send `n` bytes.
    fn resize(&mut self, n: usize);

    /// Start sending `n` bytes from `src`.
    ///
    /// # Safety
    /// `src` must stay valid until [`wait`](Self::wait) returns.
    unsafe fn send(&mut self, src: *const u8) -> Result<()>;

    /// Block until the send completes.
    fn wait(&mut self) -> Result<()>;
}

/// An asynchronous one-shot receiver.
pub trait Recver {
    /// Prepare to receive `n` bytes.
    fn resize(&mut self, n: usize);

    /// Start receiving `n` bytes into `dst`.
    ///
    /// # Safety
    /// `dst` must stay valid until [`wait`](Self::wait) returns.
    unsafe fn recv(&mut self, dst: *mut u8) -> Result<()>;

    /// Block until the receive completes.
    fn wait(&mut self) -> Result<()>;
}

/// An asynchronous device-to-device copier.
pub trait Copier {
    /// Prepare to copy `n` bytes.
    fn resize(&mut self, n: usize);

    /// Start copying `n` bytes from `src` to `dst`.
    ///
    /// # Safety
    /// Both pointers must name live allocations of at least `n` bytes.
    unsafe fn copy(&mut self, dst: DevicePtr, src: DevicePtr) -> Result<()>;

    /// Block until the copy completes.
    fn wait(&mut self) -> Result<()>;
}

/// A sender that advances through multiple discrete stages.
///
/// ```text
/// sender.send();
/// while sender.active() {
///     if sender.next_ready()? {
///         sender.next()?;
///     }
/// }
/// sender.wait();
/// ```
pub trait StatefulSender {
    /// Prepare to send these messages each step.
    fn prepare(&mut self, outbox: &[Message]) -> Result<()>;

    /// Start a send.
    fn send(&mut self) -> Result<()>;

    /// True while a stage transition is still outstanding.
    fn active(&self) -> bool;

    /// True when the current stage is done and `next` may be called.
    fn next_ready(&mut self) -> Result<bool>;

    /// Advance to the next stage.
    fn next(&mut self) -> Result<()>;

    /// Block until the final stage is done. Call once `active()` is false.
    fn wait(&mut self) -> Result<()>;
}

/// A receiver that advances through multiple discrete stages.
pub trait StatefulRecver {
    /// Prepare to receive these messages each step.
    fn prepare(&mut self, inbox: &[Message]) -> Result<()>;

    /// Start a receive.
    fn recv(&mut self) -> Result<()>;

    /// True while a stage transition is still outstanding.
    fn active(&self) -> bool;

    /// True when the current stage is done and `next` may be called.
    fn next_ready(&mut self) -> Result<bool>;

    /// Advance to the next stage.
    fn next(&mut self) -> Result<()>;

    /// Block until the final stage is done. Call once `active()` is false.
    fn wait(&mut self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0), 0);
        assert_eq!(align_up(1), 64);
        assert_eq!(align_up(64), 64);
        assert_eq!(align_up(65), 128);
    }
}
