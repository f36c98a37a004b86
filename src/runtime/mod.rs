//! The accelerator runtime the engine consumes.
//!
//! The engine operates on raw `u64` device pointers plus byte counts and
//! drives asynchronous per-device streams. [`HostRuntime`] is the built-in
//! single-address-space implementation (host memory standing in for any
//! number of devices); a CUDA-backed implementation is available behind the
//! `cuda` feature.

mod host;

#[cfg(feature = "cuda")]
mod cuda;

pub use host::HostRuntime;

#[cfg(feature = "cuda")]
pub use cuda::CudaRuntime;

use crate::error::Result;
use crate::geom::Dim3;

/// A raw pointer into a device allocation.
///
/// Zero-cost wrapper around a `u64`; the runtime that produced it is the
/// only one that can interpret it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct DevicePtr(u64);

impl DevicePtr {
    /// Wrap a raw `u64` pointer.
    ///
    /// # Safety
    /// The value must be a pointer obtained from the runtime it will be
    /// used with.
    pub unsafe fn new(ptr: u64) -> Self {
        Self(ptr)
    }

    /// The raw `u64` pointer.
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Pointer advanced by `bytes`.
    pub fn byte_offset(&self, bytes: usize) -> DevicePtr {
        DevicePtr(self.0 + bytes as u64)
    }
}

impl std::fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DevicePtr(0x{:x})", self.0)
    }
}

/// Identifier for an asynchronous device stream. Operations on one stream
/// are FIFO; no ordering holds across streams without an event.
pub type StreamId = u64;

/// Identifier for a recordable stream event.
pub type EventId = u64;

/// Number of bytes in an exported IPC memory handle.
pub const IPC_HANDLE_BYTES: usize = 64;

/// An exported device allocation handle, sharable across processes on the
/// same host through the message layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpcMemHandle(pub [u8; IPC_HANDLE_BYTES]);

impl IpcMemHandle {
    pub fn as_bytes(&self) -> &[u8; IPC_HANDLE_BYTES] {
        &self.0
    }
}

/// A strided 3D sub-region of a device allocation.
///
/// `raw` is the allocated extent, `origin` the region's first cell within
/// the allocation, `extent` the region's size in cells. Storage is
/// row-major with x fastest: `idx = x + raw.x * (y + raw.y * z)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub base: DevicePtr,
    pub raw: Dim3,
    pub origin: Dim3,
    pub extent: Dim3,
    pub elem_size: usize,
}

impl Region {
    /// Total payload bytes of the region (its cells, not the allocation).
    pub fn bytes(&self) -> usize {
        self.extent.prod() as usize * self.elem_size
    }

    /// Raw address of the cell at `rel` (region-relative coordinates).
    pub fn ptr_at(&self, rel: Dim3) -> u64 {
        let p = self.origin + rel;
        let idx = p.x + self.raw.x * (p.y + self.raw.y * p.z);
        self.base.as_u64() + idx as u64 * self.elem_size as u64
    }

    /// Bytes in one contiguous x-run of the region.
    pub fn row_bytes(&self) -> usize {
        self.extent.x as usize * self.elem_size
    }
}

/// Device enumeration, memory, streams, events, strided copies, and IPC.
///
/// All copy operations are posted to a stream and complete no later than
/// the next `stream_sync` on that stream. Implementations may execute
/// eagerly (completing before return); callers must not rely on deferral.
pub trait DeviceRuntime: Send + Sync {
    /// Number of physical devices visible to this process.
    fn device_count(&self) -> usize;

    /// Allocate `bytes` of device memory on `device`.
    fn alloc(&self, device: usize, bytes: usize) -> Result<DevicePtr>;

    /// Allocate `bytes` of unified memory accessible from host and device.
    fn alloc_unified(&self, device: usize, bytes: usize) -> Result<DevicePtr>;

    /// Release an allocation made by this runtime.
    fn free(&self, device: usize, ptr: DevicePtr) -> Result<()>;

    /// Create an asynchronous stream on `device`.
    fn stream_create(&self, device: usize) -> Result<StreamId>;

    /// True when every operation posted to the stream has completed.
    fn stream_done(&self, stream: StreamId) -> Result<bool>;

    /// Block until every operation posted to the stream has completed.
    fn stream_sync(&self, stream: StreamId) -> Result<()>;

    /// Create a recordable event on `device`.
    fn event_create(&self, device: usize) -> Result<EventId>;

    /// Record `event` after the work currently posted to `stream`.
    fn event_record(&self, event: EventId, stream: StreamId) -> Result<()>;

    /// True when the last recorded state of `event` has completed.
    fn event_query(&self, event: EventId) -> Result<bool>;

    /// Make future work on `stream` wait for `event`'s recorded state.
    fn stream_wait_event(&self, stream: StreamId, event: EventId) -> Result<()>;

    /// Whether `src` can directly address memory on `dst`.
    fn can_access_peer(&self, src: usize, dst: usize) -> bool;

    /// Enable direct peer addressing from `src` to `dst`.
    fn enable_peer_access(&self, src: usize, dst: usize) -> Result<()>;

    /// Strided region copy between allocations reachable from the stream's
    /// device (same device, or a peer with access enabled). Extents of
    /// `dst` and `src` must match.
    ///
    /// # Safety
    /// Both regions must lie entirely inside live allocations.
    unsafe fn copy_3d(&self, stream: StreamId, dst: &Region, src: &Region) -> Result<()>;

    /// Gather a strided device region into a contiguous host buffer.
    ///
    /// # Safety
    /// `dst` must be valid for `src.bytes()` bytes until the stream syncs.
    unsafe fn pack(&self, stream: StreamId, dst: *mut u8, src: &Region) -> Result<()>;

    /// Scatter a contiguous host buffer into a strided device region.
    ///
    /// # Safety
    /// `src` must be valid for `dst.bytes()` bytes until the stream syncs.
    unsafe fn unpack(&self, stream: StreamId, dst: &Region, src: *const u8) -> Result<()>;

    /// Gather a strided device region into a contiguous device buffer.
    ///
    /// # Safety
    /// `dst` must point into a live allocation of at least `src.bytes()`.
    unsafe fn pack_device(&self, stream: StreamId, dst: DevicePtr, src: &Region) -> Result<()>;

    /// Scatter a contiguous device buffer into a strided device region.
    ///
    /// # Safety
    /// `src` must point into a live allocation of at least `dst.bytes()`.
    unsafe fn unpack_device(&self, stream: StreamId, dst: &Region, src: DevicePtr) -> Result<()>;

    /// Contiguous copy between allocations on two devices.
    ///
    /// # Safety
    /// Both pointers must be valid for `bytes`.
    unsafe fn memcpy_peer(
        &self,
        stream: StreamId,
        dst: DevicePtr,
        dst_device: usize,
        src: DevicePtr,
        src_device: usize,
        bytes: usize,
    ) -> Result<()>;

    /// Export an allocation for mapping by a co-located process.
    fn ipc_export(&self, device: usize, ptr: DevicePtr) -> Result<IpcMemHandle>;

    /// Map a handle exported by a co-located process into this process.
    ///
    /// # Safety
    /// The handle must come from `ipc_export` on a live allocation.
    unsafe fn ipc_import(&self, device: usize, handle: &IpcMemHandle) -> Result<DevicePtr>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_geometry() {
        let r = Region {
            base: unsafe { DevicePtr::new(1000) },
            raw: Dim3::new(6, 5, 4),
            origin: Dim3::new(1, 2, 3),
            extent: Dim3::new(2, 3, 1),
            elem_size: 8,
        };
        assert_eq!(r.bytes(), 2 * 3 * 8);
        assert_eq!(r.row_bytes(), 16);
        // cell (0,0,0) -> allocation cell (1,2,3) -> idx 1 + 6*(2 + 5*3)
        assert_eq!(r.ptr_at(Dim3::ZERO), 1000 + (1 + 6 * (2 + 5 * 3)) * 8);
    }

    #[test]
    fn test_device_ptr_offset() {
        let p = unsafe { DevicePtr::new(0x100) };
        assert_eq!(p.byte_offset(0x20).as_u64(), 0x120);
        assert!(p.to_string().contains("0x100"));
    }
}
