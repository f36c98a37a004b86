//! CUDA-backed device runtime.
//!
//! Uses cudarc 0.19 raw driver calls. Copies are synchronous (streams
//! report done immediately), which keeps the exchange correct at the cost
//! of overlap; sites that need true async should supply their own
//! [`DeviceRuntime`]. Unified allocation and IPC are not offered by this
//! adapter, so run with `MethodFlags::KERNEL | PEER_COPY | REMOTE`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{HaloError, Result};
use crate::geom::Dim3;
use crate::runtime::{DevicePtr, DeviceRuntime, EventId, IpcMemHandle, Region, StreamId};

struct CudaState {
    streams: HashMap<StreamId, usize>,
    events: HashMap<EventId, usize>,
    alloc_device: HashMap<u64, usize>,
    next_id: u64,
}

/// Device runtime over the CUDA driver API.
pub struct CudaRuntime {
    ctxs: Vec<Arc<cudarc::driver::CudaContext>>,
    state: Mutex<CudaState>,
}

fn cuda_err(what: &str, e: impl std::fmt::Display) -> HaloError {
    HaloError::device(format!("{what} failed: {e}"))
}

impl CudaRuntime {
    /// Create a context on every visible device.
    pub fn new() -> Result<Self> {
        let count = cudarc::driver::result::device::get_count()
            .map_err(|e| cuda_err("cuDeviceGetCount", e))? as usize;
        if count == 0 {
            return Err(HaloError::device("no CUDA devices visible"));
        }
        let mut ctxs = Vec::with_capacity(count);
        for ordinal in 0..count {
            ctxs.push(
                cudarc::driver::CudaContext::new(ordinal)
                    .map_err(|e| cuda_err("CudaContext::new", e))?,
            );
        }
        Ok(Self {
            ctxs,
            state: Mutex::new(CudaState {
                streams: HashMap::new(),
                events: HashMap::new(),
                alloc_device: HashMap::new(),
                next_id: 0,
            }),
        })
    }

    fn bind(&self, device: usize) -> Result<()> {
        let ctx = self.ctxs.get(device).ok_or_else(|| {
            HaloError::device(format!(
                "device {device} out of range: {} visible",
                self.ctxs.len()
            ))
        })?;
        ctx.bind_to_thread()
            .map_err(|e| cuda_err("bind_to_thread", e))
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, CudaState>> {
        self.state
            .lock()
            .map_err(|_| HaloError::device("cuda runtime mutex poisoned"))
    }

    /// Walk the contiguous x-runs of `region`, calling `f(run_ptr, run_bytes,
    /// staging_offset)` in pack order.
    fn for_each_row(region: &Region, mut f: impl FnMut(u64, usize, usize) -> Result<()>) -> Result<()> {
        let row = region.row_bytes();
        let mut off = 0;
        for z in 0..region.extent.z {
            for y in 0..region.extent.y {
                f(region.ptr_at(Dim3::new(0, y, z)), row, off)?;
                off += row;
            }
        }
        Ok(())
    }
}

impl DeviceRuntime for CudaRuntime {
    fn device_count(&self) -> usize {
        self.ctxs.len()
    }

    fn alloc(&self, device: usize, bytes: usize) -> Result<DevicePtr> {
        self.bind(device)?;
        let ptr = unsafe { cudarc::driver::result::malloc_sync(bytes.max(1)) }
            .map_err(|e| cuda_err("cuMemAlloc", e))?;
        self.lock()?.alloc_device.insert(ptr as u64, device);
        Ok(unsafe { DevicePtr::new(ptr as u64) })
    }

    fn alloc_unified(&self, _device: usize, _bytes: usize) -> Result<DevicePtr> {
        Err(HaloError::device(
            "unified allocation not offered by the cudarc adapter",
        ))
    }

    fn free(&self, device: usize, ptr: DevicePtr) -> Result<()> {
        self.bind(device)?;
        self.lock()?.alloc_device.remove(&ptr.as_u64());
        unsafe {
            cudarc::driver::result::free_sync(ptr.as_u64() as cudarc::driver::sys::CUdeviceptr)
        }
        .map_err(|e| cuda_err("cuMemFree", e))
    }

    fn stream_create(&self, device: usize) -> Result<StreamId> {
        self.bind(device)?;
        let mut st = self.lock()?;
        st.next_id += 1;
        let id = st.next_id;
        st.streams.insert(id, device);
        Ok(id)
    }

    fn stream_done(&self, stream: StreamId) -> Result<bool> {
        // Copies are synchronous in this adapter.
        self.lock()?
            .streams
            .contains_key(&stream)
            .then_some(true)
            .ok_or_else(|| HaloError::device(format!("unknown stream {stream}")))
    }

    fn stream_sync(&self, stream: StreamId) -> Result<()> {
        self.stream_done(stream).map(|_| ())
    }

    fn event_create(&self, device: usize) -> Result<EventId> {
        self.bind(device)?;
        let mut st = self.lock()?;
        st.next_id += 1;
        let id = st.next_id;
        st.events.insert(id, device);
        Ok(id)
    }

    fn event_record(&self, event: EventId, _stream: StreamId) -> Result<()> {
        self.lock()?
            .events
            .contains_key(&event)
            .then_some(())
            .ok_or_else(|| HaloError::device(format!("unknown event {event}")))
    }

    fn event_query(&self, event: EventId) -> Result<bool> {
        self.lock()?
            .events
            .contains_key(&event)
            .then_some(true)
            .ok_or_else(|| HaloError::device(format!("unknown event {event}")))
    }

    fn stream_wait_event(&self, _stream: StreamId, event: EventId) -> Result<()> {
        self.event_query(event).map(|_| ())
    }

    fn can_access_peer(&self, _src: usize, _dst: usize) -> bool {
        // Conservative: route cross-device traffic through host staging.
        false
    }

    fn enable_peer_access(&self, _src: usize, _dst: usize) -> Result<()> {
        Err(HaloError::device(
            "peer access not offered by the cudarc adapter",
        ))
    }

    unsafe fn copy_3d(&self, stream: StreamId, dst: &Region, src: &Region) -> Result<()> {
        if dst.extent != src.extent || dst.elem_size != src.elem_size {
            return Err(HaloError::device("copy_3d region shape mismatch"));
        }
        let device = *self
            .lock()?
            .streams
            .get(&stream)
            .ok_or_else(|| HaloError::device(format!("unknown stream {stream}")))?;
        self.bind(device)?;
        let row = src.row_bytes();
        for z in 0..src.extent.z {
            for y in 0..src.extent.y {
                let rel = Dim3::new(0, y, z);
                unsafe {
                    cudarc::driver::result::memcpy_dtod_sync(
                        dst.ptr_at(rel) as cudarc::driver::sys::CUdeviceptr,
                        src.ptr_at(rel) as cudarc::driver::sys::CUdeviceptr,
                        row,
                    )
                }
                .map_err(|e| cuda_err("cuMemcpyDtoD", e))?;
            }
        }
        Ok(())
    }

    unsafe fn pack(&self, stream: StreamId, dst: *mut u8, src: &Region) -> Result<()> {
        let device = *self
            .lock()?
            .streams
            .get(&stream)
            .ok_or_else(|| HaloError::device(format!("unknown stream {stream}")))?;
        self.bind(device)?;
        Self::for_each_row(src, |run, bytes, off| {
            let out = unsafe { std::slice::from_raw_parts_mut(dst.add(off), bytes) };
            unsafe {
                cudarc::driver::result::memcpy_dtoh_sync(
                    out,
                    run as cudarc::driver::sys::CUdeviceptr,
                )
            }
            .map_err(|e| cuda_err("cuMemcpyDtoH", e))
        })
    }

    unsafe fn unpack(&self, stream: StreamId, dst: &Region, src: *const u8) -> Result<()> {
        let device = *self
            .lock()?
            .streams
            .get(&stream)
            .ok_or_else(|| HaloError::device(format!("unknown stream {stream}")))?;
        self.bind(device)?;
        Self::for_each_row(dst, |run, bytes, off| {
            let input = unsafe { std::slice::from_raw_parts(src.add(off), bytes) };
            unsafe {
                cudarc::driver::result::memcpy_htod_sync(
                    run as cudarc::driver::sys::CUdeviceptr,
                    input,
                )
            }
            .map_err(|e| cuda_err("cuMemcpyHtoD", e))
        })
    }

    unsafe fn pack_device(&self, stream: StreamId, dst: DevicePtr, src: &Region) -> Result<()> {
        let device = *self
            .lock()?
            .streams
            .get(&stream)
            .ok_or_else(|| HaloError::device(format!("unknown stream {stream}")))?;
        self.bind(device)?;
        Self::for_each_row(src, |run, bytes, off| {
            unsafe {
                cudarc::driver::result::memcpy_dtod_sync(
                    (dst.as_u64() + off as u64) as cudarc::driver::sys::CUdeviceptr,
                    run as cudarc::driver::sys::CUdeviceptr,
                    bytes,
                )
            }
            .map_err(|e| cuda_err("cuMemcpyDtoD", e))
        })
    }

    unsafe fn unpack_device(&self, stream: StreamId, dst: &Region, src: DevicePtr) -> Result<()> {
        let device = *self
            .lock()?
            .streams
            .get(&stream)
            .ok_or_else(|| HaloError::device(format!("unknown stream {stream}")))?;
        self.bind(device)?;
        Self::for_each_row(dst, |run, bytes, off| {
            unsafe {
                cudarc::driver::result::memcpy_dtod_sync(
                    run as cudarc::driver::sys::CUdeviceptr,
                    (src.as_u64() + off as u64) as cudarc::driver::sys::CUdeviceptr,
                    bytes,
                )
            }
            .map_err(|e| cuda_err("cuMemcpyDtoD", e))
        })
    }

    unsafe fn memcpy_peer(
        &self,
        _stream: StreamId,
        dst: DevicePtr,
        dst_device: usize,
        src: DevicePtr,
        _src_device: usize,
        bytes: usize,
    ) -> Result<()> {
        // Unified addressing: DtoD handles cross-device pointers.
        self.bind(dst_device)?;
        unsafe {
            cudarc::driver::result::memcpy_dtod_sync(
                dst.as_u64() as cudarc::driver::sys::CUdeviceptr,
                src.as_u64() as cudarc::driver::sys::CUdeviceptr,
                bytes,
            )
        }
        .map_err(|e| cuda_err("cuMemcpyDtoD (peer)", e))
    }

    fn ipc_export(&self, _device: usize, _ptr: DevicePtr) -> Result<IpcMemHandle> {
        Err(HaloError::device("IPC not offered by the cudarc adapter"))
    }

    unsafe fn ipc_import(&self, _device: usize, _handle: &IpcMemHandle) -> Result<DevicePtr> {
        Err(HaloError::device("IPC not offered by the cudarc adapter"))
    }
}
