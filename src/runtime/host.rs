//! Host-memory device simulation.
//!
//! Models any number of "devices" inside one address space. Streams execute
//! eagerly on the calling thread, so every stream and event always reports
//! done; IPC export/import is the identity. This is the single-process,
//! single-address-space runtime the engine's tests run against.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{HaloError, Result};
use crate::runtime::{DevicePtr, DeviceRuntime, EventId, IpcMemHandle, Region, StreamId};

struct Allocation {
    device: usize,
    len: usize,
}

#[derive(Default)]
struct HostState {
    allocs: HashMap<u64, Allocation>,
    streams: HashMap<StreamId, usize>,
    events: HashMap<EventId, usize>,
    next_id: u64,
}

/// Simulated multi-device runtime over host memory.
pub struct HostRuntime {
    devices: usize,
    state: Mutex<HostState>,
}

impl HostRuntime {
    pub fn new(devices: usize) -> Self {
        assert!(devices > 0, "device count must be positive");
        Self {
            devices,
            state: Mutex::new(HostState::default()),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HostState>> {
        self.state
            .lock()
            .map_err(|_| HaloError::device("host runtime mutex poisoned"))
    }

    fn check_device(&self, device: usize) -> Result<()> {
        if device >= self.devices {
            return Err(HaloError::device(format!(
                "device {device} out of range: {} visible",
                self.devices
            )));
        }
        Ok(())
    }
}

impl Drop for HostRuntime {
    fn drop(&mut self) {
        if let Ok(st) = self.state.lock() {
            for (&ptr, alloc) in &st.allocs {
                unsafe {
                    drop(Vec::from_raw_parts(ptr as *mut u8, alloc.len, alloc.len));
                }
            }
        }
    }
}

/// Copy one contiguous x-run at a time; both regions have equal extents.
unsafe fn copy_rows(dst: &Region, src: &Region) {
    assert_eq!(dst.extent, src.extent, "region extent mismatch");
    assert_eq!(dst.elem_size, src.elem_size, "element size mismatch");
    let row = src.row_bytes();
    for z in 0..src.extent.z {
        for y in 0..src.extent.y {
            let rel = crate::geom::Dim3::new(0, y, z);
            unsafe {
                std::ptr::copy_nonoverlapping(
                    src.ptr_at(rel) as *const u8,
                    dst.ptr_at(rel) as *mut u8,
                    row,
                );
            }
        }
    }
}

impl DeviceRuntime for HostRuntime {
    fn device_count(&self) -> usize {
        self.devices
    }

    fn alloc(&self, device: usize, bytes: usize) -> Result<DevicePtr> {
        self.check_device(device)?;
        let mut buf = vec![0u8; bytes.max(1)];
        let ptr = buf.as_mut_ptr() as u64;
        std::mem::forget(buf);
        self.lock()?.allocs.insert(
            ptr,
            Allocation {
                device,
                len: bytes.max(1),
            },
        );
        Ok(unsafe { DevicePtr::new(ptr) })
    }

    fn alloc_unified(&self, device: usize, bytes: usize) -> Result<DevicePtr> {
        // Host memory is unified by construction.
        self.alloc(device, bytes)
    }

    fn free(&self, device: usize, ptr: DevicePtr) -> Result<()> {
        self.check_device(device)?;
        let alloc = self
            .lock()?
            .allocs
            .remove(&ptr.as_u64())
            .ok_or_else(|| HaloError::device(format!("free of unknown pointer {ptr}")))?;
        unsafe {
            drop(Vec::from_raw_parts(
                ptr.as_u64() as *mut u8,
                alloc.len,
                alloc.len,
            ));
        }
        Ok(())
    }

    fn stream_create(&self, device: usize) -> Result<StreamId> {
        self.check_device(device)?;
        let mut st = self.lock()?;
        st.next_id += 1;
        let id = st.next_id;
        st.streams.insert(id, device);
        Ok(id)
    }

    fn stream_done(&self, stream: StreamId) -> Result<bool> {
        // Eager execution: work completes as it is posted.
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
        self.check_device(device)?;
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
        // One address space: every device can address every other.
        true
    }

    fn enable_peer_access(&self, src: usize, dst: usize) -> Result<()> {
        self.check_device(src)?;
        self.check_device(dst)
    }

    unsafe fn copy_3d(&self, _stream: StreamId, dst: &Region, src: &Region) -> Result<()> {
        unsafe { copy_rows(dst, src) };
        Ok(())
    }

    unsafe fn pack(&self, _stream: StreamId, dst: *mut u8, src: &Region) -> Result<()> {
        let row = src.row_bytes();
        let mut off = 0;
        for z in 0..src.extent.z {
            for y in 0..src.extent.y {
                let rel = crate::geom::Dim3::new(0, y, z);
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        src.ptr_at(rel) as *const u8,
                        dst.add(off),
                        row,
                    );
                }
                off += row;
            }
        }
        Ok(())
    }

    unsafe fn unpack(&self, _stream: StreamId, dst: &Region, src: *const u8) -> Result<()> {
        let row = dst.row_bytes();
        let mut off = 0;
        for z in 0..dst.extent.z {
            for y in 0..dst.extent.y {
                let rel = crate::geom::Dim3::new(0, y, z);
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        src.add(off),
                        dst.ptr_at(rel) as *mut u8,
                        row,
                    );
                }
                off += row;
            }
        }
        Ok(())
    }

    unsafe fn pack_device(&self, stream: StreamId, dst: DevicePtr, src: &Region) -> Result<()> {
        unsafe { self.pack(stream, dst.as_u64() as *mut u8, src) }
    }

    unsafe fn unpack_device(&self, stream: StreamId, dst: &Region, src: DevicePtr) -> Result<()> {
        unsafe { self.unpack(stream, dst, src.as_u64() as *const u8) }
    }

    unsafe fn memcpy_peer(
        &self,
        _stream: StreamId,
        dst: DevicePtr,
        _dst_device: usize,
        src: DevicePtr,
        _src_device: usize,
        bytes: usize,
    ) -> Result<()> {
        unsafe {
            std::ptr::copy_nonoverlapping(
                src.as_u64() as *const u8,
                dst.as_u64() as *mut u8,
                bytes,
            );
        }
        Ok(())
    }

    fn ipc_export(&self, device: usize, ptr: DevicePtr) -> Result<IpcMemHandle> {
        self.check_device(device)?;
        if !self.lock()?.allocs.contains_key(&ptr.as_u64()) {
            return Err(HaloError::device(format!("export of unknown pointer {ptr}")));
        }
        let mut bytes = [0u8; crate::runtime::IPC_HANDLE_BYTES];
        bytes[..8].copy_from_slice(&ptr.as_u64().to_le_bytes());
        Ok(IpcMemHandle(bytes))
    }

    unsafe fn ipc_import(&self, device: usize, handle: &IpcMemHandle) -> Result<DevicePtr> {
        self.check_device(device)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&handle.0[..8]);
        Ok(unsafe { DevicePtr::new(u64::from_le_bytes(raw)) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geom::Dim3;

    fn region(base: DevicePtr, raw: Dim3, origin: Dim3, extent: Dim3) -> Region {
        Region {
            base,
            raw,
            origin,
            extent,
            elem_size: 1,
        }
    }

    #[test]
    fn test_alloc_free() {
        let rt = HostRuntime::new(2);
        let p = rt.alloc(1, 64).unwrap();
        assert!(rt.free(1, p).is_ok());
        assert!(rt.free(1, p).is_err());
        assert!(rt.alloc(2, 8).is_err());
    }

    #[test]
    fn test_pack_unpack_roundtrip() {
        let rt = HostRuntime::new(1);
        let raw = Dim3::new(4, 4, 4);
        let a = rt.alloc(0, 64).unwrap();
        let b = rt.alloc(0, 64).unwrap();
        let s = rt.stream_create(0).unwrap();

        // Write a recognizable byte at every cell of a.
        for i in 0..64u8 {
            unsafe { *((a.as_u64() + i as u64) as *mut u8) = i };
        }

        let src = region(a, raw, Dim3::new(1, 1, 1), Dim3::new(2, 2, 2));
        let dst = region(b, raw, Dim3::new(0, 2, 0), Dim3::new(2, 2, 2));
        let mut staged = vec![0u8; src.bytes()];
        unsafe {
            rt.pack(s, staged.as_mut_ptr(), &src).unwrap();
            rt.unpack(s, &dst, staged.as_ptr()).unwrap();
        }

        // Cell (x,y,z) of src = a[(1+x) + 4*((1+y) + 4*(1+z))].
        for z in 0..2i64 {
            for y in 0..2i64 {
                for x in 0..2i64 {
                    let want = ((1 + x) + 4 * ((1 + y) + 4 * (1 + z))) as u8;
                    let got = unsafe {
                        *(dst.ptr_at(Dim3::new(x, y, z)) as *const u8)
                    };
                    assert_eq!(got, want);
                }
            }
        }
        rt.free(0, a).unwrap();
        rt.free(0, b).unwrap();
    }

    #[test]
    fn test_copy_3d_matches_pack_unpack() {
        let rt = HostRuntime::new(1);
        let raw = Dim3::new(3, 3, 3);
        let a = rt.alloc(0, 27).unwrap();
        let b = rt.alloc(0, 27).unwrap();
        let s = rt.stream_create(0).unwrap();
        for i in 0..27u8 {
            unsafe { *((a.as_u64() + i as u64) as *mut u8) = 100 + i };
        }
        let src = region(a, raw, Dim3::new(0, 0, 0), Dim3::new(3, 1, 2));
        let dst = region(b, raw, Dim3::new(0, 2, 1), Dim3::new(3, 1, 2));
        unsafe { rt.copy_3d(s, &dst, &src).unwrap() };
        for z in 0..2i64 {
            for x in 0..3i64 {
                let want = unsafe { *(src.ptr_at(Dim3::new(x, 0, z)) as *const u8) };
                let got = unsafe { *(dst.ptr_at(Dim3::new(x, 0, z)) as *const u8) };
                assert_eq!(got, want);
            }
        }
        rt.free(0, a).unwrap();
        rt.free(0, b).unwrap();
    }

    #[test]
    fn test_ipc_is_identity() {
        let rt = HostRuntime::new(1);
        let p = rt.alloc(0, 16).unwrap();
        let h = rt.ipc_export(0, p).unwrap();
        let q = unsafe { rt.ipc_import(0, &h).unwrap() };
        assert_eq!(p, q);
        rt.free(0, p).unwrap();
    }

    #[test]
    fn test_streams_and_events_always_done() {
        let rt = HostRuntime::new(1);
        let s = rt.stream_create(0).unwrap();
        assert!(rt.stream_done(s).unwrap());
        rt.stream_sync(s).unwrap();
        let e = rt.event_create(0).unwrap();
        rt.event_record(e, s).unwrap();
        assert!(rt.event_query(e).unwrap());
        rt.stream_wait_event(s, e).unwrap();
        assert!(rt.stream_done(99).is_err());
    }
}
