//! One process's view of one sub-domain, bound to one physical device.

use std::sync::Arc;

use tracing::warn;

use crate::error::{HaloError, Result};
use crate::geom::{Dim3, Radius};
use crate::runtime::{DevicePtr, DeviceRuntime, Region};

/// Owns the payload memory backing one sub-domain on one device: the
/// interior extent, the stencil radius, and one allocation per registered
/// data field, padded by the halo depth on every side.
pub struct LocalDomain {
    size: Dim3,
    radius: Radius,
    dev: usize,
    elem_sizes: Vec<usize>,
    currs: Vec<DevicePtr>,
    pad_lo: Dim3,
    pad_hi: Dim3,
    runtime: Arc<dyn DeviceRuntime>,
}

impl LocalDomain {
    pub fn new(size: Dim3, dev: usize, runtime: Arc<dyn DeviceRuntime>) -> Self {
        assert!(size.all_ge(1), "domain extent must be positive: {size}");
        Self {
            size,
            radius: Radius::default(),
            dev,
            elem_sizes: Vec::new(),
            currs: Vec::new(),
            pad_lo: Dim3::ZERO,
            pad_hi: Dim3::ZERO,
            runtime,
        }
    }

    pub fn set_radius(&mut self, radius: Radius) {
        self.radius = radius;
    }

    /// Register a data field of `elem_size` bytes per cell. The returned
    /// handle is the insertion index.
    pub fn add_data(&mut self, elem_size: usize) -> usize {
        assert!(elem_size > 0, "element size must be positive");
        self.elem_sizes.push(elem_size);
        self.elem_sizes.len() - 1
    }

    /// Allocate every registered field in plain device memory.
    pub fn realize(&mut self) -> Result<()> {
        self.realize_with(false)
    }

    /// Allocate every registered field in unified memory.
    pub fn realize_unified(&mut self) -> Result<()> {
        self.realize_with(true)
    }

    fn realize_with(&mut self, unified: bool) -> Result<()> {
        if !self.currs.is_empty() {
            return Err(HaloError::AlreadyRealized);
        }

        // Pad each side of each axis by the deepest halo reaching through it.
        let mut pad_lo = Dim3::ZERO;
        let mut pad_hi = Dim3::ZERO;
        for z in -1..=1i64 {
            for y in -1..=1i64 {
                for x in -1..=1i64 {
                    let r = self.radius.dir(x, y, z) as i64;
                    let d = Dim3::new(x, y, z);
                    for a in 0..3 {
                        if d.get(a) < 0 {
                            pad_lo.set(a, pad_lo.get(a).max(r));
                        } else if d.get(a) > 0 {
                            pad_hi.set(a, pad_hi.get(a).max(r));
                        }
                    }
                }
            }
        }
        self.pad_lo = pad_lo;
        self.pad_hi = pad_hi;

        let raw = self.raw_size();
        for &elem_size in &self.elem_sizes {
            let bytes = raw.prod() as usize * elem_size;
            let ptr = if unified {
                self.runtime.alloc_unified(self.dev, bytes)?
            } else {
                self.runtime.alloc(self.dev, bytes)?
            };
            self.currs.push(ptr);
        }
        Ok(())
    }

    /// Interior extent.
    pub fn size(&self) -> Dim3 {
        self.size
    }

    /// Allocated extent, interior plus halo padding.
    pub fn raw_size(&self) -> Dim3 {
        self.size + self.pad_lo + self.pad_hi
    }

    pub fn radius(&self) -> &Radius {
        &self.radius
    }

    /// Physical device id this domain's memory lives on.
    pub fn gpu(&self) -> usize {
        self.dev
    }

    /// Offset of the first interior cell within the allocation.
    pub fn interior_origin(&self) -> Dim3 {
        self.pad_lo
    }

    pub fn num_data(&self) -> usize {
        self.elem_sizes.len()
    }

    pub fn elem_size(&self, handle: usize) -> Result<usize> {
        self.elem_sizes
            .get(handle)
            .copied()
            .ok_or(HaloError::InvalidHandle {
                handle,
                count: self.elem_sizes.len(),
            })
    }

    /// Raw pointer to the field's allocation.
    pub fn curr(&self, handle: usize) -> Result<DevicePtr> {
        self.currs
            .get(handle)
            .copied()
            .ok_or(HaloError::InvalidHandle {
                handle,
                count: self.currs.len(),
            })
    }

    /// The interior slab adjacent to the `dir` face(s), `radius.dir(dir)`
    /// deep. This is what a message travelling in direction `dir` sends.
    pub fn interior_region(&self, handle: usize, dir: Dim3) -> Region {
        self.shape().interior_region(handle, dir)
    }

    /// The ghost slab beyond the `dir` face(s), `radius.dir(dir)` deep.
    /// A message travelling in direction `d` lands in `ghost_region(-d)`.
    pub fn ghost_region(&self, handle: usize, dir: Dim3) -> Region {
        self.shape().ghost_region(handle, dir)
    }

    /// A by-value copy of this domain's geometry and field pointers.
    ///
    /// Transports capture shapes at prepare time so they never hold a
    /// reference into the engine's domain list. Requires `realize()`.
    pub fn shape(&self) -> DomainShape {
        assert!(
            !self.currs.is_empty() || self.elem_sizes.is_empty(),
            "shape of an unrealized domain"
        );
        DomainShape {
            currs: self.currs.clone(),
            elem_sizes: self.elem_sizes.clone(),
            size: self.size,
            pad_lo: self.pad_lo,
            raw: self.raw_size(),
            radius: self.radius,
            dev: self.dev,
        }
    }
}

/// Geometry and field pointers of a realized domain, detached from the
/// allocation owner.
#[derive(Debug, Clone)]
pub struct DomainShape {
    currs: Vec<DevicePtr>,
    elem_sizes: Vec<usize>,
    size: Dim3,
    pad_lo: Dim3,
    raw: Dim3,
    radius: Radius,
    dev: usize,
}

impl DomainShape {
    pub fn num_data(&self) -> usize {
        self.elem_sizes.len()
    }

    pub fn gpu(&self) -> usize {
        self.dev
    }

    fn slab(&self, handle: usize, dir: Dim3, ghost: bool) -> Region {
        assert!(handle < self.currs.len(), "field {handle} not realized");
        let r = self.radius.at_vec(dir) as i64;
        let mut origin = self.pad_lo;
        let mut extent = self.size;
        for a in 0..3 {
            match dir.get(a) {
                0 => {}
                d if d > 0 => {
                    let base = self.pad_lo.get(a) + self.size.get(a);
                    origin.set(a, if ghost { base } else { base - r });
                    extent.set(a, r);
                }
                _ => {
                    if ghost {
                        origin.set(a, self.pad_lo.get(a) - r);
                    }
                    extent.set(a, r);
                }
            }
        }
        Region {
            base: self.currs[handle],
            raw: self.raw,
            origin,
            extent,
            elem_size: self.elem_sizes[handle],
        }
    }

    /// See [`LocalDomain::interior_region`].
    pub fn interior_region(&self, handle: usize, dir: Dim3) -> Region {
        self.slab(handle, dir, false)
    }

    /// See [`LocalDomain::ghost_region`].
    pub fn ghost_region(&self, handle: usize, dir: Dim3) -> Region {
        self.slab(handle, dir, true)
    }
}

impl Drop for LocalDomain {
    fn drop(&mut self) {
        for ptr in self.currs.drain(..) {
            if let Err(e) = self.runtime.free(self.dev, ptr) {
                warn!(device = self.dev, %ptr, error = %e, "leaked domain allocation");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::HostRuntime;

    fn realized(size: Dim3, r: usize) -> LocalDomain {
        let rt = Arc::new(HostRuntime::new(1));
        let mut d = LocalDomain::new(size, 0, rt);
        d.set_radius(Radius::constant(r));
        d.add_data(8);
        d.add_data(4);
        d.realize().unwrap();
        d
    }

    #[test]
    fn test_raw_size_padding() {
        let d = realized(Dim3::new(4, 5, 6), 2);
        assert_eq!(d.raw_size(), Dim3::new(8, 9, 10));
        assert_eq!(d.interior_origin(), Dim3::new(2, 2, 2));
        assert_eq!(d.num_data(), 2);
        assert_eq!(d.elem_size(0).unwrap(), 8);
        assert_eq!(d.elem_size(1).unwrap(), 4);
    }

    #[test]
    fn test_double_realize_is_error() {
        let rt = Arc::new(HostRuntime::new(1));
        let mut d = LocalDomain::new(Dim3::new(2, 2, 2), 0, rt);
        d.add_data(1);
        d.realize().unwrap();
        assert!(matches!(d.realize(), Err(HaloError::AlreadyRealized)));
    }

    #[test]
    fn test_invalid_handle() {
        let d = realized(Dim3::new(2, 2, 2), 1);
        assert!(d.curr(0).is_ok());
        assert!(matches!(
            d.curr(9),
            Err(HaloError::InvalidHandle { handle: 9, .. })
        ));
    }

    #[test]
    fn test_face_regions() {
        let d = realized(Dim3::new(4, 5, 6), 1);
        // +x interior slab: last interior plane.
        let send = d.interior_region(0, Dim3::new(1, 0, 0));
        assert_eq!(send.extent, Dim3::new(1, 5, 6));
        assert_eq!(send.origin, Dim3::new(4, 1, 1));
        // +x ghost slab: just past the interior.
        let ghost = d.ghost_region(0, Dim3::new(1, 0, 0));
        assert_eq!(ghost.extent, Dim3::new(1, 5, 6));
        assert_eq!(ghost.origin, Dim3::new(5, 1, 1));
        // -x ghost slab: inside the pad.
        let ghost = d.ghost_region(0, Dim3::new(-1, 0, 0));
        assert_eq!(ghost.origin, Dim3::new(0, 1, 1));
    }

    #[test]
    fn test_corner_regions() {
        let d = realized(Dim3::new(4, 4, 4), 1);
        let dir = Dim3::new(1, -1, 1);
        let send = d.interior_region(0, dir);
        assert_eq!(send.extent, Dim3::new(1, 1, 1));
        assert_eq!(send.origin, Dim3::new(4, 1, 4));
        let ghost = d.ghost_region(0, dir);
        assert_eq!(ghost.origin, Dim3::new(5, 0, 5));
    }

    #[test]
    fn test_send_and_ghost_bytes_match_across_fields() {
        let d = realized(Dim3::new(3, 4, 5), 2);
        for z in -1..=1i64 {
            for y in -1..=1i64 {
                for x in -1..=1i64 {
                    if (x, y, z) == (0, 0, 0) {
                        continue;
                    }
                    let dir = Dim3::new(x, y, z);
                    for h in 0..d.num_data() {
                        assert_eq!(
                            d.interior_region(h, dir).bytes(),
                            d.ghost_region(h, -dir).bytes()
                        );
                    }
                }
            }
        }
    }
}
