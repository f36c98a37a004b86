use crate::geom::{Dim3, DirectionMap};

/// Per-direction stencil reach.
///
/// Records how deep the halo extends in each of the 26 directions. The
/// center entry is always 0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Radius {
    rads: DirectionMap<usize>,
}

impl Radius {
    /// Radius `r` in all 26 directions, 0 at the center.
    pub fn constant(r: usize) -> Self {
        let mut result = Radius::default();
        for z in -1..=1 {
            for y in -1..=1 {
                for x in -1..=1 {
                    *result.rads.at_dir_mut(x, y, z) = r;
                }
            }
        }
        *result.rads.at_dir_mut(0, 0, 0) = 0;
        result
    }

    /// Separate radii for face, edge, and corner directions, 0 at the center.
    pub fn face_edge_corner(face: usize, edge: usize, corner: usize) -> Self {
        let mut result = Radius::default();
        result.set_face(face);
        result.set_edge(edge);
        result.set_corner(corner);
        *result.rads.at_dir_mut(0, 0, 0) = 0;
        result
    }

    pub fn dir(&self, x: i64, y: i64, z: i64) -> usize {
        *self.rads.at_dir(x, y, z)
    }

    pub fn at_vec(&self, d: Dim3) -> usize {
        *self.rads.at_vec(d)
    }

    pub fn x(&self, d: i64) -> usize {
        self.dir(d, 0, 0)
    }

    pub fn y(&self, d: i64) -> usize {
        self.dir(0, d, 0)
    }

    pub fn z(&self, d: i64) -> usize {
        self.dir(0, 0, d)
    }

    /// Set the six axis-aligned unit directions.
    pub fn set_face(&mut self, r: usize) {
        for z in -1..=1i64 {
            for y in -1..=1i64 {
                for x in -1..=1i64 {
                    if x.abs() + y.abs() + z.abs() == 1 {
                        *self.rads.at_dir_mut(x, y, z) = r;
                    }
                }
            }
        }
    }

    /// Set the twelve directions with exactly two nonzero components.
    pub fn set_edge(&mut self, r: usize) {
        for z in -1..=1i64 {
            for y in -1..=1i64 {
                for x in -1..=1i64 {
                    if x.abs() + y.abs() + z.abs() == 2 {
                        *self.rads.at_dir_mut(x, y, z) = r;
                    }
                }
            }
        }
    }

    /// Set the eight directions with three nonzero components.
    pub fn set_corner(&mut self, r: usize) {
        for z in [-1, 1i64] {
            for y in [-1, 1i64] {
                for x in [-1, 1i64] {
                    *self.rads.at_dir_mut(x, y, z) = r;
                }
            }
        }
    }
}
