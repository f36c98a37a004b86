//! Geometry primitives: integer triples, per-direction tables, stencil radii.

mod dim3;
mod dirmap;
mod radius;

pub use dim3::Dim3;
pub use dirmap::DirectionMap;
pub use radius::Radius;
