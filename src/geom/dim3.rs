use std::fmt;
use std::ops::{Add, AddAssign, Mul, Neg, Sub, SubAssign};

/// A signed integer triple naming a position, an extent, or an offset.
///
/// Direction vectors are `Dim3` values with components in `{-1, 0, 1}`.
/// The derived `Ord` is lexicographic (x, then y, then z), which gives
/// messages a total order by direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Dim3 {
    pub x: i64,
    pub y: i64,
    pub z: i64,
}

impl Dim3 {
    pub const ZERO: Self = Self { x: 0, y: 0, z: 0 };
    pub const ONE: Self = Self { x: 1, y: 1, z: 1 };

    pub const fn new(x: i64, y: i64, z: i64) -> Self {
        Self { x, y, z }
    }

    /// Component along `axis` (0 = x, 1 = y, 2 = z).
    pub fn get(&self, axis: usize) -> i64 {
        match axis {
            0 => self.x,
            1 => self.y,
            2 => self.z,
            _ => panic!("axis {axis} out of range"),
        }
    }

    pub fn set(&mut self, axis: usize, v: i64) {
        match axis {
            0 => self.x = v,
            1 => self.y = v,
            2 => self.z = v,
            _ => panic!("axis {axis} out of range"),
        }
    }

    /// Product of components.
    pub fn prod(&self) -> i64 {
        self.x * self.y * self.z
    }

    /// Component-wise minimum.
    pub fn min(&self, rhs: Dim3) -> Dim3 {
        Dim3::new(self.x.min(rhs.x), self.y.min(rhs.y), self.z.min(rhs.z))
    }

    /// Component-wise maximum.
    pub fn max(&self, rhs: Dim3) -> Dim3 {
        Dim3::new(self.x.max(rhs.x), self.y.max(rhs.y), self.z.max(rhs.z))
    }

    /// True when every component is `>= n`.
    pub fn all_ge(&self, n: i64) -> bool {
        self.x >= n && self.y >= n && self.z >= n
    }

    /// True when every component is strictly less than the matching
    /// component of `rhs`.
    pub fn all_lt(&self, rhs: Dim3) -> bool {
        self.x < rhs.x && self.y < rhs.y && self.z < rhs.z
    }

    /// The unique value congruent to `self` modulo `extent`, per component,
    /// in the half-open range `[0, extent)`. Periodic boundary helper.
    pub fn wrap(&self, extent: Dim3) -> Dim3 {
        assert!(extent.all_ge(1), "wrap extent must be positive: {extent}");
        fn m(v: i64, e: i64) -> i64 {
            ((v % e) + e) % e
        }
        Dim3::new(m(self.x, extent.x), m(self.y, extent.y), m(self.z, extent.z))
    }

    /// Component-wise division.
    pub fn div(&self, rhs: Dim3) -> Dim3 {
        Dim3::new(self.x / rhs.x, self.y / rhs.y, self.z / rhs.z)
    }

    /// Component-wise remainder.
    pub fn rem(&self, rhs: Dim3) -> Dim3 {
        Dim3::new(self.x % rhs.x, self.y % rhs.y, self.z % rhs.z)
    }
}

impl Add for Dim3 {
    type Output = Dim3;
    fn add(self, rhs: Dim3) -> Dim3 {
        Dim3::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl AddAssign for Dim3 {
    fn add_assign(&mut self, rhs: Dim3) {
        *self = *self + rhs;
    }
}

impl Sub for Dim3 {
    type Output = Dim3;
    fn sub(self, rhs: Dim3) -> Dim3 {
        Dim3::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl SubAssign for Dim3 {
    fn sub_assign(&mut self, rhs: Dim3) {
        *self = *self - rhs;
    }
}

/// Component-wise product.
impl Mul for Dim3 {
    type Output = Dim3;
    fn mul(self, rhs: Dim3) -> Dim3 {
        Dim3::new(self.x * rhs.x, self.y * rhs.y, self.z * rhs.z)
    }
}

impl Mul<i64> for Dim3 {
    type Output = Dim3;
    fn mul(self, rhs: i64) -> Dim3 {
        Dim3::new(self.x * rhs, self.y * rhs, self.z * rhs)
    }
}

impl Neg for Dim3 {
    type Output = Dim3;
    fn neg(self) -> Dim3 {
        Dim3::new(-self.x, -self.y, -self.z)
    }
}

impl From<(i64, i64, i64)> for Dim3 {
    fn from(t: (i64, i64, i64)) -> Self {
        Dim3::new(t.0, t.1, t.2)
    }
}

impl fmt::Display for Dim3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}
