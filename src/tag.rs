//! Tag construction for the shared cross-host message channel.
//!
//! Tags must be non-negative, so the sign bit is never set, leaving 31 bits.
//! Three forms share the channel:
//!
//! - [`tag_kind`]: kind in bits 29-30, direction in bits 23-28, payload in
//!   bits 0-22. Used for shared-host control traffic.
//! - [`tag_dev_field_dir`]: field index in bits 0-15, device slot in bits
//!   16-23, direction in bits 24-29. Used for cross-host halo payloads.
//! - [`tag_dev_dir`]: device slot in bits 0-7, direction in bits 8-13.
//!
//! Each direction component is 2 bits: 0 -> 0b00, +1 -> 0b01, -1 -> 0b10.
//! Distinct in-range tuples yield distinct tags within each form;
//! out-of-range input is a programming error and panics.

use crate::geom::Dim3;
use crate::types::Tag;

/// Discriminates control flows multiplexed over the shared channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum MsgKind {
    /// Shared-host completion token.
    ColocatedEvt = 0,
    /// Shared-host staging-memory handle exchange.
    ColocatedMem = 1,
    /// Shared-host size agreement during prepare.
    ColocatedDev = 2,
    /// Cross-host halo payload.
    Other = 3,
}

fn dir_bits(dir: Dim3) -> i32 {
    fn enc(c: i64) -> i32 {
        match c {
            0 => 0b00,
            1 => 0b01,
            -1 => 0b10,
            _ => panic!("direction component {c} out of range"),
        }
    }
    enc(dir.x) | (enc(dir.y) << 2) | (enc(dir.z) << 4)
}

/// Tag for a `kind` of message with a small payload and a direction.
pub fn tag_kind(kind: MsgKind, payload: u32, dir: Dim3) -> Tag {
    assert!(payload < (1 << 21), "payload {payload} too wide for tag");
    let mut t: i32 = 0;
    t |= (kind as i32) << 29;
    t |= dir_bits(dir) << 23;
    t |= payload as i32;
    assert!(t >= 0, "tag must be non-negative");
    t
}

/// Tag from a device slot, a data field index, and a direction.
pub fn tag_dev_field_dir(slot: usize, field: usize, dir: Dim3) -> Tag {
    const IDX_BITS: usize = 16;
    const GPU_BITS: usize = 8;
    assert!(slot < (1 << GPU_BITS), "device slot {slot} too wide for tag");
    assert!(field < (1 << IDX_BITS), "field index {field} too wide for tag");

    let mut t: i32 = 0;
    t |= field as i32;
    t |= (slot as i32) << IDX_BITS;
    t |= dir_bits(dir) << (IDX_BITS + GPU_BITS);
    assert!(t >= 0, "tag must be non-negative");
    t
}

/// Tag from a device slot and a direction.
pub fn tag_dev_dir(slot: usize, dir: Dim3) -> Tag {
    const GPU_BITS: usize = 8;
    assert!(slot < (1 << GPU_BITS), "device slot {slot} too wide for tag");

    let mut t: i32 = 0;
    t |= slot as i32;
    t |= dir_bits(dir) << GPU_BITS;
    assert!(t >= 0, "tag must be non-negative");
    t
}
