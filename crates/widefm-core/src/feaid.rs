//! Feature-ID utilities.
//!
//! A feature ID is a 64-bit unsigned integer naming one sparse column of the
//! training data. Two transforms operate on it:
//!
//! - [`reverse_bytes`] spreads raw IDs (which tend to cluster in the low
//!   bits) uniformly across the key space so that range sharding on the
//!   servers produces balanced load. The transform is its own inverse and
//!   must be applied consistently on ingest and, optionally, undone when
//!   dumping a model.
//! - [`encode_group`]/[`decode_group`] pack a small feature-group ID into
//!   the low bits of an ID, so that several raw feature namespaces can share
//!   one key space.

use crate::error::{CoreError, Result};

/// The 64-bit global identifier of a sparse feature column.
pub type FeaId = u64;

/// Reverses the nibble order of `x` so IDs span the key space uniformly.
///
/// This is an involution: `reverse_bytes(reverse_bytes(x)) == x`.
#[inline]
pub fn reverse_bytes(x: FeaId) -> FeaId {
    let x = x << 32 | x >> 32;
    let x = (x & 0x0000_FFFF_0000_FFFF) << 16 | (x & 0xFFFF_0000_FFFF_0000) >> 16;
    let x = (x & 0x00FF_00FF_00FF_00FF) << 8 | (x & 0xFF00_FF00_FF00_FF00) >> 8;
    (x & 0x0F0F_0F0F_0F0F_0F0F) << 4 | (x & 0xF0F0_F0F0_F0F0_F0F0) >> 4
}

/// Packs a feature-group ID into the low `nbits` bits of a feature ID.
///
/// # Errors
///
/// Returns [`CoreError::InvalidGroupId`] unless `gid < 1 << nbits`.
#[inline]
pub fn encode_group(x: FeaId, gid: u64, nbits: u32) -> Result<FeaId> {
    if gid >= 1 << nbits {
        return Err(CoreError::InvalidGroupId { gid, nbits });
    }
    Ok((x << nbits) | gid)
}

/// Extracts the feature-group ID from the low `nbits` bits of a feature ID.
#[inline]
pub fn decode_group(x: FeaId, nbits: u32) -> u64 {
    x % (1 << nbits)
}
