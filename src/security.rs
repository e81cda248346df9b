//! Security descriptor (`sk`) record parsing and reference-count bookkeeping.
//!
//! `sk` records are shared between nodes that inherit the same permissions,
//! arranged in a doubly-linked circular list with a reference count. This
//! module keeps the descriptor payload itself opaque (interpreting it is an
//! explicit Non-goal) and only exposes the refcount/chain machinery the
//! writer needs to keep invariant 8 (`spec.md` §3) intact.

use crate::error::{RegistryError, Result};
use crate::utils::read_u32_le;

/// Minimum size of an `sk` record header (signature + reserved + prev/next + refcount + desc size).
pub const SK_HEADER_SIZE: usize = 20;

/// A parsed `sk` (security descriptor) record.
///
/// The `descriptor` bytes are never interpreted; they are carried verbatim.
#[derive(Debug, Clone)]
pub struct SecurityRecord {
    /// Cell offset of the previous `sk` record in the circular list.
    pub prev_offset: u32,
    /// Cell offset of the next `sk` record in the circular list.
    pub next_offset: u32,
    /// Number of `nk` records referencing this `sk`.
    pub ref_count: u32,
    /// Opaque security descriptor bytes.
    pub descriptor: Vec<u8>,
}

impl SecurityRecord {
    /// Parses an `sk` record from cell data (excluding the cell size field).
    ///
    /// # Arguments
    ///
    /// * `data` - the cell body, starting at the `sk` signature.
    /// * `offset` - absolute offset of the cell, used only for error context.
    ///
    /// # Errors
    ///
    /// Returns `TruncatedData` if `data` is shorter than the header or the
    /// declared descriptor, or `InvalidFormat` if the signature isn't `sk`.
    pub fn parse(data: &[u8], offset: u32) -> Result<Self> {
        if data.len() < SK_HEADER_SIZE {
            return Err(RegistryError::TruncatedData {
                offset,
                expected: SK_HEADER_SIZE,
                actual: data.len(),
            });
        }
        if &data[0..2] != b"sk" {
            return Err(RegistryError::InvalidFormat(format!(
                "Expected 'sk' signature at offset {:#x}",
                offset
            )));
        }

        // 0x02..0x04 reserved/padding, ignored.
        let prev_offset = read_u32_le(data, 0x04)?;
        let next_offset = read_u32_le(data, 0x08)?;
        let ref_count = read_u32_le(data, 0x0C)?;
        let desc_size = read_u32_le(data, 0x10)? as usize;

        let desc_end = SK_HEADER_SIZE + desc_size;
        if desc_end > data.len() {
            return Err(RegistryError::TruncatedData {
                offset,
                expected: desc_end,
                actual: data.len(),
            });
        }

        Ok(SecurityRecord {
            prev_offset,
            next_offset,
            ref_count,
            descriptor: data[SK_HEADER_SIZE..desc_end].to_vec(),
        })
    }

    /// Offset (from the start of cell data) of the `ref_count` field.
    pub const REF_COUNT_FIELD_OFFSET: usize = 0x0C;
    /// Offset (from the start of cell data) of the `sk_prev` field.
    pub const PREV_FIELD_OFFSET: usize = 0x04;
    /// Offset (from the start of cell data) of the `sk_next` field.
    pub const NEXT_FIELD_OFFSET: usize = 0x08;
}
