//! Loader: a single forward pass over a hive image that builds a [`BlockMap`]
//! of every validated used block.
//!
//! Every offset the rest of the engine trusts (a `parent_offset`, a
//! `subkey_list_offset`, an entry in an `lf`/`lh`/`li`/`ri` list) is checked
//! against this map via [`BlockMap::is_valid_block`] before it's dereferenced.
//! The loader itself never interprets cell contents beyond the 2-byte type
//! signature and size framing needed to walk the page/cell structure.

use crate::blockmap::BlockMap;
use crate::error::{RegistryError, Result};
use crate::hbin::{HbinHeader, HBIN_HEADER_SIZE};
use crate::header::{BaseBlock, BASE_BLOCK_SIZE};
use crate::utils::read_i32_le;
use tracing::debug;

/// Caps that bound work during traversal and mutation, preventing a
/// malformed or hostile hive from driving unbounded memory/time use.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    /// Maximum subkeys accepted under a single key.
    pub max_subkeys: usize,
    /// Maximum values accepted under a single key.
    pub max_values: usize,
    /// Maximum length, in bytes, of a single value's data.
    pub max_value_data_len: usize,
    /// Maximum total bytes the writer will allocate for one `add_child`/`set_values` call.
    pub max_allocation: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            max_subkeys: 10_000,
            max_values: 1_000,
            max_value_data_len: 1_000_000,
            max_allocation: 1_000_000,
        }
    }
}

/// Options controlling how a hive is opened.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenFlags {
    /// Open for mutation. Without this, `add_child`/`delete_child`/`set_values`/`commit` fail with `ReadOnly`.
    pub write: bool,
    /// Force verbose diagnostic logging regardless of `WINREG_HIVE_VERBOSE`.
    pub verbose: bool,
    /// Extra-verbose internal diagnostics (e.g. per-cell trace logging), distinct from `verbose`.
    pub debug: bool,
}

/// Result of a successful load pass: the validated base block and a
/// [`BlockMap`] covering every used cell reachable by a plain forward walk
/// of the hbin pages (not a graph walk from the root — that's `navigator`'s
/// job, layered on top of this).
#[derive(Debug)]
pub struct LoadResult {
    /// The parsed, checksum-verified base block.
    pub base_block: BaseBlock,
    /// Bitmap of every used block the forward pass found.
    pub block_map: BlockMap,
    /// Absolute offset one past the last byte of the last hbin page.
    pub end_of_pages: u32,
}

/// Walks every hbin page in `data` front-to-back, validating page framing
/// and cell framing, and sets a bit in the returned [`BlockMap`] for each
/// used cell's start offset.
///
/// This never follows a pointer (`parent_offset`, list entries, etc.) — it
/// only trusts the page-by-page, cell-by-cell forward structure, which is
/// exactly what makes the resulting map trustworthy as a validity oracle
/// for pointers found later.
///
/// # Arguments
///
/// * `data` - the full hive image, header included.
///
/// # Errors
///
/// Returns an error if the header is invalid, if the header's declared
/// `hive_length` (`end_of_pages = hive_length + 0x1000`, spec.md §4.1)
/// doesn't land on a page boundary or overruns the file, if any page or
/// cell fails its own framing checks, or if bytes remain past the declared
/// end-of-pages offset ("trailing garbage ... is unsupported", spec.md
/// §4.1).
pub fn load(data: &[u8]) -> Result<LoadResult> {
    let base_block = BaseBlock::parse(data)?;

    let end_of_pages = (base_block.hive_length as usize)
        .checked_add(BASE_BLOCK_SIZE)
        .filter(|&end| end >= BASE_BLOCK_SIZE && end % BASE_BLOCK_SIZE == 0)
        .ok_or_else(|| {
            RegistryError::NotSupported(format!(
                "header declares a non-page-aligned end-of-pages offset (hive_length {:#x})",
                base_block.hive_length
            ))
        })?;
    if end_of_pages > data.len() {
        return Err(RegistryError::TruncatedData {
            offset: BASE_BLOCK_SIZE as u32,
            expected: end_of_pages,
            actual: data.len(),
        });
    }

    let mut block_map = BlockMap::new(data.len());
    let mut page_offset = BASE_BLOCK_SIZE;

    while page_offset < end_of_pages {
        let remaining = end_of_pages - page_offset;
        if remaining < HBIN_HEADER_SIZE {
            return Err(RegistryError::InvalidFormat(format!(
                "hbin at {:#x} truncated before declared end-of-pages offset {:#x}",
                page_offset, end_of_pages
            )));
        }

        let rel_offset = (page_offset - BASE_BLOCK_SIZE) as u32;
        let header = HbinHeader::parse(&data[page_offset..], rel_offset)?;

        if header.size == 0 || header.size as usize % BASE_BLOCK_SIZE != 0 {
            return Err(RegistryError::InvalidFormat(format!(
                "hbin at {:#x} has non-page-aligned size {:#x}",
                page_offset, header.size
            )));
        }

        let page_end = page_offset + header.size as usize;
        if page_end > end_of_pages {
            return Err(RegistryError::TruncatedData {
                offset: rel_offset,
                expected: header.size as usize,
                actual: end_of_pages - page_offset,
            });
        }

        walk_cells(data, page_offset + HBIN_HEADER_SIZE, page_end, &mut block_map)?;
        debug!(page_offset, size = header.size, "walked hbin page");

        page_offset = page_end;
    }

    if data.len() > end_of_pages {
        return Err(RegistryError::InvalidFormat(format!(
            "{} byte(s) of trailing data past the declared end-of-pages offset {:#x}",
            data.len() - end_of_pages,
            end_of_pages
        )));
    }

    Ok(LoadResult {
        base_block,
        block_map,
        end_of_pages: end_of_pages as u32,
    })
}

/// Walks cells within a single hbin's data area `[start, end)`, requiring
/// forward progress on every step (invariant 3 from the core's cell-framing
/// rules: `seg_len` is a non-zero multiple of 4) and that the final cell's
/// free-space framing lands exactly on the page boundary.
fn walk_cells(data: &[u8], start: usize, end: usize, block_map: &mut BlockMap) -> Result<()> {
    let mut offset = start;

    while offset < end {
        if offset + 4 > end {
            return Err(RegistryError::TruncatedData {
                offset: offset as u32,
                expected: 4,
                actual: end - offset,
            });
        }

        let seg_len = read_i32_le(data, offset)?;
        if seg_len == 0 || seg_len.unsigned_abs() % 4 != 0 {
            return Err(RegistryError::invalid_cell_size(seg_len, offset as u32));
        }

        let abs_len = seg_len.unsigned_abs() as usize;
        if abs_len <= 4 || offset + abs_len > end {
            return Err(RegistryError::invalid_cell_size(seg_len, offset as u32));
        }

        if seg_len < 0 {
            block_map.set(offset as u32);
        }

        offset += abs_len;
    }

    if offset != end {
        return Err(RegistryError::InvalidFormat(format!(
            "cell walk overran page end: stopped at {:#x}, page ends at {:#x}",
            offset, end
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loads_minimal_hive_and_marks_root_used() {
        let data = crate::testutil::minimal_hive("ROOT");
        let result = load(&data).unwrap();
        assert!(result.block_map.is_valid_block(0x1020));
        assert_eq!(result.end_of_pages, data.len() as u32);
    }

    #[test]
    fn test_rejects_non_page_aligned_hbin_size() {
        let mut data = crate::testutil::minimal_hive("ROOT");
        // Corrupt the hbin size field to something not a multiple of 0x1000.
        data[0x1008..0x100C].copy_from_slice(&0x1234u32.to_le_bytes());
        assert!(load(&data).is_err());
    }

    #[test]
    fn test_rejects_zero_seg_len() {
        let mut data = crate::testutil::minimal_hive("ROOT");
        data[0x1020..0x1024].copy_from_slice(&0u32.to_le_bytes());
        assert!(load(&data).is_err());
    }
}
