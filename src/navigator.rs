//! Navigator: tree operations (parent/child, name and value lookup) over a
//! loaded hive image.
//!
//! Every function here takes the raw image bytes and a [`BlockMap`]
//! produced by [`crate::loader::load`], and resolves offsets exclusively
//! through [`BlockMap::is_valid_block`] — never by treating a stored offset
//! as a native pointer.

use crate::bigdata::BigDataBlock;
use crate::blockmap::BlockMap;
use crate::cell::CellType;
use crate::error::{RegistryError, Result};
use crate::key::KeyNode;
use crate::loader::Limits;
use crate::subkey_list::SubkeyList;
use crate::utils::{read_i32_le, read_u32_le};
use crate::value::ValueKey;
use tracing::warn;

/// Returns the cell body (everything after the 4-byte size field) for the
/// used block starting at absolute offset `offset`.
///
/// # Arguments
///
/// * `data` - the full hive image.
/// * `block_map` - the validity oracle produced by [`crate::loader::load`].
/// * `offset` - absolute offset of the cell's 4-byte size field.
///
/// # Errors
///
/// Returns `InvalidOffset` if `offset` isn't a used block per `block_map`,
/// or `TruncatedData` if the cell's declared length overruns `data`.
pub fn cell_body(data: &[u8], block_map: &BlockMap, offset: u32) -> Result<&[u8]> {
    if !block_map.is_valid_block(offset) {
        return Err(RegistryError::InvalidOffset {
            offset,
            hive_size: data.len(),
        });
    }
    let pos = offset as usize;
    let seg_len = read_i32_le(data, pos)?;
    if seg_len >= 0 {
        return Err(RegistryError::InvalidOffset {
            offset,
            hive_size: data.len(),
        });
    }
    let abs_len = seg_len.unsigned_abs() as usize;
    let end = pos + abs_len;
    if end > data.len() {
        return Err(RegistryError::TruncatedData {
            offset,
            expected: abs_len,
            actual: data.len() - pos,
        });
    }
    Ok(&data[pos + 4..end])
}

fn cell_type(body: &[u8], offset: u32) -> Result<CellType> {
    if body.len() < 2 {
        return Err(RegistryError::TruncatedData {
            offset,
            expected: 2,
            actual: body.len(),
        });
    }
    CellType::from_signature(&[body[0], body[1]])
}

/// Parses the `nk` record at `offset`, failing with `InvalidArgument` if the
/// block isn't a key node.
///
/// # Arguments
///
/// * `offset` - absolute offset of the candidate `nk` cell.
///
/// # Errors
///
/// Returns `InvalidOffset` if `offset` isn't a used block, or
/// `InvalidArgument` if the block's signature isn't `nk`.
pub fn node_at(data: &[u8], block_map: &BlockMap, offset: u32) -> Result<KeyNode> {
    let body = cell_body(data, block_map, offset)?;
    if cell_type(body, offset)? != CellType::KeyNode {
        return Err(RegistryError::InvalidArgument(format!(
            "block at {:#x} is not a key node",
            offset
        )));
    }
    KeyNode::parse(body, offset)
}

/// Validates the hive's root offset and returns it, or `NoKey` if it does
/// not reference a used `nk` block.
///
/// # Arguments
///
/// * `root_cell_offset` - the base block's relative root-cell offset.
///
/// # Errors
///
/// Returns `NoKey` if the offset doesn't resolve to a used `nk` block.
pub fn root(data: &[u8], block_map: &BlockMap, root_cell_offset: u32) -> Result<u32> {
    let abs = crate::utils::cell_offset_to_absolute(root_cell_offset)?;
    match node_at(data, block_map, abs) {
        Ok(_) => Ok(abs),
        Err(_) => Err(RegistryError::NoKey),
    }
}

/// Returns the key's name, decoded per its `COMP_NAME` flag.
///
/// # Errors
///
/// Propagates any error from [`node_at`].
pub fn node_name(data: &[u8], block_map: &BlockMap, offset: u32) -> Result<String> {
    Ok(node_at(data, block_map, offset)?.name)
}

/// Returns the absolute offset of `offset`'s parent, or `NoKey` if the
/// stored parent offset doesn't reference a used block (observed on some
/// real-world root keys that self-reference or store garbage).
///
/// # Errors
///
/// Returns `NoKey` if the parent offset doesn't resolve to a used block,
/// otherwise propagates errors from [`node_at`].
pub fn node_parent(data: &[u8], block_map: &BlockMap, offset: u32) -> Result<u32> {
    let node = node_at(data, block_map, offset)?;
    let abs = crate::utils::cell_offset_to_absolute(node.parent_offset)?;
    if !block_map.is_valid_block(abs) {
        return Err(RegistryError::NoKey);
    }
    Ok(abs)
}

fn leaf_entries(data: &[u8], block_map: &BlockMap, offset: u32) -> Result<Vec<u32>> {
    let body = cell_body(data, block_map, offset)?;
    let list = SubkeyList::parse(body, offset)?;
    match list {
        SubkeyList::IndexLeaf(offsets) => Ok(offsets
            .into_iter()
            .map(crate::utils::cell_offset_to_absolute)
            .collect::<Result<Vec<_>>>()?),
        SubkeyList::LeafWithHints(_, entries) => entries
            .into_iter()
            .map(|e| crate::utils::cell_offset_to_absolute(e.key_offset))
            .collect(),
        SubkeyList::IndexRoot(_) => Err(RegistryError::NotSupported(
            "nested index root".to_string(),
        )),
    }
}

/// Resolves the full, ordered list of child `nk` offsets for `offset`,
/// following `lf`/`lh` directly or `ri` indirection, and validating that the
/// total matches the parent's declared `subkey_count`.
///
/// # Arguments
///
/// * `offset` - absolute offset of the parent `nk`.
///
/// # Errors
///
/// Returns an error if any part of the subkey index is malformed, if an
/// entry's offset doesn't resolve to a used block, or if the resolved count
/// disagrees with the parent's declared `subkey_count`. This is an
/// all-or-nothing validation; callers that want a `skip_bad`-style per-entry
/// walk should use [`node_children_lenient`] instead.
pub fn node_children(data: &[u8], block_map: &BlockMap, offset: u32) -> Result<Vec<u32>> {
    let node = node_at(data, block_map, offset)?;
    if node.subkey_count == 0 {
        return Ok(Vec::new());
    }

    let list_abs = crate::utils::cell_offset_to_absolute(node.subkey_list_offset)?;
    let body = cell_body(data, block_map, list_abs)?;
    let list = SubkeyList::parse(body, list_abs)?;

    let children = match &list {
        SubkeyList::IndexRoot(sublists) => {
            let mut out = Vec::new();
            for &sublist_offset in sublists {
                let abs = crate::utils::cell_offset_to_absolute(sublist_offset)?;
                out.extend(leaf_entries(data, block_map, abs)?);
            }
            out
        }
        SubkeyList::IndexLeaf(offsets) => offsets
            .iter()
            .map(|&o| crate::utils::cell_offset_to_absolute(o))
            .collect::<Result<Vec<_>>>()?,
        SubkeyList::LeafWithHints(_, entries) => entries
            .iter()
            .map(|e| crate::utils::cell_offset_to_absolute(e.key_offset))
            .collect::<Result<Vec<_>>>()?,
    };

    if children.len() as u32 != node.subkey_count {
        return Err(RegistryError::NotSupported(format!(
            "subkey count mismatch at {:#x}: header says {}, index has {}",
            offset,
            node.subkey_count,
            children.len()
        )));
    }

    for &child in &children {
        if !block_map.is_valid_block(child) {
            return Err(RegistryError::InvalidOffset {
                offset: child,
                hive_size: data.len(),
            });
        }
    }

    Ok(children)
}

/// Lenient, per-entry variant of [`node_children`] for `skip_bad` visits.
///
/// Each subkey index entry is resolved independently: a malformed sublist,
/// leaf, or individual entry offset is logged and dropped rather than
/// failing the whole list, so a single bad sibling doesn't hide its valid
/// siblings from the caller.
///
/// # Arguments
///
/// * `node` - the already-parsed parent key node.
///
/// # Returns
///
/// The subset of children that resolved cleanly. Never fails; an entirely
/// malformed index yields an empty list.
pub fn node_children_lenient(data: &[u8], block_map: &BlockMap, node: &KeyNode) -> Vec<u32> {
    if node.subkey_count == 0 {
        return Vec::new();
    }

    let list_abs = match crate::utils::cell_offset_to_absolute(node.subkey_list_offset) {
        Ok(abs) => abs,
        Err(_) => {
            warn!(offset = node.subkey_list_offset, "skip_bad: subkey list offset does not resolve");
            return Vec::new();
        }
    };

    let list = match cell_body(data, block_map, list_abs).and_then(|body| SubkeyList::parse(body, list_abs)) {
        Ok(list) => list,
        Err(e) => {
            warn!(offset = list_abs, error = %e, "skip_bad: dropping malformed subkey index block");
            return Vec::new();
        }
    };

    match list {
        SubkeyList::IndexRoot(sublists) => sublists
            .into_iter()
            .flat_map(|sub_rel| match crate::utils::cell_offset_to_absolute(sub_rel) {
                Ok(sub_abs) => leaf_entries_lenient(data, block_map, sub_abs),
                Err(_) => {
                    warn!(offset = sub_rel, "skip_bad: dropping invalid ri slot");
                    Vec::new()
                }
            })
            .collect(),
        SubkeyList::IndexLeaf(_) | SubkeyList::LeafWithHints(..) => {
            leaf_entries_lenient(data, block_map, list_abs)
        }
    }
}

/// Resolves one `lf`/`lh`/`li` leaf's entries, dropping (and logging) any
/// entry whose offset doesn't resolve to a valid used block. Used only by
/// [`node_children_lenient`].
fn leaf_entries_lenient(data: &[u8], block_map: &BlockMap, offset: u32) -> Vec<u32> {
    let parsed = cell_body(data, block_map, offset).and_then(|body| SubkeyList::parse(body, offset));
    let raw_offsets: Vec<u32> = match parsed {
        Ok(SubkeyList::IndexLeaf(offsets)) => offsets,
        Ok(SubkeyList::LeafWithHints(_, entries)) => entries.into_iter().map(|e| e.key_offset).collect(),
        Ok(SubkeyList::IndexRoot(_)) => {
            warn!(offset, "skip_bad: nested index root in subkey index");
            return Vec::new();
        }
        Err(e) => {
            warn!(offset, error = %e, "skip_bad: dropping malformed subkey leaf");
            return Vec::new();
        }
    };

    raw_offsets
        .into_iter()
        .filter_map(|rel| crate::utils::cell_offset_to_absolute(rel).ok())
        .filter(|&abs| {
            let ok = block_map.is_valid_block(abs);
            if !ok {
                warn!(offset = abs, "skip_bad: dropping invalid subkey entry");
            }
            ok
        })
        .collect()
}

/// Case-insensitive linear scan over `offset`'s children for `name`.
///
/// # Errors
///
/// Propagates any error from [`node_children`] or [`node_name`].
pub fn node_get_child(
    data: &[u8],
    block_map: &BlockMap,
    offset: u32,
    name: &str,
) -> Result<Option<u32>> {
    for child in node_children(data, block_map, offset)? {
        let child_name = node_name(data, block_map, child)?;
        if child_name.eq_ignore_ascii_case(name) {
            return Ok(Some(child));
        }
    }
    Ok(None)
}

/// Resolves the value-list for `offset` into an ordered list of `vk` offsets.
///
/// # Errors
///
/// Returns an error if the value-list block is missing, too small for the
/// declared `value_count`, or contains an entry that doesn't resolve to a
/// used block.
pub fn node_values(data: &[u8], block_map: &BlockMap, offset: u32) -> Result<Vec<u32>> {
    let node = node_at(data, block_map, offset)?;
    if node.value_count == 0 {
        return Ok(Vec::new());
    }

    let list_abs = crate::utils::cell_offset_to_absolute(node.value_list_offset)?;
    if !block_map.is_valid_block(list_abs) {
        return Err(RegistryError::InvalidOffset {
            offset: list_abs,
            hive_size: data.len(),
        });
    }
    let pos = list_abs as usize;
    let seg_len = read_i32_le(data, pos)?;
    if seg_len >= 0 {
        return Err(RegistryError::InvalidOffset {
            offset: list_abs,
            hive_size: data.len(),
        });
    }
    let abs_len = seg_len.unsigned_abs() as usize;
    let required = 4 + 4 * node.value_count as usize;
    if abs_len < required {
        return Err(RegistryError::NotSupported(format!(
            "value-list at {:#x} too small for {} values",
            list_abs, node.value_count
        )));
    }

    let body = &data[pos + 4..pos + abs_len];
    let mut offsets = Vec::with_capacity(node.value_count as usize);
    for i in 0..node.value_count as usize {
        let rel = crate::utils::read_u32_le(body, i * 4)?;
        let abs = crate::utils::cell_offset_to_absolute(rel)?;
        if !block_map.is_valid_block(abs) {
            return Err(RegistryError::InvalidOffset {
                offset: abs,
                hive_size: data.len(),
            });
        }
        offsets.push(abs);
    }
    Ok(offsets)
}

/// Case-insensitive lookup of a value by name under `offset`.
///
/// # Errors
///
/// Propagates any error from [`node_values`] or [`ValueKey::parse`].
pub fn node_get_value(
    data: &[u8],
    block_map: &BlockMap,
    offset: u32,
    name: &str,
) -> Result<Option<u32>> {
    for vk_offset in node_values(data, block_map, offset)? {
        let body = cell_body(data, block_map, vk_offset)?;
        let vk = ValueKey::parse(body, vk_offset)?;
        if vk.name.eq_ignore_ascii_case(name) {
            return Ok(Some(vk_offset));
        }
    }
    Ok(None)
}

/// Parses the `vk` record at `offset`.
///
/// # Errors
///
/// Returns `InvalidOffset` if `offset` isn't a used block, or
/// `InvalidArgument` if the block's signature isn't `vk`.
pub fn value_at(data: &[u8], block_map: &BlockMap, offset: u32) -> Result<ValueKey> {
    let body = cell_body(data, block_map, offset)?;
    if cell_type(body, offset)? != CellType::ValueKey {
        return Err(RegistryError::InvalidArgument(format!(
            "block at {:#x} is not a value key",
            offset
        )));
    }
    ValueKey::parse(body, offset)
}

/// Resolves a `vk`'s raw data bytes: inline data lives in the `data_offset`
/// field itself; out-of-line data is a separate block, truncated (with a
/// warning logged) if its declared length overruns the block, and capped at
/// `limits.max_value_data_len`.
///
/// # Arguments
///
/// * `vk` - the already-parsed value key.
/// * `limits` - bounds the returned buffer's size.
///
/// # Errors
///
/// Returns `OutOfRange` if the declared length exceeds
/// `limits.max_value_data_len`, or propagates errors resolving the
/// out-of-line data block.
pub fn value_raw(data: &[u8], block_map: &BlockMap, vk: &ValueKey, limits: &Limits) -> Result<Vec<u8>> {
    if vk.data_length as usize > limits.max_value_data_len {
        return Err(RegistryError::OutOfRange {
            what: "value data length".to_string(),
            value: vk.data_length as usize,
            limit: limits.max_value_data_len,
        });
    }

    if vk.is_inline_data() {
        return Ok(vk.inline_data());
    }
    if vk.data_length == 0 {
        return Ok(Vec::new());
    }

    let abs = crate::utils::cell_offset_to_absolute(vk.data_offset)?;
    let body = cell_body(data, block_map, abs)?;
    let declared = vk.data_length as usize;

    if body.len() >= 2 && &body[0..2] == b"db" {
        return read_big_data(data, block_map, abs, declared, limits);
    }

    if declared > body.len() {
        tracing::warn!(
            offset = abs,
            declared,
            available = body.len(),
            "value data length exceeds containing block; truncating"
        );
        Ok(body.to_vec())
    } else {
        Ok(body[..declared].to_vec())
    }
}

/// Reassembles a value stored as a `db` big-data chain: a header naming a
/// segment count and a segment-offset list, followed by the segments
/// themselves, each an independently-allocated block.
fn read_big_data(
    data: &[u8],
    block_map: &BlockMap,
    offset: u32,
    expected_length: usize,
    limits: &Limits,
) -> Result<Vec<u8>> {
    let body = cell_body(data, block_map, offset)?;
    let header = BigDataBlock::parse(body, offset)?;

    let list_abs = crate::utils::cell_offset_to_absolute(header.segment_list_offset)?;
    let list_body = cell_body(data, block_map, list_abs)?;
    let required = header.segment_count as usize * 4;
    if list_body.len() < required {
        return Err(RegistryError::TruncatedData {
            offset: list_abs,
            expected: required,
            actual: list_body.len(),
        });
    }

    let cap = expected_length.min(limits.max_value_data_len);
    let mut out = Vec::with_capacity(cap);
    for i in 0..header.segment_count as usize {
        let rel = read_u32_le(list_body, i * 4)? & 0x7FFF_FFFF;
        let seg_abs = crate::utils::cell_offset_to_absolute(rel)?;
        let seg_body = cell_body(data, block_map, seg_abs)?;
        out.extend_from_slice(seg_body);
        if out.len() >= cap {
            break;
        }
    }

    if out.len() < expected_length {
        warn!(
            offset,
            expected_length,
            available = out.len(),
            "big data segments fall short of declared length; truncating"
        );
    }
    out.truncate(cap);
    Ok(out)
}
