//! Writer: block allocator, subkey insertion/removal, value-list rewrite,
//! recursive delete, and commit.
//!
//! The allocator never reuses a freed block; it only bumps a high-water
//! mark and, when the current page can't fit the next allocation, grows the
//! file with a fresh `hbin` page. This keeps every offset assigned during a
//! session monotone, at the cost of never reclaiming space freed by
//! `delete_child`/`set_values` within that same session.

use crate::blockmap::BlockMap;
use crate::error::{RegistryError, Result};
use crate::hbin::{HbinHeader, HBIN_HEADER_SIZE};
use crate::header::{BaseBlock, BASE_BLOCK_SIZE};
use crate::key::{self, KeyNode};
use crate::loader::Limits;
use crate::navigator;
use crate::security::SecurityRecord;
use crate::subkey_list::{SubkeyList, SubkeyListEntry, SubkeyListType};
use crate::utils::{
    absolute_to_cell_offset, cell_offset_to_absolute, read_i32_le, read_u32_le, write_i32_le,
    write_u32_le,
};
use crate::value::ValueKey;
use std::path::Path;
use tracing::{debug, info};

const PAGE_SIZE: usize = 0x1000;

/// A value to be written by [`set_values`], by name and typed payload.
#[derive(Debug, Clone)]
pub struct NewValue {
    pub name: String,
    pub data: crate::value::ValueData,
}

/// Persistent allocator cursor: where the next block goes, and where the
/// last hbin page ends.
#[derive(Debug, Clone, Copy)]
pub struct AllocatorState {
    /// Absolute offset of the next free byte available for allocation.
    pub next_free: u32,
    /// Absolute offset one past the last byte of the last hbin page.
    pub end_pages: u32,
}

/// Scans the image to find the allocation cursor: the start of the trailing
/// free cell in the last hbin page (or `end_pages` if that page is full).
///
/// # Arguments
///
/// * `end_pages` - the hive's validated end-of-pages offset, as returned by
///   [`crate::loader::load`].
///
/// # Errors
///
/// Propagates any error walking the trailing hbin page's cell framing.
pub fn init_allocator_state(data: &[u8], end_pages: u32) -> Result<AllocatorState> {
    let mut page_offset = BASE_BLOCK_SIZE;
    let mut last_page_start = BASE_BLOCK_SIZE;
    let mut last_page_end = BASE_BLOCK_SIZE;

    while page_offset < end_pages as usize {
        let rel_offset = (page_offset - BASE_BLOCK_SIZE) as u32;
        let header = HbinHeader::parse(&data[page_offset..], rel_offset)?;
        last_page_start = page_offset;
        last_page_end = page_offset + header.size as usize;
        page_offset = last_page_end;
    }

    if last_page_end == last_page_start {
        // No pages at all (shouldn't happen for a loaded hive, but stay safe).
        return Ok(AllocatorState {
            next_free: end_pages,
            end_pages,
        });
    }

    let mut offset = last_page_start + HBIN_HEADER_SIZE;
    let mut last_cell_start = offset;
    let mut last_cell_len: i32 = 0;
    while offset < last_page_end {
        let seg_len = read_i32_le(data, offset)?;
        last_cell_start = offset;
        last_cell_len = seg_len;
        offset += seg_len.unsigned_abs() as usize;
    }

    let next_free = if last_cell_len > 0 {
        last_cell_start as u32
    } else {
        last_page_end as u32
    };

    Ok(AllocatorState {
        next_free,
        end_pages,
    })
}

/// Allocates a fresh used block of at least `seg_len` bytes (including the
/// 4-byte size field), growing the file with a new page if the current one
/// has no room. Returns the block's absolute offset.
///
/// # Arguments
///
/// * `seg_len` - requested size including the 4-byte size field; rounded up
///   to the next multiple of 8.
/// * `id2` - optional 2-byte signature written right after the size field.
///
/// # Errors
///
/// Returns `ReadOnly` if `writable` is false, or `OutOfRange` if `seg_len`
/// is not strictly greater than 4 or exceeds `limits.max_allocation`.
pub fn allocate_block(
    data: &mut Vec<u8>,
    block_map: &mut BlockMap,
    state: &mut AllocatorState,
    limits: &Limits,
    writable: bool,
    seg_len: u32,
    id2: Option<&[u8; 2]>,
) -> Result<u32> {
    if !writable {
        return Err(RegistryError::ReadOnly);
    }
    if seg_len <= 4 || seg_len as usize > limits.max_allocation {
        return Err(RegistryError::OutOfRange {
            what: "block allocation size".to_string(),
            value: seg_len as usize,
            limit: limits.max_allocation,
        });
    }

    let rounded = (seg_len + 7) & !7;
    if state.next_free.checked_add(rounded).map_or(true, |end| end > state.end_pages) {
        allocate_page(data, block_map, state, rounded)?;
    }

    let offset = state.next_free;
    let pos = offset as usize;
    write_i32_le(data, pos, -(rounded as i32))?;
    if let Some(id) = id2 {
        data[pos + 4..pos + 6].copy_from_slice(id);
    }
    block_map.set(offset);
    state.next_free = offset + rounded;

    let remaining = state.end_pages - state.next_free;
    if remaining > 0 {
        write_i32_le(data, state.next_free as usize, remaining as i32)?;
    }

    debug!(offset, rounded, "allocated block");
    Ok(offset)
}

/// Grows the file by enough 4 KiB pages to fit `hint` bytes, writes a fresh
/// `hbin` header, and advances the allocator past it.
///
/// # Arguments
///
/// * `hint` - minimum payload bytes the new page(s) must accommodate.
///
/// # Returns
///
/// Absolute offset of the new page's leading free cell.
///
/// # Errors
///
/// Propagates any error writing the new `hbin` header or free-cell framing.
pub fn allocate_page(
    data: &mut Vec<u8>,
    block_map: &mut BlockMap,
    state: &mut AllocatorState,
    hint: u32,
) -> Result<u32> {
    let needed = hint as usize + HBIN_HEADER_SIZE;
    let pages = needed.div_ceil(PAGE_SIZE);
    let page_bytes = (pages * PAGE_SIZE) as u32;

    let new_page_offset = state.end_pages;
    let rel_offset = new_page_offset - BASE_BLOCK_SIZE as u32;

    data.resize(data.len() + page_bytes as usize, 0);
    block_map.grow(data.len());

    HbinHeader::write_header(data, new_page_offset as usize, rel_offset, page_bytes)?;

    let free_start = new_page_offset + HBIN_HEADER_SIZE as u32;
    let free_len = page_bytes - HBIN_HEADER_SIZE as u32;
    write_i32_le(data, free_start as usize, free_len as i32)?;

    state.end_pages += page_bytes;
    state.next_free = free_start;

    debug!(new_page_offset, page_bytes, "allocated hbin page");
    Ok(free_start)
}

/// Flips a used block back to free and clears its BlockMap bit. Never
/// compacts or merges with neighboring free space.
///
/// # Errors
///
/// Returns `InvalidArgument` if the block at `offset` is already free.
pub fn mark_unused(data: &mut [u8], block_map: &mut BlockMap, offset: u32) -> Result<()> {
    let pos = offset as usize;
    let seg_len = read_i32_le(data, pos)?;
    if seg_len >= 0 {
        return Err(RegistryError::InvalidArgument(format!(
            "block at {:#x} is already free",
            offset
        )));
    }
    write_i32_le(data, pos, seg_len.unsigned_abs() as i32)?;
    block_map.clear(offset);
    Ok(())
}

/// Adds a new, empty, valueless subkey named `name` under `parent_offset`.
/// Fails with `Exists` if a case-insensitively matching child is already
/// present. Returns the new child's absolute offset.
///
/// # Arguments
///
/// * `parent_offset` - absolute offset of the parent `nk`.
/// * `name` - the new child's name, compared case-insensitively.
///
/// # Errors
///
/// Returns `ReadOnly` if not writable, `Exists` if `name` already names a
/// child, or `OutOfRange` if the parent is already at `limits.max_subkeys`.
pub fn add_child(
    data: &mut Vec<u8>,
    block_map: &mut BlockMap,
    state: &mut AllocatorState,
    limits: &Limits,
    writable: bool,
    parent_offset: u32,
    name: &str,
) -> Result<u32> {
    if !writable {
        return Err(RegistryError::ReadOnly);
    }
    if navigator::node_get_child(data, block_map, parent_offset, name)?.is_some() {
        return Err(RegistryError::Exists(name.to_string()));
    }

    let parent = navigator::node_at(data, block_map, parent_offset)?;
    if parent.subkey_count as usize + 1 > limits.max_subkeys {
        return Err(RegistryError::OutOfRange {
            what: "subkeys per node".to_string(),
            value: parent.subkey_count as usize + 1,
            limit: limits.max_subkeys,
        });
    }

    let parent_rel = absolute_to_cell_offset(parent_offset)?;
    let body = KeyNode::to_bytes(parent_rel, name);
    let seg_len = 4 + body.len() as u32;
    let child_offset = allocate_block(data, block_map, state, limits, writable, seg_len, None)?;
    let pos = child_offset as usize + 4;
    data[pos..pos + body.len()].copy_from_slice(&body);

    if parent.security_offset != 0xFFFF_FFFF {
        let sk_abs = cell_offset_to_absolute(parent.security_offset)?;
        bump_security_refcount(data, block_map, sk_abs)?;
        write_u32_le(
            data,
            pos + key::SECURITY_OFFSET_FIELD_OFFSET,
            parent.security_offset,
        )?;
    }

    let child_rel = absolute_to_cell_offset(child_offset)?;
    insert_subkey(data, block_map, state, limits, writable, parent_offset, &parent, child_rel, name)?;

    Ok(child_offset)
}

fn bump_security_refcount(data: &mut [u8], block_map: &BlockMap, sk_offset: u32) -> Result<()> {
    if !block_map.is_valid_block(sk_offset) {
        return Err(RegistryError::InvalidOffset {
            offset: sk_offset,
            hive_size: data.len(),
        });
    }
    let pos = sk_offset as usize + 4 + SecurityRecord::REF_COUNT_FIELD_OFFSET;
    let count = read_u32_le(data, pos)?;
    write_u32_le(data, pos, count + 1)
}

fn find_insert_position(
    data: &[u8],
    block_map: &BlockMap,
    entries: &[SubkeyListEntry],
    name: &str,
) -> Result<usize> {
    let lower = name.to_lowercase();
    for (i, entry) in entries.iter().enumerate() {
        let abs = cell_offset_to_absolute(entry.key_offset)?;
        let existing = navigator::node_name(data, block_map, abs)?;
        if existing.to_lowercase().as_str() > lower.as_str() {
            return Ok(i);
        }
    }
    Ok(entries.len())
}

fn patch_subkeys_after_insert(
    data: &mut [u8],
    parent_offset: u32,
    new_count: u32,
    new_list_rel: u32,
    name_char_len: u32,
) -> Result<()> {
    let base = parent_offset as usize + 4;
    write_u32_le(data, base + key::SUBKEY_COUNT_FIELD_OFFSET, new_count)?;
    write_u32_le(data, base + key::SUBKEY_LIST_OFFSET_FIELD_OFFSET, new_list_rel)?;
    let current_max = read_u32_le(data, base + key::MAX_SUBKEY_NAME_LEN_FIELD_OFFSET)?;
    let candidate = name_char_len * 2;
    if candidate > current_max {
        write_u32_le(data, base + key::MAX_SUBKEY_NAME_LEN_FIELD_OFFSET, candidate)?;
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn insert_subkey(
    data: &mut Vec<u8>,
    block_map: &mut BlockMap,
    state: &mut AllocatorState,
    limits: &Limits,
    writable: bool,
    parent_offset: u32,
    parent: &KeyNode,
    child_rel: u32,
    name: &str,
) -> Result<()> {
    let hash = crate::subkey_list::lh_hash(name);

    if parent.subkey_count == 0 {
        let list = SubkeyList::LeafWithHints(
            SubkeyListType::HashLeaf,
            vec![SubkeyListEntry {
                key_offset: child_rel,
                name_hint: hash,
            }],
        );
        let bytes = list.to_bytes();
        let seg_len = 4 + bytes.len() as u32;
        let leaf_offset = allocate_block(data, block_map, state, limits, writable, seg_len, None)?;
        let pos = leaf_offset as usize + 4;
        data[pos..pos + bytes.len()].copy_from_slice(&bytes);
        let leaf_rel = absolute_to_cell_offset(leaf_offset)?;
        return patch_subkeys_after_insert(data, parent_offset, 1, leaf_rel, name.len() as u32);
    }

    let list_abs = cell_offset_to_absolute(parent.subkey_list_offset)?;
    let list_body = navigator::cell_body(data, block_map, list_abs)?.to_vec();
    let list = SubkeyList::parse(&list_body, list_abs)?;

    match list {
        SubkeyList::LeafWithHints(kind, mut entries) => {
            let pos = find_insert_position(data, block_map, &entries, name)?;
            entries.insert(
                pos,
                SubkeyListEntry {
                    key_offset: child_rel,
                    name_hint: hash,
                },
            );
            let new_list = SubkeyList::LeafWithHints(kind, entries);
            let bytes = new_list.to_bytes();
            let seg_len = 4 + bytes.len() as u32;
            let new_leaf = allocate_block(data, block_map, state, limits, writable, seg_len, None)?;
            let dst = new_leaf as usize + 4;
            data[dst..dst + bytes.len()].copy_from_slice(&bytes);
            mark_unused(data, block_map, list_abs)?;
            let new_leaf_rel = absolute_to_cell_offset(new_leaf)?;
            patch_subkeys_after_insert(data, parent_offset, parent.subkey_count + 1, new_leaf_rel, name.len() as u32)
        }
        SubkeyList::IndexRoot(sublists) => {
            let mut target_idx = sublists.len() - 1;
            let mut target_abs = 0u32;
            let mut target_kind = SubkeyListType::HashLeaf;
            let mut target_entries: Vec<SubkeyListEntry> = Vec::new();

            for (i, &sub_rel) in sublists.iter().enumerate() {
                let sub_abs = cell_offset_to_absolute(sub_rel)?;
                let sub_body = navigator::cell_body(data, block_map, sub_abs)?.to_vec();
                match SubkeyList::parse(&sub_body, sub_abs)? {
                    SubkeyList::LeafWithHints(kind, entries) => {
                        let last_gt = match entries.last() {
                            Some(e) => {
                                let abs = cell_offset_to_absolute(e.key_offset)?;
                                navigator::node_name(data, block_map, abs)?.to_lowercase()
                                    > name.to_lowercase()
                            }
                            None => true,
                        };
                        target_idx = i;
                        target_abs = sub_abs;
                        target_kind = kind;
                        target_entries = entries;
                        if last_gt {
                            break;
                        }
                    }
                    _ => {
                        return Err(RegistryError::NotSupported(
                            "nested index root in subkey index".to_string(),
                        ))
                    }
                }
            }

            let insert_pos = find_insert_position(data, block_map, &target_entries, name)?;
            target_entries.insert(
                insert_pos,
                SubkeyListEntry {
                    key_offset: child_rel,
                    name_hint: hash,
                },
            );
            let new_list = SubkeyList::LeafWithHints(target_kind, target_entries);
            let bytes = new_list.to_bytes();
            let seg_len = 4 + bytes.len() as u32;
            let new_leaf = allocate_block(data, block_map, state, limits, writable, seg_len, None)?;
            let dst = new_leaf as usize + 4;
            data[dst..dst + bytes.len()].copy_from_slice(&bytes);
            mark_unused(data, block_map, target_abs)?;
            let new_leaf_rel = absolute_to_cell_offset(new_leaf)?;
            let slot_pos = list_abs as usize + 4 + 4 + target_idx * 4;
            write_u32_le(data, slot_pos, new_leaf_rel)?;
            patch_subkeys_after_insert(
                data,
                parent_offset,
                parent.subkey_count + 1,
                parent.subkey_list_offset,
                name.len() as u32,
            )
        }
        SubkeyList::IndexLeaf(_) => Err(RegistryError::NotSupported(
            "index leaf (li) insertion not supported".to_string(),
        )),
    }
}

/// Replaces a key's entire value set. Existing `vk` records, their
/// out-of-line data blocks, and the old value-list are all marked unused
/// first; the new set is then allocated fresh (never reusing the freed
/// blocks), matching the bump-allocator's monotone-offset guarantee.
///
/// # Arguments
///
/// * `node_offset` - absolute offset of the key whose value set is replaced.
/// * `values` - the complete new value set; an empty slice clears all values.
///
/// # Errors
///
/// Returns `ReadOnly` if not writable, or `OutOfRange` if `values` exceeds
/// `limits.max_values` or any payload exceeds `limits.max_value_data_len`.
pub fn set_values(
    data: &mut Vec<u8>,
    block_map: &mut BlockMap,
    state: &mut AllocatorState,
    limits: &Limits,
    writable: bool,
    node_offset: u32,
    values: &[NewValue],
) -> Result<()> {
    if !writable {
        return Err(RegistryError::ReadOnly);
    }
    if values.len() > limits.max_values {
        return Err(RegistryError::OutOfRange {
            what: "values per node".to_string(),
            value: values.len(),
            limit: limits.max_values,
        });
    }

    let node = navigator::node_at(data, block_map, node_offset)?;

    for vk_offset in navigator::node_values(data, block_map, node_offset)? {
        let vk = navigator::value_at(data, block_map, vk_offset)?;
        if !vk.is_inline_data() && vk.data_length > 0 {
            let data_abs = cell_offset_to_absolute(vk.data_offset)?;
            if block_map.is_valid_block(data_abs) {
                mark_unused(data, block_map, data_abs)?;
            }
        }
        mark_unused(data, block_map, vk_offset)?;
    }
    if node.value_count > 0 {
        let list_abs = cell_offset_to_absolute(node.value_list_offset)?;
        mark_unused(data, block_map, list_abs)?;
    }

    let base = node_offset as usize + 4;
    if values.is_empty() {
        write_u32_le(data, base + key::VALUE_COUNT_FIELD_OFFSET, 0)?;
        write_u32_le(data, base + key::VALUE_LIST_OFFSET_FIELD_OFFSET, 0xFFFF_FFFF)?;
        return Ok(());
    }

    let mut entry_offsets = Vec::with_capacity(values.len());
    let mut max_name_len = read_u32_le(data, base + key::MAX_VALUE_NAME_LEN_FIELD_OFFSET)?;
    let mut max_data_len = read_u32_le(data, base + key::MAX_VALUE_DATA_LEN_FIELD_OFFSET)?;

    for value in values {
        let raw = value.data.to_raw_bytes()?;
        if raw.len() as usize > limits.max_value_data_len {
            return Err(RegistryError::OutOfRange {
                what: "value data length".to_string(),
                value: raw.len(),
                limit: limits.max_value_data_len,
            });
        }

        let (data_length, data_offset) = if raw.len() <= 4 && !raw.is_empty() {
            let mut inline = [0u8; 4];
            inline[..raw.len()].copy_from_slice(&raw);
            (0x8000_0000 | raw.len() as u32, u32::from_le_bytes(inline))
        } else if raw.is_empty() {
            (0u32, 0xFFFF_FFFFu32)
        } else {
            let seg_len = 4 + raw.len() as u32;
            let block_offset = allocate_block(data, block_map, state, limits, writable, seg_len, None)?;
            let pos = block_offset as usize + 4;
            data[pos..pos + raw.len()].copy_from_slice(&raw);
            (raw.len() as u32, absolute_to_cell_offset(block_offset)?)
        };

        let vk_type = value.data.value_type();
        let vk_bytes = ValueKey::to_bytes(&value.name, vk_type, data_length, data_offset);
        let vk_seg_len = 4 + vk_bytes.len() as u32;
        let vk_offset = allocate_block(data, block_map, state, limits, writable, vk_seg_len, None)?;
        let vk_pos = vk_offset as usize + 4;
        data[vk_pos..vk_pos + vk_bytes.len()].copy_from_slice(&vk_bytes);

        entry_offsets.push(absolute_to_cell_offset(vk_offset)?);
        max_name_len = max_name_len.max(value.name.len() as u32 * 2);
        max_data_len = max_data_len.max(raw.len() as u32);
    }

    let list_seg_len = 4 + 4 * entry_offsets.len() as u32;
    let list_offset = allocate_block(data, block_map, state, limits, writable, list_seg_len, None)?;
    let list_pos = list_offset as usize + 4;
    for (i, rel) in entry_offsets.iter().enumerate() {
        let pos = list_pos + i * 4;
        data[pos..pos + 4].copy_from_slice(&rel.to_le_bytes());
    }

    write_u32_le(data, base + key::VALUE_COUNT_FIELD_OFFSET, values.len() as u32)?;
    write_u32_le(
        data,
        base + key::VALUE_LIST_OFFSET_FIELD_OFFSET,
        absolute_to_cell_offset(list_offset)?,
    )?;
    write_u32_le(data, base + key::MAX_VALUE_NAME_LEN_FIELD_OFFSET, max_name_len)?;
    write_u32_le(data, base + key::MAX_VALUE_DATA_LEN_FIELD_OFFSET, max_data_len)?;

    Ok(())
}

/// Deletes `node_offset` and its entire subtree. Forbids deleting the root.
///
/// # Arguments
///
/// * `root_offset` - the hive's root, compared against `node_offset` to
///   forbid deleting it.
/// * `node_offset` - absolute offset of the subtree to delete.
///
/// # Errors
///
/// Returns `ReadOnly` if not writable, `InvalidArgument` if `node_offset`
/// equals `root_offset`, or `NoKey` if `node_offset` isn't found among its
/// parent's children.
pub fn delete_child(
    data: &mut Vec<u8>,
    block_map: &mut BlockMap,
    limits: &Limits,
    writable: bool,
    root_offset: u32,
    node_offset: u32,
) -> Result<()> {
    if !writable {
        return Err(RegistryError::ReadOnly);
    }
    if node_offset == root_offset {
        return Err(RegistryError::InvalidArgument(
            "cannot delete the root key".to_string(),
        ));
    }

    let parent_offset = navigator::node_parent(data, block_map, node_offset)?;
    let parent = navigator::node_at(data, block_map, parent_offset)?;
    let node_rel = absolute_to_cell_offset(node_offset)?;

    let list_abs = cell_offset_to_absolute(parent.subkey_list_offset)?;
    let list_body = navigator::cell_body(data, block_map, list_abs)?.to_vec();
    let list = SubkeyList::parse(&list_body, list_abs)?;

    match list {
        SubkeyList::LeafWithHints(_, mut entries) => {
            let pos = entries
                .iter()
                .position(|e| e.key_offset == node_rel)
                .ok_or(RegistryError::NoKey)?;
            entries.remove(pos);
            rewrite_leaf_in_place(data, &entries, list_abs)?;
            patch_subkey_count(data, parent_offset, parent.subkey_count - 1)?;
        }
        SubkeyList::IndexRoot(sublists) => {
            let mut found = false;
            for &sub_rel in &sublists {
                let sub_abs = cell_offset_to_absolute(sub_rel)?;
                let sub_body = navigator::cell_body(data, block_map, sub_abs)?.to_vec();
                if let SubkeyList::LeafWithHints(_, mut entries) = SubkeyList::parse(&sub_body, sub_abs)? {
                    if let Some(pos) = entries.iter().position(|e| e.key_offset == node_rel) {
                        entries.remove(pos);
                        rewrite_leaf_in_place(data, &entries, sub_abs)?;
                        found = true;
                        break;
                    }
                }
            }
            if !found {
                return Err(RegistryError::NoKey);
            }
            patch_subkey_count(data, parent_offset, parent.subkey_count - 1)?;
        }
        SubkeyList::IndexLeaf(_) => {
            return Err(RegistryError::NotSupported(
                "index leaf (li) deletion not supported".to_string(),
            ))
        }
    }

    delete_subtree(data, block_map, node_offset)
}

fn rewrite_leaf_in_place(data: &mut [u8], entries: &[SubkeyListEntry], leaf_abs: u32) -> Result<()> {
    let body = leaf_abs as usize + 4;
    let count = entries.len() as u16;
    data[body + 2..body + 4].copy_from_slice(&count.to_le_bytes());
    for (i, entry) in entries.iter().enumerate() {
        let pos = body + 4 + i * 8;
        data[pos..pos + 4].copy_from_slice(&entry.key_offset.to_le_bytes());
        data[pos + 4..pos + 8].copy_from_slice(&entry.name_hint.to_le_bytes());
    }
    Ok(())
}

fn patch_subkey_count(data: &mut [u8], parent_offset: u32, new_count: u32) -> Result<()> {
    write_u32_le(data, parent_offset as usize + 4 + key::SUBKEY_COUNT_FIELD_OFFSET, new_count)
}

fn delete_subtree(data: &mut Vec<u8>, block_map: &mut BlockMap, offset: u32) -> Result<()> {
    let node = navigator::node_at(data, block_map, offset)?;

    for child in navigator::node_children(data, block_map, offset)? {
        delete_subtree(data, block_map, child)?;
    }

    if node.subkey_count > 0 {
        let list_abs = cell_offset_to_absolute(node.subkey_list_offset)?;
        free_subkey_list_chain(data, block_map, list_abs)?;
    }

    for vk_offset in navigator::node_values(data, block_map, offset)? {
        let vk = navigator::value_at(data, block_map, vk_offset)?;
        if !vk.is_inline_data() && vk.data_length > 0 {
            let data_abs = cell_offset_to_absolute(vk.data_offset)?;
            if block_map.is_valid_block(data_abs) {
                mark_unused(data, block_map, data_abs)?;
            }
        }
        mark_unused(data, block_map, vk_offset)?;
    }
    if node.value_count > 0 {
        let list_abs = cell_offset_to_absolute(node.value_list_offset)?;
        mark_unused(data, block_map, list_abs)?;
    }

    if node.security_offset != 0xFFFF_FFFF {
        let sk_abs = cell_offset_to_absolute(node.security_offset)?;
        release_security(data, block_map, sk_abs)?;
    }

    mark_unused(data, block_map, offset)
}

fn free_subkey_list_chain(data: &mut [u8], block_map: &mut BlockMap, list_abs: u32) -> Result<()> {
    let body = navigator::cell_body(data, block_map, list_abs)?.to_vec();
    if let SubkeyList::IndexRoot(sublists) = SubkeyList::parse(&body, list_abs)? {
        for rel in sublists {
            let abs = cell_offset_to_absolute(rel)?;
            mark_unused(data, block_map, abs)?;
        }
    }
    mark_unused(data, block_map, list_abs)
}

fn release_security(data: &mut [u8], block_map: &mut BlockMap, sk_abs: u32) -> Result<()> {
    let body = navigator::cell_body(data, block_map, sk_abs)?.to_vec();
    let sk = SecurityRecord::parse(&body, sk_abs)?;

    if sk.ref_count == 0 {
        return Err(RegistryError::InvalidArgument(format!(
            "sk at {:#x} has zero refcount on delete",
            sk_abs
        )));
    }

    if sk.ref_count > 1 {
        let pos = sk_abs as usize + 4 + SecurityRecord::REF_COUNT_FIELD_OFFSET;
        return write_u32_le(data, pos, sk.ref_count - 1);
    }

    let prev_abs = cell_offset_to_absolute(sk.prev_offset)?;
    let next_abs = cell_offset_to_absolute(sk.next_offset)?;
    if prev_abs != sk_abs {
        write_u32_le(data, prev_abs as usize + 4 + SecurityRecord::NEXT_FIELD_OFFSET, sk.next_offset)?;
    }
    if next_abs != sk_abs {
        write_u32_le(data, next_abs as usize + 4 + SecurityRecord::PREV_FIELD_OFFSET, sk.prev_offset)?;
    }
    mark_unused(data, block_map, sk_abs)
}

/// Bumps both sequence numbers, recomputes `hive_length` and the header
/// checksum, and writes the full image to `path`.
///
/// # Arguments
///
/// * `end_pages` - the current end-of-pages offset, used to recompute
///   `hive_length`.
/// * `path` - destination file; overwritten if it exists.
///
/// # Errors
///
/// Propagates any error from recomputing the header or from the underlying
/// file write.
pub fn commit(data: &mut [u8], end_pages: u32, path: &Path) -> Result<()> {
    BaseBlock::rewrite_for_commit(data, end_pages)?;
    std::fs::write(path, &*data)?;
    info!(path = %path.display(), bytes = data.len(), "committed hive");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::load;

    fn fresh_state(data: &[u8], end_pages: u32) -> AllocatorState {
        init_allocator_state(data, end_pages).unwrap()
    }

    #[test]
    fn test_add_child_then_get_child_round_trips() {
        let mut data = crate::testutil::minimal_hive("ROOT");
        let loaded = load(&data).unwrap();
        let root = navigator::root(&data, &loaded.block_map, loaded.base_block.root_cell_offset).unwrap();

        let mut block_map = loaded.block_map.clone();
        let mut state = fresh_state(&data, loaded.end_of_pages);
        let limits = Limits::default();

        let child = add_child(&mut data, &mut block_map, &mut state, &limits, true, root, "SOFTWARE").unwrap();
        assert_eq!(navigator::node_name(&data, &block_map, child).unwrap(), "SOFTWARE");

        let found = navigator::node_get_child(&data, &block_map, root, "software").unwrap();
        assert_eq!(found, Some(child));

        let children = navigator::node_children(&data, &block_map, root).unwrap();
        assert_eq!(children, vec![child]);
    }

    #[test]
    fn test_add_child_rejects_duplicate_name() {
        let mut data = crate::testutil::minimal_hive("ROOT");
        let loaded = load(&data).unwrap();
        let root = navigator::root(&data, &loaded.block_map, loaded.base_block.root_cell_offset).unwrap();
        let mut block_map = loaded.block_map.clone();
        let mut state = fresh_state(&data, loaded.end_of_pages);
        let limits = Limits::default();

        add_child(&mut data, &mut block_map, &mut state, &limits, true, root, "Dup").unwrap();
        let result = add_child(&mut data, &mut block_map, &mut state, &limits, true, root, "dup");
        assert!(matches!(result.unwrap_err(), RegistryError::Exists(_)));
    }

    #[test]
    fn test_add_child_maintains_sorted_order() {
        let mut data = crate::testutil::minimal_hive("ROOT");
        let loaded = load(&data).unwrap();
        let root = navigator::root(&data, &loaded.block_map, loaded.base_block.root_cell_offset).unwrap();
        let mut block_map = loaded.block_map.clone();
        let mut state = fresh_state(&data, loaded.end_of_pages);
        let limits = Limits::default();

        for name in ["Zebra", "Apple", "Mango"] {
            add_child(&mut data, &mut block_map, &mut state, &limits, true, root, name).unwrap();
        }

        let children = navigator::node_children(&data, &block_map, root).unwrap();
        let names: Vec<String> = children
            .iter()
            .map(|&c| navigator::node_name(&data, &block_map, c).unwrap())
            .collect();
        assert_eq!(names, vec!["Apple", "Mango", "Zebra"]);
    }

    #[test]
    fn test_add_child_read_only_fails() {
        let mut data = crate::testutil::minimal_hive("ROOT");
        let loaded = load(&data).unwrap();
        let root = navigator::root(&data, &loaded.block_map, loaded.base_block.root_cell_offset).unwrap();
        let mut block_map = loaded.block_map.clone();
        let mut state = fresh_state(&data, loaded.end_of_pages);
        let limits = Limits::default();

        let result = add_child(&mut data, &mut block_map, &mut state, &limits, false, root, "X");
        assert!(matches!(result.unwrap_err(), RegistryError::ReadOnly));
    }

    #[test]
    fn test_set_values_then_read_back_inline_dword() {
        let mut data = crate::testutil::minimal_hive("ROOT");
        let loaded = load(&data).unwrap();
        let root = navigator::root(&data, &loaded.block_map, loaded.base_block.root_cell_offset).unwrap();
        let mut block_map = loaded.block_map.clone();
        let mut state = fresh_state(&data, loaded.end_of_pages);
        let limits = Limits::default();

        let values = vec![NewValue {
            name: "v".to_string(),
            data: crate::value::ValueData::Dword(0x1122_3344),
        }];
        set_values(&mut data, &mut block_map, &mut state, &limits, true, root, &values).unwrap();

        let vk_offset = navigator::node_get_value(&data, &block_map, root, "v").unwrap().unwrap();
        let vk = navigator::value_at(&data, &block_map, vk_offset).unwrap();
        let raw = navigator::value_raw(&data, &block_map, &vk, &limits).unwrap();
        let parsed = crate::value::ValueData::parse(&raw, vk.data_type, vk_offset).unwrap();
        assert_eq!(parsed.as_dword().unwrap(), 0x1122_3344);
    }

    #[test]
    fn test_set_values_replaces_previous_set() {
        let mut data = crate::testutil::minimal_hive("ROOT");
        let loaded = load(&data).unwrap();
        let root = navigator::root(&data, &loaded.block_map, loaded.base_block.root_cell_offset).unwrap();
        let mut block_map = loaded.block_map.clone();
        let mut state = fresh_state(&data, loaded.end_of_pages);
        let limits = Limits::default();

        let first = vec![NewValue {
            name: "a".to_string(),
            data: crate::value::ValueData::Dword(1),
        }];
        set_values(&mut data, &mut block_map, &mut state, &limits, true, root, &first).unwrap();

        let second = vec![NewValue {
            name: "b".to_string(),
            data: crate::value::ValueData::String("hello".to_string()),
        }];
        set_values(&mut data, &mut block_map, &mut state, &limits, true, root, &second).unwrap();

        let values = navigator::node_values(&data, &block_map, root).unwrap();
        assert_eq!(values.len(), 1);
        assert!(navigator::node_get_value(&data, &block_map, root, "a").unwrap().is_none());
        assert!(navigator::node_get_value(&data, &block_map, root, "b").unwrap().is_some());
    }

    #[test]
    fn test_delete_child_removes_leaf_and_frees_blocks() {
        let mut data = crate::testutil::minimal_hive("ROOT");
        let loaded = load(&data).unwrap();
        let root = navigator::root(&data, &loaded.block_map, loaded.base_block.root_cell_offset).unwrap();
        let mut block_map = loaded.block_map.clone();
        let mut state = fresh_state(&data, loaded.end_of_pages);
        let limits = Limits::default();

        let child = add_child(&mut data, &mut block_map, &mut state, &limits, true, root, "Temp").unwrap();
        assert!(block_map.is_valid_block(child));

        delete_child(&mut data, &mut block_map, &limits, true, root, child).unwrap();

        assert!(!block_map.is_valid_block(child));
        assert!(navigator::node_children(&data, &block_map, root).unwrap().is_empty());
    }

    #[test]
    fn test_delete_child_forbids_root() {
        let mut data = crate::testutil::minimal_hive("ROOT");
        let loaded = load(&data).unwrap();
        let root = navigator::root(&data, &loaded.block_map, loaded.base_block.root_cell_offset).unwrap();
        let mut block_map = loaded.block_map.clone();
        let limits = Limits::default();

        let result = delete_child(&mut data, &mut block_map, &limits, true, root, root);
        assert!(matches!(result.unwrap_err(), RegistryError::InvalidArgument(_)));
    }

    #[test]
    fn test_allocate_page_grows_file_and_blockmap() {
        let mut data = crate::testutil::minimal_hive("ROOT");
        let loaded = load(&data).unwrap();
        let mut block_map = loaded.block_map.clone();
        let mut state = fresh_state(&data, loaded.end_of_pages);

        let before_len = data.len();
        let offset = allocate_page(&mut data, &mut block_map, &mut state, 5000).unwrap();

        assert!(data.len() > before_len);
        assert_eq!(offset, before_len as u32 + HBIN_HEADER_SIZE as u32);
        assert_eq!(state.end_pages, data.len() as u32);
    }
}
