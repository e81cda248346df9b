//! Test-only helpers for hand-building minimal hive images.
//!
//! Real hive fixture files aren't available in this environment, so unit
//! tests across `loader`, `navigator`, `visitor`, and `writer` construct
//! tiny, byte-exact hive images here instead of parsing real SYSTEM/SOFTWARE
//! hives.

use crate::header::BASE_BLOCK_SIZE;
use crate::utils::calculate_checksum;

/// One page's worth of hbin payload (4 KiB), matching real hive alignment.
pub const PAGE_SIZE: usize = 0x1000;

/// Cell header for a used block of `cell_len` total bytes (including the
/// 4-byte size field itself), written at `buf[at..]`.
pub fn write_used_cell_header(buf: &mut [u8], at: usize, cell_len: i32) {
    let seg_len = -cell_len;
    buf[at..at + 4].copy_from_slice(&seg_len.to_le_bytes());
}

/// Cell header for a free block spanning `cell_len` bytes.
pub fn write_free_cell_header(buf: &mut [u8], at: usize, cell_len: i32) {
    buf[at..at + 4].copy_from_slice(&cell_len.to_le_bytes());
}

/// Writes an "nk" record body (everything after the 4-byte cell size field)
/// at `buf[at..]`. `rel_parent`/`rel_subkey_list`/`rel_value_list` are cell
/// offsets relative to the first hbin (i.e. not yet `+0x1000`).
#[allow(clippy::too_many_arguments)]
pub fn write_nk(
    buf: &mut [u8],
    at: usize,
    flags: u16,
    rel_parent: u32,
    subkey_count: u32,
    rel_subkey_list: u32,
    value_count: u32,
    rel_value_list: u32,
    name: &str,
) {
    buf[at..at + 2].copy_from_slice(b"nk");
    buf[at + 0x02..at + 0x04].copy_from_slice(&flags.to_le_bytes());
    // last_written left zero
    buf[at + 0x0C..at + 0x10].copy_from_slice(&0u32.to_le_bytes()); // access_bits
    buf[at + 0x10..at + 0x14].copy_from_slice(&rel_parent.to_le_bytes());
    buf[at + 0x14..at + 0x18].copy_from_slice(&subkey_count.to_le_bytes());
    buf[at + 0x18..at + 0x1C].copy_from_slice(&0u32.to_le_bytes()); // volatile subkeys
    buf[at + 0x1C..at + 0x20].copy_from_slice(&rel_subkey_list.to_le_bytes());
    buf[at + 0x20..at + 0x24].copy_from_slice(&0xFFFF_FFFFu32.to_le_bytes()); // volatile list
    buf[at + 0x24..at + 0x28].copy_from_slice(&value_count.to_le_bytes());
    buf[at + 0x28..at + 0x2C].copy_from_slice(&rel_value_list.to_le_bytes());
    buf[at + 0x2C..at + 0x30].copy_from_slice(&0xFFFF_FFFFu32.to_le_bytes()); // security
    buf[at + 0x30..at + 0x34].copy_from_slice(&0xFFFF_FFFFu32.to_le_bytes()); // classname
    buf[at + 0x34..at + 0x38].copy_from_slice(&0u32.to_le_bytes());
    buf[at + 0x38..at + 0x3C].copy_from_slice(&0u32.to_le_bytes());
    buf[at + 0x3C..at + 0x40].copy_from_slice(&0u32.to_le_bytes());
    buf[at + 0x40..at + 0x44].copy_from_slice(&0u32.to_le_bytes());
    buf[at + 0x44..at + 0x48].copy_from_slice(&0u32.to_le_bytes()); // work_var
    buf[at + 0x48..at + 0x4A].copy_from_slice(&(name.len() as u16).to_le_bytes());
    buf[at + 0x4A..at + 0x4C].copy_from_slice(&0u16.to_le_bytes()); // classname len
    buf[at + 0x4C..at + 0x4C + name.len()].copy_from_slice(name.as_bytes());
}

/// Size in bytes of an "nk" record body for a given (ASCII) name length.
pub fn nk_size(name_len: usize) -> usize {
    0x4C + name_len
}

/// Writes a "vk" record body at `buf[at..]`.
pub fn write_vk(buf: &mut [u8], at: usize, name: &str, data_type: u32, data_len: i32, data_offset: u32) {
    buf[at..at + 2].copy_from_slice(b"vk");
    buf[at + 0x02..at + 0x04].copy_from_slice(&(name.len() as u16).to_le_bytes());
    buf[at + 0x04..at + 0x08].copy_from_slice(&data_len.to_le_bytes());
    buf[at + 0x08..at + 0x0C].copy_from_slice(&data_offset.to_le_bytes());
    buf[at + 0x0C..at + 0x10].copy_from_slice(&data_type.to_le_bytes());
    buf[at + 0x10..at + 0x12].copy_from_slice(&1u16.to_le_bytes()); // ASCII name flag
    buf[at + 0x12..at + 0x14].copy_from_slice(&0u16.to_le_bytes()); // spare
    buf[at + 0x14..at + 0x14 + name.len()].copy_from_slice(name.as_bytes());
}

/// Size in bytes of a "vk" record body for a given (ASCII) name length.
pub fn vk_size(name_len: usize) -> usize {
    0x14 + name_len
}

/// Writes an `lh` subkey-index leaf body (count + (offset, hash) pairs).
pub fn write_lh(buf: &mut [u8], at: usize, entries: &[(u32, u32)]) {
    buf[at..at + 2].copy_from_slice(b"lh");
    buf[at + 0x02..at + 0x04].copy_from_slice(&(entries.len() as u16).to_le_bytes());
    for (i, (offset, hash)) in entries.iter().enumerate() {
        let pos = at + 0x04 + i * 8;
        buf[pos..pos + 4].copy_from_slice(&offset.to_le_bytes());
        buf[pos + 4..pos + 8].copy_from_slice(&hash.to_le_bytes());
    }
}

/// Size in bytes of an `lh`/`lf` body for `count` entries.
pub fn lh_size(count: usize) -> usize {
    4 + count * 8
}

/// Builds a minimal, valid, single-hbin-page hive image with a root `nk`
/// named `root_name` and no subkeys or values. Returns the complete file
/// bytes (header + one 4 KiB hbin page) with a correct checksum.
pub fn minimal_hive(root_name: &str) -> Vec<u8> {
    let mut data = vec![0u8; BASE_BLOCK_SIZE + PAGE_SIZE];

    // --- hbin page header at absolute 0x1000 ---
    let hbin_off = BASE_BLOCK_SIZE;
    data[hbin_off..hbin_off + 4].copy_from_slice(b"hbin");
    data[hbin_off + 0x04..hbin_off + 0x08].copy_from_slice(&0u32.to_le_bytes()); // offset
    data[hbin_off + 0x08..hbin_off + 0x0C].copy_from_slice(&(PAGE_SIZE as u32).to_le_bytes());

    // --- root nk cell at relative 0x20 (absolute 0x1020) ---
    let rel_root = 0x20u32;
    let cell_start = hbin_off + 0x20;
    let body_len = nk_size(root_name.len());
    let cell_len = 4 + body_len;
    let cell_len = (cell_len + 3) & !3; // keep 4-aligned
    write_used_cell_header(&mut data, cell_start, cell_len as i32);
    write_nk(
        &mut data,
        cell_start + 4,
        0x0020 | 0x0004, // COMP_NAME | ROOT_KEY
        rel_root,        // self-referential parent, matches real-world root quirk
        0,
        0xFFFF_FFFF,
        0,
        0xFFFF_FFFF,
        root_name,
    );

    // --- trailing free block filling the rest of the page ---
    let free_start = cell_start + cell_len;
    let free_len = (hbin_off + PAGE_SIZE) - free_start;
    write_free_cell_header(&mut data, free_start, free_len as i32);

    // --- base block header ---
    data[0..4].copy_from_slice(b"regf");
    data[0x04..0x08].copy_from_slice(&1u32.to_le_bytes()); // primary sequence
    data[0x08..0x0C].copy_from_slice(&1u32.to_le_bytes()); // secondary sequence
    data[0x14..0x18].copy_from_slice(&1u32.to_le_bytes()); // major version
    data[0x18..0x1C].copy_from_slice(&5u32.to_le_bytes()); // minor version
    data[0x20..0x24].copy_from_slice(&1u32.to_le_bytes()); // file format
    data[0x24..0x28].copy_from_slice(&rel_root.to_le_bytes()); // root cell offset
    data[0x28..0x2C].copy_from_slice(&(PAGE_SIZE as u32).to_le_bytes()); // hive_length
    data[0x2C..0x30].copy_from_slice(&1u32.to_le_bytes()); // clustering factor

    let checksum = calculate_checksum(&data);
    data[0x1FC..0x200].copy_from_slice(&checksum.to_le_bytes());

    data
}
