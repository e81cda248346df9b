//! Visitor: depth-first traversal with cycle detection and per-type value
//! dispatch.
//!
//! A per-traversal clone of the hive's [`BlockMap`] tracks "unvisited"
//! blocks; clearing a bit on entry and rejecting an already-cleared bit
//! turns any cycle in the subkey graph into a detected, handled `Loop`
//! error rather than infinite recursion.

use crate::blockmap::BlockMap;
use crate::cell::ValueType;
use crate::error::{ErrorKind, RegistryError, Result};
use crate::loader::Limits;
use crate::navigator;
use crate::value::ValueData;
use tracing::warn;

/// Flags controlling a single [`visit`] call.
#[derive(Debug, Clone, Copy, Default)]
pub struct VisitFlags {
    /// Demote structural errors (bad blocks, count mismatches, cycles) to a
    /// logged warning and keep traversing instead of aborting.
    pub skip_bad: bool,
}

/// Callback surface for a hive traversal.
///
/// Every method has a no-op default so implementors only override what they
/// need. Any `Err` returned from a callback aborts the entire traversal
/// immediately (it is never suppressed by `skip_bad`, which only covers
/// structural/navigator errors).
#[allow(unused_variables)]
pub trait Visitor {
    /// Called on entering a key, before its values and children.
    fn node_start(&mut self, offset: u32, name: &str) -> Result<()> {
        Ok(())
    }

    /// Called on leaving a key, after its values and children.
    fn node_end(&mut self, offset: u32, name: &str) -> Result<()> {
        Ok(())
    }

    /// If present and returning `Some`, receives every value's raw bytes and
    /// type ahead of (and instead of) the per-type callbacks below.
    fn value_any(&mut self, name: &str, value_type: ValueType, raw: &[u8]) -> Option<Result<()>> {
        None
    }

    /// `REG_SZ`.
    fn value_string(&mut self, name: &str, s: &str) -> Result<()> {
        Ok(())
    }
    /// `REG_EXPAND_SZ`.
    fn value_expand_string(&mut self, name: &str, s: &str) -> Result<()> {
        Ok(())
    }
    /// `REG_LINK`.
    fn value_link(&mut self, name: &str, s: &str) -> Result<()> {
        Ok(())
    }
    /// `REG_BINARY` and any other unstructured payload.
    fn value_binary(&mut self, name: &str, data: &[u8]) -> Result<()> {
        Ok(())
    }
    /// `REG_DWORD`.
    fn value_dword(&mut self, name: &str, value: u32) -> Result<()> {
        Ok(())
    }
    /// `REG_DWORD_BIG_ENDIAN`.
    fn value_dword_be(&mut self, name: &str, value: u32) -> Result<()> {
        Ok(())
    }
    /// `REG_QWORD`.
    fn value_qword(&mut self, name: &str, value: u64) -> Result<()> {
        Ok(())
    }
    /// `REG_MULTI_SZ`.
    fn value_multi_string(&mut self, name: &str, strings: &[String]) -> Result<()> {
        Ok(())
    }
    /// `REG_NONE`.
    fn value_none(&mut self, name: &str) -> Result<()> {
        Ok(())
    }
    /// Resource-list/unknown types, carried as opaque bytes.
    fn value_unknown(&mut self, name: &str, raw: &[u8]) -> Result<()> {
        Ok(())
    }
    /// A string-shaped value whose bytes failed UTF-16 decoding. Receives
    /// the raw bytes so the caller can still emit them (e.g. base64).
    fn value_string_invalid_utf16(&mut self, name: &str, raw: &[u8]) -> Result<()> {
        Ok(())
    }
}

/// Runs a depth-first visit starting at `root_offset`.
///
/// # Arguments
///
/// * `root_offset` - absolute offset of the node to start from; doesn't need
///   to be the hive's root.
/// * `flags` - traversal options; see [`VisitFlags`].
/// * `visitor` - receives the node/value callbacks.
///
/// # Errors
///
/// Under `flags.skip_bad == false`, returns the first structural error
/// encountered (malformed node, cycle, bad child/value offset). Under
/// `skip_bad`, structural errors are logged and skipped instead; only an
/// `Err` returned from a `visitor` callback itself aborts the traversal.
pub fn visit(
    data: &[u8],
    block_map: &BlockMap,
    limits: &Limits,
    root_offset: u32,
    flags: VisitFlags,
    visitor: &mut impl Visitor,
) -> Result<()> {
    let mut unvisited = block_map.clone();
    visit_node(data, block_map, &mut unvisited, limits, root_offset, flags, visitor)
}

fn visit_node(
    data: &[u8],
    block_map: &BlockMap,
    unvisited: &mut BlockMap,
    limits: &Limits,
    offset: u32,
    flags: VisitFlags,
    visitor: &mut impl Visitor,
) -> Result<()> {
    if !unvisited.test(offset) {
        if flags.skip_bad {
            warn!(offset, "cycle detected, not revisiting");
            return Ok(());
        }
        return Err(RegistryError::Loop { offset });
    }
    unvisited.clear(offset);

    let node = match navigator::node_at(data, block_map, offset) {
        Ok(node) => node,
        Err(e) => return demote(flags, e, || warn!(offset, "skipping malformed node")),
    };

    visitor.node_start(offset, &node.name)?;

    let values = match navigator::node_values(data, block_map, offset) {
        Ok(v) => v,
        Err(e) => {
            demote(flags, e, || warn!(offset, "skipping malformed value list"))?;
            Vec::new()
        }
    };
    for vk_offset in values {
        if let Err(e) = dispatch_value(data, block_map, limits, vk_offset, visitor) {
            demote(flags, e, || warn!(vk_offset, "skipping malformed value"))?;
        }
    }

    let children = if flags.skip_bad {
        navigator::node_children_lenient(data, block_map, &node)
    } else {
        navigator::node_children(data, block_map, offset)?
    };
    for child in children {
        visit_node(data, block_map, unvisited, limits, child, flags, visitor)?;
    }

    visitor.node_end(offset, &node.name)
}

/// Demotes a structural error to `Ok(())` under `skip_bad` (invoking `log`
/// for the side-effecting warning first), otherwise returns it.
fn demote(flags: VisitFlags, err: RegistryError, log: impl FnOnce()) -> Result<()> {
    if flags.skip_bad {
        log();
        Ok(())
    } else {
        Err(err)
    }
}

fn dispatch_value(
    data: &[u8],
    block_map: &BlockMap,
    limits: &Limits,
    vk_offset: u32,
    visitor: &mut impl Visitor,
) -> Result<()> {
    let vk = navigator::value_at(data, block_map, vk_offset)?;
    let raw = navigator::value_raw(data, block_map, &vk, limits)?;

    if let Some(result) = visitor.value_any(&vk.name, vk.data_type, &raw) {
        return result;
    }

    match ValueData::parse(&raw, vk.data_type, vk_offset) {
        Ok(ValueData::String(s)) => visitor.value_string(&vk.name, &s),
        Ok(ValueData::ExpandString(s)) => visitor.value_expand_string(&vk.name, &s),
        Ok(ValueData::Link(s)) => visitor.value_link(&vk.name, &s),
        Ok(ValueData::Binary(b)) => visitor.value_binary(&vk.name, &b),
        Ok(ValueData::Dword(d)) => visitor.value_dword(&vk.name, d),
        Ok(ValueData::DwordBigEndian(d)) => visitor.value_dword_be(&vk.name, d),
        Ok(ValueData::Qword(q)) => visitor.value_qword(&vk.name, q),
        Ok(ValueData::MultiString(strings)) => visitor.value_multi_string(&vk.name, &strings),
        Ok(ValueData::None) => visitor.value_none(&vk.name),
        Ok(ValueData::Unknown(b)) => visitor.value_unknown(&vk.name, &b),
        Err(e) if e.kind() == ErrorKind::InvalidEncoding => {
            visitor.value_string_invalid_utf16(&vk.name, &raw)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::load;

    #[derive(Default)]
    struct RecordingVisitor {
        node_names: Vec<String>,
        dwords: Vec<(String, u32)>,
    }

    impl Visitor for RecordingVisitor {
        fn node_start(&mut self, _offset: u32, name: &str) -> Result<()> {
            self.node_names.push(name.to_string());
            Ok(())
        }

        fn value_dword(&mut self, name: &str, value: u32) -> Result<()> {
            self.dwords.push((name.to_string(), value));
            Ok(())
        }
    }

    #[test]
    fn test_visits_root_only_hive() {
        let data = crate::testutil::minimal_hive("ROOT");
        let loaded = load(&data).unwrap();
        let root = navigator::root(&data, &loaded.block_map, loaded.base_block.root_cell_offset).unwrap();

        let mut v = RecordingVisitor::default();
        visit(&data, &loaded.block_map, &Limits::default(), root, VisitFlags::default(), &mut v).unwrap();
        assert_eq!(v.node_names, vec!["ROOT".to_string()]);
    }

    #[test]
    fn test_skip_bad_allows_visiting_despite_a_bad_sibling() {
        // A deliberately malformed lh leaf: one entry points at a valid nk,
        // the other at an offset that was never validated by the loader.
        let mut data = crate::testutil::minimal_hive("ROOT");
        data.extend(std::iter::repeat(0u8).take(crate::testutil::PAGE_SIZE));
        let hbin2 = crate::header::BASE_BLOCK_SIZE + crate::testutil::PAGE_SIZE;
        crate::hbin::HbinHeader::write_header(
            &mut data,
            hbin2,
            crate::testutil::PAGE_SIZE as u32,
            crate::testutil::PAGE_SIZE as u32,
        )
        .unwrap();

        // Good child "Good" at hbin2 + 0x20.
        let child_start = hbin2 + 0x20;
        let child_body_len = crate::testutil::nk_size(4);
        let child_cell_len = (4 + child_body_len + 3) & !3;
        crate::testutil::write_used_cell_header(&mut data, child_start, child_cell_len as i32);
        crate::testutil::write_nk(
            &mut data,
            child_start + 4,
            0x0020,
            0x20, // parent = root
            0,
            0xFFFF_FFFF,
            0,
            0xFFFF_FFFF,
            "Good",
        );
        let good_rel = (child_start - crate::header::BASE_BLOCK_SIZE) as u32;

        // lh leaf with one good entry and one entry pointing nowhere valid.
        let leaf_start = child_start + child_cell_len;
        let leaf_body_len = crate::testutil::lh_size(2);
        let leaf_cell_len = (4 + leaf_body_len + 3) & !3;
        crate::testutil::write_used_cell_header(&mut data, leaf_start, leaf_cell_len as i32);
        crate::testutil::write_lh(
            &mut data,
            leaf_start + 4,
            &[(good_rel, crate::subkey_list::lh_hash("Good")), (0x7FFF_0000, 0)],
        );
        let leaf_rel = (leaf_start - crate::header::BASE_BLOCK_SIZE) as u32;

        let free_start = leaf_start + leaf_cell_len;
        let free_len = (hbin2 + crate::testutil::PAGE_SIZE) - free_start;
        crate::testutil::write_free_cell_header(&mut data, free_start, free_len as i32);

        // Point root at the new leaf with subkey_count = 2.
        data[0x1020 + 4 + 0x14..0x1020 + 4 + 0x18].copy_from_slice(&2u32.to_le_bytes());
        data[0x1020 + 4 + 0x1C..0x1020 + 4 + 0x20].copy_from_slice(&leaf_rel.to_le_bytes());

        // hive_length covers two pages now.
        data[0x28..0x2C].copy_from_slice(&(2 * crate::testutil::PAGE_SIZE as u32).to_le_bytes());
        let checksum = crate::utils::calculate_checksum(&data);
        data[0x1FC..0x200].copy_from_slice(&checksum.to_le_bytes());

        let loaded = load(&data).unwrap();
        let root = navigator::root(&data, &loaded.block_map, loaded.base_block.root_cell_offset).unwrap();

        let mut strict = RecordingVisitor::default();
        let strict_result = visit(
            &data,
            &loaded.block_map,
            &Limits::default(),
            root,
            VisitFlags::default(),
            &mut strict,
        );
        assert!(strict_result.is_err());

        let mut lenient = RecordingVisitor::default();
        visit(
            &data,
            &loaded.block_map,
            &Limits::default(),
            root,
            VisitFlags { skip_bad: true },
            &mut lenient,
        )
        .unwrap();
        assert_eq!(lenient.node_names, vec!["ROOT".to_string(), "Good".to_string()]);
    }
}
