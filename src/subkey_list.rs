//! Subkey list parsing (lf, lh, li, ri).
//!
//! Registry keys can have multiple subkeys, which are organized in various
//! list structures for efficient lookup.

use crate::error::{RegistryError, Result};
use crate::utils::read_u32_le;

/// Subkey list types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubkeyListType {
    /// Index leaf (li) - simple list of offsets.
    IndexLeaf,
    
    /// Fast leaf (lf) - list with 4-byte name hints.
    FastLeaf,
    
    /// Hash leaf (lh) - list with name hash hints.
    HashLeaf,
    
    /// Index root (ri) - list of subkey list offsets.
    IndexRoot,
}

impl SubkeyListType {
    /// Parses a subkey list type from a 2-byte signature.
    pub fn from_signature(sig: &[u8; 2]) -> Result<Self> {
        match sig {
            b"li" => Ok(SubkeyListType::IndexLeaf),
            b"lf" => Ok(SubkeyListType::FastLeaf),
            b"lh" => Ok(SubkeyListType::HashLeaf),
            b"ri" => Ok(SubkeyListType::IndexRoot),
            _ => Err(RegistryError::InvalidSubkeyList { list_type: *sig }),
        }
    }
}

/// Subkey list entry (for lf/lh lists).
#[derive(Debug, Clone)]
pub struct SubkeyListEntry {
    /// Offset to the key node.
    pub key_offset: u32,
    
    /// Name hint (first 4 chars for lf, hash for lh).
    pub name_hint: u32,
}

/// Parsed subkey list.
#[derive(Debug, Clone)]
pub enum SubkeyList {
    /// Index leaf - simple list of offsets.
    IndexLeaf(Vec<u32>),

    /// Fast leaf (`lf`) or hash leaf (`lh`) - list with hints. The tag
    /// records which of the two it was, since the writer must preserve the
    /// original hashing scheme when rewriting a list in place.
    LeafWithHints(SubkeyListType, Vec<SubkeyListEntry>),

    /// Index root - list of sublist offsets.
    IndexRoot(Vec<u32>),
}

impl SubkeyList {
    /// Parses a subkey list from cell data.
    ///
    /// # Arguments
    ///
    /// * `data` - Cell data (excluding size field).
    /// * `offset` - Offset of this cell for error reporting.
    pub fn parse(data: &[u8], offset: u32) -> Result<Self> {
        if data.len() < 4 {
            return Err(RegistryError::TruncatedData {
                offset,
                expected: 4,
                actual: data.len(),
            });
        }

        let sig = [data[0], data[1]];
        let list_type = SubkeyListType::from_signature(&sig)?;
        
        let count = u16::from_le_bytes([data[2], data[3]]) as usize;

        match list_type {
            SubkeyListType::IndexLeaf => {
                // li: signature (2) + count (2) + offsets (4 * count)
                let expected_size = 4 + (count * 4);
                if data.len() < expected_size {
                    return Err(RegistryError::TruncatedData {
                        offset,
                        expected: expected_size,
                        actual: data.len(),
                    });
                }

                let mut offsets = Vec::with_capacity(count);
                for i in 0..count {
                    let offset_pos = 4 + (i * 4);
                    offsets.push(read_u32_le(data, offset_pos)?);
                }

                Ok(SubkeyList::IndexLeaf(offsets))
            }

            SubkeyListType::FastLeaf | SubkeyListType::HashLeaf => {
                // lf/lh: signature (2) + count (2) + entries (8 * count)
                // Each entry: offset (4) + hint (4)
                let expected_size = 4 + (count * 8);
                if data.len() < expected_size {
                    return Err(RegistryError::TruncatedData {
                        offset,
                        expected: expected_size,
                        actual: data.len(),
                    });
                }

                let mut entries = Vec::with_capacity(count);
                for i in 0..count {
                    let entry_pos = 4 + (i * 8);
                    let key_offset = read_u32_le(data, entry_pos)?;
                    let name_hint = read_u32_le(data, entry_pos + 4)?;
                    
                    entries.push(SubkeyListEntry {
                        key_offset,
                        name_hint,
                    });
                }

                Ok(SubkeyList::LeafWithHints(list_type, entries))
            }

            SubkeyListType::IndexRoot => {
                // ri: signature (2) + count (2) + offsets (4 * count)
                let expected_size = 4 + (count * 4);
                if data.len() < expected_size {
                    return Err(RegistryError::TruncatedData {
                        offset,
                        expected: expected_size,
                        actual: data.len(),
                    });
                }

                let mut offsets = Vec::with_capacity(count);
                for i in 0..count {
                    let offset_pos = 4 + (i * 4);
                    offsets.push(read_u32_le(data, offset_pos)?);
                }

                Ok(SubkeyList::IndexRoot(offsets))
            }
        }
    }

    /// Returns all key offsets from this list.
    ///
    /// For IndexRoot lists, this only returns the sublist offsets,
    /// not the actual key offsets.
    ///
    /// This method returns a slice to avoid unnecessary cloning.
    /// For LeafWithHints, use `key_offsets_iter()` instead.
    pub fn key_offsets(&self) -> &[u32] {
        match self {
            SubkeyList::IndexLeaf(offsets) => offsets,
            SubkeyList::IndexRoot(offsets) => offsets,
            SubkeyList::LeafWithHints(_, _) => {
                // For this variant, offsets need to be extracted
                // Callers should use key_offsets_iter() for this case
                &[]
            }
        }
    }
    
    /// Returns an iterator over key offsets.
    ///
    /// This is more efficient than `key_offsets()` for LeafWithHints
    /// as it avoids allocating a temporary vector.
    pub fn key_offsets_iter(&self) -> impl Iterator<Item = u32> + '_ {
        match self {
            SubkeyList::IndexLeaf(offsets) => {
                Box::new(offsets.iter().copied()) as Box<dyn Iterator<Item = u32> + '_>
            }
            SubkeyList::LeafWithHints(_, entries) => {
                Box::new(entries.iter().map(|e| e.key_offset))
            }
            SubkeyList::IndexRoot(offsets) => {
                Box::new(offsets.iter().copied())
            }
        }
    }

    /// Returns the number of entries in this list.
    pub fn len(&self) -> usize {
        match self {
            SubkeyList::IndexLeaf(offsets) => offsets.len(),
            SubkeyList::LeafWithHints(_, entries) => entries.len(),
            SubkeyList::IndexRoot(offsets) => offsets.len(),
        }
    }

    /// Returns true if this list is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if this is an index root (contains sublists).
    pub fn is_index_root(&self) -> bool {
        matches!(self, SubkeyList::IndexRoot(_))
    }

    /// Serializes this list back to its cell-body bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            SubkeyList::IndexLeaf(offsets) => {
                let mut buf = vec![0u8; 4 + offsets.len() * 4];
                buf[0..2].copy_from_slice(b"li");
                buf[2..4].copy_from_slice(&(offsets.len() as u16).to_le_bytes());
                for (i, off) in offsets.iter().enumerate() {
                    let pos = 4 + i * 4;
                    buf[pos..pos + 4].copy_from_slice(&off.to_le_bytes());
                }
                buf
            }
            SubkeyList::IndexRoot(offsets) => {
                let mut buf = vec![0u8; 4 + offsets.len() * 4];
                buf[0..2].copy_from_slice(b"ri");
                buf[2..4].copy_from_slice(&(offsets.len() as u16).to_le_bytes());
                for (i, off) in offsets.iter().enumerate() {
                    let pos = 4 + i * 4;
                    buf[pos..pos + 4].copy_from_slice(&off.to_le_bytes());
                }
                buf
            }
            SubkeyList::LeafWithHints(kind, entries) => {
                let mut buf = vec![0u8; 4 + entries.len() * 8];
                buf[0..2].copy_from_slice(kind.signature());
                buf[2..4].copy_from_slice(&(entries.len() as u16).to_le_bytes());
                for (i, entry) in entries.iter().enumerate() {
                    let pos = 4 + i * 8;
                    buf[pos..pos + 4].copy_from_slice(&entry.key_offset.to_le_bytes());
                    buf[pos + 4..pos + 8].copy_from_slice(&entry.name_hint.to_le_bytes());
                }
                buf
            }
        }
    }
}

impl SubkeyListType {
    /// The 2-byte on-disk signature for this list type.
    pub fn signature(&self) -> &'static [u8; 2] {
        match self {
            SubkeyListType::IndexLeaf => b"li",
            SubkeyListType::FastLeaf => b"lf",
            SubkeyListType::HashLeaf => b"lh",
            SubkeyListType::IndexRoot => b"ri",
        }
    }
}

/// Computes the `lh` name hint: `h := h*37 + toupper(c)` over the UTF-16
/// code units of `name`, matching the algorithm the Windows kernel uses.
pub fn lh_hash(name: &str) -> u32 {
    let mut h: u32 = 0;
    for unit in name.encode_utf16() {
        let upper = (unit as u32).min(0xFFFF);
        let upper = char::from_u32(upper)
            .map(|c| c.to_ascii_uppercase() as u32)
            .unwrap_or(upper);
        h = h.wrapping_mul(37).wrapping_add(upper);
    }
    h
}

/// Computes the `lf` name hint: the first four bytes of `name` (uppercased,
/// ASCII-only), zero-padded if shorter.
pub fn lf_hash(name: &str) -> u32 {
    let mut bytes = [0u8; 4];
    for (i, b) in name.bytes().take(4).enumerate() {
        bytes[i] = b.to_ascii_uppercase();
    }
    u32::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subkey_list_type() {
        assert_eq!(
            SubkeyListType::from_signature(b"li").unwrap(),
            SubkeyListType::IndexLeaf
        );
        assert_eq!(
            SubkeyListType::from_signature(b"lf").unwrap(),
            SubkeyListType::FastLeaf
        );
        assert_eq!(
            SubkeyListType::from_signature(b"lh").unwrap(),
            SubkeyListType::HashLeaf
        );
        assert_eq!(
            SubkeyListType::from_signature(b"ri").unwrap(),
            SubkeyListType::IndexRoot
        );
    }

    #[test]
    fn test_invalid_signature() {
        let result = SubkeyListType::from_signature(b"XX");
        assert!(result.is_err());
    }

    #[test]
    fn lh_hash_is_case_insensitive() {
        assert_eq!(lh_hash("abc"), lh_hash("ABC"));
    }

    #[test]
    fn lf_hash_takes_first_four_bytes_uppercased() {
        let hash = lf_hash("abcdef");
        let bytes = hash.to_le_bytes();
        assert_eq!(&bytes, b"ABCD");
    }

    #[test]
    fn lf_hash_zero_pads_short_names() {
        let hash = lf_hash("ab");
        let bytes = hash.to_le_bytes();
        assert_eq!(&bytes[0..2], b"AB");
        assert_eq!(&bytes[2..4], &[0, 0]);
    }

    #[test]
    fn index_leaf_round_trips_through_bytes() {
        let list = SubkeyList::IndexLeaf(vec![0x1000, 0x2000]);
        let bytes = list.to_bytes();
        let parsed = SubkeyList::parse(&bytes, 0).unwrap();
        assert_eq!(parsed.key_offsets_iter().collect::<Vec<_>>(), vec![0x1000, 0x2000]);
    }

    #[test]
    fn hash_leaf_round_trips_through_bytes() {
        let list = SubkeyList::LeafWithHints(
            SubkeyListType::HashLeaf,
            vec![SubkeyListEntry { key_offset: 0x1020, name_hint: lh_hash("Foo") }],
        );
        let bytes = list.to_bytes();
        assert_eq!(&bytes[0..2], b"lh");
        let parsed = SubkeyList::parse(&bytes, 0).unwrap();
        match parsed {
            SubkeyList::LeafWithHints(SubkeyListType::HashLeaf, entries) => {
                assert_eq!(entries[0].key_offset, 0x1020);
                assert_eq!(entries[0].name_hint, lh_hash("Foo"));
            }
            other => panic!("expected hash leaf, got {:?}", other),
        }
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn reference_lh_hash(name: &str) -> u32 {
        let mut h: u32 = 0;
        for c in name.chars() {
            h = h.wrapping_mul(37).wrapping_add(c.to_ascii_uppercase() as u32);
        }
        h
    }

    proptest! {
        /// `lh`'s stored hash always equals the `h := h*37 + toupper(c)`
        /// accumulator over the name (spec.md §8, "Hash property").
        #[test]
        fn lh_hash_matches_accumulator_formula(name in "[a-zA-Z0-9_. ]{0,32}") {
            prop_assert_eq!(lh_hash(&name), reference_lh_hash(&name));
        }

        /// Case never changes the hash: the accumulator only ever sees
        /// uppercased code units.
        #[test]
        fn lh_hash_is_case_insensitive_for_any_ascii_name(name in "[a-zA-Z0-9_. ]{0,32}") {
            prop_assert_eq!(lh_hash(&name), lh_hash(&name.to_uppercase()));
            prop_assert_eq!(lh_hash(&name), lh_hash(&name.to_lowercase()));
        }

        /// A hash/offset entry round-trips through `lh` serialization for any
        /// offset and any name's hash.
        #[test]
        fn hash_leaf_entry_round_trips(offset in 0u32..0x1000_0000, name in "[a-zA-Z0-9_]{1,16}") {
            let list = SubkeyList::LeafWithHints(
                SubkeyListType::HashLeaf,
                vec![SubkeyListEntry { key_offset: offset, name_hint: lh_hash(&name) }],
            );
            let bytes = list.to_bytes();
            let parsed = SubkeyList::parse(&bytes, 0).unwrap();
            match parsed {
                SubkeyList::LeafWithHints(SubkeyListType::HashLeaf, entries) => {
                    prop_assert_eq!(entries[0].key_offset, offset);
                    prop_assert_eq!(entries[0].name_hint, lh_hash(&name));
                }
                other => prop_assert!(false, "expected hash leaf, got {:?}", other),
            }
        }
    }
}
