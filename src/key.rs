//! Registry key node (nk) parsing, representation, and serialization.

use crate::cell::KeyNodeFlags;
use crate::error::{RegistryError, Result};
use crate::utils::{read_ascii_string, read_u16_le, read_u32_le, read_utf16_string};

/// Minimum size of a key node structure in bytes.
pub const KEY_NODE_MIN_SIZE: usize = 76;

/// Offset of the key name in the key node structure.
pub const KEY_NAME_OFFSET: usize = 0x4C;

/// Offset of the `subkey_count` field.
pub const SUBKEY_COUNT_FIELD_OFFSET: usize = 0x14;
/// Offset of the `subkey_list_offset` field.
pub const SUBKEY_LIST_OFFSET_FIELD_OFFSET: usize = 0x1C;
/// Offset of the `value_count` field.
pub const VALUE_COUNT_FIELD_OFFSET: usize = 0x24;
/// Offset of the `value_list_offset` field.
pub const VALUE_LIST_OFFSET_FIELD_OFFSET: usize = 0x28;
/// Offset of the `security_offset` field.
pub const SECURITY_OFFSET_FIELD_OFFSET: usize = 0x2C;
/// Offset of the `max_subkey_name_len` field.
pub const MAX_SUBKEY_NAME_LEN_FIELD_OFFSET: usize = 0x34;
/// Offset of the `max_value_name_len` field.
pub const MAX_VALUE_NAME_LEN_FIELD_OFFSET: usize = 0x3C;
/// Offset of the `max_value_data_len` field.
pub const MAX_VALUE_DATA_LEN_FIELD_OFFSET: usize = 0x40;

/// Key node (nk) structure.
///
/// Represents a registry key with metadata including name, timestamps,
/// and references to subkeys and values.
#[derive(Debug, Clone)]
pub struct KeyNode {
    /// Flags for this key.
    pub flags: KeyNodeFlags,
    
    /// Last written timestamp (Windows FILETIME).
    pub last_written: u64,
    
    /// Access bits (unused).
    pub access_bits: u32,
    
    /// Offset to parent key node.
    pub parent_offset: u32,
    
    /// Number of subkeys.
    pub subkey_count: u32,
    
    /// Number of volatile subkeys.
    pub volatile_subkey_count: u32,
    
    /// Offset to subkey list.
    pub subkey_list_offset: u32,
    
    /// Offset to volatile subkey list.
    pub volatile_subkey_list_offset: u32,
    
    /// Number of values.
    pub value_count: u32,
    
    /// Offset to value list.
    pub value_list_offset: u32,
    
    /// Offset to security descriptor.
    pub security_offset: u32,
    
    /// Offset to class name.
    pub class_name_offset: u32,
    
    /// Maximum length of subkey name.
    pub max_subkey_name_len: u32,
    
    /// Maximum length of subkey class name.
    pub max_subkey_class_len: u32,
    
    /// Maximum length of value name.
    pub max_value_name_len: u32,
    
    /// Maximum length of value data.
    pub max_value_data_len: u32,
    
    /// Work variable (unused).
    pub work_var: u32,
    
    /// Length of key name.
    pub name_length: u16,
    
    /// Length of class name.
    pub class_name_length: u16,
    
    /// Key name.
    pub name: String,
}

impl KeyNode {
    /// Parses a key node from cell data.
    ///
    /// # Arguments
    ///
    /// * `data` - Cell data (excluding size field, starting with "nk" signature).
    /// * `offset` - Offset of this cell for error reporting.
    ///
    /// # Errors
    ///
    /// Returns an error if the data is malformed or truncated.
    pub fn parse(data: &[u8], offset: u32) -> Result<Self> {
        if data.len() < KEY_NODE_MIN_SIZE {
            return Err(RegistryError::TruncatedData {
                offset,
                expected: KEY_NODE_MIN_SIZE,
                actual: data.len(),
            });
        }

        // Verify signature
        if &data[0..2] != b"nk" {
            return Err(RegistryError::InvalidFormat(format!(
                "Expected 'nk' signature at offset {:#x}",
                offset
            )));
        }

        let flags = KeyNodeFlags::new(read_u16_le(data, 0x02)?);
        
        // Last written timestamp at offset 0x04 (8 bytes)
        let last_written = u64::from(read_u32_le(data, 0x04)?)
            | (u64::from(read_u32_le(data, 0x08)?) << 32);
        
        let access_bits = read_u32_le(data, 0x0C)?;
        let parent_offset = read_u32_le(data, 0x10)?;
        let subkey_count = read_u32_le(data, 0x14)?;
        let volatile_subkey_count = read_u32_le(data, 0x18)?;
        let subkey_list_offset = read_u32_le(data, 0x1C)?;
        let volatile_subkey_list_offset = read_u32_le(data, 0x20)?;
        let value_count = read_u32_le(data, 0x24)?;
        let value_list_offset = read_u32_le(data, 0x28)?;
        let security_offset = read_u32_le(data, 0x2C)?;
        let class_name_offset = read_u32_le(data, 0x30)?;
        
        let max_subkey_name_len = read_u32_le(data, 0x34)?;
        let max_subkey_class_len = read_u32_le(data, 0x38)?;
        let max_value_name_len = read_u32_le(data, 0x3C)?;
        let max_value_data_len = read_u32_le(data, 0x40)?;
        let work_var = read_u32_le(data, 0x44)?;
        
        let name_length = read_u16_le(data, 0x48)?;
        let class_name_length = read_u16_le(data, 0x4A)?;
        
        // Key name starts at offset 0x4C
        let name = if name_length > 0 {
            let name_end = 0x4C + name_length as usize;
            if name_end > data.len() {
                return Err(RegistryError::TruncatedData {
                    offset,
                    expected: name_end,
                    actual: data.len(),
                });
            }
            
            let name_data = &data[0x4C..name_end];
            
            if flags.is_compressed() {
                // ASCII name
                read_ascii_string(name_data)
            } else {
                // UTF-16LE name
                read_utf16_string(name_data, offset)?
            }
        } else {
            String::new()
        };

        Ok(KeyNode {
            flags,
            last_written,
            access_bits,
            parent_offset,
            subkey_count,
            volatile_subkey_count,
            subkey_list_offset,
            volatile_subkey_list_offset,
            value_count,
            value_list_offset,
            security_offset,
            class_name_offset,
            max_subkey_name_len,
            max_subkey_class_len,
            max_value_name_len,
            max_value_data_len,
            work_var,
            name_length,
            class_name_length,
            name,
        })
    }

    /// Returns true if this key has subkeys.
    pub fn has_subkeys(&self) -> bool {
        self.subkey_count > 0
    }

    /// Returns true if this key has values.
    pub fn has_values(&self) -> bool {
        self.value_count > 0
    }

    /// Returns true if this is the root key.
    pub fn is_root(&self) -> bool {
        self.flags.is_root()
    }

    /// Serializes a fresh `nk` record body for a newly-created key.
    ///
    /// Used by the writer's `add_child`; subkey/value counts and list
    /// offsets start empty (`0` / sentinel `0xFFFFFFFF`) and are patched in
    /// place as children and values are attached.
    pub fn to_bytes(parent_offset: u32, name: &str) -> Vec<u8> {
        let mut buf = vec![0u8; KEY_NODE_MIN_SIZE + name.len()];
        buf[0..2].copy_from_slice(b"nk");
        buf[0x02..0x04].copy_from_slice(&KeyNodeFlags::COMP_NAME.to_le_bytes());
        buf[0x10..0x14].copy_from_slice(&parent_offset.to_le_bytes());
        buf[SUBKEY_COUNT_FIELD_OFFSET..SUBKEY_COUNT_FIELD_OFFSET + 4]
            .copy_from_slice(&0u32.to_le_bytes());
        buf[SUBKEY_LIST_OFFSET_FIELD_OFFSET..SUBKEY_LIST_OFFSET_FIELD_OFFSET + 4]
            .copy_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
        buf[0x20..0x24].copy_from_slice(&0xFFFF_FFFFu32.to_le_bytes()); // volatile list
        buf[VALUE_COUNT_FIELD_OFFSET..VALUE_COUNT_FIELD_OFFSET + 4]
            .copy_from_slice(&0u32.to_le_bytes());
        buf[VALUE_LIST_OFFSET_FIELD_OFFSET..VALUE_LIST_OFFSET_FIELD_OFFSET + 4]
            .copy_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
        buf[SECURITY_OFFSET_FIELD_OFFSET..SECURITY_OFFSET_FIELD_OFFSET + 4]
            .copy_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
        buf[0x30..0x34].copy_from_slice(&0xFFFF_FFFFu32.to_le_bytes()); // classname offset
        buf[0x48..0x4A].copy_from_slice(&(name.len() as u16).to_le_bytes());
        buf[KEY_NAME_OFFSET..KEY_NAME_OFFSET + name.len()].copy_from_slice(name.as_bytes());
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_node_minimum_size() {
        let data = vec![0u8; 75];
        let result = KeyNode::parse(&data, 0);
        assert!(result.is_err());
    }

    #[test]
    fn test_key_node_invalid_signature() {
        let mut data = vec![0u8; 80];
        data[0..2].copy_from_slice(b"XX");
        let result = KeyNode::parse(&data, 0);
        assert!(result.is_err());
    }

    #[test]
    fn to_bytes_roundtrips_through_parse() {
        let bytes = KeyNode::to_bytes(0x1020, "Child");
        let node = KeyNode::parse(&bytes, 0x2000).unwrap();
        assert_eq!(node.name, "Child");
        assert_eq!(node.parent_offset, 0x1020);
        assert_eq!(node.subkey_count, 0);
        assert_eq!(node.value_count, 0);
        assert!(!node.has_subkeys());
        assert!(!node.has_values());
        assert!(node.flags.is_compressed());
    }
}
