//! Registry value (vk) parsing, data extraction, and serialization.

use crate::cell::ValueType;
use crate::error::{RegistryError, Result};
use crate::utils::{
    read_ascii_string, read_i32_le, read_u16_le, read_u32_le, read_utf16_string,
    split_multi_strings, write_multi_strings, write_utf16_string,
};
use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// Value key (vk) structure.
///
/// Represents a registry value with its name, type, and data.
#[derive(Debug, Clone)]
pub struct ValueKey {
    /// Length of value name.
    pub name_length: u16,
    
    /// Length of value data.
    pub data_length: u32,
    
    /// Offset to value data (or inline data if length <= 4).
    pub data_offset: u32,
    
    /// Value data type.
    pub data_type: ValueType,
    
    /// Flags (0x0001 = name is ASCII).
    pub flags: u16,
    
    /// Value name.
    pub name: String,
}

impl ValueKey {
    /// Parses a value key from cell data.
    ///
    /// # Arguments
    ///
    /// * `data` - Cell data (excluding size field, starting with "vk" signature).
    /// * `offset` - Offset of this cell for error reporting.
    ///
    /// # Errors
    ///
    /// Returns an error if the data is malformed or truncated.
    pub fn parse(data: &[u8], offset: u32) -> Result<Self> {
        if data.len() < 20 {
            return Err(RegistryError::TruncatedData {
                offset,
                expected: 20,
                actual: data.len(),
            });
        }

        // Verify signature
        if &data[0..2] != b"vk" {
            return Err(RegistryError::InvalidFormat(format!(
                "Expected 'vk' signature at offset {:#x}",
                offset
            )));
        }

        let name_length = read_u16_le(data, 0x02)?;
        
        // Data length is stored as i32, with high bit indicating inline data
        let data_length_raw = read_i32_le(data, 0x04)?;
        let data_length = (data_length_raw & 0x7FFFFFFF) as u32;
        
        let data_offset = read_u32_le(data, 0x08)?;
        let data_type_raw = read_u32_le(data, 0x0C)?;
        let data_type = ValueType::from_u32(data_type_raw)?;
        let flags = read_u16_le(data, 0x10)?;
        
        // Spare field at 0x12 (2 bytes) - unused
        
        // Value name starts at offset 0x14
        let name = if name_length > 0 {
            let name_end = 0x14 + name_length as usize;
            if name_end > data.len() {
                return Err(RegistryError::TruncatedData {
                    offset,
                    expected: name_end,
                    actual: data.len(),
                });
            }
            
            let name_data = &data[0x14..name_end];
            
            // Check if name is ASCII (flag 0x0001)
            if (flags & 0x0001) != 0 {
                read_ascii_string(name_data)
            } else {
                read_utf16_string(name_data, offset)?
            }
        } else {
            // Default value (unnamed) - use lowercase to match regipy convention
            String::from("(default)")
        };

        Ok(ValueKey {
            name_length,
            data_length,
            data_offset,
            data_type,
            flags,
            name,
        })
    }

    /// Returns true if the data is stored inline (in the data_offset field).
    pub fn is_inline_data(&self) -> bool {
        self.data_length <= 4 && self.data_length > 0
    }

    /// Extracts inline data (when data_length <= 4).
    pub fn inline_data(&self) -> Vec<u8> {
        let bytes = self.data_offset.to_le_bytes();
        bytes[..self.data_length as usize].to_vec()
    }

    /// Serializes a `vk` record body, the inverse of [`ValueKey::parse`].
    ///
    /// `data_length` and `data_offset` encode the resolved storage: for
    /// inline data (`<= 4` bytes) the caller passes the top bit set on
    /// `data_length` and the raw bytes packed into `data_offset`; for
    /// out-of-line data `data_offset` is the cell offset of the data block.
    pub fn to_bytes(name: &str, value_type: ValueType, data_length: u32, data_offset: u32) -> Vec<u8> {
        let mut buf = vec![0u8; 0x14 + name.len()];
        buf[0..2].copy_from_slice(b"vk");
        buf[0x02..0x04].copy_from_slice(&(name.len() as u16).to_le_bytes());
        buf[0x04..0x08].copy_from_slice(&data_length.to_le_bytes());
        buf[0x08..0x0C].copy_from_slice(&data_offset.to_le_bytes());
        buf[0x0C..0x10].copy_from_slice(&value_type.to_u32().to_le_bytes());
        buf[0x10..0x12].copy_from_slice(&1u16.to_le_bytes()); // name is ASCII
        buf[0x12..0x14].copy_from_slice(&0u16.to_le_bytes());
        buf[0x14..0x14 + name.len()].copy_from_slice(name.as_bytes());
        buf
    }
}

/// Parsed registry value data.
#[derive(Debug, Clone)]
pub enum ValueData {
    /// No data.
    None,
    
    /// String value.
    String(String),
    
    /// Expandable string value.
    ExpandString(String),
    
    /// Binary data.
    Binary(Vec<u8>),
    
    /// 32-bit integer.
    Dword(u32),
    
    /// 32-bit big-endian integer.
    DwordBigEndian(u32),
    
    /// Multiple strings.
    MultiString(Vec<String>),

    /// 64-bit integer.
    Qword(u64),

    /// Symbolic link target (UTF-16LE string, same wire shape as `String`).
    Link(String),

    /// Unknown or unsupported type.
    Unknown(Vec<u8>),
}

impl ValueData {
    /// Parses value data based on the value type.
    ///
    /// # Arguments
    ///
    /// * `data` - Raw value data bytes.
    /// * `value_type` - Type of the value.
    /// * `offset` - Offset for error reporting.
    pub fn parse(data: &[u8], value_type: ValueType, offset: u32) -> Result<Self> {
        if data.is_empty() {
            return Ok(ValueData::None);
        }

        match value_type {
            ValueType::None => Ok(ValueData::None),
            
            ValueType::String | ValueType::ExpandString => {
                let s = read_utf16_string(data, offset)?;
                if value_type == ValueType::String {
                    Ok(ValueData::String(s))
                } else {
                    Ok(ValueData::ExpandString(s))
                }
            }
            
            ValueType::Link => {
                let s = read_utf16_string(data, offset)?;
                Ok(ValueData::Link(s))
            }

            ValueType::Binary => Ok(ValueData::Binary(data.to_vec())),
            
            ValueType::Dword => {
                if data.len() < 4 {
                    return Err(RegistryError::TruncatedData {
                        offset,
                        expected: 4,
                        actual: data.len(),
                    });
                }
                let mut cursor = Cursor::new(data);
                let value = cursor.read_u32::<LittleEndian>()?;
                Ok(ValueData::Dword(value))
            }
            
            ValueType::DwordBigEndian => {
                if data.len() < 4 {
                    return Err(RegistryError::TruncatedData {
                        offset,
                        expected: 4,
                        actual: data.len(),
                    });
                }
                let mut cursor = Cursor::new(data);
                let value = cursor.read_u32::<BigEndian>()?;
                Ok(ValueData::DwordBigEndian(value))
            }
            
            ValueType::Qword => {
                if data.len() < 8 {
                    return Err(RegistryError::TruncatedData {
                        offset,
                        expected: 8,
                        actual: data.len(),
                    });
                }
                let mut cursor = Cursor::new(data);
                let value = cursor.read_u64::<LittleEndian>()?;
                Ok(ValueData::Qword(value))
            }
            
            ValueType::MultiString => {
                let strings = split_multi_strings(data, offset)?;
                Ok(ValueData::MultiString(strings))
            }
            
            // For other types, return raw binary data
            _ => Ok(ValueData::Unknown(data.to_vec())),
        }
    }

    /// Converts the value data to a string representation.
    pub fn to_string(&self) -> String {
        match self {
            ValueData::None => String::from("(none)"),
            ValueData::String(s) | ValueData::ExpandString(s) | ValueData::Link(s) => s.clone(),
            ValueData::Binary(b) => format!("{:02X?}", b),
            ValueData::Dword(d) => format!("{} (0x{:08X})", d, d),
            ValueData::DwordBigEndian(d) => format!("{} (0x{:08X})", d, d),
            ValueData::Qword(q) => format!("{} (0x{:016X})", q, q),
            ValueData::MultiString(strings) => strings.join(", "),
            ValueData::Unknown(b) => format!("{:02X?}", b),
        }
    }

    /// Strict accessor for `REG_DWORD`/`REG_DWORD_BIG_ENDIAN` values.
    ///
    /// Returns [`RegistryError::InvalidArgument`] for any other variant
    /// rather than silently coercing, so callers that expect a fixed-width
    /// integer don't misread binary data as one.
    pub fn as_dword(&self) -> Result<u32> {
        match self {
            ValueData::Dword(d) | ValueData::DwordBigEndian(d) => Ok(*d),
            other => Err(RegistryError::InvalidArgument(format!(
                "value is not a DWORD: {:?}",
                other
            ))),
        }
    }

    /// Strict accessor for `REG_QWORD` values.
    pub fn as_qword(&self) -> Result<u64> {
        match self {
            ValueData::Qword(q) => Ok(*q),
            other => Err(RegistryError::InvalidArgument(format!(
                "value is not a QWORD: {:?}",
                other
            ))),
        }
    }

    /// Strict accessor for string-shaped values: `REG_SZ`, `REG_EXPAND_SZ`,
    /// and `REG_LINK` (all three share the same UTF-16LE wire format).
    pub fn as_string(&self) -> Result<&str> {
        match self {
            ValueData::String(s) | ValueData::ExpandString(s) | ValueData::Link(s) => Ok(s),
            other => Err(RegistryError::InvalidArgument(format!(
                "value is not string-shaped: {:?}",
                other
            ))),
        }
    }

    /// Strict accessor for `REG_MULTI_SZ` values.
    pub fn as_multi_string(&self) -> Result<&[String]> {
        match self {
            ValueData::MultiString(strings) => Ok(strings),
            other => Err(RegistryError::InvalidArgument(format!(
                "value is not a multi-string: {:?}",
                other
            ))),
        }
    }

    /// The on-disk [`ValueType`] this data would be written back as.
    pub fn value_type(&self) -> ValueType {
        match self {
            ValueData::None => ValueType::None,
            ValueData::String(_) => ValueType::String,
            ValueData::ExpandString(_) => ValueType::ExpandString,
            ValueData::Binary(_) => ValueType::Binary,
            ValueData::Dword(_) => ValueType::Dword,
            ValueData::DwordBigEndian(_) => ValueType::DwordBigEndian,
            ValueData::MultiString(_) => ValueType::MultiString,
            ValueData::Qword(_) => ValueType::Qword,
            ValueData::Link(_) => ValueType::Link,
            ValueData::Unknown(_) => ValueType::Binary,
        }
    }

    /// Serializes this value back into its on-disk byte representation, the
    /// inverse of [`ValueData::parse`]. Used by the writer when committing a
    /// new or updated value.
    pub fn to_raw_bytes(&self) -> Result<Vec<u8>> {
        match self {
            ValueData::None => Ok(Vec::new()),
            ValueData::String(s) | ValueData::ExpandString(s) | ValueData::Link(s) => {
                Ok(write_utf16_string(s))
            }
            ValueData::Binary(b) | ValueData::Unknown(b) => Ok(b.clone()),
            ValueData::Dword(d) => {
                let mut buf = Vec::with_capacity(4);
                buf.write_u32::<LittleEndian>(*d)?;
                Ok(buf)
            }
            ValueData::DwordBigEndian(d) => {
                let mut buf = Vec::with_capacity(4);
                buf.write_u32::<BigEndian>(*d)?;
                Ok(buf)
            }
            ValueData::Qword(q) => {
                let mut buf = Vec::with_capacity(8);
                buf.write_u64::<LittleEndian>(*q)?;
                Ok(buf)
            }
            ValueData::MultiString(strings) => Ok(write_multi_strings(strings)),
        }
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Every `u32` round-trips through `REG_DWORD`'s raw byte form
        /// (spec.md §8, "Round-trip").
        #[test]
        fn dword_round_trips_through_raw_bytes(value: u32) {
            let data = ValueData::Dword(value);
            let bytes = data.to_raw_bytes().unwrap();
            let parsed = ValueData::parse(&bytes, ValueType::Dword, 0).unwrap();
            prop_assert_eq!(parsed.as_dword().unwrap(), value);
        }

        /// Same, for `REG_DWORD_BIG_ENDIAN`.
        #[test]
        fn dword_be_round_trips_through_raw_bytes(value: u32) {
            let data = ValueData::DwordBigEndian(value);
            let bytes = data.to_raw_bytes().unwrap();
            let parsed = ValueData::parse(&bytes, ValueType::DwordBigEndian, 0).unwrap();
            prop_assert_eq!(parsed.as_dword().unwrap(), value);
        }

        /// Every `u64` round-trips through `REG_QWORD`'s raw byte form.
        #[test]
        fn qword_round_trips_through_raw_bytes(value: u64) {
            let data = ValueData::Qword(value);
            let bytes = data.to_raw_bytes().unwrap();
            let parsed = ValueData::parse(&bytes, ValueType::Qword, 0).unwrap();
            prop_assert_eq!(parsed.as_qword().unwrap(), value);
        }

        /// Any string made of printable ASCII (no embedded NUL, since that's
        /// the UTF-16 terminator this wire format relies on) round-trips
        /// through `REG_SZ`'s UTF-16LE encoding regardless of length, so both
        /// the inline (<=4 byte) and out-of-line storage paths are exercised.
        #[test]
        fn string_round_trips_through_raw_bytes(s in "[ -~]{0,64}") {
            let data = ValueData::String(s.clone());
            let bytes = data.to_raw_bytes().unwrap();
            let parsed = ValueData::parse(&bytes, ValueType::String, 0).unwrap();
            prop_assert_eq!(parsed.as_string().unwrap(), s);
        }

        /// A `REG_MULTI_SZ` built from any sequence of non-empty printable
        /// ASCII strings round-trips element-for-element.
        #[test]
        fn multi_string_round_trips_through_raw_bytes(strings in prop::collection::vec("[ -~]{1,16}", 0..8)) {
            let data = ValueData::MultiString(strings.clone());
            let bytes = data.to_raw_bytes().unwrap();
            let parsed = ValueData::parse(&bytes, ValueType::MultiString, 0).unwrap();
            prop_assert_eq!(parsed.as_multi_string().unwrap(), strings.as_slice());
        }
    }
}
