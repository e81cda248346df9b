//! Error types for registry parsing operations.
//!
//! This module provides comprehensive error handling for all registry parsing
//! operations, including I/O errors, format violations, and data corruption.

use std::io;
use thiserror::Error;

/// Result type alias for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Errors that can occur during registry parsing.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// I/O error occurred while reading the hive file.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Invalid magic signature in header or structure.
    #[error("Invalid signature: expected {expected:?}, found {found:?}")]
    InvalidSignature {
        expected: Vec<u8>,
        found: Vec<u8>,
    },

    /// Invalid hive format or corrupted data.
    #[error("Invalid hive format: {0}")]
    InvalidFormat(String),

    /// Cell offset is out of bounds.
    #[error("Invalid cell offset: {offset:#x} (hive size: {hive_size:#x})")]
    InvalidOffset {
        offset: u32,
        hive_size: usize,
    },

    /// Cell size is invalid or corrupted.
    #[error("Invalid cell size: {size} at offset {offset:#x}")]
    InvalidCellSize {
        size: i32,
        offset: u32,
    },

    /// Unknown or unsupported cell type.
    #[error("Unknown cell type: {cell_type:?} at offset {offset:#x}")]
    UnknownCellType {
        cell_type: [u8; 2],
        offset: u32,
    },

    /// Key or value not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid UTF-16 string data.
    #[error("Invalid UTF-16 string at offset {offset:#x}")]
    InvalidUtf16 {
        offset: u32,
    },

    /// Invalid registry value type.
    #[error("Invalid value type: {0}")]
    InvalidValueType(u32),

    /// Hive is too small to be valid.
    #[error("Hive too small: {size} bytes (minimum: {minimum} bytes)")]
    HiveTooSmall {
        size: usize,
        minimum: usize,
    },

    /// Checksum mismatch in hive header.
    #[error("Checksum mismatch: expected {expected:#x}, calculated {calculated:#x}")]
    ChecksumMismatch {
        expected: u32,
        calculated: u32,
    },

    /// Unsupported hive version.
    #[error("Unsupported hive version: {major}.{minor}")]
    UnsupportedVersion {
        major: u32,
        minor: u32,
    },

    /// Data truncated or incomplete.
    #[error("Truncated data at offset {offset:#x}: expected {expected} bytes, got {actual} bytes")]
    TruncatedData {
        offset: u32,
        expected: usize,
        actual: usize,
    },

    /// Invalid subkey list type.
    #[error("Invalid subkey list type: {list_type:?}")]
    InvalidSubkeyList {
        list_type: [u8; 2],
    },

    /// Big data blocks (values > 16KB) not supported.
    #[error("Big data blocks not supported: value size is {size} bytes (max supported: {max_supported} bytes)")]
    BigDataNotSupported {
        /// Size of the value that was attempted to be read
        size: u32,
        /// Maximum supported size
        max_supported: u32,
    },

    /// A handle or argument is unusable for the requested operation (e.g. wrong block type).
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The hive's root offset does not reference a used `nk` block.
    #[error("No usable root key")]
    NoKey,

    /// A structural feature is recognized but not handled by this engine
    /// (unknown block variant, subkey/value count mismatch, unsupported minor version family).
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// A mutation was attempted on a handle opened without write access.
    #[error("Hive was opened read-only")]
    ReadOnly,

    /// A requested length or count exceeds a configured limit.
    #[error("Out of range: {what} is {value} (limit {limit})")]
    OutOfRange {
        /// What was measured (e.g. "value length", "subkey count").
        what: String,
        /// The value that was measured.
        value: usize,
        /// The configured limit it exceeded.
        limit: usize,
    },

    /// Adding a child whose name already exists under the parent.
    #[error("Key already exists: {0}")]
    Exists(String),

    /// A cycle was detected while walking the subkey graph.
    #[error("Cycle detected at offset {offset:#x}")]
    Loop {
        /// Offset at which the cycle was detected.
        offset: u32,
    },
}

/// The closed set of error categories from the core's error-handling policy.
///
/// Every [`RegistryError`] maps onto exactly one of these via [`RegistryError::kind`],
/// so callers can dispatch on policy (fall back to raw bytes, suppress under
/// `skip_bad`, etc.) without matching every concrete variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad handle or wrong block type for the requested operation.
    InvalidArgument,
    /// Root offset does not reference a used `nk`.
    NoKey,
    /// Unknown version, unknown block variant, or structural mismatch.
    NotSupported,
    /// A stored offset or length does not reference a valid used block.
    Corrupt,
    /// A configured limit was exceeded.
    OutOfRange,
    /// Mutation attempted on a read-only handle.
    ReadOnly,
    /// UTF-16 decode failure; raw bytes remain available.
    InvalidEncoding,
    /// Adding a child whose name already exists.
    Exists,
    /// Underlying I/O failure.
    Io,
    /// Cycle detected during visit.
    Loop,
}

impl RegistryError {
    /// Classifies this error into the core's closed error-kind set.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RegistryError::Io(_) => ErrorKind::Io,
            RegistryError::InvalidUtf16 { .. } => ErrorKind::InvalidEncoding,
            RegistryError::NoKey => ErrorKind::NoKey,
            RegistryError::ReadOnly => ErrorKind::ReadOnly,
            RegistryError::OutOfRange { .. } | RegistryError::BigDataNotSupported { .. } => {
                ErrorKind::OutOfRange
            }
            RegistryError::Exists(_) => ErrorKind::Exists,
            RegistryError::Loop { .. } => ErrorKind::Loop,
            RegistryError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            RegistryError::NotSupported(_)
            | RegistryError::UnsupportedVersion { .. }
            | RegistryError::InvalidSubkeyList { .. }
            | RegistryError::UnknownCellType { .. } => ErrorKind::NotSupported,
            RegistryError::InvalidSignature { .. }
            | RegistryError::InvalidFormat(_)
            | RegistryError::InvalidOffset { .. }
            | RegistryError::InvalidCellSize { .. }
            | RegistryError::TruncatedData { .. }
            | RegistryError::ChecksumMismatch { .. }
            | RegistryError::HiveTooSmall { .. } => ErrorKind::Corrupt,
            RegistryError::NotFound(_) | RegistryError::InvalidValueType(_) => {
                ErrorKind::InvalidArgument
            }
        }
    }
}

impl RegistryError {
    /// Creates an invalid signature error with context.
    ///
    /// # Arguments
    ///
    /// * `expected` - Expected signature bytes
    /// * `found` - Actual signature bytes found
    pub fn invalid_signature(expected: &[u8], found: &[u8]) -> Self {
        Self::InvalidSignature {
            expected: expected.to_vec(),
            found: found.to_vec(),
        }
    }

    /// Creates an invalid offset error with context.
    ///
    /// # Arguments
    ///
    /// * `offset` - The invalid offset
    /// * `hive_size` - Total size of the hive for context
    pub fn invalid_offset(offset: u32, hive_size: usize) -> Self {
        Self::InvalidOffset { offset, hive_size }
    }

    /// Creates an invalid cell size error with context.
    ///
    /// # Arguments
    ///
    /// * `size` - The invalid cell size
    /// * `offset` - Offset where the invalid size was found
    pub fn invalid_cell_size(size: i32, offset: u32) -> Self {
        Self::InvalidCellSize { size, offset }
    }

    /// Creates a format error with detailed context.
    ///
    /// # Arguments
    ///
    /// * `message` - Description of the format error
    ///
    /// # Examples
    ///
    /// ```rust
    /// # use winreg_hive::error::RegistryError;
    /// let len = 256;
    /// let offset = 0x1000;
    /// let err = RegistryError::format_error(
    ///     format!("Invalid key name length: {} at offset {:#x}", len, offset)
    /// );
    /// ```
    pub fn format_error(message: String) -> Self {
        Self::InvalidFormat(message)
    }

    /// Creates a not found error with context about what was being searched.
    ///
    /// # Arguments
    ///
    /// * `item_type` - Type of item (e.g., "key", "value")
    /// * `name` - Name of the item that wasn't found
    ///
    /// # Examples
    ///
    /// ```rust
    /// # use winreg_hive::error::RegistryError;
    /// let err = RegistryError::not_found("value", "DisplayName");
    /// ```
    pub fn not_found(item_type: &str, name: &str) -> Self {
        Self::NotFound(format!("{} '{}'", item_type, name))
    }

    /// Creates an unknown cell type error.
    pub fn unknown_cell_type(cell_type: [u8; 2], offset: u32) -> Self {
        Self::UnknownCellType { cell_type, offset }
    }
}

#[cfg(test)]
mod kind_tests {
    use super::*;

    #[test]
    fn read_only_maps_to_read_only() {
        assert_eq!(RegistryError::ReadOnly.kind(), ErrorKind::ReadOnly);
    }

    #[test]
    fn loop_maps_to_loop() {
        assert_eq!(RegistryError::Loop { offset: 0x2000 }.kind(), ErrorKind::Loop);
    }

    #[test]
    fn invalid_utf16_maps_to_invalid_encoding() {
        assert_eq!(
            RegistryError::InvalidUtf16 { offset: 0 }.kind(),
            ErrorKind::InvalidEncoding
        );
    }

    #[test]
    fn truncated_data_is_corrupt() {
        assert_eq!(
            RegistryError::TruncatedData { offset: 0, expected: 4, actual: 1 }.kind(),
            ErrorKind::Corrupt
        );
    }

    #[test]
    fn exists_maps_to_exists() {
        assert_eq!(RegistryError::Exists("Foo".into()).kind(), ErrorKind::Exists);
    }
}
