//! # Windows Registry Hive Parser
//!
//! A high-performance, zero-copy Windows registry hive parser written in Rust.
//!
//! ## Features
//!
//! - **Fast parsing**: Memory-mapped I/O for efficient, zero-copy access
//! - **Complete support**: Handles all common registry hive formats (SYSTEM, SOFTWARE, SAM, SECURITY, NTUSER.DAT, etc.)
//! - **Type-safe**: Strong typing for registry values and structures
//! - **Lazy evaluation**: Parses structures only when accessed
//! - **Comprehensive error handling**: Detailed error types for debugging
//!
//! ## Architecture
//!
//! The parser is built on several layers:
//!
//! 1. **Base Block (Header)**: Contains hive metadata and root key offset
//! 2. **Hive Bins (hbin)**: 4KB-aligned blocks containing cells
//! 3. **Cells**: Variable-sized structures (keys, values, lists, etc.)
//! 4. **Key Nodes (nk)**: Registry keys with subkeys and values
//! 5. **Value Keys (vk)**: Registry values with typed data
//! 6. **Subkey Lists (lf/lh/li/ri)**: Efficient subkey organization
//!
//! ## Binary Layout
//!
//! Registry hives follow this structure:
//!
//! ```text
//! [Base Block - 4KB]
//!   - Signature: "regf"
//!   - Version, timestamps, root offset
//!   - Checksum
//!
//! [Hive Bins - variable size, 4KB aligned]
//!   [Hbin Header - 32 bytes]
//!     - Signature: "hbin"
//!     - Offset, size
//!   
//!   [Cells - variable size]
//!     [Cell Size - 4 bytes, negative if allocated]
//!     [Cell Data]
//!       - Key nodes (nk)
//!       - Value keys (vk)
//!       - Subkey lists (lf/lh/li/ri)
//!       - Security descriptors (sk)
//! ```
//!
//! ## Examples
//!
//! ### Basic Usage
//!
//! ```no_run
//! use winreg_hive::{Hive, OpenFlags};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Open a registry hive read-only
//! let hive = Hive::open("SYSTEM", OpenFlags::default())?;
//!
//! // Get the root key
//! let root = hive.root_key()?;
//! println!("Root key: {}", root.name()?);
//!
//! // Enumerate subkeys
//! for subkey in root.subkeys()? {
//!     println!("  Subkey: {}", subkey.name()?);
//! }
//!
//! // Enumerate values
//! for value in root.values()? {
//!     println!("  Value: {} = {}", value.name()?, value.data()?.to_string());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ### Accessing Specific Values
//!
//! ```no_run
//! use winreg_hive::{Hive, OpenFlags, ValueData};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let hive = Hive::open("SOFTWARE", OpenFlags::default())?;
//! let root = hive.root_key()?;
//!
//! // Navigate to a specific key
//! let microsoft_key = root.get_child("Microsoft")?
//!     .ok_or("Microsoft key not found")?;
//!
//! // Get a specific value
//! let value = microsoft_key.value("SomeValue")?;
//! match value.data()? {
//!     ValueData::String(s) => println!("String value: {}", s),
//!     ValueData::Dword(d) => println!("DWORD value: {}", d),
//!     _ => println!("Other type"),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ### Mutating a Hive
//!
//! ```no_run
//! use winreg_hive::{Hive, NewValue, OpenFlags, ValueData};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut hive = Hive::open("SOFTWARE", OpenFlags { write: true, ..Default::default() })?;
//! let root = hive.root();
//!
//! let child = hive.add_child(root, "MyApp")?;
//! hive.set_values(child, &[NewValue {
//!     name: "Version".to_string(),
//!     data: ValueData::Dword(3),
//! }])?;
//! hive.commit(None::<&str>)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Supported Features
//!
//! - Full registry hive parsing (SYSTEM, SOFTWARE, SAM, SECURITY, NTUSER.DAT, etc.)
//! - All common value types (REG_SZ, REG_DWORD, REG_BINARY, REG_MULTI_SZ, REG_QWORD, etc.)
//! - Subkey enumeration with efficient list structures (lf/lh/li/ri)
//! - Transaction log (.LOG1, .LOG2) support for recovering uncommitted changes
//! - Big data block (db) support for values > 16KB
//! - In-place mutation: add/delete keys, set values, and commit back to disk
//! - Security descriptor (`sk`) refcount/chain bookkeeping (descriptor bytes stay opaque)

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bigdata;
pub mod blockmap;
pub mod cell;
pub mod error;
pub mod hbin;
pub mod header;
pub mod hive;
pub mod key;
pub mod loader;
pub mod navigator;
pub mod security;
pub mod subkey_list;
#[cfg(test)]
mod testutil;
pub mod transaction_log;
pub mod utils;
pub mod value;
pub mod visitor;
pub mod writer;

// Re-export main types for convenience
pub use cell::{CellType, KeyNodeFlags, ValueType};
pub use error::{ErrorKind, RegistryError, Result};
pub use hbin::HbinHeader;
pub use header::BaseBlock;
pub use hive::{HbinIterator, Hive, RegistryKey, RegistryValue};
pub use key::KeyNode;
pub use loader::{Limits, LoadResult, OpenFlags};
pub use security::SecurityRecord;
pub use subkey_list::{SubkeyList, SubkeyListEntry, SubkeyListType};
pub use transaction_log::{DirtyPage, TransactionLog};
pub use value::{ValueData, ValueKey};
pub use visitor::{VisitFlags, Visitor};
pub use writer::NewValue;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the environment variable that enables verbose diagnostic logging
/// when a caller opens a hive without explicitly setting [`OpenFlags::verbose`].
pub const VERBOSE_ENV_VAR: &str = "WINREG_HIVE_VERBOSE";

/// Reads [`VERBOSE_ENV_VAR`] and reports whether verbose diagnostics were
/// requested via the environment. Any non-empty value other than `"0"` is
/// treated as enabled.
pub fn verbose_from_env() -> bool {
    match std::env::var(VERBOSE_ENV_VAR) {
        Ok(val) => !val.is_empty() && val != "0",
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn verbose_env_defaults_false() {
        std::env::remove_var(VERBOSE_ENV_VAR);
        assert!(!verbose_from_env());
    }

    #[test]
    fn verbose_env_respects_zero() {
        std::env::set_var(VERBOSE_ENV_VAR, "0");
        assert!(!verbose_from_env());
        std::env::remove_var(VERBOSE_ENV_VAR);
    }

    #[test]
    fn verbose_env_enabled_for_nonzero() {
        std::env::set_var(VERBOSE_ENV_VAR, "1");
        assert!(verbose_from_env());
        std::env::remove_var(VERBOSE_ENV_VAR);
    }
}
