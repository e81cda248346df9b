//! Hive: the public handle that ties the loader, navigator, visitor, and
//! writer together into one capability surface.
//!
//! Opening a hive runs [`crate::loader::load`] to produce a validated
//! [`BlockMap`] and [`BaseBlock`]; every subsequent navigation, value
//! inspection, visit, and mutation call is routed through
//! [`crate::navigator`], [`crate::visitor`], and [`crate::writer`], which
//! resolve every stored offset through that map rather than trusting it as a
//! native pointer. [`RegistryKey`]/[`RegistryValue`] are thin, owned-data
//! wrappers for callers who'd rather walk the tree as objects than as raw
//! offsets.

use crate::blockmap::BlockMap;
use crate::cell::ValueType;
use crate::error::{RegistryError, Result};
use crate::hbin::HbinHeader;
use crate::header::{BaseBlock, BASE_BLOCK_SIZE};
use crate::key::KeyNode;
use crate::loader::{self, Limits, OpenFlags};
use crate::navigator;
use crate::transaction_log::{merge_transaction_logs, TransactionLog};
use crate::utils::{calculate_checksum, read_utf16_string, split_multi_strings};
use crate::value::{ValueData, ValueKey};
use crate::visitor::{self, VisitFlags, Visitor};
use crate::writer::{self, AllocatorState, NewValue};
use memmap2::Mmap;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument};

/// Backing storage for a hive's bytes.
enum HiveData {
    /// Read-only memory-mapped file.
    Mapped(Mmap),
    /// Owned, mutable buffer (required for any writable handle).
    Owned(Vec<u8>),
}

impl HiveData {
    fn as_slice(&self) -> &[u8] {
        match self {
            HiveData::Mapped(mmap) => mmap,
            HiveData::Owned(buf) => buf,
        }
    }
}

/// The handle's lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandleState {
    ReadOnly,
    Writable,
}

/// An open registry hive.
///
/// A `Hive` owns its backing bytes, its [`BlockMap`], and (when opened
/// writable) the allocator cursor the writer advances. Every derived view —
/// [`RegistryKey`], [`RegistryValue`], decoded strings, child/value lists —
/// is a freshly allocated copy independent of the handle.
pub struct Hive {
    data: HiveData,
    base_block: BaseBlock,
    block_map: BlockMap,
    alloc_state: Option<AllocatorState>,
    limits: Limits,
    open_flags: OpenFlags,
    root_offset: u32,
    state: HandleState,
    path: Option<PathBuf>,
}

impl Hive {
    /// Opens a hive file with default resource limits.
    ///
    /// Read-only opens memory-map the file; writable opens (`flags.write`)
    /// read it fully into an owned, growable buffer.
    #[instrument(skip(path), fields(path = %path.as_ref().display()))]
    pub fn open<P: AsRef<Path>>(path: P, flags: OpenFlags) -> Result<Self> {
        Self::open_with_limits(path, flags, Limits::default())
    }

    /// Like [`Hive::open`], with caller-supplied resource [`Limits`].
    pub fn open_with_limits<P: AsRef<Path>>(path: P, flags: OpenFlags, limits: Limits) -> Result<Self> {
        let verbose = flags.verbose || crate::verbose_from_env();
        if verbose {
            info!(path = %path.as_ref().display(), write = flags.write, "opening hive");
        }

        let data = if flags.write {
            let bytes = std::fs::read(&path)?;
            HiveData::Owned(bytes)
        } else {
            let file = File::open(&path)?;
            let file_size = file.metadata()?.len() as usize;
            if file_size < BASE_BLOCK_SIZE {
                return Err(RegistryError::HiveTooSmall {
                    size: file_size,
                    minimum: BASE_BLOCK_SIZE,
                });
            }
            // SAFETY: the file is opened read-only and kept alive for the
            // handle's lifetime; every access into the mapping is bounds- and
            // block-validity-checked by `navigator` before use.
            let mmap = unsafe { Mmap::map(&file)? };
            HiveData::Mapped(mmap)
        };

        let mut hive = Self::from_storage(data, flags, limits)?;
        hive.path = Some(path.as_ref().to_path_buf());
        Ok(hive)
    }

    /// Builds a handle directly from an owned byte buffer (no file I/O).
    pub fn from_bytes(data: Vec<u8>, flags: OpenFlags, limits: Limits) -> Result<Self> {
        Self::from_storage(HiveData::Owned(data), flags, limits)
    }

    fn from_storage(data: HiveData, flags: OpenFlags, limits: Limits) -> Result<Self> {
        let loaded = loader::load(data.as_slice())?;
        let root_offset = navigator::root(data.as_slice(), &loaded.block_map, loaded.base_block.root_cell_offset)?;

        let alloc_state = if flags.write {
            Some(writer::init_allocator_state(data.as_slice(), loaded.end_of_pages)?)
        } else {
            None
        };

        debug!(root_offset, end_of_pages = loaded.end_of_pages, "hive loaded");

        Ok(Hive {
            data,
            base_block: loaded.base_block,
            block_map: loaded.block_map,
            alloc_state,
            limits,
            open_flags: flags,
            root_offset,
            state: if flags.write { HandleState::Writable } else { HandleState::ReadOnly },
            path: None,
        })
    }

    /// Opens a base hive and replays `.LOG1`/`.LOG2` transaction logs over it
    /// before parsing, recovering writes the original hive was never
    /// committed with. The result is an owned, in-memory handle; pass
    /// `flags.write` to also permit further mutation from there.
    pub fn open_with_logs<P: AsRef<Path>>(
        hive_path: P,
        log1_path: Option<P>,
        log2_path: Option<P>,
        flags: OpenFlags,
    ) -> Result<Self> {
        let mut data = std::fs::read(&hive_path)?;
        let applied = merge_transaction_logs(&mut data, log1_path, log2_path)?;
        if applied > 0 {
            let checksum = calculate_checksum(&data);
            data[0x1FC..0x200].copy_from_slice(&checksum.to_le_bytes());
            info!(applied, "replayed transaction log entries");
        }
        let mut hive = Self::from_bytes(data, flags, Limits::default())?;
        hive.path = Some(hive_path.as_ref().to_path_buf());
        Ok(hive)
    }

    /// Applies a single transaction log to a copy of this hive's current
    /// bytes, returning a new, independent handle. The receiver is untouched.
    pub fn apply_transaction_log<P: AsRef<Path>>(&self, log_path: P, flags: OpenFlags) -> Result<Self> {
        let mut data = self.data.as_slice().to_vec();
        let log = TransactionLog::open(log_path)?;
        log.apply_to_hive(&mut data)?;
        let checksum = calculate_checksum(&data);
        data[0x1FC..0x200].copy_from_slice(&checksum.to_le_bytes());
        Self::from_bytes(data, flags, self.limits)
    }

    /// Closes the handle. Consumes `self`; the file descriptor or mapping is
    /// released when the last owned copy of the underlying resource drops.
    pub fn close(self) {}

    /// The parsed, checksum-verified base block.
    pub fn base_block(&self) -> &BaseBlock {
        &self.base_block
    }

    /// The resource limits this handle enforces.
    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// The flags this handle was opened with.
    pub fn open_flags(&self) -> OpenFlags {
        self.open_flags
    }

    /// Whether this handle currently permits mutation.
    pub fn is_writable(&self) -> bool {
        self.state == HandleState::Writable
    }

    /// Absolute offset of the validated root `nk`.
    pub fn root(&self) -> u32 {
        self.root_offset
    }

    /// Returns the root key as a [`RegistryKey`].
    pub fn root_key(&self) -> Result<RegistryKey<'_>> {
        self.get_key(self.root_offset)
    }

    /// Wraps `offset` as a [`RegistryKey`], validating it is a used `nk`.
    pub fn get_key(&self, offset: u32) -> Result<RegistryKey<'_>> {
        let key_node = navigator::node_at(self.data.as_slice(), &self.block_map, offset)?;
        Ok(RegistryKey { hive: self, offset, key_node })
    }

    /// A key's name.
    pub fn node_name(&self, offset: u32) -> Result<String> {
        navigator::node_name(self.data.as_slice(), &self.block_map, offset)
    }

    /// A key's parent offset.
    pub fn node_parent(&self, offset: u32) -> Result<u32> {
        navigator::node_parent(self.data.as_slice(), &self.block_map, offset)
    }

    /// A key's children, in reading (sorted) order.
    pub fn node_children(&self, offset: u32) -> Result<Vec<u32>> {
        navigator::node_children(self.data.as_slice(), &self.block_map, offset)
    }

    /// Case-insensitive child lookup by name.
    pub fn node_get_child(&self, offset: u32, name: &str) -> Result<Option<u32>> {
        navigator::node_get_child(self.data.as_slice(), &self.block_map, offset, name)
    }

    /// A key's values, in reading order.
    pub fn node_values(&self, offset: u32) -> Result<Vec<u32>> {
        navigator::node_values(self.data.as_slice(), &self.block_map, offset)
    }

    /// Case-insensitive value lookup by name.
    pub fn node_get_value(&self, offset: u32, name: &str) -> Result<Option<u32>> {
        navigator::node_get_value(self.data.as_slice(), &self.block_map, offset, name)
    }

    /// Parses the `vk` record at `offset`.
    pub fn value_key(&self, offset: u32) -> Result<ValueKey> {
        navigator::value_at(self.data.as_slice(), &self.block_map, offset)
    }

    /// A value's declared `(type, length)`.
    pub fn value_type(&self, offset: u32) -> Result<(ValueType, u32)> {
        let vk = self.value_key(offset)?;
        Ok((vk.data_type, vk.data_length))
    }

    /// A value's raw bytes, resolved inline-vs-out-of-line and truncated per
    /// the over-long-declared-length tolerance policy.
    pub fn value_raw(&self, offset: u32) -> Result<Vec<u8>> {
        let vk = self.value_key(offset)?;
        navigator::value_raw(self.data.as_slice(), &self.block_map, &vk, &self.limits)
    }

    /// Strict string accessor for `REG_SZ`/`REG_EXPAND_SZ`/`REG_LINK`. UTF-16
    /// decode failures surface as [`RegistryError::InvalidUtf16`], distinct
    /// from every other failure, so callers can still retrieve the bytes via
    /// [`Hive::value_raw`].
    pub fn value_string(&self, offset: u32) -> Result<String> {
        let vk = self.value_key(offset)?;
        if !matches!(vk.data_type, ValueType::String | ValueType::ExpandString | ValueType::Link) {
            return Err(RegistryError::InvalidArgument(format!(
                "value at {:#x} is not string-shaped: {:?}",
                offset, vk.data_type
            )));
        }
        let raw = navigator::value_raw(self.data.as_slice(), &self.block_map, &vk, &self.limits)?;
        read_utf16_string(&raw, offset)
    }

    /// Strict accessor for `REG_MULTI_SZ`: splits on raw UTF-16 `00 00` pairs
    /// before decoding each element.
    pub fn value_multi_strings(&self, offset: u32) -> Result<Vec<String>> {
        let vk = self.value_key(offset)?;
        if vk.data_type != ValueType::MultiString {
            return Err(RegistryError::InvalidArgument(format!(
                "value at {:#x} is not REG_MULTI_SZ: {:?}",
                offset, vk.data_type
            )));
        }
        let raw = navigator::value_raw(self.data.as_slice(), &self.block_map, &vk, &self.limits)?;
        split_multi_strings(&raw, offset)
    }

    /// Strict accessor for `REG_DWORD`/`REG_DWORD_BIG_ENDIAN`, requiring
    /// exactly 4 declared bytes and returning the value in the matching
    /// endianness.
    pub fn value_dword(&self, offset: u32) -> Result<i32> {
        let vk = self.value_key(offset)?;
        if vk.data_length != 4 || !matches!(vk.data_type, ValueType::Dword | ValueType::DwordBigEndian) {
            return Err(RegistryError::InvalidArgument(format!(
                "value at {:#x} is not a 4-byte DWORD: type {:?}, length {}",
                offset, vk.data_type, vk.data_length
            )));
        }
        let raw = navigator::value_raw(self.data.as_slice(), &self.block_map, &vk, &self.limits)?;
        if raw.len() != 4 {
            return Err(RegistryError::TruncatedData { offset, expected: 4, actual: raw.len() });
        }
        let bytes = [raw[0], raw[1], raw[2], raw[3]];
        Ok(if vk.data_type == ValueType::DwordBigEndian {
            i32::from_be_bytes(bytes)
        } else {
            i32::from_le_bytes(bytes)
        })
    }

    /// Strict accessor for `REG_QWORD`, requiring exactly 8 declared bytes.
    pub fn value_qword(&self, offset: u32) -> Result<i64> {
        let vk = self.value_key(offset)?;
        if vk.data_length != 8 || vk.data_type != ValueType::Qword {
            return Err(RegistryError::InvalidArgument(format!(
                "value at {:#x} is not an 8-byte QWORD: type {:?}, length {}",
                offset, vk.data_type, vk.data_length
            )));
        }
        let raw = navigator::value_raw(self.data.as_slice(), &self.block_map, &vk, &self.limits)?;
        if raw.len() != 8 {
            return Err(RegistryError::TruncatedData { offset, expected: 8, actual: raw.len() });
        }
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&raw);
        Ok(i64::from_le_bytes(bytes))
    }

    /// Runs a depth-first visit starting at `root_offset`.
    pub fn visit(&self, root_offset: u32, flags: VisitFlags, visitor: &mut impl Visitor) -> Result<()> {
        visitor::visit(self.data.as_slice(), &self.block_map, &self.limits, root_offset, flags, visitor)
    }

    /// Adds a new, empty, valueless subkey. Fails with [`RegistryError::Exists`]
    /// if a case-insensitively matching child is already present, or
    /// [`RegistryError::ReadOnly`] if this handle isn't writable.
    pub fn add_child(&mut self, parent_offset: u32, name: &str) -> Result<u32> {
        if self.state != HandleState::Writable {
            return Err(RegistryError::ReadOnly);
        }
        let data = match &mut self.data {
            HiveData::Owned(buf) => buf,
            HiveData::Mapped(_) => return Err(RegistryError::ReadOnly),
        };
        let alloc_state = self
            .alloc_state
            .as_mut()
            .expect("writable handle always carries allocator state");
        writer::add_child(data, &mut self.block_map, alloc_state, &self.limits, true, parent_offset, name)
    }

    /// Replaces `node_offset`'s entire value set.
    pub fn set_values(&mut self, node_offset: u32, values: &[NewValue]) -> Result<()> {
        if self.state != HandleState::Writable {
            return Err(RegistryError::ReadOnly);
        }
        let data = match &mut self.data {
            HiveData::Owned(buf) => buf,
            HiveData::Mapped(_) => return Err(RegistryError::ReadOnly),
        };
        let alloc_state = self
            .alloc_state
            .as_mut()
            .expect("writable handle always carries allocator state");
        writer::set_values(data, &mut self.block_map, alloc_state, &self.limits, true, node_offset, values)
    }

    /// Deletes `node_offset` and its entire subtree. Forbids deleting the root.
    pub fn delete_child(&mut self, node_offset: u32) -> Result<()> {
        if self.state != HandleState::Writable {
            return Err(RegistryError::ReadOnly);
        }
        let root_offset = self.root_offset;
        let limits = self.limits;
        let data = match &mut self.data {
            HiveData::Owned(buf) => buf,
            HiveData::Mapped(_) => return Err(RegistryError::ReadOnly),
        };
        writer::delete_child(data, &mut self.block_map, &limits, true, root_offset, node_offset)
    }

    /// Bumps both sequence numbers, recomputes `hive_length` and the header
    /// checksum, and writes the full image to `path` (or the original open
    /// path if `path` is `None`).
    pub fn commit<P: AsRef<Path>>(&mut self, path: Option<P>) -> Result<()> {
        if self.state != HandleState::Writable {
            return Err(RegistryError::ReadOnly);
        }
        let dest = match path {
            Some(p) => p.as_ref().to_path_buf(),
            None => self
                .path
                .clone()
                .ok_or_else(|| RegistryError::InvalidArgument("commit needs an explicit path".to_string()))?,
        };
        let end_pages = self
            .alloc_state
            .as_ref()
            .expect("writable handle carries allocator state")
            .end_pages;
        let data = match &mut self.data {
            HiveData::Owned(buf) => buf,
            HiveData::Mapped(_) => return Err(RegistryError::ReadOnly),
        };
        writer::commit(data, end_pages, &dest)?;
        self.base_block = BaseBlock::parse(data)?;
        self.path = Some(dest);
        Ok(())
    }

    /// A copy of the handle's current bytes (e.g. for external diffing).
    pub fn to_bytes(&self) -> Vec<u8> {
        self.data.as_slice().to_vec()
    }

    /// Iterates over every hbin page in the file.
    pub fn hbins(&self) -> HbinIterator<'_> {
        let data = self.data.as_slice();
        HbinIterator { data: &data[BASE_BLOCK_SIZE..], offset: 0 }
    }
}

/// Iterator over hbin page headers in a hive.
pub struct HbinIterator<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Iterator for HbinIterator<'a> {
    type Item = Result<HbinHeader>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.data.len() {
            return None;
        }
        let rest = &self.data[self.offset..];
        match HbinHeader::parse(rest, self.offset as u32) {
            Ok(header) => {
                self.offset += header.size as usize;
                Some(Ok(header))
            }
            Err(RegistryError::InvalidSignature { .. }) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

/// A registry key, borrowed from its owning [`Hive`].
pub struct RegistryKey<'a> {
    hive: &'a Hive,
    /// Absolute offset of this key's `nk` cell.
    pub offset: u32,
    key_node: KeyNode,
}

impl<'a> RegistryKey<'a> {
    /// The key's name.
    pub fn name(&self) -> Result<String> {
        Ok(self.key_node.name.clone())
    }

    /// Number of subkeys, as declared by the `nk` record.
    pub fn subkey_count(&self) -> u32 {
        self.key_node.subkey_count
    }

    /// Number of values, as declared by the `nk` record.
    pub fn value_count(&self) -> u32 {
        self.key_node.value_count
    }

    /// This key's parent, or `Ok(None)` for a root key (or one whose stored
    /// parent offset doesn't resolve to a used block).
    pub fn parent(&self) -> Result<Option<RegistryKey<'a>>> {
        match self.hive.node_parent(self.offset) {
            Ok(offset) => Ok(Some(self.hive.get_key(offset)?)),
            Err(RegistryError::NoKey) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// This key's children, in reading order.
    pub fn subkeys(&self) -> Result<Vec<RegistryKey<'a>>> {
        self.hive
            .node_children(self.offset)?
            .into_iter()
            .map(|offset| self.hive.get_key(offset))
            .collect()
    }

    /// Case-insensitive child lookup by name.
    pub fn get_child(&self, name: &str) -> Result<Option<RegistryKey<'a>>> {
        match self.hive.node_get_child(self.offset, name)? {
            Some(offset) => Ok(Some(self.hive.get_key(offset)?)),
            None => Ok(None),
        }
    }

    /// This key's values, in reading order.
    pub fn values(&self) -> Result<Vec<RegistryValue<'a>>> {
        self.hive
            .node_values(self.offset)?
            .into_iter()
            .map(|offset| Ok(RegistryValue { hive: self.hive, offset }))
            .collect()
    }

    /// Case-insensitive value lookup by name.
    pub fn value(&self, name: &str) -> Result<RegistryValue<'a>> {
        match self.hive.node_get_value(self.offset, name)? {
            Some(offset) => Ok(RegistryValue { hive: self.hive, offset }),
            None => Err(RegistryError::not_found("value", name)),
        }
    }
}

/// A registry value, borrowed from its owning [`Hive`].
pub struct RegistryValue<'a> {
    hive: &'a Hive,
    /// Absolute offset of this value's `vk` cell.
    pub offset: u32,
}

impl<'a> RegistryValue<'a> {
    /// The value's name.
    pub fn name(&self) -> Result<String> {
        Ok(self.hive.value_key(self.offset)?.name)
    }

    /// The value's declared type.
    pub fn data_type(&self) -> Result<ValueType> {
        Ok(self.hive.value_key(self.offset)?.data_type)
    }

    /// The value's typed data.
    pub fn data(&self) -> Result<ValueData> {
        let vk = self.hive.value_key(self.offset)?;
        let raw = self.hive.value_raw(self.offset)?;
        ValueData::parse(&raw, vk.data_type, self.offset)
    }

    /// The value's raw, undecoded bytes.
    pub fn raw_data(&self) -> Result<Vec<u8>> {
        self.hive.value_raw(self.offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ValueData;

    fn writable_minimal() -> Hive {
        let data = crate::testutil::minimal_hive("ROOT");
        Hive::from_bytes(data, OpenFlags { write: true, ..Default::default() }, Limits::default()).unwrap()
    }

    #[test]
    fn opens_minimal_hive_read_only() {
        let data = crate::testutil::minimal_hive("ROOT");
        let hive = Hive::from_bytes(data, OpenFlags::default(), Limits::default()).unwrap();
        assert!(!hive.is_writable());
        let root = hive.root_key().unwrap();
        assert_eq!(root.name().unwrap(), "ROOT");
        assert_eq!(root.subkey_count(), 0);
    }

    #[test]
    fn read_only_handle_rejects_mutation() {
        let mut hive = Hive::from_bytes(
            crate::testutil::minimal_hive("ROOT"),
            OpenFlags::default(),
            Limits::default(),
        )
        .unwrap();
        let root = hive.root();
        let result = hive.add_child(root, "New");
        assert!(matches!(result.unwrap_err(), RegistryError::ReadOnly));
    }

    #[test]
    fn add_child_set_values_and_commit_round_trip() {
        let mut hive = writable_minimal();
        let root = hive.root();

        let child = hive.add_child(root, "NewKey").unwrap();
        hive.set_values(
            child,
            &[NewValue { name: "v".to_string(), data: ValueData::Dword(0x1122_3344) }],
        )
        .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let out_path = dir.path().join("out.hive");
        hive.commit(Some(&out_path)).unwrap();

        let reopened = Hive::open(&out_path, OpenFlags::default()).unwrap();
        let root_key = reopened.root_key().unwrap();
        let new_key = root_key.get_child("NewKey").unwrap().expect("NewKey should exist");
        let v = new_key.value("v").unwrap();
        assert_eq!(reopened.value_dword(v.offset).unwrap(), 0x1122_3344);
    }

    #[test]
    fn root_key_parent_is_self_referential() {
        // `testutil::minimal_hive` gives the root `nk` a self-referential
        // parent offset, matching the real-world quirk in spec scenario 1
        // ("some hives self-reference"); `node_parent` resolves that to a
        // valid block rather than failing, so `parent()` returns the root
        // itself instead of `None`.
        let hive = writable_minimal();
        let root = hive.root_key().unwrap();
        let parent = root.parent().unwrap().expect("self-referential root resolves to a parent");
        assert_eq!(parent.offset, root.offset);
    }

    #[test]
    fn child_key_parent_resolves_back_to_root() {
        let mut hive = writable_minimal();
        let root = hive.root();
        let child_offset = hive.add_child(root, "Child").unwrap();
        let child = hive.get_key(child_offset).unwrap();
        let parent = child.parent().unwrap().expect("child should have a parent");
        assert_eq!(parent.name().unwrap(), "ROOT");
    }

    #[test]
    fn delete_child_via_handle_removes_subtree() {
        let mut hive = writable_minimal();
        let root = hive.root();
        let child = hive.add_child(root, "Temp").unwrap();
        hive.delete_child(child).unwrap();
        assert!(hive.node_get_child(root, "Temp").unwrap().is_none());
    }

    #[test]
    fn registry_value_data_decodes_multi_string() {
        let mut hive = writable_minimal();
        let root = hive.root();
        hive.set_values(
            root,
            &[NewValue {
                name: "Multi".to_string(),
                data: ValueData::MultiString(vec!["One".to_string(), "Two".to_string()]),
            }],
        )
        .unwrap();

        let root_key = hive.root_key().unwrap();
        let value = root_key.value("Multi").unwrap();
        match value.data().unwrap() {
            ValueData::MultiString(strings) => assert_eq!(strings, vec!["One".to_string(), "Two".to_string()]),
            other => panic!("expected MultiString, got {:?}", other),
        }
    }
}
