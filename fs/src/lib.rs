// Copyright 2024 Kevin Ludwig
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Shared item/record types for UFS, plus the generic [`FileSystem`]
//! interface its implementation (`ufscore_fs_ufs`) provides to the file
//! service dispatcher (`ufscore_fileservice`).

pub use ufscore_err::*;

use zerocopy::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Maximum bytes in an item's name head (spec.md §6).
pub const MAX_NAME_LENGTH: usize = 16;
/// Maximum bytes in an item's extension (spec.md §6).
pub const MAX_EXT_LENGTH: usize = 3;
/// Default cap on items per device (spec.md §6), overridable via [`Cfg`].
pub const DEFAULT_MAX_ITEMS: usize = 20;

/// `FREE`/`BAD`/`END` sentinels for the 16-bit cluster map (spec.md §3.2).
pub mod cluster_map {
    pub const END: u16 = 0xFFFD;
    pub const BAD: u16 = 0xFFFE;
    pub const FREE: u16 = 0xFFFF;
}

/// A location within a zone: either (item-zone sector, slot) for an item
/// record, or (map-zone sector, slot) for a cluster-map entry — the same
/// pair shape the on-disk `first_cluster` field packs into one `u16`
/// (spec.md §3.3: `sector_id * (Ssec/2) + slot`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Location {
    pub sector_id: u16,
    pub slot: u16,
}

impl Location {
    pub fn from_flat(flat: u16, slots_per_sector: u16) -> Self {
        Self {
            sector_id: flat / slots_per_sector,
            slot: flat % slots_per_sector,
        }
    }

    pub fn to_flat(self, slots_per_sector: u16) -> u16 {
        self.sector_id * slots_per_sector + self.slot
    }
}

/// Parsed `(head, extension, length)` triple for an item name (spec.md
/// §4.B.2). `extension` is empty for folders.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ItemName {
    pub head: [u8; MAX_NAME_LENGTH],
    pub extension: [u8; MAX_EXT_LENGTH],
    pub length: u8,
    pub extension_length: u8,
}

impl ItemName {
    /// Strips characters outside `[A-Za-z0-9_-]` and splits on the first
    /// `.` into head/extension, matching spec.md §4.B.2 step 1.
    pub fn parse(raw: &str) -> Self {
        let cleaned: String = raw
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-' || *c == '.')
            .collect();

        let (head_str, ext_str) = match cleaned.split_once('.') {
            Some((h, e)) => (h, e),
            None => (cleaned.as_str(), ""),
        };

        let mut head = [0u8; MAX_NAME_LENGTH];
        let head_bytes = head_str.as_bytes();
        let head_len = head_bytes.len().min(MAX_NAME_LENGTH);
        head[..head_len].copy_from_slice(&head_bytes[..head_len]);

        let mut extension = [0u8; MAX_EXT_LENGTH];
        let ext_bytes = ext_str.as_bytes();
        let ext_len = ext_bytes.len().min(MAX_EXT_LENGTH);
        extension[..ext_len].copy_from_slice(&ext_bytes[..ext_len]);

        Self {
            head,
            extension,
            length: head_len as u8,
            extension_length: ext_len as u8,
        }
    }

    pub fn is_folder(&self) -> bool {
        self.extension_length == 0
    }

    pub fn extension_str(&self) -> &str {
        std::str::from_utf8(&self.extension[..self.extension_length as usize]).unwrap_or("")
    }

    pub fn display_name(&self) -> String {
        let head = String::from_utf8_lossy(&self.head[..self.length as usize]).into_owned();
        if self.is_folder() {
            head
        } else {
            format!("{head}.{}", self.extension_str())
        }
    }
}

/// 32-byte on-media item record (spec.md §3.3). Stored XOR-obfuscated in the
/// item zone except for bytes that are already `0x00`.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct ItemRecord {
    pub name_head: [u8; MAX_NAME_LENGTH],
    pub extension: [u8; MAX_EXT_LENGTH],
    pub name_length: u8,
    pub first_cluster: U16,
    pub parent: U16,
    pub reserved: [U16; 2],
    pub size: U32,
}

impl ItemRecord {
    pub const SIZE: usize = core::mem::size_of::<Self>();

    pub fn is_free(&self) -> bool {
        self.name_head[0] == 0
    }

    pub fn is_folder(&self) -> bool {
        self.extension == [0u8; MAX_EXT_LENGTH]
    }
}

/// In-memory item status (spec.md §3.5, supplemented per SPEC_FULL.md with
/// the original firmware's extra folder/root/delete-marker distinctions —
/// these extra variants carry no behavior spec.md doesn't already imply).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemStatus {
    Free,
    FileExists,
    FolderExists,
    FileDeleted,
    FolderDeleted,
    Root,
}

/// Fully decoded item metadata, the in-memory counterpart of [`ItemRecord`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemInfo {
    pub name: ItemName,
    pub first_cluster: u16,
    pub parent: u16,
    pub size: u32,
}

/// One entry in a directory listing (spec.md §4.D command 1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub item_id: u16,
    pub name: ItemName,
    pub size: u32,
}

/// List of file extensions whose payload bytes get additionally XOR-encoded
/// with `device_id[0] | 0xAA` (spec.md §3.4, §4.B.8).
#[derive(Debug, Clone, Default)]
pub struct EncodedExtensions(pub Vec<String>);

impl EncodedExtensions {
    pub fn contains(&self, extension: &str) -> bool {
        self.0.iter().any(|e| e.eq_ignore_ascii_case(extension))
    }
}

/// UFS configuration knobs (spec.md §3.4, §4.B.1).
#[derive(Debug, Clone)]
pub struct Cfg {
    pub max_items: usize,
    pub encoded_extensions: EncodedExtensions,
}

impl Default for Cfg {
    fn default() -> Self {
        Self {
            max_items: DEFAULT_MAX_ITEMS,
            encoded_extensions: EncodedExtensions::default(),
        }
    }
}

/// Generic file system contract implemented by `ufscore_fs_ufs::Ufs`.
/// Parameterizing the file service dispatcher over this trait (rather than
/// the concrete type) keeps the dispatcher testable against an in-memory
/// double, the same way the teacher's `FileSystemServer<DS: DataStorage>`
/// is generic over storage rather than hard-coding a backend.
pub trait FileSystem {
    type Item;

    fn mount(&mut self, path: &str) -> Result<()>;
    fn open_item(&mut self, name: &str) -> Result<Self::Item>;
    fn close_item(&mut self, item: Self::Item);
    fn delete_item(&mut self, item: Self::Item) -> Result<()>;
    fn delete_folder(&mut self, name: &str) -> Result<()>;
    fn rename_item(&mut self, item: &mut Self::Item, new_name: &str) -> Result<()>;

    fn read_file(&self, item: &Self::Item, offset: u32, buf: &mut [u8]) -> Result<u32>;
    fn write_file(&mut self, item: &mut Self::Item, data: &[u8], checksum: bool) -> Result<()>;
    fn write_append(&mut self, item: &mut Self::Item, data: &[u8], checksum: bool) -> Result<()>;

    fn item_info(&self, item: &Self::Item) -> ItemInfo;
    fn list_items(&mut self) -> Result<Vec<Entry>>;

    fn used_size(&self) -> u32;
    fn device_size(&self) -> u32;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_splits_head_and_extension() {
        let n = ItemName::parse("boot.bin");
        assert_eq!(&n.head[..n.length as usize], b"boot");
        assert_eq!(n.extension_str(), "bin");
        assert!(!n.is_folder());
    }

    #[test]
    fn parse_strips_special_characters() {
        let n = ItemName::parse("my file!@#.txt");
        assert_eq!(&n.head[..n.length as usize], b"myfile");
        assert_eq!(n.extension_str(), "txt");
    }

    #[test]
    fn parse_with_no_extension_is_a_folder() {
        let n = ItemName::parse("folder1");
        assert!(n.is_folder());
        assert_eq!(n.display_name(), "folder1");
    }

    #[test]
    fn location_flat_roundtrip() {
        let loc = Location { sector_id: 3, slot: 7 };
        let flat = loc.to_flat(16);
        assert_eq!(Location::from_flat(flat, 16), loc);
    }

    #[test]
    fn item_record_is_32_bytes() {
        assert_eq!(ItemRecord::SIZE, 32);
    }
}
