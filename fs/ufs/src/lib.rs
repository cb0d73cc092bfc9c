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

//! NOR-flash-backed file system: a boot sector, an XOR-obfuscated item zone,
//! a raw 16-bit cluster chain map, and a cluster data zone.

use log::error;
use ufscore_bdev::BlockDevice;
use ufscore_fs::{
    cluster_map, Cfg, Entry, FileSystem, FsError, ItemInfo, ItemName, ItemRecord, ItemStatus,
    Location, Result,
};
use zerocopy::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

const MAGIC: [u8; 3] = *b"UFS";
const TERMINATOR: [u8; 2] = *b"\r\n";
const OBFUSCATION_KEY: u8 = 0xAA;
const MAX_PATH_PARTS: usize = 5;

/// Fixed-layout header occupying the start of sector 0.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct BootSector {
    magic: [u8; 3],
    item_zone_first: U16,
    cluster_map_first: U16,
    cluster_data_first: U16,
    sectors_per_cluster: U16,
    device_id: [u8; 8],
    terminator: [u8; 2],
}

impl BootSector {
    const SIZE: usize = core::mem::size_of::<Self>();

    fn checksum(bytes: &[u8]) -> u8 {
        let sum = bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
        sum ^ OBFUSCATION_KEY
    }
}

/// Per-byte obfuscation used for the boot header and item zone: `0x00`
/// bytes (the "free slot" marker) pass through untouched (spec.md §4.B.8).
fn obfuscate(buf: &mut [u8]) {
    for b in buf.iter_mut() {
        if *b != 0 {
            *b ^= OBFUSCATION_KEY;
        }
    }
}

/// An open item: file or folder handle returned by [`Ufs::open_item`].
pub struct Item {
    location: Location,
    info: ItemInfo,
    chain: Vec<u16>,
    status: ItemStatus,
    encode_enable: bool,
}

impl Item {
    pub fn status(&self) -> ItemStatus {
        self.status
    }

    pub fn info(&self) -> &ItemInfo {
        &self.info
    }

    pub fn item_id(&self, slots_per_sector: u16) -> u16 {
        self.location.to_flat(slots_per_sector)
    }
}

pub struct Ufs<D: BlockDevice> {
    device: D,
    cfg: Cfg,

    item_zone_first: u16,
    cluster_map_first: u16,
    cluster_data_first: u16,
    sectors_per_cluster: u16,
    device_id: [u8; 8],

    used_size: u32,
    latest_cluster: u16,

    path_id: u16,
    path_name: String,

    map_sector_cache: Option<(u16, Vec<u8>)>,
}

impl<D: BlockDevice> Ufs<D> {
    /// Opens the device, validating the boot sector; fast-formats on any
    /// mismatch (spec.md §4.B.1, invariant 1).
    pub fn open(mut device: D, cfg: Cfg) -> Result<Self> {
        device.init()?;
        let mut device_id = [0u8; 8];
        device.read_unique_id(&mut device_id)?;

        let mut ufs = Self {
            device,
            cfg,
            item_zone_first: 0,
            cluster_map_first: 0,
            cluster_data_first: 0,
            sectors_per_cluster: 0,
            device_id,
            used_size: 0,
            latest_cluster: 0,
            path_id: 0,
            path_name: "/".to_string(),
            map_sector_cache: None,
        };

        if !ufs.boot_sector_valid()? {
            ufs.fast_format()?;
        } else {
            ufs.load_boot_sector()?;
        }
        Ok(ufs)
    }

    fn boot_sector_valid(&self) -> Result<bool> {
        let mut buf = vec![0u8; self.device.sector_size() as usize];
        self.device.read_sector(0, &mut buf)?;
        if buf.len() < BootSector::SIZE + 1 {
            return Ok(false);
        }
        let header = match BootSector::ref_from_bytes(&buf[..BootSector::SIZE]) {
            Ok(h) => h,
            Err(_) => return Ok(false),
        };
        if header.magic != MAGIC || header.terminator != TERMINATOR {
            return Ok(false);
        }
        let expected = BootSector::checksum(&buf[..BootSector::SIZE]);
        Ok(buf[BootSector::SIZE] == expected)
    }

    fn load_boot_sector(&mut self) -> Result<()> {
        let mut buf = vec![0u8; self.device.sector_size() as usize];
        self.device.read_sector(0, &mut buf)?;
        let header = BootSector::ref_from_bytes(&buf[..BootSector::SIZE]).unwrap();
        self.item_zone_first = header.item_zone_first.get();
        self.cluster_map_first = header.cluster_map_first.get();
        self.cluster_data_first = header.cluster_data_first.get();
        self.sectors_per_cluster = header.sectors_per_cluster.get();
        self.device_id = header.device_id;
        Ok(())
    }

    fn fast_format(&mut self) -> Result<()> {
        self.device.lock();

        let sectors_per_block = self.device.sectors_per_block();
        self.device.erase_block(0)?;
        if sectors_per_block > 0 {
            self.device.erase_block(1)?;
        }

        let ssec = self.device.sector_size();
        let ndev = self.device.sector_count();
        let max_items = self.cfg.max_items.max(1) as u32;

        let item_zone_first: u32 = 1;
        let item_zone_sectors = (max_items * ItemRecord::SIZE as u32).div_ceil(ssec);
        let cluster_map_first = item_zone_first + item_zone_sectors + 1;

        let map_sectors_cap = (ndev / 50).max(1);
        let remaining = ndev.saturating_sub(cluster_map_first + 1);
        let slots_per_sector = (ssec / 2).max(1);
        let map_sectors_needed = remaining.div_ceil(slots_per_sector).max(1);
        let map_sectors = map_sectors_needed.min(map_sectors_cap);

        let mut sectors_per_cluster = map_sectors_needed.div_ceil(map_sectors_cap) + 1;
        if sectors_per_block > 0 && sectors_per_cluster < sectors_per_block {
            sectors_per_cluster = sectors_per_block;
        }

        let cluster_data_first_raw = cluster_map_first + map_sectors;
        let cluster_data_first = cluster_data_first_raw.div_ceil(16) * 16;

        self.item_zone_first = item_zone_first as u16;
        self.cluster_map_first = cluster_map_first as u16;
        self.cluster_data_first = cluster_data_first as u16;
        self.sectors_per_cluster = sectors_per_cluster as u16;
        self.used_size = 0;
        self.latest_cluster = 0;
        self.map_sector_cache = None;

        self.write_boot_sector()?;

        let mut zero_sector = vec![0u8; ssec as usize];
        for i in 0..item_zone_sectors {
            self.device.erase_sector(item_zone_first + i)?;
            self.device.write_sector(item_zone_first + i, &zero_sector)?;
        }
        zero_sector[0] = b'/' ^ OBFUSCATION_KEY;
        self.device.erase_sector(item_zone_first)?;
        self.device.write_sector(item_zone_first, &zero_sector)?;

        let mut free_sector = vec![0xFFu8; ssec as usize];
        for i in 0..map_sectors {
            self.device.erase_sector(cluster_map_first + i)?;
            self.device
                .write_sector(cluster_map_first + i, &free_sector)?;
        }
        free_sector[0] = (cluster_map::END & 0xFF) as u8;
        free_sector[1] = (cluster_map::END >> 8) as u8;
        self.device.erase_sector(cluster_map_first)?;
        self.device.write_sector(cluster_map_first, &free_sector)?;

        self.path_id = 0;
        self.path_name = "/".to_string();

        self.device.unlock();
        Ok(())
    }

    fn write_boot_sector(&mut self) -> Result<()> {
        let ssec = self.device.sector_size() as usize;
        let mut buf = vec![0u8; ssec];
        let header = BootSector {
            magic: MAGIC,
            item_zone_first: U16::new(self.item_zone_first),
            cluster_map_first: U16::new(self.cluster_map_first),
            cluster_data_first: U16::new(self.cluster_data_first),
            sectors_per_cluster: U16::new(self.sectors_per_cluster),
            device_id: self.device_id,
            terminator: TERMINATOR,
        };
        buf[..BootSector::SIZE].copy_from_slice(header.as_bytes());
        buf[BootSector::SIZE] = BootSector::checksum(&buf[..BootSector::SIZE]);

        self.device.erase_sector(0)?;
        self.device.write_sector(0, &buf)
    }

    fn items_per_sector(&self) -> u16 {
        (self.device.sector_size() / ItemRecord::SIZE as u32) as u16
    }

    fn map_slots_per_sector(&self) -> u16 {
        (self.device.sector_size() / 2) as u16
    }

    fn cluster_bytes(&self) -> u32 {
        self.sectors_per_cluster as u32 * self.device.sector_size()
    }

    fn item_zone_sectors(&self) -> u16 {
        let bytes = self.cfg.max_items as u32 * ItemRecord::SIZE as u32;
        bytes.div_ceil(self.device.sector_size()) as u16
    }

    fn read_item_zone_sector(&self, sector_id: u16) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.device.sector_size() as usize];
        self.device
            .read_sector(self.item_zone_first as u32 + sector_id as u32, &mut buf)?;
        obfuscate(&mut buf);
        Ok(buf)
    }

    fn write_item_zone_sector(&mut self, sector_id: u16, plain: &[u8]) -> Result<()> {
        let mut obfuscated = plain.to_vec();
        obfuscate(&mut obfuscated);
        let sector = self.item_zone_first as u32 + sector_id as u32;
        self.device.erase_sector(sector)?;
        self.device.write_sector(sector, &obfuscated)
    }

    fn record_at(&self, sector_buf: &[u8], slot: u16, record_size: usize) -> ItemRecord {
        let start = slot as usize * record_size;
        let mut bytes = [0u8; ItemRecord::SIZE];
        bytes.copy_from_slice(&sector_buf[start..start + record_size]);
        ItemRecord::read_from_bytes(&bytes).expect("fixed-size item record")
    }

    fn write_record(&mut self, location: Location, record: &ItemRecord) -> Result<()> {
        let mut sector_buf = self.read_item_zone_sector(location.sector_id)?;
        let record_size = ItemRecord::SIZE;
        let start = location.slot as usize * record_size;
        sector_buf[start..start + record_size].copy_from_slice(record.as_bytes());
        self.write_item_zone_sector(location.sector_id, &sector_buf)
    }

    /// Linear scan matching spec.md §4.B.2 step 2: returns the location and
    /// decoded record of the first exact match, plus the first free slot
    /// seen along the way.
    fn find_item(
        &self,
        name: &ItemName,
        parent: u16,
    ) -> Result<(Option<(Location, ItemRecord)>, Option<Location>)> {
        let items_per_sector = self.items_per_sector();
        let record_size = ItemRecord::SIZE;
        let mut free_slot = None;
        let zone_sectors = self.item_zone_sectors();

        for sector_id in 0..zone_sectors {
            let sector_buf = self.read_item_zone_sector(sector_id)?;
            for slot in 0..items_per_sector {
                let record = self.record_at(&sector_buf, slot, record_size);
                let location = Location { sector_id, slot };
                if record.is_free() {
                    if free_slot.is_none() {
                        free_slot = Some(location);
                    }
                    continue;
                }
                let matches_name = record.name_length as usize == name.length as usize
                    && record.name_head[..name.length as usize]
                        == name.head[..name.length as usize]
                    && record.extension[..name.extension_length as usize]
                        == name.extension[..name.extension_length as usize];
                if matches_name && record.parent.get() == parent {
                    return Ok((Some((location, record)), free_slot));
                }
            }
        }
        Ok((None, free_slot))
    }

    fn decode_item_info(&self, record: &ItemRecord, name: &ItemName) -> ItemInfo {
        ItemInfo {
            name: name.clone(),
            first_cluster: record.first_cluster.get(),
            parent: record.parent.get(),
            size: record.size.get(),
        }
    }

    /// Walks the FAT-like chain from `first`, stopping at `END` (spec.md
    /// §4.B.6 precursor / invariant 3).
    fn walk_chain(&mut self, first: u16) -> Result<Vec<u16>> {
        let mut chain = Vec::new();
        let mut cursor = first;
        if cursor == cluster_map::END {
            chain.push(cursor);
            return Ok(chain);
        }
        loop {
            chain.push(cursor);
            let next = self.read_map_slot(cursor)?;
            match next {
                cluster_map::END => {
                    chain.push(next);
                    break;
                }
                cluster_map::BAD | cluster_map::FREE => {
                    error!("cluster chain hit {next:#06x} while walking from {first}");
                    return Err(FsError::MemSectorBad.into());
                }
                _ => cursor = next,
            }
        }
        Ok(chain)
    }

    fn map_location(&self, cluster: u16) -> Location {
        Location::from_flat(cluster, self.map_slots_per_sector())
    }

    fn load_map_sector(&mut self, sector_id: u16) -> Result<()> {
        if let Some((cached, _)) = &self.map_sector_cache {
            if *cached == sector_id {
                return Ok(());
            }
        }
        self.flush_map_sector()?;
        let mut buf = vec![0u8; self.device.sector_size() as usize];
        self.device
            .read_sector(self.cluster_map_first as u32 + sector_id as u32, &mut buf)?;
        self.map_sector_cache = Some((sector_id, buf));
        Ok(())
    }

    fn flush_map_sector(&mut self) -> Result<()> {
        if let Some((sector_id, buf)) = self.map_sector_cache.take() {
            let sector = self.cluster_map_first as u32 + sector_id as u32;
            self.device.erase_sector(sector)?;
            self.device.write_sector(sector, &buf)?;
        }
        Ok(())
    }

    fn read_map_slot(&mut self, cluster: u16) -> Result<u16> {
        let location = self.map_location(cluster);
        self.load_map_sector(location.sector_id)?;
        let (_, buf) = self.map_sector_cache.as_ref().unwrap();
        let offset = location.slot as usize * 2;
        Ok(u16::from_le_bytes([buf[offset], buf[offset + 1]]))
    }

    fn write_map_slot(&mut self, cluster: u16, value: u16) -> Result<()> {
        let location = self.map_location(cluster);
        self.load_map_sector(location.sector_id)?;
        let (_, buf) = self.map_sector_cache.as_mut().unwrap();
        let offset = location.slot as usize * 2;
        let bytes = value.to_le_bytes();
        buf[offset] = bytes[0];
        buf[offset + 1] = bytes[1];
        Ok(())
    }

    fn max_clusters(&self) -> u16 {
        let slots_per_sector = self.map_slots_per_sector();
        let data_sectors = self
            .device
            .sector_count()
            .saturating_sub(self.cluster_data_first as u32);
        let by_data = (data_sectors / self.sectors_per_cluster.max(1) as u32) as u16;
        let map_sectors = self
            .device
            .sector_count()
            .saturating_sub(self.cluster_map_first as u32);
        let by_map = (map_sectors as u16).saturating_mul(slots_per_sector);
        by_data.min(by_map).max(1)
    }

    /// Rotating-cursor free-cluster search and chain linkage (spec.md
    /// §4.B.3). `chain` must already have its final length; this fills
    /// `chain[0..len-1]` with fresh clusters and `chain[len-1]` with `END`.
    fn order_clusters(&mut self, chain: &mut Vec<u16>) -> Result<()> {
        let n = chain.len();
        if n == 0 {
            return Ok(());
        }
        let max_clusters = self.max_clusters();
        let start = self.latest_cluster;
        let mut cursor = start;
        let mut allocated = Vec::with_capacity(n - 1);

        for _ in 0..n.saturating_sub(1) {
            let mut found = None;
            for _ in 0..max_clusters {
                cursor = (cursor + 1) % max_clusters;
                if self.read_map_slot(cursor)? == cluster_map::FREE {
                    found = Some(cursor);
                    break;
                }
                if cursor == start {
                    break;
                }
            }
            let cluster = found.ok_or_else(|| {
                error!("cluster map exhausted while allocating {n} clusters");
                FsError::FullMem
            })?;

            if self.sectors_per_cluster as u32 == self.device.sectors_per_block() {
                let block = cluster as u32 * self.sectors_per_cluster as u32
                    / self.device.sectors_per_block().max(1);
                self.device.erase_block(block)?;
            } else {
                let first_sector = self.cluster_data_first as u32
                    + cluster as u32 * self.sectors_per_cluster as u32;
                for s in 0..self.sectors_per_cluster as u32 {
                    self.device.erase_sector(first_sector + s)?;
                }
            }

            allocated.push(cluster);
            self.latest_cluster = cluster;
        }
        allocated.push(cluster_map::END);

        for i in 0..n {
            chain[i] = allocated[i];
        }
        for i in 0..n.saturating_sub(1) {
            self.write_map_slot(chain[i], chain[i + 1])?;
        }
        self.flush_map_sector()?;
        self.used_size = self
            .used_size
            .saturating_add(allocated.len().saturating_sub(1) as u32 * self.cluster_bytes());
        Ok(())
    }

    /// Reverse-order release, preserving `BAD` slots (spec.md §4.B.4).
    fn clean_clusters(&mut self, chain: &[u16]) -> Result<()> {
        for &cluster in chain.iter().rev() {
            if cluster == cluster_map::END {
                continue;
            }
            let current = self.read_map_slot(cluster)?;
            if current != cluster_map::BAD {
                self.write_map_slot(cluster, cluster_map::FREE)?;
                self.used_size = self.used_size.saturating_sub(self.cluster_bytes());
            }
        }
        self.flush_map_sector()?;
        Ok(())
    }

    fn cluster_data_sector(&self, cluster: u16, sector_in_cluster: u16) -> u32 {
        self.cluster_data_first as u32
            + cluster as u32 * self.sectors_per_cluster as u32
            + sector_in_cluster as u32
    }

    fn encode_byte(&self, b: u8) -> u8 {
        b ^ (self.device_id[0] | OBFUSCATION_KEY)
    }

    fn write_chain_data(
        &mut self,
        chain: &[u16],
        data: &[u8],
        encode_enable: bool,
        checksum_enable: bool,
    ) -> Result<()> {
        let ssec = self.device.sector_size() as usize;
        let mut offset = 0usize;

        for (idx, &cluster) in chain.iter().enumerate() {
            if cluster == cluster_map::END {
                break;
            }
            for s in 0..self.sectors_per_cluster {
                let mut scratch = vec![0xFFu8; ssec];
                let remaining = data.len().saturating_sub(offset);
                let take = remaining.min(ssec);
                if take > 0 {
                    scratch[..take].copy_from_slice(&data[offset..offset + take]);
                }
                if encode_enable {
                    for b in scratch.iter_mut() {
                        *b = self.encode_byte(*b);
                    }
                }
                let sector = self.cluster_data_sector(cluster, s);
                self.device.erase_sector(sector)?;
                self.device.write_sector(sector, &scratch)?;

                if checksum_enable {
                    let expected = Self::sector_checksum(&scratch);
                    let mut readback = vec![0u8; ssec];
                    self.device.read_sector(sector, &mut readback)?;
                    if Self::sector_checksum(&readback) != expected {
                        error!("checksum mismatch on cluster {cluster} sector {s}, retiring it");
                        self.write_map_slot(cluster, cluster_map::BAD)?;
                        self.flush_map_sector()?;
                        self.clean_clusters(&chain[idx + 1..])?;
                        return Err(FsError::SumSectorFail.into());
                    }
                }
                offset += take;
            }
        }
        Ok(())
    }

    fn sector_checksum(buf: &[u8]) -> u8 {
        let sum = buf.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
        sum ^ OBFUSCATION_KEY
    }

    fn slots_per_cluster_for(&self, len: u32) -> usize {
        let cluster_bytes = self.cluster_bytes().max(1);
        (len.div_ceil(cluster_bytes) + 1) as usize
    }

    fn parse_and_split(name: &str) -> ItemName {
        ItemName::parse(name)
    }
}

impl<D: BlockDevice> FileSystem for Ufs<D> {
    type Item = Item;

    /// Splits `path` on `/` (at most [`MAX_PATH_PARTS`] components),
    /// walking from root and creating any missing folder along the way
    /// (spec.md §4.B.1).
    fn mount(&mut self, path: &str) -> Result<()> {
        let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
        if parts.len() > MAX_PATH_PARTS {
            return Err(FsError::InvalidSector.into());
        }

        let mut parent = 0u16;
        let mut display = String::from("/");
        for part in &parts {
            let name = Self::parse_and_split(part);
            let (found, free_slot) = self.find_item(&name, parent)?;
            let item_id = match found {
                Some((location, _)) => location.to_flat(self.items_per_sector()),
                None => {
                    let location = free_slot.ok_or(FsError::FullFile)?;
                    let record = ItemRecord {
                        name_head: name.head,
                        extension: [0u8; 3],
                        name_length: name.length,
                        first_cluster: U16::new(cluster_map::END),
                        parent: U16::new(parent),
                        reserved: [U16::new(0); 2],
                        size: U32::new(0),
                    };
                    self.write_record(location, &record)?;
                    location.to_flat(self.items_per_sector())
                }
            };
            parent = item_id;
            display.push_str(part);
            display.push('/');
        }

        self.path_id = parent;
        self.path_name = display;
        Ok(())
    }

    /// Opens (creating if absent) an item under the current mounted path
    /// (spec.md §4.B.2).
    fn open_item(&mut self, name: &str) -> Result<Item> {
        let parsed = Self::parse_and_split(name);
        let (found, free_slot) = self.find_item(&parsed, self.path_id)?;

        if let Some((location, record)) = found {
            let info = self.decode_item_info(&record, &parsed);
            let chain = if record.is_folder() {
                Vec::new()
            } else {
                self.walk_chain(record.first_cluster.get())?
            };
            let status = if record.is_folder() {
                ItemStatus::FolderExists
            } else {
                ItemStatus::FileExists
            };
            let encode_enable = self.cfg.encoded_extensions.contains(parsed.extension_str());
            return Ok(Item {
                location,
                info,
                chain,
                status,
                encode_enable,
            });
        }

        let location = free_slot.ok_or(FsError::FullFile)?;
        if parsed.is_folder() {
            let record = ItemRecord {
                name_head: parsed.head,
                extension: [0u8; 3],
                name_length: parsed.length,
                first_cluster: U16::new(cluster_map::END),
                parent: U16::new(self.path_id),
                reserved: [U16::new(0); 2],
                size: U32::new(0),
            };
            self.write_record(location, &record)?;
            let info = self.decode_item_info(&record, &parsed);
            return Ok(Item {
                location,
                info,
                chain: Vec::new(),
                status: ItemStatus::FolderExists,
                encode_enable: false,
            });
        }

        let mut chain = vec![0u16; 2];
        self.order_clusters(&mut chain)?;
        let first_cluster = chain[0];
        self.write_map_slot(first_cluster, cluster_map::END)?;
        self.flush_map_sector()?;

        let record = ItemRecord {
            name_head: parsed.head,
            extension: parsed.extension,
            name_length: parsed.length,
            first_cluster: U16::new(first_cluster),
            parent: U16::new(self.path_id),
            reserved: [U16::new(0); 2],
            size: U32::new(0),
        };
        self.write_record(location, &record)?;
        let info = self.decode_item_info(&record, &parsed);
        let encode_enable = self.cfg.encoded_extensions.contains(parsed.extension_str());
        Ok(Item {
            location,
            info,
            chain,
            status: ItemStatus::FileExists,
            encode_enable,
        })
    }

    fn close_item(&mut self, mut item: Item) {
        item.chain.clear();
    }

    fn delete_item(&mut self, item: Item) -> Result<()> {
        let chain = self.walk_chain(item.info.first_cluster)?;
        self.clean_clusters(&chain)?;
        let empty = ItemRecord::new_zeroed();
        self.write_record(item.location, &empty)
    }

    fn delete_folder(&mut self, name: &str) -> Result<()> {
        let saved_path_id = self.path_id;
        let saved_path_name = self.path_name.clone();

        let folder = self.open_item(name)?;
        if folder.status != ItemStatus::FolderExists {
            return Err(FsError::ItemNotFolder.into());
        }
        let folder_id = folder.location.to_flat(self.items_per_sector());

        self.path_id = folder_id;
        let entries = self.list_items()?;
        for entry in entries {
            let child_name = entry.name.display_name();
            let child = self.open_item(&child_name)?;
            match child.status {
                ItemStatus::FolderExists => {
                    let nested_path = format!("{}{}/", saved_path_name, child_name);
                    self.close_item(child);
                    self.delete_folder_recursive(&nested_path, entry.item_id)?;
                }
                ItemStatus::FileExists => self.delete_item(child)?,
                _ => {}
            }
        }

        self.path_id = saved_path_id;
        self.path_name = saved_path_name;
        self.delete_item(folder)
    }

    fn rename_item(&mut self, item: &mut Item, new_name: &str) -> Result<()> {
        let parsed = Self::parse_and_split(new_name);
        let (found, _) = self.find_item(&parsed, item.info.parent)?;
        if found.is_some() {
            return Err(FsError::Existed.into());
        }

        let mut sector_buf = self.read_item_zone_sector(item.location.sector_id)?;
        let record_size = ItemRecord::SIZE;
        let start = item.location.slot as usize * record_size;
        let mut record = self.record_at(&sector_buf, item.location.slot, record_size);
        record.name_head = parsed.head;
        record.extension = parsed.extension;
        record.name_length = parsed.length;
        sector_buf[start..start + record_size].copy_from_slice(record.as_bytes());
        self.write_item_zone_sector(item.location.sector_id, &sector_buf)?;

        item.info.name = parsed;
        Ok(())
    }

    /// Decodes each sector of the chain starting at `offset` (spec.md
    /// §4.B.6).
    fn read_file(&self, item: &Item, offset: u32, buf: &mut [u8]) -> Result<u32> {
        if item.status != ItemStatus::FileExists {
            return Err(FsError::ItemNotFile.into());
        }
        let cluster_bytes = self.cluster_bytes().max(1);
        let ssec = self.device.sector_size();
        let start_cluster = (offset / cluster_bytes) as usize;
        let mut within_cluster = offset % cluster_bytes;

        let mut written = 0u32;
        let remaining_in_file = item.info.size.saturating_sub(offset);
        let want = buf.len().min(remaining_in_file as usize) as u32;

        for &cluster in item.chain.iter().skip(start_cluster) {
            if cluster == cluster_map::END || written >= want {
                break;
            }
            let sector_in_cluster = (within_cluster / ssec) as u16;
            let mut within_sector = within_cluster % ssec;

            for s in sector_in_cluster..self.sectors_per_cluster {
                if written >= want {
                    break;
                }
                let sector = self.cluster_data_sector(cluster, s);
                let mut scratch = vec![0u8; ssec as usize];
                self.device.read_sector(sector, &mut scratch)?;
                if item.encode_enable {
                    for b in scratch.iter_mut() {
                        *b ^= self.device_id[0] | OBFUSCATION_KEY;
                    }
                }
                let available = ssec - within_sector;
                let take = available.min(want - written);
                let src = &scratch[within_sector as usize..within_sector as usize + take as usize];
                buf[written as usize..written as usize + take as usize].copy_from_slice(src);
                written += take;
                within_sector = 0;
            }
            within_cluster = 0;
        }
        Ok(written)
    }

    /// Frees the old chain, reallocates fresh clusters sized to `data`, and
    /// writes it (spec.md §4.B.5).
    fn write_file(&mut self, item: &mut Item, data: &[u8], checksum: bool) -> Result<()> {
        if item.status != ItemStatus::FileExists {
            return Err(FsError::ItemNotFile.into());
        }
        self.clean_clusters(&item.chain)?;

        let n = self.slots_per_cluster_for(data.len() as u32);
        let mut chain = vec![0u16; n];
        self.order_clusters(&mut chain)?;
        self.write_chain_data(&chain, data, item.encode_enable, checksum)?;

        item.chain = chain;
        item.info.size = data.len() as u32;
        item.info.first_cluster = item.chain[0];

        let mut sector_buf = self.read_item_zone_sector(item.location.sector_id)?;
        let record_size = ItemRecord::SIZE;
        let start = item.location.slot as usize * record_size;
        let mut record = self.record_at(&sector_buf, item.location.slot, record_size);
        record.first_cluster = U16::new(item.info.first_cluster);
        record.size = U32::new(item.info.size);
        sector_buf[start..start + record_size].copy_from_slice(record.as_bytes());
        self.write_item_zone_sector(item.location.sector_id, &sector_buf)?;
        Ok(())
    }

    /// Extends the chain by only the clusters the new tail needs, linking
    /// it onto the previous last cluster (spec.md §4.B.5).
    fn write_append(&mut self, item: &mut Item, data: &[u8], checksum: bool) -> Result<()> {
        if item.status != ItemStatus::FileExists {
            return Err(FsError::ItemNotFile.into());
        }
        let cluster_bytes = self.cluster_bytes().max(1);
        let old_size = item.info.size;
        let new_size = old_size + data.len() as u32;

        let old_clusters = item.chain.len().saturating_sub(1);
        let new_clusters = self.slots_per_cluster_for(new_size).saturating_sub(1);
        let extra = new_clusters.saturating_sub(old_clusters);

        if extra == 0 {
            let last_real = item
                .chain
                .iter()
                .rev()
                .find(|&&c| c != cluster_map::END)
                .copied();
            if let Some(cluster) = last_real {
                self.append_into_cluster(
                    cluster,
                    old_size % cluster_bytes,
                    data,
                    item.encode_enable,
                    checksum,
                )?;
            }
        } else {
            let mut suffix = vec![0u16; extra + 1];
            self.order_clusters(&mut suffix)?;

            let last_real = item
                .chain
                .iter()
                .rev()
                .find(|&&c| c != cluster_map::END)
                .copied();
            let within_last = old_size % cluster_bytes;
            let tail_in_last = if within_last == 0 {
                0
            } else {
                (cluster_bytes - within_last) as usize
            };
            let tail_in_last = tail_in_last.min(data.len());

            if let Some(cluster) = last_real {
                self.write_map_slot(cluster, suffix[0])?;
                self.flush_map_sector()?;
                self.append_into_cluster(
                    cluster,
                    within_last,
                    &data[..tail_in_last],
                    item.encode_enable,
                    checksum,
                )?;
            }

            self.write_chain_data(&suffix, &data[tail_in_last..], item.encode_enable, checksum)?;

            item.chain.pop();
            item.chain.extend(suffix);
        }

        item.info.size = new_size;
        let mut sector_buf = self.read_item_zone_sector(item.location.sector_id)?;
        let record_size = ItemRecord::SIZE;
        let start = item.location.slot as usize * record_size;
        let mut record = self.record_at(&sector_buf, item.location.slot, record_size);
        record.size = U32::new(new_size);
        sector_buf[start..start + record_size].copy_from_slice(record.as_bytes());
        self.write_item_zone_sector(item.location.sector_id, &sector_buf)?;
        Ok(())
    }

    fn item_info(&self, item: &Item) -> ItemInfo {
        item.info.clone()
    }

    /// Returns items whose parent is the current mounted path id (spec.md
    /// §4.B.7).
    fn list_items(&mut self) -> Result<Vec<Entry>> {
        let items_per_sector = self.items_per_sector();
        let record_size = ItemRecord::SIZE;
        let zone_sectors = self.item_zone_sectors();
        let mut entries = Vec::new();

        for sector_id in 0..zone_sectors {
            let sector_buf = self.read_item_zone_sector(sector_id)?;
            for slot in 0..items_per_sector {
                let record = self.record_at(&sector_buf, slot, record_size);
                if record.is_free() || record.parent.get() != self.path_id {
                    continue;
                }
                let location = Location { sector_id, slot };
                let name = ItemName {
                    head: record.name_head,
                    extension: record.extension,
                    length: record.name_length,
                    extension_length: if record.is_folder() {
                        0
                    } else {
                        record
                            .extension
                            .iter()
                            .position(|&b| b == 0)
                            .unwrap_or(3) as u8
                    },
                };
                entries.push(Entry {
                    item_id: location.to_flat(items_per_sector),
                    name,
                    size: record.size.get(),
                });
            }
        }
        Ok(entries)
    }

    fn used_size(&self) -> u32 {
        self.used_size
    }

    fn device_size(&self) -> u32 {
        self.device.sector_count() * self.device.sector_size()
    }
}

impl<D: BlockDevice> Ufs<D> {
    fn delete_folder_recursive(&mut self, path: &str, folder_id: u16) -> Result<()> {
        let saved_path_id = self.path_id;
        let saved_path_name = self.path_name.clone();

        self.path_id = folder_id;
        self.path_name = path.to_string();
        let entries = self.list_items()?;
        for entry in entries {
            let child_name = entry.name.display_name();
            let child = self.open_item(&child_name)?;
            match child.status {
                ItemStatus::FolderExists => {
                    let nested_path = format!("{path}{child_name}/");
                    self.close_item(child);
                    self.delete_folder_recursive(&nested_path, entry.item_id)?;
                }
                ItemStatus::FileExists => self.delete_item(child)?,
                _ => {}
            }
        }

        let folder_record_loc = Location::from_flat(folder_id, self.items_per_sector());
        let empty = ItemRecord::new_zeroed();
        self.write_record(folder_record_loc, &empty)?;

        self.path_id = saved_path_id;
        self.path_name = saved_path_name;
        Ok(())
    }

    fn append_into_cluster(
        &mut self,
        cluster: u16,
        within_cluster_offset: u32,
        data: &[u8],
        encode_enable: bool,
        checksum_enable: bool,
    ) -> Result<()> {
        let ssec = self.device.sector_size();
        let mut sector_in_cluster = (within_cluster_offset / ssec) as u16;
        let mut within_sector = within_cluster_offset % ssec;
        let mut offset = 0usize;

        while offset < data.len() && sector_in_cluster < self.sectors_per_cluster {
            let sector = self.cluster_data_sector(cluster, sector_in_cluster);
            let mut scratch = vec![0xFFu8; ssec as usize];
            self.device.read_sector(sector, &mut scratch)?;
            if encode_enable {
                for b in scratch.iter_mut() {
                    *b ^= self.device_id[0] | OBFUSCATION_KEY;
                }
            }

            let space = (ssec - within_sector) as usize;
            let take = space.min(data.len() - offset);
            scratch[within_sector as usize..within_sector as usize + take]
                .copy_from_slice(&data[offset..offset + take]);

            if encode_enable {
                for b in scratch.iter_mut() {
                    *b = self.encode_byte(*b);
                }
            }
            self.device.erase_sector(sector)?;
            self.device.write_sector(sector, &scratch)?;

            if checksum_enable {
                let expected = Self::sector_checksum(&scratch);
                let mut readback = vec![0u8; ssec as usize];
                self.device.read_sector(sector, &mut readback)?;
                if Self::sector_checksum(&readback) != expected {
                    error!("append checksum mismatch on cluster {cluster}, retiring it");
                    self.write_map_slot(cluster, cluster_map::BAD)?;
                    self.flush_map_sector()?;
                    return Err(FsError::SumSectorFail.into());
                }
            }

            offset += take;
            within_sector = 0;
            sector_in_cluster += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ufscore_bdev_host::HostBlockDevice;

    fn fresh() -> (tempfile::TempDir, Ufs<HostBlockDevice>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nor.bin");
        let device =
            HostBlockDevice::open(path, 512, 16, 2048, [0x42, 0, 0, 0, 0, 0, 0, 0]).unwrap();
        let ufs = Ufs::open(device, Cfg::default()).unwrap();
        (dir, ufs)
    }

    #[test]
    fn fresh_device_fast_formats_with_valid_boot_sector() {
        let (_dir, ufs) = fresh();
        assert!(ufs.boot_sector_valid().unwrap());
        assert_eq!(ufs.path_id, 0);
    }

    #[test]
    fn reopen_on_formatted_device_does_not_reformat() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nor.bin");
        let device =
            HostBlockDevice::open(&path, 512, 16, 2048, [0x42, 0, 0, 0, 0, 0, 0, 0]).unwrap();
        let mut ufs = Ufs::open(device, Cfg::default()).unwrap();
        ufs.mount("/").unwrap();
        let item_zone_first = ufs.item_zone_first;
        drop(ufs);

        let device2 =
            HostBlockDevice::open(&path, 512, 16, 2048, [0x42, 0, 0, 0, 0, 0, 0, 0]).unwrap();
        let ufs2 = Ufs::open(device2, Cfg::default()).unwrap();
        assert_eq!(ufs2.item_zone_first, item_zone_first);
    }

    #[test]
    fn write_then_read_roundtrips() {
        let (_dir, mut ufs) = fresh();
        let mut item = ufs.open_item("boot.bin").unwrap();
        let data = vec![0xCDu8; 3000];
        ufs.write_file(&mut item, &data, true).unwrap();

        let mut buf = vec![0u8; data.len()];
        let n = ufs.read_file(&item, 0, &mut buf).unwrap();
        assert_eq!(n as usize, data.len());
        assert_eq!(buf, data);
    }

    #[test]
    fn write_append_extends_existing_content() {
        let (_dir, mut ufs) = fresh();
        let mut item = ufs.open_item("log.txt").unwrap();
        ufs.write_file(&mut item, b"hello ", false).unwrap();
        ufs.write_append(&mut item, b"world", false).unwrap();

        let mut buf = vec![0u8; 11];
        let n = ufs.read_file(&item, 0, &mut buf).unwrap();
        assert_eq!(&buf[..n as usize], b"hello world");
    }

    #[test]
    fn new_empty_file_first_cluster_is_end() {
        let (_dir, mut ufs) = fresh();
        let item = ufs.open_item("empty.bin").unwrap();
        assert_eq!(item.info.size, 0);
        assert_eq!(item.chain.last().copied(), Some(cluster_map::END));
    }

    #[test]
    fn delete_reclaims_item_slot_and_clusters() {
        let (_dir, mut ufs) = fresh();
        let mut item = ufs.open_item("temp.bin").unwrap();
        ufs.write_file(&mut item, &[1u8; 1024], false).unwrap();
        let used_before = ufs.used_size();
        ufs.delete_item(item).unwrap();
        assert!(ufs.used_size() < used_before);

        let reopened = ufs.open_item("temp.bin").unwrap();
        assert_eq!(reopened.info.size, 0);
    }

    #[test]
    fn rename_rejects_collision_in_same_parent() {
        let (_dir, mut ufs) = fresh();
        let mut a = ufs.open_item("a.bin").unwrap();
        let b = ufs.open_item("b.bin").unwrap();
        ufs.close_item(b);
        let err = ufs.rename_item(&mut a, "b.bin").unwrap_err();
        assert!(matches!(err, ufscore_err::Error::Fs(FsError::Existed)));
    }

    #[test]
    fn mount_creates_nested_folders_and_scopes_listing() {
        let (_dir, mut ufs) = fresh();
        ufs.mount("/logs/today").unwrap();
        let a = ufs.open_item("a.bin").unwrap();
        ufs.close_item(a);
        let b = ufs.open_item("b.bin").unwrap();
        ufs.close_item(b);

        let entries = ufs.list_items().unwrap();
        assert_eq!(entries.len(), 2);

        ufs.mount("/").unwrap();
        let root_entries = ufs.list_items().unwrap();
        assert!(root_entries.iter().any(|e| e.name.display_name() == "logs"));
    }

    #[test]
    fn encoded_extension_round_trips_through_payload_xor() {
        let (_dir, mut ufs) = fresh();
        ufs.cfg.encoded_extensions = ufscore_fs::EncodedExtensions(vec!["bin".to_string()]);
        let mut item = ufs.open_item("secret.bin").unwrap();
        let data = vec![0x11u8; 100];
        ufs.write_file(&mut item, &data, false).unwrap();

        let mut buf = vec![0u8; data.len()];
        ufs.read_file(&item, 0, &mut buf).unwrap();
        assert_eq!(buf, data);
    }

    #[test]
    fn delete_folder_recurses_into_children() {
        let (_dir, mut ufs) = fresh();
        ufs.mount("/archive").unwrap();
        let a = ufs.open_item("a.bin").unwrap();
        ufs.close_item(a);
        ufs.mount("/").unwrap();

        ufs.delete_folder("archive").unwrap();
        let entries = ufs.list_items().unwrap();
        assert!(!entries.iter().any(|e| e.name.display_name() == "archive"));
    }
}
