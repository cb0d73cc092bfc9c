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

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Mutex;

use log::error;
use ufscore_bdev::BlockDevice;
use ufscore_err::{IoError, Result};

/// A [`BlockDevice`] backed by a plain file, emulating NOR flash: writes only
/// clear bits (`existing & incoming`), erases set every byte to `0xFF`.
pub struct HostBlockDevice {
    file: Mutex<File>,
    sector_size: u32,
    sectors_per_block: u32,
    sector_count: u32,
    unique_id: [u8; 8],
}

impl HostBlockDevice {
    /// Opens (creating if needed) a backing file sized for the given
    /// geometry, filling any newly created region with `0xFF` (the NOR
    /// erased state).
    pub fn open(
        path: impl AsRef<Path>,
        sector_size: u32,
        sectors_per_block: u32,
        sector_count: u32,
        unique_id: [u8; 8],
    ) -> Result<Self> {
        let path = path.as_ref();
        let existed = path.exists();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|e| {
                error!("failed to open host block device backing file: {e}");
                IoError::ReadMem
            })?;

        let device = Self {
            file: Mutex::new(file),
            sector_size,
            sectors_per_block,
            sector_count,
            unique_id,
        };
        if !existed {
            device.erase_chip_inner()?;
        }
        Ok(device)
    }

    fn total_bytes(&self) -> u64 {
        self.sector_size as u64 * self.sector_count as u64
    }

    fn erase_chip_inner(&self) -> Result<()> {
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(0)).map_err(|_| IoError::WriteMem)?;
        let chunk = vec![0xFFu8; self.sector_size as usize];
        for _ in 0..self.sector_count {
            file.write_all(&chunk).map_err(|_| IoError::WriteMem)?;
        }
        file.sync_data().ok();
        Ok(())
    }
}

impl BlockDevice for HostBlockDevice {
    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn sectors_per_block(&self) -> u32 {
        self.sectors_per_block
    }

    fn sector_count(&self) -> u32 {
        self.sector_count
    }

    fn init(&mut self) -> Result<u8> {
        if self.total_bytes() == 0 {
            error!("host block device has zero geometry");
            return Err(IoError::ReadMem.into());
        }
        Ok(self.unique_id[0])
    }

    fn read_sector(&self, sector: u32, buf: &mut [u8]) -> Result<()> {
        if sector >= self.sector_count || buf.len() > self.sector_size as usize {
            error!("read_sector({sector}) out of bounds");
            return Err(IoError::ReadMem.into());
        }
        let offset = sector as u64 * self.sector_size as u64;
        let file = self.file.lock().unwrap();
        file.read_exact_at(buf, offset).map_err(|e| {
            error!("read_sector({sector}) failed: {e}");
            IoError::ReadMem.into()
        })
    }

    fn write_sector(&mut self, sector: u32, buf: &[u8]) -> Result<()> {
        if sector >= self.sector_count || buf.len() > self.sector_size as usize {
            error!("write_sector({sector}) out of bounds");
            return Err(IoError::WriteMem.into());
        }
        let offset = sector as u64 * self.sector_size as u64;
        let file = self.file.lock().unwrap();

        let mut existing = vec![0u8; buf.len()];
        file.read_exact_at(&mut existing, offset).map_err(|e| {
            error!("write_sector({sector}) read-modify-write failed: {e}");
            IoError::WriteMem
        })?;
        let merged: Vec<u8> = existing
            .iter()
            .zip(buf.iter())
            .map(|(&e, &n)| e & n)
            .collect();

        file.write_all_at(&merged, offset).map_err(|e| {
            error!("write_sector({sector}) failed: {e}");
            IoError::WriteMem.into()
        })
    }

    fn erase_sector(&mut self, sector: u32) -> Result<()> {
        if sector >= self.sector_count {
            error!("erase_sector({sector}) out of bounds");
            return Err(IoError::WriteMem.into());
        }
        let offset = sector as u64 * self.sector_size as u64;
        let file = self.file.lock().unwrap();
        let fill = vec![0xFFu8; self.sector_size as usize];
        file.write_all_at(&fill, offset).map_err(|e| {
            error!("erase_sector({sector}) failed: {e}");
            IoError::WriteMem.into()
        })
    }

    fn erase_block(&mut self, block: u32) -> Result<()> {
        let first_sector = block * self.sectors_per_block;
        for s in first_sector..first_sector + self.sectors_per_block {
            self.erase_sector(s)?;
        }
        Ok(())
    }

    fn erase_chip(&mut self) -> Result<()> {
        self.erase_chip_inner()
    }

    fn read_unique_id(&self, buf: &mut [u8; 8]) -> Result<()> {
        buf.copy_from_slice(&self.unique_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> (tempfile::TempDir, HostBlockDevice) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nor.bin");
        let dev = HostBlockDevice::open(path, 512, 16, 1024, [0x12, 0, 0, 0, 0, 0, 0, 0]).unwrap();
        (dir, dev)
    }

    #[test]
    fn erase_fills_with_0xff() {
        let (_dir, dev) = device();
        let mut buf = [0u8; 512];
        dev.read_sector(5, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn write_only_clears_bits() {
        let (_dir, mut dev) = device();
        dev.write_sector(0, &[0b1010_1010; 1]).unwrap();
        dev.write_sector(0, &[0b1111_0000; 1]).unwrap();
        let mut buf = [0u8; 1];
        dev.read_sector(0, &mut buf).unwrap();
        // 0xFF (erased) & 0xAA & 0xF0 == 0xA0
        assert_eq!(buf[0], 0b1010_1010 & 0b1111_0000);
    }

    #[test]
    fn erase_sector_then_write_roundtrips() {
        let (_dir, mut dev) = device();
        dev.erase_sector(3).unwrap();
        let data = [0x42u8; 512];
        dev.write_sector(3, &data).unwrap();
        let mut buf = [0u8; 512];
        dev.read_sector(3, &mut buf).unwrap();
        assert_eq!(buf, data);
    }

    #[test]
    fn unique_id_roundtrips() {
        let (_dir, mut dev) = device();
        let b0 = dev.init().unwrap();
        assert_eq!(b0, 0x12);
        let mut id = [0u8; 8];
        dev.read_unique_id(&mut id).unwrap();
        assert_eq!(id[0], 0x12);
    }
}
