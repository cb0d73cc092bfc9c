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

//! Sector-granular block device contract consumed by [`ufscore_fs_ufs`].
//!
//! NOR flash only ever turns bits from 1 to 0 on a write; returning a bit to
//! 1 requires erasing the containing block. Implementations must uphold
//! that asymmetry (`erase_*` fills with `0xFF`, `write_sector` never sets a
//! bit that isn't already 1 in the backing media) — UFS's obfuscation and
//! "free slot" conventions (`ufscore_fs_ufs`) depend on it.

pub use ufscore_err::{Error, IoError, Result};

/// RAII handle over [`BlockDevice::lock`]/[`unlock`](BlockDevice::unlock).
/// Only fits call sites that need read-only device access for the guarded
/// span; operations that interleave `&mut` device calls acquire and release
/// directly instead (see `ufscore_fs_ufs::Ufs::fast_format`).
pub struct LockGuard<'a, D: BlockDevice + ?Sized> {
    device: &'a D,
}

impl<'a, D: BlockDevice + ?Sized> LockGuard<'a, D> {
    pub fn acquire(device: &'a D) -> Self {
        device.lock();
        Self { device }
    }
}

impl<D: BlockDevice + ?Sized> Drop for LockGuard<'_, D> {
    fn drop(&mut self) {
        self.device.unlock();
    }
}

pub trait BlockDevice {
    /// Bytes per sector.
    fn sector_size(&self) -> u32;
    /// Sectors per erase block.
    fn sectors_per_block(&self) -> u32;
    /// Total sector count of the device.
    fn sector_count(&self) -> u32;

    /// Brings the device out of reset and returns its first unique-id byte
    /// (the low byte UFS mixes into the per-extension content encoding).
    fn init(&mut self) -> Result<u8>;

    /// Reads `buf.len()` bytes (`<= sector_size()`) from `sector`.
    fn read_sector(&self, sector: u32, buf: &mut [u8]) -> Result<()>;

    /// Writes `buf.len()` bytes to `sector`. Caller must have pre-erased the
    /// containing block; the implementation does not erase on write.
    fn write_sector(&mut self, sector: u32, buf: &[u8]) -> Result<()>;

    fn erase_sector(&mut self, sector: u32) -> Result<()>;
    fn erase_block(&mut self, block: u32) -> Result<()>;
    fn erase_chip(&mut self) -> Result<()>;

    /// Reads the device's 8-byte unique id.
    fn read_unique_id(&self, buf: &mut [u8; 8]) -> Result<()>;

    /// Acquires the device mutex. No-op for devices with no contention.
    fn lock(&self) {}
    /// Releases the device mutex. No-op for devices with no contention.
    fn unlock(&self) {}
}

/// Convenience: number of sectors in one erase block's worth of clusters.
pub fn sector_to_block(device: &impl BlockDevice, sector: u32) -> u32 {
    sector / device.sectors_per_block()
}
