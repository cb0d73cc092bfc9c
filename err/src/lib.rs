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

//! Error taxonomy shared by the UFS file system, the LiteLink transport, and
//! the file service dispatcher.

/// Media-level failure surfaced by a [`ufscore_bdev`]-style backend.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoError {
    #[error("read from block device refused")]
    ReadMem,
    #[error("write to block device refused")]
    WriteMem,
}

/// UFS-level failure, reported via the item handle and bubbled into file
/// service responses as a single status byte (spec.md §7).
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    #[error("allocation failed")]
    AllocateMem,
    #[error("cluster map exhausted")]
    FullCluster,
    #[error("item zone exhausted")]
    FullFile,
    #[error("cluster data zone exhausted")]
    FullMem,
    #[error("bad cluster encountered while walking chain")]
    MemSectorBad,
    #[error("post-write verify checksum mismatch")]
    SumSectorFail,
    #[error("item already exists")]
    Existed,
    #[error("item does not exist")]
    NotExisted,
    #[error("item handle refers to an invalid sector")]
    InvalidSector,
    #[error("operation requires a file, item is a folder")]
    ItemNotFile,
    #[error("operation requires a folder, item is a file")]
    ItemNotFolder,
}

/// LiteLink-level failure. The wire protocol only ever reports a two-valued
/// status (spec.md §7); this richer enum exists for the Rust-level API and
/// is collapsed to that boolean at the transport boundary.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkError {
    #[error("segment size does not exceed the header size")]
    SegmentTooSmall,
    #[error("port is reserved or out of range")]
    InvalidPort,
    #[error("no service is listening on the requested port")]
    NoService,
    #[error("core or inbound lock is held")]
    Locked,
    #[error("send timed out waiting for the service to go idle")]
    SendTimeout,
    #[error("ping timed out waiting for a pong")]
    PingTimeout,
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] IoError),
    #[error("fs: {0}")]
    Fs(#[from] FsError),
    #[error("link: {0}")]
    Link(#[from] LinkError),
}

pub type Result<T> = core::result::Result<T, Error>;

impl Error {
    /// Maps the error onto the single-byte status code carried in every file
    /// service response (spec.md §4.D, §7). Unknown/out-of-table errors fall
    /// back to the generic not-ok code.
    pub fn status_code(&self) -> u8 {
        match self {
            Error::Io(IoError::ReadMem) => 0x02,
            Error::Io(IoError::WriteMem) => 0x03,
            Error::Fs(FsError::AllocateMem) => 0x06,
            Error::Fs(FsError::FullCluster) => 0x0A,
            Error::Fs(FsError::FullFile) => 0x09,
            Error::Fs(FsError::FullMem) => 0x01,
            Error::Fs(FsError::MemSectorBad) => 0x08,
            Error::Fs(FsError::SumSectorFail) => 0x0C,
            Error::Fs(FsError::Existed) => 0x04,
            Error::Fs(FsError::NotExisted) => 0x05,
            Error::Fs(FsError::InvalidSector) => 0x0B,
            Error::Fs(FsError::ItemNotFile) => 0x0D,
            Error::Fs(FsError::ItemNotFolder) => 0x0D,
            Error::Link(_) => 0x01,
        }
    }
}

/// Top-level status byte for a successful response (`UFS_OK` / `LL_OK`).
pub const STATUS_OK: u8 = 0x00;
/// Top-level status byte for a generic failure (`UFS_NOT_OK` / `LL_NOT_OK`).
pub const STATUS_NOT_OK: u8 = 0x01;
