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

//! Command dispatcher for the 12-command file service table, generic over
//! any [`FileSystem`] implementation (usually `ufscore_fs_ufs::Ufs`).

use log::{error, warn};
use ufscore_err::{Error, FsError, Result, STATUS_NOT_OK, STATUS_OK};
use ufscore_fs::FileSystem;

pub const REQUEST_PORT: u8 = 55;
pub const RESPONSE_PORT: u8 = 54;

const CMD_HANDSHAKE: u8 = 0;
const CMD_LIST_FILES: u8 = 1;
const CMD_MOUNT_FOLDER: u8 = 2;
const CMD_OPEN_FILE: u8 = 3;
const CMD_WRITE_FIRST: u8 = 4;
const CMD_WRITE_CONTINUE: u8 = 5;
const CMD_READ_FILE: u8 = 6;
const CMD_READ_ALL: u8 = 7;
const CMD_DELETE: u8 = 8;
const CMD_RENAME: u8 = 9;
const CMD_WRITE_FLASH: u8 = 10;
const CMD_JUMP: u8 = 11;

const READ_ALL_CHUNK: usize = 64;

/// Seam for commands 10/11, which hand control to the bootloader rather
/// than the file system (spec.md §4.D, out of scope for UFS itself).
pub trait FirmwareSink {
    /// Accepts one chunk of firmware image data, returning a 0..=100
    /// percent-complete figure.
    fn write_flash_chunk(&mut self, chunk: &[u8]) -> Result<u8>;
    /// Transfers control to the application image. Does not return on
    /// success; a real target resets here.
    fn jump(&mut self) -> Result<()>;
}

/// A no-op sink for hosts with no firmware image to accept (the default
/// for the host `firmware` binary's demo wiring).
#[derive(Default)]
pub struct NullFirmwareSink;

impl FirmwareSink for NullFirmwareSink {
    fn write_flash_chunk(&mut self, _chunk: &[u8]) -> Result<u8> {
        Ok(100)
    }

    fn jump(&mut self) -> Result<()> {
        Ok(())
    }
}

/// In-progress streamed upload state carried across write-first/continue
/// commands (spec.md §4.D commands 4-5). Each packet is committed to the
/// file system as it arrives (write-first via `write_file`, continuations
/// via `write_append`); this only tracks how much is left to expect.
struct WriteStream {
    expected_stt: u16,
    declared_len: u32,
    received_len: u32,
}

/// Dispatches file service commands (port 55) against a [`FileSystem`] and
/// a [`FirmwareSink`], producing response payloads addressed to port 54
/// (spec.md §4.D).
pub struct FileServiceServer<FS: FileSystem, T: FirmwareSink> {
    fs: FS,
    firmware: T,
    current_item: Option<FS::Item>,
    write_stream: Option<WriteStream>,
}

impl<FS: FileSystem, T: FirmwareSink> FileServiceServer<FS, T> {
    pub fn new(fs: FS, firmware: T) -> Self {
        Self {
            fs,
            firmware,
            current_item: None,
            write_stream: None,
        }
    }

    pub fn file_system(&self) -> &FS {
        &self.fs
    }

    pub fn file_system_mut(&mut self) -> &mut FS {
        &mut self.fs
    }

    /// Dispatches one request payload (byte 0 = command id) and returns the
    /// sequence of response payloads to emit, each addressed to
    /// [`RESPONSE_PORT`]. The dispatch table is bounds-checked: an unknown
    /// or truncated command id returns one not-ok response rather than
    /// indexing past the command table.
    pub fn dispatch(&mut self, request: &[u8]) -> Vec<Vec<u8>> {
        let Some(&cmd) = request.first() else {
            return vec![vec![STATUS_NOT_OK]];
        };
        let body = &request[1..];

        match cmd {
            CMD_HANDSHAKE => vec![self.handshake()],
            CMD_LIST_FILES => self.list_files(),
            CMD_MOUNT_FOLDER => vec![self.mount_folder(body)],
            CMD_OPEN_FILE => vec![self.open_file(body)],
            CMD_WRITE_FIRST => vec![self.write_first(body)],
            CMD_WRITE_CONTINUE => vec![self.write_continue(body)],
            CMD_READ_FILE => vec![self.read_file(body)],
            CMD_READ_ALL => self.read_all(body),
            CMD_DELETE => vec![self.delete(body)],
            CMD_RENAME => vec![self.rename(body)],
            CMD_WRITE_FLASH => vec![self.write_flash(body)],
            CMD_JUMP => vec![self.jump()],
            _ => {
                warn!("unknown file service command id {cmd}");
                vec![vec![Error::Fs(FsError::NotExisted).status_code()]]
            }
        }
    }

    fn handshake(&self) -> Vec<u8> {
        let free = self.fs.device_size().saturating_sub(self.fs.used_size());
        let mut out = Vec::with_capacity(9);
        out.push(STATUS_OK);
        out.extend_from_slice(&free.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&512u16.to_le_bytes());
        out.push(0);
        out
    }

    fn list_files(&mut self) -> Vec<Vec<u8>> {
        let entries = match self.fs.list_items() {
            Ok(entries) => entries,
            Err(e) => return vec![vec![e.status_code()]],
        };
        let mut responses = Vec::with_capacity(entries.len() + 1);
        responses.push(vec![STATUS_OK, entries.len().min(255) as u8]);
        for entry in entries {
            let mut packet = vec![CMD_LIST_FILES];
            packet.extend_from_slice(entry.name.display_name().as_bytes());
            responses.push(packet);
        }
        responses
    }

    fn mount_folder(&mut self, body: &[u8]) -> Vec<u8> {
        let Some(&len) = body.first() else {
            return vec![Error::Fs(FsError::InvalidSector).status_code()];
        };
        let Some(path_bytes) = body.get(1..1 + len as usize) else {
            return vec![Error::Fs(FsError::InvalidSector).status_code()];
        };
        let path = String::from_utf8_lossy(path_bytes).into_owned();
        match self.fs.mount(&path) {
            Ok(()) => vec![STATUS_OK],
            Err(e) => vec![e.status_code()],
        }
    }

    fn open_file(&mut self, body: &[u8]) -> Vec<u8> {
        let Some(&len) = body.first() else {
            return status_only(Error::Fs(FsError::InvalidSector));
        };
        let Some(name_bytes) = body.get(1..1 + len as usize) else {
            return status_only(Error::Fs(FsError::InvalidSector));
        };
        let name = String::from_utf8_lossy(name_bytes).into_owned();

        if let Some(previous) = self.current_item.take() {
            self.fs.close_item(previous);
        }
        match self.fs.open_item(&name) {
            Ok(item) => {
                let size = self.fs.item_info(&item).size;
                self.current_item = Some(item);
                let mut out = vec![STATUS_OK];
                out.extend_from_slice(&size.to_le_bytes());
                out
            }
            Err(e) => vec![e.status_code()],
        }
    }

    /// Commits the first packet immediately via `write_file`, matching
    /// `Service_WriteFirstPacket`'s direct call into `ufs_WriteFile`.
    fn write_first(&mut self, body: &[u8]) -> Vec<u8> {
        if body.len() < 7 {
            return status_only(Error::Fs(FsError::InvalidSector));
        }
        let _num_packets = u16::from_le_bytes([body[0], body[1]]);
        let data_len = u16::from_le_bytes([body[2], body[3]]);
        let stt = u16::from_le_bytes([body[4], body[5]]);
        let checksum_enable = body[6] != 0;
        let bytes = &body[7..];

        let Some(item) = self.current_item.as_mut() else {
            return status_only(Error::Fs(FsError::NotExisted));
        };
        if let Err(e) = self.fs.write_file(item, bytes, checksum_enable) {
            return vec![e.status_code()];
        }

        self.write_stream = Some(WriteStream {
            expected_stt: stt.wrapping_add(1),
            declared_len: data_len as u32,
            received_len: bytes.len() as u32,
        });
        vec![STATUS_OK]
    }

    /// The original firmware silently accepts (and reports OK on) a
    /// continuation whose `stt` doesn't match the expected counter, without
    /// committing its bytes — see the write-continue decision in DESIGN.md.
    /// A matching `stt` commits immediately via `write_append`, mirroring
    /// `Service_WriteContinue`'s call into `ufs_WriteAppendFile`.
    fn write_continue(&mut self, body: &[u8]) -> Vec<u8> {
        if body.len() < 5 {
            return status_only(Error::Fs(FsError::InvalidSector));
        }
        let _data_len = u16::from_le_bytes([body[0], body[1]]);
        let stt = u16::from_le_bytes([body[2], body[3]]);
        let checksum_enable = body[4] != 0;
        let bytes = &body[5..];

        let Some(stream) = self.write_stream.as_mut() else {
            return status_only(Error::Fs(FsError::NotExisted));
        };

        if stt != stream.expected_stt {
            warn!("write-continue stt {stt} != expected {}, accepting without committing", stream.expected_stt);
            return vec![STATUS_OK];
        }

        let Some(item) = self.current_item.as_mut() else {
            return status_only(Error::Fs(FsError::NotExisted));
        };
        if let Err(e) = self.fs.write_append(item, bytes, checksum_enable) {
            return vec![e.status_code()];
        }

        stream.expected_stt = stream.expected_stt.wrapping_add(1);
        stream.received_len += bytes.len() as u32;
        if stream.received_len >= stream.declared_len {
            self.write_stream = None;
        }
        vec![STATUS_OK]
    }

    fn read_file(&self, body: &[u8]) -> Vec<u8> {
        if body.len() < 6 {
            return status_only(Error::Fs(FsError::InvalidSector));
        }
        let offset = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
        let length = u16::from_le_bytes([body[4], body[5]]);

        let Some(item) = self.current_item.as_ref() else {
            return status_only(Error::Fs(FsError::NotExisted));
        };
        let mut buf = vec![0u8; length as usize];
        match self.fs.read_file(item, offset, &mut buf) {
            Ok(n) => {
                let mut out = vec![STATUS_OK];
                // `real_len` is big-endian on the wire, unlike every other
                // multi-byte field in this table (spec.md §6 quirk).
                out.extend_from_slice(&n.to_be_bytes());
                out.extend_from_slice(&buf[..n as usize]);
                out
            }
            Err(e) => vec![e.status_code()],
        }
    }

    fn read_all(&self, body: &[u8]) -> Vec<Vec<u8>> {
        if body.len() < 6 {
            return vec![status_only(Error::Fs(FsError::InvalidSector))];
        }
        let offset = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);

        let Some(item) = self.current_item.as_ref() else {
            return vec![status_only(Error::Fs(FsError::NotExisted))];
        };
        let info = self.fs.item_info(item);
        let remaining = info.size.saturating_sub(offset);
        let mut responses = Vec::new();
        let mut sent = 0u32;
        let mut packet_no = 0u8;

        while sent < remaining {
            let mut chunk = vec![0u8; READ_ALL_CHUNK];
            let n = match self.fs.read_file(item, offset + sent, &mut chunk) {
                Ok(n) => n,
                Err(e) => {
                    responses.push(vec![e.status_code()]);
                    return responses;
                }
            };
            if n == 0 {
                break;
            }
            sent += n;
            let last = sent >= remaining;
            let mut packet = vec![if last { STATUS_NOT_OK } else { STATUS_OK }, packet_no];
            packet.extend_from_slice(&chunk[..n as usize]);
            responses.push(packet);
            packet_no = packet_no.wrapping_add(1);
        }
        if responses.is_empty() {
            responses.push(vec![STATUS_NOT_OK, 0]);
        }
        responses
    }

    fn delete(&mut self, body: &[u8]) -> Vec<u8> {
        let Some(&len) = body.first() else {
            return status_only(Error::Fs(FsError::InvalidSector));
        };
        let Some(name_bytes) = body.get(1..1 + len as usize) else {
            return status_only(Error::Fs(FsError::InvalidSector));
        };
        let name = String::from_utf8_lossy(name_bytes).into_owned();

        match self.fs.open_item(&name) {
            Ok(item) => match self.fs.delete_item(item) {
                Ok(()) => vec![STATUS_OK],
                Err(e) => vec![e.status_code()],
            },
            Err(e) => vec![e.status_code()],
        }
    }

    fn rename(&mut self, body: &[u8]) -> Vec<u8> {
        let Some(&len1) = body.first() else {
            return status_only(Error::Fs(FsError::InvalidSector));
        };
        let Some(name1_bytes) = body.get(1..1 + len1 as usize) else {
            return status_only(Error::Fs(FsError::InvalidSector));
        };
        let rest = &body[1 + len1 as usize..];
        let Some(&len2) = rest.first() else {
            return status_only(Error::Fs(FsError::InvalidSector));
        };
        let Some(name2_bytes) = rest.get(1..1 + len2 as usize) else {
            return status_only(Error::Fs(FsError::InvalidSector));
        };
        let name1 = String::from_utf8_lossy(name1_bytes).into_owned();
        let name2 = String::from_utf8_lossy(name2_bytes).into_owned();

        match self.fs.open_item(&name1) {
            Ok(mut item) => {
                let result = self.fs.rename_item(&mut item, &name2);
                self.fs.close_item(item);
                match result {
                    Ok(()) => vec![STATUS_OK],
                    Err(e) => vec![e.status_code()],
                }
            }
            Err(e) => vec![e.status_code()],
        }
    }

    fn write_flash(&mut self, body: &[u8]) -> Vec<u8> {
        match self.firmware.write_flash_chunk(body) {
            Ok(percent) => vec![percent],
            Err(e) => vec![e.status_code()],
        }
    }

    fn jump(&mut self) -> Vec<u8> {
        match self.firmware.jump() {
            Ok(()) => vec![STATUS_OK],
            Err(e) => {
                error!("jump to application image failed");
                vec![e.status_code()]
            }
        }
    }
}

fn status_only(e: Error) -> Vec<u8> {
    vec![e.status_code()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use ufscore_bdev_host::HostBlockDevice;
    use ufscore_fs::Cfg;
    use ufscore_fs_ufs::Ufs;

    fn server() -> (tempfile::TempDir, FileServiceServer<Ufs<HostBlockDevice>, NullFirmwareSink>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nor.bin");
        let device = HostBlockDevice::open(path, 512, 16, 2048, [0x7, 0, 0, 0, 0, 0, 0, 0]).unwrap();
        let fs = Ufs::open(device, Cfg::default()).unwrap();
        (dir, FileServiceServer::new(fs, NullFirmwareSink))
    }

    #[test]
    fn handshake_reports_ok_and_free_memory() {
        let (_dir, mut server) = server();
        let response = server.dispatch(&[CMD_HANDSHAKE]);
        assert_eq!(response.len(), 1);
        assert_eq!(response[0][0], STATUS_OK);
        assert_eq!(response[0].len(), 9);
    }

    #[test]
    fn open_then_write_then_read_round_trips() {
        let (_dir, mut server) = server();
        let name = b"a.bin";
        let mut open_req = vec![CMD_OPEN_FILE, name.len() as u8];
        open_req.extend_from_slice(name);
        let open_resp = server.dispatch(&open_req);
        assert_eq!(open_resp[0][0], STATUS_OK);

        let data = b"hello there";
        let mut first = vec![CMD_WRITE_FIRST];
        first.extend_from_slice(&1u16.to_le_bytes());
        first.extend_from_slice(&(data.len() as u16).to_le_bytes());
        first.extend_from_slice(&0u16.to_le_bytes());
        first.push(0);
        first.extend_from_slice(data);
        let write_resp = server.dispatch(&first);
        assert_eq!(write_resp[0][0], STATUS_OK);

        let mut read_req = vec![CMD_READ_FILE];
        read_req.extend_from_slice(&0u32.to_le_bytes());
        read_req.extend_from_slice(&(data.len() as u16).to_le_bytes());
        read_req.extend_from_slice(&[0u8; 16]);
        let read_resp = server.dispatch(&read_req);
        assert_eq!(read_resp[0][0], STATUS_OK);
        let real_len = u32::from_be_bytes([read_resp[0][1], read_resp[0][2], read_resp[0][3], read_resp[0][4]]);
        assert_eq!(real_len as usize, data.len());
        assert_eq!(&read_resp[0][5..5 + data.len()], data);
    }

    #[test]
    fn write_continue_commits_after_declared_length_reached() {
        let (_dir, mut server) = server();
        let mut open_req = vec![CMD_OPEN_FILE, 5];
        open_req.extend_from_slice(b"b.bin");
        server.dispatch(&open_req);

        let total = b"0123456789";
        let mut first = vec![CMD_WRITE_FIRST];
        first.extend_from_slice(&2u16.to_le_bytes());
        first.extend_from_slice(&(total.len() as u16).to_le_bytes());
        first.extend_from_slice(&0u16.to_le_bytes());
        first.push(0);
        first.extend_from_slice(&total[..5]);
        server.dispatch(&first);

        let mut cont = vec![CMD_WRITE_CONTINUE];
        cont.extend_from_slice(&5u16.to_le_bytes());
        cont.extend_from_slice(&1u16.to_le_bytes());
        cont.push(0);
        cont.extend_from_slice(&total[5..]);
        let resp = server.dispatch(&cont);
        assert_eq!(resp[0][0], STATUS_OK);

        let mut read_req = vec![CMD_READ_FILE];
        read_req.extend_from_slice(&0u32.to_le_bytes());
        read_req.extend_from_slice(&(total.len() as u16).to_le_bytes());
        read_req.extend_from_slice(&[0u8; 16]);
        let read_resp = server.dispatch(&read_req);
        assert_eq!(&read_resp[0][5..5 + total.len()], total);
    }

    #[test]
    fn unknown_command_id_does_not_panic() {
        let (_dir, mut server) = server();
        let response = server.dispatch(&[250]);
        assert_eq!(response.len(), 1);
        assert_ne!(response[0][0], STATUS_OK);
    }

    #[test]
    fn delete_then_list_omits_item() {
        let (_dir, mut server) = server();
        let mut open_req = vec![CMD_OPEN_FILE, 5];
        open_req.extend_from_slice(b"c.bin");
        server.dispatch(&open_req);

        let mut delete_req = vec![CMD_DELETE, 5];
        delete_req.extend_from_slice(b"c.bin");
        let resp = server.dispatch(&delete_req);
        assert_eq!(resp[0][0], STATUS_OK);

        let list_resp = server.dispatch(&[CMD_LIST_FILES]);
        assert_eq!(list_resp[0][1], 0);
    }
}
