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

//! Host-buildable wiring of UFS, LiteLink, and the file service dispatcher
//! onto an in-process byte pipe, standing in for the USB-CDC host link.

use std::env;
use std::sync::mpsc::{self, Receiver, Sender};

use log::info;
use ufscore_bdev_host::HostBlockDevice;
use ufscore_err::Result;
use ufscore_fileservice::{FileServiceServer, NullFirmwareSink, REQUEST_PORT, RESPONSE_PORT};
use ufscore_fs::Cfg;
use ufscore_fs_ufs::Ufs;
use ufscore_litelink::{Address, LiteLink};

const NODE_ADDRESS: u16 = 1;
const WLAN: u16 = 0;
const SEGMENT_SIZE: usize = 128;

fn main() -> Result<()> {
    env_logger::init();

    let backing_path = env::args()
        .nth(1)
        .unwrap_or_else(|| "ufs.bin".to_string());
    info!("opening UFS backing store at {backing_path}");

    let device = HostBlockDevice::open(backing_path, 4096, 16, 4096, [0x55, 0, 0, 0, 0, 0, 0, 0])?;
    let fs = Ufs::open(device, Cfg::default())?;
    let mut server = FileServiceServer::new(fs, NullFirmwareSink);

    let (outbound_tx, outbound_rx): (Sender<Vec<u8>>, Receiver<Vec<u8>>) = mpsc::channel();
    let mut link = LiteLink::new(WLAN, Address::new(NODE_ADDRESS, 0), SEGMENT_SIZE, move |bytes| {
        outbound_tx.send(bytes.to_vec()).ok();
        Ok(())
    })?;
    link.listen(REQUEST_PORT, |_from, _data| {})?;

    info!("handling one handshake request over the in-process byte pipe");
    let request = vec![0u8];
    link.send_packet(REQUEST_PORT, Address::new(NODE_ADDRESS, RESPONSE_PORT), &request)?;

    while let Ok(frame) = outbound_rx.try_recv() {
        link.inbound(&frame);
    }
    link.process()?;

    let response = server.dispatch(&request);
    info!("handshake responded with {} packet(s)", response.len());
    Ok(())
}
