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

//! Segmented transport over a byte-oriented link: a 12-byte header,
//! fragmentation/reassembly, and a port-indexed service table.

use std::collections::{BTreeMap, VecDeque};

use log::{error, warn};
use ufscore_err::{LinkError, Result};
use zerocopy::big_endian::{U16 as BigU16, U32 as BigU32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

pub const HEADER_SIZE: usize = 12;
pub const MAX_SERVICES: usize = 63;
pub const BROADCAST_ADDRESS: u16 = 0x3FF;
pub const BROADCAST_WLAN: u16 = 0x3FF;
pub const SYSTEM_SERVICE_PORT: u8 = 0;

const CTL_LEN_BITS: u32 = 13;
const CTL_LEN_MASK: u32 = (1 << CTL_LEN_BITS) - 1;
const CTL_WLAN_BITS: u32 = 10;
const CTL_WLAN_MASK: u32 = (1 << CTL_WLAN_BITS) - 1;
const CTL_FLAGS_MASK: u32 = 0xFF;

/// Flag bits packed into the control word's `flags` field (spec.md §3.6).
pub mod flags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const PIN: u8 = 0x04;
    pub const PON: u8 = 0x08;
    pub const PSH: u8 = 0x10;
    pub const ACK: u8 = 0x20;
    pub const SER: u8 = 0x40;
    pub const DEV: u8 = 0x80;
}

const CRC: crc::Crc<u8> = crc::Crc::<u8>::new(&crc::CRC_8_SAE_J1850);

/// 10-bit network address + 6-bit port, packed big-endian on the wire as
/// `(address << 6) | port` (spec.md §3.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Address {
    pub address: u16,
    pub port: u8,
}

impl Address {
    pub fn new(address: u16, port: u8) -> Self {
        Self {
            address: address & 0x3FF,
            port: port & 0x3F,
        }
    }

    fn pack(self) -> u16 {
        (self.address << 6) | self.port as u16
    }

    fn unpack(raw: u16) -> Self {
        Self {
            address: raw >> 6,
            port: (raw & 0x3F) as u8,
        }
    }

    pub fn is_broadcast(self) -> bool {
        self.address == BROADCAST_ADDRESS
    }
}

/// Ack/tx nibble pair packed into one byte, high nibble first (spec.md §3.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Sequence {
    pub ack: u8,
    pub tx: u8,
}

impl Sequence {
    fn pack(self) -> u8 {
        ((self.ack & 0x0F) << 4) | (self.tx & 0x0F)
    }

    fn unpack(raw: u8) -> Self {
        Self {
            ack: raw >> 4,
            tx: raw & 0x0F,
        }
    }
}

/// Fragment id (high byte) and this segment's payload length (low byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Offset {
    pub id: u8,
    pub len: u8,
}

impl Offset {
    fn pack(self) -> u16 {
        ((self.id as u16) << 8) | self.len as u16
    }

    fn unpack(raw: u16) -> Self {
        Self {
            id: (raw >> 8) as u8,
            len: (raw & 0xFF) as u8,
        }
    }
}

/// Control word: message type bit, 10-bit wlan group, 8-bit flags, 13-bit
/// total message length (spec.md §3.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Ctl {
    pub type_bit: bool,
    pub wlan: u16,
    pub flags: u8,
    pub len: u16,
}

impl Ctl {
    fn pack(self) -> u32 {
        let mut raw = 0u32;
        if self.type_bit {
            raw |= 1 << 31;
        }
        raw |= ((self.wlan as u32) & CTL_WLAN_MASK) << 21;
        raw |= ((self.flags as u32) & CTL_FLAGS_MASK) << 13;
        raw |= (self.len as u32) & CTL_LEN_MASK;
        raw
    }

    fn unpack(raw: u32) -> Self {
        Self {
            type_bit: raw & (1 << 31) != 0,
            wlan: ((raw >> 21) & CTL_WLAN_MASK) as u16,
            flags: ((raw >> 13) & CTL_FLAGS_MASK) as u8,
            len: (raw & CTL_LEN_MASK) as u16,
        }
    }

    pub fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct WireHeader {
    crc8: u8,
    seq: u8,
    dst: BigU16,
    src: BigU16,
    offset: BigU16,
    ctl: BigU32,
}

/// A single parsed segment: header fields plus its payload slice.
#[derive(Debug, Clone)]
pub struct Segment {
    pub seq: Sequence,
    pub dst: Address,
    pub src: Address,
    pub offset: Offset,
    pub ctl: Ctl,
    pub payload: Vec<u8>,
}

impl Segment {
    /// Serializes into wire bytes, computing the CRC over every byte but
    /// the CRC byte itself (spec.md §4.B.8, §3.6).
    pub fn encode(&self) -> Vec<u8> {
        let header = WireHeader {
            crc8: 0,
            seq: self.seq.pack(),
            dst: BigU16::new(self.dst.pack()),
            src: BigU16::new(self.src.pack()),
            offset: BigU16::new(self.offset.pack()),
            ctl: BigU32::new(self.ctl.pack()),
        };
        let mut out = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(&self.payload);
        out[0] = CRC.checksum(&out[1..]);
        out
    }

    /// Validates the CRC and parses a wire frame (spec.md §4.C.3 step 1).
    /// Returns `None` on a CRC mismatch — the caller drops the frame
    /// silently and bumps its own error counter (invariant 6).
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < HEADER_SIZE {
            return None;
        }
        let expected = CRC.checksum(&bytes[1..]);
        if bytes[0] != expected {
            return None;
        }
        let header = WireHeader::ref_from_bytes(&bytes[..HEADER_SIZE]).ok()?;
        let offset = Offset::unpack(header.offset.get());
        let payload_len = offset.len as usize;
        let payload = bytes
            .get(HEADER_SIZE..HEADER_SIZE + payload_len)
            .unwrap_or(&[])
            .to_vec();

        Some(Self {
            seq: Sequence::unpack(header.seq),
            dst: Address::unpack(header.dst.get()),
            src: Address::unpack(header.src.get()),
            offset,
            ctl: Ctl::unpack(header.ctl.get()),
            payload,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Idle,
    WaitingSend,
    PongReceived,
}

/// A port's listening endpoint: address, reassembly state, and the
/// user-supplied delivery callback (spec.md §3.7).
pub struct Service {
    pub local: Address,
    pub partner: Address,
    pub seq: Sequence,
    pub wlan: u16,
    pub state: ServiceState,
    reassembly: BTreeMap<u8, Vec<u8>>,
    reassembly_total: Option<u16>,
    on_message: Box<dyn FnMut(Address, &[u8]) + Send>,
}

impl Service {
    fn deliver(&mut self, src: Address, data: &[u8]) {
        (self.on_message)(src, data);
    }
}

/// Protocol instance: local addressing, the outbound FIFO, and the
/// port-indexed service table (spec.md §3.7, §4.C.1).
pub struct LiteLink {
    local: Address,
    wlan: u16,
    data_size: u16,
    outbound: VecDeque<Segment>,
    services: Vec<Option<Service>>,
    locked: bool,
    on_outbound: Box<dyn FnMut(&[u8]) -> Result<()> + Send>,
    drop_count: u64,
}

impl LiteLink {
    /// Rejects a segment size that wouldn't leave room for any payload
    /// (spec.md §4.C.1).
    pub fn new(
        wlan: u16,
        local: Address,
        segment_size: usize,
        on_outbound: impl FnMut(&[u8]) -> Result<()> + Send + 'static,
    ) -> Result<Self> {
        if segment_size <= HEADER_SIZE {
            return Err(LinkError::SegmentTooSmall.into());
        }
        let data_size = (segment_size - HEADER_SIZE) as u16;

        let mut services: Vec<Option<Service>> = (0..MAX_SERVICES).map(|_| None).collect();
        services[SYSTEM_SERVICE_PORT as usize] = Some(Service {
            local: Address::new(local.address, SYSTEM_SERVICE_PORT),
            partner: Address::default(),
            seq: Sequence::default(),
            wlan,
            state: ServiceState::Idle,
            reassembly: BTreeMap::new(),
            reassembly_total: None,
            on_message: Box::new(|_, _| {}),
        });

        Ok(Self {
            local,
            wlan,
            data_size,
            outbound: VecDeque::new(),
            services,
            locked: false,
            on_outbound: Box::new(on_outbound),
            drop_count: 0,
        })
    }

    pub fn drop_count(&self) -> u64 {
        self.drop_count
    }

    pub fn data_size(&self) -> u16 {
        self.data_size
    }

    /// Allocates a service slot at index `port` (spec.md §4.C.2).
    pub fn listen(
        &mut self,
        port: u8,
        on_message: impl FnMut(Address, &[u8]) + Send + 'static,
    ) -> Result<()> {
        if port as usize >= MAX_SERVICES {
            return Err(LinkError::InvalidPort.into());
        }
        self.services[port as usize] = Some(Service {
            local: Address::new(self.local.address, port),
            partner: Address::default(),
            seq: Sequence::default(),
            wlan: self.wlan,
            state: ServiceState::Idle,
            reassembly: BTreeMap::new(),
            reassembly_total: None,
            on_message: Box::new(on_message),
        });
        Ok(())
    }

    pub fn close(&mut self, port: u8) {
        if let Some(slot) = self.services.get_mut(port as usize) {
            *slot = None;
        }
    }

    /// Parses and validates one inbound frame, queuing it for [`Self::process`]
    /// (spec.md §4.C.3).
    pub fn inbound(&mut self, bytes: &[u8]) {
        let Some(mut segment) = Segment::decode(bytes) else {
            self.drop_count += 1;
            return;
        };

        if segment.dst.is_broadcast() {
            segment.dst.address = self.local.address;
        }
        if segment.ctl.wlan == BROADCAST_WLAN {
            segment.ctl.wlan = self.wlan;
        }
        if segment.dst.address != self.local.address || segment.ctl.wlan != self.wlan {
            warn!("dropping segment not addressed to this node");
            self.drop_count += 1;
            return;
        }

        self.outbound.push_back(segment);
    }

    /// Dequeues one segment and either delivers it to a local service or
    /// serializes it onto the link (spec.md §4.C.4).
    pub fn process(&mut self) -> Result<()> {
        if self.locked {
            return Ok(());
        }
        let Some(segment) = self.outbound.pop_front() else {
            return Ok(());
        };

        if segment.dst.address == self.local.address {
            self.deliver_local(segment)?;
        } else {
            let bytes = segment.encode();
            (self.on_outbound)(&bytes)?;
        }
        Ok(())
    }

    fn deliver_local(&mut self, segment: Segment) -> Result<()> {
        let port = segment.dst.port;
        let Some(service) = self.services.get_mut(port as usize).and_then(|s| s.as_mut()) else {
            warn!("no service listening on port {port}");
            return Err(LinkError::NoService.into());
        };

        if segment.ctl.has(flags::PSH) {
            if segment.ctl.len as usize > segment.offset.len as usize {
                if segment.offset.id == 0 {
                    service.reassembly.clear();
                    service.reassembly_total = Some(segment.ctl.len);
                }
                service
                    .reassembly
                    .insert(segment.offset.id, segment.payload.clone());

                let merged_len: usize = service.reassembly.values().map(|v| v.len()).sum();
                if Some(merged_len as u16) >= service.reassembly_total {
                    let mut merged = Vec::with_capacity(merged_len);
                    for fragment in service.reassembly.values() {
                        merged.extend_from_slice(fragment);
                    }
                    service.deliver(segment.src, &merged);
                    service.reassembly.clear();
                    service.reassembly_total = None;
                }
            } else {
                service.deliver(segment.src, &segment.payload);
            }
        }

        if segment.ctl.has(flags::PIN) {
            let pong = Segment {
                seq: segment.seq,
                dst: segment.src,
                src: segment.dst,
                offset: Offset::default(),
                ctl: Ctl {
                    type_bit: segment.ctl.type_bit,
                    wlan: self.wlan,
                    flags: flags::PON,
                    len: 0,
                },
                payload: Vec::new(),
            };
            self.outbound.push_back(pong);
            if segment.src.address == self.local.address {
                service.state = ServiceState::PongReceived;
            }
        }

        if segment.ctl.has(flags::PON) {
            service.state = ServiceState::PongReceived;
        }
        Ok(())
    }

    /// Fragments `data` into `⌈len / DataSize⌉` segments and enqueues them,
    /// then spins waiting for [`Self::process`] to drain them (spec.md
    /// §4.C.5). Call `process()` from another thread/task while this spins.
    pub fn send_packet(&mut self, port: u8, to: Address, data: &[u8]) -> Result<()> {
        if self.locked {
            return Err(LinkError::Locked.into());
        }
        let local = self
            .services
            .get(port as usize)
            .and_then(|s| s.as_ref())
            .map(|s| s.local)
            .unwrap_or(Address::new(self.local.address, port));

        let data_size = self.data_size.max(1) as usize;
        let total_len = (data.len() as u32 & CTL_LEN_MASK) as u16;
        let chunk_count = data.len().div_ceil(data_size).max(1);

        for (id, chunk) in data.chunks(data_size).enumerate().take(chunk_count) {
            let segment = Segment {
                seq: Sequence::default(),
                dst: to,
                src: local,
                offset: Offset {
                    id: id as u8,
                    len: chunk.len() as u8,
                },
                ctl: Ctl {
                    type_bit: false,
                    wlan: self.wlan,
                    flags: flags::PSH,
                    len: total_len,
                },
                payload: chunk.to_vec(),
            };
            self.outbound.push_back(segment);
        }
        if data.is_empty() {
            self.outbound.push_back(Segment {
                seq: Sequence::default(),
                dst: to,
                src: local,
                offset: Offset::default(),
                ctl: Ctl {
                    type_bit: false,
                    wlan: self.wlan,
                    flags: flags::PSH,
                    len: 0,
                },
                payload: Vec::new(),
            });
        }

        if let Some(service) = self.services.get_mut(port as usize).and_then(|s| s.as_mut()) {
            service.state = ServiceState::WaitingSend;
        }

        for _ in 0..1000 {
            self.process()?;
            let idle = self
                .services
                .get(port as usize)
                .and_then(|s| s.as_ref())
                .map(|s| s.state != ServiceState::WaitingSend)
                .unwrap_or(true);
            if idle && self.outbound.is_empty() {
                if let Some(service) = self.services.get_mut(port as usize).and_then(|s| s.as_mut()) {
                    service.state = ServiceState::Idle;
                }
                return Ok(());
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        Err(LinkError::SendTimeout.into())
    }

    /// Enqueues a single PIN segment and spins up to 1000ms for `PongReceived`
    /// (spec.md §4.C.5).
    pub fn send_ping(&mut self, to: Address) -> Result<()> {
        let local = self
            .services
            .get(SYSTEM_SERVICE_PORT as usize)
            .and_then(|s| s.as_ref())
            .map(|s| s.local)
            .unwrap_or(Address::new(self.local.address, SYSTEM_SERVICE_PORT));

        self.outbound.push_back(Segment {
            seq: Sequence::default(),
            dst: to,
            src: local,
            offset: Offset::default(),
            ctl: Ctl {
                type_bit: false,
                wlan: self.wlan,
                flags: flags::PIN,
                len: 0,
            },
            payload: Vec::new(),
        });

        for _ in 0..1000 {
            self.process()?;
            let pong = self
                .services
                .get(SYSTEM_SERVICE_PORT as usize)
                .and_then(|s| s.as_ref())
                .map(|s| s.state == ServiceState::PongReceived)
                .unwrap_or(false);
            if pong {
                return Ok(());
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        Err(LinkError::PingTimeout.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn crc_matches_check_value() {
        assert_eq!(CRC.checksum(b"123456789"), 0x4B);
    }

    #[test]
    fn encode_decode_roundtrips() {
        let segment = Segment {
            seq: Sequence { ack: 1, tx: 2 },
            dst: Address::new(5, 54),
            src: Address::new(6, 55),
            offset: Offset { id: 0, len: 4 },
            ctl: Ctl {
                type_bit: false,
                wlan: 3,
                flags: flags::PSH,
                len: 4,
            },
            payload: vec![1, 2, 3, 4],
        };
        let bytes = segment.encode();
        let decoded = Segment::decode(&bytes).unwrap();
        assert_eq!(decoded.dst, segment.dst);
        assert_eq!(decoded.src, segment.src);
        assert_eq!(decoded.ctl.flags, flags::PSH);
        assert_eq!(decoded.payload, segment.payload);
    }

    #[test]
    fn corrupted_crc_is_rejected() {
        let segment = Segment {
            seq: Sequence::default(),
            dst: Address::new(1, 54),
            src: Address::new(2, 55),
            offset: Offset { id: 0, len: 1 },
            ctl: Ctl {
                type_bit: false,
                wlan: 0,
                flags: flags::PSH,
                len: 1,
            },
            payload: vec![0x42],
        };
        let mut bytes = segment.encode();
        bytes[5] ^= 0xFF;
        assert!(Segment::decode(&bytes).is_none());
    }

    #[test]
    fn inbound_drops_bad_crc_and_counts_it() {
        let mut link = LiteLink::new(1, Address::new(2, 0), 32, |_| Ok(())).unwrap();
        let mut bytes = vec![0u8; HEADER_SIZE];
        bytes[0] = 0xFF;
        link.inbound(&bytes);
        assert_eq!(link.drop_count(), 1);
    }

    #[test]
    fn broadcast_destination_is_rewritten_to_local() {
        let received: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let received_clone = received.clone();

        let mut link = LiteLink::new(7, Address::new(3, 0), 32, |_| Ok(())).unwrap();
        link.listen(10, move |_from, data| {
            received_clone.lock().unwrap().extend_from_slice(data);
        })
        .unwrap();

        let segment = Segment {
            seq: Sequence::default(),
            dst: Address::new(BROADCAST_ADDRESS, 10),
            src: Address::new(9, 20),
            offset: Offset { id: 0, len: 2 },
            ctl: Ctl {
                type_bit: false,
                wlan: 7,
                flags: flags::PSH,
                len: 2,
            },
            payload: vec![0xAB, 0xCD],
        };
        link.inbound(&segment.encode());
        link.process().unwrap();

        assert_eq!(*received.lock().unwrap(), vec![0xAB, 0xCD]);
    }

    #[test]
    fn fragmented_message_reassembles_on_delivery() {
        let received: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let received_clone = received.clone();

        let mut link = LiteLink::new(0, Address::new(4, 0), 20, |_| Ok(())).unwrap();
        link.listen(30, move |_from, data| {
            received_clone.lock().unwrap().extend_from_slice(data);
        })
        .unwrap();

        let payload = vec![7u8; 25];
        let data_size = link.data_size() as usize;
        for (id, chunk) in payload.chunks(data_size).enumerate() {
            let segment = Segment {
                seq: Sequence::default(),
                dst: Address::new(4, 30),
                src: Address::new(9, 31),
                offset: Offset {
                    id: id as u8,
                    len: chunk.len() as u8,
                },
                ctl: Ctl {
                    type_bit: false,
                    wlan: 0,
                    flags: flags::PSH,
                    len: payload.len() as u16,
                },
                payload: chunk.to_vec(),
            };
            link.inbound(&segment.encode());
        }
        for _ in 0..payload.len().div_ceil(data_size) {
            link.process().unwrap();
        }

        assert_eq!(*received.lock().unwrap(), payload);
    }

    #[test]
    fn ping_synthesizes_pong_with_swapped_addresses() {
        let mut link = LiteLink::new(0, Address::new(4, 0), 32, |_| Ok(())).unwrap();
        let segment = Segment {
            seq: Sequence::default(),
            dst: Address::new(4, 0),
            src: Address::new(4, 0),
            offset: Offset::default(),
            ctl: Ctl {
                type_bit: false,
                wlan: 0,
                flags: flags::PIN,
                len: 0,
            },
            payload: Vec::new(),
        };
        link.inbound(&segment.encode());
        link.process().unwrap();

        let service = link.services[SYSTEM_SERVICE_PORT as usize].as_ref().unwrap();
        assert_eq!(service.state, ServiceState::PongReceived);
        assert_eq!(link.outbound.len(), 1);
        assert!(link.outbound[0].ctl.has(flags::PON));
    }
}
