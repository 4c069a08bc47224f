//! Byte-level encoding of [`Packet`]s.
//!
//! All multi-byte fields are big-endian:
//!
//! ```text
//! [protocol_id:1][checksum:4][descriptor:1]
//! {sequence:2   if RELIABLE | ORDERED}
//! {order:1      if RELIABLE & ORDERED}
//! {ack:2, ack_bits:4 if ACK}
//! [payload:N]
//! ```
//!
//! The checksum is a CRC32 over the whole datagram with the checksum bytes zeroed.

use super::{Descriptor, Packet};

pub const PROTOCOL_ID_OFFSET: usize = 0;
pub const CHECKSUM_OFFSET: usize = 1;
pub const CHECKSUM_SIZE: usize = 4;
pub const DESCRIPTOR_OFFSET: usize = CHECKSUM_OFFSET + CHECKSUM_SIZE;

pub const HEADER_SIZE_MIN: usize = 6;
pub const SEQUENCE_SIZE: usize = 2;
pub const ORDER_SIZE: usize = 1;
pub const ACK_SIZE: usize = 2 + 4;
pub const HEADER_SIZE_MAX: usize = HEADER_SIZE_MIN + SEQUENCE_SIZE + ORDER_SIZE + ACK_SIZE;

pub struct Reader<'a> {
    buffer: &'a [u8],
    bytes_read: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buffer: &'a [u8]) -> Self {
        Self {
            buffer,
            bytes_read: 0,
        }
    }

    pub fn bytes_read(&self) -> usize {
        self.bytes_read
    }

    fn take<const N: usize>(&mut self) -> Option<[u8; N]> {
        let bytes = self.buffer.get(self.bytes_read..self.bytes_read + N)?;
        self.bytes_read += N;
        bytes.try_into().ok()
    }

    pub fn read_u8(&mut self) -> Option<u8> {
        self.take::<1>().map(|b| b[0])
    }

    pub fn read_u16(&mut self) -> Option<u16> {
        self.take::<2>().map(u16::from_be_bytes)
    }

    pub fn read_u32(&mut self) -> Option<u32> {
        self.take::<4>().map(u32::from_be_bytes)
    }

    pub fn remaining_bytes(&self) -> &'a [u8] {
        &self.buffer[self.bytes_read..]
    }
}

pub struct Writer<'a> {
    buffer: &'a mut Vec<u8>,
}

impl<'a> Writer<'a> {
    pub fn new(buffer: &'a mut Vec<u8>) -> Self {
        Self { buffer }
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_slice(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }
}

fn has_sequence(descriptor: Descriptor) -> bool {
    descriptor.intersects(Descriptor::RELIABLE | Descriptor::ORDERED)
}

fn has_order(descriptor: Descriptor) -> bool {
    descriptor.contains(Descriptor::RELIABLE | Descriptor::ORDERED)
}

/// Header length implied by a descriptor.
pub fn header_size(descriptor: Descriptor) -> usize {
    let mut size = HEADER_SIZE_MIN;

    if has_sequence(descriptor) {
        size += SEQUENCE_SIZE;
    }
    if has_order(descriptor) {
        size += ORDER_SIZE;
    }
    if descriptor.contains(Descriptor::ACK) {
        size += ACK_SIZE;
    }

    size
}

/// Computes the CRC32 of a datagram as if its checksum bytes were zero.
pub fn checksum(bytes: &[u8]) -> u32 {
    debug_assert!(bytes.len() >= HEADER_SIZE_MIN);

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&bytes[..CHECKSUM_OFFSET]);
    hasher.update(&[0; CHECKSUM_SIZE]);
    hasher.update(&bytes[DESCRIPTOR_OFFSET..]);
    hasher.finalize()
}

/// Appends the wire form of `packet` to `dst`, checksum field written verbatim.
pub fn write(packet: &Packet, dst: &mut Vec<u8>) {
    let ref mut wr = Writer::new(dst);
    let descriptor = packet.descriptor;

    wr.write_u8(packet.protocol_id);
    wr.write_u32(packet.checksum);
    wr.write_u8(descriptor.bits());

    if has_sequence(descriptor) {
        wr.write_u16(packet.sequence);
    }
    if has_order(descriptor) {
        wr.write_u8(packet.order);
    }
    if descriptor.contains(Descriptor::ACK) {
        wr.write_u16(packet.ack);
        wr.write_u32(packet.ack_bits);
    }

    wr.write_slice(&packet.payload);
}

/// Computes and stores the checksum of `packet`, returning its serialized bytes.
pub fn encode(packet: &mut Packet) -> Box<[u8]> {
    let mut bytes = Vec::with_capacity(header_size(packet.descriptor) + packet.payload.len());

    packet.checksum = 0;
    write(packet, &mut bytes);

    packet.checksum = checksum(&bytes);
    bytes[CHECKSUM_OFFSET..DESCRIPTOR_OFFSET].copy_from_slice(&packet.checksum.to_be_bytes());

    bytes.into_boxed_slice()
}

/// Parses a datagram. Returns `None` if it is shorter than its descriptor requires.
pub fn decode(bytes: &[u8]) -> Option<Packet> {
    let ref mut rd = Reader::new(bytes);

    let protocol_id = rd.read_u8()?;
    let checksum = rd.read_u32()?;
    let descriptor = Descriptor::from_bits(rd.read_u8()?);

    let sequence = if has_sequence(descriptor) {
        rd.read_u16()?
    } else {
        0
    };

    let order = if has_order(descriptor) {
        rd.read_u8()?
    } else {
        0
    };

    let (ack, ack_bits) = if descriptor.contains(Descriptor::ACK) {
        (rd.read_u16()?, rd.read_u32()?)
    } else {
        (0, 0)
    };

    Some(Packet {
        protocol_id,
        checksum,
        descriptor,
        sequence,
        order,
        ack,
        ack_bits,
        payload: rd.remaining_bytes().into(),
    })
}

/// Cheap validation performed before a datagram is routed to any connection: minimum length,
/// protocol id, length implied by the descriptor, then checksum.
pub fn validate_header(bytes: &[u8], protocol_id: u8) -> bool {
    if bytes.len() < HEADER_SIZE_MIN {
        return false;
    }

    if bytes[PROTOCOL_ID_OFFSET] != protocol_id {
        return false;
    }

    if header_size(descriptor(bytes)) > bytes.len() {
        return false;
    }

    let stored = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);

    checksum(bytes) == stored
}

pub fn descriptor(bytes: &[u8]) -> Descriptor {
    debug_assert!(bytes.len() >= HEADER_SIZE_MIN);

    Descriptor::from_bits(bytes[DESCRIPTOR_OFFSET])
}

/// Bytes following the header of an already validated datagram.
pub fn payload(bytes: &[u8]) -> &[u8] {
    &bytes[header_size(descriptor(bytes))..]
}
