//! Datagram layout and the packet type exchanged between connections.

pub mod serial;

use std::fmt;
use std::ops;

/// Flag set selecting the optional header fields and the delivery guarantee of a packet.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Descriptor(u8);

impl Descriptor {
    pub const RELIABLE: Self = Self(0x01);
    pub const ACK: Self = Self(0x02);
    pub const ORDERED: Self = Self(0x04);
    pub const CONNECT: Self = Self(0x08);
    pub const DISCONNECT: Self = Self(0x10);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Returns true if every flag of `other` is set.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns true if any flag of `other` is set.
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
}

impl ops::BitOr for Descriptor {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl ops::BitOrAssign for Descriptor {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(Descriptor, &str); 5] = [
            (Descriptor::RELIABLE, "RELIABLE"),
            (Descriptor::ACK, "ACK"),
            (Descriptor::ORDERED, "ORDERED"),
            (Descriptor::CONNECT, "CONNECT"),
            (Descriptor::DISCONNECT, "DISCONNECT"),
        ];

        let mut list = f.debug_set();
        for (flag, name) in NAMES {
            if self.contains(flag) {
                list.entry(&format_args!("{}", name));
            }
        }
        list.finish()
    }
}

/// A single datagram. Fields not selected by `descriptor` are ignored on the wire.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Packet {
    pub protocol_id: u8,
    pub checksum: u32,
    pub descriptor: Descriptor,
    // Present iff RELIABLE or ORDERED
    pub sequence: u16,
    // Present iff RELIABLE and ORDERED
    pub order: u8,
    // Present iff ACK
    pub ack: u16,
    pub ack_bits: u32,
    pub payload: Box<[u8]>,
}

impl Packet {
    pub fn new(descriptor: Descriptor, payload: Box<[u8]>) -> Self {
        Self {
            descriptor,
            payload,
            ..Default::default()
        }
    }

    pub fn flag(&self, flag: Descriptor) -> bool {
        self.descriptor.contains(flag)
    }
}
