/*

Kestrel is a connection-oriented protocol over UDP. Each packet selects one of four delivery
channels: unreliable, unreliable-ordered, reliable and reliable-ordered.

# Datagram layout

All integers are big-endian.

  [protocol id: 1][checksum: 4][descriptor: 1]
  {sequence: 2}           if RELIABLE or ORDERED
  {order: 1}              if RELIABLE and ORDERED
  {ack: 2}{ack bits: 4}   if ACK
  [payload: N]

Descriptor bits are RELIABLE = 1, ACK = 2, ORDERED = 4, CONNECT = 8 and DISCONNECT = 16. The header
size is a pure function of the descriptor, which lets a listener check the protocol id, the length
and the CRC32 (computed with the checksum bytes zeroed) before any connection state is touched.

# Reliability

Reliable packets carry a 16-bit sequence number. The receiver marks each one in a sequence window,
a ring of slots indexed by `sequence % size` that remember which sequence last wrote them. A packet
whose slot is already marked with its own sequence is a duplicate and is dropped.

The receiver tracks the highest sequence seen (within a skip budget, so that one wild packet cannot
move it far ahead) and acks it along with a 32-bit bitmap of the 32 sequences preceding it. Acks
ride on every packet carrying the ACK flag, and are sent on their own when nothing else has carried
one for a while.

The sender keeps every unacknowledged reliable packet in a ledger, oldest first. Periodically, the
ledger is scanned: at most N packets are resent per scan, and packets older than a fixed retention
time are given up on. Reliable delivery is therefore best effort with a bounded retry budget.

# Ordering

Reliable-ordered packets additionally carry an 8-bit order number. The receiver holds out-of-order
packets in a bounded chain sorted by order number, and delivers the consecutive run starting at the
next expected number. If no progress is made for a while, the head of the chain is taken to be the
next expected packet and the gap is abandoned.

Unreliable-ordered packets carry their own 16-bit sequence. A packet is delivered only if it is
newer than the last one delivered; older packets are dropped.

# Congestion

Each ack of a packet sent after the handshake yields an RTT sample, smoothed with an exponential
moving average. A single sample above a threshold switches the connection to bad mode, in which the
resend interval, the number of resends per scan and the ack interval are multiplied by a constant,
and every Nth unreliable packet is shed. The connection returns to good mode once no bad sample has
been seen for a dwell time. Re-entering bad mode shortly after leaving it doubles the dwell time;
staying in good mode for long halves it.

This is not a fair congestion controller. It only makes a struggling connection less aggressive.

# Handshake

The initiator sends a reliable CONNECT carrying an application payload. The accepting host runs its
validation callback, creates a connection, replies with its own reliable CONNECT and considers the
connection established. The initiator considers the connection established when that reply
arrives.

A connection is torn down by a DISCONNECT (sent several times, since it is never acknowledged), by
silence for longer than the inactivity timeout, by a ping above the configured maximum, or by the
host stopping. Every path converges on a single teardown which runs at most once per connection.

# Threads

Each host runs a configurable number of listener threads over a shared socket, and each connection
runs a duty cycle on its own thread: send one queued packet, scan for resends, skip stalled gaps,
send periodic acks and pings, check liveness. Inbound datagrams are processed synchronously on the
listener thread that read them. A duty cycle cannot join itself, so timeouts are handed to an
executor.

*/

mod buffer;
pub mod client;
pub mod config;
mod connection;
mod error;
pub mod frame;
mod host;
pub mod seq;
pub mod server;
pub mod socket;

use frame::Descriptor;

pub use client::Client;
pub use config::Config;
pub use connection::State;
pub use error::{Error, Result};
pub use host::{
    BackgroundExecutor, Executor, Host, HostBuilder, Peer, Role, Stats, StatsSnapshot, Task,
};
pub use server::Server;

/// Delivery guarantee of a packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Channel {
    /// May be lost, duplicated or reordered.
    Unreliable,
    /// May be lost. Never delivered after a newer packet on the same channel.
    UnreliableOrdered,
    /// Resent until acknowledged, within a bounded retry budget. May be reordered.
    Reliable,
    /// Resent until acknowledged, and delivered in send order.
    ReliableOrdered,
}

impl Channel {
    /// Descriptor flags used to send on this channel.
    pub fn descriptor(self) -> Descriptor {
        match self {
            Channel::Unreliable => Descriptor::empty(),
            Channel::UnreliableOrdered => Descriptor::ORDERED,
            Channel::Reliable => Descriptor::RELIABLE | Descriptor::ACK,
            Channel::ReliableOrdered => Descriptor::RELIABLE | Descriptor::ACK | Descriptor::ORDERED,
        }
    }

    /// Channel implied by the flags of a received packet.
    pub fn from_descriptor(descriptor: Descriptor) -> Self {
        let reliable = descriptor.contains(Descriptor::RELIABLE);
        let ordered = descriptor.contains(Descriptor::ORDERED);

        match (reliable, ordered) {
            (false, false) => Channel::Unreliable,
            (false, true) => Channel::UnreliableOrdered,
            (true, false) => Channel::Reliable,
            (true, true) => Channel::ReliableOrdered,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_descriptors() {
        let channels = [
            Channel::Unreliable,
            Channel::UnreliableOrdered,
            Channel::Reliable,
            Channel::ReliableOrdered,
        ];

        for channel in channels {
            assert_eq!(Channel::from_descriptor(channel.descriptor()), channel);
        }

        // Control flags do not affect the channel
        let ping = Descriptor::RELIABLE | Descriptor::ACK | Descriptor::CONNECT;
        assert_eq!(Channel::from_descriptor(ping), Channel::Reliable);
    }
}
