use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use crate::connection::{Connection, State};
use crate::error::{Error, Result};
use crate::Channel;

use super::{HostCore, Reason};

/// Handle to a remote peer, handed to callbacks and returned by [`Host::connect`].
///
/// Handles are cheap to clone. Once the peer disconnects, sends fail with
/// [`Error::Disconnected`].
///
/// [`Host::connect`]: crate::Host::connect
#[derive(Clone)]
pub struct Peer {
    conn: Arc<Connection>,
    host: Weak<HostCore>,
}

impl Peer {
    pub(super) fn new(conn: Arc<Connection>, host: Weak<HostCore>) -> Self {
        Self { conn, host }
    }

    /// Returns the remote address, or the unspecified address once the peer has been recycled.
    pub fn addr(&self) -> SocketAddr {
        self.conn.addr()
    }

    pub fn state(&self) -> State {
        self.conn.state()
    }

    pub fn is_connected(&self) -> bool {
        self.conn.state() == State::Connected
    }

    /// Queues `data` for delivery on `channel`.
    pub fn send(&self, channel: Channel, data: &[u8]) -> Result<()> {
        self.conn.send(channel, data)
    }

    /// Fire and forget.
    pub fn send_unreliable(&self, data: &[u8]) -> Result<()> {
        self.send(Channel::Unreliable, data)
    }

    /// Fire and forget, but packets older than the newest one received are discarded.
    pub fn send_unreliable_ordered(&self, data: &[u8]) -> Result<()> {
        self.send(Channel::UnreliableOrdered, data)
    }

    /// Resent until acknowledged, within a bounded retry budget.
    pub fn send_reliable(&self, data: &[u8]) -> Result<()> {
        self.send(Channel::Reliable, data)
    }

    /// Resent until acknowledged, and delivered in send order.
    pub fn send_reliable_ordered(&self, data: &[u8]) -> Result<()> {
        self.send(Channel::ReliableOrdered, data)
    }

    /// Half the smoothed round trip time, in milliseconds.
    pub fn ping_ms(&self) -> u64 {
        self.conn.ping_ms()
    }

    /// Tears the connection down, sending `payload` with the DISCONNECT datagrams. Does nothing
    /// if the peer is already disconnected.
    pub fn disconnect(&self, payload: &[u8]) -> Result<()> {
        let host = self.host.upgrade().ok_or(Error::NotRunning)?;
        host.disconnect(Arc::clone(&self.conn), payload, Reason::Local);
        Ok(())
    }

    pub fn set<T>(&self, key: impl Into<String>, value: T)
    where
        T: Any + Send + Sync,
    {
        self.conn.store().set(key, value)
    }

    pub fn try_set<T>(&self, key: impl Into<String>, value: T) -> bool
    where
        T: Any + Send + Sync,
    {
        self.conn.store().try_set(key, value)
    }

    pub fn get<T>(&self, key: &str) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        self.conn.store().get(key)
    }

    pub fn del(&self, key: &str) -> bool {
        self.conn.store().del(key)
    }
}

impl std::cmp::PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.conn, &other.conn)
    }
}

impl std::cmp::Eq for Peer {}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Peer({}, {:?})", self.addr(), self.state())
    }
}
