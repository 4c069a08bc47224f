use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use crate::error::Result;
use crate::host::{Host, Peer, Role, Stats};
use crate::socket::Transport;
use crate::{Channel, Config};

/// A Kestrel server. Accepts inbound connections unless a validation callback rejects them.
///
/// Register callbacks before calling [`Server::listen`] so that no connection is missed.
pub struct Server {
    host: Host,
}

impl Server {
    /// Creates a stopped server. Fails if `config` does not validate.
    pub fn new(config: Config) -> Result<Self> {
        Ok(Self {
            host: Host::new(Role::Server, config)?,
        })
    }

    /// Wraps a host built with [`Host::builder`], e.g. to share a metrics sink.
    pub fn with_host(host: Host) -> Self {
        Self { host }
    }

    /// Binds a UDP socket at the provided address and starts accepting connections.
    pub fn listen<A>(&self, bind_addr: A) -> Result<()>
    where
        A: ToSocketAddrs,
    {
        self.host.bind(bind_addr)
    }

    /// Starts accepting connections over a custom transport.
    pub fn start(&self, transport: Arc<dyn Transport>) -> Result<()> {
        self.host.start(transport)
    }

    /// Disconnects every client without invoking callbacks, and waits for all threads to exit.
    pub fn stop(&self) -> Result<()> {
        self.host.stop()
    }

    pub fn on_connect<F>(&self, callback: F)
    where
        F: Fn(&Peer, &[u8]) + Send + Sync + 'static,
    {
        self.host.on_connect(callback)
    }

    pub fn on_disconnect<F>(&self, callback: F)
    where
        F: Fn(&Peer, &[u8]) + Send + Sync + 'static,
    {
        self.host.on_disconnect(callback)
    }

    pub fn on_timeout<F>(&self, callback: F)
    where
        F: Fn(&Peer) + Send + Sync + 'static,
    {
        self.host.on_timeout(callback)
    }

    /// Replaces the default policy of accepting every client.
    pub fn on_validate<F>(&self, callback: F)
    where
        F: Fn(&SocketAddr, &[u8]) -> bool + Send + Sync + 'static,
    {
        self.host.on_validate(callback)
    }

    pub fn on_receive<F>(&self, callback: F)
    where
        F: Fn(&Peer, &[u8], Channel) + Send + Sync + 'static,
    {
        self.host.on_receive(callback)
    }

    pub fn peer(&self, addr: &SocketAddr) -> Option<Peer> {
        self.host.peer(addr)
    }

    /// Returns the number of clients in the connection table.
    pub fn connection_count(&self) -> usize {
        self.host.connection_count()
    }

    pub fn is_running(&self) -> bool {
        self.host.is_running()
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.host.local_addr()
    }

    pub fn stats(&self) -> &Stats {
        self.host.stats()
    }

    pub fn host(&self) -> &Host {
        &self.host
    }
}
