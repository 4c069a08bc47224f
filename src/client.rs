use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::host::{Host, Peer, Role, Stats};
use crate::socket::{Transport, UdpTransport};
use crate::{Channel, Config};

/// A Kestrel client: one outbound connection, no inbound ones.
///
/// The client stops itself once the server disconnects it or the connection times out.
pub struct Client {
    host: Host,
    // Connection to the server, once connect() has been called
    server: Mutex<Option<Peer>>,
}

impl Client {
    /// Creates a stopped client. Fails if `config` does not validate.
    pub fn new(config: Config) -> Result<Self> {
        Ok(Self::with_host(Host::new(Role::Client, config)?))
    }

    /// Wraps a host built with [`Host::builder`], e.g. to share a metrics sink.
    pub fn with_host(host: Host) -> Self {
        let client = Self {
            host,
            server: Mutex::new(None),
        };

        client.on_disconnect(|_, _| ());

        client
    }

    /// Binds an ephemeral UDP socket and connects to `server_addr`, carrying `payload` in the
    /// handshake. Returns immediately; the connect callback fires once the server accepts.
    pub fn connect(&self, server_addr: SocketAddr, payload: &[u8]) -> Result<Peer> {
        let bind_addr = match server_addr {
            SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
        };

        self.connect_with(Arc::new(UdpTransport::bind(bind_addr)?), server_addr, payload)
    }

    /// Connects to `server_addr` over a custom transport.
    pub fn connect_with(
        &self,
        transport: Arc<dyn Transport>,
        server_addr: SocketAddr,
        payload: &[u8],
    ) -> Result<Peer> {
        let ref mut server = *self.server.lock();

        self.host.start(transport)?;

        match self.host.connect(server_addr, payload) {
            Ok(peer) => {
                *server = Some(peer.clone());
                Ok(peer)
            }
            Err(err) => {
                let _ = self.host.stop();
                Err(err)
            }
        }
    }

    /// Returns the connection to the server, if connect() has been called.
    pub fn server(&self) -> Option<Peer> {
        self.server.lock().clone()
    }

    /// Sends DISCONNECT with `payload` and stops the client.
    pub fn disconnect(&self, payload: &[u8]) -> Result<()> {
        let server = self.server.lock().take().ok_or(Error::NotRunning)?;

        server.disconnect(payload)?;

        match self.host.stop() {
            // Already stopped by the disconnect callback
            Ok(()) | Err(Error::NotRunning) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Called when the server accepts the connection, with the server's handshake payload.
    pub fn on_connect<F>(&self, callback: F)
    where
        F: Fn(&Peer, &[u8]) + Send + Sync + 'static,
    {
        self.host.on_connect(callback)
    }

    /// Called when the connection to the server ends. The client then stops.
    pub fn on_disconnect<F>(&self, callback: F)
    where
        F: Fn(&Peer, &[u8]) + Send + Sync + 'static,
    {
        let stopper = self.host.deferred_stop();

        self.host.on_disconnect(move |peer, payload| {
            callback(peer, payload);
            stopper.stop();
        })
    }

    pub fn on_timeout<F>(&self, callback: F)
    where
        F: Fn(&Peer) + Send + Sync + 'static,
    {
        self.host.on_timeout(callback)
    }

    pub fn on_receive<F>(&self, callback: F)
    where
        F: Fn(&Peer, &[u8], Channel) + Send + Sync + 'static,
    {
        self.host.on_receive(callback)
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
