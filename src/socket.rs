use std::io;
use std::net;
use std::sync::Arc;
use std::time;

const SOCKET_POLLING_KEY: usize = 0;

/// Datagram I/O used by a host. Shared by every listener and connection thread.
pub trait Transport: Send + Sync {
    /// Sends one datagram. Failures are not reported to the protocol; datagrams are fire and
    /// forget.
    fn send_to(&self, frame: &[u8], addr: &net::SocketAddr) -> io::Result<usize>;

    fn local_addr(&self) -> io::Result<net::SocketAddr>;

    /// Creates the read half used by one listener thread.
    fn receiver(&self) -> io::Result<Box<dyn Receiver>>;
}

/// Read half of a [`Transport`], owned by a single listener thread.
pub trait Receiver: Send {
    /// Blocks for up to `timeout` for an incoming datagram and copies it into `buffer`. Returns
    /// Ok(None) if nothing arrived in the alloted time, or if polling awoke spuriously.
    fn recv_from(
        &mut self,
        buffer: &mut [u8],
        timeout: time::Duration,
    ) -> io::Result<Option<(usize, net::SocketAddr)>>;
}

/// Non-blocking UDP socket shared by any number of listeners.
pub struct UdpTransport {
    // Reference to non-blocking socket
    socket: Arc<net::UdpSocket>,
    // Cached from socket initialization
    local_addr: net::SocketAddr,
}

pub struct UdpReceiver {
    // Reference to non-blocking socket
    socket: Arc<net::UdpSocket>,
    // Polling objects
    poller: polling::Poller,
    poller_events: polling::Events,
}

impl UdpTransport {
    pub fn bind<A>(bind_address: A) -> io::Result<Self>
    where
        A: net::ToSocketAddrs,
    {
        let socket = net::UdpSocket::bind(bind_address)?;
        socket.set_nonblocking(true)?;

        let local_addr = socket.local_addr()?;

        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
        })
    }
}

impl Transport for UdpTransport {
    fn send_to(&self, frame: &[u8], addr: &net::SocketAddr) -> io::Result<usize> {
        self.socket.send_to(frame, addr)
    }

    fn local_addr(&self) -> io::Result<net::SocketAddr> {
        Ok(self.local_addr)
    }

    fn receiver(&self) -> io::Result<Box<dyn Receiver>> {
        let poller = polling::Poller::new()?;

        unsafe {
            poller.add(&*self.socket, polling::Event::readable(SOCKET_POLLING_KEY))?;
        }

        Ok(Box::new(UdpReceiver {
            socket: Arc::clone(&self.socket),
            poller,
            poller_events: polling::Events::new(),
        }))
    }
}

impl UdpReceiver {
    fn try_recv_from(&self, buffer: &mut [u8]) -> io::Result<Option<(usize, net::SocketAddr)>> {
        match self.socket.recv_from(buffer) {
            Ok((len, sender_addr)) => Ok(Some((len, sender_addr))),
            Err(err) => match err.kind() {
                // No datagram, or another listener got to it first
                io::ErrorKind::WouldBlock => Ok(None),
                _ => Err(err),
            },
        }
    }
}

impl Receiver for UdpReceiver {
    fn recv_from(
        &mut self,
        buffer: &mut [u8],
        timeout: time::Duration,
    ) -> io::Result<Option<(usize, net::SocketAddr)>> {
        // A datagram may already be waiting
        if let Some(received) = self.try_recv_from(buffer)? {
            return Ok(Some(received));
        }

        // Interest is oneshot and must be re-armed prior to each wait() call
        self.poller
            .modify(&*self.socket, polling::Event::readable(SOCKET_POLLING_KEY))?;

        self.poller_events.clear();

        let n = self.poller.wait(&mut self.poller_events, Some(timeout))?;

        if n > 0 {
            self.try_recv_from(buffer)
        } else {
            Ok(None)
        }
    }
}

impl Drop for UdpReceiver {
    fn drop(&mut self) {
        let _ = self.poller.delete(&*self.socket);
    }
}
