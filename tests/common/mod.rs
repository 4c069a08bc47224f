use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time;

use kestrel::socket::{Receiver, Transport};
use kestrel::{Client, Config, Peer, Server};

/// A datagram in flight on a [`MemoryNet`].
#[derive(Clone, Debug)]
pub struct Datagram {
    pub from: SocketAddr,
    pub to: SocketAddr,
    pub bytes: Box<[u8]>,
}

impl Datagram {
    /// Decodes the packet, for filters which inspect traffic.
    pub fn packet(&self) -> kestrel::frame::Packet {
        kestrel::frame::serial::decode(&self.bytes).expect("valid packet")
    }
}

/// Decides what the network does with a sent datagram. Returns the datagrams to deliver now,
/// which may include datagrams held from earlier calls.
pub type Filter = Box<dyn FnMut(Datagram) -> Vec<Datagram> + Send>;

type Inbox = mpsc::Sender<(Box<[u8]>, SocketAddr)>;

#[derive(Default)]
struct NetState {
    inboxes: HashMap<SocketAddr, Inbox>,
    filter: Option<Filter>,
}

/// In-process datagram network with a programmable filter for loss, duplication and reordering.
#[derive(Clone, Default)]
pub struct MemoryNet {
    state: Arc<Mutex<NetState>>,
}

pub struct MemoryTransport {
    addr: SocketAddr,
    state: Arc<Mutex<NetState>>,
    inbox: Arc<Mutex<mpsc::Receiver<(Box<[u8]>, SocketAddr)>>>,
}

struct MemoryReceiver {
    inbox: Arc<Mutex<mpsc::Receiver<(Box<[u8]>, SocketAddr)>>>,
}

impl MemoryNet {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn endpoint(&self, addr: &str) -> Arc<MemoryTransport> {
        let addr: SocketAddr = addr.parse().unwrap();
        let (tx, rx) = mpsc::channel();

        self.state.lock().unwrap().inboxes.insert(addr, tx);

        Arc::new(MemoryTransport {
            addr,
            state: Arc::clone(&self.state),
            inbox: Arc::new(Mutex::new(rx)),
        })
    }

    pub fn set_filter<F>(&self, filter: F)
    where
        F: FnMut(Datagram) -> Vec<Datagram> + Send + 'static,
    {
        self.state.lock().unwrap().filter = Some(Box::new(filter));
    }

    /// Drops every datagram from now on.
    pub fn cut(&self) {
        self.set_filter(|_| Vec::new());
    }
}

impl Transport for MemoryTransport {
    fn send_to(&self, frame: &[u8], addr: &SocketAddr) -> io::Result<usize> {
        let ref mut state = *self.state.lock().unwrap();

        let datagram = Datagram {
            from: self.addr,
            to: *addr,
            bytes: frame.into(),
        };

        let deliver = match &mut state.filter {
            Some(filter) => filter(datagram),
            None => vec![datagram],
        };

        for d in deliver {
            if let Some(inbox) = state.inboxes.get(&d.to) {
                let _ = inbox.send((d.bytes, d.from));
            }
        }

        Ok(frame.len())
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.addr)
    }

    fn receiver(&self) -> io::Result<Box<dyn Receiver>> {
        Ok(Box::new(MemoryReceiver {
            inbox: Arc::clone(&self.inbox),
        }))
    }
}

impl Receiver for MemoryReceiver {
    fn recv_from(
        &mut self,
        buffer: &mut [u8],
        timeout: time::Duration,
    ) -> io::Result<Option<(usize, SocketAddr)>> {
        let inbox = self.inbox.lock().unwrap();

        match inbox.recv_timeout(timeout) {
            Ok((bytes, from)) => {
                let len = bytes.len().min(buffer.len());
                buffer[..len].copy_from_slice(&bytes[..len]);
                Ok(Some((len, from)))
            }
            Err(_) => Ok(None),
        }
    }
}

pub const SERVER_ADDR: &str = "10.0.0.1:4000";
pub const CLIENT_ADDR: &str = "10.0.0.2:5000";

/// Starts `server` at [`SERVER_ADDR`], connects `client` from [`CLIENT_ADDR`] and waits until
/// both sides are connected. Returns the server's and the client's view of the connection.
pub fn connect_pair(net: &MemoryNet, server: &Server, client: &Client) -> (Peer, Peer) {
    let server_addr: SocketAddr = SERVER_ADDR.parse().unwrap();
    let client_addr: SocketAddr = CLIENT_ADDR.parse().unwrap();

    server.start(net.endpoint(SERVER_ADDR)).unwrap();

    let client_peer = client
        .connect_with(net.endpoint(CLIENT_ADDR), server_addr, b"")
        .unwrap();

    assert!(wait_until(2000, || {
        client_peer.is_connected()
            && server
                .peer(&client_addr)
                .map_or(false, |peer| peer.is_connected())
    }));

    (server.peer(&client_addr).unwrap(), client_peer)
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Shorter timeouts so liveness tests finish quickly.
pub fn test_config() -> Config {
    Config {
        timeout_threshold_ms: 600,
        receive_timeout_ms: 50,
        ..Default::default()
    }
}

/// Polls `cond` until it holds or `timeout_ms` elapses. Returns the final value of `cond`.
pub fn wait_until<F>(timeout_ms: u64, mut cond: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = time::Instant::now() + time::Duration::from_millis(timeout_ms);

    while time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(time::Duration::from_millis(5));
    }

    cond()
}

/// Thread-safe log of callback observations.
#[derive(Clone)]
pub struct EventLog<T> {
    events: Arc<Mutex<Vec<T>>>,
}

impl<T: Clone> EventLog<T> {
    pub fn new() -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn push(&self, event: T) {
        self.events.lock().unwrap().push(event);
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn snapshot(&self) -> Vec<T> {
        self.events.lock().unwrap().clone()
    }
}
