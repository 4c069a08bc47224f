//! Datagram dispatch, connection table and connection lifecycle.

mod addr_hash;
mod epoch;
pub mod executor;
mod guard;
mod peer;
mod pool;
mod stats;

use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::panic;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::config::Config;
use crate::connection::{Connection, HostContext, State};
use crate::error::{Error, Result};
use crate::frame::{serial, Descriptor};
use crate::socket::{Receiver, Transport, UdpTransport};
use crate::Channel;

use addr_hash::AddrHasher;
use epoch::Epoch;
use guard::ExecGuard;
use pool::Pool;

pub use executor::{BackgroundExecutor, Executor, Task};
pub use peer::Peer;
pub use stats::{Stats, StatsSnapshot};

/// Which side of the handshake a host plays by default.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Accepts inbound connects unless a validation callback says otherwise.
    Server,
    /// Rejects inbound connects unless a validation callback says otherwise.
    Client,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Reason {
    Local,
    Remote,
    Timeout,
    Shutdown,
}

type ConnectCallback = Arc<dyn Fn(&Peer, &[u8]) + Send + Sync>;
type TimeoutCallback = Arc<dyn Fn(&Peer) + Send + Sync>;
type ValidateCallback = Arc<dyn Fn(&SocketAddr, &[u8]) -> bool + Send + Sync>;
type ReceiveCallback = Arc<dyn Fn(&Peer, &[u8], Channel) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    connect: Option<ConnectCallback>,
    disconnect: Option<ConnectCallback>,
    timeout: Option<TimeoutCallback>,
    validate: Option<ValidateCallback>,
    receive: Option<ReceiveCallback>,
}

pub(crate) struct HostCore {
    // Saved configuration
    config: Arc<Config>,
    role: Role,
    // Source of integer timestamps
    epoch: Epoch,
    stats: Arc<Stats>,
    // Runs timeout teardowns off the connection threads
    executor: Arc<dyn Executor>,
    // Present while running
    transport: RwLock<Option<Arc<dyn Transport>>>,
    // Keys the connection table
    addr_hasher: AddrHasher,
    connections: RwLock<HashMap<u64, Arc<Connection>>>,
    // Addresses whose first handshake is being processed
    handshakes: ExecGuard,
    connection_pool: Pool<Arc<Connection>>,
    buffer_pool: Pool<Vec<u8>>,
    callbacks: RwLock<Callbacks>,
    running: AtomicBool,
    // Incremented by every start
    session: AtomicU64,
    // Also serializes start and stop
    listeners: Mutex<Vec<thread::JoinHandle<()>>>,
    // Held for the whole of a shutdown, so a restart never overlaps one
    teardown: Mutex<()>,
    this: Weak<HostCore>,
}

impl HostContext for HostCore {
    fn time_now_ms(&self) -> u64 {
        self.epoch.time_now_ms()
    }

    fn send_frame(&self, frame_bytes: &[u8], addr: &SocketAddr) {
        if let Some(transport) = &*self.transport.read() {
            let _ = transport.send_to(frame_bytes, addr);
        }
    }

    fn on_receive(&self, conn: &Arc<Connection>, payload: &[u8], channel: Channel) {
        let callback = self.callbacks.read().receive.clone();

        if let Some(callback) = callback {
            callback(&self.peer_handle(conn), payload, channel);
        }
    }

    fn on_inactive(&self, conn: &Arc<Connection>) {
        let host = self.this.clone();
        let conn = Arc::clone(conn);

        self.executor.execute(Box::new(move || {
            if let Some(host) = host.upgrade() {
                host.disconnect(conn, &[], Reason::Timeout);
            }
        }));
    }

    fn stats(&self) -> &Stats {
        &self.stats
    }
}

fn is_current_thread(handle: &thread::JoinHandle<()>) -> bool {
    handle.thread().id() == thread::current().id()
}

impl HostCore {
    fn new(
        role: Role,
        config: Config,
        stats: Arc<Stats>,
        executor: Arc<dyn Executor>,
    ) -> Arc<Self> {
        let config = Arc::new(config);

        let connection_pool = {
            let config = Arc::clone(&config);
            Pool::new(config.pool_capacity, move || {
                Arc::new(Connection::new(Arc::clone(&config)))
            })
        };

        let mtu = config.mtu;
        let buffer_pool = Pool::new(config.pool_capacity, move || vec![0u8; mtu]);

        Arc::new_cyclic(|this| Self {
            config,
            role,
            epoch: Epoch::new(),
            stats,
            executor,
            transport: RwLock::new(None),
            addr_hasher: Default::default(),
            connections: Default::default(),
            handshakes: ExecGuard::new(),
            connection_pool,
            buffer_pool,
            callbacks: Default::default(),
            running: AtomicBool::new(false),
            session: AtomicU64::new(0),
            listeners: Mutex::new(Vec::new()),
            teardown: Mutex::new(()),
            this: this.clone(),
        })
    }

    fn peer_handle(&self, conn: &Arc<Connection>) -> Peer {
        Peer::new(Arc::clone(conn), self.this.clone())
    }

    fn lookup(&self, key: u64) -> Option<Arc<Connection>> {
        self.connections.read().get(&key).cloned()
    }

    fn start(&self, transport: Arc<dyn Transport>) -> Result<()> {
        let ref mut listeners = *self.listeners.lock();
        let _teardown = self.teardown.lock();

        if self.running.load(Ordering::Acquire) {
            return Err(Error::AlreadyRunning);
        }

        let host = self.this.upgrade().ok_or(Error::NotRunning)?;

        let receivers = (0..self.config.listener_count)
            .map(|_| transport.receiver())
            .collect::<std::io::Result<Vec<_>>>()?;

        *self.transport.write() = Some(transport);
        self.session.fetch_add(1, Ordering::AcqRel);
        self.running.store(true, Ordering::Release);

        for (i, rx) in receivers.into_iter().enumerate() {
            let host = Arc::clone(&host);

            let spawned = thread::Builder::new()
                .name(format!("kestrel-listener-{}", i))
                .spawn(move || host.listen(rx));

            match spawned {
                Ok(handle) => listeners.push(handle),
                Err(err) => {
                    self.running.store(false, Ordering::Release);

                    for handle in listeners.drain(..) {
                        let _ = handle.join();
                    }

                    *self.transport.write() = None;

                    return Err(err.into());
                }
            }
        }

        tracing::debug!(listeners = listeners.len(), role = ?self.role, "host started");

        Ok(())
    }

    fn shutdown(&self) -> Result<()> {
        self.shutdown_session(None)
    }

    /// Stops the host. With `Some(session)`, only if the host has not been restarted since.
    fn shutdown_session(&self, session: Option<u64>) -> Result<()> {
        let (listeners, _teardown) = {
            let ref mut listeners = *self.listeners.lock();

            if session.map_or(false, |s| s != self.session.load(Ordering::Acquire)) {
                return Err(Error::NotRunning);
            }

            if !self.running.swap(false, Ordering::AcqRel) {
                return Err(Error::NotRunning);
            }

            (std::mem::take(listeners), self.teardown.lock())
        };

        tracing::debug!("stopping host");

        for handle in listeners {
            if !is_current_thread(&handle) {
                let _ = handle.join();
            }
        }

        let connections: Vec<_> = self
            .connections
            .write()
            .drain()
            .map(|(_, conn)| conn)
            .collect();

        for conn in connections {
            self.disconnect(conn, &[], Reason::Shutdown);
        }

        *self.transport.write() = None;

        tracing::debug!("host stopped");

        Ok(())
    }

    fn listen(&self, mut rx: Box<dyn Receiver>) {
        let timeout = Duration::from_millis(self.config.receive_timeout_ms);

        self.stats.worker_started();
        tracing::debug!("listener started");

        while self.running.load(Ordering::Acquire) {
            let result = panic::catch_unwind(panic::AssertUnwindSafe(|| {
                self.listen_once(&mut *rx, timeout)
            }));

            if result.is_err() {
                self.stats.panic_caught();
                tracing::error!("listener panicked");
            }
        }

        self.stats.worker_stopped();
        tracing::debug!("listener stopped");
    }

    fn listen_once(&self, rx: &mut dyn Receiver, timeout: Duration) {
        let mut buffer = self.buffer_pool.get();

        let received = match rx.recv_from(&mut buffer, timeout) {
            Ok(Some((len, addr))) => Some((Box::<[u8]>::from(&buffer[..len]), addr)),
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(%err, "socket read failed");
                thread::sleep(Duration::from_millis(self.config.update_loop_timeout_ms));
                None
            }
        };

        self.buffer_pool.put(buffer);

        if let Some((frame_bytes, addr)) = received {
            self.handle_datagram(&frame_bytes, addr);
        }
    }

    fn handle_datagram(&self, frame_bytes: &[u8], addr: SocketAddr) {
        self.stats.add_received_bytes(frame_bytes.len());

        if !serial::validate_header(frame_bytes, self.config.protocol_id) {
            tracing::trace!(%addr, len = frame_bytes.len(), "invalid datagram");
            return;
        }

        self.stats.add_processed_bytes(frame_bytes.len());

        let descriptor = serial::descriptor(frame_bytes);
        let key = self.addr_hasher.hash(&addr);

        let conn = match self.lookup(key) {
            Some(conn) => conn,
            None => {
                if descriptor.contains(Descriptor::CONNECT) {
                    self.accept(key, addr, frame_bytes);
                } else {
                    tracing::trace!(%addr, "datagram from unknown address");
                }
                return;
            }
        };

        if descriptor.contains(Descriptor::DISCONNECT) {
            self.disconnect(conn, serial::payload(frame_bytes), Reason::Remote);
            return;
        }

        if descriptor.contains(Descriptor::CONNECT)
            && conn.state() == State::Connecting
            && conn.try_establish()
        {
            self.stats.connect();
            tracing::debug!(%addr, "connection established");
            self.notify_connect(&conn, serial::payload(frame_bytes));
        }

        conn.receive(frame_bytes, self);
    }

    fn validate(&self, addr: &SocketAddr, payload: &[u8]) -> bool {
        let callback = self.callbacks.read().validate.clone();

        match callback {
            Some(callback) => callback(addr, payload),
            None => self.role == Role::Server,
        }
    }

    fn accept(&self, key: u64, addr: SocketAddr, frame_bytes: &[u8]) {
        let _entered = match self.handshakes.try_enter(key) {
            Some(entered) => entered,
            None => {
                tracing::trace!(%addr, "handshake already in progress");
                return;
            }
        };

        // Another listener may have completed the handshake before the guard was claimed
        if self.lookup(key).is_some() {
            return;
        }

        let payload = serial::payload(frame_bytes);

        if !self.validate(&addr, payload) {
            self.stats.connect_denied();
            tracing::warn!(%addr, "connect denied");
            return;
        }

        let host = match self.this.upgrade() {
            Some(host) => host,
            None => return,
        };

        let conn = self.connection_pool.get();
        conn.init(addr, self.time_now_ms());

        // An empty payload always fits
        let _ = conn.enqueue_connect(&[]);

        self.connections.write().insert(key, Arc::clone(&conn));

        if let Err(err) = conn.start(host) {
            tracing::error!(%addr, %err, "failed to start connection");
            self.connections.write().remove(&key);
            conn.try_close();
            self.connection_pool.put(conn);
            return;
        }

        if conn.try_establish() {
            self.stats.connect();
            tracing::debug!(%addr, "accepted connection");
            self.notify_connect(&conn, payload);
        }

        conn.receive(frame_bytes, self);
    }

    fn notify_connect(&self, conn: &Arc<Connection>, payload: &[u8]) {
        let callback = self.callbacks.read().connect.clone();

        if let Some(callback) = callback {
            callback(&self.peer_handle(conn), payload);
        }
    }

    fn connect(&self, addr: SocketAddr, payload: &[u8]) -> Result<Peer> {
        if !self.running.load(Ordering::Acquire) {
            return Err(Error::NotRunning);
        }

        let host = self.this.upgrade().ok_or(Error::NotRunning)?;
        let key = self.addr_hasher.hash(&addr);

        let conn = self.connection_pool.get();
        conn.init(addr, self.time_now_ms());

        if let Err(err) = conn.enqueue_connect(payload) {
            conn.try_close();
            self.connection_pool.put(conn);
            return Err(err);
        }

        {
            let ref mut connections = *self.connections.write();

            if let Some(existing) = connections.get(&key) {
                let peer = self.peer_handle(existing);
                conn.try_close();
                self.connection_pool.put(conn);
                return Ok(peer);
            }

            connections.insert(key, Arc::clone(&conn));
        }

        if let Err(err) = conn.start(host) {
            self.connections.write().remove(&key);
            conn.try_close();
            self.connection_pool.put(conn);
            return Err(err);
        }

        tracing::debug!(%addr, "connecting");

        Ok(self.peer_handle(&conn))
    }

    /// Single teardown path for every kind of disconnect. Only the first caller for a given
    /// connection has any effect.
    pub(crate) fn disconnect(&self, conn: Arc<Connection>, payload: &[u8], reason: Reason) {
        if !conn.try_close() {
            return;
        }

        let addr = conn.addr();
        let peer = self.peer_handle(&conn);

        if reason == Reason::Timeout {
            self.stats.timeout();
            tracing::debug!(%addr, "connection timed out");

            let callback = self.callbacks.read().timeout.clone();
            if let Some(callback) = callback {
                callback(&peer);
            }
        }

        self.stats.disconnect();
        tracing::debug!(%addr, ?reason, "disconnecting");

        if reason != Reason::Remote {
            // DISCONNECT is never acknowledged; repeat it instead
            conn.send_disconnect(payload, self.config.disconnect_repeat, self);

            if self.config.disconnect_linger_ms > 0 {
                thread::sleep(Duration::from_millis(self.config.disconnect_linger_ms));
            }
        }

        conn.stop();

        if reason != Reason::Shutdown {
            let key = self.addr_hasher.hash(&addr);

            {
                let ref mut connections = *self.connections.write();

                if connections
                    .get(&key)
                    .map_or(false, |c| Arc::ptr_eq(c, &conn))
                {
                    connections.remove(&key);
                }
            }

            let callback = self.callbacks.read().disconnect.clone();
            if let Some(callback) = callback {
                callback(&peer, payload);
            }
        }

        drop(peer);

        self.connection_pool.put(conn);
    }
}

/// Stops a host from the executor, so that it may be requested from any host thread.
#[derive(Clone)]
pub(crate) struct DeferredStop {
    host: Weak<HostCore>,
}

impl DeferredStop {
    pub(crate) fn stop(&self) {
        if let Some(host) = self.host.upgrade() {
            let task_host = Arc::clone(&host);
            let session = host.session.load(Ordering::Acquire);

            host.executor.execute(Box::new(move || {
                let _ = task_host.shutdown_session(Some(session));
            }));
        }
    }
}

/// Builder for [`Host`] objects, with injectable metrics sink and executor.
pub struct HostBuilder {
    role: Role,
    config: Config,
    stats: Option<Arc<Stats>>,
    executor: Option<Arc<dyn Executor>>,
}

impl HostBuilder {
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Counters to update. May be shared between hosts.
    pub fn stats(mut self, stats: Arc<Stats>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Executor used for timeout teardowns. Defaults to a [`BackgroundExecutor`].
    pub fn executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Validates the configuration and creates a stopped host.
    pub fn build(self) -> Result<Host> {
        self.config.validate()?;

        let executor = match self.executor {
            Some(executor) => executor,
            None => Arc::new(BackgroundExecutor::new()?),
        };

        let stats = self.stats.unwrap_or_default();

        Ok(Host {
            core: HostCore::new(self.role, self.config, stats, executor),
        })
    }
}

/// Protocol endpoint: one transport, a table of connections and the callbacks they report to.
///
/// Callbacks run on listener threads, on connection threads or on the executor, and must not
/// block for long. Dropping a running host stops it.
pub struct Host {
    core: Arc<HostCore>,
}

impl Host {
    pub fn builder(role: Role) -> HostBuilder {
        HostBuilder {
            role,
            config: Default::default(),
            stats: None,
            executor: None,
        }
    }

    /// Equivalent to `Host::builder(role).config(config).build()`.
    pub fn new(role: Role, config: Config) -> Result<Self> {
        Self::builder(role).config(config).build()
    }

    /// Spawns the listener threads over `transport`.
    pub fn start(&self, transport: Arc<dyn Transport>) -> Result<()> {
        self.core.start(transport)
    }

    /// Binds a UDP socket at the provided address and starts listening on it.
    pub fn bind<A>(&self, bind_addr: A) -> Result<()>
    where
        A: ToSocketAddrs,
    {
        self.start(Arc::new(UdpTransport::bind(bind_addr)?))
    }

    /// Stops listening and tears down every connection without invoking disconnect callbacks.
    /// Blocks until every listener and connection thread has exited.
    pub fn stop(&self) -> Result<()> {
        self.core.shutdown()
    }

    pub fn is_running(&self) -> bool {
        self.core.running.load(Ordering::Acquire)
    }

    /// Initiates a connection to `addr`, carrying `payload` in the handshake. The connect
    /// callback fires once the remote host accepts. If a connection to `addr` already exists, its
    /// handle is returned instead.
    pub fn connect(&self, addr: SocketAddr, payload: &[u8]) -> Result<Peer> {
        self.core.connect(addr, payload)
    }

    /// Returns the handle of the connection to `addr`, if any.
    pub fn peer(&self, addr: &SocketAddr) -> Option<Peer> {
        let key = self.core.addr_hasher.hash(addr);
        let conn = self.core.lookup(key)?;
        Some(self.core.peer_handle(&conn))
    }

    pub fn connection_count(&self) -> usize {
        self.core.connections.read().len()
    }

    /// Returns the local address of the transport.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        match &*self.core.transport.read() {
            Some(transport) => Ok(transport.local_addr()?),
            None => Err(Error::NotRunning),
        }
    }

    pub fn stats(&self) -> &Stats {
        &self.core.stats
    }

    pub fn config(&self) -> &Config {
        &self.core.config
    }

    pub fn role(&self) -> Role {
        self.core.role
    }

    pub(crate) fn deferred_stop(&self) -> DeferredStop {
        DeferredStop {
            host: Arc::downgrade(&self.core),
        }
    }

    /// Called once per connection when the handshake completes, with the remote handshake
    /// payload.
    pub fn on_connect<F>(&self, callback: F)
    where
        F: Fn(&Peer, &[u8]) + Send + Sync + 'static,
    {
        self.core.callbacks.write().connect = Some(Arc::new(callback));
    }

    /// Called once per connection when it is torn down, except during [`Host::stop`].
    pub fn on_disconnect<F>(&self, callback: F)
    where
        F: Fn(&Peer, &[u8]) + Send + Sync + 'static,
    {
        self.core.callbacks.write().disconnect = Some(Arc::new(callback));
    }

    /// Called before the disconnect callback when a connection goes quiet or its ping exceeds the
    /// configured maximum.
    pub fn on_timeout<F>(&self, callback: F)
    where
        F: Fn(&Peer) + Send + Sync + 'static,
    {
        self.core.callbacks.write().timeout = Some(Arc::new(callback));
    }

    /// Decides whether an inbound connect from an unknown address is accepted.
    pub fn on_validate<F>(&self, callback: F)
    where
        F: Fn(&SocketAddr, &[u8]) -> bool + Send + Sync + 'static,
    {
        self.core.callbacks.write().validate = Some(Arc::new(callback));
    }

    /// Called for every non-empty application payload, in delivery order.
    pub fn on_receive<F>(&self, callback: F)
    where
        F: Fn(&Peer, &[u8], Channel) + Send + Sync + 'static,
    {
        self.core.callbacks.write().receive = Some(Arc::new(callback));
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        let _ = self.core.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_validates_config() {
        let mut config = Config::default();
        config.listener_count = 0;

        assert!(matches!(
            Host::new(Role::Server, config),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn default_validation_by_role() {
        let server = Host::new(Role::Server, Config::default()).unwrap();
        let client = Host::new(Role::Client, Config::default()).unwrap();
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();

        assert!(server.core.validate(&addr, b""));
        assert!(!client.core.validate(&addr, b""));

        client.on_validate(|_, payload| payload == b"let me in");
        assert!(client.core.validate(&addr, b"let me in"));
        assert!(!client.core.validate(&addr, b"hello"));
    }

    #[test]
    fn not_running() {
        let host = Host::new(Role::Client, Config::default()).unwrap();
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();

        assert!(!host.is_running());
        assert!(matches!(host.stop(), Err(Error::NotRunning)));
        assert!(matches!(host.connect(addr, b""), Err(Error::NotRunning)));
        assert!(matches!(host.local_addr(), Err(Error::NotRunning)));
    }

    #[test]
    fn start_stop() {
        let host = Host::new(Role::Server, Config::default()).unwrap();

        host.bind("127.0.0.1:0").unwrap();
        assert!(host.is_running());
        assert!(host.local_addr().unwrap().port() != 0);
        assert!(matches!(
            host.bind("127.0.0.1:0"),
            Err(Error::AlreadyRunning)
        ));

        host.stop().unwrap();
        assert!(!host.is_running());
        assert_eq!(host.stats().snapshot().running_workers, 0);
    }
}
