pub mod cc;
mod store;

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::panic;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::buffer::{Chain, DropQueue, Ledger, Operation, SequenceWindow};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::frame::{serial, Descriptor, Packet};
use crate::seq::{sequence_difference, sequence_greater_than};
use crate::{Channel, Stats};

pub use store::Store;

/// Services a connection requires from the host that owns it.
pub trait HostContext: Send + Sync {
    // Milliseconds since an arbitrary, fixed point
    fn time_now_ms(&self) -> u64;

    // Called to send a datagram to the remote host
    fn send_frame(&self, frame_bytes: &[u8], addr: &SocketAddr);

    // Called when a packet with a non-empty payload is ready for the application
    fn on_receive(&self, conn: &Arc<Connection>, payload: &[u8], channel: Channel);

    // Called from the duty cycle when the remote host has gone quiet or its ping is too high.
    // The connection cannot tear itself down from its own thread.
    fn on_inactive(&self, conn: &Arc<Connection>);

    fn stats(&self) -> &Stats;
}

/// Lifecycle of a [`Connection`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Disconnected,
    Connecting,
    Connected,
}

impl State {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => State::Connecting,
            2 => State::Connected,
            _ => State::Disconnected,
        }
    }
}

#[derive(Debug, Default)]
struct Sequences {
    // Reliable stream
    local: u16,
    remote: u16,
    ack_bits: u32,
    local_order: u8,
    // Unreliable-ordered stream; unset until the first packet is accepted
    local_unreliable: u16,
    remote_unreliable: Option<u16>,
}

/// Per-peer protocol state. Inbound datagrams are processed on the calling listener thread;
/// outbound traffic, resends, acks and liveness checks run on the connection's own thread.
pub struct Connection {
    // Saved configuration
    config: Arc<Config>,
    state: AtomicU8,
    addr: RwLock<SocketAddr>,

    sequences: Mutex<Sequences>,
    window: Mutex<SequenceWindow>,
    chain: Mutex<Chain>,
    ledger: Mutex<Ledger>,
    cc: Mutex<cc::CongestionController>,
    queue: Mutex<DropQueue<Packet>>,
    // Serializes reliable-ordered delivery without holding the chain lock during callbacks
    delivery: Mutex<()>,

    last_ack_sent_ms: AtomicU64,
    last_resend_ms: AtomicU64,
    last_received_ms: AtomicU64,
    last_chain_ms: AtomicU64,
    ping_interval: AtomicU8,
    timeout_scheduled: AtomicBool,

    running: AtomicBool,
    thread: Mutex<Option<thread::JoinHandle<()>>>,

    store: Store,
}

fn unspecified_addr() -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))
}

fn elapsed(now_ms: u64, since: &AtomicU64) -> u64 {
    now_ms.saturating_sub(since.load(Ordering::Relaxed))
}

impl Connection {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            state: AtomicU8::new(State::Disconnected as u8),
            addr: RwLock::new(unspecified_addr()),
            sequences: Default::default(),
            window: Mutex::new(SequenceWindow::new(config.sequence_window_size)),
            chain: Mutex::new(Chain::new(config.chain_length_max)),
            ledger: Mutex::new(Ledger::new()),
            cc: Mutex::new(cc::CongestionController::new(&config, 0)),
            queue: Mutex::new(DropQueue::new(config.send_queue_max)),
            delivery: Mutex::new(()),
            last_ack_sent_ms: AtomicU64::new(0),
            last_resend_ms: AtomicU64::new(0),
            last_received_ms: AtomicU64::new(0),
            last_chain_ms: AtomicU64::new(0),
            ping_interval: AtomicU8::new(0),
            timeout_scheduled: AtomicBool::new(false),
            running: AtomicBool::new(false),
            thread: Mutex::new(None),
            store: Store::new(),
            config,
        }
    }

    /// Prepares a fresh or recycled connection for `addr`.
    pub fn init(&self, addr: SocketAddr, now_ms: u64) {
        *self.addr.write() = addr;

        self.last_ack_sent_ms.store(now_ms, Ordering::Relaxed);
        self.last_resend_ms.store(now_ms, Ordering::Relaxed);
        self.last_received_ms.store(now_ms, Ordering::Relaxed);
        self.last_chain_ms.store(now_ms, Ordering::Relaxed);
        self.cc.lock().reset(now_ms);

        self.state.store(State::Connecting as u8, Ordering::Release);
    }

    /// Returns every counter, buffer and timestamp to its initial value.
    pub fn reset(&self) {
        self.state.store(State::Disconnected as u8, Ordering::Release);
        *self.addr.write() = unspecified_addr();

        *self.sequences.lock() = Default::default();
        self.window.lock().reset();
        self.chain.lock().reset();
        self.ledger.lock().reset();
        self.cc.lock().reset(0);
        self.queue.lock().clear();

        self.last_ack_sent_ms.store(0, Ordering::Relaxed);
        self.last_resend_ms.store(0, Ordering::Relaxed);
        self.last_received_ms.store(0, Ordering::Relaxed);
        self.last_chain_ms.store(0, Ordering::Relaxed);
        self.ping_interval.store(0, Ordering::Relaxed);
        self.timeout_scheduled.store(false, Ordering::Relaxed);

        self.running.store(false, Ordering::Release);
        *self.thread.lock() = None;

        self.store.clear();
    }

    pub fn addr(&self) -> SocketAddr {
        *self.addr.read()
    }

    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Moves Connecting -> Connected. Returns true for exactly one caller.
    pub fn try_establish(&self) -> bool {
        self.state
            .compare_exchange(
                State::Connecting as u8,
                State::Connected as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Moves any live state to Disconnected. Returns true for exactly one caller.
    pub fn try_close(&self) -> bool {
        self.state.swap(State::Disconnected as u8, Ordering::AcqRel) != State::Disconnected as u8
    }

    pub fn ping_ms(&self) -> u64 {
        self.cc.lock().ping_ms()
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Queues an application payload on the given channel.
    pub fn send(&self, channel: Channel, payload: &[u8]) -> Result<()> {
        if self.state() == State::Disconnected {
            return Err(Error::Disconnected);
        }

        let descriptor = channel.descriptor();
        self.check_size(descriptor, payload)?;
        self.enqueue(Packet::new(descriptor, payload.into()));

        Ok(())
    }

    fn check_size(&self, descriptor: Descriptor, payload: &[u8]) -> Result<()> {
        let header_size = serial::header_size(descriptor);

        if header_size + payload.len() > self.config.mtu {
            return Err(Error::PayloadTooLarge {
                size: payload.len(),
                max: self.config.mtu - header_size,
            });
        }

        Ok(())
    }

    /// Queues the handshake packet carrying `payload`.
    pub(crate) fn enqueue_connect(&self, payload: &[u8]) -> Result<()> {
        let descriptor = Descriptor::RELIABLE | Descriptor::CONNECT;
        self.check_size(descriptor, payload)?;
        self.enqueue(Packet::new(descriptor, payload.into()));
        Ok(())
    }

    /// Sends DISCONNECT `count` times immediately, bypassing the queue.
    pub(crate) fn send_disconnect<C>(&self, payload: &[u8], count: usize, ctx: &C)
    where
        C: HostContext + ?Sized,
    {
        let descriptor = Descriptor::DISCONNECT;
        let payload: Box<[u8]> = if self.check_size(descriptor, payload).is_ok() {
            payload.into()
        } else {
            Box::new([])
        };

        for _ in 0..count {
            self.process_send(Packet::new(descriptor, payload.clone()), false, ctx);
        }
    }

    fn enqueue(&self, packet: Packet) {
        if self.queue.lock().push(packet).is_some() {
            tracing::trace!(addr = %self.addr(), "send queue full, dropped oldest packet");
        }
    }

    /// Runs the receive pipeline over a datagram that has passed header validation.
    pub fn receive<C>(self: &Arc<Self>, frame_bytes: &[u8], ctx: &C)
    where
        C: HostContext + ?Sized,
    {
        let now_ms = ctx.time_now_ms();
        self.last_received_ms.store(now_ms, Ordering::Relaxed);

        let packet = match serial::decode(frame_bytes) {
            Some(packet) => packet,
            None => return,
        };

        if packet.flag(Descriptor::RELIABLE) && !self.handle_reliable(&packet) {
            tracing::trace!(addr = %self.addr(), seq = packet.sequence, "duplicate reliable packet");
            return;
        }

        if packet.flag(Descriptor::ACK) {
            self.handle_ack(&packet, now_ms);
        }

        if packet.flag(Descriptor::ORDERED) {
            if packet.flag(Descriptor::RELIABLE) {
                self.handle_reliable_ordered(packet, now_ms, ctx);
            } else if self.accept_unreliable_ordered(&packet) {
                self.deliver(&packet, ctx);
            } else {
                tracing::trace!(addr = %self.addr(), seq = packet.sequence, "stale unreliable-ordered packet");
            }
            return;
        }

        self.deliver(&packet, ctx);
    }

    fn handle_reliable(&self, packet: &Packet) -> bool {
        let sequence = packet.sequence;
        let ref mut window = *self.window.lock();

        if window.get(sequence) {
            return false;
        }

        window.set(sequence, true);

        {
            let ref mut seqs = *self.sequences.lock();

            // A jump beyond the skip budget would leave the ack window mostly empty
            if sequence_greater_than(sequence, seqs.remote)
                && sequence_difference(sequence, seqs.remote) <= self.config.skipped_packets_max
            {
                seqs.remote = sequence;
            }

            seqs.ack_bits = window.ack_bits(seqs.remote);
        }

        self.enqueue(Packet::new(Descriptor::ACK, Box::new([])));

        true
    }

    fn handle_ack(&self, packet: &Packet, now_ms: u64) {
        let mut samples = Vec::new();

        {
            let ref mut ledger = *self.ledger.lock();

            for i in 0..=32u16 {
                if i == 0 || packet.ack_bits & (1 << (i - 1)) != 0 {
                    if let Some(entry) = ledger.retrieve(packet.ack.wrapping_sub(i)) {
                        if !entry.no_rtt {
                            samples.push(entry.send_time_ms);
                        }
                    }
                }
            }
        }

        if !samples.is_empty() {
            let ref mut cc = *self.cc.lock();
            let before = cc.mode();

            for send_time_ms in samples {
                cc.check(send_time_ms, now_ms);
            }

            if cc.mode() != before {
                tracing::debug!(addr = %self.addr(), mode = ?cc.mode(), rtt_ms = cc.rtt_ms(), "congestion mode changed");
            }
        }
    }

    fn handle_reliable_ordered<C>(self: &Arc<Self>, packet: Packet, now_ms: u64, ctx: &C)
    where
        C: HostContext + ?Sized,
    {
        let _delivery = self.delivery.lock();

        let popped = {
            let ref mut chain = *self.chain.lock();
            let was_empty = chain.is_empty();

            if !chain.insert(packet) {
                return;
            }

            let popped = chain.pop_consecutive();

            // A new gap gets the full stall timeout
            if was_empty || !popped.is_empty() || chain.is_empty() {
                self.last_chain_ms.store(now_ms, Ordering::Relaxed);
            }

            popped
        };

        for p in popped.iter() {
            self.deliver(p, ctx);
        }
    }

    fn accept_unreliable_ordered(&self, packet: &Packet) -> bool {
        let ref mut seqs = *self.sequences.lock();

        let newer = match seqs.remote_unreliable {
            Some(remote) => sequence_greater_than(packet.sequence, remote),
            None => true,
        };

        if newer {
            seqs.remote_unreliable = Some(packet.sequence);
        }

        newer
    }

    fn deliver<C>(self: &Arc<Self>, packet: &Packet, ctx: &C)
    where
        C: HostContext + ?Sized,
    {
        // Handshake and teardown payloads are reported through their own callbacks
        if packet.payload.is_empty()
            || packet
                .descriptor
                .intersects(Descriptor::CONNECT | Descriptor::DISCONNECT)
        {
            return;
        }

        ctx.on_receive(self, &packet.payload, Channel::from_descriptor(packet.descriptor));
    }

    fn process_send<C>(&self, mut packet: Packet, resend: bool, ctx: &C)
    where
        C: HostContext + ?Sized,
    {
        if !packet.flag(Descriptor::RELIABLE) && self.cc.lock().should_drop_unreliable() {
            tracing::trace!(addr = %self.addr(), "shed unreliable packet");
            return;
        }

        let now_ms = ctx.time_now_ms();

        packet.protocol_id = self.config.protocol_id;

        if !resend {
            let ref mut seqs = *self.sequences.lock();

            if packet.flag(Descriptor::RELIABLE) {
                packet.sequence = seqs.local;
                seqs.local = seqs.local.wrapping_add(1);

                if packet.flag(Descriptor::ORDERED) {
                    packet.order = seqs.local_order;
                    seqs.local_order = seqs.local_order.wrapping_add(1);
                }

                let no_rtt = self.state() != State::Connected;
                self.ledger.lock().add(packet.clone(), no_rtt, now_ms);
            } else if packet.flag(Descriptor::ORDERED) {
                packet.sequence = seqs.local_unreliable;
                seqs.local_unreliable = seqs.local_unreliable.wrapping_add(1);
            }
        }

        if packet.flag(Descriptor::ACK) {
            let ref seqs = *self.sequences.lock();
            packet.ack = seqs.remote;
            packet.ack_bits = seqs.ack_bits;
            self.last_ack_sent_ms.store(now_ms, Ordering::Relaxed);
        }

        let frame_bytes = serial::encode(&mut packet);

        ctx.send_frame(&frame_bytes, &self.addr());
        ctx.stats().add_sent_bytes(frame_bytes.len());
    }

    /// One pass of the duty cycle. Returns true if the outbound queue was empty.
    pub fn update<C>(self: &Arc<Self>, ctx: &C) -> bool
    where
        C: HostContext + ?Sized,
    {
        let next = self.queue.lock().pop();
        let idle = next.is_none();

        if let Some(packet) = next {
            self.process_send(packet, false, ctx);
        }

        let now_ms = ctx.time_now_ms();

        self.resend_scan(now_ms, ctx);

        if self.state() == State::Connected {
            if elapsed(now_ms, &self.last_chain_ms) > self.config.chain_skip_timeout_ms {
                self.skip_chain(now_ms, ctx);
            }

            let reack_timeout_ms = self.cc.lock().reack_timeout_ms();

            if elapsed(now_ms, &self.last_ack_sent_ms) > reack_timeout_ms {
                self.process_send(Packet::new(Descriptor::ACK, Box::new([])), false, ctx);

                let interval = self.ping_interval.load(Ordering::Relaxed);

                if interval % self.config.auto_ping_interval == 0 {
                    let descriptor = Descriptor::RELIABLE | Descriptor::ACK;
                    self.process_send(Packet::new(descriptor, Box::new([])), false, ctx);
                    self.ping_interval.store(1, Ordering::Relaxed);
                } else {
                    self.ping_interval.store(interval.wrapping_add(1), Ordering::Relaxed);
                }
            }
        }

        self.check_alive(now_ms, ctx);

        idle
    }

    fn resend_scan<C>(&self, now_ms: u64, ctx: &C)
    where
        C: HostContext + ?Sized,
    {
        let (resend_timeout_ms, resends_max) = {
            let ref cc = *self.cc.lock();
            (cc.resend_timeout_ms(), cc.resends_max())
        };

        if elapsed(now_ms, &self.last_resend_ms) <= resend_timeout_ms {
            return;
        }

        self.last_resend_ms.store(now_ms, Ordering::Relaxed);

        let remove_timeout_ms = self.config.send_remove_timeout_ms;
        let mut resend = Vec::new();

        self.ledger.lock().iterate(|i, entry| {
            if i as u64 >= resends_max {
                return Operation::Cancel;
            }

            if now_ms.saturating_sub(entry.send_time_ms) > remove_timeout_ms {
                return Operation::Delete;
            }

            resend.push(entry.packet.clone());
            Operation::Continue
        });

        for packet in resend {
            self.process_send(packet, true, ctx);
        }
    }

    fn skip_chain<C>(self: &Arc<Self>, now_ms: u64, ctx: &C)
    where
        C: HostContext + ?Sized,
    {
        // A listener thread is delivering; try again next pass
        let _delivery = match self.delivery.try_lock() {
            Some(guard) => guard,
            None => return,
        };

        let popped = {
            let ref mut chain = *self.chain.lock();
            chain.skip();
            chain.pop_consecutive()
        };

        self.last_chain_ms.store(now_ms, Ordering::Relaxed);

        if !popped.is_empty() {
            tracing::debug!(addr = %self.addr(), count = popped.len(), "reorder stall, skipped gap");
        }

        for p in popped.iter() {
            self.deliver(p, ctx);
        }
    }

    fn check_alive<C>(self: &Arc<Self>, now_ms: u64, ctx: &C)
    where
        C: HostContext + ?Sized,
    {
        if self.state() == State::Disconnected {
            return;
        }

        let silent = elapsed(now_ms, &self.last_received_ms) > self.config.timeout_threshold_ms;
        let lagging = self.ping_ms() > self.config.ping_max_ms;

        if (silent || lagging) && !self.timeout_scheduled.swap(true, Ordering::AcqRel) {
            tracing::debug!(addr = %self.addr(), silent, lagging, "connection inactive");
            ctx.on_inactive(self);
        }
    }

    /// Spawns the duty-cycle thread.
    pub fn start<C>(self: &Arc<Self>, ctx: Arc<C>) -> Result<()>
    where
        C: HostContext + 'static,
    {
        self.running.store(true, Ordering::Release);

        let conn = Arc::clone(self);

        let handle = thread::Builder::new()
            .name("kestrel-conn".into())
            .spawn(move || conn.run(&*ctx));

        match handle {
            Ok(handle) => {
                *self.thread.lock() = Some(handle);
                Ok(())
            }
            Err(err) => {
                self.running.store(false, Ordering::Release);
                Err(err.into())
            }
        }
    }

    fn run<C>(self: &Arc<Self>, ctx: &C)
    where
        C: HostContext + ?Sized,
    {
        let idle_sleep = Duration::from_millis(self.config.update_loop_timeout_ms);

        ctx.stats().worker_started();

        while self.running.load(Ordering::Acquire) {
            match panic::catch_unwind(panic::AssertUnwindSafe(|| self.update(ctx))) {
                Ok(false) => (),
                Ok(true) => thread::sleep(idle_sleep),
                Err(_) => {
                    ctx.stats().panic_caught();
                    tracing::error!(addr = %self.addr(), "connection duty cycle panicked");
                    thread::sleep(idle_sleep);
                }
            }
        }

        ctx.stats().worker_stopped();
    }

    /// Stops the duty cycle, waiting for it to exit unless called from the duty cycle itself.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);

        let handle = self.thread.lock().take();

        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}
