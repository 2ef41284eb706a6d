//! Message routing over one shared connection.
//!
//! There is no dedicated reader thread by default. A thread that needs a
//! message calls [`MessageRouter::wait_with`], which:
//!
//! 1. checks the caller's mailbox and returns a buffered match at once;
//! 2. otherwise tries to take the [`ThreadGate`];
//! 3. as the owner, reads exactly one packet, dispatches it to the global
//!    store, a channel or a handler, then releases the gate and wakes
//!    every waiter. An owner whose deadline passes before the next packet
//!    starts gives up without touching the stream;
//! 4. as a non-owner, sleeps until the gate is released and starts over.
//!
//! [`MessageRouter::start_pump`] switches to a single background thread
//! that owns the gate for good; callers then only ever sleep.
//!
//! Any fatal error tears the whole connection down once: DISCONNECT is
//! sent when a reason applies, the stream is shut, every channel is
//! marked closed, shutdown hooks run, and every waiter sees the same error.

mod gate;
mod store;

pub use gate::{GateGuard, ThreadGate};
pub use store::MessageStore;

use crate::channel::messages::{
    ChannelOpen, ChannelOpenConfirmation, ChannelOpenFailure, OPEN_RESOURCE_SHORTAGE,
    OPEN_UNKNOWN_CHANNEL_TYPE,
};
use crate::channel::{ChannelCore, ChannelFactory, ChannelKind, DataWindow, OpenDecision};
use crate::config::SshClientConfig;
use crate::kex::{KexState, KexTransport, KeyExchangeCoordinator, RekeyLimits};
use crate::lock;
use crate::message::{
    is_channel_specific, is_key_exchange, request_failure_payload, request_success_payload,
    unimplemented_payload, DebugMessage, Disconnect, GlobalRequest, Message, MessageType,
};
use crate::outbound::Outbound;
use crate::packet::PacketReader;
use crate::pipeline::CipherPipeline;
use crate::transport::ShutdownHandle;
use bytes::Bytes;
use fynx_platform::{FynxError, FynxResult};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Answers a peer's global request: `Some(data)` for success, `None` for
/// failure.
pub type GlobalRequestHandler = Arc<dyn Fn(&GlobalRequest) -> Option<Vec<u8>> + Send + Sync>;

/// Called once when the connection terminates, with the terminating error.
pub type ShutdownHook = Arc<dyn Fn(&FynxError) + Send + Sync>;

/// Limits applied to every channel on the connection.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ChannelDefaults {
    pub(crate) max_channels: usize,
    pub(crate) window_size: u32,
    pub(crate) max_packet_size: u32,
    pub(crate) request_timeout: Option<Duration>,
    pub(crate) close_grace_period: Duration,
}

/// Fixed-size channel slot table. A channel's local id is its slot index.
#[derive(Default)]
struct ChannelTable {
    slots: Vec<Option<Arc<ChannelCore>>>,
}

impl ChannelTable {
    fn get(&self, id: u32) -> Option<Arc<ChannelCore>> {
        self.slots.get(id as usize).and_then(|slot| slot.clone())
    }

    fn free_slot(&mut self, capacity: usize) -> Option<u32> {
        match self.slots.iter().position(Option::is_none) {
            Some(index) => Some(index as u32),
            None if self.slots.len() < capacity => {
                self.slots.push(None);
                Some((self.slots.len() - 1) as u32)
            }
            None => None,
        }
    }

    /// Removes `core` if it still occupies its slot.
    fn remove(&mut self, core: &Arc<ChannelCore>) -> bool {
        match self.slots.get_mut(core.local_id as usize) {
            Some(slot) if slot.as_ref().map_or(false, |c| Arc::ptr_eq(c, core)) => {
                *slot = None;
                true
            }
            _ => false,
        }
    }

    fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

/// [`KexTransport`] backed by the router's reader and writer.
struct KexLink<'a> {
    reader: Option<&'a mut PacketReader>,
    outbound: &'a Outbound,
}

impl KexTransport for KexLink<'_> {
    fn send_payload(&mut self, payload: &[u8]) -> FynxResult<()> {
        self.outbound.send_transport(payload)
    }

    fn hold_outbound(&mut self) {
        self.outbound.hold();
    }

    fn switch_outbound(&mut self, pipeline: CipherPipeline) -> FynxResult<()> {
        self.outbound.switch_keys(pipeline)
    }

    fn switch_inbound(&mut self, pipeline: CipherPipeline) -> FynxResult<()> {
        match self.reader.as_deref_mut() {
            Some(reader) => {
                reader.install(pipeline);
                debug!(cipher = reader.pipeline().cipher_name(), "Inbound keys installed");
                Ok(())
            }
            None => Err(FynxError::Protocol(
                "NEWKEYS processed outside the reading thread".to_string(),
            )),
        }
    }

    fn release_outbound(&mut self) -> FynxResult<()> {
        self.outbound.release()
    }
}

/// Demultiplexes one connection among many waiting threads.
pub struct MessageRouter {
    reader: Mutex<PacketReader>,
    outbound: Outbound,
    kex: KeyExchangeCoordinator,
    rekey_limits: RekeyLimits,
    gate: ThreadGate,
    global: MessageStore,
    channels: Mutex<ChannelTable>,
    defaults: ChannelDefaults,
    incoming: Mutex<VecDeque<Arc<ChannelCore>>>,
    factories: Mutex<HashMap<String, ChannelFactory>>,
    global_handlers: Mutex<HashMap<String, GlobalRequestHandler>>,
    /// Serializes our global requests; holds the count of replies still
    /// owed to requests that timed out.
    global_requests: Mutex<usize>,
    shutdown_hooks: Mutex<Vec<ShutdownHook>>,
    shutdown: ShutdownHandle,
    terminal: Mutex<Option<FynxError>>,
    pumping: AtomicBool,
}

impl std::fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRouter")
            .field("kex", &self.kex)
            .field("outbound", &self.outbound)
            .field("channels", &self.channel_count())
            .field("terminal", &*lock(&self.terminal))
            .field("pumping", &self.pumping.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl MessageRouter {
    /// Creates a router over an identified but not yet keyed connection.
    pub fn new(
        reader: PacketReader,
        outbound: Outbound,
        kex: KeyExchangeCoordinator,
        config: &SshClientConfig,
        shutdown: ShutdownHandle,
    ) -> Self {
        Self {
            reader: Mutex::new(reader),
            outbound,
            kex,
            rekey_limits: config.rekey_limits,
            gate: ThreadGate::new(),
            global: MessageStore::new(),
            channels: Mutex::new(ChannelTable::default()),
            defaults: ChannelDefaults {
                max_channels: config.max_channels,
                window_size: config.window_size,
                max_packet_size: config.max_packet_size,
                request_timeout: config.request_timeout,
                close_grace_period: config.close_grace_period,
            },
            incoming: Mutex::new(VecDeque::new()),
            factories: Mutex::new(HashMap::new()),
            global_handlers: Mutex::new(HashMap::new()),
            global_requests: Mutex::new(0),
            shutdown_hooks: Mutex::new(Vec::new()),
            shutdown,
            terminal: Mutex::new(None),
            pumping: AtomicBool::new(false),
        }
    }

    /// The key exchange coordinator.
    pub fn kex(&self) -> &KeyExchangeCoordinator {
        &self.kex
    }

    /// The read gate.
    pub fn gate(&self) -> &ThreadGate {
        &self.gate
    }

    pub(crate) fn defaults(&self) -> ChannelDefaults {
        self.defaults
    }

    /// The error that terminated the connection, if any.
    pub fn terminal_error(&self) -> Option<FynxError> {
        lock(&self.terminal).clone()
    }

    /// Returns true once the connection has terminated.
    pub fn is_closed(&self) -> bool {
        lock(&self.terminal).is_some()
    }

    fn check_alive(&self) -> FynxResult<()> {
        match &*lock(&self.terminal) {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    /// Blocks until `poll` yields a value.
    ///
    /// `poll` runs before every read and after every message any thread
    /// dispatches. It must only inspect state (mailboxes, channel state);
    /// an error it returns is handed back as is.
    ///
    /// # Errors
    ///
    /// - [`FynxError::Timeout`] once `deadline` passes; nothing shared is
    ///   disturbed
    /// - the connection's terminal error if it has failed
    pub fn wait_with<T, F>(&self, deadline: Option<Instant>, mut poll: F) -> FynxResult<T>
    where
        F: FnMut() -> FynxResult<Option<T>>,
    {
        loop {
            let seen = self.gate.generation();
            if let Some(value) = poll()? {
                return Ok(value);
            }
            self.check_alive()?;
            if self.gate.is_abandoned() {
                return Err(self.abort(FynxError::UnexpectedTermination(
                    "A reading thread panicked mid-dispatch".to_string(),
                )));
            }
            if deadline.map_or(false, |d| Instant::now() >= d) {
                return Err(FynxError::Timeout("No matching message in time".to_string()));
            }

            if let Some(_guard) = self.gate.try_acquire() {
                match self.read_one(deadline) {
                    Ok(true) => continue,
                    Ok(false) => {
                        return Err(FynxError::Timeout("No matching message in time".to_string()))
                    }
                    Err(e) => return Err(self.abort(e)),
                }
            }

            if !self.gate.wait(seen, deadline) {
                return Err(FynxError::Timeout("No matching message in time".to_string()));
            }
        }
    }

    /// Waits for the next message in the global store matching
    /// `predicate`.
    pub fn next_global<F>(&self, predicate: F, deadline: Option<Instant>) -> FynxResult<Message>
    where
        F: Fn(&Message) -> bool,
    {
        self.wait_with(deadline, || Ok(self.global.take_matching(&predicate)))
    }

    /// Sends a payload, queueing it while a key exchange holds outbound
    /// traffic. Starts a rekey once the outbound pipeline reaches a limit.
    ///
    /// If the queue is already full the caller waits, reading on behalf of
    /// the exchange, until the new keys release it. Must not be called by
    /// the thread that owns the gate.
    pub fn send(&self, payload: &[u8]) -> FynxResult<()> {
        let type_byte = payload.first().copied().unwrap_or(0);
        if self.outbound.is_queue_full(type_byte) {
            debug!(type_byte, "Outbound queue full; waiting for key exchange");
            let deadline = self.defaults.request_timeout.map(|t| Instant::now() + t);
            self.wait_with(deadline, || {
                Ok((!self.outbound.is_queue_full(type_byte)).then_some(()))
            })?;
        }
        self.write(payload)?;
        if self.outbound.rekey_due(&self.rekey_limits) {
            self.request_rekey()?;
        }
        Ok(())
    }

    fn write(&self, payload: &[u8]) -> FynxResult<()> {
        self.check_alive()?;
        trace!(type_byte = payload.first().copied(), len = payload.len(), "Sending");
        self.outbound.send(payload).map_err(|e| self.abort(e))
    }

    /// Sends our KEXINIT unless an exchange is already running.
    ///
    /// Returns true if a new exchange was started.
    pub fn start_key_exchange(&self) -> FynxResult<bool> {
        self.check_alive()?;
        let mut link = KexLink {
            reader: None,
            outbound: &self.outbound,
        };
        self.kex.initiate(&mut link).map_err(|e| self.abort(e))
    }

    fn request_rekey(&self) -> FynxResult<()> {
        if self.kex.state() != KexState::Keyed {
            return Ok(());
        }
        if self.start_key_exchange()? {
            info!(exchanges = self.kex.completed(), "Rekey threshold reached");
        }
        Ok(())
    }

    /// Reads and dispatches one message. Caller must own the gate.
    ///
    /// Returns false if no packet started arriving before `deadline`.
    fn read_one(&self, deadline: Option<Instant>) -> FynxResult<bool> {
        let mut reader = lock(&self.reader);
        if !reader.wait_readable(deadline)? {
            return Ok(false);
        }
        let packet = reader.read_packet()?;
        let msg = Message::parse(packet.payload, packet.sequence)?;
        debug!(msg = %msg, sequence = msg.sequence(), "Received");

        if is_key_exchange(msg.type_byte()) {
            let mut link = KexLink {
                reader: Some(&mut *reader),
                outbound: &self.outbound,
            };
            return self.kex.handle(&msg, &mut link).map(|_| true);
        }

        if msg.is(MessageType::UserauthSuccess) {
            let inbound = reader.pipeline_mut().enable_delayed_compression();
            let outbound = self.outbound.enable_delayed_compression();
            if inbound || outbound {
                debug!("Delayed compression started");
            }
        }
        let rekey = reader.pipeline().rekey_due(&self.rekey_limits);
        drop(reader);

        if rekey {
            self.request_rekey()?;
        }
        self.dispatch(msg)?;
        self.sweep_expired();
        Ok(true)
    }

    fn dispatch(&self, msg: Message) -> FynxResult<()> {
        match msg.type_byte() {
            1 => {
                let disconnect = Disconnect::from_message(&msg)?;
                Err(FynxError::Disconnected {
                    reason_code: disconnect.reason_code,
                    description: disconnect.description,
                })
            }
            2 => Ok(()),
            3 => {
                warn!(sequence = ?msg.body().read_u32().ok(), "Peer did not implement a message we sent");
                Ok(())
            }
            4 => {
                let debug_msg = DebugMessage::from_message(&msg)?;
                debug!(always_display = debug_msg.always_display, text = %debug_msg.message, "Peer debug message");
                Ok(())
            }
            6 | 7 | 50..=79 | 81 | 82 => {
                self.global.push(msg);
                Ok(())
            }
            80 => self.on_global_request(&msg),
            90 => self.on_channel_open(&msg),
            t if is_channel_specific(t) => self.on_channel_message(msg),
            t => {
                debug!(type_byte = t, "Unimplemented message");
                self.write(&unimplemented_payload(msg.sequence()))
            }
        }
    }

    fn on_global_request(&self, msg: &Message) -> FynxResult<()> {
        let request = GlobalRequest::from_message(msg)?;
        let handler = lock(&self.global_handlers).get(&request.name).cloned();
        let reply = match handler {
            Some(handler) => handler(&request),
            None => {
                debug!(name = %request.name, "No handler for global request");
                None
            }
        };
        if !request.want_reply {
            return Ok(());
        }
        match reply {
            Some(data) => self.write(&request_success_payload(&data)),
            None => self.write(&request_failure_payload()),
        }
    }

    fn on_channel_open(&self, msg: &Message) -> FynxResult<()> {
        let open = ChannelOpen::from_message(msg)?;
        let reject = |reason_code: u32, description: &str| {
            self.write(
                &ChannelOpenFailure {
                    recipient_channel: open.sender_channel,
                    reason_code,
                    description: description.to_string(),
                }
                .to_bytes(),
            )
        };

        let factory = lock(&self.factories).get(&open.channel_type).cloned();
        let Some(factory) = factory else {
            warn!(channel_type = %open.channel_type, "Rejected channel open of unknown type");
            return reject(OPEN_UNKNOWN_CHANNEL_TYPE, "unknown channel type");
        };

        let kind = ChannelKind::from_open(&open.channel_type, &open.data)?;
        let handler = match factory(&kind) {
            OpenDecision::Accept(handler) => handler,
            OpenDecision::Reject {
                reason_code,
                description,
            } => {
                debug!(channel_type = %open.channel_type, reason_code, "Channel open refused");
                return reject(reason_code, &description);
            }
        };

        let defaults = self.defaults;
        let core = self.allocate(|local_id| {
            ChannelCore::accepted(
                local_id,
                kind,
                handler,
                DataWindow::new(defaults.window_size, defaults.max_packet_size),
                open.sender_channel,
                DataWindow::new(open.initial_window, open.max_packet),
            )
        });
        let core = match core {
            Ok(core) => core,
            Err(_) => return reject(OPEN_RESOURCE_SHORTAGE, "channel table full"),
        };

        self.write(
            &ChannelOpenConfirmation {
                recipient_channel: open.sender_channel,
                sender_channel: core.local_id,
                initial_window: defaults.window_size,
                max_packet: defaults.max_packet_size,
            }
            .to_bytes(),
        )?;
        info!(
            local_id = core.local_id,
            remote_id = open.sender_channel,
            channel_type = %open.channel_type,
            "Accepted channel"
        );
        core.notify_open();
        lock(&self.incoming).push_back(core);
        Ok(())
    }

    fn on_channel_message(&self, msg: Message) -> FynxResult<()> {
        let id = msg
            .channel()
            .ok_or_else(|| FynxError::Protocol(format!("{} has no channel id", msg)))?;
        let Some(core) = self.channel(id) else {
            warn!(channel = id, msg = %msg, "Dropped message for unknown channel");
            return Ok(());
        };

        let effects = core.on_inbound(msg)?;
        for reply in &effects.replies {
            self.write(reply)?;
        }
        if effects.release {
            self.release(&core);
        }
        Ok(())
    }

    /// Reserves the lowest free slot and creates a channel in it.
    ///
    /// Channels whose close grace period has run out are force-freed first.
    pub(crate) fn allocate<F>(&self, make: F) -> FynxResult<Arc<ChannelCore>>
    where
        F: FnOnce(u32) -> ChannelCore,
    {
        self.check_alive()?;
        self.sweep_expired();

        let mut table = lock(&self.channels);
        let id = table.free_slot(self.defaults.max_channels).ok_or_else(|| {
            FynxError::ResourceExhausted(format!(
                "All {} channel slots are in use",
                self.defaults.max_channels
            ))
        })?;
        let core = Arc::new(make(id));
        table.slots[id as usize] = Some(Arc::clone(&core));
        Ok(core)
    }

    /// Force-frees channels whose close grace period has run out. Runs on
    /// every allocation, after every inbound message and on the keep-alive
    /// tick.
    pub(crate) fn sweep_expired(&self) {
        let grace = self.defaults.close_grace_period;
        let mut expired = Vec::new();
        {
            let mut table = lock(&self.channels);
            for slot in table.slots.iter_mut() {
                if slot.as_ref().map_or(false, |core| core.close_expired(grace)) {
                    if let Some(core) = slot.take() {
                        warn!(local_id = core.local_id, "Force-freed channel; peer never confirmed close");
                        expired.push(core);
                    }
                }
            }
        }
        for core in expired {
            core.notify_released();
        }
    }

    /// Frees a channel's slot if it still holds it.
    pub(crate) fn release(&self, core: &Arc<ChannelCore>) {
        let removed = lock(&self.channels).remove(core);
        if removed {
            debug!(local_id = core.local_id, "Channel freed");
            core.notify_released();
        }
    }

    pub(crate) fn channel(&self, id: u32) -> Option<Arc<ChannelCore>> {
        lock(&self.channels).get(id)
    }

    /// Number of occupied channel slots.
    pub fn channel_count(&self) -> usize {
        lock(&self.channels).len()
    }

    /// Waits for a channel the peer opened and a factory accepted.
    pub(crate) fn accept(&self, deadline: Option<Instant>) -> FynxResult<Arc<ChannelCore>> {
        self.wait_with(deadline, || Ok(lock(&self.incoming).pop_front()))
    }

    /// Registers the factory consulted when the peer opens a channel of
    /// `channel_type`.
    pub fn register_channel_factory(&self, channel_type: &str, factory: ChannelFactory) {
        lock(&self.factories).insert(channel_type.to_string(), factory);
    }

    /// Registers the handler for peer global requests named `name`.
    pub fn register_global_handler(&self, name: &str, handler: GlobalRequestHandler) {
        lock(&self.global_handlers).insert(name.to_string(), handler);
    }

    /// Registers a hook run once at termination. Runs at once if the
    /// connection has already terminated.
    pub fn on_shutdown(&self, hook: ShutdownHook) {
        if let Some(err) = self.terminal_error() {
            hook(&err);
            return;
        }
        lock(&self.shutdown_hooks).push(hook);
    }

    /// Sends a global request with want-reply set and waits for the answer.
    ///
    /// Requests are serialized: replies carry no id and arrive in order, so
    /// a late reply to a timed-out request is skipped. Returns the response
    /// data on success, `None` on failure.
    pub fn global_request(
        &self,
        name: &str,
        data: &[u8],
        deadline: Option<Instant>,
    ) -> FynxResult<Option<Bytes>> {
        let mut orphaned = lock(&self.global_requests);
        let request = GlobalRequest {
            name: name.to_string(),
            want_reply: true,
            data: Bytes::copy_from_slice(data),
        };
        self.send(&request.to_bytes())?;

        let replied = |m: &Message| {
            m.is(MessageType::RequestSuccess) || m.is(MessageType::RequestFailure)
        };
        loop {
            let reply = match self.next_global(replied, deadline) {
                Ok(reply) => reply,
                Err(e) => {
                    if let FynxError::Timeout(_) = e {
                        *orphaned += 1;
                    }
                    return Err(e);
                }
            };
            if *orphaned > 0 {
                *orphaned -= 1;
                trace!(request = name, "Skipped reply to a timed-out global request");
                continue;
            }
            return Ok(reply
                .is(MessageType::RequestSuccess)
                .then(|| reply.payload().slice(1..)));
        }
    }

    /// Starts a background thread that owns the gate and reads
    /// continuously. Callers then only wait.
    pub fn start_pump(self: &Arc<Self>) -> FynxResult<JoinHandle<()>> {
        self.check_alive()?;
        if self.pumping.swap(true, Ordering::SeqCst) {
            return Err(FynxError::Config("Message pump already running".to_string()));
        }
        let router = Arc::clone(self);
        thread::Builder::new()
            .name("fynx-ssh-pump".to_string())
            .spawn(move || router.pump())
            .map_err(FynxError::from)
    }

    fn pump(&self) {
        let guard = loop {
            let seen = self.gate.generation();
            if self.is_closed() || self.gate.is_abandoned() {
                return;
            }
            if let Some(guard) = self.gate.try_acquire() {
                break guard;
            }
            self.gate.wait(seen, None);
        };
        info!("Message pump started");

        while !self.is_closed() {
            if let Err(e) = self.read_one(None) {
                self.abort(e);
                break;
            }
            self.gate.notify();
        }
        drop(guard);
        debug!("Message pump stopped");
    }

    /// Tears the connection down. The first error wins and is returned to
    /// every later caller.
    pub fn abort(&self, err: FynxError) -> FynxError {
        {
            let mut terminal = lock(&self.terminal);
            if let Some(first) = &*terminal {
                return first.clone();
            }
            *terminal = Some(err.clone());
        }

        match &err {
            FynxError::Disconnected { reason_code, description } => {
                info!(reason_code, description = %description, "Connection closed")
            }
            _ => error!(error = %err, "Connection failed"),
        }

        if let Some(reason_code) = err.disconnect_reason() {
            let disconnect = Disconnect {
                reason_code,
                description: err.to_string(),
            };
            if !self.outbound.try_send_transport(&disconnect.to_bytes()) {
                debug!("Could not send DISCONNECT");
            }
        }
        self.outbound.close();
        (self.shutdown)();

        let channels: Vec<_> = {
            let mut table = lock(&self.channels);
            table.slots.drain(..).flatten().collect()
        };
        for core in channels {
            core.mark_terminated();
            core.notify_released();
        }
        lock(&self.incoming).clear();

        let hooks = std::mem::take(&mut *lock(&self.shutdown_hooks));
        for hook in hooks {
            hook(&err);
        }
        self.gate.notify();
        err
    }
}
