//! SSH channels (RFC 4254 Section 5).
//!
//! A [`Channel`] is a handle onto one slot of the router's channel table.
//! Its state lives in a shared `ChannelCore` so that whichever thread reads
//! from the connection can apply flow control and lifecycle changes while
//! the handle's owner is blocked elsewhere.

pub mod kind;
pub mod messages;
pub mod window;

pub use kind::{ChannelHandler, ChannelKind};
pub use messages::{ChannelData, ChannelOpen, ChannelRequest, ExitSignal};
pub use window::DataWindow;

use crate::lock;
use crate::message::{Message, MessageType};
use crate::router::{MessageRouter, MessageStore};
use crate::wire::{write_string, Reader};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use fynx_platform::{FynxError, FynxResult};
use messages::{
    close_payload, data_payload, eof_payload, extended_data_payload, failure_payload,
    success_payload, window_adjust_bytes, window_adjust_payload, ChannelOpenConfirmation,
    ChannelOpenFailure, EXTENDED_DATA_STDERR,
};
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

/// Decides how to answer a peer's CHANNEL_OPEN.
pub type ChannelFactory = Arc<dyn Fn(&ChannelKind) -> OpenDecision + Send + Sync>;

/// A channel factory's answer.
pub enum OpenDecision {
    /// Open the channel, optionally with a handler for its messages.
    Accept(Option<Arc<dyn ChannelHandler>>),
    /// Refuse with a CHANNEL_OPEN_FAILURE.
    Reject {
        /// Reason code (see [`messages::OPEN_ADMINISTRATIVELY_PROHIBITED`])
        reason_code: u32,
        /// Human readable description
        description: String,
    },
}

impl std::fmt::Debug for OpenDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpenDecision::Accept(handler) => f
                .debug_tuple("Accept")
                .field(&handler.as_ref().map(|_| "handler"))
                .finish(),
            OpenDecision::Reject {
                reason_code,
                description,
            } => f
                .debug_struct("Reject")
                .field("reason_code", reason_code)
                .field("description", description)
                .finish(),
        }
    }
}

/// Channel lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelLifecycle {
    /// CHANNEL_OPEN sent, no answer yet
    Opening,
    /// Open in both directions
    Open,
    /// CLOSE sent or received
    Closed,
}

#[derive(Debug)]
struct ChannelState {
    remote_id: u32,
    lifecycle: ChannelLifecycle,
    local_window: DataWindow,
    remote_window: DataWindow,
    eof_sent: bool,
    eof_received: bool,
    close_sent: Option<Instant>,
    close_received: bool,
    open_abandoned: Option<Instant>,
    orphaned_replies: u32,
    exit_status: Option<u32>,
    exit_signal: Option<ExitSignal>,
    released: bool,
    terminated: bool,
}

/// What the router must do after a channel processed a message.
#[derive(Debug, Default)]
pub(crate) struct ChannelEffects {
    pub(crate) replies: Vec<Vec<u8>>,
    pub(crate) release: bool,
}

/// State shared between a [`Channel`] handle and the router.
pub(crate) struct ChannelCore {
    pub(crate) local_id: u32,
    kind: ChannelKind,
    state: Mutex<ChannelState>,
    store: MessageStore,
    handler: Option<Arc<dyn ChannelHandler>>,
    request_lock: Mutex<()>,
}

impl std::fmt::Debug for ChannelCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelCore")
            .field("local_id", &self.local_id)
            .field("kind", &self.kind)
            .field("state", &*lock(&self.state))
            .field("buffered", &self.store.len())
            .finish_non_exhaustive()
    }
}

impl ChannelCore {
    fn new(
        local_id: u32,
        kind: ChannelKind,
        handler: Option<Arc<dyn ChannelHandler>>,
        lifecycle: ChannelLifecycle,
        local_window: DataWindow,
        remote_id: u32,
        remote_window: DataWindow,
    ) -> Self {
        Self {
            local_id,
            kind,
            state: Mutex::new(ChannelState {
                remote_id,
                lifecycle,
                local_window,
                remote_window,
                eof_sent: false,
                eof_received: false,
                close_sent: None,
                close_received: false,
                open_abandoned: None,
                orphaned_replies: 0,
                exit_status: None,
                exit_signal: None,
                released: false,
                terminated: false,
            }),
            store: MessageStore::new(),
            handler,
            request_lock: Mutex::new(()),
        }
    }

    /// A channel we asked the peer to open.
    pub(crate) fn opening(
        local_id: u32,
        kind: ChannelKind,
        handler: Option<Arc<dyn ChannelHandler>>,
        local_window: DataWindow,
    ) -> Self {
        Self::new(
            local_id,
            kind,
            handler,
            ChannelLifecycle::Opening,
            local_window,
            0,
            DataWindow::new(0, 0),
        )
    }

    /// A channel the peer opened and we confirmed.
    pub(crate) fn accepted(
        local_id: u32,
        kind: ChannelKind,
        handler: Option<Arc<dyn ChannelHandler>>,
        local_window: DataWindow,
        remote_id: u32,
        remote_window: DataWindow,
    ) -> Self {
        Self::new(
            local_id,
            kind,
            handler,
            ChannelLifecycle::Open,
            local_window,
            remote_id,
            remote_window,
        )
    }

    fn offer(&self, msg: &Message) -> FynxResult<bool> {
        match &self.handler {
            Some(handler) => handler.handle_channel_message(self.local_id, msg),
            None => Ok(false),
        }
    }

    /// Applies one inbound message for this channel.
    ///
    /// Runs on the reading thread. Protocol state is updated first, then
    /// the handler is offered the message, then it is buffered.
    pub(crate) fn on_inbound(&self, msg: Message) -> FynxResult<ChannelEffects> {
        let mut effects = ChannelEffects::default();
        match msg.message_type() {
            Some(MessageType::ChannelOpenConfirmation) => {
                let confirm = ChannelOpenConfirmation::from_message(&msg)?;
                let mut state = lock(&self.state);
                if state.lifecycle != ChannelLifecycle::Opening {
                    return Err(FynxError::Protocol(format!(
                        "Open confirmation for channel {} which is not opening",
                        self.local_id
                    )));
                }
                state.remote_id = confirm.sender_channel;
                state.remote_window = DataWindow::new(confirm.initial_window, confirm.max_packet);
                if state.open_abandoned.is_some() {
                    debug!(local_id = self.local_id, "Closing channel confirmed after its open timed out");
                    state.lifecycle = ChannelLifecycle::Closed;
                    state.close_sent = Some(Instant::now());
                    effects.replies.push(close_payload(confirm.sender_channel));
                    return Ok(effects);
                }
                state.lifecycle = ChannelLifecycle::Open;
                drop(state);
                self.store.push(msg);
            }
            Some(MessageType::ChannelOpenFailure) => {
                let abandoned = {
                    let mut state = lock(&self.state);
                    if state.lifecycle != ChannelLifecycle::Opening {
                        return Err(FynxError::Protocol(format!(
                            "Open failure for channel {} which is not opening",
                            self.local_id
                        )));
                    }
                    state.lifecycle = ChannelLifecycle::Closed;
                    state.open_abandoned.is_some()
                };
                effects.release = true;
                if !abandoned {
                    self.store.push(msg);
                }
            }
            Some(MessageType::ChannelWindowAdjust) => {
                let bytes = window_adjust_bytes(&msg)?;
                let mut state = lock(&self.state);
                state.remote_window.adjust(bytes)?;
                trace!(local_id = self.local_id, bytes, available = state.remote_window.available(), "Remote window adjusted");
            }
            Some(MessageType::ChannelData) | Some(MessageType::ChannelExtendedData) => {
                let len = ChannelData::from_message(&msg)?.data.len();
                let discard = {
                    let mut state = lock(&self.state);
                    if state.lifecycle == ChannelLifecycle::Opening {
                        return Err(FynxError::Protocol(format!(
                            "Data for channel {} before open confirmation",
                            self.local_id
                        )));
                    }
                    state.local_window.receive(len)?;
                    state.close_sent.is_some() && !state.close_received
                };
                if discard {
                    trace!(local_id = self.local_id, len, "Discarded data after local close");
                } else if self.offer(&msg)? {
                    effects.replies.extend(self.consume(len));
                } else {
                    self.store.push(msg);
                }
            }
            Some(MessageType::ChannelEof) => {
                lock(&self.state).eof_received = true;
                if !self.offer(&msg)? {
                    self.store.push(msg);
                }
            }
            Some(MessageType::ChannelClose) => {
                let reply = {
                    let mut state = lock(&self.state);
                    state.close_received = true;
                    state.lifecycle = ChannelLifecycle::Closed;
                    match state.close_sent {
                        Some(_) => None,
                        None => {
                            state.close_sent = Some(Instant::now());
                            Some(close_payload(state.remote_id))
                        }
                    }
                };
                effects.replies.extend(reply);
                effects.release = true;
                info!(local_id = self.local_id, "Channel closed by peer");
                if !self.offer(&msg)? {
                    self.store.push(msg);
                }
            }
            Some(MessageType::ChannelRequest) => {
                if self.offer(&msg)? {
                    return Ok(effects);
                }
                let request = ChannelRequest::from_message(&msg)?;
                let handled = self.record_request(&request)?;
                if request.want_reply {
                    let remote_id = lock(&self.state).remote_id;
                    effects.replies.push(if handled {
                        success_payload(remote_id)
                    } else {
                        failure_payload(remote_id)
                    });
                }
            }
            _ => self.store.push(msg),
        }
        Ok(effects)
    }

    /// Built-in handling of peer requests. Returns true if understood.
    fn record_request(&self, request: &ChannelRequest) -> FynxResult<bool> {
        match request.name.as_str() {
            "exit-status" => {
                let status = Reader::new(&request.data).read_u32()?;
                debug!(local_id = self.local_id, status, "Exit status received");
                lock(&self.state).exit_status = Some(status);
                Ok(true)
            }
            "exit-signal" => {
                let signal = ExitSignal::parse(&request.data)?;
                debug!(local_id = self.local_id, signal = %signal.signal, "Exit signal received");
                lock(&self.state).exit_signal = Some(signal);
                Ok(true)
            }
            other => {
                debug!(local_id = self.local_id, request = other, "Unhandled channel request");
                Ok(false)
            }
        }
    }

    /// Returns the WINDOW_ADJUST to send after `len` bytes were read.
    fn consume(&self, len: usize) -> Option<Vec<u8>> {
        let mut state = lock(&self.state);
        if state.close_sent.is_some() {
            return None;
        }
        let bytes = state.local_window.consume(len)?;
        trace!(local_id = self.local_id, bytes, "Returning window");
        Some(window_adjust_payload(state.remote_id, bytes))
    }

    /// Marks a timed-out open. Returns a CLOSE to send if the confirmation
    /// raced the timeout.
    fn abandon_open(&self) -> Option<Vec<u8>> {
        let mut state = lock(&self.state);
        match state.lifecycle {
            ChannelLifecycle::Opening => {
                state.open_abandoned = Some(Instant::now());
                None
            }
            ChannelLifecycle::Open if state.close_sent.is_none() => {
                state.lifecycle = ChannelLifecycle::Closed;
                state.close_sent = Some(Instant::now());
                Some(close_payload(state.remote_id))
            }
            _ => None,
        }
    }

    /// Marks the channel closed locally. Returns EOF and CLOSE payloads
    /// still owed to the peer.
    fn begin_close(&self) -> Vec<Vec<u8>> {
        let mut state = lock(&self.state);
        if state.lifecycle != ChannelLifecycle::Open || state.close_sent.is_some() {
            return Vec::new();
        }
        let mut payloads = Vec::with_capacity(2);
        if !state.eof_sent {
            state.eof_sent = true;
            payloads.push(eof_payload(state.remote_id));
        }
        payloads.push(close_payload(state.remote_id));
        state.close_sent = Some(Instant::now());
        state.lifecycle = ChannelLifecycle::Closed;
        payloads
    }

    /// Returns true once a locally closed or abandoned channel has waited
    /// `grace` for the peer without an answer.
    pub(crate) fn close_expired(&self, grace: Duration) -> bool {
        let state = lock(&self.state);
        if state.close_received || state.released {
            return false;
        }
        let since = match (state.close_sent, state.open_abandoned) {
            (Some(sent), _) => sent,
            (None, Some(abandoned)) if state.lifecycle == ChannelLifecycle::Opening => abandoned,
            _ => return false,
        };
        since.elapsed() >= grace
    }

    pub(crate) fn notify_open(&self) {
        if let Some(handler) = &self.handler {
            handler.on_open(self.local_id);
        }
    }

    /// Records that the channel left the table. Runs the handler's
    /// `on_close` once.
    pub(crate) fn notify_released(&self) {
        {
            let mut state = lock(&self.state);
            if state.released {
                return;
            }
            state.released = true;
        }
        if let Some(handler) = &self.handler {
            handler.on_close(self.local_id);
        }
    }

    /// Marks the channel closed because the connection died.
    pub(crate) fn mark_terminated(&self) {
        let mut state = lock(&self.state);
        state.terminated = true;
        state.lifecycle = ChannelLifecycle::Closed;
    }
}

fn deadline(timeout: Option<Duration>) -> Option<Instant> {
    timeout.map(|t| Instant::now() + t)
}

/// An open channel.
///
/// Every blocking method takes an optional timeout. A timeout only
/// abandons the call: the channel and connection remain usable.
///
/// Dropping an open channel sends EOF and CLOSE without waiting for the
/// peer.
pub struct Channel {
    core: Arc<ChannelCore>,
    router: Arc<MessageRouter>,
    pending: Bytes,
    io_timeout: Option<Duration>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("core", &self.core)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl Channel {
    /// Opens a channel of `kind` and waits for the peer's answer.
    ///
    /// # Errors
    ///
    /// - [`FynxError::ResourceExhausted`] if the channel table is full
    /// - [`FynxError::ChannelOpenRejected`] with the peer's reason code
    /// - [`FynxError::Timeout`]; the slot stays reserved until the peer
    ///   answers or the close grace period runs out
    pub(crate) fn open(
        router: &Arc<MessageRouter>,
        kind: ChannelKind,
        handler: Option<Arc<dyn ChannelHandler>>,
        timeout: Option<Duration>,
    ) -> FynxResult<Self> {
        let deadline = deadline(timeout);
        let defaults = router.defaults();
        let channel_type = kind.type_name().to_string();
        let data = kind.open_data();

        let core = router.allocate(|local_id| {
            ChannelCore::opening(
                local_id,
                kind,
                handler,
                DataWindow::new(defaults.window_size, defaults.max_packet_size),
            )
        })?;

        let open = ChannelOpen {
            channel_type,
            sender_channel: core.local_id,
            initial_window: defaults.window_size,
            max_packet: defaults.max_packet_size,
            data,
        };
        if let Err(e) = router.send(&open.to_bytes()) {
            router.release(&core);
            return Err(e);
        }
        debug!(local_id = core.local_id, channel_type = %open.channel_type, "Channel open sent");

        let answered = |m: &Message| {
            m.is(MessageType::ChannelOpenConfirmation) || m.is(MessageType::ChannelOpenFailure)
        };
        let reply = match router.wait_with(deadline, || Ok(core.store.take_matching(answered))) {
            Ok(reply) => reply,
            Err(e @ FynxError::Timeout(_)) => {
                if let Some(close) = core.abandon_open() {
                    router.send(&close)?;
                }
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        if reply.is(MessageType::ChannelOpenFailure) {
            let failure = ChannelOpenFailure::from_message(&reply)?;
            info!(
                local_id = core.local_id,
                reason_code = failure.reason_code,
                description = %failure.description,
                "Channel open rejected"
            );
            return Err(FynxError::ChannelOpenRejected {
                reason_code: failure.reason_code,
                description: failure.description,
            });
        }

        info!(
            local_id = core.local_id,
            remote_id = lock(&core.state).remote_id,
            channel_type = %open.channel_type,
            "Channel opened"
        );
        core.notify_open();
        Ok(Self::from_core(core, Arc::clone(router)))
    }

    pub(crate) fn from_core(core: Arc<ChannelCore>, router: Arc<MessageRouter>) -> Self {
        let io_timeout = router.defaults().request_timeout;
        Self {
            core,
            router,
            pending: Bytes::new(),
            io_timeout,
        }
    }

    /// Our channel id.
    pub fn local_id(&self) -> u32 {
        self.core.local_id
    }

    /// The peer's channel id.
    pub fn remote_id(&self) -> u32 {
        lock(&self.core.state).remote_id
    }

    /// What the channel carries.
    pub fn kind(&self) -> &ChannelKind {
        &self.core.kind
    }

    /// Current lifecycle state.
    pub fn lifecycle(&self) -> ChannelLifecycle {
        lock(&self.core.state).lifecycle
    }

    /// Returns true once CLOSE has been sent or received.
    pub fn is_closed(&self) -> bool {
        self.lifecycle() == ChannelLifecycle::Closed
    }

    /// Returns true once the peer sent EOF.
    pub fn is_eof(&self) -> bool {
        lock(&self.core.state).eof_received
    }

    /// Bytes the peer will still accept before a window adjust.
    pub fn remote_window(&self) -> u32 {
        lock(&self.core.state).remote_window.available()
    }

    /// Bytes we will still accept.
    pub fn local_window(&self) -> u32 {
        lock(&self.core.state).local_window.available()
    }

    /// Exit status reported by the peer, if any.
    pub fn exit_status(&self) -> Option<u32> {
        lock(&self.core.state).exit_status
    }

    /// Exit signal reported by the peer, if any.
    pub fn exit_signal(&self) -> Option<ExitSignal> {
        lock(&self.core.state).exit_signal.clone()
    }

    /// Timeout used by the [`Read`] and [`Write`] impls. Defaults to the
    /// connection's request timeout.
    pub fn set_io_timeout(&mut self, timeout: Option<Duration>) {
        self.io_timeout = timeout;
    }

    fn writable_remote_id(&self) -> FynxResult<u32> {
        let state = lock(&self.core.state);
        if state.lifecycle != ChannelLifecycle::Open || state.close_received {
            return Err(FynxError::ChannelClosed);
        }
        Ok(state.remote_id)
    }

    /// Sends data, waiting for window space as needed.
    ///
    /// Data is split into messages no larger than the peer's maximum
    /// packet size or its remaining window.
    pub fn write_data(&self, data: &[u8], timeout: Option<Duration>) -> FynxResult<()> {
        self.send_stream(None, data, deadline(timeout))
    }

    /// Sends data as CHANNEL_EXTENDED_DATA of `data_type`.
    pub fn write_extended(
        &self,
        data_type: u32,
        data: &[u8],
        timeout: Option<Duration>,
    ) -> FynxResult<()> {
        self.send_stream(Some(data_type), data, deadline(timeout))
    }

    fn send_stream(
        &self,
        data_type: Option<u32>,
        mut data: &[u8],
        deadline: Option<Instant>,
    ) -> FynxResult<()> {
        while !data.is_empty() {
            let wanted = data.len();
            let (remote_id, n) = self.router.wait_with(deadline, || {
                let mut state = lock(&self.core.state);
                if state.lifecycle != ChannelLifecycle::Open || state.close_received || state.eof_sent
                {
                    return Err(FynxError::ChannelClosed);
                }
                let n = state.remote_window.reserve(wanted);
                Ok((n > 0).then_some((state.remote_id, n)))
            })?;

            let (chunk, rest) = data.split_at(n);
            let payload = match data_type {
                None => data_payload(remote_id, chunk),
                Some(code) => extended_data_payload(remote_id, code, chunk),
            };
            self.router.send(&payload)?;
            trace!(local_id = self.core.local_id, len = n, "Channel data sent");
            data = rest;
        }
        Ok(())
    }

    /// Sends EOF. No more data may be written afterwards.
    pub fn send_eof(&self) -> FynxResult<()> {
        let remote_id = {
            let mut state = lock(&self.core.state);
            if state.eof_sent || state.lifecycle != ChannelLifecycle::Open {
                return Ok(());
            }
            state.eof_sent = true;
            state.remote_id
        };
        self.router.send(&eof_payload(remote_id))
    }

    /// Reads the next chunk of data. Returns `None` at end of stream.
    pub fn read_data(&self, timeout: Option<Duration>) -> FynxResult<Option<Bytes>> {
        self.read_stream(MessageType::ChannelData, deadline(timeout))
    }

    /// Reads the next chunk of extended data (stderr). Returns `None` at
    /// end of stream.
    pub fn read_stderr(&self, timeout: Option<Duration>) -> FynxResult<Option<Bytes>> {
        self.read_stream(MessageType::ChannelExtendedData, deadline(timeout))
    }

    fn read_stream(
        &self,
        wanted: MessageType,
        deadline: Option<Instant>,
    ) -> FynxResult<Option<Bytes>> {
        let msg = self.router.wait_with(deadline, || {
            if let Some(msg) = self.core.store.take_matching(|m| m.is(wanted) || m.is_sticky()) {
                return Ok(Some(Some(msg)));
            }
            let state = lock(&self.core.state);
            if state.close_sent.is_some() && !state.terminated {
                return Ok(Some(None));
            }
            Ok(None)
        })?;

        match msg {
            Some(msg) if !msg.is_sticky() => Ok(Some(self.accept_data(&msg)?.data)),
            _ => Ok(None),
        }
    }

    /// Parses a buffered data message and returns its window to the peer.
    fn accept_data(&self, msg: &Message) -> FynxResult<ChannelData> {
        let data = ChannelData::from_message(msg)?;
        if let Some(adjust) = self.core.consume(data.data.len()) {
            self.router.send(&adjust)?;
        }
        Ok(data)
    }

    /// Reads stdout and stderr until the peer sends EOF or CLOSE.
    pub fn collect_output(&self, timeout: Option<Duration>) -> FynxResult<(Vec<u8>, Vec<u8>)> {
        let deadline = deadline(timeout);
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let readable = |m: &Message| {
            m.is(MessageType::ChannelData) || m.is(MessageType::ChannelExtendedData) || m.is_sticky()
        };

        loop {
            let msg = self.router.wait_with(deadline, || {
                if let Some(msg) = self.core.store.take_matching(readable) {
                    return Ok(Some(Some(msg)));
                }
                let state = lock(&self.core.state);
                Ok((state.close_sent.is_some() && !state.terminated).then_some(None))
            })?;
            let Some(msg) = msg.filter(|m| !m.is_sticky()) else {
                break;
            };
            let data = self.accept_data(&msg)?;
            match data.data_type {
                None => stdout.extend_from_slice(&data.data),
                Some(EXTENDED_DATA_STDERR) => stderr.extend_from_slice(&data.data),
                Some(code) => debug!(local_id = self.core.local_id, code, "Ignored extended data"),
            }
        }
        Ok((stdout, stderr))
    }

    /// Sends a channel request.
    ///
    /// With `want_reply`, waits for CHANNEL_SUCCESS or CHANNEL_FAILURE and
    /// returns whether the peer accepted. Without it, returns true once
    /// sent. Requests on one channel are serialized.
    ///
    /// # Errors
    ///
    /// [`FynxError::ChannelClosed`] if the channel closes before the reply.
    pub fn send_request(
        &self,
        name: &str,
        want_reply: bool,
        data: &[u8],
        timeout: Option<Duration>,
    ) -> FynxResult<bool> {
        let deadline = deadline(timeout);
        let _serial = lock(&self.core.request_lock);
        let request = ChannelRequest {
            recipient_channel: self.writable_remote_id()?,
            name: name.to_string(),
            want_reply,
            data: Bytes::copy_from_slice(data),
        };
        self.router.send(&request.to_bytes())?;
        debug!(local_id = self.core.local_id, request = name, want_reply, "Channel request sent");
        if !want_reply {
            return Ok(true);
        }

        let replied = |m: &Message| {
            m.is(MessageType::ChannelSuccess) || m.is(MessageType::ChannelFailure)
        };
        let result = self.router.wait_with(deadline, || {
            while let Some(reply) = self.core.store.take_matching(replied) {
                let mut state = lock(&self.core.state);
                if state.orphaned_replies == 0 {
                    return Ok(Some(reply.is(MessageType::ChannelSuccess)));
                }
                state.orphaned_replies -= 1;
            }
            let state = lock(&self.core.state);
            if state.close_received || state.terminated {
                return Err(FynxError::ChannelClosed);
            }
            Ok(None)
        });

        if let Err(FynxError::Timeout(_)) = &result {
            lock(&self.core.state).orphaned_replies += 1;
        }
        result
    }

    fn require(&self, name: &str, data: &[u8]) -> FynxResult<()> {
        if self.send_request(name, true, data, self.io_timeout)? {
            Ok(())
        } else {
            Err(FynxError::RequestRejected(name.to_string()))
        }
    }

    /// Runs a command on a session channel.
    pub fn exec(&self, command: &str) -> FynxResult<()> {
        let mut data = BytesMut::new();
        write_string(&mut data, command.as_bytes());
        self.require("exec", &data)
    }

    /// Starts the user's shell on a session channel.
    pub fn shell(&self) -> FynxResult<()> {
        self.require("shell", &[])
    }

    /// Starts a subsystem such as `sftp`.
    pub fn subsystem(&self, name: &str) -> FynxResult<()> {
        let mut data = BytesMut::new();
        write_string(&mut data, name.as_bytes());
        self.require("subsystem", &data)
    }

    /// Requests a pseudo-terminal with no terminal modes set.
    pub fn request_pty(&self, term: &str, columns: u32, rows: u32) -> FynxResult<()> {
        let mut data = BytesMut::new();
        write_string(&mut data, term.as_bytes());
        data.put_u32(columns);
        data.put_u32(rows);
        data.put_u32(0);
        data.put_u32(0);
        // TTY_OP_END only
        write_string(&mut data, &[0]);
        self.require("pty-req", &data)
    }

    /// Asks the peer to set an environment variable. Servers commonly
    /// refuse; returns whether it was accepted.
    pub fn set_env(&self, name: &str, value: &str) -> FynxResult<bool> {
        let mut data = BytesMut::new();
        write_string(&mut data, name.as_bytes());
        write_string(&mut data, value.as_bytes());
        self.send_request("env", true, &data, self.io_timeout)
    }

    /// Delivers a signal (name without `SIG`) to the remote process.
    pub fn signal(&self, name: &str) -> FynxResult<()> {
        let mut data = BytesMut::new();
        write_string(&mut data, name.as_bytes());
        self.send_request("signal", false, &data, None).map(|_| ())
    }

    /// Sends EOF and CLOSE if not already sent. Does not wait for the
    /// peer's CLOSE.
    pub fn close(&self) -> FynxResult<()> {
        let payloads = self.core.begin_close();
        if !payloads.is_empty() {
            debug!(local_id = self.core.local_id, "Closing channel");
        }
        for payload in payloads {
            self.router.send(&payload)?;
        }
        Ok(())
    }

    /// Waits until the peer closes the channel or it is freed.
    pub fn wait_closed(&self, timeout: Option<Duration>) -> FynxResult<()> {
        self.router.wait_with(deadline(timeout), || {
            let state = lock(&self.core.state);
            Ok((state.close_received || state.released).then_some(()))
        })
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if !self.router.is_closed() {
            let _ = self.close();
        }
    }
}

fn io_error(err: FynxError) -> io::Error {
    let kind = match &err {
        FynxError::Timeout(_) => io::ErrorKind::TimedOut,
        FynxError::ChannelClosed => io::ErrorKind::BrokenPipe,
        FynxError::UnexpectedTermination(_) | FynxError::Disconnected { .. } => {
            io::ErrorKind::ConnectionAborted
        }
        _ => io::ErrorKind::Other,
    };
    io::Error::new(kind, err)
}

impl Read for Channel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pending.is_empty() {
            match self.read_data(self.io_timeout).map_err(io_error)? {
                Some(data) => self.pending = data,
                None => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.advance(n);
        Ok(n)
    }
}

impl Write for Channel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_data(buf, self.io_timeout).map_err(io_error)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
