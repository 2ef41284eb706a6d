//! The write half of a connection.
//!
//! All packets leave through one [`Outbound`], whose lock serializes
//! writes so that sequence numbers and cipher state advance in the same
//! order the packets hit the wire.
//!
//! While a key exchange is running the outbound side is *held*: only
//! transport-layer messages (1-49, minus the service messages) are
//! written, everything else is queued in order and flushed once the new
//! keys are in place (RFC 4253 Section 7.1). The queue is bounded; once
//! it holds `queue_limit` bytes, [`Outbound::is_queue_full`] tells the
//! router to make senders wait for the exchange instead.

use crate::kex::{newkeys_payload, RekeyLimits};
use crate::lock;
use crate::message::allowed_during_kex;
use crate::packet::PacketWriter;
use crate::pipeline::CipherPipeline;
use fynx_platform::{FynxError, FynxResult};
use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::{debug, trace};

struct OutboundState {
    writer: PacketWriter,
    holding: bool,
    queued: VecDeque<Vec<u8>>,
    queued_bytes: usize,
    queue_limit: usize,
    closed: bool,
}

impl OutboundState {
    fn write(&mut self, payload: &[u8]) -> FynxResult<()> {
        if self.closed {
            return Err(FynxError::UnexpectedTermination(
                "Connection is closed".to_string(),
            ));
        }
        let result = self.writer.write_packet(payload);
        if result.is_err() {
            self.closed = true;
        }
        result
    }
}

/// Serialized packet writer with key-exchange queueing.
pub struct Outbound {
    state: Mutex<OutboundState>,
}

impl std::fmt::Debug for Outbound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("Outbound")
            .field("holding", &state.holding)
            .field("queued", &state.queued.len())
            .field("queued_bytes", &state.queued_bytes)
            .field("closed", &state.closed)
            .finish()
    }
}

impl Outbound {
    /// Wraps a packet writer. At most `queue_limit` payload bytes are
    /// queued during a key exchange before the queue reports full.
    pub fn new(writer: PacketWriter, queue_limit: usize) -> Self {
        Self {
            state: Mutex::new(OutboundState {
                writer,
                holding: false,
                queued: VecDeque::new(),
                queued_bytes: 0,
                queue_limit,
                closed: false,
            }),
        }
    }

    /// Sends a payload, queueing it if a key exchange holds it back.
    pub fn send(&self, payload: &[u8]) -> FynxResult<()> {
        let mut state = lock(&self.state);
        let type_byte = payload.first().copied().unwrap_or(0);
        if state.holding && !allowed_during_kex(type_byte) {
            if state.closed {
                return Err(FynxError::UnexpectedTermination(
                    "Connection is closed".to_string(),
                ));
            }
            trace!(type_byte, queued = state.queued.len() + 1, "Queued during key exchange");
            state.queued_bytes += payload.len();
            state.queued.push_back(payload.to_vec());
            return Ok(());
        }
        state.write(payload)
    }

    /// Sends a transport-layer payload immediately, even while held.
    pub fn send_transport(&self, payload: &[u8]) -> FynxResult<()> {
        lock(&self.state).write(payload)
    }

    /// Best-effort send that gives up if another thread holds the writer.
    ///
    /// Used for the final DISCONNECT while tearing down, where a writer
    /// blocked on a dead peer must not stall the teardown.
    pub fn try_send_transport(&self, payload: &[u8]) -> bool {
        match self.state.try_lock() {
            Ok(mut state) => state.write(payload).is_ok(),
            Err(_) => false,
        }
    }

    /// Starts queueing non-transport payloads.
    pub fn hold(&self) {
        lock(&self.state).holding = true;
    }

    /// Returns true while non-transport payloads are being queued.
    pub fn is_holding(&self) -> bool {
        lock(&self.state).holding
    }

    /// Number of payloads waiting for the key exchange to finish.
    pub fn queued(&self) -> usize {
        lock(&self.state).queued.len()
    }

    /// Returns true if a payload of type `type_byte` would be queued and
    /// the queue has reached its limit.
    pub fn is_queue_full(&self, type_byte: u8) -> bool {
        let state = lock(&self.state);
        state.holding
            && !state.closed
            && !allowed_during_kex(type_byte)
            && state.queued_bytes >= state.queue_limit
    }

    /// Writes SSH_MSG_NEWKEYS and installs the new outbound keys under
    /// the same lock, so no packet can slip in between.
    pub fn switch_keys(&self, next: CipherPipeline) -> FynxResult<()> {
        let mut state = lock(&self.state);
        state.write(&newkeys_payload())?;
        state.writer.install(next);
        debug!(
            cipher = state.writer.pipeline().cipher_name(),
            "Outbound keys installed"
        );
        Ok(())
    }

    /// Stops holding and flushes everything queued, in order.
    pub fn release(&self) -> FynxResult<()> {
        let mut state = lock(&self.state);
        state.holding = false;
        state.queued_bytes = 0;
        let queued = std::mem::take(&mut state.queued);
        if !queued.is_empty() {
            debug!(count = queued.len(), "Flushing payloads queued during key exchange");
        }
        for payload in queued {
            state.write(&payload)?;
        }
        Ok(())
    }

    /// Returns true once the outbound pipeline reaches a rekey threshold.
    pub fn rekey_due(&self, limits: &RekeyLimits) -> bool {
        lock(&self.state).writer.pipeline().rekey_due(limits)
    }

    /// Starts a delayed compressor on the outbound pipeline.
    pub fn enable_delayed_compression(&self) -> bool {
        lock(&self.state).writer.pipeline_mut().enable_delayed_compression()
    }

    /// Refuses all further writes and drops anything queued.
    pub fn close(&self) {
        let mut state = lock(&self.state);
        state.closed = true;
        state.queued.clear();
        state.queued_bytes = 0;
    }

    /// Returns true once closed or after a write failed.
    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }
}
