//! Blocking SSH-2 client core for the Fynx security ecosystem.
//!
//! This crate provides the transport and connection layers of an SSH-2
//! client:
//!
//! - **Binary packet protocol** ([`packet`], [`pipeline`]) - framing,
//!   padding, encryption, MAC and compression (RFC 4253 Section 6)
//! - **Key exchange** ([`kex`]) - algorithm negotiation, curve25519 and
//!   DH group14, key derivation, rekeying (RFC 4253 Sections 7-9)
//! - **Message routing** ([`router`]) - one shared connection read by
//!   whichever waiting thread holds the read gate
//! - **Channels** ([`channel`]) - flow-controlled multiplexed streams
//!   (RFC 4254)
//!
//! User authentication is not part of this crate; the [`Connection`]
//! exposes the raw message interface an authentication layer runs on.
//!
//! # Example
//!
//! ```rust,no_run
//! use fynx_ssh::{Connection, SshClientConfig};
//! use std::sync::Arc;
//!
//! # fn main() -> fynx_platform::FynxResult<()> {
//! let mut config = SshClientConfig::default();
//! config.host_key_verifier = Some(Arc::new(|_alg: &str, _key: &[u8], fingerprint: &str| {
//!     fingerprint == "SHA256:known-fingerprint"
//! }));
//!
//! let conn = Connection::connect("server.example.com:22", config)?;
//! // ... authenticate through conn.service_request("ssh-userauth") ...
//! let output = conn.execute("uname -a")?;
//! println!("{}", String::from_utf8_lossy(&output.stdout));
//! # Ok(())
//! # }
//! ```
//!
//! # Threading
//!
//! A [`Connection`] is `Clone + Send + Sync`. Any number of threads may
//! block on it at once; there is no background reader unless
//! [`Connection::start_pump`] is called.
//!
//! # Security
//!
//! - All cryptographic operations use vetted libraries (`ring`, RustCrypto,
//!   `dalek`)
//! - MACs are compared in constant time
//! - Key material is zeroized on drop
//! - A handshake without a host key verifier fails closed
//!
//! # References
//!
//! - [RFC 4253](https://datatracker.ietf.org/doc/html/rfc4253) - SSH Transport Layer Protocol
//! - [RFC 4254](https://datatracker.ietf.org/doc/html/rfc4254) - SSH Connection Protocol
//! - [RFC 5647](https://datatracker.ietf.org/doc/html/rfc5647) - AES-GCM for SSH
//! - [RFC 8731](https://datatracker.ietf.org/doc/html/rfc8731) - curve25519-sha256

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod channel;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod kex;
pub mod message;
pub mod outbound;
pub mod packet;
pub mod pipeline;
pub mod router;
pub mod transport;
pub mod version;
pub mod wire;

pub use channel::{
    Channel, ChannelFactory, ChannelHandler, ChannelKind, ChannelLifecycle, DataWindow,
    OpenDecision,
};
pub use config::{AlgorithmPreferences, HostKeyVerifier, SshClientConfig};
pub use connection::{Connection, ExecOutput};
pub use message::{Message, MessageType};
pub use packet::{PacketCodec, PacketReader, PacketWriter};
pub use pipeline::CipherPipeline;
pub use router::{GlobalRequestHandler, MessageRouter, MessageStore, ShutdownHook, ThreadGate};
pub use transport::{memory_pair, MemoryStream, Transport, TransportReader};
pub use version::Version;

use std::sync::{Mutex, MutexGuard};

/// Locks a mutex, recovering the data if a panicking thread poisoned it.
///
/// Every critical section in this crate leaves its state consistent
/// before any call that can panic.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
