//! SSH key exchange (KEX) implementation (RFC 4253 Section 7).
//!
//! This module implements SSH key exchange, including:
//! - SSH_MSG_KEXINIT message and algorithm negotiation
//! - Pluggable key exchange methods ([`method`])
//! - Session key derivation ([`keys`])
//! - The handshake and rekey state machine ([`coordinator`])
//!
//! # Key Exchange Flow
//!
//! 1. Both sides send SSH_MSG_KEXINIT
//! 2. Algorithm negotiation (first client preference the server also lists)
//! 3. Key exchange (DH or ECDH), exchange hash signed by the server
//! 4. Both sides send SSH_MSG_NEWKEYS
//! 5. Each direction switches to the new keys at its NEWKEYS
//!
//! # Example
//!
//! ```rust
//! use fynx_ssh::config::AlgorithmPreferences;
//! use fynx_ssh::kex::KexInit;
//!
//! let kexinit = KexInit::from_preferences(&AlgorithmPreferences::default());
//! assert!(kexinit.kex_algorithms().contains(&"curve25519-sha256".to_string()));
//!
//! let bytes = kexinit.to_bytes();
//! assert_eq!(bytes[0], 20);
//! assert_eq!(KexInit::from_bytes(&bytes).unwrap(), kexinit);
//! ```

pub mod coordinator;
pub mod keys;
pub mod method;

pub use coordinator::{KexState, KexTransport, KeyExchangeCoordinator};
pub use keys::{derive_key, SessionKeys};
pub use method::{ExchangeContext, KexMethod, KexOutput, KexStep};

use crate::config::AlgorithmPreferences;
use crate::crypto::CryptoProvider;
use crate::message::MessageType;
use crate::wire::{write_bool, write_name_list, Reader};
use bytes::{BufMut, BytesMut};
use fynx_platform::{FynxError, FynxResult};
use rand::RngCore;
use std::time::Duration;

/// SSH_MSG_KEXINIT message (RFC 4253 Section 7.1).
///
/// # Algorithm Lists
///
/// Each algorithm list is a comma-separated list of algorithm names,
/// ordered by preference (most preferred first).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexInit {
    /// Random cookie (16 bytes)
    cookie: [u8; 16],
    /// Key exchange algorithms
    kex_algorithms: Vec<String>,
    /// Server host key algorithms
    server_host_key_algorithms: Vec<String>,
    /// Encryption algorithms client to server
    encryption_algorithms_client_to_server: Vec<String>,
    /// Encryption algorithms server to client
    encryption_algorithms_server_to_client: Vec<String>,
    /// MAC algorithms client to server
    mac_algorithms_client_to_server: Vec<String>,
    /// MAC algorithms server to client
    mac_algorithms_server_to_client: Vec<String>,
    /// Compression algorithms client to server
    compression_algorithms_client_to_server: Vec<String>,
    /// Compression algorithms server to client
    compression_algorithms_server_to_client: Vec<String>,
    /// Languages client to server (usually empty)
    languages_client_to_server: Vec<String>,
    /// Languages server to client (usually empty)
    languages_server_to_client: Vec<String>,
    /// First KEX packet follows
    first_kex_packet_follows: bool,
}

impl KexInit {
    /// Creates a KEXINIT offering `prefs` in both directions, with a fresh
    /// random cookie.
    pub fn from_preferences(prefs: &AlgorithmPreferences) -> Self {
        let mut cookie = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut cookie);

        Self {
            cookie,
            kex_algorithms: prefs.kex.clone(),
            server_host_key_algorithms: prefs.host_key.clone(),
            encryption_algorithms_client_to_server: prefs.ciphers.clone(),
            encryption_algorithms_server_to_client: prefs.ciphers.clone(),
            mac_algorithms_client_to_server: prefs.macs.clone(),
            mac_algorithms_server_to_client: prefs.macs.clone(),
            compression_algorithms_client_to_server: prefs.compression.clone(),
            compression_algorithms_server_to_client: prefs.compression.clone(),
            languages_client_to_server: vec![],
            languages_server_to_client: vec![],
            first_kex_packet_follows: false,
        }
    }

    /// Sets the first_kex_packet_follows flag.
    pub fn with_first_kex_packet_follows(mut self, follows: bool) -> Self {
        self.first_kex_packet_follows = follows;
        self
    }

    /// Returns the cookie.
    pub fn cookie(&self) -> &[u8; 16] {
        &self.cookie
    }

    /// Returns the key exchange algorithms.
    pub fn kex_algorithms(&self) -> &[String] {
        &self.kex_algorithms
    }

    /// Returns the server host key algorithms.
    pub fn server_host_key_algorithms(&self) -> &[String] {
        &self.server_host_key_algorithms
    }

    /// Returns the client-to-server encryption algorithms.
    pub fn encryption_algorithms_client_to_server(&self) -> &[String] {
        &self.encryption_algorithms_client_to_server
    }

    /// Returns the server-to-client encryption algorithms.
    pub fn encryption_algorithms_server_to_client(&self) -> &[String] {
        &self.encryption_algorithms_server_to_client
    }

    /// Returns the client-to-server MAC algorithms.
    pub fn mac_algorithms_client_to_server(&self) -> &[String] {
        &self.mac_algorithms_client_to_server
    }

    /// Returns the server-to-client MAC algorithms.
    pub fn mac_algorithms_server_to_client(&self) -> &[String] {
        &self.mac_algorithms_server_to_client
    }

    /// Returns the client-to-server compression algorithms.
    pub fn compression_algorithms_client_to_server(&self) -> &[String] {
        &self.compression_algorithms_client_to_server
    }

    /// Returns the server-to-client compression algorithms.
    pub fn compression_algorithms_server_to_client(&self) -> &[String] {
        &self.compression_algorithms_server_to_client
    }

    /// Returns whether a guessed key exchange packet follows.
    pub fn first_kex_packet_follows(&self) -> bool {
        self.first_kex_packet_follows
    }

    /// Serializes the KEXINIT message to bytes (without packet framing).
    ///
    /// Format (RFC 4253 Section 7.1):
    /// ```text
    /// byte         SSH_MSG_KEXINIT (20)
    /// byte[16]     cookie (random bytes)
    /// name-list    kex_algorithms
    /// name-list    server_host_key_algorithms
    /// name-list    encryption_algorithms_client_to_server
    /// name-list    encryption_algorithms_server_to_client
    /// name-list    mac_algorithms_client_to_server
    /// name-list    mac_algorithms_server_to_client
    /// name-list    compression_algorithms_client_to_server
    /// name-list    compression_algorithms_server_to_client
    /// name-list    languages_client_to_server
    /// name-list    languages_server_to_client
    /// boolean      first_kex_packet_follows
    /// uint32       0 (reserved for future extension)
    /// ```
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::KexInit as u8);
        buf.put_slice(&self.cookie);

        write_name_list(&mut buf, &self.kex_algorithms);
        write_name_list(&mut buf, &self.server_host_key_algorithms);
        write_name_list(&mut buf, &self.encryption_algorithms_client_to_server);
        write_name_list(&mut buf, &self.encryption_algorithms_server_to_client);
        write_name_list(&mut buf, &self.mac_algorithms_client_to_server);
        write_name_list(&mut buf, &self.mac_algorithms_server_to_client);
        write_name_list(&mut buf, &self.compression_algorithms_client_to_server);
        write_name_list(&mut buf, &self.compression_algorithms_server_to_client);
        write_name_list(&mut buf, &self.languages_client_to_server);
        write_name_list(&mut buf, &self.languages_server_to_client);

        write_bool(&mut buf, self.first_kex_packet_follows);
        buf.put_u32(0);

        buf.to_vec()
    }

    /// Parses a KEXINIT message from bytes.
    ///
    /// # Errors
    ///
    /// Returns [`FynxError::Protocol`] if:
    /// - Message type is not SSH_MSG_KEXINIT (20)
    /// - Any field is truncated or a name-list is not UTF-8
    pub fn from_bytes(data: &[u8]) -> FynxResult<Self> {
        let mut reader = Reader::new(data);
        let msg_type = reader
            .read_u8()
            .map_err(|_| FynxError::Protocol("KEXINIT message is empty".to_string()))?;
        if msg_type != MessageType::KexInit as u8 {
            return Err(FynxError::Protocol(format!(
                "Invalid message type: expected 20 (SSH_MSG_KEXINIT), got {}",
                msg_type
            )));
        }

        let mut cookie = [0u8; 16];
        cookie.copy_from_slice(reader.read_raw(16)?);

        let kexinit = Self {
            cookie,
            kex_algorithms: reader.read_name_list()?,
            server_host_key_algorithms: reader.read_name_list()?,
            encryption_algorithms_client_to_server: reader.read_name_list()?,
            encryption_algorithms_server_to_client: reader.read_name_list()?,
            mac_algorithms_client_to_server: reader.read_name_list()?,
            mac_algorithms_server_to_client: reader.read_name_list()?,
            compression_algorithms_client_to_server: reader.read_name_list()?,
            compression_algorithms_server_to_client: reader.read_name_list()?,
            languages_client_to_server: reader.read_name_list()?,
            languages_server_to_client: reader.read_name_list()?,
            first_kex_packet_follows: reader.read_bool()?,
        };
        // Reserved field; content is ignored
        reader.read_u32()?;

        Ok(kexinit)
    }
}

/// Negotiates one algorithm category.
///
/// Uses the first algorithm in the client's list that also appears in the
/// server's list (RFC 4253 Section 7.1).
///
/// # Errors
///
/// Returns [`FynxError::UnsupportedAlgorithm`] if there is no common name.
///
/// # Example
///
/// ```rust
/// use fynx_ssh::kex::negotiate_algorithm;
///
/// let client = vec!["aes256-ctr".to_string(), "aes128-ctr".to_string()];
/// let server = vec!["aes128-ctr".to_string(), "aes256-ctr".to_string()];
///
/// let result = negotiate_algorithm("cipher", &client, &server).unwrap();
/// assert_eq!(result, "aes256-ctr");
/// ```
pub fn negotiate_algorithm(
    category: &str,
    client_list: &[String],
    server_list: &[String],
) -> FynxResult<String> {
    client_list
        .iter()
        .find(|alg| server_list.contains(*alg))
        .cloned()
        .ok_or_else(|| FynxError::UnsupportedAlgorithm {
            category: category.to_string(),
            local: client_list.to_vec(),
            remote: server_list.to_vec(),
        })
}

/// Algorithms agreed for one key exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedAlgorithms {
    /// Key exchange method
    pub kex: String,
    /// Server host key algorithm
    pub host_key: String,
    /// Cipher client to server
    pub cipher_client_to_server: String,
    /// Cipher server to client
    pub cipher_server_to_client: String,
    /// MAC client to server (None when the cipher is AEAD)
    pub mac_client_to_server: Option<String>,
    /// MAC server to client (None when the cipher is AEAD)
    pub mac_server_to_client: Option<String>,
    /// Compression client to server
    pub compression_client_to_server: String,
    /// Compression server to client
    pub compression_server_to_client: String,
}

impl NegotiatedAlgorithms {
    /// Negotiates every category from the client's and server's KEXINIT.
    ///
    /// MAC lists are only negotiated for directions whose cipher is not
    /// AEAD, as OpenSSH does for `aes*-gcm@openssh.com`.
    pub fn negotiate(
        client: &KexInit,
        server: &KexInit,
        provider: &dyn CryptoProvider,
    ) -> FynxResult<Self> {
        let cipher_c2s = negotiate_algorithm(
            "cipher client->server",
            &client.encryption_algorithms_client_to_server,
            &server.encryption_algorithms_client_to_server,
        )?;
        let cipher_s2c = negotiate_algorithm(
            "cipher server->client",
            &client.encryption_algorithms_server_to_client,
            &server.encryption_algorithms_server_to_client,
        )?;

        let is_aead = |name: &str| provider.cipher_spec(name).map_or(false, |spec| spec.aead);
        let mac_c2s = if is_aead(&cipher_c2s) {
            None
        } else {
            Some(negotiate_algorithm(
                "mac client->server",
                &client.mac_algorithms_client_to_server,
                &server.mac_algorithms_client_to_server,
            )?)
        };
        let mac_s2c = if is_aead(&cipher_s2c) {
            None
        } else {
            Some(negotiate_algorithm(
                "mac server->client",
                &client.mac_algorithms_server_to_client,
                &server.mac_algorithms_server_to_client,
            )?)
        };

        Ok(Self {
            kex: negotiate_algorithm("kex", &client.kex_algorithms, &server.kex_algorithms)?,
            host_key: negotiate_algorithm(
                "host key",
                &client.server_host_key_algorithms,
                &server.server_host_key_algorithms,
            )?,
            cipher_client_to_server: cipher_c2s,
            cipher_server_to_client: cipher_s2c,
            mac_client_to_server: mac_c2s,
            mac_server_to_client: mac_s2c,
            compression_client_to_server: negotiate_algorithm(
                "compression client->server",
                &client.compression_algorithms_client_to_server,
                &server.compression_algorithms_client_to_server,
            )?,
            compression_server_to_client: negotiate_algorithm(
                "compression server->client",
                &client.compression_algorithms_server_to_client,
                &server.compression_algorithms_server_to_client,
            )?,
        })
    }
}

/// Returns true if a peer that set `first_kex_packet_follows` guessed
/// wrong, in which case its first method packet must be ignored
/// (RFC 4253 Section 7).
pub fn guess_was_wrong(client: &KexInit, server: &KexInit) -> bool {
    client.kex_algorithms.first() != server.kex_algorithms.first()
        || client.server_host_key_algorithms.first() != server.server_host_key_algorithms.first()
}

/// Thresholds that trigger an automatic rekey.
///
/// Any one counter reaching its limit in either direction starts a new key
/// exchange (RFC 4253 Section 9 recommends 1 GB or 1 hour).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RekeyLimits {
    /// Bytes transferred in one direction under one set of keys
    pub bytes: u64,
    /// Packets transferred in one direction under one set of keys
    pub packets: u64,
    /// Age of the current keys (`None` disables time-based rekey)
    pub time: Option<Duration>,
}

impl Default for RekeyLimits {
    fn default() -> Self {
        Self {
            bytes: 1 << 30,
            packets: 1 << 31,
            time: Some(Duration::from_secs(3600)),
        }
    }
}

impl RekeyLimits {
    /// Returns true once any limit is reached.
    pub fn exceeded(&self, bytes: u64, packets: u64, age: Duration) -> bool {
        bytes >= self.bytes
            || packets >= self.packets
            || self.time.map_or(false, |limit| age >= limit)
    }

    /// Validate limits
    pub fn validate(&self) -> FynxResult<()> {
        if self.bytes == 0 || self.packets == 0 {
            return Err(FynxError::Config(
                "rekey byte and packet limits must be positive".into(),
            ));
        }
        if self.packets > 1 << 32 {
            return Err(FynxError::Config(
                "rekey packet limit must not exceed 2^32 (sequence number wrap)".into(),
            ));
        }
        Ok(())
    }
}

/// Payload of SSH_MSG_NEWKEYS.
pub fn newkeys_payload() -> Vec<u8> {
    vec![MessageType::NewKeys as u8]
}
