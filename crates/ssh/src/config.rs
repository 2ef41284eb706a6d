//! Client configuration.
//!
//! # Example
//!
//! ```rust
//! use fynx_ssh::config::SshClientConfig;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let mut config = SshClientConfig::default();
//! config.handshake_timeout = Duration::from_secs(10);
//! config.host_key_verifier = Some(Arc::new(|_alg: &str, _key: &[u8], fingerprint: &str| {
//!     fingerprint == "SHA256:known-fingerprint"
//! }));
//! assert!(config.validate().is_ok());
//! ```

use crate::crypto::{AlgorithmCategory, CryptoProvider, DefaultCryptoProvider};
use crate::kex::RekeyLimits;
use crate::version::Version;
use fynx_platform::{FynxError, FynxResult};
use std::sync::Arc;
use std::time::Duration;

/// Host key verification callback.
///
/// Arguments: (host key algorithm, public key blob, `SHA256:` fingerprint).
/// Returns: true to accept, false to reject
pub type HostKeyVerifier = Arc<dyn Fn(&str, &[u8], &str) -> bool + Send + Sync>;

/// Smallest packet the transport must accept (RFC 4253 Section 6.1).
pub const MIN_PACKET_LEN: usize = 35_000;

/// Algorithm preference lists sent in KEXINIT, most preferred first.
///
/// The same lists are offered for both directions.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AlgorithmPreferences {
    /// Key exchange methods
    pub kex: Vec<String>,
    /// Server host key algorithms
    pub host_key: Vec<String>,
    /// Ciphers
    pub ciphers: Vec<String>,
    /// MACs (unused when an AEAD cipher is negotiated)
    pub macs: Vec<String>,
    /// Compression methods
    pub compression: Vec<String>,
}

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

impl Default for AlgorithmPreferences {
    fn default() -> Self {
        Self {
            kex: names(&[
                "curve25519-sha256",
                "curve25519-sha256@libssh.org",
                "diffie-hellman-group14-sha256",
                "diffie-hellman-group14-sha1",
            ]),
            host_key: names(&[
                "ssh-ed25519",
                "ecdsa-sha2-nistp256",
                "ecdsa-sha2-nistp384",
                "rsa-sha2-512",
                "rsa-sha2-256",
            ]),
            ciphers: names(&[
                "aes256-gcm@openssh.com",
                "aes128-gcm@openssh.com",
                "aes256-ctr",
                "aes192-ctr",
                "aes128-ctr",
            ]),
            macs: names(&["hmac-sha2-256", "hmac-sha2-512", "hmac-sha1"]),
            compression: names(&["none"]),
        }
    }
}

/// SSH client configuration.
pub struct SshClientConfig {
    /// Local identification string.
    pub client_version: Version,
    /// Algorithm preferences.
    pub algorithms: AlgorithmPreferences,
    /// Source of cryptographic primitives.
    pub provider: Arc<dyn CryptoProvider>,
    /// Host key verification callback.
    ///
    /// Required: a handshake without one fails closed.
    pub host_key_verifier: Option<HostKeyVerifier>,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Bound on the initial version exchange and key exchange.
    pub handshake_timeout: Duration,
    /// Default timeout for channel opens and requests made through the
    /// convenience helpers (`None` waits indefinitely).
    pub request_timeout: Option<Duration>,
    /// Rekey thresholds.
    pub rekey_limits: RekeyLimits,
    /// Largest inbound packet accepted, in bytes (length field value).
    pub max_packet_len: usize,
    /// Size of the channel slot table.
    pub max_channels: usize,
    /// Initial local window for channels this side opens or accepts.
    pub window_size: u32,
    /// Largest data payload per CHANNEL_DATA this side accepts.
    pub max_packet_size: u32,
    /// How long a channel that sent CLOSE waits for the peer's CLOSE before
    /// it is force-freed.
    pub close_grace_period: Duration,
    /// Bytes of outbound payload that may queue up while a key exchange
    /// holds traffic. A sender that finds the queue full waits for the
    /// exchange to finish.
    pub max_queued_bytes: usize,
    /// Keep-alive interval.
    ///
    /// If set, the client sends SSH_MSG_IGNORE at this interval.
    /// Defaults to None (disabled).
    pub keepalive_interval: Option<Duration>,
}

impl std::fmt::Debug for SshClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshClientConfig")
            .field("client_version", &self.client_version)
            .field("algorithms", &self.algorithms)
            .field("provider", &"<provider>")
            .field(
                "host_key_verifier",
                &self.host_key_verifier.as_ref().map(|_| "<callback>"),
            )
            .field("connect_timeout", &self.connect_timeout)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("request_timeout", &self.request_timeout)
            .field("rekey_limits", &self.rekey_limits)
            .field("max_packet_len", &self.max_packet_len)
            .field("max_channels", &self.max_channels)
            .field("window_size", &self.window_size)
            .field("max_packet_size", &self.max_packet_size)
            .field("close_grace_period", &self.close_grace_period)
            .field("max_queued_bytes", &self.max_queued_bytes)
            .field("keepalive_interval", &self.keepalive_interval)
            .finish()
    }
}

// Callbacks are reference counted, so a clone shares them.
impl Clone for SshClientConfig {
    fn clone(&self) -> Self {
        Self {
            client_version: self.client_version.clone(),
            algorithms: self.algorithms.clone(),
            provider: Arc::clone(&self.provider),
            host_key_verifier: self.host_key_verifier.clone(),
            connect_timeout: self.connect_timeout,
            handshake_timeout: self.handshake_timeout,
            request_timeout: self.request_timeout,
            rekey_limits: self.rekey_limits,
            max_packet_len: self.max_packet_len,
            max_channels: self.max_channels,
            window_size: self.window_size,
            max_packet_size: self.max_packet_size,
            close_grace_period: self.close_grace_period,
            max_queued_bytes: self.max_queued_bytes,
            keepalive_interval: self.keepalive_interval,
        }
    }
}

impl Default for SshClientConfig {
    fn default() -> Self {
        Self {
            client_version: Version::default_fynx(),
            algorithms: AlgorithmPreferences::default(),
            provider: Arc::new(DefaultCryptoProvider),
            host_key_verifier: None,
            connect_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(60),
            request_timeout: Some(Duration::from_secs(60)),
            rekey_limits: RekeyLimits::default(),
            max_packet_len: 256 * 1024,
            max_channels: 256,
            window_size: 2 * 1024 * 1024,
            max_packet_size: 32 * 1024,
            close_grace_period: Duration::from_secs(5),
            max_queued_bytes: 4 * 1024 * 1024,
            keepalive_interval: None,
        }
    }
}

impl SshClientConfig {
    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns [`FynxError::Config`] naming the first invalid field.
    pub fn validate(&self) -> FynxResult<()> {
        let lists = [
            ("kex", AlgorithmCategory::Kex, &self.algorithms.kex),
            ("host_key", AlgorithmCategory::HostKey, &self.algorithms.host_key),
            ("ciphers", AlgorithmCategory::Cipher, &self.algorithms.ciphers),
            ("macs", AlgorithmCategory::Mac, &self.algorithms.macs),
            (
                "compression",
                AlgorithmCategory::Compression,
                &self.algorithms.compression,
            ),
        ];
        for (field, category, list) in lists {
            if list.is_empty() {
                return Err(FynxError::Config(format!(
                    "algorithms.{} cannot be empty",
                    field
                )));
            }
            if let Some(name) = list.iter().find(|n| !self.provider.supports(category, n)) {
                return Err(FynxError::Config(format!(
                    "algorithms.{}: '{}' is not supported by the crypto provider",
                    field, name
                )));
            }
        }

        if self.max_packet_len < MIN_PACKET_LEN {
            return Err(FynxError::Config(format!(
                "max_packet_len must be at least {}",
                MIN_PACKET_LEN
            )));
        }
        if self.max_channels == 0 {
            return Err(FynxError::Config("max_channels cannot be zero".into()));
        }
        if self.max_queued_bytes == 0 {
            return Err(FynxError::Config("max_queued_bytes cannot be zero".into()));
        }
        if self.window_size == 0 || self.max_packet_size == 0 {
            return Err(FynxError::Config(
                "window_size and max_packet_size must be positive".into(),
            ));
        }
        if self.max_packet_size as usize + 64 > self.max_packet_len {
            return Err(FynxError::Config(
                "max_packet_size does not fit in max_packet_len".into(),
            ));
        }
        self.rekey_limits.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = SshClientConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.host_key_verifier.is_none());
        assert_eq!(config.max_packet_size, 32768);
    }

    #[test]
    fn test_unsupported_algorithm_rejected() {
        let mut config = SshClientConfig::default();
        config.algorithms.ciphers.push("blowfish-cbc".to_string());
        match config.validate() {
            Err(FynxError::Config(msg)) => assert!(msg.contains("blowfish-cbc")),
            other => panic!("Expected Config error, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_list_rejected() {
        let mut config = SshClientConfig::default();
        config.algorithms.kex.clear();
        assert!(matches!(config.validate(), Err(FynxError::Config(_))));
    }

    #[test]
    fn test_small_max_packet_len_rejected() {
        let config = SshClientConfig {
            max_packet_len: 1024,
            ..SshClientConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_clone_shares_verifier() {
        let mut config = SshClientConfig::default();
        config.host_key_verifier = Some(Arc::new(|_: &str, _: &[u8], _: &str| true));
        let copy = config.clone();
        assert!(copy.host_key_verifier.is_some());
        let debug = format!("{:?}", copy);
        assert!(debug.contains("<callback>"));
    }
}
