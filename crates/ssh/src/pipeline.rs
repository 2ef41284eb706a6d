//! Per-direction cipher state.
//!
//! A [`CipherPipeline`] bundles everything one direction of the connection
//! needs to frame packets: the cipher, the MAC, the optional compressor,
//! the packet sequence number and the counters that drive rekeying.
//!
//! A connection owns two pipelines (inbound and outbound). Both start as
//! [`CipherPipeline::plaintext`] and are replaced as a whole when a key
//! exchange completes; the sequence number carries over (RFC 4253
//! Section 6.4).

use crate::crypto::{Cipher, CipherDirection, Compression, CryptoProvider, NoneCipher, PacketMac};
use crate::kex::RekeyLimits;
use fynx_platform::FynxResult;
use std::time::{Duration, Instant};

/// Key material and algorithm names for one direction.
#[derive(Debug, Clone, Copy)]
pub struct PipelineKeys<'a> {
    /// Negotiated cipher name
    pub cipher: &'a str,
    /// Negotiated MAC name (`None` for AEAD ciphers)
    pub mac: Option<&'a str>,
    /// Negotiated compression name
    pub compression: &'a str,
    /// Encryption key
    pub key: &'a [u8],
    /// Initial IV
    pub iv: &'a [u8],
    /// Integrity key
    pub mac_key: &'a [u8],
}

/// Cipher, MAC and compression state for one direction.
pub struct CipherPipeline {
    cipher: Box<dyn Cipher>,
    mac: Option<Box<dyn PacketMac>>,
    compressor: Option<Box<dyn Compression>>,
    compression_active: bool,
    block_size: usize,
    mac_len: usize,
    sequence: u32,
    bytes_since_rekey: u64,
    packets_since_rekey: u64,
    installed_at: Instant,
}

impl std::fmt::Debug for CipherPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherPipeline")
            .field("cipher", &self.cipher.name())
            .field("mac", &self.mac.as_ref().map(|m| m.name()))
            .field("compression", &self.compressor.as_ref().map(|c| c.name()))
            .field("compression_active", &self.compression_active)
            .field("block_size", &self.block_size)
            .field("mac_len", &self.mac_len)
            .field("sequence", &self.sequence)
            .field("bytes_since_rekey", &self.bytes_since_rekey)
            .field("packets_since_rekey", &self.packets_since_rekey)
            .finish()
    }
}

impl CipherPipeline {
    /// The pipeline in effect before the first key exchange: no
    /// encryption, no MAC, no compression.
    pub fn plaintext() -> Self {
        Self::new(Box::new(NoneCipher), None, None)
    }

    /// Creates a pipeline from its primitives.
    ///
    /// Non-delayed compressors are active immediately; `zlib@openssh.com`
    /// waits for [`CipherPipeline::enable_delayed_compression`].
    pub fn new(
        cipher: Box<dyn Cipher>,
        mac: Option<Box<dyn PacketMac>>,
        compressor: Option<Box<dyn Compression>>,
    ) -> Self {
        let block_size = cipher.block_size();
        let mac_len = if cipher.is_aead() {
            cipher.tag_size()
        } else {
            mac.as_ref().map_or(0, |m| m.mac_len())
        };
        let compression_active = compressor.as_ref().map_or(false, |c| !c.is_delayed());

        Self {
            cipher,
            mac,
            compressor,
            compression_active,
            block_size,
            mac_len,
            sequence: 0,
            bytes_since_rekey: 0,
            packets_since_rekey: 0,
            installed_at: Instant::now(),
        }
    }

    /// Builds a pipeline from negotiated names and derived keys.
    pub fn from_keys(
        provider: &dyn CryptoProvider,
        direction: CipherDirection,
        keys: PipelineKeys<'_>,
        max_payload: usize,
    ) -> FynxResult<Self> {
        let cipher = provider.create_cipher(keys.cipher, direction, keys.key, keys.iv)?;
        let mac = if cipher.is_aead() {
            None
        } else {
            match keys.mac {
                Some(name) => provider.create_mac(name, keys.mac_key)?,
                None => None,
            }
        };
        let compressor = provider.create_compression(keys.compression, max_payload)?;
        Ok(Self::new(cipher, mac, compressor))
    }

    /// Replaces the primitives with those of `next`, keeping the sequence
    /// number and resetting the rekey counters.
    pub fn install(&mut self, next: CipherPipeline) {
        let sequence = self.sequence;
        *self = next;
        self.sequence = sequence;
        self.bytes_since_rekey = 0;
        self.packets_since_rekey = 0;
        self.installed_at = Instant::now();
    }

    /// Starts a delayed (`zlib@openssh.com`) compressor.
    ///
    /// Returns true if compression became active.
    pub fn enable_delayed_compression(&mut self) -> bool {
        match &self.compressor {
            Some(c) if c.is_delayed() && !self.compression_active => {
                self.compression_active = true;
                true
            }
            _ => false,
        }
    }

    /// Compresses an outgoing payload if compression is active.
    pub(crate) fn compress(&mut self, payload: &[u8]) -> FynxResult<Option<Vec<u8>>> {
        match &mut self.compressor {
            Some(c) if self.compression_active => c.compress(payload).map(Some),
            _ => Ok(None),
        }
    }

    /// Decompresses an incoming payload if compression is active.
    pub(crate) fn decompress(&mut self, payload: &[u8]) -> FynxResult<Option<Vec<u8>>> {
        match &mut self.compressor {
            Some(c) if self.compression_active => c.decompress(payload).map(Some),
            _ => Ok(None),
        }
    }

    pub(crate) fn cipher_mut(&mut self) -> &mut dyn Cipher {
        self.cipher.as_mut()
    }

    pub(crate) fn mac(&self) -> Option<&dyn PacketMac> {
        self.mac.as_deref()
    }

    /// Records one packet of `wire_len` bytes and advances the sequence
    /// number, wrapping at 2^32.
    pub(crate) fn record(&mut self, wire_len: usize) {
        self.sequence = self.sequence.wrapping_add(1);
        self.bytes_since_rekey = self.bytes_since_rekey.saturating_add(wire_len as u64);
        self.packets_since_rekey += 1;
    }

    /// Returns the cipher name.
    pub fn cipher_name(&self) -> &'static str {
        self.cipher.name()
    }

    /// Returns true when the cipher is AEAD.
    pub fn is_aead(&self) -> bool {
        self.cipher.is_aead()
    }

    /// Cipher block size.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Bytes appended after the encrypted frame (MAC or AEAD tag).
    pub fn mac_len(&self) -> usize {
        self.mac_len
    }

    /// Sequence number of the next packet.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Wire bytes processed since the current keys were installed.
    pub fn bytes_since_rekey(&self) -> u64 {
        self.bytes_since_rekey
    }

    /// Packets processed since the current keys were installed.
    pub fn packets_since_rekey(&self) -> u64 {
        self.packets_since_rekey
    }

    /// Time since the current keys were installed.
    pub fn key_age(&self) -> Duration {
        self.installed_at.elapsed()
    }

    /// Returns true for the initial unencrypted pipeline.
    pub fn is_plaintext(&self) -> bool {
        self.cipher.name() == "none" && self.mac.is_none()
    }

    /// Returns true once any rekey threshold is reached.
    ///
    /// The plaintext pipeline never asks for a rekey; the first exchange is
    /// started explicitly.
    pub fn rekey_due(&self, limits: &RekeyLimits) -> bool {
        !self.is_plaintext()
            && limits.exceeded(self.bytes_since_rekey, self.packets_since_rekey, self.key_age())
    }

    #[cfg(test)]
    pub(crate) fn set_sequence(&mut self, sequence: u32) {
        self.sequence = sequence;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::DefaultCryptoProvider;

    fn ctr_pipeline(direction: CipherDirection) -> CipherPipeline {
        CipherPipeline::from_keys(
            &DefaultCryptoProvider,
            direction,
            PipelineKeys {
                cipher: "aes128-ctr",
                mac: Some("hmac-sha2-256"),
                compression: "none",
                key: &[1; 16],
                iv: &[2; 16],
                mac_key: &[3; 32],
            },
            64 * 1024,
        )
        .unwrap()
    }

    #[test]
    fn test_plaintext_pipeline() {
        let pipeline = CipherPipeline::plaintext();
        assert!(pipeline.is_plaintext());
        assert_eq!(pipeline.block_size(), 8);
        assert_eq!(pipeline.mac_len(), 0);
        assert!(!pipeline.rekey_due(&RekeyLimits {
            bytes: 1,
            packets: 1,
            time: None
        }));
    }

    #[test]
    fn test_install_keeps_sequence() {
        let mut pipeline = CipherPipeline::plaintext();
        pipeline.record(100);
        pipeline.record(100);
        assert_eq!(pipeline.sequence(), 2);
        assert_eq!(pipeline.bytes_since_rekey(), 200);

        pipeline.install(ctr_pipeline(CipherDirection::Encrypt));
        assert_eq!(pipeline.sequence(), 2);
        assert_eq!(pipeline.bytes_since_rekey(), 0);
        assert_eq!(pipeline.packets_since_rekey(), 0);
        assert_eq!(pipeline.cipher_name(), "aes128-ctr");
        assert_eq!(pipeline.mac_len(), 32);
    }

    #[test]
    fn test_sequence_wraps() {
        let mut pipeline = CipherPipeline::plaintext();
        pipeline.set_sequence(u32::MAX);
        pipeline.record(16);
        assert_eq!(pipeline.sequence(), 0);
    }

    #[test]
    fn test_rekey_due_on_packets() {
        let limits = RekeyLimits {
            bytes: 1 << 40,
            packets: 3,
            time: None,
        };
        let mut pipeline = ctr_pipeline(CipherDirection::Encrypt);
        pipeline.record(10);
        pipeline.record(10);
        assert!(!pipeline.rekey_due(&limits));
        pipeline.record(10);
        assert!(pipeline.rekey_due(&limits));
    }

    #[test]
    fn test_aead_pipeline_ignores_mac() {
        let pipeline = CipherPipeline::from_keys(
            &DefaultCryptoProvider,
            CipherDirection::Decrypt,
            PipelineKeys {
                cipher: "aes256-gcm@openssh.com",
                mac: Some("hmac-sha2-256"),
                compression: "none",
                key: &[1; 32],
                iv: &[2; 12],
                mac_key: &[],
            },
            64 * 1024,
        )
        .unwrap();
        assert!(pipeline.is_aead());
        assert_eq!(pipeline.mac_len(), 16);
        assert!(pipeline.mac().is_none());
    }

    #[test]
    fn test_delayed_compression() {
        let mut pipeline = CipherPipeline::from_keys(
            &DefaultCryptoProvider,
            CipherDirection::Encrypt,
            PipelineKeys {
                cipher: "none",
                mac: Some("none"),
                compression: "zlib@openssh.com",
                key: &[],
                iv: &[],
                mac_key: &[],
            },
            64 * 1024,
        )
        .unwrap();
        assert!(pipeline.compress(b"abc").unwrap().is_none());
        assert!(pipeline.enable_delayed_compression());
        assert!(!pipeline.enable_delayed_compression());
        assert!(pipeline.compress(b"abc").unwrap().is_some());
    }
}
