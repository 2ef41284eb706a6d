//! Packet MACs (RFC 4253 Section 6.4).
//!
//! ```text
//! mac = MAC(key, sequence_number || unencrypted_packet)
//! ```
//!
//! The sequence number is owned by the pipeline and passed in on every call,
//! so a MAC instance holds nothing but its key.

use fynx_platform::{FynxError, FynxResult};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::{Sha256, Sha512};
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

/// A keyed packet MAC for one direction.
pub trait PacketMac: Send {
    /// Negotiated algorithm name.
    fn name(&self) -> &'static str;

    /// Output length in bytes.
    fn mac_len(&self) -> usize;

    /// Computes the MAC over `sequence || packet`.
    fn compute(&self, sequence: u32, packet: &[u8]) -> FynxResult<Vec<u8>>;

    /// Verifies a received MAC in constant time.
    ///
    /// # Errors
    ///
    /// Returns [`FynxError::MacVerification`] on mismatch.
    fn verify(&self, sequence: u32, packet: &[u8], received: &[u8]) -> FynxResult<()> {
        let computed = self.compute(sequence, packet)?;
        if computed.len() == received.len() && bool::from(computed.ct_eq(received)) {
            Ok(())
        } else {
            Err(FynxError::MacVerification)
        }
    }
}

/// MAC algorithm for SSH.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacAlgorithm {
    /// HMAC-SHA256
    HmacSha256,
    /// HMAC-SHA512
    HmacSha512,
    /// HMAC-SHA1
    HmacSha1,
}

impl MacAlgorithm {
    /// All algorithms, preferred first.
    pub const ALL: [MacAlgorithm; 3] = [
        MacAlgorithm::HmacSha256,
        MacAlgorithm::HmacSha512,
        MacAlgorithm::HmacSha1,
    ];

    /// Returns the algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            MacAlgorithm::HmacSha256 => "hmac-sha2-256",
            MacAlgorithm::HmacSha512 => "hmac-sha2-512",
            MacAlgorithm::HmacSha1 => "hmac-sha1",
        }
    }

    /// Returns the key size in bytes.
    pub fn key_size(&self) -> usize {
        self.mac_size()
    }

    /// Returns the MAC output size in bytes.
    pub fn mac_size(&self) -> usize {
        match self {
            MacAlgorithm::HmacSha256 => 32,
            MacAlgorithm::HmacSha512 => 64,
            MacAlgorithm::HmacSha1 => 20,
        }
    }

    /// Parses MAC algorithm from name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|alg| alg.name() == name)
    }
}

/// HMAC key for one direction.
pub struct MacKey {
    algorithm: MacAlgorithm,
    key: Vec<u8>,
}

impl std::fmt::Debug for MacKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MacKey")
            .field("algorithm", &self.algorithm)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl MacKey {
    /// Creates a new MAC key from derived key material.
    pub fn new(algorithm: MacAlgorithm, key_material: &[u8]) -> FynxResult<Self> {
        if key_material.len() < algorithm.key_size() {
            return Err(FynxError::Security(format!(
                "Insufficient key material for MAC: expected {}, got {}",
                algorithm.key_size(),
                key_material.len()
            )));
        }

        Ok(Self {
            algorithm,
            key: key_material[..algorithm.key_size()].to_vec(),
        })
    }

    /// Returns the algorithm.
    pub fn algorithm(&self) -> MacAlgorithm {
        self.algorithm
    }
}

fn hmac_digest<M: Mac + hmac::digest::KeyInit>(
    key: &[u8],
    sequence: u32,
    packet: &[u8],
) -> FynxResult<Vec<u8>> {
    let mut mac = <M as hmac::digest::KeyInit>::new_from_slice(key)
        .map_err(|_| FynxError::Security("Invalid HMAC key length".to_string()))?;
    mac.update(&sequence.to_be_bytes());
    mac.update(packet);
    Ok(mac.finalize().into_bytes().to_vec())
}

impl PacketMac for MacKey {
    fn name(&self) -> &'static str {
        self.algorithm.name()
    }

    fn mac_len(&self) -> usize {
        self.algorithm.mac_size()
    }

    fn compute(&self, sequence: u32, packet: &[u8]) -> FynxResult<Vec<u8>> {
        match self.algorithm {
            MacAlgorithm::HmacSha256 => hmac_digest::<Hmac<Sha256>>(&self.key, sequence, packet),
            MacAlgorithm::HmacSha512 => hmac_digest::<Hmac<Sha512>>(&self.key, sequence, packet),
            MacAlgorithm::HmacSha1 => hmac_digest::<Hmac<Sha1>>(&self.key, sequence, packet),
        }
    }
}

impl Drop for MacKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_algorithm_properties() {
        assert_eq!(MacAlgorithm::HmacSha256.mac_size(), 32);
        assert_eq!(MacAlgorithm::HmacSha512.key_size(), 64);
        assert_eq!(MacAlgorithm::HmacSha1.mac_size(), 20);
        assert_eq!(
            MacAlgorithm::from_name("hmac-sha1"),
            Some(MacAlgorithm::HmacSha1)
        );
        assert_eq!(MacAlgorithm::from_name("hmac-md5"), None);
    }

    #[test]
    fn test_mac_compute_and_verify() {
        let key = MacKey::new(MacAlgorithm::HmacSha256, &[0x42; 32]).unwrap();
        let tag = key.compute(7, b"packet").unwrap();
        assert_eq!(tag.len(), 32);
        assert!(key.verify(7, b"packet", &tag).is_ok());
    }

    #[test]
    fn test_mac_binds_sequence_number() {
        let key = MacKey::new(MacAlgorithm::HmacSha512, &[1; 64]).unwrap();
        let tag = key.compute(0, b"packet").unwrap();
        assert!(matches!(
            key.verify(1, b"packet", &tag),
            Err(FynxError::MacVerification)
        ));
    }

    #[test]
    fn test_mac_rejects_truncated_tag() {
        let key = MacKey::new(MacAlgorithm::HmacSha1, &[9; 20]).unwrap();
        let tag = key.compute(3, b"data").unwrap();
        assert!(key.verify(3, b"data", &tag[..10]).is_err());
    }

    #[test]
    fn test_mac_key_too_short() {
        assert!(MacKey::new(MacAlgorithm::HmacSha256, &[0; 16]).is_err());
    }
}
