//! Cryptographic primitives behind a pluggable provider.
//!
//! The transport never names a concrete algorithm type. It asks a
//! [`CryptoProvider`] for primitives by their negotiated SSH names, so an
//! application can restrict, replace or extend the algorithm set without
//! touching the packet codec or key exchange state machine.
//!
//! [`DefaultCryptoProvider`] covers:
//!
//! | Category    | Algorithms                                                        |
//! |-------------|-------------------------------------------------------------------|
//! | kex         | curve25519-sha256(@libssh.org), diffie-hellman-group14-sha256/sha1 |
//! | host key    | ssh-ed25519, ecdsa-sha2-nistp256/384, rsa-sha2-256/512           |
//! | cipher      | aes128/256-gcm@openssh.com, aes128/192/256-ctr, aes128/256-cbc    |
//! | mac         | hmac-sha2-256, hmac-sha2-512, hmac-sha1, none                     |
//! | compression | none, zlib, zlib@openssh.com                                      |

pub mod cipher;
pub mod compression;
pub mod hostkey;
pub mod mac;

pub use cipher::{Cipher, CipherAlgorithm, CipherDirection, NoneCipher};
pub use compression::{Compression, CompressionAlgorithm, ZlibCompression};
pub use hostkey::{fingerprint_sha256, HostKeyAlgorithm};
pub use mac::{MacAlgorithm, MacKey, PacketMac};

use crate::kex::method::{Curve25519Sha256, DhGroup14, KexMethod};
use fynx_platform::{FynxError, FynxResult};
use sha2::Digest;

/// Hash function used by a key exchange method for the exchange hash and
/// key derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    /// SHA-1 (20 bytes)
    Sha1,
    /// SHA-256 (32 bytes)
    Sha256,
    /// SHA-512 (64 bytes)
    Sha512,
}

impl HashAlgorithm {
    /// Digest output length in bytes.
    pub fn output_len(&self) -> usize {
        match self {
            HashAlgorithm::Sha1 => 20,
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha512 => 64,
        }
    }

    /// Hashes the concatenation of `parts`.
    pub fn digest(&self, parts: &[&[u8]]) -> Vec<u8> {
        fn run<D: Digest>(parts: &[&[u8]]) -> Vec<u8> {
            let mut hasher = D::new();
            for part in parts {
                hasher.update(part);
            }
            hasher.finalize().to_vec()
        }

        match self {
            HashAlgorithm::Sha1 => run::<sha1::Sha1>(parts),
            HashAlgorithm::Sha256 => run::<sha2::Sha256>(parts),
            HashAlgorithm::Sha512 => run::<sha2::Sha512>(parts),
        }
    }
}

/// Algorithm categories negotiated in KEXINIT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlgorithmCategory {
    /// Key exchange methods
    Kex,
    /// Server host key algorithms
    HostKey,
    /// Encryption algorithms
    Cipher,
    /// MAC algorithms
    Mac,
    /// Compression algorithms
    Compression,
}

/// Sizes the key derivation needs for a cipher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CipherSpec {
    /// Key length in bytes
    pub key_len: usize,
    /// IV length in bytes
    pub iv_len: usize,
    /// Block size in bytes
    pub block_size: usize,
    /// True for AEAD ciphers, which make the negotiated MAC unused
    pub aead: bool,
}

/// Sizes the key derivation needs for a MAC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacSpec {
    /// Key length in bytes
    pub key_len: usize,
    /// Output length in bytes
    pub mac_len: usize,
}

/// Source of named cryptographic primitives.
///
/// Implementations must be shareable between the threads that use a
/// connection.
pub trait CryptoProvider: Send + Sync {
    /// Returns true if the provider implements `name` in `category`.
    fn supports(&self, category: AlgorithmCategory, name: &str) -> bool;

    /// Key/IV sizes for a cipher.
    fn cipher_spec(&self, name: &str) -> Option<CipherSpec>;

    /// Creates a directional cipher.
    fn create_cipher(
        &self,
        name: &str,
        direction: CipherDirection,
        key: &[u8],
        iv: &[u8],
    ) -> FynxResult<Box<dyn Cipher>>;

    /// Key/output sizes for a MAC.
    fn mac_spec(&self, name: &str) -> Option<MacSpec>;

    /// Creates a keyed MAC; `Ok(None)` for `none`.
    fn create_mac(&self, name: &str, key: &[u8]) -> FynxResult<Option<Box<dyn PacketMac>>>;

    /// Creates a compressor; `Ok(None)` for `none`.
    fn create_compression(
        &self,
        name: &str,
        max_payload: usize,
    ) -> FynxResult<Option<Box<dyn Compression>>>;

    /// Creates a fresh key exchange method instance.
    fn create_kex(&self, name: &str) -> FynxResult<Box<dyn KexMethod>>;

    /// Verifies a host key signature over the exchange hash.
    fn verify_host_signature(
        &self,
        algorithm: &str,
        host_key: &[u8],
        data: &[u8],
        signature: &[u8],
    ) -> FynxResult<bool>;
}

/// Provider backed by `ring`, RustCrypto and `flate2`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultCryptoProvider;

const KEX_METHODS: [&str; 4] = [
    "curve25519-sha256",
    "curve25519-sha256@libssh.org",
    "diffie-hellman-group14-sha256",
    "diffie-hellman-group14-sha1",
];

fn unsupported(category: &str, name: &str) -> FynxError {
    FynxError::UnsupportedAlgorithm {
        category: category.to_string(),
        local: Vec::new(),
        remote: vec![name.to_string()],
    }
}

impl CryptoProvider for DefaultCryptoProvider {
    fn supports(&self, category: AlgorithmCategory, name: &str) -> bool {
        match category {
            AlgorithmCategory::Kex => KEX_METHODS.contains(&name),
            AlgorithmCategory::HostKey => HostKeyAlgorithm::from_name(name).is_some(),
            AlgorithmCategory::Cipher => CipherAlgorithm::from_name(name).is_some(),
            AlgorithmCategory::Mac => name == "none" || MacAlgorithm::from_name(name).is_some(),
            AlgorithmCategory::Compression => CompressionAlgorithm::from_name(name).is_some(),
        }
    }

    fn cipher_spec(&self, name: &str) -> Option<CipherSpec> {
        CipherAlgorithm::from_name(name).map(|alg| CipherSpec {
            key_len: alg.key_size(),
            iv_len: alg.iv_size(),
            block_size: alg.block_size(),
            aead: alg.is_aead(),
        })
    }

    fn create_cipher(
        &self,
        name: &str,
        direction: CipherDirection,
        key: &[u8],
        iv: &[u8],
    ) -> FynxResult<Box<dyn Cipher>> {
        CipherAlgorithm::from_name(name)
            .ok_or_else(|| unsupported("cipher", name))?
            .create(direction, key, iv)
    }

    fn mac_spec(&self, name: &str) -> Option<MacSpec> {
        if name == "none" {
            return Some(MacSpec {
                key_len: 0,
                mac_len: 0,
            });
        }
        MacAlgorithm::from_name(name).map(|alg| MacSpec {
            key_len: alg.key_size(),
            mac_len: alg.mac_size(),
        })
    }

    fn create_mac(&self, name: &str, key: &[u8]) -> FynxResult<Option<Box<dyn PacketMac>>> {
        if name == "none" {
            return Ok(None);
        }
        let alg = MacAlgorithm::from_name(name).ok_or_else(|| unsupported("mac", name))?;
        Ok(Some(Box::new(MacKey::new(alg, key)?)))
    }

    fn create_compression(
        &self,
        name: &str,
        max_payload: usize,
    ) -> FynxResult<Option<Box<dyn Compression>>> {
        match CompressionAlgorithm::from_name(name) {
            Some(CompressionAlgorithm::None) => Ok(None),
            Some(CompressionAlgorithm::Zlib) => {
                Ok(Some(Box::new(ZlibCompression::new(false, max_payload))))
            }
            Some(CompressionAlgorithm::ZlibOpenssh) => {
                Ok(Some(Box::new(ZlibCompression::new(true, max_payload))))
            }
            None => Err(unsupported("compression", name)),
        }
    }

    fn create_kex(&self, name: &str) -> FynxResult<Box<dyn KexMethod>> {
        match name {
            "curve25519-sha256" | "curve25519-sha256@libssh.org" => {
                Ok(Box::new(Curve25519Sha256::new(name)?))
            }
            "diffie-hellman-group14-sha256" => Ok(Box::new(DhGroup14::new(HashAlgorithm::Sha256))),
            "diffie-hellman-group14-sha1" => Ok(Box::new(DhGroup14::new(HashAlgorithm::Sha1))),
            _ => Err(unsupported("kex", name)),
        }
    }

    fn verify_host_signature(
        &self,
        algorithm: &str,
        host_key: &[u8],
        data: &[u8],
        signature: &[u8],
    ) -> FynxResult<bool> {
        let alg = HostKeyAlgorithm::from_name(algorithm)
            .ok_or_else(|| unsupported("host key", algorithm))?;
        hostkey::verify_signature(alg, host_key, data, signature)
    }
}
