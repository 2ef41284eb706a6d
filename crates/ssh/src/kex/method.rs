//! Key exchange methods (RFC 4253 Section 8, RFC 8268, RFC 8731).
//!
//! This module implements:
//! - curve25519-sha256 and curve25519-sha256@libssh.org
//! - diffie-hellman-group14-sha256 and diffie-hellman-group14-sha1
//!
//! A method is driven by the coordinator through [`KexMethod`]: `start`
//! returns the client's first method message, `process` consumes each
//! method-specific message from the server (types 30-49) until the exchange
//! completes with a [`KexOutput`].
//!
//! # Security
//!
//! - DH Group14: 2048-bit MODP group, peer value range checked
//! - Curve25519: all-zero shared secrets are rejected
//! - Ephemeral private keys are dropped (ring) or zeroized (DH) after use

use crate::crypto::HashAlgorithm;
use crate::message::MessageType;
use crate::wire::{encode_mpint, write_mpint, write_string, Reader};
use bytes::{BufMut, BytesMut};
use fynx_platform::{FynxError, FynxResult};
use num_bigint::{BigUint, RandBigInt};
use once_cell::sync::Lazy;
use ring::agreement::{agree_ephemeral, EphemeralPrivateKey, UnparsedPublicKey, X25519};
use ring::rand::SystemRandom;
use zeroize::{Zeroize, Zeroizing};

/// Everything both sides hash into the exchange hash besides the
/// method-specific values.
#[derive(Debug, Clone, Copy)]
pub struct ExchangeContext<'a> {
    /// Client identification string (without CR LF)
    pub client_version: &'a str,
    /// Server identification string (without CR LF)
    pub server_version: &'a str,
    /// Payload of the client's SSH_MSG_KEXINIT
    pub client_kexinit: &'a [u8],
    /// Payload of the server's SSH_MSG_KEXINIT
    pub server_kexinit: &'a [u8],
}

/// Result of a completed key exchange method.
pub struct KexOutput {
    /// Shared secret K, encoded as an SSH mpint (length prefix included)
    pub shared_secret: Zeroizing<Vec<u8>>,
    /// Exchange hash H
    pub exchange_hash: Vec<u8>,
    /// Server public host key blob K_S
    pub host_key: Vec<u8>,
    /// Signature blob over H
    pub signature: Vec<u8>,
    /// Hash function of the method, used again for key derivation
    pub hash: HashAlgorithm,
}

impl std::fmt::Debug for KexOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KexOutput")
            .field("shared_secret", &"<redacted>")
            .field("exchange_hash", &hex::encode(&self.exchange_hash))
            .field("host_key_len", &self.host_key.len())
            .field("hash", &self.hash)
            .finish()
    }
}

/// Progress of a key exchange method after one message.
#[derive(Debug)]
pub enum KexStep {
    /// More messages are needed; send these payloads first
    Continue(Vec<Vec<u8>>),
    /// The method finished
    Complete(KexOutput),
}

/// A pluggable key exchange method, one instance per exchange.
pub trait KexMethod: Send {
    /// Method name as negotiated.
    fn name(&self) -> &str;

    /// Hash function of the method.
    fn hash_algorithm(&self) -> HashAlgorithm;

    /// Returns the payloads the client sends to open the exchange.
    fn start(&mut self, ctx: &ExchangeContext<'_>) -> FynxResult<Vec<Vec<u8>>>;

    /// Consumes one method-specific message from the server.
    fn process(&mut self, ctx: &ExchangeContext<'_>, payload: &[u8]) -> FynxResult<KexStep>;
}

/// Computes the exchange hash H (RFC 4253 Section 8, RFC 5656 Section 4).
///
/// ```text
/// H = HASH(string V_C || string V_S || string I_C || string I_S ||
///          string K_S || exchange_values || mpint K)
/// ```
///
/// `exchange_values` is the method's pre-encoded public values
/// (`mpint e || mpint f` for DH, `string Q_C || string Q_S` for ECDH) and
/// `shared_secret` is K already encoded as an mpint.
pub fn exchange_hash(
    hash: HashAlgorithm,
    ctx: &ExchangeContext<'_>,
    host_key: &[u8],
    exchange_values: &[u8],
    shared_secret: &[u8],
) -> Vec<u8> {
    let mut buf = BytesMut::new();
    write_string(&mut buf, ctx.client_version.as_bytes());
    write_string(&mut buf, ctx.server_version.as_bytes());
    write_string(&mut buf, ctx.client_kexinit);
    write_string(&mut buf, ctx.server_kexinit);
    write_string(&mut buf, host_key);
    buf.put_slice(exchange_values);
    buf.put_slice(shared_secret);
    hash.digest(&[&buf[..]])
}

/// Parsed SSH_MSG_KEX_ECDH_REPLY / SSH_MSG_KEXDH_REPLY (both type 31).
struct Reply<'a> {
    host_key: &'a [u8],
    server_value: &'a [u8],
    signature: &'a [u8],
}

fn parse_reply(payload: &[u8], mpint_value: bool) -> FynxResult<Reply<'_>> {
    let mut reader = Reader::new(payload);
    let msg_type = reader.read_u8()?;
    if msg_type != MessageType::KexdhReply as u8 {
        return Err(FynxError::Protocol(format!(
            "Unexpected key exchange message {} (expected 31)",
            msg_type
        )));
    }
    let host_key = reader.read_string()?;
    let server_value = if mpint_value {
        reader.read_mpint()?
    } else {
        reader.read_string()?
    };
    let signature = reader.read_string()?;
    Ok(Reply {
        host_key,
        server_value,
        signature,
    })
}

/// Curve25519 key exchange.
///
/// Implements curve25519-sha256 and curve25519-sha256@libssh.org (RFC 8731).
pub struct Curve25519Sha256 {
    name: String,
    private_key: Option<EphemeralPrivateKey>,
    public_key: [u8; 32],
}

impl Curve25519Sha256 {
    /// Generates a fresh ephemeral key pair.
    ///
    /// # Errors
    ///
    /// Returns [`FynxError::Security`] if the system RNG fails.
    pub fn new(name: &str) -> FynxResult<Self> {
        let rng = SystemRandom::new();
        let private_key = EphemeralPrivateKey::generate(&X25519, &rng)
            .map_err(|_| FynxError::Security("Failed to generate Curve25519 key".to_string()))?;

        let public_key = private_key.compute_public_key().map_err(|_| {
            FynxError::Security("Failed to compute Curve25519 public key".to_string())
        })?;

        let mut public_key_bytes = [0u8; 32];
        public_key_bytes.copy_from_slice(public_key.as_ref());

        Ok(Self {
            name: name.to_string(),
            private_key: Some(private_key),
            public_key: public_key_bytes,
        })
    }

    /// Returns the ephemeral public key Q_C.
    pub fn public_key(&self) -> &[u8; 32] {
        &self.public_key
    }
}

impl std::fmt::Debug for Curve25519Sha256 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Curve25519Sha256")
            .field("name", &self.name)
            .field("used", &self.private_key.is_none())
            .finish_non_exhaustive()
    }
}

impl KexMethod for Curve25519Sha256 {
    fn name(&self) -> &str {
        &self.name
    }

    fn hash_algorithm(&self) -> HashAlgorithm {
        HashAlgorithm::Sha256
    }

    fn start(&mut self, _ctx: &ExchangeContext<'_>) -> FynxResult<Vec<Vec<u8>>> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::KexdhInit as u8);
        write_string(&mut buf, &self.public_key);
        Ok(vec![buf.to_vec()])
    }

    fn process(&mut self, ctx: &ExchangeContext<'_>, payload: &[u8]) -> FynxResult<KexStep> {
        let reply = parse_reply(payload, false)?;
        if reply.server_value.len() != 32 {
            return Err(FynxError::Protocol(format!(
                "Curve25519 public key must be 32 bytes, got {}",
                reply.server_value.len()
            )));
        }

        let private_key = self.private_key.take().ok_or_else(|| {
            FynxError::Protocol("Duplicate SSH_MSG_KEX_ECDH_REPLY".to_string())
        })?;
        let peer_public_key = UnparsedPublicKey::new(&X25519, reply.server_value);
        let secret = agree_ephemeral(private_key, &peer_public_key, |key_material| {
            Zeroizing::new(key_material.to_vec())
        })
        .map_err(|_| FynxError::Security("Curve25519 key agreement failed".to_string()))?;

        if secret.iter().all(|&b| b == 0) {
            return Err(FynxError::Security(
                "Curve25519 shared secret is all zero".to_string(),
            ));
        }

        // RFC 8731: the X25519 output is read as an unsigned big-endian integer
        let shared_secret = Zeroizing::new(encode_mpint(&secret));

        let mut values = BytesMut::new();
        write_string(&mut values, &self.public_key);
        write_string(&mut values, reply.server_value);

        let hash = self.hash_algorithm();
        let exchange_hash = exchange_hash(hash, ctx, reply.host_key, &values, &shared_secret);

        Ok(KexStep::Complete(KexOutput {
            shared_secret,
            exchange_hash,
            host_key: reply.host_key.to_vec(),
            signature: reply.signature.to_vec(),
            hash,
        }))
    }
}

/// 2048-bit MODP group prime (RFC 3526 Section 3).
const GROUP14_PRIME: [u8; 256] = [
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xc9, 0x0f, 0xda, 0xa2,
    0x21, 0x68, 0xc2, 0x34, 0xc4, 0xc6, 0x62, 0x8b, 0x80, 0xdc, 0x1c, 0xd1,
    0x29, 0x02, 0x4e, 0x08, 0x8a, 0x67, 0xcc, 0x74, 0x02, 0x0b, 0xbe, 0xa6,
    0x3b, 0x13, 0x9b, 0x22, 0x51, 0x4a, 0x08, 0x79, 0x8e, 0x34, 0x04, 0xdd,
    0xef, 0x95, 0x19, 0xb3, 0xcd, 0x3a, 0x43, 0x1b, 0x30, 0x2b, 0x0a, 0x6d,
    0xf2, 0x5f, 0x14, 0x37, 0x4f, 0xe1, 0x35, 0x6d, 0x6d, 0x51, 0xc2, 0x45,
    0xe4, 0x85, 0xb5, 0x76, 0x62, 0x5e, 0x7e, 0xc6, 0xf4, 0x4c, 0x42, 0xe9,
    0xa6, 0x37, 0xed, 0x6b, 0x0b, 0xff, 0x5c, 0xb6, 0xf4, 0x06, 0xb7, 0xed,
    0xee, 0x38, 0x6b, 0xfb, 0x5a, 0x89, 0x9f, 0xa5, 0xae, 0x9f, 0x24, 0x11,
    0x7c, 0x4b, 0x1f, 0xe6, 0x49, 0x28, 0x66, 0x51, 0xec, 0xe4, 0x5b, 0x3d,
    0xc2, 0x00, 0x7c, 0xb8, 0xa1, 0x63, 0xbf, 0x05, 0x98, 0xda, 0x48, 0x36,
    0x1c, 0x55, 0xd3, 0x9a, 0x69, 0x16, 0x3f, 0xa8, 0xfd, 0x24, 0xcf, 0x5f,
    0x83, 0x65, 0x5d, 0x23, 0xdc, 0xa3, 0xad, 0x96, 0x1c, 0x62, 0xf3, 0x56,
    0x20, 0x85, 0x52, 0xbb, 0x9e, 0xd5, 0x29, 0x07, 0x70, 0x96, 0x96, 0x6d,
    0x67, 0x0c, 0x35, 0x4e, 0x4a, 0xbc, 0x98, 0x04, 0xf1, 0x74, 0x6c, 0x08,
    0xca, 0x18, 0x21, 0x7c, 0x32, 0x90, 0x5e, 0x46, 0x2e, 0x36, 0xce, 0x3b,
    0xe3, 0x9e, 0x77, 0x2c, 0x18, 0x0e, 0x86, 0x03, 0x9b, 0x27, 0x83, 0xa2,
    0xec, 0x07, 0xa2, 0x8f, 0xb5, 0xc5, 0x5d, 0xf0, 0x6f, 0x4c, 0x52, 0xc9,
    0xde, 0x2b, 0xcb, 0xf6, 0x95, 0x58, 0x17, 0x18, 0x39, 0x95, 0x49, 0x7c,
    0xea, 0x95, 0x6a, 0xe5, 0x15, 0xd2, 0x26, 0x18, 0x98, 0xfa, 0x05, 0x10,
    0x15, 0x72, 0x8e, 0x5a, 0x8a, 0xac, 0xaa, 0x68, 0xff, 0xff, 0xff, 0xff,
    0xff, 0xff, 0xff, 0xff,
];

/// Diffie-Hellman Group 14 prime (2048-bit)
pub static GROUP14_P: Lazy<BigUint> = Lazy::new(|| BigUint::from_bytes_be(&GROUP14_PRIME));

/// Diffie-Hellman Group 14 generator
pub static GROUP14_G: Lazy<BigUint> = Lazy::new(|| BigUint::from(2u32));

/// Diffie-Hellman Group 14 key exchange.
///
/// Implements diffie-hellman-group14-sha256 (RFC 8268) and
/// diffie-hellman-group14-sha1 (RFC 4253).
pub struct DhGroup14 {
    hash: HashAlgorithm,
    /// Private exponent x, big-endian
    private_key: Vec<u8>,
    /// Public value e = g^x mod p
    public_key: BigUint,
    used: bool,
}

impl DhGroup14 {
    /// Generates a fresh exponent for the given hash variant.
    pub fn new(hash: HashAlgorithm) -> Self {
        let mut rng = rand::thread_rng();

        // 1 < x < p-1
        let p_minus_one = GROUP14_P.clone() - 1u32;
        let x = rng.gen_biguint_range(&BigUint::from(2u32), &p_minus_one);
        let e = GROUP14_G.modpow(&x, &GROUP14_P);

        Self {
            hash,
            private_key: x.to_bytes_be(),
            public_key: e,
            used: false,
        }
    }

    /// Returns the public value e.
    pub fn public_key(&self) -> &BigUint {
        &self.public_key
    }

    /// Computes K = f^x mod p after range checking f.
    pub fn compute_shared_secret(&self, peer_public: &[u8]) -> FynxResult<Zeroizing<Vec<u8>>> {
        let f = BigUint::from_bytes_be(peer_public);
        let p_minus_one = GROUP14_P.clone() - 1u32;

        // Validate peer's public value: 1 < f < p-1
        if f <= BigUint::from(1u32) || f >= p_minus_one {
            return Err(FynxError::Protocol(
                "Invalid peer DH public value: out of range".to_string(),
            ));
        }

        let x = BigUint::from_bytes_be(&self.private_key);
        let k = f.modpow(&x, &GROUP14_P);
        Ok(Zeroizing::new(k.to_bytes_be()))
    }
}

impl std::fmt::Debug for DhGroup14 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhGroup14")
            .field("hash", &self.hash)
            .field("used", &self.used)
            .finish_non_exhaustive()
    }
}

impl Drop for DhGroup14 {
    fn drop(&mut self) {
        self.private_key.zeroize();
    }
}

impl KexMethod for DhGroup14 {
    fn name(&self) -> &str {
        match self.hash {
            HashAlgorithm::Sha1 => "diffie-hellman-group14-sha1",
            _ => "diffie-hellman-group14-sha256",
        }
    }

    fn hash_algorithm(&self) -> HashAlgorithm {
        self.hash
    }

    fn start(&mut self, _ctx: &ExchangeContext<'_>) -> FynxResult<Vec<Vec<u8>>> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::KexdhInit as u8);
        write_mpint(&mut buf, &self.public_key.to_bytes_be());
        Ok(vec![buf.to_vec()])
    }

    fn process(&mut self, ctx: &ExchangeContext<'_>, payload: &[u8]) -> FynxResult<KexStep> {
        if self.used {
            return Err(FynxError::Protocol(
                "Duplicate SSH_MSG_KEXDH_REPLY".to_string(),
            ));
        }
        let reply = parse_reply(payload, true)?;
        let secret = self.compute_shared_secret(reply.server_value)?;
        self.used = true;
        self.private_key.zeroize();

        let shared_secret = Zeroizing::new(encode_mpint(&secret));

        let mut values = BytesMut::new();
        write_mpint(&mut values, &self.public_key.to_bytes_be());
        write_mpint(&mut values, reply.server_value);

        let exchange_hash = exchange_hash(self.hash, ctx, reply.host_key, &values, &shared_secret);

        Ok(KexStep::Complete(KexOutput {
            shared_secret,
            exchange_hash,
            host_key: reply.host_key.to_vec(),
            signature: reply.signature.to_vec(),
            hash: self.hash,
        }))
    }
}
