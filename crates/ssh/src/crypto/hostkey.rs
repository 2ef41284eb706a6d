//! Server host key signature verification (RFC 4253 Section 6.6).
//!
//! # Supported Algorithms
//!
//! - `ssh-ed25519` (RFC 8709)
//! - `ecdsa-sha2-nistp256`, `ecdsa-sha2-nistp384` (RFC 5656)
//! - `rsa-sha2-256`, `rsa-sha2-512` (RFC 8332), keys of 2048 bits or more
//!
//! The client never signs, so this module only parses public key blobs and
//! signature blobs and checks them against the exchange hash.

use crate::wire::Reader;
use base64::Engine;
use ed25519_dalek::Verifier as _;
use fynx_platform::{FynxError, FynxResult};
use ring::signature::{
    RsaPublicKeyComponents, RSA_PKCS1_2048_8192_SHA256, RSA_PKCS1_2048_8192_SHA512,
};
use sha2::{Digest, Sha256};

/// Host key algorithm identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyAlgorithm {
    /// ssh-ed25519 - EdDSA signature using Ed25519
    SshEd25519,
    /// ecdsa-sha2-nistp256 - ECDSA signature using P-256 curve
    EcdsaSha2Nistp256,
    /// ecdsa-sha2-nistp384 - ECDSA signature using P-384 curve
    EcdsaSha2Nistp384,
    /// rsa-sha2-512 - RSA signature with SHA-512
    RsaSha2_512,
    /// rsa-sha2-256 - RSA signature with SHA-256
    RsaSha2_256,
}

impl HostKeyAlgorithm {
    /// All algorithms, preferred first.
    pub const ALL: [HostKeyAlgorithm; 5] = [
        HostKeyAlgorithm::SshEd25519,
        HostKeyAlgorithm::EcdsaSha2Nistp256,
        HostKeyAlgorithm::EcdsaSha2Nistp384,
        HostKeyAlgorithm::RsaSha2_512,
        HostKeyAlgorithm::RsaSha2_256,
    ];

    /// Returns the algorithm name as negotiated in KEXINIT.
    pub fn name(&self) -> &'static str {
        match self {
            HostKeyAlgorithm::SshEd25519 => "ssh-ed25519",
            HostKeyAlgorithm::EcdsaSha2Nistp256 => "ecdsa-sha2-nistp256",
            HostKeyAlgorithm::EcdsaSha2Nistp384 => "ecdsa-sha2-nistp384",
            HostKeyAlgorithm::RsaSha2_512 => "rsa-sha2-512",
            HostKeyAlgorithm::RsaSha2_256 => "rsa-sha2-256",
        }
    }

    /// Returns the key type found inside the public key blob.
    ///
    /// Both RSA signature algorithms use `ssh-rsa` keys.
    pub fn key_type(&self) -> &'static str {
        match self {
            HostKeyAlgorithm::RsaSha2_512 | HostKeyAlgorithm::RsaSha2_256 => "ssh-rsa",
            other => other.name(),
        }
    }

    /// Parse algorithm from name
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|alg| alg.name() == name)
    }
}

/// Computes the OpenSSH-style SHA-256 fingerprint of a public key blob.
///
/// # Example
///
/// ```rust
/// use fynx_ssh::crypto::hostkey::fingerprint_sha256;
///
/// let fp = fingerprint_sha256(b"key blob");
/// assert!(fp.starts_with("SHA256:"));
/// assert!(!fp.ends_with('='));
/// ```
pub fn fingerprint_sha256(key_blob: &[u8]) -> String {
    let hash = Sha256::digest(key_blob);
    format!(
        "SHA256:{}",
        base64::engine::general_purpose::STANDARD_NO_PAD.encode(hash)
    )
}

/// Verifies `signature_blob` over `data` with the host key in `key_blob`.
///
/// Returns `Ok(false)` for a well-formed signature that does not verify.
///
/// # Errors
///
/// Returns [`FynxError::Security`] if the blobs are malformed or name a
/// different algorithm than the one negotiated.
pub fn verify_signature(
    algorithm: HostKeyAlgorithm,
    key_blob: &[u8],
    data: &[u8],
    signature_blob: &[u8],
) -> FynxResult<bool> {
    let malformed = |what: &str| FynxError::Security(format!("Malformed {}", what));

    let mut key = Reader::new(key_blob);
    let key_type = key.read_string().map_err(|_| malformed("host key blob"))?;
    if key_type != algorithm.key_type().as_bytes() {
        return Err(FynxError::Security(format!(
            "Host key type '{}' does not match negotiated algorithm {}",
            String::from_utf8_lossy(key_type),
            algorithm.name()
        )));
    }

    let mut sig = Reader::new(signature_blob);
    let sig_type = sig.read_string().map_err(|_| malformed("signature blob"))?;
    if sig_type != algorithm.name().as_bytes() {
        return Err(FynxError::Security(format!(
            "Signature algorithm '{}' does not match negotiated algorithm {}",
            String::from_utf8_lossy(sig_type),
            algorithm.name()
        )));
    }
    let sig_bytes = sig.read_string().map_err(|_| malformed("signature blob"))?;

    match algorithm {
        HostKeyAlgorithm::SshEd25519 => {
            let public_key = key.read_string().map_err(|_| malformed("ed25519 key"))?;
            verify_ed25519(public_key, data, sig_bytes)
        }
        HostKeyAlgorithm::EcdsaSha2Nistp256 | HostKeyAlgorithm::EcdsaSha2Nistp384 => {
            let _curve = key.read_string().map_err(|_| malformed("ecdsa key"))?;
            let point = key.read_string().map_err(|_| malformed("ecdsa key"))?;
            verify_ecdsa(algorithm, point, data, sig_bytes)
        }
        HostKeyAlgorithm::RsaSha2_256 | HostKeyAlgorithm::RsaSha2_512 => {
            let e = key.read_mpint().map_err(|_| malformed("rsa key"))?;
            let n = key.read_mpint().map_err(|_| malformed("rsa key"))?;
            verify_rsa(algorithm, n, e, data, sig_bytes)
        }
    }
}

fn verify_ed25519(public_key: &[u8], data: &[u8], signature: &[u8]) -> FynxResult<bool> {
    let key_bytes: [u8; 32] = public_key
        .try_into()
        .map_err(|_| FynxError::Security("Ed25519 public key must be 32 bytes".to_string()))?;
    let sig_bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| FynxError::Security("Ed25519 signature must be 64 bytes".to_string()))?;

    let verifying_key = ed25519_dalek::VerifyingKey::from_bytes(&key_bytes)
        .map_err(|e| FynxError::Security(format!("Invalid Ed25519 public key: {}", e)))?;
    let signature = ed25519_dalek::Signature::from_bytes(&sig_bytes);

    Ok(verifying_key.verify(data, &signature).is_ok())
}

/// ECDSA signatures arrive as `mpint r || mpint s`; the curve crates want
/// fixed-width big-endian scalars.
fn ecdsa_fixed_signature(signature: &[u8], scalar_len: usize) -> FynxResult<Vec<u8>> {
    let mut reader = Reader::new(signature);
    let malformed = |_| FynxError::Security("Malformed ECDSA signature".to_string());
    let r = reader.read_mpint().map_err(malformed)?;
    let s = reader.read_mpint().map_err(malformed)?;
    if r.len() > scalar_len || s.len() > scalar_len {
        return Err(FynxError::Security(
            "ECDSA signature scalar too large".to_string(),
        ));
    }

    let mut fixed = vec![0u8; scalar_len * 2];
    fixed[scalar_len - r.len()..scalar_len].copy_from_slice(r);
    fixed[scalar_len * 2 - s.len()..].copy_from_slice(s);
    Ok(fixed)
}

fn verify_ecdsa(
    algorithm: HostKeyAlgorithm,
    point: &[u8],
    data: &[u8],
    signature: &[u8],
) -> FynxResult<bool> {
    if algorithm == HostKeyAlgorithm::EcdsaSha2Nistp256 {
        let fixed = ecdsa_fixed_signature(signature, 32)?;
        let key = p256::ecdsa::VerifyingKey::from_sec1_bytes(point)
            .map_err(|e| FynxError::Security(format!("Invalid P-256 public key: {}", e)))?;
        let sig = p256::ecdsa::Signature::from_slice(&fixed)
            .map_err(|e| FynxError::Security(format!("Invalid P-256 signature: {}", e)))?;
        Ok(key.verify(data, &sig).is_ok())
    } else {
        let fixed = ecdsa_fixed_signature(signature, 48)?;
        let key = p384::ecdsa::VerifyingKey::from_sec1_bytes(point)
            .map_err(|e| FynxError::Security(format!("Invalid P-384 public key: {}", e)))?;
        let sig = p384::ecdsa::Signature::from_slice(&fixed)
            .map_err(|e| FynxError::Security(format!("Invalid P-384 signature: {}", e)))?;
        Ok(key.verify(data, &sig).is_ok())
    }
}

fn verify_rsa(
    algorithm: HostKeyAlgorithm,
    n: &[u8],
    e: &[u8],
    data: &[u8],
    signature: &[u8],
) -> FynxResult<bool> {
    let params = if algorithm == HostKeyAlgorithm::RsaSha2_512 {
        &RSA_PKCS1_2048_8192_SHA512
    } else {
        &RSA_PKCS1_2048_8192_SHA256
    };

    // Some servers strip leading zero bytes from the signature.
    if signature.len() > n.len() {
        return Ok(false);
    }
    let mut padded = vec![0u8; n.len() - signature.len()];
    padded.extend_from_slice(signature);

    let public_key = RsaPublicKeyComponents { n, e };
    Ok(public_key.verify(params, data, &padded).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use crate::wire::{write_mpint, write_string};
    use ed25519_dalek::Signer;
    use p256::ecdsa::signature::Signer as _;

    fn ed25519_blobs(data: &[u8]) -> (Vec<u8>, Vec<u8>) {
        let signing = ed25519_dalek::SigningKey::from_bytes(&[7u8; 32]);
        let mut key = BytesMut::new();
        write_string(&mut key, b"ssh-ed25519");
        write_string(&mut key, signing.verifying_key().as_bytes());

        let mut sig = BytesMut::new();
        write_string(&mut sig, b"ssh-ed25519");
        write_string(&mut sig, &signing.sign(data).to_bytes());
        (key.to_vec(), sig.to_vec())
    }

    #[test]
    fn test_algorithm_names() {
        for alg in HostKeyAlgorithm::ALL {
            assert_eq!(HostKeyAlgorithm::from_name(alg.name()), Some(alg));
        }
        assert_eq!(HostKeyAlgorithm::RsaSha2_256.key_type(), "ssh-rsa");
        assert_eq!(HostKeyAlgorithm::from_name("ssh-dss"), None);
    }

    #[test]
    fn test_ed25519_verify() {
        let (key, sig) = ed25519_blobs(b"exchange hash");
        assert!(verify_signature(HostKeyAlgorithm::SshEd25519, &key, b"exchange hash", &sig).unwrap());
        assert!(!verify_signature(HostKeyAlgorithm::SshEd25519, &key, b"other hash", &sig).unwrap());
    }

    #[test]
    fn test_algorithm_mismatch_rejected() {
        let (key, sig) = ed25519_blobs(b"h");
        let result = verify_signature(HostKeyAlgorithm::EcdsaSha2Nistp256, &key, b"h", &sig);
        assert!(matches!(result, Err(FynxError::Security(_))));
    }

    #[test]
    fn test_ecdsa_p256_verify() {
        let signing = p256::ecdsa::SigningKey::from_slice(&[0x11u8; 32]).unwrap();
        let point = signing.verifying_key().to_encoded_point(false);

        let mut key = BytesMut::new();
        write_string(&mut key, b"ecdsa-sha2-nistp256");
        write_string(&mut key, b"nistp256");
        write_string(&mut key, point.as_bytes());

        let signature: p256::ecdsa::Signature = signing.sign(b"exchange hash");
        let (r, s) = signature.split_bytes();
        let mut inner = BytesMut::new();
        write_mpint(&mut inner, &r);
        write_mpint(&mut inner, &s);
        let mut sig = BytesMut::new();
        write_string(&mut sig, b"ecdsa-sha2-nistp256");
        write_string(&mut sig, &inner);

        assert!(verify_signature(
            HostKeyAlgorithm::EcdsaSha2Nistp256,
            &key,
            b"exchange hash",
            &sig
        )
        .unwrap());
    }

    #[test]
    fn test_fingerprint_format() {
        let fp = fingerprint_sha256(b"");
        // SHA-256 of the empty string
        assert_eq!(fp, "SHA256:47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU");
    }

    #[test]
    fn test_truncated_key_blob() {
        let result = verify_signature(HostKeyAlgorithm::SshEd25519, &[0, 0, 0], b"h", &[]);
        assert!(matches!(result, Err(FynxError::Security(_))));
    }
}
