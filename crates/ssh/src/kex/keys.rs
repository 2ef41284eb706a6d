//! Session key derivation (RFC 4253 Section 7.2).

use super::NegotiatedAlgorithms;
use crate::crypto::{CryptoProvider, HashAlgorithm};
use fynx_platform::{FynxError, FynxResult};
use zeroize::Zeroizing;

/// Derives one key from the exchange output.
///
/// # Key Derivation
///
/// ```text
/// Initial IV client to server:     HASH(K || H || "A" || session_id)
/// Initial IV server to client:     HASH(K || H || "B" || session_id)
/// Encryption key client to server: HASH(K || H || "C" || session_id)
/// Encryption key server to client: HASH(K || H || "D" || session_id)
/// Integrity key client to server:  HASH(K || H || "E" || session_id)
/// Integrity key server to client:  HASH(K || H || "F" || session_id)
/// ```
///
/// Longer keys are extended with `K2 = HASH(K || H || K1)`,
/// `K3 = HASH(K || H || K1 || K2)` and so on.
///
/// `shared_secret` must already be encoded as an mpint.
///
/// # Example
///
/// ```rust
/// use fynx_ssh::crypto::HashAlgorithm;
/// use fynx_ssh::kex::derive_key;
///
/// let k = [0, 0, 0, 1, 0x42];
/// let key = derive_key(HashAlgorithm::Sha256, &k, &[1; 32], &[2; 32], b'C', 64);
/// assert_eq!(key.len(), 64);
/// ```
pub fn derive_key(
    hash: HashAlgorithm,
    shared_secret: &[u8],
    exchange_hash: &[u8],
    session_id: &[u8],
    letter: u8,
    length: usize,
) -> Zeroizing<Vec<u8>> {
    let mut key = Zeroizing::new(hash.digest(&[
        shared_secret,
        exchange_hash,
        &[letter][..],
        session_id,
    ]));

    while key.len() < length {
        let block = hash.digest(&[shared_secret, exchange_hash, &key[..]]);
        key.extend_from_slice(&block);
    }

    key.truncate(length);
    key
}

/// The six derived values for one key exchange.
pub struct SessionKeys {
    /// Initial IV client to server ("A")
    pub iv_client_to_server: Zeroizing<Vec<u8>>,
    /// Initial IV server to client ("B")
    pub iv_server_to_client: Zeroizing<Vec<u8>>,
    /// Encryption key client to server ("C")
    pub enc_client_to_server: Zeroizing<Vec<u8>>,
    /// Encryption key server to client ("D")
    pub enc_server_to_client: Zeroizing<Vec<u8>>,
    /// Integrity key client to server ("E")
    pub mac_client_to_server: Zeroizing<Vec<u8>>,
    /// Integrity key server to client ("F")
    pub mac_server_to_client: Zeroizing<Vec<u8>>,
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKeys").finish_non_exhaustive()
    }
}

impl SessionKeys {
    /// Derives every key with the lengths the negotiated algorithms need.
    pub fn derive(
        hash: HashAlgorithm,
        shared_secret: &[u8],
        exchange_hash: &[u8],
        session_id: &[u8],
        algorithms: &NegotiatedAlgorithms,
        provider: &dyn CryptoProvider,
    ) -> FynxResult<Self> {
        let cipher_c2s = provider
            .cipher_spec(&algorithms.cipher_client_to_server)
            .ok_or_else(|| missing("cipher", &algorithms.cipher_client_to_server))?;
        let cipher_s2c = provider
            .cipher_spec(&algorithms.cipher_server_to_client)
            .ok_or_else(|| missing("cipher", &algorithms.cipher_server_to_client))?;
        let mac_len = |name: &Option<String>| -> FynxResult<usize> {
            match name {
                Some(name) => provider
                    .mac_spec(name)
                    .map(|spec| spec.key_len)
                    .ok_or_else(|| missing("mac", name)),
                None => Ok(0),
            }
        };
        let mac_c2s = mac_len(&algorithms.mac_client_to_server)?;
        let mac_s2c = mac_len(&algorithms.mac_server_to_client)?;

        let derive = |letter: u8, len: usize| {
            derive_key(hash, shared_secret, exchange_hash, session_id, letter, len)
        };

        Ok(Self {
            iv_client_to_server: derive(b'A', cipher_c2s.iv_len),
            iv_server_to_client: derive(b'B', cipher_s2c.iv_len),
            enc_client_to_server: derive(b'C', cipher_c2s.key_len),
            enc_server_to_client: derive(b'D', cipher_s2c.key_len),
            mac_client_to_server: derive(b'E', mac_c2s),
            mac_server_to_client: derive(b'F', mac_s2c),
        })
    }
}

fn missing(category: &str, name: &str) -> FynxError {
    FynxError::UnsupportedAlgorithm {
        category: category.to_string(),
        local: Vec::new(),
        remote: vec![name.to_string()],
    }
}
