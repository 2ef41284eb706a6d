//! Packet ciphers.
//!
//! - AES-128-GCM, AES-256-GCM (AEAD, RFC 5647 / OpenSSH naming) via `ring`
//! - AES-128/192/256-CTR (RFC 4344) via `aes` + `ctr`
//! - AES-128/256-CBC (RFC 4253) via `aes` + `cbc`
//! - `none` (used before the first key exchange completes)
//!
//! Each cipher instance is bound to one direction and keeps its own running
//! state (CTR keystream position, CBC chaining block, GCM invocation
//! counter), so it must see every packet of that direction in order.

use aes::{Aes128, Aes192, Aes256};
use cbc::cipher::{generic_array::GenericArray, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use ctr::cipher::StreamCipher;
use fynx_platform::{FynxError, FynxResult};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_128_GCM, AES_256_GCM};

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type Aes192Ctr = ctr::Ctr128BE<Aes192>;
type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Which way a cipher instance transforms data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherDirection {
    /// Outbound packets
    Encrypt,
    /// Inbound packets
    Decrypt,
}

/// A directional packet cipher.
///
/// Non-AEAD ciphers implement [`Cipher::apply`], which transforms whole
/// blocks in place. AEAD ciphers report a non-zero [`Cipher::tag_size`] and
/// implement [`Cipher::seal`] / [`Cipher::open`]; the packet length is then
/// passed as associated data instead of being encrypted.
pub trait Cipher: Send {
    /// Negotiated algorithm name.
    fn name(&self) -> &'static str;

    /// Cipher block size in bytes (8 for `none`).
    fn block_size(&self) -> usize;

    /// Authentication tag size for AEAD ciphers, 0 otherwise.
    fn tag_size(&self) -> usize {
        0
    }

    /// Returns true for AEAD ciphers.
    fn is_aead(&self) -> bool {
        self.tag_size() > 0
    }

    /// Encrypts or decrypts `data` in place (non-AEAD ciphers).
    fn apply(&mut self, data: &mut [u8]) -> FynxResult<()>;

    /// Encrypts `data` in place and returns the tag (AEAD ciphers).
    fn seal(&mut self, _aad: &[u8], _data: &mut [u8]) -> FynxResult<Vec<u8>> {
        Err(FynxError::NotImplemented(format!(
            "{} is not an AEAD cipher",
            self.name()
        )))
    }

    /// Verifies `tag` and decrypts `data` in place (AEAD ciphers).
    ///
    /// # Errors
    ///
    /// Returns [`FynxError::MacVerification`] if the tag does not verify.
    fn open(&mut self, _aad: &[u8], _data: &mut [u8], _tag: &[u8]) -> FynxResult<()> {
        Err(FynxError::NotImplemented(format!(
            "{} is not an AEAD cipher",
            self.name()
        )))
    }
}

/// Cipher algorithms known to the default provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherAlgorithm {
    /// No encryption
    None,
    /// AES-128-GCM AEAD cipher
    Aes128Gcm,
    /// AES-256-GCM AEAD cipher
    Aes256Gcm,
    /// AES-128-CTR stream cipher (requires separate MAC)
    Aes128Ctr,
    /// AES-192-CTR stream cipher (requires separate MAC)
    Aes192Ctr,
    /// AES-256-CTR stream cipher (requires separate MAC)
    Aes256Ctr,
    /// AES-128-CBC block cipher (requires separate MAC)
    Aes128Cbc,
    /// AES-256-CBC block cipher (requires separate MAC)
    Aes256Cbc,
}

impl CipherAlgorithm {
    /// All algorithms, strongest first.
    pub const ALL: [CipherAlgorithm; 8] = [
        CipherAlgorithm::Aes256Gcm,
        CipherAlgorithm::Aes128Gcm,
        CipherAlgorithm::Aes256Ctr,
        CipherAlgorithm::Aes192Ctr,
        CipherAlgorithm::Aes128Ctr,
        CipherAlgorithm::Aes256Cbc,
        CipherAlgorithm::Aes128Cbc,
        CipherAlgorithm::None,
    ];

    /// Returns the algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            CipherAlgorithm::None => "none",
            CipherAlgorithm::Aes128Gcm => "aes128-gcm@openssh.com",
            CipherAlgorithm::Aes256Gcm => "aes256-gcm@openssh.com",
            CipherAlgorithm::Aes128Ctr => "aes128-ctr",
            CipherAlgorithm::Aes192Ctr => "aes192-ctr",
            CipherAlgorithm::Aes256Ctr => "aes256-ctr",
            CipherAlgorithm::Aes128Cbc => "aes128-cbc",
            CipherAlgorithm::Aes256Cbc => "aes256-cbc",
        }
    }

    /// Parses cipher algorithm from name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|alg| alg.name() == name)
    }

    /// Returns the key size in bytes.
    pub fn key_size(&self) -> usize {
        match self {
            CipherAlgorithm::None => 0,
            CipherAlgorithm::Aes128Gcm | CipherAlgorithm::Aes128Ctr | CipherAlgorithm::Aes128Cbc => {
                16
            }
            CipherAlgorithm::Aes192Ctr => 24,
            CipherAlgorithm::Aes256Gcm | CipherAlgorithm::Aes256Ctr | CipherAlgorithm::Aes256Cbc => {
                32
            }
        }
    }

    /// Returns the IV/nonce size in bytes.
    pub fn iv_size(&self) -> usize {
        match self {
            CipherAlgorithm::None => 0,
            CipherAlgorithm::Aes128Gcm | CipherAlgorithm::Aes256Gcm => 12,
            _ => 16,
        }
    }

    /// Returns the block size in bytes.
    pub fn block_size(&self) -> usize {
        match self {
            CipherAlgorithm::None => 8,
            _ => 16,
        }
    }

    /// Returns the authentication tag size in bytes (for AEAD ciphers).
    pub fn tag_size(&self) -> usize {
        if self.is_aead() {
            16
        } else {
            0
        }
    }

    /// Returns true if this is an AEAD cipher.
    pub fn is_aead(&self) -> bool {
        matches!(self, CipherAlgorithm::Aes128Gcm | CipherAlgorithm::Aes256Gcm)
    }

    /// Creates a cipher instance for one direction.
    ///
    /// # Errors
    ///
    /// Returns [`FynxError::Security`] if the key or IV is shorter than
    /// the algorithm requires.
    pub fn create(
        &self,
        direction: CipherDirection,
        key: &[u8],
        iv: &[u8],
    ) -> FynxResult<Box<dyn Cipher>> {
        if key.len() < self.key_size() || iv.len() < self.iv_size() {
            return Err(FynxError::Security(format!(
                "Insufficient key material for {}: need {}+{} bytes, got {}+{}",
                self.name(),
                self.key_size(),
                self.iv_size(),
                key.len(),
                iv.len()
            )));
        }
        let key = &key[..self.key_size()];
        let iv = &iv[..self.iv_size()];
        let bad_len = |_| FynxError::Security(format!("Invalid key length for {}", self.name()));

        let cipher: Box<dyn Cipher> = match self {
            CipherAlgorithm::None => Box::new(NoneCipher),
            CipherAlgorithm::Aes128Gcm | CipherAlgorithm::Aes256Gcm => {
                Box::new(AesGcm::new(*self, key, iv)?)
            }
            CipherAlgorithm::Aes128Ctr => Box::new(AesCtr {
                name: self.name(),
                state: CtrState::Aes128(Aes128Ctr::new_from_slices(key, iv).map_err(bad_len)?),
            }),
            CipherAlgorithm::Aes192Ctr => Box::new(AesCtr {
                name: self.name(),
                state: CtrState::Aes192(Aes192Ctr::new_from_slices(key, iv).map_err(bad_len)?),
            }),
            CipherAlgorithm::Aes256Ctr => Box::new(AesCtr {
                name: self.name(),
                state: CtrState::Aes256(Aes256Ctr::new_from_slices(key, iv).map_err(bad_len)?),
            }),
            CipherAlgorithm::Aes128Cbc => {
                let state = match direction {
                    CipherDirection::Encrypt => CbcState::Encrypt128(
                        cbc::Encryptor::<Aes128>::new_from_slices(key, iv).map_err(bad_len)?,
                    ),
                    CipherDirection::Decrypt => CbcState::Decrypt128(
                        cbc::Decryptor::<Aes128>::new_from_slices(key, iv).map_err(bad_len)?,
                    ),
                };
                Box::new(AesCbc {
                    name: self.name(),
                    state,
                })
            }
            CipherAlgorithm::Aes256Cbc => {
                let state = match direction {
                    CipherDirection::Encrypt => CbcState::Encrypt256(
                        cbc::Encryptor::<Aes256>::new_from_slices(key, iv).map_err(bad_len)?,
                    ),
                    CipherDirection::Decrypt => CbcState::Decrypt256(
                        cbc::Decryptor::<Aes256>::new_from_slices(key, iv).map_err(bad_len)?,
                    ),
                };
                Box::new(AesCbc {
                    name: self.name(),
                    state,
                })
            }
        };

        Ok(cipher)
    }
}

/// Identity cipher used until the first NEWKEYS.
#[derive(Debug, Default)]
pub struct NoneCipher;

impl Cipher for NoneCipher {
    fn name(&self) -> &'static str {
        "none"
    }

    fn block_size(&self) -> usize {
        8
    }

    fn apply(&mut self, _data: &mut [u8]) -> FynxResult<()> {
        Ok(())
    }
}

enum CtrState {
    Aes128(Aes128Ctr),
    Aes192(Aes192Ctr),
    Aes256(Aes256Ctr),
}

struct AesCtr {
    name: &'static str,
    state: CtrState,
}

impl Cipher for AesCtr {
    fn name(&self) -> &'static str {
        self.name
    }

    fn block_size(&self) -> usize {
        16
    }

    fn apply(&mut self, data: &mut [u8]) -> FynxResult<()> {
        match &mut self.state {
            CtrState::Aes128(c) => c.apply_keystream(data),
            CtrState::Aes192(c) => c.apply_keystream(data),
            CtrState::Aes256(c) => c.apply_keystream(data),
        }
        Ok(())
    }
}

enum CbcState {
    Encrypt128(cbc::Encryptor<Aes128>),
    Decrypt128(cbc::Decryptor<Aes128>),
    Encrypt256(cbc::Encryptor<Aes256>),
    Decrypt256(cbc::Decryptor<Aes256>),
}

struct AesCbc {
    name: &'static str,
    state: CbcState,
}

impl Cipher for AesCbc {
    fn name(&self) -> &'static str {
        self.name
    }

    fn block_size(&self) -> usize {
        16
    }

    fn apply(&mut self, data: &mut [u8]) -> FynxResult<()> {
        if data.len() % 16 != 0 {
            return Err(FynxError::Protocol(format!(
                "CBC input of {} bytes is not block aligned",
                data.len()
            )));
        }
        for block in data.chunks_exact_mut(16) {
            let block = GenericArray::from_mut_slice(block);
            match &mut self.state {
                CbcState::Encrypt128(c) => c.encrypt_block_mut(block),
                CbcState::Decrypt128(c) => c.decrypt_block_mut(block),
                CbcState::Encrypt256(c) => c.encrypt_block_mut(block),
                CbcState::Decrypt256(c) => c.decrypt_block_mut(block),
            }
        }
        Ok(())
    }
}

/// AES-GCM as used by `aes*-gcm@openssh.com`.
///
/// The 12-byte nonce is a 4-byte fixed field followed by a 64-bit
/// invocation counter that starts at the derived IV value and increments
/// once per packet (RFC 5647 Section 7.1).
struct AesGcm {
    name: &'static str,
    key: LessSafeKey,
    fixed: [u8; 4],
    invocation_counter: u64,
}

impl AesGcm {
    fn new(algorithm: CipherAlgorithm, key: &[u8], iv: &[u8]) -> FynxResult<Self> {
        let ring_alg = match algorithm {
            CipherAlgorithm::Aes128Gcm => &AES_128_GCM,
            _ => &AES_256_GCM,
        };
        let unbound = UnboundKey::new(ring_alg, key)
            .map_err(|_| FynxError::Security("Failed to create AES-GCM key".to_string()))?;

        let mut fixed = [0u8; 4];
        fixed.copy_from_slice(&iv[..4]);
        let mut counter = [0u8; 8];
        counter.copy_from_slice(&iv[4..12]);

        Ok(Self {
            name: algorithm.name(),
            key: LessSafeKey::new(unbound),
            fixed,
            invocation_counter: u64::from_be_bytes(counter),
        })
    }

    fn next_nonce(&mut self) -> Nonce {
        let mut nonce = [0u8; 12];
        nonce[..4].copy_from_slice(&self.fixed);
        nonce[4..].copy_from_slice(&self.invocation_counter.to_be_bytes());
        self.invocation_counter = self.invocation_counter.wrapping_add(1);
        Nonce::assume_unique_for_key(nonce)
    }
}

impl Cipher for AesGcm {
    fn name(&self) -> &'static str {
        self.name
    }

    fn block_size(&self) -> usize {
        16
    }

    fn tag_size(&self) -> usize {
        16
    }

    fn apply(&mut self, _data: &mut [u8]) -> FynxResult<()> {
        Err(FynxError::Protocol(format!(
            "{} must be used through seal/open",
            self.name
        )))
    }

    fn seal(&mut self, aad: &[u8], data: &mut [u8]) -> FynxResult<Vec<u8>> {
        let nonce = self.next_nonce();
        let tag = self
            .key
            .seal_in_place_separate_tag(nonce, Aad::from(aad), data)
            .map_err(|_| FynxError::Security("AES-GCM encryption failed".to_string()))?;
        Ok(tag.as_ref().to_vec())
    }

    fn open(&mut self, aad: &[u8], data: &mut [u8], tag: &[u8]) -> FynxResult<()> {
        let nonce = self.next_nonce();
        let mut in_out = Vec::with_capacity(data.len() + tag.len());
        in_out.extend_from_slice(data);
        in_out.extend_from_slice(tag);

        let plaintext = self
            .key
            .open_in_place(nonce, Aad::from(aad), &mut in_out)
            .map_err(|_| FynxError::MacVerification)?;
        data.copy_from_slice(plaintext);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(alg: CipherAlgorithm) -> (Box<dyn Cipher>, Box<dyn Cipher>) {
        let key = vec![0x42u8; 32];
        let iv = vec![0x24u8; 16];
        (
            alg.create(CipherDirection::Encrypt, &key, &iv).unwrap(),
            alg.create(CipherDirection::Decrypt, &key, &iv).unwrap(),
        )
    }

    #[test]
    fn test_cipher_algorithm_names() {
        for alg in CipherAlgorithm::ALL {
            assert_eq!(CipherAlgorithm::from_name(alg.name()), Some(alg));
        }
        assert_eq!(CipherAlgorithm::from_name("3des-cbc"), None);
    }

    #[test]
    fn test_ctr_stream_continues_across_packets() {
        let (mut enc, mut dec) = pair(CipherAlgorithm::Aes128Ctr);
        let mut first = b"0123456789abcdef".to_vec();
        let mut second = b"fedcba9876543210".to_vec();
        enc.apply(&mut first).unwrap();
        enc.apply(&mut second).unwrap();

        dec.apply(&mut first).unwrap();
        dec.apply(&mut second).unwrap();
        assert_eq!(first, b"0123456789abcdef");
        assert_eq!(second, b"fedcba9876543210");
    }

    #[test]
    fn test_cbc_roundtrip_and_alignment() {
        let (mut enc, mut dec) = pair(CipherAlgorithm::Aes256Cbc);
        let mut data = [7u8; 32];
        enc.apply(&mut data).unwrap();
        assert_ne!(data, [7u8; 32]);
        dec.apply(&mut data).unwrap();
        assert_eq!(data, [7u8; 32]);

        let mut unaligned = [0u8; 15];
        assert!(enc.apply(&mut unaligned).is_err());
    }

    #[test]
    fn test_gcm_seal_open() {
        let (mut enc, mut dec) = pair(CipherAlgorithm::Aes256Gcm);
        let aad = 28u32.to_be_bytes();
        let mut data = b"padding+payload+padding.....".to_vec();
        let original = data.clone();

        let tag = enc.seal(&aad, &mut data).unwrap();
        assert_eq!(tag.len(), 16);
        assert_ne!(data, original);

        dec.open(&aad, &mut data, &tag).unwrap();
        assert_eq!(data, original);
    }

    #[test]
    fn test_gcm_rejects_modified_tag() {
        let (mut enc, mut dec) = pair(CipherAlgorithm::Aes128Gcm);
        let aad = 16u32.to_be_bytes();
        let mut data = [1u8; 16];
        let mut tag = enc.seal(&aad, &mut data).unwrap();
        tag[0] ^= 0xff;

        let result = dec.open(&aad, &mut data, &tag);
        assert!(matches!(result, Err(FynxError::MacVerification)));
    }

    #[test]
    fn test_gcm_nonce_advances() {
        let (mut enc, _) = pair(CipherAlgorithm::Aes128Gcm);
        let mut a = [0u8; 16];
        let mut b = [0u8; 16];
        enc.seal(&[], &mut a).unwrap();
        enc.seal(&[], &mut b).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_short_key_rejected() {
        let result = CipherAlgorithm::Aes256Ctr.create(CipherDirection::Encrypt, &[0u8; 16], &[0u8; 16]);
        assert!(matches!(result, Err(FynxError::Security(_))));
    }
}
