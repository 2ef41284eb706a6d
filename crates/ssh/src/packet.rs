//! SSH binary packet protocol (RFC 4253 Section 6).
//!
//! # Packet Format
//!
//! ```text
//! uint32    packet_length
//! byte      padding_length
//! byte[n1]  payload (n1 = packet_length - padding_length - 1)
//! byte[n2]  random padding (n2 = padding_length)
//! byte[m]   mac (MAC = Message Authentication Code)
//! ```
//!
//! # Constraints
//!
//! - `packet_length` does NOT include `mac` or the length field itself
//! - `padding_length` is between 4 and `block_size + 3`
//! - Non-AEAD ciphers: `4 + packet_length` is a multiple of
//!   `max(block_size, 8)`; everything but the MAC is encrypted
//! - AEAD ciphers (RFC 5647): the length field is sent in the clear as
//!   associated data and `packet_length` itself is a multiple of the block
//!   size; the tag takes the place of the MAC
//! - Inbound packets longer than the configured maximum are rejected
//!
//! # Security
//!
//! - **Random Padding**: cryptographically secure RNG
//! - **MAC Verification**: the MAC (or AEAD tag) is checked before any
//!   field other than the length is interpreted
//! - **Size Validation**: the length is bounded before the body is read
//!
//! # Example
//!
//! ```rust
//! use fynx_ssh::packet::PacketCodec;
//! use fynx_ssh::pipeline::CipherPipeline;
//!
//! let mut outbound = CipherPipeline::plaintext();
//! let mut inbound = CipherPipeline::plaintext();
//!
//! let wire = PacketCodec::encode(&mut outbound, b"\x02hello").unwrap();
//! assert_eq!(wire.len() % 8, 0);
//!
//! let packet = PacketCodec::decode(&mut inbound, &mut &wire[..], 35000).unwrap();
//! assert_eq!(&packet.payload[..], b"\x02hello");
//! assert_eq!(packet.sequence, 0);
//! ```

use crate::pipeline::CipherPipeline;
use crate::transport::TransportReader;
use bytes::Bytes;
use fynx_platform::{FynxError, FynxResult};
use rand::RngCore;
use std::io::{ErrorKind, Read, Write};
use std::time::Instant;
use tracing::trace;

/// Minimum padding length in bytes (RFC 4253 Section 6).
pub const MIN_PADDING_LEN: usize = 4;

/// Smallest valid `packet_length`: padding length byte, one payload byte
/// and the minimum padding.
const MIN_PACKET_LENGTH: usize = 1 + 1 + MIN_PADDING_LEN;

/// A decoded inbound packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundPacket {
    /// Decrypted, decompressed payload
    pub payload: Bytes,
    /// Sequence number the packet was received with
    pub sequence: u32,
}

/// Frames and deframes packets with a [`CipherPipeline`].
///
/// The codec has no protocol knowledge: it never looks at the message
/// number.
#[derive(Debug, Clone, Copy, Default)]
pub struct PacketCodec;

impl PacketCodec {
    /// Encodes one payload into its wire form and advances the pipeline.
    pub fn encode(pipeline: &mut CipherPipeline, payload: &[u8]) -> FynxResult<Vec<u8>> {
        let compressed = pipeline.compress(payload)?;
        let payload = compressed.as_deref().unwrap_or(payload);

        let aead = pipeline.is_aead();
        let block = if aead {
            pipeline.block_size()
        } else {
            pipeline.block_size().max(8)
        };
        let unpadded = if aead { 1 + payload.len() } else { 5 + payload.len() };
        let mut padding_len = block - unpadded % block;
        if padding_len < MIN_PADDING_LEN {
            padding_len += block;
        }

        let packet_length = 1 + payload.len() + padding_len;
        let length_field = u32::try_from(packet_length).map_err(|_| {
            FynxError::Protocol(format!("Payload of {} bytes is too large", payload.len()))
        })?;

        let mut frame = Vec::with_capacity(4 + packet_length + pipeline.mac_len());
        frame.extend_from_slice(&length_field.to_be_bytes());
        frame.push(padding_len as u8);
        frame.extend_from_slice(payload);
        let padding_start = frame.len();
        frame.resize(padding_start + padding_len, 0);
        rand::thread_rng().fill_bytes(&mut frame[padding_start..]);

        let sequence = pipeline.sequence();
        if aead {
            let (length, body) = frame.split_at_mut(4);
            let tag = pipeline.cipher_mut().seal(length, body)?;
            frame.extend_from_slice(&tag);
        } else {
            let mac = match pipeline.mac() {
                Some(mac) => Some(mac.compute(sequence, &frame)?),
                None => None,
            };
            pipeline.cipher_mut().apply(&mut frame)?;
            if let Some(mac) = mac {
                frame.extend_from_slice(&mac);
            }
        }

        pipeline.record(frame.len());
        trace!(
            sequence,
            payload_len = payload.len(),
            wire_len = frame.len(),
            "Encoded packet"
        );
        Ok(frame)
    }

    /// Reads and decodes exactly one packet from `reader`.
    ///
    /// # Errors
    ///
    /// - [`FynxError::Protocol`] for a bad length or padding
    /// - [`FynxError::MacVerification`] if the MAC or AEAD tag is wrong
    /// - [`FynxError::UnexpectedTermination`] if the stream ends or fails
    pub fn decode<R: Read + ?Sized>(
        pipeline: &mut CipherPipeline,
        reader: &mut R,
        max_packet_len: usize,
    ) -> FynxResult<InboundPacket> {
        let sequence = pipeline.sequence();
        let mac_len = pipeline.mac_len();

        let (body, wire_len) = if pipeline.is_aead() {
            let block = pipeline.block_size();
            let mut length = [0u8; 4];
            read_exact(reader, &mut length)?;
            let packet_length = check_length(u32::from_be_bytes(length), max_packet_len)?;
            if packet_length % block != 0 {
                return Err(FynxError::Protocol(format!(
                    "Packet length {} is not a multiple of the block size {}",
                    packet_length, block
                )));
            }

            let mut body = vec![0u8; packet_length + mac_len];
            read_exact(reader, &mut body)?;
            let (data, tag) = body.split_at_mut(packet_length);
            pipeline.cipher_mut().open(&length, data, tag)?;
            body.truncate(packet_length);
            (body, 4 + packet_length + mac_len)
        } else {
            let block = pipeline.block_size().max(8);
            let mut frame = vec![0u8; block];
            read_exact(reader, &mut frame)?;
            pipeline.cipher_mut().apply(&mut frame)?;

            let length = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
            let packet_length = check_length(length, max_packet_len)?;
            if (4 + packet_length) % block != 0 || 4 + packet_length < block {
                return Err(FynxError::Protocol(format!(
                    "Packet length {} is not aligned to the block size {}",
                    packet_length, block
                )));
            }

            frame.resize(4 + packet_length, 0);
            read_exact(reader, &mut frame[block..])?;
            pipeline.cipher_mut().apply(&mut frame[block..])?;

            if let Some(mac) = pipeline.mac() {
                let mut received = vec![0u8; mac.mac_len()];
                read_exact(reader, &mut received)?;
                mac.verify(sequence, &frame, &received)?;
            }
            frame.drain(..4);
            (frame, 4 + packet_length + mac_len)
        };

        let padding_len = body[0] as usize;
        if padding_len < MIN_PADDING_LEN || padding_len + 1 >= body.len() {
            return Err(FynxError::Protocol(format!(
                "Invalid padding length {} for packet length {}",
                padding_len,
                body.len()
            )));
        }
        let payload = &body[1..body.len() - padding_len];
        let payload = match pipeline.decompress(payload)? {
            Some(decompressed) => Bytes::from(decompressed),
            None => Bytes::copy_from_slice(payload),
        };

        pipeline.record(wire_len);
        trace!(sequence, payload_len = payload.len(), wire_len, "Decoded packet");
        Ok(InboundPacket { payload, sequence })
    }
}

fn check_length(length: u32, max_packet_len: usize) -> FynxResult<usize> {
    let length = length as usize;
    if length < MIN_PACKET_LENGTH {
        return Err(FynxError::Protocol(format!(
            "Packet length {} is too small",
            length
        )));
    }
    if length > max_packet_len {
        return Err(FynxError::Protocol(format!(
            "Packet length {} exceeds maximum {}",
            length, max_packet_len
        )));
    }
    Ok(length)
}

fn read_exact<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> FynxResult<()> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        ErrorKind::UnexpectedEof => {
            FynxError::UnexpectedTermination("Connection closed by peer".to_string())
        }
        ErrorKind::TimedOut | ErrorKind::WouldBlock => {
            FynxError::Timeout("Timed out reading from the transport".to_string())
        }
        _ => FynxError::UnexpectedTermination(format!("Transport read failed: {}", e)),
    })
}

/// The read half of a connection: a byte stream plus the inbound
/// pipeline.
pub struct PacketReader {
    reader: Box<dyn TransportReader>,
    pipeline: CipherPipeline,
    max_packet_len: usize,
}

impl std::fmt::Debug for PacketReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketReader")
            .field("pipeline", &self.pipeline)
            .field("max_packet_len", &self.max_packet_len)
            .finish_non_exhaustive()
    }
}

impl PacketReader {
    /// Wraps a stream, starting with the plaintext pipeline.
    pub fn new(reader: Box<dyn TransportReader>, max_packet_len: usize) -> Self {
        Self {
            reader,
            pipeline: CipherPipeline::plaintext(),
            max_packet_len,
        }
    }

    /// Waits for the start of the next packet until `deadline`. Returns
    /// false if nothing arrived in time; the stream is left untouched.
    pub fn wait_readable(&mut self, deadline: Option<Instant>) -> FynxResult<bool> {
        self.reader
            .wait_readable(deadline)
            .map_err(|e| FynxError::UnexpectedTermination(format!("Transport read failed: {}", e)))
    }

    /// Blocks until one whole packet has been read.
    pub fn read_packet(&mut self) -> FynxResult<InboundPacket> {
        PacketCodec::decode(&mut self.pipeline, &mut self.reader, self.max_packet_len)
    }

    /// Switches to new inbound keys.
    pub fn install(&mut self, next: CipherPipeline) {
        self.pipeline.install(next);
    }

    /// Returns the inbound pipeline.
    pub fn pipeline(&self) -> &CipherPipeline {
        &self.pipeline
    }

    /// Returns the inbound pipeline mutably.
    pub fn pipeline_mut(&mut self) -> &mut CipherPipeline {
        &mut self.pipeline
    }
}

/// The write half of a connection: a byte stream plus the outbound
/// pipeline.
pub struct PacketWriter {
    writer: Box<dyn Write + Send>,
    pipeline: CipherPipeline,
}

impl std::fmt::Debug for PacketWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketWriter")
            .field("pipeline", &self.pipeline)
            .finish_non_exhaustive()
    }
}

impl PacketWriter {
    /// Wraps a stream, starting with the plaintext pipeline.
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer,
            pipeline: CipherPipeline::plaintext(),
        }
    }

    /// Encodes and writes one packet.
    pub fn write_packet(&mut self, payload: &[u8]) -> FynxResult<()> {
        let wire = PacketCodec::encode(&mut self.pipeline, payload)?;
        self.writer
            .write_all(&wire)
            .and_then(|_| self.writer.flush())
            .map_err(|e| FynxError::UnexpectedTermination(format!("Transport write failed: {}", e)))
    }

    /// Switches to new outbound keys.
    pub fn install(&mut self, next: CipherPipeline) {
        self.pipeline.install(next);
    }

    /// Returns the outbound pipeline.
    pub fn pipeline(&self) -> &CipherPipeline {
        &self.pipeline
    }

    /// Returns the outbound pipeline mutably.
    pub fn pipeline_mut(&mut self) -> &mut CipherPipeline {
        &mut self.pipeline
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{CipherDirection, DefaultCryptoProvider};
    use crate::pipeline::PipelineKeys;
    use proptest::prelude::*;

    const MAX: usize = 256 * 1024;

    fn pipeline(
        cipher: &str,
        mac: &str,
        compression: &str,
        direction: CipherDirection,
    ) -> CipherPipeline {
        CipherPipeline::from_keys(
            &DefaultCryptoProvider,
            direction,
            PipelineKeys {
                cipher,
                mac: Some(mac),
                compression,
                key: &[0x11; 32],
                iv: &[0x22; 16],
                mac_key: &[0x33; 64],
            },
            MAX,
        )
        .unwrap()
    }

    fn pair(cipher: &str, mac: &str, compression: &str) -> (CipherPipeline, CipherPipeline) {
        (
            pipeline(cipher, mac, compression, CipherDirection::Encrypt),
            pipeline(cipher, mac, compression, CipherDirection::Decrypt),
        )
    }

    #[test]
    fn test_plaintext_framing() {
        let mut out = CipherPipeline::plaintext();
        for len in 0..64 {
            let wire = PacketCodec::encode(&mut out, &vec![7u8; len + 1]).unwrap();
            assert_eq!(wire.len() % 8, 0);
            let padding = wire[4] as usize;
            assert!((4..=8 + 3).contains(&padding));
            let packet_length = u32::from_be_bytes([wire[0], wire[1], wire[2], wire[3]]) as usize;
            assert_eq!(packet_length, 1 + len + 1 + padding);
        }
    }

    #[test]
    fn test_ctr_hmac_roundtrip() {
        let (mut out, mut inp) = pair("aes128-ctr", "hmac-sha2-256", "none");
        let mut wire = Vec::new();
        for i in 0..5u8 {
            wire.extend(PacketCodec::encode(&mut out, &[94, i, i, i]).unwrap());
        }
        let mut cursor = &wire[..];
        for i in 0..5u8 {
            let packet = PacketCodec::decode(&mut inp, &mut cursor, MAX).unwrap();
            assert_eq!(&packet.payload[..], &[94, i, i, i]);
            assert_eq!(packet.sequence, i as u32);
        }
        assert!(cursor.is_empty());
    }

    #[test]
    fn test_gcm_length_is_aad() {
        let (mut out, mut inp) = pair("aes256-gcm@openssh.com", "hmac-sha2-256", "none");
        let wire = PacketCodec::encode(&mut out, b"\x5ehello gcm").unwrap();

        let packet_length = u32::from_be_bytes([wire[0], wire[1], wire[2], wire[3]]) as usize;
        assert_eq!(packet_length % 16, 0);
        assert_eq!(wire.len(), 4 + packet_length + 16);

        let packet = PacketCodec::decode(&mut inp, &mut &wire[..], MAX).unwrap();
        assert_eq!(&packet.payload[..], b"\x5ehello gcm");
    }

    #[test]
    fn test_cbc_and_zlib_roundtrip() {
        let (mut out, mut inp) = pair("aes256-cbc", "hmac-sha1", "zlib");
        let payload = vec![b'z'; 5000];
        let wire = PacketCodec::encode(&mut out, &payload).unwrap();
        assert!(wire.len() < payload.len());
        let packet = PacketCodec::decode(&mut inp, &mut &wire[..], MAX).unwrap();
        assert_eq!(&packet.payload[..], &payload[..]);
    }

    #[test]
    fn test_corrupted_mac_rejected() {
        let (mut out, mut inp) = pair("aes128-ctr", "hmac-sha2-512", "none");
        let mut wire = PacketCodec::encode(&mut out, b"\x5eintegrity").unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 0x01;
        let result = PacketCodec::decode(&mut inp, &mut &wire[..], MAX);
        assert!(matches!(result, Err(FynxError::MacVerification)));
    }

    #[test]
    fn test_corrupted_ciphertext_rejected() {
        let (mut out, mut inp) = pair("aes128-gcm@openssh.com", "none", "none");
        let mut wire = PacketCodec::encode(&mut out, b"\x5eintegrity").unwrap();
        wire[8] ^= 0x80;
        let result = PacketCodec::decode(&mut inp, &mut &wire[..], MAX);
        assert!(matches!(result, Err(FynxError::MacVerification)));
    }

    #[test]
    fn test_oversized_packet_rejected() {
        let mut out = CipherPipeline::plaintext();
        let wire = PacketCodec::encode(&mut out, &vec![0u8; 40_000]).unwrap();
        let mut inp = CipherPipeline::plaintext();
        match PacketCodec::decode(&mut inp, &mut &wire[..], 35_000) {
            Err(FynxError::Protocol(msg)) => assert!(msg.contains("exceeds maximum")),
            other => panic!("Expected Protocol error, got {:?}", other),
        }
    }

    #[test]
    fn test_zero_length_rejected() {
        let wire = [0u8; 16];
        let mut inp = CipherPipeline::plaintext();
        assert!(matches!(
            PacketCodec::decode(&mut inp, &mut &wire[..], MAX),
            Err(FynxError::Protocol(_))
        ));
    }

    #[test]
    fn test_bad_padding_rejected() {
        // packet_length 12, padding_length 2
        let mut wire = vec![0, 0, 0, 12, 2];
        wire.extend_from_slice(&[1u8; 11]);
        let mut inp = CipherPipeline::plaintext();
        match PacketCodec::decode(&mut inp, &mut &wire[..], MAX) {
            Err(FynxError::Protocol(msg)) => assert!(msg.contains("padding")),
            other => panic!("Expected Protocol error, got {:?}", other),
        }
    }

    #[test]
    fn test_truncated_stream() {
        let mut out = CipherPipeline::plaintext();
        let wire = PacketCodec::encode(&mut out, b"\x02truncated").unwrap();
        let mut inp = CipherPipeline::plaintext();
        let result = PacketCodec::decode(&mut inp, &mut &wire[..wire.len() - 3], MAX);
        assert!(matches!(result, Err(FynxError::UnexpectedTermination(_))));
    }

    #[test]
    fn test_sequence_survives_install() {
        let mut out = CipherPipeline::plaintext();
        let mut inp = CipherPipeline::plaintext();
        let mut wire = PacketCodec::encode(&mut out, b"\x15").unwrap();
        PacketCodec::decode(&mut inp, &mut &wire[..], MAX).unwrap();

        let (next_out, next_in) = pair("aes192-ctr", "hmac-sha2-256", "none");
        out.install(next_out);
        inp.install(next_in);

        wire = PacketCodec::encode(&mut out, b"\x5eafter").unwrap();
        let packet = PacketCodec::decode(&mut inp, &mut &wire[..], MAX).unwrap();
        assert_eq!(packet.sequence, 1);
        assert_eq!(&packet.payload[..], b"\x5eafter");
    }

    #[test]
    fn test_writer_reader_halves() {
        let mut writer = PacketWriter::new(Box::new(Vec::new()));
        writer.write_packet(b"\x02ping").unwrap();
        assert_eq!(writer.pipeline().sequence(), 1);

        let mut out = CipherPipeline::plaintext();
        let wire = PacketCodec::encode(&mut out, b"\x02pong").unwrap();
        let mut reader = PacketReader::new(Box::new(std::io::Cursor::new(wire)), MAX);
        let packet = reader.read_packet().unwrap();
        assert_eq!(&packet.payload[..], b"\x02pong");
        assert_eq!(reader.pipeline().packets_since_rekey(), 1);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_roundtrip_any_payload(
            payload in proptest::collection::vec(any::<u8>(), 1..4096),
            suite in 0usize..5,
        ) {
            let (cipher, mac, compression) = [
                ("none", "none", "none"),
                ("aes128-ctr", "hmac-sha2-256", "none"),
                ("aes256-ctr", "hmac-sha1", "zlib"),
                ("aes128-cbc", "hmac-sha2-512", "none"),
                ("aes256-gcm@openssh.com", "none", "zlib"),
            ][suite];
            let (mut out, mut inp) = pair(cipher, mac, compression);

            let wire = PacketCodec::encode(&mut out, &payload).unwrap();
            let packet = PacketCodec::decode(&mut inp, &mut &wire[..], MAX).unwrap();
            prop_assert_eq!(&packet.payload[..], &payload[..]);
            prop_assert_eq!(out.sequence(), inp.sequence());
        }
    }
}
