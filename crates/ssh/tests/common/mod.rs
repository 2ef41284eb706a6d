//! A scripted SSH server for integration tests.
//!
//! The server runs on its own thread over an in-memory pipe. It performs a
//! real curve25519-sha256 exchange signed with an ed25519 host key and then
//! follows whatever script the test gives it, one packet at a time.

#![allow(dead_code)]

use bytes::{BufMut, BytesMut};
use ed25519_dalek::{Signer, SigningKey};
use fynx_ssh::channel::messages::{
    ChannelOpen, ChannelOpenConfirmation, ChannelOpenFailure, ChannelRequest,
};
use fynx_ssh::config::AlgorithmPreferences;
use fynx_ssh::crypto::{CipherDirection, DefaultCryptoProvider, HashAlgorithm};
use fynx_ssh::kex::method::{exchange_hash, ExchangeContext};
use fynx_ssh::kex::{KexInit, NegotiatedAlgorithms, SessionKeys};
use fynx_ssh::message::Message;
use fynx_ssh::pipeline::PipelineKeys;
use fynx_ssh::version::read_identification;
use fynx_ssh::wire::{encode_mpint, write_string, Reader};
use fynx_ssh::{memory_pair, CipherPipeline, Connection, MemoryStream, PacketCodec, SshClientConfig};
use fynx_platform::FynxResult;
use ring::agreement::{agree_ephemeral, EphemeralPrivateKey, UnparsedPublicKey, X25519};
use ring::rand::SystemRandom;
use std::collections::VecDeque;
use std::io::Write;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub const SERVER_VERSION: &str = "SSH-2.0-FynxScriptedPeer_1.0";

const MAX_PACKET: usize = 256 * 1024;

/// Offset added to client channel ids to form the server's ids.
pub const SERVER_CHANNEL_BASE: u32 = 100;

/// Installs a test-writer subscriber once; `RUST_LOG` selects the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Client configuration that trusts the scripted server.
pub fn client_config() -> SshClientConfig {
    let mut config = SshClientConfig::default();
    config.host_key_verifier = Some(Arc::new(|alg: &str, _: &[u8], fingerprint: &str| {
        alg == "ssh-ed25519" && fingerprint.starts_with("SHA256:")
    }));
    config.handshake_timeout = Duration::from_secs(10);
    config.request_timeout = Some(Duration::from_secs(10));
    config
}

/// Server preferences offering a single cipher.
pub fn server_prefs(cipher: &str) -> AlgorithmPreferences {
    let mut prefs = AlgorithmPreferences::default();
    prefs.ciphers = vec![cipher.to_string()];
    prefs
}

pub fn host_key() -> SigningKey {
    SigningKey::from_bytes(&[7u8; 32])
}

/// Server end of a scripted connection.
pub struct TestServer {
    stream: MemoryStream,
    outbound: CipherPipeline,
    inbound: CipherPipeline,
    prefs: AlgorithmPreferences,
    client_version: String,
    session_id: Option<Vec<u8>>,
    backlog: VecDeque<Vec<u8>>,
    exchanges: usize,
}

impl TestServer {
    pub fn new(stream: MemoryStream, prefs: AlgorithmPreferences) -> Self {
        Self {
            stream,
            outbound: CipherPipeline::plaintext(),
            inbound: CipherPipeline::plaintext(),
            prefs,
            client_version: String::new(),
            session_id: None,
            backlog: VecDeque::new(),
            exchanges: 0,
        }
    }

    /// Exchanges identification strings.
    pub fn identify(&mut self) {
        self.stream
            .write_all(format!("{}\r\n", SERVER_VERSION).as_bytes())
            .unwrap();
        self.client_version = read_identification(&mut self.stream).unwrap();
    }

    pub fn session_id(&self) -> Option<&[u8]> {
        self.session_id.as_deref()
    }

    pub fn exchanges(&self) -> usize {
        self.exchanges
    }

    pub fn stream(&self) -> &MemoryStream {
        &self.stream
    }

    pub fn send(&mut self, payload: &[u8]) {
        let packet = PacketCodec::encode(&mut self.outbound, payload).unwrap();
        self.stream.write_all(&packet).unwrap();
    }

    /// Encodes a packet without writing it.
    pub fn encode(&mut self, payload: &[u8]) -> Vec<u8> {
        PacketCodec::encode(&mut self.outbound, payload).unwrap()
    }

    pub fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).unwrap();
    }

    fn read_packet(&mut self) -> FynxResult<Vec<u8>> {
        PacketCodec::decode(&mut self.inbound, &mut self.stream, MAX_PACKET)
            .map(|packet| packet.payload.to_vec())
    }

    /// Reads the next packet, skipping IGNORE.
    pub fn try_recv(&mut self) -> FynxResult<Vec<u8>> {
        if let Some(payload) = self.backlog.pop_front() {
            return Ok(payload);
        }
        loop {
            let payload = self.read_packet()?;
            if payload[0] != 2 {
                return Ok(payload);
            }
        }
    }

    pub fn recv(&mut self) -> Vec<u8> {
        self.try_recv().unwrap()
    }

    /// Reads the next packet and checks its message number.
    pub fn expect(&mut self, type_byte: u8) -> Vec<u8> {
        let payload = self.recv();
        assert_eq!(
            payload[0], type_byte,
            "expected message {} but got {}",
            type_byte, payload[0]
        );
        payload
    }

    /// Reads the next channel request and returns it.
    pub fn expect_request(&mut self) -> ChannelRequest {
        let payload = self.expect(98);
        ChannelRequest::from_message(&parse(payload)).unwrap()
    }

    /// Runs a full curve25519 exchange. Works whichever side sent KEXINIT
    /// first; non-kex messages read meanwhile are kept for [`recv`].
    ///
    /// [`recv`]: TestServer::recv
    pub fn key_exchange(&mut self) {
        let server_kexinit = KexInit::from_preferences(&self.prefs).to_bytes();
        self.send(&server_kexinit);
        let client_kexinit = self.read_until(20);
        let init = self.read_until(30);

        let client = KexInit::from_bytes(&client_kexinit).unwrap();
        let server = KexInit::from_bytes(&server_kexinit).unwrap();
        let algorithms =
            NegotiatedAlgorithms::negotiate(&client, &server, &DefaultCryptoProvider).unwrap();

        let q_c = Reader::new(&init[1..]).read_string().unwrap().to_vec();
        let rng = SystemRandom::new();
        let private = EphemeralPrivateKey::generate(&X25519, &rng).unwrap();
        let q_s = private.compute_public_key().unwrap();
        let secret = agree_ephemeral(private, &UnparsedPublicKey::new(&X25519, &q_c), |k| {
            encode_mpint(k)
        })
        .unwrap();

        let key = host_key();
        let mut blob = BytesMut::new();
        write_string(&mut blob, b"ssh-ed25519");
        write_string(&mut blob, key.verifying_key().as_bytes());

        let mut values = BytesMut::new();
        write_string(&mut values, &q_c);
        write_string(&mut values, q_s.as_ref());
        let ctx = ExchangeContext {
            client_version: &self.client_version,
            server_version: SERVER_VERSION,
            client_kexinit: &client_kexinit,
            server_kexinit: &server_kexinit,
        };
        let h = exchange_hash(HashAlgorithm::Sha256, &ctx, &blob, &values, &secret);
        let session_id = self.session_id.get_or_insert_with(|| h.clone()).clone();

        let mut signature = BytesMut::new();
        write_string(&mut signature, b"ssh-ed25519");
        write_string(&mut signature, &key.sign(&h).to_bytes());

        let mut reply = BytesMut::new();
        reply.put_u8(31);
        write_string(&mut reply, &blob);
        write_string(&mut reply, q_s.as_ref());
        write_string(&mut reply, &signature);
        self.send(&reply);
        self.send(&[21]);

        let keys = SessionKeys::derive(
            HashAlgorithm::Sha256,
            &secret,
            &h,
            &session_id,
            &algorithms,
            &DefaultCryptoProvider,
        )
        .unwrap();
        let outbound = CipherPipeline::from_keys(
            &DefaultCryptoProvider,
            CipherDirection::Encrypt,
            PipelineKeys {
                cipher: &algorithms.cipher_server_to_client,
                mac: algorithms.mac_server_to_client.as_deref(),
                compression: &algorithms.compression_server_to_client,
                key: &keys.enc_server_to_client,
                iv: &keys.iv_server_to_client,
                mac_key: &keys.mac_server_to_client,
            },
            MAX_PACKET,
        )
        .unwrap();
        self.outbound.install(outbound);

        self.read_until(21);
        let inbound = CipherPipeline::from_keys(
            &DefaultCryptoProvider,
            CipherDirection::Decrypt,
            PipelineKeys {
                cipher: &algorithms.cipher_client_to_server,
                mac: algorithms.mac_client_to_server.as_deref(),
                compression: &algorithms.compression_client_to_server,
                key: &keys.enc_client_to_server,
                iv: &keys.iv_client_to_server,
                mac_key: &keys.mac_client_to_server,
            },
            MAX_PACKET,
        )
        .unwrap();
        self.inbound.install(inbound);
        self.exchanges += 1;
    }

    /// Puts a packet back so the next read or exchange sees it first.
    pub fn unread(&mut self, payload: Vec<u8>) {
        self.backlog.push_front(payload);
    }

    /// Reads until a packet of `type_byte`, keeping anything else.
    fn read_until(&mut self, type_byte: u8) -> Vec<u8> {
        if let Some(pos) = self.backlog.iter().position(|p| p[0] == type_byte) {
            if let Some(payload) = self.backlog.remove(pos) {
                return payload;
            }
        }
        loop {
            let payload = self.read_packet().unwrap();
            match payload[0] {
                t if t == type_byte => return payload,
                2 => {}
                20..=49 => panic!("unexpected kex message {} waiting for {}", payload[0], type_byte),
                _ => self.backlog.push_back(payload),
            }
        }
    }

    /// Answers the next CHANNEL_OPEN with a confirmation. Returns the
    /// client's channel id.
    pub fn confirm_open(&mut self, window: u32, max_packet: u32) -> u32 {
        let open = ChannelOpen::from_message(&parse(self.expect(90))).unwrap();
        self.send(
            &ChannelOpenConfirmation {
                recipient_channel: open.sender_channel,
                sender_channel: SERVER_CHANNEL_BASE + open.sender_channel,
                initial_window: window,
                max_packet,
            }
            .to_bytes(),
        );
        open.sender_channel
    }

    /// Answers the next CHANNEL_OPEN with a failure. Returns the client's
    /// channel id.
    pub fn reject_open(&mut self, reason_code: u32, description: &str) -> u32 {
        let open = ChannelOpen::from_message(&parse(self.expect(90))).unwrap();
        self.send(
            &ChannelOpenFailure {
                recipient_channel: open.sender_channel,
                reason_code,
                description: description.to_string(),
            }
            .to_bytes(),
        );
        open.sender_channel
    }
}

pub fn parse(payload: Vec<u8>) -> Message {
    Message::parse(payload.into(), 0).unwrap()
}

/// Builds an `exit-status` request payload.
pub fn exit_status_payload(recipient: u32, status: u32) -> Vec<u8> {
    let mut data = BytesMut::new();
    data.put_u32(status);
    ChannelRequest {
        recipient_channel: recipient,
        name: "exit-status".to_string(),
        want_reply: false,
        data: data.freeze(),
    }
    .to_bytes()
}

/// Starts a scripted server and completes the client handshake against it.
///
/// The script runs after the first key exchange.
pub fn connect<F>(
    config: SshClientConfig,
    prefs: AlgorithmPreferences,
    script: F,
) -> FynxResult<(Connection, JoinHandle<()>)>
where
    F: FnOnce(TestServer) + Send + 'static,
{
    init_tracing();
    let (client, server_end) = memory_pair();
    let server = thread::spawn(move || {
        let mut server = TestServer::new(server_end, prefs);
        server.identify();
        server.key_exchange();
        script(server);
    });
    let conn = Connection::handshake(Box::new(client), config)?;
    Ok((conn, server))
}

/// Like [`connect`] with the default client config and aes128-ctr.
pub fn connect_default<F>(script: F) -> (Connection, JoinHandle<()>)
where
    F: FnOnce(TestServer) + Send + 'static,
{
    connect(client_config(), server_prefs("aes128-ctr"), script).unwrap()
}
