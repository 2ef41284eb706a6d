//! Key exchange state machine (RFC 4253 Sections 7-9).
//!
//! The coordinator runs both the initial handshake and every rekey:
//!
//! ```text
//! Idle ──KEXINIT──▶ Negotiating ──method start──▶ Exchanging
//!                                                    │
//!                                  method complete   ▼
//! Keyed ◀──peer NEWKEYS── KeyedAwaitingPeer ◀──NEWKEYS── Verifying
//!   │
//!   └──KEXINIT (either side)──▶ Negotiating ...
//! ```
//!
//! It never touches the stream itself. Everything it needs from the
//! connection goes through [`KexTransport`]: sending payloads, holding
//! outbound application traffic, and switching each direction to new keys
//! at the right packet boundary.

use super::{
    guess_was_wrong, KexInit, KexMethod, KexOutput, KexStep, NegotiatedAlgorithms, SessionKeys,
};
use crate::config::{AlgorithmPreferences, HostKeyVerifier, SshClientConfig};
use crate::crypto::{fingerprint_sha256, CipherDirection, CryptoProvider};
use crate::kex::method::ExchangeContext;
use crate::lock;
use crate::message::{is_kex_method, Message, MessageType};
use crate::pipeline::{CipherPipeline, PipelineKeys};
use fynx_platform::{FynxError, FynxResult};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Key exchange state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KexState {
    /// No key exchange has started yet.
    Idle,
    /// At least one KEXINIT has been exchanged; waiting for the peer's.
    Negotiating,
    /// The negotiated method is running.
    Exchanging,
    /// Checking the host key and its signature.
    Verifying,
    /// Our NEWKEYS is sent and outbound keys are switched.
    KeyedAwaitingPeer,
    /// Both directions use the keys of the last completed exchange.
    Keyed,
}

impl KexState {
    /// Returns true between the first KEXINIT and the peer's NEWKEYS.
    pub fn in_progress(&self) -> bool {
        !matches!(self, KexState::Idle | KexState::Keyed)
    }
}

/// What the coordinator needs from the connection.
pub trait KexTransport {
    /// Sends a transport-layer payload immediately.
    fn send_payload(&mut self, payload: &[u8]) -> FynxResult<()>;

    /// Starts queueing outbound non-transport payloads.
    fn hold_outbound(&mut self);

    /// Sends SSH_MSG_NEWKEYS and switches the outbound pipeline, with no
    /// packet in between.
    fn switch_outbound(&mut self, pipeline: CipherPipeline) -> FynxResult<()>;

    /// Switches the inbound pipeline; the next packet read uses it.
    fn switch_inbound(&mut self, pipeline: CipherPipeline) -> FynxResult<()>;

    /// Flushes payloads queued while holding.
    fn release_outbound(&mut self) -> FynxResult<()>;
}

struct KexInner {
    state: KexState,
    session_id: Option<Vec<u8>>,
    local_kexinit: Option<(KexInit, Vec<u8>)>,
    remote_kexinit: Option<Vec<u8>>,
    method: Option<Box<dyn KexMethod>>,
    algorithms: Option<NegotiatedAlgorithms>,
    last_algorithms: Option<NegotiatedAlgorithms>,
    pending_inbound: Option<CipherPipeline>,
    skip_guessed_packet: bool,
    completed: u64,
}

/// Drives key exchanges for one connection.
pub struct KeyExchangeCoordinator {
    provider: Arc<dyn CryptoProvider>,
    preferences: AlgorithmPreferences,
    verifier: Option<HostKeyVerifier>,
    max_payload: usize,
    client_version: String,
    server_version: String,
    inner: Mutex<KexInner>,
}

impl std::fmt::Debug for KeyExchangeCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = lock(&self.inner);
        f.debug_struct("KeyExchangeCoordinator")
            .field("state", &inner.state)
            .field("completed", &inner.completed)
            .field("client_version", &self.client_version)
            .field("server_version", &self.server_version)
            .finish_non_exhaustive()
    }
}

impl KeyExchangeCoordinator {
    /// Creates a coordinator for a connection whose identification strings
    /// (without CR LF) have been exchanged.
    pub fn new(config: &SshClientConfig, client_version: &str, server_version: &str) -> Self {
        Self {
            provider: Arc::clone(&config.provider),
            preferences: config.algorithms.clone(),
            verifier: config.host_key_verifier.clone(),
            max_payload: config.max_packet_len,
            client_version: client_version.to_string(),
            server_version: server_version.to_string(),
            inner: Mutex::new(KexInner {
                state: KexState::Idle,
                session_id: None,
                local_kexinit: None,
                remote_kexinit: None,
                method: None,
                algorithms: None,
                last_algorithms: None,
                pending_inbound: None,
                skip_guessed_packet: false,
                completed: 0,
            }),
        }
    }

    /// Current state.
    pub fn state(&self) -> KexState {
        lock(&self.inner).state
    }

    /// Returns true while an exchange is running.
    pub fn in_progress(&self) -> bool {
        self.state().in_progress()
    }

    /// Number of completed exchanges.
    pub fn completed(&self) -> u64 {
        lock(&self.inner).completed
    }

    /// The session identifier: the exchange hash of the first exchange.
    pub fn session_id(&self) -> Option<Vec<u8>> {
        lock(&self.inner).session_id.clone()
    }

    /// Algorithms negotiated by the most recent exchange.
    pub fn negotiated(&self) -> Option<NegotiatedAlgorithms> {
        lock(&self.inner).last_algorithms.clone()
    }

    /// Starts an exchange by sending our KEXINIT.
    ///
    /// Returns false, without sending anything, if one is already running.
    pub fn initiate(&self, tx: &mut dyn KexTransport) -> FynxResult<bool> {
        let mut guard = lock(&self.inner);
        let inner = &mut *guard;
        if inner.state.in_progress() {
            return Ok(false);
        }
        self.send_kexinit(inner, tx)?;
        Ok(true)
    }

    /// Processes one key exchange message (KEXINIT, NEWKEYS or 30-49).
    ///
    /// # Errors
    ///
    /// - [`FynxError::Protocol`] for a message out of sequence
    /// - [`FynxError::UnsupportedAlgorithm`] if negotiation fails
    /// - [`FynxError::Security`] if the host key is not accepted or its
    ///   signature does not verify
    pub fn handle(&self, msg: &Message, tx: &mut dyn KexTransport) -> FynxResult<()> {
        let mut guard = lock(&self.inner);
        let inner = &mut *guard;
        match msg.type_byte() {
            t if t == MessageType::KexInit as u8 => self.on_kexinit(inner, msg, tx),
            t if t == MessageType::NewKeys as u8 => self.on_newkeys(inner, tx),
            t if is_kex_method(t) => self.on_method_message(inner, msg, tx),
            t => Err(FynxError::Protocol(format!(
                "Message {} is not a key exchange message",
                t
            ))),
        }
    }

    fn send_kexinit(&self, inner: &mut KexInner, tx: &mut dyn KexTransport) -> FynxResult<()> {
        let kexinit = KexInit::from_preferences(&self.preferences);
        let bytes = kexinit.to_bytes();
        tx.hold_outbound();
        tx.send_payload(&bytes)?;
        debug!(rekey = inner.completed > 0, "Sent KEXINIT");
        inner.local_kexinit = Some((kexinit, bytes));
        inner.state = KexState::Negotiating;
        Ok(())
    }

    fn on_kexinit(
        &self,
        inner: &mut KexInner,
        msg: &Message,
        tx: &mut dyn KexTransport,
    ) -> FynxResult<()> {
        match inner.state {
            KexState::Idle | KexState::Keyed => self.send_kexinit(inner, tx)?,
            KexState::Negotiating if inner.remote_kexinit.is_none() => {}
            state => {
                return Err(FynxError::Protocol(format!(
                    "Unexpected KEXINIT in state {:?}",
                    state
                )))
            }
        }

        let server = KexInit::from_bytes(msg.payload())?;
        let (client, client_bytes) = inner
            .local_kexinit
            .as_ref()
            .ok_or_else(|| FynxError::Protocol("Local KEXINIT missing".to_string()))?;
        let algorithms = NegotiatedAlgorithms::negotiate(client, &server, self.provider.as_ref())?;
        info!(
            kex = %algorithms.kex,
            host_key = %algorithms.host_key,
            cipher_c2s = %algorithms.cipher_client_to_server,
            cipher_s2c = %algorithms.cipher_server_to_client,
            mac_c2s = ?algorithms.mac_client_to_server,
            mac_s2c = ?algorithms.mac_server_to_client,
            compression_c2s = %algorithms.compression_client_to_server,
            "Algorithms negotiated"
        );

        inner.skip_guessed_packet =
            server.first_kex_packet_follows() && guess_was_wrong(client, &server);
        if inner.skip_guessed_packet {
            debug!("Peer guessed the key exchange wrong; its next method packet is ignored");
        }

        let mut method = self.provider.create_kex(&algorithms.kex)?;
        let ctx = ExchangeContext {
            client_version: &self.client_version,
            server_version: &self.server_version,
            client_kexinit: client_bytes,
            server_kexinit: &msg.payload()[..],
        };
        for payload in method.start(&ctx)? {
            tx.send_payload(&payload)?;
        }

        inner.remote_kexinit = Some(msg.payload().to_vec());
        inner.method = Some(method);
        inner.algorithms = Some(algorithms);
        inner.state = KexState::Exchanging;
        Ok(())
    }

    fn on_method_message(
        &self,
        inner: &mut KexInner,
        msg: &Message,
        tx: &mut dyn KexTransport,
    ) -> FynxResult<()> {
        if inner.state != KexState::Exchanging {
            return Err(FynxError::Protocol(format!(
                "Key exchange message {} in state {:?}",
                msg.type_byte(),
                inner.state
            )));
        }
        if inner.skip_guessed_packet {
            inner.skip_guessed_packet = false;
            debug!(type_byte = msg.type_byte(), "Ignored wrongly guessed kex packet");
            return Ok(());
        }

        let (method, local, remote) = match (
            inner.method.as_mut(),
            inner.local_kexinit.as_ref(),
            inner.remote_kexinit.as_ref(),
        ) {
            (Some(method), Some((_, local)), Some(remote)) => (method, local, remote),
            _ => {
                return Err(FynxError::Protocol(
                    "Key exchange state is incomplete".to_string(),
                ))
            }
        };
        let ctx = ExchangeContext {
            client_version: &self.client_version,
            server_version: &self.server_version,
            client_kexinit: local,
            server_kexinit: remote,
        };

        match method.process(&ctx, msg.payload())? {
            KexStep::Continue(payloads) => {
                for payload in payloads {
                    tx.send_payload(&payload)?;
                }
                Ok(())
            }
            KexStep::Complete(output) => self.finish_exchange(inner, output, tx),
        }
    }

    fn finish_exchange(
        &self,
        inner: &mut KexInner,
        output: KexOutput,
        tx: &mut dyn KexTransport,
    ) -> FynxResult<()> {
        inner.state = KexState::Verifying;
        let algorithms = inner
            .algorithms
            .take()
            .ok_or_else(|| FynxError::Protocol("Negotiated algorithms missing".to_string()))?;
        self.verify_host_key(&algorithms.host_key, &output)?;

        let session_id = inner
            .session_id
            .get_or_insert_with(|| output.exchange_hash.clone())
            .clone();
        let keys = SessionKeys::derive(
            output.hash,
            &output.shared_secret,
            &output.exchange_hash,
            &session_id,
            &algorithms,
            self.provider.as_ref(),
        )?;

        let outbound = CipherPipeline::from_keys(
            self.provider.as_ref(),
            CipherDirection::Encrypt,
            PipelineKeys {
                cipher: &algorithms.cipher_client_to_server,
                mac: algorithms.mac_client_to_server.as_deref(),
                compression: &algorithms.compression_client_to_server,
                key: &keys.enc_client_to_server,
                iv: &keys.iv_client_to_server,
                mac_key: &keys.mac_client_to_server,
            },
            self.max_payload,
        )?;
        let inbound = CipherPipeline::from_keys(
            self.provider.as_ref(),
            CipherDirection::Decrypt,
            PipelineKeys {
                cipher: &algorithms.cipher_server_to_client,
                mac: algorithms.mac_server_to_client.as_deref(),
                compression: &algorithms.compression_server_to_client,
                key: &keys.enc_server_to_client,
                iv: &keys.iv_server_to_client,
                mac_key: &keys.mac_server_to_client,
            },
            self.max_payload,
        )?;

        tx.switch_outbound(outbound)?;
        inner.pending_inbound = Some(inbound);
        inner.method = None;
        inner.local_kexinit = None;
        inner.remote_kexinit = None;
        inner.last_algorithms = Some(algorithms);
        inner.state = KexState::KeyedAwaitingPeer;
        Ok(())
    }

    fn verify_host_key(&self, algorithm: &str, output: &KexOutput) -> FynxResult<()> {
        let verifier = self.verifier.as_ref().ok_or_else(|| {
            FynxError::Security("No host key verifier configured; refusing to trust the server".to_string())
        })?;

        let fingerprint = fingerprint_sha256(&output.host_key);
        if !verifier(algorithm, &output.host_key, &fingerprint) {
            return Err(FynxError::Security(format!(
                "Host key {} ({}) rejected",
                fingerprint, algorithm
            )));
        }

        let valid = self.provider.verify_host_signature(
            algorithm,
            &output.host_key,
            &output.exchange_hash,
            &output.signature,
        )?;
        if !valid {
            return Err(FynxError::Security(
                "Host key signature verification failed".to_string(),
            ));
        }
        debug!(fingerprint = %fingerprint, "Host key verified");
        Ok(())
    }

    fn on_newkeys(&self, inner: &mut KexInner, tx: &mut dyn KexTransport) -> FynxResult<()> {
        if inner.state != KexState::KeyedAwaitingPeer {
            return Err(FynxError::Protocol(format!(
                "Unexpected NEWKEYS in state {:?}",
                inner.state
            )));
        }
        let inbound = inner
            .pending_inbound
            .take()
            .ok_or_else(|| FynxError::Protocol("Inbound keys missing".to_string()))?;
        tx.switch_inbound(inbound)?;

        inner.state = KexState::Keyed;
        inner.completed += 1;
        tx.release_outbound()?;
        info!(exchanges = inner.completed, "Key exchange complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kex::method::exchange_hash;
    use crate::wire::{encode_mpint, write_string, Reader};
    use crate::crypto::HashAlgorithm;
    use bytes::{BufMut, Bytes, BytesMut};
    use ed25519_dalek::{Signer, SigningKey};
    use ring::agreement::{agree_ephemeral, EphemeralPrivateKey, UnparsedPublicKey, X25519};
    use ring::rand::SystemRandom;

    const CLIENT: &str = "SSH-2.0-Fynx_test";
    const SERVER: &str = "SSH-2.0-Peer_test";

    #[derive(Default)]
    struct MockTransport {
        sent: Vec<Vec<u8>>,
        held: bool,
        outbound: Option<CipherPipeline>,
        inbound: Option<CipherPipeline>,
        released: usize,
    }

    impl KexTransport for MockTransport {
        fn send_payload(&mut self, payload: &[u8]) -> FynxResult<()> {
            self.sent.push(payload.to_vec());
            Ok(())
        }

        fn hold_outbound(&mut self) {
            self.held = true;
        }

        fn switch_outbound(&mut self, pipeline: CipherPipeline) -> FynxResult<()> {
            self.outbound = Some(pipeline);
            Ok(())
        }

        fn switch_inbound(&mut self, pipeline: CipherPipeline) -> FynxResult<()> {
            self.inbound = Some(pipeline);
            Ok(())
        }

        fn release_outbound(&mut self) -> FynxResult<()> {
            self.held = false;
            self.released += 1;
            Ok(())
        }
    }

    fn message(payload: Vec<u8>) -> Message {
        Message::parse(Bytes::from(payload), 0).unwrap()
    }

    fn config(accept: bool) -> SshClientConfig {
        let mut config = SshClientConfig::default();
        config.host_key_verifier = Some(Arc::new(move |_: &str, _: &[u8], fp: &str| {
            assert!(fp.starts_with("SHA256:"));
            accept
        }));
        config
    }

    fn host_key() -> SigningKey {
        SigningKey::from_bytes(&[9u8; 32])
    }

    fn host_key_blob(key: &SigningKey) -> Vec<u8> {
        let mut blob = BytesMut::new();
        write_string(&mut blob, b"ssh-ed25519");
        write_string(&mut blob, key.verifying_key().as_bytes());
        blob.to_vec()
    }

    /// Builds the server's curve25519 reply to the client's KEX_ECDH_INIT.
    fn server_reply(client_kexinit: &[u8], server_kexinit: &[u8], init: &[u8]) -> Vec<u8> {
        let mut reader = Reader::new(&init[1..]);
        let q_c = reader.read_string().unwrap();

        let rng = SystemRandom::new();
        let private = EphemeralPrivateKey::generate(&X25519, &rng).unwrap();
        let q_s = private.compute_public_key().unwrap();
        let secret = agree_ephemeral(private, &UnparsedPublicKey::new(&X25519, q_c), |k| {
            encode_mpint(k)
        })
        .unwrap();

        let key = host_key();
        let blob = host_key_blob(&key);
        let mut values = BytesMut::new();
        write_string(&mut values, q_c);
        write_string(&mut values, q_s.as_ref());
        let ctx = ExchangeContext {
            client_version: CLIENT,
            server_version: SERVER,
            client_kexinit,
            server_kexinit,
        };
        let h = exchange_hash(HashAlgorithm::Sha256, &ctx, &blob, &values, &secret);

        let mut sig = BytesMut::new();
        write_string(&mut sig, b"ssh-ed25519");
        write_string(&mut sig, &key.sign(&h).to_bytes());

        let mut reply = BytesMut::new();
        reply.put_u8(31);
        write_string(&mut reply, &blob);
        write_string(&mut reply, q_s.as_ref());
        write_string(&mut reply, &sig);
        reply.to_vec()
    }

    fn server_kexinit() -> Vec<u8> {
        let mut prefs = AlgorithmPreferences::default();
        prefs.ciphers = vec!["aes128-ctr".to_string()];
        KexInit::from_preferences(&prefs).to_bytes()
    }

    /// Runs one exchange against the mock and returns the transport.
    fn run_exchange(coordinator: &KeyExchangeCoordinator) -> FynxResult<MockTransport> {
        let mut tx = MockTransport::default();
        coordinator.initiate(&mut tx)?;
        let client_kexinit = tx.sent[0].clone();
        let server_kexinit = server_kexinit();

        coordinator.handle(&message(server_kexinit.clone()), &mut tx)?;
        let init = tx.sent.last().unwrap().clone();
        assert_eq!(init[0], 30);

        let reply = server_reply(&client_kexinit, &server_kexinit, &init);
        coordinator.handle(&message(reply), &mut tx)?;
        coordinator.handle(&message(vec![21]), &mut tx)?;
        Ok(tx)
    }

    #[test]
    fn test_initiate_holds_and_sends_kexinit() {
        let coordinator = KeyExchangeCoordinator::new(&config(true), CLIENT, SERVER);
        let mut tx = MockTransport::default();
        assert!(coordinator.initiate(&mut tx).unwrap());
        assert!(tx.held);
        assert_eq!(tx.sent[0][0], 20);
        assert_eq!(coordinator.state(), KexState::Negotiating);

        // A second request while running is a no-op
        assert!(!coordinator.initiate(&mut tx).unwrap());
        assert_eq!(tx.sent.len(), 1);
    }

    #[test]
    fn test_full_exchange() {
        let coordinator = KeyExchangeCoordinator::new(&config(true), CLIENT, SERVER);
        let tx = run_exchange(&coordinator).unwrap();

        assert_eq!(coordinator.state(), KexState::Keyed);
        assert_eq!(coordinator.completed(), 1);
        assert_eq!(coordinator.session_id().unwrap().len(), 32);
        assert_eq!(tx.outbound.unwrap().cipher_name(), "aes128-ctr");
        assert_eq!(tx.inbound.unwrap().mac_len(), 32);
        assert_eq!(tx.released, 1);
        assert!(!tx.held);

        let negotiated = coordinator.negotiated().unwrap();
        assert_eq!(negotiated.kex, "curve25519-sha256");
        assert_eq!(negotiated.host_key, "ssh-ed25519");
    }

    #[test]
    fn test_session_id_fixed_across_rekey() {
        let coordinator = KeyExchangeCoordinator::new(&config(true), CLIENT, SERVER);
        run_exchange(&coordinator).unwrap();
        let first = coordinator.session_id().unwrap();

        run_exchange(&coordinator).unwrap();
        assert_eq!(coordinator.completed(), 2);
        assert_eq!(coordinator.session_id().unwrap(), first);
    }

    #[test]
    fn test_server_initiated_rekey() {
        let coordinator = KeyExchangeCoordinator::new(&config(true), CLIENT, SERVER);
        run_exchange(&coordinator).unwrap();

        let mut tx = MockTransport::default();
        coordinator.handle(&message(server_kexinit()), &mut tx).unwrap();
        // Our KEXINIT goes out first, then the method's first message
        assert_eq!(tx.sent[0][0], 20);
        assert_eq!(tx.sent[1][0], 30);
        assert!(tx.held);
        assert_eq!(coordinator.state(), KexState::Exchanging);
    }

    #[test]
    fn test_missing_verifier_fails_closed() {
        let coordinator =
            KeyExchangeCoordinator::new(&SshClientConfig::default(), CLIENT, SERVER);
        match run_exchange(&coordinator) {
            Err(FynxError::Security(msg)) => assert!(msg.contains("verifier")),
            other => panic!("Expected Security error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_rejected_host_key() {
        let coordinator = KeyExchangeCoordinator::new(&config(false), CLIENT, SERVER);
        match run_exchange(&coordinator) {
            Err(FynxError::Security(msg)) => assert!(msg.contains("rejected")),
            other => panic!("Expected Security error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_unexpected_newkeys() {
        let coordinator = KeyExchangeCoordinator::new(&config(true), CLIENT, SERVER);
        let mut tx = MockTransport::default();
        let result = coordinator.handle(&message(vec![21]), &mut tx);
        assert!(matches!(result, Err(FynxError::Protocol(_))));
    }

    #[test]
    fn test_no_common_cipher() {
        let coordinator = KeyExchangeCoordinator::new(&config(true), CLIENT, SERVER);
        let mut tx = MockTransport::default();
        let mut prefs = AlgorithmPreferences::default();
        prefs.ciphers = vec!["chacha20-poly1305@openssh.com".to_string()];
        let server = KexInit::from_preferences(&prefs).to_bytes();

        let result = coordinator.handle(&message(server), &mut tx);
        assert!(matches!(result, Err(FynxError::UnsupportedAlgorithm { .. })));
    }

    #[test]
    fn test_wrong_guess_skips_packet() {
        let coordinator = KeyExchangeCoordinator::new(&config(true), CLIENT, SERVER);
        let mut tx = MockTransport::default();
        let mut prefs = AlgorithmPreferences::default();
        prefs.kex = vec![
            "diffie-hellman-group14-sha256".to_string(),
            "curve25519-sha256".to_string(),
        ];
        let server = KexInit::from_preferences(&prefs)
            .with_first_kex_packet_follows(true)
            .to_bytes();

        coordinator.handle(&message(server), &mut tx).unwrap();
        // The guessed packet is dropped without reaching the method
        coordinator
            .handle(&message(vec![31, 0, 0, 0, 0]), &mut tx)
            .unwrap();
        assert_eq!(coordinator.state(), KexState::Exchanging);
    }
}
