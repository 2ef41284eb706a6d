//! A keyed SSH connection.
//!
//! [`Connection`] ties the pieces together: it exchanges identification
//! strings, builds the packet reader and writer, runs the first key
//! exchange and then exposes channels, global requests and the raw
//! message interface an authentication layer needs.
//!
//! # Example
//!
//! ```rust,no_run
//! use fynx_ssh::{ChannelKind, Connection, SshClientConfig};
//! use std::io::{Read, Write};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut config = SshClientConfig::default();
//! config.host_key_verifier = Some(Arc::new(|_: &str, _: &[u8], _: &str| true));
//! let conn = Connection::connect("127.0.0.1:22", config)?;
//!
//! let mut tunnel = conn.open_direct_tcpip("db.internal", 5432, "127.0.0.1", 0)?;
//! tunnel.write_all(b"ping")?;
//! let mut buf = [0u8; 64];
//! let n = tunnel.read(&mut buf)?;
//! # let _ = n;
//! # Ok(())
//! # }
//! ```

use crate::channel::{Channel, ChannelFactory, ChannelHandler, ChannelKind, ExitSignal};
use crate::config::SshClientConfig;
use crate::kex::{KeyExchangeCoordinator, NegotiatedAlgorithms};
use crate::lock;
use crate::message::{
    ignore_payload, is_transport, service_request_payload, Disconnect, DisconnectReason,
    GlobalRequest, Message, MessageType,
};
use crate::outbound::Outbound;
use crate::packet::{PacketReader, PacketWriter};
use crate::router::{GlobalRequestHandler, MessageRouter, ShutdownHook};
use crate::transport::{connect_error, Transport, TransportHalves};
use crate::version::exchange_identification;
use crate::wire::{write_string, Reader};
use bytes::{BufMut, Bytes, BytesMut};
use fynx_platform::{FynxError, FynxResult};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Result of [`Connection::execute`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Everything the command wrote to stdout
    pub stdout: Vec<u8>,
    /// Everything the command wrote to stderr
    pub stderr: Vec<u8>,
    /// Exit status, if the server reported one
    pub exit_status: Option<u32>,
    /// Terminating signal, if the server reported one
    pub exit_signal: Option<ExitSignal>,
}

impl ExecOutput {
    /// Returns true if the command exited with status 0.
    pub fn success(&self) -> bool {
        self.exit_status == Some(0)
    }
}

/// An established, keyed SSH connection.
///
/// Cheap to clone; all clones share one connection.
#[derive(Debug, Clone)]
pub struct Connection {
    router: Arc<MessageRouter>,
    server_version: Arc<str>,
    request_timeout: Option<Duration>,
    pump: Arc<Mutex<Option<JoinHandle<()>>>>,
}

fn deadline(timeout: Option<Duration>) -> Option<Instant> {
    timeout.map(|t| Instant::now() + t)
}

impl Connection {
    /// Connects over TCP and completes the first key exchange.
    ///
    /// # Errors
    ///
    /// - [`FynxError::Timeout`] if the TCP connect or handshake takes too long
    /// - [`FynxError::Security`] if the host key is not accepted
    /// - [`FynxError::UnsupportedAlgorithm`] if negotiation fails
    pub fn connect<A: ToSocketAddrs>(addr: A, config: SshClientConfig) -> FynxResult<Self> {
        config.validate()?;
        let addrs: Vec<SocketAddr> = addr.to_socket_addrs().map_err(connect_error)?.collect();

        let mut last_error = None;
        let stream = addrs.iter().find_map(|addr| {
            match TcpStream::connect_timeout(addr, config.connect_timeout) {
                Ok(stream) => Some(stream),
                Err(e) => {
                    debug!(%addr, error = %e, "TCP connect failed");
                    last_error = Some(e);
                    None
                }
            }
        });
        let stream = match (stream, last_error) {
            (Some(stream), _) => stream,
            (None, Some(e)) => return Err(connect_error(e)),
            (None, None) => {
                return Err(FynxError::Config("Address resolved to nothing".to_string()))
            }
        };

        stream.set_nodelay(true)?;
        let control = stream.try_clone()?;
        control.set_read_timeout(Some(config.handshake_timeout))?;
        debug!(peer = ?stream.peer_addr().ok(), "TCP connected");

        let conn = Self::handshake(Box::new(stream), config)?;
        control.set_read_timeout(None)?;
        Ok(conn)
    }

    /// Runs the identification exchange and first key exchange over any
    /// transport.
    pub fn handshake(transport: Box<dyn Transport>, config: SshClientConfig) -> FynxResult<Self> {
        config.validate()?;
        let deadline = Instant::now() + config.handshake_timeout;
        let TransportHalves {
            mut reader,
            mut writer,
            shutdown,
        } = transport.split()?;

        let (client_version, server_version) =
            match exchange_identification(&mut reader, &mut writer, &config.client_version) {
                Ok(versions) => versions,
                Err(e) => {
                    shutdown();
                    return Err(e);
                }
            };
        info!(server = %server_version, "SSH server identified");

        let kex = KeyExchangeCoordinator::new(&config, &client_version, &server_version);
        let router = Arc::new(MessageRouter::new(
            PacketReader::new(reader, config.max_packet_len),
            Outbound::new(PacketWriter::new(writer), config.max_queued_bytes),
            kex,
            &config,
            shutdown,
        ));

        router.start_key_exchange()?;
        let keyed = router.wait_with(Some(deadline), || {
            Ok((router.kex().completed() > 0).then_some(()))
        });
        if let Err(e) = keyed {
            return Err(router.abort(e));
        }

        if let Some(algorithms) = router.kex().negotiated() {
            info!(
                kex = %algorithms.kex,
                host_key = %algorithms.host_key,
                cipher = %algorithms.cipher_client_to_server,
                "SSH connection established"
            );
        }

        let conn = Self {
            router,
            server_version: server_version.into(),
            request_timeout: config.request_timeout,
            pump: Arc::new(Mutex::new(None)),
        };
        if let Some(interval) = config.keepalive_interval {
            conn.spawn_keepalive(interval)?;
        }
        Ok(conn)
    }

    fn spawn_keepalive(&self, interval: Duration) -> FynxResult<()> {
        let router: Weak<MessageRouter> = Arc::downgrade(&self.router);
        thread::Builder::new()
            .name("fynx-ssh-keepalive".to_string())
            .spawn(move || loop {
                thread::sleep(interval);
                let Some(router) = router.upgrade() else {
                    break;
                };
                if router.is_closed() {
                    break;
                }
                router.sweep_expired();
                if let Err(e) = router.send(&ignore_payload(4)) {
                    warn!(error = %e, "Keep-alive failed");
                    break;
                }
                debug!("Keep-alive sent");
            })?;
        Ok(())
    }

    /// The router shared by every clone of this connection.
    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    /// Exchange hash of the first key exchange.
    pub fn session_id(&self) -> Option<Vec<u8>> {
        self.router.kex().session_id()
    }

    /// Algorithms currently in use.
    pub fn negotiated(&self) -> Option<NegotiatedAlgorithms> {
        self.router.kex().negotiated()
    }

    /// The server's identification string.
    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    /// Returns true once the connection has terminated.
    pub fn is_closed(&self) -> bool {
        self.router.is_closed()
    }

    /// The error that terminated the connection, if any.
    pub fn terminal_error(&self) -> Option<FynxError> {
        self.router.terminal_error()
    }

    /// Opens a channel and waits for the peer to confirm it.
    pub fn open_channel(
        &self,
        kind: ChannelKind,
        handler: Option<Arc<dyn ChannelHandler>>,
        timeout: Option<Duration>,
    ) -> FynxResult<Channel> {
        Channel::open(&self.router, kind, handler, timeout)
    }

    /// Opens a session channel.
    pub fn open_session(&self) -> FynxResult<Channel> {
        self.open_channel(ChannelKind::Session, None, self.request_timeout)
    }

    /// Opens a `direct-tcpip` channel to `host:port` on the server's side.
    pub fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator: &str,
        originator_port: u32,
    ) -> FynxResult<Channel> {
        let kind = ChannelKind::DirectTcpip {
            host: host.to_string(),
            port,
            originator: originator.to_string(),
            originator_port,
        };
        self.open_channel(kind, None, self.request_timeout)
    }

    /// Waits for a channel the server opened and a registered factory
    /// accepted.
    pub fn accept_channel(&self, timeout: Option<Duration>) -> FynxResult<Channel> {
        let core = self.router.accept(deadline(timeout))?;
        Ok(Channel::from_core(core, Arc::clone(&self.router)))
    }

    /// Registers the factory consulted when the server opens a channel of
    /// `channel_type`. Types without a factory are refused.
    pub fn register_channel_factory(&self, channel_type: &str, factory: ChannelFactory) {
        self.router.register_channel_factory(channel_type, factory);
    }

    /// Registers the handler for server global requests named `name`.
    /// Requests without a handler are refused.
    pub fn register_global_handler(&self, name: &str, handler: GlobalRequestHandler) {
        self.router.register_global_handler(name, handler);
    }

    /// Registers a hook run once when the connection terminates.
    pub fn on_shutdown(&self, hook: ShutdownHook) {
        self.router.on_shutdown(hook);
    }

    /// Sends a global request and waits for the reply.
    ///
    /// Returns the response data on success, `None` on failure.
    pub fn global_request(
        &self,
        name: &str,
        data: &[u8],
        timeout: Option<Duration>,
    ) -> FynxResult<Option<Bytes>> {
        self.router.global_request(name, data, deadline(timeout))
    }

    /// Sends a global request without asking for a reply.
    pub fn send_global_request(&self, name: &str, data: &[u8]) -> FynxResult<()> {
        let request = GlobalRequest {
            name: name.to_string(),
            want_reply: false,
            data: Bytes::copy_from_slice(data),
        };
        self.router.send(&request.to_bytes())
    }

    /// Asks the server to listen on `address:port` and forward connections
    /// back as `forwarded-tcpip` channels (RFC 4254 Section 7.1).
    ///
    /// Returns the bound port, which the server picks when `port` is 0.
    pub fn request_tcpip_forward(&self, address: &str, port: u32) -> FynxResult<u32> {
        let mut data = BytesMut::new();
        write_string(&mut data, address.as_bytes());
        data.put_u32(port);

        match self.global_request("tcpip-forward", &data, self.request_timeout)? {
            Some(reply) if port == 0 => Reader::new(&reply).read_u32(),
            Some(_) => Ok(port),
            None => Err(FynxError::RequestRejected("tcpip-forward".to_string())),
        }
    }

    /// Starts a key exchange and waits for it to finish. If one is already
    /// running, waits for that one instead.
    pub fn rekey(&self, timeout: Option<Duration>) -> FynxResult<()> {
        let target = self.router.kex().completed() + 1;
        if self.router.start_key_exchange()? {
            info!("Rekey requested");
        }
        self.router.wait_with(deadline(timeout), || {
            Ok((self.router.kex().completed() >= target).then_some(()))
        })
    }

    /// Switches to a background thread that reads continuously.
    ///
    /// The thread stops when the connection ends; [`Connection::disconnect`]
    /// joins it.
    pub fn start_pump(&self) -> FynxResult<()> {
        let handle = self.router.start_pump()?;
        *lock(&self.pump) = Some(handle);
        Ok(())
    }

    /// Sends an IGNORE message.
    pub fn send_keepalive(&self) -> FynxResult<()> {
        self.router.send(&ignore_payload(4))
    }

    /// Requests a service (normally `ssh-userauth`) and waits for the
    /// accept.
    pub fn service_request(&self, service: &str, timeout: Option<Duration>) -> FynxResult<()> {
        self.router.send(&service_request_payload(service))?;
        let accept = self
            .router
            .next_global(|m| m.is(MessageType::ServiceAccept), deadline(timeout))?;
        let accepted = accept.body().read_utf8()?;
        if accepted != service {
            return Err(self.router.abort(FynxError::Protocol(format!(
                "Requested service {} but {} was accepted",
                service, accepted
            ))));
        }
        debug!(service, "Service accepted");
        Ok(())
    }

    /// Sends a raw payload of a connection or authentication message type.
    ///
    /// # Errors
    ///
    /// [`FynxError::Config`] for transport-layer message types, which only
    /// this crate may send.
    pub fn send_message(&self, payload: &[u8]) -> FynxResult<()> {
        match payload.first() {
            None => Err(FynxError::Config("Empty message payload".to_string())),
            Some(&t) if is_transport(t) => Err(FynxError::Config(format!(
                "Message type {} is reserved for the transport layer",
                t
            ))),
            Some(_) => self.router.send(payload),
        }
    }

    /// Waits for the next connection-wide message (service accept,
    /// authentication replies, global request replies) matching
    /// `predicate`.
    pub fn next_global_message<F>(
        &self,
        predicate: F,
        timeout: Option<Duration>,
    ) -> FynxResult<Message>
    where
        F: Fn(&Message) -> bool,
    {
        self.router.next_global(predicate, deadline(timeout))
    }

    /// Runs a command on a new session channel and collects its output.
    pub fn execute(&self, command: &str) -> FynxResult<ExecOutput> {
        let channel = self.open_session()?;
        channel.exec(command)?;
        let (stdout, stderr) = channel.collect_output(None)?;
        channel.wait_closed(self.request_timeout)?;
        debug!(
            command,
            status = ?channel.exit_status(),
            stdout = stdout.len(),
            stderr = stderr.len(),
            "Command finished"
        );
        Ok(ExecOutput {
            stdout,
            stderr,
            exit_status: channel.exit_status(),
            exit_signal: channel.exit_signal(),
        })
    }

    /// Sends DISCONNECT and tears the connection down. Every waiting
    /// thread sees [`FynxError::Disconnected`].
    pub fn disconnect(&self, reason: DisconnectReason, description: &str) -> FynxResult<()> {
        if self.router.is_closed() {
            self.join_pump();
            return Ok(());
        }
        let disconnect = Disconnect::new(reason, description);
        let sent = self.router.send(&disconnect.to_bytes());
        self.router.abort(FynxError::Disconnected {
            reason_code: disconnect.reason_code,
            description: disconnect.description,
        });
        self.join_pump();
        info!(reason = ?reason, "Disconnected");
        sent
    }

    // The stream is shut by now, so the pump's read returns promptly. A
    // shutdown hook running on the pump thread must not join itself.
    fn join_pump(&self) {
        let handle = lock(&self.pump).take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                warn!("Message pump panicked");
            }
            debug!("Message pump joined");
        }
    }
}
