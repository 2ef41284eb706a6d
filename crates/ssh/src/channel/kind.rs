//! Channel types and per-channel handlers.

use crate::message::Message;
use crate::wire::{write_string, Reader};
use bytes::{BufMut, Bytes, BytesMut};
use fynx_platform::FynxResult;

/// What a channel carries, with the type-specific open data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelKind {
    /// Interactive session: shell, exec or subsystem (RFC 4254 Section 6).
    Session,
    /// Locally initiated TCP forward (RFC 4254 Section 7.2).
    DirectTcpip {
        /// Host to connect to
        host: String,
        /// Port to connect to
        port: u32,
        /// Originator address
        originator: String,
        /// Originator port
        originator_port: u32,
    },
    /// Peer-initiated forward of a remotely bound port (RFC 4254
    /// Section 7.2).
    ForwardedTcpip {
        /// Address that was connected
        connected: String,
        /// Port that was connected
        port: u32,
        /// Originator address
        originator: String,
        /// Originator port
        originator_port: u32,
    },
    /// Any other channel type, with its raw open data.
    Custom {
        /// Channel type name
        type_name: String,
        /// Type-specific open data
        data: Bytes,
    },
}

impl ChannelKind {
    /// The channel type name sent in CHANNEL_OPEN.
    pub fn type_name(&self) -> &str {
        match self {
            ChannelKind::Session => "session",
            ChannelKind::DirectTcpip { .. } => "direct-tcpip",
            ChannelKind::ForwardedTcpip { .. } => "forwarded-tcpip",
            ChannelKind::Custom { type_name, .. } => type_name,
        }
    }

    /// Type-specific data that follows the common CHANNEL_OPEN fields.
    pub fn open_data(&self) -> Bytes {
        match self {
            ChannelKind::Session => Bytes::new(),
            ChannelKind::DirectTcpip {
                host: first,
                port,
                originator,
                originator_port,
            }
            | ChannelKind::ForwardedTcpip {
                connected: first,
                port,
                originator,
                originator_port,
            } => {
                let mut buf = BytesMut::new();
                write_string(&mut buf, first.as_bytes());
                buf.put_u32(*port);
                write_string(&mut buf, originator.as_bytes());
                buf.put_u32(*originator_port);
                buf.freeze()
            }
            ChannelKind::Custom { data, .. } => data.clone(),
        }
    }

    /// Rebuilds a kind from a peer's CHANNEL_OPEN.
    pub fn from_open(type_name: &str, data: &[u8]) -> FynxResult<Self> {
        match type_name {
            "session" => Ok(ChannelKind::Session),
            "direct-tcpip" | "forwarded-tcpip" => {
                let mut reader = Reader::new(data);
                let first = reader.read_utf8()?;
                let port = reader.read_u32()?;
                let originator = reader.read_utf8()?;
                let originator_port = reader.read_u32()?;
                Ok(if type_name == "direct-tcpip" {
                    ChannelKind::DirectTcpip {
                        host: first,
                        port,
                        originator,
                        originator_port,
                    }
                } else {
                    ChannelKind::ForwardedTcpip {
                        connected: first,
                        port,
                        originator,
                        originator_port,
                    }
                })
            }
            other => Ok(ChannelKind::Custom {
                type_name: other.to_string(),
                data: Bytes::copy_from_slice(data),
            }),
        }
    }
}

/// Caller-supplied behaviour for one channel.
///
/// Handlers run on whichever thread is reading from the connection. They
/// may send, but must not block waiting for another message on the same
/// connection.
pub trait ChannelHandler: Send + Sync {
    /// Offered data, extended data, EOF, CLOSE and peer requests after flow
    /// control and lifecycle state are updated.
    ///
    /// Returns true if the message was consumed; it is then not buffered
    /// for readers. Consumed data counts as read for flow control, and a
    /// consumed request gets no automatic reply.
    fn handle_channel_message(&self, local_id: u32, msg: &Message) -> FynxResult<bool> {
        let _ = (local_id, msg);
        Ok(false)
    }

    /// Called once the channel is open.
    fn on_open(&self, local_id: u32) {
        let _ = local_id;
    }

    /// Called once the channel leaves the channel table.
    fn on_close(&self, local_id: u32) {
        let _ = local_id;
    }
}
