//! SSH protocol message types (RFC 4253, RFC 4254).
//!
//! This module defines the message numbers this client consumes or produces,
//! the routed [`Message`] value, and the transport-layer message bodies that
//! are not tied to a channel.
//!
//! # Message Categories
//!
//! - **Transport Layer Generic** (1-19): Disconnect, ignore, debug, service
//! - **Algorithm Negotiation** (20-29): KEXINIT, NEWKEYS
//! - **Key Exchange Method** (30-49): Method-specific messages
//! - **User Authentication Generic** (50-79): Authentication protocol
//! - **Connection Protocol Generic** (80-127): Global requests and channels
//!
//! # Example
//!
//! ```rust
//! use fynx_ssh::message::{Message, MessageType};
//!
//! let msg = Message::parse(vec![94, 0, 0, 0, 7, 0, 0, 0, 0].into(), 3).unwrap();
//! assert_eq!(msg.message_type(), Some(MessageType::ChannelData));
//! assert_eq!(msg.channel(), Some(7));
//! ```

use crate::wire::{write_bool, write_string, Reader};
use bytes::{BufMut, Bytes, BytesMut};
use fynx_platform::{FynxError, FynxResult};

/// SSH message types.
///
/// Each message type has a unique numeric identifier used in the binary protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    // Transport layer generic (1-19)
    /// Disconnect message - terminates the connection.
    Disconnect = 1,
    /// Ignore message - can be used for padding or keep-alive.
    Ignore = 2,
    /// Unimplemented message - response to unknown message type.
    Unimplemented = 3,
    /// Debug message - debugging information.
    Debug = 4,
    /// Service request - request a service (e.g., "ssh-userauth").
    ServiceRequest = 5,
    /// Service accept - service request accepted.
    ServiceAccept = 6,
    /// Extension negotiation (RFC 8308).
    ExtInfo = 7,

    // Algorithm negotiation (20-29)
    /// Key exchange init - algorithm negotiation.
    KexInit = 20,
    /// New keys - signals transition to new keys.
    NewKeys = 21,

    // Key exchange method specific (30-49)
    /// Diffie-Hellman/ECDH key exchange init (both use same message number).
    KexdhInit = 30,
    /// Diffie-Hellman/ECDH key exchange reply (both use same message number).
    KexdhReply = 31,

    // User authentication generic (50-79)
    /// User authentication request.
    UserauthRequest = 50,
    /// User authentication failure.
    UserauthFailure = 51,
    /// User authentication success.
    UserauthSuccess = 52,
    /// User authentication banner.
    UserauthBanner = 53,

    // Connection protocol generic (80-127)
    /// Global request.
    GlobalRequest = 80,
    /// Request success.
    RequestSuccess = 81,
    /// Request failure.
    RequestFailure = 82,
    /// Channel open.
    ChannelOpen = 90,
    /// Channel open confirmation.
    ChannelOpenConfirmation = 91,
    /// Channel open failure.
    ChannelOpenFailure = 92,
    /// Channel window adjust.
    ChannelWindowAdjust = 93,
    /// Channel data.
    ChannelData = 94,
    /// Channel extended data (stderr).
    ChannelExtendedData = 95,
    /// Channel EOF.
    ChannelEof = 96,
    /// Channel close.
    ChannelClose = 97,
    /// Channel request.
    ChannelRequest = 98,
    /// Channel success.
    ChannelSuccess = 99,
    /// Channel failure.
    ChannelFailure = 100,
}

impl MessageType {
    /// Converts a byte to a message type.
    ///
    /// # Example
    ///
    /// ```rust
    /// use fynx_ssh::message::MessageType;
    ///
    /// assert_eq!(MessageType::from_u8(20), Some(MessageType::KexInit));
    /// assert_eq!(MessageType::from_u8(255), None);
    /// ```
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(MessageType::Disconnect),
            2 => Some(MessageType::Ignore),
            3 => Some(MessageType::Unimplemented),
            4 => Some(MessageType::Debug),
            5 => Some(MessageType::ServiceRequest),
            6 => Some(MessageType::ServiceAccept),
            7 => Some(MessageType::ExtInfo),
            20 => Some(MessageType::KexInit),
            21 => Some(MessageType::NewKeys),
            30 => Some(MessageType::KexdhInit),
            31 => Some(MessageType::KexdhReply),
            50 => Some(MessageType::UserauthRequest),
            51 => Some(MessageType::UserauthFailure),
            52 => Some(MessageType::UserauthSuccess),
            53 => Some(MessageType::UserauthBanner),
            80 => Some(MessageType::GlobalRequest),
            81 => Some(MessageType::RequestSuccess),
            82 => Some(MessageType::RequestFailure),
            90 => Some(MessageType::ChannelOpen),
            91 => Some(MessageType::ChannelOpenConfirmation),
            92 => Some(MessageType::ChannelOpenFailure),
            93 => Some(MessageType::ChannelWindowAdjust),
            94 => Some(MessageType::ChannelData),
            95 => Some(MessageType::ChannelExtendedData),
            96 => Some(MessageType::ChannelEof),
            97 => Some(MessageType::ChannelClose),
            98 => Some(MessageType::ChannelRequest),
            99 => Some(MessageType::ChannelSuccess),
            100 => Some(MessageType::ChannelFailure),
            _ => None,
        }
    }

    /// Returns the message type name.
    pub fn name(&self) -> &'static str {
        match self {
            MessageType::Disconnect => "SSH_MSG_DISCONNECT",
            MessageType::Ignore => "SSH_MSG_IGNORE",
            MessageType::Unimplemented => "SSH_MSG_UNIMPLEMENTED",
            MessageType::Debug => "SSH_MSG_DEBUG",
            MessageType::ServiceRequest => "SSH_MSG_SERVICE_REQUEST",
            MessageType::ServiceAccept => "SSH_MSG_SERVICE_ACCEPT",
            MessageType::ExtInfo => "SSH_MSG_EXT_INFO",
            MessageType::KexInit => "SSH_MSG_KEXINIT",
            MessageType::NewKeys => "SSH_MSG_NEWKEYS",
            MessageType::KexdhInit => "SSH_MSG_KEXDH_INIT",
            MessageType::KexdhReply => "SSH_MSG_KEXDH_REPLY",
            MessageType::UserauthRequest => "SSH_MSG_USERAUTH_REQUEST",
            MessageType::UserauthFailure => "SSH_MSG_USERAUTH_FAILURE",
            MessageType::UserauthSuccess => "SSH_MSG_USERAUTH_SUCCESS",
            MessageType::UserauthBanner => "SSH_MSG_USERAUTH_BANNER",
            MessageType::GlobalRequest => "SSH_MSG_GLOBAL_REQUEST",
            MessageType::RequestSuccess => "SSH_MSG_REQUEST_SUCCESS",
            MessageType::RequestFailure => "SSH_MSG_REQUEST_FAILURE",
            MessageType::ChannelOpen => "SSH_MSG_CHANNEL_OPEN",
            MessageType::ChannelOpenConfirmation => "SSH_MSG_CHANNEL_OPEN_CONFIRMATION",
            MessageType::ChannelOpenFailure => "SSH_MSG_CHANNEL_OPEN_FAILURE",
            MessageType::ChannelWindowAdjust => "SSH_MSG_CHANNEL_WINDOW_ADJUST",
            MessageType::ChannelData => "SSH_MSG_CHANNEL_DATA",
            MessageType::ChannelExtendedData => "SSH_MSG_CHANNEL_EXTENDED_DATA",
            MessageType::ChannelEof => "SSH_MSG_CHANNEL_EOF",
            MessageType::ChannelClose => "SSH_MSG_CHANNEL_CLOSE",
            MessageType::ChannelRequest => "SSH_MSG_CHANNEL_REQUEST",
            MessageType::ChannelSuccess => "SSH_MSG_CHANNEL_SUCCESS",
            MessageType::ChannelFailure => "SSH_MSG_CHANNEL_FAILURE",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name(), *self as u8)
    }
}

/// Returns true for transport-layer message numbers (1-49).
///
/// These may be sent while a key exchange is in progress; everything else
/// is held back until the exchange completes.
pub fn is_transport(type_byte: u8) -> bool {
    (1..=49).contains(&type_byte)
}

/// Returns true for messages that may be sent between our KEXINIT and our
/// NEWKEYS: transport-layer messages except SERVICE_REQUEST and
/// SERVICE_ACCEPT (RFC 4253 Section 7.1).
pub fn allowed_during_kex(type_byte: u8) -> bool {
    is_transport(type_byte)
        && type_byte != MessageType::ServiceRequest as u8
        && type_byte != MessageType::ServiceAccept as u8
}

/// Returns true for key exchange message numbers (20-49).
pub fn is_key_exchange(type_byte: u8) -> bool {
    (20..=49).contains(&type_byte)
}

/// Returns true for key exchange method-specific message numbers (30-49).
pub fn is_kex_method(type_byte: u8) -> bool {
    (30..=49).contains(&type_byte)
}

/// Returns true for message numbers whose first field is a recipient
/// channel id (91-100).
pub fn is_channel_specific(type_byte: u8) -> bool {
    (91..=100).contains(&type_byte)
}

/// A parsed incoming message.
///
/// Created by the router for each packet read from the wire. The payload is
/// the full decrypted packet payload, message number included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    type_byte: u8,
    channel: Option<u32>,
    sequence: u32,
    payload: Bytes,
}

impl Message {
    /// Parses a packet payload.
    ///
    /// # Arguments
    ///
    /// * `payload` - The decrypted payload, starting with the message number
    /// * `sequence` - The inbound packet sequence number it arrived with
    ///
    /// # Errors
    ///
    /// Returns [`FynxError::Protocol`] if the payload is empty or a
    /// channel-specific message is too short to carry its channel id.
    pub fn parse(payload: Bytes, sequence: u32) -> FynxResult<Self> {
        let type_byte = *payload
            .first()
            .ok_or_else(|| FynxError::Protocol("Empty message payload".to_string()))?;

        let channel = if is_channel_specific(type_byte) {
            let mut reader = Reader::new(&payload[1..]);
            Some(reader.read_u32().map_err(|_| {
                FynxError::Protocol(format!(
                    "Channel message {} too short for recipient channel",
                    type_byte
                ))
            })?)
        } else {
            None
        };

        Ok(Self {
            type_byte,
            channel,
            sequence,
            payload,
        })
    }

    /// Returns the raw message number.
    pub fn type_byte(&self) -> u8 {
        self.type_byte
    }

    /// Returns the message type if it is one this crate knows.
    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::from_u8(self.type_byte)
    }

    /// Returns true if this message has the given type.
    pub fn is(&self, message_type: MessageType) -> bool {
        self.type_byte == message_type as u8
    }

    /// Returns the recipient channel id for channel-specific messages.
    pub fn channel(&self) -> Option<u32> {
        self.channel
    }

    /// Returns the inbound sequence number of the packet.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Returns the full payload, message number included.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Returns a reader positioned after the message number and, for
    /// channel-specific messages, after the recipient channel.
    pub fn body(&self) -> Reader<'_> {
        let skip = if self.channel.is_some() { 5 } else { 1 };
        Reader::new(&self.payload[skip..])
    }

    /// Returns true for messages that stay visible in a mailbox after being
    /// delivered (CHANNEL_EOF and CHANNEL_CLOSE).
    pub fn is_sticky(&self) -> bool {
        self.is(MessageType::ChannelEof) || self.is(MessageType::ChannelClose)
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.message_type() {
            Some(t) => write!(f, "{}", t)?,
            None => write!(f, "UNKNOWN({})", self.type_byte)?,
        }
        if let Some(channel) = self.channel {
            write!(f, " channel={}", channel)?;
        }
        Ok(())
    }
}

/// SSH disconnect reason codes (RFC 4253 Section 11.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DisconnectReason {
    /// Host not allowed to connect
    HostNotAllowedToConnect = 1,
    /// Protocol error
    ProtocolError = 2,
    /// Key exchange failed
    KeyExchangeFailed = 3,
    /// Reserved
    Reserved = 4,
    /// MAC error
    MacError = 5,
    /// Compression error
    CompressionError = 6,
    /// Service not available
    ServiceNotAvailable = 7,
    /// Protocol version not supported
    ProtocolVersionNotSupported = 8,
    /// Host key not verifiable
    HostKeyNotVerifiable = 9,
    /// Connection lost
    ConnectionLost = 10,
    /// Disconnected by application
    ByApplication = 11,
    /// Too many connections
    TooManyConnections = 12,
    /// Authentication cancelled by user
    AuthCancelledByUser = 13,
    /// No more authentication methods available
    NoMoreAuthMethodsAvailable = 14,
    /// Illegal user name
    IllegalUserName = 15,
}

impl DisconnectReason {
    /// Converts from the wire code.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::HostNotAllowedToConnect),
            2 => Some(Self::ProtocolError),
            3 => Some(Self::KeyExchangeFailed),
            4 => Some(Self::Reserved),
            5 => Some(Self::MacError),
            6 => Some(Self::CompressionError),
            7 => Some(Self::ServiceNotAvailable),
            8 => Some(Self::ProtocolVersionNotSupported),
            9 => Some(Self::HostKeyNotVerifiable),
            10 => Some(Self::ConnectionLost),
            11 => Some(Self::ByApplication),
            12 => Some(Self::TooManyConnections),
            13 => Some(Self::AuthCancelledByUser),
            14 => Some(Self::NoMoreAuthMethodsAvailable),
            15 => Some(Self::IllegalUserName),
            _ => None,
        }
    }
}

/// SSH_MSG_DISCONNECT (RFC 4253 Section 11.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnect {
    /// Reason code
    pub reason_code: u32,
    /// Human readable description
    pub description: String,
}

impl Disconnect {
    /// Creates a disconnect message.
    pub fn new(reason: DisconnectReason, description: &str) -> Self {
        Self {
            reason_code: reason as u32,
            description: description.to_string(),
        }
    }

    /// Serializes to a payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::Disconnect as u8);
        buf.put_u32(self.reason_code);
        write_string(&mut buf, self.description.as_bytes());
        // language tag
        write_string(&mut buf, b"");
        buf.to_vec()
    }

    /// Parses the body of a DISCONNECT message.
    pub fn from_message(msg: &Message) -> FynxResult<Self> {
        let mut body = msg.body();
        let reason_code = body.read_u32()?;
        let description = String::from_utf8_lossy(body.read_string()?).into_owned();
        Ok(Self {
            reason_code,
            description,
        })
    }
}

/// Builds an SSH_MSG_IGNORE payload carrying `data_len` random bytes.
///
/// Used as a keepalive: the peer discards it but the connection sees
/// traffic.
pub fn ignore_payload(data_len: usize) -> Vec<u8> {
    use rand::RngCore;

    let mut data = vec![0u8; data_len];
    rand::thread_rng().fill_bytes(&mut data);

    let mut buf = BytesMut::with_capacity(1 + 4 + data_len);
    buf.put_u8(MessageType::Ignore as u8);
    write_string(&mut buf, &data);
    buf.to_vec()
}

/// Builds an SSH_MSG_UNIMPLEMENTED payload for the given inbound sequence
/// number.
pub fn unimplemented_payload(sequence: u32) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(5);
    buf.put_u8(MessageType::Unimplemented as u8);
    buf.put_u32(sequence);
    buf.to_vec()
}

/// Builds an SSH_MSG_SERVICE_REQUEST payload.
pub fn service_request_payload(service: &str) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u8(MessageType::ServiceRequest as u8);
    write_string(&mut buf, service.as_bytes());
    buf.to_vec()
}

/// SSH_MSG_DEBUG (RFC 4253 Section 11.3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugMessage {
    /// Whether the peer asked for the message to be displayed
    pub always_display: bool,
    /// Message text
    pub message: String,
}

impl DebugMessage {
    /// Parses the body of a DEBUG message.
    pub fn from_message(msg: &Message) -> FynxResult<Self> {
        let mut body = msg.body();
        let always_display = body.read_bool()?;
        let message = String::from_utf8_lossy(body.read_string()?).into_owned();
        Ok(Self {
            always_display,
            message,
        })
    }
}

/// SSH_MSG_GLOBAL_REQUEST (RFC 4254 Section 4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalRequest {
    /// Request name
    pub name: String,
    /// Whether the sender expects REQUEST_SUCCESS / REQUEST_FAILURE
    pub want_reply: bool,
    /// Request-specific data
    pub data: Bytes,
}

impl GlobalRequest {
    /// Serializes to a payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::GlobalRequest as u8);
        write_string(&mut buf, self.name.as_bytes());
        write_bool(&mut buf, self.want_reply);
        buf.put_slice(&self.data);
        buf.to_vec()
    }

    /// Parses a GLOBAL_REQUEST message.
    pub fn from_message(msg: &Message) -> FynxResult<Self> {
        let mut body = msg.body();
        let name = body.read_utf8()?;
        let want_reply = body.read_bool()?;
        let data = Bytes::copy_from_slice(body.rest());
        Ok(Self {
            name,
            want_reply,
            data,
        })
    }
}

/// Builds an SSH_MSG_REQUEST_SUCCESS payload with optional response data.
pub fn request_success_payload(data: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(1 + data.len());
    buf.put_u8(MessageType::RequestSuccess as u8);
    buf.put_slice(data);
    buf.to_vec()
}

/// Builds an SSH_MSG_REQUEST_FAILURE payload.
pub fn request_failure_payload() -> Vec<u8> {
    vec![MessageType::RequestFailure as u8]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_conversion() {
        assert_eq!(MessageType::from_u8(20), Some(MessageType::KexInit));
        assert_eq!(MessageType::from_u8(21), Some(MessageType::NewKeys));
        assert_eq!(MessageType::from_u8(255), None);
    }

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::Disconnect as u8, 1);
        assert_eq!(MessageType::Ignore as u8, 2);
        assert_eq!(MessageType::Debug as u8, 4);
        assert_eq!(MessageType::ServiceRequest as u8, 5);
        assert_eq!(MessageType::ServiceAccept as u8, 6);
        assert_eq!(MessageType::KexInit as u8, 20);
        assert_eq!(MessageType::NewKeys as u8, 21);
        assert_eq!(MessageType::GlobalRequest as u8, 80);
        assert_eq!(MessageType::RequestSuccess as u8, 81);
        assert_eq!(MessageType::RequestFailure as u8, 82);
        assert_eq!(MessageType::ChannelOpen as u8, 90);
        assert_eq!(MessageType::ChannelWindowAdjust as u8, 93);
        assert_eq!(MessageType::ChannelData as u8, 94);
        assert_eq!(MessageType::ChannelFailure as u8, 100);
    }

    #[test]
    fn test_message_type_display() {
        let msg = MessageType::KexInit;
        assert_eq!(format!("{}", msg), "SSH_MSG_KEXINIT(20)");
    }

    #[test]
    fn test_ranges() {
        assert!(is_transport(MessageType::NewKeys as u8));
        assert!(!is_transport(MessageType::ChannelData as u8));
        assert!(is_kex_method(31));
        assert!(!is_kex_method(21));
        assert!(is_channel_specific(91));
        assert!(is_channel_specific(100));
        assert!(!is_channel_specific(90));
    }

    #[test]
    fn test_parse_channel_message() {
        let payload = Bytes::from_static(&[97, 0, 0, 1, 2]);
        let msg = Message::parse(payload, 9).unwrap();
        assert_eq!(msg.channel(), Some(258));
        assert_eq!(msg.sequence(), 9);
        assert!(msg.is_sticky());
        assert!(msg.body().is_empty());
    }

    #[test]
    fn test_parse_truncated_channel_message() {
        let result = Message::parse(Bytes::from_static(&[94, 0, 0]), 0);
        assert!(matches!(result, Err(FynxError::Protocol(_))));
    }

    #[test]
    fn test_parse_empty_payload() {
        let result = Message::parse(Bytes::new(), 0);
        assert!(matches!(result, Err(FynxError::Protocol(_))));
    }

    #[test]
    fn test_global_message_has_no_channel() {
        let msg = Message::parse(Bytes::from_static(&[82]), 0).unwrap();
        assert_eq!(msg.channel(), None);
        assert!(!msg.is_sticky());
    }

    #[test]
    fn test_disconnect_roundtrip() {
        let disconnect = Disconnect::new(DisconnectReason::ByApplication, "bye");
        let msg = Message::parse(disconnect.to_bytes().into(), 0).unwrap();
        let parsed = Disconnect::from_message(&msg).unwrap();
        assert_eq!(parsed.reason_code, 11);
        assert_eq!(parsed.description, "bye");
    }

    #[test]
    fn test_ignore_payload_format() {
        let msg = ignore_payload(32);
        assert_eq!(msg[0], MessageType::Ignore as u8);
        assert_eq!(msg.len(), 1 + 4 + 32);
        let data_len = u32::from_be_bytes([msg[1], msg[2], msg[3], msg[4]]);
        assert_eq!(data_len, 32);
    }

    #[test]
    fn test_global_request_roundtrip() {
        let req = GlobalRequest {
            name: "keepalive@openssh.com".to_string(),
            want_reply: true,
            data: Bytes::new(),
        };
        let msg = Message::parse(req.to_bytes().into(), 0).unwrap();
        assert_eq!(GlobalRequest::from_message(&msg).unwrap(), req);
    }
}
