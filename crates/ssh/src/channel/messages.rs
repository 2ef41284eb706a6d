//! Connection protocol messages (RFC 4254 Sections 5-6).

use crate::message::{Message, MessageType};
use crate::wire::{write_bool, write_string};
use bytes::{BufMut, Bytes, BytesMut};
use fynx_platform::{FynxError, FynxResult};

/// Open failure reason: administratively prohibited.
pub const OPEN_ADMINISTRATIVELY_PROHIBITED: u32 = 1;
/// Open failure reason: connect failed.
pub const OPEN_CONNECT_FAILED: u32 = 2;
/// Open failure reason: unknown channel type.
pub const OPEN_UNKNOWN_CHANNEL_TYPE: u32 = 3;
/// Open failure reason: resource shortage.
pub const OPEN_RESOURCE_SHORTAGE: u32 = 4;

/// Extended data type code for stderr.
pub const EXTENDED_DATA_STDERR: u32 = 1;

fn recipient(msg: &Message) -> FynxResult<u32> {
    msg.channel()
        .ok_or_else(|| FynxError::Protocol(format!("{} has no recipient channel", msg)))
}

fn header(message_type: MessageType, recipient: u32) -> BytesMut {
    let mut buf = BytesMut::with_capacity(64);
    buf.put_u8(message_type as u8);
    buf.put_u32(recipient);
    buf
}

/// SSH_MSG_CHANNEL_OPEN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpen {
    /// Channel type name
    pub channel_type: String,
    /// Sender's channel id
    pub sender_channel: u32,
    /// Sender's initial window
    pub initial_window: u32,
    /// Sender's maximum packet size
    pub max_packet: u32,
    /// Type-specific data
    pub data: Bytes,
}

impl ChannelOpen {
    /// Serializes to a payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(64 + self.data.len());
        buf.put_u8(MessageType::ChannelOpen as u8);
        write_string(&mut buf, self.channel_type.as_bytes());
        buf.put_u32(self.sender_channel);
        buf.put_u32(self.initial_window);
        buf.put_u32(self.max_packet);
        buf.put_slice(&self.data);
        buf.to_vec()
    }

    /// Parses a CHANNEL_OPEN message.
    pub fn from_message(msg: &Message) -> FynxResult<Self> {
        let mut body = msg.body();
        Ok(Self {
            channel_type: body.read_utf8()?,
            sender_channel: body.read_u32()?,
            initial_window: body.read_u32()?,
            max_packet: body.read_u32()?,
            data: Bytes::copy_from_slice(body.rest()),
        })
    }
}

/// SSH_MSG_CHANNEL_OPEN_CONFIRMATION.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpenConfirmation {
    /// Our channel id
    pub recipient_channel: u32,
    /// Peer's channel id
    pub sender_channel: u32,
    /// Peer's initial window
    pub initial_window: u32,
    /// Peer's maximum packet size
    pub max_packet: u32,
}

impl ChannelOpenConfirmation {
    /// Serializes to a payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = header(MessageType::ChannelOpenConfirmation, self.recipient_channel);
        buf.put_u32(self.sender_channel);
        buf.put_u32(self.initial_window);
        buf.put_u32(self.max_packet);
        buf.to_vec()
    }

    /// Parses a CHANNEL_OPEN_CONFIRMATION message.
    pub fn from_message(msg: &Message) -> FynxResult<Self> {
        let mut body = msg.body();
        Ok(Self {
            recipient_channel: recipient(msg)?,
            sender_channel: body.read_u32()?,
            initial_window: body.read_u32()?,
            max_packet: body.read_u32()?,
        })
    }
}

/// SSH_MSG_CHANNEL_OPEN_FAILURE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpenFailure {
    /// Our channel id
    pub recipient_channel: u32,
    /// Reason code
    pub reason_code: u32,
    /// Human readable description
    pub description: String,
}

impl ChannelOpenFailure {
    /// Serializes to a payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = header(MessageType::ChannelOpenFailure, self.recipient_channel);
        buf.put_u32(self.reason_code);
        write_string(&mut buf, self.description.as_bytes());
        write_string(&mut buf, b"");
        buf.to_vec()
    }

    /// Parses a CHANNEL_OPEN_FAILURE message.
    pub fn from_message(msg: &Message) -> FynxResult<Self> {
        let mut body = msg.body();
        let reason_code = body.read_u32()?;
        let description = String::from_utf8_lossy(body.read_string()?).into_owned();
        Ok(Self {
            recipient_channel: recipient(msg)?,
            reason_code,
            description,
        })
    }
}

/// SSH_MSG_CHANNEL_REQUEST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRequest {
    /// Recipient channel id
    pub recipient_channel: u32,
    /// Request type
    pub name: String,
    /// Whether a CHANNEL_SUCCESS / CHANNEL_FAILURE reply is expected
    pub want_reply: bool,
    /// Type-specific data
    pub data: Bytes,
}

impl ChannelRequest {
    /// Serializes to a payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = header(MessageType::ChannelRequest, self.recipient_channel);
        write_string(&mut buf, self.name.as_bytes());
        write_bool(&mut buf, self.want_reply);
        buf.put_slice(&self.data);
        buf.to_vec()
    }

    /// Parses a CHANNEL_REQUEST message.
    pub fn from_message(msg: &Message) -> FynxResult<Self> {
        let mut body = msg.body();
        Ok(Self {
            recipient_channel: recipient(msg)?,
            name: body.read_utf8()?,
            want_reply: body.read_bool()?,
            data: Bytes::copy_from_slice(body.rest()),
        })
    }
}

/// Contents of an `exit-signal` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitSignal {
    /// Signal name without the `SIG` prefix
    pub signal: String,
    /// Whether a core was dumped
    pub core_dumped: bool,
    /// Error message
    pub message: String,
}

impl ExitSignal {
    /// Parses the type-specific data of an `exit-signal` request.
    pub fn parse(data: &[u8]) -> FynxResult<Self> {
        let mut reader = crate::wire::Reader::new(data);
        Ok(Self {
            signal: reader.read_utf8()?,
            core_dumped: reader.read_bool()?,
            message: String::from_utf8_lossy(reader.read_string()?).into_owned(),
        })
    }
}

/// Data carried by CHANNEL_DATA or CHANNEL_EXTENDED_DATA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelData {
    /// Recipient channel id
    pub recipient_channel: u32,
    /// Extended data type code (`None` for CHANNEL_DATA)
    pub data_type: Option<u32>,
    /// The bytes
    pub data: Bytes,
}

impl ChannelData {
    /// Parses a CHANNEL_DATA or CHANNEL_EXTENDED_DATA message without
    /// copying the data.
    pub fn from_message(msg: &Message) -> FynxResult<Self> {
        let mut body = msg.body();
        let data_type = if msg.is(MessageType::ChannelExtendedData) {
            Some(body.read_u32()?)
        } else {
            None
        };
        let data = body.read_string()?;
        Ok(Self {
            recipient_channel: recipient(msg)?,
            data_type,
            data: msg.payload().slice_ref(data),
        })
    }
}

/// Builds a CHANNEL_DATA payload.
pub fn data_payload(recipient: u32, data: &[u8]) -> Vec<u8> {
    let mut buf = header(MessageType::ChannelData, recipient);
    write_string(&mut buf, data);
    buf.to_vec()
}

/// Builds a CHANNEL_EXTENDED_DATA payload.
pub fn extended_data_payload(recipient: u32, data_type: u32, data: &[u8]) -> Vec<u8> {
    let mut buf = header(MessageType::ChannelExtendedData, recipient);
    buf.put_u32(data_type);
    write_string(&mut buf, data);
    buf.to_vec()
}

/// Builds a CHANNEL_WINDOW_ADJUST payload.
pub fn window_adjust_payload(recipient: u32, bytes: u32) -> Vec<u8> {
    let mut buf = header(MessageType::ChannelWindowAdjust, recipient);
    buf.put_u32(bytes);
    buf.to_vec()
}

/// Reads the byte count of a CHANNEL_WINDOW_ADJUST message.
pub fn window_adjust_bytes(msg: &Message) -> FynxResult<u32> {
    msg.body().read_u32()
}

/// Builds a CHANNEL_EOF payload.
pub fn eof_payload(recipient: u32) -> Vec<u8> {
    header(MessageType::ChannelEof, recipient).to_vec()
}

/// Builds a CHANNEL_CLOSE payload.
pub fn close_payload(recipient: u32) -> Vec<u8> {
    header(MessageType::ChannelClose, recipient).to_vec()
}

/// Builds a CHANNEL_SUCCESS payload.
pub fn success_payload(recipient: u32) -> Vec<u8> {
    header(MessageType::ChannelSuccess, recipient).to_vec()
}

/// Builds a CHANNEL_FAILURE payload.
pub fn failure_payload(recipient: u32) -> Vec<u8> {
    header(MessageType::ChannelFailure, recipient).to_vec()
}
