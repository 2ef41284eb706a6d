//! Fuzz target for message body parsing.
//!
//! Run with:
//! ```bash
//! cd crates/ssh
//! cargo +nightly fuzz run message_parse -- -max_total_time=300
//! ```

#![no_main]
use bytes::Bytes;
use fynx_ssh::channel::messages::{
    ChannelData, ChannelOpen, ChannelOpenConfirmation, ChannelOpenFailure, ChannelRequest,
};
use fynx_ssh::kex::KexInit;
use fynx_ssh::message::{Disconnect, GlobalRequest};
use fynx_ssh::Message;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = KexInit::from_bytes(data);

    let Ok(msg) = Message::parse(Bytes::copy_from_slice(data), 0) else {
        return;
    };
    let _ = msg.channel();
    let _ = Disconnect::from_message(&msg);
    let _ = GlobalRequest::from_message(&msg);
    let _ = ChannelOpen::from_message(&msg);
    let _ = ChannelOpenConfirmation::from_message(&msg);
    let _ = ChannelOpenFailure::from_message(&msg);
    let _ = ChannelRequest::from_message(&msg);
    let _ = ChannelData::from_message(&msg);
});
