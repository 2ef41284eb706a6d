//! Fuzz target for binary packet decoding.
//!
//! Arbitrary bytes fed to the plaintext decoder must produce a packet or
//! an error, never a panic or an oversized allocation.
//!
//! Run with:
//! ```bash
//! cd crates/ssh
//! cargo +nightly fuzz run packet_decode -- -max_total_time=300
//! ```

#![no_main]
use fynx_ssh::{CipherPipeline, PacketCodec};
use libfuzzer_sys::fuzz_target;
use std::io::Cursor;

const MAX_PACKET: usize = 35000;

fuzz_target!(|data: &[u8]| {
    let mut pipeline = CipherPipeline::plaintext();
    let mut reader = Cursor::new(data);

    // Keep decoding until the input runs out or is rejected
    while let Ok(packet) = PacketCodec::decode(&mut pipeline, &mut reader, MAX_PACKET) {
        assert!(packet.payload.len() <= MAX_PACKET);

        let mut encoder = CipherPipeline::plaintext();
        let encoded = PacketCodec::encode(&mut encoder, &packet.payload)
            .expect("re-encoding a decoded payload should never fail");
        let mut decoder = CipherPipeline::plaintext();
        let again = PacketCodec::decode(&mut decoder, &mut Cursor::new(encoded), MAX_PACKET)
            .expect("re-decoding an encoded payload should never fail");
        assert_eq!(packet.payload, again.payload);
    }
});
