#![no_main]

use bytes::{Bytes, BytesMut};
use libfuzzer_sys::fuzz_target;
use session_protocol::core::codec::PacketCodec;
use session_protocol::core::envelope::Envelope;
use session_protocol::core::packet::Packet;
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    // Framing, then envelope parsing: must never panic or loop
    let _ = Packet::from_bytes(data);
    let _ = Envelope::from_bytes(&Bytes::copy_from_slice(data));

    let mut src = BytesMut::from(data);
    while let Ok(Some(packet)) = PacketCodec.decode(&mut src) {
        let _ = Envelope::from_bytes(&packet.payload);
    }
});
