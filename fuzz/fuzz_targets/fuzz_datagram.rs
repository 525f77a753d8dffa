#![no_main]

use libfuzzer_sys::fuzz_target;
use session_protocol::transport::datagram::DatagramPacket;

fuzz_target!(|data: &[u8]| {
    if let Ok(packet) = DatagramPacket::decode(data) {
        // Anything accepted must re-encode to a packet that decodes the same
        let short = data.first().is_some_and(|flags| flags & 0x01 != 0);
        let limit = if short { usize::MAX } else { 0 };
        if let Ok(encoded) = packet.encode(limit) {
            assert_eq!(DatagramPacket::decode(&encoded).ok(), Some(packet));
        }
    }
});
