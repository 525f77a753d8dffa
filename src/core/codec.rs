use crate::core::packet::{parse_header, Packet, FRAME_HEADER_LEN};
use crate::error::ProtocolError;
use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

/// Tokio codec framing [`Packet`]s over a byte stream
#[derive(Debug, Default, Clone, Copy)]
pub struct PacketCodec;

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(body_len) = parse_header(src)? else {
            return Ok(None);
        };

        let total = FRAME_HEADER_LEN + body_len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(total);
        let body = frame.split_off(FRAME_HEADER_LEN).freeze();
        Ok(Some(Packet { payload: body }))
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.write_to(dst)
    }
}
