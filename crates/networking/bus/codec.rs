use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::BusError;
use crate::message::Envelope;

/// Frames one JSON envelope per datagram. `UdpFramed` hands `decode` exactly
/// one datagram's bytes, so the whole buffer is consumed per call.
#[derive(Debug, Clone, Copy, Default)]
pub struct BusCodec;

impl Decoder for BusCodec {
    type Item = Envelope;
    type Error = BusError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }
        let result = serde_json::from_slice(src);
        src.clear();
        Ok(Some(result?))
    }
}

impl Encoder<Envelope> for BusCodec {
    type Error = BusError;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let encoded = serde_json::to_vec(&item)?;
        dst.reserve(encoded.len());
        dst.put_slice(&encoded);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use automine_common::types::{AgentId, QuarryId};

    #[test]
    fn encode_decode_roundtrip() {
        let envelope = Envelope::new(
            QuarryId::from("alpha"),
            AgentId(3),
            12,
            None,
            Message::Recall { active: true },
        );

        let mut codec = BusCodec;
        let mut buf = BytesMut::new();
        codec.encode(envelope.clone(), &mut buf).expect("encode");

        let decoded = codec
            .decode(&mut buf)
            .expect("decode ok")
            .expect("one frame");
        assert_eq!(decoded, envelope);
        assert!(buf.is_empty());
        assert!(codec.decode(&mut buf).expect("empty ok").is_none());
    }

    #[test]
    fn junk_datagram_is_an_error_and_consumed() {
        let mut codec = BusCodec;
        let mut buf = BytesMut::from(&b"not an envelope"[..]);
        assert!(codec.decode(&mut buf).is_err());
        assert!(buf.is_empty());
    }
}
