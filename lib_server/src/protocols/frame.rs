//! Length-prefixed binary frames: a 4-byte big-endian total length (prefix
//! included) followed by the payload.

use crate::error::CodecError;

use super::{CodecContext, CodecEvent, FrameVerdict, Packet, ProtocolCodec};
use crate::net::ErrorCode;

pub struct FrameCodec;

const PREFIX: usize = 4;

impl ProtocolCodec for FrameCodec {
    fn input(&self, buffer: &[u8], conn: &mut dyn CodecContext) -> FrameVerdict {
        if buffer.len() < PREFIX {
            return FrameVerdict::NeedMore;
        }
        let total = u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]) as usize;
        if total < PREFIX || total > conn.max_package_size() {
            conn.raise(CodecEvent::Error {
                code: ErrorCode::SendFail,
                message: format!("frame length {total} outside valid range"),
            });
            return FrameVerdict::Close;
        }
        FrameVerdict::Frame(total)
    }

    fn decode(
        &self,
        frame: &[u8],
        _conn: &mut dyn CodecContext,
    ) -> Result<Option<Packet>, CodecError> {
        Ok(Some(Packet::Bytes(frame[PREFIX..].to_vec())))
    }

    fn encode(&self, packet: Packet, _conn: &mut dyn CodecContext) -> Result<Vec<u8>, CodecError> {
        let payload = packet.into_bytes();
        let total = (payload.len() + PREFIX) as u32;
        let mut wire = Vec::with_capacity(payload.len() + PREFIX);
        wire.extend_from_slice(&total.to_be_bytes());
        wire.extend_from_slice(&payload);
        Ok(wire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::tests_support::MockConn;

    #[test]
    fn encode_prefixes_total_length() {
        let mut conn = MockConn::default();
        let wire = FrameCodec
            .encode(Packet::Bytes(b"abc".to_vec()), &mut conn)
            .unwrap();
        assert_eq!(wire, [0, 0, 0, 7, b'a', b'b', b'c']);
    }

    #[test]
    fn round_trip() {
        let mut conn = MockConn::default();
        let wire = FrameCodec
            .encode(Packet::Bytes(b"hello".to_vec()), &mut conn)
            .unwrap();
        assert_eq!(FrameCodec.input(&wire, &mut conn), FrameVerdict::Frame(9));
        let packet = FrameCodec.decode(&wire, &mut conn).unwrap().unwrap();
        assert_eq!(packet, Packet::Bytes(b"hello".to_vec()));
    }

    #[test]
    fn short_prefix_needs_more() {
        let mut conn = MockConn::default();
        assert_eq!(
            FrameCodec.input(&[0, 0, 0], &mut conn),
            FrameVerdict::NeedMore
        );
    }

    #[test]
    fn two_concatenated_frames_delimit_one_at_a_time() {
        let mut conn = MockConn::default();
        let mut wire = FrameCodec
            .encode(Packet::Bytes(b"A".to_vec()), &mut conn)
            .unwrap();
        wire.extend(
            FrameCodec
                .encode(Packet::Bytes(b"BB".to_vec()), &mut conn)
                .unwrap(),
        );

        assert_eq!(FrameCodec.input(&wire, &mut conn), FrameVerdict::Frame(5));
        let first: Vec<u8> = wire.drain(..5).collect();
        assert_eq!(
            FrameCodec.decode(&first, &mut conn).unwrap().unwrap(),
            Packet::Bytes(b"A".to_vec())
        );
        assert_eq!(FrameCodec.input(&wire, &mut conn), FrameVerdict::Frame(6));
        let second: Vec<u8> = wire.drain(..6).collect();
        assert_eq!(
            FrameCodec.decode(&second, &mut conn).unwrap().unwrap(),
            Packet::Bytes(b"BB".to_vec())
        );
        assert!(wire.is_empty());
    }

    #[test]
    fn oversize_frame_closes() {
        let mut conn = MockConn::default();
        conn.max_package = 8;
        let wire = [0, 0, 1, 0, 0];
        assert_eq!(FrameCodec.input(&wire, &mut conn), FrameVerdict::Close);
    }
}
