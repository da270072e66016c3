//! Line-delimited text frames: one message per `\n`, trailing `\r\n`
//! trimmed on decode.

use crate::error::CodecError;

use super::{CodecContext, FrameVerdict, Packet, ProtocolCodec};

pub struct TextCodec;

impl ProtocolCodec for TextCodec {
    fn input(&self, buffer: &[u8], conn: &mut dyn CodecContext) -> FrameVerdict {
        match buffer.iter().position(|&b| b == b'\n') {
            Some(pos) if pos + 1 > conn.max_package_size() => FrameVerdict::Close,
            Some(pos) => FrameVerdict::Frame(pos + 1),
            // An unbounded line is a protocol violation once it passes the
            // package limit.
            None if buffer.len() >= conn.max_package_size() => FrameVerdict::Close,
            None => FrameVerdict::NeedMore,
        }
    }

    fn decode(
        &self,
        frame: &[u8],
        _conn: &mut dyn CodecContext,
    ) -> Result<Option<Packet>, CodecError> {
        let mut end = frame.len();
        while end > 0 && (frame[end - 1] == b'\n' || frame[end - 1] == b'\r') {
            end -= 1;
        }
        Ok(Some(Packet::Text(
            String::from_utf8_lossy(&frame[..end]).into_owned(),
        )))
    }

    fn encode(&self, packet: Packet, _conn: &mut dyn CodecContext) -> Result<Vec<u8>, CodecError> {
        let mut wire = packet.into_bytes();
        wire.push(b'\n');
        Ok(wire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::tests_support::MockConn;

    #[test]
    fn round_trip_trims_crlf() {
        let mut conn = MockConn::default();
        let wire = TextCodec.encode(Packet::Text("hi".into()), &mut conn).unwrap();
        assert_eq!(wire, b"hi\n");

        let verdict = TextCodec.input(b"hi\r\n", &mut conn);
        assert_eq!(verdict, FrameVerdict::Frame(4));
        let packet = TextCodec.decode(b"hi\r\n", &mut conn).unwrap().unwrap();
        assert_eq!(packet, Packet::Text("hi".into()));
    }

    #[test]
    fn waits_for_the_newline() {
        let mut conn = MockConn::default();
        assert_eq!(TextCodec.input(b"partial", &mut conn), FrameVerdict::NeedMore);
    }

    #[test]
    fn oversize_line_without_newline_closes() {
        let mut conn = MockConn::default();
        conn.max_package = 4;
        assert_eq!(TextCodec.input(b"abcde", &mut conn), FrameVerdict::Close);
    }
}
