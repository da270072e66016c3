//! RFC 6455 WebSocket, server role.
//!
//! An accepted connection starts in the handshake state: the first frame is
//! the HTTP `GET` upgrade request, answered with the 101 response carrying
//! `base64(sha1(key || MAGIC))`. After that the codec delimits one wire
//! frame at a time; control frames and partial fragments are consumed
//! internally (`decode` returns `None`) and only complete messages reach
//! the application.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha1::{Digest, Sha1};

use crate::error::CodecError;
use crate::net::ErrorCode;

use super::http::HttpRequest;
use super::{CodecContext, CodecEvent, FrameVerdict, Packet, ProtocolCodec, Scratch};

/// RFC 6455 handshake GUID.
pub const MAGIC: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Close frame with status 1000 (normal closure), the default reply to a
/// peer-initiated close.
pub const CLOSE_NORMAL: [u8; 4] = [0x88, 0x02, 0x03, 0xe8];
/// Close frame with status 1002 (protocol error).
pub const CLOSE_PROTOCOL_ERROR: [u8; 4] = [0x88, 0x02, 0x03, 0xea];

pub const OP_CONTINUATION: u8 = 0x0;
pub const OP_TEXT: u8 = 0x1;
pub const OP_BINARY: u8 = 0x2;
pub const OP_CLOSE: u8 = 0x8;
pub const OP_PING: u8 = 0x9;
pub const OP_PONG: u8 = 0xa;

/// Outbound frame type byte: fin + text.
pub const TYPE_TEXT: u8 = 0x81;
/// Outbound frame type byte: fin + binary.
pub const TYPE_BINARY: u8 = 0x82;

const MAX_HANDSHAKE: usize = 16 * 1024;

/// Server-role connection state.
pub struct WsScratch {
    pub handshake_complete: bool,
    /// Data opcode of the in-flight fragmented message.
    pub current_opcode: u8,
    /// Accumulated payloads of `fin=0` fragments.
    pub data_buffer: Vec<u8>,
    /// Frames the application sent before the handshake finished.
    pub pending_sends: Vec<u8>,
    /// First byte of outbound data frames.
    pub ws_type: u8,
}

impl Default for WsScratch {
    fn default() -> Self {
        Self {
            handshake_complete: false,
            current_opcode: OP_TEXT,
            data_buffer: Vec::new(),
            pending_sends: Vec::new(),
            ws_type: TYPE_TEXT,
        }
    }
}

/// Parsed fixed header of one wire frame.
pub(crate) struct FrameHead {
    pub fin: bool,
    pub opcode: u8,
    pub masked: bool,
    pub header_len: usize,
    pub payload_len: usize,
}

/// `None` while the buffered bytes cannot yet cover the header.
pub(crate) fn parse_frame_head(buffer: &[u8]) -> Option<FrameHead> {
    if buffer.len() < 2 {
        return None;
    }
    let masked = buffer[1] & 0x80 != 0;
    let mask_len = if masked { 4 } else { 0 };
    let (payload_len, len_field) = match buffer[1] & 0x7f {
        126 => {
            if buffer.len() < 4 {
                return None;
            }
            (u16::from_be_bytes([buffer[2], buffer[3]]) as usize, 2)
        }
        127 => {
            if buffer.len() < 10 {
                return None;
            }
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&buffer[2..10]);
            (u64::from_be_bytes(bytes) as usize, 8)
        }
        len => (len as usize, 0),
    };
    Some(FrameHead {
        fin: buffer[0] & 0x80 != 0,
        opcode: buffer[0] & 0x0f,
        masked,
        header_len: 2 + len_field + mask_len,
        payload_len,
    })
}

/// XOR (un)masking; involutive, so one function covers both directions.
pub(crate) fn apply_mask(data: &mut [u8], key: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

pub(crate) fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(MAGIC.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Builds an unmasked data/control frame with the 7/126/127 length split.
pub(crate) fn build_frame(first_byte: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 10);
    frame.push(first_byte);
    match payload.len() {
        len if len < 126 => frame.push(len as u8),
        len if len <= u16::MAX as usize => {
            frame.push(126);
            frame.extend_from_slice(&(len as u16).to_be_bytes());
        }
        len => {
            frame.push(127);
            frame.extend_from_slice(&(len as u64).to_be_bytes());
        }
    }
    frame.extend_from_slice(payload);
    frame
}

fn take_scratch(conn: &mut dyn CodecContext) -> WsScratch {
    match std::mem::take(conn.scratch()) {
        Scratch::Ws(ws) => ws,
        _ => WsScratch::default(),
    }
}

fn put_scratch(conn: &mut dyn CodecContext, ws: WsScratch) {
    *conn.scratch() = Scratch::Ws(ws);
}

/// Minimal request parse for the upgrade head; the full HTTP codec is not
/// in play on websocket listeners.
fn parse_upgrade_request(head: &[u8]) -> HttpRequest {
    let text = String::from_utf8_lossy(head);
    let mut lines = text.split("\r\n");
    let mut request = HttpRequest::default();
    if let Some(request_line) = lines.next() {
        let mut parts = request_line.split(' ');
        request.method = parts.next().unwrap_or_default().to_string();
        let uri = parts.next().unwrap_or_default();
        match uri.split_once('?') {
            Some((path, query)) => {
                request.path = path.to_string();
                request.query_string = query.to_string();
            }
            None => request.path = uri.to_string(),
        }
        request.version = parts.next().unwrap_or_default().to_string();
    }
    request.headers = lines
        .filter_map(|line| {
            line.split_once(':')
                .map(|(name, value)| (name.to_string(), value.trim().to_string()))
        })
        .collect();
    request
}

pub struct WebSocketCodec;

impl ProtocolCodec for WebSocketCodec {
    fn input(&self, buffer: &[u8], conn: &mut dyn CodecContext) -> FrameVerdict {
        let ws = take_scratch(conn);
        let verdict = if !ws.handshake_complete {
            // The upgrade must be a GET request; reject anything else as
            // soon as the method bytes are visible.
            if buffer.len() >= 4 && &buffer[..4] != b"GET " {
                conn.close_with(b"HTTP/1.1 400 Bad Request\r\n\r\n");
                FrameVerdict::Close
            } else {
                match buffer.windows(4).position(|w| w == b"\r\n\r\n") {
                    Some(pos) => FrameVerdict::Frame(pos + 4),
                    None if buffer.len() > MAX_HANDSHAKE => {
                        conn.close_with(b"HTTP/1.1 400 Bad Request\r\n\r\n");
                        FrameVerdict::Close
                    }
                    None => FrameVerdict::NeedMore,
                }
            }
        } else {
            match parse_frame_head(buffer) {
                None => FrameVerdict::NeedMore,
                Some(head) => {
                    if !head.masked {
                        conn.send_raw(&CLOSE_PROTOCOL_ERROR);
                        FrameVerdict::Close
                    } else if !matches!(
                        head.opcode,
                        OP_CONTINUATION | OP_TEXT | OP_BINARY | OP_CLOSE | OP_PING | OP_PONG
                    ) {
                        conn.raise(CodecEvent::Error {
                            code: ErrorCode::SendFail,
                            message: format!("unsupported websocket opcode {:#x}", head.opcode),
                        });
                        FrameVerdict::Close
                    } else {
                        let total = head.header_len + head.payload_len;
                        if ws.data_buffer.len() + total > conn.max_package_size() {
                            FrameVerdict::Close
                        } else {
                            FrameVerdict::Frame(total)
                        }
                    }
                }
            }
        };
        put_scratch(conn, ws);
        verdict
    }

    fn decode(
        &self,
        frame: &[u8],
        conn: &mut dyn CodecContext,
    ) -> Result<Option<Packet>, CodecError> {
        let mut ws = take_scratch(conn);

        if !ws.handshake_complete {
            let request = parse_upgrade_request(&frame[..frame.len().saturating_sub(4)]);
            let Some(key) = request.header("sec-websocket-key").map(str::to_string) else {
                conn.close_with(
                    b"HTTP/1.1 400 Bad Request\r\n\r\n<b>400 Bad Request</b><br>Sec-WebSocket-Key not found",
                );
                put_scratch(conn, ws);
                return Ok(None);
            };
            let response = format!(
                "HTTP/1.1 101 Switching Protocols\r\n\
                 Upgrade: websocket\r\n\
                 Sec-WebSocket-Version: 13\r\n\
                 Connection: Upgrade\r\n\
                 Sec-WebSocket-Accept: {}\r\n\r\n",
                accept_key(&key)
            );
            conn.send_raw(response.as_bytes());
            ws.handshake_complete = true;
            // Anything the application tried to send before the upgrade
            // goes out right behind the 101.
            if !ws.pending_sends.is_empty() {
                let pending = std::mem::take(&mut ws.pending_sends);
                conn.send_raw(&pending);
            }
            conn.raise(CodecEvent::WebSocketConnect(Box::new(request)));
            put_scratch(conn, ws);
            return Ok(None);
        }

        let head = parse_frame_head(frame).ok_or_else(|| {
            CodecError::Protocol("websocket frame shorter than its header".into())
        })?;
        let mut payload = frame[head.header_len..].to_vec();
        if head.masked {
            let mask_at = head.header_len - 4;
            let key = [
                frame[mask_at],
                frame[mask_at + 1],
                frame[mask_at + 2],
                frame[mask_at + 3],
            ];
            apply_mask(&mut payload, key);
        }

        let result = match head.opcode {
            OP_PING => {
                conn.raise(CodecEvent::WebSocketPing(payload));
                Ok(None)
            }
            OP_PONG => {
                conn.raise(CodecEvent::WebSocketPong(payload));
                Ok(None)
            }
            OP_CLOSE => {
                conn.raise(CodecEvent::WebSocketClose(payload));
                Ok(None)
            }
            OP_TEXT | OP_BINARY => {
                if !ws.data_buffer.is_empty() {
                    Err(CodecError::Protocol(
                        "data frame interleaved with an unfinished fragmented message".into(),
                    ))
                } else if head.fin {
                    Ok(Some(deliver(head.opcode, payload)))
                } else {
                    ws.current_opcode = head.opcode;
                    ws.data_buffer = payload;
                    Ok(None)
                }
            }
            OP_CONTINUATION => {
                ws.data_buffer.extend_from_slice(&payload);
                if head.fin {
                    let message = std::mem::take(&mut ws.data_buffer);
                    Ok(Some(deliver(ws.current_opcode, message)))
                } else {
                    Ok(None)
                }
            }
            other => Err(CodecError::Protocol(format!(
                "unsupported websocket opcode {other:#x}"
            ))),
        };
        put_scratch(conn, ws);
        result
    }

    fn encode(&self, packet: Packet, conn: &mut dyn CodecContext) -> Result<Vec<u8>, CodecError> {
        let mut ws = take_scratch(conn);
        let first_byte = match &packet {
            Packet::Bytes(_) => TYPE_BINARY,
            _ => ws.ws_type,
        };
        let frame = build_frame(first_byte, &packet.into_bytes());

        if !ws.handshake_complete {
            if ws.pending_sends.len() + frame.len() > conn.max_send_buffer_size() {
                conn.raise(CodecEvent::Error {
                    code: ErrorCode::SendFail,
                    message: "send full buffer and drop package".to_string(),
                });
                put_scratch(conn, ws);
                return Ok(Vec::new());
            }
            ws.pending_sends.extend_from_slice(&frame);
            put_scratch(conn, ws);
            return Ok(Vec::new());
        }
        put_scratch(conn, ws);
        Ok(frame)
    }
}

fn deliver(opcode: u8, payload: Vec<u8>) -> Packet {
    if opcode == OP_BINARY {
        Packet::Bytes(payload)
    } else {
        Packet::Text(String::from_utf8_lossy(&payload).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::tests_support::MockConn;

    const UPGRADE: &[u8] = b"GET /chat HTTP/1.1\r\n\
        Host: server.example.com\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Sec-WebSocket-Version: 13\r\n\r\n";

    fn masked_frame(first_byte: u8, payload: &[u8], key: [u8; 4]) -> Vec<u8> {
        assert!(payload.len() < 126, "test helper handles short frames only");
        let mut frame = vec![first_byte, 0x80 | payload.len() as u8];
        frame.extend_from_slice(&key);
        let mut masked = payload.to_vec();
        apply_mask(&mut masked, key);
        frame.extend_from_slice(&masked);
        frame
    }

    fn handshaken() -> (WebSocketCodec, MockConn) {
        let codec = WebSocketCodec;
        let mut conn = MockConn::default();
        let verdict = codec.input(UPGRADE, &mut conn);
        assert_eq!(verdict, FrameVerdict::Frame(UPGRADE.len()));
        assert!(codec.decode(UPGRADE, &mut conn).unwrap().is_none());
        conn.sent.clear();
        conn.events.clear();
        (codec, conn)
    }

    #[test]
    fn accept_key_matches_the_rfc_example() {
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn handshake_replies_with_101_and_raises_connect() {
        let codec = WebSocketCodec;
        let mut conn = MockConn::default();
        assert_eq!(codec.input(UPGRADE, &mut conn), FrameVerdict::Frame(UPGRADE.len()));
        assert!(codec.decode(UPGRADE, &mut conn).unwrap().is_none());

        let reply = String::from_utf8_lossy(&conn.sent);
        assert!(reply.starts_with("HTTP/1.1 101 Switching Protocols"));
        assert!(reply.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
        assert!(matches!(
            conn.events.first(),
            Some(CodecEvent::WebSocketConnect(_))
        ));
    }

    #[test]
    fn non_get_handshake_closes() {
        let codec = WebSocketCodec;
        let mut conn = MockConn::default();
        assert_eq!(
            codec.input(b"POST /chat HTTP/1.1\r\n\r\n", &mut conn),
            FrameVerdict::Close
        );
    }

    #[test]
    fn unmasked_client_frame_closes() {
        let (codec, mut conn) = handshaken();
        let frame = build_frame(TYPE_TEXT, b"bare");
        assert_eq!(codec.input(&frame, &mut conn), FrameVerdict::Close);
        assert_eq!(conn.sent, CLOSE_PROTOCOL_ERROR);
    }

    #[test]
    fn unknown_opcode_closes() {
        let (codec, mut conn) = handshaken();
        let frame = masked_frame(0x83, b"x", [1, 2, 3, 4]);
        assert_eq!(codec.input(&frame, &mut conn), FrameVerdict::Close);
    }

    #[test]
    fn masked_text_round_trip() {
        let (codec, mut conn) = handshaken();
        let frame = masked_frame(0x81, b"Hello", [7, 7, 7, 7]);
        assert_eq!(codec.input(&frame, &mut conn), FrameVerdict::Frame(frame.len()));
        let packet = codec.decode(&frame, &mut conn).unwrap().unwrap();
        assert_eq!(packet, Packet::Text("Hello".into()));
    }

    #[test]
    fn fragmented_message_reassembles() {
        let (codec, mut conn) = handshaken();
        let key = [9, 8, 7, 6];
        let first = masked_frame(0x01, b"Hel", key);
        let last = masked_frame(0x80, b"lo", key);

        assert!(codec.decode(&first, &mut conn).unwrap().is_none());
        let packet = codec.decode(&last, &mut conn).unwrap().unwrap();
        assert_eq!(packet, Packet::Text("Hello".into()));
    }

    #[test]
    fn ping_raises_instead_of_delivering() {
        let (codec, mut conn) = handshaken();
        let frame = masked_frame(0x89, b"beat", [1, 1, 1, 1]);
        assert!(codec.decode(&frame, &mut conn).unwrap().is_none());
        assert!(matches!(
            conn.events.first(),
            Some(CodecEvent::WebSocketPing(payload)) if payload == b"beat"
        ));
    }

    #[test]
    fn oversize_accumulated_message_closes() {
        let (codec, mut conn) = handshaken();
        conn.max_package = 8;
        let frame = masked_frame(0x81, b"0123456789", [1, 2, 3, 4]);
        assert_eq!(codec.input(&frame, &mut conn), FrameVerdict::Close);
    }

    #[test]
    fn sends_before_handshake_are_buffered_then_flushed() {
        let codec = WebSocketCodec;
        let mut conn = MockConn::default();
        let wire = codec
            .encode(Packet::Text("early".into()), &mut conn)
            .unwrap();
        assert!(wire.is_empty());

        assert_eq!(codec.input(UPGRADE, &mut conn), FrameVerdict::Frame(UPGRADE.len()));
        assert!(codec.decode(UPGRADE, &mut conn).unwrap().is_none());
        let expected = build_frame(TYPE_TEXT, b"early");
        let sent = conn.sent.clone();
        assert!(sent.ends_with(&expected), "pending frame must follow the 101");
    }

    #[test]
    fn mask_round_trips() {
        let key = [0xde, 0xad, 0xbe, 0xef];
        let mut data = b"any payload at all".to_vec();
        apply_mask(&mut data, key);
        assert_ne!(data, b"any payload at all");
        apply_mask(&mut data, key);
        assert_eq!(data, b"any payload at all");
    }

    #[test]
    fn encode_uses_extended_length_for_big_payloads() {
        let (codec, mut conn) = handshaken();
        let payload = vec![b'x'; 300];
        let wire = codec
            .encode(Packet::Bytes(payload.clone()), &mut conn)
            .unwrap();
        assert_eq!(wire[0], TYPE_BINARY);
        assert_eq!(wire[1], 126);
        assert_eq!(u16::from_be_bytes([wire[2], wire[3]]) as usize, 300);
        assert_eq!(&wire[4..], &payload[..]);
    }
}
