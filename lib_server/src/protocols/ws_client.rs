//! RFC 6455 WebSocket, client role.
//!
//! Runs over an outbound connection: once the transport is up the codec
//! sends the upgrade request with a fresh random key, validates the 101
//! response's `Sec-WebSocket-Accept`, and then exchanges frames. Every
//! client frame is masked with a fresh 4-byte key.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::error::CodecError;
use crate::net::ErrorCode;

use super::http::HttpRequest;
use super::websocket::{
    accept_key, apply_mask, parse_frame_head, OP_BINARY, OP_CLOSE, OP_CONTINUATION, OP_PING,
    OP_PONG, OP_TEXT, TYPE_BINARY, TYPE_TEXT,
};
use super::{CodecContext, CodecEvent, FrameVerdict, Packet, ProtocolCodec, Scratch};

/// Raw keepalive ping: masked, empty payload, zero mask key.
pub const KEEPALIVE_PING: [u8; 6] = [0x89, 0x80, 0x00, 0x00, 0x00, 0x00];

const MAX_HANDSHAKE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WsClientState {
    /// Transport not connected yet.
    #[default]
    Connecting,
    /// Upgrade request sent, waiting for the 101.
    HandshakeSent,
    /// Accept validated; frames flow.
    Established,
}

pub struct WsClientScratch {
    pub state: WsClientState,
    /// Base64 nonce sent in `Sec-WebSocket-Key`.
    pub key: String,
    pub pending_sends: Vec<u8>,
    pub current_opcode: u8,
    pub data_buffer: Vec<u8>,
    pub ws_type: u8,
}

impl Default for WsClientScratch {
    fn default() -> Self {
        Self {
            state: WsClientState::Connecting,
            key: String::new(),
            pending_sends: Vec::new(),
            current_opcode: OP_TEXT,
            data_buffer: Vec::new(),
            ws_type: TYPE_TEXT,
        }
    }
}

fn take_scratch(conn: &mut dyn CodecContext) -> WsClientScratch {
    match std::mem::take(conn.scratch()) {
        Scratch::WsClient(ws) => ws,
        _ => WsClientScratch::default(),
    }
}

fn put_scratch(conn: &mut dyn CodecContext, ws: WsClientScratch) {
    *conn.scratch() = Scratch::WsClient(ws);
}

fn parse_response_head(head: &[u8]) -> HttpRequest {
    let text = String::from_utf8_lossy(head);
    let mut lines = text.split("\r\n");
    let mut response = HttpRequest::default();
    if let Some(status_line) = lines.next() {
        let mut parts = status_line.splitn(3, ' ');
        response.version = parts.next().unwrap_or_default().to_string();
        response.method = parts.next().unwrap_or_default().to_string(); // status code slot
        response.path = parts.next().unwrap_or_default().to_string(); // reason slot
    }
    response.headers = lines
        .filter_map(|line| {
            line.split_once(':')
                .map(|(name, value)| (name.to_string(), value.trim().to_string()))
        })
        .collect();
    response
}

pub(crate) fn build_masked_frame(first_byte: u8, payload: &[u8]) -> Vec<u8> {
    let key: [u8; 4] = rand::random();
    let mut frame = Vec::with_capacity(payload.len() + 14);
    frame.push(first_byte);
    match payload.len() {
        len if len < 126 => frame.push(0x80 | len as u8),
        len if len <= u16::MAX as usize => {
            frame.push(0x80 | 126);
            frame.extend_from_slice(&(len as u16).to_be_bytes());
        }
        len => {
            frame.push(0x80 | 127);
            frame.extend_from_slice(&(len as u64).to_be_bytes());
        }
    }
    frame.extend_from_slice(&key);
    let mut masked = payload.to_vec();
    apply_mask(&mut masked, key);
    frame.extend_from_slice(&masked);
    frame
}

pub struct WsClientCodec;

impl ProtocolCodec for WsClientCodec {
    fn input(&self, buffer: &[u8], conn: &mut dyn CodecContext) -> FrameVerdict {
        let ws = take_scratch(conn);
        let verdict = match ws.state {
            WsClientState::Connecting | WsClientState::HandshakeSent => {
                match buffer.windows(4).position(|w| w == b"\r\n\r\n") {
                    Some(pos) => FrameVerdict::Frame(pos + 4),
                    None if buffer.len() > MAX_HANDSHAKE => FrameVerdict::Close,
                    None => FrameVerdict::NeedMore,
                }
            }
            WsClientState::Established => match parse_frame_head(buffer) {
                None => FrameVerdict::NeedMore,
                Some(head) => {
                    if !matches!(
                        head.opcode,
                        OP_CONTINUATION | OP_TEXT | OP_BINARY | OP_CLOSE | OP_PING | OP_PONG
                    ) {
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
            },
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

        if ws.state != WsClientState::Established {
            let response = parse_response_head(&frame[..frame.len().saturating_sub(4)]);
            if response.method != "101" {
                put_scratch(conn, ws);
                return Err(CodecError::Protocol(format!(
                    "websocket upgrade refused with status {}",
                    response.method
                )));
            }
            let expected = accept_key(&ws.key);
            if response.header("sec-websocket-accept") != Some(expected.as_str()) {
                put_scratch(conn, ws);
                return Err(CodecError::Protocol(
                    "Sec-WebSocket-Accept mismatch".into(),
                ));
            }
            ws.state = WsClientState::Established;
            if !ws.pending_sends.is_empty() {
                let pending = std::mem::take(&mut ws.pending_sends);
                conn.send_raw(&pending);
            }
            conn.raise(CodecEvent::WebSocketConnect(Box::new(response)));
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
                if head.fin {
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
        let frame = build_masked_frame(first_byte, &packet.into_bytes());

        if ws.state != WsClientState::Established {
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

    /// Transport connected: send the upgrade request.
    fn on_establish(&self, conn: &mut dyn CodecContext) -> Result<(), CodecError> {
        let (host_header, request_target, extra_headers) = match conn.target() {
            Some(target) => (
                target.host_header(),
                target.request_target(),
                target.headers.clone(),
            ),
            None => {
                return Err(CodecError::Protocol(
                    "websocket client needs a remote target".into(),
                ))
            }
        };

        let mut ws = take_scratch(conn);
        let nonce: [u8; 16] = rand::random();
        ws.key = BASE64.encode(nonce);

        let mut request = format!(
            "GET {request_target} HTTP/1.1\r\n\
             Host: {host_header}\r\n\
             Connection: Upgrade\r\n\
             Upgrade: websocket\r\n\
             Sec-WebSocket-Version: 13\r\n\
             Sec-WebSocket-Key: {}\r\n",
            ws.key
        );
        for (name, value) in &extra_headers {
            // The computed Host header wins over user-supplied duplicates.
            if name.eq_ignore_ascii_case("host") {
                continue;
            }
            request.push_str(&format!("{name}: {value}\r\n"));
        }
        request.push_str("\r\n");

        ws.state = WsClientState::HandshakeSent;
        conn.send_raw(request.as_bytes());
        put_scratch(conn, ws);
        Ok(())
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
    use crate::net::RemoteTarget;
    use crate::protocols::tests_support::MockConn;
    use crate::protocols::websocket::build_frame;

    fn target() -> RemoteTarget {
        RemoteTarget {
            scheme: "ws".into(),
            host: "example.test".into(),
            port: 8484,
            path: "/feed".into(),
            query: Some("v=2".into()),
            headers: vec![("X-Token".into(), "abc".into())],
        }
    }

    fn client_with_sent_handshake() -> (WsClientCodec, MockConn, String) {
        let codec = WsClientCodec;
        let mut conn = MockConn {
            target: Some(target()),
            ..MockConn::default()
        };
        codec.on_establish(&mut conn).unwrap();
        let request = String::from_utf8(conn.sent.clone()).unwrap();
        let key = request
            .lines()
            .find_map(|line| line.strip_prefix("Sec-WebSocket-Key: "))
            .expect("handshake must carry a key")
            .to_string();
        conn.sent.clear();
        (codec, conn, key)
    }

    fn ack_for(key: &str) -> Vec<u8> {
        format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {}\r\n\r\n",
            accept_key(key)
        )
        .into_bytes()
    }

    #[test]
    fn upgrade_request_carries_target_and_headers() {
        let codec = WsClientCodec;
        let mut conn = MockConn {
            target: Some(target()),
            ..MockConn::default()
        };
        codec.on_establish(&mut conn).unwrap();
        let request = String::from_utf8(conn.sent).unwrap();
        assert!(request.starts_with("GET /feed?v=2 HTTP/1.1\r\n"));
        assert!(request.contains("Host: example.test:8484\r\n"));
        assert!(request.contains("Sec-WebSocket-Version: 13\r\n"));
        assert!(request.contains("X-Token: abc\r\n"));
        assert_eq!(request.matches("Host:").count(), 1);
    }

    #[test]
    fn valid_accept_establishes_and_flushes_pending() {
        let (codec, mut conn, key) = client_with_sent_handshake();

        // Queued before the ack: must go out right after it.
        assert!(codec
            .encode(Packet::Text("early".into()), &mut conn)
            .unwrap()
            .is_empty());

        let ack = ack_for(&key);
        assert_eq!(codec.input(&ack, &mut conn), FrameVerdict::Frame(ack.len()));
        assert!(codec.decode(&ack, &mut conn).unwrap().is_none());
        assert!(!conn.sent.is_empty(), "pending frame must flush");
        assert!(matches!(
            conn.events.first(),
            Some(CodecEvent::WebSocketConnect(_))
        ));
    }

    #[test]
    fn accept_mismatch_is_fatal() {
        let (codec, mut conn, _key) = client_with_sent_handshake();
        let bogus = ack_for("c29tZXRoaW5nIGVsc2U=");
        assert!(codec.decode(&bogus, &mut conn).is_err());
    }

    #[test]
    fn non_101_status_is_fatal() {
        let (codec, mut conn, _key) = client_with_sent_handshake();
        let refusal = b"HTTP/1.1 403 Forbidden\r\n\r\n";
        assert!(codec.decode(refusal, &mut conn).is_err());
    }

    #[test]
    fn server_frames_decode_unmasked(){
        let (codec, mut conn, key) = client_with_sent_handshake();
        let ack = ack_for(&key);
        codec.decode(&ack, &mut conn).unwrap();

        let frame = build_frame(0x81, b"news");
        assert_eq!(codec.input(&frame, &mut conn), FrameVerdict::Frame(frame.len()));
        let packet = codec.decode(&frame, &mut conn).unwrap().unwrap();
        assert_eq!(packet, Packet::Text("news".into()));
    }

    #[test]
    fn client_frames_are_masked() {
        let (codec, mut conn, key) = client_with_sent_handshake();
        let ack = ack_for(&key);
        codec.decode(&ack, &mut conn).unwrap();

        let wire = codec.encode(Packet::Text("hi".into()), &mut conn).unwrap();
        assert_eq!(wire[0], TYPE_TEXT);
        assert_eq!(wire[1] & 0x80, 0x80, "mask bit must be set");
        let mask = [wire[2], wire[3], wire[4], wire[5]];
        let mut payload = wire[6..].to_vec();
        apply_mask(&mut payload, mask);
        assert_eq!(payload, b"hi");
    }
}
