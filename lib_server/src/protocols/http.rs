//! HTTP/1.x request framing and parsing.
//!
//! Only the framing policy and the request surface live here; response
//! construction, cookies, sessions and uploads are application concerns.
//! `Transfer-Encoding` is rejected outright; bodies are delimited by
//! `Content-Length` alone.

use std::cell::RefCell;
use std::collections::HashMap;

use crate::error::CodecError;

use super::{CodecContext, FrameVerdict, Packet, ProtocolCodec};

/// Bytes allowed before a complete header block must have arrived.
const MAX_HEAD: usize = 16 * 1024;
/// Input cache bounds.
const CACHE_ENTRIES: usize = 512;
const CACHE_KEY_LIMIT: usize = 512;

const METHODS: [&str; 7] = ["GET", "POST", "OPTIONS", "HEAD", "DELETE", "PUT", "PATCH"];

/// A parsed request head plus its body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub query_string: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    /// Case-insensitive header lookup, first match.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

pub(crate) fn error_response(status: u16, reason: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
    )
    .into_bytes()
}

/// Tiny bounded LRU from raw head bytes to computed frame length, so
/// repeated identical requests skip the header walk.
struct InputCache {
    map: HashMap<Vec<u8>, (usize, u64)>,
    stamp: u64,
}

impl InputCache {
    fn new() -> Self {
        Self {
            map: HashMap::new(),
            stamp: 0,
        }
    }

    fn get(&mut self, key: &[u8]) -> Option<usize> {
        self.stamp += 1;
        let stamp = self.stamp;
        self.map.get_mut(key).map(|entry| {
            entry.1 = stamp;
            entry.0
        })
    }

    fn put(&mut self, key: Vec<u8>, length: usize) {
        if key.len() > CACHE_KEY_LIMIT {
            return;
        }
        if self.map.len() >= CACHE_ENTRIES && !self.map.contains_key(&key) {
            if let Some(oldest) = self
                .map
                .iter()
                .min_by_key(|(_, (_, stamp))| *stamp)
                .map(|(k, _)| k.clone())
            {
                self.map.remove(&oldest);
            }
        }
        self.stamp += 1;
        self.map.insert(key, (length, self.stamp));
    }
}

pub struct HttpCodec {
    cache: RefCell<InputCache>,
}

impl HttpCodec {
    pub fn new() -> Self {
        Self {
            cache: RefCell::new(InputCache::new()),
        }
    }
}

impl Default for HttpCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn find_head_end(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

/// Walks the header block and returns `head_len + content_length`, or an
/// error response to close with.
fn frame_length(buffer: &[u8], head_len: usize) -> Result<usize, Vec<u8>> {
    let head = &buffer[..head_len - 4];
    let head_text = std::str::from_utf8(head).map_err(|_| error_response(400, "Bad Request"))?;
    let mut lines = head_text.split("\r\n");

    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split(' ');
    let method = parts.next().unwrap_or_default();
    let _uri = parts.next().unwrap_or_default();
    let version = parts.next().unwrap_or_default();
    if !METHODS.contains(&method) || parts.next().is_some() {
        return Err(error_response(400, "Bad Request"));
    }
    if version != "HTTP/1.1" && version != "HTTP/1.0" {
        return Err(error_response(400, "Bad Request"));
    }

    let mut content_length = 0usize;
    let mut has_host = false;
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        if name.eq_ignore_ascii_case("host") {
            has_host = true;
        } else if name.eq_ignore_ascii_case("content-length") {
            content_length = value
                .parse()
                .map_err(|_| error_response(400, "Bad Request"))?;
        } else if name.eq_ignore_ascii_case("transfer-encoding") {
            return Err(error_response(400, "Bad Request"));
        }
    }
    if version == "HTTP/1.1" && !has_host {
        return Err(error_response(400, "Bad Request"));
    }
    Ok(head_len + content_length)
}

impl ProtocolCodec for HttpCodec {
    fn input(&self, buffer: &[u8], conn: &mut dyn CodecContext) -> FrameVerdict {
        let Some(head_len) = find_head_end(buffer) else {
            if buffer.len() > MAX_HEAD {
                conn.close_with(&error_response(413, "Payload Too Large"));
                return FrameVerdict::Close;
            }
            return FrameVerdict::NeedMore;
        };

        let head = &buffer[..head_len];
        if let Some(length) = self.cache.borrow_mut().get(head) {
            return FrameVerdict::Frame(length);
        }

        match frame_length(buffer, head_len) {
            Ok(length) => {
                if length > conn.max_package_size() {
                    conn.close_with(&error_response(413, "Payload Too Large"));
                    return FrameVerdict::Close;
                }
                self.cache.borrow_mut().put(head.to_vec(), length);
                FrameVerdict::Frame(length)
            }
            Err(reply) => {
                conn.close_with(&reply);
                FrameVerdict::Close
            }
        }
    }

    fn decode(
        &self,
        frame: &[u8],
        _conn: &mut dyn CodecContext,
    ) -> Result<Option<Packet>, CodecError> {
        let head_len = find_head_end(frame)
            .ok_or_else(|| CodecError::Protocol("frame without header terminator".into()))?;
        let head_text = std::str::from_utf8(&frame[..head_len - 4])
            .map_err(|_| CodecError::Protocol("non-utf8 header block".into()))?;
        let mut lines = head_text.split("\r\n");

        let request_line = lines.next().unwrap_or_default();
        let mut parts = request_line.split(' ');
        let method = parts.next().unwrap_or_default().to_string();
        let uri = parts.next().unwrap_or_default();
        let version = parts.next().unwrap_or_default().to_string();
        let (path, query_string) = match uri.split_once('?') {
            Some((path, query)) => (path.to_string(), query.to_string()),
            None => (uri.to_string(), String::new()),
        };

        let headers = lines
            .filter_map(|line| {
                line.split_once(':')
                    .map(|(name, value)| (name.to_string(), value.trim().to_string()))
            })
            .collect();

        Ok(Some(Packet::Http(Box::new(HttpRequest {
            method,
            path,
            query_string,
            version,
            headers,
            body: frame[head_len..].to_vec(),
        }))))
    }

    fn encode(&self, packet: Packet, _conn: &mut dyn CodecContext) -> Result<Vec<u8>, CodecError> {
        // Responses are application-built byte blobs.
        Ok(packet.into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::tests_support::MockConn;

    const SIMPLE: &[u8] = b"GET /ping?x=1 HTTP/1.1\r\nHost: example\r\n\r\n";

    #[test]
    fn frames_a_headerless_body_request() {
        let codec = HttpCodec::new();
        let mut conn = MockConn::default();
        assert_eq!(codec.input(SIMPLE, &mut conn), FrameVerdict::Frame(SIMPLE.len()));
    }

    #[test]
    fn decode_extracts_request_surface() {
        let codec = HttpCodec::new();
        let mut conn = MockConn::default();
        let Packet::Http(request) = codec.decode(SIMPLE, &mut conn).unwrap().unwrap() else {
            panic!("http codec must decode to a request");
        };
        assert_eq!(request.method, "GET");
        assert_eq!(request.path, "/ping");
        assert_eq!(request.query_string, "x=1");
        assert_eq!(request.version, "HTTP/1.1");
        assert_eq!(request.header("host"), Some("example"));
        assert!(request.body.is_empty());
    }

    #[test]
    fn content_length_extends_the_frame() {
        let codec = HttpCodec::new();
        let mut conn = MockConn::default();
        let wire = b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\nhello";
        assert_eq!(codec.input(wire, &mut conn), FrameVerdict::Frame(wire.len()));
        let Packet::Http(request) = codec.decode(wire, &mut conn).unwrap().unwrap() else {
            panic!("expected request");
        };
        assert_eq!(request.body, b"hello");
    }

    #[test]
    fn input_is_stable_across_growing_buffers() {
        let codec = HttpCodec::new();
        let mut conn = MockConn::default();
        let full = b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 4\r\n\r\nbody";
        let partial = &full[..full.len() - 4];
        assert_eq!(codec.input(partial, &mut conn), FrameVerdict::Frame(full.len()));
        assert_eq!(codec.input(full, &mut conn), FrameVerdict::Frame(full.len()));
    }

    #[test]
    fn oversize_body_closes_with_413() {
        let codec = HttpCodec::new();
        let mut conn = MockConn::default();
        conn.max_package = 1024;
        let wire = b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 2048\r\n\r\n";
        assert_eq!(codec.input(wire, &mut conn), FrameVerdict::Close);
        let reply = conn.close_reply.expect("413 reply expected");
        assert!(reply.starts_with(b"HTTP/1.1 413"));
    }

    #[test]
    fn runaway_header_closes_with_413() {
        let codec = HttpCodec::new();
        let mut conn = MockConn::default();
        let wire = vec![b'a'; MAX_HEAD + 1];
        assert_eq!(codec.input(&wire, &mut conn), FrameVerdict::Close);
        assert!(conn.close_reply.is_some());
    }

    #[test]
    fn missing_host_on_http11_is_rejected() {
        let codec = HttpCodec::new();
        let mut conn = MockConn::default();
        let wire = b"GET / HTTP/1.1\r\n\r\n";
        assert_eq!(codec.input(wire, &mut conn), FrameVerdict::Close);
        assert!(conn.close_reply.unwrap().starts_with(b"HTTP/1.1 400"));
    }

    #[test]
    fn transfer_encoding_is_unsupported() {
        let codec = HttpCodec::new();
        let mut conn = MockConn::default();
        let wire = b"POST / HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n";
        assert_eq!(codec.input(wire, &mut conn), FrameVerdict::Close);
    }

    #[test]
    fn unknown_method_is_rejected() {
        let codec = HttpCodec::new();
        let mut conn = MockConn::default();
        let wire = b"BREW / HTTP/1.1\r\nHost: x\r\n\r\n";
        assert_eq!(codec.input(wire, &mut conn), FrameVerdict::Close);
    }

    #[test]
    fn cache_caps_its_entry_count() {
        let mut cache = InputCache::new();
        for i in 0..(CACHE_ENTRIES + 10) {
            cache.put(format!("key-{i}").into_bytes(), i);
        }
        assert!(cache.map.len() <= CACHE_ENTRIES);
        // Most recent entries survive.
        assert!(cache.get(b"key-520".as_ref()).is_some());
    }
}
