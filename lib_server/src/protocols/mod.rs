//! # Application-Layer Protocol Codecs
//!
//! Every codec bridges raw connection bytes and application messages with
//! three operations over the receive buffer and a connection handle:
//!
//! | Op       | Input                    | Result                             |
//! |----------|--------------------------|------------------------------------|
//! | `input`  | accumulated recv buffer  | need more / complete frame / close |
//! | `decode` | exactly one frame        | an application [`Packet`]          |
//! | `encode` | outbound [`Packet`]      | wire bytes                         |
//!
//! Codecs hold no per-connection state of their own; everything a state
//! machine needs between `input` calls lives in the connection's
//! [`Scratch`]. Side effects a codec cannot perform while the connection is
//! borrowed (user hooks, error callbacks) are raised as [`CodecEvent`]s and
//! dispatched by the connection afterwards.

use std::any::Any;
use std::collections::HashMap;
use std::rc::Rc;

use crate::error::{CodecError, ConfigError};
use crate::net::{ErrorCode, RemoteTarget};

pub mod frame;
pub mod http;
pub mod text;
pub mod websocket;
pub mod ws_client;

pub use frame::FrameCodec;
pub use http::{HttpCodec, HttpRequest};
pub use text::TextCodec;
pub use websocket::{WebSocketCodec, WsScratch};
pub use ws_client::{WsClientCodec, WsClientScratch};

/// Outcome of [`ProtocolCodec::input`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameVerdict {
    /// Not enough buffered bytes to delimit a frame.
    NeedMore,
    /// A complete frame of this many bytes sits at the buffer head.
    Frame(usize),
    /// Unrecoverable protocol state; close the connection.
    Close,
}

/// One decoded application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Bytes(Vec<u8>),
    Text(String),
    Http(Box<HttpRequest>),
}

impl Packet {
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Packet::Bytes(bytes) => bytes,
            Packet::Text(text) => text.into_bytes(),
            Packet::Http(request) => request.body,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Packet::Bytes(bytes) => bytes.len(),
            Packet::Text(text) => text.len(),
            Packet::Http(request) => request.body.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<&str> for Packet {
    fn from(value: &str) -> Self {
        Packet::Text(value.to_string())
    }
}

impl From<String> for Packet {
    fn from(value: String) -> Self {
        Packet::Text(value)
    }
}

impl From<Vec<u8>> for Packet {
    fn from(value: Vec<u8>) -> Self {
        Packet::Bytes(value)
    }
}

impl From<&[u8]> for Packet {
    fn from(value: &[u8]) -> Self {
        Packet::Bytes(value.to_vec())
    }
}

/// Per-connection codec state.
#[derive(Default)]
pub enum Scratch {
    #[default]
    None,
    Ws(WsScratch),
    WsClient(WsClientScratch),
    /// For codecs registered by applications.
    Custom(Box<dyn Any>),
}

/// Deferred side effects raised by codecs during `input`/`decode`/`encode`.
/// The connection dispatches them once its own borrow is released.
#[derive(Debug)]
pub enum CodecEvent {
    /// Server role: handshake request accepted. Client role: 101 validated.
    WebSocketConnect(Box<HttpRequest>),
    /// Ping payload received; dispatch decides between the user hook and the
    /// automatic pong reply.
    WebSocketPing(Vec<u8>),
    WebSocketPong(Vec<u8>),
    /// Close frame payload received; dispatch decides between the user hook
    /// and the default `88 02 03 e8` reply-then-close.
    WebSocketClose(Vec<u8>),
    Error { code: ErrorCode, message: String },
}

/// The slice of a connection a codec is allowed to touch.
pub trait CodecContext {
    fn scratch(&mut self) -> &mut Scratch;
    fn max_package_size(&self) -> usize;
    fn max_send_buffer_size(&self) -> usize;
    fn remote_address(&self) -> String;
    /// Parsed remote target of an outbound connection, if any.
    fn target(&self) -> Option<&RemoteTarget>;
    /// Queues bytes for transmission without running `encode` again.
    fn send_raw(&mut self, bytes: &[u8]);
    /// Queues a final reply and marks the connection for close-on-drain.
    fn close_with(&mut self, reply: &[u8]);
    fn raise(&mut self, event: CodecEvent);
}

/// A pluggable application-layer codec. Implementations must be pure with
/// respect to external state; per-connection state belongs in [`Scratch`].
pub trait ProtocolCodec {
    /// Delimits the next frame in `buffer`.
    fn input(&self, buffer: &[u8], conn: &mut dyn CodecContext) -> FrameVerdict;

    /// Decodes exactly one frame. `None` means the frame was consumed
    /// internally (control frames, handshakes, partial fragments).
    fn decode(
        &self,
        frame: &[u8],
        conn: &mut dyn CodecContext,
    ) -> Result<Option<Packet>, CodecError>;

    /// Encodes one outbound packet to wire bytes. An empty vector means the
    /// codec buffered the bytes itself (e.g. before a handshake completes).
    fn encode(&self, packet: Packet, conn: &mut dyn CodecContext) -> Result<Vec<u8>, CodecError>;

    /// Hook run when an outbound connection reaches its peer. Client-side
    /// handshake codecs send their upgrade request here.
    fn on_establish(&self, _conn: &mut dyn CodecContext) -> Result<(), CodecError> {
        Ok(())
    }
}

type CodecFactory = fn() -> Rc<dyn ProtocolCodec>;

/// Maps listen-address schemes to codec constructors. Unknown schemes fail
/// at server startup, never at runtime.
pub struct CodecRegistry {
    factories: HashMap<String, CodecFactory>,
}

impl CodecRegistry {
    pub fn with_builtins() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register("frame", || Rc::new(FrameCodec));
        registry.register("text", || Rc::new(TextCodec));
        registry.register("http", || Rc::new(HttpCodec::new()));
        registry.register("websocket", || Rc::new(WebSocketCodec));
        registry.register("ws", || Rc::new(WsClientCodec));
        registry
    }

    pub fn register(&mut self, scheme: &str, factory: CodecFactory) {
        self.factories.insert(scheme.to_string(), factory);
    }

    /// Raw transports carry no codec; anything else must be registered.
    pub fn create(&self, scheme: &str) -> Result<Option<Rc<dyn ProtocolCodec>>, ConfigError> {
        match scheme {
            "tcp" | "udp" | "unix" | "ssl" => Ok(None),
            _ => self
                .factories
                .get(scheme)
                .map(|factory| Some(factory()))
                .ok_or_else(|| ConfigError::UnknownScheme(scheme.to_string())),
        }
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;

    /// Stand-in connection for codec unit tests.
    pub(crate) struct MockConn {
        pub scratch: Scratch,
        pub max_package: usize,
        pub max_send_buffer: usize,
        pub sent: Vec<u8>,
        pub close_reply: Option<Vec<u8>>,
        pub events: Vec<CodecEvent>,
        pub target: Option<RemoteTarget>,
    }

    impl Default for MockConn {
        fn default() -> Self {
            Self {
                scratch: Scratch::None,
                max_package: 10 * 1024 * 1024,
                max_send_buffer: 1024 * 1024,
                sent: Vec::new(),
                close_reply: None,
                events: Vec::new(),
                target: None,
            }
        }
    }

    impl CodecContext for MockConn {
        fn scratch(&mut self) -> &mut Scratch {
            &mut self.scratch
        }

        fn max_package_size(&self) -> usize {
            self.max_package
        }

        fn max_send_buffer_size(&self) -> usize {
            self.max_send_buffer
        }

        fn remote_address(&self) -> String {
            "127.0.0.1:52000".to_string()
        }

        fn target(&self) -> Option<&RemoteTarget> {
            self.target.as_ref()
        }

        fn send_raw(&mut self, bytes: &[u8]) {
            self.sent.extend_from_slice(bytes);
        }

        fn close_with(&mut self, reply: &[u8]) {
            self.close_reply = Some(reply.to_vec());
        }

        fn raise(&mut self, event: CodecEvent) {
            self.events.push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_knows_builtins_and_rejects_strangers() {
        let registry = CodecRegistry::with_builtins();
        assert!(registry.create("text").unwrap().is_some());
        assert!(registry.create("websocket").unwrap().is_some());
        assert!(registry.create("tcp").unwrap().is_none());
        assert!(matches!(
            registry.create("gopher"),
            Err(ConfigError::UnknownScheme(_))
        ));
    }
}
