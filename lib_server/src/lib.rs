//! # lib_server
//!
//! Multi-process, event-driven socket server framework: a master process
//! supervises a pool of forked workers; each worker drives its listeners,
//! connections, timers and cron jobs from a single-threaded event loop,
//! multiplexing pluggable application-layer codecs over non-blocking
//! TCP/UDP/Unix/TLS sockets.

// Declare the modules to re-export
pub mod cron;
pub mod error;
pub mod events;
pub mod logging;
pub mod master;
pub mod net;
pub mod protocols;
pub mod runtime;
pub mod stats;
pub mod timers;

mod worker;

// Re-export the everyday surface
pub use cron::Crontab;
pub use error::{BoxError, CallbackResult, CodecError, ConfigError, CronError, EventError, ServerError};
pub use events::{CallbackId, EventLoop, LoopHandle, Resumer, Signal, Suspension};
pub use master::command::FATAL_EXIT_CODE;
pub use master::Supervisor;
pub use net::{
    AsyncTcpConnection, AsyncUdpConnection, Connection, ConnectionStatus, ErrorCode, Server,
    Transport,
};
pub use net::tls::TlsFiles;
pub use protocols::{CodecRegistry, HttpRequest, Packet, ProtocolCodec};
pub use runtime::RuntimeConfig;
pub use stats::Statistics;
pub use timers::Timers;
