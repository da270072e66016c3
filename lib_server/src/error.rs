//! Error types shared across the framework.
//!
//! Library code reports failures through these enums; binaries collapse them
//! into `anyhow::Result` at the entrypoint. Application callbacks return
//! [`CallbackResult`] so user errors can be routed through the event loop's
//! error handler without aborting the worker.

use std::io;

use thiserror::Error;

/// Boxed error type carried by application callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Return type of every user-supplied callback.
pub type CallbackResult = Result<(), BoxError>;

/// Errors raised by the event loop and its drivers.
#[derive(Debug, Error)]
pub enum EventError {
    /// A mutation was attempted on a cancelled or never-issued callback id.
    #[error("invalid callback id `{0}`")]
    InvalidCallbackId(String),

    /// The event loop backing a handle has been dropped.
    #[error("event loop is gone")]
    LoopGone,

    /// The select driver cannot watch descriptors at or above `FD_SETSIZE`.
    #[error(
        "select driver cannot watch fd {fd}: FD_SETSIZE is {limit}; \
         lower the open-descriptor count or force the mio driver with SERVER_EVENTLOOP=mio"
    )]
    SelectCapacity { fd: i32, limit: i32 },

    /// `SERVER_EVENTLOOP` named a driver this build does not provide.
    #[error("unknown event loop driver `{0}` (expected `mio` or `select`)")]
    UnknownDriver(String),

    /// The kernel polling backend failed.
    #[error("event loop driver error: {0}")]
    Driver(#[from] io::Error),

    /// `sleep` was called before the worker's event loop existed.
    #[error("sleep is only available inside the cooperative event loop")]
    SleepWithoutLoop,

    /// A callback failed and either no error handler was installed or the
    /// handler itself failed. Unwinds `run()`.
    #[error("uncaught callback error: {source}")]
    Uncaught {
        #[source]
        source: BoxError,
    },
}

/// Errors raised while parsing or registering cron rules.
#[derive(Debug, Error)]
pub enum CronError {
    #[error("malformed cron rule `{rule}`: {reason}")]
    BadRule { rule: String, reason: String },

    #[error("cron field `{field}` value {value} outside {min}-{max}")]
    OutOfRange {
        field: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },
}

/// Errors raised by protocol codecs. A codec error closes the connection it
/// occurred on; it never propagates into the event loop.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("package length {length} over limit {limit}")]
    PackageTooLarge { length: usize, limit: usize },

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("unsupported: {0}")]
    Unsupported(String),
}

/// Errors raised while resolving runtime configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid listen address `{url}`: {reason}")]
    BadAddress { url: String, reason: String },

    #[error("unknown protocol scheme `{0}`")]
    UnknownScheme(String),

    #[error("unknown transport `{0}` (expected tcp, udp, unix or ssl)")]
    UnknownTransport(String),

    #[error("runtime directory {path}: {source}")]
    RuntimeDir {
        path: String,
        #[source]
        source: io::Error,
    },
}

/// Top-level error for server startup and the supervisor.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Event(#[from] EventError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Cron(#[from] CronError),

    #[error("bind {address} failed: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("another master process is already running (pid file {0})")]
    AlreadyRunning(String),

    #[error("no master process is running (pid file {0})")]
    NotRunning(String),

    #[error("fork failed: {0}")]
    Fork(#[source] nix::Error),

    #[error("tls setup failed: {0}")]
    Tls(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("system call failed: {0}")]
    Sys(#[from] nix::Error),
}
