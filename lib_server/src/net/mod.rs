//! Transport layer: listening endpoints, buffered connections, outbound
//! clients and the datagram path.

use url::Url;

use crate::error::ConfigError;

pub mod client;
pub mod connection;
pub mod server;
pub mod sock;
pub mod tls;
pub mod udp;

pub use client::AsyncTcpConnection;
pub use connection::{Connection, EventHandlers, TcpConnection};
pub use server::Server;
pub use udp::{AsyncUdpConnection, UdpEndpoint};

/// Largest datagram the UDP path will accept.
pub const MAX_UDP_PACKAGE: usize = 65_535;

/// Connection lifecycle. Transitions are monotonic: an accepted connection
/// starts at `Established`; an outbound one walks the whole chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionStatus {
    Initial,
    Connecting,
    Established,
    Closing,
    Closed,
}

/// Error codes handed to `on_error` callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ConnectFail = 1,
    SendFail = 2,
}

/// Underlying socket flavour of a listener or connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transport {
    #[default]
    Tcp,
    Udp,
    Unix,
    Ssl,
}

impl std::str::FromStr for Transport {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "tcp" => Ok(Transport::Tcp),
            "udp" => Ok(Transport::Udp),
            "unix" => Ok(Transport::Unix),
            "ssl" => Ok(Transport::Ssl),
            other => Err(ConfigError::UnknownTransport(other.to_string())),
        }
    }
}

/// Parsed remote endpoint of an outbound connection.
#[derive(Debug, Clone)]
pub struct RemoteTarget {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub query: Option<String>,
    /// Extra handshake headers supplied by the application.
    pub headers: Vec<(String, String)>,
}

impl RemoteTarget {
    pub fn parse(url: &str) -> Result<Self, ConfigError> {
        let parsed = Url::parse(url).map_err(|e| ConfigError::BadAddress {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        let host = parsed
            .host_str()
            .ok_or_else(|| ConfigError::BadAddress {
                url: url.to_string(),
                reason: "missing host".to_string(),
            })?
            .to_string();
        let port = parsed
            .port_or_known_default()
            .or(match parsed.scheme() {
                "ws" => Some(80),
                "wss" => Some(443),
                _ => None,
            })
            .ok_or_else(|| ConfigError::BadAddress {
                url: url.to_string(),
                reason: "missing port".to_string(),
            })?;
        let path = if parsed.path().is_empty() {
            "/".to_string()
        } else {
            parsed.path().to_string()
        };
        Ok(Self {
            scheme: parsed.scheme().to_string(),
            host,
            port,
            path,
            query: parsed.query().map(str::to_string),
            headers: Vec::new(),
        })
    }

    /// `host:port` for socket addressing.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Value for the `Host` handshake header; default ports are implied.
    pub fn host_header(&self) -> String {
        if self.port == 80 || self.port == 443 {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Origin-form request target (`/path?query`).
    pub fn request_target(&self) -> String {
        match &self.query {
            Some(query) => format!("{}?{}", self.path, query),
            None => self.path.clone(),
        }
    }
}

/// Splits a listen address `scheme://rest` without requiring a resolvable
/// URL (unix paths are not URL authorities).
pub(crate) fn split_listen_url(listen: &str) -> Result<(String, String), ConfigError> {
    listen
        .split_once("://")
        .map(|(scheme, rest)| (scheme.to_string(), rest.to_string()))
        .ok_or_else(|| ConfigError::BadAddress {
            url: listen.to_string(),
            reason: "expected scheme://address".to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_target_parses_the_full_shape() {
        let target = RemoteTarget::parse("ws://example.test:8484/feed?v=2").unwrap();
        assert_eq!(target.scheme, "ws");
        assert_eq!(target.addr(), "example.test:8484");
        assert_eq!(target.host_header(), "example.test:8484");
        assert_eq!(target.request_target(), "/feed?v=2");
    }

    #[test]
    fn default_ports_fill_in_and_vanish_from_host_header() {
        let target = RemoteTarget::parse("ws://example.test/live").unwrap();
        assert_eq!(target.port, 80);
        assert_eq!(target.host_header(), "example.test");
    }

    #[test]
    fn listen_url_splits_scheme_and_address() {
        let (scheme, rest) = split_listen_url("text://0.0.0.0:8484").unwrap();
        assert_eq!(scheme, "text");
        assert_eq!(rest, "0.0.0.0:8484");
        assert!(split_listen_url("no-scheme").is_err());
    }

    #[test]
    fn status_ordering_is_monotonic() {
        assert!(ConnectionStatus::Initial < ConnectionStatus::Connecting);
        assert!(ConnectionStatus::Connecting < ConnectionStatus::Established);
        assert!(ConnectionStatus::Established < ConnectionStatus::Closing);
        assert!(ConnectionStatus::Closing < ConnectionStatus::Closed);
    }
}
