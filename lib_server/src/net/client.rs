//! Outbound asynchronous connections.
//!
//! `AsyncTcpConnection` parses a remote URL, starts a non-blocking connect
//! (optionally through a SOCKS5 or HTTP CONNECT proxy), and promotes the
//! connection on writability: TLS client handshake when the transport is
//! `ssl`/`wss`, then the codec's establish hook (the websocket client sends
//! its upgrade request there). The builder is reusable; every `connect`
//! call opens a fresh connection with the same callbacks, which is how
//! applications reconnect after a drop.

use std::net::ToSocketAddrs;
use std::rc::Rc;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::error::{CallbackResult, ConfigError, ServerError};
use crate::events::LoopHandle;
use crate::protocols::{CodecRegistry, HttpRequest, Packet};
use crate::stats::Statistics;

use super::connection::{ConnRef, ConnSettings, Connection, EventHandlers, StreamSocket, TcpConnection};
use super::server::{DEFAULT_MAX_PACKAGE, DEFAULT_MAX_SEND_BUFFER};
use super::tls::{self, TlsSession};
use super::{sock, ErrorCode, RemoteTarget};

#[derive(Debug, Clone)]
enum Proxy {
    Socks5(String),
    HttpConnect(String),
}

/// Builder for outbound connections. URL schemes map to codecs the same
/// way listen addresses do, plus `ws`/`wss` for the websocket client and
/// `ssl` for raw TLS.
pub struct AsyncTcpConnection {
    target: RemoteTarget,
    ssl: bool,
    proxy: Option<Proxy>,
    handlers: EventHandlers,
    ping_interval: Option<Duration>,
    max_package_size: usize,
    max_send_buffer_size: usize,
}

impl AsyncTcpConnection {
    pub fn new(url: &str) -> Result<Self, ServerError> {
        let target = RemoteTarget::parse(url)?;
        let ssl = matches!(target.scheme.as_str(), "wss" | "ssl");
        Ok(Self {
            target,
            ssl,
            proxy: None,
            handlers: EventHandlers::default(),
            ping_interval: None,
            max_package_size: DEFAULT_MAX_PACKAGE,
            max_send_buffer_size: DEFAULT_MAX_SEND_BUFFER,
        })
    }

    pub fn via_socks5(mut self, proxy_addr: &str) -> Self {
        self.proxy = Some(Proxy::Socks5(proxy_addr.to_string()));
        self
    }

    pub fn via_http_proxy(mut self, proxy_addr: &str) -> Self {
        self.proxy = Some(Proxy::HttpConnect(proxy_addr.to_string()));
        self
    }

    /// Client-role keepalive: a raw ping frame every `interval` once the
    /// websocket handshake is acknowledged.
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = Some(interval);
        self
    }

    /// Extra handshake header (websocket client).
    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.target
            .headers
            .push((name.to_string(), value.to_string()));
        self
    }

    pub fn max_package_size(mut self, size: usize) -> Self {
        self.max_package_size = size;
        self
    }

    pub fn on_connect<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Connection) -> CallbackResult + 'static,
    {
        self.handlers.on_connect = Some(Rc::new(hook));
        self
    }

    pub fn on_message<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Connection, Packet) -> CallbackResult + 'static,
    {
        self.handlers.on_message = Some(Rc::new(hook));
        self
    }

    pub fn on_close<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Connection) -> CallbackResult + 'static,
    {
        self.handlers.on_close = Some(Rc::new(hook));
        self
    }

    pub fn on_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Connection, ErrorCode, &str) -> CallbackResult + 'static,
    {
        self.handlers.on_error = Some(Rc::new(hook));
        self
    }

    pub fn on_websocket_connect<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Connection, &HttpRequest) -> CallbackResult + 'static,
    {
        self.handlers.on_websocket_connect = Some(Rc::new(hook));
        self
    }

    /// Codec scheme for this URL: `ws`/`wss` run the websocket client,
    /// raw transports none, anything else resolves like a listen scheme.
    fn codec_scheme(&self) -> &str {
        match self.target.scheme.as_str() {
            "ws" | "wss" => "ws",
            "ssl" | "tls" => "tcp",
            other => other,
        }
    }

    /// Opens a fresh connection. Callable repeatedly; each call is an
    /// independent connect attempt with this builder's callbacks.
    pub fn connect(
        &self,
        handle: &LoopHandle,
        stats: &Rc<Statistics>,
        registry: &CodecRegistry,
    ) -> Result<Connection, ServerError> {
        let protocol = registry.create(self.codec_scheme())?;

        let dial_addr = match &self.proxy {
            Some(Proxy::Socks5(addr)) | Some(Proxy::HttpConnect(addr)) => addr.clone(),
            None => self.target.addr(),
        };
        let addr = dial_addr
            .to_socket_addrs()
            .map_err(|source| ServerError::Bind {
                address: dial_addr.clone(),
                source,
            })?
            .next()
            .ok_or_else(|| {
                ServerError::Config(ConfigError::BadAddress {
                    url: dial_addr.clone(),
                    reason: "unresolvable host".to_string(),
                })
            })?;

        let stream = sock::connect_nonblocking(&addr).map_err(|source| ServerError::Bind {
            address: dial_addr.clone(),
            source,
        })?;

        let settings = ConnSettings {
            protocol,
            handlers: Rc::new(self.handlers.clone()),
            max_package_size: self.max_package_size,
            max_send_buffer_size: self.max_send_buffer_size,
            tls: None,
            target: Some(self.target.clone()),
            ping_interval: self.ping_interval,
        };
        let connection = TcpConnection::outbound(
            StreamSocket::Tcp(stream),
            self.target.addr(),
            settings,
            handle.clone(),
            stats.clone(),
        );

        let Connection::Tcp(rc) = &connection else {
            unreachable!("outbound builds a stream connection");
        };
        let fd = rc.borrow().raw_fd();
        let started = Instant::now();
        let weak = Rc::downgrade(rc);
        let proxy = self.proxy.clone();
        let ssl_host = self.ssl.then(|| self.target.host.clone());
        let target = self.target.clone();

        handle.on_writable(fd, move |h, fd| {
            let Some(rc) = weak.upgrade() else { return Ok(()) };
            let conn = Connection::Tcp(rc.clone());
            h.off_writable(fd);

            if let Err(err) = sock::take_socket_error(fd) {
                warn!(error = %err, "async connect failed");
                let secs = started.elapsed().as_secs();
                rc.borrow_mut().fail_connect(format!(
                    "connect to {} failed after {} seconds",
                    target.addr(),
                    secs
                ));
                return super::connection::dispatch_pending(&conn);
            }

            match &proxy {
                None => promote(&rc, &conn, ssl_host.as_deref()),
                Some(proxy) => start_proxy(&rc, &conn, proxy, &target, ssl_host.clone()),
            }
        })?;

        Ok(connection)
    }
}

/// The transport (and proxy tunnel, if any) is up: arm TLS when asked,
/// mark established, start reading, run the establish hooks, flush what
/// queued while connecting.
fn promote(rc: &ConnRef, conn: &Connection, ssl_host: Option<&str>) -> CallbackResult {
    {
        let mut c = rc.borrow_mut();
        if let Some(host) = ssl_host {
            match TlsSession::client(tls::client_config(), host) {
                Ok(session) => c.install_tls(session),
                Err(err) => {
                    warn!(error = %err, "tls client setup failed");
                    c.fail_connect(format!("tls setup for {host} failed"));
                    drop(c);
                    return super::connection::dispatch_pending(conn);
                }
            }
        }
        c.promote_established();
        c.arm_read_interest();
    }

    let on_connect = {
        let c = rc.borrow();
        c.handlers_on_connect()
    };
    if let Some(hook) = on_connect {
        conn.guard(hook(conn))?;
    }

    let codec = rc.borrow().protocol();
    if let Some(codec) = codec {
        let result = {
            let mut c = rc.borrow_mut();
            codec.on_establish(&mut *c)
        };
        if let Err(err) = result {
            warn!(error = %err, "establish hook failed");
            conn.destroy();
            return Ok(());
        }
    }
    super::connection::dispatch_pending(conn)?;

    let needs_flush = rc.borrow().has_pending_send();
    if needs_flush {
        rc.borrow_mut().arm_write_interest();
    }
    Ok(())
}

/// Sends the proxy greeting and installs a read handler that walks the
/// proxy handshake; promotion replaces it with the normal read path.
fn start_proxy(
    rc: &ConnRef,
    conn: &Connection,
    proxy: &Proxy,
    target: &RemoteTarget,
    ssl_host: Option<String>,
) -> CallbackResult {
    enum Phase {
        S5Greeting,
        S5Connect,
        Http,
    }

    let (greeting, phase) = match proxy {
        Proxy::Socks5(_) => (vec![0x05, 0x01, 0x00], Phase::S5Greeting),
        Proxy::HttpConnect(_) => {
            let hostport = target.addr();
            (
                format!(
                    "CONNECT {hostport} HTTP/1.1\r\nHost: {hostport}\r\nProxy-Connection: keep-alive\r\n\r\n"
                )
                .into_bytes(),
                Phase::Http,
            )
        }
    };

    {
        let mut c = rc.borrow_mut();
        if let Err(err) = c.write_direct(&greeting) {
            warn!(error = %err, "proxy greeting failed");
            c.fail_connect("proxy handshake failed".to_string());
            drop(c);
            return super::connection::dispatch_pending(conn);
        }
    }

    let weak = Rc::downgrade(rc);
    let target = target.clone();
    let mut phase = phase;
    let mut acc: Vec<u8> = Vec::new();
    let handle = rc.borrow().loop_handle();
    let fd = rc.borrow().raw_fd();
    handle.on_readable(fd, move |_, _| {
        let Some(rc) = weak.upgrade() else { return Ok(()) };
        let conn = Connection::Tcp(rc.clone());

        let mut chunk = [0u8; 4096];
        loop {
            let read = rc.borrow_mut().read_raw(&mut chunk);
            match read {
                Ok(0) => {
                    rc.borrow_mut()
                        .fail_connect("proxy closed during handshake".to_string());
                    return super::connection::dispatch_pending(&conn);
                }
                Ok(n) => acc.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => {
                    rc.borrow_mut()
                        .fail_connect("proxy read failed".to_string());
                    return super::connection::dispatch_pending(&conn);
                }
            }
        }

        match phase {
            Phase::S5Greeting => {
                if acc.len() < 2 {
                    return Ok(());
                }
                if acc[0] != 0x05 || acc[1] != 0x00 {
                    rc.borrow_mut()
                        .fail_connect("socks5 greeting refused".to_string());
                    return super::connection::dispatch_pending(&conn);
                }
                acc.drain(..2);
                let mut request = vec![0x05, 0x01, 0x00, 0x03, target.host.len() as u8];
                request.extend_from_slice(target.host.as_bytes());
                request.extend_from_slice(&target.port.to_be_bytes());
                {
                    let mut c = rc.borrow_mut();
                    if let Err(err) = c.write_direct(&request) {
                        warn!(error = %err, "socks5 connect request failed");
                        c.fail_connect("proxy handshake failed".to_string());
                        drop(c);
                        return super::connection::dispatch_pending(&conn);
                    }
                }
                phase = Phase::S5Connect;
                Ok(())
            }
            Phase::S5Connect => {
                if acc.len() < 10 {
                    return Ok(());
                }
                if acc[0] != 0x05 || acc[1] != 0x00 {
                    rc.borrow_mut()
                        .fail_connect(format!("socks5 connect refused ({})", acc[1]));
                    return super::connection::dispatch_pending(&conn);
                }
                acc.clear();
                promote(&rc, &conn, ssl_host.as_deref())
            }
            Phase::Http => {
                let Some(end) = acc.windows(4).position(|w| w == b"\r\n\r\n") else {
                    return Ok(());
                };
                let head = String::from_utf8_lossy(&acc[..end]).into_owned();
                if !head.contains(" 200 ") {
                    rc.borrow_mut()
                        .fail_connect(format!("http proxy refused: {}", head.lines().next().unwrap_or("")));
                    return super::connection::dispatch_pending(&conn);
                }
                acc.clear();
                promote(&rc, &conn, ssl_host.as_deref())
            }
        }
    })?;
    Ok(())
}
