//! A listening endpoint: one address, one codec, one callback set, and the
//! registry of connections accepted on it.
//!
//! Servers are configured before the worker pool forks; each worker then
//! arms the accept callback on its inherited (or `SO_REUSEPORT`-rebound)
//! listening socket and serves independently.

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, TcpListener, ToSocketAddrs, UdpSocket};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixListener;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::{CallbackResult, ServerError};
use crate::events::LoopHandle;
use crate::protocols::{CodecRegistry, HttpRequest, Packet, ProtocolCodec};
use crate::stats::Statistics;

use super::connection::{
    ConnRegistry, ConnSettings, Connection, EventHandlers, StreamSocket, TcpConnection,
};
use super::tls::{self, TlsFiles, TlsSession};
use super::udp::{deliver_datagram, UdpEndpoint};
use super::{split_listen_url, sock, ErrorCode, Transport, MAX_UDP_PACKAGE};

const DEFAULT_BACKLOG: i32 = 102_400;
pub const DEFAULT_MAX_PACKAGE: usize = 10 * 1024 * 1024;
pub const DEFAULT_MAX_SEND_BUFFER: usize = 1024 * 1024;

type LifecycleHook = Rc<dyn Fn(&LoopHandle) -> CallbackResult>;
type StopHook = Rc<dyn Fn(&LoopHandle, bool) -> CallbackResult>;

pub(crate) enum Listener {
    Tcp(Rc<TcpListener>),
    Udp(Rc<UdpSocket>),
    Unix(Rc<UnixListener>),
}

impl Listener {
    fn raw_fd(&self) -> RawFd {
        match self {
            Listener::Tcp(l) => l.as_raw_fd(),
            Listener::Udp(s) => s.as_raw_fd(),
            Listener::Unix(l) => l.as_raw_fd(),
        }
    }
}

pub struct Server {
    pub name: String,
    listen: String,
    scheme: String,
    address: String,
    pub transport: Transport,
    pub count: usize,
    pub reloadable: bool,
    pub reuse_port: bool,
    pub user: Option<String>,
    pub group: Option<String>,
    pub max_package_size: usize,
    pub max_send_buffer_size: usize,
    tls_files: Option<TlsFiles>,
    tls_config: Option<Arc<rustls::ServerConfig>>,
    pub(crate) handlers: EventHandlers,
    pub(crate) on_server_start: Option<LifecycleHook>,
    pub(crate) on_server_stop: Option<StopHook>,
    pub(crate) on_server_reload: Option<LifecycleHook>,
    codec: Option<Rc<dyn ProtocolCodec>>,
    listener: Option<Listener>,
    connections: ConnRegistry,
}

impl Server {
    /// A server for `scheme://address`, e.g. `text://0.0.0.0:8484` or
    /// `unix:///run/app.sock`. The scheme picks the codec; raw transports
    /// (`tcp`, `udp`, `unix`, `ssl`) carry none.
    pub fn new(listen: &str) -> Self {
        Self {
            name: "none".to_string(),
            listen: listen.to_string(),
            scheme: String::new(),
            address: String::new(),
            transport: Transport::Tcp,
            count: 1,
            reloadable: true,
            reuse_port: false,
            user: None,
            group: None,
            max_package_size: DEFAULT_MAX_PACKAGE,
            max_send_buffer_size: DEFAULT_MAX_SEND_BUFFER,
            tls_files: None,
            tls_config: None,
            handlers: EventHandlers::default(),
            on_server_start: None,
            on_server_stop: None,
            on_server_reload: None,
            codec: None,
            listener: None,
            connections: Rc::new(std::cell::RefCell::new(HashMap::new())),
        }
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn count(mut self, count: usize) -> Self {
        self.count = count.max(1);
        self
    }

    pub fn reloadable(mut self, reloadable: bool) -> Self {
        self.reloadable = reloadable;
        self
    }

    pub fn reuse_port(mut self, reuse_port: bool) -> Self {
        self.reuse_port = reuse_port;
        self
    }

    pub fn transport(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }

    pub fn tls(mut self, files: TlsFiles) -> Self {
        self.transport = Transport::Ssl;
        self.tls_files = Some(files);
        self
    }

    pub fn user(mut self, user: &str) -> Self {
        self.user = Some(user.to_string());
        self
    }

    pub fn group(mut self, group: &str) -> Self {
        self.group = Some(group.to_string());
        self
    }

    pub fn max_package_size(mut self, size: usize) -> Self {
        self.max_package_size = size;
        self
    }

    pub fn max_send_buffer_size(mut self, size: usize) -> Self {
        self.max_send_buffer_size = size;
        self
    }

    pub fn on_server_start<F>(mut self, hook: F) -> Self
    where
        F: Fn(&LoopHandle) -> CallbackResult + 'static,
    {
        self.on_server_start = Some(Rc::new(hook));
        self
    }

    pub fn on_server_stop<F>(mut self, hook: F) -> Self
    where
        F: Fn(&LoopHandle, bool) -> CallbackResult + 'static,
    {
        self.on_server_stop = Some(Rc::new(hook));
        self
    }

    pub fn on_server_reload<F>(mut self, hook: F) -> Self
    where
        F: Fn(&LoopHandle) -> CallbackResult + 'static,
    {
        self.on_server_reload = Some(Rc::new(hook));
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

    pub fn on_buffer_full<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Connection) -> CallbackResult + 'static,
    {
        self.handlers.on_buffer_full = Some(Rc::new(hook));
        self
    }

    pub fn on_buffer_drain<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Connection) -> CallbackResult + 'static,
    {
        self.handlers.on_buffer_drain = Some(Rc::new(hook));
        self
    }

    pub fn on_websocket_connect<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Connection, &HttpRequest) -> CallbackResult + 'static,
    {
        self.handlers.on_websocket_connect = Some(Rc::new(hook));
        self
    }

    pub fn listen_url(&self) -> &str {
        &self.listen
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self.listener.as_ref()? {
            Listener::Tcp(l) => l.local_addr().ok(),
            Listener::Udp(s) => s.local_addr().ok(),
            Listener::Unix(_) => None,
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.borrow().len()
    }

    /// Snapshot of the live connections accepted on this server.
    pub fn connections(&self) -> Vec<Connection> {
        self.connections
            .borrow()
            .values()
            .cloned()
            .map(Connection::Tcp)
            .collect()
    }

    /// One dump row per live connection.
    pub fn connections_dump(&self) -> Vec<String> {
        self.connections().iter().map(Connection::dump_row).collect()
    }

    /// Embedded mode: resolve the codec, bind and serve on an existing
    /// loop, with no supervisor involved. Single-process tools and tests.
    pub fn start(
        &mut self,
        handle: &LoopHandle,
        stats: &Rc<Statistics>,
    ) -> Result<(), ServerError> {
        if self.scheme.is_empty() {
            self.init(&CodecRegistry::with_builtins())?;
        }
        self.run(handle, stats)
    }

    /// Startup-time resolution: codec lookup, TLS material, and (without
    /// `SO_REUSEPORT`) the bind that workers will inherit across `fork`.
    pub(crate) fn init(&mut self, registry: &CodecRegistry) -> Result<(), ServerError> {
        let (scheme, address) = split_listen_url(&self.listen)?;
        match scheme.as_str() {
            "udp" => self.transport = Transport::Udp,
            "unix" => self.transport = Transport::Unix,
            "ssl" => self.transport = Transport::Ssl,
            _ => {}
        }
        self.codec = registry.create(&scheme)?;
        self.scheme = scheme;
        self.address = address;
        if let Some(files) = &self.tls_files {
            self.tls_config = Some(tls::server_config(files)?);
        } else if self.transport == Transport::Ssl {
            return Err(ServerError::Tls(
                "ssl transport needs certificate and key files".to_string(),
            ));
        }
        if !self.reuse_port {
            self.bind()?;
        }
        Ok(())
    }

    fn socket_addr(&self) -> Result<SocketAddr, ServerError> {
        self.address
            .to_socket_addrs()
            .map_err(|source| ServerError::Bind {
                address: self.listen.clone(),
                source,
            })?
            .next()
            .ok_or_else(|| ServerError::Bind {
                address: self.listen.clone(),
                source: io::Error::new(io::ErrorKind::NotFound, "unresolvable address"),
            })
    }

    pub(crate) fn bind(&mut self) -> Result<(), ServerError> {
        let bind_err = |source: io::Error| ServerError::Bind {
            address: self.listen.clone(),
            source,
        };
        let listener = match self.transport {
            Transport::Udp => {
                let addr = self.socket_addr()?;
                Listener::Udp(Rc::new(
                    sock::bind_udp(&addr, self.reuse_port).map_err(bind_err)?,
                ))
            }
            Transport::Unix => {
                // A previous run's socket file would fail the bind.
                let _ = std::fs::remove_file(&self.address);
                let listener = UnixListener::bind(&self.address).map_err(bind_err)?;
                listener.set_nonblocking(true).map_err(bind_err)?;
                Listener::Unix(Rc::new(listener))
            }
            Transport::Tcp | Transport::Ssl => {
                let addr = self.socket_addr()?;
                Listener::Tcp(Rc::new(
                    sock::listen_tcp(&addr, self.reuse_port, DEFAULT_BACKLOG).map_err(bind_err)?,
                ))
            }
        };
        self.listener = Some(listener);
        info!(server = %self.name, listen = %self.listen, "listening");
        Ok(())
    }

    /// Worker-side start: bind if this worker owns its own socket, then
    /// start accepting.
    pub(crate) fn run(
        &mut self,
        handle: &LoopHandle,
        stats: &Rc<Statistics>,
    ) -> Result<(), ServerError> {
        if self.listener.is_none() {
            self.bind()?;
        }
        self.resume_accept(handle, stats);
        Ok(())
    }

    /// Arms the accept callback on the listening descriptor.
    pub(crate) fn resume_accept(&mut self, handle: &LoopHandle, stats: &Rc<Statistics>) {
        let Some(listener) = self.listener.as_ref() else {
            return;
        };
        let fd = listener.raw_fd();
        match listener {
            Listener::Tcp(l) => {
                let accept = self.tcp_acceptor(l.clone(), stats.clone());
                let _ = handle.on_readable(fd, accept);
            }
            Listener::Unix(l) => {
                let accept = self.unix_acceptor(l.clone(), stats.clone());
                let _ = handle.on_readable(fd, accept);
            }
            Listener::Udp(s) => {
                let accept = self.udp_reader(s.clone(), stats.clone());
                let _ = handle.on_readable(fd, accept);
            }
        }
    }

    /// Detaches the accept callback; live connections keep flowing.
    pub(crate) fn pause_accept(&self, handle: &LoopHandle) {
        if let Some(listener) = self.listener.as_ref() {
            handle.off_readable(listener.raw_fd());
        }
    }

    fn settings(&self, tls: Option<TlsSession>) -> ConnSettings {
        ConnSettings {
            protocol: self.codec.clone(),
            handlers: Rc::new(self.handlers.clone()),
            max_package_size: self.max_package_size,
            max_send_buffer_size: self.max_send_buffer_size,
            tls,
            target: None,
            ping_interval: None,
        }
    }

    fn tcp_acceptor(
        &self,
        listener: Rc<TcpListener>,
        stats: Rc<Statistics>,
    ) -> impl FnMut(&LoopHandle, RawFd) -> CallbackResult {
        let codec = self.codec.clone();
        let handlers = Rc::new(self.handlers.clone());
        let registry = self.connections.clone();
        let tls_config = self.tls_config.clone();
        let max_package_size = self.max_package_size;
        let max_send_buffer_size = self.max_send_buffer_size;
        move |handle, _| {
            loop {
                match listener.accept() {
                    Ok((stream, peer)) => {
                        let tls = match &tls_config {
                            None => None,
                            Some(config) => match TlsSession::server(config.clone()) {
                                Ok(session) => Some(session),
                                Err(err) => {
                                    warn!(error = %err, "tls session setup failed");
                                    continue;
                                }
                            },
                        };
                        let settings = ConnSettings {
                            protocol: codec.clone(),
                            handlers: handlers.clone(),
                            max_package_size,
                            max_send_buffer_size,
                            tls,
                            target: None,
                            ping_interval: None,
                        };
                        let conn = TcpConnection::accepted(
                            StreamSocket::Tcp(stream),
                            peer.to_string(),
                            settings,
                            handle.clone(),
                            stats.clone(),
                            registry.clone(),
                        );
                        if let Some(hook) = &handlers.on_connect {
                            conn.guard(hook(&conn))?;
                        }
                    }
                    // Thundering herd: another worker won this one.
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        break;
                    }
                }
            }
            Ok(())
        }
    }

    fn unix_acceptor(
        &self,
        listener: Rc<UnixListener>,
        stats: Rc<Statistics>,
    ) -> impl FnMut(&LoopHandle, RawFd) -> CallbackResult {
        let settings_template = self.settings(None);
        let handlers = settings_template.handlers.clone();
        let codec = settings_template.protocol.clone();
        let registry = self.connections.clone();
        let max_package_size = self.max_package_size;
        let max_send_buffer_size = self.max_send_buffer_size;
        move |handle, _| {
            loop {
                match listener.accept() {
                    Ok((stream, _)) => {
                        let settings = ConnSettings {
                            protocol: codec.clone(),
                            handlers: handlers.clone(),
                            max_package_size,
                            max_send_buffer_size,
                            tls: None,
                            target: None,
                            ping_interval: None,
                        };
                        let conn = TcpConnection::accepted(
                            StreamSocket::Unix(stream),
                            "unix".to_string(),
                            settings,
                            handle.clone(),
                            stats.clone(),
                            registry.clone(),
                        );
                        if let Some(hook) = &handlers.on_connect {
                            conn.guard(hook(&conn))?;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        warn!(error = %e, "unix accept failed");
                        break;
                    }
                }
            }
            Ok(())
        }
    }

    fn udp_reader(
        &self,
        socket: Rc<UdpSocket>,
        stats: Rc<Statistics>,
    ) -> impl FnMut(&LoopHandle, RawFd) -> CallbackResult {
        let codec = self.codec.clone();
        let handlers = Rc::new(self.handlers.clone());
        let max_package_size = self.max_package_size;
        move |_, _| {
            let mut buf = [0u8; MAX_UDP_PACKAGE];
            loop {
                match socket.recv_from(&mut buf) {
                    Ok((n, peer)) => {
                        let endpoint = UdpEndpoint::new(
                            socket.clone(),
                            peer,
                            codec.clone(),
                            max_package_size,
                        );
                        deliver_datagram(&buf[..n], &endpoint, &handlers, &stats)?;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        warn!(error = %e, "udp recv failed");
                        break;
                    }
                }
            }
            Ok(())
        }
    }

    /// Stops the endpoint: server-stop hook, no new accepts, and for a
    /// graceful stop let connections drain; a forceful one tears them down.
    pub fn stop(&mut self, handle: &LoopHandle, graceful: bool) -> CallbackResult {
        if let Some(hook) = self.on_server_stop.clone() {
            hook(handle, graceful)?;
        }
        self.pause_accept(handle);
        let connections = self.connections();
        for conn in connections {
            if graceful {
                conn.close(None);
            } else {
                conn.destroy();
            }
        }
        if matches!(self.listener, Some(Listener::Unix(_))) {
            let _ = std::fs::remove_file(&self.address);
        }
        self.listener = None;
        Ok(())
    }

    /// Applies the configured unix user/group; runs in the worker after
    /// fork, before serving.
    pub(crate) fn apply_user_group(&self) {
        use nix::unistd::{setgid, setuid, Group, User};
        if let Some(group) = &self.group {
            match Group::from_name(group) {
                Ok(Some(entry)) => {
                    if let Err(err) = setgid(entry.gid) {
                        warn!(group, %err, "setgid failed");
                    }
                }
                _ => warn!(group, "unknown group"),
            }
        }
        if let Some(user) = &self.user {
            match User::from_name(user) {
                Ok(Some(entry)) => {
                    if let Err(err) = setuid(entry.uid) {
                        warn!(user, %err, "setuid failed");
                    }
                }
                _ => warn!(user, "unknown user"),
            }
        }
    }

    /// Reload grace: stop accepting but give existing connections time.
    /// `done` runs once, when the last connection is gone.
    pub(crate) fn drain_then<F>(&self, handle: &LoopHandle, mut done: F)
    where
        F: FnMut(&LoopHandle) -> CallbackResult + 'static,
    {
        let registry = self.connections.clone();
        let slot: Rc<std::cell::RefCell<Option<crate::events::CallbackId>>> =
            Rc::new(std::cell::RefCell::new(None));
        let armed = slot.clone();
        let timer = handle.repeat(Duration::from_millis(100), move |h| {
            if registry.borrow().is_empty() {
                if let Some(id) = armed.borrow_mut().take() {
                    h.cancel(&id);
                }
                done(h)?;
            }
            Ok(())
        });
        if let Ok(id) = timer {
            *slot.borrow_mut() = Some(id);
        }
    }
}
