//! Buffered, non-blocking stream connections.
//!
//! A `TcpConnection` (TCP or Unix stream, plain or TLS) owns its receive
//! and send buffers and runs two small state machines: reads feed the
//! codec's `input -> decode` pipeline until no complete frame remains, and
//! writes drain the send buffer on writability with buffer-full /
//! buffer-drain edges forming the backpressure loop. Application callbacks
//! always run with the connection borrow released; work a codec raises
//! mid-parse is queued as a pending event and dispatched afterwards.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::net::TcpStream;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::rc::{Rc, Weak};
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::error::{BoxError, CallbackResult};
use crate::events::{CallbackId, LoopHandle};
use crate::protocols::websocket::{build_frame, CLOSE_NORMAL, OP_PONG};
use crate::protocols::{
    CodecContext, CodecEvent, FrameVerdict, HttpRequest, Packet, ProtocolCodec, Scratch,
};
use crate::stats::Statistics;

use super::tls::{TlsProgress, TlsSession};
use super::udp::UdpEndpoint;
use super::{sock, ConnectionStatus, ErrorCode, RemoteTarget};

/// File-send page size.
const FILE_PAGE: usize = 1024 * 1024;
/// Read chunk per readiness event.
const READ_CHUNK: usize = 65_535;

thread_local! {
    // Wraps back to 0 at the integer maximum; ids are per worker process.
    static NEXT_ID: Cell<u32> = const { Cell::new(0) };
}

fn next_connection_id() -> u32 {
    NEXT_ID.with(|cell| {
        let id = cell.get().wrapping_add(1);
        cell.set(id);
        id
    })
}

pub(crate) type ConnRef = Rc<RefCell<TcpConnection>>;
pub(crate) type ConnRegistry = Rc<RefCell<HashMap<u32, ConnRef>>>;

type ConnHook = Rc<dyn Fn(&Connection) -> CallbackResult>;
type MessageHook = Rc<dyn Fn(&Connection, Packet) -> CallbackResult>;
type ErrorHook = Rc<dyn Fn(&Connection, ErrorCode, &str) -> CallbackResult>;
type WsConnectHook = Rc<dyn Fn(&Connection, &HttpRequest) -> CallbackResult>;
type WsPayloadHook = Rc<dyn Fn(&Connection, &[u8]) -> CallbackResult>;

/// The application callback set copied onto every connection of a listener
/// (or supplied to an outbound connection).
#[derive(Default, Clone)]
pub struct EventHandlers {
    pub(crate) on_connect: Option<ConnHook>,
    pub(crate) on_message: Option<MessageHook>,
    pub(crate) on_close: Option<ConnHook>,
    pub(crate) on_error: Option<ErrorHook>,
    pub(crate) on_buffer_full: Option<ConnHook>,
    pub(crate) on_buffer_drain: Option<ConnHook>,
    pub(crate) on_websocket_connect: Option<WsConnectHook>,
    pub(crate) on_websocket_ping: Option<WsPayloadHook>,
    pub(crate) on_websocket_pong: Option<WsPayloadHook>,
    pub(crate) on_websocket_close: Option<WsPayloadHook>,
}

pub(crate) enum StreamSocket {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl StreamSocket {
    pub(crate) fn as_raw_fd(&self) -> RawFd {
        match self {
            StreamSocket::Tcp(s) => s.as_raw_fd(),
            StreamSocket::Unix(s) => s.as_raw_fd(),
        }
    }
}

impl Read for StreamSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            StreamSocket::Tcp(s) => s.read(buf),
            StreamSocket::Unix(s) => s.read(buf),
        }
    }
}

impl Write for StreamSocket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            StreamSocket::Tcp(s) => s.write(buf),
            StreamSocket::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            StreamSocket::Tcp(s) => s.flush(),
            StreamSocket::Unix(s) => s.flush(),
        }
    }
}

/// Side effects queued while the connection is borrowed.
enum PendingEvent {
    Codec(CodecEvent),
    BufferFull,
    BufferDrain,
    Destroy,
}

struct FileStream {
    file: File,
    remaining: u64,
}

/// Construction parameters shared by the accept and connect paths.
pub(crate) struct ConnSettings {
    pub protocol: Option<Rc<dyn ProtocolCodec>>,
    pub handlers: Rc<EventHandlers>,
    pub max_package_size: usize,
    pub max_send_buffer_size: usize,
    pub tls: Option<TlsSession>,
    pub target: Option<RemoteTarget>,
    pub ping_interval: Option<Duration>,
}

pub struct TcpConnection {
    pub(crate) id: u32,
    socket: Option<StreamSocket>,
    fd: RawFd,
    status: ConnectionStatus,
    remote_address: String,
    recv_buffer: Vec<u8>,
    send_buffer: Vec<u8>,
    bytes_read: u64,
    bytes_written: u64,
    max_package_size: usize,
    max_send_buffer_size: usize,
    protocol: Option<Rc<dyn ProtocolCodec>>,
    handlers: Rc<EventHandlers>,
    error_handler: Option<Rc<dyn Fn(&Connection, BoxError) -> CallbackResult>>,
    scratch: Scratch,
    pending: VecDeque<PendingEvent>,
    paused: bool,
    buffer_full: bool,
    tls: Option<TlsSession>,
    tls_ready: bool,
    file_stream: Option<FileStream>,
    target: Option<RemoteTarget>,
    ping_interval: Option<Duration>,
    ping_timer: Option<CallbackId>,
    handle: LoopHandle,
    stats: Rc<Statistics>,
    registry: Option<ConnRegistry>,
    self_ref: Weak<RefCell<TcpConnection>>,
}

impl TcpConnection {
    fn build(
        socket: StreamSocket,
        remote_address: String,
        status: ConnectionStatus,
        settings: ConnSettings,
        handle: LoopHandle,
        stats: Rc<Statistics>,
        registry: Option<ConnRegistry>,
    ) -> ConnRef {
        let fd = socket.as_raw_fd();
        let tls_ready = settings.tls.is_none();
        let conn = Rc::new(RefCell::new(TcpConnection {
            id: next_connection_id(),
            socket: Some(socket),
            fd,
            status,
            remote_address,
            recv_buffer: Vec::new(),
            send_buffer: Vec::new(),
            bytes_read: 0,
            bytes_written: 0,
            max_package_size: settings.max_package_size,
            max_send_buffer_size: settings.max_send_buffer_size,
            protocol: settings.protocol,
            handlers: settings.handlers,
            error_handler: None,
            scratch: Scratch::None,
            pending: VecDeque::new(),
            paused: false,
            buffer_full: false,
            tls: settings.tls,
            tls_ready,
            file_stream: None,
            target: settings.target,
            ping_interval: settings.ping_interval,
            ping_timer: None,
            handle,
            stats: stats.clone(),
            registry,
            self_ref: Weak::new(),
        }));
        conn.borrow_mut().self_ref = Rc::downgrade(&conn);
        if let Some(registry) = conn.borrow().registry.clone() {
            registry.borrow_mut().insert(conn.borrow().id, conn.clone());
        }
        stats.connection_opened();
        conn
    }

    /// Wraps an accepted stream: options applied, read armed immediately.
    pub(crate) fn accepted(
        socket: StreamSocket,
        remote_address: String,
        settings: ConnSettings,
        handle: LoopHandle,
        stats: Rc<Statistics>,
        registry: ConnRegistry,
    ) -> Connection {
        let _ = sock::tune_stream(socket.as_raw_fd());
        let conn = Self::build(
            socket,
            remote_address,
            ConnectionStatus::Established,
            settings,
            handle,
            stats,
            Some(registry),
        );
        let connection = Connection::Tcp(conn);
        connection.arm_read();
        connection
    }

    /// Wraps an in-progress outbound stream; the connector arms writability
    /// itself and promotes the status once the connect resolves.
    pub(crate) fn outbound(
        socket: StreamSocket,
        remote_address: String,
        settings: ConnSettings,
        handle: LoopHandle,
        stats: Rc<Statistics>,
    ) -> Connection {
        let conn = Self::build(
            socket,
            remote_address,
            ConnectionStatus::Connecting,
            settings,
            handle,
            stats,
            None,
        );
        Connection::Tcp(conn)
    }

    fn raise_event(&mut self, event: PendingEvent) {
        self.pending.push_back(event);
    }

    /// Appends to the send buffer, enforcing the drop-on-overflow policy and
    /// the full-edge callback.
    fn buffer_send(&mut self, data: &[u8]) -> bool {
        if self.send_buffer.len() >= self.max_send_buffer_size {
            self.stats.send_failed();
            self.raise_event(PendingEvent::Codec(CodecEvent::Error {
                code: ErrorCode::SendFail,
                message: "send buffer full and drop package".to_string(),
            }));
            return false;
        }
        self.send_buffer.extend_from_slice(data);
        self.check_buffer_full();
        true
    }

    fn check_buffer_full(&mut self) {
        if !self.buffer_full && self.send_buffer.len() >= self.max_send_buffer_size {
            self.buffer_full = true;
            self.raise_event(PendingEvent::BufferFull);
        }
    }

    /// Writes to the wire, through TLS when active. Returns bytes consumed.
    fn write_wire(&mut self, data: &[u8]) -> io::Result<usize> {
        let Some(socket) = self.socket.as_mut() else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "socket gone"));
        };
        match self.tls.as_mut() {
            Some(tls) => {
                tls.write_plain(data)?;
                tls.flush(socket)?;
                Ok(data.len())
            }
            None => socket.write(data),
        }
    }

    /// Fast path: try the socket directly, spill the tail into the buffer.
    fn send_or_buffer(&mut self, wire: &[u8]) -> bool {
        let connected = self.status == ConnectionStatus::Established && self.tls_ready;
        // Direct write only from a live connection with an empty backlog;
        // everything else queues and drains on writability.
        if !connected || !self.send_buffer.is_empty() {
            let queued = self.buffer_send(wire);
            if queued && connected {
                self.arm_write_interest();
            }
            return queued;
        }
        match self.write_wire(wire) {
            Ok(n) if n >= wire.len() => {
                self.bytes_written += wire.len() as u64;
                true
            }
            Ok(n) => {
                self.bytes_written += n as u64;
                let queued = self.buffer_send(&wire[n..]);
                self.arm_write_interest();
                queued
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                let queued = self.buffer_send(wire);
                self.arm_write_interest();
                queued
            }
            Err(e) => {
                debug!(id = self.id, error = %e, "direct write failed");
                self.stats.send_failed();
                self.raise_event(PendingEvent::Codec(CodecEvent::Error {
                    code: ErrorCode::SendFail,
                    message: "client closed".to_string(),
                }));
                self.raise_event(PendingEvent::Destroy);
                false
            }
        }
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn loop_handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    pub(crate) fn handlers_on_connect(&self) -> Option<Rc<dyn Fn(&Connection) -> CallbackResult>> {
        self.handlers.on_connect.clone()
    }

    pub(crate) fn protocol(&self) -> Option<Rc<dyn ProtocolCodec>> {
        self.protocol.clone()
    }

    pub(crate) fn has_pending_send(&self) -> bool {
        !self.send_buffer.is_empty()
    }

    /// Direct socket read, bypassing the codec pipeline. Used by proxy
    /// handshakes that run before the connection is promoted.
    pub(crate) fn read_raw(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.socket.as_mut() {
            Some(socket) => socket.read(buf),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "socket gone")),
        }
    }

    /// Direct socket write, bypassing the send buffer. Proxy handshakes
    /// only; the payload is small enough to assume the fresh socket takes it.
    pub(crate) fn write_direct(&mut self, data: &[u8]) -> io::Result<()> {
        let mut written = 0;
        while written < data.len() {
            match self.write_wire(&data[written..]) {
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    // Spill the tail; it drains once writable.
                    let tail = data[written..].to_vec();
                    self.send_buffer.extend_from_slice(&tail);
                    self.arm_write_interest();
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub(crate) fn promote_established(&mut self) {
        self.status = ConnectionStatus::Established;
    }

    /// Installs a client TLS session and pushes its first flight.
    pub(crate) fn install_tls(&mut self, session: TlsSession) {
        let mut tls = session;
        self.tls_ready = false;
        if let Some(mut socket) = self.socket.take() {
            match tls.flush(&mut socket) {
                Ok(true) => self.arm_write_interest(),
                Ok(false) => {}
                Err(e) => {
                    trace!(id = self.id, error = %e, "tls first flight failed");
                    self.raise_event(PendingEvent::Destroy);
                }
            }
            self.socket = Some(socket);
        }
        self.tls = Some(tls);
    }

    pub(crate) fn fail_connect(&mut self, message: String) {
        self.raise_event(PendingEvent::Codec(CodecEvent::Error {
            code: ErrorCode::ConnectFail,
            message,
        }));
        self.raise_event(PendingEvent::Destroy);
    }

    pub(crate) fn arm_write_interest(&mut self) {
        let weak = self.self_ref.clone();
        let _ = self.handle.on_writable(self.fd, move |_, _| match weak.upgrade() {
            Some(rc) => base_write(&Connection::Tcp(rc)),
            None => Ok(()),
        });
    }

    pub(crate) fn arm_read_interest(&mut self) {
        let weak = self.self_ref.clone();
        let _ = self.handle.on_readable(self.fd, move |_, _| match weak.upgrade() {
            Some(rc) => base_read(&Connection::Tcp(rc)),
            None => Ok(()),
        });
    }

    /// Refills the send buffer from the in-flight file until the buffer-full
    /// edge, end of file, or a read error.
    fn pump_file(&mut self) {
        let Some(stream) = self.file_stream.as_mut() else {
            return;
        };
        let mut page = vec![0u8; FILE_PAGE];
        while self.send_buffer.len() < self.max_send_buffer_size && stream.remaining > 0 {
            let want = (stream.remaining as usize).min(FILE_PAGE);
            match stream.file.read(&mut page[..want]) {
                Ok(0) => {
                    stream.remaining = 0;
                    break;
                }
                Ok(n) => {
                    stream.remaining -= n as u64;
                    self.send_buffer.extend_from_slice(&page[..n]);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(id = self.id, error = %e, "file stream read failed");
                    stream.remaining = 0;
                    break;
                }
            }
        }
        if self.file_stream.as_ref().is_some_and(|s| s.remaining == 0) {
            self.file_stream = None;
        }
        self.check_buffer_full();
    }
}

impl CodecContext for TcpConnection {
    fn scratch(&mut self) -> &mut Scratch {
        &mut self.scratch
    }

    fn max_package_size(&self) -> usize {
        self.max_package_size
    }

    fn max_send_buffer_size(&self) -> usize {
        self.max_send_buffer_size
    }

    fn remote_address(&self) -> String {
        self.remote_address.clone()
    }

    fn target(&self) -> Option<&RemoteTarget> {
        self.target.as_ref()
    }

    fn send_raw(&mut self, bytes: &[u8]) {
        self.send_or_buffer(bytes);
    }

    fn close_with(&mut self, reply: &[u8]) {
        if self.status >= ConnectionStatus::Closing {
            return;
        }
        if !reply.is_empty() {
            self.send_or_buffer(reply);
        }
        self.status = ConnectionStatus::Closing;
        if self.send_buffer.is_empty() {
            self.raise_event(PendingEvent::Destroy);
        } else {
            self.paused = true;
            self.arm_write_interest();
        }
    }

    fn raise(&mut self, event: CodecEvent) {
        self.raise_event(PendingEvent::Codec(event));
    }
}

/// Public connection handle delivered to application callbacks.
#[derive(Clone)]
pub enum Connection {
    Tcp(ConnRef),
    Udp(UdpEndpoint),
}

impl Connection {
    pub fn id(&self) -> u32 {
        match self {
            Connection::Tcp(rc) => rc.borrow().id,
            Connection::Udp(u) => u.id(),
        }
    }

    pub fn remote_address(&self) -> String {
        match self {
            Connection::Tcp(rc) => rc.borrow().remote_address.clone(),
            Connection::Udp(u) => u.remote_address(),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        match self {
            Connection::Tcp(rc) => rc.borrow().status,
            Connection::Udp(_) => ConnectionStatus::Established,
        }
    }

    pub fn bytes_read(&self) -> u64 {
        match self {
            Connection::Tcp(rc) => rc.borrow().bytes_read,
            Connection::Udp(_) => 0,
        }
    }

    pub fn bytes_written(&self) -> u64 {
        match self {
            Connection::Tcp(rc) => rc.borrow().bytes_written,
            Connection::Udp(_) => 0,
        }
    }

    /// Encodes (unless `raw`) and transmits or queues one packet. `false`
    /// means the packet was dropped or the connection is going away.
    pub fn send(&self, packet: impl Into<Packet>) -> bool {
        self.send_packet(packet.into(), false)
    }

    pub fn send_raw(&self, packet: impl Into<Packet>) -> bool {
        self.send_packet(packet.into(), true)
    }

    fn send_packet(&self, packet: Packet, raw: bool) -> bool {
        match self {
            Connection::Udp(u) => u.send_packet(packet, raw),
            Connection::Tcp(rc) => {
                let ok = {
                    let mut c = rc.borrow_mut();
                    if c.status >= ConnectionStatus::Closing {
                        return false;
                    }
                    let wire = if raw {
                        Some(packet.into_bytes())
                    } else {
                        match c.protocol.clone() {
                            Some(codec) => match codec.encode(packet, &mut *c) {
                                Ok(wire) => Some(wire),
                                Err(err) => {
                                    warn!(id = c.id, error = %err, "encode failed");
                                    c.raise_event(PendingEvent::Destroy);
                                    None
                                }
                            },
                            None => Some(packet.into_bytes()),
                        }
                    };
                    match wire {
                        None => false,
                        // Empty wire: the codec queued the bytes itself.
                        Some(wire) if wire.is_empty() => true,
                        Some(wire) => c.send_or_buffer(&wire),
                    }
                };
                if let Err(err) = dispatch_pending(self) {
                    warn!(id = self.id(), error = %err, "send-side hook failed");
                }
                ok
            }
        }
    }

    /// Streams a file region after an optional protocol header, paged and
    /// throttled by the buffer-full / buffer-drain edges.
    pub fn send_file(
        &self,
        path: &Path,
        offset: u64,
        length: u64,
        header: Option<&[u8]>,
    ) -> io::Result<()> {
        let Connection::Tcp(rc) = self else {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "file streaming needs a stream transport",
            ));
        };
        let mut file = File::open(path)?;
        let total = file.metadata()?.len();
        let remaining = if length == 0 {
            total.saturating_sub(offset)
        } else {
            length.min(total.saturating_sub(offset))
        };
        file.seek(SeekFrom::Start(offset))?;

        {
            let mut c = rc.borrow_mut();
            if let Some(header) = header {
                c.send_or_buffer(header);
            }
            c.file_stream = Some(FileStream { file, remaining });
            c.pump_file();
            if !c.send_buffer.is_empty() {
                c.arm_write_interest();
            }
        }
        let _ = dispatch_pending(self);
        Ok(())
    }

    /// Optionally sends a final packet, then closes once the send buffer
    /// drains. Reads pause for the drain window.
    pub fn close(&self, data: Option<Packet>) {
        if let Connection::Udp(_) = self {
            return;
        }
        if let Some(packet) = data {
            self.send_packet(packet, false);
        }
        let destroy_now = {
            let Connection::Tcp(rc) = self else { return };
            let mut c = rc.borrow_mut();
            if c.status >= ConnectionStatus::Closing {
                c.status != ConnectionStatus::Closed && c.send_buffer.is_empty()
            } else {
                c.status = ConnectionStatus::Closing;
                if c.send_buffer.is_empty() {
                    true
                } else {
                    c.paused = true;
                    let _ = c.handle.off_readable(c.fd);
                    c.arm_write_interest();
                    false
                }
            }
        };
        if destroy_now {
            destroy(self);
        }
    }

    /// Immediate teardown: deregisters I/O, closes the socket, clears
    /// buffers and scratch, fires `on_close`, and removes the connection
    /// from its server registry. Safe to call repeatedly.
    pub fn destroy(&self) {
        destroy(self);
    }

    pub fn pause_recv(&self) {
        if let Connection::Tcp(rc) = self {
            let mut c = rc.borrow_mut();
            c.paused = true;
            let fd = c.fd;
            let _ = c.handle.off_readable(fd);
        }
    }

    pub fn resume_recv(&self) {
        let Connection::Tcp(rc) = self else { return };
        {
            let mut c = rc.borrow_mut();
            if c.status >= ConnectionStatus::Closing {
                return;
            }
            c.paused = false;
            c.arm_read_interest();
        }
        // Frames may already sit buffered from before the pause.
        let this = self.clone();
        let handle = rc.borrow().handle.clone();
        handle.queue(move |_| process_packets(&this));
    }

    /// Installs a per-connection error handler for failures raised by this
    /// connection's callbacks.
    pub fn set_error_handler<F>(&self, handler: F)
    where
        F: Fn(&Connection, BoxError) -> CallbackResult + 'static,
    {
        if let Connection::Tcp(rc) = self {
            rc.borrow_mut().error_handler = Some(Rc::new(handler));
        }
    }

    /// One status-file row for connection dumps.
    pub fn dump_row(&self) -> String {
        match self {
            Connection::Tcp(rc) => {
                let c = rc.borrow();
                format!(
                    "{} {} recv:{} send:{} in:{} out:{} {:?}",
                    c.id,
                    c.remote_address,
                    c.recv_buffer.len(),
                    c.send_buffer.len(),
                    c.bytes_read,
                    c.bytes_written,
                    c.status
                )
            }
            Connection::Udp(u) => format!("0 {} udp", u.remote_address()),
        }
    }

    pub(crate) fn arm_read(&self) {
        if let Connection::Tcp(rc) = self {
            rc.borrow_mut().arm_read_interest();
        }
    }

    /// Runs `result` through the connection error handler; unhandled errors
    /// propagate to the event loop (and from there to the worker's fatal
    /// path).
    pub(crate) fn guard(&self, result: CallbackResult) -> CallbackResult {
        let Err(err) = result else { return Ok(()) };
        let handler = match self {
            Connection::Tcp(rc) => {
                let c = rc.borrow();
                c.stats.exception_thrown();
                c.error_handler.clone()
            }
            Connection::Udp(_) => None,
        };
        match handler {
            Some(handler) => handler(self, err),
            None => Err(err),
        }
    }
}

/// Readable event: pull bytes (through TLS when armed), then walk frames.
pub(crate) fn base_read(conn: &Connection) -> CallbackResult {
    let Connection::Tcp(rc) = conn else {
        return Ok(());
    };
    let mut saw_eof = false;
    let mut fatal = false;
    {
        let mut c = rc.borrow_mut();

        if c.tls.is_some() && !c.tls_ready {
            match tls_read_step(&mut c) {
                TlsStep::NeedMore => return Ok(()),
                TlsStep::Fatal => {
                    drop(c);
                    destroy(conn);
                    return Ok(());
                }
                TlsStep::Ready => {}
            }
        } else if c.tls.is_some() {
            match tls_read_step(&mut c) {
                TlsStep::Fatal => {
                    drop(c);
                    destroy(conn);
                    return Ok(());
                }
                _ => {}
            }
        } else {
            let mut chunk = [0u8; READ_CHUNK];
            loop {
                if c.paused {
                    break;
                }
                let Some(socket) = c.socket.as_mut() else { break };
                match socket.read(&mut chunk) {
                    Ok(0) => {
                        saw_eof = true;
                        break;
                    }
                    Ok(n) => {
                        c.bytes_read += n as u64;
                        c.recv_buffer.extend_from_slice(&chunk[..n]);
                        if n < chunk.len() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        trace!(id = c.id, error = %e, "read failed");
                        fatal = true;
                        break;
                    }
                }
            }
        }
    }

    process_packets(conn)?;

    if saw_eof || fatal {
        destroy(conn);
    }
    Ok(())
}

enum TlsStep {
    NeedMore,
    Ready,
    Fatal,
}

/// One TLS readable turn: ciphertext in, plaintext appended to the receive
/// buffer, handshake progressed. Flushes queued application bytes the
/// moment the handshake completes.
fn tls_read_step(c: &mut TcpConnection) -> TlsStep {
    let Some(mut socket) = c.socket.take() else {
        return TlsStep::Fatal;
    };
    let Some(mut tls) = c.tls.take() else {
        c.socket = Some(socket);
        return TlsStep::Ready;
    };

    let mut plaintext = Vec::new();
    let outcome = tls.on_readable(&mut socket, &mut plaintext);
    // Handshake records may want to go out immediately.
    let flush_outcome = tls.flush(&mut socket);

    c.recv_buffer.extend_from_slice(&plaintext);
    c.bytes_read += plaintext.len() as u64;

    let step = match (outcome, flush_outcome) {
        (Err(_), _) | (_, Err(_)) => TlsStep::Fatal,
        (Ok(TlsProgress::Eof), _) => TlsStep::Fatal,
        (Ok(TlsProgress::NeedMore), _) => TlsStep::NeedMore,
        (Ok(TlsProgress::Ready), Ok(more)) => {
            if more {
                c.arm_write_interest();
            }
            TlsStep::Ready
        }
    };

    c.tls = Some(tls);
    c.socket = Some(socket);

    if matches!(step, TlsStep::Ready) && !c.tls_ready {
        c.tls_ready = true;
        debug!(id = c.id, "tls handshake complete");
        // Everything the application queued during the handshake.
        if !c.send_buffer.is_empty() {
            let queued = std::mem::take(&mut c.send_buffer);
            c.send_or_buffer(&queued);
        }
    }
    step
}

/// Walks the codec pipeline over the receive buffer until it runs dry,
/// dispatching one message per iteration with the borrow released.
pub(crate) fn process_packets(conn: &Connection) -> CallbackResult {
    let Connection::Tcp(rc) = conn else {
        return Ok(());
    };
    loop {
        enum Step {
            Deliver(Packet),
            Consumed,
            Stop,
            CloseNow,
        }
        let step = {
            let mut c = rc.borrow_mut();
            if c.status >= ConnectionStatus::Closing || c.paused || c.recv_buffer.is_empty() {
                Step::Stop
            } else {
                match c.protocol.clone() {
                    None => {
                        let chunk = std::mem::take(&mut c.recv_buffer);
                        c.stats.request_decoded();
                        Step::Deliver(Packet::Bytes(chunk))
                    }
                    Some(codec) => {
                        let buffer = std::mem::take(&mut c.recv_buffer);
                        let verdict = codec.input(&buffer, &mut *c);
                        c.recv_buffer = buffer;
                        match verdict {
                            FrameVerdict::NeedMore => Step::Stop,
                            FrameVerdict::Close => Step::CloseNow,
                            FrameVerdict::Frame(n) if c.recv_buffer.len() < n => Step::Stop,
                            FrameVerdict::Frame(n) => {
                                let frame: Vec<u8> = c.recv_buffer.drain(..n).collect();
                                match codec.decode(&frame, &mut *c) {
                                    Ok(Some(packet)) => {
                                        c.stats.request_decoded();
                                        Step::Deliver(packet)
                                    }
                                    Ok(None) => Step::Consumed,
                                    Err(err) => {
                                        warn!(id = c.id, error = %err, "decode failed");
                                        Step::CloseNow
                                    }
                                }
                            }
                        }
                    }
                }
            }
        };

        dispatch_pending(conn)?;

        match step {
            Step::Stop => break,
            Step::Consumed => continue,
            Step::Deliver(packet) => {
                let handler = rc.borrow().handlers.on_message.clone();
                if let Some(handler) = handler {
                    let result = handler(conn, packet);
                    conn.guard(result)?;
                }
            }
            Step::CloseNow => {
                // A codec that queued a reply flipped the status already;
                // the drain path finishes the close.
                if conn.status() < ConnectionStatus::Closing {
                    destroy(conn);
                }
                break;
            }
        }
    }
    Ok(())
}

/// Writable event: drain the send buffer, refill from a file stream, fire
/// the drain edge, finish deferred closes.
pub(crate) fn base_write(conn: &Connection) -> CallbackResult {
    let Connection::Tcp(rc) = conn else {
        return Ok(());
    };
    {
        let mut c = rc.borrow_mut();
        // The drain edge fires only on a real non-empty -> empty transition.
        // TLS handshake flights arm writability without queueing application
        // bytes, so an empty buffer here does not imply a drain.
        let was_pending = !c.send_buffer.is_empty() || c.buffer_full;

        // TLS may have pending records independent of the plain buffer.
        if let Some(mut socket) = c.socket.take() {
            if let Some(mut tls) = c.tls.take() {
                let flushed = tls.flush(&mut socket);
                c.tls = Some(tls);
                if flushed.is_err() {
                    c.raise_event(PendingEvent::Destroy);
                }
            }
            c.socket = Some(socket);
        }

        if !c.send_buffer.is_empty() && c.tls_ready {
            let buffer = std::mem::take(&mut c.send_buffer);
            match c.write_wire(&buffer) {
                Ok(n) => {
                    c.bytes_written += n as u64;
                    if n < buffer.len() {
                        c.send_buffer = buffer[n..].to_vec();
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    c.send_buffer = buffer;
                }
                Err(e) => {
                    trace!(id = c.id, error = %e, "drain write failed");
                    c.raise_event(PendingEvent::Destroy);
                }
            }
        }

        if c.send_buffer.is_empty() {
            if was_pending {
                c.buffer_full = false;
                c.raise_event(PendingEvent::BufferDrain);
            }
            // Backpressure loop: the drained buffer pulls the next file page.
            if c.file_stream.is_some() {
                c.pump_file();
            }
            if c.send_buffer.is_empty() {
                let fd = c.fd;
                let _ = c.handle.off_writable(fd);
                let tls_pending = c.tls.as_ref().is_some_and(|t| t.wants_write());
                if tls_pending {
                    c.arm_write_interest();
                } else if c.status == ConnectionStatus::Closing {
                    c.raise_event(PendingEvent::Destroy);
                }
            }
        }
    }
    dispatch_pending(conn)
}

/// Runs queued events with the borrow released: buffer edges, websocket
/// hooks and their default replies, error callbacks, deferred destroys.
pub(crate) fn dispatch_pending(conn: &Connection) -> CallbackResult {
    let Connection::Tcp(rc) = conn else {
        return Ok(());
    };
    loop {
        let event = { rc.borrow_mut().pending.pop_front() };
        let Some(event) = event else { break };
        match event {
            PendingEvent::BufferFull => {
                let hook = rc.borrow().handlers.on_buffer_full.clone();
                if let Some(hook) = hook {
                    conn.guard(hook(conn))?;
                }
            }
            PendingEvent::BufferDrain => {
                let hook = rc.borrow().handlers.on_buffer_drain.clone();
                if let Some(hook) = hook {
                    conn.guard(hook(conn))?;
                }
            }
            PendingEvent::Destroy => {
                destroy(conn);
            }
            PendingEvent::Codec(codec_event) => match codec_event {
                CodecEvent::WebSocketConnect(request) => {
                    arm_ws_keepalive(rc);
                    let hook = rc.borrow().handlers.on_websocket_connect.clone();
                    if let Some(hook) = hook {
                        conn.guard(hook(conn, &request))?;
                    }
                }
                CodecEvent::WebSocketPing(payload) => {
                    let hook = rc.borrow().handlers.on_websocket_ping.clone();
                    match hook {
                        Some(hook) => conn.guard(hook(conn, &payload))?,
                        None => {
                            // Client-role pongs must be masked.
                            let is_client = rc.borrow().target.is_some();
                            let pong = if is_client {
                                crate::protocols::ws_client::build_masked_frame(
                                    0x80 | OP_PONG,
                                    &payload,
                                )
                            } else {
                                build_frame(0x80 | OP_PONG, &payload)
                            };
                            rc.borrow_mut().send_or_buffer(&pong);
                        }
                    }
                }
                CodecEvent::WebSocketPong(payload) => {
                    let hook = rc.borrow().handlers.on_websocket_pong.clone();
                    if let Some(hook) = hook {
                        conn.guard(hook(conn, &payload))?;
                    }
                }
                CodecEvent::WebSocketClose(payload) => {
                    let hook = rc.borrow().handlers.on_websocket_close.clone();
                    match hook {
                        Some(hook) => conn.guard(hook(conn, &payload))?,
                        None => {
                            rc.borrow_mut().send_or_buffer(&CLOSE_NORMAL);
                            conn.close(None);
                        }
                    }
                }
                CodecEvent::Error { code, message } => {
                    let hook = rc.borrow().handlers.on_error.clone();
                    if let Some(hook) = hook {
                        conn.guard(hook(conn, code, &message))?;
                    } else {
                        debug!(id = conn.id(), ?code, message, "connection error");
                    }
                }
            },
        }
    }
    Ok(())
}

/// Client role: first websocket connect event arms the keepalive ping.
fn arm_ws_keepalive(rc: &ConnRef) {
    let interval = {
        let c = rc.borrow();
        match (c.ping_interval, &c.ping_timer) {
            (Some(interval), None) => Some(interval),
            _ => None,
        }
    };
    let Some(interval) = interval else { return };
    let weak = rc.borrow().self_ref.clone();
    let handle = rc.borrow().handle.clone();
    let timer = handle.repeat(interval, move |_| {
        if let Some(rc) = weak.upgrade() {
            rc.borrow_mut()
                .send_or_buffer(&crate::protocols::ws_client::KEEPALIVE_PING);
        }
        Ok(())
    });
    if let Ok(id) = timer {
        rc.borrow_mut().ping_timer = Some(id);
    }
}

fn destroy(conn: &Connection) {
    let Connection::Tcp(rc) = conn else { return };
    let on_close = {
        let mut c = rc.borrow_mut();
        if c.status == ConnectionStatus::Closed {
            return;
        }
        c.status = ConnectionStatus::Closed;
        let fd = c.fd;
        let _ = c.handle.off_readable(fd);
        let _ = c.handle.off_writable(fd);
        if let Some(timer) = c.ping_timer.take() {
            c.handle.cancel(&timer);
        }
        c.socket = None;
        c.recv_buffer = Vec::new();
        c.send_buffer = Vec::new();
        c.file_stream = None;
        c.tls = None;
        // Codec state (handshake flags, fragment buffers) dies with the
        // connection.
        c.scratch = Scratch::None;
        c.pending.clear();
        c.stats.connection_closed();
        if let Some(registry) = c.registry.take() {
            registry.borrow_mut().remove(&c.id);
        }
        c.handlers.on_close.clone()
    };
    if let Some(hook) = on_close {
        let result = hook(conn);
        let _ = conn.guard(result);
    }
}
