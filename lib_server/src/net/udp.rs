//! Datagram endpoints.
//!
//! UDP carries no buffers and no connection state: every datagram is at
//! most 65 535 bytes, decoded in place (a datagram may hold several frames)
//! and answered with single `send_to` calls. The async variant creates its
//! socket lazily on first send.

use std::cell::RefCell;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::os::fd::AsRawFd;
use std::rc::Rc;

use tracing::{debug, warn};

use crate::error::{CallbackResult, ServerError};
use crate::events::LoopHandle;
use crate::protocols::{
    CodecContext, CodecEvent, FrameVerdict, Packet, ProtocolCodec, Scratch,
};
use crate::stats::Statistics;

use super::connection::{Connection, EventHandlers};
use super::{sock, RemoteTarget, MAX_UDP_PACKAGE};

/// One peer of a UDP listener (or the fixed peer of an async connection).
#[derive(Clone)]
pub struct UdpEndpoint {
    socket: Rc<UdpSocket>,
    remote: SocketAddr,
    protocol: Option<Rc<dyn ProtocolCodec>>,
    max_package_size: usize,
}

impl UdpEndpoint {
    pub(crate) fn new(
        socket: Rc<UdpSocket>,
        remote: SocketAddr,
        protocol: Option<Rc<dyn ProtocolCodec>>,
        max_package_size: usize,
    ) -> Self {
        Self {
            socket,
            remote,
            protocol,
            max_package_size,
        }
    }

    pub fn id(&self) -> u32 {
        0
    }

    pub fn remote_address(&self) -> String {
        self.remote.to_string()
    }

    pub(crate) fn send_packet(&self, packet: Packet, raw: bool) -> bool {
        let wire = if raw {
            packet.into_bytes()
        } else {
            match &self.protocol {
                None => packet.into_bytes(),
                Some(codec) => {
                    let mut ctx = DatagramContext::new(self.max_package_size);
                    match codec.encode(packet, &mut ctx) {
                        Ok(wire) => wire,
                        Err(err) => {
                            warn!(error = %err, "udp encode failed");
                            return false;
                        }
                    }
                }
            }
        };
        if wire.len() > MAX_UDP_PACKAGE {
            warn!(len = wire.len(), "datagram over 65535 bytes dropped");
            return false;
        }
        self.socket.send_to(&wire, self.remote).is_ok()
    }
}

/// Throwaway codec context for the datagram path. Scratch dies with the
/// datagram; raw sends go straight out as datagrams.
pub(crate) struct DatagramContext {
    scratch: Scratch,
    max_package_size: usize,
    pub(crate) outgoing: Vec<Vec<u8>>,
    pub(crate) events: Vec<CodecEvent>,
}

impl DatagramContext {
    pub(crate) fn new(max_package_size: usize) -> Self {
        Self {
            scratch: Scratch::None,
            max_package_size,
            outgoing: Vec::new(),
            events: Vec::new(),
        }
    }
}

impl CodecContext for DatagramContext {
    fn scratch(&mut self) -> &mut Scratch {
        &mut self.scratch
    }

    fn max_package_size(&self) -> usize {
        self.max_package_size
    }

    fn max_send_buffer_size(&self) -> usize {
        MAX_UDP_PACKAGE
    }

    fn remote_address(&self) -> String {
        String::new()
    }

    fn target(&self) -> Option<&RemoteTarget> {
        None
    }

    fn send_raw(&mut self, bytes: &[u8]) {
        self.outgoing.push(bytes.to_vec());
    }

    fn close_with(&mut self, reply: &[u8]) {
        if !reply.is_empty() {
            self.outgoing.push(reply.to_vec());
        }
    }

    fn raise(&mut self, event: CodecEvent) {
        self.events.push(event);
    }
}

/// Runs the `input -> decode` loop across one datagram, delivering every
/// decoded frame. Datagram boundaries end the walk: leftover bytes that do
/// not form a frame are dropped with the datagram.
pub(crate) fn deliver_datagram(
    data: &[u8],
    endpoint: &UdpEndpoint,
    handlers: &Rc<EventHandlers>,
    stats: &Rc<Statistics>,
) -> CallbackResult {
    let connection = Connection::Udp(endpoint.clone());
    match &endpoint.protocol {
        None => {
            stats.request_decoded();
            if let Some(hook) = &handlers.on_message {
                hook(&connection, Packet::Bytes(data.to_vec()))?;
            }
        }
        Some(codec) => {
            let mut rest = data;
            while !rest.is_empty() {
                let mut ctx = DatagramContext::new(endpoint.max_package_size);
                let frame_len = match codec.input(rest, &mut ctx) {
                    FrameVerdict::Frame(n) if n <= rest.len() => n,
                    _ => break,
                };
                let packet = match codec.decode(&rest[..frame_len], &mut ctx) {
                    Ok(Some(packet)) => Some(packet),
                    Ok(None) => None,
                    Err(err) => {
                        debug!(error = %err, "udp decode failed; datagram dropped");
                        break;
                    }
                };
                for reply in ctx.outgoing.drain(..) {
                    let _ = endpoint.socket.send_to(&reply, endpoint.remote);
                }
                for event in ctx.events.drain(..) {
                    if let CodecEvent::Error { code, message } = event {
                        debug!(?code, message, "udp codec error");
                    }
                }
                if let Some(packet) = packet {
                    stats.request_decoded();
                    if let Some(hook) = &handlers.on_message {
                        hook(&connection, packet)?;
                    }
                }
                rest = &rest[frame_len..];
            }
        }
    }
    Ok(())
}

/// Outbound datagram peer. The socket comes up on the first send and
/// replies flow back through `on_message`.
pub struct AsyncUdpConnection {
    target: RemoteTarget,
    protocol: Option<Rc<dyn ProtocolCodec>>,
    handlers: Rc<EventHandlers>,
    handle: LoopHandle,
    stats: Rc<Statistics>,
    socket: RefCell<Option<Rc<UdpSocket>>>,
    max_package_size: usize,
}

impl AsyncUdpConnection {
    pub fn new(
        handle: LoopHandle,
        stats: Rc<Statistics>,
        url: &str,
        protocol: Option<Rc<dyn ProtocolCodec>>,
        handlers: EventHandlers,
        max_package_size: usize,
    ) -> Result<Self, ServerError> {
        Ok(Self {
            target: RemoteTarget::parse(url)?,
            protocol,
            handlers: Rc::new(handlers),
            handle,
            stats,
            socket: RefCell::new(None),
            max_package_size,
        })
    }

    pub fn send(&self, packet: impl Into<Packet>) -> bool {
        match self.endpoint() {
            Ok(endpoint) => endpoint.send_packet(packet.into(), false),
            Err(err) => {
                warn!(error = %err, "udp connect failed");
                false
            }
        }
    }

    pub fn close(&self) {
        if let Some(socket) = self.socket.borrow_mut().take() {
            self.handle.off_readable(socket.as_raw_fd());
        }
    }

    fn endpoint(&self) -> io::Result<UdpEndpoint> {
        let socket = self.ensure_socket()?;
        let remote = self
            .target
            .addr()
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "unresolvable host"))?;
        Ok(UdpEndpoint::new(
            socket,
            remote,
            self.protocol.clone(),
            self.max_package_size,
        ))
    }

    /// Lazy connect: bind an ephemeral port, point it at the peer, watch
    /// for replies.
    fn ensure_socket(&self) -> io::Result<Rc<UdpSocket>> {
        if let Some(socket) = self.socket.borrow().as_ref() {
            return Ok(socket.clone());
        }
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect(self.target.addr())?;
        sock::set_nonblocking(socket.as_raw_fd())?;
        let socket = Rc::new(socket);
        *self.socket.borrow_mut() = Some(socket.clone());

        let reader = socket.clone();
        let protocol = self.protocol.clone();
        let handlers = self.handlers.clone();
        let stats = self.stats.clone();
        let max_package_size = self.max_package_size;
        self.handle
            .on_readable(socket.as_raw_fd(), move |_, _| {
                let mut buf = [0u8; MAX_UDP_PACKAGE];
                loop {
                    match reader.recv_from(&mut buf) {
                        Ok((n, peer)) => {
                            let endpoint = UdpEndpoint::new(
                                reader.clone(),
                                peer,
                                protocol.clone(),
                                max_package_size,
                            );
                            deliver_datagram(&buf[..n], &endpoint, &handlers, &stats)?;
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(_) => break,
                    }
                }
                Ok(())
            })
            .map_err(|e| io::Error::other(e.to_string()))?;
        Ok(socket)
    }
}
