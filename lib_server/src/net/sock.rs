//! Raw socket plumbing shared by listeners and connections: non-blocking
//! setup, socket options the std API does not expose, and the asynchronous
//! connect used by outbound connections.

use std::io;
use std::mem;
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};

fn set_sockopt(fd: RawFd, level: libc::c_int, option: libc::c_int, value: libc::c_int) -> io::Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            option,
            &value as *const libc::c_int as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub fn set_reuse_addr(fd: RawFd) -> io::Result<()> {
    set_sockopt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)
}

pub fn set_reuse_port(fd: RawFd) -> io::Result<()> {
    set_sockopt(fd, libc::SOL_SOCKET, libc::SO_REUSEPORT, 1)
}

pub fn set_keepalive(fd: RawFd) -> io::Result<()> {
    set_sockopt(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, 1)
}

pub fn set_nodelay(fd: RawFd) -> io::Result<()> {
    set_sockopt(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, 1)
}

pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn sockaddr_storage(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                *(&mut storage as *mut _ as *mut libc::sockaddr_in) = sin;
            }
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe {
                *(&mut storage as *mut _ as *mut libc::sockaddr_in6) = sin6;
            }
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

/// Builds a listening TCP socket with options applied before `bind`, so a
/// reload can re-bind without `EADDRINUSE` and `SO_REUSEPORT` spreads accepts
/// across workers when requested.
pub fn listen_tcp(addr: &SocketAddr, reuse_port: bool, backlog: i32) -> io::Result<TcpListener> {
    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    let fd = unsafe { libc::socket(domain, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let listener = unsafe { TcpListener::from_raw_fd(fd) };
    set_reuse_addr(fd)?;
    if reuse_port {
        set_reuse_port(fd)?;
    }
    let (storage, len) = sockaddr_storage(addr);
    unsafe {
        if libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) != 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::listen(fd, backlog) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    set_nonblocking(fd)?;
    Ok(listener)
}

/// Bound non-blocking UDP socket, options-first like [`listen_tcp`].
pub fn bind_udp(addr: &SocketAddr, reuse_port: bool) -> io::Result<UdpSocket> {
    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    let fd = unsafe { libc::socket(domain, libc::SOCK_DGRAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let socket = unsafe { UdpSocket::from_raw_fd(fd) };
    set_reuse_addr(fd)?;
    if reuse_port {
        set_reuse_port(fd)?;
    }
    let (storage, len) = sockaddr_storage(addr);
    unsafe {
        if libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    set_nonblocking(fd)?;
    Ok(socket)
}

/// Starts a non-blocking connect. The socket reports writable once the
/// three-way handshake resolves; `take_socket_error` tells which way.
pub fn connect_nonblocking(addr: &SocketAddr) -> io::Result<TcpStream> {
    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    let fd = unsafe { libc::socket(domain, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let stream = unsafe { TcpStream::from_raw_fd(fd) };
    set_nonblocking(fd)?;
    let (storage, len) = sockaddr_storage(addr);
    let rc = unsafe { libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINPROGRESS) {
            return Err(err);
        }
    }
    Ok(stream)
}

/// Drains the pending error of an in-progress connect.
pub fn take_socket_error(fd: RawFd) -> io::Result<()> {
    let mut value: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut value as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    if value != 0 {
        return Err(io::Error::from_raw_os_error(value));
    }
    Ok(())
}

/// Applies the per-connection stream options an accepted socket gets.
pub fn tune_stream(fd: RawFd) -> io::Result<()> {
    set_nonblocking(fd)?;
    // Best effort: not every stream flavour supports these.
    let _ = set_nodelay(fd);
    let _ = set_keepalive(fd);
    Ok(())
}

/// Extends `tune_stream` to any AsRawFd socket.
pub fn tune<S: AsRawFd>(socket: &S) -> io::Result<()> {
    tune_stream(socket.as_raw_fd())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listen_tcp_yields_a_bound_nonblocking_listener() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = listen_tcp(&addr, false, 128).unwrap();
        let local = listener.local_addr().unwrap();
        assert_ne!(local.port(), 0);
        // Non-blocking accept with no client pending must not hang.
        let err = listener.accept().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn reuse_port_listeners_share_an_address() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let first = listen_tcp(&addr, true, 128).unwrap();
        let bound = first.local_addr().unwrap();
        let second = listen_tcp(&bound, true, 128).expect("SO_REUSEPORT rebind");
        assert_eq!(second.local_addr().unwrap(), bound);
    }

    #[test]
    fn nonblocking_connect_reaches_a_listener() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = listen_tcp(&addr, false, 8).unwrap();
        let target = listener.local_addr().unwrap();
        let stream = connect_nonblocking(&target).unwrap();
        // Loopback connects resolve quickly; poll the error queue briefly.
        for _ in 0..50 {
            if take_socket_error(stream.as_raw_fd()).is_ok() {
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        panic!("connect never resolved");
    }
}
