//! TLS for the `ssl` transport, both sides of the handshake.
//!
//! The session wraps a rustls connection and speaks the same non-blocking
//! dialect as the rest of the stack: readable events feed ciphertext in,
//! plaintext comes out, and pending records flush on writable. Certificate
//! management stays with the operator; servers get a cert/key pair of PEM
//! paths, clients the bundled web roots.

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::{ClientConnection, RootCertStore, ServerConnection};
use rustls_pki_types::ServerName;

use crate::error::ServerError;

/// PEM certificate chain and private key for a listening endpoint.
#[derive(Debug, Clone)]
pub struct TlsFiles {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Outcome of feeding one readable event through the session.
#[derive(Debug, PartialEq, Eq)]
pub enum TlsProgress {
    /// Handshake still in flight; keep the read armed.
    NeedMore,
    /// Handshake complete (possibly just now); plaintext may follow.
    Ready,
    /// Peer closed the TLS channel.
    Eof,
}

pub fn server_config(files: &TlsFiles) -> Result<Arc<rustls::ServerConfig>, ServerError> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(open(&files.cert)?))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ServerError::Tls(format!("bad certificate {}: {e}", files.cert.display())))?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(open(&files.key)?))
        .map_err(|e| ServerError::Tls(format!("bad key {}: {e}", files.key.display())))?
        .ok_or_else(|| ServerError::Tls(format!("no private key in {}", files.key.display())))?;
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ServerError::Tls(e.to_string()))?;
    Ok(Arc::new(config))
}

pub fn client_config() -> Arc<rustls::ClientConfig> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
}

fn open(path: &Path) -> Result<File, ServerError> {
    File::open(path).map_err(|e| ServerError::Tls(format!("{}: {e}", path.display())))
}

pub(crate) enum TlsSession {
    Server(ServerConnection),
    Client(ClientConnection),
}

impl TlsSession {
    pub fn server(config: Arc<rustls::ServerConfig>) -> Result<Self, ServerError> {
        ServerConnection::new(config)
            .map(TlsSession::Server)
            .map_err(|e| ServerError::Tls(e.to_string()))
    }

    pub fn client(config: Arc<rustls::ClientConfig>, host: &str) -> Result<Self, ServerError> {
        let name = ServerName::try_from(host.to_string())
            .map_err(|e| ServerError::Tls(format!("bad server name {host}: {e}")))?;
        ClientConnection::new(config, name)
            .map(TlsSession::Client)
            .map_err(|e| ServerError::Tls(e.to_string()))
    }

    pub fn is_handshaking(&self) -> bool {
        match self {
            TlsSession::Server(c) => c.is_handshaking(),
            TlsSession::Client(c) => c.is_handshaking(),
        }
    }

    pub fn wants_write(&self) -> bool {
        match self {
            TlsSession::Server(c) => c.wants_write(),
            TlsSession::Client(c) => c.wants_write(),
        }
    }

    /// Feeds ciphertext from `socket`, decrypting into `plaintext`.
    pub fn on_readable(
        &mut self,
        socket: &mut dyn Read,
        plaintext: &mut Vec<u8>,
    ) -> io::Result<TlsProgress> {
        let read = match self {
            TlsSession::Server(c) => c.read_tls(socket),
            TlsSession::Client(c) => c.read_tls(socket),
        };
        match read {
            Ok(0) => return Ok(TlsProgress::Eof),
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }

        let state = match self {
            TlsSession::Server(c) => c.process_new_packets(),
            TlsSession::Client(c) => c.process_new_packets(),
        }
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let available = state.plaintext_bytes_to_read();
        if available > 0 {
            let start = plaintext.len();
            plaintext.resize(start + available, 0);
            let reader = match self {
                TlsSession::Server(c) => c.reader().read_exact(&mut plaintext[start..]),
                TlsSession::Client(c) => c.reader().read_exact(&mut plaintext[start..]),
            };
            reader?;
        }

        if self.is_handshaking() {
            Ok(TlsProgress::NeedMore)
        } else {
            Ok(TlsProgress::Ready)
        }
    }

    /// Queues plaintext for encryption.
    pub fn write_plain(&mut self, data: &[u8]) -> io::Result<()> {
        let written = match self {
            TlsSession::Server(c) => c.writer().write_all(data),
            TlsSession::Client(c) => c.writer().write_all(data),
        };
        written
    }

    /// Flushes pending TLS records to `socket`. Returns whether more remain
    /// (writable interest should stay armed).
    pub fn flush(&mut self, socket: &mut dyn Write) -> io::Result<bool> {
        loop {
            let wants = match self {
                TlsSession::Server(c) => c.wants_write(),
                TlsSession::Client(c) => c.wants_write(),
            };
            if !wants {
                return Ok(false);
            }
            let result = match self {
                TlsSession::Server(c) => c.write_tls(socket),
                TlsSession::Client(c) => c.write_tls(socket),
            };
            match result {
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(true),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}
