use std::{
    fs::File,
    io::{self, BufReader, Read, Write},
    path::PathBuf,
    sync::Arc,
};

use rustls::{Certificate, PrivateKey, ServerConfig, ServerConnection};
use tracing::debug;

use crate::{NetError, TLS_WRITE_CHUNK};

/// TLS settings of an `ssl://` listener: PEM certificate chain and key.
#[derive(Clone, Debug)]
pub struct TlsContext {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl TlsContext {
    pub fn new(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self { cert_path: cert_path.into(), key_path: key_path.into() }
    }

    /// Load the PEM material and build the shared rustls config.
    /// Fails fast at configuration time, before any fork.
    pub fn server_config(&self) -> Result<Arc<ServerConfig>, NetError> {
        let mut cert_reader = BufReader::new(File::open(&self.cert_path)?);
        let certs: Vec<Certificate> =
            rustls_pemfile::certs(&mut cert_reader)?.into_iter().map(Certificate).collect();
        if certs.is_empty() {
            return Err(NetError::EmptyCertChain(self.cert_path.display().to_string()));
        }

        let mut key_reader = BufReader::new(File::open(&self.key_path)?);
        let mut keys = rustls_pemfile::pkcs8_private_keys(&mut key_reader)?;
        if keys.is_empty() {
            let mut key_reader = BufReader::new(File::open(&self.key_path)?);
            keys = rustls_pemfile::rsa_private_keys(&mut key_reader)?;
        }
        let key = keys
            .into_iter()
            .next()
            .map(PrivateKey)
            .ok_or_else(|| NetError::MissingKey(self.key_path.display().to_string()))?;

        let config = ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
        Ok(Arc::new(config))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::TlsContext;
    use crate::NetError;

    #[test]
    fn missing_files_fail_at_config_time() {
        let ctx = TlsContext::new("/nonexistent/cert.pem", "/nonexistent/key.pem");
        assert!(matches!(ctx.server_config(), Err(NetError::Io(_))));
    }

    #[test]
    fn pem_without_certificates_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cert = dir.path().join("cert.pem");
        let key = dir.path().join("key.pem");
        std::fs::File::create(&cert)
            .and_then(|mut f| f.write_all(b"not a certificate"))
            .expect("write cert");
        std::fs::File::create(&key).expect("write key");

        let ctx = TlsContext::new(&cert, &key);
        assert!(matches!(ctx.server_config(), Err(NetError::EmptyCertChain(_))));
    }
}

pub(crate) enum HandshakeStatus {
    /// Waiting for more handshake bytes from the peer.
    InProgress,
    Done,
    Fatal,
}

/// Per-connection TLS record layer driven from the readiness callbacks.
pub(crate) struct TlsSession {
    session: ServerConnection,
    pub handshake_done: bool,
}

impl TlsSession {
    pub fn new(config: Arc<ServerConfig>) -> Result<Self, rustls::Error> {
        Ok(Self { session: ServerConnection::new(config)?, handshake_done: false })
    }

    /// Advance the handshake as far as the socket allows.
    pub fn step_handshake(&mut self, sock: &mut (impl Read + Write)) -> HandshakeStatus {
        loop {
            if let HandshakeStatus::Fatal = self.flush_tls(sock) {
                return HandshakeStatus::Fatal;
            }
            if !self.session.is_handshaking() {
                self.handshake_done = true;
                return HandshakeStatus::Done;
            }

            match self.session.read_tls(sock) {
                Ok(0) => return HandshakeStatus::Fatal,
                Ok(_) => {}
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return HandshakeStatus::InProgress;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    debug!(?err, "tls: handshake read");
                    return HandshakeStatus::Fatal;
                }
            }
            if let Err(err) = self.session.process_new_packets() {
                debug!(?err, "tls: handshake rejected");
                // Flush any alert before giving up.
                let _ = self.flush_tls(sock);
                return HandshakeStatus::Fatal;
            }
        }
    }

    /// Decrypt application bytes into `out`. Mirrors a plain socket read:
    /// `Ok(0)` only on clean close, `WouldBlock` when no records are ready.
    pub fn read_plain(&mut self, sock: &mut (impl Read + Write), out: &mut [u8]) -> io::Result<usize> {
        match self.session.read_tls(sock) {
            Ok(0) => return Ok(0),
            Ok(_) => {
                self.session
                    .process_new_packets()
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => return Err(err),
        }

        match self.session.reader().read(out) {
            Ok(n) => Ok(n),
            // No plaintext buffered; report WouldBlock like the raw socket.
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                Err(io::Error::from(io::ErrorKind::WouldBlock))
            }
            Err(err) => Err(err),
        }
    }

    /// Stage up to one chunk of plaintext and push records to the socket.
    /// Returns staged bytes; 0 with `wants_write` still set means the
    /// socket is full and the writable handler continues later.
    pub fn write_plain(
        &mut self,
        sock: &mut (impl Read + Write),
        data: &[u8],
    ) -> io::Result<usize> {
        let chunk = data.len().min(TLS_WRITE_CHUNK);
        let staged = self.session.writer().write(&data[..chunk])?;
        match self.flush_tls(sock) {
            HandshakeStatus::Fatal => Err(io::Error::from(io::ErrorKind::BrokenPipe)),
            _ => Ok(staged),
        }
    }

    pub fn wants_write(&self) -> bool {
        self.session.wants_write()
    }

    /// Push buffered TLS records until the socket blocks or they are gone.
    pub fn flush_tls(&mut self, sock: &mut (impl Read + Write)) -> HandshakeStatus {
        while self.session.wants_write() {
            match self.session.write_tls(sock) {
                Ok(0) => return HandshakeStatus::Fatal,
                Ok(_) => {}
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    debug!(?err, "tls: record write");
                    return HandshakeStatus::Fatal;
                }
            }
        }
        HandshakeStatus::InProgress
    }
}
