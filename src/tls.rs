//! TLS driver contract
//!
//! The core drives a pluggable TLS engine through [`TlsDriver`]: one
//! handshake step per poll while the connection is in the handshake state,
//! then transparent plaintext `read`/`write` piped through the engine. The
//! default engine behind the `tls` cargo feature is rustls; the contract is
//! engine-agnostic.

use std::io;

use thiserror::Error;

/// Outcome of a single handshake step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HsStatus {
    /// Engine needs more bytes from the peer
    NeedRead,
    /// Engine has bytes queued that the socket would not take yet
    NeedWrite,
    /// Handshake complete; the engine is now a byte pipe
    Done,
}

/// TLS configuration for one connection
///
/// Each PEM field accepts either a filesystem path or inline PEM text
/// (detected by the `-----BEGIN` marker). Setting both `ca` and `cert`
/// enables two-way authentication.
#[derive(Debug, Default, Clone)]
pub struct TlsOpts {
    /// CA bundle used to verify the peer
    pub ca: Option<String>,
    /// Our certificate chain
    pub cert: Option<String>,
    /// Private key for `cert`
    pub key: Option<String>,
    /// Cipher preference list; engine-specific, ignored by engines with a
    /// fixed suite policy
    pub ciphers: Option<String>,
    /// Expected server name (SNI + verification); defaults to the URL host
    pub server_name: Option<String>,
}

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("tls support not compiled in; enable the `tls` feature")]
    Disabled,
    #[error("tls client requires a CA bundle")]
    CaRequired,
    #[error("tls server requires cert and key")]
    CertRequired,
    #[error("bad PEM material: {0}")]
    BadPem(String),
    #[error("tls: {0}")]
    Engine(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Per-connection TLS engine state
///
/// `io` is the raw socket. Plaintext flows through `read`/`write`; the
/// engine moves ciphertext over `io` itself. All calls are non-blocking and
/// surface `WouldBlock` like a plain socket would.
pub trait TlsDriver {
    fn handshake(&mut self, io: &mut dyn Transport) -> Result<HsStatus, TlsError>;
    fn read(&mut self, io: &mut dyn Transport, dst: &mut [u8]) -> io::Result<usize>;
    fn write(&mut self, io: &mut dyn Transport, src: &[u8]) -> io::Result<usize>;
    /// Push any buffered ciphertext toward the socket
    fn flush(&mut self, io: &mut dyn Transport) -> io::Result<()>;
}

/// Raw byte transport under the TLS engine
pub trait Transport: io::Read + io::Write {}

impl<T: io::Read + io::Write> Transport for T {}

#[cfg(feature = "tls")]
pub use rustls_driver::RustlsDriver;

#[cfg(feature = "tls")]
mod rustls_driver {
    use std::io::{self, BufReader, Read};
    use std::sync::Arc;

    use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
    use rustls::{ClientConfig, ClientConnection, RootCertStore, ServerConfig, ServerConnection};
    use tracing::{debug, warn};

    use super::{HsStatus, TlsDriver, TlsError, TlsOpts, Transport};

    /// rustls-backed implementation of the driver contract
    pub struct RustlsDriver {
        conn: rustls::Connection,
    }

    impl RustlsDriver {
        /// Build a client session; `host` is the fallback server name
        pub fn client(opts: &TlsOpts, host: &str) -> Result<Self, TlsError> {
            if opts.ciphers.is_some() {
                warn!("cipher list ignored by the rustls driver");
            }
            let ca = opts.ca.as_deref().ok_or(TlsError::CaRequired)?;
            let mut roots = RootCertStore::empty();
            for cert in load_certs(ca)? {
                roots
                    .add(cert)
                    .map_err(|e| TlsError::BadPem(e.to_string()))?;
            }
            let builder = ClientConfig::builder().with_root_certificates(roots);
            let config = match (&opts.cert, &opts.key) {
                (Some(cert), Some(key)) => builder
                    .with_client_auth_cert(load_certs(cert)?, load_key(key)?)
                    .map_err(|e| TlsError::Engine(e.to_string()))?,
                _ => builder.with_no_client_auth(),
            };
            let name = opts.server_name.as_deref().unwrap_or(host);
            let name = ServerName::try_from(name.to_owned())
                .map_err(|e| TlsError::Engine(e.to_string()))?;
            let conn = ClientConnection::new(Arc::new(config), name)
                .map_err(|e| TlsError::Engine(e.to_string()))?;
            debug!("tls client session created");
            Ok(Self { conn: conn.into() })
        }

        pub fn server(opts: &TlsOpts) -> Result<Self, TlsError> {
            let (cert, key) = match (&opts.cert, &opts.key) {
                (Some(c), Some(k)) => (c, k),
                _ => return Err(TlsError::CertRequired),
            };
            let builder = match &opts.ca {
                // CA present on a server means mandatory client certs
                Some(ca) => {
                    let mut roots = RootCertStore::empty();
                    for c in load_certs(ca)? {
                        roots.add(c).map_err(|e| TlsError::BadPem(e.to_string()))?;
                    }
                    let verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(roots))
                        .build()
                        .map_err(|e| TlsError::Engine(e.to_string()))?;
                    ServerConfig::builder().with_client_cert_verifier(verifier)
                }
                None => ServerConfig::builder().with_no_client_auth(),
            };
            let config = builder
                .with_single_cert(load_certs(cert)?, load_key(key)?)
                .map_err(|e| TlsError::Engine(e.to_string()))?;
            let conn = ServerConnection::new(Arc::new(config))
                .map_err(|e| TlsError::Engine(e.to_string()))?;
            debug!("tls server session created");
            Ok(Self { conn: conn.into() })
        }

        fn pump_reads(&mut self, io: &mut dyn Transport) -> Result<bool, TlsError> {
            match self.conn.read_tls(&mut ReadAdapter(io)) {
                Ok(0) => Err(TlsError::Io(io::ErrorKind::UnexpectedEof.into())),
                Ok(_) => {
                    self.conn
                        .process_new_packets()
                        .map_err(|e| TlsError::Engine(e.to_string()))?;
                    Ok(true)
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
                Err(e) => Err(e.into()),
            }
        }
    }

    impl TlsDriver for RustlsDriver {
        fn handshake(&mut self, io: &mut dyn Transport) -> Result<HsStatus, TlsError> {
            loop {
                while self.conn.wants_write() {
                    match self.conn.write_tls(&mut WriteAdapter(io)) {
                        Ok(_) => {}
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            return Ok(HsStatus::NeedWrite)
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                if !self.conn.is_handshaking() {
                    return Ok(HsStatus::Done);
                }
                if !self.pump_reads(io)? {
                    return Ok(HsStatus::NeedRead);
                }
            }
        }

        fn read(&mut self, io: &mut dyn Transport, dst: &mut [u8]) -> io::Result<usize> {
            // move ciphertext in first so a full record is available
            match self.pump_reads(io) {
                Ok(_) => {}
                Err(TlsError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(0),
                Err(e) => return Err(io::Error::other(e.to_string())),
            }
            self.conn.reader().read(dst)
        }

        fn write(&mut self, io: &mut dyn Transport, src: &[u8]) -> io::Result<usize> {
            let n = io::Write::write(&mut self.conn.writer(), src)?;
            self.flush(io)?;
            Ok(n)
        }

        fn flush(&mut self, io: &mut dyn Transport) -> io::Result<()> {
            while self.conn.wants_write() {
                match self.conn.write_tls(&mut WriteAdapter(io)) {
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => return Err(e),
                }
            }
            Ok(())
        }
    }

    struct ReadAdapter<'a>(&'a mut dyn Transport);

    impl io::Read for ReadAdapter<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.0.read(buf)
        }
    }

    struct WriteAdapter<'a>(&'a mut dyn Transport);

    impl io::Write for WriteAdapter<'_> {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.write(buf)
        }
        fn flush(&mut self) -> io::Result<()> {
            self.0.flush()
        }
    }

    /// Load PEM certificates from a path or inline text
    fn load_certs(src: &str) -> Result<Vec<CertificateDer<'static>>, TlsError> {
        let pem = load_pem(src)?;
        let certs: Result<Vec<_>, _> = rustls_pemfile::certs(&mut BufReader::new(&pem[..])).collect();
        let certs = certs.map_err(|e| TlsError::BadPem(e.to_string()))?;
        if certs.is_empty() {
            return Err(TlsError::BadPem(format!("no certificates in {src:.40}")));
        }
        Ok(certs)
    }

    fn load_key(src: &str) -> Result<PrivateKeyDer<'static>, TlsError> {
        let pem = load_pem(src)?;
        rustls_pemfile::private_key(&mut BufReader::new(&pem[..]))
            .map_err(|e| TlsError::BadPem(e.to_string()))?
            .ok_or_else(|| TlsError::BadPem("no private key found".into()))
    }

    fn load_pem(src: &str) -> Result<Vec<u8>, TlsError> {
        if src.contains("-----BEGIN") {
            Ok(src.as_bytes().to_vec())
        } else {
            std::fs::read(src).map_err(TlsError::Io)
        }
    }
}
