use std::io::{self, Read, Write};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, ClientConnection, Error as RustlsError, SignatureScheme};

static VERIFY_CONFIG: OnceCell<Arc<ClientConfig>> = OnceCell::new();
static NO_VERIFY_CONFIG: OnceCell<Arc<ClientConfig>> = OnceCell::new();

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TlsError {
    #[error("invalid TLS server name {0:?}")]
    InvalidServerName(String),
    #[error("TLS handshake failed: {0}")]
    Handshake(String),
    #[error("TLS transport error: {0}")]
    Io(String),
    #[error("TLS connection closed by peer")]
    Closed,
}

#[derive(Debug)]
struct AcceptAllVerifier;

impl ServerCertVerifier for AcceptAllVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, RustlsError> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::ED25519,
        ]
    }
}

fn tls_config_webpki_roots() -> ClientConfig {
    let roots = rustls::RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth()
}

fn tls_config_no_verify() -> ClientConfig {
    let mut cfg = ClientConfig::builder()
        .with_root_certificates(rustls::RootCertStore::empty())
        .with_no_client_auth();
    cfg.dangerous()
        .set_certificate_verifier(Arc::new(AcceptAllVerifier));
    cfg
}

pub fn client_config(verify: bool) -> Arc<ClientConfig> {
    if verify {
        VERIFY_CONFIG
            .get_or_init(|| Arc::new(tls_config_webpki_roots()))
            .clone()
    } else {
        NO_VERIFY_CONFIG
            .get_or_init(|| Arc::new(tls_config_no_verify()))
            .clone()
    }
}

/// Client-side TLS record pump. The session owns no transport; each pump
/// call is handed the non-blocking byte stream to move records over.
pub struct TlsSession {
    conn: ClientConnection,
    peer_closed: bool,
}

impl TlsSession {
    pub fn connect(host: &str, verify: bool) -> Result<Self, TlsError> {
        let name = ServerName::try_from(host.to_string())
            .map_err(|_| TlsError::InvalidServerName(host.to_string()))?;
        let conn = ClientConnection::new(client_config(verify), name)
            .map_err(|e| TlsError::Handshake(e.to_string()))?;
        Ok(TlsSession {
            conn,
            peer_closed: false,
        })
    }

    pub fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    /// Pulls every record currently readable from `io` and decrypts it.
    pub fn pump_read(&mut self, io: &mut dyn Read) -> Result<(), TlsError> {
        while !self.peer_closed && self.conn.wants_read() {
            match self.conn.read_tls(io) {
                Ok(0) => self.peer_closed = true,
                Ok(_) => {
                    self.conn
                        .process_new_packets()
                        .map_err(|e| TlsError::Handshake(e.to_string()))?;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(TlsError::Io(e.to_string())),
            }
        }
        Ok(())
    }

    /// Pushes pending records to `io` until it would block.
    pub fn pump_write(&mut self, io: &mut dyn Write) -> Result<(), TlsError> {
        while self.conn.wants_write() {
            match self.conn.write_tls(io) {
                Ok(0) => return Err(TlsError::Closed),
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(TlsError::Io(e.to_string())),
            }
        }
        Ok(())
    }

    /// Returns decrypted bytes; 0 means nothing is available yet.
    pub fn read_plain(&mut self, buf: &mut [u8]) -> Result<usize, TlsError> {
        if buf.is_empty() {
            return Ok(0);
        }
        match self.conn.reader().read(buf) {
            Ok(0) => Err(TlsError::Closed),
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if self.peer_closed {
                    Err(TlsError::Closed)
                } else {
                    Ok(0)
                }
            }
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(TlsError::Closed),
            Err(e) => Err(TlsError::Io(e.to_string())),
        }
    }

    pub fn write_plain(&mut self, data: &[u8]) -> Result<(), TlsError> {
        self.conn
            .writer()
            .write_all(data)
            .map_err(|e| TlsError::Io(e.to_string()))
    }

    pub fn close_notify(&mut self) {
        self.conn.send_close_notify();
    }
}
