//! TLS contexts, certificate provisioning and session I/O.
//!
//! A [`TlsContext`] holds the role-specific rustls configuration (certificate,
//! key, protocol settings). A [`TlsSession`] wraps one `rustls::Connection`
//! and drives it synchronously over any `Read + Write` transport, which is how
//! handles layer encryption under the plain send/receive calls.

use std::{
    fs,
    io::{self, BufReader, Read, Write},
    path::Path,
    process::Command,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Once,
    },
};

use rustls::{
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider},
    pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime},
    CertificateError, ClientConfig, ClientConnection, Connection, DigitallySignedStruct,
    ServerConfig, ServerConnection, SignatureScheme,
};
use rustls_pemfile::{certs, private_key};
use sha2::{Digest, Sha256};

use crate::{
    config::{CertPath, CERT_COMMON_NAME, CERT_VALIDITY_DAYS, TLS_SERVER_NAME},
    error::{Error, Result},
};

static PROVIDER: Once = Once::new();
static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Prepares the process-wide TLS state. Safe to call any number of times.
pub fn init() {
    PROVIDER.call_once(|| {
        // Another component may already have installed a provider; keep theirs.
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    });
    if !INITIALIZED.swap(true, Ordering::SeqCst) {
        tracing::debug!("TLS runtime initialized");
    }
}

/// Whether [`init`] has run since the last [`cleanup`]
pub fn is_initialized() -> bool {
    INITIALIZED.load(Ordering::SeqCst)
}

/// Marks the TLS state as torn down. Call once every TLS handle is closed.
///
/// The installed crypto provider stays in place for the life of the process,
/// so a later [`init`] only flips the flag back.
pub fn cleanup() {
    if INITIALIZED.swap(false, Ordering::SeqCst) {
        tracing::debug!("TLS runtime cleaned up");
    }
}

/// Role-specific TLS configuration shared by every session created from it
#[derive(Debug, Clone)]
pub enum TlsContext {
    /// Accepting side: presents the loaded certificate
    Server(Arc<ServerConfig>),
    /// Originating side: trusts exactly one pinned certificate
    Client(Arc<ClientConfig>),
}

impl TlsContext {
    /// Builds the context for the given role from a certificate/key pair.
    ///
    /// A server whose certificate file is missing gets a freshly generated
    /// self-signed pair first. Clients only read `cert_path` and pin it.
    pub fn load(server: bool, paths: &CertPath) -> Result<Self> {
        init();
        if server {
            server_config(paths).map(TlsContext::Server)
        } else {
            client_config(&paths.cert_path).map(TlsContext::Client)
        }
    }

    /// True for the accepting role
    pub fn is_server(&self) -> bool {
        matches!(self, TlsContext::Server(_))
    }

    /// Creates a new session bound to this context
    pub fn new_session(&self) -> Result<TlsSession> {
        let conn = match self {
            TlsContext::Server(config) => {
                Connection::Server(ServerConnection::new(config.clone())?)
            }
            TlsContext::Client(config) => {
                let name = ServerName::try_from(TLS_SERVER_NAME)
                    .map_err(|_| Error::Misuse("invalid TLS server name"))?;
                Connection::Client(ClientConnection::new(config.clone(), name)?)
            }
        };
        Ok(TlsSession::new(conn))
    }
}

fn server_config(paths: &CertPath) -> Result<Arc<ServerConfig>> {
    if !paths.cert_path.exists() {
        tracing::warn!(
            "Certificate {:?} not found, generating a self-signed pair",
            paths.cert_path
        );
        generate_self_signed(&paths.cert_path, &paths.key_path)?;
    }

    tracing::debug!("Loading server certificate from {:?}", paths.cert_path);
    let cert_chain = load_certs(&paths.cert_path)?;
    let key = load_private_key(&paths.key_path)?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)?;
    Ok(Arc::new(config))
}

fn client_config(cert_path: &Path) -> Result<Arc<ClientConfig>> {
    let pinned = load_certs(cert_path)?.remove(0);
    let verifier = PinnedServerCert::new(pinned);
    tracing::debug!("Pinning server certificate {}", verifier.fingerprint());

    let config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Writes a self-signed RSA certificate and key using the `openssl` tool.
///
/// The certificate is valid for [`CERT_VALIDITY_DAYS`] with common name
/// [`CERT_COMMON_NAME`]. Intended for development setups only.
pub fn generate_self_signed(cert_path: &Path, key_path: &Path) -> Result<()> {
    tracing::info!(
        "Generating self-signed certificate: cert={:?} key={:?}",
        cert_path,
        key_path
    );
    let days = CERT_VALIDITY_DAYS.to_string();
    let subject = format!("/CN={CERT_COMMON_NAME}");
    let san = format!("subjectAltName=DNS:{CERT_COMMON_NAME}");

    let output = Command::new("openssl")
        .args(["req", "-x509", "-newkey", "rsa:2048", "-nodes"])
        .arg("-keyout")
        .arg(key_path)
        .arg("-out")
        .arg(cert_path)
        .args(["-days", &days, "-subj", &subject, "-addext", &san])
        .output()
        .map_err(|e| Error::CertificateGeneration(format!("could not run openssl: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::CertificateGeneration(format!(
            "openssl exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }
    tracing::info!("Self-signed certificate written to {:?}", cert_path);
    Ok(())
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let pem = fs::read(path).map_err(|e| cert_error(path, e))?;
    let chain = certs(&mut BufReader::new(&*pem))
        .collect::<io::Result<Vec<_>>>()
        .map_err(|e| cert_error(path, e))?;
    if chain.is_empty() {
        return Err(cert_error(
            path,
            io::Error::new(io::ErrorKind::InvalidData, "no certificates found"),
        ));
    }
    Ok(chain)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let pem = fs::read(path).map_err(|e| cert_error(path, e))?;
    private_key(&mut BufReader::new(&*pem))
        .map_err(|e| cert_error(path, e))?
        .ok_or_else(|| {
            cert_error(
                path,
                io::Error::new(io::ErrorKind::InvalidData, "no private key found"),
            )
        })
}

fn cert_error(path: &Path, source: io::Error) -> Error {
    Error::Certificate {
        path: path.to_path_buf(),
        source,
    }
}

/// Accepts exactly one server certificate, compared byte for byte.
#[derive(Debug)]
struct PinnedServerCert {
    pinned:   CertificateDer<'static>,
    provider: Arc<CryptoProvider>,
}

impl PinnedServerCert {
    fn new(pinned: CertificateDer<'static>) -> Self {
        let provider = CryptoProvider::get_default()
            .cloned()
            .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()));
        Self { pinned, provider }
    }

    fn fingerprint(&self) -> String {
        hex::encode(Sha256::digest(self.pinned.as_ref()))
    }
}

impl ServerCertVerifier for PinnedServerCert {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        if end_entity.as_ref() == self.pinned.as_ref() {
            Ok(ServerCertVerified::assertion())
        } else {
            tracing::warn!(
                "Server presented {} but {} is pinned",
                hex::encode(Sha256::digest(end_entity.as_ref())),
                self.fingerprint()
            );
            Err(rustls::Error::InvalidCertificate(CertificateError::UnknownIssuer))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakeState {
    Pending,
    Complete,
    Failed,
}

/// Synchronous driver for one TLS connection
#[derive(Debug)]
pub struct TlsSession {
    tls:    Connection,
    state:  HandshakeState,
    /// Plaintext accepted by the session whose records have not fully
    /// reached the transport yet
    queued: usize,
}

/// Plaintext handed to rustls per write. One call never produces more than
/// one record, so an interrupted flush strands at most this much.
const WRITE_CHUNK: usize = 16 * 1024;

impl TlsSession {
    fn new(tls: Connection) -> Self {
        Self {
            tls,
            state: HandshakeState::Pending,
            queued: 0,
        }
    }

    /// Plaintext bytes accepted by an earlier [`TlsSession::write`] that are
    /// still waiting in the session for the transport. They go out ahead of
    /// any new data on the next write.
    pub fn queued(&self) -> usize {
        self.queued
    }

    /// True once the handshake finished successfully
    pub fn is_established(&self) -> bool {
        self.state == HandshakeState::Complete
    }

    /// True for sessions created from a server context
    pub fn is_server(&self) -> bool {
        matches!(self.tls, Connection::Server(_))
    }

    /// Runs the handshake to completion over `sock`.
    ///
    /// Would-block conditions leave the session pending so the call can be
    /// repeated; any other failure poisons it for good.
    pub fn handshake<S: Read + Write>(&mut self, sock: &mut S) -> Result<()> {
        match self.state {
            HandshakeState::Complete => return Ok(()),
            HandshakeState::Failed => {
                return Err(Error::Handshake(Box::new(Error::Misuse(
                    "TLS session unusable after a failed handshake",
                ))))
            }
            HandshakeState::Pending => {}
        }

        match self.drive_handshake(sock) {
            Ok(()) => {
                self.state = HandshakeState::Complete;
                Ok(())
            }
            Err(e) if e.is_would_block() => Err(e),
            Err(e) => {
                self.state = HandshakeState::Failed;
                Err(Error::Handshake(Box::new(e)))
            }
        }
    }

    fn drive_handshake<S: Read + Write>(&mut self, sock: &mut S) -> Result<()> {
        while self.tls.is_handshaking() {
            while self.tls.wants_write() {
                self.tls.write_tls(sock)?;
            }
            if self.tls.is_handshaking() && self.tls.wants_read() {
                if self.tls.read_tls(sock)? == 0 {
                    return Err(Error::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "peer closed the connection during the handshake",
                    )));
                }
                if let Err(e) = self.tls.process_new_packets() {
                    // Let the peer see the alert before giving up.
                    let _ = self.tls.write_tls(sock);
                    return Err(e.into());
                }
            }
        }
        // Session tickets or the final flight may still be queued.
        while self.tls.wants_write() {
            self.tls.write_tls(sock)?;
        }
        Ok(())
    }

    /// Reads decrypted bytes into `buf`; `Ok(0)` means the peer closed.
    pub fn read<S: Read + Write>(&mut self, sock: &mut S, buf: &mut [u8]) -> Result<usize> {
        self.handshake(sock)?;
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            match self.tls.reader().read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                // Peer went away without close_notify; treat it as a close.
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(0),
                Err(e) => return Err(e.into()),
            }

            if self.tls.read_tls(sock)? == 0 {
                return Ok(0);
            }
            if let Err(e) = self.tls.process_new_packets() {
                let _ = self.tls.write_tls(sock);
                return Err(e.into());
            }
            // Post-handshake replies (key updates, tickets) may wait for the
            // next write when the transport is busy.
            match self.flush(sock) {
                Err(e) if !is_transient(&e) => return Err(e.into()),
                _ => {}
            }
        }
    }

    /// Encrypts up to one record of `data` and pushes it to `sock`.
    ///
    /// Returns the plaintext bytes whose records fully reached the transport.
    /// Records queued by an earlier call are flushed first. When the
    /// transport would block or times out the error is returned and the
    /// plaintext of this call stays counted in [`TlsSession::queued`].
    pub fn write<S: Read + Write>(&mut self, sock: &mut S, data: &[u8]) -> Result<usize> {
        self.handshake(sock)?;
        self.flush(sock)?;
        self.queued = 0;
        if data.is_empty() {
            return Ok(0);
        }

        let chunk = &data[..data.len().min(WRITE_CHUNK)];
        let accepted = self.tls.writer().write(chunk)?;
        self.queued = accepted;
        self.flush(sock)?;
        self.queued = 0;
        Ok(accepted)
    }

    /// Writes queued records until none remain or the transport refuses
    fn flush<S: Write>(&mut self, sock: &mut S) -> io::Result<()> {
        while self.tls.wants_write() {
            if self.tls.write_tls(sock)? == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }
        }
        Ok(())
    }

    /// Sends close_notify if the session ever got established. Best effort.
    pub fn shutdown<S: Write>(&mut self, sock: &mut S) {
        if self.state != HandshakeState::Complete {
            return;
        }
        if self.queued > 0 {
            tracing::debug!("Closing with {} plaintext bytes still queued", self.queued);
        }
        self.tls.send_close_notify();
        if let Err(e) = self.flush(sock) {
            tracing::debug!("close_notify not delivered: {}", e);
        }
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}
