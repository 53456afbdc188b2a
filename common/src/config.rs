use std::{
    env,
    path::{Path, PathBuf},
};

/// Default size for caller-side receive buffers
pub const BUFFER_SIZE: usize = 4096;

/// Default number of pending connections queued by `listen`
pub const DEFAULT_BACKLOG: i32 = 128;

/// Conventional file name of the server certificate
pub const DEFAULT_CERT_FILE: &str = "server.crt";

/// Conventional file name of the server private key
pub const DEFAULT_KEY_FILE: &str = "server.key";

/// Validity of generated self-signed certificates, in days
pub const CERT_VALIDITY_DAYS: u32 = 365;

/// Common name written into generated self-signed certificates
pub const CERT_COMMON_NAME: &str = "localhost";

/// Server name presented by TLS clients
pub const TLS_SERVER_NAME: &str = "localhost";

const CERTS_DIR_ENV: &str = "UNISOCK_CERTS_DIR";
const DEFAULT_CERTS_DIR: &str = ".";

fn get_certs_dir() -> PathBuf {
    let dir = env::var(CERTS_DIR_ENV).unwrap_or(DEFAULT_CERTS_DIR.to_string());
    PathBuf::from(dir)
}

/// Certificate and private key locations for a TLS handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertPath {
    /// Path to the PEM certificate file
    pub cert_path: PathBuf,
    /// Path to the PEM private key file
    pub key_path:  PathBuf,
}

impl CertPath {
    /// Creates CertPath with the conventional file names inside
    /// `UNISOCK_CERTS_DIR` (the working directory when unset).
    pub fn new() -> Self {
        Self::from_dir(get_certs_dir())
    }

    /// Uses the conventional file names inside `dir`
    pub fn from_dir<P: AsRef<Path>>(dir: P) -> Self {
        let base = dir.as_ref();
        Self {
            cert_path: base.join(DEFAULT_CERT_FILE),
            key_path:  base.join(DEFAULT_KEY_FILE),
        }
    }
}

impl Default for CertPath {
    fn default() -> Self {
        Self::new()
    }
}
