//! Unified socket handle library
//!
//! One [`Handle`] type covers TCP streams, UDP endpoints and raw sockets over
//! IPv4 or IPv6, in client or server role, with optional TLS layered under
//! the same send/receive calls. It includes:
//!
//! - Handle construction, socket options, binding and connecting
//! - TLS contexts and sessions, with self-signed certificate provisioning
//! - Partial-write-safe sending and delimiter-bounded receiving
//! - Hostname resolution helper
//!
//! The threaded accept/dispatch server lives in the `unisock-server` crate.

/// Constants and certificate locations
pub mod config;

/// Error taxonomy and recorded error codes
pub mod error;

/// The handle type, its options and addressing
pub mod handle;

/// Hostname to IP literal lookup
pub mod resolve;

/// TLS contexts, sessions and process-wide TLS state
pub mod tls;

mod transmission;

// Re-export commonly used types for convenience
pub use config::{CertPath, BUFFER_SIZE, DEFAULT_BACKLOG};
pub use error::{Error, ErrorCode, Result};
pub use handle::{AddressFamily, Handle, SecurityMode, TransportKind};
pub use resolve::resolve_host;
pub use tls::TlsContext;
