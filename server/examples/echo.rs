use std::{
    env,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use unisock_common::{
    AddressFamily, CertPath, Handle, TransportKind, BUFFER_SIZE, DEFAULT_BACKLOG,
};
use unisock_server::start_threaded_server;

const DEFAULT_PORT: u16 = 7878;

/// Line echo server; pass `--tls` to serve over TLS with `server.crt` and
/// `server.key` from `UNISOCK_CERTS_DIR` (generated when missing).
fn main() -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let tls = env::args().any(|arg| arg == "--tls");
    let port = env::var("UNISOCK_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(DEFAULT_PORT);

    let mut server = Handle::create(TransportKind::Stream, AddressFamily::Ipv4)
        .context("Failed to create server handle")?;
    server.set_reuse_address(true)?;
    if tls {
        let paths = CertPath::new();
        server
            .enable_tls(true, &paths.cert_path, &paths.key_path)
            .context("Failed to enable TLS")?;
    }
    server
        .bind("0.0.0.0", port)
        .with_context(|| format!("Failed to bind port {port}"))?;

    info!("Echo server on port {} (tls: {})", port, tls);
    let lines_echoed = Arc::new(AtomicU64::new(0));
    start_threaded_server(server, DEFAULT_BACKLOG, echo_lines, lines_echoed)
}

fn echo_lines(client: &mut Handle, lines_echoed: &AtomicU64) {
    let mut buf = [0u8; BUFFER_SIZE];
    loop {
        let n = client.receive_line(&mut buf);
        if n == 0 {
            break;
        }
        if let Err(e) = client.send_all(&buf[..n]) {
            warn!("Echo failed: {}", e);
            break;
        }
        let total = lines_echoed.fetch_add(1, Ordering::Relaxed) + 1;
        info!("Echoed {} bytes ({} lines so far)", n, total);
    }
}
