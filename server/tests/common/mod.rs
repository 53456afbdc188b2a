//! Shared helpers for the server integration tests

#![allow(dead_code)]

use std::{
    fs,
    path::PathBuf,
    process::Command,
    sync::{atomic::AtomicBool, Arc},
    thread::{self, JoinHandle},
};

use unisock_common::{AddressFamily, CertPath, Handle, TransportKind};
use unisock_server::{ServerOptions, ThreadedServer};

/// Fresh scratch directory unique to this process and tag
pub fn scratch_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("unisock-it-{tag}-{}", std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).expect("create scratch dir");
    dir
}

/// Certificate/key pair generated in-process
pub fn test_certs(tag: &str) -> CertPath {
    let paths = CertPath::from_dir(scratch_dir(tag));
    let generated =
        rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).expect("generate cert");
    fs::write(&paths.cert_path, generated.cert.pem()).expect("write cert");
    fs::write(&paths.key_path, generated.key_pair.serialize_pem()).expect("write key");
    paths
}

/// Whether the `openssl` tool is on PATH
pub fn openssl_available() -> bool {
    Command::new("openssl")
        .arg("version")
        .output()
        .is_ok_and(|out| out.status.success())
}

/// Bound IPv4 loopback stream handle, optionally with server TLS
pub fn bound_listener(tls: Option<&CertPath>) -> Handle {
    let mut listener =
        Handle::create(TransportKind::Stream, AddressFamily::Ipv4).expect("create listener");
    listener.set_reuse_address(true).expect("reuse address");
    if let Some(paths) = tls {
        listener
            .enable_tls(true, &paths.cert_path, &paths.key_path)
            .expect("enable server TLS");
    }
    listener.bind("127.0.0.1", 0).expect("bind listener");
    listener
}

/// Running server and the flag that stops it
pub struct TestServer {
    pub port:    u16,
    pub running: Arc<AtomicBool>,
    pub thread:  JoinHandle<anyhow::Result<()>>,
}

impl TestServer {
    /// Stops accepting and waits for the accept loop to return
    pub fn stop(self) -> anyhow::Result<()> {
        self.running
            .store(false, std::sync::atomic::Ordering::SeqCst);
        self.thread.join().expect("accept loop panicked")
    }
}

/// Serves `listener` on a background thread until stopped
pub fn spawn_server<H, C>(listener: Handle, handler: H, context: Arc<C>) -> TestServer
where
    H: Fn(&mut Handle, &C) + Send + Sync + 'static,
    C: Send + Sync + 'static,
{
    let mut server = ThreadedServer::new(listener, ServerOptions::new().with_backlog(16))
        .expect("start server");
    let port = server.local_addr().expect("listener address").port();
    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);
    let thread = thread::spawn(move || server.run_until(flag, handler, context));
    TestServer {
        port,
        running,
        thread,
    }
}

/// Plain or TLS client connected to the test server
pub fn connect(port: u16, tls: Option<&CertPath>) -> Handle {
    let mut client =
        Handle::create(TransportKind::Stream, AddressFamily::Ipv4).expect("create client");
    if let Some(paths) = tls {
        client
            .enable_tls(false, &paths.cert_path, &paths.key_path)
            .expect("enable client TLS");
    }
    client.connect("127.0.0.1", port).expect("connect");
    client
}

/// Reads until the peer closes
pub fn read_to_close(handle: &mut Handle) -> Vec<u8> {
    let mut received = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let (n, _) = handle.receive(&mut buf).expect("receive");
        if n == 0 {
            return received;
        }
        received.extend_from_slice(&buf[..n]);
    }
}

/// Handler that echoes one line back
pub fn echo_line(client: &mut Handle, _context: &()) {
    let mut buf = [0u8; 256];
    let n = client.receive_line(&mut buf);
    if n > 0 {
        let _ = client.send_all(&buf[..n]);
    }
}
