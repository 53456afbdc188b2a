use std::{
    env,
    io::{self, BufRead},
};

use anyhow::{bail, Context, Result};
use tracing_subscriber::EnvFilter;
use unisock_common::{
    resolve_host, AddressFamily, CertPath, Handle, TransportKind, BUFFER_SIZE,
};

/// Sends stdin line by line to the echo server and prints the replies.
///
/// Usage: `line_client [host] [port] [--tls]`
fn main() -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args: Vec<String> = env::args().skip(1).collect();
    let tls = args.iter().any(|arg| arg == "--tls");
    let mut positional = args.iter().filter(|arg| !arg.starts_with("--"));
    let host = positional.next().map(String::as_str).unwrap_or("localhost");
    let port: u16 = match positional.next() {
        Some(p) => p.parse().with_context(|| format!("Invalid port '{p}'"))?,
        None => 7878,
    };

    let ip = resolve_host(host, AddressFamily::Ipv4)?;
    let mut client = Handle::create(TransportKind::Stream, AddressFamily::Ipv4)?;
    if tls {
        let paths = CertPath::new();
        client.enable_tls(false, &paths.cert_path, &paths.key_path)?;
    }
    client
        .connect(&ip, port)
        .with_context(|| format!("Failed to connect to {ip}:{port}"))?;

    let mut reply = [0u8; BUFFER_SIZE];
    for line in io::stdin().lock().lines() {
        let line = line? + "\n";
        client.send_all(line.as_bytes())?;
        let n = client.receive_line(&mut reply);
        if n == 0 {
            bail!("Server closed the connection");
        }
        print!("{}", String::from_utf8_lossy(&reply[..n]));
    }
    client.close();
    Ok(())
}
