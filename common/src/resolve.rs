use std::net::ToSocketAddrs;

use crate::{
    error::{Error, Result},
    handle::AddressFamily,
};

/// Looks `hostname` up once and returns the first address of `family` in
/// textual form, ready for [`Handle::bind`](crate::Handle::bind) or
/// [`Handle::connect`](crate::Handle::connect).
pub fn resolve_host(hostname: &str, family: AddressFamily) -> Result<String> {
    let ip = (hostname, 0)
        .to_socket_addrs()?
        .map(|addr| addr.ip())
        .find(|ip| AddressFamily::of(ip) == family)
        .ok_or_else(|| Error::Resolve {
            host: hostname.to_string(),
            family,
        })?;
    tracing::debug!("Resolved {} to {}", hostname, ip);
    Ok(ip.to_string())
}
