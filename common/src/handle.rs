use std::{
    fmt,
    net::{IpAddr, SocketAddr},
    path::Path,
    time::Duration,
};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::{
    config::CertPath,
    error::{Error, ErrorCode, Result},
    tls::{TlsContext, TlsSession},
};

/// Transport a handle speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Connection-oriented byte stream (TCP)
    Stream,
    /// Connectionless datagrams (UDP)
    Datagram,
    /// Direct IP protocol access
    Raw,
}

impl TransportKind {
    fn socket_type(self) -> Type {
        match self {
            TransportKind::Stream => Type::STREAM,
            TransportKind::Datagram => Type::DGRAM,
            TransportKind::Raw => Type::RAW,
        }
    }

    fn default_protocol(self, family: AddressFamily) -> Option<Protocol> {
        match (self, family) {
            (TransportKind::Raw, AddressFamily::Ipv4) => Some(Protocol::ICMPV4),
            (TransportKind::Raw, AddressFamily::Ipv6) => Some(Protocol::ICMPV6),
            _ => None,
        }
    }
}

/// IP version of a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    /// IPv4
    Ipv4,
    /// IPv6
    Ipv6,
}

impl AddressFamily {
    /// Family an address belongs to
    pub fn of(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => AddressFamily::Ipv4,
            IpAddr::V6(_) => AddressFamily::Ipv6,
        }
    }

    fn domain(self) -> Domain {
        match self {
            AddressFamily::Ipv4 => Domain::IPV4,
            AddressFamily::Ipv6 => Domain::IPV6,
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressFamily::Ipv4 => f.write_str("IPv4"),
            AddressFamily::Ipv6 => f.write_str("IPv6"),
        }
    }
}

/// Whether I/O passes through a TLS session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityMode {
    /// Bare transport
    Plain,
    /// Encrypted through a TLS session
    Tls,
}

/// One communication endpoint: a TCP stream, UDP endpoint or raw socket,
/// optionally wrapped in TLS.
///
/// A handle exclusively owns its descriptor and TLS session. Failing
/// operations return an error and also record it, retrievable through
/// [`Handle::last_error`]. Dropping a handle closes it.
#[derive(Debug)]
pub struct Handle {
    pub(crate) socket:     Option<Socket>,
    pub(crate) kind:       TransportKind,
    pub(crate) family:     AddressFamily,
    pub(crate) is_server:  bool,
    pub(crate) blocking:   bool,
    pub(crate) listening:  bool,
    pub(crate) connected:  bool,
    pub(crate) last_error: Option<ErrorCode>,
    pub(crate) context:    Option<TlsContext>,
    pub(crate) session:    Option<TlsSession>,
}

impl Handle {
    /// Allocates a descriptor for the given transport and family.
    ///
    /// Raw handles default to ICMP for the family; use
    /// [`Handle::with_protocol`] to pick another protocol.
    pub fn create(kind: TransportKind, family: AddressFamily) -> Result<Self> {
        Self::with_protocol(kind, family, None)
    }

    /// Like [`Handle::create`] with an explicit IP protocol number
    pub fn with_protocol(
        kind: TransportKind,
        family: AddressFamily,
        protocol: Option<i32>,
    ) -> Result<Self> {
        let protocol = protocol
            .map(Protocol::from)
            .or_else(|| kind.default_protocol(family));
        let socket = Socket::new(family.domain(), kind.socket_type(), protocol)?;
        tracing::debug!("Created {:?} handle ({})", kind, family);
        Ok(Self::from_socket(socket, kind, family))
    }

    fn from_socket(socket: Socket, kind: TransportKind, family: AddressFamily) -> Self {
        Self {
            socket: Some(socket),
            kind,
            family,
            is_server: false,
            blocking: true,
            listening: false,
            connected: false,
            last_error: None,
            context: None,
            session: None,
        }
    }

    /// Switches between suspending and would-block I/O
    pub fn set_blocking(&mut self, blocking: bool) -> Result<()> {
        let result = self
            .socket()
            .and_then(|s| Ok(s.set_nonblocking(!blocking)?));
        self.record(result)?;
        self.blocking = blocking;
        Ok(())
    }

    /// Bounds how long blocking sends and receives may suspend.
    ///
    /// Applies to both directions. `None` or a zero duration removes the bound.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        let timeout = timeout.filter(|t| !t.is_zero());
        let result = self.socket().and_then(|s| {
            s.set_read_timeout(timeout)?;
            s.set_write_timeout(timeout)?;
            Ok(())
        });
        self.record(result)
    }

    /// Allows rebinding an address still lingering after close. Set before
    /// [`Handle::bind`].
    pub fn set_reuse_address(&mut self, reuse: bool) -> Result<()> {
        let result = self
            .socket()
            .and_then(|s| Ok(s.set_reuse_address(reuse)?));
        self.record(result)
    }

    /// Assigns the local address. `host` must be an IP literal of the
    /// handle's family. On failure the handle stays usable for a retry.
    pub fn bind(&mut self, host: &str, port: u16) -> Result<()> {
        let result = self
            .sock_addr(host, port)
            .and_then(|addr| Ok(self.socket()?.bind(&addr)?));
        self.record(result)?;
        self.is_server = true;
        tracing::debug!("Bound {:?} handle to {}:{}", self.kind, host, port);
        Ok(())
    }

    /// Marks a bound stream handle ready to accept, queuing up to `backlog`
    /// pending connections
    pub fn listen(&mut self, backlog: i32) -> Result<()> {
        let result = if self.kind != TransportKind::Stream {
            Err(Error::Misuse("listen requires a stream handle"))
        } else {
            self.socket().and_then(|s| Ok(s.listen(backlog)?))
        };
        self.record(result)?;
        self.listening = true;
        tracing::debug!("Listening with backlog {}", backlog);
        Ok(())
    }

    /// Waits for the next connection and returns it as a new handle.
    ///
    /// On a TLS listener the server-side handshake runs before returning. A
    /// failed handshake still yields the handle; check
    /// [`Handle::handshake_complete`] and the new handle's
    /// [`Handle::last_error`].
    pub fn accept(&mut self) -> Result<Handle> {
        let mut client = self.accept_deferred()?;
        if client.session.is_some() {
            if let Err(e) = client.complete_handshake() {
                tracing::warn!("Server-side TLS handshake failed: {}", e);
            }
        }
        Ok(client)
    }

    /// Accepts without running the TLS handshake. The returned handle
    /// carries a fresh session; the handshake happens on
    /// [`Handle::complete_handshake`] or on its first I/O call.
    ///
    /// Exists so `unisock-server` can run handshakes on worker threads.
    /// Application code should use [`Handle::accept`].
    pub fn accept_deferred(&mut self) -> Result<Handle> {
        let result = self.accept_connection();
        self.record(result)
    }

    fn accept_connection(&self) -> Result<Handle> {
        if self.kind != TransportKind::Stream {
            return Err(Error::Misuse("accept requires a stream handle"));
        }
        if !self.listening {
            return Err(Error::Misuse("accept requires a listening handle"));
        }

        let (socket, peer) = self.socket()?.accept()?;
        // Accepted sockets start blocking whatever mode the listener is in.
        socket.set_nonblocking(false)?;

        let mut client = Handle::from_socket(socket, self.kind, self.family);
        client.connected = true;
        if let Some(context) = &self.context {
            if !context.is_server() {
                return Err(Error::Misuse("listener TLS context is not in server role"));
            }
            client.session = Some(context.new_session()?);
        }
        tracing::debug!("Accepted connection from {:?}", peer.as_socket());
        Ok(client)
    }

    /// Connects a stream handle, or fixes the peer of a datagram handle.
    ///
    /// TLS handles run the client-side handshake right after the transport
    /// connects.
    pub fn connect(&mut self, host: &str, port: u16) -> Result<()> {
        let result = self
            .sock_addr(host, port)
            .and_then(|addr| Ok(self.socket()?.connect(&addr)?));
        self.record(result)?;
        self.connected = true;
        tracing::debug!("Connected {:?} handle to {}:{}", self.kind, host, port);

        if self.session.is_some() {
            self.complete_handshake()?;
        }
        Ok(())
    }

    /// Runs the pending TLS handshake for whichever role the session has.
    ///
    /// `connect` and `accept` already do this; it is only needed after
    /// [`Handle::accept_deferred`], as the threaded server does.
    pub fn complete_handshake(&mut self) -> Result<()> {
        let result = match (self.socket.as_mut(), self.session.as_mut()) {
            (Some(socket), Some(session)) => session.handshake(socket),
            (None, _) => Err(Error::Closed),
            (Some(_), None) => Err(Error::Misuse("handle is not in TLS mode")),
        };
        self.record(result)
    }

    /// Switches the handle to TLS.
    ///
    /// Builds a context for the role (generating a self-signed pair first if
    /// a server's certificate file is missing), then attaches a session. On
    /// failure the handle stays plain.
    pub fn enable_tls<C, K>(&mut self, server: bool, cert_path: C, key_path: K) -> Result<()>
    where
        C: AsRef<Path>,
        K: AsRef<Path>,
    {
        let paths = CertPath {
            cert_path: cert_path.as_ref().to_path_buf(),
            key_path:  key_path.as_ref().to_path_buf(),
        };
        let result = self.attach_tls(server, &paths);
        self.record(result)
    }

    fn attach_tls(&mut self, server: bool, paths: &CertPath) -> Result<()> {
        self.socket()?;
        if self.kind != TransportKind::Stream {
            return Err(Error::Misuse("TLS requires a stream handle"));
        }

        let context = TlsContext::load(server, paths)?;
        let session = context.new_session()?;
        self.context = Some(context);
        self.session = Some(session);
        tracing::info!(
            "TLS enabled ({} role)",
            if server { "server" } else { "client" }
        );
        Ok(())
    }

    /// Releases the session, context and descriptor. Calling it again does
    /// nothing.
    pub fn close(&mut self) {
        let Some(mut socket) = self.socket.take() else {
            return;
        };
        if let Some(session) = self.session.as_mut() {
            session.shutdown(&mut socket);
        }
        self.session = None;
        self.context = None;
        self.listening = false;
        self.connected = false;
        drop(socket);
        tracing::debug!("Closed {:?} handle", self.kind);
    }

    /// Local address the descriptor is bound to
    pub fn local_addr(&self) -> Result<SocketAddr> {
        let addr = self.socket()?.local_addr()?;
        addr.as_socket()
            .ok_or(Error::Misuse("handle is not bound to an IP address"))
    }

    /// Address of the connected peer
    pub fn peer_addr(&self) -> Result<SocketAddr> {
        let addr = self.socket()?.peer_addr()?;
        addr.as_socket()
            .ok_or(Error::Misuse("peer is not an IP address"))
    }

    /// Transport kind
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Address family
    pub fn family(&self) -> AddressFamily {
        self.family
    }

    /// Set once the handle has been bound
    pub fn is_server(&self) -> bool {
        self.is_server
    }

    /// Whether I/O suspends instead of failing with would-block
    pub fn is_blocking(&self) -> bool {
        self.blocking
    }

    /// Plain or TLS
    pub fn security(&self) -> SecurityMode {
        if self.session.is_some() {
            SecurityMode::Tls
        } else {
            SecurityMode::Plain
        }
    }

    /// The owned TLS context, present on handles TLS was enabled on
    pub fn tls_context(&self) -> Option<&TlsContext> {
        self.context.as_ref()
    }

    /// True once the TLS handshake has succeeded
    pub fn handshake_complete(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(TlsSession::is_established)
    }

    /// Whether `listen` succeeded
    pub fn is_listening(&self) -> bool {
        self.listening
    }

    /// Whether the handle was connected or accepted
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Whether `close` has run
    pub fn is_closed(&self) -> bool {
        self.socket.is_none()
    }

    /// The most recent recorded failure
    pub fn last_error(&self) -> Option<&ErrorCode> {
        self.last_error.as_ref()
    }

    /// Forgets the recorded failure
    pub fn clear_error(&mut self) {
        self.last_error = None;
    }

    pub(crate) fn socket(&self) -> Result<&Socket> {
        self.socket.as_ref().ok_or(Error::Closed)
    }

    pub(crate) fn record<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            self.last_error = Some(e.code());
        }
        result
    }

    pub(crate) fn sock_addr(&self, host: &str, port: u16) -> Result<SockAddr> {
        let invalid = || Error::InvalidAddress {
            host:   host.to_string(),
            family: self.family,
        };
        let ip: IpAddr = host.parse().map_err(|_| invalid())?;
        if AddressFamily::of(&ip) != self.family {
            return Err(invalid());
        }
        Ok(SockAddr::from(SocketAddr::new(ip, port)))
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.close();
    }
}
