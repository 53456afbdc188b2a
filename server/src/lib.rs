//! Thread-per-connection server for unisock handles
//!
//! A [`ThreadedServer`] takes a bound stream [`Handle`], puts it into the
//! listening state and then accepts forever. Every accepted connection is
//! packed into a [`Dispatch`] record and handed to a fresh, detached worker
//! thread that attempts the TLS handshake (when the listener has TLS
//! enabled), runs the caller's handler and closes the connection.
//!
//! There is no worker limit: the listen backlog is the only admission
//! control. The shared context is passed to every handler by reference and
//! is never locked here, so it must be `Sync` (atomics, mutexes, channels).

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};

use anyhow::{anyhow, bail, Context, Result};
use unisock_common::{Error, Handle, TransportKind};

/// Per-connection dispatch record
pub mod dispatch;

/// Server tunables
pub mod options;

pub use dispatch::Dispatch;
pub use options::ServerOptions;

/// Accept loop dispatching each connection to its own thread
pub struct ThreadedServer {
    listener: Handle,
    options:  ServerOptions,
    next_id:  u64,
}

impl ThreadedServer {
    /// Starts listening on a bound stream handle.
    ///
    /// # Arguments
    /// * `listener` - Stream handle that has already been bound
    /// * `options` - Backlog and per-connection settings
    pub fn new(mut listener: Handle, options: ServerOptions) -> Result<Self> {
        if listener.kind() != TransportKind::Stream {
            bail!("threaded server needs a stream handle, got {:?}", listener.kind());
        }
        if !listener.is_server() {
            bail!("threaded server needs a bound handle");
        }
        if listener.is_listening() {
            tracing::warn!(
                "Handle is already listening, backlog {} not applied",
                options.backlog
            );
        } else {
            listener
                .listen(options.backlog)
                .context("Failed to listen on server handle")?;
        }

        match listener.local_addr() {
            Ok(addr) => tracing::info!("Threaded server listening on {}", addr),
            Err(e) => tracing::warn!("Threaded server listening on unknown address: {}", e),
        }

        Ok(Self {
            listener,
            options,
            next_id: 0,
        })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Failed to read listener address")
    }

    /// Accepts and dispatches connections indefinitely.
    ///
    /// Only returns once the listening descriptor becomes unusable.
    pub fn run<H, C>(&mut self, handler: H, context: Arc<C>) -> Result<()>
    where
        H: Fn(&mut Handle, &C) + Send + Sync + 'static,
        C: Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        self.serve(&handler, &context, None)
    }

    /// Like [`ThreadedServer::run`], but returns once `running` turns false.
    ///
    /// The listener is polled in non-blocking mode while serving and put back
    /// into blocking mode afterwards. Workers already started keep running.
    pub fn run_until<H, C>(
        &mut self,
        running: Arc<AtomicBool>,
        handler: H,
        context: Arc<C>,
    ) -> Result<()>
    where
        H: Fn(&mut Handle, &C) + Send + Sync + 'static,
        C: Send + Sync + 'static,
    {
        self.listener
            .set_blocking(false)
            .context("Failed to make listener non-blocking")?;

        let handler = Arc::new(handler);
        let served = self.serve(&handler, &context, Some(&running));

        self.listener
            .set_blocking(true)
            .context("Failed to restore blocking listener")?;
        tracing::info!("Server shutdown signal received, stopped accepting");
        served
    }

    fn serve<H, C>(
        &mut self,
        handler: &Arc<H>,
        context: &Arc<C>,
        running: Option<&AtomicBool>,
    ) -> Result<()>
    where
        H: Fn(&mut Handle, &C) + Send + Sync + 'static,
        C: Send + Sync + 'static,
    {
        loop {
            if running.is_some_and(|flag| !flag.load(Ordering::SeqCst)) {
                return Ok(());
            }

            match self.listener.accept_deferred() {
                Ok(client) => self.dispatch(client, handler, context),
                Err(e) if e.is_would_block() => {
                    thread::sleep(self.options.poll_interval);
                }
                Err(e) if listener_is_gone(&e) => {
                    tracing::error!("Listener failed, stopping accept loop: {}", e);
                    return Err(anyhow!(e).context("Accept loop stopped"));
                }
                Err(e) => {
                    tracing::warn!("Accept failed: {}", e);
                    thread::sleep(self.options.poll_interval);
                }
            }
        }
    }

    fn dispatch<H, C>(&mut self, mut client: Handle, handler: &Arc<H>, context: &Arc<C>)
    where
        H: Fn(&mut Handle, &C) + Send + Sync + 'static,
        C: Send + Sync + 'static,
    {
        self.next_id += 1;
        let id = self.next_id;

        if let Some(timeout) = self.options.client_timeout {
            if let Err(e) = client.set_timeout(Some(timeout)) {
                tracing::warn!("Connection {}: failed to set timeout: {}", id, e);
            }
        }
        match client.peer_addr() {
            Ok(peer) => tracing::info!("Connection {} from {}", id, peer),
            Err(_) => tracing::info!("Connection {} accepted", id),
        }

        let record = Dispatch::new(id, client, Arc::clone(handler), Arc::clone(context));
        let spawned = thread::Builder::new()
            .name(format!("{}-{}", self.options.thread_name_prefix, id))
            .spawn(move || record.run());

        // The worker is never joined; a failed spawn drops the record and
        // with it the connection.
        if let Err(e) = spawned {
            tracing::error!("Connection {}: failed to spawn worker: {}", id, e);
        }
    }
}

/// Listens on the bound `server` handle and serves it forever.
///
/// # Arguments
/// * `server` - Bound stream handle, optionally with TLS enabled
/// * `backlog` - Pending connection queue length; ignored when `server` is
///   already listening, which keeps the backlog given to its own `listen`
/// * `handler` - Called on a dedicated thread for every connection; the
///   connection is closed after it returns
/// * `context` - Shared with every handler invocation, unsynchronized
pub fn start_threaded_server<H, C>(
    server: Handle,
    backlog: i32,
    handler: H,
    context: Arc<C>,
) -> Result<()>
where
    H: Fn(&mut Handle, &C) + Send + Sync + 'static,
    C: Send + Sync + 'static,
{
    let options = ServerOptions::new().with_backlog(backlog);
    ThreadedServer::new(server, options)?.run(handler, context)
}

/// True when an accept error means the listening descriptor is unusable
fn listener_is_gone(e: &Error) -> bool {
    match e {
        Error::Closed | Error::Misuse(_) => true,
        #[cfg(unix)]
        Error::Io(io) => matches!(
            io.raw_os_error(),
            Some(libc::EBADF) | Some(libc::ENOTSOCK) | Some(libc::EINVAL)
        ),
        #[cfg(not(unix))]
        Error::Io(io) => io.kind() == std::io::ErrorKind::InvalidInput,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use unisock_common::AddressFamily;

    use super::*;

    #[test]
    fn invalid_descriptor_stops_the_loop() {
        assert!(listener_is_gone(&Error::Closed));
        assert!(listener_is_gone(&Error::Misuse("accept requires a listening handle")));
        #[cfg(unix)]
        assert!(listener_is_gone(&Error::Io(io::Error::from_raw_os_error(libc::EBADF))));
    }

    #[test]
    fn transient_failures_keep_accepting() {
        assert!(!listener_is_gone(&Error::Io(io::ErrorKind::ConnectionAborted.into())));
        #[cfg(unix)]
        assert!(!listener_is_gone(&Error::Io(io::Error::from_raw_os_error(libc::EMFILE))));
    }

    #[test]
    fn unbound_handle_is_rejected() {
        let handle = Handle::create(TransportKind::Stream, AddressFamily::Ipv4).unwrap();
        assert!(ThreadedServer::new(handle, ServerOptions::new()).is_err());
    }

    #[test]
    fn datagram_handle_is_rejected() {
        let mut handle = Handle::create(TransportKind::Datagram, AddressFamily::Ipv4).unwrap();
        handle.bind("127.0.0.1", 0).unwrap();
        assert!(ThreadedServer::new(handle, ServerOptions::new()).is_err());
    }

    #[test]
    fn already_listening_handle_is_served_as_is() {
        let mut handle = Handle::create(TransportKind::Stream, AddressFamily::Ipv4).unwrap();
        handle.bind("127.0.0.1", 0).unwrap();
        handle.listen(2).unwrap();
        let server = ThreadedServer::new(handle, ServerOptions::new().with_backlog(64)).unwrap();
        assert!(server.listener.is_listening());
        assert!(server.listener.last_error().is_none());
    }

    #[test]
    fn new_puts_handle_into_listening_state() {
        let mut handle = Handle::create(TransportKind::Stream, AddressFamily::Ipv4).unwrap();
        handle.bind("127.0.0.1", 0).unwrap();
        let server = ThreadedServer::new(handle, ServerOptions::new().with_backlog(8)).unwrap();
        assert_ne!(server.local_addr().unwrap().port(), 0);
        assert!(server.listener.is_listening());
    }
}
