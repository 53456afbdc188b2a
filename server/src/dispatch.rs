use std::{
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

use unisock_common::{Handle, SecurityMode};

/// One accepted connection on its way to a worker thread.
///
/// The record owns the client handle. Dropping the record closes the handle,
/// so cleanup happens on every exit path of the worker: normal return, failed
/// handshake, a panicking handler, or a worker that never got spawned.
pub struct Dispatch<H, C> {
    id:      u64,
    client:  Handle,
    handler: Arc<H>,
    context: Arc<C>,
}

impl<H, C> Dispatch<H, C>
where
    H: Fn(&mut Handle, &C),
{
    /// Packages an accepted handle with the handler and the shared context
    pub fn new(id: u64, client: Handle, handler: Arc<H>, context: Arc<C>) -> Self {
        Self {
            id,
            client,
            handler,
            context,
        }
    }

    /// Connection number assigned by the accept loop
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Attempts a pending TLS handshake, then runs the handler.
    ///
    /// A failed handshake still reaches the handler, which can check
    /// [`Handle::handshake_complete`] and [`Handle::last_error`]; TLS I/O on
    /// such a handle keeps failing.
    pub fn run(mut self) {
        if self.client.security() == SecurityMode::Tls {
            if let Err(e) = self.client.complete_handshake() {
                tracing::warn!("Connection {}: TLS handshake failed: {}", self.id, e);
            }
        }

        tracing::debug!("Connection {}: handler started", self.id);
        let handler: &H = &self.handler;
        let context: &C = &self.context;
        let client = &mut self.client;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(client, context)));
        match outcome {
            Ok(()) => tracing::debug!("Connection {}: handler finished", self.id),
            Err(_) => tracing::error!("Connection {}: handler panicked", self.id),
        }
    }
}

impl<H, C> Drop for Dispatch<H, C> {
    fn drop(&mut self) {
        self.client.close();
        tracing::debug!("Connection {}: closed", self.id);
    }
}
