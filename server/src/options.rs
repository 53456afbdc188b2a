use std::time::Duration;

use unisock_common::DEFAULT_BACKLOG;

const DEFAULT_THREAD_PREFIX: &str = "unisock-conn";
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Tunables for [`ThreadedServer`](crate::ThreadedServer)
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Pending connections queued by `listen`
    pub backlog:            i32,
    /// Send/receive bound applied to every accepted handle before dispatch
    pub client_timeout:     Option<Duration>,
    /// Worker threads are named `<prefix>-<connection id>`
    pub thread_name_prefix: String,
    /// Sleep between accept attempts in the shutdown-aware loop
    pub poll_interval:      Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            backlog:            DEFAULT_BACKLOG,
            client_timeout:     None,
            thread_name_prefix: DEFAULT_THREAD_PREFIX.to_string(),
            poll_interval:      DEFAULT_POLL_INTERVAL,
        }
    }
}

impl ServerOptions {
    /// Creates options with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the listen backlog
    pub fn with_backlog(mut self, backlog: i32) -> Self {
        self.backlog = backlog;
        self
    }

    /// Set the timeout applied to accepted connections
    pub fn with_client_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.client_timeout = timeout;
        self
    }

    /// Set the worker thread name prefix
    pub fn with_thread_name_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Set the accept poll interval used by `run_until`
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}
