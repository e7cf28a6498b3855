//! Connection configuration options.
//!
//! Builder for the timeouts, queue bounds, and reconnection parameters shared
//! by `Hub` and `Client`.

use std::time::Duration;

/// Connection configuration options.
///
/// # Examples
///
/// ```
/// use junction_core::options::ConnectionOptions;
/// use std::time::Duration;
///
/// let opts = ConnectionOptions::default()
///     .with_recv_timeout(Duration::from_secs(5))
///     .with_send_timeout(Duration::from_secs(5));
/// ```
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Maximum time to wait for a `wait`/`wait_any` to complete.
    /// `None` blocks indefinitely.
    pub recv_timeout: Option<Duration>,

    /// Maximum time to wait for an outbound queue slot to free up.
    pub send_timeout: Option<Duration>,

    /// Maximum time to complete the ident/subscription handshake after connect.
    pub handshake_timeout: Duration,

    /// Time to wait for queued outbound messages to drain before a hard close.
    pub linger: Option<Duration>,

    /// Initial reconnection delay after an unexpected connection loss.
    pub reconnect_ivl: Duration,

    /// Maximum reconnection delay for exponential backoff.
    /// `Duration::ZERO` disables backoff growth (always `reconnect_ivl`).
    pub reconnect_ivl_max: Duration,

    /// Maximum time to wait for the initial TCP connect to complete.
    pub connect_timeout: Duration,

    /// Bound on the number of queued outbound frames per peer connection.
    pub send_hwm: usize,

    /// Maximum encoded payload size accepted from the wire.
    pub max_msg_size: Option<usize>,

    /// Size of arena-allocated read buffers.
    pub read_buffer_size: usize,

    /// Initial capacity of write buffers used to encode outbound frames.
    pub write_buffer_size: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            recv_timeout: None,
            send_timeout: None,
            handshake_timeout: Duration::from_secs(30),
            linger: Some(Duration::from_secs(30)),
            reconnect_ivl: Duration::from_millis(100),
            reconnect_ivl_max: Duration::ZERO,
            connect_timeout: Duration::ZERO,
            send_hwm: 1000,
            max_msg_size: None,
            read_buffer_size: 8192,
            write_buffer_size: 8192,
        }
    }
}

impl ConnectionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_recv_timeout(mut self, timeout: Duration) -> Self {
        self.recv_timeout = Some(timeout);
        self
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = Some(timeout);
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_linger(mut self, linger: Option<Duration>) -> Self {
        self.linger = linger;
        self
    }

    pub fn with_reconnect_ivl(mut self, ivl: Duration) -> Self {
        self.reconnect_ivl = ivl;
        self
    }

    pub fn with_reconnect_ivl_max(mut self, max: Duration) -> Self {
        self.reconnect_ivl_max = max;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_send_hwm(mut self, hwm: usize) -> Self {
        self.send_hwm = hwm;
        self
    }

    pub fn with_max_msg_size(mut self, size: Option<usize>) -> Self {
        self.max_msg_size = size;
        self
    }

    pub fn with_buffer_sizes(mut self, read_size: usize, write_size: usize) -> Self {
        self.read_buffer_size = read_size;
        self.write_buffer_size = write_size;
        self
    }

    pub fn is_recv_nonblocking(&self) -> bool {
        matches!(self.recv_timeout, Some(d) if d.is_zero())
    }

    /// Reconnection delay for a given attempt count, honoring `reconnect_ivl_max`.
    pub fn next_reconnect_ivl(&self, attempt: u32) -> Duration {
        if self.reconnect_ivl_max.is_zero() {
            return self.reconnect_ivl;
        }
        let backoff = self
            .reconnect_ivl
            .saturating_mul(2u32.saturating_pow(attempt));
        backoff.min(self.reconnect_ivl_max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options() {
        let opts = ConnectionOptions::default();
        assert!(opts.recv_timeout.is_none());
        assert_eq!(opts.handshake_timeout, Duration::from_secs(30));
        assert_eq!(opts.reconnect_ivl, Duration::from_millis(100));
        assert_eq!(opts.send_hwm, 1000);
    }

    #[test]
    fn builder_pattern() {
        let opts = ConnectionOptions::new()
            .with_recv_timeout(Duration::from_secs(5))
            .with_send_hwm(2000);

        assert_eq!(opts.recv_timeout, Some(Duration::from_secs(5)));
        assert_eq!(opts.send_hwm, 2000);
    }

    #[test]
    fn exponential_backoff() {
        let opts = ConnectionOptions::new()
            .with_reconnect_ivl(Duration::from_millis(100))
            .with_reconnect_ivl_max(Duration::from_secs(10));

        assert_eq!(opts.next_reconnect_ivl(0), Duration::from_millis(100));
        assert_eq!(opts.next_reconnect_ivl(1), Duration::from_millis(200));
        assert_eq!(opts.next_reconnect_ivl(10), Duration::from_secs(10));
    }
}
