//! Per-connection bookkeeping.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Track the set of live sockets on a listener
//! - Record socket activity for the idle timeout
//! - Let a handler ask for its own connection to be reset

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use socket2::SockRef;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// The set of live sockets on one listener.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    live: Arc<Mutex<HashMap<ConnectionId, SocketAddr>>>,
}

impl ConnectionTracker {
    /// Create a new connection tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a socket. It stays in the set until the returned guard drops.
    pub fn track(&self, peer: SocketAddr) -> ConnectionGuard {
        let id = ConnectionId::new();
        self.lock().insert(id, peer);
        tracing::trace!(connection_id = %id, peer_addr = %peer, "Connection opened");
        ConnectionGuard {
            tracker: self.clone(),
            id,
        }
    }

    /// Get current live connection count.
    pub fn active_count(&self) -> usize {
        self.lock().len()
    }

    /// Peer addresses of the live connections (test-only).
    #[cfg(test)]
    pub(crate) fn peers(&self) -> Vec<SocketAddr> {
        self.lock().values().copied().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ConnectionId, SocketAddr>> {
        // The map is never left half-updated, so a poisoned lock is still usable.
        self.live.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Guard that tracks a connection's lifetime.
/// Removes the connection from the live set when dropped.
#[derive(Debug)]
pub struct ConnectionGuard {
    tracker: ConnectionTracker,
    id: ConnectionId,
}

impl ConnectionGuard {
    /// Get this connection's ID.
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.tracker.lock().remove(&self.id);
        tracing::trace!(connection_id = %self.id, "Connection closed");
    }
}

/// Handle given to request handlers to abort the connection they arrived on.
#[derive(Debug, Clone, Default)]
pub struct ConnectionControl {
    inner: Arc<ControlInner>,
}

#[derive(Debug, Default)]
struct ControlInner {
    reset: AtomicBool,
    notify: Notify,
}

impl ConnectionControl {
    /// Ask for the socket to be torn down with a TCP reset and no further bytes.
    pub fn reset(&self) {
        self.inner.reset.store(true, Ordering::SeqCst);
        self.inner.notify.notify_one();
    }

    pub fn is_reset(&self) -> bool {
        self.inner.reset.load(Ordering::SeqCst)
    }

    /// Resolve once [`reset`](Self::reset) has been called.
    pub async fn reset_requested(&self) {
        if self.is_reset() {
            return;
        }
        self.inner.notify.notified().await;
    }
}

/// Last time bytes moved in either direction on a socket.
#[derive(Debug)]
pub struct Activity {
    epoch: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    pub fn touch(&self) {
        let now = self.epoch.elapsed().as_millis() as u64;
        self.last_ms.store(now, Ordering::Relaxed);
    }

    pub fn last(&self) -> Instant {
        self.epoch + Duration::from_millis(self.last_ms.load(Ordering::Relaxed))
    }

    /// Resolve once no bytes have moved for `idle`.
    pub async fn idle_for(&self, idle: Duration) {
        loop {
            let deadline = self.last() + idle;
            if Instant::now() >= deadline {
                return;
            }
            tokio::time::sleep_until(deadline).await;
        }
    }
}

impl Default for Activity {
    fn default() -> Self {
        Self::new()
    }
}

/// A TCP stream that records activity and can be dropped with a reset.
#[derive(Debug)]
pub struct TrackedStream {
    inner: TcpStream,
    activity: Arc<Activity>,
    control: ConnectionControl,
}

impl TrackedStream {
    pub fn new(inner: TcpStream, activity: Arc<Activity>, control: ConnectionControl) -> Self {
        Self {
            inner,
            activity,
            control,
        }
    }
}

impl Drop for TrackedStream {
    fn drop(&mut self) {
        if self.control.is_reset() {
            // Zero linger turns the close into an RST instead of a FIN.
            if let Err(e) = SockRef::from(&self.inner).set_linger(Some(Duration::ZERO)) {
                tracing::debug!(error = %e, "Failed to set zero linger");
            }
        }
    }
}

impl AsyncRead for TrackedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let result = Pin::new(&mut this.inner).poll_read(cx, buf);
        if matches!(result, Poll::Ready(Ok(()))) && buf.filled().len() > before {
            this.activity.touch();
        }
        result
    }
}

impl AsyncWrite for TrackedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let result = Pin::new(&mut this.inner).poll_write(cx, buf);
        if matches!(result, Poll::Ready(Ok(n)) if n > 0) {
            this.activity.touch();
        }
        result
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let result = Pin::new(&mut this.inner).poll_write_vectored(cx, bufs);
        if matches!(result, Poll::Ready(Ok(n)) if n > 0) {
            this.activity.touch();
        }
        result
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn connection_id_unique() {
        let id1 = ConnectionId::new();
        let id2 = ConnectionId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn connection_tracker_counts() {
        let tracker = ConnectionTracker::new();
        assert_eq!(tracker.active_count(), 0);

        let guard1 = tracker.track(peer(1000));
        assert_eq!(tracker.active_count(), 1);

        let guard2 = tracker.track(peer(1001));
        assert_eq!(tracker.active_count(), 2);
        assert_ne!(guard1.id(), guard2.id());

        drop(guard1);
        assert_eq!(tracker.peers(), vec![peer(1001)]);

        drop(guard2);
        assert_eq!(tracker.active_count(), 0);
    }

    #[tokio::test]
    async fn reset_request_is_remembered() {
        let control = ConnectionControl::default();
        assert!(!control.is_reset());
        control.reset();
        assert!(control.is_reset());
        // Resolves even though nobody was waiting when reset() ran.
        tokio::time::timeout(Duration::from_millis(100), control.reset_requested())
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timer_restarts_on_activity() {
        let activity = Arc::new(Activity::new());
        let start = Instant::now();

        let toucher = activity.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            toucher.touch();
        });

        activity.idle_for(Duration::from_secs(5)).await;
        assert!(start.elapsed() >= Duration::from_secs(8));
    }
}
