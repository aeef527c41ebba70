//! Rate-limited byte streaming.
//!
//! [`ThrottledStream`] sits between a file reader and the response body.
//! It holds at most one upstream chunk at a time and releases it in small
//! pieces, each no earlier than `start + bytes_released / rate`. The
//! cumulative output therefore never exceeds `rate × elapsed`, and hyper's
//! demand for the next frame is the only thing that pulls the file forward.

use std::future::Future;
use std::io;
use std::num::NonZeroU64;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures_util::Stream;
use tokio::time::{Instant, Sleep};

/// Number of pieces a second's worth of bytes is split into.
const PIECES_PER_SECOND: u64 = 10;

/// A byte stream paced to a fixed number of bytes per second.
pub struct ThrottledStream<S> {
    inner: S,
    rate: u64,
    max_piece: usize,
    pending: Bytes,
    released: u64,
    started: Option<Instant>,
    sleep: Pin<Box<Sleep>>,
}

impl<S> ThrottledStream<S> {
    pub fn new(inner: S, bytes_per_second: NonZeroU64) -> Self {
        let rate = bytes_per_second.get();
        let max_piece = usize::try_from((rate / PIECES_PER_SECOND).max(1)).unwrap_or(usize::MAX);
        Self {
            inner,
            rate,
            max_piece,
            pending: Bytes::new(),
            released: 0,
            started: None,
            sleep: Box::pin(tokio::time::sleep(Duration::ZERO)),
        }
    }

    fn due(&self, started: Instant, total: u64) -> Instant {
        started + Duration::from_secs_f64(total as f64 / self.rate as f64)
    }
}

impl<S> Stream for ThrottledStream<S>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin,
{
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        while this.pending.is_empty() {
            match ready!(Pin::new(&mut this.inner).poll_next(cx)) {
                Some(Ok(chunk)) => this.pending = chunk,
                // End of stream and errors pass through untouched.
                other => return Poll::Ready(other),
            }
        }

        let started = *this.started.get_or_insert_with(Instant::now);
        let n = this.pending.len().min(this.max_piece);
        let due = this.due(started, this.released + n as u64);

        if Instant::now() < due {
            if this.sleep.deadline() != due {
                this.sleep.as_mut().reset(due);
            }
            ready!(this.sleep.as_mut().poll(cx));
        }

        let piece = this.pending.split_to(n);
        this.released += n as u64;
        Poll::Ready(Some(Ok(piece)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{stream, StreamExt};

    fn source(chunks: Vec<&'static [u8]>) -> impl Stream<Item = io::Result<Bytes>> + Unpin {
        stream::iter(chunks.into_iter().map(|c| Ok(Bytes::from_static(c))))
    }

    fn rate(n: u64) -> NonZeroU64 {
        NonZeroU64::new(n).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn preserves_content_exactly() {
        let data: Vec<&'static [u8]> = vec![b"hello ", b"", b"throttled ", b"world"];
        let throttled = ThrottledStream::new(source(data), rate(4));

        let pieces: Vec<Bytes> = throttled.map(|r| r.unwrap()).collect().await;
        assert!(pieces.iter().all(|p| p.len() == 1));
        assert_eq!(pieces.concat(), b"hello throttled world".to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn never_exceeds_rate() {
        let data = vec![0u8; 1000];
        let leaked: &'static [u8] = Box::leak(data.into_boxed_slice());
        let mut throttled = ThrottledStream::new(source(vec![leaked]), rate(100));

        let start = Instant::now();
        let mut received = 0u64;
        while let Some(piece) = throttled.next().await {
            received += piece.unwrap().len() as u64;
            let elapsed = start.elapsed().as_secs_f64();
            assert!(
                received as f64 <= 100.0 * elapsed + 1e-6,
                "{received} bytes after {elapsed}s"
            );
        }
        assert_eq!(received, 1000);
        assert!(start.elapsed() >= Duration::from_secs(10));
        assert!(start.elapsed() < Duration::from_secs(11));
    }

    #[tokio::test(start_paused = true)]
    async fn errors_propagate() {
        let items = vec![
            Ok(Bytes::from_static(b"ab")),
            Err(io::Error::new(io::ErrorKind::Other, "disk gone")),
        ];
        let mut throttled = ThrottledStream::new(stream::iter(items), rate(1_000));

        assert_eq!(throttled.next().await.unwrap().unwrap(), Bytes::from_static(b"ab"));
        let err = throttled.next().await.unwrap().unwrap_err();
        assert_eq!(err.to_string(), "disk gone");
    }

    #[tokio::test(start_paused = true)]
    async fn pulls_upstream_lazily() {
        let pulled = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = pulled.clone();
        let upstream = stream::iter(0..5).map(move |_| {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok::<_, io::Error>(Bytes::from_static(b"0123456789"))
        });
        let mut throttled = ThrottledStream::new(upstream, rate(10));

        throttled.next().await.unwrap().unwrap();
        assert_eq!(pulled.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(throttled.released, 1);
    }
}
