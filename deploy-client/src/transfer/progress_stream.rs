//! Stream wrapper reporting upload bytes as the body is consumed.

use bytes::Bytes;
use futures_util::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::time::{Duration, Instant};

/// Called with the running byte count
pub type ByteCallback = Arc<dyn Fn(u64) + Send + Sync>;

pub struct ProgressStream<S> {
    inner: S,
    bytes_sent: u64,
    last_report: Instant,
    interval: Duration,
    callback: ByteCallback,
}

impl<S> ProgressStream<S>
where
    S: Stream<Item = Result<Bytes, std::io::Error>>,
{
    pub fn new(inner: S, callback: ByteCallback) -> Self {
        Self {
            inner,
            bytes_sent: 0,
            last_report: Instant::now(),
            interval: Duration::from_millis(250),
            callback,
        }
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }
}

impl<S> Stream for ProgressStream<S>
where
    S: Stream<Item = Result<Bytes, std::io::Error>> + Unpin,
{
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                self.bytes_sent += chunk.len() as u64;
                let now = Instant::now();
                if now.duration_since(self.last_report) >= self.interval {
                    (self.callback)(self.bytes_sent);
                    self.last_report = now;
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(None) => {
                (self.callback)(self.bytes_sent);
                Poll::Ready(None)
            }
            other => other,
        }
    }
}
