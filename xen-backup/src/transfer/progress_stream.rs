//! Stream wrapper counting the bytes moved over the data-plane.

use bytes::Bytes;
use futures_util::Stream;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

/// Counts every chunk that passes through into a shared counter, which the
/// task poll loop samples.
pub struct ProgressStream<S> {
    inner: S,
    bytes_transferred: u64,
    counter: Arc<AtomicU64>,
}

impl<S> ProgressStream<S> {
    pub fn new(inner: S, counter: Arc<AtomicU64>) -> Self {
        counter.store(0, Ordering::Relaxed);
        Self {
            inner,
            bytes_transferred: 0,
            counter,
        }
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }
}

impl<S, E> Stream for ProgressStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    type Item = Result<Bytes, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(bytes))) => {
                self.bytes_transferred += bytes.len() as u64;
                self.counter.store(self.bytes_transferred, Ordering::Relaxed);
                Poll::Ready(Some(Ok(bytes)))
            }
            other => other,
        }
    }
}
