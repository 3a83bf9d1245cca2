//! Byte counting interposition for async streams
//!
//! [`CountingStream`] sits between a transport and its user and reports how many
//! bytes crossed the read and write paths, without buffering, delaying or
//! reordering anything.

use prometheus::IntCounter;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

/// A sink for byte counts.
pub trait ByteCount: Send + Sync {
    fn count(&self, bytes: u64);
}

impl ByteCount for AtomicU64 {
    #[inline]
    fn count(&self, bytes: u64) {
        self.fetch_add(bytes, Ordering::Relaxed);
    }
}

impl ByteCount for IntCounter {
    #[inline]
    fn count(&self, bytes: u64) {
        self.inc_by(bytes);
    }
}

impl<T: ByteCount + ?Sized> ByteCount for Arc<T> {
    #[inline]
    fn count(&self, bytes: u64) {
        (**self).count(bytes);
    }
}

impl<A: ByteCount, B: ByteCount> ByteCount for (A, B) {
    #[inline]
    fn count(&self, bytes: u64) {
        self.0.count(bytes);
        self.1.count(bytes);
    }
}

/// Adapts a closure into a [`ByteCount`].
pub struct CountFn<F>(pub F);

impl<F: Fn(u64) + Send + Sync> ByteCount for CountFn<F> {
    #[inline]
    fn count(&self, bytes: u64) {
        (self.0)(bytes);
    }
}

/// UTF-8 byte length of a text chunk.
///
/// Counters always work on bytes, so text must be measured in its encoded form
/// rather than in characters.
#[inline]
pub fn byte_len(text: &str) -> u64 {
    text.len() as u64
}

/// Stream wrapper counting bytes written to and read from the inner stream.
pub struct CountingStream<S> {
    inner: S,
    written: Option<Arc<dyn ByteCount>>,
    read: Option<Arc<dyn ByteCount>>,
}

impl<S> CountingStream<S> {
    /// Wraps `inner` with no counters attached.
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            written: None,
            read: None,
        }
    }

    /// Counts every byte accepted by the inner writer.
    pub fn count_writes<C: ByteCount + 'static>(mut self, counter: C) -> Self {
        self.written = Some(chain(self.written.take(), Arc::new(counter)));
        self
    }

    /// Counts every byte delivered by the inner reader.
    pub fn count_reads<C: ByteCount + 'static>(mut self, counter: C) -> Self {
        self.read = Some(chain(self.read.take(), Arc::new(counter)));
        self
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }
}

impl CountingStream<TcpStream> {
    /// Splits into owned halves; each half keeps the counter for its direction.
    pub fn into_split(self) -> (CountingStream<OwnedReadHalf>, CountingStream<OwnedWriteHalf>) {
        let (read_half, write_half) = self.inner.into_split();
        let reader = CountingStream {
            inner: read_half,
            written: None,
            read: self.read,
        };
        let writer = CountingStream {
            inner: write_half,
            written: self.written,
            read: None,
        };
        (reader, writer)
    }
}

fn chain(existing: Option<Arc<dyn ByteCount>>, next: Arc<dyn ByteCount>) -> Arc<dyn ByteCount> {
    match existing {
        Some(first) => Arc::new((first, next)),
        None => next,
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for CountingStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let result = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            let n = buf.filled().len() - before;
            if n > 0
                && let Some(counter) = &self.read
            {
                counter.count(n as u64);
            }
        }
        result
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for CountingStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let result = Pin::new(&mut self.inner).poll_write(cx, data);
        // Only bytes the inner writer accepted; a Pending write is retried with
        // the same buffer and must not be counted twice.
        if let Poll::Ready(Ok(n)) = &result
            && *n > 0
            && let Some(counter) = &self.written
        {
            counter.count(*n as u64);
        }
        result
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

    #[tokio::test]
    async fn test_counts_writes_without_altering_data() {
        let (a, mut b) = duplex(64);
        let written = Arc::new(AtomicU64::new(0));
        let mut stream = CountingStream::new(a).count_writes(written.clone());

        stream.write_all(b"hello ").await.unwrap();
        stream.write_all("wörld".as_bytes()).await.unwrap();
        stream.flush().await.unwrap();
        assert_eq!(written.load(Ordering::Relaxed), 12);

        let mut received = vec![0u8; 12];
        b.read_exact(&mut received).await.unwrap();
        assert_eq!(&received, "hello wörld".as_bytes());
    }

    #[tokio::test]
    async fn test_counts_reads() {
        let (a, mut b) = duplex(64);
        let read = Arc::new(AtomicU64::new(0));
        let mut stream = CountingStream::new(a).count_reads(read.clone());

        b.write_all(b"0123456789").await.unwrap();
        drop(b);

        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"0123456789");
        assert_eq!(read.load(Ordering::Relaxed), 10);
    }

    #[tokio::test]
    async fn test_backpressure_does_not_double_count() {
        // A 4-byte pipe forces partial writes and Pending polls.
        let (a, mut b) = duplex(4);
        let written = Arc::new(AtomicU64::new(0));
        let mut stream = CountingStream::new(a).count_writes(written.clone());

        let payload = vec![7u8; 1000];
        let reader = tokio::spawn(async move {
            let mut out = vec![0u8; 1000];
            b.read_exact(&mut out).await.unwrap();
            out
        });
        stream.write_all(&payload).await.unwrap();

        assert_eq!(reader.await.unwrap(), payload);
        assert_eq!(written.load(Ordering::Relaxed), 1000);
    }

    #[tokio::test]
    async fn test_multiple_counters_fan_out() {
        let (a, _b) = duplex(64);
        let first = Arc::new(AtomicU64::new(0));
        let second = Arc::new(AtomicU64::new(0));
        let seen = Arc::new(AtomicU64::new(0));
        let seen_in_closure = seen.clone();
        let mut stream = CountingStream::new(a)
            .count_writes(first.clone())
            .count_writes(second.clone())
            .count_writes(CountFn(move |n| {
                seen_in_closure.fetch_add(n, Ordering::Relaxed);
            }));

        stream.write_all(b"abc").await.unwrap();
        assert_eq!(first.load(Ordering::Relaxed), 3);
        assert_eq!(second.load(Ordering::Relaxed), 3);
        assert_eq!(seen.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn test_prometheus_counter_sink() {
        let counter = IntCounter::new("test_bytes", "bytes").unwrap();
        let (a, _b) = duplex(64);
        let mut stream = CountingStream::new(a).count_writes(counter.clone());
        stream.write_all(b"12345").await.unwrap();
        assert_eq!(counter.get(), 5);
    }

    #[tokio::test]
    async fn test_split_halves_keep_their_counters() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let (accepted, connected) = tokio::join!(listener.accept(), connect);
        let (mut remote, _) = accepted.unwrap();

        let written = Arc::new(AtomicU64::new(0));
        let read = Arc::new(AtomicU64::new(0));
        let stream = CountingStream::new(connected.unwrap())
            .count_writes(written.clone())
            .count_reads(read.clone());
        let (mut reader, mut writer) = stream.into_split();

        writer.write_all(b"up").await.unwrap();
        remote.write_all(b"down").await.unwrap();
        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf).await.unwrap();

        assert_eq!(written.load(Ordering::Relaxed), 2);
        assert_eq!(read.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn test_byte_len_is_encoded_length() {
        assert_eq!(byte_len("abc"), 3);
        assert_eq!(byte_len("héllo"), 6);
        assert_eq!(byte_len("日本"), 6);
    }
}
