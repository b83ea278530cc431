use crate::bandwidth::TokenBucket;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{Sleep, sleep};

/// Byte stream whose reads and writes are paced by a shared [`TokenBucket`].
///
/// Each operation is granted at most one second worth of tokens up front and waits out any debt
/// before touching the inner stream. Writes never pass more than the grant to the inner stream;
/// once the I/O completes the grant is settled against the bytes actually moved.
pub struct RateLimitedStream<S> {
    inner: S,
    bucket: Option<TokenBucket>,
    read: Pacing,
    write: Pacing,
}

#[derive(Default)]
struct Pacing {
    delay: Option<Pin<Box<Sleep>>>,
    granted: Option<usize>,
}

impl Pacing {
    /// Resolves to the number of bytes the pending operation may move.
    fn poll_grant(
        &mut self,
        bucket: Option<&TokenBucket>,
        cx: &mut Context<'_>,
        wanted: usize,
    ) -> Poll<usize> {
        let granted = match self.granted {
            Some(granted) => granted,
            None => {
                let granted = match bucket {
                    Some(bucket) => {
                        let rate = usize::try_from(bucket.rate()).unwrap_or(usize::MAX);
                        let granted = if rate == 0 { wanted } else { wanted.min(rate) };
                        let wait = bucket.take(granted as u64);
                        if !wait.is_zero() {
                            self.delay = Some(Box::pin(sleep(wait)));
                        }
                        granted
                    }
                    None => wanted,
                };
                self.granted = Some(granted);
                granted
            }
        };
        if let Some(delay) = self.delay.as_mut() {
            ready!(delay.as_mut().poll(cx));
            self.delay = None;
        }
        Poll::Ready(granted)
    }

    /// Square the grant with the bytes the inner stream actually moved.
    fn settle(&mut self, bucket: Option<&TokenBucket>, moved: usize) {
        let Some(granted) = self.granted.take() else {
            return;
        };
        let Some(bucket) = bucket else {
            return;
        };
        if moved < granted {
            bucket.refund((granted - moved) as u64);
        } else if moved > granted {
            // paid by the next operation's wait
            bucket.take((moved - granted) as u64);
        }
    }
}

impl<S> RateLimitedStream<S> {
    pub fn new(inner: S, bucket: Option<TokenBucket>) -> Self {
        Self {
            inner,
            bucket,
            read: Pacing::default(),
            write: Pacing::default(),
        }
    }

    pub fn bucket(&self) -> Option<&TokenBucket> {
        self.bucket.as_ref()
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for RateLimitedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(
            this.read
                .poll_grant(this.bucket.as_ref(), cx, buf.remaining())
        );
        let before = buf.filled().len();
        let result = ready!(Pin::new(&mut this.inner).poll_read(cx, buf));
        let moved = match &result {
            Ok(()) => buf.filled().len() - before,
            Err(_) => 0,
        };
        this.read.settle(this.bucket.as_ref(), moved);
        Poll::Ready(result)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for RateLimitedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let granted = ready!(this.write.poll_grant(this.bucket.as_ref(), cx, buf.len()));
        let chunk = &buf[..granted.min(buf.len())];
        let result = ready!(Pin::new(&mut this.inner).poll_write(cx, chunk));
        let moved = result.as_ref().map_or(0, |n| *n);
        this.write.settle(this.bucket.as_ref(), moved);
        Poll::Ready(result)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
