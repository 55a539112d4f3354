//! Byte-counting stream wrappers that report transfer progress to the host.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::host::Host;

pub struct ProgressReader<R> {
    inner: R,
    host: Arc<dyn Host>,
    transferred: u64,
}

impl<R> ProgressReader<R> {
    pub fn new(inner: R, host: Arc<dyn Host>) -> Self {
        Self { inner, host, transferred: 0 }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ProgressReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let before = buf.filled().len();
        let polled = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = polled {
            let n = buf.filled().len() - before;
            if n > 0 {
                this.transferred += n as u64;
                this.host.progress(this.transferred);
            }
        }
        polled
    }
}

pub struct ProgressWriter<W> {
    inner: W,
    host: Arc<dyn Host>,
    transferred: u64,
}

impl<W> ProgressWriter<W> {
    pub fn new(inner: W, host: Arc<dyn Host>) -> Self {
        Self { inner, host, transferred: 0 }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for ProgressWriter<W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        let polled = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = polled {
            if n > 0 {
                this.transferred += n as u64;
                this.host.progress(this.transferred);
            }
        }
        polled
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
