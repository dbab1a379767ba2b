use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use crate::pipe::pipe::PipeEnd;
use crate::util::auto_reset_event::WaitOutcome;

type ReadinessWait = Pin<Box<dyn Future<Output = WaitOutcome> + Send>>;

/// Presents the stream buffers of a [PipeEnd] as a tokio byte stream, so that code written
///  against `AsyncRead` / `AsyncWrite` (e.g. a TLS handshake) can run on top of a pipe.
///
/// A disconnected pipe reads as EOF, and writing to it fails with `BrokenPipe` (or the pipe's
///  first recorded error).
pub struct PipeByteStream {
    end: PipeEnd,
    read_wait: Option<ReadinessWait>,
    write_wait: Option<ReadinessWait>,
}

impl PipeByteStream {
    pub fn new(end: PipeEnd) -> PipeByteStream {
        PipeByteStream {
            end,
            read_wait: None,
            write_wait: None,
        }
    }

    pub fn end(&self) -> &PipeEnd {
        &self.end
    }
}

impl AsyncRead for PipeByteStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if buf.remaining() == 0 {
                return Poll::Ready(Ok(()));
            }

            let reader = this.end.reader_stream();
            let disconnected = reader.is_disconnected();
            let (chunks, len) = reader.dequeue(buf.remaining(), true)?;
            if len > 0 {
                for chunk in chunks {
                    buf.put_slice(&chunk);
                }
                this.read_wait = None;
                return Poll::Ready(Ok(()));
            }
            if disconnected {
                return Poll::Ready(Ok(()));
            }

            let end = this.end.clone();
            let wait = this.read_wait.get_or_insert_with(|| Box::pin(async move {
                let polling_timeout = end.pipe().config().polling_timeout;
                end.reader_stream().wait_read_ready(polling_timeout, None).await
            }));
            match wait.as_mut().poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(_) => this.read_wait = None,
            }
        }
    }
}

impl AsyncWrite for PipeByteStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        loop {
            let writer = this.end.writer_stream();
            writer.check_disconnected()?;
            if writer.is_ready_to_write() {
                writer.enqueue(Bytes::copy_from_slice(buf))?;
                this.write_wait = None;
                return Poll::Ready(Ok(buf.len()));
            }

            let end = this.end.clone();
            let wait = this.write_wait.get_or_insert_with(|| Box::pin(async move {
                let polling_timeout = end.pipe().config().polling_timeout;
                end.writer_stream().wait_write_ready(polling_timeout, None).await
            }));
            match wait.as_mut().poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(_) => this.write_wait = None,
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.end.writer_stream().complete_write();
        Poll::Ready(Ok(()))
    }

    /// The pipe has no half-close: shutting down only flushes, and the connection ends when the
    ///  pipe is disconnected
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.poll_flush(cx)
    }
}
