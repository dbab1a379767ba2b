use std::sync::Arc;
use std::time::Duration;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::time::Instant;
use crate::buffer::{Datagram, Fifo, Segment};
use crate::error::{WireError, WireResult};
use crate::pipe::pipe::PipeEnd;
use crate::util::auto_reset_event::WaitOutcome;
use crate::util::cancel::CancelToken;

#[derive(Debug, Default, Clone, Copy)]
struct StreamTimeouts {
    read: Option<Duration>,
    write: Option<Duration>,
}

/// Read / write access to an attached [PipeEnd].
///
/// The `fast_*` operations move `Bytes` / `Datagram` handles without copying. All receive
///  operations treat a disconnect as end of stream and return an empty result, while send
///  operations fail on a disconnected pipe.
#[derive(Clone)]
pub struct PipeEndStream {
    end: PipeEnd,
    auto_flush: bool,
    cancel: CancelToken,
    timeouts: Arc<Mutex<StreamTimeouts>>,
}

impl PipeEndStream {
    pub(crate) fn new(end: PipeEnd, auto_flush: bool, cancel: CancelToken) -> PipeEndStream {
        PipeEndStream {
            end,
            auto_flush,
            cancel,
            timeouts: Default::default(),
        }
    }

    pub fn end(&self) -> &PipeEnd {
        &self.end
    }

    pub fn auto_flush(&self) -> bool {
        self.auto_flush
    }

    /// `None` (the default) means receive operations wait indefinitely
    pub fn set_read_timeout(&self, timeout: Option<Duration>) {
        self.timeouts.lock().read = timeout;
    }

    pub fn set_write_timeout(&self, timeout: Option<Duration>) {
        self.timeouts.lock().write = timeout;
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.timeouts.lock().read
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        self.timeouts.lock().write
    }

    pub fn is_disconnected(&self) -> bool {
        self.end.is_disconnected()
    }

    pub fn check_disconnected(&self) -> WireResult<()> {
        self.end.check_disconnected()
    }

    /// Wake the peer's readers for everything written so far
    pub fn flush(&self) {
        self.end.writer_stream().complete_write();
        self.end.writer_datagram().complete_write();
    }

    /// Append chunks to the outgoing stream without waiting for room. Without auto flush, the
    ///  peer's waiting readers are woken by the next [Self::flush] (or their polling timeout).
    pub fn fast_send(&self, chunks: Vec<Bytes>) -> WireResult<()> {
        if self.auto_flush {
            self.end.writer_stream().enqueue_all(chunks)
        }
        else {
            self.end.writer_stream().enqueue_all_unflushed(chunks)
        }
    }

    pub async fn send(&self, data: &[u8]) -> WireResult<()> {
        self.send_bytes(Bytes::copy_from_slice(data)).await
    }

    /// Wait until the outgoing stream is below its threshold (bounded by the write timeout),
    ///  then append `data`
    pub async fn send_bytes(&self, data: Bytes) -> WireResult<()> {
        self.wait_writable(self.end.writer_stream()).await?;
        self.fast_send(vec![data])
    }

    pub fn fast_send_datagrams(&self, datagrams: Vec<Datagram>) -> WireResult<()> {
        if self.auto_flush {
            self.end.writer_datagram().enqueue_all(datagrams)
        }
        else {
            self.end.writer_datagram().enqueue_all_unflushed(datagrams)
        }
    }

    pub async fn send_datagram(&self, datagram: Datagram) -> WireResult<()> {
        self.wait_writable(self.end.writer_datagram()).await?;
        self.fast_send_datagrams(vec![datagram])
    }

    /// Up to `max_len` bytes as they are chunked in the buffer. Empty at end of stream.
    pub async fn fast_receive(&self, max_len: usize) -> WireResult<Vec<Bytes>> {
        if max_len == 0 {
            return Err(WireError::InvalidArgument("receive size must be at least 1"));
        }

        let chunks = self.receive_with(self.end.reader_stream(), |buf| {
            let (chunks, len) = buf.dequeue(max_len, true)?;
            Ok((len > 0).then_some(chunks))
        }).await?;
        Ok(chunks.unwrap_or_default())
    }

    /// Up to `max_len` bytes as a single chunk. Empty at end of stream.
    pub async fn receive(&self, max_len: usize) -> WireResult<Bytes> {
        Ok(concat(self.fast_receive(max_len).await?))
    }

    /// Exactly `len` bytes. Empty if the stream ended before anything arrived, and the
    ///  disconnect error if it ended part way through.
    pub async fn receive_exact(&self, len: usize) -> WireResult<Bytes> {
        let mut collected = Vec::new();
        let mut missing = len;
        while missing > 0 {
            let chunks = self.fast_receive(missing).await?;
            if chunks.is_empty() {
                if collected.is_empty() {
                    return Ok(Bytes::new());
                }
                return Err(self.end.exceptions().disconnect_error());
            }
            missing -= chunks.iter().map(|c| c.len()).sum::<usize>();
            collected.extend(chunks);
        }
        Ok(concat(collected))
    }

    /// Up to `max_len` bytes from the head of the incoming stream, without consuming them
    pub async fn peek(&self, max_len: usize) -> WireResult<Bytes> {
        let data = self.receive_with(self.end.reader_stream(), |buf| {
            let data = buf.peek(max_len);
            Ok((!data.is_empty()).then_some(data))
        }).await?;
        Ok(data.unwrap_or_default())
    }

    /// The next datagram, `None` at end of stream
    pub async fn receive_datagram(&self) -> WireResult<Option<Datagram>> {
        self.receive_with(self.end.reader_datagram(), |buf| {
            let (mut datagrams, _) = buf.dequeue(1, false)?;
            Ok(datagrams.pop())
        }).await
    }

    pub async fn fast_receive_datagrams(&self, max_count: usize) -> WireResult<Vec<Datagram>> {
        if max_count == 0 {
            return Err(WireError::InvalidArgument("receive count must be at least 1"));
        }

        let datagrams = self.receive_with(self.end.reader_datagram(), |buf| {
            let (datagrams, count) = buf.dequeue(max_count, false)?;
            Ok((count > 0).then_some(datagrams))
        }).await?;
        Ok(datagrams.unwrap_or_default())
    }

    /// Retry `attempt` until it produces something, the buffer disconnects, the attachment is
    ///  released, or the read timeout expires. `Ok(None)` means end of stream.
    async fn receive_with<T: Segment, R>(&self, buffer: &Fifo<T>, mut attempt: impl FnMut(&Fifo<T>) -> WireResult<Option<R>>) -> WireResult<Option<R>> {
        let deadline = self.read_timeout().map(|t| (Instant::now() + t, t));
        let polling_timeout = self.end.pipe().config().polling_timeout;

        loop {
            // checked before the attempt: data enqueued before the disconnect must still be seen
            let disconnected = buffer.is_disconnected();
            if let Some(result) = attempt(buffer)? {
                return Ok(Some(result));
            }
            if disconnected || self.cancel.is_canceled() {
                return Ok(None);
            }

            if buffer.is_ready_to_read() {
                // readiness was signaled, but a concurrent reader got the data first
                tokio::task::yield_now().await;
                continue;
            }

            let wait = match deadline {
                Some((deadline, _)) => polling_timeout.min(deadline.saturating_duration_since(Instant::now())),
                None => polling_timeout,
            };
            match buffer.wait_read_ready(wait, Some(&self.cancel)).await {
                WaitOutcome::Canceled => return Ok(None),
                WaitOutcome::Signaled => {}
                WaitOutcome::TimedOut => {
                    if let Some((deadline, timeout)) = deadline {
                        if Instant::now() >= deadline {
                            return Err(WireError::Timeout(timeout));
                        }
                    }
                }
            }
        }
    }

    async fn wait_writable<T: Segment>(&self, buffer: &Fifo<T>) -> WireResult<()> {
        let deadline = self.write_timeout().map(|t| (Instant::now() + t, t));
        let polling_timeout = self.end.pipe().config().polling_timeout;

        loop {
            buffer.check_disconnected()?;
            if buffer.is_ready_to_write() {
                return Ok(());
            }

            let wait = match deadline {
                Some((deadline, _)) => polling_timeout.min(deadline.saturating_duration_since(Instant::now())),
                None => polling_timeout,
            };
            match buffer.wait_write_ready(wait, Some(&self.cancel)).await {
                WaitOutcome::Canceled => return Err(WireError::NotAttached),
                WaitOutcome::Signaled => {}
                WaitOutcome::TimedOut => {
                    if let Some((deadline, timeout)) = deadline {
                        if Instant::now() >= deadline {
                            return Err(WireError::Timeout(timeout));
                        }
                    }
                }
            }
        }
    }
}

fn concat(mut chunks: Vec<Bytes>) -> Bytes {
    match chunks.len() {
        0 => Bytes::new(),
        1 => chunks.pop().unwrap_or_default(),
        _ => {
            let mut result = BytesMut::with_capacity(chunks.iter().map(|c| c.len()).sum());
            for c in chunks {
                result.extend_from_slice(&c);
            }
            result.freeze()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use tokio::runtime::Builder;
    use crate::config::WireConfig;
    use crate::pipe::pipe::Pipe;
    use super::*;

    fn paused_rt() -> tokio::runtime::Runtime {
        Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_hello_end_to_end() {
        let pipe = Pipe::new(WireConfig::default());
        let a = pipe.end_a().attach().unwrap();
        let b = pipe.end_b().attach().unwrap();
        let a_stream = a.stream(false).unwrap();
        let b_stream = b.stream(false).unwrap();

        a_stream.send(b"hello").await.unwrap();
        a_stream.flush();
        assert_eq!(b_stream.receive(5).await.unwrap().as_ref(), b"hello");

        a.end().disconnect(None);
        assert!(b_stream.receive(5).await.unwrap().is_empty());
        assert!(matches!(b.end().check_disconnected(), Err(WireError::Disconnected)));
        assert!(matches!(a_stream.send(b"more").await, Err(WireError::Disconnected)));
    }

    #[test]
    fn test_without_auto_flush_readers_wait_for_flush() {
        paused_rt().block_on(async {
            let pipe = Pipe::new(WireConfig::default());
            let a = pipe.end_a().attach().unwrap();
            let b = pipe.end_b().attach().unwrap();
            let b_stream = b.stream(true).unwrap();
            let reader = tokio::spawn(async move { b_stream.receive(10).await });
            tokio::time::sleep(Duration::from_millis(10)).await;

            let a_stream = a.stream(false).unwrap();
            a_stream.fast_send(vec![Bytes::from_static(b"held")]).unwrap();
            tokio::time::sleep(Duration::from_millis(500)).await;
            assert!(!reader.is_finished());

            a_stream.flush();
            assert_eq!(reader.await.unwrap().unwrap().as_ref(), b"held");
        });
    }

    #[tokio::test]
    async fn test_receive_waits_for_data() {
        let pipe = Pipe::new(WireConfig::default());
        let a = pipe.end_a().attach().unwrap();
        let b = pipe.end_b().attach().unwrap();
        let b_stream = b.stream(true).unwrap();

        let reader = tokio::spawn(async move { b_stream.receive_exact(8).await });

        let a_stream = a.stream(true).unwrap();
        a_stream.fast_send(vec![Bytes::from_static(b"abc")]).unwrap();
        tokio::task::yield_now().await;
        a_stream.fast_send(vec![Bytes::from_static(b"defgh"), Bytes::from_static(b"ij")]).unwrap();

        assert_eq!(reader.await.unwrap().unwrap().as_ref(), b"abcdefgh");
        assert_eq!(b.stream(true).unwrap().receive(100).await.unwrap().as_ref(), b"ij");
    }

    #[tokio::test]
    async fn test_buffered_data_survives_disconnect() {
        let pipe = Pipe::new(WireConfig::default());
        let a = pipe.end_a().attach().unwrap();
        let b = pipe.end_b().attach().unwrap();

        a.stream(true).unwrap().fast_send(vec![Bytes::from_static(b"last words")]).unwrap();
        pipe.disconnect(None);

        let b_stream = b.stream(true).unwrap();
        assert_eq!(b_stream.peek(4).await.unwrap().as_ref(), b"last");
        assert_eq!(b_stream.receive(100).await.unwrap().as_ref(), b"last words");
        assert!(b_stream.receive(100).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_receive_exact_fails_on_partial_data() {
        let pipe = Pipe::new(WireConfig::default());
        let a = pipe.end_a().attach().unwrap();
        let b = pipe.end_b().attach().unwrap();

        a.stream(true).unwrap().fast_send(vec![Bytes::from_static(b"abc")]).unwrap();
        pipe.disconnect(None);
        assert!(matches!(b.stream(true).unwrap().receive_exact(5).await, Err(WireError::Disconnected)));
    }

    #[tokio::test]
    async fn test_datagrams() {
        let pipe = Pipe::new(WireConfig::default());
        let a = pipe.end_a().attach().unwrap();
        let b = pipe.end_b().attach().unwrap();
        let addr: SocketAddr = "127.0.0.1:9999".parse().unwrap();

        let a_stream = a.stream(true).unwrap();
        a_stream.send_datagram(Datagram::new(&b"one"[..], Some(addr))).await.unwrap();
        a_stream.fast_send_datagrams(vec![Datagram::new(&b"two"[..], None), Datagram::new(&b"three"[..], None)]).unwrap();

        let b_stream = b.stream(true).unwrap();
        let first = b_stream.receive_datagram().await.unwrap().unwrap();
        assert_eq!(first.data.as_ref(), b"one");
        assert_eq!(first.endpoint, Some(addr));
        assert_eq!(b_stream.fast_receive_datagrams(10).await.unwrap().len(), 2);

        // stream data is independent
        assert!(b.end().reader_stream().is_empty());

        pipe.disconnect(None);
        assert!(b_stream.receive_datagram().await.unwrap().is_none());
    }

    #[test]
    fn test_read_timeout() {
        paused_rt().block_on(async {
            let pipe = Pipe::new(WireConfig::default());
            let b = pipe.end_b().attach().unwrap();
            let b_stream = b.stream(true).unwrap();
            b_stream.set_read_timeout(Some(Duration::from_millis(2500)));

            let start = Instant::now();
            assert!(matches!(b_stream.receive(10).await, Err(WireError::Timeout(_))));
            assert!(start.elapsed() >= Duration::from_millis(2500));
            // a read timeout concerns this call only
            assert!(!pipe.is_disconnected());
        });
    }

    #[test]
    fn test_write_timeout() {
        paused_rt().block_on(async {
            let config = WireConfig {
                stream_threshold: 2,
                ..WireConfig::default()
            };
            let pipe = Pipe::new(config);
            let a = pipe.end_a().attach().unwrap();
            let a_stream = a.stream(true).unwrap();
            a_stream.set_write_timeout(Some(Duration::from_millis(300)));

            a_stream.send(b"abc").await.unwrap();
            assert!(matches!(a_stream.send(b"d").await, Err(WireError::Timeout(_))));

            pipe.end_b().reader_stream().dequeue_all();
            a_stream.send(b"d").await.unwrap();
        });
    }

    #[tokio::test]
    async fn test_releasing_attachment_ends_pending_receive() {
        let pipe = Pipe::new(WireConfig::default());
        let b = pipe.end_b().attach().unwrap();
        let b_stream = b.stream(true).unwrap();
        let reader = tokio::spawn(async move { b_stream.receive(10).await });

        tokio::task::yield_now().await;
        drop(b);
        let result = tokio::time::timeout(Duration::from_secs(1), reader).await.unwrap().unwrap();
        assert!(result.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stream_is_cached_per_attachment() {
        let pipe = Pipe::new(WireConfig::default());
        let b = pipe.end_b().attach().unwrap();
        let first = b.stream(false).unwrap();
        first.set_read_timeout(Some(Duration::from_secs(3)));

        let second = b.stream(true).unwrap();
        assert!(!second.auto_flush());
        assert_eq!(second.read_timeout(), Some(Duration::from_secs(3)));

        drop(b);
        let b = pipe.end_b().attach().unwrap();
        assert!(b.stream(true).unwrap().auto_flush());
    }
}
