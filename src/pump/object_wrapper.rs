use std::future::Future;
use std::sync::Arc;
use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use tracing::{debug, trace};
use crate::buffer::Datagram;
use crate::config::WireConfig;
use crate::error::{WireError, WireResult};
use crate::pipe::PipeEnd;
use crate::pump::bulk_receiver::BulkReceiver;
use crate::util::auto_reset_event::WaitOutcome;
use crate::util::cancel::CancelToken;
use crate::util::latch::Latch;
use crate::util::once_flag::OnceFlag;

/// The primitives an external object (socket, byte stream, ...) offers to the pump loops. This
///  is all a concrete wrapper implements; the loops themselves are shared.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WrappedObject: Send + Sync + 'static {
    fn supports_stream(&self) -> bool;
    fn supports_datagram(&self) -> bool;

    async fn stream_write_to_object(&self, chunks: Vec<Bytes>) -> anyhow::Result<()>;
    /// Up to `max_len` bytes. `None` or an empty chunk means the object was closed.
    async fn stream_read_from_object(&self, max_len: usize) -> anyhow::Result<Option<Bytes>>;

    async fn datagram_write_to_object(&self, datagrams: Vec<Datagram>) -> anyhow::Result<()>;
    /// The next datagram, `None` if the object was closed
    async fn datagram_read_from_object(&self) -> anyhow::Result<Option<Datagram>>;

    /// Release the object's resources. Called exactly once, after all loops terminated.
    async fn close(&self);
}

/// Pumps data between a [PipeEnd] and an external object, with one loop per direction for
///  streams and datagrams each (as far as the object supports them).
///
/// The loops end when the wrapper is disconnected, when the pipe disconnects, or when the object
///  reports that it was closed. Whichever loop ends first disconnects the pipe end, which in
///  turn ends the other loops. An error in any loop is recorded in the pipe's exception queue.
pub struct ObjectWrapper<O: WrappedObject> {
    inner: Arc<WrapperInner<O>>,
}

impl<O: WrappedObject> Clone for ObjectWrapper<O> {
    fn clone(&self) -> Self {
        ObjectWrapper {
            inner: self.inner.clone(),
        }
    }
}

struct WrapperInner<O: WrappedObject> {
    object: O,
    end: PipeEnd,
    config: WireConfig,
    cancel: CancelToken,
    started: OnceFlag,
    disposed: OnceFlag,
    finished: Latch,
    stream_receiver: BulkReceiver<Bytes>,
    datagram_receiver: BulkReceiver<Datagram>,
}

impl<O: WrappedObject> ObjectWrapper<O> {
    pub fn new(object: O, end: PipeEnd) -> ObjectWrapper<O> {
        let config = end.pipe().config().clone();
        ObjectWrapper {
            inner: Arc::new(WrapperInner {
                object,
                end,
                config,
                cancel: CancelToken::new(),
                started: OnceFlag::new(),
                disposed: OnceFlag::new(),
                finished: Latch::new(),
                stream_receiver: BulkReceiver::new(),
                datagram_receiver: BulkReceiver::new(),
            }),
        }
    }

    pub fn object(&self) -> &O {
        &self.inner.object
    }

    pub fn end(&self) -> &PipeEnd {
        &self.inner.end
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.inner.cancel
    }

    /// Spawn the pump loops. Only the first call has an effect, returning `true`.
    pub fn start(&self) -> bool {
        if !self.inner.started.set() {
            return false;
        }
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.run().await });
        true
    }

    /// Stop the loops and disconnect the pipe end, recording `error` as the cause
    pub fn disconnect(&self, error: Option<WireError>) {
        self.inner.disconnect(error);
    }

    /// Disconnect, and wait until the object is closed
    pub async fn close(&self) {
        self.disconnect(None);
        if self.inner.started.is_set() {
            self.inner.finished.wait().await;
        }
        else {
            self.inner.dispose().await;
        }
    }

    pub fn is_finished(&self) -> bool {
        self.inner.finished.is_open()
    }

    /// Resolves after all loops terminated and the object was closed
    pub async fn wait_finished(&self) {
        self.inner.finished.wait().await
    }
}

impl<O: WrappedObject> WrapperInner<O> {
    async fn run(&self) {
        let pipe_id = self.end.pipe().id();
        let stream = self.object.supports_stream();
        let datagram = self.object.supports_datagram();
        debug!(%pipe_id, side = ?self.end.side(), stream, datagram, "starting pump loops");

        tokio::join!(
            self.run_loop("stream pipe->object", stream, self.stream_pipe_to_object()),
            self.run_loop("stream object->pipe", stream, self.stream_object_to_pipe()),
            self.run_loop("datagram pipe->object", datagram, self.datagram_pipe_to_object()),
            self.run_loop("datagram object->pipe", datagram, self.datagram_object_to_pipe()),
        );

        self.dispose().await;
        self.finished.open();
        debug!(%pipe_id, "pump loops finished");
    }

    async fn run_loop(&self, name: &'static str, enabled: bool, pump: impl Future<Output = WireResult<()>>) {
        if !enabled {
            return;
        }
        if let Err(e) = pump.await {
            debug!(pipe_id = %self.end.pipe().id(), pump = name, error = ?e, "pump loop failed");
            self.disconnect(Some(e));
        }
        trace!(pipe_id = %self.end.pipe().id(), pump = name, "pump loop ended");
        self.end.disconnect(None);
    }

    fn disconnect(&self, error: Option<WireError>) {
        self.cancel.cancel();
        self.end.disconnect(error);
    }

    async fn dispose(&self) {
        if self.disposed.set() {
            trace!(pipe_id = %self.end.pipe().id(), "closing wrapped object");
            self.object.close().await;
        }
    }

    /// `None` if the wrapper was canceled before `f` completed, or if `f` is still pending
    ///  `polling_timeout` after the pipe disconnected. Writes that complete within that grace
    ///  period keep draining the buffer.
    async fn until_drain_expires<R>(&self, f: impl Future<Output = R>) -> Option<R> {
        let expired = async {
            self.end.pipe().wait_disconnected().await;
            tokio::time::sleep(self.config.polling_timeout).await;
        };
        tokio::select! {
            r = f => Some(r),
            _ = self.cancel.canceled() => None,
            _ = expired => {
                debug!(pipe_id = %self.end.pipe().id(), "object write still pending after disconnect - abandoning it");
                None
            }
        }
    }

    /// `None` if the wrapper was canceled or the pipe disconnected before `f` completed
    async fn until_disconnected<R>(&self, f: impl Future<Output = R>) -> Option<R> {
        tokio::select! {
            r = f => Some(r),
            _ = self.cancel.canceled() => None,
            _ = self.end.pipe().wait_disconnected() => None,
        }
    }

    async fn stream_pipe_to_object(&self) -> WireResult<()> {
        let reader = self.end.reader_stream();
        loop {
            // buffered data is still delivered after a disconnect
            let disconnected = reader.is_disconnected();
            let (chunks, len) = reader.dequeue_limited(usize::MAX, false, self.config.max_segments_per_write)?;
            if len > 0 {
                trace!(len, "stream pipe -> object");
                match self.until_drain_expires(self.object.stream_write_to_object(chunks)).await {
                    Some(result) => result.map_err(WireError::transport)?,
                    None => return Ok(()),
                }
                continue;
            }
            if disconnected || self.cancel.is_canceled() {
                return Ok(());
            }
            if reader.wait_read_ready(self.config.polling_timeout, Some(&self.cancel)).await == WaitOutcome::Canceled {
                return Ok(());
            }
        }
    }

    async fn stream_object_to_pipe(&self) -> WireResult<()> {
        let writer = self.end.writer_stream();
        let chunk_size = self.config.receive_chunk_size;
        loop {
            if writer.is_disconnected() || self.cancel.is_canceled() {
                return Ok(());
            }
            if !writer.is_ready_to_write() {
                if writer.wait_write_ready(self.config.polling_timeout, Some(&self.cancel)).await == WaitOutcome::Canceled {
                    return Ok(());
                }
                continue;
            }

            let read = self.stream_receiver.receive(|| async {
                self.object.stream_read_from_object(chunk_size).await.map_err(WireError::transport)
            });
            let Some(received) = self.until_disconnected(read).await else {
                return Ok(());
            };
            let Some(data) = received?.filter(|data| !data.is_empty()) else {
                debug!(pipe_id = %self.end.pipe().id(), "object closed its stream");
                return Ok(());
            };

            let pin_tail = writer.pin_tail();
            if let Err(e) = writer.enqueue(data) {
                return if writer.is_disconnected() { Ok(()) } else { Err(e) };
            }
            if writer.pin_tail() == pin_tail {
                tokio::task::yield_now().await;
            }
            else {
                trace!(len = writer.pin_tail() - pin_tail, "stream object -> pipe");
            }
        }
    }

    async fn datagram_pipe_to_object(&self) -> WireResult<()> {
        let reader = self.end.reader_datagram();
        loop {
            let disconnected = reader.is_disconnected();
            let (datagrams, count) = reader.dequeue_limited(usize::MAX, false, self.config.max_segments_per_write)?;
            if count > 0 {
                trace!(count, "datagrams pipe -> object");
                match self.until_drain_expires(self.object.datagram_write_to_object(datagrams)).await {
                    Some(result) => result.map_err(WireError::transport)?,
                    None => return Ok(()),
                }
                continue;
            }
            if disconnected || self.cancel.is_canceled() {
                return Ok(());
            }
            if reader.wait_read_ready(self.config.polling_timeout, Some(&self.cancel)).await == WaitOutcome::Canceled {
                return Ok(());
            }
        }
    }

    async fn datagram_object_to_pipe(&self) -> WireResult<()> {
        let writer = self.end.writer_datagram();
        loop {
            if writer.is_disconnected() || self.cancel.is_canceled() {
                return Ok(());
            }
            if !writer.is_ready_to_write() {
                if writer.wait_write_ready(self.config.polling_timeout, Some(&self.cancel)).await == WaitOutcome::Canceled {
                    return Ok(());
                }
                continue;
            }

            let read = self.datagram_receiver.receive(|| async {
                self.object.datagram_read_from_object().await.map_err(WireError::transport)
            });
            let Some(received) = self.until_disconnected(read).await else {
                return Ok(());
            };
            let Some(datagram) = received? else {
                debug!(pipe_id = %self.end.pipe().id(), "object closed its datagram channel");
                return Ok(());
            };

            if let Err(e) = writer.enqueue(datagram) {
                return if writer.is_disconnected() { Ok(()) } else { Err(e) };
            }
        }
    }
}
