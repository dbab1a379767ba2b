use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Weak};
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;
use crate::buffer::fifo::run_callback;
use crate::buffer::{DatagramBuffer, ExceptionQueue, Fifo, Segment, StreamBuffer};
use crate::config::WireConfig;
use crate::error::{WireError, WireResult};
use crate::layer_info::LayerInfoHierarchy;
use crate::pipe::attach::AttachHandle;
use crate::pipe::stream::PipeEndStream;
use crate::util::cancel::CancelToken;
use crate::util::latch::Latch;
use crate::util::once_flag::OnceFlag;

/// The two ends of a pipe. By convention, `A` is the lower end (facing the transport) and `B`
///  is the upper end (facing the application or the next layer up).
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum PipeSide {
    A,
    B,
}

impl PipeSide {
    pub fn other(self) -> PipeSide {
        match self {
            PipeSide::A => PipeSide::B,
            PipeSide::B => PipeSide::A,
        }
    }

    fn idx(self) -> usize {
        match self {
            PipeSide::A => 0,
            PipeSide::B => 1,
        }
    }
}

/// The live attachment of a pipe end
pub(crate) struct Attachment {
    pub(crate) cancel: CancelToken,
    pub(crate) stream: Option<PipeEndStream>,
}

struct PipeInner {
    id: Uuid,
    config: WireConfig,

    stream_ab: StreamBuffer,
    stream_ba: StreamBuffer,
    datagram_ab: DatagramBuffer,
    datagram_ba: DatagramBuffer,

    exceptions: ExceptionQueue,
    layer_info: LayerInfoHierarchy,

    disconnecting: OnceFlag,
    disconnected: Latch,
    disconnect_callbacks: Mutex<Vec<Box<dyn FnOnce() + Send>>>,

    attachments: [Mutex<Option<Attachment>>; 2],
}

/// A full-duplex in-process connection: a stream buffer and a datagram buffer per direction.
///
/// The four buffers share a single exception queue, a single layer info hierarchy and a single
///  disconnect: if any of them disconnects, the whole pipe does.
///
/// `Pipe` is a cheap handle, clones refer to the same pipe.
#[derive(Clone)]
pub struct Pipe {
    inner: Arc<PipeInner>,
}

impl Debug for Pipe {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipe")
            .field("id", &self.inner.id)
            .field("disconnected", &self.is_disconnected())
            .finish()
    }
}

impl Pipe {
    pub fn new(config: WireConfig) -> Pipe {
        let inner = Arc::new(PipeInner {
            id: Uuid::new_v4(),
            stream_ab: Fifo::new(config.stream_threshold),
            stream_ba: Fifo::new(config.stream_threshold),
            datagram_ab: Fifo::new(config.datagram_threshold),
            datagram_ba: Fifo::new(config.datagram_threshold),
            config,
            exceptions: ExceptionQueue::new(),
            layer_info: LayerInfoHierarchy::new(),
            disconnecting: OnceFlag::new(),
            disconnected: Latch::new(),
            disconnect_callbacks: Default::default(),
            attachments: [Mutex::new(None), Mutex::new(None)],
        });

        wire_buffer(&inner, &inner.stream_ab);
        wire_buffer(&inner, &inner.stream_ba);
        wire_buffer(&inner, &inner.datagram_ab);
        wire_buffer(&inner, &inner.datagram_ba);

        debug!(pipe_id = %inner.id, "new pipe");
        Pipe { inner }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn config(&self) -> &WireConfig {
        &self.inner.config
    }

    pub fn end(&self, side: PipeSide) -> PipeEnd {
        PipeEnd {
            pipe: self.clone(),
            side,
        }
    }

    pub fn end_a(&self) -> PipeEnd {
        self.end(PipeSide::A)
    }

    pub fn end_b(&self) -> PipeEnd {
        self.end(PipeSide::B)
    }

    pub fn exceptions(&self) -> &ExceptionQueue {
        &self.inner.exceptions
    }

    pub fn layer_info(&self) -> &LayerInfoHierarchy {
        &self.inner.layer_info
    }

    pub fn is_disconnected(&self) -> bool {
        self.inner.disconnecting.is_set()
    }

    pub fn check_disconnected(&self) -> WireResult<()> {
        self.inner.exceptions.check(self.is_disconnected())
    }

    /// Disconnect the pipe, recording `error` (if any) as its cause. This is idempotent: only the
    ///  first call runs callbacks and disconnects the buffers.
    pub fn disconnect(&self, error: Option<WireError>) {
        if let Some(error) = error {
            self.inner.exceptions.raise(error);
        }
        if !self.inner.disconnecting.set() {
            return;
        }
        debug!(pipe_id = %self.inner.id, cause = ?self.inner.exceptions.first(), "pipe disconnected");

        let callbacks = std::mem::take(&mut *self.inner.disconnect_callbacks.lock());
        for callback in callbacks {
            run_callback(callback);
        }

        self.inner.stream_ab.disconnect();
        self.inner.stream_ba.disconnect();
        self.inner.datagram_ab.disconnect();
        self.inner.datagram_ba.disconnect();

        self.inner.disconnected.open();
    }

    /// Register a callback that runs when the pipe disconnects, or right away if it already has
    pub fn on_disconnect(&self, callback: impl FnOnce() + Send + 'static) {
        {
            let mut callbacks = self.inner.disconnect_callbacks.lock();
            if !self.is_disconnected() {
                callbacks.push(Box::new(callback));
                return;
            }
        }
        run_callback(Box::new(callback));
    }

    /// Resolves once the pipe is disconnected and all its buffers are
    pub async fn wait_disconnected(&self) {
        self.inner.disconnected.wait().await
    }

    pub fn downgrade(&self) -> WeakPipe {
        WeakPipe {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn is_same(&self, other: &Pipe) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

fn wire_buffer<T: Segment>(inner: &Arc<PipeInner>, buffer: &Fifo<T>) {
    inner.exceptions.encounter(buffer.exceptions());
    inner.layer_info.encounter(buffer.layer_info());

    let weak = Arc::downgrade(inner);
    buffer.on_disconnect(move || {
        if let Some(inner) = weak.upgrade() {
            Pipe { inner }.disconnect(None);
        }
    });
}

/// A non-owning reference to a pipe, for callbacks that must not keep a pipe alive
#[derive(Clone)]
pub struct WeakPipe {
    inner: Weak<PipeInner>,
}

impl WeakPipe {
    pub fn upgrade(&self) -> Option<Pipe> {
        self.inner.upgrade().map(|inner| Pipe { inner })
    }
}

/// One side of a [Pipe]: it writes to the buffers its counterpart reads, and vice versa.
#[derive(Clone, Debug)]
pub struct PipeEnd {
    pipe: Pipe,
    side: PipeSide,
}

impl PipeEnd {
    pub fn pipe(&self) -> &Pipe {
        &self.pipe
    }

    pub fn side(&self) -> PipeSide {
        self.side
    }

    pub fn counterpart(&self) -> PipeEnd {
        self.pipe.end(self.side.other())
    }

    pub fn reader_stream(&self) -> &StreamBuffer {
        match self.side {
            PipeSide::A => &self.pipe.inner.stream_ba,
            PipeSide::B => &self.pipe.inner.stream_ab,
        }
    }

    pub fn writer_stream(&self) -> &StreamBuffer {
        match self.side {
            PipeSide::A => &self.pipe.inner.stream_ab,
            PipeSide::B => &self.pipe.inner.stream_ba,
        }
    }

    pub fn reader_datagram(&self) -> &DatagramBuffer {
        match self.side {
            PipeSide::A => &self.pipe.inner.datagram_ba,
            PipeSide::B => &self.pipe.inner.datagram_ab,
        }
    }

    pub fn writer_datagram(&self) -> &DatagramBuffer {
        match self.side {
            PipeSide::A => &self.pipe.inner.datagram_ab,
            PipeSide::B => &self.pipe.inner.datagram_ba,
        }
    }

    pub fn exceptions(&self) -> &ExceptionQueue {
        self.pipe.exceptions()
    }

    pub fn layer_info(&self) -> &LayerInfoHierarchy {
        self.pipe.layer_info()
    }

    pub fn is_disconnected(&self) -> bool {
        self.pipe.is_disconnected()
    }

    pub fn check_disconnected(&self) -> WireResult<()> {
        self.pipe.check_disconnected()
    }

    pub fn disconnect(&self, error: Option<WireError>) {
        self.pipe.disconnect(error)
    }

    fn attachment(&self) -> &Mutex<Option<Attachment>> {
        &self.pipe.inner.attachments[self.side.idx()]
    }

    pub fn is_attached(&self) -> bool {
        self.attachment().lock().is_some()
    }

    /// Take ownership of this end. There can be at most one live [AttachHandle] per end; the end
    ///  is released when the handle is dropped.
    ///
    /// Stream timeouts from the pipe's config are applied to the new handle, which requires a
    ///  tokio runtime if they are set.
    pub fn attach(&self) -> WireResult<AttachHandle> {
        self.attach_with(true)
    }

    /// Attach without the config's stream timeouts. Stack layers attach this way: the timeouts
    ///  are meant for the application's end of a stack.
    pub(crate) fn attach_layer(&self) -> WireResult<AttachHandle> {
        self.attach_with(false)
    }

    fn attach_with(&self, apply_timeouts: bool) -> WireResult<AttachHandle> {
        self.check_disconnected()?;

        let cancel = {
            let mut slot = self.attachment().lock();
            if slot.is_some() {
                return Err(WireError::AlreadyAttached);
            }
            let cancel = CancelToken::new();
            *slot = Some(Attachment {
                cancel: cancel.clone(),
                stream: None,
            });
            cancel
        };
        debug!(pipe_id = %self.pipe.id(), side = ?self.side, "attached");

        let handle = AttachHandle::new(self.clone(), cancel);
        if !apply_timeouts {
            return Ok(handle);
        }
        let config = self.pipe.config();
        if config.stream_receive_timeout.is_some() {
            handle.set_stream_receive_timeout(config.stream_receive_timeout)?;
        }
        if config.stream_send_timeout.is_some() {
            handle.set_stream_send_timeout(config.stream_send_timeout)?;
        }
        Ok(handle)
    }

    pub(crate) fn release(&self) {
        if let Some(attachment) = self.attachment().lock().take() {
            attachment.cancel.cancel();
            debug!(pipe_id = %self.pipe.id(), side = ?self.side, "released");
        }
    }

    /// The stream facade for this end. It is created on first use and shared by all later calls
    ///  for the same attachment, so `auto_flush` only has an effect on the first call.
    pub fn get_stream(&self, auto_flush: bool) -> WireResult<PipeEndStream> {
        let mut slot = self.attachment().lock();
        let Some(attachment) = slot.as_mut() else {
            return Err(WireError::NotAttached);
        };

        let cancel = attachment.cancel.clone();
        let stream = attachment.stream
            .get_or_insert_with(|| PipeEndStream::new(self.clone(), auto_flush, cancel));
        Ok(stream.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use bytes::Bytes;
    use rstest::rstest;
    use crate::buffer::Datagram;
    use crate::layer_info::{LayerPosition, TcpLayerInfo};
    use super::*;

    fn pipe() -> Pipe {
        Pipe::new(WireConfig::default())
    }

    #[test]
    fn test_ends_are_crossed() {
        let p = pipe();
        let (a, b) = (p.end_a(), p.end_b());

        a.writer_stream().enqueue(Bytes::from_static(b"to b")).unwrap();
        assert_eq!(b.reader_stream().len(), 4);
        assert!(a.reader_stream().is_empty());

        b.writer_datagram().enqueue(Datagram::new(&b"to a"[..], None)).unwrap();
        assert_eq!(a.reader_datagram().len(), 1);
        assert!(b.reader_datagram().is_empty());

        assert_eq!(a.counterpart().side(), PipeSide::B);
    }

    #[rstest]
    #[case::stream_ab(|p: &Pipe| p.end_a().writer_stream().disconnect())]
    #[case::stream_ba(|p: &Pipe| p.end_a().reader_stream().disconnect())]
    #[case::datagram_ab(|p: &Pipe| p.end_a().writer_datagram().disconnect())]
    #[case::datagram_ba(|p: &Pipe| p.end_b().writer_datagram().disconnect())]
    #[case::pipe(|p: &Pipe| p.disconnect(None))]
    fn test_disconnect_fan_out(#[case] disconnect: fn(&Pipe)) {
        let p = pipe();
        let calls = Arc::new(AtomicUsize::new(0));
        let c2 = calls.clone();
        p.on_disconnect(move || { c2.fetch_add(1, Ordering::SeqCst); });

        disconnect(&p);

        assert!(p.is_disconnected());
        for end in [p.end_a(), p.end_b()] {
            assert!(end.reader_stream().is_disconnected());
            assert!(end.writer_stream().is_disconnected());
            assert!(end.reader_datagram().is_disconnected());
            assert!(end.writer_datagram().is_disconnected());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(p.inner.disconnected.is_open());
    }

    #[test]
    fn test_buffers_share_the_pipes_exceptions_and_layer_info() {
        let p = pipe();
        p.end_b().reader_datagram().exceptions().raise(WireError::InvalidArgument("from a buffer"));
        assert!(matches!(p.exceptions().first(), Some(WireError::InvalidArgument("from a buffer"))));

        p.end_a().writer_stream().layer_info().install(TcpLayerInfo { local_port: 1, remote_port: 2 }, LayerPosition::Top);
        assert_eq!(p.layer_info().layer_names(), vec!["tcp"]);
    }

    #[test]
    fn test_disconnect_records_cause() {
        let p = pipe();
        p.disconnect(Some(WireError::Timeout(Duration::from_millis(100))));
        p.disconnect(Some(WireError::InvalidArgument("later")));

        assert!(matches!(p.check_disconnected(), Err(WireError::Timeout(_))));
        assert!(matches!(p.end_b().writer_stream().enqueue(Bytes::from_static(b"x")), Err(WireError::Timeout(_))));
    }

    #[test]
    fn test_attach_is_exclusive() {
        let p = pipe();
        let a = p.end_a();

        assert!(matches!(a.get_stream(true), Err(WireError::NotAttached)));

        let handle = a.attach().unwrap();
        assert!(a.is_attached());
        assert!(matches!(a.attach(), Err(WireError::AlreadyAttached)));

        // the other end is independent
        let _b = p.end_b().attach().unwrap();

        drop(handle);
        assert!(!a.is_attached());
        let _handle = a.attach().unwrap();
    }

    #[test]
    fn test_attach_after_disconnect_fails() {
        let p = pipe();
        p.disconnect(None);
        assert!(matches!(p.end_a().attach(), Err(WireError::Disconnected)));
    }

    #[test]
    fn test_weak_pipe_does_not_keep_pipe_alive() {
        let p = pipe();
        let weak = p.downgrade();
        assert!(weak.upgrade().unwrap().is_same(&p));
        drop(p);
        assert!(weak.upgrade().is_none());
    }

    #[tokio::test]
    async fn test_wait_disconnected() {
        let p = pipe();
        let p2 = p.clone();
        let waiter = tokio::spawn(async move { p2.wait_disconnected().await });

        tokio::task::yield_now().await;
        p.end_b().disconnect(None);
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
    }
}
