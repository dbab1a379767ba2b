use std::sync::Arc;
use std::time::Duration;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;
use crate::buffer::{BufferEvent, ListenerId, StreamBuffer};
use crate::error::{WireError, WireResult};
use crate::layer_info::{LayerId, LayerInfo, LayerPosition};
use crate::pipe::pipe::PipeEnd;
use crate::pipe::stream::PipeEndStream;
use crate::util::cancel::CancelToken;

/// Exclusive ownership of a [PipeEnd], see [PipeEnd::attach].
///
/// Layer info installed through the handle and stream timeout watchdogs live as long as the
///  handle does. Dropping it releases the end for the next `attach()`.
pub struct AttachHandle {
    end: PipeEnd,
    cancel: CancelToken,
    installed: Mutex<Vec<LayerId>>,
    receive_watchdog: Mutex<Option<Watchdog>>,
    send_watchdog: Mutex<Option<Watchdog>>,
}

impl AttachHandle {
    pub(crate) fn new(end: PipeEnd, cancel: CancelToken) -> AttachHandle {
        AttachHandle {
            end,
            cancel,
            installed: Default::default(),
            receive_watchdog: Default::default(),
            send_watchdog: Default::default(),
        }
    }

    pub fn end(&self) -> &PipeEnd {
        &self.end
    }

    /// Canceled when the handle is dropped
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn stream(&self, auto_flush: bool) -> WireResult<PipeEndStream> {
        self.end.get_stream(auto_flush)
    }

    /// Install a record in the pipe's layer info hierarchy. It is uninstalled when the handle is
    ///  dropped.
    pub fn set_layer_info<T: LayerInfo>(&self, info: T, position: LayerPosition) -> LayerId {
        let id = self.end.layer_info().install(info, position);
        self.installed.lock().push(id);
        id
    }

    pub fn remove_layer_info(&self, id: LayerId) -> bool {
        self.installed.lock().retain(|i| *i != id);
        self.end.layer_info().uninstall(id)
    }

    /// Disconnect the pipe with a `Timeout` if no data arrives on this end's reader stream for
    ///  `timeout`. `None` removes the watchdog.
    pub fn set_stream_receive_timeout(&self, timeout: Option<Duration>) -> WireResult<()> {
        self.set_timeout(&self.receive_watchdog, Direction::Receive, timeout)
    }

    /// Disconnect the pipe with a `Timeout` if this end's writer stream stays full for
    ///  `timeout`. `None` removes the watchdog.
    pub fn set_stream_send_timeout(&self, timeout: Option<Duration>) -> WireResult<()> {
        self.set_timeout(&self.send_watchdog, Direction::Send, timeout)
    }

    fn set_timeout(&self, slot: &Mutex<Option<Watchdog>>, direction: Direction, timeout: Option<Duration>) -> WireResult<()> {
        let watchdog = match timeout {
            Some(timeout) => Some(Watchdog::start(self.end.clone(), direction, timeout)?),
            None => None,
        };
        // the previous watchdog (if any) is stopped when it is dropped
        *slot.lock() = watchdog;
        Ok(())
    }
}

impl Drop for AttachHandle {
    fn drop(&mut self) {
        self.receive_watchdog.lock().take();
        self.send_watchdog.lock().take();

        for id in std::mem::take(&mut *self.installed.lock()) {
            self.end.layer_info().uninstall(id);
        }
        self.end.release();
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum Direction {
    Receive,
    Send,
}

impl Direction {
    fn buffer(self, end: &PipeEnd) -> &StreamBuffer {
        match self {
            Direction::Receive => end.reader_stream(),
            Direction::Send => end.writer_stream(),
        }
    }

    /// Data waiting in the reader stream is not a receive stall: the peer delivered, this end
    ///  just has not consumed it yet
    fn is_stalled(self, end: &PipeEnd) -> bool {
        match self {
            Direction::Receive => !end.reader_stream().is_ready_to_read(),
            Direction::Send => !end.writer_stream().is_ready_to_write(),
        }
    }
}

/// Every event on the watched buffer pushes the deadline back. When the deadline passes, the
///  stall is re-checked once before the pipe is disconnected, since data may have moved in the
///  very same instant.
struct Watchdog {
    end: PipeEnd,
    direction: Direction,
    listener: ListenerId,
    task: JoinHandle<()>,
}

impl Watchdog {
    fn start(end: PipeEnd, direction: Direction, timeout: Duration) -> WireResult<Watchdog> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| WireError::InvalidArgument("stream timeouts require a tokio runtime"))?;

        let last_activity = Arc::new(Mutex::new(Instant::now()));
        let listener = {
            let last_activity = last_activity.clone();
            direction.buffer(&end).add_listener(Arc::new(move |_: BufferEvent| *last_activity.lock() = Instant::now()))
        };

        let task = runtime.spawn(watch(end.clone(), direction, timeout, last_activity));
        Ok(Watchdog {
            end,
            direction,
            listener,
            task,
        })
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.task.abort();
        self.direction.buffer(&self.end).remove_listener(self.listener);
    }
}

async fn watch(end: PipeEnd, direction: Direction, timeout: Duration, last_activity: Arc<Mutex<Instant>>) {
    loop {
        let deadline = *last_activity.lock() + timeout;
        if Instant::now() < deadline {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => continue,
                _ = end.pipe().wait_disconnected() => return,
            }
        }

        if !direction.is_stalled(&end) {
            *last_activity.lock() = Instant::now();
            continue;
        }

        debug!(pipe_id = %end.pipe().id(), side = ?end.side(), ?direction, ?timeout, "stream stalled - disconnecting");
        end.disconnect(Some(WireError::Timeout(timeout)));
        return;
    }
}
