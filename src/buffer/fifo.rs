use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{trace, warn};
use crate::buffer::exception_queue::ExceptionQueue;
use crate::buffer::segment::Segment;
use crate::error::{WireError, WireResult};
use crate::layer_info::LayerInfoHierarchy;
use crate::util::auto_reset_event::{AutoResetEvent, WaitOutcome};
use crate::util::cancel::CancelToken;
use crate::util::once_flag::OnceFlag;

/// State transitions reported to buffer listeners
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum BufferEvent {
    Written,
    Read,
    EmptyToNonEmpty,
    NonEmptyToEmpty,
    Disconnected,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct ListenerId(u64);

pub type BufferListener = Arc<dyn Fn(BufferEvent) + Send + Sync>;

pub(crate) struct FifoState<T> {
    pub(crate) segments: VecDeque<T>,
    pub(crate) pin_head: u64,
    pub(crate) length: usize,
}

impl<T: Segment> FifoState<T> {
    fn pin_tail(&self) -> u64 {
        self.pin_head + self.length as u64
    }
}

/// A FIFO buffer of segments, addressed by pins. This is the storage primitive that pipes are
///  built from: [crate::buffer::StreamBuffer] for byte chunks, [crate::buffer::DatagramBuffer]
///  for datagrams.
///
/// Pins are logical offsets: `pin_head` is the pin of the oldest buffered unit, `pin_tail` the
///  pin after the newest. They never decrease, so they can be used to refer to positions in the
///  buffer independently of how the data is physically chunked.
///
/// All mutation happens under the buffer's lock. Several operations can be combined atomically
///  through [Fifo::with_lock].
///
/// Readiness: `is_ready_to_read()` and `is_ready_to_write()` are pure predicates. The matching
///  events (`read_ready`, `write_ready`) are signaled by [Fifo::complete_write] and
///  [Fifo::complete_read], which every mutating operation calls after releasing the lock.
pub struct Fifo<T: Segment> {
    state: Mutex<FifoState<T>>,
    threshold: usize,
    disconnected: OnceFlag,
    read_ready: AutoResetEvent,
    write_ready: AutoResetEvent,
    listeners: Mutex<FxHashMap<ListenerId, BufferListener>>,
    next_listener_id: AtomicU64,
    disconnect_callbacks: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
    exceptions: ExceptionQueue,
    layer_info: LayerInfoHierarchy,
}

impl<T: Segment> Fifo<T> {
    pub fn new(threshold: usize) -> Fifo<T> {
        Fifo {
            state: Mutex::new(FifoState {
                segments: VecDeque::new(),
                pin_head: 0,
                length: 0,
            }),
            threshold,
            disconnected: OnceFlag::new(),
            read_ready: AutoResetEvent::new(),
            write_ready: AutoResetEvent::new(),
            listeners: Default::default(),
            next_listener_id: AtomicU64::new(0),
            disconnect_callbacks: Default::default(),
            exceptions: ExceptionQueue::new(),
            layer_info: LayerInfoHierarchy::new(),
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn exceptions(&self) -> &ExceptionQueue {
        &self.exceptions
    }

    pub fn layer_info(&self) -> &LayerInfoHierarchy {
        &self.layer_info
    }

    pub fn len(&self) -> usize {
        self.state.lock().length
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pin_head(&self) -> u64 {
        self.state.lock().pin_head
    }

    pub fn pin_tail(&self) -> u64 {
        self.state.lock().pin_tail()
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.is_set()
    }

    /// `Ok` while connected, the pipe's first recorded error (or `Disconnected`) otherwise
    pub fn check_disconnected(&self) -> WireResult<()> {
        self.exceptions.check(self.is_disconnected())
    }

    pub fn is_ready_to_read(&self) -> bool {
        self.is_disconnected() || self.len() >= 1
    }

    pub fn is_ready_to_write(&self) -> bool {
        self.is_disconnected() || self.len() <= self.threshold
    }

    /// Wake readers waiting for data
    pub fn complete_write(&self) {
        self.read_ready.set();
    }

    /// Wake writers waiting for room
    pub fn complete_read(&self) {
        self.write_ready.set();
    }

    pub async fn wait_read_ready(&self, timeout: Duration, cancel: Option<&CancelToken>) -> WaitOutcome {
        if self.is_ready_to_read() {
            return WaitOutcome::Signaled;
        }
        self.read_ready.wait(timeout, cancel).await
    }

    pub async fn wait_write_ready(&self, timeout: Duration, cancel: Option<&CancelToken>) -> WaitOutcome {
        if self.is_ready_to_write() {
            return WaitOutcome::Signaled;
        }
        self.write_ready.wait(timeout, cancel).await
    }

    pub fn add_listener(&self, listener: BufferListener) -> ListenerId {
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().insert(id, listener);
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.lock().remove(&id).is_some()
    }

    /// Register a callback to run when the buffer disconnects. If it is already disconnected,
    ///  the callback runs right away.
    pub fn on_disconnect(&self, callback: impl FnOnce() + Send + 'static) {
        {
            let mut callbacks = self.disconnect_callbacks.lock();
            if !self.is_disconnected() {
                callbacks.push(Box::new(callback));
                return;
            }
        }
        run_callback(Box::new(callback));
    }

    /// Stop accepting new data. Data that is already buffered remains readable. This is
    ///  idempotent - callbacks and events fire for the first call only.
    pub fn disconnect(&self) {
        {
            let _state = self.state.lock();
            if !self.disconnected.set() {
                return;
            }
        }
        trace!("buffer disconnected");

        let callbacks = std::mem::take(&mut *self.disconnect_callbacks.lock());
        for callback in callbacks {
            run_callback(callback);
        }

        self.fire(&[BufferEvent::Disconnected]);
    }

    /// Run `f` with exclusive access to the buffer, so that several operations (e.g. a check
    ///  followed by an update) happen atomically. Events are fired after the lock is released.
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut FifoLocked<'_, T>) -> R) -> R {
        self.locked_then_fire(true, f)
    }

    fn locked_then_fire<R>(&self, wake_readers: bool, f: impl FnOnce(&mut FifoLocked<'_, T>) -> R) -> R {
        let mut events = Vec::new();
        let result = {
            let mut state = self.state.lock();
            let mut locked = FifoLocked {
                state: &mut *state,
                disconnected: &self.disconnected,
                exceptions: &self.exceptions,
                events: &mut events,
            };
            f(&mut locked)
        };
        self.fire_with(&events, wake_readers);
        result
    }

    pub fn enqueue(&self, item: T) -> WireResult<()> {
        self.with_lock(|l| l.enqueue(item))
    }

    pub fn enqueue_all(&self, items: impl IntoIterator<Item = T>) -> WireResult<()> {
        self.with_lock(|l| l.enqueue_all(items))
    }

    /// Like [Fifo::enqueue_all], but readers waiting for data are not woken until the next
    ///  [Fifo::complete_write]. Listeners are notified as usual, and the data is visible to any
    ///  reader that looks.
    pub fn enqueue_all_unflushed(&self, items: impl IntoIterator<Item = T>) -> WireResult<()> {
        self.locked_then_fire(false, |l| l.enqueue_all(items))
    }

    /// Remove segments from the head until at least `min_size` units are collected or the buffer
    ///  is exhausted. With `allow_split`, a segment straddling the boundary is split so that
    ///  exactly `min_size` units are returned (if available).
    ///
    /// This never blocks and never fails for lack of data: an empty buffer yields an empty result.
    pub fn dequeue(&self, min_size: usize, allow_split: bool) -> WireResult<(Vec<T>, usize)> {
        self.with_lock(|l| l.dequeue(min_size, allow_split))
    }

    /// Like [Fifo::dequeue], but collects at most `max_segments` segments
    pub fn dequeue_limited(&self, min_size: usize, allow_split: bool, max_segments: usize) -> WireResult<(Vec<T>, usize)> {
        self.with_lock(|l| l.dequeue_limited(min_size, allow_split, max_segments))
    }

    pub fn dequeue_all(&self) -> (Vec<T>, usize) {
        self.with_lock(|l| l.dequeue_all())
    }

    pub fn clear(&self) {
        self.with_lock(|l| l.clear())
    }

    /// Move the entire content of this buffer to the tail of `other`, atomically with respect to
    ///  both buffers' locks. Returns the number of units moved.
    pub fn dequeue_all_and_enqueue_to_other(&self, other: &Fifo<T>) -> WireResult<usize> {
        if std::ptr::eq(self, other) {
            return Err(WireError::InvalidArgument("cannot move a buffer's content to itself"));
        }

        let mut own_events = Vec::new();
        let mut other_events = Vec::new();

        let result = {
            // consistent lock order to avoid deadlock with a transfer in the opposite direction
            let (mut own, mut theirs) = if (self as *const Fifo<T>) < (other as *const Fifo<T>) {
                let own = self.state.lock();
                let theirs = other.state.lock();
                (own, theirs)
            }
            else {
                let theirs = other.state.lock();
                let own = self.state.lock();
                (own, theirs)
            };

            if other.is_disconnected() {
                Err(other.exceptions.disconnect_error())
            }
            else {
                let moved = own.length;
                if moved > 0 {
                    if theirs.segments.is_empty() {
                        std::mem::swap(&mut theirs.segments, &mut own.segments);
                    }
                    else {
                        let mut segments = std::mem::take(&mut own.segments);
                        theirs.segments.append(&mut segments);
                    }

                    own.pin_head += moved as u64;
                    own.length = 0;
                    own_events.extend([BufferEvent::Read, BufferEvent::NonEmptyToEmpty]);

                    if theirs.length == 0 {
                        other_events.push(BufferEvent::EmptyToNonEmpty);
                    }
                    theirs.length += moved;
                    other_events.push(BufferEvent::Written);
                }
                Ok(moved)
            }
        };

        self.fire(&own_events);
        other.fire(&other_events);
        result
    }

    fn fire(&self, events: &[BufferEvent]) {
        self.fire_with(events, true)
    }

    fn fire_with(&self, events: &[BufferEvent], wake_readers_on_write: bool) {
        if events.is_empty() {
            return;
        }

        let mut wake_readers = false;
        let mut wake_writers = false;
        for evt in events {
            match evt {
                BufferEvent::Written | BufferEvent::EmptyToNonEmpty => wake_readers |= wake_readers_on_write,
                BufferEvent::Read | BufferEvent::NonEmptyToEmpty => wake_writers = true,
                BufferEvent::Disconnected => {
                    wake_readers = true;
                    wake_writers = true;
                }
            }
        }
        if wake_readers {
            self.complete_write();
        }
        if wake_writers {
            self.complete_read();
        }

        let listeners = self.listeners.lock().values().cloned().collect::<Vec<_>>();
        for listener in listeners {
            for &evt in events {
                listener(evt);
            }
        }
    }
}

pub(crate) fn run_callback(callback: Box<dyn FnOnce() + Send>) {
    // a panicking callback must not prevent the others from running
    if std::panic::catch_unwind(AssertUnwindSafe(callback)).is_err() {
        warn!("disconnect callback panicked - ignoring");
    }
}

/// Exclusive access to a [Fifo]'s content, see [Fifo::with_lock]
pub struct FifoLocked<'a, T: Segment> {
    pub(crate) state: &'a mut FifoState<T>,
    disconnected: &'a OnceFlag,
    exceptions: &'a ExceptionQueue,
    pub(crate) events: &'a mut Vec<BufferEvent>,
}

impl<'a, T: Segment> FifoLocked<'a, T> {
    pub fn len(&self) -> usize {
        self.state.length
    }

    pub fn is_empty(&self) -> bool {
        self.state.length == 0
    }

    pub fn pin_head(&self) -> u64 {
        self.state.pin_head
    }

    pub fn pin_tail(&self) -> u64 {
        self.state.pin_tail()
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.is_set()
    }

    pub(crate) fn check_writable(&self) -> WireResult<()> {
        self.exceptions.check(self.is_disconnected())
    }

    pub(crate) fn note_written(&mut self, previous_len: usize) {
        if previous_len == 0 && self.state.length > 0 {
            self.events.push(BufferEvent::EmptyToNonEmpty);
        }
        self.events.push(BufferEvent::Written);
    }

    pub(crate) fn note_read(&mut self, previous_len: usize) {
        self.events.push(BufferEvent::Read);
        if previous_len > 0 && self.state.length == 0 {
            self.events.push(BufferEvent::NonEmptyToEmpty);
        }
    }

    pub fn enqueue(&mut self, item: T) -> WireResult<()> {
        self.enqueue_all(std::iter::once(item))
    }

    pub fn enqueue_all(&mut self, items: impl IntoIterator<Item = T>) -> WireResult<()> {
        self.check_writable()?;

        let previous_len = self.state.length;
        for item in items {
            let size = item.size();
            if size == 0 {
                continue;
            }
            self.state.segments.push_back(item);
            self.state.length += size;
        }

        if self.state.length != previous_len {
            self.note_written(previous_len);
        }
        Ok(())
    }

    pub fn dequeue(&mut self, min_size: usize, allow_split: bool) -> WireResult<(Vec<T>, usize)> {
        self.dequeue_limited(min_size, allow_split, usize::MAX)
    }

    pub fn dequeue_limited(&mut self, min_size: usize, allow_split: bool, max_segments: usize) -> WireResult<(Vec<T>, usize)> {
        if min_size < 1 {
            return Err(WireError::InvalidArgument("minimum read size must be at least 1"));
        }

        let previous_len = self.state.length;
        let mut result = Vec::new();
        let mut total = 0;

        while total < min_size && result.len() < max_segments {
            let Some(front) = self.state.segments.front_mut() else {
                break;
            };

            let missing = min_size - total;
            let part = if allow_split && front.size() > missing {
                front.split_to(missing)
            }
            else {
                None
            };
            let Some(taken) = part.or_else(|| self.state.segments.pop_front()) else {
                break;
            };

            total += taken.size();
            result.push(taken);
        }

        if total > 0 {
            self.state.pin_head += total as u64;
            self.state.length -= total;
            self.note_read(previous_len);
        }
        Ok((result, total))
    }

    pub fn dequeue_all(&mut self) -> (Vec<T>, usize) {
        let previous_len = self.state.length;
        if previous_len == 0 {
            return (Vec::new(), 0);
        }

        let result = std::mem::take(&mut self.state.segments).into_iter().collect::<Vec<_>>();
        self.state.pin_head += previous_len as u64;
        self.state.length = 0;
        self.note_read(previous_len);
        (result, previous_len)
    }

    /// Drop all buffered data. `pin_tail` collapses to `pin_head`; pins are not rewound.
    pub fn clear(&mut self) {
        let previous_len = self.state.length;
        if previous_len == 0 {
            return;
        }
        self.state.segments.clear();
        self.state.length = 0;
        self.note_read(previous_len);
    }
}
