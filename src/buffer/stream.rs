//! Pin-addressed random access for stream buffers.
//!
//! Chunks are `Bytes`, so splitting a chunk at an arbitrary pin produces two handles to
//!  sub-ranges of the same allocation without copying. Data is only copied when a contiguous
//!  view spanning several chunks is requested.

use bytes::{Bytes, BytesMut};
use crate::buffer::fifo::{Fifo, FifoLocked};
use crate::error::{WireError, WireResult};

impl<'a> FifoLocked<'a, Bytes> {
    fn range_error(&self, start: u64, len: u64) -> WireError {
        WireError::Range {
            start,
            len,
            head: self.pin_head(),
            tail: self.pin_tail(),
        }
    }

    /// Translate `[pin, pin+size)` into an offset range relative to the head, clamping at the
    ///  tail if `allow_partial` is set
    fn resolve(&self, pin: u64, size: usize, allow_partial: bool) -> WireResult<(usize, usize)> {
        if pin < self.pin_head() || pin > self.pin_tail() {
            return Err(self.range_error(pin, size as u64));
        }
        let offset = (pin - self.pin_head()) as usize;
        let available = self.len() - offset;
        if size > available {
            if !allow_partial {
                return Err(self.range_error(pin, size as u64));
            }
            return Ok((offset, available));
        }
        Ok((offset, size))
    }

    /// Ensure that a chunk boundary exists at `offset` (relative to the head), splitting a chunk
    ///  if necessary. Returns the index of the first chunk at or after `offset`.
    fn split_at_offset(&mut self, offset: usize) -> usize {
        let mut chunk_start = 0;
        for idx in 0..self.state.segments.len() {
            let chunk_len = self.state.segments[idx].len();
            if offset == chunk_start {
                return idx;
            }
            if offset < chunk_start + chunk_len {
                let head = self.state.segments[idx].split_to(offset - chunk_start);
                self.state.segments.insert(idx, head);
                return idx + 1;
            }
            chunk_start += chunk_len;
        }
        self.state.segments.len()
    }

    /// Insert `item` at `pin`, shifting everything at or after `pin` back. A pin beyond the tail
    ///  is an error unless `append_if_overrun` is set, in which case the item is appended.
    pub fn insert(&mut self, pin: u64, item: Bytes, append_if_overrun: bool) -> WireResult<()> {
        self.check_writable()?;

        if pin < self.pin_head() || (pin > self.pin_tail() && !append_if_overrun) {
            return Err(self.range_error(pin, item.len() as u64));
        }
        if item.is_empty() {
            return Ok(());
        }

        let previous_len = self.len();
        let offset = ((pin - self.pin_head()) as usize).min(previous_len);
        let idx = self.split_at_offset(offset);
        self.state.length += item.len();
        self.state.segments.insert(idx, item);
        self.note_written(previous_len);
        Ok(())
    }

    /// Cut `[pin_start, pin_start+length)` out of the buffer. Data after the removed range moves
    ///  forward, i.e. `pin_head` stays where it is and `pin_tail` decreases by `length`.
    pub fn remove(&mut self, pin_start: u64, length: usize) -> WireResult<()> {
        let (offset, length) = self.resolve(pin_start, length, false)?;
        if length == 0 {
            return Ok(());
        }

        let previous_len = self.len();
        let first = self.split_at_offset(offset);
        let end = self.split_at_offset(offset + length);
        self.state.segments.drain(first..end);
        self.state.length -= length;
        self.note_read(previous_len);
        Ok(())
    }

    /// A contiguous copy-free view of `[pin, pin+size)` if the range lies within a single chunk.
    ///  Otherwise the spanned chunks are merged into one (copying once), and the merged chunk
    ///  replaces them in the buffer so later requests for the same range are free.
    pub fn get_contiguous(&mut self, pin: u64, size: usize, allow_partial: bool) -> WireResult<Bytes> {
        let (offset, size) = self.resolve(pin, size, allow_partial)?;
        if size == 0 {
            return Ok(Bytes::new());
        }

        let mut chunk_start = 0;
        for chunk in &self.state.segments {
            if offset >= chunk_start && offset + size <= chunk_start + chunk.len() {
                let from = offset - chunk_start;
                return Ok(chunk.slice(from..from + size));
            }
            if chunk_start + chunk.len() > offset {
                break;
            }
            chunk_start += chunk.len();
        }

        let first = self.split_at_offset(offset);
        let end = self.split_at_offset(offset + size);
        let mut merged = BytesMut::with_capacity(size);
        for chunk in self.state.segments.drain(first..end) {
            merged.extend_from_slice(&chunk);
        }
        let merged = merged.freeze();
        self.state.segments.insert(first, merged.clone());
        Ok(merged)
    }

    /// Zero-copy slices covering `[pin, pin+size)`, without modifying the buffer
    pub fn get_segments(&self, pin: u64, size: usize, allow_partial: bool) -> WireResult<Vec<Bytes>> {
        let (offset, size) = self.resolve(pin, size, allow_partial)?;

        let mut result = Vec::new();
        let mut remaining = size;
        let mut chunk_start = 0;
        for chunk in &self.state.segments {
            if remaining == 0 {
                break;
            }
            let chunk_end = chunk_start + chunk.len();
            if chunk_end > offset {
                let from = offset.saturating_sub(chunk_start);
                let to = (from + remaining).min(chunk.len());
                result.push(chunk.slice(from..to));
                remaining -= to - from;
            }
            chunk_start = chunk_end;
        }
        Ok(result)
    }
}

impl Fifo<Bytes> {
    pub fn insert(&self, pin: u64, item: Bytes, append_if_overrun: bool) -> WireResult<()> {
        self.with_lock(|l| l.insert(pin, item, append_if_overrun))
    }

    pub fn remove(&self, pin_start: u64, length: usize) -> WireResult<()> {
        self.with_lock(|l| l.remove(pin_start, length))
    }

    pub fn get_contiguous(&self, pin: u64, size: usize, allow_partial: bool) -> WireResult<Bytes> {
        self.with_lock(|l| l.get_contiguous(pin, size, allow_partial))
    }

    pub fn get_segments(&self, pin: u64, size: usize, allow_partial: bool) -> WireResult<Vec<Bytes>> {
        self.with_lock(|l| l.get_segments(pin, size, allow_partial))
    }

    /// Copy up to `size` bytes from the head without consuming them
    pub fn peek(&self, size: usize) -> Bytes {
        self.with_lock(|l| {
            let head = l.pin_head();
            l.get_contiguous(head, size, true).unwrap_or_default()
        })
    }
}
