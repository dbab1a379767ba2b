pub mod exception_queue;
pub mod fifo;
pub mod segment;
pub mod stream;

use bytes::Bytes;

pub use exception_queue::ExceptionQueue;
pub use fifo::{BufferEvent, BufferListener, Fifo, FifoLocked, ListenerId};
pub use segment::{Datagram, Segment};

/// Byte chunks, measured in bytes
pub type StreamBuffer = Fifo<Bytes>;

/// Discrete datagrams, measured in items
pub type DatagramBuffer = Fifo<Datagram>;
