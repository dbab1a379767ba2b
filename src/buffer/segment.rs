use std::net::SocketAddr;
use bytes::Bytes;

/// An element of a segmented buffer. Its `size()` is the number of pins it occupies: its byte
///  length for stream chunks, 1 for datagrams.
pub trait Segment: Clone + Send + Sync + 'static {
    fn size(&self) -> usize;

    /// Split off the first `at` units (0 < at < size), keeping the rest in `self`. Returns `None`
    ///  for segment kinds that cannot be split.
    fn split_to(&mut self, at: usize) -> Option<Self>;
}

impl Segment for Bytes {
    fn size(&self) -> usize {
        self.len()
    }

    fn split_to(&mut self, at: usize) -> Option<Self> {
        Some(Bytes::split_to(self, at))
    }
}

/// A single datagram, optionally addressed. The endpoint is the sender for received datagrams
///  and the destination for datagrams to be sent; `None` means 'the connected peer'.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Datagram {
    pub data: Bytes,
    pub endpoint: Option<SocketAddr>,
}

impl Datagram {
    pub fn new(data: impl Into<Bytes>, endpoint: Option<SocketAddr>) -> Datagram {
        Datagram {
            data: data.into(),
            endpoint,
        }
    }
}

impl Segment for Datagram {
    fn size(&self) -> usize {
        1
    }

    fn split_to(&mut self, _at: usize) -> Option<Self> {
        None
    }
}
