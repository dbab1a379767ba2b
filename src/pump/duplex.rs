use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use tokio::sync::mpsc;
use crate::buffer::Datagram;
use crate::error::WireError;
use crate::pump::object_wrapper::WrappedObject;

/// A pair of independent byte channels, one per direction, as offered by I/O multiplexing
///  facilities
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DuplexTransport: Send + Sync + 'static {
    async fn write(&self, data: Bytes) -> anyhow::Result<()>;

    /// The next chunk, or `None` once the other side completed
    async fn read(&self) -> anyhow::Result<Option<Bytes>>;

    /// Signal that no more data will be written, and stop reading
    async fn complete(&self);
}

/// In-memory [DuplexTransport] based on bounded mpsc channels
pub struct DuplexChannel {
    sender: parking_lot::Mutex<Option<mpsc::Sender<Bytes>>>,
    receiver: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
}

impl DuplexChannel {
    /// Two connected channels: what is written to one can be read from the other
    pub fn pair(capacity: usize) -> (DuplexChannel, DuplexChannel) {
        let (tx_a, rx_a) = mpsc::channel(capacity);
        let (tx_b, rx_b) = mpsc::channel(capacity);
        (
            DuplexChannel {
                sender: parking_lot::Mutex::new(Some(tx_a)),
                receiver: tokio::sync::Mutex::new(rx_b),
            },
            DuplexChannel {
                sender: parking_lot::Mutex::new(Some(tx_b)),
                receiver: tokio::sync::Mutex::new(rx_a),
            },
        )
    }
}

#[async_trait]
impl DuplexTransport for DuplexChannel {
    async fn write(&self, data: Bytes) -> anyhow::Result<()> {
        let sender = self.sender.lock().clone();
        match sender {
            Some(sender) => sender.send(data).await
                .map_err(|_| anyhow!("duplex channel was closed by the other side")),
            None => Err(WireError::Disconnected.into()),
        }
    }

    async fn read(&self) -> anyhow::Result<Option<Bytes>> {
        Ok(self.receiver.lock().await.recv().await)
    }

    async fn complete(&self) {
        self.sender.lock().take();
        self.receiver.lock().await.close();
    }
}

/// Adapts a [DuplexTransport] to the pump loops (stream data only)
pub struct DuplexTransportWrapper<D: DuplexTransport> {
    transport: D,
}

impl<D: DuplexTransport> DuplexTransportWrapper<D> {
    pub fn new(transport: D) -> DuplexTransportWrapper<D> {
        DuplexTransportWrapper { transport }
    }
}

#[async_trait]
impl<D: DuplexTransport> WrappedObject for DuplexTransportWrapper<D> {
    fn supports_stream(&self) -> bool {
        true
    }

    fn supports_datagram(&self) -> bool {
        false
    }

    async fn stream_write_to_object(&self, chunks: Vec<Bytes>) -> anyhow::Result<()> {
        for chunk in chunks {
            self.transport.write(chunk).await?;
        }
        Ok(())
    }

    /// Chunks are passed on as the transport delivers them, regardless of `max_len`
    async fn stream_read_from_object(&self, _max_len: usize) -> anyhow::Result<Option<Bytes>> {
        self.transport.read().await
    }

    async fn datagram_write_to_object(&self, _datagrams: Vec<Datagram>) -> anyhow::Result<()> {
        Err(WireError::InvalidArgument("duplex transports do not support datagrams").into())
    }

    async fn datagram_read_from_object(&self) -> anyhow::Result<Option<Datagram>> {
        Err(WireError::InvalidArgument("duplex transports do not support datagrams").into())
    }

    async fn close(&self) {
        self.transport.complete().await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use crate::config::WireConfig;
    use crate::pipe::Pipe;
    use crate::pump::object_wrapper::ObjectWrapper;
    use super::*;

    #[tokio::test]
    async fn test_channel_pair() {
        let (left, right) = DuplexChannel::pair(4);
        left.write(Bytes::from_static(b"x")).await.unwrap();
        assert_eq!(right.read().await.unwrap(), Some(Bytes::from_static(b"x")));

        left.complete().await;
        assert_eq!(right.read().await.unwrap(), None);
        assert!(left.write(Bytes::from_static(b"y")).await.is_err());
        assert!(right.write(Bytes::from_static(b"z")).await.is_err());
    }

    #[tokio::test]
    async fn test_pumps_duplex_transport() {
        let (ours, theirs) = DuplexChannel::pair(16);
        let pipe = Pipe::new(WireConfig::default());
        let wrapper = ObjectWrapper::new(DuplexTransportWrapper::new(ours), pipe.end_a());
        wrapper.start();

        let app = pipe.end_b().attach().unwrap();
        let stream = app.stream(true).unwrap();

        theirs.write(Bytes::from_static(b"hi")).await.unwrap();
        assert_eq!(stream.receive(10).await.unwrap().as_ref(), b"hi");

        stream.send(b"yo").await.unwrap();
        assert_eq!(theirs.read().await.unwrap(), Some(Bytes::from_static(b"yo")));

        theirs.complete().await;
        tokio::time::timeout(Duration::from_secs(5), wrapper.wait_finished()).await.unwrap();
        assert!(pipe.is_disconnected());
        // our side completed as well when the wrapper closed
        assert_eq!(theirs.read().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_zero_length_chunk_disconnects() {
        let (ours, theirs) = DuplexChannel::pair(4);
        let pipe = Pipe::new(WireConfig::default());
        ObjectWrapper::new(DuplexTransportWrapper::new(ours), pipe.end_a()).start();

        theirs.write(Bytes::new()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(3), pipe.wait_disconnected()).await.unwrap();
        assert!(pipe.exceptions().first().is_none());
    }

    #[tokio::test]
    async fn test_wrapper_forwards_chunks() {
        let mut transport = MockDuplexTransport::new();
        transport.expect_write().times(2).returning(|_| Ok(()));
        let wrapper = DuplexTransportWrapper::new(transport);
        wrapper.stream_write_to_object(vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]).await.unwrap();
    }
}
