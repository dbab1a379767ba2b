use std::io::ErrorKind;
use std::net::Shutdown;
use anyhow::bail;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
#[cfg(test)] use mockall::automock;
use tokio::net::{TcpStream, UdpSocket};
use tracing::debug;
use crate::buffer::Datagram;
use crate::pump::object_wrapper::WrappedObject;

/// Upper bound for the payload of a single UDP datagram
pub const MAX_DATAGRAM_SIZE: usize = 65536;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TransportKind {
    Stream,
    Datagram,
}

/// The send / receive primitives of an OS level socket, introduced to keep the socket wrapper
///  independent of concrete socket types (and to facilitate mocking them away for testing)
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    fn kind(&self) -> TransportKind;

    /// Send all of `data`, returning the number of bytes sent
    async fn send(&self, data: Bytes) -> anyhow::Result<usize>;
    /// Up to `max_len` bytes. An empty result means the peer closed the connection.
    async fn receive(&self, max_len: usize) -> anyhow::Result<Bytes>;

    async fn send_to(&self, datagram: Datagram) -> anyhow::Result<usize>;
    async fn receive_from(&self, max_len: usize) -> anyhow::Result<Datagram>;

    async fn close(&self) -> anyhow::Result<()>;
}

#[async_trait]
impl Transport for TcpStream {
    fn kind(&self) -> TransportKind {
        TransportKind::Stream
    }

    async fn send(&self, data: Bytes) -> anyhow::Result<usize> {
        let mut written = 0;
        while written < data.len() {
            self.writable().await?;
            match self.try_write(&data[written..]) {
                Ok(n) => written += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(written)
    }

    async fn receive(&self, max_len: usize) -> anyhow::Result<Bytes> {
        let mut buf = BytesMut::zeroed(max_len);
        loop {
            self.readable().await?;
            match self.try_read(&mut buf) {
                Ok(n) => {
                    buf.truncate(n);
                    return Ok(buf.freeze());
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn send_to(&self, _datagram: Datagram) -> anyhow::Result<usize> {
        bail!("datagrams are not supported on a TCP connection")
    }

    async fn receive_from(&self, _max_len: usize) -> anyhow::Result<Datagram> {
        bail!("datagrams are not supported on a TCP connection")
    }

    async fn close(&self) -> anyhow::Result<()> {
        match socket2::SockRef::from(self).shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            // the peer was faster
            Err(e) if e.kind() == ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl Transport for UdpSocket {
    fn kind(&self) -> TransportKind {
        TransportKind::Datagram
    }

    async fn send(&self, data: Bytes) -> anyhow::Result<usize> {
        Ok(UdpSocket::send(self, &data).await?)
    }

    async fn receive(&self, max_len: usize) -> anyhow::Result<Bytes> {
        let mut buf = BytesMut::zeroed(max_len);
        let n = self.recv(&mut buf).await?;
        buf.truncate(n);
        Ok(buf.freeze())
    }

    async fn send_to(&self, datagram: Datagram) -> anyhow::Result<usize> {
        let sent = match datagram.endpoint {
            Some(to) => UdpSocket::send_to(self, &datagram.data, to).await?,
            None => UdpSocket::send(self, &datagram.data).await?,
        };
        Ok(sent)
    }

    async fn receive_from(&self, max_len: usize) -> anyhow::Result<Datagram> {
        let mut buf = BytesMut::zeroed(max_len);
        let (n, from) = self.recv_from(&mut buf).await?;
        buf.truncate(n);
        Ok(Datagram::new(buf.freeze(), Some(from)))
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Adapts a [Transport] to the pump loops: stream sockets pump the pipe's stream buffers,
///  datagram sockets its datagram buffers.
pub struct SocketWrapper<T: Transport> {
    transport: T,
}

impl<T: Transport> SocketWrapper<T> {
    pub fn new(transport: T) -> SocketWrapper<T> {
        SocketWrapper { transport }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }
}

#[async_trait]
impl<T: Transport> WrappedObject for SocketWrapper<T> {
    fn supports_stream(&self) -> bool {
        self.transport.kind() == TransportKind::Stream
    }

    fn supports_datagram(&self) -> bool {
        self.transport.kind() == TransportKind::Datagram
    }

    async fn stream_write_to_object(&self, chunks: Vec<Bytes>) -> anyhow::Result<()> {
        for chunk in chunks {
            self.transport.send(chunk).await?;
        }
        Ok(())
    }

    async fn stream_read_from_object(&self, max_len: usize) -> anyhow::Result<Option<Bytes>> {
        Ok(Some(self.transport.receive(max_len).await?))
    }

    async fn datagram_write_to_object(&self, datagrams: Vec<Datagram>) -> anyhow::Result<()> {
        for datagram in datagrams {
            self.transport.send_to(datagram).await?;
        }
        Ok(())
    }

    async fn datagram_read_from_object(&self) -> anyhow::Result<Option<Datagram>> {
        Ok(Some(self.transport.receive_from(MAX_DATAGRAM_SIZE).await?))
    }

    async fn close(&self) {
        if let Err(e) = self.transport.close().await {
            debug!(error = ?e, "error closing socket - ignoring");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::time::Duration;
    use mockall::predicate::eq;
    use parking_lot::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use crate::config::WireConfig;
    use crate::pipe::Pipe;
    use crate::pump::object_wrapper::ObjectWrapper;
    use super::*;

    #[tokio::test]
    async fn test_stream_read_passes_chunks_through() {
        let mut transport = MockTransport::new();
        let reads = Mutex::new(vec![Bytes::new(), Bytes::from_static(b"data")]);
        transport.expect_receive()
            .with(eq(100))
            .returning(move |_| Ok(reads.lock().pop().unwrap_or_default()));

        let wrapper = SocketWrapper::new(transport);
        assert_eq!(wrapper.stream_read_from_object(100).await.unwrap(), Some(Bytes::from_static(b"data")));
        assert_eq!(wrapper.stream_read_from_object(100).await.unwrap(), Some(Bytes::new()));
    }

    #[tokio::test]
    async fn test_kind_selects_loops() {
        let mut transport = MockTransport::new();
        transport.expect_kind().return_const(TransportKind::Datagram);
        let wrapper = SocketWrapper::new(transport);
        assert!(!wrapper.supports_stream());
        assert!(wrapper.supports_datagram());
    }

    #[tokio::test]
    async fn test_close_error_is_swallowed() {
        let mut transport = MockTransport::new();
        transport.expect_close().times(1).returning(|| Err(anyhow::anyhow!("already closed")));
        SocketWrapper::new(transport).close().await;
    }

    #[tokio::test]
    async fn test_tcp_through_pipe() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (mut server, _) = listener.accept().await.unwrap();

        let pipe = Pipe::new(WireConfig::default());
        let wrapper = ObjectWrapper::new(SocketWrapper::new(client), pipe.end_a());
        wrapper.start();

        let app = pipe.end_b().attach().unwrap();
        let stream = app.stream(true).unwrap();
        stream.send(b"over tcp").await.unwrap();

        let mut buf = [0u8; 8];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"over tcp");

        server.write_all(b"and back").await.unwrap();
        assert_eq!(stream.receive_exact(8).await.unwrap().as_ref(), b"and back");

        drop(server);
        assert!(stream.receive(100).await.unwrap().is_empty());
        tokio::time::timeout(Duration::from_secs(5), wrapper.wait_finished()).await.unwrap();
    }

    #[tokio::test]
    async fn test_udp_through_pipe() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let socket_addr = socket.local_addr().unwrap();
        let peer_addr: SocketAddr = peer.local_addr().unwrap();

        let pipe = Pipe::new(WireConfig::default());
        let wrapper = ObjectWrapper::new(SocketWrapper::new(socket), pipe.end_a());
        wrapper.start();

        let app = pipe.end_b().attach().unwrap();
        let stream = app.stream(true).unwrap();
        stream.send_datagram(Datagram::new(&b"hi"[..], Some(peer_addr))).await.unwrap();

        let mut buf = [0u8; 16];
        let (n, from) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hi");
        assert_eq!(from, socket_addr);

        peer.send_to(b"ho", socket_addr).await.unwrap();
        let received = stream.receive_datagram().await.unwrap().unwrap();
        assert_eq!(received.data.as_ref(), b"ho");
        assert_eq!(received.endpoint, Some(peer_addr));

        wrapper.close().await;
        assert!(pipe.is_disconnected());
    }
}
