use std::future::Future;
use std::time::Duration;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tracing::debug;
use crate::buffer::Datagram;
use crate::error::WireError;
use crate::pump::object_wrapper::WrappedObject;

/// Adapts any tokio byte stream (e.g. a TLS stream) to the pump loops. Reads and writes use
///  separate halves of the stream so that both directions can be pumped concurrently.
pub struct ByteStreamWrapper<S> {
    reader: Mutex<ReadHalf<S>>,
    writer: Mutex<WriteHalf<S>>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
}

impl<S: AsyncRead + AsyncWrite + Send + 'static> ByteStreamWrapper<S> {
    pub fn new(stream: S) -> ByteStreamWrapper<S> {
        let (reader, writer) = tokio::io::split(stream);
        ByteStreamWrapper {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            read_timeout: None,
            write_timeout: None,
        }
    }

    /// A single read that takes longer than `timeout` fails with `WireError::Timeout`
    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.write_timeout = timeout;
        self
    }
}

async fn with_timeout<T>(timeout: Option<Duration>, f: impl Future<Output = std::io::Result<T>>) -> anyhow::Result<T> {
    match timeout {
        Some(timeout) => match tokio::time::timeout(timeout, f).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(WireError::Timeout(timeout).into()),
        },
        None => Ok(f.await?),
    }
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Send + 'static> WrappedObject for ByteStreamWrapper<S> {
    fn supports_stream(&self) -> bool {
        true
    }

    fn supports_datagram(&self) -> bool {
        false
    }

    async fn stream_write_to_object(&self, chunks: Vec<Bytes>) -> anyhow::Result<()> {
        let mut writer = self.writer.lock().await;
        with_timeout(self.write_timeout, async {
            for chunk in chunks {
                writer.write_all(&chunk).await?;
            }
            writer.flush().await
        }).await
    }

    async fn stream_read_from_object(&self, max_len: usize) -> anyhow::Result<Option<Bytes>> {
        let mut reader = self.reader.lock().await;
        let mut buf = BytesMut::with_capacity(max_len);
        with_timeout(self.read_timeout, reader.read_buf(&mut buf)).await?;
        Ok(Some(buf.freeze()))
    }

    async fn datagram_write_to_object(&self, _datagrams: Vec<Datagram>) -> anyhow::Result<()> {
        Err(WireError::InvalidArgument("byte streams do not support datagrams").into())
    }

    async fn datagram_read_from_object(&self) -> anyhow::Result<Option<Datagram>> {
        Err(WireError::InvalidArgument("byte streams do not support datagrams").into())
    }

    async fn close(&self) {
        if let Err(e) = self.writer.lock().await.shutdown().await {
            debug!(error = ?e, "error shutting down byte stream - ignoring");
        }
    }
}
