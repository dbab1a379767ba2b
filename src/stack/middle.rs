use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use crate::buffer::Datagram;
use crate::error::{WireError, WireResult};
use crate::layer_info::LayerInfoHierarchy;
use crate::pipe::{PipeEnd, PipeEndStream};
use crate::pump::{ObjectWrapper, WrappedObject};
use crate::stack::base::StackBase;

/// What a middle layer does to the data passing through it. Both directions work on whatever
///  chunks arrive, so a transform must not depend on chunk boundaries for stream data.
#[cfg_attr(test, automock)]
pub trait LayerTransform: Send + Sync + 'static {
    /// Data on its way down the stack
    fn encode(&self, data: Bytes) -> anyhow::Result<Bytes>;
    /// Data on its way up the stack
    fn decode(&self, data: Bytes) -> anyhow::Result<Bytes>;
}

/// The lower pipe end, seen by the pump loops as the external object
struct LowerEnd<T: LayerTransform> {
    lower: PipeEndStream,
    transform: T,
}

#[async_trait]
impl<T: LayerTransform> WrappedObject for LowerEnd<T> {
    fn supports_stream(&self) -> bool {
        true
    }

    fn supports_datagram(&self) -> bool {
        true
    }

    async fn stream_write_to_object(&self, chunks: Vec<Bytes>) -> anyhow::Result<()> {
        for chunk in chunks {
            let encoded = self.transform.encode(chunk)?;
            self.lower.send_bytes(encoded).await?;
        }
        Ok(())
    }

    async fn stream_read_from_object(&self, max_len: usize) -> anyhow::Result<Option<Bytes>> {
        let data = self.lower.receive(max_len).await?;
        if data.is_empty() {
            // end of the lower stream, passed on undecoded
            return Ok(Some(data));
        }
        Ok(Some(self.transform.decode(data)?))
    }

    async fn datagram_write_to_object(&self, datagrams: Vec<Datagram>) -> anyhow::Result<()> {
        for datagram in datagrams {
            let data = self.transform.encode(datagram.data)?;
            self.lower.send_datagram(Datagram::new(data, datagram.endpoint)).await?;
        }
        Ok(())
    }

    async fn datagram_read_from_object(&self) -> anyhow::Result<Option<Datagram>> {
        match self.lower.receive_datagram().await? {
            Some(datagram) => {
                let data = self.transform.decode(datagram.data)?;
                Ok(Some(Datagram::new(data, datagram.endpoint)))
            }
            None => Ok(None),
        }
    }

    async fn close(&self) {
        self.lower.flush();
        self.lower.end().disconnect(None);
    }
}

/// A layer that sits between two pipes and applies a [LayerTransform] to stream data and
///  datagrams in both directions
pub struct MiddleLayer<T: LayerTransform> {
    base: StackBase,
    pump: ObjectWrapper<LowerEnd<T>>,
}

impl<T: LayerTransform> MiddleLayer<T> {
    /// Stack a new layer on `lower` and start pumping. Must be called from within a tokio
    ///  runtime.
    pub fn new(lower: PipeEnd, upper: Option<PipeEnd>, transform: T) -> WireResult<MiddleLayer<T>> {
        let base = StackBase::middle(lower, upper)?;
        let lower = base.lower()
            .ok_or(WireError::NotAttached)?
            .stream(true)?;

        let pump = ObjectWrapper::new(LowerEnd { lower, transform }, base.upper().end().clone());
        pump.start();
        Ok(MiddleLayer { base, pump })
    }

    pub fn transform(&self) -> &T {
        &self.pump.object().transform
    }

    pub fn upper_exit(&self) -> PipeEnd {
        self.base.upper_exit()
    }

    pub fn layer_info(&self) -> &LayerInfoHierarchy {
        self.base.layer_info()
    }

    pub fn base(&self) -> &StackBase {
        &self.base
    }

    pub async fn close(&self) {
        self.pump.close().await
    }
}

impl<T: LayerTransform> Drop for MiddleLayer<T> {
    fn drop(&mut self) {
        self.pump.disconnect(None);
    }
}
