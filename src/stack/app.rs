use crate::buffer::ExceptionQueue;
use crate::error::{WireError, WireResult};
use crate::layer_info::LayerInfoHierarchy;
use crate::pipe::{AttachHandle, PipeEnd, PipeEndStream};

/// The application's end of a stack. Unlike stack layers, it is subject to the config's stream
///  timeouts.
pub struct AppStub {
    handle: AttachHandle,
}

impl AppStub {
    pub fn new(end: PipeEnd) -> WireResult<AppStub> {
        Ok(AppStub {
            handle: end.attach()?,
        })
    }

    pub fn handle(&self) -> &AttachHandle {
        &self.handle
    }

    /// The auto-flushing stream facade
    pub fn stream(&self) -> WireResult<PipeEndStream> {
        self.handle.stream(true)
    }

    /// Metadata of every layer below
    pub fn layer_info(&self) -> &LayerInfoHierarchy {
        self.handle.end().layer_info()
    }

    pub fn exceptions(&self) -> &ExceptionQueue {
        self.handle.end().exceptions()
    }

    pub fn is_disconnected(&self) -> bool {
        self.handle.end().is_disconnected()
    }

    pub fn disconnect(&self, error: Option<WireError>) {
        self.handle.end().disconnect(error)
    }

    pub async fn wait_disconnected(&self) {
        self.handle.end().pipe().wait_disconnected().await
    }
}
