use tracing::debug;
use crate::buffer::ExceptionQueue;
use crate::config::WireConfig;
use crate::error::{WireError, WireResult};
use crate::layer_info::LayerInfoHierarchy;
use crate::pipe::{AttachHandle, Pipe, PipeEnd, WeakPipe};

/// The pipe ends a protocol layer owns: bottom-most layers (e.g. TCP) only have an upper end,
///  middle layers (e.g. TLS) sit between a lower and an upper end.
///
/// A layer attaches to its lower end as the pipe's B side and to its upper end as the A side.
///  The pipes on both sides share one exception queue and one layer info hierarchy, and a
///  disconnect on either side is passed on to the other.
pub struct StackBase {
    lower: Option<AttachHandle>,
    upper: AttachHandle,
}

impl StackBase {
    /// A bottom-most layer. If no upper end is passed in, a new pipe is created.
    pub fn bottom(upper: Option<PipeEnd>, config: &WireConfig) -> WireResult<StackBase> {
        let upper = upper.unwrap_or_else(|| Pipe::new(config.clone()).end_a());
        Ok(StackBase {
            lower: None,
            upper: upper.attach_layer()?,
        })
    }

    /// A middle layer on top of `lower`. If no upper end is passed in, a new pipe with the lower
    ///  pipe's config is created.
    pub fn middle(lower: PipeEnd, upper: Option<PipeEnd>) -> WireResult<StackBase> {
        let upper = upper.unwrap_or_else(|| Pipe::new(lower.pipe().config().clone()).end_a());
        if upper.pipe().is_same(lower.pipe()) {
            return Err(WireError::InvalidArgument("a layer's lower and upper end must belong to different pipes"));
        }

        let lower = lower.attach_layer()?;
        let upper = upper.attach_layer()?;

        upper.end().layer_info().encounter(lower.end().layer_info());
        upper.end().exceptions().encounter(lower.end().exceptions());

        cascade_disconnect(lower.end().pipe(), upper.end().pipe().downgrade());
        cascade_disconnect(upper.end().pipe(), lower.end().pipe().downgrade());

        debug!(lower = %lower.end().pipe().id(), upper = %upper.end().pipe().id(), "stacked layer");
        Ok(StackBase {
            lower: Some(lower),
            upper,
        })
    }

    pub fn lower(&self) -> Option<&AttachHandle> {
        self.lower.as_ref()
    }

    pub fn upper(&self) -> &AttachHandle {
        &self.upper
    }

    /// The end the next layer up (or the application) attaches to
    pub fn upper_exit(&self) -> PipeEnd {
        self.upper.end().counterpart()
    }

    pub fn exceptions(&self) -> &ExceptionQueue {
        self.upper.end().exceptions()
    }

    pub fn layer_info(&self) -> &LayerInfoHierarchy {
        self.upper.end().layer_info()
    }

    pub fn is_disconnected(&self) -> bool {
        self.upper.end().is_disconnected()
    }

    /// Disconnect the layer, and through the cascade the whole stack
    pub fn disconnect(&self, error: Option<WireError>) {
        self.upper.end().disconnect(error);
    }

    pub async fn wait_disconnected(&self) {
        self.upper.end().pipe().wait_disconnected().await
    }
}

fn cascade_disconnect(from: &Pipe, to: WeakPipe) {
    from.on_disconnect(move || {
        if let Some(pipe) = to.upgrade() {
            pipe.disconnect(None);
        }
    });
}
