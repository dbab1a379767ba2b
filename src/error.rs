use std::sync::Arc;
use std::time::Duration;

pub type WireResult<T> = Result<T, WireError>;

/// All errors surfaced by buffers, pipes and pump loops.
///
/// NB: This is `Clone` because the exception queue of a pipe remembers the first error and hands
///      it out again on every later disconnect check
#[derive(Debug, Clone, thiserror::Error)]
pub enum WireError {
    /// The buffer or pipe does not accept new data any more. This is the regular way for a
    ///  connection to end and not a failure in itself.
    #[error("disconnected")]
    Disconnected,

    #[error("pin range [{start}, {start}+{len}) is outside of the buffered range [{head}, {tail}]")]
    Range {
        start: u64,
        len: u64,
        head: u64,
        tail: u64,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("timeout after {0:?}")]
    Timeout(Duration),

    #[error("pipe end is already attached")]
    AlreadyAttached,

    #[error("pipe end is not attached")]
    NotAttached,

    #[error("transport error: {0:#}")]
    Transport(Arc<anyhow::Error>),
}

impl WireError {
    /// Wrap an error from outside the core. Errors that already are a `WireError` are passed on
    ///  unchanged.
    pub fn transport(e: impl Into<anyhow::Error>) -> WireError {
        match e.into().downcast::<WireError>() {
            Ok(e) => e,
            Err(e) => WireError::Transport(Arc::new(e)),
        }
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self, WireError::Disconnected)
    }
}

impl From<std::io::Error> for WireError {
    fn from(e: std::io::Error) -> Self {
        if let Some(wire) = e.get_ref().and_then(|inner| inner.downcast_ref::<WireError>()) {
            return wire.clone();
        }
        WireError::transport(e)
    }
}

impl From<WireError> for std::io::Error {
    fn from(e: WireError) -> Self {
        use std::io::ErrorKind;

        let kind = match &e {
            WireError::Disconnected => ErrorKind::BrokenPipe,
            WireError::Timeout(_) => ErrorKind::TimedOut,
            WireError::Range { .. } | WireError::InvalidArgument(_) => ErrorKind::InvalidInput,
            _ => ErrorKind::Other,
        };
        std::io::Error::new(kind, e)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::disconnected(WireError::Disconnected, std::io::ErrorKind::BrokenPipe)]
    #[case::timeout(WireError::Timeout(Duration::from_millis(5)), std::io::ErrorKind::TimedOut)]
    #[case::range(WireError::Range { start: 1, len: 2, head: 3, tail: 4 }, std::io::ErrorKind::InvalidInput)]
    #[case::invalid(WireError::InvalidArgument("x"), std::io::ErrorKind::InvalidInput)]
    #[case::transport(WireError::transport(anyhow::anyhow!("boom")), std::io::ErrorKind::Other)]
    fn test_io_error_kind(#[case] e: WireError, #[case] expected: std::io::ErrorKind) {
        let io: std::io::Error = e.into();
        assert_eq!(io.kind(), expected);
    }

    #[test]
    fn test_wire_errors_pass_through() {
        let e = WireError::transport(anyhow::Error::new(WireError::Timeout(Duration::from_secs(1))));
        assert!(matches!(e, WireError::Timeout(_)));

        let io: std::io::Error = WireError::AlreadyAttached.into();
        assert!(matches!(WireError::from(io), WireError::AlreadyAttached));
    }

    #[test]
    fn test_transport_display_includes_cause() {
        let e = WireError::transport(anyhow::anyhow!("connection reset"));
        assert!(e.to_string().contains("connection reset"));
    }
}
