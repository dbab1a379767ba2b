use std::time::Duration;
use anyhow::bail;

/// Tuning knobs for pipes, pump loops and the TCP stub.
#[derive(Debug, Clone)]
pub struct WireConfig {
    /// High-water mark of a stream buffer in bytes. A writer is considered 'ready to write' while
    ///  the buffer holds at most this many bytes, so a single write can overshoot it.
    pub stream_threshold: usize,

    /// High-water mark of a datagram buffer, counted in datagrams (not bytes)
    pub datagram_threshold: usize,

    /// Upper bound for every wait on a readiness event. Waits are re-evaluated at least this
    ///  often even if nobody signals the event, which is what lets a pipe whose counterpart
    ///  lives in a different layer make progress.
    pub polling_timeout: Duration,

    pub tcp_connect_timeout: Duration,

    /// `None` means no timeout
    pub stream_receive_timeout: Option<Duration>,
    /// `None` means no timeout
    pub stream_send_timeout: Option<Duration>,

    /// Maximum number of bytes a pump loop requests from the external object in a single read
    pub receive_chunk_size: usize,

    /// Maximum number of segments (or datagrams) a pump loop drains from the pipe for a single
    ///  write to the external object
    pub max_segments_per_write: usize,
}

impl Default for WireConfig {
    fn default() -> Self {
        WireConfig {
            stream_threshold: 512 * 1024,
            datagram_threshold: 65536,
            polling_timeout: Duration::from_secs(1),
            tcp_connect_timeout: Duration::from_secs(15),
            stream_receive_timeout: None,
            stream_send_timeout: None,
            receive_chunk_size: 64 * 1024,
            max_segments_per_write: 1024,
        }
    }
}

impl WireConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.stream_threshold == 0 {
            bail!("stream threshold must be positive");
        }
        if self.datagram_threshold == 0 {
            bail!("datagram threshold must be positive");
        }
        if self.polling_timeout.is_zero() {
            bail!("polling timeout must be positive");
        }
        if self.receive_chunk_size == 0 {
            bail!("receive chunk size must be positive");
        }
        if self.max_segments_per_write == 0 {
            bail!("max segments per write must be positive");
        }
        Ok(())
    }
}
