use std::sync::Arc;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, CommonState, ServerConfig};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::{client, server, TlsAcceptor, TlsConnector};
use tracing::{debug, info};
use crate::error::{WireError, WireResult};
use crate::layer_info::{LayerInfoHierarchy, LayerPosition, TlsLayerInfo};
use crate::pipe::{PipeByteStream, PipeEnd};
use crate::pump::{ByteStreamWrapper, ObjectWrapper};
use crate::stack::base::StackBase;

/// Client side of a TLS layer: plaintext in the upper pipe, TLS records in the lower one
pub struct TlsClientLayer {
    base: StackBase,
    pump: ObjectWrapper<ByteStreamWrapper<client::TlsStream<PipeByteStream>>>,
}

impl TlsClientLayer {
    /// Stack a TLS layer on `lower` and run the client handshake. If the handshake fails, the
    ///  stack is disconnected with the handshake error.
    pub async fn connect(lower: PipeEnd, upper: Option<PipeEnd>, config: Arc<ClientConfig>, server_name: &str) -> WireResult<TlsClientLayer> {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|_| WireError::InvalidArgument("not a valid TLS server name"))?;

        let base = StackBase::middle(lower, upper)?;
        let io = lower_byte_stream(&base)?;
        let stream = match TlsConnector::from(config).connect(name, io).await {
            Ok(stream) => stream,
            Err(e) => return Err(handshake_failed(&base, e)),
        };

        let info = tls_info(stream.get_ref().1, false, Some(server_name.to_string()));
        info!(pipe_id = %base.upper().end().pipe().id(), ?info, "tls client handshake complete");
        base.upper().set_layer_info(info, LayerPosition::Top);

        let pump = start_pump(&base, stream);
        Ok(TlsClientLayer { base, pump })
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

impl Drop for TlsClientLayer {
    fn drop(&mut self) {
        self.pump.disconnect(None);
    }
}

/// Server side of a TLS layer
pub struct TlsServerLayer {
    base: StackBase,
    pump: ObjectWrapper<ByteStreamWrapper<server::TlsStream<PipeByteStream>>>,
}

impl TlsServerLayer {
    /// Stack a TLS layer on `lower` and run the server handshake. If the handshake fails, the
    ///  stack is disconnected with the handshake error.
    pub async fn accept(lower: PipeEnd, upper: Option<PipeEnd>, config: Arc<ServerConfig>) -> WireResult<TlsServerLayer> {
        let base = StackBase::middle(lower, upper)?;
        let io = lower_byte_stream(&base)?;
        let stream = match TlsAcceptor::from(config).accept(io).await {
            Ok(stream) => stream,
            Err(e) => return Err(handshake_failed(&base, e)),
        };

        let connection = stream.get_ref().1;
        let server_name = connection.server_name().map(|name| name.to_string());
        let info = tls_info(connection, true, server_name);
        info!(pipe_id = %base.upper().end().pipe().id(), ?info, "tls server handshake complete");
        base.upper().set_layer_info(info, LayerPosition::Top);

        let pump = start_pump(&base, stream);
        Ok(TlsServerLayer { base, pump })
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

impl Drop for TlsServerLayer {
    fn drop(&mut self) {
        self.pump.disconnect(None);
    }
}

fn lower_byte_stream(base: &StackBase) -> WireResult<PipeByteStream> {
    let lower = base.lower().ok_or(WireError::NotAttached)?;
    Ok(PipeByteStream::new(lower.end().clone()))
}

fn handshake_failed(base: &StackBase, e: std::io::Error) -> WireError {
    let e = WireError::from(e);
    debug!(pipe_id = %base.upper().end().pipe().id(), error = ?e, "tls handshake failed");
    base.disconnect(Some(e.clone()));
    e
}

fn tls_info(state: &CommonState, is_server: bool, server_name: Option<String>) -> TlsLayerInfo {
    TlsLayerInfo {
        is_server,
        protocol_version: state.protocol_version().map(|v| format!("{:?}", v)),
        cipher_suite: state.negotiated_cipher_suite().map(|s| format!("{:?}", s.suite())),
        server_name,
        alpn_protocol: state.alpn_protocol().map(|p| p.to_vec()),
    }
}

fn start_pump<S>(base: &StackBase, stream: S) -> ObjectWrapper<ByteStreamWrapper<S>>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let config = base.upper().end().pipe().config();
    let wrapper = ByteStreamWrapper::new(stream)
        .with_read_timeout(config.stream_receive_timeout)
        .with_write_timeout(config.stream_send_timeout);

    let pump = ObjectWrapper::new(wrapper, base.upper().end().clone());
    pump.start();
    pump
}
