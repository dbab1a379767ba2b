use std::net::SocketAddr;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tracing::{debug, info};
use crate::config::WireConfig;
use crate::error::{WireError, WireResult};
use crate::layer_info::{LayerInfoHierarchy, LayerPosition, TcpLayerInfo};
use crate::pipe::PipeEnd;
use crate::pump::{ObjectWrapper, SocketWrapper};
use crate::stack::base::StackBase;

type TcpPump = ObjectWrapper<SocketWrapper<TcpStream>>;

/// The bottom layer of a stack: pumps a TCP connection's bytes into its upper pipe end.
///
/// Dropping the stub closes the connection.
pub struct TcpStub {
    base: StackBase,
    config: WireConfig,
    pump: Mutex<Option<TcpPump>>,
}

impl TcpStub {
    pub fn new(upper: Option<PipeEnd>, config: WireConfig) -> WireResult<TcpStub> {
        Ok(TcpStub {
            base: StackBase::bottom(upper, &config)?,
            config,
            pump: Mutex::new(None),
        })
    }

    /// Connect to `addr`, giving up after the config's `tcp_connect_timeout`
    pub async fn connect(&self, addr: impl ToSocketAddrs) -> WireResult<()> {
        let timeout = self.config.tcp_connect_timeout;
        let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(stream) => stream?,
            Err(_) => return Err(WireError::Timeout(timeout)),
        };
        self.attach_socket(stream)
    }

    /// Start pumping an already connected socket, e.g. one that was accepted by a listener
    pub fn attach_socket(&self, socket: TcpStream) -> WireResult<()> {
        let mut pump = self.pump.lock();
        if pump.is_some() {
            return Err(WireError::InvalidArgument("tcp stub is already connected"));
        }
        self.base.upper().end().check_disconnected()?;

        let local = socket.local_addr()?;
        let remote = socket.peer_addr()?;
        socket.set_nodelay(true)?;

        let (ip_info, tcp_info) = TcpLayerInfo::for_socket(local, remote);
        let upper = self.base.upper();
        let ip_id = upper.set_layer_info(ip_info, LayerPosition::Bottom);
        upper.set_layer_info(tcp_info, LayerPosition::Above(ip_id));

        let wrapper = ObjectWrapper::new(SocketWrapper::new(socket), upper.end().clone());
        wrapper.start();
        *pump = Some(wrapper);

        info!(pipe_id = %upper.end().pipe().id(), %local, %remote, "tcp connection established");
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.pump.lock().is_some() && !self.base.is_disconnected()
    }

    /// The end for the next layer up
    pub fn upper_exit(&self) -> PipeEnd {
        self.base.upper_exit()
    }

    pub fn layer_info(&self) -> &LayerInfoHierarchy {
        self.base.layer_info()
    }

    pub fn base(&self) -> &StackBase {
        &self.base
    }

    /// Disconnect the stack and wait until the socket is shut down
    pub async fn close(&self) {
        let pump = self.pump.lock().clone();
        match pump {
            Some(pump) => pump.close().await,
            None => self.base.disconnect(None),
        }
    }
}

impl Drop for TcpStub {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.disconnect(None);
        }
    }
}

/// Accepts TCP connections, each becoming the bottom of a new stack
pub struct TcpListenerStub {
    listener: TcpListener,
    config: WireConfig,
}

impl TcpListenerStub {
    pub async fn listen(addr: impl ToSocketAddrs, config: WireConfig) -> WireResult<TcpListenerStub> {
        let listener = TcpListener::bind(addr).await?;
        debug!(addr = ?listener.local_addr().ok(), "listening");
        Ok(TcpListenerStub { listener, config })
    }

    pub fn local_addr(&self) -> WireResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// The next incoming connection, in a stub with a pipe of its own
    pub async fn accept(&self) -> WireResult<TcpStub> {
        let (socket, remote) = self.listener.accept().await?;
        debug!(%remote, "accepted tcp connection");

        let stub = TcpStub::new(None, self.config.clone())?;
        stub.attach_socket(socket)?;
        Ok(stub)
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use crate::layer_info::IpLayerInfo;
    use super::*;

    #[tokio::test]
    async fn test_connect_installs_layer_info() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let stub = TcpStub::new(None, WireConfig::default()).unwrap();
        stub.connect(addr).await.unwrap();
        let (mut server, _) = listener.accept().await.unwrap();
        assert!(stub.is_connected());

        assert_eq!(stub.layer_info().layer_names(), vec!["ip", "tcp"]);
        let ip = stub.layer_info().get_value::<IpLayerInfo>(0).unwrap();
        assert_eq!(ip.remote_ip, IpAddr::V4(Ipv4Addr::LOCALHOST));
        let tcp = stub.layer_info().get_value::<TcpLayerInfo>(0).unwrap();
        assert_eq!(tcp.remote_port, addr.port());

        let app = stub.upper_exit().attach().unwrap();
        let stream = app.stream(true).unwrap();
        stream.send(b"abc").await.unwrap();
        let mut buf = [0u8; 3];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abc");

        stub.close().await;
        assert!(!stub.is_connected());
        let mut rest = Vec::new();
        server.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let stub = TcpStub::new(None, WireConfig::default()).unwrap();
        assert!(matches!(stub.connect(addr).await, Err(WireError::Transport(_))));
        assert!(!stub.is_connected());
    }

    #[tokio::test]
    async fn test_listener_accepts_stacks() {
        let listener = TcpListenerStub::listen("127.0.0.1:0", WireConfig::default()).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        let stub = listener.accept().await.unwrap();
        let tcp = stub.layer_info().get_value::<TcpLayerInfo>(0).unwrap();
        assert_eq!(tcp.local_port, addr.port());
        assert_eq!(tcp.remote_port, client.local_addr().unwrap().port());

        let app = stub.upper_exit().attach().unwrap();
        let stream = app.stream(true).unwrap();
        client.write_all(b"incoming").await.unwrap();
        assert_eq!(stream.receive_exact(8).await.unwrap().as_ref(), b"incoming");

        drop(client);
        assert!(stream.receive(10).await.unwrap().is_empty());
        tokio::time::timeout(Duration::from_secs(5), stub.base().wait_disconnected()).await.unwrap();
    }

    #[tokio::test]
    async fn test_second_socket_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let stub = TcpStub::new(None, WireConfig::default()).unwrap();
        stub.connect(addr).await.unwrap();
        let other = TcpStream::connect(addr).await.unwrap();
        assert!(matches!(stub.attach_socket(other), Err(WireError::InvalidArgument(_))));
    }
}
