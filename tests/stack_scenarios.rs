use std::time::Duration;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::runtime::Builder;
use vwire::config::WireConfig;
use vwire::error::WireError;
use vwire::layer_info::{IpLayerInfo, TcpLayerInfo};
use vwire::pipe::Pipe;
use vwire::stack::{AppStub, LayerTransform, MiddleLayer, TcpListenerStub, TcpStub};

#[tokio::test]
async fn hello_then_disconnect() {
    let pipe = Pipe::new(WireConfig::default());
    let a = pipe.end_a().attach().unwrap();
    let b = pipe.end_b().attach().unwrap();

    let writer = a.stream(false).unwrap();
    writer.fast_send(vec![Bytes::from_static(b"hello")]).unwrap();
    writer.flush();

    let reader = b.stream(true).unwrap();
    assert_eq!(reader.receive(5).await.unwrap().as_ref(), b"hello");

    a.end().disconnect(None);
    assert!(reader.receive(5).await.unwrap().is_empty());
    assert!(matches!(b.end().check_disconnected(), Err(WireError::Disconnected)));
}

#[test]
fn idle_receive_times_out() {
    Builder::new_current_thread()
        .enable_all()
        .start_paused(true)
        .build()
        .unwrap()
        .block_on(async {
            let pipe = Pipe::new(WireConfig::default());
            let handle = pipe.end_b().attach().unwrap();
            handle.set_stream_receive_timeout(Some(Duration::from_millis(100))).unwrap();

            tokio::time::sleep(Duration::from_millis(99)).await;
            assert!(!pipe.is_disconnected());

            tokio::time::timeout(Duration::from_secs(1), pipe.wait_disconnected()).await.unwrap();
            assert!(matches!(pipe.exceptions().first(), Some(WireError::Timeout(_))));
        });
}

/// Swaps the case of ASCII letters
struct SwapCase;

impl LayerTransform for SwapCase {
    fn encode(&self, data: Bytes) -> anyhow::Result<Bytes> {
        Ok(data.iter()
            .map(|b| if b.is_ascii_alphabetic() { b ^ 0x20 } else { *b })
            .collect())
    }

    fn decode(&self, data: Bytes) -> anyhow::Result<Bytes> {
        self.encode(data)
    }
}

#[tokio::test]
async fn tcp_middle_layer_and_app() {
    let listener = TcpListenerStub::listen("127.0.0.1:0", WireConfig::default()).await.unwrap();
    let addr = listener.local_addr().unwrap();

    let client_tcp = TcpStub::new(None, WireConfig::default()).unwrap();
    client_tcp.connect(addr).await.unwrap();
    let client_layer = MiddleLayer::new(client_tcp.upper_exit(), None, SwapCase).unwrap();
    let client = AppStub::new(client_layer.upper_exit()).unwrap();

    let server_tcp = listener.accept().await.unwrap();
    let server = AppStub::new(server_tcp.upper_exit()).unwrap();

    // the layer info of the tcp layer is visible from the top of the stack
    assert_eq!(client.layer_info().layer_names(), vec!["ip", "tcp"]);
    assert!(client.layer_info().get_value::<IpLayerInfo>(0).unwrap().remote_ip.is_loopback());
    assert_eq!(client.layer_info().get_value::<TcpLayerInfo>(0).unwrap().remote_port, addr.port());

    client.stream().unwrap().send(b"Hello, Server").await.unwrap();
    let received = server.stream().unwrap().receive_exact(13).await.unwrap();
    assert_eq!(received.as_ref(), b"hELLO, sERVER");

    server.stream().unwrap().send(b"SHOUT").await.unwrap();
    assert_eq!(client.stream().unwrap().receive_exact(5).await.unwrap().as_ref(), b"shout");

    // closing the server's connection ends the client's whole stack
    server_tcp.close().await;
    assert!(client.stream().unwrap().receive(10).await.unwrap().is_empty());
    tokio::time::timeout(Duration::from_secs(5), client_tcp.base().wait_disconnected()).await.unwrap();
    assert!(client_layer.base().is_disconnected());
}

#[tokio::test]
async fn plain_socket_peer() {
    let listener = TcpListenerStub::listen("127.0.0.1:0", WireConfig::default()).await.unwrap();
    let mut peer = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
    let tcp = listener.accept().await.unwrap();
    let app = AppStub::new(tcp.upper_exit()).unwrap();

    peer.write_all(b"ping").await.unwrap();
    let stream = app.stream().unwrap();
    let ping = stream.receive_exact(4).await.unwrap();
    stream.send_bytes(ping).await.unwrap();

    let mut buf = [0u8; 4];
    peer.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    drop(tcp);
    let mut rest = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), peer.read_to_end(&mut rest)).await.unwrap().unwrap();
    assert!(app.is_disconnected());
}
