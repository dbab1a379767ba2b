use std::net::SocketAddr;
use std::time::Duration;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn, Level};
use vwire::config::WireConfig;
use vwire::layer_info::TcpLayerInfo;
use vwire::stack::{AppStub, TcpListenerStub, TcpStub};

#[derive(Parser)]
struct Args {
    #[command(subcommand)]
    mode: Mode,

    /// Disconnect connections that receive nothing for this many seconds
    #[clap(long)]
    idle_timeout_secs: Option<u64>,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Mode {
    /// Echo everything received on accepted connections
    Server { addr: SocketAddr },
    /// Send lines from stdin to an echo server and print the replies
    Client { addr: SocketAddr },
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose { Level::DEBUG } else { Level::INFO })
        .try_init()
        .ok();

    let config = WireConfig {
        stream_receive_timeout: args.idle_timeout_secs.map(Duration::from_secs),
        ..WireConfig::default()
    };
    config.validate()?;

    match args.mode {
        Mode::Server { addr } => run_server(addr, config).await,
        Mode::Client { addr } => run_client(addr, config).await,
    }
}

async fn run_server(addr: SocketAddr, config: WireConfig) -> anyhow::Result<()> {
    let listener = TcpListenerStub::listen(addr, config).await?;
    info!("echo server listening on {}", listener.local_addr()?);

    loop {
        let tcp = listener.accept().await?;
        tokio::spawn(async move {
            if let Err(e) = echo(tcp).await {
                warn!("echo connection failed: {}", e);
            }
        });
    }
}

async fn echo(tcp: TcpStub) -> anyhow::Result<()> {
    let app = AppStub::new(tcp.upper_exit())?;
    if let Some(info) = app.layer_info().get_value::<TcpLayerInfo>(0) {
        info!("connection from port {}", info.remote_port);
    }

    let stream = app.stream()?;
    loop {
        let data = stream.receive(4096).await?;
        if data.is_empty() {
            break;
        }
        stream.send_bytes(data).await?;
    }

    if let Some(e) = app.exceptions().first() {
        info!("connection ended: {}", e);
    }
    Ok(())
}

async fn run_client(addr: SocketAddr, config: WireConfig) -> anyhow::Result<()> {
    let tcp = TcpStub::new(None, config)?;
    tcp.connect(addr).await?;
    let app = AppStub::new(tcp.upper_exit())?;
    let stream = app.stream()?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = format!("{}\n", line);
        stream.send(line.as_bytes()).await?;

        let reply = stream.receive_exact(line.len()).await?;
        if reply.is_empty() {
            warn!("server closed the connection");
            break;
        }
        print!("{}", String::from_utf8_lossy(&reply));
    }

    tcp.close().await;
    Ok(())
}
