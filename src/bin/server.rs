//! UDPFT 서버 (수신자)
//!
//! 핸드쉐이크를 받을 때마다 수신자를 띄워 root-dir 에 저장한다.
//! --dry-run 이면 받은 데이터를 버린다.
//!
//! 사용법:
//!   cargo run --release --bin udpft-server -- <PORT> [OPTIONS]
//!
//! 예시:
//!   cargo run --release --bin udpft-server -- 9000 --root-dir ./incoming
//!   cargo run --release --bin udpft-server -- 9000 --dry-run --send-window-size 32

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use udpft::{Config, DiscardSink, FileSink, ReceiveServer, SessionSocket, TransferSink};

/// Receive files over UDPFT.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Port to listen on
    port: u16,

    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Discard received data
    #[arg(long)]
    dry_run: bool,

    /// Directory for received files
    #[arg(long, default_value = ".")]
    root_dir: PathBuf,

    /// Window advertised to senders
    #[arg(long, default_value_t = 10)]
    send_window_size: u8,

    /// Accept handshakes with a bad checksum (warn only)
    #[arg(long)]
    ignore_checksum: bool,

    /// Log filter (overridden by RUST_LOG)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let config = Config {
        receive_window: cli.send_window_size,
        ignore_handshake_checksum: cli.ignore_checksum,
        ..Config::default()
    };

    let sink: Arc<dyn TransferSink> = if cli.dry_run {
        info!("Dry run: received data is discarded");
        Arc::new(DiscardSink)
    } else {
        tokio::fs::create_dir_all(&cli.root_dir).await?;
        info!("Saving to {}", cli.root_dir.display());
        Arc::new(FileSink::new(&cli.root_dir))
    };

    let bind: SocketAddr = tokio::net::lookup_host((cli.host.as_str(), cli.port))
        .await?
        .next()
        .ok_or("bind address did not resolve")?;
    let socket = Arc::new(SessionSocket::bind(bind, config.inbound_queue).await?);
    info!("Listening on {}", socket.local_addr()?);

    let server = ReceiveServer::new(socket.clone(), sink, config);

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            socket.close();
        }
    }

    Ok(())
}
