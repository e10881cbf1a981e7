//! UDPFT 클라이언트 (송신자)
//!
//! 파일 하나를 서버로 보낸다. --dry-run 이면 지정한 크기의 난수를 보낸다.
//!
//! 사용법:
//!   cargo run --release --bin udpft-client -- <HOST> <PORT> [FILE] [OPTIONS]
//!
//! 예시:
//!   # 파일 전송
//!   cargo run --release --bin udpft-client -- 127.0.0.1 9000 report.pdf
//!
//!   # 100MB 난수 전송, 윈도우 1
//!   cargo run --release --bin udpft-client -- 127.0.0.1 9000 --dry-run 104857600 --stop-and-wait

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use udpft::{Config, RandomFill, Sender, SessionId, SessionSocket};

/// Send a file over UDPFT.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Server host name or address
    host: String,

    /// Server port
    port: u16,

    /// File to send (required unless --dry-run)
    file: Option<PathBuf>,

    /// Window of one: wait for every packet's ack
    #[arg(long)]
    stop_and_wait: bool,

    /// Allow transfer names up to 65535 bytes (default 32767)
    #[arg(long)]
    unsigned_extended: bool,

    /// Use this session id instead of a random one
    #[arg(long)]
    session_id: Option<SessionId>,

    /// Send this many random bytes instead of a file
    #[arg(long, value_name = "SIZE")]
    dry_run: Option<u64>,

    /// Upper bound for the advertised window
    #[arg(long)]
    window: Option<u16>,

    /// Log filter (overridden by RUST_LOG)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// 전송 이름 허용 문자
fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || "äöüßÄÖÜ_.-[]".contains(c)
}

fn transfer_name(file: Option<&Path>) -> Result<String, String> {
    let Some(file) = file else {
        return Ok("dry-run".to_string());
    };
    let name = file
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| format!("invalid file name: {}", file.display()))?;
    if name.is_empty() || !name.chars().all(is_name_char) {
        return Err(format!(
            "file name {name:?} must match [A-Za-z0-9äöüßÄÖÜ_.\\-\\[\\]]+"
        ));
    }
    Ok(name.to_string())
}

async fn resolve(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, host.to_string()))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let name = transfer_name(cli.file.as_deref())?;

    let mut config = if cli.stop_and_wait {
        Config::stop_and_wait()
    } else {
        Config::default()
    };
    if let Some(window) = cli.window {
        if !cli.stop_and_wait {
            config.max_window = window;
        }
    }
    config.extended_names = cli.unsigned_extended;

    let target = resolve(&cli.host, cli.port).await?;
    let bind: SocketAddr = if target.is_ipv6() {
        "[::]:0".parse()?
    } else {
        "0.0.0.0:0".parse()?
    };

    let socket = Arc::new(SessionSocket::bind(bind, config.inbound_queue).await?);
    info!("Bound {} -> {}", socket.local_addr()?, target);

    let listener = {
        let socket = socket.clone();
        tokio::spawn(async move { socket.listen().await })
    };

    // 이 소켓으로 새 전송이 들어올 일은 없다
    if let Some(mut unsessioned) = socket.unsessioned() {
        tokio::spawn(async move {
            while let Some(datagram) = unsessioned.recv().await {
                warn!(
                    "Unexpected packet from {} (session {:?}, {} bytes)",
                    datagram.source,
                    datagram.session_id(),
                    datagram.data.len()
                );
            }
        });
    }

    let session = socket.register_session(target, cli.session_id)?;
    info!("Session {} registered", session.id());

    let result = if let Some(size) = cli.dry_run {
        let sender = Sender::new(config, session, name, size)?;
        sender.run(RandomFill::new(size)).await
    } else if let Some(path) = cli.file.as_ref() {
        let file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();
        let sender = Sender::new(config, session, name, size)?;
        sender.run(file).await
    } else {
        return Err("either FILE or --dry-run <SIZE> is required".into());
    };

    socket.close();
    if let Err(e) = listener.await? {
        warn!("Listener ended with error: {}", e);
    }

    match result {
        Ok(stats) => {
            info!("Done: {}", stats.summary());
            Ok(())
        }
        Err(e) => {
            error!("Transfer failed: {}", e);
            Err(e.into())
        }
    }
}
