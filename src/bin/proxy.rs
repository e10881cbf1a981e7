//! UDPFT 장애 주입 프록시
//!
//! 클라이언트와 서버 사이에서 패킷을 드롭/복제/지연시킨다.
//!
//! 사용법:
//!   cargo run --release --bin udpft-proxy -- <PORT> <TARGET_HOST> <TARGET_PORT> [OPTIONS]
//!
//! 예시:
//!   # 20% 손실, 복제 없음
//!   cargo run --release --bin udpft-proxy -- 9001 127.0.0.1 9000 --drop-chance 0.2 --duplicate-chance 0

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use udpft::{Config, Error, FaultProxy, ProxyConfig, SessionSocket};

/// Relay UDPFT sessions while dropping, duplicating and delaying packets.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Port to listen on
    port: u16,

    /// Server host
    target_host: String,

    /// Server port
    target_port: u16,

    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Probability of dropping a packet
    #[arg(long, default_value_t = 0.1)]
    drop_chance: f64,

    /// Probability of sending a packet twice
    #[arg(long, default_value_t = 0.1)]
    duplicate_chance: f64,

    /// Base delay in milliseconds
    #[arg(long, default_value_t = 10.0)]
    delay: f64,

    /// Jitter in milliseconds (delay ± jitter)
    #[arg(long, default_value_t = 2.0)]
    jitter: f64,

    /// Log filter (overridden by RUST_LOG)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn millis(flag: &str, value: f64) -> Result<Duration, Error> {
    Duration::try_from_secs_f64(value.max(0.0) / 1000.0)
        .map_err(|_| Error::InvalidConfig(format!("--{flag} must be a finite number, got {value}")))
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

    let config = ProxyConfig {
        drop_chance: cli.drop_chance,
        duplicate_chance: cli.duplicate_chance,
        delay: millis("delay", cli.delay)?,
        jitter: millis("jitter", cli.jitter)?,
        ..ProxyConfig::default()
    };

    let bind = resolve(&cli.host, cli.port).await?;
    let backend = resolve(&cli.target_host, cli.target_port).await?;

    let socket = Arc::new(SessionSocket::bind(bind, Config::default().inbound_queue).await?);
    let proxy = FaultProxy::new(socket.clone(), backend, config)?;

    tokio::select! {
        result = proxy.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            let stats = proxy.stats();
            info!(
                "Shutting down: forwarded={} dropped={} duplicated={} active_pairs={}",
                stats.forwarded,
                stats.dropped,
                stats.duplicated,
                proxy.active_pairs()
            );
            socket.close();
        }
    }

    Ok(())
}
