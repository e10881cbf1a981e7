//! 장애 주입 프록시
//!
//! 클라이언트 세션마다 백엔드 쪽 세션을 하나 열어 양방향으로 중계한다.
//! 중계하는 패킷마다 한 번 난수를 뽑아 드롭/복제/통과를 정하고, 통과와 복제는
//! delay ± jitter 만큼 늦춰 보낸다.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use rand::Rng;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::message::SessionId;
use crate::session::{Datagram, Session, SessionSocket};
use crate::{Error, ProxyConfig, Result};

/// 패킷 하나에 적용할 장애
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    Pass,
    Drop,
    Duplicate,
}

impl Scenario {
    /// [0, 1) 난수 하나로 분류
    ///
    /// [0, drop) 드롭, [drop, drop + duplicate) 복제, 나머지 통과.
    pub fn classify(draw: f64, drop_chance: f64, duplicate_chance: f64) -> Self {
        if draw < drop_chance {
            Scenario::Drop
        } else if draw < drop_chance + duplicate_chance {
            Scenario::Duplicate
        } else {
            Scenario::Pass
        }
    }

    pub fn draw(config: &ProxyConfig) -> Self {
        let draw: f64 = rand::thread_rng().gen();
        Self::classify(draw, config.drop_chance, config.duplicate_chance)
    }
}

/// delay + uniform(-1, 1) * jitter, 0 미만은 0
pub fn sample_delay(config: &ProxyConfig) -> Duration {
    let offset = rand::thread_rng().gen_range(-1.0..=1.0) * config.jitter.as_secs_f64();
    Duration::from_secs_f64((config.delay.as_secs_f64() + offset).max(0.0))
}

/// 프록시 카운터
#[derive(Debug, Default)]
struct Counters {
    forwarded: AtomicU64,
    dropped: AtomicU64,
    duplicated: AtomicU64,
}

/// 카운터 스냅샷
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProxyStats {
    pub forwarded: u64,
    pub dropped: u64,
    pub duplicated: u64,
}

/// 중계 태스크 공용 컨텍스트
struct Relay {
    config: Arc<ProxyConfig>,
    counters: Arc<Counters>,
    idle: Arc<AtomicU32>,
}

impl Relay {
    /// 장애를 적용해 to 로 전달
    fn forward(&self, to: &Arc<Session>, payload: Bytes) {
        match Scenario::draw(&self.config) {
            Scenario::Drop => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                trace!("drop: {} bytes -> session {}", payload.len(), to.id());
            }
            Scenario::Pass => {
                self.counters.forwarded.fetch_add(1, Ordering::Relaxed);
                schedule(to.clone(), payload, sample_delay(&self.config));
            }
            Scenario::Duplicate => {
                self.counters.duplicated.fetch_add(1, Ordering::Relaxed);
                schedule(to.clone(), payload.clone(), sample_delay(&self.config));
                schedule(to.clone(), payload, sample_delay(&self.config));
            }
        }
    }
}

fn schedule(to: Arc<Session>, payload: Bytes, delay: Duration) {
    tokio::spawn(async move {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Err(e) = to.send(&payload).await {
            debug!("중계 전송 실패 session {}: {}", to.id(), e);
        }
    });
}

/// 클라이언트-백엔드 중계 쌍
struct RelayPair {
    client: Arc<Session>,
    backend: Arc<Session>,
    idle: Arc<AtomicU32>,
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for RelayPair {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        self.client.close();
        self.backend.close();
    }
}

/// 장애 주입 프록시
pub struct FaultProxy {
    socket: Arc<SessionSocket>,
    backend: SocketAddr,
    config: Arc<ProxyConfig>,
    pairs: Arc<DashMap<SessionId, RelayPair>>,
    counters: Arc<Counters>,
}

impl FaultProxy {
    /// 새 프록시 생성 (설정 검증 포함)
    pub fn new(socket: Arc<SessionSocket>, backend: SocketAddr, config: ProxyConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            socket,
            backend,
            config: Arc::new(config),
            pairs: Arc::new(DashMap::new()),
            counters: Arc::new(Counters::default()),
        })
    }

    pub fn socket(&self) -> &Arc<SessionSocket> {
        &self.socket
    }

    /// 활성 중계 쌍 수
    pub fn active_pairs(&self) -> usize {
        self.pairs.len()
    }

    pub fn stats(&self) -> ProxyStats {
        ProxyStats {
            forwarded: self.counters.forwarded.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            duplicated: self.counters.duplicated.load(Ordering::Relaxed),
        }
    }

    /// 수신 루프와 중계 쌍 생성 루프
    ///
    /// 소켓이 닫히면 모든 중계 쌍을 정리하고 반환한다.
    pub async fn run(&self) -> Result<()> {
        let mut unsessioned = self.socket.unsessioned().ok_or(Error::ChannelError)?;

        let socket = self.socket.clone();
        let mut listener = tokio::spawn(async move { socket.listen().await });

        info!(
            "프록시 시작: {} -> {} (drop={}, dup={}, delay={:?}±{:?})",
            self.socket.local_addr()?,
            self.backend,
            self.config.drop_chance,
            self.config.duplicate_chance,
            self.config.delay,
            self.config.jitter
        );

        let result = loop {
            tokio::select! {
                result = &mut listener => {
                    break result.map_err(Error::from).and_then(|r| r);
                }
                Some(datagram) = unsessioned.recv() => {
                    let source = datagram.source;
                    if let Err(e) = self.open_pair(datagram) {
                        warn!("{} 중계 쌍 생성 실패: {}", source, e);
                    }
                }
            }
        };

        self.pairs.clear();
        result
    }

    /// 새 클라이언트 세션에 대한 중계 쌍 생성
    ///
    /// 쌍을 만든 첫 패킷도 중계한다.
    fn open_pair(&self, datagram: Datagram) -> Result<()> {
        let id = datagram.session_id().ok_or(Error::ChannelError)?;
        let client = Arc::new(self.socket.register_session(datagram.source, Some(id))?);
        let backend = Arc::new(self.socket.register_session(self.backend, None)?);

        info!(
            "중계 시작: {} -> {} (session {} -> {})",
            datagram.source,
            self.backend,
            client.id(),
            backend.id()
        );

        let idle = Arc::new(AtomicU32::new(0));
        let relay = Arc::new(Relay {
            config: self.config.clone(),
            counters: self.counters.clone(),
            idle: idle.clone(),
        });

        relay.forward(&backend, datagram.payload());

        let upstream = tokio::spawn(relay_loop(client.clone(), backend.clone(), relay.clone()));
        let downstream = tokio::spawn(relay_loop(backend.clone(), client.clone(), relay));
        let watchdog = tokio::spawn(watchdog(
            id,
            idle.clone(),
            self.pairs.clone(),
            self.config.clone(),
        ));

        self.pairs.insert(
            id,
            RelayPair {
                client,
                backend,
                idle,
                tasks: vec![upstream, downstream, watchdog],
            },
        );
        Ok(())
    }
}

/// from 세션에서 받은 패킷을 to 세션으로 중계
async fn relay_loop(from: Arc<Session>, to: Arc<Session>, relay: Arc<Relay>) {
    while let Some(payload) = from.recv().await {
        relay.idle.store(0, Ordering::Relaxed);
        relay.forward(&to, payload);
    }
    trace!("중계 루프 종료: session {} -> {}", from.id(), to.id());
}

/// 유휴 감시
///
/// 틱마다 카운터를 올리고, 중계가 일어나면 relay_loop 가 0으로 되돌린다.
/// 한도에 닿으면 자기 쌍을 정리한다.
async fn watchdog(
    id: SessionId,
    idle: Arc<AtomicU32>,
    pairs: Arc<DashMap<SessionId, RelayPair>>,
    config: Arc<ProxyConfig>,
) {
    let mut ticker = tokio::time::interval(config.idle_tick);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let count = idle.fetch_add(1, Ordering::Relaxed) + 1;
        if count >= config.idle_limit {
            break;
        }
    }

    // 같은 ID로 새로 만든 쌍은 건드리지 않는다
    if let Some((_, pair)) = pairs.remove_if(&id, |_, pair| Arc::ptr_eq(&pair.idle, &idle)) {
        info!(
            "유휴 중계 쌍 정리: {} -> {} (session {})",
            pair.client.remote_addr(),
            pair.backend.remote_addr(),
            id
        );
        drop(pair);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UdpSocket;

    fn quiet_config() -> ProxyConfig {
        ProxyConfig {
            delay: Duration::ZERO,
            jitter: Duration::ZERO,
            drop_chance: 0.0,
            duplicate_chance: 0.0,
            ..ProxyConfig::default()
        }
    }

    async fn start_proxy(backend: SocketAddr, config: ProxyConfig) -> (Arc<FaultProxy>, SocketAddr) {
        let socket = Arc::new(
            SessionSocket::bind("127.0.0.1:0".parse().unwrap(), 64)
                .await
                .unwrap(),
        );
        let addr = socket.local_addr().unwrap();
        let proxy = Arc::new(FaultProxy::new(socket, backend, config).unwrap());
        let runner = proxy.clone();
        tokio::spawn(async move { runner.run().await });
        (proxy, addr)
    }

    async fn recv(socket: &UdpSocket) -> (Vec<u8>, SocketAddr) {
        let mut buf = [0u8; 256];
        let (len, from) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        (buf[..len].to_vec(), from)
    }

    #[test]
    fn test_classify_boundaries() {
        assert_eq!(Scenario::classify(0.0, 0.1, 0.1), Scenario::Drop);
        assert_eq!(Scenario::classify(0.0999, 0.1, 0.1), Scenario::Drop);
        assert_eq!(Scenario::classify(0.1, 0.1, 0.1), Scenario::Duplicate);
        assert_eq!(Scenario::classify(0.1999, 0.1, 0.1), Scenario::Duplicate);
        assert_eq!(Scenario::classify(0.2, 0.1, 0.1), Scenario::Pass);
        assert_eq!(Scenario::classify(0.9999, 1.0, 0.0), Scenario::Drop);
        assert_eq!(Scenario::classify(0.5, 0.0, 0.0), Scenario::Pass);
    }

    #[test]
    fn test_sample_delay_is_floored() {
        let config = ProxyConfig {
            delay: Duration::from_millis(1),
            jitter: Duration::from_millis(5),
            ..ProxyConfig::default()
        };
        for _ in 0..1000 {
            let delay = sample_delay(&config);
            assert!(delay <= Duration::from_millis(6));
        }
    }

    #[tokio::test]
    async fn test_rejects_invalid_config() {
        let socket = Arc::new(
            SessionSocket::bind("127.0.0.1:0".parse().unwrap(), 8)
                .await
                .unwrap(),
        );
        let config = ProxyConfig {
            drop_chance: 0.8,
            duplicate_chance: 0.8,
            ..ProxyConfig::default()
        };
        assert!(FaultProxy::new(socket, "127.0.0.1:9".parse().unwrap(), config).is_err());
    }

    #[tokio::test]
    async fn test_relays_both_directions() {
        let backend = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (proxy, proxy_addr) = start_proxy(backend.local_addr().unwrap(), quiet_config()).await;

        client.send_to(&[0x12, 0x34, 1, 2, 3], proxy_addr).await.unwrap();
        let (packet, from) = recv(&backend).await;
        assert_eq!(from, proxy_addr);
        assert_eq!(&packet[2..], &[1, 2, 3]);
        let backend_id = [packet[0], packet[1]];

        let mut reply = backend_id.to_vec();
        reply.extend_from_slice(&[9, 9]);
        backend.send_to(&reply, proxy_addr).await.unwrap();
        let (packet, _) = recv(&client).await;
        assert_eq!(packet, vec![0x12, 0x34, 9, 9]);

        client.send_to(&[0x12, 0x34, 4], proxy_addr).await.unwrap();
        let (packet, _) = recv(&backend).await;
        assert_eq!(&packet[..2], &backend_id);
        assert_eq!(&packet[2..], &[4]);

        assert_eq!(proxy.active_pairs(), 1);
        assert_eq!(proxy.stats().forwarded, 3);
    }

    #[tokio::test]
    async fn test_duplicate_sends_two_copies() {
        let backend = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = ProxyConfig {
            duplicate_chance: 1.0,
            ..quiet_config()
        };
        let (proxy, proxy_addr) = start_proxy(backend.local_addr().unwrap(), config).await;

        client.send_to(&[0x00, 0x01, 7], proxy_addr).await.unwrap();
        let (first, _) = recv(&backend).await;
        let (second, _) = recv(&backend).await;
        assert_eq!(first, second);
        assert_eq!(proxy.stats().duplicated, 1);
    }
}
