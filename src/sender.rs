//! 송신자 (클라이언트측)
//!
//! - 핸드쉐이크 → 분할 전송 → 트레일러(CRC) 순서로 진행
//! - 수신측이 광고한 윈도우만큼 동시에 전송
//! - 패킷별 타임아웃 재전송 (RTT 평균 기반, 지수 백오프)

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::AsyncRead;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, trace, warn};

use crate::message::{encode_data, encode_trailer, fragment_size, Ack, Handshake, Seq, SessionId};
use crate::session::Session;
use crate::stats::{RttEstimator, TransferStats};
use crate::transfer::read_fragment;
use crate::window::SendWindow;
use crate::{Config, Error, Result};

/// 송신 태스크들이 공유하는 상태
struct Shared {
    /// 송신 윈도우 (ACK 태스크가 갱신, 전송 태스크들이 대기)
    window: watch::Sender<SendWindow>,

    /// RTT 추정기
    rtt: Mutex<RttEstimator>,

    /// 전송 통계
    stats: Mutex<TransferStats>,

    /// 트레일러에 할당된 시퀀스 번호와 로컬 CRC
    trailer: Mutex<Option<(Seq, u32)>>,

    /// 최종 ACK 로 받은 수신측 CRC
    final_checksum: watch::Sender<Option<u32>>,
}

/// 송신자
pub struct Sender {
    /// 설정
    config: Arc<Config>,

    /// 전송에 사용할 세션
    session: Arc<Session>,

    /// 전송 정보
    handshake: Handshake,

    /// 미리 인코딩한 핸드쉐이크 패킷 (seq 0)
    handshake_packet: Bytes,

    /// 공유 상태
    shared: Arc<Shared>,
}

impl Sender {
    /// 새 송신자 생성
    ///
    /// 이름/크기가 핸드쉐이크에 담길 수 없으면 아무것도 보내기 전에 실패한다.
    pub fn new(config: Config, session: Session, name: impl Into<String>, size: u64) -> Result<Self> {
        let window = SendWindow::new();
        let handshake = Handshake::new(name, size);
        let handshake_packet = handshake.encode(window.next_seq(), config.extended_names)?;

        let (window_tx, _) = watch::channel(window);
        let (final_tx, _) = watch::channel(None);

        let shared = Shared {
            window: window_tx,
            rtt: Mutex::new(RttEstimator::new(config.base_rtt, config.rtt_history)),
            stats: Mutex::new(TransferStats::new(size)),
            trailer: Mutex::new(None),
            final_checksum: final_tx,
        };

        Ok(Self {
            config: Arc::new(config),
            session: Arc::new(session),
            handshake,
            handshake_packet,
            shared: Arc::new(shared),
        })
    }

    pub fn session_id(&self) -> SessionId {
        self.session.id()
    }

    /// 현재 통계 스냅샷
    pub fn stats(&self) -> TransferStats {
        let mut stats = self.shared.stats.lock().clone();
        stats.rtt = self.shared.rtt.lock().estimate();
        stats
    }

    /// 전송 실행
    ///
    /// source 에서 선언한 크기만큼 읽어 보낸다. 완료되든 실패하든 세션은 닫힌다.
    pub async fn run<R>(self, mut source: R) -> Result<TransferStats>
    where
        R: AsyncRead + Unpin + Send,
    {
        info!(
            "전송 시작: {} ({} bytes) session={} -> {}",
            self.handshake.name,
            self.handshake.size,
            self.session.id(),
            self.session.remote_addr()
        );

        let ack_task = tokio::spawn(ack_loop(
            self.session.clone(),
            self.shared.clone(),
            self.config.effective_max_window(),
        ));
        let progress_task = tokio::spawn(progress_loop(
            self.shared.clone(),
            self.config.progress_interval,
        ));

        let result = self.transfer(&mut source).await;

        ack_task.abort();
        progress_task.abort();
        self.session.close();

        let stats = self.stats();
        match result {
            Ok(()) => {
                info!("전송 완료: {} | {}", self.handshake.name, stats.summary());
                Ok(stats)
            }
            Err(e) => {
                error!("전송 실패: {}: {}", self.handshake.name, e);
                Err(e)
            }
        }
    }

    async fn transfer<R>(&self, source: &mut R) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut window_rx = self.shared.window.subscribe();
        let mut in_flight: JoinSet<Result<()>> = JoinSet::new();

        // 1. 핸드쉐이크
        let seq = self.reserve(&mut window_rx, &mut in_flight).await?;
        self.send_reliably(seq, self.handshake_packet.clone(), 0).await?;
        debug!("핸드쉐이크 확인됨: session={}", self.session.id());

        // 2. 분할 전송
        let mut remote = self.session.watch_remote();
        let mut max_fragment = fragment_size(&remote.borrow_and_update(), self.config.mtu);
        let mut hasher = crc32fast::Hasher::new();
        let mut remaining = self.handshake.size;

        while remaining > 0 {
            if remote.has_changed().unwrap_or(false) {
                let addr = *remote.borrow_and_update();
                max_fragment = fragment_size(&addr, self.config.mtu);
                debug!("원격 주소 변경 {}: fragment 크기 {}", addr, max_fragment);
            }

            let want = (max_fragment as u64).min(remaining) as usize;
            let fragment = read_fragment(source, want).await?;
            if fragment.is_empty() {
                return Err(Error::IncompleteTransfer {
                    expected: self.handshake.size,
                    got: self.handshake.size - remaining,
                });
            }
            remaining -= fragment.len() as u64;
            hasher.update(&fragment);

            let seq = self.reserve(&mut window_rx, &mut in_flight).await?;
            let packet = encode_data(seq, &fragment);
            let data_len = fragment.len() as u64;

            let session = self.session.clone();
            let shared = self.shared.clone();
            let config = self.config.clone();
            in_flight.spawn(async move {
                send_reliably(&session, &shared, &config, seq, packet, data_len).await
            });
        }

        while let Some(joined) = in_flight.join_next().await {
            joined??;
        }

        // 3. 트레일러
        let checksum = hasher.finalize();
        let seq = self.reserve(&mut window_rx, &mut in_flight).await?;
        *self.shared.trailer.lock() = Some((seq, checksum));
        debug!("트레일러 전송: seq={} crc={:08X}", seq, checksum);
        self.send_reliably(seq, encode_trailer(seq, checksum), 0).await?;

        let mut final_rx = self.shared.final_checksum.subscribe();
        let remote_checksum =
            tokio::time::timeout(self.config.final_ack_timeout, final_rx.wait_for(Option::is_some))
                .await
                .map_err(|_| Error::FinalAckTimeout)?
                .map(|value| *value)
                .map_err(|_| Error::ChannelError)?;
        let Some(remote_checksum) = remote_checksum else {
            return Err(Error::FinalAckTimeout);
        };

        if remote_checksum != checksum {
            return Err(Error::ChecksumMismatch {
                expected: checksum,
                got: remote_checksum,
            });
        }

        debug!("CRC 일치: {:08X}", checksum);
        Ok(())
    }

    /// 다음 시퀀스 번호를 윈도우에 예약
    ///
    /// 윈도우에 자리가 날 때까지 기다린다. 그 사이 진행 중인 전송이 실패하면
    /// 그 에러를 반환한다.
    async fn reserve(
        &self,
        window_rx: &mut watch::Receiver<SendWindow>,
        in_flight: &mut JoinSet<Result<()>>,
    ) -> Result<Seq> {
        let seq = self.shared.window.borrow().next_seq();

        loop {
            tokio::select! {
                ready = wait_for_room(window_rx, seq) => {
                    if !ready {
                        return Err(Error::ChannelError);
                    }
                    break;
                }
                Some(joined) = in_flight.join_next() => {
                    joined??;
                }
            }
        }

        // 번호 할당은 이 태스크에서만 하므로 대기 후 자리가 사라지지 않는다
        self.shared.window.send_modify(|w| w.assign(seq));
        trace!("seq {} 할당", seq);
        Ok(seq)
    }

    async fn send_reliably(&self, seq: Seq, packet: Bytes, data_len: u64) -> Result<()> {
        send_reliably(&self.session, &self.shared, &self.config, seq, packet, data_len).await
    }
}

/// seq 를 할당할 자리가 날 때까지 대기. 윈도우 채널이 닫히면 false
async fn wait_for_room(window_rx: &mut watch::Receiver<SendWindow>, seq: Seq) -> bool {
    window_rx.wait_for(|w| w.can_assign(seq)).await.is_ok()
}

/// 확인될 때까지 재전송
///
/// 시도마다 타임아웃이 늘어나며, 성공한 시도의 경과 시간을 RTT 샘플로 쓴다.
async fn send_reliably(
    session: &Session,
    shared: &Shared,
    config: &Config,
    seq: Seq,
    packet: Bytes,
    data_len: u64,
) -> Result<()> {
    let mut window_rx = shared.window.subscribe();

    for attempt in 0..config.max_resend_attempts {
        let rtt = shared.rtt.lock().estimate();
        let timeout = config.retransmit_timeout(rtt, attempt);
        let started = Instant::now();

        session.send(&packet).await?;
        {
            let mut stats = shared.stats.lock();
            stats.packets_sent += 1;
            if attempt > 0 {
                stats.retransmissions += 1;
            }
        }

        let acked = tokio::time::timeout(timeout, window_rx.wait_for(|w| w.is_acked(seq)))
            .await
            .map(|ready| ready.is_ok());

        match acked {
            Ok(true) => {
                shared.rtt.lock().record(started.elapsed());
                shared.stats.lock().transferred_bytes += data_len;
                return Ok(());
            }
            Ok(false) => return Err(Error::ChannelError),
            Err(_) => {
                debug!(
                    "seq {} 타임아웃 ({:?}), 시도 {}/{}",
                    seq,
                    timeout,
                    attempt + 1,
                    config.max_resend_attempts
                );
            }
        }
    }

    warn!("seq {} 재전송 한도 초과", seq);
    Err(Error::RetransmitExhausted {
        seq,
        attempts: config.max_resend_attempts,
    })
}

/// ACK 수신 루프
///
/// 세션이 닫혀 스트림이 끝날 때까지 실행된다.
async fn ack_loop(session: Arc<Session>, shared: Arc<Shared>, max_window: u16) {
    while let Some(payload) = session.recv().await {
        let Some(ack) = Ack::from_bytes(&payload) else {
            warn!("너무 짧은 ACK 무시: {} bytes", payload.len());
            continue;
        };

        // 최종 ACK 는 CRC 가 0 이 아닌 트레일러 ACK. 로컬 CRC 가 0 이면 0 도 인정
        let trailer = *shared.trailer.lock();
        if let Some((trailer_seq, local)) = trailer {
            if ack.seq == trailer_seq {
                if ack.is_final() || local == 0 {
                    shared.final_checksum.send_replace(Some(ack.checksum));
                } else {
                    debug!("CRC 없는 트레일러 ACK: seq={}", ack.seq);
                }
            }
        }

        let advertised = (ack.window as u16).clamp(1, max_window);
        let accepted = shared
            .window
            .send_if_modified(|w| w.acknowledge(ack.seq, advertised));

        let mut stats = shared.stats.lock();
        if accepted {
            stats.acks_received += 1;
            trace!("ACK seq={} window={}", ack.seq, advertised);
        } else {
            stats.acks_ignored += 1;
            debug!("범위 밖 ACK 무시: seq={}", ack.seq);
        }
    }
    debug!("ACK 루프 종료: session={}", session.id());
}

/// 진행률 로그
async fn progress_loop(shared: Arc<Shared>, period: std::time::Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let stats = shared.stats.lock().clone();
        info!(
            "진행: {}/{} bytes ({:.1}%)",
            stats.transferred_bytes,
            stats.total_bytes,
            stats.progress_percent()
        );
    }
}
