//! 전송 통계

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// RTT 추정기
///
/// 최근 `capacity` 개 샘플의 산술 평균. 샘플이 없을 때를 위해 기본값 하나로
/// 시작하며, 이 값도 실제 샘플에 밀려날 때까지 평균에 포함된다.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    samples: VecDeque<Duration>,
    capacity: usize,
}

impl RttEstimator {
    pub fn new(base: Duration, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let mut samples = VecDeque::with_capacity(capacity);
        samples.push_back(base);
        Self { samples, capacity }
    }

    /// RTT 샘플 기록
    pub fn record(&mut self, rtt: Duration) {
        if self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(rtt);
    }

    /// 현재 추정값 (평균)
    pub fn estimate(&self) -> Duration {
        let total: Duration = self.samples.iter().sum();
        total / self.samples.len() as u32
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }
}

/// 전송 통계
#[derive(Debug, Clone)]
pub struct TransferStats {
    /// 시작 시간
    pub start_time: Instant,

    /// 전송 대상 총 바이트
    pub total_bytes: u64,

    /// 확인(송신) 또는 전달(수신) 완료된 바이트
    pub transferred_bytes: u64,

    /// 보낸 패킷 수 (재전송 포함)
    pub packets_sent: u64,

    /// 재전송 수
    pub retransmissions: u64,

    /// 받은 ACK 수
    pub acks_received: u64,

    /// 유효 구간 밖이라 무시한 ACK 수
    pub acks_ignored: u64,

    /// 받은 데이터 패킷 수
    pub packets_received: u64,

    /// 이미 버퍼에 있던 패킷 재수신
    pub duplicate_packets: u64,

    /// drop zone 에서 ACK 만 보낸 패킷
    pub late_packets: u64,

    /// 윈도우 밖이라 무시한 패킷
    pub ignored_packets: u64,

    /// 마지막 RTT 추정값
    pub rtt: Duration,
}

impl TransferStats {
    pub fn new(total_bytes: u64) -> Self {
        Self {
            start_time: Instant::now(),
            total_bytes,
            transferred_bytes: 0,
            packets_sent: 0,
            retransmissions: 0,
            acks_received: 0,
            acks_ignored: 0,
            packets_received: 0,
            duplicate_packets: 0,
            late_packets: 0,
            ignored_packets: 0,
            rtt: Duration::ZERO,
        }
    }

    /// 경과 시간
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// 진행률 (0.0 ~ 100.0)
    pub fn progress_percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 100.0;
        }
        self.transferred_bytes as f64 / self.total_bytes as f64 * 100.0
    }

    /// 처리율 (bytes/sec)
    pub fn throughput(&self) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            return 0.0;
        }
        self.transferred_bytes as f64 / elapsed
    }

    /// 재전송 비율
    pub fn retransmission_rate(&self) -> f64 {
        if self.packets_sent == 0 {
            return 0.0;
        }
        self.retransmissions as f64 / self.packets_sent as f64
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Elapsed: {:.2}s | Bytes: {}/{} | Throughput: {:.2} MB/s | Sent: {} | Retransmits: {} ({:.1}%) | Received: {} | Dup: {} | Late: {} | Ignored: {} | RTT: {:?}",
            self.elapsed().as_secs_f64(),
            self.transferred_bytes,
            self.total_bytes,
            self.throughput() / 1_000_000.0,
            self.packets_sent,
            self.retransmissions,
            self.retransmission_rate() * 100.0,
            self.packets_received,
            self.duplicate_packets,
            self.late_packets,
            self.ignored_packets,
            self.rtt,
        )
    }
}

impl Default for TransferStats {
    fn default() -> Self {
        Self::new(0)
    }
}
