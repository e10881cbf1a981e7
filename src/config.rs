//! 프로토콜 설정

use std::time::Duration;

use crate::{Error, Result, BASE_TIMEOUT, MAX_RESEND_ATTEMPTS, MAX_WINDOW, TIMEOUT_MULTIPLIER};

/// 송신/수신 공통 설정
#[derive(Debug, Clone)]
pub struct Config {
    /// 송신측 최대 윈도우 (수신측 광고값은 [1, max_window]로 제한)
    /// 1이면 stop-and-wait
    pub max_window: u16,

    /// 수신측 수락 윈도우 크기 (ACK에 실어 광고)
    pub receive_window: u8,

    /// 수신 윈도우 뒤쪽 drop zone 크기
    /// 이 범위의 늦은 패킷은 ACK만 하고 버린다
    pub drop_zone: u8,

    /// RTT 샘플이 없을 때의 기본값
    pub base_rtt: Duration,

    /// 재전송 타임아웃 하한
    pub min_rto: Duration,

    /// 패킷당 최대 전송 시도 횟수
    pub max_resend_attempts: u32,

    /// 시도마다 곱해지는 타임아웃 배수
    pub timeout_multiplier: f64,

    /// RTT 이력 크기
    pub rtt_history: usize,

    /// 최종 ACK(CRC 포함) 대기 시간
    pub final_ack_timeout: Duration,

    /// 수신측: 다음 순서 패킷 대기 시간
    pub delivery_timeout: Duration,

    /// 수신측: 전송 완료 후 세션 유지 시간 (최종 ACK 재응답용)
    pub linger: Duration,

    /// 이름 길이 제한을 u16::MAX 로 확장 (기본 i16::MAX)
    pub extended_names: bool,

    /// 핸드쉐이크 CRC 불일치를 경고로만 처리
    pub ignore_handshake_checksum: bool,

    /// 경로 MTU 고정값 (None이면 목적지 기준 조회)
    pub mtu: Option<usize>,

    /// 세션별 수신 큐 크기 (datagram 수)
    pub inbound_queue: usize,

    /// 진행률 로그 주기
    pub progress_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_window: MAX_WINDOW,
            receive_window: 10,
            drop_zone: 128,
            base_rtt: BASE_TIMEOUT,
            min_rto: Duration::from_millis(20),
            max_resend_attempts: MAX_RESEND_ATTEMPTS,
            timeout_multiplier: TIMEOUT_MULTIPLIER,
            rtt_history: 60,
            final_ack_timeout: Duration::from_secs(10),
            delivery_timeout: Duration::from_secs(10),
            linger: Duration::from_secs(10),
            extended_names: false,
            ignore_handshake_checksum: false,
            mtu: None,
            inbound_queue: 1024,
            progress_interval: Duration::from_millis(500),
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 윈도우 1: 패킷마다 ACK를 기다림
    pub fn stop_and_wait() -> Self {
        Self {
            max_window: 1,
            ..Self::default()
        }
    }

    /// 불안정한 네트워크용 설정
    pub fn unstable_network() -> Self {
        Self {
            max_resend_attempts: 16,
            timeout_multiplier: 1.5,
            min_rto: Duration::from_millis(100),
            final_ack_timeout: Duration::from_secs(30),
            delivery_timeout: Duration::from_secs(30),
            linger: Duration::from_secs(30),
            ..Self::default()
        }
    }

    /// 송신측이 실제로 사용할 윈도우 상한
    pub fn effective_max_window(&self) -> u16 {
        self.max_window.clamp(1, MAX_WINDOW)
    }

    /// 수신 윈도우 + drop zone 이 시퀀스 공간(256)을 넘지 않도록 조정한 값
    pub fn effective_receive_window(&self) -> (u8, u8) {
        let window = self.receive_window.clamp(1, MAX_WINDOW as u8);
        let room = 256 - window as u16;
        let drop_zone = (self.drop_zone as u16).min(room) as u8;
        (window, drop_zone)
    }

    /// attempt 번째 시도의 재전송 타임아웃
    pub fn retransmit_timeout(&self, rtt: Duration, attempt: u32) -> Duration {
        let base = (rtt * 2).max(self.min_rto);
        base.mul_f64(self.timeout_multiplier.powi(attempt as i32))
    }
}

/// 장애 주입 프록시 설정
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// 기본 지연
    pub delay: Duration,

    /// 지터 (delay ± jitter)
    pub jitter: Duration,

    /// 드롭 확률 (0.0 ~ 1.0)
    pub drop_chance: f64,

    /// 복제 확률 (0.0 ~ 1.0)
    pub duplicate_chance: f64,

    /// 유휴 카운터 증가 주기
    pub idle_tick: Duration,

    /// 이 횟수만큼 유휴 틱이 쌓이면 릴레이 쌍 정리
    pub idle_limit: u32,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(10),
            jitter: Duration::from_millis(2),
            drop_chance: 0.1,
            duplicate_chance: 0.1,
            idle_tick: Duration::from_secs(1),
            idle_limit: 10,
        }
    }
}

impl ProxyConfig {
    /// 확률 범위 검증
    ///
    /// drop + duplicate 가 1을 넘으면 pass-through 가 불가능해지므로 거부한다.
    pub fn validate(&self) -> Result<()> {
        for (name, chance) in [
            ("drop_chance", self.drop_chance),
            ("duplicate_chance", self.duplicate_chance),
        ] {
            if !(0.0..=1.0).contains(&chance) {
                return Err(Error::InvalidConfig(format!(
                    "{name} must be in [0, 1], got {chance}"
                )));
            }
        }
        if self.drop_chance + self.duplicate_chance > 1.0 {
            return Err(Error::InvalidConfig(format!(
                "drop_chance + duplicate_chance must not exceed 1, got {}",
                self.drop_chance + self.duplicate_chance
            )));
        }
        if self.idle_limit == 0 {
            return Err(Error::InvalidConfig("idle_limit must be at least 1".into()));
        }
        Ok(())
    }
}
