//! # UDPFT
//!
//! UDP 위에서 동작하는 세션 다중화 슬라이딩 윈도우 파일 전송 프로토콜
//!
//! ## 핵심 특징
//! - **세션 다중화**: 하나의 소켓에서 16비트 세션 ID로 여러 전송을 분리
//! - **슬라이딩 윈도우 ARQ**: 수신측이 광고한 윈도우만큼 동시에 전송
//! - **적응형 타임아웃**: 최근 RTT 평균 기반, 지수 백오프 재전송
//! - **순서 재조립**: 수신 윈도우 안의 패킷을 버퍼링 후 순서대로 전달
//! - **CRC-32 검증**: 핸드쉐이크와 전체 전송 데이터 모두 검증
//! - **장애 주입 프록시**: 손실/복제/지연/지터로 프로토콜 검증

use std::time::Duration;

pub mod config;
pub mod error;
pub mod message;
pub mod proxy;
pub mod receiver;
pub mod sender;
pub mod session;
pub mod stats;
pub mod transfer;
pub mod window;

pub use config::{Config, ProxyConfig};
pub use error::{Error, Result};
pub use message::{Ack, Handshake, Seq, SessionId};
pub use proxy::{FaultProxy, ProxyStats, Scenario};
pub use receiver::{ReceiveServer, Receiver};
pub use sender::Sender;
pub use session::{Datagram, Session, SessionSocket};
pub use stats::{RttEstimator, TransferStats};
pub use transfer::{DiscardSink, FileSink, MemorySink, RandomFill, TransferSink};

/// 핸드쉐이크 시작 마커
pub const START_MARKER: &[u8; 5] = b"Start";

/// 패킷당 최대 전송 시도 횟수
pub const MAX_RESEND_ATTEMPTS: u32 = 10;

/// RTT 샘플이 없을 때의 기본 RTT
pub const BASE_TIMEOUT: Duration = Duration::from_millis(500);

/// 재전송 타임아웃 배수
pub const TIMEOUT_MULTIPLIER: f64 = 1.25;

/// 시퀀스 번호 공간 (8비트)
pub const SEQ_SPACE: u16 = 256;

/// 최대 윈도우 (시퀀스 공간의 절반)
pub const MAX_WINDOW: u16 = SEQ_SPACE / 2;

/// MTU 조회 실패 시 사용값
pub const FALLBACK_MTU: usize = 1500;

/// UDP 헤더 오버헤드 (IPv4 기준 UDP + IP 최소)
pub const UDP_OVERHEAD: usize = 28;

/// IPv6 헤더 오버헤드 (IPv4 20바이트보다 보수적으로)
pub const IPV6_OVERHEAD: usize = 40;

/// 세션 ID(2) + 시퀀스(1)
pub const FT_HEADER_SIZE: usize = 3;
