//! 에러 타입 정의

use thiserror::Error;

use crate::message::{Seq, SessionId};

/// UDPFT 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("소켓이 닫혔음")]
    SocketClosed,

    #[error("사용 가능한 세션 ID 없음")]
    SessionIdsExhausted,

    #[error("세션 ID {0} 이미 사용 중")]
    SessionIdInUse(SessionId),

    #[error("핸드쉐이크 패킷이 너무 짧음: {len} bytes (최소 {min})")]
    HandshakeTooShort { len: usize, min: usize },

    #[error("핸드쉐이크 패킷 ID는 0이어야 함: got {0}")]
    InvalidPacketId(Seq),

    #[error("시작 마커 불일치")]
    InvalidMarker,

    #[error("유효하지 않은 전송 크기: {0}")]
    InvalidTransferSize(u64),

    #[error("전송 이름이 비어 있음")]
    EmptyName,

    #[error("전송 이름이 너무 김: {len} bytes (최대 {max})")]
    NameTooLong { len: usize, max: usize },

    #[error("유효하지 않은 전송 이름: {0}")]
    InvalidName(String),

    #[error("패킷 잘림: expected {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },

    #[error("핸드쉐이크 CRC 불일치: expected {expected:08X}, got {got:08X}")]
    HandshakeChecksum { expected: u32, got: u32 },

    #[error("재전송 한도 초과: seq={seq}, attempts={attempts}")]
    RetransmitExhausted { seq: Seq, attempts: u32 },

    #[error("전송 CRC 불일치: expected {expected:08X}, got {got:08X}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("최종 ACK 대기 타임아웃")]
    FinalAckTimeout,

    #[error("패킷 대기 타임아웃: seq={seq}")]
    DeliveryTimeout { seq: Seq },

    #[error("전송 데이터 부족: expected {expected} bytes, got {got}")]
    IncompleteTransfer { expected: u64, got: u64 },

    #[error("유효하지 않은 설정: {0}")]
    InvalidConfig(String),

    #[error("태스크 에러: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("채널 에러")]
    ChannelError,
}

impl Error {
    /// 전송 계층 장애 여부
    ///
    /// 손실/타임아웃으로 인한 실패는 상위에서 다시 시도할 수 있지만
    /// 프로토콜 위반이나 체크섬 불일치는 재시도해도 결과가 같다.
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            Error::RetransmitExhausted { .. }
                | Error::FinalAckTimeout
                | Error::DeliveryTimeout { .. }
                | Error::Io(_)
        )
    }
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_failure_classification() {
        assert!(Error::RetransmitExhausted { seq: 3, attempts: 10 }.is_transport_failure());
        assert!(Error::FinalAckTimeout.is_transport_failure());
        assert!(!Error::ChecksumMismatch { expected: 1, got: 2 }.is_transport_failure());
        assert!(!Error::InvalidMarker.is_transport_failure());
    }
}
