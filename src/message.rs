//! 프로토콜 메시지 정의
//!
//! 모든 datagram 은 2바이트 세션 ID로 시작한다. 그 뒤는 패킷 종류별로:
//!
//! ```text
//! Handshake : seq(1)=0 | "Start"(5) | size(8, BE i64) | name_len(2) | name | crc32(4, BE)
//! Data      : seq(1) | fragment
//! Trailer   : seq(1) | crc32(4, BE)
//! Ack       : seq(1) | window(1) | crc32(4, BE) 또는 0
//! ```
//!
//! 핸드쉐이크 CRC 는 세션 ID 뒤부터 체크섬 앞까지의 모든 바이트를 덮는다.

use std::net::SocketAddr;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::warn;

use crate::{
    Error, Result, FALLBACK_MTU, FT_HEADER_SIZE, IPV6_OVERHEAD, START_MARKER, UDP_OVERHEAD,
};

/// 세션 ID (16비트)
pub type SessionId = u16;

/// 시퀀스 번호 (8비트, 256 에서 wraparound)
pub type Seq = u8;

/// 세션 ID 길이
pub const SESSION_ID_LEN: usize = 2;

/// 세션 ID를 제외한 핸드쉐이크 최소 길이: seq + marker + size + name_len + crc
pub const HANDSHAKE_MIN_LEN: usize = 1 + START_MARKER.len() + 8 + 2 + 4;

/// ACK 페이로드 길이
pub const ACK_LEN: usize = 6;

/// 규격상 이름 길이 상한 (초과 시 경고만)
pub const CONFORMANT_NAME_LEN: usize = u8::MAX as usize;

/// datagram 앞 2바이트에서 세션 ID 추출
pub fn session_id_of(datagram: &[u8]) -> Option<SessionId> {
    match datagram {
        [hi, lo, ..] => Some(u16::from_be_bytes([*hi, *lo])),
        _ => None,
    }
}

/// CRC-32 를 와이어 바이트 순서(big-endian)로 변환
pub fn checksum_bytes(crc: u32) -> [u8; 4] {
    crc.to_be_bytes()
}

/// 핸드쉐이크 (전송의 첫 패킷)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// 전송 이름 (파일 이름)
    pub name: String,

    /// 전송할 총 바이트 수
    pub size: u64,
}

/// 디코딩된 핸드쉐이크와 체크섬 검증 정보
#[derive(Debug, Clone)]
pub struct HandshakeFrame {
    pub handshake: Handshake,

    /// 패킷에 실려 온 CRC
    pub declared_crc: u32,

    /// 수신측에서 다시 계산한 CRC
    pub computed_crc: u32,
}

impl HandshakeFrame {
    pub fn checksum_matches(&self) -> bool {
        self.declared_crc == self.computed_crc
    }
}

impl Handshake {
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
        }
    }

    /// 세션 ID 없이 인코딩
    ///
    /// `extended` 이면 이름 길이 상한이 u16::MAX, 아니면 i16::MAX.
    pub fn encode(&self, seq: Seq, extended: bool) -> Result<Bytes> {
        let name = self.name.as_bytes();
        let max = if extended {
            u16::MAX as usize
        } else {
            i16::MAX as usize
        };
        if name.is_empty() {
            return Err(Error::EmptyName);
        }
        if name.len() > max {
            return Err(Error::NameTooLong {
                len: name.len(),
                max,
            });
        }
        if self.size == 0 || self.size > i64::MAX as u64 {
            return Err(Error::InvalidTransferSize(self.size));
        }

        let mut buf = BytesMut::with_capacity(HANDSHAKE_MIN_LEN + name.len());
        buf.put_u8(seq);
        buf.put_slice(START_MARKER);
        buf.put_i64(self.size as i64);
        buf.put_u16(name.len() as u16);
        buf.put_slice(name);
        let crc = crc32fast::hash(&buf);
        buf.put_slice(&checksum_bytes(crc));
        Ok(buf.freeze())
    }

    /// 세션 ID를 제외한 페이로드에서 디코딩
    ///
    /// CRC 불일치는 에러가 아니라 `HandshakeFrame` 에 담아 호출측이 판단한다.
    pub fn decode(payload: &[u8]) -> Result<HandshakeFrame> {
        if payload.len() < HANDSHAKE_MIN_LEN {
            return Err(Error::HandshakeTooShort {
                len: payload.len() + SESSION_ID_LEN,
                min: HANDSHAKE_MIN_LEN + SESSION_ID_LEN,
            });
        }

        let mut cursor = payload;
        let seq = cursor.get_u8();
        if seq != 0 {
            return Err(Error::InvalidPacketId(seq));
        }

        if &cursor[..START_MARKER.len()] != START_MARKER {
            return Err(Error::InvalidMarker);
        }
        cursor.advance(START_MARKER.len());

        let size = cursor.get_u64();
        if size == 0 || size > i64::MAX as u64 {
            return Err(Error::InvalidTransferSize(size));
        }

        let name_len = cursor.get_u16() as usize;
        if name_len == 0 {
            return Err(Error::EmptyName);
        }
        if cursor.remaining() < name_len + 4 {
            return Err(Error::Truncated {
                expected: HANDSHAKE_MIN_LEN + name_len,
                got: payload.len(),
            });
        }
        if name_len > CONFORMANT_NAME_LEN {
            warn!(
                "전송 이름 길이 {} bytes 가 규격 상한 {} 초과 (허용)",
                name_len, CONFORMANT_NAME_LEN
            );
        }

        let name = String::from_utf8_lossy(&cursor[..name_len]).into_owned();
        cursor.advance(name_len);
        let declared_crc = cursor.get_u32();

        let covered = HANDSHAKE_MIN_LEN - 4 + name_len;
        let computed_crc = crc32fast::hash(&payload[..covered]);

        Ok(HandshakeFrame {
            handshake: Handshake { name, size },
            declared_crc,
            computed_crc,
        })
    }
}

/// 데이터 패킷 인코딩 (세션 ID 제외)
pub fn encode_data(seq: Seq, fragment: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + fragment.len());
    buf.put_u8(seq);
    buf.put_slice(fragment);
    buf.freeze()
}

/// 데이터 패킷 디코딩: (seq, fragment)
pub fn decode_data(payload: &Bytes) -> Option<(Seq, Bytes)> {
    let seq = *payload.first()?;
    Some((seq, payload.slice(1..)))
}

/// 트레일러 패킷 (마지막 시퀀스, 전체 CRC)
pub fn encode_trailer(seq: Seq, crc: u32) -> Bytes {
    encode_data(seq, &checksum_bytes(crc))
}

/// 트레일러 fragment 에서 CRC 추출
pub fn trailer_checksum(fragment: &[u8]) -> Option<u32> {
    let bytes: [u8; 4] = fragment.try_into().ok()?;
    Some(u32::from_be_bytes(bytes))
}

/// 확인 응답
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    /// 확인한 시퀀스 번호
    pub seq: Seq,

    /// 수신측 현재 윈도우
    pub window: u8,

    /// 최종 ACK 이면 전체 CRC, 아니면 0
    pub checksum: u32,
}

impl Ack {
    pub fn new(seq: Seq, window: u8) -> Self {
        Self {
            seq,
            window,
            checksum: 0,
        }
    }

    pub fn with_checksum(seq: Seq, window: u8, checksum: u32) -> Self {
        Self {
            seq,
            window,
            checksum,
        }
    }

    /// CRC 를 실은 최종 ACK 여부
    pub fn is_final(&self) -> bool {
        self.checksum != 0
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(ACK_LEN);
        buf.put_u8(self.seq);
        buf.put_u8(self.window);
        buf.put_slice(&checksum_bytes(self.checksum));
        buf.freeze()
    }

    /// CRC 필드가 없는 짧은 ACK 는 0 으로 취급
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let mut cursor = bytes;
        if cursor.remaining() < 2 {
            return None;
        }
        let seq = cursor.get_u8();
        let window = cursor.get_u8();
        let checksum = if cursor.remaining() >= 4 {
            cursor.get_u32()
        } else {
            0
        };
        Some(Self {
            seq,
            window,
            checksum,
        })
    }
}

/// 목적지 경로 MTU 조회
///
/// 루프백은 플랫폼이 노출하는 인터페이스 MTU를 쓰고, 그 외는 알 수 없으므로
/// FALLBACK_MTU 를 사용한다.
pub fn path_mtu(addr: &SocketAddr) -> usize {
    if addr.ip().is_loopback() {
        if let Some(mtu) = loopback_mtu() {
            return mtu;
        }
    }
    FALLBACK_MTU
}

#[cfg(target_os = "linux")]
fn loopback_mtu() -> Option<usize> {
    std::fs::read_to_string("/sys/class/net/lo/mtu")
        .ok()?
        .trim()
        .parse()
        .ok()
}

#[cfg(not(target_os = "linux"))]
fn loopback_mtu() -> Option<usize> {
    None
}

/// 한 패킷에 실을 수 있는 fragment 크기
pub fn fragment_size_for_mtu(mtu: usize) -> usize {
    mtu.saturating_sub(UDP_OVERHEAD + IPV6_OVERHEAD + FT_HEADER_SIZE)
        .max(1)
}

/// 목적지 주소 기준 fragment 크기 (override 가 있으면 우선)
pub fn fragment_size(addr: &SocketAddr, mtu_override: Option<usize>) -> usize {
    fragment_size_for_mtu(mtu_override.unwrap_or_else(|| path_mtu(addr)))
}
