//! 시퀀스 윈도우 상태
//!
//! - SendWindow: 송신측 미확인 구간 (ack, send]
//! - ReceiveWindow: 수신측 순서 재조립 버퍼
//!
//! 시퀀스 번호는 8비트이며 모든 비교는 256 모듈러 연산으로 한다.

use std::collections::HashMap;

use bytes::Bytes;

use crate::message::Seq;
use crate::SEQ_SPACE;

/// wraparound 를 고려한 닫힌 구간 [start, end] 포함 여부
///
/// start 에서 출발해 overflow 모듈러로 end 까지 가는 원형 구간이다.
/// start == end 이면 한 점이다.
pub fn in_range_wrapping(start: u32, end: u32, overflow: u32, value: u32) -> bool {
    debug_assert!(overflow > 0);
    let span = (end % overflow + overflow - start % overflow) % overflow;
    let offset = (value % overflow + overflow - start % overflow) % overflow;
    offset <= span
}

fn seq_in_range(start: Seq, end: Seq, value: Seq) -> bool {
    in_range_wrapping(start as u32, end as u32, SEQ_SPACE as u32, value as u32)
}

/// 송신 윈도우
///
/// `send` 는 마지막으로 할당한 번호, `ack` 는 누적 확인된 마지막 번호.
/// 초기 상태는 둘 다 255 로, 미확인 패킷이 없고 다음 번호는 0 이다.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendWindow {
    send: Seq,
    ack: Seq,
    advertised: u16,
}

impl Default for SendWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl SendWindow {
    pub fn new() -> Self {
        Self {
            send: Seq::MAX,
            ack: Seq::MAX,
            advertised: 1,
        }
    }

    pub fn send_pos(&self) -> Seq {
        self.send
    }

    pub fn ack_pos(&self) -> Seq {
        self.ack
    }

    pub fn advertised(&self) -> u16 {
        self.advertised
    }

    /// 다음에 할당할 시퀀스 번호
    pub fn next_seq(&self) -> Seq {
        self.send.wrapping_add(1)
    }

    /// 전송했지만 확인되지 않은 패킷 수
    pub fn in_flight(&self) -> u16 {
        self.send.wrapping_sub(self.ack) as u16
    }

    /// seq 가 바로 다음 번호이고 윈도우에 여유가 있는지
    pub fn can_assign(&self, seq: Seq) -> bool {
        seq == self.next_seq() && self.in_flight() < self.advertised
    }

    /// 다음 번호 할당. can_assign 을 확인한 뒤에만 호출
    pub fn assign(&mut self, seq: Seq) {
        debug_assert!(self.can_assign(seq));
        self.send = seq;
    }

    /// seq 가 미확인 구간 (ack, send] 에 있는지
    pub fn is_outstanding(&self, seq: Seq) -> bool {
        self.in_flight() > 0 && seq_in_range(self.ack.wrapping_add(1), self.send, seq)
    }

    /// seq 까지 확인되었는지
    pub fn is_acked(&self, seq: Seq) -> bool {
        !self.is_outstanding(seq)
    }

    /// ACK 반영
    ///
    /// seq 가 유효 구간 [ack, send] 밖이면 무시하고 false.
    /// 구간 안이면 광고 윈도우를 채택하고 ack 를 앞으로만 옮긴다.
    pub fn acknowledge(&mut self, seq: Seq, advertised: u16) -> bool {
        if !seq_in_range(self.ack, self.send, seq) {
            return false;
        }
        self.advertised = advertised.max(1);
        self.ack = seq;
        true
    }
}

/// 수신 패킷 처리 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// 수락 윈도우 안: 버퍼링 (아직 ACK 안 함)
    Buffered,

    /// 이미 버퍼에 있던 번호를 다시 받음
    Duplicate,

    /// drop zone: ACK 만 보내고 버림
    AckOnly,

    /// 전송 완료 후 트레일러 재전송: 최종 ACK 재응답
    Final { checksum: u32 },

    /// 어느 범위에도 없음: 프로토콜 위반, 무시
    Ignored,
}

/// 수신 윈도우
#[derive(Debug, Clone)]
pub struct ReceiveWindow {
    next_expected: Seq,
    window: u8,
    drop_zone: u8,
    buffer: HashMap<Seq, Bytes>,
    finished: Option<(Seq, u32)>,
}

impl ReceiveWindow {
    /// `next_expected` 부터 받기 시작하는 윈도우
    ///
    /// window + drop_zone 은 256 이하여야 한다.
    pub fn new(next_expected: Seq, window: u8, drop_zone: u8) -> Self {
        debug_assert!(window >= 1);
        debug_assert!(window as u16 + drop_zone as u16 <= SEQ_SPACE);
        Self {
            next_expected,
            window,
            drop_zone,
            buffer: HashMap::with_capacity(window as usize),
            finished: None,
        }
    }

    pub fn next_expected(&self) -> Seq {
        self.next_expected
    }

    pub fn window(&self) -> u8 {
        self.window
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// [next_expected, next_expected + window) 안인지
    pub fn in_window(&self, seq: Seq) -> bool {
        let end = self.next_expected.wrapping_add(self.window - 1);
        seq_in_range(self.next_expected, end, seq)
    }

    /// next_expected 바로 뒤쪽 drop zone [next - drop_zone, next) 안인지
    pub fn in_drop_zone(&self, seq: Seq) -> bool {
        if self.drop_zone == 0 {
            return false;
        }
        let start = self.next_expected.wrapping_sub(self.drop_zone);
        let end = self.next_expected.wrapping_sub(1);
        seq_in_range(start, end, seq)
    }

    /// 수신 패킷 분류 및 버퍼링
    pub fn offer(&mut self, seq: Seq, payload: Bytes) -> Admission {
        if let Some((trailer, checksum)) = self.finished {
            return if seq == trailer {
                Admission::Final { checksum }
            } else {
                Admission::Ignored
            };
        }

        if self.in_window(seq) {
            // 같은 번호를 다시 써도 내용은 동일하다
            if self.buffer.insert(seq, payload).is_some() {
                Admission::Duplicate
            } else {
                Admission::Buffered
            }
        } else if self.in_drop_zone(seq) {
            Admission::AckOnly
        } else {
            Admission::Ignored
        }
    }

    /// 다음 순서 패킷이 도착했는지
    pub fn has_next(&self) -> bool {
        self.buffer.contains_key(&self.next_expected)
    }

    /// 다음 순서 패킷을 꺼내고 윈도우를 한 칸 전진
    pub fn take_next(&mut self) -> Option<(Seq, Bytes)> {
        let seq = self.next_expected;
        let payload = self.buffer.remove(&seq)?;
        self.next_expected = seq.wrapping_add(1);
        Some((seq, payload))
    }

    /// 다음 순서 패킷을 트레일러로 꺼내고 바로 완료 상태로 전환
    ///
    /// 꺼내는 것과 완료 전환 사이에 트레일러 재전송이 drop zone 으로
    /// 분류되는 틈이 없다.
    pub fn take_final(&mut self, checksum: u32) -> Option<(Seq, Bytes)> {
        let (seq, payload) = self.take_next()?;
        self.finish(seq, checksum);
        Some((seq, payload))
    }

    /// 트레일러 처리 완료: 이후엔 트레일러 재전송에만 응답
    pub fn finish(&mut self, trailer: Seq, checksum: u32) {
        self.buffer.clear();
        self.finished = Some((trailer, checksum));
    }

    pub fn is_finished(&self) -> bool {
        self.finished.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_range_wrapping_basic() {
        assert!(in_range_wrapping(10, 20, 256, 10));
        assert!(in_range_wrapping(10, 20, 256, 20));
        assert!(!in_range_wrapping(10, 20, 256, 21));
        assert!(in_range_wrapping(250, 5, 256, 255));
        assert!(in_range_wrapping(250, 5, 256, 0));
        assert!(in_range_wrapping(250, 5, 256, 5));
        assert!(!in_range_wrapping(250, 5, 256, 6));
        assert!(!in_range_wrapping(250, 5, 256, 249));
        assert!(in_range_wrapping(7, 7, 256, 7));
        assert!(!in_range_wrapping(7, 7, 256, 8));
    }

    #[test]
    fn test_in_range_wrapping_rotation_symmetry() {
        for overflow in [7u32, 256] {
            for shift in [1u32, 3, 37, 128, 255] {
                for a in (0..overflow).step_by(5) {
                    for b in (0..overflow).step_by(3) {
                        for v in 0..overflow {
                            let rotated = in_range_wrapping(
                                (a + shift) % overflow,
                                (b + shift) % overflow,
                                overflow,
                                (v + shift) % overflow,
                            );
                            assert_eq!(
                                in_range_wrapping(a, b, overflow, v),
                                rotated,
                                "a={a} b={b} v={v} shift={shift} overflow={overflow}"
                            );
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_send_window_initial() {
        let window = SendWindow::new();
        assert_eq!(window.next_seq(), 0);
        assert_eq!(window.in_flight(), 0);
        assert!(window.can_assign(0));
        assert!(!window.can_assign(1));
        assert!(window.is_acked(0));
    }

    #[test]
    fn test_send_window_respects_advertised() {
        let mut window = SendWindow::new();
        window.assign(0);
        assert!(!window.can_assign(1), "advertised window starts at 1");
        assert!(window.acknowledge(0, 3));

        for seq in 1..=3 {
            assert!(window.can_assign(seq));
            window.assign(seq);
            assert!(window.in_flight() <= window.advertised());
        }
        assert!(!window.can_assign(4));

        assert!(window.acknowledge(2, 3));
        assert_eq!(window.in_flight(), 1);
        assert!(window.is_acked(1));
        assert!(window.is_acked(2));
        assert!(!window.is_acked(3));
        assert!(window.can_assign(4));
    }

    #[test]
    fn test_send_window_out_of_range_ack_ignored() {
        let mut window = SendWindow::new();
        window.assign(0);
        window.acknowledge(0, 10);
        for seq in 1..=5 {
            window.assign(seq);
        }

        let before = window;
        assert!(!window.acknowledge(9, 10));
        assert!(!window.acknowledge(200, 1));
        assert_eq!(window, before);
        assert_eq!(window.ack_pos(), 0);

        // 중복 ACK 는 유효 구간 안: 윈도우만 갱신
        assert!(window.acknowledge(0, 4));
        assert_eq!(window.ack_pos(), 0);
        assert_eq!(window.advertised(), 4);
    }

    #[test]
    fn test_send_window_never_moves_backwards() {
        let mut window = SendWindow::new();
        window.assign(0);
        window.acknowledge(0, 10);
        for seq in 1..=4 {
            window.assign(seq);
        }
        assert!(window.acknowledge(3, 10));
        assert!(!window.acknowledge(2, 10));
        assert_eq!(window.ack_pos(), 3);
    }

    #[test]
    fn test_send_window_wraparound() {
        let mut window = SendWindow::new();
        window.assign(0);
        window.acknowledge(0, 8);

        let mut seq: Seq = 0;
        for _ in 0..300 {
            seq = seq.wrapping_add(1);
            assert!(window.can_assign(seq));
            window.assign(seq);
            if window.in_flight() == 8 {
                let ack = window.ack_pos().wrapping_add(5);
                assert!(window.acknowledge(ack, 8));
            }
            assert!(window.in_flight() <= 8);
        }
        assert!(window.acknowledge(window.send_pos(), 8));
        assert_eq!(window.in_flight(), 0);
    }

    #[test]
    fn test_receive_window_admission() {
        let mut window = ReceiveWindow::new(1, 10, 128);

        assert_eq!(window.offer(1, Bytes::from_static(b"a")), Admission::Buffered);
        assert_eq!(window.offer(10, Bytes::from_static(b"j")), Admission::Buffered);
        assert_eq!(window.offer(11, Bytes::from_static(b"k")), Admission::Ignored);
        // 핸드쉐이크 재전송 (seq 0) 은 뒤쪽 drop zone
        assert_eq!(window.offer(0, Bytes::new()), Admission::AckOnly);
        assert_eq!(window.offer(200, Bytes::new()), Admission::AckOnly);
        assert_eq!(window.offer(100, Bytes::new()), Admission::Ignored);
    }

    #[test]
    fn test_receive_window_rebuffer_is_idempotent() {
        let mut window = ReceiveWindow::new(5, 4, 64);
        assert_eq!(window.offer(6, Bytes::from_static(b"second")), Admission::Buffered);
        assert_eq!(window.offer(6, Bytes::from_static(b"second")), Admission::Duplicate);
        assert_eq!(window.buffered(), 1);
        assert!(!window.has_next());

        window.offer(5, Bytes::from_static(b"first"));
        assert_eq!(window.take_next(), Some((5, Bytes::from_static(b"first"))));
        assert_eq!(window.take_next(), Some((6, Bytes::from_static(b"second"))));
        assert_eq!(window.take_next(), None);
        assert_eq!(window.next_expected(), 7);
    }

    #[test]
    fn test_receive_window_any_permutation_delivers_in_order() {
        // 윈도우 안 도착 순서를 결정적으로 섞어 본다
        let start: Seq = 250;
        let count = 12u8;
        let orders: Vec<Vec<u8>> = vec![
            (0..count).collect(),
            (0..count).rev().collect(),
            (0..count).map(|i| (i * 5) % count).collect(),
            (0..count).map(|i| (i * 7 + 3) % count).collect(),
        ];

        for order in orders {
            let mut window = ReceiveWindow::new(start, count, 64);
            let mut delivered = Vec::new();
            for i in order {
                let seq = start.wrapping_add(i);
                window.offer(seq, Bytes::from(vec![i]));
                while let Some((_, payload)) = window.take_next() {
                    delivered.extend_from_slice(&payload);
                }
            }
            assert_eq!(delivered, (0..count).collect::<Vec<_>>());
            assert_eq!(window.next_expected(), start.wrapping_add(count));
        }
    }

    #[test]
    fn test_receive_window_finished() {
        let mut window = ReceiveWindow::new(1, 10, 64);
        window.offer(1, Bytes::from_static(b"x"));
        window.finish(9, 0xABCD);

        assert!(window.is_finished());
        assert_eq!(window.offer(9, Bytes::new()), Admission::Final { checksum: 0xABCD });
        assert_eq!(window.offer(8, Bytes::new()), Admission::Ignored);
        assert!(!window.has_next());
    }

    #[test]
    fn test_take_final_answers_trailer_retransmit_with_checksum() {
        let mut window = ReceiveWindow::new(5, 10, 64);
        assert_eq!(window.offer(5, Bytes::from_static(b"crc!")), Admission::Buffered);

        assert_eq!(window.take_final(0x1234_5678), Some((5, Bytes::from_static(b"crc!"))));
        assert!(window.is_finished());
        assert_eq!(window.next_expected(), 6);
        assert_eq!(
            window.offer(5, Bytes::from_static(b"crc!")),
            Admission::Final { checksum: 0x1234_5678 }
        );
    }

    #[test]
    fn test_take_final_without_trailer_stays_open() {
        let mut window = ReceiveWindow::new(5, 10, 64);
        assert_eq!(window.take_final(1), None);
        assert!(!window.is_finished());
        assert_eq!(window.offer(4, Bytes::new()), Admission::AckOnly);
    }
}
