//! 수신자 (서버측)
//!
//! - 핸드쉐이크 검증 후 세션 등록
//! - 수신 윈도우 안의 패킷 버퍼링, 순서대로 전달
//! - 트레일러 CRC 비교 후 최종 ACK, linger 동안 재응답

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, trace, warn};

use crate::message::{
    decode_data, trailer_checksum, Ack, Handshake, Seq, SessionId, HANDSHAKE_MIN_LEN,
    SESSION_ID_LEN,
};
use crate::session::{Datagram, Session, SessionSocket};
use crate::stats::TransferStats;
use crate::transfer::TransferSink;
use crate::window::{Admission, ReceiveWindow};
use crate::{Config, Error, Result};

/// 핸드쉐이크를 받아 전송마다 Receiver 를 띄우는 서버
pub struct ReceiveServer {
    socket: Arc<SessionSocket>,
    sink: Arc<dyn TransferSink>,
    config: Arc<Config>,
}

impl ReceiveServer {
    pub fn new(socket: Arc<SessionSocket>, sink: Arc<dyn TransferSink>, config: Config) -> Self {
        Self {
            socket,
            sink,
            config: Arc::new(config),
        }
    }

    pub fn socket(&self) -> &Arc<SessionSocket> {
        &self.socket
    }

    /// 수신 루프와 accept 루프 실행
    ///
    /// 소켓이 닫히면 Ok, 소켓 수신 에러면 Err. 개별 전송의 실패는 로그만 남긴다.
    pub async fn run(&self) -> Result<()> {
        let mut unsessioned = self.socket.unsessioned().ok_or(Error::ChannelError)?;

        let socket = self.socket.clone();
        let mut listener = tokio::spawn(async move { socket.listen().await });

        info!("수신 서버 시작: {}", self.socket.local_addr()?);

        loop {
            tokio::select! {
                result = &mut listener => {
                    return result?;
                }
                Some(datagram) = unsessioned.recv() => {
                    self.handle_candidate(datagram);
                }
            }
        }
    }

    fn handle_candidate(&self, datagram: Datagram) {
        let receiver = match self.accept(&datagram) {
            Ok(receiver) => receiver,
            Err(e) => {
                warn!("{} 핸드쉐이크 거부: {}", datagram.source, e);
                return;
            }
        };

        let sink = self.sink.clone();
        tokio::spawn(async move {
            let id = receiver.session_id();
            if let Err(e) = receiver.run(sink.as_ref()).await {
                error!("세션 {} 수신 실패: {}", id, e);
            }
        });
    }

    /// 세션 없는 datagram 을 핸드쉐이크로 해석하고 세션 등록
    pub fn accept(&self, datagram: &Datagram) -> Result<Receiver> {
        let id = datagram.session_id().ok_or(Error::HandshakeTooShort {
            len: datagram.data.len(),
            min: HANDSHAKE_MIN_LEN + SESSION_ID_LEN,
        })?;

        let frame = Handshake::decode(&datagram.payload())?;
        if !frame.checksum_matches() {
            if self.config.ignore_handshake_checksum {
                warn!(
                    "핸드쉐이크 CRC 불일치 무시: session={} declared={:08X} computed={:08X}",
                    id, frame.declared_crc, frame.computed_crc
                );
            } else {
                return Err(Error::HandshakeChecksum {
                    expected: frame.declared_crc,
                    got: frame.computed_crc,
                });
            }
        }

        let session = self.socket.register_session(datagram.source, Some(id))?;
        Ok(Receiver::new(session, frame.handshake, self.config.clone()))
    }
}

/// 수신 태스크들이 공유하는 상태
struct Shared {
    /// 수신 윈도우 (수집 태스크가 채우고 전달 루프가 비움)
    window: watch::Sender<ReceiveWindow>,

    /// ACK 에 싣는 윈도우 크기
    advertised: u8,

    /// 전송 통계
    stats: Mutex<TransferStats>,
}

/// 전송 하나의 수신자
pub struct Receiver {
    config: Arc<Config>,
    session: Arc<Session>,
    handshake: Handshake,
}

impl Receiver {
    pub fn new(session: Session, handshake: Handshake, config: Arc<Config>) -> Self {
        Self {
            config,
            session: Arc::new(session),
            handshake,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session.id()
    }

    pub fn handshake(&self) -> &Handshake {
        &self.handshake
    }

    /// 수신 실행
    ///
    /// 성공하면 linger 까지 마친 뒤 반환한다. 어느 경우든 세션은 닫히고
    /// sink 스트림도 끝난다.
    pub async fn run(self, sink: &dyn TransferSink) -> Result<TransferStats> {
        let (window, drop_zone) = self.config.effective_receive_window();
        info!(
            "수신 시작: {} ({} bytes) from {} session={}",
            self.handshake.name,
            self.handshake.size,
            self.session.remote_addr(),
            self.session.id()
        );

        let (window_tx, _) = watch::channel(ReceiveWindow::new(1, window, drop_zone));
        let shared = Arc::new(Shared {
            window: window_tx,
            advertised: window,
            stats: Mutex::new(TransferStats::new(self.handshake.size)),
        });

        let (data_tx, data_rx) = mpsc::channel(window as usize);
        let sink_task = sink.open(&self.handshake.name, self.handshake.size, data_rx);
        let collector = tokio::spawn(collect_loop(self.session.clone(), shared.clone()));

        let result = match self.receive(&shared, data_tx).await {
            Ok(()) => {
                let (written, ()) = tokio::join!(sink_task, tokio::time::sleep(self.config.linger));
                match written {
                    Ok(Ok(bytes)) => {
                        debug!("sink 완료: {} bytes", bytes);
                        Ok(())
                    }
                    Ok(Err(e)) => Err(e),
                    Err(e) => Err(e.into()),
                }
            }
            Err(e) => Err(e),
        };

        collector.abort();
        self.session.close();

        let stats = shared.stats.lock().clone();
        match result {
            Ok(()) => {
                info!("수신 완료: {} | {}", self.handshake.name, stats.summary());
                Ok(stats)
            }
            Err(e) => Err(e),
        }
    }

    async fn receive(&self, shared: &Shared, data_tx: mpsc::Sender<Bytes>) -> Result<()> {
        let mut window_rx = shared.window.subscribe();
        let mut hasher = crc32fast::Hasher::new();
        let mut delivered = 0u64;

        self.send_ack(Ack::new(0, shared.advertised)).await?;

        while delivered < self.handshake.size {
            let (seq, payload) = next_in_order(
                shared,
                &mut window_rx,
                self.config.delivery_timeout,
                ReceiveWindow::take_next,
            )
            .await?;

            hasher.update(&payload);
            delivered += payload.len() as u64;
            data_tx
                .send(payload)
                .await
                .map_err(|_| Error::ChannelError)?;
            self.send_ack(Ack::new(seq, shared.advertised)).await?;

            shared.stats.lock().transferred_bytes = delivered;
            trace!("seq {} 전달 ({} / {})", seq, delivered, self.handshake.size);
        }
        drop(data_tx);

        let checksum = hasher.finalize();
        let (trailer, fragment) = next_in_order(
            shared,
            &mut window_rx,
            self.config.final_ack_timeout,
            |w| w.take_final(checksum),
        )
        .await
        .map_err(|e| match e {
            Error::DeliveryTimeout { .. } => Error::FinalAckTimeout,
            other => other,
        })?;
        let declared = trailer_checksum(&fragment).ok_or(Error::Truncated {
            expected: 4,
            got: fragment.len(),
        })?;

        if declared == checksum {
            info!("CRC 일치: {} {:08X}", self.handshake.name, checksum);
        } else {
            error!(
                "CRC 불일치: {} declared={:08X} computed={:08X}",
                self.handshake.name, declared, checksum
            );
        }

        self.send_ack(Ack::with_checksum(trailer, shared.advertised, checksum))
            .await?;
        Ok(())
    }

    async fn send_ack(&self, ack: Ack) -> Result<()> {
        self.session.send(&ack.to_bytes()).await
    }
}

/// 다음 순서 패킷이 버퍼에 들어올 때까지 기다렸다가 꺼냄
async fn next_in_order(
    shared: &Shared,
    window_rx: &mut watch::Receiver<ReceiveWindow>,
    timeout: std::time::Duration,
    mut take: impl FnMut(&mut ReceiveWindow) -> Option<(Seq, Bytes)>,
) -> Result<(Seq, Bytes)> {
    let seq = window_rx.borrow().next_expected();

    match tokio::time::timeout(timeout, wait_for_next(window_rx)).await {
        Ok(true) => {}
        Ok(false) => return Err(Error::ChannelError),
        Err(_) => return Err(Error::DeliveryTimeout { seq }),
    }

    let mut taken = None;
    shared.window.send_if_modified(|w| {
        taken = take(w);
        taken.is_some()
    });
    taken.ok_or(Error::ChannelError)
}

async fn wait_for_next(window_rx: &mut watch::Receiver<ReceiveWindow>) -> bool {
    window_rx.wait_for(ReceiveWindow::has_next).await.is_ok()
}

/// 세션 수신 스트림에서 패킷을 받아 윈도우에 넣는 루프
///
/// drop zone 패킷과 트레일러 재전송에는 여기서 바로 ACK 한다.
async fn collect_loop(session: Arc<Session>, shared: Arc<Shared>) {
    while let Some(payload) = session.recv().await {
        let Some((seq, fragment)) = decode_data(&payload) else {
            trace!("빈 패킷 무시: session={}", session.id());
            continue;
        };

        let mut admission = Admission::Ignored;
        let expected = shared.window.borrow().next_expected();
        shared.window.send_if_modified(|w| {
            admission = w.offer(seq, fragment);
            admission == Admission::Buffered
        });

        let reply = {
            let mut stats = shared.stats.lock();
            stats.packets_received += 1;
            match admission {
                Admission::Buffered => None,
                Admission::Duplicate => {
                    stats.duplicate_packets += 1;
                    None
                }
                Admission::AckOnly => {
                    stats.late_packets += 1;
                    Some(Ack::new(seq, shared.advertised))
                }
                Admission::Final { checksum } => {
                    Some(Ack::with_checksum(seq, shared.advertised, checksum))
                }
                Admission::Ignored => {
                    stats.ignored_packets += 1;
                    None
                }
            }
        };

        if admission == Admission::Ignored {
            warn!(
                "윈도우 밖 패킷 무시: session={} seq={} expected={}",
                session.id(),
                seq,
                expected
            );
        }

        if let Some(ack) = reply {
            if let Err(e) = session.send(&ack.to_bytes()).await {
                debug!("ACK 전송 실패: {}", e);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{encode_data, encode_trailer};
    use crate::transfer::MemorySink;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::net::UdpSocket;

    const ID: [u8; 2] = [0x33, 0x44];

    fn test_config() -> Config {
        Config {
            receive_window: 4,
            drop_zone: 16,
            delivery_timeout: Duration::from_secs(2),
            final_ack_timeout: Duration::from_secs(2),
            linger: Duration::from_millis(200),
            ..Config::default()
        }
    }

    async fn start_server(config: Config) -> (Arc<SessionSocket>, SocketAddr, MemorySink) {
        let socket = Arc::new(
            SessionSocket::bind("127.0.0.1:0".parse().unwrap(), 64)
                .await
                .unwrap(),
        );
        let addr = socket.local_addr().unwrap();
        let sink = MemorySink::new();
        let server = ReceiveServer::new(socket.clone(), Arc::new(sink.clone()), config);
        tokio::spawn(async move { server.run().await });
        (socket, addr, sink)
    }

    async fn send(peer: &UdpSocket, to: SocketAddr, payload: &[u8]) {
        let mut packet = ID.to_vec();
        packet.extend_from_slice(payload);
        peer.send_to(&packet, to).await.unwrap();
    }

    async fn recv_ack(peer: &UdpSocket) -> Ack {
        let mut buf = [0u8; 64];
        let (len, _) = tokio::time::timeout(Duration::from_secs(5), peer.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..2], &ID);
        Ack::from_bytes(&buf[2..len]).unwrap()
    }

    async fn wait_for_file(sink: &MemorySink, name: &str) -> Bytes {
        for _ in 0..100 {
            if let Some(data) = sink.get(name) {
                return data;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("{name} 저장되지 않음");
    }

    #[tokio::test]
    async fn test_reorders_and_acknowledges() {
        let (_socket, server, sink) = start_server(test_config()).await;
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let handshake = Handshake::new("abc.txt", 6).encode(0, false).unwrap();
        send(&peer, server, &handshake).await;
        assert_eq!(recv_ack(&peer).await, Ack::new(0, 4));

        // 3, 1, 2 순서로 도착
        send(&peer, server, &encode_data(3, b"ef")).await;
        send(&peer, server, &encode_data(1, b"ab")).await;
        assert_eq!(recv_ack(&peer).await, Ack::new(1, 4));
        send(&peer, server, &encode_data(2, b"cd")).await;
        assert_eq!(recv_ack(&peer).await, Ack::new(2, 4));
        assert_eq!(recv_ack(&peer).await, Ack::new(3, 4));

        // 늦게 온 재전송은 ACK 만
        send(&peer, server, &encode_data(1, b"ab")).await;
        assert_eq!(recv_ack(&peer).await, Ack::new(1, 4));

        let crc = crc32fast::hash(b"abcdef");
        send(&peer, server, &encode_trailer(4, crc)).await;
        assert_eq!(recv_ack(&peer).await, Ack::with_checksum(4, 4, crc));

        // linger 중 트레일러 재전송에는 다시 최종 ACK
        send(&peer, server, &encode_trailer(4, crc)).await;
        assert_eq!(recv_ack(&peer).await, Ack::with_checksum(4, 4, crc));

        assert_eq!(wait_for_file(&sink, "abc.txt").await.as_ref(), b"abcdef");
    }

    #[tokio::test]
    async fn test_final_ack_carries_local_checksum_on_mismatch() {
        let (_socket, server, _sink) = start_server(test_config()).await;
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        send(&peer, server, &Handshake::new("m", 2).encode(0, false).unwrap()).await;
        recv_ack(&peer).await;
        send(&peer, server, &encode_data(1, b"hi")).await;
        recv_ack(&peer).await;
        send(&peer, server, &encode_trailer(2, 0xDEAD_BEEF)).await;

        let ack = recv_ack(&peer).await;
        assert_eq!(ack.seq, 2);
        assert_eq!(ack.checksum, crc32fast::hash(b"hi"));
    }

    #[tokio::test]
    async fn test_rejects_bad_handshakes() {
        let (socket, server, _sink) = start_server(test_config()).await;
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let mut corrupted = Handshake::new("x", 1).encode(0, false).unwrap().to_vec();
        let last = corrupted.len() - 1;
        corrupted[last] ^= 0x01;
        send(&peer, server, &corrupted).await;
        send(&peer, server, &encode_data(5, b"stray")).await;

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!socket.contains(u16::from_be_bytes(ID)));

        let mut buf = [0u8; 16];
        let nothing =
            tokio::time::timeout(Duration::from_millis(100), peer.recv_from(&mut buf)).await;
        assert!(nothing.is_err(), "거부된 핸드쉐이크에는 응답하지 않음");
    }

    #[tokio::test]
    async fn test_ignore_checksum_accepts_corrupted_handshake() {
        let config = Config {
            ignore_handshake_checksum: true,
            ..test_config()
        };
        let (socket, server, _sink) = start_server(config).await;
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let mut corrupted = Handshake::new("x", 1).encode(0, false).unwrap().to_vec();
        let last = corrupted.len() - 1;
        corrupted[last] ^= 0x01;
        send(&peer, server, &corrupted).await;

        assert_eq!(recv_ack(&peer).await, Ack::new(0, 4));
        assert!(socket.contains(u16::from_be_bytes(ID)));
    }

    #[tokio::test]
    async fn test_delivery_timeout_frees_session() {
        let config = Config {
            delivery_timeout: Duration::from_millis(100),
            ..test_config()
        };
        let (socket, server, sink) = start_server(config).await;
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        send(&peer, server, &Handshake::new("stall", 10).encode(0, false).unwrap()).await;
        recv_ack(&peer).await;
        assert!(socket.contains(u16::from_be_bytes(ID)));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!socket.contains(u16::from_be_bytes(ID)));
        assert!(sink.get("stall").is_none());
    }
}
