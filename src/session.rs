//! 세션 다중화 소켓
//!
//! 하나의 UDP 소켓을 여러 전송이 공유한다. 모든 datagram 의 앞 2바이트가
//! 세션 ID이며, listen 루프가 ID별 수신 큐로 분배한다. 등록되지 않은 ID의
//! datagram 은 `unsessioned` 스트림으로 흘러간다 (새 전송의 시작점).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace};

use crate::message::{session_id_of, SessionId, SESSION_ID_LEN};
use crate::{Error, Result};

/// UDP datagram 최대 크기
const MAX_DATAGRAM: usize = 65_535;

/// 세션 없는 datagram 큐 크기
const UNSESSIONED_QUEUE: usize = 1024;

/// 수신 datagram (세션 ID 포함 원본)
#[derive(Debug, Clone)]
pub struct Datagram {
    pub source: SocketAddr,
    pub data: Bytes,
}

impl Datagram {
    pub fn session_id(&self) -> Option<SessionId> {
        session_id_of(&self.data)
    }

    /// 세션 ID 를 뗀 페이로드
    pub fn payload(&self) -> Bytes {
        if self.data.len() < SESSION_ID_LEN {
            return Bytes::new();
        }
        self.data.slice(SESSION_ID_LEN..)
    }
}

/// 세션 하나의 라우팅 정보
struct Route {
    epoch: u64,
    inbound: mpsc::Sender<Bytes>,
    remote: watch::Sender<SocketAddr>,
}

/// 세션 레지스트리 (소켓과 세션이 공유)
struct Registry {
    /// close() 뒤에는 None. 마지막 Arc 가 사라지면 fd 가 닫힌다
    socket: Mutex<Option<Arc<UdpSocket>>>,
    routes: Mutex<HashMap<SessionId, Route>>,
    closed: AtomicBool,
    next_epoch: AtomicU64,
}

impl Registry {
    fn socket(&self) -> Result<Arc<UdpSocket>> {
        self.socket.lock().clone().ok_or(Error::SocketClosed)
    }

    fn remove(&self, id: SessionId, epoch: u64) -> bool {
        let mut routes = self.routes.lock();
        match routes.get(&id) {
            Some(route) if route.epoch == epoch => {
                routes.remove(&id);
                true
            }
            _ => false,
        }
    }
}

/// 세션 다중화 소켓
pub struct SessionSocket {
    registry: Arc<Registry>,
    unsessioned_tx: mpsc::Sender<Datagram>,
    unsessioned_rx: Mutex<Option<mpsc::Receiver<Datagram>>>,
    shutdown: watch::Sender<bool>,
    inbound_queue: usize,
}

impl SessionSocket {
    /// 로컬 주소에 바인딩
    pub async fn bind(addr: SocketAddr, inbound_queue: usize) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self::from_socket(socket, inbound_queue))
    }

    /// 이미 바인딩된 소켓으로 생성
    pub fn from_socket(socket: UdpSocket, inbound_queue: usize) -> Self {
        let (unsessioned_tx, unsessioned_rx) = mpsc::channel(UNSESSIONED_QUEUE);
        let (shutdown, _) = watch::channel(false);

        Self {
            registry: Arc::new(Registry {
                socket: Mutex::new(Some(Arc::new(socket))),
                routes: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
                next_epoch: AtomicU64::new(0),
            }),
            unsessioned_tx,
            unsessioned_rx: Mutex::new(Some(unsessioned_rx)),
            shutdown,
            inbound_queue: inbound_queue.max(1),
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.registry.socket()?.local_addr()?)
    }

    /// 수신 루프
    ///
    /// close() 될 때까지 datagram 을 받아 분배한다. 수신 에러는 재시도하지 않고
    /// 그대로 반환한다. 이미 닫힌 소켓이면 바로 끝난다.
    pub async fn listen(&self) -> Result<()> {
        let mut shutdown = self.shutdown.subscribe();
        let Ok(socket) = self.registry.socket() else {
            return Ok(());
        };
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            tokio::select! {
                _ = wait_closed(&mut shutdown) => {
                    debug!("세션 소켓 수신 루프 종료");
                    return Ok(());
                }
                result = socket.recv_from(&mut buf) => {
                    let (len, source) = result?;
                    self.dispatch(&buf[..len], source);
                }
            }
        }
    }

    /// datagram 하나를 세션 큐 또는 unsessioned 큐로 분배
    fn dispatch(&self, data: &[u8], source: SocketAddr) {
        let Some(id) = session_id_of(data) else {
            trace!("{} bytes datagram from {} 무시 (세션 ID 없음)", data.len(), source);
            return;
        };

        {
            let routes = self.registry.routes.lock();
            if let Some(route) = routes.get(&id) {
                route.remote.send_if_modified(|current| {
                    if *current != source {
                        debug!("세션 {} 주소 변경: {} -> {}", id, current, source);
                        *current = source;
                        true
                    } else {
                        false
                    }
                });

                let payload = Bytes::copy_from_slice(&data[SESSION_ID_LEN..]);
                if let Err(mpsc::error::TrySendError::Full(_)) = route.inbound.try_send(payload) {
                    debug!("세션 {} 수신 큐 가득 참, datagram 버림", id);
                }
                return;
            }
        }

        let datagram = Datagram {
            source,
            data: Bytes::copy_from_slice(data),
        };
        if let Err(mpsc::error::TrySendError::Full(_)) = self.unsessioned_tx.try_send(datagram) {
            debug!("unsessioned 큐 가득 참, datagram 버림 (session={})", id);
        }
    }

    /// 등록되지 않은 세션 ID의 datagram 스트림
    ///
    /// 한 번만 가져갈 수 있다.
    pub fn unsessioned(&self) -> Option<mpsc::Receiver<Datagram>> {
        self.unsessioned_rx.lock().take()
    }

    /// 세션 등록
    ///
    /// known_id 가 없으면 사용 중이지 않은 임의 ID를 고른다.
    pub fn register_session(
        &self,
        address: SocketAddr,
        known_id: Option<SessionId>,
    ) -> Result<Session> {
        let mut routes = self.registry.routes.lock();
        if self.registry.closed.load(Ordering::SeqCst) {
            return Err(Error::SocketClosed);
        }

        let id = match known_id {
            Some(id) if routes.contains_key(&id) => return Err(Error::SessionIdInUse(id)),
            Some(id) => id,
            None => {
                if routes.len() > SessionId::MAX as usize {
                    return Err(Error::SessionIdsExhausted);
                }
                let mut rng = rand::thread_rng();
                loop {
                    let candidate: SessionId = rng.gen();
                    if !routes.contains_key(&candidate) {
                        break candidate;
                    }
                }
            }
        };

        let epoch = self.registry.next_epoch.fetch_add(1, Ordering::Relaxed);
        let (inbound_tx, inbound_rx) = mpsc::channel(self.inbound_queue);
        let (remote_tx, remote_rx) = watch::channel(address);
        routes.insert(
            id,
            Route {
                epoch,
                inbound: inbound_tx,
                remote: remote_tx,
            },
        );

        debug!("세션 등록: id={} remote={}", id, address);

        Ok(Session {
            id,
            epoch,
            registry: self.registry.clone(),
            remote: remote_rx,
            inbound: tokio::sync::Mutex::new(inbound_rx),
        })
    }

    /// 세션 ID 사용 여부
    pub fn contains(&self, id: SessionId) -> bool {
        self.registry.routes.lock().contains_key(&id)
    }

    /// 활성 세션 수
    pub fn session_count(&self) -> usize {
        self.registry.routes.lock().len()
    }

    /// 모든 세션 해제 및 소켓 닫기
    ///
    /// 수신 루프가 끝나고 진행 중인 send 가 끝나면 fd 도 닫힌다.
    pub fn close(&self) {
        {
            let mut routes = self.registry.routes.lock();
            self.registry.closed.store(true, Ordering::SeqCst);
            routes.clear();
        }
        self.registry.socket.lock().take();
        self.shutdown.send_replace(true);
        info!("세션 소켓 닫힘");
    }

    pub fn is_closed(&self) -> bool {
        self.registry.closed.load(Ordering::SeqCst)
    }
}

impl Drop for SessionSocket {
    fn drop(&mut self) {
        self.registry.closed.store(true, Ordering::SeqCst);
        self.registry.socket.lock().take();
        self.shutdown.send_replace(true);
    }
}

async fn wait_closed(shutdown: &mut watch::Receiver<bool>) {
    // 송신측이 사라져도 닫힌 것으로 본다
    let _ = shutdown.wait_for(|closed| *closed).await;
}

/// 하나의 세션 (원격지와의 논리 채널)
pub struct Session {
    id: SessionId,
    epoch: u64,
    registry: Arc<Registry>,
    remote: watch::Receiver<SocketAddr>,
    inbound: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
}

impl Session {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// 현재 원격 주소 (마지막으로 받은 패킷의 출발지)
    pub fn remote_addr(&self) -> SocketAddr {
        *self.remote.borrow()
    }

    /// 원격 주소 변경 감시용
    pub fn watch_remote(&self) -> watch::Receiver<SocketAddr> {
        self.remote.clone()
    }

    /// 세션 ID를 붙여 원격 주소로 전송
    ///
    /// 세션이 닫혀 있어도 보낼 수 있다. 소켓이 닫혔으면 실패한다.
    pub async fn send(&self, payload: &[u8]) -> Result<()> {
        if self.registry.closed.load(Ordering::SeqCst) {
            return Err(Error::SocketClosed);
        }
        let socket = self.registry.socket()?;

        let mut buf = BytesMut::with_capacity(SESSION_ID_LEN + payload.len());
        buf.put_u16(self.id);
        buf.put_slice(payload);

        let target = self.remote_addr();
        socket.send_to(&buf, target).await?;
        trace!("세션 {} -> {}: {} bytes", self.id, target, buf.len());
        Ok(())
    }

    /// 다음 페이로드 (세션 ID 제외)
    ///
    /// 세션이나 소켓이 닫혀 큐가 끊기면 None.
    pub async fn recv(&self) -> Option<Bytes> {
        self.inbound.lock().await.recv().await
    }

    /// 세션 해제 (ID 반환). 여러 번 호출해도 된다
    pub fn close(&self) {
        if self.registry.remove(self.id, self.epoch) {
            debug!("세션 해제: id={}", self.id);
        }
    }

    /// 레지스트리에 아직 살아 있는지
    pub fn is_open(&self) -> bool {
        self.registry
            .routes
            .lock()
            .get(&self.id)
            .is_some_and(|route| route.epoch == self.epoch)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("remote", &self.remote_addr())
            .finish()
    }
}
