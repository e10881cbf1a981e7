//! 전송 입출력
//!
//! 수신측 `TransferSink` (파일/메모리/버림) 와 송신측 데이터 소스 보조 기능.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ReadBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{Error, Result};

/// 수신 데이터의 목적지
///
/// `open` 은 스트림을 끝까지 소비하는 태스크를 띄우고, 그 태스크는 기록한
/// 바이트 수를 반환한다. 스트림이 닫혔는데 size 에 못 미치면 실패다.
pub trait TransferSink: Send + Sync {
    fn open(&self, name: &str, size: u64, stream: mpsc::Receiver<Bytes>)
        -> JoinHandle<Result<u64>>;
}

/// 디렉터리에 파일로 저장
///
/// 같은 디렉터리의 임시 파일에 쓴 뒤 완료되면 이름을 바꾼다.
#[derive(Debug, Clone)]
pub struct FileSink {
    root: PathBuf,
}

impl FileSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// 경로 구성요소를 떼어낸 파일 이름
fn sanitize_name(name: &str) -> Result<String> {
    Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .map(str::to_owned)
        .ok_or_else(|| Error::InvalidName(name.to_owned()))
}

impl TransferSink for FileSink {
    fn open(
        &self,
        name: &str,
        size: u64,
        stream: mpsc::Receiver<Bytes>,
    ) -> JoinHandle<Result<u64>> {
        let root = self.root.clone();
        let name = name.to_owned();

        tokio::spawn(async move {
            let file_name = sanitize_name(&name)?;
            if file_name != name {
                warn!("전송 이름 {:?} 에서 경로 제거: {:?}", name, file_name);
            }

            let target = root.join(&file_name);
            let temp = root.join(format!(
                ".{}.part-{:08x}",
                file_name,
                rand::random::<u32>()
            ));

            match write_stream(&temp, size, stream).await {
                Ok(written) => {
                    tokio::fs::rename(&temp, &target).await?;
                    info!("파일 저장 완료: {} ({} bytes)", target.display(), written);
                    Ok(written)
                }
                Err(e) => {
                    if let Err(remove) = tokio::fs::remove_file(&temp).await {
                        debug!("임시 파일 삭제 실패 {}: {}", temp.display(), remove);
                    }
                    Err(e)
                }
            }
        })
    }
}

async fn write_stream(path: &Path, size: u64, mut stream: mpsc::Receiver<Bytes>) -> Result<u64> {
    let mut file = tokio::fs::File::create(path).await?;
    let mut written = 0u64;

    while let Some(chunk) = stream.recv().await {
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;

    if written != size {
        return Err(Error::IncompleteTransfer {
            expected: size,
            got: written,
        });
    }
    Ok(written)
}

/// 데이터를 버림 (dry run)
#[derive(Debug, Clone, Default)]
pub struct DiscardSink;

impl TransferSink for DiscardSink {
    fn open(
        &self,
        name: &str,
        size: u64,
        mut stream: mpsc::Receiver<Bytes>,
    ) -> JoinHandle<Result<u64>> {
        let name = name.to_owned();

        tokio::spawn(async move {
            let mut received = 0u64;
            while let Some(chunk) = stream.recv().await {
                received += chunk.len() as u64;
            }
            if received != size {
                return Err(Error::IncompleteTransfer {
                    expected: size,
                    got: received,
                });
            }
            debug!("dry run: {} ({} bytes) 버림", name, received);
            Ok(received)
        })
    }
}

/// 메모리에 보관
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    files: Arc<Mutex<HashMap<String, Bytes>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// 완료된 전송 데이터
    pub fn get(&self, name: &str) -> Option<Bytes> {
        self.files.lock().get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.files.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.lock().is_empty()
    }
}

impl TransferSink for MemorySink {
    fn open(
        &self,
        name: &str,
        size: u64,
        mut stream: mpsc::Receiver<Bytes>,
    ) -> JoinHandle<Result<u64>> {
        let files = self.files.clone();
        let name = name.to_owned();

        tokio::spawn(async move {
            let mut data = BytesMut::with_capacity(size.min(1 << 20) as usize);
            while let Some(chunk) = stream.recv().await {
                data.extend_from_slice(&chunk);
            }
            let received = data.len() as u64;
            if received != size {
                return Err(Error::IncompleteTransfer {
                    expected: size,
                    got: received,
                });
            }
            files.lock().insert(name, data.freeze());
            Ok(received)
        })
    }
}

/// 정해진 길이만큼 난수를 내는 소스 (dry run)
#[derive(Debug, Clone)]
pub struct RandomFill {
    remaining: u64,
}

impl RandomFill {
    pub fn new(size: u64) -> Self {
        Self { remaining: size }
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }
}

impl AsyncRead for RandomFill {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let n = (buf.remaining() as u64).min(self.remaining) as usize;
        if n > 0 {
            let unfilled = buf.initialize_unfilled_to(n);
            rand::thread_rng().fill_bytes(unfilled);
            buf.advance(n);
            self.remaining -= n as u64;
        }
        Poll::Ready(Ok(()))
    }
}

/// 최대 `max` 바이트의 fragment 하나를 읽음
///
/// 소스가 끝나기 전까지는 가능한 한 max 를 채운다. 빈 결과는 EOF.
pub async fn read_fragment<R>(reader: &mut R, max: usize) -> io::Result<Bytes>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = BytesMut::zeroed(max);
    let mut filled = 0;
    while filled < max {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn feed(chunks: &[&'static [u8]]) -> mpsc::Receiver<Bytes> {
        let (tx, rx) = mpsc::channel(chunks.len().max(1));
        for chunk in chunks {
            tx.send(Bytes::from_static(chunk)).await.unwrap();
        }
        rx
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("a.bin").unwrap(), "a.bin");
        assert_eq!(sanitize_name("../../etc/passwd").unwrap(), "passwd");
        assert!(sanitize_name("..").is_err());
        assert!(sanitize_name("").is_err());
    }

    #[tokio::test]
    async fn test_file_sink_writes_and_renames() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::new(dir.path());

        let stream = feed(&[b"hello ", b"world"]).await;
        let written = sink.open("greeting.txt", 11, stream).await.unwrap().unwrap();
        assert_eq!(written, 11);

        let content = tokio::fs::read(dir.path().join("greeting.txt")).await.unwrap();
        assert_eq!(content, b"hello world");
        let entries = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(entries, 1, "임시 파일이 남지 않아야 함");
    }

    #[tokio::test]
    async fn test_file_sink_incomplete_removes_temp() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::new(dir.path());

        let stream = feed(&[b"short"]).await;
        let result = sink.open("partial.bin", 100, stream).await.unwrap();
        assert!(matches!(
            result,
            Err(Error::IncompleteTransfer {
                expected: 100,
                got: 5
            })
        ));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_memory_and_discard_sinks() {
        let memory = MemorySink::new();
        let stream = feed(&[b"ab", b"cd"]).await;
        memory.open("m", 4, stream).await.unwrap().unwrap();
        assert_eq!(memory.get("m").unwrap().as_ref(), b"abcd");

        let stream = feed(&[b"xyz"]).await;
        assert_eq!(DiscardSink.open("d", 3, stream).await.unwrap().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_random_fill_and_read_fragment() {
        let mut source = RandomFill::new(2500);

        let first = read_fragment(&mut source, 1000).await.unwrap();
        let second = read_fragment(&mut source, 1000).await.unwrap();
        let third = read_fragment(&mut source, 1000).await.unwrap();
        let end = read_fragment(&mut source, 1000).await.unwrap();

        assert_eq!(first.len(), 1000);
        assert_eq!(second.len(), 1000);
        assert_eq!(third.len(), 500);
        assert!(end.is_empty());
        assert_eq!(source.remaining(), 0);
    }
}
