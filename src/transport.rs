//! 전송 계층 추상화
//!
//! 코어는 "패킷 송신" 능력만 요구한다. 하위 전송은 패킷을 조용히 잃거나
//! 중복시킬 수 있지만 검출 없이 손상시키지는 않는다고 가정한다.

use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::packet::Packet;
use crate::{Error, Result};

/// 패킷 송신 능력
///
/// 호출자를 블로킹하지 않아야 한다 (큐잉 후 즉시 반환).
/// 전송 상태 잠금을 쥔 채 호출될 수 있으므로 상대 엔드포인트를 동기 호출하면 안 된다.
pub trait Transport: Send + Sync {
    fn send(&self, packet: &Packet) -> Result<()>;
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn send(&self, packet: &Packet) -> Result<()> {
        (**self).send(packet)
    }
}

/// 메모리 채널 전송 (테스트/루프백)
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<Packet>,
}

impl ChannelTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Packet>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Transport for ChannelTransport {
    fn send(&self, packet: &Packet) -> Result<()> {
        self.tx.send(packet.clone()).map_err(|_| Error::ChannelClosed)
    }
}

/// 손실/중복 주입 래퍼
pub struct LossyTransport<T> {
    inner: T,
    drop_rate: f64,
    duplicate_rate: f64,
    rng: Mutex<StdRng>,
}

impl<T: Transport> LossyTransport<T> {
    /// 비율은 0.0 ~ 1.0. 같은 seed면 같은 손실 패턴
    pub fn new(inner: T, drop_rate: f64, duplicate_rate: f64, seed: u64) -> Self {
        Self {
            inner,
            drop_rate: drop_rate.clamp(0.0, 1.0),
            duplicate_rate: duplicate_rate.clamp(0.0, 1.0),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl<T: Transport> Transport for LossyTransport<T> {
    fn send(&self, packet: &Packet) -> Result<()> {
        let (dropped, duplicated) = {
            let mut rng = self.rng.lock();
            (rng.gen_bool(self.drop_rate), rng.gen_bool(self.duplicate_rate))
        };

        if dropped {
            debug!("손실 주입: {} {:?}", packet.kind(), packet.key());
            return Ok(());
        }

        self.inner.send(packet)?;
        if duplicated {
            debug!("중복 주입: {} {:?}", packet.kind(), packet.key());
            self.inner.send(packet)?;
        }
        Ok(())
    }
}

/// 줄 단위 JSON 스트림 전송 (TCP 등)
///
/// 송신은 채널에 넣기만 하고, 별도 태스크가 writer에 기록한다.
#[derive(Debug, Clone)]
pub struct StreamTransport {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl StreamTransport {
    /// writer 태스크 시작
    pub fn spawn<W>(writer: W) -> (Self, JoinHandle<Result<()>>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();

        let handle = tokio::spawn(async move {
            let mut writer = writer;
            while let Some(mut frame) = rx.recv().await {
                frame.push(b'\n');
                if let Err(e) = writer.write_all(&frame).await {
                    warn!("송신 에러: {}", e);
                    return Err(Error::Io(e));
                }
            }
            writer.flush().await?;
            Ok(())
        });

        (Self { tx }, handle)
    }
}

impl Transport for StreamTransport {
    fn send(&self, packet: &Packet) -> Result<()> {
        let frame = packet.to_bytes()?;
        self.tx.send(frame).map_err(|_| Error::ConnectionClosed)
    }
}

/// 줄 단위 프레임 수신 태스크 시작
///
/// 파싱은 하지 않는다. 잘못된 프레임에도 NACK으로 응답할 수 있도록 원본 바이트를 넘긴다.
pub fn spawn_line_reader<R>(reader: R) -> (mpsc::UnboundedReceiver<Vec<u8>>, JoinHandle<Result<()>>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();

    let handle = tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            if tx.send(line.into_bytes()).is_err() {
                break;
            }
        }
        Ok(())
    });

    (rx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{ControlPacket, MsgPacket};

    #[tokio::test]
    async fn test_channel_transport() {
        let (transport, mut rx) = ChannelTransport::new();
        let packet = Packet::Msg(MsgPacket::new(1, "a", "b", "hi"));

        transport.send(&packet).unwrap();
        assert_eq!(rx.recv().await, Some(packet));
    }

    #[tokio::test]
    async fn test_lossy_extremes() {
        let (inner, mut rx) = ChannelTransport::new();
        let drop_all = LossyTransport::new(inner.clone(), 1.0, 0.0, 7);
        let dup_all = LossyTransport::new(inner, 0.0, 1.0, 7);
        let packet: Packet = ControlPacket::resume_request("t").into();

        drop_all.send(&packet).unwrap();
        dup_all.send(&packet).unwrap();

        assert_eq!(rx.recv().await, Some(packet.clone()));
        assert_eq!(rx.recv().await, Some(packet));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stream_round_trip_over_duplex() {
        let (client, server) = tokio::io::duplex(1 << 20);
        let (transport, _writer) = StreamTransport::spawn(client);
        let (mut frames, _reader) = spawn_line_reader(server);

        let packet = Packet::Msg(MsgPacket::new(3, "a", "b", "line\nbreak"));
        transport.send(&packet).unwrap();

        let frame = frames.recv().await.unwrap();
        assert_eq!(Packet::from_bytes(&frame).unwrap(), packet);
    }
}
