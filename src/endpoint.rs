//! 양방향 엔드포인트
//!
//! 하나의 연결 위에서 송신측(재전송 엔진 + 전송 관리자)과 수신측 핸들러를
//! 함께 돌린다. 들어온 프레임은 종류에 따라 분배된다.
//! - MSG, FILE_CHUNK, RESUME_REQUEST: 수신측 핸들러 (응답은 즉시 송신)
//! - 그 외 CONTROL: 재전송 엔진, 필요하면 전송 관리자

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::observer::ProtocolObserver;
use crate::packet::{ControlCmd, ControlPacket, Packet};
use crate::receiver::{Delivery, ReceiverHandler, Reception};
use crate::sender::{ControlRoute, RetransmitEngine};
use crate::transfer::TransferManager;
use crate::transport::Transport;
use crate::{Config, Result};

/// 엔드포인트 핸들
#[derive(Clone)]
pub struct Endpoint {
    engine: RetransmitEngine,
    transfers: TransferManager,
    receiver: Arc<Mutex<ReceiverHandler>>,
    transport: Arc<dyn Transport>,
    deliveries: mpsc::UnboundedSender<Delivery>,
}

impl Endpoint {
    /// 새 엔드포인트 생성. 검증된 수신 데이터 채널을 함께 반환
    pub fn new(
        config: Config,
        transport: Arc<dyn Transport>,
        observer: Arc<dyn ProtocolObserver>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Delivery>)> {
        config.validate()?;

        let receiver = ReceiverHandler::new(&config);
        let engine = RetransmitEngine::new(config, transport.clone(), observer);
        let transfers = TransferManager::new(engine.clone());
        let (tx, rx) = mpsc::unbounded_channel();

        Ok((
            Self {
                engine,
                transfers,
                receiver: Arc::new(Mutex::new(receiver)),
                transport,
                deliveries: tx,
            },
            rx,
        ))
    }

    pub fn engine(&self) -> &RetransmitEngine {
        &self.engine
    }

    pub fn transfers(&self) -> &TransferManager {
        &self.transfers
    }

    /// 원본 프레임 처리
    pub fn handle_frame(&self, frame: &[u8]) {
        match Packet::from_bytes(frame) {
            Ok(packet) => self.handle_packet(packet),
            Err(_) => {
                // 파싱 실패는 수신측이 NACK으로 응답
                let reception = self.receiver.lock().handle_bytes(frame);
                self.dispatch(reception);
            }
        }
    }

    pub fn handle_packet(&self, packet: Packet) {
        match packet {
            Packet::Control(control) if control.cmd != ControlCmd::ResumeRequest => {
                self.on_control(&control);
            }
            packet => {
                let reception = self.receiver.lock().handle(packet);
                self.dispatch(reception);
            }
        }
    }

    fn on_control(&self, control: &ControlPacket) {
        let route = self.engine.handle_control(control);
        let chunk_nack = control.cmd == ControlCmd::Nack && control.target_transfer().is_some();

        if route == ControlRoute::Transfer || chunk_nack {
            self.transfers.handle_control(control);
        }
    }

    /// 응답 송신 후 데이터 전달 (잠금 밖에서)
    fn dispatch(&self, reception: Reception) {
        for response in &reception.responses {
            if let Err(e) = self.transport.send(response) {
                warn!("응답 송신 실패: {}", e);
            }
        }
        for delivery in reception.deliveries {
            if self.deliveries.send(delivery).is_err() {
                debug!("delivery 수신자 없음");
            }
        }
    }

    /// 프레임 채널이 닫힐 때까지 처리
    pub async fn run(&self, mut frames: mpsc::UnboundedReceiver<Vec<u8>>) {
        while let Some(frame) = frames.recv().await {
            self.handle_frame(&frame);
        }
        info!("연결 종료, 수신 루프 종료");
    }

    pub fn shutdown(&self) {
        self.engine.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::time::Duration;

    use bytes::Bytes;

    use crate::chunk::ChunkSource;
    use crate::observer::{ChannelObserver, NoopObserver, ProtocolEvent};
    use crate::packet::{FileChunkPacket, Scope};
    use crate::transfer::TransferPhase;
    use crate::transport::{ChannelTransport, LossyTransport};
    use crate::Error;

    /// 데이터 패킷의 seq를 변조하는 중간자
    struct TamperingTransport {
        inner: ChannelTransport,
    }

    impl Transport for TamperingTransport {
        fn send(&self, packet: &Packet) -> Result<()> {
            let mut packet = packet.clone();
            packet.tamper_sequence(1000);
            self.inner.send(&packet)
        }
    }

    /// 패킷 채널을 상대 엔드포인트로 연결
    fn wire(mut rx: mpsc::UnboundedReceiver<Packet>, peer: Endpoint) {
        tokio::spawn(async move {
            while let Some(packet) = rx.recv().await {
                peer.handle_packet(packet);
            }
        });
    }

    fn endpoint(
        config: Config,
        transport: impl Transport + 'static,
    ) -> (Endpoint, mpsc::UnboundedReceiver<Delivery>) {
        Endpoint::new(config, Arc::new(transport), Arc::new(NoopObserver)).unwrap()
    }

    fn source(len: usize) -> Arc<dyn ChunkSource> {
        Arc::new(Bytes::from((0..len).map(|i| (i % 253) as u8).collect::<Vec<u8>>()))
    }

    async fn wait_for_phase(endpoint: &Endpoint, transfer_id: &str, phase: TransferPhase) {
        for _ in 0..2000 {
            if endpoint.transfers().snapshot(transfer_id).map(|s| s.phase) == Some(phase) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("transfer {} never reached {:?}", transfer_id, phase);
    }

    #[tokio::test]
    async fn test_message_round_trip() {
        let (a_tx, a_wire) = ChannelTransport::new();
        let (b_tx, b_wire) = ChannelTransport::new();
        let (a, _) = endpoint(Config::default(), a_tx);
        let (b, mut b_deliveries) = endpoint(Config::default(), b_tx);
        wire(a_wire, b.clone());
        wire(b_wire, a.clone());

        let receipt = a.engine().send_message("alice", "room:test", "Hello").await.unwrap();
        assert_eq!(receipt.meta.integrity_status.as_deref(), Some("valid"));
        assert_eq!(
            b_deliveries.recv().await,
            Some(Delivery::Message {
                seq: 1,
                from: "alice".into(),
                to: "room:test".into(),
                payload: "Hello".into(),
            })
        );
    }

    #[tokio::test]
    async fn test_file_transfer_completes() {
        let (a_tx, a_wire) = ChannelTransport::new();
        let (b_tx, b_wire) = ChannelTransport::new();
        let (a, _) = endpoint(Config::default(), a_tx);
        let (b, mut b_deliveries) = endpoint(Config::default(), b_tx);
        wire(a_wire, b.clone());
        wire(b_wire, a.clone());

        let id = a.transfers().start_transfer("big.bin", source(200_000)).unwrap();
        wait_for_phase(&a, &id, TransferPhase::Completed).await;

        let snapshot = a.transfers().snapshot(&id).unwrap();
        assert_eq!(snapshot.total_chunks, 4);
        assert_eq!(snapshot.acked.len(), 4);
        assert!(snapshot.completed_at.is_some());

        let mut total = 0;
        let mut complete = false;
        while let Ok(delivery) = b_deliveries.try_recv() {
            match delivery {
                Delivery::Chunk { data, .. } => total += data.len(),
                Delivery::TransferComplete { transfer_id, .. } => complete = transfer_id == id,
                _ => {}
            }
        }
        assert_eq!(total, 200_000);
        assert!(complete);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transfer_survives_loss_and_duplication() {
        let config = Config::default()
            .with_chunk_size(1024)
            .with_window_size(4)
            .with_packet_timeout_ms(200);
        let (a_inner, a_wire) = ChannelTransport::new();
        let (b_inner, b_wire) = ChannelTransport::new();
        let a_tx = LossyTransport::new(a_inner, 0.3, 0.1, 42);
        let b_tx = LossyTransport::new(b_inner, 0.3, 0.1, 43);
        let (a, _) = endpoint(config.clone(), a_tx);
        let (b, _) = endpoint(config, b_tx);
        wire(a_wire, b.clone());
        wire(b_wire, a.clone());

        let id = a.transfers().start_transfer("lossy.bin", source(20 * 1024)).unwrap();
        wait_for_phase(&a, &id, TransferPhase::Completed).await;

        assert_eq!(a.transfers().snapshot(&id).unwrap().acked, (0..20).collect::<BTreeSet<u32>>());
        assert!(a.engine().stats().retransmissions > 0);
    }

    #[tokio::test]
    async fn test_tampered_chunk_trips_kill_switch() {
        let (a_inner, a_wire) = ChannelTransport::new();
        let (b_tx, b_wire) = ChannelTransport::new();
        let (observer, mut events) = ChannelObserver::new();
        let (a, _) = Endpoint::new(
            Config::default(),
            Arc::new(TamperingTransport { inner: a_inner }),
            Arc::new(observer),
        )
        .unwrap();
        let (b, mut b_deliveries) = endpoint(Config::default(), b_tx);
        wire(a_wire, b.clone());
        wire(b_wire, a.clone());

        let id = a.transfers().start_transfer("f.bin", source(10)).unwrap();

        let alert = loop {
            match events.recv().await {
                Some(ProtocolEvent::IntegrityAlert(alert)) => break alert,
                Some(_) => continue,
                None => panic!("observer closed"),
            }
        };
        assert_eq!(alert.scope, Scope::Transfer(id.clone()));
        assert_eq!(alert.seq, 1000);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let snapshot = a.transfers().snapshot(&id).unwrap();
        assert!(snapshot.halted);
        assert!(snapshot.acked.is_empty());
        assert_eq!(snapshot.phase, TransferPhase::Paused);
        assert!(a.engine().is_halted(&Scope::Transfer(id.clone())));
        assert!(b_deliveries.try_recv().is_err());

        // 수동 송신도 거부
        let payload = Bytes::from_static(b"x");
        let chunk = FileChunkPacket::new(id.as_str(), 0, 1, 10, "f.bin", 10, payload);
        assert!(matches!(
            a.engine().send_file_chunk(chunk).await,
            Err(Error::KillSwitch { .. })
        ));
    }

    #[tokio::test]
    async fn test_resume_sends_only_missing_chunks() {
        let config = Config::default().with_chunk_size(4);
        let (b_tx, _b_wire) = ChannelTransport::new();
        let (b, _) = endpoint(config.clone(), b_tx);

        // 이전 연결에서 0, 1, 3번 청크가 도착한 상태
        let data = Bytes::from_static(b"0000111122223333");
        for seq in [0u32, 1, 3] {
            let start = seq as usize * 4;
            let payload = data.slice(start..start + 4);
            let chunk = FileChunkPacket::new("t-resume", seq, 4, 4, "r.bin", 16, payload);
            b.handle_packet(Packet::FileChunk(chunk));
        }

        // 재연결: 새 송신측, 같은 transfer_id
        let (a_tx, mut a_wire) = ChannelTransport::new();
        let (b_tx, b_wire) = ChannelTransport::new();
        let (a, _) = endpoint(config.clone(), a_tx);
        let b = Endpoint {
            transport: Arc::new(b_tx),
            ..b
        };
        wire(b_wire, a.clone());

        let sent = Arc::new(Mutex::new(Vec::new()));
        let log = sent.clone();
        let peer = b.clone();
        tokio::spawn(async move {
            while let Some(packet) = a_wire.recv().await {
                if let Packet::FileChunk(chunk) = &packet {
                    log.lock().push(chunk.seq);
                }
                peer.handle_packet(packet);
            }
        });

        a.transfers()
            .resume_transfer("t-resume", "r.bin", Arc::new(data))
            .unwrap();
        wait_for_phase(&a, "t-resume", TransferPhase::Completed).await;

        assert_eq!(*sent.lock(), vec![2]);
    }
}
