//! 송신자 재전송 엔진
//!
//! - 패킷별 ACK 대기 테이블 (PacketKey -> PendingEntry)
//! - 항목별 독립 타이머, 타임아웃/NACK 공용 재시도 카운터
//! - ACK 시 RTT 샘플링
//! - INTEGRITY_FAIL 수신 시 해당 범위 송신 중단 (kill switch)
//!
//! 송신 호출은 ACK 또는 최종 실패까지 호출자를 대기시키지만 다른 송신을 막지 않는다.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::observer::{IntegrityAlert, ProtocolObserver};
use crate::packet::{
    ControlCmd, ControlMeta, ControlPacket, FileChunkPacket, MsgPacket, Packet, PacketKey, Scope,
};
use crate::stats::LinkStats;
use crate::transport::Transport;
use crate::{Config, Error, Result};

/// ACK 수신 결과
#[derive(Debug, Clone)]
pub struct AckReceipt {
    pub key: PacketKey,

    /// ACK에 실려 온 메타 (integrity_status 등)
    pub meta: ControlMeta,

    /// 마지막 (재)전송부터 ACK까지
    pub rtt: Duration,

    /// 재전송 횟수
    pub retries: u32,
}

/// 등록 후 ACK를 기다리는 송신
#[derive(Debug)]
pub struct PendingAck {
    key: PacketKey,
    outcome: oneshot::Receiver<Result<AckReceipt>>,
}

impl PendingAck {
    pub fn key(&self) -> &PacketKey {
        &self.key
    }

    /// ACK 또는 최종 실패까지 대기
    pub async fn wait(self) -> Result<AckReceipt> {
        // 송신측이 사라졌다면 shutdown으로 폐기된 것
        self.outcome.await.unwrap_or(Err(Error::Shutdown))
    }
}

/// 컨트롤 패킷 라우팅 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRoute {
    /// 대기 항목에 반영됨 (또는 메시지 kill switch)
    Matched,

    /// 전송 관리자가 처리해야 함 (CUM_ACK, MISSING, 전송 INTEGRITY_FAIL)
    Transfer,

    /// 매칭되는 대기 항목 없음 (on_control로 전달됨)
    Unmatched,
}

/// 범위별 송신 중단 사유
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    KillSwitch,
    Cancelled,
}

/// 항목 소멸 시 취소되는 지연 태스크
struct RetransmitTimer {
    handle: JoinHandle<()>,
}

impl Drop for RetransmitTimer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// ACK 대기 항목
struct PendingEntry {
    packet: Packet,
    sent_at: Instant,
    retries: u32,

    /// 타이머 세대 (재무장 시 증가, 오래된 타이머 무시용)
    generation: u64,

    /// None이면 이미 결과 전달됨
    outcome: Option<oneshot::Sender<Result<AckReceipt>>>,

    #[allow(dead_code)]
    timer: RetransmitTimer,
}

impl PendingEntry {
    fn resolve(&mut self, result: Result<AckReceipt>) {
        if let Some(tx) = self.outcome.take() {
            let _ = tx.send(result);
        }
    }
}

/// 엔진 내부 상태
struct EngineInner {
    config: Config,
    transport: Arc<dyn Transport>,
    observer: Arc<dyn ProtocolObserver>,

    /// ACK 대기 테이블 (엔진 단독 소유)
    pending: DashMap<PacketKey, PendingEntry>,

    /// 다음 메시지 seq (1부터, 재사용 없음)
    next_seq: AtomicU32,

    next_generation: AtomicU64,

    /// 송신 중단된 범위
    stopped: Mutex<HashMap<Scope, StopReason>>,

    stats: RwLock<LinkStats>,

    running: AtomicBool,
}

impl EngineInner {
    fn transmit(&self, packet: &Packet) {
        // 전송 실패는 타이머 재전송으로 복구
        if let Err(e) = self.transport.send(packet) {
            warn!("송신 실패 ({:?}): {}", packet.key(), e);
        }
    }

    fn stop_reason(&self, scope: &Scope) -> Option<StopReason> {
        self.stopped.lock().get(scope).copied()
    }

    fn stop_error(scope: Scope, reason: StopReason) -> Error {
        match (reason, scope) {
            (StopReason::Cancelled, Scope::Transfer(id)) => Error::TransferCancelled(id),
            (_, scope) => Error::KillSwitch { scope },
        }
    }

    fn arm_timer(self: &Arc<Self>, key: PacketKey, generation: u64) -> RetransmitTimer {
        let weak: Weak<Self> = Arc::downgrade(self);
        let timeout = self.config.packet_timeout();

        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(timeout).await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if !inner.on_timeout(&key, generation) {
                    break;
                }
            }
        });

        RetransmitTimer { handle }
    }

    /// 타이머 만료 처리. 타이머를 계속 돌려야 하면 true
    fn on_timeout(self: &Arc<Self>, key: &PacketKey, generation: u64) -> bool {
        let stop = self.stop_reason(&key.scope());

        let Some(mut entry) = self.pending.get_mut(key) else {
            return false;
        };
        if entry.generation != generation {
            return false;
        }
        self.stats.write().timeouts += 1;

        if let Some(reason) = stop {
            drop(entry);
            debug!("{} 타임아웃, 범위 중단 상태라 재전송 안 함", key);
            self.fail(key, generation, Self::stop_error(key.scope(), reason));
            return false;
        }

        if entry.retries >= self.config.max_retries {
            let retries = entry.retries;
            drop(entry);
            warn!("{} 재전송 한도 초과 (retries={})", key, retries);
            self.fail(
                key,
                generation,
                Error::RetryExhausted {
                    key: key.clone(),
                    retries,
                },
            );
            return false;
        }

        entry.retries += 1;
        entry.sent_at = Instant::now();
        let retries = entry.retries;
        let packet = entry.packet.clone();
        drop(entry);

        debug!("{} 타임아웃 재전송 ({}/{})", key, retries, self.config.max_retries);
        self.transmit(&packet);
        self.stats.write().retransmissions += 1;
        true
    }

    /// 항목 제거 후 실패 결과 전달
    fn fail(&self, key: &PacketKey, generation: u64, err: Error) {
        let removed = self.pending.remove_if(key, |_, e| e.generation == generation);
        if let Some((_, mut entry)) = removed {
            if matches!(err, Error::RetryExhausted { .. }) {
                self.stats.write().failures += 1;
            }
            entry.resolve(Err(err));
        }
    }

    fn on_ack(&self, control: &ControlPacket, key: PacketKey) -> ControlRoute {
        let Some((_, mut entry)) = self.pending.remove(&key) else {
            debug!("대기 항목 없는 ACK: {}", key);
            self.observer.on_control(control);
            return ControlRoute::Unmatched;
        };

        let rtt = entry.sent_at.elapsed();
        {
            let mut stats = self.stats.write();
            stats.acks += 1;
            stats.record_rtt(rtt);
        }

        entry.resolve(Ok(AckReceipt {
            key: key.clone(),
            meta: control.meta.clone(),
            rtt,
            retries: entry.retries,
        }));
        drop(entry);

        debug!("ACK {} (rtt {:.1}ms)", key, rtt.as_secs_f64() * 1000.0);
        self.observer.on_rtt_sample(key.seq(), key.transfer_id(), rtt);
        self.observer.on_ack(key.seq(), key.transfer_id(), &control.meta);
        ControlRoute::Matched
    }

    fn on_nack(self: &Arc<Self>, control: &ControlPacket, key: PacketKey) -> ControlRoute {
        self.stats.write().nacks += 1;
        let stop = self.stop_reason(&key.scope());

        let Some(mut entry) = self.pending.get_mut(&key) else {
            debug!("대기 항목 없는 NACK: {}", key);
            self.observer.on_control(control);
            return ControlRoute::Unmatched;
        };

        warn!(
            "NACK {}: reason={}",
            key,
            control.meta.reason.as_deref().unwrap_or("-")
        );

        if stop.is_some() || entry.retries >= self.config.max_retries {
            let generation = entry.generation;
            let retries = entry.retries;
            drop(entry);

            let err = match stop {
                Some(reason) => Self::stop_error(key.scope(), reason),
                None => Error::RetryExhausted {
                    key: key.clone(),
                    retries,
                },
            };
            self.fail(&key, generation, err);
            self.observer.on_nack(key.seq(), key.transfer_id(), &control.meta, retries);
            return ControlRoute::Matched;
        }

        // 타이머를 기다리지 않고 즉시 재전송, 타이머 재무장
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        entry.retries += 1;
        entry.sent_at = Instant::now();
        entry.generation = generation;
        entry.timer = self.arm_timer(key.clone(), generation);
        let retries = entry.retries;
        let packet = entry.packet.clone();
        drop(entry);

        self.transmit(&packet);
        self.stats.write().retransmissions += 1;
        self.observer.on_nack(key.seq(), key.transfer_id(), &control.meta, retries);
        ControlRoute::Matched
    }

    fn on_integrity_fail(&self, control: &ControlPacket) -> ControlRoute {
        let scope = control.scope();
        error!(
            "무결성 위반 보고: {} seq={} expected={} received={}",
            scope,
            control.seq,
            control.meta.expected.as_deref().unwrap_or("-"),
            control.meta.received.as_deref().unwrap_or("-"),
        );

        self.stats.write().integrity_failures += 1;
        self.stopped.lock().insert(scope.clone(), StopReason::KillSwitch);

        if let Some(key) = control.key() {
            if let Some((_, mut entry)) = self.pending.remove(&key) {
                entry.resolve(Err(Error::IntegrityViolation {
                    key: key.clone(),
                    expected: control.meta.expected.clone().unwrap_or_default(),
                    received: control.meta.received.clone().unwrap_or_default(),
                }));
            }
        }

        self.observer.on_integrity_alert(&IntegrityAlert::from_control(control));

        match scope {
            Scope::Transfer(_) => ControlRoute::Transfer,
            Scope::Messages => ControlRoute::Matched,
        }
    }
}

/// 송신자 재전송 엔진 핸들
#[derive(Clone)]
pub struct RetransmitEngine {
    inner: Arc<EngineInner>,
}

impl RetransmitEngine {
    /// 새 엔진 생성
    pub fn new(
        config: Config,
        transport: Arc<dyn Transport>,
        observer: Arc<dyn ProtocolObserver>,
    ) -> Self {
        let stats = LinkStats::new(config.stats_window_size);
        Self {
            inner: Arc::new(EngineInner {
                config,
                transport,
                observer,
                pending: DashMap::new(),
                next_seq: AtomicU32::new(1),
                next_generation: AtomicU64::new(0),
                stopped: Mutex::new(HashMap::new()),
                stats: RwLock::new(stats),
                running: AtomicBool::new(true),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn observer(&self) -> &Arc<dyn ProtocolObserver> {
        &self.inner.observer
    }

    /// 메시지 송신, ACK 또는 최종 실패까지 대기
    pub async fn send_message(
        &self,
        from: impl Into<String>,
        to: impl Into<String>,
        payload: impl Into<String>,
    ) -> Result<AckReceipt> {
        self.check_scope(&Scope::Messages)?;

        let seq = self.inner.next_seq.fetch_add(1, Ordering::SeqCst);
        let packet = Packet::Msg(MsgPacket::new(seq, from, to, payload));
        self.track(packet)?.wait().await
    }

    /// 파일 청크 송신, ACK 또는 최종 실패까지 대기
    pub async fn send_file_chunk(&self, chunk: FileChunkPacket) -> Result<AckReceipt> {
        self.begin_file_chunk(chunk)?.wait().await
    }

    /// 파일 청크를 대기 테이블에 등록하고 즉시 송신
    ///
    /// 반환 시점에 항목이 이미 등록돼 있으므로 이후의 `retire`가 항목을 찾는다.
    pub fn begin_file_chunk(&self, chunk: FileChunkPacket) -> Result<PendingAck> {
        self.check_scope(&Scope::Transfer(chunk.transfer_id.clone()))?;
        self.track(Packet::FileChunk(chunk))
    }

    fn check_scope(&self, scope: &Scope) -> Result<()> {
        if !self.inner.running.load(Ordering::SeqCst) {
            return Err(Error::Shutdown);
        }
        match self.inner.stop_reason(scope) {
            Some(reason) => Err(EngineInner::stop_error(scope.clone(), reason)),
            None => Ok(()),
        }
    }

    fn track(&self, packet: Packet) -> Result<PendingAck> {
        let Some(key) = packet.key() else {
            return Err(Error::InvalidConfig("control packets are not tracked".into()));
        };

        let (tx, rx) = oneshot::channel();
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let entry = PendingEntry {
            packet: packet.clone(),
            sent_at: Instant::now(),
            retries: 0,
            generation,
            outcome: Some(tx),
            timer: self.inner.arm_timer(key.clone(), generation),
        };

        // 항목 등록 후 송신 (빠른 ACK도 항목을 찾을 수 있도록)
        if let Some(mut previous) = self.inner.pending.insert(key.clone(), entry) {
            debug!("{} 새 전송으로 대체", key);
            previous.resolve(Err(Error::Superseded { key: key.clone() }));
        }

        self.inner.transmit(&packet);
        self.inner.stats.write().packets_sent += 1;
        Ok(PendingAck { key, outcome: rx })
    }

    /// 추적하지 않는 단발 송신 (RESUME_REQUEST 등)
    pub fn send_untracked(&self, packet: &Packet) -> Result<()> {
        self.inner.transport.send(packet)
    }

    /// 수신한 컨트롤 패킷 처리
    ///
    /// ACK/NACK은 대기 항목에 반영하고, CUM_ACK/MISSING은 대기 항목과
    /// 무관하게 전송 관리자로 넘긴다.
    pub fn handle_control(&self, control: &ControlPacket) -> ControlRoute {
        match control.cmd {
            ControlCmd::Ack | ControlCmd::Nack => {
                let Some(key) = control.key() else {
                    self.inner.observer.on_control(control);
                    return ControlRoute::Unmatched;
                };
                if control.cmd == ControlCmd::Ack {
                    self.inner.on_ack(control, key)
                } else {
                    self.inner.on_nack(control, key)
                }
            }
            ControlCmd::CumAck | ControlCmd::Missing => ControlRoute::Transfer,
            ControlCmd::IntegrityFail => self.inner.on_integrity_fail(control),
            ControlCmd::ResumeRequest => {
                self.inner.observer.on_control(control);
                ControlRoute::Unmatched
            }
        }
    }

    /// 누적 ACK 등으로 이미 확인된 항목 정리 (타이머 취소)
    pub fn retire(&self, key: &PacketKey) -> bool {
        match self.inner.pending.remove(key) {
            Some((_, mut entry)) => {
                entry.resolve(Err(Error::Retired { key: key.clone() }));
                true
            }
            None => false,
        }
    }

    /// 전송 취소: 이후 송신 거부, 진행 중 항목은 ACK 또는 다음 타이머 만료로 정리
    pub fn cancel_transfer(&self, transfer_id: &str) {
        self.inner
            .stopped
            .lock()
            .insert(Scope::Transfer(transfer_id.to_string()), StopReason::Cancelled);
    }

    /// kill switch 해제 (사용자 명시적 재개)
    pub fn release(&self, scope: &Scope) -> bool {
        let released = self.inner.stopped.lock().remove(scope).is_some();
        if released {
            info!("{} 송신 재개", scope);
        }
        released
    }

    /// kill switch 발동 여부
    pub fn is_halted(&self, scope: &Scope) -> bool {
        self.inner.stop_reason(scope) == Some(StopReason::KillSwitch)
    }

    pub fn is_pending(&self, key: &PacketKey) -> bool {
        self.inner.pending.contains_key(key)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// 통계 반환
    pub fn stats(&self) -> LinkStats {
        self.inner.stats.read().clone()
    }

    /// 종료: 모든 타이머 취소, 대기 항목은 결과 없이 폐기
    pub fn shutdown(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        let discarded = self.inner.pending.len();
        self.inner.pending.clear();
        info!("재전송 엔진 종료: 대기 항목 {}개 폐기", discarded);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio::sync::mpsc;

    use crate::integrity;
    use crate::observer::{ChannelObserver, ProtocolEvent};
    use crate::transport::ChannelTransport;

    type Wire = mpsc::UnboundedReceiver<Packet>;
    type Events = mpsc::UnboundedReceiver<ProtocolEvent>;

    fn engine_with(config: Config) -> (RetransmitEngine, Wire, Events) {
        let (transport, wire) = ChannelTransport::new();
        let (observer, events) = ChannelObserver::new();
        let engine = RetransmitEngine::new(config, Arc::new(transport), Arc::new(observer));
        (engine, wire, events)
    }

    fn drain(wire: &mut mpsc::UnboundedReceiver<Packet>) -> Vec<Packet> {
        let mut packets = Vec::new();
        while let Ok(p) = wire.try_recv() {
            packets.push(p);
        }
        packets
    }

    #[tokio::test]
    async fn test_message_acked_once() {
        let (engine, mut wire, mut events) = engine_with(Config::default());

        let sender = engine.clone();
        let handle =
            tokio::spawn(async move { sender.send_message("alice", "room:test", "Hello").await });

        let Some(Packet::Msg(msg)) = wire.recv().await else {
            panic!("expected MSG");
        };
        assert_eq!(msg.seq, 1);
        assert_eq!(msg.checksum, Some(integrity::bind_text("Hello", 1)));

        let route = engine.handle_control(&ControlPacket::ack(1, None, ControlMeta::default()));
        assert_eq!(route, ControlRoute::Matched);

        let receipt = handle.await.unwrap().unwrap();
        assert_eq!(receipt.key, PacketKey::Message(1));
        assert_eq!(receipt.retries, 0);

        // 중복 ACK는 매칭되지 않음
        let route = engine.handle_control(&ControlPacket::ack(1, None, ControlMeta::default()));
        assert_eq!(route, ControlRoute::Unmatched);

        let mut acks = 0;
        while let Ok(event) = events.try_recv() {
            if let ProtocolEvent::Ack { seq, .. } = event {
                assert_eq!(seq, 1);
                acks += 1;
            }
        }
        assert_eq!(acks, 1);
        assert_eq!(engine.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_sequence_numbers_increase_from_one() {
        let (engine, mut wire, _events) = engine_with(Config::default());

        for expected in 1..=3u32 {
            let sender = engine.clone();
            tokio::spawn(async move { sender.send_message("a", "b", "x").await });
            let Some(Packet::Msg(msg)) = wire.recv().await else {
                panic!("expected MSG");
            };
            assert_eq!(msg.seq, expected);
        }
        assert_eq!(engine.pending_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_lost_ack_causes_one_retransmission() {
        let (engine, mut wire, _events) = engine_with(Config::default());
        let chunk = FileChunkPacket::new("t-1", 0, 1, 4, "f.bin", 4, Bytes::from_static(b"abcd"));

        let sender = engine.clone();
        let handle = tokio::spawn(async move { sender.send_file_chunk(chunk).await });

        // 첫 전송의 ACK는 유실된 것으로 간주
        let first = wire.recv().await.unwrap();
        let second = wire.recv().await.unwrap();
        assert_eq!(first, second);

        engine.handle_control(&ControlPacket::ack(0, Some("t-1".into()), ControlMeta::default()));
        let receipt = handle.await.unwrap().unwrap();
        assert_eq!(receipt.retries, 1);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(drain(&mut wire).is_empty());
        assert_eq!(engine.stats().retransmissions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion_is_terminal() {
        let (engine, mut wire, _events) = engine_with(Config::default());

        let result = engine.send_message("a", "b", "lost").await;
        assert!(matches!(result, Err(Error::RetryExhausted { retries: 5, .. })));

        // 최초 1회 + 재전송 5회
        assert_eq!(drain(&mut wire).len(), 6);
        assert_eq!(engine.pending_count(), 0);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(drain(&mut wire).is_empty());
        assert_eq!(engine.stats().failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_nack_retransmits_immediately_and_shares_budget() {
        let (engine, mut wire, mut events) = engine_with(Config::default().with_max_retries(1));

        let sender = engine.clone();
        let handle = tokio::spawn(async move { sender.send_message("a", "b", "hi").await });
        wire.recv().await.unwrap();

        let nack = ControlPacket::nack(1, None, "checksum_mismatch");
        assert_eq!(engine.handle_control(&nack), ControlRoute::Matched);
        // 타이머 없이 즉시 재전송
        assert!(wire.try_recv().is_ok());

        engine.handle_control(&nack);
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(Error::RetryExhausted { retries: 1, .. })));
        assert!(drain(&mut wire).is_empty());

        let nacks: Vec<u32> = std::iter::from_fn(|| events.try_recv().ok())
            .filter_map(|e| match e {
                ProtocolEvent::Nack { retries, .. } => Some(retries),
                _ => None,
            })
            .collect();
        assert_eq!(nacks, vec![1, 1]);
    }

    #[tokio::test]
    async fn test_message_integrity_fail_halts_messages() {
        let (engine, mut wire, mut events) = engine_with(Config::default());

        let sender = engine.clone();
        let handle = tokio::spawn(async move { sender.send_message("a", "b", "Hello").await });
        wire.recv().await.unwrap();

        let verdict = integrity::verify(b"Hello", 1001, &integrity::bind_text("Hello", 1));
        let fail = ControlPacket::integrity_fail(1, None, &verdict);
        assert_eq!(engine.handle_control(&fail), ControlRoute::Matched);

        assert!(matches!(handle.await.unwrap(), Err(Error::IntegrityViolation { .. })));
        assert!(engine.is_halted(&Scope::Messages));
        assert!(matches!(
            engine.send_message("a", "b", "again").await,
            Err(Error::KillSwitch { scope: Scope::Messages })
        ));
        assert!(std::iter::from_fn(|| events.try_recv().ok())
            .any(|e| matches!(e, ProtocolEvent::IntegrityAlert(_))));

        assert!(engine.release(&Scope::Messages));
        let sender = engine.clone();
        tokio::spawn(async move { sender.send_message("a", "b", "after").await });
        assert!(matches!(wire.recv().await, Some(Packet::Msg(_))));
    }

    #[tokio::test]
    async fn test_cum_ack_and_missing_route_to_transfer() {
        let (engine, _wire, _events) = engine_with(Config::default());

        assert_eq!(engine.handle_control(&ControlPacket::cum_ack("t", 3)), ControlRoute::Transfer);
        assert_eq!(
            engine.handle_control(&ControlPacket::missing("t", 5, vec![2])),
            ControlRoute::Transfer
        );
    }

    #[tokio::test]
    async fn test_resend_supersedes_pending_entry() {
        let (engine, mut wire, _events) = engine_with(Config::default());
        let chunk = FileChunkPacket::new("t", 0, 1, 1, "f", 1, Bytes::from_static(b"z"));

        let sender = engine.clone();
        let first_chunk = chunk.clone();
        let first = tokio::spawn(async move { sender.send_file_chunk(first_chunk).await });
        wire.recv().await.unwrap();

        let sender = engine.clone();
        let second = tokio::spawn(async move { sender.send_file_chunk(chunk).await });
        wire.recv().await.unwrap();

        assert!(matches!(first.await.unwrap(), Err(Error::Superseded { .. })));
        engine.handle_control(&ControlPacket::ack(0, Some("t".into()), ControlMeta::default()));
        assert!(second.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_discards_pending() {
        let (engine, mut wire, _events) = engine_with(Config::default());

        let sender = engine.clone();
        let handle = tokio::spawn(async move { sender.send_message("a", "b", "x").await });
        wire.recv().await.unwrap();

        engine.shutdown();
        assert_eq!(engine.pending_count(), 0);
        assert!(matches!(handle.await.unwrap(), Err(Error::Shutdown)));
        assert!(matches!(engine.send_message("a", "b", "y").await, Err(Error::Shutdown)));
    }

    #[tokio::test]
    async fn test_begun_chunk_is_registered_before_return() {
        let (engine, mut wire, _events) = engine_with(Config::default());
        let chunk = FileChunkPacket::new("t-1", 0, 2, 4, "f.bin", 8, Bytes::from_static(b"abcd"));

        let pending = engine.begin_file_chunk(chunk).unwrap();
        let key = pending.key().clone();
        assert!(engine.is_pending(&key));
        assert!(matches!(wire.try_recv(), Ok(Packet::FileChunk(_))));

        // 누적 ACK가 곧바로 도착해도 항목을 찾아 정리
        assert!(engine.retire(&key));
        assert!(matches!(pending.wait().await, Err(Error::Retired { .. })));
        assert_eq!(engine.pending_count(), 0);
    }
}
