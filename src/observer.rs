//! 호스트(UI) 콜백
//!
//! 단발성 결과는 송신 future로, 스트리밍 이벤트는 observer로 전달된다.

use std::time::Duration;

use tokio::sync::mpsc;

use crate::packet::{ControlMeta, ControlPacket, Scope};
use crate::transfer::TransferSnapshot;

/// kill switch 경보
///
/// 억제하거나 rate-limit 하지 않는다. 호스트는 차단형 알림으로 표시해야 한다.
#[derive(Debug, Clone, PartialEq)]
pub struct IntegrityAlert {
    pub scope: Scope,
    pub seq: i64,
    pub expected: Option<String>,
    pub received: Option<String>,
    pub reason: Option<String>,
}

impl IntegrityAlert {
    pub fn from_control(control: &ControlPacket) -> Self {
        Self {
            scope: control.scope(),
            seq: control.seq,
            expected: control.meta.expected.clone(),
            received: control.meta.received.clone(),
            reason: control.meta.reason.clone(),
        }
    }
}

/// 프로토콜 이벤트 observer
///
/// 모든 메서드는 기본 no-op. 내부 잠금을 잡지 않은 상태에서 호출된다.
pub trait ProtocolObserver: Send + Sync {
    fn on_ack(&self, _seq: u32, _transfer_id: Option<&str>, _meta: &ControlMeta) {}

    fn on_nack(&self, _seq: u32, _transfer_id: Option<&str>, _meta: &ControlMeta, _retries: u32) {}

    fn on_rtt_sample(&self, _seq: u32, _transfer_id: Option<&str>, _rtt: Duration) {}

    /// 대기 항목과 매칭되지 않은 컨트롤 패킷
    fn on_control(&self, _packet: &ControlPacket) {}

    /// 전송 상태 변경마다 호출
    fn on_transfer_update(&self, _snapshot: &TransferSnapshot) {}

    /// kill switch
    fn on_integrity_alert(&self, _alert: &IntegrityAlert) {}
}

/// 아무것도 하지 않는 observer
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl ProtocolObserver for NoopObserver {}

/// 채널로 전달되는 이벤트
#[derive(Debug, Clone)]
pub enum ProtocolEvent {
    Ack {
        seq: u32,
        transfer_id: Option<String>,
        meta: ControlMeta,
    },
    Nack {
        seq: u32,
        transfer_id: Option<String>,
        meta: ControlMeta,
        retries: u32,
    },
    RttSample {
        seq: u32,
        transfer_id: Option<String>,
        rtt: Duration,
    },
    Control(ControlPacket),
    TransferUpdate(TransferSnapshot),
    IntegrityAlert(IntegrityAlert),
}

/// 이벤트를 tokio 채널로 넘기는 observer
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<ProtocolEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProtocolEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn emit(&self, event: ProtocolEvent) {
        // 수신자가 사라져도 프로토콜 진행에는 영향 없음
        let _ = self.tx.send(event);
    }
}

impl ProtocolObserver for ChannelObserver {
    fn on_ack(&self, seq: u32, transfer_id: Option<&str>, meta: &ControlMeta) {
        self.emit(ProtocolEvent::Ack {
            seq,
            transfer_id: transfer_id.map(str::to_string),
            meta: meta.clone(),
        });
    }

    fn on_nack(&self, seq: u32, transfer_id: Option<&str>, meta: &ControlMeta, retries: u32) {
        self.emit(ProtocolEvent::Nack {
            seq,
            transfer_id: transfer_id.map(str::to_string),
            meta: meta.clone(),
            retries,
        });
    }

    fn on_rtt_sample(&self, seq: u32, transfer_id: Option<&str>, rtt: Duration) {
        self.emit(ProtocolEvent::RttSample {
            seq,
            transfer_id: transfer_id.map(str::to_string),
            rtt,
        });
    }

    fn on_control(&self, packet: &ControlPacket) {
        self.emit(ProtocolEvent::Control(packet.clone()));
    }

    fn on_transfer_update(&self, snapshot: &TransferSnapshot) {
        self.emit(ProtocolEvent::TransferUpdate(snapshot.clone()));
    }

    fn on_integrity_alert(&self, alert: &IntegrityAlert) {
        self.emit(ProtocolEvent::IntegrityAlert(alert.clone()));
    }
}
