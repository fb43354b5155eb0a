//! 수신자 프로토콜 핸들러
//!
//! 수신 패킷을 검증하고 ACK/NACK/CUM_ACK/MISSING/INTEGRITY_FAIL로 응답한다.
//! 전송별 수신 상태는 첫 청크 수신 시 생성된다.
//!
//! I/O는 하지 않는다. `handle` 결과의 응답 패킷을 호출자가 송신하고,
//! 검증된 데이터는 `Delivery`로 호스트에 넘긴다.

use std::collections::{BTreeSet, HashMap};

use bytes::Bytes;
use tracing::{debug, error, info, warn};

use crate::integrity;
use crate::packet::{
    has_undecodable_payload, salvage_header, ControlCmd, ControlMeta, ControlPacket,
    FileChunkPacket, MsgPacket, Packet, MSG_TYPE,
};
use crate::Config;

/// NACK 사유: 청크에 transfer_id 없음
pub const REASON_MISSING_TRANSFER_ID: &str = "missing_transfer_id";

/// NACK 사유: 파싱 불가 프레임
pub const REASON_MALFORMED: &str = "malformed_packet";

/// NACK 사유: payload_b64 디코딩 실패
pub const REASON_INVALID_BASE64: &str = "invalid_base64";

/// NACK 사유: 청크 인덱스가 total_chunks 이상
pub const REASON_SEQ_OUT_OF_RANGE: &str = "seq_out_of_range";

/// 첫 청크에서 기록한 전송 메타
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferMeta {
    pub filename: String,
    pub total_chunks: u32,
    pub chunk_size: u32,
    pub total_size: u64,
}

/// 전송별 수신 상태
#[derive(Debug, Clone)]
pub struct ReceiveState {
    pub received: BTreeSet<u32>,

    /// {0..=k} ⊆ received 인 최대 k, 0이 없으면 -1
    pub highest_contiguous: i64,

    /// 마지막으로 보낸 CUM_ACK 값 (단조 증가)
    pub last_cum_ack: i64,

    pub meta: TransferMeta,
}

impl ReceiveState {
    fn new(chunk: &FileChunkPacket) -> Self {
        Self {
            received: BTreeSet::new(),
            highest_contiguous: -1,
            last_cum_ack: -1,
            meta: TransferMeta {
                filename: chunk.filename.clone(),
                total_chunks: chunk.total_chunks,
                chunk_size: chunk.chunk_size,
                total_size: chunk.total_size,
            },
        }
    }

    /// 새로 수신했으면 true
    fn insert(&mut self, seq: u32) -> bool {
        if !self.received.insert(seq) {
            return false;
        }
        while self.received.contains(&((self.highest_contiguous + 1) as u32)) {
            self.highest_contiguous += 1;
        }
        true
    }

    pub fn is_complete(&self) -> bool {
        self.meta.total_chunks > 0 && self.received.len() as u32 == self.meta.total_chunks
    }

    /// 아직 받지 못한 인덱스 전체 (오름차순)
    pub fn missing(&self) -> Vec<u32> {
        (0..self.meta.total_chunks)
            .filter(|i| !self.received.contains(i))
            .collect()
    }

    pub fn highest_received(&self) -> i64 {
        self.received.last().map(|&i| i as i64).unwrap_or(-1)
    }
}

/// 호스트로 넘기는 검증된 데이터
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Message {
        seq: u32,
        from: String,
        to: String,
        payload: String,
    },
    Chunk {
        transfer_id: String,
        seq: u32,
        filename: String,
        total_size: u64,
        chunk_size: u32,
        total_chunks: u32,
        data: Bytes,
    },
    /// 모든 청크 수신 (전송당 한 번)
    TransferComplete {
        transfer_id: String,
        filename: String,
        total_chunks: u32,
        total_size: u64,
    },
}

/// 패킷 하나의 처리 결과
#[derive(Debug, Default)]
pub struct Reception {
    /// 송신측으로 돌려보낼 컨트롤 패킷
    pub responses: Vec<Packet>,
    pub deliveries: Vec<Delivery>,
}

impl Reception {
    fn reply(mut self, control: ControlPacket) -> Self {
        self.responses.push(Packet::Control(control));
        self
    }

    fn deliver(mut self, delivery: Delivery) -> Self {
        self.deliveries.push(delivery);
        self
    }
}

/// 수신자 프로토콜 핸들러
#[derive(Debug)]
pub struct ReceiverHandler {
    cum_ack_interval: u32,
    transfers: HashMap<String, ReceiveState>,

    /// 중복 메시지 억제용 (from, seq) -> payload CRC32
    ///
    /// seq는 송신 엔진마다 1부터 다시 시작하므로 payload까지 같아야 중복이다.
    seen_messages: HashMap<(String, u32), u32>,

    integrity_failures: u64,
}

impl ReceiverHandler {
    pub fn new(config: &Config) -> Self {
        Self {
            cum_ack_interval: config.cum_ack_interval.max(1),
            transfers: HashMap::new(),
            seen_messages: HashMap::new(),
            integrity_failures: 0,
        }
    }

    /// 원본 프레임 처리. 파싱 실패 시 NACK(invalid_base64 또는 malformed_packet)
    pub fn handle_bytes(&mut self, frame: &[u8]) -> Reception {
        match Packet::from_bytes(frame) {
            Ok(packet) => self.handle(packet),
            Err(e) => {
                let (seq, transfer_id) = salvage_header(frame);
                let has_id = transfer_id.as_deref().is_some_and(|id| !id.is_empty());
                let reason = if has_id && has_undecodable_payload(frame) {
                    REASON_INVALID_BASE64
                } else {
                    REASON_MALFORMED
                };
                warn!("잘못된 프레임 (seq={}, {}): {}", seq, reason, e);
                Reception::default().reply(ControlPacket::nack(seq, transfer_id, reason))
            }
        }
    }

    pub fn handle(&mut self, packet: Packet) -> Reception {
        match packet {
            Packet::Msg(msg) => self.on_message(msg),
            Packet::FileChunk(chunk) => self.on_chunk(chunk),
            Packet::Control(control) => self.on_control(&control),
        }
    }

    fn on_message(&mut self, msg: MsgPacket) -> Reception {
        let mut meta = ControlMeta::default();

        // checksum 없는 구버전 메시지는 검증 없이 ACK
        if let Some(declared) = msg.checksum.as_deref() {
            let verdict = integrity::verify(msg.payload.as_bytes(), msg.seq, declared);
            if !verdict.is_valid() {
                self.integrity_failures += 1;
                error!(
                    "MSG 무결성 불일치: seq={} expected={} received={}",
                    msg.seq, verdict.expected, verdict.received
                );
                let fail = ControlPacket::integrity_fail(msg.seq, None, &verdict);
                return Reception::default().reply(fail);
            }
            meta = ControlMeta::valid(&verdict);
            meta.packet_type = Some(MSG_TYPE.to_string());
        }

        let reception = Reception::default().reply(ControlPacket::ack(msg.seq as i64, None, meta));
        let digest = crc32fast::hash(msg.payload.as_bytes());
        let previous = self.seen_messages.insert((msg.from.clone(), msg.seq), digest);
        if previous == Some(digest) {
            debug!("중복 MSG {} from {}, 재ACK만", msg.seq, msg.from);
            return reception;
        }

        reception.deliver(Delivery::Message {
            seq: msg.seq,
            from: msg.from,
            to: msg.to,
            payload: msg.payload,
        })
    }

    fn on_chunk(&mut self, chunk: FileChunkPacket) -> Reception {
        let seq = chunk.seq;
        if chunk.transfer_id.is_empty() {
            warn!("transfer_id 없는 청크 seq={}", seq);
            return Reception::default().reply(ControlPacket::nack(
                seq as i64,
                Some(chunk.transfer_id),
                REASON_MISSING_TRANSFER_ID,
            ));
        }
        let transfer_id = chunk.transfer_id.clone();

        // 무결성 검증이 범위 검사보다 먼저 (seq 변조는 kill switch 대상)
        let verdict = integrity::verify(&chunk.payload, seq, &chunk.checksum);
        if !verdict.is_valid() {
            self.integrity_failures += 1;
            error!(
                "청크 무결성 불일치: {}#{} expected={} received={}",
                transfer_id, seq, verdict.expected, verdict.received
            );
            let fail = ControlPacket::integrity_fail(seq, Some(transfer_id), &verdict);
            return Reception::default().reply(fail);
        }

        let interval = self.cum_ack_interval;
        let state = self
            .transfers
            .entry(transfer_id.clone())
            .or_insert_with(|| ReceiveState::new(&chunk));

        if state.meta.total_chunks > 0 && seq >= state.meta.total_chunks {
            warn!("범위 밖 청크 {}#{} (total {})", transfer_id, seq, state.meta.total_chunks);
            return Reception::default().reply(ControlPacket::nack(
                seq as i64,
                Some(transfer_id),
                REASON_SEQ_OUT_OF_RANGE,
            ));
        }

        let fresh = state.insert(seq);
        let meta = ControlMeta::valid(&verdict);
        let ack = ControlPacket::ack(seq as i64, Some(transfer_id.clone()), meta);
        let mut reception = Reception::default().reply(ack);

        let total = state.meta.total_chunks;
        if total > 0 {
            let hc = state.highest_contiguous;
            let due = seq % interval == 0 || hc == total as i64 - 1;
            if due && hc > state.last_cum_ack {
                state.last_cum_ack = hc;
                reception = reception.reply(ControlPacket::cum_ack(transfer_id.clone(), hc));
            }
        }

        if !fresh {
            debug!("중복 청크 {}#{}, 재ACK만", transfer_id, seq);
            return reception;
        }

        let complete = state.is_complete();
        let meta = state.meta.clone();
        reception = reception.deliver(Delivery::Chunk {
            transfer_id: transfer_id.clone(),
            seq,
            filename: meta.filename.clone(),
            total_size: meta.total_size,
            chunk_size: meta.chunk_size,
            total_chunks: meta.total_chunks,
            data: chunk.payload,
        });

        if complete {
            info!(
                "전송 수신 완료: {} ({}, {} chunks)",
                transfer_id, meta.filename, meta.total_chunks
            );
            reception = reception.deliver(Delivery::TransferComplete {
                transfer_id,
                filename: meta.filename,
                total_chunks: meta.total_chunks,
                total_size: meta.total_size,
            });
        }
        reception
    }

    fn on_control(&mut self, control: &ControlPacket) -> Reception {
        if control.cmd != ControlCmd::ResumeRequest {
            debug!("수신측에서 무시하는 컨트롤: {}", control.cmd);
            return Reception::default();
        }
        let Some(transfer_id) = control.target_transfer() else {
            return Reception::default();
        };

        let Some(state) = self.transfers.get(transfer_id) else {
            debug!("알 수 없는 전송 재개 요청: {}", transfer_id);
            return Reception::default().reply(ControlPacket::cum_ack(transfer_id, -1));
        };

        let missing = state.missing();
        if missing.is_empty() {
            let cum_ack = ControlPacket::cum_ack(transfer_id, state.highest_contiguous);
            return Reception::default().reply(cum_ack);
        }

        info!("재개 요청 {}: 누락 {:?}", transfer_id, missing);
        let answer = ControlPacket::missing(transfer_id, state.highest_received(), missing);
        Reception::default().reply(answer)
    }

    pub fn state(&self, transfer_id: &str) -> Option<&ReceiveState> {
        self.transfers.get(transfer_id)
    }

    pub fn integrity_failures(&self) -> u64 {
        self.integrity_failures
    }
}
