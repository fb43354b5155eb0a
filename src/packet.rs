//! 와이어 패킷 정의
//!
//! 하나의 양방향 채널 위를 오가는 JSON 객체. `type` 태그로 구분한다.
//! - `MSG`: 짧은 텍스트 메시지
//! - `FILE_CHUNK`: 파일 청크 (payload는 `payload_b64`로 base64 인코딩)
//! - `CONTROL`: ACK/NACK/CUM_ACK/RESUME_REQUEST/MISSING/INTEGRITY_FAIL

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::integrity;
use crate::Result;

/// 메시지 traffic을 나타내는 meta.type 값
pub const MSG_TYPE: &str = "MSG";

/// 청크 패킷 type 태그
pub const FILE_CHUNK_TYPE: &str = "FILE_CHUNK";

/// MITM 시연 기본 seq 오프셋
pub const DEFAULT_TAMPER_OFFSET: u32 = 1000;

/// 통합 패킷 enum
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Packet {
    #[serde(rename = "MSG")]
    Msg(MsgPacket),

    #[serde(rename = "FILE_CHUNK")]
    FileChunk(FileChunkPacket),

    #[serde(rename = "CONTROL")]
    Control(ControlPacket),
}

/// 텍스트 메시지
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MsgPacket {
    /// 송신자 카운터 (1부터, 재사용 없음)
    pub seq: u32,
    pub from: String,
    pub to: String,
    pub payload: String,

    /// 무결성 값 (구버전 호환을 위해 선택)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl MsgPacket {
    /// 무결성 값이 바인딩된 메시지 생성
    pub fn new(
        seq: u32,
        from: impl Into<String>,
        to: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        let payload = payload.into();
        let checksum = Some(integrity::bind_text(&payload, seq));
        Self {
            seq,
            from: from.into(),
            to: to.into(),
            payload,
            checksum,
        }
    }
}

/// 파일 청크
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileChunkPacket {
    /// 비어 있으면 수신측이 NACK(missing_transfer_id)
    #[serde(default)]
    pub transfer_id: String,

    /// 0부터 시작하는 청크 인덱스
    pub seq: u32,
    pub total_chunks: u32,
    pub chunk_size: u32,
    pub filename: String,
    pub total_size: u64,
    pub checksum: String,

    #[serde(rename = "payload_b64", with = "b64")]
    pub payload: Bytes,
}

impl FileChunkPacket {
    /// 무결성 값이 청크 인덱스로 바인딩된 청크 생성
    pub fn new(
        transfer_id: impl Into<String>,
        seq: u32,
        total_chunks: u32,
        chunk_size: u32,
        filename: impl Into<String>,
        total_size: u64,
        payload: Bytes,
    ) -> Self {
        let checksum = integrity::bind(&payload, seq);
        Self {
            transfer_id: transfer_id.into(),
            seq,
            total_chunks,
            chunk_size,
            filename: filename.into(),
            total_size,
            checksum,
            payload,
        }
    }

    /// 파일 내 바이트 오프셋
    pub fn offset(&self) -> u64 {
        self.seq as u64 * self.chunk_size as u64
    }
}

/// 컨트롤 명령
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlCmd {
    Ack,
    Nack,
    CumAck,
    ResumeRequest,
    Missing,
    IntegrityFail,
}

impl fmt::Display for ControlCmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControlCmd::Ack => "ACK",
            ControlCmd::Nack => "NACK",
            ControlCmd::CumAck => "CUM_ACK",
            ControlCmd::ResumeRequest => "RESUME_REQUEST",
            ControlCmd::Missing => "MISSING",
            ControlCmd::IntegrityFail => "INTEGRITY_FAIL",
        };
        f.write_str(name)
    }
}

/// CONTROL.meta (열린 매핑)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub missing: Option<Vec<u32>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received: Option<String>,

    /// 검증 통과 시 "valid"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity_status: Option<String>,

    /// 원 패킷 종류 에코 ("MSG" 등)
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub packet_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<i64>,

    /// 인식하지 않는 키는 그대로 보존
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl ControlMeta {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn with_reason(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Default::default()
        }
    }

    /// 검증 통과 메타
    pub fn valid(verdict: &integrity::Verdict) -> Self {
        Self {
            integrity_status: Some("valid".into()),
            expected: Some(verdict.expected.clone()),
            received: Some(verdict.received.clone()),
            ..Default::default()
        }
    }

    /// 메시지 traffic 여부
    pub fn is_message(&self) -> bool {
        self.packet_type.as_deref() == Some(MSG_TYPE)
    }
}

/// 컨트롤 패킷
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlPacket {
    pub cmd: ControlCmd,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_id: Option<String>,

    /// 음수 허용 (-1 = 연속 수신 없음)
    #[serde(default)]
    pub seq: i64,

    #[serde(default, skip_serializing_if = "ControlMeta::is_empty")]
    pub meta: ControlMeta,
}

impl ControlPacket {
    pub fn new(cmd: ControlCmd, transfer_id: Option<String>, seq: i64, meta: ControlMeta) -> Self {
        Self {
            cmd,
            transfer_id,
            seq,
            meta,
        }
    }

    pub fn ack(seq: i64, transfer_id: Option<String>, meta: ControlMeta) -> Self {
        Self::new(ControlCmd::Ack, transfer_id, seq, meta)
    }

    pub fn nack(seq: i64, transfer_id: Option<String>, reason: impl Into<String>) -> Self {
        Self::new(ControlCmd::Nack, transfer_id, seq, ControlMeta::with_reason(reason))
    }

    pub fn cum_ack(transfer_id: impl Into<String>, highest_contiguous: i64) -> Self {
        Self::new(
            ControlCmd::CumAck,
            Some(transfer_id.into()),
            highest_contiguous,
            ControlMeta::default(),
        )
    }

    /// `seq`에는 수신측이 가진 최대 인덱스를 싣는다
    pub fn missing(
        transfer_id: impl Into<String>,
        highest_received: i64,
        missing: Vec<u32>,
    ) -> Self {
        Self::new(
            ControlCmd::Missing,
            Some(transfer_id.into()),
            highest_received,
            ControlMeta {
                missing: Some(missing),
                ..Default::default()
            },
        )
    }

    pub fn resume_request(transfer_id: impl Into<String>) -> Self {
        Self::new(
            ControlCmd::ResumeRequest,
            Some(transfer_id.into()),
            -1,
            ControlMeta::default(),
        )
    }

    /// kill switch 신호
    pub fn integrity_fail(
        seq: u32,
        transfer_id: Option<String>,
        verdict: &integrity::Verdict,
    ) -> Self {
        let packet_type = transfer_id.is_none().then(|| MSG_TYPE.to_string());
        Self::new(
            ControlCmd::IntegrityFail,
            transfer_id,
            seq as i64,
            ControlMeta {
                reason: Some("integrity_compromised".into()),
                expected: Some(verdict.expected.clone()),
                received: Some(verdict.received.clone()),
                seq: Some(seq as i64),
                packet_type,
                ..Default::default()
            },
        )
    }

    /// 대상 전송 id (메시지 traffic이면 None)
    ///
    /// 구버전 수신측은 메시지 INTEGRITY_FAIL에 transfer_id="MSG"를 싣는다.
    pub fn target_transfer(&self) -> Option<&str> {
        if self.meta.is_message() {
            return None;
        }
        self.transfer_id
            .as_deref()
            .filter(|id| !id.is_empty() && *id != MSG_TYPE)
    }

    /// 대기 항목 키 (seq가 음수면 None)
    pub fn key(&self) -> Option<PacketKey> {
        let seq = u32::try_from(self.seq).ok()?;
        Some(match self.target_transfer() {
            Some(id) => PacketKey::chunk(id, seq),
            None => PacketKey::Message(seq),
        })
    }

    pub fn scope(&self) -> Scope {
        match self.target_transfer() {
            Some(id) => Scope::Transfer(id.to_string()),
            None => Scope::Messages,
        }
    }
}

impl Packet {
    /// JSON 직렬화
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// JSON 역직렬화
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// 패킷 종류 이름
    pub fn kind(&self) -> &'static str {
        match self {
            Packet::Msg(_) => "MSG",
            Packet::FileChunk(_) => "FILE_CHUNK",
            Packet::Control(_) => "CONTROL",
        }
    }

    /// 데이터 패킷의 대기 항목 키
    pub fn key(&self) -> Option<PacketKey> {
        match self {
            Packet::Msg(m) => Some(PacketKey::Message(m.seq)),
            Packet::FileChunk(c) => Some(PacketKey::chunk(&c.transfer_id, c.seq)),
            Packet::Control(_) => None,
        }
    }

    /// MITM 시연: checksum은 그대로 두고 seq만 이동
    ///
    /// 변경 전/후 seq를 반환. 컨트롤 패킷은 건드리지 않는다.
    pub fn tamper_sequence(&mut self, offset: u32) -> Option<(u32, u32)> {
        let seq = match self {
            Packet::Msg(m) => &mut m.seq,
            Packet::FileChunk(c) => &mut c.seq,
            Packet::Control(_) => return None,
        };
        let original = *seq;
        *seq = original.wrapping_add(offset);
        warn!("[MITM] seq 변조: {} -> {}", original, *seq);
        Some((original, *seq))
    }
}

impl From<ControlPacket> for Packet {
    fn from(control: ControlPacket) -> Self {
        Packet::Control(control)
    }
}

/// 파싱 실패 프레임에서 NACK 응답용 seq/transfer_id 추출
pub fn salvage_header(bytes: &[u8]) -> (i64, Option<String>) {
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(bytes) else {
        return (-1, None);
    };
    let seq = value.get("seq").and_then(|v| v.as_i64()).unwrap_or(-1);
    let transfer_id = value
        .get("transfer_id")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    (seq, transfer_id)
}

/// `FILE_CHUNK` 프레임의 `payload_b64`가 base64로 디코딩되지 않으면 true
pub fn has_undecodable_payload(bytes: &[u8]) -> bool {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;

    let Ok(value) = serde_json::from_slice::<serde_json::Value>(bytes) else {
        return false;
    };
    if value.get("type").and_then(|v| v.as_str()) != Some(FILE_CHUNK_TYPE) {
        return false;
    }
    match value.get("payload_b64").and_then(|v| v.as_str()) {
        Some(encoded) => STANDARD.decode(encoded.as_bytes()).is_err(),
        None => false,
    }
}

/// 대기 항목 식별자
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PacketKey {
    /// 메시지 seq
    Message(u32),

    /// (transfer_id, 청크 인덱스)
    Chunk { transfer_id: String, seq: u32 },
}

impl PacketKey {
    pub fn chunk(transfer_id: impl Into<String>, seq: u32) -> Self {
        PacketKey::Chunk {
            transfer_id: transfer_id.into(),
            seq,
        }
    }

    pub fn seq(&self) -> u32 {
        match self {
            PacketKey::Message(seq) => *seq,
            PacketKey::Chunk { seq, .. } => *seq,
        }
    }

    pub fn transfer_id(&self) -> Option<&str> {
        match self {
            PacketKey::Message(_) => None,
            PacketKey::Chunk { transfer_id, .. } => Some(transfer_id),
        }
    }

    pub fn scope(&self) -> Scope {
        match self {
            PacketKey::Message(_) => Scope::Messages,
            PacketKey::Chunk { transfer_id, .. } => Scope::Transfer(transfer_id.clone()),
        }
    }
}

impl fmt::Display for PacketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketKey::Message(seq) => write!(f, "msg#{}", seq),
            PacketKey::Chunk { transfer_id, seq } => write!(f, "chunk {}#{}", transfer_id, seq),
        }
    }
}

/// kill switch 적용 범위
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    /// 메시지 traffic 전체
    Messages,

    /// 특정 파일 전송
    Transfer(String),
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Messages => f.write_str("messages"),
            Scope::Transfer(id) => write!(f, "transfer {}", id),
        }
    }
}

/// `payload_b64` 필드 serde
mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_msg_wire_shape() {
        let packet = Packet::Msg(MsgPacket::new(5, "alice", "room:test", "Hello"));
        let value: serde_json::Value = serde_json::from_slice(&packet.to_bytes().unwrap()).unwrap();

        assert_eq!(value["type"], "MSG");
        assert_eq!(value["seq"], 5);
        assert_eq!(value["checksum"], "f7d18987");
    }

    #[test]
    fn test_chunk_payload_is_base64() {
        let payload = Bytes::from_static(b"abcd");
        let chunk = FileChunkPacket::new("t-1", 2, 4, 4, "blob.bin", 16, payload);
        let bytes = Packet::FileChunk(chunk.clone()).to_bytes().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(value["type"], "FILE_CHUNK");
        assert_eq!(value["payload_b64"], "YWJjZA==");
        assert_eq!(Packet::from_bytes(&bytes).unwrap(), Packet::FileChunk(chunk));
    }

    #[test]
    fn test_control_parses_sparse_shape() {
        let raw = br#"{"type":"CONTROL","cmd":"MISSING","transfer_id":"t-9",
            "meta":{"missing":[3,5],"note":"x"}}"#;
        let Packet::Control(control) = Packet::from_bytes(raw).unwrap() else {
            panic!("expected control");
        };

        assert_eq!(control.cmd, ControlCmd::Missing);
        assert_eq!(control.seq, 0);
        assert_eq!(control.meta.missing, Some(vec![3, 5]));
        assert_eq!(control.meta.extra["note"], "x");
    }

    #[test]
    fn test_message_integrity_fail_targets_messages() {
        // 구버전 형태: transfer_id="MSG"
        let raw = br#"{"type":"CONTROL","cmd":"INTEGRITY_FAIL","seq":4,
            "transfer_id":"MSG","meta":{"type":"MSG"}}"#;
        let Packet::Control(control) = Packet::from_bytes(raw).unwrap() else {
            panic!("expected control");
        };

        assert_eq!(control.scope(), Scope::Messages);
        assert_eq!(control.key(), Some(PacketKey::Message(4)));
    }

    #[test]
    fn test_negative_seq_has_no_key() {
        let control = ControlPacket::cum_ack("t-1", -1);
        assert_eq!(control.key(), None);
        assert_eq!(control.scope(), Scope::Transfer("t-1".into()));
    }

    #[test]
    fn test_tamper_sequence_keeps_checksum() {
        let mut packet = Packet::Msg(MsgPacket::new(5, "a", "b", "Hello"));
        assert_eq!(packet.tamper_sequence(DEFAULT_TAMPER_OFFSET), Some((5, 1005)));

        let Packet::Msg(msg) = packet else { unreachable!() };
        assert_eq!(msg.checksum.as_deref(), Some("f7d18987"));
        assert!(!integrity::verify(msg.payload.as_bytes(), msg.seq, "f7d18987").is_valid());
    }

    #[test]
    fn test_salvage_header() {
        assert_eq!(salvage_header(br#"{"seq":12,"transfer_id":"t"}"#), (12, Some("t".into())));
        assert_eq!(salvage_header(b"not json"), (-1, None));
    }
}
