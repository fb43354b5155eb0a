//! 에러 타입 정의

use thiserror::Error;

use crate::packet::{PacketKey, Scope};

/// RAP 프로토콜 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("직렬화 에러: {0}")]
    Serialization(#[from] serde_json::Error),

    /// 타임아웃/NACK 재전송 한도 초과 (종료 상태)
    #[error("재전송 한도 초과: {key}, retries={retries}")]
    RetryExhausted { key: PacketKey, retries: u32 },

    /// 수신측이 무결성 불일치를 보고함 (자동 재시도 금지)
    #[error("무결성 위반: {key}, expected {expected}, received {received}")]
    IntegrityViolation {
        key: PacketKey,
        expected: String,
        received: String,
    },

    /// kill switch 발동으로 송신 거부
    #[error("kill switch 발동 중: {scope}")]
    KillSwitch { scope: Scope },

    /// 같은 키의 새 전송이 대기 항목을 대체함
    #[error("대기 항목 대체됨: {key}")]
    Superseded { key: PacketKey },

    /// 누적 ACK로 대기 항목이 정리됨
    #[error("누적 ACK로 정리됨: {key}")]
    Retired { key: PacketKey },

    #[error("엔진 종료됨")]
    Shutdown,

    #[error("알 수 없는 전송: {0}")]
    UnknownTransfer(String),

    #[error("이미 존재하는 전송: {0}")]
    DuplicateTransfer(String),

    #[error("취소된 전송: {0}")]
    TransferCancelled(String),

    #[error("유효하지 않은 설정: {0}")]
    InvalidConfig(String),

    #[error("채널 에러")]
    ChannelClosed,

    #[error("연결 종료")]
    ConnectionClosed,
}

impl Error {
    /// 재전송 예산 내에서 복구 가능한 실패인지
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::RetryExhausted { .. })
    }
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
