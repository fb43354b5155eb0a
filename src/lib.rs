//! # RAP (Reliable Application Protocol)
//!
//! 순서 보장/무결성 보장이 없는 메시지 채널 위의 애플리케이션 계층 신뢰 전송 프로토콜
//!
//! ## 핵심 특징
//! - **ACK/타임아웃 재전송**: 패킷별 독립 타이머, NACK 즉시 재전송
//! - **청크 전송**: 고정 윈도우 selective repeat, 일시정지/재개/재시도/취소
//! - **재개**: RESUME_REQUEST 후 CUM_ACK/MISSING으로 진행 상태 복구
//! - **무결성 바인딩**: CRC32 XOR seq, seq 변조 탐지
//! - **kill switch**: 무결성 위반 시 해당 범위 송신 중단 (사용자 재개 전까지)

pub mod chunk;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod integrity;
pub mod observer;
pub mod packet;
pub mod receiver;
pub mod sender;
pub mod stats;
pub mod transfer;
pub mod transport;

pub use chunk::{ChunkLayout, ChunkSource, FileAssembler, FileSource};
pub use config::Config;
pub use endpoint::Endpoint;
pub use error::{Error, Result};
pub use observer::{ChannelObserver, IntegrityAlert, NoopObserver, ProtocolEvent, ProtocolObserver};
pub use packet::{
    ControlCmd, ControlMeta, ControlPacket, FileChunkPacket, MsgPacket, Packet, PacketKey, Scope,
};
pub use receiver::{Delivery, ReceiverHandler};
pub use sender::{AckReceipt, ControlRoute, PendingAck, RetransmitEngine};
pub use stats::LinkStats;
pub use transfer::{TransferManager, TransferPhase, TransferSnapshot};
pub use transport::{ChannelTransport, LossyTransport, StreamTransport, Transport};

/// 기본 ACK 대기 타임아웃 (밀리초)
pub const DEFAULT_PACKET_TIMEOUT_MS: u64 = 1500;

/// 기본 최대 재전송 횟수
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// 기본 전송 윈도우 (in-flight 청크 수)
pub const DEFAULT_WINDOW_SIZE: usize = 8;

/// 기본 청크 크기 (바이트)
pub const DEFAULT_CHUNK_SIZE: usize = 65536; // 64KB

/// 기본 CUM_ACK 주기
pub const DEFAULT_CUM_ACK_INTERVAL: u32 = 4;
