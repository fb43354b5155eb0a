//! 프로토콜 설정

use std::time::Duration;

use crate::{
    Error, Result, DEFAULT_CHUNK_SIZE, DEFAULT_CUM_ACK_INTERVAL, DEFAULT_MAX_RETRIES,
    DEFAULT_PACKET_TIMEOUT_MS, DEFAULT_WINDOW_SIZE,
};

/// RAP 프로토콜 설정
#[derive(Debug, Clone)]
pub struct Config {
    /// 패킷별 ACK 대기 타임아웃 (밀리초)
    pub packet_timeout_ms: u64,

    /// 패킷당 최대 재전송 횟수 (타임아웃과 NACK 공용 카운터)
    pub max_retries: u32,

    /// 전송당 동시 in-flight 청크 수
    pub window_size: usize,

    /// 청크 크기 (바이트)
    pub chunk_size: usize,

    /// 수신측 CUM_ACK 주기 (청크 인덱스 기준)
    /// 예: 4 = seq % 4 == 0 일 때 CUM_ACK
    pub cum_ack_interval: u32,

    /// 재개 요청 후 수신측 응답 대기 시간 (밀리초)
    /// 응답이 없으면 로컬 상태로 전송 재개
    pub resume_sync_timeout_ms: u64,

    /// RTT 통계 윈도우 (샘플 수)
    pub stats_window_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            packet_timeout_ms: DEFAULT_PACKET_TIMEOUT_MS, // 1.5초
            max_retries: DEFAULT_MAX_RETRIES,
            window_size: DEFAULT_WINDOW_SIZE,
            chunk_size: DEFAULT_CHUNK_SIZE,
            cum_ack_interval: DEFAULT_CUM_ACK_INTERVAL,
            resume_sync_timeout_ms: DEFAULT_PACKET_TIMEOUT_MS,
            stats_window_size: 100,
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 패킷 타임아웃
    pub fn packet_timeout(&self) -> Duration {
        Duration::from_millis(self.packet_timeout_ms)
    }

    /// 재개 동기화 타임아웃
    pub fn resume_sync_timeout(&self) -> Duration {
        Duration::from_millis(self.resume_sync_timeout_ms)
    }

    pub fn with_packet_timeout_ms(mut self, ms: u64) -> Self {
        self.packet_timeout_ms = ms;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_window_size(mut self, window: usize) -> Self {
        self.window_size = window;
        self
    }

    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size;
        self
    }

    pub fn with_cum_ack_interval(mut self, interval: u32) -> Self {
        self.cum_ack_interval = interval;
        self
    }

    /// 설정 검증
    pub fn validate(&self) -> Result<()> {
        if self.packet_timeout_ms == 0 {
            return Err(Error::InvalidConfig("packet_timeout_ms must be > 0".into()));
        }
        if self.window_size == 0 {
            return Err(Error::InvalidConfig("window_size must be > 0".into()));
        }
        if self.chunk_size == 0 {
            return Err(Error::InvalidConfig("chunk_size must be > 0".into()));
        }
        if self.cum_ack_interval == 0 {
            return Err(Error::InvalidConfig("cum_ack_interval must be > 0".into()));
        }
        Ok(())
    }

    /// 손실이 많은 네트워크용 설정
    pub fn lossy_network() -> Self {
        Self {
            packet_timeout_ms: 3000,
            max_retries: 10,
            window_size: 4,               // 작은 윈도우
            chunk_size: 16 * 1024,        // 16KB
            cum_ack_interval: 2,
            resume_sync_timeout_ms: 3000,
            stats_window_size: 50,
        }
    }

    /// 저지연 LAN용 설정
    pub fn low_latency() -> Self {
        Self {
            packet_timeout_ms: 300,
            max_retries: 5,
            window_size: 32,
            chunk_size: DEFAULT_CHUNK_SIZE,
            cum_ack_interval: 8,
            resume_sync_timeout_ms: 300,
            stats_window_size: 200,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.packet_timeout_ms, 1500);
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.window_size, 8);
        assert_eq!(config.chunk_size, 65536);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_presets_are_valid() {
        let lossy = Config::lossy_network();
        assert!(lossy.validate().is_ok());
        assert!(lossy.max_retries > Config::default().max_retries);

        let fast = Config::low_latency();
        assert!(fast.validate().is_ok());
        assert!(fast.packet_timeout() < Config::default().packet_timeout());
    }

    #[test]
    fn test_validate_rejects_zero_window() {
        let config = Config::default().with_window_size(0);
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }
}
