//! 전송 통계

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// 송신측 링크 통계
#[derive(Debug, Clone)]
pub struct LinkStats {
    /// 시작 시간
    pub start_time: Instant,

    /// 최초 전송 패킷 수
    pub packets_sent: u64,

    /// 재전송 수 (타임아웃 + NACK)
    pub retransmissions: u64,

    /// 타임아웃 발생 수
    pub timeouts: u64,

    /// 수신 ACK 수
    pub acks: u64,

    /// 수신 NACK 수
    pub nacks: u64,

    /// 재전송 한도 초과로 실패한 패킷 수
    pub failures: u64,

    /// 무결성 위반 보고 수
    pub integrity_failures: u64,

    /// 최근 RTT 샘플
    rtt_samples: VecDeque<Duration>,

    /// 윈도우 크기
    window_size: usize,

    /// 평활 RTT (RFC 6298 alpha = 1/8)
    smoothed_rtt: Option<Duration>,

    /// 최소 RTT
    min_rtt: Option<Duration>,
}

impl LinkStats {
    pub fn new(window_size: usize) -> Self {
        Self {
            start_time: Instant::now(),
            packets_sent: 0,
            retransmissions: 0,
            timeouts: 0,
            acks: 0,
            nacks: 0,
            failures: 0,
            integrity_failures: 0,
            rtt_samples: VecDeque::with_capacity(window_size),
            window_size: window_size.max(1),
            smoothed_rtt: None,
            min_rtt: None,
        }
    }

    /// RTT 샘플 기록
    pub fn record_rtt(&mut self, rtt: Duration) {
        if self.rtt_samples.len() >= self.window_size {
            self.rtt_samples.pop_front();
        }
        self.rtt_samples.push_back(rtt);

        self.smoothed_rtt = Some(match self.smoothed_rtt {
            Some(srtt) => (srtt * 7 + rtt) / 8,
            None => rtt,
        });
        self.min_rtt = Some(self.min_rtt.map_or(rtt, |m| m.min(rtt)));
    }

    /// 윈도우 평균 RTT
    pub fn average_rtt(&self) -> Option<Duration> {
        if self.rtt_samples.is_empty() {
            return None;
        }
        Some(self.rtt_samples.iter().sum::<Duration>() / self.rtt_samples.len() as u32)
    }

    pub fn smoothed_rtt(&self) -> Option<Duration> {
        self.smoothed_rtt
    }

    pub fn min_rtt(&self) -> Option<Duration> {
        self.min_rtt
    }

    /// 재전송 비율
    pub fn retransmit_ratio(&self) -> f64 {
        if self.packets_sent == 0 {
            return 0.0;
        }
        self.retransmissions as f64 / self.packets_sent as f64
    }

    /// 경과 시간
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        let ms = |d: Option<Duration>| d.map_or(0.0, |d| d.as_secs_f64() * 1000.0);
        format!(
            concat!(
                "Elapsed: {:.2}s | Sent: {} | Retx: {} ({:.1}%) | Timeouts: {} | ",
                "ACKs: {} | NACKs: {} | Failed: {} | Integrity: {} | ",
                "RTT avg {:.1}ms / srtt {:.1}ms / min {:.1}ms"
            ),
            self.elapsed().as_secs_f64(),
            self.packets_sent,
            self.retransmissions,
            self.retransmit_ratio() * 100.0,
            self.timeouts,
            self.acks,
            self.nacks,
            self.failures,
            self.integrity_failures,
            ms(self.average_rtt()),
            ms(self.smoothed_rtt),
            ms(self.min_rtt),
        )
    }
}

impl Default for LinkStats {
    fn default() -> Self {
        Self::new(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rtt_window() {
        let mut stats = LinkStats::new(2);
        stats.record_rtt(Duration::from_millis(10));
        stats.record_rtt(Duration::from_millis(20));
        stats.record_rtt(Duration::from_millis(40));

        // 윈도우 2: 20, 40
        assert_eq!(stats.average_rtt(), Some(Duration::from_millis(30)));
        assert_eq!(stats.min_rtt(), Some(Duration::from_millis(10)));
        assert!(stats.smoothed_rtt().is_some());
    }

    #[test]
    fn test_retransmit_ratio() {
        let mut stats = LinkStats::default();
        assert_eq!(stats.retransmit_ratio(), 0.0);

        stats.packets_sent = 4;
        stats.retransmissions = 1;
        assert!((stats.retransmit_ratio() - 0.25).abs() < f64::EPSILON);
        assert!(stats.summary().contains("Retx: 1"));
    }
}
