//! 무결성 바인딩
//!
//! CRC-32(IEEE, 0xEDB88320 반사 다항식, 초기값/최종값 all-ones 반전)를
//! 시퀀스 번호와 XOR 하여 8자리 소문자 hex로 표현한다.
//! 같은 payload가 다른 seq 위치로 재생(replay)되면 값이 달라진다.
//!
//! 입력 인코딩은 송수신 양측이 바이트 단위로 동일해야 한다.
//! - 메시지: UTF-8 텍스트
//! - 파일 청크: 원본 바이트

/// 무결성 값 계산
pub fn bind(payload: &[u8], seq: u32) -> String {
    format!("{:08x}", crc32fast::hash(payload) ^ seq)
}

/// 텍스트 payload용 (UTF-8)
pub fn bind_text(payload: &str, seq: u32) -> String {
    bind(payload.as_bytes(), seq)
}

/// 검증 결과
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    /// 수신측이 다시 계산한 값
    pub expected: String,

    /// 패킷에 실려 온 값
    pub received: String,
}

impl Verdict {
    /// 대소문자 무시 비교
    pub fn is_valid(&self) -> bool {
        self.expected.eq_ignore_ascii_case(&self.received)
    }
}

/// 선언된 checksum 검증
pub fn verify(payload: &[u8], seq: u32, declared: &str) -> Verdict {
    Verdict {
        expected: bind(payload, seq),
        received: declared.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc_check_value() {
        // CRC-32/ISO-HDLC check value
        assert_eq!(bind(b"123456789", 0), "cbf43926");
        assert_eq!(bind(b"", 0), "00000000");
    }

    #[test]
    fn test_deterministic_and_zero_padded() {
        let a = bind(b"payload", 7);
        assert_eq!(a, bind(b"payload", 7));
        assert_eq!(a.len(), 8);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));

        // 상위 비트가 0이어도 8자리 유지
        assert_eq!(bind(b"", 1), "00000001");
    }

    #[test]
    fn test_sensitive_to_payload_and_seq() {
        let base = bind(b"chunk-data", 3);
        assert_ne!(base, bind(b"chunk-datb", 3));
        assert_ne!(base, bind(b"chunk-data", 4));
    }

    #[test]
    fn test_hello_seq_tampering_detected() {
        let checksum = bind_text("Hello", 5);
        assert_eq!(checksum, "f7d18987");

        assert!(verify("Hello".as_bytes(), 5, &checksum).is_valid());

        // seq 변조 (5 -> 1005)
        let tampered = verify("Hello".as_bytes(), 1005, &checksum);
        assert!(!tampered.is_valid());
        assert_ne!(tampered.expected, tampered.received);
    }

    #[test]
    fn test_case_insensitive_compare() {
        let checksum = bind(b"abc", 9).to_uppercase();
        assert!(verify(b"abc", 9, &checksum).is_valid());
    }
}
