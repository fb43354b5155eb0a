//! 청크 분할과 재조립
//!
//! - ChunkLayout: 파일 크기/청크 크기로 인덱스별 바이트 범위 계산
//! - ChunkSource: 송신측 바이트 범위 읽기 (메모리 또는 파일)
//! - FileAssembler: 수신측 검증된 청크를 오프셋 위치에 조립

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use crate::{Error, Result};

/// 청크 인덱스 (0부터)
pub type ChunkIndex = u32;

/// 청크 배치 정보
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLayout {
    pub total_size: u64,
    pub chunk_size: u32,
    pub total_chunks: u32,
}

impl ChunkLayout {
    pub fn new(total_size: u64, chunk_size: u32) -> Self {
        let total_chunks = if chunk_size == 0 {
            0
        } else {
            total_size.div_ceil(chunk_size as u64) as u32
        };
        Self {
            total_size,
            chunk_size,
            total_chunks,
        }
    }

    /// 인덱스의 (오프셋, 길이). 범위 밖이면 None
    pub fn range(&self, index: ChunkIndex) -> Option<(u64, usize)> {
        if index >= self.total_chunks {
            return None;
        }
        let offset = index as u64 * self.chunk_size as u64;
        let len = (self.total_size - offset).min(self.chunk_size as u64) as usize;
        Some((offset, len))
    }
}

/// 송신측 바이트 공급원
pub trait ChunkSource: Send + Sync {
    /// 전체 크기
    fn total_size(&self) -> u64;

    /// `offset`부터 `len` 바이트 읽기
    fn read_at(&self, offset: u64, len: usize) -> Result<Bytes>;

    /// 청크 하나 읽기
    fn read_chunk(&self, layout: &ChunkLayout, index: ChunkIndex) -> Result<Bytes> {
        let (offset, len) = layout
            .range(index)
            .ok_or_else(|| Error::InvalidConfig(format!("chunk index {} out of range", index)))?;
        self.read_at(offset, len)
    }
}

impl ChunkSource for Bytes {
    fn total_size(&self) -> u64 {
        self.len() as u64
    }

    fn read_at(&self, offset: u64, len: usize) -> Result<Bytes> {
        let start = (offset as usize).min(self.len());
        let end = (start + len).min(self.len());
        Ok(self.slice(start..end))
    }
}

/// 디스크 파일 공급원
pub struct FileSource {
    file: Mutex<File>,
    size: u64,
}

impl FileSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            file: Mutex::new(file),
            size,
        })
    }
}

impl ChunkSource for FileSource {
    fn total_size(&self) -> u64 {
        self.size
    }

    fn read_at(&self, offset: u64, len: usize) -> Result<Bytes> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;

        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf)?;
        Ok(Bytes::from(buf))
    }
}

/// 수신측 파일 조립기
#[derive(Debug)]
pub struct FileAssembler {
    layout: ChunkLayout,

    /// 전체 데이터
    data: BytesMut,

    /// 수신된 청크 비트맵
    received_chunks: Vec<bool>,

    /// 수신된 청크 수
    pub received_count: u32,

    /// 마지막 청크 삽입 시각
    last_insert: Instant,
}

impl FileAssembler {
    pub fn new(layout: ChunkLayout) -> Self {
        let mut data = BytesMut::with_capacity(layout.total_size as usize);
        data.resize(layout.total_size as usize, 0);

        Self {
            layout,
            data,
            received_chunks: vec![false; layout.total_chunks as usize],
            received_count: 0,
            last_insert: Instant::now(),
        }
    }

    /// 마지막 삽입 이후 경과 시간
    pub fn idle_for(&self) -> Duration {
        self.last_insert.elapsed()
    }

    /// 청크 삽입. 새로 채웠으면 true
    pub fn insert(&mut self, index: ChunkIndex, payload: &[u8]) -> bool {
        let Some((offset, len)) = self.layout.range(index) else {
            return false;
        };

        // 이미 받은 청크면 무시
        if self.received_chunks[index as usize] {
            return false;
        }

        let offset = offset as usize;
        let len = len.min(payload.len());
        self.data[offset..offset + len].copy_from_slice(&payload[..len]);

        self.received_chunks[index as usize] = true;
        self.received_count += 1;
        self.last_insert = Instant::now();
        true
    }

    /// 완료 여부 확인
    pub fn is_complete(&self) -> bool {
        self.received_count >= self.layout.total_chunks
    }

    /// 누락된 청크 인덱스 목록
    pub fn missing(&self) -> Vec<ChunkIndex> {
        self.received_chunks
            .iter()
            .enumerate()
            .filter(|(_, &received)| !received)
            .map(|(id, _)| id as ChunkIndex)
            .collect()
    }

    /// 완료된 데이터 추출
    pub fn into_data(self) -> Bytes {
        self.data.freeze()
    }
}
