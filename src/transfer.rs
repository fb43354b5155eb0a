//! 청크 전송 관리자
//!
//! 파일을 고정 크기 청크로 나누고, 전송당 최대 `window_size`개의 청크를
//! 동시에 ACK 대기 상태로 유지한다 (selective repeat).
//!
//! 상태: STARTING -> TRANSFERRING <-> PAUSED -> COMPLETED | CANCELLED
//!
//! pump는 재진입 안전하다. 청크 선택과 `sent` 등록이 같은 잠금 안에서
//! 이루어지므로 동시에 호출돼도 같은 청크를 두 번 내보내지 않는다.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::SystemTime;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::chunk::{ChunkIndex, ChunkLayout, ChunkSource};
use crate::packet::{ControlCmd, ControlPacket, FileChunkPacket, Packet, PacketKey, Scope};
use crate::sender::{AckReceipt, RetransmitEngine};
use crate::{Error, Result};

/// 전송 단계
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferPhase {
    Starting,
    Transferring,
    Paused,
    Completed,
    Cancelled,
}

/// 청크별 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    Pending,
    Sending,
    Acked,
    /// 재시도 한도 초과, 다음 pump에서 재전송
    Retransmit,
    /// 무결성 위반으로 중단
    Halted,
}

/// 전송 상태 (UI 스냅샷 겸용)
#[derive(Debug, Clone, Serialize)]
pub struct TransferState {
    pub transfer_id: String,
    pub filename: String,
    pub total_size: u64,
    pub chunk_size: u32,
    pub total_chunks: u32,
    pub phase: TransferPhase,

    /// in-flight 또는 ACK된 청크
    pub sent: BTreeSet<ChunkIndex>,
    pub acked: BTreeSet<ChunkIndex>,
    pub nacked: BTreeSet<ChunkIndex>,
    pub retransmit_counts: BTreeMap<ChunkIndex, u32>,
    pub statuses: Vec<ChunkStatus>,

    pub paused: bool,
    pub cancelled: bool,

    /// kill switch 발동 (사용자 resume/retry 전까지 송신 금지)
    pub halted: bool,

    /// 재개 요청 후 수신측 응답 대기
    pub syncing: bool,

    pub last_error: Option<String>,
    pub started_at: SystemTime,
    pub completed_at: Option<SystemTime>,
}

/// UI로 전달되는 스냅샷
pub type TransferSnapshot = TransferState;

impl TransferState {
    fn new(transfer_id: String, filename: String, layout: &ChunkLayout) -> Self {
        Self {
            transfer_id,
            filename,
            total_size: layout.total_size,
            chunk_size: layout.chunk_size,
            total_chunks: layout.total_chunks,
            phase: TransferPhase::Starting,
            sent: BTreeSet::new(),
            acked: BTreeSet::new(),
            nacked: BTreeSet::new(),
            retransmit_counts: BTreeMap::new(),
            statuses: vec![ChunkStatus::Pending; layout.total_chunks as usize],
            paused: false,
            cancelled: false,
            halted: false,
            syncing: false,
            last_error: None,
            started_at: SystemTime::now(),
            completed_at: None,
        }
    }

    /// sent \ acked
    pub fn in_flight(&self) -> BTreeSet<ChunkIndex> {
        self.sent.difference(&self.acked).copied().collect()
    }

    pub fn in_flight_count(&self) -> usize {
        self.sent.difference(&self.acked).count()
    }

    pub fn is_complete(&self) -> bool {
        self.acked.len() as u32 == self.total_chunks
    }

    /// 진행률 (0.0 ~ 1.0)
    pub fn progress(&self) -> f64 {
        if self.total_chunks == 0 {
            return 1.0;
        }
        self.acked.len() as f64 / self.total_chunks as f64
    }

    /// ACK 표시. 새로 표시됐으면 true
    fn mark_acked(&mut self, index: ChunkIndex) -> bool {
        if index >= self.total_chunks || !self.acked.insert(index) {
            return false;
        }
        self.sent.insert(index);
        self.statuses[index as usize] = ChunkStatus::Acked;
        true
    }

    /// 재전송 대상으로 되돌림 (acked면 무시)
    fn release_chunk(&mut self, index: ChunkIndex, status: ChunkStatus) {
        if index >= self.total_chunks || self.acked.contains(&index) {
            return;
        }
        self.sent.remove(&index);
        self.statuses[index as usize] = status;
    }

    fn refresh_phase(&mut self) {
        self.phase = if self.cancelled {
            TransferPhase::Cancelled
        } else if self.is_complete() {
            if self.completed_at.is_none() {
                self.completed_at = Some(SystemTime::now());
            }
            TransferPhase::Completed
        } else if self.paused || self.halted {
            TransferPhase::Paused
        } else if self.syncing {
            TransferPhase::Starting
        } else {
            TransferPhase::Transferring
        };
    }

    fn admits(&self) -> bool {
        !(self.cancelled || self.paused || self.halted || self.syncing || self.is_complete())
    }
}

/// 전송 하나의 상태와 바이트 공급원
struct TransferEntry {
    layout: ChunkLayout,
    source: Arc<dyn ChunkSource>,
    state: Mutex<TransferState>,
}

struct ManagerInner {
    engine: RetransmitEngine,
    transfers: DashMap<String, Arc<TransferEntry>>,
}

/// 청크 전송 관리자 핸들
#[derive(Clone)]
pub struct TransferManager {
    inner: Arc<ManagerInner>,
}

impl TransferManager {
    pub fn new(engine: RetransmitEngine) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                engine,
                transfers: DashMap::new(),
            }),
        }
    }

    pub fn engine(&self) -> &RetransmitEngine {
        &self.inner.engine
    }

    /// 새 전송 시작, transfer_id 반환
    pub fn start_transfer(
        &self,
        filename: impl Into<String>,
        source: Arc<dyn ChunkSource>,
    ) -> Result<String> {
        let transfer_id = uuid::Uuid::new_v4().to_string();
        self.start_transfer_with_id(transfer_id.clone(), filename, source)?;
        Ok(transfer_id)
    }

    /// 지정한 id로 전송 시작
    pub fn start_transfer_with_id(
        &self,
        transfer_id: impl Into<String>,
        filename: impl Into<String>,
        source: Arc<dyn ChunkSource>,
    ) -> Result<()> {
        let transfer_id = transfer_id.into();
        self.register(transfer_id.clone(), filename.into(), source, false)?;
        self.pump(&transfer_id);
        Ok(())
    }

    /// 재연결 후 이전 전송 재개
    ///
    /// RESUME_REQUEST를 보내고 수신측 CUM_ACK/MISSING 응답으로 acked/sent를
    /// 재구성한다. 응답이 없으면 동기화 타임아웃 후 로컬 상태로 진행한다.
    pub fn resume_transfer(
        &self,
        transfer_id: impl Into<String>,
        filename: impl Into<String>,
        source: Arc<dyn ChunkSource>,
    ) -> Result<()> {
        let transfer_id = transfer_id.into();
        self.register(transfer_id.clone(), filename.into(), source, true)?;
        self.request_resume(&transfer_id)?;

        let manager = self.clone();
        let timeout = self.inner.engine.config().resume_sync_timeout();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            manager.finish_sync(&transfer_id);
        });
        Ok(())
    }

    /// 수신측에 RESUME_REQUEST 송신
    pub fn request_resume(&self, transfer_id: &str) -> Result<()> {
        debug!("RESUME_REQUEST 송신: {}", transfer_id);
        self.inner
            .engine
            .send_untracked(&Packet::Control(ControlPacket::resume_request(transfer_id)))
    }

    fn register(
        &self,
        transfer_id: String,
        filename: String,
        source: Arc<dyn ChunkSource>,
        syncing: bool,
    ) -> Result<()> {
        let config = self.inner.engine.config();
        let layout = ChunkLayout::new(source.total_size(), config.chunk_size as u32);

        let mut state = TransferState::new(transfer_id.clone(), filename, &layout);
        state.syncing = syncing;
        state.refresh_phase();

        let snapshot = state.clone();
        match self.inner.transfers.entry(transfer_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(Error::DuplicateTransfer(transfer_id));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::new(TransferEntry {
                    layout,
                    source,
                    state: Mutex::new(state),
                }));
            }
        }

        info!(
            "전송 등록: {} ({}, {} bytes, {} chunks)",
            transfer_id, snapshot.filename, layout.total_size, layout.total_chunks
        );
        self.notify(&snapshot);

        // 이전 kill switch/취소 상태는 새 등록에 적용하지 않음
        self.inner.engine.release(&Scope::Transfer(transfer_id));
        Ok(())
    }

    fn entry(&self, transfer_id: &str) -> Result<Arc<TransferEntry>> {
        self.inner
            .transfers
            .get(transfer_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| Error::UnknownTransfer(transfer_id.to_string()))
    }

    fn notify(&self, snapshot: &TransferSnapshot) {
        self.inner.engine.observer().on_transfer_update(snapshot);
    }

    /// 상태 변경 후 스냅샷 통지
    fn mutate<R>(&self, entry: &TransferEntry, f: impl FnOnce(&mut TransferState) -> R) -> R {
        let (result, snapshot) = {
            let mut state = entry.state.lock();
            let result = f(&mut state);
            state.refresh_phase();
            (result, state.clone())
        };
        self.notify(&snapshot);
        result
    }

    /// 스케줄러 단계: 윈도우가 허용하는 만큼 청크 송신
    pub fn pump(&self, transfer_id: &str) {
        let Ok(entry) = self.entry(transfer_id) else {
            return;
        };
        let window = self.inner.engine.config().window_size;

        let (launches, snapshot) = {
            let mut state = entry.state.lock();
            if !state.admits() {
                return;
            }

            let mut in_flight = state.in_flight_count();
            let mut launches = Vec::new();
            for index in 0..state.total_chunks {
                if in_flight >= window {
                    break;
                }
                if state.acked.contains(&index) || state.sent.contains(&index) {
                    continue;
                }
                state.sent.insert(index);
                state.statuses[index as usize] = ChunkStatus::Sending;
                in_flight += 1;
                launches.push(index);
            }

            if launches.is_empty() {
                return;
            }
            state.refresh_phase();
            (launches, state.clone())
        };

        debug!(
            "pump {}: {:?} 송신 (in-flight {})",
            transfer_id,
            launches,
            snapshot.in_flight_count()
        );
        self.notify(&snapshot);

        for index in launches {
            self.launch(&entry, transfer_id, index);
        }
    }

    fn launch(&self, entry: &Arc<TransferEntry>, transfer_id: &str, index: ChunkIndex) {
        let payload = match entry.source.read_chunk(&entry.layout, index) {
            Ok(payload) => payload,
            Err(e) => {
                error!("청크 읽기 실패 {}#{}: {}", transfer_id, index, e);
                self.mutate(entry, |state| {
                    state.release_chunk(index, ChunkStatus::Pending);
                    state.paused = true;
                    state.last_error = Some(e.to_string());
                });
                return;
            }
        };

        let filename = entry.state.lock().filename.clone();
        let chunk = FileChunkPacket::new(
            transfer_id,
            index,
            entry.layout.total_chunks,
            entry.layout.chunk_size,
            filename,
            entry.layout.total_size,
            payload,
        );

        // admission 재확인과 대기 항목 등록을 같은 잠금 안에서 수행
        // (그 사이 CUM_ACK/MISSING이 청크를 확인했다면 송신하지 않는다)
        let begun = {
            let state = entry.state.lock();
            if state.acked.contains(&index) || !state.sent.contains(&index) || state.cancelled {
                debug!("{}#{} 송신 전 확인/회수됨, 건너뜀", transfer_id, index);
                return;
            }
            self.inner.engine.begin_file_chunk(chunk)
        };

        let manager = self.clone();
        let transfer_id = transfer_id.to_string();
        match begun {
            Ok(pending) => {
                tokio::spawn(async move {
                    let result = pending.wait().await;
                    manager.on_chunk_result(&transfer_id, index, result);
                });
            }
            Err(e) => self.on_chunk_result(&transfer_id, index, Err(e)),
        }
    }

    fn on_chunk_result(&self, transfer_id: &str, index: ChunkIndex, result: Result<AckReceipt>) {
        let Ok(entry) = self.entry(transfer_id) else {
            return;
        };

        let repump = {
            let mut state = entry.state.lock();
            if state.acked.contains(&index) {
                // 누적 ACK 등으로 이미 확인됨
                return;
            }

            let repump = match result {
                Ok(receipt) => {
                    state.mark_acked(index);
                    debug!("{}#{} ACK (retries={})", transfer_id, index, receipt.retries);
                    !state.is_complete()
                }
                // 새 전송 또는 누적 ACK가 이 청크를 맡음
                Err(Error::Superseded { .. } | Error::Retired { .. } | Error::Shutdown) => return,
                Err(e) if e.is_retryable() => {
                    *state.retransmit_counts.entry(index).or_insert(0) += 1;
                    state.release_chunk(index, ChunkStatus::Retransmit);
                    warn!(
                        "{}#{} 재시도 한도 초과, 다음 pump에서 재전송: {}",
                        transfer_id, index, e
                    );
                    true
                }
                Err(Error::IntegrityViolation { .. }) | Err(Error::KillSwitch { .. }) => {
                    state.release_chunk(index, ChunkStatus::Halted);
                    state.halted = true;
                    false
                }
                Err(Error::TransferCancelled(_)) => {
                    state.release_chunk(index, ChunkStatus::Pending);
                    false
                }
                Err(e) => {
                    warn!("{}#{} 송신 실패: {}", transfer_id, index, e);
                    state.release_chunk(index, ChunkStatus::Retransmit);
                    state.last_error = Some(e.to_string());
                    false
                }
            };

            let was_complete = state.phase == TransferPhase::Completed;
            state.refresh_phase();
            if !was_complete && state.phase == TransferPhase::Completed {
                info!("전송 완료: {} ({} chunks)", transfer_id, state.total_chunks);
            }
            let snapshot = state.clone();
            drop(state);
            self.notify(&snapshot);
            repump
        };

        if repump {
            self.pump(transfer_id);
        }
    }

    /// 전송 관련 컨트롤 패킷 처리 (CUM_ACK, MISSING, INTEGRITY_FAIL)
    pub fn handle_control(&self, control: &ControlPacket) -> bool {
        let Some(transfer_id) = control.target_transfer() else {
            return false;
        };
        if !self.inner.transfers.contains_key(transfer_id) {
            debug!("알 수 없는 전송의 {}: {}", control.cmd, transfer_id);
            return false;
        }

        match control.cmd {
            ControlCmd::CumAck => self.apply_cumulative(transfer_id, control.seq),
            ControlCmd::Missing => {
                let missing = control.meta.missing.clone().unwrap_or_default();
                self.apply_missing(transfer_id, control.seq, &missing)
            }
            ControlCmd::IntegrityFail => self.halt(transfer_id, control.seq),
            ControlCmd::Nack => {
                if let Ok(seq) = u32::try_from(control.seq) {
                    self.note_nack(transfer_id, seq);
                }
            }
            _ => return false,
        }
        true
    }

    /// CUM_ACK: 0..=highest 를 acked로 (멱등, 순서 무관)
    pub fn apply_cumulative(&self, transfer_id: &str, highest_contiguous: i64) {
        let Ok(entry) = self.entry(transfer_id) else {
            return;
        };

        let newly = self.mutate(&entry, |state| {
            state.syncing = false;
            let mut newly = Vec::new();
            if highest_contiguous >= 0 && state.total_chunks > 0 {
                let upto = (highest_contiguous as u64).min(state.total_chunks as u64 - 1) as u32;
                for index in 0..=upto {
                    if state.mark_acked(index) {
                        newly.push(index);
                    }
                }
            }
            newly
        });

        if !newly.is_empty() {
            debug!(
                "CUM_ACK {} <= {}: {}개 새로 확인",
                transfer_id,
                highest_contiguous,
                newly.len()
            );
        }
        self.retire(transfer_id, &newly);
        self.pump(transfer_id);
    }

    /// MISSING: 나열된 인덱스는 재전송 대상으로, `highest_received` 이하의
    /// 나머지는 수신측이 가진 것으로 표시
    pub fn apply_missing(&self, transfer_id: &str, highest_received: i64, missing: &[ChunkIndex]) {
        let Ok(entry) = self.entry(transfer_id) else {
            return;
        };
        let missing_set: BTreeSet<ChunkIndex> = missing.iter().copied().collect();

        let newly = self.mutate(&entry, |state| {
            state.syncing = false;
            for &index in &missing_set {
                state.release_chunk(index, ChunkStatus::Pending);
            }

            let mut newly = Vec::new();
            if highest_received >= 0 && state.total_chunks > 0 {
                let upto = (highest_received as u64).min(state.total_chunks as u64 - 1) as u32;
                for index in (0..=upto).filter(|i| !missing_set.contains(i)) {
                    if state.mark_acked(index) {
                        newly.push(index);
                    }
                }
            }
            newly
        });

        info!("MISSING {}: {:?} 재전송 예정", transfer_id, missing_set);
        self.retire(transfer_id, &newly);
        self.pump(transfer_id);
    }

    /// 누적 확인된 청크의 대기 항목 정리
    fn retire(&self, transfer_id: &str, indices: &[ChunkIndex]) {
        for &index in indices {
            self.inner.engine.retire(&PacketKey::chunk(transfer_id, index));
        }
    }

    fn finish_sync(&self, transfer_id: &str) {
        let Ok(entry) = self.entry(transfer_id) else {
            return;
        };
        if !entry.state.lock().syncing {
            return;
        }
        warn!("재개 응답 없음, 로컬 상태로 진행: {}", transfer_id);
        self.mutate(&entry, |state| state.syncing = false);
        self.pump(transfer_id);
    }

    /// kill switch: 새 청크 admission 중단
    fn halt(&self, transfer_id: &str, seq: i64) {
        let Ok(entry) = self.entry(transfer_id) else {
            return;
        };
        error!("kill switch: 전송 {} 중단 (seq={})", transfer_id, seq);
        self.mutate(&entry, |state| {
            state.halted = true;
            if let Ok(index) = u32::try_from(seq) {
                state.release_chunk(index, ChunkStatus::Halted);
            }
            state.last_error = Some(format!("integrity violation at chunk {}", seq));
        });
    }

    fn note_nack(&self, transfer_id: &str, index: ChunkIndex) {
        if let Ok(entry) = self.entry(transfer_id) {
            self.mutate(&entry, |state| {
                if index < state.total_chunks {
                    state.nacked.insert(index);
                }
            });
        }
    }

    /// 일시정지: 새 admission만 막고 in-flight는 정상 처리
    pub fn pause(&self, transfer_id: &str) -> Result<()> {
        let entry = self.entry(transfer_id)?;
        self.mutate(&entry, |state| state.paused = true);
        info!("전송 일시정지: {}", transfer_id);
        Ok(())
    }

    /// 재개 (kill switch 해제 포함)
    pub fn resume(&self, transfer_id: &str) -> Result<()> {
        let entry = self.entry(transfer_id)?;
        self.mutate(&entry, |state| {
            if state.cancelled {
                return Err(Error::TransferCancelled(transfer_id.to_string()));
            }
            state.paused = false;
            state.halted = false;
            Ok(())
        })?;

        self.inner.engine.release(&Scope::Transfer(transfer_id.to_string()));
        info!("전송 재개: {}", transfer_id);
        self.pump(transfer_id);
        Ok(())
    }

    /// 미확인 청크 전부 pending으로 되돌리고 다시 pump
    pub fn retry(&self, transfer_id: &str) -> Result<()> {
        let entry = self.entry(transfer_id)?;
        self.mutate(&entry, |state| {
            if state.cancelled {
                return Err(Error::TransferCancelled(transfer_id.to_string()));
            }
            for index in 0..state.total_chunks {
                state.release_chunk(index, ChunkStatus::Pending);
            }
            state.halted = false;
            state.last_error = None;
            Ok(())
        })?;

        self.inner.engine.release(&Scope::Transfer(transfer_id.to_string()));
        info!("전송 재시도: {}", transfer_id);
        self.pump(transfer_id);
        Ok(())
    }

    /// 취소 (종료 상태). in-flight 청크는 자연스럽게 정리된다
    pub fn cancel(&self, transfer_id: &str) -> Result<()> {
        let entry = self.entry(transfer_id)?;
        self.inner.engine.cancel_transfer(transfer_id);
        self.mutate(&entry, |state| state.cancelled = true);
        info!("전송 취소: {}", transfer_id);
        Ok(())
    }

    pub fn snapshot(&self, transfer_id: &str) -> Option<TransferSnapshot> {
        self.entry(transfer_id).ok().map(|e| e.state.lock().clone())
    }

    pub fn snapshots(&self) -> Vec<TransferSnapshot> {
        self.inner
            .transfers
            .iter()
            .map(|e| e.value().state.lock().clone())
            .collect()
    }

    /// 전송 기록 삭제 (완료 후에도 자동 삭제되지 않음)
    pub fn discard(&self, transfer_id: &str) -> bool {
        let removed = self.inner.transfers.remove(transfer_id).is_some();
        if removed {
            self.inner.engine.release(&Scope::Transfer(transfer_id.to_string()));
        }
        removed
    }
}
