//! RAP 클라이언트 (송신자)
//!
//! 서버에 연결해 메시지와 파일을 신뢰 전송한다.
//! - 메시지: ACK/타임아웃 재전송
//! - 파일: 윈도우 기반 청크 전송, `--resume`으로 이전 전송 재개
//! - `--loss`/`--dup`로 손실/중복 주입
//! - kill switch 발동 시 0이 아닌 코드로 종료
//!
//! 사용법:
//!   cargo run --release --bin rap-client -- [OPTIONS]
//!
//! 예시:
//!   # 메시지 두 개 전송
//!   cargo run --release --bin rap-client -- -m "hello" -m "world"
//!
//!   # 20% 손실 환경에서 파일 전송
//!   cargo run --release --bin rap-client -- --file data.bin --loss 0.2

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::net::TcpStream;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use rap::transport::{spawn_line_reader, LossyTransport, StreamTransport};
use rap::{ChannelObserver, Config, Endpoint, Error, FileSource, ProtocolEvent, TransferPhase};

/// 설정 프리셋
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Profile {
    Default,
    /// 손실이 많은 네트워크
    Lossy,
    /// 저지연 LAN
    LowLatency,
}

impl Profile {
    fn config(self) -> Config {
        match self {
            Profile::Default => Config::default(),
            Profile::Lossy => Config::lossy_network(),
            Profile::LowLatency => Config::low_latency(),
        }
    }
}

/// RAP 클라이언트 - 신뢰 전송 프로토콜 송신측
#[derive(Parser, Debug)]
#[command(name = "rap-client", author, version, about, long_about = None)]
struct Args {
    /// 서버 주소
    #[arg(short, long, default_value = "127.0.0.1:9000")]
    server: SocketAddr,

    /// 전송할 메시지 (여러 번 지정 가능)
    #[arg(short, long)]
    message: Vec<String>,

    /// 전송할 파일
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// 이전 전송 id로 재개 (`--file` 필요)
    #[arg(long, requires = "file")]
    resume: Option<String>,

    /// 송신자 이름
    #[arg(long, default_value = "cli")]
    from: String,

    /// 수신 대상
    #[arg(long, default_value = "room:default")]
    to: String,

    /// 송신 패킷 손실 비율 (0.0~1.0)
    #[arg(long, default_value_t = 0.0)]
    loss: f64,

    /// 송신 패킷 중복 비율 (0.0~1.0)
    #[arg(long, default_value_t = 0.0)]
    dup: f64,

    /// 손실 주입 seed
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// 설정 프리셋 (아래 개별 옵션이 덮어씀)
    #[arg(long, value_enum, default_value_t = Profile::Default)]
    profile: Profile,

    /// in-flight 청크 수
    #[arg(short, long)]
    window: Option<usize>,

    /// 청크 크기 (바이트)
    #[arg(long)]
    chunk_size: Option<usize>,

    /// ACK 대기 타임아웃 (밀리초)
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// 패킷당 최대 재전송 횟수
    #[arg(long)]
    max_retries: Option<u32>,
}

impl Args {
    fn config(&self) -> Config {
        let mut config = self.profile.config();
        if let Some(window) = self.window {
            config = config.with_window_size(window);
        }
        if let Some(size) = self.chunk_size {
            config = config.with_chunk_size(size);
        }
        if let Some(ms) = self.timeout_ms {
            config = config.with_packet_timeout_ms(ms);
        }
        if let Some(retries) = self.max_retries {
            config = config.with_max_retries(retries);
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    // 로깅 설정 (RUST_LOG 우선)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = args.config();
    config.validate()?;

    info!("RAP Client starting...");
    info!("Server: {} (profile {:?})", args.server, args.profile);
    info!(
        "Window: {}, chunk: {} bytes, timeout: {}ms",
        config.window_size, config.chunk_size, config.packet_timeout_ms
    );
    if args.loss > 0.0 || args.dup > 0.0 {
        info!(
            "손실 주입: loss={:.1}% dup={:.1}% seed={}",
            args.loss * 100.0,
            args.dup * 100.0,
            args.seed
        );
    }

    // 연결
    let stream = TcpStream::connect(args.server).await?;
    stream.set_nodelay(true)?;
    let (read_half, write_half) = stream.into_split();
    let (frames, _reader) = spawn_line_reader(read_half);
    let (stream_transport, _writer) = StreamTransport::spawn(write_half);
    let transport = LossyTransport::new(stream_transport, args.loss, args.dup, args.seed);

    let (observer, mut events) = ChannelObserver::new();
    let (endpoint, _deliveries) = Endpoint::new(config, Arc::new(transport), Arc::new(observer))?;

    let receiver = endpoint.clone();
    let mut connection = tokio::spawn(async move { receiver.run(frames).await });

    // 메시지 송신 (동시 진행)
    let mut sends = Vec::new();
    for text in &args.message {
        let endpoint = endpoint.clone();
        let (from, to, text) = (args.from.clone(), args.to.clone(), text.clone());
        sends.push(tokio::spawn(async move {
            endpoint.engine().send_message(from, to, text).await
        }));
    }
    let messages = tokio::spawn(async move {
        let mut compromised = false;
        for send in sends {
            match send.await {
                Ok(Ok(receipt)) => info!(
                    "{} ACK (rtt {:.1}ms, retries {})",
                    receipt.key,
                    receipt.rtt.as_secs_f64() * 1000.0,
                    receipt.retries
                ),
                Ok(Err(e @ (Error::IntegrityViolation { .. } | Error::KillSwitch { .. }))) => {
                    error!("메시지 송신 중단: {}", e);
                    compromised = true;
                }
                Ok(Err(e)) => warn!("메시지 송신 실패: {}", e),
                Err(e) => error!("송신 태스크 에러: {}", e),
            }
        }
        compromised
    });

    // 파일 전송
    let transfer_id = match &args.file {
        Some(path) => {
            let source = Arc::new(FileSource::open(path)?);
            let filename = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "file.bin".to_string());

            let id = match &args.resume {
                Some(id) => {
                    endpoint.transfers().resume_transfer(id.clone(), filename.clone(), source)?;
                    id.clone()
                }
                None => endpoint.transfers().start_transfer(filename.clone(), source)?,
            };
            info!("파일 전송 시작: {} ({})", filename, id);
            Some(id)
        }
        None => None,
    };

    let mut alert = None;
    let mut last_phase = None;
    let mut transfer_done = transfer_id.is_none();

    while !transfer_done {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    ProtocolEvent::TransferUpdate(snapshot) => {
                        if last_phase != Some(snapshot.phase) {
                            info!(
                                "전송 {}: {:?} ({:.1}%, {}/{} chunks)",
                                snapshot.transfer_id,
                                snapshot.phase,
                                snapshot.progress() * 100.0,
                                snapshot.acked.len(),
                                snapshot.total_chunks
                            );
                            last_phase = Some(snapshot.phase);
                        }
                        transfer_done = matches!(
                            snapshot.phase,
                            TransferPhase::Completed | TransferPhase::Cancelled
                        );
                    }
                    ProtocolEvent::IntegrityAlert(integrity_alert) => {
                        error!(
                            "KILL SWITCH: {} seq={} expected={} received={}",
                            integrity_alert.scope,
                            integrity_alert.seq,
                            integrity_alert.expected.as_deref().unwrap_or("-"),
                            integrity_alert.received.as_deref().unwrap_or("-"),
                        );
                        alert = Some(integrity_alert);
                        break;
                    }
                    _ => {}
                }
            }
            _ = &mut connection => {
                warn!("서버 연결 종료");
                break;
            }
        }
    }

    let compromised = messages.await.unwrap_or(false);

    // 메시지 kill switch는 이벤트로만 남아 있을 수 있음
    while let Ok(event) = events.try_recv() {
        if let ProtocolEvent::IntegrityAlert(integrity_alert) = event {
            alert.get_or_insert(integrity_alert);
        }
    }

    let stats = endpoint.engine().stats();
    info!("통계: {}", stats.summary());
    if let Some(id) = &transfer_id {
        if let Some(snapshot) = endpoint.transfers().snapshot(id) {
            info!(
                "전송 {}: {:?}, {}/{} chunks, 한도 초과 재전송 {}회",
                id,
                snapshot.phase,
                snapshot.acked.len(),
                snapshot.total_chunks,
                snapshot.retransmit_counts.values().sum::<u32>()
            );
        }
    }
    endpoint.shutdown();

    if alert.is_some() || compromised {
        error!("무결성 위반으로 종료");
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_with_overrides() {
        let args = Args::parse_from(["rap-client", "--profile", "lossy", "--window", "2"]);
        let config = args.config();
        let lossy = Config::lossy_network();

        assert_eq!(config.window_size, 2);
        assert_eq!(config.max_retries, lossy.max_retries);
        assert_eq!(config.chunk_size, lossy.chunk_size);
    }

    #[test]
    fn test_default_profile_matches_defaults() {
        let config = Args::parse_from(["rap-client"]).config();
        assert_eq!(config.window_size, rap::DEFAULT_WINDOW_SIZE);
        assert_eq!(config.packet_timeout_ms, rap::DEFAULT_PACKET_TIMEOUT_MS);
    }
}
