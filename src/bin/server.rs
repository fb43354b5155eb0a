//! RAP 서버 (수신자)
//!
//! TCP 연결마다 수신자 프로토콜 핸들러를 돌린다.
//! - MSG/FILE_CHUNK 검증 후 ACK, CUM_ACK, INTEGRITY_FAIL 응답
//! - `--output` 지정 시 완료된 파일을 디렉토리에 기록
//! - `--tamper` 지정 시 수신 데이터 패킷의 seq를 변조 (MITM 시연)
//!
//! 사용법:
//!   cargo run --release --bin rap-server -- [OPTIONS]
//!
//! 예시:
//!   # 기본 수신
//!   cargo run --release --bin rap-server -- --bind 0.0.0.0:9000 --output ./received
//!
//!   # kill switch 시연
//!   cargo run --release --bin rap-server -- --tamper

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use clap::Parser;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use rap::chunk::{ChunkLayout, FileAssembler};
use rap::packet::{Packet, DEFAULT_TAMPER_OFFSET};
use rap::transport::{spawn_line_reader, StreamTransport, Transport};
use rap::{Config, Delivery, ReceiverHandler};

/// RAP 서버 - 신뢰 전송 프로토콜 수신측
#[derive(Parser, Debug, Clone)]
#[command(name = "rap-server", author, version, about, long_about = None)]
struct Args {
    /// 바인드 주소
    #[arg(short, long, default_value = "0.0.0.0:9000")]
    bind: SocketAddr,

    /// 완료된 파일을 기록할 디렉토리
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// 수신 데이터 패킷의 seq 변조 (MITM 시연)
    #[arg(long)]
    tamper: bool,

    /// 변조 오프셋
    #[arg(long, default_value_t = DEFAULT_TAMPER_OFFSET)]
    tamper_offset: u32,

    /// CUM_ACK 주기 (청크 인덱스 기준)
    #[arg(long, default_value_t = rap::DEFAULT_CUM_ACK_INTERVAL)]
    cum_ack_interval: u32,

    /// 조립할 파일 최대 크기 (바이트)
    #[arg(long, default_value_t = 512 * 1024 * 1024)]
    max_file_size: u64,

    /// 동시에 조립 중인 파일 최대 수
    #[arg(long, default_value_t = 16)]
    max_assemblies: usize,

    /// 이 시간(초) 동안 청크가 없으면 조립 중인 파일 폐기
    #[arg(long, default_value_t = 300)]
    assembly_idle_secs: u64,
}

impl Args {
    fn assembly_limits(&self) -> AssemblyLimits {
        AssemblyLimits {
            max_file_size: self.max_file_size,
            max_open: self.max_assemblies,
            idle: Duration::from_secs(self.assembly_idle_secs),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정 (RUST_LOG 우선)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = Config::default().with_cum_ack_interval(args.cum_ack_interval);
    config.validate()?;

    if let Some(dir) = &args.output {
        tokio::fs::create_dir_all(dir).await?;
    }

    info!("RAP Server starting...");
    info!("Bind address: {}", args.bind);
    info!("CUM_ACK interval: {}", config.cum_ack_interval);
    if args.tamper {
        warn!("MITM 시연 모드: 수신 seq를 +{} 변조", args.tamper_offset);
    }

    let state = Arc::new(Mutex::new(ServerState::new(&config, args.assembly_limits())));

    let listener = TcpListener::bind(args.bind).await?;
    info!("Server listening on {}", args.bind);

    loop {
        let (stream, addr) = listener.accept().await?;
        info!("Client connected: {}", addr);

        let args = args.clone();
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = serve(stream, addr, args, state).await {
                error!("연결 처리 에러 {}: {}", addr, e);
            }
            info!("Client disconnected: {}", addr);
        });
    }
}

/// 파일 조립 자원 한도 (상대가 선언한 크기만큼 메모리를 잡으므로)
#[derive(Debug, Clone, Copy)]
struct AssemblyLimits {
    max_file_size: u64,
    max_open: usize,
    idle: Duration,
}

/// 연결 간 공유되는 수신 상태 (재연결 후 재개 요청에 응답하기 위함)
struct ServerState {
    handler: ReceiverHandler,
    assemblies: HashMap<String, FileAssembler>,
    limits: AssemblyLimits,
}

impl ServerState {
    fn new(config: &Config, limits: AssemblyLimits) -> Self {
        Self {
            handler: ReceiverHandler::new(config),
            assemblies: HashMap::new(),
            limits,
        }
    }

    /// 조립 중인 파일 반환, 없으면 한도 안에서 새로 생성
    fn assembly(&mut self, transfer_id: &str, layout: ChunkLayout) -> Option<&mut FileAssembler> {
        if !self.assemblies.contains_key(transfer_id) {
            if layout.total_size > self.limits.max_file_size {
                warn!(
                    "파일 크기 초과, 조립 생략: {} ({} bytes)",
                    transfer_id, layout.total_size
                );
                return None;
            }

            let idle = self.limits.idle;
            self.assemblies.retain(|id, assembly| {
                let keep = assembly.idle_for() < idle;
                if !keep {
                    warn!("유휴 조립 폐기: {} (누락 {}개)", id, assembly.missing().len());
                }
                keep
            });

            if self.assemblies.len() >= self.limits.max_open {
                warn!("동시 조립 한도 초과, 조립 생략: {}", transfer_id);
                return None;
            }
            self.assemblies
                .insert(transfer_id.to_string(), FileAssembler::new(layout));
        }
        self.assemblies.get_mut(transfer_id)
    }

    /// 전달된 데이터 반영. 기록할 완성 파일이 있으면 반환
    fn absorb(
        &mut self,
        addr: SocketAddr,
        delivery: Delivery,
        output: Option<&Path>,
    ) -> Option<(PathBuf, Bytes)> {
        match delivery {
            Delivery::Message { seq, from, to, payload } => {
                info!("[{}] MSG #{} {} -> {}: {}", addr, seq, from, to, payload);
                None
            }
            Delivery::Chunk {
                transfer_id,
                seq,
                total_size,
                chunk_size,
                data,
                ..
            } => {
                debug!("[{}] chunk {}#{} ({} bytes)", addr, transfer_id, seq, data.len());
                output?;
                let layout = ChunkLayout::new(total_size, chunk_size);
                if let Some(assembly) = self.assembly(&transfer_id, layout) {
                    assembly.insert(seq, &data);
                }
                None
            }
            Delivery::TransferComplete {
                transfer_id,
                filename,
                total_size,
                ..
            } => {
                info!("[{}] 전송 완료: {} ({} bytes)", addr, filename, total_size);
                let dir = output?;
                let assembly = self.assemblies.remove(&transfer_id)?;
                if !assembly.is_complete() {
                    warn!("조립 미완료: {} 누락 {:?}", transfer_id, assembly.missing());
                    return None;
                }
                Some((output_path(dir, &filename, &transfer_id), assembly.into_data()))
            }
        }
    }
}

/// 연결 하나 처리
async fn serve(
    stream: TcpStream,
    addr: SocketAddr,
    args: Args,
    state: Arc<Mutex<ServerState>>,
) -> rap::Result<()> {
    let (read_half, write_half) = stream.into_split();
    let (mut frames, reader) = spawn_line_reader(read_half);
    let (transport, writer) = StreamTransport::spawn(write_half);

    while let Some(frame) = frames.recv().await {
        let (responses, files) = {
            let mut state = state.lock();
            let reception = match Packet::from_bytes(&frame) {
                Ok(mut packet) => {
                    if args.tamper {
                        packet.tamper_sequence(args.tamper_offset);
                    }
                    state.handler.handle(packet)
                }
                Err(_) => state.handler.handle_bytes(&frame),
            };

            let files: Vec<(PathBuf, Bytes)> = reception
                .deliveries
                .into_iter()
                .filter_map(|delivery| state.absorb(addr, delivery, args.output.as_deref()))
                .collect();
            (reception.responses, files)
        };

        for response in &responses {
            transport.send(response)?;
        }
        for (path, data) in files {
            tokio::fs::write(&path, data).await?;
            info!("파일 저장: {:?}", path);
        }
    }

    info!(
        "[{}] 연결 종료, 누적 무결성 실패 {}회",
        addr,
        state.lock().handler.integrity_failures()
    );

    drop(transport);
    let _ = writer.await;
    reader.abort();
    Ok(())
}

/// 경로 구성요소를 제거한 저장 경로
fn output_path(dir: &Path, filename: &str, transfer_id: &str) -> PathBuf {
    let name = Path::new(filename)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| format!("{}.bin", transfer_id));
    dir.join(name)
}
