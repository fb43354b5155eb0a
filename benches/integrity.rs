//! 무결성 바인딩 벤치마크
//!
//! 실행: `cargo bench --bench integrity`

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use rap::integrity;
use rap::packet::{FileChunkPacket, Packet};

fn bench_bind(c: &mut Criterion) {
    let mut group = c.benchmark_group("bind");

    for size in [1024usize, 16 * 1024, 64 * 1024] {
        let payload = vec![0xA5u8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &payload, |b, payload| {
            b.iter(|| integrity::bind(black_box(payload), black_box(7)))
        });
    }
    group.finish();
}

fn bench_chunk_codec(c: &mut Criterion) {
    let payload = Bytes::from(vec![0x5Au8; 65536]);
    let chunk = FileChunkPacket::new("bench", 3, 16, 65536, "bench.bin", 16 * 65536, payload);
    let frame = Packet::FileChunk(chunk.clone()).to_bytes().unwrap();

    let mut group = c.benchmark_group("chunk_codec");
    group.throughput(Throughput::Bytes(65536));
    group.bench_function("encode", |b| {
        b.iter(|| Packet::FileChunk(black_box(chunk.clone())).to_bytes().unwrap())
    });
    group.bench_function("decode_verify", |b| {
        b.iter(|| {
            let Packet::FileChunk(decoded) = Packet::from_bytes(black_box(&frame)).unwrap() else {
                unreachable!()
            };
            integrity::verify(&decoded.payload, decoded.seq, &decoded.checksum).is_valid()
        })
    });
    group.finish();
}

criterion_group!(benches, bench_bind, bench_chunk_codec);
criterion_main!(benches);
