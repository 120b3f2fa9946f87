//! Chunk framing and reassembly benchmarks.

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use velocy_protocol::{
    ChunkDecoder, ChunkEncoder, ChunkStore, Request, RequestType, Response, DEFAULT_CHUNK_SIZE,
};

fn create_test_request(payload_size: usize) -> Request {
    let body = serde_json::json!({
        "item": "widget",
        "data": "x".repeat(payload_size),
    });
    Request::new("_system", RequestType::Post, "/_api/document/orders")
        .with_query_param("returnNew", "true")
        .with_header("x-arango-trx-id", "12345")
        .with_body(body.to_string())
}

fn bench_message_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("message_encode");
    let encoder = ChunkEncoder::default();

    for size in [100, 10_000, 100_000, 1_000_000] {
        let payload = vec![Bytes::from("x".repeat(size))];

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &payload, |b, payload| {
            b.iter(|| black_box(encoder.encode_message(1, payload).unwrap()));
        });
    }

    group.finish();
}

fn bench_message_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("message_decode");
    let encoder = ChunkEncoder::default();

    for size in [100, 10_000, 100_000, 1_000_000] {
        let payload = [Bytes::from("x".repeat(size))];
        let encoded = encoder.encode_message(1, &payload).unwrap().freeze();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &encoded, |b, encoded| {
            b.iter(|| {
                let mut decoder = ChunkDecoder::new();
                let mut store = ChunkStore::new();
                decoder.extend(encoded);
                let mut message = None;
                while let Some(chunk) = decoder.decode_chunk().unwrap() {
                    message = store.store_chunk(chunk).unwrap();
                }
                black_box(message.unwrap())
            });
        });
    }

    group.finish();
}

/// Many messages whose chunks arrive interleaved, as on a busy connection.
fn bench_interleaved_reassembly(c: &mut Criterion) {
    let mut group = c.benchmark_group("interleaved_reassembly");
    let encoder = ChunkEncoder::new(1024).unwrap();

    for messages in [2u64, 16, 64] {
        let per_message: Vec<_> = (0..messages)
            .map(|id| {
                encoder
                    .split(id, &[Bytes::from(vec![id as u8; 16 * 1024])])
                    .unwrap()
            })
            .collect();

        let mut wire = bytes::BytesMut::new();
        let rounds = per_message.iter().map(Vec::len).max().unwrap_or(0);
        for round in 0..rounds {
            for chunks in &per_message {
                if let Some(chunk) = chunks.get(round) {
                    chunk.encode_into(&mut wire).unwrap();
                }
            }
        }
        let wire = wire.freeze();

        group.throughput(Throughput::Elements(messages));
        group.bench_with_input(BenchmarkId::from_parameter(messages), &wire, |b, wire| {
            b.iter(|| {
                let mut decoder = ChunkDecoder::new();
                let mut store = ChunkStore::new();
                decoder.extend(wire);
                let mut completed = 0;
                while let Some(chunk) = decoder.decode_chunk().unwrap() {
                    if store.store_chunk(chunk).unwrap().is_some() {
                        completed += 1;
                    }
                }
                black_box(completed)
            });
        });
    }

    group.finish();
}

fn bench_request_roundtrip(c: &mut Criterion) {
    let mut group = c.benchmark_group("request_roundtrip");
    let encoder = ChunkEncoder::new(DEFAULT_CHUNK_SIZE).unwrap();

    for size in [100, 1000, 10_000] {
        let request = create_test_request(size);

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(size), &request, |b, request| {
            b.iter(|| {
                let encoded = encoder.encode_message(7, &request.encode().unwrap()).unwrap();
                let mut decoder = ChunkDecoder::new();
                let mut store = ChunkStore::new();
                decoder.extend(&encoded);
                let chunk = decoder.decode_chunk().unwrap().unwrap();
                let message = store.store_chunk(chunk).unwrap().unwrap();
                black_box(Request::decode(&message.payload).unwrap())
            });
        });
    }

    group.finish();
}

fn bench_response_decode(c: &mut Criterion) {
    let response = Response::new(200)
        .with_meta("content-type", "application/json")
        .with_body(r#"{"server":"arango","version":"3.12.0","license":"community"}"#);
    let payload: Vec<u8> = response
        .encode()
        .unwrap()
        .iter()
        .flat_map(|b| b.iter().copied())
        .collect();

    c.bench_function("response_decode", |b| {
        b.iter(|| black_box(Response::decode(&payload).unwrap()))
    });
}

criterion_group!(
    benches,
    bench_message_encode,
    bench_message_decode,
    bench_interleaved_reassembly,
    bench_request_roundtrip,
    bench_response_decode,
);
criterion_main!(benches);
