//! Performance benchmarks for message processing.
//!
//! These benchmarks measure the hot paths of a busy terminal:
//! - Parsing inbound frames and serializing outbound ones
//! - Incremental UTF-8 decoding of PTY output
//! - Fanning output chunks out to subscribers

use std::time::Duration;

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use daemon::gateway::Utf8Decoder;
use daemon::session::{EventMultiplexer, SessionEvent, SessionKey};
use protocol::{ClientMessage, ServerMessage};

/// Benchmark inbound frame parsing.
fn bench_client_parsing(c: &mut Criterion) {
    let mut group = c.benchmark_group("client_parsing");

    let keystroke = r#"{"type":"input","data":"l"}"#;
    group.bench_function("input_keystroke", |b| {
        b.iter(|| ClientMessage::from_json(black_box(keystroke)).unwrap());
    });

    let paste = format!(r#"{{"type":"input","data":"{}"}}"#, "x".repeat(4096));
    group.throughput(Throughput::Bytes(paste.len() as u64));
    group.bench_function("input_paste_4KB", |b| {
        b.iter(|| ClientMessage::from_json(black_box(&paste)).unwrap());
    });

    let create = r#"{"type":"create","sessionId":"s1","userId":"u1","cwd":"/tmp","cols":120,"rows":40}"#;
    group.bench_function("create", |b| {
        b.iter(|| ClientMessage::from_json(black_box(create)).unwrap());
    });

    group.finish();
}

/// Benchmark outbound frame serialization.
fn bench_server_serialization(c: &mut Criterion) {
    let mut group = c.benchmark_group("server_serialization");

    for size in [64usize, 4096] {
        // Terminal output is mostly ASCII with escapes that need quoting.
        let data: String = "ls -la\r\n\x1b[1;34mdir\x1b[0m "
            .chars()
            .cycle()
            .take(size)
            .collect();
        let message = ServerMessage::output(data);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("output", size), &message, |b, message| {
            b.iter(|| black_box(message).to_json().unwrap());
        });
    }

    group.finish();
}

/// Benchmark incremental UTF-8 decoding.
fn bench_utf8_decoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("utf8_decoding");

    let ascii = vec![b'a'; 4096];
    group.throughput(Throughput::Bytes(ascii.len() as u64));
    group.bench_function("ascii_4KB", |b| {
        let mut decoder = Utf8Decoder::new();
        b.iter(|| decoder.decode(black_box(&ascii)));
    });

    // Chunks that end in the middle of a three-byte sequence.
    let text = "λx→y ".repeat(512);
    let bytes = text.as_bytes();
    let split = bytes.len() / 2 + 1;
    group.throughput(Throughput::Bytes(bytes.len() as u64));
    group.bench_function("multibyte_split_chunks", |b| {
        let mut decoder = Utf8Decoder::new();
        b.iter(|| {
            let head = decoder.decode(black_box(&bytes[..split]));
            let tail = decoder.decode(black_box(&bytes[split..]));
            (head, tail)
        });
    });

    group.finish();
}

/// Benchmark publishing output to subscribers of one session.
fn bench_multiplexer_fanout(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap();

    let mut group = c.benchmark_group("multiplexer_fanout");
    let chunk = Bytes::from(vec![b'x'; 4096]);

    for subscribers in [1usize, 4] {
        let multiplexer = EventMultiplexer::new(256, Duration::from_secs(5));
        let key = SessionKey {
            id: "bench".to_string(),
            instance: 1,
        };
        multiplexer.open(&key);

        let mut subscriptions = runtime.block_on(async {
            let mut subscriptions = Vec::new();
            for _ in 0..subscribers {
                subscriptions.push(multiplexer.subscribe(&key).await.unwrap());
            }
            subscriptions
        });

        group.throughput(Throughput::Bytes((chunk.len() * subscribers) as u64));
        group.bench_function(BenchmarkId::new("publish_4KB", subscribers), |b| {
            b.iter(|| {
                runtime.block_on(async {
                    let delivered = multiplexer
                        .publish(&key, SessionEvent::Output(chunk.clone()))
                        .await;
                    for subscription in subscriptions.iter_mut() {
                        black_box(subscription.recv().await);
                    }
                    delivered
                })
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_client_parsing,
    bench_server_serialization,
    bench_utf8_decoding,
    bench_multiplexer_fanout,
);

criterion_main!(benches);
