//! # Sysbus Benchmarks
//!
//! | Path | What is measured |
//! |------|------------------|
//! | Frame codec | Encode and decode of a request frame |
//! | Call round trip | `call` to `next_response` over `LocalBus` |
//! | Subscription fan-out | One `subscription_reply` to many subscribers |

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;
use std::time::Duration;
use sysbus_core::{BusConfig, Destination, FrameCodec, Handle, LocalBus, Message, Payload, Token};
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .expect("failed to build runtime")
}

fn spawn(bus: &LocalBus, name: &str) -> Handle {
    Handle::spawn(BusConfig::new(name), bus.connect(name).expect("connect"))
        .expect("spawn handle")
}

// ============================================================================
// FRAME CODEC
// ============================================================================

fn bench_frame_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame-codec");
    let codec = FrameCodec::default();
    let destination = Destination::parse("luna://com.example.echo/test").expect("valid uri");

    for size in [16usize, 1024, 64 * 1024] {
        let payload = Payload::from(vec![b'x'; size]);
        let message = Message::request("com.example.client", &destination, Token::new(7), payload, false);
        let frame = codec.encode(&message).expect("encode");

        group.throughput(Throughput::Bytes(frame.len() as u64));
        group.bench_with_input(BenchmarkId::new("encode", size), &message, |b, message| {
            b.iter(|| black_box(codec.encode(message).expect("encode")))
        });
        group.bench_with_input(BenchmarkId::new("decode", size), &frame, |b, frame| {
            b.iter(|| black_box(codec.decode(frame).expect("decode")))
        });
    }

    group.finish();
}

// ============================================================================
// CALL ROUND TRIP
// ============================================================================

fn bench_call_round_trip(c: &mut Criterion) {
    let rt = runtime();
    let bus = LocalBus::new();
    let client = rt.block_on(async {
        let service = spawn(&bus, "com.example.echo");
        service
            .register_method("", "test", |request| {
                request.respond(request.payload().clone())?;
                Ok(())
            })
            .await
            .expect("register");
        spawn(&bus, "com.example.client")
    });

    let mut group = c.benchmark_group("call");
    group.measurement_time(Duration::from_secs(5));
    group.bench_function("round_trip", |b| {
        b.iter(|| {
            rt.block_on(async {
                let mut call = client
                    .call("luna://com.example.echo/test", json!({ "msg": "ping" }))
                    .await
                    .expect("call");
                black_box(call.next_response().await.expect("response"))
            })
        })
    });
    group.finish();
}

// ============================================================================
// SUBSCRIPTION FAN-OUT
// ============================================================================

fn bench_subscription_fan_out(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("subscription-fan-out");

    for subscribers in [1usize, 10, 100] {
        let bus = LocalBus::new();
        let (service, mut subs) = rt.block_on(async {
            let service = spawn(&bus, "com.example.status");
            let filing = service.clone();
            service
                .register_method("", "status", move |request| {
                    filing.subscription_add("status", &request)?;
                    request.respond("{}")?;
                    Ok(())
                })
                .await
                .expect("register");

            let client = spawn(&bus, "com.example.client");
            let mut subs = Vec::with_capacity(subscribers);
            for _ in 0..subscribers {
                let mut sub = client
                    .subscribe("luna://com.example.status/status", "{}")
                    .await
                    .expect("subscribe");
                sub.next_response().await.expect("initial response");
                subs.push(sub);
            }
            (service, subs)
        });

        group.throughput(Throughput::Elements(subscribers as u64));
        group.bench_with_input(
            BenchmarkId::new("reply", subscribers),
            &subscribers,
            |b, _| {
                b.iter(|| {
                    rt.block_on(async {
                        service
                            .subscription_reply("status", "tick")
                            .await
                            .expect("reply");
                        for sub in &mut subs {
                            black_box(sub.next_response().await.expect("update"));
                        }
                    })
                })
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_frame_codec,
    bench_call_round_trip,
    bench_subscription_fan_out
);
criterion_main!(benches);
