//! Throughput benchmarks: messages per second for publish and RPC.
//!
//! Tests the public `Hub`/`Client` API over a loopback TCP connection.
//! Setup overhead (bind, dial, handshake) is included but amortized over
//! several thousand messages per sample, so it stays a small fraction of
//! total time.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use junction::client::Client;
use junction::hub::Hub;
use junction::Value;
use std::time::Duration;

const MESSAGE_SIZES: &[usize] = &[64, 256, 1024, 4096, 16384];
const MESSAGE_COUNT: usize = 5_000;

fn service() -> Value {
    Value::from("bench")
}

/// Publish throughput: client fires `MESSAGE_COUNT` fire-and-forget
/// publishes, hub-side handler signals each arrival over a channel.
fn publish_throughput(c: &mut Criterion) {
    junction::dev_tracing::init();
    let mut group = c.benchmark_group("throughput/junction/publish");
    group.measurement_time(Duration::from_secs(15));
    group.sample_size(10);

    // Reuse a single runtime for all iterations; creating/dropping many
    // io_uring runtimes can exhaust kernel resources.
    let rt = compio::runtime::Runtime::new().unwrap();

    for &size in MESSAGE_SIZES {
        group.throughput(Throughput::Bytes((size * MESSAGE_COUNT) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let payload = Value::Binary(vec![0u8; size]);

            b.iter(|| {
                rt.block_on(async {
                    let hub = Hub::bind("127.0.0.1:0").await.unwrap();
                    let addr = format!("127.0.0.1:{}", hub.ident().port);

                    let (done_tx, done_rx) = flume::unbounded::<()>();
                    hub.accept_publish(service(), 0, 0, "ping", move |_args, _kwargs| {
                        let _ = done_tx.send(());
                    })
                    .await
                    .unwrap();

                    let client = Client::connect(addr);
                    client.wait_connected().await;

                    for _ in 0..MESSAGE_COUNT {
                        client
                            .publish(service(), 0, "ping", vec![black_box(payload.clone())], Vec::new(), false)
                            .await;
                    }

                    for _ in 0..MESSAGE_COUNT {
                        done_rx.recv_async().await.unwrap();
                    }
                });
            });
        });
    }
    group.finish();
}

/// Request/response throughput: client sends one RPC at a time and awaits
/// the echo before sending the next, mirroring a synchronous REQ/REP loop.
fn rpc_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("throughput/junction/rpc");
    group.measurement_time(Duration::from_secs(15));
    group.sample_size(10);

    let rt = compio::runtime::Runtime::new().unwrap();

    for &size in MESSAGE_SIZES {
        group.throughput(Throughput::Bytes((size * MESSAGE_COUNT) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let payload = Value::Binary(vec![0u8; size]);

            b.iter(|| {
                rt.block_on(async {
                    let hub = Hub::bind("127.0.0.1:0").await.unwrap();
                    let addr = format!("127.0.0.1:{}", hub.ident().port);

                    hub.accept_rpc(service(), 0, 0, "echo", |mut args, _kwargs| {
                        Ok(args.pop().unwrap_or(Value::Nil))
                    })
                    .await
                    .unwrap();

                    let client = Client::connect(addr);
                    client.wait_connected().await;

                    for _ in 0..MESSAGE_COUNT {
                        let future = client
                            .send_rpc(service(), 0, "echo", vec![black_box(payload.clone())], Vec::new(), false)
                            .await;
                        let _ = future.wait(None).await;
                    }
                });
            });
        });
    }
    group.finish();
}

criterion_group!(
    name = benches;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(60))
        .warm_up_time(Duration::from_secs(5))
        .sample_size(10);
    targets = publish_throughput, rpc_throughput
);
criterion_main!(benches);
