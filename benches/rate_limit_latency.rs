use std::net::SocketAddr;
use std::time::Duration;

use cms_admission_hub::bench_support::RateLimitFixture;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use http::{HeaderMap, Method};
use tokio::runtime::Runtime;

fn bench_backends(c: &mut Criterion) {
    let runtime = Runtime::new().expect("tokio runtime");
    let fixture = RateLimitFixture::new(1_000, 1_000_000);

    let mut group = c.benchmark_group("rate_limit_backend");
    group
        .measurement_time(Duration::from_secs(5))
        .warm_up_time(Duration::from_secs(1));

    for (name, backend) in [("local", &fixture.local), ("distributed", &fixture.distributed)] {
        group.bench_function(BenchmarkId::new("try_consume", name), |b| {
            let mut next = 0usize;
            b.to_async(&runtime).iter(|| {
                let key = &fixture.keys[next % fixture.keys.len()];
                next = next.wrapping_add(1);
                async move {
                    black_box(
                        backend
                            .try_consume(key, fixture.capacity)
                            .await
                            .expect("backend available"),
                    )
                }
            });
        });
    }

    group.bench_function("concurrent_same_key", |b| {
        let backend = fixture.distributed.clone();
        let key = fixture.keys[0].clone();
        let capacity = fixture.capacity;
        b.to_async(&runtime).iter(|| {
            let backend = backend.clone();
            let key = key.clone();
            async move {
                let tasks: Vec<_> = (0..32)
                    .map(|_| {
                        let backend = backend.clone();
                        let key = key.clone();
                        tokio::spawn(async move { backend.try_consume(&key, capacity).await })
                    })
                    .collect();
                for task in tasks {
                    let _ = task.await.expect("join handle");
                }
            }
        });
    });

    group.finish();
}

fn bench_admission_check(c: &mut Criterion) {
    let runtime = Runtime::new().expect("tokio runtime");
    let fixture = RateLimitFixture::new(256, 1_000_000);
    let peer: SocketAddr = "203.0.113.7:40000".parse().expect("socket addr");
    let headers = HeaderMap::new();

    c.bench_function("rate_limiter_check", |b| {
        b.to_async(&runtime).iter(|| async {
            black_box(
                fixture
                    .limiter
                    .check(Some("tenant-1"), &Method::GET, "/board/notice", peer, &headers)
                    .await,
            )
        });
    });
}

criterion_group!(rate_limit_latency, bench_backends, bench_admission_check);
criterion_main!(rate_limit_latency);
