use criterion::{black_box, criterion_group, criterion_main, Criterion};
use floodgate::{AdmissionLayer, ClientLimiterRegistry, LimiterConfig, TokenBucket};

use futures::future::Ready;
use http::{Request, Response};
use std::convert::Infallible;
use std::task::{Context, Poll};
use tower::{Service, ServiceBuilder};

// Answers every request immediately so only the admission check is measured.
#[derive(Clone)]
struct OkService;

impl Service<Request<()>> for OkService {
    type Response = Response<String>;
    type Error = Infallible;
    type Future = Ready<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _req: Request<()>) -> Self::Future {
        futures::future::ready(Ok(Response::new(String::new())))
    }
}

fn request(ip: &'static str) -> Request<()> {
    Request::builder().header("x-real-ip", ip).body(()).unwrap()
}

fn token_bucket_allow(c: &mut Criterion) {
    let bucket = TokenBucket::new(1_000_000_000.0, 1_000_000.0);
    c.bench_function("token_bucket_allow", |b| {
        b.iter(|| black_box(bucket.allow()));
    });
}

fn registry_check_many_keys(c: &mut Criterion) {
    let config = LimiterConfig::new(1_000_000.0, 1_000.0).unwrap();
    let registry = ClientLimiterRegistry::new(&config);
    let keys: Vec<String> = (0..1024).map(|i| format!("10.0.{}.{}", i / 256, i % 256)).collect();
    let mut i = 0;

    c.bench_function("registry_get_or_create_1024_keys", |b| {
        b.iter(|| {
            i = (i + 1) % keys.len();
            black_box(registry.get_or_create(black_box(&keys[i])));
        });
    });
}

fn admission_layer_throughput(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let config = LimiterConfig::new(1_000_000_000.0, 1_000_000.0).unwrap();
    let layer = AdmissionLayer::new(ClientLimiterRegistry::new(&config));
    let svc = ServiceBuilder::new().layer(layer).service(OkService);

    c.bench_function("admission_allowed", |b| {
        b.to_async(&rt).iter(|| async {
            let mut local_svc = svc.clone();
            let _ = black_box(local_svc.call(black_box(request("1.2.3.4")))).await;
        });
    });
}

fn admission_layer_denied(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let config = LimiterConfig::new(0.0, 0.0).unwrap();
    let layer = AdmissionLayer::new(ClientLimiterRegistry::new(&config));
    let svc = ServiceBuilder::new().layer(layer).service(OkService);

    c.bench_function("admission_denied", |b| {
        b.to_async(&rt).iter(|| async {
            let mut local_svc = svc.clone();
            let _ = black_box(local_svc.call(black_box(request("1.2.3.4")))).await;
        });
    });
}

criterion_group!(
    benches,
    token_bucket_allow,
    registry_check_many_keys,
    admission_layer_throughput,
    admission_layer_denied
);
criterion_main!(benches);
