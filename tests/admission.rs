use floodgate::rate_limit::middleware::RATE_LIMIT_EXCEEDED;
use floodgate::{
    AdmissionController, AdmissionLayer, ClientKeyExtractor, ClientLimiterRegistry, Decision,
    KeyedLimiter, LimiterConfig, ManualClock, PeerAddr, ProxyTrust,
};
use futures::future::Ready;
use http::header::RETRY_AFTER;
use http::{Request, Response, StatusCode};
use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tower::{ServiceBuilder, ServiceExt};

fn request_from(ip: &str) -> Request<()> {
    Request::builder()
        .uri("/upload")
        .header("x-real-ip", ip)
        .body(())
        .unwrap()
}

// Stands in for the protected handler; counts how often it is reached.
#[derive(Clone)]
struct App {
    calls: Arc<AtomicUsize>,
}

impl tower::Service<Request<()>> for App {
    type Response = Response<String>;
    type Error = Infallible;
    type Future = Ready<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _req: Request<()>) -> Self::Future {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let res = Response::builder()
            .status(StatusCode::CREATED)
            .header("x-app", "1")
            .body("stored".to_string())
            .unwrap();
        futures::future::ready(Ok(res))
    }
}

fn counting_app(calls: Arc<AtomicUsize>) -> App {
    App { calls }
}

fn config(rate: f64, capacity: f64) -> LimiterConfig {
    LimiterConfig::new(rate, capacity).unwrap()
}

#[tokio::test]
async fn admitted_requests_pass_through_unchanged() {
    let calls = Arc::new(AtomicUsize::new(0));
    let registry = ClientLimiterRegistry::new(&config(1.0, 2.0));
    let svc = ServiceBuilder::new()
        .layer(AdmissionLayer::new(registry))
        .service(counting_app(calls.clone()));

    let res = svc.oneshot(request_from("1.2.3.4")).await.unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    assert_eq!(res.headers()["x-app"], "1");
    assert_eq!(res.body(), "stored");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn denied_requests_get_429_and_never_reach_the_app() {
    let calls = Arc::new(AtomicUsize::new(0));
    let clock = ManualClock::new();
    let registry = ClientLimiterRegistry::with_clock(&config(1.0, 2.0), Arc::new(clock.clone()));
    let layer = AdmissionLayer::new(registry);
    let svc = ServiceBuilder::new().layer(layer).service(counting_app(calls.clone()));

    for _ in 0..2 {
        let res = svc.clone().oneshot(request_from("1.2.3.4")).await.unwrap();
        assert_eq!(res.status(), StatusCode::CREATED);
    }
    let res = svc.clone().oneshot(request_from("1.2.3.4")).await.unwrap();
    assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(res.body(), RATE_LIMIT_EXCEEDED);
    assert_eq!(res.headers()[RETRY_AFTER], "1");
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    clock.advance(Duration::from_secs(1));
    let res = svc.oneshot(request_from("1.2.3.4")).await.unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
}

#[tokio::test]
async fn clients_are_limited_independently() {
    let calls = Arc::new(AtomicUsize::new(0));
    let registry = ClientLimiterRegistry::new(&config(0.0, 1.0));
    let svc = ServiceBuilder::new()
        .layer(AdmissionLayer::new(registry))
        .service(counting_app(calls.clone()));

    assert_eq!(
        svc.clone().oneshot(request_from("1.1.1.1")).await.unwrap().status(),
        StatusCode::CREATED
    );
    assert_eq!(
        svc.clone().oneshot(request_from("1.1.1.1")).await.unwrap().status(),
        StatusCode::TOO_MANY_REQUESTS
    );
    assert_eq!(svc.oneshot(request_from("2.2.2.2")).await.unwrap().status(), StatusCode::CREATED);
}

#[tokio::test]
async fn peer_address_is_used_without_headers() {
    let calls = Arc::new(AtomicUsize::new(0));
    let registry = Arc::new(ClientLimiterRegistry::new(&config(0.0, 1.0)));
    let svc = ServiceBuilder::new()
        .layer(AdmissionLayer::shared(registry.clone()))
        .service(counting_app(calls));

    let mut req = Request::new(());
    req.extensions_mut().insert(PeerAddr("9.9.9.9:5000".parse().unwrap()));
    svc.oneshot(req).await.unwrap();

    assert!(registry.contains("9.9.9.9"));
}

#[tokio::test]
async fn untrusted_peers_cannot_spoof_their_key() {
    let calls = Arc::new(AtomicUsize::new(0));
    let registry = Arc::new(ClientLimiterRegistry::new(&config(0.0, 1.0)));
    let layer = AdmissionLayer::shared(registry.clone())
        .with_key_extractor(ClientKeyExtractor::new(ProxyTrust::Never));
    let svc = ServiceBuilder::new().layer(layer).service(counting_app(calls));

    let mut req = request_from("6.6.6.6");
    req.extensions_mut().insert(PeerAddr("10.0.0.7:4000".parse().unwrap()));
    svc.oneshot(req).await.unwrap();

    assert!(registry.contains("10.0.0.7"));
    assert!(!registry.contains("6.6.6.6"));
}

struct DenyAll;

impl KeyedLimiter for DenyAll {
    fn check(&self, _key: &str) -> Decision {
        Decision::Denied { wait: Duration::from_millis(2500) }
    }
}

#[tokio::test]
async fn any_keyed_limiter_can_back_the_layer() {
    let calls = Arc::new(AtomicUsize::new(0));
    let svc = ServiceBuilder::new()
        .layer(AdmissionLayer::new(DenyAll))
        .service(counting_app(calls.clone()));

    let res = svc.oneshot(request_from("1.2.3.4")).await.unwrap();
    assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(res.headers()[RETRY_AFTER], "3");
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn controller_janitor_evicts_idle_clients() {
    let clock = ManualClock::new();
    let cfg = config(0.0, 1.0)
        .with_cleanup(Duration::from_secs(60), Duration::from_secs(180))
        .unwrap();
    let controller = AdmissionController::start_with_clock(cfg, Arc::new(clock.clone()));
    let svc = ServiceBuilder::new()
        .layer(controller.layer())
        .service(counting_app(Arc::new(AtomicUsize::new(0))));

    svc.clone().oneshot(request_from("1.2.3.4")).await.unwrap();
    assert_eq!(
        svc.clone().oneshot(request_from("1.2.3.4")).await.unwrap().status(),
        StatusCode::TOO_MANY_REQUESTS
    );

    clock.advance(Duration::from_secs(200));
    tokio::time::sleep(Duration::from_secs(61)).await;
    assert!(controller.registry().is_empty());

    let res = svc.oneshot(request_from("1.2.3.4")).await.unwrap();
    assert_eq!(res.status(), StatusCode::CREATED, "evicted client starts with a full bucket");

    controller.shutdown().await;
    controller.shutdown().await;
}
