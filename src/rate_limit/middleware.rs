use crate::clock::{default_clock, SharedClock};
use crate::config::LimiterConfig;
use crate::rate_limit::key::ClientKeyExtractor;
use crate::rate_limit::registry::ClientLimiterRegistry;
use crate::rate_limit::{Decision, KeyedLimiter};
use crate::task::BackgroundTask;
use futures::future::BoxFuture;
use http::header::{CONTENT_TYPE, RETRY_AFTER};
use http::{HeaderValue, Request, Response, StatusCode};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tower_layer::Layer;
use tower_service::Service;

/// Body of every rejection.
pub const RATE_LIMIT_EXCEEDED: &str = "Rate limit exceeded";

/// A layer that gates requests through a [`KeyedLimiter`].
#[derive(Debug)]
pub struct AdmissionLayer<L> {
    limiter: Arc<L>,
    extractor: Arc<ClientKeyExtractor>,
}

impl<L> Clone for AdmissionLayer<L> {
    fn clone(&self) -> Self {
        Self { limiter: self.limiter.clone(), extractor: self.extractor.clone() }
    }
}

impl<L> AdmissionLayer<L> {
    /// Create a new admission layer owning `limiter`.
    pub fn new(limiter: L) -> Self {
        Self::shared(Arc::new(limiter))
    }

    /// Create a layer over a limiter that is also used elsewhere.
    pub fn shared(limiter: Arc<L>) -> Self {
        Self { limiter, extractor: Arc::new(ClientKeyExtractor::default()) }
    }

    /// Replace how the client key is derived.
    pub fn with_key_extractor(mut self, extractor: ClientKeyExtractor) -> Self {
        self.extractor = Arc::new(extractor);
        self
    }
}

impl<S, L> Layer<S> for AdmissionLayer<L>
where
    L: KeyedLimiter + 'static,
{
    type Service = AdmissionService<S, L>;

    fn layer(&self, service: S) -> Self::Service {
        AdmissionService {
            inner: service,
            limiter: self.limiter.clone(),
            extractor: self.extractor.clone(),
        }
    }
}

/// Middleware service that admits or rejects each request.
///
/// Admitted requests reach the inner service untouched and its response is
/// returned as is. Rejected requests get `429 Too Many Requests` with a
/// plain-text body and never reach the inner service.
#[derive(Debug)]
pub struct AdmissionService<S, L> {
    inner: S,
    limiter: Arc<L>,
    extractor: Arc<ClientKeyExtractor>,
}

impl<S: Clone, L> Clone for AdmissionService<S, L> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            limiter: self.limiter.clone(),
            extractor: self.extractor.clone(),
        }
    }
}

impl<S, L, ReqBody, ResBody> Service<Request<ReqBody>> for AdmissionService<S, L>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    L: KeyedLimiter + 'static,
    ReqBody: Send + 'static,
    ResBody: From<&'static str> + Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let key = self.extractor.extract(&req);

        match self.limiter.check(&key) {
            Decision::Allowed { remaining } => {
                tracing::debug!(
                    target: "floodgate::admission",
                    key = %key,
                    tokens_left = remaining,
                    "request admitted"
                );
                // The readied service handles this request; the clone waits for the next one.
                let clone = self.inner.clone();
                let mut inner = std::mem::replace(&mut self.inner, clone);
                Box::pin(inner.call(req))
            }
            Decision::Denied { wait } => {
                tracing::info!(
                    target: "floodgate::admission",
                    key = %key,
                    retry_after = ?wait,
                    "rate limit exceeded"
                );
                Box::pin(futures::future::ready(Ok(too_many_requests(wait))))
            }
        }
    }
}

fn too_many_requests<B: From<&'static str>>(wait: Duration) -> Response<B> {
    let mut res = Response::new(B::from(RATE_LIMIT_EXCEEDED));
    *res.status_mut() = StatusCode::TOO_MANY_REQUESTS;
    res.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    if wait != Duration::MAX {
        let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
        res.headers_mut().insert(RETRY_AFTER, HeaderValue::from(secs.max(1)));
    }
    res
}

/// Owns the client registry and its janitor for the lifetime of a server.
///
/// ```no_run
/// # async fn demo() {
/// use floodgate::{AdmissionController, LimiterConfig};
///
/// let controller = AdmissionController::start(LimiterConfig::default());
/// let layer = controller.layer(); // wrap the router with this
/// # let _ = layer;
/// controller.shutdown().await;
/// # }
/// ```
#[derive(Debug)]
pub struct AdmissionController {
    registry: Arc<ClientLimiterRegistry>,
    extractor: ClientKeyExtractor,
    janitor: BackgroundTask,
}

impl AdmissionController {
    /// Build the registry and start its janitor. Requires a tokio runtime.
    pub fn start(config: LimiterConfig) -> Self {
        Self::start_with_clock(config, default_clock())
    }

    pub fn start_with_clock(config: LimiterConfig, clock: SharedClock) -> Self {
        let registry = Arc::new(ClientLimiterRegistry::with_clock(&config, clock));
        let janitor = registry.spawn_janitor();
        tracing::info!(
            target: "floodgate::admission",
            refill_rate = config.refill_rate(),
            capacity = config.capacity(),
            proxy_trust = ?config.proxy_trust(),
            "admission control started"
        );
        Self { registry, extractor: ClientKeyExtractor::new(config.proxy_trust().clone()), janitor }
    }

    /// A layer sharing this controller's registry.
    pub fn layer(&self) -> AdmissionLayer<ClientLimiterRegistry> {
        AdmissionLayer::shared(self.registry.clone()).with_key_extractor(self.extractor.clone())
    }

    pub fn registry(&self) -> &Arc<ClientLimiterRegistry> {
        &self.registry
    }

    /// Stop the janitor and wait for it. Safe to call more than once.
    pub async fn shutdown(&self) {
        self.janitor.shutdown().await;
    }
}
