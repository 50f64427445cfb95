//! Dependency boundary: the quota-limited classification service.

use crate::consumer::message::{ModerationRequest, ModerationVerdict};
use crate::error::ClassifierError;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

/// The external service the consumer paces its calls to.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(
        &self,
        request: &ModerationRequest,
    ) -> Result<ModerationVerdict, ClassifierError>;
}

#[async_trait]
impl<C: Classifier + ?Sized> Classifier for Arc<C> {
    async fn classify(
        &self,
        request: &ModerationRequest,
    ) -> Result<ModerationVerdict, ClassifierError> {
        (**self).classify(request).await
    }
}

/// Receives every successful verdict before the message is acknowledged.
#[async_trait]
pub trait VerdictHandler: Send + Sync {
    async fn handle(&self, request: &ModerationRequest, verdict: &ModerationVerdict);
}

#[async_trait]
impl<H: VerdictHandler + ?Sized> VerdictHandler for Arc<H> {
    async fn handle(&self, request: &ModerationRequest, verdict: &ModerationVerdict) {
        (**self).handle(request, verdict).await
    }
}

/// Default handler: logs the verdict, flagging unsafe media at `warn`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogVerdicts;

#[async_trait]
impl VerdictHandler for LogVerdicts {
    async fn handle(&self, request: &ModerationRequest, verdict: &ModerationVerdict) {
        if verdict.safe {
            info!(
                target: "floodgate::consumer",
                name = %request.name,
                caption = %verdict.caption,
                "media classified as safe"
            );
        } else {
            warn!(
                target: "floodgate::consumer",
                name = %request.name,
                reason = %verdict.reason,
                "media classified as unsafe"
            );
        }
    }
}
