use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use opsdesk_core::context::RequestContext;
use opsdesk_core::errors::StageFailure;
use opsdesk_core::pipeline::Stage;

/// One step of the pipeline. Agents read the context built so far and return
/// their output; committing it is the orchestrator's job.
#[async_trait]
pub trait Agent: Send + Sync {
    type Output: Send;

    fn stage(&self) -> Stage;

    async fn run(&self, ctx: &RequestContext) -> Result<Self::Output, StageFailure>;
}

/// Bounds a leaf collaborator call. `None` means the call did not finish in
/// time.
pub(crate) async fn bounded<F, T>(limit: Duration, call: F) -> Option<T>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(limit, call).await.ok()
}

pub(crate) fn elapsed_ms(started: std::time::Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
