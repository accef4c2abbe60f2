//! Per-request cancellation and deadline propagation

use crate::error::{AuthzError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Carries the caller's cancellation signal and deadline into every store and
/// cache call made on its behalf.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl RequestContext {
    /// Context that is never cancelled and has no deadline
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: Some(Instant::now() + timeout),
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Apply `timeout` unless a tighter deadline is already set
    pub fn bounded(mut self, timeout: Option<Duration>) -> Self {
        if let Some(timeout) = timeout {
            let candidate = Instant::now() + timeout;
            self.deadline = Some(match self.deadline {
                Some(existing) => existing.min(candidate),
                None => candidate,
            });
        }
        self
    }

    /// Child context sharing the deadline, cancelled together with the parent
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            deadline: self.deadline,
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Fail fast if the request is already cancelled or past its deadline
    pub fn check(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(AuthzError::Cancelled);
        }
        if matches!(self.deadline, Some(deadline) if Instant::now() >= deadline) {
            return Err(AuthzError::DeadlineExceeded);
        }
        Ok(())
    }

    /// Race `fut` against cancellation and the deadline.
    pub async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check()?;

        let guarded = async {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Err(AuthzError::Cancelled),
                result = fut => result,
            }
        };

        match self.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, guarded)
                .await
                .unwrap_or(Err(AuthzError::DeadlineExceeded)),
            None => guarded.await,
        }
    }

    /// [`RequestContext::run`] for collaborator futures with their own error type
    pub async fn call<T, E, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, E>>,
        E: Into<AuthzError>,
    {
        self.run(async { fut.await.map_err(Into::into) }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_passes_through() {
        let ctx = RequestContext::background();
        let value = ctx.run(async { Ok::<_, AuthzError>(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let ctx = RequestContext::background();
        ctx.cancel();

        let result = ctx.run(async { Ok::<_, AuthzError>(()) }).await;
        assert!(matches!(result, Err(AuthzError::Cancelled)));
    }

    #[tokio::test]
    async fn test_cancelled_while_pending() {
        let ctx = RequestContext::background();
        let handle = ctx.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            handle.cancel();
        });

        let result = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, AuthzError>(())
            })
            .await;
        assert!(matches!(result, Err(AuthzError::Cancelled)));
    }

    #[tokio::test]
    async fn test_deadline_exceeded() {
        let ctx = RequestContext::with_timeout(Duration::from_millis(10));

        let result = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, AuthzError>(())
            })
            .await;
        assert!(matches!(result, Err(AuthzError::DeadlineExceeded)));
    }

    #[tokio::test]
    async fn test_child_cancelled_with_parent() {
        let parent = RequestContext::background();
        let child = parent.child();
        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn test_bounded_keeps_tighter_deadline() {
        let ctx = RequestContext::with_timeout(Duration::from_millis(5));
        let deadline = ctx.deadline();
        let ctx = ctx.bounded(Some(Duration::from_secs(60)));
        assert_eq!(ctx.deadline(), deadline);
    }
}
