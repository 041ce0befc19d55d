//! Cancellation scope for the tasks of the tokio runtime.
//!
//! Every peer task runs under a child of the hub's root context, so a single peer can be stopped
//! on its own and the whole hub by cancelling the root.

use anyhow::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::Span;

/// RuntimeContext is a cancellation scope. Children are cancelled with their parent.
pub struct RuntimeContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    token: CancellationToken,
    has_parent: bool,
    span: Span,
}

impl RuntimeContext {
    /// Creates a root context.
    pub fn new(parent_span: &Span, tag: &str) -> Self {
        let span = tracing::span!(parent: parent_span, tracing::Level::TRACE, "runtime_context", tag = tag);
        Self {
            inner: Arc::new(ContextInner {
                token: CancellationToken::new(),
                has_parent: false,
                span,
            }),
        }
    }

    /// Creates a child context that is cancelled together with this one.
    pub fn child(&self, tag: &str) -> Self {
        let span = tracing::span!(parent: &self.inner.span, tracing::Level::TRACE, "runtime_context_child", tag = tag);
        Self {
            inner: Arc::new(ContextInner {
                token: self.inner.token.child_token(),
                has_parent: true,
                span,
            }),
        }
    }

    /// Cancels this context and all of its children.
    pub fn cancel(&self) {
        let _enter = self.inner.span.enter();
        tracing::trace!("cancelling context");
        self.inner.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Resolves once the context is cancelled.
    pub async fn cancelled(&self) {
        self.inner.token.cancelled().await;
    }

    /// Runs `future` unless the context is cancelled first, in which case it fails.
    pub async fn run<F, T>(&self, future: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        tokio::select! {
            result = future => result,
            _ = self.cancelled() => {
                Err(anyhow::anyhow!("context cancelled"))
            }
        }
    }
}

impl std::fmt::Debug for RuntimeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeContext")
            .field("is_cancelled", &self.is_cancelled())
            .field("has_parent", &self.inner.has_parent)
            .finish()
    }
}

/// Clones share the same cancellation state.
impl Clone for RuntimeContext {
    fn clone(&self) -> Self {
        RuntimeContext {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testutil::fixtures::{span_fixture, wait_until};
    use tokio::time::{sleep, Duration};

    #[tokio::test]
    async fn test_cancel_reaches_children() {
        let parent = RuntimeContext::new(&span_fixture(), "test_context");
        let child = parent.child("test_child");

        assert!(!child.is_cancelled());
        parent.cancel();

        let child_clone = child.clone();
        wait_until(move || child_clone.is_cancelled(), Duration::from_millis(100))
            .await
            .expect("child context should be cancelled within 100ms");
    }

    #[tokio::test]
    async fn test_child_cancel_leaves_parent() {
        let parent = RuntimeContext::new(&span_fixture(), "test_context");
        let child = parent.child("test_child");

        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn test_run_completes() {
        let ctx = RuntimeContext::new(&span_fixture(), "test_context");
        let result = ctx.run(async { Ok::<i32, anyhow::Error>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let ctx = RuntimeContext::new(&span_fixture(), "test_context");
        ctx.cancel();

        let result = ctx
            .run(async {
                sleep(Duration::from_millis(500)).await;
                Ok::<i32, anyhow::Error>(42)
            })
            .await;
        assert!(result.is_err());
    }
}
