//! Per-operation context: tracing span, deadline and caller identity.

use std::future::Future;
use std::time::Duration;

use tokio::time::{Instant, timeout_at};
use tracing::{Instrument, Span};

use super::error::Error;

/// Carried through every pipeline call.
///
/// Cache and store operations run inside `span`. When a deadline is set,
/// pending work is abandoned once it passes and the operation reports
/// [`Error::Cancelled`].
#[derive(Debug, Clone)]
pub struct Context {
    span: Span,
    deadline: Option<Instant>,
    actor: Option<String>,
    request_id: Option<String>,
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl Context {
    /// A context without deadline or caller, bound to the current span.
    pub fn background() -> Self {
        Self {
            span: Span::current(),
            deadline: None,
            actor: None,
            request_id: None,
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn actor(&self) -> Option<&str> {
        self.actor.as_deref()
    }

    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Fail fast when the deadline already passed.
    pub fn check(&self, committed: bool) -> Result<(), Error> {
        if self.is_expired() {
            return Err(Error::Cancelled { committed });
        }
        Ok(())
    }

    /// Run `fut` inside this context's span, bounded by its deadline.
    ///
    /// `committed` is reported when the deadline interrupts the future.
    pub async fn run<F, T>(&self, committed: bool, fut: F) -> Result<T, Error>
    where
        F: Future<Output = Result<T, Error>>,
    {
        let fut = fut.instrument(self.span.clone());
        match self.deadline {
            Some(deadline) => timeout_at(deadline, fut)
                .await
                .map_err(|_| Error::Cancelled { committed })?,
            None => fut.await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn expired_deadline_cancels_pending_work() {
        let ctx = Context::background().with_timeout(Duration::from_millis(10));
        let result: Result<(), Error> = ctx
            .run(false, async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(Error::Cancelled { committed: false })));
        assert!(ctx.is_expired());
        assert!(matches!(ctx.check(true), Err(Error::Cancelled { committed: true })));
    }

    #[tokio::test]
    async fn work_without_deadline_runs_to_completion() {
        let ctx = Context::background().with_actor("tester");
        let value = ctx.run(false, async { Ok::<_, Error>(7) }).await.expect("value");
        assert_eq!(value, 7);
        assert_eq!(ctx.actor(), Some("tester"));
        assert!(ctx.check(false).is_ok());
    }
}
