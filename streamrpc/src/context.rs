// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! Provides a call context that carries a deadline, a cancellation signal, call-scoped metadata
//! and trace context. The deadline, metadata and trace context are sent from client to server;
//! cancellation travels as an explicit cancel message.

use crate::{
    trace::{self, TraceId},
    Status,
};
use serde::{Deserialize, Serialize};
use static_assertions::assert_impl_all;
use std::{
    collections::HashMap,
    time::{Duration, SystemTime},
};
use tokio_util::sync::CancellationToken;

/// A call context that carries call-scoped information like deadlines and trace information.
///
/// Clones share the cancellation signal: once any clone is [canceled](Context::cancel), every
/// clone observes it, and the cancellation can never be undone. A deadline that has passed is
/// treated exactly like a cancellation, except that it is reported as
/// [`DeadlineExceeded`](crate::Code::DeadlineExceeded).
///
/// The context should not be stored directly in a server implementation, because the context will
/// be different for each call in scope.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[non_exhaustive]
pub struct Context {
    /// When the caller expects the call to be complete by. `None` means the call may run for as
    /// long as both sides keep it open.
    pub deadline: Option<SystemTime>,
    /// Call-scoped key/value pairs sent along with the call.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Uniquely identifies calls originating from the same source. When a service handles a call
    /// by making calls itself, those calls should include the same `trace_id` as that included on
    /// the original call.
    pub trace_context: trace::Context,
    #[serde(skip, default = "CancellationToken::new")]
    cancellation: CancellationToken,
}

assert_impl_all!(Context: Send, Sync);

tokio::task_local! {
    static CURRENT_CONTEXT: Context;
}

/// Returns the context for the current call, or a default Context if no call is being served.
pub fn current() -> Context {
    Context::current()
}

impl Default for Context {
    fn default() -> Self {
        Self::new_root()
    }
}

impl Context {
    /// Returns a Context containing a new root trace context, no deadline and no metadata.
    pub fn new_root() -> Self {
        Self {
            deadline: None,
            metadata: HashMap::new(),
            trace_context: trace::Context::new_root(),
            cancellation: CancellationToken::new(),
        }
    }

    /// Returns the context of the call currently being served, or a new root context if the
    /// current task is not serving a call.
    pub fn current() -> Self {
        CURRENT_CONTEXT
            .try_with(Self::clone)
            .unwrap_or_else(|_| Self::new_root())
    }

    /// Sets the deadline.
    pub fn with_deadline(mut self, deadline: SystemTime) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Sets the deadline to `timeout` from now.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(SystemTime::now() + timeout)
    }

    /// Adds a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Returns a context for a call made on behalf of this one: same deadline and metadata, a
    /// child span of the same trace, and a cancellation signal that fires when this context's
    /// does (but not the other way around).
    pub fn child(&self) -> Self {
        Self {
            deadline: self.deadline,
            metadata: self.metadata.clone(),
            trace_context: self.trace_context.new_child(),
            cancellation: self.cancellation.child_token(),
        }
    }

    /// Replaces the cancellation signal. Used by the server, which never trusts a signal that
    /// arrived over the wire.
    pub(crate) fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }

    /// Returns the ID of the call-scoped trace.
    pub fn trace_id(&self) -> &TraceId {
        &self.trace_context.trace_id
    }

    /// Fires the cancellation signal. Irreversible.
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    /// Returns true iff the cancellation signal has fired.
    pub fn is_canceled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Returns true iff the deadline has passed.
    pub fn is_expired(&self) -> bool {
        self.deadline
            .map_or(false, |deadline| deadline <= SystemTime::now())
    }

    /// Returns the status the call should end with if the context is already done, i.e. if it was
    /// canceled or its deadline passed. Cancellation takes precedence.
    pub fn err(&self) -> Option<Status> {
        if self.is_canceled() {
            Some(Status::canceled("the call was canceled"))
        } else if self.is_expired() {
            Some(Status::deadline_exceeded("the call exceeded its deadline"))
        } else {
            None
        }
    }

    /// Completes once the context is canceled or its deadline passes, with the corresponding
    /// status. Never completes for a context with no deadline that is never canceled.
    pub async fn done(&self) -> Status {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    _ = self.cancellation.cancelled() => {
                        Status::canceled("the call was canceled")
                    }
                    _ = tokio::time::sleep(time_until(deadline)) => {
                        Status::deadline_exceeded("the call exceeded its deadline")
                    }
                }
            }
            None => {
                self.cancellation.cancelled().await;
                Status::canceled("the call was canceled")
            }
        }
    }

    /// Run a future with this context as the current context.
    pub async fn scope<F>(self, f: F) -> F::Output
    where
        F: std::future::Future,
    {
        CURRENT_CONTEXT.scope(self, f).await
    }
}

/// How long until `deadline`. Zero once it passed.
fn time_until(deadline: SystemTime) -> Duration {
    deadline
        .duration_since(SystemTime::now())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::{current, time_until, Context};
    use crate::Code;
    use assert_matches::assert_matches;
    use futures::prelude::*;
    use futures_test::task::noop_context;
    use std::{
        task::Poll,
        time::{Duration, SystemTime},
    };

    #[test]
    fn context_root_has_no_deadline() {
        let ctx = Context::new_root();
        assert_matches!(ctx.deadline, None);
        assert!(ctx.err().is_none());
    }

    #[test]
    fn context_scope() {
        let ctx = Context::new_root().with_metadata("user", "david");
        let mut ctx_copy = Box::pin(ctx.clone().scope(async { current() }));
        assert_matches!(ctx_copy.poll_unpin(&mut noop_context()),
                        Poll::Ready(Context { trace_context, metadata, .. })
                        if trace_context == ctx.trace_context
                        && metadata.get("user").map(String::as_str) == Some("david"));
    }

    #[test]
    fn cancel_is_shared_by_clones() {
        let ctx = Context::new_root();
        let clone = ctx.clone();
        clone.cancel();
        assert!(ctx.is_canceled());
        assert_matches!(ctx.err(), Some(status) if status.code() == Code::Canceled);
    }

    #[test]
    fn child_is_canceled_with_parent_only() {
        let parent = Context::new_root();
        let child = parent.child();
        child.cancel();
        assert!(!parent.is_canceled());

        let child = parent.child();
        parent.cancel();
        assert!(child.is_canceled());
        assert_eq!(child.trace_id(), parent.trace_id());
    }

    #[test]
    fn expired_deadline_is_deadline_exceeded() {
        let ctx = Context::new_root().with_deadline(SystemTime::now() - Duration::from_secs(1));
        assert_matches!(ctx.err(), Some(status) if status.code() == Code::DeadlineExceeded);
    }

    #[tokio::test(start_paused = true)]
    async fn done_fires_at_deadline() {
        let ctx = Context::new_root().with_timeout(Duration::from_secs(1));
        let status = ctx.done().await;
        assert_eq!(status.code(), Code::DeadlineExceeded);
    }

    #[tokio::test]
    async fn done_fires_on_cancel() {
        let ctx = Context::new_root().with_timeout(Duration::from_secs(60));
        let canceler = ctx.clone();
        tokio::spawn(async move { canceler.cancel() });
        assert_eq!(ctx.done().await.code(), Code::Canceled);
    }

    #[test]
    fn cancellation_is_not_serialized() {
        let ctx = Context::new_root().with_metadata("k", "v");
        ctx.cancel();
        let decoded: Context = serde_json::from_str(&serde_json::to_string(&ctx).unwrap()).unwrap();
        assert!(!decoded.is_canceled());
        assert_eq!(decoded.metadata.get("k").map(String::as_str), Some("v"));
    }

    #[test]
    fn time_until_passed_deadline_is_zero() {
        let passed = SystemTime::now() - Duration::from_secs(5);
        assert_eq!(time_until(passed), Duration::ZERO);
        assert!(time_until(SystemTime::now() + Duration::from_secs(60)) > Duration::from_secs(50));
    }
}
