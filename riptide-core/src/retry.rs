//! Retry policy: whether to retry a failed attempt, after how long, and
//! against which origin.
//!
//! `should_retry` and `next_origin` are computed independently. Callers must
//! consult both: an empty `next_origin` terminates the retry loop even when
//! `should_retry` reports true.

use std::time::Duration;

use crate::errors::TransportError;
use crate::load_balancer::{LoadBalancer, LoadBalancingContext, Preferences};
use crate::origin::AppId;
use crate::remote_host::RemoteHost;

/// The evolving state of one logical request's retry loop.
///
/// Created once per logical request; the dispatch pipeline records each
/// failed attempt before re-evaluating the policy.
#[derive(Debug)]
pub struct RetryContext {
    app_id: AppId,
    current_retry_count: u32,
    previous_origins: Vec<RemoteHost>,
    last_error: Option<TransportError>,
}

impl RetryContext {
    /// Creates the context for a fresh logical request.
    pub fn new(app_id: AppId) -> Self {
        Self {
            app_id,
            current_retry_count: 0,
            previous_origins: Vec::new(),
            last_error: None,
        }
    }

    /// The application being dispatched to.
    pub fn app_id(&self) -> &AppId {
        &self.app_id
    }

    /// How many retries have been attempted so far (0 on first evaluation).
    pub fn current_retry_count(&self) -> u32 {
        self.current_retry_count
    }

    /// The hosts already attempted for this logical request.
    pub fn previous_origins(&self) -> &[RemoteHost] {
        &self.previous_origins
    }

    /// The failure that ended the last attempt, if any.
    pub fn last_error(&self) -> Option<&TransportError> {
        self.last_error.as_ref()
    }

    /// Whether the host has already been attempted.
    pub fn has_tried(&self, host: &RemoteHost) -> bool {
        self.previous_origins
            .iter()
            .any(|tried| tried.origin() == host.origin())
    }

    /// Records one failed attempt: grows the tried set and stores the error.
    /// The retry count is bumped separately, by [`begin_retry`](Self::begin_retry),
    /// so the first policy evaluation still sees a count of zero.
    pub fn attempt_failed(&mut self, host: RemoteHost, error: TransportError) {
        if !self.has_tried(&host) {
            self.previous_origins.push(host);
        }
        self.last_error = Some(error);
    }

    /// Marks the start of one more retry attempt.
    pub fn begin_retry(&mut self) {
        self.current_retry_count += 1;
    }
}

/// The policy's verdict for one failed attempt. Produced fresh per
/// evaluation, never mutated.
#[derive(Debug, Clone)]
pub struct RetryOutcome {
    retry_interval: Duration,
    next_origin: Option<RemoteHost>,
    should_retry: bool,
}

impl RetryOutcome {
    /// Assembles an outcome.
    pub fn new(
        retry_interval: Duration,
        next_origin: Option<RemoteHost>,
        should_retry: bool,
    ) -> Self {
        Self {
            retry_interval,
            next_origin,
            should_retry,
        }
    }

    /// Backoff to wait before the next attempt.
    pub fn retry_interval(&self) -> Duration {
        self.retry_interval
    }

    /// The origin to try next. Empty means the loop must terminate, even if
    /// [`should_retry`](RetryOutcome::should_retry) is true.
    pub fn next_origin(&self) -> Option<&RemoteHost> {
        self.next_origin.as_ref()
    }

    /// Whether the policy permits another attempt. Consult together with
    /// [`next_origin`](RetryOutcome::next_origin).
    pub fn should_retry(&self) -> bool {
        self.should_retry
    }
}

/// Decides whether a failed attempt should be retried and against which
/// origin. Implementations are injected as plain dependencies.
pub trait RetryPolicy: Send + Sync {
    /// Evaluates one failed attempt.
    fn evaluate(
        &self,
        context: &RetryContext,
        load_balancer: &dyn LoadBalancer,
        preferences: &Preferences,
    ) -> RetryOutcome;
}

/// The canonical policy: up to `max_attempts` retries, fixed backoff,
/// retrying only transport-level failures.
#[derive(Debug, Clone)]
pub struct RetryNTimes {
    max_attempts: u32,
    retry_interval: Duration,
}

impl RetryNTimes {
    /// Creates the policy with zero backoff.
    pub fn new(max_attempts: u32) -> Self {
        Self::with_interval(max_attempts, Duration::ZERO)
    }

    /// Creates the policy with a fixed backoff between attempts.
    pub fn with_interval(max_attempts: u32, retry_interval: Duration) -> Self {
        Self {
            max_attempts,
            retry_interval,
        }
    }

    fn next_candidate(
        &self,
        context: &RetryContext,
        load_balancer: &dyn LoadBalancer,
        preferences: &Preferences,
    ) -> Option<RemoteHost> {
        let lb_context = LoadBalancingContext {
            app_id: context.app_id(),
            request: None,
            preferences,
        };
        load_balancer
            .choose(&lb_context)
            .into_iter()
            .find(|candidate| !context.has_tried(candidate))
    }
}

impl RetryPolicy for RetryNTimes {
    fn evaluate(
        &self,
        context: &RetryContext,
        load_balancer: &dyn LoadBalancer,
        preferences: &Preferences,
    ) -> RetryOutcome {
        let should_retry = context.current_retry_count() < self.max_attempts
            && context
                .last_error()
                .map(TransportError::is_retryable)
                .unwrap_or(false);
        let next_origin = self.next_candidate(context, load_balancer, preferences);
        RetryOutcome::new(self.retry_interval, next_origin, should_retry)
    }
}

/// Building block: never retry.
#[derive(Debug, Clone, Default)]
pub struct AlwaysFail;

impl RetryPolicy for AlwaysFail {
    fn evaluate(
        &self,
        _context: &RetryContext,
        _load_balancer: &dyn LoadBalancer,
        _preferences: &Preferences,
    ) -> RetryOutcome {
        RetryOutcome::new(Duration::ZERO, None, false)
    }
}

/// Building block: always retry, with no opinion on the next origin.
#[derive(Debug, Clone, Default)]
pub struct AlwaysRetry;

impl RetryPolicy for AlwaysRetry {
    fn evaluate(
        &self,
        _context: &RetryContext,
        _load_balancer: &dyn LoadBalancer,
        _preferences: &Preferences,
    ) -> RetryOutcome {
        // Names no next origin; composing policies or the caller pick one.
        RetryOutcome::new(Duration::ZERO, None, true)
    }
}
