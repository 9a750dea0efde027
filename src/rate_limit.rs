//! Server-feedback rate limiting contract, the typed rate-limit failure, and the retry hint
//! consumed by the request scheduler.

// std
use std::{convert::Infallible, time::Duration as StdDuration};
// crates.io
use tokio::time::Instant;
// self
use crate::{_prelude::*, http::ResponseMetadata};

/// Longest back-off a single server hint can impose.
pub const MAX_RETRY_AFTER: StdDuration = StdDuration::from_secs(24 * 60 * 60);

/// Boxed future returned by [`RateLimiter::wait_for_budget`].
pub type RateLimitFuture<'a> = Pin<Box<dyn Future<Output = ()> + 'a + Send>>;

/// Tracks the remaining request budget reported by the server.
pub trait RateLimiter
where
	Self: Send + Sync,
{
	/// Resolves once the limiter believes another request may be sent.
	fn wait_for_budget(&self) -> RateLimitFuture<'_>;

	/// Returns `true` when a request may be sent right now.
	fn can_make_request(&self) -> bool;

	/// Snapshot of the limiter's view of the budget.
	fn status(&self) -> RateLimitStatus;

	/// Feeds response metadata back into the limiter.
	fn observe(&self, meta: &ResponseMetadata);
}

/// Budget view returned by [`RateLimiter::status`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RateLimitStatus {
	/// Window budget, when the server advertised one.
	pub limit: Option<u32>,
	/// Requests left in the window, when known.
	pub remaining: Option<u32>,
	/// Time until the window resets or a `Retry-After` block lifts.
	pub reset_in: Option<StdDuration>,
}

/// Typed failure for calls the server throttled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RateLimitError {
	/// How long the server asked callers to back off.
	pub retry_after: Option<StdDuration>,
	/// Endpoint label the limit applies to.
	pub endpoint: Option<String>,
}
impl RateLimitError {
	/// Creates an error carrying an optional retry hint.
	pub fn new(retry_after: Option<StdDuration>) -> Self {
		Self { retry_after, endpoint: None }
	}

	/// Tags the error with the endpoint that was throttled.
	pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
		self.endpoint = Some(endpoint.into());

		self
	}
}
impl Display for RateLimitError {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		match &self.endpoint {
			Some(endpoint) => write!(f, "Rate limit exceeded for `{endpoint}`."),
			None => f.write_str("Rate limit exceeded."),
		}
	}
}
impl StdError for RateLimitError {}

/// Exposes a server-provided back-off hint on operation errors.
///
/// The request scheduler reads this after a failed dispatch and delays later dispatches
/// accordingly. Implement it for custom error types that can wrap a [`RateLimitError`].
pub trait RetryAfter {
	/// Returns the back-off the server requested, if any.
	fn retry_after(&self) -> Option<StdDuration>;
}
impl RetryAfter for RateLimitError {
	fn retry_after(&self) -> Option<StdDuration> {
		self.retry_after
	}
}
impl RetryAfter for Error {
	fn retry_after(&self) -> Option<StdDuration> {
		match self {
			Self::RateLimited(e) => e.retry_after,
			Self::Queue(e) => e.retry_after(),
			_ => None,
		}
	}
}
impl RetryAfter for Box<dyn StdError + Send + Sync> {
	fn retry_after(&self) -> Option<StdDuration> {
		if let Some(e) = self.downcast_ref::<RateLimitError>() {
			return e.retry_after();
		}

		self.downcast_ref::<Error>().and_then(RetryAfter::retry_after)
	}
}
impl RetryAfter for std::io::Error {
	fn retry_after(&self) -> Option<StdDuration> {
		None
	}
}
impl RetryAfter for String {
	fn retry_after(&self) -> Option<StdDuration> {
		None
	}
}
impl RetryAfter for &'static str {
	fn retry_after(&self) -> Option<StdDuration> {
		None
	}
}
impl RetryAfter for Infallible {
	fn retry_after(&self) -> Option<StdDuration> {
		match *self {}
	}
}

/// [`RateLimiter`] driven by `X-RateLimit-*` and `Retry-After` response headers.
#[derive(Debug, Default)]
pub struct HeaderRateLimiter(Mutex<Budget>);
#[derive(Debug, Default)]
struct Budget {
	limit: Option<u32>,
	remaining: Option<u32>,
	reset_at: Option<Instant>,
	blocked_until: Option<Instant>,
}
impl Budget {
	fn roll_over(&mut self, now: Instant) {
		if self.reset_at.is_some_and(|at| at <= now) {
			self.remaining = self.limit;
			self.reset_at = None;
		}
		if self.blocked_until.is_some_and(|at| at <= now) {
			self.blocked_until = None;
		}
	}

	fn wait_needed(&mut self, now: Instant) -> Option<StdDuration> {
		self.roll_over(now);

		let exhausted = match (self.remaining, self.reset_at) {
			(Some(0), Some(at)) => Some(at),
			_ => None,
		};

		[exhausted, self.blocked_until].into_iter().flatten().max().map(|at| at - now)
	}
}
impl HeaderRateLimiter {
	/// Creates a limiter with no budget information; every request is allowed until the
	/// server reports otherwise.
	pub fn new() -> Self {
		Self::default()
	}
}
impl RateLimiter for HeaderRateLimiter {
	fn wait_for_budget(&self) -> RateLimitFuture<'_> {
		Box::pin(async move {
			loop {
				let wait = self.0.lock().wait_needed(Instant::now());

				match wait {
					Some(delay) => {
						tracing::debug!(?delay, "waiting for server-side rate limit budget");
						tokio::time::sleep(delay).await;
					},
					None => return,
				}
			}
		})
	}

	fn can_make_request(&self) -> bool {
		self.0.lock().wait_needed(Instant::now()).is_none()
	}

	fn status(&self) -> RateLimitStatus {
		let now = Instant::now();
		let mut budget = self.0.lock();

		budget.roll_over(now);

		let reset_in = [budget.reset_at, budget.blocked_until]
			.into_iter()
			.flatten()
			.max()
			.map(|at| at.saturating_duration_since(now));

		RateLimitStatus { limit: budget.limit, remaining: budget.remaining, reset_in }
	}

	fn observe(&self, meta: &ResponseMetadata) {
		let now = Instant::now();
		let mut budget = self.0.lock();

		if let Some(limit) = meta.limit {
			budget.limit = Some(limit);
		}
		if let Some(remaining) = meta.remaining {
			budget.remaining = Some(remaining);
		}
		if let Some(reset) = meta.reset_after.and_then(|d| StdDuration::try_from(d).ok()) {
			budget.reset_at = Some(back_off_deadline(now, reset));
		}
		if let Some(retry) = meta.retry_after.and_then(|d| StdDuration::try_from(d).ok()) {
			budget.blocked_until = Some(back_off_deadline(now, retry));
		}
	}
}

/// Instant `delay` after `now`, with `delay` capped at [`MAX_RETRY_AFTER`].
pub(crate) fn back_off_deadline(now: Instant, delay: StdDuration) -> Instant {
	now.checked_add(delay.min(MAX_RETRY_AFTER)).unwrap_or(now)
}
