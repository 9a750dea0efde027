//! Type-erased queued work.

// std
use std::time::Duration as StdDuration;
// crates.io
use futures::future::{BoxFuture, FutureExt};
use tokio::{sync::oneshot, time::Instant};
// self
use crate::{
	_prelude::*,
	queue::{Priority, QueueError, error::Rejection},
	rate_limit::RetryAfter,
};

/// Sending half of a ticket.
pub(super) type Reply<T, E> = oneshot::Sender<Result<T, QueueError<E>>>;

/// How a launched job settled, as far as the drain loop's counters care.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum Settled {
	Success,
	Failure { retry_after: Option<StdDuration> },
	TimedOut,
	Panicked,
}

/// Operation plus the reply channel, with the value and error types erased.
///
/// Every path consumes the job, so an item settles at most once; dropping it unsettled resolves
/// the ticket as abandoned.
pub(super) trait Job
where
	Self: Send,
{
	/// Settles the item without invoking the operation.
	fn reject(self: Box<Self>, rejection: Rejection);

	/// Spawns the operation and races it against `budget`.
	fn launch(
		self: Box<Self>,
		budget: StdDuration,
		abort_on_timeout: bool,
	) -> BoxFuture<'static, Settled>;
}

/// A pending entry in the queue.
pub(super) struct QueueItem {
	pub(super) id: u64,
	pub(super) priority: Priority,
	pub(super) enqueued_at: Instant,
	pub(super) timeout: StdDuration,
	pub(super) endpoint: Option<String>,
	pub(super) job: Box<dyn Job>,
}
impl Debug for QueueItem {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("QueueItem")
			.field("id", &self.id)
			.field("priority", &self.priority)
			.field("timeout", &self.timeout)
			.field("endpoint", &self.endpoint)
			.finish()
	}
}

pub(super) struct Operation<F, T, E> {
	pub(super) op: F,
	pub(super) reply: Reply<T, E>,
	pub(super) timeout: StdDuration,
}
impl<F, Fut, T, E> Job for Operation<F, T, E>
where
	F: 'static + Send + FnOnce() -> Fut,
	Fut: 'static + Send + Future<Output = Result<T, E>>,
	T: 'static + Send,
	E: 'static + Send + RetryAfter,
{
	fn reject(self: Box<Self>, rejection: Rejection) {
		let _ = self.reply.send(Err(rejection.into_error()));
	}

	fn launch(
		self: Box<Self>,
		budget: StdDuration,
		abort_on_timeout: bool,
	) -> BoxFuture<'static, Settled> {
		let Self { op, reply, timeout } = *self;

		async move {
			// The closure runs inside the task so a panic while building the future is contained.
			let mut handle = tokio::spawn(async move { op().await });
			let (settled, outcome) = match tokio::time::timeout(budget, &mut handle).await {
				Ok(Ok(Ok(value))) => (Settled::Success, Ok(value)),
				Ok(Ok(Err(e))) => {
					let retry_after = e.retry_after();

					(Settled::Failure { retry_after }, Err(QueueError::Operation(e)))
				},
				Ok(Err(_)) => (Settled::Panicked, Err(QueueError::Panicked)),
				Err(_) => {
					if abort_on_timeout {
						handle.abort();
					}

					(Settled::TimedOut, Err(QueueError::ExecutionTimeout { timeout }))
				},
			};

			// The caller may have dropped its ticket; the outcome is discarded then.
			let _ = reply.send(outcome);

			settled
		}
		.boxed()
	}
}
