// std
use std::time::Duration as StdDuration;
// self
use crate::{_prelude::*, rate_limit::RetryAfter};

/// Outcome of a queued request that did not produce a value.
///
/// Wait-phase and execution-phase timeouts are distinct so callers can tell congestion apart
/// from a slow operation.
#[derive(Debug, ThisError)]
pub enum QueueError<E> {
	/// The request spent its whole timeout waiting and was never started.
	#[error("Request waited {waited:?} in the queue, exceeding its {timeout:?} timeout.")]
	WaitTimeout {
		/// Time spent queued.
		waited: StdDuration,
		/// Timeout the request was submitted with.
		timeout: StdDuration,
	},
	/// The request started but did not settle within the rest of its timeout.
	#[error("Request did not finish within its {timeout:?} timeout.")]
	ExecutionTimeout {
		/// Timeout the request was submitted with.
		timeout: StdDuration,
	},
	/// The queue was cleared before the request started.
	#[error("Request queue was cleared before the request ran.")]
	Cleared,
	/// The operation itself failed.
	#[error(transparent)]
	Operation(E),
	/// The operation panicked.
	#[error("Queued operation panicked.")]
	Panicked,
	/// The queue instance was discarded while the request was pending.
	#[error("Request queue was reset before the request ran.")]
	Abandoned,
	/// The request was submitted outside of a Tokio runtime.
	#[error("No Tokio runtime is available to drive the request queue.")]
	RuntimeUnavailable,
}
impl<E> QueueError<E> {
	/// Returns `true` for either timeout phase.
	pub fn is_timeout(&self) -> bool {
		matches!(self, Self::WaitTimeout { .. } | Self::ExecutionTimeout { .. })
	}

	/// Returns `true` when resubmitting the same work may succeed.
	///
	/// Cleared requests are deliberately excluded; operation failures are left to the caller.
	pub fn is_retryable(&self) -> bool {
		self.is_timeout() || matches!(self, Self::Abandoned)
	}

	/// Returns the operation's own error, if that is what failed.
	pub fn into_operation(self) -> Option<E> {
		match self {
			Self::Operation(e) => Some(e),
			_ => None,
		}
	}
}
impl<E> RetryAfter for QueueError<E>
where
	E: RetryAfter,
{
	fn retry_after(&self) -> Option<StdDuration> {
		match self {
			Self::Operation(e) => e.retry_after(),
			_ => None,
		}
	}
}

/// Settlement applied by the queue itself, without running the operation.
#[derive(Clone, Copy, Debug)]
pub(super) enum Rejection {
	WaitTimeout { waited: StdDuration, timeout: StdDuration },
	Cleared,
}
impl Rejection {
	pub(super) fn into_error<E>(self) -> QueueError<E> {
		match self {
			Self::WaitTimeout { waited, timeout } => QueueError::WaitTimeout { waited, timeout },
			Self::Cleared => QueueError::Cleared,
		}
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;
	use crate::rate_limit::RateLimitError;

	#[test]
	fn timeouts_are_retryable_but_clears_are_not() {
		let wait = QueueError::<String>::WaitTimeout {
			waited: StdDuration::from_millis(5),
			timeout: StdDuration::from_millis(1),
		};
		let exec = QueueError::<String>::ExecutionTimeout { timeout: StdDuration::from_millis(1) };

		assert!(wait.is_timeout() && wait.is_retryable());
		assert!(exec.is_timeout() && exec.is_retryable());
		assert!(!QueueError::<String>::Cleared.is_retryable());
		assert!(!QueueError::Operation(String::from("boom")).is_timeout());
	}

	#[test]
	fn operation_errors_keep_their_retry_hint() {
		let hint = Some(StdDuration::from_secs(3));
		let err = QueueError::Operation(RateLimitError::new(hint));

		assert_eq!(err.retry_after(), hint);
		assert_eq!(err.to_string(), "Rate limit exceeded.");
		assert_eq!(QueueError::<RateLimitError>::Cleared.retry_after(), None);
	}
}
