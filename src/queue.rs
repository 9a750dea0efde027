//! Process-wide, priority-ordered request scheduler.
//!
//! [`RequestQueue`] serializes arbitrary async operations against a daily budget and a
//! per-second budget. Items are dispatched one at a time by a drain loop that exists only
//! while work is pending: the first [`RequestQueue::enqueue`] spawns it and it exits once the
//! queue is empty. Before every dequeue the pending items are stably sorted by [`Priority`], so
//! equal-priority work runs in submission order and late high-priority work overtakes queued
//! lower-priority work without preempting whatever is already executing.
//!
//! Operations that fail with a [`RetryAfter`] hint delay later dispatches to the same endpoint
//! (or all dispatches, when the item had no endpoint).

mod config;
mod drain;
mod error;
mod job;

pub use config::QueueConfig;
pub use error::QueueError;

// std
use std::{
	sync::atomic::{AtomicU64, Ordering},
	task::{Context, Poll},
	time::Duration as StdDuration,
};
// crates.io
use tokio::{runtime::Handle, sync::oneshot, time::Instant};
// self
use crate::{
	_prelude::*,
	queue::{
		drain::State,
		error::Rejection,
		job::{Operation, QueueItem},
	},
	rate_limit::RetryAfter,
};

static INSTANCE: Mutex<Option<Arc<RequestQueue>>> = parking_lot::const_mutex(None);

/// Submits `op` to the process-wide queue; see [`RequestQueue::enqueue`].
pub fn submit<F, Fut, T, E>(op: F, options: EnqueueOptions) -> QueueTicket<T, E>
where
	F: 'static + Send + FnOnce() -> Fut,
	Fut: 'static + Send + Future<Output = Result<T, E>>,
	T: 'static + Send,
	E: 'static + Send + RetryAfter,
{
	RequestQueue::instance().enqueue(op, options)
}

/// Dispatch priority; lower ranks run first.
#[derive(
	Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
	/// Dispatched before everything else.
	High,
	/// Default tier.
	#[default]
	Normal,
	/// Dispatched once nothing of higher priority is pending.
	Low,
}
impl Priority {
	/// Returns a stable label suitable for logs.
	pub const fn as_str(self) -> &'static str {
		match self {
			Priority::High => "high",
			Priority::Normal => "normal",
			Priority::Low => "low",
		}
	}
}
impl Display for Priority {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}

/// Per-item submission options.
#[derive(Clone, Debug, Default)]
pub struct EnqueueOptions {
	/// Dispatch tier.
	pub priority: Priority,
	/// Total budget covering both queueing and execution; the queue default when unset.
	pub timeout: Option<StdDuration>,
	/// Endpoint label used to scope retry-after hints.
	pub endpoint: Option<String>,
}
impl EnqueueOptions {
	/// Normal priority, default timeout, no endpoint.
	pub fn new() -> Self {
		Self::default()
	}

	/// Sets the dispatch tier.
	pub fn with_priority(mut self, priority: Priority) -> Self {
		self.priority = priority;

		self
	}

	/// Sets the total timeout.
	pub fn with_timeout(mut self, timeout: StdDuration) -> Self {
		self.timeout = Some(timeout);

		self
	}

	/// Tags the item with an endpoint label.
	pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
		self.endpoint = Some(endpoint.into());

		self
	}
}

/// Point-in-time view of a queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueStatus {
	/// Items waiting to be dispatched; an executing item is not counted.
	pub queue_length: usize,
	/// Whether a drain loop is alive.
	pub is_processing: bool,
	/// Successful dispatches left before the daily reset.
	pub daily_remaining: u32,
	/// Next UTC midnight, when the daily budget resets.
	pub next_reset: OffsetDateTime,
}

/// Resolves once the queued operation settles.
///
/// Dropping the ticket does not withdraw the item; its outcome is discarded instead.
pub struct QueueTicket<T, E> {
	id: u64,
	rx: oneshot::Receiver<Result<T, QueueError<E>>>,
}
impl<T, E> QueueTicket<T, E> {
	/// Queue-assigned identifier, increasing in submission order.
	pub fn id(&self) -> u64 {
		self.id
	}
}
impl<T, E> Future for QueueTicket<T, E> {
	type Output = Result<T, QueueError<E>>;

	fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		Pin::new(&mut self.rx)
			.poll(cx)
			.map(|received| received.unwrap_or_else(|_| Err(QueueError::Abandoned)))
	}
}
impl<T, E> Debug for QueueTicket<T, E> {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("QueueTicket").field("id", &self.id).finish()
	}
}

/// Priority-ordered scheduler enforcing daily and per-second budgets.
pub struct RequestQueue {
	config: QueueConfig,
	min_interval: StdDuration,
	dispatch_delay: StdDuration,
	default_timeout: StdDuration,
	next_id: AtomicU64,
	state: Mutex<State>,
}
impl RequestQueue {
	/// Creates a standalone queue, independent of the process-wide instance.
	pub fn new(config: QueueConfig) -> Result<Arc<Self>> {
		config.validate()?;

		Ok(Self::from_valid(config))
	}

	/// Returns the process-wide queue, creating it with default budgets on first use.
	pub fn instance() -> Arc<Self> {
		let mut slot = INSTANCE.lock();

		Arc::clone(slot.get_or_insert_with(|| Self::from_valid(QueueConfig::default())))
	}

	/// Replaces the process-wide queue with one built from `config` and returns it.
	///
	/// A previously installed queue is discarded as by [`RequestQueue::reset_instance`].
	pub fn install(config: QueueConfig) -> Result<Arc<Self>> {
		let queue = Self::new(config)?;
		let previous = INSTANCE.lock().replace(Arc::clone(&queue));

		if let Some(previous) = previous {
			previous.abandon();
		}

		Ok(queue)
	}

	/// Discards the process-wide queue; the next [`RequestQueue::instance`] call builds a new
	/// one.
	///
	/// Pending items of the discarded queue are dropped without running, so their tickets
	/// resolve to [`QueueError::Abandoned`]. An item that is already executing still settles.
	/// Meant for test isolation.
	pub fn reset_instance() {
		let previous = INSTANCE.lock().take();

		if let Some(previous) = previous {
			previous.abandon();
		}
	}

	/// Queues `op` and starts the drain loop if it is not running.
	///
	/// The operation is invoked at most once, on its own Tokio task. Its `timeout` (from
	/// `options`, else the queue default) covers queueing plus execution: an item whose wait
	/// alone exceeds it settles as [`QueueError::WaitTimeout`] without being invoked, and one
	/// that overruns the remainder settles as [`QueueError::ExecutionTimeout`].
	///
	/// Outside a Tokio runtime nothing is queued and the ticket resolves to
	/// [`QueueError::RuntimeUnavailable`].
	pub fn enqueue<F, Fut, T, E>(
		self: &Arc<Self>,
		op: F,
		options: EnqueueOptions,
	) -> QueueTicket<T, E>
	where
		F: 'static + Send + FnOnce() -> Fut,
		Fut: 'static + Send + Future<Output = Result<T, E>>,
		T: 'static + Send,
		E: 'static + Send + RetryAfter,
	{
		let id = self.next_id.fetch_add(1, Ordering::Relaxed);
		let (reply, rx) = oneshot::channel();
		let ticket = QueueTicket { id, rx };
		let Ok(runtime) = Handle::try_current() else {
			tracing::warn!(id, "request submitted outside of a Tokio runtime");

			let _ = reply.send(Err(QueueError::RuntimeUnavailable));

			return ticket;
		};
		let timeout = options.timeout.unwrap_or(self.default_timeout);
		let item = QueueItem {
			id,
			priority: options.priority,
			enqueued_at: Instant::now(),
			timeout,
			endpoint: options.endpoint,
			job: Box::new(Operation { op, reply, timeout }),
		};
		{
			let mut state = self.state.lock();

			if state.abandoned {
				// Dropping the item resolves the ticket as abandoned.
				return ticket;
			}

			state.pending.push(item);
		}

		self.start_drain(&runtime);

		ticket
	}

	/// Returns the current queue length, drain state, and daily budget.
	pub fn status(&self) -> QueueStatus {
		let mut state = self.state.lock();

		state.roll_daily(OffsetDateTime::now_utc());

		QueueStatus {
			queue_length: state.pending.len(),
			is_processing: state.running,
			daily_remaining: self.config.max_per_day.saturating_sub(state.daily_count),
			next_reset: state.next_reset,
		}
	}

	/// Rejects every pending item with [`QueueError::Cleared`] and returns how many there were.
	///
	/// An item that is already executing is unaffected.
	pub fn clear(&self) -> usize {
		let cleared = std::mem::take(&mut self.state.lock().pending);
		let count = cleared.len();

		for item in cleared {
			item.job.reject(Rejection::Cleared);
		}

		if count > 0 {
			tracing::info!(count, "request queue cleared");
		}

		count
	}

	/// Budgets this queue was built with.
	pub fn config(&self) -> &QueueConfig {
		&self.config
	}

	fn from_valid(config: QueueConfig) -> Arc<Self> {
		Arc::new(Self {
			min_interval: config.min_interval(),
			dispatch_delay: config.dispatch_delay.unsigned_abs(),
			default_timeout: config.default_timeout.unsigned_abs(),
			config,
			next_id: AtomicU64::new(0),
			state: Mutex::new(State::new(OffsetDateTime::now_utc())),
		})
	}

	fn abandon(&self) {
		let dropped = {
			let mut state = self.state.lock();

			state.abandoned = true;

			std::mem::take(&mut state.pending)
		};

		if !dropped.is_empty() {
			tracing::debug!(count = dropped.len(), "dropping requests of a discarded queue");
		}
	}
}
impl Debug for RequestQueue {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		let state = self.state.lock();

		f.debug_struct("RequestQueue")
			.field("config", &self.config)
			.field("queue_length", &state.pending.len())
			.field("is_processing", &state.running)
			.field("daily_count", &state.daily_count)
			.finish()
	}
}
