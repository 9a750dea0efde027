//! The drain loop and the budget state it owns.

// std
use std::time::Duration as StdDuration;
// crates.io
use tokio::{runtime::Handle, time::Instant};
// self
use crate::{
	_prelude::*,
	obs::{self, FlowKind, FlowOutcome, FlowSpan},
	queue::{
		RequestQueue,
		error::Rejection,
		job::{QueueItem, Settled},
	},
	rate_limit,
};

/// Mutable scheduler state; only touched under [`RequestQueue`]'s lock.
#[derive(Debug)]
pub(super) struct State {
	pub(super) pending: Vec<QueueItem>,
	pub(super) running: bool,
	/// Identifies the drain task that set `running`.
	pub(super) drain_epoch: u64,
	/// Set once the instance is discarded; no further work is accepted or started.
	pub(super) abandoned: bool,
	pub(super) daily_count: u32,
	pub(super) next_reset: OffsetDateTime,
	pub(super) last_dispatch: Option<Instant>,
	/// Retry-after deadlines keyed by endpoint; `None` holds the global hint.
	pub(super) hints: HashMap<Option<String>, Instant>,
}
impl State {
	pub(super) fn new(now: OffsetDateTime) -> Self {
		Self {
			pending: Vec::new(),
			running: false,
			drain_epoch: 0,
			abandoned: false,
			daily_count: 0,
			next_reset: next_utc_midnight(now),
			last_dispatch: None,
			hints: HashMap::new(),
		}
	}

	/// Zeroes the daily counter once the reset time has passed.
	pub(super) fn roll_daily(&mut self, now: OffsetDateTime) {
		if now >= self.next_reset {
			self.daily_count = 0;
			self.next_reset = next_utc_midnight(now);

			tracing::debug!(next_reset = %self.next_reset, "daily request budget reset");
		}
	}

	/// Time to wait before the next dispatch, combining the per-second spacing with any
	/// retry-after hint that applies to the item about to run.
	fn pacing_delay(&mut self, min_interval: StdDuration, now: Instant) -> Option<StdDuration> {
		self.hints.retain(|_, until| *until > now);

		// `min_by_key` keeps the first of equal keys, matching the stable sort below.
		let endpoint = self
			.pending
			.iter()
			.min_by_key(|item| item.priority)
			.and_then(|item| item.endpoint.clone());
		let endpoint_hint = endpoint.and_then(|ep| self.hints.get(&Some(ep)));
		let ready_at = [
			self.last_dispatch.map(|at| at + min_interval),
			self.hints.get(&None).copied(),
			endpoint_hint.copied(),
		]
		.into_iter()
		.flatten()
		.max()?;

		(ready_at > now).then(|| ready_at - now)
	}
}

enum Step {
	Wait(StdDuration),
	Dispatch(QueueItem),
	Exit,
}

/// Owned by every drain task; clears the running flag when the task ends without reaching
/// [`Step::Exit`], i.e. when its runtime shuts down or the loop panics.
struct DrainGuard {
	queue: Arc<RequestQueue>,
	epoch: u64,
	started: bool,
}
impl Drop for DrainGuard {
	fn drop(&mut self) {
		let leftover = {
			let mut state = self.queue.state.lock();

			if !state.running || state.drain_epoch != self.epoch {
				return;
			}

			state.running = false;

			if state.abandoned { 0 } else { state.pending.len() }
		};

		tracing::warn!(epoch = self.epoch, leftover, "request queue drain loop ended unexpectedly");

		// A guard whose task never ran must not respawn, or a closing runtime would loop.
		if self.started
			&& leftover > 0
			&& let Ok(runtime) = Handle::try_current()
		{
			self.queue.start_drain(&runtime);
		}
	}
}

impl RequestQueue {
	/// Spawns a drain loop on `runtime` unless one is alive or the queue was discarded.
	///
	/// Must be called without the state lock held: a runtime that is shutting down drops the
	/// task, and with it the guard, on the spot.
	pub(super) fn start_drain(self: &Arc<Self>, runtime: &Handle) {
		let epoch = {
			let mut state = self.state.lock();

			if state.running || state.abandoned {
				return;
			}

			state.running = true;
			state.drain_epoch = state.drain_epoch.wrapping_add(1);

			state.drain_epoch
		};
		let guard = DrainGuard { queue: Arc::clone(self), epoch, started: false };

		runtime.spawn(async move {
			let mut guard = guard;

			guard.started = true;
			guard.queue.drain().await;
		});
	}

	async fn drain(&self) {
		tracing::debug!("request queue drain loop started");

		loop {
			let step = self.next_step();

			match step {
				Step::Exit => break,
				Step::Wait(delay) => {
					tracing::trace!(?delay, "request queue pacing");
					tokio::time::sleep(delay).await;
				},
				Step::Dispatch(item) =>
					if self.dispatch(item).await {
						tokio::time::sleep(self.dispatch_delay).await;
					},
			}
		}

		tracing::debug!("request queue drain loop stopped");
	}

	/// Decides the next move under the state lock; leaving the loop clears the running flag in
	/// the same critical section so a concurrent enqueue always sees a consistent flag.
	fn next_step(&self) -> Step {
		let mut state = self.state.lock();

		if state.abandoned || state.pending.is_empty() {
			state.running = false;

			return Step::Exit;
		}

		let now = OffsetDateTime::now_utc();

		state.roll_daily(now);

		if state.daily_count >= self.config.max_per_day {
			let until_reset = (state.next_reset - now).unsigned_abs();

			tracing::info!(next_reset = %state.next_reset, "daily request budget exhausted");

			return Step::Wait(until_reset);
		}
		if let Some(delay) = state.pacing_delay(self.min_interval, Instant::now()) {
			return Step::Wait(delay);
		}

		state.pending.sort_by_key(|item| item.priority);

		Step::Dispatch(state.pending.remove(0))
	}

	/// Runs one item; returns `false` when it was rejected without being started.
	async fn dispatch(&self, item: QueueItem) -> bool {
		const KIND: FlowKind = FlowKind::Dispatch;

		let QueueItem { id, priority, enqueued_at, timeout, endpoint, job } = item;
		let waited = enqueued_at.elapsed();

		if waited > timeout {
			tracing::debug!(id, ?waited, ?timeout, "queued request timed out before dispatch");
			job.reject(Rejection::WaitTimeout { waited, timeout });

			return false;
		}

		let span = FlowSpan::new(KIND, "dispatch");

		obs::record_flow_outcome(KIND, FlowOutcome::Attempt);
		tracing::debug!(
			id,
			?priority,
			endpoint = endpoint.as_deref(),
			"dispatching queued request"
		);

		let budget = timeout - waited;
		let settled = span.instrument(job.launch(budget, self.config.abort_on_timeout)).await;
		let mut state = self.state.lock();

		match settled {
			Settled::Success => {
				obs::record_flow_outcome(KIND, FlowOutcome::Success);

				state.daily_count = state.daily_count.saturating_add(1);
				state.last_dispatch = Some(Instant::now());
			},
			Settled::Failure { retry_after } => {
				obs::record_flow_outcome(KIND, FlowOutcome::Failure);

				if let Some(delay) = retry_after {
					let until = rate_limit::back_off_deadline(Instant::now(), delay);

					tracing::info!(
						id,
						?delay,
						endpoint = endpoint.as_deref(),
						"recording retry-after hint"
					);
					state.hints.insert(endpoint, until);
				}
			},
			Settled::TimedOut => {
				obs::record_flow_outcome(KIND, FlowOutcome::Failure);
				tracing::warn!(id, ?timeout, "queued request exceeded its execution budget");
			},
			Settled::Panicked => {
				obs::record_flow_outcome(KIND, FlowOutcome::Failure);
				tracing::warn!(id, "queued request panicked");
			},
		}

		true
	}
}

/// Start of the next UTC day after `now`.
pub(super) fn next_utc_midnight(now: OffsetDateTime) -> OffsetDateTime {
	let today = now.to_offset(time::UtcOffset::UTC).date();

	today.next_day().unwrap_or(today).midnight().assume_utc()
}
