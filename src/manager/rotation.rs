//! Proactive rotation: refreshing ahead of the read-time buffer, optionally on a timer.

// std
use std::sync::Weak;
// crates.io
use tokio::{
	runtime::Handle,
	time::{Instant, MissedTickBehavior},
};
// self
use crate::{
	_prelude::*,
	auth::{CredentialSnapshot, RotationPolicy},
	http::TokenHttpClient,
	manager::{Inner, TokenManager},
	obs::{self, FlowKind, FlowOutcome, FlowSpan},
};

impl<C> TokenManager<C>
where
	C: ?Sized + TokenHttpClient,
{
	/// Returns a copy of the active rotation policy.
	pub fn rotation_policy(&self) -> RotationPolicy {
		self.inner.rotation.read().clone()
	}

	/// Replaces the rotation policy and starts or stops the background scheduler to match it.
	///
	/// A running scheduler is restarted when the check interval changes.
	pub fn set_rotation_policy(&self, policy: RotationPolicy) -> Result<()> {
		let wants_scheduler = policy.wants_scheduler();
		let interval_changed = {
			let mut current = self.inner.rotation.write();
			let changed = current.check_interval != policy.check_interval;

			*current = policy;

			changed
		};

		if !wants_scheduler {
			self.stop_rotation_scheduler();

			return Ok(());
		}
		if interval_changed {
			self.stop_rotation_scheduler();
		}

		self.start_rotation_scheduler()
	}

	/// Returns `true` when rotation is enabled and the token is inside the rotation threshold.
	///
	/// Always `false` without a loaded snapshot; there is nothing to rotate.
	pub fn needs_proactive_rotation(&self) -> bool {
		let policy = self.inner.rotation.read();

		self.inner
			.snapshot
			.read()
			.as_ref()
			.is_some_and(|snapshot| policy.is_due(snapshot, OffsetDateTime::now_utc()))
	}

	/// Refreshes unconditionally, then notifies the rotation hook.
	///
	/// Hook failures are logged and never change the result. Rotation shares the single-flight
	/// refresh, so a rotation racing a read-time refresh issues one exchange.
	pub async fn rotate_token(&self) -> Result<CredentialSnapshot> {
		const KIND: FlowKind = FlowKind::Rotation;

		let span = FlowSpan::new(KIND, "rotate_token");
		let previous = self.current_tokens();

		obs::record_flow_outcome(KIND, FlowOutcome::Attempt);

		let next = match span.instrument(self.refresh_token()).await {
			Ok(next) => next,
			Err(e) => {
				obs::record_flow_outcome(KIND, FlowOutcome::Failure);

				return Err(e);
			},
		};

		obs::record_flow_outcome(KIND, FlowOutcome::Success);

		let hook = self.inner.rotation.read().on_rotation.clone();

		if let Some(hook) = hook
			&& let Err(e) = span.instrument(hook(previous, next.clone())).await
		{
			tracing::warn!(error = %e, "rotation hook failed");
		}

		Ok(next)
	}

	/// Starts the background rotation check; a no-op when it is already running.
	///
	/// The task only holds a weak reference to the manager and stops on its own once the last
	/// clone is dropped.
	pub fn start_rotation_scheduler(&self) -> Result<()> {
		let mut slot = self.inner.rotation_task.lock();

		if slot.as_ref().is_some_and(|task| !task.is_finished()) {
			return Ok(());
		}

		let runtime = Handle::try_current().map_err(|_| Error::RuntimeUnavailable)?;
		let period = self.inner.rotation.read().check_interval.unsigned_abs();
		let weak = Arc::downgrade(&self.inner);

		tracing::debug!(?period, "starting token rotation scheduler");

		*slot = Some(runtime.spawn(run_scheduler(weak, period)));

		Ok(())
	}

	/// Stops the background rotation check; a no-op when it is not running.
	pub fn stop_rotation_scheduler(&self) {
		if let Some(task) = self.inner.rotation_task.lock().take() {
			task.abort();
			tracing::debug!("stopped token rotation scheduler");
		}
	}

	/// Returns `true` while the background rotation check is alive.
	pub fn is_rotation_scheduler_running(&self) -> bool {
		self.inner.rotation_task.lock().as_ref().is_some_and(|task| !task.is_finished())
	}
}

async fn run_scheduler<C>(weak: Weak<Inner<C>>, period: std::time::Duration)
where
	C: ?Sized + TokenHttpClient,
{
	let mut ticker = tokio::time::interval_at(Instant::now() + period, period);

	ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

	loop {
		ticker.tick().await;

		let Some(inner) = weak.upgrade() else {
			break;
		};
		let manager = TokenManager { inner };

		if !manager.needs_proactive_rotation() {
			continue;
		}
		if let Err(e) = manager.rotate_token().await {
			tracing::warn!(error = %e, "scheduled token rotation failed");
		}
	}
}
