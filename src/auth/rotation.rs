//! Proactive rotation policy and the callback hooks it carries.

// self
use crate::{_prelude::*, auth::CredentialSnapshot};

/// Error type returned by user-supplied hooks.
pub type HookError = Box<dyn std::error::Error + Send + Sync>;

/// Boxed future returned by user-supplied hooks.
pub type HookFuture = Pin<Box<dyn Future<Output = Result<(), HookError>> + Send>>;

/// Callback invoked after a successful rotation with the previous and the new snapshot.
pub type RotationHook =
	Arc<dyn Fn(Option<CredentialSnapshot>, CredentialSnapshot) -> HookFuture + Send + Sync>;

/// Governs background refreshes that run before a token is strictly due.
///
/// Read-time refresh (the 60 second buffer in
/// [`TokenManager::access_token`](crate::manager::TokenManager::access_token)) is always on;
/// this policy only controls the additional proactive path.
#[derive(Clone)]
pub struct RotationPolicy {
	/// Whether proactive rotation is considered at all.
	pub enabled: bool,
	/// Rotate once the remaining lifetime drops to this window.
	pub threshold: Duration,
	/// Run the recurring check automatically while `enabled` is set.
	pub auto_schedule: bool,
	/// Period of the recurring check.
	pub check_interval: Duration,
	/// Best-effort hook fired after each rotation.
	pub on_rotation: Option<RotationHook>,
}
impl RotationPolicy {
	/// Default rotation window before expiry.
	pub const DEFAULT_THRESHOLD: Duration = Duration::minutes(15);
	/// Default period of the background check.
	pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::seconds(60);

	/// Returns an enabled policy with default threshold and interval, not auto-scheduled.
	pub fn enabled() -> Self {
		Self { enabled: true, ..Default::default() }
	}

	/// Overrides the rotation threshold; negative values clamp to zero.
	pub fn with_threshold(mut self, threshold: Duration) -> Self {
		self.threshold = if threshold.is_negative() { Duration::ZERO } else { threshold };

		self
	}

	/// Toggles the background scheduler.
	pub fn with_auto_schedule(mut self, auto_schedule: bool) -> Self {
		self.auto_schedule = auto_schedule;

		self
	}

	/// Overrides the check interval; non-positive values fall back to the default.
	pub fn with_check_interval(mut self, interval: Duration) -> Self {
		self.check_interval =
			if interval.is_positive() { interval } else { Self::DEFAULT_CHECK_INTERVAL };

		self
	}

	/// Installs the rotation hook.
	pub fn on_rotation<F, Fut>(mut self, hook: F) -> Self
	where
		F: 'static + Send + Sync + Fn(Option<CredentialSnapshot>, CredentialSnapshot) -> Fut,
		Fut: 'static + Send + Future<Output = Result<(), HookError>>,
	{
		self.on_rotation = Some(Arc::new(move |old, new| Box::pin(hook(old, new))));

		self
	}

	/// Returns `true` when the background scheduler should be running under this policy.
	pub fn wants_scheduler(&self) -> bool {
		self.enabled && self.auto_schedule
	}

	/// Returns `true` when `snapshot` is inside the rotation window at `now`.
	pub fn is_due(&self, snapshot: &CredentialSnapshot, now: OffsetDateTime) -> bool {
		self.enabled && snapshot.expires_within(self.threshold, now)
	}
}
impl Default for RotationPolicy {
	fn default() -> Self {
		Self {
			enabled: false,
			threshold: Self::DEFAULT_THRESHOLD,
			auto_schedule: false,
			check_interval: Self::DEFAULT_CHECK_INTERVAL,
			on_rotation: None,
		}
	}
}
impl Debug for RotationPolicy {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("RotationPolicy")
			.field("enabled", &self.enabled)
			.field("threshold", &self.threshold)
			.field("auto_schedule", &self.auto_schedule)
			.field("check_interval", &self.check_interval)
			.field("on_rotation_set", &self.on_rotation.is_some())
			.finish()
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn disabled_policy_is_never_due() {
		let now = OffsetDateTime::now_utc();
		let snapshot = CredentialSnapshot::new("at", "rt", now);

		assert!(!RotationPolicy::default().is_due(&snapshot, now));
		assert!(RotationPolicy::enabled().is_due(&snapshot, now));
	}

	#[test]
	fn threshold_boundary_counts_as_due() {
		let now = OffsetDateTime::now_utc();
		let policy = RotationPolicy::enabled().with_threshold(Duration::minutes(10));
		let at_edge = CredentialSnapshot::new("at", "rt", now + Duration::minutes(10));
		let outside = CredentialSnapshot::new("at", "rt", now + Duration::minutes(11));

		assert!(policy.is_due(&at_edge, now));
		assert!(!policy.is_due(&outside, now));
	}

	#[test]
	fn scheduler_requires_enabled_and_auto_schedule() {
		assert!(!RotationPolicy::default().with_auto_schedule(true).wants_scheduler());
		assert!(!RotationPolicy::enabled().wants_scheduler());
		assert!(RotationPolicy::enabled().with_auto_schedule(true).wants_scheduler());
	}

	#[test]
	fn non_positive_interval_falls_back_to_default() {
		let policy = RotationPolicy::enabled().with_check_interval(Duration::ZERO);

		assert_eq!(policy.check_interval, RotationPolicy::DEFAULT_CHECK_INTERVAL);
	}
}
