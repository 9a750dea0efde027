// std
use std::time::Duration as StdDuration;
// self
use crate::{_prelude::*, error::ConfigError};

/// Budgets and timing knobs for a [`RequestQueue`](crate::queue::RequestQueue).
///
/// Deserializes from flat maps such as
/// `{"max_per_day":5000,"max_per_second":2,"dispatch_delay_ms":10,"default_timeout_ms":30000}`;
/// omitted fields keep their defaults.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
	/// Successful dispatches allowed per UTC day.
	pub max_per_day: u32,
	/// Dispatches allowed per second; sets the minimum spacing between dispatches.
	pub max_per_second: u32,
	/// Fixed pause after every dispatch.
	#[serde(rename = "dispatch_delay_ms", with = "millis")]
	pub dispatch_delay: Duration,
	/// Timeout applied when [`EnqueueOptions`](crate::queue::EnqueueOptions) does not set one.
	#[serde(rename = "default_timeout_ms", with = "millis")]
	pub default_timeout: Duration,
	/// Abort the spawned operation when its execution budget runs out instead of letting it
	/// finish in the background.
	pub abort_on_timeout: bool,
}
impl QueueConfig {
	/// Default daily budget.
	pub const DEFAULT_MAX_PER_DAY: u32 = 10_000;
	/// Default per-second budget.
	pub const DEFAULT_MAX_PER_SECOND: u32 = 10;
	/// Default pause after each dispatch.
	pub const DEFAULT_DISPATCH_DELAY: Duration = Duration::milliseconds(10);
	/// Default per-item timeout.
	pub const DEFAULT_TIMEOUT: Duration = Duration::seconds(30);

	/// Overrides the daily budget.
	pub fn with_max_per_day(mut self, max_per_day: u32) -> Self {
		self.max_per_day = max_per_day;

		self
	}

	/// Overrides the per-second budget.
	pub fn with_max_per_second(mut self, max_per_second: u32) -> Self {
		self.max_per_second = max_per_second;

		self
	}

	/// Overrides the pause after each dispatch.
	pub fn with_dispatch_delay(mut self, dispatch_delay: Duration) -> Self {
		self.dispatch_delay = dispatch_delay;

		self
	}

	/// Overrides the default per-item timeout.
	pub fn with_default_timeout(mut self, default_timeout: Duration) -> Self {
		self.default_timeout = default_timeout;

		self
	}

	/// Toggles aborting operations that overrun their execution budget.
	pub fn with_abort_on_timeout(mut self, abort_on_timeout: bool) -> Self {
		self.abort_on_timeout = abort_on_timeout;

		self
	}

	/// Rejects zero budgets and negative durations.
	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.max_per_day == 0 {
			return Err(ConfigError::ZeroBudget { field: "max_per_day" });
		}
		if self.max_per_second == 0 {
			return Err(ConfigError::ZeroBudget { field: "max_per_second" });
		}
		if self.dispatch_delay.is_negative() {
			return Err(ConfigError::NegativeDuration { field: "dispatch_delay" });
		}
		if self.default_timeout.is_negative() {
			return Err(ConfigError::NegativeDuration { field: "default_timeout" });
		}

		Ok(())
	}

	pub(super) fn min_interval(&self) -> StdDuration {
		StdDuration::from_secs(1) / self.max_per_second.max(1)
	}
}
impl Default for QueueConfig {
	fn default() -> Self {
		Self {
			max_per_day: Self::DEFAULT_MAX_PER_DAY,
			max_per_second: Self::DEFAULT_MAX_PER_SECOND,
			dispatch_delay: Self::DEFAULT_DISPATCH_DELAY,
			default_timeout: Self::DEFAULT_TIMEOUT,
			abort_on_timeout: false,
		}
	}
}

mod millis {
	// crates.io
	use serde::{Deserializer, Serializer};
	// self
	use crate::_prelude::*;

	pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		let millis = i64::try_from(value.whole_milliseconds()).unwrap_or(i64::MAX);

		serializer.serialize_i64(millis)
	}

	pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
	where
		D: Deserializer<'de>,
	{
		i64::deserialize(deserializer).map(Duration::milliseconds)
	}
}
