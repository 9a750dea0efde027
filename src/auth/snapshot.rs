//! Credential snapshot model and its expiry arithmetic.

// crates.io
use time::format_description::well_known::Rfc3339;
// self
use crate::{_prelude::*, auth::TokenSecret};

/// Token type assumed when the provider omits `token_type`.
pub const DEFAULT_TOKEN_TYPE: &str = "Bearer";

/// Point-in-time view of the credentials held by a [`TokenManager`](crate::manager::TokenManager).
///
/// Snapshots are plain values: the manager hands out clones and replaces its own copy
/// wholesale after every refresh, so a caller never observes a half-updated record.
///
/// `expires_at` serializes as an RFC 3339 string. An unparseable value deserializes to
/// [`OffsetDateTime::UNIX_EPOCH`], i.e. the snapshot is treated as already expired.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialSnapshot {
	/// Bearer token attached to API calls.
	pub access_token: TokenSecret,
	/// Refresh token exchanged for the next access token.
	pub refresh_token: TokenSecret,
	/// Instant after which the access token is no longer accepted.
	#[serde(with = "expiry")]
	pub expires_at: OffsetDateTime,
	/// Authorization scheme, usually `Bearer`.
	pub token_type: String,
	/// Space-delimited scopes granted to the token.
	#[serde(default)]
	pub scope: String,
}
impl CredentialSnapshot {
	/// Creates a `Bearer` snapshot with an empty scope.
	pub fn new(
		access_token: impl Into<TokenSecret>,
		refresh_token: impl Into<TokenSecret>,
		expires_at: OffsetDateTime,
	) -> Self {
		Self {
			access_token: access_token.into(),
			refresh_token: refresh_token.into(),
			expires_at,
			token_type: DEFAULT_TOKEN_TYPE.into(),
			scope: String::new(),
		}
	}

	/// Creates a snapshot from an ISO-8601 expiry string, applying [`parse_expiry`].
	pub fn with_expiry_str(
		access_token: impl Into<TokenSecret>,
		refresh_token: impl Into<TokenSecret>,
		expires_at: &str,
	) -> Self {
		Self::new(access_token, refresh_token, parse_expiry(expires_at))
	}

	/// Overrides the token type.
	pub fn with_token_type(mut self, token_type: impl Into<String>) -> Self {
		self.token_type = token_type.into();

		self
	}

	/// Overrides the granted scope string.
	pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
		self.scope = scope.into();

		self
	}

	/// Time left until expiry; negative once expired.
	pub fn remaining_at(&self, now: OffsetDateTime) -> Duration {
		self.expires_at - now
	}

	/// Returns `true` once `now` reaches the expiry instant.
	pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
		now >= self.expires_at
	}

	/// Returns `true` when the token expires within `window` of `now` (inclusive).
	pub fn expires_within(&self, window: Duration, now: OffsetDateTime) -> bool {
		self.remaining_at(now) <= window
	}

	/// Formats the `Authorization` header value for this snapshot.
	pub fn authorization_value(&self) -> String {
		format!("{} {}", self.token_type, self.access_token.expose())
	}
}
impl Debug for CredentialSnapshot {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("CredentialSnapshot")
			.field("access_token", &"<redacted>")
			.field("refresh_token", &"<redacted>")
			.field("expires_at", &self.expires_at)
			.field("token_type", &self.token_type)
			.field("scope", &self.scope)
			.finish()
	}
}

/// Parses an ISO-8601 (RFC 3339) expiry.
///
/// Anything unparseable maps to [`OffsetDateTime::UNIX_EPOCH`] so the snapshot reads as
/// expired and the next token request refreshes it.
pub fn parse_expiry(raw: &str) -> OffsetDateTime {
	match OffsetDateTime::parse(raw.trim(), &Rfc3339) {
		Ok(instant) => instant,
		Err(e) => {
			tracing::warn!(error = %e, "unparseable token expiry; treating snapshot as expired");

			OffsetDateTime::UNIX_EPOCH
		},
	}
}

/// Formats an expiry as RFC 3339, falling back to the Unix epoch string for instants the
/// format cannot express.
pub fn format_expiry(instant: OffsetDateTime) -> String {
	instant.format(&Rfc3339).unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}

mod expiry {
	// crates.io
	use serde::{Deserializer, Serializer};
	// self
	use super::*;

	pub(super) fn serialize<S>(instant: &OffsetDateTime, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_str(&format_expiry(*instant))
	}

	pub(super) fn deserialize<'de, D>(deserializer: D) -> Result<OffsetDateTime, D::Error>
	where
		D: Deserializer<'de>,
	{
		let raw = String::deserialize(deserializer)?;

		Ok(parse_expiry(&raw))
	}
}

#[cfg(test)]
mod tests {
	// crates.io
	use time::macros;
	// self
	use super::*;

	#[test]
	fn expiry_window_is_inclusive() {
		let now = macros::datetime!(2025-06-01 12:00 UTC);
		let snapshot = CredentialSnapshot::new("at", "rt", now + Duration::seconds(60));

		assert!(snapshot.expires_within(Duration::seconds(60), now));
		assert!(!snapshot.expires_within(Duration::seconds(59), now));
		assert!(!snapshot.is_expired_at(now));
		assert!(snapshot.is_expired_at(now + Duration::seconds(60)));
	}

	#[test]
	fn unparseable_expiry_reads_as_expired() {
		let snapshot = CredentialSnapshot::with_expiry_str("at", "rt", "not-a-date");

		assert_eq!(snapshot.expires_at, OffsetDateTime::UNIX_EPOCH);
		assert!(snapshot.is_expired_at(OffsetDateTime::now_utc()));
	}

	#[test]
	fn serialized_expiry_is_rfc3339() {
		let snapshot = CredentialSnapshot::new("at", "rt", macros::datetime!(2025-06-01 12:00 UTC))
			.with_scope("read write");
		let json = serde_json::to_value(&snapshot).expect("Snapshot should serialize to JSON.");

		assert_eq!(json["expires_at"], "2025-06-01T12:00:00Z");
		assert_eq!(json["token_type"], "Bearer");

		let back: CredentialSnapshot =
			serde_json::from_value(json).expect("Snapshot JSON should deserialize.");

		assert_eq!(back, snapshot);
	}

	#[test]
	fn debug_output_is_redacted() {
		let snapshot =
			CredentialSnapshot::new("at-secret", "rt-secret", OffsetDateTime::UNIX_EPOCH);
		let rendered = format!("{snapshot:?}");

		assert!(!rendered.contains("at-secret"));
		assert!(!rendered.contains("rt-secret"));
	}
}
