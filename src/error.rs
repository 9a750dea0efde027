//! Crate-level error types shared by the token manager, stores, and callers.

// self
use crate::_prelude::*;

/// Crate-wide result type alias returning [`Error`] by default.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Shared, cloneable error source so every joiner of a refresh observes the same failure.
pub type SharedSource = Arc<dyn std::error::Error + Send + Sync>;

/// Canonical error exposed by public APIs.
#[derive(Debug, ThisError)]
pub enum Error {
	/// Storage-layer failure.
	#[error("{0}")]
	Storage(
		#[from]
		#[source]
		crate::store::StoreError,
	),
	/// Local configuration problem.
	#[error(transparent)]
	Config(#[from] ConfigError),
	/// Credential lifecycle failure.
	#[error(transparent)]
	Auth(#[from] AuthError),
	/// Upstream asked the caller to slow down.
	#[error(transparent)]
	RateLimited(#[from] crate::rate_limit::RateLimitError),
	/// API call failed after the request left the client.
	#[error(transparent)]
	Api(#[from] ApiError),
	/// The request scheduler settled the call without running it to completion.
	#[error(transparent)]
	Queue(Box<crate::queue::QueueError<Error>>),
	/// A background task was requested outside of a Tokio runtime.
	#[error("No Tokio runtime is available to drive background work.")]
	RuntimeUnavailable,
}
impl Error {
	/// Unwraps a scheduler outcome, surfacing operation failures as themselves.
	pub fn from_queue(e: crate::queue::QueueError<Error>) -> Self {
		match e {
			crate::queue::QueueError::Operation(e) => e,
			other => Self::Queue(Box::new(other)),
		}
	}

	/// Returns the [`AuthError`] carried by this error, if any.
	pub fn as_auth(&self) -> Option<&AuthError> {
		match self {
			Self::Auth(e) => Some(e),
			_ => None,
		}
	}
}

/// Credential lifecycle failures; always recoverable by retrying or re-authenticating.
///
/// The type is `Clone` because a single refresh outcome is fanned out to every caller that
/// joined the in-flight operation.
#[derive(Clone, Debug, ThisError)]
pub enum AuthError {
	/// Neither the manager nor its credential store hold a snapshot.
	#[error("No tokens available.")]
	NoTokens,
	/// Token endpoint answered with a non-success status.
	///
	/// Only the status line is kept; the response body never leaves the transport layer.
	#[error("Token refresh was rejected: {status} {reason}.")]
	Rejected {
		/// HTTP status code.
		status: u16,
		/// Canonical reason phrase for `status`.
		reason: String,
	},
	/// Transport failure (DNS, TCP, TLS) while calling the token endpoint.
	#[error("Network error occurred while refreshing the access token.")]
	Network {
		/// Transport-specific failure.
		#[source]
		source: SharedSource,
	},
	/// Token endpoint returned a success status with a body that could not be decoded.
	#[error("Token endpoint returned malformed JSON.")]
	MalformedResponse {
		/// HTTP status code of the response.
		status: u16,
		/// Structured parsing failure.
		#[source]
		source: Arc<serde_path_to_error::Error<serde_json::Error>>,
	},
	/// The task driving the refresh was cancelled or panicked before producing an outcome.
	#[error("Token refresh stopped before completing.")]
	Interrupted,
	/// Token endpoint returned a non-positive or out-of-range `expires_in`.
	#[error("The expires_in value {0} is not a usable lifetime.")]
	InvalidExpiresIn(i64),
}
impl AuthError {
	/// Wraps a transport-specific network error.
	pub fn network(src: impl 'static + Send + Sync + std::error::Error) -> Self {
		Self::Network { source: Arc::new(src) }
	}

	/// Builds a [`AuthError::Rejected`] from a raw status code.
	pub fn rejected(status: u16) -> Self {
		let reason = oauth2::http::StatusCode::from_u16(status)
			.ok()
			.and_then(|code| code.canonical_reason())
			.unwrap_or("Unknown Status")
			.to_owned();

		Self::Rejected { status, reason }
	}

	/// Returns the HTTP status attached to the failure, when one exists.
	pub fn status(&self) -> Option<u16> {
		match self {
			Self::Rejected { status, .. } | Self::MalformedResponse { status, .. } => Some(*status),
			_ => None,
		}
	}
}

/// Failures of authenticated API calls that are not rate limits.
#[derive(Debug, ThisError)]
pub enum ApiError {
	/// Non-success status other than 429; the response body is not retained.
	#[error("API request failed with status {status}.")]
	Status {
		/// HTTP status code.
		status: u16,
	},
	/// Transport failure (DNS, TCP, TLS) while calling the API.
	#[error("Network error occurred while calling the API.")]
	Network {
		/// Transport-specific failure.
		#[source]
		source: Box<dyn std::error::Error + Send + Sync>,
	},
	/// Success body could not be decoded into the requested type.
	#[error("API returned malformed JSON.")]
	Decode {
		/// HTTP status code of the response.
		status: u16,
		/// Structured parsing failure.
		#[source]
		source: serde_path_to_error::Error<serde_json::Error>,
	},
}
impl ApiError {
	/// Wraps a transport-specific network error.
	pub fn network(src: impl 'static + Send + Sync + std::error::Error) -> Self {
		Self::Network { source: Box::new(src) }
	}
}

/// Configuration and validation failures.
#[derive(Debug, ThisError)]
pub enum ConfigError {
	/// HTTP client could not be constructed.
	#[error("HTTP client could not be constructed.")]
	HttpClientBuild {
		/// Underlying transport builder failure.
		#[source]
		source: Box<dyn std::error::Error + Send + Sync>,
	},
	/// HTTP request construction failed.
	#[error(transparent)]
	HttpRequest(#[from] oauth2::http::Error),
	/// Token endpoint URL cannot be parsed.
	#[error("Token endpoint URL is invalid.")]
	InvalidTokenEndpoint {
		/// Underlying parsing failure.
		#[source]
		source: url::ParseError,
	},
	/// API base URL cannot be parsed or joined.
	#[error("API base URL is invalid.")]
	InvalidBaseUrl {
		/// Underlying parsing failure.
		#[source]
		source: url::ParseError,
	},
	/// OAuth client identifier is empty.
	#[error("Client identifier must not be empty.")]
	EmptyClientId,
	/// A scheduler budget was configured as zero.
	#[error("Queue budget `{field}` must be greater than zero.")]
	ZeroBudget {
		/// Offending configuration field.
		field: &'static str,
	},
	/// A duration option was negative.
	#[error("Duration `{field}` must not be negative.")]
	NegativeDuration {
		/// Offending configuration field.
		field: &'static str,
	},
}
impl ConfigError {
	/// Wraps a transport's builder failure inside [`ConfigError`].
	pub fn http_client_build(src: impl 'static + Send + Sync + std::error::Error) -> Self {
		Self::HttpClientBuild { source: Box::new(src) }
	}
}
#[cfg(feature = "reqwest")]
impl From<ReqwestError> for ConfigError {
	fn from(e: ReqwestError) -> Self {
		Self::http_client_build(e)
	}
}
