//! Token lifecycle manager: hands out currently-valid access tokens and hides refresh and
//! rotation mechanics from callers.
//!
//! A [`TokenManager`] owns exactly one authoritative [`CredentialSnapshot`]. Reads go through
//! [`TokenManager::access_token`], which refreshes once the token is within
//! [`REFRESH_BUFFER`] of expiry. Refreshes are single-flight: concurrent callers join the
//! in-flight exchange and all observe the same outcome, whether it succeeded or failed.

mod metrics;
mod refresh;
mod rotation;

pub use metrics::RefreshMetrics;

// std
use std::sync::atomic::AtomicU64;
// crates.io
use tokio::task::JoinHandle;
// self
use crate::{
	_prelude::*,
	auth::{CredentialSnapshot, HookError, HookFuture, RotationPolicy},
	error::{AuthError, ConfigError},
	http::TokenHttpClient,
	store::CredentialStore,
};
#[cfg(feature = "reqwest")] use crate::http::ReqwestHttpClient;

/// Read-time refresh window: a token this close to expiry is refreshed before it is returned.
pub const REFRESH_BUFFER: Duration = Duration::seconds(60);
/// Default window used by [`TokenManager::will_expire_soon`].
pub const DEFAULT_EXPIRY_THRESHOLD: Duration = Duration::minutes(5);

/// Callback invoked with `(access_token, refresh_token, expires_at)` after each refresh.
pub type SaveHook = Arc<dyn Fn(String, String, OffsetDateTime) -> HookFuture + Send + Sync>;

#[cfg(feature = "reqwest")]
/// Manager specialized for the crate's default reqwest transport.
pub type ReqwestTokenManager = TokenManager<ReqwestHttpClient>;

/// Owns the credential snapshot and coordinates refreshes against the token endpoint.
///
/// Clones share state; the background rotation task (if any) stops once the last clone is
/// dropped.
pub struct TokenManager<C>
where
	C: ?Sized + TokenHttpClient,
{
	inner: Arc<Inner<C>>,
}
impl<C> TokenManager<C>
where
	C: ?Sized + TokenHttpClient,
{
	/// Starts a builder that reuses the caller-provided transport.
	pub fn with_http_client(
		client_id: impl Into<String>,
		token_endpoint: impl Into<String>,
		http_client: impl Into<Arc<C>>,
	) -> TokenManagerBuilder<C> {
		TokenManagerBuilder {
			client_id: client_id.into(),
			token_endpoint: token_endpoint.into(),
			http_client: http_client.into(),
			store: None,
			on_save: None,
			tokens: None,
			rotation: RotationPolicy::default(),
		}
	}

	/// Returns a currently-valid access token.
	///
	/// Hydrates from the credential store when no snapshot is loaded, and refreshes first when
	/// the token expires within [`REFRESH_BUFFER`] (inclusive).
	pub async fn access_token(&self) -> Result<String> {
		let snapshot = self.inner.load_snapshot().await.ok_or(AuthError::NoTokens)?;

		if snapshot.expires_within(REFRESH_BUFFER, OffsetDateTime::now_utc()) {
			tracing::debug!(expires_at = %snapshot.expires_at, "access token inside refresh window");

			let fresh = self.refresh_token().await?;

			return Ok(fresh.access_token.expose().to_owned());
		}

		Ok(snapshot.access_token.expose().to_owned())
	}

	/// Replaces the snapshot without contacting the provider.
	pub fn update_tokens(&self, snapshot: CredentialSnapshot) {
		*self.inner.snapshot.write() = Some(snapshot);
	}

	/// Returns a copy of the current snapshot.
	pub fn current_tokens(&self) -> Option<CredentialSnapshot> {
		self.inner.snapshot.read().clone()
	}

	/// Returns `true` when the token has expired or no snapshot is loaded.
	pub fn is_token_expired(&self) -> bool {
		self.inner
			.snapshot
			.read()
			.as_ref()
			.is_none_or(|snapshot| snapshot.is_expired_at(OffsetDateTime::now_utc()))
	}

	/// Returns `true` when the token expires within [`DEFAULT_EXPIRY_THRESHOLD`] or no snapshot
	/// is loaded.
	pub fn will_expire_soon(&self) -> bool {
		self.will_expire_within(DEFAULT_EXPIRY_THRESHOLD)
	}

	/// Returns `true` when the token expires within `threshold` or no snapshot is loaded.
	pub fn will_expire_within(&self, threshold: Duration) -> bool {
		self.inner
			.snapshot
			.read()
			.as_ref()
			.is_none_or(|snapshot| snapshot.expires_within(threshold, OffsetDateTime::now_utc()))
	}

	/// Drops the snapshot and clears the credential store.
	pub async fn clear_tokens(&self) -> Result<()> {
		self.inner.snapshot.write().take();

		if let Some(store) = &self.inner.store {
			store.clear().await?;
		}

		Ok(())
	}

	/// Counters for physical refresh attempts.
	pub fn metrics(&self) -> &RefreshMetrics {
		&self.inner.metrics
	}

	/// OAuth client identifier sent with every refresh.
	pub fn client_id(&self) -> &str {
		&self.inner.client_id
	}
}
#[cfg(feature = "reqwest")]
impl TokenManager<ReqwestHttpClient> {
	/// Starts a builder backed by a default reqwest client.
	pub fn builder(
		client_id: impl Into<String>,
		token_endpoint: impl Into<String>,
	) -> TokenManagerBuilder<ReqwestHttpClient> {
		Self::with_http_client(client_id, token_endpoint, ReqwestHttpClient::default())
	}
}
impl<C> Clone for TokenManager<C>
where
	C: ?Sized + TokenHttpClient,
{
	fn clone(&self) -> Self {
		Self { inner: Arc::clone(&self.inner) }
	}
}
impl<C> Debug for TokenManager<C>
where
	C: ?Sized + TokenHttpClient,
{
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("TokenManager")
			.field("client_id", &self.inner.client_id)
			.field("token_endpoint", &self.inner.token_endpoint.as_str())
			.field("has_tokens", &self.inner.snapshot.read().is_some())
			.field("store_set", &self.inner.store.is_some())
			.field("rotation", &*self.inner.rotation.read())
			.finish()
	}
}

/// Configures and validates a [`TokenManager`].
pub struct TokenManagerBuilder<C>
where
	C: ?Sized + TokenHttpClient,
{
	client_id: String,
	token_endpoint: String,
	http_client: Arc<C>,
	store: Option<Arc<dyn CredentialStore>>,
	on_save: Option<SaveHook>,
	tokens: Option<CredentialSnapshot>,
	rotation: RotationPolicy,
}
impl<C> TokenManagerBuilder<C>
where
	C: ?Sized + TokenHttpClient,
{
	/// Replaces the transport.
	pub fn http_client(mut self, http_client: impl Into<Arc<C>>) -> Self {
		self.http_client = http_client.into();

		self
	}

	/// Attaches a credential store used for hydration and persistence.
	pub fn store(mut self, store: Arc<dyn CredentialStore>) -> Self {
		self.store = Some(store);

		self
	}

	/// Seeds the manager with an initial snapshot.
	pub fn tokens(mut self, snapshot: CredentialSnapshot) -> Self {
		self.tokens = Some(snapshot);

		self
	}

	/// Installs a hook invoked after every successful refresh.
	pub fn on_save<F, Fut>(mut self, hook: F) -> Self
	where
		F: 'static + Send + Sync + Fn(String, String, OffsetDateTime) -> Fut,
		Fut: 'static + Send + Future<Output = Result<(), HookError>>,
	{
		self.on_save = Some(Arc::new(move |access, refresh, expires_at| {
			Box::pin(hook(access, refresh, expires_at))
		}));

		self
	}

	/// Sets the proactive rotation policy.
	pub fn rotation(mut self, policy: RotationPolicy) -> Self {
		self.rotation = policy;

		self
	}

	/// Validates the configuration and builds the manager.
	///
	/// When the rotation policy asks for automatic scheduling the background task is started
	/// here, which requires a Tokio runtime.
	pub fn build(self) -> Result<TokenManager<C>> {
		if self.client_id.trim().is_empty() {
			return Err(ConfigError::EmptyClientId.into());
		}

		let token_endpoint = Url::parse(&self.token_endpoint)
			.map_err(|source| ConfigError::InvalidTokenEndpoint { source })?;
		let wants_scheduler = self.rotation.wants_scheduler();
		let manager = TokenManager {
			inner: Arc::new(Inner {
				http_client: self.http_client,
				client_id: self.client_id,
				token_endpoint,
				store: self.store,
				on_save: self.on_save,
				snapshot: RwLock::new(self.tokens),
				in_flight: Mutex::new(None),
				next_flight: AtomicU64::new(0),
				rotation: RwLock::new(self.rotation),
				rotation_task: Mutex::new(None),
				metrics: RefreshMetrics::default(),
			}),
		};

		if wants_scheduler {
			manager.start_rotation_scheduler()?;
		}

		Ok(manager)
	}
}
impl<C> Debug for TokenManagerBuilder<C>
where
	C: ?Sized + TokenHttpClient,
{
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("TokenManagerBuilder")
			.field("client_id", &self.client_id)
			.field("token_endpoint", &self.token_endpoint)
			.field("tokens_set", &self.tokens.is_some())
			.field("rotation", &self.rotation)
			.finish()
	}
}

struct Inner<C>
where
	C: ?Sized + TokenHttpClient,
{
	http_client: Arc<C>,
	client_id: String,
	token_endpoint: Url,
	store: Option<Arc<dyn CredentialStore>>,
	on_save: Option<SaveHook>,
	snapshot: RwLock<Option<CredentialSnapshot>>,
	in_flight: Mutex<Option<refresh::InFlight>>,
	next_flight: AtomicU64,
	rotation: RwLock<RotationPolicy>,
	rotation_task: Mutex<Option<JoinHandle<()>>>,
	metrics: RefreshMetrics,
}
impl<C> Inner<C>
where
	C: ?Sized + TokenHttpClient,
{
	/// Returns the live snapshot, hydrating it from the store when none is loaded.
	async fn load_snapshot(&self) -> Option<CredentialSnapshot> {
		let current = self.snapshot.read().clone();

		if current.is_some() {
			return current;
		}

		let store = self.store.as_ref()?;
		let loaded = match store.load().await {
			Ok(loaded) => loaded?,
			Err(e) => {
				tracing::warn!(error = %e, "failed to hydrate tokens from the credential store");

				return None;
			},
		};
		let mut slot = self.snapshot.write();

		// A refresh or manual update may have landed while the store was loading.
		Some(slot.get_or_insert(loaded).clone())
	}
}
impl<C> Drop for Inner<C>
where
	C: ?Sized + TokenHttpClient,
{
	fn drop(&mut self) {
		if let Some(task) = self.rotation_task.get_mut().take() {
			task.abort();
		}
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;
	use crate::{http::ResponseMetadataSlot, store::MemoryStore};

	struct NoNetwork;
	impl TokenHttpClient for NoNetwork {
		type Handle = NoNetworkHandle;
		type TransportError = std::io::Error;

		fn with_metadata(&self, _slot: ResponseMetadataSlot) -> Self::Handle {
			NoNetworkHandle
		}
	}

	struct NoNetworkHandle;
	impl<'c> oauth2::AsyncHttpClient<'c> for NoNetworkHandle {
		type Error = oauth2::HttpClientError<std::io::Error>;
		type Future = Pin<
			Box<dyn Future<Output = Result<oauth2::HttpResponse, Self::Error>> + 'c + Send + Sync>,
		>;

		fn call(&'c self, _request: oauth2::HttpRequest) -> Self::Future {
			Box::pin(async { Err(oauth2::HttpClientError::Io(std::io::Error::other("offline"))) })
		}
	}

	fn builder() -> TokenManagerBuilder<NoNetwork> {
		TokenManager::with_http_client("client", "https://auth.example.com/token", NoNetwork)
	}

	#[test]
	fn builder_rejects_empty_client_id_and_bad_endpoint() {
		let err = TokenManager::with_http_client(" ", "https://auth.example.com/token", NoNetwork)
			.build()
			.expect_err("Blank client id should be rejected.");

		assert!(matches!(err, Error::Config(ConfigError::EmptyClientId)));

		let err = TokenManager::with_http_client("client", "not a url", NoNetwork)
			.build()
			.expect_err("Unparseable endpoint should be rejected.");

		assert!(matches!(err, Error::Config(ConfigError::InvalidTokenEndpoint { .. })));
	}

	#[test]
	fn predicates_treat_missing_tokens_as_expired() {
		let manager = builder().build().expect("Manager should build.");

		assert!(manager.is_token_expired());
		assert!(manager.will_expire_soon());
		assert!(manager.current_tokens().is_none());
	}

	#[test]
	fn expiry_predicates_follow_the_snapshot() {
		let now = OffsetDateTime::now_utc();
		let manager = builder()
			.tokens(CredentialSnapshot::new("at", "rt", now + Duration::minutes(10)))
			.build()
			.expect("Manager should build.");

		assert!(!manager.is_token_expired());
		assert!(!manager.will_expire_soon());
		assert!(manager.will_expire_within(Duration::minutes(15)));

		manager.update_tokens(CredentialSnapshot::new("at", "rt", now - Duration::seconds(1)));

		assert!(manager.is_token_expired());
	}

	#[test]
	fn current_tokens_returns_a_detached_copy() {
		let manager = builder()
			.tokens(CredentialSnapshot::new("at", "rt", OffsetDateTime::now_utc()))
			.build()
			.expect("Manager should build.");
		let mut copy = manager.current_tokens().expect("Seeded snapshot should be present.");

		copy.access_token = "tampered".into();

		assert_eq!(
			manager.current_tokens().map(|s| s.access_token.expose().to_owned()).as_deref(),
			Some("at"),
		);
	}

	#[tokio::test]
	async fn access_token_without_tokens_fails_with_no_tokens() {
		let manager = builder().build().expect("Manager should build.");
		let err = manager.access_token().await.expect_err("Empty manager should fail.");

		assert!(matches!(err, Error::Auth(AuthError::NoTokens)));
		assert_eq!(err.to_string(), "No tokens available.");
	}

	#[tokio::test]
	async fn access_token_hydrates_from_the_store() {
		let stored = CredentialSnapshot::new(
			"stored-at",
			"stored-rt",
			OffsetDateTime::now_utc() + Duration::hours(1),
		);
		let store = Arc::new(MemoryStore::with_snapshot(stored));
		let manager = builder().store(store).build().expect("Manager should build.");
		let token = manager.access_token().await.expect("Stored token should be returned.");

		assert_eq!(token, "stored-at");
		assert!(manager.current_tokens().is_some());
		assert_eq!(manager.metrics().attempts(), 0);
	}

	#[tokio::test]
	async fn clear_tokens_empties_manager_and_store() {
		let store = Arc::new(MemoryStore::with_snapshot(CredentialSnapshot::new(
			"at",
			"rt",
			OffsetDateTime::now_utc() + Duration::hours(1),
		)));
		let manager = builder().store(store.clone()).build().expect("Manager should build.");

		manager.access_token().await.expect("Hydration should succeed.");
		manager.clear_tokens().await.expect("Clearing should succeed.");

		assert!(manager.current_tokens().is_none());
		assert!(store.peek().is_none());
	}
}
