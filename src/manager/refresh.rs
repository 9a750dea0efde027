//! Single-flight refresh against the token endpoint.
//!
//! The in-flight marker holds a [`Shared`] future. The first caller creates it and spawns the
//! exchange on the current Tokio runtime, so the refresh always runs to completion even when
//! every waiting caller is dropped; later callers clone the same future and therefore observe
//! the identical outcome. A drop guard inside the exchange clears the marker whatever the
//! result, so the next call after a failure starts a fresh attempt.

// std
use std::sync::atomic::Ordering;
// crates.io
use futures::future::{BoxFuture, FutureExt, Shared};
use oauth2::{
	AsyncHttpClient, HttpRequest,
	http::{
		Method, Request,
		header::{ACCEPT, CONTENT_TYPE},
	},
};
use tokio::runtime::Handle;
use url::form_urlencoded;
// self
use crate::{
	_prelude::*,
	auth::{CredentialSnapshot, DEFAULT_TOKEN_TYPE},
	error::AuthError,
	http::{ResponseMetadataSlot, TokenHttpClient},
	manager::{Inner, TokenManager},
	obs::{self, FlowKind, FlowOutcome, FlowSpan},
};

type RefreshOutcome = Result<CredentialSnapshot, AuthError>;
type SharedRefresh = Shared<BoxFuture<'static, RefreshOutcome>>;

/// The refresh currently in progress for one manager.
pub(super) struct InFlight {
	id: u64,
	outcome: SharedRefresh,
}

impl<C> TokenManager<C>
where
	C: ?Sized + TokenHttpClient,
{
	/// Exchanges the refresh token for a new snapshot.
	///
	/// When a refresh is already in flight the caller joins it instead of issuing a second
	/// request. Failures are never retried here; the next call starts a new attempt.
	pub async fn refresh_token(&self) -> Result<CredentialSnapshot> {
		Ok(self.join_or_start_refresh().await?)
	}

	fn join_or_start_refresh(&self) -> SharedRefresh {
		let mut slot = self.inner.in_flight.lock();

		if let Some(flight) = slot.as_ref() {
			self.inner.metrics.record_join();
			tracing::debug!(flight = flight.id, "joining in-flight token refresh");

			return flight.outcome.clone();
		}

		let id = self.inner.next_flight.fetch_add(1, Ordering::Relaxed);
		let inner = Arc::clone(&self.inner);
		let work = async move {
			let _marker = ClearInFlight { inner: &inner, id };

			inner.perform_refresh().await
		};
		let outcome = match Handle::try_current() {
			Ok(runtime) => {
				let task = runtime.spawn(work);

				async move { task.await.unwrap_or(Err(AuthError::Interrupted)) }.boxed()
			},
			Err(_) => work.boxed(),
		}
		.shared();

		*slot = Some(InFlight { id, outcome: outcome.clone() });

		outcome
	}
}

/// Clears the in-flight marker once the exchange that owns it finishes.
struct ClearInFlight<'a, C>
where
	C: ?Sized + TokenHttpClient,
{
	inner: &'a Inner<C>,
	id: u64,
}
impl<C> Drop for ClearInFlight<'_, C>
where
	C: ?Sized + TokenHttpClient,
{
	fn drop(&mut self) {
		let finished = {
			let mut slot = self.inner.in_flight.lock();

			slot.take_if(|flight| flight.id == self.id)
		};

		drop(finished);
	}
}

impl<C> Inner<C>
where
	C: ?Sized + TokenHttpClient,
{
	async fn perform_refresh(&self) -> RefreshOutcome {
		const KIND: FlowKind = FlowKind::Refresh;

		let span = FlowSpan::new(KIND, "refresh_token");

		obs::record_flow_outcome(KIND, FlowOutcome::Attempt);
		self.metrics.record_attempt();

		let result = span.instrument(self.exchange()).await;

		match &result {
			Ok(snapshot) => {
				self.metrics.record_success();
				obs::record_flow_outcome(KIND, FlowOutcome::Success);
				tracing::info!(expires_at = %snapshot.expires_at, "access token refreshed");
			},
			Err(e) => {
				self.metrics.record_failure();
				obs::record_flow_outcome(KIND, FlowOutcome::Failure);
				tracing::warn!(error = %e, "token refresh failed");
			},
		}

		result
	}

	async fn exchange(&self) -> RefreshOutcome {
		let previous = self.load_snapshot().await.ok_or(AuthError::NoTokens)?;
		let request =
			self.refresh_request(previous.refresh_token.expose()).map_err(AuthError::network)?;
		let meta = ResponseMetadataSlot::default();
		let handle = self.http_client.with_metadata(meta.clone());
		let response = handle.call(request).await.map_err(AuthError::network)?;
		let status = response.status();

		if !status.is_success() {
			let retry_after = meta.take().and_then(|meta| meta.retry_after);

			tracing::debug!(
				status = status.as_u16(),
				?retry_after,
				"token endpoint rejected refresh"
			);

			return Err(AuthError::rejected(status.as_u16()));
		}

		let payload = TokenResponse::parse(status.as_u16(), response.body())?;
		let next = payload.into_snapshot(&previous, OffsetDateTime::now_utc())?;

		self.commit(next.clone()).await;

		Ok(next)
	}

	fn refresh_request(&self, refresh_token: &str) -> Result<HttpRequest, oauth2::http::Error> {
		let body = form_urlencoded::Serializer::new(String::new())
			.append_pair("grant_type", "refresh_token")
			.append_pair("client_id", &self.client_id)
			.append_pair("refresh_token", refresh_token)
			.finish();

		Request::builder()
			.method(Method::POST)
			.uri(self.token_endpoint.as_str())
			.header(CONTENT_TYPE, "application/x-www-form-urlencoded")
			.header(ACCEPT, "application/json")
			.body(body.into_bytes())
	}

	/// Swaps the snapshot in, then persists it and notifies the save hook on a best-effort basis.
	///
	/// The provider may already have invalidated the previous refresh token, so persistence
	/// failures never roll the in-memory snapshot back.
	async fn commit(&self, next: CredentialSnapshot) {
		*self.snapshot.write() = Some(next.clone());

		if let Some(store) = &self.store
			&& let Err(e) = store.save(next.clone()).await
		{
			tracing::warn!(error = %e, "failed to persist refreshed tokens");
		}
		if let Some(hook) = &self.on_save {
			let saved = hook(
				next.access_token.expose().to_owned(),
				next.refresh_token.expose().to_owned(),
				next.expires_at,
			)
			.await;

			if let Err(e) = saved {
				tracing::warn!(error = %e, "token save hook failed");
			}
		}
	}
}

/// Success body returned by the token endpoint.
#[derive(Debug, Deserialize)]
struct TokenResponse {
	access_token: String,
	#[serde(default)]
	refresh_token: Option<String>,
	expires_in: i64,
	#[serde(default)]
	token_type: Option<String>,
	#[serde(default)]
	scope: Option<String>,
}
impl TokenResponse {
	fn parse(status: u16, body: &[u8]) -> Result<Self, AuthError> {
		let mut de = serde_json::Deserializer::from_slice(body);

		serde_path_to_error::deserialize(&mut de)
			.map_err(|e| AuthError::MalformedResponse { status, source: Arc::new(e) })
	}

	/// Builds the replacement snapshot; omitted fields carry over from `previous`.
	fn into_snapshot(
		self,
		previous: &CredentialSnapshot,
		now: OffsetDateTime,
	) -> Result<CredentialSnapshot, AuthError> {
		if self.expires_in <= 0 {
			return Err(AuthError::InvalidExpiresIn(self.expires_in));
		}

		let expires_at = now
			.checked_add(Duration::seconds(self.expires_in))
			.ok_or(AuthError::InvalidExpiresIn(self.expires_in))?;

		Ok(CredentialSnapshot {
			access_token: self.access_token.into(),
			refresh_token: self
				.refresh_token
				.map(Into::into)
				.unwrap_or_else(|| previous.refresh_token.clone()),
			expires_at,
			token_type: self.token_type.unwrap_or_else(|| DEFAULT_TOKEN_TYPE.into()),
			scope: self.scope.unwrap_or_else(|| previous.scope.clone()),
		})
	}
}

#[cfg(test)]
mod tests {
	// std
	use std::{
		sync::atomic::{AtomicUsize, Ordering},
		time::Duration as StdDuration,
	};
	// crates.io
	use futures::future;
	use oauth2::{HttpClientError, HttpResponse};
	// self
	use super::*;
	use crate::{auth::HookError, store::MemoryStore};

	const SUCCESS_BODY: &str = r#"{"access_token":"at2","refresh_token":"rt2","expires_in":3600,"token_type":"Bearer","scope":"x"}"#;

	#[derive(Clone)]
	struct ScriptedClient {
		status: u16,
		body: &'static str,
		delay: StdDuration,
		calls: Arc<AtomicUsize>,
		last_request: Arc<Mutex<Option<HttpRequest>>>,
	}
	impl ScriptedClient {
		fn respond(status: u16, body: &'static str) -> Self {
			Self {
				status,
				body,
				delay: StdDuration::from_millis(20),
				calls: Default::default(),
				last_request: Default::default(),
			}
		}

		fn calls(&self) -> usize {
			self.calls.load(Ordering::SeqCst)
		}
	}
	impl TokenHttpClient for ScriptedClient {
		type Handle = ScriptedClient;
		type TransportError = std::io::Error;

		fn with_metadata(&self, _slot: ResponseMetadataSlot) -> Self::Handle {
			self.clone()
		}
	}
	impl<'c> AsyncHttpClient<'c> for ScriptedClient {
		type Error = HttpClientError<std::io::Error>;
		type Future = Pin<Box<dyn Future<Output = Result<HttpResponse, Self::Error>> + 'c + Send>>;

		fn call(&'c self, request: HttpRequest) -> Self::Future {
			self.calls.fetch_add(1, Ordering::SeqCst);
			*self.last_request.lock() = Some(request);

			Box::pin(async move {
				tokio::time::sleep(self.delay).await;

				let response = oauth2::http::Response::builder()
					.status(self.status)
					.body(self.body.as_bytes().to_vec())
					.expect("Scripted response should build.");

				Ok(response)
			})
		}
	}

	fn manager_with(
		client: &ScriptedClient,
		expires_in: Duration,
	) -> (TokenManager<ScriptedClient>, Arc<MemoryStore>) {
		let store = Arc::new(MemoryStore::default());
		let manager = TokenManager::with_http_client(
			"client-1",
			"https://auth.example.com/oauth/token",
			client.clone(),
		)
		.store(store.clone())
		.tokens(
			CredentialSnapshot::new("at1", "rt1", OffsetDateTime::now_utc() + expires_in)
				.with_scope("x"),
		)
		.build()
		.expect("Manager should build.");

		(manager, store)
	}

	#[tokio::test]
	async fn refresh_replaces_snapshot_and_persists_it() {
		let client = ScriptedClient::respond(200, SUCCESS_BODY);
		let (manager, store) = manager_with(&client, Duration::seconds(30));
		let refreshed = manager.refresh_token().await.expect("Refresh should succeed.");
		let expected = OffsetDateTime::now_utc() + Duration::seconds(3600);

		assert_eq!(refreshed.access_token.expose(), "at2");
		assert_eq!(refreshed.refresh_token.expose(), "rt2");
		assert_eq!(refreshed.scope, "x");
		assert!((refreshed.expires_at - expected).abs() <= Duration::seconds(1));
		assert_eq!(manager.current_tokens(), Some(refreshed.clone()));
		assert_eq!(store.peek(), Some(refreshed));
	}

	#[tokio::test]
	async fn refresh_request_is_form_encoded() {
		let client = ScriptedClient::respond(200, SUCCESS_BODY);
		let (manager, _) = manager_with(&client, Duration::seconds(30));

		manager.refresh_token().await.expect("Refresh should succeed.");

		let request = client.last_request.lock().take().expect("Request should be recorded.");
		let body = String::from_utf8(request.body().clone()).expect("Form body should be UTF-8.");

		assert_eq!(request.method(), Method::POST);
		assert_eq!(request.uri(), "https://auth.example.com/oauth/token");
		assert_eq!(request.headers()[CONTENT_TYPE], "application/x-www-form-urlencoded");
		assert_eq!(request.headers()[ACCEPT], "application/json");
		assert_eq!(body, "grant_type=refresh_token&client_id=client-1&refresh_token=rt1");
	}

	#[tokio::test]
	async fn concurrent_refreshes_share_one_exchange() {
		let client = ScriptedClient::respond(200, SUCCESS_BODY);
		let (manager, _) = manager_with(&client, Duration::seconds(30));
		let tasks = (0..8).map(|_| {
			let manager = manager.clone();

			tokio::spawn(async move { manager.refresh_token().await })
		});
		let outcomes = future::join_all(tasks).await;

		assert_eq!(client.calls(), 1);
		assert_eq!(manager.metrics().attempts(), 1);
		assert_eq!(manager.metrics().joins(), 7);

		for outcome in outcomes {
			let snapshot = outcome
				.expect("Refresh task should not panic.")
				.expect("Every joiner should observe the successful refresh.");

			assert_eq!(snapshot.access_token.expose(), "at2");
			assert_eq!(snapshot.refresh_token.expose(), "rt2");
		}
	}

	#[tokio::test]
	async fn joiners_share_a_failure_and_the_next_call_retries() {
		let client = ScriptedClient::respond(
			400,
			r#"{"error":"invalid_grant","error_description":"provider internals"}"#,
		);
		let (manager, _) = manager_with(&client, Duration::seconds(30));
		let (first, second) = tokio::join!(manager.refresh_token(), manager.refresh_token());

		assert_eq!(client.calls(), 1);

		for outcome in [first, second] {
			let err = outcome.expect_err("Rejected refresh should fail for every joiner.");

			assert!(matches!(
				err.as_auth(),
				Some(AuthError::Rejected { status: 400, reason }) if reason == "Bad Request"
			));
			assert!(!err.to_string().contains("provider internals"));
		}

		manager.refresh_token().await.expect_err("Retry should hit the endpoint again.");

		assert_eq!(client.calls(), 2);
		assert_eq!(manager.metrics().failures(), 2);
		assert_eq!(
			manager.current_tokens().map(|s| s.access_token.expose().to_owned()).as_deref(),
			Some("at1"),
		);
	}

	#[tokio::test]
	async fn access_token_refreshes_inside_the_buffer_only() {
		let client = ScriptedClient::respond(200, SUCCESS_BODY);
		let (fresh, _) = manager_with(&client, Duration::seconds(120));

		assert_eq!(fresh.access_token().await.expect("Fresh token should be returned."), "at1");
		assert_eq!(client.calls(), 0);

		let (due, _) = manager_with(&client, Duration::seconds(60));

		assert_eq!(due.access_token().await.expect("Due token should be refreshed."), "at2");
		assert_eq!(client.calls(), 1);
	}

	#[tokio::test]
	async fn malformed_success_body_is_typed() {
		let client = ScriptedClient::respond(200, r#"{"access_token":"at2","expires_in":"soon"}"#);
		let (manager, _) = manager_with(&client, Duration::seconds(30));
		let err = manager.refresh_token().await.expect_err("Malformed body should fail.");

		assert!(matches!(err.as_auth(), Some(AuthError::MalformedResponse { status: 200, .. })));
	}

	#[tokio::test]
	async fn non_positive_lifetime_is_rejected() {
		let client = ScriptedClient::respond(200, r#"{"access_token":"at2","expires_in":0}"#);
		let (manager, _) = manager_with(&client, Duration::seconds(30));
		let err = manager.refresh_token().await.expect_err("Zero lifetime should fail.");

		assert!(matches!(err.as_auth(), Some(AuthError::InvalidExpiresIn(0))));
	}

	#[tokio::test]
	async fn omitted_fields_carry_over_from_the_previous_snapshot() {
		let client = ScriptedClient::respond(200, r#"{"access_token":"at2","expires_in":60}"#);
		let (manager, _) = manager_with(&client, Duration::seconds(30));
		let refreshed = manager.refresh_token().await.expect("Minimal body should succeed.");

		assert_eq!(refreshed.refresh_token.expose(), "rt1");
		assert_eq!(refreshed.token_type, "Bearer");
		assert_eq!(refreshed.scope, "x");
	}

	#[tokio::test]
	async fn save_hook_receives_the_new_tokens() {
		let client = ScriptedClient::respond(200, SUCCESS_BODY);
		let seen = Arc::new(Mutex::new(Vec::new()));
		let sink = seen.clone();
		let manager = TokenManager::with_http_client(
			"client-1",
			"https://auth.example.com/oauth/token",
			client.clone(),
		)
		.tokens(CredentialSnapshot::new("at1", "rt1", OffsetDateTime::now_utc()))
		.on_save(move |access, refresh, expires_at| {
			let sink = sink.clone();

			async move {
				sink.lock().push((access, refresh, expires_at));

				Err::<(), HookError>("hook storage is full".into())
			}
		})
		.build()
		.expect("Manager should build.");
		let refreshed =
			manager.refresh_token().await.expect("Hook failure should not fail the refresh.");
		let seen = seen.lock().clone();

		assert_eq!(seen, vec![("at2".to_owned(), "rt2".to_owned(), refreshed.expires_at)]);
	}

	#[tokio::test]
	async fn refresh_without_tokens_fails_fast() {
		let client = ScriptedClient::respond(200, SUCCESS_BODY);
		let manager = TokenManager::with_http_client(
			"client-1",
			"https://auth.example.com/oauth/token",
			client.clone(),
		)
		.build()
		.expect("Manager should build.");
		let err = manager.refresh_token().await.expect_err("Refresh without tokens should fail.");

		assert!(matches!(err.as_auth(), Some(AuthError::NoTokens)));
		assert_eq!(client.calls(), 0);
	}
}
