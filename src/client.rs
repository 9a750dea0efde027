//! Authenticated API calls composed from the token manager, the request scheduler, and a rate
//! limiter.
//!
//! [`ApiClient`] maps no endpoints of its own: it resolves a path against the base URL, attaches
//! a fresh bearer token, optionally routes the call through a [`RequestQueue`], feeds response
//! headers to its [`RateLimiter`], and turns HTTP 429 into a typed [`RateLimitError`].

// std
use std::time::Duration as StdDuration;
// crates.io
use reqwest::{
	Method, StatusCode,
	header::{ACCEPT, CONTENT_TYPE},
};
use serde::de::DeserializeOwned;
// self
use crate::{
	_prelude::*,
	error::{ApiError, ConfigError},
	http::{ReqwestHttpClient, ResponseMetadata, TokenHttpClient},
	manager::TokenManager,
	queue::{EnqueueOptions, Priority, RequestQueue},
	rate_limit::{HeaderRateLimiter, RateLimitError, RateLimitStatus, RateLimiter},
};

/// Bearer-authenticated JSON client for a single API base URL.
pub struct ApiClient<C = ReqwestHttpClient>
where
	C: ?Sized + TokenHttpClient,
{
	http: ReqwestClient,
	base_url: Url,
	tokens: TokenManager<C>,
	limiter: Arc<dyn RateLimiter>,
	queue: Option<Arc<RequestQueue>>,
	priority: Priority,
}
impl<C> ApiClient<C>
where
	C: ?Sized + TokenHttpClient,
{
	/// Creates a client that calls the API directly, with a [`HeaderRateLimiter`].
	///
	/// Paths passed to the request methods are joined onto `base_url`, so it should end with
	/// `/` when it carries a path prefix.
	pub fn new(base_url: &str, tokens: TokenManager<C>) -> Result<Self> {
		let base_url =
			Url::parse(base_url).map_err(|source| ConfigError::InvalidBaseUrl { source })?;

		Ok(Self {
			http: ReqwestClient::default(),
			base_url,
			tokens,
			limiter: Arc::new(HeaderRateLimiter::new()),
			queue: None,
			priority: Priority::default(),
		})
	}

	/// Replaces the reqwest client used for API calls.
	pub fn with_http_client(mut self, http: ReqwestClient) -> Self {
		self.http = http;

		self
	}

	/// Replaces the rate limiter.
	pub fn with_rate_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
		self.limiter = limiter;

		self
	}

	/// Routes every call through `queue` at `priority`.
	pub fn with_queue(mut self, queue: Arc<RequestQueue>, priority: Priority) -> Self {
		self.queue = Some(queue);
		self.priority = priority;

		self
	}

	/// Token manager backing the bearer header.
	pub fn tokens(&self) -> &TokenManager<C> {
		&self.tokens
	}

	/// Rate-limit budget observed from recent responses.
	pub fn rate_limit_status(&self) -> RateLimitStatus {
		self.limiter.status()
	}

	/// Issues a `GET` and decodes the JSON response.
	pub async fn get_json<T>(&self, path: &str) -> Result<T>
	where
		T: 'static + Send + DeserializeOwned,
	{
		self.send_json(Method::GET, path, None).await
	}

	/// Issues a request with an optional JSON body and decodes the JSON response.
	///
	/// With a queue attached the call is scheduled under the path as its endpoint label, so a
	/// 429 from this path delays later calls to it.
	pub async fn send_json<T>(
		&self,
		method: Method,
		path: &str,
		body: Option<serde_json::Value>,
	) -> Result<T>
	where
		T: 'static + Send + DeserializeOwned,
	{
		let Some(queue) = &self.queue else {
			return self.execute(method, path, body.as_ref()).await;
		};
		let this = self.clone();
		let endpoint = path.to_owned();
		let options =
			EnqueueOptions::new().with_priority(self.priority).with_endpoint(endpoint.clone());

		queue
			.enqueue(
				move || async move { this.execute(method, &endpoint, body.as_ref()).await },
				options,
			)
			.await
			.map_err(Error::from_queue)
	}

	async fn execute<T>(
		&self,
		method: Method,
		path: &str,
		body: Option<&serde_json::Value>,
	) -> Result<T>
	where
		T: DeserializeOwned,
	{
		let url =
			self.base_url.join(path).map_err(|source| ConfigError::InvalidBaseUrl { source })?;

		self.limiter.wait_for_budget().await;

		let token = self.tokens.access_token().await?;
		let mut request =
			self.http.request(method, url).bearer_auth(token).header(ACCEPT, "application/json");

		if let Some(body) = body {
			request = request.header(CONTENT_TYPE, "application/json").body(body.to_string());
		}

		let response = request.send().await.map_err(ApiError::network)?;
		let status = response.status();
		let meta = ResponseMetadata::from_headers(status.as_u16(), response.headers());

		self.limiter.observe(&meta);

		if status == StatusCode::TOO_MANY_REQUESTS {
			let retry_after = meta.retry_after.and_then(|d| StdDuration::try_from(d).ok());

			tracing::info!(path, ?retry_after, "API call was rate limited");

			return Err(RateLimitError::new(retry_after).with_endpoint(path).into());
		}
		if !status.is_success() {
			tracing::debug!(path, status = status.as_u16(), "API call failed");

			return Err(ApiError::Status { status: status.as_u16() }.into());
		}

		let bytes = response.bytes().await.map_err(ApiError::network)?;
		let mut de = serde_json::Deserializer::from_slice(&bytes);

		serde_path_to_error::deserialize(&mut de)
			.map_err(|source| ApiError::Decode { status: status.as_u16(), source }.into())
	}
}
impl<C> Clone for ApiClient<C>
where
	C: ?Sized + TokenHttpClient,
{
	fn clone(&self) -> Self {
		Self {
			http: self.http.clone(),
			base_url: self.base_url.clone(),
			tokens: self.tokens.clone(),
			limiter: Arc::clone(&self.limiter),
			queue: self.queue.clone(),
			priority: self.priority,
		}
	}
}
impl<C> Debug for ApiClient<C>
where
	C: ?Sized + TokenHttpClient,
{
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("ApiClient")
			.field("base_url", &self.base_url.as_str())
			.field("tokens", &self.tokens)
			.field("queued", &self.queue.is_some())
			.field("priority", &self.priority)
			.finish()
	}
}
