//! Concurrency plumbing for OAuth bearer API clients: a single-flight token lifecycle manager
//! and a process-wide, priority-ordered request scheduler that keeps calls inside daily and
//! per-second budgets.

#![deny(clippy::all, missing_docs, unused_crate_dependencies)]

pub mod auth;
#[cfg(feature = "reqwest")] pub mod client;
pub mod error;
pub mod http;
pub mod manager;
pub mod obs;
pub mod queue;
pub mod rate_limit;
pub mod store;
#[cfg(all(any(test, feature = "test"), feature = "reqwest"))]
pub mod _preludet {
	//! Convenience re-exports and helpers for integration tests; enabled via `cfg(test)` or the
	//! `test` crate feature.

	pub use crate::_prelude::*;

	// self
	use crate::{
		auth::CredentialSnapshot,
		http::ReqwestHttpClient,
		manager::TokenManager,
		store::{CredentialStore, MemoryStore},
	};

	/// Manager type alias used by reqwest-backed integration tests.
	pub type ReqwestTestManager = TokenManager<ReqwestHttpClient>;

	/// Builds a reqwest HTTP client that accepts the self-signed certificates produced by
	/// `httpmock` during tests.
	pub fn test_reqwest_http_client() -> ReqwestHttpClient {
		let client = ReqwestClient::builder()
			.danger_accept_invalid_certs(true)
			.danger_accept_invalid_hostnames(true)
			.build()
			.expect("Failed to build insecure Reqwest client for tests.");

		ReqwestHttpClient::with_client(client)
	}

	/// Builds a snapshot that expires `expires_in` from now.
	pub fn snapshot_expiring_in(
		access: &str,
		refresh: &str,
		expires_in: Duration,
	) -> CredentialSnapshot {
		CredentialSnapshot::new(access, refresh, OffsetDateTime::now_utc() + expires_in)
	}

	/// Constructs a [`TokenManager`] pointed at `token_url`, backed by an in-memory store and
	/// seeded with `seed` (when provided).
	pub fn build_reqwest_test_manager(
		token_url: &str,
		client_id: &str,
		seed: Option<CredentialSnapshot>,
	) -> (ReqwestTestManager, Arc<MemoryStore>) {
		let store_backend = Arc::new(MemoryStore::default());
		let store: Arc<dyn CredentialStore> = store_backend.clone();
		let mut builder = TokenManager::builder(client_id, token_url)
			.store(store)
			.http_client(test_reqwest_http_client());

		if let Some(seed) = seed {
			builder = builder.tokens(seed);
		}

		let manager = builder.build().expect("Test token manager should build successfully.");

		(manager, store_backend)
	}
}

mod _prelude {
	pub use std::{
		collections::HashMap,
		error::Error as StdError,
		fmt::{Debug, Display, Formatter, Result as FmtResult},
		future::Future,
		pin::Pin,
		sync::Arc,
	};

	pub use parking_lot::{Mutex, RwLock};
	#[cfg(feature = "reqwest")]
	pub use reqwest::{Client as ReqwestClient, Error as ReqwestError};
	pub use serde::{Deserialize, Serialize};
	pub use thiserror::Error as ThisError;
	pub use time::{Duration, OffsetDateTime};
	pub use url::Url;

	pub use crate::error::{Error, Result};
}

#[cfg(feature = "reqwest")] pub use reqwest;
pub use url;
#[cfg(all(test, feature = "reqwest"))] use httpmock as _;
