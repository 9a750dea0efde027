//! Storage contract and built-in backends for credential snapshots.

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

// std
use std::path::PathBuf;
// self
use crate::{_prelude::*, auth::CredentialSnapshot};

/// Boxed future returned by [`CredentialStore`] operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + 'a + Send>>;

/// Persistence contract for the manager's single credential snapshot.
pub trait CredentialStore
where
	Self: Send + Sync,
{
	/// Persists `snapshot`, replacing whatever was stored before.
	fn save(&self, snapshot: CredentialSnapshot) -> StoreFuture<'_, ()>;

	/// Loads the stored snapshot, if any.
	fn load(&self) -> StoreFuture<'_, Option<CredentialSnapshot>>;

	/// Removes the stored snapshot.
	fn clear(&self) -> StoreFuture<'_, ()>;
}

/// Error type produced by [`CredentialStore`] implementations.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ThisError)]
pub enum StoreError {
	/// Serialization failures surfaced by the backend.
	#[error("Serialization error: {message}.")]
	Serialization {
		/// Human-readable error payload.
		message: String,
	},
	/// Backend-level failure for the storage engine.
	#[error("Backend failure: {message}.")]
	Backend {
		/// Human-readable error payload.
		message: String,
	},
}

/// Environment variable consulted by [`detect`] for a credential file path.
pub const STORE_PATH_ENV: &str = "BEARER_GATE_TOKEN_FILE";

/// Picks a backend for the current environment.
///
/// An explicit `path` wins, then [`STORE_PATH_ENV`]; without either the snapshot lives in memory.
pub fn detect(path: Option<PathBuf>) -> Result<Arc<dyn CredentialStore>, StoreError> {
	let path = path.or_else(|| std::env::var_os(STORE_PATH_ENV).map(PathBuf::from));

	match path {
		Some(path) => {
			tracing::debug!(path = %path.display(), "using file-backed credential store");

			Ok(Arc::new(FileStore::open(path)?))
		},
		None => Ok(Arc::new(MemoryStore::default())),
	}
}
