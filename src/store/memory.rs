//! In-process [`CredentialStore`] for tests, demos, and short-lived clients.

// self
use crate::{
	_prelude::*,
	auth::CredentialSnapshot,
	store::{CredentialStore, StoreFuture},
};

/// Keeps the snapshot behind a lock; clones share the same slot.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore(Arc<RwLock<Option<CredentialSnapshot>>>);
impl MemoryStore {
	/// Creates a store pre-populated with `snapshot`.
	pub fn with_snapshot(snapshot: CredentialSnapshot) -> Self {
		Self(Arc::new(RwLock::new(Some(snapshot))))
	}

	/// Returns the stored snapshot without going through the async contract.
	pub fn peek(&self) -> Option<CredentialSnapshot> {
		self.0.read().clone()
	}
}
impl CredentialStore for MemoryStore {
	fn save(&self, snapshot: CredentialSnapshot) -> StoreFuture<'_, ()> {
		let slot = self.0.clone();

		Box::pin(async move {
			*slot.write() = Some(snapshot);

			Ok(())
		})
	}

	fn load(&self) -> StoreFuture<'_, Option<CredentialSnapshot>> {
		let slot = self.0.clone();

		Box::pin(async move { Ok(slot.read().clone()) })
	}

	fn clear(&self) -> StoreFuture<'_, ()> {
		let slot = self.0.clone();

		Box::pin(async move {
			slot.write().take();

			Ok(())
		})
	}
}
