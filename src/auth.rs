//! Credential snapshots, redacted secrets, and proactive rotation policy.

pub mod rotation;
pub mod secret;
pub mod snapshot;

pub use rotation::*;
pub use secret::*;
pub use snapshot::*;
