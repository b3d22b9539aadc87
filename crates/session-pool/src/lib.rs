//! Bounded pool of upstream session credentials
//!
//! Hands out exclusive leases on configured session tokens under three rules:
//! a credential is never leased twice at once, no more than `max_concurrency`
//! credentials are leased simultaneously, and a released credential rests for
//! the configured cool-down before it is eligible again.
//!
//! Lease lifecycle:
//! 1. Gateway calls `Pool::acquire` → round-robin scan for an eligible credential
//! 2. The returned `Lease` carries the credential for the upstream exchange
//! 3. Dropping the `Lease` (on any exit path) releases it and starts its cool-down
//! 4. `Pool::release` is the idempotent manual counterpart, keyed by session id

pub mod error;
pub mod pool;

pub use error::{Error, Result};
pub use pool::{Lease, Pool, SessionCredential};
