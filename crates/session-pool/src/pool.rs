//! Pool state and round-robin lease selection
//!
//! All lease bookkeeping lives in one `PoolState` behind a single mutex, so an
//! acquire and a release can never interleave. The lock is never held across
//! an await point; `acquire` is synchronous and `Lease` releases from `Drop`.
//!
//! Eligibility is computed at selection time: a slot is eligible when it is
//! not leased and at least `cooldown` has passed since its last release.
//! Timestamps use `tokio::time::Instant` so tests can drive the clock.

use std::sync::Arc;
use std::time::Duration;

use common::Secret;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// An upstream session identity.
///
/// `id` is a stable, log-safe name assigned by the pool (`session-1`, ...);
/// the token itself is only reachable through `token()`.
#[derive(Debug, Clone)]
pub struct SessionCredential {
    id: String,
    token: Secret<String>,
}

impl SessionCredential {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn token(&self) -> &str {
        self.token.expose()
    }

    /// Log-safe token prefix.
    pub fn fingerprint(&self) -> String {
        self.token.fingerprint()
    }
}

/// Per-credential bookkeeping. Mutated only under the pool lock.
#[derive(Debug)]
struct Slot {
    credential: SessionCredential,
    in_use: bool,
    /// Bumped on every acquire so a stale `Lease` cannot release a newer one.
    generation: u64,
    last_acquired: Option<Instant>,
    last_released: Option<Instant>,
    leases_total: u64,
}

impl Slot {
    fn cooldown_remaining(&self, now: Instant, cooldown: Duration) -> Option<Duration> {
        let released = self.last_released?;
        let rested = now.saturating_duration_since(released);
        (rested < cooldown).then(|| cooldown - rested)
    }

    fn is_eligible(&self, now: Instant, cooldown: Duration) -> bool {
        !self.in_use && self.cooldown_remaining(now, cooldown).is_none()
    }
}

#[derive(Debug)]
struct PoolState {
    slots: Vec<Slot>,
    /// Round-robin starting point for the next scan.
    cursor: usize,
    leased: usize,
}

impl PoolState {
    /// Clear a slot's lease. Returns false if it was not leased (or, when a
    /// generation is given, leased by someone else).
    fn release_slot(&mut self, index: usize, generation: Option<u64>, now: Instant) -> bool {
        let Some(slot) = self.slots.get_mut(index) else {
            return false;
        };
        if !slot.in_use || generation.is_some_and(|g| g != slot.generation) {
            return false;
        }
        slot.in_use = false;
        slot.last_released = Some(now);
        self.leased -= 1;
        true
    }

    fn cooling(&self, now: Instant, cooldown: Duration) -> usize {
        self.slots
            .iter()
            .filter(|s| !s.in_use && s.cooldown_remaining(now, cooldown).is_some())
            .count()
    }
}

/// Pool of session credentials shared by all in-flight requests.
///
/// Constructed once at startup and shared via `Arc`; the credential set does
/// not change for the lifetime of the process.
#[derive(Debug)]
pub struct Pool {
    state: Mutex<PoolState>,
    max_concurrency: usize,
    cooldown: Duration,
}

impl Pool {
    /// Create a pool over `tokens`.
    ///
    /// Duplicate tokens are collapsed so a single upstream identity can never
    /// be driven by two leases at once.
    pub fn new(tokens: Vec<Secret<String>>, max_concurrency: usize, cooldown: Duration) -> Self {
        let mut slots: Vec<Slot> = Vec::with_capacity(tokens.len());
        for token in tokens {
            if slots
                .iter()
                .any(|s| s.credential.token.expose() == token.expose())
            {
                warn!(token = %token.fingerprint(), "duplicate session token ignored");
                continue;
            }
            let id = format!("session-{}", slots.len() + 1);
            slots.push(Slot {
                credential: SessionCredential { id, token },
                in_use: false,
                generation: 0,
                last_acquired: None,
                last_released: None,
                leases_total: 0,
            });
        }

        info!(
            sessions = slots.len(),
            max_concurrency,
            cooldown_secs = cooldown.as_secs(),
            "session pool initialized"
        );
        Self {
            state: Mutex::new(PoolState {
                slots,
                cursor: 0,
                leased: 0,
            }),
            max_concurrency,
            cooldown,
        }
    }

    /// Lease the next eligible credential, scanning round-robin.
    ///
    /// Fails with `PoolExhausted` when the concurrency limit is reached or no
    /// credential is idle and rested. Never waits.
    pub fn acquire(self: &Arc<Self>) -> Result<Lease> {
        let now = Instant::now();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let total = state.slots.len();

        if total > 0 && state.leased < self.max_concurrency {
            let start = state.cursor % total;
            for offset in 0..total {
                let index = (start + offset) % total;
                let slot = &mut state.slots[index];
                if !slot.is_eligible(now, self.cooldown) {
                    continue;
                }

                slot.in_use = true;
                slot.generation += 1;
                slot.last_acquired = Some(now);
                slot.leases_total += 1;
                let lease = Lease {
                    pool: Arc::clone(self),
                    index,
                    generation: slot.generation,
                    credential: slot.credential.clone(),
                };
                state.leased += 1;
                state.cursor = index + 1;
                debug!(session_id = lease.id(), leased = state.leased, "session leased");
                return Ok(lease);
            }
        }

        let err = Error::PoolExhausted {
            total,
            leased: state.leased,
            cooling: state.cooling(now, self.cooldown),
            limit: self.max_concurrency,
        };
        debug!(error = %err, "no eligible session");
        Err(err)
    }

    /// Release the credential named `session_id`, starting its cool-down.
    ///
    /// Idempotent: releasing an idle or unknown session is a no-op.
    pub fn release(&self, session_id: &str) {
        let now = Instant::now();
        let mut state = self.state.lock();
        let Some(index) = state
            .slots
            .iter()
            .position(|s| s.credential.id == session_id)
        else {
            debug!(session_id, "release of unknown session ignored");
            return;
        };
        if state.release_slot(index, None, now) {
            debug!(session_id, "session released");
        } else {
            debug!(session_id, "release of idle session ignored");
        }
    }

    fn release_lease(&self, index: usize, generation: u64) {
        let now = Instant::now();
        let mut state = self.state.lock();
        if state.release_slot(index, Some(generation), now) {
            debug!(
                session_id = state.slots[index].credential.id.as_str(),
                "session released"
            );
        }
    }

    /// Number of configured credentials.
    pub fn size(&self) -> usize {
        self.state.lock().slots.len()
    }

    /// Number of credentials currently leased.
    pub fn leased(&self) -> usize {
        self.state.lock().leased
    }

    /// Pool health summary for the health endpoint.
    ///
    /// `healthy` when as many credentials could be leased right now as the
    /// concurrency limit ever allows, `degraded` when fewer can, `unhealthy`
    /// when none can (or the pool is empty).
    pub fn health(&self) -> serde_json::Value {
        let now = Instant::now();
        let state = self.state.lock();

        let mut sessions = Vec::with_capacity(state.slots.len());
        let mut available = 0usize;
        let mut cooling = 0usize;

        for slot in &state.slots {
            let entry = if slot.in_use {
                serde_json::json!({
                    "id": slot.credential.id,
                    "status": "leased",
                    "leases_total": slot.leases_total,
                    "leased_for_secs": slot
                        .last_acquired
                        .map(|t| now.saturating_duration_since(t).as_secs())
                        .unwrap_or(0),
                })
            } else if let Some(remaining) = slot.cooldown_remaining(now, self.cooldown) {
                cooling += 1;
                serde_json::json!({
                    "id": slot.credential.id,
                    "status": "cooling_down",
                    "leases_total": slot.leases_total,
                    "cooldown_remaining_secs": remaining.as_secs_f64().ceil() as u64,
                })
            } else {
                available += 1;
                serde_json::json!({
                    "id": slot.credential.id,
                    "status": "available",
                    "leases_total": slot.leases_total,
                })
            };
            sessions.push(entry);
        }

        let total = state.slots.len();
        let leasable = if state.leased < self.max_concurrency {
            available.min(self.max_concurrency - state.leased)
        } else {
            0
        };
        let status = if leasable > 0 && leasable == total.min(self.max_concurrency) {
            "healthy"
        } else if leasable > 0 {
            "degraded"
        } else {
            "unhealthy"
        };

        serde_json::json!({
            "status": status,
            "sessions_total": total,
            "sessions_available": available,
            "sessions_leased": state.leased,
            "sessions_cooling_down": cooling,
            "max_concurrency": self.max_concurrency,
            "sessions": sessions,
        })
    }
}

/// Exclusive hold on one credential.
///
/// The credential goes back to the pool when the lease is dropped, whichever
/// way the owning request ends.
#[derive(Debug)]
pub struct Lease {
    pool: Arc<Pool>,
    index: usize,
    generation: u64,
    credential: SessionCredential,
}

impl Lease {
    pub fn credential(&self) -> &SessionCredential {
        &self.credential
    }

    pub fn id(&self) -> &str {
        self.credential.id()
    }

    pub fn token(&self) -> &str {
        self.credential.token()
    }

    /// Release now rather than at end of scope.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.pool.release_lease(self.index, self.generation);
    }
}
