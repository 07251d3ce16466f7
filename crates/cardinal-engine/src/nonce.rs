//! Replay protection for signed transactions.
//!
//! Each signer has a sorted set of used nonces in the key-value backend,
//! scored by the nonce itself. A nonce may be claimed once. Nonces more than
//! [`NONCE_WINDOW`] below the signer's highest nonce are rejected without a
//! backend round-trip, which lets old entries be pruned in bulk.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use cardinal_ecs::storage::kv::{KvBackend, KvError};

/// How far below the highest used nonce a new nonce may be.
pub const NONCE_WINDOW: u64 = 1000;

/// Retained nonces per signer that trigger a pruning pass.
pub const CLEANUP_THRESHOLD: usize = (NONCE_WINDOW as usize) * 3 / 2;

/// Largest nonce whose sorted-set score is distinct from every smaller one.
pub const MAX_NONCE: u64 = (1 << 53) - 1;

/// Reasons a nonce cannot be claimed.
#[derive(Debug, thiserror::Error)]
pub enum NonceError {
    /// Above [`MAX_NONCE`].
    #[error("nonce {nonce} is invalid: above {MAX_NONCE}")]
    Invalid { nonce: u64 },

    #[error("nonce {nonce} for signer '{signer}' is too old (highest used is {max})")]
    TooOld { signer: String, nonce: u64, max: u64 },

    #[error("signer '{signer}' has already used nonce {nonce}")]
    AlreadyUsed { signer: String, nonce: u64 },

    #[error(transparent)]
    Backend(#[from] KvError),

    #[error("stored nonce '{0}' is not a number")]
    Corrupt(String),
}

#[derive(Debug, Default)]
struct SignerState {
    max: u64,
    /// Nonces currently retained in the backend.
    retained: usize,
}

/// Sliding-window nonce tracker over a [`KvBackend`].
pub struct NonceStore {
    kv: Arc<dyn KvBackend>,
    /// One lock for all signers.
    signers: Mutex<HashMap<String, SignerState>>,
}

impl NonceStore {
    pub fn new(kv: Arc<dyn KvBackend>) -> Self {
        Self {
            kv,
            signers: Mutex::new(HashMap::new()),
        }
    }

    fn key(signer: &str) -> String {
        format!("nonce:{signer}")
    }

    /// Claim `nonce` for `signer`.
    pub fn use_nonce(&self, signer: &str, nonce: u64) -> Result<(), NonceError> {
        if nonce > MAX_NONCE {
            return Err(NonceError::Invalid { nonce });
        }
        let key = Self::key(signer);
        let mut signers = self
            .signers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let state = match signers.entry(signer.to_owned()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(self.load_signer(&key)?),
        };

        if nonce < state.max && state.max - nonce >= NONCE_WINDOW {
            return Err(NonceError::TooOld {
                signer: signer.to_owned(),
                nonce,
                max: state.max,
            });
        }

        if !self.kv.zadd(&key, nonce as f64, &nonce.to_string())? {
            return Err(NonceError::AlreadyUsed {
                signer: signer.to_owned(),
                nonce,
            });
        }
        state.max = state.max.max(nonce);
        state.retained += 1;

        if state.retained > CLEANUP_THRESHOLD {
            self.prune(&key, state);
        }
        Ok(())
    }

    /// Highest nonce and retained count, read from the backend.
    fn load_signer(&self, key: &str) -> Result<SignerState, NonceError> {
        let max = match self.kv.zmax(key)? {
            Some((member, _)) => member
                .parse::<u64>()
                .map_err(|_| NonceError::Corrupt(member.clone()))?,
            None => 0,
        };
        let retained = self.kv.zcard(key)?;
        Ok(SignerState { max, retained })
    }

    /// Drop every nonce that can no longer be claimed anyway.
    fn prune(&self, key: &str, state: &mut SignerState) {
        let Some(ceiling) = state.max.checked_sub(NONCE_WINDOW) else {
            return;
        };
        match self.kv.zrem_range_by_score(key, f64::NEG_INFINITY, ceiling as f64) {
            Ok(removed) => {
                state.retained = state.retained.saturating_sub(removed);
                tracing::debug!(key, removed, ceiling, "pruned old nonces");
            }
            // Retrying on the next claim is harmless.
            Err(err) => tracing::warn!(key, error = %err, "failed to prune old nonces"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
