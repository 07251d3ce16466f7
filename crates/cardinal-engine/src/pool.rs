//! The transaction pool: a shared inbox drained once per tick.
//!
//! Any thread may [`add`](TxPool::add) to a [`TxPool`] at any time. The tick
//! engine calls [`drain`](TxPool::drain), which swaps the pending list out
//! under the same lock, so every transaction lands in exactly one drain.
//! Neither side ever holds the lock while systems run.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Numeric identity of a registered message type. Assigned from 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub(crate) u32);

impl MessageId {
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hex-encoded BLAKE3 digest identifying one submitted transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxHash(String);

impl TxHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<blake3::Hash> for TxHash {
    fn from(hash: blake3::Hash) -> Self {
        Self(hash.to_hex().to_string())
    }
}

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// SignedEnvelope / PooledTx
// ---------------------------------------------------------------------------

/// The signature wrapper a transport attaches to a transaction.
///
/// The pool does not verify signatures; the submission layer does that (and
/// claims the nonce) before calling [`TxPool::add`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedEnvelope {
    pub persona_tag: String,
    pub namespace: String,
    pub nonce: u64,
    pub signature: String,
}

/// One transaction as held by the pool: the encoded payload plus its
/// addressing data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PooledTx {
    pub message_id: MessageId,
    pub hash: TxHash,
    /// JSON-encoded message value.
    pub payload: Vec<u8>,
    pub envelope: Option<SignedEnvelope>,
}

// ---------------------------------------------------------------------------
// TxPool
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct PoolState {
    pending: Vec<PooledTx>,
    /// Number of transactions ever accepted. Mixed into unsigned hashes.
    accepted: u64,
}

/// Cloneable handle to a shared transaction pool.
#[derive(Debug, Clone, Default)]
pub struct TxPool {
    inner: Arc<Mutex<PoolState>>,
}

impl TxPool {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        // A panic while holding this lock cannot leave the list half-written.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue a transaction for the next tick and return its hash.
    pub fn add(
        &self,
        message_id: MessageId,
        payload: Vec<u8>,
        envelope: Option<SignedEnvelope>,
    ) -> TxHash {
        let mut state = self.state();
        let hash = tx_hash(message_id, &payload, envelope.as_ref(), state.accepted);
        state.accepted += 1;
        state.pending.push(PooledTx {
            message_id,
            hash: hash.clone(),
            payload,
            envelope,
        });
        hash
    }

    /// Queue a transaction that already has a hash, e.g. one read back from a
    /// transaction log.
    pub fn push(&self, tx: PooledTx) {
        let mut state = self.state();
        state.accepted += 1;
        state.pending.push(tx);
    }

    /// Take everything queued so far, leaving the pool empty.
    pub fn drain(&self) -> TxQueue {
        let pending = std::mem::take(&mut self.state().pending);
        TxQueue { txs: pending }
    }

    /// Put a drained queue back ahead of anything submitted since, so the
    /// next drain sees the same transactions in the same order.
    pub fn requeue(&self, queue: TxQueue) {
        if queue.is_empty() {
            return;
        }
        let mut state = self.state();
        let mut txs = queue.txs;
        txs.append(&mut state.pending);
        state.pending = txs;
    }

    /// Transactions waiting for the next drain.
    pub fn count_pending(&self) -> usize {
        self.state().pending.len()
    }
}

/// BLAKE3 over the message id, the payload and the envelope. Unsigned
/// transactions mix in the submission sequence so identical submissions
/// stay distinguishable.
fn tx_hash(
    message_id: MessageId,
    payload: &[u8],
    envelope: Option<&SignedEnvelope>,
    sequence: u64,
) -> TxHash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&message_id.0.to_le_bytes());
    hasher.update(&(payload.len() as u64).to_le_bytes());
    hasher.update(payload);
    match envelope {
        Some(env) => {
            hasher.update(b"signed");
            for field in [&env.persona_tag, &env.namespace, &env.signature] {
                hasher.update(&(field.len() as u64).to_le_bytes());
                hasher.update(field.as_bytes());
            }
            hasher.update(&env.nonce.to_le_bytes());
        }
        None => {
            hasher.update(b"unsigned");
            hasher.update(&sequence.to_le_bytes());
        }
    }
    hasher.finalize().into()
}

// ---------------------------------------------------------------------------
// TxQueue
// ---------------------------------------------------------------------------

/// The transactions drained for one tick, in submission order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TxQueue {
    txs: Vec<PooledTx>,
}

impl TxQueue {
    pub fn new(txs: Vec<PooledTx>) -> Self {
        Self { txs }
    }

    /// Transactions of one message type, in submission order.
    pub fn for_id(&self, id: MessageId) -> impl Iterator<Item = &PooledTx> {
        self.txs.iter().filter(move |tx| tx.message_id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PooledTx> {
        self.txs.iter()
    }

    pub fn len(&self) -> usize {
        self.txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }

    pub fn transactions(&self) -> &[PooledTx] {
        &self.txs
    }

    pub fn into_inner(self) -> Vec<PooledTx> {
        self.txs
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(nonce: u64) -> SignedEnvelope {
        SignedEnvelope {
            persona_tag: "alice".into(),
            namespace: "world-1".into(),
            nonce,
            signature: "0xabc".into(),
        }
    }

    #[test]
    fn requeued_transactions_drain_first() {
        let pool = TxPool::new();
        let a = pool.add(MessageId(1), b"a".to_vec(), None);
        let b = pool.add(MessageId(1), b"b".to_vec(), None);
        let drained = pool.drain();
        let c = pool.add(MessageId(1), b"c".to_vec(), None);

        pool.requeue(drained);
        let order: Vec<TxHash> = pool.drain().iter().map(|tx| tx.hash.clone()).collect();
        assert_eq!(order, vec![a, b, c]);
    }

    #[test]
    fn drain_empties_the_pool() {
        let pool = TxPool::new();
        pool.add(MessageId(1), b"{}".to_vec(), None);
        pool.add(MessageId(2), b"{}".to_vec(), None);
        assert_eq!(pool.count_pending(), 2);

        let queue = pool.drain();
        assert_eq!(queue.len(), 2);
        assert_eq!(pool.count_pending(), 0);
        assert!(pool.drain().is_empty());
    }

    #[test]
    fn for_id_keeps_submission_order() {
        let pool = TxPool::new();
        let a = pool.add(MessageId(1), b"1".to_vec(), None);
        let _ = pool.add(MessageId(2), b"2".to_vec(), None);
        let c = pool.add(MessageId(1), b"3".to_vec(), None);

        let queue = pool.drain();
        let hashes: Vec<_> = queue.for_id(MessageId(1)).map(|tx| tx.hash.clone()).collect();
        assert_eq!(hashes, vec![a, c]);
    }

    #[test]
    fn unsigned_duplicates_get_distinct_hashes() {
        let pool = TxPool::new();
        let a = pool.add(MessageId(1), b"{}".to_vec(), None);
        let b = pool.add(MessageId(1), b"{}".to_vec(), None);
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn signed_hash_depends_on_envelope_only() {
        let first = TxPool::new().add(MessageId(1), b"{}".to_vec(), Some(envelope(7)));
        let other_pool = TxPool::new();
        other_pool.add(MessageId(9), b"x".to_vec(), None);
        let second = other_pool.add(MessageId(1), b"{}".to_vec(), Some(envelope(7)));
        assert_eq!(first, second);

        let bumped = TxPool::new().add(MessageId(1), b"{}".to_vec(), Some(envelope(8)));
        assert_ne!(first, bumped);
    }

    #[test]
    fn push_preserves_recorded_hash() {
        let source = TxPool::new();
        let hash = source.add(MessageId(3), b"[1]".to_vec(), None);
        let tx = source.drain().into_inner().remove(0);

        let target = TxPool::new();
        target.push(tx);
        assert_eq!(target.drain().transactions()[0].hash, hash);
    }

    #[test]
    fn clones_share_one_pool() {
        let pool = TxPool::new();
        let handle = pool.clone();
        handle.add(MessageId(1), Vec::new(), None);
        assert_eq!(pool.count_pending(), 1);
    }
}
