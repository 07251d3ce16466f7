//! Transaction logs and deterministic recovery.
//!
//! A [`TxLogRecorder`] captures every tick's drained transactions together
//! with the tick's timestamp, producing a [`TxLog`]. Feeding that log to
//! [`Engine::recover`] on a fresh engine with the same registrations re-runs
//! the same systems over the same inputs and reaches the same world state.
//!
//! Durable stores also keep the [`TickBatch`] of the tick in progress until
//! that tick commits. If the process dies in between, the next
//! [`Engine::start`] runs that batch again before anything else.
//!
//! # Recording and recovering
//!
//! ```
//! use cardinal_engine::prelude::*;
//!
//! #[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
//! struct Gold(u64);
//!
//! #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
//! struct Grant { amount: u64 }
//!
//! fn build() -> (Engine, MessageType<Grant, u64>) {
//!     let mut engine = Engine::new(EngineConfig::default()).unwrap();
//!     engine.register_component::<Gold>("Gold").unwrap();
//!     let grant = engine.register_message::<Grant, u64>("grant").unwrap();
//!     engine
//!         .register_init_system("spawn", |ctx| {
//!             ctx.world_mut().create(ComponentBundle::new().with(Gold(0)))?;
//!             Ok(())
//!         })
//!         .unwrap();
//!     engine
//!         .register_system("grant", move |ctx| {
//!             grant.each(ctx, |ctx, tx| {
//!                 let mut total = 0;
//!                 for e in ctx.world().entity_ids() {
//!                     ctx.world_mut().update_component::<Gold, _>(e, |g| g.0 += tx.msg.amount)?;
//!                     total = ctx.world().get_component::<Gold>(e)?.0;
//!                 }
//!                 Ok(total)
//!             });
//!             Ok(())
//!         })
//!         .unwrap();
//!     engine.start().unwrap();
//!     (engine, grant)
//! }
//!
//! let (mut live, grant) = build();
//! live.record_transactions();
//! grant.add_to_pool(&live.pool(), &Grant { amount: 5 }, None).unwrap();
//! live.run_ticks(3).unwrap();
//!
//! let log = live.take_tx_log().unwrap();
//! let (mut restored, _) = build();
//! restored.recover(&log).unwrap();
//! assert_eq!(restored.current_tick(), 3);
//! assert_eq!(restored.world().state_hash().unwrap(), live.world().state_hash().unwrap());
//! ```

use serde::{Deserialize, Serialize};

use crate::pool::{MessageId, PooledTx, TxQueue};
use crate::tick::{Engine, TickPhase};
use crate::EngineError;

/// A transaction log that cannot be replayed.
#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error("recovery requires a world at tick 0, but this one is at tick {tick}")]
    WorldAlreadyAdvanced { tick: u64 },

    #[error("log is for namespace '{found}', engine is '{expected}'")]
    NamespaceMismatch { expected: String, found: String },

    #[error("batch for tick {tick} does not come after tick {previous}")]
    OutOfOrder { tick: u64, previous: u64 },

    #[error("batch for tick {batch} is older than the world's tick {current}")]
    BatchBehindWorld { batch: u64, current: u64 },

    #[error("transaction at tick {tick} uses unregistered message id {id}")]
    UnknownMessage { tick: u64, id: MessageId },

    #[error("recovery requires an empty pool, found {0} pending transactions")]
    PendingTransactions(usize),

    #[error("stored world is at tick {current} but an interrupted tick {pending} is recorded")]
    PendingTickMismatch { pending: u64, current: u64 },

    #[error("malformed transaction log: {0}")]
    Json(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// TxLog
// ---------------------------------------------------------------------------

/// The transactions drained for one tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickBatch {
    pub tick: u64,
    /// Unix millis passed to systems during this tick.
    pub timestamp: u64,
    pub transactions: Vec<PooledTx>,
}

/// Ordered per-tick transaction batches of one world.
///
/// Batches are strictly increasing by tick. Ticks with no batch are replayed
/// as empty ticks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxLog {
    pub namespace: String,
    pub batches: Vec<TickBatch>,
}

impl TxLog {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            batches: Vec::new(),
        }
    }

    pub fn to_json(&self) -> Result<String, RecoveryError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, RecoveryError> {
        Ok(serde_json::from_str(text)?)
    }

    /// The tick after the last batch, or 0 for an empty log.
    pub fn end_tick(&self) -> u64 {
        self.batches.last().map_or(0, |b| b.tick + 1)
    }

    pub fn transaction_count(&self) -> usize {
        self.batches.iter().map(|b| b.transactions.len()).sum()
    }
}

// ---------------------------------------------------------------------------
// TxLogRecorder
// ---------------------------------------------------------------------------

/// Builds a [`TxLog`] as ticks execute.
#[derive(Debug)]
pub struct TxLogRecorder {
    log: TxLog,
}

impl TxLogRecorder {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            log: TxLog::new(namespace),
        }
    }

    /// Append one tick. Ticks must be recorded in increasing order.
    pub fn record(&mut self, tick: u64, timestamp: u64, txs: &TxQueue) {
        debug_assert!(
            self.log.batches.last().map_or(true, |b| b.tick < tick),
            "tick {tick} recorded out of order"
        );
        self.log.batches.push(TickBatch {
            tick,
            timestamp,
            transactions: txs.transactions().to_vec(),
        });
    }

    pub fn log(&self) -> &TxLog {
        &self.log
    }

    pub fn finish(self) -> TxLog {
        self.log
    }
}

// ---------------------------------------------------------------------------
// Engine::recover
// ---------------------------------------------------------------------------

impl Engine {
    /// Check that `log` can be replayed onto this engine as it stands.
    fn validate_log(&self, log: &TxLog) -> Result<(), RecoveryError> {
        if self.current_tick() > 0 {
            return Err(RecoveryError::WorldAlreadyAdvanced {
                tick: self.current_tick(),
            });
        }
        if log.namespace != self.namespace() {
            return Err(RecoveryError::NamespaceMismatch {
                expected: self.namespace().to_owned(),
                found: log.namespace.clone(),
            });
        }
        let pending = self.pool().count_pending();
        if pending > 0 {
            return Err(RecoveryError::PendingTransactions(pending));
        }

        let mut previous: Option<u64> = None;
        for batch in &log.batches {
            if let Some(previous) = previous.filter(|p| *p >= batch.tick) {
                return Err(RecoveryError::OutOfOrder {
                    tick: batch.tick,
                    previous,
                });
            }
            previous = Some(batch.tick);
            if let Some(tx) = batch
                .transactions
                .iter()
                .find(|tx| self.messages().get(tx.message_id).is_none())
            {
                return Err(RecoveryError::UnknownMessage {
                    tick: batch.tick,
                    id: tx.message_id,
                });
            }
        }
        Ok(())
    }

    /// Replay `log` from tick 0.
    ///
    /// Gaps between batches are filled with empty ticks stamped with the
    /// next batch's timestamp. The log is validated before any tick runs.
    /// Returns the number of ticks executed.
    pub fn recover(&mut self, log: &TxLog) -> Result<u64, EngineError> {
        if !self.is_started() {
            return Err(EngineError::NotStarted);
        }
        self.validate_log(log)?;

        tracing::info!(
            namespace = %log.namespace,
            batches = log.batches.len(),
            transactions = log.transaction_count(),
            "recovering from transaction log"
        );
        self.set_phase(TickPhase::Recovering);
        let result = self.replay_batches(log);
        self.set_phase(TickPhase::Idle);

        let ticks = result?;
        tracing::info!(tick = self.current_tick(), ticks, "recovery complete");
        Ok(ticks)
    }

    /// Re-run a tick that began against a durable store but never
    /// committed. Returns whether there was one.
    pub(crate) fn resume_pending_tick(&mut self) -> Result<bool, EngineError> {
        let Some((tick, bytes)) = self.world().pending_tick()? else {
            return Ok(false);
        };
        let batch: TickBatch = serde_json::from_slice(&bytes).map_err(RecoveryError::from)?;
        let current = self.current_tick();
        if tick != current || batch.tick != current {
            return Err(RecoveryError::PendingTickMismatch {
                pending: tick,
                current,
            }
            .into());
        }
        if let Some(tx) = batch
            .transactions
            .iter()
            .find(|tx| self.messages().get(tx.message_id).is_none())
        {
            return Err(RecoveryError::UnknownMessage {
                tick,
                id: tx.message_id,
            }
            .into());
        }

        tracing::info!(
            tick,
            tx_count = batch.transactions.len(),
            "resuming interrupted tick"
        );
        self.run_tick(
            TxQueue::new(batch.transactions),
            batch.timestamp,
            Default::default(),
        )?;
        Ok(true)
    }

    fn replay_batches(&mut self, log: &TxLog) -> Result<u64, EngineError> {
        let mut ticks = 0;
        for batch in &log.batches {
            if batch.tick < self.current_tick() {
                return Err(RecoveryError::BatchBehindWorld {
                    batch: batch.tick,
                    current: self.current_tick(),
                }
                .into());
            }
            while self.current_tick() < batch.tick {
                self.run_tick(TxQueue::default(), batch.timestamp, Default::default())?;
                ticks += 1;
            }
            let txs = TxQueue::new(batch.transactions.clone());
            self.run_tick(txs, batch.timestamp, Default::default())?;
            ticks += 1;
        }
        Ok(ticks)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
