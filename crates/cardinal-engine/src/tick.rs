//! The tick engine.
//!
//! [`Engine`] owns the [`World`], the message registry, the receipt history
//! and the ordered list of systems. Each tick:
//!
//! 1. The transaction pool is drained (one lock swap; submitters are never
//!    blocked by system execution). Durable stores record the drained batch
//!    as the tick in progress.
//! 2. Every system runs once, in registration order, with a [`WorldContext`]
//!    exposing the world, the drained transactions and the receipts.
//! 3. The world is committed, the tick counter advances and the receipt
//!    history rotates.
//!
//! A tick that fails anywhere is undone: the world rolls back to the last
//! commit, the tick's receipts are dropped and its transactions go back to
//! the head of the pool. The error is returned and the same tick number is
//! attempted again on the next call.
//!
//! Systems see a per-tick RNG seeded from the namespace and tick number and
//! the tick's timestamp, which the transaction log records. Replaying the log
//! through the same systems therefore reproduces the same state.
//!
//! # Example
//!
//! ```
//! use cardinal_engine::prelude::*;
//!
//! #[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
//! struct Score(u32);
//!
//! let mut engine = Engine::new(EngineConfig::default()).unwrap();
//! engine.register_component::<Score>("Score").unwrap();
//! engine
//!     .register_system("bump", |ctx| {
//!         let score = ctx.world().component_id::<Score>()?;
//!         for entity in Search::new(filter::contains([score])).collect(ctx.world())? {
//!             ctx.world_mut().update_component::<Score, _>(entity, |s| s.0 += 1)?;
//!         }
//!         Ok(())
//!     })
//!     .unwrap();
//! engine.start().unwrap();
//!
//! let entity = engine.world_mut().create(ComponentBundle::new().with(Score(0))).unwrap();
//! engine.run_ticks(3).unwrap();
//!
//! assert_eq!(engine.current_tick(), 3);
//! assert_eq!(engine.world().get_component::<Score>(entity).unwrap(), Score(3));
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use cardinal_ecs::prelude::*;
use rand::SeedableRng;
use rand_pcg::Pcg64;

use crate::config::EngineConfig;
use crate::message::{Message, MessageRegistry, MessageType};
use crate::nonce::NonceStore;
use crate::pool::{MessageId, SignedEnvelope, TxHash, TxPool, TxQueue};
use crate::receipt::{Receipt, ReceiptError, ReceiptHistory};
use crate::recovery::{RecoveryError, TickBatch, TxLog, TxLogRecorder};
use crate::EngineError;

// ---------------------------------------------------------------------------
// TickPhase
// ---------------------------------------------------------------------------

/// Where the engine is in its tick cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickPhase {
    Idle,
    /// Replaying persisted or logged state before normal operation.
    Recovering,
    Draining,
    Executing,
    Committing,
}

// ---------------------------------------------------------------------------
// TickDiagnostics / TickReport
// ---------------------------------------------------------------------------

/// Timing diagnostics for the last tick.
#[derive(Debug, Clone, Default)]
pub struct TickDiagnostics {
    /// Wall-clock time per system (in order of execution).
    pub system_times: Vec<(String, Duration)>,
    /// Total time for the tick.
    pub total_time: Duration,
    /// Time spent swapping the pool out.
    pub drain_time: Duration,
    /// Time spent persisting the world.
    pub commit_time: Duration,
}

/// Summary of one executed tick.
#[derive(Debug, Clone)]
pub struct TickReport {
    /// The tick that ran (the counter value before it advanced).
    pub tick: u64,
    pub tx_count: usize,
    /// Events emitted by systems, in emission order.
    pub events: Vec<serde_json::Value>,
    pub diagnostics: TickDiagnostics,
}

// ---------------------------------------------------------------------------
// WorldContext
// ---------------------------------------------------------------------------

/// Everything a system can touch during one tick.
pub struct WorldContext<'a> {
    world: &'a mut World,
    txs: &'a TxQueue,
    receipts: &'a mut ReceiptHistory,
    namespace: &'a str,
    tick: u64,
    timestamp: u64,
    rng: Pcg64,
    events: Vec<serde_json::Value>,
}

impl<'a> WorldContext<'a> {
    pub fn world(&self) -> &World {
        &*self.world
    }

    pub fn world_mut(&mut self) -> &mut World {
        &mut *self.world
    }

    /// Transactions drained for this tick.
    pub fn tx_queue(&self) -> &TxQueue {
        self.txs
    }

    pub fn current_tick(&self) -> u64 {
        self.tick
    }

    /// Tick start time in unix milliseconds.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn namespace(&self) -> &str {
        self.namespace
    }

    /// Deterministic RNG for this tick.
    pub fn rng(&mut self) -> &mut Pcg64 {
        &mut self.rng
    }

    pub fn set_result(&mut self, hash: &TxHash, result: serde_json::Value) {
        self.receipts.set_result(hash, result);
    }

    pub fn add_error(&mut self, hash: &TxHash, error: impl Into<String>) {
        self.receipts.add_error(hash, error);
    }

    /// Receipt recorded so far this tick.
    pub fn receipt(&self, hash: &TxHash) -> Option<&Receipt> {
        self.receipts.get_receipt(hash)
    }

    pub fn receipts_for_tick(&self, tick: u64) -> Result<Vec<Receipt>, ReceiptError> {
        self.receipts.get_receipts_for_tick(tick)
    }

    /// Publish an event; returned in the tick's [`TickReport`].
    pub fn emit_event(&mut self, event: serde_json::Value) {
        tracing::debug!(tick = self.tick, %event, "event emitted");
        self.events.push(event);
    }
}

/// RNG seeded from BLAKE3 of the namespace and tick number.
fn tick_rng(namespace: &str, tick: u64) -> Pcg64 {
    let seed = blake3::Hasher::new()
        .update(namespace.as_bytes())
        .update(&tick.to_le_bytes())
        .finalize();
    Pcg64::from_seed(*seed.as_bytes())
}

fn unix_millis_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Systems
// ---------------------------------------------------------------------------

/// A system: game logic run once per tick.
pub type SystemFn = Box<dyn FnMut(&mut WorldContext<'_>) -> anyhow::Result<()> + Send>;

struct RegisteredSystem {
    name: String,
    func: SystemFn,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The deterministic tick engine.
///
/// Lifecycle: `new` → `register_*` → [`start`](Self::start) →
/// [`tick`](Self::tick)* → [`shutdown`](Self::shutdown). Registration is
/// closed once the engine has started.
pub struct Engine {
    config: EngineConfig,
    world: World,
    messages: MessageRegistry,
    pool: TxPool,
    receipts: ReceiptHistory,
    /// Ordered list of systems to run each tick.
    systems: Vec<RegisteredSystem>,
    /// Runs once, before the systems of tick 0.
    init_system: Option<RegisteredSystem>,
    nonces: Option<Arc<NonceStore>>,
    recorder: Option<TxLogRecorder>,
    tick_counter: u64,
    phase: TickPhase,
    started: bool,
    last_diagnostics: TickDiagnostics,
}

impl Engine {
    /// An engine over an in-memory world.
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        Self::with_world(config, World::new())
    }

    /// An engine over a world backed by `store`.
    pub fn with_store(
        config: EngineConfig,
        store: Box<dyn ColumnStore>,
    ) -> Result<Self, EngineError> {
        Self::with_world(config, World::with_store(store))
    }

    fn with_world(config: EngineConfig, world: World) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(Self {
            receipts: ReceiptHistory::new(0, config.receipt_history_size),
            config,
            world,
            messages: MessageRegistry::new(),
            pool: TxPool::new(),
            systems: Vec::new(),
            init_system: None,
            nonces: None,
            recorder: None,
            tick_counter: 0,
            phase: TickPhase::Idle,
            started: false,
            last_diagnostics: TickDiagnostics::default(),
        })
    }

    /// Attach a nonce store for signed submissions.
    pub fn with_nonce_store(mut self, nonces: NonceStore) -> Self {
        self.nonces = Some(Arc::new(nonces));
        self
    }

    fn ensure_open(&self, kind: &'static str, name: &str) -> Result<(), EngineError> {
        if self.started {
            return Err(EngineError::RegistrationClosed {
                kind,
                name: name.to_owned(),
            });
        }
        Ok(())
    }

    // -- registration --------------------------------------------------------

    pub fn register_component<T: Component>(
        &mut self,
        name: &str,
    ) -> Result<ComponentTypeId, EngineError> {
        self.ensure_open("component", name)?;
        Ok(self.world.register_component::<T>(name)?)
    }

    pub fn register_message<In: Message, Out: Message>(
        &mut self,
        name: &str,
    ) -> Result<MessageType<In, Out>, EngineError> {
        self.ensure_open("message", name)?;
        self.messages.register::<In, Out>(name)
    }

    /// Register a system to be run each tick.
    ///
    /// Systems are executed in the order they are registered.
    pub fn register_system<F>(&mut self, name: &str, func: F) -> Result<(), EngineError>
    where
        F: FnMut(&mut WorldContext<'_>) -> anyhow::Result<()> + Send + 'static,
    {
        self.ensure_open("system", name)?;
        let taken = self.systems.iter().any(|s| s.name == name)
            || self.init_system.as_ref().is_some_and(|s| s.name == name);
        if taken {
            return Err(EngineError::DuplicateSystem(name.to_owned()));
        }
        self.systems.push(RegisteredSystem {
            name: name.to_owned(),
            func: Box::new(func),
        });
        Ok(())
    }

    /// Register the system that runs once before tick 0's systems.
    pub fn register_init_system<F>(&mut self, name: &str, func: F) -> Result<(), EngineError>
    where
        F: FnMut(&mut WorldContext<'_>) -> anyhow::Result<()> + Send + 'static,
    {
        self.ensure_open("system", name)?;
        if self.init_system.is_some() || self.systems.iter().any(|s| s.name == name) {
            return Err(EngineError::DuplicateSystem(name.to_owned()));
        }
        self.init_system = Some(RegisteredSystem {
            name: name.to_owned(),
            func: Box::new(func),
        });
        Ok(())
    }

    /// Start keeping a [`TxLog`] of every executed tick.
    pub fn record_transactions(&mut self) {
        if self.recorder.is_none() {
            self.recorder = Some(TxLogRecorder::new(self.config.namespace.clone()));
        }
    }

    // -- lifecycle -----------------------------------------------------------

    /// Close registration and load persisted world state, if any.
    ///
    /// A tick that began against a durable store but never committed is run
    /// again from its recorded inputs. Returns the tick restored from
    /// storage.
    pub fn start(&mut self) -> Result<Option<u64>, EngineError> {
        if self.started {
            return Err(EngineError::AlreadyStarted);
        }

        self.phase = TickPhase::Recovering;
        let restored = self.restore();
        self.phase = TickPhase::Idle;
        let loaded = restored?;

        if self.world.registry().is_empty() {
            tracing::warn!("no components registered");
        }
        if self.messages.is_empty() {
            tracing::warn!("no messages registered");
        }
        if self.systems.is_empty() && self.init_system.is_none() {
            tracing::warn!("no systems registered");
        }

        self.started = true;
        tracing::info!(
            namespace = %self.config.namespace,
            tick = self.tick_counter,
            systems = self.systems.len(),
            messages = self.messages.len(),
            restored = loaded.is_some(),
            "engine started"
        );
        Ok(loaded)
    }

    fn restore(&mut self) -> Result<Option<u64>, EngineError> {
        let loaded = self.world.load()?;
        if let Some(tick) = loaded {
            self.tick_counter = tick;
            self.receipts = ReceiptHistory::new(tick, self.config.receipt_history_size);
        }
        if self.resume_pending_tick()? {
            return Ok(Some(self.tick_counter));
        }
        Ok(loaded)
    }

    /// Run a final tick if transactions are still pending, then close.
    pub fn shutdown(&mut self) -> Result<(), EngineError> {
        if !self.started {
            return Ok(());
        }
        let pending = self.pool.count_pending();
        if pending > 0 {
            tracing::info!(pending, "processing pending transactions before shutdown");
            self.tick()?;
        }
        self.started = false;
        tracing::info!(tick = self.tick_counter, "engine shut down");
        Ok(())
    }

    // -- submission ----------------------------------------------------------

    /// Cloneable pool handle for submitting from other threads.
    pub fn pool(&self) -> TxPool {
        self.pool.clone()
    }

    /// Queue an already-encoded transaction by message id.
    pub fn add_transaction(
        &self,
        message_id: MessageId,
        payload: Vec<u8>,
        envelope: Option<SignedEnvelope>,
    ) -> Result<TxHash, EngineError> {
        if self.messages.get(message_id).is_none() {
            return Err(EngineError::UnknownMessageId(message_id));
        }
        Ok(self.pool.add(message_id, payload, envelope))
    }

    /// Shared handle to the nonce store, for submission handlers.
    pub fn nonce_store(&self) -> Option<Arc<NonceStore>> {
        self.nonces.clone()
    }

    /// Claim a signer's nonce.
    pub fn use_nonce(&self, signer: &str, nonce: u64) -> Result<(), EngineError> {
        let nonces = self.nonces.as_ref().ok_or(EngineError::NoNonceStore)?;
        Ok(nonces.use_nonce(signer, nonce)?)
    }

    // -- ticking -------------------------------------------------------------

    /// Execute one tick stamped with the current wall-clock time.
    pub fn tick(&mut self) -> Result<TickReport, EngineError> {
        self.tick_at(unix_millis_now())
    }

    /// Execute one tick with an explicit timestamp (unix millis).
    pub fn tick_at(&mut self, timestamp: u64) -> Result<TickReport, EngineError> {
        if !self.started {
            return Err(EngineError::NotStarted);
        }
        self.phase = TickPhase::Draining;
        let drain_start = Instant::now();
        let txs = self.pool.drain();
        let drain_time = drain_start.elapsed();
        self.run_tick(txs, timestamp, drain_time)
    }

    /// Execute ticks back to back.
    pub fn run_ticks(&mut self, count: u64) -> Result<(), EngineError> {
        for _ in 0..count {
            self.tick()?;
        }
        Ok(())
    }

    /// Run systems over `txs` and commit. Shared by live ticks and recovery.
    pub(crate) fn run_tick(
        &mut self,
        txs: TxQueue,
        timestamp: u64,
        drain_time: Duration,
    ) -> Result<TickReport, EngineError> {
        let tick = self.tick_counter;
        let tick_start = Instant::now();
        let restore_phase = if self.phase == TickPhase::Recovering {
            TickPhase::Recovering
        } else {
            TickPhase::Idle
        };
        tracing::debug!(tick, tx_count = txs.len(), "tick started");

        if let Err(err) = self.begin_tick(tick, timestamp, &txs) {
            tracing::error!(tick, error = %err, "could not record tick start; tick aborted");
            return Err(self.abort_tick(txs, restore_phase, err));
        }

        // Phase 1: Run all systems in registered order with timing.
        self.phase = TickPhase::Executing;
        let mut system_times = Vec::with_capacity(self.systems.len() + 1);
        let mut ctx = WorldContext {
            world: &mut self.world,
            txs: &txs,
            receipts: &mut self.receipts,
            namespace: &self.config.namespace,
            tick,
            timestamp,
            rng: tick_rng(&self.config.namespace, tick),
            events: Vec::new(),
        };
        let init = if tick == 0 { self.init_system.as_mut() } else { None };
        let mut failure = None;
        for system in init.into_iter().chain(self.systems.iter_mut()) {
            let sys_start = Instant::now();
            if let Err(err) = (system.func)(&mut ctx) {
                let reason = format!("{err:#}");
                tracing::error!(tick, system = %system.name, error = %reason, "system failed; tick aborted");
                failure = Some(EngineError::System {
                    system: system.name.clone(),
                    tick,
                    source: err.into(),
                });
                break;
            }
            system_times.push((system.name.clone(), sys_start.elapsed()));
        }
        let events = ctx.events;
        if let Some(err) = failure {
            return Err(self.abort_tick(txs, restore_phase, err));
        }

        // Phase 2: Persist the world tagged with the next tick.
        self.phase = TickPhase::Committing;
        let commit_start = Instant::now();
        let next = tick + 1;
        if let Err(err) = self.world.commit(next) {
            tracing::error!(tick, error = %err, "commit failed; tick aborted");
            return Err(self.abort_tick(txs, restore_phase, err.into()));
        }
        let commit_time = commit_start.elapsed();
        if let Some(recorder) = self.recorder.as_mut() {
            recorder.record(tick, timestamp, &txs);
        }

        // Phase 3: Advance tick counter and receipts.
        self.tick_counter = next;
        self.receipts.advance();
        self.phase = restore_phase;

        let diagnostics = TickDiagnostics {
            system_times,
            total_time: tick_start.elapsed() + drain_time,
            drain_time,
            commit_time,
        };
        let elapsed_ms = diagnostics.total_time.as_secs_f64() * 1000.0;
        if diagnostics.total_time > self.config.tick_warning_threshold {
            tracing::warn!(
                tick,
                tx_count = txs.len(),
                elapsed_ms,
                threshold_ms = self.config.tick_warning_threshold.as_millis() as u64,
                "tick exceeded warning threshold"
            );
        } else {
            tracing::info!(tick, tx_count = txs.len(), elapsed_ms, "tick completed");
        }

        self.last_diagnostics = diagnostics.clone();
        Ok(TickReport {
            tick,
            tx_count: txs.len(),
            events,
            diagnostics,
        })
    }

    /// Commit work done outside any tick and, for durable stores, record
    /// this tick's inputs so a crash before its commit can be resumed.
    fn begin_tick(&mut self, tick: u64, timestamp: u64, txs: &TxQueue) -> Result<(), EngineError> {
        let mut batch = Vec::new();
        if self.world.is_durable() {
            let pending = TickBatch {
                tick,
                timestamp,
                transactions: txs.transactions().to_vec(),
            };
            batch = serde_json::to_vec(&pending).map_err(RecoveryError::from)?;
        }
        self.world.begin_tick(tick, &batch)?;
        Ok(())
    }

    /// Undo a tick that did not complete and hand back `err`.
    ///
    /// Live ticks return their transactions to the head of the pool.
    /// Replayed ticks do not; their inputs live in the log or the store.
    fn abort_tick(
        &mut self,
        txs: TxQueue,
        restore_phase: TickPhase,
        err: EngineError,
    ) -> EngineError {
        self.world.rollback();
        self.receipts.discard_current();
        if restore_phase != TickPhase::Recovering {
            tracing::warn!(
                tick = self.tick_counter,
                requeued = txs.len(),
                "tick rolled back"
            );
            self.pool.requeue(txs);
        }
        self.phase = restore_phase;
        err
    }

    pub(crate) fn set_phase(&mut self, phase: TickPhase) {
        self.phase = phase;
    }

    // -- accessors ----------------------------------------------------------

    /// The next tick to execute (number of ticks executed so far).
    pub fn current_tick(&self) -> u64 {
        self.tick_counter
    }

    pub fn phase(&self) -> TickPhase {
        self.phase
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn namespace(&self) -> &str {
        &self.config.namespace
    }

    /// Read-only access to the ECS world.
    pub fn world(&self) -> &World {
        &self.world
    }

    /// Mutable access to the ECS world, for setup and tests.
    pub fn world_mut(&mut self) -> &mut World {
        &mut self.world
    }

    pub fn messages(&self) -> &MessageRegistry {
        &self.messages
    }

    pub fn receipts(&self) -> &ReceiptHistory {
        &self.receipts
    }

    /// Receipts of a completed tick, sorted by transaction hash.
    pub fn get_receipts_for_tick(&self, tick: u64) -> Result<Vec<Receipt>, EngineError> {
        Ok(self.receipts.get_receipts_for_tick(tick)?)
    }

    /// The number of registered systems, not counting the init system.
    pub fn system_count(&self) -> usize {
        self.systems.len()
    }

    /// The names of all registered systems, in execution order.
    pub fn system_names(&self) -> Vec<&str> {
        self.init_system
            .iter()
            .chain(self.systems.iter())
            .map(|s| s.name.as_str())
            .collect()
    }

    /// Diagnostics from the last tick (timing per system).
    pub fn last_diagnostics(&self) -> &TickDiagnostics {
        &self.last_diagnostics
    }

    /// The transaction log recorded so far, if recording is on.
    pub fn tx_log(&self) -> Option<&TxLog> {
        self.recorder.as_ref().map(TxLogRecorder::log)
    }

    /// Stop recording and return the log.
    pub fn take_tx_log(&mut self) -> Option<TxLog> {
        self.recorder.take().map(TxLogRecorder::finish)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
