//! Cardinal Engine -- deterministic tick engine for game servers.
//!
//! This crate builds on [`cardinal_ecs`] to provide the simulation driver:
//! a transaction pool fed by any number of submitters, typed messages, a
//! tick loop that runs systems in a fixed order over each tick's drained
//! transactions, bounded receipt history, nonce-based replay protection, and
//! recovery by replaying a recorded transaction log.
//!
//! # Quick Start
//!
//! ```
//! use cardinal_engine::prelude::*;
//!
//! #[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
//! struct Health { value: i64 }
//!
//! #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
//! struct Heal { target: EntityId, amount: i64 }
//!
//! let mut engine = Engine::new(EngineConfig::default()).unwrap();
//! engine.register_component::<Health>("Health").unwrap();
//! let heal = engine.register_message::<Heal, i64>("heal").unwrap();
//! engine
//!     .register_system("healing", move |ctx| {
//!         heal.each(ctx, |ctx, tx| {
//!             ctx.world_mut()
//!                 .update_component::<Health, _>(tx.msg.target, |h| h.value += tx.msg.amount)?;
//!             Ok(ctx.world().get_component::<Health>(tx.msg.target)?.value)
//!         });
//!         Ok(())
//!     })
//!     .unwrap();
//! engine.start().unwrap();
//!
//! let hero = engine.world_mut().create(ComponentBundle::new().with(Health::default())).unwrap();
//! let hash = heal.add_to_pool(&engine.pool(), &Heal { target: hero, amount: 7 }, None).unwrap();
//! engine.tick().unwrap();
//!
//! let receipts = engine.get_receipts_for_tick(0).unwrap();
//! assert_eq!(receipts[0].tx_hash, hash);
//! assert_eq!(receipts[0].result, Some(serde_json::json!(7)));
//! ```

#![deny(unsafe_code)]

pub mod config;
pub mod game_loop;
pub mod logging;
pub mod message;
pub mod nonce;
pub mod pool;
pub mod receipt;
pub mod recovery;
pub mod tick;

use cardinal_ecs::EcsError;

use config::ConfigError;
use nonce::NonceError;
use pool::MessageId;
use receipt::ReceiptError;
use recovery::RecoveryError;

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

/// Re-export the ECS crate for convenience.
pub use cardinal_ecs;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by the engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Ecs(#[from] EcsError),

    /// A system returned an error; the tick was aborted.
    #[error("system '{system}' failed during tick {tick}: {source}")]
    System {
        system: String,
        tick: u64,
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("system '{0}' is already registered")]
    DuplicateSystem(String),

    #[error("message '{0}' is already registered")]
    DuplicateMessage(String),

    #[error("invalid message name '{0}': expected [group.]name using A-Z, a-z, 0-9 and '-'")]
    InvalidMessageName(String),

    #[error("message '{0}' is not registered")]
    UnknownMessage(String),

    #[error("message id {0} is not registered")]
    UnknownMessageId(MessageId),

    #[error("message '{0}' is registered with different payload or result types")]
    MessageTypeMismatch(String),

    #[error("failed to encode or decode message {message}: {details}")]
    Codec { message: MessageId, details: String },

    #[error("cannot register {kind} '{name}' after the engine has started")]
    RegistrationClosed { kind: &'static str, name: String },

    #[error("engine has not been started")]
    NotStarted,

    #[error("engine has already been started")]
    AlreadyStarted,

    #[error("no nonce store is configured")]
    NoNonceStore,

    #[error(transparent)]
    Nonce(#[from] NonceError),

    #[error(transparent)]
    Receipt(#[from] ReceiptError),

    #[error(transparent)]
    Recovery(#[from] RecoveryError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("game loop: {0}")]
    GameLoop(String),
}

impl EngineError {
    /// Whether this error means the engine cannot keep ticking as is.
    ///
    /// Lookup, nonce and receipt errors are answers for the caller; failed
    /// systems, storage failures, bad setup and broken logs are fatal.
    pub fn is_fatal(&self) -> bool {
        match self {
            EngineError::Ecs(err) => err.is_fatal(),
            EngineError::System { .. }
            | EngineError::Recovery(_)
            | EngineError::Config(_)
            | EngineError::GameLoop(_)
            | EngineError::DuplicateSystem(_)
            | EngineError::DuplicateMessage(_)
            | EngineError::InvalidMessageName(_)
            | EngineError::RegistrationClosed { .. } => true,
            EngineError::UnknownMessage(_)
            | EngineError::UnknownMessageId(_)
            | EngineError::MessageTypeMismatch(_)
            | EngineError::Codec { .. }
            | EngineError::NotStarted
            | EngineError::AlreadyStarted
            | EngineError::NoNonceStore
            | EngineError::Nonce(_)
            | EngineError::Receipt(_) => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common engine usage.
pub mod prelude {
    // Re-export everything from the ECS prelude.
    pub use cardinal_ecs::prelude::*;

    pub use crate::config::{EngineConfig, LogConfig};
    pub use crate::game_loop::GameLoop;
    pub use crate::logging::init_tracing;
    pub use crate::message::{Message, MessageRegistry, MessageType, TxData, TypedReceipt};
    pub use crate::nonce::{NonceError, NonceStore};
    pub use crate::pool::{MessageId, PooledTx, SignedEnvelope, TxHash, TxPool, TxQueue};
    pub use crate::receipt::{Receipt, ReceiptError, ReceiptHistory};
    pub use crate::recovery::{RecoveryError, TickBatch, TxLog, TxLogRecorder};
    pub use crate::tick::{
        Engine, SystemFn, TickDiagnostics, TickPhase, TickReport, WorldContext,
    };
    pub use crate::EngineError;
}
