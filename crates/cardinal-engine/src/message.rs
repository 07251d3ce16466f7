//! Typed message (transaction) definitions.
//!
//! A message type pairs an input payload `In` with a result type `Out`.
//! [`MessageRegistry::register`] hands out a [`MessageType`] handle that
//! systems use to read this tick's transactions and to record receipts.

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::LazyLock;

use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::pool::{MessageId, SignedEnvelope, TxHash, TxPool};
use crate::tick::WorldContext;
use crate::EngineError;

/// Group used when a message name has no `group.` prefix.
pub const DEFAULT_GROUP: &str = "game";

/// Anything that can travel through the pool as a message payload or result.
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T: Serialize + DeserializeOwned + Send + Sync + 'static> Message for T {}

// ---------------------------------------------------------------------------
// MessageInfo / MessageRegistry
// ---------------------------------------------------------------------------

/// Metadata of one registered message type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageInfo {
    pub id: MessageId,
    pub name: String,
    pub group: String,
    in_type: TypeId,
    out_type: TypeId,
}

impl MessageInfo {
    /// `group.name`, the key names are unique under.
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.group, self.name)
    }
}

static MESSAGE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:([a-zA-Z0-9-]+)\.)?([a-zA-Z0-9-]+)$").expect("message name pattern compiles")
});

/// Split `group.name` (or bare `name`), defaulting the group.
fn parse_name(full: &str) -> Option<(&str, &str)> {
    let caps = MESSAGE_NAME.captures(full)?;
    let group = caps.get(1).map_or(DEFAULT_GROUP, |m| m.as_str());
    let name = caps.get(2)?.as_str();
    Some((group, name))
}

/// All message types known to an engine.
#[derive(Debug, Default)]
pub struct MessageRegistry {
    /// Indexed by `MessageId - 1`.
    messages: Vec<MessageInfo>,
    by_full_name: HashMap<String, MessageId>,
}

impl MessageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a message type under `name` (`group.name` or `name`).
    pub fn register<In: Message, Out: Message>(
        &mut self,
        name: &str,
    ) -> Result<MessageType<In, Out>, EngineError> {
        let (group, short) =
            parse_name(name).ok_or_else(|| EngineError::InvalidMessageName(name.to_owned()))?;
        let full = format!("{group}.{short}");
        if self.by_full_name.contains_key(&full) {
            return Err(EngineError::DuplicateMessage(full));
        }

        let id = MessageId(self.messages.len() as u32 + 1);
        self.messages.push(MessageInfo {
            id,
            name: short.to_owned(),
            group: group.to_owned(),
            in_type: TypeId::of::<In>(),
            out_type: TypeId::of::<Out>(),
        });
        self.by_full_name.insert(full.clone(), id);
        tracing::debug!(message = %full, id = id.0, "registered message");
        Ok(MessageType::new(id))
    }

    pub fn get(&self, id: MessageId) -> Option<&MessageInfo> {
        (id.0 as usize)
            .checked_sub(1)
            .and_then(|index| self.messages.get(index))
    }

    /// Look up by `group.name`, or by bare name in the default group.
    pub fn get_by_name(&self, name: &str) -> Option<&MessageInfo> {
        let (group, short) = parse_name(name)?;
        self.by_full_name
            .get(&format!("{group}.{short}"))
            .and_then(|id| self.get(*id))
    }

    /// Recover a typed handle for a registered message.
    pub fn handle<In: Message, Out: Message>(
        &self,
        name: &str,
    ) -> Result<MessageType<In, Out>, EngineError> {
        let info = self
            .get_by_name(name)
            .ok_or_else(|| EngineError::UnknownMessage(name.to_owned()))?;
        if info.in_type != TypeId::of::<In>() || info.out_type != TypeId::of::<Out>() {
            return Err(EngineError::MessageTypeMismatch(info.full_name()));
        }
        Ok(MessageType::new(info.id))
    }

    pub fn list_all(&self) -> &[MessageInfo] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

// ---------------------------------------------------------------------------
// TxData / TypedReceipt
// ---------------------------------------------------------------------------

/// One decoded transaction of message type `In`.
#[derive(Debug, Clone, PartialEq)]
pub struct TxData<In> {
    pub hash: TxHash,
    pub msg: In,
    pub envelope: Option<SignedEnvelope>,
}

/// A receipt with its result decoded as `Out`.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedReceipt<Out> {
    pub result: Option<Out>,
    pub errors: Vec<String>,
}

// ---------------------------------------------------------------------------
// MessageType
// ---------------------------------------------------------------------------

/// Typed handle to a registered message. Cheap to copy into systems.
pub struct MessageType<In, Out> {
    id: MessageId,
    _marker: PhantomData<fn(In) -> Out>,
}

impl<In, Out> Clone for MessageType<In, Out> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<In, Out> Copy for MessageType<In, Out> {}

impl<In, Out> fmt::Debug for MessageType<In, Out> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MessageType").field(&self.id).finish()
    }
}

impl<In: Message, Out: Message> MessageType<In, Out> {
    fn new(id: MessageId) -> Self {
        Self {
            id,
            _marker: PhantomData,
        }
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    /// Encode `value` and queue it for the next tick.
    pub fn add_to_pool(
        &self,
        pool: &TxPool,
        value: &In,
        envelope: Option<SignedEnvelope>,
    ) -> Result<TxHash, EngineError> {
        let payload = serde_json::to_vec(value).map_err(|err| EngineError::Codec {
            message: self.id,
            details: err.to_string(),
        })?;
        Ok(pool.add(self.id, payload, envelope))
    }

    fn decode_all(&self, ctx: &WorldContext<'_>) -> Vec<Result<TxData<In>, (TxHash, String)>> {
        ctx.tx_queue()
            .for_id(self.id)
            .map(|tx| match serde_json::from_slice::<In>(&tx.payload) {
                Ok(msg) => Ok(TxData {
                    hash: tx.hash.clone(),
                    msg,
                    envelope: tx.envelope.clone(),
                }),
                Err(err) => Err((tx.hash.clone(), format!("failed to decode payload: {err}"))),
            })
            .collect()
    }

    /// This tick's transactions of this type, in submission order.
    ///
    /// Payloads that fail to decode are skipped with a warning; use
    /// [`each`](Self::each) to have them recorded as receipt errors.
    pub fn in_(&self, ctx: &WorldContext<'_>) -> Vec<TxData<In>> {
        self.decode_all(ctx)
            .into_iter()
            .filter_map(|decoded| match decoded {
                Ok(tx) => Some(tx),
                Err((hash, reason)) => {
                    tracing::warn!(tx_hash = %hash, message = self.id.0, %reason, "skipping transaction");
                    None
                }
            })
            .collect()
    }

    /// Run `handler` on every transaction of this type. `Ok` values become
    /// receipt results and `Err` values receipt errors.
    pub fn each<F>(&self, ctx: &mut WorldContext<'_>, mut handler: F)
    where
        F: FnMut(&mut WorldContext<'_>, TxData<In>) -> anyhow::Result<Out>,
    {
        for decoded in self.decode_all(ctx) {
            let tx = match decoded {
                Ok(tx) => tx,
                Err((hash, reason)) => {
                    ctx.add_error(&hash, reason);
                    continue;
                }
            };
            let hash = tx.hash.clone();
            match handler(ctx, tx) {
                Ok(out) => self.set_result(ctx, &hash, &out),
                Err(err) => {
                    let reason = format!("{err:#}");
                    tracing::warn!(tx_hash = %hash, message = self.id.0, error = %reason, "transaction failed");
                    ctx.add_error(&hash, reason);
                }
            }
        }
    }

    /// Record `result` for `hash`, replacing any earlier result.
    pub fn set_result(&self, ctx: &mut WorldContext<'_>, hash: &TxHash, result: &Out) {
        match serde_json::to_value(result) {
            Ok(value) => ctx.set_result(hash, value),
            Err(err) => ctx.add_error(hash, format!("failed to encode result: {err}")),
        }
    }

    pub fn add_error(&self, ctx: &mut WorldContext<'_>, hash: &TxHash, error: impl Into<String>) {
        ctx.add_error(hash, error);
    }

    /// The current tick's receipt for `hash`, with the result decoded.
    pub fn get_receipt(
        &self,
        ctx: &WorldContext<'_>,
        hash: &TxHash,
    ) -> Result<Option<TypedReceipt<Out>>, EngineError> {
        let Some(receipt) = ctx.receipt(hash) else {
            return Ok(None);
        };
        let result = receipt
            .result
            .clone()
            .map(serde_json::from_value::<Out>)
            .transpose()
            .map_err(|err| EngineError::Codec {
                message: self.id,
                details: err.to_string(),
            })?;
        Ok(Some(TypedReceipt {
            result,
            errors: receipt.errors.clone(),
        }))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
