//! Per-tick transaction receipts.
//!
//! [`ReceiptHistory`] is a ring of `ticks_to_store + 1` slots. The extra slot
//! belongs to the tick currently executing; results and errors can only be
//! written there. Advancing past the bound clears the oldest slot in one go.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::pool::TxHash;

/// Why receipts for a tick cannot be returned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReceiptError {
    #[error("tick {tick} has not been processed yet (current tick is {current})")]
    TickNotProcessed { tick: u64, current: u64 },

    #[error("receipts for tick {tick} have been discarded (current tick is {current})")]
    TickDiscarded { tick: u64, current: u64 },
}

/// Outcome of processing one transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub tx_hash: TxHash,
    pub result: Option<serde_json::Value>,
    pub errors: Vec<String>,
}

impl Receipt {
    fn empty(tx_hash: TxHash) -> Self {
        Self {
            tx_hash,
            result: None,
            errors: Vec::new(),
        }
    }
}

/// Bounded history of receipts, indexed by tick.
#[derive(Debug, Clone)]
pub struct ReceiptHistory {
    current_tick: u64,
    /// Slot count: ticks kept plus the one in progress.
    size: u64,
    slots: Vec<HashMap<TxHash, Receipt>>,
}

impl ReceiptHistory {
    /// Keep receipts of the last `ticks_to_store` completed ticks.
    pub fn new(current_tick: u64, ticks_to_store: u64) -> Self {
        let size = ticks_to_store.saturating_add(1);
        Self {
            current_tick,
            size,
            slots: (0..size).map(|_| HashMap::new()).collect(),
        }
    }

    /// Number of slots, including the one for the tick in progress.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn current_tick(&self) -> u64 {
        self.current_tick
    }

    fn slot_of(&self, tick: u64) -> usize {
        (tick % self.size) as usize
    }

    fn current_slot(&mut self) -> &mut HashMap<TxHash, Receipt> {
        let slot = self.slot_of(self.current_tick);
        &mut self.slots[slot]
    }

    /// Close the current tick and open the next, clearing the slot it reuses.
    pub fn advance(&mut self) {
        self.current_tick += 1;
        self.current_slot().clear();
    }

    /// Forget everything recorded for the current tick, which did not
    /// complete.
    pub fn discard_current(&mut self) {
        self.current_slot().clear();
    }

    /// Append an error to a transaction's receipt for the current tick.
    pub fn add_error(&mut self, hash: &TxHash, error: impl Into<String>) {
        self.current_slot()
            .entry(hash.clone())
            .or_insert_with(|| Receipt::empty(hash.clone()))
            .errors
            .push(error.into());
    }

    /// Set a transaction's result for the current tick, replacing any earlier
    /// result. Accumulated errors are kept.
    pub fn set_result(&mut self, hash: &TxHash, result: serde_json::Value) {
        self.current_slot()
            .entry(hash.clone())
            .or_insert_with(|| Receipt::empty(hash.clone()))
            .result = Some(result);
    }

    /// Receipt recorded for `hash` during the current tick.
    pub fn get_receipt(&self, hash: &TxHash) -> Option<&Receipt> {
        self.slots[self.slot_of(self.current_tick)].get(hash)
    }

    /// All receipts of a completed tick, sorted by transaction hash.
    pub fn get_receipts_for_tick(&self, tick: u64) -> Result<Vec<Receipt>, ReceiptError> {
        let current = self.current_tick;
        if tick >= current {
            return Err(ReceiptError::TickNotProcessed { tick, current });
        }
        if current - tick >= self.size {
            return Err(ReceiptError::TickDiscarded { tick, current });
        }
        let mut receipts: Vec<Receipt> =
            self.slots[self.slot_of(tick)].values().cloned().collect();
        receipts.sort_by(|a, b| a.tx_hash.cmp(&b.tx_hash));
        Ok(receipts)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
