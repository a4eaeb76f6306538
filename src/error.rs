use thiserror::Error;

use crate::Slot;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("slot {slot} is out of range (max {max_slots} slots)")]
    SlotOutOfRange { slot: Slot, max_slots: usize },

    #[error("slot {0} already has an active session")]
    SlotOccupied(Slot),

    #[error("No free slots")]
    NoFreeSlot,

    #[error("failed to spawn agent in slot {slot}: {reason}")]
    Spawn { slot: Slot, reason: String },

    #[error("invalid agent command: {0}")]
    InvalidCommand(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl BrokerError {
    /// Slot the failure concerns, when it concerns one.
    pub fn slot(&self) -> Option<Slot> {
        match self {
            BrokerError::SlotOutOfRange { slot, .. }
            | BrokerError::SlotOccupied(slot)
            | BrokerError::Spawn { slot, .. } => Some(*slot),
            _ => None,
        }
    }
}
