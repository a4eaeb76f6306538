//! Slot-indexed registry of running agent sessions.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    adapter::{AdapterFactory, AdapterKind, AgentAdapter, SpawnOptions},
    error::BrokerError,
    protocol::DEFAULT_CONTEXT_WINDOW,
    Slot,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Spawning,
    Active,
    Idle,
    Ending,
}

pub struct ManagedSession {
    pub slot: Slot,
    /// Agent-assigned session id, learned from init or a hook callback.
    pub external_id: Option<String>,
    pub status: SessionStatus,
    pub last_activity: DateTime<Utc>,
    /// Distinguishes this process from earlier ones that used the same slot.
    pub epoch: u64,
    pub model: Option<String>,
    pub context_window: u64,
    pub adapter: Box<dyn AgentAdapter>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub slot: Slot,
    pub session_id: Option<String>,
    pub status: SessionStatus,
    pub adapter: AdapterKind,
    pub model: Option<String>,
    pub pid: Option<u32>,
    pub last_activity: DateTime<Utc>,
}

pub struct SessionRegistry {
    max_slots: usize,
    sessions: BTreeMap<Slot, ManagedSession>,
    by_external: HashMap<String, Slot>,
    factory: Box<dyn AdapterFactory>,
    next_epoch: u64,
}

impl SessionRegistry {
    pub fn new(max_slots: usize, factory: Box<dyn AdapterFactory>) -> Self {
        Self {
            max_slots,
            sessions: BTreeMap::new(),
            by_external: HashMap::new(),
            factory,
            next_epoch: 1,
        }
    }

    pub fn max_slots(&self) -> usize {
        self.max_slots
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn is_occupied(&self, slot: Slot) -> bool {
        self.sessions.contains_key(&slot)
    }

    pub fn session(&self, slot: Slot) -> Option<&ManagedSession> {
        self.sessions.get(&slot)
    }

    pub fn session_mut(&mut self, slot: Slot) -> Option<&mut ManagedSession> {
        self.sessions.get_mut(&slot)
    }

    pub fn adapter_mut(&mut self, slot: Slot) -> Option<&mut Box<dyn AgentAdapter>> {
        self.sessions.get_mut(&slot).map(|session| &mut session.adapter)
    }

    pub fn epoch_of(&self, slot: Slot) -> Option<u64> {
        self.sessions.get(&slot).map(|session| session.epoch)
    }

    pub fn find_free_slot(&self) -> Option<Slot> {
        (0..self.max_slots).find(|slot| !self.sessions.contains_key(slot))
    }

    /// Start an agent in `slot`. The slot stays free if the adapter fails
    /// to start.
    pub fn spawn_session(&mut self, slot: Slot, options: &SpawnOptions) -> Result<u64, BrokerError> {
        if slot >= self.max_slots {
            return Err(BrokerError::SlotOutOfRange {
                slot,
                max_slots: self.max_slots,
            });
        }
        if self.sessions.contains_key(&slot) {
            return Err(BrokerError::SlotOccupied(slot));
        }

        let epoch = self.next_epoch;
        self.next_epoch += 1;

        let mut adapter = self.factory.create(slot, epoch, options);
        adapter.start(options.initial_input.as_deref())?;

        tracing::info!(target = "companion_broker::session", slot, epoch, adapter = ?adapter.kind(), "session spawned");
        self.sessions.insert(
            slot,
            ManagedSession {
                slot,
                external_id: None,
                status: SessionStatus::Spawning,
                last_activity: Utc::now(),
                epoch,
                model: None,
                context_window: DEFAULT_CONTEXT_WINDOW,
                adapter,
            },
        );
        Ok(epoch)
    }

    /// Spawn into the lowest free slot.
    pub fn spawn_any(&mut self, options: &SpawnOptions) -> Result<(Slot, u64), BrokerError> {
        let slot = self.find_free_slot().ok_or(BrokerError::NoFreeSlot)?;
        let epoch = self.spawn_session(slot, options)?;
        Ok((slot, epoch))
    }

    /// Bind an agent session id to a slot. With no slot hint the id goes to
    /// the oldest session still waiting for one. Linking an id that is
    /// already bound returns its slot unchanged.
    pub fn link_session(&mut self, external_id: &str, slot_hint: Option<Slot>) -> Option<Slot> {
        if let Some(&slot) = self.by_external.get(external_id) {
            return Some(slot);
        }

        let slot = match slot_hint {
            Some(slot) if self.sessions.contains_key(&slot) => slot,
            Some(_) => return None,
            None => self
                .sessions
                .values()
                .filter(|s| s.status == SessionStatus::Spawning && s.external_id.is_none())
                .min_by_key(|s| s.epoch)
                .map(|s| s.slot)?,
        };

        let session = self.sessions.get_mut(&slot)?;
        if let Some(previous) = session.external_id.replace(external_id.to_string()) {
            self.by_external.remove(&previous);
        }
        if session.status == SessionStatus::Spawning {
            session.status = SessionStatus::Active;
        }
        session.last_activity = Utc::now();
        self.by_external.insert(external_id.to_string(), slot);
        tracing::info!(target = "companion_broker::session", slot, session_id = external_id, "session linked");
        Some(slot)
    }

    /// Slot for an inbound event: the linked slot if the id is known, else
    /// the oldest spawning session, else the only session, else slot 0.
    pub fn resolve_slot(&mut self, external_id: Option<&str>) -> Slot {
        let Some(id) = external_id.filter(|id| !id.is_empty()) else {
            return self.only_slot().unwrap_or(0);
        };
        if let Some(slot) = self.link_session(id, None) {
            return slot;
        }
        match self.only_slot() {
            Some(slot) => self.link_session(id, Some(slot)).unwrap_or(slot),
            None => 0,
        }
    }

    fn only_slot(&self) -> Option<Slot> {
        let mut slots = self.sessions.keys();
        match (slots.next(), slots.next()) {
            (Some(&slot), None) => Some(slot),
            _ => None,
        }
    }

    /// Record activity. A session stays `Spawning` until its external id is
    /// linked, so the agent's first hook can still find it.
    pub fn mark(&mut self, slot: Slot, status: SessionStatus) {
        if let Some(session) = self.sessions.get_mut(&slot) {
            let unlinked = session.status == SessionStatus::Spawning
                && session.external_id.is_none();
            if !unlinked || status == SessionStatus::Ending {
                session.status = status;
            }
            session.last_activity = Utc::now();
        }
    }

    pub fn touch(&mut self, slot: Slot) {
        if let Some(session) = self.sessions.get_mut(&slot) {
            session.last_activity = Utc::now();
        }
    }

    /// Stop and forget the slot's session. Returns false when it was empty.
    pub fn kill_session(&mut self, slot: Slot) -> bool {
        let Some(mut session) = self.sessions.remove(&slot) else {
            return false;
        };
        session.status = SessionStatus::Ending;
        if let Some(id) = &session.external_id {
            self.by_external.remove(id);
        }
        session.adapter.stop();
        tracing::info!(target = "companion_broker::session", slot, epoch = session.epoch, "session ended");
        true
    }

    /// Slots whose agent is no longer running.
    pub fn health_check(&mut self) -> Vec<Slot> {
        self.sessions
            .iter_mut()
            .filter_map(|(slot, session)| (!session.adapter.is_running()).then_some(*slot))
            .collect()
    }

    pub fn summaries(&self) -> Vec<SessionSummary> {
        self.sessions
            .values()
            .map(|session| SessionSummary {
                slot: session.slot,
                session_id: session.external_id.clone(),
                status: session.status,
                adapter: session.adapter.kind(),
                model: session.model.clone(),
                pid: session.adapter.pid(),
                last_activity: session.last_activity,
            })
            .collect()
    }

    pub fn shutdown_all(&mut self) -> usize {
        let slots: Vec<Slot> = self.sessions.keys().copied().collect();
        for slot in &slots {
            self.kill_session(*slot);
        }
        slots.len()
    }
}
