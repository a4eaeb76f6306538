//! Per-slot agent status and its fan-out to control clients.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::{
    helpers::now_ms,
    parser::PromptInfo,
    protocol::{AgentStatusFrame, ServerMessage},
    Slot,
};

pub type ClientId = u64;

pub const DEFAULT_MESSAGE: &str = "Waiting for activity...";

pub fn default_agent_name(slot: Slot) -> String {
    if slot == 0 {
        "claude".to_string()
    } else {
        format!("agent-{slot}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Idle,
    Working,
    Waiting,
    Error,
    Done,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatus {
    pub name: String,
    pub state: AgentState,
    pub progress: i32,
    pub message: String,
    pub last_update: i64,
    pub context_percent: u8,
    pub prompt_tool_type: Option<String>,
    pub prompt_tool_detail: Option<String>,
    pub prompt_description: Option<String>,
    pub slot: Slot,
    pub active: bool,
}

impl AgentStatus {
    pub fn new(slot: Slot) -> Self {
        Self {
            name: default_agent_name(slot),
            state: AgentState::Idle,
            progress: -1,
            message: DEFAULT_MESSAGE.to_string(),
            last_update: now_ms(),
            context_percent: 0,
            prompt_tool_type: None,
            prompt_tool_detail: None,
            prompt_description: None,
            slot,
            active: false,
        }
    }

    fn set_prompt(&mut self, prompt: Option<PromptInfo>) {
        match prompt {
            Some(info) => {
                self.prompt_tool_type = Some(info.tool_type);
                self.prompt_tool_detail = Some(info.tool_detail);
                self.prompt_description = Some(info.description);
            }
            None => {
                self.prompt_tool_type = None;
                self.prompt_tool_detail = None;
                self.prompt_description = None;
            }
        }
    }

    fn frame(&self, auto_edit: bool) -> ServerMessage {
        ServerMessage::AgentStatus(AgentStatusFrame {
            agent: self.name.clone(),
            state: self.state,
            progress: self.progress,
            message: self.message.clone(),
            context_percent: self.context_percent,
            prompt_tool_type: self.prompt_tool_type.clone(),
            prompt_tool_detail: self.prompt_tool_detail.clone(),
            prompt_description: self.prompt_description.clone(),
            auto_edit,
            slot: self.slot,
            active: self.active,
        })
    }
}

/// Partial status; unset fields keep their current value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusUpdate {
    pub name: Option<String>,
    pub state: Option<AgentState>,
    pub message: Option<String>,
    pub context_percent: Option<u8>,
    pub prompt: Option<PromptInfo>,
    pub active: Option<bool>,
}

impl StatusUpdate {
    pub fn state(state: AgentState) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn prompt(mut self, prompt: PromptInfo) -> Self {
        self.prompt = Some(prompt);
        self
    }

    pub fn active(mut self, active: bool) -> Self {
        self.active = Some(active);
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn context_percent(mut self, percent: u8) -> Self {
        self.context_percent = Some(percent);
        self
    }
}

#[derive(Debug)]
pub struct StateBroadcaster {
    statuses: Vec<AgentStatus>,
    clients: HashMap<ClientId, mpsc::UnboundedSender<String>>,
    auto_edit: bool,
}

impl StateBroadcaster {
    pub fn new(max_slots: usize, auto_edit: bool) -> Self {
        Self {
            statuses: (0..max_slots).map(AgentStatus::new).collect(),
            clients: HashMap::new(),
            auto_edit,
        }
    }

    pub fn status(&self, slot: Slot) -> Option<&AgentStatus> {
        self.statuses.get(slot)
    }

    pub fn statuses(&self) -> &[AgentStatus] {
        &self.statuses
    }

    pub fn auto_edit(&self) -> bool {
        self.auto_edit
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Merge `update` into the slot's status, stamp it and push it to every
    /// client. The prompt fields are only ever present while `waiting`.
    pub fn update_state(&mut self, slot: Slot, update: StatusUpdate) {
        let Some(status) = self.statuses.get_mut(slot) else {
            tracing::warn!(target = "companion_broker::status", slot, "status update for unknown slot");
            return;
        };

        if let Some(name) = update.name {
            status.name = name;
        }
        if let Some(state) = update.state {
            status.state = state;
        }
        if let Some(message) = update.message {
            status.message = message;
        }
        if let Some(percent) = update.context_percent {
            status.context_percent = percent.min(100);
        }
        if let Some(active) = update.active {
            status.active = active;
        }

        if status.state == AgentState::Waiting {
            if update.prompt.is_some() {
                status.set_prompt(update.prompt);
            } else if status.prompt_tool_type.is_none() {
                status.set_prompt(Some(PromptInfo::placeholder()));
            }
        } else {
            status.set_prompt(None);
        }
        status.last_update = now_ms();

        self.broadcast_slot(slot);
    }

    /// Context usage changes often and usually by nothing; only push real changes.
    pub fn update_context_percent(&mut self, slot: Slot, percent: u8) {
        let percent = percent.min(100);
        match self.statuses.get(slot) {
            Some(status) if status.context_percent != percent => {
                self.update_state(slot, StatusUpdate::default().context_percent(percent));
            }
            _ => {}
        }
    }

    pub fn set_auto_edit(&mut self, enabled: bool) {
        self.auto_edit = enabled;
        tracing::info!(target = "companion_broker::status", auto_edit = enabled, "auto-edit toggled");
        self.broadcast_active();
    }

    pub fn spawn_result(&mut self, slot: Slot, success: bool, error: Option<String>) {
        self.broadcast(&ServerMessage::SpawnResult {
            slot,
            success,
            error,
        });
    }

    /// Register a client and bring it up to date with every slot.
    pub fn add_client(&mut self, id: ClientId, tx: mpsc::UnboundedSender<String>) {
        for status in &self.statuses {
            let Ok(text) = serde_json::to_string(&status.frame(self.auto_edit)) else {
                continue;
            };
            if tx.send(text).is_err() {
                return;
            }
        }
        self.clients.insert(id, tx);
        tracing::info!(target = "companion_broker::status", client = id, clients = self.clients.len(), "control client connected");
    }

    pub fn remove_client(&mut self, id: ClientId) {
        if self.clients.remove(&id).is_some() {
            tracing::info!(target = "companion_broker::status", client = id, clients = self.clients.len(), "control client disconnected");
        }
    }

    pub fn broadcast_slot(&mut self, slot: Slot) {
        if let Some(status) = self.statuses.get(slot) {
            let frame = status.frame(self.auto_edit);
            self.broadcast(&frame);
        }
    }

    fn broadcast_active(&mut self) {
        let frames: Vec<ServerMessage> = self
            .statuses
            .iter()
            .filter(|status| status.active)
            .map(|status| status.frame(self.auto_edit))
            .collect();
        for frame in &frames {
            self.broadcast(frame);
        }
    }

    fn broadcast(&mut self, message: &ServerMessage) {
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(error) => {
                tracing::error!(target = "companion_broker::status", error = %error, "failed to encode server message");
                return;
            }
        };
        self.clients.retain(|id, tx| {
            let delivered = tx.send(text.clone()).is_ok();
            if !delivered {
                tracing::debug!(target = "companion_broker::status", client = id, "dropping unreachable control client");
            }
            delivered
        });
    }
}
