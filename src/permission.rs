//! In-flight tool-use permission requests, one per slot.
//!
//! A request arrives from one of three places (a blocking hook call, the
//! agent's own stream, or a prompt scraped off a terminal pane) and its answer
//! travels back either through the slot's adapter or through the blocked hook
//! caller. Hook and stream details outrank the scraper: a screen prompt never
//! replaces a pending entry that came from either of them.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::{
    adapter::Decision,
    helpers::truncate,
    parser::{PromptInfo, PLACEHOLDER_DETAIL},
    protocol::{HookPayload, HookVerdict, ToolPermissionRequest, DENIED_BY_USER},
    session::SessionRegistry,
    status::{AgentState, StateBroadcaster, StatusUpdate},
    Slot,
};

const AUTO_EDIT_PATTERNS: &[&str] = &["edit", "write", "notebook"];
const DETAIL_KEYS: &[&str] = &["command", "file_path", "pattern", "query", "url"];
const MAX_DETAIL_BYTES: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptSource {
    Hook,
    Stream,
    Screen,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingPermission {
    pub request_id: String,
    pub slot: Slot,
    pub tool_name: String,
    pub tool_input: Value,
    pub tool_use_id: Option<String>,
    pub description: String,
    pub permission_suggestions: Option<Value>,
    pub source: PromptSource,
}

/// Where the decision for a pending request is delivered.
#[derive(Debug)]
pub enum Route {
    Adapter,
    /// A hook caller parked on this channel; dropping it reads as a denial.
    Hook(oneshot::Sender<HookVerdict>),
}

#[derive(Debug)]
struct Entry {
    permission: PendingPermission,
    prompt: PromptInfo,
    route: Route,
}

/// A tool-use request before it is admitted to the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolRequest {
    pub request_id: String,
    pub tool_name: String,
    pub tool_input: Value,
    pub tool_use_id: Option<String>,
    pub description: Option<String>,
    pub suggestions: Option<Value>,
    pub source: PromptSource,
    /// Display fields already known (screen prompts); derived otherwise.
    pub prompt: Option<PromptInfo>,
}

impl ToolRequest {
    pub fn from_stream(request: ToolPermissionRequest) -> Self {
        Self {
            request_id: request.request_id,
            tool_name: request.tool_name,
            tool_input: request.input,
            tool_use_id: request.tool_use_id,
            description: request.description,
            suggestions: request.suggestions,
            source: PromptSource::Stream,
            prompt: None,
        }
    }

    pub fn from_hook(payload: &HookPayload) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            tool_name: payload.tool_name().to_string(),
            tool_input: payload.tool_input.clone().unwrap_or(Value::Null),
            tool_use_id: None,
            description: payload
                .tool_input
                .as_ref()
                .and_then(|input| input.get("description"))
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .map(ToOwned::to_owned),
            suggestions: None,
            source: PromptSource::Hook,
            prompt: None,
        }
    }

    pub fn from_screen(prompt: PromptInfo) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            tool_name: prompt.tool_type.clone(),
            tool_input: Value::Null,
            tool_use_id: None,
            description: Some(prompt.description.clone()).filter(|d| !d.is_empty()),
            suggestions: None,
            source: PromptSource::Screen,
            prompt: Some(prompt),
        }
    }

    /// Hook details for a prompt the scraper has now seen on screen.
    pub fn confirmed_by_screen(mut self, screen: &PromptInfo) -> Self {
        if self.description.is_none() && !screen.description.is_empty() {
            self.description = Some(screen.description.clone());
        }
        self
    }

    fn display(&self) -> PromptInfo {
        if let Some(prompt) = &self.prompt {
            return prompt.clone();
        }
        PromptInfo {
            tool_type: self.tool_name.clone(),
            tool_detail: extract_tool_detail(&self.tool_input),
            description: self.description.clone().unwrap_or_default(),
        }
    }

    fn into_permission(self, slot: Slot) -> PendingPermission {
        PendingPermission {
            request_id: self.request_id,
            slot,
            tool_name: self.tool_name,
            tool_input: self.tool_input,
            tool_use_id: self.tool_use_id,
            description: self.description.unwrap_or_default(),
            permission_suggestions: self.suggestions,
            source: self.source,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    AutoApproved,
    Pending { request_id: String },
    /// A screen prompt shadowed by a hook or stream request already pending.
    Shadowed,
}

/// Short human-readable summary of a tool's input.
pub fn extract_tool_detail(input: &Value) -> String {
    let detail = DETAIL_KEYS
        .iter()
        .find_map(|key| input.get(*key).and_then(Value::as_str))
        .or_else(|| {
            input
                .as_object()
                .and_then(|map| map.values().find_map(Value::as_str))
        })
        .map(str::trim)
        .filter(|detail| !detail.is_empty());
    match detail {
        Some(detail) => truncate(detail, MAX_DETAIL_BYTES).to_string(),
        None => PLACEHOLDER_DETAIL.to_string(),
    }
}

/// Tools the auto-edit policy approves without asking.
pub fn is_auto_edit_tool(tool_name: &str) -> bool {
    let lowered = tool_name.to_lowercase();
    AUTO_EDIT_PATTERNS
        .iter()
        .any(|pattern| lowered.contains(pattern))
}

fn deliver(registry: &mut SessionRegistry, entry: Entry, decision: Decision) {
    match entry.route {
        Route::Adapter => match registry.adapter_mut(entry.permission.slot) {
            Some(adapter) => adapter.send_decision(&entry.permission, decision),
            None => {
                tracing::warn!(target = "companion_broker::permission", slot = entry.permission.slot, "no adapter to deliver decision to");
            }
        },
        Route::Hook(reply) => {
            let verdict = if decision.is_allow() {
                HookVerdict::Approve
            } else {
                HookVerdict::Block {
                    reason: DENIED_BY_USER.to_string(),
                }
            };
            if reply.send(verdict).is_err() {
                tracing::debug!(target = "companion_broker::permission", slot = entry.permission.slot, "hook caller already gone");
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct PermissionPipeline {
    pending: HashMap<Slot, Entry>,
    /// Latest pre-tool hook per terminal slot, held until a prompt shows.
    hook_details: HashMap<Slot, ToolRequest>,
}

impl PermissionPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_for(&self, slot: Slot) -> Option<&PendingPermission> {
        self.pending.get(&slot).map(|entry| &entry.permission)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn pending(&self) -> Vec<&PendingPermission> {
        let mut all: Vec<&PendingPermission> =
            self.pending.values().map(|entry| &entry.permission).collect();
        all.sort_by_key(|permission| permission.slot);
        all
    }

    pub fn note_hook_details(&mut self, slot: Slot, request: ToolRequest) {
        tracing::debug!(target = "companion_broker::permission", slot, tool = %request.tool_name, "holding hook details for the next screen prompt");
        self.hook_details.insert(slot, request);
    }

    pub fn take_hook_details(&mut self, slot: Slot) -> Option<ToolRequest> {
        self.hook_details.remove(&slot)
    }

    pub fn forget_hook_details(&mut self, slot: Slot) {
        self.hook_details.remove(&slot);
    }

    /// Admit a tool-use request for `slot`.
    pub fn request(
        &mut self,
        registry: &mut SessionRegistry,
        broadcaster: &mut StateBroadcaster,
        slot: Slot,
        request: ToolRequest,
        route: Route,
    ) -> RequestOutcome {
        if request.source == PromptSource::Screen {
            if let Some(existing) = self.pending.get(&slot) {
                if existing.permission.source != PromptSource::Screen {
                    tracing::debug!(target = "companion_broker::permission", slot, "screen prompt shadowed by structured request");
                    return RequestOutcome::Shadowed;
                }
            }
        }

        let prompt = request.display();

        if broadcaster.auto_edit() && is_auto_edit_tool(&request.tool_name) {
            let tool_name = request.tool_name.clone();
            let entry = Entry {
                permission: request.into_permission(slot),
                prompt,
                route,
            };
            tracing::info!(target = "companion_broker::permission", slot, tool = %tool_name, "auto-approved");
            deliver(registry, entry, Decision::Yes);
            broadcaster.update_state(
                slot,
                StatusUpdate::state(AgentState::Working)
                    .message(format!("Auto-approved: {tool_name}")),
            );
            return RequestOutcome::AutoApproved;
        }

        let permission = request.into_permission(slot);
        let request_id = permission.request_id.clone();
        let message = format!("{}: {}", prompt.tool_type, prompt.tool_detail);
        let entry = Entry {
            permission,
            prompt: prompt.clone(),
            route,
        };
        if let Some(previous) = self.pending.insert(slot, entry) {
            tracing::warn!(
                target = "companion_broker::permission",
                slot,
                superseded = %previous.permission.request_id,
                request_id = %request_id,
                "pending permission replaced by a newer request"
            );
        }
        tracing::info!(target = "companion_broker::permission", slot, request_id = %request_id, tool = %prompt.tool_type, "awaiting approval");
        broadcaster.update_state(
            slot,
            StatusUpdate::state(AgentState::Waiting)
                .message(message)
                .prompt(prompt),
        );
        RequestOutcome::Pending { request_id }
    }

    /// Apply a client decision to the slot's pending request. Returns the
    /// resolved request, or `None` when nothing (or a different request) is
    /// pending, in which case nothing is delivered.
    pub fn resolve(
        &mut self,
        registry: &mut SessionRegistry,
        broadcaster: &mut StateBroadcaster,
        slot: Slot,
        request_id: Option<&str>,
        decision: Decision,
    ) -> Option<PendingPermission> {
        let matches = match (self.pending.get(&slot), request_id) {
            (Some(entry), Some(id)) => entry.permission.request_id == id,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if !matches {
            tracing::warn!(target = "companion_broker::permission", slot, ?request_id, decision = decision.as_str(), "no pending permission to resolve");
            return None;
        }
        let entry = self.pending.remove(&slot)?;
        let permission = entry.permission.clone();
        let tool = entry.prompt.tool_type.clone();

        tracing::info!(target = "companion_broker::permission", slot, request_id = %permission.request_id, decision = decision.as_str(), "permission resolved");
        deliver(registry, entry, decision);

        let verb = match decision {
            Decision::Yes => "Approved",
            Decision::Always => "Always allowed",
            Decision::No => "Denied",
        };
        broadcaster.update_state(
            slot,
            StatusUpdate::state(AgentState::Working).message(format!("{verb}: {tool}")),
        );
        Some(permission)
    }

    /// Drop the slot's pending request without answering the agent.
    pub fn cancel(&mut self, slot: Slot) -> Option<PendingPermission> {
        self.hook_details.remove(&slot);
        let entry = self.pending.remove(&slot)?;
        tracing::info!(target = "companion_broker::permission", slot, request_id = %entry.permission.request_id, "pending permission cancelled");
        Some(entry.permission)
    }

    /// Cancel only if the pending request is `request_id`.
    pub fn cancel_request(&mut self, slot: Slot, request_id: &str) -> Option<PendingPermission> {
        match self.pending.get(&slot) {
            Some(entry) if entry.permission.request_id == request_id => self.cancel(slot),
            _ => None,
        }
    }

    /// Drop a request answered directly at the terminal: the screen prompt
    /// went away, or the tool already ran.
    pub fn clear_answered_elsewhere(&mut self, slot: Slot) -> Option<PendingPermission> {
        match self.pending.get(&slot) {
            Some(entry)
                if matches!(entry.route, Route::Adapter)
                    && entry.permission.source != PromptSource::Stream =>
            {
                self.cancel(slot)
            }
            _ => None,
        }
    }

    pub fn cancel_all(&mut self) -> usize {
        let count = self.pending.len();
        self.pending.clear();
        self.hook_details.clear();
        count
    }
}
