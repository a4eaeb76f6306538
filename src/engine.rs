//! The broker's single event loop.
//!
//! Every piece of mutable state (sessions, pending permissions, slot status)
//! is owned here and only touched from `Engine::handle`, one event at a time.
//! Everything that does I/O (sockets, child processes, tmux polling, HTTP
//! hook callers) runs in its own task and talks to the engine through
//! `EngineEvent`s.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tokio::{
    sync::{mpsc, oneshot},
    time::MissedTickBehavior,
};

use crate::{
    adapter::{AdapterFactory, Decision, PromptChannel, SpawnOptions},
    events::EventEmitter,
    helpers::truncate,
    permission::{is_auto_edit_tool, PermissionPipeline, RequestOutcome, Route, ToolRequest},
    protocol::{
        parse_agent_line, AgentMessage, ClientAction, ClientMessage, HookKind, HookPayload,
        HookVerdict, DEFAULT_CONTEXT_WINDOW,
    },
    scraper::ScrapeEdge,
    session::{SessionRegistry, SessionStatus},
    status::{default_agent_name, AgentState, ClientId, StateBroadcaster, StatusUpdate},
    Slot,
};

const SPAWN_COMMAND: &str = "spawn";
const MAX_MESSAGE_BYTES: usize = 100;

#[derive(Debug)]
pub enum EngineEvent {
    ClientConnected {
        id: ClientId,
        tx: mpsc::UnboundedSender<String>,
    },
    ClientDisconnected {
        id: ClientId,
    },
    ClientMessage {
        id: ClientId,
        text: String,
    },
    AgentOutput {
        slot: Slot,
        epoch: u64,
        line: String,
    },
    AgentExited {
        slot: Slot,
        epoch: u64,
    },
    Scrape {
        slot: Slot,
        epoch: u64,
        edge: ScrapeEdge,
    },
    PaneAvailability {
        slot: Slot,
        epoch: u64,
        available: bool,
    },
    /// An adapter accepted `start` but the agent never came up.
    SpawnFailed {
        slot: Slot,
        epoch: u64,
        reason: String,
    },
    Hook {
        kind: HookKind,
        payload: HookPayload,
        reply: oneshot::Sender<HookReply>,
    },
    /// A blocked hook caller stopped waiting for `request_id`.
    HookTimedOut {
        slot: Slot,
        request_id: String,
    },
    Health {
        reply: oneshot::Sender<Value>,
    },
    ContextUsage {
        slot: Slot,
        percent: u8,
    },
}

#[derive(Debug)]
pub enum HookReply {
    /// Informational; the decision travels some other way.
    Ack,
    Verdict(HookVerdict),
    /// The caller must wait for a client decision.
    Await {
        slot: Slot,
        request_id: String,
        verdict: oneshot::Receiver<HookVerdict>,
    },
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_slots: usize,
    pub auto_edit: bool,
    pub health_interval: Duration,
    pub json_output: bool,
}

pub struct Engine {
    config: EngineConfig,
    registry: SessionRegistry,
    pipeline: PermissionPipeline,
    broadcaster: StateBroadcaster,
    emitter: EventEmitter,
    started_at: Instant,
}

impl Engine {
    pub fn new(config: EngineConfig, factory: Box<dyn AdapterFactory>) -> Self {
        Self {
            registry: SessionRegistry::new(config.max_slots, factory),
            pipeline: PermissionPipeline::new(),
            broadcaster: StateBroadcaster::new(config.max_slots, config.auto_edit),
            emitter: EventEmitter::new(config.json_output),
            started_at: Instant::now(),
            config,
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn pipeline(&self) -> &PermissionPipeline {
        &self.pipeline
    }

    pub fn broadcaster(&self) -> &StateBroadcaster {
        &self.broadcaster
    }

    /// Start an agent in slot 0 as if a client had asked for it.
    pub fn auto_spawn(&mut self) {
        self.spawn_slot(Some(0), SpawnOptions::default());
    }

    pub async fn run(mut self, mut rx: mpsc::Receiver<EngineEvent>) -> Result<()> {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("failed to install SIGTERM handler")?;
        let mut health = tokio::time::interval(self.config.health_interval);
        health.set_missed_tick_behavior(MissedTickBehavior::Skip);
        health.tick().await;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!(target = "companion_broker::engine", "received Ctrl-C, shutting down");
                    break;
                }

                _ = sigterm.recv() => {
                    tracing::info!(target = "companion_broker::engine", "received SIGTERM, shutting down");
                    break;
                }

                _ = health.tick() => self.health_check(),

                event = rx.recv() => match event {
                    Some(event) => self.handle(event),
                    None => break,
                },
            }
        }

        self.shutdown();
        Ok(())
    }

    pub fn shutdown(&mut self) {
        let cancelled = self.pipeline.cancel_all();
        let stopped = self.registry.shutdown_all();
        tracing::info!(target = "companion_broker::engine", cancelled, stopped, "broker stopped");
    }

    pub fn handle(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::ClientConnected { id, tx } => self.broadcaster.add_client(id, tx),
            EngineEvent::ClientDisconnected { id } => self.broadcaster.remove_client(id),
            EngineEvent::ClientMessage { id, text } => self.handle_client_text(id, &text),
            EngineEvent::AgentOutput { slot, epoch, line } => {
                if self.is_current(slot, epoch) {
                    self.handle_agent_line(slot, &line);
                }
            }
            EngineEvent::AgentExited { slot, epoch } => {
                if self.is_current(slot, epoch) {
                    self.end_slot(slot, "agent exited");
                }
            }
            EngineEvent::Scrape { slot, epoch, edge } => {
                if self.is_current(slot, epoch) {
                    self.handle_scrape(slot, edge);
                }
            }
            EngineEvent::PaneAvailability {
                slot,
                epoch,
                available,
            } => {
                if self.is_current(slot, epoch) {
                    self.handle_pane_availability(slot, available);
                }
            }
            EngineEvent::SpawnFailed {
                slot,
                epoch,
                reason,
            } => {
                if self.is_current(slot, epoch) {
                    self.abort_spawn(slot, epoch, &reason);
                }
            }
            EngineEvent::Hook {
                kind,
                payload,
                reply,
            } => {
                let response = self.handle_hook(kind, &payload);
                if reply.send(response).is_err() {
                    tracing::debug!(target = "companion_broker::engine", hook = kind.path_segment(), "hook caller went away before the reply");
                }
            }
            EngineEvent::HookTimedOut { slot, request_id } => {
                if self.pipeline.cancel_request(slot, &request_id).is_some() {
                    tracing::warn!(target = "companion_broker::engine", slot, request_id = %request_id, "no decision before hook timeout; approving");
                    self.broadcaster.update_state(
                        slot,
                        StatusUpdate::state(AgentState::Working)
                            .message("Auto-approved after timeout"),
                    );
                }
            }
            EngineEvent::Health { reply } => {
                let _ = reply.send(self.health_snapshot());
            }
            EngineEvent::ContextUsage { slot, percent } => {
                self.broadcaster.update_context_percent(slot, percent);
            }
        }
    }

    fn is_current(&self, slot: Slot, epoch: u64) -> bool {
        let current = self.registry.epoch_of(slot) == Some(epoch);
        if !current {
            tracing::trace!(target = "companion_broker::engine", slot, epoch, "ignoring event from a previous session");
        }
        current
    }

    fn health_check(&mut self) {
        for slot in self.registry.health_check() {
            tracing::warn!(target = "companion_broker::engine", slot, "agent no longer running; cleaning up");
            self.end_slot(slot, "health check");
        }
    }

    fn health_snapshot(&self) -> Value {
        json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "hostname": hostname::get().ok().map(|h| h.to_string_lossy().into_owned()),
            "autoEdit": self.broadcaster.auto_edit(),
            "wsClients": self.broadcaster.client_count(),
            "slots": self.registry.max_slots(),
            "agents": self.broadcaster.statuses(),
            "sessions": self.registry.summaries(),
            "pendingPermissions": self.pipeline.pending(),
            "uptimeSecs": self.started_at.elapsed().as_secs(),
        })
    }

    // -- slots --------------------------------------------------------------

    fn spawn_slot(&mut self, slot: Option<Slot>, options: SpawnOptions) {
        let spawned = match slot {
            Some(slot) => self
                .registry
                .spawn_session(slot, &options)
                .map(|epoch| (slot, epoch)),
            None => self.registry.spawn_any(&options),
        };

        match spawned {
            Ok((slot, epoch)) => {
                self.pipeline.cancel(slot);
                self.broadcaster.update_state(
                    slot,
                    StatusUpdate::state(AgentState::Idle)
                        .message("Starting agent...")
                        .name(default_agent_name(slot))
                        .context_percent(0)
                        .active(true),
                );
                self.broadcaster.spawn_result(slot, true, None);
                self.emitter.emit(
                    "slot_spawned",
                    json!({ "slot": slot, "epoch": epoch, "resume": options.resume }),
                );
            }
            Err(error) => {
                let slot = error.slot().or(slot).unwrap_or(0);
                tracing::warn!(target = "companion_broker::engine", slot, error = %error, "spawn failed");
                self.broadcaster
                    .spawn_result(slot, false, Some(error.to_string()));
                self.emitter.emit(
                    "spawn_failed",
                    json!({ "slot": slot, "error": error.to_string() }),
                );
            }
        }
    }

    /// Tear down whatever runs in `slot` and mark it done.
    fn end_slot(&mut self, slot: Slot, reason: &str) {
        self.pipeline.cancel(slot);
        let killed = self.registry.kill_session(slot);
        self.broadcaster.update_state(
            slot,
            StatusUpdate::state(AgentState::Done)
                .message("Session ended")
                .active(false),
        );
        self.emitter.emit(
            "slot_ended",
            json!({ "slot": slot, "reason": reason, "killed": killed }),
        );
    }

    fn abort_spawn(&mut self, slot: Slot, epoch: u64, reason: &str) {
        tracing::warn!(target = "companion_broker::engine", slot, epoch, reason, "agent failed to start");
        self.pipeline.cancel(slot);
        self.registry.kill_session(slot);
        self.broadcaster.update_state(
            slot,
            StatusUpdate::state(AgentState::Error)
                .message(format!("Spawn failed: {reason}"))
                .active(false),
        );
        self.broadcaster
            .spawn_result(slot, false, Some(reason.to_string()));
        self.emitter.emit(
            "spawn_failed",
            json!({ "slot": slot, "epoch": epoch, "error": reason }),
        );
    }

    // -- control clients ----------------------------------------------------

    fn handle_client_text(&mut self, id: ClientId, text: &str) {
        let message: ClientMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(error) => {
                tracing::warn!(target = "companion_broker::engine", client = id, error = %error, "discarding malformed client message");
                return;
            }
        };
        tracing::debug!(target = "companion_broker::engine", client = id, ?message, "client message");

        match message {
            ClientMessage::Action { action, slot } => self.handle_action(action, slot.unwrap_or(0)),
            ClientMessage::Command { command, slot } => {
                if command.trim() == SPAWN_COMMAND {
                    self.spawn_slot(None, SpawnOptions::default());
                } else {
                    self.send_free_text(slot.unwrap_or(0), &command);
                }
            }
            ClientMessage::Config { auto_edit } => {
                if let Some(enabled) = auto_edit {
                    self.broadcaster.set_auto_edit(enabled);
                }
            }
            ClientMessage::SpawnRequest { slot, cwd, resume } => self.spawn_slot(
                Some(slot),
                SpawnOptions {
                    cwd: cwd.filter(|c| !c.is_empty()).map(Into::into),
                    resume: resume.filter(|r| !r.is_empty()),
                    initial_input: None,
                },
            ),
        }
    }

    fn handle_action(&mut self, action: ClientAction, slot: Slot) {
        let Some(decision) = Decision::from_action(action) else {
            self.interrupt(slot);
            return;
        };
        let resolved = self.pipeline.resolve(
            &mut self.registry,
            &mut self.broadcaster,
            slot,
            None,
            decision,
        );
        if let Some(permission) = resolved {
            self.registry.touch(slot);
            self.emitter.emit(
                "permission_resolved",
                json!({
                    "slot": slot,
                    "requestId": permission.request_id,
                    "tool": permission.tool_name,
                    "decision": decision.as_str(),
                }),
            );
        }
    }

    fn interrupt(&mut self, slot: Slot) {
        self.pipeline.cancel(slot);
        match self.registry.adapter_mut(slot) {
            Some(adapter) => adapter.interrupt(),
            None => {
                tracing::warn!(target = "companion_broker::engine", slot, "interrupt for empty slot");
                return;
            }
        }
        self.broadcaster.update_state(
            slot,
            StatusUpdate::state(AgentState::Working).message("Interrupting..."),
        );
    }

    fn send_free_text(&mut self, slot: Slot, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        match self.registry.adapter_mut(slot) {
            Some(adapter) => adapter.send_free_text(text),
            None => {
                tracing::warn!(target = "companion_broker::engine", slot, "free text for empty slot dropped");
                return;
            }
        }
        self.registry.touch(slot);
        self.broadcaster.update_state(
            slot,
            StatusUpdate::state(AgentState::Working).message("Processing prompt..."),
        );
    }

    // -- structured agent stream --------------------------------------------

    fn handle_agent_line(&mut self, slot: Slot, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        let message = match parse_agent_line(line) {
            Ok(message) => message,
            Err(error) => {
                tracing::warn!(target = "companion_broker::engine", slot, error = %error, line = truncate(line, 200), "discarding malformed agent line");
                return;
            }
        };
        self.registry.touch(slot);

        match message {
            AgentMessage::Init { session_id, model } => {
                if let Some(id) = &session_id {
                    self.registry.link_session(id, Some(slot));
                }
                self.registry.mark(slot, SessionStatus::Active);
                let mut update = StatusUpdate::state(AgentState::Idle)
                    .message("Ready")
                    .active(true);
                if let Some(model) = model {
                    update = update.name(model.clone());
                    if let Some(session) = self.registry.session_mut(slot) {
                        session.model = Some(model);
                    }
                }
                self.broadcaster.update_state(slot, update);
            }
            AgentMessage::Compacting => {
                self.broadcaster.update_state(
                    slot,
                    StatusUpdate::state(AgentState::Working).message("Compacting context..."),
                );
            }
            AgentMessage::Assistant { text, usage, error } => {
                if let Some(error) = error {
                    self.broadcaster.update_state(
                        slot,
                        StatusUpdate::state(AgentState::Error).message(error),
                    );
                    return;
                }
                self.registry.mark(slot, SessionStatus::Active);
                let window = self
                    .registry
                    .session(slot)
                    .map(|session| session.context_window)
                    .unwrap_or(DEFAULT_CONTEXT_WINDOW);
                let percent = usage.map(|usage| usage.percent_of(window));

                // A waiting slot keeps its prompt; only usage moves.
                if self.pipeline.pending_for(slot).is_some() {
                    if let Some(percent) = percent {
                        self.broadcaster.update_context_percent(slot, percent);
                    }
                    return;
                }
                let mut update = StatusUpdate::state(AgentState::Working);
                if let Some(text) = text.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
                    update = update.message(truncate(text, MAX_MESSAGE_BYTES));
                }
                if let Some(percent) = percent {
                    update = update.context_percent(percent);
                }
                self.broadcaster.update_state(slot, update);
            }
            AgentMessage::Result {
                is_error,
                subtype,
                result,
                context_windows,
            } => {
                if let Some(session) = self.registry.session_mut(slot) {
                    let window = context_windows
                        .iter()
                        .find(|(model, _)| session.model.as_deref() == Some(model.as_str()))
                        .or_else(|| context_windows.first())
                        .map(|(_, window)| *window);
                    if let Some(window) = window.filter(|w| *w > 0) {
                        session.context_window = window;
                    }
                }
                self.pipeline.cancel(slot);
                self.registry.mark(slot, SessionStatus::Idle);
                let update = if is_error && subtype == "error_during_execution" {
                    let message = result
                        .as_deref()
                        .map(str::trim)
                        .filter(|text| !text.is_empty())
                        .map_or_else(
                            || "Error during execution".to_string(),
                            |text| truncate(text, MAX_MESSAGE_BYTES).to_string(),
                        );
                    StatusUpdate::state(AgentState::Error).message(message)
                } else if subtype == "success" {
                    StatusUpdate::state(AgentState::Idle).message("Turn complete")
                } else {
                    StatusUpdate::state(AgentState::Idle)
                        .message(format!("Stopped: {}", subtype.replace('_', " ")))
                };
                self.broadcaster.update_state(slot, update);
            }
            AgentMessage::CanUseTool(request) => {
                let tool = request.tool_name.clone();
                let outcome = self.pipeline.request(
                    &mut self.registry,
                    &mut self.broadcaster,
                    slot,
                    ToolRequest::from_stream(request),
                    Route::Adapter,
                );
                self.emit_request_outcome(slot, &tool, &outcome);
            }
            AgentMessage::ControlCancel { request_id } => {
                if self.pipeline.cancel_request(slot, &request_id).is_some() {
                    self.broadcaster.update_state(
                        slot,
                        StatusUpdate::state(AgentState::Working)
                            .message("Permission request cancelled"),
                    );
                }
            }
            AgentMessage::ToolProgress {
                tool_name,
                elapsed_secs,
            } => {
                if self.pipeline.pending_for(slot).is_none() {
                    self.broadcaster.update_state(
                        slot,
                        StatusUpdate::state(AgentState::Working)
                            .message(format!("Running: {tool_name} ({elapsed_secs:.0}s)")),
                    );
                }
            }
            AgentMessage::AuthError { message } => {
                self.broadcaster.update_state(
                    slot,
                    StatusUpdate::state(AgentState::Error).message(message),
                );
            }
            AgentMessage::Ignored(kind) => {
                tracing::trace!(target = "companion_broker::engine", slot, kind = %kind, "ignored agent message");
            }
        }
    }

    fn emit_request_outcome(&self, slot: Slot, tool: &str, outcome: &RequestOutcome) {
        match outcome {
            RequestOutcome::Pending { request_id } => self.emitter.emit(
                "permission_requested",
                json!({ "slot": slot, "requestId": request_id, "tool": tool }),
            ),
            RequestOutcome::AutoApproved => self.emitter.emit(
                "permission_resolved",
                json!({ "slot": slot, "tool": tool, "decision": "auto" }),
            ),
            RequestOutcome::Shadowed => {}
        }
    }

    // -- terminal panes -----------------------------------------------------

    fn handle_scrape(&mut self, slot: Slot, edge: ScrapeEdge) {
        match edge {
            ScrapeEdge::Appeared(prompt) => {
                let request = match self.pipeline.take_hook_details(slot) {
                    Some(details) => details.confirmed_by_screen(&prompt),
                    None => ToolRequest::from_screen(prompt),
                };
                let tool = request.tool_name.clone();
                let outcome = self.pipeline.request(
                    &mut self.registry,
                    &mut self.broadcaster,
                    slot,
                    request,
                    Route::Adapter,
                );
                self.emit_request_outcome(slot, &tool, &outcome);
            }
            ScrapeEdge::Disappeared => {
                if self.pipeline.clear_answered_elsewhere(slot).is_some() {
                    self.broadcaster.update_state(
                        slot,
                        StatusUpdate::state(AgentState::Working).message("Resumed"),
                    );
                }
            }
        }
    }

    /// Only the broadcast status moves here; the session stays claimable
    /// until the agent's first hook links its id.
    fn handle_pane_availability(&mut self, slot: Slot, available: bool) {
        if !available {
            tracing::warn!(target = "companion_broker::engine", slot, "tmux pane unavailable");
            return;
        }
        let spawning = self
            .registry
            .session(slot)
            .is_some_and(|session| session.status == SessionStatus::Spawning);
        if spawning {
            self.broadcaster.update_state(
                slot,
                StatusUpdate::state(AgentState::Idle)
                    .message("Agent ready")
                    .active(true),
            );
        }
    }

    // -- hook callbacks -----------------------------------------------------

    fn handle_hook(&mut self, kind: HookKind, payload: &HookPayload) -> HookReply {
        let slot = self.registry.resolve_slot(payload.session_id.as_deref());
        self.registry.touch(slot);
        let tool = payload.tool_name().to_string();
        tracing::debug!(target = "companion_broker::engine", slot, hook = kind.path_segment(), tool = %tool, "hook received");

        match kind {
            HookKind::PreTool => return self.pre_tool(slot, payload),
            HookKind::PostTool => {
                self.pipeline.forget_hook_details(slot);
                self.pipeline.clear_answered_elsewhere(slot);
                if self.pipeline.pending_for(slot).is_none() {
                    let update = if payload.has_error() {
                        StatusUpdate::state(AgentState::Error).message(format!("Error: {tool}"))
                    } else {
                        StatusUpdate::state(AgentState::Working).message(format!("Finished: {tool}"))
                    };
                    self.broadcaster.update_state(slot, update);
                }
            }
            HookKind::SessionStart => {
                self.registry.mark(slot, SessionStatus::Active);
                self.broadcaster.update_state(
                    slot,
                    StatusUpdate::state(AgentState::Idle)
                        .message("Session started")
                        .active(true),
                );
            }
            HookKind::SessionEnd => self.end_slot(slot, "session end hook"),
            HookKind::Stop => {
                if self.pipeline.pending_for(slot).is_none() {
                    self.registry.mark(slot, SessionStatus::Idle);
                    self.broadcaster.update_state(
                        slot,
                        StatusUpdate::state(AgentState::Idle).message("Turn complete"),
                    );
                }
            }
            HookKind::UserPrompt => {
                self.registry.mark(slot, SessionStatus::Active);
                self.broadcaster.update_state(
                    slot,
                    StatusUpdate::state(AgentState::Working).message("Processing prompt..."),
                );
            }
        }
        HookReply::Ack
    }

    fn pre_tool(&mut self, slot: Slot, payload: &HookPayload) -> HookReply {
        let channel = self
            .registry
            .session(slot)
            .map(|session| session.adapter.prompt_channel());
        if channel == Some(PromptChannel::Stream) {
            return HookReply::Ack;
        }

        let request = ToolRequest::from_hook(payload);
        let tool = request.tool_name.clone();
        let auto = self.broadcaster.auto_edit() && is_auto_edit_tool(&tool);
        let keystrokes = !auto
            && matches!(
                channel,
                Some(PromptChannel::Screen {
                    pane_available: true
                })
            );

        // Most tools run without asking; the pane decides whether this one
        // prompts, and the details wait for that.
        if keystrokes {
            self.pipeline.note_hook_details(slot, request);
            return HookReply::Ack;
        }

        let (tx, rx) = oneshot::channel();
        let outcome = self.pipeline.request(
            &mut self.registry,
            &mut self.broadcaster,
            slot,
            request,
            Route::Hook(tx),
        );
        self.emit_request_outcome(slot, &tool, &outcome);
        match outcome {
            RequestOutcome::Pending { request_id } => HookReply::Await {
                slot,
                request_id,
                verdict: rx,
            },
            RequestOutcome::AutoApproved | RequestOutcome::Shadowed => {
                HookReply::Verdict(HookVerdict::Approve)
            }
        }
    }
}
