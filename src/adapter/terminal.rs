use std::{path::PathBuf, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::{sync::mpsc, task::JoinHandle};

use super::{AdapterKind, AgentAdapter, Decision, LaunchSettings, PromptChannel, SpawnOptions};
use crate::{
    engine::EngineEvent,
    error::BrokerError,
    permission::PendingPermission,
    scraper::{spawn_pane_scraper, PaneScraperConfig, SharedPaneState},
    tmux, Slot,
};

/// Keys that select an option in the agent's numbered confirmation menu.
pub fn decision_keys(decision: Decision) -> &'static [&'static str] {
    match decision {
        Decision::Yes => &["Enter"],
        Decision::Always => &["Down", "Enter"],
        Decision::No => &["Down", "Down", "Enter"],
    }
}

pub fn session_name(prefix: &str, slot: Slot) -> String {
    if slot == 0 {
        prefix.to_string()
    } else {
        format!("{prefix}-{slot}")
    }
}

#[derive(Debug)]
enum TmuxOp {
    Ensure {
        command: Vec<String>,
        cwd: Option<PathBuf>,
    },
    Keys(&'static [&'static str]),
    Text(String),
    Kill,
}

pub struct TerminalAdapter {
    slot: Slot,
    epoch: u64,
    session: String,
    command: Vec<String>,
    options: SpawnOptions,
    scrape_interval: Duration,
    events: mpsc::Sender<EngineEvent>,
    pane: SharedPaneState,
    failed: Arc<Mutex<bool>>,
    ops: Option<mpsc::UnboundedSender<TmuxOp>>,
    scraper: Option<JoinHandle<()>>,
}

impl TerminalAdapter {
    pub fn new(
        slot: Slot,
        epoch: u64,
        settings: &LaunchSettings,
        options: SpawnOptions,
        events: mpsc::Sender<EngineEvent>,
    ) -> Self {
        let mut command = Vec::with_capacity(settings.args.len() + 3);
        command.push(settings.program.clone());
        command.extend(settings.args.iter().cloned());
        if let Some(session_id) = &options.resume {
            command.push("--resume".to_string());
            command.push(session_id.clone());
        }

        Self {
            slot,
            epoch,
            session: session_name(&settings.tmux_session, slot),
            command,
            options,
            scrape_interval: settings.scrape_interval,
            events,
            pane: SharedPaneState::default(),
            failed: Arc::new(Mutex::new(false)),
            ops: None,
            scraper: None,
        }
    }

    fn enqueue(&mut self, op: TmuxOp) {
        let Some(tx) = &self.ops else {
            tracing::warn!(target = "companion_broker::adapter", slot = self.slot, "terminal adapter not started; dropping {op:?}");
            return;
        };
        if tx.send(op).is_err() {
            tracing::warn!(target = "companion_broker::adapter", slot = self.slot, "tmux worker gone");
            self.ops = None;
        }
    }
}

/// Mark the adapter dead and tell the engine, so the slot is released and
/// the client learns the spawn did not happen.
async fn report_start_failure(
    slot: Slot,
    epoch: u64,
    reason: String,
    failed: &Mutex<bool>,
    events: &mpsc::Sender<EngineEvent>,
) {
    *failed.lock() = true;
    if events
        .send(EngineEvent::SpawnFailed {
            slot,
            epoch,
            reason,
        })
        .await
        .is_err()
    {
        tracing::debug!(target = "companion_broker::adapter", slot, "engine gone; start failure not reported");
    }
}

/// Runs tmux commands for one slot strictly in order.
async fn run_tmux_ops(
    slot: Slot,
    epoch: u64,
    session: String,
    failed: Arc<Mutex<bool>>,
    events: mpsc::Sender<EngineEvent>,
    mut rx: mpsc::UnboundedReceiver<TmuxOp>,
) {
    while let Some(op) = rx.recv().await {
        match op {
            TmuxOp::Ensure { command, cwd } => {
                if tmux::has_session(&session).await {
                    tracing::info!(target = "companion_broker::adapter", slot, session = %session, "attaching to existing tmux session");
                    continue;
                }
                match tmux::new_session(&session, cwd.as_deref(), &command).await {
                    Ok(()) => {
                        tracing::info!(target = "companion_broker::adapter", slot, session = %session, "started tmux session")
                    }
                    Err(error) => {
                        tracing::error!(target = "companion_broker::adapter", slot, session = %session, error = %error, "failed to start tmux session");
                        report_start_failure(
                            slot,
                            epoch,
                            format!("tmux session {session} did not start: {error}"),
                            &failed,
                            &events,
                        )
                        .await;
                    }
                }
            }
            TmuxOp::Kill => {
                if tmux::has_session(&session).await {
                    if let Err(error) = tmux::kill_session(&session).await {
                        tracing::warn!(target = "companion_broker::adapter", slot, error = %error, "failed to kill tmux session");
                    }
                }
                break;
            }
            TmuxOp::Keys(keys) => {
                if !tmux::has_session(&session).await {
                    tracing::warn!(target = "companion_broker::adapter", slot, session = %session, ?keys, "tmux session missing; keys not sent");
                    continue;
                }
                if let Err(error) = tmux::send_keys(&session, keys).await {
                    tracing::warn!(target = "companion_broker::adapter", slot, error = %error, "send-keys failed");
                }
            }
            TmuxOp::Text(text) => {
                if !tmux::has_session(&session).await {
                    tracing::warn!(target = "companion_broker::adapter", slot, session = %session, "tmux session missing; text not sent");
                    continue;
                }
                let sent = match tmux::send_literal(&session, &text).await {
                    Ok(()) => tmux::send_keys(&session, &["Enter"]).await,
                    Err(error) => Err(error),
                };
                if let Err(error) = sent {
                    tracing::warn!(target = "companion_broker::adapter", slot, error = %error, "failed to type into tmux pane");
                }
            }
        }
    }
}

impl AgentAdapter for TerminalAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Tmux
    }

    fn is_running(&mut self) -> bool {
        if self.ops.is_none() || *self.failed.lock() {
            return false;
        }
        let pane = *self.pane.lock();
        !(pane.seen && !pane.alive)
    }

    fn start(&mut self, initial_input: Option<&str>) -> Result<(), BrokerError> {
        if self.ops.is_some() {
            return Ok(());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_tmux_ops(
            self.slot,
            self.epoch,
            self.session.clone(),
            self.failed.clone(),
            self.events.clone(),
            rx,
        ));
        self.ops = Some(tx);
        self.enqueue(TmuxOp::Ensure {
            command: self.command.clone(),
            cwd: self.options.cwd.clone(),
        });
        if let Some(text) = initial_input.filter(|text| !text.trim().is_empty()) {
            self.enqueue(TmuxOp::Text(text.to_string()));
        }

        self.scraper = Some(spawn_pane_scraper(
            PaneScraperConfig {
                slot: self.slot,
                epoch: self.epoch,
                session: self.session.clone(),
                interval: self.scrape_interval,
            },
            self.pane.clone(),
            self.events.clone(),
        ));
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(handle) = self.scraper.take() {
            handle.abort();
        }
        self.enqueue(TmuxOp::Kill);
        self.ops = None;
    }

    fn send_decision(&mut self, _permission: &PendingPermission, decision: Decision) {
        self.enqueue(TmuxOp::Keys(decision_keys(decision)));
    }

    fn interrupt(&mut self) {
        self.enqueue(TmuxOp::Keys(&["Escape"]));
    }

    fn send_free_text(&mut self, text: &str) {
        self.enqueue(TmuxOp::Text(text.to_string()));
    }

    fn prompt_channel(&self) -> PromptChannel {
        PromptChannel::Screen {
            pane_available: self.pane.lock().alive,
        }
    }
}
