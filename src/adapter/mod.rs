//! Agent adapters: one running agent per slot, driven either through its
//! structured stdio stream or by keystrokes into a tmux pane.

pub mod stream;
pub mod terminal;

use std::{path::PathBuf, time::Duration};

use clap::ValueEnum;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::{
    engine::EngineEvent, error::BrokerError, permission::PendingPermission,
    protocol::ClientAction, Slot,
};

pub use stream::StreamAdapter;
pub use terminal::TerminalAdapter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum AdapterKind {
    /// Agent CLI in stream-json mode with permissions answered over stdio.
    Stream,
    /// Interactive agent CLI inside a tmux session, answered with keystrokes.
    Tmux,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Yes,
    Always,
    No,
}

impl Decision {
    /// `escape` is not a decision; it interrupts the agent instead.
    pub fn from_action(action: ClientAction) -> Option<Self> {
        match action {
            ClientAction::Yes => Some(Decision::Yes),
            ClientAction::Always => Some(Decision::Always),
            ClientAction::No => Some(Decision::No),
            ClientAction::Escape => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Decision::Yes => "yes",
            Decision::Always => "always",
            Decision::No => "no",
        }
    }

    pub fn is_allow(self) -> bool {
        !matches!(self, Decision::No)
    }
}

/// How approvals reach the broker for a given adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptChannel {
    /// The agent asks over its own stream; hooks are informational only.
    Stream,
    /// The agent prompts on screen; keystrokes answer whatever is displayed.
    Screen { pane_available: bool },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpawnOptions {
    pub cwd: Option<PathBuf>,
    pub resume: Option<String>,
    pub initial_input: Option<String>,
}

/// Operations never fail past this boundary except `start`; transport
/// trouble is logged and the health check reaps what died.
pub trait AgentAdapter: Send {
    fn kind(&self) -> AdapterKind;
    fn is_running(&mut self) -> bool;
    fn start(&mut self, initial_input: Option<&str>) -> Result<(), BrokerError>;
    fn stop(&mut self);
    fn send_decision(&mut self, permission: &PendingPermission, decision: Decision);
    fn interrupt(&mut self);
    fn send_free_text(&mut self, text: &str);
    fn prompt_channel(&self) -> PromptChannel;

    fn pid(&self) -> Option<u32> {
        None
    }
}

pub trait AdapterFactory: Send {
    fn create(&self, slot: Slot, epoch: u64, options: &SpawnOptions) -> Box<dyn AgentAdapter>;
}

#[derive(Debug, Clone)]
pub struct LaunchSettings {
    pub kind: AdapterKind,
    pub program: String,
    pub args: Vec<String>,
    pub default_cwd: Option<PathBuf>,
    pub tmux_session: String,
    pub scrape_interval: Duration,
    pub stop_grace: Duration,
}

/// Production factory: builds the configured adapter kind wired to the engine.
pub struct AgentLauncher {
    settings: LaunchSettings,
    events: mpsc::Sender<EngineEvent>,
}

impl AgentLauncher {
    pub fn new(settings: LaunchSettings, events: mpsc::Sender<EngineEvent>) -> Self {
        Self { settings, events }
    }
}

impl AdapterFactory for AgentLauncher {
    fn create(&self, slot: Slot, epoch: u64, options: &SpawnOptions) -> Box<dyn AgentAdapter> {
        let mut options = options.clone();
        if options.cwd.is_none() {
            options.cwd = self.settings.default_cwd.clone();
        }
        match self.settings.kind {
            AdapterKind::Stream => Box::new(StreamAdapter::new(
                slot,
                epoch,
                &self.settings,
                options,
                self.events.clone(),
            )),
            AdapterKind::Tmux => Box::new(TerminalAdapter::new(
                slot,
                epoch,
                &self.settings,
                options,
                self.events.clone(),
            )),
        }
    }
}
