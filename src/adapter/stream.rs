use std::{process::Stdio, time::Duration};

use serde_json::Value;
use tokio::{
    process::{Child, Command},
    sync::mpsc,
};

use super::{AdapterKind, AgentAdapter, Decision, LaunchSettings, PromptChannel, SpawnOptions};
use crate::{
    engine::EngineEvent,
    error::BrokerError,
    permission::PendingPermission,
    protocol::{
        allow_response, deny_response, initialize_request, interrupt_request, session_allow_rule,
        user_message, DENIED_BY_USER,
    },
    spawner::{spawn_line_reader, spawn_stdin_writer, terminate_child},
    Slot,
};

const STREAM_ARGS: &[&str] = &[
    "--print",
    "--output-format",
    "stream-json",
    "--input-format",
    "stream-json",
    "--verbose",
    "--permission-prompt-tool",
    "stdio",
];

/// The `control_response` answering `permission` with `decision`.
pub fn decision_frame(permission: &PendingPermission, decision: Decision) -> Value {
    let tool_use_id = permission.tool_use_id.as_deref();
    match decision {
        Decision::Yes => allow_response(
            &permission.request_id,
            tool_use_id,
            &permission.tool_input,
            None,
        ),
        Decision::Always => {
            let rules = permission
                .permission_suggestions
                .clone()
                .filter(|s| s.as_array().map_or(true, |rules| !rules.is_empty()))
                .unwrap_or_else(|| session_allow_rule(&permission.tool_name));
            allow_response(
                &permission.request_id,
                tool_use_id,
                &permission.tool_input,
                Some(rules),
            )
        }
        Decision::No => deny_response(&permission.request_id, tool_use_id, DENIED_BY_USER),
    }
}

pub struct StreamAdapter {
    slot: Slot,
    epoch: u64,
    program: String,
    args: Vec<String>,
    options: SpawnOptions,
    stop_grace: Duration,
    events: mpsc::Sender<EngineEvent>,
    child: Option<Child>,
    stdin_tx: Option<mpsc::UnboundedSender<String>>,
}

impl StreamAdapter {
    pub fn new(
        slot: Slot,
        epoch: u64,
        settings: &LaunchSettings,
        options: SpawnOptions,
        events: mpsc::Sender<EngineEvent>,
    ) -> Self {
        Self {
            slot,
            epoch,
            program: settings.program.clone(),
            args: settings.args.clone(),
            options,
            stop_grace: settings.stop_grace,
            events,
            child: None,
            stdin_tx: None,
        }
    }

    fn command_args(&self) -> Vec<String> {
        let mut args = self.args.clone();
        args.extend(STREAM_ARGS.iter().map(|arg| arg.to_string()));
        if let Some(session_id) = &self.options.resume {
            args.push("--resume".to_string());
            args.push(session_id.clone());
        }
        args
    }

    fn write(&mut self, frame: Value) {
        let Some(tx) = &self.stdin_tx else {
            tracing::warn!(target = "companion_broker::adapter", slot = self.slot, "agent not running; dropping frame");
            return;
        };
        if tx.send(frame.to_string()).is_err() {
            tracing::warn!(target = "companion_broker::adapter", slot = self.slot, "agent stdin writer gone; dropping frame");
            self.stdin_tx = None;
        }
    }
}

impl AgentAdapter for StreamAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Stream
    }

    fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    fn start(&mut self, initial_input: Option<&str>) -> Result<(), BrokerError> {
        if self.child.is_some() {
            return Ok(());
        }

        let slot = self.slot;
        let epoch = self.epoch;
        let mut cmd = Command::new(&self.program);
        cmd.args(self.command_args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.options.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(|error| BrokerError::Spawn {
            slot,
            reason: format!("{}: {error}", self.program),
        })?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(BrokerError::Spawn {
                slot,
                reason: "agent stdio not captured".to_string(),
            });
        };

        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
        spawn_stdin_writer(slot, stdin, stdin_rx);
        spawn_line_reader(
            slot,
            "stdout",
            stdout,
            self.events.clone(),
            move |line| Some(EngineEvent::AgentOutput { slot, epoch, line }),
            Some(EngineEvent::AgentExited { slot, epoch }),
        );
        if let Some(stderr) = child.stderr.take() {
            spawn_line_reader(
                slot,
                "stderr",
                stderr,
                self.events.clone(),
                move |line| {
                    tracing::debug!(target = "companion_broker::adapter", slot, line = %line, "agent stderr");
                    None
                },
                None,
            );
        }

        tracing::info!(
            target = "companion_broker::adapter",
            slot,
            epoch,
            pid = ?child.id(),
            resume = ?self.options.resume,
            "spawned stream agent"
        );
        self.child = Some(child);
        self.stdin_tx = Some(stdin_tx);

        self.write(initialize_request());
        if let Some(text) = initial_input.filter(|text| !text.trim().is_empty()) {
            self.write(user_message(text));
        }
        Ok(())
    }

    fn stop(&mut self) {
        self.stdin_tx = None;
        if let Some(mut child) = self.child.take() {
            let grace = self.stop_grace;
            let slot = self.slot;
            tokio::spawn(async move {
                terminate_child(&mut child, grace).await;
                tracing::debug!(target = "companion_broker::adapter", slot, "stream agent terminated");
            });
        }
    }

    fn send_decision(&mut self, permission: &PendingPermission, decision: Decision) {
        self.write(decision_frame(permission, decision));
    }

    fn interrupt(&mut self) {
        self.write(interrupt_request());
    }

    fn send_free_text(&mut self, text: &str) {
        self.write(user_message(text));
    }

    fn prompt_channel(&self) -> PromptChannel {
        PromptChannel::Stream
    }

    fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }
}
