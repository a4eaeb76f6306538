//! Recording adapter and engine harness shared by the integration tests.

#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use companion_broker::{
    adapter::{AdapterFactory, AdapterKind, AgentAdapter, Decision, PromptChannel, SpawnOptions},
    engine::{Engine, EngineConfig, EngineEvent},
    error::BrokerError,
    permission::PendingPermission,
    Slot,
};

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Start(Option<String>),
    Stop,
    Decision(PendingPermission, Decision),
    Interrupt,
    Text(String),
}

#[derive(Clone, Default)]
pub struct Recorder {
    calls: Arc<Mutex<Vec<(Slot, Call)>>>,
}

impl Recorder {
    pub fn calls(&self) -> Vec<(Slot, Call)> {
        self.calls.lock().clone()
    }

    pub fn decisions(&self) -> Vec<(Slot, PendingPermission, Decision)> {
        self.calls()
            .into_iter()
            .filter_map(|(slot, call)| match call {
                Call::Decision(permission, decision) => Some((slot, permission, decision)),
                _ => None,
            })
            .collect()
    }

    fn record(&self, slot: Slot, call: Call) {
        self.calls.lock().push((slot, call));
    }
}

pub struct RecordingAdapter {
    slot: Slot,
    recorder: Recorder,
    channel: PromptChannel,
    running: bool,
}

impl AgentAdapter for RecordingAdapter {
    fn kind(&self) -> AdapterKind {
        match self.channel {
            PromptChannel::Stream => AdapterKind::Stream,
            PromptChannel::Screen { .. } => AdapterKind::Tmux,
        }
    }

    fn is_running(&mut self) -> bool {
        self.running
    }

    fn start(&mut self, initial_input: Option<&str>) -> Result<(), BrokerError> {
        self.running = true;
        self.recorder
            .record(self.slot, Call::Start(initial_input.map(str::to_string)));
        Ok(())
    }

    fn stop(&mut self) {
        self.running = false;
        self.recorder.record(self.slot, Call::Stop);
    }

    fn send_decision(&mut self, permission: &PendingPermission, decision: Decision) {
        self.recorder
            .record(self.slot, Call::Decision(permission.clone(), decision));
    }

    fn interrupt(&mut self) {
        self.recorder.record(self.slot, Call::Interrupt);
    }

    fn send_free_text(&mut self, text: &str) {
        self.recorder.record(self.slot, Call::Text(text.to_string()));
    }

    fn prompt_channel(&self) -> PromptChannel {
        self.channel
    }
}

pub struct RecordingFactory {
    pub recorder: Recorder,
    pub channel: PromptChannel,
}

impl AdapterFactory for RecordingFactory {
    fn create(&self, slot: Slot, _epoch: u64, _options: &SpawnOptions) -> Box<dyn AgentAdapter> {
        Box::new(RecordingAdapter {
            slot,
            recorder: self.recorder.clone(),
            channel: self.channel,
            running: false,
        })
    }
}

pub fn engine_config(max_slots: usize, auto_edit: bool) -> EngineConfig {
    EngineConfig {
        max_slots,
        auto_edit,
        health_interval: Duration::from_secs(30),
        json_output: false,
    }
}

/// An engine driven synchronously, with one connected control client.
pub struct Harness {
    pub engine: Engine,
    pub recorder: Recorder,
    client: mpsc::UnboundedReceiver<String>,
}

impl Harness {
    pub fn new(max_slots: usize, auto_edit: bool, channel: PromptChannel) -> Self {
        let recorder = Recorder::default();
        let mut engine = Engine::new(
            engine_config(max_slots, auto_edit),
            Box::new(RecordingFactory {
                recorder: recorder.clone(),
                channel,
            }),
        );
        let (tx, client) = mpsc::unbounded_channel();
        engine.handle(EngineEvent::ClientConnected { id: 1, tx });
        let mut harness = Self {
            engine,
            recorder,
            client,
        };
        harness.frames();
        harness
    }

    pub fn stream(max_slots: usize) -> Self {
        Self::new(max_slots, false, PromptChannel::Stream)
    }

    pub fn client_send(&mut self, message: Value) {
        self.engine.handle(EngineEvent::ClientMessage {
            id: 1,
            text: message.to_string(),
        });
    }

    pub fn spawn(&mut self, slot: Slot) {
        self.client_send(serde_json::json!({"type": "spawn_request", "slot": slot}));
    }

    pub fn epoch(&self, slot: Slot) -> u64 {
        self.engine
            .registry()
            .epoch_of(slot)
            .expect("slot should be occupied")
    }

    pub fn agent_line(&mut self, slot: Slot, message: Value) {
        let epoch = self.epoch(slot);
        self.engine.handle(EngineEvent::AgentOutput {
            slot,
            epoch,
            line: message.to_string(),
        });
    }

    /// Every frame broadcast since the last call.
    pub fn frames(&mut self) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(text) = self.client.try_recv() {
            frames.push(serde_json::from_str(&text).expect("frames are json"));
        }
        frames
    }

    /// Latest `agent_status` frame for `slot` among pending frames.
    pub fn last_status(&mut self, slot: Slot) -> Value {
        self.frames()
            .into_iter()
            .filter(|frame| frame["type"] == "agent_status" && frame["slot"] == slot)
            .last()
            .expect("a status frame for the slot")
    }
}

pub fn can_use_tool(request_id: &str, tool: &str, input: Value) -> Value {
    serde_json::json!({
        "type": "control_request",
        "request_id": request_id,
        "request": {
            "subtype": "can_use_tool",
            "tool_name": tool,
            "input": input,
            "tool_use_id": format!("toolu_{request_id}"),
        }
    })
}
