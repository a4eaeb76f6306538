//! Wire types for the three JSON surfaces the broker speaks:
//!
//! * the control-client WebSocket (`ClientMessage` in, `ServerMessage` out),
//! * hook callbacks posted by the agent CLI (`HookPayload`, `HookVerdict`),
//! * the agent's NDJSON stdio stream (`AgentMessage` in, builder functions out).

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::{status::AgentState, Slot};

pub const DEFAULT_CONTEXT_WINDOW: u64 = 200_000;
pub const DENIED_BY_USER: &str = "Denied by user";

// ---------------------------------------------------------------------------
// Control client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientAction {
    Yes,
    Always,
    No,
    Escape,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Action {
        action: ClientAction,
        #[serde(default)]
        slot: Option<Slot>,
    },
    Command {
        command: String,
        #[serde(default)]
        slot: Option<Slot>,
    },
    Config {
        #[serde(default, rename = "autoEdit")]
        auto_edit: Option<bool>,
    },
    SpawnRequest {
        slot: Slot,
        #[serde(default)]
        cwd: Option<String>,
        #[serde(default)]
        resume: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatusFrame {
    pub agent: String,
    pub state: AgentState,
    pub progress: i32,
    pub message: String,
    pub context_percent: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_tool_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_tool_detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_description: Option<String>,
    pub auto_edit: bool,
    pub slot: Slot,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    AgentStatus(AgentStatusFrame),
    SpawnResult {
        slot: Slot,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

// ---------------------------------------------------------------------------
// Hook callbacks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    PreTool,
    PostTool,
    SessionStart,
    SessionEnd,
    Stop,
    UserPrompt,
}

impl HookKind {
    pub const ALL: [HookKind; 6] = [
        HookKind::PreTool,
        HookKind::PostTool,
        HookKind::SessionStart,
        HookKind::SessionEnd,
        HookKind::Stop,
        HookKind::UserPrompt,
    ];

    pub fn from_path(segment: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.path_segment() == segment)
    }

    pub fn path_segment(self) -> &'static str {
        match self {
            HookKind::PreTool => "pre-tool",
            HookKind::PostTool => "post-tool",
            HookKind::SessionStart => "session-start",
            HookKind::SessionEnd => "session-end",
            HookKind::Stop => "stop",
            HookKind::UserPrompt => "user-prompt",
        }
    }

    /// Event name the agent CLI uses for this hook in its settings file.
    pub fn settings_event(self) -> &'static str {
        match self {
            HookKind::PreTool => "PreToolUse",
            HookKind::PostTool => "PostToolUse",
            HookKind::SessionStart => "SessionStart",
            HookKind::SessionEnd => "SessionEnd",
            HookKind::Stop => "Stop",
            HookKind::UserPrompt => "UserPromptSubmit",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct HookPayload {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub tool_name: Option<String>,
    /// Older CLI builds send `tool` instead of `tool_name`.
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(default)]
    pub tool_input: Option<Value>,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
    #[serde(default)]
    pub prompt: Option<String>,
}

impl HookPayload {
    pub fn tool_name(&self) -> &str {
        self.tool_name
            .as_deref()
            .or(self.tool.as_deref())
            .unwrap_or("Tool")
    }

    pub fn has_error(&self) -> bool {
        match &self.error {
            None | Some(Value::Null) | Some(Value::Bool(false)) => false,
            Some(Value::String(text)) => !text.is_empty(),
            Some(_) => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookVerdict {
    Approve,
    Block { reason: String },
}

impl HookVerdict {
    pub fn to_json(&self) -> Value {
        match self {
            HookVerdict::Approve => json!({ "decision": "approve" }),
            HookVerdict::Block { reason } => json!({ "decision": "block", "reason": reason }),
        }
    }
}

// ---------------------------------------------------------------------------
// Agent NDJSON stream: inbound
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub cache_creation_input_tokens: u64,
    pub cache_read_input_tokens: u64,
}

impl TokenUsage {
    pub fn from_value(value: &Value) -> Self {
        let field = |name: &str| value.get(name).and_then(Value::as_u64).unwrap_or(0);
        Self {
            input_tokens: field("input_tokens"),
            cache_creation_input_tokens: field("cache_creation_input_tokens"),
            cache_read_input_tokens: field("cache_read_input_tokens"),
        }
    }

    pub fn context_tokens(&self) -> u64 {
        self.input_tokens + self.cache_creation_input_tokens + self.cache_read_input_tokens
    }

    /// Percentage of `window` consumed, capped at 100.
    pub fn percent_of(&self, window: u64) -> u8 {
        if window == 0 {
            return 0;
        }
        let percent = (self.context_tokens() as f64 / window as f64 * 100.0).round();
        percent.clamp(0.0, 100.0) as u8
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolPermissionRequest {
    pub request_id: String,
    pub tool_name: String,
    pub input: Value,
    pub tool_use_id: Option<String>,
    pub description: Option<String>,
    pub suggestions: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AgentMessage {
    Init {
        session_id: Option<String>,
        model: Option<String>,
    },
    Compacting,
    Assistant {
        text: Option<String>,
        usage: Option<TokenUsage>,
        error: Option<String>,
    },
    Result {
        is_error: bool,
        subtype: String,
        /// Final text of the turn, or the error for a failed one.
        result: Option<String>,
        context_windows: Vec<(String, u64)>,
    },
    CanUseTool(ToolPermissionRequest),
    ControlCancel {
        request_id: String,
    },
    ToolProgress {
        tool_name: String,
        elapsed_secs: f64,
    },
    AuthError {
        message: String,
    },
    Ignored(String),
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(ToOwned::to_owned)
}

pub fn parse_agent_line(line: &str) -> Result<AgentMessage, serde_json::Error> {
    let value: Value = serde_json::from_str(line)?;
    Ok(parse_agent_message(&value))
}

pub fn parse_agent_message(value: &Value) -> AgentMessage {
    let msg_type = value.get("type").and_then(Value::as_str).unwrap_or("");
    match msg_type {
        "system" => match value.get("subtype").and_then(Value::as_str) {
            Some("init") => AgentMessage::Init {
                session_id: str_field(value, "session_id"),
                model: str_field(value, "model"),
            },
            Some("status") if value.get("status").and_then(Value::as_str) == Some("compacting") => {
                AgentMessage::Compacting
            }
            other => AgentMessage::Ignored(format!("system/{}", other.unwrap_or("?"))),
        },
        "assistant" => {
            let message = value.get("message");
            let text = message
                .and_then(|m| m.get("content"))
                .and_then(Value::as_array)
                .and_then(|blocks| {
                    blocks.iter().find_map(|block| {
                        if block.get("type").and_then(Value::as_str) == Some("text") {
                            block.get("text").and_then(Value::as_str)
                        } else {
                            None
                        }
                    })
                })
                .map(ToOwned::to_owned);
            let usage = message
                .and_then(|m| m.get("usage"))
                .map(TokenUsage::from_value);
            let error = match value.get("error") {
                None | Some(Value::Null) => None,
                Some(Value::String(text)) => Some(text.clone()),
                Some(other) => Some(other.to_string()),
            };
            AgentMessage::Assistant { text, usage, error }
        }
        "result" => {
            let context_windows = value
                .get("modelUsage")
                .and_then(Value::as_object)
                .map(|models| {
                    models
                        .iter()
                        .filter_map(|(model, usage)| {
                            usage
                                .get("contextWindow")
                                .and_then(Value::as_u64)
                                .map(|window| (model.clone(), window))
                        })
                        .collect()
                })
                .unwrap_or_default();
            AgentMessage::Result {
                is_error: value
                    .get("is_error")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
                subtype: str_field(value, "subtype").unwrap_or_default(),
                result: str_field(value, "result"),
                context_windows,
            }
        }
        "control_request" => {
            let request = value.get("request").cloned().unwrap_or(Value::Null);
            let subtype = request.get("subtype").and_then(Value::as_str).unwrap_or("");
            if subtype != "can_use_tool" {
                return AgentMessage::Ignored(format!("control_request/{subtype}"));
            }
            AgentMessage::CanUseTool(ToolPermissionRequest {
                request_id: str_field(value, "request_id").unwrap_or_default(),
                tool_name: str_field(&request, "tool_name").unwrap_or_else(|| "Tool".to_string()),
                input: request
                    .get("input")
                    .cloned()
                    .unwrap_or_else(|| Value::Object(Map::new())),
                tool_use_id: str_field(&request, "tool_use_id"),
                description: str_field(&request, "description"),
                suggestions: request
                    .get("permission_suggestions")
                    .filter(|s| !s.is_null())
                    .cloned(),
            })
        }
        "control_cancel_request" => AgentMessage::ControlCancel {
            request_id: str_field(value, "request_id").unwrap_or_default(),
        },
        "tool_progress" => AgentMessage::ToolProgress {
            tool_name: str_field(value, "tool_name").unwrap_or_else(|| "Tool".to_string()),
            elapsed_secs: value
                .get("elapsed_time_seconds")
                .and_then(Value::as_f64)
                .unwrap_or(0.0),
        },
        "auth_status" => match value.get("error") {
            Some(Value::String(message)) if !message.is_empty() => AgentMessage::AuthError {
                message: message.clone(),
            },
            _ => AgentMessage::Ignored("auth_status".to_string()),
        },
        other => AgentMessage::Ignored(other.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Agent NDJSON stream: outbound
// ---------------------------------------------------------------------------

pub fn user_message(text: &str) -> Value {
    json!({
        "type": "user",
        "message": { "role": "user", "content": text },
        "parent_tool_use_id": null,
        "session_id": "",
    })
}

pub fn interrupt_request() -> Value {
    json!({
        "type": "control_request",
        "request_id": Uuid::new_v4().to_string(),
        "request": { "subtype": "interrupt" },
    })
}

pub fn initialize_request() -> Value {
    json!({
        "type": "control_request",
        "request_id": Uuid::new_v4().to_string(),
        "request": { "subtype": "initialize" },
    })
}

pub fn allow_response(
    request_id: &str,
    tool_use_id: Option<&str>,
    input: &Value,
    updated_permissions: Option<Value>,
) -> Value {
    let mut body = json!({
        "behavior": "allow",
        "updatedInput": input,
    });
    if let Some(id) = tool_use_id {
        body["toolUseID"] = json!(id);
    }
    if let Some(permissions) = updated_permissions {
        body["updatedPermissions"] = permissions;
    }
    control_response(request_id, body)
}

pub fn deny_response(request_id: &str, tool_use_id: Option<&str>, message: &str) -> Value {
    let mut body = json!({ "behavior": "deny", "message": message });
    if let Some(id) = tool_use_id {
        body["toolUseID"] = json!(id);
    }
    control_response(request_id, body)
}

fn control_response(request_id: &str, body: Value) -> Value {
    json!({
        "type": "control_response",
        "response": {
            "subtype": "success",
            "request_id": request_id,
            "response": body,
        }
    })
}

/// Standing rule attached to an "always" decision when the agent offered no
/// suggestions of its own.
pub fn session_allow_rule(tool_name: &str) -> Value {
    json!([{
        "type": "addRules",
        "rules": [{ "toolName": tool_name }],
        "behavior": "allow",
        "destination": "session",
    }])
}
