//! Screen-text prompt detection for agents driven through a terminal pane.
//!
//! The agent renders a permission prompt as a bordered box describing the tool
//! call, followed by a confirmation question and a numbered option list:
//!
//! ```text
//! ╭──────────────────────────────╮
//! │ Bash command                 │
//! │   git status                 │
//! │   Show working tree status   │
//! ╰──────────────────────────────╯
//! Do you want to proceed?
//! ❯ 1. Yes
//!   2. Yes, and don't ask again
//!   3. No
//! ```

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::helpers::strip_ansi;

const QUESTIONS: &[&str] = &[
    "Do you want to proceed?",
    "Do you want to make this edit",
    "Do you want to create",
];

/// Lines after the question searched for an affirmative option.
const YES_LOOKAHEAD: usize = 6;
/// Lines above the question searched for the tool description.
const BACKWARD_LIMIT: usize = 15;
const MAX_FIELDS: usize = 3;

pub const PLACEHOLDER_TOOL: &str = "Tool";
pub const PLACEHOLDER_DETAIL: &str = "Permission requested";

static YES_OPTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:[>❯›]\s*)?(?:\d+[.)]\s*)?yes\b").expect("valid regex")
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptInfo {
    pub tool_type: String,
    pub tool_detail: String,
    pub description: String,
}

impl PromptInfo {
    pub fn placeholder() -> Self {
        Self {
            tool_type: PLACEHOLDER_TOOL.to_string(),
            tool_detail: PLACEHOLDER_DETAIL.to_string(),
            description: String::new(),
        }
    }

    /// Two prompts are the same prompt when type and detail agree.
    pub fn same_prompt(&self, other: &PromptInfo) -> bool {
        self.tool_type == other.tool_type && self.tool_detail == other.tool_detail
    }
}

fn strip_border(line: &str) -> &str {
    line.trim()
        .trim_start_matches('│')
        .trim_end_matches('│')
        .trim()
}

fn is_rule_line(text: &str) -> bool {
    text.chars()
        .all(|c| c.is_whitespace() || ('\u{2500}'..='\u{257F}').contains(&c))
}

pub fn parse_prompt(screen: &str) -> Option<PromptInfo> {
    let clean = strip_ansi(screen);
    let lines: Vec<&str> = clean.lines().collect();

    // The bottom-most question is the live one; earlier ones are scrollback.
    let question = lines
        .iter()
        .rposition(|line| QUESTIONS.iter().any(|q| line.contains(q)))?;

    let lookahead_end = (question + 1 + YES_LOOKAHEAD).min(lines.len());
    let has_yes = lines[question + 1..lookahead_end]
        .iter()
        .any(|line| YES_OPTION.is_match(strip_border(line)));
    if !has_yes {
        return None;
    }

    let floor = question.saturating_sub(BACKWARD_LIMIT);
    let mut collected: Vec<&str> = Vec::new();
    let mut bordered = false;
    for line in lines[floor..question].iter().rev() {
        let trimmed = line.trim();
        if trimmed.starts_with('╭') || trimmed.starts_with('┌') {
            bordered = true;
            break;
        }
        if trimmed.starts_with('╰') || trimmed.starts_with('└') {
            continue;
        }
        let text = strip_border(trimmed);
        if text.is_empty() || is_rule_line(text) {
            continue;
        }
        collected.push(text);
    }
    collected.reverse();

    if !bordered && collected.len() > MAX_FIELDS {
        collected.drain(..collected.len() - MAX_FIELDS);
    }

    let field = |idx: usize| collected.get(idx).map(|s| s.to_string()).unwrap_or_default();
    let info = PromptInfo {
        tool_type: field(0),
        tool_detail: field(1),
        description: field(2),
    };
    if info.tool_type.is_empty() && info.tool_detail.is_empty() {
        return Some(PromptInfo::placeholder());
    }
    Some(info)
}
