//! Registers the broker's hook callbacks in the agent CLI's settings file.
//!
//! Each event gets one `curl` command posting the hook payload to
//! `http://localhost:<port>/hook/<event>`. Entries containing that URL
//! prefix belong to the broker; everything else in the file is preserved.

use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use serde_json::{json, Map, Value};

use crate::protocol::HookKind;

/// Seconds a non-blocking hook command may take.
const QUICK_HOOK_MAX_SECS: u64 = 2;

pub fn default_settings_path() -> Result<PathBuf> {
    let home = dirs::home_dir().context("cannot determine home directory")?;
    Ok(home.join(".claude").join("settings.json"))
}

fn marker(port: u16) -> String {
    format!("localhost:{port}/hook/")
}

/// The shell command the agent runs for `kind`. It never fails the agent's
/// hook; an unreachable broker means no decision.
pub fn hook_command(port: u16, kind: HookKind, hook_timeout_secs: u64) -> String {
    let max_time = match kind {
        HookKind::PreTool => hook_timeout_secs + 5,
        _ => QUICK_HOOK_MAX_SECS,
    };
    format!(
        "curl -s --connect-timeout 1 --max-time {max_time} -X POST http://{}{} -H \"Content-Type: application/json\" -d @-; exit 0",
        marker(port),
        kind.path_segment(),
    )
}

fn is_broker_entry(entry: &Value, marker: &str) -> bool {
    entry
        .get("hooks")
        .and_then(Value::as_array)
        .is_some_and(|hooks| {
            hooks.iter().any(|hook| {
                hook.get("command")
                    .and_then(Value::as_str)
                    .is_some_and(|command| command.contains(marker))
            })
        })
}

fn hooks_object(settings: &mut Value) -> Result<&mut Map<String, Value>> {
    let Some(root) = settings.as_object_mut() else {
        bail!("settings file is not a JSON object");
    };
    let hooks = root
        .entry("hooks")
        .or_insert_with(|| Value::Object(Map::new()));
    hooks
        .as_object_mut()
        .context("\"hooks\" in settings file is not a JSON object")
}

/// Replace earlier broker entries with fresh ones for every hook event.
pub fn merge_hooks(settings: &mut Value, port: u16, hook_timeout_secs: u64) -> Result<()> {
    let marker = marker(port);
    let hooks = hooks_object(settings)?;
    for kind in HookKind::ALL {
        let entries = hooks
            .entry(kind.settings_event())
            .or_insert_with(|| Value::Array(Vec::new()));
        let Some(entries) = entries.as_array_mut() else {
            bail!("hooks.{} in settings file is not an array", kind.settings_event());
        };
        entries.retain(|entry| !is_broker_entry(entry, &marker));
        entries.push(json!({
            "matcher": "",
            "hooks": [{
                "type": "command",
                "command": hook_command(port, kind, hook_timeout_secs),
            }],
        }));
    }
    Ok(())
}

/// Drop broker entries, and any event lists or `hooks` object left empty.
/// Returns the number of entries removed.
pub fn remove_hooks(settings: &mut Value, port: u16) -> usize {
    let marker = marker(port);
    let Some(root) = settings.as_object_mut() else {
        return 0;
    };
    let Some(hooks) = root.get_mut("hooks").and_then(Value::as_object_mut) else {
        return 0;
    };

    let mut removed = 0;
    for kind in HookKind::ALL {
        let Some(entries) = hooks
            .get_mut(kind.settings_event())
            .and_then(Value::as_array_mut)
        else {
            continue;
        };
        let before = entries.len();
        entries.retain(|entry| !is_broker_entry(entry, &marker));
        removed += before - entries.len();
        if entries.is_empty() && before > 0 {
            hooks.remove(kind.settings_event());
        }
    }
    if hooks.is_empty() {
        root.remove("hooks");
    }
    removed
}

fn read_settings(path: &Path) -> Result<Option<Value>> {
    match fs::read_to_string(path) {
        Ok(text) if text.trim().is_empty() => Ok(Some(json!({}))),
        Ok(text) => serde_json::from_str(&text)
            .map(Some)
            .with_context(|| format!("failed to parse {}", path.display())),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(error) => Err(error).with_context(|| format!("failed to read {}", path.display())),
    }
}

fn write_settings(path: &Path, settings: &Value) -> Result<()> {
    let dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;

    let mut file = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("failed to create temp file in {}", dir.display()))?;
    let text = serde_json::to_string_pretty(settings)?;
    file.write_all(text.as_bytes())?;
    file.write_all(b"\n")?;
    file.persist(path)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

pub fn install_hooks(path: &Path, port: u16, hook_timeout_secs: u64) -> Result<()> {
    let mut settings = read_settings(path)?.unwrap_or_else(|| json!({}));
    merge_hooks(&mut settings, port, hook_timeout_secs)?;
    write_settings(path, &settings)?;
    tracing::info!(
        target = "companion_broker::hooks",
        path = %path.display(),
        port,
        events = HookKind::ALL.len(),
        "hooks installed"
    );
    Ok(())
}

pub fn uninstall_hooks(path: &Path, port: u16) -> Result<usize> {
    let Some(mut settings) = read_settings(path)? else {
        tracing::info!(target = "companion_broker::hooks", path = %path.display(), "no settings file; nothing to remove");
        return Ok(0);
    };
    let removed = remove_hooks(&mut settings, port);
    if removed > 0 {
        write_settings(path, &settings)?;
    }
    tracing::info!(target = "companion_broker::hooks", path = %path.display(), removed, "hooks removed");
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::*;

    fn commands(settings: &Value, event: &str) -> Vec<String> {
        settings["hooks"][event]
            .as_array()
            .map(|entries| {
                entries
                    .iter()
                    .flat_map(|entry| entry["hooks"].as_array().cloned().unwrap_or_default())
                    .filter_map(|hook| hook["command"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    #[test]
    fn pre_tool_command_outlasts_the_broker_timeout() {
        let command = hook_command(3333, HookKind::PreTool, 300);
        assert!(command.contains("--max-time 305"));
        assert!(command.contains("http://localhost:3333/hook/pre-tool"));
        assert!(command.ends_with("; exit 0"));
        assert!(hook_command(3333, HookKind::Stop, 300).contains("--max-time 2"));
    }

    #[test]
    fn merge_preserves_foreign_entries_and_replaces_own() {
        let mut settings = json!({
            "model": "opus",
            "hooks": {
                "PreToolUse": [
                    {"matcher": "Bash", "hooks": [{"type": "command", "command": "lint.sh"}]},
                    {"matcher": "", "hooks": [{"type": "command", "command": "curl http://localhost:3333/hook/pre-tool"}]}
                ]
            }
        });
        merge_hooks(&mut settings, 3333, 300).expect("merge");
        merge_hooks(&mut settings, 3333, 300).expect("merge twice");

        assert_eq!(settings["model"], "opus");
        let pre = commands(&settings, "PreToolUse");
        assert_eq!(pre.len(), 2);
        assert_eq!(pre[0], "lint.sh");
        assert!(pre[1].contains("--max-time 305"));
        for kind in HookKind::ALL {
            assert!(!commands(&settings, kind.settings_event()).is_empty());
        }
    }

    #[test]
    fn remove_only_touches_broker_entries() {
        let mut settings = json!({"hooks": {"Stop": [
            {"matcher": "", "hooks": [{"type": "command", "command": "notify.sh"}]}
        ]}});
        merge_hooks(&mut settings, 4000, 60).expect("merge");
        assert_eq!(remove_hooks(&mut settings, 3333), 0);
        assert_eq!(remove_hooks(&mut settings, 4000), HookKind::ALL.len());
        assert_eq!(commands(&settings, "Stop"), vec!["notify.sh".to_string()]);
        assert!(settings["hooks"].get("PreToolUse").is_none());
    }

    #[test]
    fn non_object_settings_are_rejected() {
        let mut settings = json!([1, 2]);
        assert!(merge_hooks(&mut settings, 3333, 300).is_err());
    }

    #[test]
    fn install_and_uninstall_round_trip_on_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(".claude").join("settings.json");

        install_hooks(&path, 3333, 300).expect("install into missing file");
        let installed: Value =
            serde_json::from_str(&std::fs::read_to_string(&path).expect("read")).expect("json");
        assert_eq!(commands(&installed, "UserPromptSubmit").len(), 1);

        assert_eq!(uninstall_hooks(&path, 3333).expect("uninstall"), HookKind::ALL.len());
        let cleaned: Value =
            serde_json::from_str(&std::fs::read_to_string(&path).expect("read")).expect("json");
        assert_eq!(cleaned, json!({}));
    }

    #[test]
    fn unparseable_settings_are_left_alone() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").expect("write");
        assert!(install_hooks(&path, 3333, 300).is_err());
        assert_eq!(std::fs::read_to_string(&path).expect("read"), "{ not json");
    }
}
