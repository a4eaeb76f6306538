//! Thin async wrappers around the `tmux` CLI.

use std::{path::Path, process::Stdio};

use anyhow::{bail, Context, Result};
use tokio::process::Command;

/// Lines of scrollback captured above the visible pane.
const CAPTURE_HISTORY: &str = "-30";

async fn tmux_output(args: &[&str]) -> Result<std::process::Output> {
    Command::new("tmux")
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .with_context(|| format!("failed to run tmux {}", args.first().unwrap_or(&"")))
}

async fn tmux_checked(args: &[&str]) -> Result<()> {
    let output = tmux_output(args).await?;
    if !output.status.success() {
        bail!(
            "tmux {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

pub async fn has_session(session: &str) -> bool {
    match tmux_output(&["has-session", "-t", session]).await {
        Ok(output) => output.status.success(),
        Err(_) => false,
    }
}

/// Start a detached session running `command` in `cwd`.
pub async fn new_session(session: &str, cwd: Option<&Path>, command: &[String]) -> Result<()> {
    let cwd_arg = cwd.map(|dir| dir.to_string_lossy().into_owned());
    let joined = shlex::try_join(command.iter().map(String::as_str))
        .context("agent command contains a NUL byte")?;

    let mut args: Vec<&str> = vec!["new-session", "-d", "-s", session];
    if let Some(dir) = cwd_arg.as_deref() {
        args.extend(["-c", dir]);
    }
    if !joined.is_empty() {
        args.push(joined.as_str());
    }
    tmux_checked(&args).await
}

pub async fn kill_session(session: &str) -> Result<()> {
    tmux_checked(&["kill-session", "-t", session]).await
}

/// Send named keys (`Enter`, `Down`, `Escape`, ...).
pub async fn send_keys(session: &str, keys: &[&str]) -> Result<()> {
    let mut args = vec!["send-keys", "-t", session];
    args.extend_from_slice(keys);
    tmux_checked(&args).await
}

/// Type `text` verbatim; tmux does not interpret key names in literal mode.
pub async fn send_literal(session: &str, text: &str) -> Result<()> {
    tmux_checked(&["send-keys", "-t", session, "-l", text]).await
}

pub async fn capture_pane(session: &str) -> Result<String> {
    let output = tmux_output(&["capture-pane", "-p", "-t", session, "-S", CAPTURE_HISTORY]).await?;
    if !output.status.success() {
        bail!("capture-pane failed for {session}");
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
