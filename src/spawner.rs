//! Child-process plumbing shared by the agent adapters.

use std::time::Duration;

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::Child,
    sync::mpsc,
    time::timeout,
};

#[cfg(unix)]
use nix::{
    sys::signal::{kill, Signal},
    unistd::Pid,
};

use crate::{engine::EngineEvent, error::BrokerError, Slot};

/// Split a configured agent command line (`"claude --model opus"`) into
/// program and arguments.
pub fn parse_agent_command(raw: &str) -> Result<(String, Vec<String>), BrokerError> {
    let mut parts = shlex::split(raw)
        .ok_or_else(|| BrokerError::InvalidCommand(format!("unbalanced quotes in '{raw}'")))?
        .into_iter();
    let program = parts
        .next()
        .ok_or_else(|| BrokerError::InvalidCommand("empty agent command".to_string()))?;
    Ok((program, parts.collect()))
}

pub async fn terminate_child(child: &mut Child, timeout_duration: Duration) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
    }

    #[cfg(not(unix))]
    {
        let _ = child.kill().await;
    }

    if timeout(timeout_duration, child.wait()).await.is_err() {
        #[cfg(unix)]
        {
            if let Some(pid) = child.id() {
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
            }
        }

        #[cfg(not(unix))]
        {
            let _ = child.kill().await;
        }

        let _ = child.wait().await;
    }
}

/// Forward each line of `reader` to the engine. `to_event` may return `None`
/// to consume a line locally; `on_eof` is sent once the stream closes.
pub fn spawn_line_reader<R, F>(
    slot: Slot,
    stream_name: &'static str,
    reader: R,
    tx: mpsc::Sender<EngineEvent>,
    to_event: F,
    on_eof: Option<EngineEvent>,
) where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
    F: Fn(String) -> Option<EngineEvent> + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let Some(event) = to_event(line) else {
                        continue;
                    };
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(error) => {
                    tracing::warn!(target = "companion_broker::spawner", slot, stream = stream_name, error = %error, "agent stream read failed");
                    break;
                }
            }
        }
        if let Some(event) = on_eof {
            let _ = tx.send(event).await;
        }
    });
}

/// Stdin writer: serialised frames in, newline-delimited writes out.
pub fn spawn_stdin_writer<W>(slot: Slot, mut stdin: W, mut rx: mpsc::UnboundedReceiver<String>)
where
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(mut frame) = rx.recv().await {
            frame.push('\n');
            if let Err(error) = stdin.write_all(frame.as_bytes()).await {
                tracing::warn!(target = "companion_broker::spawner", slot, error = %error, "agent stdin closed");
                break;
            }
            if let Err(error) = stdin.flush().await {
                tracing::warn!(target = "companion_broker::spawner", slot, error = %error, "agent stdin flush failed");
                break;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use std::{process::Stdio, time::Duration};

    use tokio::{process::Command, sync::mpsc};

    use super::{parse_agent_command, spawn_line_reader, spawn_stdin_writer, terminate_child};
    use crate::engine::EngineEvent;

    #[test]
    fn agent_command_is_shell_split() {
        let (program, args) =
            parse_agent_command("claude --model 'opus latest'").expect("valid command");
        assert_eq!(program, "claude");
        assert_eq!(args, vec!["--model", "opus latest"]);
    }

    #[test]
    fn empty_or_unbalanced_command_is_rejected() {
        assert!(parse_agent_command("   ").is_err());
        assert!(parse_agent_command("claude 'oops").is_err());
    }

    #[tokio::test]
    async fn terminate_stops_long_running_child() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        terminate_child(&mut child, Duration::from_millis(200)).await;
        assert!(child.try_wait().unwrap().is_some());
    }

    #[tokio::test]
    async fn writer_and_reader_round_trip_through_cat() {
        let mut child = Command::new("cat")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .unwrap();
        let stdin = child.stdin.take().unwrap();
        let stdout = child.stdout.take().unwrap();

        let (write_tx, write_rx) = mpsc::unbounded_channel();
        spawn_stdin_writer(3, stdin, write_rx);

        let (event_tx, mut event_rx) = mpsc::channel(8);
        spawn_line_reader(
            3,
            "stdout",
            stdout,
            event_tx,
            |line| {
                Some(EngineEvent::AgentOutput {
                    slot: 3,
                    epoch: 1,
                    line,
                })
            },
            Some(EngineEvent::AgentExited { slot: 3, epoch: 1 }),
        );

        write_tx.send(r#"{"type":"user"}"#.to_string()).unwrap();
        let echoed = tokio::time::timeout(Duration::from_secs(5), event_rx.recv())
            .await
            .unwrap();
        match echoed {
            Some(EngineEvent::AgentOutput { slot, line, .. }) => {
                assert_eq!(slot, 3);
                assert_eq!(line, r#"{"type":"user"}"#);
            }
            other => panic!("unexpected event: {other:?}"),
        }

        drop(write_tx);
        let exited = tokio::time::timeout(Duration::from_secs(5), event_rx.recv())
            .await
            .unwrap();
        assert!(matches!(
            exited,
            Some(EngineEvent::AgentExited { slot: 3, epoch: 1 })
        ));
        let _ = child.wait().await;
    }
}
