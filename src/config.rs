use std::{path::PathBuf, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::adapter::AdapterKind;

pub const DEFAULT_PORT: u16 = 3333;

#[derive(Debug, Parser)]
#[command(name = "companion-broker")]
#[command(version, about = "Supervises coding-agent sessions and relays their permission prompts to companion clients")]
#[command(args_conflicts_with_subcommands = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Serve flags, accepted without the `serve` subcommand too.
    #[command(flatten)]
    pub serve: ServeConfig,
}

impl Cli {
    pub fn into_command(self) -> Command {
        self.command.unwrap_or(Command::Serve(self.serve))
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the broker (the default when no subcommand is given).
    Serve(ServeConfig),
    /// Register the broker's callbacks in the agent's settings file.
    InstallHooks(HookSettingsArgs),
    /// Remove the broker's callbacks from the agent's settings file.
    UninstallHooks(HookSettingsArgs),
}

#[derive(Debug, Args, Clone)]
pub struct ServeConfig {
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    #[arg(long, default_value_t = 4, value_parser = clap::value_parser!(u16).range(1..=16))]
    pub max_slots: u16,

    #[arg(long, value_enum, default_value_t = AdapterKind::Stream)]
    pub adapter: AdapterKind,

    /// Agent command line; extra arguments are passed on every spawn.
    #[arg(long, default_value = "claude")]
    pub agent_cli: String,

    /// Working directory for spawned agents (defaults to the broker's own).
    #[arg(long)]
    pub cwd: Option<PathBuf>,

    #[arg(long, default_value = "claude-raids")]
    pub tmux_session: String,

    #[arg(long, default_value_t = 300)]
    pub scrape_interval_ms: u64,

    #[arg(long, default_value_t = 30)]
    pub health_interval_secs: u64,

    /// How long a blocking pre-tool hook waits for a decision before approving.
    #[arg(long, default_value_t = 300)]
    pub hook_timeout_secs: u64,

    /// Transcript polling for context usage in tmux mode; 0 disables it.
    #[arg(long, default_value_t = 10)]
    pub context_interval_secs: u64,

    #[arg(long, default_value_t = false)]
    pub auto_edit: bool,

    #[arg(long, default_value_t = false)]
    pub spawn_on_start: bool,

    #[arg(long, default_value = "info")]
    pub log_level: String,

    #[arg(long, default_value_t = false)]
    pub json_output: bool,
}

impl ServeConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn scrape_interval(&self) -> Duration {
        Duration::from_millis(self.scrape_interval_ms.max(50))
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs.max(1))
    }

    pub fn hook_timeout(&self) -> Duration {
        Duration::from_secs(self.hook_timeout_secs)
    }

    pub fn context_interval(&self) -> Option<Duration> {
        (self.context_interval_secs > 0).then(|| Duration::from_secs(self.context_interval_secs))
    }
}

#[derive(Debug, Args, Clone)]
pub struct HookSettingsArgs {
    /// Settings file to edit (defaults to ~/.claude/settings.json).
    #[arg(long)]
    pub settings: Option<PathBuf>,

    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Must match the broker's --hook-timeout-secs.
    #[arg(long, default_value_t = 300)]
    pub hook_timeout_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::{Cli, Command};
    use crate::adapter::AdapterKind;
    use clap::Parser;

    #[test]
    fn serve_defaults_match_documented_flags() {
        let Command::Serve(cfg) = Cli::parse_from(["companion-broker", "serve"]).into_command() else {
            panic!("expected serve");
        };
        assert_eq!(cfg.bind_addr(), "0.0.0.0:3333");
        assert_eq!(cfg.max_slots, 4);
        assert_eq!(cfg.adapter, AdapterKind::Stream);
        assert_eq!(cfg.agent_cli, "claude");
        assert_eq!(cfg.tmux_session, "claude-raids");
        assert_eq!(cfg.scrape_interval_ms, 300);
        assert_eq!(cfg.hook_timeout_secs, 300);
        assert!(!cfg.auto_edit);
        assert_eq!(cfg.context_interval_secs, 10);
    }

    #[test]
    fn bare_invocation_serves_with_top_level_flags() {
        let cli = Cli::parse_from(["companion-broker", "--port", "4000", "--auto-edit"]);
        assert!(cli.command.is_none());
        let Command::Serve(cfg) = cli.into_command() else {
            panic!("expected serve");
        };
        assert_eq!(cfg.port, 4000);
        assert!(cfg.auto_edit);
    }

    #[test]
    fn install_hooks_takes_its_own_flags() {
        let Command::InstallHooks(args) =
            Cli::parse_from(["companion-broker", "install-hooks", "--port", "4100"]).into_command()
        else {
            panic!("expected install-hooks");
        };
        assert_eq!(args.port, 4100);
        assert_eq!(args.hook_timeout_secs, 300);
        assert!(args.settings.is_none());
    }

    #[test]
    fn tmux_adapter_and_disabled_context_tracking() {
        let cli = Cli::parse_from([
            "companion-broker",
            "serve",
            "--adapter",
            "tmux",
            "--context-interval-secs",
            "0",
            "--max-slots",
            "2",
        ]);
        let Command::Serve(cfg) = cli.into_command() else {
            panic!("expected serve");
        };
        assert_eq!(cfg.adapter, AdapterKind::Tmux);
        assert_eq!(cfg.max_slots, 2);
        assert!(cfg.context_interval().is_none());
    }

    #[test]
    fn zero_slots_is_rejected() {
        assert!(Cli::try_parse_from(["companion-broker", "serve", "--max-slots", "0"]).is_err());
    }
}
