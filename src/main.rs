use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;

use companion_broker::{
    adapter::{AdapterKind, AgentLauncher, LaunchSettings},
    config::{Cli, Command, HookSettingsArgs, ServeConfig},
    context::{project_dir, spawn_context_tracker},
    engine::{Engine, EngineConfig},
    events::init_logging,
    hook_settings, server,
    spawner::parse_agent_command,
};

const EVENT_QUEUE: usize = 1024;
const STOP_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    match Cli::parse().into_command() {
        Command::Serve(cfg) => serve(cfg).await,
        Command::InstallHooks(args) => {
            init_logging("info")?;
            let path = settings_path(&args)?;
            hook_settings::install_hooks(&path, args.port, args.hook_timeout_secs)?;
            eprintln!("[companion-broker] hooks installed in {}", path.display());
            Ok(())
        }
        Command::UninstallHooks(args) => {
            init_logging("info")?;
            let path = settings_path(&args)?;
            let removed = hook_settings::uninstall_hooks(&path, args.port)?;
            eprintln!(
                "[companion-broker] removed {removed} hook entries from {}",
                path.display()
            );
            Ok(())
        }
    }
}

fn settings_path(args: &HookSettingsArgs) -> Result<PathBuf> {
    match &args.settings {
        Some(path) => Ok(path.clone()),
        None => hook_settings::default_settings_path(),
    }
}

async fn serve(cfg: ServeConfig) -> Result<()> {
    init_logging(&cfg.log_level)?;

    let (program, args) = parse_agent_command(&cfg.agent_cli)?;
    let default_cwd = match &cfg.cwd {
        Some(cwd) => Some(cwd.clone()),
        None => std::env::current_dir().ok(),
    };

    let (tx, rx) = mpsc::channel(EVENT_QUEUE);
    let launcher = AgentLauncher::new(
        LaunchSettings {
            kind: cfg.adapter,
            program,
            args,
            default_cwd: default_cwd.clone(),
            tmux_session: cfg.tmux_session.clone(),
            scrape_interval: cfg.scrape_interval(),
            stop_grace: STOP_GRACE,
        },
        tx.clone(),
    );
    let mut engine = Engine::new(
        EngineConfig {
            max_slots: usize::from(cfg.max_slots),
            auto_edit: cfg.auto_edit,
            health_interval: cfg.health_interval(),
            json_output: cfg.json_output,
        },
        Box::new(launcher),
    );

    let addr = cfg.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    let app = server::router(tx.clone(), cfg.hook_timeout());
    tokio::spawn(async move {
        if let Err(error) = axum::serve(listener, app).await {
            tracing::error!(target = "companion_broker::server", error = %error, "HTTP server error");
        }
    });
    tracing::info!(
        target = "companion_broker::server",
        addr = %addr,
        adapter = ?cfg.adapter,
        max_slots = cfg.max_slots,
        auto_edit = cfg.auto_edit,
        "listening for control clients and hooks"
    );

    if cfg.adapter == AdapterKind::Tmux {
        if let (Some(interval), Some(cwd)) = (cfg.context_interval(), default_cwd.as_deref()) {
            match dirs::home_dir() {
                Some(home) => {
                    spawn_context_tracker(0, project_dir(&home, cwd), interval, tx.clone());
                }
                None => {
                    tracing::warn!(target = "companion_broker::context", "no home directory; context tracking disabled");
                }
            }
        }
    }
    drop(tx);

    if cfg.spawn_on_start {
        engine.auto_spawn();
    }

    engine.run(rx).await
}
