pub mod adapter;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod events;
mod helpers;
pub mod hook_settings;
pub mod parser;
pub mod permission;
pub mod protocol;
pub mod scraper;
pub mod server;
pub mod session;
pub mod spawner;
pub mod status;
pub mod tmux;

/// Index of an agent slot, `0..max_slots`.
pub type Slot = usize;
