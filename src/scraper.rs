//! Edge-triggered prompt detection over a polled terminal pane.

use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::{sync::mpsc, task::JoinHandle, time::MissedTickBehavior};

use crate::{
    engine::EngineEvent,
    parser::{parse_prompt, PromptInfo},
    tmux, Slot,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScrapeEdge {
    Appeared(PromptInfo),
    Disappeared,
}

/// `idle ⇄ prompting` state machine fed one parse result per poll.
#[derive(Debug, Default)]
pub struct PromptScraper {
    current: Option<PromptInfo>,
}

impl PromptScraper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<&PromptInfo> {
        self.current.as_ref()
    }

    pub fn observe(&mut self, parsed: Option<PromptInfo>) -> Option<ScrapeEdge> {
        let Some(next) = parsed else {
            return self.current.take().map(|_| ScrapeEdge::Disappeared);
        };
        if self
            .current
            .as_ref()
            .is_some_and(|previous| previous.same_prompt(&next))
        {
            return None;
        }
        self.current = Some(next.clone());
        Some(ScrapeEdge::Appeared(next))
    }

    /// Feed raw screen text, or `None` when the pane could not be read.
    pub fn observe_screen(&mut self, screen: Option<&str>) -> Option<ScrapeEdge> {
        self.observe(screen.and_then(parse_prompt))
    }
}

/// What the poller has learned about its pane, shared with the adapter.
#[derive(Debug, Default, Clone, Copy)]
pub struct PaneState {
    pub alive: bool,
    /// The pane has been observed alive at least once.
    pub seen: bool,
}

pub type SharedPaneState = Arc<Mutex<PaneState>>;

pub struct PaneScraperConfig {
    pub slot: Slot,
    pub epoch: u64,
    pub session: String,
    pub interval: Duration,
}

pub fn spawn_pane_scraper(
    config: PaneScraperConfig,
    pane: SharedPaneState,
    tx: mpsc::Sender<EngineEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let PaneScraperConfig {
            slot,
            epoch,
            session,
            interval,
        } = config;
        let mut scraper = PromptScraper::new();
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::debug!(target = "companion_broker::scraper", slot, session = %session, "pane scraper started");

        loop {
            tick.tick().await;

            let alive = tmux::has_session(&session).await;
            let changed = {
                let mut state = pane.lock();
                let changed = state.alive != alive;
                state.alive = alive;
                state.seen |= alive;
                changed
            };
            if changed
                && tx
                    .send(EngineEvent::PaneAvailability {
                        slot,
                        epoch,
                        available: alive,
                    })
                    .await
                    .is_err()
            {
                break;
            }

            let screen = if alive {
                match tmux::capture_pane(&session).await {
                    Ok(text) if !text.trim().is_empty() => Some(text),
                    Ok(_) => None,
                    Err(error) => {
                        tracing::debug!(target = "companion_broker::scraper", slot, error = %error, "capture failed");
                        None
                    }
                }
            } else {
                None
            };

            if let Some(edge) = scraper.observe_screen(screen.as_deref()) {
                if tx
                    .send(EngineEvent::Scrape { slot, epoch, edge })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::{PromptScraper, ScrapeEdge};
    use crate::parser::PromptInfo;

    fn prompt(tool: &str, detail: &str) -> PromptInfo {
        PromptInfo {
            tool_type: tool.into(),
            tool_detail: detail.into(),
            description: String::new(),
        }
    }

    #[test]
    fn sequence_emits_one_event_per_edge() {
        let a = prompt("Bash command", "git status");
        let b = prompt("Bash command", "git diff");
        let mut scraper = PromptScraper::new();

        let edges: Vec<ScrapeEdge> = [None, Some(a.clone()), Some(a.clone()), Some(b.clone()), None]
            .into_iter()
            .filter_map(|parsed| scraper.observe(parsed))
            .collect();

        assert_eq!(
            edges,
            vec![
                ScrapeEdge::Appeared(a),
                ScrapeEdge::Appeared(b),
                ScrapeEdge::Disappeared,
            ]
        );
        assert!(scraper.current().is_none());
    }

    #[test]
    fn description_change_alone_is_not_a_new_prompt() {
        let mut scraper = PromptScraper::new();
        let mut first = prompt("Write", "a.txt");
        scraper.observe(Some(first.clone()));
        first.description = "different".into();
        assert_eq!(scraper.observe(Some(first)), None);
    }

    #[test]
    fn unreadable_pane_counts_as_no_prompt() {
        let mut scraper = PromptScraper::new();
        let screen = "Do you want to proceed?\n❯ 1. Yes\n";
        assert!(matches!(
            scraper.observe_screen(Some(screen)),
            Some(ScrapeEdge::Appeared(_))
        ));
        assert_eq!(scraper.observe_screen(None), Some(ScrapeEdge::Disappeared));
        assert_eq!(scraper.observe_screen(None), None);
    }
}
