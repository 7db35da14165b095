//! Idle-caller heuristic. Tracks when each caller last sent a heartbeat and,
//! once any of them goes quiet, forgets the shared known-files count. It never
//! touches running sandboxes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

pub const STALENESS_WINDOW: Duration = Duration::from_secs(15);
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
struct ActivityState {
    last_seen: HashMap<String, Instant>,
    known_files: usize,
}

/// Process-wide activity table. Starts empty.
#[derive(Debug, Clone, Default)]
pub struct SessionActivity {
    state: Arc<Mutex<ActivityState>>,
}

impl SessionActivity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn touch(&self, key: &str, now: Instant) {
        self.lock().last_seen.insert(key.to_owned(), now);
    }

    pub fn record_files(&self, count: usize) {
        let mut state = self.lock();
        state.known_files = state.known_files.saturating_add(count);
    }

    pub fn known_files(&self) -> usize {
        self.lock().known_files
    }

    pub fn tracked(&self) -> usize {
        self.lock().last_seen.len()
    }

    /// Drops every key idle for longer than `staleness` as of `now`. Returns the
    /// number removed; any removal also resets the known-files count.
    pub fn sweep(&self, now: Instant, staleness: Duration) -> usize {
        let mut state = self.lock();
        let before = state.last_seen.len();
        state
            .last_seen
            .retain(|_, seen| now.saturating_duration_since(*seen) <= staleness);
        let removed = before - state.last_seen.len();
        if removed > 0 {
            state.known_files = 0;
        }
        removed
    }

    pub fn spawn_reaper(&self, interval: Duration, staleness: Duration) -> JoinHandle<()> {
        let activity = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let removed = activity.sweep(Instant::now(), staleness);
                if removed > 0 {
                    info!(removed, "reaped idle callers; known files reset");
                } else {
                    debug!(tracked = activity.tracked(), "activity sweep");
                }
            }
        })
    }

    fn lock(&self) -> MutexGuard<'_, ActivityState> {
        // Every update is a single insert, retain or add, so a poisoned lock is still usable.
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
