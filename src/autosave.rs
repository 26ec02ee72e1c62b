//! Autosave Scheduler
//!
//! Debounce-with-cancel for section persistence. Every edit restarts the
//! section's delay window; when a window elapses untouched, the scheduled
//! save future runs. A burst of edits therefore produces exactly one save,
//! carrying the state as of the last edit.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::section::SectionKind;

/// Delay between the last edit and the automatic save
pub const AUTOSAVE_DELAY_MS: u64 = 3000;

/// Per-section single-shot save timers.
///
/// Pending timers must be cancelled on teardown so no save fires against a
/// closed session; dropping the scheduler cancels whatever is left.
pub struct AutosaveScheduler {
    delay: Duration,
    pending: HashMap<SectionKind, tokio::task::JoinHandle<()>>,
}

impl AutosaveScheduler {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: HashMap::new(),
        }
    }

    pub fn with_default_delay() -> Self {
        Self::new(Duration::from_millis(AUTOSAVE_DELAY_MS))
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// (Re)start the debounce window for a section.
    ///
    /// Any pending timer for the same section is aborted first, including
    /// one whose save is already in flight; last write wins.
    pub fn schedule<F>(&mut self, section: SectionKind, save: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if let Some(previous) = self.pending.remove(&section) {
            previous.abort();
            debug!("Restarted autosave window for {}", section.as_str());
        }
        let delay = self.delay;
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            save.await;
        });
        self.pending.insert(section, task);
    }

    /// Drop a section's pending timer. Returns true if one was pending.
    ///
    /// Used on teardown and right before a manual save so the manual save
    /// is not followed by a duplicate automatic one.
    pub fn cancel(&mut self, section: SectionKind) -> bool {
        match self.pending.remove(&section) {
            Some(task) => {
                task.abort();
                debug!("Cancelled pending autosave for {}", section.as_str());
                true
            }
            None => false,
        }
    }

    /// Drop every pending timer
    pub fn cancel_all(&mut self) {
        for (section, task) in self.pending.drain() {
            task.abort();
            debug!("Cancelled pending autosave for {}", section.as_str());
        }
    }

    pub fn has_pending(&self, section: SectionKind) -> bool {
        self.pending
            .get(&section)
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }

    pub fn pending_count(&self) -> usize {
        self.pending
            .values()
            .filter(|task| !task.is_finished())
            .count()
    }
}

impl Drop for AutosaveScheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
