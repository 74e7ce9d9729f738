//! Observer registration for stats, preview frames, and errors.
//!
//! Modeled as one-way callback registration rather than a delegate with a
//! back-pointer to the UI (§9 Design Notes): a pipeline owns a list of
//! callbacks it invokes; it never holds a reference back into whatever
//! registered them.

use crate::error::Error;
use crate::session::StatsSnapshot;

pub type StatsObserver = Box<dyn Fn(StatsSnapshot) + Send + Sync>;
pub type PreviewObserver = Box<dyn Fn(&[u8]) + Send + Sync>;
pub type ErrorObserver = Box<dyn Fn(&Error) + Send + Sync>;

/// The stats/preview/error observer slots a pipeline notifies. State change
/// notification is handled separately by [`crate::state::StateMachine`],
/// which owns its own observer list.
#[derive(Default)]
pub struct ObserverRegistry {
    stats: Vec<StatsObserver>,
    preview: Vec<PreviewObserver>,
    error: Vec<ErrorObserver>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_stats(&mut self, observer: StatsObserver) {
        self.stats.push(observer);
    }

    pub fn on_preview(&mut self, observer: PreviewObserver) {
        self.preview.push(observer);
    }

    pub fn on_error(&mut self, observer: ErrorObserver) {
        self.error.push(observer);
    }

    pub fn notify_stats(&self, snapshot: StatsSnapshot) {
        for observer in &self.stats {
            observer(snapshot);
        }
    }

    pub fn notify_preview(&self, frame: &[u8]) {
        for observer in &self.preview {
            observer(frame);
        }
    }

    /// Reports a user-visible error. Per §7, this is for errors that reach
    /// the user; single recovered framing errors are logged at debug/warn
    /// instead of reaching here.
    pub fn notify_error(&self, error: &Error) {
        log::error!("{error}");
        for observer in &self.error {
            observer(error);
        }
    }
}
