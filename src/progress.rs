//! Progress reporting from long-running rebuilds to the UI shell.

use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// One progress tick as the shell's indicator sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub percent: u8,
    pub message: String,
    pub visible: bool,
}

/// Fan-out of `(percent, message)` ticks.
///
/// Reaching 100 % schedules an auto-hide after the grace delay; call
/// [`tick`](Self::tick) from the frame loop to apply it.
#[derive(Clone)]
pub struct ProgressChannel {
    inner: Arc<Mutex<ProgressInner>>,
}

struct ProgressInner {
    current: Option<ProgressUpdate>,
    hide_at: Option<Instant>,
    hide_delay: Duration,
    listeners: Vec<Sender<ProgressUpdate>>,
}

impl ProgressInner {
    fn broadcast(&mut self, update: ProgressUpdate) {
        self.listeners.retain(|tx| tx.send(update.clone()).is_ok());
        self.current = Some(update);
    }
}

impl ProgressChannel {
    pub fn new(hide_delay: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ProgressInner {
                current: None,
                hide_at: None,
                hide_delay,
                listeners: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ProgressInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self) -> Receiver<ProgressUpdate> {
        let (tx, rx) = std::sync::mpsc::channel();
        self.lock().listeners.push(tx);
        rx
    }

    pub fn report(&self, percent: u8, message: &str) {
        self.report_at(percent, message, Instant::now());
    }

    pub fn report_at(&self, percent: u8, message: &str, now: Instant) {
        let percent = percent.min(100);
        let mut inner = self.lock();
        let delay = inner.hide_delay;
        inner.hide_at = (percent == 100).then(|| now + delay);
        inner.broadcast(ProgressUpdate {
            percent,
            message: message.to_string(),
            visible: true,
        });
    }

    /// Hide a completed indicator once its grace delay has elapsed.
    /// Returns true when this call hid it.
    pub fn tick(&self, now: Instant) -> bool {
        let mut inner = self.lock();
        match inner.hide_at {
            Some(at) if now >= at => {
                inner.hide_at = None;
                let mut last = inner.current.clone().unwrap_or(ProgressUpdate {
                    percent: 100,
                    message: String::new(),
                    visible: true,
                });
                last.visible = false;
                inner.broadcast(last);
                true
            }
            _ => false,
        }
    }

    pub fn current(&self) -> Option<ProgressUpdate> {
        self.lock().current.clone()
    }

    pub fn is_visible(&self) -> bool {
        self.lock().current.as_ref().is_some_and(|u| u.visible)
    }
}

impl Default for ProgressChannel {
    fn default() -> Self {
        Self::new(Duration::from_millis(600))
    }
}

// Process-wide slot so code without a session handle can still report.
static GLOBAL_PROGRESS: Lazy<Mutex<Option<ProgressChannel>>> = Lazy::new(|| Mutex::new(None));

pub fn install_global(channel: &ProgressChannel) {
    *GLOBAL_PROGRESS.lock().unwrap_or_else(PoisonError::into_inner) = Some(channel.clone());
}

pub fn global() -> Option<ProgressChannel> {
    GLOBAL_PROGRESS.lock().unwrap_or_else(PoisonError::into_inner).clone()
}

/// Report through the global slot; a no-op when nothing is installed.
pub fn report_global(percent: u8, message: &str) {
    if let Some(channel) = global() {
        channel.report(percent, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_auto_hides_after_delay() {
        let ch = ProgressChannel::new(Duration::from_millis(600));
        let rx = ch.subscribe();
        let t0 = Instant::now();
        ch.report_at(50, "rebuilding", t0);
        ch.report_at(100, "done", t0);
        assert!(!ch.tick(t0 + Duration::from_millis(100)));
        assert!(ch.is_visible());
        assert!(ch.tick(t0 + Duration::from_millis(600)));
        assert!(!ch.is_visible());
        let seen: Vec<u8> = rx.try_iter().map(|u| u.percent).collect();
        assert_eq!(seen, vec![50, 100, 100]);
    }

    #[test]
    fn new_work_cancels_pending_hide() {
        let ch = ProgressChannel::new(Duration::from_millis(10));
        let t0 = Instant::now();
        ch.report_at(100, "done", t0);
        ch.report_at(0, "again", t0);
        assert!(!ch.tick(t0 + Duration::from_secs(1)));
        assert!(ch.is_visible());
    }
}
