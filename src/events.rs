//! Event stream for collaborators living outside the core.
//!
//! The phasor panel, the delta table and any embedding shell subscribe here
//! via [`EventController`]. Each event carries a set of [`EventKind`] flags
//! so that one occurrence can match several categories (adding a cursor is
//! also a phasor update).
//!
//! The caller specifies an [`EventFilter`] to receive only the events they
//! care about. The filter is a simple OR mask: an event is delivered when
//! `(event.kinds & filter) != 0`.

use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};

use crate::charts::ChartType;
use crate::cursors::DeltaReport;
use crate::state::channels::ChannelKind;
use crate::theme::Theme;

// ─────────────────────────────────────────────────────────────────────────────
// EventKind – bitflags
// ─────────────────────────────────────────────────────────────────────────────

/// Bitflags describing the *categories* an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventKind(pub u64);

impl EventKind {
    // ── Cursors ─────────────────────────────────────────────────────────
    /// A cursor line was added.
    pub const CURSOR_ADDED: Self = Self(1 << 0);
    /// A cursor line was removed.
    pub const CURSOR_REMOVED: Self = Self(1 << 1);
    /// The phasor view should re-sample at a new time index.
    pub const PHASOR_UPDATE: Self = Self(1 << 2);
    /// A delta table between the first two cursors is available.
    pub const DELTA_UPDATE: Self = Self(1 << 3);

    // ── Charts ──────────────────────────────────────────────────────────
    /// A chart was built for a group.
    pub const CHART_BUILT: Self = Self(1 << 4);
    /// A chart was torn down.
    pub const CHART_REMOVED: Self = Self(1 << 5);

    // ── Channels ────────────────────────────────────────────────────────
    /// A channel field was written.
    pub const CHANNEL_UPDATED: Self = Self(1 << 6);
    /// A channel was deleted.
    pub const CHANNEL_DELETED: Self = Self(1 << 7);
    /// A computed channel was appended.
    pub const COMPUTED_ADDED: Self = Self(1 << 8);

    // ── Session ─────────────────────────────────────────────────────────
    /// A recording (local or merged) was ingested.
    pub const RECORDING_LOADED: Self = Self(1 << 9);
    /// A progress tick.
    pub const PROGRESS: Self = Self(1 << 10);
    /// The theme changed.
    pub const THEME_CHANGED: Self = Self(1 << 11);

    /// Wildcard: matches *every* event kind.
    pub const ALL: Self = Self(u64::MAX);

    #[inline]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Check whether `self` contains all bits in `other`.
    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Check whether `self` intersects with `other` (at least one bit in common).
    #[inline]
    pub const fn intersects(self, other: Self) -> bool {
        (self.0 & other.0) != 0
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for EventKind {
    type Output = Self;
    #[inline]
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for EventKind {
    #[inline]
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl std::ops::BitAnd for EventKind {
    type Output = Self;
    #[inline]
    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

const NAMED_KINDS: &[(EventKind, &str)] = &[
    (EventKind::CURSOR_ADDED, "CURSOR_ADDED"),
    (EventKind::CURSOR_REMOVED, "CURSOR_REMOVED"),
    (EventKind::PHASOR_UPDATE, "PHASOR_UPDATE"),
    (EventKind::DELTA_UPDATE, "DELTA_UPDATE"),
    (EventKind::CHART_BUILT, "CHART_BUILT"),
    (EventKind::CHART_REMOVED, "CHART_REMOVED"),
    (EventKind::CHANNEL_UPDATED, "CHANNEL_UPDATED"),
    (EventKind::CHANNEL_DELETED, "CHANNEL_DELETED"),
    (EventKind::COMPUTED_ADDED, "COMPUTED_ADDED"),
    (EventKind::RECORDING_LOADED, "RECORDING_LOADED"),
    (EventKind::PROGRESS, "PROGRESS"),
    (EventKind::THEME_CHANGED, "THEME_CHANGED"),
];

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return write!(f, "EMPTY");
        }
        if *self == EventKind::ALL {
            return write!(f, "ALL");
        }

        let mut names = Vec::new();
        let mut known_bits: u64 = 0;
        for (kind, name) in NAMED_KINDS {
            known_bits |= kind.0;
            if self.contains(*kind) {
                names.push((*name).to_string());
            }
        }
        let extra = self.0 & !known_bits;
        if extra != 0 {
            names.push(format!("0x{:x}", extra));
        }
        write!(f, "{}", names.join("|"))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Metadata – per-event-type payloads
// ─────────────────────────────────────────────────────────────────────────────

/// Cursor list after a cursor change.
#[derive(Debug, Clone, PartialEq)]
pub struct CursorMeta {
    /// The x value (seconds) that was added or removed.
    pub x: f64,
    /// All cursor positions after the change.
    pub cursors: Vec<f64>,
}

/// Where the phasor view should sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhasorMeta {
    pub time_index: usize,
    pub x: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChartMeta {
    pub user_group_id: String,
    pub group: String,
    pub chart_type: ChartType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelMeta {
    pub channel_id: String,
    pub kind: ChannelKind,
    /// State key of the written field, `None` for deletions.
    pub field: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordingMeta {
    pub filenames: Vec<String>,
    pub is_merged: bool,
    pub chart_count: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressMeta {
    pub percent: u8,
    pub message: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// ViewerEvent – the top-level event type
// ─────────────────────────────────────────────────────────────────────────────

/// `kinds` is a bitflag set of [`EventKind`] categories. The `Option<…Meta>`
/// fields carry metadata relevant to the kinds that are set.
#[derive(Debug, Clone)]
pub struct ViewerEvent {
    pub kinds: EventKind,
    /// Seconds since the controller was created.
    pub timestamp: f64,

    pub cursor: Option<CursorMeta>,
    pub phasor: Option<PhasorMeta>,
    pub delta: Option<DeltaReport>,
    pub chart: Option<ChartMeta>,
    pub channel: Option<ChannelMeta>,
    pub recording: Option<RecordingMeta>,
    pub progress: Option<ProgressMeta>,
    pub theme: Option<Theme>,
}

impl ViewerEvent {
    pub fn new(kinds: EventKind) -> Self {
        Self {
            kinds,
            timestamp: 0.0, // set by controller
            cursor: None,
            phasor: None,
            delta: None,
            chart: None,
            channel: None,
            recording: None,
            progress: None,
            theme: None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// EventFilter
// ─────────────────────────────────────────────────────────────────────────────

/// An OR-mask over [`EventKind`].
#[derive(Debug, Clone, Copy)]
pub struct EventFilter {
    pub mask: EventKind,
}

impl EventFilter {
    pub const fn all() -> Self {
        Self { mask: EventKind::ALL }
    }

    pub const fn only(mask: EventKind) -> Self {
        Self { mask }
    }

    #[inline]
    pub fn matches(&self, event: &ViewerEvent) -> bool {
        event.kinds.intersects(self.mask)
    }
}

impl Default for EventFilter {
    fn default() -> Self {
        Self::all()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// EventController
// ─────────────────────────────────────────────────────────────────────────────

struct Subscriber {
    filter: EventFilter,
    sender: Sender<ViewerEvent>,
}

/// Collects and distributes viewer events to `mpsc` subscribers.
#[derive(Clone)]
pub struct EventController {
    inner: Arc<Mutex<EventCtrlInner>>,
}

struct EventCtrlInner {
    subscribers: Vec<Subscriber>,
    start_instant: std::time::Instant,
}

impl EventController {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(EventCtrlInner {
                subscribers: Vec::new(),
                start_instant: std::time::Instant::now(),
            })),
        }
    }

    /// Subscribe to events whose kinds intersect the filter mask.
    pub fn subscribe(&self, filter: EventFilter) -> Receiver<ViewerEvent> {
        let (tx, rx) = std::sync::mpsc::channel();
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.subscribers.push(Subscriber { filter, sender: tx });
        rx
    }

    pub fn subscribe_all(&self) -> Receiver<ViewerEvent> {
        self.subscribe(EventFilter::all())
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .subscribers
            .len()
    }

    /// Deliver to matching subscribers; subscribers whose receiver is gone
    /// are pruned when a send to them fails.
    pub fn emit(&self, mut event: ViewerEvent) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        event.timestamp = inner.start_instant.elapsed().as_secs_f64();
        inner.subscribers.retain(|sub| {
            if sub.filter.matches(&event) {
                sub.sender.send(event.clone()).is_ok()
            } else {
                true
            }
        });
    }
}

impl Default for EventController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_kind_union_and_intersection() {
        let combined = EventKind::CURSOR_ADDED | EventKind::PHASOR_UPDATE;
        assert!(combined.contains(EventKind::CURSOR_ADDED));
        assert!(combined.intersects(EventKind::PHASOR_UPDATE));
        assert!(!EventKind::CHART_BUILT.intersects(combined));
    }

    #[test]
    fn event_controller_filters_by_mask() {
        let ctrl = EventController::new();
        let rx_all = ctrl.subscribe_all();
        let rx_phasor = ctrl.subscribe(EventFilter::only(EventKind::PHASOR_UPDATE));
        let rx_theme = ctrl.subscribe(EventFilter::only(EventKind::THEME_CHANGED));

        ctrl.emit(ViewerEvent::new(EventKind::CURSOR_ADDED | EventKind::PHASOR_UPDATE));

        assert!(rx_all.try_recv().is_ok());
        assert!(rx_phasor.try_recv().is_ok());
        assert!(rx_theme.try_recv().is_err());
    }

    #[test]
    fn event_kind_display() {
        assert_eq!(format!("{}", EventKind::CHART_BUILT), "CHART_BUILT");
        let combo = EventKind::CURSOR_ADDED | EventKind::DELTA_UPDATE;
        assert_eq!(format!("{}", combo), "CURSOR_ADDED|DELTA_UPDATE");
        assert_eq!(format!("{}", EventKind::ALL), "ALL");
        assert!(format!("{}", EventKind(1 << 63)).starts_with("0x"));
    }

    #[test]
    fn event_kinds_do_not_overlap() {
        for (i, (a, _)) in NAMED_KINDS.iter().enumerate() {
            for (j, (b, _)) in NAMED_KINDS.iter().enumerate() {
                if i != j {
                    assert!(!a.intersects(*b), "bits {i} and {j} overlap");
                }
            }
        }
    }

    #[test]
    fn dropped_receiver_is_pruned() {
        let ctrl = EventController::new();
        let rx1 = ctrl.subscribe_all();
        let rx2 = ctrl.subscribe_all();
        drop(rx1);
        ctrl.emit(ViewerEvent::new(EventKind::PROGRESS));
        assert!(rx2.try_recv().is_ok());
        assert_eq!(ctrl.subscriber_count(), 1);
    }
}
