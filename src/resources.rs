//! Frame-coalesced updates, chart-scoped listener bookkeeping and resize
//! debouncing.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::plot::PlotSize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameHandle(pub u64);

/// Source of animation frames.
pub trait FrameScheduler {
    fn request_frame(&mut self) -> FrameHandle;
    fn cancel_frame(&mut self, handle: FrameHandle);
}

/// Scheduler driven by the caller: frames fire when the host calls
/// [`UpdateQueue::on_frame`] with the pending handle.
#[derive(Debug, Default)]
pub struct ManualFrames {
    next: u64,
    pending: Option<FrameHandle>,
    pub requested: usize,
    pub cancelled: usize,
}

impl ManualFrames {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> Option<FrameHandle> {
        self.pending
    }
}

impl FrameScheduler for ManualFrames {
    fn request_frame(&mut self) -> FrameHandle {
        self.next += 1;
        self.requested += 1;
        let h = FrameHandle(self.next);
        self.pending = Some(h);
        h
    }

    fn cancel_frame(&mut self, handle: FrameHandle) {
        if self.pending == Some(handle) {
            self.pending = None;
        }
        self.cancelled += 1;
    }
}

type UpdateFn = Box<dyn FnOnce()>;

struct QueuedUpdate {
    key: String,
    element: String,
    run: UpdateFn,
}

/// Coalesces updates until the next frame.
///
/// Updates sharing a dedupe key replace each other in place (the first
/// insertion position is kept, the last closure wins). One frame flushes
/// everything in insertion order.
pub struct UpdateQueue {
    scheduler: Box<dyn FrameScheduler>,
    updates: Vec<QueuedUpdate>,
    frame: Option<FrameHandle>,
    dead: bool,
}

impl UpdateQueue {
    pub fn new(scheduler: Box<dyn FrameScheduler>) -> Self {
        Self {
            scheduler,
            updates: Vec::new(),
            frame: None,
            dead: false,
        }
    }

    pub fn len(&self) -> usize {
        self.updates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    pub fn pending_frame(&self) -> Option<FrameHandle> {
        self.frame
    }

    pub fn is_destroyed(&self) -> bool {
        self.dead
    }

    /// Queue `run` for `element`; `dedupe_key` defaults to the element name.
    pub fn queue_update<F>(&mut self, element: &str, run: F, dedupe_key: Option<&str>)
    where
        F: FnOnce() + 'static,
    {
        if self.dead {
            tracing::warn!("update for {element} queued after the update queue was destroyed");
            return;
        }
        let key = dedupe_key.unwrap_or(element).to_string();
        match self.updates.iter_mut().find(|u| u.key == key) {
            Some(slot) => {
                slot.element = element.to_string();
                slot.run = Box::new(run);
            }
            None => self.updates.push(QueuedUpdate {
                key,
                element: element.to_string(),
                run: Box::new(run),
            }),
        }
        if self.frame.is_none() {
            self.frame = Some(self.scheduler.request_frame());
        }
    }

    fn drain(&mut self) -> usize {
        let updates = std::mem::take(&mut self.updates);
        let n = updates.len();
        for u in updates {
            tracing::trace!("frame update {} ({})", u.key, u.element);
            (u.run)();
        }
        n
    }

    /// Frame callback. Ignored unless `handle` is the pending frame.
    pub fn on_frame(&mut self, handle: FrameHandle) -> usize {
        if self.frame != Some(handle) {
            return 0;
        }
        self.frame = None;
        self.drain()
    }

    /// Run everything now and cancel the pending frame.
    pub fn flush(&mut self) -> usize {
        if let Some(h) = self.frame.take() {
            self.scheduler.cancel_frame(h);
        }
        self.drain()
    }

    /// Cancel the frame, drop queued updates and refuse further ones.
    pub fn destroy(&mut self) {
        if let Some(h) = self.frame.take() {
            self.scheduler.cancel_frame(h);
        }
        self.updates.clear();
        self.dead = true;
    }

    pub fn on_visibility_hidden(&mut self) -> usize {
        self.flush()
    }

    pub fn on_unload(&mut self) {
        self.destroy();
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ListenerKind {
    Click,
    Resize,
    Custom(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Chart-scoped listeners, dropped together with their owner chart.
#[derive(Debug, Default)]
pub struct ListenerRegistry {
    listeners: Vec<(ListenerId, String, ListenerKind)>,
    next: u64,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, owner: &str, kind: ListenerKind) -> ListenerId {
        self.next += 1;
        let id = ListenerId(self.next);
        self.listeners.push((id, owner.to_string(), kind));
        id
    }

    pub fn has(&self, owner: &str, kind: &ListenerKind) -> bool {
        self.listeners.iter().any(|(_, o, k)| o == owner && k == kind)
    }

    pub fn count_for(&self, owner: &str) -> usize {
        self.listeners.iter().filter(|(_, o, _)| o == owner).count()
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn remove(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(i, _, _)| *i != id);
        before != self.listeners.len()
    }

    /// Drop every listener of `owner`; returns how many were removed.
    pub fn remove_owner(&mut self, owner: &str) -> usize {
        let before = self.listeners.len();
        self.listeners.retain(|(_, o, _)| o != owner);
        before - self.listeners.len()
    }

    pub fn clear(&mut self) {
        self.listeners.clear();
    }
}

/// Per-chart resize debouncing: a size is applied once no new size arrived
/// for `delay`, and only if it differs from the last applied one.
#[derive(Debug)]
pub struct ResizeDebouncer {
    delay: Duration,
    pending: HashMap<String, (PlotSize, Instant)>,
    applied: HashMap<String, PlotSize>,
}

impl ResizeDebouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: HashMap::new(),
            applied: HashMap::new(),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Record the size a chart was built with.
    pub fn set_applied(&mut self, key: &str, size: PlotSize) {
        self.applied.insert(key.to_string(), size);
    }

    pub fn request(&mut self, key: &str, size: PlotSize, now: Instant) {
        if self.applied.get(key) == Some(&size) {
            self.pending.remove(key);
            return;
        }
        self.pending.insert(key.to_string(), (size, now));
    }

    /// Sizes whose debounce elapsed, sorted by key.
    pub fn due(&mut self, now: Instant) -> Vec<(String, PlotSize)> {
        let ready: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, (_, at))| now.saturating_duration_since(*at) >= self.delay)
            .map(|(k, _)| k.clone())
            .collect();
        let mut out = Vec::new();
        for key in ready {
            if let Some((size, _)) = self.pending.remove(&key) {
                self.applied.insert(key.clone(), size);
                out.push((key, size));
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub fn forget(&mut self, key: &str) {
        self.pending.remove(key);
        self.applied.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn dedupe_keeps_position_and_last_closure() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut q = UpdateQueue::new(Box::new(ManualFrames::new()));
        for (el, key, tag) in [("a", "k1", 1), ("b", "k2", 2), ("a", "k1", 3)] {
            let l = Rc::clone(&log);
            q.queue_update(el, move || l.borrow_mut().push(tag), Some(key));
        }
        assert_eq!(q.len(), 2);
        let frame = q.pending_frame().unwrap();
        assert_eq!(q.on_frame(frame), 2);
        assert_eq!(log.borrow().as_slice(), &[3, 2]);
        assert!(q.pending_frame().is_none());
    }

    #[test]
    fn stale_frames_are_ignored_and_flush_cancels() {
        let mut q = UpdateQueue::new(Box::new(ManualFrames::new()));
        q.queue_update("a", || {}, None);
        assert_eq!(q.on_frame(FrameHandle(999)), 0);
        assert_eq!(q.flush(), 1);
        assert!(q.pending_frame().is_none());
    }

    #[test]
    fn destroyed_queue_refuses_updates() {
        let hits = Rc::new(RefCell::new(0));
        let mut q = UpdateQueue::new(Box::new(ManualFrames::new()));
        q.on_unload();
        let h = Rc::clone(&hits);
        q.queue_update("a", move || *h.borrow_mut() += 1, None);
        assert!(q.is_empty());
        assert_eq!(q.flush(), 0);
        assert_eq!(*hits.borrow(), 0);
    }

    #[test]
    fn listeners_go_with_their_owner() {
        let mut r = ListenerRegistry::new();
        r.register("ug-1", ListenerKind::Click);
        r.register("ug-1", ListenerKind::Resize);
        r.register("ug-2", ListenerKind::Click);
        assert_eq!(r.remove_owner("ug-1"), 2);
        assert!(!r.has("ug-1", &ListenerKind::Click));
        assert!(r.has("ug-2", &ListenerKind::Click));
    }

    #[test]
    fn resize_waits_and_skips_unchanged_sizes() {
        let t0 = Instant::now();
        let size = PlotSize {
            width: 800.0,
            height: 200.0,
        };
        let mut d = ResizeDebouncer::new(Duration::from_millis(50));
        d.set_applied("ug-1", size);
        d.request("ug-1", size, t0);
        assert!(d.due(t0 + Duration::from_millis(100)).is_empty());

        let bigger = PlotSize {
            width: 900.0,
            height: 200.0,
        };
        d.request("ug-1", bigger, t0);
        assert!(d.due(t0 + Duration::from_millis(10)).is_empty());
        assert_eq!(d.due(t0 + Duration::from_millis(60)), vec![("ug-1".to_string(), bigger)]);
    }
}
