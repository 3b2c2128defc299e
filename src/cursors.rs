//! Cursor positions and delta measurement between cursors.
//!
//! The engine only holds x positions (seconds) and computes values; drawing
//! is done by [`VerticalLinePlugin`](crate::plot::VerticalLinePlugin).

use std::cell::RefCell;
use std::rc::Rc;

use serde::Serialize;

pub type SharedCursors = Rc<RefCell<CursorDeltaEngine>>;

#[derive(Debug, Clone, PartialEq)]
pub enum CursorChange {
    Added { index: usize, x: f64 },
    Removed { index: usize, x: f64 },
    Replaced,
}

/// What a click did to the cursor list.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ToggleOutcome {
    Added(f64),
    Removed(f64),
}

type CursorHandler = Box<dyn FnMut(&CursorChange, &[f64])>;

#[derive(Default)]
pub struct CursorDeltaEngine {
    positions: Vec<f64>,
    revision: u64,
    subscribers: Vec<(u64, CursorHandler)>,
    next_subscriber: u64,
}

impl std::fmt::Debug for CursorDeltaEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CursorDeltaEngine")
            .field("positions", &self.positions)
            .field("revision", &self.revision)
            .finish()
    }
}

impl CursorDeltaEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedCursors {
        Rc::new(RefCell::new(Self::new()))
    }

    pub fn positions(&self) -> &[f64] {
        &self.positions
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Bumped on every change; renderers compare it to skip redundant redraws.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn subscribe<F>(&mut self, handler: F) -> u64
    where
        F: FnMut(&CursorChange, &[f64]) + 'static,
    {
        self.next_subscriber += 1;
        self.subscribers.push((self.next_subscriber, Box::new(handler)));
        self.next_subscriber
    }

    pub fn unsubscribe(&mut self, id: u64) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(i, _)| *i != id);
        before != self.subscribers.len()
    }

    fn changed(&mut self, change: CursorChange) {
        self.revision += 1;
        let positions = self.positions.clone();
        for (_, handler) in self.subscribers.iter_mut() {
            handler(&change, &positions);
        }
    }

    /// Append a cursor; non-finite positions are ignored.
    pub fn add(&mut self, x: f64) -> Option<usize> {
        if !x.is_finite() {
            return None;
        }
        self.positions.push(x);
        let index = self.positions.len() - 1;
        self.changed(CursorChange::Added { index, x });
        Some(index)
    }

    pub fn remove(&mut self, index: usize) -> Option<f64> {
        if index >= self.positions.len() {
            return None;
        }
        let x = self.positions.remove(index);
        self.changed(CursorChange::Removed { index, x });
        Some(x)
    }

    pub fn set_all(&mut self, positions: Vec<f64>) {
        self.positions = positions.into_iter().filter(|x| x.is_finite()).collect();
        self.changed(CursorChange::Replaced);
    }

    pub fn clear(&mut self) {
        self.set_all(Vec::new());
    }

    /// Remove the cursor closest to `x` if it lies within
    /// `tolerance_fraction * x_span`; otherwise add a cursor at `x`.
    pub fn toggle_at(&mut self, x: f64, x_span: f64, tolerance_fraction: f64) -> Option<ToggleOutcome> {
        let tolerance = (x_span.abs() * tolerance_fraction).max(f64::EPSILON);
        let nearest = self
            .positions
            .iter()
            .enumerate()
            .map(|(i, c)| (i, (c - x).abs()))
            .filter(|(_, d)| *d <= tolerance)
            .min_by(|a, b| a.1.total_cmp(&b.1));
        match nearest {
            Some((i, _)) => self.remove(i).map(ToggleOutcome::Removed),
            None => self.add(x).map(|_| ToggleOutcome::Added(x)),
        }
    }

    /// Delta between the first two cursors, if there are two.
    pub fn first_pair(&self) -> Option<(f64, f64)> {
        match self.positions.as_slice() {
            [a, b, ..] => Some((*a, *b)),
            _ => None,
        }
    }
}

/// Linear interpolation of `(times, values)` at `x`.
///
/// `None` when fewer than two samples exist, `x` lies outside
/// `[times[0], times[n-1]]`, or the bracketing samples are not finite.
/// Sampling does not need to be uniform.
pub fn interpolate(times: &[f64], values: &[f64], x: f64) -> Option<f64> {
    let n = times.len().min(values.len());
    if n < 2 || !x.is_finite() {
        return None;
    }
    let times = &times[..n];
    if x < times[0] || x > times[n - 1] {
        return None;
    }
    let hi = times.partition_point(|t| *t < x);
    if hi == 0 {
        return values[0].is_finite().then_some(values[0]);
    }
    if hi >= n {
        return values[n - 1].is_finite().then_some(values[n - 1]);
    }
    let (t0, t1) = (times[hi - 1], times[hi]);
    let (v0, v1) = (values[hi - 1], values[hi]);
    let y = if t1 == t0 {
        v1
    } else {
        v0 + (v1 - v0) * (x - t0) / (t1 - t0)
    };
    y.is_finite().then_some(y)
}

/// Nearest sample index by linear scan, stopping at the first sample past `x`.
pub fn find_nearest_index(times: &[f64], x: f64) -> usize {
    let mut best = 0;
    let mut best_dist = f64::INFINITY;
    for (i, t) in times.iter().enumerate() {
        let d = (t - x).abs();
        if d < best_dist {
            best = i;
            best_dist = d;
        }
        if *t > x {
            break;
        }
    }
    best
}

/// A series to measure.
#[derive(Debug, Clone)]
pub struct DeltaSeries<'a> {
    pub label: String,
    pub color: String,
    pub times: &'a [f64],
    pub values: &'a [f64],
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaRecord {
    pub label: String,
    pub color: String,
    pub y_a: Option<f64>,
    pub y_b: Option<f64>,
    pub dy: Option<f64>,
    /// `dy / |yA| * 100`; `None` when `yA` is zero or unknown.
    pub pct: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaReport {
    pub x_a: f64,
    pub x_b: f64,
    pub dt: f64,
    pub records: Vec<DeltaRecord>,
}

pub fn delta(x_a: f64, x_b: f64, series: &[DeltaSeries<'_>]) -> DeltaReport {
    let records = series
        .iter()
        .map(|s| {
            let y_a = interpolate(s.times, s.values, x_a);
            let y_b = interpolate(s.times, s.values, x_b);
            let dy = y_a.zip(y_b).map(|(a, b)| b - a);
            let pct = match (dy, y_a) {
                (Some(dy), Some(a)) if a != 0.0 => Some(dy / a.abs() * 100.0),
                _ => None,
            };
            DeltaRecord {
                label: s.label.clone(),
                color: s.color.clone(),
                y_a,
                y_b,
                dy,
                pct,
            }
        })
        .collect();
    DeltaReport {
        x_a,
        x_b,
        dt: x_b - x_a,
        records,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: [f64; 4] = [0.0, 0.01, 0.02, 0.03];
    const S: [f64; 4] = [10.0, 20.0, 40.0, 80.0];

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn interpolates_between_samples() {
        assert!(close(interpolate(&T, &S, 0.015).unwrap(), 30.0));
        assert!(close(interpolate(&T, &S, 0.025).unwrap(), 60.0));
        assert_eq!(interpolate(&T, &S, 0.0), Some(10.0));
        assert_eq!(interpolate(&T, &S, 0.03), Some(80.0));
    }

    #[test]
    fn interpolation_outside_domain_is_none() {
        assert_eq!(interpolate(&T, &S, -0.001), None);
        assert_eq!(interpolate(&T, &S, 0.031), None);
        assert_eq!(interpolate(&[0.0], &[1.0], 0.0), None);
    }

    #[test]
    fn non_uniform_sampling() {
        let t = [0.0, 0.001, 0.01];
        let v = [0.0, 1.0, 10.0];
        assert!(close(interpolate(&t, &v, 0.0055).unwrap(), 5.5));
    }

    #[test]
    fn percent_is_none_when_base_is_zero() {
        let v = [0.0, 1.0, 2.0, 3.0];
        let r = delta(0.0, 0.03, &[DeltaSeries {
            label: "x".into(),
            color: String::new(),
            times: &T,
            values: &v,
        }]);
        assert_eq!(r.records[0].pct, None);
        assert_eq!(r.records[0].dy, Some(3.0));
    }

    #[test]
    fn toggle_removes_within_tolerance() {
        let mut e = CursorDeltaEngine::new();
        assert_eq!(e.toggle_at(1.0, 10.0, 0.02), Some(ToggleOutcome::Added(1.0)));
        assert_eq!(e.toggle_at(1.15, 10.0, 0.02), Some(ToggleOutcome::Removed(1.0)));
        assert!(e.is_empty());
        assert_eq!(e.revision(), 2);
    }

    #[test]
    fn subscribers_see_positions_after_change() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = Rc::clone(&seen);
        let mut e = CursorDeltaEngine::new();
        e.subscribe(move |_, pos| s.borrow_mut().push(pos.len()));
        e.add(0.1);
        e.add(0.2);
        e.remove(0);
        assert_eq!(seen.borrow().as_slice(), &[1, 2, 1]);
    }

    #[test]
    fn nearest_index_scan() {
        assert_eq!(find_nearest_index(&T, 0.012), 1);
        assert_eq!(find_nearest_index(&T, 0.018), 2);
        assert_eq!(find_nearest_index(&T, 5.0), 3);
        assert_eq!(find_nearest_index(&[], 1.0), 0);
    }
}
