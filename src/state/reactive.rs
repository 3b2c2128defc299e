//! Path-subscribable reactive container with undo/redo history.
//!
//! The container wraps a JSON record tree. Every write is addressed by a
//! [`StatePath`] (`analog.lineColors.1`), committed, recorded in history and
//! then announced to subscribers as a [`StateChange`]. Subscribers run
//! synchronously in registration order inside the mutating call.

use std::cell::RefCell;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;

use serde_json::Value;

use crate::error::{Result, ViewerError};

/// Maximum number of undo entries kept.
pub const HISTORY_LIMIT: usize = 200;

/// Normalized dotted path into the state tree.
///
/// `analog.lineColors[1]` and `analog.lineColors.1` normalize to the same path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StatePath(Vec<String>);

impl StatePath {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn parse(text: &str) -> Self {
        let segments = text
            .split(|c| c == '.' || c == '[' || c == ']')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        Self(segments)
    }

    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    pub fn child(&self, segment: impl ToString) -> Self {
        let mut next = self.0.clone();
        next.push(segment.to_string());
        Self(next)
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn last(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }

    pub fn parent(&self) -> Option<Self> {
        if self.0.is_empty() {
            None
        } else {
            Some(Self(self.0[..self.0.len() - 1].to_vec()))
        }
    }

    /// True when `self` equals `other` or is one of its ancestors.
    pub fn is_prefix_of(&self, other: &StatePath) -> bool {
        self.0.len() <= other.0.len() && self.0.iter().zip(&other.0).all(|(a, b)| a == b)
    }
}

impl fmt::Display for StatePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

impl From<&str> for StatePath {
    fn from(s: &str) -> Self {
        Self::parse(s)
    }
}

impl From<String> for StatePath {
    fn from(s: String) -> Self {
        Self::parse(&s)
    }
}

impl From<&StatePath> for StatePath {
    fn from(p: &StatePath) -> Self {
        p.clone()
    }
}

/// One committed mutation. `None` means "absent" (before creation or after removal).
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub path: StatePath,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

/// Which mutations a subscriber receives.
///
/// With no path every mutation is delivered. With `descendants = false` a
/// subscriber fires when its exact path (or an ancestor of it) is written;
/// with `descendants = true` writes anywhere below the path fire as well.
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    pub path: Option<StatePath>,
    pub descendants: bool,
}

impl SubscribeOptions {
    pub fn exact(path: impl Into<StatePath>) -> Self {
        Self {
            path: Some(path.into()),
            descendants: false,
        }
    }

    pub fn descendants(path: impl Into<StatePath>) -> Self {
        Self {
            path: Some(path.into()),
            descendants: true,
        }
    }

    fn matches(&self, changed: &StatePath) -> bool {
        match &self.path {
            None => true,
            Some(p) if self.descendants => p.is_prefix_of(changed) || changed.is_prefix_of(p),
            Some(p) => changed.is_prefix_of(p),
        }
    }
}

/// Property aliases accepted by [`ReactiveState::subscribe_property`].
pub const PROPERTY_ALIASES: &[(&str, &str)] = &[
    ("color", "lineColors"),
    ("name", "yLabels"),
    ("label", "yLabels"),
    ("unit", "yUnits"),
    ("scale", "scales"),
    ("axisScale", "axesScales"),
    ("start", "starts"),
    ("duration", "durations"),
    ("invert", "inverts"),
    ("group", "groups"),
    ("id", "channelIDs"),
    ("equation", "equations"),
];

/// Kinds fanned out by [`ReactiveState::subscribe_property`].
pub const PROPERTY_ROOTS: [&str; 3] = ["analog", "digital", "computed"];

pub fn resolve_alias(alias: &str) -> &str {
    PROPERTY_ALIASES
        .iter()
        .find(|(a, _)| *a == alias)
        .map(|(_, field)| *field)
        .unwrap_or(alias)
}

type Handler = Box<dyn FnMut(&StateChange)>;

struct Subscriber {
    id: SubscriptionId,
    options: SubscribeOptions,
    handler: Handler,
}

#[derive(Debug, Clone, Default)]
struct HistoryEntry {
    changes: Vec<StateChange>,
}

/// The reactive container.
pub struct ReactiveState {
    root: Value,
    subscribers: Vec<Subscriber>,
    next_subscription: u64,
    undo_stack: Vec<HistoryEntry>,
    redo_stack: Vec<HistoryEntry>,
    suspend_depth: u32,
    pending: Vec<StateChange>,
}

impl Default for ReactiveState {
    fn default() -> Self {
        Self::new(Value::Object(Default::default()))
    }
}

impl fmt::Debug for ReactiveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReactiveState")
            .field("subscribers", &self.subscribers.len())
            .field("undo", &self.undo_stack.len())
            .field("redo", &self.redo_stack.len())
            .finish()
    }
}

impl ReactiveState {
    pub fn new(root: Value) -> Self {
        let root = if root.is_object() {
            root
        } else {
            Value::Object(Default::default())
        };
        Self {
            root,
            subscribers: Vec::new(),
            next_subscription: 1,
            undo_stack: Vec::new(),
            redo_stack: Vec::new(),
            suspend_depth: 0,
            pending: Vec::new(),
        }
    }

    pub fn root(&self) -> &Value {
        &self.root
    }

    /// Value at `path`; `None` for any path that does not resolve.
    pub fn get<P: Into<StatePath>>(&self, path: P) -> Option<&Value> {
        let path = path.into();
        lookup(&self.root, path.segments())
    }

    /// Write `value` at `path`, record it in history and notify subscribers.
    pub fn set<P: Into<StatePath>>(&mut self, path: P, value: Value) -> Result<()> {
        self.set_many(vec![(path.into(), value)])
    }

    /// Commit several writes as one unit: every path is validated first,
    /// all values are written, and only then are subscribers notified, so
    /// observers never see a partially applied batch.
    pub fn set_many(&mut self, writes: Vec<(StatePath, Value)>) -> Result<()> {
        let changes = self.commit(writes)?;
        self.record(&changes);
        self.redo_stack.clear();
        self.notify(&changes);
        Ok(())
    }

    /// Like [`set_many`](Self::set_many) but bypasses history and clears it.
    ///
    /// Used for structural edits (channel append/delete) whose prior index
    /// space would make older history entries address the wrong slots.
    pub fn set_many_untracked(&mut self, writes: Vec<(StatePath, Value)>) -> Result<()> {
        let changes = self.commit(writes)?;
        self.clear_history();
        self.notify(&changes);
        Ok(())
    }

    /// Replace the whole tree (file load). History is reset.
    pub fn replace_root(&mut self, root: Value) {
        let old = std::mem::replace(&mut self.root, root);
        self.clear_history();
        let change = StateChange {
            path: StatePath::root(),
            old_value: Some(old),
            new_value: Some(self.root.clone()),
        };
        self.notify(std::slice::from_ref(&change));
    }

    /// Make sure an array exists at `path` with at least `len` elements,
    /// padding with `fill`. Silent: no history, no notification.
    pub(crate) fn ensure_array(&mut self, path: &StatePath, len: usize, fill: &Value) -> Result<()> {
        let slot = slot_mut(&mut self.root, path.segments(), true)?;
        if !slot.is_array() {
            *slot = Value::Array(Vec::new());
        }
        if let Value::Array(items) = slot {
            while items.len() < len {
                items.push(fill.clone());
            }
        }
        Ok(())
    }

    pub fn subscribe<F>(&mut self, handler: F, options: SubscribeOptions) -> SubscriptionId
    where
        F: FnMut(&StateChange) + 'static,
    {
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        self.subscribers.push(Subscriber {
            id,
            options,
            handler: Box::new(handler),
        });
        id
    }

    /// Subscribe one handler to `analog.<field>`, `digital.<field>` and
    /// `computed.<field>` where `<field>` is the alias target.
    pub fn subscribe_property<F>(&mut self, alias: &str, handler: F, descendants: bool) -> Vec<SubscriptionId>
    where
        F: FnMut(&StateChange) + 'static,
    {
        let field = resolve_alias(alias).to_string();
        let shared = Rc::new(RefCell::new(handler));
        PROPERTY_ROOTS
            .iter()
            .map(|root| {
                let h = Rc::clone(&shared);
                let options = SubscribeOptions {
                    path: Some(StatePath::from_segments([*root, field.as_str()])),
                    descendants,
                };
                self.subscribe(move |c: &StateChange| (h.borrow_mut())(c), options)
            })
            .collect()
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|s| s.id != id);
        before != self.subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Start a bulk edit; nested calls are counted.
    pub fn suspend_history(&mut self) {
        self.suspend_depth += 1;
    }

    /// End a bulk edit. When the outermost bracket closes, everything
    /// written inside it becomes a single history entry.
    pub fn resume_history(&mut self) {
        if self.suspend_depth == 0 {
            return;
        }
        self.suspend_depth -= 1;
        if self.suspend_depth == 0 && !self.pending.is_empty() {
            let changes = std::mem::take(&mut self.pending);
            self.push_entry(HistoryEntry { changes });
        }
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    /// Revert the latest history entry. Returns the changes as subscribers saw them.
    pub fn undo(&mut self) -> Option<Vec<StateChange>> {
        let entry = self.undo_stack.pop()?;
        let applied = self.replay(&entry, true);
        self.redo_stack.push(entry);
        Some(applied)
    }

    /// Re-apply the latest undone entry.
    pub fn redo(&mut self) -> Option<Vec<StateChange>> {
        let entry = self.redo_stack.pop()?;
        let applied = self.replay(&entry, false);
        self.undo_stack.push(entry);
        Some(applied)
    }

    pub fn clear_history(&mut self) {
        self.undo_stack.clear();
        self.redo_stack.clear();
        self.pending.clear();
    }

    fn replay(&mut self, entry: &HistoryEntry, backwards: bool) -> Vec<StateChange> {
        let mut applied = Vec::with_capacity(entry.changes.len());
        let ordered: Box<dyn Iterator<Item = &StateChange>> = if backwards {
            Box::new(entry.changes.iter().rev())
        } else {
            Box::new(entry.changes.iter())
        };
        for change in ordered {
            let target = if backwards { &change.old_value } else { &change.new_value };
            match write_value(&mut self.root, &change.path, target.clone()) {
                Ok(previous) => applied.push(StateChange {
                    path: change.path.clone(),
                    old_value: previous,
                    new_value: target.clone(),
                }),
                Err(e) => tracing::debug!("history replay skipped {}: {e}", change.path),
            }
        }
        self.notify(&applied);
        applied
    }

    fn commit(&mut self, writes: Vec<(StatePath, Value)>) -> Result<Vec<StateChange>> {
        for (path, _) in &writes {
            if path.is_root() {
                return Err(ViewerError::InvalidPath("<root>".into()));
            }
            check_writable(&self.root, path)?;
        }
        let mut changes = Vec::with_capacity(writes.len());
        for (path, value) in writes {
            let old_value = write_value(&mut self.root, &path, Some(value.clone()))?;
            changes.push(StateChange {
                path,
                old_value,
                new_value: Some(value),
            });
        }
        Ok(changes)
    }

    fn record(&mut self, changes: &[StateChange]) {
        if changes.is_empty() {
            return;
        }
        if self.suspend_depth > 0 {
            self.pending.extend(changes.iter().cloned());
        } else {
            self.push_entry(HistoryEntry {
                changes: changes.to_vec(),
            });
        }
    }

    fn push_entry(&mut self, entry: HistoryEntry) {
        self.undo_stack.push(entry);
        if self.undo_stack.len() > HISTORY_LIMIT {
            self.undo_stack.remove(0);
        }
    }

    fn notify(&mut self, changes: &[StateChange]) {
        for change in changes {
            #[cfg(feature = "state_trace")]
            tracing::trace!("state change at {}", change.path);
            for sub in self.subscribers.iter_mut() {
                if !sub.options.matches(&change.path) {
                    continue;
                }
                let handler = &mut sub.handler;
                if catch_unwind(AssertUnwindSafe(|| handler(change))).is_err() {
                    tracing::error!("state subscriber {:?} panicked on {}; skipped", sub.id, change.path);
                }
            }
        }
    }
}

fn lookup<'a>(root: &'a Value, segments: &[String]) -> Option<&'a Value> {
    let mut cur = root;
    for seg in segments {
        cur = match cur {
            Value::Object(map) => map.get(seg)?,
            Value::Array(items) => items.get(seg.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(cur)
}

fn is_index(segment: &str) -> bool {
    !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit())
}

/// Validate that `path` can be written without creating anything other than
/// a missing leaf array.
fn check_writable(root: &Value, path: &StatePath) -> Result<()> {
    let segs = path.segments();
    let mut cur = root;
    for (i, seg) in segs.iter().enumerate() {
        let is_last = i + 1 == segs.len();
        if is_last {
            return match cur {
                Value::Object(_) => Ok(()),
                Value::Array(_) if is_index(seg) => Ok(()),
                _ => Err(ViewerError::InvalidPath(path.to_string())),
            };
        }
        let next = match cur {
            Value::Object(map) => map.get(seg),
            Value::Array(items) if is_index(seg) => seg.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        match next {
            Some(v) => cur = v,
            // a missing leaf array may be created when the next segment is the final index
            None if i + 2 == segs.len() && is_index(&segs[i + 1]) && cur.is_object() => return Ok(()),
            None => return Err(ViewerError::InvalidPath(path.to_string())),
        }
    }
    Ok(())
}

/// Navigate to the slot addressed by `segments`, optionally creating the
/// final container as an empty array.
fn slot_mut<'a>(root: &'a mut Value, segments: &[String], create_leaf: bool) -> Result<&'a mut Value> {
    let mut cur = root;
    for (i, seg) in segments.iter().enumerate() {
        let is_last = i + 1 == segments.len();
        cur = match cur {
            Value::Object(map) => {
                if !map.contains_key(seg) {
                    if !(create_leaf && is_last) {
                        return Err(ViewerError::InvalidPath(segments.join(".")));
                    }
                    map.insert(seg.clone(), Value::Array(Vec::new()));
                }
                map.get_mut(seg)
                    .ok_or_else(|| ViewerError::InvalidPath(segments.join(".")))?
            }
            Value::Array(items) => {
                let idx = seg
                    .parse::<usize>()
                    .map_err(|_| ViewerError::InvalidPath(segments.join(".")))?;
                items
                    .get_mut(idx)
                    .ok_or_else(|| ViewerError::InvalidPath(segments.join(".")))?
            }
            _ => return Err(ViewerError::InvalidPath(segments.join("."))),
        };
    }
    Ok(cur)
}

/// Write (or remove, for `None`) the value at `path`. Returns the previous value.
fn write_value(root: &mut Value, path: &StatePath, value: Option<Value>) -> Result<Option<Value>> {
    let segs = path.segments();
    let (last, parents) = segs
        .split_last()
        .ok_or_else(|| ViewerError::InvalidPath("<root>".into()))?;
    let parent = if parents.is_empty() {
        root
    } else {
        let create = is_index(last);
        slot_mut(root, parents, create)?
    };
    match parent {
        Value::Object(map) => Ok(match value {
            Some(v) => map.insert(last.clone(), v),
            None => map.remove(last),
        }),
        Value::Array(items) => {
            let idx = last
                .parse::<usize>()
                .map_err(|_| ViewerError::InvalidPath(path.to_string()))?;
            match value {
                Some(v) => {
                    while items.len() < idx {
                        items.push(Value::Null);
                    }
                    if idx == items.len() {
                        items.push(v);
                        Ok(None)
                    } else {
                        Ok(Some(std::mem::replace(&mut items[idx], v)))
                    }
                }
                None if idx + 1 == items.len() => Ok(items.pop()),
                None => Ok(items.get_mut(idx).map(|slot| std::mem::replace(slot, Value::Null))),
            }
        }
        _ => Err(ViewerError::InvalidPath(path.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state() -> ReactiveState {
        ReactiveState::new(json!({
            "analog": { "lineColors": ["#111111", "#222222"], "yLabels": ["VA", "VB"] },
            "digital": { "lineColors": [] },
            "computed": {}
        }))
    }

    #[test]
    fn get_and_set_nested_values() {
        let mut s = state();
        assert_eq!(s.get("analog.lineColors.1"), Some(&json!("#222222")));
        s.set("analog.lineColors[1]", json!("#ff0000")).unwrap();
        assert_eq!(s.get("analog.lineColors.1"), Some(&json!("#ff0000")));
    }

    #[test]
    fn invalid_paths_return_none() {
        let s = state();
        assert!(s.get("analog.nope.3").is_none());
        assert!(s.get("analog.lineColors.9").is_none());
        assert!(s.get("analog.lineColors.x").is_none());
    }

    #[test]
    fn missing_leaf_array_is_created_but_missing_record_is_not() {
        let mut s = state();
        s.set("computed.equations.0", json!("a+b")).unwrap();
        assert_eq!(s.get("computed.equations"), Some(&json!(["a+b"])));
        assert!(s.set("phasor.angles.0", json!(1)).is_err());
    }

    #[test]
    fn descendant_subscription_fires_once_per_write() {
        let mut s = state();
        let hits = Rc::new(RefCell::new(Vec::new()));
        let h = Rc::clone(&hits);
        s.subscribe(
            move |c: &StateChange| h.borrow_mut().push(c.path.to_string()),
            SubscribeOptions::descendants("analog.lineColors"),
        );
        s.set("analog.lineColors.0", json!("#000000")).unwrap();
        s.set("analog.yLabels.0", json!("X")).unwrap();
        assert_eq!(hits.borrow().as_slice(), ["analog.lineColors.0"]);
    }

    #[test]
    fn exact_subscription_ignores_children() {
        let mut s = state();
        let count = Rc::new(RefCell::new(0));
        let c = Rc::clone(&count);
        s.subscribe(move |_: &StateChange| *c.borrow_mut() += 1, SubscribeOptions::exact("analog.lineColors"));
        s.set("analog.lineColors.0", json!("#000000")).unwrap();
        assert_eq!(*count.borrow(), 0);
        s.set("analog.lineColors", json!(["#000000"])).unwrap();
        assert_eq!(*count.borrow(), 1);
    }

    #[test]
    fn property_subscription_covers_all_kinds() {
        let mut s = state();
        let count = Rc::new(RefCell::new(0));
        let c = Rc::clone(&count);
        let ids = s.subscribe_property("color", move |_: &StateChange| *c.borrow_mut() += 1, true);
        assert_eq!(ids.len(), 3);
        s.set("analog.lineColors.0", json!("#000000")).unwrap();
        s.set("digital.lineColors.0", json!("#000000")).unwrap();
        assert_eq!(*count.borrow(), 2);
        for id in ids {
            assert!(s.unsubscribe(id));
        }
        s.set("analog.lineColors.0", json!("#ffffff")).unwrap();
        assert_eq!(*count.borrow(), 2);
    }

    #[test]
    fn panicking_subscriber_is_skipped_and_write_commits() {
        let mut s = state();
        let seen = Rc::new(RefCell::new(false));
        let after = Rc::clone(&seen);
        s.subscribe(|_: &StateChange| panic!("boom"), SubscribeOptions::default());
        s.subscribe(move |_: &StateChange| *after.borrow_mut() = true, SubscribeOptions::default());
        s.set("analog.yLabels.0", json!("IA")).unwrap();
        assert!(*seen.borrow());
        assert_eq!(s.get("analog.yLabels.0"), Some(&json!("IA")));
    }

    #[test]
    fn undo_redo_round_trip_and_notify_same_shape() {
        let mut s = state();
        let log = Rc::new(RefCell::new(Vec::new()));
        let l = Rc::clone(&log);
        s.subscribe(move |c: &StateChange| l.borrow_mut().push(c.clone()), SubscribeOptions::default());
        s.set("analog.yLabels.1", json!("IB")).unwrap();
        let undone = s.undo().unwrap();
        assert_eq!(s.get("analog.yLabels.1"), Some(&json!("VB")));
        assert_eq!(undone[0].old_value, Some(json!("IB")));
        assert_eq!(undone[0].new_value, Some(json!("VB")));
        s.redo().unwrap();
        assert_eq!(s.get("analog.yLabels.1"), Some(&json!("IB")));
        assert_eq!(log.borrow().len(), 3);
    }

    #[test]
    fn suspended_history_records_one_entry() {
        let mut s = state();
        s.suspend_history();
        s.set("analog.yLabels.0", json!("A")).unwrap();
        s.set("analog.yLabels.1", json!("B")).unwrap();
        s.resume_history();
        s.undo().unwrap();
        assert_eq!(s.get("analog.yLabels.0"), Some(&json!("VA")));
        assert_eq!(s.get("analog.yLabels.1"), Some(&json!("VB")));
        assert!(!s.can_undo());
    }

    #[test]
    fn new_write_clears_redo() {
        let mut s = state();
        s.set("analog.yLabels.0", json!("A")).unwrap();
        s.undo();
        assert!(s.can_redo());
        s.set("analog.yLabels.0", json!("B")).unwrap();
        assert!(!s.can_redo());
    }

    #[test]
    fn batch_is_validated_before_commit() {
        let mut s = state();
        let res = s.set_many(vec![
            (StatePath::parse("analog.yLabels.0"), json!("X")),
            (StatePath::parse("missing.record.field"), json!(1)),
        ]);
        assert!(res.is_err());
        assert_eq!(s.get("analog.yLabels.0"), Some(&json!("VA")));
    }
}
