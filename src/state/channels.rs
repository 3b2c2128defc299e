//! Typed per-kind channel tables with stable, process-unique channel IDs.
//!
//! Each kind (analog, digital, computed) owns a set of aligned arrays in the
//! reactive state under `<kind>.<field>`. Every operation here keeps those
//! arrays the same length and keeps the ID→location map resolvable.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Mutex;

use once_cell::sync::Lazy;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::{Result, ViewerError};
use crate::recording::Recording;
use crate::state::reactive::{resolve_alias, ReactiveState, StatePath};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Analog,
    Digital,
    Computed,
}

impl ChannelKind {
    pub const ALL: [ChannelKind; 3] = [ChannelKind::Analog, ChannelKind::Digital, ChannelKind::Computed];

    pub fn as_str(self) -> &'static str {
        match self {
            ChannelKind::Analog => "analog",
            ChannelKind::Digital => "digital",
            ChannelKind::Computed => "computed",
        }
    }

    pub fn parse(name: &str) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "analog" => Ok(ChannelKind::Analog),
            "digital" => Ok(ChannelKind::Digital),
            "computed" => Ok(ChannelKind::Computed),
            other => Err(ViewerError::UnknownKind(other.to_string())),
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One aligned per-channel array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelField {
    YLabels,
    LineColors,
    YUnits,
    Groups,
    AxesScales,
    Scales,
    Starts,
    Durations,
    Inverts,
    ChannelIds,
    Equations,
}

impl ChannelField {
    pub const ALL: [ChannelField; 11] = [
        ChannelField::YLabels,
        ChannelField::LineColors,
        ChannelField::YUnits,
        ChannelField::Groups,
        ChannelField::AxesScales,
        ChannelField::Scales,
        ChannelField::Starts,
        ChannelField::Durations,
        ChannelField::Inverts,
        ChannelField::ChannelIds,
        ChannelField::Equations,
    ];

    pub fn key(self) -> &'static str {
        match self {
            ChannelField::YLabels => "yLabels",
            ChannelField::LineColors => "lineColors",
            ChannelField::YUnits => "yUnits",
            ChannelField::Groups => "groups",
            ChannelField::AxesScales => "axesScales",
            ChannelField::Scales => "scales",
            ChannelField::Starts => "starts",
            ChannelField::Durations => "durations",
            ChannelField::Inverts => "inverts",
            ChannelField::ChannelIds => "channelIDs",
            ChannelField::Equations => "equations",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.key() == key)
    }

    /// Accepts either a state key (`lineColors`) or a property alias (`color`).
    pub fn from_alias(name: &str) -> Option<Self> {
        Self::from_key(resolve_alias(name))
    }

    pub fn applies_to(self, kind: ChannelKind) -> bool {
        self != ChannelField::Equations || kind == ChannelKind::Computed
    }

    /// Fields present for `kind`, in storage order.
    pub fn for_kind(kind: ChannelKind) -> impl Iterator<Item = ChannelField> {
        Self::ALL.into_iter().filter(move |f| f.applies_to(kind))
    }

    pub fn default_value(self) -> Value {
        match self {
            ChannelField::AxesScales | ChannelField::Scales => json!(1.0),
            ChannelField::Starts | ChannelField::Durations => json!(0.0),
            ChannelField::Inverts => json!(false),
            _ => json!(""),
        }
    }

    /// Coerce an editor-supplied value to the field's storage type.
    ///
    /// Numeric fields accept numbers or numeric strings; `inverts` accepts
    /// booleans, `0/1` and `"true"/"false"`.
    pub fn coerce(self, value: &Value) -> Result<Value> {
        let invalid = |reason: &str| ViewerError::InvalidValue {
            field: self.key().to_string(),
            reason: reason.to_string(),
        };
        match self {
            ChannelField::ChannelIds => Err(invalid("channel ids are assigned at ingest")),
            ChannelField::AxesScales | ChannelField::Scales | ChannelField::Starts | ChannelField::Durations => {
                let n = match value {
                    Value::Number(n) => n.as_f64(),
                    Value::String(s) => s.trim().parse::<f64>().ok(),
                    _ => None,
                }
                .filter(|n| n.is_finite())
                .ok_or_else(|| invalid("expected a finite number"))?;
                if self == ChannelField::Durations && n < 0.0 {
                    return Err(invalid("duration must not be negative"));
                }
                Ok(json!(n))
            }
            ChannelField::Inverts => match value {
                Value::Bool(b) => Ok(json!(*b)),
                Value::Number(n) => Ok(json!(n.as_f64().unwrap_or(0.0) != 0.0)),
                Value::String(s) => match s.trim() {
                    "true" | "1" => Ok(json!(true)),
                    "false" | "0" => Ok(json!(false)),
                    _ => Err(invalid("expected a boolean")),
                },
                _ => Err(invalid("expected a boolean")),
            },
            _ => match value {
                Value::String(s) => Ok(json!(s)),
                Value::Number(n) => Ok(json!(n.to_string())),
                _ => Err(invalid("expected a string")),
            },
        }
    }
}

impl fmt::Display for ChannelField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelLocation {
    pub kind: ChannelKind,
    pub index: usize,
}

/// How a caller addresses a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelTarget {
    Id(String),
    Index(ChannelKind, usize),
}

impl From<&str> for ChannelTarget {
    fn from(id: &str) -> Self {
        ChannelTarget::Id(id.to_string())
    }
}

/// Metadata for a new channel row.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelRow {
    pub label: String,
    pub color: String,
    pub unit: String,
    pub group: String,
    pub axis_scale: f64,
    pub scale: f64,
    pub start: f64,
    pub duration: f64,
    pub invert: bool,
    pub equation: String,
}

impl Default for ChannelRow {
    fn default() -> Self {
        Self {
            label: String::new(),
            color: String::new(),
            unit: String::new(),
            group: String::new(),
            axis_scale: 1.0,
            scale: 1.0,
            start: 0.0,
            duration: 0.0,
            invert: false,
            equation: String::new(),
        }
    }
}

/// Plain copy of one kind's aligned arrays.
///
/// Used by planners and by the dispatcher to simulate a change before
/// committing it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelTable {
    pub labels: Vec<String>,
    pub colors: Vec<String>,
    pub units: Vec<String>,
    pub groups: Vec<String>,
    pub axes_scales: Vec<f64>,
    pub scales: Vec<f64>,
    pub starts: Vec<f64>,
    pub durations: Vec<f64>,
    pub inverts: Vec<bool>,
    pub ids: Vec<String>,
    pub equations: Vec<String>,
}

impl ChannelTable {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.ids.iter().position(|x| x == id)
    }

    pub fn push(&mut self, row: &ChannelRow, id: String, kind: ChannelKind) {
        self.labels.push(row.label.clone());
        self.colors.push(row.color.clone());
        self.units.push(row.unit.clone());
        self.groups.push(row.group.clone());
        self.axes_scales.push(row.axis_scale);
        self.scales.push(row.scale);
        self.starts.push(row.start);
        self.durations.push(row.duration);
        self.inverts.push(row.invert);
        self.ids.push(id);
        if kind == ChannelKind::Computed {
            self.equations.push(row.equation.clone());
        }
    }

    pub fn remove(&mut self, index: usize) {
        if index >= self.len() {
            return;
        }
        self.labels.remove(index);
        self.colors.remove(index);
        self.units.remove(index);
        self.groups.remove(index);
        self.axes_scales.remove(index);
        self.scales.remove(index);
        self.starts.remove(index);
        self.durations.remove(index);
        self.inverts.remove(index);
        self.ids.remove(index);
        if index < self.equations.len() {
            self.equations.remove(index);
        }
    }

    /// Write an already-coerced value into the table.
    pub fn apply(&mut self, field: ChannelField, index: usize, value: &Value) {
        let s = || value.as_str().unwrap_or_default().to_string();
        let n = || value.as_f64().unwrap_or_default();
        fn put<T>(v: &mut [T], i: usize, x: T) {
            if let Some(slot) = v.get_mut(i) {
                *slot = x;
            }
        }
        match field {
            ChannelField::YLabels => put(&mut self.labels, index, s()),
            ChannelField::LineColors => put(&mut self.colors, index, s()),
            ChannelField::YUnits => put(&mut self.units, index, s()),
            ChannelField::Groups => put(&mut self.groups, index, s()),
            ChannelField::AxesScales => put(&mut self.axes_scales, index, n()),
            ChannelField::Scales => put(&mut self.scales, index, n()),
            ChannelField::Starts => put(&mut self.starts, index, n()),
            ChannelField::Durations => put(&mut self.durations, index, n()),
            ChannelField::Inverts => put(&mut self.inverts, index, value.as_bool().unwrap_or(false)),
            ChannelField::ChannelIds => put(&mut self.ids, index, s()),
            ChannelField::Equations => put(&mut self.equations, index, s()),
        }
    }

    fn field_value(&self, field: ChannelField) -> Value {
        match field {
            ChannelField::YLabels => json!(self.labels),
            ChannelField::LineColors => json!(self.colors),
            ChannelField::YUnits => json!(self.units),
            ChannelField::Groups => json!(self.groups),
            ChannelField::AxesScales => json!(self.axes_scales),
            ChannelField::Scales => json!(self.scales),
            ChannelField::Starts => json!(self.starts),
            ChannelField::Durations => json!(self.durations),
            ChannelField::Inverts => json!(self.inverts),
            ChannelField::ChannelIds => json!(self.ids),
            ChannelField::Equations => json!(self.equations),
        }
    }

    /// Serialize into the `<kind>` record layout.
    pub fn to_value(&self, kind: ChannelKind) -> Value {
        let mut record = Map::new();
        for field in ChannelField::for_kind(kind) {
            record.insert(field.key().to_string(), self.field_value(field));
        }
        Value::Object(record)
    }

    /// Read a `<kind>` record leniently: missing arrays and ill-typed
    /// elements fall back to field defaults, and every array is padded or
    /// truncated to the number of channel ids.
    pub fn from_value(record: Option<&Value>, kind: ChannelKind) -> Self {
        let arr = |field: ChannelField| -> Vec<Value> {
            record
                .and_then(|r| r.get(field.key()))
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default()
        };
        let ids: Vec<String> = arr(ChannelField::ChannelIds)
            .iter()
            .map(|v| v.as_str().unwrap_or_default().to_string())
            .collect();
        let n = ids.len();
        let strings = |field: ChannelField| -> Vec<String> {
            let mut v: Vec<String> = arr(field)
                .iter()
                .map(|x| x.as_str().unwrap_or_default().to_string())
                .collect();
            v.resize(n, String::new());
            v
        };
        let numbers = |field: ChannelField, default: f64| -> Vec<f64> {
            let mut v: Vec<f64> = arr(field).iter().map(|x| x.as_f64().unwrap_or(default)).collect();
            v.resize(n, default);
            v
        };
        let mut inverts: Vec<bool> = arr(ChannelField::Inverts)
            .iter()
            .map(|x| x.as_bool().unwrap_or(false))
            .collect();
        inverts.resize(n, false);
        Self {
            labels: strings(ChannelField::YLabels),
            colors: strings(ChannelField::LineColors),
            units: strings(ChannelField::YUnits),
            groups: strings(ChannelField::Groups),
            axes_scales: numbers(ChannelField::AxesScales, 1.0),
            scales: numbers(ChannelField::Scales, 1.0),
            starts: numbers(ChannelField::Starts, 0.0),
            durations: numbers(ChannelField::Durations, 0.0),
            inverts,
            equations: if kind == ChannelKind::Computed {
                strings(ChannelField::Equations)
            } else {
                Vec::new()
            },
            ids,
        }
    }
}

/// All three tables at one instant.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelSnapshot {
    pub analog: ChannelTable,
    pub digital: ChannelTable,
    pub computed: ChannelTable,
}

impl ChannelSnapshot {
    pub fn table(&self, kind: ChannelKind) -> &ChannelTable {
        match kind {
            ChannelKind::Analog => &self.analog,
            ChannelKind::Digital => &self.digital,
            ChannelKind::Computed => &self.computed,
        }
    }

    pub fn table_mut(&mut self, kind: ChannelKind) -> &mut ChannelTable {
        match kind {
            ChannelKind::Analog => &mut self.analog,
            ChannelKind::Digital => &mut self.digital,
            ChannelKind::Computed => &mut self.computed,
        }
    }

    pub fn locate(&self, id: &str) -> Option<ChannelLocation> {
        ChannelKind::ALL.into_iter().find_map(|kind| {
            self.table(kind)
                .index_of(id)
                .map(|index| ChannelLocation { kind, index })
        })
    }
}

/// File-level metadata stored next to the channel tables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoadMetadata {
    pub filenames: Vec<String>,
    pub file_count: usize,
    pub is_merged: bool,
}

static ISSUED_IDS: Lazy<Mutex<HashSet<String>>> = Lazy::new(|| Mutex::new(HashSet::new()));

const ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Issue `{kind}-{index}-{random}`, never handing out the same id twice in
/// this process.
pub fn issue_channel_id(kind: ChannelKind, index: usize) -> String {
    let mut issued = ISSUED_IDS.lock().unwrap_or_else(|e| e.into_inner());
    let mut rng = rand::thread_rng();
    loop {
        let suffix: String = (0..6)
            .map(|_| ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())] as char)
            .collect();
        let id = format!("{}-{}-{}", kind.as_str(), index, suffix);
        if issued.insert(id.clone()) {
            return id;
        }
    }
}

/// The channel model: typed access over the reactive state plus the ID map.
pub struct ChannelModel {
    state: ReactiveState,
    id_map: RefCell<HashMap<String, ChannelLocation>>,
}

impl Default for ChannelModel {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ChannelModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelModel")
            .field("analog", &self.len(ChannelKind::Analog))
            .field("digital", &self.len(ChannelKind::Digital))
            .field("computed", &self.len(ChannelKind::Computed))
            .finish()
    }
}

impl ChannelModel {
    pub fn new() -> Self {
        Self {
            state: ReactiveState::new(Self::root_value(&ChannelSnapshot::default(), &LoadMetadata::default())),
            id_map: RefCell::new(HashMap::new()),
        }
    }

    fn root_value(snapshot: &ChannelSnapshot, meta: &LoadMetadata) -> Value {
        json!({
            "analog": snapshot.analog.to_value(ChannelKind::Analog),
            "digital": snapshot.digital.to_value(ChannelKind::Digital),
            "computed": snapshot.computed.to_value(ChannelKind::Computed),
            "metadata": meta,
        })
    }

    /// Build the tables for a freshly loaded recording.
    ///
    /// Analog groups come from the auto-grouping heuristic, digital channels
    /// share `GD0`, computed channels keep the group from their metadata.
    pub fn tables_for(recording: &Recording) -> ChannelSnapshot {
        let cfg = &recording.config;
        let mut snap = ChannelSnapshot::default();
        let analog_groups = crate::groups::auto_group_analog(&cfg.analog_channels);
        for (i, ch) in cfg.analog_channels.iter().enumerate() {
            let row = ChannelRow {
                label: ch.id.clone(),
                color: crate::theme::trace_hex(i),
                unit: ch.unit.clone(),
                group: analog_groups.get(i).cloned().unwrap_or_else(|| "G0".into()),
                ..Default::default()
            };
            snap.analog.push(&row, issue_channel_id(ChannelKind::Analog, i), ChannelKind::Analog);
        }
        for (i, ch) in cfg.digital_channels.iter().enumerate() {
            let row = ChannelRow {
                label: ch.id.clone(),
                color: crate::theme::trace_hex(i),
                unit: ch.unit.clone(),
                group: crate::groups::DEFAULT_DIGITAL_GROUP.to_string(),
                ..Default::default()
            };
            snap.digital.push(&row, issue_channel_id(ChannelKind::Digital, i), ChannelKind::Digital);
        }
        for (i, meta) in cfg.computed_channels.iter().enumerate() {
            let row = Self::computed_row(meta, i);
            snap.computed.push(&row, issue_channel_id(ChannelKind::Computed, i), ChannelKind::Computed);
        }
        snap
    }

    pub(crate) fn computed_row(meta: &crate::recording::ComputedChannelMeta, index: usize) -> ChannelRow {
        ChannelRow {
            label: if meta.name.is_empty() { meta.id.clone() } else { meta.name.clone() },
            color: if meta.color.is_empty() {
                crate::theme::trace_hex(index)
            } else {
                meta.color.clone()
            },
            unit: meta.unit.clone(),
            group: if meta.group.is_empty() {
                crate::recording::DEFAULT_COMPUTED_GROUP.to_string()
            } else {
                meta.group.clone()
            },
            equation: meta.equation.clone(),
            ..Default::default()
        }
    }

    /// Reinitialize from a recording. Existing subscribers are kept and
    /// notified with a root change; history is reset.
    pub fn load(&mut self, recording: &Recording, meta: &LoadMetadata) {
        let snapshot = Self::tables_for(recording);
        self.state.replace_root(Self::root_value(&snapshot, meta));
        self.rebuild_id_map();
    }

    pub fn from_recording(recording: &Recording) -> Self {
        let mut model = Self::new();
        model.load(recording, &LoadMetadata::default());
        model
    }

    pub fn state(&self) -> &ReactiveState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut ReactiveState {
        &mut self.state
    }

    pub fn metadata(&self) -> LoadMetadata {
        self.state
            .get("metadata")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }

    pub fn len(&self, kind: ChannelKind) -> usize {
        self.state
            .get(StatePath::from_segments([kind.as_str(), ChannelField::ChannelIds.key()]))
            .and_then(Value::as_array)
            .map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        ChannelKind::ALL.into_iter().all(|k| self.len(k) == 0)
    }

    pub fn field_path(kind: ChannelKind, field: ChannelField, index: usize) -> StatePath {
        StatePath::from_segments([kind.as_str().to_string(), field.key().to_string(), index.to_string()])
    }

    pub fn value(&self, kind: ChannelKind, field: ChannelField, index: usize) -> Option<&Value> {
        self.state.get(Self::field_path(kind, field, index))
    }

    fn string_at(&self, kind: ChannelKind, field: ChannelField, index: usize) -> Option<String> {
        self.value(kind, field, index)
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    fn number_at(&self, kind: ChannelKind, field: ChannelField, index: usize) -> Option<f64> {
        self.value(kind, field, index).and_then(Value::as_f64)
    }

    pub fn label(&self, kind: ChannelKind, index: usize) -> Option<String> {
        self.string_at(kind, ChannelField::YLabels, index)
    }

    pub fn color(&self, kind: ChannelKind, index: usize) -> Option<String> {
        self.string_at(kind, ChannelField::LineColors, index)
    }

    pub fn unit(&self, kind: ChannelKind, index: usize) -> Option<String> {
        self.string_at(kind, ChannelField::YUnits, index)
    }

    pub fn group(&self, kind: ChannelKind, index: usize) -> Option<String> {
        self.string_at(kind, ChannelField::Groups, index)
    }

    pub fn channel_id(&self, kind: ChannelKind, index: usize) -> Option<String> {
        self.string_at(kind, ChannelField::ChannelIds, index)
    }

    pub fn equation(&self, index: usize) -> Option<String> {
        self.string_at(ChannelKind::Computed, ChannelField::Equations, index)
    }

    pub fn scale(&self, kind: ChannelKind, index: usize) -> Option<f64> {
        self.number_at(kind, ChannelField::Scales, index)
    }

    pub fn start(&self, kind: ChannelKind, index: usize) -> Option<f64> {
        self.number_at(kind, ChannelField::Starts, index)
    }

    pub fn duration(&self, kind: ChannelKind, index: usize) -> Option<f64> {
        self.number_at(kind, ChannelField::Durations, index)
    }

    pub fn invert(&self, kind: ChannelKind, index: usize) -> Option<bool> {
        self.value(kind, ChannelField::Inverts, index).and_then(Value::as_bool)
    }

    pub fn ids(&self, kind: ChannelKind) -> Vec<String> {
        (0..self.len(kind))
            .filter_map(|i| self.channel_id(kind, i))
            .collect()
    }

    pub fn snapshot(&self) -> ChannelSnapshot {
        ChannelSnapshot {
            analog: ChannelTable::from_value(self.state.get(ChannelKind::Analog.as_str()), ChannelKind::Analog),
            digital: ChannelTable::from_value(self.state.get(ChannelKind::Digital.as_str()), ChannelKind::Digital),
            computed: ChannelTable::from_value(
                self.state.get(ChannelKind::Computed.as_str()),
                ChannelKind::Computed,
            ),
        }
    }

    /// Rebuild the ID→location map from the current `channelIDs` arrays.
    pub fn rebuild_id_map(&self) {
        let mut map = HashMap::new();
        for kind in ChannelKind::ALL {
            for index in 0..self.len(kind) {
                if let Some(id) = self.channel_id(kind, index) {
                    map.insert(id, ChannelLocation { kind, index });
                }
            }
        }
        *self.id_map.borrow_mut() = map;
    }

    /// Resolve a channel id. A miss or stale hit triggers one map rebuild.
    pub fn find_channel_by_id(&self, id: &str) -> Option<ChannelLocation> {
        let cached = self.id_map.borrow().get(id).copied();
        if let Some(loc) = cached {
            if self.channel_id(loc.kind, loc.index).as_deref() == Some(id) {
                return Some(loc);
            }
        }
        self.rebuild_id_map();
        let rebuilt = self.id_map.borrow().get(id).copied();
        rebuilt
    }

    pub fn resolve(&self, target: &ChannelTarget) -> Result<ChannelLocation> {
        match target {
            ChannelTarget::Id(id) => self
                .find_channel_by_id(id)
                .ok_or_else(|| ViewerError::UnknownChannel(id.clone())),
            ChannelTarget::Index(kind, index) => {
                let len = self.len(*kind);
                if *index < len {
                    Ok(ChannelLocation {
                        kind: *kind,
                        index: *index,
                    })
                } else {
                    Err(ViewerError::IndexOutOfBounds {
                        kind: *kind,
                        index: *index,
                        len,
                    })
                }
            }
        }
    }

    /// Validate, coerce and write one field. The matching field subscriber
    /// fires exactly once.
    pub fn try_update_field(&mut self, target: &ChannelTarget, field: ChannelField, value: &Value) -> Result<ChannelLocation> {
        let loc = self.resolve(target)?;
        if !field.applies_to(loc.kind) {
            return Err(ViewerError::UnknownField {
                kind: loc.kind,
                field: field.key().to_string(),
            });
        }
        let coerced = field.coerce(value)?;
        let array_path = StatePath::from_segments([loc.kind.as_str(), field.key()]);
        let n = self.len(loc.kind);
        self.state.ensure_array(&array_path, n, &field.default_value())?;
        self.state.set(array_path.child(loc.index), coerced)?;
        Ok(loc)
    }

    /// Boolean form of [`try_update_field`](Self::try_update_field); failures
    /// are logged at debug level and fire no subscriber.
    pub fn update_field(&mut self, target: &ChannelTarget, field: ChannelField, value: &Value) -> bool {
        match self.try_update_field(target, field, value) {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!("update_field {field} on {target:?} rejected: {e}");
                false
            }
        }
    }

    /// Append a channel row and return its freshly issued id. Structural,
    /// so history is cleared.
    pub fn append_channel(&mut self, kind: ChannelKind, row: &ChannelRow) -> Result<String> {
        let mut table = self.snapshot().table(kind).clone();
        let id = issue_channel_id(kind, table.len());
        table.push(row, id.clone(), kind);
        self.write_table(kind, &table)?;
        self.rebuild_id_map();
        Ok(id)
    }

    /// Splice every aligned array of `kind` in one notification batch.
    fn write_table(&mut self, kind: ChannelKind, table: &ChannelTable) -> Result<()> {
        let writes = ChannelField::for_kind(kind)
            .map(|f| {
                (
                    StatePath::from_segments([kind.as_str(), f.key()]),
                    table.field_value(f),
                )
            })
            .collect();
        self.state.set_many_untracked(writes)
    }

    /// Remove a channel everywhere: metadata arrays, configuration entry and
    /// sample slot. For computed channels `evict` receives the persisted
    /// channel id so the store can drop it too.
    pub fn remove_channel<F>(&mut self, id: &str, recording: &mut Recording, evict: F) -> Result<ChannelLocation>
    where
        F: FnOnce(&str),
    {
        let loc = self
            .find_channel_by_id(id)
            .ok_or_else(|| ViewerError::UnknownChannel(id.to_string()))?;
        let mut table = self.snapshot().table(loc.kind).clone();
        table.remove(loc.index);

        let cfg = &mut recording.config;
        let data = &mut recording.data;
        match loc.kind {
            ChannelKind::Analog => {
                remove_at(&mut cfg.analog_channels, loc.index);
                remove_at(&mut data.analog_data, loc.index);
            }
            ChannelKind::Digital => {
                remove_at(&mut cfg.digital_channels, loc.index);
                remove_at(&mut data.digital_data, loc.index);
            }
            ChannelKind::Computed => {
                let meta = remove_at(&mut cfg.computed_channels, loc.index);
                remove_at(&mut data.computed_data, loc.index);
                if let Some(meta) = meta {
                    evict(&meta.id);
                }
            }
        }

        self.write_table(loc.kind, &table)?;
        self.rebuild_id_map();
        Ok(loc)
    }

    /// Boolean form of [`remove_channel`](Self::remove_channel).
    pub fn delete_channel<F>(&mut self, id: &str, recording: &mut Recording, evict: F) -> bool
    where
        F: FnOnce(&str),
    {
        match self.remove_channel(id, recording, evict) {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!("delete_channel {id} rejected: {e}");
                false
            }
        }
    }

    /// Check that every table is aligned, ids are unique and the map resolves them.
    pub fn check_invariants(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for kind in ChannelKind::ALL {
            let n = self.len(kind);
            for field in ChannelField::for_kind(kind) {
                let len = self
                    .state
                    .get(StatePath::from_segments([kind.as_str(), field.key()]))
                    .and_then(Value::as_array)
                    .map_or(0, Vec::len);
                if len != n {
                    return Err(ViewerError::InvalidValue {
                        field: format!("{kind}.{field}"),
                        reason: format!("length {len}, expected {n}"),
                    });
                }
            }
            for (index, id) in self.ids(kind).into_iter().enumerate() {
                if !seen.insert(id.clone()) {
                    return Err(ViewerError::InvalidValue {
                        field: format!("{kind}.channelIDs"),
                        reason: format!("duplicate id {id}"),
                    });
                }
                if self.find_channel_by_id(&id) != Some(ChannelLocation { kind, index }) {
                    return Err(ViewerError::UnknownChannel(id));
                }
            }
        }
        Ok(())
    }
}

fn remove_at<T>(v: &mut Vec<T>, index: usize) -> Option<T> {
    (index < v.len()).then(|| v.remove(index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::{ChannelDescriptor, ComputedChannelMeta, Config, Data, SamplingRate};
    use crate::state::reactive::{StateChange, SubscribeOptions};
    use std::rc::Rc;

    fn recording() -> Recording {
        let config = Config {
            analog_channels: vec![
                ChannelDescriptor::new("VA", "kV"),
                ChannelDescriptor::new("VB", "kV"),
                ChannelDescriptor::new("IA", "A"),
            ],
            digital_channels: vec![ChannelDescriptor::new("TRIP", "")],
            computed_channels: vec![ComputedChannelMeta {
                id: "calc-1".into(),
                name: "Sum".into(),
                equation: "VA+VB".into(),
                ..Default::default()
            }],
            sampling_rates: vec![SamplingRate { rate: 1000.0, end_sample: 2 }],
            ..Default::default()
        };
        let data = Data {
            time: vec![0.0, 0.001],
            analog_data: vec![vec![1.0, 2.0], vec![3.0, 4.0], vec![5.0, 6.0]],
            digital_data: vec![vec![0.0, 1.0]],
            computed_data: vec![vec![4.0, 6.0]],
        };
        Recording::new(config, data)
    }

    #[test]
    fn ingest_assigns_prefixed_unique_ids() {
        let model = ChannelModel::from_recording(&recording());
        let ids = model.ids(ChannelKind::Analog);
        assert_eq!(ids.len(), 3);
        assert!(ids[1].starts_with("analog-1-"));
        assert!(model.channel_id(ChannelKind::Computed, 0).unwrap().starts_with("computed-0-"));
        model.check_invariants().unwrap();
    }

    #[test]
    fn update_field_rejects_bad_targets() {
        let mut model = ChannelModel::from_recording(&recording());
        assert!(!model.update_field(&ChannelTarget::Index(ChannelKind::Analog, 9), ChannelField::LineColors, &json!("#fff")));
        assert!(!model.update_field(&"nope".into(), ChannelField::LineColors, &json!("#fff")));
        assert!(!model.update_field(&ChannelTarget::Index(ChannelKind::Analog, 0), ChannelField::Equations, &json!("x")));
        assert!(!model.update_field(&ChannelTarget::Index(ChannelKind::Analog, 0), ChannelField::Scales, &json!("abc")));
    }

    #[test]
    fn update_field_fires_field_subscriber_once() {
        let mut model = ChannelModel::from_recording(&recording());
        let hits = Rc::new(RefCell::new(0));
        let h = Rc::clone(&hits);
        model.state_mut().subscribe(
            move |_: &StateChange| *h.borrow_mut() += 1,
            SubscribeOptions::descendants("analog.lineColors"),
        );
        assert!(model.update_field(&ChannelTarget::Index(ChannelKind::Analog, 1), ChannelField::LineColors, &json!("#ff0000")));
        assert_eq!(*hits.borrow(), 1);
        assert_eq!(model.color(ChannelKind::Analog, 1).as_deref(), Some("#ff0000"));
    }

    #[test]
    fn missing_array_is_lazily_initialized() {
        let mut model = ChannelModel::from_recording(&recording());
        model
            .state_mut()
            .set_many_untracked(vec![(StatePath::parse("digital.starts"), json!([]))])
            .unwrap();
        assert!(model.update_field(&ChannelTarget::Index(ChannelKind::Digital, 0), ChannelField::Starts, &json!(0.5)));
        assert_eq!(model.start(ChannelKind::Digital, 0), Some(0.5));
    }

    #[test]
    fn delete_splices_everything_and_never_reuses_ids() {
        let mut rec = recording();
        let mut model = ChannelModel::from_recording(&rec);
        let victim = model.channel_id(ChannelKind::Analog, 1).unwrap();
        assert!(model.delete_channel(&victim, &mut rec, |_| {}));
        assert_eq!(model.len(ChannelKind::Analog), 2);
        assert_eq!(rec.data.analog_data.len(), 2);
        assert_eq!(rec.config.analog_channels.len(), 2);
        assert!(model.find_channel_by_id(&victim).is_none());
        let moved = model.channel_id(ChannelKind::Analog, 1).unwrap();
        assert_eq!(model.find_channel_by_id(&moved).unwrap().index, 1);

        let fresh = model
            .append_channel(
                ChannelKind::Analog,
                &ChannelRow {
                    label: "VB".into(),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_ne!(fresh, victim);
        model.check_invariants().unwrap();
    }

    #[test]
    fn computed_delete_evicts_persisted_id() {
        let mut rec = recording();
        let mut model = ChannelModel::from_recording(&rec);
        let id = model.channel_id(ChannelKind::Computed, 0).unwrap();
        let mut evicted = None;
        assert!(model.delete_channel(&id, &mut rec, |meta_id| evicted = Some(meta_id.to_string())));
        assert_eq!(evicted.as_deref(), Some("calc-1"));
        assert_eq!(rec.config.computed_channels.len(), rec.data.computed_data.len());
        assert_eq!(model.len(ChannelKind::Computed), 0);
        model.check_invariants().unwrap();
    }

    #[test]
    fn delete_is_seen_atomically() {
        let mut rec = recording();
        let mut model = ChannelModel::from_recording(&rec);
        let lens = Rc::new(RefCell::new(Vec::new()));
        let l = Rc::clone(&lens);
        model.state_mut().subscribe(
            move |c: &StateChange| {
                if let Some(Value::Array(a)) = &c.new_value {
                    l.borrow_mut().push(a.len());
                }
            },
            SubscribeOptions::descendants("analog"),
        );
        let id = model.channel_id(ChannelKind::Analog, 0).unwrap();
        assert!(model.delete_channel(&id, &mut rec, |_| {}));
        assert!(lens.borrow().iter().all(|n| *n == 2));
    }
}
