//! Persistence and re-hydration of user-defined computed channels.
//!
//! All definitions live in one JSON record under a single key:
//! `{"version": 1, "computedChannels": [...]}`. A bare array (older layout)
//! is accepted on load.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::persistence::{load_json, save_json, KeyValueStore};
use crate::recording::{coerce_made_from, fit_computed_row, sample_rows, ComputedChannelMeta, MadeFrom, Recording, DEFAULT_COMPUTED_GROUP};
use crate::state::channels::{ChannelKind, ChannelModel};

pub const STORE_VERSION: u32 = 1;

fn default_group() -> String {
    DEFAULT_COMPUTED_GROUP.to_string()
}

/// A computed channel as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredComputedChannel {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, alias = "equation")]
    pub expression: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub math_js_expression: Option<String>,
    #[serde(default)]
    pub unit: String,
    #[serde(default = "default_group")]
    pub group: String,
    #[serde(default)]
    pub color: String,
    #[serde(default)]
    pub made_from: MadeFrom,
    #[serde(
        default,
        with = "sample_rows::optional_column",
        skip_serializing_if = "Option::is_none"
    )]
    pub data: Option<Vec<f64>>,
}

impl StoredComputedChannel {
    pub fn from_meta(meta: &ComputedChannelMeta, data: Option<&[f64]>) -> Self {
        Self {
            id: meta.id.clone(),
            name: meta.name.clone(),
            expression: meta.equation.clone(),
            math_js_expression: None,
            unit: meta.unit.clone(),
            group: meta.group.clone(),
            color: meta.color.clone(),
            made_from: meta.made_from,
            data: data.map(<[f64]>::to_vec),
        }
    }

    pub fn to_meta(&self) -> ComputedChannelMeta {
        ComputedChannelMeta {
            id: self.id.clone(),
            name: self.name.clone(),
            equation: self.expression.clone(),
            unit: self.unit.clone(),
            group: if self.group.is_empty() { default_group() } else { self.group.clone() },
            color: self.color.clone(),
            made_from: self.made_from,
            sample_count: self.data.as_ref().map_or(0, Vec::len),
        }
    }

    pub(crate) fn same_channel(&self, meta: &ComputedChannelMeta) -> bool {
        self.id == meta.id || (!self.expression.is_empty() && self.expression == meta.equation)
    }
}

/// Partial update merged into a stored entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ComputedPatch {
    pub name: Option<String>,
    #[serde(alias = "equation")]
    pub expression: Option<String>,
    pub math_js_expression: Option<String>,
    pub unit: Option<String>,
    pub group: Option<String>,
    pub color: Option<String>,
    pub made_from: Option<MadeFrom>,
    #[serde(with = "sample_rows::optional_column")]
    pub data: Option<Vec<f64>>,
}

impl ComputedPatch {
    fn apply(self, entry: &mut StoredComputedChannel) {
        if let Some(v) = self.name {
            entry.name = v;
        }
        if let Some(v) = self.expression {
            entry.expression = v;
        }
        if let Some(v) = self.math_js_expression {
            entry.math_js_expression = Some(v);
        }
        if let Some(v) = self.unit {
            entry.unit = v;
        }
        if let Some(v) = self.group {
            entry.group = v;
        }
        if let Some(v) = self.color {
            entry.color = v;
        }
        if let Some(v) = self.made_from {
            entry.made_from = v;
        }
        if let Some(v) = self.data {
            entry.data = Some(v);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredRecord {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    computed_channels: Vec<StoredComputedChannel>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StoredShape {
    Record(StoredRecord),
    List(Vec<StoredComputedChannel>),
}

/// Drop later entries that repeat an earlier id or a non-empty expression.
pub fn dedupe(list: Vec<StoredComputedChannel>) -> Vec<StoredComputedChannel> {
    let mut out: Vec<StoredComputedChannel> = Vec::with_capacity(list.len());
    for entry in list {
        let dup = out.iter().any(|kept| {
            kept.id == entry.id || (!entry.expression.is_empty() && kept.expression == entry.expression)
        });
        if !dup {
            out.push(entry);
        }
    }
    out
}

/// The computed channel store on top of a [`KeyValueStore`].
pub struct ComputedChannelStore {
    backend: Box<dyn KeyValueStore>,
    key: String,
}

impl ComputedChannelStore {
    pub fn new(backend: Box<dyn KeyValueStore>, key: &str) -> Self {
        Self {
            backend,
            key: key.to_string(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Replace the stored list.
    pub fn save(&mut self, list: &[StoredComputedChannel]) -> Result<()> {
        let record = StoredRecord {
            version: STORE_VERSION,
            computed_channels: list.to_vec(),
        };
        save_json(self.backend.as_mut(), &self.key, &record)
    }

    /// Load and de-duplicate the stored list.
    pub fn try_load(&self) -> Result<Vec<StoredComputedChannel>> {
        let shape: Option<StoredShape> = load_json(self.backend.as_ref(), &self.key)?;
        let list = match shape {
            Some(StoredShape::Record(r)) => r.computed_channels,
            Some(StoredShape::List(l)) => l,
            None => Vec::new(),
        };
        Ok(dedupe(list))
    }

    /// Like [`try_load`](Self::try_load) but storage problems yield an empty list.
    pub fn load(&self) -> Vec<StoredComputedChannel> {
        self.try_load().unwrap_or_else(|e| {
            tracing::warn!("computed channel storage unreadable, starting empty: {e}");
            Vec::new()
        })
    }

    /// Merge `patch` into the entry with `id`. Unknown ids are a no-op (`Ok(false)`).
    pub fn update(&mut self, id: &str, patch: ComputedPatch) -> Result<bool> {
        let mut list = self.try_load()?;
        let Some(entry) = list.iter_mut().find(|e| e.id == id) else {
            return Ok(false);
        };
        patch.apply(entry);
        self.save(&list)?;
        Ok(true)
    }

    /// Remove the entry with `id`; absent ids are a no-op (`Ok(false)`).
    pub fn delete(&mut self, id: &str) -> Result<bool> {
        let mut list = self.try_load()?;
        let before = list.len();
        list.retain(|e| e.id != id);
        if list.len() == before {
            return Ok(false);
        }
        self.save(&list)?;
        Ok(true)
    }

    /// Append a definition, replacing any entry with the same id.
    pub fn upsert(&mut self, entry: StoredComputedChannel) -> Result<()> {
        let mut list = self.try_load()?;
        match list.iter_mut().find(|e| e.id == entry.id) {
            Some(slot) => *slot = entry,
            None => list.push(entry),
        }
        self.save(&dedupe(list))
    }

    /// Best-effort persistence used by the dispatcher; failures are logged.
    pub fn persist_best_effort(&mut self, f: impl FnOnce(&mut Self) -> Result<()>) {
        if let Err(e) = f(self) {
            tracing::warn!("computed channel storage write failed: {e}");
        }
    }
}

/// Bring stored definitions into a loaded recording.
///
/// Entries already present in `cfg.computedChannels` (same id or same
/// equation) are skipped. For every other entry the metadata, its sample row
/// (possibly empty) and a channel-state row are appended, with `madeFrom`
/// coerced to `analog` when the sample prefix disproves `digital`.
/// Returns how many channels were added.
pub fn rehydrate(
    list: &[StoredComputedChannel],
    recording: &mut Recording,
    channels: &mut ChannelModel,
    probe: usize,
) -> Result<usize> {
    let mut added = 0;
    for entry in list {
        if recording
            .config
            .computed_channels
            .iter()
            .any(|meta| entry.same_channel(meta))
        {
            continue;
        }
        let samples = recording.data.time.len();
        let values = fit_computed_row(entry.data.clone().unwrap_or_default(), samples, &entry.id);
        let mut meta = entry.to_meta();
        meta.sample_count = values.len();
        if coerce_made_from(&mut meta.made_from, &values, probe) {
            tracing::warn!("computed channel {} re-tagged as analog on rehydrate", meta.id);
        }
        let row = ChannelModel::computed_row(&meta, recording.config.computed_channels.len());
        recording.config.computed_channels.push(meta);
        recording.data.computed_data.push(values);
        channels.append_channel(ChannelKind::Computed, &row)?;
        added += 1;
    }
    Ok(added)
}

/// Snapshot the computed channels of a recording in storage form.
pub fn stored_from_recording(recording: &Recording) -> Vec<StoredComputedChannel> {
    recording
        .config
        .computed_channels
        .iter()
        .enumerate()
        .map(|(i, meta)| StoredComputedChannel::from_meta(meta, recording.computed_row(i)))
        .collect()
}
