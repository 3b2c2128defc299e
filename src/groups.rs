//! Partitioning of channels into chart groups.

use std::collections::HashMap;

use crate::axes::UnitFamily;
use crate::recording::{is_high, ChannelDescriptor, Recording};
use crate::state::channels::ChannelSnapshot;

/// Group every digital channel starts in.
pub const DEFAULT_DIGITAL_GROUP: &str = "GD0";

/// One chart's worth of channels.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Group {
    pub key: String,
    pub analog_indices: Vec<usize>,
    pub digital_indices: Vec<usize>,
    /// Channel ids of computed members.
    pub computed_ids: Vec<String>,
}

impl Group {
    fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            ..Default::default()
        }
    }

    pub fn series_count(&self) -> usize {
        self.analog_indices.len() + self.digital_indices.len() + self.computed_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series_count() == 0
    }
}

// Longest first so that `L1` wins over `1`.
const PHASE_SUFFIXES: [&str; 13] = ["L1", "L2", "L3", "A", "B", "C", "N", "R", "S", "T", "1", "2", "3"];

/// Strip a trailing phase designator (`VA` → `V`, `I_L2` → `I`).
///
/// Labels that would become empty are returned unchanged.
pub fn phase_base(label: &str) -> String {
    let trimmed = label.trim();
    let upper = trimmed.to_ascii_uppercase();
    for suffix in PHASE_SUFFIXES {
        if upper.ends_with(suffix) && upper.len() > suffix.len() {
            let base = trimmed[..trimmed.len() - suffix.len()].trim_end_matches(['_', '-', ' ', '.', ':']);
            if !base.is_empty() {
                return base.to_string();
            }
        }
    }
    trimmed.to_string()
}

/// Assign `G0, G1, …` to analog channels by (unit family, phase-stripped
/// label), numbered in order of first appearance.
pub fn auto_group_analog(channels: &[ChannelDescriptor]) -> Vec<String> {
    let mut keys: HashMap<(UnitFamily, String), usize> = HashMap::new();
    channels
        .iter()
        .map(|ch| {
            let key = (UnitFamily::from_unit(&ch.unit), phase_base(&ch.id).to_ascii_uppercase());
            let next = keys.len();
            let n = *keys.entry(key).or_insert(next);
            format!("G{n}")
        })
        .collect()
}

/// True when a digital sample row holds at least one HIGH sample.
pub fn has_high(values: &[f64]) -> bool {
    values.iter().any(|v| is_high(*v))
}

/// Partition the current channels into ordered groups.
///
/// Order: groups in first-appearance order over analog channels, then over
/// digital channels, then computed-only groups. Digital channels with no
/// HIGH sample are dropped; groups left with no series are dropped too.
pub fn plan_groups(snapshot: &ChannelSnapshot, recording: &Recording) -> Vec<Group> {
    let mut order: Vec<Group> = Vec::new();
    let mut slot: HashMap<String, usize> = HashMap::new();
    let mut entry = |key: &str, order: &mut Vec<Group>| -> usize {
        if let Some(i) = slot.get(key) {
            return *i;
        }
        order.push(Group::new(key));
        slot.insert(key.to_string(), order.len() - 1);
        order.len() - 1
    };

    for (i, key) in snapshot.analog.groups.iter().enumerate() {
        let g = entry(key, &mut order);
        order[g].analog_indices.push(i);
    }
    for (i, key) in snapshot.digital.groups.iter().enumerate() {
        let g = entry(key, &mut order);
        let live = recording
            .data
            .digital_data
            .get(i)
            .is_some_and(|row| has_high(row));
        if live {
            order[g].digital_indices.push(i);
        }
    }
    for (i, key) in snapshot.computed.groups.iter().enumerate() {
        let g = entry(key, &mut order);
        if let Some(id) = snapshot.computed.ids.get(i) {
            order[g].computed_ids.push(id.clone());
        }
    }

    order.retain(|g| !g.is_empty());
    order
}

/// Group key of a channel given by id, if present in the snapshot.
pub fn group_of(snapshot: &ChannelSnapshot, id: &str) -> Option<String> {
    let loc = snapshot.locate(id)?;
    snapshot.table(loc.kind).groups.get(loc.index).cloned()
}
