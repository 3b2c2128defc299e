//! Registry of live charts, keyed by user group id.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::axes::AxisStructure;
use crate::error::{Result, ViewerError};
use crate::host::ContainerId;
use crate::plot::{DigitalFillPlugin, SharedPlot};
use crate::recording::MadeFrom;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChartType {
    Analog,
    Digital,
    Computed,
    Merged,
}

impl ChartType {
    pub fn as_str(self) -> &'static str {
        match self {
            ChartType::Analog => "analog",
            ChartType::Digital => "digital",
            ChartType::Computed => "computed",
            ChartType::Merged => "merged",
        }
    }

    /// Type of a chart holding the given mix of kinds.
    pub fn for_mix(analog: bool, digital: bool, computed: bool) -> Self {
        match (analog, digital, computed) {
            (true, false, false) => ChartType::Analog,
            (false, true, false) => ChartType::Digital,
            (false, false, true) => ChartType::Computed,
            _ => ChartType::Merged,
        }
    }
}

impl fmt::Display for ChartType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a plot series comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum SeriesOrigin {
    Time,
    Analog { index: usize, id: String },
    Digital { index: usize, id: String },
    Computed { index: usize, id: String, made_from: MadeFrom },
}

impl SeriesOrigin {
    pub fn channel_id(&self) -> Option<&str> {
        match self {
            SeriesOrigin::Time => None,
            SeriesOrigin::Analog { id, .. } | SeriesOrigin::Digital { id, .. } | SeriesOrigin::Computed { id, .. } => {
                Some(id)
            }
        }
    }

    /// True for series drawn by the digital fill overlay.
    pub fn is_digital(&self) -> bool {
        matches!(
            self,
            SeriesOrigin::Digital { .. }
                | SeriesOrigin::Computed {
                    made_from: MadeFrom::Digital,
                    ..
                }
        )
    }
}

/// Everything the renderer knows about a chart it just built.
pub struct ChartSpec {
    pub source_group_id: String,
    pub chart_type: ChartType,
    pub name: String,
    pub plot: SharedPlot,
    pub container: ContainerId,
    /// Series labels; index 0 is time.
    pub channels: Vec<String>,
    /// Series colors as hex; index 0 (time) is empty.
    pub colors: Vec<String>,
    pub indices: Vec<SeriesOrigin>,
    pub digital_plugin: Option<Rc<RefCell<DigitalFillPlugin>>>,
    pub axis_structure: AxisStructure,
}

pub struct ChartEntry {
    pub user_group_id: String,
    /// Per-type serial (`analog-3`, `merged-1`, ...).
    pub type_id: String,
    pub source_group_id: String,
    pub chart_type: ChartType,
    pub name: String,
    pub plot: SharedPlot,
    pub container: ContainerId,
    pub channels: Vec<String>,
    pub colors: Vec<String>,
    pub indices: Vec<SeriesOrigin>,
    pub digital_plugin: Option<Rc<RefCell<DigitalFillPlugin>>>,
    pub axis_structure: AxisStructure,
}

impl fmt::Debug for ChartEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChartEntry")
            .field("user_group_id", &self.user_group_id)
            .field("source_group_id", &self.source_group_id)
            .field("chart_type", &self.chart_type)
            .field("channels", &self.channels)
            .finish()
    }
}

impl ChartEntry {
    /// Plot series index of a channel.
    pub fn series_index_of(&self, channel_id: &str) -> Option<usize> {
        self.indices.iter().position(|o| o.channel_id() == Some(channel_id))
    }

    pub fn series_count(&self) -> usize {
        self.indices.len().saturating_sub(1)
    }

    /// Drop series `idx` from the entry bookkeeping (not from the plot).
    pub fn forget_series(&mut self, idx: usize) -> bool {
        if idx == 0 || idx >= self.indices.len() {
            return false;
        }
        self.indices.remove(idx);
        if idx < self.channels.len() {
            self.channels.remove(idx);
        }
        if idx < self.colors.len() {
            self.colors.remove(idx);
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChartChange {
    Created(String),
    Updated(String),
    Removed(String),
}

type ChartHandler = Box<dyn FnMut(&ChartChange)>;

#[derive(Default)]
pub struct ChartMetadataStore {
    entries: Vec<ChartEntry>,
    stable_ids: HashMap<String, String>,
    roster: Rc<RefCell<Vec<String>>>,
    next_user_group_id: u64,
    next_analog_id: u64,
    next_digital_id: u64,
    next_computed_id: u64,
    next_merged_id: u64,
    subscribers: Vec<(u64, ChartHandler)>,
    next_subscriber: u64,
}

impl fmt::Debug for ChartMetadataStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChartMetadataStore")
            .field("entries", &self.entries)
            .field("next_user_group_id", &self.next_user_group_id)
            .finish()
    }
}

impl ChartMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn notify(&mut self, change: ChartChange) {
        for (_, handler) in self.subscribers.iter_mut() {
            handler(&change);
        }
    }

    fn sync_roster(&self) {
        *self.roster.borrow_mut() = self.entries.iter().map(|e| e.user_group_id.clone()).collect();
    }

    pub fn subscribe<F>(&mut self, handler: F) -> u64
    where
        F: FnMut(&ChartChange) + 'static,
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

    /// Getter over the current user group ids, for plugins that must reach
    /// every chart.
    pub fn roster(&self) -> Rc<dyn Fn() -> Vec<String>> {
        let roster = Rc::clone(&self.roster);
        Rc::new(move || roster.borrow().clone())
    }

    /// The user group id a chart for `source_group_id` gets. Stable across
    /// rebuilds of the same group.
    pub fn user_group_id_for(&mut self, source_group_id: &str) -> String {
        if let Some(id) = self.stable_ids.get(source_group_id) {
            return id.clone();
        }
        self.next_user_group_id += 1;
        let id = format!("ug-{}", self.next_user_group_id);
        self.stable_ids.insert(source_group_id.to_string(), id.clone());
        id
    }

    fn next_type_id(&mut self, chart_type: ChartType) -> String {
        let counter = match chart_type {
            ChartType::Analog => &mut self.next_analog_id,
            ChartType::Digital => &mut self.next_digital_id,
            ChartType::Computed => &mut self.next_computed_id,
            ChartType::Merged => &mut self.next_merged_id,
        };
        *counter += 1;
        format!("{}-{}", chart_type.as_str(), counter)
    }

    /// Register a chart. Fails if its user group id is already live.
    pub fn add_chart(&mut self, spec: ChartSpec) -> Result<String> {
        let user_group_id = self.user_group_id_for(&spec.source_group_id);
        if self.get(&user_group_id).is_some() {
            return Err(ViewerError::DuplicateChart(user_group_id));
        }
        let type_id = self.next_type_id(spec.chart_type);
        self.entries.push(ChartEntry {
            user_group_id: user_group_id.clone(),
            type_id,
            source_group_id: spec.source_group_id,
            chart_type: spec.chart_type,
            name: spec.name,
            plot: spec.plot,
            container: spec.container,
            channels: spec.channels,
            colors: spec.colors,
            indices: spec.indices,
            digital_plugin: spec.digital_plugin,
            axis_structure: spec.axis_structure,
        });
        self.sync_roster();
        self.notify(ChartChange::Created(user_group_id.clone()));
        Ok(user_group_id)
    }

    /// Destroy the chart's plot, then drop the entry.
    pub fn remove_chart(&mut self, user_group_id: &str) -> Option<ChartEntry> {
        let pos = self.entries.iter().position(|e| e.user_group_id == user_group_id)?;
        self.entries[pos].plot.borrow_mut().destroy();
        let entry = self.entries.remove(pos);
        self.sync_roster();
        self.notify(ChartChange::Removed(entry.user_group_id.clone()));
        Some(entry)
    }

    /// Signal that an entry changed in place.
    pub fn mark_updated(&mut self, user_group_id: &str) {
        if self.get(user_group_id).is_some() {
            self.notify(ChartChange::Updated(user_group_id.to_string()));
        }
    }

    pub fn get(&self, user_group_id: &str) -> Option<&ChartEntry> {
        self.entries.iter().find(|e| e.user_group_id == user_group_id)
    }

    pub fn get_mut(&mut self, user_group_id: &str) -> Option<&mut ChartEntry> {
        self.entries.iter_mut().find(|e| e.user_group_id == user_group_id)
    }

    pub fn list(&self) -> &[ChartEntry] {
        &self.entries
    }

    pub fn user_group_ids(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.user_group_id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn find_by_source_group(&self, key: &str) -> Option<&ChartEntry> {
        self.entries.iter().find(|e| e.source_group_id == key)
    }

    /// Chart and series index showing a channel.
    pub fn find_by_channel(&self, channel_id: &str) -> Option<(&ChartEntry, usize)> {
        self.entries
            .iter()
            .find_map(|e| e.series_index_of(channel_id).map(|i| (e, i)))
    }

    /// Every live entry points at a live plot and ids are unique.
    pub fn check_invariants(&self) -> Result<()> {
        for (i, e) in self.entries.iter().enumerate() {
            if e.plot.borrow().is_destroyed() {
                return Err(ViewerError::Render {
                    group: e.source_group_id.clone(),
                    reason: format!("{} references a destroyed plot", e.user_group_id),
                });
            }
            if self.entries[..i].iter().any(|o| o.user_group_id == e.user_group_id) {
                return Err(ViewerError::DuplicateChart(e.user_group_id.clone()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostContainer;
    use crate::plot::{CanvasPlot, HeadlessBackend, PlotBackend, PlotData, PlotOptions, PlotSize, SeriesDef};
    use std::collections::BTreeMap;

    fn spec(group: &str, host: &mut HostContainer) -> ChartSpec {
        let size = PlotSize {
            width: 100.0,
            height: 50.0,
        };
        let container = host.create(size);
        let plot: Box<dyn CanvasPlot> = HeadlessBackend::default()
            .create(
                PlotOptions {
                    title: group.into(),
                    size,
                    series: vec![SeriesDef::time()],
                    axes: Vec::new(),
                    scales: BTreeMap::new(),
                    plugins: Vec::new(),
                },
                PlotData {
                    columns: vec![vec![0.0, 1.0]],
                },
                host.get(container).unwrap(),
            )
            .unwrap();
        ChartSpec {
            source_group_id: group.into(),
            chart_type: ChartType::Analog,
            name: group.into(),
            plot: Rc::new(RefCell::new(plot)),
            container,
            channels: vec!["Time".into()],
            colors: vec![String::new()],
            indices: vec![SeriesOrigin::Time],
            digital_plugin: None,
            axis_structure: AxisStructure {
                axis_count: 1,
                families: vec![None],
                digital: false,
            },
        }
    }

    #[test]
    fn ids_are_stable_per_group_and_unique() {
        let mut host = HostContainer::new();
        let mut store = ChartMetadataStore::new();
        let a = store.add_chart(spec("G0", &mut host)).unwrap();
        let b = store.add_chart(spec("G1", &mut host)).unwrap();
        assert_ne!(a, b);
        assert!(matches!(
            store.add_chart(spec("G0", &mut host)),
            Err(ViewerError::DuplicateChart(_))
        ));
        let removed = store.remove_chart(&a).unwrap();
        assert!(removed.plot.borrow().is_destroyed());
        let again = store.add_chart(spec("G0", &mut host)).unwrap();
        assert_eq!(again, a);
        assert_eq!(store.get(&again).unwrap().type_id, "analog-3");
        assert!(store.check_invariants().is_ok());
    }

    #[test]
    fn subscribers_and_roster_follow_changes() {
        let mut host = HostContainer::new();
        let mut store = ChartMetadataStore::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = Rc::clone(&seen);
        store.subscribe(move |c| s.borrow_mut().push(c.clone()));
        let roster = store.roster();
        let id = store.add_chart(spec("G0", &mut host)).unwrap();
        assert_eq!(roster(), vec![id.clone()]);
        store.mark_updated(&id);
        store.remove_chart(&id);
        assert!(roster().is_empty());
        assert_eq!(
            seen.borrow().as_slice(),
            &[
                ChartChange::Created(id.clone()),
                ChartChange::Updated(id.clone()),
                ChartChange::Removed(id)
            ]
        );
    }
}
