//! Routes channel edits either to an in-place plot mutation or to a rebuild
//! of the affected charts.
//!
//! Every request is classified by [`UpdateKind`]. Styling edits (color,
//! name) never touch the axes and are applied straight to the plot. Edits
//! that change sample values or axis layout rebuild. Group moves and deletes
//! are simulated first: if the axis structure of every affected chart stays
//! the same the series is moved or dropped in place, otherwise the groups
//! are rebuilt.

use std::fmt;

use serde_json::Value;

use crate::axes::AxisStructure;
use crate::charts::SeriesOrigin;
use crate::computed::{ComputedPatch, StoredComputedChannel};
use crate::error::{Result, ViewerError};
use crate::events::{ChannelMeta, EventKind, ViewerEvent};
use crate::groups::{plan_groups, Group};
use crate::plot::{PlotBackend, SeriesPatch};
use crate::recording::{coerce_made_from, fit_computed_row};
use crate::renderer::{
    collect_series, effective_max_axes, group_structure, line_scales, max_axes_over, plan_for, series_def,
    PlannedSeries,
};
use crate::session::Session;
use crate::state::channels::{ChannelField, ChannelKind, ChannelLocation, ChannelModel, ChannelSnapshot, ChannelTarget};
use crate::state::reactive::StateChange;
use crate::theme::{parse_hex, trace_color};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateKind {
    Color,
    Scale,
    Start,
    Duration,
    TimeWindow,
    Invert,
    Name,
    Group,
    Unit,
    Add,
    Delete,
    ComputedColor,
}

impl UpdateKind {
    pub const ALL: [UpdateKind; 12] = [
        UpdateKind::Color,
        UpdateKind::Scale,
        UpdateKind::Start,
        UpdateKind::Duration,
        UpdateKind::TimeWindow,
        UpdateKind::Invert,
        UpdateKind::Name,
        UpdateKind::Group,
        UpdateKind::Unit,
        UpdateKind::Add,
        UpdateKind::Delete,
        UpdateKind::ComputedColor,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            UpdateKind::Color => "color",
            UpdateKind::Scale => "scale",
            UpdateKind::Start => "start",
            UpdateKind::Duration => "duration",
            UpdateKind::TimeWindow => "time_window",
            UpdateKind::Invert => "invert",
            UpdateKind::Name => "name",
            UpdateKind::Group => "group",
            UpdateKind::Unit => "unit",
            UpdateKind::Add => "add",
            UpdateKind::Delete => "delete",
            UpdateKind::ComputedColor => "computed_color",
        }
    }

    /// Parse a callback type name.
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == name)
    }

    /// The single state field this kind writes, if any.
    pub fn field(self) -> Option<ChannelField> {
        match self {
            UpdateKind::Color | UpdateKind::ComputedColor => Some(ChannelField::LineColors),
            UpdateKind::Scale => Some(ChannelField::Scales),
            UpdateKind::Start => Some(ChannelField::Starts),
            UpdateKind::Duration => Some(ChannelField::Durations),
            UpdateKind::Invert => Some(ChannelField::Inverts),
            UpdateKind::Name => Some(ChannelField::YLabels),
            UpdateKind::Group => Some(ChannelField::Groups),
            UpdateKind::Unit => Some(ChannelField::YUnits),
            UpdateKind::TimeWindow | UpdateKind::Add | UpdateKind::Delete => None,
        }
    }

    /// Kinds that are always applied in place.
    pub fn is_cheap(self) -> bool {
        matches!(self, UpdateKind::Color | UpdateKind::ComputedColor | UpdateKind::Name)
    }
}

impl fmt::Display for UpdateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A normalized mutation request.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateRequest {
    pub kind: UpdateKind,
    /// Addressed channel; `None` only for `add`.
    pub target: Option<ChannelTarget>,
    pub value: Value,
    /// Sub-field hint, e.g. `start` or `duration` for a scalar `time_window`.
    pub field: Option<String>,
    pub is_computed: bool,
}

impl UpdateRequest {
    pub fn new(kind: UpdateKind, target: impl Into<ChannelTarget>, value: Value) -> Self {
        let target = target.into();
        let is_computed = matches!(target, ChannelTarget::Index(ChannelKind::Computed, _));
        Self {
            kind,
            target: Some(target),
            value,
            field: None,
            is_computed,
        }
    }

    /// Add a computed channel from its stored definition.
    pub fn add(definition: Value) -> Self {
        Self {
            kind: UpdateKind::Add,
            target: None,
            value: definition,
            field: None,
            is_computed: true,
        }
    }

    fn target(&self) -> Result<&ChannelTarget> {
        self.target
            .as_ref()
            .ok_or_else(|| ViewerError::Protocol(format!("{} update without a channel", self.kind)))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchOutcome {
    pub handled: bool,
    /// True when charts were torn down and rebuilt.
    pub rebuilt: bool,
    /// Group keys passed to the rebuild.
    pub rebuilt_groups: Vec<String>,
}

impl DispatchOutcome {
    fn in_place() -> Self {
        Self {
            handled: true,
            ..Default::default()
        }
    }

    fn rebuilt(groups: Vec<String>) -> Self {
        Self {
            handled: true,
            rebuilt: true,
            rebuilt_groups: groups,
        }
    }
}

fn time_window_parts(req: &UpdateRequest) -> Result<(Option<Value>, Option<Value>)> {
    let parts = match &req.value {
        Value::Object(map) => (map.get("start").cloned(), map.get("duration").cloned()),
        Value::Array(items) => (items.first().cloned(), items.get(1).cloned()),
        scalar => match req.field.as_deref() {
            Some("start" | "starts") => (Some(scalar.clone()), None),
            Some("duration" | "durations") => (None, Some(scalar.clone())),
            _ => (None, None),
        },
    };
    if parts.0.is_none() && parts.1.is_none() {
        return Err(ViewerError::InvalidValue {
            field: "time_window".into(),
            reason: "expected start and/or duration".into(),
        });
    }
    Ok(parts)
}

impl<B: PlotBackend> Session<B> {
    /// Apply one mutation. Progress is reported at 0, 25, 50, 75 and 100 %.
    pub fn dispatch(&mut self, req: UpdateRequest) -> DispatchOutcome {
        let kind = req.kind;
        self.report(0, &format!("{kind} update"));
        let result = match kind {
            UpdateKind::Color | UpdateKind::ComputedColor => self.restyle(&req, ChannelField::LineColors),
            UpdateKind::Name => self.restyle(&req, ChannelField::YLabels),
            UpdateKind::Scale => self.rewrite_group(&req, ChannelField::Scales),
            UpdateKind::Start => self.rewrite_group(&req, ChannelField::Starts),
            UpdateKind::Duration => self.rewrite_group(&req, ChannelField::Durations),
            UpdateKind::Invert => self.rewrite_group(&req, ChannelField::Inverts),
            UpdateKind::TimeWindow => self.set_time_window(&req),
            UpdateKind::Unit => self.set_unit(&req),
            UpdateKind::Group => self.move_to_group(&req),
            UpdateKind::Delete => self.delete(&req),
            UpdateKind::Add => self.add_computed(&req),
        };
        let outcome = result.unwrap_or_else(|e| {
            tracing::debug!("{kind} update rejected: {e}");
            DispatchOutcome::default()
        });
        self.report(100, &format!("{kind} update done"));
        outcome
    }

    fn emit_channel(&self, kind: EventKind, channel_id: &str, channel_kind: ChannelKind, field: Option<ChannelField>) {
        let mut ev = ViewerEvent::new(kind);
        ev.channel = Some(ChannelMeta {
            channel_id: channel_id.to_string(),
            kind: channel_kind,
            field: field.map(|f| f.key().to_string()),
        });
        self.events.emit(ev);
    }

    fn channel_id_at(&self, loc: ChannelLocation) -> String {
        self.channels.channel_id(loc.kind, loc.index).unwrap_or_default()
    }

    /// Copy a written field into the computed channel's configuration and
    /// its persisted definition.
    fn sync_computed_meta(&mut self, loc: ChannelLocation, field: ChannelField) {
        if loc.kind != ChannelKind::Computed {
            return;
        }
        let Some(text) = self
            .channels
            .value(loc.kind, field, loc.index)
            .and_then(Value::as_str)
            .map(str::to_string)
        else {
            return;
        };
        let Some(meta) = self.recording.config.computed_channels.get_mut(loc.index) else {
            return;
        };
        let mut patch = ComputedPatch::default();
        match field {
            ChannelField::YLabels => {
                meta.name = text.clone();
                patch.name = Some(text);
            }
            ChannelField::LineColors => {
                meta.color = text.clone();
                patch.color = Some(text);
            }
            ChannelField::YUnits => {
                meta.unit = text.clone();
                patch.unit = Some(text);
            }
            ChannelField::Groups => {
                meta.group = text.clone();
                patch.group = Some(text);
            }
            _ => return,
        }
        let id = meta.id.clone();
        self.store.persist_best_effort(|s| s.update(&id, patch).map(|_| ()));
    }

    // ─────────────────────────────────────────────────────────────────────
    // Cheap path
    // ─────────────────────────────────────────────────────────────────────

    fn restyle(&mut self, req: &UpdateRequest, field: ChannelField) -> Result<DispatchOutcome> {
        let target = req.target()?;
        let loc = self.channels.resolve(target)?;
        self.report(25, "channel located");
        self.channels.try_update_field(target, field, &req.value)?;
        self.sync_computed_meta(loc, field);
        self.report(50, "state written");
        let id = self.channel_id_at(loc);
        let text = self
            .channels
            .value(loc.kind, field, loc.index)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if !self.restyle_series(&id, field, &text) {
            tracing::debug!("{id} has no chart yet; {field} kept in state only");
        }
        self.report(75, "plot updated");
        self.emit_channel(EventKind::CHANNEL_UPDATED, &id, loc.kind, Some(field));
        Ok(DispatchOutcome::in_place())
    }

    /// Push a color or label into the chart showing `id`. False when the
    /// channel is not charted.
    fn restyle_series(&mut self, id: &str, field: ChannelField, text: &str) -> bool {
        let Some((ug, idx)) = self
            .charts
            .find_by_channel(id)
            .map(|(e, i)| (e.user_group_id.clone(), i))
        else {
            return false;
        };
        let Some(entry) = self.charts.get_mut(&ug) else {
            return false;
        };
        let digital = entry.indices.get(idx).is_some_and(SeriesOrigin::is_digital);
        match field {
            ChannelField::LineColors => {
                let color = parse_hex(text).unwrap_or_else(|| trace_color(idx.saturating_sub(1)));
                if digital {
                    if let Some(plugin) = &entry.digital_plugin {
                        plugin.borrow_mut().set_signal_color(idx, color);
                    }
                } else {
                    entry.plot.borrow_mut().set_series(idx, &SeriesPatch::stroke(color));
                }
                if let Some(slot) = entry.colors.get_mut(idx) {
                    *slot = text.to_string();
                }
            }
            ChannelField::YLabels => {
                entry.plot.borrow_mut().set_series(idx, &SeriesPatch::label(text));
                if digital {
                    if let Some(plugin) = &entry.digital_plugin {
                        plugin.borrow_mut().set_signal_label(idx, text);
                    }
                }
                if let Some(slot) = entry.channels.get_mut(idx) {
                    *slot = text.to_string();
                }
            }
            _ => return false,
        }
        self.queue_redraw(&ug);
        self.charts.mark_updated(&ug);
        true
    }

    /// Remove a series from a chart without rebuilding it.
    fn detach_series(&mut self, user_group_id: &str, id: &str) -> bool {
        let Some(entry) = self.charts.get_mut(user_group_id) else {
            return false;
        };
        let Some(idx) = entry.series_index_of(id) else {
            return false;
        };
        entry.plot.borrow_mut().del_series(idx);
        entry.forget_series(idx);
        if let Some(plugin) = &entry.digital_plugin {
            plugin.borrow_mut().on_series_removed(idx);
        }
        self.queue_redraw(user_group_id);
        self.charts.mark_updated(user_group_id);
        true
    }

    /// Insert the series of `id` into the chart of its (new) group.
    fn attach_series(&mut self, user_group_id: &str, id: &str, group: &Group, snapshot: &ChannelSnapshot) -> bool {
        let series = collect_series(group, snapshot, &self.recording);
        let Some(pos) = series.iter().position(|s| s.origin.channel_id() == Some(id)) else {
            return false;
        };
        let plan = plan_for(&series, &self.config, self.max_y_axes);
        let line_idx = series[..pos].iter().filter(|s| !s.is_digital()).count();
        let planned = &series[pos];
        let def = series_def(planned, pos, plan.key_of(line_idx));
        let Some(entry) = self.charts.get_mut(user_group_id) else {
            return false;
        };
        let at = (pos + 1).min(entry.indices.len());
        entry.plot.borrow_mut().add_series(at, def, planned.values.clone());
        entry.indices.insert(at, planned.origin.clone());
        entry.channels.insert(at.min(entry.channels.len()), planned.label.clone());
        entry.colors.insert(at.min(entry.colors.len()), planned.color.clone());
        if let Some(plugin) = &entry.digital_plugin {
            plugin.borrow_mut().on_series_inserted(at);
        }
        self.queue_redraw(user_group_id);
        self.charts.mark_updated(user_group_id);
        true
    }

    /// Recompute the y ranges of a chart from its group's current series.
    fn refresh_scales(&mut self, user_group_id: &str, group: &Group, snapshot: &ChannelSnapshot) {
        let series = collect_series(group, snapshot, &self.recording);
        let plan = plan_for(&series, &self.config, self.max_y_axes);
        let Some(entry) = self.charts.get(user_group_id) else {
            return;
        };
        let mut plot = entry.plot.borrow_mut();
        for (key, range) in line_scales(&plan, &series) {
            plot.set_scale(&key, range);
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Rebuild path
    // ─────────────────────────────────────────────────────────────────────

    /// Write one field and rebuild the channel's group.
    fn rewrite_group(&mut self, req: &UpdateRequest, field: ChannelField) -> Result<DispatchOutcome> {
        let target = req.target()?;
        let loc = self.channels.resolve(target)?;
        self.report(25, "channel located");
        self.channels.try_update_field(target, field, &req.value)?;
        self.report(50, "state written");
        let key = self.channels.group(loc.kind, loc.index).unwrap_or_default();
        self.rebuild_groups(std::slice::from_ref(&key));
        self.report(75, "charts rebuilt");
        self.emit_channel(EventKind::CHANNEL_UPDATED, &self.channel_id_at(loc), loc.kind, Some(field));
        Ok(DispatchOutcome::rebuilt(vec![key]))
    }

    /// `start` and `duration` in one history entry, then rebuild the group.
    fn set_time_window(&mut self, req: &UpdateRequest) -> Result<DispatchOutcome> {
        let target = req.target()?;
        let loc = self.channels.resolve(target)?;
        let (start, duration) = time_window_parts(req)?;
        self.report(25, "channel located");

        self.channels.state_mut().suspend_history();
        let mut written = Ok(());
        for (field, value) in [(ChannelField::Starts, start), (ChannelField::Durations, duration)] {
            let Some(value) = value else { continue };
            if let Err(e) = self.channels.try_update_field(target, field, &value) {
                written = Err(e);
                break;
            }
        }
        self.channels.state_mut().resume_history();
        written?;
        self.report(50, "state written");

        let key = self.channels.group(loc.kind, loc.index).unwrap_or_default();
        self.rebuild_groups(std::slice::from_ref(&key));
        self.report(75, "charts rebuilt");
        self.emit_channel(EventKind::CHANNEL_UPDATED, &self.channel_id_at(loc), loc.kind, None);
        Ok(DispatchOutcome::rebuilt(vec![key]))
    }

    /// Units drive the axis plan of every chart, so everything is rebuilt.
    fn set_unit(&mut self, req: &UpdateRequest) -> Result<DispatchOutcome> {
        let target = req.target()?;
        let loc = self.channels.resolve(target)?;
        self.report(25, "channel located");
        self.channels.try_update_field(target, ChannelField::YUnits, &req.value)?;
        self.sync_computed_meta(loc, ChannelField::YUnits);
        self.report(50, "state written");
        self.rebuild_all();
        self.report(75, "charts rebuilt");
        self.emit_channel(
            EventKind::CHANNEL_UPDATED,
            &self.channel_id_at(loc),
            loc.kind,
            Some(ChannelField::YUnits),
        );
        let groups = self.charts.list().iter().map(|e| e.source_group_id.clone()).collect();
        Ok(DispatchOutcome::rebuilt(groups))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Simulated edits
    // ─────────────────────────────────────────────────────────────────────

    fn move_to_group(&mut self, req: &UpdateRequest) -> Result<DispatchOutcome> {
        let target = req.target()?;
        let loc = self.channels.resolve(target)?;
        let new_value = ChannelField::Groups.coerce(&req.value)?;
        let new_key = new_value.as_str().unwrap_or_default().to_string();
        if new_key.is_empty() {
            return Err(ViewerError::InvalidValue {
                field: ChannelField::Groups.key().into(),
                reason: "empty group key".into(),
            });
        }
        let id = self.channel_id_at(loc);
        let mut after = self.channels.snapshot();
        let old_key = after
            .table(loc.kind)
            .groups
            .get(loc.index)
            .cloned()
            .unwrap_or_default();
        self.report(25, "channel located");
        if old_key == new_key {
            return Ok(DispatchOutcome::in_place());
        }
        if let Some(slot) = after.table_mut(loc.kind).groups.get_mut(loc.index) {
            slot.clone_from(&new_key);
        }
        let cheap = self.can_move_in_place(&id, &old_key, &new_key, &after);

        self.channels.try_update_field(target, ChannelField::Groups, &new_value)?;
        self.sync_computed_meta(loc, ChannelField::Groups);
        self.report(50, "state written");

        let outcome = if cheap {
            self.move_series(&id, &old_key, &new_key);
            DispatchOutcome::in_place()
        } else {
            let keys = vec![old_key, new_key];
            self.rebuild_groups(&keys);
            DispatchOutcome::rebuilt(keys)
        };
        self.report(75, "charts updated");
        self.emit_channel(EventKind::CHANNEL_UPDATED, &id, loc.kind, Some(ChannelField::Groups));
        Ok(outcome)
    }

    /// A move is in place only when both charts exist, the old one keeps at
    /// least one series and neither changes its axis structure.
    fn can_move_in_place(&self, id: &str, old_key: &str, new_key: &str, after: &ChannelSnapshot) -> bool {
        let rec = &self.recording;
        let groups = plan_groups(after, rec);
        let max_after = effective_max_axes(&self.config, &groups, after, rec);
        if max_after != self.max_y_axes {
            return false;
        }
        let Some((old_entry, idx)) = self.charts.find_by_channel(id) else {
            return false;
        };
        if old_entry.source_group_id != old_key || old_entry.indices.get(idx).map_or(true, SeriesOrigin::is_digital) {
            return false;
        }
        let Some(new_entry) = self.charts.find_by_source_group(new_key) else {
            return false;
        };
        let (Some(old_group), Some(new_group)) = (
            groups.iter().find(|g| g.key == old_key),
            groups.iter().find(|g| g.key == new_key),
        ) else {
            return false;
        };
        group_structure(old_group, after, rec, &self.config, max_after) == old_entry.axis_structure
            && group_structure(new_group, after, rec, &self.config, max_after) == new_entry.axis_structure
    }

    fn move_series(&mut self, id: &str, old_key: &str, new_key: &str) {
        let snapshot = self.channels.snapshot();
        let groups = plan_groups(&snapshot, &self.recording);
        let old_ug = self.charts.find_by_source_group(old_key).map(|e| e.user_group_id.clone());
        let new_ug = self.charts.find_by_source_group(new_key).map(|e| e.user_group_id.clone());
        if let Some(ug) = old_ug {
            self.detach_series(&ug, id);
            if let Some(g) = groups.iter().find(|g| g.key == old_key) {
                self.refresh_scales(&ug, g, &snapshot);
            }
        }
        let (Some(ug), Some(group)) = (new_ug, groups.iter().find(|g| g.key == new_key)) else {
            return;
        };
        if self.attach_series(&ug, id, group, &snapshot) {
            self.refresh_scales(&ug, group, &snapshot);
        }
    }

    /// A delete is in place when the chart keeps at least one series and
    /// its axis structure, the shared axis count and the time window stay.
    fn can_remove_in_place(&self, id: &str, loc: ChannelLocation, key: &str, snapshot: &ChannelSnapshot) -> bool {
        let Some(entry) = self.charts.find_by_source_group(key) else {
            return false;
        };
        if entry.series_index_of(id).is_none() {
            return false;
        }
        if snapshot.table(loc.kind).durations.get(loc.index).copied().unwrap_or(0.0) > 0.0 {
            return false;
        }
        let groups = plan_groups(snapshot, &self.recording);
        let per_group: Vec<Vec<PlannedSeries>> = groups
            .iter()
            .map(|g| {
                let mut series = collect_series(g, snapshot, &self.recording);
                if g.key == key {
                    series.retain(|s| s.origin.channel_id() != Some(id));
                }
                series
            })
            .collect();
        let Some(remaining) = groups.iter().position(|g| g.key == key).map(|i| &per_group[i]) else {
            return false;
        };
        if remaining.is_empty() {
            return false;
        }
        let max_after = max_axes_over(&self.config, per_group.iter().cloned());
        if max_after != self.max_y_axes {
            return false;
        }
        let plan = plan_for(remaining, &self.config, max_after);
        AxisStructure::of(&plan, remaining.iter().any(PlannedSeries::is_digital)) == entry.axis_structure
    }

    /// Series origins of the same kind above a removed index move down by one.
    fn shift_origins(&mut self, removed: ChannelLocation) {
        for ug in self.charts.user_group_ids() {
            let Some(entry) = self.charts.get_mut(&ug) else {
                continue;
            };
            for origin in entry.indices.iter_mut() {
                let (kind, index) = match origin {
                    SeriesOrigin::Time => continue,
                    SeriesOrigin::Analog { index, .. } => (ChannelKind::Analog, index),
                    SeriesOrigin::Digital { index, .. } => (ChannelKind::Digital, index),
                    SeriesOrigin::Computed { index, .. } => (ChannelKind::Computed, index),
                };
                if kind == removed.kind && *index > removed.index {
                    *index -= 1;
                }
            }
        }
    }

    /// Delete a channel everywhere. Clears undo history.
    fn delete(&mut self, req: &UpdateRequest) -> Result<DispatchOutcome> {
        let target = req.target()?;
        let loc = self.channels.resolve(target)?;
        let id = self.channel_id_at(loc);
        let snapshot = self.channels.snapshot();
        let key = snapshot.table(loc.kind).groups.get(loc.index).cloned().unwrap_or_default();
        self.report(25, "channel located");
        let cheap = self.can_remove_in_place(&id, loc, &key, &snapshot);

        let mut evicted = None;
        self.channels
            .remove_channel(&id, &mut self.recording, |persisted| evicted = Some(persisted.to_string()))?;
        if let Some(persisted) = &evicted {
            self.store.persist_best_effort(|s| s.delete(persisted).map(|_| ()));
        }
        self.shift_origins(loc);
        self.report(50, "channel removed");

        let ug = self.charts.find_by_source_group(&key).map(|e| e.user_group_id.clone());
        let outcome = match ug {
            Some(ug) if cheap => {
                self.detach_series(&ug, &id);
                let snapshot = self.channels.snapshot();
                if let Some(g) = plan_groups(&snapshot, &self.recording).iter().find(|g| g.key == key) {
                    self.refresh_scales(&ug, g, &snapshot);
                }
                DispatchOutcome::in_place()
            }
            _ => {
                self.rebuild_groups(std::slice::from_ref(&key));
                DispatchOutcome::rebuilt(vec![key])
            }
        };
        self.report(75, "charts updated");
        self.emit_channel(EventKind::CHANNEL_DELETED, &id, loc.kind, None);
        if evicted.is_some() {
            self.broadcast_computed();
        }
        Ok(outcome)
    }

    /// Append a computed channel and rebuild its group. Definitions that
    /// repeat an existing id or equation are declined.
    fn add_computed(&mut self, req: &UpdateRequest) -> Result<DispatchOutcome> {
        let stored: StoredComputedChannel = serde_json::from_value(req.value.clone())?;
        self.report(25, "definition parsed");
        if self
            .recording
            .config
            .computed_channels
            .iter()
            .any(|meta| stored.same_channel(meta))
        {
            tracing::debug!("computed channel {} already present", stored.id);
            return Ok(DispatchOutcome::default());
        }
        let values = fit_computed_row(
            stored.data.clone().unwrap_or_default(),
            self.recording.data.time.len(),
            &stored.id,
        );
        let mut meta = stored.to_meta();
        meta.sample_count = values.len();
        coerce_made_from(&mut meta.made_from, &values, self.config.made_from_probe_samples);

        let row = ChannelModel::computed_row(&meta, self.recording.config.computed_channels.len());
        let channel_id = self.channels.append_channel(ChannelKind::Computed, &row)?;
        let persisted = StoredComputedChannel::from_meta(&meta, Some(&values));
        self.recording.config.computed_channels.push(meta);
        self.recording.data.computed_data.push(values);
        self.store.persist_best_effort(|s| s.upsert(persisted));
        self.report(50, "channel added");

        let key = row.group;
        self.rebuild_groups(std::slice::from_ref(&key));
        self.report(75, "charts rebuilt");
        self.emit_channel(EventKind::COMPUTED_ADDED, &channel_id, ChannelKind::Computed, None);
        self.broadcast_computed();
        Ok(DispatchOutcome::rebuilt(vec![key]))
    }

    // ─────────────────────────────────────────────────────────────────────
    // History replay
    // ─────────────────────────────────────────────────────────────────────

    /// Bring plots in line with changes replayed by undo or redo. Pure
    /// styling changes are applied in place; anything else rebuilds.
    pub(crate) fn apply_replayed(&mut self, changes: &[StateChange]) {
        let touched: Vec<(ChannelKind, ChannelField, Option<usize>)> = changes
            .iter()
            .filter_map(|change| {
                let segments = change.path.segments();
                let kind = ChannelKind::parse(segments.first()?).ok()?;
                let field = ChannelField::from_key(segments.get(1)?)?;
                Some((kind, field, segments.get(2).and_then(|i| i.parse().ok())))
            })
            .collect();
        for &(kind, field, index) in &touched {
            if let Some(index) = index {
                self.sync_computed_meta(ChannelLocation { kind, index }, field);
            }
        }
        let styling = !touched.is_empty()
            && touched.iter().all(|(_, field, index)| {
                index.is_some() && matches!(field, ChannelField::LineColors | ChannelField::YLabels)
            });
        if !styling {
            self.rebuild_all();
            return;
        }
        for (kind, field, index) in touched {
            let Some(index) = index else { continue };
            let id = self.channels.channel_id(kind, index).unwrap_or_default();
            let text = self
                .channels
                .value(kind, field, index)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            self.restyle_series(&id, field, &text);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn kinds_round_trip_their_names() {
        for kind in UpdateKind::ALL {
            assert_eq!(UpdateKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(UpdateKind::parse("colour"), None);
        assert!(UpdateKind::Color.is_cheap());
        assert!(!UpdateKind::Scale.is_cheap());
        assert_eq!(UpdateKind::TimeWindow.field(), None);
    }

    #[test]
    fn time_window_accepts_object_array_and_scalar() {
        let mut req = UpdateRequest::new(UpdateKind::TimeWindow, "a", json!({"start": 0.1, "duration": 0.2}));
        assert_eq!(time_window_parts(&req).unwrap(), (Some(json!(0.1)), Some(json!(0.2))));
        req.value = json!([0.3, 0.4]);
        assert_eq!(time_window_parts(&req).unwrap(), (Some(json!(0.3)), Some(json!(0.4))));
        req.value = json!(0.5);
        req.field = Some("duration".into());
        assert_eq!(time_window_parts(&req).unwrap(), (None, Some(json!(0.5))));
        req.field = None;
        assert!(time_window_parts(&req).is_err());
    }
}
