//! Builds one merged chart per channel group.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use egui::Color32;

use crate::axes::{axis_key, distinct_families, plan_axes, scale_defs, AxisPlan, AxisStructure};
use crate::charts::{ChartMetadataStore, ChartSpec, ChartType, SeriesOrigin};
use crate::config::ViewerConfig;
use crate::cursors::SharedCursors;
use crate::error::{Result, ViewerError};
use crate::groups::Group;
use crate::host::{HostContainer, ATTR_CHART_TYPE, ATTR_USER_GROUP_ID};
use crate::plot::{
    AxisDef, AxisSide, CanvasPlot, DigitalFillPlugin, DigitalSignal, PlotBackend, PlotData, PlotOptions, PlotSize,
    ScaleRange, SeriesDef, SharedPlot, SharedPlugin, VerticalLinePlugin, DIGITAL_SCALE, X_SCALE,
};
use crate::recording::{MadeFrom, Recording};
use crate::resources::{ListenerKind, ListenerRegistry, ResizeDebouncer};
use crate::state::channels::{ChannelKind, ChannelSnapshot, ChannelTable};
use crate::theme::{parse_hex, trace_color};

/// One series of a group, ready to plot.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedSeries {
    pub origin: SeriesOrigin,
    pub label: String,
    pub color: String,
    pub unit: String,
    pub values: Vec<f64>,
}

impl PlannedSeries {
    pub fn is_digital(&self) -> bool {
        self.origin.is_digital()
    }
}

/// Displayed value: `sample * scale`, negated when inverted.
pub fn display_values(samples: &[f64], scale: f64, invert: bool) -> Vec<f64> {
    let k = if invert { -scale } else { scale };
    samples.iter().map(|v| v * k).collect()
}

fn table_row(table: &ChannelTable, i: usize) -> (String, String, String, f64, bool) {
    (
        table.labels.get(i).cloned().unwrap_or_default(),
        table.colors.get(i).cloned().unwrap_or_default(),
        table.units.get(i).cloned().unwrap_or_default(),
        table.scales.get(i).copied().unwrap_or(1.0),
        table.inverts.get(i).copied().unwrap_or(false),
    )
}

/// Series of a group in plot order: analog, then digital, then computed.
pub fn collect_series(group: &Group, snapshot: &ChannelSnapshot, recording: &Recording) -> Vec<PlannedSeries> {
    let data = &recording.data;
    let mut out = Vec::with_capacity(group.series_count());
    for &i in &group.analog_indices {
        let (label, color, unit, scale, invert) = table_row(&snapshot.analog, i);
        let samples = data.analog_data.get(i).map(Vec::as_slice).unwrap_or(&[]);
        out.push(PlannedSeries {
            origin: SeriesOrigin::Analog {
                index: i,
                id: snapshot.analog.ids.get(i).cloned().unwrap_or_default(),
            },
            label,
            color,
            unit,
            values: display_values(samples, scale, invert),
        });
    }
    for &i in &group.digital_indices {
        let (label, color, unit, _, _) = table_row(&snapshot.digital, i);
        out.push(PlannedSeries {
            origin: SeriesOrigin::Digital {
                index: i,
                id: snapshot.digital.ids.get(i).cloned().unwrap_or_default(),
            },
            label,
            color,
            unit,
            values: data.digital_data.get(i).cloned().unwrap_or_default(),
        });
    }
    for id in &group.computed_ids {
        let Some(i) = snapshot.computed.index_of(id) else {
            continue;
        };
        let (label, color, unit, scale, invert) = table_row(&snapshot.computed, i);
        let made_from = recording
            .config
            .computed_channels
            .get(i)
            .map_or(MadeFrom::Analog, |m| m.made_from);
        let samples = data.computed_data.get(i).map(Vec::as_slice).unwrap_or(&[]);
        let values = match made_from {
            MadeFrom::Digital => samples.to_vec(),
            MadeFrom::Analog => display_values(samples, scale, invert),
        };
        out.push(PlannedSeries {
            origin: SeriesOrigin::Computed {
                index: i,
                id: id.clone(),
                made_from,
            },
            label,
            color,
            unit,
            values,
        });
    }
    out
}

fn line_units(series: &[PlannedSeries]) -> (Vec<String>, Vec<String>) {
    series
        .iter()
        .filter(|s| !s.is_digital())
        .map(|s| (s.label.clone(), s.unit.clone()))
        .unzip()
}

/// `max_y_axes` in effect: the configured value, or the largest number of
/// unit families any group needs.
pub fn effective_max_axes(
    config: &ViewerConfig,
    groups: &[Group],
    snapshot: &ChannelSnapshot,
    recording: &Recording,
) -> Option<usize> {
    if config.max_y_axes.is_some() {
        return config.max_y_axes;
    }
    max_axes_over(config, groups.iter().map(|g| collect_series(g, snapshot, recording)))
}

/// [`effective_max_axes`] over already collected series lists.
pub(crate) fn max_axes_over<I>(config: &ViewerConfig, per_group: I) -> Option<usize>
where
    I: IntoIterator<Item = Vec<PlannedSeries>>,
{
    if config.max_y_axes.is_some() {
        return config.max_y_axes;
    }
    let most = per_group
        .into_iter()
        .map(|series| distinct_families(&line_units(&series).1))
        .max()
        .unwrap_or(1);
    Some(most.max(1))
}

pub(crate) fn plan_for(series: &[PlannedSeries], config: &ViewerConfig, max_y_axes: Option<usize>) -> AxisPlan {
    let (labels, units) = line_units(series);
    plan_axes(&labels, &units, config.single_y_axis, max_y_axes)
}

/// Y ranges of the line axes of a plan.
pub(crate) fn line_scales(plan: &AxisPlan, series: &[PlannedSeries]) -> BTreeMap<String, ScaleRange> {
    let line_values: Vec<&[f64]> = series
        .iter()
        .filter(|s| !s.is_digital())
        .map(|s| s.values.as_slice())
        .collect();
    scale_defs(plan, &line_values)
        .into_iter()
        .map(|d| (d.key, ScaleRange::new(d.min, d.max)))
        .collect()
}

/// Plot series definition. Digital series are transparent: the fill plugin draws them.
pub(crate) fn series_def(s: &PlannedSeries, position: usize, line_scale: Option<String>) -> SeriesDef {
    if s.is_digital() {
        return SeriesDef {
            label: s.label.clone(),
            stroke: Color32::TRANSPARENT,
            scale: DIGITAL_SCALE.to_string(),
            width: 0.0,
            points: false,
            show: true,
        };
    }
    SeriesDef {
        label: s.label.clone(),
        stroke: parse_hex(&s.color).unwrap_or_else(|| trace_color(position)),
        scale: line_scale.unwrap_or_else(|| axis_key(0)),
        width: 1.5,
        points: false,
        show: true,
    }
}

/// Axis structure a group would be rendered with.
pub fn group_structure(
    group: &Group,
    snapshot: &ChannelSnapshot,
    recording: &Recording,
    config: &ViewerConfig,
    max_y_axes: Option<usize>,
) -> AxisStructure {
    let series = collect_series(group, snapshot, recording);
    let plan = plan_for(&series, config, max_y_axes);
    AxisStructure::of(&plan, series.iter().any(PlannedSeries::is_digital))
}

/// X range from the channel time windows of a group, if any channel has one.
pub fn time_window(series: &[PlannedSeries], snapshot: &ChannelSnapshot) -> Option<ScaleRange> {
    let windows: Vec<(f64, f64)> = series
        .iter()
        .filter_map(|s| {
            let (kind, index) = match &s.origin {
                SeriesOrigin::Time => return None,
                SeriesOrigin::Analog { index, .. } => (ChannelKind::Analog, *index),
                SeriesOrigin::Digital { index, .. } => (ChannelKind::Digital, *index),
                SeriesOrigin::Computed { index, .. } => (ChannelKind::Computed, *index),
            };
            let table = snapshot.table(kind);
            let start = table.starts.get(index).copied().unwrap_or(0.0);
            let duration = table.durations.get(index).copied().unwrap_or(0.0);
            (duration > 0.0).then_some((start, start + duration))
        })
        .collect();
    if windows.is_empty() {
        return None;
    }
    let min = windows.iter().map(|w| w.0).fold(f64::INFINITY, f64::min);
    let max = windows.iter().map(|w| w.1).fold(f64::NEG_INFINITY, f64::max);
    Some(ScaleRange::new(min, max))
}

/// Everything a render pass reads and writes.
pub struct RenderPass<'a, B: PlotBackend> {
    pub recording: &'a Recording,
    pub snapshot: &'a ChannelSnapshot,
    pub host: &'a mut HostContainer,
    pub charts: &'a mut ChartMetadataStore,
    pub backend: &'a mut B,
    pub cursors: &'a SharedCursors,
    pub listeners: &'a mut ListenerRegistry,
    pub resize: &'a mut ResizeDebouncer,
    pub max_y_axes: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenderReport {
    /// User group ids of the charts built.
    pub built: Vec<String>,
    /// Group keys with nothing to draw.
    pub skipped: Vec<String>,
    /// Group keys that failed, with the reason.
    pub failed: Vec<(String, String)>,
}

impl RenderReport {
    pub fn merge(&mut self, other: RenderReport) {
        self.built.extend(other.built);
        self.skipped.extend(other.skipped);
        self.failed.extend(other.failed);
    }
}

#[derive(Debug, Clone)]
pub struct GroupChartRenderer {
    config: ViewerConfig,
    cursor_color: Color32,
}

impl GroupChartRenderer {
    pub fn new(config: ViewerConfig, cursor_color: Color32) -> Self {
        Self { config, cursor_color }
    }

    pub fn config(&self) -> &ViewerConfig {
        &self.config
    }

    pub fn set_cursor_color(&mut self, color: Color32) {
        self.cursor_color = color;
    }

    /// Render every group; one group's failure never stops the others.
    pub fn render_groups<B: PlotBackend>(&self, pass: &mut RenderPass<'_, B>, groups: &[Group]) -> RenderReport {
        let mut report = RenderReport::default();
        for group in groups {
            match self.render_group(pass, group) {
                Ok(Some(ug)) => report.built.push(ug),
                Ok(None) => report.skipped.push(group.key.clone()),
                Err(e) => {
                    tracing::error!("rendering group {} failed: {e}", group.key);
                    report.failed.push((group.key.clone(), e.to_string()));
                }
            }
        }
        report
    }

    fn render_group<B: PlotBackend>(&self, pass: &mut RenderPass<'_, B>, group: &Group) -> Result<Option<String>> {
        let series = collect_series(group, pass.snapshot, pass.recording);
        if series.is_empty() {
            return Ok(None);
        }
        let plan = plan_for(&series, &self.config, pass.max_y_axes);
        let has_digital = series.iter().any(PlannedSeries::is_digital);

        let mut scales = line_scales(&plan, &series);
        if let Some(window) = time_window(&series, pass.snapshot) {
            scales.insert(X_SCALE.to_string(), window);
        }

        let mut defs = vec![SeriesDef::time()];
        let mut columns = vec![pass.recording.data.time.clone()];
        let mut signals = Vec::new();
        let mut line_idx = 0;
        for (n, s) in series.iter().enumerate() {
            if s.is_digital() {
                signals.push(DigitalSignal {
                    series_idx: n + 1,
                    label: s.label.clone(),
                    color: parse_hex(&s.color).unwrap_or_else(|| trace_color(n)),
                });
                defs.push(series_def(s, n, None));
            } else {
                defs.push(series_def(s, n, plan.key_of(line_idx)));
                line_idx += 1;
            }
            columns.push(s.values.clone());
        }

        let mut axes: Vec<AxisDef> = (0..plan.axis_count)
            .map(|a| AxisDef {
                scale: axis_key(a),
                label: plan
                    .axis_families
                    .get(a)
                    .copied()
                    .flatten()
                    .map(|f| f.to_string())
                    .unwrap_or_default(),
                side: if a % 2 == 0 { AxisSide::Left } else { AxisSide::Right },
                show: true,
            })
            .collect();

        let mut plugins: Vec<SharedPlugin> = Vec::new();
        let digital_plugin = if signals.is_empty() {
            None
        } else {
            let plugin = DigitalFillPlugin::new(
                signals,
                self.config.digital_signal_offset,
                self.config.digital_fill_height,
            );
            let (lo, hi) = plugin.lane_range();
            scales.insert(DIGITAL_SCALE.to_string(), ScaleRange::new(lo, hi));
            axes.push(AxisDef {
                scale: DIGITAL_SCALE.to_string(),
                label: "digital".into(),
                side: AxisSide::Right,
                show: false,
            });
            let plugin = Rc::new(RefCell::new(plugin));
            let shared: SharedPlugin = plugin.clone();
            plugins.push(shared);
            Some(plugin)
        };
        let cursor_plugin: SharedPlugin = Rc::new(RefCell::new(VerticalLinePlugin::new(
            Rc::clone(pass.cursors),
            pass.charts.roster(),
            self.cursor_color,
        )));
        plugins.push(cursor_plugin);

        let chart_type = ChartType::for_mix(
            !group.analog_indices.is_empty(),
            !group.digital_indices.is_empty(),
            !group.computed_ids.is_empty(),
        );
        let size = PlotSize {
            width: self.config.chart_width,
            height: self.config.chart_height,
        };
        let container = pass.host.create(size);
        let opts = PlotOptions {
            title: group.key.clone(),
            size,
            series: defs,
            axes,
            scales,
            plugins,
        };
        let created = match pass.host.get(container) {
            Some(c) => pass.backend.create(opts, PlotData { columns }, c),
            None => Err(ViewerError::Render {
                group: group.key.clone(),
                reason: "container vanished".into(),
            }),
        };
        let plot: Box<dyn CanvasPlot> = match created {
            Ok(p) => p,
            Err(e) => {
                pass.host.remove(container);
                return Err(e);
            }
        };
        let plot: SharedPlot = Rc::new(RefCell::new(plot));

        let mut channels = vec!["Time".to_string()];
        let mut colors = vec![String::new()];
        let mut indices = vec![SeriesOrigin::Time];
        for s in &series {
            channels.push(s.label.clone());
            colors.push(s.color.clone());
            indices.push(s.origin.clone());
        }
        let spec = ChartSpec {
            source_group_id: group.key.clone(),
            chart_type,
            name: group.key.clone(),
            plot: Rc::clone(&plot),
            container,
            channels,
            colors,
            indices,
            digital_plugin,
            axis_structure: AxisStructure::of(&plan, has_digital),
        };
        let ug = match pass.charts.add_chart(spec) {
            Ok(ug) => ug,
            Err(e) => {
                plot.borrow_mut().destroy();
                pass.host.remove(container);
                return Err(e);
            }
        };
        pass.host.set_attribute(container, ATTR_USER_GROUP_ID, &ug);
        pass.host.set_attribute(container, ATTR_CHART_TYPE, chart_type.as_str());
        pass.listeners.register(&ug, ListenerKind::Click);
        pass.listeners.register(&ug, ListenerKind::Resize);
        pass.resize.set_applied(&ug, size);
        plot.borrow_mut().redraw(false);
        tracing::debug!("built chart {ug} for group {} ({} series)", group.key, series.len());
        Ok(Some(ug))
    }
}

/// Remove a chart with its container and listeners. The plot is destroyed first.
pub fn teardown_chart(
    user_group_id: &str,
    charts: &mut ChartMetadataStore,
    host: &mut HostContainer,
    listeners: &mut ListenerRegistry,
    resize: &mut ResizeDebouncer,
) -> bool {
    let Some(entry) = charts.remove_chart(user_group_id) else {
        return false;
    };
    host.remove(entry.container);
    listeners.remove_owner(user_group_id);
    resize.forget(user_group_id);
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_transform_scales_and_inverts() {
        assert_eq!(display_values(&[1.0, -2.0], 2.0, false), vec![2.0, -4.0]);
        assert_eq!(display_values(&[1.0, -2.0], 2.0, true), vec![-2.0, 4.0]);
    }
}
