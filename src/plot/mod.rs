//! The plotting capability the chart engine asks of its backend.
//!
//! A plot is built from [`PlotOptions`] (series, axes, scales, plugins) and
//! column-oriented [`PlotData`] whose column 0 is time; series `i` draws
//! column `i`, so series 0 is the time series itself. Backends keep their
//! retained state in a [`PlotModel`] and expose it through [`CanvasPlot`].

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use downcast_rs::{impl_downcast, Downcast};
use egui::Color32;

use crate::error::{Result, ViewerError};
use crate::host::ChartContainer;

pub mod egui_backend;
pub mod plugins;

pub use egui_backend::{EguiBackend, EguiPlot};
pub use plugins::{DigitalFillPlugin, DigitalSignal, VerticalLinePlugin};

/// Scale key of the time axis.
pub const X_SCALE: &str = "x";
/// Scale key of the digital overlay.
pub const DIGITAL_SCALE: &str = "digital";

#[derive(Debug, Clone, PartialEq)]
pub struct SeriesDef {
    pub label: String,
    pub stroke: Color32,
    pub scale: String,
    pub width: f32,
    pub points: bool,
    pub show: bool,
}

impl SeriesDef {
    pub fn time() -> Self {
        Self {
            label: "Time".into(),
            stroke: Color32::TRANSPARENT,
            scale: X_SCALE.into(),
            width: 0.0,
            points: false,
            show: false,
        }
    }
}

/// Partial series update for [`CanvasPlot::set_series`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SeriesPatch {
    pub stroke: Option<Color32>,
    pub label: Option<String>,
    pub show: Option<bool>,
    pub width: Option<f32>,
}

impl SeriesPatch {
    pub fn stroke(color: Color32) -> Self {
        Self {
            stroke: Some(color),
            ..Default::default()
        }
    }

    pub fn label(label: &str) -> Self {
        Self {
            label: Some(label.to_string()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaleRange {
    pub min: f64,
    pub max: f64,
}

impl ScaleRange {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn span(&self) -> f64 {
        self.max - self.min
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AxisSide {
    Left,
    Right,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AxisDef {
    pub scale: String,
    pub label: String,
    pub side: AxisSide,
    pub show: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlotSize {
    pub width: f32,
    pub height: f32,
}

/// Output of plugin draw hooks, replayed by the backend on top of the series.
#[derive(Debug, Clone, PartialEq)]
pub enum DrawCommand {
    FillRect {
        x0: f64,
        x1: f64,
        y0: f64,
        y1: f64,
        color: Color32,
        scale: String,
    },
    VLine {
        x: f64,
        color: Color32,
    },
}

pub type DrawList = Vec<DrawCommand>;

/// Plugin hooks. Plugins may carry any identifying fields; the renderer
/// keeps direct handles to the ones it needs later.
pub trait PlotPlugin: Downcast {
    fn name(&self) -> &str;
    fn init(&mut self, _plot: &PlotModel) {}
    fn draw(&mut self, _plot: &PlotModel, _out: &mut DrawList) {}
    fn set_select(&mut self, _plot: &PlotModel) {}
    fn destroy(&mut self, _plot: &PlotModel) {}
}
impl_downcast!(PlotPlugin);

pub type SharedPlugin = Rc<RefCell<dyn PlotPlugin>>;

pub struct PlotOptions {
    pub title: String,
    pub size: PlotSize,
    pub series: Vec<SeriesDef>,
    pub axes: Vec<AxisDef>,
    pub scales: BTreeMap<String, ScaleRange>,
    pub plugins: Vec<SharedPlugin>,
}

impl std::fmt::Debug for PlotOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlotOptions")
            .field("title", &self.title)
            .field("series", &self.series.len())
            .field("axes", &self.axes.len())
            .field("plugins", &self.plugins.len())
            .finish()
    }
}

/// Column-oriented sample data; column 0 is time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlotData {
    pub columns: Vec<Vec<f64>>,
}

impl PlotData {
    pub fn time(&self) -> &[f64] {
        self.columns.first().map_or(&[], Vec::as_slice)
    }

    pub fn column(&self, idx: usize) -> Option<&[f64]> {
        self.columns.get(idx).map(Vec::as_slice)
    }

    /// `[x, y]` pairs of a series, skipping non-finite samples.
    pub fn points(&self, idx: usize) -> Vec<[f64; 2]> {
        let Some(ys) = self.column(idx) else {
            return Vec::new();
        };
        self.time()
            .iter()
            .zip(ys)
            .filter(|(x, y)| x.is_finite() && y.is_finite())
            .map(|(x, y)| [*x, *y])
            .collect()
    }
}

/// Retained plot state shared by every backend.
pub struct PlotModel {
    title: String,
    size: PlotSize,
    series: Vec<SeriesDef>,
    axes: Vec<AxisDef>,
    scales: BTreeMap<String, ScaleRange>,
    plugins: Vec<SharedPlugin>,
    data: PlotData,
    draw_list: DrawList,
    select: Option<ScaleRange>,
    redraws: usize,
    destroyed: bool,
}

impl PlotModel {
    /// Build the model and run every plugin's `init` hook.
    pub fn new(opts: PlotOptions, data: PlotData) -> Result<Self> {
        if opts.series.len() != data.columns.len() {
            return Err(ViewerError::Render {
                group: opts.title.clone(),
                reason: format!("{} series for {} data columns", opts.series.len(), data.columns.len()),
            });
        }
        let mut scales = opts.scales;
        if !scales.contains_key(X_SCALE) {
            let t = data.time();
            let range = match (t.first(), t.last()) {
                (Some(a), Some(b)) if b > a => ScaleRange::new(*a, *b),
                _ => ScaleRange::new(0.0, 1.0),
            };
            scales.insert(X_SCALE.to_string(), range);
        }
        let model = Self {
            title: opts.title,
            size: opts.size,
            series: opts.series,
            axes: opts.axes,
            scales,
            plugins: opts.plugins,
            data,
            draw_list: Vec::new(),
            select: None,
            redraws: 0,
            destroyed: false,
        };
        for p in model.plugins.clone() {
            p.borrow_mut().init(&model);
        }
        Ok(model)
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn series(&self) -> &[SeriesDef] {
        &self.series
    }

    pub fn axes(&self) -> &[AxisDef] {
        &self.axes
    }

    pub fn scales(&self) -> &BTreeMap<String, ScaleRange> {
        &self.scales
    }

    pub fn scale(&self, key: &str) -> Option<ScaleRange> {
        self.scales.get(key).copied()
    }

    pub fn data(&self) -> &PlotData {
        &self.data
    }

    pub fn size(&self) -> PlotSize {
        self.size
    }

    pub fn plugins(&self) -> &[SharedPlugin] {
        &self.plugins
    }

    pub fn draw_list(&self) -> &[DrawCommand] {
        &self.draw_list
    }

    pub fn redraw_count(&self) -> usize {
        self.redraws
    }

    pub fn selection(&self) -> Option<ScaleRange> {
        self.select
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn x_range(&self) -> ScaleRange {
        self.scale(X_SCALE).unwrap_or(ScaleRange::new(0.0, 1.0))
    }

    pub fn set_series(&mut self, idx: usize, patch: &SeriesPatch) {
        let Some(s) = self.series.get_mut(idx) else {
            tracing::debug!("set_series on missing series {idx} of {}", self.title);
            return;
        };
        if let Some(c) = patch.stroke {
            s.stroke = c;
        }
        if let Some(l) = &patch.label {
            s.label = l.clone();
        }
        if let Some(v) = patch.show {
            s.show = v;
        }
        if let Some(w) = patch.width {
            s.width = w;
        }
    }

    pub fn set_scale(&mut self, key: &str, range: ScaleRange) {
        self.scales.insert(key.to_string(), range);
    }

    pub fn set_size(&mut self, size: PlotSize) {
        self.size = size;
    }

    pub fn set_select(&mut self, range: Option<ScaleRange>) {
        self.select = range;
        for p in self.plugins.clone() {
            p.borrow_mut().set_select(self);
        }
    }

    /// Insert a series (and its data column) at `idx`.
    pub fn add_series(&mut self, idx: usize, def: SeriesDef, values: Vec<f64>) {
        let idx = idx.min(self.series.len());
        self.series.insert(idx, def);
        self.data.columns.insert(idx, values);
    }

    /// Remove a series (and its data column). Series 0 (time) is never removed.
    pub fn del_series(&mut self, idx: usize) -> bool {
        if idx == 0 || idx >= self.series.len() {
            return false;
        }
        self.series.remove(idx);
        self.data.columns.remove(idx);
        true
    }

    /// Re-run plugin draw hooks.
    pub fn redraw(&mut self) {
        let mut list = DrawList::new();
        for p in self.plugins.clone() {
            p.borrow_mut().draw(self, &mut list);
        }
        self.draw_list = list;
        self.redraws += 1;
    }

    /// Run plugin destroy hooks and release the data.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        for p in self.plugins.clone() {
            p.borrow_mut().destroy(self);
        }
        self.destroyed = true;
        self.plugins.clear();
        self.data.columns.clear();
        self.draw_list.clear();
    }

    /// Convert a pixel offset into a data value on `scale`. The x scale
    /// grows to the right, y scales grow upwards.
    pub fn pos_to_val(&self, px: f32, scale: &str) -> f64 {
        let range = self.scale(scale).unwrap_or(ScaleRange::new(0.0, 1.0));
        if scale == X_SCALE {
            let w = f64::from(self.size.width.max(1.0));
            range.min + f64::from(px) / w * range.span()
        } else {
            let h = f64::from(self.size.height.max(1.0));
            range.max - f64::from(px) / h * range.span()
        }
    }

    /// Index of the sample closest to the x pixel offset.
    pub fn pos_to_idx(&self, px: f32) -> usize {
        nearest_sample(self.data.time(), self.pos_to_val(px, X_SCALE))
    }
}

/// Index of the sample in sorted `times` nearest to `x` (0 for empty input).
pub fn nearest_sample(times: &[f64], x: f64) -> usize {
    if times.is_empty() {
        return 0;
    }
    let i = times.partition_point(|t| *t < x);
    if i == 0 {
        0
    } else if i >= times.len() {
        times.len() - 1
    } else if (times[i] - x).abs() < (x - times[i - 1]).abs() {
        i
    } else {
        i - 1
    }
}

/// A live plot owned by a chart entry.
///
/// Every method has a default that forwards to the [`PlotModel`]; backends
/// override the ones where they need to do more.
pub trait CanvasPlot: Downcast {
    fn model(&self) -> &PlotModel;
    fn model_mut(&mut self) -> &mut PlotModel;

    fn set_series(&mut self, idx: usize, patch: &SeriesPatch) {
        self.model_mut().set_series(idx, patch);
    }

    fn set_scale(&mut self, key: &str, range: ScaleRange) {
        self.model_mut().set_scale(key, range);
    }

    fn set_size(&mut self, size: PlotSize) {
        self.model_mut().set_size(size);
    }

    fn redraw(&mut self, _force: bool) {
        self.model_mut().redraw();
    }

    fn destroy(&mut self) {
        self.model_mut().destroy();
    }

    fn is_destroyed(&self) -> bool {
        self.model().is_destroyed()
    }

    fn add_series(&mut self, idx: usize, def: SeriesDef, values: Vec<f64>) {
        self.model_mut().add_series(idx, def, values);
    }

    fn del_series(&mut self, idx: usize) -> bool {
        self.model_mut().del_series(idx)
    }

    fn pos_to_val(&self, px: f32, scale: &str) -> f64 {
        self.model().pos_to_val(px, scale)
    }

    fn pos_to_idx(&self, px: f32) -> usize {
        self.model().pos_to_idx(px)
    }
}
impl_downcast!(CanvasPlot);

pub type SharedPlot = Rc<RefCell<Box<dyn CanvasPlot>>>;

/// Constructs plots for the renderer.
pub trait PlotBackend {
    fn create(&mut self, opts: PlotOptions, data: PlotData, container: &ChartContainer) -> Result<Box<dyn CanvasPlot>>;
}

/// Plot with no drawing surface; used by tests and headless embedding.
pub struct HeadlessPlot {
    model: PlotModel,
}

impl CanvasPlot for HeadlessPlot {
    fn model(&self) -> &PlotModel {
        &self.model
    }

    fn model_mut(&mut self) -> &mut PlotModel {
        &mut self.model
    }
}

#[derive(Debug, Default)]
pub struct HeadlessBackend {
    pub created: usize,
}

impl PlotBackend for HeadlessBackend {
    fn create(&mut self, opts: PlotOptions, data: PlotData, _container: &ChartContainer) -> Result<Box<dyn CanvasPlot>> {
        let model = PlotModel::new(opts, data)?;
        self.created += 1;
        Ok(Box::new(HeadlessPlot { model }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> PlotOptions {
        PlotOptions {
            title: "G0".into(),
            size: PlotSize {
                width: 100.0,
                height: 50.0,
            },
            series: vec![
                SeriesDef::time(),
                SeriesDef {
                    label: "VA".into(),
                    stroke: Color32::RED,
                    scale: "y0".into(),
                    width: 1.0,
                    points: false,
                    show: true,
                },
            ],
            axes: Vec::new(),
            scales: BTreeMap::from([("y0".to_string(), ScaleRange::new(-1.0, 1.0))]),
            plugins: Vec::new(),
        }
    }

    fn data() -> PlotData {
        PlotData {
            columns: vec![vec![0.0, 1.0, 2.0, 3.0], vec![0.0, 1.0, 0.0, -1.0]],
        }
    }

    #[test]
    fn pixel_conversions_follow_scales() {
        let m = PlotModel::new(options(), data()).unwrap();
        assert_eq!(m.x_range(), ScaleRange::new(0.0, 3.0));
        assert!((m.pos_to_val(50.0, X_SCALE) - 1.5).abs() < 1e-9);
        assert!((m.pos_to_val(0.0, "y0") - 1.0).abs() < 1e-9);
        assert_eq!(m.pos_to_idx(90.0), 3);
    }

    #[test]
    fn mismatched_columns_are_rejected() {
        let mut d = data();
        d.columns.pop();
        assert!(PlotModel::new(options(), d).is_err());
    }

    #[test]
    fn series_edits_and_removal() {
        let mut m = PlotModel::new(options(), data()).unwrap();
        m.set_series(1, &SeriesPatch::stroke(Color32::BLUE));
        assert_eq!(m.series()[1].stroke, Color32::BLUE);
        assert!(!m.del_series(0));
        assert!(m.del_series(1));
        assert_eq!(m.data().columns.len(), 1);
    }

    #[test]
    fn nearest_sample_picks_closest() {
        let t = [0.0, 0.01, 0.02];
        assert_eq!(nearest_sample(&t, -1.0), 0);
        assert_eq!(nearest_sample(&t, 0.012), 1);
        assert_eq!(nearest_sample(&t, 0.017), 2);
        assert_eq!(nearest_sample(&t, 9.0), 2);
    }
}
