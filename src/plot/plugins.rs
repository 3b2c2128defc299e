//! Plot plugins installed by the group renderer.

use std::rc::Rc;

use egui::Color32;

use crate::cursors::SharedCursors;
use crate::plot::{DrawCommand, DrawList, PlotModel, PlotPlugin, DIGITAL_SCALE};
use crate::recording::is_high;

/// One digital series rendered by the fill overlay.
#[derive(Debug, Clone, PartialEq)]
pub struct DigitalSignal {
    /// Series index in the owning plot.
    pub series_idx: usize,
    pub label: String,
    pub color: Color32,
}

/// Draws filled rectangles where a digital series is HIGH, one lane per
/// signal, stacked `offset` apart on the digital scale.
#[derive(Debug, Clone)]
pub struct DigitalFillPlugin {
    signals: Vec<DigitalSignal>,
    offset: f64,
    height: f64,
}

impl DigitalFillPlugin {
    pub const NAME: &'static str = "digitalFill";

    pub fn new(signals: Vec<DigitalSignal>, offset: f64, height: f64) -> Self {
        Self {
            signals,
            offset,
            height,
        }
    }

    pub fn signals(&self) -> &[DigitalSignal] {
        &self.signals
    }

    pub fn signal_colors(&self) -> Vec<Color32> {
        self.signals.iter().map(|s| s.color).collect()
    }

    /// Range of the digital scale that fits every lane.
    pub fn lane_range(&self) -> (f64, f64) {
        let lanes = self.signals.len().max(1) as f64;
        (-0.25 * self.offset, (lanes - 1.0) * self.offset + self.height + 0.25 * self.offset)
    }

    pub fn set_signal_color(&mut self, series_idx: usize, color: Color32) -> bool {
        match self.signals.iter_mut().find(|s| s.series_idx == series_idx) {
            Some(s) => {
                s.color = color;
                true
            }
            None => false,
        }
    }

    pub fn set_signal_label(&mut self, series_idx: usize, label: &str) -> bool {
        match self.signals.iter_mut().find(|s| s.series_idx == series_idx) {
            Some(s) => {
                s.label = label.to_string();
                true
            }
            None => false,
        }
    }

    /// Keep series indices in step with a removal from the owning plot.
    pub fn on_series_removed(&mut self, series_idx: usize) {
        self.signals.retain(|s| s.series_idx != series_idx);
        for s in self.signals.iter_mut() {
            if s.series_idx > series_idx {
                s.series_idx -= 1;
            }
        }
    }

    /// Keep series indices in step with an insertion into the owning plot.
    pub fn on_series_inserted(&mut self, series_idx: usize) {
        for s in self.signals.iter_mut() {
            if s.series_idx >= series_idx {
                s.series_idx += 1;
            }
        }
    }

    pub fn add_signal(&mut self, signal: DigitalSignal) {
        self.on_series_inserted(signal.series_idx);
        self.signals.push(signal);
        self.signals.sort_by_key(|s| s.series_idx);
    }
}

impl PlotPlugin for DigitalFillPlugin {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn init(&mut self, plot: &PlotModel) {
        let n = plot.series().len();
        self.signals.retain(|s| {
            let ok = s.series_idx > 0 && s.series_idx < n;
            if !ok {
                tracing::debug!("digital signal {} has no series in {}", s.label, plot.title());
            }
            ok
        });
    }

    fn draw(&mut self, plot: &PlotModel, out: &mut DrawList) {
        let time = plot.data().time();
        for (lane, signal) in self.signals.iter().enumerate() {
            let Some(values) = plot.data().column(signal.series_idx) else {
                continue;
            };
            let y0 = lane as f64 * self.offset;
            let y1 = y0 + self.height;
            let mut run_start: Option<f64> = None;
            for (i, (t, v)) in time.iter().zip(values).enumerate() {
                let high = is_high(*v);
                match (high, run_start) {
                    (true, None) => run_start = Some(*t),
                    (false, Some(x0)) => {
                        out.push(DrawCommand::FillRect {
                            x0,
                            x1: *t,
                            y0,
                            y1,
                            color: signal.color,
                            scale: DIGITAL_SCALE.to_string(),
                        });
                        run_start = None;
                    }
                    _ => {}
                }
                if high && i + 1 == time.len() {
                    if let Some(x0) = run_start {
                        out.push(DrawCommand::FillRect {
                            x0,
                            x1: *t,
                            y0,
                            y1,
                            color: signal.color,
                            scale: DIGITAL_SCALE.to_string(),
                        });
                    }
                }
            }
        }
    }
}

/// Draws the shared cursor lines. Every chart gets its own instance bound to
/// the same cursor state, plus a getter for the chart list so a cursor change
/// can be propagated to all charts.
pub struct VerticalLinePlugin {
    cursors: SharedCursors,
    charts: Rc<dyn Fn() -> Vec<String>>,
    color: Color32,
}

impl VerticalLinePlugin {
    pub const NAME: &'static str = "verticalLine";

    pub fn new(cursors: SharedCursors, charts: Rc<dyn Fn() -> Vec<String>>, color: Color32) -> Self {
        Self { cursors, charts, color }
    }

    /// User-group ids of every chart that has to redraw with this one.
    pub fn sync_targets(&self) -> Vec<String> {
        (self.charts)()
    }

    pub fn set_color(&mut self, color: Color32) {
        self.color = color;
    }
}

impl PlotPlugin for VerticalLinePlugin {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn draw(&mut self, plot: &PlotModel, out: &mut DrawList) {
        let x = plot.x_range();
        for c in self.cursors.borrow().positions() {
            if *c >= x.min && *c <= x.max {
                out.push(DrawCommand::VLine { x: *c, color: self.color });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plot::{PlotData, PlotOptions, PlotSize, SeriesDef, SharedPlugin};
    use std::cell::RefCell;
    use std::collections::BTreeMap;

    fn model(plugin: Rc<RefCell<DigitalFillPlugin>>) -> PlotModel {
        let shared: SharedPlugin = plugin;
        let digital = SeriesDef {
            label: "TRIP".into(),
            stroke: Color32::TRANSPARENT,
            scale: DIGITAL_SCALE.into(),
            width: 0.0,
            points: false,
            show: true,
        };
        PlotModel::new(
            PlotOptions {
                title: "GD0".into(),
                size: PlotSize {
                    width: 10.0,
                    height: 10.0,
                },
                series: vec![SeriesDef::time(), digital],
                axes: Vec::new(),
                scales: BTreeMap::new(),
                plugins: vec![shared],
            },
            PlotData {
                columns: vec![vec![0.0, 1.0, 2.0, 3.0, 4.0], vec![0.0, 1.0, 1.0, 0.0, 1.0]],
            },
        )
        .unwrap()
    }

    #[test]
    fn high_runs_become_rectangles() {
        let plugin = Rc::new(RefCell::new(DigitalFillPlugin::new(
            vec![DigitalSignal {
                series_idx: 1,
                label: "TRIP".into(),
                color: Color32::GREEN,
            }],
            1.5,
            1.0,
        )));
        let mut m = model(plugin.clone());
        m.redraw();
        let rects: Vec<(f64, f64)> = m
            .draw_list()
            .iter()
            .filter_map(|c| match c {
                DrawCommand::FillRect { x0, x1, .. } => Some((*x0, *x1)),
                _ => None,
            })
            .collect();
        assert_eq!(rects, vec![(1.0, 3.0), (4.0, 4.0)]);
        assert_eq!(plugin.borrow().signal_colors(), vec![Color32::GREEN]);
    }

    #[test]
    fn removal_shifts_later_signals() {
        let mut p = DigitalFillPlugin::new(
            vec![
                DigitalSignal {
                    series_idx: 2,
                    label: "A".into(),
                    color: Color32::RED,
                },
                DigitalSignal {
                    series_idx: 3,
                    label: "B".into(),
                    color: Color32::BLUE,
                },
            ],
            1.5,
            1.0,
        );
        p.on_series_removed(2);
        assert_eq!(p.signals().len(), 1);
        assert_eq!(p.signals()[0].series_idx, 2);
        assert!(p.set_signal_color(2, Color32::WHITE));
    }
}
