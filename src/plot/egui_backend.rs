//! `egui_plot` rendering of a [`PlotModel`].
//!
//! egui_plot has a single y axis, so every y scale is mapped linearly onto
//! the range of the first axis (`y0`). This keeps per-unit axes overlaid the
//! way the chart was planned.

use egui::{Color32, Stroke, Ui};
use egui_plot::{Legend, Line, Plot, Polygon, VLine};

use crate::error::Result;
use crate::host::ChartContainer;
use crate::plot::{
    CanvasPlot, DrawCommand, PlotBackend, PlotData, PlotModel, PlotOptions, ScaleRange, X_SCALE,
};

pub struct EguiPlot {
    model: PlotModel,
    id: String,
}

impl EguiPlot {
    pub fn id(&self) -> &str {
        &self.id
    }

    fn view_range(&self) -> ScaleRange {
        self.model
            .scales()
            .iter()
            .find(|(k, _)| k.as_str() != X_SCALE && k.starts_with('y'))
            .map(|(_, r)| *r)
            .unwrap_or(ScaleRange::new(0.0, 1.0))
    }

    fn to_view(&self, scale: &str, y: f64, view: ScaleRange) -> f64 {
        match self.model.scale(scale) {
            Some(r) if r.span() != 0.0 && r != view => view.min + (y - r.min) / r.span() * view.span(),
            _ => y,
        }
    }

    /// Draw the plot and return the x value of a primary click, if any.
    pub fn show(&mut self, ui: &mut Ui) -> Option<f64> {
        if self.model.is_destroyed() {
            return None;
        }
        let view = self.view_range();
        let x = self.model.x_range();
        let height = self.model.size().height;
        let title = self.model.title().to_string();

        let resp = Plot::new(self.id.clone())
            .height(height)
            .allow_scroll(false)
            .legend(Legend::default())
            .show(ui, |plot_ui| {
                plot_ui.set_plot_bounds_x(x.min..=x.max);
                let pad = view.span() * 0.05;
                plot_ui.set_plot_bounds_y(view.min - pad..=view.max + pad);

                for (i, s) in self.model.series().iter().enumerate().skip(1) {
                    if !s.show || s.stroke == Color32::TRANSPARENT {
                        continue;
                    }
                    let pts: Vec<[f64; 2]> = self
                        .model
                        .data()
                        .points(i)
                        .into_iter()
                        .map(|[px, py]| [px, self.to_view(&s.scale, py, view)])
                        .collect();
                    plot_ui.line(Line::new(s.label.clone(), pts).color(s.stroke).width(s.width.max(0.5)));
                }

                for cmd in self.model.draw_list() {
                    match cmd {
                        DrawCommand::FillRect {
                            x0,
                            x1,
                            y0,
                            y1,
                            color,
                            scale,
                        } => {
                            let (a, b) = (self.to_view(scale, *y0, view), self.to_view(scale, *y1, view));
                            let poly = vec![[*x0, a], [*x1, a], [*x1, b], [*x0, b]];
                            plot_ui.polygon(
                                Polygon::new(format!("{title} digital"), poly)
                                    .fill_color(color.gamma_multiply(0.6))
                                    .stroke(Stroke::NONE),
                            );
                        }
                        DrawCommand::VLine { x, color } => {
                            plot_ui.vline(VLine::new("cursor", *x).color(*color).width(1.5));
                        }
                    }
                }

                if plot_ui.response().clicked() {
                    plot_ui.pointer_coordinate().map(|p| p.x)
                } else {
                    None
                }
            });
        resp.inner
    }
}

impl CanvasPlot for EguiPlot {
    fn model(&self) -> &PlotModel {
        &self.model
    }

    fn model_mut(&mut self) -> &mut PlotModel {
        &mut self.model
    }
}

/// Creates [`EguiPlot`]s; ids are derived from the container's group id.
#[derive(Debug, Default)]
pub struct EguiBackend {
    created: u64,
}

impl PlotBackend for EguiBackend {
    fn create(&mut self, opts: PlotOptions, data: PlotData, container: &ChartContainer) -> Result<Box<dyn CanvasPlot>> {
        self.created += 1;
        let id = format!("chart-{}-{}", opts.title, self.created);
        let mut model = PlotModel::new(opts, data)?;
        model.set_size(container.size);
        model.redraw();
        tracing::debug!("egui plot {id} created");
        Ok(Box::new(EguiPlot { model, id }))
    }
}
