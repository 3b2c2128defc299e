//! eframe shell hosting a [`Session`]: file menu, stacked charts, cursor
//! clicks and the delta table.

use std::path::{Path, PathBuf};
use std::sync::mpsc::Receiver;
use std::time::Instant;

use eframe::egui;

use comtrade_view::cursors::DeltaReport;
use comtrade_view::plot::{CanvasPlot, EguiBackend, EguiPlot, PlotSize};
use comtrade_view::recording::DatFormat;
use comtrade_view::{
    EventFilter, EventKind, JsonFileStore, MergedFiles, MessageOutcome, ProgressChannel, Session, Theme, ViewerConfig,
    ViewerEvent,
};

pub struct ViewerApp {
    session: Session<EguiBackend>,
    events: Receiver<ViewerEvent>,
    progress: ProgressChannel,
    delta: Option<DeltaReport>,
    status: String,
    theme_applied: bool,
}

impl ViewerApp {
    pub fn new(config: ViewerConfig, storage: JsonFileStore) -> Self {
        let session = Session::new(config, EguiBackend::default(), storage);
        let events = session.events().subscribe(EventFilter::only(
            EventKind::DELTA_UPDATE | EventKind::CURSOR_REMOVED | EventKind::RECORDING_LOADED,
        ));
        let progress = session.progress().clone();
        Self {
            session,
            events,
            progress,
            delta: None,
            status: String::from("Open a merged recording (File → Open…)"),
            theme_applied: false,
        }
    }

    /// Load a `merged_files_ready` payload, or a full message carrying one.
    pub fn open(&mut self, path: &Path) {
        let text = match std::fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) => {
                self.status = format!("Cannot read {}: {e}", path.display());
                return;
            }
        };
        let loaded = match serde_json::from_str::<MergedFiles>(&text) {
            Ok(mut files) => {
                if files.filenames.is_empty() {
                    files.filenames.push(path.display().to_string());
                    files.file_count = 1;
                }
                self.session.ingest_merged(files).map_err(|e| e.to_string())
            }
            Err(_) => match self.session.handle_text(&text) {
                Some(MessageOutcome::Loaded(report)) => Ok(report),
                Some(MessageOutcome::Failed(reason)) => Err(reason),
                _ => Err("not a merged recording".to_string()),
            },
        };
        self.status = match loaded {
            Ok(report) => format!(
                "{}: {} charts ({} failed)",
                path.display(),
                report.built.len(),
                report.failed.len()
            ),
            Err(reason) => {
                tracing::error!("open {} failed: {reason}", path.display());
                format!("Open failed: {reason}")
            }
        };
        self.delta = None;
    }

    fn drain_events(&mut self) {
        while let Ok(ev) = self.events.try_recv() {
            if ev.kinds.contains(EventKind::DELTA_UPDATE) {
                self.delta = ev.delta;
            } else if ev.kinds.contains(EventKind::CURSOR_REMOVED) && self.session.cursors().borrow().len() < 2 {
                self.delta = None;
            } else if ev.kinds.contains(EventKind::RECORDING_LOADED) {
                self.delta = None;
            }
        }
    }

    fn export_csv(&mut self) {
        let Some(path) = rfd::FileDialog::new()
            .add_filter("CSV", &["csv"])
            .set_file_name("comtrade_export.csv")
            .save_file()
        else {
            return;
        };
        let csv = self
            .session
            .export_csv(|rows| tracing::trace!("csv export: {rows} rows"));
        self.status = match std::fs::write(&path, csv) {
            Ok(()) => format!("Saved {}", path.display()),
            Err(e) => format!("CSV export failed: {e}"),
        };
    }

    fn export_comtrade(&mut self, format: DatFormat) {
        let Some(path) = rfd::FileDialog::new()
            .add_filter("COMTRADE", &["cfg"])
            .set_file_name("export.cfg")
            .save_file()
        else {
            return;
        };
        let dir = path.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."));
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("export")
            .to_string();
        let saved = self
            .session
            .export_comtrade(format)
            .and_then(|out| out.save(&dir, &stem));
        self.status = match saved {
            Ok((cfg, _)) => format!("Saved {} ({})", cfg.display(), format.cfg_keyword()),
            Err(e) => format!("COMTRADE export failed: {e}"),
        };
    }

    fn menu(&mut self, ui: &mut egui::Ui, ctx: &egui::Context) {
        egui::MenuBar::new().ui(ui, |ui| {
            ui.menu_button("File", |ui| {
                if ui.button("Open…").clicked() {
                    ui.close();
                    if let Some(path) = rfd::FileDialog::new().add_filter("Merged recording", &["json"]).pick_file() {
                        self.open(&path);
                    }
                }
                ui.separator();
                if ui.button("Export CSV…").clicked() {
                    ui.close();
                    self.export_csv();
                }
                ui.menu_button("Export COMTRADE", |ui| {
                    for format in [DatFormat::Ascii, DatFormat::Binary, DatFormat::Float32, DatFormat::Float64] {
                        if ui.button(format.cfg_keyword()).clicked() {
                            ui.close();
                            self.export_comtrade(format);
                        }
                    }
                });
            });
            ui.menu_button("Edit", |ui| {
                if ui.add_enabled(self.session.can_undo(), egui::Button::new("Undo")).clicked() {
                    ui.close();
                    self.session.undo();
                }
                if ui.add_enabled(self.session.can_redo(), egui::Button::new("Redo")).clicked() {
                    ui.close();
                    self.session.redo();
                }
                if ui.button("Clear cursors").clicked() {
                    ui.close();
                    self.session.cursors().borrow_mut().clear();
                    self.delta = None;
                }
            });
            ui.menu_button("View", |ui| {
                for theme in Theme::all() {
                    if ui.radio(self.session.theme() == *theme, theme.as_str()).clicked() {
                        ui.close();
                        self.session.set_theme(*theme);
                        theme.apply(ctx);
                    }
                }
            });
        });
    }

    fn delta_table(&self, ui: &mut egui::Ui) {
        let Some(report) = &self.delta else {
            ui.label("Click a chart twice to place two cursors.");
            return;
        };
        ui.label(format!(
            "A = {:.6} s   B = {:.6} s   Δt = {:.6} s",
            report.x_a, report.x_b, report.dt
        ));
        let cell = |v: Option<f64>| v.map_or_else(|| "–".to_string(), |v| format!("{v:.4}"));
        egui::Grid::new("delta_table").striped(true).show(ui, |ui| {
            for h in ["Channel", "y(A)", "y(B)", "Δy", "%"] {
                ui.strong(h);
            }
            ui.end_row();
            for r in &report.records {
                ui.label(&r.label);
                ui.label(cell(r.y_a));
                ui.label(cell(r.y_b));
                ui.label(cell(r.dy));
                ui.label(cell(r.pct));
                ui.end_row();
            }
        });
    }

    fn charts(&mut self, ui: &mut egui::Ui, now: Instant) {
        let mut clicks = Vec::new();
        let mut sizes = Vec::new();
        egui::ScrollArea::vertical().show(ui, |ui| {
            for entry in self.session.charts().list() {
                ui.label(format!("{} · {}", entry.name, entry.chart_type));
                let mut guard = entry.plot.borrow_mut();
                let plot: &mut dyn CanvasPlot = &mut **guard;
                let height = plot.model().size().height;
                sizes.push((
                    entry.user_group_id.clone(),
                    PlotSize {
                        width: ui.available_width(),
                        height,
                    },
                ));
                let span = plot.model().x_range().span();
                if let Some(x) = plot.downcast_mut::<EguiPlot>().and_then(|p| p.show(ui)) {
                    clicks.push((x, span));
                }
                ui.add_space(6.0);
            }
        });
        for (ug, size) in sizes {
            self.session.resize(&ug, size, now);
        }
        for (x, span) in clicks {
            self.session.click_at(x, span);
        }
    }
}

impl eframe::App for ViewerApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        if !self.theme_applied {
            self.session.theme().apply(ctx);
            self.theme_applied = true;
        }
        let now = Instant::now();
        self.session.tick(now);
        self.session.frame();
        self.drain_events();

        egui::TopBottomPanel::top("comtrade_menu").show(ctx, |ui| self.menu(ui, ctx));

        egui::TopBottomPanel::bottom("comtrade_status").show(ctx, |ui| {
            ui.horizontal(|ui| {
                if let Some(p) = self.progress.current().filter(|p| p.visible) {
                    ui.add(
                        egui::ProgressBar::new(f32::from(p.percent) / 100.0)
                            .desired_width(160.0)
                            .text(p.message),
                    );
                }
                ui.label(&self.status);
            });
            ui.separator();
            self.delta_table(ui);
        });

        egui::CentralPanel::default().show(ctx, |ui| self.charts(ui, now));

        if self.progress.is_visible() || !self.session.queue().is_empty() {
            ctx.request_repaint();
        }
    }
}

impl Drop for ViewerApp {
    fn drop(&mut self) {
        self.session.shutdown();
    }
}

/// Open the viewer window, optionally loading `initial` first.
pub fn run(config: ViewerConfig, storage: JsonFileStore, initial: Option<PathBuf>) -> eframe::Result<()> {
    let mut app = ViewerApp::new(config, storage);
    if let Some(path) = initial {
        app.open(&path);
    }
    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default().with_inner_size(egui::vec2(1400.0, 900.0)),
        ..Default::default()
    };
    eframe::run_native("COMTRADE Viewer", options, Box::new(|_cc| Ok(Box::new(app))))
}
