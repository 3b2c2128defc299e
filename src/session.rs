//! The viewer session: owns the recording, channel state, charts and every
//! collaborator, and is the only place inbound work enters the core.

use std::rc::Rc;
use std::time::Instant;

use egui::Color32;
use serde_json::Value;

use crate::charts::{ChartMetadataStore, SeriesOrigin};
use crate::computed::{rehydrate, stored_from_recording, ComputedChannelStore};
use crate::config::ViewerConfig;
use crate::cursors::{delta, CursorDeltaEngine, DeltaReport, DeltaSeries, SharedCursors, ToggleOutcome};
use crate::dispatcher::DispatchOutcome;
use crate::error::Result;
use crate::events::{
    ChartMeta, CursorMeta, EventController, EventKind, PhasorMeta, ProgressMeta, RecordingMeta, ViewerEvent,
};
use crate::export::{self, ComtradeExport};
use crate::groups::plan_groups;
use crate::host::HostContainer;
use crate::messages::{InboundMessage, MergedFiles, MessageBus, OutboundMessage};
use crate::persistence::{load_json, save_json, KeyValueStore};
use crate::plot::{nearest_sample, PlotBackend, PlotSize, X_SCALE};
use crate::progress::{self, ProgressChannel};
use crate::recording::{DatFormat, Recording};
use crate::renderer::{display_values, effective_max_axes, teardown_chart, GroupChartRenderer, RenderPass, RenderReport};
use crate::resources::{FrameScheduler, ListenerKind, ListenerRegistry, ManualFrames, ResizeDebouncer, UpdateQueue};
use crate::state::channels::{ChannelKind, ChannelModel, LoadMetadata};
use crate::theme::{parse_hex, Theme};

/// Result of feeding one inbound message to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageOutcome {
    Dispatched(DispatchOutcome),
    Loaded(RenderReport),
    Failed(String),
}

fn cursor_color(theme: Theme) -> Color32 {
    theme
        .colors()
        .get("cursor")
        .and_then(|hex| parse_hex(hex))
        .unwrap_or(Color32::RED)
}

pub struct Session<B: PlotBackend> {
    pub(crate) config: ViewerConfig,
    pub(crate) recording: Recording,
    pub(crate) channels: ChannelModel,
    pub(crate) charts: ChartMetadataStore,
    pub(crate) host: HostContainer,
    pub(crate) backend: B,
    pub(crate) renderer: GroupChartRenderer,
    pub(crate) cursors: SharedCursors,
    pub(crate) listeners: ListenerRegistry,
    pub(crate) resize: ResizeDebouncer,
    pub(crate) queue: UpdateQueue,
    pub(crate) store: ComputedChannelStore,
    pub(crate) settings: Box<dyn KeyValueStore>,
    pub(crate) events: EventController,
    pub(crate) progress: ProgressChannel,
    pub(crate) bus: MessageBus,
    pub(crate) theme: Theme,
    pub(crate) max_y_axes: Option<usize>,
}

impl<B: PlotBackend> Session<B> {
    /// Build a session. `storage` holds computed channels and the theme;
    /// clones of it must share the same underlying data.
    pub fn new<S>(config: ViewerConfig, backend: B, storage: S) -> Self
    where
        S: KeyValueStore + Clone + 'static,
    {
        Self::with_scheduler(config, backend, storage, Box::new(ManualFrames::new()))
    }

    pub fn with_scheduler<S>(config: ViewerConfig, backend: B, storage: S, frames: Box<dyn FrameScheduler>) -> Self
    where
        S: KeyValueStore + Clone + 'static,
    {
        let theme = match load_json::<Theme>(&storage, &config.theme_key) {
            Ok(Some(t)) => t,
            Ok(None) => Theme::default(),
            Err(e) => {
                tracing::warn!("stored theme unreadable: {e}");
                Theme::default()
            }
        };
        theme.activate();
        let progress = ProgressChannel::new(config.progress_hide_delay());
        progress::install_global(&progress);
        Self {
            renderer: GroupChartRenderer::new(config.clone(), cursor_color(theme)),
            recording: Recording::default(),
            channels: ChannelModel::new(),
            charts: ChartMetadataStore::new(),
            host: HostContainer::new(),
            backend,
            cursors: CursorDeltaEngine::shared(),
            listeners: ListenerRegistry::new(),
            resize: ResizeDebouncer::new(config.resize_debounce()),
            queue: UpdateQueue::new(frames),
            store: ComputedChannelStore::new(Box::new(storage.clone()), &config.storage_key),
            settings: Box::new(storage),
            events: EventController::new(),
            progress,
            bus: MessageBus::new(config.slow_handler_threshold()),
            theme,
            max_y_axes: config.max_y_axes,
            config,
        }
    }

    pub fn config(&self) -> &ViewerConfig {
        &self.config
    }

    pub fn recording(&self) -> &Recording {
        &self.recording
    }

    pub fn channels(&self) -> &ChannelModel {
        &self.channels
    }

    /// Mutable access for subscribing to state changes.
    pub fn channels_mut(&mut self) -> &mut ChannelModel {
        &mut self.channels
    }

    pub fn charts(&self) -> &ChartMetadataStore {
        &self.charts
    }

    pub fn charts_mut(&mut self) -> &mut ChartMetadataStore {
        &mut self.charts
    }

    pub fn host(&self) -> &HostContainer {
        &self.host
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn cursors(&self) -> SharedCursors {
        Rc::clone(&self.cursors)
    }

    pub fn listeners(&self) -> &ListenerRegistry {
        &self.listeners
    }

    pub fn events(&self) -> &EventController {
        &self.events
    }

    pub fn progress(&self) -> &ProgressChannel {
        &self.progress
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn store(&self) -> &ComputedChannelStore {
        &self.store
    }

    pub fn theme(&self) -> Theme {
        self.theme
    }

    pub fn queue(&self) -> &UpdateQueue {
        &self.queue
    }

    /// Progress tick to the indicator, the event stream and peer windows.
    pub(crate) fn report(&self, percent: u8, message: &str) {
        self.progress.report(percent, message);
        let mut ev = ViewerEvent::new(EventKind::PROGRESS);
        ev.progress = Some(ProgressMeta {
            percent,
            message: message.to_string(),
        });
        self.events.emit(ev);
        self.bus.broadcast(&OutboundMessage::Progress {
            percent,
            message: message.to_string(),
        });
    }

    // ─────────────────────────────────────────────────────────────────────
    // Loading
    // ─────────────────────────────────────────────────────────────────────

    /// Replace the recording: reset state and cursors, re-hydrate stored
    /// computed channels and render every group.
    pub fn load(&mut self, mut recording: Recording, meta: LoadMetadata) -> Result<RenderReport> {
        recording.validate()?;
        let probe = self.config.made_from_probe_samples;
        for id in recording.normalize_computed(probe) {
            tracing::warn!("computed channel {id} declared digital but carries analog samples");
        }

        self.teardown_all();
        self.cursors.borrow_mut().clear();
        self.channels.load(&recording, &meta);
        let stored = self.store.load();
        match rehydrate(&stored, &mut recording, &mut self.channels, probe) {
            Ok(n) if n > 0 => tracing::info!("re-hydrated {n} computed channels"),
            Ok(_) => {}
            Err(e) => tracing::warn!("computed channel re-hydration failed: {e}"),
        }
        self.recording = recording;

        let report = self.rebuild_all();
        let mut ev = ViewerEvent::new(EventKind::RECORDING_LOADED);
        ev.recording = Some(RecordingMeta {
            filenames: meta.filenames.clone(),
            is_merged: meta.is_merged,
            chart_count: self.charts.len(),
        });
        self.events.emit(ev);
        self.emit_phasor(0);
        tracing::info!(
            "loaded {} ({} charts, {} failed)",
            meta.filenames.join(", "),
            report.built.len(),
            report.failed.len()
        );
        Ok(report)
    }

    /// Merger handoff.
    pub fn ingest_merged(&mut self, files: MergedFiles) -> Result<RenderReport> {
        let meta = LoadMetadata {
            filenames: files.filenames,
            file_count: files.file_count,
            is_merged: files.is_merged,
        };
        self.load(Recording::new(files.cfg, files.data), meta)
    }

    /// Feed one window message.
    pub fn handle_message(&mut self, raw: &Value) -> Option<MessageOutcome> {
        let msg = self.bus.receive(raw)?;
        let bus = self.bus.clone();
        let outcome = match msg {
            InboundMessage::Update(req) => {
                let label = req.kind.to_string();
                MessageOutcome::Dispatched(bus.timed(&label, || self.dispatch(req)))
            }
            InboundMessage::MergedFiles(files) => match bus.timed("merged_files_ready", || self.ingest_merged(*files)) {
                Ok(report) => MessageOutcome::Loaded(report),
                Err(e) => {
                    tracing::error!("merged files rejected: {e}");
                    MessageOutcome::Failed(e.to_string())
                }
            },
        };
        Some(outcome)
    }

    pub fn handle_text(&mut self, text: &str) -> Option<MessageOutcome> {
        match serde_json::from_str::<Value>(text) {
            Ok(v) => self.handle_message(&v),
            Err(e) => {
                tracing::debug!("dropping non-JSON message: {e}");
                None
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Chart lifecycle
    // ─────────────────────────────────────────────────────────────────────

    fn render(&mut self, keys: Option<&[String]>) -> RenderReport {
        let snapshot = self.channels.snapshot();
        let groups = plan_groups(&snapshot, &self.recording);
        self.max_y_axes = effective_max_axes(&self.config, &groups, &snapshot, &self.recording);
        let selected: Vec<_> = match keys {
            Some(keys) => groups.into_iter().filter(|g| keys.contains(&g.key)).collect(),
            None => groups,
        };
        let mut pass = RenderPass {
            recording: &self.recording,
            snapshot: &snapshot,
            host: &mut self.host,
            charts: &mut self.charts,
            backend: &mut self.backend,
            cursors: &self.cursors,
            listeners: &mut self.listeners,
            resize: &mut self.resize,
            max_y_axes: self.max_y_axes,
        };
        let report = self.renderer.render_groups(&mut pass, &selected);
        for ug in &report.built {
            self.emit_chart(EventKind::CHART_BUILT, ug);
        }
        report
    }

    fn emit_chart(&self, kind: EventKind, user_group_id: &str) {
        let Some(entry) = self.charts.get(user_group_id) else {
            return;
        };
        let mut ev = ViewerEvent::new(kind);
        ev.chart = Some(ChartMeta {
            user_group_id: entry.user_group_id.clone(),
            group: entry.source_group_id.clone(),
            chart_type: entry.chart_type,
        });
        self.events.emit(ev);
    }

    pub(crate) fn teardown(&mut self, user_group_id: &str) -> bool {
        let meta = self.charts.get(user_group_id).map(|e| ChartMeta {
            user_group_id: e.user_group_id.clone(),
            group: e.source_group_id.clone(),
            chart_type: e.chart_type,
        });
        let removed = teardown_chart(
            user_group_id,
            &mut self.charts,
            &mut self.host,
            &mut self.listeners,
            &mut self.resize,
        );
        if removed {
            let mut ev = ViewerEvent::new(EventKind::CHART_REMOVED);
            ev.chart = meta;
            self.events.emit(ev);
        }
        removed
    }

    fn teardown_all(&mut self) {
        for ug in self.charts.user_group_ids() {
            self.teardown(&ug);
        }
    }

    /// Tear down and re-render every chart.
    pub fn rebuild_all(&mut self) -> RenderReport {
        self.teardown_all();
        self.render(None)
    }

    /// Tear down and re-render the charts of the given groups. Falls back to
    /// a full rebuild when the shared axis count changed.
    pub fn rebuild_groups(&mut self, keys: &[String]) -> RenderReport {
        let snapshot = self.channels.snapshot();
        let groups = plan_groups(&snapshot, &self.recording);
        if effective_max_axes(&self.config, &groups, &snapshot, &self.recording) != self.max_y_axes {
            return self.rebuild_all();
        }
        let doomed: Vec<String> = self
            .charts
            .list()
            .iter()
            .filter(|e| keys.contains(&e.source_group_id))
            .map(|e| e.user_group_id.clone())
            .collect();
        for ug in doomed {
            self.teardown(&ug);
        }
        self.render(Some(keys))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Cursors
    // ─────────────────────────────────────────────────────────────────────

    /// Pixel click on a chart.
    pub fn click(&mut self, user_group_id: &str, px: f32) -> Option<ToggleOutcome> {
        if !self.listeners.has(user_group_id, &ListenerKind::Click) {
            return None;
        }
        let (x, span) = {
            let plot = self.charts.get(user_group_id)?.plot.borrow();
            (plot.pos_to_val(px, X_SCALE), plot.model().x_range().span())
        };
        self.click_at(x, span)
    }

    /// Click at data position `x` on a chart whose visible x range spans `span`.
    pub fn click_at(&mut self, x: f64, span: f64) -> Option<ToggleOutcome> {
        let outcome = self
            .cursors
            .borrow_mut()
            .toggle_at(x, span, self.config.cursor_tolerance_fraction)?;
        let (kind, at) = match outcome {
            ToggleOutcome::Added(x) => (EventKind::CURSOR_ADDED, x),
            ToggleOutcome::Removed(x) => (EventKind::CURSOR_REMOVED, x),
        };
        let mut ev = ViewerEvent::new(kind);
        ev.cursor = Some(CursorMeta {
            x: at,
            cursors: self.cursors.borrow().positions().to_vec(),
        });
        self.events.emit(ev);
        self.queue_redraw_all();
        self.emit_phasor(nearest_sample(&self.recording.data.time, at));
        if let Some(report) = self.delta_report() {
            let mut ev = ViewerEvent::new(EventKind::DELTA_UPDATE);
            ev.delta = Some(report);
            self.events.emit(ev);
        }
        Some(outcome)
    }

    fn emit_phasor(&self, time_index: usize) {
        let x = self.recording.data.time.get(time_index).copied().unwrap_or(0.0);
        let mut ev = ViewerEvent::new(EventKind::PHASOR_UPDATE);
        ev.phasor = Some(PhasorMeta { time_index, x });
        self.events.emit(ev);
    }

    /// Delta table between the first two cursors over every charted line series.
    pub fn delta_report(&self) -> Option<DeltaReport> {
        let (xa, xb) = self.cursors.borrow().first_pair()?;
        let snapshot = self.channels.snapshot();
        let data = &self.recording.data;
        let mut rows: Vec<(String, String, Vec<f64>)> = Vec::new();
        for entry in self.charts.list() {
            for (n, origin) in entry.indices.iter().enumerate() {
                if origin.is_digital() {
                    continue;
                }
                let (kind, index, samples) = match origin {
                    SeriesOrigin::Analog { index, .. } => (ChannelKind::Analog, *index, data.analog_data.get(*index)),
                    SeriesOrigin::Computed { index, .. } => {
                        (ChannelKind::Computed, *index, data.computed_data.get(*index))
                    }
                    _ => continue,
                };
                let Some(samples) = samples else { continue };
                let table = snapshot.table(kind);
                let values = display_values(
                    samples,
                    table.scales.get(index).copied().unwrap_or(1.0),
                    table.inverts.get(index).copied().unwrap_or(false),
                );
                let label = entry.channels.get(n).cloned().unwrap_or_default();
                let color = entry.colors.get(n).cloned().unwrap_or_default();
                rows.push((label, color, values));
            }
        }
        let series: Vec<DeltaSeries<'_>> = rows
            .iter()
            .map(|(label, color, values)| DeltaSeries {
                label: label.clone(),
                color: color.clone(),
                times: &data.time,
                values,
            })
            .collect();
        Some(delta(xa, xb, &series))
    }

    pub(crate) fn queue_redraw(&mut self, user_group_id: &str) {
        let Some(entry) = self.charts.get(user_group_id) else {
            return;
        };
        let plot = Rc::clone(&entry.plot);
        let key = format!("redraw:{user_group_id}");
        self.queue.queue_update(
            user_group_id,
            move || {
                let mut p = plot.borrow_mut();
                if !p.is_destroyed() {
                    p.redraw(false);
                }
            },
            Some(&key),
        );
    }

    fn queue_redraw_all(&mut self) {
        for ug in self.charts.user_group_ids() {
            self.queue_redraw(&ug);
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Frame loop
    // ─────────────────────────────────────────────────────────────────────

    /// Run the pending frame's queued updates.
    pub fn frame(&mut self) -> usize {
        match self.queue.pending_frame() {
            Some(h) => self.queue.on_frame(h),
            None => 0,
        }
    }

    /// Force queued updates now.
    pub fn flush(&mut self) -> usize {
        self.queue.flush()
    }

    /// Container size change observed by the host.
    pub fn resize(&mut self, user_group_id: &str, size: PlotSize, now: Instant) {
        if self.listeners.has(user_group_id, &ListenerKind::Resize) {
            self.resize.request(user_group_id, size, now);
        }
    }

    /// Apply debounced resizes and auto-hide progress.
    pub fn tick(&mut self, now: Instant) {
        self.progress.tick(now);
        for (ug, size) in self.resize.due(now) {
            let Some(entry) = self.charts.get(&ug) else {
                continue;
            };
            if self.host.resize(entry.container, size) {
                let mut plot = entry.plot.borrow_mut();
                plot.set_size(size);
                plot.redraw(false);
            }
        }
    }

    pub fn on_visibility_hidden(&mut self) -> usize {
        self.queue.on_visibility_hidden()
    }

    /// Release everything chart-scoped; the session is inert afterwards.
    pub fn shutdown(&mut self) {
        self.queue.on_unload();
        self.teardown_all();
        self.listeners.clear();
    }

    // ─────────────────────────────────────────────────────────────────────
    // History, theme, export
    // ─────────────────────────────────────────────────────────────────────

    pub fn can_undo(&self) -> bool {
        self.channels.state().can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.channels.state().can_redo()
    }

    pub fn undo(&mut self) -> bool {
        match self.channels.state_mut().undo() {
            Some(changes) => {
                self.apply_replayed(&changes);
                true
            }
            None => false,
        }
    }

    pub fn redo(&mut self) -> bool {
        match self.channels.state_mut().redo() {
            Some(changes) => {
                self.apply_replayed(&changes);
                true
            }
            None => false,
        }
    }

    pub fn set_theme(&mut self, theme: Theme) {
        self.theme = theme;
        theme.activate();
        self.renderer.set_cursor_color(cursor_color(theme));
        if let Err(e) = save_json(self.settings.as_mut(), &self.config.theme_key, &theme) {
            tracing::warn!("theme not persisted: {e}");
        }
        self.bus.broadcast(&OutboundMessage::ThemeChange {
            theme,
            colors: theme.colors(),
        });
        let mut ev = ViewerEvent::new(EventKind::THEME_CHANGED);
        ev.theme = Some(theme);
        self.events.emit(ev);
        self.rebuild_all();
    }

    /// Broadcast the current computed channel list to peer windows.
    pub(crate) fn broadcast_computed(&self) {
        self.bus.broadcast(&OutboundMessage::ComputedChannelsUpdated {
            computed_channels: stored_from_recording(&self.recording),
        });
    }

    pub fn export_csv(&self, on_yield: impl FnMut(usize)) -> String {
        export::to_csv(&self.recording, &self.channels.snapshot(), self.config.csv_yield_rows, on_yield)
    }

    pub fn export_comtrade(&self, format: DatFormat) -> Result<ComtradeExport> {
        export::to_comtrade(&self.recording, &self.channels.snapshot(), format)
    }
}
