#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;

use comtrade_view::host::ChartContainer;
use comtrade_view::plot::{CanvasPlot, PlotBackend, PlotData, PlotModel, PlotOptions, SeriesPatch};
use comtrade_view::recording::{ChannelDescriptor, Config, Data, Recording, SamplingRate};
use comtrade_view::{LoadMetadata, MemoryStore, Result, Session, ViewerConfig};

/// Calls observed on plots created by [`LoggingBackend`].
#[derive(Debug, Default)]
pub struct PlotLog {
    /// Titles (group keys) of created plots, in creation order.
    pub created: Vec<String>,
    pub set_series: Vec<(String, usize, SeriesPatch)>,
    pub destroyed: Vec<String>,
}

pub type SharedLog = Rc<RefCell<PlotLog>>;

pub struct LoggedPlot {
    model: PlotModel,
    log: SharedLog,
}

impl CanvasPlot for LoggedPlot {
    fn model(&self) -> &PlotModel {
        &self.model
    }

    fn model_mut(&mut self) -> &mut PlotModel {
        &mut self.model
    }

    fn set_series(&mut self, idx: usize, patch: &SeriesPatch) {
        self.log
            .borrow_mut()
            .set_series
            .push((self.model.title().to_string(), idx, patch.clone()));
        self.model.set_series(idx, patch);
    }

    fn destroy(&mut self) {
        if !self.model.is_destroyed() {
            self.log.borrow_mut().destroyed.push(self.model.title().to_string());
        }
        self.model.destroy();
    }
}

#[derive(Default)]
pub struct LoggingBackend {
    pub log: SharedLog,
}

impl PlotBackend for LoggingBackend {
    fn create(&mut self, opts: PlotOptions, data: PlotData, _container: &ChartContainer) -> Result<Box<dyn CanvasPlot>> {
        let title = opts.title.clone();
        let model = PlotModel::new(opts, data)?;
        self.log.borrow_mut().created.push(title);
        Ok(Box::new(LoggedPlot {
            model,
            log: Rc::clone(&self.log),
        }))
    }
}

pub fn times(n: usize, step: f64) -> Vec<f64> {
    (0..n).map(|i| i as f64 * step).collect()
}

/// A recording with the given analog `(id, unit, samples)` and digital
/// `(id, samples)` channels over a shared time axis.
pub fn recording(time: Vec<f64>, analog: &[(&str, &str, Vec<f64>)], digital: &[(&str, Vec<f64>)]) -> Recording {
    let n = time.len();
    let config = Config {
        station_name: "SUB-1".into(),
        rec_dev_id: "REL-7".into(),
        analog_channels: analog.iter().map(|(id, unit, _)| ChannelDescriptor::new(id, unit)).collect(),
        digital_channels: digital.iter().map(|(id, _)| ChannelDescriptor::new(id, "")).collect(),
        sampling_rates: vec![SamplingRate {
            rate: 1000.0,
            end_sample: n as u64,
        }],
        ..Default::default()
    };
    let data = Data {
        time,
        analog_data: analog.iter().map(|(_, _, v)| v.clone()).collect(),
        digital_data: digital.iter().map(|(_, v)| v.clone()).collect(),
        computed_data: Vec::new(),
    };
    Recording::new(config, data)
}

/// Three kV phase voltages that auto-group into `G0`.
pub fn three_phase() -> Recording {
    let t = times(4, 0.001);
    recording(
        t,
        &[
            ("VA", "kV", vec![1.0, 2.0, 3.0, 4.0]),
            ("VB", "kV", vec![2.0, 3.0, 4.0, 5.0]),
            ("VC", "kV", vec![3.0, 4.0, 5.0, 6.0]),
        ],
        &[],
    )
}

pub struct Harness {
    pub session: Session<LoggingBackend>,
    pub log: SharedLog,
    pub store: MemoryStore,
}

pub fn harness(config: ViewerConfig) -> Harness {
    harness_with_store(config, MemoryStore::new())
}

pub fn harness_with_store(config: ViewerConfig, store: MemoryStore) -> Harness {
    let backend = LoggingBackend::default();
    let log = Rc::clone(&backend.log);
    let session = Session::new(config, backend, store.clone());
    Harness { session, log, store }
}

pub fn load(h: &mut Harness, rec: Recording) {
    h.session
        .load(
            rec,
            LoadMetadata {
                filenames: vec!["test.cfg".into()],
                file_count: 1,
                is_merged: false,
            },
        )
        .expect("recording loads");
}
