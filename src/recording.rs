//! Parsed recording shapes consumed by the core.
//!
//! `.cfg`/`.dat` parsing happens elsewhere; this module only fixes the shape
//! of its output ([`Config`], [`Data`]) and validates what the core relies
//! on: aligned sample lengths and truthful `madeFrom` tags on computed
//! channels.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::error::{Result, ViewerError};

fn one() -> f64 {
    1.0
}

/// Analog or digital channel descriptor from the `.cfg` file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChannelDescriptor {
    pub id: String,
    pub unit: String,
    pub phase: String,
    pub component: String,
    #[serde(default = "one")]
    pub multiplier: f64,
    pub offset: f64,
    pub min: f64,
    pub max: f64,
    #[serde(default = "one")]
    pub primary: f64,
    #[serde(default = "one")]
    pub secondary: f64,
    pub reference: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub normal_state: Option<u8>,
}

impl Default for ChannelDescriptor {
    fn default() -> Self {
        Self {
            id: String::new(),
            unit: String::new(),
            phase: String::new(),
            component: String::new(),
            multiplier: 1.0,
            offset: 0.0,
            min: 0.0,
            max: 0.0,
            primary: 1.0,
            secondary: 1.0,
            reference: "P".to_string(),
            normal_state: None,
        }
    }
}

impl ChannelDescriptor {
    pub fn new(id: &str, unit: &str) -> Self {
        Self {
            id: id.to_string(),
            unit: unit.to_string(),
            ..Default::default()
        }
    }
}

/// Sample family a computed channel was derived from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MadeFrom {
    #[default]
    Analog,
    Digital,
}

/// Metadata of a user-defined computed channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ComputedChannelMeta {
    pub id: String,
    pub name: String,
    pub equation: String,
    pub unit: String,
    pub group: String,
    pub color: String,
    pub made_from: MadeFrom,
    pub sample_count: usize,
}

impl Default for ComputedChannelMeta {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            equation: String::new(),
            unit: String::new(),
            group: DEFAULT_COMPUTED_GROUP.to_string(),
            color: String::new(),
            made_from: MadeFrom::Analog,
            sample_count: 0,
        }
    }
}

/// Group key used for computed channels that do not name one.
pub const DEFAULT_COMPUTED_GROUP: &str = "Computed";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SamplingRate {
    pub rate: f64,
    pub end_sample: u64,
}

/// `.dat` encodings. `Binary32` is import-only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DatFormat {
    #[default]
    Ascii,
    Binary,
    Binary32,
    Float32,
    Float64,
}

impl DatFormat {
    /// Keyword written on the file-type line of a `.cfg`.
    pub fn cfg_keyword(self) -> &'static str {
        match self {
            DatFormat::Ascii => "ASCII",
            DatFormat::Binary => "BINARY",
            DatFormat::Binary32 => "BINARY32",
            DatFormat::Float32 => "FLOAT32",
            DatFormat::Float64 => "FLOAT64",
        }
    }
}

/// Parsed `.cfg` content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub station_name: String,
    pub rec_dev_id: String,
    pub rev_year: u16,
    pub analog_channels: Vec<ChannelDescriptor>,
    pub digital_channels: Vec<ChannelDescriptor>,
    pub computed_channels: Vec<ComputedChannelMeta>,
    pub sampling_rates: Vec<SamplingRate>,
    pub line_frequency: f64,
    pub start_timestamp: Option<NaiveDateTime>,
    pub trigger_timestamp: Option<NaiveDateTime>,
    pub timemult: f64,
    pub file_type: DatFormat,
    pub time_code: String,
    pub local_code: String,
    pub tmq_code: String,
    pub leap_sec: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            station_name: String::new(),
            rec_dev_id: String::new(),
            rev_year: 2013,
            analog_channels: Vec::new(),
            digital_channels: Vec::new(),
            computed_channels: Vec::new(),
            sampling_rates: Vec::new(),
            line_frequency: 50.0,
            start_timestamp: None,
            trigger_timestamp: None,
            timemult: 1.0,
            file_type: DatFormat::Ascii,
            time_code: String::new(),
            local_code: String::new(),
            tmq_code: String::new(),
            leap_sec: String::new(),
        }
    }
}

/// Parsed `.dat` content, aligned to the channel lists of [`Config`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Data {
    #[serde(with = "sample_rows::column")]
    pub time: Vec<f64>,
    #[serde(with = "sample_rows")]
    pub analog_data: Vec<Vec<f64>>,
    #[serde(with = "sample_rows")]
    pub digital_data: Vec<Vec<f64>>,
    #[serde(with = "sample_rows")]
    pub computed_data: Vec<Vec<f64>>,
}

/// A loaded configuration and its samples.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Recording {
    pub config: Config,
    pub data: Data,
}

/// True when a sample counts as HIGH for digital purposes.
#[inline]
pub fn is_high(v: f64) -> bool {
    (v - 1.0).abs() < f64::EPSILON
}

/// True when every finite sample is 0 or 1.
pub fn is_binary(values: &[f64]) -> bool {
    values
        .iter()
        .filter(|v| v.is_finite())
        .all(|v| *v == 0.0 || *v == 1.0)
}

impl Recording {
    pub fn new(config: Config, data: Data) -> Self {
        Self { config, data }
    }

    /// Reject pairs the core cannot render: missing sample rows or rows
    /// whose length disagrees with the time axis.
    pub fn validate(&self) -> Result<()> {
        let cfg = &self.config;
        let data = &self.data;
        if cfg.sampling_rates.is_empty() {
            return Err(ViewerError::Input("configuration has no sampling rates".into()));
        }
        if data.analog_data.len() != cfg.analog_channels.len() {
            return Err(ViewerError::Input(format!(
                "{} analog channels declared but {} sample rows present",
                cfg.analog_channels.len(),
                data.analog_data.len()
            )));
        }
        if data.digital_data.len() != cfg.digital_channels.len() {
            return Err(ViewerError::Input(format!(
                "{} digital channels declared but {} sample rows present",
                cfg.digital_channels.len(),
                data.digital_data.len()
            )));
        }
        let n = data.time.len();
        for (label, rows) in [("analog", &data.analog_data), ("digital", &data.digital_data)] {
            if let Some((i, row)) = rows.iter().enumerate().find(|(_, r)| r.len() != n) {
                return Err(ViewerError::Input(format!(
                    "{label} channel {i} has {} samples, time axis has {n}",
                    row.len()
                )));
            }
        }
        Ok(())
    }

    /// Bring computed channel metadata and sample rows into a consistent
    /// shape: pad missing rows with empty (not yet evaluated) sequences,
    /// drop surplus rows, clear rows whose length disagrees with the time
    /// axis, refresh `sample_count`, and coerce `madeFrom`.
    ///
    /// Returns the ids of channels whose `madeFrom` was coerced.
    pub fn normalize_computed(&mut self, probe: usize) -> Vec<String> {
        let samples = self.data.time.len();
        let metas = &mut self.config.computed_channels;
        let rows = &mut self.data.computed_data;
        if rows.len() > metas.len() {
            tracing::warn!(
                "dropping {} computed sample rows without channel metadata",
                rows.len() - metas.len()
            );
        }
        rows.resize_with(metas.len(), Vec::new);
        let mut coerced = Vec::new();
        for (meta, row) in metas.iter_mut().zip(rows.iter_mut()) {
            *row = fit_computed_row(std::mem::take(row), samples, &meta.id);
            meta.sample_count = row.len();
            if meta.group.is_empty() {
                meta.group = DEFAULT_COMPUTED_GROUP.to_string();
            }
            if coerce_made_from(&mut meta.made_from, row, probe) {
                coerced.push(meta.id.clone());
            }
        }
        coerced
    }

    /// Sample row for a computed channel, `None` when out of range.
    pub fn computed_row(&self, index: usize) -> Option<&[f64]> {
        self.data.computed_data.get(index).map(Vec::as_slice)
    }
}

/// A computed row is either empty (not yet evaluated) or one value per
/// time sample. Rows of any other length are discarded.
pub fn fit_computed_row(values: Vec<f64>, samples: usize, id: &str) -> Vec<f64> {
    if values.is_empty() || values.len() == samples {
        return values;
    }
    tracing::warn!(
        "computed channel {id} has {} samples, time axis has {samples}; marking it unevaluated",
        values.len()
    );
    Vec::new()
}

/// Downgrade a declared `digital` tag to `analog` when the leading `probe`
/// samples are not exclusively 0/1. Returns true if the tag changed.
pub fn coerce_made_from(made_from: &mut MadeFrom, values: &[f64], probe: usize) -> bool {
    if *made_from != MadeFrom::Digital {
        return false;
    }
    let prefix = &values[..values.len().min(probe)];
    if is_binary(prefix) {
        return false;
    }
    tracing::warn!("computed channel declared digital carries non-binary samples; treating as analog");
    *made_from = MadeFrom::Analog;
    true
}

/// Serde helpers for sample rows: numbers, booleans and `null` (NaN) are all
/// accepted on input; non-finite values serialize as `null`.
pub(crate) mod sample_rows {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawSample {
        Num(f64),
        Bool(bool),
    }

    fn to_f64(raw: Option<RawSample>) -> f64 {
        match raw {
            Some(RawSample::Num(v)) => v,
            Some(RawSample::Bool(true)) => 1.0,
            Some(RawSample::Bool(false)) => 0.0,
            None => f64::NAN,
        }
    }

    fn finite(v: &f64) -> Option<f64> {
        v.is_finite().then_some(*v)
    }

    pub fn serialize<S: Serializer>(rows: &[Vec<f64>], s: S) -> Result<S::Ok, S::Error> {
        let out: Vec<Vec<Option<f64>>> = rows.iter().map(|r| r.iter().map(finite).collect()).collect();
        out.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Vec<f64>>, D::Error> {
        let raw: Vec<Vec<Option<RawSample>>> = Vec::deserialize(d)?;
        Ok(raw
            .into_iter()
            .map(|row| row.into_iter().map(to_f64).collect())
            .collect())
    }

    pub mod column {
        use super::*;

        pub fn serialize<S: Serializer>(values: &[f64], s: S) -> Result<S::Ok, S::Error> {
            let out: Vec<Option<f64>> = values.iter().map(finite).collect();
            out.serialize(s)
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<f64>, D::Error> {
            let raw: Vec<Option<RawSample>> = Vec::deserialize(d)?;
            Ok(raw.into_iter().map(to_f64).collect())
        }
    }

    pub mod optional_column {
        use super::*;

        pub fn serialize<S: Serializer>(values: &Option<Vec<f64>>, s: S) -> Result<S::Ok, S::Error> {
            let out: Option<Vec<Option<f64>>> =
                values.as_ref().map(|v| v.iter().map(finite).collect());
            out.serialize(s)
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<f64>>, D::Error> {
            let raw: Option<Vec<Option<RawSample>>> = Option::deserialize(d)?;
            Ok(raw.map(|row| row.into_iter().map(to_f64).collect()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_channel_recording() -> Recording {
        let config = Config {
            analog_channels: vec![ChannelDescriptor::new("VA", "kV")],
            digital_channels: vec![ChannelDescriptor::new("TRIP", "")],
            sampling_rates: vec![SamplingRate { rate: 1000.0, end_sample: 3 }],
            ..Default::default()
        };
        let data = Data {
            time: vec![0.0, 0.001, 0.002],
            analog_data: vec![vec![1.0, 2.0, 3.0]],
            digital_data: vec![vec![0.0, 1.0, 1.0]],
            computed_data: Vec::new(),
        };
        Recording::new(config, data)
    }

    #[test]
    fn validate_accepts_aligned_rows() {
        assert!(two_channel_recording().validate().is_ok());
    }

    #[test]
    fn validate_rejects_length_mismatch() {
        let mut rec = two_channel_recording();
        rec.data.analog_data[0].pop();
        let err = rec.validate().unwrap_err();
        assert!(err.is_input_error());
    }

    #[test]
    fn digital_rows_accept_booleans_and_nulls() {
        let json = r#"{"time":[0,1,2],"digitalData":[[true,false,null]]}"#;
        let data: Data = serde_json::from_str(json).unwrap();
        assert_eq!(data.digital_data[0][0], 1.0);
        assert_eq!(data.digital_data[0][1], 0.0);
        assert!(data.digital_data[0][2].is_nan());
    }

    #[test]
    fn declared_digital_with_analog_samples_is_coerced() {
        let mut rec = two_channel_recording();
        rec.config.computed_channels.push(ComputedChannelMeta {
            id: "c1".into(),
            made_from: MadeFrom::Digital,
            ..Default::default()
        });
        rec.data.computed_data.push(vec![0.0, 0.5, 1.0]);
        let coerced = rec.normalize_computed(1000);
        assert_eq!(coerced, vec!["c1".to_string()]);
        assert_eq!(rec.config.computed_channels[0].made_from, MadeFrom::Analog);
        assert_eq!(rec.config.computed_channels[0].sample_count, 3);
    }

    #[test]
    fn computed_rows_of_the_wrong_length_are_unevaluated() {
        let mut rec = two_channel_recording();
        rec.config.computed_channels.push(ComputedChannelMeta {
            id: "short".into(),
            ..Default::default()
        });
        rec.config.computed_channels.push(ComputedChannelMeta {
            id: "full".into(),
            ..Default::default()
        });
        rec.data.computed_data = vec![vec![1.0, 2.0], vec![1.0, 2.0, 3.0], vec![9.0, 9.0, 9.0]];
        rec.normalize_computed(10);
        assert_eq!(rec.data.computed_data.len(), 2);
        assert!(rec.data.computed_data[0].is_empty());
        assert_eq!(rec.config.computed_channels[0].sample_count, 0);
        assert_eq!(rec.data.computed_data[1], vec![1.0, 2.0, 3.0]);
        assert_eq!(rec.config.computed_channels[1].sample_count, 3);
    }

    #[test]
    fn normalize_pads_missing_computed_rows() {
        let mut rec = two_channel_recording();
        rec.config.computed_channels.push(ComputedChannelMeta::default());
        rec.normalize_computed(10);
        assert_eq!(rec.data.computed_data.len(), 1);
        assert!(rec.data.computed_data[0].is_empty());
    }
}
