//! CSV and COMTRADE writers for the loaded recording.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;

use crate::error::{Result, ViewerError};
use crate::recording::{is_high, DatFormat, Recording};
use crate::state::channels::{ChannelKind, ChannelSnapshot};

fn quote(text: &str) -> String {
    format!("\"{}\"", text.replace('"', "\"\""))
}

fn number_cell(v: Option<f64>) -> String {
    match v {
        Some(v) if v.is_finite() => v.to_string(),
        _ => String::new(),
    }
}

struct CsvColumn<'a> {
    label: &'a str,
    equation: &'a str,
    unit: &'a str,
    samples: &'a [f64],
}

/// Render every channel as CSV: `Time` followed by
/// `<ch>_Equation, <ch>_Data, <ch>_Unit` per channel. `on_yield` is called
/// with the number of rows written after every `chunk` rows.
pub fn to_csv(
    recording: &Recording,
    snapshot: &ChannelSnapshot,
    chunk: usize,
    mut on_yield: impl FnMut(usize),
) -> String {
    let data = &recording.data;
    let mut columns = Vec::new();
    for kind in ChannelKind::ALL {
        let table = snapshot.table(kind);
        let rows = match kind {
            ChannelKind::Analog => &data.analog_data,
            ChannelKind::Digital => &data.digital_data,
            ChannelKind::Computed => &data.computed_data,
        };
        for (i, label) in table.labels.iter().enumerate() {
            columns.push(CsvColumn {
                label,
                equation: table.equations.get(i).map_or("", String::as_str),
                unit: table.units.get(i).map_or("", String::as_str),
                samples: rows.get(i).map_or(&[][..], Vec::as_slice),
            });
        }
    }

    let mut out = String::from("\"Time\"");
    for c in &columns {
        for suffix in ["Equation", "Data", "Unit"] {
            out.push(',');
            out.push_str(&quote(&format!("{}_{suffix}", c.label)));
        }
    }
    out.push('\n');

    let chunk = chunk.max(1);
    for (row, t) in data.time.iter().enumerate() {
        out.push_str(&number_cell(Some(*t)));
        for c in &columns {
            let _ = write!(
                out,
                ",{},{},{}",
                quote(c.equation),
                number_cell(c.samples.get(row).copied()),
                quote(c.unit)
            );
        }
        out.push('\n');
        if (row + 1) % chunk == 0 {
            on_yield(row + 1);
        }
    }
    out
}

/// A `.cfg`/`.dat` pair.
#[derive(Debug, Clone, PartialEq)]
pub struct ComtradeExport {
    pub format: DatFormat,
    pub cfg: String,
    pub dat: Vec<u8>,
}

impl ComtradeExport {
    /// Write `<stem>.cfg` and `<stem>.dat` into `dir`.
    pub fn save(&self, dir: &Path, stem: &str) -> Result<(PathBuf, PathBuf)> {
        let cfg_path = dir.join(format!("{stem}.cfg"));
        let dat_path = dir.join(format!("{stem}.dat"));
        std::fs::write(&cfg_path, &self.cfg)?;
        std::fs::write(&dat_path, &self.dat)?;
        tracing::info!("exported {} and {}", cfg_path.display(), dat_path.display());
        Ok((cfg_path, dat_path))
    }
}

/// Integer encoding of one analog channel: `value = raw * multiplier + offset`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct AnalogScaling {
    multiplier: f64,
    offset: f64,
    raw_limit: f64,
}

impl AnalogScaling {
    /// Fit the observed range onto `[-raw_limit, raw_limit]`.
    fn fit(samples: &[f64], raw_limit: f64) -> Self {
        let (min, max) = samples
            .iter()
            .filter(|v| v.is_finite())
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(*v), hi.max(*v)));
        if !min.is_finite() {
            return Self {
                multiplier: 1.0,
                offset: 0.0,
                raw_limit,
            };
        }
        let offset = (max + min) / 2.0;
        let half_span = (max - min) / 2.0;
        let multiplier = if half_span > 0.0 { half_span / raw_limit } else { 1.0 };
        Self {
            multiplier,
            offset,
            raw_limit,
        }
    }

    fn raw(&self, v: f64) -> Option<f64> {
        v.is_finite()
            .then(|| ((v - self.offset) / self.multiplier).round().clamp(-self.raw_limit, self.raw_limit))
    }
}

/// Missing-value marker of 16-bit binary samples.
const BINARY_MISSING: i16 = i16::MIN;

fn timestamp_line(ts: Option<NaiveDateTime>) -> String {
    ts.map_or_else(
        || "01/01/1970,00:00:00.000000".to_string(),
        |t| t.format("%d/%m/%Y,%H:%M:%S%.6f").to_string(),
    )
}

/// Timestamps in units of `timemult` microseconds relative to the first sample.
fn relative_timestamps(time: &[f64], timemult: f64) -> Vec<i32> {
    let t0 = time.first().copied().unwrap_or(0.0);
    let mult = if timemult > 0.0 { timemult } else { 1.0 };
    time.iter()
        .map(|t| {
            let ts = ((t - t0) * 1e6 / mult).round();
            ts.clamp(f64::from(i32::MIN), f64::from(i32::MAX)) as i32
        })
        .collect()
}

struct AnalogOut<'a> {
    id: &'a str,
    unit: &'a str,
    phase: &'a str,
    component: &'a str,
    primary: f64,
    secondary: f64,
    reference: &'a str,
    samples: &'a [f64],
}

/// Encode the recording as COMTRADE. Computed channels become extra analog
/// channels; labels and units come from the channel state.
pub fn to_comtrade(recording: &Recording, snapshot: &ChannelSnapshot, format: DatFormat) -> Result<ComtradeExport> {
    if format == DatFormat::Binary32 {
        return Err(ViewerError::InvalidValue {
            field: "format".into(),
            reason: "BINARY32 is not supported for export".into(),
        });
    }
    let cfg = &recording.config;
    let data = &recording.data;
    let label_unit = |kind: ChannelKind, i: usize| -> (String, String) {
        let table = snapshot.table(kind);
        (
            table.labels.get(i).cloned().unwrap_or_default(),
            table.units.get(i).cloned().unwrap_or_default(),
        )
    };
    let labels: Vec<(String, String)> = (0..cfg.analog_channels.len())
        .map(|i| label_unit(ChannelKind::Analog, i))
        .chain((0..cfg.computed_channels.len()).map(|i| label_unit(ChannelKind::Computed, i)))
        .collect();

    let mut analog: Vec<AnalogOut<'_>> = Vec::new();
    for (i, ch) in cfg.analog_channels.iter().enumerate() {
        analog.push(AnalogOut {
            id: if labels[i].0.is_empty() { &ch.id } else { &labels[i].0 },
            unit: if labels[i].1.is_empty() { &ch.unit } else { &labels[i].1 },
            phase: &ch.phase,
            component: &ch.component,
            primary: ch.primary,
            secondary: ch.secondary,
            reference: &ch.reference,
            samples: data.analog_data.get(i).map_or(&[][..], Vec::as_slice),
        });
    }
    let n_analog = cfg.analog_channels.len();
    for (i, meta) in cfg.computed_channels.iter().enumerate() {
        let (name, unit) = &labels[n_analog + i];
        analog.push(AnalogOut {
            id: if name.is_empty() { &meta.id } else { name },
            unit,
            phase: "",
            component: &meta.equation,
            primary: 1.0,
            secondary: 1.0,
            reference: "P",
            samples: data.computed_data.get(i).map_or(&[][..], Vec::as_slice),
        });
    }
    let digital: Vec<(String, &[f64], u8)> = cfg
        .digital_channels
        .iter()
        .enumerate()
        .map(|(i, ch)| {
            let name = snapshot.digital.labels.get(i).cloned().unwrap_or_else(|| ch.id.clone());
            let samples = data.digital_data.get(i).map_or(&[][..], Vec::as_slice);
            (name, samples, ch.normal_state.unwrap_or(0))
        })
        .collect();

    let raw_limit = match format {
        DatFormat::Binary => f64::from(i16::MAX),
        _ => f64::from(i32::MAX - 1),
    };
    let integer = matches!(format, DatFormat::Ascii | DatFormat::Binary);
    let scalings: Vec<AnalogScaling> = analog
        .iter()
        .map(|a| {
            if integer {
                AnalogScaling::fit(a.samples, raw_limit)
            } else {
                AnalogScaling {
                    multiplier: 1.0,
                    offset: 0.0,
                    raw_limit,
                }
            }
        })
        .collect();

    let n = data.time.len();
    let mut text = String::new();
    let _ = write!(text, "{},{},{}\r\n", cfg.station_name, cfg.rec_dev_id, cfg.rev_year);
    let _ = write!(
        text,
        "{},{}A,{}D\r\n",
        analog.len() + digital.len(),
        analog.len(),
        digital.len()
    );
    for (i, (a, s)) in analog.iter().zip(&scalings).enumerate() {
        let (min, max) = if integer {
            (-s.raw_limit, s.raw_limit)
        } else {
            a.samples
                .iter()
                .filter(|v| v.is_finite())
                .fold((0.0_f64, 0.0_f64), |(lo, hi), v| (lo.min(*v), hi.max(*v)))
        };
        let _ = write!(
            text,
            "{},{},{},{},{},{},{},0,{},{},{},{},{}\r\n",
            i + 1,
            a.id,
            a.phase,
            a.component,
            a.unit,
            s.multiplier,
            s.offset,
            min,
            max,
            a.primary,
            a.secondary,
            a.reference
        );
    }
    for (i, (name, _, normal)) in digital.iter().enumerate() {
        let _ = write!(text, "{},{},,,{}\r\n", analog.len() + i + 1, name, normal);
    }
    let _ = write!(text, "{}\r\n", cfg.line_frequency);
    if cfg.sampling_rates.is_empty() {
        let _ = write!(text, "0\r\n0,{n}\r\n");
    } else {
        let _ = write!(text, "{}\r\n", cfg.sampling_rates.len());
        for r in &cfg.sampling_rates {
            let _ = write!(text, "{},{}\r\n", r.rate, r.end_sample);
        }
    }
    let _ = write!(text, "{}\r\n", timestamp_line(cfg.start_timestamp));
    let _ = write!(text, "{}\r\n", timestamp_line(cfg.trigger_timestamp.or(cfg.start_timestamp)));
    let _ = write!(text, "{}\r\n", format.cfg_keyword());
    let timemult = if cfg.timemult > 0.0 { cfg.timemult } else { 1.0 };
    let _ = write!(text, "{timemult}\r\n");
    if cfg.rev_year >= 2013 {
        let _ = write!(text, "{},{}\r\n{},{}\r\n", cfg.time_code, cfg.local_code, cfg.tmq_code, cfg.leap_sec);
    }

    let stamps = relative_timestamps(&data.time, timemult);
    let dat = match format {
        DatFormat::Ascii => ascii_dat(&stamps, &analog, &scalings, &digital),
        _ => binary_dat(format, &stamps, &analog, &scalings, &digital),
    };
    tracing::debug!(
        "COMTRADE export: {} samples, {} analog, {} digital, {}",
        n,
        analog.len(),
        digital.len(),
        format.cfg_keyword()
    );
    Ok(ComtradeExport { format, cfg: text, dat })
}

fn ascii_dat(
    stamps: &[i32],
    analog: &[AnalogOut<'_>],
    scalings: &[AnalogScaling],
    digital: &[(String, &[f64], u8)],
) -> Vec<u8> {
    let mut out = String::new();
    for (row, ts) in stamps.iter().enumerate() {
        let _ = write!(out, "{},{}", row + 1, ts);
        for (a, s) in analog.iter().zip(scalings) {
            out.push(',');
            if let Some(raw) = a.samples.get(row).and_then(|v| s.raw(*v)) {
                let _ = write!(out, "{}", raw as i64);
            }
        }
        for (_, samples, _) in digital {
            let bit = samples.get(row).is_some_and(|v| is_high(*v));
            let _ = write!(out, ",{}", u8::from(bit));
        }
        out.push_str("\r\n");
    }
    out.into_bytes()
}

fn binary_dat(
    format: DatFormat,
    stamps: &[i32],
    analog: &[AnalogOut<'_>],
    scalings: &[AnalogScaling],
    digital: &[(String, &[f64], u8)],
) -> Vec<u8> {
    let words = digital.len().div_ceil(16);
    let width = match format {
        DatFormat::Float32 => 4,
        DatFormat::Float64 => 8,
        _ => 2,
    };
    let mut out = Vec::with_capacity(stamps.len() * (8 + analog.len() * width + words * 2));
    for (row, ts) in stamps.iter().enumerate() {
        out.extend_from_slice(&(row as u32 + 1).to_le_bytes());
        out.extend_from_slice(&ts.to_le_bytes());
        for (a, s) in analog.iter().zip(scalings) {
            let v = a.samples.get(row).copied().unwrap_or(f64::NAN);
            match format {
                DatFormat::Float32 => out.extend_from_slice(&(v as f32).to_le_bytes()),
                DatFormat::Float64 => out.extend_from_slice(&v.to_le_bytes()),
                _ => {
                    let raw = s.raw(v).map_or(BINARY_MISSING, |r| r as i16);
                    out.extend_from_slice(&raw.to_le_bytes());
                }
            }
        }
        for w in 0..words {
            let mut word: u16 = 0;
            for bit in 0..16 {
                let high = digital
                    .get(w * 16 + bit)
                    .and_then(|(_, samples, _)| samples.get(row))
                    .is_some_and(|v| is_high(*v));
                if high {
                    word |= 1 << bit;
                }
            }
            out.extend_from_slice(&word.to_le_bytes());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::{ChannelDescriptor, Config, Data};
    use crate::state::channels::ChannelModel;

    fn recording() -> Recording {
        Recording::new(
            Config {
                station_name: "SUB".into(),
                rec_dev_id: "R1".into(),
                analog_channels: vec![ChannelDescriptor::new("VA", "kV")],
                digital_channels: (0..17).map(|i| ChannelDescriptor::new(&format!("D{i}"), "")).collect(),
                ..Default::default()
            },
            Data {
                time: vec![0.0, 0.001],
                analog_data: vec![vec![-10.0, f64::NAN]],
                digital_data: (0..17).map(|i| vec![0.0, if i == 0 || i == 16 { 1.0 } else { 0.0 }]).collect(),
                computed_data: Vec::new(),
            },
        )
    }

    #[test]
    fn csv_blanks_non_finite_and_quotes_text() {
        let rec = recording();
        let snap = ChannelModel::tables_for(&rec);
        let mut yields = Vec::new();
        let csv = to_csv(&rec, &snap, 1, |n| yields.push(n));
        let mut lines = csv.lines();
        assert!(lines.next().unwrap().starts_with("\"Time\",\"VA_Equation\",\"VA_Data\",\"VA_Unit\""));
        assert!(lines.next().unwrap().starts_with("0,\"\",-10,\"kV\""));
        assert!(lines.next().unwrap().starts_with("0.001,\"\",,\"kV\""));
        assert_eq!(yields, vec![1, 2]);
    }

    #[test]
    fn binary_packs_digital_words_little_endian() {
        let rec = recording();
        let snap = ChannelModel::tables_for(&rec);
        let out = to_comtrade(&rec, &snap, DatFormat::Binary).unwrap();
        // 4 sample number + 4 timestamp + 2 analog + 2 words of digital
        let row = 4 + 4 + 2 + 4;
        assert_eq!(out.dat.len(), 2 * row);
        let second = &out.dat[row..];
        assert_eq!(u32::from_le_bytes(second[0..4].try_into().unwrap()), 2);
        assert_eq!(i32::from_le_bytes(second[4..8].try_into().unwrap()), 1000);
        assert_eq!(i16::from_le_bytes(second[8..10].try_into().unwrap()), i16::MIN);
        assert_eq!(u16::from_le_bytes(second[10..12].try_into().unwrap()), 1);
        assert_eq!(u16::from_le_bytes(second[12..14].try_into().unwrap()), 1);
        assert!(out.cfg.contains("18,1A,17D"));
        assert!(out.cfg.contains("BINARY"));
    }

    #[test]
    fn scaling_round_trips_within_a_step() {
        let s = AnalogScaling::fit(&[-5.0, 15.0], f64::from(i16::MAX));
        let raw = s.raw(12.5).unwrap();
        assert!((raw * s.multiplier + s.offset - 12.5).abs() <= s.multiplier);
        assert!(to_comtrade(&recording(), &ChannelSnapshot::default(), DatFormat::Binary32).is_err());
    }
}
