//! Y-axis planning by unit family.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Coarse unit classification; the declaration order is the canonical axis order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitFamily {
    Voltage,
    Current,
    Power,
    Frequency,
    Other,
}

const SI_PREFIXES: [&str; 6] = ["k", "m", "u", "µ", "g", "M"];

impl UnitFamily {
    pub const ORDER: [UnitFamily; 5] = [
        UnitFamily::Voltage,
        UnitFamily::Current,
        UnitFamily::Power,
        UnitFamily::Frequency,
        UnitFamily::Other,
    ];

    fn from_base(base: &str) -> Option<Self> {
        match base.to_ascii_lowercase().as_str() {
            "v" => Some(UnitFamily::Voltage),
            "a" => Some(UnitFamily::Current),
            "w" | "va" | "var" => Some(UnitFamily::Power),
            "hz" => Some(UnitFamily::Frequency),
            _ => None,
        }
    }

    /// Classify a unit string such as `kV`, `mA`, `MVAr` or `Hz`.
    pub fn from_unit(unit: &str) -> Self {
        let unit = unit.trim();
        if unit.is_empty() {
            return UnitFamily::Other;
        }
        if let Some(f) = Self::from_base(unit) {
            return f;
        }
        SI_PREFIXES
            .iter()
            .filter_map(|p| unit.strip_prefix(p))
            .find_map(Self::from_base)
            .unwrap_or(UnitFamily::Other)
    }

    pub fn rank(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            UnitFamily::Voltage => "voltage",
            UnitFamily::Current => "current",
            UnitFamily::Power => "power",
            UnitFamily::Frequency => "frequency",
            UnitFamily::Other => "other",
        }
    }
}

impl fmt::Display for UnitFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn axis_key(index: usize) -> String {
    format!("y{index}")
}

/// Per-series axis assignment for one chart.
#[derive(Debug, Clone, PartialEq)]
pub struct AxisPlan {
    /// Axis index for every input series, in input order.
    pub assignments: Vec<usize>,
    /// Family bound to each axis; `None` for axes kept only for alignment.
    pub axis_families: Vec<Option<UnitFamily>>,
    pub axis_count: usize,
}

impl AxisPlan {
    pub fn axis_of(&self, series: usize) -> Option<usize> {
        self.assignments.get(series).copied()
    }

    pub fn key_of(&self, series: usize) -> Option<String> {
        self.axis_of(series).map(axis_key)
    }
}

/// Plan Y axes for a chart's series.
///
/// `max_y_axes = None` selects the natural strategy (one axis per series).
/// Otherwise series are grouped by unit family and the chart materializes
/// `max(max_y_axes, distinct families)` axes. A single forced axis
/// (`single_y_axis` or `max_y_axes == Some(1)`) binds everything to axis 0.
pub fn plan_axes(labels: &[String], units: &[String], single_y_axis: bool, max_y_axes: Option<usize>) -> AxisPlan {
    let n = labels.len();
    let families: Vec<UnitFamily> = (0..n)
        .map(|i| UnitFamily::from_unit(units.get(i).map(String::as_str).unwrap_or("")))
        .collect();

    if single_y_axis || max_y_axes == Some(1) {
        let distinct: BTreeSet<UnitFamily> = families.iter().copied().collect();
        let family = (distinct.len() == 1).then(|| families[0]);
        return AxisPlan {
            assignments: vec![0; n],
            axis_families: vec![family],
            axis_count: 1,
        };
    }

    match max_y_axes {
        None => AxisPlan {
            assignments: (0..n).collect(),
            axis_families: if n == 0 {
                vec![None]
            } else {
                families.iter().map(|f| Some(*f)).collect()
            },
            axis_count: n.max(1),
        },
        Some(max) => {
            let observed: Vec<UnitFamily> = families.iter().copied().collect::<BTreeSet<_>>().into_iter().collect();
            let axis_count = max.max(observed.len()).max(1);
            // Families keep their canonical slot while it fits, so the same
            // family lands on the same axis in every chart.
            let fixed = observed.iter().all(|f| f.rank() < axis_count);
            let slot = |f: &UnitFamily| {
                if fixed {
                    f.rank()
                } else {
                    observed.iter().position(|o| o == f).unwrap_or(0)
                }
            };
            let assignments = families.iter().map(slot).collect();
            let mut axis_families: Vec<Option<UnitFamily>> = vec![None; axis_count];
            for f in &observed {
                axis_families[slot(f)] = Some(*f);
            }
            AxisPlan {
                assignments,
                axis_families,
                axis_count,
            }
        }
    }
}

/// Number of distinct families among `units`, used to derive a global
/// `max_y_axes` across charts.
pub fn distinct_families(units: &[String]) -> usize {
    units
        .iter()
        .map(|u| UnitFamily::from_unit(u))
        .collect::<BTreeSet<_>>()
        .len()
}

/// One Y scale of a chart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleDef {
    pub key: String,
    pub min: f64,
    pub max: f64,
    pub family: Option<UnitFamily>,
}

/// Auto-range each axis over the series bound to it; axes with no finite
/// data fall back to `[0, 1]`.
pub fn scale_defs(plan: &AxisPlan, series_values: &[&[f64]]) -> Vec<ScaleDef> {
    (0..plan.axis_count)
        .map(|axis| {
            let (min, max) = plan
                .assignments
                .iter()
                .zip(series_values)
                .filter(|(a, _)| **a == axis)
                .flat_map(|(_, values)| values.iter().copied())
                .filter(|v| v.is_finite())
                .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)));
            let (min, max) = if min > max {
                (0.0, 1.0)
            } else if min == max {
                (min - 1.0, max + 1.0)
            } else {
                (min, max)
            };
            ScaleDef {
                key: axis_key(axis),
                min,
                max,
                family: plan.axis_families.get(axis).copied().flatten(),
            }
        })
        .collect()
}

/// What the cheap update path has to preserve for a chart to stay valid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AxisStructure {
    pub axis_count: usize,
    pub families: Vec<Option<UnitFamily>>,
    pub digital: bool,
}

impl AxisStructure {
    pub fn of(plan: &AxisPlan, has_digital: bool) -> Self {
        Self {
            axis_count: plan.axis_count,
            families: plan.axis_families.clone(),
            digital: has_digital,
        }
    }
}
