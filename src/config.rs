//! Tunables shared across the viewer core.
//!
//! The configuration is a plain serde struct; it can be persisted as YAML
//! next to the user's other settings and loaded back on start.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Lower bound for the chart resize debounce.
pub const MIN_RESIZE_DEBOUNCE_MS: u64 = 50;

/// Viewer-wide configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    /// Fraction of the visible x-range within which a click removes an existing cursor.
    pub cursor_tolerance_fraction: f64,
    /// Debounce for container resizes (clamped to at least 50 ms).
    pub resize_debounce_ms: u64,
    /// Inbound message handlers slower than this are logged with timings.
    pub slow_handler_ms: u64,
    /// Grace delay before a completed progress indicator hides itself.
    pub progress_hide_delay_ms: u64,
    /// Vertical distance between stacked digital signals.
    pub digital_signal_offset: f64,
    /// Height of a single HIGH rectangle in the digital overlay.
    pub digital_fill_height: f64,
    /// How many leading samples are inspected when validating `madeFrom`.
    pub made_from_probe_samples: usize,
    /// CSV export yields to the caller every this many rows.
    pub csv_yield_rows: usize,
    /// Storage key holding persisted computed channels.
    pub storage_key: String,
    /// Storage key holding the selected theme.
    pub theme_key: String,
    /// Explicit number of Y axes per chart. `None` derives the maximum over all groups.
    pub max_y_axes: Option<usize>,
    /// Put every series on axis 0 regardless of unit.
    pub single_y_axis: bool,
    /// Initial chart container width in logical pixels.
    pub chart_width: f32,
    /// Initial chart container height in logical pixels.
    pub chart_height: f32,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            cursor_tolerance_fraction: 0.02,
            resize_debounce_ms: MIN_RESIZE_DEBOUNCE_MS,
            slow_handler_ms: 30,
            progress_hide_delay_ms: 600,
            digital_signal_offset: 1.5,
            digital_fill_height: 1.0,
            made_from_probe_samples: 1000,
            csv_yield_rows: 5000,
            storage_key: "comtrade.computedChannels".to_string(),
            theme_key: "comtrade.theme".to_string(),
            max_y_axes: None,
            single_y_axis: false,
            chart_width: 1200.0,
            chart_height: 260.0,
        }
    }
}

impl ViewerConfig {
    pub fn resize_debounce(&self) -> Duration {
        Duration::from_millis(self.resize_debounce_ms.max(MIN_RESIZE_DEBOUNCE_MS))
    }

    pub fn slow_handler_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_handler_ms)
    }

    pub fn progress_hide_delay(&self) -> Duration {
        Duration::from_millis(self.progress_hide_delay_ms)
    }

    /// Serialize to YAML.
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Parse from YAML; missing keys fall back to defaults.
    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Save the configuration to a YAML file.
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_yaml()?)?;
        Ok(())
    }

    /// Load the configuration from a YAML file.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_yaml_uses_defaults() {
        let cfg = ViewerConfig::from_yaml("single_y_axis: true\nmax_y_axes: 3\n").unwrap();
        assert!(cfg.single_y_axis);
        assert_eq!(cfg.max_y_axes, Some(3));
        assert_eq!(cfg.csv_yield_rows, 5000);
        assert_eq!(cfg.storage_key, "comtrade.computedChannels");
    }

    #[test]
    fn resize_debounce_never_below_minimum() {
        let cfg = ViewerConfig {
            resize_debounce_ms: 10,
            ..Default::default()
        };
        assert_eq!(cfg.resize_debounce(), Duration::from_millis(50));
    }

    #[test]
    fn yaml_round_trip_keeps_values() {
        let cfg = ViewerConfig {
            cursor_tolerance_fraction: 0.05,
            chart_height: 300.0,
            ..Default::default()
        };
        let back = ViewerConfig::from_yaml(&cfg.to_yaml().unwrap()).unwrap();
        assert_eq!(back, cfg);
    }
}
