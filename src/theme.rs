//! Light/dark themes and the trace colour palette.
//!
//! Colors travel through the channel state and the message protocol as
//! `#rrggbb` strings; the plotting side converts them to [`Color32`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;

use egui::{Color32, Context, Visuals};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

// Palette used when new channels are assigned a color. Replaced whenever a
// theme is applied.
static GLOBAL_PALETTE: Lazy<Mutex<Vec<Color32>>> = Lazy::new(|| Mutex::new(Theme::Dark.trace_colors()));

/// Copy of the current trace palette.
pub fn global_palette() -> Vec<Color32> {
    GLOBAL_PALETTE.lock().unwrap_or_else(|e| e.into_inner()).clone()
}

pub(crate) fn set_global_palette(new: Vec<Color32>) {
    if new.is_empty() {
        return;
    }
    *GLOBAL_PALETTE.lock().unwrap_or_else(|e| e.into_inner()) = new;
}

/// Palette colour for a channel index.
pub fn trace_color(index: usize) -> Color32 {
    let palette = global_palette();
    palette[index % palette.len()]
}

/// Palette colour for a channel index as `#rrggbb`.
pub fn trace_hex(index: usize) -> String {
    color_to_hex(trace_color(index))
}

pub fn color_to_hex(c: Color32) -> String {
    format!("#{:02x}{:02x}{:02x}", c.r(), c.g(), c.b())
}

/// Parse `#rgb`, `#rrggbb` or `#rrggbbaa` (leading `#` optional).
pub fn parse_hex(text: &str) -> Option<Color32> {
    let hex = text.trim().trim_start_matches('#');
    let byte = |s: &str| u8::from_str_radix(s, 16).ok();
    match hex.len() {
        3 => {
            let mut it = hex.chars().map(|c| c.to_digit(16).map(|d| (d * 17) as u8));
            Some(Color32::from_rgb(it.next()??, it.next()??, it.next()??))
        }
        6 => Some(Color32::from_rgb(byte(&hex[0..2])?, byte(&hex[2..4])?, byte(&hex[4..6])?)),
        8 => Some(Color32::from_rgba_unmultiplied(
            byte(&hex[0..2])?,
            byte(&hex[2..4])?,
            byte(&hex[4..6])?,
            byte(&hex[6..8])?,
        )),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    Light,
    #[default]
    Dark,
}

impl Theme {
    pub fn all() -> &'static [Theme] {
        &[Theme::Light, Theme::Dark]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Theme::Light => "light",
            Theme::Dark => "dark",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "light" => Some(Theme::Light),
            "dark" => Some(Theme::Dark),
            _ => None,
        }
    }

    pub fn toggled(self) -> Self {
        match self {
            Theme::Light => Theme::Dark,
            Theme::Dark => Theme::Light,
        }
    }

    pub fn trace_colors(self) -> Vec<Color32> {
        match self {
            Theme::Dark => vec![
                Color32::from_rgb(31, 119, 180),
                Color32::from_rgb(255, 127, 14),
                Color32::from_rgb(44, 160, 44),
                Color32::from_rgb(214, 39, 40),
                Color32::from_rgb(148, 103, 189),
                Color32::from_rgb(140, 86, 75),
                Color32::from_rgb(227, 119, 194),
                Color32::from_rgb(127, 127, 127),
                Color32::from_rgb(188, 189, 34),
                Color32::from_rgb(23, 190, 207),
            ],
            Theme::Light => vec![
                Color32::from_rgb(228, 26, 28),
                Color32::from_rgb(55, 126, 184),
                Color32::from_rgb(77, 175, 74),
                Color32::from_rgb(152, 78, 163),
                Color32::from_rgb(255, 127, 0),
                Color32::from_rgb(166, 86, 40),
                Color32::from_rgb(247, 129, 191),
                Color32::from_rgb(153, 153, 153),
            ],
        }
    }

    /// Named chrome colours broadcast to child windows.
    pub fn colors(self) -> BTreeMap<String, String> {
        let pairs: &[(&str, Color32)] = match self {
            Theme::Light => &[
                ("background", Color32::from_rgb(255, 255, 255)),
                ("surface", Color32::from_rgb(245, 245, 245)),
                ("text", Color32::from_rgb(33, 33, 33)),
                ("grid", Color32::from_rgb(224, 224, 224)),
                ("axis", Color32::from_rgb(97, 97, 97)),
                ("cursor", Color32::from_rgb(213, 0, 0)),
                ("accent", Color32::from_rgb(25, 118, 210)),
            ],
            Theme::Dark => &[
                ("background", Color32::from_rgb(27, 27, 27)),
                ("surface", Color32::from_rgb(40, 40, 40)),
                ("text", Color32::from_rgb(230, 230, 230)),
                ("grid", Color32::from_rgb(60, 60, 60)),
                ("axis", Color32::from_rgb(170, 170, 170)),
                ("cursor", Color32::from_rgb(255, 82, 82)),
                ("accent", Color32::from_rgb(100, 181, 246)),
            ],
        };
        pairs
            .iter()
            .map(|(k, c)| (k.to_string(), color_to_hex(*c)))
            .collect()
    }

    pub fn visuals(self) -> Visuals {
        match self {
            Theme::Light => Visuals::light(),
            Theme::Dark => Visuals::dark(),
        }
    }

    /// Make this theme's palette the one new channels draw from.
    pub fn activate(self) {
        set_global_palette(self.trace_colors());
    }

    /// Apply the visuals to an egui context and activate the palette.
    pub fn apply(self, ctx: &Context) {
        ctx.set_visuals(self.visuals());
        self.activate();
    }
}

impl fmt::Display for Theme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
