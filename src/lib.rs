//! comtrade-view crate root: module wiring and re-exports.
//!
//! The core of a COMTRADE (IEEE C37.111) waveform viewer:
//! - `state`: reactive channel state with path subscriptions and history
//! - `groups`/`axes`: chart grouping and unit-family axis planning
//! - `renderer`/`charts`: one merged chart per group and their registry
//! - `dispatcher`: routes channel edits to in-place updates or rebuilds
//! - `cursors`: measurement cursors and delta tables
//! - `messages`/`progress`/`events`: the surfaces other windows talk to
//! - `session`: owns all of the above for one loaded recording

pub mod axes;
pub mod charts;
pub mod computed;
pub mod config;
pub mod cursors;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod export;
pub mod groups;
pub mod host;
pub mod logging;
pub mod messages;
pub mod persistence;
pub mod plot;
pub mod progress;
pub mod recording;
pub mod renderer;
pub mod resources;
pub mod session;
pub mod state;
pub mod theme;

// Public re-exports for a compact external API
pub use charts::{ChartEntry, ChartMetadataStore, ChartType, SeriesOrigin};
pub use computed::{ComputedChannelStore, StoredComputedChannel};
pub use config::ViewerConfig;
pub use cursors::{CursorDeltaEngine, DeltaRecord, DeltaReport};
pub use dispatcher::{DispatchOutcome, UpdateKind, UpdateRequest};
pub use error::{Result, ViewerError};
pub use events::{EventController, EventFilter, EventKind, ViewerEvent};
pub use messages::{InboundMessage, MergedFiles, MessageBus, OutboundMessage};
pub use persistence::{JsonFileStore, KeyValueStore, MemoryStore};
pub use plot::{CanvasPlot, EguiBackend, HeadlessBackend, PlotBackend};
pub use progress::{ProgressChannel, ProgressUpdate};
pub use recording::{Config, Data, Recording};
pub use renderer::RenderReport;
pub use session::{MessageOutcome, Session};
pub use state::channels::{ChannelKind, ChannelModel, ChannelTarget, LoadMetadata};
pub use theme::Theme;
