//! Cross-window message protocol.
//!
//! Messages are JSON objects `{source, type, payload}`. Only the sources in
//! [`MessageSource`] are accepted; anything else (dev tools, extensions) is
//! dropped with a debug record.

use std::collections::BTreeMap;
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::computed::StoredComputedChannel;
use crate::dispatcher::{UpdateKind, UpdateRequest};
use crate::error::{Result, ViewerError};
use crate::recording::{Config, Data};
use crate::state::channels::{ChannelKind, ChannelTarget};
use crate::theme::Theme;

pub const MERGED_FILES_READY: &str = "merged_files_ready";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageSource {
    ChildWindow,
    MergerApp,
    MainApp,
    ChannelListWindow,
}

impl MessageSource {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "ChildWindow" => Some(MessageSource::ChildWindow),
            "MergerApp" => Some(MessageSource::MergerApp),
            "MainApp" => Some(MessageSource::MainApp),
            "ChannelListWindow" => Some(MessageSource::ChannelListWindow),
            _ => None,
        }
    }
}

/// Payload of `merged_files_ready`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergedFiles {
    pub cfg: Config,
    pub data: Data,
    #[serde(default)]
    pub filenames: Vec<String>,
    #[serde(default)]
    pub file_count: usize,
    #[serde(default)]
    pub is_merged: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Update(UpdateRequest),
    MergedFiles(Box<MergedFiles>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    ThemeChange {
        theme: Theme,
        colors: BTreeMap<String, String>,
    },
    ComputedChannelsUpdated {
        computed_channels: Vec<StoredComputedChannel>,
    },
    Progress {
        percent: u8,
        message: String,
    },
}

impl OutboundMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundMessage::ThemeChange { .. } => "theme_change",
            OutboundMessage::ComputedChannelsUpdated { .. } => "computed_channels_updated",
            OutboundMessage::Progress { .. } => "progress",
        }
    }

    pub fn to_value(&self) -> Value {
        let payload = match self {
            OutboundMessage::ThemeChange { theme, colors } => json!({ "theme": theme, "colors": colors }),
            OutboundMessage::ComputedChannelsUpdated { computed_channels } => {
                json!({ "computedChannels": computed_channels })
            }
            OutboundMessage::Progress { percent, message } => json!({ "percent": percent, "message": message }),
        };
        json!({ "source": "MainApp", "type": self.kind(), "payload": payload })
    }
}

fn protocol(reason: impl Into<String>) -> ViewerError {
    ViewerError::Protocol(reason.into())
}

fn str_field<'a>(obj: &'a Value, key: &str) -> Option<&'a str> {
    obj.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

fn value_of(obj: &Value) -> Value {
    obj.get("value")
        .or_else(|| obj.get("newValue"))
        .cloned()
        .unwrap_or(Value::Null)
}

fn target_of(obj: &Value, is_computed: bool) -> Result<Option<ChannelTarget>> {
    if let Some(id) = str_field(obj, "channelID") {
        return Ok(Some(ChannelTarget::Id(id.to_string())));
    }
    let Some(row) = obj.get("row") else {
        return Ok(None);
    };
    if let Some(id) = str_field(row, "channelID") {
        return Ok(Some(ChannelTarget::Id(id.to_string())));
    }
    let kind = match str_field(row, "type") {
        Some(t) => ChannelKind::parse(t)?,
        None if is_computed => ChannelKind::Computed,
        None => return Err(protocol("row has neither channelID nor type")),
    };
    let index = row
        .get("index")
        .and_then(Value::as_u64)
        .ok_or_else(|| protocol("row has no index"))?;
    Ok(Some(ChannelTarget::Index(kind, index as usize)))
}

/// Normalize the accepted payload shapes into an [`UpdateRequest`]:
/// `{row:{channelID|type,index}, value|newValue}`, `[plot, channelID, value]`
/// and `{channelID, value}`.
pub fn normalize_payload(kind: UpdateKind, payload: &Value) -> Result<UpdateRequest> {
    let (target, value, field, is_computed) = match payload {
        Value::Array(items) => {
            let id = items
                .get(1)
                .and_then(Value::as_str)
                .ok_or_else(|| protocol("positional payload without channel id"))?;
            let value = items.get(2).cloned().unwrap_or(Value::Null);
            (Some(ChannelTarget::Id(id.to_string())), value, None, false)
        }
        Value::Object(_) => {
            let is_computed = [payload.get("isComputed"), payload.pointer("/row/isComputed")]
                .into_iter()
                .any(|flag| flag.and_then(Value::as_bool) == Some(true));
            let field = str_field(payload, "field").map(str::to_string);
            let value = if kind == UpdateKind::Add && payload.get("value").is_none() {
                payload.clone()
            } else {
                value_of(payload)
            };
            (target_of(payload, is_computed)?, value, field, is_computed)
        }
        _ => return Err(protocol("payload is neither an object nor an array")),
    };
    if target.is_none() && kind != UpdateKind::Add {
        return Err(protocol(format!("{kind} update without a channel")));
    }
    Ok(UpdateRequest {
        kind,
        target,
        value,
        field,
        is_computed,
    })
}

/// Parse one raw message. `Ok(None)` means "not for us"; `Err` means it
/// claimed a known source but was malformed.
pub fn parse_message(raw: &Value) -> Result<Option<InboundMessage>> {
    let Some(source) = raw.get("source").and_then(Value::as_str).and_then(MessageSource::parse) else {
        return Ok(None);
    };
    let kind = raw.get("type").and_then(Value::as_str).unwrap_or_default();
    let payload = raw.get("payload").cloned().unwrap_or(Value::Null);
    match source {
        MessageSource::MainApp => Ok(None),
        MessageSource::MergerApp => {
            if kind != MERGED_FILES_READY {
                return Ok(None);
            }
            let files: MergedFiles = serde_json::from_value(payload)?;
            Ok(Some(InboundMessage::MergedFiles(Box::new(files))))
        }
        MessageSource::ChildWindow | MessageSource::ChannelListWindow => match UpdateKind::parse(kind) {
            Some(k) => normalize_payload(k, &payload).map(|r| Some(InboundMessage::Update(r))),
            None => Ok(None),
        },
    }
}

/// Inbound filtering, handler timing and outbound fan-out.
#[derive(Clone)]
pub struct MessageBus {
    slow_handler: Duration,
    outbound: Arc<Mutex<Vec<Sender<String>>>>,
}

impl MessageBus {
    pub fn new(slow_handler: Duration) -> Self {
        Self {
            slow_handler,
            outbound: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Parse a message; ignored and malformed messages are logged at debug.
    pub fn receive(&self, raw: &Value) -> Option<InboundMessage> {
        match parse_message(raw) {
            Ok(Some(msg)) => Some(msg),
            Ok(None) => {
                tracing::debug!("ignoring message {}", raw.get("type").unwrap_or(&serde_json::Value::Null));
                None
            }
            Err(e) => {
                tracing::debug!("dropping malformed message: {e}");
                None
            }
        }
    }

    /// Parse a JSON text message.
    pub fn receive_text(&self, text: &str) -> Option<InboundMessage> {
        match serde_json::from_str::<Value>(text) {
            Ok(v) => self.receive(&v),
            Err(e) => {
                tracing::debug!("dropping non-JSON message: {e}");
                None
            }
        }
    }

    /// Run a handler and log it when it takes longer than the threshold.
    pub fn timed<T>(&self, label: &str, f: impl FnOnce() -> T) -> T {
        let started = Instant::now();
        let out = f();
        let elapsed = started.elapsed();
        if elapsed > self.slow_handler {
            tracing::warn!("slow message handler {label}: {:.1} ms", elapsed.as_secs_f64() * 1000.0);
        }
        out
    }

    pub fn subscribe(&self) -> Receiver<String> {
        let (tx, rx) = std::sync::mpsc::channel();
        self.outbound.lock().unwrap_or_else(PoisonError::into_inner).push(tx);
        rx
    }

    /// Serialize and send to every peer; dead peers are pruned.
    pub fn broadcast(&self, msg: &OutboundMessage) {
        let text = msg.to_value().to_string();
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|tx| tx.send(text.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_sources_are_ignored() {
        let raw = json!({"source": "react-devtools-bridge", "type": "color", "payload": {}});
        assert_eq!(parse_message(&raw).unwrap(), None);
        assert_eq!(parse_message(&json!({"type": "color"})).unwrap(), None);
    }

    #[test]
    fn row_payload_with_new_value() {
        let raw = json!({
            "source": "ChildWindow",
            "type": "color",
            "payload": {"row": {"channelID": "analog-1-abc", "type": "analog"}, "newValue": "#ff0000"}
        });
        let Some(InboundMessage::Update(req)) = parse_message(&raw).unwrap() else {
            panic!("expected update");
        };
        assert_eq!(req.kind, UpdateKind::Color);
        assert_eq!(req.target, Some(ChannelTarget::Id("analog-1-abc".into())));
        assert_eq!(req.value, json!("#ff0000"));
    }

    #[test]
    fn positional_and_index_payloads() {
        let req = normalize_payload(UpdateKind::Scale, &json!([null, "digital-0-x", 2])).unwrap();
        assert_eq!(req.target, Some(ChannelTarget::Id("digital-0-x".into())));
        assert_eq!(req.value, json!(2));

        let req = normalize_payload(UpdateKind::Name, &json!({"row": {"type": "computed", "index": 3}, "value": "P"}))
            .unwrap();
        assert_eq!(req.target, Some(ChannelTarget::Index(ChannelKind::Computed, 3)));
    }

    #[test]
    fn payload_computed_flag_selects_the_computed_table() {
        let req = normalize_payload(
            UpdateKind::Color,
            &json!({"row": {"index": 0}, "isComputed": true, "value": "#fff"}),
        )
        .unwrap();
        assert_eq!(req.target, Some(ChannelTarget::Index(ChannelKind::Computed, 0)));
        assert!(req.is_computed);

        let err = normalize_payload(UpdateKind::Color, &json!({"row": {"index": 0}, "value": "#fff"})).unwrap_err();
        assert!(matches!(err, ViewerError::Protocol(_)));
    }

    #[test]
    fn missing_target_is_a_protocol_error() {
        let err = normalize_payload(UpdateKind::Color, &json!({"value": "#fff"})).unwrap_err();
        assert!(matches!(err, ViewerError::Protocol(_)));
        assert!(normalize_payload(UpdateKind::Add, &json!({"id": "c1"})).is_ok());
    }

    #[test]
    fn outbound_is_tagged_main_app() {
        let bus = MessageBus::new(Duration::from_millis(30));
        let rx = bus.subscribe();
        bus.broadcast(&OutboundMessage::Progress {
            percent: 50,
            message: "x".into(),
        });
        let v: Value = serde_json::from_str(&rx.recv().unwrap()).unwrap();
        assert_eq!(v["source"], "MainApp");
        assert_eq!(v["type"], "progress");
        assert_eq!(v["payload"]["percent"], 50);
    }
}
