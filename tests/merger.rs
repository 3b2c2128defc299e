mod common;

use common::*;
use serde_json::{json, Value};

use comtrade_view::recording::MadeFrom;
use comtrade_view::{
    ChannelKind, ComputedChannelStore, EventFilter, EventKind, MemoryStore, MessageOutcome, StoredComputedChannel,
    ViewerConfig,
};

fn merged_payload() -> Value {
    json!({
        "source": "MergerApp",
        "type": "merged_files_ready",
        "payload": {
            "cfg": {
                "stationName": "A+B",
                "recDevId": "MERGE",
                "revYear": 1999,
                "analogChannels": [{"id": "VA", "unit": "kV"}, {"id": "IA", "unit": "A"}],
                "digitalChannels": [{"id": "TRIP"}],
                "samplingRates": [{"rate": 1000.0, "endSample": 4}]
            },
            "data": {
                "time": [0.0, 0.001, 0.002, 0.003],
                "analogData": [[1.0, 2.0, 3.0, 4.0], [0.1, 0.2, null, 0.4]],
                "digitalData": [[false, true, true, false]]
            },
            "filenames": ["A", "B"],
            "fileCount": 2,
            "isMerged": true
        }
    })
}

fn stored_power() -> StoredComputedChannel {
    serde_json::from_value(json!({
        "id": "computed-p",
        "name": "P",
        "equation": "VA*IA",
        "unit": "MW",
        "group": "Power",
        "madeFrom": "digital",
        "data": [0.1, 0.4, 0.0, 1.6]
    }))
    .unwrap()
}

#[test]
fn merged_files_reinitialize_the_session() {
    let store = MemoryStore::new();
    let config = ViewerConfig::default();
    ComputedChannelStore::new(Box::new(store.clone()), &config.storage_key)
        .save(&[stored_power()])
        .unwrap();
    let mut h = harness_with_store(config, store);
    load(&mut h, three_phase());
    let events = h.session.events().subscribe_all();

    let Some(MessageOutcome::Loaded(report)) = h.session.handle_message(&merged_payload()) else {
        panic!("merged files not loaded");
    };
    assert!(report.failed.is_empty());

    // state reinitialized from the merged configuration
    assert_eq!(h.session.channels().len(ChannelKind::Analog), 2);
    assert_eq!(h.session.channels().len(ChannelKind::Digital), 1);
    let meta = h.session.channels().metadata();
    assert_eq!(meta.filenames, vec!["A", "B"]);
    assert_eq!(meta.file_count, 2);
    assert!(meta.is_merged);

    // computed channel re-hydrated from storage, with its tag corrected
    assert_eq!(h.session.channels().len(ChannelKind::Computed), 1);
    let computed = &h.session.recording().config.computed_channels[0];
    assert_eq!(computed.id, "computed-p");
    assert_eq!(computed.made_from, MadeFrom::Analog);

    // one chart per group
    let mut sources: Vec<String> = h
        .session
        .charts()
        .list()
        .iter()
        .map(|e| e.source_group_id.clone())
        .collect();
    sources.sort();
    assert_eq!(sources, ["G0", "G1", "GD0", "Power"]);
    assert_eq!(report.built.len(), 4);

    let received: Vec<_> = events.try_iter().collect();
    let loaded = received
        .iter()
        .find(|e| e.kinds.contains(EventKind::RECORDING_LOADED))
        .expect("load event");
    assert_eq!(loaded.recording.as_ref().unwrap().chart_count, 4);
    let phasor = received
        .iter()
        .rev()
        .find_map(|e| e.phasor)
        .expect("phasor initialized");
    assert_eq!(phasor.time_index, 0);
}

#[test]
fn invalid_merged_data_is_reported() {
    let mut h = harness(ViewerConfig::default());
    load(&mut h, three_phase());
    let mut msg = merged_payload();
    msg["payload"]["data"]["analogData"][0] = json!([1.0, 2.0]);
    let Some(MessageOutcome::Failed(reason)) = h.session.handle_message(&msg) else {
        panic!("expected a failure");
    };
    assert!(reason.contains("analog channel 0"));
}

#[test]
fn foreign_and_malformed_messages_are_ignored() {
    let mut h = harness(ViewerConfig::default());
    load(&mut h, three_phase());
    let loaded = h.session.events().subscribe(EventFilter::only(EventKind::RECORDING_LOADED));

    assert!(h.session.handle_message(&json!({"source": "devtools", "type": "merged_files_ready"})).is_none());
    assert!(h
        .session
        .handle_message(&json!({"source": "MergerApp", "type": "merged_files_ready", "payload": 7}))
        .is_none());
    assert!(h.session.handle_text("not json").is_none());
    assert!(loaded.try_recv().is_err());
    assert_eq!(h.session.channels().len(ChannelKind::Analog), 3);
}
