mod common;

use common::*;
use egui::Color32;
use serde_json::json;

use comtrade_view::plot::SeriesPatch;
use comtrade_view::{
    ChannelKind, ChannelTarget, EventFilter, EventKind, MessageOutcome, UpdateKind, UpdateRequest, ViewerConfig,
};

#[test]
fn color_change_restyles_the_series_in_place() {
    let mut h = harness(ViewerConfig::default());
    load(&mut h, three_phase());
    assert_eq!(h.log.borrow().created, vec!["G0".to_string()]);
    let progress = h.session.progress().subscribe();

    let id = h.session.channels().channel_id(ChannelKind::Analog, 1).unwrap();
    let msg = json!({
        "source": "ChildWindow",
        "type": "color",
        "payload": {"row": {"channelID": id, "type": "analog"}, "value": "#ff0000"}
    });
    let Some(MessageOutcome::Dispatched(outcome)) = h.session.handle_message(&msg) else {
        panic!("color message not dispatched");
    };
    assert!(outcome.handled);
    assert!(!outcome.rebuilt);

    let log = h.log.borrow();
    assert_eq!(log.created.len(), 1, "no rebuild");
    assert!(log.destroyed.is_empty());
    assert_eq!(
        log.set_series.last(),
        Some(&("G0".to_string(), 2, SeriesPatch::stroke(Color32::from_rgb(255, 0, 0))))
    );
    drop(log);
    assert_eq!(h.session.channels().color(ChannelKind::Analog, 1).as_deref(), Some("#ff0000"));

    let percents: Vec<u8> = progress.try_iter().map(|p| p.percent).collect();
    assert_eq!(percents.first(), Some(&0));
    assert_eq!(percents.last(), Some(&100));
    assert!(percents.windows(2).all(|w| w[0] <= w[1]));

    assert_eq!(h.session.queue().len(), 1);
    assert_eq!(h.session.frame(), 1);
    assert!(h.session.queue().is_empty());
}

#[test]
fn moving_a_channel_rebuilds_both_groups_once() {
    let config = ViewerConfig {
        max_y_axes: Some(2),
        ..Default::default()
    };
    let mut h = harness(config);
    let t = times(4, 0.001);
    load(
        &mut h,
        recording(
            t,
            &[("V", "kV", vec![1.0, 2.0, 3.0, 4.0]), ("I", "A", vec![0.1, 0.2, 0.3, 0.4])],
            &[("D", vec![0.0, 1.0, 1.0, 0.0])],
        ),
    );
    let d = h.session.channels().channel_id(ChannelKind::Digital, 0).unwrap();
    let setup = h
        .session
        .dispatch(UpdateRequest::new(UpdateKind::Group, d.as_str(), json!("G1")));
    assert!(setup.handled);
    let before = h.session.charts().len();
    assert!(h.session.charts().find_by_source_group("G0").is_some());
    *h.log.borrow_mut() = PlotLog::default();

    let v = h.session.channels().channel_id(ChannelKind::Analog, 0).unwrap();
    let outcome = h
        .session
        .dispatch(UpdateRequest::new(UpdateKind::Group, v.as_str(), json!("G1")));
    assert!(outcome.rebuilt);
    assert_eq!(outcome.rebuilt_groups, vec!["G0".to_string(), "G1".to_string()]);

    let charts = h.session.charts();
    assert_eq!(charts.len(), before - 1);
    assert!(charts.find_by_source_group("G0").is_none());
    let g1 = charts.find_by_source_group("G1").unwrap();
    assert_eq!(g1.channels, vec!["Time", "V", "I", "D"]);
    assert_eq!(h.log.borrow().created, vec!["G1".to_string()]);
    charts.check_invariants().unwrap();
}

#[test]
fn color_of_an_uncharted_channel_is_kept_in_state() {
    let mut h = harness(ViewerConfig::default());
    let t = times(4, 0.001);
    load(
        &mut h,
        recording(t, &[("IA", "A", vec![1.0, 0.0, -1.0, 0.0])], &[("IDLE", vec![0.0; 4])]),
    );
    let outcome = h.session.dispatch(UpdateRequest::new(
        UpdateKind::Color,
        ChannelTarget::Index(ChannelKind::Digital, 0),
        json!("#00ff00"),
    ));
    assert!(outcome.handled);
    assert!(!outcome.rebuilt);
    assert!(h.log.borrow().set_series.is_empty());
    assert_eq!(h.session.channels().color(ChannelKind::Digital, 0).as_deref(), Some("#00ff00"));
}

#[test]
fn unknown_channel_is_not_handled() {
    let mut h = harness(ViewerConfig::default());
    load(&mut h, three_phase());
    let outcome = h
        .session
        .dispatch(UpdateRequest::new(UpdateKind::Color, "analog-9-nope", json!("#123456")));
    assert!(!outcome.handled);
    assert_eq!(h.log.borrow().created.len(), 1);
}

#[test]
fn deleting_a_channel_drops_its_series() {
    let mut h = harness(ViewerConfig::default());
    load(&mut h, three_phase());
    let events = h.session.events().subscribe(EventFilter::only(EventKind::CHANNEL_DELETED));
    let vb = h.session.channels().channel_id(ChannelKind::Analog, 1).unwrap();

    let outcome = h.session.dispatch(UpdateRequest::new(UpdateKind::Delete, vb.as_str(), json!(null)));
    assert!(outcome.handled);
    assert_eq!(h.session.channels().len(ChannelKind::Analog), 2);
    assert_eq!(h.session.recording().config.analog_channels.len(), 2);
    assert_eq!(h.session.recording().data.analog_data.len(), 2);
    let g0 = h.session.charts().find_by_source_group("G0").unwrap();
    assert_eq!(g0.channels, vec!["Time", "VA", "VC"]);
    assert!(g0.series_index_of(&vb).is_none());

    let ev = events.try_recv().expect("delete event");
    assert_eq!(ev.channel.unwrap().channel_id, vb);
}

#[test]
fn scale_change_rebuilds_the_group() {
    let mut h = harness(ViewerConfig::default());
    load(&mut h, three_phase());
    let va = h.session.channels().channel_id(ChannelKind::Analog, 0).unwrap();
    let outcome = h.session.dispatch(UpdateRequest::new(UpdateKind::Scale, va.as_str(), json!(2.0)));
    assert!(outcome.rebuilt);
    assert_eq!(outcome.rebuilt_groups, vec!["G0".to_string()]);
    assert_eq!(h.log.borrow().created.len(), 2);
    assert_eq!(h.session.channels().scale(ChannelKind::Analog, 0), Some(2.0));
}

#[test]
fn undo_restores_a_color() {
    let mut h = harness(ViewerConfig::default());
    load(&mut h, three_phase());
    let original = h.session.channels().color(ChannelKind::Analog, 0);
    h.session.dispatch(UpdateRequest::new(
        UpdateKind::Color,
        ChannelTarget::Index(ChannelKind::Analog, 0),
        json!("#abcdef"),
    ));
    assert!(h.session.can_undo());
    h.session.undo();
    assert_eq!(h.session.channels().color(ChannelKind::Analog, 0), original);
    assert!(h.session.can_redo());
    h.session.redo();
    assert_eq!(h.session.channels().color(ChannelKind::Analog, 0).as_deref(), Some("#abcdef"));
}

/// `VA`/`VB` share `G0`, `IA` sits alone in `G1`.
fn voltages_and_current() -> comtrade_view::Recording {
    recording(
        times(4, 0.001),
        &[
            ("VA", "kV", vec![1.0, 2.0, 3.0, 4.0]),
            ("VB", "kV", vec![2.0, 3.0, 4.0, 5.0]),
            ("IA", "A", vec![0.1, 0.2, 0.3, 0.4]),
        ],
        &[],
    )
}

#[test]
fn deleting_the_last_series_of_a_group_removes_its_chart() {
    let mut h = harness(ViewerConfig::default());
    load(&mut h, voltages_and_current());
    assert_eq!(h.session.charts().len(), 2);
    assert_eq!(h.session.host().len(), 2);
    let ia = h.session.channels().channel_id(ChannelKind::Analog, 2).unwrap();
    *h.log.borrow_mut() = PlotLog::default();

    let outcome = h.session.dispatch(UpdateRequest::new(UpdateKind::Delete, ia.as_str(), json!(null)));
    assert!(outcome.rebuilt);
    assert_eq!(outcome.rebuilt_groups, vec!["G1".to_string()]);

    let charts = h.session.charts();
    assert!(charts.find_by_source_group("G1").is_none());
    assert!(charts.find_by_source_group("G0").is_some());
    assert_eq!(charts.len(), 1);
    assert_eq!(h.session.host().len(), 1);
    let log = h.log.borrow();
    assert_eq!(log.destroyed, vec!["G1".to_string()]);
    assert!(log.created.is_empty());
    charts.check_invariants().unwrap();
}

#[test]
fn invert_and_time_window_rebuild_only_their_group() {
    let mut h = harness(ViewerConfig::default());
    load(&mut h, voltages_and_current());
    let va = h.session.channels().channel_id(ChannelKind::Analog, 0).unwrap();

    *h.log.borrow_mut() = PlotLog::default();
    let outcome = h.session.dispatch(UpdateRequest::new(UpdateKind::Invert, va.as_str(), json!(true)));
    assert!(outcome.rebuilt);
    assert_eq!(outcome.rebuilt_groups, vec!["G0".to_string()]);
    assert_eq!(h.log.borrow().destroyed, vec!["G0".to_string()]);
    assert_eq!(h.log.borrow().created, vec!["G0".to_string()]);

    *h.log.borrow_mut() = PlotLog::default();
    let outcome = h.session.dispatch(UpdateRequest::new(
        UpdateKind::TimeWindow,
        va.as_str(),
        json!({"start": 0.001, "duration": 0.002}),
    ));
    assert!(outcome.rebuilt);
    assert_eq!(outcome.rebuilt_groups, vec!["G0".to_string()]);
    assert_eq!(h.log.borrow().destroyed, vec!["G0".to_string()]);
    assert_eq!(h.log.borrow().created, vec!["G0".to_string()]);
    assert!(h.session.charts().find_by_source_group("G1").is_some());
}

#[test]
fn unit_change_replans_every_chart() {
    let mut h = harness(ViewerConfig::default());
    load(&mut h, voltages_and_current());
    let ia = h.session.channels().channel_id(ChannelKind::Analog, 2).unwrap();
    *h.log.borrow_mut() = PlotLog::default();

    let outcome = h.session.dispatch(UpdateRequest::new(UpdateKind::Unit, ia.as_str(), json!("kA")));
    assert!(outcome.rebuilt);
    let mut groups = outcome.rebuilt_groups.clone();
    groups.sort();
    assert_eq!(groups, ["G0", "G1"]);

    let log = h.log.borrow();
    let mut created = log.created.clone();
    created.sort();
    assert_eq!(created, ["G0", "G1"]);
    assert_eq!(log.destroyed.len(), 2);
}

#[test]
fn moving_between_charts_with_the_same_axes_stays_in_place() {
    let mut h = harness(ViewerConfig::default());
    load(
        &mut h,
        recording(
            times(4, 0.001),
            &[
                ("VA", "kV", vec![1.0, 2.0, 3.0, 4.0]),
                ("VB", "kV", vec![2.0, 3.0, 4.0, 5.0]),
                ("UN", "kV", vec![0.0, 0.1, 0.0, 0.1]),
            ],
            &[],
        ),
    );
    assert!(h.session.charts().find_by_source_group("G1").is_some());
    *h.log.borrow_mut() = PlotLog::default();

    let vb = h.session.channels().channel_id(ChannelKind::Analog, 1).unwrap();
    let outcome = h.session.dispatch(UpdateRequest::new(UpdateKind::Group, vb.as_str(), json!("G1")));
    assert!(outcome.handled);
    assert!(!outcome.rebuilt);

    let log = h.log.borrow();
    assert!(log.created.is_empty());
    assert!(log.destroyed.is_empty());
    let charts = h.session.charts();
    assert_eq!(charts.find_by_source_group("G0").unwrap().channels, vec!["Time", "VA"]);
    assert_eq!(charts.find_by_source_group("G1").unwrap().channels, vec!["Time", "VB", "UN"]);
    assert_eq!(charts.find_by_channel(&vb).unwrap().0.source_group_id, "G1");
    charts.check_invariants().unwrap();
}

#[test]
fn delete_rebuilds_when_the_axis_layout_changes() {
    let config = ViewerConfig {
        max_y_axes: Some(2),
        ..Default::default()
    };
    let mut h = harness(config);
    load(&mut h, voltages_and_current());
    let ia = h.session.channels().channel_id(ChannelKind::Analog, 2).unwrap();
    h.session
        .dispatch(UpdateRequest::new(UpdateKind::Group, ia.as_str(), json!("G0")));
    assert_eq!(h.session.charts().len(), 1);

    // VA stays on the voltage axis, IA keeps the current axis
    *h.log.borrow_mut() = PlotLog::default();
    let vb = h.session.channels().channel_id(ChannelKind::Analog, 1).unwrap();
    let outcome = h.session.dispatch(UpdateRequest::new(UpdateKind::Delete, vb.as_str(), json!(null)));
    assert!(outcome.handled);
    assert!(!outcome.rebuilt);
    assert!(h.log.borrow().created.is_empty());
    assert_eq!(
        h.session.charts().find_by_source_group("G0").unwrap().channels,
        vec!["Time", "VA", "IA"]
    );

    // dropping the only current series leaves the current axis unbound
    let outcome = h.session.dispatch(UpdateRequest::new(UpdateKind::Delete, ia.as_str(), json!(null)));
    assert!(outcome.rebuilt);
    assert_eq!(outcome.rebuilt_groups, vec!["G0".to_string()]);
    assert_eq!(h.log.borrow().created, vec!["G0".to_string()]);
    let g0 = h.session.charts().find_by_source_group("G0").unwrap();
    assert_eq!(g0.channels, vec!["Time", "VA"]);
    h.session.charts().check_invariants().unwrap();
}

#[test]
fn delete_then_add_keeps_ids_and_tables_aligned() {
    let mut h = harness(ViewerConfig::default());
    load(&mut h, three_phase());
    let before: Vec<String> = h.session.channels().ids(ChannelKind::Analog);
    h.session
        .dispatch(UpdateRequest::new(UpdateKind::Delete, before[1].as_str(), json!(null)));
    let outcome = h.session.dispatch(UpdateRequest::add(json!({
        "id": "computed-sum",
        "name": "VSUM",
        "equation": "VA+VC",
        "unit": "kV",
        "data": [4.0, 6.0, 8.0, 10.0]
    })));
    assert!(outcome.rebuilt);

    let channels = h.session.channels();
    channels.check_invariants().unwrap();
    let mut all: Vec<String> = [ChannelKind::Analog, ChannelKind::Digital, ChannelKind::Computed]
        .into_iter()
        .flat_map(|k| channels.ids(k))
        .collect();
    assert_eq!(all.len(), 3);
    assert!(!all.contains(&before[1]));
    all.sort();
    all.dedup();
    assert_eq!(all.len(), 3, "ids stay unique");

    let rec = h.session.recording();
    assert_eq!(channels.len(ChannelKind::Analog), rec.config.analog_channels.len());
    assert_eq!(channels.len(ChannelKind::Computed), rec.config.computed_channels.len());
    assert_eq!(rec.data.computed_data.len(), 1);
    let sum = channels.channel_id(ChannelKind::Computed, 0).unwrap();
    assert_eq!(channels.find_channel_by_id(&sum).unwrap().index, 0);
    h.session.charts().check_invariants().unwrap();
}
