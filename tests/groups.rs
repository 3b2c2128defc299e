mod common;

use common::*;
use serde_json::json;

use comtrade_view::groups::plan_groups;
use comtrade_view::{ChannelKind, ChannelModel, ChartType, UpdateKind, UpdateRequest, ViewerConfig};

fn three_families() -> comtrade_view::Recording {
    recording(
        times(4, 0.001),
        &[
            ("V", "kV", vec![1.0, 2.0, 3.0, 4.0]),
            ("I", "A", vec![0.1, 0.2, 0.3, 0.4]),
            ("F", "Hz", vec![50.0, 50.0, 49.9, 49.8]),
        ],
        &[("Z", vec![0.0; 4])],
    )
}

#[test]
fn all_zero_digital_channels_are_not_planned() {
    let rec = three_families();
    let mut snapshot = ChannelModel::tables_for(&rec);
    snapshot.digital.groups[0] = "G2".into();
    let groups = plan_groups(&snapshot, &rec);
    let keys: Vec<&str> = groups.iter().map(|g| g.key.as_str()).collect();
    assert_eq!(keys, ["G0", "G1", "G2"]);
    let g2 = &groups[2];
    assert_eq!(g2.analog_indices, vec![2]);
    assert!(g2.digital_indices.is_empty());
}

#[test]
fn group_with_a_dead_digital_channel_charts_only_the_analog_series() {
    let mut h = harness(ViewerConfig::default());
    load(&mut h, three_families());
    assert!(h.session.charts().find_by_source_group("GD0").is_none());

    let z = h.session.channels().channel_id(ChannelKind::Digital, 0).unwrap();
    let outcome = h.session.dispatch(UpdateRequest::new(UpdateKind::Group, z.as_str(), json!("G2")));
    assert!(outcome.handled);

    let g2 = h.session.charts().find_by_source_group("G2").unwrap();
    assert_eq!(g2.channels, vec!["Time", "F"]);
    assert_eq!(g2.chart_type, ChartType::Analog);
    assert!(g2.digital_plugin.is_none());
    assert!(!g2.axis_structure.digital);
    let plot = g2.plot.borrow();
    assert!(plot.model().axes().iter().all(|a| a.scale != "digital"));
}

#[test]
fn phase_channels_share_a_chart() {
    let mut h = harness(ViewerConfig::default());
    let t = times(3, 0.001);
    load(
        &mut h,
        recording(
            t,
            &[
                ("VA", "kV", vec![0.0; 3]),
                ("VB", "kV", vec![0.0; 3]),
                ("VC", "kV", vec![0.0; 3]),
                ("IA", "A", vec![0.0; 3]),
                ("IB", "A", vec![0.0; 3]),
                ("IC", "A", vec![0.0; 3]),
            ],
            &[("TRIP", vec![0.0, 1.0, 1.0]), ("CB_OPEN", vec![0.0, 0.0, 1.0])],
        ),
    );
    let sources: Vec<String> = h
        .session
        .charts()
        .list()
        .iter()
        .map(|e| e.source_group_id.clone())
        .collect();
    assert_eq!(sources, ["G0", "G1", "GD0"]);
    let gd0 = h.session.charts().find_by_source_group("GD0").unwrap();
    assert_eq!(gd0.chart_type, ChartType::Digital);
    assert_eq!(gd0.channels, vec!["Time", "TRIP", "CB_OPEN"]);
    h.session.charts().check_invariants().unwrap();
    h.session.channels().check_invariants().unwrap();
}
