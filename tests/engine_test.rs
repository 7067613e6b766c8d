//! Engine-level integration: full runs, delta runs, streaming updates,
//! restart and queue-drain ordering.

mod common;

use approx::assert_abs_diff_eq;

use barscript::engine::EngineSettings;
use barscript::timeframe::DAY;
use barscript::worker::{Request, Response};
use common::{bar, daily_rows, overlay_datas, pane, Harness};

const SMA_SCRIPT: &str = "\
// BarScript~0.2-lite
[INDICATOR name=SmaTest]
[UPDATE]
var m = sma(close, 5)
chart(m, { type: 'Spline' })
";

fn closes(n: usize) -> Vec<f64> {
    (1..=n).map(|i| i as f64).collect()
}

#[test]
fn sma_over_twenty_bars() {
    let mut h = Harness::new(EngineSettings::default());
    h.upload_script(SMA_SCRIPT);
    h.upload_daily_closes(&closes(20));

    let (_, events) = h.run_all(&["SmaTest"]);
    let datas = overlay_datas(&events);
    assert_eq!(datas.len(), 1, "one full run commits one overlay-data");

    let panes = &datas[0];
    assert_eq!(panes.len(), 1);
    assert_eq!(panes[0].overlays.len(), 1);
    let ov = &panes[0].overlays[0];
    assert_eq!(ov.overlay_type, "Spline");
    assert_eq!(ov.data.len(), 20);
    // (16+17+18+19+20)/5
    assert_abs_diff_eq!(ov.data[19][1], 18.0, epsilon = 1e-9);
    assert_eq!(ov.data[19][0] as i64, 19 * DAY);
}

#[test]
fn rsi_saturates_on_monotonic_series() {
    let script = "\
[INDICATOR name=RsiTest]
[UPDATE]
chart(rsi(close, 14), { type: 'Spline' })
";
    // strictly increasing closes: RSI tends to 100
    let mut h = Harness::new(EngineSettings::default());
    h.upload_script(script);
    h.upload_daily_closes(&closes(50));
    let (_, events) = h.run_all(&["RsiTest"]);
    let v = common::last_value(&overlay_datas(&events)[0]);
    assert!(v > 99.0, "increasing series RSI was {}", v);

    // strictly decreasing: RSI tends to 0
    let mut h = Harness::new(EngineSettings::default());
    h.upload_script(script);
    let decreasing: Vec<f64> = (1..=50).rev().map(|i| (i + 100) as f64).collect();
    h.upload_daily_closes(&decreasing);
    let (_, events) = h.run_all(&["RsiTest"]);
    let v = common::last_value(&overlay_datas(&events)[0]);
    assert!(v < 1.0, "decreasing series RSI was {}", v);
}

#[test]
fn since_counts_bars_after_condition() {
    let script = "\
[INDICATOR name=SinceTest]
[UPDATE]
chart(since(close == 10), { type: 'Spline' })
";
    let mut h = Harness::new(EngineSettings::default());
    h.upload_script(script);
    h.upload_daily_closes(&closes(20));
    let (_, events) = h.run_all(&["SinceTest"]);
    let ov = &overlay_datas(&events)[0][0].overlays[0];
    // close == 10 fires on bar index 9
    assert_eq!(ov.data[9][1], 0.0);
    assert_eq!(ov.data[10][1], 1.0);
    assert_eq!(ov.data[19][1], 10.0);
}

#[test]
fn run_requests_are_noops_without_data() {
    let mut h = Harness::new(EngineSettings::default());
    h.upload_script(SMA_SCRIPT);
    let (id, events) = h.run_all(&["SmaTest"]);
    assert!(overlay_datas(&events).is_empty());
    // still exactly one correlated ack
    let acks: Vec<_> = events
        .iter()
        .filter(|e| e.id == id && matches!(e.body, Response::RunDone))
        .collect();
    assert_eq!(acks.len(), 1);
}

#[test]
fn streaming_newer_bar_advances_and_equal_revises() {
    let mut h = Harness::new(EngineSettings::default());
    h.upload_script(SMA_SCRIPT);
    h.upload_daily_closes(&closes(20));
    h.run_all(&["SmaTest"]);

    // a bar newer than the last stored one advances history
    let id = h.handle(Request::UpdateData {
        bars: vec![bar(20, 21.0)],
    });
    let events = h.drain();
    let update = events
        .iter()
        .find(|e| e.id == id)
        .expect("correlated overlay-update");
    let Response::OverlayUpdate { points } = &update.body else {
        panic!("expected overlay-update, got {:?}", update.body);
    };
    let row = points.values().next().expect("one overlay");
    assert_eq!(row[0] as i64, 20 * DAY);
    // sma(close,5) over 17..21
    assert_abs_diff_eq!(row[1], 19.0, epsilon = 1e-9);
    assert_eq!(h.engine.state().last_t, 20 * DAY);

    // same timestamp revises slot 0 in place, no advance
    let id = h.handle(Request::UpdateData {
        bars: vec![bar(20, 26.0)],
    });
    let events = h.drain();
    let update = events.iter().find(|e| e.id == id).unwrap();
    let Response::OverlayUpdate { points } = &update.body else {
        panic!("expected overlay-update");
    };
    let row = points.values().next().unwrap();
    assert_eq!(row[0] as i64, 20 * DAY, "no new bar");
    // sma over 17,18,19,20,26
    assert_abs_diff_eq!(row[1], 20.0, epsilon = 1e-9);
    assert_eq!(h.engine.state().last_t, 20 * DAY);
}

#[test]
fn second_full_run_restarts_without_committing_partial_output() {
    let mut h = Harness::new(EngineSettings {
        chunk: 10,
        ..Default::default()
    });
    h.upload_script(SMA_SCRIPT);
    h.upload_daily_closes(&closes(100));

    // a different topology arrives while the first run iterates
    let second = h.queue(Request::RunAllScripts {
        panes: vec![pane("pane-1", &["SmaTest", "SmaTest"])],
    });
    let first = h.handle(Request::RunAllScripts {
        panes: vec![pane("pane-0", &["SmaTest"])],
    });
    let events = h.drain();

    for id in [&first, &second] {
        let acks = events
            .iter()
            .filter(|e| &e.id == id && matches!(e.body, Response::RunDone))
            .count();
        assert_eq!(acks, 1, "exactly one ack for {}", id);
    }

    // only the restarted run commits output, for the new topology
    let datas = overlay_datas(&events);
    assert_eq!(datas.len(), 1);
    assert_eq!(datas[0][0].uuid, "pane-1");
    assert_eq!(datas[0][0].overlays.len(), 2);
}

#[test]
fn duplicate_full_run_is_dropped_not_restarted() {
    let mut h = Harness::new(EngineSettings {
        chunk: 10,
        ..Default::default()
    });
    h.upload_script(SMA_SCRIPT);
    h.upload_daily_closes(&closes(100));

    let dup = h.queue(Request::RunAllScripts {
        panes: vec![pane("pane-0", &["SmaTest"])],
    });
    let first = h.handle(Request::RunAllScripts {
        panes: vec![pane("pane-0", &["SmaTest"])],
    });
    let events = h.drain();

    // both acked, but only one overlay-data (the original run finished)
    assert_eq!(overlay_datas(&events).len(), 1);
    for id in [&first, &dup] {
        assert!(events
            .iter()
            .any(|e| &e.id == id && matches!(e.body, Response::RunDone)));
    }
}

#[test]
fn updates_queued_during_run_replay_in_arrival_order() {
    let mut h = Harness::new(EngineSettings {
        chunk: 10,
        ..Default::default()
    });
    h.upload_script(SMA_SCRIPT);
    h.upload_daily_closes(&closes(100));

    let u1 = h.queue(Request::UpdateData {
        bars: vec![bar(100, 101.0)],
    });
    let u2 = h.queue(Request::UpdateData {
        bars: vec![bar(101, 102.0)],
    });
    let run = h.handle(Request::RunAllScripts {
        panes: vec![pane("pane-0", &["SmaTest"])],
    });
    let events = h.drain();

    let order: Vec<&String> = events
        .iter()
        .filter(|e| {
            matches!(e.body, Response::RunDone | Response::OverlayUpdate { .. })
                && (e.id == u1 || e.id == u2 || e.id == run)
        })
        .map(|e| &e.id)
        .collect();
    assert_eq!(order, vec![&run, &u1, &u2], "run drains before updates");
    assert_eq!(h.engine.state().last_t, 101 * DAY);
}

#[test]
fn delta_run_rebuilds_only_named_scripts() {
    let script = "\
[INDICATOR name=PropSma]
prop('len', { type: 'integer', def: 5 })
[UPDATE]
chart(sma(close, len), { type: 'Spline' })
";
    let mut h = Harness::new(EngineSettings::default());
    h.upload_script(script);
    h.upload_daily_closes(&closes(20));
    let (_, events) = h.run_all(&["PropSma"]);
    assert_abs_diff_eq!(
        common::last_value(&overlay_datas(&events)[0]),
        18.0,
        epsilon = 1e-9
    );

    let mut patch = std::collections::HashMap::new();
    patch.insert("len".to_string(), serde_json::json!(2));
    let mut delta = std::collections::HashMap::new();
    delta.insert("pane-0-s0".to_string(), patch);
    h.handle(Request::RunSubset { delta });
    let events = h.drain();
    // (19+20)/2
    assert_abs_diff_eq!(
        common::last_value(&overlay_datas(&events)[0]),
        19.5,
        epsilon = 1e-9
    );
}

#[test]
fn unknown_script_type_degrades_without_aborting_others() {
    let mut h = Harness::new(EngineSettings::default());
    h.upload_script(SMA_SCRIPT);
    h.upload_daily_closes(&closes(20));
    let (_, events) = h.run_all(&["NoSuchType", "SmaTest"]);
    let datas = overlay_datas(&events);
    assert_eq!(datas.len(), 1);
    // the healthy script still produced its overlay
    assert_eq!(datas[0][0].overlays.len(), 1);
    assert_eq!(h.engine.state().scripts, 2);
}

#[test]
fn symbol_rollup_feeds_script() {
    let script = "\
[INDICATOR name=SymTest]
[UPDATE]
var s = sym('2D')
chart(s.close, { type: 'Spline' })
";
    let mut h = Harness::new(EngineSettings::default());
    h.upload_script(script);
    h.upload_daily_closes(&closes(20));
    let (_, events) = h.run_all(&["SymTest"]);
    let ov = &overlay_datas(&events)[0][0].overlays[0];
    // last 2-day window closes at 20
    assert_eq!(ov.data[19][1], 20.0);
    // mid-window bar still shows the forming window's close
    assert_eq!(ov.data[18][1], 19.0);
}

#[test]
fn removed_scripts_leave_the_active_set() {
    let mut h = Harness::new(EngineSettings::default());
    h.upload_script(SMA_SCRIPT);
    h.upload_daily_closes(&closes(20));
    h.run_all(&["SmaTest"]);
    assert_eq!(h.engine.state().scripts, 1);

    h.handle(Request::RemoveScripts {
        ids: vec!["pane-0-s0".into()],
    });
    h.drain();
    assert_eq!(h.engine.state().scripts, 0);
}

#[test]
fn lookback_cap_limits_iterated_bars() {
    let mut h = Harness::new(EngineSettings {
        script_depth: Some(10),
        ..Default::default()
    });
    h.upload_script(SMA_SCRIPT);
    h.upload_daily_closes(&closes(100));
    let (_, events) = h.run_all(&["SmaTest"]);
    let ov = &overlay_datas(&events)[0][0].overlays[0];
    assert_eq!(ov.data.len(), 10);
    assert_eq!(ov.data[0][0] as i64, 90 * DAY);
}

#[test]
fn runtime_failure_still_emits_accumulated_output() {
    let script = "\
[INDICATOR name=Faulty]
[UPDATE]
chart(close[0], { type: 'Spline' })
if (iter == 10) { var x = mystery_function(1) }
";
    let mut h = Harness::new(EngineSettings::default());
    h.upload_script(script);
    h.upload_daily_closes(&closes(20));
    let (id, events) = h.run_all(&["Faulty"]);
    assert!(events
        .iter()
        .any(|e| e.id == id && matches!(e.body, Response::RunDone)));
    let datas = overlay_datas(&events);
    assert_eq!(datas.len(), 1, "partial output is still delivered");
    let rows = &datas[0][0].overlays[0].data;
    assert!(rows.len() >= 10 && rows.len() < 20, "got {} rows", rows.len());
}

#[test]
fn daily_rows_shape() {
    let rows = daily_rows(&[1.0, 2.0]);
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[1][0] as i64, DAY);
    assert_eq!(rows[1][4], 2.0);
}
