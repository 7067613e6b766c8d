//! Worker-boundary integration: correlation ids, request/response pairing
//! and engine-initiated signals across the thread boundary.

mod common;

use std::collections::HashSet;
use std::time::Duration;

use barscript::engine::EngineSettings;
use barscript::env::ScriptSpec;
use barscript::worker::{self, DataMeta, PaneSpec, Request, Response, SourceFile};
use common::{bar, daily_rows};

const TIMEOUT: Duration = Duration::from_secs(30);

const SIGNAL_SCRIPT: &str = "\
// BarScript~0.2-lite
[INDICATOR name=Alarm]
prop('level', { type: 'number', def: 21 })
[UPDATE]
chart(close[0], { type: 'Spline' })
signalif(close[0] >= level, 'level-hit', { which: 'close' })
";

fn upload_all(handle: &worker::EngineHandle, n_bars: usize) {
    let (resp, _) = handle
        .request(
            Request::UploadLibrary {
                scripts: vec![SourceFile {
                    name: "alarm".into(),
                    src: SIGNAL_SCRIPT.into(),
                }],
            },
            TIMEOUT,
        )
        .unwrap();
    assert!(matches!(resp, Response::LibraryUploaded { scripts: 1, .. }));

    let closes: Vec<f64> = (1..=n_bars).map(|i| i as f64).collect();
    let (resp, _) = handle
        .request(
            Request::UploadData {
                datasets: vec![barscript::feed::Dataset::new("ohlcv", daily_rows(&closes))],
                meta: DataMeta {
                    tf: "1D".into(),
                    range: (0, 0),
                },
            },
            TIMEOUT,
        )
        .unwrap();
    assert!(matches!(resp, Response::DataUploaded));
}

fn topology() -> Vec<PaneSpec> {
    vec![PaneSpec {
        id: "p0".into(),
        uuid: "p0".into(),
        scripts: vec![ScriptSpec {
            uuid: "s0".into(),
            script_type: "Alarm".into(),
            props: Default::default(),
            settings: Default::default(),
            exec_order: 0,
        }],
    }]
}

#[test]
fn round_trip_produces_overlay_data_and_state() {
    let handle = worker::spawn(EngineSettings::default());
    upload_all(&handle, 20);

    let (resp, side) = handle
        .request(Request::RunAllScripts { panes: topology() }, TIMEOUT)
        .unwrap();
    assert!(matches!(resp, Response::RunDone));

    let mut saw_data = false;
    let mut saw_state = false;
    for ev in &side {
        match &ev.body {
            Response::OverlayData { panes } => {
                saw_data = true;
                assert_eq!(panes.len(), 1);
                assert_eq!(panes[0].overlays.len(), 1);
                assert_eq!(panes[0].overlays[0].data.len(), 20);
            }
            Response::EngineState(state) => {
                saw_state = true;
                assert_eq!(state.scripts, 1);
            }
            _ => {}
        }
    }
    assert!(saw_data && saw_state);
}

#[test]
fn every_event_has_a_distinct_correlation_id() {
    let handle = worker::spawn(EngineSettings::default());
    upload_all(&handle, 20);
    let (_, side) = handle
        .request(Request::RunAllScripts { panes: topology() }, TIMEOUT)
        .unwrap();
    let ids: Vec<&String> = side.iter().map(|e| &e.id).collect();
    let unique: HashSet<&String> = ids.iter().copied().collect();
    assert_eq!(ids.len(), unique.len());
}

#[test]
fn streaming_update_emits_script_signal() {
    let handle = worker::spawn(EngineSettings::default());
    upload_all(&handle, 20);
    handle
        .request(Request::RunAllScripts { panes: topology() }, TIMEOUT)
        .unwrap();

    // close 21 >= level: the update must carry a level-hit signal
    let (resp, side) = handle
        .request(
            Request::UpdateData {
                bars: vec![bar(20, 21.0)],
            },
            TIMEOUT,
        )
        .unwrap();
    assert!(matches!(resp, Response::OverlayUpdate { .. }));

    let signal = side.iter().find_map(|e| match &e.body {
        Response::ScriptSignal { signal_type, data } => Some((signal_type.clone(), data.clone())),
        _ => None,
    });
    let (stype, data) = signal.expect("signal delivered after streaming update");
    assert_eq!(stype, "level-hit");
    assert_eq!(data["which"], "close");
}

#[test]
fn full_run_does_not_emit_signals() {
    // the backtest-style replay crosses the level on every late bar, but
    // signals only fire for streaming updates
    let handle = worker::spawn(EngineSettings::default());
    upload_all(&handle, 30);
    let (_, side) = handle
        .request(Request::RunAllScripts { panes: topology() }, TIMEOUT)
        .unwrap();
    assert!(!side
        .iter()
        .any(|e| matches!(e.body, Response::ScriptSignal { .. })));
}

#[test]
fn update_before_data_upload_is_a_noop_response() {
    let handle = worker::spawn(EngineSettings::default());
    let (resp, _) = handle
        .request(
            Request::UpdateData {
                bars: vec![bar(0, 1.0)],
            },
            TIMEOUT,
        )
        .unwrap();
    match resp {
        Response::OverlayUpdate { points } => assert!(points.is_empty()),
        other => panic!("expected overlay-update, got {:?}", other),
    }
}
