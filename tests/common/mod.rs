//! Shared helpers for integration tests: a synchronous engine harness
//! plus feed/topology builders.
#![allow(dead_code)]

use crossbeam_channel::{unbounded, Receiver, Sender};

use barscript::engine::{Engine, EngineSettings};
use barscript::env::ScriptSpec;
use barscript::timeframe::DAY;
use barscript::worker::{DataMeta, Envelope, PaneSpec, Request, Response, SourceFile};

pub struct Harness {
    pub engine: Engine,
    pub events: Receiver<Envelope<Response>>,
    pub inbox_tx: Sender<Envelope<Request>>,
    pub inbox_rx: Receiver<Envelope<Request>>,
    next_id: u64,
}

impl Harness {
    pub fn new(settings: EngineSettings) -> Harness {
        let (tx, rx) = unbounded();
        let (inbox_tx, inbox_rx) = unbounded();
        Harness {
            engine: Engine::new(tx, settings),
            events: rx,
            inbox_tx,
            inbox_rx,
            next_id: 0,
        }
    }

    pub fn req_id(&mut self) -> String {
        self.next_id += 1;
        format!("req-{}", self.next_id)
    }

    /// Handle a request synchronously, polling the harness inbox at yield
    /// points (pre-stuff `inbox_tx` to exercise mid-run arrivals).
    pub fn handle(&mut self, req: Request) -> String {
        let id = self.req_id();
        self.engine.handle(
            Envelope {
                id: id.clone(),
                body: req,
            },
            Some(&self.inbox_rx),
        );
        id
    }

    /// Queue a request on the inbox so a running pass absorbs it at its
    /// next cooperative yield point.
    pub fn queue(&mut self, req: Request) -> String {
        let id = self.req_id();
        self.inbox_tx
            .send(Envelope {
                id: id.clone(),
                body: req,
            })
            .unwrap();
        id
    }

    pub fn drain(&self) -> Vec<Envelope<Response>> {
        let mut out = Vec::new();
        while let Ok(ev) = self.events.try_recv() {
            out.push(ev);
        }
        out
    }

    pub fn upload_script(&mut self, src: &str) -> Vec<Envelope<Response>> {
        self.handle(Request::UploadLibrary {
            scripts: vec![SourceFile {
                name: "test".into(),
                src: src.into(),
            }],
        });
        self.drain()
    }

    pub fn upload_daily_closes(&mut self, closes: &[f64]) {
        let rows = daily_rows(closes);
        let range = (rows[0][0] as i64, rows[rows.len() - 1][0] as i64);
        self.handle(Request::UploadData {
            datasets: vec![barscript::feed::Dataset::new("ohlcv", rows)],
            meta: DataMeta {
                tf: "1D".into(),
                range,
            },
        });
        self.drain();
    }

    pub fn run_all(&mut self, types: &[&str]) -> (String, Vec<Envelope<Response>>) {
        let id = self.handle(Request::RunAllScripts {
            panes: vec![pane("pane-0", types)],
        });
        (id, self.drain())
    }
}

/// Daily bars with the given closes; open/high/low derive from close.
pub fn daily_rows(closes: &[f64]) -> Vec<Vec<f64>> {
    closes
        .iter()
        .enumerate()
        .map(|(i, &c)| {
            let t = (i as i64 * DAY) as f64;
            vec![t, c - 0.5, c + 1.0, c - 1.0, c, 100.0]
        })
        .collect()
}

pub fn bar(i: usize, close: f64) -> barscript::feed::Bar {
    barscript::feed::Bar {
        time: i as i64 * DAY,
        open: close - 0.5,
        high: close + 1.0,
        low: close - 1.0,
        close,
        volume: 100.0,
    }
}

pub fn pane(uuid: &str, types: &[&str]) -> PaneSpec {
    PaneSpec {
        id: uuid.into(),
        uuid: uuid.into(),
        scripts: types
            .iter()
            .enumerate()
            .map(|(i, ty)| ScriptSpec {
                uuid: format!("{}-s{}", uuid, i),
                script_type: ty.to_string(),
                props: Default::default(),
                settings: Default::default(),
                exec_order: i as i64,
            })
            .collect(),
    }
}

/// The overlay-data payloads among the drained events.
pub fn overlay_datas(events: &[Envelope<Response>]) -> Vec<Vec<barscript::output::PaneOut>> {
    events
        .iter()
        .filter_map(|e| match &e.body {
            Response::OverlayData { panes } => Some(panes.clone()),
            _ => None,
        })
        .collect()
}

pub fn last_value(panes: &[barscript::output::PaneOut]) -> f64 {
    let row = panes[0].overlays[0]
        .data
        .last()
        .expect("overlay has data rows");
    row[1]
}
