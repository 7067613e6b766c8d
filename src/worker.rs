//! Host boundary: the engine runs on a dedicated background thread,
//! reachable only through channels. Every request carries a correlation
//! id and receives exactly one response with that id; engine-initiated
//! events (overlay data, telemetry, script signals) carry fresh ids.

use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::info;
use serde::{Deserialize, Serialize};

use crate::engine::{Engine, EngineSettings};
use crate::env::ScriptSpec;
use crate::error::BarscriptError;
use crate::feed::{Bar, Dataset};
use crate::output::{EngineState, PaneOut};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub id: String,
    pub body: T,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceFile {
    pub name: String,
    pub src: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataMeta {
    pub tf: String,
    #[serde(default)]
    pub range: (i64, i64),
}

/// One pane and the scripts bound to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaneSpec {
    pub id: String,
    pub uuid: String,
    #[serde(default)]
    pub scripts: Vec<ScriptSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum Request {
    UploadLibrary {
        scripts: Vec<SourceFile>,
    },
    UploadData {
        datasets: Vec<Dataset>,
        meta: DataMeta,
    },
    RunAllScripts {
        panes: Vec<PaneSpec>,
    },
    RunSubset {
        delta: std::collections::HashMap<String, std::collections::HashMap<String, serde_json::Value>>,
    },
    UpdateData {
        bars: Vec<Bar>,
    },
    RemoveScripts {
        ids: Vec<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum Response {
    LibraryUploaded {
        scripts: usize,
        errors: Vec<String>,
    },
    DataUploaded,
    /// Ack for run-style requests, sent whether the run committed or was
    /// restarted away.
    RunDone,
    OverlayData {
        panes: Vec<PaneOut>,
    },
    OverlayUpdate {
        points: std::collections::HashMap<String, Vec<f64>>,
    },
    EngineState(EngineState),
    ModifyOverlay {
        uuid: String,
        fields: serde_json::Value,
    },
    ScriptSignal {
        #[serde(rename = "signalType")]
        signal_type: String,
        data: serde_json::Value,
    },
}

/// Handle to a spawned engine thread. Dropping it closes the request
/// channel, which shuts the engine down.
pub struct EngineHandle {
    tx: Option<Sender<Envelope<Request>>>,
    pub events: Receiver<Envelope<Response>>,
    join: Option<JoinHandle<()>>,
}

/// Spawn the engine on its own thread.
pub fn spawn(settings: EngineSettings) -> EngineHandle {
    let (req_tx, req_rx) = unbounded::<Envelope<Request>>();
    let (resp_tx, resp_rx) = unbounded::<Envelope<Response>>();

    let join = std::thread::Builder::new()
        .name("barscript-engine".into())
        .spawn(move || {
            let mut engine = Engine::new(resp_tx, settings);
            loop {
                match req_rx.recv() {
                    Ok(req) => engine.handle(req, Some(&req_rx)),
                    Err(_) => break,
                }
            }
            info!("engine thread shutting down");
        })
        .expect("spawn engine thread");

    EngineHandle {
        tx: Some(req_tx),
        events: resp_rx,
        join: Some(join),
    }
}

impl EngineHandle {
    /// Fire a request with a fresh correlation id.
    pub fn send(&self, req: Request) -> Result<String, BarscriptError> {
        let id = uuid::Uuid::new_v4().to_string();
        self.send_with_id(id.clone(), req)?;
        Ok(id)
    }

    pub fn send_with_id(&self, id: String, req: Request) -> Result<(), BarscriptError> {
        self.tx
            .as_ref()
            .ok_or(BarscriptError::EngineGone)?
            .send(Envelope { id, body: req })
            .map_err(|_| BarscriptError::EngineGone)
    }

    /// Send a request and block until its correlated response arrives.
    /// Uncorrelated events received meanwhile are returned alongside.
    pub fn request(
        &self,
        req: Request,
        timeout: Duration,
    ) -> Result<(Response, Vec<Envelope<Response>>), BarscriptError> {
        let id = self.send(req)?;
        let mut side = Vec::new();
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let remaining = deadline
                .checked_duration_since(std::time::Instant::now())
                .unwrap_or(Duration::ZERO);
            match self.events.recv_timeout(remaining) {
                Ok(env) if env.id == id => return Ok((env.body, side)),
                Ok(env) => side.push(env),
                Err(RecvTimeoutError::Timeout) => {
                    return Err(BarscriptError::Data {
                        reason: format!("no response to request {} in {:?}", id, timeout),
                    })
                }
                Err(RecvTimeoutError::Disconnected) => return Err(BarscriptError::EngineGone),
            }
        }
    }

    /// Drain any pending engine events without blocking.
    pub fn poll_events(&self) -> Vec<Envelope<Response>> {
        let mut out = Vec::new();
        while let Ok(env) = self.events.try_recv() {
            out.push(env);
        }
        out
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        // closing the request channel ends the engine loop
        drop(self.tx.take());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}
