//! The execution engine: owns the active script environments and drives
//! full, delta and streaming runs with single-flight and restart
//! semantics.
//!
//! At most one run executes at any instant. A full run yields
//! cooperatively every `chunk` bars to poll the inbox; a newer full-run
//! request observed there sets the restart flag, which truncates the
//! remaining iterations without committing any output. Delta and
//! streaming requests arriving mid-run are queued and drained strictly
//! after the run, in arrival order.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender};
use log::{debug, error, info, warn};

use crate::context::{RunEvent, SharedCtx, OHLCV};
use crate::dsl::{self, IndicatorDescriptor, OverlayDescriptor, OverlayPrefab};
use crate::env::{ScriptEnv, ScriptSpec};
use crate::feed::{Bar, BaseFeed, Dataset, Datasets};
use crate::output::{EngineState, PaneOut};
use crate::timeframe::parse_tf;
use crate::worker::{DataMeta, Envelope, PaneSpec, Request, Response, SourceFile};

/// Bars between cooperative yield points during a full run.
const DEF_CHUNK: usize = 5_000;

#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Cap full runs to the last N bars.
    pub script_depth: Option<usize>,
    /// Yield interval in bars.
    pub chunk: usize,
    /// Evict datasets (oldest first) when their estimated size exceeds
    /// this many MB.
    pub ram_limit_mb: Option<f64>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            script_depth: None,
            chunk: DEF_CHUNK,
            ram_limit_mb: None,
        }
    }
}

/// Parsed script library: indicator descriptors by type name plus the
/// overlay prefabs whose names act as plot primitives.
#[derive(Debug, Default)]
pub struct Library {
    pub indicators: HashMap<String, IndicatorDescriptor>,
    pub overlays: HashMap<String, OverlayDescriptor>,
    pub prefabs: HashMap<String, OverlayPrefab>,
}

impl Library {
    /// Parse and register script files. A file that fails to parse is
    /// dropped with a diagnostic; the others load normally.
    pub fn load(&mut self, files: &[SourceFile]) -> (usize, Vec<String>) {
        let mut loaded = 0;
        let mut errors = Vec::new();
        for file in files {
            match dsl::parse_script(&file.src, &file.name) {
                Ok(parsed) => {
                    for ov in parsed.overlays {
                        self.prefabs.insert(ov.name.clone(), ov.prefab());
                        self.overlays.insert(ov.name.clone(), ov);
                    }
                    for ind in parsed.indicators {
                        self.indicators.insert(ind.type_name.clone(), ind);
                    }
                    loaded += 1;
                }
                Err(e) => {
                    let msg = format!("{}: {}", file.name, e.display_with_context(&file.src));
                    error!("script library: {}", msg);
                    errors.push(msg);
                }
            }
        }
        (loaded, errors)
    }

    pub fn plot_names(&self) -> HashSet<String> {
        self.prefabs.keys().cloned().collect()
    }
}

type Delta = HashMap<String, HashMap<String, serde_json::Value>>;

pub struct Engine {
    pub settings: EngineSettings,
    pub library: Library,
    datasets: Datasets,
    base: BaseFeed,
    tf: i64,
    range: (i64, i64),
    panes: Vec<PaneSpec>,
    envs: Vec<ScriptEnv>,
    t: i64,
    iter: usize,
    running: bool,
    restart: bool,
    pending_full: Option<(Vec<PaneSpec>, String)>,
    delta_queue: Vec<(Delta, String)>,
    update_queue: VecDeque<(Vec<Bar>, String)>,
    pending_misc: Vec<Envelope<Request>>,
    perf_ms: f64,
    data_size_mb: f64,
    out: Sender<Envelope<Response>>,
}

impl Engine {
    pub fn new(out: Sender<Envelope<Response>>, settings: EngineSettings) -> Engine {
        Engine {
            settings,
            library: Library::default(),
            datasets: Datasets::new(),
            base: BaseFeed::new(),
            tf: 60_000,
            range: (0, 0),
            panes: Vec::new(),
            envs: Vec::new(),
            t: 0,
            iter: 0,
            running: false,
            restart: false,
            pending_full: None,
            delta_queue: Vec::new(),
            update_queue: VecDeque::new(),
            pending_misc: Vec::new(),
            perf_ms: 0.0,
            data_size_mb: 0.0,
            out,
        }
    }

    /// Process one host request. `inbox` is polled at cooperative yield
    /// points during full runs.
    pub fn handle(&mut self, req: Envelope<Request>, inbox: Option<&Receiver<Envelope<Request>>>) {
        let Envelope { id, body } = req;
        match body {
            Request::UploadLibrary { scripts } => {
                let (loaded, errors) = self.library.load(&scripts);
                self.send(
                    id,
                    Response::LibraryUploaded {
                        scripts: loaded,
                        errors,
                    },
                );
            }
            Request::UploadData { datasets, meta } => {
                self.upload_data(datasets, meta);
                self.send(id, Response::DataUploaded);
                self.send_state();
            }
            Request::RunAllScripts { panes } => self.exec_all(panes, id, inbox),
            Request::RunSubset { delta } => self.exec_sel(delta, id, inbox),
            Request::UpdateData { bars } => self.update(bars, id),
            Request::RemoveScripts { ids } => {
                self.envs.retain(|e| !ids.contains(&e.id));
                self.send(id, Response::RunDone);
                self.send_state();
            }
        }
    }

    fn upload_data(&mut self, datasets: Vec<Dataset>, meta: DataMeta) {
        self.tf = parse_tf(&meta.tf).unwrap_or(self.tf);
        self.range = meta.range;
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        for mut ds in datasets {
            ds.last_upd = now;
            self.datasets.insert(ds.id.clone(), ds);
        }
        self.recalc_size();
    }

    /// Full run over the requested pane/script topology.
    fn exec_all(
        &mut self,
        mut panes: Vec<PaneSpec>,
        mut req_id: String,
        inbox: Option<&Receiver<Envelope<Request>>>,
    ) {
        loop {
            if !self.datasets.contains_key(OHLCV) {
                warn!("exec_all: no base feed uploaded yet, skipping");
                self.send(req_id, Response::RunDone);
                return;
            }
            self.build_envs(&panes);
            let completed = self.run_full(None, inbox);
            if completed {
                self.emit_overlay_data();
                self.send_state();
                self.send(req_id, Response::RunDone);
                break;
            }
            // restarted: no partial output is committed
            self.send(req_id, Response::RunDone);
            match self.pending_full.take() {
                Some((p, id)) => {
                    panes = p;
                    req_id = id;
                }
                None => break,
            }
        }
        self.drain_queues(inbox);
    }

    /// Recompute only the named scripts (e.g. settings changed),
    /// reusing every other environment.
    fn exec_sel(
        &mut self,
        delta: Delta,
        req_id: String,
        inbox: Option<&Receiver<Envelope<Request>>>,
    ) {
        if !self.datasets.contains_key(OHLCV) {
            self.send(req_id, Response::RunDone);
            return;
        }
        let sel: HashSet<String> = delta
            .keys()
            .filter(|id| self.envs.iter().any(|e| &e.id == *id))
            .cloned()
            .collect();

        for (script_id, patch) in &delta {
            if !sel.contains(script_id) {
                continue;
            }
            self.rebuild_env(script_id, patch);
        }

        let completed = self.run_full(Some(&sel), inbox);
        if completed {
            self.emit_overlay_data();
            self.send_state();
        }
        self.send(req_id, Response::RunDone);
        self.drain_queues(inbox);
    }

    /// Apply one or more trailing bars. Newer timestamps advance history
    /// across all environments; an equal timestamp revises the open bar
    /// in place. Failures are swallowed so streaming stays responsive.
    fn update(&mut self, bars: Vec<Bar>, req_id: String) {
        if self.running {
            self.update_queue.push_back((bars, req_id));
            return;
        }
        let has_data = self
            .datasets
            .get(OHLCV)
            .map(|d| !d.rows.is_empty())
            .unwrap_or(false);
        if has_data {
            if let Err(e) = self.apply_update(bars) {
                debug!("streaming update failed: {}", e);
            }
        }
        self.emit_signals();
        self.send(
            req_id,
            Response::OverlayUpdate {
                points: self.last_points(),
            },
        );
        self.send_state();
    }

    fn apply_update(&mut self, mut bars: Vec<Bar>) -> Result<(), crate::error::RuntimeError> {
        bars.sort_by_key(|b| b.time);

        let mut last_time = self
            .datasets
            .get(OHLCV)
            .and_then(|d| d.rows.last())
            .map(|r| r[0] as i64)
            .unwrap_or(i64::MIN);
        let mut unshift = false;

        for bar in bars {
            if bar.time > last_time {
                // finalize the still-open bar before history advances
                self.step_envs(None, false, true, RunEvent::Update)?;
                let ds = self.datasets.get_mut(OHLCV).expect("checked above");
                ds.rows.push(bar.to_row());
                last_time = bar.time;
                unshift = true;
            } else if bar.time < last_time {
                continue;
            } else {
                let ds = self.datasets.get_mut(OHLCV).expect("checked above");
                *ds.rows.last_mut().expect("non-empty") = bar.to_row();
            }
        }

        let ds = self.datasets.get(OHLCV).expect("checked above");
        let last = ds
            .rows
            .last()
            .and_then(|r| Bar::from_row(r))
            .ok_or_else(|| crate::error::RuntimeError::type_err("base feed row", "six columns"))?;
        self.iter = ds.rows.len() - 1;
        self.t = last.time;
        self.base.step(&last, unshift);
        self.step_envs(None, unshift, false, RunEvent::Update)?;
        self.base.truncate();
        self.recalc_size();
        Ok(())
    }

    /// Iterate the retained base history oldest→newest. Returns false when
    /// the restart flag truncated the run (no output committed).
    fn run_full(
        &mut self,
        sel: Option<&HashSet<String>>,
        inbox: Option<&Receiver<Envelope<Request>>>,
    ) -> bool {
        self.running = true;
        self.send_state();
        let started = Instant::now();

        self.base = BaseFeed::new();
        self.t = 0;
        self.iter = 0;

        let rows: Vec<Bar> = self
            .datasets
            .get(OHLCV)
            .map(|d| d.rows.iter().filter_map(|r| Bar::from_row(r)).collect())
            .unwrap_or_default();
        let start = match self.settings.script_depth {
            Some(depth) => rows.len().saturating_sub(depth),
            None => 0,
        };

        let selected = |id: &str| sel.map(|s| s.contains(id)).unwrap_or(true);

        let mut failed = false;
        {
            let shared = SharedCtx {
                base: &self.base,
                datasets: &self.datasets,
                t: self.t,
                iter: 0,
                tf: self.tf,
                range: self.range,
                onclose: true,
                event: RunEvent::Step,
            };
            for env in self.envs.iter_mut().filter(|e| selected(&e.id)) {
                if let Err(e) = env.run_init(&shared) {
                    error!("script '{}' init failed: {}", env.id, e);
                    failed = true;
                }
            }
        }

        if !failed {
            for (n, bar) in rows[start..].iter().enumerate() {
                if n > 0 && n % self.settings.chunk == 0 {
                    self.poll_inbox(inbox);
                    if self.restart {
                        self.restart = false;
                        self.running = false;
                        self.perf_ms = 0.0;
                        info!("full run restarted at bar {}", n);
                        return false;
                    }
                }
                self.iter = n;
                self.t = bar.time;
                self.base.step(bar, true);
                let onclose = start + n != rows.len() - 1;
                let shared = SharedCtx {
                    base: &self.base,
                    datasets: &self.datasets,
                    t: self.t,
                    iter: n,
                    tf: self.tf,
                    range: self.range,
                    onclose,
                    event: RunEvent::Step,
                };
                for env in self.envs.iter_mut().filter(|e| selected(&e.id)) {
                    if let Err(e) = env.step(&shared, true) {
                        error!("script '{}' failed at bar {}: {}", env.id, n, e);
                        failed = true;
                        break;
                    }
                }
                self.base.truncate();
                if failed {
                    break;
                }
            }
        }

        if !failed {
            let shared = SharedCtx {
                base: &self.base,
                datasets: &self.datasets,
                t: self.t,
                iter: self.iter,
                tf: self.tf,
                range: self.range,
                onclose: false,
                event: RunEvent::Step,
            };
            for env in self.envs.iter_mut().filter(|e| selected(&e.id)) {
                if let Err(e) = env.run_post(&shared) {
                    error!("script '{}' post failed: {}", env.id, e);
                }
            }
        }

        // signals raised during backtest-style iteration are discarded
        for env in &mut self.envs {
            env.signals.clear();
        }

        self.perf_ms = started.elapsed().as_secs_f64() * 1_000.0;
        self.running = false;
        true
    }

    fn step_envs(
        &mut self,
        sel: Option<&HashSet<String>>,
        unshift: bool,
        onclose: bool,
        event: RunEvent,
    ) -> Result<(), crate::error::RuntimeError> {
        let shared = SharedCtx {
            base: &self.base,
            datasets: &self.datasets,
            t: self.t,
            iter: self.iter,
            tf: self.tf,
            range: self.range,
            onclose,
            event,
        };
        for env in &mut self.envs {
            if sel.map(|s| s.contains(&env.id)).unwrap_or(true) {
                env.step(&shared, unshift)?;
            }
        }
        Ok(())
    }

    /// Build the ordered environment set for a pane topology. Scripts
    /// whose type is missing from the library degrade to no-op stubs.
    fn build_envs(&mut self, panes: &[PaneSpec]) {
        self.panes = panes.to_vec();
        let plot_names = self.library.plot_names();

        let mut slots: Vec<(&PaneSpec, &ScriptSpec)> = Vec::new();
        for pane in panes {
            for script in &pane.scripts {
                slots.push((pane, script));
            }
        }
        slots.sort_by(|a, b| {
            a.1.exec_order
                .cmp(&b.1.exec_order)
                .then_with(|| a.1.uuid.cmp(&b.1.uuid))
        });

        self.envs = slots
            .into_iter()
            .map(|(pane, spec)| match self.library.indicators.get(&spec.script_type) {
                Some(desc) => ScriptEnv::build(desc, spec, &pane.uuid, &plot_names),
                None => ScriptEnv::stub(spec, &pane.uuid, "unknown script type"),
            })
            .collect();
    }

    fn rebuild_env(&mut self, script_id: &str, patch: &HashMap<String, serde_json::Value>) {
        let plot_names = self.library.plot_names();
        for pane in &mut self.panes {
            for spec in &mut pane.scripts {
                if spec.uuid != script_id {
                    continue;
                }
                for (k, v) in patch {
                    spec.props.insert(k.clone(), v.clone());
                }
                let env = match self.library.indicators.get(&spec.script_type) {
                    Some(desc) => ScriptEnv::build(desc, spec, &pane.uuid, &plot_names),
                    None => ScriptEnv::stub(spec, &pane.uuid, "unknown script type"),
                };
                if let Some(slot) = self.envs.iter_mut().find(|e| e.id == *script_id) {
                    *slot = env;
                }
                return;
            }
        }
    }

    /// Absorb requests arriving at a cooperative yield point.
    fn poll_inbox(&mut self, inbox: Option<&Receiver<Envelope<Request>>>) {
        let Some(inbox) = inbox else {
            return;
        };
        while let Ok(req) = inbox.try_recv() {
            let Envelope { id, body } = req;
            match body {
                Request::RunAllScripts { panes } => {
                    let new_task: Vec<&str> = panes
                        .iter()
                        .flat_map(|p| p.scripts.iter().map(|s| s.uuid.as_str()))
                        .collect();
                    let cur_task: Vec<&str> =
                        self.envs.iter().map(|e| e.id.as_str()).collect();
                    if new_task != cur_task {
                        self.pending_full = Some((panes, id));
                        self.restart = true;
                    } else {
                        // duplicate of the active run; let it finish
                        self.send(id, Response::RunDone);
                    }
                }
                Request::RunSubset { delta } => self.delta_queue.push((delta, id)),
                Request::UpdateData { bars } => self.update_queue.push_back((bars, id)),
                other => self.pending_misc.push(Envelope { id, body: other }),
            }
        }
    }

    /// After a run drains: pending full run first, then the newest delta
    /// (older ones coalesce away), then streaming updates in arrival
    /// order.
    fn drain_queues(&mut self, inbox: Option<&Receiver<Envelope<Request>>>) {
        let misc = std::mem::take(&mut self.pending_misc);
        for req in misc {
            self.handle(req, inbox);
        }

        if let Some((panes, id)) = self.pending_full.take() {
            self.exec_all(panes, id, inbox);
        } else if !self.delta_queue.is_empty() {
            let (delta, id) = self.delta_queue.pop().expect("checked non-empty");
            let coalesced: Vec<String> = self.delta_queue.drain(..).map(|(_, id)| id).collect();
            for dropped in coalesced {
                self.send(dropped, Response::RunDone);
            }
            self.exec_sel(delta, id, inbox);
        } else {
            while let Some((bars, id)) = self.update_queue.pop_front() {
                self.update(bars, id);
            }
        }
    }

    fn emit_overlay_data(&mut self) {
        let shared = SharedCtx {
            base: &self.base,
            datasets: &self.datasets,
            t: self.t,
            iter: self.iter,
            tf: self.tf,
            range: self.range,
            onclose: false,
            event: RunEvent::Step,
        };
        for env in &mut self.envs {
            env.finalize_output(&shared, &self.library.prefabs);
        }

        let panes: Vec<PaneOut> = self
            .panes
            .iter()
            .map(|pane| PaneOut {
                id: pane.id.clone(),
                uuid: pane.uuid.clone(),
                overlays: self
                    .envs
                    .iter()
                    .filter(|e| e.pane == pane.uuid)
                    .flat_map(|e| e.output.overlays.iter().cloned())
                    .collect(),
            })
            .collect();
        self.emit(Response::OverlayData { panes });
        self.emit_modifies();
    }

    fn emit_modifies(&mut self) {
        let mut events = Vec::new();
        for env in &mut self.envs {
            // settings() patches address the script's own instance
            for patch in env.output.setting_updates.drain(..) {
                events.push((env.id.clone(), serde_json::json!({ "settings": patch })));
            }
            events.extend(env.output.modifies.drain(..));
        }
        for (uuid, fields) in events {
            self.emit(Response::ModifyOverlay { uuid, fields });
        }
    }

    /// Map of overlay uuid → last data row, for streaming refresh.
    fn last_points(&self) -> HashMap<String, Vec<f64>> {
        let mut points = HashMap::new();
        for env in &self.envs {
            for ov in &env.output.overlays {
                if let Some(last) = ov.data.last() {
                    points.insert(ov.uuid.clone(), last.clone());
                }
            }
        }
        points
    }

    fn emit_signals(&mut self) {
        let mut all = Vec::new();
        for env in &mut self.envs {
            all.append(&mut env.signals);
        }
        for sig in all {
            self.emit(Response::ScriptSignal {
                signal_type: sig.signal_type,
                data: sig.data,
            });
        }
    }

    fn recalc_size(&mut self) {
        if let Some(limit) = self.settings.ram_limit_mb {
            loop {
                let mb = self.total_size_mb();
                if mb <= limit {
                    break;
                }
                let oldest = self
                    .datasets
                    .values()
                    .min_by_key(|d| d.last_upd)
                    .map(|d| d.id.clone());
                match oldest {
                    Some(id) => {
                        warn!("dataset budget exceeded ({:.2} MB), evicting '{}'", mb, id);
                        self.datasets.remove(&id);
                    }
                    None => break,
                }
            }
        }
        self.data_size_mb = (self.total_size_mb() * 100.0).round() / 100.0;
    }

    fn total_size_mb(&self) -> f64 {
        let bytes: usize = self.datasets.values().map(|d| d.byte_size()).sum();
        bytes as f64 / (1024.0 * 1024.0)
    }

    pub fn state(&self) -> EngineState {
        EngineState {
            scripts: self.envs.len(),
            last_perf: self.perf_ms,
            iter: self.iter,
            last_t: self.t,
            data_size: self.data_size_mb,
            running: self.running,
        }
    }

    fn send_state(&self) {
        self.emit(Response::EngineState(self.state()));
    }

    fn send(&self, id: String, resp: Response) {
        let _ = self.out.send(Envelope { id, body: resp });
    }

    /// Engine-initiated event with a fresh correlation id.
    fn emit(&self, resp: Response) {
        self.send(uuid::Uuid::new_v4().to_string(), resp);
    }
}
