//! Script environments: one per script instance, owning its private
//! series, symbols, views and produced output.
//!
//! Building an environment instruments the descriptor's lifecycle bodies:
//! standard-library calls get right-padded to their declared arity and a
//! deterministic call-site id (per-body counter); calls naming a parsed
//! overlay type route through the pane dispatch instead; series indexing
//! needs no rewriting here because every index read already funnels
//! through the interpreter's depth tracker.

use std::collections::{HashMap, HashSet};

use log::error;

use crate::context::SharedCtx;
use crate::dsl::ast::{Block, CallTarget, Expr, FnBody, Stmt};
use crate::dsl::{IndicatorDescriptor, OverlayPrefab};
use crate::error::RuntimeError;
use crate::interp::{self, EvalCtx, Scope, ViewSpec};
use crate::output::{ScriptOutput, Signal};
use crate::series::{SeriesKey, SeriesStore, Stage};
use crate::stdlib;
use crate::symbol::Symbol;
use crate::value::Value;

/// One script instance bound to a pane slot.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ScriptSpec {
    pub uuid: String,
    #[serde(rename = "type")]
    pub script_type: String,
    #[serde(default)]
    pub props: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub settings: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub exec_order: i64,
}

/// An instrumented lifecycle body.
#[derive(Debug, Clone, Default)]
struct Compiled {
    block: Block,
}

pub struct ScriptEnv {
    pub id: String,
    pub type_name: String,
    pub pane: String,
    pub exec_order: i64,
    init: Compiled,
    update: Compiled,
    post: Compiled,
    pub store: SeriesStore,
    pub syms: HashMap<SeriesKey, Symbol>,
    pub views: HashMap<String, ViewSpec>,
    pub props: HashMap<String, Value>,
    pub settings: HashMap<String, Value>,
    pub output: ScriptOutput,
    pub signals: Vec<Signal>,
    stub: bool,
}

impl ScriptEnv {
    /// Bind a descriptor to a pane slot.
    pub fn build(
        desc: &IndicatorDescriptor,
        spec: &ScriptSpec,
        pane: &str,
        plot_names: &HashSet<String>,
    ) -> ScriptEnv {
        let mut props: HashMap<String, Value> = desc
            .props
            .iter()
            .map(|p| (p.name.clone(), p.default.clone()))
            .collect();
        for (k, v) in &spec.props {
            props.insert(k.clone(), Value::from_json(v));
        }
        let settings = spec
            .settings
            .iter()
            .map(|(k, v)| (k.clone(), Value::from_json(v)))
            .collect();

        ScriptEnv {
            id: spec.uuid.clone(),
            type_name: desc.type_name.clone(),
            pane: pane.to_string(),
            exec_order: spec.exec_order,
            init: compile(&desc.init, plot_names),
            update: compile(&desc.update, plot_names),
            post: compile(&desc.post, plot_names),
            store: SeriesStore::new(),
            syms: HashMap::new(),
            views: HashMap::new(),
            props,
            settings,
            output: ScriptOutput::default(),
            signals: Vec::new(),
            stub: false,
        }
    }

    /// A no-op environment standing in for a script that could not be
    /// built. It keeps the pane topology intact without executing.
    pub fn stub(spec: &ScriptSpec, pane: &str, reason: &str) -> ScriptEnv {
        error!(
            "script '{}' ({}): degraded to no-op: {}",
            spec.uuid, spec.script_type, reason
        );
        ScriptEnv {
            id: spec.uuid.clone(),
            type_name: spec.script_type.clone(),
            pane: pane.to_string(),
            exec_order: spec.exec_order,
            init: Compiled::default(),
            update: Compiled::default(),
            post: Compiled::default(),
            store: SeriesStore::new(),
            syms: HashMap::new(),
            views: HashMap::new(),
            props: HashMap::new(),
            settings: HashMap::new(),
            output: ScriptOutput::default(),
            signals: Vec::new(),
            stub: true,
        }
    }

    pub fn is_stub(&self) -> bool {
        self.stub
    }

    pub fn run_init(&mut self, shared: &SharedCtx) -> Result<(), RuntimeError> {
        self.output.clear();
        self.run_stage(Stage::Init, shared)
    }

    /// One bar. With `unshift` every owned series advances one slot before
    /// the update body runs; otherwise slot 0 is revised in place.
    pub fn step(&mut self, shared: &SharedCtx, unshift: bool) -> Result<(), RuntimeError> {
        if self.stub {
            return Ok(());
        }
        if unshift {
            self.store.unshift_all();
        }
        self.run_stage(Stage::Update, shared)?;
        self.store.truncate_all();
        Ok(())
    }

    pub fn run_post(&mut self, shared: &SharedCtx) -> Result<(), RuntimeError> {
        self.run_stage(Stage::Post, shared)
    }

    fn run_stage(&mut self, stage: Stage, shared: &SharedCtx) -> Result<(), RuntimeError> {
        if self.stub {
            return Ok(());
        }
        let block = match stage {
            Stage::Init => &self.init.block,
            Stage::Update => &self.update.block,
            Stage::Post => &self.post.block,
        };
        let mut cx = EvalCtx {
            shared,
            stage,
            script_id: &self.id,
            script_type: &self.type_name,
            store: &mut self.store,
            syms: &mut self.syms,
            views: &mut self.views,
            props: &mut self.props,
            settings: &mut self.settings,
            output: &mut self.output,
            signals: &mut self.signals,
            statics: None,
            funcs: None,
        };
        let mut scope = Scope::new();
        interp::exec_block(block, &mut cx, &mut scope)
    }

    /// Attach legend / y-range hook results from the overlay prefabs to
    /// this script's produced overlays.
    pub fn finalize_output(&mut self, shared: &SharedCtx, prefabs: &HashMap<String, OverlayPrefab>) {
        for i in 0..self.output.overlays.len() {
            let (otype, last_row, hi, lo) = {
                let ov = &self.output.overlays[i];
                let last = ov.data.last().cloned();
                let mut hi = f64::NEG_INFINITY;
                let mut lo = f64::INFINITY;
                for row in &ov.data {
                    for &v in &row[1..] {
                        if v > hi {
                            hi = v;
                        }
                        if v < lo {
                            lo = v;
                        }
                    }
                }
                (ov.overlay_type.clone(), last, hi, lo)
            };
            let Some(prefab) = prefabs.get(&otype) else {
                continue;
            };

            if let Some(legend) = &prefab.legend {
                if !prefab.flags.no_legend {
                    let args = vec![last_row
                        .as_ref()
                        .map(|r| Value::List(r.iter().map(|&v| Value::Num(v)).collect()))
                        .unwrap_or(Value::Na)];
                    if let Some(v) = self.eval_hook(shared, prefab, legend, args) {
                        self.output.overlays[i].legend = Some(v.to_json());
                    }
                }
            }
            if let Some(y_range) = &prefab.y_range {
                let args = if prefab.flags.y_range_pre_calc {
                    vec![Value::Num(hi), Value::Num(lo)]
                } else {
                    vec![Value::Na, Value::Na]
                };
                if let Some(Value::List(range)) = self.eval_hook(shared, prefab, y_range, args) {
                    if range.len() >= 2 {
                        self.output.overlays[i].y_range =
                            Some((range[0].as_num(), range[1].as_num()));
                    }
                }
            }
            if let Some(tracker) = &prefab.value_tracker {
                let args = vec![last_row
                    .as_ref()
                    .and_then(|r| r.get(1))
                    .map(|&v| Value::Num(v))
                    .unwrap_or(Value::Na)];
                if let Some(v) = self.eval_hook(shared, prefab, tracker, args) {
                    self.output.overlays[i].tracker = Some(v.to_json());
                }
            }
        }
    }

    fn eval_hook(
        &mut self,
        shared: &SharedCtx,
        prefab: &OverlayPrefab,
        decl: &crate::dsl::ast::FnDecl,
        args: Vec<Value>,
    ) -> Option<Value> {
        let statics: HashMap<String, Value> = prefab.statics.iter().cloned().collect();
        let mut cx = EvalCtx {
            shared,
            stage: Stage::Post,
            script_id: &self.id,
            script_type: &self.type_name,
            store: &mut self.store,
            syms: &mut self.syms,
            views: &mut self.views,
            props: &mut self.props,
            settings: &mut self.settings,
            output: &mut self.output,
            signals: &mut self.signals,
            statics: Some(&statics),
            funcs: Some(&prefab.funcs),
        };
        let mut scope = Scope::new();
        for (i, param) in decl.params.iter().enumerate() {
            scope.declare(param, args.get(i).cloned().unwrap_or(Value::Na));
        }
        let res = match &decl.body {
            FnBody::Expr(expr) => interp::eval(expr, &mut cx, &mut scope),
            FnBody::Block(block) => interp::exec_block_value(block, &mut cx, &mut scope),
        };
        res.ok().filter(|v| !matches!(v, Value::Na))
    }
}

fn compile(block: &Block, plot_names: &HashSet<String>) -> Compiled {
    let mut block = block.clone();
    let mut counter = 0u32;
    instrument_block(&mut block, &mut counter, plot_names);
    Compiled { block }
}

/// Walk a body depth-first assigning call-site ordinals, padding
/// standard-library calls to their declared arity and routing overlay
/// plot calls through the pane dispatch.
fn instrument_block(block: &mut Block, counter: &mut u32, plots: &HashSet<String>) {
    for stmt in &mut block.stmts {
        instrument_stmt(stmt, counter, plots);
    }
}

fn instrument_stmt(stmt: &mut Stmt, counter: &mut u32, plots: &HashSet<String>) {
    match stmt {
        Stmt::Var { expr, .. } | Stmt::StaticVar { expr, .. } | Stmt::Assign { expr, .. } => {
            instrument_expr(expr, counter, plots)
        }
        Stmt::IndexAssign {
            target,
            index,
            expr,
        } => {
            instrument_expr(target, counter, plots);
            instrument_expr(index, counter, plots);
            instrument_expr(expr, counter, plots);
        }
        Stmt::If { cond, then, other } => {
            instrument_expr(cond, counter, plots);
            instrument_block(then, counter, plots);
            if let Some(other) = other {
                instrument_block(other, counter, plots);
            }
        }
        Stmt::Expr(expr) => instrument_expr(expr, counter, plots),
        Stmt::FnDecl(decl) => match &mut decl.body {
            FnBody::Block(block) => instrument_block(block, counter, plots),
            FnBody::Expr(expr) => instrument_expr(expr, counter, plots),
        },
    }
}

fn instrument_expr(expr: &mut Expr, counter: &mut u32, plots: &HashSet<String>) {
    match expr {
        Expr::Call(call) => {
            for arg in &mut call.args {
                instrument_expr(arg, counter, plots);
            }
            *counter += 1;
            if let Some(arity) = stdlib::arity(&call.name) {
                call.target = CallTarget::Std { site: *counter };
                if let stdlib::Arity::Fixed(n) = arity {
                    while call.args.len() < n {
                        call.args.push(Expr::Na);
                    }
                }
            } else if plots.contains(&call.name) {
                call.target = CallTarget::Plot { site: *counter };
            }
        }
        Expr::Unary { expr, .. } => instrument_expr(expr, counter, plots),
        Expr::Binary { lhs, rhs, .. } => {
            instrument_expr(lhs, counter, plots);
            instrument_expr(rhs, counter, plots);
        }
        Expr::Ternary { cond, then, other } => {
            instrument_expr(cond, counter, plots);
            instrument_expr(then, counter, plots);
            instrument_expr(other, counter, plots);
        }
        Expr::Index { target, index } => {
            instrument_expr(target, counter, plots);
            instrument_expr(index, counter, plots);
        }
        Expr::Member { target, .. } => instrument_expr(target, counter, plots),
        Expr::List(items) => {
            for item in items {
                instrument_expr(item, counter, plots);
            }
        }
        Expr::Map(entries) => {
            for (_, v) in entries {
                instrument_expr(v, counter, plots);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsl::parser::parse_body;

    fn call_targets(block: &Block) -> Vec<(String, CallTarget)> {
        fn walk(expr: &Expr, out: &mut Vec<(String, CallTarget)>) {
            if let Expr::Call(c) = expr {
                for a in &c.args {
                    walk(a, out);
                }
                out.push((c.name.clone(), c.target));
            } else if let Expr::Index { target, index } = expr {
                walk(target, out);
                walk(index, out);
            }
        }
        let mut out = Vec::new();
        for stmt in &block.stmts {
            match stmt {
                Stmt::Var { expr, .. } | Stmt::Expr(expr) => walk(expr, &mut out),
                _ => {}
            }
        }
        out
    }

    #[test]
    fn call_sites_are_deterministic_and_increasing() {
        let mut block = parse_body("var a = sma(close, 14)\nvar b = ema(close, 9)").unwrap();
        let mut counter = 0;
        instrument_block(&mut block, &mut counter, &HashSet::new());
        let targets = call_targets(&block);
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].1, CallTarget::Std { site: 1 });
        assert_eq!(targets[1].1, CallTarget::Std { site: 2 });
    }

    #[test]
    fn nested_calls_number_depth_first() {
        let mut block = parse_body("var a = sma(rsi(close, 14), 5)").unwrap();
        let mut counter = 0;
        instrument_block(&mut block, &mut counter, &HashSet::new());
        let targets = call_targets(&block);
        // rsi is visited (and numbered) before its enclosing sma
        assert_eq!(targets[0].0, "rsi");
        assert_eq!(targets[0].1, CallTarget::Std { site: 1 });
        assert_eq!(targets[1].0, "sma");
        assert_eq!(targets[1].1, CallTarget::Std { site: 2 });
    }

    #[test]
    fn missing_optional_args_are_padded() {
        let mut block = parse_body("var a = change(close)").unwrap();
        let mut counter = 0;
        instrument_block(&mut block, &mut counter, &HashSet::new());
        match &block.stmts[0] {
            Stmt::Var { expr: Expr::Call(c), .. } => {
                assert_eq!(c.args.len(), 2);
                assert_eq!(c.args[1], Expr::Na);
            }
            other => panic!("expected call, got {:?}", other),
        }
    }

    #[test]
    fn plot_names_route_to_pane_dispatch() {
        let mut plots = HashSet::new();
        plots.insert("Spline".to_string());
        let mut block = parse_body("Spline(1.0, { color: '#f00' })").unwrap();
        let mut counter = 0;
        instrument_block(&mut block, &mut counter, &plots);
        let targets = call_targets(&block);
        assert_eq!(targets[0].1, CallTarget::Plot { site: 1 });
    }

    #[test]
    fn unknown_calls_stay_unresolved() {
        let mut block = parse_body("mystery(1)").unwrap();
        let mut counter = 0;
        instrument_block(&mut block, &mut counter, &HashSet::new());
        let targets = call_targets(&block);
        assert_eq!(targets[0].1, CallTarget::Unresolved);
    }
}
