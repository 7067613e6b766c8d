//! Tree-walking interpreter for instrumented script bodies.
//!
//! Every `series[index]` read funnels through [`EvalCtx::read_series`], so
//! retained-depth inference is uniform whether a series came from the
//! standard library, the base feed, a symbol or user code.

use std::collections::HashMap;

use crate::context::SharedCtx;
use crate::dsl::ast::{BinOp, Block, CallExpr, CallTarget, Expr, FnBody, FnDecl, Stmt, UnOp};
use crate::error::RuntimeError;
use crate::feed::BaseField;
use crate::output::{OutputKind, ScriptOutput, Signal};
use crate::series::{SeriesKey, SeriesStore, Stage};
use crate::stdlib;
use crate::symbol::Symbol;
use crate::value::{SeriesRef, Value};

/// A named view registered by a script; plot points routed to the view are
/// gated on its timeframe boundary.
#[derive(Debug, Clone)]
pub struct ViewSpec {
    pub name: String,
    pub tf: Option<i64>,
    pub props: Value,
}

/// Everything one lifecycle invocation can reach.
pub struct EvalCtx<'a> {
    pub shared: &'a SharedCtx<'a>,
    pub stage: Stage,
    pub script_id: &'a str,
    pub script_type: &'a str,
    pub store: &'a mut SeriesStore,
    pub syms: &'a mut HashMap<SeriesKey, Symbol>,
    pub views: &'a mut HashMap<String, ViewSpec>,
    pub props: &'a mut HashMap<String, Value>,
    pub settings: &'a mut HashMap<String, Value>,
    pub output: &'a mut ScriptOutput,
    pub signals: &'a mut Vec<Signal>,
    /// `static var` table, when evaluating overlay hooks.
    pub statics: Option<&'a HashMap<String, Value>>,
    /// User-declared functions, when evaluating overlay hooks.
    pub funcs: Option<&'a HashMap<String, FnDecl>>,
}

impl EvalCtx<'_> {
    pub fn read_series(&self, r: &SeriesRef, i: usize) -> f64 {
        match r {
            SeriesRef::Base(field) => self.shared.base.series(*field).get(i),
            SeriesRef::Owned(key) => self.store.get(key).map(|s| s.get(i)).unwrap_or(f64::NAN),
            SeriesRef::Sym { sym, field } => self
                .syms
                .get(sym)
                .map(|s| s.series(*field).get(i))
                .unwrap_or(f64::NAN),
        }
    }

    pub fn series_tf(&self, r: &SeriesRef) -> Option<i64> {
        match r {
            SeriesRef::Base(_) => None,
            SeriesRef::Owned(key) => self.store.get(key).and_then(|s| s.tf),
            SeriesRef::Sym { sym, .. } => self.syms.get(sym).map(|s| s.tf),
        }
    }

    pub fn series_offset(&self, r: &SeriesRef) -> i64 {
        match r {
            SeriesRef::Owned(key) => self.store.get(key).map(|s| s.offset.get()).unwrap_or(0),
            _ => 0,
        }
    }

    /// Numeric view of a value; series dereference to their current slot.
    pub fn num(&self, v: &Value) -> f64 {
        match v {
            Value::Series(r) => self.read_series(r, 0),
            other => other.as_num(),
        }
    }

    pub fn truthy(&self, v: &Value) -> bool {
        match v {
            Value::Series(r) => {
                let x = self.read_series(r, 0);
                x != 0.0 && !x.is_nan()
            }
            other => other.truthy(),
        }
    }
}

/// Execute a lifecycle body.
pub fn exec_block(block: &Block, cx: &mut EvalCtx, scope: &mut Scope) -> Result<(), RuntimeError> {
    exec_block_value(block, cx, scope).map(|_| ())
}

/// Execute a block, yielding the value of its last expression statement
/// (used for hook bodies).
pub fn exec_block_value(
    block: &Block,
    cx: &mut EvalCtx,
    scope: &mut Scope,
) -> Result<Value, RuntimeError> {
    let mut last = Value::Na;
    for stmt in &block.stmts {
        last = exec_stmt(stmt, cx, scope)?;
    }
    Ok(last)
}

fn exec_stmt(stmt: &Stmt, cx: &mut EvalCtx, scope: &mut Scope) -> Result<Value, RuntimeError> {
    match stmt {
        Stmt::Var { name, expr } | Stmt::StaticVar { name, expr } => {
            let val = eval(expr, cx, scope)?;
            scope.declare(name, val);
            Ok(Value::Na)
        }
        Stmt::Assign { name, expr } => {
            let val = eval(expr, cx, scope)?;
            if !scope.assign(name, &val) {
                if cx.props.contains_key(name) {
                    cx.props.insert(name.clone(), val);
                } else {
                    scope.declare(name, val);
                }
            }
            Ok(Value::Na)
        }
        Stmt::IndexAssign {
            target,
            index,
            expr,
        } => {
            let target = eval(target, cx, scope)?;
            let i_v = eval(index, cx, scope)?;
            let i = cx.num(&i_v);
            let val_v = eval(expr, cx, scope)?;
            let val = cx.num(&val_v);
            match target {
                Value::Series(SeriesRef::Owned(key)) => {
                    let Some(series) = cx.store.get_mut(&key) else {
                        return Err(RuntimeError::BadAssign(key.to_string()));
                    };
                    let i = i.max(0.0) as usize;
                    series.observe(i);
                    series.set(i, val);
                    Ok(Value::Na)
                }
                Value::Series(_) => Err(RuntimeError::BadAssign("shared series".into())),
                _ => Err(RuntimeError::BadAssign("non-series value".into())),
            }
        }
        Stmt::If { cond, then, other } => {
            let c = eval(cond, cx, scope)?;
            if cx.truthy(&c) {
                exec_block_value(then, cx, scope)
            } else if let Some(other) = other {
                exec_block_value(other, cx, scope)
            } else {
                Ok(Value::Na)
            }
        }
        Stmt::Expr(expr) => eval(expr, cx, scope),
        // hook declarations are collected at parse time
        Stmt::FnDecl(_) => Ok(Value::Na),
    }
}

pub fn eval(expr: &Expr, cx: &mut EvalCtx, scope: &mut Scope) -> Result<Value, RuntimeError> {
    match expr {
        Expr::Num(n) => Ok(Value::Num(*n)),
        Expr::Str(s) => Ok(Value::Str(s.clone())),
        Expr::Bool(b) => Ok(Value::Bool(*b)),
        Expr::Na => Ok(Value::Na),
        Expr::Ident(name) => resolve_ident(name, cx, scope),
        Expr::Unary { op, expr } => {
            let v = eval(expr, cx, scope)?;
            Ok(match op {
                UnOp::Neg => Value::Num(-cx.num(&v)),
                UnOp::Not => Value::Bool(!cx.truthy(&v)),
            })
        }
        Expr::Binary { op, lhs, rhs } => eval_binary(*op, lhs, rhs, cx, scope),
        Expr::Ternary { cond, then, other } => {
            let c = eval(cond, cx, scope)?;
            if cx.truthy(&c) {
                eval(then, cx, scope)
            } else {
                eval(other, cx, scope)
            }
        }
        Expr::Call(call) => eval_call(call, cx, scope),
        Expr::Index { target, index } => {
            let target = eval(target, cx, scope)?;
            let iv = eval(index, cx, scope)?;
            let i = cx.num(&iv);
            match target {
                Value::Series(r) => {
                    let i = if i.is_nan() || i < 0.0 { 0 } else { i as usize };
                    Ok(Value::Num(cx.read_series(&r, i)))
                }
                Value::List(items) => Ok(items
                    .get(i.max(0.0) as usize)
                    .cloned()
                    .unwrap_or(Value::Na)),
                _ => Err(RuntimeError::type_err("indexing", "series or list")),
            }
        }
        Expr::Member { target, field } => {
            let target = eval(target, cx, scope)?;
            match target {
                Value::Sym(id) => match BaseField::from_name(field) {
                    Some(f) => Ok(Value::Series(SeriesRef::Sym { sym: id, field: f })),
                    None => Err(RuntimeError::type_err(
                        format!("symbol field '{}'", field),
                        "open/high/low/close/vol",
                    )),
                },
                Value::Map(_) => Ok(target.map_get(field).cloned().unwrap_or(Value::Na)),
                _ => Err(RuntimeError::type_err(
                    format!("member '{}'", field),
                    "symbol or map",
                )),
            }
        }
        Expr::List(items) => items
            .iter()
            .map(|e| eval(e, cx, scope))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::List),
        Expr::Map(entries) => entries
            .iter()
            .map(|(k, e)| eval(e, cx, scope).map(|v| (k.clone(), v)))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Map),
    }
}

fn resolve_ident(name: &str, cx: &mut EvalCtx, scope: &Scope) -> Result<Value, RuntimeError> {
    if let Some(v) = scope.get(name) {
        return Ok(v.clone());
    }
    if let Some(v) = cx.props.get(name) {
        return Ok(v.clone());
    }
    if let Some(statics) = cx.statics {
        if let Some(v) = statics.get(name) {
            return Ok(v.clone());
        }
    }
    if let Some(field) = BaseField::from_name(name) {
        return Ok(Value::Series(SeriesRef::Base(field)));
    }
    match name {
        "t" | "time" => Ok(Value::Num(cx.shared.t as f64)),
        "iter" => Ok(Value::Num(cx.shared.iter as f64)),
        "tf" => Ok(Value::Num(cx.shared.tf as f64)),
        "range" => Ok(Value::List(vec![
            Value::Num(cx.shared.range.0 as f64),
            Value::Num(cx.shared.range.1 as f64),
        ])),
        _ => Err(RuntimeError::UnknownIdent(name.to_string())),
    }
}

fn eval_binary(
    op: BinOp,
    lhs: &Expr,
    rhs: &Expr,
    cx: &mut EvalCtx,
    scope: &mut Scope,
) -> Result<Value, RuntimeError> {
    if matches!(op, BinOp::And | BinOp::Or) {
        let l = eval(lhs, cx, scope)?;
        let lt = cx.truthy(&l);
        return match (op, lt) {
            (BinOp::And, false) => Ok(Value::Bool(false)),
            (BinOp::Or, true) => Ok(Value::Bool(true)),
            _ => {
                let r = eval(rhs, cx, scope)?;
                Ok(Value::Bool(cx.truthy(&r)))
            }
        };
    }

    let l = eval(lhs, cx, scope)?;
    let r = eval(rhs, cx, scope)?;

    if matches!(op, BinOp::Eq | BinOp::Ne) {
        if let (Value::Str(a), Value::Str(b)) = (&l, &r) {
            let eq = a == b;
            return Ok(Value::Bool(if op == BinOp::Eq { eq } else { !eq }));
        }
    }
    if op == BinOp::Add {
        if let (Value::Str(a), Value::Str(b)) = (&l, &r) {
            return Ok(Value::Str(format!("{}{}", a, b)));
        }
    }

    let (a, b) = (cx.num(&l), cx.num(&r));
    Ok(match op {
        BinOp::Add => Value::Num(a + b),
        BinOp::Sub => Value::Num(a - b),
        BinOp::Mul => Value::Num(a * b),
        BinOp::Div => Value::Num(a / b),
        BinOp::Rem => Value::Num(a % b),
        BinOp::Eq => Value::Bool(a == b),
        BinOp::Ne => Value::Bool(a != b),
        BinOp::Lt => Value::Bool(a < b),
        BinOp::Le => Value::Bool(a <= b),
        BinOp::Gt => Value::Bool(a > b),
        BinOp::Ge => Value::Bool(a >= b),
        BinOp::And | BinOp::Or => unreachable!("short-circuit ops handled above"),
    })
}

fn eval_call(call: &CallExpr, cx: &mut EvalCtx, scope: &mut Scope) -> Result<Value, RuntimeError> {
    let args: Vec<Value> = call
        .args
        .iter()
        .map(|e| eval(e, cx, scope))
        .collect::<Result<_, _>>()?;

    match call.target {
        CallTarget::Std { site } => {
            stdlib::call(&call.name, args, SeriesKey::site(cx.stage, site), cx)
        }
        CallTarget::Plot { site } => plot_call(call, args, site, cx),
        CallTarget::User | CallTarget::Unresolved => {
            if let Some(funcs) = cx.funcs {
                if let Some(decl) = funcs.get(&call.name) {
                    let decl = decl.clone();
                    return call_user_fn(&decl, args, cx);
                }
            }
            if stdlib::is_primitive(&call.name) {
                // hook bodies are not instrumented; key state by position
                let key = SeriesKey::named(format!("hook:{}:{}", call.name, call.pos));
                return stdlib::call(&call.name, args, key, cx);
            }
            Err(RuntimeError::UnknownFunction(call.name.clone()))
        }
    }
}

fn call_user_fn(
    decl: &FnDecl,
    args: Vec<Value>,
    cx: &mut EvalCtx,
) -> Result<Value, RuntimeError> {
    let mut scope = Scope::new();
    for (i, param) in decl.params.iter().enumerate() {
        scope.declare(param, args.get(i).cloned().unwrap_or(Value::Na));
    }
    match &decl.body {
        FnBody::Expr(expr) => eval(expr, cx, &mut scope),
        FnBody::Block(block) => exec_block_value(block, cx, &mut scope),
    }
}

/// Overlay plot primitive: instantiate a renderer-visible overlay of the
/// called type on the script's pane and append one value.
fn plot_call(
    call: &CallExpr,
    args: Vec<Value>,
    site: u32,
    cx: &mut EvalCtx,
) -> Result<Value, RuntimeError> {
    let value = args.first().cloned().unwrap_or(Value::Na);
    let default_settings = Value::Map(vec![]);
    let settings = args.get(1).cloned().unwrap_or(default_settings);

    let (mut row, offset) = point_row(cx, &value);
    let t = cx.shared.t + offset * cx.shared.tf;
    row.insert(0, t as f64);

    let dispatch_key = format!("{}:{}:{}", call.name, cx.stage, site);
    cx.output.point(
        dispatch_key,
        &call.name,
        &call.name,
        OutputKind::Pane,
        &settings,
        cx.script_id,
        None,
        row,
        offset,
    );
    Ok(Value::Na)
}

/// Flatten a plotted value into data-row columns plus its display offset.
pub fn point_row(cx: &EvalCtx, value: &Value) -> (Vec<f64>, i64) {
    match value {
        Value::Series(r) => (vec![cx.read_series(r, 0)], cx.series_offset(r)),
        Value::List(items) => {
            let mut off = 0;
            let row = items
                .iter()
                .map(|v| match v {
                    Value::Series(r) => {
                        off = cx.series_offset(r).max(off);
                        cx.read_series(r, 0)
                    }
                    other => other.as_num(),
                })
                .collect();
            (row, off)
        }
        Value::Sym(id) => match cx.syms.get(id) {
            Some(sym) => (
                vec![
                    sym.open.peek(0),
                    sym.high.peek(0),
                    sym.low.peek(0),
                    sym.close.peek(0),
                    sym.vol.peek(0),
                ],
                0,
            ),
            None => (vec![f64::NAN], 0),
        },
        other => (vec![other.as_num()], 0),
    }
}

/// Local variable frames for one body invocation.
#[derive(Debug)]
pub struct Scope {
    frames: Vec<HashMap<String, Value>>,
}

impl Scope {
    pub fn new() -> Self {
        Self {
            frames: vec![HashMap::new()],
        }
    }

    pub fn declare(&mut self, name: &str, val: Value) {
        self.frames
            .last_mut()
            .expect("scope always has a frame")
            .insert(name.to_string(), val);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.frames.iter().rev().find_map(|f| f.get(name))
    }

    /// Assign into the defining frame; false when undeclared.
    pub fn assign(&mut self, name: &str, val: &Value) -> bool {
        for frame in self.frames.iter_mut().rev() {
            if let Some(slot) = frame.get_mut(name) {
                *slot = val.clone();
                return true;
            }
        }
        false
    }
}
