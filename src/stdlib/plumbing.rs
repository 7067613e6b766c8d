//! Output and engine plumbing: chart routing, views, symbols, signals,
//! settings and prop declarations.

use crate::context::{RunEvent, OHLCV};
use crate::error::RuntimeError;
use crate::interp::{point_row, EvalCtx, ViewSpec};
use crate::output::{OutputKind, Signal};
use crate::series::SeriesKey;
use crate::symbol::{AggKind, SymParams, Symbol, WindowReducer};
use crate::value::Value;

use super::series_ops::tf_arg;

type R = Result<Value, RuntimeError>;

/// Resolve the view a plot call routes to and whether the point should be
/// dropped this bar (view timeframe gating).
fn view_route(cx: &EvalCtx, sett: &Value) -> (String, bool) {
    let name = sett
        .map_get("view")
        .and_then(|v| v.as_str())
        .unwrap_or("main")
        .to_string();
    let gated = match cx.views.get(&name).and_then(|s| s.tf) {
        Some(tf) => !cx.shared.bar_closes(tf),
        None => false,
    };
    (name, gated)
}

/// Display a value as the main chart of a view.
pub(super) fn chart(cx: &mut EvalCtx, x: &Value, sett: &Value) -> R {
    let sett = if sett.is_na() {
        Value::Map(vec![])
    } else {
        sett.clone()
    };
    let (view, gated) = view_route(cx, &sett);
    if gated {
        return Ok(Value::Na);
    }

    let otype = sett
        .map_get("type")
        .and_then(|v| v.as_str())
        .unwrap_or("Candles")
        .to_string();
    let (mut row, off) = point_row(cx, x);
    let t = cx.shared.t + off * cx.shared.tf;
    row.insert(0, t as f64);

    let script_id = cx.script_id.to_string();
    cx.output.point(
        format!("chart:{}", view),
        &otype,
        &otype,
        OutputKind::Chart,
        &sett,
        &script_id,
        Some(&view),
        row,
        off,
    );
    Ok(Value::Na)
}

pub(super) fn onchart(cx: &mut EvalCtx, x: &Value, name: &Value, sett: &Value, key: &SeriesKey) -> R {
    overlay_point(cx, x, name, sett, key, OutputKind::Onchart, "Spline")
}

pub(super) fn offchart(cx: &mut EvalCtx, x: &Value, name: &Value, sett: &Value, key: &SeriesKey) -> R {
    overlay_point(cx, x, name, sett, key, OutputKind::Offchart, "Spline")
}

fn overlay_point(
    cx: &mut EvalCtx,
    x: &Value,
    name: &Value,
    sett: &Value,
    key: &SeriesKey,
    kind: OutputKind,
    default_type: &str,
) -> R {
    let sett = if sett.is_na() {
        Value::Map(vec![])
    } else {
        sett.clone()
    };
    let (view_name, gated) = view_route(cx, &sett);
    if gated {
        return Ok(Value::Na);
    }
    let explicit = sett.map_get("view").is_some();
    let view = explicit.then_some(view_name);

    let name = name.as_str().unwrap_or("OV").to_string();
    let full_name = match &view {
        Some(v) => format!("{}/{}", v, name),
        None => name,
    };
    let otype = sett
        .map_get("type")
        .and_then(|v| v.as_str())
        .unwrap_or(default_type)
        .to_string();

    let (mut row, off) = point_row(cx, x);
    let t = cx.shared.t + off * cx.shared.tf;
    row.insert(0, t as f64);

    let script_id = cx.script_id.to_string();
    cx.output.point(
        format!("{:?}:{}:{}", kind, full_name, key),
        &otype,
        &full_name,
        kind,
        &sett,
        &script_id,
        view.as_deref(),
        row,
        off,
    );
    Ok(Value::Na)
}

/// Register (or fetch) a named view. The returned name is what plot
/// settings reference via the `view` key.
pub(super) fn view(cx: &mut EvalCtx, name: &Value, props: &Value) -> R {
    let Some(name) = name.as_str() else {
        return Err(RuntimeError::type_err("view name", "string"));
    };
    if !cx.views.contains_key(name) {
        let tf = props.map_get("tf").and_then(tf_arg);
        cx.views.insert(
            name.to_string(),
            ViewSpec {
                name: name.to_string(),
                tf,
                props: props.clone(),
            },
        );
    }
    Ok(Value::Str(name.to_string()))
}

/// Create or update an aggregated symbol at this call site.
///
/// `sym('30m')` resamples the base feed; `sym('dataset', {tf: '1H'})`
/// aggregates an uploaded dataset; `aggtype` picks the kind: `ohlcv`
/// (default), `copy`, or a window reducer name (`first/max/min/last/sum`
/// over the close column).
pub(super) fn sym(cx: &mut EvalCtx, x: &Value, params: &Value, key: &SeriesKey) -> R {
    if cx.syms.contains_key(key) {
        let dataset_id = cx.syms[key].dataset.clone();
        let Some(data) = cx.shared.datasets.get(&dataset_id) else {
            return Err(RuntimeError::Symbol(format!(
                "dataset '{}' is gone",
                dataset_id
            )));
        };
        let t = cx.shared.t;
        cx.syms.get_mut(key).unwrap().update(data, t);
        return Ok(Value::Sym(key.clone()));
    }

    let Some(arg) = x.as_str() else {
        return Err(RuntimeError::type_err("sym", "timeframe or dataset id"));
    };

    let mut p = SymParams::default();
    let dataset_id = match tf_arg(x) {
        Some(tf) => {
            p.tf = Some(tf);
            OHLCV.to_string()
        }
        None => arg.to_string(),
    };
    if let Value::Map(_) = params {
        p.tf = params.map_get("tf").and_then(tf_arg).or(p.tf);
        p.window = params.map_get("window").and_then(tf_arg);
        p.fillgaps = params.map_get("fillgaps").map(|v| v.truthy());
        p.format = params
            .map_get("format")
            .and_then(|v| v.as_str().map(str::to_string));
    }

    let kind = match params.map_get("aggtype").and_then(|v| v.as_str()) {
        None | Some("ohlcv") => AggKind::Ohlcv,
        Some("copy") => AggKind::Copy,
        Some(reducer) => AggKind::Custom(close_reducer(reducer)?),
    };

    let Some(data) = cx.shared.datasets.get(&dataset_id) else {
        return Err(RuntimeError::Symbol(format!(
            "unknown dataset '{}'",
            dataset_id
        )));
    };

    let mut sym = Symbol::new(key.clone(), data, kind, p, cx.shared.tf)?;
    sym.update(data, cx.shared.t);
    cx.syms.insert(key.clone(), sym);
    Ok(Value::Sym(key.clone()))
}

fn close_reducer(name: &str) -> Result<WindowReducer, RuntimeError> {
    let pick = |f: fn(f64, f64) -> f64, seed: f64| -> WindowReducer {
        Box::new(move |rows: &[Vec<f64>]| {
            rows.iter()
                .filter_map(|r| r.last().copied())
                .fold(seed, f)
        })
    };
    Ok(match name {
        "first" => Box::new(|rows| {
            rows.first()
                .and_then(|r| r.last().copied())
                .unwrap_or(f64::NAN)
        }),
        "last" => Box::new(|rows| {
            rows.last()
                .and_then(|r| r.last().copied())
                .unwrap_or(f64::NAN)
        }),
        "max" => pick(f64::max, f64::NEG_INFINITY),
        "min" => pick(f64::min, f64::INFINITY),
        "sum" => pick(|a, b| a + b, 0.0),
        other => {
            return Err(RuntimeError::type_err(
                format!("aggtype '{}'", other),
                "ohlcv/copy/first/max/min/last/sum",
            ))
        }
    })
}

/// Emit a host event. Only delivered for streaming updates; a full run
/// replaying history stays silent.
pub(super) fn signal(cx: &mut EvalCtx, stype: &Value, data: &Value) -> R {
    if cx.shared.event != RunEvent::Update {
        return Ok(Value::Na);
    }
    let Some(stype) = stype.as_str() else {
        return Err(RuntimeError::type_err("signal type", "string"));
    };
    cx.signals.push(Signal {
        signal_type: stype.to_string(),
        data: data.to_json(),
    });
    Ok(Value::Na)
}

pub(super) fn signalif(cx: &mut EvalCtx, cond: &Value, stype: &Value, data: &Value) -> R {
    if cx.truthy(cond) {
        signal(cx, stype, data)
    } else {
        Ok(Value::Na)
    }
}

/// Merge a settings patch and surface it to the host.
pub(super) fn settings(cx: &mut EvalCtx, upd: &Value) -> R {
    let Value::Map(entries) = upd else {
        return Err(RuntimeError::type_err("settings patch", "map"));
    };
    for (k, v) in entries {
        cx.settings.insert(k.clone(), v.clone());
    }
    cx.output.setting_updates.push(upd.to_json());
    Ok(Value::Na)
}

/// Request a field update on an arbitrary overlay.
pub(super) fn modify(cx: &mut EvalCtx, id: &Value, fields: &Value) -> R {
    let Some(id) = id.as_str() else {
        return Err(RuntimeError::type_err("overlay id", "string"));
    };
    cx.output.modifies.push((id.to_string(), fields.to_json()));
    Ok(Value::Na)
}

/// Declare a script property; the default applies only when the instance
/// has no value yet.
pub(super) fn prop(cx: &mut EvalCtx, name: &Value, descr: &Value) -> R {
    let Some(name) = name.as_str() else {
        return Err(RuntimeError::type_err("prop name", "string"));
    };
    if !cx.props.contains_key(name) {
        let def = descr.map_get("def").cloned().unwrap_or(Value::Na);
        cx.props.insert(name.to_string(), def);
    }
    Ok(Value::Na)
}
