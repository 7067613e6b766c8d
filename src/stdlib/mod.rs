//! Script standard library: ~100 primitives over managed time-series.
//!
//! Series-producing primitives take a trailing call-site key (appended by
//! the environment builder's instrumentation) and content-address their
//! output buffers with it, so a logical expression reuses one buffer
//! across iterations instead of reallocating. Every history read routes
//! through [`Series::get`], which records the observed depth.

mod channels;
mod math;
mod ma;
mod osc;
mod plumbing;
mod series_ops;
mod time;

use crate::error::RuntimeError;
use crate::interp::EvalCtx;
use crate::series::SeriesKey;
use crate::value::{SeriesRef, Value};

/// Declared arity of a primitive, excluding the implicit call-site key.
/// Missing optional arguments are right-padded with `Na` up to this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Fixed(usize),
    Variadic,
}

#[rustfmt::skip]
const REGISTRY: &[(&str, Arity)] = &[
    // series core
    ("ts", Arity::Fixed(1)), ("tstf", Arity::Fixed(2)), ("sample", Arity::Fixed(3)),
    ("offset", Arity::Fixed(2)), ("buffsize", Arity::Fixed(2)), ("fixnan", Arity::Fixed(1)),
    ("since", Arity::Fixed(1)), ("cum", Arity::Fixed(1)), ("change", Arity::Fixed(2)),
    ("rising", Arity::Fixed(2)), ("falling", Arity::Fixed(2)),
    ("cross", Arity::Fixed(2)), ("crossover", Arity::Fixed(2)), ("crossunder", Arity::Fixed(2)),
    ("highest", Arity::Fixed(2)), ("lowest", Arity::Fixed(2)),
    ("highestbars", Arity::Fixed(2)), ("lowestbars", Arity::Fixed(2)),
    ("sum", Arity::Fixed(2)), ("dev", Arity::Fixed(2)), ("stdev", Arity::Fixed(2)),
    ("variance", Arity::Fixed(2)),
    // value plumbing
    ("nz", Arity::Fixed(2)), ("na", Arity::Fixed(1)), ("nf", Arity::Fixed(2)),
    ("iff", Arity::Fixed(3)), ("bool", Arity::Fixed(1)),
    // scalar math
    ("abs", Arity::Fixed(1)), ("acos", Arity::Fixed(1)), ("asin", Arity::Fixed(1)),
    ("atan", Arity::Fixed(1)), ("ceil", Arity::Fixed(1)), ("cos", Arity::Fixed(1)),
    ("exp", Arity::Fixed(1)), ("floor", Arity::Fixed(1)), ("log", Arity::Fixed(1)),
    ("log10", Arity::Fixed(1)), ("pow", Arity::Fixed(2)), ("round", Arity::Fixed(1)),
    ("sign", Arity::Fixed(1)), ("sin", Arity::Fixed(1)), ("sqrt", Arity::Fixed(1)),
    ("tan", Arity::Fixed(1)), ("now", Arity::Fixed(0)), ("autoprec", Arity::Fixed(0)),
    ("avg", Arity::Variadic), ("max", Arity::Variadic), ("min", Arity::Variadic),
    // moving averages
    ("sma", Arity::Fixed(2)), ("ema", Arity::Fixed(2)), ("rma", Arity::Fixed(2)),
    ("wma", Arity::Fixed(2)), ("hma", Arity::Fixed(2)), ("vwma", Arity::Fixed(2)),
    ("swma", Arity::Fixed(1)), ("alma", Arity::Fixed(4)), ("linreg", Arity::Fixed(3)),
    // oscillators
    ("rsi", Arity::Fixed(2)), ("cci", Arity::Fixed(2)), ("cmo", Arity::Fixed(2)),
    ("cog", Arity::Fixed(2)), ("mfi", Arity::Fixed(2)), ("roc", Arity::Fixed(2)),
    ("mom", Arity::Fixed(2)), ("stoch", Arity::Fixed(4)), ("tsi", Arity::Fixed(3)),
    ("wpr", Arity::Fixed(1)), ("macd", Arity::Fixed(4)), ("dmi", Arity::Fixed(2)),
    // bands, trailing stops, pivots
    ("atr", Arity::Fixed(1)), ("tr", Arity::Fixed(1)), ("bb", Arity::Fixed(3)),
    ("bbw", Arity::Fixed(3)), ("kc", Arity::Fixed(4)), ("kcw", Arity::Fixed(4)),
    ("sar", Arity::Fixed(3)), ("supertrend", Arity::Fixed(2)),
    ("pivothigh", Arity::Fixed(3)), ("pivotlow", Arity::Fixed(3)),
    // calendar
    ("second", Arity::Fixed(1)), ("minute", Arity::Fixed(1)), ("hour", Arity::Fixed(1)),
    ("dayofweek", Arity::Fixed(1)), ("dayofmonth", Arity::Fixed(1)), ("month", Arity::Fixed(1)),
    ("year", Arity::Fixed(1)), ("weekofyear", Arity::Fixed(1)), ("onclose", Arity::Fixed(1)),
    // output & engine plumbing
    ("chart", Arity::Fixed(2)), ("onchart", Arity::Fixed(3)), ("offchart", Arity::Fixed(3)),
    ("view", Arity::Fixed(2)), ("sym", Arity::Fixed(2)),
    ("signal", Arity::Fixed(2)), ("signalif", Arity::Fixed(3)),
    ("settings", Arity::Fixed(1)), ("modify", Arity::Fixed(2)), ("prop", Arity::Fixed(2)),
];

pub fn arity(name: &str) -> Option<Arity> {
    REGISTRY.iter().find(|(n, _)| *n == name).map(|(_, a)| *a)
}

pub fn is_primitive(name: &str) -> bool {
    arity(name).is_some()
}

static NA: Value = Value::Na;

fn a(args: &[Value], i: usize) -> &Value {
    args.get(i).unwrap_or(&NA)
}

/// Dispatch an instrumented call.
pub fn call(
    name: &str,
    args: Vec<Value>,
    key: SeriesKey,
    cx: &mut EvalCtx,
) -> Result<Value, RuntimeError> {
    let g = |i: usize| a(&args, i);
    match name {
        // series core
        "ts" => series_ops::ts(cx, g(0), &key),
        "tstf" => series_ops::tstf(cx, g(0), g(1), &key),
        "sample" => series_ops::sample(cx, g(0), g(1), g(2), &key),
        "offset" => series_ops::offset(cx, g(0), g(1), &key),
        "buffsize" => series_ops::buffsize(cx, g(0), g(1)),
        "fixnan" => series_ops::fixnan(cx, g(0)),
        "since" => series_ops::since(cx, g(0), &key),
        "cum" => series_ops::cum(cx, g(0), &key),
        "change" => {
            let n = opt_len(cx, g(1), 1);
            series_ops::change(cx, g(0), n, &key)
        }
        "rising" => {
            let n = len(cx, g(1))?;
            series_ops::rising(cx, g(0), n, &key)
        }
        "falling" => {
            let n = len(cx, g(1))?;
            series_ops::falling(cx, g(0), n, &key)
        }
        "cross" => series_ops::cross(cx, g(0), g(1), &key),
        "crossover" => series_ops::crossover(cx, g(0), g(1), &key),
        "crossunder" => series_ops::crossunder(cx, g(0), g(1), &key),
        "highest" => {
            let n = len(cx, g(1))?;
            series_ops::highest(cx, g(0), n, &key)
        }
        "lowest" => {
            let n = len(cx, g(1))?;
            series_ops::lowest(cx, g(0), n, &key)
        }
        "highestbars" => {
            let n = len(cx, g(1))?;
            series_ops::highestbars(cx, g(0), n, &key)
        }
        "lowestbars" => {
            let n = len(cx, g(1))?;
            series_ops::lowestbars(cx, g(0), n, &key)
        }
        "sum" => {
            let n = len(cx, g(1))?;
            series_ops::sum(cx, g(0), n, &key)
        }
        "dev" => {
            let n = len(cx, g(1))?;
            series_ops::dev(cx, g(0), n, &key)
        }
        "stdev" => {
            let n = len(cx, g(1))?;
            series_ops::stdev(cx, g(0), n, &key)
        }
        "variance" => {
            let n = len(cx, g(1))?;
            series_ops::variance(cx, g(0), n, &key)
        }
        // value plumbing
        "nz" => Ok(series_ops::nz(cx, g(0), g(1))),
        "na" => Ok(Value::Bool(cx.num(g(0)).is_nan())),
        "nf" => Ok(series_ops::nf(cx, g(0), g(1))),
        "iff" => Ok(if cx.truthy(g(0)) {
            g(1).clone()
        } else {
            g(2).clone()
        }),
        "bool" => Ok(Value::Bool(cx.truthy(g(0)))),
        // scalar math
        "abs" | "acos" | "asin" | "atan" | "ceil" | "cos" | "exp" | "floor" | "log"
        | "log10" | "round" | "sign" | "sin" | "sqrt" | "tan" => {
            Ok(Value::Num(math::unary(name, cx.num(g(0)))))
        }
        "pow" => Ok(Value::Num(cx.num(g(0)).powf(cx.num(g(1))))),
        "now" => Ok(Value::Num(math::now_ms())),
        "autoprec" => Ok(math::autoprec(cx)),
        "avg" => Ok(math::avg(cx, &args)),
        "max" => Ok(math::fold_max(cx, &args)),
        "min" => Ok(math::fold_min(cx, &args)),
        // moving averages
        "sma" => {
            let n = len(cx, g(1))?;
            ma::sma(cx, g(0), n, &key)
        }
        "ema" => {
            let n = len(cx, g(1))?;
            ma::ema(cx, g(0), n, &key)
        }
        "rma" => {
            let n = len(cx, g(1))?;
            ma::rma(cx, g(0), n, &key)
        }
        "wma" => {
            let n = len(cx, g(1))?;
            ma::wma(cx, g(0), n, &key)
        }
        "hma" => {
            let n = len(cx, g(1))?;
            ma::hma(cx, g(0), n, &key)
        }
        "vwma" => {
            let n = len(cx, g(1))?;
            ma::vwma(cx, g(0), n, &key)
        }
        "swma" => ma::swma(cx, g(0), &key),
        "alma" => {
            let n = len(cx, g(1))?;
            let (off, sigma) = (cx.num(g(2)), cx.num(g(3)));
            ma::alma(cx, g(0), n, off, sigma, &key)
        }
        "linreg" => {
            let n = len(cx, g(1))?;
            let off = opt_len(cx, g(2), 0);
            ma::linreg(cx, g(0), n, off, &key)
        }
        // oscillators
        "rsi" => osc::rsi(cx, g(0), g(1), &key),
        "cci" => {
            let n = len(cx, g(1))?;
            osc::cci(cx, g(0), n, &key)
        }
        "cmo" => {
            let n = len(cx, g(1))?;
            osc::cmo(cx, g(0), n, &key)
        }
        "cog" => {
            let n = len(cx, g(1))?;
            osc::cog(cx, g(0), n, &key)
        }
        "mfi" => {
            let n = len(cx, g(1))?;
            osc::mfi(cx, g(0), n, &key)
        }
        "roc" => {
            let n = len(cx, g(1))?;
            osc::roc(cx, g(0), n, &key)
        }
        "mom" => {
            let n = len(cx, g(1))?;
            osc::mom(cx, g(0), n, &key)
        }
        "stoch" => {
            let n = len(cx, g(3))?;
            osc::stoch(cx, g(0), g(1), g(2), n, &key)
        }
        "tsi" => {
            let (short, long) = (len(cx, g(1))?, len(cx, g(2))?);
            osc::tsi(cx, g(0), short, long, &key)
        }
        "wpr" => {
            let n = len(cx, g(0))?;
            osc::wpr(cx, n, &key)
        }
        "macd" => {
            let (fast, slow, sig) = (len(cx, g(1))?, len(cx, g(2))?, len(cx, g(3))?);
            osc::macd(cx, g(0), fast, slow, sig, &key)
        }
        "dmi" => {
            let (n, smooth) = (len(cx, g(0))?, len(cx, g(1))?);
            osc::dmi(cx, n, smooth, &key)
        }
        // bands, trailing stops, pivots
        "atr" => {
            let n = len(cx, g(0))?;
            channels::atr(cx, n, &key)
        }
        "tr" => {
            let fix = cx.truthy(g(0));
            Ok(channels::tr(cx, fix, &key))
        }
        "bb" => {
            let (n, mult) = (len(cx, g(1))?, cx.num(g(2)));
            channels::bb(cx, g(0), n, mult, &key)
        }
        "bbw" => {
            let (n, mult) = (len(cx, g(1))?, cx.num(g(2)));
            channels::bbw(cx, g(0), n, mult, &key)
        }
        "kc" => {
            let (n, mult, use_tr) = (len(cx, g(1))?, cx.num(g(2)), opt_bool(cx, g(3), true));
            channels::kc(cx, g(0), n, mult, use_tr, &key)
        }
        "kcw" => {
            let (n, mult, use_tr) = (len(cx, g(1))?, cx.num(g(2)), opt_bool(cx, g(3), true));
            channels::kcw(cx, g(0), n, mult, use_tr, &key)
        }
        "sar" => {
            let (start, inc, max) = (cx.num(g(0)), cx.num(g(1)), cx.num(g(2)));
            channels::sar(cx, start, inc, max, &key)
        }
        "supertrend" => {
            let (factor, n) = (cx.num(g(0)), len(cx, g(1))?);
            channels::supertrend(cx, factor, n, &key)
        }
        "pivothigh" => {
            let (left, right) = (len(cx, g(1))?, len(cx, g(2))?);
            channels::pivothigh(cx, g(0), left, right, &key)
        }
        "pivotlow" => {
            let (left, right) = (len(cx, g(1))?, len(cx, g(2))?);
            channels::pivotlow(cx, g(0), left, right, &key)
        }
        // calendar
        "second" | "minute" | "hour" | "dayofweek" | "dayofmonth" | "month" | "year"
        | "weekofyear" => Ok(Value::Num(time::calendar(name, time::time_arg(cx, g(0))))),
        "onclose" => Ok(time::onclose(cx, g(0))),
        // output & engine plumbing
        "chart" => plumbing::chart(cx, g(0), g(1)),
        "onchart" => plumbing::onchart(cx, g(0), g(1), g(2), &key),
        "offchart" => plumbing::offchart(cx, g(0), g(1), g(2), &key),
        "view" => plumbing::view(cx, g(0), g(1)),
        "sym" => plumbing::sym(cx, g(0), g(1), &key),
        "signal" => plumbing::signal(cx, g(0), g(1)),
        "signalif" => plumbing::signalif(cx, g(0), g(1), g(2)),
        "settings" => plumbing::settings(cx, g(0)),
        "modify" => plumbing::modify(cx, g(0), g(1)),
        "prop" => plumbing::prop(cx, g(0), g(1)),
        _ => Err(RuntimeError::UnknownFunction(name.to_string())),
    }
}

// ---- shared helpers for the primitive implementations ----

/// Series value at history index i. Plain numbers behave as a series that
/// only has a current value.
pub(crate) fn src_at(cx: &EvalCtx, v: &Value, i: usize) -> f64 {
    match v {
        Value::Series(r) => cx.read_series(r, i),
        other if i == 0 => other.as_num(),
        _ => f64::NAN,
    }
}

/// Aggregation timeframe of the input, carried onto derived series.
pub(crate) fn src_tf(cx: &EvalCtx, v: &Value) -> Option<i64> {
    match v {
        Value::Series(r) => cx.series_tf(r),
        _ => None,
    }
}

/// Record a value into the call-site buffer and hand back its reference.
pub(crate) fn record(cx: &mut EvalCtx, key: &SeriesKey, x: f64, tf: Option<i64>) -> Value {
    cx.store.record(key, x, tf, cx.shared.t);
    Value::Series(SeriesRef::Owned(key.clone()))
}

/// Read the call-site's own buffer (depth-tracked).
pub(crate) fn self_at(cx: &EvalCtx, key: &SeriesKey, i: usize) -> f64 {
    cx.store.get(key).map(|s| s.get(i)).unwrap_or(f64::NAN)
}

/// Overwrite slot 0 of an existing call-site buffer.
pub(crate) fn set0(cx: &mut EvalCtx, key: &SeriesKey, v: f64) {
    if let Some(s) = cx.store.get_mut(key) {
        s.set(0, v);
    }
}

fn len(cx: &EvalCtx, v: &Value) -> Result<usize, RuntimeError> {
    let n = cx.num(v);
    if n.is_nan() || n < 0.0 {
        return Err(RuntimeError::type_err("length argument", "non-negative number"));
    }
    Ok(n as usize)
}

fn opt_len(cx: &EvalCtx, v: &Value, default: usize) -> usize {
    if v.is_na() {
        default
    } else {
        cx.num(v).max(0.0) as usize
    }
}

fn opt_bool(cx: &EvalCtx, v: &Value, default: bool) -> bool {
    if v.is_na() {
        default
    } else {
        cx.truthy(v)
    }
}

pub(crate) fn nz_f(x: f64) -> f64 {
    if x.is_nan() {
        0.0
    } else {
        x
    }
}
