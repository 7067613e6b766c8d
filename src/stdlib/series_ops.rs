//! Core series primitives: recording, shifting, counters and window scans.

use crate::error::RuntimeError;
use crate::interp::EvalCtx;
use crate::sampler::Reducer;
use crate::series::SeriesKey;
use crate::timeframe::parse_tf;
use crate::value::{SeriesRef, Value};

use super::{record, self_at, set0, src_at, src_tf};

type R = Result<Value, RuntimeError>;

/// Parse a timeframe argument (string like "1H" or raw milliseconds).
pub(super) fn tf_arg(v: &Value) -> Option<i64> {
    match v {
        Value::Str(s) => parse_tf(s),
        Value::Num(n) if *n > 0.0 => Some(*n as i64),
        _ => None,
    }
}

/// Record each x into a new time-series at the call site.
pub(super) fn ts(cx: &mut EvalCtx, x: &Value, key: &SeriesKey) -> R {
    let v = cx.num(x);
    Ok(record(cx, key, v, None))
}

/// Like `ts`, aggregated to a coarser timeframe through a last-value
/// sampler.
pub(super) fn tstf(cx: &mut EvalCtx, x: &Value, tf: &Value, key: &SeriesKey) -> R {
    let v = cx.num(x);
    let Some(tf) = tf_arg(tf) else {
        return Err(RuntimeError::type_err("tstf timeframe", "timeframe"));
    };
    Ok(record(cx, key, v, Some(tf)))
}

/// Custom sampler: `sample(x, 'max', '1H')`.
pub(super) fn sample(cx: &mut EvalCtx, x: &Value, kind: &Value, tf: &Value, key: &SeriesKey) -> R {
    let v = cx.num(x);
    let kind = kind
        .as_str()
        .and_then(Reducer::for_role)
        .ok_or_else(|| RuntimeError::type_err("sample kind", "first/max/min/last/sum"))?;
    let Some(tf) = tf_arg(tf) else {
        return Err(RuntimeError::type_err("sample timeframe", "timeframe"));
    };
    let t = cx.shared.t;
    cx.store.record_sampled(key, v, kind, tf, t);
    Ok(Value::Series(SeriesRef::Owned(key.clone())))
}

/// Display-only shift. Stored values are untouched; only the offset
/// metadata consumed by the renderer changes.
pub(super) fn offset(cx: &mut EvalCtx, src: &Value, n: &Value, key: &SeriesKey) -> R {
    let shift = cx.num(n) as i64;
    if let Value::Series(SeriesRef::Owned(k)) = src {
        if let Some(s) = cx.store.get(k) {
            s.offset.set(shift);
        }
        return Ok(src.clone());
    }
    let v = cx.num(src);
    let out = record(cx, key, v, None);
    if let Some(s) = cx.store.get(key) {
        s.offset.set(shift);
    }
    Ok(out)
}

/// Explicit retained-length floor for a series.
pub(super) fn buffsize(cx: &mut EvalCtx, src: &Value, n: &Value) -> R {
    let n = cx.num(n).max(0.0) as usize;
    match src {
        Value::Series(SeriesRef::Owned(k)) => {
            if let Some(s) = cx.store.get(k) {
                s.reserve_depth(n);
            }
        }
        Value::Series(SeriesRef::Base(f)) => cx.shared.base.series(*f).reserve_depth(n),
        _ => {}
    }
    Ok(Value::Na)
}

/// Replace a NaN current value with the nearest previous non-NaN value.
pub(super) fn fixnan(cx: &mut EvalCtx, src: &Value) -> R {
    if let Value::Series(SeriesRef::Owned(k)) = src {
        let Some(s) = cx.store.get_mut(k) else {
            return Ok(src.clone());
        };
        if s.peek(0).is_nan() {
            for i in 1..s.len() {
                let v = s.peek(i);
                if !v.is_nan() {
                    s.set(0, v);
                    break;
                }
            }
        }
    }
    Ok(src.clone())
}

/// 0 on the bar the condition becomes true, else previous value + 1.
pub(super) fn since(cx: &mut EvalCtx, cond: &Value, key: &SeriesKey) -> R {
    let key = key.child("since()");
    let fired = cx.truthy(cond);
    record(cx, &key, f64::NAN, None);
    let prev = self_at(cx, &key, 1);
    set0(cx, &key, if fired { 0.0 } else { prev + 1.0 });
    Ok(Value::Series(SeriesRef::Owned(key)))
}

/// Running sum of the source.
pub(super) fn cum(cx: &mut EvalCtx, src: &Value, key: &SeriesKey) -> R {
    let key = key.child("cum");
    let x = super::nz_f(src_at(cx, src, 0));
    record(cx, &key, 0.0, src_tf(cx, src));
    let prev = super::nz_f(self_at(cx, &key, 1));
    set0(cx, &key, x + prev);
    Ok(Value::Series(SeriesRef::Owned(key)))
}

/// x[0] - x[len].
pub(super) fn change(cx: &mut EvalCtx, src: &Value, len: usize, key: &SeriesKey) -> R {
    let key = key.child(format!("change({})", len));
    let v = src_at(cx, src, 0) - src_at(cx, src, len);
    Ok(record(cx, &key, v, src_tf(cx, src)))
}

pub(super) fn rising(cx: &mut EvalCtx, src: &Value, len: usize, key: &SeriesKey) -> R {
    let key = key.child(format!("rising({})", len));
    let top = src_at(cx, src, 0);
    let mut is_rising = true;
    for i in 1..len + 1 {
        if top <= src_at(cx, src, i) {
            is_rising = false;
            break;
        }
    }
    Ok(record(
        cx,
        &key,
        if is_rising { 1.0 } else { 0.0 },
        src_tf(cx, src),
    ))
}

pub(super) fn falling(cx: &mut EvalCtx, src: &Value, len: usize, key: &SeriesKey) -> R {
    let key = key.child(format!("falling({})", len));
    let bot = src_at(cx, src, 0);
    let mut is_falling = true;
    for i in 1..len + 1 {
        if bot >= src_at(cx, src, i) {
            is_falling = false;
            break;
        }
    }
    Ok(record(
        cx,
        &key,
        if is_falling { 1.0 } else { 0.0 },
        src_tf(cx, src),
    ))
}

/// True when one series crosses another in either direction.
pub(super) fn cross(cx: &mut EvalCtx, a: &Value, b: &Value, key: &SeriesKey) -> R {
    let key = key.child("cross");
    let x = (src_at(cx, a, 0) > src_at(cx, b, 0)) != (src_at(cx, a, 1) > src_at(cx, b, 1));
    Ok(record(cx, &key, if x { 1.0 } else { 0.0 }, src_tf(cx, a)))
}

pub(super) fn crossover(cx: &mut EvalCtx, a: &Value, b: &Value, key: &SeriesKey) -> R {
    let key = key.child("crossover");
    let x = src_at(cx, a, 0) > src_at(cx, b, 0) && src_at(cx, a, 1) <= src_at(cx, b, 1);
    Ok(record(cx, &key, if x { 1.0 } else { 0.0 }, src_tf(cx, a)))
}

pub(super) fn crossunder(cx: &mut EvalCtx, a: &Value, b: &Value, key: &SeriesKey) -> R {
    let key = key.child("crossunder");
    let x = src_at(cx, a, 0) < src_at(cx, b, 0) && src_at(cx, a, 1) >= src_at(cx, b, 1);
    Ok(record(cx, &key, if x { 1.0 } else { 0.0 }, src_tf(cx, a)))
}

pub(super) fn highest(cx: &mut EvalCtx, src: &Value, len: usize, key: &SeriesKey) -> R {
    let key = key.child(format!("highest({})", len));
    let mut high = f64::NEG_INFINITY;
    for i in 0..len {
        let v = src_at(cx, src, i);
        if v > high {
            high = v;
        }
    }
    Ok(record(cx, &key, high, src_tf(cx, src)))
}

pub(super) fn lowest(cx: &mut EvalCtx, src: &Value, len: usize, key: &SeriesKey) -> R {
    let key = key.child(format!("lowest({})", len));
    let mut low = f64::INFINITY;
    for i in 0..len {
        let v = src_at(cx, src, i);
        if v < low {
            low = v;
        }
    }
    Ok(record(cx, &key, low, src_tf(cx, src)))
}

/// Negated offset of the highest value within the window.
pub(super) fn highestbars(cx: &mut EvalCtx, src: &Value, len: usize, key: &SeriesKey) -> R {
    let key = key.child(format!("highestbars({})", len));
    let mut high = f64::NEG_INFINITY;
    let mut hi = 0usize;
    for i in 0..len {
        let v = src_at(cx, src, i);
        if v > high {
            high = v;
            hi = i;
        }
    }
    Ok(record(cx, &key, -(hi as f64), src_tf(cx, src)))
}

pub(super) fn lowestbars(cx: &mut EvalCtx, src: &Value, len: usize, key: &SeriesKey) -> R {
    let key = key.child(format!("lowestbars({})", len));
    let mut low = f64::INFINITY;
    let mut li = 0usize;
    for i in 0..len {
        let v = src_at(cx, src, i);
        if v < low {
            low = v;
            li = i;
        }
    }
    Ok(record(cx, &key, -(li as f64), src_tf(cx, src)))
}

/// Sliding sum of the last `len` values.
pub(super) fn sum(cx: &mut EvalCtx, src: &Value, len: usize, key: &SeriesKey) -> R {
    let key = key.child(format!("sum({})", len));
    let mut acc = 0.0;
    for i in 0..len {
        acc += src_at(cx, src, i);
    }
    Ok(record(cx, &key, acc, src_tf(cx, src)))
}

/// Mean absolute deviation from the SMA.
pub(super) fn dev(cx: &mut EvalCtx, src: &Value, len: usize, key: &SeriesKey) -> R {
    let key = key.child(format!("dev({})", len));
    let mean = mean_of(cx, src, len);
    let mut acc = 0.0;
    for i in 0..len {
        acc += (src_at(cx, src, i) - mean).abs();
    }
    Ok(record(cx, &key, acc / len as f64, src_tf(cx, src)))
}

pub(super) fn stdev(cx: &mut EvalCtx, src: &Value, len: usize, key: &SeriesKey) -> R {
    let key = key.child(format!("stdev({})", len));
    let v = variance_of(cx, src, len);
    Ok(record(cx, &key, v.sqrt(), src_tf(cx, src)))
}

pub(super) fn variance(cx: &mut EvalCtx, src: &Value, len: usize, key: &SeriesKey) -> R {
    let key = key.child(format!("variance({})", len));
    let v = variance_of(cx, src, len);
    Ok(record(cx, &key, v, src_tf(cx, src)))
}

pub(super) fn nz(cx: &EvalCtx, x: &Value, fallback: &Value) -> Value {
    let v = cx.num(x);
    if v.is_nan() {
        let f = cx.num(fallback);
        Value::Num(if f.is_nan() { 0.0 } else { f })
    } else {
        Value::Num(v)
    }
}

/// Replace infinities; default replacement is NaN.
pub(super) fn nf(cx: &EvalCtx, x: &Value, fallback: &Value) -> Value {
    let v = cx.num(x);
    if v.is_infinite() {
        Value::Num(if fallback.is_na() {
            f64::NAN
        } else {
            cx.num(fallback)
        })
    } else {
        Value::Num(v)
    }
}

fn mean_of(cx: &EvalCtx, src: &Value, len: usize) -> f64 {
    let mut acc = 0.0;
    for i in 0..len {
        acc += src_at(cx, src, i);
    }
    acc / len as f64
}

fn variance_of(cx: &EvalCtx, src: &Value, len: usize) -> f64 {
    let mean = mean_of(cx, src, len);
    let mut sqd = 0.0;
    for i in 0..len {
        let d = src_at(cx, src, i) - mean;
        sqd += d * d;
    }
    sqd / len as f64
}
