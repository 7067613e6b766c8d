//! Moving averages.

use crate::error::RuntimeError;
use crate::interp::EvalCtx;
use crate::series::SeriesKey;
use crate::value::{SeriesRef, Value};

use super::{nz_f, record, self_at, set0, src_at, src_tf};

type R = Result<Value, RuntimeError>;

const SWMA_WEIGHTS: [f64; 4] = [1.0 / 6.0, 2.0 / 6.0, 2.0 / 6.0, 1.0 / 6.0];

/// Simple moving average: arithmetic mean of the last `len` values.
pub(super) fn sma(cx: &mut EvalCtx, src: &Value, len: usize, key: &SeriesKey) -> R {
    let key = key.child(format!("sma({})", len));
    let mut sum = 0.0;
    for i in 0..len {
        sum += src_at(cx, src, i);
    }
    Ok(record(cx, &key, sum / len as f64, src_tf(cx, src)))
}

/// Exponential moving average with alpha = 2 / (len + 1), seeded with the
/// SMA until the previous EMA value exists.
pub(super) fn ema(cx: &mut EvalCtx, src: &Value, len: usize, key: &SeriesKey) -> R {
    let key = key.child(format!("ema({})", len));
    let a = 2.0 / (len as f64 + 1.0);
    record(cx, &key, f64::NAN, src_tf(cx, src));
    let prev = self_at(cx, &key, 1);
    let val = if prev.is_nan() {
        let seed = sma(cx, src, len, &key)?;
        src_at(cx, &seed, 0)
    } else {
        a * src_at(cx, src, 0) + (1.0 - a) * prev
    };
    set0(cx, &key, val);
    Ok(Value::Series(SeriesRef::Owned(key)))
}

/// Wilder's smoothing, alpha = 1 / len.
pub(super) fn rma(cx: &mut EvalCtx, src: &Value, len: usize, key: &SeriesKey) -> R {
    let key = key.child(format!("rma({})", len));
    record(cx, &key, f64::NAN, src_tf(cx, src));
    let prev = self_at(cx, &key, 1);
    let val = if prev.is_nan() {
        let seed = sma(cx, src, len, &key)?;
        src_at(cx, &seed, 0)
    } else {
        (src_at(cx, src, 0) + (len as f64 - 1.0) * nz_f(prev)) / len as f64
    };
    set0(cx, &key, val);
    Ok(Value::Series(SeriesRef::Owned(key)))
}

/// Weighted moving average, linear weights.
pub(super) fn wma(cx: &mut EvalCtx, src: &Value, len: usize, key: &SeriesKey) -> R {
    let key = key.child(format!("wma({})", len));
    let mut norm = 0.0;
    let mut sum = 0.0;
    for i in 0..len {
        let w = ((len - i) * len) as f64;
        norm += w;
        sum += src_at(cx, src, i) * w;
    }
    Ok(record(cx, &key, sum / norm, src_tf(cx, src)))
}

/// Hull moving average: wma(2*wma(n/2) - wma(n), sqrt(n)).
pub(super) fn hma(cx: &mut EvalCtx, src: &Value, len: usize, key: &SeriesKey) -> R {
    let key = key.child(format!("hma({})", len));
    let half = (len / 2).max(1);
    let root = (len as f64).sqrt().round() as usize;

    let wma_half = wma(cx, src, half, &key.child("1"))?;
    let wma_full = wma(cx, src, len, &key.child("2"))?;
    let delt = 2.0 * src_at(cx, &wma_half, 0) - src_at(cx, &wma_full, 0);
    let delt_ts = record(cx, &key.child("3"), delt, src_tf(cx, src));
    wma(cx, &delt_ts, root.max(1), &key.child("4"))
}

/// Volume-weighted moving average against the shared volume series.
pub(super) fn vwma(cx: &mut EvalCtx, src: &Value, len: usize, key: &SeriesKey) -> R {
    let key = key.child(format!("vwma({})", len));
    let vol = Value::Series(SeriesRef::Base(crate::feed::BaseField::Vol));
    let sxv = src_at(cx, src, 0) * src_at(cx, &vol, 0);
    let sxv_ts = record(cx, &key.child("1"), sxv, src_tf(cx, src));
    let num = sma(cx, &sxv_ts, len, &key.child("2"))?;
    let den = sma(cx, &vol, len, &key.child("3"))?;
    let res = src_at(cx, &num, 0) / src_at(cx, &den, 0);
    Ok(record(cx, &key.child("4"), res, src_tf(cx, src)))
}

/// Symmetrically weighted moving average over four bars.
pub(super) fn swma(cx: &mut EvalCtx, src: &Value, key: &SeriesKey) -> R {
    let key = key.child("swma");
    let sum = src_at(cx, src, 3) * SWMA_WEIGHTS[0]
        + src_at(cx, src, 2) * SWMA_WEIGHTS[1]
        + src_at(cx, src, 1) * SWMA_WEIGHTS[2]
        + src_at(cx, src, 0) * SWMA_WEIGHTS[3];
    Ok(record(cx, &key, sum, src_tf(cx, src)))
}

/// Arnaud Legoux moving average.
pub(super) fn alma(
    cx: &mut EvalCtx,
    src: &Value,
    len: usize,
    offset: f64,
    sigma: f64,
    key: &SeriesKey,
) -> R {
    let key = key.child(format!("alma({},{},{})", len, offset, sigma));
    let m = (offset * (len as f64 - 1.0)).floor();
    let s = len as f64 / sigma;
    let mut norm = 0.0;
    let mut sum = 0.0;
    for i in 0..len {
        let w = (-(i as f64 - m).powi(2) / (2.0 * s * s)).exp();
        norm += w;
        sum += src_at(cx, src, len - i - 1) * w;
    }
    Ok(record(cx, &key, sum / norm, src_tf(cx, src)))
}

/// Least-squares linear regression value at `offset` bars forward.
pub(super) fn linreg(
    cx: &mut EvalCtx,
    src: &Value,
    len: usize,
    offset: usize,
    key: &SeriesKey,
) -> R {
    let key = key.child(format!("linreg({})", len));
    if let Value::Series(r) = src {
        // the regression needs the full window even on bars that have not
        // read that deep yet
        match r {
            crate::value::SeriesRef::Base(f) => cx.shared.base.series(*f).reserve_depth(len),
            crate::value::SeriesRef::Owned(k) => {
                if let Some(s) = cx.store.get(k) {
                    s.reserve_depth(len);
                }
            }
            crate::value::SeriesRef::Sym { .. } => {}
        }
    }

    // x axis: bars back (0 = oldest in window), y: values
    let n = len as f64;
    let mut sum_x = 0.0;
    let mut sum_y = 0.0;
    let mut sum_xy = 0.0;
    let mut sum_xx = 0.0;
    for i in 0..len {
        let x = i as f64;
        let y = src_at(cx, src, len - 1 - i);
        sum_x += x;
        sum_y += y;
        sum_xy += x * y;
        sum_xx += x * x;
    }
    let slope = (n * sum_xy - sum_x * sum_y) / (n * sum_xx - sum_x * sum_x);
    let intercept = (sum_y - slope * sum_x) / n;
    let val = intercept + slope * (n - 1.0 + offset as f64);
    Ok(record(cx, &key, val, src_tf(cx, src)))
}
