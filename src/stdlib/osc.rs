//! Oscillators and momentum indicators.

use crate::error::RuntimeError;
use crate::feed::BaseField;
use crate::interp::EvalCtx;
use crate::series::SeriesKey;
use crate::value::{SeriesRef, Value};

use super::series_ops::{change, sum};
use super::{ma, record, src_at, src_tf};

type R = Result<Value, RuntimeError>;

fn base(field: BaseField) -> Value {
    Value::Series(SeriesRef::Base(field))
}

/// Relative Strength Index. Two call shapes:
/// `(gain_series, loss_series)` applies `100 - 100/(1 + x/y)` directly;
/// `(source, length)` applies Wilder's smoothing of up/down moves.
pub(super) fn rsi(cx: &mut EvalCtx, x: &Value, y: &Value, key: &SeriesKey) -> R {
    let (key, val) = if matches!(y, Value::Series(_)) {
        let key = key.child("rsi(x,y)");
        let ratio = src_at(cx, x, 0) / src_at(cx, y, 0);
        (key, 100.0 - 100.0 / (1.0 + ratio))
    } else {
        let len = cx.num(y).max(1.0) as usize;
        let key = key.child(format!("rsi({})", len));
        let ch = change(cx, x, 1, &key)?;
        let ch0 = src_at(cx, &ch, 0);
        let pc = record(cx, &key.child("1"), ch0.max(0.0), src_tf(cx, x));
        let nc = record(cx, &key.child("2"), -ch0.min(0.0), src_tf(cx, x));
        let up_s = ma::rma(cx, &pc, len, &key.child("3"))?;
        let up = src_at(cx, &up_s, 0);
        let down_s = ma::rma(cx, &nc, len, &key.child("4"))?;
        let down = src_at(cx, &down_s, 0);
        let val = if down == 0.0 {
            100.0
        } else if up == 0.0 {
            0.0
        } else {
            100.0 - 100.0 / (1.0 + up / down)
        };
        (key, val)
    };
    Ok(record(cx, &key.child("5"), val, src_tf(cx, x)))
}

/// Commodity Channel Index.
pub(super) fn cci(cx: &mut EvalCtx, src: &Value, len: usize, key: &SeriesKey) -> R {
    let key = key.child(format!("cci({})", len));
    let ma_s = ma::sma(cx, src, len, &key)?;
    let ma_v = src_at(cx, &ma_s, 0);
    let dev_s = super::series_ops::dev(cx, src, len, &key)?;
    let dev_v = src_at(cx, &dev_s, 0);
    let val = (src_at(cx, src, 0) - ma_v) / (0.015 * dev_v);
    Ok(record(cx, &key, val, src_tf(cx, src)))
}

/// Chande Momentum Oscillator.
pub(super) fn cmo(cx: &mut EvalCtx, src: &Value, len: usize, key: &SeriesKey) -> R {
    let key = key.child(format!("cmo({})", len));
    let mom = change(cx, src, 1, &key)?;
    let m0 = src_at(cx, &mom, 0);
    let g = record(cx, &key.child("g"), m0.max(0.0), src_tf(cx, src));
    let l = record(cx, &key.child("l"), (-m0).max(0.0), src_tf(cx, src));
    let sm1_s = sum(cx, &g, len, &key.child("1"))?;
    let sm1 = src_at(cx, &sm1_s, 0);
    let sm2_s = sum(cx, &l, len, &key.child("2"))?;
    let sm2 = src_at(cx, &sm2_s, 0);
    Ok(record(
        cx,
        &key,
        100.0 * (sm1 - sm2) / (sm1 + sm2),
        src_tf(cx, src),
    ))
}

/// Center of gravity.
pub(super) fn cog(cx: &mut EvalCtx, src: &Value, len: usize, key: &SeriesKey) -> R {
    let key = key.child(format!("cog({})", len));
    let total_s = sum(cx, src, len, &key)?;
    let total = src_at(cx, &total_s, 0);
    let mut num = 0.0;
    for i in 0..len {
        num += src_at(cx, src, i) * (i as f64 + 1.0);
    }
    Ok(record(cx, &key, -num / total, src_tf(cx, src)))
}

/// Money Flow Index.
pub(super) fn mfi(cx: &mut EvalCtx, src: &Value, len: usize, key: &SeriesKey) -> R {
    let key = key.child(format!("mfi({})", len));
    let vol = base(BaseField::Vol);
    let ch_s = change(cx, src, 1, &key.child("1"))?;
    let ch = src_at(cx, &ch_s, 0);
    let s0 = src_at(cx, src, 0);
    let v0 = src_at(cx, &vol, 0);

    let up_flow = record(
        cx,
        &key.child("2"),
        v0 * if ch <= 0.0 { 0.0 } else { s0 },
        src_tf(cx, src),
    );
    let dn_flow = record(
        cx,
        &key.child("3"),
        v0 * if ch >= 0.0 { 0.0 } else { s0 },
        src_tf(cx, src),
    );

    let upper = sum(cx, &up_flow, len, &key.child("4"))?;
    let lower = sum(cx, &dn_flow, len, &key.child("5"))?;
    let val = if src_at(cx, &lower, 0).is_nan() {
        f64::NAN
    } else {
        {
            let rsi_s = rsi(cx, &upper, &lower, &key.child("6"))?;
            src_at(cx, &rsi_s, 0)
        }
    };
    Ok(record(cx, &key, val, src_tf(cx, src)))
}

/// Rate of change: 100 * (x[0] - x[len]) / x[len].
pub(super) fn roc(cx: &mut EvalCtx, src: &Value, len: usize, key: &SeriesKey) -> R {
    let key = key.child(format!("roc({})", len));
    let prev = src_at(cx, src, len);
    let val = 100.0 * (src_at(cx, src, 0) - prev) / prev;
    Ok(record(cx, &key, val, src_tf(cx, src)))
}

/// Momentum: x[0] - x[len].
pub(super) fn mom(cx: &mut EvalCtx, src: &Value, len: usize, key: &SeriesKey) -> R {
    let key = key.child(format!("mom({})", len));
    let val = src_at(cx, src, 0) - src_at(cx, src, len);
    Ok(record(cx, &key, val, src_tf(cx, src)))
}

/// Stochastic %K.
pub(super) fn stoch(
    cx: &mut EvalCtx,
    src: &Value,
    high: &Value,
    low: &Value,
    len: usize,
    key: &SeriesKey,
) -> R {
    let key = key.child(format!("stoch({})", len));
    let ll_s = super::series_ops::lowest(cx, low, len, &key.child("1"))?;
    let ll = src_at(cx, &ll_s, 0);
    let hh_s = super::series_ops::highest(cx, high, len, &key.child("2"))?;
    let hh = src_at(cx, &hh_s, 0);
    let val = 100.0 * (src_at(cx, src, 0) - ll) / (hh - ll);
    Ok(record(cx, &key, val, src_tf(cx, src)))
}

/// True Strength Index.
pub(super) fn tsi(cx: &mut EvalCtx, src: &Value, short: usize, long: usize, key: &SeriesKey) -> R {
    let key = key.child(format!("tsi({},{})", short, long));
    let m = change(cx, src, 1, &key.child("0"))?;
    let m_abs = record(cx, &key.child("1"), src_at(cx, &m, 0).abs(), src_tf(cx, src));

    let num_inner = ma::ema(cx, &m, long, &key.child("2"))?;
    let num_s = ma::ema(cx, &num_inner, short, &key.child("3"))?;
    let num = src_at(cx, &num_s, 0);
    let den_inner = ma::ema(cx, &m_abs, long, &key.child("4"))?;
    let den_s = ma::ema(cx, &den_inner, short, &key.child("5"))?;
    let den = src_at(cx, &den_s, 0);

    Ok(record(cx, &key, num / den, src_tf(cx, src)))
}

/// Williams %R.
pub(super) fn wpr(cx: &mut EvalCtx, len: usize, key: &SeriesKey) -> R {
    let key = key.child(format!("wpr({})", len));
    let high = base(BaseField::High);
    let low = base(BaseField::Low);
    let close = base(BaseField::Close);

    let hh_s = super::series_ops::highest(cx, &high, len, &key.child("1"))?;
    let hh = src_at(cx, &hh_s, 0);
    let ll_s = super::series_ops::lowest(cx, &low, len, &key.child("2"))?;
    let ll = src_at(cx, &ll_s, 0);
    let res = (hh - src_at(cx, &close, 0)) / (hh - ll);
    Ok(record(cx, &key, -res * 100.0, None))
}

/// MACD: returns [macd, signal, histogram].
pub(super) fn macd(
    cx: &mut EvalCtx,
    src: &Value,
    fast: usize,
    slow: usize,
    sig: usize,
    key: &SeriesKey,
) -> R {
    let key = key.child(format!("macd({},{},{})", fast, slow, sig));
    let fast_ma = ma::ema(cx, src, fast, &key.child("1"))?;
    let slow_ma = ma::ema(cx, src, slow, &key.child("2"))?;
    let line = record(
        cx,
        &key.child("3"),
        src_at(cx, &fast_ma, 0) - src_at(cx, &slow_ma, 0),
        src_tf(cx, src),
    );
    let signal = ma::ema(cx, &line, sig, &key.child("4"))?;
    let hist = record(
        cx,
        &key.child("5"),
        src_at(cx, &line, 0) - src_at(cx, &signal, 0),
        src_tf(cx, src),
    );
    Ok(Value::List(vec![line, signal, hist]))
}

/// Directional movement index: returns [adx, +di, -di].
pub(super) fn dmi(cx: &mut EvalCtx, len: usize, smooth: usize, key: &SeriesKey) -> R {
    let key = key.child(format!("dmi({},{})", len, smooth));
    let high = base(BaseField::High);
    let low = base(BaseField::Low);

    let up_s = change(cx, &high, 1, &key.child("1"))?;
    let up = src_at(cx, &up_s, 0);
    let down_s = change(cx, &low, 1, &key.child("2"))?;
    let down = -src_at(cx, &down_s, 0);

    let plus_dm = record(
        cx,
        &key.child("3"),
        if up.is_nan() {
            f64::NAN
        } else if up > down && up > 0.0 {
            100.0 * up
        } else {
            0.0
        },
        None,
    );
    let minus_dm = record(
        cx,
        &key.child("4"),
        if down.is_nan() {
            f64::NAN
        } else if down > up && down > 0.0 {
            100.0 * down
        } else {
            0.0
        },
        None,
    );

    let tr = super::channels::tr(cx, false, &key.child("tr"));
    let trur = ma::rma(cx, &tr, len, &key.child("5"))?;
    let plus_rma = ma::rma(cx, &plus_dm, len, &key.child("6"))?;
    let minus_rma = ma::rma(cx, &minus_dm, len, &key.child("7"))?;

    let trur0 = src_at(cx, &trur, 0);
    let plus0 = src_at(cx, &plus_rma, 0) / trur0;
    let minus0 = src_at(cx, &minus_rma, 0) / trur0;
    let plus = record(cx, &key.child("8"), plus0, None);
    let minus = record(cx, &key.child("9"), minus0, None);

    let total = plus0 + minus0;
    let dx = record(
        cx,
        &key.child("11"),
        100.0 * (plus0 - minus0).abs() / if total == 0.0 { 1.0 } else { total },
        None,
    );
    let adx = ma::rma(cx, &dx, smooth, &key.child("12"))?;
    Ok(Value::List(vec![adx, plus, minus]))
}
