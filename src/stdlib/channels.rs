//! True range, bands, channels, SAR and pivots.

use crate::error::RuntimeError;
use crate::feed::BaseField;
use crate::interp::EvalCtx;
use crate::series::SeriesKey;
use crate::value::{SeriesRef, Value};

use super::{ma, nz_f, record, self_at, series_ops, set0, src_at, src_tf};

type R = Result<Value, RuntimeError>;

fn base(field: BaseField) -> Value {
    Value::Series(SeriesRef::Base(field))
}

/// True range over the base feed.
pub(super) fn tr(cx: &mut EvalCtx, fix_nan: bool, key: &SeriesKey) -> Value {
    let key = key.child(format!("tr({})", fix_nan));
    let high = base(BaseField::High);
    let low = base(BaseField::Low);
    let close = base(BaseField::Close);

    let h0 = src_at(cx, &high, 0);
    let l0 = src_at(cx, &low, 0);
    let c1 = src_at(cx, &close, 1);
    let res = if c1.is_nan() && fix_nan {
        h0 - l0
    } else {
        (h0 - l0).max((h0 - c1).abs()).max((l0 - c1).abs())
    };
    record(cx, &key, res, None)
}

/// Average true range: Wilder's smoothing of the true range.
pub(super) fn atr(cx: &mut EvalCtx, len: usize, key: &SeriesKey) -> R {
    let key = key.child(format!("atr({})", len));
    let high = base(BaseField::High);
    let low = base(BaseField::Low);
    let close = base(BaseField::Close);

    let h0 = src_at(cx, &high, 0);
    let l0 = src_at(cx, &low, 0);
    let h1 = src_at(cx, &high, 1);
    let c1 = src_at(cx, &close, 1);
    let tr0 = if h1.is_nan() {
        h0 - l0
    } else {
        (h0 - l0).max((h0 - c1).abs()).max((l0 - c1).abs())
    };
    let tr_ts = record(cx, &key, tr0, None);
    ma::rma(cx, &tr_ts, len, &key)
}

/// Bollinger bands: [basis, upper, lower].
pub(super) fn bb(cx: &mut EvalCtx, src: &Value, len: usize, mult: f64, key: &SeriesKey) -> R {
    let key = key.child(format!("bb({},{})", len, mult));
    let basis = ma::sma(cx, src, len, &key)?;
    let dev_s = series_ops::stdev(cx, src, len, &key)?;
    let dev = src_at(cx, &dev_s, 0) * mult;
    let b0 = src_at(cx, &basis, 0);
    let upper = record(cx, &key.child("1"), b0 + dev, src_tf(cx, src));
    let lower = record(cx, &key.child("2"), b0 - dev, src_tf(cx, src));
    Ok(Value::List(vec![basis, upper, lower]))
}

/// Bollinger bandwidth.
pub(super) fn bbw(cx: &mut EvalCtx, src: &Value, len: usize, mult: f64, key: &SeriesKey) -> R {
    let key = key.child(format!("bbw({},{})", len, mult));
    let basis_s = ma::sma(cx, src, len, &key)?;
    let basis = src_at(cx, &basis_s, 0);
    let dev_s = series_ops::stdev(cx, src, len, &key)?;
    let dev = src_at(cx, &dev_s, 0) * mult;
    Ok(record(cx, &key, 2.0 * dev / basis, src_tf(cx, src)))
}

/// Keltner channels: [basis, upper, lower].
pub(super) fn kc(
    cx: &mut EvalCtx,
    src: &Value,
    len: usize,
    mult: f64,
    use_tr: bool,
    key: &SeriesKey,
) -> R {
    let key = key.child(format!("kc({},{},{})", len, mult, use_tr));
    let basis = ma::ema(cx, src, len, &key.child("1"))?;

    let range = if use_tr {
        tr(cx, false, &key.child("2"))
    } else {
        let h = src_at(cx, &base(BaseField::High), 0);
        let l = src_at(cx, &base(BaseField::Low), 0);
        record(cx, &key.child("3"), h - l, src_tf(cx, src))
    };
    let range_ema = ma::ema(cx, &range, len, &key.child("4"))?;

    let b0 = src_at(cx, &basis, 0);
    let r0 = src_at(cx, &range_ema, 0);
    let upper = record(cx, &key.child("5"), b0 + r0 * mult, src_tf(cx, src));
    let lower = record(cx, &key.child("6"), b0 - r0 * mult, src_tf(cx, src));
    Ok(Value::List(vec![basis, upper, lower]))
}

/// Keltner channel width.
pub(super) fn kcw(
    cx: &mut EvalCtx,
    src: &Value,
    len: usize,
    mult: f64,
    use_tr: bool,
    key: &SeriesKey,
) -> R {
    let key2 = key.child(format!("kcw({},{},{})", len, mult, use_tr));
    let bands = kc(cx, src, len, mult, use_tr, key)?;
    let Value::List(bands) = bands else {
        unreachable!("kc returns three bands");
    };
    let basis = src_at(cx, &bands[0], 0);
    let upper = src_at(cx, &bands[1], 0);
    let lower = src_at(cx, &bands[2], 0);
    Ok(record(cx, &key2, (upper - lower) / basis, src_tf(cx, src)))
}

/// Parabolic SAR. Trend direction, running extreme and acceleration
/// factor persist per call site; each bar continues from the previous
/// bar's stored state rather than recomputing it.
pub(super) fn sar(cx: &mut EvalCtx, start: f64, inc: f64, max: f64, key: &SeriesKey) -> R {
    let key = key.child(format!("sar({},{},{})", start, inc, max));
    let high = base(BaseField::High);
    let low = base(BaseField::Low);
    let close = base(BaseField::Close);

    let out_key = key.child("1");
    let pos_key = key.child("2");
    let ext_key = key.child("3");
    let acc_key = key.child("4");
    record(cx, &out_key, f64::NAN, None);
    record(cx, &pos_key, f64::NAN, None);
    record(cx, &ext_key, f64::NAN, None);
    record(cx, &acc_key, f64::NAN, None);

    let n = cx.shared.iter;
    if n < 1 {
        return Ok(Value::Series(SeriesRef::Owned(out_key)));
    }

    let h0 = src_at(cx, &high, 0);
    let h1 = src_at(cx, &high, 1);
    let l0 = src_at(cx, &low, 0);
    let l1 = src_at(cx, &low, 1);
    let c0 = src_at(cx, &close, 0);
    let c1 = src_at(cx, &close, 1);

    let mut prev = self_at(cx, &out_key, 1);
    let mut pos;
    let mut ext;
    let mut acc;
    if n == 1 {
        if c0 > c1 {
            pos = 1.0;
            ext = h0.max(h1);
            prev = l0.min(l1);
        } else {
            pos = -1.0;
            ext = l0.min(l1);
            prev = h0.max(h1);
        }
        acc = start;
    } else {
        pos = self_at(cx, &pos_key, 1);
        acc = self_at(cx, &acc_key, 1);
        ext = self_at(cx, &ext_key, 1);
    }

    let mut out = f64::NAN;
    let mut out_set = false;
    if pos == 1.0 {
        if h0 > ext {
            ext = h0;
            acc = (acc + inc).min(max);
        }
        if l0 <= prev {
            pos = -1.0;
            out = ext;
            ext = l0;
            acc = start;
            out_set = true;
        }
    } else {
        if l0 < ext {
            ext = l0;
            acc = (acc + inc).min(max);
        }
        if h0 >= prev {
            pos = 1.0;
            out = ext;
            ext = h0;
            acc = start;
            out_set = true;
        }
    }

    if !out_set {
        out = prev + acc * (ext - prev);
        if pos == 1.0 && out >= l0 {
            out = l0;
        }
        if pos == -1.0 && out <= h0 {
            out = h0;
        }
    }

    set0(cx, &out_key, out);
    set0(cx, &pos_key, pos);
    set0(cx, &ext_key, ext);
    set0(cx, &acc_key, acc);
    Ok(Value::Series(SeriesRef::Owned(out_key)))
}

/// Supertrend: returns [line, direction].
pub(super) fn supertrend(cx: &mut EvalCtx, factor: f64, atr_len: usize, key: &SeriesKey) -> R {
    let key = key.child(format!("supertrend({},{})", factor, atr_len));
    let high = base(BaseField::High);
    let low = base(BaseField::Low);
    let close = base(BaseField::Close);

    let hl2 = (src_at(cx, &high, 0) + src_at(cx, &low, 0)) * 0.5;
    let atr_s = atr(cx, atr_len, &key.child("1"))?;
    let atr_v = factor * src_at(cx, &atr_s, 0);
    let c0 = src_at(cx, &close, 0);
    let c1 = src_at(cx, &close, 1);

    let ls_key = key.child("2");
    record(cx, &ls_key, hl2 - atr_v, None);
    let ls1 = {
        let prev = self_at(cx, &ls_key, 1);
        if prev.is_nan() {
            self_at(cx, &ls_key, 0)
        } else {
            prev
        }
    };
    if c1 > ls1 {
        let cur = self_at(cx, &ls_key, 0);
        set0(cx, &ls_key, cur.max(ls1));
    }

    let ss_key = key.child("3");
    record(cx, &ss_key, hl2 + atr_v, None);
    let ss1 = {
        let prev = self_at(cx, &ss_key, 1);
        if prev.is_nan() {
            self_at(cx, &ss_key, 0)
        } else {
            prev
        }
    };
    if c1 < ss1 {
        let cur = self_at(cx, &ss_key, 0);
        set0(cx, &ss_key, cur.min(ss1));
    }

    let dir_key = key.child("4");
    record(cx, &dir_key, 1.0, None);
    let dir_prev = nz_f(self_at(cx, &dir_key, 1));
    let dir_prev = if dir_prev == 0.0 { 1.0 } else { dir_prev };
    let dir = if dir_prev == -1.0 && c0 > ss1 {
        1.0
    } else if dir_prev == 1.0 && c0 < ls1 {
        -1.0
    } else {
        dir_prev
    };
    set0(cx, &dir_key, dir);

    let line_val = if dir == 1.0 {
        self_at(cx, &ls_key, 0)
    } else {
        self_at(cx, &ss_key, 0)
    };
    let line = record(cx, &key.child("5"), line_val, None);
    let trend = record(cx, &key.child("6"), -dir, None);
    Ok(Value::List(vec![line, trend]))
}

/// Price of a pivot high: the value `right` bars back when it exceeds
/// everything within the window, NaN otherwise. Pairs with `offset`.
pub(super) fn pivothigh(
    cx: &mut EvalCtx,
    src: &Value,
    left: usize,
    right: usize,
    key: &SeriesKey,
) -> R {
    let key = key.child(format!("pivothigh({},{})", left, right));
    let len = left + right + 1;
    let top = src_at(cx, src, right);
    let mut val = top;
    for i in 0..len {
        if i != right && top <= src_at(cx, src, i) {
            val = f64::NAN;
            break;
        }
    }
    Ok(record(cx, &key, val, src_tf(cx, src)))
}

pub(super) fn pivotlow(
    cx: &mut EvalCtx,
    src: &Value,
    left: usize,
    right: usize,
    key: &SeriesKey,
) -> R {
    let key = key.child(format!("pivotlow({},{})", left, right));
    let len = left + right + 1;
    let bot = src_at(cx, src, right);
    let mut val = bot;
    for i in 0..len {
        if i != right && bot >= src_at(cx, src, i) {
            val = f64::NAN;
            break;
        }
    }
    Ok(record(cx, &key, val, src_tf(cx, src)))
}
