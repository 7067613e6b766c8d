//! Scalar math primitives.

use crate::interp::EvalCtx;
use crate::value::Value;

pub(super) fn unary(name: &str, x: f64) -> f64 {
    match name {
        "abs" => x.abs(),
        "acos" => x.acos(),
        "asin" => x.asin(),
        "atan" => x.atan(),
        "ceil" => x.ceil(),
        "cos" => x.cos(),
        "exp" => x.exp(),
        "floor" => x.floor(),
        "log" => x.ln(),
        "log10" => x.log10(),
        "round" => x.round(),
        "sign" => {
            if x == 0.0 {
                0.0
            } else {
                x.signum()
            }
        }
        "sin" => x.sin(),
        "sqrt" => x.sqrt(),
        "tan" => x.tan(),
        _ => unreachable!("unary dispatch covers all names"),
    }
}

pub(super) fn now_ms() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as f64)
        .unwrap_or(f64::NAN)
}

pub(super) fn avg(cx: &EvalCtx, args: &[Value]) -> Value {
    if args.is_empty() {
        return Value::Num(f64::NAN);
    }
    let sum: f64 = args.iter().map(|v| cx.num(v)).sum();
    Value::Num(sum / args.len() as f64)
}

pub(super) fn fold_max(cx: &EvalCtx, args: &[Value]) -> Value {
    Value::Num(
        args.iter()
            .map(|v| cx.num(v))
            .fold(f64::NEG_INFINITY, f64::max),
    )
}

pub(super) fn fold_min(cx: &EvalCtx, args: &[Value]) -> Value {
    Value::Num(args.iter().map(|v| cx.num(v)).fold(f64::INFINITY, f64::min))
}

/// Max decimal places over the last 100 bars of the base dataset's price
/// columns. Used downstream for legend formatting.
pub(super) fn autoprec(cx: &EvalCtx) -> Value {
    let Some(data) = cx.shared.ohlcv() else {
        return Value::Na;
    };
    let start = data.rows.len().saturating_sub(100);
    let mut max = 0;
    for row in &data.rows[start..] {
        for col in 1..5.min(row.len()) {
            max = max.max(decimals(row[col]));
        }
    }
    Value::Num(max as f64)
}

fn decimals(x: f64) -> u32 {
    if !x.is_finite() {
        return 0;
    }
    for d in 0..=8u32 {
        let scaled = x * 10f64.powi(d as i32);
        if (scaled - scaled.round()).abs() < 1e-9 {
            return d;
        }
    }
    8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decimal_counting() {
        assert_eq!(decimals(100.0), 0);
        assert_eq!(decimals(1.5), 1);
        assert_eq!(decimals(0.25), 2);
        assert_eq!(decimals(0.12345), 5);
    }

    #[test]
    fn sign_of_zero() {
        assert_eq!(unary("sign", 0.0), 0.0);
        assert_eq!(unary("sign", -3.0), -1.0);
    }
}
