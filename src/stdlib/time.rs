//! Calendar accessors over bar timestamps (UTC).

use chrono::{DateTime, Datelike, Timelike, Utc};

use crate::interp::EvalCtx;
use crate::value::Value;

use super::series_ops::tf_arg;

/// Optional time argument; defaults to the current bar timestamp.
pub(super) fn time_arg(cx: &EvalCtx, v: &Value) -> i64 {
    if v.is_na() {
        cx.shared.t
    } else {
        cx.num(v) as i64
    }
}

pub(super) fn calendar(name: &str, t: i64) -> f64 {
    let Some(dt) = DateTime::<Utc>::from_timestamp_millis(t) else {
        return f64::NAN;
    };
    match name {
        "second" => dt.second() as f64,
        "minute" => dt.minute() as f64,
        "hour" => dt.hour() as f64,
        // 1..=7, Sunday = 1
        "dayofweek" => dt.weekday().num_days_from_sunday() as f64 + 1.0,
        "dayofmonth" => dt.day() as f64,
        // zero-based, January = 0
        "month" => dt.month0() as f64,
        "year" => dt.year() as f64,
        "weekofyear" => dt.iso_week().week() as f64,
        _ => unreachable!("calendar dispatch covers all names"),
    }
}

/// True only on the bar whose end aligns exactly with a boundary of the
/// target timeframe.
pub(super) fn onclose(cx: &EvalCtx, tf: &Value) -> Value {
    let target = tf_arg(tf).unwrap_or(cx.shared.tf);
    Value::Bool(cx.shared.bar_closes(target))
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2024-01-15 was a Monday
    const MON_2024_01_15: i64 = 1_705_276_800_000;

    #[test]
    fn calendar_fields() {
        assert_eq!(calendar("year", MON_2024_01_15), 2024.0);
        assert_eq!(calendar("month", MON_2024_01_15), 0.0);
        assert_eq!(calendar("dayofmonth", MON_2024_01_15), 15.0);
        assert_eq!(calendar("dayofweek", MON_2024_01_15), 2.0);
        assert_eq!(calendar("hour", MON_2024_01_15), 0.0);
        assert_eq!(calendar("weekofyear", MON_2024_01_15), 3.0);
    }

    #[test]
    fn time_of_day() {
        let t = MON_2024_01_15 + (13 * 3600 + 45 * 60 + 30) * 1000;
        assert_eq!(calendar("hour", t), 13.0);
        assert_eq!(calendar("minute", t), 45.0);
        assert_eq!(calendar("second", t), 30.0);
    }
}
