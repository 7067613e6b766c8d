//! Timeframe strings ("1m", "4H", "1D", ...) and their millisecond values.

pub const SECOND: i64 = 1_000;
pub const MINUTE: i64 = 60 * SECOND;
pub const HOUR: i64 = 60 * MINUTE;
pub const DAY: i64 = 24 * HOUR;
pub const WEEK: i64 = 7 * DAY;
/// Calendar months vary; a fixed 30-day window is used for aggregation.
pub const MONTH: i64 = 30 * DAY;
pub const YEAR: i64 = 365 * DAY;

/// Parse a timeframe string into milliseconds.
///
/// Accepts `<count><unit>` where unit is one of `s m H D W M Y`,
/// or a bare number of milliseconds. Returns `None` on anything else.
pub fn parse_tf(s: &str) -> Option<i64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(ms) = s.parse::<i64>() {
        return if ms > 0 { Some(ms) } else { None };
    }
    let (num, unit) = s.split_at(s.len() - 1);
    let count: i64 = if num.is_empty() { 1 } else { num.parse().ok()? };
    if count <= 0 {
        return None;
    }
    let unit_ms = match unit {
        "s" => SECOND,
        "m" => MINUTE,
        "H" => HOUR,
        "D" => DAY,
        "W" => WEEK,
        "M" => MONTH,
        "Y" => YEAR,
        _ => return None,
    };
    Some(count * unit_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_common_frames() {
        assert_eq!(parse_tf("1m"), Some(MINUTE));
        assert_eq!(parse_tf("5m"), Some(5 * MINUTE));
        assert_eq!(parse_tf("15m"), Some(15 * MINUTE));
        assert_eq!(parse_tf("1H"), Some(HOUR));
        assert_eq!(parse_tf("4H"), Some(4 * HOUR));
        assert_eq!(parse_tf("1D"), Some(DAY));
        assert_eq!(parse_tf("1W"), Some(WEEK));
        assert_eq!(parse_tf("1M"), Some(MONTH));
    }

    #[test]
    fn parse_bare_unit() {
        assert_eq!(parse_tf("H"), Some(HOUR));
    }

    #[test]
    fn parse_numeric_passthrough() {
        assert_eq!(parse_tf("60000"), Some(MINUTE));
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse_tf(""), None);
        assert_eq!(parse_tf("1x"), None);
        assert_eq!(parse_tf("-5m"), None);
        assert_eq!(parse_tf("0"), None);
    }
}
