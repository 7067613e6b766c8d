//! Window reducers for resampling tick/bar streams into coarser bars.

use crate::series::Series;

/// How values folding into one window combine.
///
/// `First` keeps the window's first value (open-like), `Max`/`Min` the
/// extremes (high/low-like), `Last` the most recent (close-like) and
/// `Sum` accumulates (volume-like).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reducer {
    First,
    Max,
    Min,
    Last,
    Sum,
}

impl Reducer {
    /// Reducer conventionally used for a named OHLCV role.
    pub fn for_role(role: &str) -> Option<Reducer> {
        match role {
            "open" | "first" => Some(Reducer::First),
            "high" | "max" => Some(Reducer::Max),
            "low" | "min" => Some(Reducer::Min),
            "close" | "last" => Some(Reducer::Last),
            "vol" | "sum" => Some(Reducer::Sum),
            _ => None,
        }
    }
}

/// Stateful reducer keyed by a target timeframe.
///
/// Window state (the start timestamp) lives on the series being fed, so a
/// sampler value itself is cheap to copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sampler {
    pub kind: Reducer,
    pub tf: i64,
}

impl Sampler {
    pub fn new(kind: Reducer, tf: i64) -> Self {
        Self { kind, tf }
    }

    /// Fold one value stamped `t` into the series. Crossing a window
    /// boundary closes the current window (a new slot is pushed); within
    /// a window the current slot is combined per the reducer kind.
    pub fn feed(&self, ts: &mut Series, x: f64, t: i64) {
        let rollover = match ts.t0 {
            None => true,
            Some(t0) => t >= t0 + self.tf,
        };
        if rollover {
            ts.unshift(if self.kind == Reducer::Sum { 0.0 } else { x });
            ts.t0 = Some(t - t.rem_euclid(self.tf));
        }
        let cur = ts.peek(0);
        let next = match self.kind {
            Reducer::First => {
                if rollover {
                    x
                } else {
                    cur
                }
            }
            Reducer::Max => {
                if x > cur || cur.is_nan() {
                    x
                } else {
                    cur
                }
            }
            Reducer::Min => {
                if x < cur || cur.is_nan() {
                    x
                } else {
                    cur
                }
            }
            Reducer::Last => x,
            Reducer::Sum => cur + x,
        };
        ts.set(0, next);
        ts.truncate_retained();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(kind: Reducer, ticks: &[(i64, f64)]) -> Series {
        let sampler = Sampler::new(kind, 100);
        let mut ts = Series::new();
        ts.tf = Some(100);
        for &(t, x) in ticks {
            sampler.feed(&mut ts, x, t);
        }
        ts
    }

    #[test]
    fn last_keeps_latest_in_window() {
        let ts = run(Reducer::Last, &[(0, 1.0), (50, 2.0), (99, 3.0)]);
        assert_eq!(ts.len(), 1);
        assert_eq!(ts.peek(0), 3.0);
    }

    #[test]
    fn window_rollover_pushes_slot() {
        let ts = run(Reducer::Last, &[(0, 1.0), (100, 2.0), (210, 3.0)]);
        assert_eq!(ts.len(), 3);
        assert_eq!(ts.peek(2), 1.0);
        assert_eq!(ts.peek(1), 2.0);
        assert_eq!(ts.peek(0), 3.0);
    }

    #[test]
    fn max_and_min_track_extremes() {
        let hi = run(Reducer::Max, &[(0, 1.0), (10, 5.0), (20, 3.0)]);
        assert_eq!(hi.peek(0), 5.0);
        let lo = run(Reducer::Min, &[(0, 4.0), (10, 2.0), (20, 3.0)]);
        assert_eq!(lo.peek(0), 2.0);
    }

    #[test]
    fn sum_accumulates_and_resets() {
        let ts = run(Reducer::Sum, &[(0, 1.0), (10, 2.0), (100, 4.0), (110, 5.0)]);
        assert_eq!(ts.peek(1), 3.0);
        assert_eq!(ts.peek(0), 9.0);
    }

    #[test]
    fn first_ignores_later_values() {
        let ts = run(Reducer::First, &[(0, 7.0), (10, 9.0), (99, 1.0)]);
        assert_eq!(ts.peek(0), 7.0);
    }

    #[test]
    fn window_start_is_aligned() {
        let sampler = Sampler::new(Reducer::Last, 100);
        let mut ts = Series::new();
        sampler.feed(&mut ts, 1.0, 130);
        assert_eq!(ts.t0, Some(100));
    }
}
