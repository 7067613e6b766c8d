//! The shared, read-mostly execution context one engine run exposes to
//! every script environment. Only the engine mutates the underlying data,
//! and only one run is ever active.

use crate::feed::{BaseFeed, Dataset, Datasets};

/// What kind of pass is executing. Signals are only delivered for
/// streaming updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEvent {
    Step,
    Update,
}

/// Identifier of the base OHLCV dataset.
pub const OHLCV: &str = "ohlcv";

#[derive(Debug)]
pub struct SharedCtx<'a> {
    pub base: &'a BaseFeed,
    pub datasets: &'a Datasets,
    /// Current bar timestamp (ms).
    pub t: i64,
    /// Current iteration index within the run.
    pub iter: usize,
    /// Base feed timeframe (ms).
    pub tf: i64,
    /// Visible time range.
    pub range: (i64, i64),
    /// True while the current bar is considered closed (all bars of a full
    /// run except the still-forming last one).
    pub onclose: bool,
    pub event: RunEvent,
}

impl SharedCtx<'_> {
    pub fn ohlcv(&self) -> Option<&Dataset> {
        self.datasets.get(OHLCV)
    }

    /// True only on a bar whose end aligns exactly with a boundary of the
    /// target timeframe.
    pub fn bar_closes(&self, target_tf: i64) -> bool {
        if !self.onclose || target_tf <= 0 {
            return false;
        }
        (self.t + self.tf).rem_euclid(target_tf) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::BaseFeed;
    use std::collections::HashMap;

    fn ctx<'a>(base: &'a BaseFeed, dss: &'a Datasets, t: i64, tf: i64) -> SharedCtx<'a> {
        SharedCtx {
            base,
            datasets: dss,
            t,
            iter: 0,
            tf,
            range: (0, 0),
            onclose: true,
            event: RunEvent::Step,
        }
    }

    #[test]
    fn bar_close_alignment() {
        let base = BaseFeed::new();
        let dss = HashMap::new();
        let hour = 3_600_000;
        // minute bar ending exactly on the hour
        let c = ctx(&base, &dss, hour - 60_000, 60_000);
        assert!(c.bar_closes(hour));
        // one minute earlier does not close the hour
        let c = ctx(&base, &dss, hour - 120_000, 60_000);
        assert!(!c.bar_closes(hour));
    }

    #[test]
    fn bar_close_requires_onclose() {
        let base = BaseFeed::new();
        let dss = HashMap::new();
        let mut c = ctx(&base, &dss, 3_540_000, 60_000);
        c.onclose = false;
        assert!(!c.bar_closes(3_600_000));
    }
}
