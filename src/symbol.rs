//! Aggregated symbols: derived OHLCV feeds synthesized from a
//! higher-resolution base, timestamp-aligned foreign datasets, or a custom
//! reducer over the current window.

use std::collections::HashMap;
use std::fmt;

use crate::error::RuntimeError;
use crate::feed::{BaseField, Dataset};
use crate::sampler::{Reducer, Sampler};
use crate::series::{Series, SeriesKey};

/// Reducer over all data points in the current window.
pub type WindowReducer = Box<dyn Fn(&[Vec<f64>]) -> f64 + Send>;

/// How a symbol folds source rows into its derived series.
pub enum AggKind {
    /// Five samplers synthesize a full OHLCV feed.
    Ohlcv,
    /// Timestamp-matched copy of a foreign OHLCV dataset.
    Copy,
    /// Custom reducer over the window's rows; only `close` is produced.
    Custom(WindowReducer),
}

impl fmt::Debug for AggKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AggKind::Ohlcv => write!(f, "Ohlcv"),
            AggKind::Copy => write!(f, "Copy"),
            AggKind::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// Column layout of the source rows, derived from a `"time:open:..."`
/// format string or detected from the first row.
#[derive(Debug, Clone, Default)]
pub struct FormatIdx {
    cols: HashMap<String, usize>,
}

impl FormatIdx {
    pub fn parse(format: &str) -> Self {
        let mut cols = HashMap::new();
        for (i, group) in format.split(':').enumerate() {
            for name in group.split(',') {
                let name = name.trim();
                if !name.is_empty() {
                    cols.insert(name.to_string(), i);
                }
            }
        }
        Self { cols }
    }

    /// Detect a layout from the first row: 6 columns are a flat OHLCV row,
    /// 3 columns share one price for open/high/low/close.
    pub fn detect(first_row: Option<&Vec<f64>>) -> Self {
        match first_row.map(|r| r.len()) {
            Some(3) => Self::parse("time:open,high,low,close:vol"),
            _ => Self::parse("time:open:high:low:close:vol"),
        }
    }

    pub fn col(&self, name: &str) -> Option<usize> {
        self.cols.get(name).copied()
    }

    fn value(&self, row: &[f64], name: &str) -> f64 {
        self.col(name)
            .and_then(|i| row.get(i))
            .copied()
            .unwrap_or(f64::NAN)
    }
}

/// Gap policy plus window parameters for a symbol.
#[derive(Debug, Clone, Default)]
pub struct SymParams {
    pub tf: Option<i64>,
    pub window: Option<i64>,
    /// `Some(true)`: repeat previous close over empty windows.
    /// `Some(false)`: skip empty windows entirely. `None`: flat-fill.
    pub fillgaps: Option<bool>,
    pub format: Option<String>,
}

/// A derived OHLCV feed at an alternate timeframe.
pub struct Symbol {
    pub id: SeriesKey,
    pub dataset: String,
    pub tf: i64,
    pub base_tf: i64,
    pub window: Option<i64>,
    pub fillgaps: Option<bool>,
    pub kind: AggKind,
    pub format: FormatIdx,
    pub open: Series,
    pub high: Series,
    pub low: Series,
    pub close: Series,
    pub vol: Series,
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Symbol")
            .field("id", &self.id)
            .field("dataset", &self.dataset)
            .field("tf", &self.tf)
            .field("kind", &self.kind)
            .finish()
    }
}

impl Symbol {
    pub fn new(
        id: SeriesKey,
        dataset: &Dataset,
        kind: AggKind,
        params: SymParams,
        base_tf: i64,
    ) -> Result<Symbol, RuntimeError> {
        let tf = params.tf.unwrap_or(base_tf);
        if tf <= 0 {
            return Err(RuntimeError::Symbol("timeframe must be positive".into()));
        }
        let format = match (&kind, &params.format) {
            (_, Some(f)) => FormatIdx::parse(f),
            (AggKind::Ohlcv | AggKind::Copy, None) => FormatIdx::detect(dataset.rows.first()),
            (AggKind::Custom(_), None) => FormatIdx::parse("time:close"),
        };

        let mut sym = Symbol {
            id,
            dataset: dataset.id.clone(),
            tf,
            base_tf,
            window: params.window,
            fillgaps: params.fillgaps,
            kind,
            format,
            open: Series::new(),
            high: Series::new(),
            low: Series::new(),
            close: Series::new(),
            vol: Series::new(),
        };
        if matches!(sym.kind, AggKind::Ohlcv) {
            sym.open = Series::sampled(Reducer::First, tf);
            sym.high = Series::sampled(Reducer::Max, tf);
            sym.low = Series::sampled(Reducer::Min, tf);
            sym.close = Series::sampled(Reducer::Last, tf);
            sym.vol = Series::sampled(Reducer::Sum, tf);
        } else {
            for s in [
                &mut sym.open,
                &mut sym.high,
                &mut sym.low,
                &mut sym.close,
                &mut sym.vol,
            ] {
                s.tf = Some(tf);
            }
        }
        Ok(sym)
    }

    pub fn series(&self, field: BaseField) -> &Series {
        match field {
            BaseField::Open => &self.open,
            BaseField::High => &self.high,
            BaseField::Low => &self.low,
            BaseField::Close => &self.close,
            BaseField::Vol => &self.vol,
        }
    }

    /// Fold the source rows for the engine's current bar time `t`.
    pub fn update(&mut self, data: &Dataset, t: i64) -> bool {
        match &self.kind {
            AggKind::Ohlcv => self.update_ohlcv(data, t),
            AggKind::Copy => self.update_copy(data, t),
            AggKind::Custom(_) => self.update_custom(data, t),
        }
    }

    /// Rows within the aggregation window ending at the engine bar `t`.
    fn window_rows<'d>(&self, data: &'d Dataset, t: i64) -> Option<&'d [Vec<f64>]> {
        let last = data.rows.last()?;
        if t > last[0] as i64 {
            return None;
        }
        let mut t0 = match self.window {
            Some(w) => t - w + self.tf,
            None => t,
        };
        t0 -= t0.rem_euclid(self.tf);
        let i0 = data.first_at_or_after(t0);
        if i0 >= data.rows.len() {
            return None;
        }
        let t1 = t + self.base_tf;
        let i1 = data.first_at_or_after(t1);
        Some(&data.rows[i0..i1])
    }

    fn update_ohlcv(&mut self, data: &Dataset, t: i64) -> bool {
        let Some(rows) = self.window_rows(data, t) else {
            return false;
        };
        // Flush volume before the next window, but not before a new candle.
        if let Some(t0) = self.vol.t0 {
            if t < t0 + self.tf {
                self.vol.set(0, 0.0);
            }
        }
        if rows.is_empty() {
            if self.fillgaps == Some(false) {
                return false;
            }
            let last = self.close.peek(0);
            self.feed_all(last, last, last, last, 0.0, t);
            return true;
        }
        let rows: Vec<Vec<f64>> = rows.to_vec();
        for row in &rows {
            self.feed_all(
                self.format.value(row, "open"),
                self.format.value(row, "high"),
                self.format.value(row, "low"),
                self.format.value(row, "close"),
                self.format.value(row, "vol"),
                t,
            );
        }
        true
    }

    fn feed_all(&mut self, o: f64, h: f64, l: f64, c: f64, v: f64, t: i64) {
        let feed = |s: &mut Series, x: f64| {
            let sampler: Sampler = s.sampler.expect("ohlcv symbol series are sampled");
            sampler.feed(s, x, t);
        };
        feed(&mut self.open, o);
        feed(&mut self.high, h);
        feed(&mut self.low, l);
        feed(&mut self.close, c);
        feed(&mut self.vol, v);
    }

    fn update_copy(&mut self, data: &Dataset, t: i64) -> bool {
        let rollover = match self.close.t0 {
            None => true,
            Some(t0) => t >= t0 + self.tf,
        };
        if rollover {
            for s in [
                &mut self.open,
                &mut self.high,
                &mut self.low,
                &mut self.close,
                &mut self.vol,
            ] {
                s.unshift(f64::NAN);
                s.t0 = Some(t - t.rem_euclid(self.tf));
                s.truncate_retained();
            }
        }
        let t0 = self.close.t0.unwrap_or(t);
        let i = data.first_at_or_after(t0);
        let row = data.rows.get(i).filter(|r| r[0] as i64 == t0);

        match row {
            Some(row) => {
                let row = row.clone();
                self.open.set(0, self.format.value(&row, "open"));
                self.high.set(0, self.format.value(&row, "high"));
                self.low.set(0, self.format.value(&row, "low"));
                self.close.set(0, self.format.value(&row, "close"));
                self.vol.set(0, self.format.value(&row, "vol"));
            }
            None => {
                if self.fillgaps.unwrap_or(false) {
                    let prev = self.close.peek(1);
                    for s in [
                        &mut self.open,
                        &mut self.high,
                        &mut self.low,
                        &mut self.close,
                        &mut self.vol,
                    ] {
                        s.set(0, prev);
                    }
                }
            }
        }
        true
    }

    fn update_custom(&mut self, data: &Dataset, t: i64) -> bool {
        if data.rows.is_empty() {
            return false;
        }
        let Some(rows) = self.window_rows(data, t) else {
            return false;
        };
        let rows: Vec<Vec<f64>> = rows.to_vec();
        let AggKind::Custom(reducer) = &self.kind else {
            unreachable!("update_custom is only called for custom symbols");
        };
        let val = if !rows.is_empty() || self.fillgaps == Some(false) {
            reducer(&rows)
        } else {
            self.close.peek(0)
        };
        let rollover = match self.close.t0 {
            None => true,
            Some(t0) => t >= t0 + self.tf,
        };
        if rollover {
            self.close.unshift(val);
            self.close.t0 = Some(t - t.rem_euclid(self.tf));
            self.close.truncate_retained();
        } else {
            self.close.set(0, val);
        }
        true
    }
}
