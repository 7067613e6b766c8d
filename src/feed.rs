//! OHLCV bars, the shared base feed and auxiliary datasets.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::BarscriptError;
use crate::series::Series;

/// One OHLCV sample. Timestamps are UTC milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    pub fn from_row(row: &[f64]) -> Option<Bar> {
        if row.len() < 6 {
            return None;
        }
        Some(Bar {
            time: row[0] as i64,
            open: row[1],
            high: row[2],
            low: row[3],
            close: row[4],
            volume: row[5],
        })
    }

    pub fn to_row(&self) -> Vec<f64> {
        vec![
            self.time as f64,
            self.open,
            self.high,
            self.low,
            self.close,
            self.volume,
        ]
    }
}

/// The five roles of an OHLCV feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BaseField {
    Open,
    High,
    Low,
    Close,
    Vol,
}

impl BaseField {
    pub const ALL: [BaseField; 5] = [
        BaseField::Open,
        BaseField::High,
        BaseField::Low,
        BaseField::Close,
        BaseField::Vol,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            BaseField::Open => "open",
            BaseField::High => "high",
            BaseField::Low => "low",
            BaseField::Close => "close",
            BaseField::Vol => "vol",
        }
    }

    pub fn from_name(name: &str) -> Option<BaseField> {
        match name {
            "open" => Some(BaseField::Open),
            "high" => Some(BaseField::High),
            "low" => Some(BaseField::Low),
            "close" => Some(BaseField::Close),
            "vol" | "volume" => Some(BaseField::Vol),
            _ => None,
        }
    }

    pub fn of_bar(&self, bar: &Bar) -> f64 {
        match self {
            BaseField::Open => bar.open,
            BaseField::High => bar.high,
            BaseField::Low => bar.low,
            BaseField::Close => bar.close,
            BaseField::Vol => bar.volume,
        }
    }
}

/// The shared working buffers over the base OHLCV history.
///
/// The engine is the only writer; script environments read through shared
/// references during their step.
#[derive(Debug, Default)]
pub struct BaseFeed {
    pub open: Series,
    pub high: Series,
    pub low: Series,
    pub close: Series,
    pub vol: Series,
}

impl BaseFeed {
    pub fn new() -> Self {
        Self::default()
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

    /// Fold one bar in. `unshift` advances history; otherwise slot 0 is
    /// revised in place.
    pub fn step(&mut self, bar: &Bar, unshift: bool) {
        if unshift {
            self.open.unshift(bar.open);
            self.high.unshift(bar.high);
            self.low.unshift(bar.low);
            self.close.unshift(bar.close);
            self.vol.unshift(bar.volume);
        } else {
            self.open.set(0, bar.open);
            self.high.set(0, bar.high);
            self.low.set(0, bar.low);
            self.close.set(0, bar.close);
            self.vol.set(0, bar.volume);
        }
    }

    pub fn truncate(&mut self) {
        self.open.truncate_retained();
        self.high.truncate_retained();
        self.low.truncate_retained();
        self.close.truncate_retained();
        self.vol.truncate_retained();
    }
}

/// An uploaded dataset: the base OHLCV feed or a foreign row stream a
/// script aligns through `sym`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    pub id: String,
    pub rows: Vec<Vec<f64>>,
    #[serde(default)]
    pub last_upd: i64,
}

impl Dataset {
    pub fn new(id: impl Into<String>, rows: Vec<Vec<f64>>) -> Self {
        Self {
            id: id.into(),
            rows,
            last_upd: 0,
        }
    }

    /// Rough in-memory size, used for the engine's dataset budget.
    pub fn byte_size(&self) -> usize {
        self.rows
            .iter()
            .map(|r| r.len() * std::mem::size_of::<f64>())
            .sum()
    }

    /// Index of the first row with timestamp >= t (rows are time-ordered).
    pub fn first_at_or_after(&self, t: i64) -> usize {
        self.rows.partition_point(|r| (r[0] as i64) < t)
    }
}

pub type Datasets = HashMap<String, Dataset>;

/// Load OHLCV bars from a CSV file with columns
/// `time,open,high,low,close,volume`. The time column accepts UTC
/// milliseconds or `%Y-%m-%d` dates.
pub fn load_csv(path: &Path) -> Result<Vec<Bar>, BarscriptError> {
    let mut rdr = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .map_err(|e| BarscriptError::Data {
            reason: format!("failed to open {}: {}", path.display(), e),
        })?;

    let mut bars = Vec::new();
    for result in rdr.records() {
        let record = result.map_err(|e| BarscriptError::Data {
            reason: format!("CSV parse error: {}", e),
        })?;
        let field = |i: usize, name: &str| -> Result<f64, BarscriptError> {
            record
                .get(i)
                .ok_or_else(|| BarscriptError::Data {
                    reason: format!("missing {} column", name),
                })?
                .trim()
                .parse()
                .map_err(|e| BarscriptError::Data {
                    reason: format!("invalid {} value: {}", name, e),
                })
        };

        let time_str = record
            .get(0)
            .ok_or_else(|| BarscriptError::Data {
                reason: "missing time column".into(),
            })?
            .trim();
        let time = parse_time(time_str).ok_or_else(|| BarscriptError::Data {
            reason: format!("invalid time value: {}", time_str),
        })?;

        bars.push(Bar {
            time,
            open: field(1, "open")?,
            high: field(2, "high")?,
            low: field(3, "low")?,
            close: field(4, "close")?,
            volume: field(5, "volume").unwrap_or(0.0),
        });
    }
    bars.sort_by_key(|b| b.time);
    Ok(bars)
}

fn parse_time(s: &str) -> Option<i64> {
    if let Ok(ms) = s.parse::<i64>() {
        return Some(ms);
    }
    let date = chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()?;
    Some(date.and_hms_opt(0, 0, 0)?.and_utc().timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn base_feed_step_and_revise() {
        let mut feed = BaseFeed::new();
        let b1 = Bar {
            time: 0,
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close: 1.5,
            volume: 10.0,
        };
        feed.step(&b1, true);
        let b2 = Bar {
            close: 1.8,
            ..b1
        };
        feed.step(&b2, false);
        assert_eq!(feed.close.peek(0), 1.8);
        assert_eq!(feed.close.len(), 1);
        feed.step(&b1, true);
        assert_eq!(feed.close.len(), 2);
        assert_eq!(feed.close.peek(1), 1.8);
    }

    #[test]
    fn bar_row_round_trip() {
        let bar = Bar {
            time: 1000,
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close: 1.5,
            volume: 3.0,
        };
        assert_eq!(Bar::from_row(&bar.to_row()), Some(bar));
        assert_eq!(Bar::from_row(&[1.0, 2.0]), None);
    }

    #[test]
    fn dataset_search() {
        let ds = Dataset::new(
            "x",
            vec![vec![100.0, 1.0], vec![200.0, 2.0], vec![300.0, 3.0]],
        );
        assert_eq!(ds.first_at_or_after(150), 1);
        assert_eq!(ds.first_at_or_after(200), 1);
        assert_eq!(ds.first_at_or_after(301), 3);
    }

    #[test]
    fn csv_loading() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "time,open,high,low,close,volume").unwrap();
        writeln!(f, "1000,1,2,0.5,1.5,10").unwrap();
        writeln!(f, "2000,1.5,2.5,1.0,2.0,20").unwrap();
        let bars = load_csv(f.path()).unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].time, 1000);
        assert_eq!(bars[1].close, 2.0);
    }

    #[test]
    fn csv_date_column() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "time,open,high,low,close,volume").unwrap();
        writeln!(f, "2024-01-15,1,2,0.5,1.5,10").unwrap();
        let bars = load_csv(f.path()).unwrap();
        assert_eq!(bars[0].time, 1_705_276_800_000);
    }
}
