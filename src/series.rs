//! Managed time-series buffers.
//!
//! A [`Series`] is a reverse-chronological numeric buffer: index 0 is the
//! current bar, index k is k bars ago. Buffers start small and grow as
//! deeper indices are observed; the retained length never shrinks below
//! the deepest observed index plus a fixed headroom. Truncation only drops
//! entries beyond the retained length.

use std::cell::Cell;
use std::collections::HashMap;
use std::fmt;

use crate::sampler::{Reducer, Sampler};

/// Extra slots kept beyond the deepest observed index.
pub const HEADROOM: usize = 5;
/// Minimum retained length for any buffer.
pub const DEF_LIMIT: usize = 5;

/// Lifecycle stage a call site belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    Init,
    Update,
    Post,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Init => write!(f, "init"),
            Stage::Update => write!(f, "update"),
            Stage::Post => write!(f, "post"),
        }
    }
}

/// Identifies one syntactic call in one lifecycle body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallSite {
    pub stage: Stage,
    pub ordinal: u32,
}

/// Stable identity of a series buffer.
///
/// The root is either a call site (for buffers created by instrumented
/// primitive calls) or a name (for the base feed and symbol outputs).
/// Nested primitives extend the key with derived tags, so e.g. the RMA
/// inside an RSI at call site (update, 3) is keyed
/// `(update,3) / rsi(14) / up`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SeriesKey {
    pub root: KeyRoot,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyRoot {
    Site(CallSite),
    Named(String),
}

impl SeriesKey {
    pub fn site(stage: Stage, ordinal: u32) -> Self {
        Self {
            root: KeyRoot::Site(CallSite { stage, ordinal }),
            tags: Vec::new(),
        }
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            root: KeyRoot::Named(name.into()),
            tags: Vec::new(),
        }
    }

    /// Derive a child key by appending a tag segment.
    pub fn child(&self, tag: impl Into<String>) -> Self {
        let mut tags = self.tags.clone();
        tags.push(tag.into());
        Self {
            root: self.root.clone(),
            tags,
        }
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.root {
            KeyRoot::Site(cs) => write!(f, "{}:{}", cs.stage, cs.ordinal)?,
            KeyRoot::Named(n) => write!(f, "{}", n)?,
        }
        for t in &self.tags {
            write!(f, "/{}", t)?;
        }
        Ok(())
    }
}

/// A reverse-chronological numeric buffer.
#[derive(Debug, Clone)]
pub struct Series {
    vals: Vec<f64>,
    /// Deepest observed index + headroom. `Cell` so that read access can
    /// record depth through a shared reference.
    retained: Cell<usize>,
    /// Aggregation timeframe, when this series is a sampler output.
    pub tf: Option<i64>,
    /// Sampler driving this series, when aggregated.
    pub sampler: Option<Sampler>,
    /// Start of the sampler's current window.
    pub t0: Option<i64>,
    /// Display-only shift in bars, consumed by the renderer.
    pub offset: Cell<i64>,
}

impl Series {
    pub fn new() -> Self {
        Self {
            vals: Vec::new(),
            retained: Cell::new(0),
            tf: None,
            sampler: None,
            t0: None,
            offset: Cell::new(0),
        }
    }

    pub fn sampled(kind: Reducer, tf: i64) -> Self {
        let mut s = Self::new();
        s.tf = Some(tf);
        s.sampler = Some(Sampler::new(kind, tf));
        s
    }

    /// Read index `i`, recording the observed depth. Out-of-range reads
    /// return NaN (and still widen the retained length for later bars).
    pub fn get(&self, i: usize) -> f64 {
        self.observe(i);
        self.vals.get(i).copied().unwrap_or(f64::NAN)
    }

    /// Read without depth tracking.
    pub fn peek(&self, i: usize) -> f64 {
        self.vals.get(i).copied().unwrap_or(f64::NAN)
    }

    /// Record that index `i` was needed. Monotonic.
    pub fn observe(&self, i: usize) {
        if i >= self.retained.get() {
            self.retained.set(i + HEADROOM);
        }
    }

    pub fn retained(&self) -> usize {
        self.retained.get()
    }

    /// Explicit retained-length floor (`buffsize`).
    pub fn reserve_depth(&self, len: usize) {
        if len > self.retained.get() {
            self.retained.set(len);
        }
    }

    /// Overwrite slot `i`, growing the buffer with NaN if needed.
    pub fn set(&mut self, i: usize, v: f64) {
        if i >= self.vals.len() {
            self.vals.resize(i + 1, f64::NAN);
        }
        self.vals[i] = v;
    }

    /// Advance one bar: everything shifts one slot deeper.
    pub fn unshift(&mut self, v: f64) {
        self.vals.insert(0, v);
    }

    pub fn len(&self) -> usize {
        self.vals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vals.is_empty()
    }

    /// Drop entries beyond the retained length (never entries within it).
    pub fn truncate_retained(&mut self) {
        let keep = self.retained.get().max(DEF_LIMIT);
        if self.vals.len() > keep {
            self.vals.truncate(keep);
        }
    }
}

impl Default for Series {
    fn default() -> Self {
        Self::new()
    }
}

/// Keyed map of series owned by one script environment.
#[derive(Debug, Default)]
pub struct SeriesStore {
    map: HashMap<SeriesKey, Series>,
}

impl SeriesStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `x` into the series at `key`, creating it on first use.
    ///
    /// Without a timeframe the current slot is overwritten (the engine's
    /// per-bar unshift already advanced it). With a timeframe the value is
    /// routed through a last-value sampler so the series only advances on
    /// window boundaries.
    pub fn record(&mut self, key: &SeriesKey, x: f64, tf: Option<i64>, t: i64) -> &Series {
        let fresh = !self.map.contains_key(key);
        if fresh {
            let s = match tf {
                Some(tf) => Series::sampled(Reducer::Last, tf),
                None => Series::new(),
            };
            self.map.insert(key.clone(), s);
        }
        let s = self.map.get_mut(key).expect("just ensured above");
        match s.sampler {
            Some(sampler) => sampler.feed(s, x, t),
            None if fresh => s.unshift(x),
            None => s.set(0, x),
        }
        &self.map[key]
    }

    /// Record through an explicit reducer kind (`sample` primitive).
    pub fn record_sampled(
        &mut self,
        key: &SeriesKey,
        x: f64,
        kind: Reducer,
        tf: i64,
        t: i64,
    ) -> &Series {
        if !self.map.contains_key(key) {
            self.map.insert(key.clone(), Series::sampled(kind, tf));
        }
        let s = self.map.get_mut(key).unwrap();
        let sampler = s.sampler.clone().expect("sampled series has a sampler");
        sampler.feed(s, x, t);
        &self.map[key]
    }

    pub fn get(&self, key: &SeriesKey) -> Option<&Series> {
        self.map.get(key)
    }

    pub fn get_mut(&mut self, key: &SeriesKey) -> Option<&mut Series> {
        self.map.get_mut(key)
    }

    pub fn contains(&self, key: &SeriesKey) -> bool {
        self.map.contains_key(key)
    }

    /// Advance every non-aggregated series one bar. Aggregated series
    /// advance through their own samplers when written.
    pub fn unshift_all(&mut self) {
        for s in self.map.values_mut() {
            if s.tf.is_none() {
                s.unshift(f64::NAN);
            }
        }
    }

    pub fn truncate_all(&mut self) {
        for s in self.map.values_mut() {
            s.truncate_retained();
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
