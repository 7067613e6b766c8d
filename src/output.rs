//! Structures produced for the host: overlay data, engine telemetry and
//! script signals. Rendering itself happens outside this crate.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Where a produced overlay is attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    /// Instantiated on the script's own pane via a plot primitive.
    Pane,
    /// Replaces the main chart of a view.
    Chart,
    /// Drawn over the main chart.
    Onchart,
    /// Drawn in a separate sub-pane.
    Offchart,
}

/// One named, typed unit of script output: a plotted series or shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverlayOut {
    pub uuid: String,
    pub name: String,
    #[serde(rename = "type")]
    pub overlay_type: String,
    pub kind: OutputKind,
    /// Data rows, `[time, value, ...]`, chronological.
    pub data: Vec<Vec<f64>>,
    pub settings: serde_json::Value,
    /// Producing script instance.
    pub prod: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub view: Option<String>,
    /// Display-only shift in bars.
    #[serde(default)]
    pub offset: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub legend: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub y_range: Option<(f64, f64)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tracker: Option<serde_json::Value>,
}

/// Append `row` to chronological data, revising the last row when the
/// timestamp matches instead of growing history.
pub fn push_point(data: &mut Vec<Vec<f64>>, row: Vec<f64>) {
    match data.last_mut() {
        Some(last) if last.first() == row.first() => *last = row,
        _ => data.push(row),
    }
}

/// Everything one script instance produced during a run.
#[derive(Debug, Clone, Default)]
pub struct ScriptOutput {
    pub overlays: Vec<OverlayOut>,
    index: HashMap<String, usize>,
    /// Settings patches raised through the `settings` primitive.
    pub setting_updates: Vec<serde_json::Value>,
    /// `modify` calls addressed at arbitrary overlays.
    pub modifies: Vec<(String, serde_json::Value)>,
}

impl ScriptOutput {
    pub fn clear(&mut self) {
        self.overlays.clear();
        self.index.clear();
        self.setting_updates.clear();
        self.modifies.clear();
    }

    /// Get or create the overlay addressed by `dispatch_key`, then append
    /// one data row to it.
    #[allow(clippy::too_many_arguments)]
    pub fn point(
        &mut self,
        dispatch_key: String,
        overlay_type: &str,
        name: &str,
        kind: OutputKind,
        settings: &Value,
        prod: &str,
        view: Option<&str>,
        row: Vec<f64>,
        offset: i64,
    ) {
        let idx = match self.index.get(&dispatch_key) {
            Some(&i) => i,
            None => {
                let name = settings
                    .map_get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or(name)
                    .to_string();
                self.overlays.push(OverlayOut {
                    uuid: uuid::Uuid::new_v4().to_string(),
                    name,
                    overlay_type: overlay_type.to_string(),
                    kind,
                    data: Vec::new(),
                    settings: settings.to_json(),
                    prod: prod.to_string(),
                    view: view.map(str::to_string),
                    offset,
                    legend: None,
                    y_range: None,
                    tracker: None,
                });
                let i = self.overlays.len() - 1;
                self.index.insert(dispatch_key, i);
                i
            }
        };
        let ov = &mut self.overlays[idx];
        ov.offset = offset;
        push_point(&mut ov.data, row);
    }
}

/// An event a script raises for host consumption.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Signal {
    #[serde(rename = "type")]
    pub signal_type: String,
    pub data: serde_json::Value,
}

/// Engine telemetry sent after every run and streaming update.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EngineState {
    pub scripts: usize,
    /// Last full/delta run duration in milliseconds.
    pub last_perf: f64,
    pub iter: usize,
    pub last_t: i64,
    /// Estimated dataset memory in MB.
    pub data_size: f64,
    pub running: bool,
}

/// Overlay output partitioned by owning pane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaneOut {
    pub id: String,
    pub uuid: String,
    pub overlays: Vec<OverlayOut>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_point_replaces_same_timestamp() {
        let mut data = vec![vec![100.0, 1.0]];
        push_point(&mut data, vec![100.0, 2.0]);
        assert_eq!(data, vec![vec![100.0, 2.0]]);
        push_point(&mut data, vec![200.0, 3.0]);
        assert_eq!(data.len(), 2);
    }

    #[test]
    fn point_creates_then_appends() {
        let mut out = ScriptOutput::default();
        let sett = Value::Map(vec![("color".into(), Value::Str("#f00".into()))]);
        for t in [0.0, 60.0, 60.0] {
            out.point(
                "Spline:1".into(),
                "Spline",
                "Spline",
                OutputKind::Pane,
                &sett,
                "script-1",
                None,
                vec![t, t * 2.0],
                0,
            );
        }
        assert_eq!(out.overlays.len(), 1);
        let ov = &out.overlays[0];
        assert_eq!(ov.overlay_type, "Spline");
        assert_eq!(ov.data.len(), 2);
        assert_eq!(ov.data[1], vec![60.0, 120.0]);
        assert_eq!(ov.prod, "script-1");
    }

    #[test]
    fn settings_name_overrides_default() {
        let mut out = ScriptOutput::default();
        let sett = Value::Map(vec![("name".into(), Value::Str("Fast MA".into()))]);
        out.point(
            "k".into(),
            "Spline",
            "Spline",
            OutputKind::Onchart,
            &sett,
            "s",
            None,
            vec![0.0, 1.0],
            0,
        );
        assert_eq!(out.overlays[0].name, "Fast MA");
    }

    #[test]
    fn distinct_keys_make_distinct_overlays() {
        let mut out = ScriptOutput::default();
        let sett = Value::Map(vec![]);
        out.point(
            "a".into(),
            "Spline",
            "A",
            OutputKind::Pane,
            &sett,
            "s",
            None,
            vec![0.0, 1.0],
            0,
        );
        out.point(
            "b".into(),
            "Spline",
            "B",
            OutputKind::Pane,
            &sett,
            "s",
            None,
            vec![0.0, 2.0],
            0,
        );
        assert_eq!(out.overlays.len(), 2);
        assert_ne!(out.overlays[0].uuid, out.overlays[1].uuid);
    }
}
