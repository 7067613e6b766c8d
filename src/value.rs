//! Runtime values flowing through the interpreter and standard library.

use crate::feed::BaseField;
use crate::series::SeriesKey;

/// Reference to a series buffer, wherever it lives.
#[derive(Debug, Clone, PartialEq)]
pub enum SeriesRef {
    /// One of the shared base-feed series.
    Base(BaseField),
    /// A series owned by the current script environment.
    Owned(SeriesKey),
    /// A derived OHLCV series of an aggregated symbol.
    Sym { sym: SeriesKey, field: BaseField },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Explicit "no value" (absent optional argument, null literal, NaN-ish).
    Na,
    Num(f64),
    Bool(bool),
    Str(String),
    Series(SeriesRef),
    /// An aggregated symbol handle (five derived series).
    Sym(SeriesKey),
    List(Vec<Value>),
    /// Insertion-ordered string-keyed map (settings objects, prop descriptors).
    Map(Vec<(String, Value)>),
}

impl Value {
    pub fn map_get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(entries) => entries.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    /// Truthiness for everything that does not need series access.
    /// Series values are dereferenced by the interpreter first.
    pub fn truthy(&self) -> bool {
        match self {
            Value::Na => false,
            Value::Num(n) => *n != 0.0 && !n.is_nan(),
            Value::Bool(b) => *b,
            Value::Str(s) => !s.is_empty(),
            Value::List(v) => !v.is_empty(),
            Value::Map(_) | Value::Series(_) | Value::Sym(_) => true,
        }
    }

    /// Plain numeric view, NaN when the value has no numeric shape.
    /// Series references need interpreter context and are handled there.
    pub fn as_num(&self) -> f64 {
        match self {
            Value::Num(n) => *n,
            Value::Bool(true) => 1.0,
            Value::Bool(false) => 0.0,
            _ => f64::NAN,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_na(&self) -> bool {
        matches!(self, Value::Na) || matches!(self, Value::Num(n) if n.is_nan())
    }

    pub fn from_bool_num(b: bool) -> Value {
        Value::Num(if b { 1.0 } else { 0.0 })
    }
}

impl Value {
    /// Host-boundary view of a value. Series references collapse to null;
    /// they are meaningless outside their owning environment.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as J;
        match self {
            Value::Na | Value::Series(_) | Value::Sym(_) => J::Null,
            Value::Num(n) if n.is_nan() => J::Null,
            Value::Num(n) => serde_json::Number::from_f64(*n).map(J::Number).unwrap_or(J::Null),
            Value::Bool(b) => J::Bool(*b),
            Value::Str(s) => J::String(s.clone()),
            Value::List(items) => J::Array(items.iter().map(Value::to_json).collect()),
            Value::Map(entries) => J::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }

    pub fn from_json(json: &serde_json::Value) -> Value {
        use serde_json::Value as J;
        match json {
            J::Null => Value::Na,
            J::Bool(b) => Value::Bool(*b),
            J::Number(n) => Value::Num(n.as_f64().unwrap_or(f64::NAN)),
            J::String(s) => Value::Str(s.clone()),
            J::Array(items) => Value::List(items.iter().map(Value::from_json).collect()),
            J::Object(map) => Value::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Num(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthiness() {
        assert!(!Value::Na.truthy());
        assert!(!Value::Num(0.0).truthy());
        assert!(!Value::Num(f64::NAN).truthy());
        assert!(Value::Num(-1.0).truthy());
        assert!(!Value::Str(String::new()).truthy());
        assert!(Value::Str("x".into()).truthy());
    }

    #[test]
    fn map_lookup() {
        let m = Value::Map(vec![
            ("def".into(), Value::Num(14.0)),
            ("type".into(), Value::Str("integer".into())),
        ]);
        assert_eq!(m.map_get("def"), Some(&Value::Num(14.0)));
        assert_eq!(m.map_get("missing"), None);
    }

    #[test]
    fn na_detection() {
        assert!(Value::Na.is_na());
        assert!(Value::Num(f64::NAN).is_na());
        assert!(!Value::Num(0.0).is_na());
    }
}
