//! The BarScript dialect: source scanning, tokenizing, parsing and the
//! per-section descriptors.
//!
//! Grammar sketch:
//! `[OVERLAY key=val,...] <body>` and
//! `[INDICATOR key=val,...] <init> [UPDATE] <update> [POST] <post>`,
//! each section running to the next marker or `[EOF]`. A leading
//! `~<float>-<tag>` version header may appear in a comment line.

pub mod ast;
pub mod indicator;
pub mod lexer;
pub mod overlay;
pub mod parser;
pub mod source;

use std::collections::HashMap;

use log::warn;

use crate::dsl::ast::{Expr, UnOp};
use crate::error::ParseError;
use crate::value::Value;

pub use indicator::IndicatorDescriptor;
pub use overlay::{OverlayDescriptor, OverlayFlags, OverlayPrefab};
pub use source::SectionKind;

/// A property a script declares: name, type and default value.
#[derive(Debug, Clone, PartialEq)]
pub struct PropSpec {
    pub name: String,
    pub ptype: String,
    pub default: Value,
}

/// A whole script file parsed into its descriptors, in source order.
#[derive(Debug, Clone)]
pub struct ParsedScript {
    pub name: String,
    pub version: f64,
    pub tag: Option<String>,
    pub overlays: Vec<OverlayDescriptor>,
    pub indicators: Vec<IndicatorDescriptor>,
    pub warnings: Vec<String>,
}

/// Parse a script file. A malformed section is a hard error scoped to the
/// whole file; callers holding several files drop only the failing one.
pub fn parse_script(src: &str, fallback_name: &str) -> Result<ParsedScript, ParseError> {
    let name = source::extract_name(src).unwrap_or_else(|| fallback_name.to_string());
    let (version, tag) = source::version_header(src);

    let mut warnings = Vec::new();
    if version == 0.0 {
        warnings.push(format!("{}: no script version header", name));
    }
    if version > source::VERSION {
        warnings.push(format!(
            "{}: script version {} is newer than parser version {}",
            name,
            version,
            source::VERSION
        ));
    }
    if version != 0.0 && tag.as_deref() != Some(source::VERSION_TAG) {
        warnings.push(format!(
            "{}: expected version tag '{}', e.g. ~{}-{}",
            name,
            source::VERSION_TAG,
            source::VERSION,
            source::VERSION_TAG
        ));
    }
    for w in &warnings {
        warn!("{}", w);
    }

    let clean = source::decomment(src)?;
    let mut overlays = Vec::new();
    let mut indicators = Vec::new();
    for section in source::sections(&clean) {
        match section.kind {
            SectionKind::Overlay => overlays.push(overlay::parse_overlay(&section)?),
            SectionKind::Indicator => {
                indicators.push(indicator::parse_indicator(&section, &name)?)
            }
        }
    }

    Ok(ParsedScript {
        name,
        version,
        tag,
        overlays,
        indicators,
        warnings,
    })
}

/// Evaluate a constant expression (literals, arithmetic, lists, maps and
/// references into `scope`). Used for `static var` tables and prop
/// defaults; anything needing runtime state yields None.
pub fn const_eval(expr: &Expr, scope: &HashMap<String, Value>) -> Option<Value> {
    use crate::dsl::ast::BinOp;
    match expr {
        Expr::Num(n) => Some(Value::Num(*n)),
        Expr::Str(s) => Some(Value::Str(s.clone())),
        Expr::Bool(b) => Some(Value::Bool(*b)),
        Expr::Na => Some(Value::Na),
        Expr::Ident(name) => scope.get(name).cloned(),
        Expr::Unary { op, expr } => {
            let v = const_eval(expr, scope)?;
            match op {
                UnOp::Neg => Some(Value::Num(-v.as_num())),
                UnOp::Not => Some(Value::Bool(!v.truthy())),
            }
        }
        Expr::Binary { op, lhs, rhs } => {
            let l = const_eval(lhs, scope)?;
            let r = const_eval(rhs, scope)?;
            let (a, b) = (l.as_num(), r.as_num());
            Some(match op {
                BinOp::Add => Value::Num(a + b),
                BinOp::Sub => Value::Num(a - b),
                BinOp::Mul => Value::Num(a * b),
                BinOp::Div => Value::Num(a / b),
                BinOp::Rem => Value::Num(a % b),
                BinOp::Eq => Value::Bool(l == r),
                BinOp::Ne => Value::Bool(l != r),
                BinOp::Lt => Value::Bool(a < b),
                BinOp::Le => Value::Bool(a <= b),
                BinOp::Gt => Value::Bool(a > b),
                BinOp::Ge => Value::Bool(a >= b),
                BinOp::And => Value::Bool(l.truthy() && r.truthy()),
                BinOp::Or => Value::Bool(l.truthy() || r.truthy()),
            })
        }
        Expr::Ternary { cond, then, other } => {
            let c = const_eval(cond, scope)?;
            if c.truthy() {
                const_eval(then, scope)
            } else {
                const_eval(other, scope)
            }
        }
        Expr::List(items) => items
            .iter()
            .map(|e| const_eval(e, scope))
            .collect::<Option<Vec<_>>>()
            .map(Value::List),
        Expr::Map(entries) => entries
            .iter()
            .map(|(k, e)| const_eval(e, scope).map(|v| (k.clone(), v)))
            .collect::<Option<Vec<_>>>()
            .map(Value::Map),
        Expr::Call(_) | Expr::Index { .. } | Expr::Member { .. } => None,
    }
}

/// Coerce a prop default by its literal shape, and derive a type name for
/// schemas that do not state one.
pub fn infer_prop_type(default: &Value) -> &'static str {
    match default {
        Value::Bool(_) => "checkbox",
        Value::Num(n) if n.fract() == 0.0 => "integer",
        Value::Num(_) => "number",
        Value::Str(_) => "string",
        _ => "string",
    }
}

/// Collect `prop('name', { ... })` declarations from a parsed block.
pub fn collect_props(block: &ast::Block) -> Vec<PropSpec> {
    let mut props = Vec::new();
    for stmt in &block.stmts {
        let ast::Stmt::Expr(Expr::Call(call)) = stmt else {
            continue;
        };
        if call.name != "prop" || call.args.is_empty() {
            continue;
        }
        let Expr::Str(name) = &call.args[0] else {
            continue;
        };
        let empty = HashMap::new();
        let descr = call
            .args
            .get(1)
            .and_then(|e| const_eval(e, &empty))
            .unwrap_or(Value::Map(vec![]));
        let default = descr.map_get("def").cloned().unwrap_or(Value::Na);
        let ptype = descr
            .map_get("type")
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| infer_prop_type(&default).to_string());
        props.push(PropSpec {
            name: name.clone(),
            ptype,
            default,
        });
    }
    props
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn const_eval_arithmetic() {
        let expr = parser::parse_expr("2 * 3 + 1").unwrap();
        assert_eq!(const_eval(&expr, &HashMap::new()), Some(Value::Num(7.0)));
    }

    #[test]
    fn const_eval_rejects_calls() {
        let expr = parser::parse_expr("sma(close, 14)").unwrap();
        assert_eq!(const_eval(&expr, &HashMap::new()), None);
    }

    #[test]
    fn const_eval_scope_chaining() {
        let mut scope = HashMap::new();
        scope.insert("K".to_string(), Value::Num(10.0));
        let expr = parser::parse_expr("K / 2").unwrap();
        assert_eq!(const_eval(&expr, &scope), Some(Value::Num(5.0)));
    }

    #[test]
    fn prop_collection_with_shapes() {
        let block = parser::parse_body(
            "prop('length', { type: 'integer', def: 14 })\n\
             prop('show', { def: true })\n\
             prop('title', { def: 'RSI' })\n\
             var x = 1",
        )
        .unwrap();
        let props = collect_props(&block);
        assert_eq!(props.len(), 3);
        assert_eq!(props[0].name, "length");
        assert_eq!(props[0].ptype, "integer");
        assert_eq!(props[0].default, Value::Num(14.0));
        assert_eq!(props[1].ptype, "checkbox");
        assert_eq!(props[2].ptype, "string");
    }

    #[test]
    fn full_script_counts_sections_in_order() {
        let src = "\
// BarScript~0.2-lite
[OVERLAY name=Spline]
legend() => null
[INDICATOR name=MyRsi]
prop('length', { def: 14 })
[UPDATE]
var r = rsi(close, length)
[EOF]
";
        let parsed = parse_script(src, "fallback").unwrap();
        assert_eq!(parsed.name, "Spline");
        assert_eq!(parsed.version, 0.2);
        assert_eq!(parsed.tag.as_deref(), Some("lite"));
        assert_eq!(parsed.overlays.len(), 1);
        assert_eq!(parsed.indicators.len(), 1);
        assert!(parsed.warnings.is_empty());
    }

    #[test]
    fn missing_version_warns_but_parses() {
        let parsed = parse_script("[OVERLAY name=Test]\n", "fb").unwrap();
        assert_eq!(parsed.version, 0.0);
        assert_eq!(parsed.overlays.len(), 1);
        assert_eq!(parsed.indicators.len(), 0);
        assert!(!parsed.warnings.is_empty());
    }

    #[test]
    fn unbalanced_quote_is_fatal_for_the_script() {
        let src = "[INDICATOR name=X]\nvar s = 'oops\n";
        assert!(parse_script(src, "fb").is_err());
    }
}
