//! `[OVERLAY]` sections: named hook functions, derived flags and the
//! `static var` table.
//!
//! The grammar already normalizes the three declaration variants
//! (`name(a) { .. }`, `name(a) => { .. }`, `name(a) => expr`) into one
//! [`FnDecl`] form, so this pass only classifies the results: known hook
//! names feed the prefab interface, `static var` statements are evaluated
//! once into a constant table, and everything else stays as setup code.

use std::collections::HashMap;

use crate::dsl::ast::{Block, Expr, FnBody, FnDecl, Stmt};
use crate::dsl::source::RawSection;
use crate::dsl::{collect_props, const_eval, parser, PropSpec};
use crate::error::ParseError;
use crate::value::Value;

/// Flags derived from hook signatures at parse time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OverlayFlags {
    /// The legend hook's body is literally null: the renderer skips the
    /// legend entirely.
    pub no_legend: bool,
    /// The yield-range hook takes (hi, lo): the engine must precompute the
    /// visible high/low before calling it.
    pub y_range_pre_calc: bool,
}

#[derive(Debug, Clone)]
pub struct OverlayDescriptor {
    pub name: String,
    pub tag_props: HashMap<String, String>,
    pub flags: OverlayFlags,
    /// `static var` table, evaluated once at parse time. References to
    /// these names inside hooks resolve against this table.
    pub statics: Vec<(String, Value)>,
    pub funcs: HashMap<String, FnDecl>,
    /// Top-level statements outside any function (run at instantiation).
    pub setup: Block,
    pub props: Vec<PropSpec>,
}

/// The fixed lifecycle/metadata interface every overlay exposes. Absent
/// hooks are no-ops (None).
#[derive(Debug, Clone)]
pub struct OverlayPrefab {
    pub name: String,
    pub flags: OverlayFlags,
    pub statics: Vec<(String, Value)>,
    /// Every declared function, so hooks can call their own helpers.
    pub funcs: HashMap<String, FnDecl>,
    pub legend: Option<FnDecl>,
    pub y_range: Option<FnDecl>,
    pub value_tracker: Option<FnDecl>,
    pub data_format: Option<FnDecl>,
    pub ohlc: Option<FnDecl>,
}

pub fn parse_overlay(section: &RawSection) -> Result<OverlayDescriptor, ParseError> {
    let block = parser::parse_body(&section.body).map_err(|e| ParseError {
        message: e.message,
        position: e.position + section.body_offset,
    })?;

    let mut funcs = HashMap::new();
    let mut statics = Vec::new();
    let mut scope: HashMap<String, Value> = HashMap::new();
    let mut setup = Block::empty();
    let mut flags = OverlayFlags::default();

    for stmt in block.stmts {
        match stmt {
            Stmt::FnDecl(decl) => {
                apply_flags(&mut flags, &decl);
                funcs.insert(decl.name.clone(), decl);
            }
            Stmt::StaticVar { name, expr } => {
                let val = const_eval(&expr, &scope).ok_or_else(|| {
                    ParseError::new(
                        format!("static var '{}' is not a constant expression", name),
                        section.body_offset,
                    )
                })?;
                scope.insert(name.clone(), val.clone());
                statics.push((name, val));
            }
            other => setup.stmts.push(other),
        }
    }

    let props = collect_props(&setup);
    let name = section
        .props
        .get("name")
        .cloned()
        .unwrap_or_else(|| "Overlay".to_string());

    Ok(OverlayDescriptor {
        name,
        tag_props: section.props.clone(),
        flags,
        statics,
        funcs,
        setup,
        props,
    })
}

fn apply_flags(flags: &mut OverlayFlags, decl: &FnDecl) {
    match decl.name.as_str() {
        "yRange" => flags.y_range_pre_calc = decl.params.len() > 1,
        "legend" => {
            let body_is_null = match &decl.body {
                FnBody::Expr(Expr::Na) => true,
                FnBody::Block(b) => {
                    matches!(b.stmts.as_slice(), [Stmt::Expr(Expr::Na)])
                }
                _ => false,
            };
            if body_is_null {
                flags.no_legend = true;
            }
        }
        _ => {}
    }
}

impl OverlayDescriptor {
    pub fn hook(&self, name: &str) -> Option<&FnDecl> {
        self.funcs.get(name)
    }

    /// Build the fixed-interface prefab, defaulting absent hooks to no-ops.
    pub fn prefab(&self) -> OverlayPrefab {
        let get = |n: &str| self.funcs.get(n).cloned();
        OverlayPrefab {
            name: self.name.clone(),
            flags: self.flags,
            statics: self.statics.clone(),
            funcs: self.funcs.clone(),
            legend: get("legend"),
            y_range: get("yRange"),
            value_tracker: get("valueTracker"),
            data_format: get("dataFormat"),
            ohlc: get("ohlc"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsl::source::sections;

    fn parse_one(src: &str) -> OverlayDescriptor {
        let secs = sections(src);
        assert_eq!(secs.len(), 1);
        parse_overlay(&secs[0]).unwrap()
    }

    #[test]
    fn hooks_collected_across_variants() {
        let ov = parse_one(
            "[OVERLAY name=Spline]\n\
             function draw(ctx) { var a = 1 }\n\
             yRange(hi, lo) => { var r = hi - lo }\n\
             legend() => null\n",
        );
        assert_eq!(ov.name, "Spline");
        assert!(ov.hook("draw").is_some());
        assert!(ov.hook("yRange").is_some());
        assert!(ov.hook("legend").is_some());
    }

    #[test]
    fn null_legend_sets_flag() {
        let ov = parse_one("[OVERLAY name=X]\nlegend() => null\n");
        assert!(ov.flags.no_legend);
        let ov = parse_one("[OVERLAY name=X]\nlegend(v) => v\n");
        assert!(!ov.flags.no_legend);
    }

    #[test]
    fn y_range_arity_sets_precalc_flag() {
        let ov = parse_one("[OVERLAY name=X]\nyRange(hi, lo) => [hi, lo]\n");
        assert!(ov.flags.y_range_pre_calc);
        let ov = parse_one("[OVERLAY name=X]\nyRange(data) => null\n");
        assert!(!ov.flags.y_range_pre_calc);
    }

    #[test]
    fn static_table_evaluated_once() {
        let ov = parse_one(
            "[OVERLAY name=X]\n\
             static var K = 2 * 3\n\
             static var L = K + 1\n\
             draw(ctx) { var a = K }\n",
        );
        assert_eq!(ov.statics.len(), 2);
        assert_eq!(ov.statics[0], ("K".to_string(), Value::Num(6.0)));
        assert_eq!(ov.statics[1], ("L".to_string(), Value::Num(7.0)));
    }

    #[test]
    fn non_constant_static_is_fatal() {
        let src = "[OVERLAY name=X]\nstatic var K = sma(close, 14)\n";
        let secs = sections(src);
        assert!(parse_overlay(&secs[0]).is_err());
    }

    #[test]
    fn prefab_defaults_are_noop() {
        let ov = parse_one("[OVERLAY name=X]\ndraw(ctx) { var a = 1 }\n");
        let prefab = ov.prefab();
        assert!(prefab.legend.is_none());
        assert!(prefab.y_range.is_none());
        assert!(prefab.value_tracker.is_none());
    }

    #[test]
    fn setup_statements_and_props_kept() {
        let ov = parse_one(
            "[OVERLAY name=X]\n\
             prop('color', { def: '#ff0000' })\n\
             var pi = 3\n\
             draw(ctx) { var a = 1 }\n",
        );
        assert_eq!(ov.setup.stmts.len(), 2);
        assert_eq!(ov.props.len(), 1);
        assert_eq!(ov.props[0].name, "color");
    }

    #[test]
    fn nested_bodies_with_strings_parse() {
        let ov = parse_one(
            "[OVERLAY name=X]\n\
             draw(ctx) {\n\
                 if (ctx > 0) { var s = '}{' } else { var s = '((' }\n\
             }\n",
        );
        assert!(ov.hook("draw").is_some());
    }
}
