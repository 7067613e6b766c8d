//! `[INDICATOR]` sections: three lifecycle bodies plus a property schema.

use std::collections::HashMap;

use crate::dsl::ast::Block;
use crate::dsl::source::{split_lifecycle, RawSection, SplitBody};
use crate::dsl::{collect_props, parser, PropSpec};
use crate::error::ParseError;

/// A parsed indicator section. Immutable once created; per-instance
/// settings live on the script instance, not here.
#[derive(Debug, Clone)]
pub struct IndicatorDescriptor {
    pub type_name: String,
    pub tag_props: HashMap<String, String>,
    /// Raw body text, kept for diagnostics.
    pub src: SplitBody,
    pub init: Block,
    pub update: Block,
    pub post: Block,
    pub props: Vec<PropSpec>,
}

pub fn parse_indicator(
    section: &RawSection,
    fallback_name: &str,
) -> Result<IndicatorDescriptor, ParseError> {
    let src = split_lifecycle(&section.body);

    let offset = |body: &str| -> usize {
        // locate the body in the section for error positions
        section.body.find(body).unwrap_or(0) + section.body_offset
    };
    let parse_stage = |text: &str| -> Result<Block, ParseError> {
        parser::parse_body(text).map_err(|e| ParseError {
            message: e.message,
            position: e.position + offset(text),
        })
    };

    let init = parse_stage(&src.init)?;
    let update = parse_stage(&src.update)?;
    let post = parse_stage(&src.post)?;
    let props = collect_props(&init);

    let type_name = section
        .props
        .get("name")
        .cloned()
        .unwrap_or_else(|| fallback_name.to_string());

    Ok(IndicatorDescriptor {
        type_name,
        tag_props: section.props.clone(),
        src,
        init,
        update,
        post,
        props,
    })
}
