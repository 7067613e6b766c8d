//! Source-level scanning: comment stripping, the version header and the
//! section layout (`[OVERLAY ...]`, `[INDICATOR ...]`, `[UPDATE]`, `[POST]`).
//!
//! Section markers are matched on decommented text so markers inside
//! comments or string literals never split a script. Byte positions are
//! preserved (comments are blanked, not removed) so parse errors in a body
//! still point into the original source.

use std::collections::HashMap;

use crate::error::ParseError;

/// Parser version understood by this crate.
pub const VERSION: f64 = 0.2;
pub const VERSION_TAG: &str = "lite";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionKind {
    Overlay,
    Indicator,
}

/// One raw section: tag properties plus the body text, located in source.
#[derive(Debug, Clone)]
pub struct RawSection {
    pub kind: SectionKind,
    pub props: HashMap<String, String>,
    pub body: String,
    /// Byte offset of the body in the decommented source.
    pub body_offset: usize,
}

/// The three lifecycle bodies of an indicator section.
#[derive(Debug, Clone, Default)]
pub struct SplitBody {
    pub init: String,
    pub update: String,
    pub post: String,
}

/// Blank out `//` line comments and `/* */` block comments, preserving
/// byte positions and newlines. Quote-aware: comment markers inside string
/// literals survive. Unterminated quotes are a hard error.
pub fn decomment(src: &str) -> Result<String, ParseError> {
    let bytes = src.as_bytes();
    let mut out = bytes.to_vec();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            q @ (b'\'' | b'"') => {
                let start = i;
                i += 1;
                loop {
                    if i >= bytes.len() || bytes[i] == b'\n' {
                        return Err(ParseError::new(
                            format!("missing closing quote {}", q as char),
                            start,
                        ));
                    }
                    if bytes[i] == b'\\' {
                        i += 2;
                        continue;
                    }
                    if bytes[i] == q {
                        i += 1;
                        break;
                    }
                    i += 1;
                }
            }
            b'/' if i + 1 < bytes.len() && bytes[i + 1] == b'/' => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    out[i] = b' ';
                    i += 1;
                }
            }
            b'/' if i + 1 < bytes.len() && bytes[i + 1] == b'*' => {
                let start = i;
                out[i] = b' ';
                out[i + 1] = b' ';
                i += 2;
                loop {
                    if i + 1 >= bytes.len() {
                        return Err(ParseError::new("unterminated block comment", start));
                    }
                    if bytes[i] == b'*' && bytes[i + 1] == b'/' {
                        out[i] = b' ';
                        out[i + 1] = b' ';
                        i += 2;
                        break;
                    }
                    if bytes[i] != b'\n' {
                        out[i] = b' ';
                    }
                    i += 1;
                }
            }
            _ => i += 1,
        }
    }
    Ok(String::from_utf8(out).expect("blanking ASCII bytes keeps UTF-8 valid"))
}

/// Read the `~<float>-<tag>` version header from the first line comment.
/// Returns (0.0, None) when absent or malformed; never fails.
pub fn version_header(src: &str) -> (f64, Option<String>) {
    for line in src.lines() {
        let trimmed = line.trim_start();
        if !trimmed.starts_with("//") {
            continue;
        }
        let Some(tilde) = trimmed.find('~') else {
            return (0.0, None);
        };
        let rest = &trimmed[tilde + 1..];
        let rest = rest.trim_end();
        let (vers_str, tag) = match rest.split_once('-') {
            Some((v, t)) => (v, Some(t.to_string())),
            None => (rest, None),
        };
        let vers = vers_str.trim().parse::<f64>().unwrap_or(0.0);
        return (vers, tag);
    }
    (0.0, None)
}

/// Extract the script's name from the first `name=` tag property.
pub fn extract_name(src: &str) -> Option<String> {
    let open = src.find('[')?;
    let close = src[open..].find(']')? + open;
    let tag = &src[open..close];
    let name_pos = tag.find("name=")?;
    let val = &tag[name_pos + 5..];
    let end = val
        .find(&[',', ' ', '\t', '\n'][..])
        .unwrap_or(val.len());
    let name = val[..end].trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// Parse comma-separated `key=value` pairs into a map.
pub fn tag_props(src: &str) -> HashMap<String, String> {
    let mut props = HashMap::new();
    for pair in src.split(',') {
        let Some((key, val)) = pair.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        props.insert(key.to_string(), val.trim().to_string());
    }
    props
}

/// Scan decommented source for `[OVERLAY ...]` / `[INDICATOR ...]`
/// sections. Each body runs up to the next section marker or end of input
/// (the implicit EOF sentinel).
pub fn sections(src: &str) -> Vec<RawSection> {
    let mut out = Vec::new();
    let mut pos = 0;
    while let Some((kind, start)) = next_marker(src, pos) {
        let tag_open = start + marker_len(kind);
        let Some(tag_close_rel) = src[tag_open..].find(']') else {
            break;
        };
        let tag_close = tag_open + tag_close_rel;
        let body_start = tag_close + 1;
        let body_end = match next_marker(src, body_start) {
            Some((_, next)) => next,
            None => match src[body_start..].find("[EOF]") {
                Some(rel) => body_start + rel,
                None => src.len(),
            },
        };
        out.push(RawSection {
            kind,
            props: tag_props(&src[tag_open..tag_close]),
            body: src[body_start..body_end].to_string(),
            body_offset: body_start,
        });
        pos = body_end;
    }
    out
}

fn next_marker(src: &str, from: usize) -> Option<(SectionKind, usize)> {
    let ov = src[from..].find("[OVERLAY").map(|i| i + from);
    let ind = src[from..].find("[INDICATOR").map(|i| i + from);
    match (ov, ind) {
        (Some(a), Some(b)) if a < b => Some((SectionKind::Overlay, a)),
        (Some(_), Some(b)) => Some((SectionKind::Indicator, b)),
        (Some(a), None) => Some((SectionKind::Overlay, a)),
        (None, Some(b)) => Some((SectionKind::Indicator, b)),
        (None, None) => None,
    }
}

fn marker_len(kind: SectionKind) -> usize {
    match kind {
        SectionKind::Overlay => "[OVERLAY".len(),
        SectionKind::Indicator => "[INDICATOR".len(),
    }
}

/// Split an indicator body at its `[UPDATE]` / `[POST]` markers.
/// Whitespace inside the brackets is tolerated; missing markers leave the
/// corresponding body empty.
pub fn split_lifecycle(body: &str) -> SplitBody {
    let update_pos = find_stage_marker(body, "UPDATE");
    let post_pos = find_stage_marker(body, "POST");

    let init_end = [update_pos, post_pos]
        .into_iter()
        .flatten()
        .map(|(s, _)| s)
        .min()
        .unwrap_or(body.len());

    let mut split = SplitBody {
        init: body[..init_end].to_string(),
        ..Default::default()
    };
    if let Some((s, e)) = update_pos {
        let end = post_pos
            .map(|(ps, _)| ps)
            .filter(|&ps| ps > s)
            .unwrap_or(body.len());
        split.update = body[e..end].to_string();
    }
    if let Some((s, e)) = post_pos {
        let end = update_pos.map(|(us, _)| us).filter(|&us| us > s).unwrap_or(body.len());
        split.post = body[e..end].to_string();
    }
    split
}

/// Find `[<WS>NAME<WS>]`, returning (start, end-after-bracket).
fn find_stage_marker(body: &str, name: &str) -> Option<(usize, usize)> {
    let bytes = body.as_bytes();
    let mut pos = 0;
    while let Some(rel) = body[pos..].find('[') {
        let start = pos + rel;
        let mut i = start + 1;
        while i < bytes.len() && (bytes[i] as char).is_whitespace() {
            i += 1;
        }
        if body[i..].starts_with(name) {
            let mut j = i + name.len();
            while j < bytes.len() && (bytes[j] as char).is_whitespace() {
                j += 1;
            }
            if j < bytes.len() && bytes[j] == b']' {
                return Some((start, j + 1));
            }
        }
        pos = start + 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decomment_blanks_line_comment() {
        let out = decomment("a = 1 // note\nb = 2").unwrap();
        assert_eq!(out, "a = 1        \nb = 2");
    }

    #[test]
    fn decomment_keeps_markers_in_strings() {
        let out = decomment("x = 'no // comment'").unwrap();
        assert_eq!(out, "x = 'no // comment'");
    }

    #[test]
    fn decomment_block_keeps_newlines() {
        let out = decomment("a /* one\ntwo */ b").unwrap();
        assert_eq!(out.lines().count(), 2);
        assert!(out.starts_with("a "));
        assert!(out.ends_with(" b"));
    }

    #[test]
    fn decomment_unbalanced_quote_fails() {
        let err = decomment("x = 'oops").unwrap_err();
        assert!(err.message.contains("quote"));
        assert_eq!(err.position, 4);
    }

    #[test]
    fn version_parsing() {
        assert_eq!(
            version_header("// BarScript~0.2-lite\n"),
            (0.2, Some("lite".into()))
        );
        assert_eq!(version_header("// BarScript~0.1\n"), (0.1, None));
        assert_eq!(version_header("[OVERLAY name=X]"), (0.0, None));
        assert_eq!(version_header("// no marker here\n"), (0.0, None));
    }

    #[test]
    fn name_extraction() {
        assert_eq!(
            extract_name("[OVERLAY name=Spline, export=true]"),
            Some("Spline".into())
        );
        assert_eq!(extract_name("[OVERLAY export=true]"), None);
    }

    #[test]
    fn tag_props_parsing() {
        let props = tag_props("name=Test, version=1.0, zIndex=5");
        assert_eq!(props.get("name").map(String::as_str), Some("Test"));
        assert_eq!(props.get("zIndex").map(String::as_str), Some("5"));
        assert_eq!(props.len(), 3);
    }

    #[test]
    fn section_scan_orders_and_counts() {
        let src = "\
[OVERLAY name=A]
draw(ctx) => null
[INDICATOR name=B]
var x = 1
[OVERLAY name=C]
legend() => null
";
        let secs = sections(src);
        assert_eq!(secs.len(), 3);
        assert_eq!(secs[0].kind, SectionKind::Overlay);
        assert_eq!(secs[1].kind, SectionKind::Indicator);
        assert_eq!(secs[2].kind, SectionKind::Overlay);
        assert_eq!(secs[0].props.get("name").map(String::as_str), Some("A"));
        assert!(secs[1].body.contains("var x = 1"));
    }

    #[test]
    fn section_body_stops_at_eof_sentinel() {
        let src = "[OVERLAY name=A]\nvar x = 1\n[EOF]\ntrailing";
        let secs = sections(src);
        assert_eq!(secs.len(), 1);
        assert!(!secs[0].body.contains("trailing"));
    }

    #[test]
    fn lifecycle_split() {
        let body = "\ninit_code\n[UPDATE]\nupdate_code\n[POST]\npost_code\n";
        let split = split_lifecycle(body);
        assert!(split.init.contains("init_code"));
        assert!(split.update.contains("update_code"));
        assert!(!split.update.contains("post_code"));
        assert!(split.post.contains("post_code"));
    }

    #[test]
    fn lifecycle_split_tolerates_spacing_and_absence() {
        let split = split_lifecycle("a\n[ UPDATE ]\nb\n");
        assert!(split.init.contains('a'));
        assert!(split.update.contains('b'));
        assert!(split.post.is_empty());

        let split = split_lifecycle("only init");
        assert_eq!(split.init, "only init");
        assert!(split.update.is_empty());
    }
}
