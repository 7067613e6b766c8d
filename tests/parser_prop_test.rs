//! Property tests for the DSL front end.

use proptest::prelude::*;

use barscript::dsl::{self, lexer, parser};

proptest! {
    // N OVERLAY + M INDICATOR sections parse into exactly N + M
    // descriptors, in source order.
    #[test]
    fn section_counts_survive_parsing(n_ov in 0usize..4, n_ind in 0usize..4) {
        let mut src = String::from("// BarScript~0.2-lite\n");
        for i in 0..n_ov {
            src.push_str(&format!("[OVERLAY name=Ov{}]\nlegend() => null\n", i));
        }
        for i in 0..n_ind {
            src.push_str(&format!(
                "[INDICATOR name=Ind{}]\nvar x = {}\n[UPDATE]\nchart(close[0])\n",
                i, i
            ));
        }
        let parsed = dsl::parse_script(&src, "prop").unwrap();
        prop_assert_eq!(parsed.overlays.len(), n_ov);
        prop_assert_eq!(parsed.indicators.len(), n_ind);
        for (i, ov) in parsed.overlays.iter().enumerate() {
            prop_assert_eq!(ov.name.clone(), format!("Ov{}", i));
        }
        for (i, ind) in parsed.indicators.iter().enumerate() {
            prop_assert_eq!(ind.type_name.clone(), format!("Ind{}", i));
        }
    }

    // arbitrary printable input never panics the lexer or parser; it
    // either tokenizes/parses or reports a positioned error
    #[test]
    fn lexer_total_on_printable_input(src in "[ -~\\n]{0,120}") {
        match lexer::tokenize(&src) {
            Ok(_) => {}
            Err(e) => prop_assert!(e.position <= src.len()),
        }
    }

    #[test]
    fn body_parser_total_on_printable_input(src in "[ -~\\n]{0,120}") {
        match parser::parse_body(&src) {
            Ok(_) => {}
            Err(e) => prop_assert!(e.position <= src.len()),
        }
    }

    #[test]
    fn script_parser_total(src in "[ -~\\n]{0,200}") {
        let _ = dsl::parse_script(&src, "fuzz");
    }

    // numeric expressions round-trip through the const evaluator
    #[test]
    fn const_eval_matches_rust_arithmetic(a in -100i32..100, b in 1i32..100) {
        let expr = parser::parse_expr(&format!("{} + {} * 2", a, b)).unwrap();
        let val = dsl::const_eval(&expr, &Default::default()).unwrap();
        prop_assert_eq!(val, barscript::value::Value::Num((a + b * 2) as f64));
    }
}
