use grammask::{ErrorKind, GrammarMatcher};
use sample_parser::*;
use serde_json::json;

fn add_tag() -> serde_json::Value {
    json!({
        "type": "structural_tag",
        "structures": [
            {"begin": "<fn=add>", "schema": {"type": "integer"}, "end": "</fn>"},
            {
                "begin": "<fn=greet>",
                "schema": {"type": "object", "properties": {"name": {"type": "string"}}, "required": ["name"]},
                "end": "</fn>"
            }
        ],
        "triggers": ["<fn="]
    })
}

#[test]
fn test_free_text_and_segments() {
    check_structural_tag(
        &add_tag(),
        &[
            "",
            "hello world",
            "hello world <fn=add>12</fn>",
            "<fn=add>-3</fn> and <fn=greet>{\"name\": \"abc\"}</fn> done",
            "a < b <fn <fn=add>0</fn>",
            "</fn> is just text",
        ],
        &[
            "<fn=add>abc</fn>",
            "<fn=add>12",
            "<fn=sub>1</fn>",
            "<fn=greet>{}</fn>",
            "text <fn=",
        ],
    );
}

#[test]
fn test_segment_is_forced_after_trigger() {
    let g = compiler()
        .compile_structural_tag(
            &json!({
                "type": "structural_tag",
                "structures": [{"begin": "<tool>", "schema": {"const": "abc"}, "end": "</tool>"}],
                "triggers": ["<tool"]
            })
            .to_string(),
        )
        .unwrap();
    let mut m = GrammarMatcher::new(&g).unwrap();
    for t in tokenize("hello <tool") {
        m.accept_token(t).unwrap();
    }
    assert_eq!(m.compute_forced_bytes(), b">\"abc\"</tool>".to_vec());
    let mask = m.compute_mask().unwrap();
    assert!(!mask.is_allowed(eos_token()));
    assert_eq!(mask.num_set(), 1);
    check_exact_mask(&mut m);
}

#[test]
fn test_invalid_structural_tags() {
    let c = compiler();
    for tag in [
        json!({"type": "structural_tag", "structures": [{"begin": "<x>", "schema": {}, "end": "</x>"}], "triggers": []}),
        json!({"type": "structural_tag", "structures": [{"begin": "<x>", "schema": {"type": "banana"}, "end": "</x>"}], "triggers": ["<x"]}),
        json!({"type": "structural_tag", "structures": [], "triggers": ["<x", "<x>"]}),
        json!({"type": "regex", "structures": [], "triggers": []}),
        json!({"type": "structural_tag", "structures": [{"begin": "<x>", "end": "</x>"}], "triggers": ["<x"]}),
    ] {
        let e = c.compile_structural_tag(&tag.to_string()).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::StructuralTagCompile, "{}", tag);
    }
}
