//! Free text interleaved with tagged JSON segments.
//!
//! Free text is tracked with an Aho-Corasick automaton over the triggers:
//! `text[q]` derives the strings that leave the automaton in state `q`.
//! Text grows left-recursively one byte at a time; a byte that completes a
//! trigger continues with the rest of a matching `begin`, the JSON value
//! and the `end`, after which the automaton restarts.

use aho_corasick::{automaton::Automaton, dfa::DFA, Anchored, MatchKind};
use anyhow::{anyhow, bail, ensure, Context, Result};
use rustc_hash::FxHashMap;
use std::collections::VecDeque;

use crate::{
    api::{StructuralTag, StructuralTagItem},
    earley::{ByteSet, Grammar},
    json::{json_schema_node, JsonCompileOptions},
    GrammarBuilder, NodeRef,
};

pub fn parse_structural_tag(s: &str) -> Result<StructuralTag> {
    let tag: StructuralTag =
        serde_json::from_str(s).map_err(|e| anyhow!("invalid structural tag JSON: {}", e))?;
    ensure!(
        tag.tag_type == StructuralTag::TYPE,
        "expected \"type\": {:?}, got {:?}",
        StructuralTag::TYPE,
        tag.tag_type
    );
    Ok(tag)
}

/// For every trigger, the indices of the structures it introduces.
fn structures_by_trigger(tag: &StructuralTag) -> Result<Vec<Vec<usize>>> {
    ensure!(
        tag.structures.is_empty() || !tag.triggers.is_empty(),
        "structures given without any triggers"
    );
    for (i, t) in tag.triggers.iter().enumerate() {
        ensure!(!t.is_empty(), "trigger {} is empty", i);
        for (j, other) in tag.triggers.iter().enumerate() {
            if i != j && other.contains(t.as_str()) {
                bail!("triggers {:?} and {:?} overlap", t, other);
            }
        }
    }

    let mut by_trigger = vec![vec![]; tag.triggers.len()];
    for (i, s) in tag.structures.iter().enumerate() {
        ensure!(!s.begin.is_empty(), "structure {}: empty begin", i);
        ensure!(!s.end.is_empty(), "structure {}: empty end", i);
        let matching: Vec<usize> = tag
            .triggers
            .iter()
            .enumerate()
            .filter(|(_, t)| s.begin.starts_with(t.as_str()))
            .map(|(idx, _)| idx)
            .collect();
        match matching.as_slice() {
            [t] => by_trigger[*t].push(i),
            [] => bail!(
                "structure {}: begin {:?} does not start with any trigger",
                i,
                s.begin
            ),
            _ => bail!(
                "structure {}: begin {:?} starts with several triggers",
                i,
                s.begin
            ),
        }
    }

    for (t, structures) in by_trigger.iter().enumerate() {
        ensure!(
            !structures.is_empty(),
            "trigger {:?} does not start any structure",
            tag.triggers[t]
        );
    }
    Ok(by_trigger)
}

fn segment(
    builder: &mut GrammarBuilder,
    item: &StructuralTagItem,
    trigger_len: usize,
    warnings: &mut Vec<String>,
) -> Result<NodeRef> {
    let rest = builder.string(&item.begin[trigger_len..]);
    let (value, w) = json_schema_node(builder, &item.schema, &JsonCompileOptions::default())?;
    warnings.extend(w);
    let end = builder.string(&item.end);
    Ok(builder.join(&[rest, value, end]))
}

/// Builds the grammar node for `tag`. Returns the node and warnings from
/// the segment schemas.
pub fn structural_tag_node(
    builder: &mut GrammarBuilder,
    tag: &StructuralTag,
) -> Result<(NodeRef, Vec<String>)> {
    let by_trigger = structures_by_trigger(tag)?;
    let mut warnings = vec![];

    let mut segments = vec![];
    for (t, structures) in by_trigger.iter().enumerate() {
        let trigger_len = tag.triggers[t].len();
        let options = structures
            .iter()
            .map(|&i| {
                segment(builder, &tag.structures[i], trigger_len, &mut warnings)
                    .with_context(|| format!("structure {}", i))
            })
            .collect::<Result<Vec<_>>>()?;
        segments.push(builder.select(&options));
    }

    let dfa = DFA::builder()
        .match_kind(MatchKind::Standard)
        .build(&tag.triggers)
        .map_err(|e| anyhow!("cannot build trigger automaton: {}", e))?;
    let start = dfa
        .start_state(Anchored::No)
        .map_err(|e| anyhow!("cannot build trigger automaton: {}", e))?;

    // number the automaton states reachable without completing a trigger
    let mut state_idx = FxHashMap::default();
    let mut states = vec![start];
    state_idx.insert(start, 0usize);
    let mut text = vec![builder.fresh_node("text")];
    builder.add_rule(text[0], &[])?;

    let mut queue = VecDeque::from([start]);
    let mut edges = vec![];
    while let Some(sid) = queue.pop_front() {
        let from = state_idx[&sid];
        let mut by_target: FxHashMap<usize, ByteSet> = FxHashMap::default();
        let mut trigger_bytes: FxHashMap<usize, ByteSet> = FxHashMap::default();
        for b in 0..=255u8 {
            let next = dfa.next_state(Anchored::No, sid, b);
            if dfa.is_match(next) {
                let t = dfa.match_pattern(next, 0).as_usize();
                trigger_bytes.entry(t).or_insert(ByteSet::EMPTY).add(b);
                continue;
            }
            let to = match state_idx.get(&next) {
                Some(idx) => *idx,
                None => {
                    let idx = states.len();
                    states.push(next);
                    state_idx.insert(next, idx);
                    text.push(builder.fresh_node("text"));
                    queue.push_back(next);
                    idx
                }
            };
            by_target.entry(to).or_insert(ByteSet::EMPTY).add(b);
        }
        edges.push((from, by_target, trigger_bytes));
    }

    for (from, by_target, trigger_bytes) in edges {
        for (to, bytes) in by_target {
            let b = builder.byte_set(bytes);
            builder.add_rule(text[to], &[text[from], b])?;
        }
        for (t, bytes) in trigger_bytes {
            let b = builder.byte_set(bytes);
            builder.add_rule(text[0], &[text[from], b, segments[t]])?;
        }
    }
    builder.check_size()?;

    Ok((builder.select(&text), warnings))
}

pub fn structural_tag_to_grammar(
    tag: &StructuralTag,
    max_size: usize,
) -> Result<(Grammar, Vec<String>)> {
    let mut builder = GrammarBuilder::new(max_size);
    let (root, warnings) = structural_tag_node(&mut builder, tag)?;
    builder.set_start_node(root);
    Ok((builder.finalize()?, warnings))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{api::MatcherLimits, earley::Parser};
    use serde_json::json;
    use std::sync::Arc;

    fn parser(tag: &StructuralTag) -> Parser {
        let (g, _) = structural_tag_to_grammar(tag, 500_000).unwrap();
        Parser::new(Arc::new(g.compile().unwrap()), MatcherLimits::default()).unwrap()
    }

    fn matches(p: &mut Parser, s: &str) -> bool {
        p.reset();
        p.apply_bytes(s.as_bytes()).is_ok() && p.is_accepting()
    }

    fn weather_tag() -> StructuralTag {
        StructuralTag::new(
            vec![
                StructuralTagItem::new("<fn=add>", json!({"type": "integer"}), "</fn>"),
                StructuralTagItem::new(
                    "<fn=ping>",
                    json!({"type": "object", "properties": {"host": {"type": "string"}}, "required": ["host"]}),
                    "</fn>",
                ),
            ],
            vec!["<fn=".to_string()],
        )
    }

    #[test]
    fn text_and_segments() {
        let mut p = parser(&weather_tag());
        for s in [
            "",
            "hello <fn wo<rld",
            "sum: <fn=add>42</fn> done",
            "<fn=add>-1</fn><fn=ping>{\"host\": \"x\"}</fn>",
            "a<<fn=add>7</fn>",
        ] {
            assert!(matches(&mut p, s), "should accept {s:?}");
        }
        for s in [
            "<fn=add>x</fn>",
            "<fn=sub>1</fn>",
            "<fn=add>1",
            "<fn=add>1</fn> <fn=",
            "<fn=ping>{}</fn>",
        ] {
            assert!(!matches(&mut p, s), "should reject {s:?}");
        }
    }

    #[test]
    fn forced_after_trigger() {
        let tag = StructuralTag::new(
            vec![StructuralTagItem::new("<tool>", json!({"type": "null"}), "</tool>")],
            vec!["<to".to_string()],
        );
        let mut p = parser(&tag);
        p.apply_bytes(b"x <to").unwrap();
        assert_eq!(p.compute_forced_bytes(), b"ol>null</tool>".to_vec());
    }

    #[test]
    fn parse_and_validate() {
        let tag = parse_structural_tag(
            r#"{"type": "structural_tag", "structures": [{"begin": "<a>", "schema": {}, "end": "</a>"}], "triggers": ["<a"]}"#,
        )
        .unwrap();
        assert_eq!(tag.structures.len(), 1);

        assert!(parse_structural_tag(r#"{"type": "regex"}"#).is_err());
        assert!(parse_structural_tag("{").is_err());

        let err = |tag: StructuralTag| {
            let mut b = GrammarBuilder::new(100_000);
            format!("{:#}", structural_tag_node(&mut b, &tag).unwrap_err())
        };
        let item = |begin: &str| StructuralTagItem::new(begin, json!({}), "</x>");
        assert!(err(StructuralTag::new(vec![item("<x>")], vec![])).contains("without any triggers"));
        assert!(err(StructuralTag::new(vec![item("<x>")], vec!["<y".into()])).contains("does not start with"));
        assert!(err(StructuralTag::new(vec![item("<x>")], vec!["<x".into(), "x".into()])).contains("overlap"));
        assert!(err(StructuralTag::new(vec![item("<x>")], vec!["<x".into(), "<z".into()])).contains("does not start any"));
        assert!(err(StructuralTag::new(vec![item("")], vec!["<x".into()])).contains("empty begin"));
        let bad_schema = StructuralTagItem::new("<x>", json!({"type": "banana"}), "</x>");
        assert!(err(StructuralTag::new(vec![item("<x>"), bad_schema], vec!["<x".into()]))
            .starts_with("structure 1: "));
    }
}
