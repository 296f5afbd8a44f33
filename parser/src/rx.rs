//! Regular expressions (JSON Schema `pattern`s and the regexes generated for
//! formats and numeric bounds) lowered into grammar nodes. Patterns are
//! matched in full; `^` and `$` are only accepted at the edges.

use anyhow::{anyhow, bail, ensure, Result};
use regex_syntax::{
    ast::{
        self, Ast, ClassAscii, ClassAsciiKind, ClassBracketed, ClassPerl, ClassPerlKind,
        ClassSet, ClassSetItem,
    },
    hir::{self, Class, Hir, HirKind, Look},
};

use crate::{
    earley::utf8::{normalize_ranges, subtract_ranges},
    GrammarBuilder, NodeRef,
};

const MAX_REPEAT: u32 = 10_000;

// \d and \w are ASCII-only in JSON Schema regexes
fn ascii_class(perl: &ClassPerl) -> Option<ClassAscii> {
    let kind = match perl.kind {
        ClassPerlKind::Digit => ClassAsciiKind::Digit,
        ClassPerlKind::Word => ClassAsciiKind::Word,
        ClassPerlKind::Space => return None,
    };
    Some(ClassAscii {
        span: perl.span,
        kind,
        negated: perl.negated,
    })
}

fn ascii_class_set(set: &mut ClassSet) {
    match set {
        ClassSet::Item(item) => ascii_class_item(item),
        ClassSet::BinaryOp(op) => {
            ascii_class_set(&mut op.lhs);
            ascii_class_set(&mut op.rhs);
        }
    }
}

fn ascii_class_item(item: &mut ClassSetItem) {
    let replacement = match item {
        ClassSetItem::Perl(perl) => ascii_class(perl).map(ClassSetItem::Ascii),
        ClassSetItem::Bracketed(cls) => {
            ascii_class_set(&mut cls.kind);
            None
        }
        ClassSetItem::Union(union) => {
            union.items.iter_mut().for_each(ascii_class_item);
            None
        }
        _ => None,
    };
    if let Some(r) = replacement {
        *item = r;
    }
}

fn ascii_perl_classes(ast: &mut Ast) {
    let replacement = match ast {
        Ast::ClassPerl(perl) => ascii_class(perl).map(|cls| {
            Ast::ClassBracketed(Box::new(ClassBracketed {
                span: perl.span,
                negated: false,
                kind: ClassSet::Item(ClassSetItem::Ascii(cls)),
            }))
        }),
        Ast::ClassBracketed(cls) => {
            ascii_class_set(&mut cls.kind);
            None
        }
        Ast::Repetition(rep) => {
            ascii_perl_classes(&mut rep.ast);
            None
        }
        Ast::Group(group) => {
            ascii_perl_classes(&mut group.ast);
            None
        }
        Ast::Alternation(alt) => {
            alt.asts.iter_mut().for_each(ascii_perl_classes);
            None
        }
        Ast::Concat(cat) => {
            cat.asts.iter_mut().for_each(ascii_perl_classes);
            None
        }
        _ => None,
    };
    if let Some(r) = replacement {
        *ast = r;
    }
}

/// Parse `rx` into HIR. Lookaround and backreferences are rejected here;
/// misplaced anchors only when lowering.
pub fn parse_regex(rx: &str) -> Result<Hir> {
    let mut ast = ast::parse::ParserBuilder::new()
        .build()
        .parse(rx)
        .map_err(|e| anyhow!("invalid regex {:?}: {}", rx, e))?;
    ascii_perl_classes(&mut ast);
    hir::translate::TranslatorBuilder::new()
        .build()
        .translate(rx, &ast)
        .map_err(|e| anyhow!("invalid regex {:?}: {}", rx, e))
}

/// Escaped form of `c` inside a JSON string, as `serde_json` writes it.
fn json_escaped(c: char) -> String {
    let s = serde_json::to_string(&c.to_string()).unwrap_or_default();
    s[1..s.len() - 1].to_string()
}

const JSON_SPECIAL: [(u32, u32); 3] = [(0, 0x1F), (0x22, 0x22), (0x5C, 0x5C)];

struct Lowering<'a> {
    builder: &'a mut GrammarBuilder,
    json_quoted: bool,
}

impl Lowering<'_> {
    fn class(&mut self, ranges: &[(u32, u32)]) -> NodeRef {
        if !self.json_quoted {
            return self.builder.char_ranges(ranges);
        }
        let safe = subtract_ranges(ranges, &JSON_SPECIAL);
        let mut options = vec![];
        if !safe.is_empty() {
            options.push(self.builder.char_ranges(&safe));
        }
        for &(lo, hi) in &normalize_ranges(ranges) {
            for &(a, b) in &JSON_SPECIAL {
                let (s, e) = (std::cmp::max(lo, a), std::cmp::min(hi, b));
                for cp in s..=e {
                    if let Some(c) = char::from_u32(cp) {
                        let esc = json_escaped(c);
                        options.push(self.builder.string(&esc));
                    }
                }
            }
        }
        self.builder.select(&options)
    }

    fn literal(&mut self, bytes: &[u8]) -> Result<NodeRef> {
        let s = std::str::from_utf8(bytes)
            .map_err(|_| anyhow!("regex literal is not valid UTF-8"))?;
        if !self.json_quoted {
            return Ok(self.builder.string(s));
        }
        let escaped: String = s.chars().map(json_escaped).collect();
        Ok(self.builder.string(&escaped))
    }

    // `at_start`/`at_end`: nothing can be matched before/after this node
    fn lower(&mut self, hir: &Hir, at_start: bool, at_end: bool) -> Result<NodeRef> {
        Ok(match hir.kind() {
            HirKind::Empty => self.builder.empty(),
            HirKind::Literal(hir::Literal(bytes)) => self.literal(bytes)?,
            HirKind::Class(Class::Unicode(cls)) => {
                let ranges: Vec<(u32, u32)> = cls
                    .ranges()
                    .iter()
                    .map(|r| (r.start() as u32, r.end() as u32))
                    .collect();
                self.class(&ranges)
            }
            HirKind::Class(Class::Bytes(cls)) => {
                let ranges: Vec<(u32, u32)> = cls
                    .ranges()
                    .iter()
                    .map(|r| (r.start() as u32, r.end() as u32))
                    .collect();
                ensure!(
                    ranges.iter().all(|&(_, hi)| hi < 0x80),
                    "non-ASCII byte classes are not supported"
                );
                self.class(&ranges)
            }
            HirKind::Look(look) => match look {
                Look::Start if at_start => self.builder.empty(),
                Look::End if at_end => self.builder.empty(),
                Look::Start | Look::StartLF | Look::StartCRLF => {
                    bail!("'^' is only supported at the start of the regex")
                }
                Look::End | Look::EndLF | Look::EndCRLF => {
                    bail!("'$' is only supported at the end of the regex")
                }
                _ => bail!("word boundaries are not supported"),
            },
            HirKind::Repetition(rep) => {
                ensure!(
                    std::cmp::max(rep.min, rep.max.unwrap_or(0)) <= MAX_REPEAT,
                    "repetition count too large"
                );
                let n = self.lower(&rep.sub, false, false)?;
                // lazy quantifiers match the same language
                self.builder
                    .repeat(n, rep.min as usize, rep.max.map(|m| m as usize))?
            }
            HirKind::Capture(cap) => self.lower(&cap.sub, at_start, at_end)?,
            HirKind::Concat(items) => {
                let last = items.len().saturating_sub(1);
                let nodes = items
                    .iter()
                    .enumerate()
                    .map(|(i, h)| self.lower(h, at_start && i == 0, at_end && i == last))
                    .collect::<Result<Vec<_>>>()?;
                self.builder.join(&nodes)
            }
            HirKind::Alternation(items) => {
                let nodes = items
                    .iter()
                    .map(|h| self.lower(h, at_start, at_end))
                    .collect::<Result<Vec<_>>>()?;
                self.builder.select(&nodes)
            }
        })
    }
}

/// Node matching exactly the strings `rx` matches. With `json_quoted`,
/// the node matches the JSON string body (without quotes) encoding such
/// a string.
pub fn regex_to_node(builder: &mut GrammarBuilder, rx: &str, json_quoted: bool) -> Result<NodeRef> {
    let hir = parse_regex(rx)?;
    Lowering {
        builder,
        json_quoted,
    }
    .lower(&hir, true, true)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{api::MatcherLimits, earley::Parser};
    use std::sync::Arc;

    fn check(rx: &str, json_quoted: bool, good: &[&str], bad: &[&str]) {
        let mut b = GrammarBuilder::new(100_000);
        let n = regex_to_node(&mut b, rx, json_quoted).unwrap();
        b.set_start_node(n);
        let g = b.finalize().unwrap().compile().unwrap();
        let mut p = Parser::new(Arc::new(g), MatcherLimits::default()).unwrap();
        for s in good {
            p.reset();
            assert!(
                p.apply_bytes(s.as_bytes()).is_ok() && p.is_accepting(),
                "{rx} should match {s:?}"
            );
        }
        for s in bad {
            p.reset();
            assert!(
                !(p.apply_bytes(s.as_bytes()).is_ok() && p.is_accepting()),
                "{rx} should not match {s:?}"
            );
        }
    }

    fn lowering_error(rx: &str) -> String {
        let mut b = GrammarBuilder::new(100_000);
        match regex_to_node(&mut b, rx, false) {
            Ok(_) => panic!("{rx} should fail"),
            Err(e) => e.to_string(),
        }
    }

    #[test]
    fn basic_syntax() {
        check(
            "^[a-z]+(-[a-z0-9]+)*$",
            false,
            &["abc", "a-b1-c"],
            &["", "-a", "a-", "A"],
        );
        check("a{2,3}|b?c", false, &["aa", "aaa", "c", "bc"], &["a", "aaaa", "b"]);
        check(r"\d{3}-\d{4}", false, &["555-1234"], &["5555-123"]);
        check(r"(?:x|y)\.z", false, &["x.z", "y.z"], &["xaz"]);
        check(r"[^\s]+", false, &["ab", "é"], &["a b", ""]);
        check(r"é\x41", false, &["éA"], &["eA"]);
        check("[-a]", false, &["-", "a"], &["b"]);
        check(".", false, &["x", "中"], &["\n", "xy"]);
        check("^ab$|^c$", false, &["ab", "c"], &["abc", ""]);
        check(r"(?P<year>\d{2})\/x", false, &["24/x"], &["24x"]);
        check(r"\p{Lu}+", false, &["ÀB"], &["àb"]);
    }

    #[test]
    fn ascii_perl_classes_only() {
        check(r"\d+", false, &["0123"], &["٣", "x"]);
        check(r"[\w.]+", false, &["a_b.9"], &["é"]);
        check(r"\D", false, &["x", "٣"], &["5"]);
        check(r"[^\d]", false, &["x"], &["5"]);
        check(r"\s", false, &[" ", "\u{3000}"], &["x"]);
    }

    #[test]
    fn json_quoted_classes() {
        check(
            r#"[a"\\]+"#,
            true,
            &[r#"a\"\\"#],
            &[r#"a""#, r"\"],
        );
        check(r"\n.", true, &[r"\nx", r"\n\t"], &["\nx"]);
        check(r#"a"b"#, true, &[r#"a\"b"#], &[r#"a"b"#]);
    }

    #[test]
    fn unsupported() {
        for rx in [r"(?=a)", r"(?<!a)b", r"(a)\1", "*a", "(a", "a{5,2}"] {
            assert!(parse_regex(rx).is_err(), "{rx} should fail");
        }
        assert!(lowering_error(r"\bword").contains("word boundaries"));
        assert!(lowering_error("a^").contains("'^'"));
        assert!(lowering_error("$a").contains("'$'"));
        assert!(lowering_error("a{20000}").contains("too large"));
    }
}
