use anyhow::{ensure, Result};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::earley::{
    utf8::{normalize_ranges, utf8_sequences},
    ByteSet, Grammar, SymIdx,
};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct NodeRef {
    idx: SymIdx,
}

impl NodeRef {
    pub fn sym_idx(&self) -> SymIdx {
        self.idx
    }
}

/// Combinators building a byte-level [`Grammar`]. Literal strings become
/// sequences of single-byte terminals, character classes become
/// alternatives of UTF-8 byte-range sequences.
pub struct GrammarBuilder {
    grammar: Grammar,
    strings: FxHashMap<Vec<u8>, NodeRef>,
    char_classes: FxHashMap<Vec<(u32, u32)>, NodeRef>,
    // symbols with a single sequence rule; join() splices them
    sequences: FxHashSet<SymIdx>,
    placeholders: FxHashSet<SymIdx>,
    empty: Option<NodeRef>,
    max_size: usize,
}

impl GrammarBuilder {
    pub fn new(max_size: usize) -> Self {
        Self {
            grammar: Grammar::new(),
            strings: FxHashMap::default(),
            char_classes: FxHashMap::default(),
            sequences: FxHashSet::default(),
            placeholders: FxHashSet::default(),
            empty: None,
            max_size,
        }
    }

    fn node(&self, idx: SymIdx) -> NodeRef {
        NodeRef { idx }
    }

    fn fresh(&mut self, name: &str, rules: Vec<Vec<SymIdx>>) -> NodeRef {
        let idx = self.grammar.fresh_symbol(name);
        for r in rules {
            self.grammar.push_rule(idx, r);
        }
        self.node(idx)
    }

    pub fn empty(&mut self) -> NodeRef {
        if let Some(e) = self.empty {
            return e;
        }
        let e = self.fresh("empty", vec![vec![]]);
        self.empty = Some(e);
        e
    }

    /// Matches nothing at all; alternatives using it are pruned during
    /// compilation.
    pub fn nothing(&mut self) -> NodeRef {
        let idx = self.grammar.fresh_nothing();
        self.node(idx)
    }

    pub fn byte_set(&mut self, bytes: ByteSet) -> NodeRef {
        let t = self.grammar.terminal(bytes);
        self.node(t)
    }

    pub fn string(&mut self, s: &str) -> NodeRef {
        self.bytes(s.as_bytes())
    }

    pub fn bytes(&mut self, s: &[u8]) -> NodeRef {
        if let Some(r) = self.strings.get(s) {
            return *r;
        }
        let r = match s.len() {
            0 => self.empty(),
            1 => self.byte_set(ByteSet::from_byte(s[0])),
            _ => {
                let rhs = s
                    .iter()
                    .map(|b| self.grammar.terminal(ByteSet::from_byte(*b)))
                    .collect();
                let name = format!("lit_{}", String::from_utf8_lossy(s));
                let r = self.fresh(&name, vec![rhs]);
                self.sequences.insert(r.idx);
                r
            }
        };
        self.strings.insert(s.to_vec(), r);
        r
    }

    /// Any single character whose code point lies in one of the inclusive
    /// `ranges`.
    pub fn char_ranges(&mut self, ranges: &[(u32, u32)]) -> NodeRef {
        let ranges = normalize_ranges(ranges);
        if let Some(r) = self.char_classes.get(&ranges) {
            return *r;
        }
        let mut ascii = ByteSet::EMPTY;
        let mut options = vec![];
        for &(lo, hi) in &ranges {
            for seq in utf8_sequences(lo, hi) {
                if seq.len() == 1 {
                    ascii.add_range(seq[0].0, seq[0].1);
                } else {
                    let rhs = seq
                        .iter()
                        .map(|&(a, b)| self.grammar.terminal(ByteSet::from_range(a, b)))
                        .collect();
                    let s = self.fresh("utf8", vec![rhs]);
                    self.sequences.insert(s.idx);
                    options.push(s);
                }
            }
        }
        if !ascii.is_empty() {
            let t = self.byte_set(ascii);
            options.insert(0, t);
        }
        let r = if options.is_empty() {
            self.nothing()
        } else {
            self.select(&options)
        };
        self.char_classes.insert(ranges, r);
        r
    }

    pub fn any_char(&mut self) -> NodeRef {
        self.char_ranges(&[(0, crate::earley::utf8::MAX_CODEPOINT)])
    }

    pub fn select(&mut self, options: &[NodeRef]) -> NodeRef {
        match options.len() {
            0 => return self.nothing(),
            1 => return options[0],
            _ => {}
        }
        let empty = self.empty;
        let rules = options
            .iter()
            .map(|o| {
                if Some(*o) == empty {
                    vec![]
                } else {
                    vec![o.idx]
                }
            })
            .collect();
        self.fresh("select", rules)
    }

    pub fn join(&mut self, values: &[NodeRef]) -> NodeRef {
        let values: Vec<NodeRef> = values
            .iter()
            .copied()
            .filter(|v| Some(*v) != self.empty)
            .collect();
        match values.len() {
            0 => self.empty(),
            1 => values[0],
            _ => {
                let mut rhs = vec![];
                for v in &values {
                    if self.sequences.contains(&v.idx) {
                        rhs.extend_from_slice(&self.grammar.rules_of(v.idx)[0]);
                    } else {
                        rhs.push(v.idx);
                    }
                }
                let r = self.fresh("seq", vec![rhs]);
                self.sequences.insert(r.idx);
                r
            }
        }
    }

    pub fn optional(&mut self, value: NodeRef) -> NodeRef {
        let empty = self.empty();
        self.select(&[empty, value])
    }

    // left recursion keeps Earley rows small

    pub fn zero_or_more(&mut self, elt: NodeRef) -> NodeRef {
        let idx = self.grammar.fresh_symbol("star");
        self.grammar.push_rule(idx, vec![]);
        self.grammar.push_rule(idx, vec![idx, elt.idx]);
        self.node(idx)
    }

    pub fn one_or_more(&mut self, elt: NodeRef) -> NodeRef {
        let idx = self.grammar.fresh_symbol("plus");
        self.grammar.push_rule(idx, vec![elt.idx]);
        self.grammar.push_rule(idx, vec![idx, elt.idx]);
        self.node(idx)
    }

    /// Between `min` and `max` (unbounded if `None`) repetitions of `elt`.
    pub fn repeat(&mut self, elt: NodeRef, min: usize, max: Option<usize>) -> Result<NodeRef> {
        if let Some(max) = max {
            ensure!(min <= max, "invalid repetition range {}..={}", min, max);
        }
        let upto = max.unwrap_or(min);
        ensure!(
            upto <= self.max_size,
            "repetition count {} exceeds grammar size limit",
            upto
        );

        // exactly[j] matches j repetitions
        let mut exactly = vec![self.empty(), elt];
        for j in 2..=upto {
            let prev = exactly[j - 1];
            let r = self.fresh("rep", vec![vec![prev.idx, elt.idx]]);
            exactly.push(r);
        }
        exactly.truncate(upto + 1);

        let r = match max {
            None if min == 0 => self.zero_or_more(elt),
            None if min == 1 => self.one_or_more(elt),
            None => {
                let tail = self.zero_or_more(elt);
                self.join(&[exactly[min], tail])
            }
            Some(_) => {
                let opts = exactly[min..].to_vec();
                self.select(&opts)
            }
        };
        self.check_size()?;
        Ok(r)
    }

    pub fn placeholder(&mut self) -> NodeRef {
        let r = self.fresh("placeholder", vec![]);
        self.placeholders.insert(r.idx);
        r
    }

    pub fn is_placeholder(&self, node: NodeRef) -> bool {
        self.placeholders.contains(&node.idx)
    }

    pub fn set_placeholder(&mut self, placeholder: NodeRef, node: NodeRef) -> Result<()> {
        ensure!(
            self.placeholders.remove(&placeholder.idx),
            "placeholder already set"
        );
        self.grammar.push_rule(placeholder.idx, vec![node.idx]);
        Ok(())
    }

    /// Fresh non-terminal to be defined with `add_rule()`.
    pub fn fresh_node(&mut self, name: &str) -> NodeRef {
        self.fresh(name, vec![])
    }

    pub fn add_rule(&mut self, lhs: NodeRef, rhs: &[NodeRef]) -> Result<()> {
        ensure!(
            !self.sequences.contains(&lhs.idx),
            "cannot extend sequence {}",
            self.grammar.sym_name(lhs.idx)
        );
        self.grammar
            .add_rule(lhs.idx, rhs.iter().map(|n| n.idx).collect())
    }

    pub fn set_start_node(&mut self, node: NodeRef) {
        self.grammar.set_start(node.idx);
    }

    pub fn size(&self) -> usize {
        self.grammar.size()
    }

    pub fn check_size(&self) -> Result<()> {
        ensure!(
            self.grammar.size() <= self.max_size,
            "grammar too large: {} elements, limit {}",
            self.grammar.size(),
            self.max_size
        );
        Ok(())
    }

    pub fn finalize(self) -> Result<Grammar> {
        ensure!(self.placeholders.is_empty(), "Unresolved placeholder");
        ensure!(self.grammar.start().is_some(), "grammar has no start node");
        self.check_size()?;
        Ok(self.grammar)
    }
}
