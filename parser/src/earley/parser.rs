// Byte-level Earley recognizer. Terminals are byte sets, so each row of
// the chart corresponds to one input byte.
//
// Terminology follows "Parsing: Earley parsing", Laura Kallmeyer,
// Heinrich Heine Universitaet Dusseldorf, Winter 2017/2018:
// a "row" is an Earley set, an "item" is a dotted rule with its origin.

use std::{fmt::Debug, ops::Range, sync::Arc};

use anyhow::{ensure, Result};
use instant::Instant;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use toktrie::{Recognizer, SimpleVob, SpecialToken};

use crate::{api::MatcherLimits, Vocabulary};

use super::{
    byteset::{byte_to_string, ByteSet},
    grammar::{CGrammar, CSymIdx, RuleIdx},
    MaskCache,
};

const DEBUG: bool = true;

macro_rules! debug {
    ($($arg:tt)*) => {
        if cfg!(feature = "logging") && DEBUG {
            eprintln!($($arg)*);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Item {
    data: u64,
}

impl Item {
    fn new(rule: RuleIdx, start: usize) -> Self {
        Item {
            data: rule.as_index() as u64 | ((start as u64) << 32),
        }
    }

    fn rule_idx(&self) -> RuleIdx {
        RuleIdx::from_index(self.data as u32)
    }

    fn start_pos(&self) -> usize {
        (self.data >> 32) as usize
    }

    fn advance_dot(&self) -> Self {
        Item {
            data: self.data + 1,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize, Clone)]
pub struct ParserStats {
    pub rows: usize,
    pub definitive_bytes: usize,
    pub all_items: usize,
    pub limit_hits: usize,
    pub cached_masks: usize,
    pub compute_time_us: u64,
}

impl ParserStats {
    pub fn delta(&self, previous: &ParserStats) -> ParserStats {
        ParserStats {
            rows: self.rows - previous.rows,
            definitive_bytes: self.definitive_bytes - previous.definitive_bytes,
            all_items: self.all_items - previous.all_items,
            limit_hits: self.limit_hits - previous.limit_hits,
            cached_masks: self.cached_masks - previous.cached_masks,
            compute_time_us: self.compute_time_us - previous.compute_time_us,
        }
    }

    pub fn max(&self, other: &ParserStats) -> ParserStats {
        ParserStats {
            rows: self.rows.max(other.rows),
            definitive_bytes: self.definitive_bytes.max(other.definitive_bytes),
            all_items: self.all_items.max(other.all_items),
            limit_hits: self.limit_hits.max(other.limit_hits),
            cached_masks: self.cached_masks.max(other.cached_masks),
            compute_time_us: self.compute_time_us.max(other.compute_time_us),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParserError {
    /// The bytes are not a prefix of any string in the language.
    Rejected(String),
    /// A row grew past `max_items_in_row`.
    TooManyItems(usize),
}

impl ParserError {
    pub fn message(&self) -> String {
        match self {
            ParserError::Rejected(s) => s.clone(),
            ParserError::TooManyItems(n) => {
                format!("Earley row exceeded {} items; grammar too ambiguous", n)
            }
        }
    }
}

#[derive(Clone)]
struct Row {
    first_item: usize,
    last_item: usize,
    // union of the terminals right after a dot in this row
    allowed_bytes: ByteSet,
}

impl Row {
    fn item_indices(&self) -> Range<usize> {
        self.first_item..self.last_item
    }
}

// rows up to this size are deduplicated by linear search
const HASHED_ROW_LEN: usize = 32;

// The Earley table; items of all rows are stored back to back.
#[derive(Clone)]
struct Scratch {
    grammar: Arc<CGrammar>,
    row_start: usize,
    row_end: usize,
    items: Vec<Item>,
    // items of the working row, once it gets long
    row_set: FxHashSet<Item>,
    hashed: bool,
    // false while a token trie is being walked
    definitive: bool,
}

impl Scratch {
    fn new(grammar: Arc<CGrammar>) -> Self {
        Scratch {
            grammar,
            row_start: 0,
            row_end: 0,
            items: vec![],
            row_set: FxHashSet::default(),
            hashed: false,
            definitive: true,
        }
    }

    fn new_row(&mut self, pos: usize) {
        self.items.truncate(pos);
        self.row_start = pos;
        self.row_end = pos;
        self.hashed = false;
    }

    fn row_len(&self) -> usize {
        self.row_end - self.row_start
    }

    fn work_row(&self, allowed_bytes: ByteSet) -> Row {
        Row {
            first_item: self.row_start,
            last_item: self.row_end,
            allowed_bytes,
        }
    }

    #[inline(always)]
    fn just_add(&mut self, item: Item, info: &str) {
        debug_assert!(self.items.len() == self.row_end);
        self.items.push(item);
        if self.definitive {
            debug!(
                "      addu: {} ({})",
                self.item_to_string(self.row_end),
                info
            );
        }
        self.row_end += 1;
    }

    #[inline(always)]
    fn find_item(&self, item: Item) -> Option<usize> {
        self.items[self.row_start..self.row_end]
            .iter()
            .position(|&x| x == item)
            .map(|x| x + self.row_start)
    }

    #[inline(always)]
    fn add_unique(&mut self, item: Item, info: &str) {
        if !self.hashed && self.row_len() >= HASHED_ROW_LEN {
            self.row_set.clear();
            self.row_set
                .extend(self.items[self.row_start..self.row_end].iter().copied());
            self.hashed = true;
        }
        if self.hashed {
            if self.row_set.insert(item) {
                self.just_add(item, info);
            }
        } else if self.find_item(item).is_none() {
            self.just_add(item, info);
        }
    }

    fn item_to_string(&self, idx: usize) -> String {
        item_to_string(&self.grammar, &self.items[idx])
    }
}

#[derive(Clone)]
pub struct Parser {
    grammar: Arc<CGrammar>,
    scratch: Scratch,
    rows: Vec<Row>,
    // bytes consumed so far; rows.len() == bytes.len() + 1
    bytes: Vec<u8>,
    stats: ParserStats,
    limits: MatcherLimits,
    limit_hit: bool,
    trie_rows: usize,
}

impl Parser {
    pub fn new(grammar: Arc<CGrammar>, limits: MatcherLimits) -> Result<Self> {
        let start = grammar.start();
        let scratch = Scratch::new(Arc::clone(&grammar));
        let mut r = Parser {
            grammar,
            scratch,
            rows: vec![],
            bytes: vec![],
            stats: ParserStats::default(),
            limits,
            limit_hit: false,
            trie_rows: 0,
        };

        for rule in r.grammar.sym_data(start).rules.clone() {
            r.scratch.add_unique(Item::new(rule, 0), "init");
        }
        debug!("initial push");
        let ok = r.push_row(0, 0);
        ensure!(
            ok && r.rows.len() == 1,
            "initial Earley row could not be built (more than {} items)",
            r.limits.max_items_in_row
        );
        Ok(r)
    }

    pub fn grammar(&self) -> &CGrammar {
        &self.grammar
    }

    pub fn stats(&self) -> &ParserStats {
        &self.stats
    }

    pub fn num_bytes(&self) -> usize {
        self.bytes.len()
    }

    pub fn get_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Bytes the grammar allows right now.
    pub fn allowed_bytes(&self) -> ByteSet {
        self.curr_row().allowed_bytes
    }

    fn curr_row(&self) -> &Row {
        &self.rows[self.rows.len() - 1]
    }

    /// Back to the state right after construction.
    pub fn reset(&mut self) {
        self.truncate_rows(1);
        self.limit_hit = false;
    }

    fn truncate_rows(&mut self, n: usize) {
        self.rows.truncate(n);
        self.bytes.truncate(n - 1);
    }

    /// Whether the bytes consumed so far form a complete string.
    pub fn is_accepting(&self) -> bool {
        let start = self.grammar.start();
        self.curr_row().item_indices().any(|i| {
            let item = self.scratch.items[i];
            let rule = item.rule_idx();
            item.start_pos() == 0
                && self.grammar.sym_idx_dot(rule) == CSymIdx::NULL
                && self.grammar.sym_idx_lhs(rule) == start
        })
    }

    /// Consume `bytes` permanently. On failure nothing is consumed.
    pub fn apply_bytes(&mut self, bytes: &[u8]) -> Result<(), ParserError> {
        debug_assert!(self.scratch.definitive);
        let n0 = self.rows.len();
        for (idx, &b) in bytes.iter().enumerate() {
            debug!("apply byte: {}", byte_to_string(b));
            if !self.scan(b) {
                let limit_hit = std::mem::take(&mut self.limit_hit);
                self.truncate_rows(n0);
                if limit_hit {
                    return Err(ParserError::TooManyItems(self.limits.max_items_in_row));
                }
                return Err(ParserError::Rejected(format!(
                    "byte {} at offset {} is not allowed after {:?}",
                    byte_to_string(b),
                    idx,
                    String::from_utf8_lossy(&self.bytes)
                )));
            }
            self.bytes.push(b);
            self.stats.definitive_bytes += 1;
        }
        Ok(())
    }

    /// Undo the last `n` consumed bytes.
    pub fn rollback_bytes(&mut self, n: usize) -> Result<()> {
        ensure!(
            n <= self.bytes.len(),
            "cannot roll back {} bytes, only {} consumed",
            n,
            self.bytes.len()
        );
        self.truncate_rows(self.rows.len() - n);
        Ok(())
    }

    /// Number of leading bytes of `bytes` the grammar accepts; state is unchanged.
    pub fn valid_prefix_len(&mut self, bytes: &[u8]) -> usize {
        self.run_speculative(|s| {
            let mut n = 0;
            for &b in bytes {
                if !s.try_push_byte(b) {
                    break;
                }
                n += 1;
            }
            s.pop_bytes(n);
            n
        })
    }

    /// The only byte that can come next, if there is exactly one and the
    /// input can't end here.
    fn forced_byte(&self) -> Option<u8> {
        if self.is_accepting() {
            debug!("  in accept state, not forcing");
            return None;
        }
        self.curr_row().allowed_bytes.single()
    }

    /// Longest string that every continuation must start with.
    pub fn compute_forced_bytes(&mut self) -> Vec<u8> {
        let max = self.limits.max_forced_bytes;
        self.run_speculative(|s| {
            let mut res = vec![];
            while res.len() < max {
                match s.forced_byte() {
                    Some(b) if s.try_push_byte(b) => res.push(b),
                    _ => break,
                }
            }
            s.pop_bytes(res.len());
            res
        })
    }

    /// Walk the token trie and allow every token whose bytes can be
    /// consumed next. Stop tokens are not included. With a cache, states
    /// with the same frontier share one walk.
    pub fn compute_bias(&mut self, vocab: &Vocabulary, cache: Option<&MaskCache>) -> SimpleVob {
        let t0 = Instant::now();
        let key = cache.map(|_| self.frontier_key());
        if let (Some(cache), Some(key)) = (cache, &key) {
            if let Some(set) = cache.get(key) {
                debug!("  mask from cache");
                self.stats.cached_masks += 1;
                self.stats.compute_time_us += t0.elapsed().as_micros() as u64;
                return set;
            }
        }

        let limit_hits = self.stats.limit_hits;
        let mut set = vocab.alloc_token_set();
        vocab.add_bias(self, &mut set);
        if self.stats.limit_hits > limit_hits {
            debug!("  row limit hit while computing mask");
        }
        if let (Some(cache), Some(key)) = (cache, key) {
            cache.insert(key, &set);
        }
        self.stats.compute_time_us += t0.elapsed().as_micros() as u64;
        set
    }

    /// Items of the current row, plus the items of older rows that a later
    /// completion could still advance (dot before a non-terminal), found by
    /// following origins. Row positions are renumbered by rank. Parsers with
    /// equal keys accept exactly the same continuations.
    fn frontier_key(&self) -> Vec<u64> {
        let curr = self.rows.len() - 1;
        let waiting = |item: Item| {
            let sym = self.grammar.sym_idx_dot(item.rule_idx());
            sym != CSymIdx::NULL && !self.grammar.sym_data(sym).is_terminal
        };
        let live_items = |r: usize| {
            self.rows[r]
                .item_indices()
                .map(|i| self.scratch.items[i])
                .filter(move |&item| r == curr || waiting(item))
        };

        let mut rows = vec![curr];
        let mut seen = FxHashSet::default();
        seen.insert(curr);
        let mut ptr = 0;
        while ptr < rows.len() {
            let r = rows[ptr];
            ptr += 1;
            for item in live_items(r) {
                if seen.insert(item.start_pos()) {
                    rows.push(item.start_pos());
                }
            }
        }
        rows.sort_unstable();

        let mut key = vec![];
        for &r in &rows {
            let start = key.len();
            for item in live_items(r) {
                let rank = rows.binary_search(&item.start_pos()).unwrap_or_else(|p| p);
                key.push(Item::new(item.rule_idx(), rank).data);
            }
            key[start..].sort_unstable();
            key.push(u64::MAX);
        }
        key
    }

    fn run_speculative<T>(&mut self, f: impl FnOnce(&mut Self) -> T) -> T {
        self.trie_started();
        let r = f(self);
        self.trie_finished();
        r
    }

    fn scan(&mut self, b: u8) -> bool {
        let row = self.curr_row().clone();
        if !row.allowed_bytes.contains(b) {
            return false;
        }
        self.scratch.new_row(row.last_item);

        if self.scratch.definitive {
            debug!("  scan: {} at {}", byte_to_string(b), self.rows.len() - 1);
        }

        for i in row.item_indices() {
            let item = self.scratch.items[i];
            let sym = self.grammar.sym_data_dot(item.rule_idx());
            if sym.is_terminal && sym.bytes.contains(b) {
                self.scratch.just_add(item.advance_dot(), "scan");
            }
        }

        self.push_row(self.rows.len(), self.scratch.row_start)
    }

    // Agenda processing: the working row doubles as the agenda, so
    // adding an item schedules it. Returns false if the row is empty
    // or too large; the row is then not pushed.
    fn push_row(&mut self, curr_idx: usize, mut agenda_ptr: usize) -> bool {
        let mut allowed_bytes = ByteSet::EMPTY;

        while agenda_ptr < self.scratch.row_end {
            if self.scratch.row_len() > self.limits.max_items_in_row {
                self.limit_hit = true;
                self.stats.limit_hits += 1;
                return false;
            }

            let item_idx = agenda_ptr;
            let item = self.scratch.items[agenda_ptr];
            agenda_ptr += 1;
            if self.scratch.definitive {
                debug!("    agenda: {}", self.scratch.item_to_string(item_idx));
            }

            let rule = item.rule_idx();
            let after_dot = self.grammar.sym_idx_dot(rule);

            if after_dot == CSymIdx::NULL {
                // completion; same-row completions are covered by the
                // nullable rule below
                let lhs = self.grammar.sym_idx_lhs(rule);
                if item.start_pos() < curr_idx {
                    for i in self.rows[item.start_pos()].item_indices() {
                        let item = self.scratch.items[i];
                        if self.grammar.sym_idx_dot(item.rule_idx()) == lhs {
                            self.scratch.add_unique(item.advance_dot(), "complete");
                        }
                    }
                }
            } else {
                let sym_data = self.grammar.sym_data(after_dot);
                if sym_data.is_terminal {
                    allowed_bytes.union_with(&sym_data.bytes);
                    continue;
                }

                if sym_data.is_nullable {
                    self.scratch.add_unique(item.advance_dot(), "null");
                }

                for rule in &sym_data.rules {
                    self.scratch.add_unique(Item::new(*rule, curr_idx), "predict");
                }
            }
        }

        let row_len = self.scratch.row_len();
        self.stats.rows += 1;

        if row_len == 0 {
            return false;
        }

        self.stats.all_items += row_len;
        if self.scratch.definitive {
            debug!("  push row: {}", allowed_bytes);
        }
        let row = self.scratch.work_row(allowed_bytes);
        self.rows.push(row);
        true
    }

    #[allow(dead_code)]
    pub fn print_row(&self, row_idx: usize) {
        let row = &self.rows[row_idx];
        eprintln!(
            "row {}; allowed: {}; {} items",
            row_idx,
            row.allowed_bytes,
            row.last_item - row.first_item
        );
        for i in row.item_indices() {
            eprintln!("  {}", self.scratch.item_to_string(i));
        }
    }
}

// The token trie is walked depth-first: every successful try_push_byte()
// adds a row, pop_bytes() drops rows again. trie_finished() restores the
// row count from before the walk, since the walk may end deep in the trie.
impl Recognizer for Parser {
    #[inline(always)]
    fn pop_bytes(&mut self, num: usize) {
        self.truncate_rows(self.rows.len() - num);
    }

    // commit; this parser can always backtrack, so there is nothing to do
    fn collapse(&mut self) {}

    // stop tokens are handled by the matcher
    fn special_allowed(&mut self, _tok: SpecialToken) -> bool {
        false
    }

    fn trie_started(&mut self) {
        debug_assert!(self.scratch.definitive);
        self.trie_rows = self.rows.len();
        self.scratch.definitive = false;
    }

    fn trie_finished(&mut self) {
        debug_assert!(self.rows.len() >= self.trie_rows);
        self.truncate_rows(self.trie_rows);
        self.scratch.definitive = true;
    }

    #[inline(always)]
    fn try_push_byte(&mut self, byte: u8) -> bool {
        if self.scan(byte) {
            self.bytes.push(byte);
            true
        } else {
            self.limit_hit = false;
            false
        }
    }
}

impl Debug for Parser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Parser({} bytes, allowed next: {})",
            self.bytes.len(),
            self.allowed_bytes()
        )
    }
}

fn item_to_string(g: &CGrammar, item: &Item) -> String {
    format!("{} @{}", g.rule_to_string(item.rule_idx()), item.start_pos())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{earley::Grammar, VocabType};

    // root ::= "ab" | "a" digits ; digits ::= [0-9] | digits [0-9]
    fn test_grammar() -> Arc<CGrammar> {
        let mut g = Grammar::new();
        let root = g.fresh_symbol("root");
        let digits = g.fresh_symbol("digits");
        let a = g.terminal(ByteSet::from_byte(b'a'));
        let b = g.terminal(ByteSet::from_byte(b'b'));
        let d = g.terminal(ByteSet::from_range(b'0', b'9'));
        g.add_rule(root, vec![a, b]).unwrap();
        g.add_rule(root, vec![a, digits]).unwrap();
        g.add_rule(digits, vec![d]).unwrap();
        g.add_rule(digits, vec![digits, d]).unwrap();
        g.set_start(root);
        Arc::new(g.compile().unwrap())
    }

    #[test]
    fn accepts_and_rejects() {
        let mut p = Parser::new(test_grammar(), MatcherLimits::default()).unwrap();
        assert!(!p.is_accepting());
        assert_eq!(p.allowed_bytes().to_string(), "'a'");
        p.apply_bytes(b"a12").unwrap();
        assert!(p.is_accepting());
        assert!(p.apply_bytes(b"3x").is_err());
        // failed apply leaves the state alone
        assert_eq!(p.get_bytes(), b"a12");
        p.apply_bytes(b"3").unwrap();
        assert!(p.is_accepting());
    }

    #[test]
    fn rollback_and_reset() {
        let mut p = Parser::new(test_grammar(), MatcherLimits::default()).unwrap();
        p.apply_bytes(b"ab").unwrap();
        assert!(p.is_accepting());
        p.rollback_bytes(1).unwrap();
        assert_eq!(p.allowed_bytes().to_string(), "[0-9b]");
        assert!(p.rollback_bytes(5).is_err());
        p.reset();
        assert_eq!(p.num_bytes(), 0);
        assert!(!p.is_accepting());
    }

    #[test]
    fn speculative_prefix_and_forced() {
        let mut p = Parser::new(test_grammar(), MatcherLimits::default()).unwrap();
        assert_eq!(p.compute_forced_bytes(), b"a");
        assert_eq!(p.valid_prefix_len(b"a99z"), 3);
        assert_eq!(p.num_bytes(), 0);
        p.apply_bytes(b"a").unwrap();
        assert_eq!(p.compute_forced_bytes(), b"");
    }

    #[test]
    fn row_limit() {
        let limits = MatcherLimits {
            max_items_in_row: 1,
            ..MatcherLimits::default()
        };
        assert!(Parser::new(test_grammar(), limits).is_err());
    }

    #[test]
    fn large_rows_stay_deduplicated() {
        // root ::= n0 | ... | n39 ; ni ::= common [A+i] ; common ::= 'x'
        let mut g = Grammar::new();
        let root = g.fresh_symbol("root");
        let common = g.fresh_symbol("common");
        let x = g.terminal(ByteSet::from_byte(b'x'));
        g.add_rule(common, vec![x]).unwrap();
        for i in 0..40u8 {
            let n = g.fresh_symbol("n");
            let t = g.terminal(ByteSet::from_byte(b'A' + i));
            g.add_rule(n, vec![common, t]).unwrap();
            g.add_rule(root, vec![n]).unwrap();
        }
        g.set_start(root);
        let mut p = Parser::new(Arc::new(g.compile().unwrap()), MatcherLimits::default()).unwrap();
        assert!(p.stats().all_items <= 81, "{}", p.stats().all_items);
        p.apply_bytes(b"x").unwrap();
        assert_eq!(p.allowed_bytes().to_string(), "[A-h]");
        p.apply_bytes(b"Z").unwrap();
        assert!(p.is_accepting());
    }

    #[test]
    fn frontier_key_ignores_history() {
        let mut p = Parser::new(test_grammar(), MatcherLimits::default()).unwrap();
        p.apply_bytes(b"a1").unwrap();
        let k1 = p.frontier_key();
        p.apply_bytes(b"2").unwrap();
        let k2 = p.frontier_key();
        p.apply_bytes(b"3").unwrap();
        let k3 = p.frontier_key();
        assert_ne!(k1, k2);
        assert_eq!(k2, k3);
    }

    #[test]
    fn cached_masks_match_fresh_walks() {
        let vocab =
            Vocabulary::new(&["a", "1", "b", "12", "a1", "<eos>"], VocabType::Raw, &[5]).unwrap();
        let cache = MaskCache::new(16);
        let mut p = Parser::new(test_grammar(), MatcherLimits::default()).unwrap();
        let initial = p.compute_bias(&vocab, Some(&cache));
        assert_eq!(initial.iter().collect::<Vec<_>>(), vec![0, 4]);

        p.apply_bytes(b"a12").unwrap();
        let first = p.compute_bias(&vocab, Some(&cache));
        assert_eq!(p.stats().cached_masks, 0);
        p.apply_bytes(b"1").unwrap();
        let second = p.compute_bias(&vocab, Some(&cache));
        assert_eq!(p.stats().cached_masks, 1);
        let fresh = p.compute_bias(&vocab, None);
        assert_eq!(second.iter().collect::<Vec<_>>(), fresh.iter().collect::<Vec<_>>());
        assert_eq!(first.iter().collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(p.num_bytes(), 4);
    }
}
