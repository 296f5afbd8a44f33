use std::fmt::{Debug, Display};

use anyhow::{bail, ensure, Result};
use rustc_hash::FxHashMap;

use super::byteset::ByteSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SymIdx(u32);

impl SymIdx {
    #[inline(always)]
    pub fn as_usize(&self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone)]
struct Symbol {
    name: String,
    bytes: Option<ByteSet>,
    rules: Vec<Vec<SymIdx>>,
    // matches nothing on purpose; alternatives using it are pruned silently
    is_nothing: bool,
}

/// Rule graph under construction. Symbols live in an arena and refer to
/// each other by index; cycles (recursive rules) are plain index cycles.
#[derive(Clone, Default)]
pub struct Grammar {
    symbols: Vec<Symbol>,
    terminals: FxHashMap<ByteSet, SymIdx>,
    start: Option<SymIdx>,
    rule_elements: usize,
}

impl Grammar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fresh_symbol(&mut self, name: &str) -> SymIdx {
        let idx = SymIdx(self.symbols.len() as u32);
        self.symbols.push(Symbol {
            name: name.to_string(),
            bytes: None,
            rules: vec![],
            is_nothing: false,
        });
        idx
    }

    /// A symbol without rules that is meant to match nothing, as opposed
    /// to one whose rules happen to never terminate.
    pub fn fresh_nothing(&mut self) -> SymIdx {
        let idx = self.fresh_symbol("nothing");
        self.symbols[idx.as_usize()].is_nothing = true;
        idx
    }

    /// Terminal matching one byte out of `bytes`; terminals are shared.
    pub fn terminal(&mut self, bytes: ByteSet) -> SymIdx {
        if let Some(idx) = self.terminals.get(&bytes) {
            return *idx;
        }
        let idx = self.fresh_symbol(&bytes.to_string());
        self.symbols[idx.as_usize()].bytes = Some(bytes);
        self.terminals.insert(bytes, idx);
        idx
    }

    pub fn add_rule(&mut self, lhs: SymIdx, rhs: Vec<SymIdx>) -> Result<()> {
        ensure!(lhs.as_usize() < self.symbols.len(), "invalid symbol {:?}", lhs);
        ensure!(
            !self.is_terminal(lhs),
            "terminal {} can't have rules",
            self.sym_name(lhs)
        );
        for s in &rhs {
            ensure!(s.as_usize() < self.symbols.len(), "invalid symbol {:?}", s);
        }
        self.push_rule(lhs, rhs);
        Ok(())
    }

    /// `add_rule()` for callers that only use symbols they created.
    pub(crate) fn push_rule(&mut self, lhs: SymIdx, rhs: Vec<SymIdx>) {
        debug_assert!(!self.is_terminal(lhs));
        self.rule_elements += rhs.len() + 1;
        self.symbols[lhs.as_usize()].rules.push(rhs);
    }

    pub fn set_start(&mut self, sym: SymIdx) {
        self.start = Some(sym);
    }

    pub fn start(&self) -> Option<SymIdx> {
        self.start
    }

    pub fn is_terminal(&self, sym: SymIdx) -> bool {
        self.symbols[sym.as_usize()].bytes.is_some()
    }

    pub fn sym_name(&self, sym: SymIdx) -> &str {
        &self.symbols[sym.as_usize()].name
    }

    pub fn rules_of(&self, sym: SymIdx) -> &[Vec<SymIdx>] {
        &self.symbols[sym.as_usize()].rules
    }

    pub fn num_symbols(&self) -> usize {
        self.symbols.len()
    }

    pub fn num_rules(&self) -> usize {
        self.symbols.iter().map(|s| s.rules.len()).sum()
    }

    /// Symbols plus rule elements; what the grammar size limit counts.
    pub fn size(&self) -> usize {
        self.symbols.len() + self.rule_elements
    }

    // With `nothing_ok`, explicit `nothing` symbols count as productive;
    // what is still unproductive then is a genuine endless recursion.
    fn productive_symbols(&self, nothing_ok: bool) -> Vec<bool> {
        let mut productive: Vec<bool> = self
            .symbols
            .iter()
            .map(|s| s.bytes.is_some() || (nothing_ok && s.is_nothing))
            .collect();
        loop {
            let mut changed = false;
            for (idx, sym) in self.symbols.iter().enumerate() {
                if productive[idx] {
                    continue;
                }
                if sym
                    .rules
                    .iter()
                    .any(|r| r.iter().all(|s| productive[s.as_usize()]))
                {
                    productive[idx] = true;
                    changed = true;
                }
            }
            if !changed {
                return productive;
            }
        }
    }

    fn reachable_symbols(&self, root: SymIdx) -> Vec<SymIdx> {
        let mut seen = vec![false; self.symbols.len()];
        seen[root.as_usize()] = true;
        let mut order = vec![root];
        let mut ptr = 0;
        while ptr < order.len() {
            let sym = &self.symbols[order[ptr].as_usize()];
            ptr += 1;
            for s in sym.rules.iter().flatten() {
                if !seen[s.as_usize()] {
                    seen[s.as_usize()] = true;
                    order.push(*s);
                }
            }
        }
        order
    }

    /// Check that every reachable symbol can derive some string, drop
    /// alternatives that use `nothing` and unreachable symbols, then
    /// flatten into the representation the Earley parser runs on.
    pub fn compile(&self) -> Result<CGrammar> {
        let root = match self.start {
            Some(s) => s,
            None => bail!("grammar has no start symbol"),
        };

        let relaxed = self.productive_symbols(true);
        if let Some(sym) = self
            .reachable_symbols(root)
            .into_iter()
            .find(|s| !relaxed[s.as_usize()])
        {
            bail!(
                "grammar cannot derive any finite string (unproductive recursion in {})",
                self.sym_name(sym)
            );
        }

        let productive = self.productive_symbols(false);
        if !productive[root.as_usize()] {
            bail!(
                "grammar cannot derive any finite string ({} matches nothing)",
                self.sym_name(root)
            );
        }

        fn usable_rules<'a>(sym: &'a Symbol, productive: &[bool]) -> Vec<&'a Vec<SymIdx>> {
            sym.rules
                .iter()
                .filter(|r| r.iter().all(|s| productive[s.as_usize()]))
                .collect()
        }

        // reachability through productive rules only
        let mut remap: Vec<Option<CSymIdx>> = vec![None; self.symbols.len()];
        let mut order = vec![root];
        // CSymIdx(0) is NULL, CSymIdx(1) the synthetic start symbol
        remap[root.as_usize()] = Some(CSymIdx(2));
        let mut ptr = 0;
        while ptr < order.len() {
            let sym = &self.symbols[order[ptr].as_usize()];
            ptr += 1;
            for rule in usable_rules(sym, &productive) {
                for s in rule {
                    if remap[s.as_usize()].is_none() {
                        remap[s.as_usize()] = Some(CSymIdx(order.len() as u32 + 2));
                        order.push(*s);
                    }
                }
            }
        }

        let mut outp = CGrammar {
            start_symbol: CSymIdx(1),
            symbols: vec![],
            rule_data: vec![CSymIdx::NULL],
            rule_lhs: vec![CSymIdx::NULL],
        };
        outp.symbols.push(CSymbol::new(CSymIdx::NULL, "NULL", None));
        outp.symbols.push(CSymbol::new(CSymIdx(1), "_start", None));
        for s in &order {
            let sym = &self.symbols[s.as_usize()];
            let idx = CSymIdx(outp.symbols.len() as u32);
            outp.symbols.push(CSymbol::new(idx, &sym.name, sym.bytes));
        }

        let root_c = CSymIdx(2);
        outp.add_rule(CSymIdx(1), &[root_c]);
        for s in &order {
            let lhs = remap[s.as_usize()].unwrap_or(CSymIdx::NULL);
            for rule in usable_rules(&self.symbols[s.as_usize()], &productive) {
                let rhs: Vec<CSymIdx> = rule
                    .iter()
                    .map(|r| remap[r.as_usize()].unwrap_or(CSymIdx::NULL))
                    .collect();
                outp.add_rule(lhs, &rhs);
            }
        }

        outp.compute_nullable();
        Ok(outp)
    }
}

impl Display for Grammar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (idx, sym) in self.symbols.iter().enumerate() {
            for rule in &sym.rules {
                let rhs: Vec<&str> = rule.iter().map(|s| self.sym_name(*s)).collect();
                writeln!(f, "{}#{} ::= {}", sym.name, idx, rhs.join(" "))?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CSymIdx(u32);

impl CSymIdx {
    pub const NULL: CSymIdx = CSymIdx(0);

    #[inline(always)]
    pub fn as_index(&self) -> usize {
        self.0 as usize
    }
}

/// Dotted rule position: index into the flattened rule array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RuleIdx(u32);

impl RuleIdx {
    #[inline(always)]
    pub fn from_index(idx: u32) -> Self {
        RuleIdx(idx)
    }

    #[inline(always)]
    pub fn as_index(&self) -> usize {
        self.0 as usize
    }

    #[inline(always)]
    pub fn advance(&self) -> Self {
        RuleIdx(self.0 + 1)
    }
}

#[derive(Clone)]
pub struct CSymbol {
    pub idx: CSymIdx,
    pub name: String,
    pub is_terminal: bool,
    pub is_nullable: bool,
    pub bytes: ByteSet,
    pub rules: Vec<RuleIdx>,
}

impl CSymbol {
    fn new(idx: CSymIdx, name: &str, bytes: Option<ByteSet>) -> Self {
        CSymbol {
            idx,
            name: name.to_string(),
            is_terminal: bytes.is_some(),
            is_nullable: false,
            bytes: bytes.unwrap_or_default(),
            rules: vec![],
        }
    }
}

/// Compiled grammar. Each rule `A ::= X Y` occupies consecutive positions
/// `[X, Y, NULL]` in `rule_data`; a dotted item is the position right
/// after the dot.
#[derive(Clone)]
pub struct CGrammar {
    start_symbol: CSymIdx,
    symbols: Vec<CSymbol>,
    rule_data: Vec<CSymIdx>,
    rule_lhs: Vec<CSymIdx>,
}

impl CGrammar {
    fn add_rule(&mut self, lhs: CSymIdx, rhs: &[CSymIdx]) {
        let idx = RuleIdx(self.rule_data.len() as u32);
        for s in rhs {
            self.rule_data.push(*s);
            self.rule_lhs.push(lhs);
        }
        self.rule_data.push(CSymIdx::NULL);
        self.rule_lhs.push(lhs);
        self.symbols[lhs.as_index()].rules.push(idx);
    }

    fn compute_nullable(&mut self) {
        loop {
            let mut changed = false;
            for idx in 0..self.symbols.len() {
                if self.symbols[idx].is_nullable || self.symbols[idx].is_terminal {
                    continue;
                }
                let nullable = self.symbols[idx].rules.iter().any(|r| {
                    let mut p = r.as_index();
                    while self.rule_data[p] != CSymIdx::NULL {
                        if !self.symbols[self.rule_data[p].as_index()].is_nullable {
                            return false;
                        }
                        p += 1;
                    }
                    true
                });
                if nullable {
                    self.symbols[idx].is_nullable = true;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
    }

    #[inline(always)]
    pub fn start(&self) -> CSymIdx {
        self.start_symbol
    }

    #[inline(always)]
    pub fn sym_data(&self, sym: CSymIdx) -> &CSymbol {
        &self.symbols[sym.as_index()]
    }

    #[inline(always)]
    pub fn sym_idx_dot(&self, rule: RuleIdx) -> CSymIdx {
        self.rule_data[rule.as_index()]
    }

    #[inline(always)]
    pub fn sym_data_dot(&self, rule: RuleIdx) -> &CSymbol {
        self.sym_data(self.sym_idx_dot(rule))
    }

    #[inline(always)]
    pub fn sym_idx_lhs(&self, rule: RuleIdx) -> CSymIdx {
        self.rule_lhs[rule.as_index()]
    }

    pub fn sym_name(&self, sym: CSymIdx) -> &str {
        &self.symbols[sym.as_index()].name
    }

    pub fn num_symbols(&self) -> usize {
        self.symbols.len()
    }

    pub fn num_rules(&self) -> usize {
        self.symbols.iter().map(|s| s.rules.len()).sum()
    }

    pub fn size(&self) -> usize {
        self.rule_data.len() + self.symbols.len()
    }

    pub fn rule_to_string(&self, rule: RuleIdx) -> String {
        let lhs = self.sym_idx_lhs(rule);
        let mut start = rule.as_index();
        while start > 0 && self.rule_data[start - 1] != CSymIdx::NULL {
            start -= 1;
        }
        let mut parts = vec![];
        let mut p = start;
        loop {
            if p == rule.as_index() {
                parts.push("•".to_string());
            }
            let s = self.rule_data[p];
            if s == CSymIdx::NULL {
                break;
            }
            parts.push(self.sym_name(s).to_string());
            p += 1;
        }
        format!("{} ::= {}", self.sym_name(lhs), parts.join(" "))
    }
}

impl Debug for CGrammar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for sym in &self.symbols {
            for rule in &sym.rules {
                writeln!(f, "{}", self.rule_to_string(*rule))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn lit(g: &mut Grammar, s: &str) -> Vec<SymIdx> {
        s.bytes().map(|b| g.terminal(ByteSet::from_byte(b))).collect()
    }

    #[test]
    fn prunes_nothing_alternatives() {
        let mut g = Grammar::new();
        let root = g.fresh_symbol("root");
        let nothing = g.fresh_nothing();
        let ab = lit(&mut g, "ab");
        g.add_rule(root, ab).unwrap();
        let a = g.terminal(ByteSet::from_byte(b'a'));
        g.add_rule(root, vec![a, nothing]).unwrap();
        g.set_start(root);

        let cg = g.compile().unwrap();
        // NULL, _start, root, 'a', 'b'
        assert_eq!(cg.num_symbols(), 5);
        assert_eq!(cg.num_rules(), 2);

        g.set_start(nothing);
        let err = g.compile().unwrap_err().to_string();
        assert!(err.contains("matches nothing"), "{err}");
    }

    #[test]
    fn unproductive_recursion_is_an_error() {
        let mut g = Grammar::new();
        let root = g.fresh_symbol("root");
        g.add_rule(root, vec![root]).unwrap();
        g.set_start(root);
        let err = g.compile().unwrap_err().to_string();
        assert!(err.contains("unproductive recursion in root"), "{err}");

        // not just at the root: dead ::= dead 'a' is reachable from root
        let mut g = Grammar::new();
        let root = g.fresh_symbol("root");
        let dead = g.fresh_symbol("dead");
        let ab = lit(&mut g, "ab");
        g.add_rule(root, ab).unwrap();
        g.add_rule(root, vec![dead]).unwrap();
        let a = g.terminal(ByteSet::from_byte(b'a'));
        g.add_rule(dead, vec![dead, a]).unwrap();
        g.set_start(root);
        let err = g.compile().unwrap_err().to_string();
        assert!(err.contains("unproductive recursion in dead"), "{err}");

        // unreachable symbols don't matter
        let mut g = Grammar::new();
        let root = g.fresh_symbol("root");
        let dead = g.fresh_symbol("dead");
        g.add_rule(dead, vec![dead]).unwrap();
        g.add_rule(root, vec![]).unwrap();
        g.set_start(root);
        assert!(g.compile().is_ok());
    }

    #[test]
    fn nullable_and_rule_strings() {
        let mut g = Grammar::new();
        let root = g.fresh_symbol("list");
        let x = g.terminal(ByteSet::from_byte(b'x'));
        g.add_rule(root, vec![]).unwrap();
        g.add_rule(root, vec![root, x]).unwrap();
        g.set_start(root);
        let cg = g.compile().unwrap();
        let list = cg.sym_data(CSymIdx(2));
        assert!(list.is_nullable);
        assert!(cg.sym_data(cg.start()).is_nullable);
        let r = list.rules[1];
        assert_eq!(cg.rule_to_string(r), "list ::= • list 'x'");
        assert_eq!(cg.rule_to_string(r.advance()), "list ::= list • 'x'");
        assert_eq!(cg.sym_idx_lhs(r), CSymIdx(2));
    }

    #[test]
    fn terminals_are_shared() {
        let mut g = Grammar::new();
        let a1 = g.terminal(ByteSet::from_byte(b'a'));
        let a2 = g.terminal(ByteSet::from_byte(b'a'));
        assert_eq!(a1, a2);
        assert!(g.is_terminal(a1));
        assert!(g.add_rule(a1, vec![]).is_err());
    }
}
