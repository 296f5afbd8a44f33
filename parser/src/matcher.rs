use instant::Instant;

use crate::{
    api::EndOfGrammarPolicy,
    bitmask::{bitmask_len, write_bitmask},
    earley::{Parser, ParserError, ParserStats},
    infoln, CompiledGrammar, GrammarError, Logger, SimpleVob, TokenId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(C)]
pub enum MatcherState {
    /// Nothing accepted since construction or `reset()`.
    Initial,
    Matching,
    /// A stop token was accepted.
    Complete,
    /// A token was rejected; only `reset()` helps.
    Rejected,
}

#[derive(Debug, Clone, Copy)]
struct Step {
    num_bytes: usize,
    stop: bool,
}

/// Incremental matcher for one generation: tracks the Earley frontier of
/// the bytes accepted so far and computes per-token masks.
#[derive(Clone)]
pub struct GrammarMatcher {
    grammar: CompiledGrammar,
    parser: Parser,
    state: MatcherState,
    steps: Vec<Step>,
    end_policy: EndOfGrammarPolicy,
    stats_at_reset: ParserStats,
    pub(crate) logger: Logger,
}

impl GrammarMatcher {
    pub fn new(grammar: &CompiledGrammar) -> Result<Self, GrammarError> {
        let parser = Parser::new(grammar.grammar().clone(), *grammar.limits())
            .map_err(|e| GrammarError::ResourceLimit(format!("{e:#}")))?;
        Ok(GrammarMatcher {
            grammar: grammar.clone(),
            stats_at_reset: parser.stats().clone(),
            parser,
            state: MatcherState::Initial,
            steps: vec![],
            end_policy: EndOfGrammarPolicy::default(),
            logger: grammar.new_logger(),
        })
    }

    pub fn with_end_policy(mut self, policy: EndOfGrammarPolicy) -> Self {
        self.end_policy = policy;
        self
    }

    pub fn state(&self) -> MatcherState {
        self.state
    }

    pub fn compiled_grammar(&self) -> &CompiledGrammar {
        &self.grammar
    }

    pub fn vocab_size(&self) -> usize {
        self.grammar.vocab().vocab_size()
    }

    /// Whether the bytes accepted so far form a complete document.
    pub fn is_accepting(&self) -> bool {
        self.parser.is_accepting()
    }

    /// Complete or rejected: no further tokens are accepted.
    pub fn is_terminated(&self) -> bool {
        matches!(self.state, MatcherState::Complete | MatcherState::Rejected)
    }

    /// Bytes accepted so far.
    pub fn accepted_bytes(&self) -> &[u8] {
        self.parser.get_bytes()
    }

    /// Parser statistics accumulated since the last reset.
    pub fn stats(&self) -> ParserStats {
        self.parser.stats().delta(&self.stats_at_reset)
    }

    pub fn flush_logs(&mut self) -> String {
        self.logger.get_and_clear_logs()
    }

    fn frozen(&self) -> GrammarError {
        GrammarError::FrozenState(match self.state {
            MatcherState::Complete => "stop token already accepted".to_string(),
            _ => "a token was rejected; reset() the matcher".to_string(),
        })
    }

    fn reject(&mut self, msg: String) -> GrammarError {
        infoln!(self, "rejected: {}", msg);
        self.state = MatcherState::Rejected;
        GrammarError::GrammarViolation(msg)
    }

    pub fn reset(&mut self) {
        infoln!(self, "reset");
        self.parser.reset();
        self.steps.clear();
        self.state = MatcherState::Initial;
        self.stats_at_reset = self.parser.stats().clone();
    }

    /// Fills `bitmask` (`bitmask_len(vocab_size)` words, bit set = token
    /// allowed).
    pub fn fill_next_token_bitmask(&mut self, bitmask: &mut [u32]) -> Result<(), GrammarError> {
        let vocab = self.grammar.vocab().clone();
        let expected = bitmask_len(vocab.vocab_size());
        if bitmask.len() != expected {
            return Err(GrammarError::IncompatibleVocabulary(format!(
                "bitmask has {} words, vocabulary of {} tokens needs {}",
                bitmask.len(),
                vocab.vocab_size(),
                expected
            )));
        }

        let mask = self.next_token_set()?;
        write_bitmask(&mask, bitmask);
        Ok(())
    }

    /// Allowed next tokens as a token set.
    pub fn compute_mask(&mut self) -> Result<SimpleVob, GrammarError> {
        self.next_token_set()
    }

    fn next_token_set(&mut self) -> Result<SimpleVob, GrammarError> {
        let vocab = self.grammar.vocab().clone();
        let mut mask = match self.state {
            MatcherState::Rejected => return Err(self.frozen()),
            MatcherState::Complete => {
                let mut mask = vocab.alloc_token_set();
                if self.end_policy == EndOfGrammarPolicy::StopTokensOnly {
                    for &t in vocab.stop_tokens() {
                        mask.allow_token(t);
                    }
                }
                return Ok(mask);
            }
            MatcherState::Initial | MatcherState::Matching => {
                let t0 = Instant::now();
                let mask = self
                    .parser
                    .compute_bias(&vocab, Some(self.grammar.mask_cache()));
                infoln!(self, "mask: {} tokens; {:?}", mask.num_set(), t0.elapsed());
                mask
            }
        };
        if self.parser.is_accepting() {
            for &t in vocab.stop_tokens() {
                mask.allow_token(t);
            }
        }
        Ok(mask)
    }

    pub fn accept_token(&mut self, token: TokenId) -> Result<(), GrammarError> {
        let vocab = self.grammar.vocab().clone();
        if token as usize >= vocab.vocab_size() {
            return Err(GrammarError::IncompatibleVocabulary(format!(
                "token id {} out of range for vocabulary of {} tokens",
                token,
                vocab.vocab_size()
            )));
        }
        if self.is_terminated() {
            return Err(self.frozen());
        }

        infoln!(self, "accept_token: {}", vocab.token_dbg(token));

        if vocab.is_stop_token(token) {
            if !self.parser.is_accepting() {
                return Err(self.reject(format!(
                    "stop token {} while the grammar is not complete",
                    vocab.token_dbg(token)
                )));
            }
            self.steps.push(Step {
                num_bytes: 0,
                stop: true,
            });
            self.state = MatcherState::Complete;
            return Ok(());
        }

        if vocab.is_special_token(token) {
            return Err(self.reject(format!(
                "special token {} is not allowed by the grammar",
                vocab.token_dbg(token)
            )));
        }

        let bytes = vocab.token_bytes(token);
        match self.parser.apply_bytes(bytes) {
            Ok(()) => {
                self.steps.push(Step {
                    num_bytes: bytes.len(),
                    stop: false,
                });
                self.state = MatcherState::Matching;
                Ok(())
            }
            Err(ParserError::TooManyItems(n)) => Err(GrammarError::ResourceLimit(format!(
                "more than {} Earley items in a row while accepting {}",
                n,
                vocab.token_dbg(token)
            ))),
            Err(e) => Err(self.reject(format!(
                "token {}: {}",
                vocab.token_dbg(token),
                e.message()
            ))),
        }
    }

    /// Accepts raw bytes as if they were one token. Rejected bytes leave
    /// the matcher unchanged.
    pub fn accept_bytes(&mut self, bytes: &[u8]) -> Result<(), GrammarError> {
        if self.is_terminated() {
            return Err(self.frozen());
        }
        match self.parser.apply_bytes(bytes) {
            Ok(()) => {
                self.steps.push(Step {
                    num_bytes: bytes.len(),
                    stop: false,
                });
                self.state = MatcherState::Matching;
                Ok(())
            }
            Err(ParserError::TooManyItems(n)) => Err(GrammarError::ResourceLimit(format!(
                "more than {} Earley items in a row",
                n
            ))),
            Err(e) => Err(GrammarError::GrammarViolation(e.message())),
        }
    }

    pub fn accept_string(&mut self, s: &str) -> Result<(), GrammarError> {
        self.accept_bytes(s.as_bytes())
    }

    /// Undoes the last `num_tokens` accepted tokens (a stop token counts
    /// as one).
    pub fn rollback(&mut self, num_tokens: usize) -> Result<(), GrammarError> {
        if self.state == MatcherState::Rejected {
            return Err(self.frozen());
        }
        if num_tokens > self.steps.len() {
            return Err(GrammarError::GrammarViolation(format!(
                "cannot roll back {} tokens, only {} accepted",
                num_tokens,
                self.steps.len()
            )));
        }
        let mut num_bytes = 0;
        for step in self.steps.drain(self.steps.len() - num_tokens..) {
            num_bytes += step.num_bytes;
        }
        self.parser
            .rollback_bytes(num_bytes)
            .map_err(|e| GrammarError::ResourceLimit(format!("{e:#}")))?;
        self.state = if self.steps.is_empty() {
            MatcherState::Initial
        } else if self.steps.last().is_some_and(|s| s.stop) {
            MatcherState::Complete
        } else {
            MatcherState::Matching
        };
        infoln!(self, "rollback {} tokens ({} bytes)", num_tokens, num_bytes);
        Ok(())
    }

    /// Length of the longest prefix of `tokens` that could be accepted in
    /// order. The matcher is left as it was.
    pub fn validate_tokens(&mut self, tokens: &[TokenId]) -> Result<usize, GrammarError> {
        if self.is_terminated() {
            return Err(self.frozen());
        }
        let vocab = self.grammar.vocab().clone();
        let mut applied = 0;
        let mut n = 0;
        for &t in tokens {
            if t as usize >= vocab.vocab_size() || vocab.is_special_token(t) {
                break;
            }
            if vocab.is_stop_token(t) {
                if self.parser.is_accepting() {
                    n += 1;
                }
                break;
            }
            let bytes = vocab.token_bytes(t);
            if self.parser.apply_bytes(bytes).is_err() {
                break;
            }
            applied += bytes.len();
            n += 1;
        }
        self.parser
            .rollback_bytes(applied)
            .map_err(|e| GrammarError::ResourceLimit(format!("{e:#}")))?;
        Ok(n)
    }

    /// Bytes the grammar forces next, up to the first choice point.
    pub fn compute_forced_bytes(&mut self) -> Vec<u8> {
        if self.is_terminated() {
            return vec![];
        }
        self.parser.compute_forced_bytes()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        json::JsonCompileOptions, ErrorKind, GrammarCompiler, VocabType, Vocabulary,
    };
    use std::sync::Arc;

    fn object_matcher() -> GrammarMatcher {
        let vocab = Vocabulary::new(
            &["{", "}", "\"a\"", ":", "1", "<eos>", "<pad>"],
            VocabType::Raw,
            &[5],
        )
        .unwrap();
        let mut compiler = GrammarCompiler::new(&Arc::new(vocab));
        compiler.quiet();
        let g = compiler
            .compile_json_schema(
                r#"{"type":"object","properties":{"a":{"type":"integer"}},"required":["a"]}"#,
                &JsonCompileOptions::default(),
            )
            .unwrap();
        GrammarMatcher::new(&g).unwrap()
    }

    fn allowed(m: &mut GrammarMatcher) -> Vec<TokenId> {
        m.compute_mask().unwrap().iter().collect()
    }

    #[test]
    fn object_scenario() {
        let mut m = object_matcher();
        assert_eq!(m.state(), MatcherState::Initial);
        assert_eq!(allowed(&mut m), vec![0]);
        for t in [0, 2, 3, 4] {
            m.accept_token(t).unwrap();
            assert_eq!(m.state(), MatcherState::Matching);
        }
        assert_eq!(allowed(&mut m), vec![1, 4]);
        m.accept_token(1).unwrap();
        assert_eq!(allowed(&mut m), vec![5]);
        m.accept_token(5).unwrap();
        assert_eq!(m.state(), MatcherState::Complete);
        assert!(m.is_terminated());
        assert_eq!(allowed(&mut m), vec![5]);
        assert_eq!(m.accept_token(4).unwrap_err().kind(), ErrorKind::FrozenState);
    }

    #[test]
    fn rejection_freezes() {
        let mut m = object_matcher();
        m.accept_token(0).unwrap();
        let e = m.accept_token(1).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::GrammarViolation);
        assert_eq!(m.state(), MatcherState::Rejected);
        let mut words = vec![0u32; 1];
        assert_eq!(
            m.fill_next_token_bitmask(&mut words).unwrap_err().kind(),
            ErrorKind::FrozenState
        );
        assert_eq!(m.accept_token(2).unwrap_err().kind(), ErrorKind::FrozenState);
        m.reset();
        assert_eq!(m.state(), MatcherState::Initial);
        m.accept_token(0).unwrap();
    }

    #[test]
    fn bad_inputs() {
        let mut m = object_matcher();
        let mut words = vec![0u32; 2];
        assert_eq!(
            m.fill_next_token_bitmask(&mut words).unwrap_err().kind(),
            ErrorKind::IncompatibleVocabulary
        );
        assert_eq!(m.accept_token(7).unwrap_err().kind(), ErrorKind::IncompatibleVocabulary);
        assert_eq!(m.state(), MatcherState::Initial);
        // stop token before the object is complete
        assert_eq!(m.accept_token(5).unwrap_err().kind(), ErrorKind::GrammarViolation);
        assert_eq!(m.state(), MatcherState::Rejected);
    }

    #[test]
    fn rollback_validate_and_forced() {
        let mut m = object_matcher();
        assert_eq!(m.compute_forced_bytes(), b"{".to_vec());
        assert_eq!(m.validate_tokens(&[0, 2, 3, 1, 4]).unwrap(), 3);
        assert_eq!(m.state(), MatcherState::Initial);
        assert_eq!(m.validate_tokens(&[0, 2, 3, 4, 1, 5]).unwrap(), 6);

        for t in [0, 2, 3, 4, 1, 5] {
            m.accept_token(t).unwrap();
        }
        m.rollback(1).unwrap();
        assert_eq!(m.state(), MatcherState::Matching);
        assert!(m.is_accepting());
        m.rollback(3).unwrap();
        assert_eq!(m.accepted_bytes(), b"{\"a\"");
        assert!(m.rollback(5).is_err());
        m.rollback(2).unwrap();
        assert_eq!(m.state(), MatcherState::Initial);
    }

    #[test]
    fn end_policy_empty() {
        let mut m = object_matcher().with_end_policy(EndOfGrammarPolicy::Empty);
        m.accept_string("{\"a\":1}").unwrap();
        m.accept_token(5).unwrap();
        assert!(allowed(&mut m).is_empty());
    }
}
