use std::sync::{Arc, Mutex};

use anyhow::{anyhow, ensure, Result};
use instant::Instant;
use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::{
    api::{MatcherLimits, StructuralTag},
    earley::{CGrammar, Grammar, MaskCache},
    json::{json_schema_to_grammar, JsonCompileOptions},
    loginfo,
    logging::{LOG_OFF, LOG_WARNING},
    structural_tag::{parse_structural_tag, structural_tag_to_grammar},
    GrammarError, Logger, VocabRef,
};

struct CompiledInner {
    grammar: Arc<CGrammar>,
    vocab: VocabRef,
    limits: MatcherLimits,
    mask_cache: MaskCache,
    buffer_log_level: u32,
    stderr_log_level: u32,
    compile_logs: String,
}

/// Compiled grammars kept per compiler; the cache starts over once full.
const MAX_CACHED_GRAMMARS: usize = 128;

/// A grammar bound to a vocabulary, ready for matching. Cheap to clone and
/// shareable across threads.
#[derive(Clone)]
pub struct CompiledGrammar {
    inner: Arc<CompiledInner>,
}

impl CompiledGrammar {
    pub fn grammar(&self) -> &Arc<CGrammar> {
        &self.inner.grammar
    }

    pub fn vocab(&self) -> &VocabRef {
        &self.inner.vocab
    }

    pub fn limits(&self) -> &MatcherLimits {
        &self.inner.limits
    }

    pub(crate) fn mask_cache(&self) -> &MaskCache {
        &self.inner.mask_cache
    }

    /// Log output buffered while compiling.
    pub fn compile_logs(&self) -> &str {
        &self.inner.compile_logs
    }

    pub(crate) fn new_logger(&self) -> Logger {
        Logger::new(self.inner.buffer_log_level, self.inner.stderr_log_level)
    }
}

impl std::fmt::Debug for CompiledGrammar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledGrammar")
            .field("symbols", &self.inner.grammar.num_symbols())
            .field("rules", &self.inner.grammar.num_rules())
            .field("vocab_size", &self.inner.vocab.vocab_size())
            .finish()
    }
}

/// Turns JSON schemas and structural tags into [`CompiledGrammar`]s for
/// one vocabulary.
pub struct GrammarCompiler {
    vocab: VocabRef,
    stderr_log_level: u32,
    buffer_log_level: u32,
    limits: MatcherLimits,
    cache_enabled: bool,
    cache: Mutex<FxHashMap<String, CompiledGrammar>>,
}

impl GrammarCompiler {
    pub fn new(vocab: &VocabRef) -> Self {
        GrammarCompiler {
            vocab: vocab.clone(),
            stderr_log_level: LOG_WARNING,
            buffer_log_level: LOG_OFF,
            limits: MatcherLimits::default(),
            cache_enabled: true,
            cache: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn vocab(&self) -> &VocabRef {
        &self.vocab
    }

    pub fn limits_mut(&mut self) -> &mut MatcherLimits {
        &mut self.limits
    }

    pub fn quiet(&mut self) -> &mut Self {
        self.stderr_log_level = LOG_OFF;
        self.buffer_log_level = LOG_OFF;
        self
    }

    pub fn set_buffer_log_level(&mut self, level: u32) -> &mut Self {
        self.buffer_log_level = level;
        self
    }

    pub fn set_stderr_log_level(&mut self, level: u32) -> &mut Self {
        self.stderr_log_level = level;
        self
    }

    pub fn set_cache_enabled(&mut self, enabled: bool) -> &mut Self {
        self.cache_enabled = enabled;
        if !enabled {
            self.clear_cache();
        }
        self
    }

    pub fn clear_cache(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.clear();
        }
    }

    pub fn num_cached(&self) -> usize {
        self.cache.lock().map_or(0, |c| c.len())
    }

    fn cached(
        &self,
        source: String,
        compile: impl FnOnce(&mut Logger) -> Result<(Grammar, Vec<String>)>,
    ) -> Result<CompiledGrammar> {
        let key = format!(
            "{}:{}",
            serde_json::to_string(&self.limits).unwrap_or_default(),
            source
        );
        if self.cache_enabled {
            if let Some(g) = self.cache.lock().ok().and_then(|c| c.get(&key).cloned()) {
                return Ok(g);
            }
        }
        let mut logger = Logger::new(self.buffer_log_level, self.stderr_log_level);
        let t0 = Instant::now();
        let (grammar, warnings) = compile(&mut logger)?;
        for w in &warnings {
            logger.warn(w);
        }
        let grammar = grammar.compile()?;
        ensure!(
            grammar.size() <= self.limits.max_grammar_size,
            "grammar too large: {} elements, limit {}",
            grammar.size(),
            self.limits.max_grammar_size
        );
        loginfo!(
            logger,
            "compiled grammar: {} symbols, {} rules, size {}; {:?}",
            grammar.num_symbols(),
            grammar.num_rules(),
            grammar.size(),
            t0.elapsed()
        );
        let compiled = CompiledGrammar {
            inner: Arc::new(CompiledInner {
                grammar: Arc::new(grammar),
                vocab: self.vocab.clone(),
                limits: self.limits,
                mask_cache: MaskCache::new(self.limits.max_cached_masks),
                buffer_log_level: self.buffer_log_level,
                stderr_log_level: self.stderr_log_level,
                compile_logs: logger.get_and_clear_logs(),
            }),
        };
        if self.cache_enabled {
            if let Ok(mut cache) = self.cache.lock() {
                if cache.len() >= MAX_CACHED_GRAMMARS {
                    cache.clear();
                }
                cache.insert(key, compiled.clone());
            }
        }
        Ok(compiled)
    }

    pub fn compile_json_schema(
        &self,
        schema: &str,
        options: &JsonCompileOptions,
    ) -> Result<CompiledGrammar, GrammarError> {
        let value: Value = serde_json::from_str(schema)
            .map_err(|e| GrammarError::schema(anyhow!("invalid JSON in schema: {}", e)))?;
        self.compile_json_schema_value(&value, options)
    }

    pub fn compile_json_schema_value(
        &self,
        schema: &Value,
        options: &JsonCompileOptions,
    ) -> Result<CompiledGrammar, GrammarError> {
        let key = format!(
            "json:{}:{}",
            serde_json::to_string(options).unwrap_or_default(),
            schema
        );
        let max_size = self.limits.max_grammar_size;
        self.cached(key, |logger| {
            loginfo!(logger, "compiling JSON schema {}", schema);
            json_schema_to_grammar(schema, options, max_size)
        })
        .map_err(GrammarError::schema)
    }

    /// Grammar for any JSON value.
    pub fn compile_builtin_json(&self) -> Result<CompiledGrammar, GrammarError> {
        self.compile_json_schema_value(&Value::Bool(true), &JsonCompileOptions::default())
    }

    pub fn compile_structural_tag(&self, tag_json: &str) -> Result<CompiledGrammar, GrammarError> {
        let tag = parse_structural_tag(tag_json).map_err(GrammarError::structural_tag)?;
        self.compile_structural_tag_value(&tag)
    }

    pub fn compile_structural_tag_value(
        &self,
        tag: &StructuralTag,
    ) -> Result<CompiledGrammar, GrammarError> {
        let key = format!(
            "tag:{}",
            serde_json::to_string(tag).map_err(|e| GrammarError::structural_tag(e.into()))?
        );
        let max_size = self.limits.max_grammar_size;
        self.cached(key, |logger| {
            loginfo!(
                logger,
                "compiling structural tag with {} structures, triggers {:?}",
                tag.structures.len(),
                tag.triggers
            );
            structural_tag_to_grammar(tag, max_size)
        })
        .map_err(GrammarError::structural_tag)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{ErrorKind, VocabType, Vocabulary};

    fn compiler() -> GrammarCompiler {
        let vocab = Vocabulary::new(&["a", "b", "<eos>"], VocabType::Raw, &[2]).unwrap();
        let mut c = GrammarCompiler::new(&Arc::new(vocab));
        c.quiet();
        c
    }

    #[test]
    fn caches_by_source_and_options() {
        let c = compiler();
        let g1 = c
            .compile_json_schema(r#"{"type":"string"}"#, &JsonCompileOptions::default())
            .unwrap();
        let g2 = c
            .compile_json_schema(r#"{"type":"string"}"#, &JsonCompileOptions::default())
            .unwrap();
        assert!(Arc::ptr_eq(g1.grammar(), g2.grammar()));
        let g3 = c
            .compile_json_schema(r#"{"type":"string"}"#, &JsonCompileOptions::indented(2))
            .unwrap();
        assert!(!Arc::ptr_eq(g1.grammar(), g3.grammar()));
        c.clear_cache();
        let g4 = c
            .compile_json_schema(r#"{"type":"string"}"#, &JsonCompileOptions::default())
            .unwrap();
        assert!(!Arc::ptr_eq(g1.grammar(), g4.grammar()));
    }

    #[test]
    fn cache_key_includes_limits() {
        let mut c = compiler();
        let schema = r#"{"type":"string"}"#;
        let g1 = c.compile_json_schema(schema, &JsonCompileOptions::default()).unwrap();
        c.limits_mut().max_forced_bytes = 7;
        let g2 = c.compile_json_schema(schema, &JsonCompileOptions::default()).unwrap();
        assert!(!Arc::ptr_eq(g1.grammar(), g2.grammar()));
        assert_eq!(g2.limits().max_forced_bytes, 7);
        assert_eq!(g1.limits().max_forced_bytes, 1024);
    }

    #[test]
    fn cache_is_bounded() {
        let c = compiler();
        for n in 0..MAX_CACHED_GRAMMARS + 5 {
            let schema = format!(r#"{{"const":{}}}"#, n);
            c.compile_json_schema(&schema, &JsonCompileOptions::default())
                .unwrap();
            assert!(c.num_cached() <= MAX_CACHED_GRAMMARS);
        }
        assert_eq!(c.num_cached(), 5);

        let mut c = compiler();
        c.set_cache_enabled(false);
        let g1 = c.compile_builtin_json().unwrap();
        let g2 = c.compile_builtin_json().unwrap();
        assert!(!Arc::ptr_eq(g1.grammar(), g2.grammar()));
        assert_eq!(c.num_cached(), 0);
    }

    #[test]
    fn error_kinds() {
        let c = compiler();
        let e = c
            .compile_json_schema(r#"{"type":"banana"}"#, &JsonCompileOptions::default())
            .unwrap_err();
        assert_eq!(e.kind(), ErrorKind::SchemaCompile);
        assert!(e.message().contains("banana"));

        let e = c
            .compile_json_schema("{not json", &JsonCompileOptions::default())
            .unwrap_err();
        assert_eq!(e.kind(), ErrorKind::SchemaCompile);

        let e = c.compile_structural_tag(r#"{"type": "structural_tag", "triggers": [""]}"#).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::StructuralTagCompile);
    }

    #[test]
    fn grammar_size_limit() {
        let mut c = compiler();
        c.limits_mut().max_grammar_size = 50;
        let e = c
            .compile_json_schema(
                r#"{"type":"string","format":"date-time"}"#,
                &JsonCompileOptions::default(),
            )
            .unwrap_err();
        assert!(e.message().contains("too large"), "{}", e);
    }
}
