use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Resource limits for compilation and matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(C)]
#[serde(default)]
pub struct MatcherLimits {
    /// Maximum number of Earley items in a single row; exceeding it while
    /// accepting a token is a `ResourceLimit` error, while computing a mask
    /// the offending byte is treated as not allowed.
    pub max_items_in_row: usize,
    /// Maximum grammar size (symbols plus rule elements) after compilation.
    pub max_grammar_size: usize,
    /// Maximum length of the string returned by `compute_forced_bytes()`.
    pub max_forced_bytes: usize,
    /// Token masks memoized per compiled grammar, keyed by Earley
    /// frontier; 0 disables the cache.
    pub max_cached_masks: usize,
}

impl Default for MatcherLimits {
    fn default() -> Self {
        Self {
            max_items_in_row: 10_000,
            max_grammar_size: 500_000,
            max_forced_bytes: 1024,
            max_cached_masks: 1024,
        }
    }
}

/// What `fill_next_token_bitmask()` reports once a stop token was accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EndOfGrammarPolicy {
    /// Only the stop tokens are marked valid.
    #[default]
    StopTokensOnly,
    /// No token is marked valid.
    Empty,
}

/// Free text interleaved with tagged JSON segments.
///
/// ```json
/// {"type": "structural_tag",
///  "structures": [{"begin": "<fn=get_weather>", "schema": {...}, "end": "</fn>"}],
///  "triggers": ["<fn="]}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StructuralTag {
    #[serde(rename = "type")]
    pub tag_type: String,
    #[serde(default)]
    pub structures: Vec<StructuralTagItem>,
    #[serde(default)]
    pub triggers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StructuralTagItem {
    pub begin: String,
    pub schema: Value,
    pub end: String,
}

impl StructuralTag {
    pub const TYPE: &'static str = "structural_tag";

    pub fn new(structures: Vec<StructuralTagItem>, triggers: Vec<String>) -> Self {
        StructuralTag {
            tag_type: Self::TYPE.to_string(),
            structures,
            triggers,
        }
    }
}

impl StructuralTagItem {
    pub fn new(begin: &str, schema: Value, end: &str) -> Self {
        StructuralTagItem {
            begin: begin.to_string(),
            schema,
            end: end.to_string(),
        }
    }
}
