use grammask::{
    CompiledGrammar, GrammarCompiler, GrammarMatcher, JsonCompileOptions, MatcherState,
    TokenId, VocabInit, VocabRef, VocabType, Vocabulary,
};
use lazy_static::lazy_static;
use serde_json::Value;
use std::sync::Arc;

/// Multi-byte tokens of the test vocabulary; every single byte is a token
/// as well, so any string can be tokenized.
const MULTI_BYTE_TOKENS: &[&str] = &[
    "{\"", "\":", "\": ", "\",", ", ", "\"}", "true", "false", "null", "  ", "    ",
    ",\n", "12", "00", "{}", "[]", "<fn=", "</fn>", "<tool>", "</tool>", "hello", " world",
    "abc", "name", "\"name\"",
];

pub const EOS: &str = "<|eos|>";
pub const PAD: &str = "<|pad|>";

lazy_static! {
    static ref VOCAB: VocabRef = {
        let mut tokens: Vec<Vec<u8>> = (0..=255u8).map(|b| vec![b]).collect();
        tokens.extend(MULTI_BYTE_TOKENS.iter().map(|s| s.as_bytes().to_vec()));
        let eos = tokens.len() as TokenId;
        tokens.push(EOS.as_bytes().to_vec());
        tokens.push(PAD.as_bytes().to_vec());
        let vocab = Vocabulary::from_init(VocabInit {
            tokens,
            vocab_type: VocabType::Raw,
            stop_tokens: vec![eos],
            special_tokens: vec![eos + 1],
            ..VocabInit::default()
        })
        .unwrap();
        Arc::new(vocab)
    };
}

pub fn test_vocab() -> VocabRef {
    VOCAB.clone()
}

pub fn eos_token() -> TokenId {
    VOCAB.stop_tokens()[0]
}

pub fn pad_token() -> TokenId {
    eos_token() + 1
}

pub fn compiler() -> GrammarCompiler {
    let mut c = GrammarCompiler::new(&VOCAB);
    c.quiet();
    c
}

pub fn tokenize(s: &str) -> Vec<TokenId> {
    VOCAB.greedy_tokenize(s.as_bytes()).unwrap()
}

/// Checks that the mask allows exactly the tokens `accept_token()` takes.
pub fn check_exact_mask(m: &mut GrammarMatcher) {
    let mask = m.compute_mask().unwrap();
    for tok in 0..VOCAB.vocab_size() as TokenId {
        let mut m2 = m.clone();
        let ok = m2.accept_token(tok).is_ok();
        assert_eq!(
            mask.is_allowed(tok),
            ok,
            "mask/accept mismatch for {} after {:?}",
            VOCAB.token_dbg(tok),
            String::from_utf8_lossy(m.accepted_bytes())
        );
    }
}

/// Feeds `tokens` checking masks along the way. Returns the index of the
/// first rejected token, if any.
pub fn run_tokens(m: &mut GrammarMatcher, tokens: &[TokenId]) -> Option<usize> {
    for (idx, &tok) in tokens.iter().enumerate() {
        check_exact_mask(m);
        if m.accept_token(tok).is_err() {
            assert_eq!(m.state(), MatcherState::Rejected);
            return Some(idx);
        }
    }
    None
}

/// Whether `s` followed by the stop token is accepted.
pub fn matches(g: &CompiledGrammar, s: &str) -> bool {
    let mut m = GrammarMatcher::new(g).unwrap();
    let mut tokens = tokenize(s);
    tokens.push(eos_token());
    let r = run_tokens(&mut m, &tokens);
    if r.is_none() {
        assert_eq!(m.state(), MatcherState::Complete);
    }
    r.is_none()
}

pub fn check_grammar(g: &CompiledGrammar, passing: &[&str], failing: &[&str]) {
    for s in passing {
        assert!(matches(g, s), "should accept {:?}", s);
    }
    for s in failing {
        assert!(!matches(g, s), "should reject {:?}", s);
    }
}

pub fn json_grammar(schema: &Value, options: &JsonCompileOptions) -> CompiledGrammar {
    println!("\nChecking schema:\n{}", serde_json::to_string_pretty(schema).unwrap());
    compiler()
        .compile_json_schema_value(schema, options)
        .unwrap()
}

pub fn check_schema(schema: &Value, passing: &[&str], failing: &[&str]) {
    check_schema_with(schema, &JsonCompileOptions::default(), passing, failing)
}

pub fn check_schema_with(
    schema: &Value,
    options: &JsonCompileOptions,
    passing: &[&str],
    failing: &[&str],
) {
    let g = json_grammar(schema, options);
    check_grammar(&g, passing, failing);
}

pub fn schema_error(schema: &Value) -> String {
    match compiler().compile_json_schema_value(schema, &JsonCompileOptions::default()) {
        Ok(_) => panic!("schema should not compile: {}", schema),
        Err(e) => e.to_string(),
    }
}

pub fn check_structural_tag(tag: &Value, passing: &[&str], failing: &[&str]) {
    let g = compiler().compile_structural_tag(&tag.to_string()).unwrap();
    check_grammar(&g, passing, failing);
}

/// Loads the vocabulary of a Hugging Face `tokenizer.json`, with
/// `tokenizer_config.json` from the same directory when present.
pub fn vocab_from_file(path: &str) -> anyhow::Result<VocabRef> {
    let init = grammask::hf_tokenizer::vocab_from_file(path)?;
    Ok(Arc::new(Vocabulary::from_init(init)?))
}
