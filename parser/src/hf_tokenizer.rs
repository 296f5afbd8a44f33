//! Vocabulary extraction from Hugging Face tokenizers.

use std::str::FromStr;

use anyhow::{anyhow, bail, Result};
use serde_json::Value;
use tokenizers::Tokenizer;
use toktrie::TokenId;

use crate::vocab::{VocabInit, VocabType};

const EOS_NAMES: &[&str] = &[
    "</s>",
    "<|endoftext|>",
    "<|end_of_text|>",
    "<|end|>",
    "<|eot_id|>",
    "<|im_end|>",
];

/// Determine the entry encoding from the decoder. `DecoderWrapper` does not
/// expose the members of a sequence, so this goes through its JSON form.
pub fn detect_vocab_type(tok: &Tokenizer) -> Result<VocabType> {
    let decoder = match tok.get_decoder() {
        Some(d) => serde_json::to_value(d)?,
        None => return Ok(VocabType::Raw),
    };
    let vocab_type = match decoder["type"].as_str() {
        Some("ByteLevel") => VocabType::ByteLevel,
        Some("ByteFallback") => VocabType::ByteFallback,
        Some("Sequence") => {
            let decoders = decoder["decoders"].as_array();
            let has = |name: &str| {
                decoders.map_or(false, |d| d.iter().any(|d| d["type"].as_str() == Some(name)))
            };
            if has("ByteFallback") {
                VocabType::ByteFallback
            } else if has("ByteLevel") {
                VocabType::ByteLevel
            } else {
                VocabType::Raw
            }
        }
        _ => VocabType::Raw,
    };
    Ok(vocab_type)
}

fn eos_from_config(config: &Value) -> Option<String> {
    match &config["eos_token"] {
        Value::String(s) => Some(s.clone()),
        Value::Object(o) => o.get("content").and_then(|c| c.as_str()).map(|s| s.to_string()),
        _ => None,
    }
}

/// Build a [`VocabInit`] from a loaded tokenizer and optionally the parsed
/// `tokenizer_config.json`. Stop tokens are the configured `eos_token` (or
/// well-known end-of-text names when there is no config) plus any added
/// token named in `extra_eos`.
pub fn vocab_from_tokenizer(
    tok: &Tokenizer,
    tokenizer_config: Option<&Value>,
    extra_eos: &[&str],
) -> Result<VocabInit> {
    let vocab_type = detect_vocab_type(tok)?;
    let max_id = tok.get_vocab(true).values().copied().max();
    let vocab_size = tok
        .get_vocab_size(true)
        .max(max_id.map_or(0, |id| id as usize + 1));
    let added = tok.get_added_tokens_decoder();

    let mut tokens = vec![vec![]; vocab_size];
    for id in 0..vocab_size as TokenId {
        if let Some(name) = tok.id_to_token(id) {
            tokens[id as usize] = name.into_bytes();
        }
    }

    let mut eos_names: Vec<String> = match tokenizer_config.and_then(eos_from_config) {
        Some(name) => vec![name],
        None => EOS_NAMES.iter().map(|s| s.to_string()).collect(),
    };
    eos_names.extend(extra_eos.iter().map(|s| s.to_string()));

    let mut stop_tokens = vec![];
    let mut special_tokens = vec![];
    let mut literal_tokens = vec![];
    for (&id, info) in added.iter() {
        if id as usize >= vocab_size {
            bail!("added token {:?} has id {} past the vocabulary", info.content, id);
        }
        tokens[id as usize] = info.content.clone().into_bytes();
        if eos_names.contains(&info.content) {
            stop_tokens.push(id);
        } else if info.special {
            special_tokens.push(id);
        } else {
            literal_tokens.push(id);
        }
    }
    stop_tokens.sort_unstable();
    special_tokens.sort_unstable();
    literal_tokens.sort_unstable();
    if stop_tokens.is_empty() {
        bail!("no end-of-sequence token found among {:?}", eos_names);
    }

    Ok(VocabInit {
        tokens,
        vocab_type,
        vocab_size: Some(vocab_size),
        stop_tokens,
        special_tokens,
        literal_tokens,
    })
}

/// [`vocab_from_tokenizer()`] for the contents of a `tokenizer.json`.
pub fn vocab_from_tokenizer_json(
    tokenizer_json: &str,
    tokenizer_config: Option<&Value>,
    extra_eos: &[&str],
) -> Result<VocabInit> {
    let tok = Tokenizer::from_str(tokenizer_json)
        .map_err(|e| anyhow!("error loading tokenizer: {}", e))?;
    vocab_from_tokenizer(&tok, tokenizer_config, extra_eos)
}

/// Loads `tokenizer.json` at `path`, with `tokenizer_config.json` from the
/// same directory when present.
pub fn vocab_from_file(path: &str) -> Result<VocabInit> {
    let tok = Tokenizer::from_file(path).map_err(|e| anyhow!("error loading tokenizer: {}", e))?;
    let config_path = std::path::Path::new(path).with_file_name("tokenizer_config.json");
    let config: Option<Value> = match std::fs::read_to_string(config_path) {
        Ok(s) => Some(serde_json::from_str(&s)?),
        Err(_) => None,
    };
    vocab_from_tokenizer(&tok, config.as_ref(), &[])
}
