use std::{fmt::Debug, sync::Arc};

use anyhow::{anyhow, bail, Result};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use toktrie::{Recognizer, SimpleVob, TokRxInfo, TokTrie, TokenId};

use crate::GrammarError;

/// How vocabulary entries encode token bytes. The numeric values are
/// part of the C ABI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(C)]
pub enum VocabType {
    /// Entries are the token bytes.
    #[default]
    Raw = 0,
    /// SentencePiece style: `<0xHH>` byte tokens, `▁` for space.
    ByteFallback = 1,
    /// GPT-2 style byte-to-unicode mapping.
    ByteLevel = 2,
}

impl VocabType {
    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            0 => Some(VocabType::Raw),
            1 => Some(VocabType::ByteFallback),
            2 => Some(VocabType::ByteLevel),
            _ => None,
        }
    }
}

/// Turns one vocabulary entry into token bytes.
pub trait TokenDecoder {
    fn decode(&self, entry: &[u8]) -> Result<Vec<u8>>;
}

pub struct RawDecoder;

impl TokenDecoder for RawDecoder {
    fn decode(&self, entry: &[u8]) -> Result<Vec<u8>> {
        Ok(entry.to_vec())
    }
}

pub struct ByteFallbackDecoder;

const SPM_SPACE: char = '\u{2581}';

impl TokenDecoder for ByteFallbackDecoder {
    fn decode(&self, entry: &[u8]) -> Result<Vec<u8>> {
        let s = std::str::from_utf8(entry).map_err(|_| anyhow!("entry is not valid UTF-8"))?;
        if s.starts_with("<0x") && s.ends_with('>') {
            if s.len() != 6 {
                bail!("malformed byte token");
            }
            let byte =
                u8::from_str_radix(&s[3..5], 16).map_err(|_| anyhow!("malformed byte token"))?;
            return Ok(vec![byte]);
        }
        Ok(s.replace(SPM_SPACE, " ").into_bytes())
    }
}

pub struct ByteLevelDecoder {
    char_map: FxHashMap<char, u8>,
}

// https://github.com/openai/gpt-2/blob/master/src/encoder.py bytes_to_unicode()
fn is_self_mapped(c: char) -> bool {
    matches!(c, '!'..='~' | '\u{00A1}'..='\u{00AC}' | '\u{00AE}'..='\u{00FF}')
}

impl ByteLevelDecoder {
    pub fn new() -> Self {
        let mut char_map = FxHashMap::default();
        let mut k = 0x100u32;
        for byte in 0..=255u8 {
            let c = byte as char;
            if is_self_mapped(c) {
                char_map.insert(c, byte);
            } else {
                if let Some(mapped) = char::from_u32(k) {
                    char_map.insert(mapped, byte);
                }
                k += 1;
            }
        }
        ByteLevelDecoder { char_map }
    }
}

impl Default for ByteLevelDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenDecoder for ByteLevelDecoder {
    fn decode(&self, entry: &[u8]) -> Result<Vec<u8>> {
        let s = std::str::from_utf8(entry).map_err(|_| anyhow!("entry is not valid UTF-8"))?;
        s.chars()
            .map(|c| {
                self.char_map
                    .get(&c)
                    .copied()
                    .ok_or_else(|| anyhow!("character {:?} is not in the byte-level map", c))
            })
            .collect()
    }
}

pub fn decoder_for(vocab_type: VocabType) -> Box<dyn TokenDecoder> {
    match vocab_type {
        VocabType::Raw => Box::new(RawDecoder),
        VocabType::ByteFallback => Box::new(ByteFallbackDecoder),
        VocabType::ByteLevel => Box::new(ByteLevelDecoder::new()),
    }
}

/// Everything needed to build a [`Vocabulary`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VocabInit {
    /// Encoded entries, indexed by token id.
    pub tokens: Vec<Vec<u8>>,
    pub vocab_type: VocabType,
    /// Model vocabulary size; ids past `tokens.len()` are padding.
    pub vocab_size: Option<usize>,
    pub stop_tokens: Vec<TokenId>,
    /// Control tokens: never allowed by the grammar.
    pub special_tokens: Vec<TokenId>,
    /// Entries taken as bytes without decoding (added tokens).
    pub literal_tokens: Vec<TokenId>,
}

const FLAG_STOP: u8 = 1;
const FLAG_SPECIAL: u8 = 2;

// token lengths are stored in a byte inside the trie
const MAX_TOKEN_LEN: usize = 0xfe;

/// Immutable token id to bytes table, shared by compiled grammars and
/// matchers.
pub struct Vocabulary {
    vocab_type: VocabType,
    token_data: Vec<u8>,
    token_offsets: Vec<u32>,
    flags: Vec<u8>,
    stop_tokens: Vec<TokenId>,
    trie: TokTrie,
    // first token for every distinct byte string the grammar can produce
    by_bytes: FxHashMap<Vec<u8>, TokenId>,
    // later tokens with the same bytes, keyed by the one in the trie
    duplicates: FxHashMap<TokenId, Vec<TokenId>>,
    max_token_len: usize,
}

pub type VocabRef = Arc<Vocabulary>;

impl Vocabulary {
    pub fn new<S: AsRef<[u8]>>(
        entries: &[S],
        vocab_type: VocabType,
        stop_tokens: &[TokenId],
    ) -> Result<Self, GrammarError> {
        Self::from_init(VocabInit {
            tokens: entries.iter().map(|e| e.as_ref().to_vec()).collect(),
            vocab_type,
            stop_tokens: stop_tokens.to_vec(),
            ..VocabInit::default()
        })
    }

    pub fn from_init(init: VocabInit) -> Result<Self, GrammarError> {
        Self::build(init).map_err(|e| GrammarError::InvalidVocabulary(format!("{e:#}")))
    }

    fn build(init: VocabInit) -> Result<Self> {
        let vocab_size = init.vocab_size.unwrap_or(init.tokens.len());
        if init.tokens.len() > vocab_size {
            bail!(
                "{} entries supplied for vocab_size {}",
                init.tokens.len(),
                vocab_size
            );
        }

        let mut flags = vec![0u8; vocab_size];
        let mut check_id = |id: TokenId, what: &str, flag: u8| -> Result<()> {
            match flags.get_mut(id as usize) {
                Some(f) => {
                    *f |= flag;
                    Ok(())
                }
                None => bail!("{} token {} out of range (vocab_size {})", what, id, vocab_size),
            }
        };
        for &id in &init.stop_tokens {
            check_id(id, "stop", FLAG_STOP)?;
        }
        for &id in &init.special_tokens {
            check_id(id, "special", FLAG_SPECIAL)?;
        }
        let mut literal = vec![false; vocab_size];
        for &id in &init.literal_tokens {
            match literal.get_mut(id as usize) {
                Some(l) => *l = true,
                None => bail!("literal token {} out of range", id),
            }
        }

        let decoder = decoder_for(init.vocab_type);
        let mut token_data = vec![];
        let mut token_offsets = Vec::with_capacity(vocab_size + 1);
        token_offsets.push(0u32);
        for id in 0..vocab_size {
            if let Some(entry) = init.tokens.get(id) {
                if flags[id] != 0 || literal[id] {
                    token_data.extend_from_slice(entry);
                } else {
                    let bytes = decoder.decode(entry).map_err(|e| {
                        anyhow!(
                            "token {} ({:?}) is not a valid {:?} entry: {}",
                            id,
                            String::from_utf8_lossy(entry),
                            init.vocab_type,
                            e
                        )
                    })?;
                    token_data.extend_from_slice(&bytes);
                }
            }
            token_offsets.push(token_data.len() as u32);
            if token_offsets[id] == token_offsets[id + 1] {
                flags[id] |= FLAG_SPECIAL;
            }
        }

        let mut by_bytes: FxHashMap<Vec<u8>, TokenId> = FxHashMap::default();
        let mut duplicates: FxHashMap<TokenId, Vec<TokenId>> = FxHashMap::default();
        let mut max_token_len = 0;
        let mut words = Vec::with_capacity(vocab_size);
        for id in 0..vocab_size {
            let bytes = &token_data[token_offsets[id] as usize..token_offsets[id + 1] as usize];
            if flags[id] != 0 {
                words.push(vec![]);
                continue;
            }
            if bytes.len() > MAX_TOKEN_LEN {
                bail!(
                    "token {} is {} bytes long; at most {} supported",
                    id,
                    bytes.len(),
                    MAX_TOKEN_LEN
                );
            }
            match by_bytes.get(bytes) {
                Some(&first) => {
                    duplicates.entry(first).or_default().push(id as TokenId);
                    words.push(vec![]);
                }
                None => {
                    by_bytes.insert(bytes.to_vec(), id as TokenId);
                    max_token_len = std::cmp::max(max_token_len, bytes.len());
                    words.push(bytes.to_vec());
                }
            }
        }

        let mut stop_tokens = init.stop_tokens.clone();
        stop_tokens.sort_unstable();
        stop_tokens.dedup();

        let tok_eos = stop_tokens.first().copied().unwrap_or(0);
        let trie = TokTrie::from(&TokRxInfo::new(vocab_size as u32, tok_eos), &words);

        Ok(Vocabulary {
            vocab_type: init.vocab_type,
            token_data,
            token_offsets,
            flags,
            stop_tokens,
            trie,
            by_bytes,
            duplicates,
            max_token_len,
        })
    }

    pub fn vocab_type(&self) -> VocabType {
        self.vocab_type
    }

    pub fn vocab_size(&self) -> usize {
        self.flags.len()
    }

    #[inline(always)]
    pub fn token_bytes(&self, id: TokenId) -> &[u8] {
        let id = id as usize;
        &self.token_data[self.token_offsets[id] as usize..self.token_offsets[id + 1] as usize]
    }

    pub fn is_stop_token(&self, id: TokenId) -> bool {
        self.flags.get(id as usize).map_or(false, |f| f & FLAG_STOP != 0)
    }

    /// Stop tokens are reported as special only if also flagged so.
    pub fn is_special_token(&self, id: TokenId) -> bool {
        self.flags
            .get(id as usize)
            .map_or(false, |f| f & FLAG_SPECIAL != 0 && f & FLAG_STOP == 0)
    }

    pub fn stop_tokens(&self) -> &[TokenId] {
        &self.stop_tokens
    }

    pub fn iter(&self) -> impl Iterator<Item = (TokenId, &[u8])> + '_ {
        (0..self.vocab_size()).map(move |id| (id as TokenId, self.token_bytes(id as TokenId)))
    }

    /// Trie over the tokens the grammar can produce; stop, special and
    /// duplicate tokens are left out.
    pub fn tok_trie(&self) -> &TokTrie {
        &self.trie
    }

    pub fn alloc_token_set(&self) -> SimpleVob {
        self.trie.alloc_token_set()
    }

    /// Allow in `set` every token whose bytes `r` accepts from its current
    /// state.
    pub fn add_bias(&self, r: &mut impl Recognizer, set: &mut SimpleVob) {
        self.trie.add_bias(r, set, &[]);
        for (tok, dups) in &self.duplicates {
            if set.is_allowed(*tok) {
                for d in dups {
                    set.allow_token(*d);
                }
            }
        }
    }

    /// The (first) non-special token with exactly these bytes.
    pub fn token_id(&self, bytes: &[u8]) -> Option<TokenId> {
        self.by_bytes.get(bytes).copied()
    }

    /// Longest-match tokenization; fails on bytes no token starts with.
    pub fn greedy_tokenize(&self, bytes: &[u8]) -> Result<Vec<TokenId>> {
        let mut res = vec![];
        let mut pos = 0;
        while pos < bytes.len() {
            let max_len = std::cmp::min(self.max_token_len, bytes.len() - pos);
            let found = (1..=max_len)
                .rev()
                .find_map(|len| self.token_id(&bytes[pos..pos + len]).map(|t| (t, len)));
            match found {
                Some((tok, len)) => {
                    res.push(tok);
                    pos += len;
                }
                None => bail!(
                    "no token matches {:?} at offset {}",
                    String::from_utf8_lossy(&bytes[pos..]),
                    pos
                ),
            }
        }
        Ok(res)
    }

    pub fn token_dbg(&self, id: TokenId) -> String {
        if id as usize >= self.vocab_size() {
            return format!("<[{}]?>", id);
        }
        let bytes = self.token_bytes(id);
        if self.flags[id as usize] != 0 {
            if bytes.is_empty() {
                format!("<[{}]>", id)
            } else {
                format!("<[{}]{}>", id, String::from_utf8_lossy(bytes))
            }
        } else {
            format!("{:?}", String::from_utf8_lossy(bytes))
        }
    }

    pub fn tokens_dbg(&self, ids: &[TokenId]) -> String {
        ids.iter()
            .map(|id| self.token_dbg(*id))
            .collect::<Vec<_>>()
            .join("‧")
    }
}

impl Debug for Vocabulary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Vocabulary({:?}, {} tokens, stop: {:?})",
            self.vocab_type,
            self.vocab_size(),
            self.stop_tokens
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ErrorKind;

    #[test]
    fn byte_fallback() {
        let v = Vocabulary::new(
            &["<0x0A>", "\u{2581}the", "<s>", "</s>", "a"],
            VocabType::ByteFallback,
            &[3],
        )
        .unwrap();
        assert_eq!(v.token_bytes(0), b"\n");
        assert_eq!(v.token_bytes(1), b" the");
        assert!(v.is_stop_token(3));
        assert!(!v.is_special_token(3));
        assert_eq!(v.token_id(b"a"), Some(4));
        assert_eq!(v.token_id(b"</s>"), None);

        let err = Vocabulary::new(&["<0xZZ>"], VocabType::ByteFallback, &[]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidVocabulary);
    }

    #[test]
    fn byte_level() {
        // 'Ġ' is space, 'Ċ' is newline
        let v = Vocabulary::new(&["Ġhello", "Ċ", "é"], VocabType::ByteLevel, &[]).unwrap();
        assert_eq!(v.token_bytes(0), b" hello");
        assert_eq!(v.token_bytes(1), b"\n");
        assert_eq!(v.token_bytes(2), &[0xE9]);
        assert!(Vocabulary::new(&["\u{4e2d}"], VocabType::ByteLevel, &[]).is_err());
    }

    #[test]
    fn padding_and_ranges() {
        let v = Vocabulary::from_init(VocabInit {
            tokens: vec![b"x".to_vec(), b"".to_vec(), b"<|tool|>".to_vec()],
            vocab_size: Some(40),
            stop_tokens: vec![39],
            special_tokens: vec![2],
            ..VocabInit::default()
        })
        .unwrap();
        assert_eq!(v.vocab_size(), 40);
        assert!(v.is_special_token(1));
        assert!(v.is_special_token(2));
        assert!(v.is_special_token(20));
        assert!(v.is_stop_token(39));
        assert_eq!(v.token_id(b"x"), Some(0));
        assert_eq!(v.token_id(b"<|tool|>"), None);
        assert_eq!(v.token_dbg(2), "<[2]<|tool|>>");
        assert_eq!(v.tokens_dbg(&[0, 0]), "\"x\"‧\"x\"");

        let err = Vocabulary::new(&["a"], VocabType::Raw, &[5]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidVocabulary);
        let err = Vocabulary::from_init(VocabInit {
            tokens: vec![b"a".to_vec(), b"b".to_vec()],
            vocab_size: Some(1),
            ..VocabInit::default()
        })
        .unwrap_err();
        assert!(err.message().contains("vocab_size 1"));
    }

    // accepts prefixes of a fixed string
    struct PrefixOf {
        target: Vec<u8>,
        pos: usize,
        start: usize,
    }

    impl Recognizer for PrefixOf {
        fn pop_bytes(&mut self, num: usize) {
            self.pos -= num;
        }

        fn collapse(&mut self) {}

        fn special_allowed(&mut self, _tok: toktrie::SpecialToken) -> bool {
            false
        }

        fn trie_started(&mut self) {
            self.start = self.pos;
        }

        fn trie_finished(&mut self) {
            self.pos = self.start;
        }

        fn try_push_byte(&mut self, byte: u8) -> bool {
            if self.target.get(self.pos) == Some(&byte) {
                self.pos += 1;
                true
            } else {
                false
            }
        }
    }

    #[test]
    fn bias_and_duplicates() {
        let v = Vocabulary::new(
            &["h", "he", "hel", "x", "lo", "hello", "he", "<eos>", "hex"],
            VocabType::Raw,
            &[7],
        )
        .unwrap();
        assert_eq!(v.token_id(b"he"), Some(1));
        let mut r = PrefixOf {
            target: b"hello".to_vec(),
            pos: 0,
            start: 0,
        };
        let mut set = v.alloc_token_set();
        v.add_bias(&mut r, &mut set);
        assert_eq!(r.pos, 0);
        let allowed: Vec<TokenId> = (0..9).filter(|t| set.is_allowed(*t)).collect();
        assert_eq!(allowed, vec![0, 1, 2, 5, 6]);
    }

    #[test]
    fn greedy_tokenize() {
        let v = Vocabulary::new(&["h", "hel", "hello", "x", "lo", "hex"], VocabType::Raw, &[])
            .unwrap();
        assert_eq!(v.greedy_tokenize(b"hellox").unwrap(), vec![2, 3]);
        assert_eq!(v.greedy_tokenize(b"hexlo").unwrap(), vec![5, 4]);
        assert!(v.greedy_tokenize(b"q").is_err());
        let long = "y".repeat(300);
        assert!(Vocabulary::new(&[long.as_str()], VocabType::Raw, &[]).is_err());
    }
}
