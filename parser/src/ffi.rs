use std::{
    cell::RefCell,
    ffi::{c_char, c_int, c_void, CStr, CString},
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex},
};

use lazy_static::lazy_static;

use crate::{
    panic_utils, CompiledGrammar, GrammarCompiler, GrammarError, GrammarMatcher,
    JsonCompileOptions, MatcherState, TokenId, VocabInit, VocabType, Vocabulary,
};

/// Receives a NUL-terminated, human-readable error message. The pointer is
/// only valid for the duration of the call.
pub type ErrorHandler = extern "C" fn(message: *const c_char);

lazy_static! {
    static ref ERROR_HANDLER: Mutex<Option<ErrorHandler>> = Mutex::new(None);
}

thread_local! {
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

fn report_error(msg: &str) {
    let msg = CString::new(msg.replace('\0', "\\0")).unwrap_or_default();
    let handler = ERROR_HANDLER.lock().ok().and_then(|h| *h);
    if let Some(handler) = handler {
        handler(msg.as_ptr());
    }
    LAST_ERROR.with(|e| *e.borrow_mut() = Some(msg));
}

/// Runs `f`, turning errors and panics into a report plus `default`.
fn ffi_call<R>(default: R, f: impl FnOnce() -> Result<R, GrammarError>) -> R {
    match panic_utils::catch_unwind(AssertUnwindSafe(f)) {
        Ok(r) => r,
        Err(msg) => {
            report_error(&msg);
            default
        }
    }
}

fn deref<'a, T>(ptr: *const T, what: &str) -> Result<&'a T, GrammarError> {
    unsafe { ptr.as_ref() }
        .ok_or_else(|| GrammarError::InvalidVocabulary(format!("null {} handle", what)))
}

fn deref_mut<'a, T>(ptr: *mut T, what: &str) -> Result<&'a mut T, GrammarError> {
    unsafe { ptr.as_mut() }
        .ok_or_else(|| GrammarError::InvalidVocabulary(format!("null {} handle", what)))
}

fn stop_token_ids(ptr: *const i32, len: usize) -> Result<Vec<TokenId>, GrammarError> {
    if len == 0 {
        return Ok(vec![]);
    }
    if ptr.is_null() {
        return Err(GrammarError::InvalidVocabulary(
            "null stop token array".to_string(),
        ));
    }
    let ids = unsafe { std::slice::from_raw_parts(ptr, len) };
    ids.iter()
        .map(|&id| {
            TokenId::try_from(id).map_err(|_| {
                GrammarError::InvalidVocabulary(format!("negative stop token id {}", id))
            })
        })
        .collect()
}

fn vocab_type(v: c_int) -> Result<VocabType, GrammarError> {
    VocabType::from_i32(v)
        .ok_or_else(|| GrammarError::InvalidVocabulary(format!("unknown vocab_type {}", v)))
}

/// A vocabulary together with the compiler (and compile cache) bound to it.
pub struct CTokenizerInfo {
    compiler: GrammarCompiler,
}

impl CTokenizerInfo {
    fn new(vocab: Vocabulary) -> Self {
        CTokenizerInfo {
            compiler: GrammarCompiler::new(&Arc::new(vocab)),
        }
    }
}

pub struct CCompiledGrammar {
    grammar: CompiledGrammar,
}

pub struct CGrammarMatcher {
    matcher: GrammarMatcher,
}

#[repr(C)]
pub struct TokenizerInit {
    /// The number of token ids; may exceed the number of entries.
    pub vocab_size: u32,

    /// How many entries `token_lens` describes.
    pub num_entries: u32,

    /// Lengths of the encoded entries (`num_entries` elements).
    pub token_lens: *const u32,

    /// All entries concatenated; entries may contain NUL and invalid UTF-8.
    pub token_bytes: *const u8,

    /// 0 - raw, 1 - byte fallback, 2 - byte level.
    pub vocab_type: c_int,

    pub stop_tokens: *const i32,
    pub num_stop_tokens: usize,
}

impl TokenizerInit {
    fn to_vocab_init(&self) -> Result<VocabInit, GrammarError> {
        let n = self.num_entries as usize;
        if n > 0 && (self.token_lens.is_null() || self.token_bytes.is_null()) {
            return Err(GrammarError::InvalidVocabulary(
                "null token_lens or token_bytes".to_string(),
            ));
        }
        let lens: &[u32] = if n == 0 {
            &[]
        } else {
            unsafe { std::slice::from_raw_parts(self.token_lens, n) }
        };
        let total: usize = lens.iter().map(|&l| l as usize).sum();
        let data: &[u8] = if total == 0 {
            &[]
        } else {
            unsafe { std::slice::from_raw_parts(self.token_bytes, total) }
        };

        let mut tokens = Vec::with_capacity(n);
        let mut ptr = 0;
        for &len in lens {
            tokens.push(data[ptr..ptr + len as usize].to_vec());
            ptr += len as usize;
        }
        Ok(VocabInit {
            tokens,
            vocab_type: vocab_type(self.vocab_type)?,
            vocab_size: Some(self.vocab_size as usize),
            stop_tokens: stop_token_ids(self.stop_tokens, self.num_stop_tokens)?,
            ..VocabInit::default()
        })
    }
}

pub const K_DL_CPU: i32 = 1;
pub const K_DL_INT: u8 = 0;
pub const K_DL_UINT: u8 = 1;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct DLDevice {
    pub device_type: i32,
    pub device_id: i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct DLDataType {
    pub code: u8,
    pub bits: u8,
    pub lanes: u16,
}

/// DLPack tensor descriptor. Only CPU-resident, contiguous 32-bit integer
/// tensors of shape `[n]` or `[1, n]` are accepted as bitmasks.
#[repr(C)]
pub struct DLTensor {
    pub data: *mut c_void,
    pub device: DLDevice,
    pub ndim: i32,
    pub dtype: DLDataType,
    pub shape: *mut i64,
    /// Null means compact row-major.
    pub strides: *mut i64,
    pub byte_offset: u64,
}

impl DLTensor {
    fn as_bitmask<'a>(&self) -> Result<&'a mut [u32], GrammarError> {
        let bad = |msg: String| Err(GrammarError::IncompatibleVocabulary(msg));
        if self.device.device_type != K_DL_CPU {
            return bad(format!(
                "bitmask must be on the CPU, got device type {}",
                self.device.device_type
            ));
        }
        if !matches!(self.dtype.code, K_DL_INT | K_DL_UINT)
            || self.dtype.bits != 32
            || self.dtype.lanes != 1
        {
            return bad(format!("bitmask must be int32 or uint32, got {:?}", self.dtype));
        }
        if self.data.is_null() || self.shape.is_null() {
            return bad("bitmask tensor has no data or shape".to_string());
        }
        let shape = unsafe { std::slice::from_raw_parts(self.shape, self.ndim.max(0) as usize) };
        let len = match shape {
            [n] => *n,
            [1, n] => *n,
            _ => return bad(format!("bitmask must have shape [n] or [1, n], got {:?}", shape)),
        };
        if !self.strides.is_null() {
            let strides =
                unsafe { std::slice::from_raw_parts(self.strides, self.ndim as usize) };
            if strides.last() != Some(&1) {
                return bad(format!("bitmask must be contiguous, strides {:?}", strides));
            }
        }
        let data = unsafe { (self.data as *mut u8).add(self.byte_offset as usize) };
        if data as usize % std::mem::align_of::<u32>() != 0 {
            return bad(format!(
                "bitmask data must be 4-byte aligned (byte_offset {})",
                self.byte_offset
            ));
        }
        Ok(unsafe { std::slice::from_raw_parts_mut(data as *mut u32, len.max(0) as usize) })
    }
}

/// Register the process-wide error sink; null unregisters it. Every failing
/// call reports its message here before returning null or false.
#[no_mangle]
pub extern "C" fn set_error_handler(handler: Option<ErrorHandler>) {
    if let Ok(mut h) = ERROR_HANDLER.lock() {
        *h = handler;
    }
}

/// The last error reported on the calling thread, or null. Valid until the
/// next failing call on this thread.
#[no_mangle]
pub extern "C" fn last_error() -> *const c_char {
    LAST_ERROR.with(|e| {
        e.borrow()
            .as_ref()
            .map_or(std::ptr::null(), |s| s.as_ptr())
    })
}

/// Build a vocabulary from `vocab_size` NUL-terminated entries.
/// Returns null on failure.
#[no_mangle]
pub extern "C" fn tokenizer_info_new(
    vocab: *const *const c_char,
    vocab_size: usize,
    vocab_type: c_int,
    eos_tokens: *const i32,
    eos_tokens_size: usize,
) -> *mut CTokenizerInfo {
    ffi_call(std::ptr::null_mut(), || {
        if vocab.is_null() && vocab_size > 0 {
            return Err(GrammarError::InvalidVocabulary("null vocab array".to_string()));
        }
        let entries = if vocab_size == 0 {
            &[]
        } else {
            unsafe { std::slice::from_raw_parts(vocab, vocab_size) }
        };
        let mut tokens = Vec::with_capacity(vocab_size);
        for (i, &p) in entries.iter().enumerate() {
            if p.is_null() {
                return Err(GrammarError::InvalidVocabulary(format!(
                    "vocabulary entry {} is null",
                    i
                )));
            }
            tokens.push(unsafe { CStr::from_ptr(p) }.to_bytes().to_vec());
        }
        let vocab = Vocabulary::from_init(VocabInit {
            tokens,
            vocab_type: self::vocab_type(vocab_type)?,
            stop_tokens: stop_token_ids(eos_tokens, eos_tokens_size)?,
            ..VocabInit::default()
        })?;
        Ok(Box::into_raw(Box::new(CTokenizerInfo::new(vocab))))
    })
}

/// Build a vocabulary from length-prefixed entries. Returns null on failure.
#[no_mangle]
pub extern "C" fn tokenizer_info_new_from_init(init: *const TokenizerInit) -> *mut CTokenizerInfo {
    ffi_call(std::ptr::null_mut(), || {
        let init = deref(init, "TokenizerInit")?;
        let vocab = Vocabulary::from_init(init.to_vocab_init()?)?;
        Ok(Box::into_raw(Box::new(CTokenizerInfo::new(vocab))))
    })
}

/// Free the vocabulary. Compiled grammars keep their own reference, so
/// this may be called while they are alive. Null is a no-op.
#[no_mangle]
pub extern "C" fn tokenizer_info_free(info: *mut CTokenizerInfo) {
    if !info.is_null() {
        drop(unsafe { Box::from_raw(info) });
    }
}

fn schema_str<'a>(utf8: *const c_char, len: usize) -> Result<&'a str, String> {
    if utf8.is_null() && len > 0 {
        return Err("null source string".to_string());
    }
    let bytes = if len == 0 {
        &[]
    } else {
        unsafe { std::slice::from_raw_parts(utf8 as *const u8, len) }
    };
    std::str::from_utf8(bytes).map_err(|e| format!("source is not valid UTF-8: {}", e))
}

fn compiled(grammar: CompiledGrammar) -> *mut CCompiledGrammar {
    Box::into_raw(Box::new(CCompiledGrammar { grammar }))
}

/// Compile a JSON schema. A negative `indent` means any whitespace is
/// allowed; otherwise the output is laid out with that indent.
/// Returns null on failure.
#[no_mangle]
pub extern "C" fn compile_json_schema_grammar(
    tokenizer_info: *const CTokenizerInfo,
    schema_utf8: *const c_char,
    schema_len: usize,
    indent: c_int,
) -> *mut CCompiledGrammar {
    ffi_call(std::ptr::null_mut(), || {
        let info = deref(tokenizer_info, "tokenizer_info")?;
        let schema = schema_str(schema_utf8, schema_len).map_err(GrammarError::SchemaCompile)?;
        let options = match usize::try_from(indent) {
            Ok(n) => JsonCompileOptions::indented(n),
            Err(_) => JsonCompileOptions::default(),
        };
        Ok(compiled(info.compiler.compile_json_schema(schema, &options)?))
    })
}

/// Like `compile_json_schema_grammar()`, with options given as JSON, e.g.
/// `{"separators": [",", ":"], "strict_properties_order": false}`.
#[no_mangle]
pub extern "C" fn compile_json_schema_grammar_with_options(
    tokenizer_info: *const CTokenizerInfo,
    schema_utf8: *const c_char,
    schema_len: usize,
    options_utf8: *const c_char,
    options_len: usize,
) -> *mut CCompiledGrammar {
    ffi_call(std::ptr::null_mut(), || {
        let info = deref(tokenizer_info, "tokenizer_info")?;
        let schema = schema_str(schema_utf8, schema_len).map_err(GrammarError::SchemaCompile)?;
        let options = schema_str(options_utf8, options_len).map_err(GrammarError::SchemaCompile)?;
        let options: JsonCompileOptions = if options.is_empty() {
            JsonCompileOptions::default()
        } else {
            serde_json::from_str(options).map_err(|e| {
                GrammarError::SchemaCompile(format!("invalid compile options: {}", e))
            })?
        };
        Ok(compiled(info.compiler.compile_json_schema(schema, &options)?))
    })
}

/// Compile a structural tag given as JSON. Returns null on failure.
#[no_mangle]
pub extern "C" fn compile_structural_tag(
    tokenizer_info: *const CTokenizerInfo,
    utf8: *const c_char,
    len: usize,
) -> *mut CCompiledGrammar {
    ffi_call(std::ptr::null_mut(), || {
        let info = deref(tokenizer_info, "tokenizer_info")?;
        let tag_json = schema_str(utf8, len).map_err(GrammarError::StructuralTagCompile)?;
        Ok(compiled(info.compiler.compile_structural_tag(tag_json)?))
    })
}

/// Null is a no-op. Matchers keep their own reference.
#[no_mangle]
pub extern "C" fn compiled_grammar_free(grammar: *mut CCompiledGrammar) {
    if !grammar.is_null() {
        drop(unsafe { Box::from_raw(grammar) });
    }
}

/// Returns null on failure.
#[no_mangle]
pub extern "C" fn grammar_matcher_new(grammar: *const CCompiledGrammar) -> *mut CGrammarMatcher {
    ffi_call(std::ptr::null_mut(), || {
        let grammar = deref(grammar, "compiled grammar")?;
        let matcher = GrammarMatcher::new(&grammar.grammar)?;
        Ok(Box::into_raw(Box::new(CGrammarMatcher { matcher })))
    })
}

/// Write the allowed-token bitmask into `bitmask`, a CPU int32 tensor of
/// shape `[ceil(vocab_size / 32)]` or `[1, ceil(vocab_size / 32)]`.
/// Bit `i % 32` of word `i / 32` is set when token `i` is allowed.
#[no_mangle]
pub extern "C" fn grammar_matcher_fill_next_token_bitmask(
    matcher: *mut CGrammarMatcher,
    bitmask: *mut DLTensor,
) -> bool {
    ffi_call(false, || {
        let m = deref_mut(matcher, "matcher")?;
        let tensor = deref(bitmask as *const DLTensor, "bitmask tensor")?;
        m.matcher.fill_next_token_bitmask(tensor.as_bitmask()?)?;
        Ok(true)
    })
}

/// False if the token was rejected (or on any other failure).
#[no_mangle]
pub extern "C" fn grammar_matcher_accept_token(matcher: *mut CGrammarMatcher, token_id: i32) -> bool {
    ffi_call(false, || {
        let m = deref_mut(matcher, "matcher")?;
        let token = TokenId::try_from(token_id).map_err(|_| {
            GrammarError::IncompatibleVocabulary(format!("negative token id {}", token_id))
        })?;
        m.matcher.accept_token(token)?;
        Ok(true)
    })
}

/// Undo the last `num_tokens` accepted tokens.
#[no_mangle]
pub extern "C" fn grammar_matcher_rollback(matcher: *mut CGrammarMatcher, num_tokens: usize) -> bool {
    ffi_call(false, || {
        let m = deref_mut(matcher, "matcher")?;
        m.matcher.rollback(num_tokens)?;
        Ok(true)
    })
}

#[no_mangle]
pub extern "C" fn grammar_matcher_reset(matcher: *mut CGrammarMatcher) {
    ffi_call((), || {
        deref_mut(matcher, "matcher")?.matcher.reset();
        Ok(())
    })
}

/// True once a stop token was accepted or a token was rejected.
#[no_mangle]
pub extern "C" fn grammar_matcher_is_terminated(matcher: *const CGrammarMatcher) -> bool {
    ffi_call(false, || Ok(deref(matcher, "matcher")?.matcher.is_terminated()))
}

#[no_mangle]
pub extern "C" fn grammar_matcher_state(matcher: *const CGrammarMatcher) -> MatcherState {
    ffi_call(MatcherState::Rejected, || {
        Ok(deref(matcher, "matcher")?.matcher.state())
    })
}

/// Null is a no-op.
#[no_mangle]
pub extern "C" fn grammar_matcher_free(matcher: *mut CGrammarMatcher) {
    if !matcher.is_null() {
        drop(unsafe { Box::from_raw(matcher) });
    }
}
