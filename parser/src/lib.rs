pub mod api;
pub mod bitmask;
pub mod earley;
pub mod ffi;
pub mod json;
pub mod rx;
pub mod structural_tag;
#[cfg(feature = "tokenizers")]
pub mod hf_tokenizer;
pub mod vocab;

pub use toktrie;

mod compiler;
mod error;
mod grammar_builder;
mod logging;
mod matcher;
mod panic_utils;

pub use api::{EndOfGrammarPolicy, MatcherLimits, StructuralTag, StructuralTagItem};
pub use bitmask::{apply_token_bitmask_inplace, bitmask_len, is_token_allowed, write_bitmask};
pub use compiler::{CompiledGrammar, GrammarCompiler};
pub use error::{ErrorKind, GrammarError};
pub use grammar_builder::{GrammarBuilder, NodeRef};
pub use json::JsonCompileOptions;
pub use logging::Logger;
pub use matcher::{GrammarMatcher, MatcherState};
pub use toktrie::{SimpleVob, TokenId};
pub use vocab::{VocabInit, VocabRef, VocabType, Vocabulary};

#[macro_export]
macro_rules! loginfo {
    ($s:expr, $($arg:tt)*) => {
        if $s.level_enabled(2) {
            use std::fmt::Write;
            let _ = writeln!($s.info_logger(), $($arg)*);
        }
    };
}

#[macro_export]
macro_rules! infoln {
    ($s:expr, $($arg:tt)*) => {
        if $s.logger.level_enabled(2) {
            use std::fmt::Write;
            let _ = writeln!($s.logger.info_logger(), $($arg)*);
        }
    };
}

#[macro_export]
macro_rules! warn {
    ($s:expr, $($arg:tt)*) => {
        if $s.logger.level_enabled(1) {
            use std::fmt::Write;
            $s.logger.write_warning("Warning: ");
            let _ = writeln!($s.logger.warning_logger(), $($arg)*);
        }
    };
}
