pub mod byteset;
mod grammar;
mod mask_cache;
mod parser;
pub mod utf8;

pub use byteset::ByteSet;
pub use grammar::{CGrammar, CSymIdx, Grammar, SymIdx};
pub use mask_cache::MaskCache;
pub use parser::{Parser, ParserError, ParserStats};
