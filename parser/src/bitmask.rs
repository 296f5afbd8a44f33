//! Token masks in the caller-facing layout: one bit per token id,
//! least-significant bit first within each 32-bit word; word `i` covers
//! ids `32*i ..= 32*i + 31`. Masks are computed as [`SimpleVob`]s.

use toktrie::SimpleVob;

use crate::TokenId;

pub const BITS_PER_WORD: usize = 32;

/// Number of 32-bit words needed for one bit per token.
pub fn bitmask_len(vocab_size: usize) -> usize {
    (vocab_size + BITS_PER_WORD - 1) / BITS_PER_WORD
}

/// Overwrite `dst` with the tokens allowed in `set`. Bits past the
/// vocabulary size are zero.
pub fn write_bitmask(set: &SimpleVob, dst: &mut [u32]) {
    dst.fill(0);
    for tok in set.iter() {
        let idx = tok as usize;
        if let Some(w) = dst.get_mut(idx / BITS_PER_WORD) {
            *w |= 1u32 << (idx % BITS_PER_WORD);
        }
    }
}

#[inline(always)]
pub fn is_token_allowed(bitmask: &[u32], tok: TokenId) -> bool {
    let idx = tok as usize;
    bitmask
        .get(idx / BITS_PER_WORD)
        .map_or(false, |&w| w & (1u32 << (idx % BITS_PER_WORD)) != 0)
}

/// Set logits of tokens not allowed by `bitmask` to negative infinity.
/// Logits past the end of the bitmask are masked as well.
pub fn apply_token_bitmask_inplace(logits: &mut [f32], bitmask: &[u32]) {
    for (idx, logit) in logits.iter_mut().enumerate() {
        if !is_token_allowed(bitmask, idx as TokenId) {
            *logit = f32::NEG_INFINITY;
        }
    }
}
