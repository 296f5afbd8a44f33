//! Unicode scalar range algebra, and conversion of ranges into UTF-8
//! byte-range sequences so that character classes can be expressed with
//! byte terminals.

use regex_syntax::utf8::Utf8Sequences;

pub const MAX_CODEPOINT: u32 = 0x10FFFF;

const SURROGATE_START: u32 = 0xD800;
const SURROGATE_END: u32 = 0xDFFF;

/// One UTF-8 sequence: the i-th byte must lie in the i-th range.
pub type Utf8Sequence = Vec<(u8, u8)>;

/// Split the inclusive range `[start, end]` (surrogates excluded) into
/// sequences of byte ranges, in ascending order.
pub fn utf8_sequences(start: u32, end: u32) -> Vec<Utf8Sequence> {
    let start = if (SURROGATE_START..=SURROGATE_END).contains(&start) {
        SURROGATE_END + 1
    } else {
        start
    };
    let end = if (SURROGATE_START..=SURROGATE_END).contains(&end) {
        SURROGATE_START - 1
    } else {
        std::cmp::min(end, MAX_CODEPOINT)
    };
    let (Some(s), Some(e)) = (char::from_u32(start), char::from_u32(end)) else {
        return vec![];
    };
    if s > e {
        return vec![];
    }
    Utf8Sequences::new(s, e)
        .map(|seq| seq.as_slice().iter().map(|r| (r.start, r.end)).collect())
        .collect()
}

/// Normalize a list of inclusive scalar ranges: sort, clamp, merge overlaps.
pub fn normalize_ranges(ranges: &[(u32, u32)]) -> Vec<(u32, u32)> {
    let mut sorted: Vec<(u32, u32)> = ranges
        .iter()
        .filter(|(a, b)| a <= b && *a <= MAX_CODEPOINT)
        .map(|&(a, b)| (a, std::cmp::min(b, MAX_CODEPOINT)))
        .collect();
    sorted.sort();
    let mut res: Vec<(u32, u32)> = vec![];
    for (a, b) in sorted {
        if let Some(last) = res.last_mut() {
            if a <= last.1.saturating_add(1) {
                last.1 = std::cmp::max(last.1, b);
                continue;
            }
        }
        res.push((a, b));
    }
    res
}

/// Complement of normalized ranges within `[0, MAX_CODEPOINT]`.
pub fn negate_ranges(ranges: &[(u32, u32)]) -> Vec<(u32, u32)> {
    let ranges = normalize_ranges(ranges);
    let mut res = vec![];
    let mut next = 0u32;
    for (a, b) in ranges {
        if a > next {
            res.push((next, a - 1));
        }
        next = b + 1;
    }
    if next <= MAX_CODEPOINT {
        res.push((next, MAX_CODEPOINT));
    }
    res
}

/// Intersection minus: remove `excluded` from `ranges`.
pub fn subtract_ranges(ranges: &[(u32, u32)], excluded: &[(u32, u32)]) -> Vec<(u32, u32)> {
    let keep = negate_ranges(excluded);
    let ranges = normalize_ranges(ranges);
    let mut res = vec![];
    for &(a, b) in &ranges {
        for &(c, d) in &keep {
            let lo = std::cmp::max(a, c);
            let hi = std::cmp::min(b, d);
            if lo <= hi {
                res.push((lo, hi));
            }
        }
    }
    normalize_ranges(&res)
}
