use std::fmt::{Debug, Display};

/// A set of bytes; the terminal alphabet of the byte-level grammar.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ByteSet {
    words: [u32; 8],
}

impl ByteSet {
    pub const EMPTY: ByteSet = ByteSet { words: [0; 8] };

    pub fn full() -> Self {
        ByteSet {
            words: [u32::MAX; 8],
        }
    }

    pub fn from_byte(b: u8) -> Self {
        let mut r = Self::EMPTY;
        r.add(b);
        r
    }

    pub fn from_range(lo: u8, hi: u8) -> Self {
        let mut r = Self::EMPTY;
        r.add_range(lo, hi);
        r
    }

    #[inline(always)]
    pub fn add(&mut self, b: u8) {
        self.words[(b >> 5) as usize] |= 1 << (b & 31);
    }

    pub fn add_range(&mut self, lo: u8, hi: u8) {
        for b in lo..=hi {
            self.add(b);
        }
    }

    #[inline(always)]
    pub fn contains(&self, b: u8) -> bool {
        self.words[(b >> 5) as usize] & (1 << (b & 31)) != 0
    }

    pub fn union_with(&mut self, other: &ByteSet) {
        for (a, b) in self.words.iter_mut().zip(other.words.iter()) {
            *a |= *b;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    pub fn len(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        (0..=255u8).filter(move |b| self.contains(*b))
    }

    /// The only element, if the set has exactly one.
    pub fn single(&self) -> Option<u8> {
        if self.len() == 1 {
            self.iter().next()
        } else {
            None
        }
    }
}

pub fn byte_to_string(b: u8) -> String {
    if (0x21..0x7f).contains(&b) && b != b'\\' && b != b'-' && b != b']' && b != b'\'' {
        (b as char).to_string()
    } else {
        format!("\\x{:02x}", b)
    }
}

impl Display for ByteSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(b) = self.single() {
            return write!(f, "'{}'", byte_to_string(b));
        }
        write!(f, "[")?;
        let mut b = 0usize;
        while b < 256 {
            if !self.contains(b as u8) {
                b += 1;
                continue;
            }
            let start = b;
            while b + 1 < 256 && self.contains((b + 1) as u8) {
                b += 1;
            }
            if start == b {
                write!(f, "{}", byte_to_string(start as u8))?;
            } else {
                write!(
                    f,
                    "{}-{}",
                    byte_to_string(start as u8),
                    byte_to_string(b as u8)
                )?;
            }
            b += 1;
        }
        write!(f, "]")
    }
}

impl Debug for ByteSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn basic_ops() {
        let mut s = ByteSet::from_range(b'a', b'c');
        assert!(s.contains(b'b'));
        assert!(!s.contains(b'd'));
        assert_eq!(s.len(), 3);
        s.union_with(&ByteSet::from_byte(0xff));
        assert!(s.contains(0xff));
        assert_eq!(s.iter().collect::<Vec<_>>(), vec![b'a', b'b', b'c', 0xff]);
        assert_eq!(s.single(), None);
        assert_eq!(ByteSet::from_byte(b'x').single(), Some(b'x'));
        assert!(ByteSet::EMPTY.is_empty());
        assert_eq!(ByteSet::full().len(), 256);
    }

    #[test]
    fn display() {
        let mut s = ByteSet::from_range(b'0', b'9');
        s.add(b'_');
        assert_eq!(s.to_string(), "[0-9_]");
        assert_eq!(ByteSet::from_byte(b'{').to_string(), "'{'");
    }
}
