use std::sync::Mutex;

use rustc_hash::FxHashMap;
use toktrie::SimpleVob;

/// Token masks memoized by Earley frontier (see `Parser::frontier_key()`).
/// Shared by all matchers of one compiled grammar.
pub struct MaskCache {
    max_entries: usize,
    masks: Mutex<FxHashMap<Vec<u64>, SimpleVob>>,
}

impl MaskCache {
    pub fn new(max_entries: usize) -> Self {
        MaskCache {
            max_entries,
            masks: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn get(&self, key: &[u64]) -> Option<SimpleVob> {
        self.masks.lock().ok()?.get(key).cloned()
    }

    /// When full, the cache starts over.
    pub fn insert(&self, key: Vec<u64>, mask: &SimpleVob) {
        if self.max_entries == 0 {
            return;
        }
        if let Ok(mut masks) = self.masks.lock() {
            if masks.len() >= self.max_entries {
                masks.clear();
            }
            masks.insert(key, mask.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.masks.lock().map_or(0, |m| m.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut masks) = self.masks.lock() {
            masks.clear();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bounded() {
        let cache = MaskCache::new(2);
        let mut m = SimpleVob::alloc(10);
        m.allow_token(3);
        cache.insert(vec![1], &m);
        cache.insert(vec![2], &m);
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&[1]).is_some_and(|m| m.is_allowed(3)));
        cache.insert(vec![3], &m);
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&[1]).is_none());

        let off = MaskCache::new(0);
        off.insert(vec![1], &m);
        assert!(off.is_empty());
    }
}
