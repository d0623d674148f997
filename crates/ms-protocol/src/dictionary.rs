//! Per-connection translation dictionary for the binary encoding.
//!
//! Maps strings (metric names, tag keys, tag values) to monotonically
//! increasing 32-bit ids.  An id, once assigned, is never reassigned for
//! the life of the dictionary; the consumer hydrates its mirror from the
//! delta entries appended to each frame.

use std::collections::HashMap;
use std::sync::RwLock;

/// Thread-safe string→id table.  The first assigned id is 1.
#[derive(Debug, Default)]
pub struct Dictionary {
    inner: RwLock<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    last: u32,
    map: HashMap<String, u32>,
}

impl Dictionary {
    pub fn new() -> Self {
        Dictionary::default()
    }

    /// Translate `s` to its id, assigning the next id on first sight.
    ///
    /// Returns `(id, newly_assigned)`.  Lookups take the read lock only;
    /// the write lock re-checks before inserting so concurrent callers
    /// agree on the id.
    pub fn translate(&self, s: &str) -> (u32, bool) {
        {
            let inner = self.inner.read().expect("dictionary lock poisoned");
            if let Some(&id) = inner.map.get(s) {
                return (id, false);
            }
        }
        let mut inner = self.inner.write().expect("dictionary lock poisoned");
        if let Some(&id) = inner.map.get(s) {
            return (id, false);
        }
        inner.last += 1;
        let id = inner.last;
        inner.map.insert(s.to_owned(), id);
        (id, true)
    }

    /// Number of entries assigned so far.
    pub fn len(&self) -> usize {
        self.inner.read().expect("dictionary lock poisoned").map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn ids_are_stable_and_monotonic() {
        let dict = Dictionary::new();
        let (a, new_a) = dict.translate("foo");
        let (b, new_b) = dict.translate("bar");
        let (a2, new_a2) = dict.translate("foo");

        assert_eq!(a, 1);
        assert_eq!(b, 2);
        assert_eq!(a2, a);
        assert!(new_a && new_b);
        assert!(!new_a2);
        assert_eq!(dict.len(), 2);
    }

    #[test]
    fn concurrent_translations_agree() {
        let dict = Arc::new(Dictionary::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let dict = Arc::clone(&dict);
                thread::spawn(move || {
                    (0..100)
                        .map(|i| dict.translate(&format!("key-{}", i % 10)).0)
                        .collect::<Vec<u32>>()
                })
            })
            .collect();

        let results: Vec<Vec<u32>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        // Every thread resolved the same string to the same id.
        for other in &results[1..] {
            assert_eq!(&results[0], other);
        }
        assert_eq!(dict.len(), 10);
    }
}
