//! Identifier interning
//!
//! Only identifiers and selector names pass through here (string
//! literals live on the runtime heap, not in the interner), so the
//! storage is shaped for lots of short, heavily repeated spellings:
//! every distinct spelling is appended once to a single text arena and
//! addressed by a byte span. Deduplication goes through a hash-bucket
//! table keyed by the spelling's hash, with the (rare) collisions
//! resolved by comparing against the arena.
//!
//! A [`Name`] is the index of its span. Two names are equal exactly
//! when their spellings are equal, which is what lets scopes and the
//! selector table key on `Name` instead of text.

use rustc_hash::{FxHashMap, FxHasher};
use std::hash::Hasher;

/// An interned identifier: the index of its span in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Name(u32);

/// Byte span of one spelling within the arena.
#[derive(Clone, Copy, Debug)]
struct Span {
    start: u32,
    len: u32,
}

/// Arena-backed identifier table.
#[derive(Default, Debug)]
pub struct Interner {
    /// Every distinct spelling, concatenated
    text: String,
    /// Span of each name, indexed by `Name`
    spans: Vec<Span>,
    /// Spelling hash → names with that hash
    buckets: FxHashMap<u64, Vec<Name>>,
}

impl Interner {
    pub fn new() -> Interner {
        Interner::default()
    }

    fn hash_of(spelling: &str) -> u64 {
        let mut hasher = FxHasher::default();
        hasher.write(spelling.as_bytes());
        hasher.finish()
    }

    /// Intern a spelling, returning the name every equal spelling maps to.
    pub fn intern(&mut self, spelling: &str) -> Name {
        let hash = Self::hash_of(spelling);
        if let Some(bucket) = self.buckets.get(&hash) {
            for &name in bucket {
                if self.resolve(name) == spelling {
                    return name;
                }
            }
        }

        let name = Name(self.spans.len() as u32);
        let start = self.text.len() as u32;
        self.text.push_str(spelling);
        self.spans.push(Span {
            start,
            len: spelling.len() as u32,
        });
        self.buckets.entry(hash).or_default().push(name);
        name
    }

    /// The spelling behind a name.
    ///
    /// # Panics
    ///
    /// Panics if the name is not from this interner.
    #[inline]
    pub fn resolve(&self, name: Name) -> &str {
        let span = self.spans[name.0 as usize];
        &self.text[span.start as usize..(span.start + span.len) as usize]
    }

    /// Number of distinct spellings.
    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equal_spellings_share_a_name() {
        let mut interner = Interner::new();
        let a = interner.intern("width");
        let b = interner.intern("height");
        let c = interner.intern("width");
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(interner.len(), 2);
    }

    #[test]
    fn test_resolve_round_trip() {
        let mut interner = Interner::new();
        let idents = ["fact", "a", "self", "size", "x1", "__convert"];
        let names: Vec<Name> = idents.iter().map(|s| interner.intern(s)).collect();
        for (name, ident) in names.iter().zip(idents.iter()) {
            assert_eq!(interner.resolve(*name), *ident);
        }
    }

    #[test]
    fn test_arena_stores_each_spelling_once() {
        let mut interner = Interner::new();
        for _ in 0..100 {
            interner.intern("loop_counter");
        }
        assert_eq!(interner.len(), 1);
        assert_eq!(interner.text, "loop_counter");
    }

    #[test]
    fn test_prefix_spellings_stay_distinct() {
        // spans must not bleed into neighbouring arena bytes
        let mut interner = Interner::new();
        let ab = interner.intern("ab");
        let a = interner.intern("a");
        let abc = interner.intern("abc");
        assert_eq!(interner.resolve(ab), "ab");
        assert_eq!(interner.resolve(a), "a");
        assert_eq!(interner.resolve(abc), "abc");
        assert_eq!(interner.len(), 3);
    }

    #[test]
    fn test_many_identifiers() {
        let mut interner = Interner::new();
        let names: Vec<Name> = (0..500)
            .map(|i| interner.intern(&format!("v{}", i)))
            .collect();
        assert_eq!(interner.len(), 500);
        for (i, name) in names.iter().enumerate() {
            assert_eq!(interner.resolve(*name), format!("v{}", i));
        }
        // re-interning resolves to the original names
        for (i, name) in names.iter().enumerate() {
            assert_eq!(interner.intern(&format!("v{}", i)), *name);
        }
    }
}
