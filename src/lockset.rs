//! Interned lock sets
//!
//! A lock set is a sorted set of lock addresses. Each thread carries two:
//! locks held for writing and locks held for reading (disjoint). Sets are
//! interned so a segment can snapshot its lock sets as two small ids, and so
//! the hot intersection query can be memoized.
//!
//! The race-protection rule is asymmetric: a common lock protects a pair of
//! accesses only if at least one side holds it as a writer. Two readers of
//! the same lock are not mutually excluded by it.

use std::collections::HashMap;
use std::fmt::Write as _;

/// Handle to an interned lock set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockSetId(u32);

impl LockSetId {
    /// The empty set, pre-interned at table construction.
    pub const EMPTY: LockSetId = LockSetId(0);

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Canonicalizing intern table for lock sets, with a memoized pairwise
/// intersection query.
#[derive(Debug)]
pub struct LockSetTable {
    sets: Vec<Vec<u64>>,
    index: HashMap<Vec<u64>, LockSetId>,
    intersect_cache: HashMap<(LockSetId, LockSetId), bool>,
}

impl LockSetTable {
    pub fn new() -> Self {
        let mut table = Self {
            sets: Vec::new(),
            index: HashMap::new(),
            intersect_cache: HashMap::new(),
        };
        let empty = table.intern(Vec::new());
        debug_assert_eq!(empty, LockSetId::EMPTY);
        table
    }

    fn intern(&mut self, set: Vec<u64>) -> LockSetId {
        debug_assert!(set.windows(2).all(|w| w[0] < w[1]), "set not canonical");
        if let Some(&id) = self.index.get(&set) {
            return id;
        }
        let id = LockSetId(self.sets.len() as u32);
        self.index.insert(set.clone(), id);
        self.sets.push(set);
        id
    }

    pub fn get(&self, id: LockSetId) -> &[u64] {
        &self.sets[id.index()]
    }

    /// Set with `lock` added. Adding an already-present lock is the identity.
    pub fn add(&mut self, base: LockSetId, lock: u64) -> LockSetId {
        let set = self.get(base);
        match set.binary_search(&lock) {
            Ok(_) => base,
            Err(pos) => {
                let mut next = set.to_vec();
                next.insert(pos, lock);
                self.intern(next)
            }
        }
    }

    /// Set with `lock` removed. Removing an absent lock is the identity.
    pub fn remove(&mut self, base: LockSetId, lock: u64) -> LockSetId {
        let set = self.get(base);
        match set.binary_search(&lock) {
            Ok(pos) => {
                let mut next = set.to_vec();
                next.remove(pos);
                self.intern(next)
            }
            Err(_) => base,
        }
    }

    pub fn contains(&self, id: LockSetId, lock: u64) -> bool {
        self.get(id).binary_search(&lock).is_ok()
    }

    /// Do two interned sets share any lock? Memoized; the key is
    /// canonicalized so (a, b) and (b, a) share an entry.
    pub fn intersects(&mut self, a: LockSetId, b: LockSetId) -> bool {
        if a == LockSetId::EMPTY || b == LockSetId::EMPTY {
            return false;
        }
        if a == b {
            return true;
        }
        let key = if a.0 <= b.0 { (a, b) } else { (b, a) };
        if let Some(&hit) = self.intersect_cache.get(&key) {
            return hit;
        }
        let result = {
            let (mut i, mut j) = (0, 0);
            let (sa, sb) = (self.get(a), self.get(b));
            let mut found = false;
            while i < sa.len() && j < sb.len() {
                match sa[i].cmp(&sb[j]) {
                    std::cmp::Ordering::Less => i += 1,
                    std::cmp::Ordering::Greater => j += 1,
                    std::cmp::Ordering::Equal => {
                        found = true;
                        break;
                    }
                }
            }
            found
        };
        self.intersect_cache.insert(key, result);
        result
    }

    /// The hybrid-mode protection test between two accesses: some common
    /// lock is held by at least one side as a writer. Reader/reader overlap
    /// does not protect.
    pub fn protects(
        &mut self,
        a_writers: LockSetId,
        a_readers: LockSetId,
        b_writers: LockSetId,
        b_readers: LockSetId,
    ) -> bool {
        self.intersects(a_writers, b_writers)
            || self.intersects(a_writers, b_readers)
            || self.intersects(a_readers, b_writers)
    }

    /// Render a set for reports, e.g. `{0x7f01, 0x7f02}`.
    pub fn render(&self, id: LockSetId) -> String {
        let set = self.get(id);
        if set.is_empty() {
            return "{}".to_string();
        }
        let mut out = String::from("{");
        for (i, lock) in set.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            let _ = write!(out, "{lock:#x}");
        }
        out.push('}');
        out
    }

    /// Number of distinct sets interned so far.
    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}

impl Default for LockSetTable {
    fn default() -> Self {
        Self::new()
    }
}
