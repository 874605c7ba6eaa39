//! Vector clocks and the hash-consed clock table
//!
//! A vector clock maps each thread to a logical timestamp. The analyzer
//! interns every clock it produces: equality is an id comparison, ordering
//! (`leq`) is a component-wise comparison. Interning keeps memory growth
//! proportional to distinct synchronization topologies rather than to event
//! count.
//!
//! Components are `u32`. A tick that would overflow is detected and surfaced
//! as a fatal error instead of wrapping; a wrapped clock would silently
//! invert the happens-before relation.

use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Clock component overflow. Fatal: the analyzer cannot keep ordering events
/// once a component saturates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("vector clock component for thread {tid} overflowed u32")]
pub struct ClockOverflow {
    pub tid: u32,
}

/// A vector clock. Components are stored densely, indexed by tid; trailing
/// zero components are trimmed so that equal clocks have equal
/// representations.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct VectorClock {
    components: Vec<u32>,
}

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Component for `tid`; absent components are zero.
    pub fn get(&self, tid: u32) -> u32 {
        self.components.get(tid as usize).copied().unwrap_or(0)
    }

    fn set(&mut self, tid: u32, value: u32) {
        let idx = tid as usize;
        if idx >= self.components.len() {
            self.components.resize(idx + 1, 0);
        }
        self.components[idx] = value;
        self.normalize();
    }

    /// Increment the component for `tid`.
    pub fn tick(&mut self, tid: u32) -> Result<(), ClockOverflow> {
        let cur = self.get(tid);
        let next = cur.checked_add(1).ok_or(ClockOverflow { tid })?;
        self.set(tid, next);
        Ok(())
    }

    /// Component-wise max with `other`.
    pub fn join(&mut self, other: &VectorClock) {
        if other.components.len() > self.components.len() {
            self.components.resize(other.components.len(), 0);
        }
        for (i, &c) in other.components.iter().enumerate() {
            if c > self.components[i] {
                self.components[i] = c;
            }
        }
    }

    /// Pointwise `self <= other`. This is the happens-before-or-equal test:
    /// an access with clock `a` is ordered before one with clock `b` iff
    /// `a.leq(b)`.
    pub fn leq(&self, other: &VectorClock) -> bool {
        self.components
            .iter()
            .enumerate()
            .all(|(i, &c)| c <= other.get(i as u32))
    }

    /// Neither clock is ordered before the other.
    pub fn concurrent_with(&self, other: &VectorClock) -> bool {
        !self.leq(other) && !other.leq(self)
    }

    fn normalize(&mut self) {
        while self.components.last() == Some(&0) {
            self.components.pop();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }
}

impl fmt::Display for VectorClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, c) in self.components.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{c}")?;
        }
        write!(f, "]")
    }
}

/// Handle to an interned [`VectorClock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClockId(u32);

impl ClockId {
    /// The empty (all-zero) clock, pre-interned at table construction.
    pub const ZERO: ClockId = ClockId(0);

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Hash-consing table for vector clocks. All clock mutation goes through the
/// table: callers hold `ClockId`s and derive new ids via `tick` and `join`.
#[derive(Debug)]
pub struct ClockTable {
    clocks: Vec<VectorClock>,
    index: HashMap<VectorClock, ClockId>,
}

impl ClockTable {
    pub fn new() -> Self {
        let mut table = Self {
            clocks: Vec::new(),
            index: HashMap::new(),
        };
        let zero = table.intern(VectorClock::new());
        debug_assert_eq!(zero, ClockId::ZERO);
        table
    }

    pub fn intern(&mut self, clock: VectorClock) -> ClockId {
        if let Some(&id) = self.index.get(&clock) {
            return id;
        }
        let id = ClockId(self.clocks.len() as u32);
        self.index.insert(clock.clone(), id);
        self.clocks.push(clock);
        id
    }

    pub fn get(&self, id: ClockId) -> &VectorClock {
        &self.clocks[id.index()]
    }

    /// Interned tick: returns the id of `base` with `tid`'s component
    /// incremented.
    pub fn tick(&mut self, base: ClockId, tid: u32) -> Result<ClockId, ClockOverflow> {
        let mut clock = self.get(base).clone();
        clock.tick(tid)?;
        Ok(self.intern(clock))
    }

    /// Interned join: component-wise max of `a` and `b`.
    pub fn join(&mut self, a: ClockId, b: ClockId) -> ClockId {
        if a == b {
            return a;
        }
        let mut clock = self.get(a).clone();
        clock.join(self.get(b));
        self.intern(clock)
    }

    /// Pointwise order on interned clocks. Equal ids are trivially ordered.
    pub fn leq(&self, a: ClockId, b: ClockId) -> bool {
        a == b || self.get(a).leq(self.get(b))
    }

    /// Number of distinct clocks interned so far.
    pub fn len(&self) -> usize {
        self.clocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clocks.is_empty()
    }
}

impl Default for ClockTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_clock_is_zero_everywhere() {
        let vc = VectorClock::new();
        assert_eq!(vc.get(0), 0);
        assert_eq!(vc.get(1000), 0);
        assert!(vc.is_empty());
    }

    #[test]
    fn test_tick_increments_one_component() {
        let mut vc = VectorClock::new();
        vc.tick(2).unwrap();
        vc.tick(2).unwrap();
        vc.tick(0).unwrap();
        assert_eq!(vc.get(0), 1);
        assert_eq!(vc.get(1), 0);
        assert_eq!(vc.get(2), 2);
    }

    #[test]
    fn test_join_is_componentwise_max() {
        let mut a = VectorClock::new();
        a.tick(0).unwrap();
        a.tick(0).unwrap();
        a.tick(1).unwrap();
        let mut b = VectorClock::new();
        b.tick(1).unwrap();
        b.tick(1).unwrap();
        b.tick(2).unwrap();
        a.join(&b);
        assert_eq!(a.get(0), 2);
        assert_eq!(a.get(1), 2);
        assert_eq!(a.get(2), 1);
    }

    #[test]
    fn test_leq_is_pointwise() {
        let mut a = VectorClock::new();
        a.tick(0).unwrap();
        let mut b = a.clone();
        b.tick(1).unwrap();
        assert!(a.leq(&b));
        assert!(!b.leq(&a));
        assert!(a.leq(&a));
    }

    #[test]
    fn test_concurrent_clocks() {
        let mut a = VectorClock::new();
        a.tick(0).unwrap();
        let mut b = VectorClock::new();
        b.tick(1).unwrap();
        assert!(a.concurrent_with(&b));
        assert!(b.concurrent_with(&a));
    }

    #[test]
    fn test_trailing_zeros_do_not_affect_equality() {
        // A clock that ticks tid 5 and then joins with an empty clock must
        // equal a clock built the other way around.
        let mut a = VectorClock::new();
        a.tick(5).unwrap();
        let mut b = VectorClock::new();
        b.join(&a);
        assert_eq!(a, b);
    }

    #[test]
    fn test_table_interns_structurally() {
        let mut table = ClockTable::new();
        let a = table.tick(ClockId::ZERO, 0).unwrap();
        let b = table.tick(ClockId::ZERO, 0).unwrap();
        assert_eq!(a, b);
        assert_eq!(table.len(), 2); // zero + ticked
    }

    #[test]
    fn test_table_join_and_leq() {
        let mut table = ClockTable::new();
        let a = table.tick(ClockId::ZERO, 0).unwrap();
        let b = table.tick(ClockId::ZERO, 1).unwrap();
        let j = table.join(a, b);
        assert!(table.leq(a, j));
        assert!(table.leq(b, j));
        assert!(!table.leq(j, a));
        // join of identical ids is the identity
        assert_eq!(table.join(a, a), a);
    }

    #[test]
    fn test_overflow_detected() {
        let mut vc = VectorClock::new();
        vc.set(3, u32::MAX);
        assert_eq!(vc.tick(3), Err(ClockOverflow { tid: 3 }));
    }

    #[test]
    fn test_display() {
        let mut vc = VectorClock::new();
        vc.tick(0).unwrap();
        vc.tick(2).unwrap();
        assert_eq!(vc.to_string(), "[1 0 1]");
    }
}
