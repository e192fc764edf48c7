//! Strongly-typed identifiers and the [`Offset`] / [`BinIndex`] aliases.

use smallvec::SmallVec;
use std::fmt;

/// Position of a field inside the arena, in `f64` elements.
///
/// Offsets are the only way to name arena data: the backing store may be
/// reallocated whenever the arena grows, so native references are never
/// held across a growth point.
pub type Offset = usize;

/// Identifies a cooperating process (a "rank") in a decomposed run.
///
/// Ranks are numbered `0..n` and arranged as an implicit binary tree for
/// termination detection (see [`RankId::parent`]).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RankId(pub u32);

impl RankId {
    /// The root of the rank tree.
    pub const ROOT: RankId = RankId(0);

    /// Parent in the implicit binary tree, `(id - 1) / 2`. The root has none.
    pub fn parent(self) -> Option<RankId> {
        if self.0 == 0 {
            None
        } else {
            Some(RankId((self.0 - 1) / 2))
        }
    }

    /// Children `2 * id + 1` and `2 * id + 2` that exist in a tree of `size` ranks.
    pub fn children(self, size: usize) -> impl Iterator<Item = RankId> {
        let first = 2 * self.0 as u64 + 1;
        (first..first + 2)
            .filter(move |&c| c < size as u64)
            .map(|c| RankId(c as u32))
    }

    /// Whether this rank is the tree root.
    pub fn is_root(self) -> bool {
        self.0 == 0
    }

    /// The rank id as a `usize` index.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for RankId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for RankId {
    fn from(v: u32) -> Self {
        Self(v)
    }
}

/// Identifies a worker thread within one rank.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub u32);

impl WorkerId {
    /// The worker id as a `usize` index.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for WorkerId {
    fn from(v: u32) -> Self {
        Self(v)
    }
}

/// Identifies a spatial domain of the decomposed geometry.
///
/// Each rank owns exactly one domain and domain `n` is owned by rank `n`,
/// so [`DomainId::owner`] is the identity mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DomainId(pub u32);

impl DomainId {
    /// Decode a domain read from a record's `DOMAIN` field.
    ///
    /// Returns `None` for negative, non-integral or non-finite values and
    /// for values beyond `u32`.
    pub fn from_field(value: f64) -> Option<DomainId> {
        if value >= 0.0 && value <= f64::from(u32::MAX) && value.fract() == 0.0 {
            Some(DomainId(value as u32))
        } else {
            None
        }
    }

    /// The value written into a record's `DOMAIN` field.
    pub fn field(self) -> f64 {
        f64::from(self.0)
    }

    /// The rank that owns this domain.
    pub fn owner(self) -> RankId {
        RankId(self.0)
    }
}

impl fmt::Display for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for DomainId {
    fn from(v: u32) -> Self {
        Self(v)
    }
}

impl From<RankId> for DomainId {
    fn from(r: RankId) -> Self {
        Self(r.0)
    }
}

/// Multi-dimensional bin index into a statistics buffer.
///
/// Uses `SmallVec<[usize; 4]>` so the common case (up to four binning
/// dimensions: material, energy group, time bin, cell) stays on the stack.
pub type BinIndex = SmallVec<[usize; 4]>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_has_no_parent() {
        assert_eq!(RankId(0).parent(), None);
        assert!(RankId::ROOT.is_root());
    }

    #[test]
    fn parent_of_children_round_trips() {
        for id in 0..64u32 {
            for child in RankId(id).children(128) {
                assert_eq!(child.parent(), Some(RankId(id)));
            }
        }
    }

    #[test]
    fn children_clipped_to_size() {
        let kids: Vec<_> = RankId(1).children(4).collect();
        assert_eq!(kids, vec![RankId(3)]);
        assert_eq!(RankId(2).children(4).count(), 0);
        assert_eq!(RankId(0).children(1).count(), 0);
    }

    #[test]
    fn domain_field_must_be_a_whole_non_negative_number() {
        assert_eq!(DomainId::from_field(3.0), Some(DomainId(3)));
        assert_eq!(DomainId::from_field(DomainId(7).field()), Some(DomainId(7)));
        assert_eq!(DomainId::from_field(-1.0), None);
        assert_eq!(DomainId::from_field(1.5), None);
        assert_eq!(DomainId::from_field(f64::NAN), None);
        assert_eq!(DomainId::from_field(f64::INFINITY), None);
        assert_eq!(DomainId::from_field(1.0e12), None);
    }

    #[test]
    fn domain_owner_is_identity() {
        assert_eq!(DomainId(3).owner(), RankId(3));
        assert_eq!(DomainId::from(RankId(5)), DomainId(5));
    }
}
