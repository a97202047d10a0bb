//! Information-flow labels and clearances.
//!
//! A label is "how tainted I am"; a clearance is "how tainted I am willing
//! to consume". Both are sets of taint tags packed into a bitset, ordered
//! by set inclusion. `promote` only ever adds tags -- the lattice is
//! climbed, never descended -- and a transfer is permitted exactly when the
//! sender's label is `leq` the receiver's clearance.

/// A set of taint tags. `Label` and `Clearance` are the same representation
/// used in two different roles; see [`Tag`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Tag(u32);

impl Tag {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Raise this tag set to include every tag in `other`. Never removes a
    /// tag, so repeated promotion is monotonically non-decreasing.
    pub fn promote(&mut self, other: Tag) {
        self.0 |= other.0;
    }

    /// `self <= other` under the subset ordering: everything `self` is
    /// tainted with, `other` is willing to consume.
    pub fn leq(self, other: Tag) -> bool {
        self.0 & !other.0 == 0
    }
}

/// Per-process label/clearance pair, as carried in the PCB.
#[derive(Debug, Clone, Copy, Default)]
pub struct LabelState {
    label: Tag,
    clearance: Tag,
}

impl LabelState {
    pub const fn new() -> Self {
        Self {
            label: Tag::empty(),
            clearance: Tag::empty(),
        }
    }

    pub fn label(&self) -> Tag {
        self.label
    }

    pub fn clearance(&self) -> Tag {
        self.clearance
    }

    pub fn promote_label(&mut self, tags: Tag) {
        self.label.promote(tags);
    }

    pub fn promote_clearance(&mut self, tags: Tag) {
        self.clearance.promote(tags);
    }

    /// Whether a message labeled `sender_label` may flow into this process.
    pub fn admits(&self, sender_label: Tag) -> bool {
        sender_label.leq(self.clearance)
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn promote_only_grows() {
        let mut t = Tag::from_bits(0b001);
        t.promote(Tag::from_bits(0b010));
        assert_eq!(t.bits(), 0b011);
        t.promote(Tag::empty());
        assert_eq!(t.bits(), 0b011);
    }

    #[test]
    fn leq_is_subset_ordering() {
        let low = Tag::from_bits(0b001);
        let high = Tag::from_bits(0b011);
        assert!(low.leq(high));
        assert!(!high.leq(low));
        assert!(low.leq(low));
    }

    #[test]
    fn admits_checks_against_clearance() {
        let mut state = LabelState::new();
        state.promote_clearance(Tag::from_bits(0b011));
        assert!(state.admits(Tag::from_bits(0b001)));
        assert!(!state.admits(Tag::from_bits(0b100)));
    }

    #[test]
    fn empty_clearance_admits_only_empty_label() {
        let state = LabelState::new();
        assert!(state.admits(Tag::empty()));
        assert!(!state.admits(Tag::from_bits(0b1)));
    }
}
