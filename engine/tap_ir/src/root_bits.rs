//! Cached per-tree summary bits.

use bitflags::bitflags;

bitflags! {
    /// Summary of a tree's source attribution, computed by the first full walk.
    ///
    /// Until [`RootBits::INITIALIZED`] is set none of the predicates hold, so an
    /// unwalked tree is never skipped. Once initialized, the optimistic bits
    /// (`NO_SOURCE_SECTION`, `SAME_SOURCE`, `SOURCE_SECTION_HIERARCHICAL`) may
    /// only be cleared by later walks.
    #[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
    pub struct RootBits: u32 {
        /// A full walk has computed the summary.
        const INITIALIZED = 1 << 0;
        /// No node in the tree carries a source section.
        const NO_SOURCE_SECTION = 1 << 1;
        /// Every section in the tree belongs to the root's source.
        const SAME_SOURCE = 1 << 2;
        /// Every section lies within the root's section.
        const SOURCE_SECTION_HIERARCHICAL = 1 << 3;
        /// The tree has started executing at least once.
        const EXECUTED = 1 << 4;
    }
}

impl RootBits {
    /// Starting point of a summary computation: everything optimistic.
    pub const OPTIMISTIC: RootBits = RootBits::INITIALIZED
        .union(RootBits::NO_SOURCE_SECTION)
        .union(RootBits::SAME_SOURCE)
        .union(RootBits::SOURCE_SECTION_HIERARCHICAL);

    const SUMMARY: RootBits = RootBits::OPTIMISTIC;

    pub fn is_initialized(self) -> bool {
        self.contains(RootBits::INITIALIZED)
    }

    pub fn is_no_source_section(self) -> bool {
        self.contains(RootBits::INITIALIZED | RootBits::NO_SOURCE_SECTION)
    }

    pub fn is_same_source(self) -> bool {
        self.contains(RootBits::INITIALIZED | RootBits::SAME_SOURCE)
    }

    pub fn is_hierarchical(self) -> bool {
        self.contains(RootBits::INITIALIZED | RootBits::SOURCE_SECTION_HIERARCHICAL)
    }

    pub fn is_executed(self) -> bool {
        self.contains(RootBits::EXECUTED)
    }

    /// Combine a freshly computed summary into the cached one.
    ///
    /// An uninitialized cache takes the new summary as is; an initialized one
    /// keeps only the optimistic bits both agree on. `EXECUTED` is sticky.
    pub fn refine(self, computed: RootBits) -> RootBits {
        let executed = (self | computed) & RootBits::EXECUTED;
        let summary = if self.is_initialized() {
            self & computed & RootBits::SUMMARY
        } else {
            computed & RootBits::SUMMARY
        };
        summary | executed
    }
}
