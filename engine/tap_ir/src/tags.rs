//! Semantic tags attached to tree nodes.

use std::fmt;

use bitflags::bitflags;

bitflags! {
    /// Set of semantic tags a node carries or a language provides.
    ///
    /// Bits 0-31 are the standard tags every language may declare. Bits 32-63
    /// are reserved for language-specific tags, see [`Tags::custom`].
    #[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
    pub struct Tags: u64 {
        /// A statement in the guest language.
        const STATEMENT = 1 << 0;
        /// A call site.
        const CALL = 1 << 1;
        /// The node spanning a whole function or program unit.
        const ROOT = 1 << 2;
        /// The body of a root, entered after argument setup.
        const ROOT_BODY = 1 << 3;
        /// An expression producing a value.
        const EXPRESSION = 1 << 4;
        /// A read of a local or global variable.
        const READ_VARIABLE = 1 << 5;
        /// A write to a local or global variable.
        const WRITE_VARIABLE = 1 << 6;
        /// A block guarded by an exception handler.
        const TRY_BLOCK = 1 << 7;
        /// A declaration.
        const DECLARATION = 1 << 8;
        /// A literal constant.
        const LITERAL = 1 << 9;

        // Language-specific tags occupy the high half.
        const _ = !0;
    }
}

const CUSTOM_SHIFT: u32 = 32;

impl Tags {
    /// The `index`-th language-specific tag, `None` past the 32 available.
    pub const fn custom(index: u32) -> Option<Tags> {
        if index >= 32 {
            return None;
        }
        Some(Tags::from_bits_retain(1 << (CUSTOM_SHIFT + index)))
    }

    /// Whether every tag of `self` is also in `provided`.
    pub fn is_subset_of(self, provided: Tags) -> bool {
        provided.contains(self)
    }
}

impl fmt::Display for Tags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut sep = |f: &mut fmt::Formatter<'_>| {
            if first {
                first = false;
                Ok(())
            } else {
                f.write_str("|")
            }
        };
        for (name, _) in self.iter_names() {
            sep(f)?;
            f.write_str(name)?;
        }
        let custom = self.bits() >> CUSTOM_SHIFT;
        for index in 0..32u32 {
            if custom & (1 << index) != 0 {
                sep(f)?;
                write!(f, "CUSTOM_{index}")?;
            }
        }
        if first {
            f.write_str("NONE")?;
        }
        Ok(())
    }
}
