// Copyright 2026 stu project contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! `Target`: the canonical identity of a buildable unit.
//!
//! A target is `(kind, name, dynamic_depth)`. Names are kept behind an `Arc`
//! so that cloning a `Target` — which happens constantly while normalizing
//! dependencies and walking the graph — never touches the heap; equality and
//! hashing fall back to string content only on the (rare) hash collision,
//! exactly as interned strings would behave.

use std::fmt;
use std::sync::Arc;

use stu_flags::{bit, Flags};

/// Whether a target names a real file on disk, or an abstract, file-less
/// build step ("Transient").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetKind {
    File,
    Transient,
}

impl TargetKind {
    pub fn is_transient(self) -> bool {
        matches!(self, TargetKind::Transient)
    }

    /// The target-kind flag bit a `Plain` dependency to a target of this
    /// kind must carry: the `TargetTransient` flag bit equals the target's
    /// transient-ness.
    pub fn flag_bit(self) -> u16 {
        match self {
            TargetKind::File => 0,
            TargetKind::Transient => bit::TARGET_TRANSIENT,
        }
    }
}

/// `(kind, name)` plus the dynamic depth: depth 0 is a plain file/transient;
/// depth `d > 0` denotes "the content of a file that, when read, yields
/// depth-`(d-1)` dependencies".
#[derive(Clone, Eq)]
pub struct Target {
    pub kind: TargetKind,
    pub name: Arc<str>,
    pub dynamic_depth: u32,
}

impl Target {
    pub fn new(kind: TargetKind, name: impl Into<Arc<str>>, dynamic_depth: u32) -> Self {
        Target {
            kind,
            name: name.into(),
            dynamic_depth,
        }
    }

    pub fn file(name: impl Into<Arc<str>>) -> Self {
        Self::new(TargetKind::File, name, 0)
    }

    pub fn transient(name: impl Into<Arc<str>>) -> Self {
        Self::new(TargetKind::Transient, name, 0)
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }

    pub fn is_dynamic(&self) -> bool {
        self.dynamic_depth > 0
    }

    /// The target one dynamic level further in (`[self]`): same kind/name,
    /// depth `+1`. This is how the engine denotes "the parsed-dependency
    /// content of `self`".
    pub fn one_level_deeper(&self) -> Self {
        Target {
            kind: self.kind,
            name: self.name.clone(),
            dynamic_depth: self.dynamic_depth + 1,
        }
    }

    /// The target one dynamic level shallower: the base file a `[A]` target
    /// is read from (the base-level `Read` edge).
    pub fn base(&self) -> Self {
        assert!(self.dynamic_depth > 0, "base() requires a dynamic target");
        Target {
            kind: self.kind,
            name: self.name.clone(),
            dynamic_depth: self.dynamic_depth - 1,
        }
    }

    /// The flags a `Plain` dependency targeting `self` must carry for the
    /// target-kind/dynamic-kind bits.
    pub fn required_flags(&self) -> Flags {
        let mut bits = self.kind.flag_bit();
        if self.is_dynamic() {
            bits |= bit::TARGET_DYNAMIC;
        }
        Flags::new(bits)
    }
}

impl PartialEq for Target {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.dynamic_depth == other.dynamic_depth && self.name == other.name
    }
}

impl std::hash::Hash for Target {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
        self.dynamic_depth.hash(state);
        self.name.hash(state);
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for _ in 0..self.dynamic_depth {
            write!(f, "[")?;
        }
        if self.is_transient() {
            write!(f, "@")?;
        }
        write!(f, "{}", self.name)?;
        for _ in 0..self.dynamic_depth {
            write!(f, "]")?;
        }
        Ok(())
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_is_by_kind_name_and_depth() {
        let a = Target::file("foo");
        let b = Target::file("foo");
        let c = Target::transient("foo");
        let d = a.one_level_deeper();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn one_level_deeper_and_base_are_inverses() {
        let a = Target::file("list");
        let dyn_a = a.one_level_deeper();
        assert_eq!(dyn_a.dynamic_depth, 1);
        assert_eq!(dyn_a.base(), a);
    }

    #[test]
    fn required_flags_match_kind() {
        let file = Target::file("a");
        assert!(!file.required_flags().has(bit::TARGET_TRANSIENT));
        let transient = Target::transient("a");
        assert!(transient.required_flags().has(bit::TARGET_TRANSIENT));
        let dynamic = file.one_level_deeper();
        assert!(dynamic.required_flags().has(bit::TARGET_DYNAMIC));
    }

    #[test]
    fn debug_rendering() {
        let t = Target::transient("clean").one_level_deeper();
        assert_eq!(format!("{t:?}"), "[@clean]");
    }
}
