// Copyright 2026 stu project contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! `EdgeLabel` and the work-queue entries built from a node's (normalized)
//! rule dependencies.

use stu_dep::Dep;
use stu_flags::{bit, Flags, FlagStack};
use stu_place::Place;

/// `(avoid, flags, place, dep)`. `avoid` is the per-level record of which
/// transitive obligations the parent has already neutralized for the
/// child; `dep` is only needed transiently while the edge is still queued
/// (a committed parent→child link only needs `avoid`/`flags`/`place`/
/// `variable_name`, so `dep` lives on [`PendingEdge`] instead, dropped once
/// the edge is deployed).
#[derive(Debug, Clone)]
pub struct EdgeLabel {
    pub avoid: FlagStack,
    pub flags: Flags,
    pub place: Place,
    /// Explicit `$name` override for a `Variable` edge; `None` means "use
    /// the filename".
    pub variable_name: Option<String>,
}

impl EdgeLabel {
    pub fn new(avoid: FlagStack, flags: Flags, place: Place) -> Self {
        EdgeLabel {
            avoid,
            flags,
            place,
            variable_name: None,
        }
    }

    pub fn is_read(&self) -> bool {
        self.flags.has(bit::READ)
    }

    pub fn is_existence_only(&self) -> bool {
        self.flags.has(bit::EXISTENCE) || self.flags.has(bit::PERSISTENT) || self.is_read()
    }

    /// Union another occurrence of the "same" edge into this one: unions
    /// `avoid` and `flags` if the pair already exists.
    pub fn union(&mut self, other: &EdgeLabel) {
        self.avoid.add(&other.avoid);
        self.flags = self.flags.union(other.flags);
        if self.variable_name.is_none() {
            self.variable_name = other.variable_name.clone();
        }
    }
}

/// One not-yet-deployed entry of a node's `buf_default`/`buf_trivial` queue:
/// an `EdgeLabel` still carrying the raw (normalized) `Dep` it came from, so
/// `deploy` can resolve it into concrete target(s).
#[derive(Debug, Clone)]
pub struct PendingEdge {
    pub edge: EdgeLabel,
    pub dep: Dep,
}
