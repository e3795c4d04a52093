// Copyright 2026 stu project contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! `ExecutionNode`: one node of the live dependency graph, created on first
//! reference and never destroyed — an in-process memoization cache over
//! the build's lifetime; entries are never removed.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::SystemTime;

use fnv::FnvHashMap;

use stu_flags::{bit, Flags, FlagStack};
use stu_job::Job;
use stu_place::ErrorMask;
use stu_rule::InstantiatedRule;
use stu_target::Target;

use crate::edge::{EdgeLabel, PendingEdge};
use crate::id::ExecutionId;

/// `exists ∈ {-1, 0, +1}`: not yet checked, confirmed absent, confirmed
/// present.
pub type Exists = i8;

pub struct ExecutionNode {
    pub target: Target,
    /// Identity of the pre-instantiation `Rule` this node was matched
    /// against; used only for cycle detection. `None` for a leaf target
    /// with no matching rule.
    pub rule_id: Option<usize>,
    pub rule: Option<InstantiatedRule>,
    pub parents: FnvHashMap<ExecutionId, EdgeLabel>,
    pub children: HashSet<ExecutionId>,
    pub buf_default: VecDeque<PendingEdge>,
    pub buf_trivial: VecDeque<PendingEdge>,
    pub done: FlagStack,
    pub finished: bool,
    pub timestamp_old: Option<SystemTime>,
    pub timestamp: Option<SystemTime>,
    pub need_build: bool,
    pub checked: bool,
    pub exists: Exists,
    pub error: ErrorMask,
    pub mapping_parameter: HashMap<String, String>,
    pub mapping_variable: HashMap<String, String>,
    pub job: Job,
    /// Set once the dynamic base-read edge (`[A] →(Read) A`) has been
    /// pushed, so it is only pushed once even though `initialize` may
    /// conceptually be asked for again on revisit.
    pub initialized: bool,
    /// Set once the first-pass (`buf_default`) deploy loop has started, so
    /// the trivial short-circuit only fires before any real work has
    /// begun.
    pub first_pass_started: bool,
    pub second_pass_started: bool,
    /// Whether the staleness decision has already been made, so
    /// `execute` does not repeat it on re-poll.
    pub staleness_decided: bool,
}

impl ExecutionNode {
    pub fn new(target: Target) -> Self {
        let depth = target.dynamic_depth;
        ExecutionNode {
            target,
            rule_id: None,
            rule: None,
            parents: FnvHashMap::default(),
            children: HashSet::new(),
            buf_default: VecDeque::new(),
            buf_trivial: VecDeque::new(),
            done: FlagStack::zeroed(depth),
            finished: false,
            timestamp_old: None,
            timestamp: None,
            need_build: false,
            checked: false,
            exists: 0,
            error: ErrorMask::none(),
            mapping_parameter: HashMap::new(),
            mapping_variable: HashMap::new(),
            job: Job::new(),
            initialized: false,
            first_pass_started: false,
            second_pass_started: false,
            staleness_decided: false,
        }
    }

    pub fn has_command(&self) -> bool {
        self.rule
            .as_ref()
            .is_some_and(|r| r.command_kind != stu_rule::CommandKind::None)
    }

    /// Approximation of per-edge `avoid`-sensitive obligation tracking: a
    /// placed flag is only treated as active for this node if
    /// *every* current parent edge asserts it (one unconditional parent is
    /// enough to force a real build). See DESIGN.md for the rationale.
    fn all_parents_have(&self, bit: u16) -> bool {
        if self.parents.is_empty() {
            return false;
        }
        self.parents.values().all(|e| e.flags.has(bit))
    }

    pub fn effective_optional(&self) -> bool {
        self.all_parents_have(bit::OPTIONAL)
    }

    pub fn effective_trivial(&self) -> bool {
        self.all_parents_have(bit::TRIVIAL) && !self.any_parent_overrides_trivial()
    }

    pub fn effective_persistent(&self) -> bool {
        self.all_parents_have(bit::PERSISTENT)
    }

    fn any_parent_overrides_trivial(&self) -> bool {
        self.parents.values().any(|e| e.flags.has(bit::OVERRIDE_TRIVIAL))
    }

    /// The placed-flag bits/source-locations this node's consuming edges
    /// agree on, used to hand a dynamic read's parsed dependencies the same
    /// existence/optional/trivial context their `[A]` node itself carries
    /// (unless a parsed dependency already sets that bit itself).
    pub fn effective_placed(&self) -> (Flags, stu_dep::Places) {
        let mut flags = Flags::EMPTY;
        let mut places = stu_dep::Places::empty();
        for (bit_value, effective) in [
            (bit::PERSISTENT, self.effective_persistent()),
            (bit::OPTIONAL, self.effective_optional()),
            (bit::TRIVIAL, self.effective_trivial()),
        ] {
            if !effective {
                continue;
            }
            flags = flags.with(bit_value);
            if let Some(place) = self
                .parents
                .values()
                .find_map(|e| e.flags.has(bit_value).then(|| e.place.clone()))
            {
                places.set(bit_value, place);
            }
        }
        (flags, places)
    }

    pub fn mark_finished(&mut self) {
        self.finished = true;
        self.done.add_highest(Flags::new(bit::PERSISTENT | bit::OPTIONAL | bit::TRIVIAL));
    }
}
