// Copyright 2026 stu project contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The per-call borrow of scheduler-wide mutable state that every
//! [`crate::Graph`] operation needs: everything is consolidated into a
//! single `Scheduler` value passed by reference to all top-level
//! operations, with no process-wide statics. `stu_engine::Scheduler` owns
//! the data; `ExecContext` only ever borrows it for the duration of one
//! `Graph::execute`/`Graph::handle_job_completion` call.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use nix::unistd::Pid;
use rand::rngs::StdRng;

use stu_job::signals::PidRegistry;
use stu_job::Statistics;
use stu_place::Failure;
use stu_rule::RuleLookup;

use crate::id::ExecutionId;

/// Borrowed scheduler state for one descent of the graph: the driver is
/// single-threaded and cooperative.
pub struct ExecContext<'a> {
    pub rules: &'a dyn RuleLookup,
    /// Remaining job slots (the `-j` budget); decremented on launch,
    /// incremented on `waited`.
    pub jobs: &'a mut i64,
    pub keep_going: bool,
    pub random: bool,
    pub registry: &'a PidRegistry,
    pub stats: &'a mut Statistics,
    pub pid_to_node: &'a mut HashMap<Pid, ExecutionId>,
    /// In-process map of transient "mtimes": a transient's timestamp lives
    /// in an in-process map, not on disk.
    pub transient_timestamps: &'a mut HashMap<Arc<str>, SystemTime>,
    /// Process startup timestamp; the floor every freshly built file's
    /// mtime must meet.
    pub start_time: SystemTime,
    /// Whether a failed command's partial output should be removed, i.e.
    /// cleanup is not disabled by policy.
    pub remove_on_failure: bool,
    pub failures: &'a mut Vec<Failure>,
    /// Seeded PRNG backing `random` traversal order; `None` whenever
    /// `random` is false.
    pub rng: Option<&'a mut StdRng>,
}

impl ExecContext<'_> {
    pub fn jobs_remaining(&self) -> i64 {
        *self.jobs
    }
}
