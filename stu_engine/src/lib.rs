// Copyright 2026 stu project contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The `Scheduler`: the single owner of every piece of mutable state the
//! build needs, and the loop that drives [`stu_graph::Graph`] to
//! completion by alternating `execute` with a blocking wait for the next
//! finished subprocess.
//!
//! `stu_engine` is the only crate that assembles an [`stu_graph::ExecContext`];
//! every other crate only ever borrows one: a single mutable "session"
//! value holds all scheduler state, and its borrows are threaded down into
//! library calls rather than reaching for process-wide statics.

pub mod ruletext;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use nix::unistd::Pid;
use rand::rngs::StdRng;
use rand::SeedableRng;

use stu_dep::Dep;
use stu_flags::{Flags, FlagStack};
use stu_graph::{EdgeLabel, ExecContext, ExecutionId, Graph, PendingEdge};
use stu_job::Statistics;
use stu_place::{ErrorMask, Failure, Place};
use stu_rule::RuleLookup;
use stu_target::Target;

/// The target every command-line request is attached under: the root
/// execution whose work queue is those dependencies.
const ROOT_TARGET_NAME: &str = "@root";

#[derive(Debug, Clone)]
pub struct Options {
    /// `-j`/`--jobs`: the number of concurrent subprocess slots.
    pub jobs: i64,
    /// `-k`/`--keep-going`: whether one failed target aborts the whole build.
    pub keep_going: bool,
    /// `--random`: shuffle sibling traversal order instead of declaration order.
    pub random: bool,
    /// Seed backing the `--random` traversal order; ignored when `random` is false.
    pub seed: u64,
    pub remove_on_failure: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            jobs: 1,
            keep_going: false,
            random: false,
            seed: 0,
            remove_on_failure: true,
        }
    }
}

/// Owns the live graph plus every other piece of mutable state the
/// scheduler needs: job-slot budget, `pid -> Execution` map, statistics,
/// the in-process transient-timestamp table, and the accumulated build
/// errors.
pub struct Scheduler<'r> {
    graph: Graph,
    rules: &'r dyn RuleLookup,
    jobs: i64,
    keep_going: bool,
    random: bool,
    rng: Option<StdRng>,
    stats: Statistics,
    pid_to_node: HashMap<Pid, ExecutionId>,
    transient_timestamps: HashMap<Arc<str>, SystemTime>,
    start_time: SystemTime,
    remove_on_failure: bool,
    failures: Vec<Failure>,
}

impl<'r> Scheduler<'r> {
    pub fn new(rules: &'r dyn RuleLookup, options: Options) -> Self {
        Scheduler {
            graph: Graph::new(),
            rules,
            jobs: options.jobs,
            keep_going: options.keep_going,
            random: options.random,
            rng: options.random.then(|| StdRng::seed_from_u64(options.seed)),
            stats: Statistics::default(),
            pid_to_node: HashMap::new(),
            transient_timestamps: HashMap::new(),
            start_time: SystemTime::now(),
            remove_on_failure: options.remove_on_failure,
            failures: Vec::new(),
        }
    }

    pub fn statistics(&self) -> Statistics {
        self.stats
    }

    pub fn failures(&self) -> &[Failure] {
        &self.failures
    }

    /// Build every one of `targets`, returning the combined error mask
    /// (the process exit-code bits) once the root execution is finished,
    /// or propagating the first fatal/non-keep-going failure.
    pub fn build(&mut self, targets: Vec<Dep>) -> Result<ErrorMask, Failure> {
        let root = self.graph.get_or_alloc(self.rules, Target::transient(ROOT_TARGET_NAME))?;
        for dep in targets {
            self.graph.node_mut(root).buf_default.push_back(PendingEdge {
                edge: EdgeLabel::new(FlagStack::new(), Flags::EMPTY, Place::Empty),
                dep,
            });
        }
        self.run_to_completion(root)?;
        Ok(self.graph.node(root).error)
    }

    fn run_to_completion(&mut self, root: ExecutionId) -> Result<(), Failure> {
        // Rebuilt on every iteration rather than cached: borrowing the
        // scheduler's fields directly (instead of through a `&mut self`
        // helper method) is what lets this borrow coexist with the
        // `self.graph.execute(...)` call right below it.
        macro_rules! ctx {
            () => {
                ExecContext {
                    rules: self.rules,
                    jobs: &mut self.jobs,
                    keep_going: self.keep_going,
                    random: self.random,
                    registry: stu_job::signals::registry(),
                    stats: &mut self.stats,
                    pid_to_node: &mut self.pid_to_node,
                    transient_timestamps: &mut self.transient_timestamps,
                    start_time: self.start_time,
                    remove_on_failure: self.remove_on_failure,
                    failures: &mut self.failures,
                    rng: self.rng.as_mut(),
                }
            };
        }

        loop {
            {
                let mut ctx = ctx!();
                self.graph.execute(&mut ctx, root)?;
            }
            if self.graph.node(root).finished {
                return Ok(());
            }
            if !self.pid_to_node.is_empty() {
                let (pid, status) = stu_job::wait_any()?;
                let mut ctx = ctx!();
                self.graph.handle_job_completion(&mut ctx, pid, status)?;
            }
        }
    }
}

#[cfg(test)]
mod tests;
