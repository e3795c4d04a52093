// Copyright 2026 stu project contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! `Graph`: the arena of [`ExecutionNode`]s plus the execute/execute_children/
//! unlink triad. Entries are interned by key into a plain `Vec` arena,
//! never removed, and parent/child links are index sets rather than owning
//! pointers — the same shape as a `graph::Entry`-style arena, but without
//! an async `Node` trait or a `tokio` scheduler backing it: this one is
//! single-threaded and cooperative end to end. Every method here runs to
//! completion on the caller's stack, and the only true suspension point
//! lives one layer up, in `stu_engine::Scheduler`'s `wait_any` call.
//!
//! See DESIGN.md for the handful of places this implementation picks a
//! concrete, documented resolution where the design is otherwise open-ended
//! (the exact `avoid`-stack shape threaded through nested dynamic
//! dependencies, and dynamic-operand concatenation, most notably).

use std::collections::hash_map::Entry;
use std::ffi::CString;
use std::path::{Path, PathBuf};

use fnv::FnvHashMap;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;

use stu_dep::{Dep, Places};
use stu_dynamic::read_dynamic;
use stu_flags::{bit, Flags, FlagStack};
use stu_job::{interpret_wait_status, WaitOutcome};
use stu_place::{ErrorAccumulator, ErrorKind, Failure, Place};
use stu_rule::{CommandKind, InstantiatedRule, RuleLookup};
use stu_target::{Target, TargetKind};

use crate::context::ExecContext;
use crate::cycle;
use crate::edge::{EdgeLabel, PendingEdge};
use crate::id::ExecutionId;
use crate::node::ExecutionNode;

/// The arena of every [`ExecutionNode`] reached so far, keyed by its
/// canonical [`Target`]: nodes are interned and never freed during a run.
pub struct Graph {
    nodes: Vec<ExecutionNode>,
    by_target: FnvHashMap<Target, ExecutionId>,
}

impl Graph {
    pub fn new() -> Self {
        Graph {
            nodes: Vec::new(),
            by_target: FnvHashMap::default(),
        }
    }

    pub fn node(&self, id: ExecutionId) -> &ExecutionNode {
        &self.nodes[id.index()]
    }

    pub fn node_mut(&mut self, id: ExecutionId) -> &mut ExecutionNode {
        &mut self.nodes[id.index()]
    }

    pub fn find(&self, target: &Target) -> Option<ExecutionId> {
        self.by_target.get(target).copied()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Get-or-allocate a node for `target`, instantiating its rule on first
    /// allocation, without linking any parent edge — the edge-union/
    /// cycle-check steps belong to parented requests, handled by
    /// [`Graph::get_execution`].
    pub fn get_or_alloc(&mut self, rules: &dyn RuleLookup, target: Target) -> Result<ExecutionId, Failure> {
        if let Some(&id) = self.by_target.get(&target) {
            return Ok(id);
        }
        let rule = rules.lookup(&target)?;
        let mut node = ExecutionNode::new(target.clone());
        node.rule_id = rule.as_ref().map(|r| r.rule_id);
        if let Some(r) = &rule {
            node.mapping_parameter = r.bindings.clone();
        }
        let id = ExecutionId(self.nodes.len() as u32);
        self.nodes.push(node);
        self.by_target.insert(target.clone(), id);
        if let Some(r) = rule {
            self.push_rule_deps(id, &r);
            self.node_mut(id).rule = Some(r);
        }
        self.initialize(rules, id, &FlagStack::zeroed(target.dynamic_depth))?;
        Ok(id)
    }

    /// Resolve `target` to its (cached) [`ExecutionNode`], creating it if
    /// this is the first reference, linking the `parent -> child` edge, and
    /// running strong-cycle detection on a fresh allocation.
    pub fn get_execution(
        &mut self,
        rules: &dyn RuleLookup,
        target: Target,
        parent: ExecutionId,
        edge: EdgeLabel,
    ) -> Result<ExecutionId, Failure> {
        if let Some(&id) = self.by_target.get(&target) {
            let child_rule_id = self.node(id).rule_id;
            if let Some(trace) = cycle::detect(self, parent, child_rule_id, target.kind) {
                return Err(self.cycle_failure(&trace, &target));
            }
            self.link(parent, id, edge);
            return Ok(id);
        }

        let rule = rules.lookup(&target)?;
        let child_rule_id = rule.as_ref().map(|r| r.rule_id);
        if let Some(trace) = cycle::detect(self, parent, child_rule_id, target.kind) {
            return Err(self.cycle_failure(&trace, &target));
        }

        let id = ExecutionId(self.nodes.len() as u32);
        let node = ExecutionNode::new(target.clone());
        self.nodes.push(node);
        self.by_target.insert(target.clone(), id);
        self.node_mut(id).rule_id = child_rule_id;

        if rule.is_none() {
            self.check_no_rule(&target, &edge)?;
        } else if let Some(r) = rule {
            self.node_mut(id).mapping_parameter = r.bindings.clone();
            self.push_rule_deps(id, &r);
            self.node_mut(id).rule = Some(r);
        }

        self.link(parent, id, edge.clone());
        self.initialize(rules, id, &edge.avoid)?;
        Ok(id)
    }

    fn link(&mut self, parent: ExecutionId, child: ExecutionId, edge: EdgeLabel) {
        match self.node_mut(child).parents.entry(parent) {
            Entry::Occupied(mut occupied) => occupied.get_mut().union(&edge),
            Entry::Vacant(vacant) => {
                vacant.insert(edge);
            }
        }
        self.node_mut(parent).children.insert(child);
    }

    fn cycle_failure(&self, trace: &[ExecutionId], target: &Target) -> Failure {
        let message = if trace.len() <= 1 {
            "target must not depend on itself"
        } else {
            "cyclic dependency"
        };
        let mut failure = Failure::logical(message);
        failure = failure.with_trace(Place::Empty, format!("needed by '{target}'"));
        for &id in trace {
            let node = self.node(id);
            failure = failure.with_trace(Place::Empty, format!("needed by '{}'", node.target));
        }
        failure
    }

    /// What happens when `RuleSet::lookup` found no rule at
    /// all. File targets get a one-time existence check; transient targets
    /// always error; dynamic targets are left to the base-file read.
    fn check_no_rule(&mut self, target: &Target, edge: &EdgeLabel) -> Result<(), Failure> {
        if target.is_dynamic() {
            return Ok(());
        }
        match target.kind {
            TargetKind::File => {
                if edge.flags.has(bit::OPTIONAL) {
                    return Ok(());
                }
                match std::fs::metadata(target.name.as_ref()) {
                    Ok(_) => Ok(()),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        Err(Failure::build(format!("no rule to build '{}'", target.name)))
                    }
                    Err(e) => Err(Failure::build(format!("{}: {e}", target.name))),
                }
            }
            TargetKind::Transient => Err(Failure::logical(format!(
                "no rule to build transient target '{}'",
                target.name
            ))),
        }
    }

    /// Normalize and queue a freshly-instantiated rule's dependencies onto
    /// `buf_default`. For a transient target,
    /// the rule's own placed flags are additionally unioned into every
    /// dependency up front: a transient step has no mtime of its own, so the
    /// obligations placed on *it* (e.g. `-p`/`-o`) are the obligations every
    /// one of its dependencies inherits too.
    fn push_rule_deps(&mut self, id: ExecutionId, rule: &InstantiatedRule) {
        let is_transient = self.node(id).target.is_transient();
        let mut acc = ErrorAccumulator::new(true);
        let mut normalized = Vec::new();
        for dep in &rule.deps {
            let mut dep = dep.clone();
            if is_transient {
                union_flags(&mut dep, self.node(id).done.get_lowest());
            }
            normalized.extend(stu_dep::normalize(dep, &mut acc));
        }
        for failure in acc.into_failures() {
            self.node_mut(id).error.add(failure.kind);
        }
        for dep in normalized {
            let place = dep_place(&dep);
            let pending = PendingEdge {
                edge: EdgeLabel::new(FlagStack::zeroed(0), Flags::EMPTY, place),
                dep,
            };
            self.node_mut(id).buf_default.push_back(pending);
        }
    }

    /// The base-level read edge: a dynamic target `[A]` always
    /// depends on its base file `A`, tagged `Read`, pushed exactly once.
    fn initialize(&mut self, rules: &dyn RuleLookup, id: ExecutionId, avoid: &FlagStack) -> Result<(), Failure> {
        if self.node(id).initialized {
            return Ok(());
        }
        self.node_mut(id).initialized = true;
        let target = self.node(id).target.clone();
        if !target.is_dynamic() {
            return Ok(());
        }
        let base = target.base();
        let mut base_avoid = FlagStack::zeroed(base.dynamic_depth);
        for j in 0..=base.dynamic_depth {
            if j <= avoid.k() {
                base_avoid.add_highest(avoid.get(j));
                if j != base.dynamic_depth {
                    base_avoid.push().ok();
                }
            }
        }
        let edge = EdgeLabel::new(base_avoid, Flags::new(bit::READ | base.required_flags().0), Place::Empty);
        self.get_execution(rules, base, id, edge)?;
        Ok(())
    }

    /// The re-entrant per-node execute step. Returns `Ok(true)`
    /// when the caller should keep driving this subtree immediately
    /// (progress was made or is still possible without blocking on `wait`),
    /// `Ok(false)` when this node is blocked on an outstanding child/job or
    /// has finished.
    pub fn execute(&mut self, ctx: &mut ExecContext, id: ExecutionId) -> Result<bool, Failure> {
        if self.node(id).finished {
            return Ok(false);
        }

        if !ctx.random && self.execute_children(ctx, id)? {
            return Ok(true);
        }

        let target = self.node(id).target.clone();

        if !self.node(id).checked && target.kind == TargetKind::File && self.node(id).effective_optional() {
            match std::fs::metadata(target.name.as_ref()) {
                Ok(meta) => {
                    self.node_mut(id).exists = 1;
                    self.node_mut(id).timestamp_old = meta.modified().ok();
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    self.node_mut(id).exists = -1;
                    self.node_mut(id).checked = true;
                    self.node_mut(id).mark_finished();
                    return Ok(false);
                }
                Err(e) => return Err(Failure::build(format!("{}: {e}", target.name))),
            }
            self.node_mut(id).checked = true;
        }

        if !self.node(id).first_pass_started && self.node(id).effective_trivial() {
            self.node_mut(id).mark_finished();
            return Ok(false);
        }

        self.node_mut(id).first_pass_started = true;
        while let Some(pending) = self.node_mut(id).buf_default.pop_front() {
            let mut mirror_edge = pending.edge.clone();
            mirror_edge.flags = mirror_edge.flags.with(bit::OVERRIDE_TRIVIAL);
            self.node_mut(id).buf_trivial.push_back(PendingEdge {
                edge: mirror_edge,
                dep: pending.dep.clone(),
            });
            self.deploy(ctx, id, &pending.dep, &pending.edge.avoid, pending.edge.flags)?;
            if ctx.random && self.execute_children(ctx, id)? {
                return Ok(true);
            }
            if ctx.jobs_remaining() == 0 {
                return Ok(false);
            }
        }

        if ctx.random && self.execute_children(ctx, id)? {
            return Ok(true);
        }

        if !self.node(id).children.is_empty() {
            return Ok(false);
        }

        if !self.node(id).error.is_empty() {
            if ctx.keep_going {
                self.node_mut(id).mark_finished();
                return Ok(false);
            }
            return Err(ctx
                .failures
                .last()
                .cloned()
                .unwrap_or_else(|| Failure::build("a dependency failed to build")));
        }

        let is_commandless_non_file = (target.is_transient() && !self.node(id).has_command()) || target.is_dynamic();
        if is_commandless_non_file {
            self.node_mut(id).mark_finished();
            return Ok(false);
        }

        if self.node(id).job.started_or_waited() {
            return Ok(false);
        }

        if !self.node(id).staleness_decided {
            if target.is_transient() {
                let needs_build = !ctx.transient_timestamps.contains_key(&target.name);
                let current = self.node(id).need_build;
                self.node_mut(id).need_build = current || needs_build;
            } else {
                self.decide_file_staleness(id, ctx)?;
            }
            self.node_mut(id).staleness_decided = true;
        }

        self.node_mut(id).second_pass_started = true;
        while let Some(pending) = self.node_mut(id).buf_trivial.pop_front() {
            self.deploy(ctx, id, &pending.dep, &pending.edge.avoid, pending.edge.flags)?;
            if ctx.random && self.execute_children(ctx, id)? {
                return Ok(true);
            }
            if ctx.jobs_remaining() == 0 {
                return Ok(false);
            }
        }

        if !self.node(id).children.is_empty() {
            return Ok(false);
        }

        self.launch_or_finish(ctx, id)?;
        Ok(true)
    }

    /// Revisit every currently-open child, recursing into its own
    /// `execute`, and `unlink` it once it reports finished.
    fn execute_children(&mut self, ctx: &mut ExecContext, id: ExecutionId) -> Result<bool, Failure> {
        let mut children: Vec<ExecutionId> = self.node(id).children.iter().copied().collect();
        if ctx.random {
            if let Some(rng) = ctx.rng.as_deref_mut() {
                shuffle(&mut children, rng);
            }
        }

        let mut progressed = false;
        for child in children {
            if !self.node(id).children.contains(&child) {
                continue;
            }
            let more = self.execute(ctx, child)?;
            progressed |= more;
            if self.node(child).finished {
                self.unlink(ctx, id, child)?;
            }
            if ctx.jobs_remaining() == 0 {
                return Ok(progressed);
            }
        }
        Ok(progressed)
    }

    /// Fold a finished child's results back into its parent, then
    /// drop the edge.
    fn unlink(&mut self, ctx: &mut ExecContext, parent: ExecutionId, child: ExecutionId) -> Result<(), Failure> {
        let edge = self
            .node(child)
            .parents
            .get(&parent)
            .cloned()
            .expect("unlink called on a non-edge");

        if edge.is_read() {
            let child_optional_absent = self.node(child).effective_optional() && self.node(child).exists == -1;
            if self.node(child).error.is_empty() && !child_optional_absent {
                self.ingest_dynamic_content(ctx, parent, child)?;
            }
        }

        if !edge.is_existence_only() {
            if let Some(child_ts) = self.node(child).timestamp {
                let parent_ts = self.node(parent).timestamp;
                let new_ts = Some(parent_ts.map_or(child_ts, |p| p.max(child_ts)));
                self.node_mut(parent).timestamp = new_ts;
            }
        }

        if edge.flags.has(bit::VARIABLE) {
            let child_target = self.node(child).target.clone();
            let child_exists = self.node(child).exists != -1;
            if child_exists {
                let content = std::fs::read_to_string(child_target.name.as_ref())
                    .map_err(|e| Failure::build(format!("{}: {e}", child_target.name)))?;
                let trimmed = content.trim_matches(|c: char| c.is_ascii_whitespace()).to_string();
                let name = edge
                    .variable_name
                    .clone()
                    .unwrap_or_else(|| child_target.name.to_string());
                self.node_mut(parent).mapping_variable.insert(name, trimmed);
            }
        }

        let parent_target = self.node(parent).target.clone();
        if (parent_target.is_transient() && !self.node(parent).has_command()) || parent_target.is_dynamic() {
            let child_vars = self.node(child).mapping_variable.clone();
            self.node_mut(parent).mapping_variable.extend(child_vars);
        }

        let child_error = self.node(child).error;
        self.node_mut(parent).error.merge(child_error);

        if !edge.is_existence_only() {
            let child_need_build = self.node(child).need_build;
            let current = self.node(parent).need_build;
            self.node_mut(parent).need_build = current || child_need_build;
        }

        self.node_mut(child).parents.remove(&parent);
        self.node_mut(parent).children.remove(&child);
        Ok(())
    }

    /// `[A]` unlinking `A` parses `A`'s content as one dependency
    /// per record and folds the result into `A`'s parent's (the `[A]` node)
    /// `buf_default`, so it is deployed on the next `execute` pass.
    fn ingest_dynamic_content(&mut self, ctx: &mut ExecContext, dynamic_id: ExecutionId, base_id: ExecutionId) -> Result<(), Failure> {
        let base_target = self.node(base_id).target.clone();
        let dynamic_target = self.node(dynamic_id).target.clone();
        let content = std::fs::read(base_target.name.as_ref())
            .map_err(|e| Failure::build(format!("{}: {e}", base_target.name)))?;

        let nul_separated = self
            .node(dynamic_id)
            .parents
            .values()
            .any(|e| e.flags.has(bit::NUL_SEPARATED));
        let remaining_levels = dynamic_target.dynamic_depth.saturating_sub(1);
        let (parent_flags, parent_places) = self.node(dynamic_id).effective_placed();

        let deps = match read_dynamic(&content, parent_flags, &parent_places, remaining_levels, nul_separated) {
            Ok(deps) => deps,
            Err(failure) => {
                self.node_mut(dynamic_id).error.add(failure.kind);
                if !ctx.keep_going {
                    return Err(failure);
                }
                ctx.failures.push(failure);
                Vec::new()
            }
        };

        for dep in deps {
            let place = dep_place(&dep);
            self.node_mut(dynamic_id).buf_default.push_back(PendingEdge {
                edge: EdgeLabel::new(FlagStack::zeroed(0), Flags::EMPTY, place),
                dep,
            });
        }
        Ok(())
    }

    /// The file staleness decision.
    fn decide_file_staleness(&mut self, id: ExecutionId, ctx: &mut ExecContext) -> Result<(), Failure> {
        let target = self.node(id).target.clone();
        if !self.node(id).checked {
            match std::fs::metadata(target.name.as_ref()) {
                Ok(meta) => {
                    self.node_mut(id).exists = 1;
                    let mtime = meta.modified().ok();
                    if let Some(mt) = mtime {
                        if mt > ctx.start_time {
                            log::warn!("'{}' has a modification time in the future", target.name);
                        }
                    }
                    self.node_mut(id).timestamp_old = mtime;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    self.node_mut(id).exists = -1;
                }
                Err(e) => return Err(Failure::build(format!("{}: {e}", target.name))),
            }
            self.node_mut(id).checked = true;
        }

        let has_command = self.node(id).has_command();
        let exists = self.node(id).exists;

        if exists == 1 {
            let old_ts = self.node(id).timestamp_old;
            let child_ts = self.node(id).timestamp;
            let stale = matches!((old_ts, child_ts), (Some(old), Some(child)) if child > old);
            if stale {
                if has_command {
                    self.node_mut(id).need_build = true;
                } else {
                    log::warn!(
                        "'{}' is older than its dependencies but has no command to rebuild it",
                        target.name
                    );
                    self.node_mut(id).timestamp = old_ts;
                }
            } else {
                self.node_mut(id).timestamp = old_ts;
            }
        } else {
            let optional = self.node(id).effective_optional();
            if has_command {
                self.node_mut(id).need_build = true;
            } else if !optional {
                return Err(Failure::build(format!(
                    "'{}' does not exist and has no command to build it",
                    target.name
                )));
            }
        }
        Ok(())
    }

    /// Launch the rule's command, write hardcoded
    /// content, or simply mark this node finished if no rebuild is needed.
    fn launch_or_finish(&mut self, ctx: &mut ExecContext, id: ExecutionId) -> Result<(), Failure> {
        let needs_build = self.node(id).need_build && self.node(id).has_command();
        if !needs_build {
            self.node_mut(id).mark_finished();
            return Ok(());
        }

        let rule = self.node(id).rule.clone().expect("has_command implies a rule");
        let target = self.node(id).target.clone();

        match rule.command_kind {
            CommandKind::None => {
                self.node_mut(id).mark_finished();
            }
            CommandKind::Hardcoded => {
                let content = rule.command.clone().unwrap_or_default();
                write_atomically(Path::new(target.name.as_ref()), content.as_bytes())?;
                let mtime = std::fs::metadata(target.name.as_ref()).ok().and_then(|m| m.modified().ok());
                self.node_mut(id).timestamp = mtime;
                self.node_mut(id).exists = 1;
                self.node_mut(id).mark_finished();
            }
            CommandKind::Copy => {
                let source = rule.copy_source.clone().unwrap_or_default();
                let command = format!("cp -- '{}' '{}'", shell_quote(&source), shell_quote(&target.name));
                self.spawn_job(ctx, id, &command, None, None)?;
            }
            CommandKind::Shell => {
                // `redirect_index` marks a rule whose command's stdout is the
                // target's own content; `Some` means redirect stdout into
                // the target file being built.
                let output = rule
                    .redirect_index
                    .map(|_| PathBuf::from(target.name.as_ref()));
                let input = rule.input_filename.clone().map(PathBuf::from);
                let command = rule.command.clone().unwrap_or_default();
                self.spawn_job(ctx, id, &command, output.as_deref(), input.as_deref())?;
            }
        }
        Ok(())
    }

    fn spawn_job(
        &mut self,
        ctx: &mut ExecContext,
        id: ExecutionId,
        command: &str,
        output: Option<&Path>,
        input: Option<&Path>,
    ) -> Result<(), Failure> {
        let mut mapping = self.node(id).mapping_parameter.clone();
        mapping.extend(self.node(id).mapping_variable.clone());
        let place = self
            .node(id)
            .rule
            .as_ref()
            .map(|r| r.place.clone())
            .unwrap_or(Place::Empty);

        self.node_mut(id)
            .job
            .start(command, &mapping, output, input, &place, ctx.registry, ctx.stats)?;
        let pid = self.node(id).job.pid().expect("start() leaves the job Started");
        ctx.pid_to_node.insert(pid, id);
        *ctx.jobs -= 1;
        Ok(())
    }

    /// `waited`: handle one reaped subprocess, re-stat its target
    /// on success, and run the partial-output cleanup policy on failure.
    pub fn handle_job_completion(&mut self, ctx: &mut ExecContext, pid: Pid, status: WaitStatus) -> Result<(), Failure> {
        let id = *ctx.pid_to_node.get(&pid).expect("reaped an unknown pid");
        ctx.pid_to_node.remove(&pid);
        *ctx.jobs += 1;

        let outcome = interpret_wait_status(status);
        {
            let guard = stu_job::signals::block_terminating()?;
            ctx.registry.unregister(pid);
            drop(guard);
        }
        self.node_mut(id).job.mark_waited(pid, &outcome, ctx.stats);
        let target = self.node(id).target.clone();

        if outcome.is_success() {
            self.on_job_success(ctx, id, &target)?;
            self.node_mut(id).mark_finished();
            Ok(())
        } else {
            self.on_job_failure(ctx, id, &target, &outcome)
        }
    }

    fn on_job_success(&mut self, ctx: &mut ExecContext, id: ExecutionId, target: &Target) -> Result<(), Failure> {
        if target.kind == TargetKind::File {
            let meta = std::fs::metadata(target.name.as_ref())
                .map_err(|_| Failure::build(format!("'{}' was not created by its command", target.name)))?;
            let is_symlink = std::fs::symlink_metadata(target.name.as_ref())
                .map(|m| m.file_type().is_symlink())
                .unwrap_or(false);
            let mtime = meta.modified().ok();
            if !is_symlink {
                if let Some(mt) = mtime {
                    if mt < ctx.start_time {
                        return Err(Failure::build(format!(
                            "'{}' command succeeded, but the file's mtime is older than the build's start time",
                            target.name
                        )));
                    }
                }
            }
            self.node_mut(id).timestamp = mtime;
            self.node_mut(id).exists = 1;
        } else {
            ctx.transient_timestamps.insert(target.name.clone(), ctx.start_time);
        }
        Ok(())
    }

    fn on_job_failure(
        &mut self,
        ctx: &mut ExecContext,
        id: ExecutionId,
        target: &Target,
        outcome: &WaitOutcome,
    ) -> Result<(), Failure> {
        let failure = Failure::build(format!("target '{}' {}", target.name, outcome.describe()));
        self.node_mut(id).error.add(ErrorKind::Build);

        if target.kind == TargetKind::File && ctx.remove_on_failure {
            let before = self.node(id).timestamp_old;
            if let Ok(meta) = std::fs::metadata(target.name.as_ref()) {
                let advanced = match (before, meta.modified().ok()) {
                    (Some(b), Some(now)) => now > b,
                    (None, Some(_)) => true,
                    _ => false,
                };
                if advanced {
                    if let Ok(cpath) = CString::new(target.name.as_bytes()) {
                        eprintln!("stu: *** Removing file '{}'", target.name);
                        stu_job::cleanup::remove_if_existing(&cpath);
                    }
                }
            }
        }

        if ctx.keep_going {
            ctx.failures.push(failure);
            self.node_mut(id).mark_finished();
            Ok(())
        } else {
            Err(failure)
        }
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

/// Recursively resolve a normalized [`Dep`]'s *eventual* target shape
/// (kind/name/dynamic depth) without deploying it — used to compute the
/// `[...]`-wrapped target of a `Dynamic` dependency: the inner dep's
/// target, one level deeper.
fn resolve_target_shape(dep: &Dep) -> Result<(Target, Flags, Place), Failure> {
    match dep {
        Dep::Plain(p) => Ok((p.target.clone(), p.flags, p.place_target.clone())),
        Dep::Dynamic(d) => {
            let (inner_target, inner_flags, inner_place) = resolve_target_shape(&d.inner)?;
            Ok((inner_target.one_level_deeper(), inner_flags, inner_place))
        }
        Dep::Concat(_) => Err(Failure::logical(
            "a concatenation cannot be used as the inner target of a dynamic dependency",
        )),
        Dep::Compound(_) => unreachable!("Compound never survives normalize"),
        Dep::Root => Err(Failure::logical("the root sentinel has no target")),
    }
}

impl Graph {
    /// Resolve one normalized dependency into a concrete target and request
    /// its execution as a child of `parent`.
    fn deploy(
        &mut self,
        ctx: &mut ExecContext,
        parent: ExecutionId,
        dep: &Dep,
        base_avoid: &FlagStack,
        base_flags: Flags,
    ) -> Result<(), Failure> {
        match dep {
            Dep::Plain(p) => {
                let mut avoid = base_avoid.clone();
                avoid.add_highest(p.flags);
                let flags = base_flags.union(p.flags).union(p.target.required_flags());
                let mut edge = EdgeLabel::new(avoid, flags, p.place_target.clone());
                edge.variable_name = p.variable_name.clone();
                self.get_execution(ctx.rules, p.target.clone(), parent, edge)?;
                Ok(())
            }
            Dep::Dynamic(d) => {
                let mut avoid = base_avoid.clone();
                avoid
                    .push()
                    .map_err(|_| Failure::fatal("dynamic recursion limit exceeded"))?;
                avoid.add_highest(d.flags);
                let (inner_target, inner_flags, inner_place) = resolve_target_shape(&d.inner)?;
                let target = inner_target.one_level_deeper();
                let flags = base_flags.union(d.flags).union(inner_flags).union(target.required_flags());
                let edge = EdgeLabel::new(avoid, flags, inner_place);
                self.get_execution(ctx.rules, target, parent, edge)?;
                Ok(())
            }
            Dep::Concat(_) => Err(Failure::build(
                "a concatenation with a dynamic operand cannot be deployed until dynamic-dependency \
                 concatenation is implemented (see DESIGN.md Open Question)",
            )),
            Dep::Compound(_) => unreachable!("Compound never survives normalize"),
            Dep::Root => Ok(()),
        }
    }
}

fn union_flags(dep: &mut Dep, flags: Flags) {
    match dep {
        Dep::Plain(p) => p.flags = p.flags.union(flags),
        Dep::Dynamic(d) => d.flags = d.flags.union(flags),
        Dep::Concat(c) => c.flags = c.flags.union(flags),
        Dep::Compound(c) => c.flags = c.flags.union(flags),
        Dep::Root => {}
    }
}

fn dep_place(dep: &Dep) -> Place {
    let places = match dep {
        Dep::Plain(p) => return p.place_target.clone(),
        Dep::Dynamic(d) => &d.places,
        Dep::Concat(c) => &c.places,
        Dep::Compound(c) => &c.places,
        Dep::Root => return Place::Empty,
    };
    places
        .get(bit::PERSISTENT)
        .or_else(|| places.get(bit::OPTIONAL))
        .or_else(|| places.get(bit::TRIVIAL))
        .cloned()
        .unwrap_or(Place::Empty)
}

fn shell_quote(s: &str) -> String {
    s.replace('\'', "'\\''")
}

/// Write `content` to `path` atomically: write to a sibling temp file, then
/// rename over the destination, so a killed `stu` never leaves a half
/// written hardcoded-content target behind.
fn write_atomically(path: &Path, content: &[u8]) -> Result<(), Failure> {
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| Failure::build(format!("{}: {e}", path.display())))?;
    use std::io::Write;
    tmp.write_all(content)
        .map_err(|e| Failure::build(format!("{}: {e}", path.display())))?;
    tmp.persist(path)
        .map_err(|e| Failure::build(format!("{}: {e}", path.display())))?;
    Ok(())
}

fn shuffle(items: &mut [ExecutionId], rng: &mut rand::rngs::StdRng) {
    use rand::Rng;
    for i in (1..items.len()).rev() {
        let j = rng.random_range(0..=i);
        items.swap(i, j);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use stu_dep::{Dep, DynamicDep, PlainDep};
    use stu_job::Statistics;
    use stu_place::Place;
    use stu_rule::{CommandKind, InstantiatedRule};
    use tempfile::tempdir;

    struct MapRules(std::collections::HashMap<String, InstantiatedRule>);

    impl RuleLookup for MapRules {
        fn lookup(&self, target: &Target) -> Result<Option<InstantiatedRule>, Failure> {
            if target.dynamic_depth != 0 {
                return Ok(None);
            }
            Ok(self.0.get(target.name.as_ref()).cloned())
        }
    }

    fn rule(id: usize, command: &str, command_kind: CommandKind, deps: Vec<Dep>) -> InstantiatedRule {
        InstantiatedRule {
            rule_id: id,
            command: Some(command.to_string()),
            command_kind,
            redirect_index: None,
            input_filename: None,
            deps,
            bindings: HashMap::new(),
            place: Place::Empty,
            copy_source: None,
        }
    }

    fn plain_dep(name: &str) -> Dep {
        Dep::Plain(PlainDep {
            flags: Flags::EMPTY,
            places: Places::empty(),
            place_target: Place::Empty,
            variable_name: None,
            target: Target::file(name),
        })
    }

    fn new_ctx<'a>(
        rules: &'a dyn RuleLookup,
        jobs: &'a mut i64,
        stats: &'a mut Statistics,
        pid_to_node: &'a mut HashMap<Pid, ExecutionId>,
        transient_timestamps: &'a mut HashMap<Arc<str>, std::time::SystemTime>,
        failures: &'a mut Vec<Failure>,
        registry: &'a stu_job::signals::PidRegistry,
    ) -> ExecContext<'a> {
        ExecContext {
            rules,
            jobs,
            keep_going: false,
            random: false,
            registry,
            stats,
            pid_to_node,
            transient_timestamps,
            start_time: std::time::SystemTime::now(),
            remove_on_failure: true,
            failures,
            rng: None,
        }
    }

    fn run_to_completion(graph: &mut Graph, ctx: &mut ExecContext, root: ExecutionId) -> Result<(), Failure> {
        for _ in 0..10_000 {
            graph.execute(ctx, root)?;
            if graph.node(root).finished {
                return Ok(());
            }
            if !ctx.pid_to_node.is_empty() {
                let (pid, status) = stu_job::wait_any()?;
                graph.handle_job_completion(ctx, pid, status)?;
            }
        }
        panic!("run_to_completion did not converge");
    }

    #[test]
    fn basic_rebuild_runs_b_then_a() {
        let dir = tempdir().unwrap();
        std::env::set_current_dir(dir.path()).unwrap();

        let mut rules_map = std::collections::HashMap::new();
        rules_map.insert(
            "a".to_string(),
            rule(0, "cp b a", CommandKind::Shell, vec![plain_dep("b")]),
        );
        rules_map.insert("b".to_string(), rule(1, "echo hello >b", CommandKind::Shell, vec![]));
        let rules = MapRules(rules_map);

        let mut graph = Graph::new();
        let root = graph.get_or_alloc(&rules, Target::transient("@root")).unwrap();
        let edge = EdgeLabel::new(FlagStack::new(), Flags::EMPTY, Place::Empty);
        graph.node_mut(root).buf_default.push_back(PendingEdge {
            edge: edge.clone(),
            dep: plain_dep("a"),
        });

        let mut jobs = 4i64;
        let mut stats = Statistics::default();
        let mut pid_to_node = HashMap::new();
        let mut transient_timestamps = HashMap::new();
        let mut failures = Vec::new();
        let registry = stu_job::signals::PidRegistry::new();
        let mut ctx = new_ctx(
            &rules,
            &mut jobs,
            &mut stats,
            &mut pid_to_node,
            &mut transient_timestamps,
            &mut failures,
            &registry,
        );

        run_to_completion(&mut graph, &mut ctx, root).unwrap();

        assert_eq!(std::fs::read_to_string("a").unwrap(), "hello\n");
        assert_eq!(stats.executed, 2);
        assert_eq!(stats.succeeded, 2);
    }

    #[test]
    fn cycle_between_two_rules_is_rejected() {
        let mut rules_map = std::collections::HashMap::new();
        rules_map.insert("a".to_string(), rule(0, "true", CommandKind::Shell, vec![plain_dep("b")]));
        rules_map.insert("b".to_string(), rule(1, "true", CommandKind::Shell, vec![plain_dep("a")]));
        let rules = MapRules(rules_map);

        let mut graph = Graph::new();
        let root = graph.get_or_alloc(&rules, Target::transient("@root")).unwrap();
        let a = graph
            .get_execution(
                &rules,
                Target::file("a"),
                root,
                EdgeLabel::new(FlagStack::new(), Flags::EMPTY, Place::Empty),
            )
            .unwrap();

        let mut jobs = 4i64;
        let mut stats = Statistics::default();
        let mut pid_to_node = HashMap::new();
        let mut transient_timestamps = HashMap::new();
        let mut failures = Vec::new();
        let registry = stu_job::signals::PidRegistry::new();
        let mut ctx = new_ctx(
            &rules,
            &mut jobs,
            &mut stats,
            &mut pid_to_node,
            &mut transient_timestamps,
            &mut failures,
            &registry,
        );

        let result = run_to_completion(&mut graph, &mut ctx, a);
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().kind, ErrorKind::Logical);
    }

    #[test]
    fn optional_absent_dependency_does_not_block_build() {
        let dir = tempdir().unwrap();
        std::env::set_current_dir(dir.path()).unwrap();

        let mut rules_map = std::collections::HashMap::new();
        let mut optional_dep = plain_dep("b");
        if let Dep::Plain(p) = &mut optional_dep {
            p.flags = Flags::new(bit::OPTIONAL);
            p.places.set(bit::OPTIONAL, Place::Empty);
        }
        rules_map.insert(
            "a".to_string(),
            rule(0, "touch a", CommandKind::Shell, vec![optional_dep]),
        );
        let rules = MapRules(rules_map);

        let mut graph = Graph::new();
        let root = graph.get_or_alloc(&rules, Target::transient("@root")).unwrap();
        graph.node_mut(root).buf_default.push_back(PendingEdge {
            edge: EdgeLabel::new(FlagStack::new(), Flags::EMPTY, Place::Empty),
            dep: plain_dep("a"),
        });

        let mut jobs = 4i64;
        let mut stats = Statistics::default();
        let mut pid_to_node = HashMap::new();
        let mut transient_timestamps = HashMap::new();
        let mut failures = Vec::new();
        let registry = stu_job::signals::PidRegistry::new();
        let mut ctx = new_ctx(
            &rules,
            &mut jobs,
            &mut stats,
            &mut pid_to_node,
            &mut transient_timestamps,
            &mut failures,
            &registry,
        );

        run_to_completion(&mut graph, &mut ctx, root).unwrap();
        assert!(Path::new("a").exists());
        assert!(!Path::new("b").exists());
    }

    #[test]
    fn dynamic_inclusion_builds_list_then_its_entries() {
        let dir = tempdir().unwrap();
        std::env::set_current_dir(dir.path()).unwrap();

        let mut rules_map = std::collections::HashMap::new();
        rules_map.insert(
            "list".to_string(),
            rule(0, "printf 'x\\ny\\n' > list", CommandKind::Shell, vec![]),
        );
        rules_map.insert("x".to_string(), rule(1, "touch x", CommandKind::Shell, vec![]));
        rules_map.insert("y".to_string(), rule(2, "touch y", CommandKind::Shell, vec![]));
        let dynamic_dep = Dep::Dynamic(DynamicDep {
            flags: Flags::new(bit::TARGET_DYNAMIC),
            places: Places::empty(),
            inner: Box::new(plain_dep("list")),
        });
        rules_map.insert("all".to_string(), rule(3, "touch all", CommandKind::Shell, vec![dynamic_dep]));
        let rules = MapRules(rules_map);

        let mut graph = Graph::new();
        let root = graph.get_or_alloc(&rules, Target::transient("@root")).unwrap();
        graph.node_mut(root).buf_default.push_back(PendingEdge {
            edge: EdgeLabel::new(FlagStack::new(), Flags::EMPTY, Place::Empty),
            dep: plain_dep("all"),
        });

        let mut jobs = 4i64;
        let mut stats = Statistics::default();
        let mut pid_to_node = HashMap::new();
        let mut transient_timestamps = HashMap::new();
        let mut failures = Vec::new();
        let registry = stu_job::signals::PidRegistry::new();
        let mut ctx = new_ctx(
            &rules,
            &mut jobs,
            &mut stats,
            &mut pid_to_node,
            &mut transient_timestamps,
            &mut failures,
            &registry,
        );

        run_to_completion(&mut graph, &mut ctx, root).unwrap();

        assert!(Path::new("list").exists());
        assert!(Path::new("x").exists());
        assert!(Path::new("y").exists());
    }

    #[test]
    fn failing_command_removes_its_partial_output() {
        let dir = tempdir().unwrap();
        std::env::set_current_dir(dir.path()).unwrap();

        let mut rules_map = std::collections::HashMap::new();
        rules_map.insert(
            "a".to_string(),
            rule(0, ": > a; exit 1", CommandKind::Shell, vec![]),
        );
        let rules = MapRules(rules_map);

        let mut graph = Graph::new();
        let root = graph.get_or_alloc(&rules, Target::transient("@root")).unwrap();
        graph.node_mut(root).buf_default.push_back(PendingEdge {
            edge: EdgeLabel::new(FlagStack::new(), Flags::EMPTY, Place::Empty),
            dep: plain_dep("a"),
        });

        let mut jobs = 4i64;
        let mut stats = Statistics::default();
        let mut pid_to_node = HashMap::new();
        let mut transient_timestamps = HashMap::new();
        let mut failures = Vec::new();
        let registry = stu_job::signals::PidRegistry::new();
        let mut ctx = new_ctx(
            &rules,
            &mut jobs,
            &mut stats,
            &mut pid_to_node,
            &mut transient_timestamps,
            &mut failures,
            &registry,
        );

        let result = run_to_completion(&mut graph, &mut ctx, root);
        assert!(result.is_err());
        assert!(!Path::new("a").exists());
    }
}
