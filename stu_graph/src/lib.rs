// Copyright 2026 stu project contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The live dependency graph: interned [`ExecutionNode`]s, the
//! execute/execute_children/unlink triad that drives a single target's
//! staleness decision and subprocess launch, and strong-cycle detection over
//! the parametric rule graph.
//!
//! `stu_graph` is deliberately the one crate that depends on every other
//! crate in the workspace: a `Graph` plus the borrowed [`ExecContext`] the
//! `stu_engine` binary assembles each call, consolidated the way the
//! teacher consolidates scheduler state into a single value. It does not
//! depend on a concrete rules-file format: `RuleSet::lookup` is injected
//! via the `stu_rule::RuleLookup` trait object, so the graph only ever
//! sees rules through that one operation.

mod context;
mod cycle;
mod edge;
mod graph;
mod id;
mod node;

pub use context::ExecContext;
pub use edge::{EdgeLabel, PendingEdge};
pub use graph::Graph;
pub use id::ExecutionId;
pub use node::{ExecutionNode, Exists};
