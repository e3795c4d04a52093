// Copyright 2026 stu project contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Strong-cycle detection over the *parametric rule* graph, grounded in the
//! teacher's `Graph::detect_cycle`/`Walk`
//! (`graph/src/lib.rs`): a predicate-gated walk of parents, generalized from
//! "is this node already complete" to "do these two nodes share a
//! `param_rule` and target kind".

use std::collections::HashSet;

use stu_target::TargetKind;

use crate::graph::Graph;
use crate::id::ExecutionId;

/// If adding an edge `parent -> (rule_id, kind)` would close a strong
/// cycle, return the chain of node ids from the cycle's root back to
/// `parent` (inclusive), innermost first.
pub fn detect(
    graph: &Graph,
    parent: ExecutionId,
    child_rule_id: Option<usize>,
    child_kind: TargetKind,
) -> Option<Vec<ExecutionId>> {
    let child_rule_id = child_rule_id?;
    let mut visited = HashSet::new();
    walk(graph, parent, child_rule_id, child_kind, &mut visited)
}

fn walk(
    graph: &Graph,
    node_id: ExecutionId,
    child_rule_id: usize,
    child_kind: TargetKind,
    visited: &mut HashSet<ExecutionId>,
) -> Option<Vec<ExecutionId>> {
    if !visited.insert(node_id) {
        return None;
    }
    let node = graph.node(node_id);
    if node.rule_id == Some(child_rule_id) && node.target.kind == child_kind {
        return Some(vec![node_id]);
    }
    for &grandparent in node.parents.keys() {
        if let Some(mut trace) = walk(graph, grandparent, child_rule_id, child_kind, visited) {
            trace.push(node_id);
            return Some(trace);
        }
    }
    None
}
