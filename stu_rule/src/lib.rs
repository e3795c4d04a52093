// Copyright 2026 stu project contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! `Rule`/`RuleSet` and the parametric-match lookup that turns a concrete
//! `Target` into an instantiated rule.
//!
//! Tokenizing a rules file into `Rule` values is out of scope; what lives
//! here is everything downstream of a fully parsed `Rule`: parameter
//! pattern matching, anchoring-dominance ranking among competing
//! parametrized rules, and template instantiation.

use std::collections::HashMap;

use fnv::FnvHashMap;

use stu_dep::{ConcatDep, Dep, DynamicDep, PlainDep, Places};
use stu_flags::Flags;
use stu_place::{ErrorKind, Failure, Place};
use stu_target::{Target, TargetKind};

/// One piece of a parameter-bearing name: either literal text or a `$name`
/// placeholder (`${name}` and bare `$name` both accepted).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    Param(String),
}

/// Split `s` into literal/parameter segments. `${name}` and `$name` are both
/// recognized; a bare `$` followed by neither an identifier nor `{` is kept
/// as a literal `$`.
pub fn parse_template(s: &str) -> Vec<Segment> {
    let mut out = Vec::new();
    let mut literal = String::new();
    let mut chars = s.char_indices().peekable();
    while let Some((_, c)) = chars.next() {
        if c != '$' {
            literal.push(c);
            continue;
        }
        let rest = &s[chars.peek().map(|&(i, _)| i).unwrap_or(s.len())..];
        if let Some(stripped) = rest.strip_prefix('{') {
            if let Some(end) = stripped.find('}') {
                let name = &stripped[..end];
                if !name.is_empty() && name.chars().all(|c| c.is_alphanumeric() || c == '_') {
                    if !literal.is_empty() {
                        out.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    out.push(Segment::Param(name.to_string()));
                    for _ in 0..(1 + end + 1) {
                        chars.next();
                    }
                    continue;
                }
            }
            literal.push('$');
            continue;
        }
        let mut name = String::new();
        while let Some(&(_, nc)) = chars.peek() {
            if nc.is_alphanumeric() || nc == '_' {
                name.push(nc);
                chars.next();
            } else {
                break;
            }
        }
        if name.is_empty() {
            literal.push('$');
        } else {
            if !literal.is_empty() {
                out.push(Segment::Literal(std::mem::take(&mut literal)));
            }
            out.push(Segment::Param(name));
        }
    }
    if !literal.is_empty() {
        out.push(Segment::Literal(literal));
    }
    out
}

/// Fill in every `Param` segment from `bindings`; errors if a name is
/// unbound (which would mean the rule references a parameter outside its
/// declared set — a logical error caught earlier by `RuleSet::add_rule`, but
/// checked again here defensively).
pub fn substitute(segments: &[Segment], bindings: &HashMap<String, String>) -> Result<String, Failure> {
    let mut out = String::new();
    for seg in segments {
        match seg {
            Segment::Literal(s) => out.push_str(s),
            Segment::Param(name) => match bindings.get(name) {
                Some(v) => out.push_str(v),
                None => {
                    return Err(Failure::logical(format!(
                        "parameter '{name}' is not bound in this instantiation"
                    )))
                }
            },
        }
    }
    Ok(out)
}

fn param_names(segments: &[Segment]) -> Vec<&str> {
    segments
        .iter()
        .filter_map(|s| match s {
            Segment::Param(p) => Some(p.as_str()),
            Segment::Literal(_) => None,
        })
        .collect()
}

/// A target name pattern with embedded parameters, ready for matching
/// against a concrete target name.
#[derive(Debug, Clone)]
pub struct TargetPattern {
    pub kind: TargetKind,
    pub raw: String,
    segments: Vec<Segment>,
}

impl TargetPattern {
    pub fn new(kind: TargetKind, raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let segments = parse_template(&raw);
        TargetPattern { kind, raw, segments }
    }

    pub fn is_parametrized(&self) -> bool {
        self.segments.iter().any(|s| matches!(s, Segment::Param(_)))
    }
}

/// Offsets of every parameter capture within the matched name, used for
/// anchoring-dominance ranking.
type Anchoring = Vec<(String, (usize, usize))>;

fn match_segments(parts: &[Segment], name: &str) -> Option<Anchoring> {
    fn rec(parts: &[Segment], name: &str, pos: usize, caps: &mut Anchoring) -> bool {
        match parts.split_first() {
            None => pos == name.len(),
            Some((Segment::Literal(lit), rest)) => {
                if name[pos..].starts_with(lit.as_str()) {
                    rec(rest, name, pos + lit.len(), caps)
                } else {
                    false
                }
            }
            Some((Segment::Param(pname), rest)) => {
                let remaining = &name[pos..];
                for len in 0..=remaining.len() {
                    if !remaining.is_char_boundary(len) {
                        continue;
                    }
                    let mut trial = caps.clone();
                    trial.push((pname.clone(), (pos, pos + len)));
                    if rec(rest, name, pos + len, &mut trial) {
                        *caps = trial;
                        return true;
                    }
                }
                false
            }
        }
    }
    let mut caps = Vec::new();
    if rec(parts, name, 0, &mut caps) {
        Some(caps)
    } else {
        None
    }
}

/// The bytes of `name` covered by any parameter capture, as a boolean mask;
/// used to compute anchoring dominance.
fn coverage_mask(anchoring: &Anchoring, len: usize) -> Vec<bool> {
    let mut mask = vec![false; len];
    for (_, (start, end)) in anchoring {
        for slot in mask.iter_mut().take(*end).skip(*start) {
            *slot = true;
        }
    }
    mask
}

/// `a` dominates `b` iff every character parametric in `a` is also
/// parametric in `b`, and at least one character is parametric in `b` but
/// not in `a`.
fn dominates(a: &[bool], b: &[bool]) -> bool {
    let subset = a.iter().zip(b.iter()).all(|(&x, &y)| !x || y);
    let strictly_smaller = a.iter().zip(b.iter()).any(|(&x, &y)| !x && y);
    subset && strictly_smaller
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Shell,
    Hardcoded,
    Copy,
    None,
}

/// One dependency as written in a rule, before parameter substitution.
/// Mirrors `stu_dep::Dep` except that `Plain` carries a name *template*
/// rather than a resolved `Target`.
#[derive(Debug, Clone)]
pub enum DepTemplate {
    Plain(PlainTemplateDep),
    Dynamic {
        flags: Flags,
        places: Places,
        inner: Box<DepTemplate>,
    },
    Concat {
        flags: Flags,
        places: Places,
        parts: Vec<DepTemplate>,
    },
    Compound {
        flags: Flags,
        places: Places,
        parts: Vec<DepTemplate>,
    },
    Root,
}

#[derive(Debug, Clone)]
pub struct PlainTemplateDep {
    pub kind: TargetKind,
    pub name_template: String,
    pub flags: Flags,
    pub places: Places,
    pub place_target: Place,
    pub variable_name: Option<String>,
}

impl DepTemplate {
    fn param_names(&self) -> Vec<String> {
        match self {
            DepTemplate::Plain(p) => param_names(&parse_template(&p.name_template))
                .into_iter()
                .map(String::from)
                .collect(),
            DepTemplate::Dynamic { inner, .. } => inner.param_names(),
            DepTemplate::Concat { parts, .. } | DepTemplate::Compound { parts, .. } => {
                parts.iter().flat_map(DepTemplate::param_names).collect()
            }
            DepTemplate::Root => Vec::new(),
        }
    }

    fn instantiate(&self, bindings: &HashMap<String, String>) -> Result<Dep, Failure> {
        match self {
            DepTemplate::Plain(p) => {
                let segments = parse_template(&p.name_template);
                let name = substitute(&segments, bindings)?;
                let target = Target::new(p.kind, name, 0);
                Ok(Dep::Plain(PlainDep {
                    flags: p.flags,
                    places: p.places.clone(),
                    place_target: p.place_target.clone(),
                    variable_name: p.variable_name.clone(),
                    target,
                }))
            }
            DepTemplate::Dynamic { flags, places, inner } => Ok(Dep::Dynamic(DynamicDep {
                flags: *flags,
                places: places.clone(),
                inner: Box::new(inner.instantiate(bindings)?),
            })),
            DepTemplate::Concat { flags, places, parts } => Ok(Dep::Concat(ConcatDep {
                flags: *flags,
                places: places.clone(),
                parts: parts
                    .iter()
                    .map(|p| p.instantiate(bindings))
                    .collect::<Result<_, _>>()?,
            })),
            DepTemplate::Compound { flags, places, parts } => Ok(Dep::Compound(stu_dep::CompoundDep {
                flags: *flags,
                places: places.clone(),
                parts: parts
                    .iter()
                    .map(|p| p.instantiate(bindings))
                    .collect::<Result<_, _>>()?,
            })),
            DepTemplate::Root => Ok(Dep::Root),
        }
    }
}

/// A parsed rule: one or more targets sharing a parameter set, a
/// dependency template list, and a command.
#[derive(Debug, Clone)]
pub struct Rule {
    pub targets: Vec<TargetPattern>,
    pub deps: Vec<DepTemplate>,
    pub command: Option<String>,
    pub command_kind: CommandKind,
    pub redirect_index: Option<usize>,
    pub input_filename: Option<String>,
    pub parameters: Vec<String>,
    pub copy_source: Option<String>,
    pub place: Place,
}

/// The result of resolving a concrete `Target` against a `RuleSet`: a rule
/// with every parameter substituted.
#[derive(Debug, Clone)]
pub struct InstantiatedRule {
    /// Identity of the underlying, pre-instantiation `Rule` (its index in
    /// the owning `RuleSet`). Used only for cycle detection: two execution
    /// nodes share a "parametric rule" iff they were instantiated from the
    /// same `rule_id`.
    pub rule_id: usize,
    pub command: Option<String>,
    pub command_kind: CommandKind,
    pub redirect_index: Option<usize>,
    pub input_filename: Option<String>,
    pub deps: Vec<Dep>,
    pub bindings: HashMap<String, String>,
    pub place: Place,
    /// Instantiated source filename of a `Copy` rule (`Rule` carries this
    /// only as a template; substituted here like `command`).
    pub copy_source: Option<String>,
}

/// The rule-set indexing structure `stu_graph` depends on only
/// abstractly, exposed only via `lookup`.
pub trait RuleLookup {
    fn lookup(&self, target: &Target) -> Result<Option<InstantiatedRule>, Failure>;
}

struct ParametrizedEntry {
    rule_index: usize,
    pattern: TargetPattern,
}

/// An indexed collection of rules: an exact-match table for unparametrized
/// targets plus a parametrized list searched by anchoring dominance.
pub struct RuleSet {
    rules: Vec<Rule>,
    exact: FnvHashMap<Target, usize>,
    parametrized: Vec<ParametrizedEntry>,
}

impl RuleSet {
    pub fn new() -> Self {
        RuleSet {
            rules: Vec::new(),
            exact: FnvHashMap::default(),
            parametrized: Vec::new(),
        }
    }

    /// Register `rule`, validating its parameter constraints: parameters
    /// must appear only in names reachable via the rule's dependencies,
    /// and a copy rule's source-name parameters must be a subset of its
    /// target parameters.
    pub fn add_rule(&mut self, rule: Rule) -> Result<(), Failure> {
        let declared: std::collections::HashSet<&str> =
            rule.parameters.iter().map(String::as_str).collect();

        let mut reachable = std::collections::HashSet::new();
        for t in &rule.targets {
            for p in param_names(&parse_template(&t.raw)) {
                reachable.insert(p.to_string());
            }
        }
        for d in &rule.deps {
            for p in d.param_names() {
                reachable.insert(p);
            }
        }
        for name in &declared {
            if !reachable.contains(*name) {
                return Err(Failure::logical(format!(
                    "parameter '{name}' does not appear in any target or dependency of the rule"
                ))
                .with_trace(rule.place.clone(), "rule declaration"));
            }
        }

        if rule.command_kind == CommandKind::Copy {
            if let Some(source) = &rule.copy_source {
                for p in param_names(&parse_template(source)) {
                    if !declared.contains(p) {
                        return Err(Failure::logical(format!(
                            "copy source parameter '{p}' is not a target parameter"
                        ))
                        .with_trace(rule.place.clone(), "rule declaration"));
                    }
                }
            }
        }

        let first_kind = rule.targets.first().map(|t| t.kind);
        for t in &rule.targets {
            if Some(t.kind) != first_kind {
                return Err(Failure::logical(
                    "all targets of a rule must share the same kind",
                )
                .with_trace(rule.place.clone(), "rule declaration"));
            }
        }

        let target_params = |raw: &str| -> std::collections::HashSet<String> {
            param_names(&parse_template(raw))
                .into_iter()
                .map(String::from)
                .collect()
        };
        if let Some(first) = rule.targets.first() {
            let first_params = target_params(&first.raw);
            for t in &rule.targets[1..] {
                if target_params(&t.raw) != first_params {
                    return Err(Failure::logical(
                        "all targets of a rule must have the same parameter set",
                    )
                    .with_trace(rule.place.clone(), "rule declaration"));
                }
            }
        }

        let index = self.rules.len();
        for t in &rule.targets {
            if t.is_parametrized() {
                self.parametrized.push(ParametrizedEntry {
                    rule_index: index,
                    pattern: t.clone(),
                });
            } else {
                let target = Target::new(t.kind, t.raw.clone(), 0);
                self.exact.insert(target, index);
            }
        }
        self.rules.push(rule);
        Ok(())
    }

    fn instantiate(
        &self,
        rule_id: usize,
        rule: &Rule,
        bindings: HashMap<String, String>,
        place: Place,
    ) -> Result<InstantiatedRule, Failure> {
        let command = match &rule.command {
            Some(cmd) => Some(substitute(&parse_template(cmd), &bindings)?),
            None => None,
        };
        let input_filename = match &rule.input_filename {
            Some(f) => Some(substitute(&parse_template(f), &bindings)?),
            None => None,
        };
        let copy_source = match &rule.copy_source {
            Some(s) => Some(substitute(&parse_template(s), &bindings)?),
            None => None,
        };
        let deps = rule
            .deps
            .iter()
            .map(|d| d.instantiate(&bindings))
            .collect::<Result<_, _>>()?;
        Ok(InstantiatedRule {
            rule_id,
            command,
            command_kind: rule.command_kind,
            redirect_index: rule.redirect_index,
            input_filename,
            deps,
            bindings,
            place,
            copy_source,
        })
    }
}

impl Default for RuleSet {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleLookup for RuleSet {
    fn lookup(&self, target: &Target) -> Result<Option<InstantiatedRule>, Failure> {
        if let Some(&index) = self.exact.get(target) {
            let rule = &self.rules[index];
            return Ok(Some(self.instantiate(index, rule, HashMap::new(), rule.place.clone())?));
        }

        struct Candidate {
            rule_index: usize,
            bindings: HashMap<String, String>,
            coverage: Vec<bool>,
        }

        let mut candidates = Vec::new();
        for entry in &self.parametrized {
            if entry.pattern.kind != target.kind {
                continue;
            }
            if let Some(anchoring) = match_segments(&entry.pattern.segments, &target.name) {
                let coverage = coverage_mask(&anchoring, target.name.len());
                let bindings = anchoring
                    .into_iter()
                    .map(|(name, (start, end))| (name, target.name[start..end].to_string()))
                    .collect();
                candidates.push(Candidate {
                    rule_index: entry.rule_index,
                    bindings,
                    coverage,
                });
            }
        }

        if candidates.is_empty() {
            return Ok(None);
        }

        let mut survivors: Vec<usize> = (0..candidates.len()).collect();
        survivors.retain(|&i| {
            !candidates
                .iter()
                .enumerate()
                .any(|(j, other)| j != i && dominates(&other.coverage, &candidates[i].coverage))
        });

        match survivors.len() {
            1 => {
                let c = &candidates[survivors[0]];
                let rule = &self.rules[c.rule_index];
                Ok(Some(self.instantiate(
                    c.rule_index,
                    rule,
                    c.bindings.clone(),
                    rule.place.clone(),
                )?))
            }
            0 => Ok(None),
            _ => Err(Failure::new(
                ErrorKind::Logical,
                format!("multiple minimal rules match target '{}'", target.name),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stu_place::Place;

    fn rule(targets: Vec<TargetPattern>, command: &str, place: Place) -> Rule {
        Rule {
            targets,
            deps: Vec::new(),
            command: Some(command.to_string()),
            command_kind: CommandKind::Shell,
            redirect_index: None,
            input_filename: None,
            parameters: Vec::new(),
            copy_source: None,
            place,
        }
    }

    #[test]
    fn parse_template_splits_literal_and_param() {
        let segs = parse_template("lib$name.o");
        assert_eq!(
            segs,
            vec![
                Segment::Literal("lib".into()),
                Segment::Param("name".into()),
                Segment::Literal(".o".into()),
            ]
        );
    }

    #[test]
    fn parse_template_supports_braced_form() {
        let segs = parse_template("${name}.o");
        assert_eq!(
            segs,
            vec![Segment::Param("name".into()), Segment::Literal(".o".into())]
        );
    }

    #[test]
    fn exact_match_wins_over_parametrized() {
        let mut rs = RuleSet::new();
        let mut exact_rule = rule(
            vec![TargetPattern::new(TargetKind::File, "special.o")],
            "touch special.o",
            Place::Empty,
        );
        exact_rule.parameters = Vec::new();
        rs.add_rule(exact_rule).unwrap();

        let mut pattern_rule = rule(
            vec![TargetPattern::new(TargetKind::File, "$name.o")],
            "cc -c $name.c",
            Place::Empty,
        );
        pattern_rule.parameters = vec!["name".into()];
        rs.add_rule(pattern_rule).unwrap();

        let target = Target::file("special.o");
        let instantiated = rs.lookup(&target).unwrap().unwrap();
        assert_eq!(instantiated.command.as_deref(), Some("touch special.o"));
    }

    #[test]
    fn parametrized_match_binds_parameter() {
        let mut rs = RuleSet::new();
        let mut pattern_rule = rule(
            vec![TargetPattern::new(TargetKind::File, "$name.o")],
            "cc -c $name.c -o $name.o",
            Place::Empty,
        );
        pattern_rule.parameters = vec!["name".into()];
        rs.add_rule(pattern_rule).unwrap();

        let instantiated = rs.lookup(&Target::file("foo.o")).unwrap().unwrap();
        assert_eq!(instantiated.bindings.get("name").map(String::as_str), Some("foo"));
        assert_eq!(
            instantiated.command.as_deref(),
            Some("cc -c foo.c -o foo.o")
        );
    }

    #[test]
    fn more_specific_pattern_dominates_a_wildcard_pattern() {
        let mut rs = RuleSet::new();
        let mut wide = rule(
            vec![TargetPattern::new(TargetKind::File, "$name")],
            "generic $name",
            Place::Empty,
        );
        wide.parameters = vec!["name".into()];
        rs.add_rule(wide).unwrap();

        let mut narrow = rule(
            vec![TargetPattern::new(TargetKind::File, "$name.o")],
            "cc $name",
            Place::Empty,
        );
        narrow.parameters = vec!["name".into()];
        rs.add_rule(narrow).unwrap();

        let instantiated = rs.lookup(&Target::file("foo.o")).unwrap().unwrap();
        assert_eq!(instantiated.command.as_deref(), Some("cc foo"));
    }

    #[test]
    fn ambiguous_equally_specific_patterns_error() {
        let mut rs = RuleSet::new();
        let mut a = rule(
            vec![TargetPattern::new(TargetKind::File, "$a.x")],
            "a",
            Place::Empty,
        );
        a.parameters = vec!["a".into()];
        rs.add_rule(a).unwrap();

        let mut b = rule(
            vec![TargetPattern::new(TargetKind::File, "$b.x")],
            "b",
            Place::Empty,
        );
        b.parameters = vec!["b".into()];
        rs.add_rule(b).unwrap();

        let err = rs.lookup(&Target::file("foo.x")).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Logical);
    }

    #[test]
    fn unreachable_parameter_is_rejected() {
        let mut rs = RuleSet::new();
        let mut bad = rule(
            vec![TargetPattern::new(TargetKind::File, "fixed.o")],
            "touch fixed.o",
            Place::Empty,
        );
        bad.parameters = vec!["ghost".into()];
        assert!(rs.add_rule(bad).is_err());
    }

    #[test]
    fn no_match_returns_none() {
        let rs = RuleSet::new();
        assert!(rs.lookup(&Target::file("anything")).unwrap().is_none());
    }
}
