// Copyright 2026 stu project contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The dependency algebra and its normalization.
//!
//! A `Dep` is the sum type `Plain | Dynamic | Concat | Compound | Root`.
//! `normalize` expands `Compound` and flattens `Concat` down to the
//! `Plain`/`Dynamic`/`Concat-of-plain-or-dynamic` shape the execution graph
//! (`stu_graph`) actually consumes.

use stu_flags::{bit, Flags};
use stu_place::{ErrorAccumulator, Failure, Place};
use stu_target::Target;

/// One source location per placed-flag bit (persistent/optional/trivial).
/// For each placed-flag bit that is set, the matching slot here is
/// non-empty; conversely, unset means empty.
#[derive(Debug, Clone, Default)]
pub struct Places {
    persistent: Option<Place>,
    optional: Option<Place>,
    trivial: Option<Place>,
}

impl Places {
    pub fn empty() -> Self {
        Places::default()
    }

    fn slot(&self, bit: u16) -> &Option<Place> {
        match bit {
            bit::PERSISTENT => &self.persistent,
            bit::OPTIONAL => &self.optional,
            bit::TRIVIAL => &self.trivial,
            _ => panic!("not a placed-flag bit: {bit}"),
        }
    }

    fn slot_mut(&mut self, bit: u16) -> &mut Option<Place> {
        match bit {
            bit::PERSISTENT => &mut self.persistent,
            bit::OPTIONAL => &mut self.optional,
            bit::TRIVIAL => &mut self.trivial,
            _ => panic!("not a placed-flag bit: {bit}"),
        }
    }

    pub fn set(&mut self, bit: u16, place: Place) {
        *self.slot_mut(bit) = Some(place);
    }

    pub fn get(&self, bit: u16) -> Option<&Place> {
        self.slot(bit).as_ref()
    }

    /// True iff every placed bit set in `flags` has a place here, and every
    /// unset bit has none.
    pub fn matches(&self, flags: Flags) -> bool {
        for bit in [bit::PERSISTENT, bit::OPTIONAL, bit::TRIVIAL] {
            if flags.has(bit) != self.slot(bit).is_some() {
                return false;
            }
        }
        true
    }

    /// Merge `parent` into `self`, keeping `self`'s own place for any bit it
    /// already set: a parent never overwrites a child's own placed flags.
    fn merge_parent(&self, parent: &Places) -> Places {
        let pick = |mine: &Option<Place>, theirs: &Option<Place>| {
            mine.clone().or_else(|| theirs.clone())
        };
        Places {
            persistent: pick(&self.persistent, &parent.persistent),
            optional: pick(&self.optional, &parent.optional),
            trivial: pick(&self.trivial, &parent.trivial),
        }
    }
}

/// A single `Plain` target dependency.
#[derive(Debug, Clone)]
pub struct PlainDep {
    pub flags: Flags,
    pub places: Places,
    /// Source location of the target name itself, for error messages that
    /// need to point at the dependency rather than at one of its flags.
    pub place_target: Place,
    /// Explicit `$name` override for a `Variable` dependency; `None` means
    /// "use the filename".
    pub variable_name: Option<String>,
    pub target: Target,
}

/// One level of `[...]`.
#[derive(Debug, Clone)]
pub struct DynamicDep {
    pub flags: Flags,
    pub places: Places,
    pub inner: Box<Dep>,
}

/// Unresolved concatenation `(a)(b)...`; at least 2 parts once normalized.
#[derive(Debug, Clone)]
pub struct ConcatDep {
    pub flags: Flags,
    pub places: Places,
    pub parts: Vec<Dep>,
}

/// A parenthesized list; never survives normalization.
#[derive(Debug, Clone)]
pub struct CompoundDep {
    pub flags: Flags,
    pub places: Places,
    pub parts: Vec<Dep>,
}

#[derive(Debug, Clone)]
pub enum Dep {
    Plain(PlainDep),
    Dynamic(DynamicDep),
    Concat(ConcatDep),
    Compound(CompoundDep),
    /// Sentinel parent of top-level requests.
    Root,
}

impl Dep {
    pub fn plain(target: Target, flags: Flags, places: Places, place_target: Place) -> Self {
        Dep::Plain(PlainDep {
            flags,
            places,
            place_target,
            variable_name: None,
            target,
        })
    }

    fn header(&self) -> (Flags, Places) {
        match self {
            Dep::Plain(p) => (p.flags, p.places.clone()),
            Dep::Dynamic(d) => (d.flags, d.places.clone()),
            Dep::Concat(c) => (c.flags, c.places.clone()),
            Dep::Compound(c) => (c.flags, c.places.clone()),
            Dep::Root => (Flags::EMPTY, Places::empty()),
        }
    }

    fn with_header(self, flags: Flags, places: Places) -> Dep {
        match self {
            Dep::Plain(mut p) => {
                p.flags = flags;
                p.places = places;
                Dep::Plain(p)
            }
            Dep::Dynamic(mut d) => {
                d.flags = flags;
                d.places = places;
                Dep::Dynamic(d)
            }
            Dep::Concat(mut c) => {
                c.flags = flags;
                c.places = places;
                Dep::Concat(c)
            }
            Dep::Compound(mut c) => {
                c.flags = flags;
                c.places = places;
                Dep::Compound(c)
            }
            Dep::Root => Dep::Root,
        }
    }

    pub fn flags(&self) -> Flags {
        self.header().0
    }

    /// True once this `Dep` can no longer be a `Compound` and any `Concat`
    /// it contains has only `Plain`/`Dynamic` parts — the definition of
    /// "normalized".
    pub fn is_normalized(&self) -> bool {
        match self {
            Dep::Plain(_) | Dep::Root => true,
            Dep::Dynamic(d) => d.inner.is_normalized(),
            Dep::Concat(c) => {
                c.parts.len() >= 2
                    && c.parts
                        .iter()
                        .all(|p| matches!(p, Dep::Plain(_) | Dep::Dynamic(_)))
            }
            Dep::Compound(_) => false,
        }
    }
}

/// Union `parent`'s flags/places into `dep`'s own header, without
/// overwriting any placed flag `dep` already carries.
fn merge_parent_into(dep: Dep, parent_flags: Flags, parent_places: &Places) -> Dep {
    let (child_flags, child_places) = dep.header();
    let new_flags = child_flags.union(parent_flags);
    let new_places = child_places.merge_parent(parent_places);
    dep.with_header(new_flags, new_places)
}

fn flatten_concat_parts(dep: Dep) -> Vec<Dep> {
    match dep {
        Dep::Concat(c) => c.parts,
        other => vec![other],
    }
}

/// Validate and combine two already-normalized operands of a concatenation.
/// `acc`'s place is used only to attribute diagnostics; the `Place` passed
/// in is the concatenation's own source location.
fn concat_pair(a: Dep, b: Dep, place: &Place) -> Result<Dep, Failure> {
    let a_flags = a.flags();
    let b_flags = b.flags();

    if a_flags.has(bit::INPUT) {
        return Err(Failure::logical(
            "input redirection must not be used as the left operand of a concatenation",
        )
        .with_trace(place.clone(), "concatenated dependency"));
    }
    if b_flags.has(bit::INPUT) {
        return Err(Failure::logical(
            "input redirection must not be used as the right operand of a concatenation",
        )
        .with_trace(place.clone(), "concatenated dependency"));
    }
    if !b_flags.placed().is_empty() {
        return Err(Failure::logical(
            "a placed flag (persistent/optional/trivial) must not be used on the right operand of a concatenation",
        )
        .with_trace(place.clone(), "concatenated dependency"));
    }
    if b_flags.has(bit::TARGET_TRANSIENT) {
        return Err(Failure::logical(
            "a transient target must not be used as the right operand of a concatenation",
        )
        .with_trace(place.clone(), "concatenated dependency"));
    }
    if b_flags.has(bit::VARIABLE) {
        return Err(Failure::logical(
            "a variable dependency must not be used as the right operand of a concatenation",
        )
        .with_trace(place.clone(), "concatenated dependency"));
    }
    if a_flags.has(bit::VARIABLE) {
        return Err(Failure::logical(
            "a variable dependency must not be used as the left operand of a concatenation",
        )
        .with_trace(place.clone(), "concatenated dependency"));
    }

    match (a, b) {
        (Dep::Plain(pa), Dep::Plain(pb)) => {
            let name: String = format!("{}{}", pa.target.name, pb.target.name);
            let flags = pa.flags.union(pb.flags);
            let places = pa.places.merge_parent(&pb.places);
            let kind = if flags.has(bit::TARGET_TRANSIENT) {
                stu_target::TargetKind::Transient
            } else {
                stu_target::TargetKind::File
            };
            let target = Target::new(kind, name, 0);
            Ok(Dep::Plain(PlainDep {
                flags,
                places,
                place_target: pa.place_target,
                variable_name: pa.variable_name.or(pb.variable_name),
                target,
            }))
        }
        (a, b) => {
            let mut parts = flatten_concat_parts(a);
            parts.extend(flatten_concat_parts(b));
            Ok(Dep::Concat(ConcatDep {
                flags: Flags::EMPTY,
                places: Places::empty(),
                parts,
            }))
        }
    }
}

fn concat_expand(
    parts: Vec<Dep>,
    top_flags: Flags,
    top_places: &Places,
    place: &Place,
    acc: &mut ErrorAccumulator,
) -> Result<Vec<Dep>, ()> {
    assert!(parts.len() >= 2, "Concat must have at least 2 parts");
    let mut iter = parts.into_iter();
    let first = iter.next().unwrap();
    let rest: Vec<Dep> = iter.collect();

    let v1 = normalize_one(first, acc)?;
    let v2 = if rest.len() == 1 {
        normalize_one(rest.into_iter().next().unwrap(), acc)?
    } else {
        concat_expand(rest, Flags::EMPTY, &Places::empty(), place, acc)?
    };

    let mut out = Vec::with_capacity(v1.len() * v2.len());
    for a in &v1 {
        for b in &v2 {
            match concat_pair(a.clone(), b.clone(), place) {
                Ok(d) => out.push(d),
                Err(f) => acc.push(f)?,
            }
        }
    }
    Ok(out
        .into_iter()
        .map(|d| merge_parent_into(d, top_flags, top_places))
        .collect())
}

fn normalize_one(dep: Dep, acc: &mut ErrorAccumulator) -> Result<Vec<Dep>, ()> {
    match dep {
        Dep::Plain(p) => Ok(vec![Dep::Plain(p)]),
        Dep::Root => Ok(vec![Dep::Root]),
        Dep::Dynamic(d) => {
            if d.flags.has(bit::VARIABLE) {
                acc.push(
                    Failure::logical("a dynamic dependency must not be a variable dependency")
                        .with_trace(
                            d.places.get(bit::PERSISTENT).cloned().unwrap_or(Place::Empty),
                            "dynamic dependency",
                        ),
                )?;
            }
            Ok(normalize_one(*d.inner, acc)?
                .into_iter()
                .map(|inner| {
                    Dep::Dynamic(DynamicDep {
                        flags: d.flags,
                        places: d.places.clone(),
                        inner: Box::new(inner),
                    })
                })
                .collect())
        }
        Dep::Compound(c) => {
            let mut out = Vec::new();
            for part in c.parts {
                let merged = merge_parent_into(part, c.flags, &c.places);
                out.extend(normalize_one(merged, acc)?);
            }
            Ok(out)
        }
        Dep::Concat(c) => {
            let place = c
                .places
                .get(bit::PERSISTENT)
                .or_else(|| c.places.get(bit::OPTIONAL))
                .or_else(|| c.places.get(bit::TRIVIAL))
                .cloned()
                .unwrap_or(Place::Empty);
            concat_expand(c.parts, c.flags, &c.places, &place, acc)
        }
    }
}

/// Expand `Compound` and flatten `Concat`. Errors are recorded into `acc`;
/// in keep-going mode expansion continues past an error, otherwise it stops
/// immediately at the first error and returns whatever was produced so far.
pub fn normalize(dep: Dep, acc: &mut ErrorAccumulator) -> Vec<Dep> {
    normalize_one(dep, acc).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use stu_target::TargetKind;

    fn plain(name: &str) -> Dep {
        Dep::plain(
            Target::new(TargetKind::File, name, 0),
            Flags::EMPTY,
            Places::empty(),
            Place::Empty,
        )
    }

    #[test]
    fn plain_normalizes_to_itself() {
        let mut acc = ErrorAccumulator::new(true);
        let result = normalize(plain("a"), &mut acc);
        assert!(acc.is_empty());
        assert_eq!(result.len(), 1);
        assert!(result[0].is_normalized());
    }

    #[test]
    fn compound_flattens_and_unions_flags() {
        let mut acc = ErrorAccumulator::new(true);
        let compound = Dep::Compound(CompoundDep {
            flags: Flags::new(bit::OPTIONAL),
            places: {
                let mut p = Places::empty();
                p.set(bit::OPTIONAL, Place::Empty);
                p
            },
            parts: vec![plain("a"), plain("b")],
        });
        let result = normalize(compound, &mut acc);
        assert_eq!(result.len(), 2);
        for d in &result {
            assert!(d.flags().has(bit::OPTIONAL));
        }
    }

    #[test]
    fn compound_does_not_overwrite_childs_own_place() {
        let mut acc = ErrorAccumulator::new(true);
        let child_place = Place::file("child.stu", 2, 1);
        let mut child_places = Places::empty();
        child_places.set(bit::OPTIONAL, child_place.clone());
        let child = Dep::Plain(PlainDep {
            flags: Flags::new(bit::OPTIONAL),
            places: child_places,
            place_target: Place::Empty,
            variable_name: None,
            target: Target::file("a"),
        });

        let mut parent_places = Places::empty();
        parent_places.set(bit::OPTIONAL, Place::file("parent.stu", 1, 1));
        let compound = Dep::Compound(CompoundDep {
            flags: Flags::new(bit::OPTIONAL),
            places: parent_places,
            parts: vec![child],
        });

        let result = normalize(compound, &mut acc);
        assert_eq!(result.len(), 1);
        if let Dep::Plain(p) = &result[0] {
            assert_eq!(p.places.get(bit::OPTIONAL), Some(&child_place));
        } else {
            panic!("expected Plain");
        }
    }

    #[test]
    fn concat_of_two_plains_concatenates_names() {
        let mut acc = ErrorAccumulator::new(true);
        let concat = Dep::Concat(ConcatDep {
            flags: Flags::EMPTY,
            places: Places::empty(),
            parts: vec![plain("foo"), plain(".c")],
        });
        let result = normalize(concat, &mut acc);
        assert!(acc.is_empty());
        assert_eq!(result.len(), 1);
        if let Dep::Plain(p) = &result[0] {
            assert_eq!(&*p.target.name, "foo.c");
        } else {
            panic!("expected a single concatenated Plain");
        }
    }

    #[test]
    fn concat_with_dynamic_operand_does_not_flatten_to_a_string() {
        let mut acc = ErrorAccumulator::new(true);
        let dynamic = Dep::Dynamic(DynamicDep {
            flags: Flags::new(bit::TARGET_DYNAMIC),
            places: Places::empty(),
            inner: Box::new(plain("list")),
        });
        let concat = Dep::Concat(ConcatDep {
            flags: Flags::EMPTY,
            places: Places::empty(),
            parts: vec![plain("prefix-"), dynamic],
        });
        let result = normalize(concat, &mut acc);
        assert_eq!(result.len(), 1);
        match &result[0] {
            Dep::Concat(c) => assert_eq!(c.parts.len(), 2),
            other => panic!("expected Concat, got {other:?}"),
        }
    }

    #[test]
    fn concat_rejects_variable_on_left() {
        let mut acc = ErrorAccumulator::new(true);
        let variable = Dep::Plain(PlainDep {
            flags: Flags::new(bit::VARIABLE),
            places: Places::empty(),
            place_target: Place::Empty,
            variable_name: None,
            target: Target::file("v"),
        });
        let concat = Dep::Concat(ConcatDep {
            flags: Flags::EMPTY,
            places: Places::empty(),
            parts: vec![variable, plain("b")],
        });
        let result = normalize(concat, &mut acc);
        assert!(result.is_empty());
        assert_eq!(acc.into_failures().len(), 1);
    }

    #[test]
    fn normalize_is_idempotent_on_its_own_output() {
        let mut acc = ErrorAccumulator::new(true);
        let concat = Dep::Concat(ConcatDep {
            flags: Flags::EMPTY,
            places: Places::empty(),
            parts: vec![plain("a"), plain("b"), plain("c")],
        });
        let once = normalize(concat, &mut acc);
        assert_eq!(once.len(), 1);
        let twice: Vec<Dep> = once
            .iter()
            .cloned()
            .flat_map(|d| normalize(d, &mut acc))
            .collect();
        assert_eq!(twice.len(), once.len());
        if let (Dep::Plain(a), Dep::Plain(b)) = (&once[0], &twice[0]) {
            assert_eq!(a.target.name, b.target.name);
        } else {
            panic!("expected Plain on both sides");
        }
    }

    #[test]
    fn concat_expansion_is_associative() {
        // (a)(b)(c) grouped either way yields the same concatenated name.
        let mut acc1 = ErrorAccumulator::new(true);
        let left_heavy = Dep::Concat(ConcatDep {
            flags: Flags::EMPTY,
            places: Places::empty(),
            parts: vec![plain("a"), plain("b"), plain("c")],
        });
        let r1 = normalize(left_heavy, &mut acc1);

        let mut acc2 = ErrorAccumulator::new(true);
        let right_heavy = Dep::Concat(ConcatDep {
            flags: Flags::EMPTY,
            places: Places::empty(),
            parts: vec![
                plain("a"),
                Dep::Concat(ConcatDep {
                    flags: Flags::EMPTY,
                    places: Places::empty(),
                    parts: vec![plain("b"), plain("c")],
                }),
            ],
        });
        let r2 = normalize(right_heavy, &mut acc2);

        let name = |r: &[Dep]| match &r[0] {
            Dep::Plain(p) => p.target.name.to_string(),
            _ => panic!("expected Plain"),
        };
        assert_eq!(name(&r1), name(&r2));
    }
}
