// Copyright 2026 stu project contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The dynamic reader: turns a built file's content into a list of ground
//! `Dep`s, one filename per record, delimited by `\n` or `\0`.

use stu_dep::{Dep, DynamicDep, PlainDep, Places};
use stu_flags::Flags;
use stu_place::{Failure, Place};
use stu_target::Target;

/// Parse `content` as a dynamic dependency file and lift each record into a
/// `Dep`, inheriting `parent_flags`/`parent_places` (each parsed dep
/// inherits the parent's placed-flag places where not already set) and
/// wrapping each with one `Dynamic` layer per `remaining_dynamic_levels`
/// (for `[[A]]`-style multiply-dynamic targets).
///
/// An empty file yields zero dependencies and is not an error. Every other
/// empty record is.
pub fn read_dynamic(
    content: &[u8],
    parent_flags: Flags,
    parent_places: &Places,
    remaining_dynamic_levels: u32,
    nul_separated: bool,
) -> Result<Vec<Dep>, Failure> {
    if content.is_empty() {
        return Ok(Vec::new());
    }

    let delim = if nul_separated { b'\0' } else { b'\n' };
    let mut records: Vec<&[u8]> = content.split(|&b| b == delim).collect();
    if records.last().is_some_and(|r| r.is_empty()) {
        records.pop();
    }

    let mut deps = Vec::with_capacity(records.len());
    for record in records {
        if record.is_empty() {
            return Err(Failure::build("empty record in dynamic dependency file"));
        }
        if delim == b'\n' && record.contains(&0) {
            return Err(Failure::build(
                "dynamic dependency record contains an embedded NUL byte",
            ));
        }
        let name = std::str::from_utf8(record)
            .map_err(|_| Failure::build("dynamic dependency record is not valid UTF-8"))?;
        deps.push(wrap_dynamic(
            plain_dep(name, parent_flags, parent_places),
            remaining_dynamic_levels,
        ));
    }
    Ok(deps)
}

fn plain_dep(name: &str, parent_flags: Flags, parent_places: &Places) -> Dep {
    Dep::Plain(PlainDep {
        // The reader only ever produces ground, non-variable, non-input
        // dependencies: it has no syntax for `$var`/`<` in a dynamic
        // dependency file, only bare filenames.
        flags: parent_flags.placed(),
        places: parent_places.clone(),
        place_target: Place::Empty,
        variable_name: None,
        target: Target::file(name),
    })
}

fn wrap_dynamic(mut dep: Dep, remaining_dynamic_levels: u32) -> Dep {
    for _ in 0..remaining_dynamic_levels {
        dep = Dep::Dynamic(DynamicDep {
            flags: Flags::EMPTY,
            places: Places::empty(),
            inner: Box::new(dep),
        });
    }
    dep
}
