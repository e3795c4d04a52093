// Copyright 2026 stu project contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! A minimal textual rule format for the `stu` binary and its integration
//! tests.
//!
//! Tokenizing the real rule language — with its full comment/escaping rules
//! and source-position tracking — is explicitly out of scope for this
//! workspace (that job belongs upstream of `stu_rule::RuleSet`). This module
//! is not that parser: it is a small convenience format, good enough to
//! exercise the engine end-to-end from a rule file on disk, with a grammar
//! documented here rather than anywhere near `stu_rule`.
//!
//! ```text
//! # comment
//! target1 target2 : dep1 -o dep2 [dep3]
//!     shell command line
//!     continuation line
//! ```
//!
//! A target or dependency token spelled `@name` is transient; anything else
//! is a file. A dependency token may be preceded by `-p`/`-o`/`-t` to mark it
//! persistent/optional/trivial, wrapped in `[...]` to make it dynamic (with
//! an optional leading `-z` for NUL-delimited records), prefixed with `<` to
//! mark it as the command's stdin, or spelled `$NAME<file` to bind the
//! trimmed content of `file` to variable `NAME`. Command-block lines may
//! start with the directives `!none` (no command), `!copy <source>`, or
//! `!content` (the rest of the block is written verbatim rather than run);
//! a bare `!redirect` line redirects the command's stdout into the target,
//! and `!stdin <file>` redirects a file into the command's stdin.

use stu_dep::{Dep, PlainDep, Places};
use stu_flags::{bit, Flags};
use stu_place::{Failure, Place};
use stu_rule::{
    parse_template, CommandKind, DepTemplate, PlainTemplateDep, Rule, RuleLookup, RuleSet, Segment, TargetPattern,
};
use stu_target::{Target, TargetKind};

pub fn parse_rules(text: &str, source_name: &str) -> Result<RuleSet, Failure> {
    let mut set = RuleSet::new();
    let lines: Vec<&str> = text.lines().collect();
    let mut i = 0;
    while i < lines.len() {
        let raw = lines[i];
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            i += 1;
            continue;
        }
        if raw.starts_with(|c: char| c.is_whitespace()) {
            return Err(Failure::logical(format!(
                "{source_name}:{}: command line with no preceding rule header",
                i + 1
            )));
        }

        let header_line = i + 1;
        let (targets_part, deps_part) = trimmed.split_once(':').ok_or_else(|| {
            Failure::logical(format!("{source_name}:{header_line}: rule header is missing ':'"))
        })?;
        let place = Place::file(source_name, header_line as u32, 1);
        let targets = parse_target_list(targets_part, source_name, header_line)?;
        let deps = parse_dep_list(deps_part, source_name, header_line)?;
        i += 1;

        let mut body: Vec<&str> = Vec::new();
        while i < lines.len() && lines[i].starts_with(|c: char| c.is_whitespace()) && !lines[i].trim().is_empty() {
            body.push(lines[i]);
            i += 1;
        }

        let spec = interpret_command(&body)?;
        let parameters = collect_parameters(&targets);
        let rule = Rule {
            targets,
            deps,
            command: spec.command,
            command_kind: spec.command_kind,
            redirect_index: spec.redirect_index,
            input_filename: spec.input_filename,
            parameters,
            copy_source: spec.copy_source,
            place,
        };
        set.add_rule(rule)?;
    }
    Ok(set)
}

/// Build the `Dep::Root`-attached dependency a CLI target argument denotes:
/// a ground, unparametrized request with no flags of its own.
pub fn parse_target_arg(arg: &str) -> Dep {
    let (kind, name) = split_kind(arg);
    Dep::Plain(PlainDep {
        flags: Flags::new(kind.flag_bit()),
        places: Places::empty(),
        place_target: Place::Empty,
        variable_name: None,
        target: Target::new(kind, name, 0),
    })
}

fn split_kind(tok: &str) -> (TargetKind, &str) {
    match tok.strip_prefix('@') {
        Some(rest) => (TargetKind::Transient, rest),
        None => (TargetKind::File, tok),
    }
}

fn parse_target_list(s: &str, source: &str, line: usize) -> Result<Vec<TargetPattern>, Failure> {
    let tokens: Vec<&str> = s.split_whitespace().collect();
    if tokens.is_empty() {
        return Err(Failure::logical(format!("{source}:{line}: rule has no targets")));
    }
    Ok(tokens
        .into_iter()
        .map(|t| {
            let (kind, name) = split_kind(t);
            TargetPattern::new(kind, name)
        })
        .collect())
}

fn collect_parameters(targets: &[TargetPattern]) -> Vec<String> {
    let mut params = Vec::new();
    for t in targets {
        for seg in parse_template(&t.raw) {
            if let Segment::Param(name) = seg {
                if !params.contains(&name) {
                    params.push(name);
                }
            }
        }
    }
    params
}

fn parse_dep_list(s: &str, source: &str, line: usize) -> Result<Vec<DepTemplate>, Failure> {
    let tokens: Vec<&str> = s.split_whitespace().collect();
    let mut deps = Vec::new();
    let mut idx = 0;
    while idx < tokens.len() {
        let mut flags = Flags::EMPTY;
        let mut places = Places::empty();
        let mut nul_separated = false;
        loop {
            let place = Place::file(source, line as u32, 1);
            match tokens.get(idx) {
                Some(&"-p") => {
                    flags = flags.with(bit::PERSISTENT);
                    places.set(bit::PERSISTENT, place);
                    idx += 1;
                }
                Some(&"-o") => {
                    flags = flags.with(bit::OPTIONAL);
                    places.set(bit::OPTIONAL, place);
                    idx += 1;
                }
                Some(&"-t") => {
                    flags = flags.with(bit::TRIVIAL);
                    places.set(bit::TRIVIAL, place);
                    idx += 1;
                }
                Some(&"-z") => {
                    nul_separated = true;
                    idx += 1;
                }
                _ => break,
            }
        }
        let tok = tokens.get(idx).ok_or_else(|| {
            Failure::logical(format!("{source}:{line}: dependency flag with no following target"))
        })?;
        idx += 1;
        deps.push(parse_one_dep(tok, flags, places, nul_separated, source, line)?);
    }
    Ok(deps)
}

fn parse_one_dep(
    tok: &str,
    flags: Flags,
    places: Places,
    nul_separated: bool,
    source: &str,
    line: usize,
) -> Result<DepTemplate, Failure> {
    if let Some(inner_tok) = tok.strip_prefix('[').and_then(|t| t.strip_suffix(']')) {
        let inner = parse_one_dep(inner_tok, flags, places, false, source, line)?;
        let mut wrapper_flags = Flags::new(bit::TARGET_DYNAMIC);
        wrapper_flags = wrapper_flags.with(if nul_separated { bit::NUL_SEPARATED } else { bit::NEWLINE_SEPARATED });
        return Ok(DepTemplate::Dynamic {
            flags: wrapper_flags,
            places: Places::empty(),
            inner: Box::new(inner),
        });
    }

    if let Some(rest) = tok.strip_prefix('<') {
        let (kind, name) = split_kind(rest);
        return Ok(plain_template(kind, name, flags.with(bit::INPUT), places, source, line, None));
    }

    if let Some(rest) = tok.strip_prefix('$') {
        let sep = rest.find('<').ok_or_else(|| {
            Failure::logical(format!(
                "{source}:{line}: variable dependency '{tok}' is missing '<target'"
            ))
        })?;
        let var_name = rest[..sep].to_string();
        let (kind, name) = split_kind(&rest[sep + 1..]);
        return Ok(plain_template(
            kind,
            name,
            flags.with(bit::VARIABLE),
            places,
            source,
            line,
            Some(var_name),
        ));
    }

    let (kind, name) = split_kind(tok);
    Ok(plain_template(kind, name, flags, places, source, line, None))
}

fn plain_template(
    kind: TargetKind,
    name: &str,
    flags: Flags,
    places: Places,
    source: &str,
    line: usize,
    variable_name: Option<String>,
) -> DepTemplate {
    DepTemplate::Plain(PlainTemplateDep {
        kind,
        name_template: name.to_string(),
        flags: flags.with(kind.flag_bit()),
        places,
        place_target: Place::file(source, line as u32, 1),
        variable_name,
    })
}

struct CommandSpec {
    command: Option<String>,
    command_kind: CommandKind,
    redirect_index: Option<usize>,
    input_filename: Option<String>,
    copy_source: Option<String>,
}

fn interpret_command(lines: &[&str]) -> Result<CommandSpec, Failure> {
    let mut idx = 0;
    let mut redirect_index = None;
    let mut input_filename = None;
    while idx < lines.len() {
        let trimmed = lines[idx].trim();
        if trimmed == "!redirect" {
            redirect_index = Some(0);
            idx += 1;
        } else if let Some(rest) = trimmed.strip_prefix("!stdin ") {
            input_filename = Some(rest.trim().to_string());
            idx += 1;
        } else {
            break;
        }
    }

    let body = &lines[idx..];
    if body.is_empty() {
        return Ok(CommandSpec {
            command: None,
            command_kind: CommandKind::None,
            redirect_index: None,
            input_filename: None,
            copy_source: None,
        });
    }

    let first = body[0].trim();
    if first == "!none" {
        return Ok(CommandSpec {
            command: None,
            command_kind: CommandKind::None,
            redirect_index: None,
            input_filename: None,
            copy_source: None,
        });
    }
    if let Some(source) = first.strip_prefix("!copy ") {
        return Ok(CommandSpec {
            command: None,
            command_kind: CommandKind::Copy,
            redirect_index: None,
            input_filename: None,
            copy_source: Some(source.trim().to_string()),
        });
    }
    if let Some(rest) = first.strip_prefix("!content") {
        let mut content_lines = Vec::new();
        let first_rest = rest.strip_prefix(' ').unwrap_or(rest);
        if !first_rest.is_empty() {
            content_lines.push(first_rest.to_string());
        }
        for l in &body[1..] {
            content_lines.push(l.trim_start().to_string());
        }
        let mut content = content_lines.join("\n");
        if !content.is_empty() {
            content.push('\n');
        }
        return Ok(CommandSpec {
            command: Some(content),
            command_kind: CommandKind::Hardcoded,
            redirect_index: None,
            input_filename: None,
            copy_source: None,
        });
    }

    let command = body.iter().map(|l| l.trim_start()).collect::<Vec<_>>().join("\n");
    Ok(CommandSpec {
        command: Some(command),
        command_kind: CommandKind::Shell,
        redirect_index,
        input_filename,
        copy_source: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_simple_shell_rule() {
        let set = parse_rules("a : b\n\tcp b a\n", "<test>").unwrap();
        let rule = set.lookup(&Target::file("a")).unwrap().unwrap();
        assert_eq!(rule.command.as_deref(), Some("cp b a"));
        assert_eq!(rule.command_kind, CommandKind::Shell);
        assert_eq!(rule.deps.len(), 1);
    }

    #[test]
    fn parses_transient_targets_and_optional_deps() {
        let set = parse_rules("@all : -o missing.txt\n\ttouch @all\n", "<test>").unwrap();
        let rule = set.lookup(&Target::transient("all")).unwrap().unwrap();
        match &rule.deps[0] {
            Dep::Plain(p) => {
                assert!(p.flags.has(bit::OPTIONAL));
                assert!(!p.target.is_transient());
            }
            _ => panic!("expected a plain dependency"),
        }
    }

    #[test]
    fn parses_dynamic_and_copy_and_content_directives() {
        let set = parse_rules(
            "list : [entries]\n\tprintf 'x\\ny\\n' >list\ncopy.txt : src.txt\n\t!copy src.txt\nhello.txt :\n\t!content Hello, world!\n",
            "<test>",
        )
        .unwrap();

        let list_rule = set.lookup(&Target::file("list")).unwrap().unwrap();
        assert!(matches!(list_rule.deps[0], Dep::Dynamic(_)));

        let copy_rule = set.lookup(&Target::file("copy.txt")).unwrap().unwrap();
        assert_eq!(copy_rule.command_kind, CommandKind::Copy);
        assert_eq!(copy_rule.copy_source.as_deref(), Some("src.txt"));

        let content_rule = set.lookup(&Target::file("hello.txt")).unwrap().unwrap();
        assert_eq!(content_rule.command_kind, CommandKind::Hardcoded);
        assert_eq!(content_rule.command.as_deref(), Some("Hello, world!\n"));
    }

    #[test]
    fn rejects_a_rule_missing_a_colon() {
        assert!(parse_rules("a b c\n", "<test>").is_err());
    }

    #[test]
    fn cli_target_argument_recognizes_transient_marker() {
        match parse_target_arg("@clean") {
            Dep::Plain(p) => assert!(p.target.is_transient()),
            _ => panic!("expected a plain dependency"),
        }
    }
}
