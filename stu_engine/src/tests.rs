// Copyright 2026 stu project contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fs;
use std::path::Path;

use tempfile::tempdir;

use stu_place::ErrorKind;

use super::*;
use crate::ruletext::{parse_rules, parse_target_arg};

#[test]
fn builds_a_simple_two_rule_chain() {
    let dir = tempdir().unwrap();
    std::env::set_current_dir(dir.path()).unwrap();

    let rules = parse_rules("a : b\n\tcp b a\nb :\n\techo hello >b\n", "<test>").unwrap();
    let mut scheduler = Scheduler::new(&rules, Options::default());
    let mask = scheduler.build(vec![parse_target_arg("a")]).unwrap();

    assert!(mask.is_empty());
    assert_eq!(fs::read_to_string("a").unwrap(), "hello\n");
    assert_eq!(scheduler.statistics().executed, 2);
    assert_eq!(scheduler.statistics().succeeded, 2);
}

#[test]
fn rerunning_an_up_to_date_build_does_nothing() {
    let dir = tempdir().unwrap();
    std::env::set_current_dir(dir.path()).unwrap();
    let rules = parse_rules("a :\n\ttouch a\n", "<test>").unwrap();

    let mut first = Scheduler::new(&rules, Options::default());
    first.build(vec![parse_target_arg("a")]).unwrap();
    assert_eq!(first.statistics().executed, 1);

    let mut second = Scheduler::new(&rules, Options::default());
    second.build(vec![parse_target_arg("a")]).unwrap();
    assert_eq!(second.statistics().executed, 0);
}

#[test]
fn keep_going_lets_an_independent_target_finish_after_a_failure() {
    let dir = tempdir().unwrap();
    std::env::set_current_dir(dir.path()).unwrap();
    let rules = parse_rules("bad :\n\tfalse\ngood :\n\ttouch good\n", "<test>").unwrap();

    let mut scheduler = Scheduler::new(
        &rules,
        Options {
            keep_going: true,
            ..Options::default()
        },
    );
    let mask = scheduler
        .build(vec![parse_target_arg("bad"), parse_target_arg("good")])
        .unwrap();

    assert!(!mask.is_empty());
    assert!(Path::new("good").exists());
}

#[test]
fn without_keep_going_a_failure_aborts_the_build() {
    let dir = tempdir().unwrap();
    std::env::set_current_dir(dir.path()).unwrap();
    let rules = parse_rules("bad :\n\tfalse\n", "<test>").unwrap();

    let mut scheduler = Scheduler::new(&rules, Options::default());
    let result = scheduler.build(vec![parse_target_arg("bad")]);

    assert!(result.is_err());
    assert_eq!(result.unwrap_err().kind, ErrorKind::Build);
}

#[test]
fn a_missing_rule_for_a_leaf_file_is_not_an_error() {
    let dir = tempdir().unwrap();
    std::env::set_current_dir(dir.path()).unwrap();
    fs::write("b", b"already here\n").unwrap();

    let rules = parse_rules("a : b\n\tcp b a\n", "<test>").unwrap();
    let mut scheduler = Scheduler::new(&rules, Options::default());
    scheduler.build(vec![parse_target_arg("a")]).unwrap();

    assert_eq!(fs::read_to_string("a").unwrap(), "already here\n");
}
