// Copyright 2026 stu project contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The `stu` binary: CLI surface, environment-variable contract, and exit
//! code assembly. A `clap::Parser`-derived CLI without a `tokio` runtime —
//! the scheduler below is single-threaded and cooperative, so `main` drives
//! it with a plain blocking loop instead of an executor.

use std::time::{SystemTime, UNIX_EPOCH};

use clap::Parser;

use stu_dep::Dep;
use stu_place::ErrorKind;

use stu_engine::ruletext;
use stu_engine::{Options, Scheduler};

#[derive(Parser, Debug)]
#[command(name = "stu", about = "A dynamic-dependency build engine", version)]
struct Opt {
    /// Targets to build.
    targets: Vec<String>,

    /// Rule file to read.
    #[arg(short = 'f', long = "file", default_value = "Stufile")]
    file: String,

    /// Keep going after a target fails instead of aborting the whole build.
    #[arg(short = 'k', long = "keep-going")]
    keep_going: bool,

    /// Number of concurrent subprocess slots.
    #[arg(short = 'j', long = "jobs", default_value_t = 1)]
    jobs: i64,

    /// Enable verbose execute/unlink tracing on stderr.
    #[arg(short = 'd', long = "debug")]
    debug: bool,

    /// Traverse sibling dependencies in random (seeded) order.
    #[arg(long = "random")]
    random: bool,

    /// Seed backing `--random`; defaults to the current time.
    #[arg(long = "seed")]
    seed: Option<u64>,
}

fn fail(failure: &stu_place::Failure) -> ! {
    eprint!("{}", failure.render("stu"));
    std::process::exit(i32::from(failure.kind.bit()));
}

fn main() {
    if let Err(failure) = stu_job::check_not_recursive_invocation() {
        fail(&failure);
    }

    let opt = Opt::parse();

    if opt.debug {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();
    } else {
        env_logger::init();
    }

    if let Err(failure) = stu_job::signals::install() {
        fail(&failure);
    }

    let text = match std::fs::read_to_string(&opt.file) {
        Ok(text) => text,
        Err(e) => {
            eprintln!("stu: *** {}: {e}", opt.file);
            std::process::exit(i32::from(ErrorKind::System.bit()));
        }
    };

    let rules = match ruletext::parse_rules(&text, &opt.file) {
        Ok(rules) => rules,
        Err(failure) => fail(&failure),
    };

    if opt.targets.is_empty() {
        eprintln!("stu: *** no targets specified");
        std::process::exit(i32::from(ErrorKind::Build.bit()));
    }
    let targets: Vec<Dep> = opt.targets.iter().map(|t| ruletext::parse_target_arg(t)).collect();

    let seed = opt.seed.unwrap_or_else(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0)
    });
    let options = Options {
        jobs: opt.jobs.max(1),
        keep_going: opt.keep_going,
        random: opt.random,
        seed,
        remove_on_failure: true,
    };

    let mut scheduler = Scheduler::new(&rules, options);
    match scheduler.build(targets) {
        Ok(mask) => {
            let stats = scheduler.statistics();
            if stats.executed == 0 {
                eprintln!("stu: Nothing to be done");
            }
            eprintln!("{}", stats.render(false));
            std::process::exit(i32::from(mask.exit_code()));
        }
        Err(failure) => {
            eprint!("{}", failure.render("stu"));
            eprintln!("{}", scheduler.statistics().render(true));
            std::process::exit(i32::from(failure.kind.bit()));
        }
    }
}
