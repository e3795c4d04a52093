// Copyright 2026 stu project contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Source-location tracking and the error-kind model shared by every other
//! crate. This is the one piece of "diagnostic rendering" that stays in
//! scope: plain-text trace chains ("needed by ...") are load bearing for
//! the cycle-detection and build-failure diagnostics tests exercise.
//! Colorized rendering remains out of scope.

use std::fmt;
use std::path::PathBuf;

/// A position the engine can blame for an error: a line/column in a rules
/// file, a command-line argument, or nothing at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Place {
    /// No location is available.
    Empty,
    /// `line`/`column` are one-based, matching the convention the rest of
    /// the toolchain (editors, compilers) expects in "file:line:col"
    /// output.
    File {
        filename: PathBuf,
        line: u32,
        column: u32,
    },
    /// A location within the process's own command-line arguments.
    Argv { index: usize },
}

impl Place {
    pub fn file(filename: impl Into<PathBuf>, line: u32, column: u32) -> Self {
        assert!(line >= 1);
        Place::File {
            filename: filename.into(),
            line,
            column,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Place::Empty)
    }

    /// Render without a trailing message, suitable as `argv[0]` for a
    /// spawned shell's process I/O contract: `"<file>:<line>"`.
    pub fn as_argv0(&self) -> String {
        match self {
            Place::Empty => String::new(),
            Place::File { filename, line, .. } => format!("{}:{line}", filename.display()),
            Place::Argv { index } => format!("<argument {index}>"),
        }
    }
}

impl fmt::Display for Place {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Place::Empty => Ok(()),
            Place::File {
                filename,
                line,
                column,
            } => write!(f, "{}:{line}:{column}", filename.display()),
            Place::Argv { index } => write!(f, "<argument {index}>"),
        }
    }
}

/// A `Place` paired with an explanatory message, used to build a
/// "needed by ..." trace chain as an error propagates up through parents.
#[derive(Debug, Clone)]
pub struct Trace {
    pub place: Place,
    pub message: String,
}

impl Trace {
    pub fn new(place: Place, message: impl Into<String>) -> Self {
        Trace {
            place,
            message: message.into(),
        }
    }
}

impl fmt::Display for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.place.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}: {}", self.place, self.message)
        }
    }
}

/// The four error kinds. `Fatal` is a special case of `System` that
/// bypasses even cleanup statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Build,
    Logical,
    System,
    Fatal,
}

impl ErrorKind {
    /// The exit-code bit this kind contributes (`1`/`2`/`4`, OR-ed; `4`
    /// is never combined with the others for `Fatal`).
    pub fn bit(self) -> u8 {
        match self {
            ErrorKind::Build => 1,
            ErrorKind::Logical => 2,
            ErrorKind::System | ErrorKind::Fatal => 4,
        }
    }

    pub fn recoverable(self) -> bool {
        matches!(self, ErrorKind::Build | ErrorKind::Logical)
    }
}

/// An error local to one node, with the trace chain accumulated so far.
/// This is the one error type threaded through every crate.
#[derive(Debug, Clone)]
pub struct Failure {
    pub kind: ErrorKind,
    pub message: String,
    pub trace: Vec<Trace>,
}

impl Failure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Failure {
            kind,
            message: message.into(),
            trace: Vec::new(),
        }
    }

    pub fn build(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Build, message)
    }

    pub fn logical(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Logical, message)
    }

    pub fn system(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::System, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fatal, message)
    }

    /// Append one more hop of "needed by" context as the error propagates
    /// from a child node up to a parent.
    pub fn with_trace(mut self, place: Place, message: impl Into<String>) -> Self {
        self.trace.push(Trace::new(place, message));
        self
    }

    /// Render as the engine would print it to stderr: the trace chain, from
    /// the point of failure outward, followed by the top-level
    /// `$0: *** message` line (the "error without place" format, from
    /// the original `print_error`).
    pub fn render(&self, argv0: &str) -> String {
        let mut out = String::new();
        for t in &self.trace {
            out.push_str(&format!("{t}\n"));
        }
        out.push_str(&format!("{argv0}: *** {}\n", self.message));
        out
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for Failure {}

/// Accumulates the OR of every error kind seen so far, used both as
/// `ExecutionNode::error` and as the final process exit code.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ErrorMask(u8);

impl ErrorMask {
    pub fn none() -> Self {
        ErrorMask(0)
    }

    pub fn add(&mut self, kind: ErrorKind) {
        self.0 |= kind.bit();
    }

    pub fn merge(&mut self, other: ErrorMask) {
        self.0 |= other.0;
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn exit_code(self) -> u8 {
        self.0
    }
}

/// Collects `Failure`s produced while processing a batch (e.g. dependency
/// normalization) under a keep-going policy: in keep-going mode
/// every failure is recorded and processing continues; otherwise the first
/// failure stops the batch immediately.
#[derive(Debug, Default)]
pub struct ErrorAccumulator {
    keep_going: bool,
    failures: Vec<Failure>,
}

impl ErrorAccumulator {
    pub fn new(keep_going: bool) -> Self {
        ErrorAccumulator {
            keep_going,
            failures: Vec::new(),
        }
    }

    /// Record `failure`. Returns `Err(())` when the caller should stop
    /// immediately (not keep-going).
    pub fn push(&mut self, failure: Failure) -> Result<(), ()> {
        let stop = !self.keep_going;
        self.failures.push(failure);
        if stop {
            Err(())
        } else {
            Ok(())
        }
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn mask(&self) -> ErrorMask {
        let mut mask = ErrorMask::none();
        for f in &self.failures {
            mask.add(f.kind);
        }
        mask
    }

    pub fn into_failures(self) -> Vec<Failure> {
        self.failures
    }

    pub fn first(&self) -> Option<&Failure> {
        self.failures.first()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn place_display_file() {
        let p = Place::file("build.stu", 3, 5);
        assert_eq!(p.to_string(), "build.stu:3:5");
        assert_eq!(p.as_argv0(), "build.stu:3");
    }

    #[test]
    fn error_mask_combines_build_and_logical_but_not_system() {
        let mut mask = ErrorMask::none();
        mask.add(ErrorKind::Build);
        mask.add(ErrorKind::Logical);
        assert_eq!(mask.exit_code(), 0b011);

        let mut fatal_mask = ErrorMask::none();
        fatal_mask.add(ErrorKind::Fatal);
        assert_eq!(fatal_mask.exit_code(), 0b100);
    }

    #[test]
    fn accumulator_stops_without_keep_going() {
        let mut acc = ErrorAccumulator::new(false);
        assert!(acc.push(Failure::build("first")).is_err());
        assert_eq!(acc.into_failures().len(), 1);
    }

    #[test]
    fn accumulator_continues_with_keep_going() {
        let mut acc = ErrorAccumulator::new(true);
        assert!(acc.push(Failure::build("first")).is_ok());
        assert!(acc.push(Failure::logical("second")).is_ok());
        assert_eq!(acc.into_failures().len(), 2);
    }

    #[test]
    fn render_includes_trace_chain_before_top_message() {
        let failure = Failure::logical("cyclic dependency")
            .with_trace(Place::file("build.stu", 1, 1), "target A");
        let rendered = failure.render("stu");
        let mut lines = rendered.lines();
        assert_eq!(lines.next().unwrap(), "build.stu:1:1: target A");
        assert_eq!(lines.next().unwrap(), "stu: *** cyclic dependency");
    }
}
