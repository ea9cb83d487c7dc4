//! User-facing diagnostics.
//!
//! Failures carry a location (file:line:col when derived from a buildfile)
//! and use the structured phrasing `while <doing> <target>` with nested
//! `info:` notes for causal chains.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};

/// Process-wide verbosity level (0-6).
///
/// 0: errors only; 1: one line per target action; >= 2: full command lines.
static VERBOSITY: AtomicU8 = AtomicU8::new(1);

/// Set the verbosity level for diagnostic output.
pub fn set_verbosity(v: u8) {
    VERBOSITY.store(v.min(6), Ordering::Relaxed);
}

/// Get the current verbosity level.
pub fn verbosity() -> u8 {
    VERBOSITY.load(Ordering::Relaxed)
}

/// Print a progress line gated on verbosity.
///
/// At `verb == 1` callers pass the short action form (`gen foo.in`), at
/// `verb >= 2` the full command line.
pub fn text(v: u8, msg: impl fmt::Display) {
    if verbosity() >= v {
        eprintln!("{}", msg);
    }
}

/// Severity level for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "error"),
            Severity::Warning => write!(f, "warning"),
            Severity::Info => write!(f, "info"),
        }
    }
}

/// A buildfile-derived location.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Location {
    pub file: PathBuf,
    pub line: u32,
    pub column: u32,
}

impl Location {
    pub fn new(file: impl Into<PathBuf>, line: u32, column: u32) -> Self {
        Location { file: file.into(), line, column }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file.display(), self.line, self.column)
    }
}

/// A diagnostic message with causal `info:` notes.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    /// Nested notes, outermost cause first (`info: while updating exe{foo}`).
    pub notes: Vec<String>,
    pub location: Option<Location>,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>) -> Self {
        Diagnostic {
            severity: Severity::Error,
            message: message.into(),
            notes: Vec::new(),
            location: None,
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Diagnostic {
            severity: Severity::Warning,
            message: message.into(),
            notes: Vec::new(),
            location: None,
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Diagnostic {
            severity: Severity::Info,
            message: message.into(),
            notes: Vec::new(),
            location: None,
        }
    }

    /// Append a `while <doing> <target>` note.
    pub fn while_doing(mut self, doing: impl fmt::Display) -> Self {
        self.notes.push(format!("while {}", doing));
        self
    }

    /// Append a plain `info:` note.
    pub fn note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    pub fn at(mut self, location: Location) -> Self {
        self.location = Some(location);
        self
    }

    /// Format for terminal output.
    pub fn render(&self) -> String {
        let mut out = String::new();

        if let Some(ref loc) = self.location {
            out.push_str(&format!("{}: {}: {}\n", loc, self.severity, self.message));
        } else {
            out.push_str(&format!("{}: {}\n", self.severity, self.message));
        }

        for note in &self.notes {
            out.push_str(&format!("  info: {}\n", note));
        }

        out
    }

    /// Print to stderr. Errors always print; warnings from verbosity 1 up.
    pub fn emit(&self) {
        match self.severity {
            Severity::Error => eprint!("{}", self.render()),
            _ => {
                if verbosity() >= 1 {
                    eprint!("{}", self.render());
                }
            }
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.render())
    }
}

/// The verb forms of an operation as used in diagnostics: `update`,
/// `updating`, `updated`, and `is updated` respectively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionVerbs {
    pub do_: &'static str,
    pub doing: &'static str,
    pub did: &'static str,
    pub done: &'static str,
}

impl ActionVerbs {
    pub const fn new(
        do_: &'static str,
        doing: &'static str,
        did: &'static str,
        done: &'static str,
    ) -> Self {
        ActionVerbs { do_, doing, did, done }
    }
}

/// Emit a warning.
pub fn warn(message: impl Into<String>) {
    Diagnostic::warning(message).emit();
}

/// Emit an error.
pub fn error(message: impl Into<String>) {
    Diagnostic::error(message).emit();
}
