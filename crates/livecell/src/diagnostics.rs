//! Locating errors and goals in a proof-assistant report.
//!
//! Reports look like:
//!
//! ```text
//! *All Goals, Errors*: ?0 : _58
//! Sort _57  [ at /home/u/lab/code/coinduction.agda:53,27-30 ]
//! *Error*: /home/u/lab/test.agda:5,8-8
//! /home/u/lab/test.agda:5,8: Parse error
//! ```
//!
//! Each `path:line,col-line,col` reference becomes a line range. A range
//! written `line,col-col` stays on one line.

use std::sync::OnceLock;

use regex::Regex;

use crate::error::{Error, Result};

/// Marker tokens that introduce a report worth scanning.
pub const REPORT_MARKERS: &[&str] = &[
    "*Error*",
    "*All Errors*",
    "*All Warnings*",
    "*All Goals, Errors*",
    "*All Errors, Warnings*",
    "*All Goals, Errors, Warnings*",
    "*All Goals, Warnings*",
];

/// A report that is exactly this text carries nothing to highlight.
pub const SUCCESS_SENTINEL: &str = "OK";

pub const DEFAULT_EXTENSION: &str = "agda";

/// One referenced location, lines 1-based and inclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    /// File name without its directory.
    pub file: String,
    pub line_from: usize,
    pub line_to: usize,
}

#[derive(Debug, Clone)]
pub struct DiagnosticParser {
    pattern: Regex,
}

fn location_pattern(extension: &str) -> String {
    format!(
        r"(/.*/([^/].*\.{})):(\d+),\d+-(\d+)(,\d+)?",
        regex::escape(extension)
    )
}

fn default_pattern() -> &'static Regex {
    static CACHED: OnceLock<Regex> = OnceLock::new();
    CACHED.get_or_init(|| {
        Regex::new(&location_pattern(DEFAULT_EXTENSION)).expect("diagnostic regex must compile")
    })
}

impl Default for DiagnosticParser {
    fn default() -> Self {
        Self {
            pattern: default_pattern().clone(),
        }
    }
}

impl DiagnosticParser {
    /// Parser for source files ending in `.{extension}`.
    pub fn new(extension: &str) -> Result<Self> {
        let extension = extension.trim_start_matches('.');
        if extension.is_empty() {
            return Err(Error::Config("diagnostic file extension is empty".to_string()));
        }
        let pattern = Regex::new(&location_pattern(extension))
            .map_err(|e| Error::Config(format!("diagnostic pattern: {e}")))?;
        Ok(Self { pattern })
    }

    /// Every location referenced by `report`, in order of appearance.
    pub fn parse(&self, report: &str) -> Vec<Diagnostic> {
        if report.trim_end() == SUCCESS_SENTINEL {
            return Vec::new();
        }
        if !REPORT_MARKERS.iter().any(|marker| report.starts_with(marker)) {
            return Vec::new();
        }

        self.pattern
            .captures_iter(report)
            .filter_map(|caps| {
                let file = caps.get(2)?.as_str().to_string();
                let line_from: usize = caps.get(3)?.as_str().parse().ok()?;
                let line_to = match caps.get(5) {
                    Some(_) => caps.get(4)?.as_str().parse().ok()?,
                    None => line_from,
                };
                Some(Diagnostic {
                    file,
                    line_from,
                    line_to: line_to.max(line_from),
                })
            })
            .collect()
    }
}
