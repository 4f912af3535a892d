// src/rules.rs

//! Install and upgrade rules.
//!
//! A rule file holds one `(event, pattern, action)` triple per line,
//! event being `INSTALL` or `UPGRADE`, the pattern an extended regular
//! expression matched against the package-relative path and the action
//! `YES` or `NO`. Later rules override earlier ones.
//!
//! Patterns are compiled once at load time; a pattern the regex engine
//! rejects aborts the load instead of silently matching nothing.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use regex::Regex;
use tracing::debug;

use crate::fsutil;
use crate::{Error, Result};

/// Default rule configuration, relative to the root.
pub const PKGADD_CONF: &str = "etc/pkgadd.conf";

/// Longest accepted configuration line, in bytes.
const CONF_MAXLINE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleEvent {
    Install,
    Upgrade,
}

/// One `(event, pattern, action)` rule; `action` is true for `YES`.
#[derive(Debug, Clone)]
pub struct Rule {
    pub event: RuleEvent,
    pub pattern: Regex,
    pub action: bool,
}

impl Rule {
    fn applies_to(&self, file: &str) -> bool {
        self.pattern.is_match(file)
    }
}

/// Read the rule list for `root`.
///
/// `config` overrides the default `<root>/etc/pkgadd.conf`. A file
/// that cannot be opened yields an empty rule list; a file that cannot
/// be parsed is a [`Error::ConfigParse`].
pub fn read_config(root: &str, config: Option<&Path>) -> Result<Vec<Rule>> {
    let filename = match config {
        Some(path) => path.to_path_buf(),
        None => PathBuf::from(fsutil::normalize(&format!("{}/{}", root, PKGADD_CONF))),
    };

    let file = match File::open(&filename) {
        Ok(file) => file,
        Err(_) => return Ok(Vec::new()),
    };

    let parse_err = |line: usize, reason: String| Error::ConfigParse {
        file: filename.clone(),
        line,
        reason,
    };

    let mut rules = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let lineno = index + 1;
        let line = line.map_err(|e| parse_err(lineno, e.to_string()))?;

        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line.len() >= CONF_MAXLINE {
            return Err(parse_err(lineno, "line too long, aborting".into()));
        }

        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() != 3 {
            return Err(parse_err(lineno, "wrong number of arguments, aborting".into()));
        }

        let event = match tokens[0] {
            "INSTALL" => RuleEvent::Install,
            "UPGRADE" => RuleEvent::Upgrade,
            other => {
                return Err(parse_err(
                    lineno,
                    format!("'{}' unknown event, aborting", other),
                ))
            }
        };

        let pattern = Regex::new(tokens[1]).map_err(|_| {
            parse_err(
                lineno,
                format!("error compiling regular expression '{}', aborting", tokens[1]),
            )
        })?;

        let action = match tokens[2] {
            "YES" => true,
            "NO" => false,
            other => {
                return Err(parse_err(
                    lineno,
                    format!("'{}' unknown action, should be YES or NO, aborting", other),
                ))
            }
        };

        rules.push(Rule {
            event,
            pattern,
            action,
        });
    }

    debug!("{} rules read from {}", rules.len(), filename.display());
    Ok(rules)
}

/// Partition a file set by the INSTALL rules.
///
/// The last matching INSTALL rule decides each path; a path no rule
/// matches is installed. Returns `(install_set, non_install_set)`.
pub fn apply_install_rules(
    files: &BTreeSet<String>,
    rules: &[Rule],
) -> (BTreeSet<String>, BTreeSet<String>) {
    let mut install = BTreeSet::new();
    let mut non_install = BTreeSet::new();

    for file in files {
        let verdict = rules
            .iter()
            .rev()
            .filter(|rule| rule.event == RuleEvent::Install)
            .find(|rule| rule.applies_to(file))
            .map(|rule| rule.action)
            .unwrap_or(true);

        if verdict {
            install.insert(file.clone());
        } else {
            non_install.insert(file.clone());
        }
    }

    (install, non_install)
}

/// Collect the files an UPGRADE rule with action `NO` wants preserved.
///
/// The last matching UPGRADE rule decides; files without a match are
/// not kept.
pub fn make_keep_list(files: &BTreeSet<String>, rules: &[Rule]) -> BTreeSet<String> {
    let mut keep = BTreeSet::new();

    for file in files {
        let matched = rules
            .iter()
            .rev()
            .filter(|rule| rule.event == RuleEvent::Upgrade)
            .find(|rule| rule.applies_to(file));

        if let Some(rule) = matched {
            if !rule.action {
                keep.insert(file.clone());
            }
        }
    }

    keep
}
