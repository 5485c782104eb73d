//! `when_modified` trigger matching.
//!
//! Patterns are relative to the project dir and are rewritten to repo-relative
//! globs at compile time. A `!` prefix excludes; the last pattern that
//! matches a file decides, like `.gitignore`.

use glob::{MatchOptions, Pattern};

use crate::errors::ConfigError;
use crate::models::normalize_dir;

/// Patterns applied when a project declares no `when_modified`.
pub const DEFAULT_WHEN_MODIFIED: &[&str] = &[
    "**/*.tf*",
    "**/terragrunt.hcl",
    "**/.terraform.lock.hcl",
];

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

#[derive(Debug, Clone)]
struct Rule {
    pattern: Pattern,
    exclude: bool,
}

#[derive(Debug, Clone)]
pub struct WhenModified {
    rules: Vec<Rule>,
}

impl WhenModified {
    pub fn compile(project_dir: &str, patterns: &[String]) -> Result<Self, ConfigError> {
        let mut rules = Vec::with_capacity(patterns.len());
        for raw in patterns {
            let trimmed = raw.trim();
            let (exclude, body) = match trimmed.strip_prefix('!') {
                Some(rest) => (true, rest),
                None => (false, trimmed),
            };
            if body.is_empty() {
                return Err(ConfigError::InvalidPattern {
                    pattern: raw.clone(),
                    message: "empty pattern".to_string(),
                });
            }
            let joined = if project_dir == "." {
                body.to_string()
            } else {
                format!("{}/{}", project_dir, body)
            };
            let pattern = Pattern::new(&normalize_dir(&joined)).map_err(|e| {
                ConfigError::InvalidPattern {
                    pattern: raw.clone(),
                    message: e.to_string(),
                }
            })?;
            rules.push(Rule { pattern, exclude });
        }
        Ok(Self { rules })
    }

    pub fn defaults(project_dir: &str) -> Result<Self, ConfigError> {
        let patterns: Vec<String> = DEFAULT_WHEN_MODIFIED.iter().map(|p| p.to_string()).collect();
        Self::compile(project_dir, &patterns)
    }

    /// Whether a repo-relative changed path triggers this project.
    pub fn matches(&self, file: &str) -> bool {
        let file = normalize_dir(file);
        let mut matched = false;
        for rule in &self.rules {
            if rule.pattern.matches_with(&file, MATCH_OPTIONS) {
                matched = !rule.exclude;
            }
        }
        matched
    }

    pub fn matches_any<S: AsRef<str>>(&self, files: &[S]) -> bool {
        files.iter().any(|f| self.matches(f.as_ref()))
    }
}
