use regex_lite::Regex;

use crate::error::{PipelensError, Result};

const HEADS_PREFIX: &str = "refs/heads/";

/// Prefixes a bare branch name with `refs/heads/`. Refs that already start
/// with `refs/` (tags, pull requests) are left alone.
pub fn normalize_branch(branch: &str) -> String {
    let branch = branch.trim();
    if branch.is_empty() || branch.starts_with("refs/") {
        branch.to_string()
    } else {
        format!("{HEADS_PREFIX}{branch}")
    }
}

/// Removes the `refs/heads/` prefix for display.
pub fn strip_refs_heads(branch: &str) -> &str {
    branch.strip_prefix(HEADS_PREFIX).unwrap_or(branch)
}

pub fn has_wildcard(pattern: &str) -> bool {
    pattern.contains(['*', '?'])
}

/// Case-insensitive glob over branch names, anchored at both ends.
///
/// `*` matches any run of characters (including `/`), `?` matches exactly one.
/// A pattern without wildcards names a single branch and is compared as a full
/// ref, so `main` and `refs/heads/main` select the same builds. A record matches
/// if either its full ref or its short display form matches.
#[derive(Debug, Clone)]
pub struct BranchPattern {
    source: String,
    regex: Regex,
}

impl BranchPattern {
    /// Compiles `pattern`; an empty or blank pattern yields `None` (no filtering).
    ///
    /// # Errors
    ///
    /// Returns `PipelensError::Validation` if the translated pattern cannot be compiled.
    pub fn compile(pattern: &str) -> Result<Option<Self>> {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return Ok(None);
        }

        let target = if has_wildcard(pattern) {
            pattern.to_string()
        } else {
            normalize_branch(pattern)
        };

        let mut expr = String::with_capacity(target.len() + 8);
        expr.push_str("(?i)^");
        for c in target.chars() {
            match c {
                '*' => expr.push_str(".*"),
                '?' => expr.push('.'),
                c => expr.push_str(&regex_lite::escape(c.encode_utf8(&mut [0; 4]))),
            }
        }
        expr.push('$');

        let regex = Regex::new(&expr).map_err(|e| {
            PipelensError::Validation(format!("Invalid branch pattern '{pattern}': {e}"))
        })?;

        Ok(Some(Self {
            source: pattern.to_string(),
            regex,
        }))
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, source_branch: &str) -> bool {
        self.regex.is_match(&normalize_branch(source_branch))
            || self.regex.is_match(strip_refs_heads(source_branch))
    }
}
