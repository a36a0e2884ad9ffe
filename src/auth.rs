use std::fmt;

use crate::error::{PipelensError, Result};

/// Length of a classic Azure DevOps personal access token (lowercase base32).
const LEGACY_PAT_LEN: usize = 52;
/// Length of the newer Azure DevOps personal access token format (alphanumeric).
const PAT_LEN: usize = 84;

/// Azure DevOps personal access token.
///
/// `Debug` is redacted so the token never ends up in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct Token(String);

impl Token {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Token {
    fn from(value: &str) -> Self {
        Self(value.trim().to_string())
    }
}

impl From<String> for Token {
    fn from(value: String) -> Self {
        Self::from(value.as_str())
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Token(***)")
    }
}

/// Checks that a personal access token is present and shaped like one Azure DevOps issues.
///
/// Runs once at startup; the caller treats an error as fatal.
///
/// # Errors
///
/// Returns `PipelensError::Config` if the token is missing, empty, has the wrong
/// length, or contains characters outside the expected alphabet.
pub fn validate(token: Option<&Token>) -> Result<&Token> {
    let token = token.ok_or_else(|| {
        PipelensError::Config("Missing Azure DevOps access token (set AZDO_PAT)".into())
    })?;

    let value = token.as_str();
    if value.is_empty() {
        return Err(PipelensError::Config(
            "Azure DevOps access token is empty".into(),
        ));
    }

    let well_formed = match value.len() {
        LEGACY_PAT_LEN => value
            .chars()
            .all(|c| c.is_ascii_lowercase() || ('2'..='7').contains(&c)),
        PAT_LEN => value.chars().all(|c| c.is_ascii_alphanumeric()),
        _ => false,
    };

    if !well_formed {
        return Err(PipelensError::Config(format!(
            "Azure DevOps access token is malformed: expected {LEGACY_PAT_LEN} base32 or \
             {PAT_LEN} alphanumeric characters, got {} characters",
            value.len()
        )));
    }

    Ok(token)
}
