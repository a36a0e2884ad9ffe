use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PipelensError;

/// Final outcome of a completed build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BuildResult {
    Succeeded,
    Failed,
    PartiallySucceeded,
    Canceled,
    Unknown,
}

impl BuildResult {
    /// Maps the `result` string Azure DevOps reports. Anything unrecognised is `Unknown`.
    pub fn from_upstream(value: Option<&str>) -> Self {
        value
            .and_then(|v| v.parse().ok())
            .unwrap_or(BuildResult::Unknown)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BuildResult::Succeeded => "succeeded",
            BuildResult::Failed => "failed",
            BuildResult::PartiallySucceeded => "partiallySucceeded",
            BuildResult::Canceled => "canceled",
            BuildResult::Unknown => "unknown",
        }
    }
}

impl FromStr for BuildResult {
    type Err = PipelensError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "succeeded" => Ok(BuildResult::Succeeded),
            "failed" => Ok(BuildResult::Failed),
            "partiallysucceeded" => Ok(BuildResult::PartiallySucceeded),
            "canceled" | "cancelled" => Ok(BuildResult::Canceled),
            "unknown" | "none" => Ok(BuildResult::Unknown),
            other => Err(PipelensError::Validation(format!(
                "Unknown build result '{other}'"
            ))),
        }
    }
}

impl fmt::Display for BuildResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A completed pipeline run, normalised from the Azure DevOps payload.
///
/// Records are immutable once built; the cache hands out shared snapshots of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildRecord {
    pub id: u64,
    pub pipeline_name: String,
    /// Full ref, e.g. `refs/heads/main`
    pub source_branch: String,
    /// Ref with the `refs/heads/` prefix removed
    pub source_branch_display: String,
    pub build_number: String,
    pub result: BuildResult,
    pub start_time: Option<DateTime<Utc>>,
    pub finish_time: Option<DateTime<Utc>>,
    pub duration_seconds: Option<u64>,
    pub web_url: Option<String>,
}

impl BuildRecord {
    /// Builds a record and derives its display branch and duration.
    ///
    /// Returns `None` when the run finished before it started, since such a
    /// record cannot carry a non-negative duration.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: u64,
        pipeline_name: String,
        source_branch: String,
        build_number: String,
        result: BuildResult,
        start_time: Option<DateTime<Utc>>,
        finish_time: Option<DateTime<Utc>>,
        web_url: Option<String>,
    ) -> Option<Self> {
        let duration_seconds = match (start_time, finish_time) {
            (Some(start), Some(finish)) if finish < start => return None,
            (Some(start), Some(finish)) => u64::try_from((finish - start).num_seconds()).ok(),
            _ => None,
        };

        Some(Self {
            id,
            source_branch_display: crate::query::branches::strip_refs_heads(&source_branch)
                .to_string(),
            pipeline_name,
            source_branch,
            build_number,
            result,
            start_time,
            finish_time,
            duration_seconds,
            web_url,
        })
    }

    /// Timestamp used for ordering: start time, else finish time.
    ///
    /// `None` sorts before every real timestamp.
    pub fn effective_time(&self) -> Option<DateTime<Utc>> {
        self.start_time.or(self.finish_time)
    }
}

/// Identity of one upstream fetch. Queries that differ only in branch, pipeline,
/// result, sort or page share the same signature and therefore the same cached set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QuerySignature {
    pub organization: String,
    pub project: String,
    pub days: usize,
}

impl fmt::Display for QuerySignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} ({}d)", self.organization, self.project, self.days)
    }
}
