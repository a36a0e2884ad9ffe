pub mod branches;
pub mod timezone;

use std::collections::HashSet;

use chrono_tz::Tz;
use serde::Serialize;

use crate::config::Limits;
use crate::error::{PipelensError, Result};
use crate::records::{BuildRecord, BuildResult};

use branches::BranchPattern;

/// Direction of the start-time sort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Descending,
    Ascending,
}

impl std::str::FromStr for SortOrder {
    type Err = PipelensError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "desc" | "descending" => Ok(SortOrder::Descending),
            "asc" | "ascending" => Ok(SortOrder::Ascending),
            other => Err(PipelensError::Validation(format!(
                "Unknown sort order '{other}' (expected 'asc' or 'desc')"
            ))),
        }
    }
}

/// Raw, unvalidated query parameters as they arrive from HTTP or the CLI.
#[derive(Debug, Clone, Default)]
pub struct QueryParams {
    pub days: Option<i64>,
    pub top: Option<i64>,
    pub page: Option<i64>,
    pub page_size: Option<i64>,
    pub branch: Option<String>,
    pub pipeline: Option<String>,
    pub results: Vec<String>,
    pub order: Option<String>,
    pub timezone: Option<String>,
}

impl QueryParams {
    /// Collects parameters from decoded query-string pairs.
    ///
    /// `results` may be repeated and may hold comma-separated values.
    ///
    /// # Errors
    ///
    /// Returns `PipelensError::Validation` if a numeric parameter is not an integer.
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut params = Self::default();

        for (key, value) in pairs {
            let value = value.as_ref();
            match key.as_ref() {
                "days" => params.days = Some(parse_int("days", value)?),
                "top" => params.top = Some(parse_int("top", value)?),
                "page" => params.page = Some(parse_int("page", value)?),
                "pageSize" | "page_size" => {
                    params.page_size = Some(parse_int("pageSize", value)?);
                }
                "branch" => params.branch = Some(value.to_string()),
                "pipeline" => params.pipeline = Some(value.to_string()),
                "results" => params.results.extend(
                    value
                        .split(',')
                        .map(str::trim)
                        .filter(|v| !v.is_empty())
                        .map(ToString::to_string),
                ),
                "order" => params.order = Some(value.to_string()),
                "timezone_name" | "timezone" => params.timezone = Some(value.to_string()),
                _ => {}
            }
        }

        Ok(params)
    }
}

fn parse_int(name: &str, value: &str) -> Result<i64> {
    value.trim().parse().map_err(|_| {
        PipelensError::Validation(format!("Parameter '{name}' must be an integer, got '{value}'"))
    })
}

/// A validated query, built once at the boundary and read-only afterwards.
#[derive(Debug, Clone)]
pub struct EffectiveQuery {
    pub days: usize,
    pub top: usize,
    pub branch: Option<BranchPattern>,
    /// Lowercased, trimmed pipeline-name fragment
    pub pipeline: Option<String>,
    /// Empty means every result is kept
    pub results: HashSet<BuildResult>,
    pub order: SortOrder,
    pub page: usize,
    pub page_size: usize,
    pub timezone: Tz,
}

impl EffectiveQuery {
    /// Clamps numeric parameters into `limits` and parses the rest.
    ///
    /// Out-of-range numbers are clamped, never rejected. Unknown result or
    /// sort values are rejected; an unknown timezone falls back to UTC.
    ///
    /// # Errors
    ///
    /// Returns `PipelensError::Validation` for unparseable filter values.
    pub fn resolve(params: &QueryParams, limits: &Limits) -> Result<Self> {
        let days = clamp(params.days, limits.default_days, 1, limits.max_days);
        let top = clamp(params.top, limits.default_top, 1, limits.max_top);
        let page_size = clamp(
            params.page_size,
            limits.default_page_size,
            1,
            limits.max_page_size,
        );
        let page = clamp(params.page, 1, 1, usize::MAX);

        let branch = match params.branch.as_deref() {
            Some(pattern) => BranchPattern::compile(pattern)?,
            None => None,
        };

        let pipeline = params
            .pipeline
            .as_deref()
            .map(|p| p.trim().to_lowercase())
            .filter(|p| !p.is_empty());

        let results = params
            .results
            .iter()
            .map(|r| r.parse::<BuildResult>())
            .collect::<Result<HashSet<_>>>()?;

        let order = params
            .order
            .as_deref()
            .map(str::parse::<SortOrder>)
            .transpose()?
            .unwrap_or_default();

        Ok(Self {
            days,
            top,
            branch,
            pipeline,
            results,
            order,
            page,
            page_size,
            timezone: timezone::resolve(params.timezone.as_deref()),
        })
    }
}

fn clamp(value: Option<i64>, default: usize, min: usize, max: usize) -> usize {
    match value {
        None => default.clamp(min, max),
        Some(v) => usize::try_from(v).unwrap_or(min).clamp(min, max),
    }
}

/// One build as presented to clients, with times localised to the requested zone.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildView {
    pub id: u64,
    pub pipeline_name: String,
    pub source_branch: String,
    pub source_branch_display: String,
    pub build_number: String,
    pub result: BuildResult,
    pub start_time: Option<String>,
    pub start_timestamp: Option<i64>,
    pub duration_seconds: Option<u64>,
    pub web_url: Option<String>,
}

impl BuildView {
    fn localized(record: &BuildRecord, tz: Tz) -> Self {
        let start = record.effective_time();
        Self {
            id: record.id,
            pipeline_name: record.pipeline_name.clone(),
            source_branch: record.source_branch.clone(),
            source_branch_display: record.source_branch_display.clone(),
            build_number: record.build_number.clone(),
            result: record.result,
            start_time: start.map(|t| timezone::localize(t, tz)),
            start_timestamp: start.map(|t| t.timestamp()),
            duration_seconds: record.duration_seconds,
            web_url: record.web_url.clone(),
        }
    }
}

/// One page of query results.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildsPage {
    pub builds: Vec<BuildView>,
    pub count: usize,
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
    pub days: usize,
    pub top: usize,
    pub branch: Option<String>,
    pub pipeline: Option<String>,
    pub timezone: String,
}

/// Filters, sorts, paginates and localises `records` for one query.
///
/// `records` must be in upstream fetch order (newest finished first); that
/// order is the tie-breaker for equal timestamps.
pub fn execute(records: &[BuildRecord], query: &EffectiveQuery) -> BuildsPage {
    let mut matched: Vec<&BuildRecord> = records
        .iter()
        .take(query.top)
        .filter(|r| query.branch.as_ref().map_or(true, |p| p.matches(&r.source_branch)))
        .filter(|r| {
            query
                .pipeline
                .as_deref()
                .map_or(true, |needle| r.pipeline_name.to_lowercase().contains(needle))
        })
        .filter(|r| query.results.is_empty() || query.results.contains(&r.result))
        .collect();

    match query.order {
        SortOrder::Descending => matched.sort_by(|a, b| b.effective_time().cmp(&a.effective_time())),
        SortOrder::Ascending => matched.sort_by(|a, b| a.effective_time().cmp(&b.effective_time())),
    }

    let total = matched.len();
    let offset = (query.page - 1).saturating_mul(query.page_size);
    let builds: Vec<BuildView> = matched
        .into_iter()
        .skip(offset)
        .take(query.page_size)
        .map(|r| BuildView::localized(r, query.timezone))
        .collect();

    BuildsPage {
        count: builds.len(),
        builds,
        total,
        page: query.page,
        page_size: query.page_size,
        days: query.days,
        top: query.top,
        branch: query.branch.as_ref().map(|b| b.as_str().to_string()),
        pipeline: query.pipeline.clone(),
        timezone: query.timezone.name().to_string(),
    }
}
