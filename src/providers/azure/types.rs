use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::records::{BuildRecord, BuildResult};

use super::links::BuildLinks;

/// Body of `GET _apis/build/builds`.
///
/// Items stay as raw JSON so one malformed build cannot fail the whole page.
#[derive(Debug, Deserialize)]
pub struct BuildListResponse {
    #[serde(default)]
    pub value: Vec<Value>,
}

/// A build as Azure DevOps returns it. Only the fields the dashboard uses are modelled.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AzureBuild {
    id: u64,
    build_number: Option<String>,
    result: Option<String>,
    source_branch: Option<String>,
    start_time: Option<DateTime<Utc>>,
    finish_time: Option<DateTime<Utc>>,
    definition: Option<AzureDefinition>,
    #[serde(rename = "_links")]
    links: Option<AzureLinks>,
}

#[derive(Debug, Deserialize)]
struct AzureDefinition {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AzureLinks {
    web: Option<AzureHref>,
}

#[derive(Debug, Deserialize)]
struct AzureHref {
    href: String,
}

/// Converts one raw build into a `BuildRecord`.
///
/// Returns `None` for builds that cannot be represented: undecodable fields,
/// a missing pipeline name or build number, or a finish time before the start.
fn normalize_build(value: Value, links: &BuildLinks) -> Option<BuildRecord> {
    let build: AzureBuild = serde_json::from_value(value).ok()?;

    let pipeline_name = build.definition.and_then(|d| d.name)?;
    let build_number = build.build_number?;
    let web_url = build
        .links
        .and_then(|l| l.web)
        .map(|w| w.href)
        .or_else(|| links.build_results_url(build.id));

    BuildRecord::new(
        build.id,
        pipeline_name,
        build.source_branch.unwrap_or_default(),
        build_number,
        BuildResult::from_upstream(build.result.as_deref()),
        build.start_time,
        build.finish_time,
        web_url,
    )
}

/// Normalises a page of builds, preserving order. Returns the records and the
/// number of builds that had to be skipped.
pub fn normalize_builds(values: Vec<Value>, links: &BuildLinks) -> (Vec<BuildRecord>, usize) {
    let total = values.len();
    let records: Vec<BuildRecord> = values
        .into_iter()
        .filter_map(|value| normalize_build(value, links))
        .collect();
    let skipped = total - records.len();
    (records, skipped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use url::Url;

    fn links() -> BuildLinks {
        BuildLinks::new(&Url::parse("https://dev.azure.com").unwrap(), "org", "proj")
    }

    #[test]
    fn test_normalize_full_build() {
        let value = json!({
            "id": 1,
            "buildNumber": "123",
            "definition": {"name": "Pipe"},
            "sourceBranch": "refs/heads/main",
            "result": "succeeded",
            "status": "completed",
            "startTime": "2024-01-01T00:00:00Z",
            "finishTime": "2024-01-01T00:30:00.1234567Z",
            "_links": {"web": {"href": "https://dev.azure.com/org/proj/_build/results?buildId=1"}}
        });

        let (records, skipped) = normalize_builds(vec![value], &links());
        assert_eq!(skipped, 0);

        let record = &records[0];
        assert_eq!(record.pipeline_name, "Pipe");
        assert_eq!(record.source_branch_display, "main");
        assert_eq!(record.result, BuildResult::Succeeded);
        assert_eq!(record.duration_seconds, Some(1800));
        assert_eq!(
            record.web_url.as_deref(),
            Some("https://dev.azure.com/org/proj/_build/results?buildId=1")
        );
    }

    #[test]
    fn test_normalize_builds_web_url_when_missing() {
        let value = json!({
            "id": 42,
            "buildNumber": "42",
            "definition": {"name": "Pipe"},
            "sourceBranch": "refs/heads/main",
            "result": "somethingNew"
        });

        let (records, _) = normalize_builds(vec![value], &links());
        assert_eq!(records[0].result, BuildResult::Unknown);
        assert_eq!(
            records[0].web_url.as_deref(),
            Some("https://dev.azure.com/org/proj/_build/results?buildId=42")
        );
    }

    #[test]
    fn test_malformed_builds_are_skipped_and_counted() {
        let values = vec![
            json!({"id": 1, "buildNumber": "1", "definition": {"name": "Pipe"}}),
            json!({"id": "not-a-number", "buildNumber": "2", "definition": {"name": "Pipe"}}),
            json!({"id": 3, "buildNumber": "3"}),
            json!({"id": 4, "definition": {"name": "Pipe"}}),
            json!({
                "id": 5,
                "buildNumber": "5",
                "definition": {"name": "Pipe"},
                "startTime": "2024-01-01T01:00:00Z",
                "finishTime": "2024-01-01T00:00:00Z"
            }),
            json!({"id": 6, "buildNumber": "6", "definition": {"name": "Pipe"}, "startTime": "yesterday"}),
            json!({"id": 7, "buildNumber": "7", "definition": {"name": "Pipe"}}),
        ];

        let (records, skipped) = normalize_builds(values, &links());
        assert_eq!(skipped, 5);
        let ids: Vec<u64> = records.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 7]);
    }
}
