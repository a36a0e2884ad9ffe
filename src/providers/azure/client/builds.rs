use chrono::{DateTime, Days, SecondsFormat, Utc};
use log::{debug, warn};

use super::core::AzureClient;
use crate::error::Result;
use crate::providers::azure::types::{normalize_builds, BuildListResponse};
use crate::records::BuildRecord;

/// Most builds requested in a single page
const PAGE_SIZE: usize = 250;
const CONTINUATION_HEADER: &str = "x-ms-continuationtoken";

impl AzureClient {
    /// Fetches completed builds that finished within the last `days` days,
    /// newest first, following continuation tokens until `max_records` is reached.
    ///
    /// Builds that cannot be normalised are skipped and logged, not treated as errors.
    ///
    /// # Errors
    ///
    /// Returns the upstream error of the first page that fails after retries, or
    /// `PipelensError::RateLimitExceeded` if the outbound limiter refuses a page.
    pub async fn fetch_builds(&self, days: usize, max_records: usize) -> Result<Vec<BuildRecord>> {
        let min_time = Utc::now()
            .checked_sub_days(Days::new(days as u64))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
            .to_rfc3339_opts(SecondsFormat::Secs, true);

        let mut all_builds = Vec::new();
        let mut skipped_total = 0;
        let mut continuation: Option<String> = None;

        loop {
            let remaining = max_records.saturating_sub(all_builds.len());
            if remaining == 0 {
                break;
            }

            let mut query = vec![
                ("api-version", self.api_version.clone()),
                ("statusFilter", "completed".to_string()),
                ("queryOrder", "finishTimeDescending".to_string()),
                ("$top", remaining.min(PAGE_SIZE).to_string()),
                ("minTime", min_time.clone()),
            ];
            if let Some(token) = &continuation {
                query.push(("continuationToken", token.clone()));
            }

            let (page, headers): (BuildListResponse, _) =
                self.get_json(&self.builds_url, &query).await?;

            let next = headers
                .get(CONTINUATION_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(ToString::to_string);

            let page_len = page.value.len();
            let (builds, skipped) = normalize_builds(page.value, &self.links);
            debug!(
                "Fetched page of {} builds ({skipped} skipped), continuation: {}",
                builds.len(),
                next.is_some()
            );
            all_builds.extend(builds);
            skipped_total += skipped;

            match next {
                Some(_) if page_len == 0 => {
                    warn!("Azure DevOps returned an empty page with a continuation token, stopping");
                    break;
                }
                Some(token) if continuation.as_deref() == Some(token.as_str()) => {
                    warn!("Azure DevOps repeated continuation token '{token}', stopping");
                    break;
                }
                Some(token) => continuation = Some(token),
                None => break,
            }
        }

        if skipped_total > 0 {
            warn!("Skipped {skipped_total} malformed builds from Azure DevOps");
        }

        all_builds.truncate(max_records);

        Ok(all_builds)
    }
}
