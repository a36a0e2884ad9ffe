use log::info;
use std::sync::Arc;

use crate::config::{Limits, Settings};
use crate::error::Result;
use crate::query::{self, BuildsPage, EffectiveQuery, QueryParams};
use crate::rate_limit::RateLimiter;
use crate::records::{BuildRecord, QuerySignature};

use super::cache::ResponseCache;
use super::client::AzureClient;

/// Azure DevOps build history provider.
///
/// Owns the shared outbound rate limiter, the HTTP client and the response
/// cache. Create one at startup and share it across request handlers.
pub struct AzureProvider {
    client: Arc<AzureClient>,
    cache: ResponseCache<QuerySignature, Arc<[BuildRecord]>>,
    organization: String,
    project: String,
    limits: Limits,
}

impl AzureProvider {
    /// Creates a provider from validated settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(settings: &Settings) -> Result<Self> {
        let limiter = Arc::new(RateLimiter::new(
            settings.rate_limit_capacity,
            settings.rate_limit_refill_per_second,
            settings.rate_limit_max_wait,
        ));
        let client = AzureClient::new(settings, limiter)?;

        info!(
            "Azure DevOps provider ready for {}/{} (cache TTL {}s)",
            settings.organization,
            settings.project,
            settings.cache_ttl.as_secs()
        );

        Ok(Self {
            client: Arc::new(client),
            cache: ResponseCache::new(settings.cache_ttl),
            organization: settings.organization.clone(),
            project: settings.project.clone(),
            limits: settings.limits.clone(),
        })
    }

    /// Returns the builds of the last `days` days, newest finished first.
    ///
    /// Always fetches up to `max-top` records so the cached set can serve any
    /// `top` a query asks for.
    pub async fn builds(&self, days: usize) -> Result<Arc<[BuildRecord]>> {
        let signature = QuerySignature {
            organization: self.organization.clone(),
            project: self.project.clone(),
            days,
        };
        let client = Arc::clone(&self.client);
        let max_records = self.limits.max_top;

        self.cache
            .get_or_fetch(signature, move || async move {
                client
                    .fetch_builds(days, max_records)
                    .await
                    .map(Arc::from)
            })
            .await
    }

    /// Validates `params`, loads the matching build set and returns one page.
    ///
    /// # Errors
    ///
    /// Returns `PipelensError::Validation` for bad parameters (before any
    /// upstream call), or the upstream error if the build set cannot be loaded.
    pub async fn query(&self, params: &QueryParams) -> Result<BuildsPage> {
        let query = EffectiveQuery::resolve(params, &self.limits)?;
        let records = self.builds(query.days).await?;
        Ok(query::execute(&records, &query))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_config;
    use crate::error::PipelensError;
    use mockito::{Matcher, Server};
    use serde_json::json;

    const BUILDS_PATH: &str = "/contoso/web/_apis/build/builds";

    fn body() -> String {
        json!({
            "value": [
                {
                    "id": 1,
                    "buildNumber": "1",
                    "definition": {"name": "API Build"},
                    "sourceBranch": "refs/heads/release/1.0",
                    "result": "succeeded",
                    "startTime": "2024-01-01T10:00:00Z",
                    "finishTime": "2024-01-01T10:10:00Z"
                },
                {
                    "id": 2,
                    "buildNumber": "2",
                    "definition": {"name": "UI Deploy"},
                    "sourceBranch": "refs/heads/main",
                    "result": "failed",
                    "startTime": "2024-01-01T09:00:00Z",
                    "finishTime": "2024-01-01T09:30:00Z"
                }
            ]
        })
        .to_string()
    }

    fn params(pairs: &[(&str, &str)]) -> QueryParams {
        QueryParams::from_pairs(pairs.iter().copied()).unwrap()
    }

    #[tokio::test]
    async fn test_queries_with_same_signature_share_one_fetch() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", BUILDS_PATH)
            .match_query(Matcher::UrlEncoded("$top".into(), "250".into()))
            .with_status(200)
            .with_body(body())
            .expect(1)
            .create_async()
            .await;

        let provider = AzureProvider::new(&test_config(&server.url()).settings().unwrap()).unwrap();

        let page = provider
            .query(&params(&[("branch", "release/*")]))
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.builds[0].pipeline_name, "API Build");

        let page = provider
            .query(&params(&[("pipeline", "deploy"), ("results", "failed")]))
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.builds[0].pipeline_name, "UI Deploy");

        let page = provider.query(&params(&[("order", "asc")])).await.unwrap();
        let ids: Vec<u64> = page.builds.iter().map(|b| b.id).collect();
        assert_eq!(ids, vec![2, 1]);

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_different_day_windows_fetch_separately() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", BUILDS_PATH)
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(body())
            .expect(2)
            .create_async()
            .await;

        let provider = AzureProvider::new(&test_config(&server.url()).settings().unwrap()).unwrap();

        provider.query(&params(&[("days", "7")])).await.unwrap();
        provider.query(&params(&[("days", "30")])).await.unwrap();
        provider.query(&params(&[("days", "30"), ("page", "2")])).await.unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_validation_error_makes_no_upstream_call() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", BUILDS_PATH)
            .match_query(Matcher::Any)
            .expect(0)
            .create_async()
            .await;

        let provider = AzureProvider::new(&test_config(&server.url()).settings().unwrap()).unwrap();
        let err = provider
            .query(&QueryParams {
                results: vec!["exploded".into()],
                ..QueryParams::default()
            })
            .await
            .unwrap_err();

        assert!(matches!(err, PipelensError::Validation(_)));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_failed_fetch_is_retried_on_next_query() {
        let mut server = Server::new_async().await;
        let failing = server
            .mock("GET", BUILDS_PATH)
            .match_query(Matcher::Any)
            .with_status(403)
            .expect(1)
            .create_async()
            .await;

        let provider = AzureProvider::new(&test_config(&server.url()).settings().unwrap()).unwrap();
        let err = provider.query(&QueryParams::default()).await.unwrap_err();
        assert!(matches!(err, PipelensError::UpstreamAuth { status: 403, .. }));
        failing.assert_async().await;
        failing.remove_async().await;

        let ok = server
            .mock("GET", BUILDS_PATH)
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(body())
            .expect(1)
            .create_async()
            .await;

        let page = provider.query(&QueryParams::default()).await.unwrap();
        assert_eq!(page.total, 2);
        ok.assert_async().await;
    }
}
