use url::Url;

/// Builds clickable Azure DevOps web URLs for a project.
#[derive(Debug, Clone)]
pub struct BuildLinks {
    project_url: Option<Url>,
}

impl BuildLinks {
    pub fn new(base_url: &Url, organization: &str, project: &str) -> Self {
        let mut url = base_url.clone();
        let has_path = match url.path_segments_mut() {
            Ok(mut segments) => {
                segments.pop_if_empty().extend([organization, project]);
                true
            }
            Err(()) => false,
        };
        Self {
            project_url: has_path.then_some(url),
        }
    }

    /// Link to a build's results page, e.g.
    /// <https://dev.azure.com/org/project/_build/results?buildId=123>
    pub fn build_results_url(&self, build_id: u64) -> Option<String> {
        let mut url = self.project_url.clone()?;
        url.path_segments_mut().ok()?.extend(["_build", "results"]);
        url.query_pairs_mut()
            .append_pair("buildId", &build_id.to_string());
        Some(url.into())
    }
}
