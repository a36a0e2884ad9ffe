use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::info;
use std::path::PathBuf;

use crate::config::{Config, Settings};
use crate::providers::AzureProvider;
use crate::query::QueryParams;
use crate::server::{self, AppState};

#[derive(Parser)]
#[command(name = "pipelens")]
#[command(author, version, about = "Azure DevOps build history service", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to ./pipelens.{toml,json,yaml,yml})
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    output: Option<PathBuf>,

    #[arg(short, long, global = true, default_value_t = false)]
    pretty: bool,
}

/// Connection settings that override the configuration file.
#[derive(Args)]
struct AzureArgs {
    #[arg(long = "org", env = "AZDO_ORG")]
    organization: Option<String>,

    #[arg(short = 'P', long, env = "AZDO_PROJECT")]
    project: Option<String>,

    #[arg(short, long, env = "AZDO_PAT", hide_env_values = true)]
    token: Option<String>,

    #[arg(long, env = "AZDO_CACHE_TTL_SECONDS")]
    cache_ttl_seconds: Option<u64>,

    #[arg(long, env = "AZDO_RATE_LIMIT_CAPACITY")]
    rate_limit_capacity: Option<u32>,

    #[arg(long, env = "AZDO_RATE_LIMIT_REFILL_PER_SECOND")]
    rate_limit_refill_per_second: Option<f64>,
}

impl AzureArgs {
    fn apply(&self, config: &mut Config) {
        if let Some(organization) = &self.organization {
            config.azure.organization = Some(organization.clone());
        }
        if let Some(project) = &self.project {
            config.azure.project = Some(project.clone());
        }
        if let Some(token) = &self.token {
            config.azure.token = Some(token.clone());
        }
        if let Some(ttl) = self.cache_ttl_seconds {
            config.cache.ttl_seconds = ttl;
        }
        if let Some(capacity) = self.rate_limit_capacity {
            config.rate_limit.capacity = capacity;
        }
        if let Some(refill) = self.rate_limit_refill_per_second {
            config.rate_limit.refill_per_second = refill;
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the build history API over HTTP
    Serve {
        #[command(flatten)]
        azure: AzureArgs,

        #[arg(long)]
        host: Option<String>,

        #[arg(long)]
        port: Option<u16>,
    },

    /// Run a single build query and print the page as JSON
    Builds {
        #[command(flatten)]
        azure: AzureArgs,

        #[arg(short, long)]
        days: Option<i64>,

        #[arg(long)]
        top: Option<i64>,

        #[arg(long)]
        page: Option<i64>,

        #[arg(long)]
        page_size: Option<i64>,

        /// Branch name or glob, e.g. `release/*`
        #[arg(short, long)]
        branch: Option<String>,

        /// Case-insensitive pipeline name fragment
        #[arg(long)]
        pipeline: Option<String>,

        /// Result to include; repeat or comma-separate for several
        #[arg(short, long = "result")]
        results: Vec<String>,

        /// `desc` (newest first) or `asc`
        #[arg(long)]
        order: Option<String>,

        /// IANA timezone for displayed times
        #[arg(long)]
        timezone: Option<String>,
    },
}

impl Cli {
    fn settings(&self, azure: &AzureArgs) -> Result<(Config, Settings)> {
        let mut config = Config::load(self.config.as_deref())?;
        azure.apply(&mut config);
        let settings = config.settings().context("Invalid configuration")?;
        Ok((config, settings))
    }

    async fn execute_serve(
        &self,
        azure: &AzureArgs,
        host: Option<&str>,
        port: Option<u16>,
    ) -> Result<()> {
        let (config, settings) = self.settings(azure)?;
        let host = host.unwrap_or(&config.server.host);
        let port = port.unwrap_or(config.server.port);

        let provider = AzureProvider::new(&settings)?;
        server::serve(AppState { provider }, &format!("{host}:{port}")).await
    }

    async fn execute_builds(&self, azure: &AzureArgs, params: QueryParams) -> Result<()> {
        let (_, settings) = self.settings(azure)?;
        info!(
            "Querying builds for {}/{}",
            settings.organization, settings.project
        );

        let provider = AzureProvider::new(&settings)?;
        let page = provider.query(&params).await?;

        let json_output = if self.pretty {
            serde_json::to_string_pretty(&page)?
        } else {
            serde_json::to_string(&page)?
        };

        if let Some(output_path) = &self.output {
            std::fs::write(output_path, json_output)
                .with_context(|| format!("Failed to write {}", output_path.display()))?;
            info!("Builds written to: {}", output_path.display());
        } else {
            println!("{}", json_output);
        }

        Ok(())
    }

    pub async fn execute(&self) -> Result<()> {
        match &self.command {
            Commands::Serve { azure, host, port } => {
                self.execute_serve(azure, host.as_deref(), *port).await
            }
            Commands::Builds {
                azure,
                days,
                top,
                page,
                page_size,
                branch,
                pipeline,
                results,
                order,
                timezone,
            } => {
                let params = QueryParams {
                    days: *days,
                    top: *top,
                    page: *page,
                    page_size: *page_size,
                    branch: branch.clone(),
                    pipeline: pipeline.clone(),
                    results: results
                        .iter()
                        .flat_map(|r| r.split(','))
                        .map(str::trim)
                        .filter(|r| !r.is_empty())
                        .map(ToString::to_string)
                        .collect(),
                    order: order.clone(),
                    timezone: timezone.clone(),
                };
                self.execute_builds(azure, params).await
            }
        }
    }
}
