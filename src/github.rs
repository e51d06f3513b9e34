use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use octocrab::Octocrab;
use serde::de::DeserializeOwned;
use std::env;
use std::future::Future;
use std::process::Command;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::GitHubConfig;
use crate::discovery::{ForgeApi, ForgeUser, Page, RepositoryRef, Target, PER_PAGE};
use crate::error::BackupError;

/// Attempts made after a rate-limit response before giving up
const MAX_RATE_LIMIT_RETRIES: usize = 5;

/// Fallback delay when the rate limit status is unknown
const MIN_RATE_LIMIT_WAIT: Duration = Duration::from_secs(1);

/// Wait used for secondary rate limits, whose reset time the API doesn't report
const SECONDARY_RATE_LIMIT_WAIT: Duration = Duration::from_secs(60);

/// Upper bound for a single rate-limit wait
const DEFAULT_MAX_RATE_LIMIT_WAIT: Duration = Duration::from_secs(60 * 60);

/// GitHub REST API client that waits out rate limits
pub struct GitHubApi {
    client: Octocrab,
    max_rate_limit_wait: Duration,
}

/// GitHub authentication strategies
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStrategy {
    /// Token set in the configuration file or on the command line
    Configured,
    /// Use GitHub CLI authentication
    GitHubCLI,
    /// Use environment variable token
    EnvironmentToken,
}

impl GitHubApi {
    /// Create a client for the public API, or for `api_url` when set
    pub fn new(token: &str, api_url: Option<&str>) -> Result<Self> {
        let mut builder = Octocrab::builder().personal_token(token.to_string());

        if let Some(url) = api_url {
            builder = builder
                .base_uri(url)
                .with_context(|| format!("Invalid GitHub API URL: {}", url))?;
        }

        let client = builder.build().context("Failed to create GitHub client")?;

        Ok(Self {
            client,
            max_rate_limit_wait: DEFAULT_MAX_RATE_LIMIT_WAIT,
        })
    }

    /// Cap how long a single rate-limit wait may last
    pub fn with_max_rate_limit_wait(mut self, wait: Duration) -> Self {
        self.max_rate_limit_wait = wait;
        self
    }

    /// Run a request, retrying while the API reports a rate limit
    ///
    /// Each retry sleeps until the core limit resets (or a fixed wait for
    /// secondary limits), capped at `max_rate_limit_wait`.
    async fn with_rate_limit<T, F, Fut>(&self, request: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = octocrab::Result<T>>,
    {
        let reset_wait: Mutex<Option<Duration>> = Mutex::new(None);
        let (request, reset_wait) = (&request, &reset_wait);

        let attempt = move || async move {
            let result = request().await;
            if matches!(&result, Err(e) if is_rate_limit_error(e)) {
                let wait = self.rate_limit_wait().await;
                *reset_wait.lock().unwrap_or_else(PoisonError::into_inner) = Some(wait);
            }
            result
        };

        attempt
            .retry(self.backoff())
            .when(is_rate_limit_error)
            .adjust(|_, backoff| {
                let reset = reset_wait.lock().unwrap_or_else(PoisonError::into_inner).take();
                backoff.map(|fallback| reset.unwrap_or(fallback))
            })
            .notify(|_, wait| {
                warn!(
                    "GitHub rate limit hit, waiting {}s before retrying",
                    wait.as_secs()
                );
            })
            .await
            .map_err(Into::into)
    }

    /// Retry budget for rate-limited requests
    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(MIN_RATE_LIMIT_WAIT.min(self.max_rate_limit_wait))
            .with_max_delay(self.max_rate_limit_wait)
            .with_max_times(MAX_RATE_LIMIT_RETRIES)
    }

    /// How long until the core rate limit resets
    async fn rate_limit_wait(&self) -> Duration {
        let wait = match self.client.ratelimit().get().await {
            Ok(rate_limit) => {
                let core = &rate_limit.resources.core;
                let now = chrono::Utc::now().timestamp();
                let until_reset = core.reset as i64 - now;

                if core.remaining > 0 || until_reset <= 0 {
                    SECONDARY_RATE_LIMIT_WAIT
                } else {
                    Duration::from_secs(until_reset as u64 + 1)
                }
            }
            Err(e) => {
                debug!("Failed to query rate limit status: {}", e);
                SECONDARY_RATE_LIMIT_WAIT
            }
        };

        wait.min(self.max_rate_limit_wait)
    }

    async fn get_page<T: DeserializeOwned>(&self, route: &str, page: u32) -> Result<Page<T>> {
        let params = [("per_page", PER_PAGE), ("page", page)];

        let response: octocrab::Page<T> = self
            .with_rate_limit(|| self.client.get(route, Some(&params)))
            .await
            .with_context(|| format!("GET {}", route))?;

        Ok(Page {
            items: response.items,
            has_next: response.next.is_some(),
        })
    }
}

#[async_trait]
impl ForgeApi for GitHubApi {
    async fn get_user(&self, target: &Target) -> Result<ForgeUser> {
        let route = match target {
            Target::Authenticated => "/user".to_string(),
            Target::User(name) => format!("/users/{}", name),
        };

        self.with_rate_limit(|| self.client.get(&route, None::<&()>))
            .await
            .with_context(|| format!("GET {}", route))
    }

    async fn list_repositories_by_user(&self, login: &str, page: u32) -> Result<Page<RepositoryRef>> {
        self.get_page(&format!("/users/{}/repos", login), page).await
    }

    async fn list_repositories_for_authenticated_user(&self, page: u32) -> Result<Page<RepositoryRef>> {
        self.get_page("/user/repos", page).await
    }

    async fn list_starred(&self, login: &str, page: u32) -> Result<Page<RepositoryRef>> {
        // The default media type serves the starred repositories themselves
        self.get_page(&format!("/users/{}/starred", login), page).await
    }

    async fn list_org_members(&self, org: &str, page: u32) -> Result<Page<ForgeUser>> {
        self.get_page(&format!("/orgs/{}/members", org), page).await
    }
}

/// Check if an error is a primary (429) or secondary (403 "rate limit") limit
pub fn is_rate_limit_error(e: &octocrab::Error) -> bool {
    match e {
        octocrab::Error::GitHub { source, .. } => {
            let status = source.status_code.as_u16();
            status == 429
                || (status == 403 && source.message.to_lowercase().contains("rate limit"))
        }
        _ => false,
    }
}

/// Resolve the token to authenticate with
///
/// Fails with [`BackupError::Config`] when no strategy yields a token.
pub fn resolve_token(config: &GitHubConfig) -> std::result::Result<String, BackupError> {
    let (strategy, token) =
        detect_authentication(config).map_err(|e| BackupError::Config(format!("{:#}", e)))?;
    info!("Using authentication strategy: {:?}", strategy);
    Ok(token)
}

/// Detect and obtain GitHub authentication
fn detect_authentication(config: &GitHubConfig) -> Result<(AuthStrategy, String)> {
    if let Some(token) = config.token.as_deref().filter(|t| !t.trim().is_empty()) {
        return Ok((AuthStrategy::Configured, token.trim().to_string()));
    }

    match config.auth_method.as_str() {
        "auto" => {
            // Environment token first, then GitHub CLI
            if let Ok(token) = try_environment_token() {
                Ok((AuthStrategy::EnvironmentToken, token))
            } else if let Ok(token) = try_github_cli() {
                Ok((AuthStrategy::GitHubCLI, token))
            } else {
                Err(anyhow!(
                    "No GitHub authentication found. Please either:\n\
                     1. Set github.token in the configuration file or pass --token\n\
                     2. Set GITHUB_TOKEN environment variable\n\
                     3. Install and authenticate GitHub CLI: gh auth login"
                ))
            }
        }
        "gh_cli" => {
            let token =
                try_github_cli().context("GitHub CLI authentication failed. Run: gh auth login")?;
            Ok((AuthStrategy::GitHubCLI, token))
        }
        "token" => {
            let token = try_environment_token()
                .context("GITHUB_TOKEN environment variable not found or invalid")?;
            Ok((AuthStrategy::EnvironmentToken, token))
        }
        other => Err(anyhow!("Unknown auth method: {}", other)),
    }
}

/// Try to get token from GitHub CLI
fn try_github_cli() -> Result<String> {
    debug!("Attempting GitHub CLI authentication");

    let token_output = Command::new("gh")
        .args(["auth", "token"])
        .output()
        .context("Failed to run GitHub CLI (gh)")?;

    if !token_output.status.success() {
        return Err(anyhow!(
            "Failed to retrieve token from GitHub CLI: {}",
            String::from_utf8_lossy(&token_output.stderr)
        ));
    }

    let token = String::from_utf8(token_output.stdout)
        .context("GitHub CLI token is not valid UTF-8")?
        .trim()
        .to_string();

    if token.is_empty() {
        return Err(anyhow!("GitHub CLI returned empty token"));
    }

    debug!("Successfully obtained token from GitHub CLI");
    Ok(token)
}

/// Try to get token from environment variable
fn try_environment_token() -> Result<String> {
    debug!("Attempting environment variable authentication");

    let token = env::var("GITHUB_TOKEN").context("GITHUB_TOKEN environment variable not set")?;
    let token = token.trim().to_string();

    if token.is_empty() {
        return Err(anyhow!("GITHUB_TOKEN is empty"));
    }

    if !token.starts_with("ghp_")
        && !token.starts_with("gho_")
        && !token.starts_with("ghs_")
        && !token.starts_with("github_pat_")
    {
        warn!("GITHUB_TOKEN doesn't look like a GitHub token (expected ghp_, gho_, ghs_ or github_pat_ prefix)");
    }

    debug!("Successfully found GITHUB_TOKEN environment variable");
    Ok(token)
}
