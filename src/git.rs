use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::fmt;
use std::path::Path;
use reqwest::Url;
use tokio::process::Command as AsyncCommand;
use tracing::debug;

/// HTTP basic credentials presented to the git server
#[derive(Clone)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

impl BasicAuth {
    /// GitHub accepts any non-empty username; the token travels as the password
    pub fn from_token(token: &str) -> Self {
        Self {
            username: token.to_string(),
            password: token.to_string(),
        }
    }

    fn is_empty(&self) -> bool {
        self.username.is_empty() && self.password.is_empty()
    }

    /// `Authorization` header value for these credentials
    fn header(&self) -> String {
        let encoded = STANDARD.encode(format!("{}:{}", self.username, self.password));
        format!("Authorization: Basic {}", encoded)
    }
}

impl fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicAuth")
            .field("username", &"<redacted>")
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Clones a remote repository into a local directory
#[async_trait]
pub trait GitCloner: Send + Sync {
    async fn clone_repository(
        &self,
        url: &str,
        destination: &Path,
        auth: &BasicAuth,
        recurse_submodules: bool,
    ) -> Result<()>;
}

/// Clones through the `git` command line client
#[derive(Debug, Clone, Default)]
pub struct GitClient;

impl GitClient {
    pub fn new() -> Self {
        Self
    }

    /// Report the installed git version, failing if git is unavailable
    pub async fn version() -> Result<String> {
        let output = AsyncCommand::new("git")
            .arg("--version")
            .output()
            .await
            .context("Failed to execute git. Is it installed and on PATH?")?;

        if !output.status.success() {
            return Err(anyhow!(
                "git --version failed: {}",
                String::from_utf8_lossy(&output.stderr)
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Build `git clone` for `url`
///
/// Credentials are handed to git through `GIT_CONFIG_*` variables scoped to the
/// URL's origin, so they never appear in the process arguments or in the
/// clone's `.git/config`.
fn clone_command(url: &str, destination: &Path, auth: &BasicAuth, recurse_submodules: bool) -> AsyncCommand {
    let mut command = AsyncCommand::new("git");
    command.arg("clone");
    if recurse_submodules {
        command.arg("--recurse-submodules");
    }
    command
        .arg("--")
        .arg(url)
        .arg(destination)
        .env("GIT_TERMINAL_PROMPT", "0")
        .kill_on_drop(true);

    if !auth.is_empty() {
        match credential_scope(url) {
            Some(scope) => {
                command
                    .env("GIT_CONFIG_COUNT", "1")
                    .env("GIT_CONFIG_KEY_0", format!("http.{}.extraHeader", scope))
                    .env("GIT_CONFIG_VALUE_0", auth.header());
            }
            None => debug!("Not sending credentials to non-HTTP remote {}", url),
        }
    }

    command
}

/// `scheme://host[:port]/` of an HTTP(S) remote
fn credential_scope(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return None;
    }
    Some(format!("{}/", parsed.origin().ascii_serialization()))
}

#[async_trait]
impl GitCloner for GitClient {
    async fn clone_repository(
        &self,
        url: &str,
        destination: &Path,
        auth: &BasicAuth,
        recurse_submodules: bool,
    ) -> Result<()> {
        debug!("Cloning {} -> {}", url, destination.display());

        let output = clone_command(url, destination, auth, recurse_submodules)
            .output()
            .await
            .context("Failed to execute git clone")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("Git clone failed: {}", stderr.trim()));
        }

        Ok(())
    }
}
