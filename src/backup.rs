//! Backup Executor - Runs one complete backup pass
//!
//! A pass expands organizations into their members, lists every target
//! user's repositories (owned, then starred), deduplicates them by full name
//! and then either clones them concurrently, writes them to a JSON manifest,
//! or prints that manifest.

use futures::stream::{FuturesUnordered, StreamExt};
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::discovery::{self, ForgeApi, RepositoryRef, Target};
use crate::error::{BackupError, CloneFailure, Result};
use crate::git::{BasicAuth, GitCloner};
use crate::notify::{Notifier, NtfyNotifier};

/// Manifest file name used when the output isn't a `.json` path
pub const MANIFEST_FILE_NAME: &str = "repositories.json";

/// What a backup pass does with the repositories it found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    /// Clone every repository under the output directory
    #[default]
    Clone,
    /// Write the repository list as JSON
    Fetch,
    /// Print the repository list as JSON without touching the filesystem
    DryRun,
}

impl FromStr for RunMode {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "clone" => Ok(Self::Clone),
            "fetch" => Ok(Self::Fetch),
            "dry-run" => Ok(Self::DryRun),
            other => Err(BackupError::InvalidRunType(other.to_string())),
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Clone => "clone",
            Self::Fetch => "fetch",
            Self::DryRun => "dry-run",
        })
    }
}

/// Clone phase tuning
#[derive(Debug, Clone, Default)]
pub struct CloneOptions {
    pub recurse_submodules: bool,
    /// Concurrent clone cap; `None` spawns one task per repository at once
    pub max_parallel: Option<usize>,
    /// Per-repository time limit
    pub timeout: Option<Duration>,
}

/// Settings for a single backup pass
#[derive(Clone)]
pub struct BackupConfig {
    /// Users to back up; empty (with no organizations) means the authenticated user
    pub usernames: Vec<String>,
    pub organizations: Vec<String>,
    pub include_starred: bool,
    pub token: String,
    pub output: PathBuf,
    pub run_mode: RunMode,
    pub notify_url: Option<String>,
    /// Whether an undeliverable notification fails an otherwise successful run
    pub fail_on_notify_error: bool,
    pub clone: CloneOptions,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            usernames: Vec::new(),
            organizations: Vec::new(),
            include_starred: false,
            token: String::new(),
            output: PathBuf::from("backup"),
            run_mode: RunMode::Clone,
            notify_url: None,
            fail_on_notify_error: true,
            clone: CloneOptions::default(),
        }
    }
}

impl fmt::Debug for BackupConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackupConfig")
            .field("usernames", &self.usernames)
            .field("organizations", &self.organizations)
            .field("include_starred", &self.include_starred)
            .field("token", &"<redacted>")
            .field("output", &self.output)
            .field("run_mode", &self.run_mode)
            .field("notify_url", &self.notify_url)
            .field("fail_on_notify_error", &self.fail_on_notify_error)
            .field("clone", &self.clone)
            .finish()
    }
}

/// Outcome of a successful backup pass
#[derive(Debug, Clone)]
pub struct BackupReport {
    pub mode: RunMode,
    /// Unique repositories found
    pub repositories: usize,
    pub cloned: usize,
    pub manifest_path: Option<PathBuf>,
    pub duration: Duration,
}

impl BackupReport {
    fn summary(&self) -> String {
        match self.mode {
            RunMode::Clone => format!(
                "Backup completed: cloned {} of {} repositories in {:.1}s",
                self.cloned,
                self.repositories,
                self.duration.as_secs_f64()
            ),
            RunMode::Fetch => format!(
                "Backup completed: listed {} repositories in {}",
                self.repositories,
                self.manifest_path
                    .as_deref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default()
            ),
            RunMode::DryRun => format!(
                "Dry run completed: found {} repositories",
                self.repositories
            ),
        }
    }
}

type SharedWriter = Arc<Mutex<Box<dyn Write + Send>>>;

/// Runs backup passes against a forge and a git transport
pub struct BackupExecutor {
    forge: Arc<dyn ForgeApi>,
    git: Arc<dyn GitCloner>,
    notifier: Option<Arc<dyn Notifier>>,
    stdout: SharedWriter,
}

impl BackupExecutor {
    pub fn new(forge: Arc<dyn ForgeApi>, git: Arc<dyn GitCloner>) -> Self {
        Self {
            forge,
            git,
            notifier: None,
            stdout: Arc::new(Mutex::new(Box::new(std::io::stdout()) as Box<dyn Write + Send>)),
        }
    }

    /// Use this notifier instead of building one from `BackupConfig::notify_url`
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Redirect dry-run output
    pub fn with_stdout(mut self, writer: impl Write + Send + 'static) -> Self {
        self.stdout = Arc::new(Mutex::new(Box::new(writer) as Box<dyn Write + Send>));
        self
    }

    /// Run one backup pass and send the completion notification if configured
    pub async fn run(&self, config: &BackupConfig) -> Result<BackupReport> {
        let start = Instant::now();
        let result = self.run_pass(config, start).await;

        match self.notifier_for(config) {
            Some(notifier) => Self::notify(notifier.as_ref(), config, result).await,
            None => result,
        }
    }

    async fn run_pass(&self, config: &BackupConfig, start: Instant) -> Result<BackupReport> {
        info!("Starting {} backup into {}", config.run_mode, config.output.display());

        let repositories = self.discover(config).await?;
        info!("Deduplicated repositories: {}", repositories.len());

        let mut report = BackupReport {
            mode: config.run_mode,
            repositories: repositories.len(),
            cloned: 0,
            manifest_path: None,
            duration: Duration::ZERO,
        };

        match config.run_mode {
            RunMode::Clone => {
                report.cloned = self.clone_all(config, &repositories).await?;
            }
            RunMode::Fetch => {
                report.manifest_path = Some(write_manifest(&config.output, &repositories).await?);
            }
            RunMode::DryRun => {
                self.print_manifest(&repositories)?;
            }
        }

        report.duration = start.elapsed();
        info!("{}", report.summary());
        Ok(report)
    }

    /// Expand organizations, list every target and deduplicate
    async fn discover(&self, config: &BackupConfig) -> Result<Vec<RepositoryRef>> {
        let forge = self.forge.as_ref();

        let mut members = Vec::new();
        for org in &config.organizations {
            members.extend(discovery::list_org_members(forge, org).await?);
        }

        let targets = collect_targets(&members, &config.usernames);
        debug!("Backup targets: {:?}", targets);

        let mut repositories = Vec::new();
        for target in &targets {
            let fetched = discovery::fetch_repositories(forge, target, config.include_starred).await?;
            repositories.extend(fetched.into_combined());
        }

        info!("Fetched {} repositories for {} targets", repositories.len(), targets.len());
        Ok(discovery::dedup(repositories))
    }

    /// Clone every repository concurrently, returning how many succeeded
    ///
    /// A failing clone doesn't stop its siblings; all failures are reported
    /// together once every task has finished.
    async fn clone_all(&self, config: &BackupConfig, repositories: &[RepositoryRef]) -> Result<usize> {
        let total = repositories.len();
        let completed = Arc::new(AtomicUsize::new(0));
        let semaphore = config.clone.max_parallel.map(|n| Arc::new(Semaphore::new(n.max(1))));
        let auth = BasicAuth::from_token(&config.token);

        info!(
            "Cloning {} repositories{}",
            total,
            config
                .clone
                .max_parallel
                .map(|n| format!(" with at most {} in parallel", n))
                .unwrap_or_default()
        );

        let mut tasks = FuturesUnordered::new();

        for repo in repositories {
            let full_name = repo.full_name.clone();
            let job = CloneJob {
                git: Arc::clone(&self.git),
                url: repo.clone_url.clone(),
                destination: config.output.join(&repo.full_name),
                auth: auth.clone(),
                recurse_submodules: config.clone.recurse_submodules,
                timeout: config.clone.timeout,
            };
            let permits = semaphore.clone();
            let completed = Arc::clone(&completed);
            let name = full_name.clone();

            let handle = tokio::spawn(async move {
                let outcome = job.run(permits).await;
                let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                match &outcome {
                    Ok(()) => info!("Cloned repository {} ({}/{})", name, done, total),
                    Err(e) => warn!("Failed to clone {} ({}/{}): {:#}", name, done, total, e),
                }
                outcome
            });

            tasks.push(async move { (full_name, handle.await) });
        }

        let mut failures = Vec::new();
        while let Some((full_name, joined)) = tasks.next().await {
            let error = match joined {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => format!("{:#}", e),
                Err(e) => format!("clone task aborted: {}", e),
            };
            failures.push(CloneFailure { full_name, error });
        }

        if failures.is_empty() {
            Ok(total)
        } else {
            error!("{} of {} repositories failed to clone", failures.len(), total);
            failures.sort_by(|a, b| a.full_name.cmp(&b.full_name));
            Err(BackupError::Clone { total, failures })
        }
    }

    fn print_manifest(&self, repositories: &[RepositoryRef]) -> Result<()> {
        let json = serde_json::to_string_pretty(repositories)?;
        info!("Dry run - printing repositories to stdout");

        let mut stdout = self.stdout.lock().unwrap_or_else(|e| e.into_inner());
        writeln!(stdout, "{}", json)
            .and_then(|_| stdout.flush())
            .map_err(|e| BackupError::io("Failed to write repository list", "<stdout>", e))?;

        Ok(())
    }

    fn notifier_for(&self, config: &BackupConfig) -> Option<Arc<dyn Notifier>> {
        self.notifier.clone().or_else(|| {
            config
                .notify_url
                .as_ref()
                .map(|url| Arc::new(NtfyNotifier::new(url.clone())) as Arc<dyn Notifier>)
        })
    }

    async fn notify(
        notifier: &dyn Notifier,
        config: &BackupConfig,
        result: Result<BackupReport>,
    ) -> Result<BackupReport> {
        let sent = match &result {
            Ok(report) => notifier.notify(&report.summary(), &["white_check_mark"]).await,
            Err(e) => notifier.notify(&format!("Backup failed: {}", e.full_message()), &["warning"]).await,
        };

        match (result, sent) {
            (result, Ok(())) => {
                debug!("Notification sent");
                result
            }
            (Ok(_), Err(e)) if config.fail_on_notify_error => Err(BackupError::Notify { source: e }),
            (result, Err(e)) => {
                warn!("Failed to send notification: {:#}", e);
                result
            }
        }
    }
}

/// One repository's clone, owned so it can move into a spawned task
struct CloneJob {
    git: Arc<dyn GitCloner>,
    url: String,
    destination: PathBuf,
    auth: BasicAuth,
    recurse_submodules: bool,
    timeout: Option<Duration>,
}

impl CloneJob {
    async fn run(self, permits: Option<Arc<Semaphore>>) -> anyhow::Result<()> {
        let _permit = match permits {
            Some(semaphore) => Some(semaphore.acquire_owned().await?),
            None => None,
        };

        if let Some(parent) = self.destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to create {}: {}", parent.display(), e))?;
        }

        let clone = self.git.clone_repository(
            &self.url,
            &self.destination,
            &self.auth,
            self.recurse_submodules,
        );

        match self.timeout {
            Some(limit) => timeout(limit, clone).await.map_err(|_| {
                anyhow::anyhow!("Operation timed out after {:?}", limit)
            })?,
            None => clone.await,
        }
    }
}

/// Organization members followed by explicit usernames, without repeats
///
/// With nothing to expand the authenticated user is the only target.
pub fn collect_targets(org_members: &[String], usernames: &[String]) -> Vec<Target> {
    let mut targets: Vec<Target> = Vec::new();

    for name in org_members.iter().chain(usernames) {
        let target = Target::from_username(name);
        if !targets.contains(&target) {
            targets.push(target);
        }
    }

    if targets.is_empty() {
        targets.push(Target::Authenticated);
    }

    targets
}

/// Where fetch mode writes the repository list
pub fn manifest_path(output: &Path) -> PathBuf {
    if output.extension().is_some_and(|ext| ext == "json") {
        output.to_path_buf()
    } else {
        output.join(MANIFEST_FILE_NAME)
    }
}

async fn write_manifest(output: &Path, repositories: &[RepositoryRef]) -> Result<PathBuf> {
    let path = manifest_path(output);
    if path != output {
        warn!(
            "Output is not a JSON file, writing the repository list to {}",
            path.display()
        );
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| BackupError::io("Failed to create output directory", parent, e))?;
    }

    let mut json = serde_json::to_vec_pretty(repositories)?;
    json.push(b'\n');

    tokio::fs::write(&path, json)
        .await
        .map_err(|e| BackupError::io("Failed to write repository list", &path, e))?;

    info!("Fetched and saved list of repositories to {}", path.display());
    Ok(path)
}
