//! reposnap - GitHub Account Backups
//!
//! reposnap lists every repository belonging to a set of GitHub users (and
//! the members of organizations), then clones them, writes the list to a JSON
//! manifest, or prints it. Backups can run once or on a schedule that keeps a
//! bounded number of timestamped snapshot directories.
//!
//! ## Core Features
//!
//! - **Discovery**: Paginated listing of owned and starred repositories
//! - **Organization Expansion**: Back up every member of an organization
//! - **Concurrent Cloning**: One clone task per repository, optionally capped
//! - **Rolling Snapshots**: Timestamped directories with oldest-first pruning
//! - **Notifications**: ntfy push after each run
//!
//! ## Modules
//!
//! - [`config`]: Configuration management and parsing
//! - [`github`]: GitHub API integration and authentication
//! - [`discovery`]: Repository fetching, organization expansion, deduplication
//! - [`backup`]: The backup executor
//! - [`rotation`]: Snapshot directory rotation
//! - [`scheduler`]: One-shot and interval scheduling

pub mod backup;
pub mod config;
pub mod discovery;
pub mod error;
pub mod git;
pub mod github;
pub mod notify;
pub mod rotation;
pub mod scheduler;

pub use backup::{BackupConfig, BackupExecutor, BackupReport, CloneOptions, RunMode};
pub use config::Config;
pub use discovery::{ForgeApi, RepositoryRef, Target};
pub use error::{BackupError, CloneFailure, Result};
pub use git::{BasicAuth, GitClient, GitCloner};
pub use github::GitHubApi;
pub use notify::{Notifier, NtfyNotifier};
pub use scheduler::start_backup;
