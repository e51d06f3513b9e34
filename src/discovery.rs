//! Repository discovery
//!
//! This module lists what a backup run has to cover: the repositories owned
//! (and optionally starred) by each target user, and the members of any
//! organizations whose people should be backed up. The forge itself sits
//! behind the provider-agnostic [`ForgeApi`] trait so the listing logic can
//! run against GitHub, a compatible forge, or a test double.

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use tracing::{debug, info};

use crate::error::{BackupError, Result};

/// Number of items requested per listing page
pub const PER_PAGE: u32 = 100;

/// Whose repositories to list
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    /// The identity the credential belongs to
    Authenticated,
    /// A named user
    User(String),
}

impl Target {
    /// Build a target from a username, treating a blank name as the authenticated user
    pub fn from_username(username: &str) -> Self {
        let trimmed = username.trim();
        if trimmed.is_empty() {
            Self::Authenticated
        } else {
            Self::User(trimmed.to_string())
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Authenticated => f.write_str("the authenticated user"),
            Self::User(name) => f.write_str(name),
        }
    }
}

/// A forge user profile; only the login is used
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForgeUser {
    pub login: String,
}

/// Repository owner as embedded in the repository representation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryOwner {
    pub login: String,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A repository exactly as the forge returned it
///
/// The fields the backup needs are typed; every other field of the API
/// representation is carried through untouched so the JSON manifest matches
/// what the forge serves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryRef {
    /// `owner/name`, the deduplication key
    pub full_name: String,

    /// HTTPS clone URL
    pub clone_url: String,

    pub owner: RepositoryOwner,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl RepositoryRef {
    /// Build a reference carrying only the fields the backup needs
    pub fn new(full_name: &str, clone_url: &str, owner: &str) -> Self {
        Self {
            full_name: full_name.to_string(),
            clone_url: clone_url.to_string(),
            owner: RepositoryOwner {
                login: owner.to_string(),
                extra: serde_json::Map::new(),
            },
            extra: serde_json::Map::new(),
        }
    }
}

/// Repositories gathered for a single user
#[derive(Debug, Clone, Default)]
pub struct FetchResult {
    pub owned: Vec<RepositoryRef>,
    pub starred: Vec<RepositoryRef>,
}

impl FetchResult {
    /// Owned repositories followed by starred ones
    pub fn into_combined(self) -> Vec<RepositoryRef> {
        let mut combined = self.owned;
        combined.extend(self.starred);
        combined
    }
}

/// One page of a listing endpoint
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub has_next: bool,
}

/// Forge REST API surface used by discovery
///
/// Every listing call returns one page of at most [`PER_PAGE`] items; page
/// numbers start at 1. Implementations are expected to wait out rate limits
/// themselves.
#[async_trait]
pub trait ForgeApi: Send + Sync {
    /// Look up a user profile; `Target::Authenticated` returns the credential's own profile
    async fn get_user(&self, target: &Target) -> anyhow::Result<ForgeUser>;

    async fn list_repositories_by_user(
        &self,
        login: &str,
        page: u32,
    ) -> anyhow::Result<Page<RepositoryRef>>;

    async fn list_repositories_for_authenticated_user(
        &self,
        page: u32,
    ) -> anyhow::Result<Page<RepositoryRef>>;

    /// Repositories starred by `login`
    async fn list_starred(&self, login: &str, page: u32) -> anyhow::Result<Page<RepositoryRef>>;

    async fn list_org_members(&self, org: &str, page: u32) -> anyhow::Result<Page<ForgeUser>>;
}

/// Follow a paginated listing until the forge reports no further pages
async fn collect_pages<T, F, Fut>(mut fetch_page: F) -> anyhow::Result<Vec<T>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = anyhow::Result<Page<T>>>,
{
    let mut items = Vec::new();
    let mut page = 1u32;

    loop {
        let batch = fetch_page(page)
            .await
            .with_context(|| format!("page {}", page))?;

        items.extend(batch.items);

        if !batch.has_next {
            break;
        }
        page += 1;
    }

    Ok(items)
}

/// List the repositories of `target`, plus its starred repositories when requested
///
/// Any failing page aborts the whole listing; nothing fetched so far is returned.
pub async fn fetch_repositories(
    api: &dyn ForgeApi,
    target: &Target,
    include_starred: bool,
) -> Result<FetchResult> {
    let user = api
        .get_user(target)
        .await
        .map_err(|e| BackupError::fetch(format!("user profile of {}", target), e))?;
    let login = user.login;

    info!("Fetching repositories for user: {}", login);

    let owned = match target {
        Target::Authenticated => {
            collect_pages(|page| api.list_repositories_for_authenticated_user(page)).await
        }
        Target::User(_) => collect_pages(|page| api.list_repositories_by_user(&login, page)).await,
    }
    .map_err(|e| BackupError::fetch(format!("repositories of {}", login), e))?;

    debug!("Fetched {} repositories owned by {}", owned.len(), login);

    let starred = if include_starred {
        let starred = collect_pages(|page| api.list_starred(&login, page))
            .await
            .map_err(|e| BackupError::fetch(format!("starred repositories of {}", login), e))?;
        debug!("Fetched {} repositories starred by {}", starred.len(), login);
        starred
    } else {
        Vec::new()
    };

    Ok(FetchResult { owned, starred })
}

/// List the logins of every member of `org`
pub async fn list_org_members(api: &dyn ForgeApi, org: &str) -> Result<Vec<String>> {
    let members = collect_pages(|page| api.list_org_members(org, page))
        .await
        .map_err(|e| BackupError::fetch(format!("members of organization {}", org), e))?;

    info!("Found {} members in organization: {}", members.len(), org);
    Ok(members.into_iter().map(|member| member.login).collect())
}

/// Drop repositories whose full name was already seen, keeping first-seen order
pub fn dedup(repositories: Vec<RepositoryRef>) -> Vec<RepositoryRef> {
    let mut seen = HashSet::with_capacity(repositories.len());
    let mut unique = Vec::with_capacity(repositories.len());

    for repo in repositories {
        if seen.contains(&repo.full_name) {
            debug!("Found duplicate repository: {}", repo.full_name);
            continue;
        }
        seen.insert(repo.full_name.clone());
        unique.push(repo);
    }

    unique
}
