//! Common test utilities and in-memory collaborators for reposnap tests
#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reposnap::discovery::{ForgeApi, ForgeUser, Page, RepositoryRef, Target, PER_PAGE};
use reposnap::git::{BasicAuth, GitCloner};
use reposnap::notify::Notifier;
use reposnap::{BackupConfig, RunMode};

/// Repository as the forge would list it
pub fn repo(owner: &str, name: &str) -> RepositoryRef {
    RepositoryRef::new(
        &format!("{}/{}", owner, name),
        &format!("https://github.com/{}/{}.git", owner, name),
        owner,
    )
}

/// `owner/repo-1` through `owner/repo-{count}`
pub fn numbered_repos(owner: &str, count: usize) -> Vec<RepositoryRef> {
    (1..=count)
        .map(|i| repo(owner, &format!("repo-{}", i)))
        .collect()
}

pub fn backup_config(output: &Path, run_mode: RunMode) -> BackupConfig {
    BackupConfig {
        token: "ghp_test_token".to_string(),
        output: output.to_path_buf(),
        run_mode,
        ..BackupConfig::default()
    }
}

fn page_of<T: Clone>(items: &[T], page: u32) -> Page<T> {
    let per_page = PER_PAGE as usize;
    let start = (page.saturating_sub(1) as usize) * per_page;
    let end = (start + per_page).min(items.len());

    Page {
        items: items.get(start..end).map(<[T]>::to_vec).unwrap_or_default(),
        has_next: end < items.len(),
    }
}

/// In-memory forge serving paginated listings
pub struct FakeForge {
    authenticated: String,
    owned: HashMap<String, Vec<RepositoryRef>>,
    starred: HashMap<String, Vec<RepositoryRef>>,
    orgs: HashMap<String, Vec<String>>,
    failing_orgs: HashSet<String>,
    user_lookup_limit: Option<usize>,
    user_lookups: AtomicUsize,
    calls: Mutex<Vec<String>>,
}

impl FakeForge {
    pub fn new(authenticated: &str) -> Self {
        Self {
            authenticated: authenticated.to_string(),
            owned: HashMap::new(),
            starred: HashMap::new(),
            orgs: HashMap::new(),
            failing_orgs: HashSet::new(),
            user_lookup_limit: None,
            user_lookups: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_user(mut self, login: &str, repos: Vec<RepositoryRef>) -> Self {
        self.owned.insert(login.to_string(), repos);
        self
    }

    pub fn with_starred(mut self, login: &str, repos: Vec<RepositoryRef>) -> Self {
        self.owned.entry(login.to_string()).or_default();
        self.starred.insert(login.to_string(), repos);
        self
    }

    pub fn with_org(mut self, org: &str, members: &[&str]) -> Self {
        self.orgs
            .insert(org.to_string(), members.iter().map(|m| m.to_string()).collect());
        self
    }

    pub fn with_failing_org(mut self, org: &str) -> Self {
        self.failing_orgs.insert(org.to_string());
        self
    }

    /// Every user lookup after the first `limit` fails
    pub fn with_user_lookup_limit(mut self, limit: usize) -> Self {
        self.user_lookup_limit = Some(limit);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn user_lookups(&self) -> usize {
        self.user_lookups.load(Ordering::SeqCst)
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl ForgeApi for FakeForge {
    async fn get_user(&self, target: &Target) -> Result<ForgeUser> {
        self.record(format!("get_user:{}", target));

        let lookups = self.user_lookups.fetch_add(1, Ordering::SeqCst) + 1;
        if self.user_lookup_limit.is_some_and(|limit| lookups > limit) {
            return Err(anyhow!("502 Bad Gateway"));
        }

        let login = match target {
            Target::Authenticated => self.authenticated.clone(),
            Target::User(name) if self.owned.contains_key(name) => name.clone(),
            Target::User(_) => return Err(anyhow!("404 Not Found")),
        };

        Ok(ForgeUser { login })
    }

    async fn list_repositories_by_user(&self, login: &str, page: u32) -> Result<Page<RepositoryRef>> {
        self.record(format!("repos:{}:{}", login, page));
        let repos = self.owned.get(login).cloned().unwrap_or_default();
        Ok(page_of(&repos, page))
    }

    async fn list_repositories_for_authenticated_user(&self, page: u32) -> Result<Page<RepositoryRef>> {
        self.record(format!("own_repos:{}", page));
        let repos = self.owned.get(&self.authenticated).cloned().unwrap_or_default();
        Ok(page_of(&repos, page))
    }

    async fn list_starred(&self, login: &str, page: u32) -> Result<Page<RepositoryRef>> {
        self.record(format!("starred:{}:{}", login, page));
        let repos = self.starred.get(login).cloned().unwrap_or_default();
        Ok(page_of(&repos, page))
    }

    async fn list_org_members(&self, org: &str, page: u32) -> Result<Page<ForgeUser>> {
        self.record(format!("members:{}:{}", org, page));

        if self.failing_orgs.contains(org) {
            return Err(anyhow!("403 Forbidden"));
        }

        let members: Vec<ForgeUser> = self
            .orgs
            .get(org)
            .ok_or_else(|| anyhow!("404 Not Found"))?
            .iter()
            .map(|login| ForgeUser {
                login: login.clone(),
            })
            .collect();

        Ok(page_of(&members, page))
    }
}

/// Git stand-in that materializes a directory per clone
#[derive(Default)]
pub struct FakeGit {
    failing: HashSet<String>,
    delay: Option<Duration>,
    cloned: Mutex<Vec<String>>,
    usernames: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeGit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the clone of `full_name`
    pub fn failing(mut self, full_name: &str) -> Self {
        self.failing.insert(full_name.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn cloned(&self) -> Vec<String> {
        let mut cloned = self.cloned.lock().unwrap().clone();
        cloned.sort();
        cloned
    }

    pub fn usernames(&self) -> Vec<String> {
        self.usernames.lock().unwrap().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GitCloner for FakeGit {
    async fn clone_repository(
        &self,
        url: &str,
        destination: &Path,
        auth: &BasicAuth,
        _recurse_submodules: bool,
    ) -> Result<()> {
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        self.usernames.lock().unwrap().push(auth.username.clone());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let full_name = url
            .trim_start_matches("https://github.com/")
            .trim_end_matches(".git")
            .to_string();

        let result = if self.failing.contains(&full_name) {
            Err(anyhow!("Git clone failed: Authentication failed for '{}'", url))
        } else {
            std::fs::create_dir_all(destination.join(".git"))?;
            self.cloned.lock().unwrap().push(full_name);
            Ok(())
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Notifier that records every message
#[derive(Default)]
pub struct RecordingNotifier {
    fail: bool,
    messages: Mutex<Vec<(String, Vec<String>)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn messages(&self) -> Vec<(String, Vec<String>)> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, message: &str, tags: &[&str]) -> Result<()> {
        self.messages.lock().unwrap().push((
            message.to_string(),
            tags.iter().map(|t| t.to_string()).collect(),
        ));

        if self.fail {
            Err(anyhow!("connection refused"))
        } else {
            Ok(())
        }
    }
}

/// Cloneable in-memory writer used in place of stdout
#[derive(Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Assert that `text` contains every expected fragment
pub fn assert_contains_all(text: &str, expected: &[&str]) {
    for item in expected {
        assert!(
            text.contains(item),
            "Expected text to contain '{}', but it didn't. Text: {}",
            item,
            text
        );
    }
}
