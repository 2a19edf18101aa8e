//! Per-repository state: identity, branches, remotes, lifecycle status and
//! the pure state transitions the evaluator drives.
//!
//! A `Repository` lives for the whole process behind an `Arc`. Mutations
//! happen on the evaluation/refresh listeners and on the worker (status
//! transitions tied to execution); the read side (summaries, the UI) takes
//! the read lock. Methods that change observable state publish
//! `repository.updated` synchronously after releasing the lock, so
//! listeners observe the mutation strictly after it happened.

use std::{
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
};

use git::{GitOperationError, RepoSnapshot};
use once_cell::sync::Lazy;
use uuid::Uuid;

use crate::services::{
    events::{BRANCH_UPDATED, Event, EventBus, EventPayload, REPOSITORY_UPDATED},
    trace,
};

/// Opaque repository identity, unique per process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RepoId(String);

impl RepoId {
    fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RepoId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoStatus {
    /// Ready, idle.
    Available,
    /// Submitted, not yet executing.
    Pending,
    /// Tagged by the user for batch execution.
    Queued,
    /// Executing.
    Working,
    /// Awaiting user input (credential prompt).
    Paused,
    /// Recent operation succeeded.
    Success,
    /// Recent operation failed.
    Fail,
}

impl RepoStatus {
    pub fn is_ready(self) -> bool {
        matches!(
            self,
            RepoStatus::Available | RepoStatus::Paused | RepoStatus::Success
        )
    }
}

impl std::fmt::Display for RepoStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            RepoStatus::Available => "available",
            RepoStatus::Pending => "pending",
            RepoStatus::Queued => "queued",
            RepoStatus::Working => "working",
            RepoStatus::Paused => "paused",
            RepoStatus::Success => "success",
            RepoStatus::Fail => "fail",
        };
        write!(f, "{label}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteBranch {
    /// Fully qualified short name, e.g. `origin/main`.
    pub name: String,
    pub tip: Option<String>,
}

impl RemoteBranch {
    /// Split `origin/feature/x` into `("origin", "feature/x")`.
    pub fn split(&self) -> (&str, &str) {
        match self.name.split_once('/') {
            Some((remote, branch)) => (remote, branch),
            None => ("", self.name.as_str()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Remote {
    pub name: String,
    pub urls: Vec<String>,
    pub refspecs: Vec<String>,
    pub branches: Vec<RemoteBranch>,
}

impl Remote {
    pub fn first_url(&self) -> Option<&str> {
        self.urls.first().map(String::as_str)
    }
}

#[derive(Debug, Clone)]
pub struct Branch {
    pub name: String,
    /// 40-hex hash of the local tip.
    pub tip: String,
    pub upstream: Option<RemoteBranch>,
    /// Commits the upstream lacks. `None` when unknown.
    pub pushables: Option<u32>,
    /// Commits the local branch lacks. `None` when unknown.
    pub pullables: Option<u32>,
    pub clean: bool,
}

impl Branch {
    pub fn has_incoming_commits(&self) -> bool {
        matches!(self.pullables, Some(n) if n > 0)
    }
}

struct RepoState {
    status: RepoStatus,
    message: String,
    recoverable_error: bool,
    requires_credentials: bool,
    branches: Vec<Branch>,
    remotes: Vec<Remote>,
    current_branch: Option<usize>,
    current_remote: Option<usize>,
}

impl RepoState {
    fn from_snapshot(snapshot: RepoSnapshot) -> Self {
        let mut state = Self {
            status: RepoStatus::Available,
            message: String::new(),
            recoverable_error: false,
            requires_credentials: false,
            branches: Vec::new(),
            remotes: Vec::new(),
            current_branch: None,
            current_remote: None,
        };
        state.absorb_snapshot(snapshot);
        state
    }

    /// Replace branches and remotes from a fresh metadata read. Clean flags
    /// of same-named branches survive the swap; the evaluator recomputes
    /// them right after a refresh.
    fn absorb_snapshot(&mut self, snapshot: RepoSnapshot) {
        let previous_clean: Vec<(String, bool)> = self
            .branches
            .iter()
            .map(|b| (b.name.clone(), b.clean))
            .collect();

        self.branches = snapshot
            .branches
            .into_iter()
            .map(|b| Branch {
                clean: previous_clean
                    .iter()
                    .find(|(name, _)| *name == b.name)
                    .map(|(_, clean)| *clean)
                    .unwrap_or(false),
                name: b.name,
                tip: b.tip,
                upstream: b.upstream.map(|u| RemoteBranch {
                    name: u.name,
                    tip: u.tip,
                }),
                pushables: b.ahead,
                pullables: b.behind,
            })
            .collect();

        self.remotes = snapshot
            .remotes
            .into_iter()
            .map(|r| Remote {
                name: r.name,
                urls: r.urls,
                refspecs: r.refspecs,
                branches: r
                    .branches
                    .into_iter()
                    .map(|b| RemoteBranch {
                        name: b.name,
                        tip: b.tip,
                    })
                    .collect(),
            })
            .collect();

        self.current_branch = snapshot
            .head_branch
            .as_deref()
            .and_then(|head| self.branches.iter().position(|b| b.name == head));

        // The current remote follows the current branch's upstream and
        // falls back to `origin`, then to the first remote.
        let upstream_remote = self
            .current_branch
            .and_then(|i| self.branches[i].upstream.as_ref())
            .map(|u| u.split().0.to_string());
        self.current_remote = upstream_remote
            .and_then(|name| self.remotes.iter().position(|r| r.name == name))
            .or_else(|| self.remotes.iter().position(|r| r.name == "origin"))
            .or(if self.remotes.is_empty() { None } else { Some(0) });
    }
}

type RepositoryHook = Arc<dyn Fn(&Arc<Repository>) + Send + Sync>;

/// Startup-registered closures run at repository construction to wire
/// listeners. Registration happens once during process init; afterwards
/// this is read-only.
static REPOSITORY_HOOKS: Lazy<RwLock<Vec<RepositoryHook>>> = Lazy::new(|| RwLock::new(Vec::new()));

pub fn register_repository_hook(hook: RepositoryHook) {
    REPOSITORY_HOOKS
        .write()
        .unwrap_or_else(|p| p.into_inner())
        .push(hook);
}

fn run_repository_hooks(repo: &Arc<Repository>) {
    let hooks = REPOSITORY_HOOKS
        .read()
        .unwrap_or_else(|p| p.into_inner())
        .clone();
    for hook in hooks {
        hook(repo);
    }
}

pub struct Repository {
    id: RepoId,
    name: String,
    path: PathBuf,
    /// Last-observed modification time of the repository directory.
    modified: Option<std::time::SystemTime>,
    state: RwLock<RepoState>,
    bus: EventBus,
}

impl Repository {
    /// Build a repository from an already-read metadata snapshot and run
    /// the registered hooks. Must be called on a tokio runtime: the event
    /// bus spawns its queue consumers here.
    pub fn from_snapshot(path: &Path, snapshot: RepoSnapshot) -> Arc<Self> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let modified = std::fs::metadata(path).and_then(|m| m.modified()).ok();
        let repo = Arc::new(Self {
            id: RepoId::generate(),
            name,
            path: path.to_path_buf(),
            modified,
            state: RwLock::new(RepoState::from_snapshot(snapshot)),
            bus: EventBus::new(trace::is_enabled()),
        });
        run_repository_hooks(&repo);
        repo
    }

    pub fn id(&self) -> &RepoId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn modified(&self) -> Option<std::time::SystemTime> {
        self.modified
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, RepoState> {
        self.state.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, RepoState> {
        self.state.write().unwrap_or_else(|p| p.into_inner())
    }

    pub fn status(&self) -> RepoStatus {
        self.read().status
    }

    pub fn message(&self) -> String {
        self.read().message.clone()
    }

    pub fn recoverable_error(&self) -> bool {
        self.read().recoverable_error
    }

    pub fn requires_credentials(&self) -> bool {
        self.read().requires_credentials
    }

    pub fn branches(&self) -> Vec<Branch> {
        self.read().branches.clone()
    }

    pub fn remotes(&self) -> Vec<Remote> {
        self.read().remotes.clone()
    }

    pub fn current_branch(&self) -> Option<Branch> {
        let state = self.read();
        state.current_branch.map(|i| state.branches[i].clone())
    }

    pub fn current_remote(&self) -> Option<Remote> {
        let state = self.read();
        state.current_remote.map(|i| state.remotes[i].clone())
    }

    /// The observable triple the evaluator uses for change detection.
    pub fn visible_state(&self) -> (RepoStatus, String, Option<bool>) {
        let state = self.read();
        (
            state.status,
            state.message.clone(),
            state.current_branch.map(|i| state.branches[i].clean),
        )
    }

    pub async fn publish(
        self: &Arc<Self>,
        name: &'static str,
        payload: EventPayload,
    ) -> Result<(), crate::services::events::EventError> {
        let event = Event::new(self.clone(), payload);
        self.bus.publish(name, event).await
    }

    pub async fn publish_event(
        self: &Arc<Self>,
        name: &'static str,
        event: Event,
    ) -> Result<(), crate::services::events::EventError> {
        self.bus.publish(name, event).await
    }

    /// Assign a status. Clears the recoverable-error flag whenever the new
    /// status is not `Fail`, and emits `repository.updated` on change.
    pub async fn set_status(self: &Arc<Self>, status: RepoStatus) {
        self.set_status_with_message_inner(status, None).await;
    }

    pub async fn set_status_with_message(
        self: &Arc<Self>,
        status: RepoStatus,
        message: impl Into<String>,
    ) {
        self.set_status_with_message_inner(status, Some(message.into()))
            .await;
    }

    async fn set_status_with_message_inner(
        self: &Arc<Self>,
        status: RepoStatus,
        message: Option<String>,
    ) {
        let changed = {
            let mut state = self.write();
            let mut changed = false;
            if state.status != status {
                state.status = status;
                changed = true;
            }
            if status != RepoStatus::Fail {
                state.recoverable_error = false;
            }
            if let Some(message) = message {
                let message = message.trim().to_string();
                if state.message != message {
                    state.message = message;
                    changed = true;
                }
            }
            changed
        };
        if changed {
            self.emit_updated().await;
        }
    }

    /// A successful operation: clear both failure flags, then apply the
    /// evaluator's status/message verdict (`None` leaves a field alone).
    pub async fn apply_success(
        self: &Arc<Self>,
        status: Option<RepoStatus>,
        message: Option<String>,
    ) {
        let changed = {
            let mut state = self.write();
            let mut changed = state.recoverable_error || state.requires_credentials;
            state.recoverable_error = false;
            state.requires_credentials = false;
            if let Some(status) = status
                && state.status != status
            {
                state.status = status;
                changed = true;
            }
            if let Some(message) = message {
                let message = message.trim().to_string();
                if state.message != message {
                    state.message = message;
                    changed = true;
                }
            }
            changed
        };
        if changed {
            self.emit_updated().await;
        }
    }

    pub async fn mark_clean(self: &Arc<Self>) {
        self.set_clean(true).await;
    }

    pub async fn mark_dirty(self: &Arc<Self>) {
        self.set_clean(false).await;
    }

    async fn set_clean(self: &Arc<Self>, clean: bool) {
        let changed = {
            let mut state = self.write();
            match state.current_branch {
                Some(i) if state.branches[i].clean != clean => {
                    state.branches[i].clean = clean;
                    true
                }
                _ => false,
            }
        };
        if changed {
            self.emit_updated().await;
        }
    }

    pub async fn mark_critical_error(self: &Arc<Self>, message: &str) {
        self.mark_failure(message, false, false).await;
    }

    pub async fn mark_recoverable_error(self: &Arc<Self>, message: &str) {
        self.mark_failure(message, true, false).await;
    }

    pub async fn mark_requires_credentials(self: &Arc<Self>, message: &str) {
        self.mark_failure(message, false, true).await;
    }

    async fn mark_failure(
        self: &Arc<Self>,
        message: &str,
        recoverable: bool,
        requires_credentials: bool,
    ) {
        let message = {
            let trimmed = message.trim();
            if trimmed.is_empty() {
                "unknown error".to_string()
            } else {
                trimmed.to_string()
            }
        };
        let changed = {
            let mut state = self.write();
            let mut changed = false;
            if let Some(i) = state.current_branch
                && state.branches[i].clean
            {
                state.branches[i].clean = false;
                changed = true;
            }
            if state.status != RepoStatus::Fail {
                state.status = RepoStatus::Fail;
                changed = true;
            }
            if state.recoverable_error != recoverable {
                state.recoverable_error = recoverable;
                changed = true;
            }
            if state.requires_credentials != requires_credentials {
                state.requires_credentials = requires_credentials;
                changed = true;
            }
            if state.message != message {
                state.message = message;
                changed = true;
            }
            changed
        };
        if changed {
            self.emit_updated().await;
        }
    }

    /// Classify an operation error and apply the matching failure mark.
    pub async fn apply_operation_error(self: &Arc<Self>, err: &GitOperationError) {
        let message = normalized_error_message(err);
        if err.requires_credentials() {
            self.mark_requires_credentials(&message).await;
        } else if err.is_recoverable() {
            self.mark_recoverable_error(&message).await;
        } else {
            self.mark_critical_error(&message).await;
        }
    }

    /// Manual user action: drop the failure state and return to
    /// `Available` with an empty message.
    pub async fn clear(self: &Arc<Self>) {
        let changed = {
            let mut state = self.write();
            let changed = state.status != RepoStatus::Available
                || !state.message.is_empty()
                || state.recoverable_error
                || state.requires_credentials;
            state.status = RepoStatus::Available;
            state.message.clear();
            state.recoverable_error = false;
            state.requires_credentials = false;
            changed
        };
        if changed {
            self.emit_updated().await;
        }
    }

    /// Replace branch and remote metadata from a fresh read. Publishes
    /// `branch.updated`.
    pub async fn apply_snapshot(self: &Arc<Self>, snapshot: RepoSnapshot) {
        self.write().absorb_snapshot(snapshot);
        if let Err(err) = self.publish(BRANCH_UPDATED, EventPayload::Empty).await {
            tracing::debug!(repo = %self.name, %err, "branch.updated publish failed");
        }
    }

    async fn emit_updated(self: &Arc<Self>) {
        if let Err(err) = self.publish(REPOSITORY_UPDATED, EventPayload::Empty).await {
            tracing::debug!(repo = %self.name, %err, "repository.updated publish failed");
        }
    }
}

/// Normalise an error for display: collapse whitespace, strip the
/// `Unclassified: ` wrapper, default to "unknown error".
pub fn normalized_error_message(err: &GitOperationError) -> String {
    let raw = err.kind.to_string();
    let collapsed = utils::text::collapse_whitespace(&raw);
    let stripped = collapsed
        .strip_prefix("Unclassified: ")
        .unwrap_or(&collapsed)
        .to_string();
    if stripped.is_empty() {
        "unknown error".to_string()
    } else {
        stripped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use git::ErrorKind;

    fn bare_repo() -> Arc<Repository> {
        Repository::from_snapshot(Path::new("/tmp/example"), RepoSnapshot::default())
    }

    fn snapshot_with_branch(pullables: Option<u32>) -> RepoSnapshot {
        RepoSnapshot {
            head_branch: Some("main".into()),
            branches: vec![git::BranchInfo {
                name: "main".into(),
                tip: "a".repeat(40),
                upstream: Some(git::UpstreamInfo {
                    name: "origin/main".into(),
                    tip: Some("b".repeat(40)),
                }),
                ahead: Some(0),
                behind: pullables,
            }],
            remotes: vec![git::RemoteInfo {
                name: "origin".into(),
                urls: vec!["https://example.com/r.git".into()],
                refspecs: vec!["+refs/heads/*:refs/remotes/origin/*".into()],
                branches: vec![git::RemoteBranchInfo {
                    name: "origin/main".into(),
                    tip: Some("b".repeat(40)),
                }],
            }],
        }
    }

    #[tokio::test]
    async fn status_ready_bits() {
        for (status, ready) in [
            (RepoStatus::Available, true),
            (RepoStatus::Paused, true),
            (RepoStatus::Success, true),
            (RepoStatus::Pending, false),
            (RepoStatus::Queued, false),
            (RepoStatus::Working, false),
            (RepoStatus::Fail, false),
        ] {
            assert_eq!(status.is_ready(), ready, "{status}");
        }
    }

    #[tokio::test]
    async fn mark_requires_credentials_implies_fail_without_recoverable() {
        let repo = bare_repo();
        repo.mark_requires_credentials("auth required").await;
        assert_eq!(repo.status(), RepoStatus::Fail);
        assert!(repo.requires_credentials());
        assert!(!repo.recoverable_error());
        assert_eq!(repo.message(), "auth required");
    }

    #[tokio::test]
    async fn mark_failure_defaults_blank_message() {
        let repo = bare_repo();
        repo.mark_recoverable_error("   ").await;
        assert_eq!(repo.message(), "unknown error");
        assert!(repo.recoverable_error());
        assert_eq!(repo.status(), RepoStatus::Fail);
    }

    #[tokio::test]
    async fn success_clears_both_flags() {
        let repo = bare_repo();
        repo.mark_requires_credentials("auth").await;
        repo.apply_success(Some(RepoStatus::Available), Some(String::new()))
            .await;
        assert!(!repo.requires_credentials());
        assert!(!repo.recoverable_error());
        assert_eq!(repo.status(), RepoStatus::Available);
        assert_eq!(repo.message(), "");
    }

    #[tokio::test]
    async fn leaving_fail_clears_recoverable_flag() {
        let repo = bare_repo();
        repo.mark_recoverable_error("flaky network").await;
        assert!(repo.recoverable_error());
        repo.set_status(RepoStatus::Pending).await;
        assert!(!repo.recoverable_error());
    }

    #[tokio::test]
    async fn snapshot_wires_current_branch_and_remote() {
        let repo = Repository::from_snapshot(
            Path::new("/tmp/example"),
            snapshot_with_branch(Some(2)),
        );
        let branch = repo.current_branch().unwrap();
        assert_eq!(branch.name, "main");
        assert_eq!(branch.pullables, Some(2));
        assert!(branch.has_incoming_commits());
        assert_eq!(repo.current_remote().unwrap().name, "origin");
    }

    #[tokio::test]
    async fn clean_flag_survives_refresh_of_same_branch() {
        let repo = Repository::from_snapshot(
            Path::new("/tmp/example"),
            snapshot_with_branch(Some(0)),
        );
        repo.mark_clean().await;
        assert!(repo.current_branch().unwrap().clean);
        repo.apply_snapshot(snapshot_with_branch(Some(3))).await;
        let branch = repo.current_branch().unwrap();
        assert!(branch.clean, "clean flag should survive the swap");
        assert_eq!(branch.pullables, Some(3));
    }

    #[tokio::test]
    async fn normalized_message_strips_unclassified_prefix() {
        let err = GitOperationError::from_kind(ErrorKind::Unclassified(
            "fatal:   odd\nfailure".into(),
        ));
        assert_eq!(normalized_error_message(&err), "fatal: odd failure");
    }

    #[tokio::test]
    async fn has_incoming_commits_matches_pullables() {
        let mut branch = Branch {
            name: "main".into(),
            tip: "a".repeat(40),
            upstream: None,
            pushables: None,
            pullables: None,
            clean: false,
        };
        assert!(!branch.has_incoming_commits());
        branch.pullables = Some(0);
        assert!(!branch.has_incoming_commits());
        branch.pullables = Some(1);
        assert!(branch.has_incoming_commits());
    }
}
