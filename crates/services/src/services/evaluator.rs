//! The state evaluator: consumes operation outcomes, drives repository
//! status and message, and reconciles "is this repository clean?" from
//! local index state, remote reachability and hypothetical fast-forward
//! viability.

use std::{collections::HashSet, sync::Arc, time::Duration};

use async_trait::async_trait;
use git::{GitDriver, GitOperationError, GitService};
use tokio_util::sync::CancellationToken;

use crate::services::{
    events::{
        EVALUATION_REQUESTED, Event, EventListener, EventPayload, GIT_COMMAND_REQUESTED,
        REPOSITORY_REFRESH_REQUESTED,
    },
    jobs,
    ops::{Operation, OperationOutcome},
    repo::{RepoStatus, Repository, normalized_error_message},
};

/// Timeout for the lightweight predicate queries the evaluator runs
/// (porcelain status, merge-tree, ls-remote).
const QUERY_TIMEOUT: Duration = Duration::from_secs(30);

pub struct StateEvaluator {
    driver: Arc<dyn GitDriver>,
}

#[async_trait]
impl EventListener for StateEvaluator {
    async fn handle(&self, event: Event) -> anyhow::Result<()> {
        let EventPayload::Outcome(outcome) = &event.payload else {
            return Ok(());
        };
        self.evaluate(event.repo.clone(), outcome.clone(), event.token.clone())
            .await;
        Ok(())
    }
}

impl StateEvaluator {
    pub fn new(driver: Arc<dyn GitDriver>) -> Self {
        Self { driver }
    }

    pub async fn evaluate(
        &self,
        repo: Arc<Repository>,
        outcome: OperationOutcome,
        token: CancellationToken,
    ) {
        let before = repo.visible_state();

        // A state-probe with no error and no message is the initial
        // request for a freshly discovered repository: verify the upstream
        // on the remote and fetch once. The probe's own outcome re-enters
        // this queue as a completion.
        if outcome.operation == Operation::StateProbe
            && outcome.err.is_none()
            && outcome.message.as_deref().unwrap_or("").is_empty()
        {
            repo.set_status_with_message(RepoStatus::Pending, "waiting")
                .await;
            if let Some(request) = jobs::build_probe_request(&repo, self.driver.clone()) {
                let event = Event::new(repo.clone(), EventPayload::Command(request))
                    .with_token(token.clone());
                if let Err(err) = repo.publish_event(GIT_COMMAND_REQUESTED, event).await {
                    tracing::warn!(repo = %repo.name(), %err, "state probe submission failed");
                }
                return;
            }
            // No complete upstream configured: fall through so the
            // cleanliness predicate records why.
        }

        if let Some(err) = &outcome.err {
            self.apply_failure(&repo, &outcome, err).await;
            return;
        }

        self.apply_success(&repo, &outcome).await;
        self.reconcile_cleanliness(&repo, &token).await;

        let after = repo.visible_state();
        if after != before
            && !matches!(outcome.operation, Operation::Refresh | Operation::StateProbe)
            && let Err(err) = repo
                .publish(REPOSITORY_REFRESH_REQUESTED, EventPayload::Empty)
                .await
        {
            tracing::warn!(repo = %repo.name(), %err, "refresh request failed");
        }
    }

    async fn apply_failure(
        &self,
        repo: &Arc<Repository>,
        outcome: &OperationOutcome,
        err: &GitOperationError,
    ) {
        let message = outcome
            .message
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| normalized_error_message(err));

        if err.requires_credentials() {
            repo.mark_requires_credentials(&message).await;
            return;
        }
        let recoverable = outcome
            .recoverable_override
            .unwrap_or_else(|| err.is_recoverable());
        if recoverable {
            repo.mark_recoverable_error(&message).await;
        } else {
            repo.mark_critical_error(&message).await;
        }
    }

    /// Per-operation status and message verdict for a successful outcome.
    async fn apply_success(&self, repo: &Arc<Repository>, outcome: &OperationOutcome) {
        let success_status = if outcome.suppress_success {
            RepoStatus::Available
        } else {
            RepoStatus::Success
        };
        let provided = outcome.message.clone();
        let or_default = |default: &str| {
            Some(
                provided
                    .as_deref()
                    .map(str::trim)
                    .filter(|m| !m.is_empty())
                    .unwrap_or(default)
                    .to_string(),
            )
        };

        let (status, message) = match outcome.operation {
            Operation::Fetch => (Some(RepoStatus::Available), provided.clone()),
            Operation::Pull => (Some(success_status), or_default("pull completed")),
            Operation::Merge => (Some(RepoStatus::Success), or_default("merge completed")),
            Operation::Rebase => (Some(RepoStatus::Success), or_default("rebase completed")),
            Operation::Push => (Some(success_status), or_default("push completed")),
            Operation::Refresh => (Some(RepoStatus::Available), provided.clone()),
            Operation::StateProbe => (None, provided.clone()),
        };
        repo.apply_success(status, message).await;
    }

    /// The cleanliness predicate (the output is the current branch's
    /// `clean` flag):
    ///
    /// - no upstream → recoverable failure;
    /// - incoming commits + clean tree → clean;
    /// - incoming commits + dirty tree → clean iff the hypothetical merge
    ///   is conflict-free and touches none of the locally changed files;
    /// - no incoming commits → clean iff the upstream still exists on the
    ///   remote.
    async fn reconcile_cleanliness(&self, repo: &Arc<Repository>, token: &CancellationToken) {
        let Some(branch) = repo.current_branch() else {
            repo.mark_recoverable_error("upstream not configured").await;
            return;
        };
        let Some(upstream) = branch.upstream.clone() else {
            repo.mark_recoverable_error("upstream not configured").await;
            return;
        };

        let worktree = match self.worktree_state(repo, token).await {
            Ok(worktree) => worktree,
            Err(err) => {
                repo.apply_operation_error(&err).await;
                return;
            }
        };

        if branch.has_incoming_commits() {
            let clean = if worktree.clean {
                true
            } else {
                match self
                    .fast_forward_viable(repo, &upstream.name, &worktree, token)
                    .await
                {
                    Ok(viable) => viable,
                    Err(err) => {
                        repo.apply_operation_error(&err).await;
                        return;
                    }
                }
            };
            if clean {
                repo.mark_clean().await;
            } else {
                repo.mark_dirty().await;
            }
            return;
        }

        // Nothing incoming: make sure the upstream has not vanished on the
        // remote in the meantime.
        let (remote, upstream_branch) = upstream.split();
        let args = vec![
            "ls-remote".to_string(),
            "--heads".to_string(),
            remote.to_string(),
            format!("refs/heads/{upstream_branch}"),
        ];
        match self
            .driver
            .run(repo.path(), &args, Some(QUERY_TIMEOUT), token)
            .await
        {
            Ok(output) if !output.trim().is_empty() => repo.mark_clean().await,
            Ok(_) => {
                repo.mark_recoverable_error(&format!(
                    "upstream {remote}/{upstream_branch} missing on remote"
                ))
                .await;
            }
            Err(err) => {
                repo.apply_operation_error(&GitOperationError::from_cli(&err))
                    .await;
            }
        }
    }

    async fn worktree_state(
        &self,
        repo: &Arc<Repository>,
        token: &CancellationToken,
    ) -> Result<WorktreeState, GitOperationError> {
        let args = vec!["status".to_string(), "--porcelain".to_string()];
        let output = self
            .driver
            .run(repo.path(), &args, Some(QUERY_TIMEOUT), token)
            .await
            .map_err(|e| GitOperationError::from_cli(&e))?;
        Ok(parse_worktree_status(&output))
    }

    /// Can the incoming commits land without touching local work?
    ///
    /// First a tree-level dry run (`merge-tree --write-tree`): any
    /// `CONFLICT` means no. Then the file-overlap check: a file both
    /// locally modified and changed by the merge means no.
    async fn fast_forward_viable(
        &self,
        repo: &Arc<Repository>,
        upstream: &str,
        worktree: &WorktreeState,
        token: &CancellationToken,
    ) -> Result<bool, GitOperationError> {
        if worktree.conflicted {
            return Ok(false);
        }

        let args = vec![
            "merge-tree".to_string(),
            "--write-tree".to_string(),
            "HEAD".to_string(),
            upstream.to_string(),
        ];
        match self
            .driver
            .run(repo.path(), &args, Some(QUERY_TIMEOUT), token)
            .await
        {
            Ok(output) => {
                if output.contains("CONFLICT") {
                    return Ok(false);
                }
            }
            // merge-tree exits 1 when the merge would conflict.
            Err(git::CliError::Failed {
                exit_code: Some(1), ..
            }) => return Ok(false),
            Err(err) => return Err(GitOperationError::from_cli(&err)),
        }

        let args = vec![
            "diff".to_string(),
            "--name-only".to_string(),
            "HEAD".to_string(),
            upstream.to_string(),
        ];
        let output = self
            .driver
            .run(repo.path(), &args, Some(QUERY_TIMEOUT), token)
            .await
            .map_err(|e| GitOperationError::from_cli(&e))?;
        let merge_files: HashSet<&str> = output
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect();
        let overlap = worktree
            .files
            .iter()
            .any(|f| merge_files.contains(f.as_str()));
        Ok(!overlap)
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
struct WorktreeState {
    clean: bool,
    conflicted: bool,
    files: Vec<String>,
}

/// Parse `git status --porcelain` (v1). Clean means no entries at all;
/// conflicted means any entry whose two-character code contains `U` or is
/// `DD`/`AA`.
fn parse_worktree_status(output: &str) -> WorktreeState {
    let mut state = WorktreeState {
        clean: output.trim().is_empty(),
        conflicted: false,
        files: Vec::new(),
    };
    for line in output.lines() {
        if line.len() < 4 {
            continue;
        }
        let code = &line[..2];
        if code.contains('U') || code == "DD" || code == "AA" {
            state.conflicted = true;
        }
        let path = line[3..].trim();
        // Rename entries read `old -> new`; the new path is the one that
        // can collide with incoming changes.
        let path = path.rsplit(" -> ").next().unwrap_or(path);
        let path = path.trim_matches('"');
        if !path.is_empty() {
            state.files.push(path.to_string());
        }
    }
    state
}

/// Listener for `repository.refresh.requested`: re-read local metadata and
/// hand the evaluator a refresh outcome.
pub struct RefreshListener {
    service: GitService,
}

impl RefreshListener {
    pub fn new(service: GitService) -> Self {
        Self { service }
    }
}

#[async_trait]
impl EventListener for RefreshListener {
    async fn handle(&self, event: Event) -> anyhow::Result<()> {
        let repo = event.repo.clone();
        let service = self.service.clone();
        let path = repo.path().to_path_buf();
        let snapshot = tokio::task::spawn_blocking(move || service.snapshot(&path)).await??;
        repo.apply_snapshot(snapshot).await;

        let outcome = OperationOutcome::success(Operation::Refresh);
        let evaluation =
            Event::new(repo.clone(), EventPayload::Outcome(outcome)).with_token(event.token);
        repo.publish_event(EVALUATION_REQUESTED, evaluation).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn porcelain_empty_is_clean() {
        let state = parse_worktree_status("");
        assert!(state.clean);
        assert!(!state.conflicted);
        assert!(state.files.is_empty());
    }

    #[test]
    fn porcelain_modified_and_untracked() {
        let state = parse_worktree_status(" M local.txt\n?? new.txt\n");
        assert!(!state.clean);
        assert!(!state.conflicted);
        assert_eq!(state.files, vec!["local.txt", "new.txt"]);
    }

    #[test]
    fn porcelain_conflict_codes() {
        for code in ["UU", "AU", "UD", "DD", "AA"] {
            let state = parse_worktree_status(&format!("{code} conflict.txt\n"));
            assert!(state.conflicted, "{code} must flag a conflict");
        }
        let state = parse_worktree_status("MM staged.txt\n");
        assert!(!state.conflicted);
    }

    #[test]
    fn porcelain_rename_keeps_new_path() {
        let state = parse_worktree_status("R  old.txt -> new.txt\n");
        assert_eq!(state.files, vec!["new.txt"]);
    }
}
