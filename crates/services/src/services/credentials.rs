//! Credential recovery: when an operation failed because credentials were
//! required, the orchestrator parks the repository here together with the
//! original request. Supplying credentials resubmits a clone of the
//! request with credentials substituted; dismissing the prompt fails the
//! repository.

use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::services::{
    events::{EventError, EventPayload, GIT_COMMAND_REQUESTED},
    ops::{Credentials, GitCommandRequest},
    repo::{RepoId, RepoStatus, Repository},
};

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("no credential prompt pending for this repository")]
    NoPrompt,
    #[error("operation does not carry credentials")]
    Unsupported,
    #[error(transparent)]
    Submission(#[from] EventError),
}

struct PendingPrompt {
    repo: Arc<Repository>,
    request: GitCommandRequest,
}

/// Repositories suspended on a credential prompt, oldest first.
#[derive(Default)]
pub struct CredentialRecovery {
    pending: Mutex<Vec<PendingPrompt>>,
}

impl CredentialRecovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a repository behind a credential prompt. The repository shows
    /// as paused until the user answers or dismisses.
    pub async fn suspend(&self, repo: Arc<Repository>, request: GitCommandRequest) {
        repo.set_status_with_message(RepoStatus::Paused, "awaiting credentials")
            .await;
        self.pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(PendingPrompt { repo, request });
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Resubmit the original request with credentials substituted. The
    /// clone keeps the operation tag, key, timeout and options; only the
    /// credentials change.
    pub async fn resume(
        &self,
        repo_id: &RepoId,
        credentials: &Credentials,
    ) -> Result<(), CredentialError> {
        let prompt = self.take(repo_id).ok_or(CredentialError::NoPrompt)?;
        let Some(action) = prompt.request.action.with_credentials(credentials) else {
            // Operations without credentials (merge) should never have
            // reached this path; restore the prompt for the caller.
            let repo = prompt.repo.clone();
            self.pending
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .push(prompt);
            tracing::warn!(repo = %repo.name(), "credential retry on credential-less operation");
            return Err(CredentialError::Unsupported);
        };

        let request = GitCommandRequest {
            key: prompt.request.key.clone(),
            operation: prompt.request.operation,
            timeout: prompt.request.timeout,
            action,
        };
        prompt
            .repo
            .set_status_with_message(RepoStatus::Pending, "retrying with credentials")
            .await;
        prompt
            .repo
            .publish(GIT_COMMAND_REQUESTED, EventPayload::Command(request))
            .await?;
        Ok(())
    }

    /// The user declined the prompt.
    pub async fn dismiss(&self, repo_id: &RepoId) -> Result<(), CredentialError> {
        let prompt = self.take(repo_id).ok_or(CredentialError::NoPrompt)?;
        prompt
            .repo
            .set_status_with_message(RepoStatus::Fail, "credentials prompt dismissed")
            .await;
        Ok(())
    }

    fn take(&self, repo_id: &RepoId) -> Option<PendingPrompt> {
        let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
        let index = pending.iter().position(|p| p.repo.id() == repo_id)?;
        Some(pending.remove(index))
    }
}
