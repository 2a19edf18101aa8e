//! The git-command worker: consumes command requests, runs them under the
//! process-wide concurrency bound, and posts the outcome for evaluation.

use std::time::Duration;

use async_trait::async_trait;
use git::{CliError, GitOperationError};
use once_cell::sync::Lazy;
use tokio::sync::Semaphore;

use crate::services::{
    events::{EVALUATION_REQUESTED, Event, EventListener, EventPayload},
    ops::{GitCommandRequest, Operation},
    repo::RepoStatus,
};

/// Upper bound on concurrently executing git commands across all
/// repositories, whatever the core count.
pub const MAX_CONCURRENT_COMMANDS: usize = 10;

/// Network-facing operations get a generous default; local ones less.
pub const DEFAULT_NETWORK_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_LOCAL_TIMEOUT: Duration = Duration::from_secs(30);

static COMMAND_SEMAPHORE: Lazy<Semaphore> = Lazy::new(|| Semaphore::new(max_concurrency()));

fn max_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(MAX_CONCURRENT_COMMANDS)
}

/// The semaphore gating every command-queue dispatch in the process.
pub fn command_semaphore() -> &'static Semaphore {
    &COMMAND_SEMAPHORE
}

pub fn effective_timeout(request: &GitCommandRequest) -> Duration {
    if !request.timeout.is_zero() {
        return request.timeout;
    }
    match request.operation {
        Operation::Fetch
        | Operation::Pull
        | Operation::Rebase
        | Operation::Push
        | Operation::StateProbe => DEFAULT_NETWORK_TIMEOUT,
        Operation::Merge | Operation::Refresh => DEFAULT_LOCAL_TIMEOUT,
    }
}

/// Listener attached to every repository's command queue at construction.
pub struct GitCommandWorker;

#[async_trait]
impl EventListener for GitCommandWorker {
    async fn handle(&self, event: Event) -> anyhow::Result<()> {
        let EventPayload::Command(request) = &event.payload else {
            return Ok(());
        };
        let repo = event.repo.clone();
        repo.set_status(RepoStatus::Working).await;

        // The action gets a child token so a timeout can kill the running
        // subprocess (whole process group) without cancelling the event.
        let deadline = effective_timeout(request);
        let child = event.token.child_token();
        let timer = {
            let child = child.clone();
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                child.cancel();
            })
        };
        let mut outcome = request.action.run(repo.clone(), child.clone()).await;
        timer.abort();

        let timed_out = child.is_cancelled() && !event.token.is_cancelled();
        if timed_out && outcome.err.is_some() {
            outcome.err = Some(GitOperationError::from_cli(&CliError::DeadlineExceeded(
                deadline,
            )));
        }
        // The event's own context fired: record it unless the action
        // already produced a more specific error.
        if event.token.is_cancelled() && outcome.err.is_none() {
            outcome.err = Some(GitOperationError::from_cli(&CliError::Canceled));
        }

        let evaluation = Event::new(repo.clone(), EventPayload::Outcome(outcome))
            .with_token(event.token.clone());
        repo.publish_event(EVALUATION_REQUESTED, evaluation).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::ops::OperationOutcome;
    use std::{sync::Arc, time::Duration};

    fn request(operation: Operation, timeout: Duration) -> GitCommandRequest {
        struct Noop;
        #[async_trait]
        impl crate::services::ops::CommandAction for Noop {
            async fn run(
                &self,
                _repo: Arc<crate::services::repo::Repository>,
                _token: tokio_util::sync::CancellationToken,
            ) -> OperationOutcome {
                OperationOutcome::success(Operation::Fetch)
            }
        }
        GitCommandRequest {
            key: "k".into(),
            operation,
            timeout,
            action: Arc::new(Noop),
        }
    }

    #[test]
    fn zero_timeout_uses_operation_default() {
        let fetch = request(Operation::Fetch, Duration::ZERO);
        assert_eq!(effective_timeout(&fetch), DEFAULT_NETWORK_TIMEOUT);
        let merge = request(Operation::Merge, Duration::ZERO);
        assert_eq!(effective_timeout(&merge), DEFAULT_LOCAL_TIMEOUT);
    }

    #[test]
    fn explicit_timeout_wins() {
        let fetch = request(Operation::Fetch, Duration::from_secs(5));
        assert_eq!(effective_timeout(&fetch), Duration::from_secs(5));
    }

    #[test]
    fn concurrency_bound_never_exceeds_ten() {
        assert!(max_concurrency() >= 1);
        assert!(max_concurrency() <= MAX_CONCURRENT_COMMANDS);
        assert_eq!(command_semaphore().available_permits(), max_concurrency());
    }
}
