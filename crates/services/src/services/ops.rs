//! Operation vocabulary shared by the queues, the worker and the
//! evaluator.

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use git::GitOperationError;
use strum_macros::{Display, EnumString};
use tokio_util::sync::CancellationToken;

use crate::services::repo::Repository;

/// The operations the pipeline knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum Operation {
    Fetch,
    Pull,
    Merge,
    Rebase,
    Push,
    Refresh,
    StateProbe,
}

/// Credentials supplied by the user for a retry.
#[derive(Clone)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// The record posted on the evaluation queue after any command completes.
///
/// `message: None` means "no opinion" and leaves the repository message
/// untouched; `Some("")` deliberately clears it. `recoverable_override`
/// unset means the evaluator consults the error taxonomy.
#[derive(Debug, Clone)]
pub struct OperationOutcome {
    pub operation: Operation,
    pub err: Option<GitOperationError>,
    pub message: Option<String>,
    pub suppress_success: bool,
    pub recoverable_override: Option<bool>,
}

impl OperationOutcome {
    pub fn success(operation: Operation) -> Self {
        Self {
            operation,
            err: None,
            message: None,
            suppress_success: false,
            recoverable_override: None,
        }
    }

    pub fn failure(operation: Operation, err: GitOperationError) -> Self {
        Self {
            operation,
            err: Some(err),
            message: None,
            suppress_success: false,
            recoverable_override: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn suppressing_success(mut self, suppress: bool) -> Self {
        self.suppress_success = suppress;
        self
    }
}

/// One-shot unit of work run by the git-command worker.
///
/// Implementations are immutable; a credential retry builds a new action
/// via [`CommandAction::with_credentials`] instead of mutating the old one.
#[async_trait]
pub trait CommandAction: Send + Sync {
    async fn run(&self, repo: Arc<Repository>, token: CancellationToken) -> OperationOutcome;

    /// Rebuild this action with credentials substituted. `None` when the
    /// operation does not carry credentials (merge).
    fn with_credentials(&self, credentials: &Credentials) -> Option<Arc<dyn CommandAction>> {
        let _ = credentials;
        None
    }
}

/// A request on a repository's command queue.
#[derive(Clone)]
pub struct GitCommandRequest {
    /// Debounce identity, conventionally `<op>:<repo-id>:<remote>`.
    pub key: String,
    pub operation: Operation,
    /// `Duration::ZERO` means "use the operation default".
    pub timeout: Duration,
    pub action: Arc<dyn CommandAction>,
}

impl fmt::Debug for GitCommandRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GitCommandRequest")
            .field("key", &self.key)
            .field("operation", &self.operation)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_strings_are_kebab_case() {
        assert_eq!(Operation::Fetch.to_string(), "fetch");
        assert_eq!(Operation::StateProbe.to_string(), "state-probe");
        assert_eq!("pull".parse::<Operation>().unwrap(), Operation::Pull);
        assert_eq!(
            "state-probe".parse::<Operation>().unwrap(),
            Operation::StateProbe
        );
    }

    #[test]
    fn credentials_debug_never_prints_password() {
        let creds = Credentials {
            user: "alice".into(),
            password: "hunter2".into(),
        };
        let rendered = format!("{creds:?}");
        assert!(rendered.contains("alice"));
        assert!(!rendered.contains("hunter2"));
    }
}
