//! Classification of raw git output into a closed set of error kinds.
//!
//! The git CLI reports almost everything through free-form stderr text, so
//! the only portable way to react differently to "auth needed" vs "remote
//! gone" vs "network flake" is substring matching on the combined output.
//! Matching is case-insensitive and ordered by specificity: authentication
//! patterns first, then merge/content conflicts, then the network classes.
//! The driver forces `LC_ALL=C` so these patterns are stable.

use thiserror::Error;
use utils::text::first_line;

use crate::cli::CliError;

/// Closed set of git failure kinds.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ErrorKind {
    #[error("git command failed")]
    GitCommandFailed,
    #[error("authentication required")]
    AuthenticationRequired,
    #[error("authorization failed")]
    AuthorizationFailed,
    #[error("invalid authentication method")]
    InvalidAuthMethod,
    #[error("already up to date")]
    AlreadyUpToDate,
    #[error("could not find remote ref")]
    CouldNotFindRemoteRef,
    #[error("merge aborted, commit your local changes first")]
    MergeAbortedTryCommit,
    #[error("upstream not set")]
    UpstreamNotSet,
    #[error("remote not found")]
    RemoteNotFound,
    #[error("conflict after merge")]
    ConflictAfterMerge,
    #[error("unmerged files present")]
    UnmergedFiles,
    #[error("reference broken")]
    ReferenceBroken,
    #[error("permission denied")]
    PermissionDenied,
    #[error("local changes would be overwritten by merge")]
    OverwrittenByMerge,
    #[error("user name and email not configured")]
    UserEmailNotSet,
    #[error("credential prompt detected")]
    CredentialPromptDetected,
    #[error("network timeout")]
    NetworkTimeout,
    #[error("network unreachable")]
    NetworkUnreachable,
    #[error("dns resolution failed")]
    DnsError,
    #[error("ssl error")]
    SslError,
    #[error("Unclassified: {0}")]
    Unclassified(String),
}

/// Ordered pattern table. The first matching row wins, so rows must go from
/// most to least specific within each class.
const PATTERNS: &[(&str, ErrorKind)] = &[
    // authentication / authorization
    ("terminal prompts disabled", ErrorKind::AuthenticationRequired),
    ("could not read username", ErrorKind::AuthenticationRequired),
    ("could not read password", ErrorKind::AuthenticationRequired),
    ("invalid username or password", ErrorKind::AuthenticationRequired),
    ("authentication failed", ErrorKind::AuthenticationRequired),
    ("authentication required", ErrorKind::AuthenticationRequired),
    ("authorization failed", ErrorKind::AuthorizationFailed),
    ("403 forbidden", ErrorKind::AuthorizationFailed),
    (
        "does not support password authentication",
        ErrorKind::InvalidAuthMethod,
    ),
    ("invalid auth method", ErrorKind::InvalidAuthMethod),
    ("permission denied", ErrorKind::PermissionDenied),
    // merge / working-tree content
    ("already up to date", ErrorKind::AlreadyUpToDate),
    ("already up-to-date", ErrorKind::AlreadyUpToDate),
    ("couldn't find remote ref", ErrorKind::CouldNotFindRemoteRef),
    ("could not find remote ref", ErrorKind::CouldNotFindRemoteRef),
    (
        "would be overwritten by merge",
        ErrorKind::OverwrittenByMerge,
    ),
    (
        "would be overwritten by checkout",
        ErrorKind::OverwrittenByMerge,
    ),
    (
        "commit your changes or stash them",
        ErrorKind::MergeAbortedTryCommit,
    ),
    ("merge aborted", ErrorKind::MergeAbortedTryCommit),
    ("you have unmerged files", ErrorKind::UnmergedFiles),
    ("not concluded your merge", ErrorKind::UnmergedFiles),
    ("unmerged files", ErrorKind::UnmergedFiles),
    ("automatic merge failed", ErrorKind::ConflictAfterMerge),
    ("fix conflicts and then commit", ErrorKind::ConflictAfterMerge),
    ("unable to resolve reference", ErrorKind::ReferenceBroken),
    ("reference broken", ErrorKind::ReferenceBroken),
    ("no tracking information", ErrorKind::UpstreamNotSet),
    ("no upstream configured", ErrorKind::UpstreamNotSet),
    ("please tell me who you are", ErrorKind::UserEmailNotSet),
    // remote / repository existence
    ("repository not found", ErrorKind::RemoteNotFound),
    (
        "does not appear to be a git repository",
        ErrorKind::RemoteNotFound,
    ),
    ("no such remote", ErrorKind::RemoteNotFound),
    // network classes
    ("could not resolve host", ErrorKind::DnsError),
    ("could not resolve hostname", ErrorKind::DnsError),
    ("name or service not known", ErrorKind::DnsError),
    (
        "temporary failure in name resolution",
        ErrorKind::DnsError,
    ),
    ("ssl certificate", ErrorKind::SslError),
    ("certificate verification failed", ErrorKind::SslError),
    ("ssl error", ErrorKind::SslError),
    ("tls error", ErrorKind::SslError),
    ("network is unreachable", ErrorKind::NetworkUnreachable),
    ("no route to host", ErrorKind::NetworkUnreachable),
    ("connection refused", ErrorKind::NetworkUnreachable),
    ("could not connect to", ErrorKind::NetworkUnreachable),
    ("failed to connect", ErrorKind::NetworkUnreachable),
    ("timed out", ErrorKind::NetworkTimeout),
    ("timeout", ErrorKind::NetworkTimeout),
];

/// Classify combined git output. Unknown text yields
/// [`ErrorKind::Unclassified`] wrapping the trimmed first line; empty output
/// falls back to [`ErrorKind::GitCommandFailed`].
pub fn classify(output: &str) -> ErrorKind {
    let haystack = output.to_ascii_lowercase();
    for (pattern, kind) in PATTERNS {
        if haystack.contains(pattern) {
            return kind.clone();
        }
    }
    let line = first_line(output);
    if line.is_empty() {
        ErrorKind::GitCommandFailed
    } else {
        ErrorKind::Unclassified(line.to_string())
    }
}

impl ErrorKind {
    /// True for failures the user can act on without new credentials:
    /// the repository stays usable and a later fetch/refresh may clear it.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ErrorKind::UpstreamNotSet
                | ErrorKind::CouldNotFindRemoteRef
                | ErrorKind::ReferenceBroken
                | ErrorKind::AlreadyUpToDate
                | ErrorKind::MergeAbortedTryCommit
                | ErrorKind::ConflictAfterMerge
                | ErrorKind::UnmergedFiles
                | ErrorKind::OverwrittenByMerge
                | ErrorKind::RemoteNotFound
                | ErrorKind::NetworkTimeout
                | ErrorKind::NetworkUnreachable
                | ErrorKind::DnsError
                | ErrorKind::SslError
        )
    }
}

/// A classified git operation failure.
///
/// Carries the raw exit code and combined output alongside the kind so the
/// credential heuristics below and the state evaluator's message
/// normalisation can inspect them.
#[derive(Debug, Clone, Error)]
#[error("{kind}")]
pub struct GitOperationError {
    pub kind: ErrorKind,
    pub exit_code: Option<i32>,
    pub output: String,
}

impl GitOperationError {
    pub fn from_kind(kind: ErrorKind) -> Self {
        Self {
            kind,
            exit_code: None,
            output: String::new(),
        }
    }

    /// Classify a driver-level failure.
    pub fn from_cli(err: &CliError) -> Self {
        match err {
            CliError::PromptDetected { output } => Self {
                kind: ErrorKind::CredentialPromptDetected,
                exit_code: None,
                output: output.clone(),
            },
            CliError::DeadlineExceeded(after) => Self {
                kind: ErrorKind::NetworkTimeout,
                exit_code: None,
                output: format!("operation timed out after {}s", after.as_secs()),
            },
            CliError::Canceled => Self {
                kind: ErrorKind::Unclassified("operation canceled".to_string()),
                exit_code: None,
                output: String::new(),
            },
            CliError::Failed { exit_code, output } => Self {
                kind: classify(output),
                exit_code: *exit_code,
                output: output.clone(),
            },
            other => Self {
                kind: ErrorKind::GitCommandFailed,
                exit_code: None,
                output: other.to_string(),
            },
        }
    }

    pub fn is_recoverable(&self) -> bool {
        self.kind.is_recoverable()
    }

    /// True when the failure can only be resolved by supplying credentials.
    ///
    /// Exit code 128 with no more specific classification is included: a
    /// private remote behind disabled prompts usually surfaces exactly that
    /// way. Network and not-found failures keep their own classification.
    pub fn requires_credentials(&self) -> bool {
        match self.kind {
            ErrorKind::AuthenticationRequired
            | ErrorKind::AuthorizationFailed
            | ErrorKind::PermissionDenied
            | ErrorKind::CredentialPromptDetected => true,
            ErrorKind::GitCommandFailed | ErrorKind::Unclassified(_) => {
                self.exit_code == Some(128)
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_auth_before_network() {
        // "fatal: Authentication failed for 'https://…'" must not fall into
        // a generic bucket even when the URL mentions a host.
        let kind = classify("fatal: Authentication failed for 'https://example.com/repo.git/'");
        assert_eq!(kind, ErrorKind::AuthenticationRequired);
    }

    #[test]
    fn classify_terminal_prompts_disabled() {
        let kind = classify(
            "fatal: could not read Username for 'https://github.com': terminal prompts disabled",
        );
        assert_eq!(kind, ErrorKind::AuthenticationRequired);
    }

    #[test]
    fn classify_repository_not_found_takes_precedence_over_exit_code() {
        let err = GitOperationError {
            kind: classify("ERROR: Repository not found.\nfatal: Could not read from remote repository."),
            exit_code: Some(128),
            output: String::new(),
        };
        assert_eq!(err.kind, ErrorKind::RemoteNotFound);
        assert!(err.is_recoverable());
        assert!(!err.requires_credentials());
    }

    #[test]
    fn classify_network_classes() {
        assert_eq!(
            classify("fatal: unable to access 'https://x/': Could not resolve host: x"),
            ErrorKind::DnsError
        );
        assert_eq!(
            classify("ssh: connect to host example.com port 22: Connection refused"),
            ErrorKind::NetworkUnreachable
        );
        assert_eq!(
            classify("fatal: unable to access 'https://x/': Operation timed out"),
            ErrorKind::NetworkTimeout
        );
        assert_eq!(
            classify("fatal: unable to access 'https://x/': SSL certificate problem"),
            ErrorKind::SslError
        );
    }

    #[test]
    fn classify_merge_conflicts() {
        assert_eq!(
            classify("Automatic merge failed; fix conflicts and then commit the result."),
            ErrorKind::ConflictAfterMerge
        );
        assert_eq!(
            classify("error: Your local changes to the following files would be overwritten by merge:"),
            ErrorKind::OverwrittenByMerge
        );
        assert_eq!(
            classify("error: Pulling is not possible because you have unmerged files."),
            ErrorKind::UnmergedFiles
        );
        assert_eq!(
            classify("Please commit your changes or stash them before you merge."),
            ErrorKind::MergeAbortedTryCommit
        );
    }

    #[test]
    fn classify_unknown_wraps_first_line() {
        let kind = classify("  something nobody has seen\nsecond line");
        assert_eq!(
            kind,
            ErrorKind::Unclassified("something nobody has seen".to_string())
        );
        assert_eq!(
            kind.to_string(),
            "Unclassified: something nobody has seen"
        );
    }

    #[test]
    fn exit_128_unclassified_requires_credentials() {
        let err = GitOperationError {
            kind: ErrorKind::Unclassified("fatal: odd failure".into()),
            exit_code: Some(128),
            output: String::new(),
        };
        assert!(err.requires_credentials());
        assert!(!err.is_recoverable());

        // 128 with a network classification stays a plain recoverable error.
        let err = GitOperationError {
            kind: ErrorKind::NetworkUnreachable,
            exit_code: Some(128),
            output: String::new(),
        };
        assert!(!err.requires_credentials());
        assert!(err.is_recoverable());
    }

    #[test]
    fn recoverable_set_matches_contract() {
        for kind in [
            ErrorKind::UpstreamNotSet,
            ErrorKind::CouldNotFindRemoteRef,
            ErrorKind::ReferenceBroken,
            ErrorKind::AlreadyUpToDate,
            ErrorKind::MergeAbortedTryCommit,
            ErrorKind::ConflictAfterMerge,
            ErrorKind::UnmergedFiles,
            ErrorKind::OverwrittenByMerge,
            ErrorKind::RemoteNotFound,
            ErrorKind::NetworkTimeout,
            ErrorKind::NetworkUnreachable,
            ErrorKind::DnsError,
            ErrorKind::SslError,
        ] {
            assert!(kind.is_recoverable(), "{kind} should be recoverable");
        }
        for kind in [
            ErrorKind::GitCommandFailed,
            ErrorKind::AuthenticationRequired,
            ErrorKind::AuthorizationFailed,
            ErrorKind::InvalidAuthMethod,
            ErrorKind::PermissionDenied,
            ErrorKind::UserEmailNotSet,
            ErrorKind::CredentialPromptDetected,
            ErrorKind::Unclassified("x".into()),
        ] {
            assert!(!kind.is_recoverable(), "{kind} should not be recoverable");
        }
    }
}
