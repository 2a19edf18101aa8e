//! Git plumbing for the pipeline: the async CLI driver, the error
//! taxonomy, and a libgit2-backed reader for local metadata.
//!
//! The split mirrors how the rest of the codebase treats git: anything that
//! mutates state or touches the network goes through the `git` CLI (whose
//! working-tree safety checks and transport stack we want), while read-only
//! graph queries (branches, upstream tracking, ahead/behind counts,
//! remotes) go through libgit2, which is faster and returns structured
//! data instead of text to parse.

use std::path::Path;

use git2::{BranchType, Repository};
use thiserror::Error;

pub mod cli;
pub mod error;

pub use cli::{CliError, GitCli, GitDriver};
pub use error::{ErrorKind, GitOperationError, classify};

#[derive(Debug, Error)]
pub enum GitServiceError {
    #[error(transparent)]
    Git(#[from] git2::Error),
    #[error("invalid repository: {0}")]
    InvalidRepository(String),
}

/// Upstream tracking information for a local branch.
///
/// `tip` is `None` when the branch configuration names an upstream whose
/// remote-tracking ref no longer exists (git's `[gone]` state); ahead and
/// behind counts are unknown in that case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamInfo {
    /// Fully qualified short name, e.g. `origin/main`.
    pub name: String,
    pub tip: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BranchInfo {
    pub name: String,
    /// 40-hex hash of the local tip.
    pub tip: String,
    pub upstream: Option<UpstreamInfo>,
    /// Commits on the local branch that the upstream lacks.
    pub ahead: Option<u32>,
    /// Commits on the upstream that the local branch lacks.
    pub behind: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct RemoteBranchInfo {
    /// Fully qualified short name, e.g. `origin/feature`.
    pub name: String,
    pub tip: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RemoteInfo {
    pub name: String,
    pub urls: Vec<String>,
    pub refspecs: Vec<String>,
    pub branches: Vec<RemoteBranchInfo>,
}

/// Everything the repository model needs from one metadata read.
#[derive(Debug, Clone, Default)]
pub struct RepoSnapshot {
    pub head_branch: Option<String>,
    pub branches: Vec<BranchInfo>,
    pub remotes: Vec<RemoteInfo>,
}

/// Read-only local metadata access via libgit2.
#[derive(Clone, Default)]
pub struct GitService;

impl GitService {
    pub fn new() -> Self {
        Self {}
    }

    pub fn is_repository(path: &Path) -> bool {
        Repository::open(path).is_ok()
    }

    /// Re-read branches, upstream tracking and remotes for a repository.
    pub fn snapshot(&self, path: &Path) -> Result<RepoSnapshot, GitServiceError> {
        let repo = Repository::open(path)?;

        let head_branch = repo
            .head()
            .ok()
            .filter(|h| h.is_branch())
            .and_then(|h| h.shorthand().map(str::to_string));

        let mut branches = Vec::new();
        for entry in repo.branches(Some(BranchType::Local))? {
            let (branch, _) = entry?;
            let Some(name) = branch.name()?.map(str::to_string) else {
                continue;
            };
            let Some(tip) = branch.get().target() else {
                // Unborn branch (fresh init); nothing to track yet.
                continue;
            };

            let upstream = Self::upstream_of(&repo, &branch, &name);
            let (ahead, behind) = match upstream
                .as_ref()
                .and_then(|u| u.tip.as_ref())
                .and_then(|t| git2::Oid::from_str(t).ok())
            {
                Some(upstream_tip) => match repo.graph_ahead_behind(tip, upstream_tip) {
                    Ok((a, b)) => (Some(a as u32), Some(b as u32)),
                    Err(e) => {
                        tracing::debug!(branch = %name, error = %e, "ahead/behind walk failed");
                        (None, None)
                    }
                },
                None => (None, None),
            };

            branches.push(BranchInfo {
                name,
                tip: tip.to_string(),
                upstream,
                ahead,
                behind,
            });
        }

        let mut remotes = Vec::new();
        let remote_names = repo.remotes()?;
        for name in remote_names.iter().flatten() {
            let remote = repo.find_remote(name)?;
            let mut urls = Vec::new();
            if let Some(url) = remote.url() {
                urls.push(url.to_string());
            }
            if let Some(push_url) = remote.pushurl() {
                urls.push(push_url.to_string());
            }
            let refspecs = remote
                .refspecs()
                .filter_map(|r| r.str().map(str::to_string))
                .collect();
            remotes.push(RemoteInfo {
                name: name.to_string(),
                urls,
                refspecs,
                branches: Vec::new(),
            });
        }

        // Attach remote-tracking branches to their remotes.
        for entry in repo.branches(Some(BranchType::Remote))? {
            let (branch, _) = entry?;
            let Some(name) = branch.name()?.map(str::to_string) else {
                continue;
            };
            if name.ends_with("/HEAD") {
                continue;
            }
            let tip = branch.get().target().map(|oid| oid.to_string());
            if let Some(remote) = remotes
                .iter_mut()
                .find(|r| name.starts_with(&format!("{}/", r.name)))
            {
                remote.branches.push(RemoteBranchInfo { name, tip });
            }
        }

        Ok(RepoSnapshot {
            head_branch,
            branches,
            remotes,
        })
    }

    /// Upstream of a local branch, keeping the configured name even when
    /// the remote-tracking ref is gone.
    fn upstream_of(
        repo: &Repository,
        branch: &git2::Branch<'_>,
        name: &str,
    ) -> Option<UpstreamInfo> {
        if let Ok(upstream) = branch.upstream() {
            let upstream_name = upstream
                .name()
                .ok()
                .flatten()
                .map(str::to_string)
                .unwrap_or_default();
            if upstream_name.is_empty() {
                return None;
            }
            let tip = upstream.get().target().map(|oid| oid.to_string());
            return Some(UpstreamInfo {
                name: upstream_name,
                tip,
            });
        }

        // branch.upstream() fails both for "no upstream configured" and for
        // "configured but gone"; only the latter still has a config entry.
        let refname = format!("refs/heads/{name}");
        let configured = repo.branch_upstream_name(&refname).ok()?;
        let full = configured.as_str()?;
        let short = full.strip_prefix("refs/remotes/").unwrap_or(full);
        Some(UpstreamInfo {
            name: short.to_string(),
            tip: None,
        })
    }
}
