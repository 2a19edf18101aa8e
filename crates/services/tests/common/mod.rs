//! Shared test infrastructure: a scripted git driver and repository
//! snapshot builders.
#![allow(dead_code)]

use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use git::{BranchInfo, CliError, GitDriver, RemoteBranchInfo, RemoteInfo, RepoSnapshot, UpstreamInfo};
use tokio_util::sync::CancellationToken;

/// Scripted driver: responses are keyed by the git subcommand (the first
/// argument); unscripted subcommands succeed with empty output. Every call
/// is recorded for assertions.
#[derive(Default)]
pub struct ScriptedDriver {
    responses: Mutex<HashMap<String, Result<String, CliError>>>,
    calls: Mutex<Vec<Vec<String>>>,
}

impl ScriptedDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, subcommand: &str, output: &str) {
        self.responses
            .lock()
            .unwrap()
            .insert(subcommand.to_string(), Ok(output.to_string()));
    }

    pub fn fail(&self, subcommand: &str, err: CliError) {
        self.responses
            .lock()
            .unwrap()
            .insert(subcommand.to_string(), Err(err));
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, subcommand: &str) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter(|args| args.first().map(String::as_str) == Some(subcommand))
            .collect()
    }
}

#[async_trait]
impl GitDriver for ScriptedDriver {
    async fn run(
        &self,
        _dir: &Path,
        args: &[String],
        _timeout: Option<Duration>,
        _token: &CancellationToken,
    ) -> Result<String, CliError> {
        self.calls.lock().unwrap().push(args.to_vec());
        let key = args.first().cloned().unwrap_or_default();
        self.responses
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .unwrap_or(Ok(String::new()))
    }

    async fn run_exit_code(
        &self,
        _dir: &Path,
        args: &[String],
        _token: &CancellationToken,
    ) -> Result<i32, CliError> {
        self.calls.lock().unwrap().push(args.to_vec());
        Ok(0)
    }
}

/// A repository snapshot with one tracked branch `main` on `origin`.
pub fn tracked_snapshot(pullables: Option<u32>) -> RepoSnapshot {
    RepoSnapshot {
        head_branch: Some("main".into()),
        branches: vec![BranchInfo {
            name: "main".into(),
            tip: "1".repeat(40),
            upstream: Some(UpstreamInfo {
                name: "origin/main".into(),
                tip: Some("2".repeat(40)),
            }),
            ahead: Some(0),
            behind: pullables,
        }],
        remotes: vec![RemoteInfo {
            name: "origin".into(),
            urls: vec!["https://example.com/demo.git".into()],
            refspecs: vec!["+refs/heads/*:refs/remotes/origin/*".into()],
            branches: vec![RemoteBranchInfo {
                name: "origin/main".into(),
                tip: Some("2".repeat(40)),
            }],
        }],
    }
}

/// A snapshot with no upstream configured.
pub fn untracked_snapshot() -> RepoSnapshot {
    RepoSnapshot {
        head_branch: Some("main".into()),
        branches: vec![BranchInfo {
            name: "main".into(),
            tip: "1".repeat(40),
            upstream: None,
            ahead: None,
            behind: None,
        }],
        remotes: Vec::new(),
    }
}

/// Poll until the repository's queues drained.
pub async fn wait_for_quiescence(repo: &Arc<services::services::repo::Repository>) {
    for _ in 0..200 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if repo.bus().in_flight() == 0 {
            return;
        }
    }
    panic!("repository never became quiescent");
}
