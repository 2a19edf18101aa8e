pub mod config;
pub mod credentials;
pub mod discovery;
pub mod evaluator;
pub mod events;
pub mod jobs;
pub mod ops;
pub mod repo;
pub mod trace;
pub mod worker;

use std::sync::Arc;

use git::{GitDriver, GitService};
use once_cell::sync::OnceCell;

use crate::services::{
    evaluator::{RefreshListener, StateEvaluator},
    events::{EVALUATION_REQUESTED, GIT_COMMAND_REQUESTED, REPOSITORY_REFRESH_REQUESTED},
    worker::GitCommandWorker,
};

static INIT: OnceCell<()> = OnceCell::new();

/// Install the default repository hooks: every repository created after
/// this call gets the git-command worker, the state evaluator and the
/// refresh listener wired onto its queues. Call once before any repository
/// is constructed; later calls are no-ops.
pub fn init(driver: Arc<dyn GitDriver>) {
    INIT.get_or_init(|| {
        repo::register_repository_hook(Arc::new(move |repository| {
            let bus = repository.bus();
            bus.on(GIT_COMMAND_REQUESTED, Arc::new(GitCommandWorker));
            bus.on(
                EVALUATION_REQUESTED,
                Arc::new(StateEvaluator::new(driver.clone())),
            );
            bus.on(
                REPOSITORY_REFRESH_REQUESTED,
                Arc::new(RefreshListener::new(GitService::new())),
            );
        }));
    });
}
