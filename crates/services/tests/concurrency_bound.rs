//! The process-wide bound: across many repositories, no more than
//! `min(available_parallelism, 10)` command dispatches execute at once,
//! and one repository's command queue stays strictly FIFO.

mod common;

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use common::{tracked_snapshot, wait_for_quiescence};
use services::services::{
    events::{Event, EventListener, EventPayload, GIT_COMMAND_REQUESTED},
    repo::Repository,
    worker,
};

struct Gauge {
    current: AtomicUsize,
    peak: AtomicUsize,
    order: std::sync::Mutex<Vec<usize>>,
}

impl Gauge {
    fn new() -> Self {
        Self {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            order: std::sync::Mutex::new(Vec::new()),
        }
    }
}

struct CountingListener {
    gauge: Arc<Gauge>,
}

#[async_trait]
impl EventListener for CountingListener {
    async fn handle(&self, event: Event) -> anyhow::Result<()> {
        let EventPayload::Text(tag) = &event.payload else {
            return Ok(());
        };
        let now = self.gauge.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.gauge.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        self.gauge
            .order
            .lock()
            .unwrap()
            .push(tag.parse().unwrap_or(usize::MAX));
        self.gauge.current.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn global_semaphore_bounds_command_dispatches() {
    let bound = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(worker::MAX_CONCURRENT_COMMANDS);
    assert!(worker::command_semaphore().available_permits() <= bound);

    let gauge = Arc::new(Gauge::new());
    let mut repos = Vec::new();
    for i in 0..24 {
        let repo = Repository::from_snapshot(
            format!("/tmp/bound-{i}").as_ref(),
            tracked_snapshot(Some(0)),
        );
        repo.bus().on(
            GIT_COMMAND_REQUESTED,
            Arc::new(CountingListener {
                gauge: gauge.clone(),
            }),
        );
        repos.push(repo);
    }

    for (i, repo) in repos.iter().enumerate() {
        repo.publish(GIT_COMMAND_REQUESTED, EventPayload::Text(i.to_string()))
            .await
            .unwrap();
    }
    for repo in &repos {
        wait_for_quiescence(repo).await;
    }

    let peak = gauge.peak.load(Ordering::SeqCst);
    assert!(peak >= 1);
    assert!(
        peak <= bound,
        "peak concurrency {peak} exceeded the bound {bound}"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_repository_processes_commands_in_fifo_order() {
    let gauge = Arc::new(Gauge::new());
    let repo = Repository::from_snapshot("/tmp/fifo".as_ref(), tracked_snapshot(Some(0)));
    repo.bus().on(
        GIT_COMMAND_REQUESTED,
        Arc::new(CountingListener {
            gauge: gauge.clone(),
        }),
    );

    for i in 0..8 {
        repo.publish(GIT_COMMAND_REQUESTED, EventPayload::Text(i.to_string()))
            .await
            .unwrap();
    }
    wait_for_quiescence(&repo).await;

    let order = gauge.order.lock().unwrap().clone();
    assert_eq!(order, (0..8).collect::<Vec<_>>());
}
