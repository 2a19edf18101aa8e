//! Per-repository event bus.
//!
//! Each repository owns three independent queues:
//!
//! - **command** (capacity 64): one consumer; every dispatch first takes a
//!   permit from the process-wide command semaphore, then runs the
//!   listeners on their own task so slow git commands on one repository
//!   never stall another repository's queue beyond the global bound.
//! - **evaluation** (capacity 64): one consumer, dispatched inline — its
//!   listeners only run lightweight predicate queries.
//! - **trace** (capacity 128, only when tracing was enabled at repository
//!   construction): one consumer serialising lines into the trace sink.
//!
//! Lightweight events (`repository.updated`, `branch.updated`,
//! `repository.refresh.requested`) bypass the queues and run their
//! listeners synchronously on the publishing task. Within one queue events
//! are strictly FIFO; listeners for one event run in registration order.

use std::{
    collections::HashMap,
    sync::{
        Arc, RwLock,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::services::{
    ops::{GitCommandRequest, OperationOutcome},
    repo::Repository,
    trace,
    trace::{QueueTag, TraceRecord},
    worker,
};

pub const REPOSITORY_UPDATED: &str = "repository.updated";
pub const BRANCH_UPDATED: &str = "branch.updated";
pub const REPOSITORY_REFRESH_REQUESTED: &str = "repository.refresh.requested";
pub const EVALUATION_REQUESTED: &str = "repository.evaluation.requested";
pub const GIT_COMMAND_REQUESTED: &str = "repository.git.command.requested";
pub const EVENT_TRACED: &str = "repository.event.traced";

const COMMAND_QUEUE_CAPACITY: usize = 64;
const EVALUATION_QUEUE_CAPACITY: usize = 64;
const TRACE_QUEUE_CAPACITY: usize = 128;

#[derive(Clone)]
pub enum EventPayload {
    Command(GitCommandRequest),
    Outcome(OperationOutcome),
    Text(String),
    Empty,
}

#[derive(Clone)]
pub struct Event {
    pub repo: Arc<Repository>,
    pub payload: EventPayload,
    pub token: CancellationToken,
}

impl Event {
    pub fn new(repo: Arc<Repository>, payload: EventPayload) -> Self {
        Self {
            repo,
            payload,
            token: CancellationToken::new(),
        }
    }

    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }
}

#[async_trait]
pub trait EventListener: Send + Sync {
    async fn handle(&self, event: Event) -> anyhow::Result<()>;
}

#[derive(Debug, Error)]
pub enum EventError {
    #[error("{queue} queue is full")]
    QueueFull { queue: &'static str },
    #[error("{queue} queue is closed")]
    QueueClosed { queue: &'static str },
    #[error("unknown event name: {0}")]
    UnknownEvent(String),
}

#[derive(Default)]
struct ListenerRegistry {
    listeners: RwLock<HashMap<&'static str, Vec<Arc<dyn EventListener>>>>,
}

impl ListenerRegistry {
    fn on(&self, name: &'static str, listener: Arc<dyn EventListener>) {
        self.listeners
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .entry(name)
            .or_default()
            .push(listener);
    }

    async fn dispatch(&self, name: &str, event: Event) {
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(name)
            .cloned()
            .unwrap_or_default();
        for listener in listeners {
            if let Err(err) = listener.handle(event.clone()).await {
                // Cancellation during shutdown is routine; anything else is
                // a listener bug worth surfacing. Errors never cancel the
                // remaining listeners for the same event.
                let canceled = err
                    .downcast_ref::<git::CliError>()
                    .is_some_and(git::CliError::is_cancellation);
                if canceled {
                    tracing::trace!(event = name, %err, "listener canceled");
                } else {
                    tracing::error!(event = name, %err, "listener failed");
                }
            }
        }
    }
}

pub struct EventBus {
    registry: Arc<ListenerRegistry>,
    command_tx: mpsc::Sender<Event>,
    evaluation_tx: mpsc::Sender<Event>,
    trace_tx: Option<mpsc::Sender<TraceRecord>>,
    in_flight: Arc<AtomicUsize>,
}

impl EventBus {
    /// Build the bus and spawn its queue consumers. `traced` decides
    /// whether this repository gets a trace queue at all.
    pub fn new(traced: bool) -> Self {
        let registry = Arc::new(ListenerRegistry::default());
        let in_flight = Arc::new(AtomicUsize::new(0));

        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        tokio::spawn(run_command_consumer(
            command_rx,
            registry.clone(),
            in_flight.clone(),
        ));

        let (evaluation_tx, evaluation_rx) = mpsc::channel(EVALUATION_QUEUE_CAPACITY);
        tokio::spawn(run_evaluation_consumer(
            evaluation_rx,
            registry.clone(),
            in_flight.clone(),
        ));

        let trace_tx = traced.then(|| {
            let (trace_tx, trace_rx) = mpsc::channel(TRACE_QUEUE_CAPACITY);
            tokio::spawn(run_trace_consumer(trace_rx));
            trace_tx
        });

        Self {
            registry,
            command_tx,
            evaluation_tx,
            trace_tx,
            in_flight,
        }
    }

    /// Register a listener. Listeners for one event run in registration
    /// order; multiple listeners per event are allowed.
    pub fn on(&self, name: &'static str, listener: Arc<dyn EventListener>) {
        self.registry.on(name, listener);
    }

    /// Route an event by name to its queue (or the synchronous path) and
    /// trace it. Submission failures (queue full or closed, unknown name)
    /// surface to the caller and change no repository state.
    pub async fn publish(&self, name: &'static str, event: Event) -> Result<(), EventError> {
        self.trace_event(name, &event);
        match name {
            GIT_COMMAND_REQUESTED => self.enqueue(&self.command_tx, "command", event),
            EVALUATION_REQUESTED => self.enqueue(&self.evaluation_tx, "evaluation", event),
            // Trace-only events have no listeners to run.
            EVENT_TRACED => Ok(()),
            REPOSITORY_UPDATED | BRANCH_UPDATED | REPOSITORY_REFRESH_REQUESTED => {
                self.registry.dispatch(name, event).await;
                Ok(())
            }
            other => Err(EventError::UnknownEvent(other.to_string())),
        }
    }

    /// Events currently queued or being dispatched on the two work queues.
    /// Zero means this repository is quiescent.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn enqueue(
        &self,
        tx: &mpsc::Sender<Event>,
        queue: &'static str,
        event: Event,
    ) -> Result<(), EventError> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        match tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                match err {
                    mpsc::error::TrySendError::Full(_) => Err(EventError::QueueFull { queue }),
                    mpsc::error::TrySendError::Closed(_) => {
                        Err(EventError::QueueClosed { queue })
                    }
                }
            }
        }
    }

    fn trace_event(&self, name: &str, event: &Event) {
        if !trace::is_enabled() {
            return;
        }
        let record = TraceRecord {
            queue: queue_tag(name),
            repo: event.repo.name().to_string(),
            event: name.to_string(),
            data: trace::summarize(&event.payload),
        };
        match &self.trace_tx {
            Some(tx) => {
                if tx.try_send(record).is_err() {
                    tracing::warn!(event = name, "trace queue full, dropping trace record");
                }
            }
            // No trace queue (tracing was enabled after construction):
            // write on the publishing task.
            None => trace::write(&record),
        }
    }
}

fn queue_tag(name: &str) -> QueueTag {
    match name {
        GIT_COMMAND_REQUESTED => QueueTag::Command,
        EVALUATION_REQUESTED => QueueTag::Evaluation,
        _ => QueueTag::Sync,
    }
}

async fn run_command_consumer(
    mut rx: mpsc::Receiver<Event>,
    registry: Arc<ListenerRegistry>,
    in_flight: Arc<AtomicUsize>,
) {
    while let Some(event) = rx.recv().await {
        // One permit of the process-wide pool per dispatch; held until the
        // dispatch task finishes so the global bound covers the whole
        // command execution. The consumer waits for the task so mutating
        // commands stay serialised per repository; a panicking listener
        // only poisons its own task.
        let Ok(permit) = worker::command_semaphore().acquire().await else {
            break;
        };
        let registry = registry.clone();
        let dispatch = tokio::spawn(async move {
            registry.dispatch(GIT_COMMAND_REQUESTED, event).await;
            drop(permit);
        });
        let _ = dispatch.await;
        in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn run_evaluation_consumer(
    mut rx: mpsc::Receiver<Event>,
    registry: Arc<ListenerRegistry>,
    in_flight: Arc<AtomicUsize>,
) {
    while let Some(event) = rx.recv().await {
        registry.dispatch(EVALUATION_REQUESTED, event).await;
        in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn run_trace_consumer(mut rx: mpsc::Receiver<TraceRecord>) {
    while let Some(record) = rx.recv().await {
        trace::write(&record);
    }
}
