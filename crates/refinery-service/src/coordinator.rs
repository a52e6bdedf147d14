//! Batch transaction coordinator
//!
//! One coordinator task owns the open batch. Submitters hand over a message
//! plus a oneshot result slot and suspend until the owning batch's
//! transaction settles; every slot in a batch resolves together. The state
//! machine per batch is Collecting → Executing → Completed: the size
//! threshold closes a batch, a linger timer flushes a non-empty partial
//! batch, and at most one batch executes at a time; submissions arriving
//! mid-execution queue up for the next one.
//!
//! A message's success is provisional until commit; a transaction-level
//! failure resolves every not-yet-classified slot uniformly from the one
//! caught error, so no waiter is ever left hanging.

use refinery_graph::{compile, resolve, CompilerOptions};
use refinery_model::{Message, OwnershipRecord};
use refinery_store::{GraphStore, IndexAdvisor, Statement, StoreError, WriteSession};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Terminal outcome of one submitted message.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Durably committed.
    Applied,
    /// Permanent failure; redelivery cannot help.
    Rejected { reason: String },
    /// Nothing was committed; the caller should redeliver the original
    /// message.
    RetryRequested { reason: String },
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("batch coordinator is shut down")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Messages per batch; also the submission backpressure bound.
    pub batch_size: usize,
    /// Flush a non-empty partial batch after this long.
    pub linger: Duration,
    pub compiler: CompilerOptions,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            batch_size: 50,
            linger: Duration::from_millis(250),
            compiler: CompilerOptions::default(),
        }
    }
}

struct Submission {
    message: Message,
    slot: oneshot::Sender<Outcome>,
}

/// Handle for submitting messages to the coordinator task.
#[derive(Clone)]
pub struct BatchCoordinator {
    tx: mpsc::Sender<Submission>,
}

impl BatchCoordinator {
    /// Spawn the coordinator task against `store`.
    pub fn spawn(store: Arc<dyn GraphStore>, options: BatchOptions) -> Self {
        let (tx, rx) = mpsc::channel(options.batch_size.max(1));
        tokio::spawn(run_loop(rx, store, options));
        Self { tx }
    }

    /// Submit one message and suspend until its batch completes.
    pub async fn submit(&self, message: Message) -> Result<Outcome, SubmitError> {
        let (slot, result) = oneshot::channel();
        self.tx
            .send(Submission { message, slot })
            .await
            .map_err(|_| SubmitError::Closed)?;
        result.await.map_err(|_| SubmitError::Closed)
    }
}

async fn run_loop(
    mut rx: mpsc::Receiver<Submission>,
    store: Arc<dyn GraphStore>,
    options: BatchOptions,
) {
    let advisor = IndexAdvisor::new();
    let mut open: Vec<Submission> = Vec::new();
    let mut flush_at: Option<Instant> = None;

    loop {
        tokio::select! {
            submission = rx.recv() => match submission {
                Some(submission) => {
                    open.push(submission);
                    if open.len() == 1 {
                        flush_at = Some(Instant::now() + options.linger);
                    }
                    if open.len() >= options.batch_size {
                        execute_batch(&*store, &advisor, &options, std::mem::take(&mut open)).await;
                        flush_at = None;
                    }
                }
                None => break,
            },
            _ = tokio::time::sleep_until(flush_at.unwrap_or_else(Instant::now)),
                if flush_at.is_some() =>
            {
                execute_batch(&*store, &advisor, &options, std::mem::take(&mut open)).await;
                flush_at = None;
            }
        }
    }

    // Drain whatever was collected when the last handle dropped.
    if !open.is_empty() {
        execute_batch(&*store, &advisor, &options, open).await;
    }
}

/// Executing → Completed: run the closed batch in one write transaction and
/// release every waiter with its own outcome.
async fn execute_batch(
    store: &dyn GraphStore,
    advisor: &IndexAdvisor,
    options: &BatchOptions,
    batch: Vec<Submission>,
) {
    let messages: Vec<&Message> = batch.iter().map(|s| &s.message).collect();
    let outcomes = run_batch(store, advisor, options, &messages).await;

    for (submission, outcome) in batch.into_iter().zip(outcomes) {
        match &outcome {
            Outcome::Applied => info!(
                node_type = %submission.message.node_type,
                name = %submission.message.name,
                "message applied"
            ),
            Outcome::Rejected { reason } => warn!(
                node_type = %submission.message.node_type,
                name = %submission.message.name,
                %reason,
                "message rejected"
            ),
            Outcome::RetryRequested { reason } => warn!(
                node_type = %submission.message.node_type,
                name = %submission.message.name,
                %reason,
                "batch retry requested"
            ),
        }
        // A submitter that gave up waiting is its transport's problem.
        let _ = submission.slot.send(outcome);
    }
}

async fn run_batch(
    store: &dyn GraphStore,
    advisor: &IndexAdvisor,
    options: &BatchOptions,
    messages: &[&Message],
) -> Vec<Outcome> {
    let mut outcomes: Vec<Option<Outcome>> = vec![None; messages.len()];

    let mut session = match store.begin_write().await {
        Ok(session) => session,
        Err(err) => {
            error!(%err, "failed to open batch transaction");
            return resolve_unclassified(outcomes, &err);
        }
    };

    let mut abort: Option<StoreError> = None;
    for (index, message) in messages.iter().enumerate() {
        match apply_message(session.as_mut(), store, advisor, options, message).await {
            // Provisional: upgraded to Applied once the batch commits.
            Ok(()) => {}
            Err(MessageFailure::Reject(reason)) => {
                outcomes[index] = Some(Outcome::Rejected { reason });
            }
            Err(MessageFailure::Transient(err)) => {
                abort = Some(err);
                break;
            }
        }
    }

    match abort {
        Some(err) => {
            if let Err(rollback_err) = session.rollback().await {
                error!(%rollback_err, "rollback after transient failure also failed");
            }
            resolve_unclassified(outcomes, &err)
        }
        None => match session.commit().await {
            Ok(()) => outcomes
                .into_iter()
                .map(|outcome| outcome.unwrap_or(Outcome::Applied))
                .collect(),
            Err(err) => {
                error!(%err, "batch commit failed");
                resolve_unclassified(outcomes, &err)
            }
        },
    }
}

/// Apply one transaction-level failure uniformly to every message that was
/// not already classified at its own call site.
fn resolve_unclassified(outcomes: Vec<Option<Outcome>>, err: &StoreError) -> Vec<Outcome> {
    let terminal = if err.is_transient() {
        Outcome::RetryRequested {
            reason: err.to_string(),
        }
    } else {
        Outcome::Rejected {
            reason: err.to_string(),
        }
    };
    outcomes
        .into_iter()
        .map(|outcome| outcome.unwrap_or_else(|| terminal.clone()))
        .collect()
}

enum MessageFailure {
    /// Permanent, message-scoped; does not abort the shared transaction.
    Reject(String),
    /// Aborts the batch; nothing from it is committed.
    Transient(StoreError),
}

async fn apply_message(
    session: &mut dyn WriteSession,
    store: &dyn GraphStore,
    advisor: &IndexAdvisor,
    options: &BatchOptions,
    message: &Message,
) -> Result<(), MessageFailure> {
    // Index DDL runs through the store handle; schema and data work do not
    // share a transaction. Any failure other than "already exists" retries
    // the whole batch rather than merging unindexed.
    let dimension_keys: Vec<String> = message.conformed_dimensions.keys().cloned().collect();
    if !dimension_keys.is_empty() {
        advisor
            .ensure(store, &message.labels(), &dimension_keys)
            .await
            .map_err(|err| MessageFailure::Transient(StoreError::Transient(err.to_string())))?;
    }
    for connection in &message.connections {
        let keys: Vec<String> = connection.conformed_dimensions.keys().cloned().collect();
        if keys.is_empty() {
            continue;
        }
        advisor
            .ensure(store, &connection.labels(), &keys)
            .await
            .map_err(|err| MessageFailure::Transient(StoreError::Transient(err.to_string())))?;
    }

    // Resolve against the transaction's current view of the node.
    let resolution = if message.source_system.is_some()
        && message.priority.is_some()
        && !message.conformed_dimensions.is_empty()
    {
        let records = session
            .run(Statement::FetchNode {
                labels: message.labels(),
                key: message.conformed_dimensions.clone(),
            })
            .await
            .map_err(classify_store)?;
        let existing = records.first().map(OwnershipRecord::from_props);
        resolve(existing.as_ref(), message)
    } else {
        resolve(None, message)
    };

    let program = compile(message, &resolution, &options.compiler)
        .map_err(|err| MessageFailure::Reject(err.to_string()))?;
    debug!(statement = %program.to_cypher(), "compiled mutation program");

    session
        .run(Statement::Apply(program))
        .await
        .map_err(classify_store)?;
    Ok(())
}

fn classify_store(err: StoreError) -> MessageFailure {
    if err.is_transient() {
        MessageFailure::Transient(err)
    } else {
        MessageFailure::Reject(err.to_string())
    }
}
