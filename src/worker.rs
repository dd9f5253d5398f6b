use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::judge::JudgeEngine;
use crate::judge::model::{JudgeResult, Submission};
use crate::sandbox::CANCELLED_MESSAGE;

/// Judges many submissions concurrently, at most `workers` at a time.
///
/// Each submission gets its own cancellation token, registered under its id
/// until it finishes.
pub struct JudgePool {
    engine: JudgeEngine,
    slots: Arc<Semaphore>,
    in_flight: Mutex<Registry>,
    shutdown: CancellationToken,
}

/// Tokens of submissions that are queued or running, keyed by submission id
#[derive(Default)]
struct Registry {
    next_ticket: u64,
    entries: HashMap<u64, (u64, CancellationToken)>,
}

impl JudgePool {
    pub fn new(engine: JudgeEngine, workers: usize) -> Self {
        let workers = workers.max(1);
        log::info!("Judge pool started with {workers} workers");
        Self {
            engine,
            slots: Arc::new(Semaphore::new(workers)),
            in_flight: Mutex::new(Registry::default()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Waits for a free worker, then judges the submission.
    pub async fn submit(&self, id: u64, submission: &Submission) -> JudgeResult {
        let token = self.shutdown.child_token();
        let ticket = {
            let mut registry = self.in_flight.lock();
            let ticket = registry.next_ticket;
            registry.next_ticket += 1;
            if let Some((_, previous)) = registry.entries.insert(id, (ticket, token.clone())) {
                log::warn!("Submission {id} resubmitted while in flight, cancelling the old run");
                previous.cancel();
            }
            ticket
        };

        let result = tokio::select! {
            permit = self.slots.acquire() => match permit {
                Ok(_permit) => {
                    log::info!("Worker picked up submission {id}");
                    self.engine.judge_with_cancel(submission, &token).await
                }
                Err(_) => JudgeResult::internal_error(&submission.batches, "Judge pool is closed".to_string()),
            },
            () = token.cancelled() => {
                log::info!("Submission {id} cancelled before it started");
                JudgeResult::internal_error(&submission.batches, CANCELLED_MESSAGE.to_string())
            }
        };

        let mut registry = self.in_flight.lock();
        if registry.entries.get(&id).is_some_and(|(t, _)| *t == ticket) {
            registry.entries.remove(&id);
        }
        drop(registry);
        log::debug!("Submission {id} finished with {}", result.status);
        result
    }

    /// Cancels a queued or running submission. Returns whether it was found.
    pub fn cancel(&self, id: u64) -> bool {
        match self.in_flight.lock().entries.remove(&id) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().entries.len()
    }

    /// Cancels everything in flight and refuses new work.
    pub fn shutdown(&self) {
        log::info!("Shutdown signal sent to workers");
        self.shutdown.cancel();
        self.slots.close();
    }
}
