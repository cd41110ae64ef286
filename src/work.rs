// Copyright (C) 2020  Braiins Systems s.r.o.
//
// This file is part of Braiins Open-Source Initiative (BOSI).
//
// BOSI is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.
//
// Please, keep in mind that we may also license BOSI or any part thereof
// under a proprietary license. For more information on the terms and conditions
// of such proprietary license or if you have any other questions, please
// contact us at opensource@braiins.com.

//! Internal work queue and the worker loop that feeds the accelerator
//! chain.
//!
//! The queue is a mailbox of typed items filled by the receive loop and
//! drained by the worker loop. A `clean_jobs` notification purges queued
//! jobs while difficulty updates survive the purge in their original order.

use crate::client;
use crate::error;
use crate::hal;
use crate::job;
use crate::misc::LOGGER;
use crate::shutdown;
use crate::stats;

use futures::channel::mpsc;
use futures::lock::Mutex as AsyncMutex;
use futures::stream::StreamExt;

use slog::{debug, error, info, warn};

use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard};
use std::time::Duration;

/// Typed item of the internal work queue
#[derive(Clone, Debug, PartialEq)]
pub enum WorkItem {
    Job(job::BuiltJob),
    SetDifficulty(u64),
}

impl WorkItem {
    fn is_job(&self) -> bool {
        match self {
            WorkItem::Job(_) => true,
            WorkItem::SetDifficulty(_) => false,
        }
    }
}

struct QueueInner {
    items: StdMutex<VecDeque<WorkItem>>,
    /// One token per pushed item wakes the consumer; stale tokens after a
    /// purge only cause a harmless re-check
    doorbell_tx: mpsc::UnboundedSender<()>,
    doorbell_rx: AsyncMutex<mpsc::UnboundedReceiver<()>>,
}

/// Internal work queue shared between the receive loop (producer side plus
/// the clean-jobs purge) and the worker loop (consumer side)
#[derive(Clone)]
pub struct Queue {
    inner: Arc<QueueInner>,
}

impl Queue {
    pub fn new() -> Self {
        let (doorbell_tx, doorbell_rx) = mpsc::unbounded();
        Self {
            inner: Arc::new(QueueInner {
                items: StdMutex::new(VecDeque::new()),
                doorbell_tx,
                doorbell_rx: AsyncMutex::new(doorbell_rx),
            }),
        }
    }

    fn lock_items(&self) -> StdMutexGuard<VecDeque<WorkItem>> {
        self.inner.items.lock().expect("work queue lock poisoned")
    }

    pub fn push(&self, item: WorkItem) {
        self.lock_items().push_back(item);
        let _ = self.inner.doorbell_tx.unbounded_send(());
    }

    /// Drop all queued `Job` items; other items keep their FIFO order.
    /// Returns the number of purged jobs.
    pub fn flush_jobs(&self) -> usize {
        let mut items = self.lock_items();
        let before = items.len();
        items.retain(|item| !item.is_job());
        before - items.len()
    }

    /// Wait for the next queued item
    pub async fn pop(&self) -> WorkItem {
        let mut doorbell = self.inner.doorbell_rx.lock().await;
        loop {
            if let Some(item) = self.lock_items().pop_front() {
                return item;
            }
            // the sender half lives inside the queue, so this never closes
            let _ = doorbell.next().await;
        }
    }

    #[cfg(test)]
    fn contents(&self) -> Vec<WorkItem> {
        self.lock_items().iter().cloned().collect()
    }
}

/// Result of driving one job through the chain
#[derive(Debug, PartialEq)]
pub enum JobOutcome {
    /// A device found a nonce; it is already corrected to header form
    Found(u32),
    /// The poll deadline expired, results were not read
    TimedOut,
    /// The ready line fired but no device flagged a hit. Expected after an
    /// interrupt pulse, suspicious otherwise.
    ReadyWithoutResult,
}

/// Run one job on the chain: load it, start the search and wait for the
/// outcome. The chain is returned to reset on every path, including device
/// errors. This call blocks and belongs on the blocking worker pool.
pub fn execute_job<B: hal::Bus>(
    ctl: &hal::ChainCtl<B>,
    built: &job::BuiltJob,
    timeout: Option<Duration>,
) -> error::Result<JobOutcome> {
    let outcome: error::Result<JobOutcome> = (|| {
        ctl.update_job(&built.midstate, &built.tail)?;
        ctl.start_execution()?;
        if !ctl.poll_until_ready_or_timeout(timeout)? {
            return Ok(JobOutcome::TimedOut);
        }
        match ctl.get_result()? {
            Some(nonce) => Ok(JobOutcome::Found(nonce)),
            None => Ok(JobOutcome::ReadyWithoutResult),
        }
    })();

    let reset_result = ctl.reset();
    let outcome = outcome?;
    reset_result?;
    Ok(outcome)
}

/// Worker loop: dequeues work items and drives the accelerator chain.
/// Device errors never propagate upstream; the loop restores the chain and
/// keeps serving the queue.
pub async fn solve_task<B: hal::Bus>(
    queue: Queue,
    ctl: Arc<hal::ChainCtl<B>>,
    caller: client::Caller,
    worker_name: String,
    timeout: Option<Duration>,
    shutdown: shutdown::Sender,
) {
    loop {
        debug!(LOGGER, "[{}] Waiting for work...", worker_name);

        match queue.pop().await {
            WorkItem::Job(built) => {
                info!(
                    LOGGER,
                    "[{}] Starting new job {}", worker_name, built.job_id
                );

                let blocking_ctl = ctl.clone();
                let blocking_job = built.clone();
                let outcome = tokio::task::spawn_blocking(move || {
                    execute_job(&blocking_ctl, &blocking_job, timeout)
                })
                .await;

                let outcome = match outcome {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        error!(
                            LOGGER,
                            "[{}] job execution task died: {}", worker_name, e
                        );
                        continue;
                    }
                };

                match outcome {
                    Ok(JobOutcome::Found(nonce)) => {
                        info!(
                            LOGGER,
                            "[{}] Success! Job {} solved with nonce {:08x}",
                            worker_name,
                            built.job_id,
                            nonce
                        );
                        submit_solution(&caller, &worker_name, &built, nonce, &shutdown);
                    }
                    Ok(JobOutcome::TimedOut) => {
                        info!(LOGGER, "[{}] Job {} timed out", worker_name, built.job_id);
                    }
                    Ok(JobOutcome::ReadyWithoutResult) => {
                        warn!(
                            LOGGER,
                            "[{}] Ready without result on job {}", worker_name, built.job_id
                        );
                    }
                    Err(e) => {
                        error!(LOGGER, "[{}] Device error: {}", worker_name, e);
                    }
                }
            }
            WorkItem::SetDifficulty(difficulty) => {
                // recorded only, the chain has no difficulty support yet
                info!(
                    LOGGER,
                    "[{}] Server asks for difficulty {}, not applied", worker_name, difficulty
                );
                stats::record_difficulty(difficulty);
            }
        }
    }
}

fn submit_solution(
    caller: &client::Caller,
    worker_name: &str,
    built: &job::BuiltJob,
    nonce: u32,
    shutdown: &shutdown::Sender,
) {
    let params = client::submit_params(worker_name, built, nonce);
    match caller.call("mining.submit", params) {
        Ok(pending) => {
            stats::account_submitted_share();
            tokio::spawn(track_submit_response(pending, shutdown.clone()));
        }
        Err(e) => {
            error!(LOGGER, "cannot submit solution: {}", e);
            shutdown.send(format!("cannot submit solution: {}", e));
        }
    }
}

async fn track_submit_response(pending: client::PendingCall, shutdown: shutdown::Sender) {
    match pending.response().await {
        Ok(response) => match response.stratum_error() {
            None => {
                stats::account_accepted_share();
                info!(LOGGER, "Share accepted");
            }
            Some(e) => {
                stats::account_rejected_share();
                error!(LOGGER, "Share rejected ({}): {}", e.code, e.message);
                if e.is_fatal() {
                    shutdown.send(format!("fatal stratum error ({}): {}", e.code, e.message));
                }
            }
        },
        Err(e) => debug!(LOGGER, "submit response not delivered: {}", e),
    }
}
