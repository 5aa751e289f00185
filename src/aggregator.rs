use anyhow::{Context, Result};
use opentimestamps::timestamp::Timestamp;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::calendar::Calendar;
use crate::merkle::{self, Digest};

/// Retries for the round-close journal write before the failure is treated
/// as fatal.
const APPEND_ATTEMPTS: u32 = 3;
const APPEND_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("calendar is overloaded, try again later")]
    Overloaded,
    #[error("round was not committed")]
    RoundFailed,
}

struct Waiter {
    digest: Digest,
    reply: oneshot::Sender<Timestamp>,
}

/// Batches submissions into rounds. Submitters park on a oneshot until the
/// round closer folds the round's digests into a Merkle mountain range,
/// journals the commitment, and hands each submitter its inclusion path.
pub struct Aggregator {
    calendar: Arc<Calendar>,
    uri: String,
    cap: usize,
    round: Mutex<Vec<Waiter>>,
}

impl Aggregator {
    pub fn new(calendar: Arc<Calendar>, uri: String, cap: usize) -> Self {
        Aggregator { calendar, uri, cap, round: Mutex::new(Vec::new()) }
    }

    /// Queue a digest into the open round. The receiver completes with the
    /// submitter's path once the round's commitment is durable.
    pub fn enqueue(&self, digest: Digest) -> Result<oneshot::Receiver<Timestamp>, SubmitError> {
        let mut round = self.round.lock().unwrap();
        if round.len() >= self.cap {
            return Err(SubmitError::Overloaded);
        }
        let (reply, receiver) = oneshot::channel();
        round.push(Waiter { digest, reply });
        Ok(receiver)
    }

    pub async fn submit(&self, digest: Digest) -> Result<Timestamp, SubmitError> {
        let receiver = self.enqueue(digest)?;
        receiver.await.map_err(|_| SubmitError::RoundFailed)
    }

    /// Close the current round. Empty rounds produce nothing at all; other
    /// rounds produce exactly one journaled commitment, acknowledged to every
    /// waiter only after the record is durable.
    pub async fn close_round(&self) -> Result<Option<Digest>> {
        let waiters: Vec<Waiter> = std::mem::take(&mut *self.round.lock().unwrap());
        if waiters.is_empty() {
            return Ok(None);
        }

        let leaves: Vec<Digest> = waiters.iter().map(|w| w.digest).collect();
        let range = merkle::mountain_range(&leaves).expect("round is non-empty");
        let commitment = range.root;
        let tail = merkle::pending(&commitment, &self.uri);

        let mut attempt = 0;
        loop {
            match self.calendar.add_commitment(&commitment, &tail) {
                Ok(_) => break,
                Err(e) => {
                    attempt += 1;
                    if attempt >= APPEND_ATTEMPTS {
                        // Dropping the waiters fails every submitter of the round.
                        return Err(e.context("round commitment could not be journaled"));
                    }
                    warn!("round commitment write failed (attempt {attempt}): {e:#}");
                    tokio::time::sleep(APPEND_BACKOFF * attempt).await;
                }
            }
        }

        debug!("round closed: {} submissions under {}", leaves.len(), hex::encode(commitment));
        for (waiter, ops) in waiters.into_iter().zip(range.paths) {
            let timestamp = merkle::extend(&waiter.digest, &ops, &tail)
                .context("pending tail is not a linear chain")?;
            // A submitter may have disconnected; its leaf stays in the round.
            let _ = waiter.reply.send(timestamp);
        }
        Ok(Some(commitment))
    }

    /// Round closer task: ticks on the round interval until shutdown. A round
    /// that cannot be journaled takes the server down.
    pub async fn run(self: Arc<Self>, interval: Duration, running: Arc<AtomicBool>) -> Result<()> {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        while running.load(Ordering::Relaxed) {
            ticker.tick().await;
            self.close_round().await?;
        }
        Ok(())
    }
}
