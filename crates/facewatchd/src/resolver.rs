//! Background resolution of placeholder identities.
//!
//! A bounded queue feeds a fixed set of worker tasks. Each job calls the
//! recognition service once and reconciles the answer into the store by
//! merging into an existing Confirmed identity or promoting in place.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use facewatch_core::{IdentityId, IdentityStore, Settlement, StoreError};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::placeholder::{PendingResolution, PlaceholderManager};
use crate::recognition::{Recognition, RecognitionError, RecognitionService};

#[derive(Debug, Clone, PartialEq)]
pub enum ResolutionOutcome {
    /// The placeholder became a Confirmed identity in place.
    Promoted(IdentityId),
    /// The placeholder was absorbed into an existing Confirmed identity.
    Merged {
        source: IdentityId,
        target: IdentityId,
        moved: usize,
    },
    /// No usable answer; the placeholder stays Temporary.
    Unresolved(String),
    /// Someone else (the reaper, a purge) settled this fingerprint first.
    AlreadySettled,
}

#[derive(Debug, Default)]
pub struct ResolverStats {
    promoted: AtomicU64,
    merged: AtomicU64,
    unresolved: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResolverCounts {
    pub promoted: u64,
    pub merged: u64,
    pub unresolved: u64,
}

impl ResolverStats {
    fn record(&self, outcome: &ResolutionOutcome) {
        let counter = match outcome {
            ResolutionOutcome::Promoted(_) => &self.promoted,
            ResolutionOutcome::Merged { .. } => &self.merged,
            ResolutionOutcome::Unresolved(_) => &self.unresolved,
            ResolutionOutcome::AlreadySettled => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn counts(&self) -> ResolverCounts {
        ResolverCounts {
            promoted: self.promoted.load(Ordering::Relaxed),
            merged: self.merged.load(Ordering::Relaxed),
            unresolved: self.unresolved.load(Ordering::Relaxed),
        }
    }
}

/// Everything a worker needs to settle one placeholder.
pub struct ResolverContext {
    pub store: Arc<IdentityStore>,
    pub placeholders: Arc<PlaceholderManager>,
    pub service: Arc<dyn RecognitionService>,
    pub timeout: Duration,
    pub stats: ResolverStats,
}

/// Settle a placeholder without asking the service.
pub fn settle_unresolved(
    ctx: &ResolverContext,
    job: &PendingResolution,
    reason: &str,
) -> ResolutionOutcome {
    let outcome = match ctx.placeholders.take_pending(job.fingerprint) {
        Some(_) => {
            tracing::info!(
                identity_id = %job.temp_identity_id,
                created_at = %job.created_at,
                reason,
                "placeholder left temporary"
            );
            ResolutionOutcome::Unresolved(reason.to_string())
        }
        None => ResolutionOutcome::AlreadySettled,
    };
    ctx.stats.record(&outcome);
    outcome
}

/// Resolve one placeholder. The pending entry is taken after the service
/// answers, so the single-flight guard holds for the whole call.
pub async fn resolve(ctx: &ResolverContext, job: PendingResolution) -> ResolutionOutcome {
    let temp_id = job.temp_identity_id;
    tracing::info!(identity_id = %temp_id, fingerprint = %job.fingerprint, "resolution started");

    let answer = match tokio::time::timeout(ctx.timeout, ctx.service.recognize(&job.snapshot)).await
    {
        Ok(answer) => answer,
        Err(_) => Err(RecognitionError::Timeout),
    };

    if ctx.placeholders.take_pending(job.fingerprint).is_none() {
        tracing::debug!(identity_id = %temp_id, "placeholder already settled");
        return ResolutionOutcome::AlreadySettled;
    }

    let outcome = match answer {
        Err(e) => {
            tracing::warn!(identity_id = %temp_id, error = %e, "resolution unavailable");
            ResolutionOutcome::Unresolved(e.to_string())
        }
        Ok(recognition) => match reconcile(&ctx.store, temp_id, &recognition) {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(identity_id = %temp_id, error = %e, "reconciliation failed");
                ResolutionOutcome::Unresolved(e.to_string())
            }
        },
    };
    ctx.stats.record(&outcome);
    outcome
}

fn reconcile(
    store: &IdentityStore,
    temp_id: IdentityId,
    recognition: &Recognition,
) -> Result<ResolutionOutcome, StoreError> {
    let settlement = store.settle(
        temp_id,
        &recognition.label,
        Some(recognition.secondary_id.as_str()),
    )?;
    match settlement {
        Settlement::Merged { target, moved } => {
            tracing::info!(
                source = %temp_id,
                target = %target,
                label = %recognition.label,
                "placeholder merged into existing identity"
            );
            Ok(ResolutionOutcome::Merged {
                source: temp_id,
                target,
                moved,
            })
        }
        Settlement::Promoted(_) => {
            tracing::info!(
                identity_id = %temp_id,
                label = %recognition.label,
                confidence = ?recognition.confidence,
                "placeholder promoted"
            );
            Ok(ResolutionOutcome::Promoted(temp_id))
        }
    }
}

/// Fixed-size worker pool over a bounded job queue.
pub struct ResolverPool {
    ctx: Arc<ResolverContext>,
    tx: Mutex<Option<mpsc::Sender<PendingResolution>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ResolverPool {
    /// Spawn `workers` tasks on the current tokio runtime.
    pub fn spawn(ctx: Arc<ResolverContext>, workers: usize, queue_depth: usize) -> Self {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let handles = (0..workers.max(1))
            .map(|idx| tokio::spawn(run_worker(idx, ctx.clone(), rx.clone())))
            .collect();
        tracing::info!(workers, queue_depth, "resolution pool started");
        Self {
            ctx,
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(handles),
        }
    }

    pub fn context(&self) -> &ResolverContext {
        &self.ctx
    }

    /// Queue a placeholder. If the queue is full or closed it is settled
    /// as unresolved right away and `false` is returned.
    pub fn submit(&self, job: PendingResolution) -> bool {
        let sender = self.tx.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let (job, reason) = match sender {
            None => (job, "resolution pool stopped"),
            Some(tx) => match tx.try_send(job) {
                Ok(()) => return true,
                Err(mpsc::error::TrySendError::Full(job)) => (job, "resolution queue full"),
                Err(mpsc::error::TrySendError::Closed(job)) => (job, "resolution pool stopped"),
            },
        };
        settle_unresolved(&self.ctx, &job, reason);
        false
    }

    /// Stop accepting work and wait for queued and in-flight jobs.
    pub async fn shutdown(&self) {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        let handles: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "resolution worker panicked");
            }
        }
        tracing::info!("resolution pool drained");
    }
}

async fn run_worker(
    idx: usize,
    ctx: Arc<ResolverContext>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<PendingResolution>>>,
) {
    tracing::debug!(worker = idx, "resolution worker started");
    loop {
        let job = rx.lock().await.recv().await;
        let Some(job) = job else { break };
        let outcome = resolve(&ctx, job).await;
        tracing::debug!(worker = idx, ?outcome, "resolution finished");
    }
    tracing::debug!(worker = idx, "resolution worker exiting");
}
