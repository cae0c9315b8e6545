use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use facewatch_core::DetectedFace;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

use crate::engine::{Engine, EngineError, FaceOutcome};

/// Clone-safe handle for pushing face batches into the detection loop.
#[derive(Clone)]
pub struct FaceFeed {
    tx: mpsc::Sender<Vec<DetectedFace>>,
}

impl FaceFeed {
    /// Queue one batch. Returns false if the loop is full or gone.
    pub fn submit(&self, faces: Vec<DetectedFace>) -> bool {
        match self.tx.try_send(faces) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "face batch dropped");
                false
            }
        }
    }
}

/// The detection loop thread.
pub struct DetectionLoop {
    stop: Arc<AtomicBool>,
    thread: std::thread::JoinHandle<()>,
}

impl DetectionLoop {
    /// Signal the loop and wait for its thread. Blocks for at most one tick.
    pub fn stop(self) {
        self.stop.store(true, Ordering::SeqCst);
        if self.thread.join().is_err() {
            tracing::error!("detection thread panicked");
        }
    }
}

/// Spawn the detection loop on a dedicated OS thread.
///
/// Every `tick` it drains the queued batches and runs them through the
/// engine inline. Matching reads the in-memory gallery, so a tick never
/// waits on the recognition service.
pub fn spawn(
    engine: Arc<Engine>,
    tick: Duration,
    queue_depth: usize,
) -> std::io::Result<(FaceFeed, DetectionLoop)> {
    let (tx, mut rx) = mpsc::channel::<Vec<DetectedFace>>(queue_depth.max(1));
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = stop.clone();

    let thread = std::thread::Builder::new()
        .name("facewatch-detect".into())
        .spawn(move || {
            tracing::info!(tick_ms = tick.as_millis() as u64, "detection loop started");
            'outer: while !stop_flag.load(Ordering::SeqCst) {
                loop {
                    match rx.try_recv() {
                        Ok(batch) => match engine.process_faces(batch) {
                            Ok(outcomes) => log_outcomes(&outcomes),
                            Err(EngineError::ShutDown) => break 'outer,
                            Err(e) => tracing::warn!(error = %e, "batch failed"),
                        },
                        Err(TryRecvError::Empty) => break,
                        Err(TryRecvError::Disconnected) => break 'outer,
                    }
                }
                std::thread::sleep(tick);
            }
            tracing::info!("detection loop exiting");
        })?;

    Ok((FaceFeed { tx }, DetectionLoop { stop, thread }))
}

fn log_outcomes(outcomes: &[FaceOutcome]) {
    for outcome in outcomes {
        match outcome {
            FaceOutcome::Known {
                identity_id,
                label,
                distance,
                notified,
            } => tracing::debug!(identity_id = %identity_id, label = %label, distance, notified, "face matched"),
            FaceOutcome::Placeholder(id) => tracing::debug!(identity_id = %id, "face is new"),
            FaceOutcome::Skipped(_) => {}
            FaceOutcome::Failed(reason) => tracing::warn!(reason = %reason, "face not processed"),
        }
    }
}
