use std::sync::Arc;

use facewatch_core::{DetectedFace, Embedding, IdentityId, Snapshot, EMBEDDING_DIM};
use zbus::interface;

use crate::engine::{Engine, EngineError};
use crate::monitor::FaceFeed;

pub const BUS_NAME: &str = "org.facewatch.Monitor1";
pub const OBJECT_PATH: &str = "/org/facewatch/Monitor1";

/// D-Bus interface for the facewatch daemon.
///
/// Bus name: org.facewatch.Monitor1
/// Object path: /org/facewatch/Monitor1
pub struct FacewatchService {
    pub engine: Arc<Engine>,
    pub feed: FaceFeed,
}

fn failed(e: EngineError) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(e.to_string())
}

fn to_json<T: serde::Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

/// Build a face from wire values, rejecting wrong sizes and unreadable images.
fn decode_face(embedding: Vec<f64>, snapshot: Vec<u8>) -> zbus::fdo::Result<DetectedFace> {
    if embedding.len() != EMBEDDING_DIM {
        return Err(zbus::fdo::Error::InvalidArgs(format!(
            "embedding must have {EMBEDDING_DIM} values, got {}",
            embedding.len()
        )));
    }
    // Checked after narrowing: a finite f64 can still overflow f32.
    let values: Vec<f32> = embedding.into_iter().map(|v| v as f32).collect();
    if values.iter().any(|v| !v.is_finite()) {
        return Err(zbus::fdo::Error::InvalidArgs(
            "embedding contains non-finite values".into(),
        ));
    }
    let snapshot =
        Snapshot::new(snapshot).map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))?;
    Ok(DetectedFace {
        embedding: Embedding::new(values),
        snapshot,
    })
}

#[interface(name = "org.facewatch.Monitor1")]
impl FacewatchService {
    /// Queue one detected face for the next detection tick.
    async fn submit_face(&self, embedding: Vec<f64>, snapshot: Vec<u8>) -> zbus::fdo::Result<bool> {
        if self.engine.is_shut_down() {
            return Err(failed(EngineError::ShutDown));
        }
        let face = decode_face(embedding, snapshot)?;
        Ok(self.feed.submit(vec![face]))
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        to_json(&self.engine.status().map_err(failed)?)
    }

    async fn list_identities(&self, all: bool) -> zbus::fdo::Result<String> {
        tracing::info!(all, "list_identities requested");
        to_json(&self.engine.list_identities(all).map_err(failed)?)
    }

    async fn list_important(&self) -> zbus::fdo::Result<String> {
        to_json(&self.engine.list_important().map_err(failed)?)
    }

    async fn set_important(&self, id: i64, important: bool) -> zbus::fdo::Result<bool> {
        tracing::info!(id, important, "set_important requested");
        self.engine
            .set_important(IdentityId(id), important)
            .map_err(failed)
    }

    async fn delete_identity(&self, id: i64) -> zbus::fdo::Result<bool> {
        tracing::info!(id, "delete_identity requested");
        self.engine.delete_identity(IdentityId(id)).map_err(failed)
    }

    /// Delete every temporary identity. Returns how many were removed.
    async fn purge_temporary(&self) -> zbus::fdo::Result<u32> {
        tracing::info!("purge_temporary requested");
        let n = self.engine.purge_temporary().map_err(failed)?;
        Ok(u32::try_from(n).unwrap_or(u32::MAX))
    }

    async fn reset_notifications(&self) -> zbus::fdo::Result<u32> {
        let n = self.engine.reset_notifications();
        Ok(u32::try_from(n).unwrap_or(u32::MAX))
    }

    /// Mark the notification for `label` as closed.
    async fn dismiss(&self, label: &str) -> zbus::fdo::Result<bool> {
        Ok(self.engine.dismiss(label))
    }

    /// Run a reaper pass now. Returns the number of expired placeholders removed.
    async fn sweep(&self) -> zbus::fdo::Result<u32> {
        tracing::info!("sweep requested");
        let report = self.engine.sweep().map_err(failed)?;
        Ok(u32::try_from(report.purged.len()).unwrap_or(u32::MAX))
    }
}
