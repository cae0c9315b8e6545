//! The engine object: owns every piece of identity state and wires the
//! per-face control flow together.
//!
//! `Engine::init` builds the components from `Config` and starts the
//! background work (resolution pool, reaper). `Engine::shutdown` stops the
//! reaper and drains the pool. Nothing lives in module-level statics.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use facewatch_core::{
    Clock, DetectedFace, Identity, IdentityId, IdentityStore, MatchResult, StoreError,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::{Config, ConfigError};
use crate::notify::{Notification, NotificationGate};
use crate::placeholder::{Offer, PlaceholderManager, PlaceholderSettings, SkipReason};
use crate::reaper::{self, ReapReport};
use crate::recognition::RecognitionService;
use crate::resolver::{self, ResolverContext, ResolverPool, ResolverStats};

const NOTIFICATION_QUEUE_DEPTH: usize = 16;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("engine is shut down")]
    ShutDown,
}

/// What happened to one detected face.
#[derive(Debug, Clone, PartialEq)]
pub enum FaceOutcome {
    Known {
        identity_id: IdentityId,
        label: String,
        distance: f32,
        notified: bool,
    },
    Placeholder(IdentityId),
    Skipped(SkipReason),
    Failed(String),
}

#[derive(Debug, Clone)]
struct Policy {
    match_threshold: f32,
    notifications_enabled: bool,
    notify_only_important: bool,
    notification_cooldown: Duration,
    resolution_enabled: bool,
    max_placeholder_age: chrono::Duration,
}

#[derive(Debug, Serialize)]
pub struct EngineStatus {
    pub version: &'static str,
    pub match_threshold: f32,
    pub identities: facewatch_core::StoreStats,
    pub pending_resolutions: usize,
    pub processed_fingerprints: usize,
    pub tracked_notifications: usize,
    pub faces_processed: u64,
    pub resolutions: resolver::ResolverCounts,
    pub resolution_enabled: bool,
    pub shut_down: bool,
}

pub struct Engine {
    policy: Policy,
    clock: Arc<dyn Clock>,
    store: Arc<IdentityStore>,
    placeholders: Arc<PlaceholderManager>,
    gate: NotificationGate,
    resolver: ResolverPool,
    notifications: mpsc::Sender<Notification>,
    reaper: Mutex<Option<JoinHandle<()>>>,
    reaper_stop: watch::Sender<bool>,
    faces_processed: AtomicU64,
    shut_down: AtomicBool,
}

impl Engine {
    /// Build the engine and start its background tasks on the current runtime.
    ///
    /// Returns the receiving end of the notification channel; the caller
    /// displays each notification and calls [`Engine::dismiss`] when done.
    pub fn init(
        config: &Config,
        store: Arc<IdentityStore>,
        service: Arc<dyn RecognitionService>,
        clock: Arc<dyn Clock>,
    ) -> Result<(Arc<Self>, mpsc::Receiver<Notification>), EngineError> {
        config.validate()?;

        let placeholders = Arc::new(PlaceholderManager::new(
            store.clone(),
            clock.clone(),
            PlaceholderSettings {
                enabled: config.auto_create_placeholders,
                cooldown: config.new_face_cooldown(),
                allow_concurrent: config.allow_concurrent_new_faces,
            },
        )?);
        placeholders.seed(store.fingerprints()?);

        let ctx = Arc::new(ResolverContext {
            store: store.clone(),
            placeholders: placeholders.clone(),
            service,
            timeout: config.recognition_timeout(),
            stats: ResolverStats::default(),
        });
        let resolver = ResolverPool::spawn(
            ctx,
            config.resolution_workers,
            config.resolution_queue_depth,
        );

        let (reaper_stop, stop_rx) = watch::channel(false);
        let reaper = reaper::spawn(
            store.clone(),
            placeholders.clone(),
            config.max_placeholder_age(),
            config.reap_interval(),
            stop_rx,
        );

        let (notifications, notification_rx) = mpsc::channel(NOTIFICATION_QUEUE_DEPTH);

        let engine = Arc::new(Self {
            policy: Policy {
                match_threshold: config.match_threshold,
                notifications_enabled: config.notifications_enabled,
                notify_only_important: config.notify_only_important,
                notification_cooldown: config.notification_cooldown(),
                resolution_enabled: config.resolution_enabled,
                max_placeholder_age: config.max_placeholder_age(),
            },
            store,
            placeholders,
            gate: NotificationGate::new(clock.clone()),
            clock,
            resolver,
            notifications,
            reaper: Mutex::new(Some(reaper)),
            reaper_stop,
            faces_processed: AtomicU64::new(0),
            shut_down: AtomicBool::new(false),
        });

        tracing::info!(
            threshold = config.match_threshold,
            processed = engine.placeholders.processed_count(),
            gallery = engine.store.gallery().len(),
            "engine initialized"
        );
        Ok((engine, notification_rx))
    }

    /// Stop the reaper and drain the resolution pool. In-flight recognition
    /// calls finish or time out; nothing new is accepted afterwards.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("engine shutting down");
        let _ = self.reaper_stop.send(true);
        let reaper = self.reaper.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = reaper {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "reaper task panicked");
            }
        }
        self.resolver.shutdown().await;
        tracing::info!("engine stopped");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Handle every face of one tick: match, then notify or create a placeholder.
    pub fn process_faces(&self, faces: Vec<DetectedFace>) -> Result<Vec<FaceOutcome>, EngineError> {
        if self.is_shut_down() {
            return Err(EngineError::ShutDown);
        }
        let outcomes = faces
            .into_iter()
            .map(|face| self.process_face(face))
            .collect::<Vec<_>>();
        self.faces_processed
            .fetch_add(outcomes.len() as u64, Ordering::Relaxed);
        Ok(outcomes)
    }

    fn process_face(&self, face: DetectedFace) -> FaceOutcome {
        if let Some(hit) = self
            .store
            .find_nearest(&face.embedding, self.policy.match_threshold)
        {
            let notified = self.maybe_notify(&hit);
            return FaceOutcome::Known {
                identity_id: hit.identity_id,
                label: hit.label,
                distance: hit.distance,
                notified,
            };
        }

        match self.placeholders.offer(&face.embedding, &face.snapshot) {
            Ok(Offer::Created(pending)) => {
                let id = pending.temp_identity_id;
                if self.policy.resolution_enabled {
                    self.resolver.submit(pending);
                } else {
                    resolver::settle_unresolved(
                        self.resolver.context(),
                        &pending,
                        "resolution disabled",
                    );
                }
                FaceOutcome::Placeholder(id)
            }
            Ok(Offer::Skipped(reason)) => {
                tracing::debug!(reason = reason.as_str(), "placeholder skipped");
                FaceOutcome::Skipped(reason)
            }
            Err(e) => {
                tracing::warn!(error = %e, "placeholder creation failed");
                FaceOutcome::Failed(e.to_string())
            }
        }
    }

    fn maybe_notify(&self, hit: &MatchResult) -> bool {
        if !self.policy.notifications_enabled
            || (self.policy.notify_only_important && !hit.important)
        {
            return false;
        }
        if !self
            .gate
            .should_show(&hit.label, self.policy.notification_cooldown)
        {
            tracing::debug!(label = %hit.label, "notification suppressed");
            return false;
        }

        let notification = Notification {
            identity_id: hit.identity_id,
            label: hit.label.clone(),
            secondary_id: hit.secondary_id.clone(),
            important: hit.important,
            distance: hit.distance,
            shown_at: self.clock.now(),
        };
        match self.notifications.try_send(notification) {
            Ok(()) => {
                tracing::info!(
                    identity_id = %hit.identity_id,
                    label = %hit.label,
                    distance = hit.distance,
                    "notification raised"
                );
                true
            }
            Err(e) => {
                // Nobody will display it, so nobody will release it.
                self.gate.release(&hit.label);
                tracing::warn!(label = %hit.label, error = %e, "notification dropped");
                false
            }
        }
    }

    /// The consumer closed the notification for `label`.
    pub fn dismiss(&self, label: &str) -> bool {
        self.gate.release(label)
    }

    pub fn reset_notifications(&self) -> usize {
        let n = self.gate.reset();
        tracing::info!(cleared = n, "notification state reset");
        n
    }

    pub fn status(&self) -> Result<EngineStatus, EngineError> {
        Ok(EngineStatus {
            version: env!("CARGO_PKG_VERSION"),
            match_threshold: self.policy.match_threshold,
            identities: self.store.stats()?,
            pending_resolutions: self.placeholders.pending_count(),
            processed_fingerprints: self.placeholders.processed_count(),
            tracked_notifications: self.gate.tracked(),
            faces_processed: self.faces_processed.load(Ordering::Relaxed),
            resolutions: self.resolver.context().stats.counts(),
            resolution_enabled: self.policy.resolution_enabled,
            shut_down: self.is_shut_down(),
        })
    }

    pub fn list_identities(&self, include_temporary: bool) -> Result<Vec<Identity>, EngineError> {
        Ok(self.store.list(include_temporary)?)
    }

    pub fn list_important(&self) -> Result<Vec<Identity>, EngineError> {
        Ok(self.store.list_important()?)
    }

    pub fn set_important(&self, id: IdentityId, important: bool) -> Result<bool, EngineError> {
        let found = self.store.set_important(id, important)?;
        tracing::info!(identity_id = %id, important, found, "important flag set");
        Ok(found)
    }

    /// Delete an identity. Its fingerprints stay in the processed set.
    pub fn delete_identity(&self, id: IdentityId) -> Result<bool, EngineError> {
        let deleted = self.store.delete(id)?;
        if deleted {
            self.placeholders.drop_orphans(&[id]);
            tracing::info!(identity_id = %id, "identity deleted");
        }
        Ok(deleted)
    }

    /// Delete every Temporary identity regardless of age.
    pub fn purge_temporary(&self) -> Result<usize, EngineError> {
        let purged = self.store.purge_all_temporary()?;
        let ids: Vec<IdentityId> = purged.iter().map(|p| p.id).collect();
        let fingerprints: Vec<_> = purged
            .iter()
            .flat_map(|p| p.fingerprints.iter().copied())
            .collect();
        self.placeholders.forget(&fingerprints);
        self.placeholders.drop_orphans(&ids);
        Ok(ids.len())
    }

    /// Run one reaper pass now.
    pub fn sweep(&self) -> Result<ReapReport, EngineError> {
        Ok(reaper::sweep(
            &self.store,
            &self.placeholders,
            self.policy.max_placeholder_age,
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::placeholder::tests::{clock, snapshot, vector};
    use crate::recognition::{Recognition, RecognitionError};
    use async_trait::async_trait;
    use facewatch_core::{IdentityKind, ManualClock, NewIdentity, Snapshot};

    struct NamesEveryone;

    #[async_trait]
    impl RecognitionService for NamesEveryone {
        async fn recognize(&self, _: &Snapshot) -> Result<Recognition, RecognitionError> {
            Ok(Recognition {
                label: "Dave".into(),
                secondary_id: "789".into(),
                confidence: None,
            })
        }
    }

    fn config() -> Config {
        Config {
            match_threshold: 0.40,
            ..Config::default()
        }
    }

    fn engine_with(
        config: Config,
    ) -> (
        Arc<ManualClock>,
        Arc<IdentityStore>,
        Arc<Engine>,
        mpsc::Receiver<Notification>,
    ) {
        let clock = clock();
        let store = Arc::new(IdentityStore::open_in_memory(clock.clone()).unwrap());
        let (engine, rx) =
            Engine::init(&config, store.clone(), Arc::new(NamesEveryone), clock.clone()).unwrap();
        (clock, store, engine, rx)
    }

    fn face(x: f32, tag: f32) -> DetectedFace {
        DetectedFace {
            embedding: vector(x, tag),
            snapshot: snapshot(),
        }
    }

    fn alice(store: &IdentityStore, important: bool) -> IdentityId {
        let alice = store
            .add_identity(NewIdentity::confirmed("Alice", Some("123".into())))
            .unwrap();
        store.add_embedding(alice.id, &vector(0.0, 1.0)).unwrap();
        store.set_important(alice.id, important).unwrap();
        alice.id
    }

    #[tokio::test]
    async fn test_threshold_boundary() {
        let (_, store, engine, _rx) = engine_with(Config {
            auto_create_placeholders: false,
            ..config()
        });
        let alice_id = alice(&store, false);

        let outcomes = engine
            .process_faces(vec![face(0.39, 1.0), face(0.41, 1.0)])
            .unwrap();
        assert!(matches!(
            &outcomes[0],
            FaceOutcome::Known { identity_id, .. } if *identity_id == alice_id
        ));
        assert_eq!(outcomes[1], FaceOutcome::Skipped(SkipReason::Disabled));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_important_match_notifies_once() {
        let (clock, store, engine, mut rx) = engine_with(config());
        alice(&store, true);

        let first = engine.process_faces(vec![face(0.1, 1.0)]).unwrap();
        assert!(matches!(first[0], FaceOutcome::Known { notified: true, .. }));
        let note = rx.try_recv().unwrap();
        assert_eq!(note.label, "Alice");

        // Same frame burst and after a close within cooldown: nothing new.
        let again = engine.process_faces(vec![face(0.1, 1.0)]).unwrap();
        assert!(matches!(again[0], FaceOutcome::Known { notified: false, .. }));
        assert!(engine.dismiss("Alice"));
        clock.advance(chrono::Duration::seconds(10));
        engine.process_faces(vec![face(0.1, 1.0)]).unwrap();
        assert!(rx.try_recv().is_err());

        clock.advance(chrono::Duration::seconds(25));
        let later = engine.process_faces(vec![face(0.1, 1.0)]).unwrap();
        assert!(matches!(later[0], FaceOutcome::Known { notified: true, .. }));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_unimportant_match_is_quiet() {
        let (_, store, engine, mut rx) = engine_with(config());
        alice(&store, false);
        engine.process_faces(vec![face(0.1, 1.0)]).unwrap();
        assert!(rx.try_recv().is_err());
        engine.shutdown().await;

        let (_, store, engine, mut rx) = engine_with(Config {
            notify_only_important: false,
            ..config()
        });
        alice(&store, false);
        engine.process_faces(vec![face(0.1, 1.0)]).unwrap();
        assert!(rx.try_recv().is_ok());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_face_is_created_once_and_resolved() {
        let (_, store, engine, _rx) = engine_with(config());

        let outcomes = engine
            .process_faces(vec![face(5.0, 2.0), face(5.0, 2.0)])
            .unwrap();
        let FaceOutcome::Placeholder(temp_id) = outcomes[0] else {
            panic!("expected placeholder, got {:?}", outcomes[0]);
        };
        assert_eq!(outcomes[1], FaceOutcome::Skipped(SkipReason::Cooldown));

        engine.shutdown().await;
        let identity = store.get(temp_id).unwrap().unwrap();
        assert_eq!(identity.kind, IdentityKind::Confirmed);
        assert_eq!(identity.label, "Dave");
        assert_eq!(engine.status().unwrap().pending_resolutions, 0);
    }

    #[tokio::test]
    async fn test_resolution_disabled_releases_single_flight() {
        let (clock, store, engine, _rx) = engine_with(Config {
            resolution_enabled: false,
            ..config()
        });
        engine.process_faces(vec![face(5.0, 2.0)]).unwrap();
        clock.advance(chrono::Duration::seconds(3));
        let second = engine.process_faces(vec![face(9.0, 2.0)]).unwrap();
        assert!(matches!(second[0], FaceOutcome::Placeholder(_)));

        let stats = store.stats().unwrap();
        assert_eq!(stats.temporary, 2);
        assert_eq!(engine.status().unwrap().resolutions.unresolved, 2);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_processed_set_seeded_from_store() {
        let clock = clock();
        let store = Arc::new(IdentityStore::open_in_memory(clock.clone()).unwrap());
        store
            .create_temporary("unknown1", "TEMP123456", &vector(5.0, 2.0), &snapshot())
            .unwrap();
        let (engine, _rx) =
            Engine::init(&config(), store, Arc::new(NamesEveryone), clock).unwrap();

        let outcomes = engine.process_faces(vec![face(5.0, 2.0)]).unwrap();
        assert_eq!(outcomes[0], FaceOutcome::Skipped(SkipReason::AlreadyProcessed));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_operator_actions() {
        let (_, store, engine, _rx) = engine_with(Config {
            resolution_enabled: false,
            ..config()
        });
        let alice_id = alice(&store, false);
        engine.process_faces(vec![face(5.0, 2.0)]).unwrap();

        assert!(engine.set_important(alice_id, true).unwrap());
        assert_eq!(engine.list_important().unwrap().len(), 1);
        assert_eq!(engine.list_identities(false).unwrap().len(), 1);
        assert_eq!(engine.list_identities(true).unwrap().len(), 2);

        assert_eq!(engine.purge_temporary().unwrap(), 1);
        assert_eq!(engine.status().unwrap().processed_fingerprints, 0);
        assert!(engine.delete_identity(alice_id).unwrap());
        assert!(!engine.delete_identity(alice_id).unwrap());
        assert_eq!(engine.sweep().unwrap(), ReapReport::default());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_rejects_work() {
        let (_, _, engine, _rx) = engine_with(config());
        engine.shutdown().await;
        engine.shutdown().await;
        assert!(matches!(
            engine.process_faces(vec![face(5.0, 2.0)]),
            Err(EngineError::ShutDown)
        ));
        assert!(engine.status().unwrap().shut_down);
    }

    #[test]
    fn test_init_rejects_invalid_config() {
        let clock = clock();
        let store = Arc::new(IdentityStore::open_in_memory(clock.clone()).unwrap());
        let result = Engine::init(
            &Config {
                resolution_workers: 0,
                ..config()
            },
            store,
            Arc::new(NamesEveryone),
            clock,
        );
        assert!(matches!(result, Err(EngineError::Config(_))));
    }
}
