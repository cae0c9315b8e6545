use std::sync::Arc;
use std::time::Duration;

use facewatch_core::{IdentityId, IdentityStore, StoreError};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::placeholder::PlaceholderManager;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReapReport {
    pub purged: Vec<IdentityId>,
    pub forgotten_fingerprints: usize,
    pub dropped_pending: usize,
}

/// Delete expired placeholders and clear their in-memory traces.
/// Confirmed identities are never touched.
pub fn sweep(
    store: &IdentityStore,
    placeholders: &PlaceholderManager,
    max_age: chrono::Duration,
) -> Result<ReapReport, StoreError> {
    let purged = store.purge_temporary_older_than(max_age)?;
    let ids: Vec<IdentityId> = purged.iter().map(|p| p.id).collect();
    let fingerprints: Vec<_> = purged
        .iter()
        .flat_map(|p| p.fingerprints.iter().copied())
        .collect();

    let report = ReapReport {
        forgotten_fingerprints: placeholders.forget(&fingerprints),
        dropped_pending: placeholders.drop_orphans(&ids),
        purged: ids,
    };
    if !report.purged.is_empty() {
        tracing::info!(
            purged = report.purged.len(),
            forgotten = report.forgotten_fingerprints,
            dropped_pending = report.dropped_pending,
            "reaper sweep"
        );
    }
    Ok(report)
}

/// Run `sweep` every `interval` until `shutdown` flips to true.
pub fn spawn(
    store: Arc<IdentityStore>,
    placeholders: Arc<PlaceholderManager>,
    max_age: chrono::Duration,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = sweep(&store, &placeholders, max_age) {
                        tracing::error!(error = %e, "reaper sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("reaper stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::placeholder::tests::{clock, snapshot, vector};
    use crate::placeholder::{Offer, PlaceholderSettings};
    use facewatch_core::NewIdentity;

    fn setup() -> (
        Arc<facewatch_core::ManualClock>,
        Arc<IdentityStore>,
        Arc<PlaceholderManager>,
    ) {
        let clock = clock();
        let store = Arc::new(IdentityStore::open_in_memory(clock.clone()).unwrap());
        let placeholders = Arc::new(
            PlaceholderManager::new(
                store.clone(),
                clock.clone(),
                PlaceholderSettings {
                    enabled: true,
                    cooldown: Duration::ZERO,
                    allow_concurrent: true,
                },
            )
            .unwrap(),
        );
        (clock, store, placeholders)
    }

    #[test]
    fn test_sweep_removes_expired_placeholder() {
        let (clock, store, placeholders) = setup();
        let Offer::Created(pending) = placeholders.offer(&vector(0.1, 1.0), &snapshot()).unwrap()
        else {
            panic!("placeholder not created");
        };
        let alice = store
            .add_identity(NewIdentity::confirmed("Alice", Some("123".into())))
            .unwrap();
        let max_age = chrono::Duration::hours(24);

        clock.advance(max_age - chrono::Duration::seconds(1));
        assert_eq!(sweep(&store, &placeholders, max_age).unwrap(), ReapReport::default());
        assert!(store.get(pending.temp_identity_id).unwrap().is_some());

        clock.advance(chrono::Duration::seconds(2));
        let report = sweep(&store, &placeholders, max_age).unwrap();
        assert_eq!(report.purged, vec![pending.temp_identity_id]);
        assert_eq!(report.forgotten_fingerprints, 1);
        assert_eq!(report.dropped_pending, 1);
        assert!(store.get(pending.temp_identity_id).unwrap().is_none());
        assert!(store.get(alice.id).unwrap().is_some());

        // The face may be offered again once its placeholder is gone.
        assert!(matches!(
            placeholders.offer(&vector(0.1, 1.0), &snapshot()).unwrap(),
            Offer::Created(_)
        ));
    }

    #[tokio::test]
    async fn test_spawned_reaper_stops_on_signal() {
        let (_, store, placeholders) = setup();
        let (tx, rx) = watch::channel(false);
        let handle = spawn(
            store,
            placeholders,
            chrono::Duration::hours(24),
            Duration::from_millis(10),
            rx,
        );
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
