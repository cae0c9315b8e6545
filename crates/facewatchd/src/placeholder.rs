//! Placeholder ("temporary") identities for faces that match nothing.
//!
//! All gates and the store write run under one lock, so two offers of the
//! same vector can never both pass the processed-set check.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use facewatch_core::{
    Clock, Embedding, Fingerprint, IdentityId, IdentityStore, Snapshot, StoreError,
};
use rand::Rng;

const PLACEHOLDER_PREFIX: &str = "unknown";

/// `N` from a placeholder label of the form `unknownN`.
fn placeholder_number(label: &str) -> Option<u64> {
    let digits = label.strip_prefix(PLACEHOLDER_PREFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Knobs read from `Config` at engine init.
#[derive(Debug, Clone)]
pub struct PlaceholderSettings {
    pub enabled: bool,
    pub cooldown: Duration,
    pub allow_concurrent: bool,
}

/// A placeholder waiting for the recognition service.
#[derive(Debug, Clone)]
pub struct PendingResolution {
    pub fingerprint: Fingerprint,
    pub temp_identity_id: IdentityId,
    pub snapshot: Snapshot,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Disabled,
    Cooldown,
    AlreadyProcessed,
    InFlight,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::Cooldown => "cooldown",
            Self::AlreadyProcessed => "already_processed",
            Self::InFlight => "in_flight",
        }
    }
}

#[derive(Debug)]
pub enum Offer {
    Created(PendingResolution),
    Skipped(SkipReason),
}

#[derive(Default)]
struct State {
    last_accepted_at: Option<DateTime<Utc>>,
    processed: HashSet<Fingerprint>,
    pending: HashMap<Fingerprint, PendingResolution>,
    counter: u64,
}

pub struct PlaceholderManager {
    store: Arc<IdentityStore>,
    clock: Arc<dyn Clock>,
    settings: PlaceholderSettings,
    state: Mutex<State>,
}

impl PlaceholderManager {
    pub fn new(
        store: Arc<IdentityStore>,
        clock: Arc<dyn Clock>,
        settings: PlaceholderSettings,
    ) -> Result<Self, StoreError> {
        let counter = store
            .list(true)?
            .iter()
            .filter_map(|identity| placeholder_number(&identity.label))
            .max()
            .unwrap_or(0);
        Ok(Self {
            store,
            clock,
            settings,
            state: Mutex::new(State {
                counter,
                ..State::default()
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Mark fingerprints as already seen, e.g. every vector in the store at startup.
    pub fn seed(&self, fingerprints: impl IntoIterator<Item = Fingerprint>) {
        let mut state = self.lock();
        state.processed.extend(fingerprints);
        tracing::debug!(processed = state.processed.len(), "processed set seeded");
    }

    /// Run the dedup gates and, if they all pass, persist a new Temporary
    /// identity with its embedding and snapshot.
    pub fn offer(&self, embedding: &Embedding, snapshot: &Snapshot) -> Result<Offer, StoreError> {
        if !self.settings.enabled {
            return Ok(Offer::Skipped(SkipReason::Disabled));
        }

        let now = self.clock.now();
        let fingerprint = embedding.fingerprint();
        let mut state = self.lock();

        if let Some(last) = state.last_accepted_at {
            let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
            if elapsed < self.settings.cooldown {
                return Ok(Offer::Skipped(SkipReason::Cooldown));
            }
        }
        if state.processed.contains(&fingerprint) {
            return Ok(Offer::Skipped(SkipReason::AlreadyProcessed));
        }
        if !self.settings.allow_concurrent && !state.pending.is_empty() {
            return Ok(Offer::Skipped(SkipReason::InFlight));
        }

        let label = format!("{PLACEHOLDER_PREFIX}{}", state.counter + 1);
        let secondary_id = format!("TEMP{}", rand::thread_rng().gen_range(100_000..1_000_000));
        let identity = match self
            .store
            .create_temporary(&label, &secondary_id, embedding, snapshot)
        {
            Ok(identity) => identity,
            Err(StoreError::DuplicateEmbedding(fp)) => {
                // Stored by someone else (e.g. an operator import) since startup.
                state.processed.insert(fp);
                return Ok(Offer::Skipped(SkipReason::AlreadyProcessed));
            }
            Err(e) => return Err(e),
        };

        state.counter += 1;
        state.last_accepted_at = Some(now);
        state.processed.insert(fingerprint);
        let pending = PendingResolution {
            fingerprint,
            temp_identity_id: identity.id,
            snapshot: snapshot.clone(),
            created_at: now,
        };
        state.pending.insert(fingerprint, pending.clone());

        tracing::info!(
            identity_id = %identity.id,
            label = %identity.label,
            fingerprint = %fingerprint,
            "placeholder created"
        );
        Ok(Offer::Created(pending))
    }

    /// Remove and return the pending entry. Exactly one caller ever gets `Some`.
    pub fn take_pending(&self, fingerprint: Fingerprint) -> Option<PendingResolution> {
        self.lock().pending.remove(&fingerprint)
    }

    /// Drop fingerprints from the processed set so the faces can be offered again.
    pub fn forget(&self, fingerprints: &[Fingerprint]) -> usize {
        let mut state = self.lock();
        fingerprints
            .iter()
            .filter(|fp| state.processed.remove(fp))
            .count()
    }

    /// Drop pending entries whose placeholder no longer exists.
    pub fn drop_orphans(&self, ids: &[IdentityId]) -> usize {
        let mut state = self.lock();
        let before = state.pending.len();
        state
            .pending
            .retain(|_, p| !ids.contains(&p.temp_identity_id));
        before - state.pending.len()
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn processed_count(&self) -> usize {
        self.lock().processed.len()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use facewatch_core::{ManualClock, NewIdentity, EMBEDDING_DIM};

    pub(crate) const JPEG: [u8; 12] = [
        0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F', 0x00, 0x01,
    ];

    pub(crate) fn snapshot() -> Snapshot {
        Snapshot::new(JPEG.to_vec()).unwrap()
    }

    pub(crate) fn vector(x: f32, tag: f32) -> Embedding {
        let mut values = vec![0.0; EMBEDDING_DIM];
        values[0] = x;
        values[1] = tag;
        Embedding::new(values)
    }

    pub(crate) fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        ))
    }

    fn settings() -> PlaceholderSettings {
        PlaceholderSettings {
            enabled: true,
            cooldown: Duration::from_secs(2),
            allow_concurrent: true,
        }
    }

    fn manager(clock: Arc<ManualClock>, settings: PlaceholderSettings) -> PlaceholderManager {
        let store = Arc::new(IdentityStore::open_in_memory(clock.clone()).unwrap());
        PlaceholderManager::new(store, clock, settings).unwrap()
    }

    fn created(offer: Offer) -> PendingResolution {
        match offer {
            Offer::Created(p) => p,
            Offer::Skipped(reason) => panic!("expected a placeholder, skipped: {reason:?}"),
        }
    }

    fn skipped(offer: Offer) -> SkipReason {
        match offer {
            Offer::Skipped(reason) => reason,
            Offer::Created(p) => panic!("expected a skip, created {:?}", p.temp_identity_id),
        }
    }

    #[test]
    fn test_offer_creates_temporary_identity() {
        let clock = clock();
        let mgr = manager(clock, settings());
        let pending = created(mgr.offer(&vector(0.1, 1.0), &snapshot()).unwrap());

        let identity = mgr.store.get(pending.temp_identity_id).unwrap().unwrap();
        assert!(identity.is_temporary());
        assert_eq!(identity.label, "unknown1");
        let sid = identity.secondary_id.unwrap();
        assert!(sid.starts_with("TEMP") && sid.len() == 10, "{sid}");
        assert_eq!(pending.fingerprint, vector(0.1, 1.0).fingerprint());
        assert_eq!(mgr.pending_count(), 1);
        assert_eq!(mgr.store.latest_snapshot(identity.id).unwrap(), Some(snapshot()));
    }

    #[test]
    fn test_same_face_twice_within_cooldown() {
        let clock = clock();
        let mgr = manager(clock.clone(), settings());
        created(mgr.offer(&vector(0.1, 1.0), &snapshot()).unwrap());
        assert_eq!(
            skipped(mgr.offer(&vector(0.1, 1.0), &snapshot()).unwrap()),
            SkipReason::Cooldown
        );
        assert_eq!(mgr.store.stats().unwrap().temporary, 1);
    }

    #[test]
    fn test_processed_set_outlives_cooldown() {
        let clock = clock();
        let mgr = manager(clock.clone(), settings());
        created(mgr.offer(&vector(0.1, 1.0), &snapshot()).unwrap());
        clock.advance(chrono::Duration::seconds(3));

        assert_eq!(
            skipped(mgr.offer(&vector(0.1, 1.0), &snapshot()).unwrap()),
            SkipReason::AlreadyProcessed
        );
        let second = created(mgr.offer(&vector(0.5, 1.0), &snapshot()).unwrap());
        let identity = mgr.store.get(second.temp_identity_id).unwrap().unwrap();
        assert_eq!(identity.label, "unknown2");
    }

    #[test]
    fn test_single_flight_guard() {
        let clock = clock();
        let mgr = manager(
            clock.clone(),
            PlaceholderSettings {
                allow_concurrent: false,
                ..settings()
            },
        );
        let first = created(mgr.offer(&vector(0.1, 1.0), &snapshot()).unwrap());
        clock.advance(chrono::Duration::seconds(3));
        assert_eq!(
            skipped(mgr.offer(&vector(0.5, 1.0), &snapshot()).unwrap()),
            SkipReason::InFlight
        );

        assert!(mgr.take_pending(first.fingerprint).is_some());
        created(mgr.offer(&vector(0.5, 1.0), &snapshot()).unwrap());
    }

    #[test]
    fn test_disabled() {
        let clock = clock();
        let mgr = manager(
            clock,
            PlaceholderSettings {
                enabled: false,
                ..settings()
            },
        );
        assert_eq!(
            skipped(mgr.offer(&vector(0.1, 1.0), &snapshot()).unwrap()),
            SkipReason::Disabled
        );
        assert_eq!(mgr.processed_count(), 0);
    }

    #[test]
    fn test_seeded_fingerprints_are_skipped() {
        let clock = clock();
        let mgr = manager(clock, settings());
        mgr.seed([vector(0.1, 1.0).fingerprint()]);
        assert_eq!(
            skipped(mgr.offer(&vector(0.1, 1.0), &snapshot()).unwrap()),
            SkipReason::AlreadyProcessed
        );
    }

    #[test]
    fn test_vector_already_in_store_is_skipped() {
        let clock = clock();
        let mgr = manager(clock, settings());
        let alice = mgr
            .store
            .add_identity(NewIdentity::confirmed("Alice", Some("123".into())))
            .unwrap();
        mgr.store.add_embedding(alice.id, &vector(0.1, 1.0)).unwrap();

        assert_eq!(
            skipped(mgr.offer(&vector(0.1, 1.0), &snapshot()).unwrap()),
            SkipReason::AlreadyProcessed
        );
        assert_eq!(mgr.store.stats().unwrap().temporary, 0);
        assert_eq!(mgr.processed_count(), 1);
    }

    #[test]
    fn test_take_pending_is_exactly_once() {
        let clock = clock();
        let mgr = manager(clock, settings());
        let pending = created(mgr.offer(&vector(0.1, 1.0), &snapshot()).unwrap());
        assert!(mgr.take_pending(pending.fingerprint).is_some());
        assert!(mgr.take_pending(pending.fingerprint).is_none());
    }

    #[test]
    fn test_forget_and_drop_orphans() {
        let clock = clock();
        let mgr = manager(clock, settings());
        let pending = created(mgr.offer(&vector(0.1, 1.0), &snapshot()).unwrap());

        assert_eq!(mgr.drop_orphans(&[IdentityId(999)]), 0);
        assert_eq!(mgr.drop_orphans(&[pending.temp_identity_id]), 1);
        assert_eq!(mgr.pending_count(), 0);

        assert_eq!(mgr.forget(&[pending.fingerprint]), 1);
        assert_eq!(mgr.processed_count(), 0);
    }

    #[test]
    fn test_label_counter_continues_from_store() {
        let clock = clock();
        let store = Arc::new(IdentityStore::open_in_memory(clock.clone()).unwrap());
        let first = store
            .create_temporary("unknown1", "TEMP100000", &vector(0.9, 9.0), &snapshot())
            .unwrap();
        store
            .create_temporary("unknown3", "TEMP100001", &vector(0.8, 9.0), &snapshot())
            .unwrap();
        // One temporary left, but unknown3 is still live.
        store.promote(first.id, "Dave", Some("789")).unwrap();

        let mgr = PlaceholderManager::new(store, clock, settings()).unwrap();
        let pending = created(mgr.offer(&vector(0.1, 1.0), &snapshot()).unwrap());
        let identity = mgr.store.get(pending.temp_identity_id).unwrap().unwrap();
        assert_eq!(identity.label, "unknown4");
    }

    #[test]
    fn test_placeholder_number() {
        assert_eq!(placeholder_number("unknown12"), Some(12));
        assert_eq!(placeholder_number("unknown"), None);
        assert_eq!(placeholder_number("unknown+3"), None);
        assert_eq!(placeholder_number("Dave"), None);
    }
}
