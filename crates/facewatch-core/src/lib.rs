//! facewatch-core: identity storage and matching for the face watcher.
//!
//! Keeps Confirmed and Temporary identities with their 128-dimensional face
//! embeddings in SQLite, and answers "which known identity is this face?"
//! from an in-memory snapshot of the Confirmed gallery.

pub mod clock;
pub mod matcher;
pub mod store;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use matcher::{EuclideanMatcher, GalleryEntry, Matcher};
pub use store::{
    IdentityStore, NewIdentity, PurgedIdentity, Settlement, StoreError, StoreStats,
};
pub use types::{
    DetectedFace, Embedding, Fingerprint, Identity, IdentityId, IdentityKind, MatchResult,
    Snapshot, SnapshotError, EMBEDDING_DIM,
};

/// Default SQLite database location (`$XDG_DATA_HOME/facewatch/faces.db`).
pub fn default_db_path() -> std::path::PathBuf {
    let data_dir = std::env::var("XDG_DATA_HOME")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            std::path::PathBuf::from(home).join(".local/share")
        });
    data_dir.join("facewatch").join("faces.db")
}
