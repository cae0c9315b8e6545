//! Nearest Confirmed identity lookup over an in-memory gallery.

use crate::types::{Embedding, IdentityId, MatchResult};
use chrono::{DateTime, Utc};

/// One Confirmed embedding together with the identity fields a match reports.
#[derive(Debug, Clone)]
pub struct GalleryEntry {
    pub identity_id: IdentityId,
    pub label: String,
    pub secondary_id: Option<String>,
    pub important: bool,
    /// Identity creation time, used to break distance ties.
    pub created_at: DateTime<Utc>,
    pub embedding: Embedding,
}

impl GalleryEntry {
    /// Ordering key for tie-breaks: earliest-created identity first.
    fn seniority(&self) -> (DateTime<Utc>, IdentityId) {
        (self.created_at, self.identity_id)
    }
}

/// Strategy for comparing a query embedding against a gallery of known faces.
pub trait Matcher {
    fn best_match(
        &self,
        query: &Embedding,
        gallery: &[GalleryEntry],
        threshold: f32,
    ) -> Option<MatchResult>;
}

/// Euclidean distance matcher.
///
/// A match requires `distance < threshold`; a distance exactly at the
/// threshold is rejected. Equal minimum distances resolve to the identity
/// created earliest, so results do not depend on gallery order.
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn best_match(
        &self,
        query: &Embedding,
        gallery: &[GalleryEntry],
        threshold: f32,
    ) -> Option<MatchResult> {
        let mut best: Option<(&GalleryEntry, f32)> = None;

        for entry in gallery {
            if entry.embedding.len() != query.len() {
                continue;
            }
            let dist = query.euclidean_distance(&entry.embedding);
            if dist.is_nan() {
                continue;
            }
            let is_better = match best {
                None => true,
                Some((prev, prev_dist)) => {
                    dist < prev_dist
                        || (dist == prev_dist && entry.seniority() < prev.seniority())
                }
            };
            if is_better {
                best = Some((entry, dist));
            }
        }

        match best {
            Some((entry, dist)) if dist < threshold => Some(MatchResult {
                identity_id: entry.identity_id,
                distance: dist,
                label: entry.label.clone(),
                secondary_id: entry.secondary_id.clone(),
                important: entry.important,
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: i64, label: &str, created_secs: i64, values: Vec<f32>) -> GalleryEntry {
        GalleryEntry {
            identity_id: IdentityId(id),
            label: label.into(),
            secondary_id: None,
            important: false,
            created_at: DateTime::from_timestamp(created_secs, 0).unwrap(),
            embedding: Embedding::new(values),
        }
    }

    #[test]
    fn test_best_match_scans_whole_gallery() {
        // Best match is the last entry.
        let query = Embedding::new(vec![1.0, 0.0, 0.0]);
        let gallery = vec![
            entry(1, "decoy1", 0, vec![0.0, 1.0, 0.0]),
            entry(2, "decoy2", 0, vec![0.0, 0.0, 1.0]),
            entry(3, "match", 0, vec![0.9, 0.0, 0.0]),
        ];

        let result = EuclideanMatcher.best_match(&query, &gallery, 0.5).unwrap();
        assert_eq!(result.identity_id, IdentityId(3));
        assert_eq!(result.label, "match");
        assert!((result.distance - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_threshold_is_strict() {
        let query = Embedding::new(vec![0.0, 0.0]);
        let gallery = vec![entry(1, "a", 0, vec![0.5, 0.0])];

        assert!(EuclideanMatcher.best_match(&query, &gallery, 0.5).is_none());
        assert!(EuclideanMatcher.best_match(&query, &gallery, 0.5001).is_some());
    }

    #[test]
    fn test_scenario_threshold_040() {
        let query = Embedding::new(vec![0.0, 0.0]);
        let near = vec![entry(1, "a", 0, vec![0.39, 0.0])];
        let far = vec![entry(1, "a", 0, vec![0.41, 0.0])];

        assert_eq!(
            EuclideanMatcher.best_match(&query, &near, 0.40).map(|m| m.identity_id),
            Some(IdentityId(1))
        );
        assert!(EuclideanMatcher.best_match(&query, &far, 0.40).is_none());
    }

    #[test]
    fn test_tie_goes_to_earliest_identity() {
        let query = Embedding::new(vec![0.0, 0.0]);
        let gallery = vec![
            entry(7, "newer", 200, vec![0.0, 0.2]),
            entry(9, "older", 100, vec![0.2, 0.0]),
        ];
        let result = EuclideanMatcher.best_match(&query, &gallery, 0.5).unwrap();
        assert_eq!(result.label, "older");

        let reversed: Vec<_> = gallery.into_iter().rev().collect();
        let result = EuclideanMatcher.best_match(&query, &reversed, 0.5).unwrap();
        assert_eq!(result.label, "older");
    }

    #[test]
    fn test_mismatched_dimension_is_ignored() {
        let query = Embedding::new(vec![0.0, 0.0]);
        let gallery = vec![entry(1, "short", 0, vec![0.0])];
        assert!(EuclideanMatcher.best_match(&query, &gallery, 1.0).is_none());
    }

    #[test]
    fn test_empty_gallery() {
        let query = Embedding::new(vec![1.0, 0.0]);
        assert!(EuclideanMatcher.best_match(&query, &[], 0.5).is_none());
    }
}
