//! Nearest-neighbour identity matching by cosine distance.

use crate::types::{Embedding, Gallery};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchError {
    #[error("embedding dimension mismatch: probe has {probe}, stored embedding has {stored}")]
    DimensionMismatch { probe: usize, stored: usize },
}

/// Result of matching a probe embedding against a gallery.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    Matched { identity_id: String, distance: f32 },
    NoMatch,
}

impl MatchOutcome {
    pub fn identity_id(&self) -> Option<&str> {
        match self {
            MatchOutcome::Matched { identity_id, .. } => Some(identity_id),
            MatchOutcome::NoMatch => None,
        }
    }

    pub fn distance(&self) -> Option<f32> {
        match self {
            MatchOutcome::Matched { distance, .. } => Some(*distance),
            MatchOutcome::NoMatch => None,
        }
    }
}

/// Cosine distance `1 - cos(a, b)`, clamped to [0, 2]. Lower = more similar.
pub fn cosine_distance(a: &Embedding, b: &Embedding) -> f32 {
    (1.0 - a.similarity(b)).clamp(0.0, 2.0)
}

/// Threshold-gated cosine matcher.
///
/// The threshold is call-site configuration: recognition, checkout
/// confirmation and duplicate detection each construct their own matcher.
#[derive(Debug, Clone, Copy)]
pub struct FaceMatcher {
    threshold: f32,
}

impl FaceMatcher {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Find the identity whose closest embedding is nearest to `probe`.
    ///
    /// Every embedding of every identity is compared; an identity scores its
    /// minimum distance. The global minimum wins if it is strictly below the
    /// threshold. Equal distances keep the first identity in gallery order.
    pub fn find_match(&self, probe: &Embedding, gallery: &Gallery) -> Result<MatchOutcome, MatchError> {
        let mut best: Option<(&str, f32)> = None;

        for entry in gallery.iter() {
            let Some(distance) = min_distance(probe, &entry.embeddings)? else {
                continue;
            };
            tracing::debug!(identity = %entry.identity_id, distance, "candidate distance");
            let is_better = match best {
                None => true,
                Some((_, d)) => distance < d,
            };
            if is_better {
                best = Some((&entry.identity_id, distance));
            }
        }

        Ok(match best {
            Some((identity_id, distance)) if distance < self.threshold => MatchOutcome::Matched {
                identity_id: identity_id.to_string(),
                distance,
            },
            _ => MatchOutcome::NoMatch,
        })
    }

    /// Confirm that `probe` belongs to an already-claimed identity.
    ///
    /// True iff the minimum distance to any of `expected` is below the
    /// threshold. An empty reference set never verifies.
    pub fn verify(&self, probe: &Embedding, expected: &[Embedding]) -> Result<bool, MatchError> {
        Ok(min_distance(probe, expected)?.is_some_and(|d| d < self.threshold))
    }
}

/// Minimum cosine distance from `probe` to any of `embeddings`, or `None`
/// when `embeddings` is empty.
fn min_distance(probe: &Embedding, embeddings: &[Embedding]) -> Result<Option<f32>, MatchError> {
    let mut best: Option<f32> = None;
    for stored in embeddings {
        if stored.dimension() != probe.dimension() {
            return Err(MatchError::DimensionMismatch {
                probe: probe.dimension(),
                stored: stored.dimension(),
            });
        }
        let d = cosine_distance(probe, stored);
        best = Some(best.map_or(d, |b| b.min(d)));
    }
    Ok(best)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    /// Unit vector at `deg` degrees in the plane: distance to (1, 0) is 1 - cos(deg).
    fn at_angle(deg: f32) -> Embedding {
        let r = deg.to_radians();
        emb(&[r.cos(), r.sin()])
    }

    /// Angle whose cosine distance from (1, 0) equals `d`.
    fn angle_for_distance(d: f32) -> f32 {
        (1.0 - d).acos().to_degrees()
    }

    #[test]
    fn test_self_distance_is_zero() {
        for v in [vec![1.0, 2.0, 3.0], vec![-0.3, 0.9], vec![0.1; 512]] {
            let a = Embedding::new(v);
            assert!(cosine_distance(&a, &a).abs() < 1e-6);
        }
    }

    #[test]
    fn test_distance_range() {
        let a = emb(&[1.0, 0.0]);
        assert!((cosine_distance(&a, &emb(&[-1.0, 0.0])) - 2.0).abs() < 1e-6);
        assert!((cosine_distance(&a, &emb(&[0.0, 1.0])) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_match_within_threshold() {
        let probe = emb(&[1.0, 0.0]);
        let mut gallery = Gallery::new();
        gallery.insert("S1", vec![at_angle(angle_for_distance(0.4))]);

        let outcome = FaceMatcher::new(0.6).find_match(&probe, &gallery).unwrap();
        assert_eq!(outcome.identity_id(), Some("S1"));
        assert!((outcome.distance().unwrap() - 0.4).abs() < 1e-4);
    }

    #[test]
    fn test_no_match_above_threshold() {
        let probe = emb(&[1.0, 0.0]);
        let mut gallery = Gallery::new();
        gallery.insert("S1", vec![at_angle(angle_for_distance(0.4))]);

        let outcome = FaceMatcher::new(0.3).find_match(&probe, &gallery).unwrap();
        assert_eq!(outcome, MatchOutcome::NoMatch);
        assert_eq!(outcome.identity_id(), None);
        assert_eq!(outcome.distance(), None);
    }

    #[test]
    fn test_identity_scores_its_closest_embedding() {
        // S1's second pose is the closest embedding overall.
        let probe = emb(&[1.0, 0.0]);
        let mut gallery = Gallery::new();
        gallery.insert("S1", vec![at_angle(80.0), at_angle(5.0)]);
        gallery.insert("S2", vec![at_angle(20.0)]);

        let outcome = FaceMatcher::new(0.6).find_match(&probe, &gallery).unwrap();
        assert_eq!(outcome.identity_id(), Some("S1"));
        let expected = cosine_distance(&probe, &at_angle(5.0));
        assert!((outcome.distance().unwrap() - expected).abs() < 1e-6);
    }

    #[test]
    fn test_match_is_global_minimum() {
        let probe = emb(&[1.0, 0.0]);
        let gallery: Gallery = [
            ("a".to_string(), vec![at_angle(30.0), at_angle(40.0)]),
            ("b".to_string(), vec![at_angle(12.0)]),
            ("c".to_string(), vec![at_angle(60.0), at_angle(15.0)]),
        ]
        .into_iter()
        .collect();

        let outcome = FaceMatcher::new(1.0).find_match(&probe, &gallery).unwrap();
        let all_min = gallery
            .iter()
            .flat_map(|e| e.embeddings.iter())
            .map(|e| cosine_distance(&probe, e))
            .fold(f32::INFINITY, f32::min);
        assert_eq!(outcome.identity_id(), Some("b"));
        assert!(outcome.distance().unwrap() < 1.0);
        assert_eq!(outcome.distance().unwrap(), all_min);
    }

    #[test]
    fn test_tie_keeps_first_identity() {
        let probe = emb(&[1.0, 0.0]);
        let mut gallery = Gallery::new();
        gallery.insert("first", vec![at_angle(10.0)]);
        gallery.insert("second", vec![at_angle(-10.0)]);

        let outcome = FaceMatcher::new(0.6).find_match(&probe, &gallery).unwrap();
        assert_eq!(outcome.identity_id(), Some("first"));
    }

    #[test]
    fn test_empty_gallery_is_no_match() {
        let outcome = FaceMatcher::new(0.6)
            .find_match(&emb(&[1.0, 0.0]), &Gallery::new())
            .unwrap();
        assert_eq!(outcome, MatchOutcome::NoMatch);
    }

    #[test]
    fn test_dimension_mismatch() {
        let mut gallery = Gallery::new();
        gallery.insert("S1", vec![emb(&[1.0, 0.0, 0.0])]);
        let err = FaceMatcher::new(0.6)
            .find_match(&emb(&[1.0, 0.0]), &gallery)
            .unwrap_err();
        assert_eq!(err, MatchError::DimensionMismatch { probe: 2, stored: 3 });
    }

    #[test]
    fn test_verify() {
        let matcher = FaceMatcher::new(0.6);
        let probe = emb(&[1.0, 0.0]);
        assert!(matcher.verify(&probe, &[at_angle(90.0), at_angle(10.0)]).unwrap());
        assert!(!matcher.verify(&probe, &[at_angle(90.0)]).unwrap());
        assert!(!matcher.verify(&probe, &[]).unwrap());
        assert!(matcher.verify(&probe, &[emb(&[1.0])]).is_err());
    }
}
