//! Template matching against the enrolled gallery.

use crate::types::{EnrolledTemplate, Identity, LandmarkSet, ScoreError};

/// Default acceptance threshold for landmark-geometry matching.
///
/// Geometry-only matching is a weak biometric; the bar is set high so
/// false rejects dominate false accepts.
pub const SIMILARITY_THRESHOLD: f32 = 0.90;

/// Why a probe was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// No enrolled record carried a usable template.
    NoEnrolledTemplates,
    /// The best candidate scored under the threshold.
    BelowThreshold,
}

/// Result of matching a probe against the gallery.
#[derive(Debug, Clone)]
pub struct MatchResult {
    pub matched: bool,
    /// Cosine similarity of the best candidate, 0.0 if none was scored.
    pub similarity: f32,
    /// The accepted identity (only set when `matched`).
    pub identity: Option<Identity>,
    /// Templates that were scored.
    pub eligible: usize,
    /// Comparisons skipped because of a dimension mismatch.
    pub mismatched: usize,
}

impl MatchResult {
    pub fn accepted(&self) -> Option<(&Identity, f32)> {
        self.identity
            .as_ref()
            .filter(|_| self.matched)
            .map(|id| (id, self.similarity))
    }

    pub fn reject_reason(&self) -> Option<RejectReason> {
        if self.matched {
            None
        } else if self.eligible == self.mismatched {
            Some(RejectReason::NoEnrolledTemplates)
        } else {
            Some(RejectReason::BelowThreshold)
        }
    }
}

/// Strategy for comparing a probe landmark set against enrolled templates.
pub trait Matcher {
    fn compare(&self, probe: &LandmarkSet, gallery: &[EnrolledTemplate], threshold: f32) -> MatchResult;
}

/// Cosine similarity over flattened landmark coordinates.
///
/// Scans every eligible template. The first-enumerated identity keeps
/// the lead on equal scores.
#[derive(Debug, Clone, Copy, Default)]
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn compare(&self, probe: &LandmarkSet, gallery: &[EnrolledTemplate], threshold: f32) -> MatchResult {
        let probe_vec = probe.to_feature_vector();

        let mut best_sim = f32::NEG_INFINITY;
        let mut best_idx: Option<usize> = None;
        let mut eligible = 0usize;
        let mut mismatched = 0usize;

        for (i, record) in gallery.iter().enumerate() {
            if record.template.is_empty() {
                continue;
            }
            eligible += 1;

            let sim = match probe_vec.similarity(&record.template.to_feature_vector()) {
                Ok(sim) => sim,
                Err(ScoreError::DimensionMismatch { left, right }) => {
                    tracing::warn!(
                        identity = %record.identity.id,
                        probe_len = left,
                        template_len = right,
                        "skipping template with mismatched landmark count"
                    );
                    mismatched += 1;
                    continue;
                }
            };

            if sim > best_sim {
                best_sim = sim;
                best_idx = Some(i);
            }
        }

        match best_idx {
            Some(idx) if best_sim >= threshold => MatchResult {
                matched: true,
                similarity: best_sim,
                identity: Some(gallery[idx].identity.clone()),
                eligible,
                mismatched,
            },
            _ => MatchResult {
                matched: false,
                similarity: if best_idx.is_none() { 0.0 } else { best_sim },
                identity: None,
                eligible,
                mismatched,
            },
        }
    }
}
