//! Rate-limited affective-state refresh.
//!
//! The external classifier is slow and billed per call, so at most one
//! request is outstanding and two dispatches are never closer than the
//! configured interval. Results carry the token they were issued with;
//! anything that does not match the outstanding token is dropped.

use std::future::Future;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::engagement::EmotionLabel;
use crate::types::{LandmarkSet, NamedScore};

/// Minimum spacing between classifier dispatches.
pub const DEFAULT_AFFECT_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClassifyError {
    #[error("classifier timed out")]
    Timeout,
    #[error("classifier returned an unknown label: {0:?}")]
    InvalidLabel(String),
    #[error("classifier service failed: {0}")]
    Service(String),
}

/// Identifies one classifier dispatch within one session generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AffectToken {
    pub generation: u64,
    pub seq: u64,
}

/// A classification the driver should run.
#[derive(Debug, Clone)]
pub struct AffectRequest {
    pub token: AffectToken,
    pub landmarks: LandmarkSet,
    pub coefficients: Option<Vec<NamedScore>>,
}

/// Contract for the external affect classifier.
pub trait AffectClassifier: Send + Sync + 'static {
    fn classify(
        &self,
        request: &AffectRequest,
    ) -> impl Future<Output = Result<EmotionLabel, ClassifyError>> + Send;
}

/// Single-outstanding-request guard with a minimum dispatch interval.
#[derive(Debug)]
pub struct AffectRefresh {
    enabled: bool,
    min_interval: Duration,
    label: EmotionLabel,
    in_flight: Option<AffectToken>,
    last_dispatch: Option<Instant>,
    next_seq: u64,
}

impl AffectRefresh {
    pub fn new(enabled: bool, min_interval: Duration) -> Self {
        Self {
            enabled,
            min_interval,
            label: if enabled {
                EmotionLabel::Analyzing
            } else {
                EmotionLabel::Neutral
            },
            in_flight: None,
            last_dispatch: None,
            next_seq: 0,
        }
    }

    pub fn label(&self) -> EmotionLabel {
        self.label
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn in_flight(&self) -> Option<AffectToken> {
        self.in_flight
    }

    pub fn last_dispatch(&self) -> Option<Instant> {
        self.last_dispatch
    }

    /// Offer a face observation. Returns a request when one may be dispatched now.
    pub fn poll(
        &mut self,
        generation: u64,
        landmarks: &LandmarkSet,
        coefficients: Option<&[NamedScore]>,
        now: Instant,
    ) -> Option<AffectRequest> {
        if !self.enabled || self.in_flight.is_some() {
            return None;
        }
        if let Some(last) = self.last_dispatch {
            if now.saturating_duration_since(last) < self.min_interval {
                return None;
            }
        }

        let token = AffectToken {
            generation,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.in_flight = Some(token);
        self.last_dispatch = Some(now);

        Some(AffectRequest {
            token,
            landmarks: landmarks.clone(),
            coefficients: coefficients.map(<[NamedScore]>::to_vec),
        })
    }

    /// Apply a classifier outcome. Failures resolve to `Neutral`.
    ///
    /// Returns false (and changes nothing) for a token that is no longer outstanding.
    pub fn complete(&mut self, token: AffectToken, result: Result<EmotionLabel, ClassifyError>) -> bool {
        if self.in_flight != Some(token) {
            tracing::debug!(?token, "ignoring stale affect result");
            return false;
        }
        self.in_flight = None;
        self.label = match result {
            Ok(label) => label,
            Err(e) => {
                tracing::warn!(error = %e, "affect classification failed; using Neutro");
                EmotionLabel::Neutral
            }
        };
        true
    }

    /// Drop any outstanding request and forget the label.
    ///
    /// The dispatch timestamp is kept so the rate limit spans sessions.
    pub fn cancel(&mut self) {
        self.in_flight = None;
        self.label = if self.enabled {
            EmotionLabel::Analyzing
        } else {
            EmotionLabel::Neutral
        };
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        self.cancel();
    }
}
