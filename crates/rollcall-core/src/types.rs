use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::snapshot::VideoFrame;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScoreError {
    #[error("feature vector dimension mismatch: {left} vs {right}")]
    DimensionMismatch { left: usize, right: usize },
}

/// A single normalized landmark in unit image space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LandmarkPoint {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl LandmarkPoint {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
}

/// Ordered landmark points for one detected face.
///
/// The point count is fixed by the detector model (478 for the MediaPipe
/// face landmarker) and never varies between probe and template.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LandmarkSet {
    points: Vec<LandmarkPoint>,
}

impl LandmarkSet {
    pub fn new(points: Vec<LandmarkPoint>) -> Self {
        Self { points }
    }

    pub fn points(&self) -> &[LandmarkPoint] {
        &self.points
    }

    pub fn get(&self, index: usize) -> Option<&LandmarkPoint> {
        self.points.get(index)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Flatten into `[x0, y0, z0, x1, y1, z1, ...]` in point order.
    pub fn to_feature_vector(&self) -> FeatureVector {
        let mut values = Vec::with_capacity(self.points.len() * 3);
        for p in &self.points {
            values.extend_from_slice(&[p.x, p.y, p.z]);
        }
        FeatureVector { values }
    }
}

impl From<Vec<LandmarkPoint>> for LandmarkSet {
    fn from(points: Vec<LandmarkPoint>) -> Self {
        Self::new(points)
    }
}

/// Flattened landmark geometry, the unit of comparison for matching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub values: Vec<f32>,
}

impl FeatureVector {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Cosine similarity in [-1, 1]. Higher = more similar.
    ///
    /// Empty or zero-magnitude input scores 0. Vectors of different
    /// lengths are never truncated or padded.
    pub fn similarity(&self, other: &FeatureVector) -> Result<f32, ScoreError> {
        if self.values.is_empty() || other.values.is_empty() {
            return Ok(0.0);
        }
        if self.values.len() != other.values.len() {
            return Err(ScoreError::DimensionMismatch {
                left: self.values.len(),
                right: other.values.len(),
            });
        }

        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 {
            Ok((dot / denom).clamp(-1.0, 1.0))
        } else {
            Ok(0.0)
        }
    }
}

/// Named expression coefficient (a MediaPipe blendshape category).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedScore {
    pub name: String,
    pub score: f32,
}

/// One detector result for one camera frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FrameResult {
    #[serde(default)]
    pub landmarks: Option<LandmarkSet>,
    #[serde(default)]
    pub coefficients: Option<Vec<NamedScore>>,
    /// Raw video frame the landmarks were detected on, used for the capture still.
    #[serde(default)]
    pub frame: Option<VideoFrame>,
}

impl FrameResult {
    pub fn no_face() -> Self {
        Self::default()
    }

    pub fn with_face(landmarks: LandmarkSet) -> Self {
        Self {
            landmarks: Some(landmarks),
            ..Self::default()
        }
    }

    /// The detected face, if any. An empty landmark list counts as no face.
    pub fn face(&self) -> Option<&LandmarkSet> {
        self.landmarks.as_ref().filter(|l| !l.is_empty())
    }
}

/// An enrolled person.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub name: String,
    /// Class group used to resolve the academic schedule.
    #[serde(default)]
    pub class_group: Option<String>,
}

/// An identity with its stored biometric template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrolledTemplate {
    pub identity: Identity,
    /// Empty when the identity was registered without biometrics.
    pub template: LandmarkSet,
    pub enrolled_at: DateTime<Utc>,
}

/// Attendance direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Arrival,
    Departure,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Arrival => "arrival",
            Direction::Departure => "departure",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
#[error("unknown direction: {0} (expected arrival or departure)")]
pub struct ParseDirectionError(String);

impl FromStr for Direction {
    type Err = ParseDirectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "arrival" | "entrada" | "in" => Ok(Direction::Arrival),
            "departure" | "saida" | "saída" | "out" => Ok(Direction::Departure),
            other => Err(ParseDirectionError(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vector(values: &[f32]) -> FeatureVector {
        FeatureVector { values: values.to_vec() }
    }

    #[test]
    fn test_vectorize_order() {
        let set = LandmarkSet::new(vec![
            LandmarkPoint::new(0.1, 0.2, 0.3),
            LandmarkPoint::new(0.4, 0.5, 0.6),
        ]);
        assert_eq!(set.to_feature_vector().values, vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6]);
    }

    #[test]
    fn test_vectorize_empty() {
        assert!(LandmarkSet::default().to_feature_vector().is_empty());
    }

    #[test]
    fn test_similarity_identical() {
        let a = vector(&[0.3, 0.7, -0.02, 0.5, 0.5, 0.01]);
        assert!((a.similarity(&a).unwrap() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_similarity_symmetric() {
        let a = vector(&[0.31, 0.62, -0.05]);
        let b = vector(&[0.44, 0.18, 0.02]);
        let ab = a.similarity(&b).unwrap();
        let ba = b.similarity(&a).unwrap();
        assert!((ab - ba).abs() < 1e-7);
    }

    #[test]
    fn test_similarity_orthogonal() {
        let a = vector(&[1.0, 0.0]);
        let b = vector(&[0.0, 1.0]);
        assert!(a.similarity(&b).unwrap().abs() < 1e-6);
    }

    #[test]
    fn test_similarity_opposite() {
        let a = vector(&[1.0, 0.0]);
        let b = vector(&[-1.0, 0.0]);
        assert!((a.similarity(&b).unwrap() + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_similarity_zero_vector() {
        let z = vector(&[0.0, 0.0, 0.0]);
        let v = vector(&[0.2, 0.4, 0.1]);
        assert_eq!(z.similarity(&v).unwrap(), 0.0);
        assert_eq!(v.similarity(&z).unwrap(), 0.0);
    }

    #[test]
    fn test_similarity_empty() {
        let v = vector(&[0.2, 0.4, 0.1]);
        assert_eq!(vector(&[]).similarity(&v).unwrap(), 0.0);
    }

    #[test]
    fn test_similarity_dimension_mismatch() {
        let a = vector(&[0.1, 0.2, 0.3]);
        let b = vector(&[0.1, 0.2, 0.3, 0.4, 0.5, 0.6]);
        assert_eq!(
            a.similarity(&b),
            Err(ScoreError::DimensionMismatch { left: 3, right: 6 })
        );
    }

    #[test]
    fn test_frame_result_empty_landmarks_is_no_face() {
        let frame = FrameResult::with_face(LandmarkSet::default());
        assert!(frame.face().is_none());
        assert!(FrameResult::no_face().face().is_none());
    }

    #[test]
    fn test_frame_result_from_detector_json() {
        let json = r#"{"landmarks":[{"x":0.5,"y":0.4,"z":-0.01}],
                       "coefficients":[{"name":"jawOpen","score":0.12}]}"#;
        let frame: FrameResult = serde_json::from_str(json).unwrap();
        assert_eq!(frame.face().map(|l| l.len()), Some(1));
        assert_eq!(frame.coefficients.as_ref().unwrap()[0].name, "jawOpen");
        assert!(frame.frame.is_none());
    }

    #[test]
    fn test_direction_parse() {
        assert_eq!("arrival".parse::<Direction>().unwrap(), Direction::Arrival);
        assert_eq!("Saida".parse::<Direction>().unwrap(), Direction::Departure);
        assert!("sideways".parse::<Direction>().is_err());
    }
}
