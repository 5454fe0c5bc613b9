//! Affect classifier backed by the Gemini `generateContent` API.
//!
//! The model never sees the image. It gets three ratios derived from the
//! landmark mesh plus a handful of expression coefficients, and must answer
//! with exactly one label from the closed set.

use rollcall_core::{AffectClassifier, AffectRequest, ClassifyError, EmotionLabel, LandmarkSet, NamedScore};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

use crate::config::Config;

// Mesh indices used for the facial ratios.
const LEFT_BROW_INNER: usize = 65;
const LEFT_EYE_UPPER: usize = 159;
const RIGHT_BROW_INNER: usize = 295;
const RIGHT_EYE_UPPER: usize = 386;
const MOUTH_LEFT: usize = 61;
const MOUTH_RIGHT: usize = 291;
const MOUTH_TOP: usize = 0;
const MOUTH_BOTTOM: usize = 17;

/// Expression coefficients worth forwarding to the model.
const SALIENT_COEFFICIENTS: [&str; 10] = [
    "mouthSmileLeft",
    "mouthSmileRight",
    "mouthFrownLeft",
    "mouthFrownRight",
    "jawOpen",
    "eyeBlinkLeft",
    "eyeBlinkRight",
    "browDownLeft",
    "browDownRight",
    "browInnerUp",
];

/// Ratios derived from a face mesh.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FacialMetrics {
    /// Mouth height over mouth width; larger means more open.
    pub mouth_aspect_ratio: f32,
    pub brow_lift_left: f32,
    pub brow_lift_right: f32,
}

impl FacialMetrics {
    /// `None` when the mesh lacks any of the points used.
    pub fn from_landmarks(landmarks: &LandmarkSet) -> Option<Self> {
        let distance = |a: usize, b: usize| -> Option<f32> {
            let (p, q) = (landmarks.get(a)?, landmarks.get(b)?);
            Some((p.x - q.x).hypot(p.y - q.y))
        };

        let mouth_width = distance(MOUTH_LEFT, MOUTH_RIGHT)?;
        if mouth_width == 0.0 {
            return None;
        }
        Some(Self {
            mouth_aspect_ratio: distance(MOUTH_TOP, MOUTH_BOTTOM)? / mouth_width,
            brow_lift_left: distance(LEFT_BROW_INNER, LEFT_EYE_UPPER)?,
            brow_lift_right: distance(RIGHT_BROW_INNER, RIGHT_EYE_UPPER)?,
        })
    }
}

/// Build the classification prompt for one request.
pub fn build_prompt(landmarks: &LandmarkSet, coefficients: Option<&[NamedScore]>) -> String {
    let labels = EmotionLabel::CLASSIFIABLE
        .iter()
        .map(|l| format!("'{l}'"))
        .collect::<Vec<_>>()
        .join(", ");

    let mut prompt = format!(
        "Analyse the facial metrics below and determine the dominant emotional state.\n\
         Choose ONLY from this list: {labels}.\n\
         Answer with the state name from the list and nothing else.\n\n"
    );

    match FacialMetrics::from_landmarks(landmarks) {
        Some(m) => {
            let _ = writeln!(prompt, "- Mouth aspect ratio (larger is more open): {:.3}", m.mouth_aspect_ratio);
            let _ = writeln!(prompt, "- Left brow to eye distance: {:.3}", m.brow_lift_left);
            let _ = writeln!(prompt, "- Right brow to eye distance: {:.3}", m.brow_lift_right);
        }
        None => prompt.push_str("- Facial geometry unavailable\n"),
    }

    for score in coefficients
        .unwrap_or_default()
        .iter()
        .filter(|s| SALIENT_COEFFICIENTS.contains(&s.name.as_str()))
    {
        let _ = writeln!(prompt, "- {}: {:.2}", score.name, score.score);
    }
    prompt
}

/// Accept only a label from the closed classifiable set.
pub fn parse_label(text: &str) -> Result<EmotionLabel, ClassifyError> {
    EmotionLabel::parse(text)
        .filter(|label| EmotionLabel::CLASSIFIABLE.contains(label))
        .ok_or_else(|| ClassifyError::InvalidLabel(text.trim().to_string()))
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    contents: [Content<'a>; 1],
}

#[derive(Serialize)]
struct Content<'a> {
    parts: [Part<'a>; 1],
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize)]
struct ResponsePart {
    #[serde(default)]
    text: String,
}

impl GenerateResponse {
    fn text(&self) -> Option<String> {
        let parts = &self.candidates.first()?.content.as_ref()?.parts;
        let text: String = parts.iter().map(|p| p.text.as_str()).collect();
        (!text.trim().is_empty()).then_some(text)
    }
}

pub struct GeminiClassifier {
    client: reqwest::Client,
    url: String,
    api_key: String,
}

impl GeminiClassifier {
    pub fn new(endpoint: &str, model: &str, api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: format!("{}/v1beta/models/{model}:generateContent", endpoint.trim_end_matches('/')),
            api_key,
        }
    }

    async fn request_label(&self, prompt: &str) -> Result<EmotionLabel, ClassifyError> {
        let body = GenerateRequest {
            contents: [Content {
                parts: [Part { text: prompt }],
            }],
        };

        let response = self
            .client
            .post(&self.url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| ClassifyError::Service(e.to_string()))?;

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| ClassifyError::Service(e.to_string()))?;

        let text = parsed
            .text()
            .ok_or_else(|| ClassifyError::Service("empty response".into()))?;
        parse_label(&text)
    }
}

/// Classifier selected at startup.
pub enum InsightBackend {
    Gemini(GeminiClassifier),
    /// No API key configured; every request resolves to `Neutro`.
    Offline,
}

impl InsightBackend {
    pub fn from_config(config: &Config) -> Self {
        match &config.insight_api_key {
            Some(key) => {
                tracing::info!(model = %config.insight_model, "affect classifier: gemini");
                InsightBackend::Gemini(GeminiClassifier::new(
                    &config.insight_endpoint,
                    &config.insight_model,
                    key.clone(),
                ))
            }
            None => {
                tracing::warn!("no insight API key configured; affect classification disabled");
                InsightBackend::Offline
            }
        }
    }
}

impl AffectClassifier for InsightBackend {
    async fn classify(&self, request: &AffectRequest) -> Result<EmotionLabel, ClassifyError> {
        match self {
            InsightBackend::Gemini(gemini) => {
                let prompt = build_prompt(&request.landmarks, request.coefficients.as_deref());
                gemini.request_label(&prompt).await
            }
            InsightBackend::Offline => Ok(EmotionLabel::Neutral),
        }
    }
}
