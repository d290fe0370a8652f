//! Section 508 compliance classification.
//!
//! The model is loaded once per run and shared read-only behind an `Arc`.
//! Scoring runs on the blocking pool so a large document never stalls the
//! I/O workers.
//!
//! # Artifact format
//!
//! ```json
//! {
//!   "version": "2024-03-linear",
//!   "estimator": "LogisticRegression",
//!   "params": { "C": 1.0 },
//!   "intercept": -1.0,
//!   "ngram_max": 2,
//!   "weights": { "508": 3.0, "section 508": 2.0, "compliant": 1.0 }
//! }
//! ```
//!
//! Features are lower-cased word n-grams (1..=`ngram_max`) restricted to the
//! weight vocabulary, with log-scaled counts (`1 + ln tf`) and L2
//! normalisation. The decision score goes through a logistic link; `p ≥ 0.5`
//! is `compliant`, and confidence is `max(p, 1 - p)`.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, error};

use crate::error::ModelError;
use crate::models::{Classification, ComplianceLabel, ModelInfo};

const MAX_NGRAM: usize = 5;

/// A loaded, read-only compliance model.
pub trait ComplianceModel: Send + Sync {
    fn info(&self) -> ModelInfo;

    /// Raw decision score for `text`; positive leans compliant.
    fn decision_function(&self, text: &str) -> Result<f64, ModelError>;
}

#[derive(Debug, Deserialize)]
struct Artifact {
    version: String,
    #[serde(default = "default_estimator")]
    estimator: String,
    #[serde(default)]
    params: Value,
    intercept: f64,
    #[serde(default = "default_ngram_max")]
    ngram_max: usize,
    weights: HashMap<String, f64>,
}

fn default_estimator() -> String {
    "LogisticRegression".to_string()
}

fn default_ngram_max() -> usize {
    1
}

/// Linear model over log-scaled, L2-normalised word n-gram counts.
#[derive(Debug, Clone)]
pub struct LinearTextModel {
    info: ModelInfo,
    intercept: f64,
    ngram_max: usize,
    weights: HashMap<String, f64>,
}

impl LinearTextModel {
    /// Load and validate a JSON artifact.
    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ModelError::Missing(path.display().to_string())
            } else {
                ModelError::Invalid(format!("{}: {}", path.display(), e))
            }
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ModelError> {
        let artifact: Artifact =
            serde_json::from_str(raw).map_err(|e| ModelError::Invalid(e.to_string()))?;

        if artifact.version.trim().is_empty() {
            return Err(ModelError::Invalid("version must not be empty".into()));
        }
        if artifact.ngram_max == 0 || artifact.ngram_max > MAX_NGRAM {
            return Err(ModelError::Invalid(format!(
                "ngram_max must be between 1 and {}",
                MAX_NGRAM
            )));
        }
        if !artifact.intercept.is_finite() {
            return Err(ModelError::Invalid("intercept is not finite".into()));
        }
        if let Some((term, _)) = artifact.weights.iter().find(|(_, w)| !w.is_finite()) {
            return Err(ModelError::Invalid(format!("weight for '{}' is not finite", term)));
        }

        // vocabulary keys are matched against normalised n-grams
        let weights = artifact
            .weights
            .into_iter()
            .map(|(k, w)| (tokenize(&k).join(" "), w))
            .filter(|(k, _)| !k.is_empty())
            .collect();

        Ok(Self {
            info: ModelInfo {
                version: artifact.version,
                estimator: artifact.estimator,
                params: artifact.params,
            },
            intercept: artifact.intercept,
            ngram_max: artifact.ngram_max,
            weights,
        })
    }
}

impl ComplianceModel for LinearTextModel {
    fn info(&self) -> ModelInfo {
        self.info.clone()
    }

    fn decision_function(&self, text: &str) -> Result<f64, ModelError> {
        let tokens = tokenize(text);
        let mut counts: HashMap<String, f64> = HashMap::new();
        for n in 1..=self.ngram_max.min(tokens.len()) {
            for gram in tokens.windows(n) {
                let key = gram.join(" ");
                if self.weights.contains_key(&key) {
                    *counts.entry(key).or_insert(0.0) += 1.0;
                }
            }
        }

        let features: Vec<(f64, f64)> = counts
            .iter()
            .filter_map(|(k, tf)| self.weights.get(k).map(|w| (1.0 + tf.ln(), *w)))
            .collect();
        let norm = features.iter().map(|(x, _)| x * x).sum::<f64>().sqrt();
        let dot = if norm > 0.0 {
            features.iter().map(|(x, w)| x * w).sum::<f64>() / norm
        } else {
            0.0
        };

        let score = self.intercept + dot;
        if !score.is_finite() {
            return Err(ModelError::Inference(format!("non-finite score {}", score)));
        }
        Ok(score)
    }
}

/// Lower-cased alphanumeric word tokens.
fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Map a decision score to a label and confidence.
pub fn classification_from_score(score: f64) -> Classification {
    let p = sigmoid(score);
    let label = if p >= 0.5 {
        ComplianceLabel::Compliant
    } else {
        ComplianceLabel::NonCompliant
    };
    Classification {
        label,
        confidence: p.max(1.0 - p),
        decision_score: Some(score),
    }
}

/// Shared front end over a [`ComplianceModel`].
#[derive(Clone)]
pub struct Classifier {
    model: Arc<dyn ComplianceModel>,
    info: ModelInfo,
}

impl Classifier {
    pub fn new(model: Arc<dyn ComplianceModel>) -> Self {
        let info = model.info();
        Self { model, info }
    }

    pub fn info(&self) -> &ModelInfo {
        &self.info
    }

    pub fn version(&self) -> &str {
        &self.info.version
    }

    /// Classify one document's text. Never fails: blank text and model
    /// errors both come back as `indeterminate`.
    pub async fn classify(&self, notice_id: &str, document: &str, text: &str) -> Classification {
        if text.trim().is_empty() {
            debug!(notice_id, file = document, "blank text, skipping model");
            return Classification::indeterminate();
        }

        let model = self.model.clone();
        let owned = text.to_string();
        let scored = tokio::task::spawn_blocking(move || model.decision_function(&owned)).await;

        match scored {
            Ok(Ok(score)) => classification_from_score(score),
            Ok(Err(e)) => {
                error!(notice_id, file = document, kind = %e.kind(), "model inference failed: {}", e);
                Classification::indeterminate()
            }
            Err(join) => {
                error!(notice_id, file = document, "model inference panicked: {}", join);
                Classification::indeterminate()
            }
        }
    }
}
