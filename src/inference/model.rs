//! Model and scaler artifacts.
//!
//! Artifacts are JSON documents produced by the offline training job.
//! A model names its input features in order; the engine aligns each lap
//! vector to that list before calling `predict_proba`.
//!
//! ```json
//! {"kind": "logistic", "features": ["speed_mean"], "defaults": {"speed_mean": 140.0},
//!  "coefficients": [0.02], "intercept": -3.1}
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::types::LapFeatureVector;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("artifact not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("invalid artifact: {0}")]
    Invalid(String),
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, ModelError> {
    if !path.exists() {
        return Err(ModelError::NotFound(path.to_path_buf()));
    }
    let bytes = std::fs::read(path).map_err(|source| ModelError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|source| ModelError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

// ============================================================================
// Model trait
// ============================================================================

/// A binary classifier over an ordered, named feature list.
pub trait RiskModel: Send + Sync + std::fmt::Debug {
    /// Expected input features, in order.
    fn features(&self) -> &[String];

    /// Training-time default for a feature, if the artifact carries one.
    fn default_for(&self, feature: &str) -> Option<f64>;

    /// Positive-class probability for an aligned (and scaled) input row.
    fn predict_proba(&self, x: &[f64]) -> f64;
}

// ============================================================================
// Logistic regression
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticModel {
    pub features: Vec<String>,
    #[serde(default)]
    pub defaults: BTreeMap<String, f64>,
    pub coefficients: Vec<f64>,
    pub intercept: f64,
}

impl LogisticModel {
    fn validate(&self) -> Result<(), ModelError> {
        validate_feature_list(&self.features)?;
        if self.coefficients.len() != self.features.len() {
            return Err(ModelError::Invalid(format!(
                "logistic model has {} coefficients for {} features",
                self.coefficients.len(),
                self.features.len()
            )));
        }
        if !self.intercept.is_finite() || self.coefficients.iter().any(|c| !c.is_finite()) {
            return Err(ModelError::Invalid("non-finite logistic weights".to_string()));
        }
        Ok(())
    }
}

impl RiskModel for LogisticModel {
    fn features(&self) -> &[String] {
        &self.features
    }

    fn default_for(&self, feature: &str) -> Option<f64> {
        self.defaults.get(feature).copied()
    }

    fn predict_proba(&self, x: &[f64]) -> f64 {
        let z: f64 = self.intercept
            + self
                .coefficients
                .iter()
                .zip(x)
                .map(|(w, v)| w * v)
                .sum::<f64>();
        sigmoid(z)
    }
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

// ============================================================================
// Tree ensemble
// ============================================================================

/// Decision tree node: a split or a leaf.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TreeNode {
    /// Go `left` when `x[feature] <= threshold`, else `right`.
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
    Leaf { probability: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionTree {
    pub nodes: Vec<TreeNode>,
}

impl DecisionTree {
    /// Children always point forward, so every walk terminates.
    fn validate(&self, n_features: usize) -> Result<(), ModelError> {
        if self.nodes.is_empty() {
            return Err(ModelError::Invalid("empty decision tree".to_string()));
        }
        for (i, node) in self.nodes.iter().enumerate() {
            match *node {
                TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    if feature >= n_features {
                        return Err(ModelError::Invalid(format!(
                            "node {i} splits on feature {feature} of {n_features}"
                        )));
                    }
                    if !threshold.is_finite() {
                        return Err(ModelError::Invalid(format!("node {i} has non-finite threshold")));
                    }
                    for child in [left, right] {
                        if child <= i || child >= self.nodes.len() {
                            return Err(ModelError::Invalid(format!(
                                "node {i} has invalid child {child}"
                            )));
                        }
                    }
                }
                TreeNode::Leaf { probability } => {
                    if !(0.0..=1.0).contains(&probability) {
                        return Err(ModelError::Invalid(format!(
                            "leaf {i} probability {probability} outside [0, 1]"
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    fn leaf_probability(&self, x: &[f64]) -> Option<f64> {
        let mut idx = 0;
        loop {
            match self.nodes.get(idx)? {
                TreeNode::Leaf { probability } => return Some(*probability),
                TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    let value = *x.get(*feature)?;
                    idx = if value <= *threshold { *left } else { *right };
                }
            }
        }
    }
}

/// Random-forest style ensemble: probability is the mean leaf value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForestModel {
    pub features: Vec<String>,
    #[serde(default)]
    pub defaults: BTreeMap<String, f64>,
    pub trees: Vec<DecisionTree>,
}

impl ForestModel {
    fn validate(&self) -> Result<(), ModelError> {
        validate_feature_list(&self.features)?;
        if self.trees.is_empty() {
            return Err(ModelError::Invalid("forest has no trees".to_string()));
        }
        for tree in &self.trees {
            tree.validate(self.features.len())?;
        }
        Ok(())
    }
}

impl RiskModel for ForestModel {
    fn features(&self) -> &[String] {
        &self.features
    }

    fn default_for(&self, feature: &str) -> Option<f64> {
        self.defaults.get(feature).copied()
    }

    fn predict_proba(&self, x: &[f64]) -> f64 {
        let leaves: Vec<f64> = self
            .trees
            .iter()
            .filter_map(|t| t.leaf_probability(x))
            .collect();
        if leaves.is_empty() {
            return 0.0;
        }
        leaves.iter().sum::<f64>() / leaves.len() as f64
    }
}

fn validate_feature_list(features: &[String]) -> Result<(), ModelError> {
    if features.is_empty() {
        return Err(ModelError::Invalid("model declares no features".to_string()));
    }
    let mut seen = std::collections::HashSet::new();
    if let Some(dup) = features.iter().find(|f| !seen.insert(f.as_str())) {
        return Err(ModelError::Invalid(format!("feature '{dup}' listed twice")));
    }
    Ok(())
}

// ============================================================================
// Artifact envelope
// ============================================================================

/// On-disk model document, discriminated by `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ModelArtifact {
    Logistic(LogisticModel),
    Forest(ForestModel),
}

impl ModelArtifact {
    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let artifact: Self = read_json(path)?;
        artifact.validate()?;
        Ok(artifact)
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        match self {
            ModelArtifact::Logistic(m) => m.validate(),
            ModelArtifact::Forest(m) => m.validate(),
        }
    }

    pub fn into_model(self) -> Box<dyn RiskModel> {
        match self {
            ModelArtifact::Logistic(m) => Box::new(m),
            ModelArtifact::Forest(m) => Box::new(m),
        }
    }
}

// ============================================================================
// Standard scaler
// ============================================================================

/// `(x - mean) / scale` per feature. A zero scale divides by 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    pub mean: Vec<f64>,
    pub scale: Vec<f64>,
}

impl StandardScaler {
    pub fn load(path: &Path) -> Result<Self, ModelError> {
        read_json(path)
    }

    pub fn validate(&self, n_features: usize) -> Result<(), ModelError> {
        if self.mean.len() != n_features || self.scale.len() != n_features {
            return Err(ModelError::Invalid(format!(
                "scaler has {} means / {} scales for {} features",
                self.mean.len(),
                self.scale.len(),
                n_features
            )));
        }
        if self.mean.iter().chain(&self.scale).any(|v| !v.is_finite()) {
            return Err(ModelError::Invalid("non-finite scaler parameters".to_string()));
        }
        Ok(())
    }

    pub fn transform(&self, x: &mut [f64]) {
        for ((v, mean), scale) in x.iter_mut().zip(&self.mean).zip(&self.scale) {
            let s = if *scale == 0.0 { 1.0 } else { *scale };
            *v = (*v - mean) / s;
        }
    }
}

// ============================================================================
// Loaded model
// ============================================================================

/// A validated model with its optional scaler.
#[derive(Debug)]
pub struct LoadedModel {
    name: String,
    model: Box<dyn RiskModel>,
    scaler: Option<StandardScaler>,
}

impl LoadedModel {
    pub fn new(
        name: impl Into<String>,
        artifact: ModelArtifact,
        scaler: Option<StandardScaler>,
    ) -> Result<Self, ModelError> {
        artifact.validate()?;
        let model = artifact.into_model();
        if let Some(s) = &scaler {
            s.validate(model.features().len())?;
        }
        Ok(Self {
            name: name.into(),
            model,
            scaler,
        })
    }

    /// Load a model file and, when present, its scaler file.
    pub fn from_files(name: &str, model_path: &Path, scaler_path: &Path) -> Result<Self, ModelError> {
        let artifact = ModelArtifact::load(model_path)?;
        let scaler = if scaler_path.exists() {
            Some(StandardScaler::load(scaler_path)?)
        } else {
            tracing::debug!(model = name, "No scaler artifact, using raw features");
            None
        };
        Self::new(name, artifact, scaler)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn features(&self) -> &[String] {
        self.model.features()
    }

    /// Select the model's features from `vector` in order. Absent features
    /// take the model default, else the scaler mean, else 0.0; their names
    /// are returned alongside.
    pub fn align(&self, vector: &LapFeatureVector) -> (Vec<f64>, Vec<String>) {
        let mut missing = Vec::new();
        let row = self
            .model
            .features()
            .iter()
            .enumerate()
            .map(|(i, name)| match vector.get(name).filter(|v| v.is_finite()) {
                Some(v) => v,
                None => {
                    missing.push(name.clone());
                    self.model
                        .default_for(name)
                        .or_else(|| self.scaler.as_ref().and_then(|s| s.mean.get(i).copied()))
                        .unwrap_or(0.0)
                }
            })
            .collect();
        (row, missing)
    }

    /// Probability in [0, 1] plus the names of substituted features.
    pub fn predict(&self, vector: &LapFeatureVector) -> (f64, Vec<String>) {
        let (mut row, missing) = self.align(vector);
        if let Some(scaler) = &self.scaler {
            scaler.transform(&mut row);
        }
        let p = self.model.predict_proba(&row);
        let p = if p.is_finite() { p.clamp(0.0, 1.0) } else { 0.0 };
        (p, missing)
    }
}
