//! Risk Inference Engine
//!
//! Turns lap feature vectors into `RiskPrediction`s using the models in a
//! `ModelRegistry`. Every vector gets a prediction: absent inputs are
//! default-substituted and reported once per model as `FeatureMismatch`.

use std::collections::{BTreeMap, BTreeSet};

use super::registry::{ModelRegistry, OVERALL_MODEL_NAME};
use crate::config::InferenceConfig;
use crate::pipeline::{Diagnostics, PipelineWarning};
use crate::types::{ComponentRisk, LapFeatureVector, RiskLevel, RiskPrediction};

/// Coarse band of an overall probability.
pub fn risk_level(probability: f64, config: &InferenceConfig) -> RiskLevel {
    if probability > config.high_risk_threshold {
        RiskLevel::High
    } else if probability > config.medium_risk_threshold {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    }
}

/// Substituted features per model across a batch.
#[derive(Debug, Default)]
struct MismatchTracker {
    per_model: BTreeMap<String, (BTreeSet<String>, usize)>,
}

impl MismatchTracker {
    fn record(&mut self, model: &str, missing: Vec<String>) {
        if missing.is_empty() {
            return;
        }
        let entry = self.per_model.entry(model.to_string()).or_default();
        entry.0.extend(missing);
        entry.1 += 1;
    }

    fn report(self, diag: &mut Diagnostics) {
        for (model, (missing, laps)) in self.per_model {
            diag.push(PipelineWarning::FeatureMismatch {
                model,
                missing: missing.into_iter().collect(),
                laps,
            });
        }
    }
}

pub struct RiskEngine<'a> {
    registry: &'a ModelRegistry,
    config: &'a InferenceConfig,
}

impl<'a> RiskEngine<'a> {
    pub fn new(registry: &'a ModelRegistry, config: &'a InferenceConfig) -> Self {
        Self { registry, config }
    }

    /// Predict one lap. Substituted feature names are discarded.
    pub fn predict(&self, vector: &LapFeatureVector) -> RiskPrediction {
        self.predict_tracked(vector, &mut MismatchTracker::default())
    }

    /// Predict every lap, in input order.
    pub fn predict_all(
        &self,
        vectors: &[LapFeatureVector],
        diag: &mut Diagnostics,
    ) -> Vec<RiskPrediction> {
        let mut tracker = MismatchTracker::default();
        let predictions: Vec<RiskPrediction> = vectors
            .iter()
            .map(|v| self.predict_tracked(v, &mut tracker))
            .collect();
        tracker.report(diag);

        tracing::info!(
            laps = predictions.len(),
            overall = self.registry.overall().is_some(),
            components = ?self.registry.component_names(),
            "Risk inference complete"
        );
        predictions
    }

    fn predict_tracked(&self, vector: &LapFeatureVector, tracker: &mut MismatchTracker) -> RiskPrediction {
        let dnf_probability = self.registry.overall().map(|model| {
            let (p, missing) = model.predict(vector);
            tracker.record(OVERALL_MODEL_NAME, missing);
            p
        });

        let mut component_predictions = BTreeMap::new();
        for (component, model) in self.registry.components() {
            let (p, missing) = model.predict(vector);
            tracker.record(model.name(), missing);
            component_predictions.insert(component, p);
        }

        let most_at_risk_component = self.most_at_risk(&component_predictions);

        RiskPrediction {
            vehicle_id: vector.vehicle_id.clone(),
            lap: vector.lap,
            dnf_probability,
            risk_level: dnf_probability.map(|p| risk_level(p, self.config)),
            component_predictions,
            most_at_risk_component,
        }
    }

    /// Highest component probability above the materiality threshold. Ties
    /// go to the first component in declaration order.
    fn most_at_risk(
        &self,
        predictions: &BTreeMap<crate::types::Component, f64>,
    ) -> Option<ComponentRisk> {
        let mut best: Option<ComponentRisk> = None;
        for (&component, &probability) in predictions {
            if best.map_or(true, |b| probability > b.probability) {
                best = Some(ComponentRisk {
                    component,
                    probability,
                });
            }
        }
        best.filter(|b| b.probability > self.config.materiality_threshold)
    }
}
