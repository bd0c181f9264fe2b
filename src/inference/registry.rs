//! Model registry: every artifact loaded once at startup.
//!
//! The registry is immutable after `load` and shared read-only (`Arc`)
//! between requests. Missing or invalid artifacts are recorded as
//! `ModelUnavailable` warnings and leave that slot empty.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::model::{LoadedModel, ModelError};
use crate::pipeline::{Diagnostics, PipelineWarning};
use crate::types::Component;

/// Overall DNF model file name.
pub const OVERALL_MODEL_FILE: &str = "karma_model.json";
/// Overall model input scaler file name.
pub const OVERALL_SCALER_FILE: &str = "feature_scaler.json";
/// Name used for the overall model in warnings and logs.
pub const OVERALL_MODEL_NAME: &str = "overall";

pub fn component_model_file(component: Component) -> String {
    format!("component_model_{}.json", component.as_str())
}

pub fn component_scaler_file(component: Component) -> String {
    format!("component_scaler_{}.json", component.as_str())
}

#[derive(Debug, Default)]
pub struct ModelRegistry {
    overall: Option<LoadedModel>,
    components: BTreeMap<Component, LoadedModel>,
    source: Option<PathBuf>,
}

impl ModelRegistry {
    /// Registry with no models; every prediction is "unavailable".
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load every artifact found in `dir`.
    pub fn load(dir: &Path, diag: &mut Diagnostics) -> Self {
        let mut registry = Self {
            source: Some(dir.to_path_buf()),
            ..Self::default()
        };

        match LoadedModel::from_files(
            OVERALL_MODEL_NAME,
            &dir.join(OVERALL_MODEL_FILE),
            &dir.join(OVERALL_SCALER_FILE),
        ) {
            Ok(model) => registry.overall = Some(model),
            Err(e) => diag.push(unavailable(OVERALL_MODEL_NAME, &e)),
        }

        for component in Component::ALL {
            match LoadedModel::from_files(
                component.as_str(),
                &dir.join(component_model_file(component)),
                &dir.join(component_scaler_file(component)),
            ) {
                Ok(model) => {
                    registry.components.insert(component, model);
                }
                Err(e) => diag.push(unavailable(component.as_str(), &e)),
            }
        }

        tracing::info!(
            dir = %dir.display(),
            overall = registry.overall.is_some(),
            components = ?registry.component_names(),
            "Model registry loaded"
        );
        registry
    }

    pub fn with_overall(mut self, model: LoadedModel) -> Self {
        self.overall = Some(model);
        self
    }

    pub fn with_component(mut self, component: Component, model: LoadedModel) -> Self {
        self.components.insert(component, model);
        self
    }

    pub fn overall(&self) -> Option<&LoadedModel> {
        self.overall.as_ref()
    }

    pub fn component(&self, component: Component) -> Option<&LoadedModel> {
        self.components.get(&component)
    }

    pub fn components(&self) -> impl Iterator<Item = (Component, &LoadedModel)> {
        self.components.iter().map(|(c, m)| (*c, m))
    }

    pub fn component_names(&self) -> Vec<&'static str> {
        self.components.keys().map(|c| c.as_str()).collect()
    }

    /// True when at least one model (overall or component) is loaded.
    pub fn has_any(&self) -> bool {
        self.overall.is_some() || !self.components.is_empty()
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }
}

fn unavailable(model: &str, err: &ModelError) -> PipelineWarning {
    PipelineWarning::ModelUnavailable {
        model: model.to_string(),
        reason: err.to_string(),
    }
}
