//! Risk Inference
//!
//! - `model`: JSON model / scaler artifacts and the `RiskModel` trait
//! - `registry`: immutable set of loaded models
//! - `engine`: feature alignment and per-lap prediction

pub mod engine;
pub mod model;
pub mod registry;

pub use engine::{risk_level, RiskEngine};
pub use model::{
    DecisionTree, ForestModel, LoadedModel, LogisticModel, ModelArtifact, ModelError, RiskModel,
    StandardScaler, TreeNode,
};
pub use registry::{
    component_model_file, component_scaler_file, ModelRegistry, OVERALL_MODEL_FILE,
    OVERALL_SCALER_FILE,
};
