//! Risk inference outputs.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Tracked vehicle components, each with an optional dedicated model.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Component {
    Engine,
    Gearbox,
    Brakes,
    Tires,
}

impl Component {
    pub const ALL: [Component; 4] = [
        Component::Engine,
        Component::Gearbox,
        Component::Brakes,
        Component::Tires,
    ];

    /// Artifact / column key (`engine`, `gearbox`, ...).
    pub fn as_str(self) -> &'static str {
        match self {
            Component::Engine => "engine",
            Component::Gearbox => "gearbox",
            Component::Brakes => "brakes",
            Component::Tires => "tires",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(name.trim()))
    }
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Coarse risk band of the overall DNF probability.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RiskLevel::Low => write!(f, "low"),
            RiskLevel::Medium => write!(f, "medium"),
            RiskLevel::High => write!(f, "high"),
        }
    }
}

/// The component with the highest material failure probability.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ComponentRisk {
    pub component: Component,
    pub probability: f64,
}

/// Failure-risk estimate for one (vehicle, lap).
///
/// `dnf_probability` is `None` when the overall model is unavailable.
/// Components without a loaded model are absent from
/// `component_predictions`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskPrediction {
    pub vehicle_id: String,
    pub lap: u32,
    pub dnf_probability: Option<f64>,
    pub risk_level: Option<RiskLevel>,
    pub component_predictions: BTreeMap<Component, f64>,
    pub most_at_risk_component: Option<ComponentRisk>,
}

impl RiskPrediction {
    pub fn component(&self, component: Component) -> Option<f64> {
        self.component_predictions.get(&component).copied()
    }
}
