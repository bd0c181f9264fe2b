//! System-wide default constants.
//!
//! Grouped by pipeline stage for easy discovery.

// ============================================================================
// Lap Assignment
// ============================================================================

/// Bucket width for the approximate fixed-window lap assignment (seconds).
pub const FIXED_LAP_WINDOW_SECS: f64 = 90.0;

// ============================================================================
// Inference
// ============================================================================

/// Minimum component probability worth reporting as "most at risk".
pub const COMPONENT_MATERIALITY_THRESHOLD: f64 = 0.05;

/// Overall DNF probability above which a lap is "medium" risk.
pub const MEDIUM_RISK_THRESHOLD: f64 = 0.4;

/// Overall DNF probability above which a lap is "high" risk.
pub const HIGH_RISK_THRESHOLD: f64 = 0.7;

// ============================================================================
// Karma Stream
// ============================================================================

/// EWMA weight given to the previous smoothed karma value.
pub const KARMA_SMOOTHING: f64 = 0.6;

/// Trend compares the current lap with the value this many laps earlier.
pub const TREND_LOOKBACK_LAPS: u32 = 3;

/// Karma delta below which the trend is "stable".
pub const TREND_DEADBAND: f64 = 0.01;

// ============================================================================
// HTTP Boundary
// ============================================================================

/// Largest accepted telemetry upload (bytes). 64 MiB.
pub const MAX_UPLOAD_BYTES: usize = 64 * 1024 * 1024;
