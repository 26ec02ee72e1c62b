//! Vitals interpretation helpers
//!
//! Pure functions over the vitals section's raw string fields: numeric
//! parsing, BMI, and per-metric alert bands. Thresholds follow the triage
//! ranges used on the nursing intake screen.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Alert severity for a single vitals reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Low,
    High,
    Critical,
}

impl AlertLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Low => "low",
            AlertLevel::High => "high",
            AlertLevel::Critical => "critical",
        }
    }
}

/// One out-of-range vitals reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VitalAlert {
    pub metric: String,
    pub value: f64,
    pub level: AlertLevel,
    pub message: String,
}

/// Alert band for one vitals metric: critical/high at or above, low below
struct Band {
    field: &'static str,
    label: &'static str,
    critical_at: f64,
    high_at: f64,
    low_below: f64,
}

const BANDS: [Band; 5] = [
    Band {
        field: "blood_pressure_systolic",
        label: "Systolic blood pressure",
        critical_at: 180.0,
        high_at: 140.0,
        low_below: 90.0,
    },
    Band {
        field: "blood_pressure_diastolic",
        label: "Diastolic blood pressure",
        critical_at: 120.0,
        high_at: 90.0,
        low_below: 60.0,
    },
    Band {
        field: "temperature_c",
        label: "Temperature",
        critical_at: 39.0,
        high_at: 38.0,
        low_below: 36.0,
    },
    Band {
        field: "pulse_bpm",
        label: "Pulse",
        critical_at: 120.0,
        high_at: 100.0,
        low_below: 60.0,
    },
    Band {
        field: "fbs",
        label: "Fasting blood sugar",
        critical_at: 400.0,
        high_at: 126.0,
        low_below: 70.0,
    },
];

/// Parse one numeric vitals field; blank or malformed values yield None
fn parse_field(fields: &BTreeMap<String, String>, name: &str) -> Option<f64> {
    let value: f64 = fields.get(name)?.trim().parse().ok()?;
    if value.is_finite() {
        Some(value)
    } else {
        None
    }
}

fn classify(value: f64, band: &Band) -> Option<VitalAlert> {
    let (level, message) = if value >= band.critical_at {
        (AlertLevel::Critical, format!("{} critically high", band.label))
    } else if value >= band.high_at {
        (AlertLevel::High, format!("{} high", band.label))
    } else if value < band.low_below {
        (AlertLevel::Low, format!("{} below normal", band.label))
    } else {
        return None;
    };
    Some(VitalAlert {
        metric: band.field.to_string(),
        value,
        level,
        message,
    })
}

/// Evaluate every banded metric in the vitals fields.
///
/// Metrics that are absent or unparseable produce no alert.
pub fn evaluate(fields: &BTreeMap<String, String>) -> Vec<VitalAlert> {
    BANDS
        .iter()
        .filter_map(|band| parse_field(fields, band.field).and_then(|v| classify(v, band)))
        .collect()
}

/// Alerts plus derived values for one vitals snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VitalsReport {
    pub alerts: Vec<VitalAlert>,
    pub bmi: Option<f64>,
}

/// Evaluate a vitals snapshot into the report shown beside the form
pub fn report(fields: &BTreeMap<String, String>) -> VitalsReport {
    VitalsReport {
        alerts: evaluate(fields),
        bmi: bmi(fields),
    }
}

/// Body mass index from the height/weight fields, rounded to 2 decimals.
///
/// Returns None unless both values parse and are positive.
pub fn bmi(fields: &BTreeMap<String, String>) -> Option<f64> {
    let height_cm = parse_field(fields, "height_cm")?;
    let weight_kg = parse_field(fields, "weight_kg")?;
    if height_cm <= 0.0 || weight_kg <= 0.0 {
        return None;
    }
    let height_m = height_cm / 100.0;
    let raw = weight_kg / (height_m * height_m);
    Some((raw * 100.0).round() / 100.0)
}
