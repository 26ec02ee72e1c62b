//! Clinical Section Store
//!
//! Per-section form state for one consultation encounter. Each section owns
//! its raw field values, dirty flag, last-saved timestamp, and validation
//! errors. Stores hold no I/O; the lifecycle controller moves snapshots in
//! and out of the record-store collaborator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// The clinical documentation tabs of a consultation
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum SectionKind {
    Notes,
    Vitals,
    LabOrders,
    Prescriptions,
    NursingOrders,
    Referrals,
    History,
}

impl SectionKind {
    /// All tabs in display order
    pub const ALL: [SectionKind; 7] = [
        SectionKind::Notes,
        SectionKind::Vitals,
        SectionKind::LabOrders,
        SectionKind::Prescriptions,
        SectionKind::NursingOrders,
        SectionKind::Referrals,
        SectionKind::History,
    ];

    /// The sections that hold editable documentation (history is read-only)
    pub const EDITABLE: [SectionKind; 6] = [
        SectionKind::Notes,
        SectionKind::Vitals,
        SectionKind::LabOrders,
        SectionKind::Prescriptions,
        SectionKind::NursingOrders,
        SectionKind::Referrals,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SectionKind::Notes => "notes",
            SectionKind::Vitals => "vitals",
            SectionKind::LabOrders => "lab-orders",
            SectionKind::Prescriptions => "prescriptions",
            SectionKind::NursingOrders => "nursing-orders",
            SectionKind::Referrals => "referrals",
            SectionKind::History => "history",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SectionKind::Notes => "Medical Notes",
            SectionKind::Vitals => "Vital Signs",
            SectionKind::LabOrders => "Lab Orders",
            SectionKind::Prescriptions => "Prescriptions",
            SectionKind::NursingOrders => "Nursing Orders",
            SectionKind::Referrals => "Referrals",
            SectionKind::History => "Patient History",
        }
    }

    pub fn is_editable(&self) -> bool {
        !matches!(self, SectionKind::History)
    }

    /// Field template for this section
    pub fn field_names(&self) -> &'static [&'static str] {
        match self {
            SectionKind::Notes => &[
                "presenting_complaint",
                "history_of_complaint",
                "examination_findings",
                "clinical_impression",
                "diagnosis",
                "plan_of_care",
            ],
            SectionKind::Vitals => &[
                "height_cm",
                "weight_kg",
                "temperature_c",
                "pulse_bpm",
                "respiratory_rate",
                "blood_pressure_systolic",
                "blood_pressure_diastolic",
                "oxygen_saturation",
                "fbs",
                "rbs",
                "pain_scale",
                "comment",
            ],
            SectionKind::LabOrders => &[
                "test_name",
                "priority",
                "clinical_notes",
                "special_instructions",
            ],
            SectionKind::Prescriptions => &[
                "medication",
                "dosage",
                "frequency",
                "duration",
                "route",
                "instructions",
            ],
            SectionKind::NursingOrders => &[
                "order_type",
                "priority",
                "instructions",
                "frequency",
            ],
            SectionKind::Referrals => &["facility", "specialty", "urgency", "reason"],
            SectionKind::History => &[],
        }
    }

    /// Fields that must be non-empty before a manual submit is accepted
    pub fn required_fields(&self) -> &'static [&'static str] {
        match self {
            SectionKind::Notes => &[
                "presenting_complaint",
                "clinical_impression",
                "diagnosis",
                "plan_of_care",
            ],
            SectionKind::Vitals => &[],
            SectionKind::LabOrders => &["test_name"],
            SectionKind::Prescriptions => &["medication", "dosage", "frequency", "duration"],
            SectionKind::NursingOrders => &["order_type", "instructions"],
            SectionKind::Referrals => &["facility", "specialty", "reason"],
            SectionKind::History => &[],
        }
    }
}

/// Section store errors
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum SectionError {
    #[error("Section '{0}' is read-only")]
    ReadOnly(String),
    #[error("Unknown field '{field}' for section '{section}'")]
    UnknownField { section: String, field: String },
    #[error("{0} required field(s) are empty")]
    Validation(usize),
}

/// One saved version of a section's fields, as returned by the record store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionRecord {
    pub id: Option<String>,
    pub encounter_id: String,
    pub section: SectionKind,
    pub fields: BTreeMap<String, String>,
    pub recorded_at: Option<DateTime<Utc>>,
}

/// Serializable view of a store for status events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectionStatus {
    pub section: SectionKind,
    pub dirty: bool,
    pub last_saved: Option<DateTime<Utc>>,
    pub error_count: usize,
}

/// Form state for one clinical section, scoped to one encounter.
///
/// Saves are append-only at the backing store; the newest record seeds the
/// editable fields on load.
#[derive(Debug, Clone)]
pub struct SectionStore {
    kind: SectionKind,
    encounter_id: String,
    fields: BTreeMap<String, String>,
    dirty: bool,
    last_saved: Option<DateTime<Utc>>,
    errors: BTreeMap<String, String>,
}

impl SectionStore {
    pub fn new(kind: SectionKind, encounter_id: &str) -> Self {
        let fields = kind
            .field_names()
            .iter()
            .map(|name| (name.to_string(), String::new()))
            .collect();
        Self {
            kind,
            encounter_id: encounter_id.to_string(),
            fields,
            dirty: false,
            last_saved: None,
            errors: BTreeMap::new(),
        }
    }

    pub fn kind(&self) -> SectionKind {
        self.kind
    }

    pub fn encounter_id(&self) -> &str {
        &self.encounter_id
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(|v| v.as_str())
    }

    pub fn fields(&self) -> &BTreeMap<String, String> {
        &self.fields
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn last_saved(&self) -> Option<DateTime<Utc>> {
        self.last_saved
    }

    pub fn errors(&self) -> &BTreeMap<String, String> {
        &self.errors
    }

    /// Seed editable fields from the newest persisted record.
    ///
    /// Only known template fields are taken; a loaded record never marks the
    /// store dirty.
    pub fn apply_latest(&mut self, record: &SectionRecord) {
        for name in self.kind.field_names() {
            if let Some(value) = record.fields.get(*name) {
                self.fields.insert(name.to_string(), value.clone());
            }
        }
        self.dirty = false;
        self.last_saved = record.recorded_at;
    }

    /// Update one field and mark the section dirty.
    ///
    /// The caller is responsible for (re)scheduling the autosave.
    pub fn set_field(&mut self, name: &str, value: &str) -> Result<(), SectionError> {
        if !self.kind.is_editable() {
            return Err(SectionError::ReadOnly(self.kind.as_str().to_string()));
        }
        if !self.kind.field_names().contains(&name) {
            return Err(SectionError::UnknownField {
                section: self.kind.as_str().to_string(),
                field: name.to_string(),
            });
        }
        self.fields.insert(name.to_string(), value.to_string());
        self.errors.remove(name);
        self.dirty = true;
        Ok(())
    }

    /// Check required fields before a manual submit.
    ///
    /// Populates per-field error messages and returns how many are missing.
    /// Autosave skips this check so drafts persist as-is.
    pub fn validate(&mut self) -> Result<(), SectionError> {
        self.errors.clear();
        for name in self.kind.required_fields() {
            let empty = self
                .fields
                .get(*name)
                .map(|v| v.trim().is_empty())
                .unwrap_or(true);
            if empty {
                self.errors.insert(
                    name.to_string(),
                    format!("{} is required", field_label(name)),
                );
            }
        }
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(SectionError::Validation(self.errors.len()))
        }
    }

    /// True once every required field has content (used for progress marking)
    pub fn required_fields_present(&self) -> bool {
        self.kind.required_fields().iter().all(|name| {
            self.fields
                .get(*name)
                .map(|v| !v.trim().is_empty())
                .unwrap_or(false)
        })
    }

    /// Current field values for a persistence call
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.fields.clone()
    }

    /// Record a successful save
    pub fn mark_saved(&mut self, at: DateTime<Utc>) {
        self.dirty = false;
        self.last_saved = Some(at);
        self.errors.clear();
    }

    pub fn status(&self) -> SectionStatus {
        SectionStatus {
            section: self.kind,
            dirty: self.dirty,
            last_saved: self.last_saved,
            error_count: self.errors.len(),
        }
    }
}

/// Human-readable field name for validation messages
fn field_label(name: &str) -> String {
    let mut label = name.replace('_', " ");
    if let Some(first) = label.get_mut(0..1) {
        first.make_ascii_uppercase();
    }
    label
}
