//! Relevance Ranker
//!
//! Scores historical clinical records against the active encounter and
//! orders them for display. Pure functions of their inputs; the history
//! collaborator fetches, this module ranks.

use chrono::{Months, NaiveDate};
use serde::{Deserialize, Serialize};

/// Weight for a chief-complaint text match
pub const TEXT_MATCH_WEIGHT: f64 = 0.5;
/// Weight for a record by the same doctor
pub const SAME_DOCTOR_WEIGHT: f64 = 0.2;
/// Weight for a record within the recency window
pub const RECENT_WEIGHT: f64 = 0.3;
/// Records dated within this many months count as recent (boundary included)
pub const RECENT_WINDOW_MONTHS: u32 = 3;

/// Variant payload of a historical record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RecordDetails {
    Visit { complaint: String, diagnosis: String },
    Medication { name: String, dosage: String },
    Lab { test_name: String, result: String },
    Allergy { substance: String, reaction: String },
}

/// One item of the patient's clinical history.
///
/// Immutable to this core apart from `relevance_score`, which the ranker
/// recomputes once per encounter load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalRecord {
    pub id: String,
    pub recorded_by: Option<String>,
    pub recorded_on: Option<NaiveDate>,
    #[serde(flatten)]
    pub details: RecordDetails,
    #[serde(default)]
    pub relevance_score: f64,
}

impl HistoricalRecord {
    /// The free text the complaint match runs against
    pub fn search_text(&self) -> String {
        match &self.details {
            RecordDetails::Visit {
                complaint,
                diagnosis,
            } => format!("{} {}", complaint, diagnosis),
            RecordDetails::Medication { name, .. } => name.clone(),
            RecordDetails::Lab { test_name, .. } => test_name.clone(),
            RecordDetails::Allergy { substance, .. } => substance.clone(),
        }
    }

    pub fn kind_str(&self) -> &'static str {
        match self.details {
            RecordDetails::Visit { .. } => "visit",
            RecordDetails::Medication { .. } => "medication",
            RecordDetails::Lab { .. } => "lab",
            RecordDetails::Allergy { .. } => "allergy",
        }
    }
}

/// History collaborator payload, grouped the way the backend returns it
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatientHistory {
    #[serde(default)]
    pub visits: Vec<HistoricalRecord>,
    #[serde(default)]
    pub medications: Vec<HistoricalRecord>,
    #[serde(default)]
    pub labs: Vec<HistoricalRecord>,
    #[serde(default)]
    pub allergies: Vec<HistoricalRecord>,
}

impl PatientHistory {
    /// Flatten the groups in fetch order
    pub fn into_records(self) -> Vec<HistoricalRecord> {
        let mut records = self.visits;
        records.extend(self.medications);
        records.extend(self.labs);
        records.extend(self.allergies);
        records
    }

    pub fn record_count(&self) -> usize {
        self.visits.len() + self.medications.len() + self.labs.len() + self.allergies.len()
    }
}

/// The parts of the active encounter the ranker reads
#[derive(Debug, Clone, PartialEq)]
pub struct RankContext {
    pub encounter_id: String,
    pub doctor_id: String,
    pub chief_complaint: String,
}

/// True if `date` falls within the trailing recency window ending today
fn is_recent(date: NaiveDate, today: NaiveDate) -> bool {
    today
        .checked_sub_months(Months::new(RECENT_WINDOW_MONTHS))
        .map(|cutoff| date >= cutoff)
        .unwrap_or(false)
}

/// Score one record against the encounter context.
///
/// Only the current-complaint-in-historical-text direction is checked;
/// the weights are fixed product constants. Capped at 1.0.
fn score_record(context: &RankContext, record: &HistoricalRecord, today: NaiveDate) -> f64 {
    let mut score = 0.0;

    let complaint = context.chief_complaint.to_lowercase();
    if record.search_text().to_lowercase().contains(&complaint) {
        score += TEXT_MATCH_WEIGHT;
    }

    if !context.doctor_id.is_empty()
        && record.recorded_by.as_deref() == Some(context.doctor_id.as_str())
    {
        score += SAME_DOCTOR_WEIGHT;
    }

    if let Some(date) = record.recorded_on {
        if is_recent(date, today) {
            score += RECENT_WEIGHT;
        }
    }

    score.min(1.0)
}

/// Score and order historical records for the active encounter.
///
/// The record matching the encounter's own id always sorts first; the rest
/// sort by descending score with ties keeping fetch order. Without an
/// encounter context all scores are zero and fetch order is preserved.
pub fn rank_history(
    context: Option<&RankContext>,
    mut records: Vec<HistoricalRecord>,
    today: NaiveDate,
) -> Vec<HistoricalRecord> {
    let Some(context) = context else {
        for record in &mut records {
            record.relevance_score = 0.0;
        }
        return records;
    };

    for record in &mut records {
        record.relevance_score = score_record(context, record, today);
    }

    records.sort_by(|a, b| {
        let a_is_current = a.id == context.encounter_id;
        let b_is_current = b.id == context.encounter_id;
        b_is_current.cmp(&a_is_current).then_with(|| {
            b.relevance_score
                .partial_cmp(&a.relevance_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
    });

    records
}
