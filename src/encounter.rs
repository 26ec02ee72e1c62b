use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// Encounter status over the session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EncounterStatus {
    Active,
    Ending,
    Ended,
    TimedOut,
}

impl EncounterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EncounterStatus::Active => "active",
            EncounterStatus::Ending => "ending",
            EncounterStatus::Ended => "ended",
            EncounterStatus::TimedOut => "timed-out",
        }
    }
}

/// Encounter state errors
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum EncounterError {
    #[error("Invalid status transition: {0}")]
    InvalidTransition(String),
}

/// Patient details shown in the session header
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientSummary {
    pub id: String,
    pub name: String,
    pub age: Option<u32>,
    pub gender: Option<String>,
    pub blood_group: Option<String>,
    #[serde(default)]
    pub known_allergies: Vec<String>,
}

/// Provider payload for an encounter fetch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncounterSummary {
    pub id: String,
    pub patient: PatientSummary,
    pub doctor_id: String,
    pub chief_complaint: String,
}

/// One doctor-patient consultation, bounded by a visit identifier.
///
/// Owned exclusively by the lifecycle controller; created on session start
/// and discarded on end or timeout.
#[derive(Debug, Clone)]
pub struct Encounter {
    pub id: String,
    pub patient: PatientSummary,
    pub doctor_id: String,
    pub chief_complaint: String,
    pub started_at: DateTime<Utc>,
    status: EncounterStatus,
}

impl Encounter {
    pub fn from_summary(summary: EncounterSummary) -> Self {
        Self {
            id: summary.id,
            patient: summary.patient,
            doctor_id: summary.doctor_id,
            chief_complaint: summary.chief_complaint,
            started_at: Utc::now(),
            status: EncounterStatus::Active,
        }
    }

    pub fn status(&self) -> EncounterStatus {
        self.status
    }

    pub fn is_active(&self) -> bool {
        self.status == EncounterStatus::Active
    }

    /// Terminal means no further documentation is possible
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, EncounterStatus::Ended | EncounterStatus::TimedOut)
    }

    /// Transition to ending while the end-of-session flow runs
    pub fn begin_ending(&mut self) -> Result<(), EncounterError> {
        if self.status != EncounterStatus::Active {
            return Err(EncounterError::InvalidTransition(format!(
                "Cannot begin ending from status {:?}",
                self.status
            )));
        }
        info!("Encounter {} transitioning to Ending", self.id);
        self.status = EncounterStatus::Ending;
        Ok(())
    }

    /// Abort an end attempt that failed partway and return to active
    pub fn resume_active(&mut self) -> Result<(), EncounterError> {
        if self.status != EncounterStatus::Ending {
            return Err(EncounterError::InvalidTransition(format!(
                "Cannot resume from status {:?}",
                self.status
            )));
        }
        info!("Encounter {} returning to Active after aborted end", self.id);
        self.status = EncounterStatus::Active;
        Ok(())
    }

    /// Transition to the ended terminal state
    pub fn finish(&mut self) -> Result<(), EncounterError> {
        if self.status != EncounterStatus::Ending {
            return Err(EncounterError::InvalidTransition(format!(
                "Cannot finish from status {:?}",
                self.status
            )));
        }
        info!("Encounter {} transitioning to Ended", self.id);
        self.status = EncounterStatus::Ended;
        Ok(())
    }

    /// Transition to the timed-out terminal state
    pub fn time_out(&mut self) -> Result<(), EncounterError> {
        if self.is_terminal() {
            return Err(EncounterError::InvalidTransition(format!(
                "Cannot time out from status {:?}",
                self.status
            )));
        }
        info!("Encounter {} transitioning to TimedOut", self.id);
        self.status = EncounterStatus::TimedOut;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_summary() -> EncounterSummary {
        EncounterSummary {
            id: "visit-42".to_string(),
            patient: PatientSummary {
                id: "patient-7".to_string(),
                name: "Test Patient".to_string(),
                age: Some(54),
                gender: Some("female".to_string()),
                blood_group: Some("O+".to_string()),
                known_allergies: vec!["penicillin".to_string()],
            },
            doctor_id: "doctor-3".to_string(),
            chief_complaint: "hypertension follow-up".to_string(),
        }
    }

    #[test]
    fn test_new_encounter_is_active() {
        let encounter = Encounter::from_summary(sample_summary());
        assert_eq!(encounter.status(), EncounterStatus::Active);
        assert!(encounter.is_active());
        assert!(!encounter.is_terminal());
    }

    #[test]
    fn test_end_flow_transitions() {
        let mut encounter = Encounter::from_summary(sample_summary());
        encounter.begin_ending().unwrap();
        assert_eq!(encounter.status(), EncounterStatus::Ending);

        encounter.finish().unwrap();
        assert_eq!(encounter.status(), EncounterStatus::Ended);
        assert!(encounter.is_terminal());
    }

    #[test]
    fn test_aborted_end_returns_to_active() {
        let mut encounter = Encounter::from_summary(sample_summary());
        encounter.begin_ending().unwrap();
        encounter.resume_active().unwrap();
        assert!(encounter.is_active());
    }

    #[test]
    fn test_timeout_from_active() {
        let mut encounter = Encounter::from_summary(sample_summary());
        encounter.time_out().unwrap();
        assert_eq!(encounter.status(), EncounterStatus::TimedOut);
        assert!(encounter.is_terminal());
    }

    #[test]
    fn test_timeout_while_ending() {
        let mut encounter = Encounter::from_summary(sample_summary());
        encounter.begin_ending().unwrap();
        encounter.time_out().unwrap();
        assert_eq!(encounter.status(), EncounterStatus::TimedOut);
    }

    #[test]
    fn test_cannot_finish_from_active() {
        let mut encounter = Encounter::from_summary(sample_summary());
        assert!(encounter.finish().is_err());
    }

    #[test]
    fn test_cannot_end_twice() {
        let mut encounter = Encounter::from_summary(sample_summary());
        encounter.begin_ending().unwrap();
        encounter.finish().unwrap();
        assert!(encounter.begin_ending().is_err());
        assert!(encounter.time_out().is_err());
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&EncounterStatus::TimedOut).unwrap();
        assert_eq!(json, "\"timed-out\"");

        let json = serde_json::to_string(&EncounterStatus::Active).unwrap();
        assert_eq!(json, "\"active\"");
    }

    #[test]
    fn test_status_as_str_matches_serde() {
        for status in [
            EncounterStatus::Active,
            EncounterStatus::Ending,
            EncounterStatus::Ended,
            EncounterStatus::TimedOut,
        ] {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
        }
    }

    #[test]
    fn test_summary_deserialization_without_allergies() {
        let json = r#"{
            "id": "visit-1",
            "patient": {"id": "p-1", "name": "A", "age": null, "gender": null, "blood_group": null},
            "doctor_id": "d-1",
            "chief_complaint": "headache"
        }"#;
        let summary: EncounterSummary = serde_json::from_str(json).unwrap();
        assert!(summary.patient.known_allergies.is_empty());
    }
}
