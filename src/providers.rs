//! Collaborator interfaces for the session controller
//!
//! The controller talks to the outside world only through these traits:
//! encounter lookup/completion, per-section record persistence, patient
//! history, summary generation, and page navigation. The REST client in
//! `rest` implements the async traits against the EMR backend; tests
//! substitute in-memory fakes.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::encounter::EncounterSummary;
use crate::ranking::PatientHistory;
use crate::section::{SectionKind, SectionRecord};

/// Errors from collaborator calls
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Backend rejected the request ({status}): {message}")]
    Backend { status: u16, message: String },

    #[error("Section '{0}' has no backing collection")]
    UnsupportedSection(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    Url(String),
}

impl ProviderError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ProviderError::NotFound(_))
    }
}

/// Why the controller forced a page change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RedirectReason {
    Timeout,
    Completed,
}

impl RedirectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RedirectReason::Timeout => "timeout",
            RedirectReason::Completed => "completed",
        }
    }
}

/// Reference to a generated consultation summary document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRef {
    pub id: String,
    pub url: Option<String>,
}

/// Visit lookup and completion
#[async_trait]
pub trait EncounterProvider: Send + Sync {
    /// Fetch the visit a consultation is being opened for
    async fn fetch_encounter(&self, encounter_id: &str) -> Result<EncounterSummary, ProviderError>;

    /// Mark the visit completed and release its consultation room
    async fn complete_encounter(&self, encounter_id: &str) -> Result<(), ProviderError>;
}

/// Append-only persistence for section records
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Saved record versions for one section, most recent first
    async fn list_records(
        &self,
        encounter_id: &str,
        section: SectionKind,
    ) -> Result<Vec<SectionRecord>, ProviderError>;

    /// Persist a new record version for one section
    async fn create_record(
        &self,
        encounter_id: &str,
        section: SectionKind,
        fields: BTreeMap<String, String>,
    ) -> Result<SectionRecord, ProviderError>;
}

/// Patient history lookup
#[async_trait]
pub trait HistoryProvider: Send + Sync {
    async fn fetch_history(&self, patient_id: &str) -> Result<PatientHistory, ProviderError>;
}

/// Consultation summary document generation
#[async_trait]
pub trait SummaryGenerator: Send + Sync {
    async fn generate(&self, encounter_id: &str) -> Result<DocumentRef, ProviderError>;
}

/// Page navigation at the embedding boundary.
///
/// Implementations must not block; the controller calls this from async
/// context after the session reaches a terminal state.
pub trait Navigation: Send + Sync {
    fn redirect(&self, path: &str, reason: RedirectReason);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_detection() {
        let err = ProviderError::NotFound("Visit v1".to_string());
        assert!(err.is_not_found());

        let err = ProviderError::Backend {
            status: 500,
            message: "boom".to_string(),
        };
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_error_display_includes_status() {
        let err = ProviderError::Backend {
            status: 422,
            message: "validation failed".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("422"));
        assert!(text.contains("validation failed"));
    }

    #[test]
    fn test_redirect_reason_serializes_lowercase() {
        let json = serde_json::to_string(&RedirectReason::Timeout).unwrap();
        assert_eq!(json, "\"timeout\"");
        let json = serde_json::to_string(&RedirectReason::Completed).unwrap();
        assert_eq!(json, "\"completed\"");
    }

    #[test]
    fn test_document_ref_round_trips() {
        let doc = DocumentRef {
            id: "doc-1".to_string(),
            url: Some("https://emr.example.com/docs/doc-1".to_string()),
        };
        let json = serde_json::to_string(&doc).unwrap();
        let back: DocumentRef = serde_json::from_str(&json).unwrap();
        assert_eq!(back, doc);
    }
}
