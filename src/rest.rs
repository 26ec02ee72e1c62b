//! REST client for the hospital EMR backend
//!
//! Implements every collaborator trait over the EMR's JSON API. Section
//! records live in per-section collections filtered by visit id; saves are
//! append-only POSTs so earlier versions stay queryable for audit.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::encounter::EncounterSummary;
use crate::providers::{
    DocumentRef, EncounterProvider, HistoryProvider, ProviderError, RecordStore, SummaryGenerator,
};
use crate::ranking::PatientHistory;
use crate::section::{SectionKind, SectionRecord};

/// Default EMR API base URL (local development)
pub const DEFAULT_API_URL: &str = "http://localhost:8000/api";

/// Timeout for API requests
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Backend collection holding a section's records, `None` for read-only tabs
fn collection_path(section: SectionKind) -> Option<&'static str> {
    match section {
        SectionKind::Notes => Some("medical-notes"),
        SectionKind::Vitals => Some("vitals"),
        SectionKind::LabOrders => Some("lab-orders"),
        SectionKind::Prescriptions => Some("prescriptions"),
        SectionKind::NursingOrders => Some("nursing-orders"),
        SectionKind::Referrals => Some("referrals"),
        SectionKind::History => None,
    }
}

/// Wire shape of one section record
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RecordPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    visit: String,
    fields: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    recorded_at: Option<DateTime<Utc>>,
}

impl RecordPayload {
    fn into_record(self, section: SectionKind) -> SectionRecord {
        SectionRecord {
            id: self.id,
            encounter_id: self.visit,
            section,
            fields: self.fields,
            recorded_at: self.recorded_at,
        }
    }
}

/// HTTP client for the EMR API
#[derive(Debug, Clone)]
pub struct RestEmrClient {
    http_client: reqwest::Client,
    base_url: String,
}

impl RestEmrClient {
    /// Create a client with the default request timeout
    pub fn new(base_url: &str) -> Result<Self, ProviderError> {
        Self::with_timeout(base_url, REQUEST_TIMEOUT)
    }

    /// Create a client with a caller-supplied request timeout
    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self, ProviderError> {
        let cleaned_url = base_url.trim_end_matches('/');
        info!("Creating EMR client with base_url: {}", cleaned_url);

        let parsed_url = url::Url::parse(cleaned_url)
            .map_err(|e| ProviderError::Url(format!("Invalid URL '{}': {}", cleaned_url, e)))?;

        if parsed_url.scheme() != "http" && parsed_url.scheme() != "https" {
            return Err(ProviderError::Url(format!(
                "URL must use http or https scheme, got: {}",
                parsed_url.scheme()
            )));
        }

        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            http_client,
            base_url: cleaned_url.to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, ProviderError> {
        let status = response.status();
        match status {
            s if s.is_success() => Ok(response.json().await?),
            StatusCode::NOT_FOUND => Err(ProviderError::NotFound(
                "Resource not found".to_string(),
            )),
            _ => {
                let error_body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "Unable to read error body".to_string());
                Err(ProviderError::Backend {
                    status: status.as_u16(),
                    message: error_body,
                })
            }
        }
    }

    /// Like `handle_response` for endpoints whose success body is empty
    async fn ensure_success(&self, response: reqwest::Response) -> Result<(), ProviderError> {
        let status = response.status();
        match status {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(ProviderError::NotFound(
                "Resource not found".to_string(),
            )),
            _ => {
                let error_body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "Unable to read error body".to_string());
                Err(ProviderError::Backend {
                    status: status.as_u16(),
                    message: error_body,
                })
            }
        }
    }
}

#[async_trait]
impl EncounterProvider for RestEmrClient {
    async fn fetch_encounter(&self, encounter_id: &str) -> Result<EncounterSummary, ProviderError> {
        let response = self
            .http_client
            .get(format!("{}/visits/{}/", self.base_url, encounter_id))
            .send()
            .await?;

        match self.handle_response(response).await {
            Err(ProviderError::NotFound(_)) => {
                Err(ProviderError::NotFound(format!("Visit {}", encounter_id)))
            }
            other => other,
        }
    }

    async fn complete_encounter(&self, encounter_id: &str) -> Result<(), ProviderError> {
        let body = serde_json::json!({
            "status": "completed",
            "release_room": true,
        });
        let response = self
            .http_client
            .patch(format!("{}/visits/{}/", self.base_url, encounter_id))
            .json(&body)
            .send()
            .await?;

        self.ensure_success(response).await
    }
}

#[async_trait]
impl RecordStore for RestEmrClient {
    async fn list_records(
        &self,
        encounter_id: &str,
        section: SectionKind,
    ) -> Result<Vec<SectionRecord>, ProviderError> {
        let Some(path) = collection_path(section) else {
            return Err(ProviderError::UnsupportedSection(
                section.as_str().to_string(),
            ));
        };

        let response = self
            .http_client
            .get(format!("{}/{}/", self.base_url, path))
            .query(&[("visit", encounter_id), ("ordering", "-recorded_at")])
            .send()
            .await?;

        let payloads: Vec<RecordPayload> = self.handle_response(response).await?;
        Ok(payloads
            .into_iter()
            .map(|p| p.into_record(section))
            .collect())
    }

    async fn create_record(
        &self,
        encounter_id: &str,
        section: SectionKind,
        fields: BTreeMap<String, String>,
    ) -> Result<SectionRecord, ProviderError> {
        let Some(path) = collection_path(section) else {
            return Err(ProviderError::UnsupportedSection(
                section.as_str().to_string(),
            ));
        };

        let payload = RecordPayload {
            id: None,
            visit: encounter_id.to_string(),
            fields,
            recorded_at: None,
        };
        let response = self
            .http_client
            .post(format!("{}/{}/", self.base_url, path))
            .json(&payload)
            .send()
            .await?;

        let created: RecordPayload = self.handle_response(response).await?;
        Ok(created.into_record(section))
    }
}

#[async_trait]
impl HistoryProvider for RestEmrClient {
    async fn fetch_history(&self, patient_id: &str) -> Result<PatientHistory, ProviderError> {
        let response = self
            .http_client
            .get(format!("{}/patients/{}/history/", self.base_url, patient_id))
            .send()
            .await?;

        self.handle_response(response).await
    }
}

#[async_trait]
impl SummaryGenerator for RestEmrClient {
    async fn generate(&self, encounter_id: &str) -> Result<DocumentRef, ProviderError> {
        let response = self
            .http_client
            .post(format!("{}/visits/{}/summary/", self.base_url, encounter_id))
            .send()
            .await?;

        self.handle_response(response).await
    }
}
