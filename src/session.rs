//! Consultation session lifecycle controller
//!
//! Owns one doctor-patient consultation from open to close: seeds the
//! section stores from saved records, ranks the patient's history against
//! the chief complaint, debounces autosaves, runs the countdown guard, and
//! drives the end-of-session flow. All user feedback is emitted as
//! `SessionEvent`s on a channel the embedding UI consumes; the controller
//! itself never blocks on the user.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use crate::audit;
use crate::autosave::AutosaveScheduler;
use crate::config::AppConfig;
use crate::encounter::{Encounter, EncounterStatus};
use crate::navigator::{
    resolve_shortcut, Progress, ProgressSnapshot, SectionNavigator, ShortcutAction,
};
use crate::providers::{
    EncounterProvider, HistoryProvider, Navigation, ProviderError, RecordStore, RedirectReason,
    SummaryGenerator,
};
use crate::ranking::{rank_history, HistoricalRecord, RankContext};
use crate::section::{SectionError, SectionKind, SectionStatus, SectionStore};
use crate::timer::{start_session_timer, SessionClock, SessionTimerHandle, TimerEvent, TimerPhase};
use crate::vitals::{self, VitalsReport};

/// Destination after a timeout logout
pub const LOGIN_PATH: &str = "/login";

/// Destination after a normal end
pub const DASHBOARD_PATH: &str = "/dashboard";

/// Destination when the doctor asked for a follow-up booking
pub const FOLLOW_UP_PATH: &str = "/appointments/new";

/// The controller's collaborators, injected at session start
#[derive(Clone)]
pub struct Collaborators {
    pub encounters: Arc<dyn EncounterProvider>,
    pub records: Arc<dyn RecordStore>,
    pub history: Arc<dyn HistoryProvider>,
    pub summaries: Arc<dyn SummaryGenerator>,
    pub navigation: Arc<dyn Navigation>,
}

/// What initiated a section save
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveTrigger {
    Manual,
    Autosave,
    SaveAll,
    Timeout,
}

impl SaveTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            SaveTrigger::Manual => "manual",
            SaveTrigger::Autosave => "autosave",
            SaveTrigger::SaveAll => "save_all",
            SaveTrigger::Timeout => "timeout",
        }
    }
}

/// Notification for the embedding UI.
///
/// `AutosaveFailed` is informational; autosave failures must never
/// interrupt documentation flow with a blocking prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    Started {
        encounter_id: String,
        patient_name: String,
        budget_secs: u64,
    },
    SectionLoaded {
        section: SectionKind,
        seeded: bool,
    },
    HistoryRanked {
        record_count: usize,
    },
    SectionSaved {
        section: SectionKind,
        trigger: SaveTrigger,
    },
    AutosaveFailed {
        section: SectionKind,
        message: String,
    },
    VitalsEvaluated {
        report: VitalsReport,
    },
    ProgressChanged {
        progress: ProgressSnapshot,
    },
    TimeoutWarning {
        remaining_secs: u64,
    },
    TimerExtended {
        remaining_secs: u64,
    },
    SessionExpired {
        unsaved_sections: usize,
    },
    SessionEnded {
        destination: String,
    },
}

/// Errors surfaced by session operations
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Encounter not found: {0}")]
    NotFound(String),

    #[error("Failed to load encounter: {0}")]
    Load(#[source] ProviderError),

    #[error("Session is not active")]
    NotActive,

    #[error(transparent)]
    Section(#[from] SectionError),

    #[error("Saving {} failed: {source}", .section.as_str())]
    SaveFailed {
        section: SectionKind,
        #[source]
        source: ProviderError,
    },

    #[error("Session state unavailable: {0}")]
    State(String),
}

/// Outcome of one section's save within a multi-section flush
#[derive(Debug)]
pub struct SectionSaveReport {
    pub section: SectionKind,
    pub result: Result<(), ProviderError>,
}

impl SectionSaveReport {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

fn failed_count(reports: &[SectionSaveReport]) -> usize {
    reports.iter().filter(|r| r.result.is_err()).count()
}

/// Why an end-of-session attempt did not complete.
///
/// In every case the session stays active so the doctor can retry.
#[derive(Debug, Error)]
pub enum EndError {
    #[error("Session is not active")]
    NotActive,

    #[error("{} section(s) failed to save", failed_count(.0))]
    SaveFailed(Vec<SectionSaveReport>),

    #[error("Summary generation failed: {0}")]
    Summary(#[source] ProviderError),

    #[error("Completing the visit failed: {0}")]
    Complete(#[source] ProviderError),
}

/// Confirmation prompt built by `request_end`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndPrompt {
    pub dirty_sections: Vec<SectionKind>,
    pub message: String,
}

/// Choices the doctor makes when confirming the end of a consultation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndOptions {
    /// Route to appointment booking instead of the dashboard
    pub follow_up: bool,
}

/// Point-in-time view of the session for display
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStatus {
    pub session_id: String,
    pub encounter_id: String,
    pub encounter_status: EncounterStatus,
    pub patient_name: String,
    pub remaining_secs: u64,
    pub timer_phase: TimerPhase,
    pub active_section: SectionKind,
    pub progress: ProgressSnapshot,
    pub dirty_sections: Vec<SectionKind>,
}

/// State shared between the controller, the autosave tasks, and the
/// countdown guard. Plain mutexes; no lock is ever held across an await.
struct SessionShared {
    session_id: String,
    encounter: Mutex<Encounter>,
    stores: Mutex<BTreeMap<SectionKind, SectionStore>>,
    navigator: Mutex<SectionNavigator>,
    autosave: Mutex<AutosaveScheduler>,
    timer: Mutex<Option<SessionTimerHandle>>,
    history: Mutex<Vec<HistoricalRecord>>,
    events: mpsc::UnboundedSender<SessionEvent>,
    collaborators: Collaborators,
}

impl SessionShared {
    fn lock_encounter(&self) -> Result<MutexGuard<'_, Encounter>, SessionError> {
        self.encounter
            .lock()
            .map_err(|e| SessionError::State(e.to_string()))
    }

    fn lock_stores(
        &self,
    ) -> Result<MutexGuard<'_, BTreeMap<SectionKind, SectionStore>>, SessionError> {
        self.stores
            .lock()
            .map_err(|e| SessionError::State(e.to_string()))
    }

    fn lock_navigator(&self) -> Result<MutexGuard<'_, SectionNavigator>, SessionError> {
        self.navigator
            .lock()
            .map_err(|e| SessionError::State(e.to_string()))
    }

    fn lock_autosave(&self) -> Result<MutexGuard<'_, AutosaveScheduler>, SessionError> {
        self.autosave
            .lock()
            .map_err(|e| SessionError::State(e.to_string()))
    }

    fn lock_timer(&self) -> Result<MutexGuard<'_, Option<SessionTimerHandle>>, SessionError> {
        self.timer
            .lock()
            .map_err(|e| SessionError::State(e.to_string()))
    }

    fn encounter_id(&self) -> Result<String, SessionError> {
        Ok(self.lock_encounter()?.id.clone())
    }

    /// Send an event to the UI; a dropped receiver is not an error
    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn emit_progress(&self) {
        if let Ok(navigator) = self.navigator.lock() {
            self.emit(SessionEvent::ProgressChanged {
                progress: navigator.progress().snapshot(),
            });
        }
    }
}

/// One live consultation session.
///
/// Created by `start`, which also returns the event receiver. Most
/// operations require the session to still be active; after a timeout or a
/// confirmed end they return `SessionError::NotActive`.
pub struct ConsultationSession {
    shared: Arc<SessionShared>,
}

impl ConsultationSession {
    /// Open a consultation for a visit.
    ///
    /// Fetches the encounter, seeds every editable section from its newest
    /// saved record, loads and ranks the patient's history, and starts the
    /// countdown. Section and history load failures fall back to empty
    /// state and never block the session; only an encounter fetch failure
    /// is fatal.
    pub async fn start(
        encounter_id: &str,
        config: AppConfig,
        collaborators: Collaborators,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>), SessionError> {
        let session_id = Uuid::new_v4().to_string();

        let summary = match collaborators.encounters.fetch_encounter(encounter_id).await {
            Ok(summary) => summary,
            Err(e) if e.is_not_found() => {
                return Err(SessionError::NotFound(encounter_id.to_string()))
            }
            Err(e) => return Err(SessionError::Load(e)),
        };
        let encounter = Encounter::from_summary(summary);
        audit::log_session_start(&session_id, encounter_id, config.session_budget_secs);

        let patient_id = encounter.patient.id.clone();
        let patient_name = encounter.patient.name.clone();
        let context = RankContext {
            encounter_id: encounter.id.clone(),
            doctor_id: encounter.doctor_id.clone(),
            chief_complaint: encounter.chief_complaint.clone(),
        };

        let mut stores = BTreeMap::new();
        for kind in SectionKind::EDITABLE {
            stores.insert(kind, SectionStore::new(kind, encounter_id));
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(SessionShared {
            session_id,
            encounter: Mutex::new(encounter),
            stores: Mutex::new(stores),
            navigator: Mutex::new(SectionNavigator::new()),
            autosave: Mutex::new(AutosaveScheduler::new(config.autosave_delay())),
            timer: Mutex::new(None),
            history: Mutex::new(Vec::new()),
            events: events_tx,
            collaborators,
        });

        shared.emit(SessionEvent::Started {
            encounter_id: encounter_id.to_string(),
            patient_name,
            budget_secs: config.session_budget_secs,
        });

        // Seed each editable section from its newest saved record
        for kind in SectionKind::EDITABLE {
            match shared
                .collaborators
                .records
                .list_records(encounter_id, kind)
                .await
            {
                Ok(records) => {
                    let seeded = {
                        let mut stores = shared.lock_stores()?;
                        match (stores.get_mut(&kind), records.first()) {
                            (Some(store), Some(newest)) => {
                                store.apply_latest(newest);
                                true
                            }
                            _ => false,
                        }
                    };
                    audit::log_section_load(
                        &shared.session_id,
                        kind.as_str(),
                        records.len(),
                        true,
                        None,
                    );
                    shared.emit(SessionEvent::SectionLoaded {
                        section: kind,
                        seeded,
                    });
                }
                Err(e) => {
                    // The blank template stands in; the session still opens
                    audit::log_section_load(
                        &shared.session_id,
                        kind.as_str(),
                        0,
                        false,
                        Some(&e.to_string()),
                    );
                    shared.emit(SessionEvent::SectionLoaded {
                        section: kind,
                        seeded: false,
                    });
                }
            }
        }

        // Patient history, ranked against this encounter
        match shared.collaborators.history.fetch_history(&patient_id).await {
            Ok(history) => {
                let ranked = rank_history(
                    Some(&context),
                    history.into_records(),
                    Utc::now().date_naive(),
                );
                audit::log_history_loaded(&shared.session_id, ranked.len(), true, None);
                shared.emit(SessionEvent::HistoryRanked {
                    record_count: ranked.len(),
                });
                if let Ok(mut slot) = shared.history.lock() {
                    *slot = ranked;
                }
            }
            Err(e) => {
                audit::log_history_loaded(&shared.session_id, 0, false, Some(&e.to_string()));
                shared.emit(SessionEvent::HistoryRanked { record_count: 0 });
            }
        }

        // Countdown and its guard task
        let clock = SessionClock::new(config.session_budget_secs, config.warning_threshold_secs);
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let handle = start_session_timer(clock, timer_tx);
        *shared.lock_timer()? = Some(handle);
        tokio::spawn(run_timeout_guard(shared.clone(), timer_rx));

        Ok((Self { shared }, events_rx))
    }

    pub fn session_id(&self) -> &str {
        &self.shared.session_id
    }

    pub fn encounter_status(&self) -> EncounterStatus {
        self.shared
            .encounter
            .lock()
            .map(|e| e.status())
            .unwrap_or(EncounterStatus::Ended)
    }

    pub fn remaining_secs(&self) -> u64 {
        self.shared
            .timer
            .lock()
            .ok()
            .and_then(|t| t.as_ref().map(|h| h.remaining_secs()))
            .unwrap_or(0)
    }

    pub fn timer_phase(&self) -> TimerPhase {
        self.shared
            .timer
            .lock()
            .ok()
            .and_then(|t| t.as_ref().map(|h| h.phase()))
            .unwrap_or(TimerPhase::Expired)
    }

    pub fn active_section(&self) -> SectionKind {
        self.shared
            .navigator
            .lock()
            .map(|n| n.active())
            .unwrap_or(SectionKind::Notes)
    }

    pub fn progress(&self) -> ProgressSnapshot {
        self.shared
            .navigator
            .lock()
            .map(|n| n.progress().snapshot())
            .unwrap_or_else(|_| Progress::new().snapshot())
    }

    pub fn dirty_sections(&self) -> Vec<SectionKind> {
        self.shared
            .stores
            .lock()
            .map(|stores| {
                stores
                    .iter()
                    .filter(|(_, store)| store.is_dirty())
                    .map(|(kind, _)| *kind)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Current field values of one section, if it is editable
    pub fn section_fields(&self, section: SectionKind) -> Option<BTreeMap<String, String>> {
        self.shared
            .stores
            .lock()
            .ok()
            .and_then(|stores| stores.get(&section).map(|s| s.snapshot()))
    }

    pub fn section_status(&self, section: SectionKind) -> Option<SectionStatus> {
        self.shared
            .stores
            .lock()
            .ok()
            .and_then(|stores| stores.get(&section).map(|s| s.status()))
    }

    /// Per-field validation messages from the last rejected save
    pub fn section_errors(&self, section: SectionKind) -> BTreeMap<String, String> {
        self.shared
            .stores
            .lock()
            .ok()
            .and_then(|stores| stores.get(&section).map(|s| s.errors().clone()))
            .unwrap_or_default()
    }

    /// The patient's history records, ranked most relevant first
    pub fn history(&self) -> Vec<HistoricalRecord> {
        self.shared
            .history
            .lock()
            .map(|h| h.clone())
            .unwrap_or_default()
    }

    /// Alerts and BMI for the vitals currently on screen
    pub fn vitals_report(&self) -> VitalsReport {
        let fields = self.section_fields(SectionKind::Vitals).unwrap_or_default();
        vitals::report(&fields)
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            session_id: self.shared.session_id.clone(),
            encounter_id: self
                .shared
                .encounter
                .lock()
                .map(|e| e.id.clone())
                .unwrap_or_default(),
            encounter_status: self.encounter_status(),
            patient_name: self
                .shared
                .encounter
                .lock()
                .map(|e| e.patient.name.clone())
                .unwrap_or_default(),
            remaining_secs: self.remaining_secs(),
            timer_phase: self.timer_phase(),
            active_section: self.active_section(),
            progress: self.progress(),
            dirty_sections: self.dirty_sections(),
        }
    }

    /// Update one field and restart that section's autosave window.
    ///
    /// Consecutive edits within the quiet period collapse into a single
    /// save carrying the latest values.
    pub fn set_field(
        &self,
        section: SectionKind,
        name: &str,
        value: &str,
    ) -> Result<(), SessionError> {
        self.ensure_active()?;
        {
            let mut stores = self.shared.lock_stores()?;
            let store = stores.get_mut(&section).ok_or_else(|| {
                SessionError::Section(SectionError::ReadOnly(section.as_str().to_string()))
            })?;
            store.set_field(name, value)?;
        }

        let shared = self.shared.clone();
        self.shared.lock_autosave()?.schedule(section, async move {
            autosave_section(shared, section).await;
        });
        Ok(())
    }

    /// Save one section now.
    ///
    /// Validates required fields first; a rejected save surfaces per-field
    /// messages through `section_errors`. On a backend failure the dirty
    /// flag stays set so the save can be retried.
    pub async fn save_section(&self, section: SectionKind) -> Result<(), SessionError> {
        self.ensure_active()?;
        let snapshot = {
            let mut stores = self.shared.lock_stores()?;
            let store = stores.get_mut(&section).ok_or_else(|| {
                SessionError::Section(SectionError::ReadOnly(section.as_str().to_string()))
            })?;
            match store.validate() {
                Ok(()) => {}
                Err(e) => {
                    if let SectionError::Validation(missing) = &e {
                        audit::log_validation_rejected(
                            &self.shared.session_id,
                            section.as_str(),
                            *missing,
                        );
                    }
                    return Err(SessionError::Section(e));
                }
            }
            store.snapshot()
        };

        // A pending autosave would duplicate this write
        self.shared.lock_autosave()?.cancel(section);

        let encounter_id = self.shared.encounter_id()?;
        let field_count = filled_field_count(&snapshot);
        match self
            .shared
            .collaborators
            .records
            .create_record(&encounter_id, section, snapshot.clone())
            .await
        {
            Ok(record) => {
                let saved_at = record.recorded_at.unwrap_or_else(Utc::now);
                let newly_marked = apply_save_success(&self.shared, section, &snapshot, saved_at);
                audit::log_section_save(
                    &self.shared.session_id,
                    section.as_str(),
                    SaveTrigger::Manual.as_str(),
                    field_count,
                    true,
                    None,
                );
                self.shared.emit(SessionEvent::SectionSaved {
                    section,
                    trigger: SaveTrigger::Manual,
                });
                if newly_marked {
                    self.shared.emit_progress();
                }
                if section == SectionKind::Vitals {
                    self.shared.emit(SessionEvent::VitalsEvaluated {
                        report: vitals::report(&snapshot),
                    });
                }
                Ok(())
            }
            Err(e) => {
                audit::log_section_save(
                    &self.shared.session_id,
                    section.as_str(),
                    SaveTrigger::Manual.as_str(),
                    field_count,
                    false,
                    Some(&e.to_string()),
                );
                Err(SessionError::SaveFailed { section, source: e })
            }
        }
    }

    /// Save every dirty section concurrently.
    ///
    /// One section's failure never blocks the others; each section reports
    /// its own outcome.
    pub async fn save_all(&self) -> Vec<SectionSaveReport> {
        save_dirty_sections(&self.shared, SaveTrigger::SaveAll).await
    }

    /// Change the active tab. Visiting vitals marks it complete.
    pub fn switch_section(&self, section: SectionKind) -> Result<(), SessionError> {
        self.ensure_active()?;
        let newly_marked = self.shared.lock_navigator()?.switch_to(section);
        if newly_marked {
            self.shared.emit_progress();
        }
        Ok(())
    }

    /// Resolve a keyboard shortcut and apply tab switches.
    ///
    /// `Save` is returned unapplied for the caller to run through
    /// `save_section`, since saving is async.
    pub fn handle_shortcut(
        &self,
        key: &str,
        alt: bool,
        ctrl: bool,
        in_text_field: bool,
    ) -> Result<Option<ShortcutAction>, SessionError> {
        self.ensure_active()?;
        let Some(action) = resolve_shortcut(key, alt, ctrl, in_text_field) else {
            return Ok(None);
        };
        if let ShortcutAction::SwitchTo(section) = action {
            self.switch_section(section)?;
        }
        Ok(Some(action))
    }

    /// Reset the countdown to the full budget; returns the new remaining
    /// time
    pub fn extend_timer(&self) -> Result<u64, SessionError> {
        self.ensure_active()?;
        let remaining = {
            let timer = self.shared.lock_timer()?;
            let Some(handle) = timer.as_ref() else {
                return Err(SessionError::State("timer not running".to_string()));
            };
            handle.extend()
        };
        audit::log_timer_extended(&self.shared.session_id, remaining);
        self.shared.emit(SessionEvent::TimerExtended {
            remaining_secs: remaining,
        });
        Ok(remaining)
    }

    /// Build the confirmation prompt for ending the consultation.
    ///
    /// No side effects; the caller shows the prompt and calls
    /// `confirm_end` only if the doctor accepts. The wording names unsaved
    /// work so nothing is lost silently.
    pub fn request_end(&self) -> Result<EndPrompt, SessionError> {
        self.ensure_active()?;
        let dirty_sections: Vec<SectionKind> = {
            let stores = self.shared.lock_stores()?;
            stores
                .iter()
                .filter(|(_, store)| store.is_dirty())
                .map(|(kind, _)| *kind)
                .collect()
        };
        let message = if dirty_sections.is_empty() {
            "End this consultation?".to_string()
        } else {
            format!(
                "Unsaved changes in {} section(s) will be saved first. End this consultation?",
                dirty_sections.len()
            )
        };
        Ok(EndPrompt {
            dirty_sections,
            message,
        })
    }

    /// Run the end-of-session flow: flush dirty sections, generate the
    /// summary document, complete the visit, then redirect.
    ///
    /// Any step failing returns the session to active with nothing
    /// terminated, so the doctor can fix the problem and retry.
    pub async fn confirm_end(&self, options: EndOptions) -> Result<(), EndError> {
        let encounter_id = {
            let Ok(mut encounter) = self.shared.encounter.lock() else {
                return Err(EndError::NotActive);
            };
            if encounter.begin_ending().is_err() {
                return Err(EndError::NotActive);
            }
            encounter.id.clone()
        };

        let reports = save_dirty_sections(&self.shared, SaveTrigger::SaveAll).await;
        let failed = failed_count(&reports);
        if failed > 0 {
            self.abort_end(
                &encounter_id,
                "save_sections",
                &format!("{} section save(s) failed", failed),
            );
            return Err(EndError::SaveFailed(reports));
        }

        match self
            .shared
            .collaborators
            .summaries
            .generate(&encounter_id)
            .await
        {
            Ok(document) => {
                audit::log_summary_generation(
                    &self.shared.session_id,
                    &encounter_id,
                    Some(&document.id),
                    true,
                    None,
                );
            }
            Err(e) => {
                audit::log_summary_generation(
                    &self.shared.session_id,
                    &encounter_id,
                    None,
                    false,
                    Some(&e.to_string()),
                );
                self.abort_end(&encounter_id, "summary", &e.to_string());
                return Err(EndError::Summary(e));
            }
        }

        if let Err(e) = self
            .shared
            .collaborators
            .encounters
            .complete_encounter(&encounter_id)
            .await
        {
            self.abort_end(&encounter_id, "complete_visit", &e.to_string());
            return Err(EndError::Complete(e));
        }

        let (duration_secs, finished) = match self.shared.encounter.lock() {
            Ok(mut encounter) => (
                (Utc::now() - encounter.started_at).num_seconds(),
                encounter.finish().is_ok(),
            ),
            Err(_) => (0, false),
        };
        if !finished {
            // Lost the race with the timeout guard, which already redirected
            warn!("Session closed before the end flow finished");
            return Ok(());
        }

        teardown(&self.shared);
        audit::log_session_end(
            &self.shared.session_id,
            &encounter_id,
            duration_secs,
            reports.len(),
            options.follow_up,
        );

        let destination = if options.follow_up {
            FOLLOW_UP_PATH
        } else {
            DASHBOARD_PATH
        };
        self.shared
            .collaborators
            .navigation
            .redirect(destination, RedirectReason::Completed);
        audit::log_redirect(
            &self.shared.session_id,
            destination,
            RedirectReason::Completed.as_str(),
        );
        self.shared.emit(SessionEvent::SessionEnded {
            destination: destination.to_string(),
        });
        Ok(())
    }

    /// Tear the session down without ending the visit (navigating away).
    ///
    /// Stops the countdown and pending autosave windows; dirty edits are
    /// left as they are.
    pub fn close(&self) {
        teardown(&self.shared);
        if let Ok(encounter) = self.shared.encounter.lock() {
            audit::log_session_closed(&self.shared.session_id, &encounter.id);
        }
    }

    fn ensure_active(&self) -> Result<(), SessionError> {
        let active = self
            .shared
            .encounter
            .lock()
            .map(|e| e.is_active())
            .unwrap_or(false);
        if active {
            Ok(())
        } else {
            Err(SessionError::NotActive)
        }
    }

    fn abort_end(&self, encounter_id: &str, stage: &str, error: &str) {
        if let Ok(mut encounter) = self.shared.encounter.lock() {
            if encounter.resume_active().is_err() {
                warn!("Could not return the session to active after a failed end");
            }
        }
        audit::log_session_end_failed(&self.shared.session_id, encounter_id, stage, error);
    }
}

impl Drop for ConsultationSession {
    fn drop(&mut self) {
        teardown(&self.shared);
    }
}

/// Non-empty field values, for PHI-safe logging
fn filled_field_count(fields: &BTreeMap<String, String>) -> usize {
    fields.values().filter(|v| !v.trim().is_empty()).count()
}

/// Record a successful persist: clear dirty, stamp the save time, and mark
/// the section complete once its required fields are all present. Returns
/// true if the section was newly marked.
///
/// `persisted` is the snapshot the backend accepted. If the store no longer
/// matches it, an edit landed while the save was in flight; the store stays
/// dirty so the newer value reaches the backend on its own schedule.
fn apply_save_success(
    shared: &SessionShared,
    section: SectionKind,
    persisted: &BTreeMap<String, String>,
    saved_at: DateTime<Utc>,
) -> bool {
    let required_present = match shared.stores.lock() {
        Ok(mut stores) => match stores.get_mut(&section) {
            Some(store) => {
                if store.snapshot() != *persisted {
                    return false;
                }
                store.mark_saved(saved_at);
                store.required_fields_present()
            }
            None => false,
        },
        Err(_) => false,
    };
    if !required_present {
        return false;
    }
    shared
        .navigator
        .lock()
        .map(|mut navigator| navigator.mark_section_complete(section))
        .unwrap_or(false)
}

/// Persist every dirty section concurrently; one section's failure never
/// blocks the others.
async fn save_dirty_sections(
    shared: &Arc<SessionShared>,
    trigger: SaveTrigger,
) -> Vec<SectionSaveReport> {
    let dirty: Vec<(SectionKind, BTreeMap<String, String>)> = match shared.stores.lock() {
        Ok(stores) => stores
            .iter()
            .filter(|(_, store)| store.is_dirty())
            .map(|(kind, store)| (*kind, store.snapshot()))
            .collect(),
        Err(_) => Vec::new(),
    };
    if dirty.is_empty() {
        return Vec::new();
    }

    // These writes supersede any pending autosave windows
    if let Ok(mut autosave) = shared.autosave.lock() {
        for (kind, _) in &dirty {
            autosave.cancel(*kind);
        }
    }

    let encounter_id = match shared.encounter.lock() {
        Ok(encounter) => encounter.id.clone(),
        Err(_) => return Vec::new(),
    };

    let saves = dirty.into_iter().map(|(kind, fields)| {
        let records = shared.collaborators.records.clone();
        let encounter_id = encounter_id.clone();
        async move {
            let field_count = filled_field_count(&fields);
            let result = records
                .create_record(&encounter_id, kind, fields.clone())
                .await;
            (kind, fields, field_count, result)
        }
    });

    let mut reports = Vec::new();
    let mut any_marked = false;
    for (kind, fields, field_count, result) in join_all(saves).await {
        match result {
            Ok(record) => {
                let saved_at = record.recorded_at.unwrap_or_else(Utc::now);
                any_marked |= apply_save_success(shared, kind, &fields, saved_at);
                audit::log_section_save(
                    &shared.session_id,
                    kind.as_str(),
                    trigger.as_str(),
                    field_count,
                    true,
                    None,
                );
                shared.emit(SessionEvent::SectionSaved {
                    section: kind,
                    trigger,
                });
                reports.push(SectionSaveReport {
                    section: kind,
                    result: Ok(()),
                });
            }
            Err(e) => {
                audit::log_section_save(
                    &shared.session_id,
                    kind.as_str(),
                    trigger.as_str(),
                    field_count,
                    false,
                    Some(&e.to_string()),
                );
                reports.push(SectionSaveReport {
                    section: kind,
                    result: Err(e),
                });
            }
        }
    }
    if any_marked {
        shared.emit_progress();
    }
    reports
}

/// Body of one debounced autosave, run by the scheduler after the quiet
/// period. Reads the store at fire time so the newest edits win.
async fn autosave_section(shared: Arc<SessionShared>, section: SectionKind) {
    // Skip silently if the session closed while the window was pending
    match shared.encounter.lock() {
        Ok(encounter) if encounter.is_active() => {}
        _ => return,
    }
    let snapshot = match shared.stores.lock() {
        Ok(stores) => match stores.get(&section) {
            Some(store) if store.is_dirty() => store.snapshot(),
            _ => return,
        },
        Err(_) => return,
    };
    let encounter_id = match shared.encounter.lock() {
        Ok(encounter) => encounter.id.clone(),
        Err(_) => return,
    };

    let field_count = filled_field_count(&snapshot);
    match shared
        .collaborators
        .records
        .create_record(&encounter_id, section, snapshot.clone())
        .await
    {
        Ok(record) => {
            let saved_at = record.recorded_at.unwrap_or_else(Utc::now);
            let newly_marked = apply_save_success(&shared, section, &snapshot, saved_at);
            audit::log_section_save(
                &shared.session_id,
                section.as_str(),
                SaveTrigger::Autosave.as_str(),
                field_count,
                true,
                None,
            );
            shared.emit(SessionEvent::SectionSaved {
                section,
                trigger: SaveTrigger::Autosave,
            });
            if newly_marked {
                shared.emit_progress();
            }
            if section == SectionKind::Vitals {
                shared.emit(SessionEvent::VitalsEvaluated {
                    report: vitals::report(&snapshot),
                });
            }
        }
        Err(e) => {
            // Logged only; the doctor keeps typing
            audit::log_section_save(
                &shared.session_id,
                section.as_str(),
                SaveTrigger::Autosave.as_str(),
                field_count,
                false,
                Some(&e.to_string()),
            );
            shared.emit(SessionEvent::AutosaveFailed {
                section,
                message: e.to_string(),
            });
        }
    }
}

/// Consume timer events until the budget expires or the timer is cancelled
async fn run_timeout_guard(
    shared: Arc<SessionShared>,
    mut timer_events: mpsc::UnboundedReceiver<TimerEvent>,
) {
    while let Some(event) = timer_events.recv().await {
        match event {
            TimerEvent::WarningReached { remaining_secs } => {
                audit::log_timer_warning(&shared.session_id, remaining_secs);
                shared.emit(SessionEvent::TimeoutWarning { remaining_secs });
            }
            TimerEvent::Expired => {
                handle_expiry(&shared).await;
                break;
            }
        }
    }
}

/// The timeout action: audit the unsaved work, attempt a best-effort save,
/// then force logout. The redirect happens regardless of save outcomes.
///
/// Runs at most once; the status transition guards re-entry.
async fn handle_expiry(shared: &Arc<SessionShared>) {
    let encounter_id = {
        let Ok(mut encounter) = shared.encounter.lock() else {
            return;
        };
        if encounter.time_out().is_err() {
            // Already closed by another path
            return;
        }
        encounter.id.clone()
    };

    let unsaved = match shared.stores.lock() {
        Ok(stores) => stores.values().filter(|store| store.is_dirty()).count(),
        Err(_) => 0,
    };
    audit::log_session_timeout(&shared.session_id, &encounter_id, unsaved);
    shared.emit(SessionEvent::SessionExpired {
        unsaved_sections: unsaved,
    });

    // Best effort; failures are logged by the save path and not retried
    let _ = save_dirty_sections(shared, SaveTrigger::Timeout).await;

    teardown(shared);

    shared
        .collaborators
        .navigation
        .redirect(LOGIN_PATH, RedirectReason::Timeout);
    audit::log_redirect(&shared.session_id, LOGIN_PATH, RedirectReason::Timeout.as_str());
}

/// Cancel the countdown and any pending autosave windows
fn teardown(shared: &SessionShared) {
    if let Ok(timer) = shared.timer.lock() {
        if let Some(handle) = timer.as_ref() {
            handle.cancel();
        }
    }
    if let Ok(mut autosave) = shared.autosave.lock() {
        autosave.cancel_all();
    }
}
