//! Audit Logging Module
//!
//! Provides structured audit logging for the consultation client.
//! IMPORTANT: This module must NEVER log PHI (Protected Health Information).
//!
//! What IS logged:
//! - Session IDs and visit IDs
//! - Section names, field counts, record counts
//! - Timestamps, durations, and timer state
//! - Event types and outcomes (success/failure)
//! - Error messages (sanitized)
//!
//! What is NOT logged:
//! - Clinical field content (notes, diagnoses, prescriptions, orders)
//! - Patient names or demographics
//! - Chief complaint text
//! - Patient history record content

use std::path::PathBuf;
use std::sync::OnceLock;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

/// Guard that must be held for the duration of the application
/// to ensure logs are flushed before exit
static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Initialize the audit logging system
///
/// Sets up dual logging:
/// - Console output (human-readable, for development)
/// - File output (JSON, for auditing and analysis)
///
/// Log files are stored in ~/.consultationapp/logs/
/// with daily rotation and retention
pub fn init_logging() -> Result<(), Box<dyn std::error::Error>> {
    let log_dir = get_log_directory()?;
    std::fs::create_dir_all(&log_dir)?;

    // Create rolling file appender (daily rotation)
    let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, "audit.log");

    // Non-blocking writer for file output
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // Store the guard to keep logging active
    LOG_GUARD.set(guard).ok();

    // File layer - JSON format for structured logging with explicit UTC timestamps
    let file_layer = fmt::layer()
        .json()
        .with_timer(UtcTime::rfc_3339())
        .with_writer(non_blocking)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    // Console layer - human-readable format
    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")));

    // Combine layers
    tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .init();

    info!(
        event = "logging_initialized",
        log_dir = %log_dir.display(),
        "Audit logging system initialized"
    );

    Ok(())
}

/// Get the log directory path
fn get_log_directory() -> Result<PathBuf, Box<dyn std::error::Error>> {
    let home = dirs::home_dir().ok_or("Could not determine home directory")?;
    Ok(home.join(".consultationapp").join("logs"))
}

// ============================================================================
// Session Lifecycle Events
// ============================================================================

/// Log session start
pub fn log_session_start(session_id: &str, encounter_id: &str, budget_secs: u64) {
    info!(
        event = "session_start",
        session_id = %session_id,
        encounter_id = %encounter_id,
        budget_secs = budget_secs,
        "Consultation session started"
    );
}

/// Log successful session end
pub fn log_session_end(
    session_id: &str,
    encounter_id: &str,
    duration_secs: i64,
    sections_saved: usize,
    follow_up: bool,
) {
    info!(
        event = "session_end",
        session_id = %session_id,
        encounter_id = %encounter_id,
        duration_secs = duration_secs,
        sections_saved = sections_saved,
        follow_up = follow_up,
        "Consultation session ended"
    );
}

/// Log an end-of-session attempt that did not complete
pub fn log_session_end_failed(session_id: &str, encounter_id: &str, stage: &str, error: &str) {
    warn!(
        event = "session_end_failed",
        session_id = %session_id,
        encounter_id = %encounter_id,
        stage = %stage,
        error = %error,
        "End of session aborted, session stays active"
    );
}

/// Log session timeout.
///
/// `unsaved_sections` is the number of sections that still had unsaved
/// edits when the budget ran out; it is the audit trail for potential
/// data loss.
pub fn log_session_timeout(session_id: &str, encounter_id: &str, unsaved_sections: usize) {
    warn!(
        event = "session_timeout",
        session_id = %session_id,
        encounter_id = %encounter_id,
        unsaved_sections = unsaved_sections,
        "Consultation session timed out"
    );
}

/// Log session teardown without ending the visit
pub fn log_session_closed(session_id: &str, encounter_id: &str) {
    info!(
        event = "session_closed",
        session_id = %session_id,
        encounter_id = %encounter_id,
        "Session closed without ending the visit"
    );
}

// ============================================================================
// Section & Save Events
// ============================================================================

/// Log section record load at session start
pub fn log_section_load(
    session_id: &str,
    section: &str,
    record_count: usize,
    success: bool,
    error: Option<&str>,
) {
    if success {
        info!(
            event = "section_load",
            session_id = %session_id,
            section = %section,
            record_count = record_count,
            success = true,
            "Section records loaded"
        );
    } else {
        warn!(
            event = "section_load",
            session_id = %session_id,
            section = %section,
            success = false,
            error = error,
            "Section record load failed, starting empty"
        );
    }
}

/// Log a section save (without content)
pub fn log_section_save(
    session_id: &str,
    section: &str,
    trigger: &str, // "manual", "autosave", "save_all", "timeout"
    field_count: usize,
    success: bool,
    error: Option<&str>,
) {
    if success {
        info!(
            event = "section_save",
            session_id = %session_id,
            section = %section,
            trigger = %trigger,
            field_count = field_count,
            success = true,
            "Section saved"
        );
    } else {
        warn!(
            event = "section_save",
            session_id = %session_id,
            section = %section,
            trigger = %trigger,
            field_count = field_count,
            success = false,
            error = error,
            "Section save failed"
        );
    }
}

/// Log a manual save rejected by required-field validation
pub fn log_validation_rejected(session_id: &str, section: &str, missing_count: usize) {
    warn!(
        event = "validation_rejected",
        session_id = %session_id,
        section = %section,
        missing_count = missing_count,
        "Save rejected, required fields missing"
    );
}

// ============================================================================
// Timer Events
// ============================================================================

/// Log the five-minute warning
pub fn log_timer_warning(session_id: &str, remaining_secs: u64) {
    warn!(
        event = "timer_warning",
        session_id = %session_id,
        remaining_secs = remaining_secs,
        "Session nearing time budget"
    );
}

/// Log a timer extension
pub fn log_timer_extended(session_id: &str, remaining_secs: u64) {
    info!(
        event = "timer_extended",
        session_id = %session_id,
        remaining_secs = remaining_secs,
        "Session timer extended"
    );
}

// ============================================================================
// History & Summary Events
// ============================================================================

/// Log patient history load and ranking (without content)
pub fn log_history_loaded(
    session_id: &str,
    record_count: usize,
    success: bool,
    error: Option<&str>,
) {
    if success {
        info!(
            event = "history_loaded",
            session_id = %session_id,
            record_count = record_count,
            success = true,
            "Patient history loaded and ranked"
        );
    } else {
        warn!(
            event = "history_loaded",
            session_id = %session_id,
            success = false,
            error = error,
            "Patient history load failed"
        );
    }
}

/// Log summary document generation (without content)
pub fn log_summary_generation(
    session_id: &str,
    encounter_id: &str,
    document_id: Option<&str>,
    success: bool,
    error: Option<&str>,
) {
    if success {
        info!(
            event = "summary_generation",
            session_id = %session_id,
            encounter_id = %encounter_id,
            document_id = document_id,
            success = true,
            "Consultation summary generated"
        );
    } else {
        warn!(
            event = "summary_generation",
            session_id = %session_id,
            encounter_id = %encounter_id,
            success = false,
            error = error,
            "Consultation summary generation failed"
        );
    }
}

// ============================================================================
// Navigation Events
// ============================================================================

/// Log a forced page change
pub fn log_redirect(session_id: &str, path: &str, reason: &str) {
    info!(
        event = "redirect",
        session_id = %session_id,
        path = %path,
        reason = %reason,
        "Redirecting after session close"
    );
}
