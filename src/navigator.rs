//! Tab/Progress Navigator
//!
//! Tracks the active clinical tab and which documentation sections are
//! complete. Switching to the vitals tab marks it visited; every other
//! section is marked by its own store on a successful save with all
//! required fields present.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::section::SectionKind;

/// Completion flags over the documentation sections
#[derive(Debug, Clone)]
pub struct Progress {
    flags: BTreeMap<SectionKind, bool>,
}

/// Serializable progress view for events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub sections: BTreeMap<SectionKind, bool>,
    pub completed: usize,
    pub total: usize,
    pub percent: u8,
}

/// Rounded completion percentage
pub fn progress_percent(completed: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    ((completed as f64 / total as f64) * 100.0).round() as u8
}

impl Progress {
    pub fn new() -> Self {
        let flags = SectionKind::EDITABLE
            .iter()
            .map(|kind| (*kind, false))
            .collect();
        Self { flags }
    }

    pub fn is_complete(&self, kind: SectionKind) -> bool {
        self.flags.get(&kind).copied().unwrap_or(false)
    }

    /// Mark a documentation section complete. Returns true if the flag was
    /// newly set; the read-only history tab is ignored.
    pub fn mark_complete(&mut self, kind: SectionKind) -> bool {
        match self.flags.get_mut(&kind) {
            Some(flag) if !*flag => {
                *flag = true;
                debug!("Section {} marked complete", kind.as_str());
                true
            }
            _ => false,
        }
    }

    pub fn completed_count(&self) -> usize {
        self.flags.values().filter(|set| **set).count()
    }

    pub fn total(&self) -> usize {
        self.flags.len()
    }

    pub fn percent(&self) -> u8 {
        progress_percent(self.completed_count(), self.total())
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            sections: self.flags.clone(),
            completed: self.completed_count(),
            total: self.total(),
            percent: self.percent(),
        }
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::new()
    }
}

/// Active-tab state plus completion tracking for one session
#[derive(Debug, Clone)]
pub struct SectionNavigator {
    active: SectionKind,
    progress: Progress,
}

impl SectionNavigator {
    pub fn new() -> Self {
        Self {
            active: SectionKind::Notes,
            progress: Progress::new(),
        }
    }

    pub fn active(&self) -> SectionKind {
        self.active
    }

    /// Change the active tab, returning true if the visit newly marked a
    /// section complete.
    ///
    /// Visiting vitals marks it complete; no other section auto-marks on
    /// visit.
    pub fn switch_to(&mut self, kind: SectionKind) -> bool {
        self.active = kind;
        kind == SectionKind::Vitals && self.progress.mark_complete(SectionKind::Vitals)
    }

    pub fn mark_section_complete(&mut self, kind: SectionKind) -> bool {
        self.progress.mark_complete(kind)
    }

    pub fn progress(&self) -> &Progress {
        &self.progress
    }
}

impl Default for SectionNavigator {
    fn default() -> Self {
        Self::new()
    }
}

/// Action resolved from a keyboard shortcut
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShortcutAction {
    SwitchTo(SectionKind),
    Save,
}

/// Map a key press to a navigator action.
///
/// Alt+1..Alt+7 select the tabs in display order; Ctrl+S saves. Tab
/// shortcuts are suppressed while focus is in a text-entry field so typing
/// is never hijacked; the save shortcut fires regardless of focus.
pub fn resolve_shortcut(
    key: &str,
    alt: bool,
    ctrl: bool,
    in_text_field: bool,
) -> Option<ShortcutAction> {
    if ctrl && key.eq_ignore_ascii_case("s") {
        return Some(ShortcutAction::Save);
    }
    if in_text_field || !alt || ctrl {
        return None;
    }
    let index = match key {
        "1" => 0,
        "2" => 1,
        "3" => 2,
        "4" => 3,
        "5" => 4,
        "6" => 5,
        "7" => 6,
        _ => return None,
    };
    Some(ShortcutAction::SwitchTo(SectionKind::ALL[index]))
}
