//! Consultation session core
//!
//! Client-side state machine for one doctor-patient consultation in the
//! clinic EMR: per-section form stores, debounced autosave, relevance
//! ranking of the patient's history, the session countdown with its
//! timeout guard, tab navigation, and the lifecycle controller that ties
//! them to the EMR backend.

pub mod audit;
pub mod autosave;
pub mod config;
pub mod encounter;
pub mod navigator;
pub mod providers;
pub mod ranking;
pub mod rest;
pub mod section;
pub mod session;
pub mod timer;
pub mod vitals;
